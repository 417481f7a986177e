//! Session registry: one live connection per resource id.
//!
//! Each id has its own slot behind a tokio mutex, so ids never contend with
//! each other. Inbound events for one id are handled by a single listener
//! task in arrival order. Outbound sends happen after the slot lock is
//! released.
//!
//! Deferred teardown carries the slot generation it was scheduled at. Every
//! registration bumps the generation, which turns an older timer into a no-op.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::{
    DEFAULT_SYSTEM_SENDER, DeviceAuthorization, InboundMessage, LiveConnection, LiveConnector,
    SessionError, SessionEvent,
};
use crate::extractor::{CodeExtractor, DigitCodeExtractor};
use crate::model::{ResourceId, ResourceRecord, UserId, mask_identifier};
use crate::notify::{DEVICE_PROMPT, Notification, Notifier, alert_admins};
use crate::store::{ResourcePool, StoreError};

/// Grace window between buyer delivery and teardown.
pub const DEFAULT_TEARDOWN_AFTER: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub teardown_after: Duration,
    /// Only messages from this sender are scanned for codes.
    pub system_sender: i64,
    /// Recipients of diagnostics alerts.
    pub admin_ids: Vec<UserId>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            teardown_after: DEFAULT_TEARDOWN_AFTER,
            system_sender: DEFAULT_SYSTEM_SENDER,
            admin_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    TornDown,
}

/// Diagnostics view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub resource_id: ResourceId,
    pub state: SessionState,
    pub buyer: Option<UserId>,
    pub admin_monitor: Option<UserId>,
    pub generation: u64,
    pub teardown_scheduled: bool,
}

#[derive(Debug, Clone)]
struct BuyerRegistration {
    user_id: UserId,
    display_name: Option<String>,
}

struct SessionSlot {
    record: ResourceRecord,
    state: SessionState,
    connection: Option<Arc<dyn LiveConnection>>,
    listener: Option<JoinHandle<()>>,
    buyer: Option<BuyerRegistration>,
    monitor: Option<UserId>,
    generation: u64,
    teardown: Option<JoinHandle<()>>,
}

impl SessionSlot {
    fn new(record: ResourceRecord) -> Self {
        Self {
            record,
            state: SessionState::Disconnected,
            connection: None,
            listener: None,
            buyer: None,
            monitor: None,
            generation: 0,
            teardown: None,
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            resource_id: self.record.id,
            state: self.state,
            buyer: self.buyer.as_ref().map(|b| b.user_id),
            admin_monitor: self.monitor,
            generation: self.generation,
            teardown_scheduled: self.teardown.is_some(),
        }
    }
}

/// Why a session is being torn down.
enum Teardown {
    Explicit,
    /// Grace window elapsed; ignored if the generation moved on.
    GraceExpired { generation: u64 },
    /// The listener saw its connection end; ignored if a newer connection replaced it.
    Terminated { connection: Arc<dyn LiveConnection> },
    /// The session logged itself out; ignored if a newer connection replaced it.
    LoggedOut { connection: Arc<dyn LiveConnection> },
}

/// Routing decided under the slot lock, executed after it is released.
struct Deliveries {
    record: ResourceRecord,
    buyer: Option<(BuyerRegistration, String)>,
    monitor: Option<UserId>,
}

pub struct SessionRegistry {
    connector: Arc<dyn LiveConnector>,
    notifier: Arc<dyn Notifier>,
    resources: Arc<dyn ResourcePool>,
    buyer_codes: Arc<dyn CodeExtractor>,
    monitor_codes: Arc<dyn CodeExtractor>,
    config: RegistryConfig,
    slots: DashMap<ResourceId, Arc<Mutex<SessionSlot>>>,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn LiveConnector>,
        notifier: Arc<dyn Notifier>,
        resources: Arc<dyn ResourcePool>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            connector,
            notifier,
            resources,
            buyer_codes: Arc::new(DigitCodeExtractor::buyer()),
            monitor_codes: Arc::new(DigitCodeExtractor::monitor()),
            config,
            slots: DashMap::new(),
        }
    }

    pub fn with_extractors(
        mut self,
        buyer: Arc<dyn CodeExtractor>,
        monitor: Arc<dyn CodeExtractor>,
    ) -> Self {
        self.buyer_codes = buyer;
        self.monitor_codes = monitor;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Number of sessions currently held (connecting or connected).
    pub fn live_sessions(&self) -> usize {
        self.slots.len()
    }

    /// Connect if needed and register `buyer` for one code delivery.
    pub async fn ensure_connected_for_buyer(
        self: &Arc<Self>,
        record: &ResourceRecord,
        buyer: UserId,
        display_name: Option<String>,
    ) -> Result<(), SessionError> {
        let registration = BuyerRegistration {
            user_id: buyer,
            display_name,
        };
        self.ensure_connected(record, move |slot| slot.buyer = Some(registration))
            .await?;
        tracing::info!(resource_id = %record.id, user_id = buyer, "Buyer registered for code delivery");
        Ok(())
    }

    /// Connect if needed and make `admin` the monitor, replacing any previous one.
    pub async fn ensure_connected_for_admin_monitor(
        self: &Arc<Self>,
        record: &ResourceRecord,
        admin: UserId,
    ) -> Result<(), SessionError> {
        self.ensure_connected(record, move |slot| slot.monitor = Some(admin))
            .await?;
        tracing::info!(resource_id = %record.id, admin_id = admin, "Admin monitor registered");
        Ok(())
    }

    /// Clear the admin monitor. The connection and any buyer stay as they are.
    ///
    /// A session left with neither registration goes back on the grace timer.
    pub async fn stop_admin_monitor(self: &Arc<Self>, id: ResourceId) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut guard = slot.lock().await;
        if guard.monitor.take().is_none() {
            return false;
        }
        if guard.state == SessionState::Connected
            && guard.buyer.is_none()
            && guard.teardown.is_none()
        {
            let generation = guard.generation;
            guard.teardown = Some(self.schedule_teardown(id, generation));
            tracing::debug!(resource_id = %id, "Idle session scheduled for teardown");
        }
        true
    }

    /// Clear both registrations and close the connection. Idempotent.
    pub async fn disconnect(&self, id: ResourceId) -> bool {
        self.tear_down(id, Teardown::Explicit).await
    }

    /// Device authorizations on the account behind the live session for `id`.
    pub async fn list_devices(
        &self,
        id: ResourceId,
    ) -> Result<Vec<DeviceAuthorization>, SessionError> {
        let connection = self.live_connection(id).await?;
        connection.list_devices().await
    }

    /// Log one device out of the account behind the live session for `id`.
    pub async fn reset_device(&self, id: ResourceId, hash: i64) -> Result<(), SessionError> {
        let connection = self.live_connection(id).await?;
        connection.reset_device(hash).await
    }

    /// Log the session itself out of its account and tear it down.
    pub async fn log_out(&self, id: ResourceId) -> Result<(), SessionError> {
        let connection = self.live_connection(id).await?;
        connection.log_out().await?;
        tracing::info!(resource_id = %id, "Session logged out of its account");
        self.tear_down(id, Teardown::LoggedOut { connection }).await;
        Ok(())
    }

    /// The connection for `id`, cloned out so remote calls run without the slot lock.
    async fn live_connection(
        &self,
        id: ResourceId,
    ) -> Result<Arc<dyn LiveConnection>, SessionError> {
        let slot = self.slot(id).ok_or(SessionError::Closed)?;
        let guard = slot.lock().await;
        match guard.connection {
            Some(ref connection) if guard.state == SessionState::Connected => {
                Ok(connection.clone())
            }
            _ => Err(SessionError::Closed),
        }
    }

    pub async fn session_status(&self, id: ResourceId) -> Option<SessionStatus> {
        let slot = self.slot(id)?;
        let guard = slot.lock().await;
        Some(guard.status())
    }

    /// Disconnect every session.
    pub async fn shutdown(&self) {
        let ids: Vec<ResourceId> = self.slots.iter().map(|e| *e.key()).collect();
        futures::future::join_all(ids.into_iter().map(|id| self.disconnect(id))).await;
    }

    /// Route one inbound message for `id`.
    pub async fn handle_inbound(self: &Arc<Self>, id: ResourceId, message: InboundMessage) {
        if message.sender != self.config.system_sender {
            tracing::trace!(resource_id = %id, sender = message.sender, "Ignoring non-system message");
            return;
        }
        let Some(slot) = self.slot(id) else {
            return;
        };

        let deliveries = {
            let mut guard = slot.lock().await;
            if guard.state != SessionState::Connected {
                return;
            }

            let buyer = match self.buyer_codes.extract(&message.text) {
                Some(code) => guard.buyer.take().map(|b| (b, code)),
                None => None,
            };
            let monitor = guard
                .monitor
                .filter(|_| self.monitor_codes.extract(&message.text).is_some());

            if buyer.is_some() {
                let generation = guard.generation;
                if let Some(previous) = guard.teardown.take() {
                    previous.abort();
                }
                guard.teardown = Some(self.schedule_teardown(id, generation));
            }

            if buyer.is_none() && monitor.is_none() {
                tracing::debug!(resource_id = %id, "Service notice without a deliverable code");
                return;
            }

            Deliveries {
                record: guard.record.clone(),
                buyer,
                monitor,
            }
        };

        self.deliver(deliveries, &message.text).await;
    }

    async fn deliver(&self, deliveries: Deliveries, text: &str) {
        let Deliveries {
            record,
            buyer,
            monitor,
        } = deliveries;

        if let Some(admin_id) = monitor {
            let forward = Notification::MonitorForward {
                admin_id,
                resource_id: record.id,
                identifier: record.identifier.clone(),
                text: text.to_string(),
            };
            if let Err(e) = self.notifier.notify(forward).await {
                tracing::warn!(resource_id = %record.id, admin_id, error = %e, "Failed to forward to monitor");
            }
        }

        let Some((buyer, code)) = buyer else {
            return;
        };

        let delivery = Notification::BuyerDelivery {
            user_id: buyer.user_id,
            resource_id: record.id,
            identifier: record.identifier.clone(),
            code,
            text: text.to_string(),
            prompt: DEVICE_PROMPT.to_string(),
        };
        match self.notifier.notify(delivery).await {
            Ok(()) => {
                tracing::info!(resource_id = %record.id, user_id = buyer.user_id, "Code delivered to buyer");
            }
            Err(e) => {
                tracing::error!(resource_id = %record.id, user_id = buyer.user_id, error = %e, "Failed to deliver code to buyer");
                alert_admins(
                    self.notifier.as_ref(),
                    &self.config.admin_ids,
                    Some(record.id),
                    &format!(
                        "Code delivery to buyer {} failed for {}: {e}",
                        buyer.user_id,
                        mask_identifier(&record.identifier)
                    ),
                )
                .await;
            }
        }

        self.report_sold(&record, &buyer).await;
    }

    /// Emit the sold report, once per resource across restarts.
    async fn report_sold(&self, record: &ResourceRecord, buyer: &BuyerRegistration) {
        match self.resources.mark_sold_reported(record.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(resource_id = %record.id, "Sold report already sent");
                return;
            }
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(resource_id = %record.id, "Resource deleted before sold report");
                return;
            }
            Err(e) => {
                tracing::error!(resource_id = %record.id, error = %e, "Failed to flag sold report");
                return;
            }
        }

        let report = Notification::SoldReport {
            resource_id: record.id,
            category: record.category_label(),
            masked_identifier: mask_identifier(&record.identifier),
            price: record.price,
            buyer_id: Some(buyer.user_id),
            buyer_name: buyer
                .display_name
                .clone()
                .or_else(|| record.owner_name.clone()),
        };
        if let Err(e) = self.notifier.notify(report).await {
            tracing::warn!(resource_id = %record.id, error = %e, "Failed to send sold report");
        }
    }

    fn slot(&self, id: ResourceId) -> Option<Arc<Mutex<SessionSlot>>> {
        self.slots.get(&id).map(|s| s.value().clone())
    }

    async fn ensure_connected<F>(self: &Arc<Self>, record: &ResourceRecord, register: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut SessionSlot),
    {
        let id = record.id;
        let slot = self
            .slots
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(SessionSlot::new(record.clone()))))
            .value()
            .clone();

        let mut guard = slot.lock().await;
        guard.generation += 1;
        if let Some(teardown) = guard.teardown.take() {
            teardown.abort();
        }
        guard.record = record.clone();

        if guard.state != SessionState::Connected {
            guard.state = SessionState::Connecting;
            match self.connector.connect(record).await {
                Ok(live) => {
                    let connection: Arc<dyn LiveConnection> = Arc::from(live.connection);
                    guard.listener = Some(self.spawn_listener(id, connection.clone(), live.events));
                    guard.connection = Some(connection);
                    guard.state = SessionState::Connected;
                    tracing::info!(resource_id = %id, "Session connected");
                }
                Err(e) => {
                    guard.state = SessionState::Disconnected;
                    drop(guard);
                    drop(slot);
                    self.forget_if_idle(id);
                    tracing::warn!(resource_id = %id, error = %e, "Session connect failed");
                    return Err(e);
                }
            }
        }

        register(&mut guard);
        Ok(())
    }

    fn spawn_listener(
        self: &Arc<Self>,
        id: ResourceId,
        connection: Arc<dyn LiveConnection>,
        mut events: mpsc::Receiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = loop {
                match events.recv().await {
                    Some(SessionEvent::Message(message)) => {
                        let Some(registry) = registry.upgrade() else {
                            return;
                        };
                        registry.handle_inbound(id, message).await;
                    }
                    Some(SessionEvent::Terminated(error)) => break error,
                    None => break SessionError::Closed,
                }
            };
            if let Some(registry) = registry.upgrade() {
                registry.on_terminated(id, connection, reason).await;
            }
        })
    }

    async fn on_terminated(&self, id: ResourceId, connection: Arc<dyn LiveConnection>, error: SessionError) {
        let torn_down = self.tear_down(id, Teardown::Terminated { connection }).await;
        if error.is_terminal() {
            tracing::warn!(resource_id = %id, error = %error, "Session ended by a terminal error");
            alert_admins(
                self.notifier.as_ref(),
                &self.config.admin_ids,
                Some(id),
                &format!("Session for resource {id} ended: {error}"),
            )
            .await;
        } else if torn_down {
            tracing::warn!(resource_id = %id, error = %error, "Session closed by the remote side");
        }
    }

    fn schedule_teardown(self: &Arc<Self>, id: ResourceId, generation: u64) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let after = self.config.teardown_after;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(registry) = registry.upgrade() {
                registry.tear_down(id, Teardown::GraceExpired { generation }).await;
            }
        })
    }

    /// Close the session for `id`. Runs the disconnect under the slot lock so
    /// a reconnect for the same id cannot overlap it.
    async fn tear_down(&self, id: ResourceId, reason: Teardown) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };

        let torn_down = {
            let mut guard = slot.lock().await;
            match &reason {
                Teardown::GraceExpired { generation } if guard.generation != *generation => {
                    tracing::debug!(resource_id = %id, "Stale teardown ignored");
                    return false;
                }
                Teardown::Terminated { connection } | Teardown::LoggedOut { connection }
                    if !guard
                        .connection
                        .as_ref()
                        .is_some_and(|current| Arc::ptr_eq(current, connection)) =>
                {
                    return false;
                }
                _ => {}
            }

            guard.buyer = None;
            guard.monitor = None;
            guard.generation += 1;

            // The task running this teardown must not abort itself.
            let teardown = guard.teardown.take();
            let listener = guard.listener.take();
            if !matches!(reason, Teardown::GraceExpired { .. })
                && let Some(teardown) = teardown
            {
                teardown.abort();
            }
            if !matches!(reason, Teardown::Terminated { .. })
                && let Some(listener) = listener
            {
                listener.abort();
            }

            let connection = guard.connection.take();
            guard.state = SessionState::TornDown;
            match connection {
                Some(connection) => {
                    if let Err(e) = connection.disconnect().await {
                        tracing::warn!(resource_id = %id, error = %e, "Disconnect failed");
                    }
                    true
                }
                None => false,
            }
        };

        drop(slot);
        self.forget_if_idle(id);
        if torn_down {
            tracing::info!(resource_id = %id, "Session torn down");
        }
        torn_down
    }

    /// Drop a slot nobody else is holding and that has no connection.
    fn forget_if_idle(&self, id: ResourceId) {
        self.slots.remove_if(&id, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot
                    .try_lock()
                    .is_ok_and(|guard| guard.state != SessionState::Connected)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::new_resource;
    use crate::model::Claim;
    use crate::notify::testing::RecordingNotifier;
    use crate::session::testing::{MockConnector, device};
    use crate::store::MemoryStore;

    const SYSTEM: i64 = DEFAULT_SYSTEM_SENDER;

    struct Harness {
        registry: Arc<SessionRegistry>,
        connector: Arc<MockConnector>,
        notifier: Arc<RecordingNotifier>,
        store: Arc<MemoryStore>,
    }

    fn harness_with(teardown_after: Duration) -> Harness {
        let connector = MockConnector::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new(
            connector.connector(),
            notifier.clone(),
            store.clone(),
            RegistryConfig {
                teardown_after,
                admin_ids: vec![900],
                ..Default::default()
            },
        ));
        Harness {
            registry,
            connector,
            notifier,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(Duration::from_secs(600))
    }

    async fn sold_record(store: &MemoryStore, buyer: UserId) -> ResourceRecord {
        let record = store
            .insert(new_resource("919876543244", "India", "2019", Some(50)))
            .await
            .unwrap();
        store
            .claim_by_id(record.id, &Claim::new(buyer, Some("alice".to_string())))
            .await
            .unwrap()
            .unwrap()
    }

    /// Wait until the listener has processed everything queued so far.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn buyer_deliveries(notifier: &RecordingNotifier) -> Vec<(UserId, String)> {
        notifier
            .sent()
            .into_iter()
            .filter_map(|n| match n {
                Notification::BuyerDelivery { user_id, code, .. } => Some((user_id, code)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn buyer_receives_code_once() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_buyer(&record, 42, Some("alice".into()))
            .await
            .unwrap();

        h.connector.message(record.id, SYSTEM, "Login code: 12345").await;
        h.connector.message(record.id, SYSTEM, "Login code: 67890").await;
        settle().await;

        assert_eq!(buyer_deliveries(&h.notifier), vec![(42, "12345".to_string())]);
        let status = h.registry.session_status(record.id).await.unwrap();
        assert_eq!(status.buyer, None);
        assert!(status.teardown_scheduled);
    }

    #[tokio::test]
    async fn non_system_senders_and_notices_are_ignored() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();

        h.connector.message(record.id, 12345, "Login code: 12345").await;
        h.connector
            .message(record.id, SYSTEM, "Two-step verification was enabled")
            .await;
        settle().await;

        assert!(h.notifier.sent().is_empty());
        let status = h.registry.session_status(record.id).await.unwrap();
        assert_eq!(status.buyer, Some(42));
    }

    #[tokio::test]
    async fn monitor_and_buyer_scenario() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_admin_monitor(&record, 7)
            .await
            .unwrap();
        h.registry
            .ensure_connected_for_buyer(&record, 42, Some("alice".into()))
            .await
            .unwrap();
        assert_eq!(h.connector.connects(), 1);

        h.connector.message(record.id, SYSTEM, "Code 54321").await;
        settle().await;
        assert_eq!(h.notifier.count("buyer_delivery"), 1);
        assert_eq!(h.notifier.count("monitor_forward"), 1);

        h.connector.message(record.id, SYSTEM, "Code 54321").await;
        settle().await;
        assert_eq!(h.notifier.count("buyer_delivery"), 1);
        assert_eq!(h.notifier.count("monitor_forward"), 2);

        let forwarded: Vec<String> = h
            .notifier
            .sent()
            .into_iter()
            .filter_map(|n| match n {
                Notification::MonitorForward { admin_id: 7, text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(forwarded, vec!["Code 54321".to_string(), "Code 54321".to_string()]);
    }

    #[tokio::test]
    async fn monitor_who_is_also_the_buyer_gets_both_messages() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_admin_monitor(&record, 42)
            .await
            .unwrap();
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();

        h.connector.message(record.id, SYSTEM, "Code 54321").await;
        settle().await;

        assert_eq!(buyer_deliveries(&h.notifier), vec![(42, "54321".to_string())]);
        let forwards: Vec<UserId> = h
            .notifier
            .sent()
            .into_iter()
            .filter_map(|n| match n {
                Notification::MonitorForward { admin_id, .. } => Some(admin_id),
                _ => None,
            })
            .collect();
        assert_eq!(forwards, vec![42]);
    }

    #[tokio::test]
    async fn monitor_only_forwards_five_digit_codes() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_admin_monitor(&record, 7)
            .await
            .unwrap();

        h.connector.message(record.id, SYSTEM, "Code 123456").await;
        h.connector.message(record.id, SYSTEM, "Code 12345").await;
        settle().await;

        assert_eq!(h.notifier.count("monitor_forward"), 1);
        assert_eq!(h.notifier.count("sold_report"), 0);
    }

    #[tokio::test]
    async fn buyer_accepts_six_digit_fallback() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();

        h.connector.message(record.id, SYSTEM, "Your code is 123456").await;
        settle().await;
        assert_eq!(buyer_deliveries(&h.notifier), vec![(42, "123456".to_string())]);
    }

    #[tokio::test]
    async fn custom_extractors_change_precedence() {
        let h = harness();
        let registry = Arc::new(
            SessionRegistry::new(
                h.connector.connector(),
                h.notifier.clone(),
                h.store.clone(),
                RegistryConfig::default(),
            )
            .with_extractors(
                Arc::new(DigitCodeExtractor::new(vec![4])),
                Arc::new(DigitCodeExtractor::new(vec![4])),
            ),
        );
        let record = sold_record(&h.store, 42).await;
        registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();

        h.connector.message(record.id, SYSTEM, "Code 12345 or 9876").await;
        settle().await;
        assert_eq!(buyer_deliveries(&h.notifier), vec![(42, "9876".to_string())]);
    }

    #[tokio::test]
    async fn sold_report_is_sent_exactly_once() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;

        h.registry
            .ensure_connected_for_buyer(&record, 42, Some("alice".into()))
            .await
            .unwrap();
        h.connector.message(record.id, SYSTEM, "Code 11111").await;
        settle().await;

        // Re-registering the buyer (e.g. a retry) must not produce a second report.
        h.registry
            .ensure_connected_for_buyer(&record, 42, Some("alice".into()))
            .await
            .unwrap();
        h.connector.message(record.id, SYSTEM, "Code 22222").await;
        settle().await;

        assert_eq!(h.notifier.count("buyer_delivery"), 2);
        assert_eq!(h.notifier.count("sold_report"), 1);
        let report = h
            .notifier
            .sent()
            .into_iter()
            .find(|n| n.kind() == "sold_report")
            .unwrap();
        assert_eq!(
            report,
            Notification::SoldReport {
                resource_id: record.id,
                category: "India · 2019".to_string(),
                masked_identifier: "+91••••••••44".to_string(),
                price: Some(50),
                buyer_id: Some(42),
                buyer_name: Some("alice".to_string()),
            }
        );
        assert!(h.store.get(record.id).await.unwrap().unwrap().sold_reported);
    }

    #[tokio::test]
    async fn deleted_resource_skips_sold_report() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();
        h.store.delete(record.id).await.unwrap();

        h.connector.message(record.id, SYSTEM, "Code 11111").await;
        settle().await;

        assert_eq!(h.notifier.count("buyer_delivery"), 1);
        assert_eq!(h.notifier.count("sold_report"), 0);
    }

    #[tokio::test]
    async fn failed_delivery_does_not_break_routing() {
        let connector = MockConnector::new();
        let notifier = Arc::new(RecordingNotifier::failing());
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new(
            connector.connector(),
            notifier.clone(),
            store.clone(),
            RegistryConfig {
                admin_ids: vec![900],
                ..Default::default()
            },
        ));
        let record = sold_record(&store, 42).await;
        registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();

        connector.message(record.id, SYSTEM, "Code 11111").await;
        settle().await;

        assert_eq!(notifier.count("buyer_delivery"), 1);
        assert_eq!(notifier.count("admin_alert"), 1);
        assert_eq!(notifier.count("sold_report"), 1);
    }

    #[tokio::test]
    async fn teardown_fires_after_grace_window() {
        let h = harness_with(Duration::from_millis(50));
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();

        h.connector.message(record.id, SYSTEM, "Code 11111").await;
        settle().await;
        assert!(h.connector.is_connected(record.id));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!h.connector.is_connected(record.id));
        assert_eq!(h.connector.disconnects(), 1);
        assert!(h.registry.session_status(record.id).await.is_none());
        assert_eq!(h.registry.live_sessions(), 0);
    }

    #[tokio::test]
    async fn reregistration_cancels_stale_teardown() {
        let h = harness_with(Duration::from_millis(80));
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();
        h.connector.message(record.id, SYSTEM, "Code 11111").await;
        settle().await;

        // Admin starts monitoring inside the grace window.
        h.registry
            .ensure_connected_for_admin_monitor(&record, 7)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.connector.is_connected(record.id));
        assert_eq!(h.connector.disconnects(), 0);
        let status = h.registry.session_status(record.id).await.unwrap();
        assert_eq!(status.state, SessionState::Connected);
        assert_eq!(status.admin_monitor, Some(7));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();

        assert!(h.registry.disconnect(record.id).await);
        assert!(!h.registry.disconnect(record.id).await);
        assert_eq!(h.connector.disconnects(), 1);
        assert_eq!(h.registry.live_sessions(), 0);
    }

    #[tokio::test]
    async fn reconnect_after_disconnect_gets_fresh_listener() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();
        h.registry.disconnect(record.id).await;

        h.registry
            .ensure_connected_for_buyer(&record, 43, None)
            .await
            .unwrap();
        h.connector.message(record.id, SYSTEM, "Code 11111").await;
        settle().await;

        assert_eq!(h.connector.connects(), 2);
        assert_eq!(buyer_deliveries(&h.notifier), vec![(43, "11111".to_string())]);
    }

    #[tokio::test]
    async fn stop_admin_monitor_keeps_buyer() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_admin_monitor(&record, 7)
            .await
            .unwrap();
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();

        assert!(h.registry.stop_admin_monitor(record.id).await);
        assert!(!h.registry.stop_admin_monitor(record.id).await);

        h.connector.message(record.id, SYSTEM, "Code 11111").await;
        settle().await;
        assert_eq!(h.notifier.count("monitor_forward"), 0);
        assert_eq!(h.notifier.count("buyer_delivery"), 1);
    }

    #[tokio::test]
    async fn stopping_last_monitor_rearms_teardown() {
        let h = harness_with(Duration::from_millis(60));
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();
        h.connector.message(record.id, SYSTEM, "Code 11111").await;
        settle().await;

        // Monitoring inside the grace window cancels the pending teardown.
        h.registry
            .ensure_connected_for_admin_monitor(&record, 7)
            .await
            .unwrap();
        let status = h.registry.session_status(record.id).await.unwrap();
        assert!(!status.teardown_scheduled);

        assert!(h.registry.stop_admin_monitor(record.id).await);
        let status = h.registry.session_status(record.id).await.unwrap();
        assert!(status.teardown_scheduled);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!h.connector.is_connected(record.id));
        assert_eq!(h.connector.disconnects(), 1);
        assert_eq!(h.registry.live_sessions(), 0);
    }

    #[tokio::test]
    async fn stopping_monitor_leaves_waiting_buyer_connected() {
        let h = harness_with(Duration::from_millis(40));
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_admin_monitor(&record, 7)
            .await
            .unwrap();
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();

        assert!(h.registry.stop_admin_monitor(record.id).await);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(h.connector.is_connected(record.id));
        let status = h.registry.session_status(record.id).await.unwrap();
        assert_eq!(status.buyer, Some(42));
        assert!(!status.teardown_scheduled);
    }

    #[tokio::test]
    async fn device_management_needs_a_live_session() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        assert_eq!(h.registry.list_devices(record.id).await.unwrap_err(), SessionError::Closed);
        assert_eq!(h.registry.reset_device(record.id, 5).await.unwrap_err(), SessionError::Closed);
        assert_eq!(h.registry.log_out(record.id).await.unwrap_err(), SessionError::Closed);
        assert_eq!(h.connector.connects(), 0);
    }

    #[tokio::test]
    async fn devices_can_be_listed_and_reset_in_grace_window() {
        let h = harness();
        h.connector.set_devices(vec![
            device(0, "credmart", true),
            device(-31, "Pixel 8", false),
        ]);
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();
        h.connector.message(record.id, SYSTEM, "Code 11111").await;
        settle().await;

        let devices = h.registry.list_devices(record.id).await.unwrap();
        assert_eq!(devices.len(), 2);

        h.registry.reset_device(record.id, -31).await.unwrap();
        assert_eq!(h.connector.device_resets(), vec![-31]);
        assert_eq!(
            h.registry.reset_device(record.id, -31).await.unwrap_err(),
            SessionError::InvalidHash
        );
        assert_eq!(h.registry.list_devices(record.id).await.unwrap().len(), 1);

        // Still scheduled for teardown after the delivery.
        assert!(h.registry.session_status(record.id).await.unwrap().teardown_scheduled);
    }

    #[tokio::test]
    async fn log_out_tears_the_session_down() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();
        h.connector.message(record.id, SYSTEM, "Code 11111").await;
        settle().await;

        h.registry.log_out(record.id).await.unwrap();
        assert_eq!(h.connector.logouts(), 1);
        assert_eq!(h.connector.disconnects(), 1);
        assert!(!h.connector.is_connected(record.id));
        assert_eq!(h.registry.live_sessions(), 0);
        assert_eq!(h.registry.log_out(record.id).await.unwrap_err(), SessionError::Closed);
    }

    #[tokio::test]
    async fn monitor_replacement() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_admin_monitor(&record, 7)
            .await
            .unwrap();
        h.registry
            .ensure_connected_for_admin_monitor(&record, 8)
            .await
            .unwrap();

        h.connector.message(record.id, SYSTEM, "Code 11111").await;
        settle().await;
        let targets: Vec<UserId> = h
            .notifier
            .sent()
            .into_iter()
            .filter_map(|n| match n {
                Notification::MonitorForward { admin_id, .. } => Some(admin_id),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec![8]);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_and_leaves_no_slot() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.connector
            .fail_connect_with(SessionError::Connect("gateway down".into()));

        let err = h
            .registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Connect(_)));
        assert_eq!(h.registry.live_sessions(), 0);
        // The sale is untouched.
        let stored = h.store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.owner, Some(42));
    }

    #[tokio::test]
    async fn user_deactivated_is_terminal_and_alerts_admins() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;
        h.registry
            .ensure_connected_for_buyer(&record, 42, None)
            .await
            .unwrap();

        h.connector
            .push(record.id, SessionEvent::Terminated(SessionError::UserDeactivated))
            .await;
        settle().await;

        assert_eq!(h.connector.disconnects(), 1);
        assert_eq!(h.registry.live_sessions(), 0);
        assert_eq!(h.notifier.count("admin_alert"), 1);
        assert_eq!(h.connector.connects(), 1);
    }

    #[tokio::test]
    async fn shutdown_disconnects_everything() {
        let h = harness();
        let a = sold_record(&h.store, 42).await;
        let b = h
            .store
            .insert(new_resource("15551234567", "USA", "2020", Some(30)))
            .await
            .unwrap();
        h.registry.ensure_connected_for_buyer(&a, 42, None).await.unwrap();
        h.registry.ensure_connected_for_admin_monitor(&b, 7).await.unwrap();
        assert_eq!(h.registry.live_sessions(), 2);

        h.registry.shutdown().await;
        assert_eq!(h.registry.live_sessions(), 0);
        assert_eq!(h.connector.disconnects(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_share_one_connection() {
        let h = harness();
        let record = sold_record(&h.store, 42).await;

        let tasks = (0..8).map(|admin| {
            let registry = h.registry.clone();
            let record = record.clone();
            tokio::spawn(async move {
                registry
                    .ensure_connected_for_admin_monitor(&record, admin)
                    .await
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        assert_eq!(h.connector.connects(), 1);
        assert_eq!(h.registry.live_sessions(), 1);
    }
}
