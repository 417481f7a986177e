//! MarketService: transport-agnostic facade over the marketplace core.
//!
//! This service owns:
//! - The settlement engine and the ledgers behind it
//! - The session registry and the admin login flow
//! - Health tracking and shutdown coordination
//! - Snapshot persistence of the in-memory store
//!
//! Settlements hold a read guard on the persistence gate and snapshots take
//! the write guard, so a snapshot never observes a half-applied purchase.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use crate::gateway::{GatewayConnector, GatewayEvent};
use crate::health::{Health, HealthReport};
use crate::model::{
    CategoryFilter, NewResource, ResourceId, ResourcePatch, ResourceRecord, UserAccount, UserId,
    mask_identifier,
};
use crate::notify::{Notifier, alert_admins};
use crate::session::{
    AdminLoginFlow, DeviceAuthorization, LiveConnector, LoginOutcome, LoginRequest, RegistryConfig,
    SessionError, SessionRegistry, SessionStatus,
};
use crate::settlement::{Buyer, Purchase, SettlementEngine, SettlementError};
use crate::store::{
    BalanceLedger, MemoryStore, PurchaseLog, ResourcePool, StoreError, TokenLedger,
};
use crate::version::VersionInfo;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service is not ready")]
    NotReady,
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("insufficient funds for user {0}")]
    InsufficientFunds(UserId),
    #[error(transparent)]
    Purchase(SettlementError),
    #[error("external session error: {0}")]
    ExternalSession(#[from] SessionError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            StoreError::Validation(what) => Self::Validation(what),
            StoreError::InsufficientFunds(user) => Self::InsufficientFunds(user),
            StoreError::Io(detail) => Self::Internal(detail),
        }
    }
}

impl From<SettlementError> for ServiceError {
    fn from(e: SettlementError) -> Self {
        match e {
            SettlementError::Store(store) => store.into(),
            other => Self::Purchase(other),
        }
    }
}

impl ServiceError {
    /// Stable error code for transports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::InsufficientFunds(_) => "insufficient_funds",
            Self::Purchase(e) => e.kind(),
            Self::ExternalSession(_) => "external_session",
            Self::Internal(_) => "internal",
        }
    }

    /// Message safe to return to callers. Internal detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Purchase(e) => e.user_message().to_string(),
            Self::Internal(_) => "Something went wrong. Please try again later.".to_string(),
            other => other.to_string(),
        }
    }
}

fn device_error(id: ResourceId, error: SessionError) -> ServiceError {
    match error {
        SessionError::Closed => ServiceError::Conflict(format!("no live session for {id}")),
        SessionError::InvalidHash => {
            ServiceError::NotFound("device already logged out or hash invalid".to_string())
        }
        SessionError::ResetForbidden => ServiceError::Conflict(
            "session is too new to reset other devices, try again in a few minutes".to_string(),
        ),
        other => ServiceError::ExternalSession(other),
    }
}

/// The four ledgers the service runs on.
#[derive(Clone)]
pub struct Stores {
    pub resources: Arc<dyn ResourcePool>,
    pub balances: Arc<dyn BalanceLedger>,
    pub tokens: Arc<dyn TokenLedger>,
    pub purchases: Arc<dyn PurchaseLog>,
}

impl Stores {
    pub fn memory(store: &Arc<MemoryStore>) -> Self {
        Self {
            resources: store.clone(),
            balances: store.clone(),
            tokens: store.clone(),
            purchases: store.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub discount_amount: Option<i64>,
    pub registry: RegistryConfig,
}

/// A settled purchase plus the state of credential delivery.
#[derive(Debug, Clone)]
pub struct PurchaseReceipt {
    pub purchase: Purchase,
    /// False when the live session could not be opened. The sale stands and
    /// admins have been alerted.
    pub session_ready: bool,
}

impl PurchaseReceipt {
    pub fn to_response(&self) -> serde_json::Value {
        let mut response = self.purchase.to_response();
        response["session_ready"] = serde_json::Value::Bool(self.session_ready);
        response
    }
}

struct SnapshotTarget {
    store: Arc<MemoryStore>,
    path: PathBuf,
}

pub struct MarketService {
    engine: SettlementEngine,
    stores: Stores,
    registry: Arc<SessionRegistry>,
    logins: AdminLoginFlow,
    notifier: Arc<dyn Notifier>,
    gateway: Option<Arc<GatewayConnector>>,
    admin_ids: Vec<UserId>,

    health: RwLock<Health>,
    version: VersionInfo,

    persist_gate: RwLock<()>,
    snapshot: Option<SnapshotTarget>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MarketService {
    pub fn new(
        stores: Stores,
        connector: Arc<dyn LiveConnector>,
        notifier: Arc<dyn Notifier>,
        config: ServiceConfig,
    ) -> Self {
        let mut engine = SettlementEngine::new(
            stores.resources.clone(),
            stores.balances.clone(),
            stores.tokens.clone(),
            stores.purchases.clone(),
        );
        if let Some(amount) = config.discount_amount {
            engine = engine.with_discount_amount(amount);
        }
        let admin_ids = config.registry.admin_ids.clone();
        let registry = Arc::new(SessionRegistry::new(
            connector.clone(),
            notifier.clone(),
            stores.resources.clone(),
            config.registry,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            engine,
            stores,
            registry,
            logins: AdminLoginFlow::new(connector),
            notifier,
            gateway: None,
            admin_ids,
            health: RwLock::new(Health::Starting),
            version: VersionInfo::new(),
            persist_gate: RwLock::new(()),
            snapshot: None,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Route inbound gateway events to this connector.
    pub fn with_gateway(mut self, gateway: Arc<GatewayConnector>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Persist `store` to `path` on [`snapshot`](Self::snapshot) and shutdown.
    pub fn with_snapshot(mut self, store: Arc<MemoryStore>, path: PathBuf) -> Self {
        self.snapshot = Some(SnapshotTarget { store, path });
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn set_health(&self, health: Health) {
        *self.health.write().await = health;
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: *self.health.read().await,
            version: self.version.clone(),
            live_sessions: self.registry.live_sessions(),
            pending_logins: self.logins.pending_count(),
        }
    }

    async fn ensure_ready(&self) -> Result<(), ServiceError> {
        if self.health.read().await.accepts_purchases() {
            Ok(())
        } else {
            Err(ServiceError::NotReady)
        }
    }

    pub async fn buy_by_category(
        &self,
        buyer: Buyer,
        filter: CategoryFilter,
    ) -> Result<PurchaseReceipt, ServiceError> {
        self.ensure_ready().await?;
        let purchase = {
            let _gate = self.persist_gate.read().await;
            self.engine.buy_by_category(&buyer, &filter).await?
        };
        Ok(self.start_delivery(purchase, &buyer).await)
    }

    pub async fn buy_by_group(
        &self,
        buyer: Buyer,
        filter: CategoryFilter,
        price: i64,
    ) -> Result<PurchaseReceipt, ServiceError> {
        self.ensure_ready().await?;
        let purchase = {
            let _gate = self.persist_gate.read().await;
            self.engine.buy_by_group(&buyer, &filter, price).await?
        };
        Ok(self.start_delivery(purchase, &buyer).await)
    }

    pub async fn buy_by_id(
        &self,
        buyer: Buyer,
        resource_id: &str,
    ) -> Result<PurchaseReceipt, ServiceError> {
        self.ensure_ready().await?;
        let purchase = {
            let _gate = self.persist_gate.read().await;
            self.engine.buy_by_id(&buyer, resource_id).await?
        };
        Ok(self.start_delivery(purchase, &buyer).await)
    }

    /// Open the live session for a sold resource. A failure here never
    /// unwinds the sale; it is logged and escalated to admins.
    async fn start_delivery(&self, purchase: Purchase, buyer: &Buyer) -> PurchaseReceipt {
        let result = self
            .registry
            .ensure_connected_for_buyer(&purchase.resource, buyer.id, buyer.display_name.clone())
            .await;

        let session_ready = match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    resource_id = %purchase.resource.id,
                    user_id = buyer.id,
                    error = %e,
                    "Sold resource has no live session"
                );
                alert_admins(
                    self.notifier.as_ref(),
                    &self.admin_ids,
                    Some(purchase.resource.id),
                    &format!(
                        "Sold {} to user {} but the live session failed: {e}. Manual delivery needed.",
                        mask_identifier(&purchase.resource.identifier),
                        buyer.id
                    ),
                )
                .await;
                false
            }
        };

        PurchaseReceipt {
            purchase,
            session_ready,
        }
    }

    pub async fn grant_credits(
        &self,
        user: UserId,
        amount: i64,
        by_admin: UserId,
    ) -> Result<UserAccount, ServiceError> {
        let _gate = self.persist_gate.read().await;
        Ok(self.engine.grant_credits(user, amount, by_admin).await?)
    }

    pub async fn set_credits(
        &self,
        user: UserId,
        amount: i64,
        by_admin: UserId,
    ) -> Result<UserAccount, ServiceError> {
        let _gate = self.persist_gate.read().await;
        Ok(self.engine.set_credits(user, amount, by_admin).await?)
    }

    pub async fn grant_tokens(&self, user: UserId, delta: i64) -> Result<u32, ServiceError> {
        let _gate = self.persist_gate.read().await;
        Ok(self.engine.grant_tokens(user, delta).await?)
    }

    pub async fn set_tokens(&self, user: UserId, tokens: u32) -> Result<u32, ServiceError> {
        let _gate = self.persist_gate.read().await;
        Ok(self.engine.set_tokens(user, tokens).await?)
    }

    pub async fn add_resource(&self, new: NewResource) -> Result<ResourceRecord, ServiceError> {
        let _gate = self.persist_gate.read().await;
        let record = self.stores.resources.insert(new).await?;
        tracing::info!(resource_id = %record.id, added_by = record.added_by, "Resource added");
        Ok(record)
    }

    pub async fn edit_resource(
        &self,
        id: ResourceId,
        patch: ResourcePatch,
    ) -> Result<ResourceRecord, ServiceError> {
        if patch.is_empty() {
            return Err(ServiceError::Validation("no fields to update".to_string()));
        }
        let _gate = self.persist_gate.read().await;
        Ok(self.stores.resources.update(id, patch).await?)
    }

    /// Delete a resource in any state and close its live session.
    pub async fn delete_resource(&self, id: ResourceId) -> Result<(), ServiceError> {
        let deleted = {
            let _gate = self.persist_gate.read().await;
            self.stores.resources.delete(id).await?
        };
        self.registry.disconnect(id).await;
        if !deleted {
            return Err(ServiceError::NotFound(format!("resource {id}")));
        }
        tracing::info!(resource_id = %id, "Resource deleted");
        Ok(())
    }

    pub async fn apply_bulk_discount(&self, percent: u8) -> Result<usize, ServiceError> {
        let _gate = self.persist_gate.read().await;
        let repriced = self.stores.resources.apply_bulk_discount(percent).await?;
        tracing::info!(percent, repriced, "Bulk discount applied");
        Ok(repriced)
    }

    pub async fn reset_bulk_discount(&self) -> Result<usize, ServiceError> {
        let _gate = self.persist_gate.read().await;
        let restored = self.stores.resources.reset_bulk_discount().await?;
        tracing::info!(restored, "Bulk discount reset");
        Ok(restored)
    }

    pub async fn start_monitor(
        &self,
        id: ResourceId,
        admin: UserId,
    ) -> Result<SessionStatus, ServiceError> {
        let record = self
            .stores
            .resources
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("resource {id}")))?;
        self.registry
            .ensure_connected_for_admin_monitor(&record, admin)
            .await?;
        self.registry
            .session_status(id)
            .await
            .ok_or_else(|| ServiceError::Internal(format!("session {id} vanished after connect")))
    }

    pub async fn stop_monitor(&self, id: ResourceId) -> bool {
        self.registry.stop_admin_monitor(id).await
    }

    pub async fn disconnect_session(&self, id: ResourceId) -> bool {
        self.registry.disconnect(id).await
    }

    pub async fn session_status(&self, id: ResourceId) -> Option<SessionStatus> {
        self.registry.session_status(id).await
    }

    pub async fn list_devices(
        &self,
        id: ResourceId,
        user: UserId,
    ) -> Result<Vec<DeviceAuthorization>, ServiceError> {
        self.authorize_device_access(id, user).await?;
        self.registry
            .list_devices(id)
            .await
            .map_err(|e| device_error(id, e))
    }

    pub async fn reset_device(
        &self,
        id: ResourceId,
        user: UserId,
        hash: i64,
    ) -> Result<(), ServiceError> {
        self.authorize_device_access(id, user).await?;
        self.registry
            .reset_device(id, hash)
            .await
            .map_err(|e| device_error(id, e))?;
        tracing::info!(resource_id = %id, user_id = user, hash, "Device reset on request");
        Ok(())
    }

    /// Log the marketplace's own session out of the account.
    pub async fn log_out_session(
        &self,
        id: ResourceId,
        user: UserId,
    ) -> Result<(), ServiceError> {
        self.authorize_device_access(id, user).await?;
        self.registry
            .log_out(id)
            .await
            .map_err(|e| device_error(id, e))
    }

    /// Admins may manage any resource, everyone else only what they bought.
    async fn authorize_device_access(
        &self,
        id: ResourceId,
        user: UserId,
    ) -> Result<(), ServiceError> {
        let record = self
            .stores
            .resources
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("resource {id}")))?;
        if self.admin_ids.contains(&user) || record.owner == Some(user) {
            Ok(())
        } else {
            tracing::warn!(resource_id = %id, user_id = user, "Device access denied");
            Err(ServiceError::Forbidden(format!("user {user} does not own resource {id}")))
        }
    }

    pub async fn begin_login(
        &self,
        admin: UserId,
        request: LoginRequest,
    ) -> Result<(), ServiceError> {
        if request.phone.chars().filter(|c| c.is_ascii_digit()).count() < 5 {
            return Err(ServiceError::Validation("phone number is too short".to_string()));
        }
        Ok(self.logins.begin(admin, request).await?)
    }

    pub async fn complete_login_code(
        &self,
        admin: UserId,
        code: &str,
    ) -> Result<LoginOutcome, ServiceError> {
        Ok(self.logins.complete_code(admin, code).await?)
    }

    pub async fn complete_login_password(
        &self,
        admin: UserId,
        password: &str,
    ) -> Result<LoginOutcome, ServiceError> {
        Ok(self.logins.complete_password(admin, password).await?)
    }

    pub async fn cancel_login(&self, admin: UserId) -> bool {
        self.logins.cancel(admin).await
    }

    /// Hand an inbound gateway event to the session it belongs to.
    pub async fn dispatch_event(
        &self,
        id: ResourceId,
        event: GatewayEvent,
    ) -> Result<(), ServiceError> {
        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| ServiceError::NotFound("no gateway configured".to_string()))?;
        gateway
            .dispatch(id, event.into())
            .await
            .map_err(|_| ServiceError::NotFound(format!("no live session for {id}")))
    }

    /// Write the store snapshot. Returns false when persistence is disabled.
    pub async fn snapshot(&self) -> Result<bool, ServiceError> {
        let Some(ref target) = self.snapshot else {
            return Ok(false);
        };
        let _gate = self.persist_gate.write().await;
        target.store.save_to(&target.path).await?;
        tracing::debug!(path = %target.path.display(), "Snapshot written");
        Ok(true)
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Stop taking purchases, close every login and session, write a final snapshot.
    pub async fn shutdown(&self) {
        self.set_health(Health::ShuttingDown).await;
        self.logins.cancel_all().await;
        self.registry.shutdown().await;
        if let Err(e) = self.snapshot().await {
            tracing::error!(error = %e, "Final snapshot failed");
        }
    }
}
