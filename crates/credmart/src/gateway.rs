//! HTTP client for the session gateway.
//!
//! The gateway owns the external messaging protocol. This side opens and
//! closes sessions, manages device authorizations and drives admin logins
//! over HTTP; the gateway pushes
//! inbound events back to `POST /gateway/sessions/{id}/events`, which lands in
//! [`GatewayConnector::dispatch`] and feeds the session's event channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{ResourceId, ResourceRecord, SessionCredentials};
use crate::session::{
    DeviceAuthorization, InboundMessage, LiveConnection, LiveConnector, LiveSession, LoginRequest,
    LoginStep, PendingLogin, ProvisionedSession, SessionError, SessionEvent,
};
use crate::version::user_agent;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Inbound events buffered per session before the gateway is back-pressured.
    pub event_buffer: usize,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            event_buffer: 64,
        }
    }
}

/// Event body posted by the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    Message {
        sender: i64,
        text: String,
    },
    Terminated {
        error: String,
        #[serde(default)]
        message: Option<String>,
    },
}

impl From<GatewayEvent> for SessionEvent {
    fn from(event: GatewayEvent) -> Self {
        match event {
            GatewayEvent::Message { sender, text } => {
                SessionEvent::Message(InboundMessage { sender, text })
            }
            GatewayEvent::Terminated { error, message } => {
                SessionEvent::Terminated(session_error(&error, message))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    message: Option<String>,
}

fn session_error(code: &str, message: Option<String>) -> SessionError {
    match code {
        "user_deactivated" => SessionError::UserDeactivated,
        "closed" => SessionError::Closed,
        "fresh_reset_forbidden" => SessionError::ResetForbidden,
        "hash_invalid" => SessionError::InvalidHash,
        _ => SessionError::Protocol(message.unwrap_or_else(|| code.to_string())),
    }
}

#[derive(Serialize)]
struct ConnectRequest<'a> {
    resource_id: ResourceId,
    api_id: i64,
    api_hash: &'a str,
    session: &'a str,
}

#[derive(Serialize)]
struct BeginLoginRequest<'a> {
    api_id: i64,
    api_hash: &'a str,
    phone: &'a str,
}

#[derive(Deserialize)]
struct DeviceList {
    devices: Vec<DeviceAuthorization>,
}

#[derive(Deserialize)]
struct LoginStarted {
    login_id: String,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum LoginStepBody {
    Ok {
        session: String,
        #[serde(default)]
        external_user_id: Option<i64>,
        #[serde(default)]
        username: Option<String>,
    },
    InvalidCode,
    CodeExpired,
    NeedPassword,
    InvalidPassword,
}

struct Stream {
    token: Uuid,
    sender: mpsc::Sender<SessionEvent>,
}

type Streams = Arc<DashMap<ResourceId, Stream>>;

pub struct GatewayConnector {
    base_url: String,
    client: reqwest::Client,
    event_buffer: usize,
    streams: Streams,
}

impl GatewayConnector {
    pub fn new(config: GatewayConfig) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .timeout(config.timeout)
            .build()
            .map_err(|e| SessionError::Connect(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            event_buffer: config.event_buffer.max(1),
            streams: Arc::new(DashMap::new()),
        })
    }

    /// Feed an event from the gateway into the session's channel, preserving
    /// arrival order. Fails with `Closed` if no session is open for `id`.
    pub async fn dispatch(&self, id: ResourceId, event: SessionEvent) -> Result<(), SessionError> {
        let sender = self
            .streams
            .get(&id)
            .map(|s| s.sender.clone())
            .ok_or(SessionError::Closed)?;
        sender.send(event).await.map_err(|_| SessionError::Closed)
    }

    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Turn a non-success gateway response into a session error.
async fn failure(response: reqwest::Response, connecting: bool) -> SessionError {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) if body.error == "user_deactivated" => SessionError::UserDeactivated,
        Ok(body) if connecting => SessionError::Connect(body.message.unwrap_or(body.error)),
        Ok(body) => session_error(&body.error, body.message),
        Err(_) if connecting => SessionError::Connect(format!("gateway returned {status}")),
        Err(_) => SessionError::Protocol(format!("gateway returned {status}")),
    }
}

fn transport(e: reqwest::Error, connecting: bool) -> SessionError {
    if connecting {
        SessionError::Connect(e.to_string())
    } else {
        SessionError::Protocol(e.to_string())
    }
}

#[async_trait]
impl LiveConnector for GatewayConnector {
    async fn connect(&self, record: &ResourceRecord) -> Result<LiveSession, SessionError> {
        let body = ConnectRequest {
            resource_id: record.id,
            api_id: record.credentials.api_id,
            api_hash: &record.credentials.api_hash,
            session: &record.credentials.session,
        };

        // Register the stream first so events racing the response are kept.
        let (sender, events) = mpsc::channel(self.event_buffer);
        let token = Uuid::new_v4();
        self.streams.insert(record.id, Stream { token, sender });

        let result = self
            .client
            .post(self.url("/sessions"))
            .json(&body)
            .send()
            .await;
        let error = match result {
            Ok(response) if response.status().is_success() => None,
            Ok(response) => Some(failure(response, true).await),
            Err(e) => Some(transport(e, true)),
        };
        if let Some(error) = error {
            self.streams.remove_if(&record.id, |_, s| s.token == token);
            return Err(error);
        }

        tracing::debug!(resource_id = %record.id, "Gateway session opened");
        Ok(LiveSession {
            connection: Box::new(GatewayConnection {
                client: self.client.clone(),
                url: self.url(&format!("/sessions/{}", record.id)),
                id: record.id,
                token,
                streams: self.streams.clone(),
            }),
            events,
        })
    }

    async fn begin_login(
        &self,
        request: LoginRequest,
    ) -> Result<Box<dyn PendingLogin>, SessionError> {
        let body = BeginLoginRequest {
            api_id: request.api_id,
            api_hash: &request.api_hash,
            phone: &request.phone,
        };
        let response = self
            .client
            .post(self.url("/logins"))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(e, true))?;
        if !response.status().is_success() {
            return Err(failure(response, true).await);
        }
        let started: LoginStarted = response
            .json()
            .await
            .map_err(|e| SessionError::Protocol(format!("invalid login response: {e}")))?;

        Ok(Box::new(GatewayLogin {
            client: self.client.clone(),
            url: self.url(&format!("/logins/{}", started.login_id)),
            request,
        }))
    }
}

struct GatewayConnection {
    client: reqwest::Client,
    url: String,
    id: ResourceId,
    token: Uuid,
    streams: Streams,
}

#[async_trait]
impl LiveConnection for GatewayConnection {
    async fn disconnect(&self) -> Result<(), SessionError> {
        self.streams.remove_if(&self.id, |_, s| s.token == self.token);
        let response = self
            .client
            .delete(&self.url)
            .send()
            .await
            .map_err(|e| transport(e, false))?;
        // Already gone on the gateway side is fine.
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(failure(response, false).await)
        }
    }

    async fn list_devices(&self) -> Result<Vec<DeviceAuthorization>, SessionError> {
        let response = self
            .client
            .get(format!("{}/devices", self.url))
            .send()
            .await
            .map_err(|e| transport(e, false))?;
        if !response.status().is_success() {
            return Err(failure(response, false).await);
        }
        let list: DeviceList = response
            .json()
            .await
            .map_err(|e| SessionError::Protocol(format!("invalid device list: {e}")))?;
        Ok(list.devices)
    }

    async fn reset_device(&self, hash: i64) -> Result<(), SessionError> {
        let response = self
            .client
            .delete(format!("{}/devices/{hash}", self.url))
            .send()
            .await
            .map_err(|e| transport(e, false))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(failure(response, false).await)
        }
    }

    async fn log_out(&self) -> Result<(), SessionError> {
        let response = self
            .client
            .post(format!("{}/logout", self.url))
            .send()
            .await
            .map_err(|e| transport(e, false))?;
        if response.status().is_success() {
            tracing::debug!(resource_id = %self.id, "Gateway session logged out");
            Ok(())
        } else {
            Err(failure(response, false).await)
        }
    }
}

struct GatewayLogin {
    client: reqwest::Client,
    url: String,
    request: LoginRequest,
}

impl GatewayLogin {
    async fn step(&self, path: &str, body: serde_json::Value) -> Result<LoginStep, SessionError> {
        let response = self
            .client
            .post(format!("{}{path}", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(e, false))?;
        if !response.status().is_success() {
            return Err(failure(response, false).await);
        }
        let step: LoginStepBody = response
            .json()
            .await
            .map_err(|e| SessionError::Protocol(format!("invalid login step: {e}")))?;

        Ok(match step {
            LoginStepBody::Ok {
                session,
                external_user_id,
                username,
            } => LoginStep::Authorized(ProvisionedSession {
                identifier: self.request.phone.trim_start_matches('+').to_string(),
                credentials: SessionCredentials {
                    api_id: self.request.api_id,
                    api_hash: self.request.api_hash.clone(),
                    session,
                },
                external_user_id,
                username,
            }),
            LoginStepBody::InvalidCode => LoginStep::InvalidCode,
            LoginStepBody::CodeExpired => LoginStep::CodeExpired,
            LoginStepBody::NeedPassword => LoginStep::NeedPassword,
            LoginStepBody::InvalidPassword => LoginStep::InvalidPassword,
        })
    }
}

#[async_trait]
impl PendingLogin for GatewayLogin {
    async fn submit_code(&self, code: &str) -> Result<LoginStep, SessionError> {
        self.step("/code", serde_json::json!({ "code": code })).await
    }

    async fn submit_password(&self, password: &str) -> Result<LoginStep, SessionError> {
        self.step("/password", serde_json::json!({ "password": password }))
            .await
    }

    async fn close(&self) -> Result<(), SessionError> {
        let response = self
            .client
            .delete(&self.url)
            .send()
            .await
            .map_err(|e| transport(e, false))?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(failure(response, false).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::new_resource;
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record() -> ResourceRecord {
        ResourceRecord::from_new(new_resource("919876543244", "India", "2019", Some(50)), Utc::now())
    }

    fn connector(server: &MockServer) -> GatewayConnector {
        GatewayConnector::new(GatewayConfig::new(format!("{}/", server.uri()))).unwrap()
    }

    fn login_request() -> LoginRequest {
        LoginRequest {
            api_id: 1000,
            api_hash: "hash".to_string(),
            phone: "+919876543244".to_string(),
        }
    }

    #[tokio::test]
    async fn connect_dispatch_and_disconnect() {
        let server = MockServer::start().await;
        let record = record();

        Mock::given(method("POST"))
            .and(path("/sessions"))
            .and(body_partial_json(serde_json::json!({
                "resource_id": record.id,
                "api_id": 1000,
                "session": "session-string"
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/sessions/{}", record.id)))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = connector(&server);
        let mut live = gateway.connect(&record).await.unwrap();
        assert_eq!(gateway.open_streams(), 1);

        let event: GatewayEvent =
            serde_json::from_str(r#"{"type":"message","sender":777000,"text":"Code 12345"}"#).unwrap();
        gateway.dispatch(record.id, event.into()).await.unwrap();
        match live.events.recv().await {
            Some(SessionEvent::Message(message)) => {
                assert_eq!(message.sender, 777000);
                assert_eq!(message.text, "Code 12345");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        live.connection.disconnect().await.unwrap();
        assert_eq!(gateway.open_streams(), 0);
        let err = gateway
            .dispatch(record.id, SessionEvent::Terminated(SessionError::Closed))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Closed);
    }

    #[tokio::test]
    async fn deactivated_account_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_json(serde_json::json!({"error": "user_deactivated"})),
            )
            .mount(&server)
            .await;

        let gateway = connector(&server);
        let err = gateway.connect(&record()).await.err().unwrap();
        assert_eq!(err, SessionError::UserDeactivated);
        assert_eq!(gateway.open_streams(), 0);
    }

    #[tokio::test]
    async fn connect_failure_is_connect_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = connector(&server).connect(&record()).await.err().unwrap();
        assert!(matches!(err, SessionError::Connect(_)));
    }

    #[tokio::test]
    async fn disconnect_tolerates_missing_session() {
        let server = MockServer::start().await;
        let record = record();
        Mock::given(method("POST"))
            .and(path("/sessions"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/sessions/{}", record.id)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let live = connector(&server).connect(&record).await.unwrap();
        assert!(live.connection.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn device_management_round_trip() {
        let server = MockServer::start().await;
        let record = record();
        let base = format!("/sessions/{}", record.id);

        Mock::given(method("POST"))
            .and(path("/sessions"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{base}/devices")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "devices": [
                    {"hash": 0, "device_model": "credmart", "current": true},
                    {
                        "hash": -4417,
                        "device_model": "Pixel 8",
                        "platform": "Android",
                        "app_name": "Telegram",
                        "ip": "203.0.113.9",
                        "country": "India",
                        "date_active": "2026-10-01T12:00:00Z"
                    }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{base}/devices/-4417")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{base}/devices/77")))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "hash_invalid"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{base}/devices/78")))
            .respond_with(
                ResponseTemplate::new(406)
                    .set_body_json(serde_json::json!({"error": "fresh_reset_forbidden"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{base}/logout")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let live = connector(&server).connect(&record).await.unwrap();
        let devices = live.connection.list_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices[0].current);
        assert_eq!(devices[1].hash, -4417);
        assert_eq!(devices[1].label(2), "Pixel 8 Android Telegram");
        assert_eq!(devices[1].ip.as_deref(), Some("203.0.113.9"));
        assert!(devices[1].date_active.is_some());

        live.connection.reset_device(-4417).await.unwrap();
        assert_eq!(
            live.connection.reset_device(77).await.unwrap_err(),
            SessionError::InvalidHash
        );
        assert_eq!(
            live.connection.reset_device(78).await.unwrap_err(),
            SessionError::ResetForbidden
        );
        live.connection.log_out().await.unwrap();
    }

    #[tokio::test]
    async fn device_list_on_deactivated_account() {
        let server = MockServer::start().await;
        let record = record();
        Mock::given(method("POST"))
            .and(path("/sessions"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/sessions/{}/devices", record.id)))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_json(serde_json::json!({"error": "user_deactivated"})),
            )
            .mount(&server)
            .await;

        let live = connector(&server).connect(&record).await.unwrap();
        let err = live.connection.list_devices().await.unwrap_err();
        assert_eq!(err, SessionError::UserDeactivated);
    }

    #[tokio::test]
    async fn login_flow_produces_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logins"))
            .and(body_partial_json(serde_json::json!({"phone": "+919876543244"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"login_id": "L1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/logins/L1/code"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "need_password"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/logins/L1/password"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "session": "fresh-session",
                "external_user_id": 55,
                "username": "seller"
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/logins/L1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = connector(&server);
        let login = gateway.begin_login(login_request()).await.unwrap();
        assert_eq!(login.submit_code("12345").await.unwrap(), LoginStep::NeedPassword);

        match login.submit_password("pw").await.unwrap() {
            LoginStep::Authorized(session) => {
                assert_eq!(session.identifier, "919876543244");
                assert_eq!(session.credentials.api_id, 1000);
                assert_eq!(session.credentials.session, "fresh-session");
                assert_eq!(session.external_user_id, Some(55));
                assert_eq!(session.username.as_deref(), Some("seller"));
            }
            other => panic!("unexpected step: {other:?}"),
        }
        login.close().await.unwrap();
    }

    #[tokio::test]
    async fn login_errors_map_to_protocol() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logins"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"login_id": "L2"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/logins/L2/code"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": "flood_wait",
                "message": "retry in 30s"
            })))
            .mount(&server)
            .await;

        let login = connector(&server).begin_login(login_request()).await.unwrap();
        let err = login.submit_code("12345").await.unwrap_err();
        assert_eq!(err, SessionError::Protocol("retry in 30s".to_string()));
    }

    #[test]
    fn terminated_event_mapping() {
        let event: GatewayEvent =
            serde_json::from_str(r#"{"type":"terminated","error":"user_deactivated"}"#).unwrap();
        assert!(matches!(
            SessionEvent::from(event),
            SessionEvent::Terminated(SessionError::UserDeactivated)
        ));

        let event: GatewayEvent =
            serde_json::from_str(r#"{"type":"terminated","error":"auth_key_unregistered"}"#).unwrap();
        assert!(matches!(
            SessionEvent::from(event),
            SessionEvent::Terminated(SessionError::Protocol(ref m)) if m == "auth_key_unregistered"
        ));
    }
}
