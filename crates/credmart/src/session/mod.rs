//! Live credential sessions.
//!
//! A [`LiveConnector`] opens one connection per resource and streams inbound
//! events on a channel. The [`SessionRegistry`] owns those connections and
//! routes secret codes to buyers and admin monitors; [`AdminLoginFlow`] uses
//! the same connector to provision new credentials.
//!
//! While a session is live it also exposes the account's device
//! authorizations, so a buyer can log other devices out during the grace
//! window.

mod login;
mod registry;

pub use login::{AdminLoginFlow, LoginOutcome, ProvisionedSession};
pub use registry::{
    DEFAULT_TEARDOWN_AFTER, RegistryConfig, SessionRegistry, SessionState, SessionStatus,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::ResourceRecord;

/// Default id of the external system account that sends login codes.
pub const DEFAULT_SYSTEM_SENDER: i64 = 777000;

/// A message received on a connected session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: i64,
    pub text: String,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Message(InboundMessage),
    /// The external system ended the session. No further events follow.
    Terminated(SessionError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("account has been deactivated")]
    UserDeactivated,
    #[error("session protocol error: {0}")]
    Protocol(String),
    #[error("session closed")]
    Closed,
    /// The session is too new to reset other devices.
    #[error("session is too new to reset other devices")]
    ResetForbidden,
    #[error("device already logged out or hash invalid")]
    InvalidHash,
}

impl SessionError {
    /// Terminal errors end the resource's session for good and are not retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::UserDeactivated)
    }
}

/// An open connection plus its inbound event stream.
pub struct LiveSession {
    pub connection: Box<dyn LiveConnection>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// One device authorized on the account behind a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub hash: i64,
    #[serde(default)]
    pub device_model: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub date_active: Option<DateTime<Utc>>,
    /// The authorization this session itself runs on.
    #[serde(default)]
    pub current: bool,
}

impl DeviceAuthorization {
    /// Human-readable name; `position` is 1-based and used when the device
    /// reports nothing about itself.
    pub fn label(&self, position: usize) -> String {
        if self.current {
            return "Marketplace session (current)".to_string();
        }
        let parts: Vec<&str> = [&self.device_model, &self.platform, &self.app_name]
            .into_iter()
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect();
        if parts.is_empty() {
            format!("Device {position}")
        } else {
            parts.join(" ")
        }
    }
}

#[async_trait]
pub trait LiveConnection: Send + Sync {
    async fn disconnect(&self) -> Result<(), SessionError>;

    async fn list_devices(&self) -> Result<Vec<DeviceAuthorization>, SessionError>;

    /// Log the device with `hash` out of the account.
    async fn reset_device(&self, hash: i64) -> Result<(), SessionError>;

    /// Log this session itself out. Only `disconnect` is meaningful afterwards.
    async fn log_out(&self) -> Result<(), SessionError>;
}

/// API credentials and phone number used to start a login.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub api_id: i64,
    pub api_hash: String,
    pub phone: String,
}

/// Outcome of one login step as reported by the external system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStep {
    Authorized(ProvisionedSession),
    InvalidCode,
    CodeExpired,
    NeedPassword,
    InvalidPassword,
}

/// A login waiting for a code or password.
#[async_trait]
pub trait PendingLogin: Send + Sync {
    async fn submit_code(&self, code: &str) -> Result<LoginStep, SessionError>;

    async fn submit_password(&self, password: &str) -> Result<LoginStep, SessionError>;

    /// Tear down the login connection.
    async fn close(&self) -> Result<(), SessionError>;
}

/// Client for the external live-connection system.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self, record: &ResourceRecord) -> Result<LiveSession, SessionError>;

    /// Open a fresh connection and request a login code for `request.phone`.
    async fn begin_login(&self, request: LoginRequest)
    -> Result<Box<dyn PendingLogin>, SessionError>;
}
