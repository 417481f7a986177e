//! Health status of the marketplace service.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Restoring persisted state
    #[default]
    Starting,
    /// Accepting purchases
    Ready,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl Health {
    pub fn accepts_purchases(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Body of `GET /health-check`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: Health,
    pub version: crate::version::VersionInfo,
    pub live_sessions: usize,
    pub pending_logins: usize,
}
