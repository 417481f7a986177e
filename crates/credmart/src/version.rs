//! Version information for credmart.

/// Credmart version from Cargo.toml
pub const CREDMART_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub credmart: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            credmart: CREDMART_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `User-Agent` sent on every outbound HTTP request.
pub fn user_agent() -> String {
    format!("credmart/{CREDMART_VERSION}")
}
