//! Transport layer for credmart.
//!
//! The presentation layer (chat bot) and the session gateway both talk to the
//! service over HTTP via axum.

pub mod http;

pub use http::{ServerConfig, serve};
