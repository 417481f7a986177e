//! credmart: settlement engine and live credential sessions for a
//! credit-funded credential marketplace.

mod health;
mod version;

pub mod config;
pub mod extractor;
pub mod gateway;
pub mod model;
pub mod notify;
pub mod service;
pub mod session;
pub mod settlement;
pub mod store;
pub mod transport;

pub use config::{AppConfig, ConfigError};
pub use extractor::{CodeExtractor, DigitCodeExtractor};
pub use gateway::{GatewayConfig, GatewayConnector, GatewayEvent};
pub use health::{Health, HealthReport};
pub use model::{
    CategoryFilter, NewResource, PurchaseRecord, ResourceId, ResourcePatch, ResourceRecord,
    ResourceStatus, SessionCredentials, UserAccount, UserId,
};
pub use notify::{LogNotifier, Notification, Notifier, WebhookConfig, WebhookNotifier};
pub use service::{MarketService, PurchaseReceipt, ServiceConfig, ServiceError, Stores};
pub use session::{DeviceAuthorization, LiveConnector, SessionError, SessionRegistry};
pub use settlement::{Buyer, Purchase, SettlementEngine, SettlementError};
pub use store::{MemoryStore, StoreError};
pub use version::{CREDMART_VERSION, VersionInfo, user_agent};
