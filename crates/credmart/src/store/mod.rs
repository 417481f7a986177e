//! Ledger and resource store contracts.
//!
//! Every mutating operation is a single conditioned update: the check and the
//! write happen atomically, never as a separate read followed by a write.
//! These are the only synchronization primitives the settlement path uses.

mod memory;

pub use memory::{MemoryStore, StoreSnapshot};

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{
    CategoryFilter, Claim, CreditAdjustment, NewResource, PurchaseRecord, ResourceId,
    ResourcePatch, ResourceRecord, UserAccount, UserId,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("insufficient funds for user {0}")]
    InsufficientFunds(UserId),
    #[error("storage I/O failed: {0}")]
    Io(String),
}

/// Resource records and their sale status.
#[async_trait]
pub trait ResourcePool: Send + Sync {
    /// Insert a new Available record. Identifiers are unique.
    async fn insert(&self, new: NewResource) -> Result<ResourceRecord, StoreError>;

    async fn get(&self, id: ResourceId) -> Result<Option<ResourceRecord>, StoreError>;

    /// Apply a partial edit. Price edits on Assigned records are rejected.
    async fn update(&self, id: ResourceId, patch: ResourcePatch)
    -> Result<ResourceRecord, StoreError>;

    /// Delete regardless of status. Returns false if the id was unknown.
    async fn delete(&self, id: ResourceId) -> Result<bool, StoreError>;

    /// Atomically assign the cheapest Available record in the category with
    /// `price <= max_price` (ties: oldest first).
    async fn claim_cheapest(
        &self,
        filter: &CategoryFilter,
        max_price: i64,
        claim: &Claim,
    ) -> Result<Option<ResourceRecord>, StoreError>;

    /// Atomically assign the oldest Available record in the exact
    /// (region, tier) group with exactly `price`.
    async fn claim_in_group(
        &self,
        filter: &CategoryFilter,
        price: i64,
        claim: &Claim,
    ) -> Result<Option<ResourceRecord>, StoreError>;

    /// Atomically assign a specific record, conditioned on it being Available.
    async fn claim_by_id(
        &self,
        id: ResourceId,
        claim: &Claim,
    ) -> Result<Option<ResourceRecord>, StoreError>;

    /// Revert a claim to Available, conditioned on the record still being
    /// held by `attempt`. Returns whether the record was reverted.
    async fn release_claim(&self, id: ResourceId, attempt: Uuid) -> Result<bool, StoreError>;

    /// Check-and-set the sold-report flag. Returns true only for the first caller.
    async fn mark_sold_reported(&self, id: ResourceId) -> Result<bool, StoreError>;

    /// Reprice Available records to `base_price * (100 - percent) / 100`.
    /// Returns the number of records repriced.
    async fn apply_bulk_discount(&self, percent: u8) -> Result<usize, StoreError>;

    /// Restore Available records to their base price.
    async fn reset_bulk_discount(&self) -> Result<usize, StoreError>;
}

/// Per-user integer balance with an append-only adjustment log.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Create the account on first interaction; refreshes the display name.
    async fn ensure_account(
        &self,
        user: UserId,
        display_name: Option<&str>,
    ) -> Result<UserAccount, StoreError>;

    async fn account(&self, user: UserId) -> Result<Option<UserAccount>, StoreError>;

    /// Decrement conditioned on `balance >= amount`. Returns false when the
    /// condition did not hold.
    async fn try_debit(&self, user: UserId, amount: i64) -> Result<bool, StoreError>;

    /// Give back a previously debited amount (compensation path).
    async fn refund(&self, user: UserId, amount: i64) -> Result<UserAccount, StoreError>;

    /// Add `amount` (may be negative). Rejected if the result would go below zero.
    async fn grant(
        &self,
        user: UserId,
        amount: i64,
        by_admin: UserId,
    ) -> Result<UserAccount, StoreError>;

    /// Overwrite the balance. `amount` must be non-negative.
    async fn set(&self, user: UserId, amount: i64, by_admin: UserId)
    -> Result<UserAccount, StoreError>;

    async fn adjustments(&self, user: UserId) -> Result<Vec<CreditAdjustment>, StoreError>;
}

/// Per-user discount token count.
#[async_trait]
pub trait TokenLedger: Send + Sync {
    async fn count(&self, user: UserId) -> Result<u32, StoreError>;

    /// Decrement conditioned on `count >= 1`.
    async fn reserve(&self, user: UserId) -> Result<bool, StoreError>;

    /// Return a reserved token.
    async fn release(&self, user: UserId) -> Result<(), StoreError>;

    /// Add `delta` (may be negative). Rejected if the result would go below zero.
    async fn grant(&self, user: UserId, delta: i64) -> Result<u32, StoreError>;

    async fn set(&self, user: UserId, tokens: u32) -> Result<u32, StoreError>;
}

/// Append-only settlement audit log.
#[async_trait]
pub trait PurchaseLog: Send + Sync {
    async fn append(&self, record: PurchaseRecord) -> Result<(), StoreError>;

    /// Purchases for a user, newest first.
    async fn for_user(&self, user: UserId) -> Result<Vec<PurchaseRecord>, StoreError>;
}
