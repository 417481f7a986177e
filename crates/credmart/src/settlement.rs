//! Settlement engine: allocate a resource and charge the buyer atomically.
//!
//! There is no lock around a purchase. Each step is a conditioned update on
//! one store (reserve token, claim resource, debit balance), and a failure in
//! a later step compensates the earlier ones in reverse order, so a caller
//! sees either a completed purchase or an error with every ledger unchanged.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::model::{
    CategoryFilter, Claim, PurchaseRecord, ResourceId, ResourceRecord, UserAccount, UserId,
};
use crate::store::{BalanceLedger, PurchaseLog, ResourcePool, StoreError, TokenLedger};

/// Fixed price reduction granted by one discount token.
pub const DEFAULT_DISCOUNT_AMOUNT: i64 = 5;

/// The purchasing user.
#[derive(Debug, Clone)]
pub struct Buyer {
    pub id: UserId,
    pub display_name: Option<String>,
}

impl Buyer {
    pub fn new(id: UserId, display_name: Option<String>) -> Self {
        Self { id, display_name }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("invalid resource id")]
    InvalidId,
    #[error("resource is not available")]
    NotAvailable,
    #[error("resource has no price")]
    NoPrice,
    #[error("no affordable resource in this category")]
    NoAffordable,
    #[error("insufficient credits")]
    InsufficientCredits,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SettlementError {
    /// Stable error code for the presentation layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidId => "invalid_id",
            Self::NotAvailable => "not_available",
            Self::NoPrice => "no_price",
            Self::NoAffordable => "no_affordable",
            Self::InsufficientCredits => "insufficient_credits",
            Self::Store(_) => "internal",
        }
    }

    /// Short, non-technical text safe to show to end users.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidId => "That item could not be found.",
            Self::NotAvailable => "This item was just sold. Please pick another.",
            Self::NoPrice => "This item is not for sale yet.",
            Self::NoAffordable => "Sold out in this category, or not enough credits.",
            Self::InsufficientCredits => "Not enough credits.",
            Self::Store(_) => "Something went wrong. Please try again later.",
        }
    }
}

/// A completed purchase.
#[derive(Debug, Clone)]
pub struct Purchase {
    pub resource: ResourceRecord,
    pub record: PurchaseRecord,
    pub original_price: i64,
    pub final_price: i64,
    pub discount_used: bool,
}

impl Purchase {
    pub fn to_response(&self) -> serde_json::Value {
        let mut response = self.resource.to_public();
        response["original_price"] = serde_json::json!(self.original_price);
        response["final_price"] = serde_json::json!(self.final_price);
        response["discount_used"] = serde_json::json!(self.discount_used);
        response["purchase_id"] = serde_json::json!(self.record.id);
        if let Some(ref secret) = self.resource.secret {
            response["secret"] = serde_json::Value::String(secret.clone());
        }
        response
    }
}

pub struct SettlementEngine {
    resources: Arc<dyn ResourcePool>,
    balances: Arc<dyn BalanceLedger>,
    tokens: Arc<dyn TokenLedger>,
    purchases: Arc<dyn PurchaseLog>,
    discount_amount: i64,
}

impl SettlementEngine {
    pub fn new(
        resources: Arc<dyn ResourcePool>,
        balances: Arc<dyn BalanceLedger>,
        tokens: Arc<dyn TokenLedger>,
        purchases: Arc<dyn PurchaseLog>,
    ) -> Self {
        Self {
            resources,
            balances,
            tokens,
            purchases,
            discount_amount: DEFAULT_DISCOUNT_AMOUNT,
        }
    }

    pub fn with_discount_amount(mut self, amount: i64) -> Self {
        self.discount_amount = amount.max(0);
        self
    }

    pub fn discount_amount(&self) -> i64 {
        self.discount_amount
    }

    /// Buy the cheapest affordable record in a category.
    ///
    /// A held discount token is tried first with a budget of
    /// `balance + discount`; if nothing fits, the token is returned and the
    /// search is repeated at full price.
    pub async fn buy_by_category(
        &self,
        buyer: &Buyer,
        filter: &CategoryFilter,
    ) -> Result<Purchase, SettlementError> {
        let balance = self.open_account(buyer).await?.balance;

        if self.tokens.reserve(buyer.id).await? {
            let claim = Claim::new(buyer.id, buyer.display_name.clone());
            let budget = balance.saturating_add(self.discount_amount);
            match self.resources.claim_cheapest(filter, budget, &claim).await {
                Ok(Some(record)) => return self.settle(buyer, record, claim, true).await,
                Ok(None) => self.release_token(buyer.id).await,
                Err(e) => {
                    self.release_token(buyer.id).await;
                    return Err(e.into());
                }
            }
        }

        let claim = Claim::new(buyer.id, buyer.display_name.clone());
        match self.resources.claim_cheapest(filter, balance, &claim).await? {
            Some(record) => self.settle(buyer, record, claim, false).await,
            None => Err(SettlementError::NoAffordable),
        }
    }

    /// Buy one specific record.
    pub async fn buy_by_id(
        &self,
        buyer: &Buyer,
        resource_id: &str,
    ) -> Result<Purchase, SettlementError> {
        let id: ResourceId = resource_id
            .parse()
            .map_err(|_| SettlementError::InvalidId)?;
        self.open_account(buyer).await?;

        let claim = Claim::new(buyer.id, buyer.display_name.clone());
        let record = self
            .resources
            .claim_by_id(id, &claim)
            .await?
            .ok_or(SettlementError::NotAvailable)?;

        self.settle_with_optional_token(buyer, record, claim).await
    }

    /// Buy the oldest record of an exact (category, price) group.
    pub async fn buy_by_group(
        &self,
        buyer: &Buyer,
        filter: &CategoryFilter,
        price: i64,
    ) -> Result<Purchase, SettlementError> {
        self.open_account(buyer).await?;

        let claim = Claim::new(buyer.id, buyer.display_name.clone());
        let record = self
            .resources
            .claim_in_group(filter, price, &claim)
            .await?
            .ok_or(SettlementError::NotAvailable)?;

        self.settle_with_optional_token(buyer, record, claim).await
    }

    pub async fn grant_credits(
        &self,
        user: UserId,
        amount: i64,
        by_admin: UserId,
    ) -> Result<UserAccount, SettlementError> {
        let account = self.balances.grant(user, amount, by_admin).await?;
        tracing::info!(user_id = user, amount, by_admin, balance = account.balance, "Credits granted");
        Ok(account)
    }

    pub async fn set_credits(
        &self,
        user: UserId,
        amount: i64,
        by_admin: UserId,
    ) -> Result<UserAccount, SettlementError> {
        let account = self.balances.set(user, amount, by_admin).await?;
        tracing::info!(user_id = user, balance = amount, by_admin, "Credits set");
        Ok(account)
    }

    pub async fn grant_tokens(&self, user: UserId, delta: i64) -> Result<u32, SettlementError> {
        Ok(self.tokens.grant(user, delta).await?)
    }

    pub async fn set_tokens(&self, user: UserId, tokens: u32) -> Result<u32, SettlementError> {
        Ok(self.tokens.set(user, tokens).await?)
    }

    async fn open_account(&self, buyer: &Buyer) -> Result<UserAccount, SettlementError> {
        Ok(self
            .balances
            .ensure_account(buyer.id, buyer.display_name.as_deref())
            .await?)
    }

    /// Id and group purchases start from a claimed record: reject unpriced
    /// records, then apply a token if the buyer holds one.
    async fn settle_with_optional_token(
        &self,
        buyer: &Buyer,
        record: ResourceRecord,
        claim: Claim,
    ) -> Result<Purchase, SettlementError> {
        if record.price.is_none() {
            self.release_resource(record.id, claim.attempt).await;
            return Err(SettlementError::NoPrice);
        }

        let discount_used = match self.tokens.reserve(buyer.id).await {
            Ok(reserved) => reserved,
            Err(e) => {
                self.release_resource(record.id, claim.attempt).await;
                return Err(e.into());
            }
        };
        self.settle(buyer, record, claim, discount_used).await
    }

    /// Charge the buyer for a claimed record and log the purchase.
    async fn settle(
        &self,
        buyer: &Buyer,
        record: ResourceRecord,
        claim: Claim,
        discount_used: bool,
    ) -> Result<Purchase, SettlementError> {
        let Some(original_price) = record.price else {
            self.compensate(buyer.id, record.id, claim.attempt, discount_used)
                .await;
            return Err(SettlementError::NoPrice);
        };
        let charge = if discount_used {
            (original_price - self.discount_amount).max(0)
        } else {
            original_price
        };

        match self.balances.try_debit(buyer.id, charge).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    user_id = buyer.id,
                    resource_id = %record.id,
                    charge,
                    "Debit lost a race, compensating"
                );
                self.compensate(buyer.id, record.id, claim.attempt, discount_used)
                    .await;
                return Err(SettlementError::InsufficientCredits);
            }
            Err(e) => {
                self.compensate(buyer.id, record.id, claim.attempt, discount_used)
                    .await;
                return Err(e.into());
            }
        }

        let purchase = PurchaseRecord {
            id: Uuid::new_v4(),
            user_id: buyer.id,
            resource_id: record.id,
            price: charge,
            original_price,
            discount_used,
            identifier: record.identifier.clone(),
            region: record.region.clone(),
            tier: record.tier.clone(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.purchases.append(purchase.clone()).await {
            tracing::error!(
                user_id = buyer.id,
                resource_id = %record.id,
                error = %e,
                "Failed to log purchase, refunding"
            );
            if let Err(refund_err) = self.balances.refund(buyer.id, charge).await {
                tracing::error!(
                    user_id = buyer.id,
                    amount = charge,
                    error = %refund_err,
                    "Refund failed - balance needs manual correction"
                );
            }
            self.compensate(buyer.id, record.id, claim.attempt, discount_used)
                .await;
            return Err(e.into());
        }

        tracing::info!(
            user_id = buyer.id,
            resource_id = %record.id,
            original_price,
            final_price = charge,
            discount_used,
            "Purchase settled"
        );

        Ok(Purchase {
            resource: record,
            record: purchase,
            original_price,
            final_price: charge,
            discount_used,
        })
    }

    async fn compensate(&self, user: UserId, resource: ResourceId, attempt: Uuid, token: bool) {
        if token {
            self.release_token(user).await;
        }
        self.release_resource(resource, attempt).await;
    }

    async fn release_token(&self, user: UserId) {
        if let Err(e) = self.tokens.release(user).await {
            tracing::error!(user_id = user, error = %e, "Failed to release reserved token");
        }
    }

    async fn release_resource(&self, resource: ResourceId, attempt: Uuid) {
        match self.resources.release_claim(resource, attempt).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(resource_id = %resource, "Claim already released or record deleted");
            }
            Err(e) => {
                tracing::error!(resource_id = %resource, error = %e, "Failed to release claim");
            }
        }
    }
}
