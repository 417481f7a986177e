//! In-process store implementing every ledger contract.
//!
//! Conditioned updates run inside short critical sections that never span an
//! `.await`. Resources sit behind one mutex because a category claim must scan
//! and assign in one step; balances and tokens are keyed by user in DashMaps so
//! per-user updates only contend on their own shard.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BalanceLedger, PurchaseLog, ResourcePool, StoreError, TokenLedger};
use crate::model::{
    AdjustmentKind, CategoryFilter, Claim, CreditAdjustment, NewResource, PurchaseRecord,
    ResourceId, ResourcePatch, ResourceRecord, ResourceStatus, UserAccount, UserId,
};

const SNAPSHOT_VERSION: u32 = 1;
const MAX_BULK_DISCOUNT: u8 = 95;

/// Lock a store mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Store mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

/// Serialized form of the whole store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub resources: Vec<ResourceRecord>,
    pub accounts: Vec<UserAccount>,
    pub adjustments: Vec<CreditAdjustment>,
    pub tokens: BTreeMap<UserId, u32>,
    pub purchases: Vec<PurchaseRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    resources: StdMutex<HashMap<ResourceId, ResourceRecord>>,
    accounts: DashMap<UserId, UserAccount>,
    adjustments: StdMutex<Vec<CreditAdjustment>>,
    tokens: DashMap<UserId, u32>,
    purchases: StdMutex<Vec<PurchaseRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        {
            let mut resources = lock(&store.resources);
            for record in snapshot.resources {
                resources.insert(record.id, record);
            }
        }
        for account in snapshot.accounts {
            store.accounts.insert(account.user_id, account);
        }
        *lock(&store.adjustments) = snapshot.adjustments;
        for (user, count) in snapshot.tokens {
            store.tokens.insert(user, count);
        }
        *lock(&store.purchases) = snapshot.purchases;
        store
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let mut resources: Vec<ResourceRecord> = lock(&self.resources).values().cloned().collect();
        resources.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let mut accounts: Vec<UserAccount> =
            self.accounts.iter().map(|entry| entry.value().clone()).collect();
        accounts.sort_by_key(|a| a.user_id);

        StoreSnapshot {
            version: SNAPSHOT_VERSION,
            resources,
            accounts,
            adjustments: lock(&self.adjustments).clone(),
            tokens: self.tokens.iter().map(|e| (*e.key(), *e.value())).collect(),
            purchases: lock(&self.purchases).clone(),
        }
    }

    /// Write a snapshot atomically (temp file + rename).
    pub async fn save_to(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.snapshot())
            .map_err(|e| StoreError::Io(format!("failed to encode snapshot: {e}")))?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::Io(format!("failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Io(format!("failed to replace {}: {e}", path.display())))?;
        Ok(())
    }

    /// Load a snapshot. Returns `None` if the file does not exist yet.
    pub async fn load_from(path: &Path) -> Result<Option<Self>, StoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Io(format!("corrupt snapshot {}: {e}", path.display())))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Io(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(Self::from_snapshot(snapshot)))
    }

    fn log_adjustment(&self, user: UserId, amount: i64, kind: AdjustmentKind, by_admin: Option<UserId>) {
        lock(&self.adjustments).push(CreditAdjustment {
            user_id: user,
            amount,
            kind,
            by_admin,
            created_at: Utc::now(),
        });
    }

    fn claim_first<F, K>(&self, eligible: F, order: K, claim: &Claim) -> Option<ResourceRecord>
    where
        F: Fn(&ResourceRecord) -> bool,
        K: Fn(&ResourceRecord) -> (i64, chrono::DateTime<Utc>, ResourceId),
    {
        let mut resources = lock(&self.resources);
        let id = resources
            .values()
            .filter(|r| r.is_available() && eligible(r))
            .min_by_key(|r| order(r))
            .map(|r| r.id)?;
        let record = resources.get_mut(&id)?;
        record.apply_claim(claim);
        Some(record.clone())
    }
}

/// Round `base * (100 - percent) / 100` half to even.
fn discounted_price(base: i64, percent: u8) -> i64 {
    let numerator = i128::from(base) * i128::from(100 - percent);
    let (quotient, remainder) = (numerator / 100, numerator % 100);
    let rounded = match remainder.cmp(&50) {
        std::cmp::Ordering::Greater => quotient + 1,
        std::cmp::Ordering::Equal if quotient % 2 != 0 => quotient + 1,
        _ => quotient,
    };
    // Never larger than `base`, so the narrowing cannot fail.
    i64::try_from(rounded).unwrap_or(base)
}

#[async_trait]
impl ResourcePool for MemoryStore {
    async fn insert(&self, new: NewResource) -> Result<ResourceRecord, StoreError> {
        if new.identifier.trim().is_empty() {
            return Err(StoreError::Validation("identifier is required".to_string()));
        }
        if new.price.is_some_and(|p| p < 0) {
            return Err(StoreError::Validation("price must be non-negative".to_string()));
        }

        let mut resources = lock(&self.resources);
        if resources.values().any(|r| r.identifier == new.identifier) {
            return Err(StoreError::Conflict(format!(
                "identifier {} already exists",
                new.identifier
            )));
        }
        let record = ResourceRecord::from_new(new, Utc::now());
        resources.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: ResourceId) -> Result<Option<ResourceRecord>, StoreError> {
        Ok(lock(&self.resources).get(&id).cloned())
    }

    async fn update(
        &self,
        id: ResourceId,
        patch: ResourcePatch,
    ) -> Result<ResourceRecord, StoreError> {
        if patch.price.is_some_and(|p| p < 0) {
            return Err(StoreError::Validation("price must be non-negative".to_string()));
        }

        let mut resources = lock(&self.resources);
        let record = resources
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("resource {id}")))?;

        if patch.price.is_some() && record.status == ResourceStatus::Assigned {
            return Err(StoreError::Conflict(format!(
                "resource {id} is sold; its price is frozen"
            )));
        }

        if let Some(region) = patch.region {
            record.region = region;
        }
        if let Some(emoji) = patch.region_emoji {
            record.region_emoji = Some(emoji);
        }
        if let Some(tier) = patch.tier {
            record.tier = tier;
        }
        if let Some(months) = patch.premium_months {
            record.premium_months = Some(months);
        }
        if let Some(price) = patch.price {
            // An explicit price replaces any bulk-discount baseline.
            record.price = Some(price);
            record.base_price = None;
        }
        if let Some(secret) = patch.secret {
            record.secret = Some(secret);
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete(&self, id: ResourceId) -> Result<bool, StoreError> {
        Ok(lock(&self.resources).remove(&id).is_some())
    }

    async fn claim_cheapest(
        &self,
        filter: &CategoryFilter,
        max_price: i64,
        claim: &Claim,
    ) -> Result<Option<ResourceRecord>, StoreError> {
        Ok(self.claim_first(
            |r| filter.matches(r) && r.price.is_some_and(|p| p <= max_price),
            |r| (r.price.unwrap_or(i64::MAX), r.created_at, r.id),
            claim,
        ))
    }

    async fn claim_in_group(
        &self,
        filter: &CategoryFilter,
        price: i64,
        claim: &Claim,
    ) -> Result<Option<ResourceRecord>, StoreError> {
        Ok(self.claim_first(
            |r| filter.matches_group(r) && r.price == Some(price),
            |r| (0, r.created_at, r.id),
            claim,
        ))
    }

    async fn claim_by_id(
        &self,
        id: ResourceId,
        claim: &Claim,
    ) -> Result<Option<ResourceRecord>, StoreError> {
        let mut resources = lock(&self.resources);
        match resources.get_mut(&id) {
            Some(record) if record.is_available() => {
                record.apply_claim(claim);
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_claim(&self, id: ResourceId, attempt: Uuid) -> Result<bool, StoreError> {
        let mut resources = lock(&self.resources);
        match resources.get_mut(&id) {
            Some(record)
                if record.status == ResourceStatus::Assigned && record.claim == Some(attempt) =>
            {
                record.revert_claim(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_sold_reported(&self, id: ResourceId) -> Result<bool, StoreError> {
        let mut resources = lock(&self.resources);
        let record = resources
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("resource {id}")))?;
        if record.sold_reported {
            return Ok(false);
        }
        record.sold_reported = true;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn apply_bulk_discount(&self, percent: u8) -> Result<usize, StoreError> {
        let percent = percent.min(MAX_BULK_DISCOUNT);
        let now = Utc::now();
        let mut repriced = 0;
        for record in lock(&self.resources).values_mut() {
            if !record.is_available() {
                continue;
            }
            if record.base_price.is_none() {
                record.base_price = record.price;
            }
            if let Some(base) = record.base_price {
                record.price = Some(discounted_price(base, percent));
                record.updated_at = now;
                repriced += 1;
            }
        }
        Ok(repriced)
    }

    async fn reset_bulk_discount(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut restored = 0;
        for record in lock(&self.resources).values_mut() {
            if !record.is_available() {
                continue;
            }
            if let Some(base) = record.base_price.take() {
                record.price = Some(base);
                record.updated_at = now;
                restored += 1;
            }
        }
        Ok(restored)
    }
}

#[async_trait]
impl BalanceLedger for MemoryStore {
    async fn ensure_account(
        &self,
        user: UserId,
        display_name: Option<&str>,
    ) -> Result<UserAccount, StoreError> {
        let now = Utc::now();
        let mut account = self
            .accounts
            .entry(user)
            .or_insert_with(|| UserAccount::new(user, None, now));
        if let Some(name) = display_name {
            account.display_name = Some(name.to_string());
            account.updated_at = now;
        }
        Ok(account.clone())
    }

    async fn account(&self, user: UserId) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.accounts.get(&user).map(|a| a.clone()))
    }

    async fn try_debit(&self, user: UserId, amount: i64) -> Result<bool, StoreError> {
        if amount < 0 {
            return Err(StoreError::Validation("debit must be non-negative".to_string()));
        }
        let debited = match self.accounts.get_mut(&user) {
            Some(mut account) if account.balance >= amount => {
                account.balance -= amount;
                account.updated_at = Utc::now();
                true
            }
            _ => false,
        };
        if debited {
            self.log_adjustment(user, -amount, AdjustmentKind::Purchase, None);
        }
        Ok(debited)
    }

    async fn refund(&self, user: UserId, amount: i64) -> Result<UserAccount, StoreError> {
        if amount < 0 {
            return Err(StoreError::Validation("refund must be non-negative".to_string()));
        }
        let account = {
            let mut account = self
                .accounts
                .get_mut(&user)
                .ok_or_else(|| StoreError::NotFound(format!("user {user}")))?;
            account.balance = account
                .balance
                .checked_add(amount)
                .ok_or_else(|| StoreError::Validation("balance overflow".to_string()))?;
            account.updated_at = Utc::now();
            account.clone()
        };
        self.log_adjustment(user, amount, AdjustmentKind::Refund, None);
        Ok(account)
    }

    async fn grant(
        &self,
        user: UserId,
        amount: i64,
        by_admin: UserId,
    ) -> Result<UserAccount, StoreError> {
        let now = Utc::now();
        let account = {
            let mut account = self
                .accounts
                .entry(user)
                .or_insert_with(|| UserAccount::new(user, None, now));
            let balance = account
                .balance
                .checked_add(amount)
                .ok_or_else(|| StoreError::Validation("balance overflow".to_string()))?;
            if balance < 0 {
                return Err(StoreError::InsufficientFunds(user));
            }
            account.balance = balance;
            account.updated_at = now;
            account.clone()
        };
        self.log_adjustment(user, amount, AdjustmentKind::Grant, Some(by_admin));
        Ok(account)
    }

    async fn set(
        &self,
        user: UserId,
        amount: i64,
        by_admin: UserId,
    ) -> Result<UserAccount, StoreError> {
        if amount < 0 {
            return Err(StoreError::Validation("balance must be non-negative".to_string()));
        }
        let now = Utc::now();
        let account = {
            let mut account = self
                .accounts
                .entry(user)
                .or_insert_with(|| UserAccount::new(user, None, now));
            account.balance = amount;
            account.updated_at = now;
            account.clone()
        };
        self.log_adjustment(user, amount, AdjustmentKind::Set, Some(by_admin));
        Ok(account)
    }

    async fn adjustments(&self, user: UserId) -> Result<Vec<CreditAdjustment>, StoreError> {
        Ok(lock(&self.adjustments)
            .iter()
            .filter(|a| a.user_id == user)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TokenLedger for MemoryStore {
    async fn count(&self, user: UserId) -> Result<u32, StoreError> {
        Ok(self.tokens.get(&user).map(|t| *t).unwrap_or(0))
    }

    async fn reserve(&self, user: UserId) -> Result<bool, StoreError> {
        match self.tokens.get_mut(&user) {
            Some(mut tokens) if *tokens >= 1 => {
                *tokens -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, user: UserId) -> Result<(), StoreError> {
        let mut tokens = self.tokens.entry(user).or_insert(0);
        *tokens = tokens.saturating_add(1);
        Ok(())
    }

    async fn grant(&self, user: UserId, delta: i64) -> Result<u32, StoreError> {
        let mut tokens = self.tokens.entry(user).or_insert(0);
        let next = i64::from(*tokens)
            .checked_add(delta)
            .and_then(|next| u32::try_from(next).ok())
            .ok_or_else(|| {
                StoreError::Validation(format!("token delta {delta} out of range for {}", *tokens))
            })?;
        *tokens = next;
        Ok(next)
    }

    async fn set(&self, user: UserId, tokens: u32) -> Result<u32, StoreError> {
        self.tokens.insert(user, tokens);
        Ok(tokens)
    }
}

#[async_trait]
impl PurchaseLog for MemoryStore {
    async fn append(&self, record: PurchaseRecord) -> Result<(), StoreError> {
        lock(&self.purchases).push(record);
        Ok(())
    }

    async fn for_user(&self, user: UserId) -> Result<Vec<PurchaseRecord>, StoreError> {
        let mut records: Vec<PurchaseRecord> = lock(&self.purchases)
            .iter()
            .filter(|p| p.user_id == user)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
