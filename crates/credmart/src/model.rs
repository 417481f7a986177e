//! Marketplace records: resources, user accounts, ledger entries and purchases.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User identifiers come from the external messaging platform.
pub type UserId = i64;

/// Unique identifier for a resource record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Available,
    Assigned,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Assigned => "assigned",
        }
    }
}

/// Material needed to open a live session for a resource.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub api_id: i64,
    pub api_hash: String,
    pub session: String,
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("api_id", &self.api_id)
            .field("api_hash", &"<redacted>")
            .field("session", &"<redacted>")
            .finish()
    }
}

/// Category selection for a purchase. In a category purchase `tier: None`
/// matches any tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFilter {
    pub region: String,
    #[serde(default)]
    pub tier: Option<String>,
}

impl CategoryFilter {
    pub fn new(region: impl Into<String>, tier: Option<String>) -> Self {
        Self {
            region: region.into(),
            tier,
        }
    }

    pub fn matches(&self, record: &ResourceRecord) -> bool {
        record.region == self.region
            && self.tier.as_ref().is_none_or(|tier| &record.tier == tier)
    }

    /// Exact group membership. Every record has a tier, so a filter without
    /// one names no group.
    pub fn matches_group(&self, record: &ResourceRecord) -> bool {
        record.region == self.region && self.tier.as_deref() == Some(record.tier.as_str())
    }
}

/// A sellable credential unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    /// Public identifier of the credential (digits only).
    pub identifier: String,
    pub region: String,
    #[serde(default)]
    pub region_emoji: Option<String>,
    pub tier: String,
    #[serde(default)]
    pub premium_months: Option<u32>,
    pub price: Option<i64>,
    /// Price before a bulk discount was applied.
    #[serde(default)]
    pub base_price: Option<i64>,
    pub status: ResourceStatus,
    pub owner: Option<UserId>,
    pub owner_name: Option<String>,
    /// Fallback password handed to the buyer.
    #[serde(default)]
    pub secret: Option<String>,
    pub credentials: SessionCredentials,
    /// Purchase attempt currently holding the record.
    #[serde(default)]
    pub claim: Option<Uuid>,
    #[serde(default)]
    pub sold_reported: bool,
    pub added_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
}

impl ResourceRecord {
    pub fn from_new(new: NewResource, now: DateTime<Utc>) -> Self {
        Self {
            id: ResourceId::new(),
            identifier: new.identifier,
            region: new.region,
            region_emoji: new.region_emoji,
            tier: new.tier,
            premium_months: new.premium_months,
            price: new.price,
            base_price: None,
            status: ResourceStatus::Available,
            owner: None,
            owner_name: None,
            secret: new.secret,
            credentials: new.credentials,
            claim: None,
            sold_reported: false,
            added_by: new.added_by,
            created_at: now,
            updated_at: now,
            assigned_at: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == ResourceStatus::Available
    }

    /// Human-readable category, e.g. "🇮🇳 India · 2019".
    pub fn category_label(&self) -> String {
        let tier = match (self.tier.as_str(), self.premium_months) {
            ("premium", Some(months)) => format!("premium ({months}m)"),
            (tier, _) => tier.to_string(),
        };
        match self.region_emoji.as_deref() {
            Some(emoji) if !emoji.is_empty() => format!("{emoji} {} · {tier}", self.region),
            _ => format!("{} · {tier}", self.region),
        }
    }

    /// Fields safe to hand to the presentation layer (no session material).
    pub fn to_public(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "identifier": self.identifier,
            "region": self.region,
            "region_emoji": self.region_emoji,
            "tier": self.tier,
            "premium_months": self.premium_months,
            "price": self.price,
            "status": self.status.as_str(),
            "owner": self.owner,
        })
    }

    pub(crate) fn apply_claim(&mut self, claim: &Claim) {
        self.status = ResourceStatus::Assigned;
        self.owner = Some(claim.owner);
        self.owner_name = claim.owner_name.clone();
        self.claim = Some(claim.attempt);
        self.assigned_at = Some(claim.at);
        self.updated_at = claim.at;
    }

    pub(crate) fn revert_claim(&mut self, now: DateTime<Utc>) {
        self.status = ResourceStatus::Available;
        self.owner = None;
        self.owner_name = None;
        self.claim = None;
        self.assigned_at = None;
        self.updated_at = now;
    }
}

/// Input for provisioning a new resource record.
#[derive(Debug, Clone, Deserialize)]
pub struct NewResource {
    pub identifier: String,
    pub region: String,
    #[serde(default)]
    pub region_emoji: Option<String>,
    pub tier: String,
    #[serde(default)]
    pub premium_months: Option<u32>,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub secret: Option<String>,
    pub credentials: SessionCredentials,
    pub added_by: UserId,
}

/// Partial edit of a resource record. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourcePatch {
    pub region: Option<String>,
    pub region_emoji: Option<String>,
    pub tier: Option<String>,
    pub premium_months: Option<u32>,
    pub price: Option<i64>,
    pub secret: Option<String>,
}

impl ResourcePatch {
    pub fn is_empty(&self) -> bool {
        self.region.is_none()
            && self.region_emoji.is_none()
            && self.tier.is_none()
            && self.premium_months.is_none()
            && self.price.is_none()
            && self.secret.is_none()
    }
}

/// Marks a record as held by one purchase attempt.
#[derive(Debug, Clone)]
pub struct Claim {
    pub attempt: Uuid,
    pub owner: UserId,
    pub owner_name: Option<String>,
    pub at: DateTime<Utc>,
}

impl Claim {
    pub fn new(owner: UserId, owner_name: Option<String>) -> Self {
        Self {
            attempt: Uuid::new_v4(),
            owner,
            owner_name,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    #[serde(default)]
    pub display_name: Option<String>,
    pub balance: i64,
    #[serde(default)]
    pub referrer: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(user_id: UserId, display_name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            display_name,
            balance: 0,
            referrer: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentKind {
    Grant,
    Set,
    Purchase,
    Refund,
}

/// Append-only balance adjustment entry. For `Set`, `amount` is the new balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditAdjustment {
    pub user_id: UserId,
    pub amount: i64,
    pub kind: AdjustmentKind,
    #[serde(default)]
    pub by_admin: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

/// Immutable settlement record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub resource_id: ResourceId,
    /// Amount actually charged.
    pub price: i64,
    pub original_price: i64,
    pub discount_used: bool,
    pub identifier: String,
    pub region: String,
    pub tier: String,
    pub created_at: DateTime<Utc>,
}

/// Mask an identifier as `+12••••••34`, keeping the first and last two digits.
pub fn mask_identifier(identifier: &str) -> String {
    let digits: String = identifier.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() <= 4 {
        return format!("+{digits}");
    }
    let hidden = "•".repeat(digits.len() - 4);
    format!("+{}{hidden}{}", &digits[..2], &digits[digits.len() - 2..])
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_id_round_trips_through_display() {
        let id = ResourceId::new();
        let parsed: ResourceId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<ResourceId>().is_err());
    }

    #[test]
    fn mask_keeps_first_and_last_two_digits() {
        assert_eq!(mask_identifier("919876543244"), "+91••••••••44");
        assert_eq!(mask_identifier("+1 (555) 01"), "+15••••01");
        assert_eq!(mask_identifier("1234"), "+1234");
        assert_eq!(mask_identifier(""), "+");
    }

    #[test]
    fn filter_without_tier_matches_any_tier() {
        let record = ResourceRecord::from_new(
            fixtures::new_resource("100", "India", "2019", Some(10)),
            Utc::now(),
        );
        assert!(CategoryFilter::new("India", None).matches(&record));
        assert!(CategoryFilter::new("India", Some("2019".into())).matches(&record));
        assert!(!CategoryFilter::new("India", Some("2020".into())).matches(&record));
        assert!(!CategoryFilter::new("Brazil", None).matches(&record));
    }

    #[test]
    fn group_membership_needs_the_exact_tier() {
        let record = ResourceRecord::from_new(
            fixtures::new_resource("100", "India", "2019", Some(10)),
            Utc::now(),
        );
        assert!(CategoryFilter::new("India", Some("2019".into())).matches_group(&record));
        assert!(!CategoryFilter::new("India", None).matches_group(&record));
        assert!(!CategoryFilter::new("India", Some("2020".into())).matches_group(&record));
    }

    #[test]
    fn category_label_includes_premium_duration() {
        let mut new = fixtures::new_resource("100", "India", "premium", None);
        new.region_emoji = Some("🇮🇳".to_string());
        new.premium_months = Some(3);
        let record = ResourceRecord::from_new(new, Utc::now());
        assert_eq!(record.category_label(), "🇮🇳 India · premium (3m)");
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let debug = format!("{:?}", fixtures::credentials());
        assert!(!debug.contains("session-string"));
        assert!(debug.contains("1000"));
    }

    #[test]
    fn public_view_omits_session_material() {
        let record = ResourceRecord::from_new(
            fixtures::new_resource("100", "India", "2019", Some(10)),
            Utc::now(),
        );
        let public = record.to_public();
        assert!(public.get("credentials").is_none());
        assert_eq!(public["status"], "available");
    }
}
