//! Common types used across Meterflow

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime, UtcOffset};

use crate::error::SharedError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Subscriber ID wrapper
///
/// Subscribers are identified by the opaque account id the request layer
/// authenticates, so this wraps a string rather than a UUID.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    /// Create a subscriber id, rejecting empty values and values containing
    /// the `:` key separator used by the counter store.
    pub fn parse(raw: &str) -> Result<Self, SharedError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.contains(':') {
            return Err(SharedError::InvalidSubscriberId(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SubscriberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for SubscriberId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Plans
// =============================================================================

/// Plan tier for billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Starter,
    Professional,
    Enterprise,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Free
    }
}

impl PlanTier {
    pub const ALL: [PlanTier; 4] = [
        PlanTier::Free,
        PlanTier::Starter,
        PlanTier::Professional,
        PlanTier::Enterprise,
    ];

    /// Ordering used to tell upgrades from downgrades
    pub fn rank(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Starter => 1,
            Self::Professional => 2,
            Self::Enterprise => 3,
        }
    }

    pub fn is_upgrade_from(&self, other: PlanTier) -> bool {
        self.rank() > other.rank()
    }

    /// Whether usage past the included limit is billed rather than refused
    pub fn bills_overage(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Starter => write!(f, "starter"),
            Self::Professional => write!(f, "professional"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl std::str::FromStr for PlanTier {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "professional" | "pro" => Ok(Self::Professional),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(SharedError::InvalidTier(s.to_string())),
        }
    }
}

/// Subscription status as tracked in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Trialing,
    Unpaid,
    Expired,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl SubscriptionStatus {
    /// Map a billing provider status string onto ours.
    ///
    /// Stripe reports `incomplete_expired` for subscriptions whose first
    /// payment never succeeded; those are treated as expired. A plain
    /// `incomplete` subscription has not started yet and counts as unpaid.
    pub fn from_provider(raw: &str) -> Result<Self, SharedError> {
        match raw {
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "trialing" => Ok(Self::Trialing),
            "unpaid" | "incomplete" | "paused" => Ok(Self::Unpaid),
            "incomplete_expired" | "expired" => Ok(Self::Expired),
            other => Err(SharedError::InvalidStatus(other.to_string())),
        }
    }

    /// Statuses under which paid-plan limits apply
    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::PastDue => write!(f, "past_due"),
            Self::Canceled => write!(f, "canceled"),
            Self::Trialing => write!(f, "trialing"),
            Self::Unpaid => write!(f, "unpaid"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

// =============================================================================
// Billing Periods
// =============================================================================

/// A calendar-month billing period in UTC, `[start, end)`.
///
/// Computed once per operation and passed through, so a request that lands
/// on a month boundary is attributed to exactly one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodKey {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl PeriodKey {
    /// The period containing `at`
    pub fn containing(at: OffsetDateTime) -> Self {
        let at = at.to_offset(UtcOffset::UTC);
        let first = at.date() - Duration::days(i64::from(at.day()) - 1);
        let days = time::util::days_in_year_month(first.year(), first.month());
        let next = first + Duration::days(i64::from(days));
        Self {
            start: first.midnight().assume_utc(),
            end: next.midnight().assume_utc(),
        }
    }

    pub fn current() -> Self {
        Self::containing(OffsetDateTime::now_utc())
    }

    pub fn previous(&self) -> Self {
        Self::containing(self.start - Duration::seconds(1))
    }

    pub fn next(&self) -> Self {
        Self::containing(self.end)
    }

    pub fn contains(&self, at: OffsetDateTime) -> bool {
        at >= self.start && at < self.end
    }

    /// Whether the period is over as of `now`
    pub fn has_ended(&self, now: OffsetDateTime) -> bool {
        now >= self.end
    }

    pub fn length(&self) -> Duration {
        self.end - self.start
    }

    /// Compact `YYYY-MM` form used in counter keys and logs
    pub fn key(&self) -> String {
        format!("{:04}-{:02}", self.start.year(), u8::from(self.start.month()))
    }

    /// Parse a `YYYY-MM` key
    pub fn parse(raw: &str) -> Result<Self, SharedError> {
        let invalid = || SharedError::InvalidPeriodKey(raw.to_string());
        let (year, month) = raw.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u8 = month.parse().map_err(|_| invalid())?;
        let month = Month::try_from(month).map_err(|_| invalid())?;
        let first = Date::from_calendar_date(year, month, 1).map_err(|_| invalid())?;
        Ok(Self::containing(first.midnight().assume_utc()))
    }
}

impl std::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

impl std::str::FromStr for PeriodKey {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = SharedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeriodKey> for String {
    fn from(period: PeriodKey) -> Self {
        period.key()
    }
}
