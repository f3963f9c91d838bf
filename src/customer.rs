//! Customer records and identity anchors.
//!
//! A `Customer` is the deduplicated real-world visitor every click, lead and
//! event attaches to. Identity resolution either finds one or creates one;
//! two customers are never merged automatically.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bundle::ResolveContext;
use crate::error::ValidationError;
use crate::interaction::Attribution;
use crate::value::Value;

/// Globally unique, stable customer identifier.
///
/// # Examples
///
/// ```
/// use leadgraph::CustomerId;
///
/// let id = CustomerId::new();
/// assert!(!id.is_nil());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(Uuid);

impl CustomerId {
    /// Creates a new random customer ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a customer ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns true if this is a nil (all zeros) UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for CustomerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CustomerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for CustomerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Fills `slot` with `candidate` only when the slot is empty.
///
/// Returns true if the slot changed.
pub(crate) fn fill_empty(slot: &mut Option<String>, candidate: Option<&str>) -> bool {
    match (slot.as_ref(), candidate) {
        (None, Some(v)) if !v.trim().is_empty() => {
            *slot = Some(v.trim().to_string());
            true
        }
        _ => false,
    }
}

/// A deduplicated visitor or lead.
///
/// Counters are only ever increased through the `record_*` methods, so they
/// stay monotonic for as long as the record exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    /// Globally unique identifier
    pub id: CustomerId,

    /// Canonical email; set once, never overwritten.
    pub master_email: Option<String>,
    /// Canonical phone; set once, never overwritten.
    pub master_phone: Option<String>,

    /// Given name.
    pub first_name: Option<String>,
    /// Family name.
    pub last_name: Option<String>,
    /// Country code or name.
    pub country: Option<String>,
    /// State or region.
    pub region: Option<String>,
    /// City.
    pub city: Option<String>,
    /// Preferred language.
    pub language: Option<String>,

    /// First-touch attribution.
    pub source: Option<String>,
    /// First-touch medium.
    pub medium: Option<String>,
    /// First-touch campaign.
    pub campaign: Option<String>,

    /// Clicks recorded.
    pub total_clicks: u64,
    /// Leads recorded.
    pub total_leads: u64,
    /// Events recorded.
    pub total_events: u64,
    /// Sum of lead and event revenue.
    pub total_revenue: f64,

    /// Earliest interaction.
    pub first_seen: DateTime<Utc>,
    /// Latest resolution.
    pub last_seen: DateTime<Utc>,

    /// Free-form fields.
    #[serde(default)]
    pub custom_fields: BTreeMap<String, Value>,

    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row last changed.
    pub updated_at: DateTime<Utc>,

    /// Bumped on every modification.
    pub version: u64,
}

impl Customer {
    /// Creates an empty customer first seen at `now`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::Utc;
    /// use leadgraph::Customer;
    ///
    /// let customer = Customer::new(Utc::now());
    /// assert_eq!(customer.version, 1);
    /// assert_eq!(customer.total_clicks, 0);
    /// ```
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_id(CustomerId::new(), now)
    }

    /// Creates a customer with a specific ID.
    #[must_use]
    pub fn with_id(id: CustomerId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            master_email: None,
            master_phone: None,
            first_name: None,
            last_name: None,
            country: None,
            region: None,
            city: None,
            language: None,
            source: None,
            medium: None,
            campaign: None,
            total_clicks: 0,
            total_leads: 0,
            total_events: 0,
            total_revenue: 0.0,
            first_seen: now,
            last_seen: now,
            custom_fields: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Sets the master email if none is recorded yet.
    pub fn fill_master_email(&mut self, email: &str) -> bool {
        fill_empty(&mut self.master_email, Some(email))
    }

    /// Sets the master phone if none is recorded yet.
    pub fn fill_master_phone(&mut self, phone: &str) -> bool {
        fill_empty(&mut self.master_phone, Some(phone))
    }

    /// Copies context fields into currently-empty customer fields.
    ///
    /// Returns the number of fields that changed.
    pub fn enrich(&mut self, context: &ResolveContext) -> usize {
        [
            fill_empty(&mut self.first_name, context.first_name.as_deref()),
            fill_empty(&mut self.last_name, context.last_name.as_deref()),
            fill_empty(&mut self.country, context.country.as_deref()),
            fill_empty(&mut self.region, context.region.as_deref()),
            fill_empty(&mut self.city, context.city.as_deref()),
            fill_empty(&mut self.language, context.language.as_deref()),
            fill_empty(&mut self.source, context.source.as_deref()),
            fill_empty(&mut self.medium, context.medium.as_deref()),
            fill_empty(&mut self.campaign, context.campaign.as_deref()),
        ]
        .into_iter()
        .filter(|changed| *changed)
        .count()
            + self.fill_custom_fields(&context.custom_fields)
    }

    /// Fills first-touch attribution from an interaction.
    pub fn attribute(&mut self, attribution: &Attribution) {
        fill_empty(&mut self.source, attribution.source.as_deref());
        fill_empty(&mut self.medium, attribution.medium.as_deref());
        fill_empty(&mut self.campaign, attribution.campaign.as_deref());
    }

    fn fill_custom_fields(&mut self, fields: &BTreeMap<String, Value>) -> usize {
        let mut changed = 0;
        for (key, value) in fields {
            if !self.custom_fields.contains_key(key) {
                self.custom_fields.insert(key.clone(), value.clone());
                changed += 1;
            }
        }
        changed
    }

    /// Moves `last_seen` forward; never backwards.
    pub fn observe(&mut self, at: DateTime<Utc>) {
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    /// Counts one click.
    pub fn record_click(&mut self) {
        self.total_clicks = self.total_clicks.saturating_add(1);
    }

    /// Counts one lead and its revenue.
    pub fn record_lead(&mut self, revenue: Option<f64>) -> Result<(), ValidationError> {
        let revenue = checked_revenue(revenue)?;
        self.total_leads = self.total_leads.saturating_add(1);
        self.total_revenue += revenue;
        Ok(())
    }

    /// Counts one event and its revenue.
    pub fn record_event(&mut self, revenue: Option<f64>) -> Result<(), ValidationError> {
        let revenue = checked_revenue(revenue)?;
        self.total_events = self.total_events.saturating_add(1);
        self.total_revenue += revenue;
        Ok(())
    }

    /// Returns a display name from first and last name, if any.
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(f), Some(l)) => Some(format!("{f} {l}")),
            (Some(n), None) | (None, Some(n)) => Some(n.to_string()),
            (None, None) => None,
        }
    }

    /// Returns true if the customer has no email or phone on record.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.master_email.is_none() && self.master_phone.is_none()
    }
}

/// Rejects revenue that would break counter monotonicity.
pub(crate) fn checked_revenue(revenue: Option<f64>) -> Result<f64, ValidationError> {
    match revenue {
        None => Ok(0.0),
        Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
        Some(v) => Err(ValidationError::InvalidRevenue { value: v }),
    }
}

impl PartialEq for Customer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Customer {}

impl std::hash::Hash for Customer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
