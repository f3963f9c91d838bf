//! Typed identifier claims.
//!
//! An `Identifier` links one raw value (email, phone, click id, device id,
//! session id or fingerprint hash) to exactly one customer. The pair
//! `(identifier_type, value)` is unique across the whole store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::customer::CustomerId;

/// Unique identifier for a stored identifier row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentifierId(Uuid);

impl IdentifierId {
    /// Creates a new random identifier ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for IdentifierId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdentifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of identity signal.
///
/// Variants are declared strongest first; `Ord` follows that trust order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentifierType {
    /// Email address
    Email,
    /// Phone number
    Phone,
    /// Ad-platform or tracking click id
    ClickId,
    /// Device id
    DeviceId,
    /// Browser session id
    SessionId,
    /// Browser fingerprint hash
    Fingerprint,
}

impl IdentifierType {
    /// All identifier types in trust order.
    pub const ALL: [Self; 6] = [
        Self::Email,
        Self::Phone,
        Self::ClickId,
        Self::DeviceId,
        Self::SessionId,
        Self::Fingerprint,
    ];

    /// Stable wire name (`EMAIL`, `CLICK_ID`, ...).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::ClickId => "CLICK_ID",
            Self::DeviceId => "DEVICE_ID",
            Self::SessionId => "SESSION_ID",
            Self::Fingerprint => "FINGERPRINT",
        }
    }

    /// Email and phone are contact identifiers; they can be primary and
    /// start unverified.
    #[must_use]
    pub const fn is_contact(&self) -> bool {
        matches!(self, Self::Email | Self::Phone)
    }

    /// Identifiers the system observed itself are verified on creation.
    #[must_use]
    pub const fn is_self_verified(&self) -> bool {
        !self.is_contact()
    }

    /// Normalizes a raw value for storage and lookup.
    ///
    /// Returns `None` if nothing usable remains.
    ///
    /// # Examples
    ///
    /// ```
    /// use leadgraph::IdentifierType;
    ///
    /// assert_eq!(IdentifierType::Email.normalize(" Ada@Example.COM "), Some("ada@example.com".to_string()));
    /// assert_eq!(IdentifierType::Phone.normalize("+1 (555) 010-9999"), Some("+15550109999".to_string()));
    /// assert_eq!(IdentifierType::DeviceId.normalize("   "), None);
    /// ```
    #[must_use]
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        let normalized = match self {
            Self::Email => trimmed.to_lowercase(),
            Self::Phone => normalize_phone(trimmed),
            Self::ClickId | Self::DeviceId | Self::SessionId | Self::Fingerprint => {
                trimmed.to_string()
            }
        };
        if normalized.is_empty() {
            None
        } else {
            Some(normalized)
        }
    }
}

fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return digits;
    }
    if raw.starts_with('+') {
        format!("+{digits}")
    } else {
        digits
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IdentifierType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == key)
            .ok_or_else(|| format!("unknown identifier type: {s}"))
    }
}

/// A single typed claim linking a value to a customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    /// Row id.
    pub id: IdentifierId,
    /// Owning customer.
    pub customer_id: CustomerId,
    /// Kind of identifier.
    pub identifier_type: IdentifierType,
    /// Normalized value.
    pub value: String,
    /// True for the customer's first email, or first phone when no email came with it.
    pub is_primary: bool,
    /// True once confirmed; weak identifiers start verified.
    pub is_verified: bool,
    /// When the claim was recorded.
    pub created_at: DateTime<Utc>,
    /// When the claim was verified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
}

impl Identifier {
    /// Creates a new claim. `value` is expected to be normalized already.
    #[must_use]
    pub fn new(
        customer_id: CustomerId,
        identifier_type: IdentifierType,
        value: impl Into<String>,
        is_primary: bool,
        is_verified: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: IdentifierId::new(),
            customer_id,
            identifier_type,
            value: value.into(),
            is_primary,
            is_verified,
            created_at: now,
            verified_at: is_verified.then_some(now),
        }
    }

    /// The `(type, value)` key this claim occupies.
    #[must_use]
    pub fn key(&self) -> IdentifierKey {
        IdentifierKey::new(self.identifier_type, self.value.clone())
    }

    /// Marks the claim verified. No-op if already verified.
    pub fn verify(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_verified {
            return false;
        }
        self.is_verified = true;
        self.verified_at = Some(at);
        true
    }
}

/// Globally unique `(type, value)` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentifierKey {
    /// Kind of identifier.
    pub identifier_type: IdentifierType,
    /// Normalized value.
    pub value: String,
}

impl IdentifierKey {
    /// Creates a key. `value` is taken as is.
    #[must_use]
    pub fn new(identifier_type: IdentifierType, value: impl Into<String>) -> Self {
        Self {
            identifier_type,
            value: value.into(),
        }
    }
}

impl fmt::Display for IdentifierKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identifier_type, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_display_and_parse() {
        assert_eq!(IdentifierType::ClickId.to_string(), "CLICK_ID");
        assert_eq!("device-id".parse::<IdentifierType>().unwrap(), IdentifierType::DeviceId);
        assert_eq!("email".parse::<IdentifierType>().unwrap(), IdentifierType::Email);
        assert!("twitter".parse::<IdentifierType>().is_err());
    }

    #[test]
    fn test_type_serde_name() {
        let json = serde_json::to_string(&IdentifierType::SessionId).unwrap();
        assert_eq!(json, "\"SESSION_ID\"");
    }

    #[test]
    fn test_trust_order() {
        assert!(IdentifierType::Email < IdentifierType::Phone);
        assert!(IdentifierType::Phone < IdentifierType::ClickId);
        assert!(IdentifierType::SessionId < IdentifierType::Fingerprint);
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(
            IdentifierType::Email.normalize("  A@X.com\n"),
            Some("a@x.com".to_string())
        );
        assert_eq!(IdentifierType::Email.normalize(""), None);
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(
            IdentifierType::Phone.normalize("555.010.9999"),
            Some("5550109999".to_string())
        );
        assert_eq!(
            IdentifierType::Phone.normalize("+44 20 7946 0000"),
            Some("+442079460000".to_string())
        );
        assert_eq!(IdentifierType::Phone.normalize("n/a"), None);
    }

    #[test]
    fn test_normalize_weak_ids_keep_case() {
        assert_eq!(
            IdentifierType::ClickId.normalize(" GcLiD-AbC "),
            Some("GcLiD-AbC".to_string())
        );
    }

    #[test]
    fn test_verification_defaults() {
        assert!(!IdentifierType::Email.is_self_verified());
        assert!(!IdentifierType::Phone.is_self_verified());
        assert!(IdentifierType::DeviceId.is_self_verified());
        assert!(IdentifierType::Fingerprint.is_self_verified());
    }

    #[test]
    fn test_identifier_verify() {
        let now = Utc::now();
        let mut ident = Identifier::new(CustomerId::new(), IdentifierType::Email, "a@x.com", true, false, now);
        assert!(ident.verified_at.is_none());
        assert!(ident.verify(now));
        assert!(ident.is_verified);
        assert!(!ident.verify(now));
    }

    #[test]
    fn test_key_display() {
        let key = IdentifierKey::new(IdentifierType::Phone, "+15550109999");
        assert_eq!(key.to_string(), "PHONE:+15550109999");
    }
}
