//! Identifier bundles and resolution context.
//!
//! An ingestion endpoint maps its own payload onto an `IdentifierBundle`
//! (the identity signals) plus an optional `ResolveContext` (fields used
//! only to enrich empty customer fields).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::identifier::{IdentifierKey, IdentifierType};
use crate::value::Value;

/// Technical request context. Stored with interactions, never matched on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TechnicalContext {
    /// Client IP address.
    pub ip: Option<String>,
    /// Raw `User-Agent` header.
    pub user_agent: Option<String>,
}

/// The identity signals observed on one inbound interaction.
///
/// # Examples
///
/// ```
/// use leadgraph::IdentifierBundle;
///
/// let bundle = IdentifierBundle::new()
///     .email("Ada@Example.com")
///     .device_id("d-1");
/// assert!(!bundle.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IdentifierBundle {
    /// Email address as submitted.
    pub email: Option<String>,
    /// Phone number as submitted.
    pub phone: Option<String>,
    /// Ad click id (gclid, fbclid, ...).
    pub click_id: Option<String>,
    /// First-party device cookie.
    pub device_id: Option<String>,
    /// Browser session id.
    pub session_id: Option<String>,
    /// Browser fingerprint hash.
    pub fingerprint: Option<String>,
    /// IP and user agent of the request.
    #[serde(flatten)]
    pub technical: TechnicalContext,
}

impl IdentifierBundle {
    /// Creates an empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the email.
    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the phone number.
    #[must_use]
    pub fn phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Sets the ad click id.
    #[must_use]
    pub fn click_id(mut self, click_id: impl Into<String>) -> Self {
        self.click_id = Some(click_id.into());
        self
    }

    /// Sets the device id.
    #[must_use]
    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Sets the session id.
    #[must_use]
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the browser fingerprint.
    #[must_use]
    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Sets the client IP.
    #[must_use]
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.technical.ip = Some(ip.into());
        self
    }

    /// Sets the user agent.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.technical.user_agent = Some(user_agent.into());
        self
    }

    /// Raw value for a given identifier type.
    #[must_use]
    pub fn raw(&self, identifier_type: IdentifierType) -> Option<&str> {
        match identifier_type {
            IdentifierType::Email => self.email.as_deref(),
            IdentifierType::Phone => self.phone.as_deref(),
            IdentifierType::ClickId => self.click_id.as_deref(),
            IdentifierType::DeviceId => self.device_id.as_deref(),
            IdentifierType::SessionId => self.session_id.as_deref(),
            IdentifierType::Fingerprint => self.fingerprint.as_deref(),
        }
    }

    /// Returns true if no identifier survives normalization.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        IdentifierType::ALL
            .iter()
            .all(|t| self.raw(*t).and_then(|v| t.normalize(v)).is_none())
    }

    /// Normalizes the bundle into claims, in trust order.
    ///
    /// # Errors
    ///
    /// - `EmptyBundle` if nothing usable remains
    /// - `FieldTooLong` if a normalized value exceeds `max_length`
    pub fn claims(&self, max_length: usize) -> Result<Claims, ValidationError> {
        let mut keys = Vec::with_capacity(IdentifierType::ALL.len());
        for identifier_type in IdentifierType::ALL {
            let Some(value) = self.raw(identifier_type).and_then(|v| identifier_type.normalize(v))
            else {
                continue;
            };
            if value.chars().count() > max_length {
                return Err(ValidationError::FieldTooLong {
                    field: identifier_type.as_str().to_ascii_lowercase(),
                    max_length,
                });
            }
            keys.push(IdentifierKey::new(identifier_type, value));
        }

        if keys.is_empty() {
            return Err(ValidationError::EmptyBundle);
        }
        Ok(Claims { keys })
    }
}

/// Normalized, validated identifier claims from one bundle.
///
/// At most one value per type, ordered strongest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    keys: Vec<IdentifierKey>,
}

impl Claims {
    /// Value for a type, if present.
    #[must_use]
    pub fn get(&self, identifier_type: IdentifierType) -> Option<&str> {
        self.keys
            .iter()
            .find(|k| k.identifier_type == identifier_type)
            .map(|k| k.value.as_str())
    }

    /// True if a value for the type is present.
    #[must_use]
    pub fn contains(&self, identifier_type: IdentifierType) -> bool {
        self.get(identifier_type).is_some()
    }

    /// Claims restricted to the given types, in the order of `types`.
    #[must_use]
    pub fn select(&self, types: &[IdentifierType]) -> Vec<(IdentifierType, String)> {
        types
            .iter()
            .filter_map(|t| self.get(*t).map(|v| (*t, v.to_string())))
            .collect()
    }

    /// All claims in trust order.
    pub fn iter(&self) -> impl Iterator<Item = &IdentifierKey> {
        self.keys.iter()
    }

    /// Number of claims.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if there are no claims.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Demographic and attribution fields used to fill empty customer fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolveContext {
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
    /// Traffic source.
    pub source: Option<String>,
    /// Traffic medium.
    pub medium: Option<String>,
    /// Campaign name.
    pub campaign: Option<String>,
    /// Free-form fields; existing keys are kept.
    pub custom_fields: BTreeMap<String, Value>,
}

impl ResolveContext {
    /// Returns true if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Hashes browser characteristics into a stable fingerprint value.
///
/// Parts are length-prefixed before hashing so `["ab", "c"]` and
/// `["a", "bc"]` do not collide.
///
/// # Examples
///
/// ```
/// use leadgraph::bundle::fingerprint_hash;
///
/// let a = fingerprint_hash(&["Mozilla/5.0", "1920x1080", "Europe/Lisbon"]);
/// let b = fingerprint_hash(&["Mozilla/5.0", "1920x1080", "Europe/Lisbon"]);
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
#[must_use]
pub fn fingerprint_hash(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_bundle_rejected() {
        let err = IdentifierBundle::new().claims(512).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyBundle));
    }

    #[test]
    fn test_blank_values_count_as_empty() {
        let bundle = IdentifierBundle::new().email("  ").phone("--").ip("10.0.0.1");
        assert!(bundle.is_empty());
        assert!(bundle.claims(512).is_err());
    }

    #[test]
    fn test_claims_in_trust_order() {
        let bundle = IdentifierBundle::new()
            .session_id("s1")
            .fingerprint("fp")
            .email("A@x.com")
            .click_id("c1");
        let claims = bundle.claims(512).unwrap();
        let order: Vec<_> = claims.iter().map(|k| k.identifier_type).collect();
        assert_eq!(
            order,
            vec![
                IdentifierType::Email,
                IdentifierType::ClickId,
                IdentifierType::SessionId,
                IdentifierType::Fingerprint,
            ]
        );
        assert_eq!(claims.get(IdentifierType::Email), Some("a@x.com"));
    }

    #[test]
    fn test_select_keeps_requested_order() {
        let bundle = IdentifierBundle::new().device_id("d1").click_id("c1");
        let claims = bundle.claims(512).unwrap();
        let weak = claims.select(&[
            IdentifierType::ClickId,
            IdentifierType::DeviceId,
            IdentifierType::SessionId,
        ]);
        assert_eq!(
            weak,
            vec![
                (IdentifierType::ClickId, "c1".to_string()),
                (IdentifierType::DeviceId, "d1".to_string()),
            ]
        );
    }

    #[test]
    fn test_field_too_long() {
        let bundle = IdentifierBundle::new().device_id("x".repeat(20));
        let err = bundle.claims(16).unwrap_err();
        assert!(matches!(err, ValidationError::FieldTooLong { max_length: 16, .. }));
    }

    #[test]
    fn test_bundle_deserializes_camel_case() {
        let bundle: IdentifierBundle = serde_json::from_str(
            r#"{"email": "a@x.com", "deviceId": "d1", "userAgent": "curl/8"}"#,
        )
        .unwrap();
        assert_eq!(bundle.device_id.as_deref(), Some("d1"));
        assert_eq!(bundle.technical.user_agent.as_deref(), Some("curl/8"));
    }

    #[test]
    fn test_fingerprint_parts_are_delimited() {
        assert_ne!(fingerprint_hash(&["ab", "c"]), fingerprint_hash(&["a", "bc"]));
    }

    #[test]
    fn test_context_is_empty() {
        assert!(ResolveContext::default().is_empty());
        let ctx = ResolveContext {
            city: Some("Lisbon".to_string()),
            ..ResolveContext::default()
        };
        assert!(!ctx.is_empty());
    }
}
