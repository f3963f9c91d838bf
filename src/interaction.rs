//! Interaction records: clicks, leads and events.
//!
//! Each interaction is owned by exactly one customer. Resolution exists so
//! that every one of these rows lands on the right customer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bundle::TechnicalContext;
use crate::customer::CustomerId;
use crate::value::Value;

/// Unique identifier for an interaction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InteractionId(Uuid);

impl InteractionId {
    /// Creates a new random interaction ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InteractionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InteractionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Campaign attribution carried by every interaction (UTM-style).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Attribution {
    /// `utm_source`.
    pub source: Option<String>,
    /// `utm_medium`.
    pub medium: Option<String>,
    /// `utm_campaign`.
    pub campaign: Option<String>,
    /// `utm_term`.
    pub term: Option<String>,
    /// `utm_content`.
    pub content: Option<String>,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InteractionKind {
    /// An ad or link click landing on a tracked page.
    Click {
        /// Ad click id, if any.
        click_id: Option<String>,
        /// Landing page.
        landing_url: Option<String>,
        /// Referring URL.
        referrer: Option<String>,
    },
    /// A form submission.
    Lead {
        /// Form name or id.
        form: Option<String>,
        /// Attributed revenue.
        revenue: Option<f64>,
    },
    /// A named behavioral event.
    Event {
        /// Event name.
        name: String,
        /// Event properties.
        #[serde(default)]
        properties: BTreeMap<String, Value>,
        /// Attributed revenue.
        revenue: Option<f64>,
    },
}

impl InteractionKind {
    /// Short label (`click`, `lead`, `event`).
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Lead { .. } => "lead",
            Self::Event { .. } => "event",
        }
    }

    /// Revenue attached to this interaction, if any.
    #[must_use]
    pub const fn revenue(&self) -> Option<f64> {
        match self {
            Self::Click { .. } => None,
            Self::Lead { revenue, .. } | Self::Event { revenue, .. } => *revenue,
        }
    }
}

/// A persisted click, lead or event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    /// Row id.
    pub id: InteractionId,
    /// Resolved customer.
    pub customer_id: CustomerId,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
    /// Campaign parameters.
    #[serde(default)]
    pub attribution: Attribution,
    /// IP and user agent.
    #[serde(default)]
    pub technical: TechnicalContext,
    /// Click, lead or event payload.
    #[serde(flatten)]
    pub kind: InteractionKind,
}

impl Interaction {
    /// Creates an interaction with a fresh id.
    #[must_use]
    pub fn new(
        customer_id: CustomerId,
        kind: InteractionKind,
        attribution: Attribution,
        technical: TechnicalContext,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: InteractionId::new(),
            customer_id,
            occurred_at,
            attribution,
            technical,
            kind,
        }
    }

    /// True for a click.
    #[must_use]
    pub const fn is_click(&self) -> bool {
        matches!(self.kind, InteractionKind::Click { .. })
    }

    /// True for a lead.
    #[must_use]
    pub const fn is_lead(&self) -> bool {
        matches!(self.kind, InteractionKind::Lead { .. })
    }

    /// True for an event.
    #[must_use]
    pub const fn is_event(&self) -> bool {
        matches!(self.kind, InteractionKind::Event { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        let click = InteractionKind::Click {
            click_id: None,
            landing_url: None,
            referrer: None,
        };
        assert_eq!(click.label(), "click");
        assert_eq!(click.revenue(), None);

        let lead = InteractionKind::Lead {
            form: Some("signup".to_string()),
            revenue: Some(10.0),
        };
        assert_eq!(lead.revenue(), Some(10.0));
    }

    #[test]
    fn test_interaction_json_shape() {
        let interaction = Interaction::new(
            CustomerId::new(),
            InteractionKind::Event {
                name: "purchase".to_string(),
                properties: BTreeMap::from([("sku".to_string(), Value::from("A-1"))]),
                revenue: Some(99.5),
            },
            Attribution::default(),
            TechnicalContext::default(),
            Utc::now(),
        );

        let json = serde_json::to_value(&interaction).unwrap();
        assert_eq!(json["kind"], "event");
        assert_eq!(json["name"], "purchase");
        assert_eq!(json["properties"]["sku"], "A-1");

        let back: Interaction = serde_json::from_value(json).unwrap();
        assert!(back.is_event());
        assert_eq!(back.id, interaction.id);
    }
}
