//! Ingestion service.
//!
//! The logic behind the click, lead and event endpoints: resolve the
//! visitor, persist the interaction, bump the customer's counters. Also the
//! customer-level reads and the cascading delete.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bundle::{IdentifierBundle, ResolveContext};
use crate::config::ResolverConfig;
use crate::customer::{checked_revenue, Customer, CustomerId};
use crate::error::{LeadGraphResult, ValidationError};
use crate::identifier::{Identifier, IdentifierType};
use crate::interaction::{Attribution, Interaction, InteractionKind};
use crate::resolver::IdentityResolver;
use crate::storage::{
    CustomerStore, IdentifierStore, InMemoryCustomerStore, InMemoryIdentifierStore,
    InMemoryInteractionStore, InteractionStore, StorageError,
};
use crate::value::Value;

/// A tracked click.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClickInput {
    /// Identity signals.
    pub identifiers: IdentifierBundle,
    /// Profile fields to fill if empty.
    pub context: Option<ResolveContext>,
    /// Campaign parameters.
    pub attribution: Attribution,
    /// Page the click landed on.
    pub landing_url: Option<String>,
    /// Referring URL.
    pub referrer: Option<String>,
    /// Event time; now if omitted.
    pub occurred_at: Option<DateTime<Utc>>,
}

/// A captured lead form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LeadInput {
    /// Identity signals.
    pub identifiers: IdentifierBundle,
    /// Profile fields to fill if empty.
    pub context: Option<ResolveContext>,
    /// Campaign parameters.
    pub attribution: Attribution,
    /// Form name or id.
    pub form: Option<String>,
    /// Revenue attributed to this interaction.
    pub revenue: Option<f64>,
    /// Event time; now if omitted.
    pub occurred_at: Option<DateTime<Utc>>,
}

/// A named behavioral event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventInput {
    /// Identity signals.
    pub identifiers: IdentifierBundle,
    /// Profile fields to fill if empty.
    pub context: Option<ResolveContext>,
    /// Campaign parameters.
    pub attribution: Attribution,
    /// Event name; must not be blank.
    pub name: String,
    /// Event properties.
    pub properties: std::collections::BTreeMap<String, Value>,
    /// Revenue attributed to this interaction.
    pub revenue: Option<f64>,
    /// Event time; now if omitted.
    pub occurred_at: Option<DateTime<Utc>>,
}

/// Any ingestible payload, tagged by `type`.
///
/// ```
/// use leadgraph::ingest::IngestPayload;
///
/// let line = r#"{"type":"lead","identifiers":{"email":"a@x.com"},"revenue":25.0}"#;
/// let payload: IngestPayload = serde_json::from_str(line).unwrap();
/// assert!(matches!(payload, IngestPayload::Lead(_)));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IngestPayload {
    /// A click.
    Click(ClickInput),
    /// A lead form.
    Lead(LeadInput),
    /// A custom event.
    Event(EventInput),
}

/// Result of ingesting one interaction.
#[derive(Debug, Clone)]
pub struct Ingested {
    /// Customer after counters were updated.
    pub customer: Customer,
    /// The persisted interaction.
    pub interaction: Interaction,
    /// True if the customer was created by this call.
    pub created: bool,
}

/// Ingestion and customer-level operations over a set of stores.
#[derive(Clone)]
pub struct IngestService {
    resolver: IdentityResolver,
    customers: Arc<dyn CustomerStore>,
    identifiers: Arc<dyn IdentifierStore>,
    interactions: Arc<dyn InteractionStore>,
}

impl IngestService {
    /// Create a service over explicit stores.
    #[must_use]
    pub fn new(
        customers: Arc<dyn CustomerStore>,
        identifiers: Arc<dyn IdentifierStore>,
        interactions: Arc<dyn InteractionStore>,
        config: ResolverConfig,
    ) -> Self {
        let resolver = IdentityResolver::with_config(customers.clone(), identifiers.clone(), config);
        Self {
            resolver,
            customers,
            identifiers,
            interactions,
        }
    }

    /// Service over fresh in-memory stores.
    #[must_use]
    pub fn in_memory(config: ResolverConfig) -> Self {
        Self::new(
            Arc::new(InMemoryCustomerStore::new()),
            Arc::new(InMemoryIdentifierStore::new()),
            Arc::new(InMemoryInteractionStore::new()),
            config,
        )
    }

    /// The resolver used for every ingestion.
    #[must_use]
    pub const fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Ingest a tagged payload.
    ///
    /// # Errors
    ///
    /// See [`Self::track_click`], [`Self::capture_lead`] and [`Self::track_event`].
    pub fn ingest(&self, payload: IngestPayload) -> LeadGraphResult<Ingested> {
        match payload {
            IngestPayload::Click(input) => self.track_click(input),
            IngestPayload::Lead(input) => self.capture_lead(input),
            IngestPayload::Event(input) => self.track_event(input),
        }
    }

    /// Record a click.
    ///
    /// # Errors
    ///
    /// Resolution errors (validation, conflict, storage).
    pub fn track_click(&self, input: ClickInput) -> LeadGraphResult<Ingested> {
        let kind = InteractionKind::Click {
            click_id: input.identifiers.click_id.clone(),
            landing_url: input.landing_url,
            referrer: input.referrer,
        };
        self.record(
            &input.identifiers,
            input.context.as_ref(),
            kind,
            input.attribution,
            input.occurred_at,
        )
    }

    /// Record a lead.
    ///
    /// # Errors
    ///
    /// `InvalidRevenue` for negative or non-finite revenue, plus resolution
    /// errors.
    pub fn capture_lead(&self, input: LeadInput) -> LeadGraphResult<Ingested> {
        let kind = InteractionKind::Lead {
            form: input.form,
            revenue: input.revenue,
        };
        self.record(
            &input.identifiers,
            input.context.as_ref(),
            kind,
            input.attribution,
            input.occurred_at,
        )
    }

    /// Record an event.
    ///
    /// # Errors
    ///
    /// `EmptyEventName`, `InvalidRevenue`, plus resolution errors.
    pub fn track_event(&self, input: EventInput) -> LeadGraphResult<Ingested> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyEventName.into());
        }
        let kind = InteractionKind::Event {
            name: name.to_string(),
            properties: input.properties,
            revenue: input.revenue,
        };
        self.record(
            &input.identifiers,
            input.context.as_ref(),
            kind,
            input.attribution,
            input.occurred_at,
        )
    }

    fn record(
        &self,
        bundle: &IdentifierBundle,
        context: Option<&ResolveContext>,
        kind: InteractionKind,
        attribution: Attribution,
        occurred_at: Option<DateTime<Utc>>,
    ) -> LeadGraphResult<Ingested> {
        // Reject bad revenue before a customer can be created for it.
        checked_revenue(kind.revenue())?;

        let resolution = self.resolver.resolve(bundle, context)?;
        let customer_id = resolution.customer.id;
        let occurred_at = occurred_at.unwrap_or_else(Utc::now);

        let interaction = Interaction::new(
            customer_id,
            kind,
            attribution,
            bundle.technical.clone(),
            occurred_at,
        );
        self.interactions.insert(interaction.clone())?;

        let mut counted = Ok(());
        let customer = self.customers.modify(customer_id, &mut |c: &mut Customer| {
            if occurred_at < c.first_seen {
                c.first_seen = occurred_at;
            }
            c.observe(occurred_at);
            c.attribute(&interaction.attribution);
            counted = match &interaction.kind {
                InteractionKind::Click { .. } => {
                    c.record_click();
                    Ok(())
                }
                InteractionKind::Lead { revenue, .. } => c.record_lead(*revenue),
                InteractionKind::Event { revenue, .. } => c.record_event(*revenue),
            };
        })?;
        counted?;

        debug!(
            customer_id = %customer_id,
            interaction_id = %interaction.id,
            kind = interaction.kind.label(),
            created = resolution.created,
            "ingested interaction"
        );

        Ok(Ingested {
            customer,
            interaction,
            created: resolution.created,
        })
    }

    /// Delete a customer with all of its identifiers and interactions.
    ///
    /// # Errors
    ///
    /// `CustomerNotFound` if there is no such customer.
    pub fn delete_customer(&self, id: CustomerId) -> LeadGraphResult<Customer> {
        if self.customers.get(id)?.is_none() {
            return Err(StorageError::CustomerNotFound(id).into());
        }
        let identifiers = self.identifiers.delete_for_customer(id)?;
        let interactions = self.interactions.delete_for_customer(id)?;
        let customer = self.customers.delete(id)?;
        info!(
            customer_id = %id,
            identifiers,
            interactions,
            "deleted customer"
        );
        Ok(customer)
    }

    /// Mark an email or phone claim as verified.
    ///
    /// # Errors
    ///
    /// - `NotVerifiable` for weak identifier types
    /// - `IdentifierNotFound` if the value is not claimed
    pub fn verify_identifier(
        &self,
        identifier_type: IdentifierType,
        value: &str,
    ) -> LeadGraphResult<Identifier> {
        if !identifier_type.is_contact() {
            return Err(ValidationError::NotVerifiable { identifier_type }.into());
        }
        let normalized = identifier_type
            .normalize(value)
            .ok_or_else(|| StorageError::IdentifierNotFound {
                identifier_type,
                value: value.to_string(),
            })?;
        let identifier = self
            .identifiers
            .set_verified(identifier_type, &normalized, Utc::now())?;
        info!(customer_id = %identifier.customer_id, identifier = %identifier.key(), "verified identifier");
        Ok(identifier)
    }

    /// Look up a customer by any identifier, without side effects.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub fn find_customer(
        &self,
        identifier_type: IdentifierType,
        value: &str,
    ) -> LeadGraphResult<Option<Customer>> {
        let Some(normalized) = identifier_type.normalize(value) else {
            return Ok(None);
        };
        let owner = match self.customers.find_by_master(identifier_type, &normalized)? {
            Some(id) => Some(id),
            None => self.identifiers.find_owner(identifier_type, &normalized)?,
        };
        match owner {
            Some(id) => Ok(self.customers.get(id)?),
            None => Ok(None),
        }
    }

    /// Get a customer by ID.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub fn customer(&self, id: CustomerId) -> LeadGraphResult<Option<Customer>> {
        Ok(self.customers.get(id)?)
    }

    /// All identifiers claimed by a customer.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub fn identifiers(&self, id: CustomerId) -> LeadGraphResult<Vec<Identifier>> {
        Ok(self.identifiers.list_for_customer(id)?)
    }

    /// A customer's interactions, oldest first.
    ///
    /// # Errors
    ///
    /// `CustomerNotFound` if there is no such customer.
    pub fn journey(&self, id: CustomerId) -> LeadGraphResult<Vec<Interaction>> {
        if self.customers.get(id)?.is_none() {
            return Err(StorageError::CustomerNotFound(id).into());
        }
        Ok(self.interactions.find_by_customer(id)?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::error::LeadGraphError;

    fn service() -> IngestService {
        IngestService::in_memory(ResolverConfig::default())
    }

    fn lead(email: &str, revenue: Option<f64>) -> LeadInput {
        LeadInput {
            identifiers: IdentifierBundle::new().email(email),
            revenue,
            ..LeadInput::default()
        }
    }

    #[test]
    fn test_click_then_lead_same_customer() {
        let svc = service();
        let click = svc
            .track_click(ClickInput {
                identifiers: IdentifierBundle::new().click_id("gclid-1").device_id("dev-1"),
                attribution: Attribution {
                    source: Some("google".to_string()),
                    medium: Some("cpc".to_string()),
                    ..Attribution::default()
                },
                ..ClickInput::default()
            })
            .unwrap();
        assert!(click.created);
        assert!(click.customer.is_anonymous());
        assert_eq!(click.customer.total_clicks, 1);
        assert_eq!(click.customer.source.as_deref(), Some("google"));

        let lead = svc
            .capture_lead(LeadInput {
                identifiers: IdentifierBundle::new().device_id("dev-1").email("a@x.com"),
                attribution: Attribution {
                    source: Some("newsletter".to_string()),
                    ..Attribution::default()
                },
                revenue: Some(40.0),
                ..LeadInput::default()
            })
            .unwrap();
        assert!(!lead.created);
        assert_eq!(lead.customer.id, click.customer.id);
        assert_eq!(lead.customer.total_leads, 1);
        assert_eq!(lead.customer.total_clicks, 1);
        assert!((lead.customer.total_revenue - 40.0).abs() < f64::EPSILON);
        assert_eq!(lead.customer.master_email.as_deref(), Some("a@x.com"));
        // First touch wins.
        assert_eq!(lead.customer.source.as_deref(), Some("google"));
    }

    #[test]
    fn test_invalid_revenue_creates_nothing() {
        let svc = service();
        let err = svc.capture_lead(lead("a@x.com", Some(-1.0))).unwrap_err();
        assert!(matches!(
            err,
            LeadGraphError::Validation(ValidationError::InvalidRevenue { .. })
        ));
        assert!(svc.find_customer(IdentifierType::Email, "a@x.com").unwrap().is_none());

        let err = svc.capture_lead(lead("a@x.com", Some(f64::NAN))).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_empty_event_name() {
        let svc = service();
        let err = svc
            .track_event(EventInput {
                identifiers: IdentifierBundle::new().session_id("s1"),
                name: "   ".to_string(),
                ..EventInput::default()
            })
            .unwrap_err();
        assert!(matches!(err, LeadGraphError::Validation(ValidationError::EmptyEventName)));
    }

    #[test]
    fn test_journey_is_time_ordered() {
        let svc = service();
        let now = Utc::now();
        let mut input = lead("a@x.com", None);
        input.occurred_at = Some(now);
        let id = svc.capture_lead(input).unwrap().customer.id;

        svc.track_event(EventInput {
            identifiers: IdentifierBundle::new().email("a@x.com"),
            name: "pricing_viewed".to_string(),
            occurred_at: Some(now - Duration::minutes(5)),
            ..EventInput::default()
        })
        .unwrap();

        let journey = svc.journey(id).unwrap();
        assert_eq!(journey.len(), 2);
        assert!(journey[0].is_event());
        assert!(journey[1].is_lead());

        let customer = svc.customer(id).unwrap().unwrap();
        assert_eq!(customer.first_seen, now - Duration::minutes(5));
        assert_eq!(customer.total_events, 1);
    }

    #[test]
    fn test_delete_customer_cascades() {
        let svc = service();
        let id = svc
            .capture_lead(LeadInput {
                identifiers: IdentifierBundle::new().email("a@x.com").phone("5550100"),
                ..LeadInput::default()
            })
            .unwrap()
            .customer
            .id;

        svc.delete_customer(id).unwrap();
        assert!(svc.customer(id).unwrap().is_none());
        assert!(svc.identifiers(id).unwrap().is_empty());
        assert!(svc.find_customer(IdentifierType::Phone, "5550100").unwrap().is_none());
        assert!(matches!(
            svc.journey(id),
            Err(LeadGraphError::Storage(StorageError::CustomerNotFound(_)))
        ));

        // The freed email resolves to a brand-new customer.
        let again = svc.capture_lead(lead("a@x.com", None)).unwrap();
        assert!(again.created);
        assert_ne!(again.customer.id, id);

        assert!(svc.delete_customer(id).is_err());
    }

    #[test]
    fn test_verify_identifier() {
        let svc = service();
        svc.capture_lead(lead("a@x.com", None)).unwrap();

        let verified = svc.verify_identifier(IdentifierType::Email, " A@X.com").unwrap();
        assert!(verified.is_verified);
        assert!(verified.verified_at.is_some());

        let err = svc.verify_identifier(IdentifierType::DeviceId, "d1").unwrap_err();
        assert!(matches!(
            err,
            LeadGraphError::Validation(ValidationError::NotVerifiable { .. })
        ));

        let err = svc.verify_identifier(IdentifierType::Email, "nobody@x.com").unwrap_err();
        assert!(matches!(
            err,
            LeadGraphError::Storage(StorageError::IdentifierNotFound { .. })
        ));
    }

    #[test]
    fn test_payload_tags() {
        let click: IngestPayload = serde_json::from_str(
            r#"{"type":"click","identifiers":{"clickId":"c1","ip":"10.0.0.1"},"landingUrl":"https://x.com/a"}"#,
        )
        .unwrap();
        let event: IngestPayload =
            serde_json::from_str(r#"{"type":"event","identifiers":{"sessionId":"s1"},"name":"signup"}"#)
                .unwrap();

        let svc = service();
        let ingested = svc.ingest(click).unwrap();
        assert!(ingested.interaction.is_click());
        assert_eq!(ingested.interaction.technical.ip.as_deref(), Some("10.0.0.1"));
        assert!(svc.ingest(event).unwrap().interaction.is_event());

        assert!(serde_json::from_str::<IngestPayload>(r#"{"type":"purchase"}"#).is_err());
    }
}
