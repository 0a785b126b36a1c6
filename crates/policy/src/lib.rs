use std::sync::Arc;

use genq_auth::AccessKeyValidator;
use genq_contracts::schema::{FieldSchema, OpennessLevel};
use genq_contracts::{Action, FilterExpression, Granularity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    AccessKeyRequired,
    AccessKeyInvalid,
    TooFineGrained,
}

impl DenialReason {
    pub fn code(self) -> &'static str {
        match self {
            DenialReason::AccessKeyRequired => "ERR_ACCESS_KEY_REQUIRED",
            DenialReason::AccessKeyInvalid => "ERR_ACCESS_KEY_INVALID",
            DenialReason::TooFineGrained => "ERR_TOO_FINE_GRAINED",
        }
    }

    /// Client-facing text. Deliberately does not name the offending field.
    pub fn message(self) -> &'static str {
        match self {
            DenialReason::AccessKeyRequired => "an access key is required to query this instance",
            DenialReason::AccessKeyInvalid => "the provided access key is invalid or expired",
            DenialReason::TooFineGrained => {
                "the access key only permits aggregated queries that do not filter on or return identifying fields"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Granted(Granularity),
    Denied(DenialReason),
}

impl PolicyDecision {
    pub fn outcome(self) -> &'static str {
        match self {
            PolicyDecision::Granted(Granularity::Full) => "granted_full",
            PolicyDecision::Granted(Granularity::AggregateOnly) => "granted_aggregate_only",
            PolicyDecision::Denied(DenialReason::AccessKeyRequired) => "denied_key_required",
            PolicyDecision::Denied(DenialReason::AccessKeyInvalid) => "denied_key_invalid",
            PolicyDecision::Denied(DenialReason::TooFineGrained) => "denied_too_fine_grained",
        }
    }
}

/// What the policy looks at: the compiled action and filter, never the raw
/// request text.
#[derive(Debug, Clone, Copy)]
pub struct PolicyRequest<'a> {
    pub action: &'a Action,
    pub filter: &'a FilterExpression,
    pub access_key: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PolicyConfigError {
    message: String,
}

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    schema: Arc<FieldSchema>,
    validator: Option<AccessKeyValidator>,
}

impl AccessPolicy {
    pub fn new(
        schema: Arc<FieldSchema>,
        validator: Option<AccessKeyValidator>,
    ) -> Result<Self, PolicyConfigError> {
        if schema.openness() == OpennessLevel::Protected && validator.is_none() {
            return Err(PolicyConfigError {
                message: format!(
                    "instance `{}` is PROTECTED but no access keys are configured",
                    schema.instance_name()
                ),
            });
        }
        Ok(Self { schema, validator })
    }

    /// Decides a single request at wall-clock second `now`.
    pub fn evaluate(&self, request: PolicyRequest<'_>, now: i64) -> PolicyDecision {
        let validator = match (self.schema.openness(), self.validator.as_ref()) {
            (OpennessLevel::Open, _) => return PolicyDecision::Granted(Granularity::Full),
            (OpennessLevel::Protected, Some(validator)) => validator,
            (OpennessLevel::Protected, None) => {
                return PolicyDecision::Denied(DenialReason::AccessKeyInvalid);
            }
        };

        let Some(presented) = request
            .access_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
        else {
            return PolicyDecision::Denied(DenialReason::AccessKeyRequired);
        };

        match validator.granularity_for(presented, now) {
            None => PolicyDecision::Denied(DenialReason::AccessKeyInvalid),
            Some(Granularity::Full) => PolicyDecision::Granted(Granularity::Full),
            Some(Granularity::AggregateOnly) => self.check_aggregate_only(request),
        }
    }

    fn check_aggregate_only(&self, request: PolicyRequest<'_>) -> PolicyDecision {
        let fields = request.action.output_fields();
        if let [only] = fields
            && only == self.schema.primary_key()
        {
            return PolicyDecision::Granted(Granularity::AggregateOnly);
        }

        if !request.action.serves_aggregated_data() {
            tracing::debug!(
                action = request.action.name(),
                "aggregate-only key used for row-level action"
            );
            return PolicyDecision::Denied(DenialReason::TooFineGrained);
        }

        if let Some(column) = request
            .filter
            .referenced_columns()
            .into_iter()
            .find(|column| self.schema.is_identifying(column))
        {
            tracing::debug!(column, "aggregate-only key filters on identifying field");
            return PolicyDecision::Denied(DenialReason::TooFineGrained);
        }

        if let Some(field) = fields.iter().find(|f| self.schema.is_identifying(f)) {
            tracing::debug!(field = %field, "aggregate-only key requests identifying field");
            return PolicyDecision::Denied(DenialReason::TooFineGrained);
        }

        PolicyDecision::Granted(Granularity::AggregateOnly)
    }
}
