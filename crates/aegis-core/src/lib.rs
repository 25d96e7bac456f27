//! Shared data model for the governance gateway: request/result/approval
//! types, the condition DSL, id/time helpers, and tunable configuration.
//!
//! This crate has no I/O of its own. It exists so that `aegis-pii`,
//! `aegis-cache`, `aegis-policy` and `aegis-breaker` can agree on one set of
//! wire types without depending on each other.

#![deny(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// Order-preserving string-keyed JSON object. Requires the `preserve_order`
/// feature on `serde_json` so the PII scanner's tree walk can iterate keys in
/// the order the agent sent them.
pub type JsonObject = Map<String, JsonValue>;

pub mod ids {
    //! Id and timestamp helpers shared across the workspace.

    use uuid::Uuid;

    /// Generate a fresh request/rule/approval identifier.
    pub fn new_id() -> Uuid {
        Uuid::new_v4()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn ids_are_unique() {
            assert_ne!(new_id(), new_id());
        }
    }
}

/// Closed set of action types an agent can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    DatabaseQuery,
    DatabaseWrite,
    ApiCall,
    FileAccess,
    Payment,
    Refund,
    UserDataAccess,
    AdminAction,
}

/// Ordered risk classification. `Ord` reflects `low < medium < high < critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Map a clamped `[0.0, 1.0]` risk score to its level.
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Self::Critical
        } else if score >= 0.5 {
            Self::High
        } else if score >= 0.2 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Outcome of a policy evaluation, before circuit-breaker mode mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Allow,
    Deny,
    PendingApproval,
    ShadowLogged,
}

/// Circuit breaker operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GatewayMode {
    /// Observe and log but never block or suspend.
    Shadow,
    /// Act on the decision: allow, deny, or suspend pending approval.
    Enforce,
}

/// An immutable action an agent asked the gateway to authorize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub request_id: Uuid,
    pub agent_id: String,
    pub action_type: ActionType,
    pub target_resource: String,
    #[serde(default)]
    pub parameters: JsonObject,
    #[serde(default)]
    pub context: JsonObject,
    pub timestamp: DateTime<Utc>,
}

/// Error returned when constructing an `AgentRequest` with invalid fields.
#[derive(Debug, thiserror::Error)]
pub enum RequestValidationError {
    #[error("agent_id must be 1-128 chars, got {0}")]
    AgentId(usize),
    #[error("target_resource must be 1-512 chars, got {0}")]
    TargetResource(usize),
}

impl AgentRequest {
    /// Construct a validated request with a fresh id and current timestamp.
    pub fn new(
        agent_id: impl Into<String>,
        action_type: ActionType,
        target_resource: impl Into<String>,
        parameters: JsonObject,
        context: JsonObject,
    ) -> Result<Self, RequestValidationError> {
        let agent_id = agent_id.into();
        let target_resource = target_resource.into();
        if agent_id.is_empty() || agent_id.len() > 128 {
            return Err(RequestValidationError::AgentId(agent_id.len()));
        }
        if target_resource.is_empty() || target_resource.len() > 512 {
            return Err(RequestValidationError::TargetResource(target_resource.len()));
        }
        Ok(Self {
            request_id: ids::new_id(),
            agent_id,
            action_type,
            target_resource,
            parameters,
            context,
            timestamp: Utc::now(),
        })
    }
}

/// Recognized condition keys, compiled from a rule's loose JSON map at
/// load time so evaluation never re-parses the map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Condition {
    MaxAmount { max_amount: f64 },
    ProtectedTables { protected_tables: Vec<String> },
    MaxAffectedRows { max_affected_rows: f64 },
    RequireJustification,
    /// Empty `conditions: {}` — the action-type match itself is the violation.
    None,
    /// A non-empty `conditions` map whose keys are all unrecognized. Ignored
    /// going forward (forward-compatible) rather than treated as a blanket
    /// violation — only a genuinely empty map gets that treatment.
    Unrecognized,
}

impl Condition {
    /// Compile a rule's loose `conditions` map into the closed condition set.
    /// Unknown keys are ignored (forward-compatible); recognized keys are
    /// checked in a fixed order: max_amount, protected_tables,
    /// max_affected_rows, require_justification. A non-empty map with no
    /// recognized key compiles to `Unrecognized`, not `None` — only a
    /// genuinely empty map means "match on action type alone".
    #[must_use]
    pub fn compile(raw: &JsonObject) -> Self {
        if let Some(v) = raw.get("max_amount").and_then(JsonValue::as_f64) {
            return Self::MaxAmount { max_amount: v };
        }
        if let Some(v) = raw.get("protected_tables").and_then(JsonValue::as_array) {
            let tables =
                v.iter().filter_map(|t| t.as_str().map(str::to_owned)).collect::<Vec<_>>();
            return Self::ProtectedTables { protected_tables: tables };
        }
        if let Some(v) = raw.get("max_affected_rows").and_then(JsonValue::as_f64) {
            return Self::MaxAffectedRows { max_affected_rows: v };
        }
        if raw.get("require_justification").and_then(JsonValue::as_bool).unwrap_or(false) {
            return Self::RequireJustification;
        }
        if raw.is_empty() {
            Self::None
        } else {
            Self::Unrecognized
        }
    }
}

/// A single policy rule. `conditions` is kept as the raw loose map (matching
/// the wire format from the cache/store) plus the precompiled `Condition`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub rule_id: String,
    pub name: String,
    pub description: String,
    pub action_types: Vec<ActionType>,
    #[serde(default)]
    pub conditions: JsonObject,
    pub risk_score_modifier: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub priority: u32,
}

fn default_true() -> bool {
    true
}

impl PolicyRule {
    /// Compile this rule's raw conditions into the closed condition set.
    #[must_use]
    pub fn condition(&self) -> Condition {
        Condition::compile(&self.conditions)
    }
}

/// Result of evaluating a request against the active policy set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvaluationResult {
    pub request_id: Uuid,
    pub decision: DecisionType,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub matched_rules: Vec<String>,
    pub denial_reasons: Vec<String>,
    pub sanitized_request: SanitizedRequest,
    pub pii_detected: bool,
    pub pii_fields: Vec<String>,
    pub evaluation_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// A structurally-identical copy of the originating request with every
/// PII substring the scanner recognized masked out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizedRequest {
    pub agent_id: String,
    pub action_type: ActionType,
    pub target_resource: String,
    pub parameters: JsonObject,
    pub context: JsonObject,
}

/// A pending human-in-the-loop approval record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: Uuid,
    pub request_id: Uuid,
    pub agent_id: String,
    pub action_type: ActionType,
    pub target_resource: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub matched_rules: Vec<String>,
    pub sanitized_parameters: JsonObject,
    pub context: JsonObject,
    pub requested_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Default approval TTL: 24 hours.
    pub const DEFAULT_TTL_SECS: i64 = 24 * 3600;

    /// Construct a fresh approval record expiring `ttl_secs` after
    /// `requested_at`. Pass `Self::DEFAULT_TTL_SECS` to use the default.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: Uuid,
        agent_id: impl Into<String>,
        action_type: ActionType,
        target_resource: impl Into<String>,
        risk_score: f64,
        risk_level: RiskLevel,
        matched_rules: Vec<String>,
        sanitized_parameters: JsonObject,
        context: JsonObject,
        ttl_secs: i64,
    ) -> Self {
        let requested_at = Utc::now();
        Self {
            approval_id: ids::new_id(),
            request_id,
            agent_id: agent_id.into(),
            action_type,
            target_resource: target_resource.into(),
            risk_score,
            risk_level,
            matched_rules,
            sanitized_parameters,
            context,
            requested_at,
            expires_at: Some(requested_at + Duration::seconds(ttl_secs)),
        }
    }
}

/// Terminal outcome of an approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Approved,
    Denied,
}

/// Response submitted by a human reviewer for a pending approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approval_id: Uuid,
    pub status: ApprovalStatus,
    pub approver_id: Option<String>,
    pub reason: Option<String>,
    pub approved_at: DateTime<Utc>,
}

/// The client-visible outcome of `CircuitBreaker::process`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub request_id: Uuid,
    pub decision: DecisionType,
    pub message: String,
    pub risk_level: RiskLevel,
    pub forwarded: bool,
    pub approval_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

/// Tunable thresholds and timeouts for one gateway instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub policy_cache_ttl_secs: u64,
    pub rate_limit_requests: u64,
    pub rate_limit_window_secs: u64,
    pub risk_score_block_threshold: f64,
    pub risk_score_approval_threshold: f64,
    pub approval_webhook_timeout_secs: f64,
    pub approval_ttl_secs: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            policy_cache_ttl_secs: 300,
            rate_limit_requests: 1_000,
            rate_limit_window_secs: 60,
            risk_score_block_threshold: 1.0,
            risk_score_approval_threshold: 0.8,
            approval_webhook_timeout_secs: 5.0,
            approval_ttl_secs: ApprovalRequest::DEFAULT_TTL_SECS,
        }
    }
}
