//! Orchestrates PII scrubbing, rule matching, risk aggregation, and decision
//! derivation for a single agent request.
//!
//! `PolicyEngine::evaluate` is mode-agnostic: it always reports `deny` at or
//! above the block threshold and `pending_approval` at or above the
//! approval threshold. Shadow-mode coercion (deny/pending_approval ->
//! shadow_logged) is the circuit breaker's job, not the engine's — the
//! engine contract (`evaluate(request) -> result`) takes no mode argument,
//! and folding mode into two places would let them drift out of sync.

#![deny(unsafe_code)]

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use aegis_cache::PolicyCache;
use aegis_core::{
    ActionType, Condition, DecisionType, JsonObject, PolicyEvaluationResult, PolicyRule,
    RiskLevel, SanitizedRequest,
};
use chrono::Utc;

pub use aegis_core::AgentRequest;

/// Failures raised by rule administration (not by `evaluate`, which never
/// fails outright — see module docs).
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("rule_id must be non-empty")]
    EmptyRuleId,
    #[error("rule must match at least one action type")]
    EmptyActionTypes,
    #[error("priority must be in [0, 1000], got {0}")]
    PriorityOutOfRange(u32),
    #[error("risk_score_modifier must be in [-1.0, 1.0], got {0}")]
    ModifierOutOfRange(f64),
}

fn validate_rule(rule: &PolicyRule) -> Result<(), PolicyError> {
    if rule.rule_id.is_empty() {
        return Err(PolicyError::EmptyRuleId);
    }
    if rule.action_types.is_empty() {
        return Err(PolicyError::EmptyActionTypes);
    }
    if rule.priority > 1000 {
        return Err(PolicyError::PriorityOutOfRange(rule.priority));
    }
    if !(-1.0..=1.0).contains(&rule.risk_score_modifier) {
        return Err(PolicyError::ModifierOutOfRange(rule.risk_score_modifier));
    }
    Ok(())
}

/// Tunable block/approval thresholds the engine derives decisions from.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub block: f64,
    pub approval: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { block: 1.0, approval: 0.8 }
    }
}

/// Evaluates agent requests against the active policy set.
pub struct PolicyEngine {
    cache: Arc<PolicyCache>,
    thresholds: Thresholds,
}

impl PolicyEngine {
    /// Construct an engine backed by `cache`, using the given thresholds.
    #[must_use]
    pub fn new(cache: Arc<PolicyCache>, thresholds: Thresholds) -> Self {
        Self { cache, thresholds }
    }

    /// Active rules from the cache, falling back to the built-in default set
    /// when the cache is empty — e.g. at cold start or after an outage.
    #[must_use]
    pub fn list_active(&self) -> Vec<PolicyRule> {
        let cached = self.cache.list_active();
        if cached.is_empty() {
            default_rules()
        } else {
            cached
        }
    }

    /// Fetch a single rule from the cache (not the default set).
    #[must_use]
    pub fn get(&self, rule_id: &str) -> Option<PolicyRule> {
        self.cache.get(rule_id)
    }

    /// Validate and upsert a rule into the cache.
    pub fn upsert(&self, rule: PolicyRule) -> Result<(), PolicyError> {
        validate_rule(&rule)?;
        self.cache.store(rule);
        Ok(())
    }

    /// Remove a rule from the cache. Idempotent.
    pub fn delete(&self, rule_id: &str) -> bool {
        self.cache.delete(rule_id)
    }

    /// Evaluate `request` against the active rule set. Never fails outright:
    /// an internal fault is caught and converted to a `deny`/`critical`
    /// result with a single descriptive reason, per the documented failure
    /// semantics.
    #[tracing::instrument(skip_all, fields(request_id = %request.request_id, agent_id = %request.agent_id))]
    #[must_use]
    pub fn evaluate(&self, request: &AgentRequest) -> PolicyEvaluationResult {
        let started = Instant::now();
        let rules = self.list_active();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            evaluate_inner(request, &rules, self.thresholds)
        }));
        let evaluation_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(mut result) => {
                result.evaluation_time_ms = evaluation_time_ms;
                result
            }
            Err(_) => {
                tracing::error!(request_id = %request.request_id, "policy evaluation panicked, failing closed");
                failure_result(request, evaluation_time_ms)
            }
        }
    }
}

fn failure_result(request: &AgentRequest, evaluation_time_ms: f64) -> PolicyEvaluationResult {
    PolicyEvaluationResult {
        request_id: request.request_id,
        decision: DecisionType::Deny,
        risk_score: 1.0,
        risk_level: RiskLevel::Critical,
        matched_rules: Vec::new(),
        denial_reasons: vec!["policy evaluation failed; denying by default".to_string()],
        sanitized_request: SanitizedRequest {
            agent_id: request.agent_id.clone(),
            action_type: request.action_type,
            target_resource: request.target_resource.clone(),
            parameters: JsonObject::new(),
            context: JsonObject::new(),
        },
        pii_detected: false,
        pii_fields: Vec::new(),
        evaluation_time_ms,
        timestamp: Utc::now(),
    }
}

fn evaluate_inner(
    request: &AgentRequest,
    rules: &[PolicyRule],
    thresholds: Thresholds,
) -> PolicyEvaluationResult {
    // Step 1 — sanitize. Parameters feed condition evaluation sanitized;
    // context stays raw (see module/condition docs) so masking never
    // corrupts a length check like require_justification.
    let (sanitized_params, params_entities) =
        aegis_pii::scan_tree(&serde_json::Value::Object(request.parameters.clone()));
    let (sanitized_context, context_entities) =
        aegis_pii::scan_tree(&serde_json::Value::Object(request.context.clone()));

    let mut pii_fields: Vec<String> = params_entities
        .iter()
        .chain(context_entities.iter())
        .map(ToString::to_string)
        .collect();
    pii_fields.sort();
    pii_fields.dedup();
    let pii_detected = !pii_fields.is_empty();

    let sanitized_params_obj = as_object(sanitized_params);
    let sanitized_request = SanitizedRequest {
        agent_id: request.agent_id.clone(),
        action_type: request.action_type,
        target_resource: request.target_resource.clone(),
        parameters: sanitized_params_obj.clone(),
        context: as_object(sanitized_context),
    };

    // Steps 2-3 — fetch (already done by the caller) and match, in priority order.
    let mut matched_rules = Vec::new();
    let mut denial_reasons = Vec::new();
    let mut running_sum = 0.0_f64;

    for rule in rules {
        if !rule.enabled || !rule.action_types.contains(&request.action_type) {
            continue;
        }
        if let Some(reason) = evaluate_condition(
            &rule.condition(),
            rule,
            &sanitized_params_obj,
            &request.context,
            &request.target_resource,
            request.action_type,
        ) {
            matched_rules.push(rule.rule_id.clone());
            denial_reasons.push(reason);
            running_sum += rule.risk_score_modifier;
        }
    }

    // Step 4 — score.
    let risk_score = running_sum.clamp(0.0, 1.0);
    // Step 5 — level.
    let risk_level = RiskLevel::from_score(risk_score);
    // Step 6 — decision (mode-agnostic; see module docs).
    let decision = if risk_score >= thresholds.block {
        DecisionType::Deny
    } else if risk_score >= thresholds.approval {
        DecisionType::PendingApproval
    } else {
        DecisionType::Allow
    };

    PolicyEvaluationResult {
        request_id: request.request_id,
        decision,
        risk_score,
        risk_level,
        matched_rules,
        denial_reasons,
        sanitized_request,
        pii_detected,
        pii_fields,
        evaluation_time_ms: 0.0,
        timestamp: Utc::now(),
    }
}

fn as_object(value: serde_json::Value) -> JsonObject {
    match value {
        serde_json::Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}

/// Evaluate one rule's compiled condition; `Some(reason)` on violation.
fn evaluate_condition(
    condition: &Condition,
    rule: &PolicyRule,
    sanitized_params: &JsonObject,
    raw_context: &JsonObject,
    target_resource: &str,
    action_type: ActionType,
) -> Option<String> {
    match condition {
        Condition::MaxAmount { max_amount } => {
            let amount = sanitized_params.get("amount")?.as_f64()?;
            if amount > *max_amount {
                Some(format!(
                    "amount ${amount:.2} exceeds the maximum of ${max_amount:.2} allowed for this action"
                ))
            } else {
                None
            }
        }
        Condition::ProtectedTables { protected_tables } => {
            let target_lower = target_resource.to_lowercase();
            protected_tables
                .iter()
                .find(|table| target_lower.contains(&table.to_lowercase()))
                .map(|table| {
                    format!("target resource '{target_resource}' touches protected table '{table}'")
                })
        }
        Condition::MaxAffectedRows { max_affected_rows } => {
            let affected = sanitized_params.get("affected_rows").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let limit = sanitized_params.get("limit").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let rows = affected.max(limit);
            if rows > *max_affected_rows {
                Some(format!(
                    "operation affects {rows} rows, exceeding the limit of {max_affected_rows}"
                ))
            } else {
                None
            }
        }
        Condition::RequireJustification => {
            let justification = raw_context
                .get("justification")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim();
            if justification.len() < 10 {
                Some(format!(
                    "justification '{justification}' is shorter than the required 10 characters"
                ))
            } else {
                None
            }
        }
        Condition::None => Some(format!(
            "action type {action_type:?} is flagged by rule '{}'",
            rule.name
        )),
        // A non-empty conditions map with no key this engine understands.
        // Ignored rather than treated as a blanket violation, so future
        // condition keys can be added to rules without tripping old engines.
        Condition::Unrecognized => None,
    }
}

/// The built-in default rule set, used when the cache is empty (cold start
/// or outage).
#[must_use]
pub fn default_rules() -> Vec<PolicyRule> {
    vec![
        policy_rule(
            "admin_action_high_risk",
            "Admin action high risk",
            "Every admin action is treated as high risk by default",
            vec![ActionType::AdminAction],
            JsonObject::new(),
            0.85,
            5,
        ),
        policy_rule(
            "database_write_protection",
            "Database write protection",
            "Writes touching sensitive tables are high risk",
            vec![ActionType::DatabaseWrite],
            condition_map_protected_tables(&["users", "payments", "credentials"]),
            1.0,
            15,
        ),
        policy_rule(
            "refund_limit_500",
            "Refund limit",
            "Refunds above $500 require scrutiny",
            vec![ActionType::Refund],
            condition_map_max_amount(500.0),
            1.0,
            10,
        ),
        policy_rule(
            "payment_limit_10000",
            "Payment limit",
            "Payments above $10,000 require scrutiny",
            vec![ActionType::Payment],
            condition_map_max_amount(10_000.0),
            0.85,
            20,
        ),
        policy_rule(
            "bulk_operation_limit",
            "Bulk operation limit",
            "Bulk reads/writes above 1,000 rows require scrutiny",
            vec![ActionType::DatabaseWrite, ActionType::DatabaseQuery],
            condition_map_max_affected_rows(1000.0),
            0.9,
            25,
        ),
        policy_rule(
            "user_data_access",
            "User data access justification",
            "Accessing user data requires a recorded justification",
            vec![ActionType::UserDataAccess],
            condition_map_require_justification(),
            0.3,
            30,
        ),
    ]
}

#[allow(clippy::too_many_arguments)]
fn policy_rule(
    rule_id: &str,
    name: &str,
    description: &str,
    action_types: Vec<ActionType>,
    conditions: JsonObject,
    risk_score_modifier: f64,
    priority: u32,
) -> PolicyRule {
    PolicyRule {
        rule_id: rule_id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        action_types,
        conditions,
        risk_score_modifier,
        enabled: true,
        priority,
    }
}

fn condition_map_max_amount(amount: f64) -> JsonObject {
    let mut map = JsonObject::new();
    map.insert("max_amount".to_string(), serde_json::json!(amount));
    map
}

fn condition_map_max_affected_rows(rows: f64) -> JsonObject {
    let mut map = JsonObject::new();
    map.insert("max_affected_rows".to_string(), serde_json::json!(rows));
    map
}

fn condition_map_protected_tables(tables: &[&str]) -> JsonObject {
    let mut map = JsonObject::new();
    map.insert("protected_tables".to_string(), serde_json::json!(tables));
    map
}

fn condition_map_require_justification() -> JsonObject {
    let mut map = JsonObject::new();
    map.insert("require_justification".to_string(), serde_json::json!(true));
    map
}
