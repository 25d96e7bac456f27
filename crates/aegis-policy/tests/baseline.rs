use aegis_core::{ActionType, DecisionType, JsonObject, RiskLevel};
use aegis_policy::{AgentRequest, PolicyEngine, Thresholds};
use aegis_cache::PolicyCache;
use std::sync::Arc;
use std::time::Duration;

fn engine() -> PolicyEngine {
    PolicyEngine::new(Arc::new(PolicyCache::new(Duration::from_secs(300))), Thresholds::default())
}

#[test]
fn empty_cache_falls_back_to_default_rules_and_allows_plain_requests() {
    let engine = engine();
    let req = AgentRequest::new("agent-1", ActionType::ApiCall, "orders", JsonObject::new(), JsonObject::new()).unwrap();
    let result = engine.evaluate(&req);
    assert_eq!(result.decision, DecisionType::Allow);
    assert!(result.matched_rules.is_empty());
    assert_eq!(result.risk_level, RiskLevel::Low);
}

#[test]
fn refund_over_limit_denies() {
    let engine = engine();
    let mut params = JsonObject::new();
    params.insert("amount".into(), serde_json::json!(750));
    let req = AgentRequest::new("agent-1", ActionType::Refund, "refunds", params, JsonObject::new()).unwrap();
    let result = engine.evaluate(&req);
    assert_eq!(result.decision, DecisionType::Deny);
    assert_eq!(result.matched_rules, vec!["refund_limit_500"]);
}

#[test]
fn database_write_to_protected_table_is_flagged() {
    let engine = engine();
    let req = AgentRequest::new("agent-1", ActionType::DatabaseWrite, "public.users", JsonObject::new(), JsonObject::new()).unwrap();
    let result = engine.evaluate(&req);
    assert!(result.matched_rules.contains(&"database_write_protection".to_string()));
    assert_eq!(result.decision, DecisionType::Deny);
}

#[test]
fn decision_is_stable_across_repeated_evaluation() {
    let engine = engine();
    let mut params = JsonObject::new();
    params.insert("amount".into(), serde_json::json!(20_000));
    let req = AgentRequest::new("agent-1", ActionType::Payment, "payments", params, JsonObject::new()).unwrap();

    let first = engine.evaluate(&req);
    let second = engine.evaluate(&req);
    assert_eq!(first.decision, second.decision);
    assert!((first.risk_score - second.risk_score).abs() < f64::EPSILON);
    assert_eq!(first.matched_rules, second.matched_rules);
}

#[test]
fn rule_administration_round_trips_through_the_cache() {
    let engine = engine();
    assert!(engine.get("custom_rule").is_none());

    let mut rule = aegis_policy::default_rules().remove(0);
    rule.rule_id = "custom_rule".to_string();
    engine.upsert(rule).unwrap();

    assert!(engine.get("custom_rule").is_some());
    assert!(engine.delete("custom_rule"));
    assert!(engine.get("custom_rule").is_none());
}
