use aegis_cache::PolicyCache;
use aegis_core::{ActionType, JsonObject, PolicyRule};
use aegis_policy::{PolicyEngine, PolicyError, Thresholds};
use std::sync::Arc;
use std::time::Duration;

fn engine() -> PolicyEngine {
    PolicyEngine::new(Arc::new(PolicyCache::new(Duration::from_secs(300))), Thresholds::default())
}

fn valid_rule() -> PolicyRule {
    PolicyRule {
        rule_id: "r1".to_string(),
        name: "r1".to_string(),
        description: String::new(),
        action_types: vec![ActionType::ApiCall],
        conditions: JsonObject::new(),
        risk_score_modifier: 0.5,
        enabled: true,
        priority: 10,
    }
}

#[test]
fn empty_rule_id_is_rejected() {
    let mut rule = valid_rule();
    rule.rule_id = String::new();
    assert!(matches!(engine().upsert(rule), Err(PolicyError::EmptyRuleId)));
}

#[test]
fn empty_action_types_is_rejected() {
    let mut rule = valid_rule();
    rule.action_types = Vec::new();
    assert!(matches!(engine().upsert(rule), Err(PolicyError::EmptyActionTypes)));
}

#[test]
fn priority_above_1000_is_rejected() {
    let mut rule = valid_rule();
    rule.priority = 1001;
    assert!(matches!(engine().upsert(rule), Err(PolicyError::PriorityOutOfRange(1001))));
}

#[test]
fn priority_at_the_boundary_is_accepted() {
    let mut rule = valid_rule();
    rule.priority = 1000;
    assert!(engine().upsert(rule).is_ok());
}

#[test]
fn modifier_outside_unit_range_is_rejected() {
    let mut rule = valid_rule();
    rule.risk_score_modifier = 1.5;
    assert!(matches!(engine().upsert(rule), Err(PolicyError::ModifierOutOfRange(m)) if (m - 1.5).abs() < f64::EPSILON));

    let mut rule = valid_rule();
    rule.risk_score_modifier = -1.5;
    assert!(matches!(engine().upsert(rule), Err(PolicyError::ModifierOutOfRange(_))));
}

#[test]
fn valid_rule_is_accepted_and_retrievable() {
    let engine = engine();
    let rule = valid_rule();
    engine.upsert(rule).unwrap();
    assert!(engine.get("r1").is_some());
}
