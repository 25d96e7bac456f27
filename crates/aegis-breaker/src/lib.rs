//! Maps a policy evaluation plus the current gateway mode to a client-visible
//! response, and drives human-in-the-loop approval for pending-approval
//! outcomes under enforce mode.
//!
//! Mode is read once at the top of `process` and used throughout: an
//! in-flight evaluation may observe either the old or the new mode after a
//! concurrent `set_mode`, but never a torn read.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use aegis_core::{
    ActionType, ApprovalRequest, ApprovalResponse, ApprovalStatus, DecisionType, GatewayMode,
    GatewayResponse, PolicyEvaluationResult, RiskLevel,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub use aegis_core::AgentRequest;

/// Failures from the approval webhook transport. Dispatch failures are
/// logged by the breaker, never propagated — the approval record, not the
/// webhook, is the source of truth.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("webhook transport error: {0}")]
    Transport(String),
    #[error("webhook timed out after {0:?}")]
    Timeout(Duration),
    #[error("webhook returned non-success status {0}")]
    NonSuccessStatus(u16),
}

/// Wire shape POSTed to the external approval collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalWebhookPayload {
    pub event: &'static str,
    pub approval_id: Uuid,
    pub request_id: Uuid,
    pub agent_id: String,
    pub action_type: ActionType,
    pub target_resource: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub matched_rules: Vec<String>,
    pub parameters: aegis_core::JsonObject,
    pub context: aegis_core::JsonObject,
    pub requested_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub callback_url: String,
}

impl From<&ApprovalRequest> for ApprovalWebhookPayload {
    fn from(approval: &ApprovalRequest) -> Self {
        Self {
            event: "approval_requested",
            approval_id: approval.approval_id,
            request_id: approval.request_id,
            agent_id: approval.agent_id.clone(),
            action_type: approval.action_type,
            target_resource: approval.target_resource.clone(),
            risk_score: approval.risk_score,
            risk_level: approval.risk_level,
            matched_rules: approval.matched_rules.clone(),
            parameters: approval.sanitized_parameters.clone(),
            context: approval.context.clone(),
            requested_at: approval.requested_at,
            expires_at: approval.expires_at,
            callback_url: format!("/api/v1/approvals/{}/decision", approval.approval_id),
        }
    }
}

/// External collaborator that delivers the approval-requested notification.
/// A real implementation posts to a webhook URL; tests can substitute an
/// in-memory recorder.
#[async_trait::async_trait]
pub trait ApprovalTransport: Send + Sync {
    async fn dispatch(&self, payload: &ApprovalWebhookPayload) -> Result<(), BreakerError>;
}

/// `reqwest`-backed transport, bounded by `timeout`.
pub struct HttpApprovalTransport {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpApprovalTransport {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self { client: reqwest::Client::new(), url: url.into(), timeout }
    }
}

#[async_trait::async_trait]
impl ApprovalTransport for HttpApprovalTransport {
    async fn dispatch(&self, payload: &ApprovalWebhookPayload) -> Result<(), BreakerError> {
        let send = self.client.post(&self.url).json(payload).send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| BreakerError::Timeout(self.timeout))?
            .map_err(|e| BreakerError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BreakerError::NonSuccessStatus(response.status().as_u16()))
        }
    }
}

/// Human-in-the-loop approval state machine and mode mapping.
pub struct CircuitBreaker {
    mode: RwLock<GatewayMode>,
    pending: Mutex<HashMap<Uuid, ApprovalRequest>>,
    transport: std::sync::Arc<dyn ApprovalTransport>,
    approval_ttl_secs: i64,
}

impl CircuitBreaker {
    /// Construct a breaker starting in `mode`, dispatching approvals through
    /// `transport`, with approval records expiring after
    /// `ApprovalRequest::DEFAULT_TTL_SECS`. Use
    /// [`CircuitBreaker::with_approval_ttl`] for a configurable TTL.
    #[must_use]
    pub fn new(mode: GatewayMode, transport: std::sync::Arc<dyn ApprovalTransport>) -> Self {
        Self::with_approval_ttl(mode, transport, ApprovalRequest::DEFAULT_TTL_SECS)
    }

    /// Construct a breaker whose approval records expire after
    /// `approval_ttl_secs`.
    #[must_use]
    pub fn with_approval_ttl(
        mode: GatewayMode,
        transport: std::sync::Arc<dyn ApprovalTransport>,
        approval_ttl_secs: i64,
    ) -> Self {
        Self {
            mode: RwLock::new(mode),
            pending: Mutex::new(HashMap::new()),
            transport,
            approval_ttl_secs,
        }
    }

    #[must_use]
    pub fn get_mode(&self) -> GatewayMode {
        *self.mode.read().expect("mode lock poisoned")
    }

    pub fn set_mode(&self, mode: GatewayMode) {
        *self.mode.write().expect("mode lock poisoned") = mode;
    }

    /// Translate `evaluation` into a client-visible response, reading the
    /// mode once and applying it for the whole call.
    #[tracing::instrument(skip_all, fields(request_id = %request.request_id, decision = ?evaluation.decision))]
    pub async fn process(
        &self,
        request: &AgentRequest,
        evaluation: &PolicyEvaluationResult,
    ) -> GatewayResponse {
        let mode = self.get_mode();
        match evaluation.decision {
            DecisionType::Allow => allow_response(evaluation),
            DecisionType::ShadowLogged => {
                tracing::warn!(request_id = %request.request_id, "shadow-logged decision forwarded");
                allow_response(evaluation)
            }
            DecisionType::PendingApproval => match mode {
                GatewayMode::Shadow => {
                    tracing::warn!(request_id = %request.request_id, "pending-approval decision coerced to shadow_logged");
                    shadow_coerced_response(evaluation)
                }
                GatewayMode::Enforce => self.enter_pending_approval(request, evaluation).await,
            },
            DecisionType::Deny => match mode {
                GatewayMode::Shadow => {
                    tracing::warn!(request_id = %request.request_id, "deny decision coerced to shadow_logged");
                    shadow_coerced_response(evaluation)
                }
                GatewayMode::Enforce => deny_response(evaluation),
            },
        }
    }

    async fn enter_pending_approval(
        &self,
        request: &AgentRequest,
        evaluation: &PolicyEvaluationResult,
    ) -> GatewayResponse {
        let approval = ApprovalRequest::new(
            request.request_id,
            request.agent_id.clone(),
            request.action_type,
            request.target_resource.clone(),
            evaluation.risk_score,
            evaluation.risk_level,
            evaluation.matched_rules.clone(),
            evaluation.sanitized_request.parameters.clone(),
            evaluation.sanitized_request.context.clone(),
            self.approval_ttl_secs,
        );
        let approval_id = approval.approval_id;

        {
            let mut guard = self.pending.lock().expect("approval store lock poisoned");
            guard.insert(approval_id, approval.clone());
        }

        let payload = ApprovalWebhookPayload::from(&approval);
        if let Err(err) = self.transport.dispatch(&payload).await {
            tracing::warn!(request_id = %request.request_id, %approval_id, error = %err, "approval webhook dispatch failed");
        }

        GatewayResponse {
            request_id: evaluation.request_id,
            decision: DecisionType::PendingApproval,
            message: "action suspended pending human approval".to_string(),
            risk_level: evaluation.risk_level,
            forwarded: false,
            approval_id: Some(approval_id),
            timestamp: Utc::now(),
        }
    }

    /// Submit a decision for a pending approval. Looks up and atomically
    /// removes the record; a second submission for the same id (or an
    /// unknown id) returns `None`.
    pub fn process_decision(
        &self,
        approval_id: Uuid,
        approved: bool,
        approver_id: Option<String>,
        reason: Option<String>,
    ) -> Option<ApprovalResponse> {
        let mut guard = self.pending.lock().expect("approval store lock poisoned");
        let _record = guard.remove(&approval_id)?;
        Some(ApprovalResponse {
            approval_id,
            status: if approved { ApprovalStatus::Approved } else { ApprovalStatus::Denied },
            approver_id,
            reason,
            approved_at: Utc::now(),
        })
    }

    /// Drop any pending approval records past their TTL. A real deployment
    /// would run this periodically; it is exposed here so tests can assert
    /// expiry deterministically without sleeping.
    pub fn expire_stale_approvals(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.pending.lock().expect("approval store lock poisoned");
        let before = guard.len();
        guard.retain(|_, approval| approval.expires_at.map_or(true, |exp| exp > now));
        before - guard.len()
    }
}

fn allow_response(evaluation: &PolicyEvaluationResult) -> GatewayResponse {
    GatewayResponse {
        request_id: evaluation.request_id,
        decision: DecisionType::Allow,
        message: "allowed".to_string(),
        risk_level: evaluation.risk_level,
        forwarded: true,
        approval_id: None,
        timestamp: Utc::now(),
    }
}

fn deny_response(evaluation: &PolicyEvaluationResult) -> GatewayResponse {
    GatewayResponse {
        request_id: evaluation.request_id,
        decision: DecisionType::Deny,
        message: format!("denied: {}", evaluation.denial_reasons.join("; ")),
        risk_level: evaluation.risk_level,
        forwarded: false,
        approval_id: None,
        timestamp: Utc::now(),
    }
}

fn shadow_coerced_response(evaluation: &PolicyEvaluationResult) -> GatewayResponse {
    let message = if evaluation.denial_reasons.is_empty() {
        "shadow mode: would have required approval".to_string()
    } else {
        format!("shadow mode: would have denied: {}", evaluation.denial_reasons.join("; "))
    };
    GatewayResponse {
        request_id: evaluation.request_id,
        decision: DecisionType::ShadowLogged,
        message,
        risk_level: evaluation.risk_level,
        forwarded: true,
        approval_id: None,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::{ActionType, JsonObject, SanitizedRequest};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingTransport {
        dispatched: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ApprovalTransport for RecordingTransport {
        async fn dispatch(&self, _payload: &ApprovalWebhookPayload) -> Result<(), BreakerError> {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn evaluation(decision: DecisionType, risk_score: f64) -> PolicyEvaluationResult {
        PolicyEvaluationResult {
            request_id: Uuid::new_v4(),
            decision,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            matched_rules: vec!["refund_limit_500".to_string()],
            denial_reasons: vec!["amount $750 exceeds $500".to_string()],
            sanitized_request: SanitizedRequest {
                agent_id: "agent-1".to_string(),
                action_type: ActionType::Refund,
                target_resource: "refunds".to_string(),
                parameters: JsonObject::new(),
                context: JsonObject::new(),
            },
            pii_detected: false,
            pii_fields: Vec::new(),
            evaluation_time_ms: 0.1,
            timestamp: Utc::now(),
        }
    }

    fn request() -> AgentRequest {
        AgentRequest::new("agent-1", ActionType::Refund, "refunds", JsonObject::new(), JsonObject::new()).unwrap()
    }

    #[tokio::test]
    async fn deny_under_enforce_blocks() {
        let transport = Arc::new(RecordingTransport { dispatched: AtomicUsize::new(0) });
        let breaker = CircuitBreaker::new(GatewayMode::Enforce, transport);
        let response = breaker.process(&request(), &evaluation(DecisionType::Deny, 1.0)).await;
        assert_eq!(response.decision, DecisionType::Deny);
        assert!(!response.forwarded);
    }

    #[tokio::test]
    async fn deny_under_shadow_is_coerced_and_forwarded() {
        let transport = Arc::new(RecordingTransport { dispatched: AtomicUsize::new(0) });
        let breaker = CircuitBreaker::new(GatewayMode::Shadow, transport);
        let response = breaker.process(&request(), &evaluation(DecisionType::Deny, 1.0)).await;
        assert_eq!(response.decision, DecisionType::ShadowLogged);
        assert!(response.forwarded);
    }

    #[tokio::test]
    async fn pending_approval_under_enforce_creates_record_and_dispatches() {
        let transport = Arc::new(RecordingTransport { dispatched: AtomicUsize::new(0) });
        let breaker = CircuitBreaker::new(GatewayMode::Enforce, transport.clone());
        let response = breaker.process(&request(), &evaluation(DecisionType::PendingApproval, 0.85)).await;
        assert_eq!(response.decision, DecisionType::PendingApproval);
        assert!(!response.forwarded);
        assert!(response.approval_id.is_some());
        assert_eq!(transport.dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_approval_under_shadow_never_blocks() {
        let transport = Arc::new(RecordingTransport { dispatched: AtomicUsize::new(0) });
        let breaker = CircuitBreaker::new(GatewayMode::Shadow, transport.clone());
        let response = breaker.process(&request(), &evaluation(DecisionType::PendingApproval, 0.85)).await;
        assert_eq!(response.decision, DecisionType::ShadowLogged);
        assert!(response.forwarded);
        assert_eq!(transport.dispatched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn process_decision_is_idempotent() {
        let transport = Arc::new(RecordingTransport { dispatched: AtomicUsize::new(0) });
        let breaker = CircuitBreaker::new(GatewayMode::Enforce, transport);
        let response = breaker.process(&request(), &evaluation(DecisionType::PendingApproval, 0.85)).await;
        let approval_id = response.approval_id.unwrap();

        let first = breaker.process_decision(approval_id, true, Some("alice".to_string()), None);
        assert!(first.is_some());
        assert_eq!(first.unwrap().status, ApprovalStatus::Approved);

        let second = breaker.process_decision(approval_id, true, Some("alice".to_string()), None);
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn allow_is_always_forwarded_regardless_of_mode() {
        let transport = Arc::new(RecordingTransport { dispatched: AtomicUsize::new(0) });
        let breaker = CircuitBreaker::new(GatewayMode::Shadow, transport);
        let response = breaker.process(&request(), &evaluation(DecisionType::Allow, 0.1)).await;
        assert_eq!(response.decision, DecisionType::Allow);
        assert!(response.forwarded);
    }

    #[tokio::test]
    async fn configured_approval_ttl_is_applied_to_new_records() {
        let transport = Arc::new(RecordingTransport { dispatched: AtomicUsize::new(0) });
        let breaker = CircuitBreaker::with_approval_ttl(GatewayMode::Enforce, transport, 30);
        let response = breaker.process(&request(), &evaluation(DecisionType::PendingApproval, 0.85)).await;
        let approval_id = response.approval_id.unwrap();

        // Past the 30s TTL but well inside the 24h default, proving the
        // configured value, not the default, governs expiry.
        let past_custom_ttl = Utc::now() + chrono::Duration::seconds(31);
        assert_eq!(breaker.expire_stale_approvals(past_custom_ttl), 1);
        assert!(breaker.process_decision(approval_id, true, None, None).is_none());
    }
}
