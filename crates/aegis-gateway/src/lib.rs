//! Wires the policy cache, rate limiter, policy engine, circuit breaker and
//! telemetry counters into one object graph — the "global singletons become
//! explicitly-constructed values" note from the design notes. Startup
//! constructs one `GatewayContext`; tests construct a different one with
//! in-memory collaborators.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use aegis_breaker::{ApprovalTransport, CircuitBreaker};
use aegis_cache::{PolicyCache, RateLimiter};
use aegis_core::{AgentRequest, GatewayConfig, GatewayMode, GatewayResponse, PolicyEvaluationResult};
use aegis_policy::{PolicyEngine, Thresholds};
use aegis_telemetry::DecisionCounters;

/// External collaborator that records the outcome of every evaluation for
/// later inspection. The durable implementation (database-backed) is out of
/// scope here; this trait is the seam a real HTTP surface would implement.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, evaluation: &PolicyEvaluationResult, response: &GatewayResponse);
}

/// Discards every record. The default when no audit sink is wired.
pub struct NullAuditSink;

#[async_trait::async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, _evaluation: &PolicyEvaluationResult, _response: &GatewayResponse) {}
}

/// Rejections that happen before a request reaches the policy engine.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("agent {agent_id} exceeded its rate limit; {remaining} requests remaining in window")]
    RateLimited { agent_id: String, remaining: u64 },
}

/// The fully wired application context for one gateway instance.
pub struct GatewayContext {
    rate_limiter: Arc<RateLimiter>,
    engine: PolicyEngine,
    breaker: CircuitBreaker,
    counters: DecisionCounters,
    audit: Arc<dyn AuditSink>,
}

impl GatewayContext {
    /// Build a context from `config`, starting in `mode`, dispatching
    /// approvals through `transport` and recording to `audit`.
    #[must_use]
    pub fn new(
        config: &GatewayConfig,
        mode: GatewayMode,
        transport: Arc<dyn ApprovalTransport>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let cache = Arc::new(PolicyCache::new(Duration::from_secs(config.policy_cache_ttl_secs)));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_requests,
            Duration::from_secs(config.rate_limit_window_secs),
        ));
        let thresholds = Thresholds {
            block: config.risk_score_block_threshold,
            approval: config.risk_score_approval_threshold,
        };
        Self {
            rate_limiter,
            engine: PolicyEngine::new(cache, thresholds),
            breaker: CircuitBreaker::with_approval_ttl(mode, transport, config.approval_ttl_secs),
            counters: DecisionCounters::new(),
            audit,
        }
    }

    #[must_use]
    pub fn policy_engine(&self) -> &PolicyEngine {
        &self.engine
    }

    #[must_use]
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn counters(&self) -> &DecisionCounters {
        &self.counters
    }

    /// Run one request through the full pipeline: rate limit, evaluate,
    /// apply mode semantics, record counters and audit.
    #[tracing::instrument(skip_all, fields(agent_id = %request.agent_id))]
    pub async fn handle(&self, request: AgentRequest) -> Result<GatewayResponse, GatewayError> {
        let (allowed, remaining) = self.rate_limiter.check(&request.agent_id);
        if !allowed {
            self.counters.record_rate_limited();
            tracing::warn!(agent_id = %request.agent_id, "rate limit exceeded");
            return Err(GatewayError::RateLimited { agent_id: request.agent_id.clone(), remaining });
        }

        let evaluation = self.engine.evaluate(&request);
        self.counters.record_decision(evaluation.decision);
        if evaluation.pii_detected {
            self.counters.record_pii_detected();
        }

        let response = self.breaker.process(&request, &evaluation).await;
        self.audit.record(&evaluation, &response).await;
        Ok(response)
    }
}
