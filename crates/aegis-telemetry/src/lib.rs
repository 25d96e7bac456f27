//! Structured logging bootstrap and in-process decision/risk counters for
//! the governance gateway.

#![deny(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use aegis_core::DecisionType;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("otel setup failed: {0}")]
    Otel(String),
}

/// Initialize structured logging (JSON) with env filter.
/// Set `RUST_LOG`, e.g. "info,aegis_policy=debug".
pub fn init_json_logging() {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Initialize OpenTelemetry tracer (optional; behind `otel` feature).
#[cfg(feature = "otel")]
pub fn init_otel(service_name: &str) -> Result<(), TelemetryError> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::trace as sdktrace;
    use opentelemetry_sdk::{runtime, Resource};

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name.to_owned())]);
    let _tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().http())
        .with_trace_config(sdktrace::config().with_resource(resource))
        .install_batch(runtime::Tokio)
        .map_err(|e| TelemetryError::Otel(e.to_string()))?;
    Ok(())
}

#[cfg(feature = "otel")]
pub mod metrics {
    //! OTel metrics (OTLP) mirroring the in-process `DecisionCounters` below.
    use super::TelemetryError;
    use once_cell::sync::OnceCell;
    use opentelemetry::global;
    use opentelemetry::metrics::{Counter, Histogram, Meter};

    static METRICS_INIT: OnceCell<()> = OnceCell::new();

    fn detect_service_name() -> String {
        std::env::var("OTEL_SERVICE_NAME")
            .or_else(|_| std::env::var("AEGIS_SERVICE_NAME"))
            .unwrap_or_else(|_| "aegis-gateway".to_string())
    }

    fn init_metrics_from_env() -> Result<(), TelemetryError> {
        let _svc = detect_service_name();
        let provider = opentelemetry_otlp::new_pipeline()
            .metrics(opentelemetry_sdk::runtime::Tokio)
            .with_exporter(opentelemetry_otlp::new_exporter().http())
            .build()
            .map_err(|e| TelemetryError::Otel(e.to_string()))?;
        global::set_meter_provider(provider);
        Ok(())
    }

    /// Initialize (idempotent) global metrics provider from env.
    fn ensure_metrics_provider() {
        let _ = METRICS_INIT.get_or_init(|| {
            let _ = init_metrics_from_env();
        });
    }

    #[derive(Clone)]
    pub struct GatewayInstruments {
        decisions: Counter<u64>,
        risk_score: Histogram<u64>,
    }

    impl GatewayInstruments {
        /// Record one evaluation outcome: increments the decision counter
        /// (tagged by decision kind) and the risk-score histogram (in
        /// thousandths, since OTel counters here are integer-valued).
        pub fn record(&self, decision: &str, risk_score_millis: u64) {
            self.decisions.add(1, &[opentelemetry::KeyValue::new("decision", decision.to_string())]);
            self.risk_score.record(risk_score_millis, &[]);
        }
    }

    pub fn init_gateway_instruments() -> GatewayInstruments {
        ensure_metrics_provider();
        let meter: Meter = global::meter("aegis.gateway");
        GatewayInstruments {
            decisions: meter
                .u64_counter("aegis.gateway.decisions.total")
                .with_description("Policy evaluation decisions, by kind")
                .init(),
            risk_score: meter
                .u64_histogram("aegis.gateway.risk_score_millis")
                .with_description("Evaluated risk score in thousandths")
                .init(),
        }
    }
}

/// In-process counters for evaluation decisions, independent of whether an
/// OTel exporter is configured. Always available; cheap enough to update on
/// every request.
#[derive(Clone, Default)]
pub struct DecisionCounters {
    allow: Arc<AtomicU64>,
    deny: Arc<AtomicU64>,
    pending_approval: Arc<AtomicU64>,
    shadow_logged: Arc<AtomicU64>,
    pii_detected: Arc<AtomicU64>,
    rate_limited: Arc<AtomicU64>,
}

/// Point-in-time snapshot of `DecisionCounters`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionSnapshot {
    pub allow: u64,
    pub deny: u64,
    pub pending_approval: u64,
    pub shadow_logged: u64,
    pub pii_detected: u64,
    pub rate_limited: u64,
}

impl DecisionCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one evaluated decision.
    pub fn record_decision(&self, decision: DecisionType) {
        let counter = match decision {
            DecisionType::Allow => &self.allow,
            DecisionType::Deny => &self.deny,
            DecisionType::PendingApproval => &self.pending_approval,
            DecisionType::ShadowLogged => &self.shadow_logged,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that PII was detected and masked in a request.
    pub fn record_pii_detected(&self) {
        self.pii_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rate-limit rejection.
    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> DecisionSnapshot {
        DecisionSnapshot {
            allow: self.allow.load(Ordering::Relaxed),
            deny: self.deny.load(Ordering::Relaxed),
            pending_approval: self.pending_approval.load(Ordering::Relaxed),
            shadow_logged: self.shadow_logged.load(Ordering::Relaxed),
            pii_detected: self.pii_detected.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}
