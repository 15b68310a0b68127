//! Prometheus metrics for the enclave.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

use crate::circuit_breaker::CircuitState;
use crate::error::ErrorKind;

/// Label set for execution outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// `success` or `failure`.
    pub outcome: String,
}

/// Label set for error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// [`ErrorKind`] name.
    pub error_kind: String,
}

/// Label set for breaker transitions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BreakerLabels {
    /// Tool target id.
    pub target: String,
    /// State entered.
    pub state: String,
}

/// Enclave metrics, registered once per registry.
pub struct EnclaveMetrics {
    /// Executions by outcome.
    pub executions_total: Family<OutcomeLabels, Counter>,
    /// Execution duration in seconds.
    pub execution_duration_seconds: Family<OutcomeLabels, Histogram>,
    /// Failures by kind.
    pub errors_total: Family<ErrorLabels, Counter>,
    /// Tool calls by outcome.
    pub tool_calls_total: Family<OutcomeLabels, Counter>,
    /// Breaker transitions by target and new state.
    pub breaker_transitions_total: Family<BreakerLabels, Counter>,
    /// Slots currently running an execution.
    pub busy_slots: Gauge<i64, AtomicI64>,
    /// Requests waiting for a slot.
    pub queue_depth: Gauge<i64, AtomicI64>,
}

impl EnclaveMetrics {
    /// Create and register every metric.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "enclave_executions_total",
            "Total script executions",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<OutcomeLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(
                    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter(),
                )
            });
        registry.register(
            "enclave_execution_duration_seconds",
            "Script execution duration",
            execution_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "enclave_errors_total",
            "Failed executions by error kind",
            errors_total.clone(),
        );

        let tool_calls_total = Family::default();
        registry.register(
            "enclave_tool_calls_total",
            "Tool calls by outcome",
            tool_calls_total.clone(),
        );

        let breaker_transitions_total = Family::default();
        registry.register(
            "enclave_breaker_transitions_total",
            "Circuit breaker state transitions",
            breaker_transitions_total.clone(),
        );

        let busy_slots = Gauge::default();
        registry.register("enclave_busy_slots", "Slots running a script", busy_slots.clone());

        let queue_depth = Gauge::default();
        registry.register(
            "enclave_queue_depth",
            "Executions waiting for a slot",
            queue_depth.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            errors_total,
            tool_calls_total,
            breaker_transitions_total,
            busy_slots,
            queue_depth,
        }
    }

    fn outcome(success: bool) -> OutcomeLabels {
        OutcomeLabels {
            outcome: if success { "success" } else { "failure" }.to_string(),
        }
    }

    /// Record a finished execution.
    pub fn record_execution(&self, error: Option<ErrorKind>, duration_secs: f64) {
        let labels = Self::outcome(error.is_none());
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
        if let Some(kind) = error {
            self.errors_total
                .get_or_create(&ErrorLabels {
                    error_kind: kind.as_str().to_string(),
                })
                .inc();
        }
    }

    /// Record a finished tool call.
    pub fn record_tool_call(&self, success: bool) {
        self.tool_calls_total
            .get_or_create(&Self::outcome(success))
            .inc();
    }

    /// Record a breaker transition.
    pub fn record_breaker_transition(&self, target: &str, state: CircuitState) {
        self.breaker_transitions_total
            .get_or_create(&BreakerLabels {
                target: target.to_string(),
                state: state.as_str().to_string(),
            })
            .inc();
    }
}
