//! The orchestrator: validate, transform, run on the pool, clean up.
//!
//! [`Enclave::run`] never returns an error. Every failure, from a parse
//! error to a worker crash, is folded into the [`ExecutionResult`].

use std::sync::Arc;
use std::time::Instant;

use crate::audit::{sha256_hex, AuditEvent, AuditEventKind, AuditSink, TracingAuditSink};
use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::EnclaveConfig;
use crate::error::EnclaveError;
use crate::gateway::ToolGateway;
use crate::host::WorkerSpawner;
use crate::pool::WorkerPool;
use crate::request::{ExecutionLimits, ExecutionRequest, ExecutionResult, ExecutionStats};
use crate::sidecar::ReferenceSidecar;
use crate::slot::SlotJob;
use crate::transform::{transform, TransformContext};
use crate::validator::{validate, PolicyOverrides, SecurityPolicy};
use crate::ToolBridge;

/// Builder for [`Enclave`].
pub struct EnclaveBuilder {
    config: EnclaveConfig,
    bridge: Arc<dyn ToolBridge>,
    audit: Arc<dyn AuditSink>,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<crate::metrics::EnclaveMetrics>>,
}

impl EnclaveBuilder {
    /// Start from defaults, audited through `tracing`.
    pub fn new(bridge: Arc<dyn ToolBridge>) -> Self {
        Self {
            config: EnclaveConfig::default(),
            bridge,
            audit: Arc::new(TracingAuditSink),
            spawner: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Replace the configuration.
    pub fn config(mut self, config: EnclaveConfig) -> Self {
        self.config = config;
        self
    }

    /// Send audit events to `sink`.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Use `spawner` instead of the configured backend.
    pub fn spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Report into `metrics`.
    #[cfg(feature = "metrics")]
    pub fn metrics(mut self, metrics: Arc<crate::metrics::EnclaveMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and start the pool. Must be called inside
    /// a tokio runtime.
    pub fn build(self) -> Result<Enclave, EnclaveError> {
        self.config.validate()?;
        let config = self.config;

        let sidecar = Arc::new(ReferenceSidecar::new(config.sidecar.clone()));

        #[allow(unused_mut)]
        let mut breakers = CircuitBreakerManager::new(config.breaker.clone());
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            let m = m.clone();
            breakers = breakers.with_transition_hook(Arc::new(
                move |target: &str, state: crate::circuit_breaker::CircuitState| {
                    m.record_breaker_transition(target, state)
                },
            ));
        }

        #[allow(unused_mut)]
        let mut gateway = ToolGateway::new(
            self.bridge,
            Arc::new(breakers),
            sidecar.clone(),
            self.audit.clone(),
            config.gateway.clone(),
        );
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            gateway = gateway.with_metrics(m.clone());
        }

        let spawner = self
            .spawner
            .unwrap_or_else(|| config.pool.spawner(&config.messages));
        let pool = WorkerPool::new(config.pool.clone(), config.messages.clone(), spawner)?;

        Ok(Enclave {
            config,
            sidecar,
            gateway: Arc::new(gateway),
            pool,
            audit: self.audit,
            #[cfg(feature = "metrics")]
            metrics: self.metrics,
        })
    }
}

/// A running sandbox: shared sidecar, breakers, and worker pool.
pub struct Enclave {
    config: EnclaveConfig,
    sidecar: Arc<ReferenceSidecar>,
    gateway: Arc<ToolGateway>,
    pool: WorkerPool,
    audit: Arc<dyn AuditSink>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<crate::metrics::EnclaveMetrics>>,
}

impl std::fmt::Debug for Enclave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enclave")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Request-level overrides win; lists are combined.
fn merge_overrides(request: &PolicyOverrides, base: &PolicyOverrides) -> PolicyOverrides {
    let mut additional = base.additional_disallowed.clone();
    additional.extend(request.additional_disallowed.iter().cloned());
    let mut allowed = base.allowed_identifiers.clone();
    allowed.extend(request.allowed_identifiers.iter().cloned());
    PolicyOverrides {
        allow_loops: request.allow_loops.or(base.allow_loops),
        allow_async: request.allow_async.or(base.allow_async),
        additional_disallowed: additional,
        allowed_identifiers: allowed,
    }
}

struct Prepared {
    code: String,
    limits: ExecutionLimits,
}

/// Frees an execution's sidecar entries when dropped, so a caller that
/// abandons [`Enclave::run`] mid-flight leaves nothing behind.
struct OwnedReferences<'a> {
    sidecar: &'a ReferenceSidecar,
    owner: &'a str,
    released: bool,
}

impl<'a> OwnedReferences<'a> {
    fn new(sidecar: &'a ReferenceSidecar, owner: &'a str) -> Self {
        Self {
            sidecar,
            owner,
            released: false,
        }
    }

    /// Dispose now and return how many entries went.
    fn release(mut self) -> usize {
        self.released = true;
        self.sidecar.dispose_owner(self.owner)
    }
}

impl Drop for OwnedReferences<'_> {
    fn drop(&mut self) {
        if !self.released {
            let disposed = self.sidecar.dispose_owner(self.owner);
            tracing::debug!(execution_id = self.owner, disposed, "execution abandoned by caller");
        }
    }
}

impl Enclave {
    /// Shorthand for [`EnclaveBuilder::new`].
    pub fn builder(bridge: Arc<dyn ToolBridge>) -> EnclaveBuilder {
        EnclaveBuilder::new(bridge)
    }

    /// Configuration in force.
    pub fn config(&self) -> &EnclaveConfig {
        &self.config
    }

    /// Shared reference store.
    pub fn sidecar(&self) -> &Arc<ReferenceSidecar> {
        &self.sidecar
    }

    /// Breakers keyed by tool target.
    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        self.gateway.breakers()
    }

    /// The worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run one script.
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let level = request
            .security_level
            .unwrap_or(self.config.default_security_level);

        tracing::info!(
            execution_id = %execution_id,
            script_bytes = request.script_source.len(),
            security_level = %level,
            "execution: starting"
        );
        self.audit
            .record(&AuditEvent::now(
                &execution_id,
                AuditEventKind::ExecutionStarted {
                    script_hash: sha256_hex(&request.script_source),
                    script_bytes: request.script_source.len(),
                    security_level: level,
                },
            ))
            .await;

        let references = OwnedReferences::new(&self.sidecar, &execution_id);
        let (result, stats, timeout_ms) = match self.prepare(&execution_id, &request) {
            Ok(prepared) => {
                let timeout_ms = prepared.limits.timeout_ms;
                let job = SlotJob {
                    execution_id: execution_id.clone(),
                    code: prepared.code,
                    limits: prepared.limits,
                    tools: Arc::new(
                        self.gateway
                            .scope(&execution_id, request.tools_available.as_deref()),
                    ),
                };
                match self.pool.submit(job).await {
                    Ok(outcome) => (outcome.result, outcome.stats, timeout_ms),
                    Err(e) => (Err(e.to_execution_error()), ExecutionStats::default(), timeout_ms),
                }
            }
            Err(e) => (Err(e.to_execution_error()), ExecutionStats::default(), 0),
        };

        let disposed = references.release();
        let mut stats = stats;
        if stats.elapsed_ms == 0 {
            stats.elapsed_ms = started.elapsed().as_millis() as u64;
        }

        self.audit
            .record(&AuditEvent::now(
                &execution_id,
                AuditEventKind::finished(&result, stats, timeout_ms),
            ))
            .await;
        self.record_metrics(&result, started);

        match &result {
            Ok(_) => tracing::info!(
                execution_id = %execution_id,
                elapsed_ms = stats.elapsed_ms,
                tool_calls = stats.tool_call_count,
                references_disposed = disposed,
                "execution: complete"
            ),
            Err(e) => tracing::warn!(
                execution_id = %execution_id,
                error_kind = %e.kind,
                error = %e.message,
                references_disposed = disposed,
                "execution: failed"
            ),
        }

        match result {
            Ok(value) => ExecutionResult::success(execution_id, value, stats),
            Err(error) => ExecutionResult::failure(execution_id, error, stats),
        }
    }

    /// Resolve limits, validate, and transform. Nothing touches the sidecar
    /// until validation has passed.
    fn prepare(&self, execution_id: &str, request: &ExecutionRequest) -> Result<Prepared, EnclaveError> {
        let level = request
            .security_level
            .unwrap_or(self.config.default_security_level);
        let limits = ExecutionLimits::resolve(
            &level.config(),
            &request.limits.or(&self.config.limit_overrides),
            self.config.max_result_bytes,
        )?;

        let overrides = merge_overrides(&request.policy_overrides, &self.config.policy_overrides);
        let policy = SecurityPolicy::with_overrides(level.preset_level(), &overrides)?;

        let script = validate(&request.script_source, &policy).into_script()?;
        let transformed = transform(
            &script,
            &policy,
            &TransformContext {
                sidecar: &self.sidecar,
                owner: execution_id,
                extraction_threshold: self.config.extraction_threshold,
            },
        )?;
        tracing::debug!(
            execution_id,
            extracted = transformed.extracted_count,
            renamed = transformed.renamed_count,
            loops = transformed.instrumented_loops,
            "script transformed"
        );
        Ok(Prepared {
            code: transformed.code,
            limits,
        })
    }

    fn record_metrics(
        &self,
        _result: &Result<serde_json::Value, crate::error::ExecutionError>,
        _started: Instant,
    ) {
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            m.record_execution(
                _result.as_ref().err().map(|e| e.kind),
                _started.elapsed().as_secs_f64(),
            );
            m.busy_slots.set(self.pool.busy_slots() as i64);
            m.queue_depth.set(self.pool.queue_depth() as i64);
        }
    }

    /// Drain running executions, reject queued ones, stop every worker.
    pub async fn shutdown(&self) {
        self.pool.dispose().await;
        let reaped = self.sidecar.reap_expired();
        tracing::info!(reaped, "enclave shut down");
    }
}
