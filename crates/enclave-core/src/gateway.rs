//! Host side of `callTool`.
//!
//! Every tool request a worker sends goes through [`ToolCallScope::invoke`]:
//! allowlist, reference resolution, circuit breaker, the bridge call under a
//! deadline, optional lifting of large results into the sidecar, audit.
//! Only reference and sidecar failures end the execution; everything else
//! comes back to the script as a catchable failure.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use enclave_error::ToolError;
use serde_json::Value;
use tokio::time::Instant;

use crate::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::circuit_breaker::CircuitBreakerManager;
use crate::error::EnclaveError;
use crate::ipc::ToolCallOutcome;
use crate::redact::{sanitize_error_message, sanitize_tool_error};
use crate::resolver::{ReferenceResolver, ResolverLimits};
use crate::sidecar::{value_size, ReferenceSidecar, ReferenceSource};
use crate::slot::ToolHandler;
use crate::ToolBridge;

/// Failure code for a tool outside the execution's allowlist.
pub const TOOL_NOT_AVAILABLE: &str = "tool_not_available";
/// Failure code for a call refused by an open breaker.
pub const CIRCUIT_OPEN: &str = "circuit_open";

/// Tool-call tuning shared by every execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Deadline for one bridge call.
    pub tool_call_timeout: Duration,
    /// Results at least this large are returned as reference tokens.
    pub lift_threshold_bytes: Option<usize>,
    /// Budgets for resolving tokens in arguments.
    pub resolver: ResolverLimits,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tool_call_timeout: Duration::from_secs(30),
            lift_threshold_bytes: None,
            resolver: ResolverLimits::default(),
        }
    }
}

/// Shared tool-call machinery.
pub struct ToolGateway {
    bridge: Arc<dyn ToolBridge>,
    breakers: Arc<CircuitBreakerManager>,
    sidecar: Arc<ReferenceSidecar>,
    audit: Arc<dyn AuditSink>,
    config: GatewayConfig,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<crate::metrics::EnclaveMetrics>>,
}

impl std::fmt::Debug for ToolGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolGateway")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ToolGateway {
    /// Assemble a gateway.
    pub fn new(
        bridge: Arc<dyn ToolBridge>,
        breakers: Arc<CircuitBreakerManager>,
        sidecar: Arc<ReferenceSidecar>,
        audit: Arc<dyn AuditSink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            bridge,
            breakers,
            sidecar,
            audit,
            config,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Count tool calls in `metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::EnclaveMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Breakers keyed by tool target.
    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Per-execution view: allowlist plus a resolver bound to the owner.
    pub fn scope(
        self: &Arc<Self>,
        execution_id: impl Into<String>,
        tools_available: Option<&[String]>,
    ) -> ToolCallScope {
        let execution_id = execution_id.into();
        let resolver = ReferenceResolver::new(
            self.sidecar.clone(),
            execution_id.clone(),
            self.config.resolver.clone(),
        );
        ToolCallScope {
            gateway: self.clone(),
            allowed: tools_available.map(|t| t.iter().cloned().collect()),
            execution_id,
            resolver,
        }
    }

    fn record_metrics(&self, _success: bool) {
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            m.record_tool_call(_success);
        }
    }
}

/// One execution's tool-call context.
pub struct ToolCallScope {
    gateway: Arc<ToolGateway>,
    execution_id: String,
    allowed: Option<BTreeSet<String>>,
    resolver: ReferenceResolver,
}

impl std::fmt::Debug for ToolCallScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCallScope")
            .field("execution_id", &self.execution_id)
            .field("allowed", &self.allowed)
            .finish_non_exhaustive()
    }
}

impl ToolCallScope {
    /// Execution this scope belongs to.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Bytes resolved from references so far.
    pub fn resolved_bytes(&self) -> u64 {
        self.resolver.resolved_bytes()
    }

    async fn audit(&self, kind: AuditEventKind) {
        self.gateway
            .audit
            .record(&AuditEvent::now(&self.execution_id, kind))
            .await;
    }

    async fn refuse(&self, tool: &str, started: Instant, code: &str, message: String) -> ToolCallOutcome {
        self.audit(AuditEventKind::ToolCallFailed {
            tool: tool.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            code: code.to_string(),
            message: message.clone(),
        })
        .await;
        self.gateway.record_metrics(false);
        ToolCallOutcome::failed(code, message)
    }

    fn not_available(&self, tool: &str) -> String {
        let mut message = format!("tool '{tool}' is not available to this script");
        if let Some(allowed) = &self.allowed {
            let known: Vec<&str> = allowed.iter().map(String::as_str).collect();
            if let Some(hint) = enclave_error::find_similar_tool(tool, &known) {
                message.push_str(". ");
                message.push_str(&hint);
            }
        }
        message
    }

    fn bridge_failure(&self, tool: &str, err: &ToolError) -> String {
        let mut message = sanitize_tool_error(tool, &err.to_string());
        if let ToolError::NotFound { .. } = err {
            let known = self.gateway.bridge.known_tools();
            let known: Vec<&str> = known.iter().map(String::as_str).collect();
            if let Some(hint) = enclave_error::find_similar_tool(tool, &known) {
                message.push_str(". ");
                message.push_str(&hint);
            }
        }
        message
    }

    /// Run one tool request from the script.
    pub async fn invoke(&self, tool: String, args: Value) -> ToolCallOutcome {
        let started = Instant::now();
        let args_bytes = value_size(&args).unwrap_or(0);
        self.audit(AuditEventKind::ToolCallStarted {
            tool: tool.clone(),
            args_bytes,
        })
        .await;

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&tool) {
                let message = self.not_available(&tool);
                return self.refuse(&tool, started, TOOL_NOT_AVAILABLE, message).await;
            }
        }

        // Reference faults end the execution and never count against the target.
        let args = match self.resolver.resolve_args(args) {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!(
                    execution_id = %self.execution_id,
                    tool = %tool,
                    error = %e,
                    "argument resolution failed"
                );
                let outcome = ToolCallOutcome::fatal(&e);
                self.audit(AuditEventKind::ToolCallFailed {
                    tool,
                    duration_ms: started.elapsed().as_millis() as u64,
                    code: e.kind().as_str().to_string(),
                    message: sanitize_error_message(&e.to_string()),
                })
                .await;
                self.gateway.record_metrics(false);
                return outcome;
            }
        };

        let target = self.gateway.bridge.target_id(&tool);
        let breaker = self.gateway.breakers.get(&target);
        // Held across the bridge call; a cancelled call releases it on drop.
        let Some(permit) = breaker.try_acquire() else {
            let err = EnclaveError::CircuitOpen { target };
            return self.refuse(&tool, started, CIRCUIT_OPEN, err.to_string()).await;
        };

        let timeout = self.gateway.config.tool_call_timeout;
        let result = match tokio::time::timeout(timeout, self.gateway.bridge.invoke(&tool, args)).await {
            Ok(r) => r,
            Err(_) => Err(ToolError::Timeout {
                tool: tool.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        let value = match result {
            Ok(value) => {
                permit.record_success();
                value
            }
            Err(e) => {
                permit.record_failure();
                tracing::debug!(
                    execution_id = %self.execution_id,
                    tool = %tool,
                    code = e.code(),
                    "tool call failed"
                );
                let message = self.bridge_failure(&tool, &e);
                return self
                    .refuse(&tool, started, &e.code().to_ascii_lowercase(), message)
                    .await;
            }
        };

        let result_bytes = match value_size(&value) {
            Ok(n) => n,
            Err(e) => return ToolCallOutcome::fatal(&e),
        };
        let value = match self.gateway.config.lift_threshold_bytes {
            Some(threshold) if result_bytes >= threshold => {
                match self
                    .gateway
                    .sidecar
                    .store(&self.execution_id, value, ReferenceSource::ToolResult)
                {
                    Ok(handle) => Value::String(handle.as_str().to_string()),
                    Err(e) => {
                        self.gateway.record_metrics(false);
                        return ToolCallOutcome::fatal(&e);
                    }
                }
            }
            _ => value,
        };

        self.audit(AuditEventKind::ToolCallSucceeded {
            tool,
            duration_ms: started.elapsed().as_millis() as u64,
            result_bytes,
        })
        .await;
        self.gateway.record_metrics(true);
        ToolCallOutcome::Ok { value }
    }
}

#[async_trait]
impl ToolHandler for ToolCallScope {
    async fn invoke(&self, tool: String, args: Value) -> ToolCallOutcome {
        ToolCallScope::invoke(self, tool, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopAuditSink;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::error::ErrorKind;
    use crate::sidecar::SidecarConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBridge {
        calls: Mutex<Vec<(String, Value)>>,
        fail: bool,
        slow: bool,
    }

    #[async_trait]
    impl ToolBridge for RecordingBridge {
        async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
            self.calls.lock().unwrap().push((tool.to_string(), args.clone()));
            if self.slow {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.fail {
                return Err(ToolError::Upstream {
                    tool: tool.to_string(),
                    message: "503 from backend".into(),
                });
            }
            Ok(serde_json::json!({ "tool": tool, "args": args }))
        }

        fn known_tools(&self) -> Vec<String> {
            vec!["github.search".into()]
        }
    }

    struct Fixture {
        bridge: Arc<RecordingBridge>,
        sidecar: Arc<ReferenceSidecar>,
        gateway: Arc<ToolGateway>,
    }

    fn fixture(bridge: RecordingBridge, config: GatewayConfig) -> Fixture {
        let bridge = Arc::new(bridge);
        let sidecar = Arc::new(ReferenceSidecar::new(SidecarConfig::default()));
        let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        }));
        let gateway = Arc::new(ToolGateway::new(
            bridge.clone(),
            breakers,
            sidecar.clone(),
            Arc::new(NoopAuditSink),
            config,
        ));
        Fixture {
            bridge,
            sidecar,
            gateway,
        }
    }

    #[tokio::test]
    async fn passes_resolved_arguments_to_the_bridge() {
        let f = fixture(RecordingBridge::default(), GatewayConfig::default());
        let handle = f
            .sidecar
            .store("e1", serde_json::json!("big payload"), ReferenceSource::Extraction)
            .unwrap();
        let scope = f.gateway.scope("e1", None);

        let outcome = scope
            .invoke("docs.put".into(), serde_json::json!({ "body": handle.as_str() }))
            .await;
        assert!(matches!(outcome, ToolCallOutcome::Ok { .. }));
        let calls = f.bridge.calls.lock().unwrap();
        assert_eq!(calls[0].1, serde_json::json!({ "body": "big payload" }));
    }

    #[tokio::test]
    async fn foreign_reference_is_fatal_and_skips_the_bridge() {
        let f = fixture(RecordingBridge::default(), GatewayConfig::default());
        let handle = f
            .sidecar
            .store("other", serde_json::json!("secret"), ReferenceSource::Extraction)
            .unwrap();
        let scope = f.gateway.scope("e1", None);

        let outcome = scope
            .invoke("docs.put".into(), serde_json::json!([handle.as_str()]))
            .await;
        let ToolCallOutcome::Fatal { kind, message } = outcome else {
            panic!("expected fatal outcome");
        };
        assert_eq!(kind, ErrorKind::ReferenceNotFound);
        assert!(!message.contains("secret"));
        assert!(f.bridge.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unlisted_tool_is_refused_with_suggestion() {
        let f = fixture(RecordingBridge::default(), GatewayConfig::default());
        let allowed = vec!["github.search".to_string()];
        let scope = f.gateway.scope("e1", Some(&allowed));

        let outcome = scope.invoke("github.serch".into(), Value::Null).await;
        let ToolCallOutcome::Failed { code, message } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(code, TOOL_NOT_AVAILABLE);
        assert!(message.contains("Did you mean 'github.search'?"), "{message}");
        assert!(f.bridge.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_open_the_target_breaker() {
        let f = fixture(
            RecordingBridge {
                fail: true,
                ..Default::default()
            },
            GatewayConfig::default(),
        );
        let scope = f.gateway.scope("e1", None);

        for _ in 0..2 {
            let outcome = scope.invoke("flaky.get".into(), Value::Null).await;
            assert!(matches!(outcome, ToolCallOutcome::Failed { ref code, .. } if code == "upstream_error"));
        }
        assert_eq!(f.gateway.breakers().get("flaky").state(), CircuitState::Open);

        let outcome = scope.invoke("flaky.list".into(), Value::Null).await;
        let ToolCallOutcome::Failed { code, message } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(code, CIRCUIT_OPEN);
        assert!(message.contains("'flaky'"));
        assert_eq!(f.bridge.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out_as_failure() {
        let f = fixture(
            RecordingBridge {
                slow: true,
                ..Default::default()
            },
            GatewayConfig {
                tool_call_timeout: Duration::from_millis(100),
                ..GatewayConfig::default()
            },
        );
        let scope = f.gateway.scope("e1", None);
        let outcome = scope.invoke("slow.op".into(), Value::Null).await;
        assert!(matches!(outcome, ToolCallOutcome::Failed { ref code, .. } if code == "timeout"));
        assert_eq!(f.gateway.breakers().get("slow").failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_does_not_wedge_half_open_breaker() {
        let f = fixture(
            RecordingBridge {
                slow: true,
                ..Default::default()
            },
            GatewayConfig::default(),
        );
        let breaker = f.gateway.breakers().get("slow");
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::advance(CircuitBreakerConfig::default().reset_timeout).await;

        let scope = f.gateway.scope("e1", None);
        let cut_short =
            tokio::time::timeout(Duration::from_millis(10), scope.invoke("slow.op".into(), Value::Null)).await;
        assert!(cut_short.is_err(), "the bridge call should still be pending");
        assert_eq!(f.bridge.calls.lock().unwrap().len(), 1);

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.trials_in_flight(), 0);
        assert!(breaker.try_acquire().is_some(), "a later trial must be admitted");
    }

    #[tokio::test]
    async fn large_results_are_lifted_into_the_sidecar() {
        let f = fixture(
            RecordingBridge::default(),
            GatewayConfig {
                lift_threshold_bytes: Some(16),
                ..GatewayConfig::default()
            },
        );
        let scope = f.gateway.scope("e1", None);
        let ToolCallOutcome::Ok { value } = scope.invoke("a.b".into(), serde_json::json!({ "q": 1 })).await else {
            panic!("expected value");
        };
        let token = value.as_str().unwrap();
        assert!(crate::sidecar::is_reference(token));
        let stored = f.sidecar.resolve_scoped("e1", token).unwrap();
        assert_eq!(stored["tool"], "a.b");
    }
}
