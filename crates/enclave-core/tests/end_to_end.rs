//! Full pipeline tests: validation, transformation, a real V8 worker on a
//! thread slot, tool calls through the gateway.
//!
//! Serialized because every test starts V8 isolates.

use std::sync::{Arc, Mutex};

use enclave_core::audit::{AuditEvent, AuditSink};
use enclave_core::circuit_breaker::CircuitState;
use enclave_core::pool::PoolConfig;
use enclave_core::validator::PolicyOverrides;
use enclave_core::{
    Enclave, EnclaveConfig, ErrorKind, ExecutionRequest, FaultOrigin, SecurityLevel, ToolBridge,
};
use enclave_error::ToolError;
use serde_json::{json, Value};
use serial_test::serial;

#[derive(Default)]
struct RecordingBridge {
    calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait::async_trait]
impl ToolBridge for RecordingBridge {
    async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        self.calls.lock().unwrap().push((tool.to_string(), args.clone()));
        match tool {
            "down.get" => Err(ToolError::Upstream {
                tool: tool.into(),
                message: "connection refused".into(),
            }),
            "text.length" => Ok(json!(args["text"].as_str().map(str::len))),
            _ => Ok(json!({ "tool": tool, "ok": true })),
        }
    }
}

#[derive(Default)]
struct MemoryAudit {
    events: Mutex<Vec<Value>>,
}

#[async_trait::async_trait]
impl AuditSink for MemoryAudit {
    async fn record(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap()
            .push(serde_json::to_value(event).unwrap());
    }
}

fn enclave_with(bridge: Arc<RecordingBridge>, audit: Arc<MemoryAudit>) -> Enclave {
    let config = EnclaveConfig {
        pool: PoolConfig {
            slots: 1,
            ..PoolConfig::default()
        },
        ..EnclaveConfig::default()
    };
    Enclave::builder(bridge)
        .config(config)
        .audit_sink(audit)
        .build()
        .unwrap()
}

#[tokio::test]
#[serial]
async fn loop_console_and_tool_call_under_secure_preset() {
    let bridge = Arc::new(RecordingBridge::default());
    let enclave = enclave_with(bridge.clone(), Arc::new(MemoryAudit::default()));

    let request = ExecutionRequest::new(
        "for (let i=0;i<3;i++) console.log(i); return callTool('x.y', {});",
    )
    .with_security_level(SecurityLevel::Secure)
    .with_policy_overrides(PolicyOverrides {
        allow_loops: Some(true),
        ..Default::default()
    });

    let result = enclave.run(request).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value, Some(json!({ "tool": "x.y", "ok": true })));
    assert_eq!(result.stats.tool_call_count, 1);
    assert_eq!(result.stats.console_calls, 3);
    assert_eq!(result.stats.iterations, 3);
    assert_eq!(bridge.calls.lock().unwrap().len(), 1);

    enclave.shutdown().await;
}

#[tokio::test]
#[serial]
async fn large_literal_travels_by_reference() {
    let bridge = Arc::new(RecordingBridge::default());
    let enclave = enclave_with(bridge.clone(), Arc::new(MemoryAudit::default()));
    let big = "z".repeat(20_000);

    let result = enclave
        .run(ExecutionRequest::new(format!(
            "const doc = \"{big}\"; return await callTool('text.length', {{ text: doc }});"
        )))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value, Some(json!(20_000)));
    let calls = bridge.calls.lock().unwrap();
    assert_eq!(calls[0].1["text"].as_str().unwrap().len(), 20_000);
    drop(calls);
    assert!(enclave.sidecar().is_empty(), "references outlived the execution");

    enclave.shutdown().await;
}

#[tokio::test]
#[serial]
async fn tool_failures_are_catchable_and_open_the_breaker() {
    let bridge = Arc::new(RecordingBridge::default());
    let enclave = enclave_with(bridge.clone(), Arc::new(MemoryAudit::default()));

    let script = r#"
        const seen = [];
        for (let i = 0; i < 7; i++) {
            try {
                await callTool('down.get', { i });
                seen.push('ok');
            } catch (e) {
                seen.push(e.message.includes('circuit') ? 'open' : 'failed');
            }
        }
        return seen;
    "#;
    let result = enclave.run(ExecutionRequest::new(script)).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.value,
        Some(json!(["failed", "failed", "failed", "failed", "failed", "open", "open"]))
    );
    assert_eq!(bridge.calls.lock().unwrap().len(), 5);
    assert_eq!(enclave.breakers().get("down").state(), CircuitState::Open);

    enclave.shutdown().await;
}

#[tokio::test]
#[serial]
async fn uncaught_throw_is_a_script_fault() {
    let enclave = enclave_with(Arc::default(), Arc::new(MemoryAudit::default()));
    let result = enclave
        .run(ExecutionRequest::new("throw new Error('bad input at /home/me/x.js:3:7');"))
        .await;

    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Script);
    assert_eq!(error.origin, FaultOrigin::Script);
    assert!(!error.message.contains("/home/me"), "{}", error.message);

    enclave.shutdown().await;
}

#[tokio::test]
#[serial]
async fn tools_outside_the_allowlist_are_refused() {
    let bridge = Arc::new(RecordingBridge::default());
    let enclave = enclave_with(bridge.clone(), Arc::new(MemoryAudit::default()));
    let request = ExecutionRequest::new(
        "try { await callTool('admin.drop', {}); } catch (e) { return e.message; }",
    )
    .with_tools(["x.y"]);

    let result = enclave.run(request).await;
    let message = result.value.unwrap();
    assert!(message.as_str().unwrap().contains("not available"), "{message}");
    assert!(bridge.calls.lock().unwrap().is_empty());

    enclave.shutdown().await;
}

#[tokio::test]
#[serial]
async fn audit_trail_has_hash_but_no_source_or_payloads() {
    let audit = Arc::new(MemoryAudit::default());
    let enclave = enclave_with(Arc::default(), audit.clone());
    let result = enclave
        .run(ExecutionRequest::new(
            "return await callTool('x.y', { secret: 'hunter2' });",
        ))
        .await;
    assert!(result.success, "{:?}", result.error);

    let events = audit.events.lock().unwrap().clone();
    let names: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
    assert_eq!(
        names,
        vec![
            "execution_started",
            "tool_call_started",
            "tool_call_succeeded",
            "execution_succeeded"
        ]
    );
    let all = serde_json::to_string(&events).unwrap();
    assert!(!all.contains("hunter2"));
    assert!(!all.contains("callTool"));
    assert_eq!(events[0]["script_hash"].as_str().unwrap().len(), 64);
    assert!(events.iter().all(|e| e["execution_id"] == result.execution_id.as_str()));

    enclave.shutdown().await;
}

#[tokio::test]
#[serial]
async fn executions_do_not_share_state() {
    let enclave = enclave_with(Arc::default(), Arc::new(MemoryAudit::default()));
    let first = enclave
        .run(ExecutionRequest::new("Array.prototype.leak = 1; return 1;"))
        .await;
    assert!(first.success, "{:?}", first.error);

    let second = enclave
        .run(ExecutionRequest::new("return typeof [].leak;"))
        .await;
    assert_eq!(second.value, Some(json!("undefined")));

    enclave.shutdown().await;
}
