//! Process-backed slots: executions run in the `enclave-worker` binary.
//!
//! The binary is found next to the test executable, so these tests only run
//! when the workspace was built (`cargo test --workspace`). Each test returns
//! early when it is missing. All tests are serialized to keep worker
//! processes from competing for CPU.

use std::sync::Arc;
use std::time::Duration;

use enclave_core::audit::JsonLinesAuditSink;
use enclave_core::host::find_worker_binary;
use enclave_core::pool::{PoolConfig, SlotBackend};
use enclave_core::{
    Enclave, EnclaveConfig, ErrorKind, ExecutionRequest, LimitOverrides, SecurityLevel, ToolBridge,
};
use enclave_error::ToolError;
use serde_json::{json, Value};
use serial_test::serial;

struct EchoBridge;

#[async_trait::async_trait]
impl ToolBridge for EchoBridge {
    async fn invoke(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        Ok(json!({ "tool": tool, "args": args, "status": "ok" }))
    }
}

fn process_config() -> EnclaveConfig {
    EnclaveConfig {
        pool: PoolConfig {
            slots: 1,
            backend: SlotBackend::Process,
            kill_grace: Duration::from_millis(500),
            ..PoolConfig::default()
        },
        ..EnclaveConfig::default()
    }
}

fn worker_available() -> bool {
    match find_worker_binary() {
        Ok(_) => true,
        Err(e) => {
            eprintln!("skipping: {e}");
            false
        }
    }
}

fn enclave() -> Enclave {
    Enclave::builder(Arc::new(EchoBridge))
        .config(process_config())
        .build()
        .unwrap()
}

#[tokio::test]
#[serial]
async fn process_simple_execution() {
    if !worker_available() {
        return;
    }
    let enclave = enclave();
    let result = enclave
        .run(ExecutionRequest::new("const x = 21; return x * 2;"))
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value, Some(json!(42)));
    enclave.shutdown().await;
}

#[tokio::test]
#[serial]
async fn process_tool_calls_cross_ipc() {
    if !worker_available() {
        return;
    }
    let enclave = enclave();
    let source = r#"
        const a = await callTool('files.read', { path: 'a.txt' });
        const b = await callTool('files.read', { path: 'b.txt' });
        return [a.args.path, b.args.path, b.status];
    "#;
    let result = enclave.run(ExecutionRequest::new(source)).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value, Some(json!(["a.txt", "b.txt", "ok"])));
    assert_eq!(result.stats.tool_call_count, 2);
    enclave.shutdown().await;
}

#[tokio::test]
#[serial]
async fn process_script_error_is_reported() {
    if !worker_available() {
        return;
    }
    let enclave = enclave();
    let result = enclave
        .run(ExecutionRequest::new("throw new Error('intentional worker error');"))
        .await;
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Script);
    assert!(error.message.contains("intentional worker error"), "{}", error.message);
    enclave.shutdown().await;
}

#[tokio::test]
#[serial]
async fn process_busy_loop_times_out_and_slot_recovers() {
    if !worker_available() {
        return;
    }
    let enclave = enclave();
    let start = std::time::Instant::now();
    let result = enclave
        .run(
            ExecutionRequest::new("while (true) {}")
                .with_security_level(SecurityLevel::Permissive)
                .with_limits(LimitOverrides {
                    timeout_ms: Some(500),
                    max_iterations: Some(u64::MAX),
                    ..Default::default()
                }),
        )
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::WorkerTimeout));
    assert!(start.elapsed() < Duration::from_secs(10), "took {:?}", start.elapsed());

    let next = enclave.run(ExecutionRequest::new("return 'alive';")).await;
    assert_eq!(next.value, Some(json!("alive")), "{:?}", next.error);
    enclave.shutdown().await;
}

#[tokio::test]
#[serial]
async fn process_run_is_written_to_audit_log() {
    if !worker_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let sink = JsonLinesAuditSink::open(&path).await.unwrap();
    let enclave = Enclave::builder(Arc::new(EchoBridge))
        .config(process_config())
        .audit_sink(Arc::new(sink))
        .build()
        .unwrap();

    let result = enclave
        .run(ExecutionRequest::new("return await callTool('x.y', {});"))
        .await;
    assert!(result.success, "{:?}", result.error);
    enclave.shutdown().await;

    let content = std::fs::read_to_string(&path).unwrap();
    let events: Vec<Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0]["event"], "execution_started");
    assert_eq!(events[3]["event"], "execution_succeeded");
}
