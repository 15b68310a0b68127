//! Resource ceilings enforced end to end.

use std::sync::Arc;

use enclave_core::pool::PoolConfig;
use enclave_core::{
    Enclave, EnclaveConfig, ErrorKind, ExecutionRequest, LimitOverrides, SecurityLevel, ToolBridge,
};
use enclave_error::ToolError;
use serde_json::{json, Value};
use serial_test::serial;

struct EchoBridge;

#[async_trait::async_trait]
impl ToolBridge for EchoBridge {
    async fn invoke(&self, _tool: &str, args: Value) -> Result<Value, ToolError> {
        Ok(args)
    }
}

fn enclave() -> Enclave {
    Enclave::builder(Arc::new(EchoBridge))
        .config(EnclaveConfig {
            pool: PoolConfig {
                slots: 1,
                ..PoolConfig::default()
            },
            ..EnclaveConfig::default()
        })
        .build()
        .unwrap()
}

async fn run(source: &str, limits: LimitOverrides) -> enclave_core::ExecutionResult {
    let enclave = enclave();
    let result = enclave
        .run(ExecutionRequest::new(source).with_limits(limits))
        .await;
    enclave.shutdown().await;
    result
}

#[tokio::test]
#[serial]
async fn iteration_limit_never_yields_success() {
    let result = run(
        "let n = 0; for (let i = 0; i < 10000; i++) { n += i; } return n;",
        LimitOverrides {
            max_iterations: Some(1000),
            ..Default::default()
        },
    )
    .await;
    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::IterationLimit));
    assert!(result.value.is_none());
}

#[tokio::test]
#[serial]
async fn console_limit_trips_on_the_crossing_call() {
    let result = run(
        "const line = 'x'.repeat(100); for (let i = 0; i < 10; i++) { console.log(line); } return 'done';",
        LimitOverrides {
            max_console_bytes: Some(500),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ConsoleOutputLimit));
    assert_eq!(result.stats.console_calls, 5);
    assert_eq!(result.stats.console_bytes, 500);
}

#[tokio::test]
#[serial]
async fn console_call_limit() {
    let result = run(
        "for (let i = 0; i < 50; i++) { console.log(i); } return 1;",
        LimitOverrides {
            max_console_calls: Some(10),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ConsoleCallLimit));
}

#[tokio::test]
#[serial]
async fn busy_loop_times_out() {
    let enclave = enclave();
    let result = enclave
        .run(
            ExecutionRequest::new("let n = 0; while (true) { n++; }")
                .with_security_level(SecurityLevel::Permissive)
                .with_limits(LimitOverrides {
                    timeout_ms: Some(300),
                    max_iterations: Some(u64::MAX),
                    ..Default::default()
                }),
        )
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::WorkerTimeout));
    assert!(result.stats.elapsed_ms >= 300);

    // The slot is usable afterwards.
    let next = enclave.run(ExecutionRequest::new("return 'alive';")).await;
    assert_eq!(next.value, Some(json!("alive")));
    enclave.shutdown().await;
}

#[tokio::test]
#[serial]
async fn heap_ceiling_is_enforced() {
    let result = run(
        "const chunks = []; for (let i = 0; i < 1000000; i++) { chunks.push('x'.repeat(1024) + i); } return chunks.length;",
        LimitOverrides {
            max_memory_bytes: Some(16 * 1024 * 1024),
            max_iterations: Some(10_000_000),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::WorkerMemory));
}

#[tokio::test]
#[serial]
async fn tool_call_budget() {
    let result = run(
        "for (let i = 0; i < 5; i++) { await callTool('x.y', { i }); } return 'done';",
        LimitOverrides {
            max_tool_calls: Some(3),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ToolCallLimit));
    assert_eq!(result.stats.tool_call_count, 3);
}

#[tokio::test]
#[serial]
async fn oversized_result_is_rejected() {
    let enclave = Enclave::builder(Arc::new(EchoBridge))
        .config(EnclaveConfig {
            pool: PoolConfig {
                slots: 1,
                ..PoolConfig::default()
            },
            max_result_bytes: 1024,
            ..EnclaveConfig::default()
        })
        .build()
        .unwrap();
    let result = enclave
        .run(ExecutionRequest::new("return 'r'.repeat(4096);"))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ResultTooLarge));
    enclave.shutdown().await;
}
