//! V8 execution of transformed scripts.
//!
//! Each execution gets a fresh isolate with a heap ceiling, the enclave
//! extension, and a bootstrap that installs the `__safe_*` bindings and
//! removes code-generation primitives. A watchdog thread terminates the
//! isolate when the wall-clock budget runs out, covering CPU-bound code that
//! never reaches a loop tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;

use crate::error::{EnclaveError, ErrorKind, ExecutionError};
use crate::governor::{LimitViolation, ResourceGovernor};
use crate::ipc::{ConsoleLevel, ToolCallOutcome};
use crate::ops::{enclave_ext, ScriptOutcome, TerminateHandle};
use crate::request::{ExecutionLimits, ExecutionStats};

/// The host side of a running script: console sink and tool bridge.
#[async_trait]
pub trait HostChannel: Send + Sync {
    /// Deliver one console line. Limits are already enforced.
    fn console(&self, level: ConsoleLevel, message: String);

    /// Run one tool call to completion.
    async fn call_tool(&self, tool: String, args: Value) -> ToolCallOutcome;
}

/// One unit of work for the runtime.
#[derive(Debug, Clone)]
pub struct ScriptJob {
    /// Execution id.
    pub execution_id: String,
    /// Transformed code defining the entry function.
    pub code: String,
    /// Limits in force.
    pub limits: ExecutionLimits,
}

/// Lets another thread stop whatever isolate is currently running.
#[derive(Clone, Default)]
pub struct KillSwitch {
    inner: Arc<Mutex<Option<v8::IsolateHandle>>>,
}

impl KillSwitch {
    fn arm(&self, handle: v8::IsolateHandle) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn disarm(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Terminate the running isolate. Returns whether one was running.
    pub fn kill(&self) -> bool {
        match self.inner.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(handle) => handle.terminate_execution(),
            None => false,
        }
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch").finish_non_exhaustive()
    }
}

const BOOTSTRAP: &str = r#"
((ops) => {
    const serializeArg = (v) => {
        if (typeof v === 'string') return v;
        try {
            const s = JSON.stringify(v);
            if (s !== undefined) return s;
        } catch (_) {}
        try {
            return String(v);
        } catch (_) {
            return '[unserializable]';
        }
    };
    const writer = (level) => (...args) => {
        ops.op_enclave_console(level, args.map(serializeArg));
    };
    const safeConsole = Object.freeze({
        log: writer(0),
        info: writer(1),
        warn: writer(2),
        error: writer(3),
        debug: writer(4),
    });

    const callToolOp = ops.op_enclave_call_tool;
    const safeCallTool = async (tool, args) => {
        if (typeof tool !== 'string') {
            throw new TypeError('callTool: tool name must be a string');
        }
        const json = JSON.stringify(args === undefined ? {} : args);
        if (json === undefined) {
            throw new TypeError('callTool: arguments must be JSON-serializable');
        }
        return JSON.parse(await callToolOp(tool, json));
    };

    const define = (name, value) => Object.defineProperty(globalThis, name, {
        value, writable: false, configurable: false, enumerable: false,
    });
    define('__safe_console', safeConsole);
    define('__safe_callTool', safeCallTool);
    define('__safe_loopTick', () => ops.op_enclave_loop_tick());
    define('__ag_setResult', (json) => ops.op_enclave_set_result(json));

    delete globalThis.Deno;
    delete globalThis.console;
    const AsyncFunction = (async function(){}).constructor;
    const GeneratorFunction = (function*(){}).constructor;
    const AsyncGeneratorFunction = (async function*(){}).constructor;
    for (const ctor of [Function, AsyncFunction, GeneratorFunction, AsyncGeneratorFunction]) {
        Object.defineProperty(ctor.prototype, 'constructor', {
            value: undefined, configurable: false, writable: false,
        });
    }
    // Computed lookups such as globalThis['Func' + 'tion'] must find nothing.
    for (const name of ['eval', 'Function']) {
        delete globalThis[name];
        define(name, undefined);
    }
})(Deno.core.ops);
"#;

const HARNESS: &str = r#"
(async () => {
    try {
        const r = await __ag_main();
        __ag_setResult(JSON.stringify({ ok: r === undefined ? null : r }));
    } catch (e) {
        let message;
        try {
            message = (e && e.message) || String(e);
        } catch (_) {
            message = 'script threw an unprintable value';
        }
        __ag_setResult(JSON.stringify({ error: message }));
    }
})();
"#;

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    governor: Arc<ResourceGovernor>,
    triggered: AtomicBool,
}

/// Terminates on the first approach to the ceiling and grants 1 MiB of grace
/// so the termination can unwind.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed HeapLimitState owned by `drive`. The
    // runtime outlives `drive`, but V8 only calls this while script runs, and
    // all script execution finishes before `drive` returns.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.governor.memory_exhausted();
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

fn create_runtime(
    limits: &ExecutionLimits,
    governor: Arc<ResourceGovernor>,
    host: Arc<dyn HostChannel>,
) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, limits.max_memory_bytes);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![enclave_ext::init_ops_and_esm()],
        create_params: Some(create_params),
        ..Default::default()
    });
    let handle = runtime.v8_isolate().thread_safe_handle();
    {
        let op_state = runtime.op_state();
        let mut st = op_state.borrow_mut();
        st.put(governor);
        st.put(host);
        st.put(TerminateHandle(handle));
    }
    runtime
}

/// Run `job` to completion or violation. Always returns stats.
pub async fn run_script(
    job: &ScriptJob,
    host: Arc<dyn HostChannel>,
    kill_switch: &KillSwitch,
) -> (Result<Value, ExecutionError>, ExecutionStats) {
    let governor = Arc::new(ResourceGovernor::new(job.limits.clone()));
    let result = execute(job, host, kill_switch, &governor).await;
    let stats = governor.stats();
    match &result {
        Ok(_) => tracing::debug!(
            execution_id = %job.execution_id,
            elapsed_ms = stats.elapsed_ms,
            "script completed"
        ),
        Err(e) => tracing::debug!(
            execution_id = %job.execution_id,
            kind = %e.kind,
            elapsed_ms = stats.elapsed_ms,
            "script failed"
        ),
    }
    (result, stats)
}

async fn execute(
    job: &ScriptJob,
    host: Arc<dyn HostChannel>,
    kill_switch: &KillSwitch,
    governor: &Arc<ResourceGovernor>,
) -> Result<Value, ExecutionError> {
    let mut runtime = create_runtime(&job.limits, governor.clone(), host);
    runtime
        .execute_script("[enclave:bootstrap]", BOOTSTRAP)
        .map_err(|e| internal(format!("bootstrap failed: {e}")))?;
    drive(&mut runtime, job, kill_switch, governor).await
}

/// Run the job's code on a bootstrapped runtime and extract the outcome.
async fn drive(
    runtime: &mut JsRuntime,
    job: &ScriptJob,
    kill_switch: &KillSwitch,
    governor: &Arc<ResourceGovernor>,
) -> Result<Value, ExecutionError> {
    let limits = &job.limits;
    let handle = runtime.v8_isolate().thread_safe_handle();

    let heap_state = Box::new(HeapLimitState {
        handle: handle.clone(),
        governor: governor.clone(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    kill_switch.arm(handle.clone());

    let watchdog_handle = handle.clone();
    let watchdog_governor = governor.clone();
    let timeout = limits.timeout();
    let timeout_ms = limits.timeout_ms;
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_governor.trip(LimitViolation::Timeout { timeout_ms });
            watchdog_handle.terminate_execution();
        }
    });

    let exec_error = match runtime
        .execute_script("[enclave:main]", job.code.clone())
        .and_then(|_| runtime.execute_script("[enclave:run]", HARNESS))
    {
        Ok(_) => {
            match tokio::time::timeout(timeout, runtime.run_event_loop(PollEventLoopOptions::default()))
                .await
            {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => {
                    governor.trip(LimitViolation::Timeout { timeout_ms });
                    Some("event loop timed out".to_string())
                }
            }
        }
        Err(e) => Some(e.to_string()),
    };

    // The watchdog must be gone before the isolate it holds a handle to.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();
    kill_switch.disarm();

    if let Some(v) = governor.violation() {
        return Err(ExecutionError::from(&v));
    }
    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(EnclaveError::WorkerMemory {
            max_bytes: limits.max_memory_bytes,
        }
        .to_execution_error());
    }
    if let Some(message) = exec_error {
        return Err(ExecutionError::new(ErrorKind::Script, &message));
    }

    let envelope = {
        let op_state = runtime.op_state();
        let st = op_state.borrow();
        st.try_borrow::<ScriptOutcome>().map(|r| r.0.clone())
    };
    let Some(envelope) = envelope else {
        return Err(ExecutionError::new(
            ErrorKind::Script,
            "script did not settle (pending promise never resolved)",
        ));
    };
    if envelope.len() > limits.max_result_bytes {
        return Err(EnclaveError::ResultTooLarge {
            max: limits.max_result_bytes,
        }
        .to_execution_error());
    }

    let envelope: Value =
        serde_json::from_str(&envelope).map_err(|e| internal(format!("bad result envelope: {e}")))?;
    if let Some(error) = envelope.get("error") {
        return Err(ExecutionError::new(
            ErrorKind::Script,
            error.as_str().unwrap_or("unknown error"),
        ));
    }
    Ok(envelope.get("ok").cloned().unwrap_or(Value::Null))
}

fn internal(message: String) -> ExecutionError {
    ExecutionError::new(ErrorKind::Internal, &message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHost {
        console: StdMutex<Vec<(ConsoleLevel, String)>>,
        calls: StdMutex<Vec<(String, Value)>>,
        reply: Option<ToolCallOutcome>,
    }

    #[async_trait]
    impl HostChannel for RecordingHost {
        fn console(&self, level: ConsoleLevel, message: String) {
            self.console.lock().unwrap().push((level, message));
        }

        async fn call_tool(&self, tool: String, args: Value) -> ToolCallOutcome {
            self.calls.lock().unwrap().push((tool.clone(), args.clone()));
            self.reply.clone().unwrap_or(ToolCallOutcome::Ok {
                value: serde_json::json!({ "tool": tool, "args": args }),
            })
        }
    }

    fn job(body: &str, limits: ExecutionLimits) -> ScriptJob {
        ScriptJob {
            execution_id: "test".into(),
            code: format!("async function __ag_main() {{\n\"use strict\";\n{body}\n}}"),
            limits,
        }
    }

    async fn run_with(body: &str, limits: ExecutionLimits, host: Arc<RecordingHost>) -> (Result<Value, ExecutionError>, ExecutionStats) {
        run_script(&job(body, limits), host, &KillSwitch::default()).await
    }

    async fn run(body: &str) -> Result<Value, ExecutionError> {
        run_with(body, ExecutionLimits::default(), Arc::default()).await.0
    }

    #[tokio::test]
    #[serial]
    async fn returns_value() {
        assert_eq!(run("return 1 + 2;").await.unwrap(), serde_json::json!(3));
    }

    #[tokio::test]
    #[serial]
    async fn undefined_becomes_null() {
        assert_eq!(run("const x = 1;").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    #[serial]
    async fn thrown_errors_are_script_errors() {
        let err = run("throw new Error('nope');").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Script);
        assert!(err.message.contains("nope"));
    }

    #[tokio::test]
    #[serial]
    async fn tool_calls_reach_the_host() {
        let host = Arc::new(RecordingHost::default());
        let (result, stats) = run_with(
            "return await __safe_callTool('a.b', { q: 1 });",
            ExecutionLimits::default(),
            host.clone(),
        )
        .await;
        assert_eq!(result.unwrap()["tool"], "a.b");
        assert_eq!(stats.tool_call_count, 1);
        assert_eq!(host.calls.lock().unwrap()[0].1, serde_json::json!({ "q": 1 }));
    }

    #[tokio::test]
    #[serial]
    async fn failed_tool_calls_are_catchable() {
        let host = Arc::new(RecordingHost {
            reply: Some(ToolCallOutcome::failed("circuit_open", "target degraded")),
            ..Default::default()
        });
        let (result, _) = run_with(
            "try { await __safe_callTool('a.b'); return 'no'; } catch (e) { return e.message; }",
            ExecutionLimits::default(),
            host,
        )
        .await;
        assert_eq!(result.unwrap(), serde_json::json!("circuit_open: target degraded"));
    }

    #[tokio::test]
    #[serial]
    async fn fatal_tool_outcome_terminates() {
        let host = Arc::new(RecordingHost {
            reply: Some(ToolCallOutcome::Fatal {
                kind: ErrorKind::ResolutionLimit,
                message: "too much".into(),
            }),
            ..Default::default()
        });
        let (result, _) = run_with(
            "try { await __safe_callTool('a.b'); } catch (e) {} return 'continued';",
            ExecutionLimits::default(),
            host,
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::ResolutionLimit);
    }

    #[tokio::test]
    #[serial]
    async fn console_serializes_arguments() {
        let host = Arc::new(RecordingHost::default());
        let (result, stats) = run_with(
            "const o = {}; o.self = o; __safe_console.warn('a', 1, { b: 2 }, o); return 0;",
            ExecutionLimits::default(),
            host.clone(),
        )
        .await;
        result.unwrap();
        let lines = host.console.lock().unwrap();
        assert_eq!(lines[0].0, ConsoleLevel::Warn);
        assert_eq!(lines[0].1, "a 1 {\"b\":2} [object Object]");
        assert_eq!(stats.console_calls, 1);
        assert_eq!(stats.console_bytes, 24);
    }

    #[tokio::test]
    #[serial]
    async fn console_bytes_exclude_separators() {
        let limits = ExecutionLimits {
            max_console_bytes: 6,
            ..Default::default()
        };
        let host = Arc::new(RecordingHost::default());
        let (result, stats) = run_with(
            "__safe_console.log('ab', 'cd', 'ef'); return 1;",
            limits,
            host.clone(),
        )
        .await;
        assert_eq!(result.unwrap(), serde_json::json!(1));
        assert_eq!(stats.console_bytes, 6);
        assert_eq!(host.console.lock().unwrap()[0].1, "ab cd ef");
    }

    #[tokio::test]
    #[serial]
    async fn iteration_limit_terminates() {
        let limits = ExecutionLimits {
            max_iterations: 1000,
            ..Default::default()
        };
        let (result, stats) = run_with(
            "for (let i = 0; i < 10000; i++) { __safe_loopTick(); } return 'done';",
            limits,
            Arc::default(),
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::IterationLimit);
        assert_eq!(stats.iterations, 1001);
    }

    #[tokio::test]
    #[serial]
    async fn iteration_limit_is_not_catchable() {
        let limits = ExecutionLimits {
            max_iterations: 10,
            ..Default::default()
        };
        let (result, _) = run_with(
            "for (;;) { try { __safe_loopTick(); } catch (e) {} }",
            limits,
            Arc::default(),
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::IterationLimit);
    }

    #[tokio::test]
    #[serial]
    async fn console_byte_limit_fails_on_the_crossing_call() {
        let limits = ExecutionLimits {
            max_console_bytes: 500,
            ..Default::default()
        };
        let host = Arc::new(RecordingHost::default());
        let (result, stats) = run_with(
            "const s = 'x'.repeat(100); for (let i = 0; i < 10; i++) __safe_console.log(s); return 1;",
            limits,
            host.clone(),
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::ConsoleOutputLimit);
        assert_eq!(host.console.lock().unwrap().len(), 5);
        assert_eq!(stats.console_bytes, 500);
    }

    #[tokio::test]
    #[serial]
    async fn cpu_bound_loop_times_out() {
        let limits = ExecutionLimits {
            timeout_ms: 200,
            ..Default::default()
        };
        let (result, _) = run_with("while (true) {}", limits, Arc::default()).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::WorkerTimeout);
    }

    #[tokio::test]
    #[serial]
    async fn heap_ceiling_is_enforced() {
        let limits = ExecutionLimits {
            max_memory_bytes: 16 * 1024 * 1024,
            ..Default::default()
        };
        let (result, _) = run_with(
            "const a = []; while (true) { a.push(new Array(10000).fill('x')); }",
            limits,
            Arc::default(),
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::WorkerMemory);
    }

    #[tokio::test]
    #[serial]
    async fn oversized_result_is_rejected() {
        let limits = ExecutionLimits {
            max_result_bytes: 64,
            ..Default::default()
        };
        let (result, _) = run_with("return 'y'.repeat(100);", limits, Arc::default()).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::ResultTooLarge);
    }

    #[tokio::test]
    #[serial]
    async fn code_generation_is_unreachable() {
        let result = run(
            "const f = (() => {}).constructor; return [typeof eval, typeof Deno, typeof console, f === undefined];",
        )
        .await
        .unwrap();
        assert_eq!(result, serde_json::json!(["undefined", "undefined", "undefined", true]));
    }

    #[tokio::test]
    #[serial]
    async fn function_global_is_unreachable_by_computed_name() {
        let result = run(
            "const F = globalThis['Func' + 'tion']; \
             try { return F('return 1')(); } catch (e) { return ['blocked', typeof F]; }",
        )
        .await
        .unwrap();
        assert_eq!(result, serde_json::json!(["blocked", "undefined"]));
    }

    #[tokio::test]
    #[serial]
    async fn safe_bindings_are_not_writable() {
        let result = run("try { __safe_console = 1; return 'overwrote'; } catch (e) { return 'kept'; }")
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("kept"));
    }

    #[tokio::test]
    #[serial]
    async fn pending_tool_call_limit() {
        let limits = ExecutionLimits {
            max_pending_tool_calls: 2,
            ..Default::default()
        };
        let (result, _) = run_with(
            "return await Promise.all([1, 2, 3].map((i) => __safe_callTool('t', { i })));",
            limits,
            Arc::default(),
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::TooManyPendingCalls);
    }
}
