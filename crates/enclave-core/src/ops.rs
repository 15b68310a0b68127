//! deno_core ops backing the runtime's safe bindings.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::op2;
use deno_core::v8;
use deno_core::OpState;
use deno_error::JsErrorBox;

use crate::governor::{LimitViolation, ResourceGovernor};
use crate::ipc::{ConsoleLevel, ToolCallOutcome};
use crate::runtime::HostChannel;

/// Handle used by ops to stop the isolate after a fatal violation.
pub struct TerminateHandle(pub v8::IsolateHandle);

/// JSON envelope written by the harness when the entry function settles.
pub struct ScriptOutcome(pub String);

/// Record `violation`, stop the isolate, and build the error thrown at the
/// call site. Termination is uncatchable, so the script cannot continue.
fn fatal(state: &OpState, violation: LimitViolation) -> JsErrorBox {
    let recorded = state.borrow::<Arc<ResourceGovernor>>().trip(violation);
    state.borrow::<TerminateHandle>().0.terminate_execution();
    JsErrorBox::generic(recorded.to_string())
}

/// `console.*` with each argument already serialized on the JS side.
///
/// The byte count is the sum of the argument lengths; the separators added
/// when joining them into one line are not counted.
#[op2]
pub fn op_enclave_console(
    state: &mut OpState,
    #[smi] level: u32,
    #[serde] parts: Vec<String>,
) -> Result<(), JsErrorBox> {
    let bytes = parts.iter().map(String::len).sum();
    let governor = state.borrow::<Arc<ResourceGovernor>>().clone();
    if let Err(v) = governor.record_console(bytes) {
        return Err(fatal(state, v));
    }
    state
        .borrow::<Arc<dyn HostChannel>>()
        .console(ConsoleLevel::from_code(level), parts.join(" "));
    Ok(())
}

/// Loop-body entry: count the iteration and check the clock.
#[op2(fast)]
pub fn op_enclave_loop_tick(state: &mut OpState) -> Result<(), JsErrorBox> {
    let governor = state.borrow::<Arc<ResourceGovernor>>().clone();
    governor.tick_iteration().map_err(|v| fatal(state, v))
}

/// Store the harness envelope.
#[op2(fast)]
pub fn op_enclave_set_result(state: &mut OpState, #[string] json: String) {
    state.put(ScriptOutcome(json));
}

/// Forward a tool call to the host.
///
/// Catchable failures (open breaker, unknown tool, tool error) reject the
/// script's promise. Governor breaches and fatal host faults terminate.
#[op2(async)]
#[string]
pub async fn op_enclave_call_tool(
    op_state: Rc<RefCell<OpState>>,
    #[string] tool: String,
    #[string] args_json: String,
) -> Result<String, JsErrorBox> {
    let (governor, host) = {
        let st = op_state.borrow();
        (
            st.borrow::<Arc<ResourceGovernor>>().clone(),
            st.borrow::<Arc<dyn HostChannel>>().clone(),
        )
    };

    if let Err(v) = governor.check_time().and_then(|()| governor.begin_tool_call()) {
        return Err(fatal(&op_state.borrow(), v));
    }

    let args = match serde_json::from_str(&args_json) {
        Ok(args) => args,
        Err(_) => {
            governor.end_tool_call();
            return Err(JsErrorBox::type_error(
                "callTool arguments must be JSON-serializable",
            ));
        }
    };

    tracing::debug!(tool = %tool, args_len = args_json.len(), "tool call dispatched");
    let outcome = host.call_tool(tool, args).await;
    governor.end_tool_call();

    match outcome {
        ToolCallOutcome::Ok { value } => serde_json::to_string(&value)
            .map_err(|e| JsErrorBox::generic(format!("tool result serialization failed: {e}"))),
        ToolCallOutcome::Failed { code, message } => {
            Err(JsErrorBox::generic(format!("{code}: {message}")))
        }
        ToolCallOutcome::Fatal { kind, message } => Err(fatal(
            &op_state.borrow(),
            LimitViolation::HostFault { kind, message },
        )),
    }
}

deno_core::extension!(
    enclave_ext,
    ops = [
        op_enclave_console,
        op_enclave_loop_tick,
        op_enclave_set_result,
        op_enclave_call_tool,
    ],
);
