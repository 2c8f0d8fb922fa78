//! One V8 isolate per round, on its own thread.
//!
//! `JsRuntime` is `!Send`, so each round gets a dedicated OS thread driving
//! a current-thread tokio runtime. Tool calls leave the isolate through the
//! single `op_relay_call` op and are dispatched on the caller's runtime.

use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::{op2, v8, Extension, JsRuntime, OpState, PollEventLoopOptions, RuntimeOptions};
use deno_error::JsErrorBox;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{Dispatch, ScriptError, MEMORY_LIMIT};

const PRELUDE: &str = include_str!("prelude.js");

/// V8 raises `RangeError` on stack exhaustion; the thread stack must stay
/// larger than V8's own limit so deep nesting never overflows the thread.
const ISOLATE_STACK: usize = 8 * 1024 * 1024;

/// Everything the isolate thread needs for one round.
pub(super) struct Job {
    pub code: String,
    pub local_tools: BTreeMap<String, String>,
    pub dispatch: Arc<dyn Dispatch>,
    pub handle: Handle,
    pub max_heap_bytes: usize,
}

/// Channels tying the isolate thread to the waiting round.
pub(super) struct Control {
    /// Receives the isolate handle once V8 is up, for termination.
    pub ready: oneshot::Sender<v8::IsolateHandle>,
    /// Completes (or is dropped) when the round gives up on the isolate.
    pub cancel: oneshot::Receiver<()>,
    pub done: oneshot::Sender<Result<Value, ScriptError>>,
}

#[derive(Clone)]
struct Bridge {
    dispatch: Arc<dyn Dispatch>,
    handle: Handle,
}

#[op2(async)]
#[string]
async fn op_relay_call(
    state: Rc<RefCell<OpState>>,
    #[string] name: String,
    #[string] args: String,
) -> Result<String, JsErrorBox> {
    let Bridge { dispatch, handle } = state.borrow().borrow::<Bridge>().clone();
    let args: Map<String, Value> = serde_json::from_str(&args).map_err(|e| {
        JsErrorBox::type_error(format!("{name}: arguments must be an object ({e})"))
    })?;
    let value = handle
        .spawn(async move { dispatch.call(&name, args).await })
        .await
        .map_err(|e| JsErrorBox::generic(format!("Tool call aborted: {e}")))?
        .map_err(JsErrorBox::generic)?;
    Ok(value.to_string())
}

fn relay_extension() -> Extension {
    Extension {
        name: "relay",
        ops: Cow::Owned(vec![op_relay_call()]),
        ..Default::default()
    }
}

/// Start the isolate thread for `job`.
pub(super) fn spawn(job: Job, control: Control) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("relay-isolate".into())
        .stack_size(ISOLATE_STACK)
        .spawn(move || {
            let Control {
                ready,
                cancel,
                done,
            } = control;
            let outcome = run(job, ready, cancel);
            if done.send(outcome).is_err() {
                debug!("Round finished after its caller gave up");
            }
        })?;
    Ok(())
}

fn run(
    job: Job,
    ready: oneshot::Sender<v8::IsolateHandle>,
    cancel: oneshot::Receiver<()>,
) -> Result<Value, ScriptError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(engine_error)?;

    let initial = (job.max_heap_bytes / 10).min(10 * 1024 * 1024);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![relay_extension()],
        create_params: Some(v8::CreateParams::default().heap_limits(initial, job.max_heap_bytes)),
        ..Default::default()
    });

    let isolate = runtime.v8_isolate().thread_safe_handle();
    let exhausted = Rc::new(Cell::new(false));
    runtime.add_near_heap_limit_callback({
        let isolate = isolate.clone();
        let exhausted = exhausted.clone();
        move |current, _initial| {
            exhausted.set(true);
            isolate.terminate_execution();
            // Room to unwind; the round is already lost.
            current * 2
        }
    });
    let _ = ready.send(isolate);

    runtime.op_state().borrow_mut().put(Bridge {
        dispatch: job.dispatch,
        handle: job.handle,
    });

    let outcome = rt.block_on(async {
        tokio::select! {
            outcome = evaluate(&mut runtime, job.code, &job.local_tools) => outcome,
            _ = cancel => Err(ScriptError::Terminated("Execution cancelled".into())),
        }
    });

    if exhausted.get() {
        warn!("Script exceeded its heap limit");
        return Err(ScriptError::Terminated(MEMORY_LIMIT.into()));
    }
    outcome
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl Envelope {
    fn into_result(self) -> Result<Value, ScriptError> {
        if self.ok {
            return Ok(self.value);
        }
        let error = self.error.unwrap_or_default();
        Err(match self.kind.as_deref() {
            Some("syntax") => ScriptError::Syntax(error),
            Some("invalid_function") => ScriptError::InvalidFunction(error),
            _ => ScriptError::Thrown(error),
        })
    }
}

fn engine_error(e: impl std::fmt::Display) -> ScriptError {
    ScriptError::Engine(e.to_string())
}

async fn evaluate(
    runtime: &mut JsRuntime,
    code: String,
    local_tools: &BTreeMap<String, String>,
) -> Result<Value, ScriptError> {
    runtime
        .execute_script("<relay-prelude>", PRELUDE)
        .map_err(engine_error)?;

    let invoke = format!(
        "__relayRun({}, {});",
        Value::String(code),
        serde_json::to_string(local_tools).map_err(engine_error)?
    );
    runtime
        .execute_script("<relay>", invoke)
        .map_err(|e| ScriptError::Thrown(e.to_string()))?;

    // An un-awaited call that rejects surfaces here; the settled outcome,
    // if any, still wins.
    let looped = runtime.run_event_loop(PollEventLoopOptions::default()).await;

    let outcome = runtime
        .execute_script("<relay-outcome>", "globalThis.__relayOutcome ?? ''")
        .map_err(engine_error)?;
    let outcome = {
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, outcome);
        local.to_rust_string_lossy(scope)
    };

    if outcome.is_empty() {
        return Err(match looped {
            Err(e) => ScriptError::Thrown(e.to_string()),
            Ok(()) => ScriptError::Thrown("Execution did not complete".into()),
        });
    }
    serde_json::from_str::<Envelope>(&outcome)
        .map_err(engine_error)?
        .into_result()
}
