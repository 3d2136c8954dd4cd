//! Runs one evaluation on a dedicated worker thread under a deadline.
//!
//! The caller stops waiting at the deadline no matter what the script is
//! doing. The worker notices through an instruction-count hook and through
//! the guarded `pcall`/`xpcall`/`coroutine.resume`, so even a script that
//! keeps catching errors unwinds and the thread exits.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mlua::{HookTriggers, MultiValue, VmState};
use serde_json::Value;

use super::marshal::{self, Budget, MarshalError};
use super::stdlib::{self, find_external};
use super::{Callback, CallbackError, EvalOptions, ScriptError};

/// The hook fires after this many VM instructions.
const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("script deadline exceeded")]
pub(crate) struct DeadlineExceeded;

#[derive(Debug, Clone)]
pub(crate) struct EvalContext {
    started: Instant,
    deadline: Instant,
    timeout_ms: u64,
    cancelled: Arc<AtomicBool>,
}

impl EvalContext {
    pub(crate) fn new(timeout_ms: u64) -> Self {
        // A zero timeout would never let the script start; treat it as 1ms.
        let timeout_ms = timeout_ms.max(1);
        let started = Instant::now();
        Self {
            started,
            deadline: started + Duration::from_millis(timeout_ms),
            timeout_ms,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn should_abort(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed) || Instant::now() >= self.deadline
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn timed_out(&self) -> ScriptError {
        ScriptError::Timeout(self.timeout_ms)
    }
}

/// Flags the worker to stop if the awaiting future is dropped early.
struct CancelOnDrop(EvalContext);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub(crate) async fn run(script: &str, options: EvalOptions) -> Result<Value, ScriptError> {
    let ctx = EvalContext::new(options.timeout_ms);
    let _cancel = CancelOnDrop(ctx.clone());
    let (tx, rx) = tokio::sync::oneshot::channel();

    spawn_worker(script.to_string(), options, ctx.clone(), move |result| {
        let _ = tx.send(result);
    })?;

    match tokio::time::timeout(ctx.remaining(), rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ScriptError::Internal("evaluation worker exited without a result".into())),
        Err(_) => {
            ctx.cancel();
            tracing::warn!(timeout_ms = ctx.timeout_ms, "script timed out");
            Err(ctx.timed_out())
        }
    }
}

pub(crate) fn run_blocking(script: &str, options: EvalOptions) -> Result<Value, ScriptError> {
    let ctx = EvalContext::new(options.timeout_ms);
    let (tx, rx) = std::sync::mpsc::sync_channel(1);

    spawn_worker(script.to_string(), options, ctx.clone(), move |result| {
        let _ = tx.send(result);
    })?;

    match rx.recv_timeout(ctx.remaining()) {
        Ok(result) => result,
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
            ctx.cancel();
            tracing::warn!(timeout_ms = ctx.timeout_ms, "script timed out");
            Err(ctx.timed_out())
        }
        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(ScriptError::Internal(
            "evaluation worker exited without a result".into(),
        )),
    }
}

fn spawn_worker<F>(
    script: String,
    options: EvalOptions,
    ctx: EvalContext,
    reply: F,
) -> Result<(), ScriptError>
where
    F: FnOnce(Result<Value, ScriptError>) + Send + 'static,
{
    std::thread::Builder::new()
        .name("warden-script".into())
        .spawn(move || {
            let result = evaluate(&script, &options, &ctx);
            tracing::debug!(
                elapsed_ms = ctx.started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "script worker finished"
            );
            reply(result);
        })
        .map_err(|e| ScriptError::Internal(format!("failed to spawn evaluation worker: {e}")))?;
    Ok(())
}

fn evaluate(script: &str, options: &EvalOptions, ctx: &EvalContext) -> Result<Value, ScriptError> {
    let lua = stdlib::sandboxed_lua(ctx, options.memory_limit_bytes).map_err(|e| classify(e, ctx))?;

    let hook_ctx = ctx.clone();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_lua, _debug| {
            if hook_ctx.should_abort() {
                Err(mlua::Error::external(DeadlineExceeded))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    // Conversions are charged against the interpreter's own allocation cap.
    let budget_bytes = options
        .memory_limit_bytes
        .unwrap_or(marshal::DEFAULT_BUDGET_BYTES);

    let globals = lua.globals();
    for (name, callback) in &options.callbacks {
        let callback = callback.clone();
        let callback_name = name.clone();
        let callback_ctx = ctx.clone();
        let function = lua
            .create_function(move |lua, args: MultiValue| {
                let abort = || callback_ctx.should_abort();
                let mut budget = Budget::new(budget_bytes, &abort);
                let args = args
                    .into_iter()
                    .map(|v| marshal::from_lua_within(&v, &mut budget))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(mlua::Error::external)?;
                let reply = call_guarded(&callback_name, &callback, args).map_err(mlua::Error::external)?;
                marshal::to_lua(lua, &reply)
            })
            .map_err(|e| classify(e, ctx))?;
        globals
            .set(name.as_str(), function)
            .map_err(|e| classify(e, ctx))?;
    }

    let values: MultiValue = lua
        .load(script)
        .set_name("script")
        .set_mode(mlua::ChunkMode::Text)
        .call(())
        .map_err(|e| classify(e, ctx))?;

    // The hook no longer runs here, so the conversion checks the deadline itself.
    let abort = || ctx.should_abort();
    let mut budget = Budget::new(budget_bytes, &abort);
    let mut values = values
        .into_iter()
        .map(|v| marshal::from_lua_within(&v, &mut budget))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| match e {
            MarshalError::Aborted => ctx.timed_out(),
            other => ScriptError::Marshal(other),
        })?;
    Ok(match values.len() {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    })
}

/// A panicking callback becomes an error raised in the script instead of
/// unwinding through the interpreter and killing the worker.
fn call_guarded(name: &str, callback: &Callback, args: Vec<Value>) -> Result<Value, CallbackError> {
    std::panic::catch_unwind(AssertUnwindSafe(|| callback.call(args))).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(callback = name, %message, "script callback panicked");
        Err(CallbackError::new(format!("callback '{name}' panicked: {message}")))
    })
}

fn classify(err: mlua::Error, ctx: &EvalContext) -> ScriptError {
    if let Some(restricted) = stdlib::restricted_cause(&err) {
        return ScriptError::Restricted(restricted.0.clone());
    }
    if find_external::<DeadlineExceeded>(&err).is_some() || ctx.should_abort() {
        return ctx.timed_out();
    }
    match err {
        mlua::Error::SyntaxError { message, .. } => ScriptError::Syntax(message),
        mlua::Error::MemoryError(message) => ScriptError::Memory(message),
        other => ScriptError::Runtime(other.to_string()),
    }
}
