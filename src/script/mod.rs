//! Embedded script evaluator.
//!
//! Every call gets a fresh Lua 5.4 state with a restricted standard library,
//! runs on its own worker thread, and is abandoned at its deadline. Host
//! callbacks are exposed as global functions; values cross the boundary as
//! `serde_json::Value` (see [`marshal`]).
//!
//! ```no_run
//! # async fn demo() -> Result<(), warden::script::ScriptError> {
//! use warden::script::{Callback, EvalOptions, eval};
//!
//! let options = EvalOptions::default().callback(
//!     "double",
//!     Callback::new(|args| Ok(serde_json::json!(args[0].as_i64().unwrap_or(0) * 2))),
//! );
//! let value = eval("return double(5)", options).await?;
//! assert_eq!(value, 10);
//! # Ok(())
//! # }
//! ```

pub mod marshal;
pub mod stdlib;
mod supervisor;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

pub use marshal::MarshalError;
pub use stdlib::RestrictedCapability;

use crate::config::Config;

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("restricted capability: {0}")]
    Restricted(String),

    #[error("script timed out after {0}ms")]
    Timeout(u64),

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("script error: {0}")]
    Runtime(String),

    #[error("memory limit exceeded: {0}")]
    Memory(String),

    #[error("cannot marshal script result: {0}")]
    Marshal(#[from] MarshalError),

    #[error("evaluator failure: {0}")]
    Internal(String),
}

impl ScriptError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for CallbackError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

type HostFn = dyn Fn(Vec<Value>) -> Result<Value, CallbackError> + Send + Sync;

/// Host function callable from scripts. Runs synchronously on the
/// evaluation worker; a returned error is raised inside the script.
#[derive(Clone)]
pub struct Callback(Arc<HostFn>);

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, CallbackError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Wraps a function returning any `Serialize` type. Struct fields and
    /// enum map keys become string keys the script can index.
    pub fn returning<F, T>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<T, CallbackError> + Send + Sync + 'static,
        T: Serialize,
    {
        Self::new(move |args| Ok(serde_json::to_value(f(args)?)?))
    }

    pub fn call(&self, args: Vec<Value>) -> Result<Value, CallbackError> {
        (self.0)(args)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub timeout_ms: u64,
    /// `None` lifts the interpreter's allocation cap.
    pub memory_limit_bytes: Option<usize>,
    pub callbacks: BTreeMap<String, Callback>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            memory_limit_bytes: Some(DEFAULT_MEMORY_LIMIT_BYTES),
            callbacks: BTreeMap::new(),
        }
    }
}

impl EvalOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout_ms: config.script_timeout_ms,
            memory_limit_bytes: Some(config.script_memory_limit_bytes),
            callbacks: BTreeMap::new(),
        }
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn memory_limit(mut self, bytes: Option<usize>) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn callback(mut self, name: impl Into<String>, callback: Callback) -> Self {
        self.callbacks.insert(name.into(), callback);
        self
    }
}

/// Evaluate `script` and return its value.
///
/// No returned values yields `null`, one yields that value, several yield
/// an array. Dropping the future cancels the evaluation.
pub async fn eval(script: &str, options: EvalOptions) -> Result<Value, ScriptError> {
    supervisor::run(script, options).await
}

/// Same as [`eval`], blocking the current thread until a result or the
/// deadline.
pub fn eval_blocking(script: &str, options: EvalOptions) -> Result<Value, ScriptError> {
    supervisor::run_blocking(script, options)
}

/// Blocking evaluation for callers that treat any failure as fatal.
///
/// # Panics
///
/// Panics with the evaluation error's message.
pub fn must_eval(script: &str, options: EvalOptions) -> Value {
    match eval_blocking(script, options) {
        Ok(value) => value,
        Err(e) => panic!("script evaluation failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn short(timeout_ms: u64) -> EvalOptions {
        EvalOptions::default().timeout_ms(timeout_ms)
    }

    #[tokio::test]
    async fn arithmetic() {
        assert_eq!(eval("return 1 + 2", EvalOptions::default()).await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn return_shapes() {
        let opts = EvalOptions::default;
        assert_eq!(eval("local x = 1", opts()).await.unwrap(), Value::Null);
        assert_eq!(eval("return 1, 'two'", opts()).await.unwrap(), json!([1, "two"]));
        assert_eq!(
            eval("return {name = 'box', tags = {'a', 'b'}}", opts()).await.unwrap(),
            json!({"name": "box", "tags": ["a", "b"]})
        );
        assert_eq!(eval("return 10 / 4", opts()).await.unwrap(), json!(2.5));
    }

    #[tokio::test]
    async fn multiple_tables_and_object_text() {
        assert_eq!(
            eval("return {x = 1}, {y = 2}", EvalOptions::default()).await.unwrap(),
            json!([{"x": 1}, {"y": 2}])
        );
        let value = eval("return {a = 1, b = 2}", EvalOptions::default()).await.unwrap();
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"{"a":1,"b":2}"#);
    }

    #[tokio::test]
    async fn shared_subtables_are_bounded() {
        let started = Instant::now();
        let script = "local t = {1} for i = 1, 40 do t = {t, t} end return t";
        match eval(script, short(2_000)).await {
            Err(ScriptError::Marshal(MarshalError::TooLarge(_))) | Err(ScriptError::Timeout(_)) => {}
            other => panic!("expected the conversion to be cut off, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn shared_subtables_in_callback_args_are_bounded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let options = short(2_000).callback(
            "sink",
            Callback::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }),
        );
        let script = "local t = {1} for i = 1, 40 do t = {t, t} end sink(t)";
        let err = eval(script, options).await.unwrap_err();
        assert!(matches!(err, ScriptError::Runtime(_) | ScriptError::Timeout(_)), "{err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let started = Instant::now();
        let err = eval("while true do end", short(100)).await.unwrap_err();
        assert!(matches!(err, ScriptError::Timeout(100)));
        assert!(started.elapsed() < Duration::from_secs(2));

        // The host keeps working afterwards.
        assert_eq!(eval("return 'alive'", EvalOptions::default()).await.unwrap(), json!("alive"));
    }

    #[tokio::test]
    async fn pcall_cannot_swallow_timeout() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let options = short(100).callback(
            "tick",
            Callback::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }),
        );
        let script = r#"
            while true do
              tick()
              pcall(function() while true do end end)
            end
        "#;
        let err = eval(script, options).await.unwrap_err();
        assert!(err.is_timeout());

        // The worker stops ticking once it unwinds.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let settled = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn restricted_capabilities_are_named() {
        for (script, name) in [
            ("os.execute('ls')", "os.execute"),
            ("io.open('/etc/passwd')", "io.open"),
            ("loadfile('/etc/passwd')", "loadfile"),
            ("require('socket')", "require"),
            ("return os.getenv('HOME')", "os.getenv"),
            ("string.dump(print)", "string.dump"),
            ("debug.getinfo(1)", "debug.getinfo"),
        ] {
            match eval(script, EvalOptions::default()).await {
                Err(ScriptError::Restricted(got)) => assert_eq!(got, name, "{script}"),
                other => panic!("{script}: expected restricted error, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn restricted_error_message() {
        let err = eval("os.execute('ls')", EvalOptions::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "restricted capability: os.execute");
    }

    #[tokio::test]
    async fn safe_os_functions_remain() {
        let value = eval("return type(os.time()) == 'number' and type(os.clock()) == 'number'", EvalOptions::default())
            .await
            .unwrap();
        assert_eq!(value, json!(true));
    }

    #[tokio::test]
    async fn binary_chunks_are_refused() {
        let value = eval("return load('\\27Lua')", EvalOptions::default()).await.unwrap();
        // load reports failure as nil plus a message.
        assert_eq!(value, json!([null, "attempt to load a binary chunk (mode is 't')"]));
    }

    #[tokio::test]
    async fn text_load_keeps_globals() {
        let value = eval("return load('return math.max(2, 7)')()", EvalOptions::default())
            .await
            .unwrap();
        assert_eq!(value, json!(7));
    }

    #[tokio::test]
    async fn callback_receives_and_returns_values() {
        let options = EvalOptions::default().callback(
            "double",
            Callback::new(|args| Ok(json!(args[0].as_i64().unwrap_or(0) * 2))),
        );
        assert_eq!(eval("return double(5)", options).await.unwrap(), json!(10));
    }

    #[tokio::test]
    async fn callback_gets_marshalled_tables() {
        let options = EvalOptions::default().callback(
            "inspect",
            Callback::new(|args| Ok(json!(args))),
        );
        let value = eval("return inspect({1, 2}, {k = 'v'}, nil)", options).await.unwrap();
        assert_eq!(value, json!([[1, 2], {"k": "v"}, null]));
    }

    #[tokio::test]
    async fn callback_serialize_keys_are_addressable() {
        #[derive(Serialize)]
        struct Status {
            state: &'static str,
            replicas: u32,
        }

        #[derive(Serialize, PartialEq, Eq, PartialOrd, Ord)]
        #[serde(rename_all = "lowercase")]
        enum Port {
            Http,
            Https,
        }

        let options = EvalOptions::default()
            .callback(
                "status",
                Callback::returning(|_| Ok(Status { state: "running", replicas: 3 })),
            )
            .callback(
                "ports",
                Callback::returning(|_| Ok(BTreeMap::from([(Port::Http, 80), (Port::Https, 443)]))),
            );
        let value = eval(
            "local s = status() local p = ports() return s.state .. ':' .. s.replicas, p.https",
            options,
        )
        .await
        .unwrap();
        assert_eq!(value, json!(["running:3", 443]));
    }

    #[tokio::test]
    async fn callback_error_surfaces_as_runtime() {
        let options = EvalOptions::default()
            .callback("fail", Callback::new(|_| Err(CallbackError::new("upstream down"))));
        match eval("return fail()", options).await {
            Err(ScriptError::Runtime(message)) => assert!(message.contains("upstream down")),
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn callback_panic_names_the_callback() {
        let options = EvalOptions::default().callback("first", Callback::new(|args| Ok(args[0].clone())));
        match eval("return first()", options).await {
            Err(ScriptError::Runtime(message)) => {
                assert!(message.contains("callback 'first' panicked"), "{message}");
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
        // A panic inside pcall is catchable like any other callback error.
        let options = EvalOptions::default().callback("first", Callback::new(|args| Ok(args[0].clone())));
        assert_eq!(eval("return (pcall(first))", options).await.unwrap(), json!(false));
    }

    #[tokio::test]
    async fn script_errors() {
        match eval("error('boom')", EvalOptions::default()).await {
            Err(ScriptError::Runtime(message)) => assert!(message.contains("boom")),
            other => panic!("expected runtime error, got {other:?}"),
        }
        assert!(matches!(
            eval("return (", EvalOptions::default()).await,
            Err(ScriptError::Syntax(_))
        ));
        assert!(matches!(
            eval("return function() end", EvalOptions::default()).await,
            Err(ScriptError::Marshal(MarshalError::Unsupported("function")))
        ));
    }

    #[tokio::test]
    async fn memory_limit_is_enforced() {
        let options = EvalOptions::default().memory_limit(Some(4 * 1024 * 1024));
        let err = eval("local t = {} for i = 1, 1e8 do t[i] = i end", options)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Memory(_)), "{err:?}");
    }

    #[tokio::test]
    async fn state_does_not_leak_between_calls() {
        eval("leaked = 42", EvalOptions::default()).await.unwrap();
        assert_eq!(eval("return leaked", EvalOptions::default()).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn concurrent_evaluations_are_independent() {
        let tasks = (0..8).map(|i| {
            tokio::spawn(async move {
                let script = format!("local n = {i} for _ = 1, 1000 do n = n + 1 end return n");
                eval(&script, EvalOptions::default()).await.unwrap()
            })
        });
        let results = futures::future::join_all(tasks).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(i as i64 + 1000));
        }
    }

    #[tokio::test]
    async fn dropped_future_stops_worker() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let options = short(60_000).callback(
            "tick",
            Callback::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }),
        );
        let pending = eval("while true do tick() end", options);
        assert!(tokio::time::timeout(Duration::from_millis(100), pending).await.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let settled = ticks.load(Ordering::SeqCst);
        assert!(settled > 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn blocking_variant() {
        assert_eq!(eval_blocking("return 6 * 7", EvalOptions::default()).unwrap(), json!(42));
        assert!(eval_blocking("while true do end", short(50)).unwrap_err().is_timeout());
    }

    #[test]
    fn must_eval_returns_value() {
        assert_eq!(must_eval("return 'ok'", EvalOptions::default()), json!("ok"));
    }

    #[test]
    #[should_panic(expected = "restricted capability: os.exit")]
    fn must_eval_panics_with_message() {
        must_eval("os.exit(1)", EvalOptions::default());
    }

    #[test]
    fn print_does_not_fail() {
        assert_eq!(
            eval_blocking("print('hello', 1, nil) return true", EvalOptions::default()).unwrap(),
            json!(true)
        );
    }
}
