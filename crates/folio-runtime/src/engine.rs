//! QuickJS engine wrapper.
//!
//! An [`Engine`] owns exactly one interpreter instance. It is not `Send`:
//! it is created, driven and dropped on the plugin's worker thread.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rquickjs::context::EvalOptions;
use rquickjs::function::Rest;
use rquickjs::{Coerced, Context, Ctx, Function, IntoJs, Object, Runtime, Type, Value as JsValue};

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};

/// Evaluated right after the context is created so plugin sources can
/// assign to `module.exports` or `exports` unconditionally.
const MODULE_SHIM: &str = r#"
var module = { exports: {} };
var exports = module.exports;
"#;

/// Native jobs run per drain before control returns to the caller.
const MAX_JOBS_PER_DRAIN: usize = 10_000;

/// Lifecycle of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Disposed,
}

/// Host-side projection of a script value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<ScriptValue>),
    /// Objects, functions and anything else without a plain host form.
    Opaque,
}

impl ScriptValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScriptValue::Null)
    }
}

/// Resource limits applied to a new interpreter.
#[derive(Debug, Clone, Copy)]
pub struct EngineLimits {
    pub memory_limit_bytes: usize,
    pub max_stack_size_bytes: usize,
    /// Wall-clock budget for one synchronous step; zero disables the budget.
    pub step_budget: Duration,
}

impl From<&RuntimeConfig> for EngineLimits {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            memory_limit_bytes: config.memory_limit_bytes,
            max_stack_size_bytes: config.max_stack_size_bytes,
            step_budget: config.step_cpu_budget(),
        }
    }
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

struct Interpreter {
    context: Context,
    runtime: Runtime,
}

/// A single embedded interpreter with an explicit lifecycle.
pub struct Engine {
    name: String,
    limits: EngineLimits,
    state: EngineState,
    interpreter: Option<Interpreter>,
    /// Read by the interrupt handler; set while a step is running.
    deadline: Rc<Cell<Option<Instant>>>,
}

impl Engine {
    pub fn new(name: impl Into<String>, limits: EngineLimits) -> Self {
        Self {
            name: name.into(),
            limits,
            state: EngineState::Uninitialized,
            interpreter: None,
            deadline: Rc::new(Cell::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Create the interpreter and evaluate the module shim.
    ///
    /// Calling this on a ready engine does nothing. A disposed engine cannot
    /// be brought back.
    pub fn initialize(&mut self) -> RuntimeResult<()> {
        match self.state {
            EngineState::Ready => return Ok(()),
            EngineState::Disposed => return Err(RuntimeError::EngineNotInitialized),
            EngineState::Uninitialized => {}
        }

        tracing::debug!("[engine:{}] Creating interpreter", self.name);
        let runtime = Runtime::new().map_err(|e| RuntimeError::EngineInit(e.to_string()))?;
        runtime.set_memory_limit(self.limits.memory_limit_bytes);
        runtime.set_max_stack_size(self.limits.max_stack_size_bytes);

        let deadline = self.deadline.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            deadline.get().is_some_and(|at| Instant::now() >= at)
        })));

        let context = Context::full(&runtime).map_err(|e| RuntimeError::EngineInit(e.to_string()))?;
        context
            .with(|ctx| ctx.eval::<JsValue, _>(MODULE_SHIM).map(|_| ()))
            .map_err(|e| RuntimeError::EngineInit(format!("module shim failed: {}", e)))?;

        self.interpreter = Some(Interpreter { context, runtime });
        self.state = EngineState::Ready;
        Ok(())
    }

    /// Evaluate a script in the global scope.
    pub fn evaluate(&self, source: &str) -> RuntimeResult<ScriptValue> {
        self.with_context(|ctx| {
            let value: JsValue = ctx.eval(source).map_err(|e| script_error(&ctx, e))?;
            Ok(project(&value))
        })
    }

    /// Evaluate sloppy-mode source such as a plugin bundle.
    ///
    /// `label` only appears in error messages.
    pub fn evaluate_script(&self, label: &str, source: &str) -> RuntimeResult<ScriptValue> {
        self.with_context(|ctx| {
            let mut options = EvalOptions::default();
            options.global = true;
            options.strict = false;
            options.backtrace_barrier = true;

            let value: JsValue = ctx
                .eval_with_options(source, options)
                .map_err(|e| match script_error(&ctx, e) {
                    RuntimeError::ScriptEvaluation { message, stack } => RuntimeError::ScriptEvaluation {
                        message: format!("{}: {}", label, message),
                        stack,
                    },
                    other => other,
                })?;
            Ok(project(&value))
        })
    }

    /// Call a global function with JSON arguments.
    pub fn call_function(&self, name: &str, args: &[serde_json::Value]) -> RuntimeResult<ScriptValue> {
        self.with_context(|ctx| {
            let func: Function = ctx
                .globals()
                .get(name)
                .map_err(|_| RuntimeError::ScriptEvaluation {
                    message: format!("{} is not a function", name),
                    stack: String::new(),
                })?;

            let mut js_args = Vec::with_capacity(args.len());
            for arg in args {
                js_args.push(json_to_js(&ctx, arg)?);
            }

            let value: JsValue = func.call((Rest(js_args),)).map_err(|e| script_error(&ctx, e))?;
            Ok(project(&value))
        })
    }

    pub fn get_global(&self, name: &str) -> RuntimeResult<ScriptValue> {
        self.with_context(|ctx| {
            let value: JsValue = ctx.globals().get(name)?;
            Ok(project(&value))
        })
    }

    pub fn set_global(&self, name: &str, value: &serde_json::Value) -> RuntimeResult<()> {
        self.with_context(|ctx| {
            let js_value = json_to_js(&ctx, value)?;
            ctx.globals().set(name, js_value)?;
            Ok(())
        })
    }

    pub fn remove_global(&self, name: &str) -> RuntimeResult<()> {
        self.with_context(|ctx| {
            ctx.globals().remove(name)?;
            Ok(())
        })
    }

    /// Drain the interpreter's native job queue.
    ///
    /// QuickJS never runs these on its own; native `async` functions and
    /// native promises only progress here. Failed jobs are logged and
    /// skipped.
    pub fn run_pending_jobs(&self) -> RuntimeResult<usize> {
        let interpreter = self.interpreter()?;
        self.arm_deadline();

        let mut ran = 0;
        while ran < MAX_JOBS_PER_DRAIN {
            match interpreter.runtime.execute_pending_job() {
                Ok(true) => ran += 1,
                Ok(false) => break,
                Err(err) => {
                    tracing::warn!("[engine:{}] Pending job failed: {:?}", self.name, err);
                    ran += 1;
                }
            }
        }

        self.deadline.set(None);
        Ok(ran)
    }

    /// Run garbage collection.
    pub fn gc(&self) {
        if let Some(interpreter) = &self.interpreter {
            interpreter.runtime.run_gc();
        }
    }

    /// Release the interpreter. Every later call fails with
    /// [`RuntimeError::EngineNotInitialized`].
    pub fn dispose(&mut self) {
        if self.interpreter.take().is_some() {
            tracing::debug!("[engine:{}] Disposed", self.name);
        }
        self.state = EngineState::Disposed;
    }

    /// Run `f` inside the context with the step budget armed.
    pub(crate) fn with_context<R, F>(&self, f: F) -> RuntimeResult<R>
    where
        F: FnOnce(Ctx<'_>) -> RuntimeResult<R>,
    {
        let interpreter = self.interpreter()?;
        self.arm_deadline();
        let result = interpreter.context.with(f);
        self.deadline.set(None);
        result
    }

    fn interpreter(&self) -> RuntimeResult<&Interpreter> {
        match (&self.state, &self.interpreter) {
            (EngineState::Ready, Some(interpreter)) => Ok(interpreter),
            _ => Err(RuntimeError::EngineNotInitialized),
        }
    }

    fn arm_deadline(&self) {
        if !self.limits.step_budget.is_zero() {
            self.deadline.set(Some(Instant::now() + self.limits.step_budget));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Turn a pending exception into a [`RuntimeError::ScriptEvaluation`].
pub(crate) fn script_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> RuntimeError {
    if !err.is_exception() {
        return RuntimeError::from(err);
    }

    let exception = ctx.catch();
    if let Some(obj) = exception.as_object() {
        let name: String = obj.get("name").unwrap_or_else(|_| "Error".to_string());
        let message: String = obj.get("message").unwrap_or_default();
        let stack: String = obj.get("stack").unwrap_or_default();
        let message = if message.is_empty() {
            name
        } else {
            format!("{}: {}", name, message)
        };
        return RuntimeError::ScriptEvaluation { message, stack };
    }

    let message = exception
        .get::<Coerced<String>>()
        .map(|text| text.0)
        .unwrap_or_else(|_| "Uncaught exception".to_string());
    RuntimeError::ScriptEvaluation {
        message,
        stack: String::new(),
    }
}

fn project(value: &JsValue<'_>) -> ScriptValue {
    match value.type_of() {
        Type::Undefined | Type::Null | Type::Uninitialized => ScriptValue::Null,
        Type::Bool => value.as_bool().map(ScriptValue::Bool).unwrap_or(ScriptValue::Null),
        Type::Int => value
            .as_int()
            .map(|i| ScriptValue::Number(i as f64))
            .unwrap_or(ScriptValue::Null),
        Type::Float => value.as_float().map(ScriptValue::Number).unwrap_or(ScriptValue::Null),
        Type::String => value
            .as_string()
            .and_then(|s| s.to_string().ok())
            .map(ScriptValue::String)
            .unwrap_or(ScriptValue::Null),
        Type::Array => match value.as_array() {
            Some(array) => ScriptValue::Array(
                array
                    .iter::<JsValue>()
                    .map(|item| item.map(|v| project(&v)).unwrap_or(ScriptValue::Null))
                    .collect(),
            ),
            None => ScriptValue::Opaque,
        },
        _ => ScriptValue::Opaque,
    }
}

/// Convert a serde_json::Value to a JavaScript value.
pub(crate) fn json_to_js<'js>(ctx: &Ctx<'js>, json: &serde_json::Value) -> RuntimeResult<JsValue<'js>> {
    match json {
        serde_json::Value::Null => Ok(JsValue::new_null(ctx.clone())),
        serde_json::Value::Bool(b) => Ok(JsValue::new_bool(ctx.clone(), *b)),
        serde_json::Value::Number(n) => {
            match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Some(i) => Ok(JsValue::new_int(ctx.clone(), i)),
                None => Ok(JsValue::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN))),
            }
        }
        serde_json::Value::String(s) => Ok(s.as_str().into_js(ctx)?),
        serde_json::Value::Array(items) => {
            let array = rquickjs::Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                array.set(i, json_to_js(ctx, item)?)?;
            }
            Ok(array.into_value())
        }
        serde_json::Value::Object(map) => {
            let obj = Object::new(ctx.clone())?;
            for (key, value) in map {
                obj.set(key.as_str(), json_to_js(ctx, value)?)?;
            }
            Ok(obj.into_value())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
