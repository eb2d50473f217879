//! Fresh interpreter context per run
//!
//! The context holds only the language intrinsics plus the capture
//! bindings: `emit(...)` and `console.log/info/warn/error(...)`. Nothing
//! from the host (files, network, environment) is in scope.

use crate::config::types::{ExecutionLimits, ExecutionOutcome, GradeError, Result};
use crate::utils::output::{CaptureChannel, EmitStatus};
use boa_engine::{
    context::ContextBuilder, js_string, object::ObjectInitializer, property::Attribute, Context,
    JsError, JsNativeError, JsResult, JsString, JsValue, NativeFunction, Source,
};

/// Console methods routed into the capture channel
const CONSOLE_METHODS: &[&str] = &["log", "info", "warn", "error"];

/// One run's interpreter. Never reused across runs.
pub struct Isolate {
    context: Context,
}

impl Isolate {
    /// Build a context wired to `capture` and bounded by `limits`
    pub fn new(capture: &CaptureChannel, limits: &ExecutionLimits) -> Result<Self> {
        let mut context = ContextBuilder::new()
            .build()
            .map_err(|e| GradeError::Worker(format!("failed to construct JS context: {}", e)))?;

        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(limits.loop_iteration_limit);
        context
            .runtime_limits_mut()
            .set_recursion_limit(limits.recursion_limit);

        context
            .register_global_callable(js_string!("emit"), 1, emit_binding(capture.clone()))
            .map_err(|e| GradeError::Worker(format!("failed to bind emit: {}", e)))?;

        let mut console = ObjectInitializer::new(&mut context);
        for method in CONSOLE_METHODS {
            console.function(emit_binding(capture.clone()), JsString::from(*method), 0);
        }
        let console = console.build();
        context
            .register_global_property(
                js_string!("console"),
                console,
                Attribute::WRITABLE | Attribute::CONFIGURABLE,
            )
            .map_err(|e| GradeError::Worker(format!("failed to bind console: {}", e)))?;

        Ok(Isolate { context })
    }

    /// Evaluate `source` as a script and classify how it ended
    ///
    /// Promise continuations are not driven; only synchronous code runs.
    pub fn evaluate(&mut self, source: &str) -> ExecutionOutcome {
        match self.context.eval(Source::from_bytes(source.as_bytes())) {
            Ok(value) if value.is_undefined() => ExecutionOutcome::Completed {
                terminal_value: None,
            },
            Ok(value) => ExecutionOutcome::Completed {
                terminal_value: Some(render_value(&value, &mut self.context)),
            },
            Err(err) => ExecutionOutcome::Threw {
                message: error_message(err, &mut self.context),
            },
        }
    }
}

/// Evaluate `source` in a fresh isolate wired to `capture`
pub fn evaluate(
    source: &str,
    capture: &CaptureChannel,
    limits: &ExecutionLimits,
) -> Result<ExecutionOutcome> {
    let mut isolate = Isolate::new(capture, limits)?;
    Ok(isolate.evaluate(source))
}

/// Native function that joins its arguments with a space and emits one line
fn emit_binding(capture: CaptureChannel) -> NativeFunction {
    // SAFETY: the closure captures only a CaptureChannel, which holds no
    // garbage-collected values, so nothing needs tracing.
    unsafe {
        NativeFunction::from_closure(move |_this, args, context| {
            let line = render_args(args, context)?;
            match capture.emit(line) {
                EmitStatus::Accepted | EmitStatus::Truncated => Ok(JsValue::undefined()),
                // Runtime-limit errors bypass try/catch, so a closed run
                // cannot keep talking.
                EmitStatus::Closed => Err(JsNativeError::runtime_limit()
                    .with_message("run abandoned")
                    .into()),
            }
        })
    }
}

fn render_args(args: &[JsValue], context: &mut Context) -> JsResult<String> {
    let parts = args
        .iter()
        .map(|arg| arg.to_string(context).map(|s| s.to_std_string_escaped()))
        .collect::<JsResult<Vec<_>>>()?;
    Ok(parts.join(" "))
}

fn render_value(value: &JsValue, context: &mut Context) -> String {
    match value.to_string(context) {
        Ok(s) => s.to_std_string_escaped(),
        // Symbols and objects with throwing toString
        Err(_) => value.display().to_string(),
    }
}

fn error_message(err: JsError, context: &mut Context) -> String {
    if let Ok(native) = err.try_native(context) {
        return native.message().to_string();
    }
    match err.as_opaque() {
        Some(value) => render_value(value, context),
        None => err.to_string(),
    }
}
