use crate::error::{DispatchError, DispatchResult};
use crate::script::{Script, ScriptContext, ScriptValue, ValueKind};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

pub const LOAD: &str = "load";
pub const UPDATE: &str = "update";
pub const DESTROY: &str = "destroy";

const UPDATE_SIGNATURE: &[ValueKind] = &[ValueKind::Float];
const UNNAMED: &str = "<unnamed script>";

/// Every call from the host into guest code goes through here.
///
/// Guest errors and panics come back as [`DispatchError`]s; nothing unwinds past the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct DynamicDispatcher {
    slow_call_threshold: Option<Duration>,
}

impl DynamicDispatcher {
    pub fn new(slow_call_threshold: Option<Duration>) -> Self {
        Self { slow_call_threshold }
    }

    pub fn slow_call_threshold(&self) -> Option<Duration> {
        self.slow_call_threshold
    }

    /// Calls `method` with exactly the signature `arg_types` on `script`.
    pub fn invoke(
        &self,
        script: &mut dyn Script,
        ctx: &mut ScriptContext<'_>,
        method: &str,
        arg_types: &[ValueKind],
        args: &[ScriptValue],
    ) -> DispatchResult<ScriptValue> {
        let target = self.script_name(&*script);
        let supplied: Vec<ValueKind> = args.iter().map(ScriptValue::kind).collect();
        if supplied != arg_types {
            return Err(method_not_found(&target, method, &supplied));
        }
        match method {
            LOAD | DESTROY if !arg_types.is_empty() => Err(method_not_found(&target, method, arg_types)),
            UPDATE if arg_types != UPDATE_SIGNATURE => Err(method_not_found(&target, method, arg_types)),
            LOAD => self.call(&target, method, || script.load(ctx)).map(|()| ScriptValue::Unit),
            DESTROY => self.call(&target, method, || script.destroy(ctx)).map(|()| ScriptValue::Unit),
            UPDATE => {
                let dt = args[0].as_float().unwrap_or_default();
                self.call(&target, method, || script.update(ctx, dt)).map(|()| ScriptValue::Unit)
            }
            _ => {
                let outcome = self.call(&target, method, || script.invoke(ctx, method, args).transpose())?;
                outcome.ok_or_else(|| method_not_found(&target, method, arg_types))
            }
        }
    }

    pub fn load(&self, script: &mut dyn Script, ctx: &mut ScriptContext<'_>) -> DispatchResult<()> {
        self.invoke(script, ctx, LOAD, &[], &[]).map(drop)
    }

    pub fn update(&self, script: &mut dyn Script, ctx: &mut ScriptContext<'_>, dt: f64) -> DispatchResult<()> {
        self.invoke(script, ctx, UPDATE, UPDATE_SIGNATURE, &[ScriptValue::Float(dt)]).map(drop)
    }

    pub fn destroy(&self, script: &mut dyn Script, ctx: &mut ScriptContext<'_>) -> DispatchResult<()> {
        self.invoke(script, ctx, DESTROY, &[], &[]).map(drop)
    }

    /// Reads the script's display name under the same guard as any other guest call.
    pub fn script_name(&self, script: &dyn Script) -> String {
        match self.call(UNNAMED, "name", || Ok(script.name().to_string())) {
            Ok(name) => name,
            Err(err) => {
                warn!("reading script name failed: {err}");
                UNNAMED.to_string()
            }
        }
    }

    /// Drops a guest-owned value, so a panicking `Drop` is contained like any other call.
    pub fn release<T>(&self, target: &str, value: T) -> DispatchResult<()> {
        self.call(target, "drop", move || {
            drop(value);
            Ok(())
        })
    }

    /// Runs one guest call, converting `Err` and panics into [`DispatchError`].
    pub fn call<T>(
        &self,
        target: &str,
        method: &str,
        call: impl FnOnce() -> anyhow::Result<T>,
    ) -> DispatchResult<T> {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(call));
        let elapsed = started.elapsed();
        if self.slow_call_threshold.is_some_and(|threshold| elapsed > threshold) {
            warn!(target_name = target, method, elapsed_ms = elapsed.as_millis() as u64, "slow script call");
        } else {
            trace!(target_name = target, method, elapsed_us = elapsed.as_micros() as u64, "script call");
        }
        match outcome {
            Ok(Ok(value)) => Ok(value),
            // Guest errors carry vtables from the artifact, so only the rendered chain is kept.
            Ok(Err(source)) => Err(DispatchError::Failed {
                target: target.to_string(),
                method: method.to_string(),
                source: anyhow::Error::msg(format!("{source:#}")),
            }),
            Err(payload) => Err(DispatchError::Panicked {
                target: target.to_string(),
                method: method.to_string(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

fn method_not_found(target: &str, method: &str, signature: &[ValueKind]) -> DispatchError {
    DispatchError::MethodNotFound {
        target: target.to_string(),
        method: method.to_string(),
        signature: ValueKind::signature(signature),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};

    #[derive(Default)]
    struct Tracker {
        calls: Vec<String>,
    }

    impl Script for Tracker {
        fn name(&self) -> &str {
            "tracker"
        }

        fn load(&mut self, _ctx: &mut ScriptContext<'_>) -> Result<()> {
            self.calls.push("load".into());
            Ok(())
        }

        fn update(&mut self, _ctx: &mut ScriptContext<'_>, dt: f64) -> Result<()> {
            self.calls.push(format!("update:{dt}"));
            if dt < 0.0 {
                bail!("negative dt");
            }
            if dt > 100.0 {
                panic!("dt overflow");
            }
            Ok(())
        }

        fn invoke(
            &mut self,
            _ctx: &mut ScriptContext<'_>,
            method: &str,
            args: &[ScriptValue],
        ) -> Option<Result<ScriptValue>> {
            match method {
                "greet" => Some(Ok(ScriptValue::Str(format!("hello {}", args[0])))),
                _ => None,
            }
        }
    }

    fn run<R>(f: impl FnOnce(&DynamicDispatcher, &mut Tracker, &mut ScriptContext<'_>) -> R) -> (R, Tracker) {
        let mut engine = ();
        let mut ctx = ScriptContext::new(&mut engine, "test");
        let mut tracker = Tracker::default();
        let result = f(&DynamicDispatcher::default(), &mut tracker, &mut ctx);
        (result, tracker)
    }

    #[test]
    fn lifecycle_calls_reach_the_script() {
        let (result, tracker) = run(|dispatcher, tracker, ctx| {
            dispatcher.load(tracker, ctx)?;
            dispatcher.update(tracker, ctx, 0.25)
        });
        result.expect("lifecycle succeeds");
        assert_eq!(tracker.calls, vec!["load".to_string(), "update:0.25".to_string()]);
    }

    #[test]
    fn wrong_signature_is_method_not_found() {
        let (result, tracker) = run(|dispatcher, tracker, ctx| {
            dispatcher.invoke(tracker, ctx, UPDATE, &[ValueKind::Int], &[ScriptValue::Int(1)])
        });
        assert!(matches!(result, Err(DispatchError::MethodNotFound { .. })), "got {result:?}");
        assert!(tracker.calls.is_empty(), "no call should be made");
    }

    #[test]
    fn mismatched_arguments_are_rejected() {
        let (result, _) = run(|dispatcher, tracker, ctx| {
            dispatcher.invoke(tracker, ctx, UPDATE, &[ValueKind::Float], &[ScriptValue::Bool(true)])
        });
        assert!(matches!(result, Err(DispatchError::MethodNotFound { .. })), "got {result:?}");
    }

    #[test]
    fn extension_methods_and_unknown_names() {
        let (result, _) = run(|dispatcher, tracker, ctx| {
            dispatcher.invoke(tracker, ctx, "greet", &[ValueKind::Str], &[ScriptValue::Str("kestrel".into())])
        });
        assert_eq!(result.expect("greet exists"), ScriptValue::Str("hello \"kestrel\"".into()));

        let (result, _) = run(|dispatcher, tracker, ctx| dispatcher.invoke(tracker, ctx, "fly", &[], &[]));
        match result {
            Err(DispatchError::MethodNotFound { target, method, signature }) => {
                assert_eq!((target.as_str(), method.as_str(), signature.as_str()), ("tracker", "fly", "()"));
            }
            other => panic!("expected MethodNotFound, got {other:?}"),
        }
    }

    #[test]
    fn guest_errors_and_panics_are_contained() {
        let (result, _) = run(|dispatcher, tracker, ctx| dispatcher.update(tracker, ctx, -1.0));
        assert!(matches!(result, Err(DispatchError::Failed { .. })), "got {result:?}");

        let (result, tracker) = run(|dispatcher, tracker, ctx| dispatcher.update(tracker, ctx, 1000.0));
        match result {
            Err(DispatchError::Panicked { message, .. }) => assert_eq!(message, "dt overflow"),
            other => panic!("expected panic to be contained, got {other:?}"),
        }
        assert_eq!(tracker.calls.len(), 1);
    }

    struct Nameless;

    impl Script for Nameless {
        fn name(&self) -> &str {
            panic!("name table missing")
        }

        fn load(&mut self, _ctx: &mut ScriptContext<'_>) -> Result<()> {
            Ok(())
        }

        fn update(&mut self, _ctx: &mut ScriptContext<'_>, _dt: f64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn panicking_name_falls_back_and_the_call_still_runs() {
        let dispatcher = DynamicDispatcher::default();
        let mut engine = ();
        let mut ctx = ScriptContext::new(&mut engine, "test");
        let mut script = Nameless;
        assert_eq!(dispatcher.script_name(&script), "<unnamed script>");
        dispatcher.load(&mut script, &mut ctx).expect("load still dispatched");
        let err = dispatcher.invoke(&mut script, &mut ctx, "fly", &[], &[]).err().expect("no such method");
        assert!(err.to_string().contains("<unnamed script>"), "unexpected error: {err}");
    }

    struct LoudDrop;

    impl Drop for LoudDrop {
        fn drop(&mut self) {
            panic!("drop blew up");
        }
    }

    #[test]
    fn release_contains_panicking_drops() {
        let err = DynamicDispatcher::default().release("loud", LoudDrop).err().expect("drop panicked");
        assert!(matches!(err, DispatchError::Panicked { .. }), "got {err:?}");
    }
}
