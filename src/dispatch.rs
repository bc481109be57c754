//! Call Dispatcher
//!
//! Runs one call end to end: check out a context, resolve the function under
//! the namespace read lock, resume the context with the function and its
//! arguments, and turn whatever comes back into a [`CallOutcome`].
//!
//! The checkout guard hands the context back on every exit path. Contexts
//! that faulted, died, or were left suspended inside the called function are
//! destroyed instead.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;

use mlua::{FromLua, IntoLuaMulti, MultiValue, Value};
use tracing::{error, trace};

use crate::context::LuaContext;
use crate::error::{CallError, CallOutcome, InternalFault};
use crate::vm::Vm;

impl Vm {
    /// Call the global function `name` and collect exactly `arity` results.
    ///
    /// Missing results are filled with `nil`, extra ones are dropped.
    pub fn invoke(&self, name: &str, args: impl IntoLuaMulti, arity: usize) -> CallOutcome {
        let mut checkout = match self.pool.checkout() {
            Ok(checkout) => checkout,
            Err(err) => {
                let fault = self.record_fault(name, format!("no execution context: {}", err));
                return CallOutcome::Fault(fault);
            }
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.dispatch(checkout.context(), name, args, arity)
        }));

        match result {
            Ok(Ok(values)) => {
                trace!(function = name, results = values.len(), "call completed");
                CallOutcome::Success(values)
            }
            Ok(Err(err)) => {
                if matches!(err, CallError::Yielded { .. }) || !checkout.context().is_reusable() {
                    checkout.discard();
                }
                trace!(function = name, error = %err, "call failed");
                CallOutcome::from(err)
            }
            Err(payload) => {
                checkout.discard();
                CallOutcome::Fault(self.record_fault(name, panic_message(payload.as_ref())))
            }
        }
    }

    /// Like [`Vm::invoke`], with faults folded into the error.
    pub fn call(
        &self,
        name: &str,
        args: impl IntoLuaMulti,
        arity: usize,
    ) -> Result<Vec<Value>, CallError> {
        self.invoke(name, args, arity).into_result()
    }

    /// Call a single-result function and convert the result.
    pub fn call_as<R: FromLua>(&self, name: &str, args: impl IntoLuaMulti) -> Result<R, CallError> {
        let value = self.call(name, args, 1)?.pop().unwrap_or(Value::Nil);
        R::from_lua(value, &self.lua).map_err(|err| CallError::script(name, err.to_string()))
    }

    fn dispatch(
        &self,
        context: &LuaContext,
        name: &str,
        args: impl IntoLuaMulti,
        arity: usize,
    ) -> Result<Vec<Value>, CallError> {
        let function = self.resolve(name)?;

        let mut call = args
            .into_lua_multi(&self.lua)
            .map_err(|source| CallError::Arguments {
                name: name.to_string(),
                source,
            })?;
        call.push_front(function);

        let mut results = context
            .resume(call)
            .map_err(|err| CallError::script(name, err.to_string()))?;

        match results.pop_front() {
            Some(Value::Table(marker)) if marker == self.marker => {}
            _ => {
                return Err(CallError::Yielded {
                    name: name.to_string(),
                })
            }
        }

        match results.pop_front() {
            Some(Value::Boolean(true)) => Ok(adjust(results, arity)),
            _ => {
                let payload = results.pop_front().unwrap_or(Value::Nil);
                let message = self.describe(&payload);
                Err(CallError::raised(name, message, payload))
            }
        }
    }

    fn resolve(&self, name: &str) -> Result<Value, CallError> {
        let _guard = self.namespace.read();
        let value: Value = self
            .lua
            .globals()
            .get(name)
            .map_err(|err| CallError::script(name, err.to_string()))?;
        if value.is_nil() {
            return Err(CallError::Unresolved {
                name: name.to_string(),
            });
        }
        Ok(value)
    }

    /// Render a raised error value the way Lua's `tostring` would.
    fn describe(&self, value: &Value) -> String {
        match value {
            Value::String(message) => message.to_string_lossy().into(),
            Value::Error(err) => err.to_string(),
            other => self
                .tostring
                .call::<String>(other.clone())
                .unwrap_or_else(|_| format!("{:?}", other)),
        }
    }

    fn record_fault(&self, name: &str, message: String) -> InternalFault {
        self.faults.fetch_add(1, Ordering::Relaxed);
        error!(function = name, %message, "internal fault during call");
        InternalFault {
            function: name.to_string(),
            message,
        }
    }
}

/// Fit results to the requested arity the way Lua adjusts call results.
fn adjust(results: MultiValue, arity: usize) -> Vec<Value> {
    results
        .into_iter()
        .chain(std::iter::repeat(Value::Nil))
        .take(arity)
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
