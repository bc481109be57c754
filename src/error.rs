//! Error types
//!
//! Load failures, call failures and internal faults are kept apart so a host
//! can tell "the script said no" from "the engine broke".

use std::path::PathBuf;

use mlua::Value;
use thiserror::Error;

use crate::config::ConfigError;

/// The context pool could not be started.
#[derive(Debug, Error)]
pub enum PoolError<E: std::error::Error + 'static> {
    #[error("failed to create warm execution context: {0}")]
    Context(#[source] E),

    #[error("failed to start context reaper: {0}")]
    Reaper(#[source] std::io::Error),
}

/// A script could not be loaded into the shared namespace.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read script {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load chunk '{chunk}': {source}")]
    Script {
        chunk: String,
        #[source]
        source: mlua::Error,
    },
}

/// A fault caught at the dispatch boundary.
///
/// The engine (or a host function running inside it) panicked, or no context
/// could be created at all. The context involved is destroyed.
#[derive(Debug, Clone, Error)]
#[error("internal fault while calling '{function}': {message}")]
pub struct InternalFault {
    pub function: String,
    pub message: String,
}

/// A call did not produce results.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("attempt to call unresolved global '{name}'")]
    Unresolved { name: String },

    #[error("invalid arguments for '{name}': {source}")]
    Arguments {
        name: String,
        #[source]
        source: mlua::Error,
    },

    /// `payload` is the value the script raised, `message` its `tostring` form.
    #[error("error in '{name}': {message}")]
    Script {
        name: String,
        message: String,
        payload: Value,
    },

    #[error("'{name}' yielded across the dispatch boundary")]
    Yielded { name: String },

    #[error(transparent)]
    Fault(#[from] InternalFault),
}

impl CallError {
    /// A script error raised on the host side, with no Lua value behind it.
    pub(crate) fn script(name: &str, message: impl Into<String>) -> Self {
        Self::raised(name, message, Value::Nil)
    }

    pub(crate) fn raised(name: &str, message: impl Into<String>, payload: Value) -> Self {
        CallError::Script {
            name: name.to_string(),
            message: message.into(),
            payload,
        }
    }

    /// The value a script passed to `error`, if this is a script error.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            CallError::Script { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

/// Errors from constructing a [`Vm`](crate::Vm) or touching its globals.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("engine error: {0}")]
    Engine(#[from] mlua::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError<mlua::Error>),

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// How a single dispatched call ended.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    /// Exactly as many values as the caller asked for.
    Success(Vec<Value>),
    /// Unresolved name, bad arguments or a script-level error.
    Failed(CallError),
    /// The engine faulted; results are indeterminate.
    Fault(InternalFault),
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, CallOutcome::Fault(_))
    }

    /// Values of a successful call, empty otherwise.
    pub fn values(&self) -> &[Value] {
        match self {
            CallOutcome::Success(values) => values,
            _ => &[],
        }
    }

    /// Flatten into a `Result`, folding faults into [`CallError::Fault`].
    pub fn into_result(self) -> Result<Vec<Value>, CallError> {
        match self {
            CallOutcome::Success(values) => Ok(values),
            CallOutcome::Failed(err) => Err(err),
            CallOutcome::Fault(fault) => Err(CallError::Fault(fault)),
        }
    }
}

impl From<CallError> for CallOutcome {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Fault(fault) => CallOutcome::Fault(fault),
            other => CallOutcome::Failed(other),
        }
    }
}
