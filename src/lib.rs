//! luapool - concurrent calls into one shared Lua namespace
//!
//! A [`Vm`] owns a Lua state and a pool of coroutine-backed execution
//! contexts. Any number of threads can [`Vm::invoke`] global functions at
//! once; each call borrows its own context, so call stacks never mix, while
//! every call sees the same globals.
//!
//! ```rust,no_run
//! use luapool::{PoolConfig, Vm};
//!
//! let vm = Vm::new(PoolConfig::default())?;
//! vm.load_source("function greet(name) return 'hello ' .. name end")?;
//! let greeting: String = vm.call_as("greet", "world")?;
//! assert_eq!(greeting, "hello world");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bench;
pub mod cli;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod vm;

pub use config::{Config, PoolConfig};
pub use error::{CallError, CallOutcome, InternalFault, LoadError, PoolError, VmError};
pub use pool::PoolStats;
pub use vm::Vm;

// Engine types that appear in the public API
pub use mlua::{Lua, Value};
