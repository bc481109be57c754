//! VM State
//!
//! Owns the base Lua state (and with it the global namespace shared by every
//! context) plus the lock that orders namespace access. Loads, `set_global`
//! and host function registration take the lock exclusively; `get_global` and
//! the name lookup of a dispatched call take it shared. Running a function body
//! on a pooled context is outside the lock.
//!
//! Host functions must not call back into the same `Vm`: they run while the
//! engine is locked, and a re-entrant namespace write would wait on it forever.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use mlua::{
    FromLua, FromLuaMulti, Function, IntoLua, IntoLuaMulti, Lua, LuaOptions, StdLib, Table,
};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::{Config, PoolConfig};
use crate::context::LuaContextFactory;
use crate::error::{LoadError, VmError};
use crate::pool::{ContextPool, PoolStats};

pub struct Vm {
    // Declared first so contexts are released before the base state goes away.
    pub(crate) pool: ContextPool<LuaContextFactory>,
    pub(crate) marker: Table,
    /// Captured before any script runs, for rendering raised error values.
    pub(crate) tostring: Function,
    pub(crate) lua: Lua,
    pub(crate) namespace: RwLock<()>,
    pub(crate) faults: AtomicU64,
}

impl Vm {
    /// Create a VM with the given pool settings.
    pub fn new(pool: PoolConfig) -> Result<Self, VmError> {
        Self::from_config(&Config {
            pool,
            ..Default::default()
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, VmError> {
        config.validate()?;

        // Panics from host functions must reach the dispatch boundary instead
        // of being turned into script errors by `pcall`.
        let lua = Lua::new_with(
            StdLib::ALL_SAFE,
            LuaOptions::new().catch_rust_panics(false),
        )?;
        if let Some(limit) = config.engine.memory_limit_bytes {
            lua.set_memory_limit(limit)?;
        }

        let tostring: Function = lua.globals().get("tostring")?;
        let (factory, marker) = LuaContextFactory::new(&lua)?;
        let pool = ContextPool::new(factory, &config.pool)?;

        info!(
            capacity = config.pool.capacity,
            warm_contexts = config.pool.warm_contexts,
            "created lua vm"
        );

        Ok(Self {
            pool,
            marker,
            tostring,
            lua,
            namespace: RwLock::new(()),
            faults: AtomicU64::new(0),
        })
    }

    /// Run `source` against the shared namespace.
    pub fn load_source(&self, source: &str) -> Result<(), LoadError> {
        self.load_named("source", source)
    }

    /// Run `source` as a chunk called `name` (used in error messages).
    pub fn load_named(&self, name: &str, source: &str) -> Result<(), LoadError> {
        let _guard = self.namespace.write();
        self.lua
            .load(source)
            .set_name(name)
            .exec()
            .map_err(|source| LoadError::Script {
                chunk: name.to_string(),
                source,
            })?;
        debug!(chunk = name, bytes = source.len(), "loaded chunk");
        Ok(())
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_named(&format!("@{}", path.display()), &source)
    }

    pub fn get_global<V: FromLua>(&self, name: &str) -> Result<V, VmError> {
        let _guard = self.namespace.read();
        Ok(self.lua.globals().get(name)?)
    }

    pub fn set_global(&self, name: &str, value: impl IntoLua) -> Result<(), VmError> {
        let _guard = self.namespace.write();
        self.lua.globals().set(name, value)?;
        Ok(())
    }

    /// Bind a Rust closure as a global function.
    pub fn register_host_function<F, A, R>(&self, name: &str, func: F) -> Result<(), VmError>
    where
        F: Fn(&Lua, A) -> mlua::Result<R> + Send + 'static,
        A: FromLuaMulti,
        R: IntoLuaMulti,
    {
        let _guard = self.namespace.write();
        let function = self.lua.create_function(func)?;
        self.lua.globals().set(name, function)?;
        debug!(name, "registered host function");
        Ok(())
    }

    /// Number of execution contexts alive right now, idle or in use.
    pub fn live_context_count(&self) -> usize {
        self.pool.live_count()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Internal faults caught at the dispatch boundary so far.
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// The underlying engine, for value conversion.
    ///
    /// Going around the namespace lock with this handle forfeits its ordering.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

#[cfg(test)]
#[path = "tests/vm_tests.rs"]
mod tests;
