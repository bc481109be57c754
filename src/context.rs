//! Execution contexts backed by Lua coroutines
//!
//! Each context is a coroutine running a small dispatch loop. Resuming it with
//! `(function, args...)` runs the function under `pcall` and yields
//! `(marker, ok, results...)` back to the host. The coroutine stays suspended
//! in the loop between calls, so one context serves any number of calls.

use mlua::{Function, Lua, MultiValue, Table, Thread, ThreadStatus};

const DISPATCH_LOOP: &str = r#"
local pcall, yield = pcall, coroutine.yield
local marker = {}

local function dispatch(f, ...)
    return dispatch(yield(marker, pcall(f, ...)))
end

return dispatch, marker
"#;

/// One independent call stack into the shared globals.
pub struct LuaContext {
    thread: Thread,
}

impl LuaContext {
    pub(crate) fn resume(&self, call: MultiValue) -> mlua::Result<MultiValue> {
        self.thread.resume(call)
    }

    /// Suspended inside the dispatch loop and ready for another call.
    pub fn is_reusable(&self) -> bool {
        matches!(self.thread.status(), ThreadStatus::Resumable)
    }
}

/// Spawns [`LuaContext`]s from a base state.
pub struct LuaContextFactory {
    lua: Lua,
    dispatch: Function,
}

impl LuaContextFactory {
    /// Load the dispatch loop into `lua`.
    ///
    /// Also returns the marker table every completed call yields first, so a
    /// yield coming from inside the called function can be told apart.
    pub(crate) fn new(lua: &Lua) -> mlua::Result<(Self, Table)> {
        let (dispatch, marker): (Function, Table) =
            lua.load(DISPATCH_LOOP).set_name("=dispatch").eval()?;
        let factory = Self {
            lua: lua.clone(),
            dispatch,
        };
        Ok((factory, marker))
    }
}

impl crate::pool::ContextFactory for LuaContextFactory {
    type Context = LuaContext;
    type Error = mlua::Error;

    fn spawn(&self) -> mlua::Result<LuaContext> {
        let thread = self.lua.create_thread(self.dispatch.clone())?;
        Ok(LuaContext { thread })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ContextFactory;
    use mlua::Value;

    fn call(context: &LuaContext, f: Function, args: Vec<Value>) -> MultiValue {
        let mut call = MultiValue::from_vec(args);
        call.push_front(Value::Function(f));
        context.resume(call).unwrap()
    }

    #[test]
    fn test_context_survives_many_calls() {
        let lua = Lua::new();
        let (factory, marker) = LuaContextFactory::new(&lua).unwrap();
        let context = factory.spawn().unwrap();
        let add: Function = lua.load("return function(a, b) return a + b end").eval().unwrap();

        for i in 0..5 {
            let results = call(&context, add.clone(), vec![Value::Integer(i), Value::Integer(1)]);
            let results: Vec<Value> = results.into_iter().collect();
            assert_eq!(results[0], Value::Table(marker.clone()));
            assert_eq!(results[1], Value::Boolean(true));
            assert_eq!(results[2], Value::Integer(i + 1));
            assert!(context.is_reusable());
        }
    }

    #[test]
    fn test_script_error_is_returned_as_value() {
        let lua = Lua::new();
        let (factory, _marker) = LuaContextFactory::new(&lua).unwrap();
        let context = factory.spawn().unwrap();
        let fail: Function = lua.load("return function() error('boom') end").eval().unwrap();

        let results: Vec<Value> = call(&context, fail, vec![]).into_iter().collect();
        assert_eq!(results[1], Value::Boolean(false));
        match &results[2] {
            Value::String(message) => assert!(message.to_string_lossy().contains("boom")),
            other => panic!("expected error message, got {:?}", other),
        }
        assert!(context.is_reusable());
    }

    #[test]
    fn test_contexts_share_globals() {
        let lua = Lua::new();
        let (factory, _marker) = LuaContextFactory::new(&lua).unwrap();
        let first = factory.spawn().unwrap();
        let second = factory.spawn().unwrap();
        let set: Function = lua.load("return function(v) shared = v end").eval().unwrap();
        let get: Function = lua.load("return function() return shared end").eval().unwrap();

        call(&first, set, vec![Value::Integer(7)]);
        let results: Vec<Value> = call(&second, get, vec![]).into_iter().collect();
        assert_eq!(results[2], Value::Integer(7));
    }
}
