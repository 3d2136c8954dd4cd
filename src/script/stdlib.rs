//! Builds the restricted Lua state each evaluation runs in.
//!
//! Pure libraries (table, string, math, utf8, coroutine) load as usual.
//! `os` keeps only its clock and date functions. Everything that reaches the
//! filesystem, processes, the environment or native code is replaced by a
//! stub that raises [`RestrictedCapability`] naming what was attempted.

use mlua::{Function, Lua, LuaOptions, MultiValue, StdLib, Table, Value as LuaValue};

use super::supervisor::{DeadlineExceeded, EvalContext};

/// Global functions replaced by stubs.
pub const RESTRICTED_GLOBALS: &[&str] = &["loadfile", "dofile", "require"];

/// `os` entries replaced by stubs; `time`, `clock`, `date` and `difftime` stay.
pub const RESTRICTED_OS: &[&str] = &[
    "execute",
    "exit",
    "remove",
    "rename",
    "tmpname",
    "getenv",
    "setlocale",
];

/// Whole namespaces where any member access yields a stub.
pub const RESTRICTED_NAMESPACES: &[&str] = &["io", "package", "debug"];

#[derive(Debug, Clone, thiserror::Error)]
#[error("restricted capability: {0}")]
pub struct RestrictedCapability(pub String);

// Runs once per state. `check` aborts when the deadline has passed, so a
// script cannot swallow the timeout with pcall or a coroutine.
const PRELUDE: &str = r##"
local check, log = ...
local raw_pcall, raw_xpcall, raw_resume, raw_load = pcall, xpcall, coroutine.resume, load
local select, tostring, concat = select, tostring, table.concat

local function guard(...)
  check()
  return ...
end

pcall = function(...) return guard(raw_pcall(...)) end
xpcall = function(...) return guard(raw_xpcall(...)) end
coroutine.resume = function(...) return guard(raw_resume(...)) end

load = function(chunk, chunkname, _mode, ...)
  return raw_load(chunk, chunkname, "t", ...)
end

print = function(...)
  local parts = {}
  for i = 1, select("#", ...) do
    parts[i] = tostring((select(i, ...)))
  end
  log(concat(parts, "\t"))
end
"##;

pub(crate) fn sandboxed_lua(ctx: &EvalContext, memory_limit: Option<usize>) -> mlua::Result<Lua> {
    let libs = StdLib::TABLE
        | StdLib::STRING
        | StdLib::MATH
        | StdLib::UTF8
        | StdLib::COROUTINE
        | StdLib::OS;
    let lua = Lua::new_with(libs, LuaOptions::default())?;
    if let Some(limit) = memory_limit {
        lua.set_memory_limit(limit)?;
    }

    let globals = lua.globals();
    for name in RESTRICTED_GLOBALS {
        globals.set(*name, restricted(&lua, name.to_string())?)?;
    }

    let os: Table = globals.get("os")?;
    for name in RESTRICTED_OS {
        os.set(*name, restricted(&lua, format!("os.{name}"))?)?;
    }

    for namespace in RESTRICTED_NAMESPACES {
        globals.set(*namespace, restricted_namespace(&lua, *namespace)?)?;
    }

    let string: Table = globals.get("string")?;
    string.set("dump", restricted(&lua, "string.dump".to_string())?)?;

    let check_ctx = ctx.clone();
    let check = lua.create_function(move |_, ()| {
        if check_ctx.should_abort() {
            Err(mlua::Error::external(DeadlineExceeded))
        } else {
            Ok(())
        }
    })?;
    let log = lua.create_function(|_, line: String| {
        tracing::debug!(target: "warden::script", "{line}");
        Ok(())
    })?;
    lua.load(PRELUDE).set_name("prelude").call::<()>((check, log))?;

    Ok(lua)
}

fn restricted(lua: &Lua, name: String) -> mlua::Result<Function> {
    lua.create_function(move |_, _: MultiValue| -> mlua::Result<()> {
        Err(mlua::Error::external(RestrictedCapability(name.clone())))
    })
}

fn restricted_namespace(lua: &Lua, namespace: &'static str) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    let meta = lua.create_table()?;
    let index = lua.create_function(move |lua, (_, key): (Table, LuaValue)| {
        let key: String = match key {
            LuaValue::String(s) => s.to_string_lossy().into(),
            other => other.type_name().to_string(),
        };
        restricted(lua, format!("{namespace}.{key}"))
    })?;
    meta.set("__index", index)?;
    table.set_metatable(Some(meta));
    Ok(table)
}

/// First [`RestrictedCapability`] in the error's cause chain.
pub(crate) fn restricted_cause(err: &mlua::Error) -> Option<&RestrictedCapability> {
    find_external(err)
}

pub(crate) fn find_external<T: std::error::Error + 'static>(err: &mlua::Error) -> Option<&T> {
    match err {
        mlua::Error::ExternalError(e) => e.downcast_ref::<T>(),
        mlua::Error::CallbackError { cause, .. } => find_external(cause),
        mlua::Error::WithContext { cause, .. } => find_external(cause),
        _ => None,
    }
}
