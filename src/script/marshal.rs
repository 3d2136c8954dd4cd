//! Conversion between Lua values and host values (`serde_json::Value`).
//!
//! Lua → host: scalars pass through; a table whose keys are exactly
//! `1..=n` becomes an array, any other table becomes an object with string
//! keys. Objects are key-sorted, so the output serializes the same way
//! every time.
//!
//! Host → Lua: objects become tables keyed by the same strings, arrays
//! become 1-indexed tables. Anything `Serialize` can be handed over via
//! [`to_lua_serialize`]; struct fields and enum map keys arrive as their
//! textual names.

use mlua::{Lua, Table, Value as LuaValue};
use serde::Serialize;
use serde_json::{Map, Number, Value};

/// Deeper nesting than this is treated as a cycle.
pub const MAX_DEPTH: usize = 128;

/// Host-side size cap used by [`from_lua`].
pub const DEFAULT_BUDGET_BYTES: usize = 64 * 1024 * 1024;

/// The abort check runs once per this many converted values.
const ABORT_CHECK_INTERVAL: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error("cannot convert lua {0} to a host value")]
    Unsupported(&'static str),

    #[error("table nesting exceeds {MAX_DEPTH} levels (cyclic table?)")]
    TooDeep,

    #[error("converted value exceeds {0} bytes")]
    TooLarge(usize),

    #[error("conversion aborted")]
    Aborted,

    #[error("lua: {0}")]
    Lua(String),

    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Size and cancellation bound for one Lua → host conversion.
///
/// Every converted value is charged its in-memory size plus string bytes,
/// so a table shared many times over is paid for at each occurrence. A
/// budget can be reused across several conversions to bound their total.
pub struct Budget<'a> {
    limit: usize,
    remaining: usize,
    visited: usize,
    abort: &'a dyn Fn() -> bool,
}

impl<'a> Budget<'a> {
    pub fn new(limit_bytes: usize, abort: &'a dyn Fn() -> bool) -> Self {
        Self {
            limit: limit_bytes,
            remaining: limit_bytes,
            visited: 0,
            abort,
        }
    }

    fn charge(&mut self, bytes: usize) -> Result<(), MarshalError> {
        if self.visited % ABORT_CHECK_INTERVAL == 0 && (self.abort)() {
            return Err(MarshalError::Aborted);
        }
        self.visited += 1;
        self.remaining = self
            .remaining
            .checked_sub(bytes)
            .ok_or(MarshalError::TooLarge(self.limit))?;
        Ok(())
    }
}

fn never() -> bool {
    false
}

pub fn from_lua(value: &LuaValue) -> Result<Value, MarshalError> {
    from_lua_within(value, &mut Budget::new(DEFAULT_BUDGET_BYTES, &never))
}

pub fn from_lua_within(value: &LuaValue, budget: &mut Budget<'_>) -> Result<Value, MarshalError> {
    convert(value, 0, budget)
}

fn convert(value: &LuaValue, depth: usize, budget: &mut Budget<'_>) -> Result<Value, MarshalError> {
    budget.charge(std::mem::size_of::<Value>())?;
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Boolean(b) => Ok(Value::Bool(*b)),
        LuaValue::Integer(i) => Ok(Value::from(*i)),
        // NaN and infinities have no JSON form.
        LuaValue::Number(n) => Ok(Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null)),
        LuaValue::String(s) => {
            let text: String = s.to_string_lossy().into();
            budget.charge(text.len())?;
            Ok(Value::String(text))
        }
        LuaValue::Table(t) => {
            if depth >= MAX_DEPTH {
                return Err(MarshalError::TooDeep);
            }
            convert_table(t, depth + 1, budget)
        }
        other => Err(MarshalError::Unsupported(other.type_name())),
    }
}

fn convert_table(table: &Table, depth: usize, budget: &mut Budget<'_>) -> Result<Value, MarshalError> {
    let mut entries = Vec::new();
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        entries.push(pair.map_err(|e| MarshalError::Lua(e.to_string()))?);
    }

    // Keys are unique, so n integer keys all within 1..=n means exactly 1..=n.
    let n = entries.len();
    let is_sequence = entries
        .iter()
        .all(|(k, _)| matches!(k, LuaValue::Integer(i) if *i >= 1 && *i as u64 <= n as u64));

    if is_sequence {
        let mut slots = vec![Value::Null; n];
        for (k, v) in &entries {
            if let LuaValue::Integer(i) = k {
                slots[(*i - 1) as usize] = convert(v, depth, budget)?;
            }
        }
        return Ok(Value::Array(slots));
    }

    let mut map = Map::new();
    for (k, v) in &entries {
        let key = key_string(k);
        budget.charge(key.len())?;
        map.insert(key, convert(v, depth, budget)?);
    }
    Ok(Value::Object(map))
}

fn key_string(key: &LuaValue) -> String {
    match key {
        LuaValue::String(s) => s.to_string_lossy().into(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        other => format!("{}: {:p}", other.type_name(), other.to_pointer()),
    }
}

pub fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<LuaValue> {
    Ok(match value {
        Value::Null => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => LuaValue::Integer(i),
            None => LuaValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => LuaValue::String(lua.create_string(s)?),
        Value::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.raw_set(k.as_str(), to_lua(lua, v)?)?;
            }
            LuaValue::Table(table)
        }
    })
}

pub fn to_lua_serialize<T: Serialize + ?Sized>(lua: &Lua, value: &T) -> mlua::Result<LuaValue> {
    let json = serde_json::to_value(value).map_err(mlua::Error::external)?;
    to_lua(lua, &json)
}
