//! Table conversion
//!
//! Tables are copied in both directions. Cycles and shared subtables are
//! preserved within one top-level conversion through the [`Seen`] maps: VM
//! tables are keyed by `lua_topointer`, host tables by allocation identity.

use std::ffi::{c_int, CStr};

use super::{Seen, TypeExtension};
use crate::binding::{self, ffi, LuaType};
use crate::decoration::Decoration;
use crate::error::{Error, Result};
use crate::thread::Thread;
use crate::value::{Table, TableKey, Value};

/// Copy conversion between host tables and VM tables
#[derive(Debug, Default)]
pub struct TableExtension;

impl TableExtension {
    fn read_table(&self, thread: &Thread, index: c_int, seen: &mut Seen) -> Value {
        let state = thread.state();
        let index = thread.absolute_index(index);
        let address = unsafe { ffi::lua_topointer(state, index) } as usize;
        if let Some(table) = seen.read(address) {
            return Value::Table(table);
        }

        let table = Table::new();
        seen.record_read(address, table.clone());

        if unsafe { ffi::lua_checkstack(state, 3) } == 0 {
            tracing::warn!("VM stack exhausted while reading a table");
            return Value::Table(table);
        }

        let mut entries = Vec::new();
        unsafe {
            ffi::lua_pushnil(state);
            while ffi::lua_next(state, index) != 0 {
                let key = thread.get_value_with(-2, seen);
                match TableKey::from_value(&key) {
                    Some(key) => entries.push((key, thread.get_value_with(-1, seen))),
                    None => tracing::warn!(key = key.type_name(), "skipping table key without host representation"),
                }
                ffi::lua_pop(state, 1);
            }
        }
        table.fill(entries);
        Value::Table(table)
    }

    fn write_table(&self, thread: &Thread, table: &Table, seen: &mut Seen) -> Result<()> {
        let state = thread.state();
        if let Some(reference) = seen.written(table.identity()) {
            unsafe { ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, reference as ffi::lua_Integer) };
            return Ok(());
        }

        let entries = table.entries();
        let (sequence, record) = if table.is_sequence() {
            (entries.len(), 0)
        } else {
            (0, entries.len())
        };
        unsafe {
            if ffi::lua_checkstack(state, 4) == 0 {
                return Err(Error::Memory("VM stack exhausted while writing a table".to_string()));
            }
            binding::push_table(state, clamp(sequence), clamp(record))?;
            ffi::lua_pushvalue(state, -1);
            let reference = binding::reference_top(state)?;
            seen.record_written(table.identity(), reference);
        }

        let index = thread.absolute_index(-1);
        for (key, value) in entries {
            unsafe {
                match key {
                    TableKey::Integer(i) => ffi::lua_pushinteger(state, i),
                    TableKey::String(s) => binding::push_str(state, &s)?,
                    TableKey::Boolean(b) => ffi::lua_pushboolean(state, b as c_int),
                    TableKey::Float(n) => ffi::lua_pushnumber(state, n.get()),
                }
            }
            thread.push_value_with(&Decoration::new(value), seen)?;
            unsafe { binding::raw_set(state, index) }?;
        }
        Ok(())
    }
}

fn clamp(n: usize) -> c_int {
    n.min(c_int::MAX as usize) as c_int
}

impl TypeExtension for TableExtension {
    fn name(&self) -> &CStr {
        c"table"
    }

    fn is_type(&self, _thread: &Thread, _index: c_int, ty: LuaType, _metatable_name: Option<&str>) -> bool {
        ty == LuaType::Table
    }

    fn get_value(&self, thread: &Thread, index: c_int, seen: &mut Seen) -> Value {
        self.read_table(thread, index, seen)
    }

    fn push_value(&self, thread: &Thread, decoration: &Decoration, seen: &mut Seen) -> Result<bool> {
        let Value::Table(table) = &decoration.target else {
            return Ok(false);
        };
        self.write_table(thread, table, seen)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::global::Global;
    use crate::value::{Table, TableKey, Value};

    #[test]
    fn test_mapping_round_trip() {
        let global = Global::new(false).unwrap();
        let table = Table::from_pairs([("a", 1), ("b", 2)]);
        global.push_value(Value::Table(table.clone())).unwrap();
        let back = global.get_value(-1);
        global.pop(1);
        assert_eq!(back, Value::Table(table));
        assert!(!back.ptr_eq(&Value::Table(Table::new())));
    }

    #[test]
    fn test_sequence_round_trip() {
        let global = Global::new(false).unwrap();
        global.push_value(Value::from(vec!["x", "y", "z"])).unwrap();
        let back = global.get_value(-1);
        global.pop(1);
        let table = back.as_table().unwrap();
        assert!(table.is_sequence());
        assert_eq!(table.values(), vec![Value::from("x"), Value::from("y"), Value::from("z")]);
    }

    #[test]
    fn test_host_cycle_written_once() {
        let global = Global::new(false).unwrap();
        let table = Table::new();
        table.set("name", "a");
        table.set("self", Value::Table(table.clone()));
        global.set("t", Value::Table(table)).unwrap();

        global.load_string("return t.self == t and t.self.self.name").unwrap();
        let result = global.run_sync(0).unwrap();
        assert_eq!(result.into_first(), Value::from("a"));
    }

    #[test]
    fn test_vm_cycle_read_as_same_table() {
        let global = Global::new(false).unwrap();
        global.load_string("local t = {} t.self = t return t").unwrap();
        let values = global.run_sync(0).unwrap();
        let table = values.into_first();
        let inner = table.as_table().unwrap().get("self");
        assert!(inner.ptr_eq(&table));
    }

    #[test]
    fn test_boolean_and_float_keys_are_kept() {
        let global = Global::new(false).unwrap();
        global.load_string("return { [1.5] = 'half', [true] = 'yes', name = 'n' }").unwrap();
        let value = global.run_sync(0).unwrap().into_first();
        let table = value.as_table().unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(true), Value::from("yes"));
        assert_eq!(table.get(TableKey::from_value(&Value::Number(1.5)).unwrap()), Value::from("half"));

        global.set("copy", value.clone()).unwrap();
        global.load_string("return copy[1.5], copy[true], copy.name").unwrap();
        let values = global.run_sync(0).unwrap();
        assert_eq!(values.value(0), Value::from("half"));
        assert_eq!(values.value(1), Value::from("yes"));
        assert_eq!(values.value(2), Value::from("n"));
    }

    #[test]
    fn test_table_keys_are_skipped() {
        let global = Global::new(false).unwrap();
        global.load_string("return { [{}] = 'lost', kept = 1 }").unwrap();
        let value = global.run_sync(0).unwrap().into_first();
        let table = value.as_table().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("kept"), Value::Integer(1));
    }
}
