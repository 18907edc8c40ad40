//! Null sentinel
//!
//! One userdata per instance stands for [`Value::Null`], so VM code can tell
//! an explicit null apart from a missing value. It is anchored in the registry
//! for the lifetime of the instance.

use std::cell::Cell;
use std::ffi::{c_int, CStr};

use super::{set_metafield, Seen, TypeExtension};
use crate::binding::{self, ffi, PROTECTED_METATABLE};
use crate::decoration::Decoration;
use crate::error::Result;
use crate::thread::Thread;
use crate::value::{Function, Value};

pub(crate) const NULL_METATABLE: &CStr = c"moonbridge.null";

/// Converter for [`Value::Null`]
#[derive(Debug)]
pub struct NullExtension {
    sentinel: Cell<c_int>,
}

impl NullExtension {
    pub fn new(global: &Thread) -> Result<Self> {
        let state = global.state();
        let top = global.get_top();
        let result = (|| -> Result<c_int> {
            unsafe {
                if binding::new_metatable(state, NULL_METATABLE)? {
                    binding::push_str(state, PROTECTED_METATABLE)?;
                    binding::set_field(state, -2, c"__metatable")?;
                    set_metafield(global, -1, c"__tostring", Function::wrap(|_| Ok(Value::from("null"))))?;
                }
                binding::push_userdata(state)?;
                ffi::lua_rotate(state, -2, 1);
                ffi::lua_setmetatable(state, -2);
                binding::reference_top(state)
            }
        })();
        global.set_top(top);
        Ok(Self {
            sentinel: Cell::new(result?),
        })
    }
}

impl TypeExtension for NullExtension {
    fn name(&self) -> &CStr {
        NULL_METATABLE
    }

    fn get_value(&self, _thread: &Thread, _index: c_int, _seen: &mut Seen) -> Value {
        Value::Null
    }

    fn push_value(&self, thread: &Thread, decoration: &Decoration, _seen: &mut Seen) -> Result<bool> {
        if !matches!(decoration.target, Value::Null) {
            return Ok(false);
        }
        unsafe {
            ffi::lua_rawgeti(
                thread.state(),
                ffi::LUA_REGISTRYINDEX,
                self.sentinel.get() as ffi::lua_Integer,
            )
        };
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::Global;
    use std::rc::Rc;

    #[test]
    fn test_null_round_trip() {
        let global = Global::new(false).unwrap();
        global.load_library(crate::binding::Library::Base).unwrap();
        let null = NullExtension::new(&global).unwrap();
        global.register_type_extension(5, Rc::new(null));
        global.set("nothing", Value::Null).unwrap();
        global.load_string("return nothing ~= nil, tostring(nothing), nothing").unwrap();
        let values = global.run_sync(0).unwrap();
        assert_eq!(values.value(0), Value::Boolean(true));
        assert_eq!(values.value(1), Value::from("null"));
        assert_eq!(values.value(2), Value::Null);
    }

    #[test]
    fn test_null_without_extension_is_nil() {
        let global = Global::new(false).unwrap();
        global.set("nothing", Value::Null).unwrap();
        assert_eq!(global.get("nothing").unwrap(), Value::Nil);
    }
}
