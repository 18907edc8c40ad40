//! Error values
//!
//! Host errors raised into the VM travel as userdata so they come back out
//! with their kind intact. VM code sees `err.message`, `err.kind` and a
//! `tostring` that yields the message.

use std::ffi::CStr;

use super::{install_metatable, push_reference, set_metafield, Seen, TypeExtension};
use crate::decoration::Decoration;
use crate::error::Result;
use crate::thread::Thread;
use crate::value::{Function, MultiValue, Value};

pub(crate) const ERROR_METATABLE: &CStr = c"moonbridge.error";

/// Converter for [`Value::Error`]
#[derive(Debug)]
pub struct ErrorExtension;

impl ErrorExtension {
    pub fn new(global: &Thread) -> Result<Self> {
        install_metatable(global, ERROR_METATABLE, |metatable| {
            let index = Function::wrap(|args: MultiValue| {
                let Value::Error(error) = args.value(0) else {
                    return Ok(Value::Nil);
                };
                Ok(match args.value(1).as_str() {
                    Some("message") => Value::from(error.message()),
                    Some("kind") => Value::from(error.kind()),
                    _ => Value::Nil,
                })
            });
            let tostring = Function::wrap(|args: MultiValue| {
                Ok(match args.value(0) {
                    Value::Error(error) => Value::from(error.message()),
                    other => Value::from(other.to_string()),
                })
            });
            set_metafield(global, metatable, c"__index", index)?;
            set_metafield(global, metatable, c"__tostring", tostring)
        })?;
        Ok(Self)
    }
}

impl TypeExtension for ErrorExtension {
    fn name(&self) -> &CStr {
        ERROR_METATABLE
    }

    fn push_value(&self, thread: &Thread, decoration: &Decoration, _seen: &mut Seen) -> Result<bool> {
        let Value::Error(error) = &decoration.target else {
            return Ok(false);
        };
        push_reference(thread, Value::Error(error.clone()), ERROR_METATABLE)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::binding::Library;
    use crate::error::Error;
    use crate::global::Global;
    use crate::value::Value;

    #[test]
    fn test_error_fields_visible_to_vm() {
        let global = Global::new(false).unwrap();
        global.load_library(Library::Base).unwrap();
        global.set("e", Value::Error(Error::callback("bad input"))).unwrap();
        global.load_string("return e.message, e.kind, tostring(e)").unwrap();
        let values = global.run_sync(0).unwrap();
        assert_eq!(values.value(0), Value::from("bad input"));
        assert_eq!(values.value(1), Value::from("CallbackError"));
        assert_eq!(values.value(2), Value::from("bad input"));
    }

    #[test]
    fn test_error_read_back_keeps_kind() {
        let global = Global::new(false).unwrap();
        global.set("e", Value::Error(Error::timeout())).unwrap();
        assert_eq!(global.get("e").unwrap(), Value::Error(Error::timeout()));
    }
}
