//! Opaque userdata
//!
//! Values the VM should carry around without looking inside. The metatable
//! only has the finalizer, so VM code can store and pass them back but not
//! index them.

use std::ffi::CStr;

use super::{install_metatable, push_reference, Seen, TypeExtension};
use crate::decoration::Decoration;
use crate::error::Result;
use crate::thread::Thread;
use crate::value::Value;

pub(crate) const USERDATA_METATABLE: &CStr = c"moonbridge.userdata";

/// Opaque pass-through for [`Value::Userdata`] and `reference`-decorated values
#[derive(Debug)]
pub struct UserdataExtension;

impl UserdataExtension {
    pub fn new(global: &Thread) -> Result<Self> {
        install_metatable(global, USERDATA_METATABLE, |_| Ok(()))?;
        Ok(Self)
    }
}

impl TypeExtension for UserdataExtension {
    fn name(&self) -> &CStr {
        USERDATA_METATABLE
    }

    fn push_value(&self, thread: &Thread, decoration: &Decoration, _seen: &mut Seen) -> Result<bool> {
        let target = &decoration.target;
        let accepted = match target {
            Value::Userdata(_) => true,
            _ => decoration.options.reference && target.identity().is_some(),
        };
        if !accepted {
            return Ok(false);
        }
        push_reference(thread, target.clone(), USERDATA_METATABLE)?;
        Ok(true)
    }
}
