//! Type extensions
//!
//! The marshaler in [`Thread`] handles primitives itself and delegates every
//! other value to the registered [`TypeExtension`]s, highest priority first.
//! Built-in extensions cover tables, functions, promises, errors, proxies,
//! opaque userdata and the null sentinel; embedders can register their own
//! through [`Global::register_type_extension`](crate::Global::register_type_extension).
//!
//! Host values exposed by reference are stored in the instance's reference
//! table and pushed as a full userdata holding the handle. The userdata's
//! metatable carries a `__gc` finalizer that releases the handle.

pub(crate) mod error;
pub(crate) mod function;
pub(crate) mod null;
pub(crate) mod promise;
pub(crate) mod proxy;
pub(crate) mod table;
pub(crate) mod userdata;

use rustc_hash::FxHashMap;
use std::ffi::{c_int, CStr};

use crate::binding::{self, ffi, Exit, LuaState, LuaType};
use crate::decoration::Decoration;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::reference::Handle;
use crate::thread::Thread;
use crate::value::{Table, Value};

pub use error::ErrorExtension;
pub use function::FunctionExtension;
pub use null::NullExtension;
pub use promise::PromiseExtension;
pub use proxy::ProxyExtension;
pub use table::TableExtension;
pub use userdata::UserdataExtension;

/// Pluggable bidirectional converter
pub trait TypeExtension {
    /// Metatable name of the values this extension creates.
    fn name(&self) -> &CStr;

    /// Whether the value at `index` belongs to this extension.
    ///
    /// `metatable_name` is the `__name` of the value's metatable, looked up once
    /// for tables and userdata.
    fn is_type(&self, thread: &Thread, index: c_int, ty: LuaType, metatable_name: Option<&str>) -> bool {
        let _ = (thread, index);
        ty == LuaType::Userdata && metatable_name.is_some_and(|name| name.as_bytes() == self.name().to_bytes())
    }

    /// Read the value at `index`. Only called after `is_type` accepted it.
    fn get_value(&self, thread: &Thread, index: c_int, seen: &mut Seen) -> Value {
        let _ = seen;
        read_reference(thread, index, self.name()).unwrap_or_default()
    }

    /// Push `decoration` if this extension handles it. Returns `false` to let
    /// the next extension try. Must push exactly one value when accepting.
    fn push_value(&self, thread: &Thread, decoration: &Decoration, seen: &mut Seen) -> Result<bool>;

    /// Release VM resources. Called once when the instance closes.
    fn close(&self) {}
}

/// Identity maps breaking cycles during one top-level conversion
#[derive(Default)]
pub struct Seen {
    /// Host table identity to registry reference of the VM table built for it
    written: FxHashMap<usize, c_int>,
    /// VM table address to the host table built for it
    read: FxHashMap<usize, Table>,
}

impl Seen {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn written(&self, identity: usize) -> Option<c_int> {
        self.written.get(&identity).copied()
    }

    pub(crate) fn record_written(&mut self, identity: usize, reference: c_int) {
        self.written.insert(identity, reference);
    }

    pub(crate) fn read(&self, address: usize) -> Option<Table> {
        self.read.get(&address).cloned()
    }

    pub(crate) fn record_read(&mut self, address: usize, table: Table) {
        self.read.insert(address, table);
    }

    /// Release the registry references taken while writing.
    pub(crate) fn release(self, state: *mut LuaState) {
        if state.is_null() {
            return;
        }
        for (_, reference) in self.written {
            unsafe { ffi::luaL_unref(state, ffi::LUA_REGISTRYINDEX, reference) };
        }
    }
}

/// Push `value` by reference as a userdata carrying metatable `name`.
pub fn push_reference(thread: &Thread, value: Value, name: &CStr) -> Result<()> {
    let instance = thread.instance();
    let state = thread.state();
    let handle = instance.reference(value);
    unsafe {
        if let Err(err) = binding::push_handle(state, handle) {
            instance.unreference(handle);
            return Err(err);
        }
        if ffi::lua_getfield(state, ffi::LUA_REGISTRYINDEX, name.as_ptr()) == ffi::LUA_TNIL {
            ffi::lua_pop(state, 2);
            instance.unreference(handle);
            return Err(Error::programming(format!(
                "metatable not found: {}",
                name.to_string_lossy()
            )));
        }
        ffi::lua_setmetatable(state, -2);
    }
    Ok(())
}

/// Host value behind the handle userdata at `index`.
pub fn read_reference(thread: &Thread, index: c_int, name: &CStr) -> Option<Value> {
    let handle = unsafe { binding::read_handle(thread.state(), index, name) }?;
    thread.instance().get_reference(handle)
}

/// Create metatable `name` (protected, with the handle finalizer) and let
/// `fill` add fields to it. Nothing happens when it already exists. The stack
/// is left as it was.
pub fn install_metatable(
    thread: &Thread,
    name: &CStr,
    fill: impl FnOnce(c_int) -> Result<()>,
) -> Result<()> {
    let state = thread.state();
    let top = thread.get_top();
    let result = unsafe {
        match binding::new_handle_metatable(state, name) {
            Ok(true) => fill(ffi::lua_absindex(state, -1)),
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        }
    };
    thread.set_top(top);
    result
}

/// `metatable[field] = value` for the metatable at `index`.
pub fn set_metafield(thread: &Thread, index: c_int, field: &CStr, value: impl Into<Decoration>) -> Result<()> {
    let index = thread.absolute_index(index);
    thread.push_value(value)?;
    unsafe { binding::set_field(thread.state(), index, field) }
}

/// `__gc` trampoline of handle userdata.
pub(crate) unsafe extern "C-unwind" fn release_handle(state: *mut LuaState) -> c_int {
    let exit = binding::guard(state, || {
        let block = ffi::lua_touserdata(state, 1) as *const u32;
        if block.is_null() {
            return Exit::Return(0);
        }
        let handle = Handle::new(block.read_unaligned());
        if let (Some(handle), Some(instance)) = (handle, Instance::from_state(state)) {
            instance.unreference(handle);
        }
        Exit::Return(0)
    });
    exit.finish(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::Global;
    use crate::value::Userdata;

    #[test]
    fn test_push_reference_requires_metatable() {
        let global = Global::new(false).unwrap();
        let top = global.get_top();
        let live = global.instance().with_references(|refs| refs.len());
        let err = push_reference(&global, Value::Userdata(Userdata::new(1u8)), c"missing.metatable").unwrap_err();
        assert!(err.message().contains("metatable not found"));
        assert_eq!(global.get_top(), top);
        assert_eq!(global.instance().with_references(|refs| refs.len()), live);
    }

    #[test]
    fn test_finalizer_releases_handle() {
        let global = Global::new(false).unwrap();
        let data = Value::Userdata(Userdata::new("payload"));
        global.push_value(data.clone()).unwrap();
        let handle = global.instance().with_references(|refs| refs.handle_of(&data)).unwrap();
        assert_eq!(global.instance().with_references(|refs| refs.ref_count(handle)), 1);

        global.pop(1);
        unsafe { ffi::lua_gc(global.state(), ffi::LUA_GCCOLLECT, 0) };
        assert_eq!(global.instance().with_references(|refs| refs.ref_count(handle)), 0);
    }

    #[test]
    fn test_install_metatable_restores_stack() {
        let global = Global::new(false).unwrap();
        let top = global.get_top();
        install_metatable(&global, c"test.meta", |index| {
            set_metafield(&global, index, c"answer", Value::Integer(42))
        })
        .unwrap();
        assert_eq!(global.get_top(), top);
    }
}
