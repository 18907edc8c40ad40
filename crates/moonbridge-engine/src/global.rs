//! Global context
//!
//! [`Global`] owns a VM instance through its main execution context. It
//! registers the built-in type extensions, opens standard libraries and gives
//! access to globals and memory accounting. Dropping it closes the instance.

use std::ffi::c_int;
use std::ops::Deref;
use std::rc::Rc;
use std::time::Duration;

use crate::binding::{self, ffi, Library, LuaType};
use crate::decoration::Decoration;
use crate::error::{Error, Result};
use crate::extension::{ErrorExtension, FunctionExtension, PromiseExtension, TableExtension, TypeExtension, UserdataExtension};
use crate::instance::Instance;
use crate::thread::Thread;
use crate::value::Value;

/// Main execution context of a VM instance
pub struct Global {
    thread: Thread,
}

impl Global {
    /// Create a VM with the table, function, promise, error and userdata
    /// extensions. `trace_allocations` enables memory accounting.
    pub fn new(trace_allocations: bool) -> Result<Self> {
        let instance = Instance::create(trace_allocations)?;
        let global = Self {
            thread: Thread::root(instance),
        };
        // Tables and functions first: later extensions build metatables out of them.
        global.register_type_extension(0, Rc::new(TableExtension));
        global.register_type_extension(0, Rc::new(FunctionExtension::new(&global, None)?));
        global.register_type_extension(1, Rc::new(PromiseExtension::new(&global)?));
        global.register_type_extension(1, Rc::new(ErrorExtension::new(&global)?));
        global.register_type_extension(4, Rc::new(UserdataExtension::new(&global)?));
        Ok(global)
    }

    /// Add a converter. Higher priorities are tried first.
    pub fn register_type_extension(&self, priority: i32, extension: Rc<dyn TypeExtension>) {
        self.thread.instance().register_extension(priority, extension);
    }

    pub fn load_library(&self, library: Library) -> Result<()> {
        self.ensure_usable()?;
        unsafe { binding::open_library(self.state(), library) }
    }

    pub fn open_standard_libs(&self) -> Result<()> {
        self.ensure_usable()?;
        unsafe { binding::open_libraries(self.state()) }
    }

    /// Value of global `name`.
    pub fn get(&self, name: &str) -> Result<Value> {
        self.ensure_usable()?;
        let name = binding::cstring(name)?;
        unsafe { ffi::lua_getglobal(self.state(), name.as_ptr()) };
        let value = self.get_value(-1);
        self.pop(1);
        Ok(value)
    }

    /// Set global `name`.
    pub fn set(&self, name: &str, value: impl Into<Decoration>) -> Result<()> {
        self.ensure_usable()?;
        let name = binding::cstring(name)?;
        self.push_value(value)?;
        unsafe { binding::set_global(self.state(), &name) }
    }

    /// Run `callback` with the absolute stack index of global table `name`.
    /// The stack is restored afterwards.
    pub fn get_table<R>(&self, name: &str, callback: impl FnOnce(c_int) -> Result<R>) -> Result<R> {
        self.ensure_usable()?;
        let name = binding::cstring(name)?;
        let top = self.get_top();
        let ty = LuaType::from_raw(unsafe { ffi::lua_getglobal(self.state(), name.as_ptr()) });
        if ty != LuaType::Table {
            self.set_top(top);
            return Err(Error::programming(format!(
                "global '{}' is a {}, not a table",
                name.to_string_lossy(),
                ty.name()
            )));
        }
        let index = self.get_top();
        let result = callback(index);
        let after = self.get_top();
        if after != index {
            tracing::warn!(expected = index, found = after, "stack imbalance after table callback");
        }
        self.set_top(top);
        result
    }

    /// Timeout applied to VM functions called from the host.
    pub fn set_function_timeout(&self, timeout: Option<Duration>) {
        self.thread.instance().set_function_timeout(timeout);
    }

    pub fn memory_used(&self) -> Result<usize> {
        self.thread.instance().memory_used()
    }

    pub fn memory_max(&self) -> Result<Option<usize>> {
        self.thread.instance().memory_max()
    }

    /// Ceiling for traced allocations; allocations beyond it fail.
    pub fn set_memory_max(&self, max: Option<usize>) -> Result<()> {
        self.thread.instance().set_memory_max(max)
    }

    /// Close the VM instance. Idempotent.
    pub fn close(&self) {
        self.thread.close();
        self.thread.instance().close();
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed());
        }
        Ok(())
    }
}

impl Deref for Global {
    type Target = Thread;

    fn deref(&self) -> &Thread {
        &self.thread
    }
}

impl Drop for Global {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Function, MultiValue, Table};

    #[test]
    fn test_get_and_set_globals() {
        let global = Global::new(false).unwrap();
        global.set("answer", Value::Integer(42)).unwrap();
        assert_eq!(global.get("answer").unwrap(), Value::Integer(42));
        assert_eq!(global.get("missing").unwrap(), Value::Nil);
        assert_eq!(global.get_top(), 0);
    }

    #[test]
    fn test_libraries() {
        let global = Global::new(false).unwrap();
        assert_eq!(global.get("string").unwrap(), Value::Nil);
        global.load_library(Library::String).unwrap();
        global.load_library(Library::Base).unwrap();
        global.load_string("return string.upper('abc'), type(print)").unwrap();
        let values = global.run_sync(0).unwrap();
        assert_eq!(values.value(0), Value::from("ABC"));
        assert_eq!(values.value(1), Value::from("function"));
    }

    #[test]
    fn test_get_table_restores_stack() {
        let global = Global::new(false).unwrap();
        global.set("config", Table::from_pairs([("depth", 3)])).unwrap();
        let depth = global
            .get_table("config", |index| {
                unsafe { ffi::lua_getfield(global.state(), index, c"depth".as_ptr()) };
                Ok(global.get_value(-1))
            })
            .unwrap();
        assert_eq!(depth, Value::Integer(3));
        assert_eq!(global.get_top(), 0);
        assert!(matches!(global.get_table("missing", |_| Ok(())), Err(Error::Programming(_))));
    }

    #[test]
    fn test_memory_ceiling() {
        let global = Global::new(true).unwrap();
        global.open_standard_libs().unwrap();
        let used = global.memory_used().unwrap();
        assert!(used > 0);
        global.set_memory_max(Some(used + 64 * 1024)).unwrap();
        global
            .load_string("local t = {} for i = 1, 1e7 do t[i] = string.rep('x', 64) .. i end return #t")
            .unwrap();
        let err = global.run_sync(0).unwrap_err();
        assert!(matches!(err, Error::Memory(_)));
    }

    #[test]
    fn test_host_write_beyond_ceiling_fails_cleanly() {
        let global = Global::new(true).unwrap();
        let used = global.memory_used().unwrap();
        global.set_memory_max(Some(used + 4096)).unwrap();
        let top = global.get_top();

        let err = global.set("big", Value::from("x".repeat(1 << 20))).unwrap_err();
        assert!(matches!(err, Error::Memory(_)));
        assert_eq!(global.get_top(), top);

        let big = Table::from_pairs([("payload", "y".repeat(1 << 20))]);
        let err = global.set("big", Value::Table(big)).unwrap_err();
        assert!(matches!(err, Error::Memory(_)));
        assert_eq!(global.get_top(), top);

        global.set_memory_max(None).unwrap();
        global.set("small", Value::from("fits")).unwrap();
        assert_eq!(global.get("small").unwrap(), Value::from("fits"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let global = Global::new(false).unwrap();
        global.set("f", Function::wrap(|_: MultiValue| Ok(()))).unwrap();
        global.close();
        assert!(global.is_closed());
        assert!(matches!(global.get("f"), Err(Error::Programming(_))));
        global.close();
    }
}
