//! Engine facade
//!
//! [`Engine`] is the entry point most embedders use: it builds a [`Global`]
//! from [`EngineOptions`] and runs chunks on forked contexts, either through
//! the cooperative async loop or a single protected call.

use serde::{Deserialize, Serialize};
use std::ffi::c_int;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use crate::binding::{self, ffi};
use crate::error::{Error, Result};
use crate::extension::{NullExtension, ProxyExtension};
use crate::global::Global;
use crate::thread::{RunOptions, Thread};
use crate::value::{Function, MultiValue, Value};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Open every standard library
    pub open_standard_libs: bool,
    /// Register the `null` sentinel and the `null`/`new` globals
    pub inject_objects: bool,
    /// Expose host objects through live proxies
    pub enable_proxy: bool,
    /// Account allocations (implied by `memory_max`)
    pub trace_allocations: bool,
    /// Timeout for VM functions called from the host, in milliseconds
    pub function_timeout_ms: Option<u64>,
    /// Initial allocation ceiling in bytes
    pub memory_max: Option<usize>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            open_standard_libs: true,
            inject_objects: false,
            enable_proxy: true,
            trace_allocations: false,
            function_timeout_ms: None,
            memory_max: None,
        }
    }
}

/// Embedded VM with host value marshaling
pub struct Engine {
    global: Global,
    options: EngineOptions,
}

impl Engine {
    pub fn new() -> Result<Self> {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Result<Self> {
        let global = Global::new(options.trace_allocations || options.memory_max.is_some())?;
        global.set_function_timeout(options.function_timeout_ms.map(Duration::from_millis));

        if options.enable_proxy {
            global.register_type_extension(3, Rc::new(ProxyExtension::new(&global)?));
        }
        if options.inject_objects {
            global.register_type_extension(5, Rc::new(NullExtension::new(&global)?));
            inject_objects(&global)?;
        }
        if options.open_standard_libs {
            global.open_standard_libs()?;
        }
        if let Some(max) = options.memory_max {
            global.set_memory_max(Some(max))?;
        }

        tracing::debug!(?options, "engine ready");
        Ok(Self { global, options })
    }

    pub fn global(&self) -> &Global {
        &self.global
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Run `code` and return its first result.
    pub async fn do_string(&self, code: &str) -> Result<Value> {
        self.do_string_with(code, RunOptions::default()).await
    }

    pub async fn do_string_with(&self, code: &str, options: RunOptions) -> Result<Value> {
        self.call_byte_code(|thread| thread.load_string(code), options).await
    }

    /// Run the file at `path` and return its first result.
    pub async fn do_file(&self, path: impl AsRef<Path>) -> Result<Value> {
        self.do_file_with(path, RunOptions::default()).await
    }

    pub async fn do_file_with(&self, path: impl AsRef<Path>, options: RunOptions) -> Result<Value> {
        let path = path.as_ref();
        self.call_byte_code(|thread| thread.load_file(path), options).await
    }

    /// Run `code` in one protected call. Awaiting is not possible.
    pub fn do_string_sync(&self, code: &str) -> Result<Value> {
        self.do_string_sync_with(code, RunOptions::default())
    }

    pub fn do_string_sync_with(&self, code: &str, options: RunOptions) -> Result<Value> {
        self.call_byte_code_sync(|thread| thread.load_string(code), options)
    }

    pub fn do_file_sync(&self, path: impl AsRef<Path>) -> Result<Value> {
        self.do_file_sync_with(path, RunOptions::default())
    }

    pub fn do_file_sync_with(&self, path: impl AsRef<Path>, options: RunOptions) -> Result<Value> {
        let path = path.as_ref();
        self.call_byte_code_sync(|thread| thread.load_file(path), options)
    }

    /// Close the VM. Idempotent.
    pub fn close(&self) {
        self.global.close();
    }

    pub fn is_closed(&self) -> bool {
        self.global.is_closed()
    }

    async fn call_byte_code(&self, load: impl FnOnce(&Thread) -> Result<()>, options: RunOptions) -> Result<Value> {
        let (thread, anchor) = self.fork()?;
        let outcome = match load(&thread) {
            Ok(()) => thread.run(0, options).await.map(|_| self.take_results(&thread)),
            Err(err) => Err(err),
        };
        self.release(thread, anchor);
        outcome
    }

    fn call_byte_code_sync(&self, load: impl FnOnce(&Thread) -> Result<()>, options: RunOptions) -> Result<Value> {
        let (thread, anchor) = self.fork()?;
        if options.timeout.is_some() {
            thread.set_timeout(options.timeout);
        }
        let outcome = load(&thread).and_then(|()| thread.run_sync(0)).map(MultiValue::into_first);
        self.release(thread, anchor);
        outcome
    }

    /// New context anchored in the registry.
    fn fork(&self) -> Result<(Thread, c_int)> {
        let thread = self.global.new_thread()?;
        let anchor = match unsafe { binding::reference_top(self.global.state()) } {
            Ok(anchor) => anchor,
            Err(err) => {
                thread.close();
                return Err(err);
            }
        };
        Ok((thread, anchor))
    }

    /// Move the results of a finished run to the main context and read the first one.
    fn take_results(&self, thread: &Thread) -> Value {
        let count = thread.get_top();
        if count == 0 {
            return Value::Nil;
        }
        let global = self.global.state();
        unsafe {
            if ffi::lua_checkstack(global, count) == 0 {
                let first = thread.get_value(1);
                thread.set_top(0);
                return first;
            }
            ffi::lua_xmove(thread.state(), global, count);
        }
        let first = self.global.get_value(-count);
        self.global.pop(count);
        first
    }

    fn release(&self, thread: Thread, anchor: c_int) {
        thread.close();
        if !self.global.is_closed() {
            unsafe { ffi::luaL_unref(self.global.state(), ffi::LUA_REGISTRYINDEX, anchor) };
        }
    }
}

/// `null` and `new(constructor, ...)` globals.
fn inject_objects(global: &Global) -> Result<()> {
    global.set("null", Value::Null)?;
    global.set(
        "new",
        Function::wrap(|args: MultiValue| {
            let mut args = args.into_vec();
            if args.is_empty() {
                return Err(Error::callback("new expects a constructor"));
            }
            match args.remove(0) {
                Value::Object(constructor) => constructor.construct(MultiValue::from(args)),
                other => Err(Error::callback(format!(
                    "new expects a host object constructor, got {}",
                    other.type_name()
                ))),
            }
        }),
    )
}
