//! Execution contexts
//!
//! A [`Thread`] is one VM stack (the main state or a coroutine) sharing the
//! instance's global state. It owns the value marshaler entry points, loading,
//! and the two run loops: [`Thread::run`] drives a coroutine cooperatively,
//! awaiting host promises between resumes, and [`Thread::run_sync`] performs
//! a single protected call.

use std::cell::Cell;
use std::ffi::{c_char, c_int, CStr, CString};
use std::fmt;
use std::path::Path;
use std::ptr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::binding::{self, ffi, Exit, LuaState, LuaType, Status, INSTRUCTION_HOOK_COUNT};
use crate::decoration::Decoration;
use crate::error::{Error, Result};
use crate::extension::function::raise_error;
use crate::extension::Seen;
use crate::instance::Instance;
use crate::value::{MultiValue, Pointer, Promise, Value};

/// Outcome of one `resume`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeResult {
    pub status: Status,
    /// Values yielded or returned, on top of the stack
    pub result_count: c_int,
}

/// Options of one asynchronous run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Deadline for this run only; the previous one is restored afterwards
    pub timeout: Option<Duration>,
}

struct ThreadInner {
    instance: Rc<Instance>,
    state: *mut LuaState,
    parent: Option<Thread>,
    closed: Cell<bool>,
}

/// One VM execution context
#[derive(Clone)]
pub struct Thread(Rc<ThreadInner>);

impl Thread {
    pub(crate) fn root(instance: Rc<Instance>) -> Self {
        let state = instance.state();
        Self::attached(instance, state)
    }

    /// View of `state` used by trampolines. Not anchored, no parent.
    pub(crate) fn attached(instance: Rc<Instance>, state: *mut LuaState) -> Self {
        Self(Rc::new(ThreadInner {
            instance,
            state,
            parent: None,
            closed: Cell::new(false),
        }))
    }

    pub(crate) fn instance(&self) -> &Rc<Instance> {
        &self.0.instance
    }

    /// Raw VM state.
    pub fn state(&self) -> *mut LuaState {
        self.0.state
    }

    /// Fork a coroutine. The new context is left on this context's stack;
    /// anchor it (or keep it there) for as long as it is used.
    pub fn new_thread(&self) -> Result<Thread> {
        self.ensure_open()?;
        let state = unsafe { binding::push_thread(self.state()) }?;
        Ok(Self(Rc::new(ThreadInner {
            instance: self.0.instance.clone(),
            state,
            parent: Some(self.clone()),
            closed: Cell::new(false),
        })))
    }

    /// Closed when this context, an ancestor, or the instance is closed.
    pub fn is_closed(&self) -> bool {
        self.0.closed.get()
            || self.0.instance.is_closed()
            || self.0.parent.as_ref().is_some_and(Thread::is_closed)
    }

    /// Close this context and, through `is_closed`, its descendants. Idempotent.
    pub fn close(&self) {
        if self.0.closed.replace(true) {
            return;
        }
        let instance = &self.0.instance;
        if !instance.is_closed() {
            instance.set_deadline(self.state(), None);
            instance.bridge().cancel(self.state());
            unsafe { ffi::lua_sethook(self.state(), None, 0, 0) };
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed());
        }
        Ok(())
    }

    /// Reset a finished or errored coroutine so it can run again.
    pub fn reset(&self) -> Result<()> {
        self.ensure_open()?;
        if self.is_main() {
            return Err(Error::programming("cannot reset the main thread"));
        }
        let status = Status::from_raw(unsafe { ffi::lua_closethread(self.state(), binding::no_state()) });
        if !status.is_success() {
            tracing::debug!(?status, "discarding the error of the previous run");
        }
        self.set_top(0);
        self.0.instance.bridge().cancel(self.state());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Compile `code` and push it as a function. The source doubles as chunk name.
    pub fn load_string(&self, code: &str) -> Result<()> {
        let name = binding::cstring(code).unwrap_or_else(|_| CString::from(c"=(load)"));
        self.load_buffer(code.as_bytes(), &name)
    }

    pub fn load_string_named(&self, code: &str, name: &str) -> Result<()> {
        let name = binding::cstring(name)?;
        self.load_buffer(code.as_bytes(), &name)
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_open()?;
        let path = binding::cstring(&path.as_ref().to_string_lossy())?;
        let status = Status::from_raw(unsafe { ffi::luaL_loadfilex(self.state(), path.as_ptr(), ptr::null()) });
        self.finish_load(status)
    }

    fn load_buffer(&self, code: &[u8], name: &CStr) -> Result<()> {
        self.ensure_open()?;
        let status = Status::from_raw(unsafe {
            ffi::luaL_loadbufferx(
                self.state(),
                code.as_ptr() as *const c_char,
                code.len(),
                name.as_ptr(),
                ptr::null(),
            )
        });
        self.finish_load(status)
    }

    fn finish_load(&self, status: Status) -> Result<()> {
        if let Err(err) = self.assert_ok(status) {
            self.pop(1);
            return Err(err);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Resume this coroutine with `arg_count` arguments from the stack.
    pub fn resume(&self, arg_count: c_int) -> Result<ResumeResult> {
        self.ensure_open()?;
        let mut result_count = 0;
        let raw = unsafe { ffi::lua_resume(self.state(), binding::no_state(), arg_count, &mut result_count) };
        Ok(ResumeResult {
            status: Status::from_raw(raw),
            result_count,
        })
    }

    /// Run the function on the stack to completion, awaiting host promises it
    /// yields. Results are returned and left on the stack; values below the
    /// function are not part of them.
    pub async fn run(&self, arg_count: c_int, options: RunOptions) -> Result<MultiValue> {
        self.ensure_open()?;
        let previous = self.timeout();
        if let Some(timeout) = options.timeout {
            self.set_timeout(Some(timeout));
        }
        let outcome = self.drive(arg_count).await;
        if options.timeout.is_some() && !self.is_closed() {
            self.set_deadline(previous);
        }
        outcome
    }

    async fn drive(&self, arg_count: c_int) -> Result<MultiValue> {
        let mut resumed = self.resume(arg_count)?;
        while resumed.status == Status::Yield {
            if self.timeout().is_some_and(|deadline| Instant::now() >= deadline) {
                self.pop(resumed.result_count);
                self.0.instance.bridge().cancel(self.state());
                return Err(Error::timeout());
            }

            let yielded = if resumed.result_count > 0 {
                self.get_value(-1)
            } else {
                Value::Nil
            };
            self.pop(resumed.result_count);
            match yielded {
                Value::Promise(promise) => self.wait(&promise).await?,
                _ => tokio::task::yield_now().await,
            }

            self.ensure_open()?;
            resumed = self.resume(0)?;
        }
        self.assert_ok(resumed.status)?;
        Ok(self.get_stack_values(self.get_top() - resumed.result_count))
    }

    async fn wait(&self, promise: &Promise) -> Result<()> {
        let Some(deadline) = self.timeout() else {
            let _ = promise.settled().await;
            return Ok(());
        };
        let deadline = tokio::time::Instant::from_std(deadline);
        match tokio::time::timeout_at(deadline, promise.settled()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                self.0.instance.bridge().cancel(self.state());
                Err(Error::timeout())
            }
        }
    }

    /// Protected call of the function below the top `arg_count` values. The
    /// stack returns to its base.
    pub fn run_sync(&self, arg_count: c_int) -> Result<MultiValue> {
        self.ensure_open()?;
        let base = self.get_top() - arg_count - 1;
        if base < 0 {
            return Err(Error::programming("not enough values on the stack for the call"));
        }
        let status = Status::from_raw(unsafe { ffi::lua_pcallk(self.state(), arg_count, ffi::LUA_MULTRET, 0, 0, None) });
        let outcome = self.assert_ok(status).map(|()| self.get_stack_values(base));
        self.set_top(base);
        outcome
    }

    /// Call the global function `name`.
    pub fn call(&self, name: &str, args: impl Into<MultiValue>) -> Result<MultiValue> {
        self.ensure_open()?;
        let name = binding::cstring(name)?;
        let top = self.get_top();
        unsafe { ffi::lua_getglobal(self.state(), name.as_ptr()) };
        let args = args.into();
        let count = args.len();
        for arg in args {
            if let Err(err) = self.push_value(arg) {
                self.set_top(top);
                return Err(err);
            }
        }
        let result = self.run_sync(count as c_int);
        self.set_top(top);
        result
    }

    // ------------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------------

    /// Deadline `timeout` from now, or none.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.set_deadline(timeout.map(|timeout| Instant::now() + timeout));
    }

    /// Install or remove the deadline and the instruction-count hook checking it.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        if self.is_closed() {
            return;
        }
        self.0.instance.set_deadline(self.state(), deadline);
        unsafe {
            match deadline {
                Some(_) => ffi::lua_sethook(self.state(), Some(timeout_hook), ffi::LUA_MASKCOUNT, INSTRUCTION_HOOK_COUNT),
                None => ffi::lua_sethook(self.state(), None, 0, 0),
            }
        }
    }

    /// Current deadline.
    pub fn timeout(&self) -> Option<Instant> {
        if self.is_closed() {
            return None;
        }
        self.0.instance.deadline(self.state())
    }

    // ------------------------------------------------------------------------
    // Stack
    // ------------------------------------------------------------------------

    pub fn get_top(&self) -> c_int {
        if self.is_closed() {
            return 0;
        }
        unsafe { ffi::lua_gettop(self.state()) }
    }

    pub fn set_top(&self, top: c_int) {
        if !self.is_closed() {
            unsafe { ffi::lua_settop(self.state(), top) };
        }
    }

    pub fn pop(&self, count: c_int) {
        if count > 0 && !self.is_closed() {
            unsafe { ffi::lua_pop(self.state(), count) };
        }
    }

    pub fn remove(&self, index: c_int) {
        if !self.is_closed() {
            unsafe { ffi::lua_remove(self.state(), index) };
        }
    }

    pub fn absolute_index(&self, index: c_int) -> c_int {
        if self.is_closed() {
            return index;
        }
        unsafe { ffi::lua_absindex(self.state(), index) }
    }

    /// Values above `start`, bottom first.
    pub fn get_stack_values(&self, start: c_int) -> MultiValue {
        let top = self.get_top();
        let mut seen = Seen::new();
        let mut values = MultiValue::with_capacity((top - start).max(0) as usize);
        for index in (start + 1)..=top {
            values.push(self.get_value_with(index, &mut seen));
        }
        values
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// `tostring` of the value at `index`, honouring `__tostring`.
    pub fn index_to_string(&self, index: c_int) -> String {
        if self.is_closed() {
            return String::new();
        }
        let state = self.state();
        unsafe {
            let index = ffi::lua_absindex(state, index);
            let mut len = 0usize;
            let data = ffi::luaL_tolstring(state, index, &mut len);
            let text = if data.is_null() {
                String::new()
            } else {
                String::from_utf8_lossy(std::slice::from_raw_parts(data as *const u8, len)).into_owned()
            };
            ffi::lua_pop(state, 1);
            text
        }
    }

    pub fn get_pointer(&self, index: c_int) -> Pointer {
        if self.is_closed() {
            return Pointer::new(0);
        }
        Pointer::new(unsafe { ffi::lua_topointer(self.state(), index) } as usize)
    }

    /// `__name` of the metatable of the value at `index`.
    pub fn get_metatable_name(&self, index: c_int) -> Option<String> {
        if self.is_closed() {
            return None;
        }
        unsafe { binding::metatable_name(self.state(), index) }
    }

    /// Attach `metatable` (a host table) to the table or userdata at `index`.
    pub fn set_metatable(&self, index: c_int, metatable: Value) -> Result<()> {
        let mut seen = Seen::new();
        let result = self.set_metatable_with(index, metatable, &mut seen);
        seen.release(self.state());
        result
    }

    fn set_metatable_with(&self, index: c_int, metatable: Value, seen: &mut Seen) -> Result<()> {
        self.ensure_open()?;
        let state = self.state();
        let index = self.absolute_index(index);
        let ty = unsafe { binding::type_of(state, index) };
        if !matches!(ty, LuaType::Table | LuaType::Userdata) {
            return Err(Error::programming(format!("cannot set a metatable on a {} value", ty.name())));
        }
        if !matches!(metatable, Value::Table(_)) {
            return Err(Error::programming("metatable must be a table"));
        }
        if unsafe { ffi::lua_getmetatable(state, index) } != 0 {
            self.pop(1);
            let name = self.get_metatable_name(index);
            return Err(Error::programming(format!(
                "data already has associated metatable: {}",
                name.as_deref().unwrap_or("unknown name")
            )));
        }
        self.push_value_with(&Decoration::new(metatable).proxy(false), seen)?;
        unsafe { ffi::lua_setmetatable(state, index) };
        Ok(())
    }

    /// Whether this is the instance's main context.
    pub fn is_main(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        unsafe {
            let main = ffi::lua_pushthread(self.state());
            ffi::lua_pop(self.state(), 1);
            main == 1
        }
    }

    pub fn is_yieldable(&self) -> bool {
        !self.is_closed() && unsafe { ffi::lua_isyieldable(self.state()) } != 0
    }

    // ------------------------------------------------------------------------
    // Marshaling
    // ------------------------------------------------------------------------

    /// Push one host value.
    pub fn push_value(&self, value: impl Into<Decoration>) -> Result<()> {
        let decoration = value.into();
        let mut seen = Seen::new();
        let result = self.push_value_with(&decoration, &mut seen);
        seen.release(self.state());
        result
    }

    /// Push one host value as part of a larger conversion sharing `seen`.
    pub fn push_value_with(&self, decoration: &Decoration, seen: &mut Seen) -> Result<()> {
        self.ensure_open()?;
        let state = self.state();
        let start = self.get_top();
        if unsafe { ffi::lua_checkstack(state, 2) } == 0 {
            return Err(Error::Memory("VM stack exhausted".to_string()));
        }

        let pushed = self.push_target(decoration, seen).and_then(|()| match &decoration.options.metatable {
            Some(metatable) => self.set_metatable_with(-1, metatable.clone(), seen),
            None => Ok(()),
        });
        if let Err(err) = pushed {
            self.set_top(start);
            return Err(err);
        }

        let grown = self.get_top() - start;
        if grown != 1 {
            self.set_top(start);
            return Err(Error::programming(format!(
                "pushing a {} must add exactly one stack value, added {}",
                decoration.target.type_name(),
                grown
            )));
        }
        Ok(())
    }

    fn push_target(&self, decoration: &Decoration, seen: &mut Seen) -> Result<()> {
        let state = self.state();
        match &decoration.target {
            Value::Nil => unsafe { ffi::lua_pushnil(state) },
            Value::Boolean(b) => unsafe { ffi::lua_pushboolean(state, *b as c_int) },
            Value::Integer(i) => unsafe { ffi::lua_pushinteger(state, *i) },
            Value::Number(n) => unsafe { ffi::lua_pushnumber(state, *n) },
            Value::String(s) => unsafe { binding::push_str(state, s) }?,
            Value::Pointer(p) => unsafe { ffi::lua_pushlightuserdata(state, p.address() as *mut _) },
            Value::Thread(thread) => self.push_thread(thread)?,
            target => {
                for extension in self.0.instance.extensions() {
                    if extension.push_value(self, decoration, seen)? {
                        return Ok(());
                    }
                }
                if matches!(target, Value::Null) {
                    unsafe { ffi::lua_pushnil(state) };
                    return Ok(());
                }
                return Err(Error::programming(format!(
                    "the type '{}' is not supported by the VM",
                    target.type_name()
                )));
            }
        }
        Ok(())
    }

    fn push_thread(&self, thread: &Thread) -> Result<()> {
        if !Rc::ptr_eq(&self.0.instance, &thread.0.instance) {
            return Err(Error::programming("cannot push a thread owned by another VM instance"));
        }
        if thread.is_closed() {
            return Err(Error::closed());
        }
        unsafe {
            if thread.state() == self.state() {
                ffi::lua_pushthread(self.state());
            } else {
                if ffi::lua_checkstack(thread.state(), 1) == 0 {
                    return Err(Error::Memory("VM stack exhausted".to_string()));
                }
                ffi::lua_pushthread(thread.state());
                ffi::lua_xmove(thread.state(), self.state(), 1);
            }
        }
        Ok(())
    }

    /// Read the value at `index`.
    pub fn get_value(&self, index: c_int) -> Value {
        let mut seen = Seen::new();
        self.get_value_with(index, &mut seen)
    }

    /// Read the value at `index` as part of a larger conversion sharing `seen`.
    pub fn get_value_with(&self, index: c_int, seen: &mut Seen) -> Value {
        if self.is_closed() {
            return Value::Nil;
        }
        let state = self.state();
        let index = self.absolute_index(index);
        let ty = unsafe { binding::type_of(state, index) };
        match ty {
            LuaType::None | LuaType::Nil => Value::Nil,
            LuaType::Boolean => Value::Boolean(unsafe { ffi::lua_toboolean(state, index) } != 0),
            LuaType::Number => unsafe {
                if ffi::lua_isinteger(state, index) != 0 {
                    Value::Integer(ffi::lua_tointeger(state, index))
                } else {
                    Value::Number(ffi::lua_tonumber(state, index))
                }
            },
            LuaType::String => Value::String(unsafe { binding::read_string(state, index) }.unwrap_or_default()),
            LuaType::LightUserdata => Value::Pointer(self.get_pointer(index)),
            LuaType::Thread => {
                let thread = unsafe { ffi::lua_tothread(state, index) };
                Value::Thread(Thread::attached(self.0.instance.clone(), thread))
            }
            LuaType::Table | LuaType::Function | LuaType::Userdata => {
                let name = match ty {
                    LuaType::Table | LuaType::Userdata => self.get_metatable_name(index),
                    _ => None,
                };
                for extension in self.0.instance.extensions() {
                    if extension.is_type(self, index, ty, name.as_deref()) {
                        return extension.get_value(self, index, seen);
                    }
                }
                tracing::warn!(
                    kind = ty.name(),
                    metatable = name.as_deref().unwrap_or("none"),
                    "value has no host representation, reading it as a pointer"
                );
                Value::Pointer(self.get_pointer(index))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------------

    /// Turn a failed status into an error built from the value on top of the
    /// stack. The value is left in place.
    pub fn assert_ok(&self, status: Status) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        let state = self.state();
        let fallback = format!("Lua Error({:?}/{})", status, status.code());
        let error = match status {
            Status::ErrorMem => {
                let message = unsafe {
                    match binding::type_of(state, -1) {
                        LuaType::String => binding::read_string(state, -1),
                        _ => None,
                    }
                };
                Error::Memory(message.unwrap_or(fallback))
            }
            Status::ErrorSyntax | Status::ErrorFile => Error::Syntax(self.error_message(fallback)),
            _ => match self.get_value(-1) {
                Value::Error(error) => error,
                _ => Error::Runtime(self.error_message(fallback)),
            },
        };
        Err(self.with_traceback(error))
    }

    fn error_message(&self, fallback: String) -> String {
        match unsafe { binding::type_of(self.state(), -1) } {
            LuaType::None | LuaType::Nil => fallback,
            _ => self.index_to_string(-1),
        }
    }

    fn with_traceback(&self, error: Error) -> Error {
        let Error::Runtime(message) = error else {
            return error;
        };
        match unsafe { binding::traceback(self.state()) } {
            Ok(Some(traceback)) if traceback.trim() != "stack traceback:" && !traceback.is_empty() => {
                Error::Runtime(format!("{}\n{}", message, traceback))
            }
            Ok(_) => Error::Runtime(message),
            Err(err) => {
                tracing::warn!(%err, "cannot build a traceback");
                Error::Runtime(message)
            }
        }
    }
}

/// Forks dropped without `close` still give back their deadline, pending
/// await and hook.
impl Drop for ThreadInner {
    fn drop(&mut self) {
        if self.parent.is_none() || self.closed.get() || self.instance.is_closed() {
            return;
        }
        self.instance.set_deadline(self.state, None);
        self.instance.bridge().cancel(self.state);
        unsafe { ffi::lua_sethook(self.state, None, 0, 0) };
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("state", &self.0.state)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Count hook raising a timeout error once the context's deadline passed.
unsafe extern "C-unwind" fn timeout_hook(state: *mut LuaState, _debug: *mut ffi::lua_Debug) {
    let expired = Instance::from_state(state)
        .and_then(|instance| instance.deadline(state))
        .is_some_and(|deadline| Instant::now() >= deadline);
    if !expired {
        return;
    }
    let exit = binding::guard(state, || match Instance::from_state(state) {
        Some(instance) => raise_error(&Thread::attached(instance, state), Error::timeout()),
        None => {
            binding::push_message(state, "thread timeout exceeded");
            Exit::Raise
        }
    });
    exit.finish(state);
}
