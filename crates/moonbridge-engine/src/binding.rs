//! Low-level binding over the Lua 5.4 C API
//!
//! Thin typed wrappers over the raw entry points exported by `mlua-sys`.
//! Everything that encodes a host string for the VM goes through an owned
//! buffer (`CString` or a length-delimited push) so the buffer is released on
//! every exit path, error paths included.
//!
//! Functions in this module are `unsafe`: callers guarantee that `state` points
//! to a live `lua_State` and that stack indices are valid.

use std::cell::Cell;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

pub use mlua_sys as ffi;

use crate::error::{Error, Result};
use crate::reference::Handle;

/// Raw VM state pointer.
pub type LuaState = ffi::lua_State;

/// Instructions executed between two timeout checks.
pub const INSTRUCTION_HOOK_COUNT: c_int = 1000;

/// Value stored in `__metatable` so scripts cannot replace bridge metatables.
pub(crate) const PROTECTED_METATABLE: &str = "protected metatable";

// ============================================================================
// Type tags and status codes
// ============================================================================

/// Foreign value type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaType {
    /// Invalid (non-existent) stack index
    None,
    Nil,
    Boolean,
    LightUserdata,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Thread,
}

impl LuaType {
    /// Convert a raw `LUA_T*` tag.
    pub fn from_raw(raw: c_int) -> Self {
        match raw {
            ffi::LUA_TNIL => LuaType::Nil,
            ffi::LUA_TBOOLEAN => LuaType::Boolean,
            ffi::LUA_TLIGHTUSERDATA => LuaType::LightUserdata,
            ffi::LUA_TNUMBER => LuaType::Number,
            ffi::LUA_TSTRING => LuaType::String,
            ffi::LUA_TTABLE => LuaType::Table,
            ffi::LUA_TFUNCTION => LuaType::Function,
            ffi::LUA_TUSERDATA => LuaType::Userdata,
            ffi::LUA_TTHREAD => LuaType::Thread,
            _ => LuaType::None,
        }
    }

    /// Name as reported by the VM's `type()` function.
    pub fn name(self) -> &'static str {
        match self {
            LuaType::None => "no value",
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::LightUserdata | LuaType::Userdata => "userdata",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::Thread => "thread",
        }
    }
}

/// Return code of load/call/resume operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Yield,
    ErrorRun,
    ErrorSyntax,
    ErrorMem,
    ErrorErr,
    ErrorFile,
}

impl Status {
    /// Convert a raw status code. Unknown codes are treated as runtime errors.
    pub fn from_raw(raw: c_int) -> Self {
        match raw {
            ffi::LUA_OK => Status::Ok,
            ffi::LUA_YIELD => Status::Yield,
            ffi::LUA_ERRSYNTAX => Status::ErrorSyntax,
            ffi::LUA_ERRMEM => Status::ErrorMem,
            ffi::LUA_ERRERR => Status::ErrorErr,
            ffi::LUA_ERRFILE => Status::ErrorFile,
            _ => Status::ErrorRun,
        }
    }

    /// Raw status code.
    pub fn code(self) -> c_int {
        match self {
            Status::Ok => ffi::LUA_OK,
            Status::Yield => ffi::LUA_YIELD,
            Status::ErrorRun => ffi::LUA_ERRRUN,
            Status::ErrorSyntax => ffi::LUA_ERRSYNTAX,
            Status::ErrorMem => ffi::LUA_ERRMEM,
            Status::ErrorErr => ffi::LUA_ERRERR,
            Status::ErrorFile => ffi::LUA_ERRFILE,
        }
    }

    /// `true` for `Ok` and `Yield`.
    pub fn is_success(self) -> bool {
        matches!(self, Status::Ok | Status::Yield)
    }
}

// ============================================================================
// Standard libraries
// ============================================================================

/// Standard library that can be opened in a global context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Library {
    Base,
    Coroutine,
    Table,
    Io,
    Os,
    String,
    Utf8,
    Math,
    Debug,
    Package,
}

impl Library {
    /// Every library, in the order `luaL_openlibs` opens them.
    pub const ALL: [Library; 10] = [
        Library::Base,
        Library::Package,
        Library::Coroutine,
        Library::Table,
        Library::Io,
        Library::Os,
        Library::String,
        Library::Math,
        Library::Utf8,
        Library::Debug,
    ];

    /// Global name the library is registered under.
    pub fn module_name(self) -> &'static CStr {
        match self {
            Library::Base => c"_G",
            Library::Coroutine => c"coroutine",
            Library::Table => c"table",
            Library::Io => c"io",
            Library::Os => c"os",
            Library::String => c"string",
            Library::Utf8 => c"utf8",
            Library::Math => c"math",
            Library::Debug => c"debug",
            Library::Package => c"package",
        }
    }

    fn opener(self) -> ffi::lua_CFunction {
        match self {
            Library::Base => ffi::luaopen_base,
            Library::Coroutine => ffi::luaopen_coroutine,
            Library::Table => ffi::luaopen_table,
            Library::Io => ffi::luaopen_io,
            Library::Os => ffi::luaopen_os,
            Library::String => ffi::luaopen_string,
            Library::Utf8 => ffi::luaopen_utf8,
            Library::Math => ffi::luaopen_math,
            Library::Debug => ffi::luaopen_debug,
            Library::Package => ffi::luaopen_package,
        }
    }

    /// Parse a library name (`"base"`, `"string"`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "base" | "_G" => Some(Library::Base),
            "coroutine" => Some(Library::Coroutine),
            "table" => Some(Library::Table),
            "io" => Some(Library::Io),
            "os" => Some(Library::Os),
            "string" => Some(Library::String),
            "utf8" => Some(Library::Utf8),
            "math" => Some(Library::Math),
            "debug" => Some(Library::Debug),
            "package" => Some(Library::Package),
            _ => None,
        }
    }
}

/// Open one library and register it as a global.
pub(crate) unsafe fn open_library(state: *mut LuaState, library: Library) -> Result<()> {
    let name = library.module_name();
    let opener = library.opener();
    protect(state, 0, 0, |state| {
        ffi::luaL_requiref(state, name.as_ptr(), opener, 1);
        ffi::lua_pop(state, 1);
    })
}

/// Open every standard library.
pub(crate) unsafe fn open_libraries(state: *mut LuaState) -> Result<()> {
    protect(state, 0, 0, |state| ffi::luaL_openlibs(state))
}

// ============================================================================
// Protected calls
// ============================================================================

unsafe extern "C-unwind" fn protected_body<F: Fn(*mut LuaState)>(state: *mut LuaState) -> c_int {
    let body = ffi::lua_touserdata(state, 1) as *const F;
    ffi::lua_remove(state, 1);
    (*body)(state);
    ffi::lua_gettop(state)
}

/// Run `body` in a protected frame holding the top `nargs` values and keep
/// `nresults` of what it leaves. On failure the error value is on top.
unsafe fn call_protected<F: Fn(*mut LuaState)>(state: *mut LuaState, nargs: c_int, nresults: c_int, body: &F) -> Status {
    if ffi::lua_status(state) != ffi::LUA_OK {
        // Suspended and failed contexts cannot host a call.
        let base = ffi::lua_gettop(state) - nargs;
        body(state);
        ffi::lua_settop(state, base + nresults);
        return Status::Ok;
    }
    ffi::lua_pushcclosure(state, protected_body::<F>, 0);
    ffi::lua_pushlightuserdata(state, body as *const F as *mut c_void);
    ffi::lua_rotate(state, -(nargs + 2), 2);
    Status::from_raw(ffi::lua_pcallk(state, nargs + 1, nresults, 0, 0, None))
}

/// Run an allocating VM operation so that allocation failures and raised
/// errors come back as `Err` instead of unwinding through the host.
///
/// `body` sees the top `nargs` values as its whole stack and must address
/// them with negative indices. `nresults` values are left on top on success;
/// on failure the arguments are consumed and nothing is left. `body` must not
/// own values with destructors: an error leaves its frame with a long jump.
pub(crate) unsafe fn protect<F: Fn(*mut LuaState)>(
    state: *mut LuaState,
    nargs: c_int,
    nresults: c_int,
    body: F,
) -> Result<()> {
    if ffi::lua_checkstack(state, 2) == 0 {
        ffi::lua_pop(state, nargs);
        return Err(Error::Memory("VM stack exhausted".to_string()));
    }
    let status = call_protected(state, nargs, nresults, &body);
    if status == Status::Ok {
        return Ok(());
    }
    let message = match type_of(state, -1) {
        LuaType::String => read_string(state, -1),
        _ => None,
    }
    .unwrap_or_else(|| format!("Lua Error({:?}/{})", status, status.code()));
    ffi::lua_pop(state, 1);
    Err(match status {
        Status::ErrorMem => Error::Memory(message),
        _ => Error::Runtime(message),
    })
}

/// Pop the top value into a registry reference.
pub(crate) unsafe fn reference_top(state: *mut LuaState) -> Result<c_int> {
    let reference = Cell::new(ffi::LUA_NOREF);
    protect(state, 1, 0, |state| reference.set(ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX)))?;
    Ok(reference.get())
}

/// Push a new table with preallocated slots.
pub(crate) unsafe fn push_table(state: *mut LuaState, sequence: c_int, record: c_int) -> Result<()> {
    protect(state, 0, 1, |state| ffi::lua_createtable(state, sequence, record))
}

/// Push a C closure capturing the top `upvalues` values.
pub(crate) unsafe fn push_closure(state: *mut LuaState, function: ffi::lua_CFunction, upvalues: c_int) -> Result<()> {
    protect(state, upvalues, 1, |state| ffi::lua_pushcclosure(state, function, upvalues))
}

/// Push a new coroutine and return its state.
pub(crate) unsafe fn push_thread(state: *mut LuaState) -> Result<*mut LuaState> {
    protect(state, 0, 1, |state| {
        ffi::lua_newthread(state);
    })?;
    Ok(ffi::lua_tothread(state, -1))
}

/// `table[key] = value` without metamethods. Key and value are on top and
/// are popped; the table is at `index`.
pub(crate) unsafe fn raw_set(state: *mut LuaState, index: c_int) -> Result<()> {
    let index = ffi::lua_absindex(state, index);
    if ffi::lua_checkstack(state, 1) == 0 {
        ffi::lua_pop(state, 2);
        return Err(Error::Memory("VM stack exhausted".to_string()));
    }
    ffi::lua_pushvalue(state, index);
    ffi::lua_rotate(state, -3, 1);
    protect(state, 3, 0, |state| ffi::lua_rawset(state, -3))
}

/// Traceback of `state`'s call stack, skipping the running function.
pub(crate) unsafe fn traceback(state: *mut LuaState) -> Result<Option<String>> {
    let suspended = ffi::lua_status(state) != ffi::LUA_OK;
    // A protected call adds its own frame on top.
    let level = if suspended { 1 } else { 2 };
    protect(state, 0, 1, |state| ffi::luaL_traceback(state, state, ptr::null(), level))?;
    let text = read_string(state, -1);
    ffi::lua_pop(state, 1);
    Ok(text)
}

/// Pop the top value into global `name`.
pub(crate) unsafe fn set_global(state: *mut LuaState, name: &CStr) -> Result<()> {
    protect(state, 1, 0, |state| ffi::lua_setglobal(state, name.as_ptr()))
}

// ============================================================================
// Strings
// ============================================================================

/// Encode a name for a NUL-terminated entry point.
pub(crate) fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::programming(format!("name contains a NUL byte: {:?}", s)))
}

/// Push a length-delimited string (interior NUL bytes allowed).
pub(crate) unsafe fn push_str(state: *mut LuaState, s: &str) -> Result<()> {
    protect(state, 0, 1, |state| {
        ffi::lua_pushlstring(state, s.as_ptr() as *const c_char, s.len());
    })
}

/// Push an error message for a trampoline to raise. Always pushes one value:
/// when the message cannot be allocated, the VM's memory error stands in.
pub(crate) unsafe fn push_message(state: *mut LuaState, message: &str) {
    call_protected(state, 0, 1, &|state: *mut LuaState| {
        ffi::lua_pushlstring(state, message.as_ptr() as *const c_char, message.len());
    });
}

/// Read the string at `index`.
///
/// Only call on values whose type is `string`: the VM converts numbers in place.
pub(crate) unsafe fn read_string(state: *mut LuaState, index: c_int) -> Option<String> {
    let mut len = 0usize;
    let data = ffi::lua_tolstring(state, index, &mut len);
    if data.is_null() {
        return None;
    }
    let bytes = std::slice::from_raw_parts(data as *const u8, len);
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Type tag of the value at `index`.
pub(crate) unsafe fn type_of(state: *mut LuaState, index: c_int) -> LuaType {
    LuaType::from_raw(ffi::lua_type(state, index))
}

/// `__name` field of the value's metatable, if it is a string.
pub(crate) unsafe fn metatable_name(state: *mut LuaState, index: c_int) -> Option<String> {
    let field_type = ffi::luaL_getmetafield(state, index, c"__name".as_ptr());
    if field_type == ffi::LUA_TNIL {
        return None;
    }
    let name = if field_type == ffi::LUA_TSTRING {
        read_string(state, -1)
    } else {
        None
    };
    ffi::lua_pop(state, 1);
    name
}

/// Set `table[name] = <top of stack>`, popping the value. The table is at `index`.
pub(crate) unsafe fn set_field(state: *mut LuaState, index: c_int, name: &CStr) -> Result<()> {
    let index = ffi::lua_absindex(state, index);
    if let Err(err) = protect(state, 0, 1, |state| {
        ffi::lua_pushstring(state, name.as_ptr());
    }) {
        ffi::lua_pop(state, 1);
        return Err(err);
    }
    ffi::lua_rotate(state, -2, 1);
    raw_set(state, index)
}

// ============================================================================
// Handle userdata
// ============================================================================

/// Push a full userdata holding `handle`. No metatable is attached.
pub(crate) unsafe fn push_handle(state: *mut LuaState, handle: Handle) -> Result<()> {
    let value = handle.get();
    protect(state, 0, 1, |state| {
        let block = ffi::lua_newuserdatauv(state, mem::size_of::<u32>(), 0) as *mut u32;
        block.write_unaligned(value);
    })
}

/// Push an empty full userdata.
pub(crate) unsafe fn push_userdata(state: *mut LuaState) -> Result<()> {
    protect(state, 0, 1, |state| {
        ffi::lua_newuserdatauv(state, 0, 0);
    })
}

/// Read the handle stored in a userdata carrying metatable `name`.
pub(crate) unsafe fn read_handle(state: *mut LuaState, index: c_int, name: &CStr) -> Option<Handle> {
    let block = ffi::luaL_testudata(state, index, name.as_ptr()) as *const u32;
    if block.is_null() {
        return None;
    }
    Handle::new(block.read_unaligned())
}

/// Install (or fetch) the metatable `name` and leave it on the stack.
///
/// Returns `true` when the metatable was created by this call. New metatables
/// are protected and carry a `__gc` finalizer releasing the stored handle.
/// On error nothing is left on the stack.
pub(crate) unsafe fn new_handle_metatable(state: *mut LuaState, name: &CStr) -> Result<bool> {
    if !new_metatable(state, name)? {
        return Ok(false);
    }
    let fields = push_str(state, PROTECTED_METATABLE)
        .and_then(|()| set_field(state, -2, c"__metatable"))
        .and_then(|()| {
            ffi::lua_pushcclosure(state, crate::extension::release_handle, 0);
            set_field(state, -2, c"__gc")
        });
    if let Err(err) = fields {
        ffi::lua_pop(state, 1);
        return Err(err);
    }
    Ok(true)
}

/// `luaL_newmetatable`: push the registry metatable `name`, creating it when
/// missing. Returns `true` when it was created.
pub(crate) unsafe fn new_metatable(state: *mut LuaState, name: &CStr) -> Result<bool> {
    let created = Cell::new(false);
    protect(state, 0, 1, |state| created.set(ffi::luaL_newmetatable(state, name.as_ptr()) != 0))?;
    Ok(created.get())
}

// ============================================================================
// Instance registry slot
// ============================================================================

static INSTANCE_KEY: u8 = 0;

fn instance_key() -> *const c_void {
    &INSTANCE_KEY as *const u8 as *const c_void
}

/// Store the instance pointer in the VM registry (null detaches it).
pub(crate) unsafe fn set_instance_pointer(state: *mut LuaState, pointer: *const c_void) {
    if pointer.is_null() {
        ffi::lua_pushnil(state);
    } else {
        ffi::lua_pushlightuserdata(state, pointer as *mut c_void);
    }
    ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, instance_key());
}

/// Instance pointer stored in the VM registry, null when detached.
pub(crate) unsafe fn instance_pointer(state: *mut LuaState) -> *const c_void {
    ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, instance_key());
    let pointer = ffi::lua_touserdata(state, -1);
    ffi::lua_pop(state, 1);
    pointer as *const c_void
}

// ============================================================================
// Trampoline exits
// ============================================================================

/// How a trampoline hands control back to the VM.
///
/// Trampolines compute an `Exit` with every host value already dropped, then
/// call [`Exit::finish`] as their last action: raising and yielding unwind the
/// native frame with a long jump.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Exit {
    /// Return `n` values from the top of the stack
    Return(c_int),
    /// Raise the value on top of the stack
    Raise,
    /// Yield `count` values, resuming in `continuation` if present
    Yield {
        count: c_int,
        continuation: Option<ffi::lua_KFunction>,
    },
}

impl Exit {
    pub(crate) unsafe fn finish(self, state: *mut LuaState) -> c_int {
        match self {
            Exit::Return(count) => count,
            Exit::Raise => ffi::lua_error(state),
            Exit::Yield { count, continuation } => ffi::lua_yieldk(state, count, 0, continuation),
        }
    }
}

/// Run trampoline logic, turning a panic into a raised VM error.
pub(crate) unsafe fn guard(state: *mut LuaState, body: impl FnOnce() -> Exit) -> Exit {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(exit) => exit,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            push_message(state, &format!("host function panicked: {}", message));
            Exit::Raise
        }
    }
}

/// Null `lua_State` used where the API accepts "no origin".
pub(crate) fn no_state() -> *mut LuaState {
    ptr::null_mut()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            Status::Ok,
            Status::Yield,
            Status::ErrorRun,
            Status::ErrorSyntax,
            Status::ErrorMem,
            Status::ErrorErr,
            Status::ErrorFile,
        ] {
            assert_eq!(Status::from_raw(status.code()), status);
        }
        assert_eq!(Status::from_raw(99), Status::ErrorRun);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(LuaType::from_raw(ffi::LUA_TTABLE), LuaType::Table);
        assert_eq!(LuaType::from_raw(-1), LuaType::None);
        assert_eq!(LuaType::LightUserdata.name(), "userdata");
    }

    #[test]
    fn test_library_names() {
        assert_eq!(Library::from_name("utf8"), Some(Library::Utf8));
        assert_eq!(Library::from_name("_G"), Some(Library::Base));
        assert_eq!(Library::from_name("socket"), None);
        assert_eq!(Library::Base.module_name(), c"_G");
    }

    #[test]
    fn test_cstring_rejects_nul() {
        assert!(cstring("print").is_ok());
        assert!(matches!(cstring("pr\0int"), Err(Error::Programming(_))));
    }
}
