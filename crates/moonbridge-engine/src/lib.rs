//! Moonbridge Engine
//!
//! Embeds a Lua 5.4 VM and bridges it with host code:
//! - **Marshaling**: host [`Value`]s to VM values and back, with pluggable
//!   [`TypeExtension`]s for tables, functions, promises, proxies and userdata
//! - **Execution contexts**: [`Thread`]s with load, resume, timeouts and a
//!   cooperative async run loop
//! - **Async bridging**: VM code awaits host [`Promise`]s through `p:await()`
//! - **Resource control**: allocation tracing, memory ceilings and deadlines
//!
//! # Example
//!
//! ```rust,ignore
//! use moonbridge_engine::{Engine, Function, MultiValue, Value};
//!
//! let engine = Engine::new()?;
//! engine.global().set("double", Function::wrap(|args: MultiValue| {
//!     Ok(Value::Integer(args.value(0).as_integer().unwrap_or(0) * 2))
//! }))?;
//! let result = engine.do_string_sync("return double(21)")?;
//! assert_eq!(result, Value::Integer(42));
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(clippy::new_without_default)]

// ============================================================================
// Foreign VM access
// ============================================================================

/// Typed wrappers over the raw C API and the error-safe trampoline
pub mod binding;

/// Handle table for host values referenced from VM memory
pub mod reference;

pub(crate) mod bridge;
pub(crate) mod instance;

// ============================================================================
// Host-facing API
// ============================================================================

pub mod decoration;
pub mod engine;
pub mod error;
pub mod extension;
pub mod global;
pub mod json;
pub mod thread;
pub mod value;

pub use binding::{Library, LuaType, Status};
pub use decoration::{decorate, Decoration, DecorationOptions};
pub use engine::{Engine, EngineOptions};
pub use error::{Error, Result};
pub use extension::{Seen, TypeExtension};
pub use global::Global;
pub use reference::{Handle, ReferenceTable};
pub use thread::{ResumeResult, RunOptions, Thread};
pub use value::{
    FloatKey, Function, FunctionOptions, HostObject, Invocation, MultiValue, Object, Pointer, Promise, Return, Table,
    TableKey, Userdata, Value,
};
