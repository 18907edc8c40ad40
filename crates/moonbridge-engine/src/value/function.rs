//! Callable values
//!
//! A [`Function`] is either a host closure, which the function extension
//! exposes to VM code through a call trampoline, or a VM callable read from the
//! stack, which re-enters the VM through a registry reference when called.

use std::ffi::c_int;
use std::fmt;
use std::rc::Rc;

use super::{MultiValue, Value};
use crate::binding::ffi;
use crate::error::{Error, Result};
use crate::extension::function::VmFunction;
use crate::thread::Thread;

/// Signature of host closures.
pub type HostCallback = dyn Fn(Invocation<'_>) -> Result<Return>;

/// How a host closure receives its arguments
#[derive(Clone, Default)]
pub struct FunctionOptions {
    /// Pass the calling execution context in [`Invocation::thread`]
    pub receive_thread: bool,
    /// Skip argument conversion, only report the count
    pub receive_args_quantity: bool,
    /// Value dropped from the arguments when passed first (method calls)
    pub bound_self: Option<Value>,
}

#[cfg(test)]
impl FunctionOptions {
    fn is_default(&self) -> bool {
        !self.receive_thread && !self.receive_args_quantity && self.bound_self.is_none()
    }
}

/// Arguments of one host closure call
pub struct Invocation<'a> {
    /// Calling context, present when `receive_thread` is set and the call
    /// comes from the VM
    pub thread: Option<&'a Thread>,
    /// Converted arguments (empty with `receive_args_quantity`)
    pub args: MultiValue,
    /// Number of arguments on the VM stack
    pub arg_count: usize,
}

/// Result of a host closure
pub enum Return {
    /// Values pushed back onto the VM stack
    Values(MultiValue),
    /// The closure pushed this many values itself
    Raw(usize),
    /// Yield this many values already pushed by the closure
    Yield(usize),
    /// Yield and resume in a continuation (await)
    Suspend(Suspension),
}

/// Yield with a continuation, built by the promise extension
pub struct Suspension {
    pub(crate) count: c_int,
    pub(crate) continuation: ffi::lua_KFunction,
}

impl From<MultiValue> for Return {
    fn from(values: MultiValue) -> Self {
        Return::Values(values)
    }
}

impl From<Value> for Return {
    fn from(value: Value) -> Self {
        Return::Values(MultiValue::from(value))
    }
}

impl From<Vec<Value>> for Return {
    fn from(values: Vec<Value>) -> Self {
        Return::Values(MultiValue::from(values))
    }
}

impl From<()> for Return {
    fn from(_: ()) -> Self {
        Return::Values(MultiValue::new())
    }
}

pub(crate) enum FunctionKind {
    Host {
        callback: Rc<HostCallback>,
        options: FunctionOptions,
    },
    Vm(VmFunction),
}

/// Host closure or VM callable
#[derive(Clone)]
pub struct Function(Rc<FunctionKind>);

impl Function {
    /// Host closure with full access to the invocation.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Invocation<'_>) -> Result<Return> + 'static,
    {
        Self(Rc::new(FunctionKind::Host {
            callback: Rc::new(callback),
            options: FunctionOptions::default(),
        }))
    }

    /// Host closure over converted arguments.
    pub fn wrap<F, R>(callback: F) -> Self
    where
        F: Fn(MultiValue) -> Result<R> + 'static,
        R: Into<Return>,
    {
        Self::new(move |invocation: Invocation<'_>| callback(invocation.args).map(Into::into))
    }

    pub(crate) fn from_vm(function: VmFunction) -> Self {
        Self(Rc::new(FunctionKind::Vm(function)))
    }

    pub(crate) fn kind(&self) -> &FunctionKind {
        &self.0
    }

    /// Copy of a host closure with different options. VM callables are returned unchanged.
    pub fn with_options(&self, options: FunctionOptions) -> Self {
        match &*self.0 {
            FunctionKind::Host { callback, .. } => Self(Rc::new(FunctionKind::Host {
                callback: callback.clone(),
                options,
            })),
            FunctionKind::Vm(_) => self.clone(),
        }
    }

    fn update_options(self, update: impl FnOnce(&mut FunctionOptions)) -> Self {
        match self.options() {
            Some(options) => {
                let mut options = options.clone();
                update(&mut options);
                self.with_options(options)
            }
            None => self,
        }
    }

    /// Receive the calling context.
    pub fn receive_thread(self) -> Self {
        self.update_options(|o| o.receive_thread = true)
    }

    /// Receive only the argument count.
    pub fn receive_args_quantity(self) -> Self {
        self.update_options(|o| o.receive_args_quantity = true)
    }

    /// Bind `this` as the receiver of method calls.
    pub fn bind(self, this: Value) -> Self {
        self.update_options(|o| o.bound_self = Some(this))
    }

    /// Options of a host closure, `None` for VM callables.
    pub fn options(&self) -> Option<&FunctionOptions> {
        match &*self.0 {
            FunctionKind::Host { options, .. } => Some(options),
            FunctionKind::Vm(_) => None,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(&*self.0, FunctionKind::Host { .. })
    }

    /// Call from host code.
    ///
    /// Host closures run directly (no calling context, so raw results and
    /// yields are rejected); VM callables run on a fresh execution context.
    pub fn call(&self, args: impl Into<MultiValue>) -> Result<MultiValue> {
        let args = args.into();
        match &*self.0 {
            FunctionKind::Host { callback, .. } => {
                let arg_count = args.len();
                match callback(Invocation { thread: None, args, arg_count })? {
                    Return::Values(values) => Ok(values),
                    Return::Raw(_) | Return::Yield(_) | Return::Suspend(_) => Err(Error::programming(
                        "raw results and yields are only valid when called from the VM",
                    )),
                }
            }
            FunctionKind::Vm(function) => function.call(args),
        }
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    #[cfg(test)]
    pub(crate) fn has_default_options(&self) -> bool {
        self.options().map_or(true, FunctionOptions::is_default)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_host() { "host" } else { "vm" };
        write!(f, "Function({}, 0x{:x})", kind, self.identity())
    }
}
