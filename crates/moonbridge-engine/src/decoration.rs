//! Decorated values
//!
//! A [`Decoration`] is a host value plus instructions for how it crosses into
//! the VM: a custom metatable, live proxying, opaque referencing, or call
//! options for host closures.

use crate::value::{Function, FunctionOptions, Object, Promise, Table, Value};

/// Conversion instructions attached to a pushed value
#[derive(Clone, Debug, Default)]
pub struct DecorationOptions {
    /// Metatable applied after the value is pushed (must be a table)
    pub metatable: Option<Value>,
    /// `Some(true)` proxies tables too, `Some(false)` disables proxying
    pub proxy: Option<bool>,
    /// Push identity-bearing values as opaque userdata
    pub reference: bool,
    /// Host closures receive the calling execution context
    pub receive_thread: bool,
    /// Host closures receive only the argument count
    pub receive_args_quantity: bool,
    /// Host closures drop this value when passed as first argument
    pub bound_self: Option<Value>,
}

/// Host value plus conversion instructions
#[derive(Clone, Debug, Default)]
pub struct Decoration {
    pub target: Value,
    pub options: DecorationOptions,
}

impl Decoration {
    pub fn new(target: impl Into<Value>) -> Self {
        Self {
            target: target.into(),
            options: DecorationOptions::default(),
        }
    }

    pub fn with_metatable(mut self, metatable: impl Into<Value>) -> Self {
        self.options.metatable = Some(metatable.into());
        self
    }

    pub fn proxy(mut self, enabled: bool) -> Self {
        self.options.proxy = Some(enabled);
        self
    }

    pub fn reference(mut self) -> Self {
        self.options.reference = true;
        self
    }

    pub fn receive_thread(mut self) -> Self {
        self.options.receive_thread = true;
        self
    }

    pub fn receive_args_quantity(mut self) -> Self {
        self.options.receive_args_quantity = true;
        self
    }

    pub fn bind(mut self, this: impl Into<Value>) -> Self {
        self.options.bound_self = Some(this.into());
        self
    }

    /// Call options requested for a host closure, `None` when none are set.
    pub(crate) fn function_options(&self) -> Option<FunctionOptions> {
        let options = &self.options;
        if !options.receive_thread && !options.receive_args_quantity && options.bound_self.is_none() {
            return None;
        }
        Some(FunctionOptions {
            receive_thread: options.receive_thread,
            receive_args_quantity: options.receive_args_quantity,
            bound_self: options.bound_self.clone(),
        })
    }
}

/// Start decorating `value`.
pub fn decorate(value: impl Into<Value>) -> Decoration {
    Decoration::new(value)
}

impl From<Value> for Decoration {
    fn from(target: Value) -> Self {
        Self::new(target)
    }
}

impl From<Table> for Decoration {
    fn from(table: Table) -> Self {
        Self::new(table)
    }
}

impl From<Function> for Decoration {
    fn from(function: Function) -> Self {
        Self::new(function)
    }
}

impl From<Object> for Decoration {
    fn from(object: Object) -> Self {
        Self::new(object)
    }
}

impl From<Promise> for Decoration {
    fn from(promise: Promise) -> Self {
        Self::new(promise)
    }
}
