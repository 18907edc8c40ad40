//! Live proxies
//!
//! Host objects (and tables decorated with `proxy(true)`) are pushed by
//! reference. Every metamethod forwards to the [`HostObject`] behind the
//! handle, so VM code and host code observe the same state.

use std::cell::Cell;
use std::ffi::CStr;

use super::{install_metatable, push_reference, set_metafield, Seen, TypeExtension};
use crate::decoration::Decoration;
use crate::error::{Error, Result};
use crate::thread::Thread;
use crate::value::{Function, HostObject, MultiValue, Value};

pub(crate) const PROXY_METATABLE: &CStr = c"moonbridge.proxy";

/// Converter exposing host objects through metamethod traps
#[derive(Debug)]
pub struct ProxyExtension;

impl ProxyExtension {
    pub fn new(global: &Thread) -> Result<Self> {
        install_metatable(global, PROXY_METATABLE, |metatable| {
            set_metafield(global, metatable, c"__index", Function::wrap(index_trap))?;
            set_metafield(global, metatable, c"__newindex", Function::wrap(newindex_trap))?;
            set_metafield(global, metatable, c"__call", Function::wrap(call_trap))?;
            set_metafield(global, metatable, c"__len", Function::wrap(len_trap))?;
            set_metafield(global, metatable, c"__pairs", Function::wrap(pairs_trap))?;
            set_metafield(global, metatable, c"__tostring", Function::wrap(tostring_trap))?;
            set_metafield(global, metatable, c"__eq", Function::wrap(eq_trap))
        })?;
        Ok(Self)
    }
}

impl TypeExtension for ProxyExtension {
    fn name(&self) -> &CStr {
        PROXY_METATABLE
    }

    fn push_value(&self, thread: &Thread, decoration: &Decoration, _seen: &mut Seen) -> Result<bool> {
        let accepted = match (&decoration.target, decoration.options.proxy) {
            (Value::Object(_), None | Some(true)) => true,
            (Value::Table(_), Some(true)) => true,
            _ => false,
        };
        if !accepted {
            return Ok(false);
        }
        push_reference(thread, decoration.target.clone(), PROXY_METATABLE)?;
        Ok(true)
    }
}

fn host_object(value: &Value) -> Result<&dyn HostObject> {
    match value {
        Value::Object(object) => Ok(&**object),
        Value::Table(table) => Ok(table),
        _ => Err(Error::programming("proxy trap called without a host object")),
    }
}

fn check_key(key: &Value) -> Result<()> {
    match key {
        Value::String(_) | Value::Integer(_) | Value::Number(_) => Ok(()),
        _ => Err(Error::callback("only strings or numbers can index host objects")),
    }
}

fn index_trap(args: MultiValue) -> Result<Value> {
    let this = args.value(0);
    let key = args.value(1);
    check_key(&key)?;
    match host_object(&this)?.get(&key)? {
        Value::Function(function) if function.is_host() => Ok(Value::Function(function.bind(this))),
        value => Ok(value),
    }
}

fn newindex_trap(args: MultiValue) -> Result<()> {
    let this = args.value(0);
    let key = args.value(1);
    check_key(&key)?;
    host_object(&this)?.set(&key, args.value(2))
}

fn call_trap(args: MultiValue) -> Result<MultiValue> {
    let mut args = args.into_vec();
    if args.is_empty() {
        return Err(Error::programming("proxy trap called without a host object"));
    }
    let this = args.remove(0);
    if args.first().is_some_and(|first| first.ptr_eq(&this)) {
        args.remove(0);
    }
    host_object(&this)?.call(MultiValue::from(args))
}

fn len_trap(args: MultiValue) -> Result<Value> {
    Ok(Value::from(host_object(&args.value(0))?.len()))
}

fn pairs_trap(args: MultiValue) -> Result<MultiValue> {
    let this = args.value(0);
    let keys = host_object(&this)?.keys();
    let position = Cell::new(0usize);
    let target = this.clone();
    let iterator = Function::wrap(move |_| {
        let index = position.get();
        let Some(key) = keys.get(index) else {
            return Ok(MultiValue::new());
        };
        position.set(index + 1);
        let value = host_object(&target)?.get(key)?;
        Ok(MultiValue::from(vec![key.clone(), value]))
    });
    Ok(MultiValue::from(vec![Value::Function(iterator), this, Value::Nil]))
}

fn tostring_trap(args: MultiValue) -> Result<Value> {
    Ok(Value::from(host_object(&args.value(0))?.display()))
}

fn eq_trap(args: MultiValue) -> Result<Value> {
    Ok(Value::Boolean(args.value(0).ptr_eq(&args.value(1))))
}
