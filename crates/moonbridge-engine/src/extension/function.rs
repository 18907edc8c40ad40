//! Function conversion
//!
//! Host closures are pushed as C closures whose only upvalue is a handle
//! userdata; [`call_host_function`] looks the closure up again on every call.
//! VM callables read by the host keep a registry reference and run on a fresh
//! context forked from a dedicated callback context.

use std::ffi::{c_int, CStr};
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::{install_metatable, push_reference, Seen, TypeExtension};
use crate::binding::{self, ffi, Exit, LuaState, LuaType};
use crate::decoration::Decoration;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::thread::Thread;
use crate::value::{Function, FunctionKind, FunctionOptions, Invocation, MultiValue, Return, Value};

pub(crate) const FUNCTION_METATABLE: &CStr = c"moonbridge.function";

/// Converter for host closures and VM callables
pub struct FunctionExtension {
    instance: Weak<Instance>,
}

impl FunctionExtension {
    /// Install the closure metatable and the callback context. `timeout`
    /// bounds every VM callable invoked from the host.
    pub fn new(global: &Thread, timeout: Option<Duration>) -> Result<Self> {
        install_metatable(global, FUNCTION_METATABLE, |_| Ok(()))?;

        let context = global.new_thread()?;
        let anchor = unsafe { binding::reference_top(global.state()) }?;
        let instance = global.instance();
        instance.set_callback_context(context, anchor);
        instance.set_function_timeout(timeout);
        Ok(Self {
            instance: Rc::downgrade(instance),
        })
    }

    fn push_host(&self, thread: &Thread, function: &Function, decoration: &Decoration) -> Result<()> {
        let function = match decoration.function_options() {
            Some(extra) => {
                let base = function.options().cloned().unwrap_or_default();
                function.with_options(FunctionOptions {
                    receive_thread: base.receive_thread || extra.receive_thread,
                    receive_args_quantity: base.receive_args_quantity || extra.receive_args_quantity,
                    bound_self: extra.bound_self.or(base.bound_self),
                })
            }
            None => function.clone(),
        };
        push_reference(thread, Value::Function(function), FUNCTION_METATABLE)?;
        unsafe { binding::push_closure(thread.state(), call_host_function, 1) }
    }
}

impl TypeExtension for FunctionExtension {
    fn name(&self) -> &CStr {
        FUNCTION_METATABLE
    }

    fn is_type(&self, _thread: &Thread, _index: c_int, ty: LuaType, _metatable_name: Option<&str>) -> bool {
        ty == LuaType::Function
    }

    fn get_value(&self, thread: &Thread, index: c_int, _seen: &mut Seen) -> Value {
        let state = thread.state();
        let index = thread.absolute_index(index);
        unsafe {
            if ffi::lua_iscfunction(state, index) != 0 && !ffi::lua_getupvalue(state, index, 1).is_null() {
                let handle = binding::read_handle(state, -1, FUNCTION_METATABLE);
                ffi::lua_pop(state, 1);
                if let Some(value) = handle.and_then(|handle| thread.instance().get_reference(handle)) {
                    return value;
                }
            }
        }
        Value::Function(Function::from_vm(VmFunction::read(thread, index)))
    }

    fn push_value(&self, thread: &Thread, decoration: &Decoration, _seen: &mut Seen) -> Result<bool> {
        let Value::Function(function) = &decoration.target else {
            return Ok(false);
        };
        match function.kind() {
            FunctionKind::Host { .. } => self.push_host(thread, function, decoration)?,
            FunctionKind::Vm(vm) => vm.push(thread)?,
        }
        Ok(true)
    }

    fn close(&self) {
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        if let Some((context, anchor)) = instance.take_callback_context() {
            context.close();
            let state = instance.state();
            if !state.is_null() {
                unsafe { ffi::luaL_unref(state, ffi::LUA_REGISTRYINDEX, anchor) };
            }
        }
    }
}

// ============================================================================
// VM callables
// ============================================================================

/// Registry reference to a VM callable
pub(crate) struct VmFunction {
    instance: Weak<Instance>,
    reference: c_int,
}

impl VmFunction {
    fn read(thread: &Thread, index: c_int) -> Self {
        let state = thread.state();
        let reference = unsafe {
            ffi::lua_pushvalue(state, index);
            binding::reference_top(state).unwrap_or_else(|err| {
                tracing::warn!(%err, "cannot anchor VM callable, reading it as nil");
                ffi::LUA_NOREF
            })
        };
        Self {
            instance: Rc::downgrade(thread.instance()),
            reference,
        }
    }

    fn push(&self, thread: &Thread) -> Result<()> {
        match self.instance.upgrade() {
            Some(instance) if instance.is_closed() => Err(Error::closed()),
            Some(instance) if Rc::ptr_eq(&instance, thread.instance()) => {
                unsafe {
                    ffi::lua_rawgeti(thread.state(), ffi::LUA_REGISTRYINDEX, self.reference as ffi::lua_Integer)
                };
                Ok(())
            }
            Some(_) => Err(Error::programming("cannot push a function owned by another VM instance")),
            None => Err(Error::closed()),
        }
    }

    /// Call on a context forked from the callback context.
    pub(crate) fn call(&self, args: MultiValue) -> Result<MultiValue> {
        let Some(instance) = self.instance.upgrade().filter(|instance| !instance.is_closed()) else {
            tracing::warn!("VM function called after its instance was closed");
            return Ok(MultiValue::new());
        };
        let context = instance.callback_context().ok_or_else(Error::closed)?;

        let call = context.new_thread()?;
        let slot = context.get_top();
        let outcome = self.invoke(&instance, &call, args);
        call.close();
        unsafe { ffi::lua_remove(context.state(), slot) };
        outcome
    }

    fn invoke(&self, instance: &Instance, call: &Thread, args: MultiValue) -> Result<MultiValue> {
        let state = call.state();
        unsafe {
            if ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, self.reference as ffi::lua_Integer) == ffi::LUA_TNIL {
                ffi::lua_pop(state, 1);
                return Err(Error::programming("VM function reference is no longer valid"));
            }
            if !callable(state, -1) {
                ffi::lua_pop(state, 1);
                return Err(Error::callback("attempt to call a non-callable value"));
            }
        }
        let count = args.len();
        for arg in args {
            call.push_value(arg)?;
        }
        if let Some(timeout) = instance.function_timeout() {
            call.set_timeout(Some(timeout));
        }
        call.run_sync(count as c_int)
    }
}

unsafe fn callable(state: *mut LuaState, index: c_int) -> bool {
    if binding::type_of(state, index) == LuaType::Function {
        return true;
    }
    let field = ffi::luaL_getmetafield(state, index, c"__call".as_ptr());
    if field != ffi::LUA_TNIL {
        ffi::lua_pop(state, 1);
        return true;
    }
    false
}

impl Drop for VmFunction {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.upgrade() {
            if !instance.is_closed() {
                unsafe { ffi::luaL_unref(instance.state(), ffi::LUA_REGISTRYINDEX, self.reference) };
            }
        }
    }
}

// ============================================================================
// Host closure trampoline
// ============================================================================

/// Entry point of every host closure pushed into the VM.
pub(crate) unsafe extern "C-unwind" fn call_host_function(state: *mut LuaState) -> c_int {
    let exit = binding::guard(state, || dispatch(state));
    exit.finish(state)
}

unsafe fn dispatch(state: *mut LuaState) -> Exit {
    let Some(instance) = Instance::from_state(state) else {
        binding::push_message(state, "the VM instance has been closed");
        return Exit::Raise;
    };
    let function = binding::read_handle(state, ffi::lua_upvalueindex(1), FUNCTION_METATABLE)
        .and_then(|handle| instance.get_reference(handle));
    let Some(Value::Function(function)) = function else {
        binding::push_message(state, "host function reference is no longer valid");
        return Exit::Raise;
    };
    let FunctionKind::Host { callback, options } = function.kind() else {
        binding::push_message(state, "host function reference is no longer valid");
        return Exit::Raise;
    };

    let thread = Thread::attached(instance, state);
    let top = thread.get_top();
    let mut base = 0;
    if let Some(bound) = &options.bound_self {
        if top >= 1 && thread.get_value(1).ptr_eq(bound) {
            base = 1;
        }
    }
    let args = if options.receive_args_quantity {
        MultiValue::new()
    } else {
        thread.get_stack_values(base)
    };
    let invocation = Invocation {
        thread: options.receive_thread.then_some(&thread),
        args,
        arg_count: (top - base).max(0) as usize,
    };
    let result = callback(invocation);
    complete_call(&thread, result)
}

/// Translate a host closure result into a trampoline exit.
pub(crate) fn complete_call(thread: &Thread, result: Result<Return>) -> Exit {
    match result {
        Ok(Return::Values(values)) => {
            let count = values.len();
            for value in values {
                if let Err(err) = thread.push_value(value) {
                    return raise_error(thread, err);
                }
            }
            Exit::Return(count as c_int)
        }
        Ok(Return::Raw(count)) => Exit::Return(count as c_int),
        Ok(Return::Yield(count)) => Exit::Yield {
            count: count as c_int,
            continuation: None,
        },
        Ok(Return::Suspend(suspension)) => Exit::Yield {
            count: suspension.count,
            continuation: Some(suspension.continuation),
        },
        Err(err) => raise_error(thread, err),
    }
}

/// Push `error` as an error value (a plain string if that fails) for raising.
pub(crate) fn raise_error(thread: &Thread, error: Error) -> Exit {
    let message = error.message().to_string();
    if thread.push_value(Value::Error(error)).is_err() {
        unsafe { binding::push_message(thread.state(), &message) };
    }
    Exit::Raise
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::global::Global;
    use crate::value::{Function, MultiValue, Value};

    fn add() -> Function {
        Function::wrap(|args: MultiValue| {
            let a = args.value(0).as_integer().unwrap_or(0);
            let b = args.value(1).as_integer().unwrap_or(0);
            Ok(Value::Integer(a + b))
        })
    }

    #[test]
    fn test_host_function_called_from_vm() {
        let global = Global::new(false).unwrap();
        global.set("add", add()).unwrap();
        let top = global.get_top();
        let result = global.call("add", vec![Value::from(2), Value::from(3)]).unwrap();
        assert_eq!(result.into_first(), Value::Integer(5));
        assert_eq!(global.get_top(), top);
    }

    #[test]
    fn test_host_function_read_back_is_same() {
        let global = Global::new(false).unwrap();
        let function = add();
        global.set("add", function.clone()).unwrap();
        let back = global.get("add").unwrap();
        assert!(back.ptr_eq(&Value::Function(function)));
    }

    #[test]
    fn test_vm_function_called_from_host() {
        let global = Global::new(false).unwrap();
        global.load_string("function twice(x) return x * 2, 'done' end").unwrap();
        global.run_sync(0).unwrap();
        let twice = global.get("twice").unwrap();
        let function = twice.as_function().unwrap();
        assert!(!function.is_host());
        let result = function.call(Value::from(21)).unwrap();
        assert_eq!(result.into_vec(), vec![Value::Integer(42), Value::from("done")]);
    }

    #[test]
    fn test_host_error_keeps_kind() {
        let global = Global::new(false).unwrap();
        global
            .set("fail", Function::wrap(|_| -> crate::Result<()> { Err(Error::callback("broken")) }))
            .unwrap();
        let err = global.call("fail", ()).unwrap_err();
        assert_eq!(err, Error::Callback("broken".to_string()));
    }

    #[test]
    fn test_bound_self_is_dropped() {
        let global = Global::new(false).unwrap();
        let receiver = Value::Userdata(crate::value::Userdata::new("receiver"));
        let count = Function::wrap(|args: MultiValue| Ok(Value::from(args.len()))).bind(receiver.clone());
        global.set("count", count).unwrap();
        let result = global.call("count", vec![receiver, Value::from(1)]).unwrap();
        assert_eq!(result.into_first(), Value::Integer(1));
        let result = global.call("count", vec![Value::from(1), Value::from(2)]).unwrap();
        assert_eq!(result.into_first(), Value::Integer(2));
    }

    #[test]
    fn test_panics_become_vm_errors() {
        let global = Global::new(false).unwrap();
        global
            .set("explode", Function::wrap(|_| -> crate::Result<()> { panic!("kaboom") }))
            .unwrap();
        let err = global.call("explode", ()).unwrap_err();
        assert!(err.message().contains("kaboom"));
    }
}
