//! Promise conversion
//!
//! Host promises are exposed by reference. Their metatable provides `next`,
//! `catch`, `finally` and `await` through `__index`. `await` suspends the
//! calling coroutine through the coroutine bridge and resumes in
//! [`resume_await`].

use std::ffi::{c_int, CStr};

use super::function::{complete_call, raise_error};
use super::{install_metatable, push_reference, set_metafield, Seen, TypeExtension};
use crate::binding::{self, ffi, Exit, LuaState};
use crate::bridge::Resumption;
use crate::decoration::Decoration;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::thread::Thread;
use crate::value::{Function, Invocation, MultiValue, Promise, Return, Suspension, Table, Value};

pub(crate) const PROMISE_METATABLE: &CStr = c"moonbridge.promise";

/// Converter for host promises
#[derive(Debug)]
pub struct PromiseExtension;

impl PromiseExtension {
    pub fn new(global: &Thread) -> Result<Self> {
        install_metatable(global, PROMISE_METATABLE, |metatable| {
            let methods = Table::from_pairs([
                ("next", Value::Function(next_method())),
                ("catch", Value::Function(catch_method())),
                ("finally", Value::Function(finally_method())),
                ("await", Value::Function(await_method())),
            ]);
            set_metafield(global, metatable, c"__index", methods)?;
            set_metafield(
                global,
                metatable,
                c"__tostring",
                Function::wrap(|_| Ok(Value::from("[object Promise]"))),
            )
        })?;
        Ok(Self)
    }
}

impl TypeExtension for PromiseExtension {
    fn name(&self) -> &CStr {
        PROMISE_METATABLE
    }

    fn push_value(&self, thread: &Thread, decoration: &Decoration, _seen: &mut Seen) -> Result<bool> {
        let Value::Promise(promise) = &decoration.target else {
            return Ok(false);
        };
        push_reference(thread, Value::Promise(promise.clone()), PROMISE_METATABLE)?;
        Ok(true)
    }
}

fn self_promise(args: &MultiValue) -> Result<Promise> {
    args.first()
        .and_then(Value::as_promise)
        .cloned()
        .ok_or_else(|| Error::programming("promise method called without self instance"))
}

fn callback_arg(args: &MultiValue, index: usize) -> Result<Function> {
    match args.value(index) {
        Value::Function(function) => Ok(function),
        other => Err(Error::callback(format!(
            "promise callback must be a function, got {}",
            other.type_name()
        ))),
    }
}

fn next_method() -> Function {
    Function::wrap(|args: MultiValue| {
        let promise = self_promise(&args)?;
        let on_resolve = callback_arg(&args, 1)?;
        let on_reject = match args.value(2) {
            Value::Nil => None,
            _ => Some(callback_arg(&args, 2)?),
        };
        Ok(Value::Promise(Promise::new(async move {
            match promise.settled().await {
                Ok(values) => on_resolve.call(values),
                Err(err) => match on_reject {
                    Some(on_reject) => on_reject.call(Value::Error(err)),
                    None => Err(err),
                },
            }
        })))
    })
}

fn catch_method() -> Function {
    Function::wrap(|args: MultiValue| {
        let promise = self_promise(&args)?;
        let on_reject = callback_arg(&args, 1)?;
        Ok(Value::Promise(Promise::new(async move {
            match promise.settled().await {
                Ok(values) => Ok(values),
                Err(err) => on_reject.call(Value::Error(err)),
            }
        })))
    })
}

fn finally_method() -> Function {
    Function::wrap(|args: MultiValue| {
        let promise = self_promise(&args)?;
        let on_settled = callback_arg(&args, 1)?;
        Ok(Value::Promise(Promise::new(async move {
            let outcome = promise.settled().await;
            on_settled.call(())?;
            outcome
        })))
    })
}

fn await_method() -> Function {
    Function::new(|invocation: Invocation<'_>| {
        let promise = self_promise(&invocation.args)?;
        let thread = invocation
            .thread
            .ok_or_else(|| Error::programming("await requires a calling execution context"))?;
        if thread.is_main() {
            return Err(Error::programming("cannot await in the main thread"));
        }
        if !thread.is_yieldable() {
            return Err(Error::programming("cannot await outside a yieldable execution context"));
        }

        let bridge = thread.instance().bridge();
        let driver = bridge.suspend(thread.state(), promise)?;
        if let Err(err) = thread.push_value(Value::Promise(driver)) {
            bridge.cancel(thread.state());
            return Err(err);
        }
        Ok(Return::Suspend(Suspension {
            count: 1,
            continuation: resume_await,
        }))
    })
    .receive_thread()
}

/// Continuation of `await`: delivers the settled outcome or yields the driver again.
unsafe extern "C-unwind" fn resume_await(state: *mut LuaState, _status: c_int, _ctx: ffi::lua_KContext) -> c_int {
    let exit = binding::guard(state, || {
        let Some(instance) = Instance::from_state(state) else {
            binding::push_message(state, "the VM instance has been closed");
            return Exit::Raise;
        };
        let thread = Thread::attached(instance.clone(), state);
        match instance.bridge().resume(state) {
            Resumption::Settled(outcome) => complete_call(&thread, outcome.map(Return::Values)),
            Resumption::Waiting(driver) => match thread.push_value(Value::Promise(driver)) {
                Ok(()) => Exit::Yield {
                    count: 1,
                    continuation: Some(resume_await),
                },
                Err(err) => raise_error(&thread, err),
            },
            Resumption::Missing => raise_error(
                &thread,
                Error::programming("no pending await for this execution context"),
            ),
        }
    });
    exit.finish(state)
}

#[cfg(test)]
mod tests {
    use crate::binding::Library;
    use crate::error::Error;
    use crate::global::Global;
    use crate::value::{Promise, Value};

    #[test]
    fn test_promise_tostring() {
        let global = Global::new(false).unwrap();
        global.load_library(Library::Base).unwrap();
        global.set("p", Promise::resolved(())).unwrap();
        global.load_string("return tostring(p)").unwrap();
        let result = global.run_sync(0).unwrap();
        assert_eq!(result.into_first(), Value::from("[object Promise]"));
    }

    #[test]
    fn test_promise_read_back_is_same() {
        let global = Global::new(false).unwrap();
        let promise = Promise::resolved(Value::from(1));
        global.set("p", promise.clone()).unwrap();
        assert!(global.get("p").unwrap().ptr_eq(&Value::Promise(promise)));
    }

    #[test]
    fn test_await_in_main_thread_is_rejected() {
        let global = Global::new(false).unwrap();
        global.set("p", Promise::resolved(Value::from(1))).unwrap();
        global.load_string("return p:await()").unwrap();
        let err = global.run_sync(0).unwrap_err();
        assert_eq!(err, Error::Programming("cannot await in the main thread".to_string()));
    }

    #[test]
    fn test_method_without_self() {
        let global = Global::new(false).unwrap();
        global.set("p", Promise::resolved(())).unwrap();
        global.load_string("return p.next(1, function() end)").unwrap();
        let err = global.run_sync(0).unwrap_err();
        assert!(err.message().contains("without self instance"));
    }
}
