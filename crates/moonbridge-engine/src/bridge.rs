//! Coroutine bridge
//!
//! Lets a suspended execution context wait for a host [`Promise`]. Awaiting
//! registers a `{Waiting, Settled}` state for the context and hands the host
//! loop a driver promise; when the driver completes, the state holds the
//! outcome and the continuation trampoline delivers it to VM code.

use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

use crate::binding::LuaState;
use crate::error::{Error, Result};
use crate::value::{MultiValue, Promise};

enum AwaitState {
    Waiting,
    Settled(Result<MultiValue>),
}

struct PendingAwait {
    state: Rc<RefCell<AwaitState>>,
    driver: Promise,
}

/// What the continuation finds when a suspended context resumes
pub(crate) enum Resumption {
    /// Outcome of the awaited promise
    Settled(Result<MultiValue>),
    /// Resumed too early, yield the driver again
    Waiting(Promise),
    /// Nothing was awaited on this context
    Missing,
}

/// Pending awaits, at most one per execution context
#[derive(Default)]
pub(crate) struct CoroutineBridge {
    pending: RefCell<FxHashMap<usize, PendingAwait>>,
}

impl CoroutineBridge {
    /// Register an await on `state` and return the driver promise for the host loop.
    pub(crate) fn suspend(&self, state: *mut LuaState, promise: Promise) -> Result<Promise> {
        let key = state as usize;
        if self.pending.borrow().contains_key(&key) {
            return Err(Error::programming("execution context is already awaiting a promise"));
        }

        let slot = Rc::new(RefCell::new(AwaitState::Waiting));
        let settle = slot.clone();
        let driver = Promise::new(async move {
            let outcome = promise.settled().await;
            *settle.borrow_mut() = AwaitState::Settled(outcome);
            Ok(MultiValue::new())
        });

        self.pending.borrow_mut().insert(
            key,
            PendingAwait {
                state: slot,
                driver: driver.clone(),
            },
        );
        tracing::trace!(context = ?state, "await registered");
        Ok(driver)
    }

    /// Take the outcome for `state`. Settled entries are removed.
    pub(crate) fn resume(&self, state: *mut LuaState) -> Resumption {
        let key = state as usize;
        let mut pending = self.pending.borrow_mut();
        let settled = match pending.get(&key) {
            None => return Resumption::Missing,
            Some(entry) => matches!(&*entry.state.borrow(), AwaitState::Settled(_)),
        };
        if !settled {
            return match pending.get(&key) {
                Some(entry) => Resumption::Waiting(entry.driver.clone()),
                None => Resumption::Missing,
            };
        }
        let Some(entry) = pending.remove(&key) else {
            return Resumption::Missing;
        };
        drop(pending);
        let outcome = std::mem::replace(&mut *entry.state.borrow_mut(), AwaitState::Waiting);
        match outcome {
            AwaitState::Settled(result) => Resumption::Settled(result),
            AwaitState::Waiting => Resumption::Missing,
        }
    }

    /// Drop the pending await of `state`, if any.
    pub(crate) fn cancel(&self, state: *mut LuaState) {
        let removed = self.pending.borrow_mut().remove(&(state as usize));
        if removed.is_some() {
            tracing::debug!(context = ?state, "pending await cancelled");
        }
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, state: *mut LuaState) -> bool {
        self.pending.borrow().contains_key(&(state as usize))
    }

    pub(crate) fn clear(&self) {
        let pending: Vec<_> = self.pending.borrow_mut().drain().collect();
        drop(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use futures::executor::block_on;

    fn fake_state(n: usize) -> *mut LuaState {
        n as *mut LuaState
    }

    #[test]
    fn test_suspend_then_resume_after_driver() {
        let bridge = CoroutineBridge::default();
        let state = fake_state(0x10);
        let driver = bridge
            .suspend(state, Promise::resolved(vec![Value::from(1), Value::from(2)]))
            .unwrap();
        assert!(matches!(bridge.resume(state), Resumption::Waiting(_)));

        block_on(driver.settled()).unwrap();
        match bridge.resume(state) {
            Resumption::Settled(Ok(values)) => assert_eq!(values.len(), 2),
            _ => panic!("expected settled values"),
        }
        assert!(!bridge.is_pending(state));
        assert!(matches!(bridge.resume(state), Resumption::Missing));
    }

    #[test]
    fn test_second_suspend_is_rejected() {
        let bridge = CoroutineBridge::default();
        let state = fake_state(0x20);
        bridge.suspend(state, Promise::resolved(())).unwrap();
        let err = bridge.suspend(state, Promise::resolved(())).unwrap_err();
        assert!(matches!(err, Error::Programming(_)));
    }

    #[test]
    fn test_rejection_is_delivered() {
        let bridge = CoroutineBridge::default();
        let state = fake_state(0x30);
        let driver = bridge.suspend(state, Promise::rejected(Error::callback("boom"))).unwrap();
        block_on(driver.settled()).unwrap();
        match bridge.resume(state) {
            Resumption::Settled(Err(err)) => assert_eq!(err.message(), "boom"),
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_cancel_drops_entry() {
        let bridge = CoroutineBridge::default();
        let state = fake_state(0x40);
        bridge.suspend(state, Promise::resolved(())).unwrap();
        bridge.cancel(state);
        assert!(!bridge.is_pending(state));
        bridge.clear();
    }
}
