//! Host asynchronous values
//!
//! A [`Promise`] wraps a local future resolving to a [`MultiValue`]. It is
//! shared: every clone observes the same outcome, and the future is polled by
//! whichever clone is awaited first.

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use super::{MultiValue, Value};
use crate::error::{Error, Result};

type SharedOutcome = Shared<LocalBoxFuture<'static, Result<MultiValue>>>;

/// Shared host future exposed to VM code
#[derive(Clone)]
pub struct Promise(Rc<SharedOutcome>);

impl Promise {
    /// Wrap a future resolving to multiple values.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<MultiValue>> + 'static,
    {
        Self(Rc::new(future.boxed_local().shared()))
    }

    /// Wrap a future resolving to a single value.
    pub fn from_future<F, T>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + 'static,
        T: Into<Value>,
    {
        Self::new(async move { future.await.map(|value| MultiValue::from(value.into())) })
    }

    /// Already resolved promise.
    pub fn resolved(values: impl Into<MultiValue>) -> Self {
        let values = values.into();
        Self::new(async move { Ok(values) })
    }

    /// Already rejected promise.
    pub fn rejected(error: Error) -> Self {
        Self::new(async move { Err(error) })
    }

    /// Wait for the outcome.
    pub async fn settled(&self) -> Result<MultiValue> {
        (*self.0).clone().await
    }

    /// Outcome if the future already completed.
    pub fn peek(&self) -> Option<Result<MultiValue>> {
        self.0.peek().cloned()
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.0.peek().is_some() { "settled" } else { "pending" };
        write!(f, "Promise({}, 0x{:x})", state, self.identity())
    }
}
