//! Live host objects
//!
//! Types implementing [`HostObject`] are exposed to VM code by reference: the
//! proxy extension forwards indexing, assignment, calls, length, iteration and
//! `tostring` to the trait methods below.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use super::{MultiValue, Value};
use crate::error::{Error, Result};

/// Behavior of a host object exposed through a proxy
///
/// Every method has a default so implementors only provide what they support.
pub trait HostObject: Any {
    /// Name used in error messages and the default `tostring`.
    fn type_name(&self) -> &str {
        "object"
    }

    /// `object[key]`
    fn get(&self, key: &Value) -> Result<Value> {
        let _ = key;
        Ok(Value::Nil)
    }

    /// `object[key] = value`
    fn set(&self, key: &Value, value: Value) -> Result<()> {
        let _ = (key, value);
        Err(Error::callback(format!("{} is read-only", self.type_name())))
    }

    /// `object(...)`
    fn call(&self, args: MultiValue) -> Result<MultiValue> {
        let _ = args;
        Err(Error::callback(format!("{} is not callable", self.type_name())))
    }

    /// `#object`
    fn len(&self) -> usize {
        0
    }

    /// Keys visited by `pairs(object)`, in order.
    fn keys(&self) -> Vec<Value> {
        Vec::new()
    }

    /// `tostring(object)`
    fn display(&self) -> String {
        self.type_name().to_string()
    }

    /// `new(object, ...)` when convenience globals are injected.
    fn construct(&self, args: MultiValue) -> Result<Value> {
        let _ = args;
        Err(Error::callback(format!("{} is not constructible", self.type_name())))
    }
}

/// Shared handle to a host object
#[derive(Clone)]
pub struct Object(Rc<dyn HostObject>);

impl Object {
    pub fn new<T: HostObject>(object: T) -> Self {
        Self(Rc::new(object))
    }

    pub fn from_rc(object: Rc<dyn HostObject>) -> Self {
        Self(object)
    }

    /// Borrow the concrete object.
    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        let any: &dyn Any = &*self.0;
        any.downcast_ref::<T>()
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        self.identity() == other.identity()
    }
}

impl std::ops::Deref for Object {
    type Target = dyn HostObject;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({}, 0x{:x})", self.0.type_name(), self.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Counter {
        count: Cell<i64>,
    }

    impl HostObject for Counter {
        fn type_name(&self) -> &str {
            "Counter"
        }

        fn get(&self, key: &Value) -> Result<Value> {
            match key.as_str() {
                Some("count") => Ok(Value::Integer(self.count.get())),
                _ => Ok(Value::Nil),
            }
        }
    }

    #[test]
    fn test_defaults_report_type_name() {
        let counter = Object::new(Counter { count: Cell::new(3) });
        assert_eq!(counter.get(&Value::from("count")).unwrap(), Value::Integer(3));
        let err = counter.set(&Value::from("count"), Value::Integer(1)).unwrap_err();
        assert_eq!(err.to_string(), "Counter is read-only");
        assert!(counter.call(MultiValue::new()).is_err());
        assert_eq!(counter.display(), "Counter");
    }

    #[test]
    fn test_downcast_and_identity() {
        let counter = Object::new(Counter { count: Cell::new(0) });
        let same = counter.clone();
        assert!(counter.ptr_eq(&same));
        let inner = counter.downcast_ref::<Counter>().unwrap();
        inner.count.set(9);
        assert_eq!(same.get(&Value::from("count")).unwrap(), Value::Integer(9));
    }
}
