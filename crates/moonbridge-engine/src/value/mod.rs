//! Host-side value model
//!
//! [`Value`] is the tagged union every value crossing the VM boundary is
//! converted to or from. Primitives are copied; tables, functions, promises,
//! objects and userdata are shared (`Rc`) so their identity survives round trips
//! through VM memory.

mod function;
mod object;
mod promise;
mod table;

use std::any::Any;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

pub use function::{Function, FunctionOptions, Invocation, Return, Suspension};
pub(crate) use function::FunctionKind;
pub use object::{HostObject, Object};
pub use promise::Promise;
pub use table::{FloatKey, Table, TableKey};

use crate::error::Error;
use crate::thread::Thread;

/// A value that can cross the VM boundary
#[derive(Clone, Default)]
pub enum Value {
    /// `nil`, also returned for missing stack slots
    #[default]
    Nil,
    /// Explicit null sentinel (distinct from nil when convenience globals are injected)
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    /// Shared table, copied into VM tables on push
    Table(Table),
    /// Host closure or VM callable
    Function(Function),
    /// Host asynchronous value
    Promise(Promise),
    /// Live host object (exposed through proxies)
    Object(Object),
    /// Opaque host value
    Userdata(Userdata),
    Error(Error),
    /// A VM execution context
    Thread(Thread),
    /// Opaque foreign address for values the host cannot represent
    Pointer(Pointer),
}

impl Value {
    /// Address of the shared allocation for identity-bearing values.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Table(t) => Some(t.identity()),
            Value::Function(f) => Some(f.identity()),
            Value::Promise(p) => Some(p.identity()),
            Value::Object(o) => Some(o.identity()),
            Value::Userdata(u) => Some(u.identity()),
            _ => None,
        }
    }

    /// Identity comparison. Values without identity are never identical,
    /// except threads, which compare by VM state.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Thread(a), Value::Thread(b)) => a.state() == b.state(),
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Name of the value's kind.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Promise(_) => "promise",
            Value::Object(_) => "object",
            Value::Userdata(_) => "userdata",
            Value::Error(_) => "error",
            Value::Thread(_) => "thread",
            Value::Pointer(_) => "pointer",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value, accepting floats with no fractional part.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Value::Promise(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_userdata(&self) -> Option<&Userdata> {
        match self {
            Value::Userdata(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&Error> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<&Thread> {
        match self {
            Value::Thread(t) => Some(t),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Number(b)) | (Value::Number(b), Value::Integer(a)) => {
                *a as f64 == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            _ => self.ptr_eq(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Null => write!(f, "Null"),
            Value::Boolean(b) => write!(f, "Boolean({})", b),
            Value::Integer(i) => write!(f, "Integer({})", i),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Table(t) => fmt::Debug::fmt(t, f),
            Value::Function(func) => fmt::Debug::fmt(func, f),
            Value::Promise(p) => fmt::Debug::fmt(p, f),
            Value::Object(o) => fmt::Debug::fmt(o, f),
            Value::Userdata(u) => fmt::Debug::fmt(u, f),
            Value::Error(e) => write!(f, "Error({:?})", e),
            Value::Thread(t) => write!(f, "Thread({:p})", t.state()),
            Value::Pointer(p) => fmt::Debug::fmt(p, f),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e16 => {
                write!(f, "{:.1}", n)
            }
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Table(t) => write!(f, "table: 0x{:x}", t.identity()),
            Value::Function(func) => write!(f, "function: 0x{:x}", func.identity()),
            Value::Promise(p) => write!(f, "promise: 0x{:x}", p.identity()),
            Value::Object(o) => write!(f, "{}", o.display()),
            Value::Userdata(u) => write!(f, "userdata: 0x{:x}", u.identity()),
            Value::Error(e) => write!(f, "{}", e),
            Value::Thread(t) => write!(f, "thread: {:p}", t.state()),
            Value::Pointer(p) => write!(f, "{}", p),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Value::Table(t)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

impl From<Promise> for Value {
    fn from(p: Promise) -> Self {
        Value::Promise(p)
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl From<Userdata> for Value {
    fn from(u: Userdata) -> Self {
        Value::Userdata(u)
    }
}

impl From<Error> for Value {
    fn from(e: Error) -> Self {
        Value::Error(e)
    }
}

impl From<Thread> for Value {
    fn from(t: Thread) -> Self {
        Value::Thread(t)
    }
}

impl From<Pointer> for Value {
    fn from(p: Pointer) -> Self {
        Value::Pointer(p)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Nil, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::Table(Table::sequence(values))
    }
}

// ============================================================================
// Multi-value results
// ============================================================================

/// Ordered values of one or more VM return slots
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MultiValue(Vec<Value>);

impl MultiValue {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// First value, `Nil` when empty.
    pub fn into_first(self) -> Value {
        self.0.into_iter().next().unwrap_or_default()
    }

    /// Value at `index`, `Nil` when out of range.
    pub fn value(&self, index: usize) -> Value {
        self.0.get(index).cloned().unwrap_or_default()
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl Deref for MultiValue {
    type Target = Vec<Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MultiValue {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Value>> for MultiValue {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl From<Value> for MultiValue {
    fn from(value: Value) -> Self {
        Self(vec![value])
    }
}

impl From<()> for MultiValue {
    fn from(_: ()) -> Self {
        Self::new()
    }
}

impl<const N: usize> From<[Value; N]> for MultiValue {
    fn from(values: [Value; N]) -> Self {
        Self(values.into())
    }
}

impl FromIterator<Value> for MultiValue {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for MultiValue {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a MultiValue {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ============================================================================
// Opaque values
// ============================================================================

/// Foreign address of a value the host has no representation for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pointer(usize);

impl Pointer {
    pub fn new(address: usize) -> Self {
        Self(address)
    }

    pub fn address(self) -> usize {
        self.0
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pointer: 0x{:x}", self.0)
    }
}

/// Opaque host value passed through the VM untouched
#[derive(Clone)]
pub struct Userdata(Rc<dyn Any>);

impl Userdata {
    pub fn new<T: Any>(value: T) -> Self {
        Self(Rc::new(value))
    }

    pub fn from_rc(value: Rc<dyn Any>) -> Self {
        Self(value)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for Userdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Userdata(0x{:x})", self.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_across_representations() {
        assert_eq!(Value::Integer(2), Value::Number(2.0));
        assert_ne!(Value::Integer(2), Value::Number(2.5));
        assert_eq!(Value::Number(2.0).as_integer(), Some(2));
        assert_eq!(Value::Number(2.5).as_integer(), None);
    }

    #[test]
    fn test_identity_only_for_shared_values() {
        let table = Value::Table(Table::new());
        assert!(table.identity().is_some());
        assert!(Value::String("x".into()).identity().is_none());
        assert!(table.ptr_eq(&table.clone()));
        assert!(!Value::Integer(1).ptr_eq(&Value::Integer(1)));
    }

    #[test]
    fn test_userdata_downcast() {
        let data = Userdata::new(41u32);
        assert!(data.is::<u32>());
        assert_eq!(data.downcast_ref::<u32>(), Some(&41));
        assert!(data.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_display_follows_vm_formatting() {
        assert_eq!(Value::Number(2.0).to_string(), "2.0");
        assert_eq!(Value::Number(0.5).to_string(), "0.5");
        assert_eq!(Value::Integer(7).to_string(), "7");
        assert_eq!(Value::Nil.to_string(), "nil");
    }

    #[test]
    fn test_multi_value_first() {
        let values = MultiValue::from(vec![Value::from(1), Value::from("a")]);
        assert_eq!(values.value(1), Value::from("a"));
        assert_eq!(values.value(5), Value::Nil);
        assert_eq!(values.into_first(), Value::Integer(1));
        assert_eq!(MultiValue::new().into_first(), Value::Nil);
    }

    #[test]
    fn test_option_and_vec_conversions() {
        assert_eq!(Value::from(None::<i64>), Value::Nil);
        assert_eq!(Value::from(Some("x")), Value::from("x"));
        let list = Value::from(vec!["a", "b"]);
        let table = list.as_table().unwrap();
        assert!(table.is_sequence());
        assert_eq!(table.len(), 2);
    }
}
