//! Shared host tables
//!
//! A [`Table`] is either an ordered sequence (keys `1..=N`) or an
//! insertion-ordered mapping. Writes that break the sequence shape turn it into
//! a mapping. Tables are shared: clones point at the same storage, which is what
//! lets cyclic structures cross the VM boundary.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::{HostObject, MultiValue, Value};
use crate::error::Result;

/// Key of a host table entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    Integer(i64),
    String(String),
    Boolean(bool),
    /// Float key with a fractional part (or infinite), compared bit for bit
    Float(FloatKey),
}

/// Non-NaN float usable as a map key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FloatKey(u64);

impl FloatKey {
    /// `None` for NaN, which the VM rejects as a key.
    pub fn new(n: f64) -> Option<Self> {
        if n.is_nan() {
            return None;
        }
        Some(Self(n.to_bits()))
    }

    pub fn get(self) -> f64 {
        f64::from_bits(self.0)
    }
}

impl TableKey {
    /// Convert a value usable as a key. Floats with no fractional part become
    /// integers, as they do in the VM.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(TableKey::Integer(*i)),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(TableKey::Integer(*n as i64)),
            Value::Number(n) => FloatKey::new(*n).map(TableKey::Float),
            Value::String(s) => Some(TableKey::String(s.clone())),
            Value::Boolean(b) => Some(TableKey::Boolean(*b)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            TableKey::Integer(i) => Value::Integer(*i),
            TableKey::String(s) => Value::String(s.clone()),
            TableKey::Boolean(b) => Value::Boolean(*b),
            TableKey::Float(n) => Value::Number(n.get()),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKey::Integer(i) => write!(f, "{}", i),
            TableKey::String(s) => write!(f, "{}", s),
            TableKey::Boolean(b) => write!(f, "{}", b),
            TableKey::Float(n) => write!(f, "{}", n.get()),
        }
    }
}

impl From<bool> for TableKey {
    fn from(b: bool) -> Self {
        TableKey::Boolean(b)
    }
}

impl From<&str> for TableKey {
    fn from(s: &str) -> Self {
        TableKey::String(s.to_string())
    }
}

impl From<String> for TableKey {
    fn from(s: String) -> Self {
        TableKey::String(s)
    }
}

impl From<i64> for TableKey {
    fn from(i: i64) -> Self {
        TableKey::Integer(i)
    }
}

impl From<i32> for TableKey {
    fn from(i: i32) -> Self {
        TableKey::Integer(i as i64)
    }
}

impl From<usize> for TableKey {
    fn from(i: usize) -> Self {
        TableKey::Integer(i as i64)
    }
}

enum TableData {
    Sequence(Vec<Value>),
    Map(IndexMap<TableKey, Value>),
}

/// Shared, mutable host table
#[derive(Clone)]
pub struct Table(Rc<RefCell<TableData>>);

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    /// Empty mapping.
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(TableData::Map(IndexMap::new()))))
    }

    /// Ordered sequence.
    pub fn sequence<T: Into<Value>>(values: impl IntoIterator<Item = T>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        Self(Rc::new(RefCell::new(TableData::Sequence(values))))
    }

    /// Mapping from key/value pairs, in iteration order. Nil values are skipped.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<TableKey>,
        V: Into<Value>,
    {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.is_nil())
            .collect();
        Self(Rc::new(RefCell::new(TableData::Map(map))))
    }

    /// Replace the contents with entries read from the VM. Dense `1..=N`
    /// integer keys become a sequence, anything else a mapping.
    pub(crate) fn fill(&self, entries: Vec<(TableKey, Value)>) {
        let dense = !entries.is_empty() && {
            let mut indices: Vec<i64> = entries
                .iter()
                .filter_map(|(k, _)| match k {
                    TableKey::Integer(i) => Some(*i),
                    _ => None,
                })
                .collect();
            indices.sort_unstable();
            indices.len() == entries.len()
                && indices.iter().enumerate().all(|(i, k)| *k == i as i64 + 1)
        };

        let data = if dense {
            let mut ordered: Vec<(i64, Value)> = entries
                .into_iter()
                .filter_map(|(k, v)| match k {
                    TableKey::Integer(i) => Some((i, v)),
                    _ => None,
                })
                .collect();
            ordered.sort_unstable_by_key(|(i, _)| *i);
            TableData::Sequence(ordered.into_iter().map(|(_, v)| v).collect())
        } else {
            TableData::Map(entries.into_iter().collect())
        };
        *self.0.borrow_mut() = data;
    }

    pub fn is_sequence(&self) -> bool {
        matches!(&*self.0.borrow(), TableData::Sequence(_))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        match &*self.0.borrow() {
            TableData::Sequence(v) => v.len(),
            TableData::Map(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length as the VM's `#` operator sees it: the largest `n` with `1..=n` all present.
    pub fn border(&self) -> usize {
        match &*self.0.borrow() {
            TableData::Sequence(v) => v.len(),
            TableData::Map(m) => {
                let mut n = 0usize;
                while m.contains_key(&TableKey::Integer(n as i64 + 1)) {
                    n += 1;
                }
                n
            }
        }
    }

    /// Value under `key`, `Nil` when absent.
    pub fn get(&self, key: impl Into<TableKey>) -> Value {
        let key = key.into();
        match &*self.0.borrow() {
            TableData::Sequence(v) => match key {
                TableKey::Integer(i) if i >= 1 => v.get(i as usize - 1).cloned().unwrap_or_default(),
                _ => Value::Nil,
            },
            TableData::Map(m) => m.get(&key).cloned().unwrap_or_default(),
        }
    }

    /// Set `key` to `value`. Setting `Nil` removes the entry.
    pub fn set(&self, key: impl Into<TableKey>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if value.is_nil() {
            self.remove(key);
            return;
        }

        let mut data = self.0.borrow_mut();
        if let TableData::Sequence(v) = &mut *data {
            match key {
                TableKey::Integer(i) if i >= 1 && (i as usize) <= v.len() => {
                    v[i as usize - 1] = value;
                    return;
                }
                TableKey::Integer(i) if i >= 1 && i as usize == v.len() + 1 => {
                    v.push(value);
                    return;
                }
                _ => {}
            }
        }
        data.make_map().insert(key, value);
    }

    /// Append at `border() + 1`.
    pub fn push(&self, value: impl Into<Value>) {
        let next = self.border() + 1;
        self.set(next, value);
    }

    /// Remove `key`, returning the previous value.
    pub fn remove(&self, key: impl Into<TableKey>) -> Value {
        let key = key.into();
        let mut data = self.0.borrow_mut();
        if let TableData::Sequence(v) = &mut *data {
            match key {
                TableKey::Integer(i) if i >= 1 && i as usize == v.len() => {
                    return v.pop().unwrap_or_default();
                }
                TableKey::Integer(i) if i >= 1 && (i as usize) < v.len() => {}
                _ => return Value::Nil,
            }
        }
        data.make_map().shift_remove(&key).unwrap_or_default()
    }

    /// Snapshot of every entry. Sequence keys are `1..=N`.
    pub fn entries(&self) -> Vec<(TableKey, Value)> {
        match &*self.0.borrow() {
            TableData::Sequence(v) => v
                .iter()
                .enumerate()
                .map(|(i, value)| (TableKey::Integer(i as i64 + 1), value.clone()))
                .collect(),
            TableData::Map(m) => m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    pub fn keys(&self) -> Vec<TableKey> {
        self.entries().into_iter().map(|(k, _)| k).collect()
    }

    /// Snapshot of the values, in order.
    pub fn values(&self) -> Vec<Value> {
        match &*self.0.borrow() {
            TableData::Sequence(v) => v.clone(),
            TableData::Map(m) => m.values().cloned().collect(),
        }
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &Table) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl TableData {
    fn make_map(&mut self) -> &mut IndexMap<TableKey, Value> {
        if let TableData::Sequence(v) = self {
            let map = std::mem::take(v)
                .into_iter()
                .enumerate()
                .map(|(i, value)| (TableKey::Integer(i as i64 + 1), value))
                .collect();
            *self = TableData::Map(map);
        }
        match self {
            TableData::Map(m) => m,
            TableData::Sequence(_) => unreachable!("sequence converted above"),
        }
    }
}

/// Tables compare by identity first, then structurally. Structural comparison
/// recurses, so compare cyclic tables with [`Table::ptr_eq`].
impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        if self.len() != other.len() {
            return false;
        }
        self.entries()
            .into_iter()
            .all(|(key, value)| other.get(key) == value)
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_sequence() { "sequence" } else { "map" };
        write!(f, "Table({}, len={}, 0x{:x})", kind, self.len(), self.identity())
    }
}

/// Tables exposed by proxy read and write their own storage.
impl HostObject for Table {
    fn type_name(&self) -> &str {
        "table"
    }

    fn get(&self, key: &Value) -> Result<Value> {
        Ok(TableKey::from_value(key).map_or(Value::Nil, |k| Table::get(self, k)))
    }

    fn set(&self, key: &Value, value: Value) -> Result<()> {
        let key = TableKey::from_value(key)
            .ok_or_else(|| crate::error::Error::callback("only strings or numbers can index host tables"))?;
        Table::set(self, key, value);
        Ok(())
    }

    fn len(&self) -> usize {
        self.border()
    }

    fn keys(&self) -> Vec<Value> {
        Table::keys(self).iter().map(TableKey::to_value).collect()
    }

    fn display(&self) -> String {
        format!("table: 0x{:x}", self.identity())
    }

    fn call(&self, _args: MultiValue) -> Result<MultiValue> {
        Err(crate::error::Error::callback("attempt to call a table value"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_get_and_push() {
        let table = Table::sequence(["x", "y"]);
        table.push("z");
        assert!(table.is_sequence());
        assert_eq!(table.get(3), Value::from("z"));
        assert_eq!(table.get(0), Value::Nil);
        assert_eq!(table.border(), 3);
    }

    #[test]
    fn test_sequence_becomes_map_on_sparse_write() {
        let table = Table::sequence([1, 2]);
        table.set(10, 3);
        assert!(!table.is_sequence());
        assert_eq!(table.get(1), Value::Integer(1));
        assert_eq!(table.get(10), Value::Integer(3));
        assert_eq!(table.border(), 2);
    }

    #[test]
    fn test_set_nil_removes() {
        let table = Table::from_pairs([("a", 1), ("b", 2)]);
        table.set("a", Value::Nil);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("a"), Value::Nil);
    }

    #[test]
    fn test_fill_dense_keys_as_sequence() {
        let table = Table::new();
        table.fill(vec![
            (TableKey::Integer(2), Value::from("y")),
            (TableKey::Integer(1), Value::from("x")),
            (TableKey::Integer(3), Value::from("z")),
        ]);
        assert!(table.is_sequence());
        assert_eq!(table.values(), vec![Value::from("x"), Value::from("y"), Value::from("z")]);
    }

    #[test]
    fn test_fill_sparse_keys_as_map() {
        let table = Table::new();
        table.fill(vec![
            (TableKey::Integer(1), Value::from("x")),
            (TableKey::Integer(3), Value::from("z")),
        ]);
        assert!(!table.is_sequence());

        let mixed = Table::new();
        mixed.fill(vec![
            (TableKey::Integer(1), Value::from(1)),
            (TableKey::from("a"), Value::from(2)),
        ]);
        assert!(!mixed.is_sequence());
    }

    #[test]
    fn test_structural_equality() {
        let a = Table::from_pairs([("a", 1), ("b", 2)]);
        let b = Table::from_pairs([("b", 2), ("a", 1)]);
        assert_eq!(a, b);
        assert_ne!(a, Table::from_pairs([("a", 1)]));
        assert_eq!(Table::sequence([1, 2]), Table::from_pairs([(1, 1), (2, 2)]));
    }

    #[test]
    fn test_float_keys_normalize() {
        assert_eq!(TableKey::from_value(&Value::Number(2.0)), Some(TableKey::Integer(2)));
        assert_eq!(TableKey::from_value(&Value::Number(2.5)), FloatKey::new(2.5).map(TableKey::Float));
        assert_eq!(TableKey::from_value(&Value::Number(f64::NAN)), None);
        assert_eq!(TableKey::from_value(&Value::Boolean(true)), Some(TableKey::Boolean(true)));
        assert_eq!(TableKey::from_value(&Value::Table(Table::new())), None);
    }

    #[test]
    fn test_host_object_view() {
        let table = Table::from_pairs([("name", "moon")]);
        let object: &dyn HostObject = &table;
        assert_eq!(object.get(&Value::from("name")).unwrap(), Value::from("moon"));
        object.set(&Value::from("phase"), Value::from("full")).unwrap();
        assert_eq!(table.get("phase"), Value::from("full"));
        assert!(object.set(&Value::Table(Table::new()), Value::Nil).is_err());
    }
}
