//! JSON conversion for values
//!
//! Used by embedders that exchange data with the VM as JSON, and by the CLI's
//! `--json` output. Sequences become arrays, other tables become objects, and
//! values with no JSON form are rendered through `Display`.

use rustc_hash::FxHashSet;
use serde_json::{Map, Number};

use crate::error::{Error, Result};
use crate::value::{Table, TableKey, Value};

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Table(Table::sequence(items.into_iter().map(Value::from))),
            serde_json::Value::Object(map) => {
                Value::Table(Table::from_pairs(map.into_iter().map(|(k, v)| (k, Value::from(v)))))
            }
        }
    }
}

impl Value {
    /// JSON form of this value. Cyclic tables are rejected.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let mut visiting = FxHashSet::default();
        to_json(self, &mut visiting)
    }
}

fn to_json(value: &Value, visiting: &mut FxHashSet<usize>) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Nil | Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::Number((*i).into()),
        Value::Number(n) => match Number::from_f64(*n) {
            Some(n) => serde_json::Value::Number(n),
            None => serde_json::Value::Null,
        },
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Table(table) => {
            if !visiting.insert(table.identity()) {
                return Err(Error::programming("cannot convert a cyclic table to JSON"));
            }
            let json = table_to_json(table, visiting)?;
            visiting.remove(&table.identity());
            json
        }
        Value::Error(error) => {
            let mut map = Map::new();
            map.insert("kind".to_string(), error.kind().into());
            map.insert("message".to_string(), error.message().into());
            serde_json::Value::Object(map)
        }
        other => serde_json::Value::String(other.to_string()),
    })
}

fn table_to_json(table: &Table, visiting: &mut FxHashSet<usize>) -> Result<serde_json::Value> {
    if table.is_sequence() && !table.is_empty() {
        let items = table
            .values()
            .iter()
            .map(|v| to_json(v, visiting))
            .collect::<Result<Vec<_>>>()?;
        return Ok(serde_json::Value::Array(items));
    }
    let mut map = Map::new();
    for (key, value) in table.entries() {
        let key = match key {
            TableKey::String(s) => s,
            other => other.to_value().to_string(),
        };
        map.insert(key, to_json(&value, visiting)?);
    }
    Ok(serde_json::Value::Object(map))
}
