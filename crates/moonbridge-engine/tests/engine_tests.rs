//! Integration tests for the synchronous engine surface.
//!
//! Covers chunk execution, marshaling through globals, host objects and the
//! resource limits configured through `EngineOptions`.

use moonbridge_engine::{
    decorate, Engine, EngineOptions, Error, Function, HostObject, MultiValue, Object, Result, Table, Value,
};
use std::cell::Cell;
use std::io::Write;

struct Point {
    x: Cell<i64>,
    y: Cell<i64>,
}

impl HostObject for Point {
    fn type_name(&self) -> &str {
        "Point"
    }

    fn get(&self, key: &Value) -> Result<Value> {
        Ok(match key.as_str() {
            Some("x") => Value::Integer(self.x.get()),
            Some("y") => Value::Integer(self.y.get()),
            _ => Value::Nil,
        })
    }

    fn set(&self, key: &Value, value: Value) -> Result<()> {
        let n = value.as_integer().ok_or_else(|| Error::callback("coordinates are integers"))?;
        match key.as_str() {
            Some("x") => self.x.set(n),
            Some("y") => self.y.set(n),
            _ => return Err(Error::callback("Point has no such field")),
        }
        Ok(())
    }

    fn display(&self) -> String {
        format!("Point({}, {})", self.x.get(), self.y.get())
    }

    fn construct(&self, args: MultiValue) -> Result<Value> {
        Ok(Value::Object(Object::new(Point {
            x: Cell::new(args.value(0).as_integer().unwrap_or(0)),
            y: Cell::new(args.value(1).as_integer().unwrap_or(0)),
        })))
    }
}

fn origin() -> Object {
    Object::new(Point {
        x: Cell::new(0),
        y: Cell::new(0),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Chunk execution
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_do_string_returns_first_result() {
    let engine = Engine::new().unwrap();
    assert_eq!(engine.do_string_sync("return 1 + 1").unwrap(), Value::Integer(2));
    assert_eq!(engine.do_string_sync("return 'a' .. 'b'").unwrap(), Value::from("ab"));
    assert_eq!(engine.do_string_sync("return 7, 8, 9").unwrap(), Value::Integer(7));
    assert_eq!(engine.do_string_sync("return 10 / 4").unwrap(), Value::Number(2.5));
}

#[test]
fn test_syntax_error() {
    let engine = Engine::new().unwrap();
    let err = engine.do_string_sync("return +").unwrap_err();
    assert!(matches!(err, Error::Syntax(_)), "unexpected error: {:?}", err);
}

#[test]
fn test_runtime_error_carries_message() {
    let engine = Engine::new().unwrap();
    let err = engine.do_string_sync("error('boom')").unwrap_err();
    match err {
        Error::Runtime(message) => assert!(message.contains("boom")),
        other => panic!("expected a runtime error, got {:?}", other),
    }
    assert_eq!(engine.global().get_top(), 0);
}

#[test]
fn test_do_file() {
    let engine = Engine::new().unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "local n = 40").unwrap();
    writeln!(file, "return n + 2").unwrap();
    assert_eq!(engine.do_file_sync(file.path()).unwrap(), Value::Integer(42));
}

#[test]
fn test_do_file_missing() {
    let engine = Engine::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let err = engine.do_file_sync(dir.path().join("missing.lua")).unwrap_err();
    assert!(matches!(err, Error::Syntax(_)));
}

#[test]
fn test_without_standard_libs() {
    let engine = Engine::with_options(EngineOptions {
        open_standard_libs: false,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(engine.do_string_sync("return string").unwrap(), Value::Nil);
    assert_eq!(engine.do_string_sync("return 2 ^ 3").unwrap(), Value::Number(8.0));
}

// ────────────────────────────────────────────────────────────────────────────
// Marshaling
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_host_function_and_tables() {
    let engine = Engine::new().unwrap();
    let global = engine.global();
    global
        .set(
            "sum",
            Function::wrap(|args: MultiValue| {
                let table = args.value(0);
                let table = table.as_table().ok_or_else(|| Error::callback("expected a table"))?;
                Ok(Value::Integer(table.values().iter().filter_map(Value::as_integer).sum()))
            }),
        )
        .unwrap();
    assert_eq!(engine.do_string_sync("return sum({1, 2, 3, 4})").unwrap(), Value::Integer(10));

    global
        .set("config", Table::from_pairs([("name", Value::from("moon")), ("depth", Value::from(3))]))
        .unwrap();
    assert_eq!(engine.do_string_sync("return config.name .. config.depth").unwrap(), Value::from("moon3"));

    let table = engine.do_string_sync("return { list = {10, 20}, flag = true }").unwrap();
    let table = table.as_table().unwrap();
    assert_eq!(table.get("flag"), Value::Boolean(true));
    assert_eq!(table.get("list"), Value::Table(Table::sequence([10, 20])));
}

#[test]
fn test_host_error_reaches_vm_pcall() {
    let engine = Engine::new().unwrap();
    engine
        .global()
        .set("fail", Function::wrap(|_: MultiValue| -> Result<()> { Err(Error::callback("denied")) }))
        .unwrap();
    let result = engine
        .do_string_sync("local ok, err = pcall(fail) return tostring(ok) .. ':' .. err.kind .. ':' .. err.message")
        .unwrap();
    assert_eq!(result, Value::from("false:CallbackError:denied"));
}

#[test]
fn test_vm_function_called_from_host() {
    let engine = Engine::new().unwrap();
    let function = engine.do_string_sync("return function(a, b) return a * b, a + b end").unwrap();
    let function = function.as_function().unwrap();
    let values = function.call(vec![Value::from(6), Value::from(7)]).unwrap();
    assert_eq!(values.into_vec(), vec![Value::Integer(42), Value::Integer(13)]);
}

#[test]
fn test_proxy_object() {
    let engine = Engine::new().unwrap();
    let point = origin();
    engine.global().set("p", point.clone()).unwrap();
    assert_eq!(
        engine.do_string_sync("p.x = 3 p.y = 4 return tostring(p)").unwrap(),
        Value::from("Point(3, 4)")
    );
    assert_eq!(point.get(&Value::from("x")).unwrap(), Value::Integer(3));
    assert!(engine.do_string_sync("p.z = 1").is_err());
    assert!(engine.global().get("p").unwrap().ptr_eq(&Value::Object(point)));
}

#[test]
fn test_proxy_disabled_uses_userdata() {
    let engine = Engine::with_options(EngineOptions {
        enable_proxy: false,
        ..Default::default()
    })
    .unwrap();
    assert!(matches!(engine.global().set("p", origin()), Err(Error::Programming(_))));

    let point = origin();
    engine.global().set("p", decorate(point.clone()).reference()).unwrap();
    assert_eq!(engine.do_string_sync("return type(p)").unwrap(), Value::from("userdata"));
    assert!(engine.do_string_sync("return p.x").is_err());
    assert!(engine.global().get("p").unwrap().ptr_eq(&Value::Object(point)));
}

#[test]
fn test_table_proxy_decoration() {
    let engine = Engine::new().unwrap();
    let shared = Table::new();
    engine.global().set("t", decorate(shared.clone()).proxy(true)).unwrap();
    engine.do_string_sync("t.answer = 42").unwrap();
    assert_eq!(shared.get("answer"), Value::Integer(42));
}

#[test]
fn test_inject_objects() {
    let engine = Engine::with_options(EngineOptions {
        inject_objects: true,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(engine.do_string_sync("return null").unwrap(), Value::Null);
    assert_eq!(engine.do_string_sync("return null ~= nil").unwrap(), Value::Boolean(true));

    engine.global().set("Point", origin()).unwrap();
    assert_eq!(
        engine.do_string_sync("local p = new(Point, 1, 2) return p.x + p.y").unwrap(),
        Value::Integer(3)
    );
    assert!(engine.do_string_sync("return new(42)").is_err());
}

// ────────────────────────────────────────────────────────────────────────────
// Resource limits
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_memory_ceiling() {
    let engine = Engine::with_options(EngineOptions {
        memory_max: Some(1024 * 1024),
        ..Default::default()
    })
    .unwrap();
    assert!(engine.global().memory_used().unwrap() > 0);
    let err = engine
        .do_string_sync("local t = {} for i = 1, 1e7 do t[i] = string.rep('x', 128) .. i end return #t")
        .unwrap_err();
    assert!(matches!(err, Error::Memory(_)), "unexpected error: {:?}", err);
    assert_eq!(engine.do_string_sync("return 1").unwrap(), Value::Integer(1));
}

#[test]
fn test_memory_accounting_requires_tracing() {
    let engine = Engine::new().unwrap();
    assert!(matches!(engine.global().memory_used(), Err(Error::Programming(_))));
}

#[test]
fn test_sync_timeout() {
    let engine = Engine::new().unwrap();
    let options = moonbridge_engine::RunOptions {
        timeout: Some(std::time::Duration::from_millis(50)),
    };
    let err = engine.do_string_sync_with("while true do end", options).unwrap_err();
    assert_eq!(err, Error::timeout());
    assert_eq!(engine.do_string_sync("return 'alive'").unwrap(), Value::from("alive"));
}

#[test]
fn test_function_timeout() {
    let engine = Engine::with_options(EngineOptions {
        function_timeout_ms: Some(50),
        ..Default::default()
    })
    .unwrap();
    let spin = engine.do_string_sync("return function() while true do end end").unwrap();
    let err = spin.as_function().unwrap().call(()).unwrap_err();
    assert_eq!(err, Error::timeout());
}

#[test]
fn test_closed_engine() {
    let engine = Engine::new().unwrap();
    let function = engine.do_string_sync("return function() return 1 end").unwrap();
    engine.close();
    assert!(engine.do_string_sync("return 1").is_err());
    assert_eq!(function.as_function().unwrap().call(()).unwrap(), MultiValue::new());
}
