//! Integration tests for the cooperative run loop and promise awaiting.

use moonbridge_engine::{Engine, Error, Function, MultiValue, Promise, RunOptions, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

fn sleep_function() -> Function {
    Function::wrap(|args: MultiValue| {
        let ms = args.value(0).as_integer().unwrap_or(0).max(0) as u64;
        Ok(Value::Promise(Promise::from_future(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::from(ms as i64))
        })))
    })
}

#[tokio::test]
async fn test_do_string_async() {
    let engine = Engine::new().unwrap();
    assert_eq!(engine.do_string("return 6 * 7").await.unwrap(), Value::Integer(42));
}

#[tokio::test]
async fn test_await_resolved_multi_values() {
    let engine = Engine::new().unwrap();
    engine
        .global()
        .set("p", Promise::resolved(vec![Value::from(1), Value::from(2)]))
        .unwrap();
    let result = engine.do_string("local a, b = p:await() return a + b").await.unwrap();
    assert_eq!(result, Value::Integer(3));
}

#[tokio::test]
async fn test_await_pending_promise() {
    let engine = Engine::new().unwrap();
    engine.global().set("sleep", sleep_function()).unwrap();
    let result = engine
        .do_string("local a = sleep(10):await() local b = sleep(5):await() return a + b")
        .await
        .unwrap();
    assert_eq!(result, Value::Integer(15));
}

#[tokio::test]
async fn test_await_rejection_keeps_message() {
    let engine = Engine::new().unwrap();
    engine
        .global()
        .set("p", Promise::rejected(Error::callback("request refused")))
        .unwrap();
    let err = engine.do_string("return p:await()").await.unwrap_err();
    assert_eq!(err, Error::callback("request refused"));

    let caught = engine
        .do_string("local ok, err = pcall(function() return p:await() end) return tostring(ok) .. ' ' .. err.message")
        .await
        .unwrap();
    assert_eq!(caught, Value::from("false request refused"));
}

#[tokio::test]
async fn test_await_requires_yieldable_context() {
    let engine = Engine::new().unwrap();
    engine.global().set("p", Promise::resolved(())).unwrap();
    let err = engine.do_string_sync("return p:await()").unwrap_err();
    assert!(matches!(err, Error::Programming(_)), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn test_promise_chaining() {
    let engine = Engine::new().unwrap();
    engine.global().set("sleep", sleep_function()).unwrap();
    let result = engine
        .do_string(
            r#"
            local chained = sleep(1):next(function(ms) return ms * 100 end)
            local recovered = sleep(1)
                :next(function() error('late') end)
                :catch(function(err) return 'recovered' end)
            return tostring(chained:await()) .. ' ' .. recovered:await()
            "#,
        )
        .await
        .unwrap();
    assert_eq!(result, Value::from("100 recovered"));
}

#[tokio::test]
async fn test_finally_runs_on_rejection() {
    let engine = Engine::new().unwrap();
    let calls = Rc::new(RefCell::new(0));
    let counter = calls.clone();
    engine
        .global()
        .set(
            "count",
            Function::wrap(move |_: MultiValue| {
                *counter.borrow_mut() += 1;
                Ok(())
            }),
        )
        .unwrap();
    engine
        .global()
        .set("p", Promise::rejected(Error::callback("gone")))
        .unwrap();
    let err = engine.do_string("return p:finally(count):await()").await.unwrap_err();
    assert_eq!(err.message(), "gone");
    assert_eq!(*calls.borrow(), 1);
}

#[tokio::test]
async fn test_run_timeout() {
    let engine = Engine::new().unwrap();
    let options = RunOptions {
        timeout: Some(Duration::from_millis(50)),
    };
    let err = engine.do_string_with("while true do end", options).await.unwrap_err();
    assert_eq!(err, Error::timeout());
}

#[tokio::test]
async fn test_timeout_while_awaiting() {
    let engine = Engine::new().unwrap();
    engine
        .global()
        .set("never", Promise::new(futures::future::pending()))
        .unwrap();
    let options = RunOptions {
        timeout: Some(Duration::from_millis(30)),
    };
    let err = engine.do_string_with("return never:await()", options).await.unwrap_err();
    assert_eq!(err, Error::timeout());
    assert_eq!(engine.do_string("return 'next run'").await.unwrap(), Value::from("next run"));
}

#[tokio::test]
async fn test_host_promise_from_vm_function() {
    let engine = Engine::new().unwrap();
    engine.global().set("sleep", sleep_function()).unwrap();
    let delayed = engine
        .do_string("return function(n) return sleep(n) end")
        .await
        .unwrap();
    let promise = delayed.as_function().unwrap().call(Value::from(3)).unwrap().into_first();
    let promise = promise.as_promise().unwrap();
    assert_eq!(promise.settled().await.unwrap().into_first(), Value::Integer(3));
}
