//! Tests for the deferred result.

use super::*;
use crate::reactor::ManualReactor;
use std::cell::Cell;

#[test]
fn test_callbacks_fire_in_registration_order() {
    let deferred: Deferred<u32> = Deferred::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    for tag in ["first", "second", "third"] {
        let log = log.clone();
        deferred.on_success(move |v| log.borrow_mut().push(format!("{tag}:{v}")));
    }
    deferred.on_failure(|_| panic!("must not fail"));

    assert!(deferred.succeed(7));
    assert_eq!(*log.borrow(), vec!["first:7", "second:7", "third:7"]);
}

#[test]
fn test_settles_only_once() {
    let deferred: Deferred<u32> = Deferred::new();
    let successes = Rc::new(Cell::new(0));
    let failures = Rc::new(Cell::new(0));
    let s = successes.clone();
    deferred.on_success(move |_| s.set(s.get() + 1));
    let f = failures.clone();
    deferred.on_failure(move |_| f.set(f.get() + 1));

    assert!(deferred.fail(Error::QueryTimeout));
    assert!(!deferred.succeed(1));
    assert!(!deferred.fail(Error::ConnectTimeout));

    assert_eq!(successes.get(), 0);
    assert_eq!(failures.get(), 1);
    assert!(matches!(deferred.result(), Some(Err(Error::QueryTimeout))));
}

#[test]
fn test_late_registration_fires_immediately() {
    let deferred = Deferred::settled(Ok("done".to_string()));
    let seen = Rc::new(RefCell::new(None));
    let s = seen.clone();
    deferred.on_success(move |v| *s.borrow_mut() = Some(v));
    deferred.on_failure(|_| panic!("must not fail"));
    assert_eq!(seen.borrow().as_deref(), Some("done"));

    let failed: Deferred<()> = Deferred::settled(Err(Error::CommandAborted));
    let hit = Rc::new(Cell::new(false));
    let h = hit.clone();
    failed.on_failure(move |err| h.set(matches!(err, Error::CommandAborted)));
    assert!(hit.get());
}

#[test]
fn test_callback_may_register_on_the_same_deferred() {
    let deferred: Deferred<u8> = Deferred::new();
    let hits = Rc::new(Cell::new(0));
    let inner = deferred.clone();
    let h = hits.clone();
    deferred.on_success(move |_| {
        let h = h.clone();
        inner.on_success(move |_| h.set(h.get() + 1));
    });
    deferred.succeed(1);
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_protect_reports_failure_on_next_tick() {
    let reactor = ManualReactor::new();
    let deferred: Deferred<u32> = Deferred::new();

    let value = deferred.protect(&*reactor, || -> Result<u32> { Err(Error::custom("boom")) });
    assert!(value.is_none());
    assert!(deferred.is_pending(), "failure must not be synchronous");

    let seen = Rc::new(RefCell::new(None));
    let s = seen.clone();
    deferred.on_failure(move |err| *s.borrow_mut() = Some(err.to_string()));

    reactor.turn();
    assert_eq!(seen.borrow().as_deref(), Some("boom"));
}

#[test]
fn test_protect_returns_value_without_settling() {
    let reactor = ManualReactor::new();
    let deferred: Deferred<u32> = Deferred::new();
    assert_eq!(deferred.protect(&*reactor, || Ok("side")), Some("side"));
    reactor.run_until_idle();
    assert!(deferred.is_pending());
}

#[test]
fn test_protect_and_succeed_settles_on_next_tick() {
    let reactor = ManualReactor::new();
    let deferred: Deferred<u32> = Deferred::new();

    assert_eq!(deferred.protect_and_succeed(&*reactor, || Ok(5)), Some(5));
    assert!(deferred.is_pending());
    reactor.turn();
    assert!(matches!(deferred.result(), Some(Ok(5))));
}

#[test]
fn test_map_carries_value_and_error() {
    let source: Deferred<u32> = Deferred::new();
    let doubled = source.map(|v| v * 2);
    source.succeed(21);
    assert!(matches!(doubled.result(), Some(Ok(42))));

    let source: Deferred<u32> = Deferred::new();
    let mapped = source.map(|v| v.to_string());
    source.fail(Error::QueryTimeout);
    assert!(matches!(mapped.result(), Some(Err(Error::QueryTimeout))));
}

#[test]
fn test_join_all_keeps_input_order() {
    let items: Vec<Deferred<usize>> = (0..4).map(|_| Deferred::new()).collect();
    let joined = Deferred::join_all(items.clone());

    for index in [2, 0, 3, 1] {
        assert!(joined.is_pending());
        items[index].succeed(index * 10);
    }
    assert_eq!(joined.result().unwrap().unwrap(), vec![0, 10, 20, 30]);
}

#[test]
fn test_join_all_fails_on_first_error() {
    let items: Vec<Deferred<usize>> = (0..3).map(|_| Deferred::new()).collect();
    let joined = Deferred::join_all(items.clone());

    items[0].succeed(1);
    items[2].fail(Error::custom("slice 2"));
    items[1].fail(Error::custom("slice 1"));

    let err = joined.result().unwrap().unwrap_err();
    assert_eq!(err.to_string(), "slice 2");
}

#[test]
fn test_join_all_of_nothing_succeeds() {
    let joined = Deferred::<u8>::join_all(Vec::new());
    assert_eq!(joined.result().unwrap().unwrap(), Vec::<u8>::new());
}

#[test]
fn test_deferrable_drops_the_value() {
    let deferred: Deferred<String> = Deferred::new();
    let erased: Box<dyn Deferrable> = Box::new(deferred.clone());
    let hit = Rc::new(Cell::new(false));
    let h = hit.clone();
    erased.callback(Box::new(move || h.set(true)));
    erased.errback(Box::new(|_| panic!("must not fail")));

    deferred.succeed("ignored".into());
    assert!(hit.get());
}

#[tokio::test(flavor = "current_thread")]
async fn test_await_inside_local_set() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let deferred: Deferred<u32> = Deferred::new();
            let settler = deferred.clone();
            tokio::task::spawn_local(async move {
                tokio::task::yield_now().await;
                settler.succeed(9);
            });
            assert_eq!(deferred.await.unwrap(), 9);
        })
        .await;
}
