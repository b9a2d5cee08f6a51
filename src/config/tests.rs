//! Tests for connection parameters and async option extraction.

use super::*;
use crate::{
    client::Client,
    deferred::Deferrable,
    engine::reconnect::RecoveryOutcome,
};

fn recovery_hook() -> AutoreconnectHook {
    Rc::new(|_: &Client, _: &Error| RecoveryOutcome::Proceed)
}

fn connect_hook() -> ConnectHook {
    Rc::new(|_: &Client, _: bool, _: bool| -> Option<Box<dyn Deferrable>> { None })
}

#[test]
fn test_defaults_when_nothing_is_given() {
    let params = ConnectParams::new().with("dbname", "app");
    let (options, remaining) = AsyncOptions::extract(&params).unwrap();

    assert!(options.autoreconnect);
    assert_eq!(options.connect_timeout, Duration::ZERO);
    assert_eq!(options.query_timeout, Duration::ZERO);
    assert!(options.on_autoreconnect.is_none());
    assert!(options.on_connect.is_none());
    assert_eq!(remaining, params);
}

#[test]
fn test_recognized_keys_are_consumed_from_a_copy() {
    let hook = recovery_hook();
    let params = ConnectParams::new()
        .with(":async_autoreconnect", false)
        .with(":query_timeout", 1.5)
        .with("host", "db.local")
        .with(":on_autoreconnect", OptionValue::OnAutoreconnect(hook.clone()));
    let before = params.clone();

    let (options, remaining) = AsyncOptions::extract(&params).unwrap();

    assert_eq!(params, before, "caller's parameters must not change");
    assert!(!options.autoreconnect);
    assert_eq!(options.query_timeout, Duration::from_millis(1500));
    let stored = options.on_autoreconnect.unwrap();
    assert!(Rc::ptr_eq(&stored, &hook));

    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining.get("host"), Some(&OptionValue::from("db.local")));
    assert!(!remaining.contains("query_timeout"));
    assert!(!remaining.contains("async_autoreconnect"));
    assert!(!remaining.contains("on_autoreconnect"));
}

#[test]
fn test_symbol_and_text_keys_are_equivalent() {
    let symbol = ConnectParams::new().with(":query_timeout", 3);
    let text = ConnectParams::new().with("query_timeout", 3);

    let (a, _) = AsyncOptions::extract(&symbol).unwrap();
    let (b, _) = AsyncOptions::extract(&text).unwrap();
    assert_eq!(a.query_timeout, Duration::from_secs(3));
    assert_eq!(b.query_timeout, Duration::from_secs(3));
    assert_eq!(OptionKey::from(":x"), OptionKey::symbol("x"));
    assert_eq!(OptionKey::from("x"), OptionKey::text("x"));
    assert_eq!(OptionKey::symbol("x").to_string(), ":x");
}

#[test]
fn test_connect_timeout_is_read_and_passed_through() {
    let params = ConnectParams::new()
        .with(":connect_timeout", 4)
        .with("dbname", "app");
    let (options, remaining) = AsyncOptions::extract(&params).unwrap();

    assert_eq!(options.connect_timeout, Duration::from_secs(4));
    assert_eq!(remaining.get("connect_timeout"), Some(&OptionValue::Int(4)));
}

#[test]
fn test_boolean_forms() {
    for (value, expected) in [
        (OptionValue::from("off"), false),
        (OptionValue::from("YES"), true),
        (OptionValue::Int(0), false),
        (OptionValue::Bool(true), true),
    ] {
        let params = ConnectParams::new().with("async_autoreconnect", value);
        let (options, _) = AsyncOptions::extract(&params).unwrap();
        assert_eq!(options.autoreconnect, expected);
    }

    let params = ConnectParams::new().with("async_autoreconnect", "maybe");
    assert!(matches!(AsyncOptions::extract(&params), Err(Error::Config(_))));
}

#[test]
fn test_invalid_timeouts_are_rejected() {
    for value in [
        OptionValue::Float(-1.0),
        OptionValue::Float(f64::NAN),
        OptionValue::from("soon"),
        OptionValue::Bool(true),
        OptionValue::Float(1e30),
        OptionValue::from("1e20"),
    ] {
        let params = ConnectParams::new().with(":query_timeout", value);
        assert!(matches!(AsyncOptions::extract(&params), Err(Error::Config(_))));
    }

    // Too large for a Duration: reported, not a panic.
    let params = ConnectParams::new().with(":connect_timeout", 1e30);
    let err = AsyncOptions::extract(&params).unwrap_err();
    assert!(err.to_string().starts_with("invalid configuration: connect_timeout"));
}

#[test]
fn test_non_callable_hook_is_rejected() {
    let params = ConnectParams::new().with(":on_autoreconnect", "not a hook");
    let err = AsyncOptions::extract(&params).unwrap_err();
    assert!(err.to_string().contains("on_autoreconnect must respond to `call`"));

    let params = ConnectParams::new().with(":on_connect", 42);
    let err = AsyncOptions::extract(&params).unwrap_err();
    assert!(err.to_string().contains("on_connect must respond to `call`"));

    // A hook of the wrong kind is not callable for this key either.
    let params = ConnectParams::new().with(":on_connect", OptionValue::OnAutoreconnect(recovery_hook()));
    assert!(AsyncOptions::extract(&params).is_err());
}

#[test]
fn test_on_connect_hook_is_stored_verbatim() {
    let hook = connect_hook();
    let params = ConnectParams::new().with("on_connect", OptionValue::OnConnect(hook.clone()));
    let (options, remaining) = AsyncOptions::extract(&params).unwrap();
    assert!(Rc::ptr_eq(&options.on_connect.unwrap(), &hook));
    assert!(remaining.is_empty());
}

#[test]
fn test_on_reconnect_is_no_longer_supported() {
    let params = ConnectParams::new().with(":on_reconnect", OptionValue::OnAutoreconnect(recovery_hook()));
    let err = AsyncOptions::extract(&params).unwrap_err();
    assert!(err.to_string().contains("use on_autoreconnect"));
}

#[test]
fn test_insert_replaces_same_key_and_get_sees_last_entry() {
    let mut params = ConnectParams::new();
    params.insert("port", 5432);
    params.insert("port", 5433);
    assert_eq!(params.len(), 1);

    params.insert(":port", 6000);
    assert_eq!(params.len(), 2);
    assert_eq!(params.get("port"), Some(&OptionValue::Int(6000)));

    assert_eq!(params.remove("port"), Some(OptionValue::Int(6000)));
    assert!(params.is_empty());
}

#[test]
fn test_conninfo_parsing() {
    let params =
        ConnectParams::from_conninfo("host=localhost  port = 5432 password='it\\'s secret' dbname=''")
            .unwrap();
    assert_eq!(params.get("host"), Some(&OptionValue::from("localhost")));
    assert_eq!(params.get("port"), Some(&OptionValue::from("5432")));
    assert_eq!(params.get("password"), Some(&OptionValue::from("it's secret")));
    assert_eq!(params.get("dbname"), Some(&OptionValue::from("")));

    let rendered = params.to_conninfo();
    assert_eq!(ConnectParams::from_conninfo(&rendered).unwrap(), params);

    assert!(ConnectParams::from_conninfo("host").is_err());
    assert!(ConnectParams::from_conninfo("password='open").is_err());
}
