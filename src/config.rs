//! 定义了连接参数以及异步模式的可配置选项。
//! Defines connection parameters and the configurable async-mode options.
//!
//! Connection parameters are an ordered key/value list handed to the driver.
//! A handful of keys are understood by the client itself; [`AsyncOptions::extract`]
//! pulls them out of a copy of the caller's parameters and forwards the rest.
//! Keys may be spelled in symbol form (`:query_timeout`) or text form
//! (`query_timeout`); both are treated the same.
//!
//! 连接参数是交给驱动的有序键值列表。其中少数键由客户端自己理解；
//! [`AsyncOptions::extract`] 从调用者参数的副本中取出它们并转发其余部分。

use crate::{
    engine::{connect::ConnectHook, reconnect::AutoreconnectHook},
    error::{Error, Result},
};
use std::{fmt, rc::Rc, time::Duration};

/// Automatically reset the connection and retry when a query loses it.
pub const ASYNC_AUTORECONNECT: &str = "async_autoreconnect";
/// Seconds allowed for an asynchronous connect or reset. Also passed to the driver.
pub const CONNECT_TIMEOUT: &str = "connect_timeout";
/// Seconds allowed for an asynchronous query.
pub const QUERY_TIMEOUT: &str = "query_timeout";
/// Hook run after a successful auto-reconnect reset.
pub const ON_AUTORECONNECT: &str = "on_autoreconnect";
/// Hook run after every successful connect or reset.
pub const ON_CONNECT: &str = "on_connect";
/// The removed predecessor of `on_autoreconnect`.
const ON_RECONNECT: &str = "on_reconnect";

/// A parameter key, in either symbol or text form.
/// 参数键，可以是符号形式或文本形式。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OptionKey {
    Symbol(String),
    Text(String),
}

impl OptionKey {
    pub fn symbol(name: impl Into<String>) -> Self {
        OptionKey::Symbol(name.into())
    }

    pub fn text(name: impl Into<String>) -> Self {
        OptionKey::Text(name.into())
    }

    /// The bare key name, without the symbol sigil.
    pub fn name(&self) -> &str {
        match self {
            OptionKey::Symbol(name) | OptionKey::Text(name) => name,
        }
    }
}

/// `":name"` becomes a symbol key, anything else a text key.
impl From<&str> for OptionKey {
    fn from(key: &str) -> Self {
        match key.strip_prefix(':') {
            Some(name) => OptionKey::Symbol(name.to_string()),
            None => OptionKey::Text(key.to_string()),
        }
    }
}

impl From<String> for OptionKey {
    fn from(key: String) -> Self {
        OptionKey::from(key.as_str())
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionKey::Symbol(name) => write!(f, ":{name}"),
            OptionKey::Text(name) => f.write_str(name),
        }
    }
}

/// A parameter value.
/// 参数值。
#[derive(Clone)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    OnAutoreconnect(AutoreconnectHook),
    OnConnect(ConnectHook),
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "bool",
            OptionValue::Int(_) => "integer",
            OptionValue::Float(_) => "float",
            OptionValue::Text(_) => "text",
            OptionValue::OnAutoreconnect(_) => "on_autoreconnect hook",
            OptionValue::OnConnect(_) => "on_connect hook",
        }
    }

    /// The value rendered for a driver connection string, if it has one.
    pub fn as_conninfo_value(&self) -> Option<String> {
        match self {
            OptionValue::Bool(b) => Some(b.to_string()),
            OptionValue::Int(i) => Some(i.to_string()),
            OptionValue::Float(f) => Some(f.to_string()),
            OptionValue::Text(s) => Some(s.clone()),
            OptionValue::OnAutoreconnect(_) | OptionValue::OnConnect(_) => None,
        }
    }
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            OptionValue::Int(i) => f.debug_tuple("Int").field(i).finish(),
            OptionValue::Float(x) => f.debug_tuple("Float").field(x).finish(),
            OptionValue::Text(s) => f.debug_tuple("Text").field(s).finish(),
            OptionValue::OnAutoreconnect(_) => f.write_str("OnAutoreconnect(<hook>)"),
            OptionValue::OnConnect(_) => f.write_str("OnConnect(<hook>)"),
        }
    }
}

impl PartialEq for OptionValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OptionValue::Bool(a), OptionValue::Bool(b)) => a == b,
            (OptionValue::Int(a), OptionValue::Int(b)) => a == b,
            (OptionValue::Float(a), OptionValue::Float(b)) => a == b,
            (OptionValue::Text(a), OptionValue::Text(b)) => a == b,
            (OptionValue::OnAutoreconnect(a), OptionValue::OnAutoreconnect(b)) => Rc::ptr_eq(a, b),
            (OptionValue::OnConnect(a), OptionValue::OnConnect(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Int(i64::from(v))
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

/// An ordered list of connection parameters.
/// 有序的连接参数列表。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectParams {
    entries: Vec<(OptionKey, OptionValue)>,
}

impl ConnectParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<OptionKey>, value: impl Into<OptionValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Sets `key`, replacing an entry with exactly the same key.
    pub fn insert(&mut self, key: impl Into<OptionKey>, value: impl Into<OptionValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Looks up a value by bare name, whichever key form was used.
    /// The entry added last wins.
    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k.name() == name)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Removes every entry named `name`, returning the last value.
    pub fn remove(&mut self, name: &str) -> Option<OptionValue> {
        let mut removed = None;
        self.entries.retain(|(k, v)| {
            if k.name() == name {
                removed = Some(v.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OptionKey, &OptionValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Parses a libpq-style `key=value` connection string. Values may be
    /// single-quoted, with `\'` and `\\` escapes inside quotes.
    ///
    /// 解析 libpq 风格的 `key=value` 连接字符串。
    pub fn from_conninfo(conninfo: &str) -> Result<Self> {
        let mut params = Self::new();
        let mut chars = conninfo.chars().peekable();

        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
                key.push(c);
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.next() != Some('=') {
                return Err(Error::Config(format!(
                    "missing \"=\" after \"{key}\" in connection info string"
                )));
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}

            let mut value = String::new();
            if chars.next_if_eq(&'\'').is_some() {
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '\'' => {
                            closed = true;
                            break;
                        }
                        c => value.push(c),
                    }
                }
                if !closed {
                    return Err(Error::Config(
                        "unterminated quoted string in connection info string".into(),
                    ));
                }
            } else {
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    value.push(c);
                }
            }
            params.insert(OptionKey::Text(key), OptionValue::Text(value));
        }
        Ok(params)
    }

    /// Renders the scalar entries as a `key=value` connection string.
    pub fn to_conninfo(&self) -> String {
        self.entries
            .iter()
            .filter_map(|(k, v)| {
                let value = v.as_conninfo_value()?;
                let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
                Some(format!("{}='{}'", k.name(), escaped))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl<K: Into<OptionKey>, V: Into<OptionValue>> FromIterator<(K, V)> for ConnectParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// The async-mode options understood by the client itself.
///
/// 客户端自身理解的异步模式选项。
#[derive(Clone)]
pub struct AsyncOptions {
    /// Reset and retry when a query loses its connection. Default `true`.
    /// 当查询失去连接时重置并重试。默认 `true`。
    pub autoreconnect: bool,
    /// Zero means no limit.
    /// 零表示不限制。
    pub connect_timeout: Duration,
    /// Zero means no limit.
    /// 零表示不限制。
    pub query_timeout: Duration,
    pub on_autoreconnect: Option<AutoreconnectHook>,
    pub on_connect: Option<ConnectHook>,
}

impl Default for AsyncOptions {
    fn default() -> Self {
        Self {
            autoreconnect: true,
            connect_timeout: Duration::ZERO,
            query_timeout: Duration::ZERO,
            on_autoreconnect: None,
            on_connect: None,
        }
    }
}

impl fmt::Debug for AsyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOptions")
            .field("autoreconnect", &self.autoreconnect)
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .field("on_autoreconnect", &self.on_autoreconnect.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .finish()
    }
}

impl AsyncOptions {
    /// Separates the recognized options from `params`.
    ///
    /// Returns the parsed options and a copy of `params` without the consumed
    /// keys; `params` itself is left untouched. `connect_timeout` is read but
    /// also kept in the copy, since drivers honour it natively.
    ///
    /// 从 `params` 中分离出可识别的选项。返回解析后的选项以及去除了已消费键的 `params` 副本；
    /// `params` 本身保持不变。
    pub fn extract(params: &ConnectParams) -> Result<(AsyncOptions, ConnectParams)> {
        let mut options = AsyncOptions::default();
        let mut remaining = ConnectParams::new();

        for (key, value) in params.iter() {
            match key.name() {
                ASYNC_AUTORECONNECT => options.autoreconnect = parse_bool(key, value)?,
                CONNECT_TIMEOUT => {
                    options.connect_timeout = parse_seconds(key, value)?;
                    remaining.entries.push((key.clone(), value.clone()));
                }
                QUERY_TIMEOUT => options.query_timeout = parse_seconds(key, value)?,
                ON_AUTORECONNECT => match value {
                    OptionValue::OnAutoreconnect(hook) => options.on_autoreconnect = Some(hook.clone()),
                    other => return Err(not_callable(key, other)),
                },
                ON_CONNECT => match value {
                    OptionValue::OnConnect(hook) => options.on_connect = Some(hook.clone()),
                    other => return Err(not_callable(key, other)),
                },
                ON_RECONNECT => {
                    return Err(Error::Config(format!(
                        "{ON_RECONNECT} is no longer supported, use {ON_AUTORECONNECT}"
                    )));
                }
                _ => remaining.entries.push((key.clone(), value.clone())),
            }
        }
        Ok((options, remaining))
    }
}

fn not_callable(key: &OptionKey, value: &OptionValue) -> Error {
    Error::Config(format!(
        "{} must respond to `call`, got {}",
        key.name(),
        value.type_name()
    ))
}

fn parse_bool(key: &OptionKey, value: &OptionValue) -> Result<bool> {
    match value {
        OptionValue::Bool(b) => Ok(*b),
        OptionValue::Int(i) => Ok(*i != 0),
        OptionValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Ok(true),
            "false" | "off" | "no" | "0" => Ok(false),
            _ => Err(Error::Config(format!("{} expects a boolean, got {s:?}", key.name()))),
        },
        other => Err(Error::Config(format!(
            "{} expects a boolean, got {}",
            key.name(),
            other.type_name()
        ))),
    }
}

fn parse_seconds(key: &OptionKey, value: &OptionValue) -> Result<Duration> {
    let seconds = match value {
        OptionValue::Int(i) => *i as f64,
        OptionValue::Float(f) => *f,
        OptionValue::Text(s) => s.trim().parse::<f64>().map_err(|_| {
            Error::Config(format!("{} expects a number of seconds, got {s:?}", key.name()))
        })?,
        other => {
            return Err(Error::Config(format!(
                "{} expects a number of seconds, got {}",
                key.name(),
                other.type_name()
            )));
        }
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(Error::Config(format!(
            "{} must be a non-negative number of seconds, got {seconds}",
            key.name()
        )));
    }
    Duration::try_from_secs_f64(seconds).map_err(|e| Error::Config(format!("{}: {e}", key.name())))
}

#[cfg(test)]
mod tests;
