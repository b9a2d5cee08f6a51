//! 阻塞式数据库驱动的接口。
//! The interface of the blocking database driver.
//!
//! The client does not speak any wire protocol. It drives a driver that
//! exposes non-blocking polling primitives (`connect_poll`, `consume_input`,
//! `is_busy`, ...) next to ordinary blocking calls, the way libpq does.
//!
//! 客户端不实现任何线路协议。它驱动一个同时提供非阻塞轮询原语和普通阻塞调用的驱动，
//! 就像 libpq 那样。

use crate::config::ConnectParams;
use bytes::Bytes;
use std::{os::fd::RawFd, rc::Rc};
use thiserror::Error;

pub mod fetch;

pub use fetch::{BlockingLastResult, FetchResult, LastResult};

/// The outcome of one `connect_poll` / `reset_poll` step.
/// 一次 `connect_poll` / `reset_poll` 步骤的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Wait until the socket is readable, then poll again.
    Reading,
    /// Wait until the socket is writable, then poll again.
    Writing,
    Ok,
    Failed,
}

/// Connection health as reported by the driver.
/// 驱动报告的连接健康状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ok,
    Bad,
    /// A connect or reset is in progress.
    Started,
}

/// Transaction state of the session, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle,
    /// A command is in flight.
    Active,
    InTransaction,
    InError,
    Unknown,
}

impl TransactionStatus {
    /// Returns `true` if a transaction block was open.
    pub fn in_transaction(self) -> bool {
        matches!(
            self,
            TransactionStatus::Active | TransactionStatus::InTransaction | TransactionStatus::InError
        )
    }
}

/// Broad categories of driver failures.
/// 驱动失败的大致分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The connection to the server is broken.
    ConnectionBad,
    /// A command could not be sent to the server.
    UnableToSend,
    /// The server rejected a command (syntax error, constraint violation, ...).
    Server,
    /// The driver was called incorrectly.
    Usage,
}

/// An error reported by the driver.
/// 驱动报告的错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
    /// The five-character SQLSTATE code, when the server supplied one.
    pub sqlstate: Option<String>,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            sqlstate: None,
        }
    }

    pub fn connection_bad(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::ConnectionBad, message)
    }

    pub fn unable_to_send(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::UnableToSend, message)
    }

    /// A server-side error with its SQLSTATE.
    pub fn server(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Server,
            message: message.into(),
            sqlstate: Some(sqlstate.into()),
        }
    }
}

/// Decides whether a driver error means the connection itself is lost.
///
/// Only such errors are eligible for auto-reconnect; everything else is
/// surfaced to the caller unchanged.
///
/// 判断驱动错误是否意味着连接本身已丢失。只有此类错误才有资格自动重连。
pub type ErrorClassifier = Rc<dyn Fn(&DriverError) -> bool>;

/// The default classification: broken-connection and unable-to-send errors,
/// plus any SQLSTATE of class `08` (connection exception).
pub fn is_connection_error(err: &DriverError) -> bool {
    matches!(
        err.kind,
        DriverErrorKind::ConnectionBad | DriverErrorKind::UnableToSend
    ) || err.sqlstate.as_deref().is_some_and(|s| s.starts_with("08"))
}

/// A raw parameter value; `None` is SQL `NULL`.
pub type Param = Option<Bytes>;

/// One result row of raw field values; `None` is SQL `NULL`.
pub type Row = Vec<Option<Bytes>>;

/// The final result of a command.
/// 命令的最终结果。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Command completion tag, e.g. `SELECT 3`.
    pub command_tag: String,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, row: usize, column: usize) -> Option<&[u8]> {
        self.rows.get(row)?.get(column)?.as_deref()
    }

    /// Returns a field as UTF-8 text, if present and valid.
    pub fn text(&self, row: usize, column: usize) -> Option<&str> {
        std::str::from_utf8(self.get(row, column)?).ok()
    }
}

/// A blocking driver connection with non-blocking polling primitives.
///
/// 带有非阻塞轮询原语的阻塞式驱动连接。
pub trait Driver {
    /// Advances a non-blocking connect started by [`Connector::connect_start`].
    fn connect_poll(&mut self) -> PollStatus;

    /// Starts a non-blocking reset of this connection.
    fn reset_start(&mut self) -> Result<(), DriverError>;

    /// Advances a non-blocking reset started by `reset_start`.
    fn reset_poll(&mut self) -> PollStatus;

    /// Resets the connection, blocking until done.
    fn reset(&mut self) -> Result<(), DriverError>;

    fn status(&self) -> ConnStatus;

    fn transaction_status(&self) -> TransactionStatus;

    /// The last error message the driver produced.
    fn error_message(&self) -> String;

    /// The raw socket descriptor of the connection.
    fn socket(&self) -> RawFd;

    fn send_query(&mut self, sql: &str, params: &[Param]) -> Result<(), DriverError>;

    fn send_prepare(&mut self, name: &str, sql: &str) -> Result<(), DriverError>;

    fn send_query_prepared(&mut self, name: &str, params: &[Param]) -> Result<(), DriverError>;

    /// Reads whatever input is available on the socket without blocking.
    fn consume_input(&mut self) -> Result<(), DriverError>;

    /// Returns `true` while a command's result is still incomplete.
    fn is_busy(&self) -> bool;

    /// Collects the results of the current command and returns the last one.
    fn get_last_result(&mut self) -> Result<QueryResult, DriverError>;

    /// Blocks until the current command is no longer busy.
    fn block(&mut self) -> Result<(), DriverError>;

    fn exec(&mut self, sql: &str, params: &[Param]) -> Result<QueryResult, DriverError>;

    fn prepare(&mut self, name: &str, sql: &str) -> Result<QueryResult, DriverError>;

    fn exec_prepared(&mut self, name: &str, params: &[Param]) -> Result<QueryResult, DriverError>;

    /// Forcibly closes the socket. The connection stays unusable until reset.
    fn close_socket(&mut self);

    /// Closes the connection for good.
    fn finish(&mut self);
}

/// Opens driver connections.
/// 打开驱动连接。
pub trait Connector {
    /// Starts a non-blocking connect; continue with [`Driver::connect_poll`].
    fn connect_start(&self, params: &ConnectParams) -> Result<Box<dyn Driver>, DriverError>;

    /// Connects, blocking until the connection is established or has failed.
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Driver>, DriverError>;
}

/// One query-family command: a plain query, a prepare, or the execution of a
/// prepared statement.
///
/// The asynchronous and blocking paths dispatch every variant through the
/// same code; only the driver primitive differs.
///
/// 一个查询类命令：普通查询、预备语句或执行预备语句。异步和阻塞路径都通过同一段代码分发，
/// 只有驱动原语不同。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exec { sql: String, params: Vec<Param> },
    Prepare { name: String, sql: String },
    ExecPrepared { name: String, params: Vec<Param> },
}

impl Command {
    pub fn exec(sql: impl Into<String>, params: Vec<Param>) -> Self {
        Command::Exec {
            sql: sql.into(),
            params,
        }
    }

    pub fn prepare(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Command::Prepare {
            name: name.into(),
            sql: sql.into(),
        }
    }

    pub fn exec_prepared(name: impl Into<String>, params: Vec<Param>) -> Self {
        Command::ExecPrepared {
            name: name.into(),
            params,
        }
    }

    /// A short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Exec { .. } => "exec",
            Command::Prepare { .. } => "prepare",
            Command::ExecPrepared { .. } => "exec_prepared",
        }
    }

    /// Dispatches the command without waiting for its result.
    pub fn send(&self, driver: &mut dyn Driver) -> Result<(), DriverError> {
        match self {
            Command::Exec { sql, params } => driver.send_query(sql, params),
            Command::Prepare { name, sql } => driver.send_prepare(name, sql),
            Command::ExecPrepared { name, params } => driver.send_query_prepared(name, params),
        }
    }

    /// Runs the command with the driver's blocking call.
    pub fn run_blocking(&self, driver: &mut dyn Driver) -> Result<QueryResult, DriverError> {
        match self {
            Command::Exec { sql, params } => driver.exec(sql, params),
            Command::Prepare { name, sql } => driver.prepare(name, sql),
            Command::ExecPrepared { name, params } => driver.exec_prepared(name, params),
        }
    }
}

/// Builds a text parameter.
pub fn text_param(value: impl Into<String>) -> Param {
    Some(Bytes::from(value.into()))
}
