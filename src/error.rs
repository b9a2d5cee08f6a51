//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use crate::driver::DriverError;
use std::sync::Arc;
use thiserror::Error;

/// The primary error type for the asynchronous client layer.
///
/// Errors are `Clone` because a single failure is delivered to every failure
/// callback registered on a [`Deferred`](crate::deferred::Deferred).
///
/// 异步客户端层的主要错误类型。
/// 错误类型实现了 `Clone`，因为同一个失败会被分发给 `Deferred` 上注册的每一个失败回调。
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A connection option was invalid or is no longer supported.
    /// 连接选项无效或已不再受支持。
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The underlying driver reported an error.
    /// 底层驱动报告了一个错误。
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A connect or reset finished but the connection is not healthy.
    /// 连接或重置已完成，但连接状态不健康。
    #[error("connection bad: {0}")]
    ConnectionBad(String),

    /// The connect or reset did not complete within `connect_timeout`.
    /// 连接或重置未能在 `connect_timeout` 内完成。
    #[error("timeout expired (async)")]
    ConnectTimeout,

    /// The query did not complete within `query_timeout`.
    /// 查询未能在 `query_timeout` 内完成。
    #[error("query timeout expired (async)")]
    QueryTimeout,

    /// A previous query timed out and its socket was closed; the connection
    /// must be reset before it can be used again.
    ///
    /// 之前的查询已超时且其套接字已被关闭；连接在再次使用前必须先重置。
    #[error("previous query expired, need connection reset")]
    CommandAborted,

    /// Another asynchronous operation is still watching this connection's socket.
    /// 另一个异步操作仍在监视此连接的套接字。
    #[error("another asynchronous operation is in progress on this connection")]
    OperationInProgress,

    /// The event loop failed to register interest in a descriptor.
    /// 事件循环无法注册对描述符的关注。
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An error raised by application code, typically a recovery hook.
    /// 由应用代码（通常是恢复钩子）产生的错误。
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Builds an application-defined error.
    pub fn custom(message: impl Into<String>) -> Self {
        Error::Custom(message.into())
    }

    /// Returns the driver error wrapped by this error, if any.
    pub fn as_driver_error(&self) -> Option<&DriverError> {
        match self {
            Error::Driver(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;
