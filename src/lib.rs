#![deny(clippy::expect_used, clippy::unwrap_used)]

//! An asynchronous client layer over a blocking database driver.
//! 构建在阻塞式数据库驱动之上的异步客户端层。
//!
//! A [`Client`] drives connects, resets and queries from a single-threaded
//! event loop: each asynchronous call returns a pending [`Deferred`] right
//! away, and the socket-readiness state machines in [`engine`] settle it
//! later. When the event loop is not running, the same calls fall back to the
//! driver's blocking primitives.
//!
//! [`Client`] 在单线程事件循环中驱动连接、重置和查询：每个异步调用立即返回一个
//! 待定的 [`Deferred`]，随后由 [`engine`] 中基于套接字就绪的状态机完成它。
//! 当事件循环未运行时，相同的调用会回退到驱动的阻塞原语。

pub mod client;
pub mod config;
pub mod deferred;
pub mod driver;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod reactor;
pub mod testing;

pub use client::{Client, ClientBuilder};
pub use config::{AsyncOptions, ConnectParams, OptionKey, OptionValue};
pub use deferred::{Deferrable, Deferred};
pub use driver::{Command, Connector, Driver, DriverError, DriverErrorKind, QueryResult};
pub use engine::reconnect::RecoveryOutcome;
pub use error::{Error, Result};
pub use reactor::{EventLoop, Interest, Reactor, Readiness};
