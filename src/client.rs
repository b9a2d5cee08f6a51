//! 客户端门面：双模式查询、重置与连接。
//! The client facade: dual-mode queries, resets and connects.
//!
//! Every public operation comes in three flavours. The `_async` variant
//! always returns a pending [`Deferred`] settled by the event loop; the
//! `_blocking` variant uses the driver's blocking primitives; the plain
//! variant picks one of the two depending on whether the reactor is running,
//! and wraps a blocking outcome into an already-settled [`Deferred`].
//!
//! 每个公开操作都有三种形式：`_async` 总是返回由事件循环完成的待定 [`Deferred`]；
//! `_blocking` 使用驱动的阻塞原语；不带后缀的形式根据反应器是否在运行自动选择。

use crate::{
    config::{AsyncOptions, ConnectParams, OptionKey, OptionValue},
    deferred::Deferred,
    driver::{
        self, Command, ConnStatus, Connector, Driver, DriverError, ErrorClassifier, FetchResult,
        LastResult, Param, QueryResult, TransactionStatus,
    },
    engine::{
        connect::{self, ConnectHook},
        query,
        reconnect::{AutoreconnectHook, RecoveryOutcome},
    },
    error::{Error, Result},
    reactor::Reactor,
};
use std::{
    cell::RefCell,
    fmt,
    os::fd::RawFd,
    rc::Rc,
    time::Duration,
};
use tracing::{debug, info, warn};

mod session;


use session::Session;

/// A handle to one database connection driven by a host event loop.
///
/// Cloning is cheap and yields another handle to the same connection.
/// A client belongs to the thread that created it.
///
/// 由宿主事件循环驱动的单个数据库连接的句柄。克隆开销很小，得到的是同一连接的另一个句柄。
#[derive(Clone)]
pub struct Client {
    inner: Rc<ClientInner>,
}

struct ClientInner {
    driver: RefCell<Box<dyn Driver>>,
    reactor: Reactor,
    session: Session,
    classifier: ErrorClassifier,
    fetch: Rc<dyn FetchResult>,
}

/// Everything needed to create a client, gathered by [`ClientBuilder`].
pub(crate) struct ClientParts {
    pub(crate) reactor: Reactor,
    pub(crate) connector: Rc<dyn Connector>,
    pub(crate) params: ConnectParams,
    pub(crate) classifier: ErrorClassifier,
    pub(crate) fetch: Rc<dyn FetchResult>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("socket", &self.socket())
            .field("status", &self.status())
            .field("session", &self.inner.session)
            .finish()
    }
}

impl Client {
    /// Starts building a client that connects through `connector` and is
    /// driven by `reactor`.
    pub fn builder(reactor: Reactor, connector: Rc<dyn Connector>) -> ClientBuilder {
        ClientBuilder::new(reactor, connector)
    }

    pub(crate) fn from_parts(
        driver: Box<dyn Driver>,
        reactor: Reactor,
        options: AsyncOptions,
        classifier: ErrorClassifier,
        fetch: Rc<dyn FetchResult>,
    ) -> Self {
        Self {
            inner: Rc::new(ClientInner {
                driver: RefCell::new(driver),
                reactor,
                session: Session::new(options),
                classifier,
                fetch,
            }),
        }
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    /// Runs `f` with exclusive access to the driver.
    ///
    /// Must not be called re-entrantly, e.g. from inside `f`.
    pub fn with_driver<R>(&self, f: impl FnOnce(&mut dyn Driver) -> R) -> R {
        let mut driver = self.inner.driver.borrow_mut();
        f(driver.as_mut())
    }

    pub fn status(&self) -> ConnStatus {
        self.inner.driver.borrow().status()
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.inner.driver.borrow().transaction_status()
    }

    pub fn error_message(&self) -> String {
        self.inner.driver.borrow().error_message()
    }

    pub fn socket(&self) -> RawFd {
        self.inner.driver.borrow().socket()
    }

    pub fn autoreconnect(&self) -> bool {
        self.inner.session.autoreconnect.get()
    }

    pub fn set_autoreconnect(&self, enabled: bool) {
        self.inner.session.autoreconnect.set(enabled);
    }

    /// Timeout for connects and resets. Zero disables it.
    pub fn connect_timeout(&self) -> Duration {
        self.inner.session.connect_timeout.get()
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.inner.session.connect_timeout.set(timeout);
    }

    /// Timeout for each asynchronous command. Zero disables it.
    pub fn query_timeout(&self) -> Duration {
        self.inner.session.query_timeout.get()
    }

    pub fn set_query_timeout(&self, timeout: Duration) {
        self.inner.session.query_timeout.set(timeout);
    }

    pub fn on_autoreconnect(&self) -> Option<AutoreconnectHook> {
        self.inner.session.on_autoreconnect.borrow().clone()
    }

    pub fn set_on_autoreconnect(&self, hook: Option<AutoreconnectHook>) {
        *self.inner.session.on_autoreconnect.borrow_mut() = hook;
    }

    pub fn on_connect(&self) -> Option<ConnectHook> {
        self.inner.session.on_connect.borrow().clone()
    }

    pub fn set_on_connect(&self, hook: Option<ConnectHook>) {
        *self.inner.session.on_connect.borrow_mut() = hook;
    }

    /// `true` after a query timed out, until the next successful reset.
    /// 查询超时后为 `true`，直到下一次成功重置。
    pub fn is_command_aborted(&self) -> bool {
        self.inner.session.command_aborted.get()
    }

    /// `true` while an asynchronous operation is watching the socket.
    pub fn is_watching(&self) -> bool {
        self.inner.session.watching.get()
    }

    /// Whether `err` is a connection-level failure, as decided by the
    /// client's error classifier. An aborted session always is.
    pub fn is_connection_error(&self, err: &Error) -> bool {
        match err {
            Error::CommandAborted => true,
            Error::Driver(e) => (self.inner.classifier)(e),
            _ => false,
        }
    }

    pub(crate) fn set_watching(&self, watching: bool) {
        self.inner.session.watching.set(watching);
    }

    pub(crate) fn mark_command_aborted(&self) {
        self.inner.session.command_aborted.set(true);
    }

    pub(crate) fn record_transaction_status(&self, status: TransactionStatus) {
        self.inner.session.last_transaction.set(status);
    }

    /// Transaction status observed when the last command was dispatched.
    pub(crate) fn last_transaction_status(&self) -> TransactionStatus {
        self.inner.session.last_transaction.get()
    }

    pub(crate) fn fetch_result(&self) -> std::result::Result<QueryResult, DriverError> {
        let fetch = self.inner.fetch.clone();
        self.with_driver(|driver| fetch.fetch(driver))
    }

    /// Checks the driver after a connect or reset completed.
    /// A successful reset clears the aborted flag.
    pub(crate) fn check_established(&self, is_reset: bool) -> Result<()> {
        let status = self.status();
        if status != ConnStatus::Ok {
            let message = self.error_message();
            warn!(?status, %message, is_reset, "Connection not established");
            return Err(Error::ConnectionBad(message));
        }
        if is_reset {
            self.inner.session.command_aborted.set(false);
        }
        info!(fd = self.socket(), is_reset, "Connection established");
        Ok(())
    }

    fn run_on_connect_blocking(&self, is_reset: bool) {
        let Some(hook) = self.on_connect() else {
            return;
        };
        if let Some(pending) = hook(self, false, is_reset) {
            pending.errback(Box::new(move |err| {
                warn!(%err, is_reset, "on_connect hook failed in blocking mode");
            }));
        }
    }

    // --- Queries ---

    /// Runs `command` asynchronously when the reactor is running, blocking
    /// otherwise.
    pub fn execute(&self, command: Command) -> Deferred<QueryResult> {
        if self.inner.reactor.is_running() {
            self.execute_async(command)
        } else {
            Deferred::settled(self.execute_blocking(&command))
        }
    }

    /// Dispatches `command` and returns a pending result settled by the
    /// event loop.
    ///
    /// 分发 `command` 并返回一个由事件循环完成的待定结果。
    pub fn execute_async(&self, command: Command) -> Deferred<QueryResult> {
        query::execute(self, command)
    }

    /// Runs `command` with the driver's blocking call.
    ///
    /// Auto-reconnect applies as in the asynchronous path: on a
    /// connection-level failure of a damaged session the connection is reset,
    /// the `on_autoreconnect` hook is consulted and the command is retried
    /// once. A deferred hook outcome cannot be waited for and counts as
    /// proceeding.
    ///
    /// 使用驱动的阻塞调用执行 `command`。自动重连规则与异步路径相同。
    pub fn execute_blocking(&self, command: &Command) -> Result<QueryResult> {
        let err = match self.run_blocking_once(command) {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        let damaged = self.is_command_aborted() || self.status() != ConnStatus::Ok;
        if !self.is_connection_error(&err) || !self.autoreconnect() || !damaged {
            return Err(err);
        }

        let was_in_transaction = self.last_transaction_status().in_transaction();
        info!(%err, command = command.kind(), "Connection lost, resetting (blocking)");
        self.reset_blocking()?;

        if let Some(hook) = self.on_autoreconnect() {
            match hook(self, &err) {
                RecoveryOutcome::Proceed => {}
                RecoveryOutcome::Veto => return Err(err),
                RecoveryOutcome::Fail(other) => return Err(other),
                RecoveryOutcome::Defer(_) => {
                    debug!("Cannot wait on a deferred outcome while blocking, proceeding");
                }
            }
        }
        if was_in_transaction {
            info!(%err, "Not retrying a command from a lost transaction");
            return Err(err);
        }
        self.run_blocking_once(command)
    }

    fn run_blocking_once(&self, command: &Command) -> Result<QueryResult> {
        if self.is_command_aborted() {
            return Err(Error::CommandAborted);
        }
        self.with_driver(|driver| {
            self.record_transaction_status(driver.transaction_status());
            command.run_blocking(driver)
        })
        .map_err(Error::from)
    }

    pub fn exec(&self, sql: impl Into<String>, params: Vec<Param>) -> Deferred<QueryResult> {
        self.execute(Command::exec(sql, params))
    }

    pub fn exec_async(&self, sql: impl Into<String>, params: Vec<Param>) -> Deferred<QueryResult> {
        self.execute_async(Command::exec(sql, params))
    }

    pub fn exec_blocking(&self, sql: impl Into<String>, params: Vec<Param>) -> Result<QueryResult> {
        self.execute_blocking(&Command::exec(sql, params))
    }

    pub fn prepare(&self, name: impl Into<String>, sql: impl Into<String>) -> Deferred<QueryResult> {
        self.execute(Command::prepare(name, sql))
    }

    pub fn prepare_async(
        &self,
        name: impl Into<String>,
        sql: impl Into<String>,
    ) -> Deferred<QueryResult> {
        self.execute_async(Command::prepare(name, sql))
    }

    pub fn prepare_blocking(
        &self,
        name: impl Into<String>,
        sql: impl Into<String>,
    ) -> Result<QueryResult> {
        self.execute_blocking(&Command::prepare(name, sql))
    }

    pub fn exec_prepared(&self, name: impl Into<String>, params: Vec<Param>) -> Deferred<QueryResult> {
        self.execute(Command::exec_prepared(name, params))
    }

    pub fn exec_prepared_async(
        &self,
        name: impl Into<String>,
        params: Vec<Param>,
    ) -> Deferred<QueryResult> {
        self.execute_async(Command::exec_prepared(name, params))
    }

    pub fn exec_prepared_blocking(
        &self,
        name: impl Into<String>,
        params: Vec<Param>,
    ) -> Result<QueryResult> {
        self.execute_blocking(&Command::exec_prepared(name, params))
    }

    // --- Resets ---

    /// Resets the connection asynchronously when the reactor is running,
    /// blocking otherwise. Settles with this client.
    pub fn reset(&self) -> Deferred<Client> {
        if self.inner.reactor.is_running() {
            self.reset_async()
        } else {
            Deferred::settled(self.reset_blocking().map(|()| self.clone()))
        }
    }

    /// Starts a non-blocking reset. Fails with
    /// [`Error::OperationInProgress`] while another operation is in flight.
    ///
    /// 开始非阻塞重置。若另一个操作正在进行，则以 [`Error::OperationInProgress`] 失败。
    pub fn reset_async(&self) -> Deferred<Client> {
        connect::reset(self)
    }

    pub fn reset_blocking(&self) -> Result<()> {
        self.with_driver(|driver| driver.reset())?;
        self.check_established(true)?;
        self.run_on_connect_blocking(true);
        Ok(())
    }

    /// Closes the connection for good.
    pub fn finish(&self) {
        debug!(fd = self.socket(), "Finishing connection");
        self.with_driver(|driver| driver.finish());
    }
}

/// Builds and connects a [`Client`].
///
/// ```ignore
/// let client = Client::builder(reactor, connector)
///     .param(":async_autoreconnect", true)
///     .param(":query_timeout", 2.5)
///     .param("dbname", "app")
///     .connect_async();
/// ```
pub struct ClientBuilder {
    reactor: Reactor,
    connector: Rc<dyn Connector>,
    params: ConnectParams,
    classifier: ErrorClassifier,
    fetch: Rc<dyn FetchResult>,
}

impl ClientBuilder {
    pub fn new(reactor: Reactor, connector: Rc<dyn Connector>) -> Self {
        Self {
            reactor,
            connector,
            params: ConnectParams::new(),
            classifier: Rc::new(driver::is_connection_error),
            fetch: Rc::new(LastResult),
        }
    }

    /// Replaces the connection parameters.
    pub fn params(mut self, params: ConnectParams) -> Self {
        self.params = params;
        self
    }

    /// Adds one connection parameter.
    pub fn param(mut self, key: impl Into<OptionKey>, value: impl Into<OptionValue>) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Overrides which driver errors count as a lost connection.
    pub fn error_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&DriverError) -> bool + 'static,
    {
        self.classifier = Rc::new(classifier);
        self
    }

    /// Overrides how the final result is read once a command completes.
    pub fn fetch_strategy<F>(mut self, fetch: F) -> Self
    where
        F: FetchResult + 'static,
    {
        self.fetch = Rc::new(fetch);
        self
    }

    /// Connects asynchronously when the reactor is running, blocking otherwise.
    pub fn connect(self) -> Deferred<Client> {
        if self.reactor.is_running() {
            self.connect_async()
        } else {
            Deferred::settled(self.connect_blocking())
        }
    }

    /// Starts a non-blocking connect.
    ///
    /// Invalid options and a failing driver start are reported through the
    /// returned result on the next tick, never synchronously.
    pub fn connect_async(self) -> Deferred<Client> {
        connect::connect(self.into_parts())
    }

    pub fn connect_blocking(self) -> Result<Client> {
        let (options, driver_params) = AsyncOptions::extract(&self.params)?;
        let driver = self.connector.connect(&driver_params)?;
        let client = Client::from_parts(driver, self.reactor, options, self.classifier, self.fetch);
        client.check_established(false)?;
        client.run_on_connect_blocking(false);
        Ok(client)
    }

    fn into_parts(self) -> ClientParts {
        ClientParts {
            reactor: self.reactor,
            connector: self.connector,
            params: self.params,
            classifier: self.classifier,
            fetch: self.fetch,
        }
    }
}
