//! 连接建立状态机，用于连接和重置。
//! The connection-establishment state machine, shared by connect and reset.

use crate::{
    client::{Client, ClientParts},
    config::AsyncOptions,
    deferred::{Deferrable, Deferred},
    driver::{Driver, PollStatus},
    error::Error,
    reactor::{Interest, TimerId, WatchId},
};
use std::{cell::Cell, rc::Rc};
use tracing::{debug, trace, warn};

/// Hook run after every successful connect or reset, with
/// `(client, is_async, is_reset)`.
///
/// Returning a [`Deferrable`] makes the client wait for it: the connect or
/// reset only succeeds once it succeeds, and fails with its error otherwise.
///
/// 每次成功连接或重置后运行的钩子。返回 [`Deferrable`] 会让客户端等待它完成。
pub type ConnectHook = Rc<dyn Fn(&Client, bool, bool) -> Option<Box<dyn Deferrable>>>;

/// Which driver primitive the state machine polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Establish {
    Connect,
    Reset,
}

impl Establish {
    fn poll(self, driver: &mut dyn Driver) -> PollStatus {
        match self {
            Establish::Connect => driver.connect_poll(),
            Establish::Reset => driver.reset_poll(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Establish::Connect => "connect",
            Establish::Reset => "reset",
        }
    }
}

/// Starts an asynchronous connect. Option errors and a failing
/// `connect_start` are reported through the returned result on the next tick.
///
/// 开始异步连接。选项错误和 `connect_start` 的失败都会在下一次tick通过返回的结果报告。
pub(crate) fn connect(parts: ClientParts) -> Deferred<Client> {
    let deferred = Deferred::new();
    let reactor = parts.reactor.clone();

    let client = deferred.protect(&*reactor, || {
        let (options, driver_params) = AsyncOptions::extract(&parts.params)?;
        let driver = parts.connector.connect_start(&driver_params)?;
        Ok(Client::from_parts(driver, parts.reactor, options, parts.classifier, parts.fetch))
    });

    if let Some(client) = client {
        ConnectWatcher::attach(client, deferred.clone(), Establish::Connect);
    }
    deferred
}

/// Starts an asynchronous reset of `client`.
/// 开始对 `client` 进行异步重置。
pub(crate) fn reset(client: &Client) -> Deferred<Client> {
    let deferred = Deferred::new();
    let reactor = client.reactor().clone();

    if client.is_watching() {
        deferred.fail_next_tick(&*reactor, Error::OperationInProgress);
        return deferred;
    }

    let started = deferred.protect(&*reactor, || {
        client.with_driver(|driver| driver.reset_start()).map_err(Error::from)
    });
    if started.is_some() {
        ConnectWatcher::attach(client.clone(), deferred.clone(), Establish::Reset);
    }
    deferred
}

struct ConnectWatcher {
    client: Client,
    deferred: Deferred<Client>,
    kind: Establish,
    watch: Cell<Option<WatchId>>,
    timer: Cell<Option<TimerId>>,
    done: Cell<bool>,
}

impl ConnectWatcher {
    fn attach(client: Client, deferred: Deferred<Client>, kind: Establish) {
        let reactor = client.reactor().clone();
        let fd = client.socket();
        let timeout = client.connect_timeout();

        let watcher = Rc::new(ConnectWatcher {
            client,
            deferred,
            kind,
            watch: Cell::new(None),
            timer: Cell::new(None),
            done: Cell::new(false),
        });

        if !timeout.is_zero() {
            let on_timeout = watcher.clone();
            let id = reactor.add_timer(timeout, Box::new(move || on_timeout.on_timeout()));
            watcher.timer.set(Some(id));
        }

        let on_ready = watcher.clone();
        match reactor.watch(fd, Interest::Writable, Box::new(move |_| on_ready.on_ready())) {
            Ok(id) => {
                watcher.watch.set(Some(id));
                watcher.client.set_watching(true);
                debug!(
                    fd,
                    kind = kind.name(),
                    timeout = ?timeout,
                    "Watching connection establishment"
                );
            }
            Err(err) => {
                watcher.done.set(true);
                if let Some(timer) = watcher.timer.take() {
                    reactor.cancel_timer(timer);
                }
                warn!(fd, kind = kind.name(), %err, "Failed to watch socket");
                watcher.deferred.fail_next_tick(&*reactor, err);
            }
        }
    }

    fn on_ready(&self) {
        if self.done.get() {
            return;
        }
        let status = self.client.with_driver(|driver| self.kind.poll(driver));
        trace!(kind = self.kind.name(), ?status, "Poll step");

        let reactor = self.client.reactor();
        match status {
            PollStatus::Reading => {
                if let Some(id) = self.watch.get() {
                    reactor.set_interest(id, Interest::Readable);
                }
            }
            PollStatus::Writing => {
                if let Some(id) = self.watch.get() {
                    reactor.set_interest(id, Interest::Writable);
                }
            }
            PollStatus::Ok | PollStatus::Failed => {
                self.stop();
                self.complete();
            }
        }
    }

    fn on_timeout(&self) {
        if self.done.get() {
            return;
        }
        // The timer has fired, there is nothing left to cancel.
        self.timer.set(None);
        self.stop();
        warn!(
            kind = self.kind.name(),
            timeout = ?self.client.connect_timeout(),
            "Connection establishment timed out"
        );
        self.deferred.fail(Error::ConnectTimeout);
    }

    fn stop(&self) {
        self.done.set(true);
        let reactor = self.client.reactor();
        if let Some(timer) = self.timer.take() {
            reactor.cancel_timer(timer);
        }
        if let Some(watch) = self.watch.take() {
            reactor.unwatch(watch);
        }
        self.client.set_watching(false);
    }

    fn complete(&self) {
        let reactor = self.client.reactor().clone();
        let client = &self.client;
        let is_reset = self.kind == Establish::Reset;

        let Some(hook) = client.on_connect() else {
            self.deferred.protect_and_succeed(&*reactor, || {
                client.check_established(is_reset)?;
                Ok(client.clone())
            });
            return;
        };

        if self
            .deferred
            .protect(&*reactor, || client.check_established(is_reset))
            .is_none()
        {
            return;
        }
        match hook(client, true, is_reset) {
            Some(pending) => {
                debug!(kind = self.kind.name(), "Waiting for on_connect hook");
                let on_ok = self.deferred.clone();
                let on_err = self.deferred.clone();
                let established = client.clone();
                pending.callback(Box::new(move || {
                    on_ok.succeed(established);
                }));
                pending.errback(Box::new(move |err| {
                    on_err.fail(err);
                }));
            }
            None => {
                self.deferred.protect_and_succeed(&*reactor, || Ok(client.clone()));
            }
        }
    }
}
