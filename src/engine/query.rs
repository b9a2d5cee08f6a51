//! 查询状态机。
//! The query state machine.
//!
//! A command is sent without waiting, then a [`QueryWatcher`] follows the
//! socket: every readable event consumes input, and once the driver is no
//! longer busy the configured fetch strategy produces the final result. An
//! optional timer aborts the command, closes the socket and marks the session
//! so the next command forces a reset.

use super::reconnect;
use crate::{
    client::Client,
    deferred::Deferred,
    driver::{Command, QueryResult},
    error::{Error, Result},
    reactor::{Interest, TimerId, WatchId},
};
use std::{cell::Cell, rc::Rc};
use tracing::{debug, trace, warn};

/// Re-sends the original command on the original deferred result.
pub(crate) type Retry = Rc<dyn Fn() -> Result<()>>;

/// Dispatches `command` on `client` asynchronously.
///
/// Failures to start are reported on the next tick. A connection-level start
/// failure (including an aborted session) goes through auto-reconnect.
///
/// 在 `client` 上异步分发 `command`。启动失败会在下一次tick报告；连接级别的启动失败
/// （包括已中止的会话）会进入自动重连流程。
pub(crate) fn execute(client: &Client, command: Command) -> Deferred<QueryResult> {
    let deferred = Deferred::new();
    let reactor = client.reactor().clone();
    let dispatch = Dispatch {
        client: client.clone(),
        command: Rc::new(command),
        deferred: deferred.clone(),
    };

    let started = if client.is_watching() {
        Err(Error::OperationInProgress)
    } else if client.is_command_aborted() {
        Err(Error::CommandAborted)
    } else {
        dispatch.send()
    };

    match started {
        Ok(()) => {}
        Err(err @ Error::OperationInProgress) => {
            warn!(command = dispatch.command.kind(), "Another operation is in flight");
            deferred.fail_next_tick(&*reactor, err);
        }
        Err(err) if client.is_connection_error(&err) => {
            debug!(command = dispatch.command.kind(), %err, "Start failed on the connection");
            let client = client.clone();
            let retry = dispatch.retry();
            reactor.next_tick(Box::new(move || {
                reconnect::recover(&client, &deferred, err, retry);
            }));
            return dispatch.deferred;
        }
        Err(err) => deferred.fail_next_tick(&*reactor, err),
    }
    dispatch.deferred
}

#[derive(Clone)]
struct Dispatch {
    client: Client,
    command: Rc<Command>,
    deferred: Deferred<QueryResult>,
}

impl Dispatch {
    fn send(&self) -> Result<()> {
        if self.client.is_watching() {
            return Err(Error::OperationInProgress);
        }
        self.client.with_driver(|driver| {
            self.client.record_transaction_status(driver.transaction_status());
            self.command.send(driver)
        })?;
        trace!(command = self.command.kind(), "Command sent");
        QueryWatcher::attach(self.clone())
    }

    fn retry(&self) -> Retry {
        let this = self.clone();
        Rc::new(move || this.send())
    }
}

struct QueryWatcher {
    dispatch: Dispatch,
    watch: Cell<Option<WatchId>>,
    timer: Cell<Option<TimerId>>,
    done: Cell<bool>,
}

impl QueryWatcher {
    fn attach(dispatch: Dispatch) -> Result<()> {
        let client = dispatch.client.clone();
        let reactor = client.reactor().clone();
        let fd = client.socket();
        let timeout = client.query_timeout();

        let watcher = Rc::new(QueryWatcher {
            dispatch,
            watch: Cell::new(None),
            timer: Cell::new(None),
            done: Cell::new(false),
        });

        let on_readable = watcher.clone();
        let id = reactor.watch(
            fd,
            Interest::Readable,
            Box::new(move |_| on_readable.on_readable()),
        )?;
        watcher.watch.set(Some(id));
        client.set_watching(true);

        if !timeout.is_zero() {
            let on_timeout = watcher.clone();
            let timer = reactor.add_timer(timeout, Box::new(move || on_timeout.on_timeout()));
            watcher.timer.set(Some(timer));
        }
        Ok(())
    }

    fn on_readable(&self) {
        if self.done.get() {
            return;
        }
        let client = &self.dispatch.client;
        let progress = client.with_driver(|driver| driver.consume_input().map(|()| driver.is_busy()));

        match progress {
            Ok(true) => trace!("Result still incomplete"),
            Ok(false) => {
                self.stop();
                match client.fetch_result() {
                    Ok(result) => {
                        debug!(
                            command = self.dispatch.command.kind(),
                            rows = result.len(),
                            "Command completed"
                        );
                        self.dispatch.deferred.succeed(result);
                    }
                    Err(err) => self.route(Error::Driver(err)),
                }
            }
            Err(err) => {
                self.stop();
                self.route(Error::Driver(err));
            }
        }
    }

    fn on_timeout(&self) {
        if self.done.get() {
            return;
        }
        self.timer.set(None);
        self.stop();

        let client = &self.dispatch.client;
        client.mark_command_aborted();
        client.with_driver(|driver| driver.close_socket());
        warn!(
            command = self.dispatch.command.kind(),
            timeout = ?client.query_timeout(),
            "Query timed out, socket closed"
        );
        self.dispatch.deferred.fail(Error::QueryTimeout);
    }

    fn route(&self, err: Error) {
        let client = &self.dispatch.client;
        if client.is_connection_error(&err) {
            reconnect::recover(client, &self.dispatch.deferred, err, self.dispatch.retry());
        } else {
            debug!(command = self.dispatch.command.kind(), %err, "Command failed");
            self.dispatch.deferred.fail(err);
        }
    }

    fn stop(&self) {
        self.done.set(true);
        let reactor = self.dispatch.client.reactor();
        if let Some(timer) = self.timer.take() {
            reactor.cancel_timer(timer);
        }
        if let Some(watch) = self.watch.take() {
            reactor.unwatch(watch);
        }
        self.dispatch.client.set_watching(false);
    }
}
