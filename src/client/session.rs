//! Per-connection mutable state.

use crate::{
    config::AsyncOptions,
    driver::TransactionStatus,
    engine::{connect::ConnectHook, reconnect::AutoreconnectHook},
};
use std::{
    cell::{Cell, RefCell},
    fmt,
    time::Duration,
};

pub(super) struct Session {
    pub(super) autoreconnect: Cell<bool>,
    pub(super) connect_timeout: Cell<Duration>,
    pub(super) query_timeout: Cell<Duration>,
    /// Set when a query timed out and its socket was closed.
    pub(super) command_aborted: Cell<bool>,
    /// Set while a connect, reset or query watcher is attached.
    pub(super) watching: Cell<bool>,
    /// Transaction status seen right before the last command was sent.
    pub(super) last_transaction: Cell<TransactionStatus>,
    pub(super) on_autoreconnect: RefCell<Option<AutoreconnectHook>>,
    pub(super) on_connect: RefCell<Option<ConnectHook>>,
}

impl Session {
    pub(super) fn new(options: AsyncOptions) -> Self {
        Self {
            autoreconnect: Cell::new(options.autoreconnect),
            connect_timeout: Cell::new(options.connect_timeout),
            query_timeout: Cell::new(options.query_timeout),
            command_aborted: Cell::new(false),
            watching: Cell::new(false),
            last_transaction: Cell::new(TransactionStatus::Idle),
            on_autoreconnect: RefCell::new(options.on_autoreconnect),
            on_connect: RefCell::new(options.on_connect),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("autoreconnect", &self.autoreconnect.get())
            .field("connect_timeout", &self.connect_timeout.get())
            .field("query_timeout", &self.query_timeout.get())
            .field("command_aborted", &self.command_aborted.get())
            .field("watching", &self.watching.get())
            .finish()
    }
}
