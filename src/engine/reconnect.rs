//! 自动重连编排器。
//! The auto-reconnect orchestrator.
//!
//! When a query fails on the connection itself, the client may reset the
//! connection, consult the `on_autoreconnect` hook and re-send the original
//! command on the caller's original deferred result. The caller never sees the
//! intermediate failure.
//!
//! 当查询因连接本身失败时，客户端可以重置连接、询问 `on_autoreconnect` 钩子，
//! 并在调用者原来的延迟结果上重新发送原命令。

use super::{connect, query::Retry};
use crate::{
    client::Client,
    deferred::{Deferrable, Deferred},
    driver::{ConnStatus, QueryResult},
    error::Error,
};
use std::{fmt, rc::Rc};
use tracing::{debug, info, warn};

/// What the `on_autoreconnect` hook wants done after a successful reset.
/// `on_autoreconnect` 钩子在成功重置后的决定。
pub enum RecoveryOutcome {
    /// Re-send the original command.
    Proceed,
    /// Do not retry; fail with the error that triggered the reset.
    Veto,
    /// Do not retry; fail with this error instead.
    Fail(Error),
    /// Wait for this to settle. Success re-sends the command, failure fails
    /// the original query with the pending result's error.
    Defer(Box<dyn Deferrable>),
}

impl RecoveryOutcome {
    pub fn defer<T: Clone + 'static>(pending: &Deferred<T>) -> Self {
        RecoveryOutcome::Defer(Box::new(pending.clone()))
    }
}

impl From<bool> for RecoveryOutcome {
    fn from(proceed: bool) -> Self {
        if proceed {
            RecoveryOutcome::Proceed
        } else {
            RecoveryOutcome::Veto
        }
    }
}

impl From<Error> for RecoveryOutcome {
    fn from(err: Error) -> Self {
        RecoveryOutcome::Fail(err)
    }
}

impl fmt::Debug for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryOutcome::Proceed => f.write_str("Proceed"),
            RecoveryOutcome::Veto => f.write_str("Veto"),
            RecoveryOutcome::Fail(err) => f.debug_tuple("Fail").field(err).finish(),
            RecoveryOutcome::Defer(_) => f.write_str("Defer(..)"),
        }
    }
}

/// Hook consulted after every successful automatic reset, with the client and
/// the error that triggered it.
pub type AutoreconnectHook = Rc<dyn Fn(&Client, &Error) -> RecoveryOutcome>;

/// Handles a connection-level failure of the query behind `deferred`.
///
/// Resets only when auto-reconnect is enabled and the session is actually
/// damaged (aborted, or the driver no longer reports `Ok`). Otherwise the
/// triggering error is surfaced on the next tick.
pub(crate) fn recover(client: &Client, deferred: &Deferred<QueryResult>, error: Error, retry: Retry) {
    let reactor = client.reactor().clone();
    let aborted = client.is_command_aborted();
    let healthy = client.status() == ConnStatus::Ok;

    if !client.autoreconnect() || (!aborted && healthy) {
        debug!(
            %error,
            autoreconnect = client.autoreconnect(),
            aborted,
            healthy,
            "Not eligible for auto-reconnect"
        );
        deferred.fail_next_tick(&*reactor, error);
        return;
    }

    let was_in_transaction = client.last_transaction_status().in_transaction();
    info!(%error, aborted, was_in_transaction, "Connection lost, resetting");

    let reset = connect::reset(client);
    let on_reset = deferred.clone();
    let on_failure = deferred.clone();
    reset.on_success(move |client| {
        after_reset(&client, &on_reset, error, retry, was_in_transaction);
    });
    reset.on_failure(move |err| {
        warn!(%err, "Reset after connection loss failed");
        on_failure.fail(err);
    });
}

fn after_reset(
    client: &Client,
    deferred: &Deferred<QueryResult>,
    error: Error,
    retry: Retry,
    was_in_transaction: bool,
) {
    let reactor = client.reactor().clone();
    let outcome = match client.on_autoreconnect() {
        Some(hook) => hook(client, &error),
        None => RecoveryOutcome::Proceed,
    };
    debug!(?outcome, "Connection reset");

    match outcome {
        RecoveryOutcome::Proceed => resend(client, deferred, error, &retry, was_in_transaction),
        RecoveryOutcome::Veto => deferred.fail_next_tick(&*reactor, error),
        RecoveryOutcome::Fail(err) => deferred.fail_next_tick(&*reactor, err),
        RecoveryOutcome::Defer(pending) => {
            let on_ok = deferred.clone();
            let on_err = deferred.clone();
            let client = client.clone();
            pending.callback(Box::new(move || {
                resend(&client, &on_ok, error, &retry, was_in_transaction);
            }));
            pending.errback(Box::new(move |err| {
                on_err.fail(err);
            }));
        }
    }
}

fn resend(
    client: &Client,
    deferred: &Deferred<QueryResult>,
    error: Error,
    retry: &Retry,
    was_in_transaction: bool,
) {
    let reactor = client.reactor().clone();
    if was_in_transaction {
        // The server rolled the transaction back with the old session.
        info!(%error, "Not re-sending a command from a lost transaction");
        deferred.fail_next_tick(&*reactor, error);
        return;
    }
    debug!("Re-sending command after reset");
    deferred.protect(&*reactor, || retry());
}
