//! 基于 tokio `LocalSet` 的事件循环适配器。
//! An event loop adapter over a tokio `LocalSet`.
//!
//! Every watch, timer and tick becomes a local task, so the reactor only
//! reports itself running while a [`tokio::task::LocalSet`] entered through
//! [`run_local`] or [`entered`] is being polled on this thread. Outside of
//! one, `is_running` is `false` and the client falls back to blocking calls.
//!
//! Each watch registers its own duplicate of the descriptor with
//! [`tokio::io::unix::AsyncFd`], so a new watch on the same socket can be
//! added from inside a handler while the previous one is still being torn
//! down. The driver keeps owning the original socket.
//!
//! 每个监视、定时器和tick都是一个本地任务，因此只有在本线程上通过 [`run_local`] 或
//! [`entered`] 进入的 `LocalSet` 正在被轮询时，反应器才报告自己正在运行；否则客户端
//! 回退到阻塞调用。每个监视都向 `AsyncFd` 注册描述符的一个副本；驱动仍然拥有原始套接字。

use super::{Callback, EventLoop, Interest, Readiness, TimerId, WatchHandler, WatchId};
use crate::error::Result;
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    future::Future,
    os::fd::{AsRawFd, RawFd},
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{self, unix::AsyncFd},
    sync::Notify,
    task::{self, AbortHandle, LocalSet},
};
use tracing::{debug, trace, warn};

thread_local! {
    static LOCAL_SET_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Raised for the duration of one poll of an entered `LocalSet`.
struct LocalSetScope;

impl LocalSetScope {
    fn enter() -> Self {
        LOCAL_SET_DEPTH.with(|depth| depth.set(depth.get() + 1));
        LocalSetScope
    }

    fn active() -> bool {
        LOCAL_SET_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl Drop for LocalSetScope {
    fn drop(&mut self) {
        LOCAL_SET_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// A future that drives a `LocalSet`, see [`entered`].
/// 驱动 `LocalSet` 的 future，参见 [`entered`]。
#[must_use = "futures do nothing unless polled"]
pub struct Entered<F: Future> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Entered<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _scope = LocalSetScope::enter();
        self.inner.as_mut().poll(cx)
    }
}

/// Marks `future` as the driver of a `LocalSet`, usually `local.run_until(..)`.
///
/// While it is being polled, every [`TokioReactor`] on this thread reports
/// itself running. Wrapping anything that does not drive a `LocalSet` makes
/// the reactor spawn local tasks where none can run.
///
/// 将 `future` 标记为 `LocalSet` 的驱动者（通常是 `local.run_until(..)`）。
pub fn entered<F: Future>(future: F) -> Entered<F> {
    Entered {
        inner: Box::pin(future),
    }
}

/// Runs `future` to completion on a fresh, entered `LocalSet`.
/// 在一个新的、已进入的 `LocalSet` 上运行 `future` 直至完成。
pub async fn run_local<F: Future>(future: F) -> F::Output {
    let local = LocalSet::new();
    entered(local.run_until(future)).await
}

struct WatchTask {
    interest: Rc<Cell<Interest>>,
    interest_changed: Rc<Notify>,
    cancelled: Rc<Cell<bool>>,
    abort: AbortHandle,
}

#[derive(Default)]
struct Registry {
    next_id: Cell<u64>,
    watches: RefCell<HashMap<u64, WatchTask>>,
    timers: RefCell<HashMap<u64, AbortHandle>>,
}

impl Registry {
    fn next_id(&self) -> u64 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        id
    }
}

/// An [`EventLoop`] running on the current tokio `LocalSet`.
/// 运行在当前 tokio `LocalSet` 上的 [`EventLoop`]。
#[derive(Default)]
pub struct TokioReactor {
    registry: Rc<Registry>,
}

impl TokioReactor {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }
}

impl EventLoop for TokioReactor {
    fn is_running(&self) -> bool {
        LocalSetScope::active() && tokio::runtime::Handle::try_current().is_ok()
    }

    fn watch(&self, fd: RawFd, interest: Interest, mut handler: WatchHandler) -> Result<WatchId> {
        let async_fd = AsyncFd::with_interest(duplicate(fd)?, io::Interest::READABLE | io::Interest::WRITABLE)?;
        let id = self.registry.next_id();

        let current = Rc::new(Cell::new(interest));
        let interest_changed = Rc::new(Notify::new());
        let cancelled = Rc::new(Cell::new(false));

        let task_interest = current.clone();
        let task_changed = interest_changed.clone();
        let task_cancelled = cancelled.clone();
        let join = task::spawn_local(async move {
            loop {
                if task_cancelled.get() {
                    break;
                }
                let ready = match task_interest.get() {
                    Interest::Readable => tokio::select! {
                        guard = async_fd.readable() => guard.map(|mut guard| {
                            // The driver drains the socket on every readable event.
                            guard.clear_ready();
                            Readiness::Readable
                        }),
                        _ = task_changed.notified() => continue,
                    },
                    // Writable readiness is retained: the driver only asks for
                    // it while it still has bytes to flush.
                    Interest::Writable => tokio::select! {
                        guard = async_fd.writable() => guard.map(|_| Readiness::Writable),
                        _ = task_changed.notified() => continue,
                    },
                };
                match ready {
                    Ok(readiness) if !task_cancelled.get() => {
                        trace!(fd, ?readiness, "Descriptor ready");
                        handler(readiness);
                    }
                    Ok(_) => break,
                    Err(e) => {
                        warn!(fd, error = %e, "Readiness polling failed, dropping watch");
                        break;
                    }
                }
                // Let other local tasks run between consecutive events.
                task::yield_now().await;
            }
        });

        self.registry.watches.borrow_mut().insert(
            id,
            WatchTask {
                interest: current,
                interest_changed,
                cancelled,
                abort: join.abort_handle(),
            },
        );
        debug!(fd, ?interest, id, "Watching descriptor");
        Ok(WatchId(id))
    }

    fn set_interest(&self, watch: WatchId, interest: Interest) {
        if let Some(task) = self.registry.watches.borrow().get(&watch.0) {
            if task.interest.get() != interest {
                task.interest.set(interest);
                task.interest_changed.notify_one();
            }
        }
    }

    fn unwatch(&self, watch: WatchId) {
        let removed = self.registry.watches.borrow_mut().remove(&watch.0);
        if let Some(task) = removed {
            task.cancelled.set(true);
            task.abort.abort();
            trace!(id = watch.0, "Watch removed");
        }
    }

    fn add_timer(&self, after: Duration, callback: Callback) -> TimerId {
        let id = self.registry.next_id();
        let registry = Rc::downgrade(&self.registry);
        let join = task::spawn_local(async move {
            tokio::time::sleep(after).await;
            // A timer removed from the registry has been cancelled.
            let live = registry
                .upgrade()
                .is_some_and(|r| r.timers.borrow_mut().remove(&id).is_some());
            if live {
                callback();
            }
        });
        self.registry.timers.borrow_mut().insert(id, join.abort_handle());
        TimerId(id)
    }

    fn cancel_timer(&self, timer: TimerId) {
        let removed = self.registry.timers.borrow_mut().remove(&timer.0);
        if let Some(abort) = removed {
            abort.abort();
        }
    }

    fn next_tick(&self, callback: Callback) {
        task::spawn_local(async move {
            callback();
        });
    }
}

/// A private copy of a driver-owned descriptor, closed when the watch ends.
struct Duplicate(RawFd);

impl AsRawFd for Duplicate {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for Duplicate {
    fn drop(&mut self) {
        if let Err(errno) = nix::unistd::close(self.0) {
            warn!(fd = self.0, %errno, "Closing watch descriptor failed");
        }
    }
}

fn duplicate(fd: RawFd) -> std::io::Result<Duplicate> {
    if fd < 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cannot watch descriptor {fd}"),
        ));
    }
    let copy = nix::unistd::dup(fd).map_err(std::io::Error::from)?;
    Ok(Duplicate(copy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Write, os::unix::net::UnixStream};

    #[tokio::test]
    async fn test_not_running_without_local_set() {
        let reactor = TokioReactor::new();
        assert!(!reactor.is_running());

        // A bare LocalSet is not enough, it has to be entered.
        LocalSet::new()
            .run_until(async { assert!(!reactor.is_running()) })
            .await;

        let local = LocalSet::new();
        entered(local.run_until(async { assert!(reactor.is_running()) })).await;
        assert!(!reactor.is_running());
    }

    #[test]
    fn test_not_running_without_runtime() {
        assert!(!TokioReactor::new().is_running());
    }

    #[tokio::test]
    async fn test_running_inside_spawned_local_tasks() {
        run_local(async {
            let handle = task::spawn_local(async { TokioReactor::new().is_running() });
            assert!(handle.await.unwrap());
        })
        .await;
    }

    #[tokio::test]
    async fn test_readable_watch_fires_when_peer_writes() {
        run_local(async {
            let reactor = TokioReactor::new();
            let (local, mut peer) = UnixStream::pair().unwrap();
            local.set_nonblocking(true).unwrap();

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let id = reactor
                .watch(
                    local.as_raw_fd(),
                    Interest::Readable,
                    Box::new(move |readiness| {
                        let _ = tx.send(readiness);
                    }),
                )
                .unwrap();

            peer.write_all(b"x").unwrap();
            let readiness = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("watch should fire")
                .unwrap();
            assert_eq!(readiness, Readiness::Readable);
            reactor.unwatch(id);
        })
        .await;
    }

    #[tokio::test]
    async fn test_second_watch_on_same_descriptor() {
        run_local(async {
            let reactor = TokioReactor::new();
            let (local, mut peer) = UnixStream::pair().unwrap();
            local.set_nonblocking(true).unwrap();

            let first = reactor
                .watch(local.as_raw_fd(), Interest::Readable, Box::new(|_| {}))
                .unwrap();
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let second = reactor
                .watch(
                    local.as_raw_fd(),
                    Interest::Readable,
                    Box::new(move |readiness| {
                        let _ = tx.send(readiness);
                    }),
                )
                .unwrap();
            reactor.unwatch(first);

            peer.write_all(b"x").unwrap();
            let readiness = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("second watch should fire")
                .unwrap();
            assert_eq!(readiness, Readiness::Readable);
            reactor.unwatch(second);
        })
        .await;
    }

    #[tokio::test]
    async fn test_watch_rejects_closed_descriptor() {
        run_local(async {
            let reactor = TokioReactor::new();
            assert!(reactor.watch(-1, Interest::Readable, Box::new(|_| {})).is_err());
        })
        .await;
    }

    #[tokio::test]
    async fn test_writable_interest_switch() {
        run_local(async {
            let reactor = TokioReactor::new();
            let (local, _peer) = UnixStream::pair().unwrap();
            local.set_nonblocking(true).unwrap();

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let id = reactor
                .watch(
                    local.as_raw_fd(),
                    Interest::Readable,
                    Box::new(move |readiness| {
                        let _ = tx.send(readiness);
                    }),
                )
                .unwrap();
            reactor.set_interest(id, Interest::Writable);

            let readiness = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("writable event expected")
                .unwrap();
            assert_eq!(readiness, Readiness::Writable);
            reactor.unwatch(id);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_cancelled_timer_does_not() {
        run_local(async {
            let reactor = TokioReactor::new();
            let fired = Rc::new(RefCell::new(Vec::new()));

            let f = fired.clone();
            reactor.add_timer(Duration::from_millis(50), Box::new(move || f.borrow_mut().push(1)));
            let f = fired.clone();
            let cancelled =
                reactor.add_timer(Duration::from_millis(10), Box::new(move || f.borrow_mut().push(2)));
            reactor.cancel_timer(cancelled);

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(*fired.borrow(), vec![1]);
        })
        .await;
    }

    #[tokio::test]
    async fn test_next_tick_runs_after_current_stack() {
        run_local(async {
            let reactor = TokioReactor::new();
            assert!(reactor.is_running());
            let hit = Rc::new(Cell::new(false));
            let h = hit.clone();
            reactor.next_tick(Box::new(move || h.set(true)));
            assert!(!hit.get());
            task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert!(hit.get());
        })
        .await;
    }
}
