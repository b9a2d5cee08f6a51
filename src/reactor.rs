//! 宿主事件循环的抽象接口。
//! The host event loop abstraction.
//!
//! The client never multiplexes I/O itself. It only asks the host loop to
//! watch a descriptor, arm one-shot timers and run callbacks on the next
//! iteration. Two implementations ship with the crate: [`TokioReactor`] for
//! production use inside a tokio `LocalSet` (see [`tokio_loop::run_local`]),
//! and [`ManualReactor`], a deterministic virtual-clock loop for tests.
//!
//! 客户端从不自行多路复用I/O，它只请求宿主循环监视描述符、设置一次性定时器以及在
//! 下一次迭代中运行回调。

use crate::error::Result;
use std::{fmt, os::fd::RawFd, rc::Rc, time::Duration};

pub mod manual;
pub mod tokio_loop;

pub use manual::ManualReactor;
pub use tokio_loop::TokioReactor;

/// The readiness a watch is currently interested in.
/// 监视当前关注的就绪类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// The readiness delivered to a watch handler.
/// 传递给监视处理器的就绪事件。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Writable,
}

impl Interest {
    pub(crate) fn readiness(self) -> Readiness {
        match self {
            Interest::Readable => Readiness::Readable,
            Interest::Writable => Readiness::Writable,
        }
    }
}

/// Identifies a descriptor watch registered with an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub(crate) u64);

/// Identifies a one-shot timer registered with an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Called each time a watched descriptor becomes ready.
pub type WatchHandler = Box<dyn FnMut(Readiness)>;

/// A callback run once by a timer or on the next loop iteration.
pub type Callback = Box<dyn FnOnce()>;

/// The primitives the client consumes from the host event loop.
///
/// All methods take `&self`: an implementation is shared through [`Reactor`]
/// and is re-entered from inside its own callbacks (a watch handler routinely
/// unwatches itself or arms a new timer), so implementations must never hold
/// an internal borrow while invoking a callback.
///
/// 客户端从宿主事件循环中使用的原语。
/// 所有方法都接受 `&self`：实现通过 [`Reactor`] 共享，并会在自身回调中被重入，
/// 因此实现在调用回调时绝不能持有内部借用。
pub trait EventLoop {
    /// Returns `true` while the loop is running and can deliver callbacks.
    /// 当循环正在运行并能够分发回调时返回 `true`。
    fn is_running(&self) -> bool;

    /// Starts watching `fd` for `interest`, calling `handler` on each readiness.
    /// 开始监视 `fd` 的 `interest` 就绪，每次就绪时调用 `handler`。
    fn watch(&self, fd: RawFd, interest: Interest, handler: WatchHandler) -> Result<WatchId>;

    /// Switches an existing watch to a different interest.
    /// 将现有监视切换到不同的关注类型。
    fn set_interest(&self, watch: WatchId, interest: Interest);

    /// Stops a watch. Unknown or already removed ids are ignored.
    /// 停止监视。未知或已移除的ID会被忽略。
    fn unwatch(&self, watch: WatchId);

    /// Arms a one-shot timer.
    /// 设置一次性定时器。
    fn add_timer(&self, after: Duration, callback: Callback) -> TimerId;

    /// Cancels a timer. Cancelling a fired or unknown timer is a no-op.
    /// 取消定时器。取消已触发或未知的定时器不做任何操作。
    fn cancel_timer(&self, timer: TimerId);

    /// Runs `callback` on the next loop iteration, after the current call stack unwinds.
    /// 在下一次循环迭代中（当前调用栈展开之后）运行 `callback`。
    fn next_tick(&self, callback: Callback);
}

/// A shared handle to the host event loop.
/// 宿主事件循环的共享句柄。
pub type Reactor = Rc<dyn EventLoop>;
