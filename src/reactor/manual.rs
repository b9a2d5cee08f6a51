//! 用于测试的确定性事件循环。
//! A deterministic event loop for tests.
//!
//! `ManualReactor` never touches the operating system. Readiness is level
//! triggered: every watch whose descriptor is not stalled receives one event
//! per [`turn`](ManualReactor::turn) for its current interest. Time is a
//! virtual clock that only moves through [`advance`](ManualReactor::advance),
//! so timeouts fire exactly when a test says so.
//!
//! `ManualReactor` 从不接触操作系统。就绪是电平触发的：每个未被暂停的描述符的监视在每次
//! `turn` 中都会针对当前关注类型收到一次事件。时间是只能通过 `advance` 推进的虚拟时钟。

use super::{Callback, EventLoop, Interest, TimerId, WatchHandler, WatchId};
use crate::error::Result;
use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashSet, VecDeque},
    os::fd::RawFd,
    rc::Rc,
    time::Duration,
};
use tracing::trace;

/// Upper bound on turns taken by [`ManualReactor::run_until_idle`].
const MAX_IDLE_TURNS: usize = 10_000;

struct WatchEntry {
    fd: RawFd,
    interest: Interest,
    // `None` while the handler is being invoked.
    handler: Option<WatchHandler>,
}

struct TimerEntry {
    deadline: Duration,
    callback: Callback,
}

#[derive(Default)]
struct State {
    now: Duration,
    next_id: u64,
    watches: BTreeMap<u64, WatchEntry>,
    timers: BTreeMap<u64, TimerEntry>,
    ticks: VecDeque<Callback>,
    stalled: HashSet<RawFd>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A virtual-clock, level-triggered event loop driven explicitly by tests.
/// 由测试显式驱动的虚拟时钟、电平触发事件循环。
pub struct ManualReactor {
    state: RefCell<State>,
    running: Cell<bool>,
}

impl ManualReactor {
    /// Creates a running reactor at virtual time zero.
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(State::default()),
            running: Cell::new(true),
        })
    }

    /// Marks the loop as running or stopped, which flips the client's
    /// dual-mode dispatch between the asynchronous and blocking paths.
    pub fn set_running(&self, running: bool) {
        self.running.set(running);
    }

    /// The current virtual time.
    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    /// Moves the virtual clock forward. Timers fire on the next turn.
    /// 推进虚拟时钟。定时器会在下一次 turn 中触发。
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.borrow_mut();
        state.now = state.now.saturating_add(by);
    }

    /// Stops delivering readiness for `fd`, simulating a peer that went silent.
    /// 停止为 `fd` 分发就绪事件，模拟一个沉默的对端。
    pub fn stall(&self, fd: RawFd) {
        self.state.borrow_mut().stalled.insert(fd);
    }

    pub fn unstall(&self, fd: RawFd) {
        self.state.borrow_mut().stalled.remove(&fd);
    }

    pub fn watch_count(&self) -> usize {
        self.state.borrow().watches.len()
    }

    pub fn timer_count(&self) -> usize {
        self.state.borrow().timers.len()
    }

    /// Returns the interest of the watch on `fd`, if any.
    pub fn interest_of(&self, fd: RawFd) -> Option<Interest> {
        self.state
            .borrow()
            .watches
            .values()
            .find(|w| w.fd == fd)
            .map(|w| w.interest)
    }

    /// Runs one loop iteration: callbacks queued before the turn started,
    /// then one readiness event per ready watch, then due timers in deadline
    /// order. Returns the number of callbacks invoked.
    ///
    /// 执行一次循环迭代：先运行本轮开始前排队的回调，然后为每个就绪的监视分发一次事件，
    /// 最后按截止时间顺序触发到期定时器。返回调用的回调数量。
    pub fn turn(&self) -> usize {
        let mut dispatched = 0;

        let ticks = std::mem::take(&mut self.state.borrow_mut().ticks);
        for tick in ticks {
            tick();
            dispatched += 1;
        }

        let ids: Vec<u64> = self.state.borrow().watches.keys().copied().collect();
        for id in ids {
            let taken = {
                let mut state = self.state.borrow_mut();
                let State {
                    watches, stalled, ..
                } = &mut *state;
                match watches.get_mut(&id) {
                    Some(entry) if !stalled.contains(&entry.fd) => entry
                        .handler
                        .take()
                        .map(|handler| (handler, entry.interest, entry.fd)),
                    _ => None,
                }
            };
            let Some((mut handler, interest, fd)) = taken else {
                continue;
            };
            trace!(fd, ?interest, "Delivering readiness");
            handler(interest.readiness());
            dispatched += 1;
            // The handler may have unwatched itself; only restore live entries.
            if let Some(entry) = self.state.borrow_mut().watches.get_mut(&id) {
                entry.handler = Some(handler);
            }
        }

        loop {
            let due = {
                let mut state = self.state.borrow_mut();
                let now = state.now;
                let next = state
                    .timers
                    .iter()
                    .filter(|(_, t)| t.deadline <= now)
                    .min_by_key(|(id, t)| (t.deadline, **id))
                    .map(|(id, _)| *id);
                next.and_then(|id| state.timers.remove(&id))
            };
            match due {
                Some(timer) => {
                    (timer.callback)();
                    dispatched += 1;
                }
                None => break,
            }
        }

        dispatched
    }

    /// Turns until an iteration dispatches nothing. Returns the number of turns taken.
    /// 持续执行 turn 直到某次迭代没有分发任何回调。返回执行的 turn 次数。
    pub fn run_until_idle(&self) -> usize {
        let mut turns = 0;
        while turns < MAX_IDLE_TURNS {
            turns += 1;
            if self.turn() == 0 {
                break;
            }
        }
        turns
    }

    /// Turns until `done` returns `true` or the loop goes idle. Returns `done()`.
    pub fn run_until(&self, mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..MAX_IDLE_TURNS {
            if done() {
                return true;
            }
            if self.turn() == 0 {
                break;
            }
        }
        done()
    }
}

impl EventLoop for ManualReactor {
    fn is_running(&self) -> bool {
        self.running.get()
    }

    fn watch(&self, fd: RawFd, interest: Interest, handler: WatchHandler) -> Result<WatchId> {
        let mut state = self.state.borrow_mut();
        let id = state.next_id();
        state.watches.insert(
            id,
            WatchEntry {
                fd,
                interest,
                handler: Some(handler),
            },
        );
        trace!(fd, ?interest, id, "Watch registered");
        Ok(WatchId(id))
    }

    fn set_interest(&self, watch: WatchId, interest: Interest) {
        if let Some(entry) = self.state.borrow_mut().watches.get_mut(&watch.0) {
            entry.interest = interest;
        }
    }

    fn unwatch(&self, watch: WatchId) {
        self.state.borrow_mut().watches.remove(&watch.0);
    }

    fn add_timer(&self, after: Duration, callback: Callback) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = state.next_id();
        let deadline = state.now.saturating_add(after);
        state.timers.insert(id, TimerEntry { deadline, callback });
        TimerId(id)
    }

    fn cancel_timer(&self, timer: TimerId) {
        self.state.borrow_mut().timers.remove(&timer.0);
    }

    fn next_tick(&self, callback: Callback) {
        self.state.borrow_mut().ticks.push_back(callback);
    }
}
