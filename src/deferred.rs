//! 单次赋值的延迟结果。
//! A single-assignment deferred result.
//!
//! A [`Deferred`] starts out pending and is settled exactly once, either with
//! a value or with an [`Error`]. Success and failure callbacks fire in
//! registration order when it settles, or immediately when registered on an
//! already-settled result. It also implements [`Future`], so code running
//! inside a tokio `LocalSet` can simply `.await` it.
//!
//! [`Deferred`] 初始为待定状态，并且只会被完成一次（成功值或 [`Error`]）。
//! 完成时按注册顺序触发成功和失败回调；若在已完成的结果上注册，则立即触发。

use crate::{
    error::{Error, Result},
    reactor::EventLoop,
};
use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};
use tracing::{trace, warn};

enum State<T> {
    Pending,
    Succeeded(T),
    Failed(Error),
}

struct Inner<T> {
    state: State<T>,
    on_success: Vec<Box<dyn FnOnce(T)>>,
    on_failure: Vec<Box<dyn FnOnce(Error)>>,
    wakers: Vec<Waker>,
}

/// A single-settlement result with ordered success/failure callbacks.
///
/// Cloning a `Deferred` yields another handle to the same result.
///
/// 具有有序成功/失败回调的单次完成结果。克隆得到的是指向同一结果的另一个句柄。
pub struct Deferred<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.borrow().state {
            State::Pending => "pending",
            State::Succeeded(_) => "succeeded",
            State::Failed(_) => "failed",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<T: Clone + 'static> Deferred<T> {
    /// Creates a pending result.
    /// 创建一个待定的结果。
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                on_success: Vec::new(),
                on_failure: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    /// Creates a result that is already settled with `result`.
    /// 创建一个已经以 `result` 完成的结果。
    pub fn settled(result: Result<T>) -> Self {
        let deferred = Self::new();
        deferred.settle(result);
        deferred
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, State::Pending)
    }

    /// Returns a copy of the outcome, or `None` while still pending.
    /// 返回结果的副本；若仍处于待定状态则返回 `None`。
    pub fn result(&self) -> Option<Result<T>> {
        match &self.inner.borrow().state {
            State::Pending => None,
            State::Succeeded(value) => Some(Ok(value.clone())),
            State::Failed(err) => Some(Err(err.clone())),
        }
    }

    /// Registers a success callback.
    /// 注册成功回调。
    pub fn on_success<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(T) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.state, State::Pending) {
            inner.on_success.push(Box::new(callback));
            return self;
        }
        let value = match &inner.state {
            State::Succeeded(value) => Some(value.clone()),
            _ => None,
        };
        drop(inner);
        if let Some(value) = value {
            callback(value);
        }
        self
    }

    /// Registers a failure callback.
    /// 注册失败回调。
    pub fn on_failure<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(Error) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.state, State::Pending) {
            inner.on_failure.push(Box::new(callback));
            return self;
        }
        let err = match &inner.state {
            State::Failed(err) => Some(err.clone()),
            _ => None,
        };
        drop(inner);
        if let Some(err) = err {
            callback(err);
        }
        self
    }

    /// Settles the result with `value`. Returns `false` if it was already settled.
    /// 以 `value` 完成结果。如果已经完成则返回 `false`。
    pub fn succeed(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settles the result with `err`. Returns `false` if it was already settled.
    /// 以 `err` 完成结果。如果已经完成则返回 `false`。
    pub fn fail(&self, err: Error) -> bool {
        self.settle(Err(err))
    }

    /// Settles the result. A second settlement is ignored and reported by a
    /// `false` return, the original outcome stays in place.
    ///
    /// 完成结果。第二次完成会被忽略并返回 `false`，原始结果保持不变。
    pub fn settle(&self, result: Result<T>) -> bool {
        let (on_success, on_failure, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                warn!(
                    attempted_ok = result.is_ok(),
                    "Ignoring attempt to settle an already settled deferred"
                );
                return false;
            }
            inner.state = match &result {
                Ok(value) => State::Succeeded(value.clone()),
                Err(err) => State::Failed(err.clone()),
            };
            (
                std::mem::take(&mut inner.on_success),
                std::mem::take(&mut inner.on_failure),
                std::mem::take(&mut inner.wakers),
            )
        };

        match result {
            Ok(value) => {
                trace!(callbacks = on_success.len(), "Deferred succeeded");
                for callback in on_success {
                    callback(value.clone());
                }
            }
            Err(err) => {
                trace!(callbacks = on_failure.len(), %err, "Deferred failed");
                for callback in on_failure {
                    callback(err.clone());
                }
            }
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Fails the result on the next loop iteration.
    /// 在下一次循环迭代中使结果失败。
    pub fn fail_next_tick(&self, reactor: &dyn EventLoop, err: Error) {
        let this = self.clone();
        reactor.next_tick(Box::new(move || {
            this.fail(err);
        }));
    }

    /// Runs `body` synchronously. On error the failure is scheduled for the
    /// next tick and `None` is returned; otherwise the body's value is
    /// returned unchanged.
    ///
    /// Failure is never observed synchronously, so a caller can register its
    /// handlers after this returns even when `body` failed immediately.
    ///
    /// 同步执行 `body`。出错时将失败安排在下一次tick并返回 `None`；否则原样返回其值。
    pub fn protect<R>(&self, reactor: &dyn EventLoop, body: impl FnOnce() -> Result<R>) -> Option<R> {
        match body() {
            Ok(value) => Some(value),
            Err(err) => {
                self.fail_next_tick(reactor, err);
                None
            }
        }
    }

    /// Like [`protect`](Self::protect), but on success also schedules
    /// `succeed(value)` for the next tick and returns the value to the caller.
    ///
    /// 与 [`protect`](Self::protect) 相同，但成功时还会在下一次tick安排 `succeed(value)`，
    /// 并把该值返回给调用者。
    pub fn protect_and_succeed(
        &self,
        reactor: &dyn EventLoop,
        body: impl FnOnce() -> Result<T>,
    ) -> Option<T> {
        let value = self.protect(reactor, body)?;
        let this = self.clone();
        let settled = value.clone();
        reactor.next_tick(Box::new(move || {
            this.succeed(settled);
        }));
        Some(value)
    }

    /// Returns a new result settled with `f(value)` on success, or with the
    /// same error on failure.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let mapped = Deferred::new();
        let on_ok = mapped.clone();
        let on_err = mapped.clone();
        self.on_success(move |value| {
            on_ok.succeed(f(value));
        });
        self.on_failure(move |err| {
            on_err.fail(err);
        });
        mapped
    }

    /// Waits for every result. Values keep the input order; the first failure
    /// fails the joined result.
    ///
    /// 等待所有结果。值保持输入顺序；第一个失败会使合并结果失败。
    pub fn join_all(items: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
        let joined = Deferred::new();
        if items.is_empty() {
            joined.succeed(Vec::new());
            return joined;
        }

        let slots: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new(vec![None; items.len()]));
        let remaining = Rc::new(Cell::new(items.len()));

        for (index, item) in items.into_iter().enumerate() {
            let on_ok = joined.clone();
            let slots = slots.clone();
            let remaining = remaining.clone();
            item.on_success(move |value| {
                slots.borrow_mut()[index] = Some(value);
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 && on_ok.is_pending() {
                    let values = slots.borrow_mut().drain(..).flatten().collect();
                    on_ok.succeed(values);
                }
            });

            let on_err = joined.clone();
            item.on_failure(move |err| {
                if on_err.is_pending() {
                    on_err.fail(err);
                }
            });
        }
        joined
    }
}

impl<T: Clone + 'static> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.state, State::Pending) {
            if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                inner.wakers.push(cx.waker().clone());
            }
            return Poll::Pending;
        }
        match &inner.state {
            State::Succeeded(value) => Poll::Ready(Ok(value.clone())),
            State::Failed(err) => Poll::Ready(Err(err.clone())),
            State::Pending => Poll::Pending,
        }
    }
}

/// Anything that exposes success and failure registration.
///
/// Recovery and connect hooks return a `Deferrable` when they need the client
/// to wait for their own asynchronous work before continuing. Every
/// [`Deferred`] is one, whatever its value type.
///
/// 任何提供成功与失败注册的对象。当恢复钩子或连接钩子需要客户端等待其自身的异步工作时，
/// 会返回一个 `Deferrable`。
pub trait Deferrable {
    /// Registers a callback run when the work succeeds; the value is discarded.
    fn callback(&self, callback: Box<dyn FnOnce()>);

    /// Registers a callback run when the work fails.
    fn errback(&self, errback: Box<dyn FnOnce(Error)>);
}

impl<T: Clone + 'static> Deferrable for Deferred<T> {
    fn callback(&self, callback: Box<dyn FnOnce()>) {
        self.on_success(move |_| callback());
    }

    fn errback(&self, errback: Box<dyn FnOnce(Error)>) {
        self.on_failure(move |err| errback(err));
    }
}

#[cfg(test)]
mod tests;
