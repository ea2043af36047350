//! Future/Promise Primitive
//!
//! A single-settlement result cell with one subscriber pair, a blocking
//! wait usable only from awaitable scopes, and the fan-in/sequence
//! combinators the declaration engine is built on. Settlement and
//! subscription are each allowed exactly once; violations are reported to
//! the scheduler as fatal protocol errors and surfaced at a step tail
//! rather than raised into the offending call stack.

use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::scheduler::SchedHandle;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::task::Poll;

enum State<T> {
    Pending,
    Resolved(T),
    Failed(Error),
}

struct Subscriber<T> {
    ctx: Ctx,
    on_success: Box<dyn FnOnce(T)>,
    on_error: Box<dyn FnOnce(Error)>,
}

struct Inner<T> {
    state: State<T>,
    subscriber: Option<Subscriber<T>>,
    subscribed: bool,
    inline_success: bool,
    inline_error: bool,
    fail_fast: bool,
    sched: SchedHandle,
}

/// A promise for a value of type `T`.
///
/// Handles are cheap to clone and all refer to the same cell.
pub struct Promise<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: self.inner.clone(),
        }
    }
}

/// Settlement capability for a promise.
pub struct Settle<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Settle<T> {
    fn clone(&self) -> Self {
        Settle {
            inner: self.inner.clone(),
        }
    }
}

enum Fire<T> {
    None,
    Inline(Box<dyn FnOnce(T)>),
    Scheduled(Ctx, Box<dyn FnOnce(T)>),
}

impl<T: Clone + 'static> Promise<T> {
    /// Create a pending promise bound to a scheduler.
    pub fn pending(sched: &SchedHandle) -> Self {
        Promise {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                subscriber: None,
                subscribed: false,
                inline_success: false,
                inline_error: false,
                fail_fast: false,
                sched: sched.clone(),
            })),
        }
    }

    /// Create a promise and invoke `runner` synchronously with its
    /// settlement handle.
    pub fn new(sched: &SchedHandle, runner: impl FnOnce(Settle<T>)) -> Self {
        let promise = Promise::pending(sched);
        runner(promise.settle_handle());
        promise
    }

    /// The settlement capability for this promise.
    pub fn settle_handle(&self) -> Settle<T> {
        Settle {
            inner: self.inner.clone(),
        }
    }

    /// Whether the promise has settled either way.
    pub fn is_settled(&self) -> bool {
        !matches!(self.inner.borrow().state, State::Pending)
    }

    /// Snapshot of the settled outcome, if any.
    pub fn outcome(&self) -> Option<Result<T>> {
        match &self.inner.borrow().state {
            State::Pending => None,
            State::Resolved(value) => Some(Ok(value.clone())),
            State::Failed(error) => Some(Err(error.clone())),
        }
    }

    /// Run the success continuation inside the resolving call instead of
    /// scheduling it as a new task.
    pub fn run_success_inline(&self, inline: bool) {
        self.inner.borrow_mut().inline_success = inline;
    }

    /// Run the error continuation inside the rejecting call instead of
    /// scheduling it as a new task.
    pub fn run_error_inline(&self, inline: bool) {
        self.inner.borrow_mut().inline_error = inline;
    }

    /// Re-raise an unobserved failure as a fatal error instead of letting
    /// it accumulate silently.
    pub fn fail_fast(&self) {
        let report = {
            let mut inner = self.inner.borrow_mut();
            inner.fail_fast = true;
            match &inner.state {
                State::Failed(error) if !inner.subscribed => {
                    Some((error.clone(), inner.sched.clone()))
                }
                _ => None,
            }
        };
        if let Some((error, sched)) = report {
            sched.report_fatal(error);
        }
    }

    /// Attach the single subscriber pair.
    ///
    /// A second subscription is a fatal protocol error. If the promise has
    /// already settled the relevant continuation fires immediately,
    /// subject to the inline/scheduled flags; scheduled continuations
    /// become new tasks bound to `ctx`.
    pub fn then(
        &self,
        ctx: &Ctx,
        on_success: impl FnOnce(T) + 'static,
        on_error: impl FnOnce(Error) + 'static,
    ) {
        enum Action<T> {
            Stored,
            Success(T, bool),
            Failure(Error, bool),
        }

        let (action, sched) = {
            let mut inner = self.inner.borrow_mut();
            let sched = inner.sched.clone();
            if inner.subscribed {
                drop(inner);
                sched.report_fatal(Error::DoubleSubscription);
                return;
            }
            inner.subscribed = true;
            let action = match &inner.state {
                State::Pending => Action::Stored,
                State::Resolved(value) => Action::Success(value.clone(), inner.inline_success),
                State::Failed(error) => Action::Failure(error.clone(), inner.inline_error),
            };
            if matches!(action, Action::Stored) {
                inner.subscriber = Some(Subscriber {
                    ctx: ctx.clone(),
                    on_success: Box::new(on_success),
                    on_error: Box::new(on_error),
                });
                return;
            }
            (action, sched)
        };

        match action {
            Action::Stored => unreachable!(),
            Action::Success(value, true) => on_success(value),
            Action::Success(value, false) => {
                sched.spawn(ctx.clone(), async move {
                    on_success(value);
                    Ok(())
                });
            }
            Action::Failure(error, true) => on_error(error),
            Action::Failure(error, false) => {
                sched.spawn(ctx.clone(), async move {
                    on_error(error);
                    Ok(())
                });
            }
        }
    }

    /// Cooperatively block until settlement.
    ///
    /// Only legal in an awaitable scope; each poll yields back to the
    /// scheduler until the promise settles, then the value is returned or
    /// the stored error raised.
    pub async fn wait(&self, ctx: &Ctx) -> Result<T> {
        if !ctx.awaitable() {
            return Err(Error::WaitNotPermitted);
        }
        self.settled().await
    }

    /// Settlement future without the awaitable-scope check; reserved for
    /// the engine's own driver tasks.
    pub(crate) fn settled(&self) -> impl Future<Output = Result<T>> {
        let inner = self.inner.clone();
        std::future::poll_fn(move |_cx| match &inner.borrow().state {
            State::Pending => Poll::Pending,
            State::Resolved(value) => Poll::Ready(Ok(value.clone())),
            State::Failed(error) => Poll::Ready(Err(error.clone())),
        })
    }

    /// Fan a set of promises in: `on_all_settled` fires once every member
    /// has resolved; the first failure fires `on_error` once and the
    /// remaining members' eventual results are discarded (not cancelled).
    pub fn fan_in(
        members: &[Promise<T>],
        ctx: &Ctx,
        on_all_settled: impl FnOnce() + 'static,
        on_error: impl FnOnce(Error) + 'static,
    ) {
        struct FanIn {
            remaining: usize,
            failed: bool,
            on_all: Option<Box<dyn FnOnce()>>,
            on_error: Option<Box<dyn FnOnce(Error)>>,
        }

        let state = Rc::new(RefCell::new(FanIn {
            remaining: 0,
            failed: false,
            on_all: Some(Box::new(on_all_settled)),
            on_error: Some(Box::new(on_error)),
        }));

        let mut unsettled = Vec::new();
        let mut first_error = None;
        for member in members {
            match &member.inner.borrow().state {
                State::Pending => unsettled.push(member.clone()),
                State::Resolved(_) => {}
                State::Failed(error) => {
                    if first_error.is_none() {
                        first_error = Some(error.clone());
                    }
                }
            }
        }

        if let Some(error) = first_error {
            let mut fan = state.borrow_mut();
            fan.failed = true;
            let callback = fan.on_error.take();
            drop(fan);
            if let Some(callback) = callback {
                callback(error);
            }
            return;
        }

        if unsettled.is_empty() {
            let callback = state.borrow_mut().on_all.take();
            if let Some(callback) = callback {
                callback();
            }
            return;
        }

        state.borrow_mut().remaining = unsettled.len();
        for member in unsettled {
            member.run_success_inline(true);
            member.run_error_inline(true);
            let on_member_ok = state.clone();
            let on_member_err = state.clone();
            member.then(
                ctx,
                move |_value| {
                    let callback = {
                        let mut fan = on_member_ok.borrow_mut();
                        if fan.failed {
                            None
                        } else {
                            fan.remaining -= 1;
                            if fan.remaining == 0 {
                                fan.on_all.take()
                            } else {
                                None
                            }
                        }
                    };
                    if let Some(callback) = callback {
                        callback();
                    }
                },
                move |error| {
                    let callback = {
                        let mut fan = on_member_err.borrow_mut();
                        if fan.failed {
                            None
                        } else {
                            fan.failed = true;
                            fan.on_error.take()
                        }
                    };
                    if let Some(callback) = callback {
                        callback(error);
                    }
                },
            );
        }
    }

    /// Start `runner` once `previous` has settled, or immediately when no
    /// previous promise is given.
    ///
    /// This serializes independent work into program order without making
    /// the new promise depend on the previous outcome: `runner` starts
    /// after settlement of either kind.
    pub fn sequence<R: Clone + 'static>(
        sched: &SchedHandle,
        previous: Option<&Promise<T>>,
        ctx: &Ctx,
        runner: impl FnOnce(Settle<R>) + 'static,
    ) -> Promise<R> {
        let out = Promise::pending(sched);
        match previous {
            None => runner(out.settle_handle()),
            Some(previous) => {
                type Slot<R, F> = Rc<RefCell<Option<(F, Settle<R>)>>>;
                let slot: Slot<R, _> = Rc::new(RefCell::new(Some((runner, out.settle_handle()))));
                let on_ok = slot.clone();
                previous.run_success_inline(true);
                previous.run_error_inline(true);
                previous.then(
                    ctx,
                    move |_value| {
                        if let Some((runner, settle)) = on_ok.borrow_mut().take() {
                            runner(settle);
                        }
                    },
                    move |_error| {
                        if let Some((runner, settle)) = slot.borrow_mut().take() {
                            runner(settle);
                        }
                    },
                );
            }
        }
        out
    }
}

impl<T: Clone + 'static> Settle<T> {
    /// Resolve the promise. A second settlement of any kind is a fatal
    /// protocol error.
    pub fn resolve(&self, value: T) {
        let (fire, sched) = {
            let mut inner = self.inner.borrow_mut();
            let sched = inner.sched.clone();
            if !matches!(inner.state, State::Pending) {
                drop(inner);
                sched.report_fatal(Error::MultipleResolve);
                return;
            }
            inner.state = State::Resolved(value.clone());
            let inline = inner.inline_success;
            let fire = match inner.subscriber.take() {
                Some(subscriber) if inline => Fire::Inline(subscriber.on_success),
                Some(subscriber) => Fire::Scheduled(subscriber.ctx, subscriber.on_success),
                None => Fire::None,
            };
            (fire, sched)
        };

        match fire {
            Fire::None => {}
            Fire::Inline(callback) => callback(value),
            Fire::Scheduled(ctx, callback) => {
                sched.spawn(ctx, async move {
                    callback(value);
                    Ok(())
                });
            }
        }
    }

    /// Reject the promise. A second settlement of any kind is a fatal
    /// protocol error.
    pub fn reject(&self, error: Error) {
        let (fire, sched) = {
            let mut inner = self.inner.borrow_mut();
            let sched = inner.sched.clone();
            if !matches!(inner.state, State::Pending) {
                drop(inner);
                sched.report_fatal(Error::MultipleResolve);
                return;
            }
            inner.state = State::Failed(error.clone());
            let inline = inner.inline_error;
            let fire = match inner.subscriber.take() {
                Some(subscriber) if inline => Fire::Inline(subscriber.on_error),
                Some(subscriber) => Fire::Scheduled(subscriber.ctx, subscriber.on_error),
                None => {
                    if inner.fail_fast {
                        drop(inner);
                        sched.report_fatal(error);
                        return;
                    }
                    Fire::None
                }
            };
            (fire, sched)
        };

        match fire {
            Fire::None => {}
            Fire::Inline(callback) => callback(error),
            Fire::Scheduled(ctx, callback) => {
                sched.spawn(ctx, async move {
                    callback(error);
                    Ok(())
                });
            }
        }
    }
}
