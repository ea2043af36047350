//! Cooperative Task Scheduler
//!
//! A single-threaded executor driven one step per host tick. Every live
//! task is polled exactly once per `step()` in spawn order; tasks spawned
//! while a step is running are queued and first polled on a subsequent
//! step. A failing task never unwinds through the polling loop: its error
//! is collected and handed back at the step's tail.

use crate::context::Ctx;
use crate::error::{Error, Result};
use futures::future::LocalBoxFuture;
use futures::task::noop_waker;
use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::task::Poll;
use tracing::{trace, warn};

/// Unique identifier for tasks.
pub type TaskId = u64;

/// A cooperatively scheduled unit of execution.
///
/// Bound to exactly one context for its lifetime; never migrates.
struct Task {
    id: TaskId,
    ctx: Ctx,
    future: LocalBoxFuture<'static, Result<()>>,
}

struct Shared {
    /// Tasks resumed by the current and following steps, in spawn order.
    live: RefCell<Vec<Task>>,
    /// Tasks spawned since the current step began; merged in at the start
    /// of the next step so resumption is never re-entrant.
    incoming: RefCell<Vec<Task>>,
    /// Fatal errors to surface at the tail of the running step.
    fatals: RefCell<Vec<Error>>,
    next_id: Cell<TaskId>,
}

/// Cheap cloneable handle used to spawn tasks and report fatal errors
/// from anywhere inside the engine.
#[derive(Clone)]
pub struct SchedHandle {
    shared: Rc<Shared>,
}

impl SchedHandle {
    /// Register a new task bound to `ctx`.
    ///
    /// The task is queued and not resumed until a subsequent `step()`.
    pub fn spawn(
        &self,
        ctx: Ctx,
        future: impl Future<Output = Result<()>> + 'static,
    ) -> TaskId {
        let id = self.shared.next_id.get();
        self.shared.next_id.set(id + 1);
        trace!(task = id, "spawning task");
        self.shared.incoming.borrow_mut().push(Task {
            id,
            ctx,
            future: future.boxed_local(),
        });
        id
    }

    /// Report a protocol violation or other fatal condition.
    ///
    /// The error is surfaced on the tail of the next completed step
    /// rather than raised into the reporting call stack.
    pub fn report_fatal(&self, error: Error) {
        warn!(%error, "fatal error reported");
        self.shared.fatals.borrow_mut().push(error);
    }
}

/// Outcome of one scheduler step.
#[derive(Debug, Default)]
pub struct StepOutcome {
    /// Number of tasks resumed by this step.
    pub tasks_polled: usize,
    /// Number of tasks still live (including ones spawned during the step).
    pub tasks_remaining: usize,
    /// Errors surfaced at the step's tail: failed tasks whose error no
    /// observer absorbed, and protocol violations.
    pub errors: Vec<Error>,
}

/// The cooperative scheduler.
pub struct Scheduler {
    shared: Rc<Shared>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            shared: Rc::new(Shared {
                live: RefCell::new(Vec::new()),
                incoming: RefCell::new(Vec::new()),
                fatals: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    /// Handle for spawning tasks into this scheduler.
    pub fn handle(&self) -> SchedHandle {
        SchedHandle {
            shared: self.shared.clone(),
        }
    }

    /// Whether any task is live or queued.
    pub fn is_idle(&self) -> bool {
        self.shared.live.borrow().is_empty() && self.shared.incoming.borrow().is_empty()
    }

    /// Resume every live task exactly once, in spawn order.
    ///
    /// Invoked once per host tick by the external driver.
    pub fn step(&self) -> StepOutcome {
        let mut tasks = {
            let mut live = self.shared.live.borrow_mut();
            let mut incoming = self.shared.incoming.borrow_mut();
            live.append(&mut incoming);
            std::mem::take(&mut *live)
        };

        let waker = noop_waker();
        let mut cx = std::task::Context::from_waker(&waker);
        let tasks_polled = tasks.len();
        let mut survivors = Vec::with_capacity(tasks.len());

        for mut task in tasks.drain(..) {
            // No borrows are held across the poll: the task body may
            // spawn further tasks or report fatals.
            match task.future.as_mut().poll(&mut cx) {
                Poll::Pending => survivors.push(task),
                Poll::Ready(Ok(())) => {
                    trace!(task = task.id, "task completed");
                }
                Poll::Ready(Err(error)) => {
                    warn!(task = task.id, %error, "task failed");
                    // The owning scope records the failure before it
                    // surfaces to the host.
                    task.ctx.mark_failed(&error);
                    self.shared.fatals.borrow_mut().push(error);
                }
            }
        }

        {
            let mut live = self.shared.live.borrow_mut();
            debug_assert!(live.is_empty());
            *live = survivors;
        }

        let errors = self.shared.fatals.take();
        StepOutcome {
            tasks_polled,
            tasks_remaining: self.shared.live.borrow().len()
                + self.shared.incoming.borrow().len(),
            errors,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}
