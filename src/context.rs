//! Execution Contexts
//!
//! A `Context` is one logical wait scope: it carries the pending-dependency
//! counter, the `on_load` queue fired when the scope becomes
//! dependency-clear, error observers, the alias table inherited by
//! descendant scopes, and resolutions queued until the scope's own manifest
//! has finished. Contexts are passed explicitly through every task and
//! promise operation; there is no implicit current-scope lookup.

use crate::error::Error;
use crate::registry::{Library, LibraryRef};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// Shared handle to a context.
pub type Ctx = Rc<Context>;

/// An error observer; returning `true` absorbs the error.
pub type ErrorObserver = Rc<dyn Fn(&Error) -> bool>;

/// Per-scope execution state.
pub struct Context {
    /// Whether a promise may be blocked on from within this scope.
    ///
    /// Fixed at creation: manifest scopes and the top-level scope must
    /// never block, or they would freeze the host's per-tick budget (or
    /// recursively wait on their own resolution).
    awaitable: bool,
    parent: Option<Ctx>,
    state: RefCell<State>,
}

struct State {
    resolved: bool,
    owning_library: Option<Weak<RefCell<Library>>>,
    pending: u32,
    error_occurred: bool,
    failure: Option<Error>,
    on_load: Vec<Box<dyn FnOnce()>>,
    on_fail: Vec<Box<dyn FnOnce(Error)>>,
    observers: Vec<ErrorObserver>,
    aliases: HashMap<String, LibraryRef>,
    queued: Vec<Box<dyn FnOnce()>>,
}

impl Context {
    fn new(awaitable: bool, resolved: bool, parent: Option<Ctx>) -> Ctx {
        Rc::new(Context {
            awaitable,
            parent,
            state: RefCell::new(State {
                resolved,
                owning_library: None,
                pending: 0,
                error_occurred: false,
                failure: None,
                on_load: Vec::new(),
                on_fail: Vec::new(),
                observers: Vec::new(),
                aliases: HashMap::new(),
                queued: Vec::new(),
            }),
        })
    }

    /// The top-level scope a host operates in between ticks.
    pub fn top_level() -> Ctx {
        Context::new(false, true, None)
    }

    /// A fresh scope for running a library's manifest initializer.
    ///
    /// Starts unresolved; declarations issued inside it are counted
    /// immediately but deferred until the manifest itself resolves.
    pub fn manifest_scope(parent: &Ctx) -> Ctx {
        Context::new(false, false, Some(parent.clone()))
    }

    /// A fresh scope for executing a module body.
    ///
    /// Parented to the library's defining scope so aliases and requester
    /// status carry over; blocking waits are allowed here.
    pub fn module_scope(parent: &Ctx, library: &LibraryRef) -> Ctx {
        let ctx = Context::new(true, true, Some(parent.clone()));
        ctx.state.borrow_mut().owning_library = Some(Rc::downgrade(library));
        ctx
    }

    pub fn awaitable(&self) -> bool {
        self.awaitable
    }

    pub fn parent(&self) -> Option<&Ctx> {
        self.parent.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        self.state.borrow().resolved
    }

    pub fn pending(&self) -> u32 {
        self.state.borrow().pending
    }

    pub fn error_occurred(&self) -> bool {
        self.state.borrow().error_occurred
    }

    /// The first unabsorbed error recorded against this scope, if any.
    pub fn failure(&self) -> Option<Error> {
        self.state.borrow().failure.clone()
    }

    /// The library whose module body this scope executes, if any.
    pub fn owning_library(&self) -> Option<LibraryRef> {
        self.state
            .borrow()
            .owning_library
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Record the start of a nested declaration or request.
    pub fn increment_pending(&self) {
        self.state.borrow_mut().pending += 1;
    }

    /// Record the settlement of a nested declaration or request.
    ///
    /// On a decrement to zero the `on_load` queue runs in registration
    /// order, unless an unabsorbed error has occurred in this scope.
    pub fn decrement_pending(&self) {
        let callbacks = {
            let mut state = self.state.borrow_mut();
            debug_assert!(state.pending > 0, "pending counter underflow");
            state.pending = state.pending.saturating_sub(1);
            if state.pending == 0 && !state.error_occurred {
                std::mem::take(&mut state.on_load)
            } else {
                Vec::new()
            }
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Queue a callback for the next time this scope becomes
    /// dependency-clear.
    pub fn on_load(&self, callback: impl FnOnce() + 'static) {
        self.state.borrow_mut().on_load.push(Box::new(callback));
    }

    /// Queue a callback fired when this scope records an unabsorbed error.
    ///
    /// Runs immediately if the scope has already failed.
    pub fn on_fail(&self, callback: impl FnOnce(Error) + 'static) {
        let failed = self.state.borrow().failure.clone();
        match failed {
            Some(error) => callback(error),
            None => self.state.borrow_mut().on_fail.push(Box::new(callback)),
        }
    }

    /// Record an unabsorbed error against this scope.
    ///
    /// Sets the error flag (suppressing `on_load`) and drains the
    /// `on_fail` queue. The first recorded error sticks; later ones only
    /// keep the flag set.
    pub fn mark_failed(&self, error: &Error) {
        let callbacks = {
            let mut state = self.state.borrow_mut();
            state.error_occurred = true;
            if state.failure.is_none() {
                state.failure = Some(error.clone());
            }
            std::mem::take(&mut state.on_fail)
        };
        for callback in callbacks {
            callback(error.clone());
        }
    }

    /// Register an error observer for this scope.
    pub fn on_error(&self, observer: impl Fn(&Error) -> bool + 'static) {
        self.state.borrow_mut().observers.push(Rc::new(observer));
    }

    /// Route an error through this scope's observers, nearest scope first.
    ///
    /// Observers run in registration order; the first to return `true`
    /// absorbs the error and processing continues. If no observer in the
    /// chain absorbs it, the scope's error flag is set (suppressing
    /// `on_load`) and `false` is returned so the caller can surface the
    /// error to the host.
    pub fn handle_error(&self, error: &Error) -> bool {
        let mut scope: Option<&Context> = Some(self);
        while let Some(current) = scope {
            let observers: Vec<ErrorObserver> = current.state.borrow().observers.clone();
            for observer in observers {
                if observer(error) {
                    return true;
                }
            }
            scope = current.parent.as_deref();
        }
        self.mark_failed(error);
        false
    }

    /// Bind a local alias for a resolved library.
    pub fn bind_alias(&self, name: impl Into<String>, library: LibraryRef) {
        self.state.borrow_mut().aliases.insert(name.into(), library);
    }

    /// Look an alias up through the scope chain; the nearest scope wins.
    pub fn lookup_alias(&self, name: &str) -> Option<LibraryRef> {
        if let Some(library) = self.state.borrow().aliases.get(name) {
            return Some(library.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.lookup_alias(name))
    }

    /// Run `callback` now if this scope is resolved, otherwise defer it
    /// until `mark_resolved`.
    pub fn when_resolved(&self, callback: impl FnOnce() + 'static) {
        let run_now = {
            let mut state = self.state.borrow_mut();
            if state.resolved {
                true
            } else {
                state.queued.push(Box::new(callback));
                return;
            }
        };
        if run_now {
            callback();
        }
    }

    /// Mark this scope's own manifest as finished and run queued
    /// resolutions in order.
    pub fn mark_resolved(&self) {
        let queued = {
            let mut state = self.state.borrow_mut();
            state.resolved = true;
            std::mem::take(&mut state.queued)
        };
        for callback in queued {
            callback();
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Context")
            .field("awaitable", &self.awaitable)
            .field("resolved", &state.resolved)
            .field("pending", &state.pending)
            .field("error_occurred", &state.error_occurred)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_on_load_fires_at_zero() {
        let ctx = Context::top_level();
        let fired = Rc::new(Cell::new(false));

        ctx.increment_pending();
        ctx.increment_pending();
        let flag = fired.clone();
        ctx.on_load(move || flag.set(true));

        ctx.decrement_pending();
        assert!(!fired.get());
        ctx.decrement_pending();
        assert!(fired.get());
    }

    #[test]
    fn test_unabsorbed_error_suppresses_on_load() {
        let ctx = Context::top_level();
        let fired = Rc::new(Cell::new(false));

        ctx.increment_pending();
        let flag = fired.clone();
        ctx.on_load(move || flag.set(true));

        assert!(!ctx.handle_error(&Error::MultipleResolve));
        ctx.decrement_pending();
        assert!(!fired.get());
        assert!(ctx.error_occurred());
    }

    #[test]
    fn test_on_fail_fires_on_unabsorbed_error() {
        let root = Context::top_level();
        let ctx = Context::manifest_scope(&root);
        let seen = Rc::new(RefCell::new(None));

        let sink = seen.clone();
        ctx.on_fail(move |error| *sink.borrow_mut() = Some(error));
        assert!(!ctx.handle_error(&Error::MultipleResolve));
        assert_eq!(*seen.borrow(), Some(Error::MultipleResolve));
        assert_eq!(ctx.failure(), Some(Error::MultipleResolve));

        // A hook registered after the failure fires immediately.
        let late = Rc::new(RefCell::new(None));
        let sink = late.clone();
        ctx.on_fail(move |error| *sink.borrow_mut() = Some(error));
        assert_eq!(*late.borrow(), Some(Error::MultipleResolve));
    }

    #[test]
    fn test_on_fail_stays_quiet_when_absorbed() {
        let ctx = Context::top_level();
        ctx.on_error(|_| true);
        let fired = Rc::new(Cell::new(false));

        let flag = fired.clone();
        ctx.on_fail(move |_| flag.set(true));
        assert!(ctx.handle_error(&Error::MultipleResolve));
        assert!(!fired.get());
        assert_eq!(ctx.failure(), None);
    }

    #[test]
    fn test_observer_absorbs_error() {
        let ctx = Context::top_level();
        ctx.on_error(|_| true);

        assert!(ctx.handle_error(&Error::MultipleResolve));
        assert!(!ctx.error_occurred());
    }

    #[test]
    fn test_observers_walk_parent_chain() {
        let root = Context::top_level();
        root.on_error(|_| true);
        let child = Context::manifest_scope(&root);

        assert!(child.handle_error(&Error::MultipleResolve));
    }

    #[test]
    fn test_when_resolved_defers_until_marked() {
        let root = Context::top_level();
        let ctx = Context::manifest_scope(&root);
        let runs = Rc::new(Cell::new(0u32));

        let counter = runs.clone();
        ctx.when_resolved(move || counter.set(counter.get() + 1));
        assert_eq!(runs.get(), 0);

        ctx.mark_resolved();
        assert_eq!(runs.get(), 1);

        let counter = runs.clone();
        ctx.when_resolved(move || counter.set(counter.get() + 1));
        assert_eq!(runs.get(), 2);
    }
}
