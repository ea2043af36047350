//! Source Providers
//!
//! A provider hands the runtime manifests and module bodies through
//! one-shot callbacks delivered on a later host tick, the way a network
//! or disk source would. Provider identity is structural: two provider
//! values describing the same source compare equal, so independent
//! declarations through them share one registry entry.
//!
//! `MemoryProvider` is the built-in source backed by in-process tables;
//! hosts and tests drive its callback delivery through a `DeliveryQueue`.

use crate::error::Result;
use crate::registry::{DeclareOptions, Manifest};
use crate::runtime::{ModuleScope, Scope};
use crate::value::Value;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::trace;

/// Raw outcome of a provider fetch, before the runtime attributes it.
pub type FetchResult<T> = std::result::Result<T, String>;

/// One-shot completion callback for a provider fetch.
pub type FetchCallback<T> = Box<dyn FnOnce(FetchResult<T>)>;

/// A library's manifest initializer: runs synchronously in a fresh
/// manifest scope, may declare the library's own dependencies through it,
/// and returns the manifest.
pub type Initializer = Rc<dyn Fn(&Scope) -> Result<Manifest>>;

/// A module body: an asynchronous function that populates the module's
/// export table through its scope.
pub type ModuleBody = Rc<dyn Fn(ModuleScope) -> LocalBoxFuture<'static, Result<()>>>;

/// A source of manifests and module bodies.
pub trait SourceProvider {
    /// Human-readable name used in error attribution and logs.
    fn display_name(&self) -> String;

    /// Fetch the library's initializer, delivering `Ok(None)` when the
    /// source serves no manifest. `done` must be called exactly once, on
    /// a later tick.
    fn fetch_manifest(&self, done: FetchCallback<Option<Initializer>>);

    /// Fetch a module body by name, delivering `Ok(None)` when the
    /// source has no such module. `done` must be called exactly once, on
    /// a later tick.
    fn fetch_module_body(&self, module: &str, done: FetchCallback<Option<ModuleBody>>);

    /// Structural equality with another provider.
    fn identity_eq(&self, other: &dyn SourceProvider) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Deferred callback queue standing in for the host's event delivery.
///
/// Providers push their completion callbacks here; the host pumps the
/// queue between scheduler steps. One `pump` delivers only the callbacks
/// queued before it started, so a callback queueing further work observes
/// at least one tick of latency, as a real source would.
#[derive(Clone, Default)]
pub struct DeliveryQueue {
    pending: Rc<RefCell<VecDeque<Box<dyn FnOnce()>>>>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        DeliveryQueue::default()
    }

    /// Queue a callback for the next pump.
    pub fn push(&self, callback: impl FnOnce() + 'static) {
        self.pending.borrow_mut().push_back(Box::new(callback));
    }

    /// Deliver every callback queued so far, in order. Returns how many
    /// ran.
    pub fn pump(&self) -> usize {
        let batch: Vec<Box<dyn FnOnce()>> = self.pending.borrow_mut().drain(..).collect();
        let delivered = batch.len();
        for callback in batch {
            callback();
        }
        delivered
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }
}

enum ModuleDef {
    /// Straight export table, wrapped into a body on fetch.
    Exports(Vec<(String, Value)>),
    /// Full asynchronous body.
    Body(ModuleBody),
    /// Fetch fails with this message.
    Failure(String),
}

/// In-process provider backed by declarative tables.
///
/// Identity is the source name: two `MemoryProvider`s with the same name
/// are the same source, regardless of which value a declaration holds.
pub struct MemoryProvider {
    name: String,
    queue: DeliveryQueue,
    manifest: Option<Manifest>,
    manifest_failure: Option<String>,
    dependencies: Vec<DeclareOptions>,
    modules: RefCell<HashMap<String, ModuleDef>>,
    manifest_fetches: Cell<u32>,
    body_fetches: RefCell<HashMap<String, u32>>,
}

impl MemoryProvider {
    pub fn new(name: impl Into<String>, queue: &DeliveryQueue) -> Self {
        MemoryProvider {
            name: name.into(),
            queue: queue.clone(),
            manifest: None,
            manifest_failure: None,
            dependencies: Vec::new(),
            modules: RefCell::new(HashMap::new()),
            manifest_fetches: Cell::new(0),
            body_fetches: RefCell::new(HashMap::new()),
        }
    }

    /// Serve this manifest through an initializer.
    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Declare `options` from inside the initializer, before the manifest
    /// is returned.
    pub fn with_dependency(mut self, options: DeclareOptions) -> Self {
        self.dependencies.push(options);
        self
    }

    /// Serve a module whose body just writes these exports.
    pub fn with_module(self, name: impl Into<String>, exports: Vec<(&str, Value)>) -> Self {
        let exports = exports
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        self.modules
            .borrow_mut()
            .insert(name.into(), ModuleDef::Exports(exports));
        self
    }

    /// Serve a module with a full asynchronous body.
    pub fn with_module_body(self, name: impl Into<String>, body: ModuleBody) -> Self {
        self.modules
            .borrow_mut()
            .insert(name.into(), ModuleDef::Body(body));
        self
    }

    /// Make fetches of this module fail.
    pub fn with_module_failure(self, name: impl Into<String>, message: impl Into<String>) -> Self {
        self.modules
            .borrow_mut()
            .insert(name.into(), ModuleDef::Failure(message.into()));
        self
    }

    /// Make manifest fetches fail.
    pub fn with_manifest_failure(mut self, message: impl Into<String>) -> Self {
        self.manifest_failure = Some(message.into());
        self
    }

    pub fn shared(self) -> Rc<Self> {
        Rc::new(self)
    }

    /// How many manifest fetches this provider has served.
    pub fn manifest_fetches(&self) -> u32 {
        self.manifest_fetches.get()
    }

    /// How many body fetches this provider has served for `module`.
    pub fn body_fetches(&self, module: &str) -> u32 {
        self.body_fetches
            .borrow()
            .get(module)
            .copied()
            .unwrap_or(0)
    }
}

impl SourceProvider for MemoryProvider {
    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn fetch_manifest(&self, done: FetchCallback<Option<Initializer>>) {
        self.manifest_fetches.set(self.manifest_fetches.get() + 1);
        trace!(provider = %self.name, "manifest fetch queued");

        if let Some(message) = self.manifest_failure.clone() {
            self.queue.push(move || done(Err(message)));
            return;
        }

        let Some(manifest) = self.manifest.clone() else {
            self.queue.push(move || done(Ok(None)));
            return;
        };

        let dependencies = self.dependencies.clone();
        let initializer: Initializer = Rc::new(move |scope: &Scope| {
            for dependency in &dependencies {
                scope.declare(dependency.clone());
            }
            Ok(manifest.clone())
        });
        self.queue.push(move || done(Ok(Some(initializer))));
    }

    fn fetch_module_body(&self, module: &str, done: FetchCallback<Option<ModuleBody>>) {
        *self
            .body_fetches
            .borrow_mut()
            .entry(module.to_string())
            .or_insert(0) += 1;
        trace!(provider = %self.name, module, "module body fetch queued");

        let outcome: FetchResult<Option<ModuleBody>> = match self.modules.borrow().get(module) {
            None => Ok(None),
            Some(ModuleDef::Failure(message)) => Err(message.clone()),
            Some(ModuleDef::Body(body)) => Ok(Some(body.clone())),
            Some(ModuleDef::Exports(exports)) => {
                let exports = exports.clone();
                let body: ModuleBody = Rc::new(move |scope: ModuleScope| {
                    let exports = exports.clone();
                    async move {
                        for (name, value) in exports {
                            scope.exports.set(name, value);
                        }
                        Ok(())
                    }
                    .boxed_local()
                });
                Ok(Some(body))
            }
        };
        self.queue.push(move || done(outcome));
    }

    fn identity_eq(&self, other: &dyn SourceProvider) -> bool {
        other
            .as_any()
            .downcast_ref::<MemoryProvider>()
            .is_some_and(|other| other.name == self.name)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
