//! Loading Runtime
//!
//! `Runtime` ties the pieces together: the cooperative scheduler, the
//! library registry, and the top-level scope a host operates in between
//! ticks. Declarations negotiate manifests with their providers in
//! program order; module requests deduplicate concurrent loads and hand
//! every caller the same live export table.

use crate::context::{Context, Ctx};
use crate::error::{Error, Result};
use crate::module::{Exports, Module, ModuleRef};
use crate::promise::{Promise, Settle};
use crate::provider::{DeliveryQueue, Initializer, ModuleBody};
use crate::registry::{DeclareOptions, LibraryRef, LibraryRegistry, Manifest};
use crate::scheduler::{SchedHandle, Scheduler, StepOutcome};
use crate::specifier::{Identifier, LibraryTag, Target};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// What one tick surfaced to the host.
pub type TickReport = StepOutcome;

struct RuntimeShared {
    sched: SchedHandle,
    registry: LibraryRegistry,
    root: Ctx,
    /// Tail of the declaration chain; each new declaration sequences
    /// behind it so manifests negotiate in program order.
    last_declare: RefCell<Option<Promise<()>>>,
}

/// The in-process module loading runtime.
///
/// Single-threaded by construction: the host drives it one `tick` at a
/// time and pumps provider deliveries in between.
pub struct Runtime {
    shared: Rc<RuntimeShared>,
    scheduler: Scheduler,
}

impl Runtime {
    pub fn new() -> Self {
        let scheduler = Scheduler::new();
        let shared = Rc::new(RuntimeShared {
            sched: scheduler.handle(),
            registry: LibraryRegistry::new(),
            root: Context::top_level(),
            last_declare: RefCell::new(None),
        });
        Runtime { shared, scheduler }
    }

    /// The top-level scope.
    pub fn root_scope(&self) -> Scope {
        Scope {
            shared: self.shared.clone(),
            ctx: self.shared.root.clone(),
        }
    }

    /// Declare a library dependency from the top-level scope.
    pub fn declare(&self, options: DeclareOptions) -> Promise<LibraryRef> {
        declare_in(&self.shared, &self.shared.root, options)
    }

    /// Request a module from the top-level scope.
    ///
    /// Never blocks: the returned handle is the module's live export
    /// table, observed empty until the body has run.
    pub fn request(&self, target: &str) -> Result<Exports> {
        request_tracked(&self.shared, &self.shared.root, target)
    }

    /// Run `callback` once every top-level declaration and request has
    /// settled.
    pub fn on_all_loaded(&self, callback: impl FnOnce() + 'static) {
        self.shared.root.on_load(callback);
    }

    /// Observe errors from any scope; return `true` to absorb one.
    pub fn on_any_error(&self, observer: impl Fn(&Error) -> bool + 'static) {
        self.shared.root.on_error(observer);
    }

    /// Resume every live task once. Invoked once per host tick.
    pub fn tick(&self) -> TickReport {
        self.scheduler.step()
    }

    /// Whether any task is live or queued.
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    /// Alternate ticks and provider deliveries until both run dry or the
    /// tick budget is spent. Returns every error surfaced along the way.
    pub fn drive(&self, queue: &DeliveryQueue, max_ticks: usize) -> Vec<Error> {
        let mut errors = Vec::new();
        for _ in 0..max_ticks {
            let outcome = self.tick();
            errors.extend(outcome.errors);
            let delivered = queue.pump();
            if self.is_idle() && delivered == 0 && queue.is_empty() {
                break;
            }
        }
        errors
    }

    /// Fully-qualified tags of every registered library, sorted.
    pub fn library_tags(&self) -> Vec<String> {
        self.shared.registry.tags()
    }

    /// Drop every registered library. Intended for test isolation.
    pub fn reset_registry(&self) {
        self.shared.registry.reset();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

/// A handle to one scope of the runtime: the top-level scope, a manifest
/// scope during initialization, or a module body's scope.
#[derive(Clone)]
pub struct Scope {
    shared: Rc<RuntimeShared>,
    ctx: Ctx,
}

impl Scope {
    pub fn context(&self) -> &Ctx {
        &self.ctx
    }

    /// Declare a library dependency from this scope.
    ///
    /// The declaration is counted against this scope immediately and
    /// negotiated in program order; the promise resolves once the library
    /// and its transitive dependencies have registered.
    pub fn declare(&self, options: DeclareOptions) -> Promise<LibraryRef> {
        declare_in(&self.shared, &self.ctx, options)
    }

    /// Request a module.
    ///
    /// In an awaitable scope this waits for the module body to finish and
    /// returns the populated table, or the load error. In a non-awaitable
    /// scope it returns the live handle immediately and tracks the load
    /// against the scope's pending counter.
    pub async fn request(&self, target: &str) -> Result<Exports> {
        if self.ctx.awaitable() {
            let (_exports, promise) = request_in(&self.shared, &self.ctx, target)?;
            promise.wait(&self.ctx).await
        } else {
            request_tracked(&self.shared, &self.ctx, target)
        }
    }

    /// Run `callback` the next time this scope becomes dependency-clear.
    pub fn on_loaded(&self, callback: impl FnOnce() + 'static) {
        self.ctx.on_load(callback);
    }

    /// Observe errors routed through this scope; return `true` to absorb.
    pub fn on_error(&self, observer: impl Fn(&Error) -> bool + 'static) {
        self.ctx.on_error(observer);
    }

    /// Bind a local alias for a resolved library.
    pub fn bind_alias(&self, name: impl Into<String>, library: LibraryRef) {
        self.ctx.bind_alias(name, library);
    }
}

/// The scope handed to a module body, carrying the module's own export
/// table.
pub struct ModuleScope {
    pub scope: Scope,
    pub exports: Exports,
}

fn declare_in(
    shared: &Rc<RuntimeShared>,
    ctx: &Ctx,
    options: DeclareOptions,
) -> Promise<LibraryRef> {
    let result: Promise<LibraryRef> = Promise::pending(&shared.sched);
    ctx.increment_pending();

    let start = {
        let shared = shared.clone();
        let ctx = ctx.clone();
        let settle = result.settle_handle();
        move || {
            let previous = shared.last_declare.borrow_mut().take();
            let sched = shared.sched.clone();
            let chain = Promise::sequence(&sched, previous.as_ref(), &ctx, {
                let shared = shared.clone();
                let ctx = ctx.clone();
                move |gate: Settle<()>| {
                    let sched = shared.sched.clone();
                    sched.spawn(
                        ctx.clone(),
                        negotiate(shared, ctx.clone(), options, settle, gate),
                    );
                }
            });
            *shared.last_declare.borrow_mut() = Some(chain);
        }
    };
    // A declaration issued while this scope's own manifest is still
    // negotiating is counted now but started only once the scope resolves.
    ctx.when_resolved(start);
    result
}

/// Drive one declaration end to end: fetch the manifest, run the
/// initializer, validate the declaration's pins, and merge into the
/// registry.
///
/// `gate` is the program-order chain link; it settles at registration so
/// dependents declared by this library's own initializer can proceed
/// while the transitive join completes.
async fn negotiate(
    shared: Rc<RuntimeShared>,
    ctx: Ctx,
    options: DeclareOptions,
    result: Settle<LibraryRef>,
    gate: Settle<()>,
) -> Result<()> {
    match resolve_declaration(&shared, &ctx, &options).await {
        Ok((library, manifest_ctx)) => {
            gate.resolve(());
            if let Some(alias) = options.alias.clone() {
                ctx.bind_alias(alias, library.clone());
            }
            match manifest_ctx {
                // The initializer declared dependencies of its own; this
                // declaration settles only once they all have, or fails
                // with the first of them that goes unabsorbed.
                Some(manifest_ctx) if manifest_ctx.pending() > 0 => {
                    let slot = Rc::new(RefCell::new(Some((result, ctx.clone()))));
                    let joined = slot.clone();
                    manifest_ctx.on_load(move || {
                        if let Some((result, ctx)) = joined.borrow_mut().take() {
                            result.resolve(library);
                            ctx.decrement_pending();
                        }
                    });
                    manifest_ctx.on_fail(move |error| {
                        if let Some((result, ctx)) = slot.borrow_mut().take() {
                            ctx.mark_failed(&error);
                            result.reject(error);
                            ctx.decrement_pending();
                        }
                    });
                }
                _ => {
                    result.resolve(library);
                    ctx.decrement_pending();
                }
            }
            Ok(())
        }
        Err(error) => {
            gate.resolve(());
            let absorbed = ctx.handle_error(&error);
            result.reject(error.clone());
            ctx.decrement_pending();
            if absorbed {
                Ok(())
            } else {
                Err(error)
            }
        }
    }
}

async fn resolve_declaration(
    shared: &Rc<RuntimeShared>,
    ctx: &Ctx,
    options: &DeclareOptions,
) -> Result<(LibraryRef, Option<Ctx>)> {
    let provider = options.provider.clone();
    let source = provider.display_name();

    let fetched: Promise<Option<Initializer>> = Promise::new(&shared.sched, |settle| {
        let source = source.clone();
        provider.fetch_manifest(Box::new(move |outcome| match outcome {
            Ok(initializer) => settle.resolve(initializer),
            Err(message) => settle.reject(Error::provider(source, message)),
        }));
    });
    let initializer = fetched.settled().await?;

    let (manifest, manifest_ctx) = match initializer {
        None => {
            // Manifest-less source: the declaration itself must pin the
            // library's identity and version.
            let identifier = options.identifier.clone().ok_or_else(|| {
                Error::ManifestUnavailable {
                    provider: source.clone(),
                }
            })?;
            let version = options.min_version.ok_or_else(|| Error::ManifestUnavailable {
                provider: source.clone(),
            })?;
            let identifier = Identifier::parse(&identifier)?;
            (
                Manifest::new(identifier.owner, identifier.name, version),
                None,
            )
        }
        Some(initializer) => {
            let manifest_ctx = Context::manifest_scope(ctx);
            let scope = Scope {
                shared: shared.clone(),
                ctx: manifest_ctx.clone(),
            };
            let manifest = initializer(&scope)?;
            manifest.validate()?;
            (manifest, Some(manifest_ctx))
        }
    };

    if let Some(declared) = &options.identifier {
        if *declared != manifest.identifier() {
            return Err(Error::IdentifierMismatch {
                declared: declared.clone(),
                resolved: manifest.identifier(),
            });
        }
    }
    if let Some(floor) = options.min_version {
        if manifest.version < floor {
            return Err(Error::VersionMismatch {
                library: manifest.identifier(),
                requested: floor.to_string(),
                resolved: manifest.version.to_string(),
            });
        }
    }

    let defining_scope = manifest_ctx.clone().unwrap_or_else(|| ctx.clone());
    let (library, registration) =
        shared
            .registry
            .resolve_manifest(&manifest, &options.provider, ctx, defining_scope);
    debug!(library = %library.borrow().tag(), ?registration, "declaration resolved");

    // Declarations the initializer queued may start now.
    if let Some(manifest_ctx) = &manifest_ctx {
        manifest_ctx.mark_resolved();
    }
    Ok((library, manifest_ctx))
}

/// Resolve a request target and start the load if needed. Returns the
/// live export handle plus a promise for the populated table.
fn request_in(
    shared: &Rc<RuntimeShared>,
    ctx: &Ctx,
    target: &str,
) -> Result<(Exports, Promise<Exports>)> {
    let target = Target::parse(target)?;
    let library = match &target.library {
        None => ctx.owning_library().ok_or_else(|| Error::AmbiguousTarget {
            name: target.module.clone(),
        })?,
        Some(specifier) => resolve_library(shared, ctx, specifier)?,
    };
    Ok(request_module(shared, &library, &target.module))
}

/// Non-blocking request that counts the load against `ctx`.
///
/// Load failures are routed through the scope chain where they occur;
/// here a rejected waiter only releases the counter.
fn request_tracked(shared: &Rc<RuntimeShared>, ctx: &Ctx, target: &str) -> Result<Exports> {
    let (exports, promise) = request_in(shared, ctx, target)?;
    ctx.increment_pending();
    let on_success = {
        let ctx = ctx.clone();
        move |_exports| ctx.decrement_pending()
    };
    let on_failure = {
        let ctx = ctx.clone();
        move |_error: Error| ctx.decrement_pending()
    };
    promise.then(ctx, on_success, on_failure);
    Ok(exports)
}

fn resolve_library(shared: &Rc<RuntimeShared>, ctx: &Ctx, specifier: &str) -> Result<LibraryRef> {
    if let Some(library) = ctx.lookup_alias(specifier) {
        return Ok(library);
    }
    if specifier.starts_with('@') {
        let tag = LibraryTag::parse(specifier)?;
        if let Some(library) = shared.registry.find_tag(&tag, ctx) {
            return Ok(library);
        }
    }
    Err(Error::UnknownLibrary {
        specifier: specifier.to_string(),
    })
}

fn request_module(
    shared: &Rc<RuntimeShared>,
    library: &LibraryRef,
    name: &str,
) -> (Exports, Promise<Exports>) {
    let promise: Promise<Exports> = Promise::pending(&shared.sched);
    let settle = promise.settle_handle();

    let cached = library.borrow().module(name);
    if let Some(module) = cached {
        let exports = module.borrow().exports();
        if module.borrow().is_loaded() {
            trace!(module = name, "module cache hit");
            settle.resolve(exports.clone());
        } else {
            // A load is already in flight; join its waiter queue.
            module.borrow_mut().add_waiter(settle);
        }
        return (exports, promise);
    }

    let module = Module::new_loading(name);
    let exports = module.borrow().exports();
    module.borrow_mut().add_waiter(settle);
    library.borrow_mut().insert_module(name, module.clone());

    let (provider, source, library_tag, defining_scope) = {
        let entry = library.borrow();
        (
            entry.provider(),
            entry.provider().display_name(),
            entry.tag(),
            entry.scope(),
        )
    };
    debug!(library = %library_tag, module = name, "module body fetch started");

    let shared = shared.clone();
    let library = library.clone();
    let module_name = name.to_string();
    provider.fetch_module_body(
        name,
        Box::new(move |outcome| {
            let body = match outcome {
                Ok(Some(body)) => body,
                Ok(None) => {
                    settle_failed_module(
                        &shared,
                        &library,
                        &module_name,
                        Error::ModuleUnavailable {
                            library: library_tag,
                            module: module_name.clone(),
                        },
                    );
                    return;
                }
                Err(message) => {
                    settle_failed_module(
                        &shared,
                        &library,
                        &module_name,
                        Error::provider(source, message),
                    );
                    return;
                }
            };
            let body_ctx = Context::module_scope(&defining_scope, &library);
            let sched = shared.sched.clone();
            sched.spawn(
                body_ctx.clone(),
                run_module_body(shared, body_ctx, library, module, module_name, body),
            );
        }),
    );
    (exports, promise)
}

fn settle_failed_module(shared: &Rc<RuntimeShared>, library: &LibraryRef, name: &str, error: Error) {
    warn!(library = %library.borrow().tag(), module = name, %error, "module load failed");
    // Route the failure once, at the library whose load it was; waiters
    // are rejected without routing again.
    let scope = library.borrow().scope();
    if !scope.handle_error(&error) {
        shared.sched.report_fatal(error.clone());
    }
    // Drop the entry so a later request can retry the fetch.
    let module = {
        let mut entry = library.borrow_mut();
        let module = entry.module(name);
        entry.remove_module(name);
        module
    };
    if let Some(module) = module {
        let waiters = module.borrow_mut().fail();
        for waiter in waiters {
            waiter.reject(error.clone());
        }
    }
}

async fn run_module_body(
    shared: Rc<RuntimeShared>,
    ctx: Ctx,
    library: LibraryRef,
    module: ModuleRef,
    name: String,
    body: ModuleBody,
) -> Result<()> {
    let scope = ModuleScope {
        scope: Scope {
            shared: shared.clone(),
            ctx: ctx.clone(),
        },
        exports: module.borrow().exports(),
    };
    match body(scope).await {
        Ok(()) => {
            trace!(module = %name, "module body completed");
            let exports = module.borrow().exports();
            let waiters = module.borrow_mut().complete();
            for waiter in waiters {
                waiter.resolve(exports.clone());
            }
            Ok(())
        }
        Err(error) => {
            let absorbed = ctx.handle_error(&error);
            let waiters = module.borrow_mut().fail();
            for waiter in waiters {
                waiter.reject(error.clone());
            }
            library.borrow_mut().remove_module(&name);
            if absorbed {
                Ok(())
            } else {
                Err(error)
            }
        }
    }
}
