//! Integration tests for dependency clustering: the all-loaded signal,
//! transitive dependencies declared by initializers, program-order
//! negotiation, and error routing through scope observers.

use pretty_assertions::assert_eq;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tangle::{DeclareOptions, DeliveryQueue, Error, Manifest, MemoryProvider, Runtime, Value, Version};

/// Pipe engine traces into the test harness when RUST_LOG is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The all-loaded signal waits for every top-level declaration.
#[test]
fn test_on_all_loaded_waits_for_every_declaration() {
    init_tracing();
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();

    for name in ["widgets", "charts"] {
        let provider = MemoryProvider::new(name, &queue)
            .with_manifest(Manifest::new("acme", name, Version::new(1, 0, 0)))
            .shared();
        runtime.declare(DeclareOptions::new(provider));
    }

    let loaded = Rc::new(Cell::new(false));
    let flag = loaded.clone();
    runtime.on_all_loaded(move || flag.set(true));
    assert!(!loaded.get());

    let errors = runtime.drive(&queue, 32);
    assert_eq!(errors, vec![]);
    assert!(loaded.get());
    assert_eq!(
        runtime.library_tags(),
        vec!["@acme/charts#1.0.0", "@acme/widgets#1.0.0"]
    );
}

/// A library whose initializer declares its own dependency does not count
/// as loaded until that dependency has registered too.
#[test]
fn test_transitive_dependencies_join_the_cluster() {
    init_tracing();
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();

    let util = MemoryProvider::new("util-src", &queue)
        .with_manifest(Manifest::new("acme", "util", Version::new(2, 1, 0)))
        .shared();
    let app = MemoryProvider::new("app-src", &queue)
        .with_manifest(Manifest::new("acme", "app", Version::new(1, 0, 0)))
        .with_dependency(DeclareOptions::new(util))
        .shared();

    let resolved = Rc::new(Cell::new(false));
    let promise = runtime.declare(DeclareOptions::new(app));
    let flag = resolved.clone();
    promise.then(
        runtime.root_scope().context(),
        move |_library| flag.set(true),
        |_| {},
    );

    let loaded = Rc::new(Cell::new(false));
    let flag = loaded.clone();
    runtime.on_all_loaded(move || flag.set(true));

    let errors = runtime.drive(&queue, 64);
    assert_eq!(errors, vec![]);
    assert!(resolved.get());
    assert!(loaded.get());
    assert_eq!(
        runtime.library_tags(),
        vec!["@acme/app#1.0.0", "@acme/util#2.1.0"]
    );
}

/// A transitive dependency that fails to negotiate rejects the outer
/// declaration instead of leaving it pending forever.
#[test]
fn test_failed_transitive_dependency_rejects_outer_declaration() {
    init_tracing();
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();

    let util = MemoryProvider::new("util-src", &queue)
        .with_manifest_failure("404 not found")
        .shared();
    let app = MemoryProvider::new("app-src", &queue)
        .with_manifest(Manifest::new("acme", "app", Version::new(1, 0, 0)))
        .with_dependency(DeclareOptions::new(util))
        .shared();

    let outcome = Rc::new(RefCell::new(None));
    let promise = runtime.declare(DeclareOptions::new(app));
    let sink = outcome.clone();
    promise.then(
        runtime.root_scope().context(),
        |_library| panic!("declaration must not resolve"),
        move |error| *sink.borrow_mut() = Some(error),
    );

    let errors = runtime.drive(&queue, 64);
    assert_eq!(errors, vec![Error::provider("util-src", "404 not found")]);
    assert_eq!(
        *outcome.borrow(),
        Some(Error::provider("util-src", "404 not found"))
    );
    // The declaring scope's counter is released, not leaked.
    assert_eq!(runtime.root_scope().context().pending(), 0);
}

/// Manifests negotiate one at a time, in the order the declarations were
/// issued.
#[test]
fn test_declarations_negotiate_in_program_order() {
    init_tracing();
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();

    let first = MemoryProvider::new("first-src", &queue)
        .with_manifest(Manifest::new("acme", "first", Version::new(1, 0, 0)))
        .shared();
    let second = MemoryProvider::new("second-src", &queue)
        .with_manifest(Manifest::new("acme", "second", Version::new(1, 0, 0)))
        .shared();

    runtime.declare(DeclareOptions::new(first.clone()));
    runtime.declare(DeclareOptions::new(second.clone()));

    // The second declaration's fetch cannot start until the first has
    // registered.
    runtime.tick();
    assert_eq!(first.manifest_fetches(), 1);
    assert_eq!(second.manifest_fetches(), 0);

    let errors = runtime.drive(&queue, 32);
    assert_eq!(errors, vec![]);
    assert_eq!(second.manifest_fetches(), 1);
    assert_eq!(
        runtime.library_tags(),
        vec!["@acme/first#1.0.0", "@acme/second#1.0.0"]
    );
}

/// An observer that absorbs an error keeps the cluster alive: nothing
/// surfaces to the host and the all-loaded signal still fires.
#[test]
fn test_absorbed_error_keeps_cluster_alive() {
    init_tracing();
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();

    let broken = MemoryProvider::new("broken", &queue)
        .with_manifest_failure("404 not found")
        .shared();
    let healthy = MemoryProvider::new("cdn", &queue)
        .with_manifest(Manifest::new("acme", "widgets", Version::new(1, 0, 0)))
        .shared();

    let seen = Rc::new(Cell::new(0u32));
    let count = seen.clone();
    runtime.on_any_error(move |_error| {
        count.set(count.get() + 1);
        true
    });

    let loaded = Rc::new(Cell::new(false));
    let flag = loaded.clone();
    runtime.on_all_loaded(move || flag.set(true));

    runtime.declare(DeclareOptions::new(broken));
    runtime.declare(DeclareOptions::new(healthy));

    let errors = runtime.drive(&queue, 32);
    assert_eq!(errors, vec![]);
    assert_eq!(seen.get(), 1);
    assert!(loaded.get());
    assert_eq!(runtime.library_tags(), vec!["@acme/widgets#1.0.0"]);
}

/// Without an observer the error surfaces to the host and the all-loaded
/// signal is suppressed.
#[test]
fn test_unabsorbed_error_suppresses_all_loaded() {
    init_tracing();
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();

    let broken = MemoryProvider::new("broken", &queue)
        .with_manifest_failure("404 not found")
        .shared();
    runtime.declare(DeclareOptions::new(broken));

    let loaded = Rc::new(Cell::new(false));
    let flag = loaded.clone();
    runtime.on_all_loaded(move || flag.set(true));

    let errors = runtime.drive(&queue, 32);
    assert_eq!(errors, vec![Error::provider("broken", "404 not found")]);
    assert!(!loaded.get());
}

/// An observer declining an error leaves it to surface as usual.
#[test]
fn test_observer_may_decline_an_error() {
    init_tracing();
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();

    runtime.on_any_error(|_error| false);
    let broken = MemoryProvider::new("broken", &queue)
        .with_manifest_failure("404 not found")
        .shared();
    runtime.declare(DeclareOptions::new(broken));

    let errors = runtime.drive(&queue, 32);
    assert_eq!(errors, vec![Error::provider("broken", "404 not found")]);
}

/// Errors raised inside a module body route through the scope chain up to
/// the host's observer.
#[test]
fn test_module_body_error_reaches_root_observer() {
    use futures::FutureExt;
    use tangle::provider::ModuleBody;
    use tangle::ModuleScope;

    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();

    let body: ModuleBody = Rc::new(|_scope: ModuleScope| {
        async { Err(Error::parse("bad payload")) }.boxed_local()
    });
    let provider = MemoryProvider::new("cdn", &queue)
        .with_manifest(Manifest::new("acme", "widgets", Version::new(1, 0, 0)))
        .with_module_body("chart", body)
        .shared();

    let seen = Rc::new(Cell::new(0u32));
    let count = seen.clone();
    runtime.on_any_error(move |error| {
        assert_eq!(*error, Error::parse("bad payload"));
        count.set(count.get() + 1);
        true
    });

    runtime.declare(DeclareOptions::new(provider).with_alias("ui"));
    runtime.drive(&queue, 32);
    runtime.request("ui:chart").unwrap();

    let errors = runtime.drive(&queue, 32);
    assert_eq!(errors, vec![]);
    // Routed once, at the module body's scope; rejected waiters do not
    // route the same failure again.
    assert_eq!(seen.get(), 1);
}

/// Top-level module requests count toward the all-loaded signal.
#[test]
fn test_requests_count_toward_all_loaded() {
    init_tracing();
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();

    let provider = MemoryProvider::new("cdn", &queue)
        .with_manifest(Manifest::new("acme", "widgets", Version::new(1, 0, 0)))
        .with_module("button", vec![("label", Value::from("Ok"))])
        .shared();
    runtime.declare(DeclareOptions::new(provider).with_alias("ui"));
    runtime.drive(&queue, 32);

    let exports = runtime.request("ui:button").unwrap();
    let loaded = Rc::new(Cell::new(false));
    let flag = loaded.clone();
    runtime.on_all_loaded(move || flag.set(true));
    assert!(!loaded.get());

    let errors = runtime.drive(&queue, 32);
    assert_eq!(errors, vec![]);
    assert!(loaded.get());
    assert_eq!(exports.get("label"), Some(Value::from("Ok")));
}
