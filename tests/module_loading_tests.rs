//! Integration tests for module loading: cache idempotence, concurrent
//! request deduplication, live export handles, and target resolution
//! through aliases, tags, and the owning library.

use futures::FutureExt;
use pretty_assertions::assert_eq;
use std::rc::Rc;
use tangle::provider::ModuleBody;
use tangle::{
    DeclareOptions, DeliveryQueue, Error, Manifest, MemoryProvider, ModuleScope, Runtime, Value,
    Version,
};

fn widgets_provider(queue: &DeliveryQueue) -> MemoryProvider {
    MemoryProvider::new("cdn", queue)
        .with_manifest(Manifest::new("acme", "widgets", Version::new(1, 2, 0)))
        .with_module("button", vec![("label", Value::from("Ok"))])
}

/// A module body runs once; every later request is served from the cache.
#[test]
fn test_module_load_is_idempotent() {
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();
    let provider = widgets_provider(&queue).shared();

    runtime.declare(DeclareOptions::new(provider.clone()).with_alias("ui"));
    runtime.drive(&queue, 32);

    let first = runtime.request("ui:button").unwrap();
    runtime.drive(&queue, 32);
    let second = runtime.request("ui:button").unwrap();
    runtime.drive(&queue, 32);

    assert_eq!(provider.body_fetches("button"), 1);
    assert!(first.same_table(&second));
    assert_eq!(second.get("label"), Some(Value::from("Ok")));
}

/// Requests racing the first load join its waiter queue instead of
/// starting a second fetch.
#[test]
fn test_concurrent_requests_share_one_fetch() {
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();
    let provider = widgets_provider(&queue).shared();

    runtime.declare(DeclareOptions::new(provider.clone()).with_alias("ui"));
    runtime.drive(&queue, 32);

    let first = runtime.request("ui:button").unwrap();
    let second = runtime.request("ui:button").unwrap();
    let errors = runtime.drive(&queue, 32);

    assert_eq!(errors, vec![]);
    assert_eq!(provider.body_fetches("button"), 1);
    assert!(first.same_table(&second));
    assert_eq!(first.get("label"), Some(Value::from("Ok")));
}

/// A request returns its export handle before the body has run; the same
/// table fills in place.
#[test]
fn test_request_returns_live_handle() {
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();
    let provider = widgets_provider(&queue).shared();

    runtime.declare(DeclareOptions::new(provider).with_alias("ui"));
    runtime.drive(&queue, 32);

    let exports = runtime.request("ui:button").unwrap();
    assert!(exports.is_empty());

    runtime.drive(&queue, 32);
    assert_eq!(exports.get("label"), Some(Value::from("Ok")));
    assert_eq!(exports.names(), vec!["label"]);
}

/// Inside a module body, unqualified targets resolve within the owning
/// library and the wait blocks until the dependency has loaded.
#[test]
fn test_unqualified_request_resolves_in_owning_library() {
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();

    let facade: ModuleBody = Rc::new(|scope: ModuleScope| {
        async move {
            let palette = scope.scope.request("palette").await?;
            let accent = palette.get("accent").unwrap_or(Value::Missing);
            scope.exports.set("accent", accent);
            Ok(())
        }
        .boxed_local()
    });

    let provider = MemoryProvider::new("cdn", &queue)
        .with_manifest(Manifest::new("acme", "widgets", Version::new(1, 0, 0)))
        .with_module("palette", vec![("accent", Value::from("teal"))])
        .with_module_body("facade", facade)
        .shared();

    runtime.declare(DeclareOptions::new(provider).with_alias("ui"));
    runtime.drive(&queue, 32);

    let exports = runtime.request("ui:facade").unwrap();
    let errors = runtime.drive(&queue, 64);

    assert_eq!(errors, vec![]);
    assert_eq!(exports.get("accent"), Some(Value::from("teal")));
}

/// Unqualified targets have no meaning outside a module body.
#[test]
fn test_unqualified_request_at_top_level_is_ambiguous() {
    let runtime = Runtime::new();
    assert_eq!(
        runtime.request("button").unwrap_err(),
        Error::AmbiguousTarget {
            name: "button".to_string()
        }
    );
}

/// A versioned tag resolves against the registry, with the declared
/// version acting as a floor within the major version.
#[test]
fn test_request_by_versioned_tag() {
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();
    let provider = widgets_provider(&queue).shared();

    runtime.declare(DeclareOptions::new(provider));
    runtime.drive(&queue, 32);

    let exports = runtime.request("@acme/widgets#1.0.0:button").unwrap();
    runtime.drive(&queue, 32);
    assert_eq!(exports.get("label"), Some(Value::from("Ok")));

    assert_eq!(
        runtime.request("@acme/widgets#2.0.0:button").unwrap_err(),
        Error::UnknownLibrary {
            specifier: "@acme/widgets#2.0.0".to_string()
        }
    );
}

/// A library specifier that is neither a bound alias nor a registered tag
/// fails to resolve.
#[test]
fn test_unknown_alias_is_rejected() {
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();
    runtime.declare(DeclareOptions::new(widgets_provider(&queue).shared()).with_alias("ui"));
    runtime.drive(&queue, 32);

    assert_eq!(
        runtime.request("nope:button").unwrap_err(),
        Error::UnknownLibrary {
            specifier: "nope".to_string()
        }
    );
}

/// A module the source does not serve surfaces as unavailable, and the
/// failed entry is dropped so a later request retries the fetch.
#[test]
fn test_missing_module_is_reported_and_retried() {
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();
    let provider = widgets_provider(&queue).shared();

    runtime.declare(DeclareOptions::new(provider.clone()).with_alias("ui"));
    runtime.drive(&queue, 32);

    runtime.request("ui:sidebar").unwrap();
    let errors = runtime.drive(&queue, 32);
    assert_eq!(
        errors,
        vec![Error::ModuleUnavailable {
            library: "@acme/widgets#1.2.0".to_string(),
            module: "sidebar".to_string(),
        }]
    );

    runtime.request("ui:sidebar").unwrap();
    runtime.drive(&queue, 32);
    assert_eq!(provider.body_fetches("sidebar"), 2);
}

/// A module body fetch failure is attributed to its source.
#[test]
fn test_module_fetch_failure_is_attributed() {
    let runtime = Runtime::new();
    let queue = DeliveryQueue::new();
    let provider = widgets_provider(&queue)
        .with_module_failure("chart", "connection reset")
        .shared();

    runtime.declare(DeclareOptions::new(provider).with_alias("ui"));
    runtime.drive(&queue, 32);

    runtime.request("ui:chart").unwrap();
    let errors = runtime.drive(&queue, 32);
    assert_eq!(errors, vec![Error::provider("cdn", "connection reset")]);
}
