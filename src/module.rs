//! Module Cache & Export Tables
//!
//! A `Module` belongs to exactly one library and is populated exactly
//! once: the first request creates it in the loading state with a waiter
//! queue, the body fetch and execution fill its export table in place,
//! and every later request returns the same cached table. `Exports` is
//! the live handle callers hold while (and after) that happens.

use crate::promise::Settle;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A live, shared export table.
///
/// Cloning the handle does not copy the table: a handle returned before
/// the module finished loading observes the values as they land.
#[derive(Clone, Default)]
pub struct Exports {
    table: Rc<RefCell<BTreeMap<String, Value>>>,
}

impl Exports {
    pub fn new() -> Self {
        Exports::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.table.borrow().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.table.borrow_mut().insert(name.into(), value);
    }

    /// Exported names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.table.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.borrow().is_empty()
    }

    /// Whether two handles refer to the same underlying table.
    pub fn same_table(&self, other: &Exports) -> bool {
        Rc::ptr_eq(&self.table, &other.table)
    }
}

impl std::fmt::Debug for Exports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.table.borrow().iter()).finish()
    }
}

/// Shared handle to a cached module.
pub type ModuleRef = Rc<RefCell<Module>>;

/// One named module within a library.
pub struct Module {
    name: String,
    exports: Exports,
    loaded: bool,
    waiters: Vec<Settle<Exports>>,
}

impl Module {
    /// Create a module entry in the loading state.
    pub(crate) fn new_loading(name: &str) -> ModuleRef {
        Rc::new(RefCell::new(Module {
            name: name.to_string(),
            exports: Exports::new(),
            loaded: false,
            waiters: Vec::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to this module's export table.
    pub fn exports(&self) -> Exports {
        self.exports.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Queue a caller to be notified once loading settles.
    pub(crate) fn add_waiter(&mut self, waiter: Settle<Exports>) {
        self.waiters.push(waiter);
    }

    /// Flip the loaded flag and drain the waiter queue in registration
    /// order.
    pub(crate) fn complete(&mut self) -> Vec<Settle<Exports>> {
        self.loaded = true;
        std::mem::take(&mut self.waiters)
    }

    /// Drain the waiter queue after a failed load; the loaded flag stays
    /// clear so the entry can be dropped and refetched.
    pub(crate) fn fail(&mut self) -> Vec<Settle<Exports>> {
        std::mem::take(&mut self.waiters)
    }
}
