pub mod context;
pub mod error;
pub mod module;
pub mod promise;
pub mod provider;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod specifier;
pub mod value;
pub mod version;

pub use error::{Error, Result};
pub use module::Exports;
pub use promise::{Promise, Settle};
pub use provider::{DeliveryQueue, MemoryProvider, SourceProvider};
pub use registry::{DeclareOptions, LibraryRef, Manifest};
pub use runtime::{ModuleScope, Runtime, Scope, TickReport};
pub use scheduler::StepOutcome;
pub use value::Value;
pub use version::Version;
