use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the loading runtime.
///
/// Every variant is cheap to clone so it can be stored in a settled
/// promise and handed to each waiting caller independently.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Identifier mismatch: declared {declared} but manifest reports {resolved}")]
    IdentifierMismatch { declared: String, resolved: String },

    #[error("Version mismatch: {library} requires at least {requested} but manifest reports {resolved}")]
    VersionMismatch {
        library: String,
        requested: String,
        resolved: String,
    },

    #[error("Provider error from {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("Manifest for {identifier} is incomplete: {message}")]
    ManifestIncomplete { identifier: String, message: String },

    #[error("Provider {provider} yields no manifest and the declaration pins neither identifier nor version")]
    ManifestUnavailable { provider: String },

    #[error("Promise resolved more than once")]
    MultipleResolve,

    #[error("Promise subscribed more than once")]
    DoubleSubscription,

    #[error("Blocking wait is not permitted in this scope")]
    WaitNotPermitted,

    #[error("Ambiguous target {name}: unqualified names only resolve inside a module body")]
    AmbiguousTarget { name: String },

    #[error("Unknown library: {specifier}")]
    UnknownLibrary { specifier: String },

    #[error("Module {module} is not available from {library}")]
    ModuleUnavailable { library: String, module: String },
}

impl Error {
    /// Wrap a raw provider failure message with the provider's display name.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a parse failure.
    pub fn parse(message: impl Into<String>) -> Self {
        Error::Parse {
            message: message.into(),
        }
    }
}
