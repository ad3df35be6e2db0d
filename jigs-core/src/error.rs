use std::sync::Arc;
use thiserror::Error;

/// Represents all possible errors raised while executing, recording or serializing jigs
#[derive(Error, Debug, Clone)]
pub enum JigError {
    /// The object carries an error location and can no longer be used
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// A private (underscore-prefixed) name was reached from another class
    #[error("Cannot access private property {0}")]
    PrivacyViolation(String),

    /// `origin`, `location` or a declared method was assigned or deleted
    #[error("Cannot set or delete binding {0}")]
    ImmutableBinding(String),

    /// A mutation was attempted from outside one of the object's own methods
    #[error("Illegal mutation: {0}")]
    IllegalMutation(String),

    /// A binding was read while its value is still pending on the ledger
    #[error("{0} is not available until the object is synced")]
    SyncRequired(String),

    /// A nested call failed and the enclosing method returned normally anyway
    #[error("internal errors must not be swallowed: {0}")]
    Unswallowed(Box<JigError>),

    /// A non-recordable helper changed or created state outside any method
    #[error("Illegal state mutation: {0}")]
    IllegalStateMutation(String),

    /// A value could not be represented on the wire
    #[error("Cannot encode {0}")]
    Encode(String),

    /// A wire node could not be turned back into a value
    #[error("Cannot decode: {0}")]
    Decode(String),

    /// An internal object owned by one jig was found inside another jig's state
    #[error("Different owner: {0}")]
    CrossOwnership(String),

    /// Errors surfaced by the transaction builder, passed through unchanged
    #[error("{0}")]
    Builder(Arc<anyhow::Error>),

    /// `init` was invoked on an object that is already initialized
    #[error("init cannot be called twice on {0}")]
    InitCalledTwice(String),

    /// `init` produced a value
    #[error("init must not return a value")]
    InitReturnedValue,

    /// The class definition is malformed
    #[error("Invalid class {0}")]
    InvalidClass(String),

    /// The method does not exist on the target
    #[error("Unknown method {0}")]
    UnknownMethod(String),

    /// The owner binding is not well formed
    #[error("Invalid owner: {0}")]
    InvalidOwner(String),

    /// The satoshis binding is not an integer in range
    #[error("Invalid satoshis: {0}")]
    InvalidSatoshis(String),

    /// `sync` was called while a method body is executing
    #[error("sync cannot be called inside a method")]
    SyncInsideMethod,

    /// A method body used a non-deterministic primitive
    #[error("{primitive} is not deterministic{}", .hint.as_ref().map(|h| format!("\n\nHint: {}", h)).unwrap_or_default())]
    Nondeterministic {
        primitive: String,
        hint: Option<String>,
    },

    /// Error raised by user method code
    #[error("{0}")]
    User(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result alias used across the jigs crates
pub type Result<T> = std::result::Result<T, JigError>;

impl JigError {
    /// Convenience constructor for errors raised by method bodies
    pub fn user(message: impl Into<String>) -> Self {
        JigError::User(message.into())
    }
}

impl From<anyhow::Error> for JigError {
    fn from(err: anyhow::Error) -> Self {
        JigError::Builder(Arc::new(err))
    }
}

impl From<serde_json::Error> for JigError {
    fn from(err: serde_json::Error) -> Self {
        JigError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for JigError {
    fn from(err: std::io::Error) -> Self {
        JigError::Config(err.to_string())
    }
}

impl From<String> for JigError {
    fn from(err: String) -> Self {
        JigError::User(err)
    }
}

impl From<&str> for JigError {
    fn from(err: &str) -> Self {
        JigError::User(err.to_string())
    }
}
