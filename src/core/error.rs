//! Error taxonomy.
//!
//! Configuration and graph errors abort before any mutation. Provider and
//! connectivity errors abort the remaining apply order but leave applied
//! resources in place. Secret push errors are warnings.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Missing or invalid configuration input.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required variable '{0}'")]
    MissingRequiredVariable(String),

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("invalid variable '{name}': {reason}")]
    InvalidVariable { name: String, reason: String },

    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid environment file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("environment '{name}' is invalid: {}", reasons.join("; "))]
    InvalidEnvironment { name: String, reasons: Vec<String> },
}

/// Problems with the dependency graph between resources.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle detected involving: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("resource '{resource}' depends on unknown resource '{target}'")]
    UnknownReference { resource: String, target: String },

    #[error("resource '{0}' is declared more than once")]
    DuplicateResource(String),

    #[error("resource '{resource}' needs output '{output}' of '{target}', which is not available")]
    UnresolvedOutput {
        resource: String,
        target: String,
        output: String,
    },
}

/// Operation attempted against a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
    Probe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Probe => write!(f, "probe"),
        }
    }
}

/// A remote API rejected an operation. The message is the provider's, verbatim.
#[derive(Debug, Clone, Error)]
#[error("{operation} {resource} failed: {message}")]
pub struct ProviderError {
    pub resource: String,
    pub operation: Operation,
    pub message: String,
}

impl ProviderError {
    pub fn new(resource: &str, operation: Operation, message: impl Into<String>) -> Self {
        Self {
            resource: resource.to_string(),
            operation,
            message: message.into(),
        }
    }
}

/// The database never became reachable within the retry window.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error(
        "{operation} {resource}: database unreachable after {attempts} attempt(s) over {waited_secs}s: {last_error}"
    )]
    UnreachableDatabase {
        resource: String,
        operation: Operation,
        attempts: u32,
        waited_secs: u64,
        last_error: String,
    },
}

/// Forwarding credentials to the external secret store failed.
#[derive(Debug, Clone, Error)]
pub enum SecretPushError {
    #[error("push {resource} to {store} failed: {message}")]
    SecretPushFailed {
        resource: String,
        store: String,
        message: String,
    },
}

/// The persisted state blob could not be read or written.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot read state {location}: {message}")]
    Read { location: String, message: String },

    #[error("invalid state {location}: {message}")]
    Corrupt { location: String, message: String },

    #[error("cannot write state {location}: {message}")]
    Write { location: String, message: String },
}

/// Top-level error returned by every command.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error(transparent)]
    SecretPush(#[from] SecretPushError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Io(_) => 2,
            Self::Graph(_) => 3,
            Self::Provider(_) | Self::SecretPush(_) => 4,
            Self::Connectivity(_) => 5,
            Self::State(_) => 6,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
