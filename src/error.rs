//! Error types for the fleet orchestrator
//!
//! Library errors are structured so the REST layer can decide what a caller
//! sees: `UnsupportedProtocol` and `Validation` are permanent rejections,
//! `DeviceBusy` is retryable once the holder's deletion finishes, and `Apply`
//! carries the cluster failure that left the workload in `Error`.

use thiserror::Error;
use uuid::Uuid;

use crate::cluster::ClusterError;
use crate::store::StoreError;

/// Main error type for orchestrator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No spec template is registered for the requested protocol
    #[error("unsupported protocol '{protocol}' for {kind} workload")]
    UnsupportedProtocol {
        /// Protocol name from the descriptor
        protocol: String,
        /// Workload kind the protocol was requested for
        kind: String,
    },

    /// A cluster object could not be created or replaced
    #[error("failed to apply {kind} '{name}': {source}")]
    Apply {
        /// Object kind (Deployment, Service, ...)
        kind: String,
        /// Object name
        name: String,
        /// Underlying cluster failure
        #[source]
        source: ClusterError,
    },

    /// The physical device is leased or still being released by another workload
    #[error("device {device_path} on node {node} is busy (held by {holder})")]
    DeviceBusy {
        /// Node the device is attached to
        node: String,
        /// Device path on that node
        device_path: String,
        /// Workload currently holding the device
        holder: Uuid,
    },

    /// Workload row does not exist
    #[error("workload {0} not found")]
    NotFound(Uuid),

    /// Descriptor is structurally invalid
    #[error("validation error: {0}")]
    Validation(String),

    /// Cluster error outside of apply (listing, probing)
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Persistence layer error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "deletion", "sweeper")
        context: String,
    },
}

impl Error {
    /// Create an unsupported protocol error
    pub fn unsupported_protocol(protocol: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::UnsupportedProtocol {
            protocol: protocol.into(),
            kind: kind.into(),
        }
    }

    /// Create an apply error for a specific object
    pub fn apply(kind: impl Into<String>, name: impl Into<String>, source: ClusterError) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            source,
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DeviceBusy { .. } => true,
            Self::Apply { source, .. } | Self::Cluster(source) => source.is_transient(),
            Self::Store(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
