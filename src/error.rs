// ABOUTME: Error taxonomy for the kernel pool
//
// Three layers:
// - KernelError: a call into a kernel runtime failed (spawn, signal, stdin write)
// - ChannelError: reading a kernel's event channel failed mid-execution
// - PoolError: what pool callers see, wrapping KernelError with the key involved
//
// Absence of a key is never an error: interrupt/shutdown report Outcome::Absent.

use thiserror::Error;

/// Errors raised by a kernel runtime implementation
#[derive(Debug, Error)]
pub enum KernelError {
    /// No kernel spec is configured for the requested kind
    #[error("Unknown kernel kind: {0}")]
    UnknownKind(String),

    /// Process spawn failed
    #[error("Failed to spawn kernel process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// Kernel spec has an unusable command
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Operation needs a running kernel process
    #[error("Kernel process not running")]
    NotRunning,

    /// I/O error talking to the kernel process
    #[error("Kernel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Request could not be encoded for the kernel
    #[error("Failed to encode kernel request: {0}")]
    Encode(#[from] serde_json::Error),

    /// Delivering a signal to the kernel process failed
    #[error("Failed to signal kernel process: {0}")]
    Signal(String),

    /// Termination failed
    #[error("Failed to terminate kernel process: {0}")]
    TerminateFailed(#[source] std::io::Error),
}

/// Faults observed while draining a kernel's event channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The kernel process went away while the channel was open
    #[error("Kernel exited: {0}")]
    KernelExited(String),

    /// The subscriber fell behind and events were dropped
    #[error("Event channel lagged, {0} events dropped")]
    Lagged(u64),

    /// The channel was already released
    #[error("Event channel closed")]
    Closed,
}

/// Errors that can occur during pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// The kernel for a key could not be created or started
    #[error("Failed to start kernel '{key}': {source}")]
    Creation {
        key: String,
        #[source]
        source: KernelError,
    },

    /// restart/interrupt/shutdown failed inside the runtime
    #[error("Kernel '{key}' {op} failed: {source}")]
    RuntimeOperation {
        key: String,
        op: &'static str,
        #[source]
        source: KernelError,
    },
}

impl PoolError {
    pub(crate) fn creation(key: &str, source: KernelError) -> Self {
        Self::Creation {
            key: key.to_string(),
            source,
        }
    }

    pub(crate) fn runtime(key: &str, op: &'static str, source: KernelError) -> Self {
        Self::RuntimeOperation {
            key: key.to_string(),
            op,
            source,
        }
    }

    /// Key the failed operation targeted
    pub fn key(&self) -> &str {
        match self {
            Self::Creation { key, .. } | Self::RuntimeOperation { key, .. } => key,
        }
    }
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Result of an operation whose target may legitimately be missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The key had a live kernel and the operation was applied
    Applied,
    /// No kernel was registered for the key; nothing was done
    Absent,
}
