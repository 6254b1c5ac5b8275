// ABOUTME: Kernel runtime contract consumed by the pool and execution sessions
//
// A kernel runtime is a heavyweight, stateful interpreter session. The pool
// only relies on this trait; `process` provides the subprocess-backed
// implementation used by the binary.
//
// Key components:
// - KernelRuntime: lifecycle (start/restart/interrupt/shutdown) plus submit
// - EventChannel: one subscriber's view of the kernel's event stream
// - RuntimeFactory: builds a runtime for a kernel kind

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, KernelError};

pub mod process;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod fake;

pub use process::{ProcessKernel, ProcessKernelFactory};

/// One structured message emitted by a kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelEvent {
    /// Message type, e.g. `status`, `stream`, `execute_input`
    #[serde(rename = "msg_type")]
    pub kind: String,

    /// Message body
    #[serde(rename = "content", default)]
    pub payload: serde_json::Value,
}

impl KernelEvent {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// A `status` event carrying `execution_state`
    pub fn status(state: &str) -> Self {
        Self::new("status", serde_json::json!({ "execution_state": state }))
    }

    /// `execution_state` of a status event, `None` for other kinds
    pub fn execution_state(&self) -> Option<&str> {
        if self.kind != "status" {
            return None;
        }
        self.payload.get("execution_state")?.as_str()
    }
}

/// A consumable stream of kernel events
#[async_trait]
pub trait EventChannel: Send {
    /// Wait for the next event
    async fn next_event(&mut self) -> Result<KernelEvent, ChannelError>;

    /// Release the subscription. Later reads fail with `ChannelError::Closed`.
    fn close(&mut self);
}

/// An external kernel runtime instance
///
/// Implementations arbitrate their own concurrency: an interrupt may arrive
/// while an execution is streaming on an open channel.
#[async_trait]
pub trait KernelRuntime: Send + Sync {
    /// Kind this runtime was created for
    fn kind(&self) -> &str;

    /// Spawn the kernel and complete any handshake
    async fn start(&self) -> Result<(), KernelError>;

    /// Restart in place; open channels stay subscribed
    async fn restart(&self) -> Result<(), KernelError>;

    /// Interrupt the current execution
    async fn interrupt(&self) -> Result<(), KernelError>;

    /// Tear the kernel down. Called at most once per pooled handle.
    async fn shutdown(&self) -> Result<(), KernelError>;

    /// Subscribe to the kernel's events from this point on
    fn open_channel(&self) -> Box<dyn EventChannel>;

    /// Begin executing `code`; results arrive on open channels
    async fn submit(&self, code: &str) -> Result<(), KernelError>;
}

/// Builds kernel runtimes by kind
pub trait RuntimeFactory: Send + Sync {
    /// Construct an unstarted runtime for `kind`
    fn create(&self, kind: &str) -> Result<Arc<dyn KernelRuntime>, KernelError>;
}
