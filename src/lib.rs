// ABOUTME: Library crate for kernelpool exposing the pool, sessions and service for the binary and tests

#![allow(missing_docs)]

pub mod auto_exit;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod runtime;
pub mod server;
pub mod service;
pub mod session;

pub use config::{KernelSpec, PoolConfig};
pub use error::{ChannelError, KernelError, Outcome, PoolError, PoolResult};
pub use pool::{IdleSweeper, KernelPool, KernelStatus};
pub use runtime::{EventChannel, KernelEvent, KernelRuntime, RuntimeFactory};
pub use service::{KernelService, Request, Response};
pub use session::ExecutionSession;
