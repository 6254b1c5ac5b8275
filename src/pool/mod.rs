// ABOUTME: Keyed kernel pool with per-key locking and idle eviction
//
// Key components:
// - KeyLockRegistry: one async lock per key, created on demand
// - KernelHandle: a pooled runtime plus its activity timestamp
// - KernelPool: lazy creation, at most one kernel per key
// - IdleSweeper: background eviction of idle kernels

pub mod handle;
pub mod keyed_pool;
pub mod lock_registry;
pub mod sweeper;

pub use handle::KernelHandle;
pub use keyed_pool::{KernelInfo, KernelPool, KernelStatus};
pub use lock_registry::{KeyLock, KeyLockRegistry};
pub use sweeper::{IdleSweeper, SweepReport};
