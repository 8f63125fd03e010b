//! keel ops: the optimistic-concurrency update protocol and the lifecycle
//! orchestrator built on top of it.
//!
//! Everything here is generic over [`Representation`](keel_core::Representation)
//! and [`Transport`](keel_kubehub::Transport), so the same code drives typed
//! and dynamic objects against a real cluster or the in-memory control plane.

#![forbid(unsafe_code)]

pub mod lifecycle;
pub mod retry;
pub mod update;
pub mod workload;

pub use lifecycle::{Lifecycle, Phase, PhaseError, RunReport};
pub use retry::RetryPolicy;
pub use update::{update_with_retry, UpdateOutcome};
pub use workload::{Mutation, StatefulWorkload, WorkloadSpec};
