//! Replication Module
//!
//! Role transitions between log owner and log follower, owner and follower
//! append paths, and commit tracking.

mod events;
mod host;
mod state_machine;

pub use events::{Role, RoleChangeEvent};
pub use host::{ConsensusDriver, HostEngine};
pub use state_machine::{ReplicationStateMachine, StateMachineParts};
