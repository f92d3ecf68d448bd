//! consensus-log - Consensus Replication Core
//!
//! Cluster membership and log replication engine that keeps a replicated,
//! strictly ordered log consistent across voting members and learners, and
//! drives the owner/follower state machine a host database attaches to.
//!
//! # Architecture
//!
//! Host transaction events are framed by the codec, appended and synced by
//! the log store, streamed to followers through prefetch channels, and
//! committed under the control of the replication state machine. The
//! consensus driver, the RPC transport and the host engine stay outside the
//! crate and are reached through traits.
//!
//! # Features
//!
//! - Quorum arithmetic, weighted leader preference and membership changes
//! - Multi-file durable log with checksums, large entry splitting and
//!   crash recovery
//! - Per-follower read-ahead with backpressure and cancellation
//! - Serialized role transitions that stay safe with commits in flight

pub mod config;
pub mod context;
pub mod error;
pub mod membership;
pub mod prefetch;
pub mod replication;
pub mod state;
pub mod wal;

pub use config::ConsensusLogConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ConsensusLogConfig;
    pub use crate::context::{ConsensusContext, Status};
    pub use crate::error::{Error, Result};
    pub use crate::membership::{Configuration, Member, SharedConfiguration};
    pub use crate::prefetch::{FetchResult, PrefetchManager};
    pub use crate::replication::{
        ConsensusDriver, HostEngine, ReplicationStateMachine, Role, StateMachineParts,
    };
    pub use crate::state::MetaTracker;
    pub use crate::wal::{EntryFlags, LogEntry, LogIndex, LogStore};
}
