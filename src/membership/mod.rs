//! Cluster Membership Module
//!
//! Voting members, learners, quorum arithmetic and the membership string
//! format persisted on every membership change.

mod member;
mod configuration;
pub mod config_string;
mod heartbeat;

pub use member::{
    LocalState, Member, MemberKind, RemoteState, DEFAULT_ELECTION_WEIGHT, LEARNER_ID_BASE,
    MAX_ELECTION_WEIGHT,
};
pub use configuration::{Configuration, LeadershipView, LearnerProgress};
pub use heartbeat::{HeartbeatScheduler, HeartbeatSink};

use std::sync::Arc;

/// Configuration shared between the state machine and heartbeat tasks
pub type SharedConfiguration = Arc<parking_lot::RwLock<Configuration>>;
