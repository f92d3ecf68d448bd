//! Consensus Context
//!
//! Process-wide consensus state shared by the log store, the prefetch
//! channels and the role state machine. One instance is created per node
//! and passed to every component constructor.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Whether this node owns the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    LogFollower = 0,
    LogOwner = 1,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::LogFollower => write!(f, "LOG_FOLLOWER"),
            Status::LogOwner => write!(f, "LOG_OWNER"),
        }
    }
}

impl Status {
    fn from_u8(value: u8) -> Self {
        if value == Status::LogOwner as u8 {
            Status::LogOwner
        } else {
            Status::LogFollower
        }
    }
}

/// Shared consensus counters
#[derive(Debug)]
pub struct ConsensusContext {
    current_term: AtomicU64,
    status: AtomicU8,
    degrade_term: AtomicU64,
    /// Next index the log will assign
    current_index: AtomicU64,
    /// Highest index known to be durable
    sync_index: AtomicU64,
    /// Highest index known to be committed by a quorum
    commit_index: AtomicU64,
    /// First index the host applier replays after a degrade
    start_apply_index: AtomicU64,
    /// Bumped on every truncation so readers can drop cached positions
    truncate_generation: AtomicU64,
}

impl Default for ConsensusContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsensusContext {
    pub fn new() -> Self {
        Self {
            current_term: AtomicU64::new(0),
            status: AtomicU8::new(Status::LogFollower as u8),
            degrade_term: AtomicU64::new(0),
            current_index: AtomicU64::new(1),
            sync_index: AtomicU64::new(0),
            commit_index: AtomicU64::new(0),
            start_apply_index: AtomicU64::new(0),
            truncate_generation: AtomicU64::new(0),
        }
    }

    pub fn current_term(&self) -> u64 {
        self.current_term.load(Ordering::Acquire)
    }

    pub fn set_current_term(&self, term: u64) {
        self.current_term.store(term, Ordering::Release);
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn degrade_term(&self) -> u64 {
        self.degrade_term.load(Ordering::Acquire)
    }

    pub fn set_degrade_term(&self, term: u64) {
        self.degrade_term.store(term, Ordering::Release);
    }

    pub fn current_index(&self) -> u64 {
        self.current_index.load(Ordering::Acquire)
    }

    pub fn set_current_index(&self, index: u64) {
        self.current_index.store(index, Ordering::Release);
    }

    pub fn sync_index(&self) -> u64 {
        self.sync_index.load(Ordering::Acquire)
    }

    /// Advance the durable index; never moves backward
    pub fn set_sync_index_if_greater(&self, index: u64) -> u64 {
        self.sync_index.fetch_max(index, Ordering::AcqRel).max(index)
    }

    /// Reset the durable index after truncation
    pub fn reset_sync_index(&self, index: u64) {
        self.sync_index.store(index, Ordering::Release);
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }

    /// Advance the commit index; returns true if it moved
    pub fn advance_commit_index(&self, index: u64) -> bool {
        self.commit_index.fetch_max(index, Ordering::AcqRel) < index
    }

    pub fn start_apply_index(&self) -> u64 {
        self.start_apply_index.load(Ordering::Acquire)
    }

    pub fn set_start_apply_index(&self, index: u64) {
        self.start_apply_index.store(index, Ordering::Release);
    }

    pub fn truncate_generation(&self) -> u64 {
        self.truncate_generation.load(Ordering::Acquire)
    }

    pub fn bump_truncate_generation(&self) -> u64 {
        self.truncate_generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_index_is_monotonic() {
        let ctx = ConsensusContext::new();
        assert_eq!(ctx.set_sync_index_if_greater(10), 10);
        assert_eq!(ctx.set_sync_index_if_greater(4), 10);
        assert_eq!(ctx.sync_index(), 10);

        ctx.reset_sync_index(3);
        assert_eq!(ctx.sync_index(), 3);
    }

    #[test]
    fn test_commit_index_and_status() {
        let ctx = ConsensusContext::new();
        assert!(ctx.advance_commit_index(5));
        assert!(!ctx.advance_commit_index(5));
        assert!(!ctx.advance_commit_index(2));
        assert_eq!(ctx.commit_index(), 5);

        assert_eq!(ctx.status(), Status::LogFollower);
        ctx.set_status(Status::LogOwner);
        assert_eq!(ctx.status().to_string(), "LOG_OWNER");
    }
}
