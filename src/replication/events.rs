//! Role change events
//!
//! The consensus driver reports role changes as `(role, term, commit_index)`.
//! They are turned into transition events when queued, against the status
//! the node will have once every earlier event has been handled.

use serde::{Deserialize, Serialize};

use crate::context::Status;

/// Role reported by the consensus driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
    Candidate,
    Learner,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "LEADER"),
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Candidate => write!(f, "CANDIDATE"),
            Role::Learner => write!(f, "LEARNER"),
        }
    }
}

/// A transition for the role worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChangeEvent {
    /// Owner steps down; `index` is the commit point to resume applying from
    Degrade { term: u64, index: u64 },
    /// Follower takes ownership once everything up to `index` is applied
    Upgrade { term: u64, index: u64 },
    /// Follower moves to a new term
    ChangeTerm { term: u64 },
}

impl RoleChangeEvent {
    /// Map a driver notification to an event given the projected status.
    ///
    /// A candidate that does not own the log has nothing to do, and a
    /// leader notification for a node that already owns the log is dropped.
    pub fn classify(role: Role, term: u64, commit_index: u64, projected: Status) -> Option<Self> {
        match (role, projected) {
            (Role::Leader, Status::LogFollower) => Some(RoleChangeEvent::Upgrade {
                term,
                index: commit_index,
            }),
            (Role::Leader, Status::LogOwner) => None,
            (_, Status::LogOwner) => Some(RoleChangeEvent::Degrade {
                term,
                index: commit_index,
            }),
            (Role::Candidate, Status::LogFollower) => None,
            (_, Status::LogFollower) => Some(RoleChangeEvent::ChangeTerm { term }),
        }
    }

    pub fn term(&self) -> u64 {
        match self {
            RoleChangeEvent::Degrade { term, .. }
            | RoleChangeEvent::Upgrade { term, .. }
            | RoleChangeEvent::ChangeTerm { term } => *term,
        }
    }

    /// Status after this event has been applied
    pub fn status_after(&self, before: Status) -> Status {
        match self {
            RoleChangeEvent::Degrade { .. } => Status::LogFollower,
            RoleChangeEvent::Upgrade { .. } => Status::LogOwner,
            RoleChangeEvent::ChangeTerm { .. } => before,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            RoleChangeEvent::classify(Role::Leader, 3, 10, Status::LogFollower),
            Some(RoleChangeEvent::Upgrade { term: 3, index: 10 })
        );
        assert_eq!(
            RoleChangeEvent::classify(Role::Follower, 4, 12, Status::LogOwner),
            Some(RoleChangeEvent::Degrade { term: 4, index: 12 })
        );
        // An owner losing leadership to a candidate state still degrades
        assert_eq!(
            RoleChangeEvent::classify(Role::Candidate, 4, 12, Status::LogOwner),
            Some(RoleChangeEvent::Degrade { term: 4, index: 12 })
        );
        assert_eq!(
            RoleChangeEvent::classify(Role::Follower, 5, 0, Status::LogFollower),
            Some(RoleChangeEvent::ChangeTerm { term: 5 })
        );
        assert_eq!(
            RoleChangeEvent::classify(Role::Learner, 5, 0, Status::LogFollower),
            Some(RoleChangeEvent::ChangeTerm { term: 5 })
        );
        assert_eq!(RoleChangeEvent::classify(Role::Candidate, 5, 0, Status::LogFollower), None);
        assert_eq!(RoleChangeEvent::classify(Role::Leader, 5, 0, Status::LogOwner), None);
    }

    #[test]
    fn test_status_after() {
        let up = RoleChangeEvent::Upgrade { term: 2, index: 1 };
        assert_eq!(up.status_after(Status::LogFollower), Status::LogOwner);
        let bump = RoleChangeEvent::ChangeTerm { term: 3 };
        assert_eq!(bump.status_after(Status::LogOwner), Status::LogOwner);
        assert_eq!(bump.term(), 3);
    }
}
