//! Cluster members
//!
//! A member is addressed by its stable `server_id`: voting members are
//! numbered from 1 by slot position, learners from [`LEARNER_ID_BASE`].

use serde::{Deserialize, Serialize};

/// Learner server ids start here (`100 + slot`)
pub const LEARNER_ID_BASE: u64 = 100;

/// Election weight used when none is given
pub const DEFAULT_ELECTION_WEIGHT: u8 = 5;

/// Highest accepted election weight
pub const MAX_ELECTION_WEIGHT: u8 = 9;

/// State kept only for the member that is this process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalState {
    /// Highest index this node has made durable
    pub last_synced_index: u64,
}

/// State kept for a member reached over the network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteState {
    /// Log entries are being shipped to this member
    pub replicating: bool,
    /// A heartbeat task is registered for this member
    pub heartbeat_active: bool,
    /// The transport reported a live connection
    pub connected: bool,
}

/// Local or remote flavour of a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    Local(LocalState),
    Remote(RemoteState),
}

/// A single cluster participant (voting member or learner)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub server_id: u64,
    pub address: String,
    pub election_weight: u8,
    pub force_sync: bool,
    pub is_learner: bool,
    /// Server id a learner replicates from (0 = the leader)
    pub learner_source: u64,
    pub match_index: u64,
    pub next_index: u64,
    pub applied_index: u64,
    pub flow_control: i64,
    pub last_ack_epoch: u64,
    pub kind: MemberKind,
}

impl Member {
    /// Create a voting member
    pub fn voter(address: impl Into<String>, election_weight: u8, force_sync: bool) -> Self {
        Self {
            server_id: 0,
            address: address.into(),
            election_weight,
            force_sync,
            is_learner: false,
            learner_source: 0,
            match_index: 0,
            next_index: 0,
            applied_index: 0,
            flow_control: 0,
            last_ack_epoch: 0,
            kind: MemberKind::Remote(RemoteState::default()),
        }
    }

    /// Create a learner replicating from `source`
    pub fn learner(address: impl Into<String>, source: u64) -> Self {
        let mut member = Self::voter(address, DEFAULT_ELECTION_WEIGHT, false);
        member.is_learner = true;
        member.learner_source = source;
        member
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, MemberKind::Local(_))
    }

    /// Turn this record into the local node's own record
    pub fn make_local(&mut self) {
        if !self.is_local() {
            self.kind = MemberKind::Local(LocalState::default());
        }
    }

    /// Turn this record into a remote peer record
    pub fn make_remote(&mut self) {
        if self.is_local() {
            self.kind = MemberKind::Remote(RemoteState::default());
        }
    }

    /// Whether log entries are currently shipped to this member
    pub fn is_replicating(&self) -> bool {
        match &self.kind {
            MemberKind::Local(_) => false,
            MemberKind::Remote(remote) => remote.replicating,
        }
    }

    /// Start shipping entries from `current_index`
    pub fn begin_leadership(&mut self, current_index: u64) {
        self.next_index = current_index;
        self.match_index = 0;
        if let MemberKind::Remote(remote) = &mut self.kind {
            remote.replicating = true;
        }
    }

    /// Stop shipping entries; the member stays configured
    pub fn step_down(&mut self) {
        if let MemberKind::Remote(remote) = &mut self.kind {
            remote.replicating = false;
        }
    }

    /// Tear down everything owned by the member before removal
    pub fn stop(&mut self) {
        match &mut self.kind {
            MemberKind::Local(_) => {}
            MemberKind::Remote(remote) => {
                remote.replicating = false;
                remote.heartbeat_active = false;
                remote.connected = false;
            }
        }
    }

    /// Reset replication progress counters
    pub fn reset_progress(&mut self) {
        self.match_index = 0;
        self.next_index = 0;
        self.applied_index = 0;
        self.flow_control = 0;
        self.last_ack_epoch = 0;
    }

    /// Record a durable index for the local node
    pub fn set_local_synced(&mut self, index: u64) {
        if let MemberKind::Local(local) = &mut self.kind {
            if index > local.last_synced_index {
                local.last_synced_index = index;
            }
        }
        if index > self.match_index {
            self.match_index = index;
        }
    }
}
