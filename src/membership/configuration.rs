//! Cluster Configuration
//!
//! Voting members and learners kept in positional slots. A member's
//! `server_id` is derived from its slot, so removal nulls the slot and only
//! trailing runs of vacated slots are compacted.

use tracing::{info, warn};

use super::config_string::{self, ConfigItem};
use super::member::{Member, LEARNER_ID_BASE, MAX_ELECTION_WEIGHT};
use crate::error::{Error, Result};

/// What a membership change needs to know about the local node's role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeadershipView {
    /// The local node currently owns the log
    pub is_owner: bool,
    /// Next index the owner will assign
    pub current_index: u64,
}

/// Replication progress reported for a learner by another member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearnerProgress {
    pub server_id: u64,
    pub match_index: u64,
    pub applied_index: u64,
}

/// Voting members plus learners
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    members: Vec<Option<Member>>,
    learners: Vec<Option<Member>>,
    /// Server id of the local node, 0 when it is not part of the configuration
    local_id: u64,
}

impl Configuration {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from a member string and a learner string.
    ///
    /// The local node is taken from the member string's `@N` suffix.
    pub fn from_strings(members: &str, learners: &str) -> Result<Self> {
        let mut config = Self::new();

        let (items, local) = config_string::split_items(members)?;
        for item in items {
            match config_string::parse_item(item)? {
                ConfigItem::Null => config.members.push(None),
                ConfigItem::Member {
                    address,
                    election_weight,
                    force_sync,
                } => {
                    let mut member = Member::voter(address, election_weight, force_sync);
                    member.server_id = config.members.len() as u64 + 1;
                    config.members.push(Some(member));
                }
                ConfigItem::Learner { address, .. } => {
                    return Err(Error::MembershipParse {
                        input: members.to_string(),
                        reason: format!("learner {:?} in member list", address),
                    });
                }
            }
        }

        let (items, _) = config_string::split_items(learners)?;
        for item in items {
            match config_string::parse_item(item)? {
                ConfigItem::Null => config.learners.push(None),
                ConfigItem::Learner { address, source } => {
                    let mut learner = Member::learner(address, source);
                    learner.server_id = LEARNER_ID_BASE + config.learners.len() as u64;
                    config.learners.push(Some(learner));
                }
                ConfigItem::Member { address, .. } => {
                    warn!(
                        "Learner {:?} has no source, replicating from leader instead",
                        address
                    );
                    let mut learner = Member::learner(address, 0);
                    learner.server_id = LEARNER_ID_BASE + config.learners.len() as u64;
                    config.learners.push(Some(learner));
                }
            }
        }

        if let Some(position) = local {
            let slot = position
                .checked_sub(1)
                .and_then(|i| config.members.get_mut(i as usize))
                .and_then(|s| s.as_mut())
                .ok_or_else(|| Error::MembershipParse {
                    input: members.to_string(),
                    reason: format!("local position {} is not a member", position),
                })?;
            slot.make_local();
            config.local_id = position;
        }

        Ok(config)
    }

    /// Build a configuration from persisted strings, locating the local node
    /// by address in either list.
    pub fn install(members: &str, learners: &str, local_addr: &str) -> Result<Self> {
        let mut config = Self::from_strings(members, learners)?;
        config.set_local_by_addr(local_addr);
        Ok(config)
    }

    fn set_local_by_addr(&mut self, local_addr: &str) {
        for member in self.all_slots_mut() {
            if member.address == local_addr {
                member.make_local();
            } else {
                member.make_remote();
            }
        }
        self.local_id = self.server_id_for_addr(local_addr).unwrap_or(0);
    }

    fn all_slots_mut(&mut self) -> impl Iterator<Item = &mut Member> {
        self.members
            .iter_mut()
            .chain(self.learners.iter_mut())
            .flatten()
    }

    // ---------------------------------------------------------------
    // Lookups
    // ---------------------------------------------------------------

    /// Non-null voting members
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().flatten()
    }

    /// Non-null learners
    pub fn learners(&self) -> impl Iterator<Item = &Member> {
        self.learners.iter().flatten()
    }

    /// Raw member slots, including vacated ones
    pub fn member_slots(&self) -> &[Option<Member>] {
        &self.members
    }

    /// Raw learner slots, including vacated ones
    pub fn learner_slots(&self) -> &[Option<Member>] {
        &self.learners
    }

    pub fn member_count(&self) -> usize {
        self.members().count()
    }

    pub fn learner_count(&self) -> usize {
        self.learners().count()
    }

    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    pub fn local(&self) -> Option<&Member> {
        self.get(self.local_id)
    }

    /// Resolve a server id (voters are `1..`, learners `100..`)
    pub fn get(&self, server_id: u64) -> Option<&Member> {
        if server_id == 0 {
            return None;
        }
        if server_id < LEARNER_ID_BASE {
            self.members
                .get(server_id as usize - 1)
                .and_then(|s| s.as_ref())
        } else {
            self.learners().find(|l| l.server_id == server_id)
        }
    }

    pub fn get_mut(&mut self, server_id: u64) -> Option<&mut Member> {
        if server_id == 0 {
            return None;
        }
        if server_id < LEARNER_ID_BASE {
            self.members
                .get_mut(server_id as usize - 1)
                .and_then(|s| s.as_mut())
        } else {
            self.learners
                .iter_mut()
                .flatten()
                .find(|l| l.server_id == server_id)
        }
    }

    pub fn member_by_addr(&self, addr: &str) -> Option<&Member> {
        self.members().find(|m| m.address == addr)
    }

    pub fn learner_by_addr(&self, addr: &str) -> Option<&Member> {
        self.learners().find(|l| l.address == addr)
    }

    /// Server id of the member or learner with this address
    pub fn server_id_for_addr(&self, addr: &str) -> Option<u64> {
        self.member_by_addr(addr)
            .or_else(|| self.learner_by_addr(addr))
            .map(|m| m.server_id)
    }

    // ---------------------------------------------------------------
    // Quorum arithmetic
    // ---------------------------------------------------------------

    /// True iff `pred` holds for a majority of voting members.
    /// An empty configuration is trivially satisfied.
    pub fn quorum_all<F>(&self, pred: F) -> bool
    where
        F: Fn(&Member) -> bool,
    {
        let total = self.member_count();
        if total == 0 {
            return true;
        }
        let agreeing = self.members().filter(|m| pred(m)).count();
        agreeing >= total / 2 + 1
    }

    /// Highest value reached by a majority of voting members
    pub fn quorum_min<F>(&self, get: F) -> u64
    where
        F: Fn(&Member) -> u64,
    {
        let mut values: Vec<u64> = self.members().map(get).collect();
        if values.is_empty() {
            return 0;
        }
        values.sort_unstable();
        values[(values.len() - 1) / 2]
    }

    /// Minimum over force-sync members; `u64::MAX` when there are none
    pub fn force_min<F>(&self, get: F) -> u64
    where
        F: Fn(&Member) -> u64,
    {
        if self.member_count() == 0 {
            return 0;
        }
        self.members()
            .filter(|m| m.force_sync)
            .map(get)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Minimum over all voting members
    pub fn all_min<F>(&self, get: F) -> u64
    where
        F: Fn(&Member) -> u64,
    {
        if self.member_count() == 0 {
            return 0;
        }
        self.members().map(get).min().unwrap_or(u64::MAX)
    }

    // ---------------------------------------------------------------
    // Weighted leader preference
    // ---------------------------------------------------------------

    /// Any voting member outweighs the local node
    pub fn needs_weight_election(&self, local_weight: u8) -> bool {
        self.members().any(|m| m.election_weight > local_weight)
    }

    /// Heaviest member that acknowledged an epoch after `base_epoch`.
    /// Ties keep the current best; the local node is the default.
    pub fn max_weight_server_id(&self, base_epoch: u64, local_id: u64) -> u64 {
        let mut best_id = local_id;
        let mut best_weight = self.get(local_id).map(|m| m.election_weight).unwrap_or(0);

        for member in self.members() {
            if member.server_id == local_id || member.last_ack_epoch <= base_epoch {
                continue;
            }
            if member.election_weight > best_weight {
                best_id = member.server_id;
                best_weight = member.election_weight;
            }
        }

        best_id
    }

    // ---------------------------------------------------------------
    // Membership changes
    // ---------------------------------------------------------------

    /// Promote the learner at `addr` to a voting member, returning its new id
    pub fn add_member(&mut self, addr: &str, view: LeadershipView) -> Result<u64> {
        let pos = self
            .learners
            .iter()
            .position(|s| s.as_ref().map(|l| l.address == addr).unwrap_or(false))
            .ok_or_else(|| Error::LearnerNotFound(addr.to_string()))?;

        let mut member = match self.learners[pos].take() {
            Some(member) => member,
            None => return Err(Error::LearnerNotFound(addr.to_string())),
        };
        let was_local = member.server_id == self.local_id;
        Self::compact(&mut self.learners);

        member.is_learner = false;
        member.learner_source = 0;
        member.reset_progress();

        let slot = match self.members.iter().position(|s| s.is_none()) {
            Some(free) => free,
            None => {
                self.members.push(None);
                self.members.len() - 1
            }
        };
        member.server_id = slot as u64 + 1;

        if was_local {
            self.local_id = member.server_id;
        } else if view.is_owner {
            member.begin_leadership(view.current_index);
        } else {
            member.step_down();
        }

        info!(
            "Learner {} promoted to voting member {}",
            addr, member.server_id
        );
        let id = member.server_id;
        self.members[slot] = Some(member);
        Ok(id)
    }

    /// Remove the voting member at `addr`
    pub fn del_member(&mut self, addr: &str) -> bool {
        let Some(pos) = self
            .members
            .iter()
            .position(|s| s.as_ref().map(|m| m.address == addr).unwrap_or(false))
        else {
            warn!("del_member: no voting member with address {}", addr);
            return false;
        };

        if let Some(mut member) = self.members[pos].take() {
            member.stop();
            if member.server_id == self.local_id {
                self.local_id = 0;
            }
            info!("Voting member {} ({}) removed", member.server_id, addr);
        }
        Self::compact(&mut self.members);
        true
    }

    /// Add a learner replicating from `source` (0 = the leader)
    pub fn add_learner(&mut self, addr: &str, source: u64, view: LeadershipView) -> bool {
        if self.server_id_for_addr(addr).is_some() {
            warn!("add_learner: {} is already configured", addr);
            return false;
        }

        let slot = match self.learners.iter().position(|s| s.is_none()) {
            Some(free) => free,
            None => {
                self.learners.push(None);
                self.learners.len() - 1
            }
        };

        let mut learner = Member::learner(addr, source);
        learner.server_id = LEARNER_ID_BASE + slot as u64;
        self.apply_learner_source(&mut learner, view);

        info!(
            "Learner {} added as {} (source {})",
            addr, learner.server_id, source
        );
        self.learners[slot] = Some(learner);
        true
    }

    /// Remove the learner at `addr`
    pub fn del_learner(&mut self, addr: &str) -> bool {
        let Some(pos) = self
            .learners
            .iter()
            .position(|s| s.as_ref().map(|l| l.address == addr).unwrap_or(false))
        else {
            warn!("del_learner: no learner with address {}", addr);
            return false;
        };

        if let Some(mut learner) = self.learners[pos].take() {
            learner.stop();
            info!("Learner {} ({}) removed", learner.server_id, addr);
        }
        Self::compact(&mut self.learners);
        true
    }

    /// Remove every learner
    pub fn del_all_learners(&mut self) {
        for learner in self.learners.iter_mut().flatten() {
            learner.stop();
        }
        self.learners.clear();
    }

    /// Remove every voting member except the one at `local_addr`
    pub fn del_all_remote_members(&mut self, local_addr: &str) {
        for slot in self.members.iter_mut() {
            let keep = slot.as_ref().map(|m| m.address == local_addr).unwrap_or(true);
            if !keep {
                if let Some(member) = slot.as_mut() {
                    member.stop();
                }
                *slot = None;
            }
        }
        Self::compact(&mut self.members);
    }

    /// Change force-sync and election weight of a voting member
    pub fn configure_member(&mut self, server_id: u64, force_sync: bool, weight: u8) -> bool {
        if weight > MAX_ELECTION_WEIGHT {
            warn!(
                "configure_member: weight {} for server {} exceeds {}",
                weight, server_id, MAX_ELECTION_WEIGHT
            );
            return false;
        }
        if server_id >= LEARNER_ID_BASE {
            warn!("configure_member: server {} is a learner", server_id);
            return false;
        }
        match self.get_mut(server_id) {
            Some(member) => {
                member.force_sync = force_sync;
                member.election_weight = weight;
                true
            }
            None => {
                warn!("configure_member: unknown server {}", server_id);
                false
            }
        }
    }

    /// Change the replication source of a learner
    pub fn configure_learner(&mut self, server_id: u64, source: u64, view: LeadershipView) -> bool {
        if server_id < LEARNER_ID_BASE {
            warn!("configure_learner: server {} is a voting member", server_id);
            return false;
        }
        let local_id = self.local_id;
        match self.get_mut(server_id) {
            Some(learner) => {
                learner.learner_source = source;
                Self::start_learner_if_sourced(learner, local_id, view);
                true
            }
            None => {
                warn!("configure_learner: unknown server {}", server_id);
                false
            }
        }
    }

    fn apply_learner_source(&self, learner: &mut Member, view: LeadershipView) {
        Self::start_learner_if_sourced(learner, self.local_id, view);
    }

    fn start_learner_if_sourced(learner: &mut Member, local_id: u64, view: LeadershipView) {
        if learner.is_local() {
            return;
        }
        let from_leader = learner.learner_source == 0 && view.is_owner;
        let from_local = local_id != 0 && learner.learner_source == local_id;
        if from_leader || from_local {
            learner.begin_leadership(view.current_index);
        } else {
            learner.step_down();
        }
    }

    /// Start or stop replication to every remote member after a role change
    pub fn apply_leadership(&mut self, view: LeadershipView) {
        let local_id = self.local_id;
        for member in self.members.iter_mut().flatten() {
            if member.is_local() {
                continue;
            }
            if view.is_owner {
                member.begin_leadership(view.current_index);
            } else {
                member.step_down();
            }
        }
        for learner in self.learners.iter_mut().flatten() {
            Self::start_learner_if_sourced(learner, local_id, view);
        }
    }

    // ---------------------------------------------------------------
    // Flow control and progress
    // ---------------------------------------------------------------

    pub fn reset_flow_control(&mut self) {
        for member in self.all_slots_mut() {
            member.flow_control = 0;
        }
    }

    pub fn set_flow_control(&mut self, server_id: u64, value: i64) -> bool {
        match self.get_mut(server_id) {
            Some(member) => {
                member.flow_control = value;
                true
            }
            None => {
                warn!("set_flow_control: unknown server {}", server_id);
                false
            }
        }
    }

    /// Merge learner progress gossiped by another member. Progress only moves forward.
    pub fn merge_learner_progress(&mut self, reports: &[LearnerProgress]) {
        for report in reports {
            if report.server_id < LEARNER_ID_BASE {
                continue;
            }
            if let Some(learner) = self.get_mut(report.server_id) {
                if learner.is_local() {
                    continue;
                }
                learner.match_index = learner.match_index.max(report.match_index);
                learner.applied_index = learner.applied_index.max(report.applied_index);
            }
        }
    }

    /// Record an acknowledgement from a member
    pub fn record_ack(&mut self, server_id: u64, match_index: u64, epoch: u64) {
        if let Some(member) = self.get_mut(server_id) {
            if match_index > member.match_index {
                member.match_index = match_index;
            }
            if member.next_index <= match_index {
                member.next_index = match_index + 1;
            }
            member.last_ack_epoch = member.last_ack_epoch.max(epoch);
        }
    }

    /// Record the local durable index on the local member record
    pub fn set_local_synced(&mut self, index: u64) {
        let local_id = self.local_id;
        if let Some(local) = self.get_mut(local_id) {
            local.set_local_synced(index);
        }
    }

    // ---------------------------------------------------------------
    // Serialization
    // ---------------------------------------------------------------

    /// Member string, with `@local` when the local node is a voting member
    pub fn members_to_string(&self) -> String {
        let local = if self.local_id != 0 && self.local_id < LEARNER_ID_BASE {
            Some(self.local_id)
        } else {
            None
        };
        self.members_to_string_as(local)
    }

    /// Member string rendered from the perspective of `local` (1-based)
    pub fn members_to_string_as(&self, local: Option<u64>) -> String {
        config_string::join_items(
            self.members.iter().map(|s| config_string::member_to_string(s.as_ref())),
            local,
        )
    }

    pub fn learners_to_string(&self) -> String {
        config_string::join_items(
            self.learners
                .iter()
                .map(|s| config_string::learner_to_string(s.as_ref())),
            None,
        )
    }

    fn compact(slots: &mut Vec<Option<Member>>) {
        while matches!(slots.last(), Some(None)) {
            slots.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const A: &str = "10.0.0.1:11001";
    const B: &str = "10.0.0.2:11001";
    const C: &str = "10.0.0.3:11001";

    fn abc() -> Configuration {
        Configuration::from_strings(&format!("{A}#5;{B}#5S;{C}#9@1"), "").unwrap()
    }

    #[test]
    fn test_three_member_scenario() {
        let config = abc();
        assert_eq!(config.member_count(), 3);
        assert!(config.quorum_all(|m| m.address == B || m.address == C));
        assert!(!config.quorum_all(|m| m.address == C));
        assert_eq!(config.members_to_string(), format!("{A}#5;{B}#5S;{C}#9@1"));
        assert!(config.local().unwrap().is_local());
    }

    #[test]
    fn test_quorum_majority_property() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let n = rng.gen_range(0..8usize);
            let members: Vec<String> = (0..n).map(|i| format!("h{i}:1#5")).collect();
            let config = Configuration::from_strings(&members.join(";"), "").unwrap();
            let agree: Vec<bool> = (0..n).map(|_| rng.gen_bool(0.5)).collect();
            let yes = agree.iter().filter(|a| **a).count();

            let result = config.quorum_all(|m| agree[m.server_id as usize - 1]);
            if n == 0 {
                assert!(result);
            } else {
                assert_eq!(result, yes >= n / 2 + 1);
            }
        }
    }

    #[test]
    fn test_quorum_min_monotonic() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let n = rng.gen_range(1..8usize);
            let members: Vec<String> = (0..n).map(|i| format!("h{i}:1")).collect();
            let config = Configuration::from_strings(&members.join(";"), "").unwrap();
            let mut values: Vec<u64> = (0..n).map(|_| rng.gen_range(0..100)).collect();

            let before = config.quorum_min(|m| values[m.server_id as usize - 1]);
            // A majority has reached the returned value
            let reached = values.iter().filter(|v| **v >= before).count();
            assert!(reached >= n / 2 + 1);

            let victim = rng.gen_range(0..n);
            values[victim] = values[victim].saturating_sub(rng.gen_range(1..50));
            let after = config.quorum_min(|m| values[m.server_id as usize - 1]);
            assert!(after <= before);
        }
    }

    #[test]
    fn test_min_sentinels() {
        let empty = Configuration::new();
        assert_eq!(empty.quorum_min(|m| m.match_index), 0);
        assert_eq!(empty.force_min(|m| m.match_index), 0);
        assert_eq!(empty.all_min(|m| m.match_index), 0);

        let config = Configuration::from_strings(&format!("{A}#5;{B}#5"), "").unwrap();
        assert_eq!(config.force_min(|m| m.match_index), u64::MAX);

        let config = abc();
        assert_eq!(config.force_min(|m| m.server_id), 2);
        assert_eq!(config.all_min(|m| m.server_id), 1);
    }

    #[test]
    fn test_config_round_trip_random() {
        let mut rng = rand::thread_rng();
        for round in 0..50 {
            let n_members = rng.gen_range(1..7usize);
            let n_learners = rng.gen_range(0..4usize);
            let mut members = Vec::new();
            for i in 0..n_members {
                // Interior vacated slots survive; trailing ones never appear
                if i > 0 && i + 1 < n_members && rng.gen_bool(0.2) {
                    members.push("0".to_string());
                    continue;
                }
                let weight = rng.gen_range(0..10u8);
                let force = if rng.gen_bool(0.3) { "S" } else { "" };
                members.push(format!("m{round}-{i}.db:3306#{weight}{force}"));
            }
            let voters: Vec<u64> = members
                .iter()
                .enumerate()
                .filter(|(_, m)| *m != "0")
                .map(|(i, _)| i as u64 + 1)
                .collect();
            let local = if rng.gen_bool(0.7) {
                Some(voters[rng.gen_range(0..voters.len())])
            } else {
                None
            };
            let mut member_str = members.join(";");
            if let Some(pos) = local {
                member_str.push_str(&format!("@{pos}"));
            }
            let learners: Vec<String> = (0..n_learners)
                .map(|i| format!("l{round}-{i}.db:3306${}", rng.gen_range(0..4u64)))
                .collect();
            let learner_str = learners.join(";");

            let config = Configuration::from_strings(&member_str, &learner_str).unwrap();
            assert_eq!(config.members_to_string(), member_str);
            assert_eq!(config.learners_to_string(), learner_str);

            let reparsed = Configuration::from_strings(
                &config.members_to_string(),
                &config.learners_to_string(),
            )
            .unwrap();
            assert_eq!(reparsed, config);
        }
    }

    #[test]
    fn test_add_member_promotes_learner() {
        let mut config = Configuration::from_strings(
            &format!("{A}#5;0;{C}#9@1"),
            &format!("{B}$0"),
        )
        .unwrap();
        let view = LeadershipView { is_owner: true, current_index: 17 };

        let id = config.add_member(B, view).unwrap();
        assert_eq!(id, 2);
        assert_eq!(config.learner_count(), 0);
        let promoted = config.get(2).unwrap();
        assert!(!promoted.is_learner);
        assert!(promoted.is_replicating());
        assert_eq!(promoted.next_index, 17);

        let err = config.add_member("10.9.9.9:1", view).unwrap_err();
        assert!(matches!(err, Error::LearnerNotFound(_)));
    }

    #[test]
    fn test_add_member_as_follower_steps_down() {
        let mut config =
            Configuration::from_strings(&format!("{A}#5@1"), &format!("{B}$0")).unwrap();
        config
            .add_member(B, LeadershipView { is_owner: false, current_index: 3 })
            .unwrap();
        assert!(!config.get(2).unwrap().is_replicating());
    }

    #[test]
    fn test_del_member_compacts_trailing() {
        let mut config = abc();
        assert!(config.del_member(B));
        assert_eq!(config.members_to_string(), format!("{A}#5;0;{C}#9@1"));
        assert!(config.del_member(C));
        assert_eq!(config.members_to_string(), format!("{A}#5@1"));
        assert!(!config.del_member("10.9.9.9:1"));
    }

    #[test]
    fn test_learner_lifecycle() {
        let mut config = abc();
        let view = LeadershipView { is_owner: true, current_index: 5 };
        assert!(config.add_learner("10.0.0.4:1", 0, view));
        assert!(config.add_learner("10.0.0.5:1", 3, view));
        assert!(!config.add_learner("10.0.0.4:1", 0, view));

        assert!(config.get(100).unwrap().is_replicating());
        // Sourced from another member, not from us
        assert!(!config.get(101).unwrap().is_replicating());
        assert_eq!(config.learners_to_string(), "10.0.0.4:1$0;10.0.0.5:1$3");

        assert!(config.configure_learner(101, 1, view));
        assert!(config.get(101).unwrap().is_replicating());

        assert!(config.del_learner("10.0.0.4:1"));
        assert_eq!(config.learners_to_string(), "0;10.0.0.5:1$1");
        assert!(config.del_learner("10.0.0.5:1"));
        assert_eq!(config.learner_count(), 0);
        assert!(config.learner_slots().is_empty());
    }

    #[test]
    fn test_configure_member() {
        let mut config = abc();
        assert!(config.configure_member(1, true, 7));
        assert_eq!(config.members_to_string(), format!("{A}#7S;{B}#5S;{C}#9@1"));
        assert!(!config.configure_member(1, true, 10));
        assert!(!config.configure_member(9, true, 3));
    }

    #[test]
    fn test_weighted_election() {
        let mut config = abc();
        assert!(config.needs_weight_election(5));
        assert!(!config.needs_weight_election(9));

        // C has not acknowledged anything recent yet
        assert_eq!(config.max_weight_server_id(10, 1), 1);
        config.record_ack(3, 4, 11);
        config.record_ack(2, 4, 11);
        assert_eq!(config.max_weight_server_id(10, 1), 3);
        // B ties with the local node and never wins
        config.del_member(C);
        assert_eq!(config.max_weight_server_id(10, 1), 1);
    }

    #[test]
    fn test_install_locates_learner_node() {
        let config =
            Configuration::install(&format!("{A}#5;{B}#5"), "10.0.0.4:1$0", "10.0.0.4:1").unwrap();
        assert_eq!(config.local_id(), 100);
        assert!(config.local().unwrap().is_local());
        assert_eq!(config.members_to_string(), format!("{A}#5;{B}#5"));
    }

    #[test]
    fn test_learner_without_source_replicates_from_leader() {
        let config = Configuration::from_strings(&format!("{A}#5@1"), "10.0.0.4:1;10.0.0.5:1$1").unwrap();
        assert_eq!(config.learner_count(), 2);
        let learner = config.get(100).unwrap();
        assert_eq!(learner.address, "10.0.0.4:1");
        assert!(learner.is_learner);
        assert_eq!(learner.learner_source, 0);
        assert_eq!(config.get(101).unwrap().learner_source, 1);
        assert_eq!(config.learners_to_string(), "10.0.0.4:1$0;10.0.0.5:1$1");
    }

    #[test]
    fn test_merge_learner_progress() {
        let mut config = Configuration::from_strings(&format!("{A}#5@1"), "10.0.0.4:1$0").unwrap();
        config.merge_learner_progress(&[LearnerProgress {
            server_id: 100,
            match_index: 9,
            applied_index: 8,
        }]);
        config.merge_learner_progress(&[LearnerProgress {
            server_id: 100,
            match_index: 4,
            applied_index: 4,
        }]);
        let learner = config.get(100).unwrap();
        assert_eq!(learner.match_index, 9);
        assert_eq!(learner.applied_index, 8);
    }
}
