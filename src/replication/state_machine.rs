//! Replication State Machine
//!
//! Owner/follower role controller. Role changes reported by the consensus
//! driver are queued and handled one at a time by a single worker task.
//! Owner-side appends, follower-side appends and commit waiters all go
//! through this type.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::{Role, RoleChangeEvent};
use super::host::{ConsensusDriver, HostEngine};
use crate::config::ConsensusLogConfig;
use crate::context::{ConsensusContext, Status};
use crate::error::{Error, Result};
use crate::membership::{
    Configuration, HeartbeatScheduler, HeartbeatSink, LeadershipView, SharedConfiguration,
};
use crate::prefetch::{FetchResult, PrefetchManager};
use crate::state::MetaTracker;
use crate::wal::entry::FRAME_HEADER_SIZE;
use crate::wal::{EntryFlags, EventReviser, EventWriter, LogEntry, LogIndex, LogStore};

/// Components the state machine drives
pub struct StateMachineParts {
    pub ctx: Arc<ConsensusContext>,
    pub store: Arc<LogStore>,
    pub prefetch: Arc<PrefetchManager>,
    pub meta: Arc<MetaTracker>,
    pub membership: SharedConfiguration,
    pub host: Arc<dyn HostEngine>,
    pub driver: Arc<dyn ConsensusDriver>,
    /// Heartbeats are only sent when a transport is provided
    pub heartbeat_sink: Option<Arc<dyn HeartbeatSink>>,
}

/// Role controller for one node
pub struct ReplicationStateMachine {
    ctx: Arc<ConsensusContext>,
    store: Arc<LogStore>,
    prefetch: Arc<PrefetchManager>,
    meta: Arc<MetaTracker>,
    membership: SharedConfiguration,
    host: Arc<dyn HostEngine>,
    driver: Arc<dyn ConsensusDriver>,
    heartbeats: Option<HeartbeatScheduler>,
    heartbeat_term: Arc<AtomicU64>,
    local_addr: String,

    events_tx: mpsc::Sender<RoleChangeEvent>,
    /// Status the node will have once every queued event is handled
    projected: Mutex<Status>,

    /// Held exclusively for the whole of a transition
    status_lock: RwLock<()>,
    /// Held shared by appends in flight; a degrade drains them
    commit_lock: RwLock<()>,
    append_lock: Mutex<()>,

    commit_tx: watch::Sender<u64>,
    shutdown: Notify,
    shutting_down: AtomicBool,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationStateMachine {
    /// Build the state machine and spawn its role-change worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &ConsensusLogConfig, parts: StateMachineParts) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(config.cluster.role_queue_capacity);
        let (commit_tx, _) = watch::channel(parts.ctx.commit_index());
        let heartbeat_term = Arc::new(AtomicU64::new(parts.ctx.current_term()));

        let heartbeats = parts.heartbeat_sink.map(|sink| {
            HeartbeatScheduler::new(
                parts.membership.clone(),
                sink,
                config.heartbeat_interval(),
                heartbeat_term.clone(),
            )
        });

        let sm = Arc::new(Self {
            projected: Mutex::new(parts.ctx.status()),
            ctx: parts.ctx,
            store: parts.store,
            prefetch: parts.prefetch,
            meta: parts.meta,
            membership: parts.membership,
            host: parts.host,
            driver: parts.driver,
            heartbeats,
            heartbeat_term,
            local_addr: config.node.address.clone(),
            events_tx,
            status_lock: RwLock::new(()),
            commit_lock: RwLock::new(()),
            append_lock: Mutex::new(()),
            commit_tx,
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
            worker: parking_lot::Mutex::new(None),
        });

        let handle = tokio::spawn(sm.clone().run_worker(events_rx));
        *sm.worker.lock() = Some(handle);
        sm
    }

    pub fn context(&self) -> &Arc<ConsensusContext> {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub fn membership(&self) -> &SharedConfiguration {
        &self.membership
    }

    pub fn status(&self) -> Status {
        self.ctx.status()
    }

    // ---------------------------------------------------------------
    // Role changes
    // ---------------------------------------------------------------

    /// Queue a role change reported by the consensus driver
    pub async fn on_role_change(&self, role: Role, term: u64, commit_index: u64) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let mut projected = self.projected.lock().await;
        let Some(event) = RoleChangeEvent::classify(role, term, commit_index, *projected) else {
            debug!(
                "Ignoring role change to {} in term {} (status {})",
                role, term, *projected
            );
            return Ok(());
        };

        self.events_tx
            .send(event)
            .await
            .map_err(|_| Error::ShuttingDown)?;
        *projected = event.status_after(*projected);
        debug!("Queued {:?} after role change to {}", event, role);
        Ok(())
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::Receiver<RoleChangeEvent>) {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                break;
            }

            let event = tokio::select! {
                _ = self.shutdown.notified() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let result = match event {
                RoleChangeEvent::Degrade { term, index } => self.degrade(term, index).await,
                RoleChangeEvent::Upgrade { term, index } => self.upgrade(term, index).await,
                RoleChangeEvent::ChangeTerm { term } => {
                    self.change_term(term);
                    Ok(())
                }
            };

            if let Err(e) = result {
                error!("Role transition {:?} failed: {}", event, e);
                self.host.on_fatal(&e);
            }
        }
        debug!("Role change worker stopped");
    }

    async fn disable_prefetch(&self) -> Result<()> {
        let prefetch = self.prefetch.clone();
        tokio::task::spawn_blocking(move || prefetch.disable_all())
            .await
            .map_err(|e| Error::Internal(format!("prefetch disable task failed: {}", e)))
    }

    /// Step down from owner to follower.
    ///
    /// Commits waiting past `index` fail with `LeadershipChanged`; the host
    /// applier resumes from `index + 1`.
    pub async fn degrade(&self, term: u64, index: u64) -> Result<()> {
        info!("Degrading to follower in term {} at index {}", term, index);
        self.disable_prefetch().await?;

        let result = self.degrade_locked(term, index).await;

        self.prefetch.enable_all();
        match &result {
            Ok(()) => info!("Degrade to follower in term {} finished", term),
            Err(e) => error!("Degrade to follower in term {} failed: {}", term, e),
        }
        result
    }

    async fn degrade_locked(&self, term: u64, index: u64) -> Result<()> {
        self.meta.set_start_apply_index(index).await?;
        self.ctx.set_start_apply_index(index);
        self.ctx.set_degrade_term(term);
        self.notify_commit_waiters();

        let _status = self.status_lock.write().await;
        // In-flight appends finish before the log changes hands
        drop(self.commit_lock.write().await);

        self.host.flush_engine().await?;
        self.store.sync()?;

        self.ctx.set_current_term(term);
        self.ctx.set_status(Status::LogFollower);
        self.heartbeat_term.store(term, Ordering::Release);

        self.membership.write().apply_leadership(LeadershipView {
            is_owner: false,
            current_index: self.ctx.current_index(),
        });
        if let Some(heartbeats) = &self.heartbeats {
            heartbeats.stop_all();
        }

        self.meta.set_current_term(term).await?;
        self.meta.set_recover_status(Status::LogFollower).await?;

        self.host.start_applier(index + 1).await?;
        self.notify_commit_waiters();
        Ok(())
    }

    /// Take ownership of the log once the applier has caught up to `index`
    pub async fn upgrade(&self, term: u64, index: u64) -> Result<()> {
        info!("Upgrading to owner in term {} after index {}", term, index);
        self.host.drain_applier(index).await?;
        self.disable_prefetch().await?;

        let result = self.upgrade_locked(term).await;

        self.prefetch.enable_all();
        match &result {
            Ok(()) => info!("Upgrade to owner in term {} finished", term),
            Err(e) => error!("Upgrade to owner in term {} failed: {}", term, e),
        }
        result
    }

    async fn upgrade_locked(&self, term: u64) -> Result<()> {
        self.host.kill_log_readers().await?;

        let _status = self.status_lock.write().await;
        self.host.flush_engine().await?;
        let last = self.store.sync()?;
        self.host.reset_apply_progress().await?;

        self.meta.set_last_leader_term(term).await?;
        self.meta.set_recover_status(Status::LogOwner).await?;
        self.meta.set_current_term(term).await?;

        self.ctx.set_current_term(term);
        self.ctx.set_status(Status::LogOwner);
        self.heartbeat_term.store(term, Ordering::Release);

        {
            let mut membership = self.membership.write();
            membership.apply_leadership(LeadershipView {
                is_owner: true,
                current_index: self.ctx.current_index(),
            });
            membership.set_local_synced(last);
        }
        if let Some(heartbeats) = &self.heartbeats {
            heartbeats.sync();
        }

        self.update_commit_index();
        Ok(())
    }

    /// Move to a new term without changing role
    pub fn change_term(&self, term: u64) {
        debug!("Changing term to {}", term);
        self.ctx.set_current_term(term);
        self.heartbeat_term.store(term, Ordering::Release);
    }

    // ---------------------------------------------------------------
    // Owner side
    // ---------------------------------------------------------------

    /// True when this node owns the log and the driver agrees on the term
    pub fn is_ready(&self) -> bool {
        self.ctx.status() == Status::LogOwner && self.driver.term() == self.ctx.current_term()
    }

    fn check_owner(&self, term: u64) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let status = self.ctx.status();
        if status != Status::LogOwner {
            return Err(Error::NotOwner(status.to_string()));
        }
        let current = self.ctx.current_term();
        if term != current {
            return Err(Error::TermMismatch {
                expected: current,
                actual: term,
            });
        }
        Ok(())
    }

    /// Append one entry as owner, sync it and return its index
    pub async fn try_append(&self, entry: LogEntry) -> Result<LogIndex> {
        let _status = self.status_lock.read().await;
        self.check_owner(entry.term)?;
        let _commit = self.commit_lock.read().await;

        let (index, synced) = {
            let _append = self.append_lock.lock().await;
            let index = self.store.append(entry)?;
            (index, self.store.sync()?)
        };
        self.on_local_synced(synced);
        Ok(index)
    }

    /// Append `payload` in `term`. Returns the assigned index, or 0 when the
    /// entry was rejected.
    pub async fn append(&self, payload: Bytes, term: u64) -> u64 {
        match self.try_append(LogEntry::new(term, EntryFlags::NONE, payload)).await {
            Ok(index) => index,
            Err(e) => {
                warn!("Append in term {} rejected: {}", term, e);
                0
            }
        }
    }

    /// Append a transaction made of serialized events.
    ///
    /// Events are grouped into entries no larger than the maximum entry size;
    /// a transaction that does not fit is written as a run of `LARGE_TRX`
    /// entries. Returns the first and last index written.
    pub async fn append_transaction(&self, events: &[Bytes], term: u64) -> Result<(LogIndex, LogIndex)> {
        if events.is_empty() {
            return Err(Error::MalformedEvent("empty transaction".into()));
        }

        let _status = self.status_lock.read().await;
        self.check_owner(term)?;
        let _commit = self.commit_lock.read().await;

        let policy = self.store.policy();
        let (first, last, synced) = {
            let _append = self.append_lock.lock().await;
            let mut first = 0;
            let mut last = 0;
            for (flag, chunk) in policy.chunk_transaction(events) {
                let projected = self.store.tail_offset() + FRAME_HEADER_SIZE as u64;
                let mut writer =
                    EventWriter::begin(term, self.ctx.current_index(), policy.checksum, projected);
                for event in &chunk {
                    writer.write(event)?;
                }
                let entry = writer.finish()?.into_entry(flag);
                last = self.store.append(entry)?;
                if first == 0 {
                    first = last;
                }
            }
            (first, last, self.store.sync()?)
        };

        if first != last {
            debug!("Transaction written as entries {}..={}", first, last);
        }
        self.on_local_synced(synced);
        Ok((first, last))
    }

    // ---------------------------------------------------------------
    // Follower side
    // ---------------------------------------------------------------

    /// Append entries received from the owner. Returns the last index written.
    pub async fn append_replicated(&self, entries: Vec<LogEntry>) -> Result<LogIndex> {
        let _status = self.status_lock.read().await;
        if self.ctx.status() != Status::LogFollower {
            return Err(Error::State("replicated entries rejected by the log owner".into()));
        }

        let checksum = self.store.config().checksum;
        let _append = self.append_lock.lock().await;
        let mut last = self.store.last_index();

        for mut entry in entries {
            let expected = self.ctx.current_index();
            if entry.index != expected {
                return Err(Error::IndexMismatch {
                    expected,
                    actual: entry.index,
                });
            }

            if checksum && entry.checksum != 0 {
                let computed = entry.compute_checksum();
                if computed != entry.checksum {
                    return Err(Error::ChecksumMismatch {
                        index: entry.index,
                        stored: entry.checksum,
                        computed,
                    });
                }
            }

            if entry.flag.contains(EntryFlags::EVENTS) {
                let start = self.store.tail_offset() + FRAME_HEADER_SIZE as u64;
                let mut buf = BytesMut::from(&entry.payload[..]);
                EventReviser::new(start, checksum).revise_in_place(&mut buf)?;
                entry.payload = buf.freeze();
            }

            last = self.store.append(entry)?;
        }

        let synced = self.store.sync()?;
        self.membership.write().set_local_synced(synced);
        Ok(last)
    }

    /// Drop an uncommitted tail left by a previous owner, from `index` on
    pub async fn truncate_from(&self, index: LogIndex) -> Result<()> {
        let _status = self.status_lock.write().await;
        if self.ctx.status() != Status::LogFollower {
            return Err(Error::State("the log owner cannot truncate its log".into()));
        }
        let commit = self.ctx.commit_index();
        if index <= commit {
            return Err(Error::State(format!(
                "cannot truncate from {}, index {} is committed",
                index, commit
            )));
        }

        let _append = self.append_lock.lock().await;
        self.store.truncate_from(index)?;
        self.prefetch.truncate_notify(index);
        info!("Follower log truncated from index {}", index);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Commit tracking
    // ---------------------------------------------------------------

    fn notify_commit_waiters(&self) {
        self.commit_tx.send_replace(self.ctx.commit_index());
    }

    fn on_local_synced(&self, index: u64) {
        self.membership.write().set_local_synced(index);
        self.update_commit_index();
    }

    /// Recompute the commit index from member progress (owner only)
    fn update_commit_index(&self) {
        if self.ctx.status() != Status::LogOwner {
            return;
        }
        let candidate = {
            let membership = self.membership.read();
            if membership.member_count() == 0 {
                self.ctx.sync_index()
            } else {
                membership.quorum_min(|m| m.match_index)
            }
        };
        self.advance_commit_index(candidate);
    }

    /// Advance the commit index, never past the durable index
    pub fn advance_commit_index(&self, index: u64) -> bool {
        let index = index.min(self.ctx.sync_index());
        if self.ctx.advance_commit_index(index) {
            self.notify_commit_waiters();
            true
        } else {
            false
        }
    }

    /// Record a replication acknowledgement from a member
    pub fn record_ack(&self, server_id: u64, match_index: u64) {
        let epoch = self.ctx.current_term();
        self.membership.write().record_ack(server_id, match_index, epoch);
        self.update_commit_index();
    }

    /// Wait until `index`, appended in `term`, is committed.
    ///
    /// Fails with `LeadershipChanged` when the node degraded past `index`
    /// before it committed.
    pub async fn wait_commit(&self, index: u64, term: u64) -> Result<()> {
        let mut rx = self.commit_tx.subscribe();
        loop {
            if self.ctx.commit_index() >= index {
                return Ok(());
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::ShuttingDown);
            }
            if self.ctx.degrade_term() > term {
                if index > self.ctx.start_apply_index() {
                    return Err(Error::LeadershipChanged { term, index });
                }
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(Error::ShuttingDown);
            }
        }
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    pub fn get_entry(&self, index: LogIndex) -> Result<LogEntry> {
        self.store.get_entry(index)
    }

    /// Start reading ahead from `index` for a follower channel
    pub fn prefetch(&self, channel_id: u64, index: LogIndex) -> Result<()> {
        self.prefetch.prefetch(channel_id, index)
    }

    pub fn fetch(&self, channel_id: u64, index: LogIndex) -> Result<FetchResult> {
        self.prefetch.fetch(channel_id, index)
    }

    pub fn find_position(&self, index: LogIndex) -> Result<(String, u64)> {
        self.store.find_position(index)
    }

    // ---------------------------------------------------------------
    // Membership changes
    // ---------------------------------------------------------------

    fn leadership_view(&self) -> LeadershipView {
        LeadershipView {
            is_owner: self.ctx.status() == Status::LogOwner,
            current_index: self.ctx.current_index(),
        }
    }

    async fn persist_membership(&self) -> Result<()> {
        let (members, learners) = {
            let membership = self.membership.read();
            (membership.members_to_string(), membership.learners_to_string())
        };
        self.meta.set_cluster(&members, &learners).await?;
        if let Some(heartbeats) = &self.heartbeats {
            heartbeats.sync();
        }
        info!("Membership changed: members {:?}, learners {:?}", members, learners);
        Ok(())
    }

    pub async fn add_learner(&self, addr: &str, source: u64) -> Result<()> {
        let view = self.leadership_view();
        if !self.membership.write().add_learner(addr, source, view) {
            return Err(Error::State(format!("{} is already configured", addr)));
        }
        self.persist_membership().await
    }

    pub async fn del_learner(&self, addr: &str) -> Result<()> {
        if !self.membership.write().del_learner(addr) {
            return Err(Error::LearnerNotFound(addr.to_string()));
        }
        self.persist_membership().await
    }

    /// Promote a learner to a voting member; returns its new server id
    pub async fn add_member(&self, addr: &str) -> Result<u64> {
        let view = self.leadership_view();
        let id = self.membership.write().add_member(addr, view)?;
        self.persist_membership().await?;
        Ok(id)
    }

    pub async fn del_member(&self, addr: &str) -> Result<()> {
        if !self.membership.write().del_member(addr) {
            return Err(Error::MemberNotFound(addr.to_string()));
        }
        self.persist_membership().await
    }

    pub async fn configure_member(&self, server_id: u64, force_sync: bool, weight: u8) -> Result<()> {
        if !self.membership.write().configure_member(server_id, force_sync, weight) {
            return Err(Error::MemberNotFound(format!(
                "cannot configure server {} with weight {}",
                server_id, weight
            )));
        }
        self.persist_membership().await
    }

    pub async fn configure_learner(&self, server_id: u64, source: u64) -> Result<()> {
        let view = self.leadership_view();
        if !self.membership.write().configure_learner(server_id, source, view) {
            return Err(Error::LearnerNotFound(format!("server {}", server_id)));
        }
        self.persist_membership().await
    }

    /// Replace the whole configuration with the given strings
    pub async fn install_configuration(&self, members: &str, learners: &str) -> Result<()> {
        let mut config = Configuration::install(members, learners, &self.local_addr)?;
        config.apply_leadership(self.leadership_view());
        *self.membership.write() = config;
        self.persist_membership().await
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Restore term, status and membership from metadata at startup.
    ///
    /// When recovering as a follower from a restored snapshot, pass the
    /// applier's next index as `applier_next_index`; log entries from that
    /// index on are discarded and fetched again from the owner.
    pub async fn recover(&self, applier_next_index: Option<LogIndex>) -> Result<Status> {
        let meta = self.meta.snapshot().await?;

        if let Some(members) = meta.cluster_info.as_deref() {
            let learners = meta.cluster_learner_info.as_deref().unwrap_or("");
            let config = Configuration::install(members, learners, &self.local_addr)?;
            *self.membership.write() = config;
        }

        let status = meta.recover_status;
        if status == Status::LogFollower {
            if let Some(next) = applier_next_index.filter(|&n| n > 0) {
                if next <= self.store.last_index() {
                    info!("Truncating log from index {} to match the applier", next);
                    self.store.truncate_from(next)?;
                    self.prefetch.truncate_notify(next);
                }
            }
        }

        self.ctx.set_current_term(meta.current_term);
        self.heartbeat_term.store(meta.current_term, Ordering::Release);
        self.ctx.set_start_apply_index(meta.start_apply_index);
        self.ctx.set_status(status);
        *self.projected.lock().await = status;

        let synced = self.ctx.sync_index();
        {
            let mut membership = self.membership.write();
            membership.apply_leadership(self.leadership_view());
            membership.set_local_synced(synced);
        }
        if status == Status::LogOwner {
            if let Some(heartbeats) = &self.heartbeats {
                heartbeats.sync();
            }
            self.update_commit_index();
        }

        info!(
            "Recovered as {} in term {} (last index {}, start apply index {})",
            status,
            meta.current_term,
            self.store.last_index(),
            meta.start_apply_index
        );
        Ok(status)
    }

    /// Stop the worker, heartbeats and prefetch threads, then sync the log
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down replication state machine");

        self.shutdown.notify_one();
        self.notify_commit_waiters();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Role change worker ended abnormally: {}", e);
            }
        }

        if let Some(heartbeats) = &self.heartbeats {
            heartbeats.stop_all();
        }

        let prefetch = self.prefetch.clone();
        tokio::task::spawn_blocking(move || prefetch.stop_all())
            .await
            .map_err(|e| Error::Internal(format!("prefetch stop task failed: {}", e)))?;

        self.store.sync()?;
        Ok(())
    }
}
