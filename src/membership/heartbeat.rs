//! Heartbeat scheduling
//!
//! One tokio task per remote member. A task only holds the member's id and
//! address and re-resolves the member through the shared configuration on
//! every tick, so removing a member is enough to stop its heartbeats.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::member::{Member, MemberKind};
use super::SharedConfiguration;
use crate::error::Result;

/// Transport used to deliver heartbeats (provided by the RPC layer)
#[async_trait]
pub trait HeartbeatSink: Send + Sync + 'static {
    async fn send_heartbeat(&self, target: &Member, term: u64) -> Result<()>;
}

struct HeartbeatTask {
    address: String,
    handle: JoinHandle<()>,
}

/// Keeps one heartbeat task per remote member
pub struct HeartbeatScheduler {
    config: SharedConfiguration,
    sink: Arc<dyn HeartbeatSink>,
    interval: Duration,
    term: Arc<AtomicU64>,
    tasks: Mutex<HashMap<u64, HeartbeatTask>>,
}

impl HeartbeatScheduler {
    pub fn new(
        config: SharedConfiguration,
        sink: Arc<dyn HeartbeatSink>,
        interval: Duration,
        term: Arc<AtomicU64>,
    ) -> Self {
        Self {
            config,
            sink,
            interval,
            term,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start tasks for newly configured remote members and forget finished ones.
    /// Returns the number of running tasks.
    pub fn sync(&self) -> usize {
        let targets: Vec<(u64, String)> = {
            let mut config = self.config.write();
            let ids: Vec<u64> = config
                .members()
                .chain(config.learners())
                .filter(|m| !m.is_local())
                .map(|m| m.server_id)
                .collect();

            let mut targets = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(member) = config.get_mut(id) {
                    if let MemberKind::Remote(remote) = &mut member.kind {
                        remote.heartbeat_active = true;
                    }
                    targets.push((id, member.address.clone()));
                }
            }
            targets
        };

        let mut tasks = self.tasks.lock();
        tasks.retain(|id, task| {
            let current = targets.iter().any(|(t, addr)| t == id && *addr == task.address);
            if !current {
                task.handle.abort();
            }
            current && !task.handle.is_finished()
        });

        for (id, address) in targets {
            if tasks.contains_key(&id) {
                continue;
            }
            let handle = tokio::spawn(heartbeat_loop(
                id,
                address.clone(),
                self.config.clone(),
                self.sink.clone(),
                self.interval,
                self.term.clone(),
            ));
            debug!("Heartbeat task started for server {} ({})", id, address);
            tasks.insert(id, HeartbeatTask { address, handle });
        }

        tasks.len()
    }

    /// Whether a heartbeat task for `server_id` is still running
    pub fn is_running(&self, server_id: u64) -> bool {
        self.tasks
            .lock()
            .get(&server_id)
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn stop_all(&self) {
        let mut tasks = self.tasks.lock();
        for (_, task) in tasks.drain() {
            task.handle.abort();
        }
        info!("All heartbeat tasks stopped");
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.handle.abort();
        }
    }
}

async fn heartbeat_loop(
    server_id: u64,
    address: String,
    config: SharedConfiguration,
    sink: Arc<dyn HeartbeatSink>,
    interval: Duration,
    term: Arc<AtomicU64>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let target = {
            let config = config.read();
            match config.get(server_id) {
                Some(m) if m.address == address && !m.is_local() => m.clone(),
                _ => break,
            }
        };

        if let Err(e) = sink
            .send_heartbeat(&target, term.load(Ordering::Acquire))
            .await
        {
            debug!("Heartbeat to {} failed: {}", address, e);
        }
    }
    debug!("Heartbeat task for server {} ({}) stopped", server_id, address);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Configuration;
    use parking_lot::RwLock;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSink {
        sent: Mutex<HashMap<u64, usize>>,
        total: AtomicUsize,
    }

    #[async_trait]
    impl HeartbeatSink for CountingSink {
        async fn send_heartbeat(&self, target: &Member, _term: u64) -> Result<()> {
            *self.sent.lock().entry(target.server_id).or_default() += 1;
            self.total.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_heartbeats_stop_when_member_removed() {
        let config = Configuration::from_strings("a:1#5;b:1#5;c:1#5@1", "").unwrap();
        let shared: SharedConfiguration = Arc::new(RwLock::new(config));
        let sink = Arc::new(CountingSink::default());
        let scheduler = HeartbeatScheduler::new(
            shared.clone(),
            sink.clone(),
            Duration::from_millis(5),
            Arc::new(AtomicU64::new(1)),
        );

        // Local member gets no task
        assert_eq!(scheduler.sync(), 2);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(sink.sent.lock().get(&2).copied().unwrap_or(0) > 0);
        assert!(sink.sent.lock().get(&1).is_none());

        shared.write().del_member("b:1");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!scheduler.is_running(2));
        assert!(scheduler.is_running(3));

        scheduler.stop_all();
        assert!(!scheduler.is_running(3));
    }
}
