//! Prefetch Manager
//!
//! Owns every follower channel and applies global pause/resume and
//! truncation notices to all of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::channel::{ChannelStats, FetchResult, PrefetchChannel};
use crate::config::PrefetchConfig;
use crate::error::Result;
use crate::wal::{LogIndex, LogStore};

pub struct PrefetchManager {
    config: PrefetchConfig,
    store: Arc<LogStore>,
    channels: RwLock<HashMap<u64, Arc<PrefetchChannel>>>,
    disabled: AtomicBool,
}

impl PrefetchManager {
    pub fn new(config: PrefetchConfig, store: Arc<LogStore>) -> Self {
        Self {
            config,
            store,
            channels: RwLock::new(HashMap::new()),
            disabled: AtomicBool::new(false),
        }
    }

    /// Get or create the channel for `channel_id`
    pub fn register(&self, channel_id: u64) -> Arc<PrefetchChannel> {
        if let Some(channel) = self.channels.read().get(&channel_id) {
            return channel.clone();
        }

        let mut channels = self.channels.write();
        channels
            .entry(channel_id)
            .or_insert_with(|| {
                let channel = PrefetchChannel::new(channel_id, self.config.clone(), self.store.clone());
                if self.disabled.load(Ordering::Acquire) {
                    channel.disable();
                }
                debug!("Registered prefetch channel {}", channel_id);
                channel
            })
            .clone()
    }

    pub fn get(&self, channel_id: u64) -> Option<Arc<PrefetchChannel>> {
        self.channels.read().get(&channel_id).cloned()
    }

    /// Stop and forget a channel
    pub fn remove(&self, channel_id: u64) -> bool {
        let channel = self.channels.write().remove(&channel_id);
        match channel {
            Some(channel) => {
                channel.stop();
                debug!("Removed prefetch channel {}", channel_id);
                true
            }
            None => false,
        }
    }

    /// Ask channel `channel_id` to scan from `index`
    pub fn prefetch(&self, channel_id: u64, index: LogIndex) -> Result<()> {
        self.register(channel_id).request(index)
    }

    pub fn fetch(&self, channel_id: u64, index: LogIndex) -> Result<FetchResult> {
        self.register(channel_id).fetch(index)
    }

    /// Stop every scan and refuse new ones until `enable_all`
    pub fn disable_all(&self) {
        self.disabled.store(true, Ordering::Release);
        let channels: Vec<_> = self.channels.read().values().cloned().collect();
        for channel in &channels {
            channel.disable();
        }
        info!("Prefetch disabled on {} channel(s)", channels.len());
    }

    pub fn enable_all(&self) {
        self.disabled.store(false, Ordering::Release);
        for channel in self.channels.read().values() {
            channel.enable();
        }
        info!("Prefetch enabled");
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Forget cached entries from `index` on in every channel
    pub fn truncate_notify(&self, index: LogIndex) {
        for channel in self.channels.read().values() {
            channel.truncate_notify(index);
        }
    }

    /// Stop every channel for shutdown
    pub fn stop_all(&self) {
        let channels: Vec<_> = self.channels.write().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.stop();
        }
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        let mut stats: Vec<_> = self.channels.read().values().map(|c| c.stats()).collect();
        stats.sort_by_key(|s| s.channel_id);
        stats
    }
}
