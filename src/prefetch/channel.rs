//! Prefetch Channel
//!
//! One channel per follower. A background thread scans the log store from
//! the requested index and fills a bounded cache that the replication
//! sender drains through `fetch`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, trace};

use crate::config::PrefetchConfig;
use crate::error::{Error, Result};
use crate::wal::{EntryFlags, LogEntry, LogIndex, LogStore};

/// Outcome of offering an entry to the channel cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    Ok,
    /// Cache is full; the producer waited and should retry
    Full,
    /// The scan is no longer wanted and must stop
    Interrupt,
}

/// Outcome of a consumer lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Hit(LogEntry),
    /// Not cached yet; a scan has been (re)started if needed
    Miss,
}

/// Large-transaction chunk seen by a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LargeTrxInfo {
    pub term: u64,
    pub index: LogIndex,
    pub end: bool,
}

/// Channel counters for introspection
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel_id: u64,
    pub window_size: u64,
    pub cached_entries: usize,
    pub cached_bytes: u64,
    pub first_cached: Option<LogIndex>,
    pub last_cached: Option<LogIndex>,
    pub request_index: Option<LogIndex>,
    pub prefetching: bool,
    pub disabled: bool,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct ChannelState {
    cache: BTreeMap<LogIndex, LogEntry>,
    cached_bytes: u64,
    request_index: Option<LogIndex>,
    /// Bumped by every request, disable and stop
    generation: u64,
    /// Store truncation generation the cache was filled under
    store_generation: u64,
    prefetching: bool,
    disabled: bool,
    stopped: bool,
    error: Option<Error>,
    large_trx: BTreeMap<LogIndex, LargeTrxInfo>,
    hits: u64,
    misses: u64,
}

impl ChannelState {
    fn clear_cache(&mut self) {
        self.cache.clear();
        self.cached_bytes = 0;
    }

    fn remove_from(&mut self, index: LogIndex) {
        let removed = self.cache.split_off(&index);
        self.cached_bytes -= removed.values().map(|e| e.length()).sum::<u64>();
        self.large_trx.split_off(&index);
    }

    fn evict_below(&mut self, index: LogIndex) {
        let kept = self.cache.split_off(&index);
        let dropped = std::mem::replace(&mut self.cache, kept);
        self.cached_bytes -= dropped.values().map(|e| e.length()).sum::<u64>();
    }
}

/// Read-ahead cache for one follower
pub struct PrefetchChannel {
    id: u64,
    config: PrefetchConfig,
    store: Arc<LogStore>,
    state: Mutex<ChannelState>,
    cond: Condvar,
    /// Held across request/disable/stop so scans never overlap
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PrefetchChannel {
    pub fn new(id: u64, config: PrefetchConfig, store: Arc<LogStore>) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            store,
            state: Mutex::new(ChannelState::default()),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn window_size(&self) -> u64 {
        self.config.window_size
    }

    /// Start (or redirect) the background scan at `from_index`
    pub fn request(self: &Arc<Self>, from_index: LogIndex) -> Result<()> {
        let mut worker = self.worker.lock();

        let (generation, store_generation) = {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(Error::ShuttingDown);
            }
            if state.disabled {
                debug!("Channel {} disabled, ignoring request for {}", self.id, from_index);
                return Ok(());
            }
            state.generation += 1;
            state.store_generation = self.store.context().truncate_generation();
            state.clear_cache();
            state.request_index = Some(from_index);
            state.error = None;
            state.prefetching = true;
            self.cond.notify_all();
            (state.generation, state.store_generation)
        };

        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }

        let channel = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("prefetch-{}", self.id))
            .spawn(move || channel.run_scan(generation, store_generation, from_index))?;
        *worker = Some(handle);

        trace!("Channel {} scanning from {}", self.id, from_index);
        Ok(())
    }

    /// Look up `index`, starting a scan on a miss
    pub fn fetch(self: &Arc<Self>, index: LogIndex) -> Result<FetchResult> {
        let restart = {
            let mut state = self.state.lock();
            if let Some(err) = state.error.take() {
                return Err(err);
            }
            if state.stopped {
                return Err(Error::ShuttingDown);
            }

            if state.store_generation != self.store.context().truncate_generation() {
                state.clear_cache();
            }
            state.evict_below(index.saturating_sub(self.config.window_size));
            self.cond.notify_all();

            if let Some(entry) = state.cache.get(&index) {
                let entry = entry.clone();
                state.hits += 1;
                return Ok(FetchResult::Hit(entry));
            }
            state.misses += 1;

            if state.disabled {
                return Ok(FetchResult::Miss);
            }
            // A running scan that has not reached `index` yet will deliver it
            let covered = state.prefetching
                && state.store_generation == self.store.context().truncate_generation()
                && state.request_index.map(|r| r <= index).unwrap_or(false)
                && state.cache.keys().next_back().map(|last| *last < index).unwrap_or(true);
            !covered
        };

        if restart {
            self.request(index)?;
        }
        Ok(FetchResult::Miss)
    }

    /// Drop cached entries at or after `index` after the log was truncated
    pub fn truncate_notify(&self, index: LogIndex) {
        let mut state = self.state.lock();
        state.remove_from(index);
        if state.request_index.map(|r| r >= index).unwrap_or(false) {
            state.request_index = None;
        }
        self.cond.notify_all();
    }

    /// Stop the scan and refuse new requests until `enable`
    pub fn disable(&self) {
        let mut worker = self.worker.lock();
        {
            let mut state = self.state.lock();
            state.disabled = true;
            state.generation += 1;
            state.prefetching = false;
            state.clear_cache();
            state.request_index = None;
            self.cond.notify_all();
        }
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
    }

    pub fn enable(&self) {
        self.state.lock().disabled = false;
    }

    /// Stop the scan for good
    pub fn stop(&self) {
        let mut worker = self.worker.lock();
        {
            let mut state = self.state.lock();
            state.stopped = true;
            state.generation += 1;
            state.prefetching = false;
            state.clear_cache();
            self.cond.notify_all();
        }
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
    }

    /// Large-transaction chunks seen by scans, keyed by index
    pub fn large_trx_table(&self) -> Vec<LargeTrxInfo> {
        self.state.lock().large_trx.values().copied().collect()
    }

    pub fn clear_large_trx_table(&self) {
        self.state.lock().large_trx.clear();
    }

    pub fn stats(&self) -> ChannelStats {
        let state = self.state.lock();
        ChannelStats {
            channel_id: self.id,
            window_size: self.config.window_size,
            cached_entries: state.cache.len(),
            cached_bytes: state.cached_bytes,
            first_cached: state.cache.keys().next().copied(),
            last_cached: state.cache.keys().next_back().copied(),
            request_index: state.request_index,
            prefetching: state.prefetching,
            disabled: state.disabled,
            hits: state.hits,
            misses: state.misses,
        }
    }

    /// Offer one entry to the cache. Waits up to `full_wait_ms` when full.
    fn add(&self, generation: u64, store_generation: u64, entry: &LogEntry) -> AddResult {
        let mut state = self.state.lock();
        if self.interrupted(&state, generation, store_generation) {
            return AddResult::Interrupt;
        }

        let len = entry.length();
        let full = state.cache.len() >= self.config.max_cache_entries
            || (!state.cache.is_empty() && state.cached_bytes + len > self.config.max_cache_bytes);
        if full {
            self.cond
                .wait_for(&mut state, Duration::from_millis(self.config.full_wait_ms));
            return if self.interrupted(&state, generation, store_generation) {
                AddResult::Interrupt
            } else {
                AddResult::Full
            };
        }

        state.cached_bytes += len;
        if let Some(old) = state.cache.insert(entry.index, entry.clone()) {
            state.cached_bytes -= old.length();
        }
        AddResult::Ok
    }

    fn interrupted(&self, state: &ChannelState, generation: u64, store_generation: u64) -> bool {
        state.generation != generation
            || state.disabled
            || state.stopped
            || self.store.context().truncate_generation() != store_generation
    }

    fn record_large_trx(&self, entry: &LogEntry) {
        let info = LargeTrxInfo {
            term: entry.term,
            index: entry.index,
            end: entry.flag.contains(EntryFlags::LARGE_TRX_END),
        };
        self.state.lock().large_trx.insert(entry.index, info);
    }

    fn run_scan(self: Arc<Self>, generation: u64, store_generation: u64, from_index: LogIndex) {
        let result = self.scan(generation, store_generation, from_index);

        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.prefetching = false;
        match result {
            Ok(last) => debug!("Channel {} prefetch reached index {}", self.id, last),
            Err(e) => {
                if self.store.context().truncate_generation() != store_generation {
                    debug!("Channel {} scan interrupted by truncation: {}", self.id, e);
                } else {
                    error!("Channel {} prefetch failed: {}", self.id, e);
                    state.error = Some(e);
                }
            }
        }
    }

    /// Scan from `from_index` until the durable tail, a full stop or an
    /// interrupt. Returns the last index delivered.
    fn scan(&self, generation: u64, store_generation: u64, from_index: LogIndex) -> Result<LogIndex> {
        let ctx = self.store.context();
        let window_start = from_index
            .saturating_sub(self.config.window_size)
            .max(self.store.first_index());
        if window_start > ctx.sync_index() {
            return Ok(0);
        }

        // Both modes cache the same window; fast fetch only seeks straight
        // to it instead of reading the file from its first entry.
        let mut reader = if self.config.fast_fetch {
            self.store.reader_from(window_start)?
        } else {
            let (_, file_start) = self.store.find_file_for_index(window_start)?;
            self.store.reader_from(file_start)?
        };

        let mut last = 0;
        while let Some(entry) = reader.next_entry()? {
            if entry.index < window_start {
                continue;
            }
            if entry.index > ctx.sync_index() {
                break;
            }
            if entry.flag.intersects(EntryFlags::LARGE_TRX | EntryFlags::LARGE_TRX_END) {
                self.record_large_trx(&entry);
            }

            loop {
                match self.add(generation, store_generation, &entry) {
                    AddResult::Ok => break,
                    AddResult::Full => continue,
                    AddResult::Interrupt => {
                        info!(
                            "Channel {} prefetch interrupted at index {}",
                            self.id, entry.index
                        );
                        return Ok(last);
                    }
                }
            }
            last = entry.index;
            if last == ctx.sync_index() {
                break;
            }
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::context::ConsensusContext;
    use bytes::Bytes;
    use std::time::Instant;
    use tempfile::tempdir;

    fn store_with(dir: &std::path::Path, count: u64, config: LogConfig) -> Arc<LogStore> {
        let ctx = Arc::new(ConsensusContext::new());
        let store = LogStore::open(dir, config, ctx).unwrap();
        for i in 1..=count {
            store
                .append(LogEntry::new(1, EntryFlags::NONE, Bytes::from(format!("entry-{}", i))))
                .unwrap();
        }
        store.sync().unwrap();
        Arc::new(store)
    }

    fn prefetch_config(max_entries: usize) -> PrefetchConfig {
        PrefetchConfig {
            window_size: 2,
            max_cache_entries: max_entries,
            full_wait_ms: 10,
            ..PrefetchConfig::default()
        }
    }

    fn wait_for_hit(channel: &Arc<PrefetchChannel>, index: LogIndex) -> LogEntry {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let FetchResult::Hit(entry) = channel.fetch(index).unwrap() {
                return entry;
            }
            assert!(Instant::now() < deadline, "index {} never arrived", index);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_idle(channel: &PrefetchChannel) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while channel.stats().prefetching {
            assert!(Instant::now() < deadline, "scan never stopped");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_fetch_miss_then_hit() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), 30, LogConfig::default());
        let channel = PrefetchChannel::new(1, prefetch_config(100), store);

        assert_eq!(channel.fetch(10).unwrap(), FetchResult::Miss);
        let entry = wait_for_hit(&channel, 10);
        assert_eq!(entry.payload, Bytes::from("entry-10"));

        // Scan stops at the durable tail
        wait_idle(&channel);
        let stats = channel.stats();
        assert_eq!(stats.first_cached, Some(8));
        assert_eq!(stats.last_cached, Some(30));
        assert!(stats.hits >= 1);
        assert!(stats.misses >= 1);
    }

    #[test]
    fn test_slow_fetch_caches_same_window() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), 30, LogConfig::default());
        let config = PrefetchConfig {
            fast_fetch: false,
            ..prefetch_config(100)
        };
        let channel = PrefetchChannel::new(1, config, store);

        assert_eq!(channel.fetch(20).unwrap(), FetchResult::Miss);
        let entry = wait_for_hit(&channel, 20);
        assert_eq!(entry.payload, Bytes::from("entry-20"));

        wait_idle(&channel);
        let stats = channel.stats();
        assert_eq!(stats.first_cached, Some(18));
        assert_eq!(stats.last_cached, Some(30));
    }

    #[test]
    fn test_add_reports_full_and_interrupt() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), 5, LogConfig::default());
        let channel = PrefetchChannel::new(1, prefetch_config(2), store.clone());
        let gen = channel.state.lock().generation;
        let store_gen = store.context().truncate_generation();

        let entry = |i: u64| LogEntry::new(1, EntryFlags::NONE, Bytes::from("x")).with_index(i);
        assert_eq!(channel.add(gen, store_gen, &entry(1)), AddResult::Ok);
        assert_eq!(channel.add(gen, store_gen, &entry(2)), AddResult::Ok);
        assert_eq!(channel.add(gen, store_gen, &entry(3)), AddResult::Full);

        channel.disable();
        assert_eq!(channel.add(gen, store_gen, &entry(3)), AddResult::Interrupt);
        assert_eq!(channel.stats().cached_entries, 0);

        channel.enable();
        assert_eq!(channel.fetch(1).unwrap(), FetchResult::Miss);
        assert_eq!(wait_for_hit(&channel, 1).index, 1);
    }

    #[test]
    fn test_truncation_interrupts_scan() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), 50, LogConfig::default());
        let channel = PrefetchChannel::new(1, prefetch_config(4), store.clone());

        // Producer fills four entries and then blocks on a full cache
        assert_eq!(channel.fetch(1).unwrap(), FetchResult::Miss);
        wait_for_hit(&channel, 1);
        assert!(channel.stats().prefetching);

        store.truncate_from(20).unwrap();
        channel.truncate_notify(20);
        wait_idle(&channel);
        assert!(channel.large_trx_table().is_empty());

        store
            .append(LogEntry::new(2, EntryFlags::NONE, Bytes::from("rewritten-20")))
            .unwrap();
        store.sync().unwrap();

        let entry = wait_for_hit(&channel, 20);
        assert_eq!(entry.term, 2);
        assert_eq!(entry.payload, Bytes::from("rewritten-20"));
    }

    #[test]
    fn test_split_entries_delivered_whole() {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            max_log_size: 256,
            large_event_split_size: 100,
            ..LogConfig::default()
        };
        let store = store_with(dir.path(), 2, config);
        let big = Bytes::from(vec![7u8; 1000]);
        store.append(LogEntry::new(1, EntryFlags::NONE, big.clone())).unwrap();
        store
            .append(LogEntry::new(1, EntryFlags::LARGE_TRX, Bytes::from("chunk-1")))
            .unwrap();
        store
            .append(LogEntry::new(
                1,
                EntryFlags::LARGE_TRX | EntryFlags::LARGE_TRX_END,
                Bytes::from("chunk-2"),
            ))
            .unwrap();
        store.sync().unwrap();

        let channel = PrefetchChannel::new(1, prefetch_config(100), store);
        channel.fetch(3).unwrap();
        let entry = wait_for_hit(&channel, 3);
        assert_eq!(entry.payload, big);
        assert!(!entry.flag.intersects(EntryFlags::blob_bits()));

        wait_for_hit(&channel, 5);
        let table = channel.large_trx_table();
        assert_eq!(table.len(), 2);
        assert!(!table[0].end);
        assert!(table[1].end);
    }

    #[test]
    fn test_corrupt_frame_surfaces_on_fetch() {
        use std::io::{Seek, SeekFrom, Write};

        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), 5, LogConfig::default());
        let (name, offset) = store.find_position(3).unwrap();
        {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .open(dir.path().join(name))
                .unwrap();
            file.seek(SeekFrom::Start(offset + crate::wal::entry::FRAME_HEADER_SIZE as u64))
                .unwrap();
            file.write_all(b"X").unwrap();
        }

        let channel = PrefetchChannel::new(1, prefetch_config(100), store);
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match channel.fetch(3) {
                Err(e) => break e,
                Ok(_) => {
                    assert!(Instant::now() < deadline, "corruption never reported");
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        };
        assert!(err.is_corruption());
    }
}
