//! Follower read-ahead
//!
//! Background scans of the log store that keep each follower's next entries
//! in memory.

mod channel;
mod manager;

pub use channel::{AddResult, ChannelStats, FetchResult, LargeTrxInfo, PrefetchChannel};
pub use manager::PrefetchManager;
