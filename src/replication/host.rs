//! Host integration points
//!
//! The storage engine, the follower applier and the consensus driver live
//! outside this crate. The state machine reaches them through these traits.

use async_trait::async_trait;
use tracing::error;

use crate::error::{Error, Result};

/// Storage engine and applier hooks used during role transitions
#[async_trait]
pub trait HostEngine: Send + Sync + 'static {
    /// Make every committed transaction durable in the engine
    async fn flush_engine(&self) -> Result<()>;

    /// Start applying replicated entries from `from_index`
    async fn start_applier(&self, from_index: u64) -> Result<()>;

    /// Apply everything up to `index`, then stop the applier
    async fn drain_applier(&self, index: u64) -> Result<()>;

    /// Terminate readers streaming the log to other nodes
    async fn kill_log_readers(&self) -> Result<()>;

    /// Forget locally tracked apply progress
    async fn reset_apply_progress(&self) -> Result<()> {
        Ok(())
    }

    /// A transition failed and the node cannot keep serving
    fn on_fatal(&self, err: &Error) {
        error!("Fatal error during role transition: {}", err);
        std::process::abort();
    }
}

/// View of the external consensus driver
pub trait ConsensusDriver: Send + Sync + 'static {
    /// The driver's current term, never below the local term
    fn term(&self) -> u64;
}
