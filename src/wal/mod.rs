//! Replicated Log Module
//!
//! Append-only, multi-file log holding the consensus entries, together with
//! the event codec used to build entry payloads and the file index used to
//! locate entries on disk.

pub mod codec;
pub mod entry;
mod index;
mod reader;
mod segment;
pub mod split;
mod store;

pub use codec::{build_event, EncodedEvents, EventReviser, EventWriter};
pub use entry::{EntryFlags, FrameHeader, FrameKind, LogEntry, LogIndex};
pub use index::{FileIndex, FileIndexEntry, LogFileInfo, SharedFileIndex, POSITION_STRIDE};
pub use reader::{Frame, LogReader};
pub use segment::{file_name, list_log_files, DATA_START};
pub use split::SplitPolicy;
pub use store::{LogStore, PurgeTarget};
