//! State Management Module
//!
//! Persistent consensus metadata that must survive restarts.

mod tracker;

pub use tracker::{MetaSnapshot, MetaTracker};
