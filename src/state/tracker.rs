//! Metadata Tracker
//!
//! Persistent consensus metadata: terms, the apply recovery point, the
//! role to recover into and the cluster configuration strings.

use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::context::Status;
use crate::error::{Error, Result};

const CURRENT_TERM: &str = "current_term";
const LAST_LEADER_TERM: &str = "last_leader_term";
const START_APPLY_INDEX: &str = "start_apply_index";
const RECOVER_STATUS: &str = "recover_status";
const CLUSTER_INFO: &str = "cluster_info";
const CLUSTER_LEARNER_INFO: &str = "cluster_learner_info";

/// Everything the tracker stores, for recovery and introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetaSnapshot {
    pub current_term: u64,
    pub last_leader_term: u64,
    pub start_apply_index: u64,
    pub recover_status: Status,
    pub cluster_info: Option<String>,
    pub cluster_learner_info: Option<String>,
}

/// Consensus metadata backed by SQLite
pub struct MetaTracker {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl MetaTracker {
    /// Create or open `state.db` in `state_dir`
    pub fn open(state_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&state_dir)?;

        let path = state_dir.join("state.db");
        let conn = Connection::open(&path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS consensus_meta (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn get_int(&self, key: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock().await;
        let value: Option<Option<i64>> = conn
            .query_row(
                "SELECT value_int FROM consensus_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten().map(|v| v as u64))
    }

    async fn set_int(&self, key: &str, value: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO consensus_meta (key, value_int) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value_int = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, value as i64],
        )?;
        Ok(())
    }

    async fn get_text(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<Option<String>, _> = conn.query_row(
            "SELECT value_text FROM consensus_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("Failed to read {}: {}", key, e))),
        }
    }

    async fn set_text(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO consensus_meta (key, value_text) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value_text = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    pub async fn current_term(&self) -> Result<u64> {
        Ok(self.get_int(CURRENT_TERM).await?.unwrap_or(0))
    }

    pub async fn set_current_term(&self, term: u64) -> Result<()> {
        self.set_int(CURRENT_TERM, term).await
    }

    /// Term of the last upgrade on this node
    pub async fn last_leader_term(&self) -> Result<u64> {
        Ok(self.get_int(LAST_LEADER_TERM).await?.unwrap_or(0))
    }

    pub async fn set_last_leader_term(&self, term: u64) -> Result<()> {
        self.set_int(LAST_LEADER_TERM, term).await
    }

    /// Index the host applier resumes from after a degrade
    pub async fn start_apply_index(&self) -> Result<u64> {
        Ok(self.get_int(START_APPLY_INDEX).await?.unwrap_or(0))
    }

    pub async fn set_start_apply_index(&self, index: u64) -> Result<()> {
        self.set_int(START_APPLY_INDEX, index).await
    }

    /// Role to recover into on restart
    pub async fn recover_status(&self) -> Result<Status> {
        Ok(match self.get_int(RECOVER_STATUS).await? {
            Some(1) => Status::LogOwner,
            _ => Status::LogFollower,
        })
    }

    pub async fn set_recover_status(&self, status: Status) -> Result<()> {
        self.set_int(RECOVER_STATUS, status as u64).await
    }

    /// Persisted member string
    pub async fn cluster_info(&self) -> Result<Option<String>> {
        self.get_text(CLUSTER_INFO).await
    }

    pub async fn set_cluster_info(&self, members: &str) -> Result<()> {
        self.set_text(CLUSTER_INFO, members).await
    }

    /// Persisted learner string
    pub async fn cluster_learner_info(&self) -> Result<Option<String>> {
        self.get_text(CLUSTER_LEARNER_INFO).await
    }

    pub async fn set_cluster_learner_info(&self, learners: &str) -> Result<()> {
        self.set_text(CLUSTER_LEARNER_INFO, learners).await
    }

    /// Persist both configuration strings in one transaction
    pub async fn set_cluster(&self, members: &str, learners: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for (key, value) in [(CLUSTER_INFO, members), (CLUSTER_LEARNER_INFO, learners)] {
            tx.execute(
                r#"
                INSERT INTO consensus_meta (key, value_text) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value_text = ?2, updated_at = CURRENT_TIMESTAMP
                "#,
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<MetaSnapshot> {
        Ok(MetaSnapshot {
            current_term: self.current_term().await?,
            last_leader_term: self.last_leader_term().await?,
            start_apply_index: self.start_apply_index().await?,
            recover_status: self.recover_status().await?,
            cluster_info: self.cluster_info().await?,
            cluster_learner_info: self.cluster_learner_info().await?,
        })
    }
}
