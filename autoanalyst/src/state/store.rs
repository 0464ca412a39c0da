//! SQLite persistence for project state snapshots.
//!
//! One record per `ProjectState` snapshot, keyed by project id and round
//! number - enough to resume an interrupted run at step granularity. WAL
//! mode is enabled so a reporting process can read while a run writes.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

use crate::state::project::ProjectState;

/// Snapshot store over a single sqlite database.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                project_id TEXT NOT NULL,
                round INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                state_json TEXT NOT NULL,

                PRIMARY KEY (project_id, round)
            );

            CREATE INDEX IF NOT EXISTS idx_snapshots_project
            ON snapshots(project_id, round DESC);

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
            [],
        )?;
        Ok(())
    }

    /// Persist one snapshot. A re-run of the same round replaces the
    /// earlier record, which keeps crash-retry writes idempotent.
    pub fn save_snapshot(&self, state: &ProjectState) -> Result<()> {
        let state_json =
            serde_json::to_string(state).context("Failed to serialize project state")?;
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO snapshots (project_id, round, created_at, state_json)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                state.project_id,
                state.round as i64,
                Local::now().to_rfc3339(),
                state_json
            ],
        )?;
        Ok(())
    }

    /// Latest snapshot for a project, if any.
    pub fn load_latest(&self, project_id: &str) -> Result<Option<ProjectState>> {
        let row: Option<String> = self
            .conn
            .query_row(
                r#"
                SELECT state_json FROM snapshots
                WHERE project_id = ?1
                ORDER BY round DESC
                LIMIT 1
                "#,
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;

        row.map(|json| {
            serde_json::from_str(&json).map_err(|e| anyhow!("corrupt snapshot record: {}", e))
        })
        .transpose()
    }

    /// Snapshot for a specific round.
    pub fn load_round(&self, project_id: &str, round: u64) -> Result<Option<ProjectState>> {
        let row: Option<String> = self
            .conn
            .query_row(
                "SELECT state_json FROM snapshots WHERE project_id = ?1 AND round = ?2",
                params![project_id, round as i64],
                |row| row.get(0),
            )
            .optional()?;

        row.map(|json| {
            serde_json::from_str(&json).map_err(|e| anyhow!("corrupt snapshot record: {}", e))
        })
        .transpose()
    }

    /// Rounds persisted for a project, ascending.
    pub fn rounds(&self, project_id: &str) -> Result<Vec<u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT round FROM snapshots WHERE project_id = ?1 ORDER BY round ASC")?;
        let rounds = stmt
            .query_map(params![project_id], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rounds.into_iter().map(|r| r as u64).collect())
    }

    /// Drop all snapshots for a project.
    pub fn delete_project(&self, project_id: &str) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM snapshots WHERE project_id = ?1",
            params![project_id],
        )?;
        Ok(deleted)
    }
}
