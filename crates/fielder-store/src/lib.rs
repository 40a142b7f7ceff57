//! Fielder Storage Layer
//!
//! SQLite-backed reference implementation of the Fielder store traits:
//! the work queue (exclusive claims over overlays), block content, runs,
//! and credentials.
//!
//! The exclusive-claim contract is implemented as a conditional update
//! inside a transaction: a row is only moved to `claimed` while it is
//! still `pending`, so two workers can never hold the same block. Any
//! store with equivalent compare-and-swap semantics can replace this one
//! behind the `fielder-domain` traits.
//!
//! # Examples
//!
//! ```no_run
//! use fielder_store::SqliteQueue;
//!
//! let store = SqliteQueue::in_memory().unwrap();
//! // Store is now ready for seeding and claim operations
//! ```

#![warn(missing_docs)]

use async_trait::async_trait;
use fielder_domain::{
    Block, BlockId, BlockStore, Credential, CredentialStore, ExtractionSchema, ModelConfig,
    Overlay, OverlayStatus, ReleaseScope, RunContext, RunId, RunStatus, RunStore, StatusCounts,
    StoreError, WorkQueue, WorkerId,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current timestamp in seconds since Unix epoch
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// SQLite-backed implementation of the Fielder store traits
///
/// The connection is serialized behind a mutex; trait methods never hold
/// the lock across an await point.
pub struct SqliteQueue {
    conn: Mutex<Connection>,
}

impl SqliteQueue {
    /// Open (or create) a store at the given database path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (useful for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        let schema = include_str!("schema.sql");
        self.conn()?.execute_batch(schema).map_err(db_err)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Backend(format!("connection lock poisoned: {}", e)))
    }

    // ── Seeding helpers (bootstrap and tests) ──

    /// Insert a run row
    pub fn insert_run(
        &self,
        run_id: &RunId,
        owner_id: &str,
        schema: Option<&ExtractionSchema>,
        model: Option<&ModelConfig>,
    ) -> Result<(), StoreError> {
        let schema_json = schema
            .map(|s| serde_json::to_string(s))
            .transpose()
            .map_err(|e| StoreError::Backend(format!("schema serialization: {}", e)))?;
        let model_json = model
            .map(|m| serde_json::to_string(m))
            .transpose()
            .map_err(|e| StoreError::Backend(format!("model serialization: {}", e)))?;

        self.conn()?
            .execute(
                "INSERT INTO runs (run_id, owner_id, status, schema_json, model_json)
                 VALUES (?1, ?2, 'running', ?3, ?4)",
                params![run_id.as_str(), owner_id, schema_json, model_json],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Insert a block row
    pub fn insert_block(&self, block: &Block) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO blocks (block_id, kind, content) VALUES (?1, ?2, ?3)",
                params![block.id.as_str(), block.kind, block.content],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Create a pending overlay for `(run, block)`
    pub fn enqueue(&self, run_id: &RunId, block_id: &BlockId) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO overlays (run_id, block_id, status) VALUES (?1, ?2, 'pending')",
                params![run_id.as_str(), block_id.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Insert blocks and enqueue a pending overlay for each
    pub fn enqueue_blocks(&self, run_id: &RunId, blocks: &[Block]) -> Result<(), StoreError> {
        for block in blocks {
            self.insert_block(block)?;
            self.enqueue(run_id, &block.id)?;
        }
        Ok(())
    }

    /// Insert a credential row
    pub fn insert_credential(
        &self,
        owner_id: &str,
        provider: &str,
        secret: &str,
        owner_scoped: bool,
    ) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO credentials (owner_id, provider, secret, owner_scoped)
                 VALUES (?1, ?2, ?3, ?4)",
                params![owner_id, provider, secret, owner_scoped as i64],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Overwrite a run's status (e.g. to cancel it)
    pub fn set_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<(), StoreError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE runs SET status = ?1 WHERE run_id = ?2",
                params![status.as_str(), run_id.as_str()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("run {}", run_id)));
        }
        Ok(())
    }

    // ── Inspection helpers ──

    /// Load one overlay row
    pub fn overlay(&self, run_id: &RunId, block_id: &BlockId) -> Result<Overlay, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT status, attempt_count, last_error, claimed_by, claimed_at, fields_json
                 FROM overlays WHERE run_id = ?1 AND block_id = ?2",
                params![run_id.as_str(), block_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let (status, attempts, last_error, claimed_by, claimed_at, fields_json) = row
            .ok_or_else(|| StoreError::NotFound(format!("overlay {}/{}", run_id, block_id)))?;

        let status = OverlayStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown overlay status '{}'", status)))?;
        let fields = fields_json
            .map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(|e| StoreError::Backend(format!("fields deserialization: {}", e)))?;

        Ok(Overlay {
            block_id: block_id.clone(),
            status,
            attempt_count: attempts as u32,
            last_error,
            claimed_by,
            claimed_at: claimed_at.map(|t| t as u64),
            fields,
        })
    }

    /// The persisted rollup for a run: `(done_count, failed_count, ended_at)`
    pub fn run_rollup(&self, run_id: &RunId) -> Result<(u64, u64, Option<u64>), StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT done_count, failed_count, ended_at FROM runs WHERE run_id = ?1",
            params![run_id.as_str()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, Option<i64>>(2)?.map(|t| t as u64),
                ))
            },
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("run {}", run_id)))
    }

    /// Credential flags for `(owner, provider)`: `(validated, invalidated)`
    pub fn credential_state(
        &self,
        owner_id: &str,
        provider: &str,
    ) -> Result<(bool, bool), StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT validated, invalidated FROM credentials WHERE owner_id = ?1 AND provider = ?2",
            params![owner_id, provider],
            |row| Ok((row.get::<_, i64>(0)? != 0, row.get::<_, i64>(1)? != 0)),
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("credential {}/{}", owner_id, provider)))
    }
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn claim(
        &self,
        run_id: &RunId,
        batch_size: usize,
        worker_id: &WorkerId,
    ) -> Result<Vec<BlockId>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        let candidates: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT block_id FROM overlays
                     WHERE run_id = ?1 AND status = 'pending'
                     ORDER BY block_id
                     LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![run_id.as_str(), batch_size as i64], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };

        let now = current_timestamp();
        let mut claimed = Vec::with_capacity(candidates.len());
        for block_id in candidates {
            // Conditional update: only still-pending rows are claimable, so
            // a concurrent claimant can never take the same block.
            let updated = tx
                .execute(
                    "UPDATE overlays
                     SET status = 'claimed', claimed_by = ?1, claimed_at = ?2
                     WHERE run_id = ?3 AND block_id = ?4 AND status = 'pending'",
                    params![worker_id.as_str(), now as i64, run_id.as_str(), block_id],
                )
                .map_err(db_err)?;
            if updated == 1 {
                claimed.push(BlockId::new(block_id));
            }
        }

        tx.commit().map_err(db_err)?;
        Ok(claimed)
    }

    async fn release(
        &self,
        run_id: &RunId,
        scope: ReleaseScope,
        block_ids: &[BlockId],
        next_status: OverlayStatus,
        error: Option<&str>,
    ) -> Result<Vec<BlockId>, StoreError> {
        if block_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "UPDATE overlays
             SET status = ?, claimed_by = NULL, claimed_at = NULL,
                 last_error = COALESCE(?, last_error)
             WHERE run_id = ? AND block_id IN (",
        );
        sql.push_str(&vec!["?"; block_ids.len()].join(", "));
        sql.push(')');

        let mut bindings: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(next_status.as_str().to_string()),
            Box::new(error.map(|e| e.to_string())),
            Box::new(run_id.as_str().to_string()),
        ];
        for id in block_ids {
            bindings.push(Box::new(id.as_str().to_string()));
        }

        match &scope {
            ReleaseScope::OwnedBy(worker_id) => {
                sql.push_str(" AND claimed_by = ?");
                bindings.push(Box::new(worker_id.as_str().to_string()));
            }
            ReleaseScope::AnyClaimant => {
                sql.push_str(" AND status IN ('pending', 'claimed')");
            }
        }
        sql.push_str(" RETURNING block_id");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let binding_refs: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();
        let resolved = stmt
            .query_map(&binding_refs[..], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(resolved.into_iter().map(BlockId::new).collect())
    }

    async fn mark_done(
        &self,
        run_id: &RunId,
        block_id: &BlockId,
        fields: serde_json::Value,
    ) -> Result<(), StoreError> {
        let fields_json = serde_json::to_string(&fields)
            .map_err(|e| StoreError::Backend(format!("fields serialization: {}", e)))?;
        let updated = self
            .conn()?
            .execute(
                "UPDATE overlays
                 SET status = 'done', fields_json = ?1, last_error = NULL,
                     claimed_by = NULL, claimed_at = NULL
                 WHERE run_id = ?2 AND block_id = ?3",
                params![fields_json, run_id.as_str(), block_id.as_str()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "overlay {}/{}",
                run_id, block_id
            )));
        }
        Ok(())
    }

    async fn mark_attempt(
        &self,
        run_id: &RunId,
        block_id: &BlockId,
        attempt_count: u32,
        next_status: OverlayStatus,
        error: &str,
    ) -> Result<(), StoreError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE overlays
                 SET status = ?1, attempt_count = ?2, last_error = ?3,
                     claimed_by = NULL, claimed_at = NULL
                 WHERE run_id = ?4 AND block_id = ?5",
                params![
                    next_status.as_str(),
                    attempt_count as i64,
                    error,
                    run_id.as_str(),
                    block_id.as_str()
                ],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "overlay {}/{}",
                run_id, block_id
            )));
        }
        Ok(())
    }

    async fn fail_terminal(
        &self,
        run_id: &RunId,
        block_id: &BlockId,
        error: &str,
    ) -> Result<(), StoreError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE overlays
                 SET status = 'failed', last_error = ?1,
                     claimed_by = NULL, claimed_at = NULL
                 WHERE run_id = ?2 AND block_id = ?3",
                params![error, run_id.as_str(), block_id.as_str()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "overlay {}/{}",
                run_id, block_id
            )));
        }
        Ok(())
    }

    async fn attempt_count(&self, run_id: &RunId, block_id: &BlockId) -> Result<u32, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT attempt_count FROM overlays WHERE run_id = ?1 AND block_id = ?2",
            params![run_id.as_str(), block_id.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err)?
        .map(|n| n as u32)
        .ok_or_else(|| StoreError::NotFound(format!("overlay {}/{}", run_id, block_id)))
    }

    async fn status_counts(&self, run_id: &RunId) -> Result<StatusCounts, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(*) FROM overlays
                 WHERE run_id = ?1 GROUP BY status",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![run_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = count as usize;
            match OverlayStatus::parse(&status) {
                Some(OverlayStatus::Done) => counts.done = count,
                Some(OverlayStatus::Failed) => counts.failed = count,
                Some(OverlayStatus::Pending) => counts.pending = count,
                Some(OverlayStatus::Claimed) => counts.claimed = count,
                None => {
                    return Err(StoreError::Backend(format!(
                        "unknown overlay status '{}'",
                        status
                    )))
                }
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl BlockStore for SqliteQueue {
    async fn blocks(&self, ids: &[BlockId]) -> Result<HashMap<BlockId, Block>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut sql =
            String::from("SELECT block_id, kind, content FROM blocks WHERE block_id IN (");
        sql.push_str(&vec!["?"; ids.len()].join(", "));
        sql.push(')');

        let bindings: Vec<Box<dyn rusqlite::ToSql>> = ids
            .iter()
            .map(|id| Box::new(id.as_str().to_string()) as Box<dyn rusqlite::ToSql>)
            .collect();
        let binding_refs: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(&binding_refs[..], |row| {
                Ok(Block {
                    id: BlockId::new(row.get::<_, String>(0)?),
                    kind: row.get(1)?,
                    content: row.get(2)?,
                })
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(rows.into_iter().map(|b| (b.id.clone(), b)).collect())
    }
}

#[async_trait]
impl RunStore for SqliteQueue {
    async fn run(&self, run_id: &RunId) -> Result<RunContext, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT owner_id, status, schema_json, model_json FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let (owner_id, status, schema_json, model_json) =
            row.ok_or_else(|| StoreError::NotFound(format!("run {}", run_id)))?;

        let status = RunStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown run status '{}'", status)))?;
        let schema = schema_json
            .map(|j| serde_json::from_str::<ExtractionSchema>(&j))
            .transpose()
            .map_err(|e| StoreError::Backend(format!("schema deserialization: {}", e)))?;
        let model_config = model_json
            .map(|j| serde_json::from_str::<ModelConfig>(&j))
            .transpose()
            .map_err(|e| StoreError::Backend(format!("model deserialization: {}", e)))?;

        Ok(RunContext {
            run_id: run_id.clone(),
            owner_id,
            status,
            schema,
            model_config,
        })
    }

    async fn update_counts(
        &self,
        run_id: &RunId,
        done: usize,
        failed: usize,
    ) -> Result<(), StoreError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE runs SET done_count = ?1, failed_count = ?2 WHERE run_id = ?3",
                params![done as i64, failed as i64, run_id.as_str()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("run {}", run_id)));
        }
        Ok(())
    }

    async fn finalize(
        &self,
        run_id: &RunId,
        status: RunStatus,
        ended_at: u64,
    ) -> Result<(), StoreError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE runs SET status = ?1, ended_at = ?2 WHERE run_id = ?3",
                params![status.as_str(), ended_at as i64, run_id.as_str()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("run {}", run_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqliteQueue {
    async fn resolve(
        &self,
        owner_id: &str,
        provider: &str,
    ) -> Result<Option<Credential>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT secret, owner_scoped, invalidated FROM credentials
                 WHERE owner_id = ?1 AND provider = ?2",
                params![owner_id, provider],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? != 0,
                        row.get::<_, i64>(2)? != 0,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        Ok(row.and_then(|(secret, owner_scoped, invalidated)| {
            if invalidated {
                None
            } else {
                Some(Credential {
                    secret,
                    owner_scoped,
                })
            }
        }))
    }

    async fn invalidate(&self, owner_id: &str, provider: &str) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "UPDATE credentials SET invalidated = 1 WHERE owner_id = ?1 AND provider = ?2",
                params![owner_id, provider],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_valid(&self, owner_id: &str, provider: &str) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "UPDATE credentials SET validated = 1 WHERE owner_id = ?1 AND provider = ?2",
                params![owner_id, provider],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_initializes() {
        let store = SqliteQueue::in_memory().unwrap();
        // Re-running initialization must be idempotent
        store.initialize_schema().unwrap();
    }

    #[test]
    fn test_seed_and_read_overlay() {
        let store = SqliteQueue::in_memory().unwrap();
        let run_id = RunId::new("run-1");
        store.insert_run(&run_id, "owner-1", None, None).unwrap();
        store
            .enqueue_blocks(&run_id, &[Block::new("b1", "Title", "Hello")])
            .unwrap();

        let overlay = store.overlay(&run_id, &BlockId::new("b1")).unwrap();
        assert_eq!(overlay.status, OverlayStatus::Pending);
        assert_eq!(overlay.attempt_count, 0);
        assert!(overlay.fields.is_none());
        assert!(overlay.claimed_by.is_none());
    }

    #[test]
    fn test_missing_overlay_is_not_found() {
        let store = SqliteQueue::in_memory().unwrap();
        let result = store.overlay(&RunId::new("nope"), &BlockId::new("b1"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_set_run_status() {
        let store = SqliteQueue::in_memory().unwrap();
        let run_id = RunId::new("run-1");
        store.insert_run(&run_id, "owner-1", None, None).unwrap();
        store.set_run_status(&run_id, RunStatus::Cancelled).unwrap();

        let missing = store.set_run_status(&RunId::new("other"), RunStatus::Cancelled);
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }
}
