//! SQLite persistence for blocks, versions and proposals.
//!
//! Relational tables, one row per version and per proposal. Versions are
//! append-only; the block row's `head_id` is the only mutable pointer and it
//! moves with a conditional `UPDATE` so a stale writer changes nothing.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, Result as SqliteResult, Row, params};

use kioku_types::{
    Block, BlockKey, Confidence, EditOperation, Proposal, ProposalId, ProposalStatus, Version,
    VersionId,
};

/// Connection shared by the version and proposal stores of one registry.
pub type SharedDb = Arc<Mutex<StoreDb>>;

/// Database handle for kioku state.
pub struct StoreDb {
    conn: Connection,
}

const SCHEMA: &str = r#"
-- Block directory: one row per (owner, label), points at the head version
CREATE TABLE IF NOT EXISTS blocks (
    owner_id TEXT NOT NULL,
    label TEXT NOT NULL,
    head_id TEXT NOT NULL,
    head_seq INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (owner_id, label)
);

-- Versions (append-only, immutable)
CREATE TABLE IF NOT EXISTS versions (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    label TEXT NOT NULL,
    seq INTEGER NOT NULL,
    body TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    message TEXT NOT NULL,
    author TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    parent_id TEXT,
    source_proposal TEXT,
    UNIQUE (owner_id, label, seq),
    FOREIGN KEY (owner_id, label) REFERENCES blocks(owner_id, label) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_versions_proposal ON versions(source_proposal)
    WHERE source_proposal IS NOT NULL;

-- Proposals (review queue and audit trail)
CREATE TABLE IF NOT EXISTS proposals (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    label TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    field TEXT,
    strategy TEXT NOT NULL,
    match_text TEXT,
    base_value TEXT NOT NULL,
    base_version TEXT,
    proposed_value TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    confidence TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    reviewed_at INTEGER,
    reviewed_by TEXT,
    review_note TEXT,
    applied_version TEXT
);
CREATE INDEX IF NOT EXISTS idx_proposals_queue ON proposals(owner_id, label, status, created_at);
CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status, created_at);
"#;

const VERSION_COLUMNS: &str = "id, owner_id, label, seq, body, content_hash, message, author, \
     created_at, parent_id, source_proposal";

const PROPOSAL_COLUMNS: &str = "id, owner_id, label, agent_id, field, strategy, match_text, \
     base_value, base_version, proposed_value, reasoning, confidence, status, created_at, \
     reviewed_at, reviewed_by, review_note, applied_version";

/// Millisecond cutoffs beyond `i64` mean "everything".
fn cutoff_param(cutoff: u64) -> i64 {
    i64::try_from(cutoff).unwrap_or(i64::MAX)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn id_column<T>(row: &Row<'_>, idx: usize) -> SqliteResult<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_id_column<T>(row: &Row<'_>, idx: usize) -> SqliteResult<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        t.parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn row_to_version(row: &Row<'_>) -> SqliteResult<Version> {
    Ok(Version {
        id: id_column(row, 0)?,
        owner_id: row.get(1)?,
        block_label: row.get(2)?,
        seq: row.get::<_, i64>(3)? as u64,
        body: row.get(4)?,
        content_hash: row.get(5)?,
        message: row.get(6)?,
        author: row.get(7)?,
        created_at: row.get::<_, i64>(8)? as u64,
        parent_version: opt_id_column(row, 9)?,
        source_proposal: opt_id_column(row, 10)?,
    })
}

fn row_to_block(row: &Row<'_>) -> SqliteResult<Block> {
    Ok(Block {
        owner_id: row.get(0)?,
        label: row.get(1)?,
        current_version: id_column(row, 2)?,
        version_count: row.get::<_, i64>(3)? as u64,
        created_at: row.get::<_, i64>(4)? as u64,
    })
}

fn row_to_proposal(row: &Row<'_>) -> SqliteResult<Proposal> {
    let strategy: String = row.get(5)?;
    let match_text: Option<String> = row.get(6)?;
    let operation = EditOperation::from_wire(&strategy, match_text.as_deref())
        .map_err(|e| conversion_error(5, e.to_string()))?;

    let confidence: String = row.get(11)?;
    let confidence = Confidence::parse(&confidence)
        .ok_or_else(|| conversion_error(11, format!("unknown confidence '{confidence}'")))?;

    let status: String = row.get(12)?;
    let status = ProposalStatus::parse(&status)
        .ok_or_else(|| conversion_error(12, format!("unknown status '{status}'")))?;

    Ok(Proposal {
        id: id_column(row, 0)?,
        owner_id: row.get(1)?,
        block_label: row.get(2)?,
        agent_id: row.get(3)?,
        field: row.get(4)?,
        operation,
        base_value: row.get(7)?,
        base_version: opt_id_column(row, 8)?,
        proposed_value: row.get(9)?,
        reasoning: row.get(10)?,
        confidence,
        status,
        created_at: row.get::<_, i64>(13)? as u64,
        reviewed_at: row.get::<_, Option<i64>>(14)?.map(|t| t as u64),
        reviewed_by: row.get(15)?,
        review_note: row.get(16)?,
        applied_version: opt_id_column(row, 17)?,
    })
}

fn insert_version(conn: &Connection, v: &Version) -> SqliteResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO versions ({VERSION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            v.id.to_string(),
            v.owner_id,
            v.block_label,
            v.seq as i64,
            v.body,
            v.content_hash,
            v.message,
            v.author,
            v.created_at as i64,
            v.parent_version.map(|p| p.to_string()),
            v.source_proposal.map(|p| p.to_string()),
        ],
    )?;
    Ok(())
}

impl StoreDb {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn into_shared(self) -> SharedDb {
        Arc::new(Mutex::new(self))
    }

    /// Raw connection, for tests that damage rows on purpose.
    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // =========================================================================
    // Blocks and versions
    // =========================================================================

    /// Insert a block with its root version. Returns `false` if the block
    /// already exists (nothing is written).
    pub fn insert_block(&self, block: &Block, root: &Version) -> SqliteResult<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO blocks (owner_id, label, head_id, head_seq, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                block.owner_id,
                block.label,
                root.id.to_string(),
                root.seq as i64,
                block.created_at as i64,
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        insert_version(&tx, root)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn load_block(&self, key: &BlockKey) -> SqliteResult<Option<Block>> {
        let mut stmt = self.conn.prepare(
            "SELECT owner_id, label, head_id, head_seq, created_at
             FROM blocks WHERE owner_id = ?1 AND label = ?2",
        )?;
        let mut rows = stmt.query(params![key.owner_id, key.label])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_block(row)?)),
            None => Ok(None),
        }
    }

    /// All blocks of an owner, sorted by label.
    pub fn list_blocks(&self, owner_id: &str) -> SqliteResult<Vec<Block>> {
        let mut stmt = self.conn.prepare(
            "SELECT owner_id, label, head_id, head_seq, created_at
             FROM blocks WHERE owner_id = ?1 ORDER BY label",
        )?;
        let rows = stmt.query_map(params![owner_id], row_to_block)?;
        rows.collect()
    }

    pub fn load_version(&self, key: &BlockKey, id: VersionId) -> SqliteResult<Option<Version>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions
             WHERE id = ?1 AND owner_id = ?2 AND label = ?3"
        ))?;
        let mut rows = stmt.query(params![id.to_string(), key.owner_id, key.label])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_version(row)?)),
            None => Ok(None),
        }
    }

    /// Versions newest-first, at most `limit`.
    pub fn load_history(&self, key: &BlockKey, limit: usize) -> SqliteResult<Vec<Version>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions
             WHERE owner_id = ?1 AND label = ?2
             ORDER BY seq DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![key.owner_id, key.label, limit], row_to_version)?;
        rows.collect()
    }

    pub fn find_version_by_proposal(
        &self,
        key: &BlockKey,
        proposal: ProposalId,
    ) -> SqliteResult<Option<Version>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions
             WHERE source_proposal = ?1 AND owner_id = ?2 AND label = ?3
             ORDER BY seq DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![proposal.to_string(), key.owner_id, key.label])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_version(row)?)),
            None => Ok(None),
        }
    }

    /// Move the head from `parent` to `version` and store `version`.
    ///
    /// Returns `false` without writing if the head is no longer `parent`.
    pub fn append_version(&self, parent: &Version, version: &Version) -> SqliteResult<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let moved = tx.execute(
            "UPDATE blocks SET head_id = ?1, head_seq = ?2
             WHERE owner_id = ?3 AND label = ?4 AND head_id = ?5",
            params![
                version.id.to_string(),
                version.seq as i64,
                version.owner_id,
                version.block_label,
                parent.id.to_string(),
            ],
        )?;
        if moved == 0 {
            return Ok(false);
        }
        insert_version(&tx, version)?;
        tx.commit()?;
        Ok(true)
    }

    // =========================================================================
    // Proposals
    // =========================================================================

    pub fn insert_proposal(&self, p: &Proposal) -> SqliteResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO proposals ({PROPOSAL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
            ),
            params![
                p.id.to_string(),
                p.owner_id,
                p.block_label,
                p.agent_id,
                p.field,
                p.operation.strategy().as_str(),
                p.operation.match_text(),
                p.base_value,
                p.base_version.map(|v| v.to_string()),
                p.proposed_value,
                p.reasoning,
                p.confidence.as_str(),
                p.status.as_str(),
                p.created_at as i64,
                p.reviewed_at.map(|t| t as i64),
                p.reviewed_by,
                p.review_note,
                p.applied_version.map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn load_proposal(&self, id: ProposalId) -> SqliteResult<Option<Proposal>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_proposal(row)?)),
            None => Ok(None),
        }
    }

    /// Pending proposals of an owner, optionally for one label, oldest first.
    pub fn list_pending(&self, owner_id: &str, label: Option<&str>) -> SqliteResult<Vec<Proposal>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals
             WHERE owner_id = ?1 AND (?2 IS NULL OR label = ?2) AND status = 'pending'
             ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params![owner_id, label], row_to_proposal)?;
        rows.collect()
    }

    pub fn count_pending(&self, owner_id: &str, label: Option<&str>) -> SqliteResult<usize> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM proposals
             WHERE owner_id = ?1 AND (?2 IS NULL OR label = ?2) AND status = 'pending'",
            params![owner_id, label],
            |row| row.get::<_, i64>(0).map(|n| n as usize),
        )
    }

    /// Pending proposals of any owner created strictly before `cutoff`.
    pub fn pending_created_before(&self, cutoff: u64) -> SqliteResult<Vec<Proposal>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals
             WHERE status = 'pending' AND created_at < ?1
             ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params![cutoff_param(cutoff)], row_to_proposal)?;
        rows.collect()
    }

    /// Persist a review outcome, but only while the row is still pending.
    pub fn record_review(&self, p: &Proposal) -> SqliteResult<bool> {
        let changed = self.conn.execute(
            "UPDATE proposals
             SET status = ?1, reviewed_at = ?2, reviewed_by = ?3, review_note = ?4, applied_version = ?5
             WHERE id = ?6 AND status = 'pending'",
            params![
                p.status.as_str(),
                p.reviewed_at.map(|t| t as i64),
                p.reviewed_by,
                p.review_note,
                p.applied_version.map(|v| v.to_string()),
                p.id.to_string(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Mark every other pending proposal on the block superseded.
    pub fn supersede_pending(
        &self,
        key: &BlockKey,
        keep: ProposalId,
        reviewed_at: u64,
    ) -> SqliteResult<Vec<ProposalId>> {
        let tx = self.conn.unchecked_transaction()?;
        let ids: Vec<ProposalId> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM proposals
                 WHERE owner_id = ?1 AND label = ?2 AND status = 'pending' AND id != ?3
                 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map(params![key.owner_id, key.label, keep.to_string()], |row| {
                id_column(row, 0)
            })?;
            rows.collect::<SqliteResult<_>>()?
        };
        for id in &ids {
            tx.execute(
                "UPDATE proposals SET status = 'superseded', reviewed_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![reviewed_at as i64, id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Delete terminal proposals reviewed strictly before `cutoff`.
    pub fn delete_terminal_before(&self, cutoff: u64) -> SqliteResult<usize> {
        self.conn.execute(
            "DELETE FROM proposals WHERE status != 'pending' AND reviewed_at < ?1",
            params![cutoff_param(cutoff)],
        )
    }
}
