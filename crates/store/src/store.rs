use std::sync::Arc;

use {
    tokio::sync::Mutex,
    tracing::{debug, warn},
};

use crate::{
    Result,
    segment::{DeletePredicate, GroupKey, Segment, StoredSegment},
};

/// Outcome of attempting to persist a new segment.
#[derive(Debug)]
pub enum InsertOutcome {
    /// The segment was stored and should be driven through reassembly.
    Accepted(StoredSegment),
    /// An identical segment was already delivered; drop this one silently.
    Duplicate,
}

/// How [`SegmentStore::finalize`] disposes of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeMode {
    /// Set the deleted flag but keep the row for future duplicate detection.
    MarkDelivered,
    /// Physically remove the rows (expired or invalid data).
    Purge,
}

/// One non-deleted row of a multi-part group, as needed for reassembly.
#[derive(Debug, sqlx::FromRow)]
pub struct GroupRow {
    pub row_id: i64,
    pub payload: Vec<u8>,
    pub sequence: i64,
    pub destination_port: Option<i64>,
    pub display_address: String,
    pub timestamp_ms: i64,
}

#[derive(sqlx::FromRow)]
struct DupRow {
    row_id: i64,
    payload: Vec<u8>,
    deleted: i64,
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    row_id: i64,
    payload: Vec<u8>,
    timestamp_ms: i64,
    destination_port: Option<i64>,
    format: String,
    address: String,
    display_address: String,
    reference_number: i64,
    sequence: i64,
    total_count: i64,
    body_text: Option<String>,
}

/// SQLite-backed append-only table of message segments.
///
/// Safe for concurrent use from several intake handlers: writes are
/// serialized through a shared lock and [`SegmentStore::insert`] runs its
/// dedup queries and the insert inside one transaction, so two handlers
/// racing on the same identity cannot both be told their row was accepted.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    pool: sqlx::SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SegmentStore {
    /// Wrap an existing pool. Call [`SegmentStore::ensure_schema`] before use.
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Connect to `url` and create the schema if missing.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = sqlx::SqlitePool::connect(url).await?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the segments table and its group lookup index.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS segments (
                row_id           INTEGER PRIMARY KEY AUTOINCREMENT,
                payload          BLOB NOT NULL,
                timestamp_ms     INTEGER NOT NULL,
                destination_port INTEGER,
                format           TEXT NOT NULL DEFAULT '',
                address          TEXT NOT NULL,
                display_address  TEXT NOT NULL DEFAULT '',
                reference_number INTEGER NOT NULL,
                sequence         INTEGER NOT NULL,
                total_count      INTEGER NOT NULL,
                body_text        TEXT,
                deleted          INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS segments_group_idx \
             ON segments (address, reference_number, total_count)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a new segment, deduplicating against previously stored rows.
    ///
    /// An exact match (address, reference, total, sequence, port) that is
    /// already marked deleted means the message was fully delivered before,
    /// so the new arrival is rejected as [`InsertOutcome::Duplicate`]. A live
    /// exact match for a single-fragment message is replaced, last writer
    /// wins. Multi-fragment messages additionally purge any live row holding
    /// the same group slot (a stale leftover from a sender restart) before
    /// the new row is inserted.
    pub async fn insert(&self, segment: &Segment) -> Result<InsertOutcome> {
        // The dedup check and the insert must observe and produce one
        // consistent state; other writers wait on the lock.
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let exact = sqlx::query_as::<_, DupRow>(
            "SELECT row_id, payload, deleted FROM segments \
             WHERE address = ? AND reference_number = ? AND total_count = ? \
               AND sequence = ? AND destination_port IS ?",
        )
        .bind(&segment.address)
        .bind(segment.reference_number)
        .bind(segment.total_count)
        .bind(segment.sequence)
        .bind(segment.dest_port)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = exact {
            if row.deleted != 0 {
                warn!(
                    address = %segment.display_address,
                    sequence = segment.sequence,
                    "discarding duplicate of an already delivered segment"
                );
                log_payload_mismatch(segment, &row.payload);
                return Ok(InsertOutcome::Duplicate);
            }
            if segment.is_single() {
                // Replacement semantics: the old undelivered copy loses.
                sqlx::query("DELETE FROM segments WHERE row_id = ?")
                    .bind(row.row_id)
                    .execute(&mut *tx)
                    .await?;
                warn!(
                    address = %segment.display_address,
                    "replacing undelivered duplicate of single-fragment message"
                );
                log_payload_mismatch(segment, &row.payload);
            }
            // Live multi-fragment matches are handled by the slot purge below.
        }

        if segment.total_count > 1 {
            let purged = sqlx::query(
                "DELETE FROM segments \
                 WHERE address = ? AND reference_number = ? AND total_count = ? \
                   AND sequence = ? AND deleted = 0",
            )
            .bind(&segment.address)
            .bind(segment.reference_number)
            .bind(segment.total_count)
            .bind(segment.sequence)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if purged > 0 {
                warn!(
                    purged,
                    sequence = segment.sequence,
                    "replaced stale rows holding the same group slot"
                );
            }
        }

        let row_id = sqlx::query(
            r#"INSERT INTO segments
               (payload, timestamp_ms, destination_port, format, address,
                display_address, reference_number, sequence, total_count, body_text)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&segment.payload)
        .bind(segment.timestamp_ms)
        .bind(segment.dest_port)
        .bind(&segment.format)
        .bind(&segment.address)
        .bind(&segment.display_address)
        .bind(segment.reference_number)
        .bind(segment.sequence)
        .bind(segment.total_count)
        .bind(&segment.body_text)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;

        let delete = if segment.is_single() {
            DeletePredicate::ById(row_id)
        } else {
            DeletePredicate::ByGroup(segment.group_key())
        };
        debug!(row_id, "stored segment");

        Ok(InsertOutcome::Accepted(StoredSegment {
            segment: segment.clone(),
            row_id,
            delete,
        }))
    }

    /// Dispose of the rows selected by `predicate`. Returns the affected row
    /// count; zero rows is logged as an anomaly but is not an error.
    pub async fn finalize(&self, predicate: &DeletePredicate, mode: FinalizeMode) -> Result<u64> {
        let _write = self.write_lock.lock().await;
        let rows = match (predicate, mode) {
            (DeletePredicate::ById(row_id), FinalizeMode::MarkDelivered) => {
                sqlx::query("UPDATE segments SET deleted = 1 WHERE row_id = ? AND deleted = 0")
                    .bind(row_id)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            },
            (DeletePredicate::ById(row_id), FinalizeMode::Purge) => {
                sqlx::query("DELETE FROM segments WHERE row_id = ?")
                    .bind(row_id)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            },
            (DeletePredicate::ByGroup(key), FinalizeMode::MarkDelivered) => {
                sqlx::query(
                    "UPDATE segments SET deleted = 1 \
                     WHERE address = ? AND reference_number = ? AND total_count = ? \
                       AND deleted = 0",
                )
                .bind(&key.address)
                .bind(key.reference_number)
                .bind(key.total_count)
                .execute(&self.pool)
                .await?
                .rows_affected()
            },
            (DeletePredicate::ByGroup(key), FinalizeMode::Purge) => {
                sqlx::query(
                    "DELETE FROM segments \
                     WHERE address = ? AND reference_number = ? AND total_count = ?",
                )
                .bind(&key.address)
                .bind(key.reference_number)
                .bind(key.total_count)
                .execute(&self.pool)
                .await?
                .rows_affected()
            },
        };

        if rows == 0 {
            warn!(?predicate, ?mode, "finalize affected no rows");
        } else {
            debug!(rows, ?mode, "finalized segment rows");
        }
        Ok(rows)
    }

    /// All live rows of one multi-part group, in sequence order.
    pub async fn group_rows(&self, key: &GroupKey) -> Result<Vec<GroupRow>> {
        let rows = sqlx::query_as::<_, GroupRow>(
            "SELECT row_id, payload, sequence, destination_port, display_address, timestamp_ms \
             FROM segments \
             WHERE address = ? AND reference_number = ? AND total_count = ? AND deleted = 0 \
             ORDER BY sequence",
        )
        .bind(&key.address)
        .bind(key.reference_number)
        .bind(key.total_count)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Every live row in the store, rebuilt as dispatchable trackers for the
    /// boot-time recovery scan. Fields the table does not persist (priority,
    /// index offset) take the transport defaults.
    pub async fn pending(&self) -> Result<Vec<StoredSegment>> {
        let rows = sqlx::query_as::<_, PendingRow>(
            "SELECT row_id, payload, timestamp_ms, destination_port, format, address, \
                    display_address, reference_number, sequence, total_count, body_text \
             FROM segments WHERE deleted = 0 ORDER BY row_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StoredSegment::from).collect())
    }
}

impl From<PendingRow> for StoredSegment {
    fn from(row: PendingRow) -> Self {
        let single = row.total_count == 1;
        let segment = Segment {
            payload: row.payload,
            timestamp_ms: row.timestamp_ms,
            dest_port: row.destination_port,
            format: row.format,
            address: row.address.clone(),
            display_address: row.display_address,
            reference_number: row.reference_number,
            sequence: row.sequence,
            total_count: row.total_count,
            body_text: row.body_text,
            priority: false,
            index_offset: if single { 0 } else { 1 },
        };
        let delete = if single {
            DeletePredicate::ById(row.row_id)
        } else {
            DeletePredicate::ByGroup(segment.group_key())
        };
        Self {
            segment,
            row_id: row.row_id,
            delete,
        }
    }
}

fn log_payload_mismatch(segment: &Segment, stored: &[u8]) {
    if segment.payload != stored {
        warn!(
            new_len = segment.payload.len(),
            stored_len = stored.len(),
            "duplicate segment payload differs from the stored row"
        );
    }
}
