//! Storage-node database access for the segment reader (the
//! `segment` / `segment_sequence` schema).
//!
//! `SegmentStore` is a trait rather than a concrete `PgPool` wrapper so the
//! reader's block-offset and ordering logic (the actually hard part) can be
//! unit-tested against [`memory::InMemorySegmentStore`] without a live
//! Postgres instance, the same way `services/receiver` keeps its DB access
//! behind a narrow struct with a `DbResult` alias.

use sqlx::{PgPool, Row};

use crate::error::ReaderError;
use crate::model::{SegmentRow, SegmentStatus, SequenceRow};

/// Node-local database access needed by the segment reader.
///
/// Queries never deduplicate across versions or handoffs -- that is the
/// caller's job.
pub trait SegmentStore: Send + Sync {
    fn all_segment_rows_for_key(
        &self,
        collection_id: i64,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Vec<SegmentRow>, ReaderError>> + Send;

    fn sequence_row(
        &self,
        unified_id: i64,
        conjoined_part: i32,
        segment_num: i32,
        sequence_num: i64,
    ) -> impl std::future::Future<Output = Result<Option<SequenceRow>, ReaderError>> + Send;

    fn sequence_rows_for_segment(
        &self,
        unified_id: i64,
        conjoined_part: i32,
        segment_num: i32,
    ) -> impl std::future::Future<Output = Result<Vec<SequenceRow>, ReaderError>> + Send;

    fn sequence_rows_for_handoff_segment(
        &self,
        unified_id: i64,
        conjoined_part: i32,
        segment_num: i32,
        handoff_node_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<SequenceRow>, ReaderError>> + Send;
}

/// Postgres-backed implementation, using runtime `sqlx::query` (not the
/// `query!` compile-time macro family) since this crate has no build-time
/// `DATABASE_URL` to check against, matching `repo/reads.rs`'s approach.
pub struct PgSegmentStore {
    pool: PgPool,
}

impl PgSegmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn segment_row_from(row: &sqlx::postgres::PgRow) -> SegmentRow {
    let status_str: String = row.get("status");
    SegmentRow {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        key: row.get("key"),
        unified_id: row.get("unified_id"),
        conjoined_part: row.get("conjoined_part"),
        segment_num: row.get("segment_num"),
        timestamp: row.get("timestamp"),
        status: SegmentStatus::from_char(status_str.chars().next().unwrap_or('?')),
        handoff_node_id: row.get("handoff_node_id"),
    }
}

fn sequence_row_from(row: &sqlx::postgres::PgRow) -> SequenceRow {
    let adler32: i64 = row.get("adler32");
    let md5_bytes: Vec<u8> = row.get("md5");
    let mut md5 = [0u8; 16];
    let len = md5_bytes.len().min(16);
    md5[..len].copy_from_slice(&md5_bytes[..len]);
    SequenceRow {
        segment_id: row.get("segment_id"),
        sequence_num: row.get("sequence_num"),
        value_file_id: row.get("value_file_id"),
        value_file_offset: row.get("value_file_offset"),
        size: row.get("size"),
        adler32: adler32 as u32,
        md5,
    }
}

impl SegmentStore for PgSegmentStore {
    async fn all_segment_rows_for_key(
        &self,
        collection_id: i64,
        key: &str,
    ) -> Result<Vec<SegmentRow>, ReaderError> {
        let rows = sqlx::query(
            r#"SELECT id, collection_id, key, unified_id, conjoined_part, segment_num,
                      timestamp, status, handoff_node_id
               FROM segment
               WHERE collection_id = $1 AND key = $2
               ORDER BY timestamp DESC, segment_num ASC"#,
        )
        .bind(collection_id)
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(segment_row_from).collect())
    }

    async fn sequence_row(
        &self,
        unified_id: i64,
        conjoined_part: i32,
        segment_num: i32,
        sequence_num: i64,
    ) -> Result<Option<SequenceRow>, ReaderError> {
        let row = sqlx::query(
            r#"SELECT segment_sequence.segment_id, segment_sequence.sequence_num,
                      segment_sequence.value_file_id, segment_sequence.value_file_offset,
                      segment_sequence.size, segment_sequence.adler32, segment_sequence.md5
               FROM segment_sequence
               WHERE segment_id = (
                   SELECT id FROM segment
                   WHERE unified_id = $1 AND conjoined_part = $2 AND segment_num = $3
                     AND handoff_node_id IS NULL AND status = 'F'
               )
               AND sequence_num = $4"#,
        )
        .bind(unified_id)
        .bind(conjoined_part)
        .bind(segment_num)
        .bind(sequence_num)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(sequence_row_from))
    }

    async fn sequence_rows_for_segment(
        &self,
        unified_id: i64,
        conjoined_part: i32,
        segment_num: i32,
    ) -> Result<Vec<SequenceRow>, ReaderError> {
        let rows = sqlx::query(
            r#"SELECT segment_sequence.segment_id, segment_sequence.sequence_num,
                      segment_sequence.value_file_id, segment_sequence.value_file_offset,
                      segment_sequence.size, segment_sequence.adler32, segment_sequence.md5
               FROM segment_sequence
               WHERE segment_id = (
                   SELECT id FROM segment
                   WHERE unified_id = $1 AND conjoined_part = $2 AND segment_num = $3
                     AND handoff_node_id IS NULL AND status = 'F'
               )
               ORDER BY sequence_num ASC"#,
        )
        .bind(unified_id)
        .bind(conjoined_part)
        .bind(segment_num)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(sequence_row_from).collect())
    }

    async fn sequence_rows_for_handoff_segment(
        &self,
        unified_id: i64,
        conjoined_part: i32,
        segment_num: i32,
        handoff_node_id: i64,
    ) -> Result<Vec<SequenceRow>, ReaderError> {
        let rows = sqlx::query(
            r#"SELECT segment_sequence.segment_id, segment_sequence.sequence_num,
                      segment_sequence.value_file_id, segment_sequence.value_file_offset,
                      segment_sequence.size, segment_sequence.adler32, segment_sequence.md5
               FROM segment_sequence
               WHERE segment_id = (
                   SELECT id FROM segment
                   WHERE unified_id = $1 AND conjoined_part = $2 AND segment_num = $3
                     AND handoff_node_id = $4 AND status = 'F'
               )
               ORDER BY sequence_num ASC"#,
        )
        .bind(unified_id)
        .bind(conjoined_part)
        .bind(segment_num)
        .bind(handoff_node_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(sequence_row_from).collect())
    }
}

/// Deterministic in-memory fake, used by the reader's unit tests.
pub mod memory {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemorySegmentStore {
        segments: Mutex<Vec<SegmentRow>>,
        sequences: Mutex<Vec<SequenceRow>>,
    }

    impl InMemorySegmentStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_segment(self, segment: SegmentRow) -> Self {
            self.segments.lock().unwrap().push(segment);
            self
        }

        pub fn with_sequence(self, sequence: SequenceRow) -> Self {
            self.sequences.lock().unwrap().push(sequence);
            self
        }
    }

    impl SegmentStore for InMemorySegmentStore {
        async fn all_segment_rows_for_key(
            &self,
            collection_id: i64,
            key: &str,
        ) -> Result<Vec<SegmentRow>, ReaderError> {
            let mut rows: Vec<SegmentRow> = self
                .segments
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.collection_id == collection_id && s.key == key)
                .cloned()
                .collect();
            rows.sort_by(|a, b| {
                b.timestamp
                    .cmp(&a.timestamp)
                    .then(a.segment_num.cmp(&b.segment_num))
            });
            Ok(rows)
        }

        async fn sequence_row(
            &self,
            unified_id: i64,
            conjoined_part: i32,
            segment_num: i32,
            sequence_num: i64,
        ) -> Result<Option<SequenceRow>, ReaderError> {
            let segment_id = self.final_segment_id(unified_id, conjoined_part, segment_num, None);
            Ok(segment_id.and_then(|id| {
                self.sequences
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|s| s.segment_id == id && s.sequence_num == sequence_num)
                    .copied()
            }))
        }

        async fn sequence_rows_for_segment(
            &self,
            unified_id: i64,
            conjoined_part: i32,
            segment_num: i32,
        ) -> Result<Vec<SequenceRow>, ReaderError> {
            Ok(self.rows_for(self.final_segment_id(unified_id, conjoined_part, segment_num, None)))
        }

        async fn sequence_rows_for_handoff_segment(
            &self,
            unified_id: i64,
            conjoined_part: i32,
            segment_num: i32,
            handoff_node_id: i64,
        ) -> Result<Vec<SequenceRow>, ReaderError> {
            Ok(self.rows_for(self.final_segment_id(
                unified_id,
                conjoined_part,
                segment_num,
                Some(handoff_node_id),
            )))
        }
    }

    impl InMemorySegmentStore {
        fn final_segment_id(
            &self,
            unified_id: i64,
            conjoined_part: i32,
            segment_num: i32,
            handoff_node_id: Option<i64>,
        ) -> Option<i64> {
            self.segments
                .lock()
                .unwrap()
                .iter()
                .find(|s| {
                    s.unified_id == unified_id
                        && s.conjoined_part == conjoined_part
                        && s.segment_num == segment_num
                        && s.handoff_node_id == handoff_node_id
                        && matches!(s.status, SegmentStatus::Final)
                })
                .map(|s| s.id)
        }

        fn rows_for(&self, segment_id: Option<i64>) -> Vec<SequenceRow> {
            let Some(id) = segment_id else {
                return Vec::new();
            };
            let mut rows: Vec<SequenceRow> = self
                .sequences
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.segment_id == id)
                .copied()
                .collect();
            rows.sort_by_key(|s| s.sequence_num);
            rows
        }
    }
}
