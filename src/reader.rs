//! Segment Reader: per-node reconstruction of a segment's
//! byte payload from its ordered chain of sequences.

use bytes::Bytes;
use futures::Stream;

use crate::error::ReaderError;
use crate::model::{SegmentRow, SequenceRow};
use crate::store::SegmentStore;
use crate::valuefile::OpenValueFiles;

/// First item of [`SegmentReader::generate_all_sequence_rows`]: counts
/// describing how the block-offset walk landed, computed eagerly before any
/// byte is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// Sequences left to yield after the walk.
    pub remaining: usize,
    /// Sequences skipped entirely because they end before `block_offset`.
    pub skipped: usize,
    /// Block index within the first emitted sequence to resume from.
    pub offset_residue: i64,
}

pub struct SegmentReader<S> {
    store: S,
    repository_root: std::path::PathBuf,
    block_size: i64,
}

impl<S: SegmentStore> SegmentReader<S> {
    pub fn new(store: S, repository_root: impl Into<std::path::PathBuf>, block_size: i64) -> Self {
        Self {
            store,
            repository_root: repository_root.into(),
            block_size,
        }
    }

    /// Every segment row for `(collection_id, key)`, ordered
    /// `timestamp desc, segment_num asc`. May contain duplicates across
    /// versions and handoffs -- the caller must tolerate that.
    pub async fn get_all_segment_rows_for_key(
        &self,
        collection_id: i64,
        key: &str,
    ) -> Result<Vec<SegmentRow>, ReaderError> {
        self.store.all_segment_rows_for_key(collection_id, key).await
    }

    /// Fetch exactly one sequence's bytes for a non-handoff, finalized
    /// segment. `NotFound` if no such sequence exists.
    pub async fn retrieve_one_sequence(
        &self,
        unified_id: i64,
        conjoined_part: i32,
        segment_num: i32,
        sequence_num: i64,
    ) -> Result<(SequenceRow, Bytes), ReaderError> {
        let row = self
            .store
            .sequence_row(unified_id, conjoined_part, segment_num, sequence_num)
            .await?
            .ok_or(ReaderError::NotFound)?;

        let mut files = OpenValueFiles::new(self.repository_root.clone());
        let bytes = files.read(row.value_file_id, row.value_file_offset, row.size)?;
        Ok((row, Bytes::from(bytes)))
    }

    /// Walk a segment's sequences to locate the resume point for
    /// `block_offset`, returning the preamble plus a lazy, restartable-once
    /// stream of the remaining `(row, bytes)` pairs in ascending
    /// `sequence_num` order.
    ///
    /// Selects the non-handoff or handoff query based on whether
    /// `handoff_node_id` is set -- handoff and non-handoff sequences are
    /// never mixed.
    pub async fn generate_all_sequence_rows(
        &self,
        unified_id: i64,
        conjoined_part: i32,
        segment_num: i32,
        handoff_node_id: Option<i64>,
        block_offset: i64,
    ) -> Result<
        (
            Preamble,
            impl Stream<Item = Result<(SequenceRow, Bytes), ReaderError>>,
        ),
        ReaderError,
    > {
        let sequence_rows = match handoff_node_id {
            None => {
                self.store
                    .sequence_rows_for_segment(unified_id, conjoined_part, segment_num)
                    .await?
            }
            Some(handoff_id) => {
                self.store
                    .sequence_rows_for_handoff_segment(
                        unified_id,
                        conjoined_part,
                        segment_num,
                        handoff_id,
                    )
                    .await?
            }
        };

        let (preamble, skipped) = compute_preamble(&sequence_rows, self.block_size, block_offset);
        let remaining_rows = sequence_rows[skipped..].to_vec();
        let repository_root = self.repository_root.clone();

        let stream = async_stream::try_stream! {
            let mut files = OpenValueFiles::new(repository_root);
            for row in remaining_rows {
                let bytes = files.read(row.value_file_id, row.value_file_offset, row.size)?;
                assert_eq!(
                    bytes.len() as i64,
                    row.size,
                    "value file yielded a payload of the wrong size"
                );
                yield (row, Bytes::from(bytes));
            }
        };

        Ok((preamble, stream))
    }
}

/// The block-offset walk itself, isolated as a
/// pure function so it is trivially unit-tested without any I/O.
fn compute_preamble(rows: &[SequenceRow], block_size: i64, block_offset: i64) -> (Preamble, usize) {
    let mut block_count: i64 = 0;
    let mut skipped = 0usize;
    let mut offset_residue = 0i64;

    for row in rows {
        block_count += row.block_count(block_size);
        if block_count < block_offset {
            skipped += 1;
            continue;
        }
        if block_offset > 0 {
            offset_residue = if skipped == 0 {
                block_offset
            } else {
                block_count - block_offset
            };
        }
        break;
    }

    let preamble = Preamble {
        remaining: rows.len() - skipped,
        skipped,
        offset_residue,
    };
    (preamble, skipped)
}
