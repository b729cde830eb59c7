//! Shared data-model types for collections, clusters, segments and sequences.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named, non-deleted container owned by one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub cluster_id: i64,
    pub creation_time: DateTime<Utc>,
    pub deletion_time: Option<DateTime<Utc>>,
}

/// One node in a cluster's ordered host list.
///
/// Segment index `i` is always owned by the node at position `i` here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHost {
    pub node_name: String,
    pub hostname: String,
    pub node_number_in_cluster: i32,
}

/// Ordered host list for a cluster, as resolved from the central DB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHosts {
    pub cluster_id: i64,
    pub hosts: Vec<NodeHost>,
}

/// Status of a segment row. Only `Final` segments are ever readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Final,
    Other(char),
}

impl SegmentStatus {
    pub fn from_char(c: char) -> Self {
        match c {
            'F' => Self::Final,
            other => Self::Other(other),
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Final => 'F',
            Self::Other(c) => c,
        }
    }
}

/// One erasure-coded share of an object version stored on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRow {
    pub id: i64,
    pub collection_id: i64,
    pub key: String,
    pub unified_id: i64,
    pub conjoined_part: i32,
    pub segment_num: i32,
    pub timestamp: DateTime<Utc>,
    pub status: SegmentStatus,
    pub handoff_node_id: Option<i64>,
}

/// A contiguous byte range within a segment, persisted in a value file.
///
/// `adler32`/`md5` are the content hashes recorded at write time; no reader
/// operation currently verifies them on read, matching the reference
/// implementation, but they are carried here for fidelity with what gets
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRow {
    pub segment_id: i64,
    pub sequence_num: i64,
    pub value_file_id: i64,
    pub value_file_offset: i64,
    pub size: i64,
    pub adler32: u32,
    pub md5: [u8; 16],
}

impl SequenceRow {
    /// Number of fixed-size encoded blocks this sequence spans, rounded up.
    pub fn block_count(&self, block_size: i64) -> i64 {
        blocks_for_size(self.size, block_size)
    }
}

/// `ceil(size / block_size)`, the unit of block-offset arithmetic used to
/// resume a read partway through a segment.
pub fn blocks_for_size(size: i64, block_size: i64) -> i64 {
    assert!(block_size > 0, "block_size must be positive");
    (size + block_size - 1) / block_size
}
