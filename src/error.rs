//! Error taxonomy shared by the reader, archiver and router (spec §7).

use thiserror::Error;

/// Errors surfaced by the segment reader. Not retried by the reader itself.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("no matching sequence")]
    NotFound,
    #[error("value file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("node database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
}

/// Errors surfaced by the fan-out archiver. Not retried by the archiver
/// itself -- retry policy belongs to the caller.
#[derive(Debug, Error)]
pub enum ArchiverError {
    #[error("message bus unavailable for segment {segment_num}")]
    BusUnavailable { segment_num: usize },
    #[error("timed out waiting for replies")]
    Timeout,
    #[error("quorum lost: {successes} of {required} required replies succeeded")]
    QuorumLost { successes: usize, required: usize },
}

/// Internal-only errors for the router's supervised DB interaction. Never
/// escapes the router -- callers only ever see a `RouteVerdict`.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("transient database error: {0}")]
    DbTransient(#[from] sqlx::Error),
    #[error("malformed reply: {0}")]
    Protocol(String),
}
