//! Fan-out Archiver: erasure-coded segments out to their
//! owning nodes over a pluggable message bus, joined with partial-failure
//! semantics.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use uuid::Uuid;

use crate::error::ArchiverError;

/// 32-bit rolling checksum over a segment's payload.
pub fn adler32(data: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &byte in data {
        a = (a + u32::from(byte)) % MOD_ADLER;
        b = (b + a) % MOD_ADLER;
    }
    (b << 16) | a
}

/// 128-bit content hash over a segment's payload.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    md5::compute(data).0
}

/// One segment's write request, dispatched to `exchanges[segment_num]`.
#[derive(Debug, Clone)]
pub struct ArchiveKeyEntire {
    pub request_id: Uuid,
    pub owner_id: i64,
    pub reply_exchange: String,
    pub reply_queue: String,
    pub timestamp: DateTime<Utc>,
    pub key: String,
    pub version: u32,
    pub segment_num: usize,
    pub adler32: u32,
    pub md5: [u8; 16],
    pub payload: Bytes,
}

/// A node's reply to an [`ArchiveKeyEntire`].
#[derive(Debug, Clone, Copy)]
pub struct ArchiveReply {
    pub request_id: Uuid,
    /// Bytes superseded by this write, summed across replies for quota
    /// accounting.
    pub previous_size: u64,
}

/// Dispatch abstraction over the message bus. Implementations send one
/// message and resolve with the node's reply, or an error if the send
/// itself failed (not a timeout -- that is handled by the archiver, which
/// races all sends against a single deadline).
pub trait MessageBus: Send + Sync {
    fn send(
        &self,
        destination: &str,
        message: ArchiveKeyEntire,
    ) -> impl std::future::Future<Output = Result<ArchiveReply, ArchiverError>> + Send;
}

pub struct Archiver<B> {
    bus: B,
    /// Fixed, index-addressed list of `n` node destinations.
    exchanges: Vec<String>,
    /// `redundancy = n - k`; a quorum of `k` successful replies is enough.
    redundancy: usize,
    reply_exchange: String,
    reply_queue: String,
}

impl<B: MessageBus> Archiver<B> {
    pub fn new(
        bus: B,
        exchanges: Vec<String>,
        redundancy: usize,
        reply_exchange: impl Into<String>,
        reply_queue: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            exchanges,
            redundancy,
            reply_exchange: reply_exchange.into(),
            reply_queue: reply_queue.into(),
        }
    }

    /// Archive one whole object into `n = segments.len()` nodes, one
    /// segment per node. Succeeds once `k = n - redundancy` replies are in,
    /// even if some sends are still outstanding; fails `QuorumLost` once
    /// enough sends have concluded that `k` can no longer be reached;
    /// otherwise, if the deadline passes first, fails `Timeout`.
    pub async fn archive_entire(
        &self,
        owner_id: i64,
        key: &str,
        segments: Vec<Bytes>,
        timestamp: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<u64, ArchiverError> {
        let n = segments.len();
        assert_eq!(
            n,
            self.exchanges.len(),
            "one segment must be supplied per exchange"
        );
        let required = n.saturating_sub(self.redundancy);

        let mut pending: FuturesUnordered<_> = segments
            .into_iter()
            .enumerate()
            .map(|(segment_num, payload)| self.send_one(owner_id, key, segment_num, payload, timestamp))
            .collect();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut successes: Vec<ArchiveReply> = Vec::with_capacity(n);
        let mut concluded = 0usize;

        loop {
            if successes.len() >= required {
                return Ok(successes.iter().map(|r| r.previous_size).sum());
            }
            if concluded == n {
                return Err(ArchiverError::QuorumLost {
                    successes: successes.len(),
                    required,
                });
            }

            tokio::select! {
                biased;
                next = pending.next() => {
                    match next {
                        Some(Ok(reply)) => {
                            successes.push(reply);
                            concluded += 1;
                        }
                        Some(Err(_)) => {
                            concluded += 1;
                        }
                        None => {
                            // Shouldn't happen: concluded should already equal n.
                            concluded = n;
                        }
                    }
                }
                () = &mut deadline => {
                    return Err(ArchiverError::Timeout);
                }
            }
        }
    }

    async fn send_one(
        &self,
        owner_id: i64,
        key: &str,
        segment_num: usize,
        payload: Bytes,
        timestamp: DateTime<Utc>,
    ) -> Result<ArchiveReply, ArchiverError> {
        let destination = &self.exchanges[segment_num];
        let message = ArchiveKeyEntire {
            request_id: Uuid::new_v4(),
            owner_id,
            reply_exchange: self.reply_exchange.clone(),
            reply_queue: self.reply_queue.clone(),
            timestamp,
            key: key.to_owned(),
            version: 0,
            segment_num,
            adler32: adler32(&payload),
            md5: md5_digest(&payload),
            payload,
        };
        self.bus.send(destination, message).await
    }
}
