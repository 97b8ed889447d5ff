//! Kademlia routing table.
//!
//! Peers are stored in 256 buckets indexed by the log2 distance from the local identifier. Each
//! bucket holds up to `K` peers, disconnected peers first, then connected peers in order of
//! recency. A full bucket can hold a single pending candidate which replaces the oldest
//! disconnected incumbent once its timeout elapses.

use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;

use crate::core::enr::Enr;

mod bucket;
mod table;

#[cfg(feature = "sync")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
mod sync;

pub use table::RoutingTable;

#[cfg(feature = "sync")]
pub use sync::SyncRoutingTable;

/// The number of buckets in the routing table.
pub const NUM_BUCKETS: usize = 256;

/// The default maximum number of peers per bucket.
pub const MAX_NODES_PER_BUCKET: usize = 16;

/// Routing table parameters.
#[derive(Debug, Clone, Copy)]
pub struct TableConfig {
    /// The maximum number of peers in a bucket (`K`).
    pub bucket_size: usize,
    /// How long a pending candidate waits before it is applied or dropped.
    pub pending_timeout: Duration,
    /// The number of failed requests after which a peer is evicted.
    pub max_strikes: u8,
    /// How long an evicted peer is refused re-entry.
    pub ignore_duration: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            bucket_size: MAX_NODES_PER_BUCKET,
            pending_timeout: Duration::from_secs(60),
            max_strikes: 3,
            ignore_duration: Duration::from_secs(120),
        }
    }
}

/// The connection status of a stored peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Connected,
    Disconnected,
}

/// A peer record as stored in a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub value: Enr,
    pub status: NodeStatus,
    pub last_seen: OffsetDateTime,
}

impl Node {
    pub(crate) fn new(value: Enr, status: NodeStatus) -> Self {
        Self {
            value,
            status,
            last_seen: OffsetDateTime::now_utc(),
        }
    }
}

/// A stored peer and whether it is the pending entry of its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub node: Node,
    pub pending: bool,
}

/// The outcome of [`RoutingTable::insert_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// The peer was added to its bucket.
    Inserted,
    /// The bucket is full, the peer is held as the pending entry.
    Pending,
    /// The stored value was replaced by a newer record.
    Updated,
    /// The status changed to `Disconnected`.
    StatusUpdated,
    /// The status changed to `Connected`, the peer is now the most recent in its bucket.
    UpdatedAndPromoted,
    /// The pending entry was updated.
    UpdatedPending,
    /// The peer is already stored with the same value and status.
    NotModified,
    /// The peer could not be stored.
    Failed(FailureReason),
}

/// Why an insert was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The local identifier can't be stored.
    InvalidSelfUpdate,
    /// The bucket is full and already holds a pending entry.
    BucketFull,
    /// The peer was recently evicted and is being ignored.
    Ignored,
}

/// The outcome of a successful update of an existing peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Updated,
    UpdatedAndPromoted,
    UpdatedPending,
    NotModified,
}

/// Errors returned when updating a peer that can't be found.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("the peer isn't present in the routing table")]
    KeyNonExistent,
    #[error("the local identifier can't be stored in the routing table")]
    InvalidSelfUpdate,
}

/// Bucket-level notifications, drained by the table's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableEvent {
    /// A full bucket received a candidate, the peer is the current eviction target.
    PendingEviction(Enr),
    /// A pending candidate was inserted, possibly replacing an incumbent.
    AppliedEviction {
        inserted: Enr,
        evicted: Option<Enr>,
    },
}
