//! Identifiers and time points shared across the session layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use std::time::Duration;
use uuid::Uuid;

/// Identifier of one logical client session.
///
/// Opaque to the session layer: only equality, hashing and display are
/// ever used. One [`crate::context::ServiceContext`]-wide session object
/// exists per id at a time; the catalog above this crate enforces that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The raw uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotone per-session integer identifying the current retryable write
/// or multi-statement transaction.
pub type TxnNumber = i64;

/// Sentinel for a session that has not yet observed any transaction.
pub const UNINITIALIZED_TXN_NUMBER: TxnNumber = -1;

/// Per-transaction integer identifying a single write statement.
pub type StmtId = i32;

/// Statement id reserved for the dead-end sentinel marking a truncated
/// oplog chain. Never assigned to a real statement.
pub const INCOMPLETE_HISTORY_STMT_ID: StmtId = i32::MAX;

/// A storage-engine timestamp. Zero is the null timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The null timestamp.
    pub const fn null() -> Self {
        Timestamp(0)
    }

    /// Whether this is the null timestamp.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A position in the replicated oplog: storage timestamp plus the
/// replication term it was written under.
///
/// Ordering is lexicographic on `(timestamp, term)`, matching the order
/// entries appear in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpTime {
    /// Storage timestamp of the entry.
    pub timestamp: Timestamp,
    /// Replication term the entry was written under.
    pub term: i64,
}

/// Term value of the null optime.
pub const UNINITIALIZED_TERM: i64 = -1;

impl OpTime {
    /// Build an optime from its parts.
    pub const fn new(timestamp: Timestamp, term: i64) -> Self {
        OpTime { timestamp, term }
    }

    /// The null optime, ordered before every real one.
    pub const fn null() -> Self {
        OpTime {
            timestamp: Timestamp::null(),
            term: UNINITIALIZED_TERM,
        }
    }

    /// Whether this is the null optime.
    pub fn is_null(&self) -> bool {
        self.timestamp.is_null() && self.term == UNINITIALIZED_TERM
    }
}

impl Default for OpTime {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ts: {}, t: {} }}", self.timestamp, self.term)
    }
}

/// Wall-clock time in milliseconds since the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WallTime(i64);

impl WallTime {
    /// The minimum wall time, used as the "unpopulated" sentinel.
    pub const MIN: WallTime = WallTime(i64::MIN);

    /// Build from milliseconds since the epoch.
    pub const fn from_millis(millis: i64) -> Self {
        WallTime(millis)
    }

    /// Milliseconds since the epoch.
    pub const fn as_millis(&self) -> i64 {
        self.0
    }
}

impl Add<Duration> for WallTime {
    type Output = WallTime;

    fn add(self, rhs: Duration) -> WallTime {
        WallTime(self.0.saturating_add(rhs.as_millis() as i64))
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
