//! Server parameters governing transaction behavior.
//!
//! Two knobs, both settable on a live process: the per-request lock
//! timeout cap inside transactions and the transaction lifetime limit.
//! A [`TransactionConfig`] carries the deserialized file form; a
//! [`TransactionParameters`] holds the live atomics the session layer
//! reads on every operation.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Default cap, in milliseconds, on any lock request made inside a
/// multi-statement transaction. A few milliseconds avoids deadlocks
/// while letting fast metadata operations run without aborting
/// transactions.
pub const DEFAULT_MAX_TRANSACTION_LOCK_REQUEST_TIMEOUT_MILLIS: i64 = 5;

/// Default lifetime granted to each transaction, in seconds.
/// Transactions must eventually expire to preempt storage cache
/// pressure immobilizing the system.
pub const DEFAULT_TRANSACTION_LIFETIME_LIMIT_SECONDS: i64 = 60;

fn default_max_lock_timeout_millis() -> i64 {
    DEFAULT_MAX_TRANSACTION_LOCK_REQUEST_TIMEOUT_MILLIS
}

fn default_lifetime_limit_seconds() -> i64 {
    DEFAULT_TRANSACTION_LIFETIME_LIMIT_SECONDS
}

/// Deserialized transaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Cap on any transaction lock request, in milliseconds. Negative
    /// deactivates the cap.
    #[serde(default = "default_max_lock_timeout_millis")]
    pub max_transaction_lock_request_timeout_millis: i64,

    /// Seconds before an open transaction is expired by the reaper.
    #[serde(default = "default_lifetime_limit_seconds")]
    pub transaction_lifetime_limit_seconds: i64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            max_transaction_lock_request_timeout_millis: default_max_lock_timeout_millis(),
            transaction_lifetime_limit_seconds: default_lifetime_limit_seconds(),
        }
    }
}

impl TransactionConfig {
    /// Check the configured values.
    ///
    /// # Errors
    ///
    /// Rejects a lifetime limit below one second.
    pub fn validate(&self) -> Result<()> {
        if self.transaction_lifetime_limit_seconds < 1 {
            return Err(Error::invalid_options(
                "transaction_lifetime_limit_seconds must be greater than or equal to 1",
            ));
        }
        Ok(())
    }
}

/// Live transaction parameters, readable lock-free on every operation.
#[derive(Debug)]
pub struct TransactionParameters {
    max_lock_timeout_millis: AtomicI64,
    lifetime_limit_seconds: AtomicI64,
}

impl TransactionParameters {
    /// Build from a validated config.
    ///
    /// # Errors
    ///
    /// Propagates [`TransactionConfig::validate`] failures.
    pub fn from_config(config: &TransactionConfig) -> Result<Self> {
        config.validate()?;
        Ok(TransactionParameters {
            max_lock_timeout_millis: AtomicI64::new(
                config.max_transaction_lock_request_timeout_millis,
            ),
            lifetime_limit_seconds: AtomicI64::new(config.transaction_lifetime_limit_seconds),
        })
    }

    /// The lock request cap in milliseconds; negative means inactive.
    pub fn max_transaction_lock_request_timeout_millis(&self) -> i64 {
        self.max_lock_timeout_millis.load(Ordering::Relaxed)
    }

    /// Set the lock request cap. Any value is accepted; negative
    /// deactivates the cap.
    pub fn set_max_transaction_lock_request_timeout_millis(&self, millis: i64) {
        self.max_lock_timeout_millis.store(millis, Ordering::Relaxed);
    }

    /// The transaction lifetime limit in seconds.
    pub fn transaction_lifetime_limit_seconds(&self) -> i64 {
        self.lifetime_limit_seconds.load(Ordering::Relaxed)
    }

    /// Set the transaction lifetime limit.
    ///
    /// # Errors
    ///
    /// Rejects values below one second.
    pub fn set_transaction_lifetime_limit_seconds(&self, seconds: i64) -> Result<()> {
        if seconds < 1 {
            return Err(Error::invalid_options(
                "transaction_lifetime_limit_seconds must be greater than or equal to 1",
            ));
        }
        self.lifetime_limit_seconds.store(seconds, Ordering::Relaxed);
        Ok(())
    }
}

impl Default for TransactionParameters {
    fn default() -> Self {
        TransactionParameters {
            max_lock_timeout_millis: AtomicI64::new(default_max_lock_timeout_millis()),
            lifetime_limit_seconds: AtomicI64::new(default_lifetime_limit_seconds()),
        }
    }
}
