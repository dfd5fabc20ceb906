//! Test failpoints.
//!
//! Failpoints are compiled in but inert until a test enables them. They
//! live on the [`crate::context::ServiceContext`] rather than in
//! globals, so concurrent test harnesses do not interfere.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A single failpoint carrying options of type `T`.
#[derive(Debug, Default)]
pub struct FailPoint<T> {
    enabled: AtomicBool,
    options: Mutex<Option<T>>,
}

impl<T: Clone> FailPoint<T> {
    /// Arm the failpoint with `options`.
    pub fn enable(&self, options: T) {
        *self.options.lock() = Some(options);
        self.enabled.store(true, Ordering::Release);
    }

    /// Disarm the failpoint.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        *self.options.lock() = None;
    }

    /// Whether the failpoint is armed.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// The armed options, or `None` when disarmed.
    pub fn options_if_enabled(&self) -> Option<T> {
        if !self.is_enabled() {
            return None;
        }
        self.options.lock().clone()
    }

    /// Spin until the failpoint is disarmed. The caller must not hold
    /// locks that the disarming thread needs.
    pub fn pause_while_set(&self) {
        while self.is_enabled() {
            std::thread::yield_now();
        }
    }
}

/// Options for the `on_primary_transactional_write` failpoint, which
/// simulates partial failure after a retryable write.
#[derive(Debug, Clone)]
pub struct OnPrimaryTransactionalWriteOptions {
    /// Close the connection the write was executed on.
    pub close_connection: bool,
    /// If set, fail the write with this error code before it commits.
    pub fail_before_commit_exception_code: Option<i32>,
}

impl Default for OnPrimaryTransactionalWriteOptions {
    fn default() -> Self {
        OnPrimaryTransactionalWriteOptions {
            close_connection: true,
            fail_before_commit_exception_code: None,
        }
    }
}

/// The failpoints the session layer consults.
#[derive(Debug, Default)]
pub struct Failpoints {
    /// Fires after a retryable write registers its post-commit hook.
    pub on_primary_transactional_write: FailPoint<OnPrimaryTransactionalWriteOptions>,
    /// Pauses an operation right after it preallocates its snapshot.
    pub hang_after_preallocate_snapshot: FailPoint<()>,
}
