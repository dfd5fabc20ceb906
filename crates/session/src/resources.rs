//! Suspended transaction resources.
//!
//! Ownership of the locker, recovery unit, and write unit of work moves
//! between "attached to the current operation" and "parked in the
//! session's stash slot". [`TxnResources`] is that parked form: built
//! by capturing the resources off an operation context, re-attached
//! with [`TxnResources::release`], and torn down (aborting the write
//! unit of work) if dropped without release.

use std::sync::Arc;
use std::time::Duration;
use vellum_core::context::{
    OperationContext, ReadConcernArgs, RecoveryUnitState, ReleasedUnitOfWork,
};
use vellum_core::error::{fatal, Result};
use vellum_core::traits::{Locker, LockerClientState, LockerInfo, RecoveryUnit};

/// A suspended transaction's locker, recovery unit, write-unit-of-work
/// handle, and read concern.
pub struct TxnResources {
    released_wuow: Option<ReleasedUnitOfWork>,
    locker: Option<Box<dyn Locker>>,
    recovery_unit: Option<Box<dyn RecoveryUnit>>,
    read_concern: ReadConcernArgs,
    released: bool,
}

impl TxnResources {
    /// Capture the transaction resources off `op_ctx`, leaving it with
    /// fresh ones. The caller must hold the client lock.
    pub fn stash(op_ctx: &mut OperationContext) -> Self {
        let released_wuow = op_ctx.release_txn_write_unit_of_work();

        let service = Arc::clone(op_ctx.service());
        let fresh_locker = service.storage_engine().new_locker();
        let mut locker = op_ctx.swap_locker(fresh_locker);
        locker.release_ticket();
        locker.unset_thread_id();

        // This thread still respects the transaction lock timeout: it
        // can block on locks the detached transaction holds.
        let max_lock_millis = service
            .parameters()
            .max_transaction_lock_request_timeout_millis();
        if max_lock_millis >= 0 {
            op_ctx
                .locker_mut()
                .set_max_lock_timeout(Duration::from_millis(max_lock_millis as u64));
        }

        let fresh_recovery_unit = service.storage_engine().new_recovery_unit();
        let recovery_unit =
            op_ctx.replace_recovery_unit(fresh_recovery_unit, RecoveryUnitState::NotInUnitOfWork);

        TxnResources {
            released_wuow: Some(released_wuow),
            locker: Some(locker),
            recovery_unit: Some(recovery_unit),
            read_concern: op_ctx.read_concern().clone(),
            released: false,
        }
    }

    /// Report of the stashed locker's held locks, for
    /// inactive-transaction output.
    pub fn locker_info(&self) -> Option<LockerInfo> {
        self.locker.as_ref().and_then(|locker| locker.locker_info())
    }

    /// The read concern the transaction's first statement ran under.
    pub fn read_concern(&self) -> &ReadConcernArgs {
        &self.read_concern
    }

    /// Re-attach the resources to `op_ctx`.
    ///
    /// Ticket reacquisition happens first and may block; if it fails
    /// the resources are torn down by drop and the transaction cannot
    /// be resumed. The caller must hold the client lock.
    ///
    /// # Errors
    ///
    /// Ticket reacquisition failures.
    pub fn release(mut self, op_ctx: &mut OperationContext) -> Result<()> {
        let mut locker = match self.locker.take() {
            Some(locker) => locker,
            None => fatal(50780, "transaction resources released twice"),
        };
        if let Err(err) = locker.reacquire_ticket() {
            self.locker = Some(locker);
            return Err(err);
        }
        self.released = true;

        // The operation's placeholder locker must be idle; it is
        // discarded, not stashed.
        if op_ctx.locker().client_state() != LockerClientState::Inactive {
            fatal(50781, "operation locker is active during transaction resume");
        }
        let _placeholder = op_ctx.swap_locker(locker);
        op_ctx.locker_mut().rebind_to_current_thread();

        let recovery_unit = match self.recovery_unit.take() {
            Some(recovery_unit) => recovery_unit,
            None => fatal(50782, "transaction resources missing a recovery unit"),
        };
        let _fresh = op_ctx.replace_recovery_unit(recovery_unit, RecoveryUnitState::NotInUnitOfWork);

        let released_wuow = match self.released_wuow.take() {
            Some(released_wuow) => released_wuow,
            None => fatal(50783, "transaction resources missing a write unit of work"),
        };
        op_ctx.resume_txn_write_unit_of_work(released_wuow);

        op_ctx.set_read_concern(self.read_concern.clone());
        Ok(())
    }
}

impl Drop for TxnResources {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Reached when discarding a transaction that never resumed: the
        // stashed locker still carries the top-level write unit, and
        // the recovery unit still buffers the transaction's writes.
        if let (Some(locker), Some(recovery_unit)) =
            (self.locker.as_mut(), self.recovery_unit.as_mut())
        {
            locker.end_write_unit_of_work();
            recovery_unit.abort_unit_of_work();
        }
    }
}

impl std::fmt::Debug for TxnResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnResources")
            .field("released", &self.released)
            .field("read_concern", &self.read_concern)
            .finish_non_exhaustive()
    }
}

/// Scoped swap-out of the active transaction so an internal operation
/// may run outside the user's snapshot.
pub struct SideTransactionBlock;

impl SideTransactionBlock {
    /// Run `f` with any attached transaction swapped out of `op_ctx`,
    /// restoring it afterwards whether or not `f` succeeds.
    ///
    /// # Errors
    ///
    /// `f`'s error, or a restore failure when `f` succeeded.
    pub fn run<R>(
        op_ctx: &mut OperationContext,
        f: impl FnOnce(&mut OperationContext) -> Result<R>,
    ) -> Result<R> {
        let stashed = if op_ctx.has_txn_write_unit_of_work() {
            let client = Arc::clone(op_ctx.client());
            let _client_guard = client.lock();
            Some(TxnResources::stash(op_ctx))
        } else {
            None
        };

        let result = f(op_ctx);

        let restore_result = match stashed {
            Some(resources) => {
                let client = Arc::clone(op_ctx.client());
                let _client_guard = client.lock();
                resources.release(op_ctx)
            }
            None => Ok(()),
        };

        match (result, restore_result) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }
}
