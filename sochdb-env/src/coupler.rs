// SPDX-License-Identifier: AGPL-3.0-or-later
// SochDB - LLM-Optimized Embedded Database
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Lock coupling
//!
//! A cursor moving from one lock to the next acquires the new lock before
//! giving up the old one, so the resource it protects is never unlocked in
//! between. The swap happens inside one call: when [`LockCoupler::coupled_acquire`]
//! returns `Ok`, the handle names the new lock and the old one is gone.

use tracing::debug;

use crate::buffer::PageId;
use crate::error::EnvResult;
use crate::lock::{LockHandle, LockManager, LockMode, LockOptions, LockerId};

/// Couples lock acquisition and release for one locker
pub struct LockCoupler<'a> {
    manager: &'a dyn LockManager,
    locker: LockerId,
    in_txn: bool,
}

impl<'a> LockCoupler<'a> {
    pub fn new(manager: &'a dyn LockManager, locker: LockerId) -> Self {
        Self {
            manager,
            locker,
            in_txn: false,
        }
    }

    /// Locks are held on behalf of an open transaction
    pub fn in_txn(mut self, in_txn: bool) -> Self {
        self.in_txn = in_txn;
        self
    }

    pub fn locker(&self) -> LockerId {
        self.locker
    }

    /// WRITE locks taken inside a transaction stay with the transaction.
    fn retains(&self, handle: &LockHandle) -> bool {
        self.in_txn && handle.mode() == LockMode::Write
    }

    /// Acquire `resource` in `mode`, then release the lock `handle` held.
    ///
    /// On error `handle` is left untouched and still names the old lock.
    pub fn coupled_acquire(
        &self,
        handle: &mut LockHandle,
        resource: PageId,
        mode: LockMode,
        opts: LockOptions,
    ) -> EnvResult<()> {
        let granted = self.manager.acquire(self.locker, resource, mode, opts)?;
        let previous = std::mem::replace(handle, granted);

        if previous.is_set() && !self.retains(&previous) {
            self.manager.release(&previous)?;
        }
        debug!(
            locker = self.locker,
            %resource,
            ?mode,
            previous = ?previous.mode(),
            "coupled lock"
        );
        Ok(())
    }

    /// Release the lock unconditionally and reset the handle.
    pub fn put(&self, handle: &mut LockHandle) -> EnvResult<()> {
        let held = std::mem::take(handle);
        if held.is_set() {
            self.manager.release(&held)?;
        }
        Ok(())
    }

    /// Release the lock unless the transaction must keep it.
    ///
    /// The handle is reset either way.
    pub fn put_transactional(&self, handle: &mut LockHandle) -> EnvResult<()> {
        if self.retains(handle) {
            *handle = LockHandle::none();
            return Ok(());
        }
        self.put(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_manager::LocalLockManager;

    fn page(n: u64) -> PageId {
        PageId::new(7, n)
    }

    #[test]
    fn test_coupling_releases_previous() {
        let lm = LocalLockManager::new();
        let coupler = LockCoupler::new(&lm, 1);
        let mut handle = LockHandle::none();

        coupler
            .coupled_acquire(&mut handle, page(0), LockMode::Read, LockOptions::WAIT)
            .unwrap();
        coupler
            .coupled_acquire(&mut handle, page(1), LockMode::Read, LockOptions::WAIT)
            .unwrap();

        assert_eq!(handle.resource(), page(1));
        assert_eq!(lm.held(1), vec![(page(1), LockMode::Read)]);
    }

    #[test]
    fn test_upgrade_in_place() {
        let lm = LocalLockManager::new();
        let coupler = LockCoupler::new(&lm, 1);
        let mut handle = LockHandle::none();

        coupler
            .coupled_acquire(&mut handle, page(0), LockMode::Read, LockOptions::WAIT)
            .unwrap();
        coupler
            .coupled_acquire(&mut handle, page(0), LockMode::Write, LockOptions::NOWAIT)
            .unwrap();

        assert_eq!(handle.mode(), LockMode::Write);
        assert_eq!(lm.held(1), vec![(page(0), LockMode::Write)]);
    }

    #[test]
    fn test_failed_acquire_keeps_old_lock() {
        let lm = LocalLockManager::new();
        lm.acquire(2, page(1), LockMode::Write, LockOptions::WAIT)
            .unwrap();

        let coupler = LockCoupler::new(&lm, 1);
        let mut handle = LockHandle::none();
        coupler
            .coupled_acquire(&mut handle, page(0), LockMode::Read, LockOptions::WAIT)
            .unwrap();
        let before = handle;

        let err = coupler
            .coupled_acquire(&mut handle, page(1), LockMode::Read, LockOptions::NOWAIT)
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(handle, before);
        assert_eq!(lm.held(1), vec![(page(0), LockMode::Read)]);
    }

    #[test]
    fn test_transactional_put_keeps_write_locks() {
        let lm = LocalLockManager::new();
        let coupler = LockCoupler::new(&lm, 3).in_txn(true);

        let mut read = LockHandle::none();
        coupler
            .coupled_acquire(&mut read, page(0), LockMode::Read, LockOptions::WAIT)
            .unwrap();
        let mut write = LockHandle::none();
        coupler
            .coupled_acquire(&mut write, page(1), LockMode::Write, LockOptions::WAIT)
            .unwrap();

        coupler.put_transactional(&mut read).unwrap();
        coupler.put_transactional(&mut write).unwrap();

        assert!(!read.is_set());
        assert!(!write.is_set());
        assert_eq!(lm.held(3), vec![(page(1), LockMode::Write)]);

        // Transaction end
        assert_eq!(lm.release_locker(3), 1);
    }
}
