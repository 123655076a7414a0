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

//! In-process page lock manager
//!
//! A single mutex-protected lock table with a condition variable for
//! waiters. Suited to one process; hosts sharing an environment across
//! processes supply their own [`LockManager`].
//!
//! ## Compatibility
//!
//! ```text
//!          READ  WRITE
//! READ      ✓     ✗
//! WRITE     ✗     ✗
//! ```
//!
//! Requests by a locker never conflict with its own grants, so a READ holder
//! can take WRITE on the same page once every other holder is gone.
//!
//! ## Deadlock detection
//!
//! A waiting locker records the request it is blocked on. Edges of the
//! waits-for graph are recomputed from the current grants at each check, so
//! a release takes effect before the waiter wakes. The request whose edge
//! closes a cycle fails with `Deadlock`; the other waiters keep waiting.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::buffer::PageId;
use crate::error::{EnvError, EnvResult, LockErrorKind};
use crate::failchk::FailchkContext;
use crate::identity::ThreadIdentity;
use crate::lock::{LockHandle, LockManager, LockMode, LockOptions, LockerId};

#[derive(Debug, Clone, Copy)]
struct Grant {
    id: u64,
    locker: LockerId,
    mode: LockMode,
}

#[derive(Default)]
struct LockTable {
    objects: HashMap<PageId, SmallVec<[Grant; 2]>>,
    /// Request each blocked locker is waiting on; edges of the waits-for
    /// graph are derived from the live grants, never cached.
    waiting: HashMap<LockerId, (PageId, LockMode)>,
    /// Thread each locker acts for, consulted by failure checking
    owners: HashMap<LockerId, ThreadIdentity>,
    next_grant: u64,
}

impl LockTable {
    /// Other lockers holding a mode that conflicts with `mode`
    fn blockers(&self, locker: LockerId, resource: PageId, mode: LockMode) -> HashSet<LockerId> {
        self.objects
            .get(&resource)
            .map(|grants| {
                grants
                    .iter()
                    .filter(|g| g.locker != locker && g.mode.conflicts(mode))
                    .map(|g| g.locker)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn grant(&mut self, locker: LockerId, resource: PageId, mode: LockMode) -> LockHandle {
        self.next_grant += 1;
        let id = self.next_grant;
        self.objects
            .entry(resource)
            .or_default()
            .push(Grant { id, locker, mode });
        LockHandle::new(id, resource, mode, locker)
    }

    /// Whether `locker` can reach itself through the waits-for graph
    fn closes_cycle(&self, locker: LockerId) -> bool {
        let mut stack: Vec<LockerId> = self.waits_on(locker).into_iter().collect();
        let mut seen = HashSet::new();
        while let Some(next) = stack.pop() {
            if next == locker {
                return true;
            }
            if !seen.insert(next) {
                continue;
            }
            stack.extend(self.waits_on(next));
        }
        false
    }

    /// Lockers currently standing between `locker` and its pending request
    fn waits_on(&self, locker: LockerId) -> HashSet<LockerId> {
        self.waiting
            .get(&locker)
            .map(|&(resource, mode)| self.blockers(locker, resource, mode))
            .unwrap_or_default()
    }

    fn remove_locker(&mut self, locker: LockerId) -> usize {
        let mut released = 0;
        self.objects.retain(|_, grants| {
            let before = grants.len();
            grants.retain(|g| g.locker != locker);
            released += before - grants.len();
            !grants.is_empty()
        });
        self.waiting.remove(&locker);
        released
    }
}

/// Lock manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    /// Pages with at least one grant
    pub objects: usize,
    pub grants_held: usize,
    pub requests: u64,
    pub granted: u64,
    pub waits: u64,
    pub not_granted: u64,
    pub deadlocks: u64,
    pub releases: u64,
}

#[derive(Default)]
struct LockCounters {
    requests: AtomicU64,
    granted: AtomicU64,
    waits: AtomicU64,
    not_granted: AtomicU64,
    deadlocks: AtomicU64,
    releases: AtomicU64,
}

/// In-process lock manager
#[derive(Default)]
pub struct LocalLockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    counters: LockCounters,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a locker with the thread it acts for
    pub fn register_locker(&self, locker: LockerId, owner: ThreadIdentity) {
        self.table.lock().owners.insert(locker, owner);
    }

    pub fn unregister_locker(&self, locker: LockerId) {
        self.table.lock().owners.remove(&locker);
    }

    /// Release every lock held by `locker`; returns the number released.
    pub fn release_locker(&self, locker: LockerId) -> usize {
        let released = self.table.lock().remove_locker(locker);
        if released > 0 {
            self.counters
                .releases
                .fetch_add(released as u64, Ordering::Relaxed);
            self.released.notify_all();
        }
        released
    }

    /// Locks currently held by `locker`
    pub fn held(&self, locker: LockerId) -> Vec<(PageId, LockMode)> {
        let table = self.table.lock();
        let mut held: Vec<_> = table
            .objects
            .iter()
            .flat_map(|(page, grants)| {
                grants
                    .iter()
                    .filter(move |g| g.locker == locker)
                    .map(move |g| (*page, g.mode))
            })
            .collect();
        held.sort();
        held
    }

    /// Holders of `resource`
    pub fn holders(&self, resource: PageId) -> Vec<(LockerId, LockMode)> {
        self.table
            .lock()
            .objects
            .get(&resource)
            .map(|grants| grants.iter().map(|g| (g.locker, g.mode)).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> LockStats {
        let table = self.table.lock();
        LockStats {
            objects: table.objects.len(),
            grants_held: table.objects.values().map(|g| g.len()).sum(),
            requests: self.counters.requests.load(Ordering::Relaxed),
            granted: self.counters.granted.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            not_granted: self.counters.not_granted.load(Ordering::Relaxed),
            deadlocks: self.counters.deadlocks.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
        }
    }
}

impl LockManager for LocalLockManager {
    fn acquire(
        &self,
        locker: LockerId,
        resource: PageId,
        mode: LockMode,
        opts: LockOptions,
    ) -> EnvResult<LockHandle> {
        if mode == LockMode::None {
            return Err(EnvError::Lock {
                kind: LockErrorKind::InvalidMode,
            });
        }
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let mut table = self.table.lock();
        loop {
            let blockers = table.blockers(locker, resource, mode);
            if blockers.is_empty() {
                table.waiting.remove(&locker);
                self.counters.granted.fetch_add(1, Ordering::Relaxed);
                return Ok(table.grant(locker, resource, mode));
            }

            if opts.nowait {
                table.waiting.remove(&locker);
                self.counters.not_granted.fetch_add(1, Ordering::Relaxed);
                return Err(EnvError::not_granted(resource));
            }

            table.waiting.insert(locker, (resource, mode));
            if table.closes_cycle(locker) {
                table.waiting.remove(&locker);
                self.counters.deadlocks.fetch_add(1, Ordering::Relaxed);
                warn!(locker, %resource, ?mode, "deadlock detected, rejecting request");
                return Err(EnvError::deadlock(resource));
            }

            self.counters.waits.fetch_add(1, Ordering::Relaxed);
            debug!(locker, %resource, ?mode, "waiting for lock");
            self.released.wait(&mut table);
        }
    }

    fn release(&self, handle: &LockHandle) -> EnvResult<()> {
        if !handle.is_set() {
            return Ok(());
        }

        let mut table = self.table.lock();
        let resource = handle.resource();
        let Some(grants) = table.objects.get_mut(&resource) else {
            return Err(EnvError::Lock {
                kind: LockErrorKind::NotHeld(handle.grant()),
            });
        };
        let Some(pos) = grants.iter().position(|g| g.id == handle.grant()) else {
            return Err(EnvError::Lock {
                kind: LockErrorKind::NotHeld(handle.grant()),
            });
        };
        grants.swap_remove(pos);
        if grants.is_empty() {
            table.objects.remove(&resource);
        }
        drop(table);

        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        self.released.notify_all();
        Ok(())
    }

    fn failchk(&self, ctx: &FailchkContext<'_>) -> EnvResult<()> {
        let owners: Vec<(LockerId, ThreadIdentity)> = self
            .table
            .lock()
            .owners
            .iter()
            .map(|(locker, owner)| (*locker, *owner))
            .collect();

        for (locker, owner) in owners {
            if ctx.is_alive(&owner) {
                continue;
            }
            let released = self.release_locker(locker);
            self.unregister_locker(locker);
            info!(locker, %owner, released, "released locks of dead locker");
        }
        Ok(())
    }
}
