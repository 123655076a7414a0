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

//! Meta page access
//!
//! Every access method keeps its root and bookkeeping on one meta page that
//! all cursors share. A [`MetaCursor`] holds that page pinned under a lock:
//!
//! ```text
//! UNLOCKED ──acquire_for_read──▶ READ ──dirty_for_write──▶ WRITE
//!     ▲                           │                          │
//!     └────────────release────────┴──────────────────────────┘
//! ```
//!
//! The lock only ever moves up while the page is held, and release always
//! unpins before it unlocks. The pin is returned through the thread block
//! that recorded it, so a cursor may be released on another thread.
//!
//! ## Stale handles
//!
//! A subdatabase's meta page can move when the file is reorganized. The
//! file revision then differs from the one the handle cached, and the old
//! page no longer has the meta type. Outside recovery the cursor drops the
//! page and lock, reopens the handle and tries again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::buffer::{BufferPool, FetchFlags, PageHandle, PageId, PageType};
use crate::coupler::LockCoupler;
use crate::env::Environment;
use crate::error::{ConfigErrorKind, EnvError, EnvResult};
use crate::lock::{LockHandle, LockMode, LockOptions, LockerId};
use crate::identity::ThreadIdentity;

/// Where a database's meta page lives, as of a file revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaLocation {
    pub meta_page: PageId,
    pub revision: u64,
}

/// Reopens a subdatabase handle whose meta page went stale
pub trait MetaReopen: Send + Sync {
    fn reopen(&self, database: &str) -> EnvResult<MetaLocation>;
}

impl<F> MetaReopen for F
where
    F: Fn(&str) -> EnvResult<MetaLocation> + Send + Sync,
{
    fn reopen(&self, database: &str) -> EnvResult<MetaLocation> {
        self(database)
    }
}

/// Access-method handle as seen by meta page cursors
pub struct MetaDatabase {
    name: String,
    location: RwLock<MetaLocation>,
    expected: PageType,
    /// Present for subdatabases, whose meta page can move
    reopener: Option<Arc<dyn MetaReopen>>,
    reopens: AtomicU64,
}

impl MetaDatabase {
    pub fn new(name: impl Into<String>, meta_page: PageId, revision: u64, expected: PageType) -> Self {
        Self {
            name: name.into(),
            location: RwLock::new(MetaLocation {
                meta_page,
                revision,
            }),
            expected,
            reopener: None,
            reopens: AtomicU64::new(0),
        }
    }

    /// Mark the database as a subdatabase reopened through `reopener`
    pub fn with_reopen(mut self, reopener: impl MetaReopen + 'static) -> Self {
        self.reopener = Some(Arc::new(reopener));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> MetaLocation {
        *self.location.read()
    }

    pub fn meta_page(&self) -> PageId {
        self.location.read().meta_page
    }

    pub fn revision(&self) -> u64 {
        self.location.read().revision
    }

    pub fn expected_type(&self) -> PageType {
        self.expected
    }

    /// Times the handle was reopened after finding a stale meta page
    pub fn reopen_count(&self) -> u64 {
        self.reopens.load(Ordering::Relaxed)
    }

    fn is_stale(&self, page: &PageHandle, cached: &MetaLocation, env: &Environment) -> bool {
        self.reopener.is_some()
            && page.revision() != cached.revision
            && page.page_type() != self.expected
            && !env.in_recovery()
    }

    fn reopen(&self) -> EnvResult<()> {
        let Some(reopener) = &self.reopener else {
            return Ok(());
        };
        let location = reopener.reopen(&self.name).map_err(|e| EnvError::Reopen {
            database: self.name.clone(),
            reason: e.to_string(),
        })?;
        *self.location.write() = location;
        self.reopens.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// One cursor's hold on a database's meta page
pub struct MetaCursor {
    env: Arc<Environment>,
    db: Arc<MetaDatabase>,
    locker: LockerId,
    in_txn: bool,
    page: Option<PageHandle>,
    /// Thread block holding the pin record for `page`
    pinned_by: Option<(u32, ThreadIdentity)>,
    lock: LockHandle,
}

impl MetaCursor {
    pub fn new(env: Arc<Environment>, db: Arc<MetaDatabase>, locker: LockerId) -> Self {
        Self {
            env,
            db,
            locker,
            in_txn: false,
            page: None,
            pinned_by: None,
            lock: LockHandle::none(),
        }
    }

    /// Locks are held on behalf of an open transaction
    pub fn with_txn(mut self) -> Self {
        self.in_txn = true;
        self
    }

    pub fn page(&self) -> Option<&PageHandle> {
        self.page.as_ref()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock.mode()
    }

    pub fn is_pinned(&self) -> bool {
        self.page.is_some()
    }

    fn pool(env: &Environment) -> EnvResult<Arc<dyn BufferPool>> {
        env.buffer_pool()
            .cloned()
            .ok_or_else(|| EnvError::config(ConfigErrorKind::BufferPoolMissing))
    }

    fn fetch(
        &mut self,
        env: &Environment,
        pool: &dyn BufferPool,
        page: PageId,
        flags: FetchFlags,
    ) -> EnvResult<PageHandle> {
        let owner = env.current_block();
        let handle = pool.fetch_page(owner, page, flags)?;
        self.pinned_by = owner.map(|block| (block.slot(), block.identity()));
        Ok(handle)
    }

    fn unpin(&mut self, env: &Environment, pool: &dyn BufferPool, page: PageHandle) -> EnvResult<()> {
        // A slot emptied by failure checking may since belong to someone else.
        let owner = self
            .pinned_by
            .take()
            .and_then(|(slot, who)| env.thread_block(slot).filter(|block| block.identity() == who));
        pool.release_page(owner, page)
    }

    /// `None` in no-locking mode
    fn coupler<'e>(env: &'e Environment, locker: LockerId, in_txn: bool) -> EnvResult<Option<LockCoupler<'e>>> {
        if env.config().no_locking {
            return Ok(None);
        }
        let manager = env
            .lock_manager()
            .ok_or_else(|| EnvError::config(ConfigErrorKind::LockManagerMissing))?;
        Ok(Some(LockCoupler::new(manager.as_ref(), locker).in_txn(in_txn)))
    }

    /// Read-lock and pin the meta page.
    ///
    /// Stale subdatabase handles are reopened and the read retried until the
    /// page is consistent. Already holding the page is a no-op.
    pub fn acquire_for_read(&mut self) -> EnvResult<&PageHandle> {
        if self.page.is_some() {
            return self.page.as_ref().ok_or_else(|| EnvError::Internal("meta page vanished".into()));
        }

        let env = Arc::clone(&self.env);
        let pool = Self::pool(&env)?;
        let coupler = Self::coupler(&env, self.locker, self.in_txn)?;

        let mut attempts = 0u64;
        loop {
            let cached = self.db.location();
            if let Some(coupler) = &coupler {
                coupler.coupled_acquire(&mut self.lock, cached.meta_page, LockMode::Read, LockOptions::WAIT)?;
            }
            let page = self.fetch(&env, pool.as_ref(), cached.meta_page, FetchFlags::NONE)?;

            if !self.db.is_stale(&page, &cached, &env) {
                return Ok(&*self.page.insert(page));
            }

            attempts += 1;
            debug!(
                database = self.db.name(),
                page = %cached.meta_page,
                revision = page.revision(),
                cached = cached.revision,
                attempts,
                "stale meta page, reopening handle"
            );
            let unpinned = self.unpin(&env, pool.as_ref(), page);
            let unlocked = match &coupler {
                Some(coupler) => coupler.put(&mut self.lock),
                None => Ok(()),
            };
            unpinned?;
            unlocked?;
            self.db.reopen()?;
        }
    }

    /// Upgrade to a WRITE lock and mark the page dirty.
    ///
    /// A NOWAIT upgrade is tried first. If it is refused the page is unpinned,
    /// the upgrade waits, and the page is fetched again dirty. Other lock
    /// errors are returned with the pin untouched.
    pub fn dirty_for_write(&mut self) -> EnvResult<()> {
        if self.page.is_none() {
            self.acquire_for_read()?;
        }

        let env = Arc::clone(&self.env);
        let pool = Self::pool(&env)?;
        let coupler = Self::coupler(&env, self.locker, self.in_txn)?;

        let Some(coupler) = coupler else {
            return self.mark_page_dirty(pool.as_ref());
        };
        if self.lock.mode() == LockMode::Write {
            return self.mark_page_dirty(pool.as_ref());
        }

        let resource = match &self.page {
            Some(page) => page.id(),
            None => self.db.meta_page(),
        };

        match coupler.coupled_acquire(&mut self.lock, resource, LockMode::Write, LockOptions::NOWAIT) {
            Ok(()) => self.mark_page_dirty(pool.as_ref()),
            Err(e) if e.is_retryable() => {
                debug!(
                    database = self.db.name(),
                    page = %resource,
                    error = %e,
                    "meta page write lock refused, waiting"
                );
                if let Some(page) = self.page.take() {
                    self.unpin(&env, pool.as_ref(), page)?;
                }
                {
                    let _waiting = env.block_while();
                    coupler.coupled_acquire(&mut self.lock, resource, LockMode::Write, LockOptions::WAIT)?;
                }
                let page = self.fetch(&env, pool.as_ref(), resource, FetchFlags::DIRTY)?;
                self.page = Some(page);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn mark_page_dirty(&mut self, pool: &dyn BufferPool) -> EnvResult<()> {
        match self.page.as_mut() {
            Some(page) if !page.is_dirty() => pool.mark_dirty(page),
            _ => Ok(()),
        }
    }

    /// Unpin the page, then release the lock.
    ///
    /// Every step runs; the first error is returned. Inside a transaction a
    /// WRITE lock stays with the transaction.
    pub fn release(&mut self) -> EnvResult<()> {
        let env = Arc::clone(&self.env);
        let mut first: Option<EnvError> = None;

        if let Some(page) = self.page.take() {
            let released = Self::pool(&env).and_then(|pool| self.unpin(&env, pool.as_ref(), page));
            if let Err(e) = released {
                first.get_or_insert(e);
            }
        }

        if self.lock.is_set() {
            let put = Self::coupler(&env, self.locker, self.in_txn).and_then(|coupler| match coupler {
                Some(coupler) => coupler.put_transactional(&mut self.lock),
                None => {
                    self.lock = LockHandle::none();
                    Ok(())
                }
            });
            if let Err(e) = put {
                self.lock = LockHandle::none();
                first.get_or_insert(e);
            }
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for MetaCursor {
    fn drop(&mut self) {
        if self.page.is_none() && !self.lock.is_set() {
            return;
        }
        warn!(
            database = self.db.name(),
            locker = self.locker,
            "meta cursor dropped while holding its page"
        );
        if let Err(e) = self.release() {
            warn!(database = self.db.name(), error = %e, "meta cursor cleanup failed");
        }
    }
}
