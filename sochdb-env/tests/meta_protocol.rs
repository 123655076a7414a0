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

//! Meta page read / dirty / release protocol and lock coupling.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sochdb_env::{
    AliveFlags, ConfigErrorKind, EnvConfig, EnvError, EnvResult, Environment, LocalLockManager, LockCoupler,
    LockHandle, LockManager, LockMode, LockOptions, LockerId, MemoryBufferPool, MetaCursor,
    MetaDatabase, MetaLocation, PageId, PageType, ThreadIdentity, ThreadState,
};

const FILE: u64 = 1;

fn meta_page() -> PageId {
    PageId::new(FILE, 0)
}

fn pool_with_meta() -> Arc<MemoryBufferPool> {
    let pool = Arc::new(MemoryBufferPool::new());
    pool.create_page(meta_page(), PageType::HashMeta).unwrap();
    pool
}

fn open(pool: &Arc<MemoryBufferPool>, locks: Arc<dyn LockManager>) -> Arc<Environment> {
    Environment::builder(EnvConfig::with_thread_count(16))
        .thread_ids(|| ThreadIdentity::from_raw(1, 1))
        .lock_manager(locks)
        .buffer_pool(pool.clone())
        .open()
        .unwrap()
}

fn hash_db() -> Arc<MetaDatabase> {
    Arc::new(MetaDatabase::new("hash", meta_page(), 0, PageType::HashMeta))
}

/// How the scripted lock manager answers NOWAIT requests
#[derive(Clone, Copy)]
enum Refusal {
    Deadlock,
    NotGranted,
    Broken,
}

/// Lock manager that refuses NOWAIT requests and records every call
struct ScriptedLocks {
    inner: LocalLockManager,
    refusal: Refusal,
    refusals_left: AtomicUsize,
    pool: Arc<MemoryBufferPool>,
    /// (mode, nowait, meta page pins at call time)
    calls: Mutex<Vec<(LockMode, bool, Option<u32>)>>,
}

impl ScriptedLocks {
    fn new(pool: Arc<MemoryBufferPool>, refusal: Refusal, refusals: usize) -> Self {
        Self {
            inner: LocalLockManager::new(),
            refusal,
            refusals_left: AtomicUsize::new(refusals),
            pool,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl LockManager for ScriptedLocks {
    fn acquire(
        &self,
        locker: LockerId,
        resource: PageId,
        mode: LockMode,
        opts: LockOptions,
    ) -> EnvResult<LockHandle> {
        self.calls
            .lock()
            .push((mode, opts.nowait, self.pool.pin_count(resource)));
        if opts.nowait
            && self
                .refusals_left
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(match self.refusal {
                Refusal::Deadlock => EnvError::deadlock(resource),
                Refusal::NotGranted => EnvError::not_granted(resource),
                Refusal::Broken => EnvError::Internal("lock region corrupt".into()),
            });
        }
        self.inner.acquire(locker, resource, mode, opts)
    }

    fn release(&self, handle: &LockHandle) -> EnvResult<()> {
        self.inner.release(handle)
    }
}

#[test]
fn test_read_then_release() {
    let pool = pool_with_meta();
    let locks = Arc::new(LocalLockManager::new());
    let env = open(&pool, locks.clone());

    let mut cursor = MetaCursor::new(env.clone(), hash_db(), 1);
    let page = cursor.acquire_for_read().unwrap();
    assert_eq!(page.id(), meta_page());
    assert_eq!(page.page_type(), PageType::HashMeta);
    assert_eq!(cursor.lock_mode(), LockMode::Read);
    assert_eq!(pool.pin_count(meta_page()), Some(1));

    // Second acquire keeps the same pin
    cursor.acquire_for_read().unwrap();
    assert_eq!(pool.pin_count(meta_page()), Some(1));

    cursor.release().unwrap();
    assert!(!cursor.is_pinned());
    assert_eq!(cursor.lock_mode(), LockMode::None);
    assert_eq!(pool.pin_count(meta_page()), Some(0));
    assert!(locks.held(1).is_empty());
}

#[test]
fn test_read_dirty_release_leaves_nothing_pinned() {
    let pool = pool_with_meta();
    let locks = Arc::new(LocalLockManager::new());
    let env = open(&pool, locks.clone());

    let mut cursor = MetaCursor::new(env.clone(), hash_db(), 1);
    cursor.acquire_for_read().unwrap();
    cursor.dirty_for_write().unwrap();

    assert_eq!(cursor.lock_mode(), LockMode::Write);
    assert_eq!(locks.held(1), vec![(meta_page(), LockMode::Write)]);
    let page = cursor.page().unwrap();
    assert!(page.is_dirty());
    page.data_mut().unwrap()[0] = 1;

    // Already WRITE: no further lock traffic
    let requests = locks.stats().requests;
    cursor.dirty_for_write().unwrap();
    assert_eq!(locks.stats().requests, requests);

    cursor.release().unwrap();
    assert_eq!(pool.pin_count(meta_page()), Some(0));
    assert_eq!(pool.is_dirty(meta_page()), Some(true));
    assert!(locks.held(1).is_empty());
}

#[test]
fn test_pins_recorded_for_registered_thread() {
    let pool = pool_with_meta();
    let env = open(&pool, Arc::new(LocalLockManager::new()));

    let guard = env.enter().unwrap();
    let mut cursor = MetaCursor::new(env.clone(), hash_db(), 1);
    cursor.acquire_for_read().unwrap();
    assert_eq!(guard.block().unwrap().pin_count(), 1);

    cursor.release().unwrap();
    assert_eq!(guard.block().unwrap().pin_count(), 0);
}

#[test]
fn test_stale_subdatabase_meta_reopened() {
    let pool = pool_with_meta();
    let locks = Arc::new(LocalLockManager::new());
    let env = open(&pool, locks.clone());

    let moved = PageId::new(FILE, 5);
    let db = Arc::new(
        MetaDatabase::new("sub", meta_page(), 0, PageType::HashMeta).with_reopen(
            move |name: &str| -> EnvResult<MetaLocation> {
                assert_eq!(name, "sub");
                Ok(MetaLocation {
                    meta_page: moved,
                    revision: 1,
                })
            },
        ),
    );

    // The file is reorganized: the old meta page is reused as a data page.
    pool.bump_revision(FILE);
    pool.retype_page(meta_page(), PageType::Hash).unwrap();
    pool.create_page(moved, PageType::HashMeta).unwrap();

    let mut cursor = MetaCursor::new(env.clone(), db.clone(), 1);
    let page = cursor.acquire_for_read().unwrap();
    assert_eq!(page.id(), moved);
    assert_eq!(page.page_type(), PageType::HashMeta);

    assert_eq!(db.reopen_count(), 1);
    assert_eq!(db.meta_page(), moved);
    assert_eq!(pool.pin_count(meta_page()), Some(0));
    assert_eq!(pool.pin_count(moved), Some(1));
    assert_eq!(locks.held(1), vec![(moved, LockMode::Read)]);

    cursor.release().unwrap();
    assert_eq!(pool.pin_count(moved), Some(0));
}

#[test]
fn test_no_reopen_during_recovery() {
    let pool = pool_with_meta();
    let env = open(&pool, Arc::new(LocalLockManager::new()));
    env.set_in_recovery(true);

    let db = Arc::new(
        MetaDatabase::new("sub", meta_page(), 0, PageType::HashMeta).with_reopen(
            |_: &str| -> EnvResult<MetaLocation> { panic!("reopen during recovery") },
        ),
    );
    pool.bump_revision(FILE);
    pool.retype_page(meta_page(), PageType::Hash).unwrap();

    let mut cursor = MetaCursor::new(env.clone(), db.clone(), 1);
    assert_eq!(cursor.acquire_for_read().unwrap().id(), meta_page());
    assert_eq!(db.reopen_count(), 0);
    cursor.release().unwrap();
}

#[test]
fn test_failed_reopen_surfaces() {
    let pool = pool_with_meta();
    let locks = Arc::new(LocalLockManager::new());
    let env = open(&pool, locks.clone());

    let db = Arc::new(
        MetaDatabase::new("sub", meta_page(), 0, PageType::HashMeta).with_reopen(
            |_: &str| -> EnvResult<MetaLocation> { Err(EnvError::Internal("dropped".into())) },
        ),
    );
    pool.bump_revision(FILE);
    pool.retype_page(meta_page(), PageType::Btree).unwrap();

    let mut cursor = MetaCursor::new(env.clone(), db, 1);
    let err = cursor.acquire_for_read().unwrap_err();
    assert!(matches!(err, EnvError::Reopen { ref database, .. } if database == "sub"));
    assert!(!cursor.is_pinned());
    assert_eq!(pool.pin_count(meta_page()), Some(0));
    assert!(locks.held(1).is_empty());
}

#[test]
fn test_dirty_after_deadlock_refetches_dirty() {
    let pool = pool_with_meta();
    let locks = Arc::new(ScriptedLocks::new(pool.clone(), Refusal::Deadlock, 1));
    let env = open(&pool, locks.clone());

    let mut cursor = MetaCursor::new(env.clone(), hash_db(), 1);
    cursor.acquire_for_read().unwrap();
    cursor.dirty_for_write().unwrap();

    let calls = locks.calls.lock().clone();
    assert_eq!(
        calls,
        vec![
            (LockMode::Read, false, Some(0)),
            (LockMode::Write, true, Some(1)),
            // The pin was given up before waiting
            (LockMode::Write, false, Some(0)),
        ]
    );

    assert_eq!(cursor.lock_mode(), LockMode::Write);
    assert!(cursor.page().unwrap().is_dirty());
    assert_eq!(pool.pin_count(meta_page()), Some(1));
    assert_eq!(pool.is_dirty(meta_page()), Some(true));
    assert_eq!(locks.inner.held(1), vec![(meta_page(), LockMode::Write)]);

    cursor.release().unwrap();
    assert_eq!(pool.pin_count(meta_page()), Some(0));
    assert!(locks.inner.held(1).is_empty());
}

#[test]
fn test_dirty_after_not_granted_takes_same_path() {
    let pool = pool_with_meta();
    let locks = Arc::new(ScriptedLocks::new(pool.clone(), Refusal::NotGranted, 1));
    let env = open(&pool, locks.clone());

    let mut cursor = MetaCursor::new(env.clone(), hash_db(), 1);
    cursor.acquire_for_read().unwrap();
    cursor.dirty_for_write().unwrap();
    assert_eq!(locks.calls.lock().len(), 3);
    assert_eq!(cursor.lock_mode(), LockMode::Write);

    cursor.release().unwrap();
    assert_eq!(pool.pin_count(meta_page()), Some(0));
}

#[test]
fn test_other_lock_errors_keep_the_pin() {
    let pool = pool_with_meta();
    let locks = Arc::new(ScriptedLocks::new(pool.clone(), Refusal::Broken, 1));
    let env = open(&pool, locks.clone());

    let mut cursor = MetaCursor::new(env.clone(), hash_db(), 1);
    cursor.acquire_for_read().unwrap();
    let err = cursor.dirty_for_write().unwrap_err();
    assert!(matches!(err, EnvError::Internal(_)));

    assert!(cursor.is_pinned());
    assert_eq!(cursor.lock_mode(), LockMode::Read);
    assert_eq!(pool.pin_count(meta_page()), Some(1));
    assert_eq!(locks.calls.lock().len(), 2);

    cursor.release().unwrap();
    assert_eq!(pool.pin_count(meta_page()), Some(0));
    assert!(locks.inner.held(1).is_empty());
}

#[test]
fn test_dirty_waits_for_other_reader() {
    let pool = pool_with_meta();
    let locks = Arc::new(LocalLockManager::new());
    let env = Environment::builder(EnvConfig::with_thread_count(16))
        .lock_manager(locks.clone())
        .buffer_pool(pool.clone())
        .open()
        .unwrap();

    let mut reader = MetaCursor::new(env.clone(), hash_db(), 2);
    reader.acquire_for_read().unwrap();

    std::thread::scope(|s| {
        let writer = s.spawn(|| {
            let _inside = env.enter().unwrap();
            let mut writer = MetaCursor::new(env.clone(), hash_db(), 1);
            writer.acquire_for_read().unwrap();
            writer.dirty_for_write().unwrap();
            let mode = writer.lock_mode();
            writer.release().unwrap();
            mode
        });

        while locks.stats().waits == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        // The writer dropped its pin before blocking
        assert_eq!(pool.pin_count(meta_page()), Some(1));
        reader.release().unwrap();

        assert_eq!(writer.join().unwrap(), LockMode::Write);
    });

    assert_eq!(pool.pin_count(meta_page()), Some(0));
    assert_eq!(locks.stats().grants_held, 0);
}

#[test]
fn test_transaction_keeps_write_lock() {
    let pool = pool_with_meta();
    let locks = Arc::new(LocalLockManager::new());
    let env = open(&pool, locks.clone());

    let mut cursor = MetaCursor::new(env.clone(), hash_db(), 3).with_txn();
    cursor.acquire_for_read().unwrap();
    cursor.dirty_for_write().unwrap();
    cursor.release().unwrap();

    assert_eq!(pool.pin_count(meta_page()), Some(0));
    assert_eq!(cursor.lock_mode(), LockMode::None);
    assert_eq!(locks.held(3), vec![(meta_page(), LockMode::Write)]);

    // Commit
    locks.release_locker(3);
    assert!(locks.held(3).is_empty());
}

#[test]
fn test_dropped_cursor_cleans_up() {
    let pool = pool_with_meta();
    let locks = Arc::new(LocalLockManager::new());
    let env = open(&pool, locks.clone());

    {
        let mut cursor = MetaCursor::new(env.clone(), hash_db(), 1);
        cursor.acquire_for_read().unwrap();
    }
    assert_eq!(pool.pin_count(meta_page()), Some(0));
    assert!(locks.held(1).is_empty());
}

#[test]
fn test_no_locking_mode() {
    let pool = pool_with_meta();
    let env = Environment::builder(EnvConfig::default().no_locking(true))
        .buffer_pool(pool.clone())
        .open()
        .unwrap();

    let mut cursor = MetaCursor::new(env.clone(), hash_db(), 1);
    cursor.acquire_for_read().unwrap();
    assert_eq!(cursor.lock_mode(), LockMode::None);
    cursor.dirty_for_write().unwrap();
    assert!(cursor.page().unwrap().is_dirty());
    cursor.release().unwrap();
    assert_eq!(pool.pin_count(meta_page()), Some(0));
}

#[test]
fn test_missing_collaborators() {
    let pool = pool_with_meta();
    let env = Environment::builder(EnvConfig::default())
        .buffer_pool(pool.clone())
        .open()
        .unwrap();
    let mut cursor = MetaCursor::new(env.clone(), hash_db(), 1);
    assert!(matches!(
        cursor.acquire_for_read(),
        Err(EnvError::Config {
            kind: ConfigErrorKind::LockManagerMissing
        })
    ));

    let env = Environment::builder(EnvConfig::default())
        .lock_manager(Arc::new(LocalLockManager::new()))
        .open()
        .unwrap();
    let mut cursor = MetaCursor::new(env.clone(), hash_db(), 1);
    assert!(matches!(
        cursor.acquire_for_read(),
        Err(EnvError::Config {
            kind: ConfigErrorKind::BufferPoolMissing
        })
    ));
}

#[test]
fn test_coupling_never_holds_two_locks() {
    let locks = LocalLockManager::new();
    let coupler = LockCoupler::new(&locks, 8);
    let mut handle = LockHandle::none();

    for n in 0..10 {
        let mode = if n % 3 == 0 {
            LockMode::Write
        } else {
            LockMode::Read
        };
        coupler
            .coupled_acquire(&mut handle, PageId::new(FILE, n), mode, LockOptions::WAIT)
            .unwrap();
        assert_eq!(locks.held(8), vec![(PageId::new(FILE, n), mode)]);
        assert_eq!(handle.resource(), PageId::new(FILE, n));
    }

    coupler.put(&mut handle).unwrap();
    assert!(!handle.is_set());
    assert!(locks.held(8).is_empty());
}

#[test]
fn test_cursor_released_on_another_thread() {
    let pool = pool_with_meta();
    let dead: Arc<Mutex<HashSet<ThreadIdentity>>> = Arc::default();
    let env = {
        let dead = Arc::clone(&dead);
        Environment::builder(EnvConfig::with_thread_count(16).failchk(true))
            .liveness(move |who: &ThreadIdentity, _: AliveFlags| !dead.lock().contains(who))
            .lock_manager(Arc::new(LocalLockManager::new()))
            .buffer_pool(pool.clone())
            .open()
            .unwrap()
    };
    let table = env.thread_table().unwrap();
    let pins_of = |who: ThreadIdentity| {
        table
            .snapshot()
            .into_iter()
            .find(|snap| snap.identity == who)
            .map(|snap| snap.pin_count)
    };

    // Pinned by one thread, handed back to this one
    let (worker, mut cursor) = std::thread::scope(|s| {
        s.spawn(|| {
            let _inside = env.enter().unwrap();
            let mut cursor = MetaCursor::new(env.clone(), hash_db(), 1);
            cursor.acquire_for_read().unwrap();
            (env.current_thread(), cursor)
        })
        .join()
        .unwrap()
    });
    assert_eq!(pins_of(worker), Some(1));

    let _inside = env.enter().unwrap();
    cursor.release().unwrap();
    assert_eq!(pool.pin_count(meta_page()), Some(0));
    assert_eq!(pins_of(worker), Some(0));

    let mut other = MetaCursor::new(env.clone(), hash_db(), 2);
    other.acquire_for_read().unwrap();
    assert_eq!(pool.pin_count(meta_page()), Some(1));

    // The worker dies while blocked; nothing it holds is left to unpin
    env.set_state_for(&worker, ThreadState::Blocked).unwrap();
    dead.lock().insert(worker);
    let report = env.failchk().unwrap();
    assert_eq!(report.blocked_dead, 1);
    assert_eq!(report.unpinned_pages, 0);
    assert_eq!(pool.pin_count(meta_page()), Some(1));

    other.release().unwrap();
    assert_eq!(pool.pin_count(meta_page()), Some(0));
}

#[test]
fn test_lock_handed_to_a_sleeping_waiter_is_not_a_deadlock() {
    let locks = Arc::new(LocalLockManager::new());
    let (p0, p1) = (PageId::new(FILE, 0), PageId::new(FILE, 1));

    for _ in 0..50 {
        let first = LockCoupler::new(locks.as_ref(), 1);
        let second = LockCoupler::new(locks.as_ref(), 2);
        let mut held_by_first = LockHandle::none();
        let mut held_by_second = LockHandle::none();
        first
            .coupled_acquire(&mut held_by_first, p1, LockMode::Write, LockOptions::WAIT)
            .unwrap();
        second
            .coupled_acquire(&mut held_by_second, p0, LockMode::Write, LockOptions::WAIT)
            .unwrap();

        let waits = locks.stats().waits;
        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let mut wanted = LockHandle::none();
                first.coupled_acquire(&mut wanted, p0, LockMode::Write, LockOptions::WAIT)?;
                first.put(&mut wanted)?;
                first.put(&mut held_by_first)
            });
            while locks.stats().waits == waits {
                std::thread::sleep(Duration::from_millis(1));
            }

            // p0 goes to the waiter; asking for p1 now only waits behind it
            second.put(&mut held_by_second).unwrap();
            second
                .coupled_acquire(&mut held_by_second, p1, LockMode::Write, LockOptions::WAIT)
                .unwrap();
            waiter.join().unwrap().unwrap();
        });
        second.put(&mut held_by_second).unwrap();
    }

    assert_eq!(locks.stats().deadlocks, 0);
    assert_eq!(locks.stats().grants_held, 0);
}
