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

//! Environment handle
//!
//! Ties the thread table to the host collaborators (identity source,
//! liveness oracle, lock manager, buffer pool, failure check hooks) and
//! carries the configuration every operation consults.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{error, info, warn};

use crate::buffer::BufferPool;
use crate::config::EnvConfig;
use crate::error::{ConfigErrorKind, EnvError, EnvResult};
use crate::failchk::{FailchkContext, FailchkReport, FailchkStage, FailchkSubsystem, FailureScanner};
use crate::identity::{OsThreadIds, ThreadIdSource, ThreadIdentity};
use crate::liveness::LivenessOracle;
use crate::lock::LockManager;
use crate::thread_table::{ThreadControlBlock, ThreadControlTable, ThreadState};

/// Builder for [`Environment`]
pub struct EnvBuilder {
    config: EnvConfig,
    oracle: Option<Arc<dyn LivenessOracle>>,
    thread_ids: Option<Arc<dyn ThreadIdSource>>,
    lock_manager: Option<Arc<dyn LockManager>>,
    buffer_pool: Option<Arc<dyn BufferPool>>,
    hooks: Vec<(FailchkStage, Arc<dyn FailchkSubsystem>)>,
}

impl EnvBuilder {
    pub fn new(config: EnvConfig) -> Self {
        Self {
            config,
            oracle: None,
            thread_ids: None,
            lock_manager: None,
            buffer_pool: None,
            hooks: Vec::new(),
        }
    }

    /// Host `is_alive` callback; required for failure checking
    pub fn liveness(mut self, oracle: impl LivenessOracle + 'static) -> Self {
        self.oracle = Some(Arc::new(oracle));
        self
    }

    /// Host `thread_id` callback; defaults to [`OsThreadIds`]
    pub fn thread_ids(mut self, source: impl ThreadIdSource + 'static) -> Self {
        self.thread_ids = Some(Arc::new(source));
        self
    }

    pub fn lock_manager(mut self, manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = Some(manager);
        self
    }

    pub fn buffer_pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.buffer_pool = Some(pool);
        self
    }

    /// Run `hook` during `stage` of every failure check.
    pub fn failchk_hook(mut self, stage: FailchkStage, hook: Arc<dyn FailchkSubsystem>) -> Self {
        self.hooks.push((stage, hook));
        self
    }

    pub fn open(self) -> EnvResult<Arc<Environment>> {
        self.config.validate()?;
        if self.config.failchk && self.oracle.is_none() {
            return Err(EnvError::config(ConfigErrorKind::LivenessOracleMissing));
        }

        let threads = if self.config.tracks_threads() {
            Some(ThreadControlTable::new(
                self.config.effective_thread_max(),
                self.config.pin_max,
            )?)
        } else {
            None
        };

        info!(
            thread_max = self.config.effective_thread_max(),
            no_locking = self.config.no_locking,
            failchk = self.config.failchk,
            "opened environment"
        );

        let in_recovery = self.config.in_recovery;
        Ok(Arc::new(Environment {
            config: self.config,
            threads,
            oracle: self.oracle,
            thread_ids: self.thread_ids.unwrap_or_else(|| Arc::new(OsThreadIds)),
            lock_manager: self.lock_manager,
            buffer_pool: self.buffer_pool,
            hooks: self.hooks,
            in_recovery: AtomicBool::new(in_recovery),
            failchk_active: AtomicUsize::new(0),
            needs_recovery: AtomicBool::new(false),
        }))
    }
}

/// Shared environment handle
pub struct Environment {
    config: EnvConfig,
    threads: Option<ThreadControlTable>,
    oracle: Option<Arc<dyn LivenessOracle>>,
    thread_ids: Arc<dyn ThreadIdSource>,
    lock_manager: Option<Arc<dyn LockManager>>,
    buffer_pool: Option<Arc<dyn BufferPool>>,
    hooks: Vec<(FailchkStage, Arc<dyn FailchkSubsystem>)>,
    in_recovery: AtomicBool,
    /// Failure checks currently running
    failchk_active: AtomicUsize,
    /// Set by a fatal failure check
    needs_recovery: AtomicBool,
}

impl Environment {
    pub fn builder(config: EnvConfig) -> EnvBuilder {
        EnvBuilder::new(config)
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn thread_table(&self) -> Option<&ThreadControlTable> {
        self.threads.as_ref()
    }

    pub fn lock_manager(&self) -> Option<&Arc<dyn LockManager>> {
        self.lock_manager.as_ref()
    }

    pub fn buffer_pool(&self) -> Option<&Arc<dyn BufferPool>> {
        self.buffer_pool.as_ref()
    }

    /// Identity of the calling thread
    pub fn current_thread(&self) -> ThreadIdentity {
        self.thread_ids.thread_id()
    }

    /// Table tracking is in effect
    fn tracked(&self) -> Option<&ThreadControlTable> {
        if self.config.no_locking {
            return None;
        }
        self.threads.as_ref()
    }

    /// Record `state` for the calling thread.
    ///
    /// Returns `None` in no-locking mode or without a thread table.
    pub fn set_state(&self, state: ThreadState) -> EnvResult<Option<&ThreadControlBlock>> {
        self.set_state_for(&self.current_thread(), state)
    }

    /// Record `state` for an explicit identity
    pub fn set_state_for(
        &self,
        id: &ThreadIdentity,
        state: ThreadState,
    ) -> EnvResult<Option<&ThreadControlBlock>> {
        let Some(table) = self.tracked() else {
            return Ok(None);
        };
        table.set_state(id, state, self.oracle.as_deref()).map(Some)
    }

    /// Look up the calling thread's block without changing it.
    pub fn verify_state(&self) -> EnvResult<Option<&ThreadControlBlock>> {
        self.verify_state_for(&self.current_thread())
    }

    pub fn verify_state_for(&self, id: &ThreadIdentity) -> EnvResult<Option<&ThreadControlBlock>> {
        let Some(table) = self.tracked() else {
            return Ok(None);
        };
        table.verify(id).map(Some)
    }

    /// The calling thread's block, if it is registered
    pub fn current_block(&self) -> Option<&ThreadControlBlock> {
        self.tracked()?.find(&self.current_thread())
    }

    pub fn thread_block(&self, slot: u32) -> Option<&ThreadControlBlock> {
        self.threads.as_ref()?.block(slot)
    }

    /// Mark the calling thread as inside the library until the guard drops.
    ///
    /// Guards do not nest: dropping any guard records the thread as OUT.
    pub fn enter(&self) -> EnvResult<ApiGuard<'_>> {
        if self.needs_recovery() {
            return Err(EnvError::RunRecovery);
        }
        let block = self.set_state(ThreadState::Active)?;
        Ok(ApiGuard { block })
    }

    /// Record the calling thread as BLOCKED until the guard drops.
    pub fn block_while(&self) -> BlockedGuard<'_> {
        BlockedGuard::new(self.current_block())
    }

    pub fn in_recovery(&self) -> bool {
        self.in_recovery.load(Ordering::Acquire)
    }

    pub fn set_in_recovery(&self, in_recovery: bool) {
        self.in_recovery.store(in_recovery, Ordering::Release);
    }

    /// A failure check found a thread that died in the library
    pub fn needs_recovery(&self) -> bool {
        self.needs_recovery.load(Ordering::Acquire)
    }

    /// Acknowledge recovery after a fatal failure check
    pub fn clear_recovery_required(&self) {
        if self.needs_recovery.swap(false, Ordering::AcqRel) {
            info!("recovery acknowledged, environment usable again");
        }
    }

    pub fn failchk_in_progress(&self) -> bool {
        self.failchk_active.load(Ordering::Acquire) > 0
    }

    /// Check for threads that died while attached to the environment.
    ///
    /// Dead blocked threads have their pins released and their slots freed.
    /// A thread that died while active fails the check with `ThreadDied` and
    /// marks the environment as needing recovery.
    pub fn failchk(&self) -> EnvResult<FailchkReport> {
        let table = self
            .threads
            .as_ref()
            .ok_or_else(|| EnvError::config(ConfigErrorKind::ThreadTableMissing))?;
        let oracle = self
            .oracle
            .as_deref()
            .ok_or_else(|| EnvError::config(ConfigErrorKind::LivenessOracleMissing))?;

        let _active = FailchkGuard::new(&self.failchk_active);
        info!(threads = table.thread_count(), "failure check started");

        let result = self.run_failchk(table, oracle);
        match &result {
            Ok(report) => info!(
                scanned = report.scanned,
                blocked_dead = report.blocked_dead,
                out_reclaimed = report.out_reclaimed,
                unpinned = report.unpinned_pages,
                cleared = report.cleared,
                "failure check complete"
            ),
            Err(e) if e.is_fatal() => {
                self.needs_recovery.store(true, Ordering::Release);
                error!(error = %e, "failure check found a fatal condition, recovery required");
            }
            Err(e) => warn!(error = %e, "failure check failed"),
        }
        result
    }

    fn run_failchk(
        &self,
        table: &ThreadControlTable,
        oracle: &dyn LivenessOracle,
    ) -> EnvResult<FailchkReport> {
        let scanner = FailureScanner::new(table, oracle);
        let ctx = FailchkContext::new(table, oracle);
        let mut report = FailchkReport::default();

        {
            // No slot is reclaimed while its state is being judged.
            let _region = table.region_lock();
            let detected = scanner.detect()?;
            report.scanned = detected.scanned;
            report.blocked_dead = detected.blocked_dead.len();
            report.out_reclaimed = detected.out_reclaimed;
            report.unpinned_pages =
                scanner.unpin_dead(&detected.blocked_dead, self.buffer_pool.as_deref())?;
        }
        self.run_hooks(FailchkStage::ThreadScan, &ctx, &mut report)?;

        if let Some(manager) = &self.lock_manager {
            manager.failchk(&ctx)?;
        }
        self.run_hooks(FailchkStage::Lock, &ctx, &mut report)?;

        self.run_hooks(FailchkStage::Transaction, &ctx, &mut report)?;
        self.run_hooks(FailchkStage::Registration, &ctx, &mut report)?;
        self.run_hooks(FailchkStage::Replication, &ctx, &mut report)?;

        {
            let _region = table.region_lock();
            report.cleared = scanner.clear_dead();
        }
        self.run_hooks(FailchkStage::StateClear, &ctx, &mut report)?;

        self.run_hooks(FailchkStage::Mutex, &ctx, &mut report)?;
        Ok(report)
    }

    fn run_hooks(
        &self,
        stage: FailchkStage,
        ctx: &FailchkContext<'_>,
        report: &mut FailchkReport,
    ) -> EnvResult<()> {
        for (_, hook) in self.hooks.iter().filter(|(s, _)| *s == stage) {
            if let Err(e) = hook.failchk(ctx) {
                warn!(%stage, hook = hook.name(), error = %e, "failure check stage failed");
                return Err(e);
            }
        }
        report.stages_run.push(stage);
        Ok(())
    }
}

/// Decrements the in-progress count on every exit path
struct FailchkGuard<'a>(&'a AtomicUsize);

impl<'a> FailchkGuard<'a> {
    fn new(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(active)
    }
}

impl Drop for FailchkGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Calling thread is inside the library; records OUT on drop.
#[must_use = "the thread is recorded as OUT as soon as the guard is dropped"]
pub struct ApiGuard<'a> {
    block: Option<&'a ThreadControlBlock>,
}

impl<'a> ApiGuard<'a> {
    /// The thread's block, `None` when threads are not tracked
    pub fn block(&self) -> Option<&'a ThreadControlBlock> {
        self.block
    }

    /// Record BLOCKED while waiting; ACTIVE is restored on drop.
    pub fn blocked(&self) -> BlockedGuard<'a> {
        BlockedGuard::new(self.block)
    }
}

impl Drop for ApiGuard<'_> {
    fn drop(&mut self) {
        if let Some(block) = self.block {
            block.store_state(ThreadState::Out);
        }
    }
}

/// Thread is waiting on a resource; restores the prior state on drop.
#[must_use = "the blocked state ends as soon as the guard is dropped"]
pub struct BlockedGuard<'a> {
    block: Option<&'a ThreadControlBlock>,
    restore: ThreadState,
}

impl<'a> BlockedGuard<'a> {
    fn new(block: Option<&'a ThreadControlBlock>) -> Self {
        // Only an ACTIVE thread blocks; anything else is left alone.
        match block {
            Some(b) if b.transition(ThreadState::Active, ThreadState::Blocked) => Self {
                block: Some(b),
                restore: ThreadState::Active,
            },
            _ => Self {
                block: None,
                restore: ThreadState::Active,
            },
        }
    }
}

impl Drop for BlockedGuard<'_> {
    fn drop(&mut self) {
        if let Some(block) = self.block {
            block.transition(ThreadState::Blocked, self.restore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::AliveFlags;

    fn fixed(pid: u32, tid: u64) -> impl Fn() -> ThreadIdentity + Send + Sync {
        move || ThreadIdentity::from_raw(pid, tid)
    }

    #[test]
    fn test_failchk_requires_oracle() {
        let err = Environment::builder(EnvConfig::with_thread_count(4).failchk(true))
            .open()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            EnvError::Config {
                kind: ConfigErrorKind::LivenessOracleMissing
            }
        ));
    }

    #[test]
    fn test_no_locking_returns_no_block() {
        let env = Environment::builder(EnvConfig::with_thread_count(4).no_locking(true))
            .open()
            .unwrap();
        assert!(env.set_state(ThreadState::Active).unwrap().is_none());
        assert!(env.verify_state().unwrap().is_none());
        assert_eq!(env.thread_table().unwrap().thread_count(), 0);
    }

    #[test]
    fn test_untracked_environment() {
        let env = Environment::builder(EnvConfig::default()).open().unwrap();
        assert!(env.set_state(ThreadState::Active).unwrap().is_none());
        let err = env.failchk().unwrap_err();
        assert!(matches!(
            err,
            EnvError::Config {
                kind: ConfigErrorKind::ThreadTableMissing
            }
        ));
    }

    #[test]
    fn test_enter_and_leave() {
        let env = Environment::builder(EnvConfig::with_thread_count(4))
            .thread_ids(fixed(10, 1))
            .open()
            .unwrap();

        {
            let guard = env.enter().unwrap();
            let block = guard.block().unwrap();
            assert_eq!(block.state(), ThreadState::Active);
            assert!(env.verify_state().is_ok());

            {
                let _waiting = guard.blocked();
                assert_eq!(block.state(), ThreadState::Blocked);
            }
            assert_eq!(block.state(), ThreadState::Active);
        }

        assert_eq!(
            env.current_block().unwrap().state(),
            ThreadState::Out
        );
        assert!(env.verify_state().is_err());
    }

    #[test]
    fn test_failchk_without_oracle() {
        let env = Environment::builder(EnvConfig::with_thread_count(4))
            .open()
            .unwrap();
        assert!(matches!(
            env.failchk(),
            Err(EnvError::Config {
                kind: ConfigErrorKind::LivenessOracleMissing
            })
        ));
        assert!(!env.failchk_in_progress());
    }

    #[test]
    fn test_fatal_failchk_latches_recovery() {
        let env = Environment::builder(EnvConfig::with_thread_count(4).failchk(true))
            .thread_ids(fixed(1, 1))
            .liveness(|who: &ThreadIdentity, _: AliveFlags| who.pid != 66)
            .open()
            .unwrap();
        env.set_state_for(&ThreadIdentity::from_raw(66, 1), ThreadState::Active)
            .unwrap();

        assert!(env.failchk().unwrap_err().is_fatal());
        assert!(env.needs_recovery());
        assert!(!env.failchk_in_progress());
        assert!(matches!(env.enter(), Err(EnvError::RunRecovery)));

        env.clear_recovery_required();
        assert!(env.enter().is_ok());
    }

    #[test]
    fn test_recovery_flag() {
        let env = Environment::builder(EnvConfig::default().in_recovery(true))
            .open()
            .unwrap();
        assert!(env.in_recovery());
        env.set_in_recovery(false);
        assert!(!env.in_recovery());
    }
}
