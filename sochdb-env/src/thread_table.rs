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

//! Thread Control Table
//!
//! Registry of every thread attached to the environment, keyed by
//! (pid, thread key). Each attached thread owns one control block recording
//! whether it is inside the library, blocked, or out, plus the pages it has
//! pinned.
//!
//! ## Layout
//!
//! ```text
//! buckets: [ head ][ head ][ head ] ...      (thread_max / 8, at least 1)
//!             │
//!             ▼
//! blocks:  [ slot 5 ] ──next──▶ [ slot 2 ] ──next──▶ NIL
//!          arena of thread_max control blocks, linked by slot index
//! ```
//!
//! Links are slot indices, never addresses, so the table stays valid in a
//! region mapped at different addresses by different processes.
//!
//! ## Concurrency
//!
//! - Lookups walk a bucket without any lock. Blocks are never unlinked, only
//!   re-labelled, so a reader can always follow `next`.
//! - Allocation and slot reclamation run under the region mutex. A fresh
//!   block is fully initialised and its `next` set before the bucket head is
//!   published with a single release store.
//! - A block's identity is rewritten when a slot is reclaimed; readers see it
//!   through a sequence counter and retry a torn read.
//! - The state word is written only by the owning thread, or by failure
//!   checking on behalf of a thread confirmed dead.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering, fence};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ConfigErrorKind, EnvError, EnvResult};
use crate::identity::{ThreadIdentity, ThreadKey};
use crate::liveness::{AliveFlags, LivenessOracle};
use crate::pin::PinList;

/// End-of-list marker for slot links
const NIL: u32 = u32::MAX;

/// Recorded state of an attached thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ThreadState {
    /// Slot is free for reuse
    NotInUse = 0,
    /// Thread is inside the library
    Active = 1,
    /// Thread is inside the library, waiting on a resource
    Blocked = 2,
    /// Blocked thread found dead; its pins still need releasing
    BlockedDead = 3,
    /// Thread has left the library
    Out = 4,
}

impl ThreadState {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NotInUse),
            1 => Some(Self::Active),
            2 => Some(Self::Blocked),
            3 => Some(Self::BlockedDead),
            4 => Some(Self::Out),
            _ => None,
        }
    }

    /// States in which a block may be relabelled for another identity
    fn is_reclaimable(self) -> bool {
        matches!(self, Self::NotInUse | Self::Out)
    }
}

/// Per-thread control block
pub struct ThreadControlBlock {
    slot: u32,
    /// Odd while the identity is being rewritten
    seq: AtomicU32,
    pid: AtomicU32,
    tid: [AtomicU64; 2],
    state: AtomicU8,
    next: AtomicU32,
    pins: Mutex<PinList>,
}

impl ThreadControlBlock {
    fn new(slot: u32, pin_max: usize) -> Self {
        Self {
            slot,
            seq: AtomicU32::new(0),
            pid: AtomicU32::new(0),
            tid: [AtomicU64::new(0), AtomicU64::new(0)],
            state: AtomicU8::new(ThreadState::NotInUse as u8),
            next: AtomicU32::new(NIL),
            pins: Mutex::new(PinList::new(pin_max)),
        }
    }

    /// Arena slot of this block
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Identity currently recorded in the block
    pub fn identity(&self) -> ThreadIdentity {
        loop {
            let seq1 = self.seq.load(Ordering::Acquire);
            if seq1 & 1 == 0 {
                let pid = self.pid.load(Ordering::Relaxed);
                let lo = self.tid[0].load(Ordering::Relaxed);
                let hi = self.tid[1].load(Ordering::Relaxed);
                fence(Ordering::Acquire);
                if self.seq.load(Ordering::Relaxed) == seq1 {
                    return ThreadIdentity::new(pid, ThreadKey::from_words([lo, hi]));
                }
            }
            std::hint::spin_loop();
        }
    }

    pub fn state(&self) -> ThreadState {
        let raw = self.state.load(Ordering::Acquire);
        let state = ThreadState::from_u8(raw);
        debug_assert!(state.is_some(), "corrupt thread state {raw} in slot {}", self.slot);
        // An unreadable block is kept in use, never handed out again.
        state.unwrap_or(ThreadState::Active)
    }

    /// Pages currently pinned by this thread
    pub fn pin_count(&self) -> usize {
        self.pins.lock().len()
    }

    /// Pin list, for buffer pools recording and releasing pins
    pub fn pins(&self) -> MutexGuard<'_, PinList> {
        self.pins.lock()
    }

    pub(crate) fn store_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; fails if the state changed underneath.
    pub(crate) fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Relabel the block. Callers hold the region mutex.
    fn assign(&self, id: &ThreadIdentity, state: ThreadState) {
        let [lo, hi] = id.tid.to_words();
        self.seq.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        self.pid.store(id.pid, Ordering::Relaxed);
        self.tid[0].store(lo, Ordering::Relaxed);
        self.tid[1].store(hi, Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::Release);
        self.store_state(state);
    }
}

impl fmt::Debug for ThreadControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadControlBlock")
            .field("slot", &self.slot)
            .field("identity", &self.identity())
            .field("state", &self.state())
            .field("pins", &self.pin_count())
            .finish()
    }
}

/// Point-in-time view of one control block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSnapshot {
    pub slot: u32,
    pub identity: ThreadIdentity,
    pub state: ThreadState,
    pub pin_count: usize,
}

/// Thread table statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadTableStats {
    pub buckets: usize,
    pub thread_count: u32,
    pub thread_max: u32,
    pub not_in_use: u32,
    pub active: u32,
    pub blocked: u32,
    pub blocked_dead: u32,
    pub out: u32,
    /// Slots handed to a new identity since creation
    pub reclaimed: u64,
    pub pinned_pages: usize,
    pub longest_chain: usize,
}

/// Bucketed registry of thread control blocks
pub struct ThreadControlTable {
    buckets: Box<[AtomicU32]>,
    blocks: Box<[ThreadControlBlock]>,
    /// Blocks handed out from the arena
    thread_count: AtomicU32,
    thread_max: u32,
    /// Guards allocation and reclamation only
    region: Mutex<()>,
    reclaimed: AtomicU64,
}

impl ThreadControlTable {
    /// Create a table of `thread_max` slots
    pub fn new(thread_max: u32, pin_max: usize) -> EnvResult<Self> {
        if thread_max == 0 || thread_max == NIL {
            return Err(EnvError::config(ConfigErrorKind::InvalidThreadCount {
                thread_init: 0,
                thread_max,
            }));
        }
        if pin_max == 0 {
            return Err(EnvError::config(ConfigErrorKind::InvalidPinMax(pin_max)));
        }

        let nbuckets = (thread_max / 8).max(1) as usize;

        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(thread_max as usize)
            .map_err(|e| {
                EnvError::OutOfMemory(format!(
                    "thread table of {} control blocks: {}",
                    thread_max, e
                ))
            })?;
        blocks.extend((0..thread_max).map(|slot| ThreadControlBlock::new(slot, pin_max)));

        let mut buckets = Vec::new();
        buckets.try_reserve_exact(nbuckets).map_err(|e| {
            EnvError::OutOfMemory(format!("thread table of {} buckets: {}", nbuckets, e))
        })?;
        buckets.extend((0..nbuckets).map(|_| AtomicU32::new(NIL)));

        debug!(thread_max, buckets = nbuckets, "created thread table");

        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            blocks: blocks.into_boxed_slice(),
            thread_count: AtomicU32::new(0),
            thread_max,
            region: Mutex::new(()),
            reclaimed: AtomicU64::new(0),
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn thread_max(&self) -> u32 {
        self.thread_max
    }

    /// Blocks allocated from the arena (free or not)
    pub fn thread_count(&self) -> u32 {
        self.thread_count.load(Ordering::Acquire)
    }

    /// New identities must reclaim a slot rather than allocate one
    pub fn is_over_limit(&self) -> bool {
        self.thread_count() >= self.thread_max
    }

    #[inline]
    fn bucket_index(&self, id: &ThreadIdentity) -> usize {
        (id.bucket_hash() % self.buckets.len() as u64) as usize
    }

    fn bucket(&self, index: usize) -> BucketIter<'_> {
        BucketIter {
            blocks: &self.blocks,
            next: self.buckets[index].load(Ordering::Acquire),
        }
    }

    /// Lock-free lookup by identity
    pub fn find(&self, id: &ThreadIdentity) -> Option<&ThreadControlBlock> {
        self.bucket(self.bucket_index(id))
            .find(|block| block.identity() == *id)
    }

    /// Record `state` for `id`, registering the identity if it is new.
    ///
    /// A new identity gets a fresh block while the table is under its limit.
    /// At the limit it may take over a block in its own bucket that is
    /// NOT_IN_USE, or OUT with a dead owner according to `oracle`. Without a
    /// reclaimable block the call fails with `OutOfMemory`.
    ///
    /// Only a block in a non-reclaimable state is updated without the region
    /// mutex, with a compare-and-swap from the observed state. A NOT_IN_USE or
    /// OUT block can be relabelled under the mutex, so those go through it.
    pub fn set_state(
        &self,
        id: &ThreadIdentity,
        state: ThreadState,
        oracle: Option<&dyn LivenessOracle>,
    ) -> EnvResult<&ThreadControlBlock> {
        if let Some(block) = self.find(id) {
            let mut current = block.state.load(Ordering::Acquire);
            while ThreadState::from_u8(current).is_some_and(|s| !s.is_reclaimable()) {
                match block.state.compare_exchange_weak(
                    current,
                    state as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(block),
                    Err(actual) => current = actual,
                }
            }
        }

        let _region = self.region.lock();
        let index = self.bucket_index(id);

        // The same identity may have been registered while we waited.
        if let Some(block) = self.bucket(index).find(|block| block.identity() == *id) {
            block.store_state(state);
            return Ok(block);
        }

        let count = self.thread_count.load(Ordering::Acquire);
        if count >= self.thread_max {
            let reclaimable = self.bucket(index).find(|block| {
                let free = match block.state() {
                    ThreadState::NotInUse => true,
                    ThreadState::Out => oracle
                        .is_some_and(|o| !o.is_alive(&block.identity(), AliveFlags::NONE)),
                    _ => false,
                };
                free && block.pin_count() == 0
            });
            let Some(block) = reclaimable else {
                warn!(
                    thread_max = self.thread_max,
                    bucket = index,
                    %id,
                    "thread table full, no reclaimable slot"
                );
                return Err(EnvError::OutOfMemory(format!(
                    "thread table full: {} control blocks in use and none reclaimable for {}",
                    self.thread_max, id
                )));
            };

            let previous = block.identity();
            block.assign(id, state);
            self.reclaimed.fetch_add(1, Ordering::Relaxed);
            debug!(slot = block.slot, %previous, %id, "reclaimed thread slot");
            return Ok(block);
        }

        let block = &self.blocks[count as usize];
        block.assign(id, state);
        let head = &self.buckets[index];
        block.next.store(head.load(Ordering::Acquire), Ordering::Relaxed);
        // Publication point: the block is complete before readers can reach it.
        head.store(block.slot, Ordering::Release);
        self.thread_count.store(count + 1, Ordering::Release);

        debug!(slot = block.slot, bucket = index, %id, "allocated thread slot");
        Ok(block)
    }

    /// Return the block for `id` without changing it.
    ///
    /// Verifying an identity that is not registered, or that is OUT of the
    /// library, is an internal consistency violation.
    pub fn verify(&self, id: &ThreadIdentity) -> EnvResult<&ThreadControlBlock> {
        match self.find(id) {
            Some(block) if block.state() != ThreadState::Out => Ok(block),
            Some(block) => {
                warn!(slot = block.slot, %id, "verified thread is out of the library");
                Err(EnvError::InvalidArgument(format!(
                    "thread {} verified while out of the library",
                    id
                )))
            }
            None => Err(EnvError::InvalidArgument(format!(
                "thread {} is not registered",
                id
            ))),
        }
    }

    /// Block at `slot`, if it has been allocated
    pub fn block(&self, slot: u32) -> Option<&ThreadControlBlock> {
        (slot < self.thread_count()).then(|| &self.blocks[slot as usize])
    }

    /// Every allocated block in slot order
    pub fn blocks(&self) -> impl Iterator<Item = &ThreadControlBlock> {
        self.blocks[..self.thread_count() as usize].iter()
    }

    /// Hold off slot reclamation while scanning for dead threads
    pub(crate) fn region_lock(&self) -> MutexGuard<'_, ()> {
        self.region.lock()
    }

    pub fn snapshot(&self) -> Vec<ThreadSnapshot> {
        self.blocks()
            .map(|block| ThreadSnapshot {
                slot: block.slot,
                identity: block.identity(),
                state: block.state(),
                pin_count: block.pin_count(),
            })
            .collect()
    }

    pub fn stats(&self) -> ThreadTableStats {
        let mut stats = ThreadTableStats {
            buckets: self.buckets.len(),
            thread_count: self.thread_count(),
            thread_max: self.thread_max,
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for block in self.blocks() {
            match block.state() {
                ThreadState::NotInUse => stats.not_in_use += 1,
                ThreadState::Active => stats.active += 1,
                ThreadState::Blocked => stats.blocked += 1,
                ThreadState::BlockedDead => stats.blocked_dead += 1,
                ThreadState::Out => stats.out += 1,
            }
            stats.pinned_pages += block.pin_count();
        }
        stats.longest_chain = (0..self.buckets.len())
            .map(|index| self.bucket(index).count())
            .max()
            .unwrap_or(0);
        stats
    }
}

/// Lock-free walk of one bucket chain
struct BucketIter<'a> {
    blocks: &'a [ThreadControlBlock],
    next: u32,
}

impl<'a> Iterator for BucketIter<'a> {
    type Item = &'a ThreadControlBlock;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NIL {
            return None;
        }
        let block = &self.blocks[self.next as usize];
        self.next = block.next.load(Ordering::Acquire);
        Some(block)
    }
}
