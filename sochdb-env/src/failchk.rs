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

//! Failure checking
//!
//! Finds threads that died while attached to the environment and returns
//! what they held.
//!
//! ## Classification
//!
//! | recorded state | owner dead → |
//! |----------------|--------------|
//! | BLOCKED        | BLOCKED_DEAD, pins released, then NOT_IN_USE |
//! | OUT            | NOT_IN_USE |
//! | ACTIVE         | fatal: `ThreadDied` |
//!
//! A thread that died while active may have left locks or transactions
//! half-updated, so the whole check fails and nothing is reclassified.
//! States only move toward NOT_IN_USE; running the check again on a settled
//! table changes nothing.
//!
//! ## Stage order
//!
//! thread scan → lock → transaction → registration → replication →
//! state clear → mutex. The first failing stage ends the check.

use std::fmt;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::buffer::BufferPool;
use crate::error::{EnvError, EnvResult};
use crate::identity::ThreadIdentity;
use crate::liveness::{AliveFlags, LivenessOracle};
use crate::thread_table::{ThreadControlTable, ThreadState};

/// Failure check stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum FailchkStage {
    ThreadScan,
    Lock,
    Transaction,
    Registration,
    Replication,
    StateClear,
    Mutex,
}

impl FailchkStage {
    pub const ALL: [FailchkStage; 7] = [
        FailchkStage::ThreadScan,
        FailchkStage::Lock,
        FailchkStage::Transaction,
        FailchkStage::Registration,
        FailchkStage::Replication,
        FailchkStage::StateClear,
        FailchkStage::Mutex,
    ];
}

impl fmt::Display for FailchkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ThreadScan => "thread-scan",
            Self::Lock => "lock",
            Self::Transaction => "transaction",
            Self::Registration => "registration",
            Self::Replication => "replication",
            Self::StateClear => "state-clear",
            Self::Mutex => "mutex",
        };
        f.write_str(name)
    }
}

/// What a subsystem sees during failure checking
pub struct FailchkContext<'a> {
    table: &'a ThreadControlTable,
    oracle: &'a dyn LivenessOracle,
}

impl<'a> FailchkContext<'a> {
    pub fn new(table: &'a ThreadControlTable, oracle: &'a dyn LivenessOracle) -> Self {
        Self { table, oracle }
    }

    pub fn table(&self) -> &'a ThreadControlTable {
        self.table
    }

    pub fn is_alive(&self, id: &ThreadIdentity) -> bool {
        self.oracle.is_alive(id, AliveFlags::NONE)
    }

    pub fn is_process_alive(&self, id: &ThreadIdentity) -> bool {
        self.oracle.is_alive(id, AliveFlags::PROCESS_ONLY)
    }
}

/// Host subsystem taking part in failure checking
pub trait FailchkSubsystem: Send + Sync {
    fn name(&self) -> &str;

    fn failchk(&self, ctx: &FailchkContext<'_>) -> EnvResult<()>;
}

/// Outcome of a successful failure check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailchkReport {
    /// Blocks whose owner was checked
    pub scanned: usize,
    /// Blocks moved to (or found in) BLOCKED_DEAD
    pub blocked_dead: usize,
    /// OUT blocks of dead owners freed
    pub out_reclaimed: usize,
    pub unpinned_pages: usize,
    /// BLOCKED_DEAD blocks downgraded to NOT_IN_USE
    pub cleared: usize,
    pub stages_run: Vec<FailchkStage>,
}

/// Result of the detect pass
#[derive(Debug, Default)]
pub struct Detected {
    pub scanned: usize,
    /// Slots needing their pins released
    pub blocked_dead: Vec<u32>,
    pub out_reclaimed: usize,
}

/// Walks the thread table reclassifying dead threads
pub struct FailureScanner<'a> {
    table: &'a ThreadControlTable,
    oracle: &'a dyn LivenessOracle,
}

impl<'a> FailureScanner<'a> {
    pub fn new(table: &'a ThreadControlTable, oracle: &'a dyn LivenessOracle) -> Self {
        Self { table, oracle }
    }

    /// Detect pass.
    ///
    /// Every dead owner is classified before any block changes, so a fatal
    /// finding leaves the table exactly as it was.
    pub fn detect(&self) -> EnvResult<Detected> {
        let over_limit = self.table.is_over_limit();
        let mut detected = Detected::default();
        let mut plan = Vec::new();

        for block in self.table.blocks() {
            let state = block.state();
            match state {
                ThreadState::NotInUse => continue,
                // Already reclaimable by set_state
                ThreadState::Out if over_limit => continue,
                _ => {}
            }

            detected.scanned += 1;
            let identity = block.identity();
            if self.oracle.is_alive(&identity, AliveFlags::NONE) {
                continue;
            }

            match state {
                ThreadState::Blocked | ThreadState::BlockedDead => {
                    plan.push((block, state, ThreadState::BlockedDead))
                }
                ThreadState::Out => plan.push((block, state, ThreadState::NotInUse)),
                _ => {
                    error!(
                        pid = identity.pid,
                        tid = %identity.tid,
                        slot = block.slot(),
                        ?state,
                        "thread died in library"
                    );
                    return Err(EnvError::ThreadDied {
                        pid: identity.pid,
                        tid: identity.tid,
                    });
                }
            }
        }

        for (block, from, to) in plan {
            if from != to && !block.transition(from, to) {
                debug!(slot = block.slot(), ?from, "thread state changed during scan, skipped");
                continue;
            }
            match to {
                ThreadState::BlockedDead => {
                    info!(slot = block.slot(), identity = %block.identity(), "blocked thread died");
                    detected.blocked_dead.push(block.slot());
                }
                _ => {
                    debug!(slot = block.slot(), identity = %block.identity(), "freed slot of exited thread");
                    detected.out_reclaimed += 1;
                }
            }
        }

        Ok(detected)
    }

    /// Unpin pass: release the pins of each flagged block once.
    pub fn unpin_dead(&self, slots: &[u32], pool: Option<&dyn BufferPool>) -> EnvResult<usize> {
        let mut unpinned = 0;
        for &slot in slots {
            let Some(block) = self.table.block(slot) else {
                continue;
            };
            if block.state() != ThreadState::BlockedDead {
                continue;
            }
            unpinned += match pool {
                Some(pool) => pool.unpin_thread(block)?,
                None => {
                    // No pool to return them to; drop the records.
                    let mut pins = block.pins();
                    let n = pins.len();
                    pins.clear();
                    n
                }
            };
        }
        Ok(unpinned)
    }

    /// Clear pass: BLOCKED_DEAD blocks without pins become NOT_IN_USE.
    pub fn clear_dead(&self) -> usize {
        self.table
            .blocks()
            .filter(|block| {
                block.state() == ThreadState::BlockedDead
                    && block.pin_count() == 0
                    && block.transition(ThreadState::BlockedDead, ThreadState::NotInUse)
            })
            .count()
    }
}
