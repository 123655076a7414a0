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

//! Environment configuration

use serde::{Deserialize, Serialize};

use crate::error::{ConfigErrorKind, EnvError, EnvResult};

/// Default number of pages one thread may keep pinned at once
pub const DEFAULT_PIN_MAX: usize = 16;

/// Environment configuration
///
/// Thread tracking is enabled when either `thread_init` or `thread_max` is
/// non-zero. The thread table is sized once, at creation, to
/// `max(thread_init, thread_max)` slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Control blocks expected at creation
    pub thread_init: u32,
    /// Soft limit on control blocks; beyond it new identities must reclaim
    pub thread_max: u32,
    /// Maximum pages a single thread may hold pinned
    pub pin_max: usize,
    /// Single-threaded mode: no thread tracking and no page locking
    pub no_locking: bool,
    /// Environment starts in crash recovery
    pub in_recovery: bool,
    /// Failure checking will be used (requires an is-alive callback)
    pub failchk: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            thread_init: 0,
            thread_max: 0,
            pin_max: DEFAULT_PIN_MAX,
            no_locking: false,
            in_recovery: false,
            failchk: false,
        }
    }
}

impl EnvConfig {
    /// Config with thread tracking for up to `thread_max` threads
    pub fn with_thread_count(thread_max: u32) -> Self {
        Self {
            thread_max,
            ..Default::default()
        }
    }

    pub fn thread_init(mut self, thread_init: u32) -> Self {
        self.thread_init = thread_init;
        self
    }

    pub fn thread_max(mut self, thread_max: u32) -> Self {
        self.thread_max = thread_max;
        self
    }

    pub fn pin_max(mut self, pin_max: usize) -> Self {
        self.pin_max = pin_max;
        self
    }

    pub fn no_locking(mut self, no_locking: bool) -> Self {
        self.no_locking = no_locking;
        self
    }

    pub fn in_recovery(mut self, in_recovery: bool) -> Self {
        self.in_recovery = in_recovery;
        self
    }

    pub fn failchk(mut self, failchk: bool) -> Self {
        self.failchk = failchk;
        self
    }

    /// Whether a thread table is created
    pub fn tracks_threads(&self) -> bool {
        self.thread_init > 0 || self.thread_max > 0
    }

    /// Slots in the thread table
    pub fn effective_thread_max(&self) -> u32 {
        self.thread_init.max(self.thread_max)
    }

    /// Check internal consistency
    pub fn validate(&self) -> EnvResult<()> {
        if self.pin_max == 0 {
            return Err(EnvError::config(ConfigErrorKind::InvalidPinMax(
                self.pin_max,
            )));
        }
        // Slot indices are u32 with u32::MAX reserved as the list terminator
        if self.effective_thread_max() == u32::MAX {
            return Err(EnvError::config(ConfigErrorKind::InvalidThreadCount {
                thread_init: self.thread_init,
                thread_max: self.thread_max,
            }));
        }
        if self.failchk && !self.tracks_threads() {
            return Err(EnvError::config(ConfigErrorKind::ThreadTableMissing));
        }
        Ok(())
    }
}
