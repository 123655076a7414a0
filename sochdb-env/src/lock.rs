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

//! Page lock interface
//!
//! Page locks are granted to a *locker* (a cursor or transaction id), not to
//! an OS thread. The environment only needs acquire and release; the deadlock
//! policy belongs to the lock manager.

use serde::{Deserialize, Serialize};

use crate::buffer::PageId;
use crate::error::EnvResult;
use crate::failchk::FailchkContext;

/// Lock owner identifier
pub type LockerId = u32;

/// Lock mode
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum LockMode {
    /// No lock held
    #[default]
    None,
    /// Shared
    Read,
    /// Exclusive
    Write,
}

impl LockMode {
    /// Two modes conflict if either is WRITE
    pub fn conflicts(self, other: LockMode) -> bool {
        matches!(
            (self, other),
            (LockMode::Write, LockMode::Read | LockMode::Write) | (LockMode::Read, LockMode::Write)
        )
    }
}

/// Acquisition options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockOptions {
    /// Fail with `NotGranted` instead of waiting
    pub nowait: bool,
}

impl LockOptions {
    pub const WAIT: Self = Self { nowait: false };
    pub const NOWAIT: Self = Self { nowait: true };
}

/// A granted lock, or the empty handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockHandle {
    grant: u64,
    resource: PageId,
    mode: LockMode,
    locker: LockerId,
}

impl LockHandle {
    pub fn new(grant: u64, resource: PageId, mode: LockMode, locker: LockerId) -> Self {
        Self {
            grant,
            resource,
            mode,
            locker,
        }
    }

    /// The empty handle (mode NONE)
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.mode != LockMode::None
    }

    pub fn grant(&self) -> u64 {
        self.grant
    }

    pub fn resource(&self) -> PageId {
        self.resource
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn locker(&self) -> LockerId {
        self.locker
    }
}

/// Lock manager collaborator
pub trait LockManager: Send + Sync {
    /// Acquire `resource` in `mode` for `locker`.
    ///
    /// With [`LockOptions::NOWAIT`] a conflicting request fails with
    /// `NotGranted`. A waiting request that would deadlock fails with
    /// `Deadlock`.
    fn acquire(
        &self,
        locker: LockerId,
        resource: PageId,
        mode: LockMode,
        opts: LockOptions,
    ) -> EnvResult<LockHandle>;

    fn release(&self, handle: &LockHandle) -> EnvResult<()>;

    /// Lock stage of failure checking: release locks held by dead threads.
    fn failchk(&self, ctx: &FailchkContext<'_>) -> EnvResult<()> {
        let _ = ctx;
        Ok(())
    }
}
