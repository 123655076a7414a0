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

//! Liveness oracle
//!
//! The environment cannot observe other processes' threads itself; the host
//! answers "is this thread still alive?". The oracle must not block.

use crate::identity::ThreadIdentity;

/// Flags passed to [`LivenessOracle::is_alive`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AliveFlags {
    /// Only the process matters; ignore the thread key.
    pub process_only: bool,
}

impl AliveFlags {
    pub const NONE: Self = Self {
        process_only: false,
    };

    pub const PROCESS_ONLY: Self = Self { process_only: true };
}

/// Host-supplied `is_alive(pid, tid, flags)` predicate
pub trait LivenessOracle: Send + Sync {
    fn is_alive(&self, id: &ThreadIdentity, flags: AliveFlags) -> bool;
}

impl<F> LivenessOracle for F
where
    F: Fn(&ThreadIdentity, AliveFlags) -> bool + Send + Sync,
{
    fn is_alive(&self, id: &ThreadIdentity, flags: AliveFlags) -> bool {
        self(id, flags)
    }
}

/// Process-granularity oracle.
///
/// A thread is considered alive while its process exists. Threads of the
/// current process are always reported alive: thread exit inside a live
/// process is not observable here, so hosts that need it must supply their
/// own oracle.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLiveness;

impl LivenessOracle for ProcessLiveness {
    fn is_alive(&self, id: &ThreadIdentity, _flags: AliveFlags) -> bool {
        if id.pid == std::process::id() {
            return true;
        }
        process_exists(id.pid)
    }
}

/// Check if a process exists
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    // kill(pid, 0) checks for existence without delivering a signal
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        true
    } else {
        // EPERM means the process exists but belongs to someone else
        let errno = std::io::Error::last_os_error().raw_os_error();
        errno != Some(libc::ESRCH)
    }
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    // No portable check; never declare a process dead we cannot check.
    true
}
