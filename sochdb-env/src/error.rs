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

//! Environment error types
//!
//! Callers need to tell three outcomes apart:
//! - lock contention, where releasing and retrying is appropriate
//!   ([`EnvError::is_retryable`])
//! - a thread that died inside the library, after which the environment
//!   may be unsafe to keep using ([`EnvError::is_fatal`])
//! - everything else, which is surfaced verbatim

use std::fmt;
use thiserror::Error;

use crate::buffer::PageId;
use crate::identity::ThreadKey;

/// Result type for environment operations
pub type EnvResult<T> = Result<T, EnvError>;

/// Environment error types
#[derive(Error, Debug)]
pub enum EnvError {
    /// I/O error reported by a host collaborator
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Environment was configured inconsistently
    #[error("Configuration error: {kind}")]
    Config { kind: ConfigErrorKind },

    /// Internal consistency violation (e.g. verifying an unregistered thread)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Thread table or page arena exhausted
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Lock manager error
    #[error("Lock error: {kind}")]
    Lock { kind: LockErrorKind },

    /// Page / buffer pool error
    #[error("Page error: {kind}")]
    Page { kind: PageErrorKind },

    /// A thread died while active inside the library
    #[error("Thread died in library: pid {pid}, tid {tid}")]
    ThreadDied { pid: u32, tid: ThreadKey },

    /// A previous failure check found a fatal condition
    #[error("Environment requires recovery after a fatal failure check")]
    RunRecovery,

    /// A thread tried to hold more pins than its pin list allows
    #[error("Pin list full: a thread may hold at most {max} pinned pages")]
    PinLimit { max: usize },

    /// Reopening a stale subdatabase handle failed
    #[error("Reopen of {database} failed: {reason}")]
    Reopen { database: String, reason: String },

    /// Error raised by a host subsystem hook
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EnvError {
    /// Lock was not granted without waiting
    pub fn not_granted(resource: PageId) -> Self {
        Self::Lock {
            kind: LockErrorKind::NotGranted(resource),
        }
    }

    /// Requester was chosen as the deadlock victim
    pub fn deadlock(resource: PageId) -> Self {
        Self::Lock {
            kind: LockErrorKind::Deadlock(resource),
        }
    }

    pub fn config(kind: ConfigErrorKind) -> Self {
        Self::Config { kind }
    }

    /// Lock contention: the caller may release what it holds and retry
    /// with a blocking request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Lock {
                kind: LockErrorKind::NotGranted(_) | LockErrorKind::Deadlock(_)
            }
        )
    }

    /// The environment may be unsafe to continue using.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ThreadDied { .. } | Self::RunRecovery)
    }
}

/// Configuration error kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// Failure checking requested without an is-alive callback
    LivenessOracleMissing,
    /// Thread tracking was not enabled when the environment was created
    ThreadTableMissing,
    /// Buffer pool required but not configured
    BufferPoolMissing,
    /// Lock manager required but not configured
    LockManagerMissing,
    /// Thread counts out of range
    InvalidThreadCount { thread_init: u32, thread_max: u32 },
    /// Pin list capacity must be at least one
    InvalidPinMax(usize),
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LivenessOracleMissing => {
                write!(f, "failure checking requires an is-alive callback")
            }
            Self::ThreadTableMissing => write!(
                f,
                "thread tracking must be enabled (thread_init or thread_max) at environment creation"
            ),
            Self::BufferPoolMissing => write!(f, "no buffer pool configured"),
            Self::LockManagerMissing => write!(f, "no lock manager configured"),
            Self::InvalidThreadCount {
                thread_init,
                thread_max,
            } => write!(
                f,
                "invalid thread counts: thread_init {}, thread_max {}",
                thread_init, thread_max
            ),
            Self::InvalidPinMax(n) => write!(f, "invalid pin_max {}", n),
        }
    }
}

/// Lock-specific error kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockErrorKind {
    /// NOWAIT request conflicted with another holder
    NotGranted(PageId),
    /// Waiting would close a cycle in the waits-for graph
    Deadlock(PageId),
    /// Release of a lock the manager does not know about
    NotHeld(u64),
    /// Requests must be READ or WRITE
    InvalidMode,
}

impl fmt::Display for LockErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotGranted(page) => write!(f, "lock on {} not granted", page),
            Self::Deadlock(page) => write!(f, "deadlock detected waiting for {}", page),
            Self::NotHeld(id) => write!(f, "lock {} not held", id),
            Self::InvalidMode => write!(f, "lock mode must be READ or WRITE"),
        }
    }
}

/// Page-specific error kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageErrorKind {
    /// Page does not exist in the pool
    NotFound(PageId),
    /// Page already exists
    AlreadyExists(PageId),
    /// Page released more often than it was pinned
    NotPinned(PageId),
    /// Write access to a page that was not dirtied first
    NotDirty(PageId),
}

impl fmt::Display for PageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "page {} not found", id),
            Self::AlreadyExists(id) => write!(f, "page {} already exists", id),
            Self::NotPinned(id) => write!(f, "page {} is not pinned", id),
            Self::NotDirty(id) => write!(f, "page {} was not marked dirty", id),
        }
    }
}
