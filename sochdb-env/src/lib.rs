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

//! # SochDB Environment
//!
//! Bookkeeping shared by every thread attached to one database environment:
//! who is inside the library, what they have pinned, and how to clean up
//! after a thread that died.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Environment                           │
//! │   set_state / verify_state / enter        failchk            │
//! │          │                                   │               │
//! │          ▼                                   ▼               │
//! │  ┌──────────────────┐  reclassify   ┌─────────────────────┐  │
//! │  │ ThreadControl-   │◀──────────────│   FailureScanner    │  │
//! │  │ Table (buckets,  │               │ detect → unpin →    │  │
//! │  │ arena, pin lists)│               │ hooks → clear       │  │
//! │  └──────────────────┘               └──────────┬──────────┘  │
//! │                                                │ is_alive    │
//! │  ┌──────────────────┐  ┌──────────────┐        ▼             │
//! │  │   MetaCursor     │─▶│ LockCoupler  │   LivenessOracle     │
//! │  │ read/dirty/release│ └──────┬───────┘                      │
//! │  └────────┬─────────┘        ▼                               │
//! │           ▼             LockManager                          │
//! │       BufferPool                                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The host supplies thread identities, the liveness oracle, the lock manager
//! and the buffer pool. [`LocalLockManager`] and [`MemoryBufferPool`] cover
//! single-process use.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use sochdb_env::{
//!     EnvConfig, Environment, LocalLockManager, MemoryBufferPool, MetaCursor,
//!     MetaDatabase, PageId, PageType, ProcessLiveness,
//! };
//!
//! let pool = Arc::new(MemoryBufferPool::new());
//! let meta = PageId::new(1, 0);
//! pool.create_page(meta, PageType::HashMeta).unwrap();
//!
//! let env = Environment::builder(EnvConfig::with_thread_count(64).failchk(true))
//!     .liveness(ProcessLiveness)
//!     .lock_manager(Arc::new(LocalLockManager::new()))
//!     .buffer_pool(pool.clone())
//!     .open()
//!     .unwrap();
//!
//! let db = Arc::new(MetaDatabase::new("accounts", meta, 0, PageType::HashMeta));
//! let _inside = env.enter().unwrap();
//! let mut cursor = MetaCursor::new(env.clone(), db, 1);
//! cursor.acquire_for_read().unwrap();
//! cursor.dirty_for_write().unwrap();
//! cursor.release().unwrap();
//! assert_eq!(pool.pin_count(meta), Some(0));
//! ```

pub mod buffer;
pub mod config;
pub mod coupler;
pub mod env;
pub mod error;
pub mod failchk;
pub mod identity;
pub mod liveness;
pub mod lock;
pub mod lock_manager;
pub mod meta;
pub mod pin;
pub mod thread_table;

pub use buffer::{
    BufferFrame, BufferPool, BufferPoolStats, FetchFlags, MemoryBufferPool, PageHandle, PageId,
    PageType,
};
pub use config::{DEFAULT_PIN_MAX, EnvConfig};
pub use coupler::LockCoupler;
pub use env::{ApiGuard, BlockedGuard, EnvBuilder, Environment};
pub use error::{ConfigErrorKind, EnvError, EnvResult, LockErrorKind, PageErrorKind};
pub use failchk::{
    Detected, FailchkContext, FailchkReport, FailchkStage, FailchkSubsystem, FailureScanner,
};
pub use identity::{OsThreadIds, THREAD_KEY_LEN, ThreadIdSource, ThreadIdentity, ThreadKey};
pub use liveness::{AliveFlags, LivenessOracle, ProcessLiveness};
pub use lock::{LockHandle, LockManager, LockMode, LockOptions, LockerId};
pub use lock_manager::{LocalLockManager, LockStats};
pub use meta::{MetaCursor, MetaDatabase, MetaLocation, MetaReopen};
pub use pin::PinList;
pub use thread_table::{
    ThreadControlBlock, ThreadControlTable, ThreadSnapshot, ThreadState, ThreadTableStats,
};
