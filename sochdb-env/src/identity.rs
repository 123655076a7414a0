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

//! Thread identity
//!
//! A thread attached to the environment is identified by its process id and
//! an opaque thread key. Native thread handles are not portable across
//! processes (or even comparable with `==` on every platform), so the key is
//! a fixed-size byte array compared by value over its raw bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Width of an opaque thread key in bytes
pub const THREAD_KEY_LEN: usize = 16;

/// Opaque thread identifier, compared over its raw bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ThreadKey([u8; THREAD_KEY_LEN]);

impl ThreadKey {
    pub const fn from_bytes(bytes: [u8; THREAD_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Key for a pointer-sized or integer thread id
    pub fn from_u64(tid: u64) -> Self {
        let mut bytes = [0u8; THREAD_KEY_LEN];
        bytes[..8].copy_from_slice(&tid.to_le_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; THREAD_KEY_LEN] {
        &self.0
    }

    /// The integer value, if the key has a simple integer representation.
    pub fn as_u64(&self) -> Option<u64> {
        let [lo, hi] = self.to_words();
        (hi == 0).then_some(lo)
    }

    /// Split into two words for storage in atomics
    pub(crate) fn to_words(self) -> [u64; 2] {
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&self.0[..8]);
        hi.copy_from_slice(&self.0[8..]);
        [u64::from_le_bytes(lo), u64::from_le_bytes(hi)]
    }

    pub(crate) fn from_words(words: [u64; 2]) -> Self {
        let mut bytes = [0u8; THREAD_KEY_LEN];
        bytes[..8].copy_from_slice(&words[0].to_le_bytes());
        bytes[8..].copy_from_slice(&words[1].to_le_bytes());
        Self(bytes)
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u64() {
            Some(tid) => write!(f, "{:#x}", tid),
            None => {
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadKey({})", self)
    }
}

/// (process id, thread key) pair naming one attached thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadIdentity {
    pub pid: u32,
    pub tid: ThreadKey,
}

impl ThreadIdentity {
    pub fn new(pid: u32, tid: ThreadKey) -> Self {
        Self { pid, tid }
    }

    /// Identity for an integer thread id
    pub fn from_raw(pid: u32, tid: u64) -> Self {
        Self::new(pid, ThreadKey::from_u64(tid))
    }

    /// Hash used to pick a thread table bucket.
    ///
    /// Integer keys hash as `pid ^ tid`; anything wider falls back to a
    /// byte-wise hash over the whole identity.
    pub fn bucket_hash(&self) -> u64 {
        match self.tid.as_u64() {
            Some(tid) => u64::from(self.pid) ^ tid,
            None => {
                let mut buf = [0u8; 4 + THREAD_KEY_LEN];
                buf[..4].copy_from_slice(&self.pid.to_le_bytes());
                buf[4..].copy_from_slice(self.tid.as_bytes());
                twox_hash::xxh3::hash64(&buf)
            }
        }
    }
}

impl fmt::Display for ThreadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pid, self.tid)
    }
}

/// Host-supplied `thread_id()` callback
pub trait ThreadIdSource: Send + Sync {
    /// Identity of the calling thread
    fn thread_id(&self) -> ThreadIdentity;
}

impl<F> ThreadIdSource for F
where
    F: Fn() -> ThreadIdentity + Send + Sync,
{
    fn thread_id(&self) -> ThreadIdentity {
        self()
    }
}

/// Default identity source: OS process id plus the native thread handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsThreadIds;

impl ThreadIdSource for OsThreadIds {
    fn thread_id(&self) -> ThreadIdentity {
        ThreadIdentity::new(std::process::id(), current_thread_key())
    }
}

#[cfg(unix)]
fn current_thread_key() -> ThreadKey {
    // SAFETY: pthread_self has no preconditions and cannot fail.
    let handle = unsafe { libc::pthread_self() };
    ThreadKey::from_u64(handle as usize as u64)
}

#[cfg(not(unix))]
fn current_thread_key() -> ThreadKey {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static THREAD_KEY: u64 = NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed);
    }
    ThreadKey::from_u64(THREAD_KEY.with(|k| *k))
}
