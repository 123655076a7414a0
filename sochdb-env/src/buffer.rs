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

//! Buffer pool interface
//!
//! The environment does not own page memory. It talks to a buffer pool
//! through [`BufferPool`]: fetch a page (pinning it), release it, mark it
//! dirty, and release every pin a dead thread left behind.
//!
//! Pins taken on behalf of a registered thread are recorded in that thread's
//! pin list so that failure checking can return them after the thread dies.
//!
//! [`MemoryBufferPool`] is an in-memory implementation backed by a sharded
//! concurrent map, used by hosts without a pool of their own and by tests.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EnvError, EnvResult, PageErrorKind};
use crate::thread_table::ThreadControlBlock;

/// Page identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct PageId {
    /// File (database) identifier
    pub file_id: u64,
    /// Page number within file
    pub page_no: u64,
}

impl PageId {
    pub fn new(file_id: u64, page_no: u64) -> Self {
        Self { file_id, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_no)
    }
}

/// Page type as stamped in the page header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    #[default]
    Invalid = 0,
    HashMeta = 1,
    BtreeMeta = 2,
    Hash = 3,
    Btree = 4,
    Overflow = 5,
}

impl PageType {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::HashMeta,
            2 => Self::BtreeMeta,
            3 => Self::Hash,
            4 => Self::Btree,
            5 => Self::Overflow,
            _ => Self::Invalid,
        }
    }

    pub fn is_meta(self) -> bool {
        matches!(self, Self::HashMeta | Self::BtreeMeta)
    }
}

/// Flags for [`BufferPool::fetch_page`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchFlags {
    /// The caller will modify the page
    pub dirty: bool,
    /// Create the page if it does not exist
    pub create: bool,
}

impl FetchFlags {
    pub const NONE: Self = Self {
        dirty: false,
        create: false,
    };

    pub const DIRTY: Self = Self {
        dirty: true,
        create: false,
    };

    pub const CREATE: Self = Self {
        dirty: false,
        create: true,
    };
}

/// Cached page frame
#[derive(Debug)]
pub struct BufferFrame {
    id: PageId,
    page_type: AtomicU8,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    data: RwLock<Vec<u8>>,
}

impl BufferFrame {
    fn new(id: PageId, page_type: PageType, page_size: usize) -> Self {
        Self {
            id,
            page_type: AtomicU8::new(page_type as u8),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            data: RwLock::new(vec![0; page_size]),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_u8(self.page_type.load(Ordering::Acquire))
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one pin; fails if the frame was not pinned.
    fn unpin(&self) -> EnvResult<()> {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| EnvError::Page {
                kind: PageErrorKind::NotPinned(self.id),
            })
    }
}

/// A pinned page.
///
/// Returned by [`BufferPool::fetch_page`] and given back with
/// [`BufferPool::release_page`]. Dropping a handle without releasing it
/// leaks the pin, the same as a thread dying with the page pinned.
#[derive(Debug)]
pub struct PageHandle {
    frame: Arc<BufferFrame>,
    /// File revision observed when the page was fetched
    revision: u64,
    dirty: bool,
}

impl PageHandle {
    pub fn id(&self) -> PageId {
        self.frame.id
    }

    pub fn page_type(&self) -> PageType {
        self.frame.page_type()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether this handle may modify the page
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.frame.data.read()
    }

    /// Write access; the handle must have been fetched dirty or marked dirty.
    pub fn data_mut(&self) -> EnvResult<RwLockWriteGuard<'_, Vec<u8>>> {
        if !self.dirty {
            return Err(EnvError::Page {
                kind: PageErrorKind::NotDirty(self.frame.id),
            });
        }
        Ok(self.frame.data.write())
    }
}

/// Buffer pool collaborator
pub trait BufferPool: Send + Sync {
    /// Pin `page`, recording the pin in `thread`'s pin list when given.
    fn fetch_page(
        &self,
        thread: Option<&ThreadControlBlock>,
        page: PageId,
        flags: FetchFlags,
    ) -> EnvResult<PageHandle>;

    /// Unpin a page previously returned by `fetch_page`.
    fn release_page(&self, thread: Option<&ThreadControlBlock>, handle: PageHandle)
    -> EnvResult<()>;

    /// Mark a pinned page as modified.
    fn mark_dirty(&self, handle: &mut PageHandle) -> EnvResult<()>;

    /// Release every pin recorded for a dead thread; returns pages unpinned.
    fn unpin_thread(&self, thread: &ThreadControlBlock) -> EnvResult<usize>;
}

/// Buffer pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferPoolStats {
    pub pages: usize,
    pub pinned_pages: usize,
    pub dirty_pages: usize,
    pub fetches: u64,
    pub releases: u64,
    /// Pins returned on behalf of dead threads
    pub dead_unpins: u64,
}

/// In-memory buffer pool
pub struct MemoryBufferPool {
    frames: DashMap<PageId, Arc<BufferFrame>>,
    /// Revision stamp per file, bumped on reorganization
    revisions: DashMap<u64, u64>,
    page_size: usize,
    fetches: AtomicU64,
    releases: AtomicU64,
    dead_unpins: AtomicU64,
}

impl MemoryBufferPool {
    pub const DEFAULT_PAGE_SIZE: usize = 4096;

    pub fn new() -> Self {
        Self::with_page_size(Self::DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            frames: DashMap::new(),
            revisions: DashMap::new(),
            page_size,
            fetches: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            dead_unpins: AtomicU64::new(0),
        }
    }

    /// Create an unpinned page of the given type
    pub fn create_page(&self, page: PageId, page_type: PageType) -> EnvResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.frames.entry(page) {
            Entry::Occupied(_) => Err(EnvError::Page {
                kind: PageErrorKind::AlreadyExists(page),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(BufferFrame::new(page, page_type, self.page_size)));
                Ok(())
            }
        }
    }

    /// Change the type stamped on an existing page
    pub fn retype_page(&self, page: PageId, page_type: PageType) -> EnvResult<()> {
        let frame = self.frame(page)?;
        frame.page_type.store(page_type as u8, Ordering::Release);
        Ok(())
    }

    /// Current revision of a file
    pub fn file_revision(&self, file_id: u64) -> u64 {
        self.revisions.get(&file_id).map(|r| *r).unwrap_or(0)
    }

    /// Advance a file's revision, as a subdatabase reorganization does.
    pub fn bump_revision(&self, file_id: u64) -> u64 {
        let mut revision = self.revisions.entry(file_id).or_insert(0);
        *revision += 1;
        debug!(file_id, revision = *revision, "bumped file revision");
        *revision
    }

    pub fn pin_count(&self, page: PageId) -> Option<u32> {
        self.frames.get(&page).map(|f| f.pin_count())
    }

    pub fn is_dirty(&self, page: PageId) -> Option<bool> {
        self.frames.get(&page).map(|f| f.is_dirty())
    }

    pub fn stats(&self) -> BufferPoolStats {
        let mut stats = BufferPoolStats {
            pages: self.frames.len(),
            fetches: self.fetches.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            dead_unpins: self.dead_unpins.load(Ordering::Relaxed),
            ..Default::default()
        };
        for frame in self.frames.iter() {
            if frame.pin_count() > 0 {
                stats.pinned_pages += 1;
            }
            if frame.is_dirty() {
                stats.dirty_pages += 1;
            }
        }
        stats
    }

    fn frame(&self, page: PageId) -> EnvResult<Arc<BufferFrame>> {
        self.frames
            .get(&page)
            .map(|f| Arc::clone(f.value()))
            .ok_or(EnvError::Page {
                kind: PageErrorKind::NotFound(page),
            })
    }
}

impl Default for MemoryBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool for MemoryBufferPool {
    fn fetch_page(
        &self,
        thread: Option<&ThreadControlBlock>,
        page: PageId,
        flags: FetchFlags,
    ) -> EnvResult<PageHandle> {
        let frame = match self.frame(page) {
            Ok(frame) => frame,
            Err(_) if flags.create => Arc::clone(
                self.frames
                    .entry(page)
                    .or_insert_with(|| {
                        Arc::new(BufferFrame::new(page, PageType::Invalid, self.page_size))
                    })
                    .value(),
            ),
            Err(e) => return Err(e),
        };

        // Record before pinning so a full pin list leaves no stray pin.
        if let Some(thread) = thread {
            thread.pins().push(page)?;
        }
        frame.pin();
        if flags.dirty {
            frame.dirty.store(true, Ordering::Release);
        }
        self.fetches.fetch_add(1, Ordering::Relaxed);

        Ok(PageHandle {
            frame,
            revision: self.file_revision(page.file_id),
            dirty: flags.dirty,
        })
    }

    fn release_page(
        &self,
        thread: Option<&ThreadControlBlock>,
        handle: PageHandle,
    ) -> EnvResult<()> {
        handle.frame.unpin()?;
        if let Some(thread) = thread {
            thread.pins().remove(handle.id());
        }
        self.releases.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn mark_dirty(&self, handle: &mut PageHandle) -> EnvResult<()> {
        handle.frame.dirty.store(true, Ordering::Release);
        handle.dirty = true;
        Ok(())
    }

    fn unpin_thread(&self, thread: &ThreadControlBlock) -> EnvResult<usize> {
        let pages = thread.pins().drain();
        let mut unpinned = 0;
        for page in pages {
            match self.frames.get(&page) {
                Some(frame) if frame.unpin().is_ok() => unpinned += 1,
                _ => debug!(%page, slot = thread.slot(), "dead thread pin already gone"),
            }
        }
        self.dead_unpins.fetch_add(unpinned as u64, Ordering::Relaxed);
        debug!(slot = thread.slot(), unpinned, "released dead thread pins");
        Ok(unpinned)
    }
}
