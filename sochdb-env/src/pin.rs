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

//! Per-thread pin list
//!
//! Records which pages a thread currently holds pinned. The list is a
//! back-reference for cleanup after the thread dies; the buffer pool owns
//! the pin counts themselves.

use smallvec::SmallVec;

use crate::buffer::PageId;
use crate::error::{EnvError, EnvResult};

/// Bounded list of pages pinned by one thread
#[derive(Debug, Clone)]
pub struct PinList {
    pins: SmallVec<[PageId; 4]>,
    max: usize,
}

impl PinList {
    pub fn new(max: usize) -> Self {
        Self {
            pins: SmallVec::new(),
            max,
        }
    }

    /// Record a pin; the same page may appear more than once.
    pub fn push(&mut self, page: PageId) -> EnvResult<()> {
        if self.pins.len() >= self.max {
            return Err(EnvError::PinLimit { max: self.max });
        }
        self.pins.push(page);
        Ok(())
    }

    /// Drop one record of `page`. Returns false if none was recorded.
    pub fn remove(&mut self, page: PageId) -> bool {
        match self.pins.iter().position(|p| *p == page) {
            Some(pos) => {
                self.pins.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Take every record, leaving the list empty
    pub fn drain(&mut self) -> SmallVec<[PageId; 4]> {
        std::mem::take(&mut self.pins)
    }

    pub fn clear(&mut self) {
        self.pins.clear();
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageId> {
        self.pins.iter()
    }
}
