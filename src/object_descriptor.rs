/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use crate::modules::backing_store::BackingStoreModule;
use crate::util::{bit_array::BitArray, div_round_up};
use crate::vlm_source::{ElementKind, PopulateSource};

/// Immutable shape of one object's address range.
///
/// Pages are grouped on a fixed grid of install units; a group is always
/// populated and evicted as a whole, so the residency bitmap is uniform
/// within a group (the host-header prefix being the one exception, see
/// `group_contains_header`).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjectGeometry {
    pub base_addr: usize,
    pub page_size: usize,
    pub n_elements: u64,
    pub element_size: usize,
    pub header_bytes: usize,
    /// `header_bytes + n_elements * element_size`
    pub range_bytes: usize,
    /// `ceil(range_bytes / page_size)`
    pub n_pages: usize,
    /// segment carved from the arena, `n_pages * page_size`
    pub segment_len: usize,
    /// install unit in whole pages
    pub pages_per_group: usize,
    pub n_groups: usize,
}

impl ObjectGeometry {
    pub(crate) fn new(
        base_addr: usize,
        page_size: usize,
        n_elements: u64,
        element_size: usize,
        header_bytes: usize,
        min_load_elements: u64,
    ) -> Self {
        let range_bytes = header_bytes + n_elements as usize * element_size;
        let n_pages = div_round_up(range_bytes, page_size);
        let segment_len = n_pages * page_size;

        // the install unit covers at least one page and at least
        // min_load_elements elements, capped at the object itself
        let min_load_bytes = (min_load_elements.max(1) as usize).saturating_mul(element_size);
        let pages_per_group = div_round_up(min_load_bytes, page_size).clamp(1, n_pages);
        let n_groups = div_round_up(n_pages, pages_per_group);

        ObjectGeometry {
            base_addr,
            page_size,
            n_elements,
            element_size,
            header_bytes,
            range_bytes,
            n_pages,
            segment_len,
            pages_per_group,
            n_groups,
        }
    }

    pub(crate) fn contains_addr(&self, addr: usize) -> bool {
        addr >= self.base_addr && addr < self.base_addr + self.segment_len
    }

    pub(crate) fn page_of_addr(&self, addr: usize) -> usize {
        debug_assert!(self.contains_addr(addr));
        (addr - self.base_addr) / self.page_size
    }

    pub(crate) fn group_of_page(&self, page: usize) -> usize {
        debug_assert!(page < self.n_pages);
        page / self.pages_per_group
    }

    /// Page range `[lo, hi)` of a group, last group clamped to the object.
    pub(crate) fn group_pages(&self, group: usize) -> (usize, usize) {
        debug_assert!(group < self.n_groups);
        let lo = group * self.pages_per_group;
        let hi = (lo + self.pages_per_group).min(self.n_pages);
        (lo, hi)
    }

    /// Object-relative byte window `[lo, hi)` of a group, whole pages.
    pub(crate) fn group_bytes(&self, group: usize) -> (usize, usize) {
        let (page_lo, page_hi) = self.group_pages(group);
        (page_lo * self.page_size, page_hi * self.page_size)
    }

    /// True for pages overlapping the host header.
    pub(crate) fn is_header_page(&self, page: usize) -> bool {
        page * self.page_size < self.header_bytes
    }

    /// Pages of this kind carry no element bytes at all; they are
    /// zero-installed on fault and the host fills them.
    pub(crate) fn is_pure_header_page(&self, page: usize) -> bool {
        (page + 1) * self.page_size <= self.header_bytes
    }

    /// Groups with header pages are never evicted: the header content
    /// exists only in memory, the populate path cannot regenerate it.
    pub(crate) fn group_contains_header(&self, group: usize) -> bool {
        let (page_lo, _) = self.group_pages(group);
        self.is_header_page(page_lo)
    }

    /// Element index span `[start, end)` whose bytes overlap the
    /// object-relative byte window `[byte_lo, byte_hi)`, or `None` when the
    /// window holds no element bytes. Elements straddling the window edges
    /// are included.
    pub(crate) fn element_span(&self, byte_lo: usize, byte_hi: usize) -> Option<(u64, u64)> {
        let data_lo = byte_lo.max(self.header_bytes);
        let data_hi = byte_hi.min(self.range_bytes);
        if data_lo >= data_hi {
            return None;
        }

        let start = ((data_lo - self.header_bytes) / self.element_size) as u64;
        let end =
            (div_round_up(data_hi - self.header_bytes, self.element_size) as u64)
                .min(self.n_elements);
        debug_assert!(start < end);
        Some((start, end))
    }

    /// Byte offset of element `index` from the object base.
    pub(crate) fn element_offset(&self, index: u64) -> usize {
        self.header_bytes + index as usize * self.element_size
    }
}

/// Mutable per-object bookkeeping; everything in here is guarded by the
/// descriptor lock.
pub(crate) struct DescriptorState<S: BackingStoreModule> {
    /// one bit per page, set iff the page is RAM-backed right now
    pub residency: BitArray,
    /// set iff the page differs from any backing-store image
    pub dirty: BitArray,
    /// set iff the backing store ever received this page
    pub ever_dirty: BitArray,
    /// last-touch epoch per group, for approximate LRU
    pub group_epoch: Vec<u64>,
    /// taken out at destruction so the destructor runs outside the lock
    pub source: Option<Box<dyn PopulateSource>>,
    pub backing: Option<S>,
    pub resident_pages: usize,
    /// set at destruction; queued faults answer with a bare wake
    pub terminating: bool,
}

pub(crate) struct ObjectDescriptor<S: BackingStoreModule> {
    pub geometry: ObjectGeometry,
    #[allow(unused)]
    pub element_kind: ElementKind,
    pub dims: Option<Vec<u64>>,
    /// sticky status of the first failed populate, 0 when clean
    pub error_status: AtomicI32,
    pub state: Mutex<DescriptorState<S>>,
}

impl<S: BackingStoreModule> ObjectDescriptor<S> {
    pub(crate) fn new(
        geometry: ObjectGeometry,
        element_kind: ElementKind,
        dims: Option<Vec<u64>>,
        source: Box<dyn PopulateSource>,
        backing: S,
    ) -> Self {
        ObjectDescriptor {
            geometry,
            element_kind,
            dims,
            error_status: AtomicI32::new(0),
            state: Mutex::new(DescriptorState {
                residency: BitArray::new(geometry.n_pages),
                dirty: BitArray::new(geometry.n_pages),
                ever_dirty: BitArray::new(geometry.n_pages),
                group_epoch: vec![0; geometry.n_groups],
                source: Some(source),
                backing: Some(backing),
                resident_pages: 0,
                terminating: false,
            }),
        }
    }

    pub(crate) fn record_error(&self, status: i32) {
        // keep the first status; later failures only log
        let _ = self
            .error_status
            .compare_exchange(0, status, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub(crate) fn error(&self) -> Option<i32> {
        match self.error_status.load(Ordering::SeqCst) {
            0 => None,
            status => Some(status),
        }
    }
}
