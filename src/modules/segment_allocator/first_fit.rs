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

use log::trace;

use super::SegmentAllocatorModule;
use crate::vlm_error::VLMError;

#[derive(Debug, Clone, Copy)]
struct FreeRange {
    offset: usize,
    size: usize,
}

/// First-fit segment allocator over the arena.
///
/// The free list is kept sorted by offset so freeing can coalesce with
/// both neighbours. Address space is cheap, segment churn is rare (one
/// allocation per object lifetime), so a plain sorted vector beats an
/// intrusive list here.
pub struct FirstFitSegmentAllocator {
    free_list: Vec<FreeRange>,
    free_bytes: usize,
}

impl SegmentAllocatorModule for FirstFitSegmentAllocator {
    fn new() -> Self {
        FirstFitSegmentAllocator {
            free_list: Vec::new(),
            free_bytes: 0,
        }
    }

    fn init(&mut self, size: usize) {
        self.free_list.clear();
        if size > 0 {
            self.free_list.push(FreeRange { offset: 0, size });
        }
        self.free_bytes = size;
    }

    fn allocate(&mut self, size: usize) -> Result<usize, VLMError> {
        debug_assert!(size > 0);

        for i in 0..self.free_list.len() {
            if self.free_list[i].size >= size {
                let offset = self.free_list[i].offset;

                if self.free_list[i].size == size {
                    self.free_list.remove(i);
                } else {
                    self.free_list[i].offset += size;
                    self.free_list[i].size -= size;
                }

                self.free_bytes -= size;
                trace!("segment allocate: {} bytes at offset {:#x}", size, offset);
                return Ok(offset);
            }
        }

        let available = self
            .free_list
            .iter()
            .map(|range| range.size)
            .max()
            .unwrap_or(0);
        Err(VLMError::OutOfAddressSpace {
            requested: size,
            available,
        })
    }

    fn free(&mut self, offset: usize, size: usize) {
        debug_assert!(size > 0);
        trace!("segment free: {} bytes at offset {:#x}", size, offset);

        // insertion point keeping the list sorted by offset
        let index = self
            .free_list
            .partition_point(|range| range.offset < offset);

        debug_assert!(
            index == 0 || self.free_list[index - 1].offset + self.free_list[index - 1].size <= offset,
            "double free or overlap below"
        );
        debug_assert!(
            index == self.free_list.len() || offset + size <= self.free_list[index].offset,
            "double free or overlap above"
        );

        let merges_prev =
            index > 0 && self.free_list[index - 1].offset + self.free_list[index - 1].size == offset;
        let merges_next =
            index < self.free_list.len() && offset + size == self.free_list[index].offset;

        match (merges_prev, merges_next) {
            (true, true) => {
                self.free_list[index - 1].size += size + self.free_list[index].size;
                self.free_list.remove(index);
            }
            (true, false) => self.free_list[index - 1].size += size,
            (false, true) => {
                self.free_list[index].offset = offset;
                self.free_list[index].size += size;
            }
            (false, false) => self.free_list.insert(index, FreeRange { offset, size }),
        }

        self.free_bytes += size;
    }

    fn free_bytes(&self) -> usize {
        self.free_bytes
    }
}

#[cfg(test)]
mod test {
    use super::super::test::test_segment_allocator_generic;
    use super::*;

    #[test]
    fn test_first_fit_generic() {
        test_segment_allocator_generic::<FirstFitSegmentAllocator>();
    }

    #[test]
    fn test_first_fit_reuses_lowest_hole() {
        let mut allocator = FirstFitSegmentAllocator::new();
        allocator.init(16 * 4096);

        let a = allocator.allocate(4096).unwrap();
        let b = allocator.allocate(4096).unwrap();
        let c = allocator.allocate(4096).unwrap();
        assert!(a < b && b < c);

        allocator.free(a, 4096);
        // first fit hands the lowest hole back out
        assert_eq!(allocator.allocate(4096).unwrap(), a);
    }

    #[test]
    fn test_out_of_space_reports_largest_hole() {
        let mut allocator = FirstFitSegmentAllocator::new();
        allocator.init(4 * 4096);

        let a = allocator.allocate(2 * 4096).unwrap();
        let _b = allocator.allocate(2 * 4096).unwrap();
        allocator.free(a, 2 * 4096);

        match allocator.allocate(3 * 4096) {
            Err(VLMError::OutOfAddressSpace {
                requested,
                available,
            }) => {
                assert_eq!(requested, 3 * 4096);
                assert_eq!(available, 2 * 4096);
            }
            other => panic!("expected OutOfAddressSpace, got {:?}", other.map(|_| ())),
        }
    }
}
