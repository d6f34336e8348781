mod first_fit;

pub use first_fit::FirstFitSegmentAllocator;

use crate::vlm_error::VLMError;

/// Carves page-aligned object segments out of the one reserved arena.
///
/// Offsets are relative to the arena base. Freeing never unmaps anything;
/// it only returns the range to the free list.
pub trait SegmentAllocatorModule {
    /// Creates a new allocator module object.
    ///
    /// **Note**: It first will be initialized before it will be used
    fn new() -> Self;

    /// Initializes the allocator with the arena range `[0, size)`.
    /// `size` and all requests are multiples of the page size.
    fn init(&mut self, size: usize);

    /// Allocates a segment and returns its offset into the arena.
    fn allocate(&mut self, size: usize) -> Result<usize, VLMError>;

    /// Returns a segment to the free list.
    fn free(&mut self, offset: usize, size: usize);

    /// Total unallocated bytes.
    fn free_bytes(&self) -> usize;
}

#[cfg(test)]
pub(crate) mod test {
    use super::SegmentAllocatorModule;

    #[derive(Debug, Clone, Copy)]
    struct AllocatedRegion {
        offset: usize,
        size: usize,
    }

    fn check_no_overlap(regions: &Vec<AllocatedRegion>) {
        for (region, i) in regions.iter().zip(0..) {
            for (cmp, j) in regions.iter().zip(0..) {
                if i == j {
                    continue;
                }

                assert!(
                    (cmp.offset + cmp.size <= region.offset)
                        || (region.offset + region.size <= cmp.offset),
                    "allocated regions should not overlap"
                )
            }
        }
    }

    pub(crate) fn test_segment_allocator_generic<A: SegmentAllocatorModule>() {
        const PAGE: usize = 4096;
        const TOTAL_SIZE: usize = 64 * PAGE;

        let mut allocator = A::new();
        allocator.init(TOTAL_SIZE);
        assert_eq!(allocator.free_bytes(), TOTAL_SIZE);

        let mut regions: Vec<AllocatedRegion> = Vec::new();

        macro_rules! allocate {
            ($size:expr) => {
                let size = $size;
                let offset = allocator.allocate(size).expect("should have space left");
                assert_eq!(offset % PAGE, 0, "segments must stay page aligned");
                regions.push(AllocatedRegion { offset, size });
                check_no_overlap(&regions);
            };
        }

        macro_rules! free {
            ($index:expr) => {
                let item = regions.remove($index);
                allocator.free(item.offset, item.size);
                check_no_overlap(&regions);
            };
        }

        for _ in 0..4 {
            allocate!(PAGE);
        }
        assert_eq!(allocator.free_bytes(), TOTAL_SIZE - 4 * PAGE);

        free!(2);

        allocate!(2 * PAGE);
        allocate!(PAGE);
        allocate!(4 * PAGE);

        for i in [2, 3, 1, 0, 1, 0] {
            free!(i);
        }

        // everything freed again, the full arena must coalesce back
        assert_eq!(allocator.free_bytes(), TOTAL_SIZE);
        allocate!(TOTAL_SIZE);

        allocator
            .allocate(PAGE)
            .expect_err("should have no space left");

        free!(0);
        assert_eq!(allocator.free_bytes(), TOTAL_SIZE);
    }
}
