use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::utils::{round_down_to_multiple, round_up_to_multiple};

/// Per-bank allocation granularity.
pub const SRAM_ALIGNMENT: u32 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum AllocationPreference {
    Start,
    End,
}

/// A first-fit allocator over one SRAM bank.
///
/// Allocators are values: [SramAllocator::allocate] returns the updated
/// allocator rather than mutating `self`, so a search can branch on an
/// allocation and simply drop the branch to undo it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SramAllocator {
    /// Sorted, non-overlapping, non-adjacent `[start, end)` free ranges.
    free: SmallVec<[(u32, u32); 4]>,
}

impl SramAllocator {
    pub fn new(capacity: u32) -> Self {
        SramAllocator {
            free: smallvec![(0, capacity)],
        }
    }

    /// Finds room for `size` bytes, from the bottom of the bank for
    /// [AllocationPreference::Start] or the top for
    /// [AllocationPreference::End]. Returns the updated allocator and the
    /// chosen offset, or `None` if nothing fits.
    pub fn allocate(&self, size: u32, preference: AllocationPreference) -> Option<(Self, u32)> {
        let size = round_up_to_multiple(size.max(1), SRAM_ALIGNMENT);
        let offset = match preference {
            AllocationPreference::Start => self.free.iter().find_map(|&(start, end)| {
                let aligned = round_up_to_multiple(start, SRAM_ALIGNMENT);
                (aligned.checked_add(size)? <= end).then_some(aligned)
            }),
            AllocationPreference::End => self.free.iter().rev().find_map(|&(start, end)| {
                let aligned = round_down_to_multiple(end.checked_sub(size)?, SRAM_ALIGNMENT);
                (aligned >= start).then_some(aligned)
            }),
        }?;
        Some((self.carve(offset, offset + size), offset))
    }

    fn carve(&self, start: u32, end: u32) -> Self {
        let mut free = SmallVec::with_capacity(self.free.len() + 1);
        for &(s, e) in &self.free {
            if e <= start || s >= end {
                free.push((s, e));
                continue;
            }
            if s < start {
                free.push((s, start));
            }
            if end < e {
                free.push((end, e));
            }
        }
        SramAllocator { free }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_start_and_end_preferences() {
        let alloc = SramAllocator::new(1024);
        let (alloc, a) = alloc.allocate(100, AllocationPreference::Start).unwrap();
        let (alloc, b) = alloc.allocate(100, AllocationPreference::End).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1024 - 112);
        assert!(alloc.allocate(1024 - 224, AllocationPreference::Start).is_some());
        assert!(alloc.allocate(1024 - 223, AllocationPreference::Start).is_none());
    }

    #[test]
    fn test_allocation_does_not_mutate_original() {
        let alloc = SramAllocator::new(64);
        let (after, _) = alloc.allocate(64, AllocationPreference::Start).unwrap();
        assert!(after.allocate(1, AllocationPreference::Start).is_none());
        assert!(alloc.allocate(64, AllocationPreference::Start).is_some());
    }

    proptest! {
        #[test]
        fn test_allocations_never_overlap(
            sizes in prop::collection::vec((1u32..300, any::<bool>()), 1..20)
        ) {
            let mut alloc = SramAllocator::new(2048);
            let mut taken: Vec<(u32, u32)> = vec![];
            for (size, at_end) in sizes {
                let pref = if at_end { AllocationPreference::End } else { AllocationPreference::Start };
                if let Some((next, offset)) = alloc.allocate(size, pref) {
                    prop_assert_eq!(offset % SRAM_ALIGNMENT, 0);
                    let end = offset + size;
                    prop_assert!(end <= 2048);
                    for &(s, e) in &taken {
                        prop_assert!(end <= s || offset >= e);
                    }
                    taken.push((offset, end));
                    alloc = next;
                }
            }
        }
    }
}
