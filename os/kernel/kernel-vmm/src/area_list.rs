//! # Area List
//!
//! The reserved ranges of one address space, kept sorted by base address
//! and pairwise disjoint. Lookups binary-search; gap search walks the list
//! once in ascending order and takes the first hole that fits.
//!
//! ```text
//!  window.start                                              window.end
//!  │  [A      )   gap   [B   )        gap            [C  )        │
//!  └──────────────┬───────────────────┬────────────────────────────┘
//!              too small?          first fit
//! ```

use crate::area::VmArea;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_memory_addresses::VirtualAddress;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AreaList {
    areas: Vec<VmArea>,
}

impl AreaList {
    #[must_use]
    pub const fn new() -> Self {
        Self { areas: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Areas in ascending base order.
    pub fn iter(&self) -> core::slice::Iter<'_, VmArea> {
        self.areas.iter()
    }

    /// Lowest base in `window` with `size` free bytes above it.
    #[must_use]
    pub fn find_gap(&self, size: u64, window: Range<VirtualAddress>) -> Option<VirtualAddress> {
        let end = window.end.as_u64();
        let mut cursor = window.start.as_u64();
        for area in &self.areas {
            let (base, area_end) = (area.base().as_u64(), area.end().as_u64());
            if area_end <= cursor {
                continue;
            }
            if base >= end {
                break;
            }
            if base.saturating_sub(cursor) >= size {
                return Some(VirtualAddress::new(cursor));
            }
            cursor = area_end;
        }
        (end.saturating_sub(cursor) >= size).then_some(VirtualAddress::new(cursor))
    }

    /// Insert `area` at its sorted position.
    ///
    /// # Errors
    /// Hands `area` back if it overlaps a neighbour.
    pub fn insert(&mut self, area: VmArea) -> Result<(), VmArea> {
        let at = self.position(area.base());
        let clashes_prev = at > 0 && self.areas[at - 1].overlaps(&area);
        let clashes_next = self.areas.get(at).is_some_and(|next| next.overlaps(&area));
        if clashes_prev || clashes_next {
            return Err(area);
        }
        self.areas.insert(at, area);
        Ok(())
    }

    /// The area containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&VmArea> {
        let at = self.position(va);
        // `position` points at the first area not starting below `va`.
        let candidate = if self.areas.get(at).is_some_and(|a| a.base() == va) {
            at
        } else {
            at.checked_sub(1)?
        };
        self.areas.get(candidate).filter(|a| a.contains(va))
    }

    /// Remove the area whose base is exactly `base`.
    pub fn remove_at_base(&mut self, base: VirtualAddress) -> Option<VmArea> {
        let at = self.position(base);
        if self.areas.get(at).is_some_and(|a| a.base() == base) {
            Some(self.areas.remove(at))
        } else {
            None
        }
    }

    /// Take every area, leaving the list empty.
    pub fn take_all(&mut self) -> Vec<VmArea> {
        core::mem::take(&mut self.areas)
    }

    /// Sorted by base, no two areas overlapping.
    #[must_use]
    pub fn is_sorted_and_disjoint(&self) -> bool {
        self.areas
            .windows(2)
            .all(|w| w[0].end().as_u64() <= w[1].base().as_u64())
    }

    /// Index of the first area whose base is not below `va`.
    fn position(&self, va: VirtualAddress) -> usize {
        self.areas.partition_point(|a| a.base() < va)
    }
}

impl<'a> IntoIterator for &'a AreaList {
    type Item = &'a VmArea;
    type IntoIter = core::slice::Iter<'a, VmArea>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::VmFlags;

    const W: Range<VirtualAddress> = VirtualAddress::new(0x1000)..VirtualAddress::new(0x10_0000);

    fn area(base: u64, size: u64) -> VmArea {
        VmArea::new(VirtualAddress::new(base), size, VmFlags::kernel_data(), None)
    }

    #[test]
    fn empty_list_fits_at_window_start() {
        let list = AreaList::new();
        assert_eq!(list.find_gap(0x2000, W), Some(W.start));
        assert_eq!(list.find_gap(0x10_0000, W), None);
    }

    #[test]
    fn first_gap_that_fits_wins() {
        let mut list = AreaList::new();
        list.insert(area(0x1000, 0x1000)).unwrap();
        list.insert(area(0x3000, 0x1000)).unwrap();
        list.insert(area(0x8000, 0x1000)).unwrap();

        // [0x2000, 0x3000) is the first hole and fits one page.
        assert_eq!(list.find_gap(0x1000, W), Some(VirtualAddress::new(0x2000)));
        // Two pages skip it and land at [0x4000, 0x8000).
        assert_eq!(list.find_gap(0x2000, W), Some(VirtualAddress::new(0x4000)));
        // Five pages only fit above the last area.
        assert_eq!(list.find_gap(0x5000, W), Some(VirtualAddress::new(0x9000)));
    }

    #[test]
    fn gap_must_end_inside_the_window() {
        let mut list = AreaList::new();
        let window = VirtualAddress::new(0x1000)..VirtualAddress::new(0x5000);
        list.insert(area(0x2000, 0x2000)).unwrap();
        assert_eq!(list.find_gap(0x1000, window.clone()), Some(VirtualAddress::new(0x1000)));
        list.insert(area(0x1000, 0x1000)).unwrap();
        assert_eq!(list.find_gap(0x1000, window.clone()), Some(VirtualAddress::new(0x4000)));
        assert_eq!(list.find_gap(0x2000, window), None);
    }

    #[test]
    fn areas_outside_the_window_are_ignored() {
        let mut list = AreaList::new();
        list.insert(area(0x1000, 0x1000)).unwrap();
        let window = VirtualAddress::new(0x4000)..VirtualAddress::new(0x6000);
        assert_eq!(list.find_gap(0x2000, window), Some(VirtualAddress::new(0x4000)));
    }

    #[test]
    fn insert_keeps_order_and_rejects_overlap() {
        let mut list = AreaList::new();
        list.insert(area(0x5000, 0x1000)).unwrap();
        list.insert(area(0x1000, 0x2000)).unwrap();
        list.insert(area(0x3000, 0x1000)).unwrap();
        assert!(list.is_sorted_and_disjoint());

        let overlapping = area(0x2000, 0x2000);
        assert_eq!(list.insert(overlapping), Err(overlapping));
        assert_eq!(list.len(), 3);

        let bases: Vec<u64> = list.iter().map(|a| a.base().as_u64()).collect();
        assert_eq!(bases, [0x1000, 0x3000, 0x5000]);
    }

    #[test]
    fn find_matches_any_address_inside() {
        let mut list = AreaList::new();
        list.insert(area(0x1000, 0x2000)).unwrap();
        list.insert(area(0x5000, 0x1000)).unwrap();

        assert_eq!(list.find(VirtualAddress::new(0x1000)).map(VmArea::base), Some(VirtualAddress::new(0x1000)));
        assert_eq!(list.find(VirtualAddress::new(0x2fff)).map(VmArea::base), Some(VirtualAddress::new(0x1000)));
        assert_eq!(list.find(VirtualAddress::new(0x5000)).map(VmArea::base), Some(VirtualAddress::new(0x5000)));
        assert!(list.find(VirtualAddress::new(0x3000)).is_none());
        assert!(list.find(VirtualAddress::new(0x0fff)).is_none());
        assert!(list.find(VirtualAddress::new(0x6000)).is_none());
    }

    #[test]
    fn remove_requires_exact_base() {
        let mut list = AreaList::new();
        list.insert(area(0x1000, 0x2000)).unwrap();
        assert!(list.remove_at_base(VirtualAddress::new(0x2000)).is_none());
        assert_eq!(list.remove_at_base(VirtualAddress::new(0x1000)), Some(area(0x1000, 0x2000)));
        assert!(list.is_empty());
    }
}
