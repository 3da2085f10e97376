/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The selector address space.
//!
//! Selector addresses are built up bit-by-bit: the per-class solver freezes
//! ranges of bits (recorded in `fixed_bits_mask`), and only at the very end
//! does each selector get a concrete byte offset. Addresses here are 17-bit
//! *bucket indices*; the low 7 bits of the final offset are assigned by
//! packing each 128-byte bucket, and the unused gaps become the [HoleMap]
//! that absorbs non-participating strings.

use std::collections::{BTreeSet, HashMap, HashSet};

/// Selector known to sit at offset 0, so the runtime can recover a selector's
/// offset from its pointer. U+1F92F, "shocked face with exploding head".
pub const MAGIC_SELECTOR: &str = "\u{1F92F}";

/// Index into [SelectorArena::selectors].
pub type SelId = usize;
/// Index into the solver's class table.
pub type ClassId = usize;

/// Bucket indices are 17 bits; the low 7 bits of an offset stay free for
/// intra-bucket packing.
pub const MAX_BUCKET_INDEX: u32 = (1 << 17) - 1;
pub const BUCKET_SIZE_SHIFT: u32 = 7;
const BUCKET_SIZE: u32 = 1 << BUCKET_SIZE_SHIFT;

/// A unique method-name string with its (partially placed) address.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub name: String,
    /// Classes using this selector.
    pub classes: Vec<ClassId>,
    /// Which bits of the bucket index are already frozen.
    pub fixed_bits_mask: u32,
    /// Current 128-byte bucket index. Only the bits in `fixed_bits_mask` are
    /// actually decided.
    pub in_progress_bucket_index: u32,
    /// Final byte offset in the method-name pool, set by
    /// [AddressSpace::compute_low_bits].
    pub offset: u32,
}

impl Selector {
    /// String size including the NUL terminator.
    pub fn size(&self) -> u32 {
        self.name.len() as u32 + 1
    }

    /// How many bits would still have to be frozen to use this selector with
    /// the given shift and mask.
    pub fn number_of_bits_to_set(&self, shift: u32, mask: u32) -> u32 {
        let fixed = (self.fixed_bits_mask >> shift) & mask;
        mask.count_ones() - fixed.count_ones()
    }

    pub fn number_of_set_bits(&self) -> u32 {
        self.fixed_bits_mask.count_ones()
    }
}

/// Interned selectors; the magic selector is always entry 0.
pub struct SelectorArena {
    pub selectors: Vec<Selector>,
    by_name: HashMap<String, SelId>,
}

impl SelectorArena {
    pub fn new() -> SelectorArena {
        let mut arena = SelectorArena {
            selectors: Vec::new(),
            by_name: HashMap::new(),
        };
        arena.intern(MAGIC_SELECTOR);
        arena
    }

    pub fn intern(&mut self, name: &str) -> SelId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.selectors.len();
        self.selectors.push(Selector {
            name: name.to_string(),
            classes: Vec::new(),
            fixed_bits_mask: 0,
            in_progress_bucket_index: 0,
            offset: 0,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<SelId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: SelId) -> &Selector {
        &self.selectors[id]
    }

    pub fn get_mut(&mut self, id: SelId) -> &mut Selector {
        &mut self.selectors[id]
    }

    /// Selectors used by at least one surviving class, i.e. the ones the
    /// bucket-fit pass must place.
    pub fn interesting(&self) -> Vec<SelId> {
        (0..self.selectors.len())
            .filter(|&id| !self.selectors[id].classes.is_empty())
            .collect()
    }
}

/// A constraint on some bits of a bucket index: the bits covered by
/// `mask << shift` must form one of `allowed_values`.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub mask: u32,
    pub shift: u32,
    pub allowed_values: HashSet<u32>,
}

impl Constraint {
    /// Intersection of two constraints, handling nested, disjoint and
    /// overlapping bit ranges.
    pub fn intersecting(&self, other: &Constraint) -> Constraint {
        if self.mask == other.mask && self.shift == other.shift {
            return Constraint {
                mask: self.mask,
                shift: self.shift,
                allowed_values: self
                    .allowed_values
                    .intersection(&other.allowed_values)
                    .copied()
                    .collect(),
            };
        }

        let shifted_mask = self.mask << self.shift;
        let other_shifted_mask = other.mask << other.shift;

        // Always put the left-most (higher) mask on self.
        if shifted_mask < other_shifted_mask {
            return other.intersecting(self);
        }

        // A `mask == 0, allowed == {0}` constraint says nothing.
        if self.mask == 0 && self.allowed_values.len() == 1 && self.allowed_values.contains(&0) {
            return other.clone();
        }
        if other.mask == 0 && other.allowed_values.len() == 1 && other.allowed_values.contains(&0) {
            return self.clone();
        }

        if other.shift >= self.shift {
            // [self..[other]..self]: other's range is nested inside ours.
            let shift_difference = other.shift - self.shift;
            let allowed = self
                .allowed_values
                .iter()
                .copied()
                .filter(|&v| {
                    let val = (v >> shift_difference) & other.mask;
                    other.allowed_values.contains(&val)
                })
                .collect();
            return Constraint {
                mask: self.mask,
                shift: self.shift,
                allowed_values: allowed,
            };
        }

        let highest_bit = 31 - shifted_mask.leading_zeros();
        let other_highest_bit = 31 - other_shifted_mask.leading_zeros();
        let other_mask_length = 32 - (other.mask + 1).leading_zeros() - 1;
        let intersection_mask = shifted_mask & other_shifted_mask;

        if other_shifted_mask < (1 << self.shift) {
            // [self]....[other]: disjoint, self strictly above.
            let unconstrained_bits = self.shift - other_highest_bit - 1;
            let max_unconstrained = 1u32 << unconstrained_bits;
            let mut with_free_bits = BTreeSet::new();
            if unconstrained_bits > 0 {
                for &allowed in &self.allowed_values {
                    let shifted = allowed << unconstrained_bits;
                    for free in 0..max_unconstrained {
                        with_free_bits.insert((shifted | free) << other_mask_length);
                    }
                }
            } else {
                for &allowed in &self.allowed_values {
                    with_free_bits.insert(allowed << other_mask_length);
                }
            }
            let mut allowed_values = HashSet::new();
            for &high in &with_free_bits {
                for &low in &other.allowed_values {
                    allowed_values.insert(high | low);
                }
            }
            return Constraint {
                mask: ((1u32 << (highest_bit + 1)) - 1) >> other.shift,
                shift: other.shift,
                allowed_values,
            };
        }

        // Overlap: [self....[other....self].....other]
        let shift_difference = self.shift - other.shift;
        let self_bits: BTreeSet<u32> = self
            .allowed_values
            .iter()
            .map(|&v| ((v << self.shift) & intersection_mask) >> self.shift)
            .collect();
        let other_bits: BTreeSet<u32> = other
            .allowed_values
            .iter()
            .map(|&v| ((v << other.shift) & intersection_mask) >> self.shift)
            .collect();
        let intersecting_bits: Vec<u32> = self_bits.intersection(&other_bits).copied().collect();

        let mut allowed_values = HashSet::new();
        for &bits in &intersecting_bits {
            let bits_shifted = bits << self.shift;
            for &a in &self.allowed_values {
                if ((a << self.shift) & intersection_mask) != bits_shifted {
                    continue;
                }
                for &b in &other.allowed_values {
                    if ((b << other.shift) & intersection_mask) == bits_shifted {
                        allowed_values.insert((a << shift_difference) | b);
                    }
                }
            }
        }
        Constraint {
            mask: (shifted_mask | other_shifted_mask) >> other.shift,
            shift: other.shift,
            allowed_values,
        }
    }
}

/// Incrementally merges constraints into one.
#[derive(Default)]
pub struct ConstraintSet {
    pub merged: Option<Constraint>,
}

impl ConstraintSet {
    pub fn add(&mut self, constraint: Constraint) {
        self.merged = Some(match self.merged.take() {
            Some(merged) => merged.intersecting(&constraint),
            None => constraint,
        });
    }

    pub fn clear(&mut self) {
        self.merged = None;
    }
}

/// An unclaimed byte interval in the selector pool: `[start, end)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Hole {
    pub start: u32,
    pub end: u32,
}

impl Hole {
    fn size(&self) -> u32 {
        self.end - self.start
    }
}

// Ordered by (size, start) so `range` finds the best (smallest sufficient)
// fit.
impl Ord for Hole {
    fn cmp(&self, other: &Hole) -> std::cmp::Ordering {
        (self.size(), self.start).cmp(&(other.size(), other.start))
    }
}

impl PartialOrd for Hole {
    fn partial_cmp(&self, other: &Hole) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Best-fit allocator over the gaps the placement algorithm left in the
/// selector pool. Strings that don't participate in IMP caches go here.
pub struct HoleMap {
    holes: BTreeSet<Hole>,
    end_address: u32,
}

impl HoleMap {
    pub fn new() -> HoleMap {
        let mut map = HoleMap {
            holes: BTreeSet::new(),
            end_address: 0,
        };
        // Offset 0 belongs to the magic selector.
        map.add_string_of_size(MAGIC_SELECTOR.len() as u32 + 1);
        map
    }

    /// Returns the offset at which a string of `size` bytes should be placed.
    pub fn add_string_of_size(&mut self, size: u32) -> u32 {
        let needed = Hole {
            start: 0,
            end: size,
        };
        // Smallest hole with size >= requested.
        match self.holes.range(needed..).next().copied() {
            None => {
                let end = self.end_address;
                self.end_address += size;
                end
            }
            Some(hole) => {
                self.holes.remove(&hole);
                let address = hole.start;
                let remainder = Hole {
                    start: hole.start + size,
                    end: hole.end,
                };
                // A 1-byte hole can't fit any selector.
                if remainder.size() > 1 {
                    self.holes.insert(remainder);
                }
                address
            }
        }
    }

    pub fn total_hole_size(&self) -> u64 {
        self.holes.iter().map(|h| h.size() as u64).sum()
    }

    pub fn end_address(&self) -> u32 {
        self.end_address
    }

    pub fn clear(&mut self) {
        self.holes.clear();
        self.end_address = 0;
        self.add_string_of_size(MAGIC_SELECTOR.len() as u32 + 1);
    }

    fn set_state(&mut self, holes: BTreeSet<Hole>, end_address: u32) {
        self.holes = holes;
        self.end_address = end_address;
    }
}

impl Default for HoleMap {
    fn default() -> HoleMap {
        HoleMap::new()
    }
}

/// Sorts selectors into 128-byte buckets, validating that each bucket's
/// contents (by string length) actually fit, including the controlled
/// overflow of >128-byte selectors into following buckets.
#[derive(Default)]
pub struct AddressSpace {
    methods_by_index: HashMap<u32, Vec<SelId>>,
    sizes: HashMap<u32, u32>,
}

impl AddressSpace {
    fn bucket_capacity(&self, index: u32) -> u32 {
        // Bucket 0 starts after the magic selector.
        if index == 0 {
            BUCKET_SIZE - (MAGIC_SELECTOR.len() as u32 + 1)
        } else {
            BUCKET_SIZE
        }
    }

    pub fn size_at_index(&self, index: u32) -> u32 {
        self.sizes.get(&index).copied().unwrap_or(0)
    }

    fn size_available_after_index(&self, index: u32) -> u32 {
        let mut available = self.bucket_capacity(index) - self.size_at_index(index);
        let mut j = index + 1;
        while j < MAX_BUCKET_INDEX && !self.methods_by_index.contains_key(&j) {
            available += self.bucket_capacity(j);
            j += 1;
        }
        available
    }

    /// Because some selectors are longer than 128 bytes, they may overflow
    /// into following buckets. Placing into an *empty* bucket is only allowed
    /// if the last non-empty bucket before it has fully absorbed its own
    /// contents; otherwise the overflow run would be corrupted. A run of
    /// consecutive over-long selectors fails here rather than overlapping.
    fn can_place_without_filling_overflow_cell_at_index(&self, index: u32) -> bool {
        if index == 0 || self.size_at_index(index) > 0 {
            return true;
        }
        let mut j = index;
        let mut available_on_or_before = 0;
        while j > 0 && self.size_at_index(j) == 0 {
            available_on_or_before += self.bucket_capacity(j);
            j -= 1;
        }
        self.size_at_index(j) < available_on_or_before
    }

    pub fn can_place_method_at_index(&self, selector: &Selector, index: u32) -> bool {
        if !self.can_place_without_filling_overflow_cell_at_index(index) {
            return false;
        }
        let existing = self.size_at_index(index);
        let available = self.bucket_capacity(index) - existing;
        let method_size = selector.size();
        if available > method_size {
            return true;
        }
        // Long selectors may spill into unassigned space after the bucket.
        method_size > 64
            && available > 0
            && self.size_available_after_index(index) > method_size
    }

    pub fn place_method_at_index(&mut self, sel: SelId, selector_size: u32, index: u32) {
        self.methods_by_index.entry(index).or_default().push(sel);
        *self.sizes.entry(index).or_insert(0) += selector_size;
    }

    /// Drop selectors whose classes were all dropped.
    pub fn remove_uninteresting_selectors(&mut self, arena: &SelectorArena) {
        for selectors in self.methods_by_index.values_mut() {
            selectors.retain(|&id| !arena.get(id).classes.is_empty());
        }
    }

    /// Assign the low 7 bits: pack each bucket left-to-right, and record the
    /// gap to the next bucket in the hole map.
    pub fn compute_low_bits(&self, arena: &mut SelectorArena, hole_map: &mut HoleMap) {
        let mut end_offset = MAGIC_SELECTOR.len() as u32 + 1;
        let mut holes = BTreeSet::new();

        let mut indices: Vec<u32> = self.methods_by_index.keys().copied().collect();
        indices.sort_unstable();
        for index in indices {
            let bucket_offset = index << BUCKET_SIZE_SHIFT;
            if bucket_offset > end_offset {
                holes.insert(Hole {
                    start: end_offset,
                    end: bucket_offset,
                });
                end_offset = bucket_offset;
            }
            for &sel in &self.methods_by_index[&index] {
                let size = arena.get(sel).size();
                arena.get_mut(sel).offset = end_offset;
                end_offset += size;
            }
        }

        hole_map.set_state(holes, end_offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraint(mask: u32, shift: u32, allowed: &[u32]) -> Constraint {
        Constraint {
            mask,
            shift,
            allowed_values: allowed.iter().copied().collect(),
        }
    }

    #[test]
    fn magic_selector_is_entry_zero() {
        let arena = SelectorArena::new();
        assert_eq!(arena.lookup(MAGIC_SELECTOR), Some(0));
        assert_eq!(arena.get(0).offset, 0);
        assert_eq!(arena.get(0).size(), 5); // 4 UTF-8 bytes + NUL
    }

    #[test]
    fn interning_dedupes() {
        let mut arena = SelectorArena::new();
        let a = arena.intern("foo");
        let b = arena.intern("foo");
        assert_eq!(a, b);
        assert_ne!(arena.intern("bar"), a);
    }

    #[test]
    fn constraint_same_range() {
        let a = constraint(0x3, 2, &[0, 1, 2]);
        let b = constraint(0x3, 2, &[1, 2, 3]);
        let merged = a.intersecting(&b);
        assert_eq!(merged.mask, 0x3);
        assert_eq!(merged.shift, 2);
        let mut values: Vec<u32> = merged.allowed_values.into_iter().collect();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn constraint_nested_range() {
        // outer covers bits 2..6, inner covers bits 3..5
        let outer = constraint(0xF, 2, &[0b1010, 0b0110]);
        let inner = constraint(0x3, 3, &[0b01]);
        let merged = outer.intersecting(&inner);
        assert_eq!(merged.mask, 0xF);
        assert_eq!(merged.shift, 2);
        // 0b1010 has bits 3..5 = 0b01; 0b0110 has 0b11
        assert!(merged.allowed_values.contains(&0b1010));
        assert!(!merged.allowed_values.contains(&0b0110));
    }

    #[test]
    fn constraint_disjoint_ranges() {
        // high: bits 4..6, low: bits 0..2
        let high = constraint(0x3, 4, &[0b10]);
        let low = constraint(0x3, 0, &[0b01]);
        let merged = high.intersecting(&low);
        assert_eq!(merged.shift, 0);
        // any merged value must have bits4..6 = 0b10 and bits0..2 = 0b01
        for &v in &merged.allowed_values {
            assert_eq!((v >> 4) & 0x3, 0b10);
            assert_eq!(v & 0x3, 0b01);
        }
        // free bits 2..4 enumerate fully: 4 combinations
        assert_eq!(merged.allowed_values.len(), 4);
    }

    #[test]
    fn constraint_overlapping_ranges() {
        // a: bits 2..6 (mask 0xF shift 2), b: bits 0..4 (mask 0xF shift 0);
        // overlap is bits 2..4.
        let a = constraint(0xF, 2, &[0b0011]); // bits2..4 = 0b11
        let b = constraint(0xF, 0, &[0b1100, 0b0100]); // bits2..4 = 0b11 / 0b01
        let merged = a.intersecting(&b);
        assert_eq!(merged.shift, 0);
        // Only b = 0b1100 is compatible; merged value = a << 2 | b
        assert_eq!(merged.allowed_values.len(), 1);
        assert!(merged.allowed_values.contains(&(0b0011 << 2 | 0b1100)));
    }

    #[test]
    fn hole_map_best_fit() {
        let mut map = HoleMap::new();
        // Fresh map: magic selector only, everything appends.
        assert_eq!(map.add_string_of_size(10), 5);
        assert_eq!(map.add_string_of_size(3), 15);
        assert_eq!(map.end_address(), 18);

        let mut holes = BTreeSet::new();
        holes.insert(Hole { start: 20, end: 30 });
        holes.insert(Hole { start: 40, end: 44 });
        map.set_state(holes, 50);
        // 4-byte request best-fits the 4-byte hole, not the 10-byte one.
        assert_eq!(map.add_string_of_size(4), 40);
        // 8-byte request goes into the 10-byte hole, leaving a 2-byte hole.
        assert_eq!(map.add_string_of_size(8), 20);
        assert_eq!(map.total_hole_size(), 2);
    }

    #[test]
    fn bucket_overflow_rules() {
        let mut space = AddressSpace::default();
        let long_selector = Selector {
            name: "x".repeat(200),
            classes: Vec::new(),
            fixed_bits_mask: 0,
            in_progress_bucket_index: 0,
            offset: 0,
        };
        let short_selector = Selector {
            name: "short".to_string(),
            classes: Vec::new(),
            fixed_bits_mask: 0,
            in_progress_bucket_index: 0,
            offset: 0,
        };
        // A 201-byte selector fits at bucket 5 because 6+ are unassigned.
        assert!(space.can_place_method_at_index(&long_selector, 5));
        space.place_method_at_index(0, long_selector.size(), 5);
        // Bucket 6 is now the overflow cell: placing there would overlap.
        assert!(!space.can_place_method_at_index(&short_selector, 6));
        // Bucket 7 is past the spill (201 < 128 - something + 128*2), fine.
        assert!(space.can_place_method_at_index(&short_selector, 7));
        // A second long selector right after the first is refused.
        assert!(!space.can_place_method_at_index(&long_selector, 6));
    }

    #[test]
    fn low_bits_packing_and_holes() {
        let mut arena = SelectorArena::new();
        let a = arena.intern("aaaa");
        let b = arena.intern("bb");
        let c = arena.intern("cccccc");
        let mut space = AddressSpace::default();
        space.place_method_at_index(a, arena.get(a).size(), 0);
        space.place_method_at_index(b, arena.get(b).size(), 0);
        space.place_method_at_index(c, arena.get(c).size(), 2);
        let mut hole_map = HoleMap::new();
        space.compute_low_bits(&mut arena, &mut hole_map);

        assert_eq!(arena.get(a).offset, 5);
        assert_eq!(arena.get(b).offset, 10);
        assert_eq!(arena.get(c).offset, 2 << BUCKET_SIZE_SHIFT);
        // Gap between end of bucket-0 contents and bucket 2 is a hole.
        assert_eq!(hole_map.total_hole_size(), (2 << BUCKET_SIZE_SHIFT) - 13);
        // End address sits right after the last selector.
        assert_eq!(hole_map.end_address(), (2 << BUCKET_SIZE_SHIFT) + 7);
    }
}
