/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The IMP-cache solver.
//!
//! For every class that should get an IMP cache, pick `(shift, needed_bits)`
//! and freeze bits of its selectors' addresses so that
//! `(sel_address >> shift) & ((1 << needed_bits) - 1)` is collision-free
//! within the class. This is a greedy iterative backtracker: classes are
//! placed in importance order, failures backtrack with doubling depth, and
//! after too many consecutive failures we reset to the best snapshot seen so
//! far and drop the class at the frontier.
//!
//! Dropping cascades through "flattening hierarchies": the runtime can only
//! invalidate inlined caches if every member of the hierarchy has one, so one
//! dropped member drops them all.

use super::selectors::{
    AddressSpace, ClassId, Constraint, ConstraintSet, HoleMap, SelId, SelectorArena,
    MAX_BUCKET_INDEX,
};
use super::ClassKey;
use crate::diagnostics::Diagnostics;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap};

/// Bytes one IMP-cache hash table occupies in the cache: an 8-byte header
/// followed by one `(sel_offset: u32, imp_offset: u32)` pair per slot.
pub fn size_for_imp_cache_with_count(count: u32) -> u64 {
    8 + count as u64 * 8
}

/// One method entry in a class's future cache.
#[derive(Debug, Clone)]
pub struct Method {
    pub selector: SelId,
    /// Dylib providing the implementation.
    pub install_name: String,
    /// Class the implementation comes from (differs from the cache's class
    /// for inlined methods).
    pub class_name: String,
    pub category_name: Option<String>,
    /// Implementation address in the providing dylib's original addresses.
    pub imp: u64,
    pub was_inlined: bool,
    pub from_flattening: bool,
}

/// Where a flattening root's superclass lives, so the optimizer can find its
/// final address later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLocator {
    pub install_name: String,
    pub segment_index: u32,
    pub segment_offset: u64,
}

#[derive(Debug, Clone)]
pub struct ClassData {
    pub key: ClassKey,
    /// Dylib defining the class.
    pub install_name: String,
    pub methods: Vec<Method>,
    /// Cleared when the class is dropped, or when the class only exists to
    /// track category attachment for children.
    pub should_generate_imp_cache: bool,
    /// Class name defined in more than one image (or child of one).
    pub is_part_of_duplicate_set: bool,
    /// Set when the drop came from a flattening cascade, so a snapshot
    /// restore doesn't resurrect it.
    pub dropped_because_flattening_superclass_was_dropped: bool,
    pub needed_bits: u32,
    pub shift: u32,
    pub flattening_root_name: Option<String>,
    pub flattened_superclasses: BTreeSet<String>,
    pub flattening_root_superclass: Option<ClassLocator>,
}

/// One `(shift, needed_bits)` possibility for a class, ordered so tighter
/// tables and fewer newly-frozen bits come first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PlacementAttempt {
    pub needed_bits: u32,
    pub number_of_bits_to_set: u32,
    pub shift: u32,
}

impl PlacementAttempt {
    pub fn mask(&self) -> u32 {
        (1 << self.needed_bits) - 1
    }
}

/// Undo record for one applied attempt.
#[derive(Debug, Clone)]
pub struct PreviousState {
    needed_bits: u32,
    shift: u32,
    methods: Vec<(SelId, u32, u32)>, // (selector, bucket index, fixed mask)
}

impl ClassData {
    pub fn new(key: ClassKey, install_name: &str) -> ClassData {
        ClassData {
            key,
            install_name: install_name.to_string(),
            methods: Vec::new(),
            should_generate_imp_cache: true,
            is_part_of_duplicate_set: false,
            dropped_because_flattening_superclass_was_dropped: false,
            needed_bits: 0,
            shift: 0,
            flattening_root_name: None,
            flattened_superclasses: BTreeSet::new(),
            flattening_root_superclass: None,
        }
    }

    pub fn modulo(&self) -> u32 {
        1 << self.needed_bits
    }

    pub fn mask(&self) -> u32 {
        self.modulo() - 1
    }

    /// Compute `needed_bits` once the method list is final.
    pub fn did_finish_adding_methods(&mut self) {
        self.needed_bits = needed_bits_for_count(self.methods.len());
    }

    /// Did placement have to grow the table beyond the minimum size?
    pub fn had_to_increase_size(&self) -> bool {
        !self.methods.is_empty() && self.needed_bits > needed_bits_for_count(self.methods.len())
    }

    pub fn size_in_shared_cache(&self) -> u64 {
        size_for_imp_cache_with_count(self.modulo())
    }

    fn attempt_for_shift(
        &self,
        arena: &SelectorArena,
        shift: u32,
        needed_bits: u32,
    ) -> PlacementAttempt {
        let mask = (1u32 << needed_bits) - 1;
        let number_of_bits_to_set = self
            .methods
            .iter()
            .map(|m| arena.get(m.selector).number_of_bits_to_set(shift, mask))
            .sum();
        PlacementAttempt {
            needed_bits,
            number_of_bits_to_set,
            shift,
        }
    }

    /// All placement possibilities, sorted. Tables may grow by one bit; the
    /// shift+mask window must stay inside the 17 bucket-index bits.
    pub fn attempts(&self, arena: &SelectorArena) -> Vec<PlacementAttempt> {
        let mut attempts = Vec::new();
        for needed_bits in [self.needed_bits, self.needed_bits + 1] {
            if needed_bits > 17 {
                continue;
            }
            for shift in 0..=(17 - needed_bits) {
                attempts.push(self.attempt_for_shift(arena, shift, needed_bits));
            }
        }
        attempts.sort();
        attempts
    }

    /// Try an attempt: give every selector a slot compatible with its frozen
    /// bits, no two selectors sharing one. On success the chosen bits are
    /// frozen and an undo record returned.
    pub fn apply_attempt(
        &mut self,
        attempt: &PlacementAttempt,
        rng_seed: u64,
        arena: &mut SelectorArena,
    ) -> Option<PreviousState> {
        let mut sorted_methods: Vec<SelId> = self.methods.iter().map(|m| m.selector).collect();
        sorted_methods.sort_by_key(|&sel| {
            arena
                .get(sel)
                .number_of_bits_to_set(attempt.shift, attempt.mask())
        });

        let modulo = 1usize << attempt.needed_bits;
        let mut slots: Vec<Option<SelId>> = vec![None; modulo];
        let mut rng = SmallRng::seed_from_u64(rng_seed);

        let mut chosen = Vec::with_capacity(sorted_methods.len());
        for &sel in &sorted_methods {
            let selector = arena.get(sel);
            let shifted_mask = attempt.mask() << attempt.shift;
            if selector.fixed_bits_mask & shifted_mask == shifted_mask {
                // All bits decided already; the slot is forced.
                let index =
                    ((selector.in_progress_bucket_index >> attempt.shift) & attempt.mask()) as usize;
                if slots[index].is_some() {
                    return None;
                }
                slots[index] = Some(sel);
                chosen.push(index as u32);
            } else {
                // Shuffle the candidate slots so different classes constrain
                // different bit ranges.
                let mut candidates: Vec<u32> = (0..modulo as u32).collect();
                candidates.shuffle(&mut rng);
                let mut found = false;
                for &candidate in &candidates {
                    let future = selector.in_progress_bucket_index | (candidate << attempt.shift);
                    let slot = ((future >> attempt.shift) & attempt.mask()) as usize;
                    let compatible = future & selector.fixed_bits_mask
                        == selector.in_progress_bucket_index & selector.fixed_bits_mask;
                    if compatible && slots[slot].is_none() {
                        slots[slot] = Some(sel);
                        chosen.push(candidate);
                        found = true;
                        break;
                    }
                }
                if !found {
                    return None;
                }
            }
        }

        // Success: freeze bits, record how to undo.
        let mut previous_methods = Vec::with_capacity(sorted_methods.len());
        for (i, &sel) in sorted_methods.iter().enumerate() {
            let selector = arena.get_mut(sel);
            previous_methods.push((
                sel,
                selector.in_progress_bucket_index,
                selector.fixed_bits_mask,
            ));
            selector.in_progress_bucket_index |= chosen[i] << attempt.shift;
            selector.fixed_bits_mask |= attempt.mask() << attempt.shift;
        }
        let previous = PreviousState {
            needed_bits: self.needed_bits,
            shift: self.shift,
            methods: previous_methods,
        };
        self.shift = attempt.shift;
        self.needed_bits = attempt.needed_bits;
        Some(previous)
    }

    /// Restore selector addresses and the class's shift/mask as they were
    /// before the given attempt.
    pub fn backtrack(&mut self, previous: &PreviousState, arena: &mut SelectorArena) {
        for &(sel, index, mask) in &previous.methods {
            let selector = arena.get_mut(sel);
            selector.in_progress_bucket_index = index;
            selector.fixed_bits_mask = mask;
        }
        self.shift = previous.shift;
        self.needed_bits = previous.needed_bits;
    }

    /// All methods land in distinct slots.
    pub fn check_consistency(&self, arena: &SelectorArena) -> bool {
        let mut slots = vec![false; self.modulo() as usize];
        for method in &self.methods {
            let selector = arena.get(method.selector);
            let slot = ((selector.in_progress_bucket_index >> self.shift) & self.mask()) as usize;
            if slots[slot] {
                return false;
            }
            slots[slot] = true;
        }
        true
    }

    /// The slots still open for `method` given where the other selectors
    /// already landed.
    pub fn constraint_for_method(&self, method: SelId, arena: &SelectorArena) -> Constraint {
        let mut slots = vec![false; self.modulo() as usize];
        for other in &self.methods {
            if other.selector == method {
                continue;
            }
            let selector = arena.get(other.selector);
            let slot = ((selector.in_progress_bucket_index >> self.shift) & self.mask()) as usize;
            debug_assert!(!slots[slot]);
            slots[slot] = true;
        }
        let allowed_values = (0..self.modulo()).filter(|&i| !slots[i as usize]).collect();
        Constraint {
            mask: self.mask(),
            shift: self.shift,
            allowed_values,
        }
    }
}

fn needed_bits_for_count(count: usize) -> u32 {
    if count == 0 {
        0
    } else {
        (count as u32).next_power_of_two().trailing_zeros()
    }
}

enum AttemptOutcome {
    Skipped,
    Placed(PreviousState),
}

/// One frame of the backtracking stack.
struct BacktrackingState {
    current_attempt_index: usize,
    attempts: Vec<PlacementAttempt>,
    outcome: Option<AttemptOutcome>,
    /// Seed used when (re)applying this frame's attempt, so snapshot
    /// restores replay the exact same shuffles.
    rng_seed: u64,
}

impl BacktrackingState {
    fn same_decision(&self, other: &BacktrackingState) -> bool {
        // Attempt lists are identical for the same class index, no need to
        // compare them.
        self.current_attempt_index == other.current_attempt_index
            && self.rng_seed == other.rng_seed
    }

    fn shallow_clone(&self) -> BacktrackingState {
        BacktrackingState {
            current_attempt_index: self.current_attempt_index,
            attempts: self.attempts.clone(),
            outcome: match self.outcome {
                Some(AttemptOutcome::Skipped) => Some(AttemptOutcome::Skipped),
                // Undo info is rebuilt when the snapshot is replayed.
                Some(AttemptOutcome::Placed(_)) => Some(AttemptOutcome::Skipped),
                None => None,
            },
            rng_seed: self.rng_seed,
        }
    }
}

/// Builds IMP caches for every dylib in the cache.
pub struct ImpCachesBuilder {
    pub classes: Vec<ClassData>,
    pub selectors: SelectorArena,
    /// The 128-byte bucket assignment; kept so the hole map can be
    /// regenerated after an overflow retry without moving any selector.
    pub address_space: AddressSpace,
    /// Importance rank per class key (lower = placed earlier).
    importance: HashMap<ClassKey, usize>,
    /// Consecutive failures before resetting to the best snapshot.
    max_backtracking_attempts: u32,
}

impl ImpCachesBuilder {
    pub fn new() -> ImpCachesBuilder {
        ImpCachesBuilder {
            classes: Vec::new(),
            selectors: SelectorArena::new(),
            address_space: AddressSpace::default(),
            importance: HashMap::new(),
            max_backtracking_attempts: 10,
        }
    }

    pub fn add_class(&mut self, class: ClassData, importance: usize) -> ClassId {
        let id = self.classes.len();
        self.importance.insert(class.key.clone(), importance);
        self.classes.push(class);
        id
    }

    pub fn add_method_to_class(&mut self, class_id: ClassId, mut method: Method) {
        // A selector can only occupy one slot; duplicate entries (e.g. a
        // category overriding the base class) replace rather than collide.
        let class = &mut self.classes[class_id];
        if let Some(existing) = class
            .methods
            .iter_mut()
            .find(|m| m.selector == method.selector)
        {
            std::mem::swap(existing, &mut method);
            return;
        }
        class.methods.push(method);
        let sel = class.methods.last().unwrap().selector;
        if !self.selectors.get(sel).classes.contains(&class_id) {
            self.selectors.get_mut(sel).classes.push(class_id);
        }
    }

    /// Classes that still want a cache, in importance order. Stable on the
    /// key so equal ranks tie-break deterministically.
    fn placeable_classes(&self) -> Vec<ClassId> {
        let mut ids: Vec<ClassId> = (0..self.classes.len())
            .filter(|&id| {
                let c = &self.classes[id];
                !c.methods.is_empty() && c.should_generate_imp_cache
            })
            .collect();
        ids.sort_by(|&a, &b| {
            let ka = &self.classes[a].key;
            let kb = &self.classes[b].key;
            let ra = self.importance.get(ka).copied().unwrap_or(usize::MAX);
            let rb = self.importance.get(kb).copied().unwrap_or(usize::MAX);
            ra.cmp(&rb)
                .then_with(|| ka.metaclass.cmp(&kb.metaclass))
                .then_with(|| ka.name.cmp(&kb.name))
        });
        ids
    }

    fn classes_in_same_flattening_hierarchy(&self, parent: ClassId) -> Vec<ClassId> {
        let parent_class = &self.classes[parent];
        let Some(parent_super) = &parent_class.flattening_root_superclass else {
            return Vec::new();
        };
        (0..self.classes.len())
            .filter(|&id| {
                if id == parent {
                    return false;
                }
                let c = &self.classes[id];
                c.flattening_root_superclass.as_ref() == Some(parent_super)
                    && c.flattening_root_name == parent_class.flattening_root_name
                    && c.flattened_superclasses.contains(&parent_class.key.name)
            })
            .collect()
    }

    fn drop_class_and_hierarchy(
        &mut self,
        diag: &Diagnostics,
        class_id: ClassId,
        dropped: &mut i32,
        reason: &str,
    ) {
        diag.verbose(format!(
            "dropping class {} because {}",
            self.classes[class_id].key, reason
        ));
        self.classes[class_id].should_generate_imp_cache = false;
        *dropped += 1;
        for other in self.classes_in_same_flattening_hierarchy(class_id) {
            let c = &mut self.classes[other];
            if c.should_generate_imp_cache {
                c.should_generate_imp_cache = false;
                c.dropped_because_flattening_superclass_was_dropped = true;
                *dropped += 1;
                diag.verbose(format!(
                    "also dropping {} in the same flattening hierarchy",
                    c.key
                ));
            }
        }
    }

    /// Phase one: assign a shift and mask to every class, freezing selector
    /// bucket-index bits along the way.
    pub fn find_shifts_and_masks(&mut self, diag: &mut Diagnostics) -> i32 {
        // Seeds are drawn from a counter so replaying a snapshot frame
        // replays its exact shuffles. Reset per call: an overflow retry must
        // reproduce the same placement.
        let mut next_rng_seed: u64 = 0;

        let all_classes = self.placeable_classes();
        let mut stack: Vec<BacktrackingState> = Vec::new();
        let mut best_snapshot: Vec<BacktrackingState> = Vec::new();
        let mut current_class_index = 0usize;
        let mut backtracking_length = 1usize;
        let mut backtracking_attempts = 0u32;
        let mut dropped = 0i32;

        while current_class_index < all_classes.len() {
            debug_assert!(
                current_class_index == stack.len() || current_class_index == stack.len() - 1
            );
            let class_id = all_classes[current_class_index];

            if !self.classes[class_id].should_generate_imp_cache {
                self.drop_class_skipped(&mut stack, &mut current_class_index, &mut dropped);
                continue;
            }
            if self.classes[class_id].is_part_of_duplicate_set {
                self.drop_class_and_hierarchy(
                    diag,
                    class_id,
                    &mut dropped,
                    "it is part of a duplicate set",
                );
                self.push_skipped_frame(&mut stack, &mut current_class_index);
                continue;
            }

            if current_class_index >= stack.len() {
                stack.push(BacktrackingState {
                    current_attempt_index: 0,
                    attempts: self.classes[class_id].attempts(&self.selectors),
                    outcome: None,
                    rng_seed: 0,
                });
            } else {
                // Backtracked here: skip the attempt tried before.
                stack[current_class_index].current_attempt_index += 1;
            }

            let mut placed = false;
            let start = stack[current_class_index].current_attempt_index;
            for attempt_index in start..stack[current_class_index].attempts.len() {
                let seed = next_rng_seed;
                next_rng_seed += 1;
                let attempt = stack[current_class_index].attempts[attempt_index].clone();
                if let Some(previous) =
                    self.classes[class_id].apply_attempt(&attempt, seed, &mut self.selectors)
                {
                    if current_class_index % 1000 == 0 {
                        diag.verbose(format!(
                            "[IMP caches] placed {} / {} classes",
                            current_class_index,
                            all_classes.len()
                        ));
                    }
                    let frame = &mut stack[current_class_index];
                    frame.outcome = Some(AttemptOutcome::Placed(previous));
                    frame.current_attempt_index = attempt_index;
                    frame.rng_seed = seed;
                    placed = true;
                    break;
                }
            }

            if placed {
                current_class_index += 1;
                continue;
            }

            // This frame never stuck; remove it before unwinding.
            stack.pop();
            backtracking_attempts += 1;

            if backtracking_attempts > self.max_backtracking_attempts {
                self.reset_to_snapshot(&mut stack, &best_snapshot, &all_classes, &mut dropped);
                diag.verbose(format!(
                    "reset to snapshot of {} classes",
                    best_snapshot.len()
                ));
                current_class_index = stack.len();
                let frontier = all_classes[current_class_index];
                self.drop_class_and_hierarchy(
                    diag,
                    frontier,
                    &mut dropped,
                    "it's too difficult to place",
                );
                self.push_skipped_frame(&mut stack, &mut current_class_index);
                backtracking_attempts = 0;
                continue;
            }

            if current_class_index > best_snapshot.len() {
                best_snapshot = stack.iter().map(|s| s.shallow_clone()).collect();
            }
            assert!(current_class_index != 0, "no placement solution at all");
            let steps = backtracking_length.min(current_class_index);
            for _ in 0..steps {
                self.backtrack_one(&mut stack, &all_classes, &mut dropped);
                current_class_index -= 1;
            }
            backtracking_length = (backtracking_length * 2)
                .min(current_class_index.max(1))
                .min(1024)
                .max(1);
        }

        if dropped > 0 {
            diag.verbose(format!(
                "dropped {} classes that were too difficult to place",
                dropped
            ));
        }
        dropped
    }

    fn push_skipped_frame(&mut self, stack: &mut Vec<BacktrackingState>, index: &mut usize) {
        stack.push(BacktrackingState {
            current_attempt_index: 0,
            attempts: Vec::new(),
            outcome: Some(AttemptOutcome::Skipped),
            rng_seed: 0,
        });
        *index += 1;
    }

    fn drop_class_skipped(
        &mut self,
        stack: &mut Vec<BacktrackingState>,
        index: &mut usize,
        dropped: &mut i32,
    ) {
        *dropped += 1;
        self.push_skipped_frame(stack, index);
    }

    fn backtrack_one(
        &mut self,
        stack: &mut Vec<BacktrackingState>,
        all_classes: &[ClassId],
        dropped: &mut i32,
    ) {
        let i = stack.len() - 1;
        let frame = stack.pop().unwrap();
        match frame.outcome {
            Some(AttemptOutcome::Placed(previous)) => {
                let class_id = all_classes[i];
                self.classes[class_id].backtrack(&previous, &mut self.selectors);
            }
            Some(AttemptOutcome::Skipped) | None => {
                *dropped -= 1;
            }
        }
    }

    /// Rewind to the first frame that differs from the snapshot, then replay
    /// the snapshot's decisions (same attempt, same seed) forward.
    fn reset_to_snapshot(
        &mut self,
        stack: &mut Vec<BacktrackingState>,
        snapshot: &[BacktrackingState],
        all_classes: &[ClassId],
        dropped: &mut i32,
    ) {
        let mut first_different = stack.len().min(snapshot.len());
        for i in 0..first_different {
            if !stack[i].same_decision(&snapshot[i]) {
                first_different = i;
                break;
            }
        }
        while stack.len() > first_different {
            self.backtrack_one(stack, all_classes, dropped);
        }
        for frame in &snapshot[first_different..] {
            let i = stack.len();
            let class_id = all_classes[i];
            match frame.outcome {
                None | Some(AttemptOutcome::Skipped) if frame.attempts.is_empty() => {
                    // A frame with no attempts recorded a skipped class.
                    *dropped += 1;
                    stack.push(frame.shallow_clone());
                    continue;
                }
                _ => (),
            }
            let attempt = frame.attempts[frame.current_attempt_index].clone();
            let previous = self.classes[class_id]
                .apply_attempt(&attempt, frame.rng_seed, &mut self.selectors)
                .expect("snapshot replay must succeed");
            if !self.classes[class_id].dropped_because_flattening_superclass_was_dropped {
                // The drop may have happened during backtracking; this
                // snapshot had the class placed, so restore that.
                self.classes[class_id].should_generate_imp_cache = true;
            }
            stack.push(BacktrackingState {
                current_attempt_index: frame.current_attempt_index,
                attempts: frame.attempts.clone(),
                outcome: Some(AttemptOutcome::Placed(previous)),
                rng_seed: frame.rng_seed,
            });
        }
    }

    /// Phase two: shuffle selectors between 128-byte buckets until string
    /// sizes fit, dropping classes whose selectors cannot be placed.
    pub fn solve_given_shifts_and_masks(
        &mut self,
        address_space: &mut AddressSpace,
        diag: &mut Diagnostics,
    ) -> i32 {
        let all_classes = self.placeable_classes();
        let mut had_to_increase_size = 0;
        for &class_id in &all_classes {
            let class = &self.classes[class_id];
            for method in &class.methods {
                let selector = self.selectors.get(method.selector);
                debug_assert_eq!(
                    (selector.fixed_bits_mask >> class.shift) & class.mask(),
                    class.mask()
                );
            }
            debug_assert!(class.check_consistency(&self.selectors));
            if class.had_to_increase_size() {
                had_to_increase_size += 1;
            }
        }
        diag.verbose(format!(
            "[IMP caches] placed {} classes, increasing hash table size for {}",
            all_classes.len(),
            had_to_increase_size
        ));

        let mut methods: Vec<SelId> = self.selectors.interesting();
        // Most-constrained first: most frozen bits, then most classes.
        methods.sort_by(|&a, &b| {
            let sa = self.selectors.get(a);
            let sb = self.selectors.get(b);
            (sb.number_of_set_bits(), sb.classes.len(), &sb.name).cmp(&(
                sa.number_of_set_bits(),
                sa.classes.len(),
                &sa.name,
            ))
        });

        let mut rng = SmallRng::seed_from_u64(1);
        let mut dropped = 0;
        let mut constraints = ConstraintSet::default();
        for sel in methods {
            let selector = self.selectors.get(sel);
            if address_space.can_place_method_at_index(selector, selector.in_progress_bucket_index)
            {
                address_space.place_method_at_index(
                    sel,
                    selector.size(),
                    selector.in_progress_bucket_index,
                );
                continue;
            }

            // The preferred bucket is full; look for another index satisfying
            // every class's constraint.
            constraints.clear();
            let classes = selector.classes.clone();
            let mut at_least_one_constraint = false;
            for &class_id in &classes {
                if !self.classes[class_id].should_generate_imp_cache {
                    continue;
                }
                at_least_one_constraint = true;
                constraints.add(self.classes[class_id].constraint_for_method(sel, &self.selectors));
            }
            if !at_least_one_constraint {
                // Only used by classes we just dropped.
                continue;
            }

            let merged = constraints.merged.clone().unwrap();
            let mut placed = false;
            if !merged.allowed_values.is_empty() {
                let modulo = merged.mask + 1;
                let multiplier = 1u32 << merged.shift;
                // Candidate indices are ((base * modulo + allowed) << shift) | low.
                // Walk bases in random order so small addresses don't fill up
                // first and strand high-shift constraints.
                let base_count =
                    (((MAX_BUCKET_INDEX + 1) >> merged.shift) / modulo).max(1) as usize;
                let mut bases: Vec<u32> = (0..base_count as u32).collect();
                'search: for i in 0..base_count {
                    let pick = rng.gen_range(i..base_count);
                    bases.swap(i, pick);
                    let base = bases[i];
                    for &allowed in &merged.allowed_values {
                        for low in 0..multiplier {
                            let index = ((base * modulo + allowed) << merged.shift) | low;
                            if index >= MAX_BUCKET_INDEX {
                                continue;
                            }
                            let selector = self.selectors.get(sel);
                            if !address_space.can_place_method_at_index(selector, index) {
                                continue;
                            }
                            let size = selector.size();
                            self.selectors.get_mut(sel).in_progress_bucket_index = index;
                            address_space.place_method_at_index(sel, size, index);
                            placed = true;
                            break 'search;
                        }
                    }
                }
            }

            if !placed {
                diag.verbose(format!(
                    "failed to place {}",
                    self.selectors.get(sel).name
                ));
                for &class_id in &classes {
                    if self.classes[class_id].should_generate_imp_cache {
                        self.drop_class_and_hierarchy(
                            diag,
                            class_id,
                            &mut dropped,
                            "selectors too difficult to place",
                        );
                    }
                }
            }
        }

        if dropped == 0 {
            diag.verbose("[IMP caches] placed all methods");
        } else {
            diag.verbose(format!(
                "[IMP caches] finished placing methods, dropping {} classes",
                dropped
            ));
        }
        dropped
    }

    /// Remove classes that no longer generate caches (and selectors only they
    /// used) so later phases don't see them.
    pub fn remove_uninteresting_classes(&mut self, address_space: &mut AddressSpace) {
        for class_id in 0..self.classes.len() {
            let keep = {
                let c = &self.classes[class_id];
                c.should_generate_imp_cache
                    && (!c.methods.is_empty() || c.flattening_root_superclass.is_some())
            };
            if keep {
                continue;
            }
            for method_index in 0..self.classes[class_id].methods.len() {
                let sel = self.classes[class_id].methods[method_index].selector;
                self.selectors
                    .get_mut(sel)
                    .classes
                    .retain(|&c| c != class_id);
            }
        }
        address_space.remove_uninteresting_selectors(&self.selectors);
    }

    /// Total bytes the IMP-cache tables will occupy.
    pub fn total_imp_caches_size(&self) -> u64 {
        self.classes
            .iter()
            .filter(|c| c.should_generate_imp_cache && !c.methods.is_empty())
            .map(|c| c.size_in_shared_cache())
            .sum()
    }

    /// Main entry point: run both phases and assign final selector offsets.
    pub fn build_perfect_hashes(&mut self, hole_map: &mut HoleMap, diag: &mut Diagnostics) {
        let mut address_space = std::mem::take(&mut self.address_space);
        let dropped = self.find_shifts_and_masks(diag);
        if dropped > 0 {
            self.remove_uninteresting_classes(&mut address_space);
        }
        let dropped = self.solve_given_shifts_and_masks(&mut address_space, diag);
        if dropped > 0 {
            self.remove_uninteresting_classes(&mut address_space);
        }
        address_space.compute_low_bits(&mut self.selectors, hole_map);
        self.address_space = address_space;
    }

    /// Rebuild the hole map from the existing placement, without moving any
    /// selector. Used when an overflow retry clears the string pools.
    pub fn recompute_low_bits(&mut self, hole_map: &mut HoleMap) {
        let address_space = std::mem::take(&mut self.address_space);
        address_space.compute_low_bits(&mut self.selectors, hole_map);
        self.address_space = address_space;
    }
}

impl Default for ImpCachesBuilder {
    fn default() -> ImpCachesBuilder {
        ImpCachesBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(builder: &mut ImpCachesBuilder, name: &str) -> Method {
        let selector = builder.selectors.intern(name);
        Method {
            selector,
            install_name: "/usr/lib/libtest.dylib".to_string(),
            class_name: "Test".to_string(),
            category_name: None,
            imp: 0x4000,
            was_inlined: false,
            from_flattening: false,
        }
    }

    fn add_class(builder: &mut ImpCachesBuilder, name: &str, selectors: &[&str], rank: usize) {
        let class = ClassData::new(
            ClassKey {
                name: name.to_string(),
                metaclass: false,
            },
            "/usr/lib/libtest.dylib",
        );
        let id = builder.add_class(class, rank);
        for sel in selectors {
            let m = method(builder, sel);
            builder.add_method_to_class(id, m);
        }
        builder.classes[id].did_finish_adding_methods();
    }

    fn check_all_invariants(builder: &ImpCachesBuilder) {
        for class in &builder.classes {
            if !class.should_generate_imp_cache || class.methods.is_empty() {
                continue;
            }
            // Placement consistency: pairwise distinct slots, derived from
            // the final offsets.
            let mut seen = std::collections::HashSet::new();
            for m in &class.methods {
                let selector = builder.selectors.get(m.selector);
                let slot = (selector.offset >> 7 >> class.shift) & class.mask();
                // The bucket index (offset >> 7) must agree with the address
                // bits the solver froze.
                assert_eq!(
                    selector.offset >> 7,
                    selector.in_progress_bucket_index,
                    "selector {} moved after placement",
                    selector.name
                );
                assert!(
                    seen.insert(slot),
                    "slot collision in class {} at slot {}",
                    class.key,
                    slot
                );
            }
        }
    }

    #[test]
    fn needed_bits() {
        assert_eq!(needed_bits_for_count(0), 0);
        assert_eq!(needed_bits_for_count(1), 0);
        assert_eq!(needed_bits_for_count(2), 1);
        assert_eq!(needed_bits_for_count(3), 2);
        assert_eq!(needed_bits_for_count(4), 2);
        assert_eq!(needed_bits_for_count(5), 3);
    }

    #[test]
    fn attempts_are_ordered() {
        let mut builder = ImpCachesBuilder::new();
        add_class(&mut builder, "X", &["foo", "bar", "baz"], 0);
        let attempts = builder.classes[0].attempts(&builder.selectors);
        // 3 methods -> needed_bits 2, shifts 0..=15, plus needed_bits 3,
        // shifts 0..=14.
        assert_eq!(attempts.len(), 16 + 15);
        for pair in attempts.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(attempts[0].needed_bits, 2);
    }

    #[test]
    fn three_classes_sharing_selectors() {
        let mut builder = ImpCachesBuilder::new();
        add_class(&mut builder, "X", &["foo", "bar", "baz"], 0);
        add_class(&mut builder, "Y", &["foo", "bar", "baz"], 1);
        add_class(&mut builder, "Z", &["foo", "bar", "baz"], 2);
        let mut diag = Diagnostics::new(false);
        let mut hole_map = HoleMap::new();
        builder.build_perfect_hashes(&mut hole_map, &mut diag);

        for class in &builder.classes {
            assert!(class.should_generate_imp_cache);
            assert_eq!(class.needed_bits, 2, "class {}", class.key);
            assert!(class.check_consistency(&builder.selectors));
        }
        check_all_invariants(&builder);
        // Identical strings share one address.
        let foo = builder.selectors.lookup("foo").unwrap();
        assert_eq!(
            builder.selectors.lookup("foo").unwrap(),
            foo,
            "interning is stable"
        );
    }

    #[test]
    fn many_disjoint_classes_place_without_drops() {
        let mut builder = ImpCachesBuilder::new();
        let names: Vec<String> = (0..40).map(|i| format!("Class{}", i)).collect();
        for (rank, name) in names.iter().enumerate() {
            let sels: Vec<String> = (0..6).map(|j| format!("sel{}_{}", rank, j)).collect();
            let sel_refs: Vec<&str> = sels.iter().map(|s| s.as_str()).collect();
            add_class(&mut builder, name, &sel_refs, rank);
        }
        let mut diag = Diagnostics::new(false);
        let mut hole_map = HoleMap::new();
        builder.build_perfect_hashes(&mut hole_map, &mut diag);
        for class in &builder.classes {
            assert!(class.should_generate_imp_cache, "{}", class.key);
        }
        check_all_invariants(&builder);
    }

    #[test]
    fn overlapping_classes_stress() {
        // Heavily shared selectors force real backtracking behavior.
        let mut builder = ImpCachesBuilder::new();
        for rank in 0..20 {
            let name = format!("Shared{}", rank);
            let sels: Vec<String> = (0..8)
                .map(|j| format!("shared_sel_{}", (rank + j) % 12))
                .collect();
            let sel_refs: Vec<&str> = sels.iter().map(|s| s.as_str()).collect();
            add_class(&mut builder, &name, &sel_refs, rank);
        }
        let mut diag = Diagnostics::new(false);
        let mut hole_map = HoleMap::new();
        builder.build_perfect_hashes(&mut hole_map, &mut diag);
        // Not all classes need to survive, but the survivors must be
        // consistent and selector offsets unique.
        check_all_invariants(&builder);
        let mut offsets = std::collections::HashSet::new();
        for id in builder.selectors.interesting() {
            let s = builder.selectors.get(id);
            assert!(offsets.insert(s.offset), "offset reuse for {}", s.name);
        }
    }

    #[test]
    fn duplicate_set_classes_are_dropped() {
        let mut builder = ImpCachesBuilder::new();
        add_class(&mut builder, "Dup", &["foo", "bar"], 0);
        add_class(&mut builder, "Other", &["foo", "baz"], 1);
        builder.classes[0].is_part_of_duplicate_set = true;
        let mut diag = Diagnostics::new(false);
        let mut hole_map = HoleMap::new();
        builder.build_perfect_hashes(&mut hole_map, &mut diag);
        assert!(!builder.classes[0].should_generate_imp_cache);
        assert!(builder.classes[1].should_generate_imp_cache);
    }

    #[test]
    fn flattening_drop_cascades() {
        let mut builder = ImpCachesBuilder::new();
        add_class(&mut builder, "Root", &["foo"], 0);
        add_class(&mut builder, "Child", &["bar"], 1);
        let locator = ClassLocator {
            install_name: "/usr/lib/libtest.dylib".to_string(),
            segment_index: 1,
            segment_offset: 0x100,
        };
        for id in 0..2 {
            builder.classes[id].flattening_root_name = Some("Root".to_string());
            builder.classes[id].flattening_root_superclass = Some(locator.clone());
        }
        builder.classes[1]
            .flattened_superclasses
            .insert("Root".to_string());
        let mut diag = Diagnostics::new(false);
        let mut dropped = 0;
        builder.drop_class_and_hierarchy(&mut diag, 0, &mut dropped, "test");
        assert_eq!(dropped, 2);
        assert!(!builder.classes[1].should_generate_imp_cache);
        assert!(builder.classes[1].dropped_because_flattening_superclass_was_dropped);
    }

    #[test]
    fn imp_cache_sizing() {
        assert_eq!(size_for_imp_cache_with_count(4), 8 + 32);
        let mut builder = ImpCachesBuilder::new();
        add_class(&mut builder, "X", &["a", "b", "c"], 0);
        builder.classes[0].did_finish_adding_methods();
        assert_eq!(builder.classes[0].needed_bits, 2);
        assert_eq!(builder.total_imp_caches_size(), 8 + 4 * 8);
    }
}
