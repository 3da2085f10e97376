/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Objective-C optimization: selector placement and IMP caches.
//!
//! The cache builder gives every method-name string in the cache a carefully
//! chosen address, such that for each participating class, a single
//! `(sel_address >> shift) & mask` indexes a collision-free per-class hash
//! table (an "IMP cache"). The runtime can then dispatch without probing.
//!
//! [selectors] holds the address-space model: selectors with partially frozen
//! address bits, the 128-byte buckets they are packed into, and the hole map
//! left over for strings that don't participate. [imp_caches] holds the
//! backtracking solver that picks a `(shift, mask)` per class and freezes
//! selector bits, and [metadata] reads class/category/method-list structures
//! out of input binaries.

pub mod imp_caches;
pub mod metadata;
pub mod selectors;

/// Identifies a class or metaclass by name. The same name can exist as both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassKey {
    pub name: String,
    pub metaclass: bool,
}

impl std::fmt::Display for ClassKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({})",
            self.name,
            if self.metaclass { "metaclass" } else { "class" }
        )
    }
}
