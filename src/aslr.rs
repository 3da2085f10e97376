/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Tracking of every pointer the cache will need to rebase at load time.
//!
//! The tracker is a dense bitmap over the union of the writable regions, one
//! bit per minimum-aligned pointer slot, plus sparse side tables for values
//! that can't live inside the pointer itself: TBI tag bytes, pointer
//! authentication data, and rebase targets too large for the in-place
//! chained-fixup field.
//!
//! The bitmap is atomic bytes: adjusters for different dylibs touch disjoint
//! writable pages, so concurrent `add`s land on different bytes, and even a
//! same-byte race would be a benign OR. The side tables sit behind a mutex;
//! writes to them are rare.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

/// Shared-cache fixups must be at least 4-byte aligned. (Kernel collections
/// would use 1 here; that variant is not built.)
pub const MINIMUM_FIXUP_ALIGNMENT: u64 = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AuthData {
    pub diversity: u16,
    pub addr_div: bool,
    pub key: u8,
}

#[derive(Default)]
struct SideTables {
    high8: HashMap<u64, u8>,
    auth: HashMap<u64, AuthData>,
    rebase_target32: HashMap<u64, u32>,
    rebase_target64: HashMap<u64, u64>,
}

/// All addresses are unslid cache addresses inside the data region span.
pub struct AslrTracker {
    region_start: u64,
    region_size: u64,
    bitmap: Vec<AtomicU8>,
    page_size: u32,
    enabled: bool,
    side: Mutex<SideTables>,
}

impl AslrTracker {
    pub fn new() -> AslrTracker {
        AslrTracker {
            region_start: 0,
            region_size: 0,
            bitmap: Vec::new(),
            page_size: 0x1000,
            enabled: true,
            side: Mutex::new(SideTables::default()),
        }
    }

    /// Cover `[start, start + size)`; size must be page-aligned.
    pub fn set_data_region(&mut self, start: u64, size: u64) {
        assert_eq!(size % self.page_size as u64, 0);
        self.region_start = start;
        self.region_size = size;
        let slots = size / MINIMUM_FIXUP_ALIGNMENT;
        let bytes = slots.div_ceil(8) as usize;
        self.bitmap = (0..bytes).map(|_| AtomicU8::new(0)).collect();
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn data_page_count(&self) -> u64 {
        self.region_size / self.page_size as u64
    }

    pub fn region_start(&self) -> u64 {
        self.region_start
    }

    fn slot(&self, addr: u64) -> u64 {
        assert!(
            addr >= self.region_start && addr < self.region_start + self.region_size,
            "tracked address {:#x} outside data regions",
            addr
        );
        let offset = addr - self.region_start;
        assert_eq!(
            offset % MINIMUM_FIXUP_ALIGNMENT,
            0,
            "tracked address {:#x} unaligned",
            addr
        );
        offset / MINIMUM_FIXUP_ALIGNMENT
    }

    pub fn add(&self, addr: u64) {
        if !self.enabled {
            return;
        }
        let slot = self.slot(addr);
        self.bitmap[(slot / 8) as usize].fetch_or(1 << (slot % 8), Ordering::Relaxed);
    }

    pub fn remove(&self, addr: u64) {
        if !self.enabled {
            return;
        }
        let slot = self.slot(addr);
        self.bitmap[(slot / 8) as usize].fetch_and(!(1 << (slot % 8)), Ordering::Relaxed);
        let mut side = self.side.lock().unwrap();
        side.high8.remove(&addr);
        side.auth.remove(&addr);
        side.rebase_target32.remove(&addr);
        side.rebase_target64.remove(&addr);
    }

    pub fn has(&self, addr: u64) -> bool {
        if addr < self.region_start || addr >= self.region_start + self.region_size {
            return false;
        }
        let slot = self.slot(addr);
        self.bitmap[(slot / 8) as usize].load(Ordering::Relaxed) & (1 << (slot % 8)) != 0
    }

    pub fn set_high8(&self, addr: u64, high8: u8) {
        self.side.lock().unwrap().high8.insert(addr, high8);
    }

    pub fn high8(&self, addr: u64) -> Option<u8> {
        self.side.lock().unwrap().high8.get(&addr).copied()
    }

    pub fn set_auth_data(&self, addr: u64, diversity: u16, addr_div: bool, key: u8) {
        self.side.lock().unwrap().auth.insert(
            addr,
            AuthData {
                diversity,
                addr_div,
                key,
            },
        );
    }

    pub fn auth_data(&self, addr: u64) -> Option<AuthData> {
        self.side.lock().unwrap().auth.get(&addr).copied()
    }

    pub fn set_rebase_target32(&self, addr: u64, target: u32) {
        self.side
            .lock()
            .unwrap()
            .rebase_target32
            .insert(addr, target);
    }

    pub fn rebase_target32(&self, addr: u64) -> Option<u32> {
        self.side.lock().unwrap().rebase_target32.get(&addr).copied()
    }

    pub fn set_rebase_target64(&self, addr: u64, target: u64) {
        self.side
            .lock()
            .unwrap()
            .rebase_target64
            .insert(addr, target);
    }

    pub fn rebase_target64(&self, addr: u64) -> Option<u64> {
        self.side.lock().unwrap().rebase_target64.get(&addr).copied()
    }

    /// All tracked addresses, ascending. For tests and map-file dumps.
    pub fn tracked_addresses(&self) -> Vec<u64> {
        let mut result = Vec::new();
        for (byte_index, byte) in self.bitmap.iter().enumerate() {
            let value = byte.load(Ordering::Relaxed);
            if value == 0 {
                continue;
            }
            for bit in 0..8 {
                if value & (1 << bit) != 0 {
                    let slot = byte_index as u64 * 8 + bit;
                    result.push(self.region_start + slot * MINIMUM_FIXUP_ALIGNMENT);
                }
            }
        }
        result
    }
}

impl Default for AslrTracker {
    fn default() -> AslrTracker {
        AslrTracker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> AslrTracker {
        let mut t = AslrTracker::new();
        t.set_data_region(0x1_C000_0000, 0x4000);
        t
    }

    #[test]
    fn add_has_remove() {
        let t = tracker();
        assert!(!t.has(0x1_C000_0008));
        t.add(0x1_C000_0008);
        assert!(t.has(0x1_C000_0008));
        assert!(!t.has(0x1_C000_000C));
        t.remove(0x1_C000_0008);
        assert!(!t.has(0x1_C000_0008));
    }

    #[test]
    fn side_tables_follow_removal() {
        let t = tracker();
        t.add(0x1_C000_0010);
        t.set_high8(0x1_C000_0010, 0xFE);
        t.set_rebase_target64(0x1_C000_0010, 0x2_0000_0000);
        assert_eq!(t.high8(0x1_C000_0010), Some(0xFE));
        t.remove(0x1_C000_0010);
        assert_eq!(t.high8(0x1_C000_0010), None);
        assert_eq!(t.rebase_target64(0x1_C000_0010), None);
    }

    #[test]
    fn auth_data_roundtrip() {
        let t = tracker();
        t.set_auth_data(0x1_C000_0020, 0xBEEF, true, 2);
        assert_eq!(
            t.auth_data(0x1_C000_0020),
            Some(AuthData {
                diversity: 0xBEEF,
                addr_div: true,
                key: 2
            })
        );
    }

    #[test]
    fn out_of_region_has_is_false() {
        let t = tracker();
        assert!(!t.has(0x1_8000_0000));
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn unaligned_add_panics() {
        let t = tracker();
        t.add(0x1_C000_0002);
    }

    #[test]
    fn tracked_addresses_ascend() {
        let t = tracker();
        t.add(0x1_C000_0100);
        t.add(0x1_C000_0004);
        t.add(0x1_C000_3FFC);
        assert_eq!(
            t.tracked_addresses(),
            vec![0x1_C000_0004, 0x1_C000_0100, 0x1_C000_3FFC]
        );
    }
}
