/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The segment adjuster: rewrites one dylib's insides for its new addresses.
//!
//! Binaries with split-seg v2 info carry an edge list describing every
//! cross-section reference; each edge is re-applied under the new layout.
//! Binaries without it fall back to walking their rebase metadata (opcodes
//! or chained-fixup starts) and the classic code-to-data delta list.
//!
//! After fixups, the dylib's link-edit is rebuilt in a fixed blob order and
//! its load commands are rewritten: stale commands (split-seg info, chained
//! fixups, code signature, rpaths) are deleted, everything else is
//! retargeted at the new addresses and file offsets.
//!
//! Every rebased slot ends up in one canonical intermediate form for the
//! slide-info emitters: the slot holds the full unslid target address, or
//! zero with the target parked in the tracker's side table when the
//! architecture's chain format could not have held it in place.

pub mod instructions;

use crate::aslr::AslrTracker;
use crate::coalesce::{CacheCoalescedText, DylibTextCoalescer, SectionOffsetMap};
use crate::endian::{get32, get64, read_uleb128, set32, set64};
use crate::layout::{CacheLayout, SegmentPlacement};
use crate::mach_o::fixups::{
    self, ChainedFixups, ChainedPointer, FixupIndex, RebaseLocation, DYLD_CHAINED_PTR_32,
    DYLD_CHAINED_PTR_64, DYLD_CHAINED_PTR_64_OFFSET, DYLD_CHAINED_PTR_ARM64E,
    DYLD_CHAINED_PTR_START_NONE, REBASE_TYPE_POINTER, REBASE_TYPE_TEXT_ABSOLUTE32,
};
use crate::mach_o::{
    ExportedSymbol, MachO, Nlist, EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE,
    EXPORT_SYMBOL_FLAGS_KIND_MASK, EXPORT_SYMBOL_FLAGS_REEXPORT,
    EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER, LC_CODE_SIGNATURE, LC_DATA_IN_CODE,
    LC_DYLD_CHAINED_FIXUPS, LC_DYLD_EXPORTS_TRIE, LC_DYLD_INFO, LC_DYLD_INFO_ONLY,
    LC_DYLIB_CODE_SIGN_DRS, LC_DYSYMTAB, LC_FUNCTION_STARTS, LC_ROUTINES_64, LC_RPATH,
    LC_SEGMENT, LC_SEGMENT_64, LC_SEGMENT_SPLIT_INFO, LC_SYMTAB,
};
use crate::trie::{self, TrieEntry};

// Split-seg v2 reference kinds.
const ADJ_V2_POINTER_32: u64 = 0x01;
const ADJ_V2_POINTER_64: u64 = 0x02;
const ADJ_V2_DELTA_32: u64 = 0x03;
const ADJ_V2_DELTA_64: u64 = 0x04;
const ADJ_V2_ARM64_ADRP: u64 = 0x05;
const ADJ_V2_ARM64_OFF12: u64 = 0x06;
const ADJ_V2_ARM64_BR26: u64 = 0x07;
const ADJ_V2_ARM_MOVW_MOVT: u64 = 0x08;
const ADJ_V2_ARM_BR24: u64 = 0x09;
const ADJ_V2_THUMB_MOVW_MOVT: u64 = 0x0A;
const ADJ_V2_THUMB_BR22: u64 = 0x0B;
const ADJ_V2_IMAGE_OFF_32: u64 = 0x0C;
const ADJ_V2_THREADED_POINTER_64: u64 = 0x0D;
const ADJ_V2_MAX_KIND: u64 = 0x0D;

/// In-place target limits of the chain formats; targets that would not have
/// fit go to the side tables (and the slot is zeroed).
const ARM64E_TARGET_LIMIT: u64 = 1 << 43;
const GENERIC64_TARGET_LIMIT: u64 = 1 << 36;

/// One section's translation state for the edge walk.
struct SectionContext {
    orig_address: u64,
    new_address: u64,
    slide: i64,
    /// Buffer offset of the section's copy (None when coalesced away).
    buffer_offset: Option<u64>,
    coalesced: Option<CoalescedContext>,
}

struct CoalescedContext {
    map: SectionOffsetMap,
    new_vmaddr: u64,
    pool_buffer_offset: u64,
    objc_tag: u64,
}

pub struct Adjustor<'a> {
    macho: &'a MachO,
    placements: &'a [SegmentPlacement],
    layout: &'a CacheLayout,
    coalescer: &'a DylibTextCoalescer,
    coalesced: &'a CacheCoalescedText,
    chained: Option<&'a ChainedFixups>,
}

impl<'a> Adjustor<'a> {
    pub fn new(
        dylib_index: usize,
        macho: &'a MachO,
        layout: &'a CacheLayout,
        fixup_index: &'a FixupIndex,
        coalescer: &'a DylibTextCoalescer,
        coalesced: &'a CacheCoalescedText,
    ) -> Adjustor<'a> {
        Adjustor {
            macho,
            placements: &layout.placements[dylib_index],
            layout,
            coalescer,
            coalesced,
            chained: fixup_index.chained.as_ref(),
        }
    }

    fn placement_for_segment(&self, segment_index: usize) -> Result<&SegmentPlacement, String> {
        self.placements
            .iter()
            .find(|p| p.segment_index == segment_index)
            .ok_or_else(|| format!("segment {} has no placement", segment_index))
    }

    /// Slide of the segment containing an original address.
    fn slide_for_orig_address(&self, addr: u64) -> Result<i64, String> {
        for segment in &self.macho.segments {
            if addr >= segment.vmaddr && addr < segment.vmaddr + segment.vmsize {
                let placement = self.placement_for_segment(segment.index)?;
                return Ok(placement.dst_unslid_address as i64 - segment.vmaddr as i64);
            }
        }
        Err(format!(
            "address {:#x} is not in any segment of {}",
            addr, self.macho.install_name
        ))
    }

    fn new_address_for_orig(&self, addr: u64) -> Result<u64, String> {
        Ok((addr as i64 + self.slide_for_orig_address(addr)?) as u64)
    }

    /// Adjust everything: content fixups, then link-edit, then load
    /// commands. Returns where the rebuilt link-edit blobs landed, for the
    /// link-edit merger.
    pub fn adjust_image(
        &self,
        buffer: &mut [u8],
        aslr: &AslrTracker,
        fixup_index: &FixupIndex,
    ) -> Result<AdjustedLinkedit, String> {
        if self.macho.has_split_seg_v2() {
            self.adjust_references_v2(buffer, aslr)?;
        } else if self.chained.is_some() {
            self.adjust_rebase_chains(buffer, aslr)?;
        } else {
            self.adjust_data_pointers(buffer, aslr, &fixup_index.rebases)?;
            self.adjust_code(buffer)?;
        }
        self.rebuild_linkedit_and_load_commands(buffer)
    }

    // --- canonical rebase-slot writers ---

    fn track_pointer64(
        &self,
        buffer: &mut [u8],
        aslr: &AslrTracker,
        buffer_offset: u64,
        new_slot_address: u64,
        new_target: u64,
        high8: u8,
        target_limit: u64,
    ) {
        if high8 != 0 {
            aslr.set_high8(new_slot_address, high8);
        }
        if new_target >= target_limit {
            aslr.set_rebase_target64(new_slot_address, new_target);
            set64(buffer, buffer_offset as usize, 0);
        } else {
            set64(buffer, buffer_offset as usize, new_target);
        }
        aslr.add(new_slot_address);
    }

    fn convert_chained_pointer(
        &self,
        buffer: &mut [u8],
        aslr: &AslrTracker,
        pointer_format: u16,
        buffer_offset: u64,
        new_slot_address: u64,
        target_slide: i64,
    ) -> Result<(), String> {
        let raw = get64(buffer, buffer_offset as usize);
        let decoded = ChainedPointer::decode(
            pointer_format,
            raw,
            self.macho.preferred_load_address(),
        )?;
        match decoded {
            ChainedPointer::Bind { .. } | ChainedPointer::AuthBind { .. } => {
                // Binds are resolved after all dylibs move.
                Ok(())
            }
            ChainedPointer::Rebase { target, high8, .. } => {
                let new_target = (target as i64 + target_slide) as u64;
                let limit = match pointer_format {
                    DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => GENERIC64_TARGET_LIMIT,
                    _ => ARM64E_TARGET_LIMIT,
                };
                self.track_pointer64(
                    buffer,
                    aslr,
                    buffer_offset,
                    new_slot_address,
                    new_target,
                    high8,
                    limit,
                );
                Ok(())
            }
            ChainedPointer::AuthRebase {
                target,
                diversity,
                addr_div,
                key,
                ..
            } => {
                let orig_target = self.macho.preferred_load_address() + target;
                let new_target = (orig_target as i64 + target_slide) as u64;
                aslr.set_auth_data(new_slot_address, diversity, addr_div, key);
                self.track_pointer64(
                    buffer,
                    aslr,
                    buffer_offset,
                    new_slot_address,
                    new_target,
                    0,
                    ARM64E_TARGET_LIMIT,
                );
                Ok(())
            }
        }
    }

    // --- split-seg v2 path ---

    fn build_section_contexts(&self) -> Result<Vec<SectionContext>, String> {
        let mut contexts = Vec::new();
        // Section index 0 is the mach_header.
        let text_placement = self.placement_for_segment(0)?;
        let text_segment = &self.macho.segments[0];
        contexts.push(SectionContext {
            orig_address: text_segment.vmaddr,
            new_address: text_placement.dst_unslid_address,
            slide: text_placement.dst_unslid_address as i64 - text_segment.vmaddr as i64,
            buffer_offset: Some(text_placement.dst_buffer_offset),
            coalesced: None,
        });

        for segment in &self.macho.segments {
            let placement = self.placement_for_segment(segment.index)?;
            let slide = placement.dst_unslid_address as i64 - segment.vmaddr as i64;
            for section in &segment.sections {
                if let Some(map) = self
                    .coalescer
                    .map_for_section(&section.segment_name, &section.name)
                    .filter(|m| !m.is_empty())
                {
                    let (new_vmaddr, objc_tag) = if section.name == "__cfstring" {
                        (self.coalesced.cf_strings.buffer_vmaddr, 0)
                    } else {
                        (
                            self.coalesced.string_section(&section.name).buffer_vmaddr,
                            0,
                        )
                    };
                    let pool_buffer_offset = self
                        .layout
                        .buffer_offset_for_address(new_vmaddr)
                        .ok_or_else(|| {
                            format!("coalesced pool for {} has no address", section.name)
                        })?;
                    contexts.push(SectionContext {
                        orig_address: section.addr,
                        new_address: 0,
                        slide: 0,
                        buffer_offset: None,
                        coalesced: Some(CoalescedContext {
                            map: map.clone(),
                            new_vmaddr,
                            pool_buffer_offset,
                            objc_tag,
                        }),
                    });
                } else {
                    let offset_in_segment = section.addr - segment.vmaddr;
                    contexts.push(SectionContext {
                        orig_address: section.addr,
                        new_address: placement.dst_unslid_address + offset_in_segment,
                        slide,
                        buffer_offset: Some(placement.dst_buffer_offset + offset_in_segment),
                        coalesced: None,
                    });
                }
            }
        }
        Ok(contexts)
    }

    fn adjust_references_v2(&self, buffer: &mut [u8], aslr: &AslrTracker) -> Result<(), String> {
        let blob = self
            .macho
            .split_seg_info
            .ok_or_else(|| "no split seg info".to_string())?;
        let info = blob.slice(&self.macho.bytes);
        if info.first() != Some(&crate::mach_o::DYLD_CACHE_ADJ_V2_FORMAT) {
            return Err(format!("malformed split seg info in {}", self.macho.install_name));
        }
        let contexts = self.build_section_contexts()?;
        let image_start = self.placement_for_segment(0)?.dst_unslid_address;

        // Whole          :== <count> FromToSection+
        // FromToSection  :== <from-sect-index> <to-sect-index> <count> ToOffset+
        // ToOffset       :== <to-sect-offset-delta> <count> FromOffset+
        // FromOffset     :== <kind> <count> <from-sect-offset-delta>+
        let mut pos = 1usize;
        let section_count = read_uleb128(info, &mut pos)?;
        for _ in 0..section_count {
            let mut movw_state: Option<(u64, u64, u64)> = None; // (kind, buffer offset, to addr)
            let from_section_index = read_uleb128(info, &mut pos)? as usize;
            let to_section_index = read_uleb128(info, &mut pos)? as usize;
            let to_offset_count = read_uleb128(info, &mut pos)?;
            if from_section_index >= contexts.len() || to_section_index >= contexts.len() {
                return Err("split seg section index out of range".to_string());
            }
            let mut to_section_offset: u64 = 0;
            for _ in 0..to_offset_count {
                let to_section_delta = read_uleb128(info, &mut pos)?;
                let from_offset_count = read_uleb128(info, &mut pos)?;
                to_section_offset = to_section_offset.wrapping_add(to_section_delta);
                for _ in 0..from_offset_count {
                    let kind = read_uleb128(info, &mut pos)?;
                    if kind > ADJ_V2_MAX_KIND {
                        return Err(format!(
                            "unknown split seg info v2 kind value ({}) in {}",
                            kind, self.macho.install_name
                        ));
                    }
                    let from_delta_count = read_uleb128(info, &mut pos)?;
                    let mut from_section_offset: u64 = 0;
                    for _ in 0..from_delta_count {
                        let delta = read_uleb128(info, &mut pos)?;
                        from_section_offset = from_section_offset.wrapping_add(delta);
                        self.adjust_reference(
                            buffer,
                            aslr,
                            kind,
                            &contexts[from_section_index],
                            &contexts[to_section_index],
                            from_section_offset,
                            to_section_offset,
                            image_start,
                            &mut movw_state,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn adjust_reference(
        &self,
        buffer: &mut [u8],
        aslr: &AslrTracker,
        kind: u64,
        from: &SectionContext,
        to: &SectionContext,
        from_offset: u64,
        to_offset: u64,
        image_start: u64,
        movw_state: &mut Option<(u64, u64, u64)>,
    ) -> Result<(), String> {
        // Where the target ended up.
        let to_old_address = to.orig_address + to_offset;
        let to_new_address = match &to.coalesced {
            Some(pool) => {
                let pool_offset = DylibTextCoalescer::translate_offset(&pool.map, to_offset as u32)
                    .ok_or_else(|| {
                        format!("no coalesced mapping for target offset {:#x}", to_offset)
                    })?;
                (pool.new_vmaddr + pool_offset as u64) | pool.objc_tag
            }
            None => to.new_address + to_offset,
        };
        let target_slide = to_new_address as i64 - to_old_address as i64;

        // Where the reference itself ended up.
        let from_old_address = from.orig_address + from_offset;
        let (from_buffer_offset, from_new_address) = match &from.coalesced {
            Some(pool) => {
                if kind != ADJ_V2_POINTER_64 && kind != ADJ_V2_THREADED_POINTER_64 {
                    return Err(format!(
                        "unsupported fixup kind {} inside coalesced section",
                        kind
                    ));
                }
                let pool_offset =
                    DylibTextCoalescer::translate_offset(&pool.map, from_offset as u32)
                        .ok_or_else(|| {
                            format!("no coalesced mapping for source offset {:#x}", from_offset)
                        })?;
                (
                    pool.pool_buffer_offset + pool_offset as u64,
                    pool.new_vmaddr + pool_offset as u64,
                )
            }
            None => {
                let base = from.buffer_offset.ok_or_else(|| {
                    "reference from a section with no copy".to_string()
                })?;
                (base + from_offset, from.new_address + from_offset)
            }
        };
        let adjust = target_slide - (from_new_address as i64 - from_old_address as i64);

        match kind {
            ADJ_V2_DELTA_32 => {
                let value = get32(buffer, from_buffer_offset as usize) as i32 as i64;
                let delta = value + adjust;
                if delta > i32::MAX as i64 || delta < i32::MIN as i64 {
                    return Err(format!(
                        "DELTA_32 can't be adjusted by {:#x} in {}",
                        adjust, self.macho.install_name
                    ));
                }
                set32(buffer, from_buffer_offset as usize, delta as i32 as u32);
            }
            ADJ_V2_DELTA_64 => {
                let value = get64(buffer, from_buffer_offset as usize);
                set64(
                    buffer,
                    from_buffer_offset as usize,
                    value.wrapping_add(adjust as u64),
                );
            }
            ADJ_V2_POINTER_32 => {
                match self.chained {
                    Some(chained) => {
                        if chained.pointer_format != DYLD_CHAINED_PTR_32 {
                            return Err(format!(
                                "unknown 32-bit chained fixup format {} in {}",
                                chained.pointer_format, self.macho.install_name
                            ));
                        }
                        let raw = get32(buffer, from_buffer_offset as usize) as u64;
                        if let ChainedPointer::Rebase { target, .. } =
                            ChainedPointer::decode(DYLD_CHAINED_PTR_32, raw, 0)?
                        {
                            // The 26-bit in-place target cannot hold a cache
                            // address; park it in the side table.
                            let new_target = (target as i64 + target_slide) as u64;
                            aslr.set_rebase_target32(from_new_address, new_target as u32);
                            set32(buffer, from_buffer_offset as usize, 0);
                            aslr.add(from_new_address);
                        }
                    }
                    None => {
                        let value = get32(buffer, from_buffer_offset as usize) as u64;
                        if to_new_address != (value as i64 + target_slide) as u64 {
                            return Err(format!(
                                "bad POINTER_32 value at {:#x} in {}",
                                from_new_address, self.macho.install_name
                            ));
                        }
                        set32(buffer, from_buffer_offset as usize, to_new_address as u32);
                        aslr.add(from_new_address);
                    }
                }
            }
            ADJ_V2_POINTER_64 => match self.chained {
                Some(chained) => {
                    self.convert_chained_pointer(
                        buffer,
                        aslr,
                        chained.pointer_format,
                        from_buffer_offset,
                        from_new_address,
                        target_slide,
                    )?;
                }
                None => {
                    let value = get64(buffer, from_buffer_offset as usize);
                    if to_new_address != (value as i64 + target_slide) as u64 {
                        return Err(format!(
                            "bad POINTER_64 value at {:#x} in {}",
                            from_new_address, self.macho.install_name
                        ));
                    }
                    let high8 = (to_new_address >> 56) as u8;
                    self.track_pointer64(
                        buffer,
                        aslr,
                        from_buffer_offset,
                        from_new_address,
                        to_new_address,
                        high8,
                        u64::MAX,
                    );
                }
            },
            ADJ_V2_THREADED_POINTER_64 => {
                // Old-style arm64e threaded rebase: same bit layout as the
                // arm64e chain format.
                self.convert_chained_pointer(
                    buffer,
                    aslr,
                    DYLD_CHAINED_PTR_ARM64E,
                    from_buffer_offset,
                    from_new_address,
                    target_slide,
                )?;
            }
            ADJ_V2_IMAGE_OFF_32 => {
                if adjust != 0 {
                    let value = to_new_address - image_start;
                    if value > u32::MAX as u64 {
                        return Err(format!(
                            "IMAGE_OFF_32 can't reach {:#x} in {}",
                            to_new_address, self.macho.install_name
                        ));
                    }
                    set32(buffer, from_buffer_offset as usize, value as u32);
                }
            }
            ADJ_V2_ARM64_ADRP => {
                let instruction = get32(buffer, from_buffer_offset as usize);
                let page_distance = (to_new_address as i64 & !0xFFF)
                    - (from_new_address as i64 & !0xFFF);
                let rewritten =
                    instructions::adrp_with_page_distance(instruction, page_distance)
                        .map_err(|e| format!("{} in {}", e, self.macho.install_name))?;
                set32(buffer, from_buffer_offset as usize, rewritten);
            }
            ADJ_V2_ARM64_OFF12 => {
                let instruction = get32(buffer, from_buffer_offset as usize);
                let rewritten = instructions::off12_with_page_offset(
                    instruction,
                    (to_new_address & 0xFFF) as u32,
                )
                .map_err(|e| format!("{} in {}", e, self.macho.install_name))?;
                set32(buffer, from_buffer_offset as usize, rewritten);
            }
            ADJ_V2_ARM64_BR26 => {
                let instruction = get32(buffer, from_buffer_offset as usize);
                let delta = to_new_address as i64 - from_new_address as i64;
                let rewritten = instructions::br26_with_delta(instruction, delta)
                    .map_err(|e| format!("{} in {}", e, self.macho.install_name))?;
                set32(buffer, from_buffer_offset as usize, rewritten);
            }
            ADJ_V2_ARM_BR24 | ADJ_V2_THUMB_BR22 => {
                // Branches only move relative to their target when segments
                // move apart, which never happens within one __TEXT.
                if adjust != 0 {
                    return Err(format!(
                        "branch fixup kind {} needs adjusting by {:#x} in {}",
                        kind, adjust, self.macho.install_name
                    ));
                }
            }
            ADJ_V2_THUMB_MOVW_MOVT | ADJ_V2_ARM_MOVW_MOVT => {
                // Two consecutive edges form one 32-bit immediate.
                match movw_state.take() {
                    None => {
                        *movw_state = Some((kind, from_buffer_offset, to_new_address));
                    }
                    Some((last_kind, last_offset, last_to)) => {
                        if last_kind != kind {
                            *movw_state = Some((kind, from_buffer_offset, to_new_address));
                            return Ok(());
                        }
                        if last_to != to_new_address {
                            return Err(format!(
                                "paired movw/movt target different addresses in {}",
                                self.macho.install_name
                            ));
                        }
                        self.adjust_movw_movt_pair(
                            buffer,
                            kind,
                            last_offset,
                            from_buffer_offset,
                            adjust,
                        )?;
                    }
                }
            }
            _ => {
                return Err(format!(
                    "unknown split seg info v2 kind value ({}) in {}",
                    kind, self.macho.install_name
                ))
            }
        }
        Ok(())
    }

    fn adjust_movw_movt_pair(
        &self,
        buffer: &mut [u8],
        kind: u64,
        first_offset: u64,
        second_offset: u64,
        adjust: i64,
    ) -> Result<(), String> {
        use instructions::*;
        let instruction1 = get32(buffer, first_offset as usize);
        let instruction2 = get32(buffer, second_offset as usize);
        let thumb = kind == ADJ_V2_THUMB_MOVW_MOVT;
        let (is_movw, is_movt, get_word, set_word): (
            fn(u32) -> bool,
            fn(u32) -> bool,
            fn(u32) -> u16,
            fn(u32, u16) -> u32,
        ) = if thumb {
            (is_thumb_movw, is_thumb_movt, get_thumb_word, set_thumb_word)
        } else {
            (is_arm_movw, is_arm_movt, get_arm_word, set_arm_word)
        };
        let (new1, new2) = if is_movw(instruction1) && is_movt(instruction2) {
            let full = ((get_word(instruction2) as u32) << 16) | get_word(instruction1) as u32;
            let full = (full as i64 + adjust) as u32;
            (
                set_word(instruction1, (full & 0xFFFF) as u16),
                set_word(instruction2, (full >> 16) as u16),
            )
        } else if is_movt(instruction1) && is_movw(instruction2) {
            let full = ((get_word(instruction1) as u32) << 16) | get_word(instruction2) as u32;
            let full = (full as i64 + adjust) as u32;
            (
                set_word(instruction1, (full >> 16) as u16),
                set_word(instruction2, (full & 0xFFFF) as u16),
            )
        } else {
            return Err(format!(
                "two movw/movt fixups in a row but not paired in {}",
                self.macho.install_name
            ));
        };
        set32(buffer, first_offset as usize, new1);
        set32(buffer, second_offset as usize, new2);
        Ok(())
    }

    // --- no-split-seg paths ---

    /// Walk chained-fixup starts over the copied segments, converting every
    /// rebase.
    fn adjust_rebase_chains(&self, buffer: &mut [u8], aslr: &AslrTracker) -> Result<(), String> {
        let chained = self.chained.unwrap();
        for seg_starts in &chained.starts {
            let placement = self.placement_for_segment(seg_starts.segment_index)?;
            let stride = fixups::chain_stride(seg_starts.pointer_format);
            for (page_index, &start) in seg_starts.page_starts.iter().enumerate() {
                if start == DYLD_CHAINED_PTR_START_NONE {
                    continue;
                }
                let mut offset_in_seg =
                    page_index as u64 * seg_starts.page_size as u64 + start as u64;
                loop {
                    let buffer_offset = placement.dst_buffer_offset + offset_in_seg;
                    let raw = get64(buffer, buffer_offset as usize);
                    let decoded = ChainedPointer::decode(
                        seg_starts.pointer_format,
                        raw,
                        self.macho.preferred_load_address(),
                    )?;
                    let next = decoded.next();
                    // The slide of the target: decode to find its original
                    // address, then look up its segment's movement.
                    if !decoded.is_bind() {
                        let orig_target = match decoded {
                            ChainedPointer::Rebase { target, .. } => target,
                            ChainedPointer::AuthRebase { target, .. } => {
                                self.macho.preferred_load_address() + target
                            }
                            _ => unreachable!(),
                        };
                        let target_slide = self.slide_for_orig_address(orig_target)?;
                        self.convert_chained_pointer(
                            buffer,
                            aslr,
                            seg_starts.pointer_format,
                            buffer_offset,
                            placement.dst_unslid_address + offset_in_seg,
                            target_slide,
                        )?;
                    }
                    if next == 0 {
                        break;
                    }
                    offset_in_seg += next * stride;
                }
            }
        }
        Ok(())
    }

    /// Slide every opcode-based rebase location in place.
    fn adjust_data_pointers(
        &self,
        buffer: &mut [u8],
        aslr: &AslrTracker,
        rebases: &[RebaseLocation],
    ) -> Result<(), String> {
        for rebase in rebases {
            let placement = self.placement_for_segment(rebase.seg_index)?;
            let buffer_offset = placement.dst_buffer_offset + rebase.seg_offset;
            let new_slot_address = placement.dst_unslid_address + rebase.seg_offset;
            match rebase.rtype {
                REBASE_TYPE_POINTER => {
                    if self.macho.is64 {
                        let value = get64(buffer, buffer_offset as usize);
                        let new_value =
                            (value as i64 + self.slide_for_orig_address(value)?) as u64;
                        let high8 = (new_value >> 56) as u8;
                        self.track_pointer64(
                            buffer,
                            aslr,
                            buffer_offset,
                            new_slot_address,
                            new_value,
                            high8,
                            u64::MAX,
                        );
                    } else {
                        let value = get32(buffer, buffer_offset as usize) as u64;
                        let new_value =
                            (value as i64 + self.slide_for_orig_address(value)?) as u64;
                        set32(buffer, buffer_offset as usize, new_value as u32);
                        aslr.add(new_slot_address);
                    }
                }
                REBASE_TYPE_TEXT_ABSOLUTE32 => {
                    let value = get32(buffer, buffer_offset as usize) as u64;
                    let new_value = (value as i64 + self.slide_for_orig_address(value)?) as u64;
                    set32(buffer, buffer_offset as usize, new_value as u32);
                }
                other => {
                    return Err(format!(
                        "unknown rebase type {} in {}",
                        other, self.macho.install_name
                    ))
                }
            }
        }
        Ok(())
    }

    /// Classic split-seg (v1): per-kind uleb delta runs of code locations
    /// referencing data.
    fn adjust_code(&self, buffer: &mut [u8]) -> Result<(), String> {
        let Some(blob) = self.macho.split_seg_info else {
            return Ok(());
        };
        if blob.is_empty() || self.macho.has_split_seg_v2() {
            return Ok(());
        }
        // Text stays together and data stays together; the interesting
        // delta is how far data moved relative to text.
        let text_placement = self.placement_for_segment(0)?;
        let text_slide =
            text_placement.dst_unslid_address as i64 - self.macho.segments[0].vmaddr as i64;
        let data_segment = self
            .macho
            .segments
            .iter()
            .find(|s| s.init_prot & crate::mach_o::VM_PROT_WRITE != 0);
        let Some(data_segment) = data_segment else {
            return Ok(());
        };
        let data_placement = self.placement_for_segment(data_segment.index)?;
        let data_slide = data_placement.dst_unslid_address as i64 - data_segment.vmaddr as i64;
        let code_to_data_delta = data_slide - text_slide;

        let info = blob.slice(&self.macho.bytes);
        let mut pos = 0usize;
        while pos < info.len() {
            let kind = info[pos];
            pos += 1;
            if kind == 0 {
                break;
            }
            let mut address = text_placement.dst_buffer_offset;
            loop {
                let delta = read_uleb128(info, &mut pos)?;
                if delta == 0 {
                    break;
                }
                address += delta;
                match kind {
                    1 => {
                        let value = get32(buffer, address as usize);
                        set32(
                            buffer,
                            address as usize,
                            (value as i64 + code_to_data_delta) as u32,
                        );
                    }
                    2 => {
                        let value = get64(buffer, address as usize);
                        set64(
                            buffer,
                            address as usize,
                            (value as i64 + code_to_data_delta) as u64,
                        );
                    }
                    other => {
                        return Err(format!(
                            "unsupported split seg v1 kind {} in {}",
                            other, self.macho.install_name
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    // --- link-edit and load commands ---

    fn rebuild_linkedit_and_load_commands(
        &self,
        buffer: &mut [u8],
    ) -> Result<AdjustedLinkedit, String> {
        let macho = self.macho;
        let linkedit_segment = macho
            .segment("__LINKEDIT")
            .ok_or_else(|| "no __LINKEDIT segment".to_string())?;
        let linkedit_placement = self.placement_for_segment(linkedit_segment.index)?;

        // Assemble the new link-edit in the fixed blob order. All offsets
        // are relative to the start of the new __LINKEDIT.
        let mut le: Vec<u8> = Vec::new();
        let align8 = |le: &mut Vec<u8>| {
            while le.len() % 8 != 0 {
                le.push(0);
            }
        };

        let copy_blob = |le: &mut Vec<u8>, blob: crate::mach_o::LinkeditBlob| -> (u32, u32) {
            if blob.is_empty() {
                return (0, 0);
            }
            let offset = le.len() as u32;
            le.extend_from_slice(blob.slice(&macho.bytes));
            (offset, blob.size)
        };

        let (bind_off, bind_size) = copy_blob(&mut le, macho.dyld_info.bind);
        align8(&mut le);
        let (weak_bind_off, weak_bind_size) = copy_blob(&mut le, macho.dyld_info.weak_bind);
        align8(&mut le);
        let (lazy_bind_off, lazy_bind_size) = copy_blob(&mut le, macho.dyld_info.lazy_bind);
        align8(&mut le);

        let new_trie = self.rebuild_exports_trie()?;
        let export_off = le.len() as u32;
        let export_size = new_trie.len() as u32;
        le.extend_from_slice(&new_trie);
        align8(&mut le);

        let (func_starts_off, func_starts_size) = copy_blob(&mut le, macho.function_starts);
        align8(&mut le);
        let (data_in_code_off, data_in_code_size) = copy_blob(&mut le, macho.data_in_code);
        align8(&mut le);

        // Symbol table with defined symbols slid.
        let symtab_off = le.len() as u32;
        let nlist_size = Nlist::size(macho.is64);
        for i in 0..macho.symtab.nsyms {
            let mut nlist = macho.nlist(i);
            if nlist.is_defined_in_section() {
                nlist.n_value =
                    (nlist.n_value as i64 + self.slide_for_orig_address(nlist.n_value)?) as u64;
            }
            let at = le.len();
            le.resize(at + nlist_size, 0);
            nlist.write(&mut le, at, macho.is64);
        }
        align8(&mut le);

        let indirect_off = le.len() as u32;
        if macho.dysymtab.nindirectsyms != 0 {
            let blob = crate::mach_o::LinkeditBlob {
                offset: macho.dysymtab.indirectsymoff,
                size: macho.dysymtab.nindirectsyms * 4,
            };
            le.extend_from_slice(blob.slice(&macho.bytes));
        }
        align8(&mut le);

        let extrel_off = le.len() as u32;
        if macho.dysymtab.nextrel != 0 {
            let blob = crate::mach_o::LinkeditBlob {
                offset: macho.dysymtab.extreloff,
                size: macho.dysymtab.nextrel * 8,
            };
            le.extend_from_slice(blob.slice(&macho.bytes));
        }
        align8(&mut le);

        let strings_off = le.len() as u32;
        let strings_size = macho.symtab.strsize;
        if strings_size != 0 {
            let blob = crate::mach_o::LinkeditBlob {
                offset: macho.symtab.stroff,
                size: strings_size,
            };
            le.extend_from_slice(blob.slice(&macho.bytes));
        }

        if le.len() as u64 > linkedit_placement.dst_segment_size {
            return Err(format!(
                "rebuilt link-edit ({} bytes) exceeds reserved space ({} bytes) in {}",
                le.len(),
                linkedit_placement.dst_segment_size,
                macho.install_name
            ));
        }
        let dst = linkedit_placement.dst_buffer_offset as usize;
        buffer[dst..dst + le.len()].copy_from_slice(&le);
        for byte in
            &mut buffer[dst + le.len()..dst + linkedit_placement.dst_segment_size as usize]
        {
            *byte = 0;
        }

        // File offsets of the blobs in the final cache.
        let le_file = linkedit_placement.dst_file_offset as u32;
        let reloc = |offset: u32, size: u32| if size == 0 { 0 } else { le_file + offset };
        let offsets = AdjustedLinkedit {
            bind: (reloc(bind_off, bind_size), bind_size),
            weak_bind: (reloc(weak_bind_off, weak_bind_size), weak_bind_size),
            lazy_bind: (reloc(lazy_bind_off, lazy_bind_size), lazy_bind_size),
            export: (reloc(export_off, export_size), export_size),
            function_starts: (reloc(func_starts_off, func_starts_size), func_starts_size),
            data_in_code: (reloc(data_in_code_off, data_in_code_size), data_in_code_size),
            symtab: le_file + symtab_off,
            nsyms: macho.symtab.nsyms,
            indirectsym: if macho.dysymtab.nindirectsyms == 0 {
                0
            } else {
                le_file + indirect_off
            },
            extrel: if macho.dysymtab.nextrel == 0 {
                0
            } else {
                le_file + extrel_off
            },
            strings: (le_file + strings_off, strings_size),
        };
        self.rewrite_load_commands(buffer, &offsets)?;
        Ok(offsets)
    }

    fn rebuild_exports_trie(&self) -> Result<Vec<u8>, String> {
        let exports = self.macho.exported_symbols()?;
        let orig_base = self.macho.preferred_load_address();
        let new_base = self.placement_for_segment(0)?.dst_unslid_address;
        let mut entries = Vec::new();
        for export in exports {
            if export.name.starts_with("$ld$") || export.name.starts_with(".objc_") {
                continue;
            }
            let payload = self.reencode_export(&export, orig_base, new_base)?;
            entries.push(TrieEntry {
                name: export.name,
                payload,
            });
        }
        Ok(trie::build_trie(&entries))
    }

    fn reencode_export(
        &self,
        export: &ExportedSymbol,
        orig_base: u64,
        new_base: u64,
    ) -> Result<Vec<u8>, String> {
        if export.flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            let mut payload = Vec::new();
            crate::endian::append_uleb128(&mut payload, export.flags);
            crate::endian::append_uleb128(&mut payload, export.address);
            payload.extend_from_slice(export.import_name.as_deref().unwrap_or("").as_bytes());
            payload.push(0);
            return Ok(payload);
        }
        if export.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK == EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE {
            return Ok(trie::export_payload(export.flags, export.address));
        }
        let translate = |image_offset: u64| -> Result<u64, String> {
            let orig = orig_base + image_offset;
            Ok((self.new_address_for_orig(orig)?).wrapping_sub(new_base))
        };
        if export.flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
            return Ok(trie::export_payload_with_resolver(
                export.flags,
                translate(export.address)?,
                translate(export.other)?,
            ));
        }
        Ok(trie::export_payload(export.flags, translate(export.address)?))
    }

    fn rewrite_load_commands(
        &self,
        buffer: &mut [u8],
        offsets: &AdjustedLinkedit,
    ) -> Result<(), String> {
        let macho = self.macho;
        let text_placement = self.placement_for_segment(0)?;
        let header_buffer_offset = text_placement.dst_buffer_offset as usize;
        let header_size = if macho.is64 { 32 } else { 28 };

        // Copy out the original commands, then rebuild the list in place.
        let commands_size = macho.sizeofcmds as usize;
        let original =
            buffer[header_buffer_offset + header_size..header_buffer_offset + header_size + commands_size]
                .to_vec();

        let mut rebuilt: Vec<u8> = Vec::with_capacity(commands_size);
        let mut new_ncmds = 0u32;
        let mut pos = 0usize;
        let mut segment_counter = 0usize;
        for _ in 0..macho.ncmds {
            let cmd = get32(&original, pos);
            let cmdsize = get32(&original, pos + 4) as usize;
            let mut command = original[pos..pos + cmdsize].to_vec();
            pos += cmdsize;

            match cmd {
                LC_SEGMENT_SPLIT_INFO
                | LC_DYLD_CHAINED_FIXUPS
                | LC_CODE_SIGNATURE
                | LC_DYLIB_CODE_SIGN_DRS
                | LC_RPATH => continue, // deleted
                LC_SEGMENT_64 => {
                    let segment_index = segment_counter;
                    segment_counter += 1;
                    self.rewrite_segment_command64(&mut command, segment_index)?;
                }
                LC_SEGMENT => {
                    let segment_index = segment_counter;
                    segment_counter += 1;
                    self.rewrite_segment_command32(&mut command, segment_index)?;
                }
                LC_SYMTAB => {
                    set32(&mut command, 8, offsets.symtab);
                    // nsyms unchanged
                    set32(&mut command, 16, offsets.strings.0);
                    set32(&mut command, 20, offsets.strings.1);
                }
                LC_DYSYMTAB => {
                    // toc/modtab/extrefsyms are obsolete: zero them.
                    set32(&mut command, 32, 0); // tocoff
                    set32(&mut command, 36, 0); // ntoc
                    set32(&mut command, 40, 0); // modtaboff
                    set32(&mut command, 44, 0); // nmodtab
                    set32(&mut command, 48, 0); // extrefsymoff
                    set32(&mut command, 52, 0); // nextrefsyms
                    set32(&mut command, 56, offsets.indirectsym);
                    set32(&mut command, 64, offsets.extrel);
                    set32(&mut command, 72, 0); // locreloff
                    set32(&mut command, 76, 0); // nlocrel
                }
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    set32(&mut command, 8, 0); // rebase_off: superseded by slide info
                    set32(&mut command, 12, 0);
                    set32(&mut command, 16, offsets.bind.0);
                    set32(&mut command, 20, offsets.bind.1);
                    set32(&mut command, 24, offsets.weak_bind.0);
                    set32(&mut command, 28, offsets.weak_bind.1);
                    set32(&mut command, 32, offsets.lazy_bind.0);
                    set32(&mut command, 36, offsets.lazy_bind.1);
                    set32(&mut command, 40, offsets.export.0);
                    set32(&mut command, 44, offsets.export.1);
                }
                LC_DYLD_EXPORTS_TRIE => {
                    set32(&mut command, 8, offsets.export.0);
                    set32(&mut command, 12, offsets.export.1);
                }
                LC_FUNCTION_STARTS => {
                    set32(&mut command, 8, offsets.function_starts.0);
                    set32(&mut command, 12, offsets.function_starts.1);
                }
                LC_DATA_IN_CODE => {
                    set32(&mut command, 8, offsets.data_in_code.0);
                    set32(&mut command, 12, offsets.data_in_code.1);
                }
                LC_ROUTINES_64 => {
                    let init_address = get64(&command, 8);
                    set64(
                        &mut command,
                        8,
                        self.new_address_for_orig(init_address)?,
                    );
                }
                _ => (),
            }
            rebuilt.extend_from_slice(&command);
            new_ncmds += 1;
        }

        if rebuilt.len() > commands_size {
            return Err("rewritten load commands grew".to_string());
        }
        let start = header_buffer_offset + header_size;
        buffer[start..start + rebuilt.len()].copy_from_slice(&rebuilt);
        for byte in &mut buffer[start + rebuilt.len()..start + commands_size] {
            *byte = 0;
        }
        set32(buffer, header_buffer_offset + 16, new_ncmds);
        set32(buffer, header_buffer_offset + 20, rebuilt.len() as u32);
        Ok(())
    }

    fn rewrite_segment_command64(
        &self,
        command: &mut [u8],
        segment_index: usize,
    ) -> Result<(), String> {
        let placement = self.placement_for_segment(segment_index)?;
        let segment = &self.macho.segments[segment_index];
        let slide = placement.dst_unslid_address as i64 - segment.vmaddr as i64;
        set64(command, 24, placement.dst_unslid_address);
        set64(command, 32, placement.dst_segment_size);
        set64(command, 40, placement.dst_file_offset);
        set64(command, 48, placement.dst_file_size);
        let nsects = get32(command, 64) as usize;
        for i in 0..nsects {
            let section = 72 + i * 80;
            let addr = get64(command, section + 32);
            let size = get64(command, section + 40);
            let mut sect_name = [0u8; 16];
            sect_name.copy_from_slice(&command[section..section + 16]);
            let mut seg_name = [0u8; 16];
            seg_name.copy_from_slice(&command[section + 16..section + 32]);
            let coalesced = self
                .coalescer
                .section_was_coalesced(name_from(&seg_name), name_from(&sect_name));
            if coalesced {
                let pool_vmaddr = if name_from(&sect_name) == "__cfstring" {
                    self.coalesced.cf_strings.buffer_vmaddr
                } else {
                    self.coalesced
                        .string_section(name_from(&sect_name))
                        .buffer_vmaddr
                };
                set64(command, section + 32, pool_vmaddr);
                let pool_file = self
                    .layout
                    .file_offset_for_address(pool_vmaddr)
                    .unwrap_or(0);
                set32(command, section + 48, pool_file as u32);
            } else {
                set64(command, section + 32, (addr as i64 + slide) as u64);
                let file_offset = get32(command, section + 48);
                if file_offset != 0 || size == 0 {
                    let offset_in_segment = addr - segment.vmaddr;
                    set32(
                        command,
                        section + 48,
                        (placement.dst_file_offset + offset_in_segment) as u32,
                    );
                }
            }
        }
        Ok(())
    }

    fn rewrite_segment_command32(
        &self,
        command: &mut [u8],
        segment_index: usize,
    ) -> Result<(), String> {
        let placement = self.placement_for_segment(segment_index)?;
        let segment = &self.macho.segments[segment_index];
        let slide = placement.dst_unslid_address as i64 - segment.vmaddr as i64;
        set32(command, 24, placement.dst_unslid_address as u32);
        set32(command, 28, placement.dst_segment_size as u32);
        set32(command, 32, placement.dst_file_offset as u32);
        set32(command, 36, placement.dst_file_size as u32);
        let nsects = get32(command, 48) as usize;
        for i in 0..nsects {
            let section = 56 + i * 68;
            let addr = get32(command, section + 32) as u64;
            let size = get32(command, section + 36) as u64;
            set32(command, section + 32, (addr as i64 + slide) as u32);
            let file_offset = get32(command, section + 40);
            if file_offset != 0 || size == 0 {
                let offset_in_segment = addr - segment.vmaddr;
                set32(
                    command,
                    section + 40,
                    (placement.dst_file_offset + offset_in_segment) as u32,
                );
            }
        }
        Ok(())
    }
}

/// Cache-file offsets (and sizes) of one dylib's rebuilt link-edit blobs.
/// `(0, 0)` pairs mean "absent".
#[derive(Debug, Copy, Clone, Default)]
pub struct AdjustedLinkedit {
    pub bind: (u32, u32),
    pub weak_bind: (u32, u32),
    pub lazy_bind: (u32, u32),
    pub export: (u32, u32),
    pub function_starts: (u32, u32),
    pub data_in_code: (u32, u32),
    pub symtab: u32,
    pub nsyms: u32,
    pub indirectsym: u32,
    pub extrel: u32,
    pub strings: (u32, u32),
}

fn name_from(bytes: &[u8]) -> &str {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..len]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_constants_are_distinct_and_bounded() {
        let kinds = [
            ADJ_V2_POINTER_32,
            ADJ_V2_POINTER_64,
            ADJ_V2_DELTA_32,
            ADJ_V2_DELTA_64,
            ADJ_V2_ARM64_ADRP,
            ADJ_V2_ARM64_OFF12,
            ADJ_V2_ARM64_BR26,
            ADJ_V2_ARM_MOVW_MOVT,
            ADJ_V2_ARM_BR24,
            ADJ_V2_THUMB_MOVW_MOVT,
            ADJ_V2_THUMB_BR22,
            ADJ_V2_IMAGE_OFF_32,
            ADJ_V2_THREADED_POINTER_64,
        ];
        let mut seen = std::collections::HashSet::new();
        for kind in kinds {
            assert!(kind <= ADJ_V2_MAX_KIND);
            assert!(seen.insert(kind));
        }
    }

    #[test]
    fn section_name_extraction() {
        let mut raw = [0u8; 16];
        raw[..6].copy_from_slice(b"__TEXT");
        assert_eq!(name_from(&raw), "__TEXT");
        let full = *b"__objc_methname_";
        assert_eq!(name_from(&full), "__objc_methname_");
    }
}
