/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The layout planner: assigns every surviving dylib segment its place in the
//! output image.
//!
//! Address space is carved into a text region, one or four data regions, and
//! a read-only region. Text comes first (after the reserved header area),
//! followed by the coalesced-string pools, ObjC optimizer tables and
//! IMP-cache reservation. Data segments are classified by dirtiness,
//! constness and pointer authentication, and packed per class. The read-only
//! region starts with the slide-info reservations and ends with the 16
//! KiB-aligned link-edit segments so the merger can replace them wholesale.
//!
//! The planner is pure bookkeeping: nothing is copied here. On overflow the
//! builder evicts leaf dylibs and calls it again.

use crate::arch::ArchLayout;
use crate::cache_format::{
    align, CACHE_MAPPING_AUTH_DATA, CACHE_MAPPING_CONST_DATA, CACHE_MAPPING_DIRTY_DATA,
    HEADER_SIZE, IMAGE_INFO_SIZE, IMAGE_TEXT_INFO_SIZE, MAPPING_INFO_SIZE,
    MAPPING_WITH_SLIDE_INFO_SIZE, MAX_MAPPINGS,
};
use crate::coalesce::{CacheCoalescedText, DylibTextCoalescer, SUPPORTED_SECTIONS};
use crate::mach_o::{MachO, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use std::collections::HashMap;

/// A contiguous span of the output image.
#[derive(Debug, Clone)]
pub struct Region {
    pub name: String,
    /// Offset of this region in the output buffer (== file offset; the
    /// buffer is laid out in file order).
    pub buffer_offset: u64,
    pub size_in_use: u64,
    pub unslid_load_address: u64,
    pub cache_file_offset: u64,
    pub init_prot: u32,
    pub max_prot: u32,
    /// Mapping flags (dirty/const/auth) recorded in the header.
    pub flags: u64,
    pub slide_info: Option<SlideInfoReservation>,
}

impl Region {
    pub fn contains_address(&self, addr: u64) -> bool {
        addr >= self.unslid_load_address && addr < self.unslid_load_address + self.size_in_use
    }
}

/// Space reserved in the read-only region for one data region's slide info.
#[derive(Debug, Clone)]
pub struct SlideInfoReservation {
    pub buffer_offset: u64,
    pub allocated_size: u64,
    pub file_offset: u64,
    /// Bytes actually emitted; filled in by the slide-info emitter.
    pub file_size: u64,
}

/// Where one source segment lands in the cache.
#[derive(Debug, Clone)]
pub struct SegmentPlacement {
    pub dylib_index: usize,
    pub segment_index: usize,
    pub name: String,
    /// Offset of the segment's bytes in the source file.
    pub src_file_offset: u64,
    /// Bytes to copy; may be less than the segment size when trailing
    /// sections were coalesced away or are zero-fill.
    pub copy_size: u64,
    pub dst_buffer_offset: u64,
    pub dst_unslid_address: u64,
    pub dst_file_offset: u64,
    /// VM size the segment occupies in the cache.
    pub dst_segment_size: u64,
    pub dst_file_size: u64,
}

/// Per-dylib facts the planner needs beyond the parsed binary.
pub struct LayoutInput<'a> {
    pub macho: &'a MachO,
    pub coalescer: &'a DylibTextCoalescer,
    /// Per segment: does any chained fixup in it carry the auth bit?
    pub segment_has_auth: Vec<bool>,
    /// False when the dylib (e.g. with pointer-based method lists) must not
    /// get `_CONST` treatment.
    pub supports_const_data: bool,
}

/// The planner's result.
pub struct CacheLayout {
    pub read_execute: Region,
    pub data_regions: Vec<Region>,
    pub read_only: Region,
    /// Indexed like the input dylib slice; inner list in source segment
    /// order.
    pub placements: Vec<Vec<SegmentPlacement>>,
    pub header_reserved_size: u64,
    /// Start of the ObjC read-only area inside the text region.
    pub objc_ro_addr: u64,
    pub objc_ro_size: u64,
    /// Reserved optimizer-table space following the string pools.
    pub objc_opt_ro_addr: u64,
    pub objc_opt_ro_size: u64,
    pub imp_caches_addr: u64,
    pub imp_caches_size: u64,
    /// Start of the non-link-edit part of the read-only region.
    pub non_linkedit_read_only_size: u64,
    /// File offset one past the last region.
    pub total_file_size: u64,
}

impl CacheLayout {
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        std::iter::once(&self.read_execute)
            .chain(self.data_regions.iter())
            .chain(std::iter::once(&self.read_only))
    }

    /// Translate an unslid address to an output-buffer offset.
    pub fn buffer_offset_for_address(&self, addr: u64) -> Option<u64> {
        self.regions()
            .find(|r| r.contains_address(addr))
            .map(|r| r.buffer_offset + (addr - r.unslid_load_address))
    }

    pub fn file_offset_for_address(&self, addr: u64) -> Option<u64> {
        // Buffer layout is file layout.
        self.buffer_offset_for_address(addr)
    }

    pub fn data_regions_total_size(&self) -> u64 {
        let Some(first) = self.data_regions.first() else {
            return 0;
        };
        let last = self.data_regions.last().unwrap();
        last.unslid_load_address + last.size_in_use - first.unslid_load_address
    }

    pub fn data_regions_size_in_use(&self) -> u64 {
        self.data_regions.iter().map(|r| r.size_in_use).sum()
    }

    /// By how much the plan exceeds the architecture's windows. Zero means
    /// it fits.
    pub fn cache_overflow_amount(&self, arch: &ArchLayout) -> u64 {
        match &arch.discontiguous {
            Some(disc) => {
                if self.read_execute.size_in_use > disc.rx_max_size {
                    return self.read_execute.size_in_use - disc.rx_max_size;
                }
                let data = self.data_regions_total_size();
                if data > disc.rw_max_size {
                    return data - disc.rw_max_size;
                }
                if self.read_only.size_in_use > disc.ro_max_size {
                    return self.read_only.size_in_use - disc.ro_max_size;
                }
                0
            }
            None => {
                let end = self.read_only.unslid_load_address + self.read_only.size_in_use;
                let limit = arch.shared_memory_start + arch.shared_memory_size;
                end.saturating_sub(limit)
            }
        }
    }

    /// Largest slide the loader may apply without any region leaving its
    /// window.
    pub fn max_slide(&self, arch: &ArchLayout) -> u64 {
        match &arch.discontiguous {
            Some(disc) => {
                let a = disc.rx_max_size.saturating_sub(self.read_execute.size_in_use);
                let b = disc.rw_max_size.saturating_sub(self.data_regions_total_size());
                let c = disc.ro_max_size.saturating_sub(self.read_only.size_in_use);
                a.min(b).min(c)
            }
            None => {
                let end = self.read_only.unslid_load_address + self.read_only.size_in_use;
                (arch.shared_memory_start + arch.shared_memory_size).saturating_sub(end)
            }
        }
    }
}

/// Estimated space for the ObjC optimizer's read-only tables (selector
/// hash table, class table, protocol table). Deliberately generous; the
/// optimizer checks against it when emitting.
fn objc_opt_ro_estimate(selref_count: u32, class_count: u32, protocol_count: u32) -> u64 {
    0x8000
        + selref_count as u64 * 16
        + class_count as u64 * 24
        + protocol_count as u64 * 24
}

/// Segment size with trailing coalesced sections removed.
fn trimmed_size_of_sections(input: &LayoutInput<'_>, segment: &crate::mach_o::Segment) -> u64 {
    let mut size_of_sections = 0u64;
    let mut found_coalesced = false;
    for section in &segment.sections {
        if input
            .coalescer
            .section_was_coalesced(&section.segment_name, &section.name)
        {
            found_coalesced = true;
        } else {
            size_of_sections = section.addr + section.size - segment.vmaddr;
        }
    }
    if !found_coalesced {
        size_of_sections = segment.size_of_sections();
    }
    size_of_sections
}

fn data_kind_rank(kind: DataKind) -> u32 {
    match kind {
        DataKind::Dirty => 0,
        DataKind::Writable => 1,
        DataKind::Const => 2,
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum DataKind {
    Dirty,
    Writable,
    Const,
}

struct DataSegment {
    dylib_index: usize,
    segment_index: usize,
    kind: DataKind,
    auth: bool,
    /// (dirty rank, install name) ordering key.
    dirty_rank: usize,
}

/// Assign addresses for every segment of every dylib.
///
/// `selector_pool_size` is the method-name pool size fixed by the selector
/// placer; `imp_caches_size` the total IMP-cache table bytes;
/// `objc_counts = (selrefs, classes, protocols)` summed over the inputs.
/// `aliases` are `(dylib index, symlink path)` pairs that get their own
/// image-info entries.
pub fn assign_segment_addresses(
    inputs: &[LayoutInput<'_>],
    arch: &'static ArchLayout,
    coalesced: &mut CacheCoalescedText,
    selector_pool_size: u64,
    imp_caches_size: u64,
    objc_counts: (u32, u32, u32),
    dirty_data_order: &HashMap<String, usize>,
    aliases: &[(usize, String)],
) -> CacheLayout {
    let mut placements: Vec<Vec<SegmentPlacement>> = vec![Vec::new(); inputs.len()];

    // Header area: header + mapping tables + image tables + path strings.
    // Symlink aliases get image-info entries of their own.
    let mut header_size = HEADER_SIZE
        + MAX_MAPPINGS * (MAPPING_INFO_SIZE + MAPPING_WITH_SLIDE_INFO_SIZE)
        + (inputs.len() + aliases.len()) as u64 * IMAGE_INFO_SIZE
        + inputs.len() as u64 * IMAGE_TEXT_INFO_SIZE;
    for input in inputs {
        header_size += input.macho.install_name.len() as u64 + 1;
    }
    for (_, alias) in aliases {
        header_size += alias.len() as u64 + 1;
    }
    let header_reserved_size = align(header_size, 12);

    // --- Text region ---
    let text_base = arch.shared_memory_start;
    let mut addr = text_base + header_reserved_size;
    for (dylib_index, input) in inputs.iter().enumerate() {
        for segment in &input.macho.segments {
            if segment.init_prot != (VM_PROT_READ | VM_PROT_EXECUTE) {
                continue;
            }
            let size_of_sections = trimmed_size_of_sections(input, segment);
            addr = align(addr, segment.p2align().max(14));
            let offset_in_region = addr - text_base;
            placements[dylib_index].push(SegmentPlacement {
                dylib_index,
                segment_index: segment.index,
                name: segment.name.clone(),
                src_file_offset: segment.file_offset,
                copy_size: size_of_sections.min(segment.file_size),
                dst_buffer_offset: offset_in_region,
                dst_unslid_address: addr,
                dst_file_offset: offset_in_region,
                dst_segment_size: align(size_of_sections, 12),
                dst_file_size: align(size_of_sections, 12),
            });
            addr += align(size_of_sections, 12);
        }
    }

    // --- ObjC read-only area: string pools, optimizer tables, IMP caches ---
    let objc_ro_addr = addr;
    for section_name in SUPPORTED_SECTIONS {
        let is_method_names = section_name == "__objc_methname";
        let section = match section_name {
            "__objc_classname" => &mut coalesced.objc_class_names,
            "__objc_methname" => &mut coalesced.objc_meth_names,
            _ => &mut coalesced.objc_meth_types,
        };
        section.buffer_vmaddr = addr;
        if is_method_names {
            section.buffer_size = section.buffer_size.max(selector_pool_size as u32);
        }
        addr += section.buffer_size as u64;
    }
    addr = align(addr, 14);

    let (selref_count, class_count, protocol_count) = objc_counts;
    let objc_opt_ro_addr = addr;
    let objc_opt_ro_size = align(
        objc_opt_ro_estimate(selref_count, class_count, protocol_count),
        14,
    );
    addr += objc_opt_ro_size;

    let imp_caches_addr = addr;
    let imp_caches_aligned = align(imp_caches_size, 14);
    addr += imp_caches_aligned;
    let objc_ro_size = addr - objc_ro_addr;

    let text_end = align(addr, arch.shared_region_align_p2);
    let read_execute = Region {
        name: "__TEXT".to_string(),
        buffer_offset: 0,
        size_in_use: text_end - text_base,
        unslid_load_address: text_base,
        cache_file_offset: 0,
        init_prot: VM_PROT_READ | VM_PROT_EXECUTE,
        max_prot: VM_PROT_READ | VM_PROT_EXECUTE,
        flags: 0,
        slide_info: None,
    };

    // --- Data regions ---
    let mut addr = match &arch.discontiguous {
        Some(disc) => disc.rw_start,
        None => align(text_end + arch.shared_region_padding, arch.shared_region_align_p2),
    };
    let mut file_offset = read_execute.cache_file_offset + read_execute.size_in_use;

    // Classify all writable segments.
    let mut data_segments: Vec<DataSegment> = Vec::new();
    for (dylib_index, input) in inputs.iter().enumerate() {
        for segment in &input.macho.segments {
            if segment.init_prot & VM_PROT_WRITE == 0
                || segment.init_prot & VM_PROT_EXECUTE != 0
            {
                continue;
            }
            let auth = arch.supports_auth_pointers
                && input
                    .segment_has_auth
                    .get(segment.index)
                    .copied()
                    .unwrap_or(false);
            let kind = if segment.name == "__DATA_DIRTY" {
                DataKind::Dirty
            } else if (segment.name == "__DATA_CONST"
                || segment.name == "__OBJC_CONST"
                || segment.name == "__AUTH_CONST")
                && input.supports_const_data
            {
                DataKind::Const
            } else {
                DataKind::Writable
            };
            let dirty_rank = dirty_data_order
                .get(&input.macho.install_name)
                .copied()
                .unwrap_or(usize::MAX);
            data_segments.push(DataSegment {
                dylib_index,
                segment_index: segment.index,
                kind,
                auth,
                dirty_rank,
            });
        }
    }

    // One region without pointer authentication, four with it.
    let region_specs: Vec<(&str, Option<bool>, u64)> = if arch.supports_auth_pointers {
        vec![
            ("__DATA", Some(false), 0),
            ("__AUTH", Some(true), CACHE_MAPPING_AUTH_DATA),
            ("__DATA_CONST", Some(false), CACHE_MAPPING_CONST_DATA),
            (
                "__AUTH_CONST",
                Some(true),
                CACHE_MAPPING_AUTH_DATA | CACHE_MAPPING_CONST_DATA,
            ),
        ]
    } else {
        vec![("__DATA", None, 0)]
    };

    let mut data_regions = Vec::new();
    for (region_name, want_auth, mut flags) in region_specs {
        let want_const = region_name.ends_with("_CONST");
        let mut members: Vec<&DataSegment> = data_segments
            .iter()
            .filter(|seg| {
                if let Some(want_auth) = want_auth {
                    if seg.auth != want_auth {
                        return false;
                    }
                    if want_const != (seg.kind == DataKind::Const) {
                        return false;
                    }
                }
                true
            })
            .collect();
        if members.is_empty() && region_name != "__DATA" {
            continue;
        }
        // Dirty data first (order file, then name), then plain writable,
        // then const.
        members.sort_by(|a, b| {
            let name_a = &inputs[a.dylib_index].macho.install_name;
            let name_b = &inputs[b.dylib_index].macho.install_name;
            data_kind_rank(a.kind)
                .cmp(&data_kind_rank(b.kind))
                .then_with(|| a.dirty_rank.cmp(&b.dirty_rank))
                .then_with(|| name_a.cmp(name_b))
                .then_with(|| a.segment_index.cmp(&b.segment_index))
        });
        if members.iter().any(|m| m.kind == DataKind::Dirty) {
            flags |= CACHE_MAPPING_DIRTY_DATA;
        }

        let region_base = align(addr, arch.shared_region_align_p2);
        addr = region_base;
        let region_file_offset = align(file_offset, arch.shared_region_align_p2);
        for member in members {
            let input = &inputs[member.dylib_index];
            let segment = &input.macho.segments[member.segment_index];
            let size_of_sections = trimmed_size_of_sections(input, segment);
            addr = align(addr, segment.p2align().max(12));
            let offset_in_region = addr - region_base;
            placements[member.dylib_index].push(SegmentPlacement {
                dylib_index: member.dylib_index,
                segment_index: member.segment_index,
                name: segment.name.clone(),
                src_file_offset: segment.file_offset,
                copy_size: size_of_sections.min(segment.file_size),
                dst_buffer_offset: region_file_offset + offset_in_region,
                dst_unslid_address: addr,
                dst_file_offset: region_file_offset + offset_in_region,
                dst_segment_size: align(size_of_sections, 12),
                dst_file_size: align(size_of_sections, 12),
            });
            addr += align(size_of_sections, 12);
        }

        // CFString constants live at the end of the const data region (or
        // the only data region).
        let holds_cf = coalesced.cf_strings.buffer_size != 0
            && ((arch.supports_auth_pointers && region_name == "__DATA_CONST")
                || (!arch.supports_auth_pointers && region_name == "__DATA"));
        if holds_cf {
            addr = align(addr, 3);
            coalesced.cf_strings.buffer_vmaddr = addr;
            addr += coalesced.cf_strings.buffer_size as u64;
        }

        let region_size = align(addr, arch.shared_region_align_p2) - region_base;
        addr = region_base + region_size;
        data_regions.push(Region {
            name: region_name.to_string(),
            buffer_offset: region_file_offset,
            size_in_use: region_size,
            unslid_load_address: region_base,
            cache_file_offset: region_file_offset,
            init_prot: VM_PROT_READ | VM_PROT_WRITE,
            max_prot: VM_PROT_READ | VM_PROT_WRITE,
            flags,
            slide_info: None,
        });
        file_offset = region_file_offset + region_size;
    }

    // --- Read-only region ---
    let ro_base = match &arch.discontiguous {
        Some(disc) => disc.ro_start,
        None => align(addr + arch.shared_region_padding, arch.shared_region_align_p2),
    };
    let ro_file_offset = file_offset;
    let mut addr = ro_base;

    // Slide-info reservations, one per data region, page-padded so the
    // kernel can wire them independently.
    let slide_info_header_max = 0x30u64;
    for region in &mut data_regions {
        let offset_in_region = addr - ro_base;
        let allocated = align(
            slide_info_header_max
                + (region.size_in_use / arch.page_size() as u64)
                    * arch.slide_info_bytes_per_page as u64
                + 0x4000,
            arch.shared_region_align_p2,
        );
        region.slide_info = Some(SlideInfoReservation {
            buffer_offset: ro_file_offset + offset_in_region,
            allocated_size: allocated,
            file_offset: ro_file_offset + offset_in_region,
            file_size: 0,
        });
        addr += allocated;
    }

    // Read-only (non-link-edit) segments.
    for (dylib_index, input) in inputs.iter().enumerate() {
        for segment in &input.macho.segments {
            if segment.init_prot != VM_PROT_READ || segment.name == "__LINKEDIT" {
                continue;
            }
            let size_of_sections = segment.size_of_sections();
            addr = align(addr, segment.p2align().max(12));
            let offset_in_region = addr - ro_base;
            placements[dylib_index].push(SegmentPlacement {
                dylib_index,
                segment_index: segment.index,
                name: segment.name.clone(),
                src_file_offset: segment.file_offset,
                copy_size: size_of_sections.min(segment.file_size),
                dst_buffer_offset: ro_file_offset + offset_in_region,
                dst_unslid_address: addr,
                dst_file_offset: ro_file_offset + offset_in_region,
                dst_segment_size: align(size_of_sections, 12),
                dst_file_size: size_of_sections,
            });
            addr += align(size_of_sections, 12);
        }
    }

    // Link-edit segments last, 16 KiB aligned, so the merged link-edit can
    // replace them in place.
    addr = align(addr, 14);
    let non_linkedit_read_only_size = addr - ro_base;
    for (dylib_index, input) in inputs.iter().enumerate() {
        for segment in &input.macho.segments {
            if segment.init_prot != VM_PROT_READ || segment.name != "__LINKEDIT" {
                continue;
            }
            let copy_size = segment.file_size.min(segment.size_of_sections());
            addr = align(addr, segment.p2align().max(12));
            let offset_in_region = addr - ro_base;
            placements[dylib_index].push(SegmentPlacement {
                dylib_index,
                segment_index: segment.index,
                name: segment.name.clone(),
                src_file_offset: segment.file_offset,
                copy_size,
                dst_buffer_offset: ro_file_offset + offset_in_region,
                dst_unslid_address: addr,
                dst_file_offset: ro_file_offset + offset_in_region,
                dst_segment_size: align(segment.size_of_sections(), 12),
                dst_file_size: copy_size,
            });
            addr += align(segment.size_of_sections(), 12);
        }
    }

    let ro_end = align(addr, arch.shared_region_align_p2);
    let read_only = Region {
        name: "__LINKEDIT".to_string(),
        buffer_offset: ro_file_offset,
        size_in_use: ro_end - ro_base,
        unslid_load_address: ro_base,
        cache_file_offset: ro_file_offset,
        init_prot: VM_PROT_READ,
        max_prot: VM_PROT_READ,
        flags: 0,
        slide_info: None,
    };
    let total_file_size = ro_file_offset + read_only.size_in_use;

    // Keep each dylib's placements in source segment order.
    for dylib_placements in &mut placements {
        dylib_placements.sort_by_key(|p| p.segment_index);
    }

    CacheLayout {
        read_execute,
        data_regions,
        read_only,
        placements,
        header_reserved_size,
        objc_ro_addr,
        objc_ro_size,
        objc_opt_ro_addr,
        objc_opt_ro_size,
        imp_caches_addr,
        imp_caches_size: imp_caches_aligned,
        non_linkedit_read_only_size,
        total_file_size,
    }
}

/// Look up the placement of one (dylib, segment).
pub fn placement_for<'a>(
    placements: &'a [SegmentPlacement],
    segment_index: usize,
) -> Option<&'a SegmentPlacement> {
    placements.iter().find(|p| p.segment_index == segment_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::layout_for_arch;
    use crate::mach_o::{FileKind, Segment};

    fn fake_macho(install_name: &str, segments: Vec<Segment>) -> MachO {
        MachO {
            path: install_name.to_string(),
            install_name: install_name.to_string(),
            kind: FileKind::Dylib,
            uuid: [0; 16],
            is64: true,
            header_flags: 0,
            ncmds: 0,
            sizeofcmds: 0,
            segments,
            dependencies: Vec::new(),
            symtab: Default::default(),
            dysymtab: Default::default(),
            dyld_info: Default::default(),
            exports_trie_cmd: None,
            chained_fixups_cmd: None,
            split_seg_info: None,
            function_starts: Default::default(),
            data_in_code: Default::default(),
            mtime: 0,
            inode: 1,
            bytes: vec![0; 0x10000],
        }
    }

    fn segment(name: &str, index: usize, vmaddr: u64, vmsize: u64, prot: u32) -> Segment {
        Segment {
            name: name.to_string(),
            vmaddr,
            vmsize,
            file_offset: vmaddr & 0xFFFF,
            file_size: vmsize,
            max_prot: prot,
            init_prot: prot,
            index,
            sections: Vec::new(),
        }
    }

    fn simple_dylib(name: &str) -> MachO {
        fake_macho(
            name,
            vec![
                segment("__TEXT", 0, 0, 0x4000, VM_PROT_READ | VM_PROT_EXECUTE),
                segment("__DATA", 1, 0x4000, 0x1000, VM_PROT_READ | VM_PROT_WRITE),
                segment("__LINKEDIT", 2, 0x8000, 0x1000, VM_PROT_READ),
            ],
        )
    }

    fn plan(inputs: &[LayoutInput<'_>]) -> CacheLayout {
        let mut coalesced = CacheCoalescedText::new();
        assign_segment_addresses(
            inputs,
            layout_for_arch("arm64").unwrap(),
            &mut coalesced,
            0,
            0,
            (0, 0, 0),
            &HashMap::new(),
            &[],
        )
    }

    #[test]
    fn single_dylib_regions() {
        let dylib = simple_dylib("/a.dylib");
        let coalescer = DylibTextCoalescer::default();
        let inputs = [LayoutInput {
            macho: &dylib,
            coalescer: &coalescer,
            segment_has_auth: vec![false; 3],
            supports_const_data: true,
        }];
        let layout = plan(&inputs);

        assert_eq!(layout.read_execute.unslid_load_address, 0x1_8000_0000);
        assert_eq!(layout.data_regions.len(), 1);
        assert_eq!(layout.data_regions[0].unslid_load_address, 0x1_C000_0000);
        assert_eq!(layout.read_only.unslid_load_address, 0x2_0000_0000);

        let text = placement_for(&layout.placements[0], 0).unwrap();
        // First text segment: 16 KiB aligned, after the header reservation.
        assert_eq!(
            text.dst_unslid_address,
            align(0x1_8000_0000 + layout.header_reserved_size, 14)
        );
        let data = placement_for(&layout.placements[0], 1).unwrap();
        assert_eq!(data.dst_unslid_address, 0x1_C000_0000);
        // File layout mirrors address layout order.
        assert!(data.dst_file_offset >= layout.data_regions[0].cache_file_offset);
        let linkedit = placement_for(&layout.placements[0], 2).unwrap();
        assert!(linkedit.dst_unslid_address >= 0x2_0000_0000);
        // Slide info reserved for the data region.
        assert!(layout.data_regions[0].slide_info.is_some());
    }

    #[test]
    fn address_monotonicity() {
        let a = simple_dylib("/a.dylib");
        let b = simple_dylib("/b.dylib");
        let ca = DylibTextCoalescer::default();
        let cb = DylibTextCoalescer::default();
        let inputs = [
            LayoutInput {
                macho: &a,
                coalescer: &ca,
                segment_has_auth: vec![false; 3],
                supports_const_data: true,
            },
            LayoutInput {
                macho: &b,
                coalescer: &cb,
                segment_has_auth: vec![false; 3],
                supports_const_data: true,
            },
        ];
        let layout = plan(&inputs);
        // Within each region, address order == file order == buffer order.
        let mut all: Vec<&SegmentPlacement> =
            layout.placements.iter().flatten().collect();
        all.sort_by_key(|p| p.dst_unslid_address);
        for pair in all.windows(2) {
            if pair[0].dst_unslid_address < pair[1].dst_unslid_address {
                assert!(pair[0].dst_file_offset < pair[1].dst_file_offset);
                assert!(pair[0].dst_buffer_offset < pair[1].dst_buffer_offset);
            }
        }
    }

    #[test]
    fn dirty_data_sorts_first() {
        let mut a = simple_dylib("/a.dylib");
        a.segments
            .push(segment("__DATA_DIRTY", 3, 0x9000, 0x1000, VM_PROT_READ | VM_PROT_WRITE));
        let ca = DylibTextCoalescer::default();
        let inputs = [LayoutInput {
            macho: &a,
            coalescer: &ca,
            segment_has_auth: vec![false; 4],
            supports_const_data: true,
        }];
        let layout = plan(&inputs);
        let dirty = placement_for(&layout.placements[0], 3).unwrap();
        let plain = placement_for(&layout.placements[0], 1).unwrap();
        assert!(dirty.dst_unslid_address < plain.dst_unslid_address);
        assert!(layout.data_regions[0].flags & CACHE_MAPPING_DIRTY_DATA != 0);
    }

    #[test]
    fn auth_arch_splits_data_regions() {
        let mut a = simple_dylib("/a.dylib");
        a.segments
            .push(segment("__DATA_CONST", 3, 0x9000, 0x1000, VM_PROT_READ | VM_PROT_WRITE));
        let ca = DylibTextCoalescer::default();
        let mut coalesced = CacheCoalescedText::new();
        let inputs = [LayoutInput {
            macho: &a,
            coalescer: &ca,
            // __DATA has auth fixups, __DATA_CONST doesn't.
            segment_has_auth: vec![false, true, false, false],
            supports_const_data: true,
        }];
        let layout = assign_segment_addresses(
            &inputs,
            layout_for_arch("arm64e").unwrap(),
            &mut coalesced,
            0,
            0,
            (0, 0, 0),
            &HashMap::new(),
            &[],
        );
        let names: Vec<&str> = layout.data_regions.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"__AUTH"));
        assert!(names.contains(&"__DATA_CONST"));
        let auth = layout
            .data_regions
            .iter()
            .find(|r| r.name == "__AUTH")
            .unwrap();
        assert!(auth.flags & CACHE_MAPPING_AUTH_DATA != 0);
        let data_placement = placement_for(&layout.placements[0], 1).unwrap();
        assert!(auth.contains_address(data_placement.dst_unslid_address));
    }

    #[test]
    fn overflow_detection() {
        // A text segment bigger than the 1 GiB arm64 text window.
        let dylib = fake_macho(
            "/huge.dylib",
            vec![segment(
                "__TEXT",
                0,
                0,
                0x4100_0000,
                VM_PROT_READ | VM_PROT_EXECUTE,
            )],
        );
        let coalescer = DylibTextCoalescer::default();
        let inputs = [LayoutInput {
            macho: &dylib,
            coalescer: &coalescer,
            segment_has_auth: vec![false],
            supports_const_data: true,
        }];
        let layout = plan(&inputs);
        let arch = layout_for_arch("arm64").unwrap();
        assert!(layout.cache_overflow_amount(arch) > 0x100_0000);
    }
}
