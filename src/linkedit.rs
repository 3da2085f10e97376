/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The link-edit merger: one shared link-edit region for the whole cache.
//!
//! Every dylib's bind/export/function-start/data-in-code blobs are
//! concatenated, symbol tables are copied (locals, then exports, then
//! imports per dylib) with strings sunk into one sorted deduplicated pool,
//! and indirect symbol tables are remapped through the old→new index map.
//! The merged region replaces the per-dylib link-edit area planned by the
//! layout, and the read-only region shrinks to match.
//!
//! Optionally, local symbols move to a separate unmapped region appended
//! after the cache file; the mapped table keeps one `<redacted>` entry per
//! text symbol so backtraces still resolve to the right image.

use crate::adjust::AdjustedLinkedit;
use crate::cache_format::align;
use crate::endian::{cstr, get32, set32};
use crate::layout::CacheLayout;
use crate::mach_o::{MachO, Nlist, N_EXT, N_SECT, N_TYPE};

const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

const REDACTED: &str = "<redacted>";

/// Header of the unmapped local-symbols file.
const LOCAL_SYMBOLS_INFO_SIZE: usize = 24;
const LOCAL_SYMBOLS_ENTRY_SIZE: usize = 12;

/// Where one dylib's tables live in the merged region, for the final load
/// command patch.
#[derive(Debug, Copy, Clone, Default)]
struct MergedDylibOffsets {
    bind: (u32, u32),
    weak_bind: (u32, u32),
    lazy_bind: (u32, u32),
    export: (u32, u32),
    function_starts: (u32, u32),
    data_in_code: (u32, u32),
    symtab: u32,
    nsyms: u32,
    nlocal: u32,
    nextdef: u32,
    nundef: u32,
    indirectsym: u32,
    nindirect: u32,
}

pub struct MergedLinkedit {
    /// New `size_in_use` for the read-only region.
    pub read_only_size_in_use: u64,
    /// The unmapped local-symbols file, if locals were stripped.
    pub local_symbols: Option<Vec<u8>>,
}

/// Merge all dylibs' link-edit into the reserved area and patch their load
/// commands. `adjusted[i]` describes where dylib `i`'s rebuilt blobs
/// currently sit in `buffer`.
pub fn optimize_linkedit(
    buffer: &mut [u8],
    layout: &CacheLayout,
    dylibs: &[MachO],
    adjusted: &[AdjustedLinkedit],
    exclude_locals: bool,
) -> Result<MergedLinkedit, String> {
    let merged_start_in_region = layout.non_linkedit_read_only_size;
    let merged_file_offset =
        layout.read_only.cache_file_offset + merged_start_in_region;

    let mut merged: Vec<u8> = Vec::new();
    let align8 = |v: &mut Vec<u8>| {
        while v.len() % 8 != 0 {
            v.push(0);
        }
    };

    let mut per_dylib = vec![MergedDylibOffsets::default(); dylibs.len()];

    // 1. Concatenate the opcode blobs and per-dylib tables. Bind info of
    // chained-fixup dylibs is skipped: the chains it described no longer
    // exist.
    for (index, macho) in dylibs.iter().enumerate() {
        let src = &adjusted[index];
        let mut copy = |range: (u32, u32), merged: &mut Vec<u8>| -> (u32, u32) {
            if range.1 == 0 {
                return (0, 0);
            }
            let offset = merged.len() as u32;
            merged.extend_from_slice(
                &buffer[range.0 as usize..(range.0 + range.1) as usize],
            );
            (offset, range.1)
        };
        per_dylib[index].weak_bind = copy(src.weak_bind, &mut merged);
        per_dylib[index].export = copy(src.export, &mut merged);
        if !macho.has_chained_fixups() {
            per_dylib[index].bind = copy(src.bind, &mut merged);
            per_dylib[index].lazy_bind = copy(src.lazy_bind, &mut merged);
        }
        per_dylib[index].function_starts = copy(src.function_starts, &mut merged);
        per_dylib[index].data_in_code = copy(src.data_in_code, &mut merged);
        align8(&mut merged);
    }

    // 2. Copy symbol tables: locals, exports, imports, building the old→new
    // index map and interning strings.
    let mut strings = StringPool::new();
    let mut symbol_remap: Vec<Vec<u32>> = Vec::with_capacity(dylibs.len());
    let mut new_symtabs: Vec<Vec<(Nlist, u32)>> = Vec::with_capacity(dylibs.len()); // (entry, string id)
    let mut locals_out = LocalSymbols::new(exclude_locals);

    for (index, macho) in dylibs.iter().enumerate() {
        let src = &adjusted[index];
        let nlist_size = Nlist::size(macho.is64);
        let read_nlist = |i: u32| -> Nlist {
            let offset = src.symtab as usize + i as usize * nlist_size;
            read_nlist_at(buffer, offset, macho.is64)
        };
        let read_name = |nlist: &Nlist| -> Result<String, String> {
            if nlist.n_strx == 0 {
                return Ok(String::new());
            }
            Ok(cstr(
                buffer,
                src.strings.0 as usize + nlist.n_strx as usize,
            )?
            .to_string())
        };

        let text_section_ordinal = text_section_ordinal(macho);
        let mut remap = vec![u32::MAX; macho.symtab.nsyms as usize];
        let mut table: Vec<(Nlist, u32)> = Vec::new();

        let mut classified: [Vec<u32>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for i in 0..src.nsyms {
            let nlist = read_nlist(i);
            let class = if nlist.is_stab() {
                0 // stabs count as locals
            } else if nlist.n_type & N_EXT == 0 {
                0
            } else if nlist.n_type & N_TYPE == N_SECT {
                1 // defined export
            } else {
                2 // import
            };
            classified[class].push(i);
        }

        for &i in &classified[0] {
            let nlist = read_nlist(i);
            if nlist.is_stab() {
                continue; // debug stabs never make it into the cache
            }
            let name = read_name(&nlist)?;
            locals_out.add(index, &nlist, &name);
            if exclude_locals {
                // Keep a redacted marker only for text symbols.
                if nlist.is_defined_in_section()
                    && Some(nlist.n_sect) == text_section_ordinal
                {
                    let mut redacted = nlist;
                    redacted.n_desc = 0;
                    remap[i as usize] = table.len() as u32;
                    table.push((redacted, strings.intern(REDACTED)));
                }
                continue;
            }
            remap[i as usize] = table.len() as u32;
            table.push((nlist, strings.intern(&name)));
        }
        per_dylib[index].nlocal = table.len() as u32;
        for &i in &classified[1] {
            let nlist = read_nlist(i);
            let name = read_name(&nlist)?;
            remap[i as usize] = table.len() as u32;
            table.push((nlist, strings.intern(&name)));
        }
        per_dylib[index].nextdef = table.len() as u32 - per_dylib[index].nlocal;
        for &i in &classified[2] {
            let nlist = read_nlist(i);
            let name = read_name(&nlist)?;
            remap[i as usize] = table.len() as u32;
            table.push((nlist, strings.intern(&name)));
        }
        per_dylib[index].nundef =
            table.len() as u32 - per_dylib[index].nlocal - per_dylib[index].nextdef;

        symbol_remap.push(remap);
        new_symtabs.push(table);
    }

    // Symbol tables land after the blobs.
    for (index, macho) in dylibs.iter().enumerate() {
        align8(&mut merged);
        per_dylib[index].symtab = merged.len() as u32;
        per_dylib[index].nsyms = new_symtabs[index].len() as u32;
        let nlist_size = Nlist::size(macho.is64);
        for (nlist, _) in &new_symtabs[index] {
            let at = merged.len();
            merged.resize(at + nlist_size, 0);
            nlist.write(&mut merged, at, macho.is64);
        }
    }

    // 4. Indirect symbol tables, remapped.
    for (index, macho) in dylibs.iter().enumerate() {
        let src = &adjusted[index];
        align8(&mut merged);
        per_dylib[index].indirectsym = merged.len() as u32;
        if src.indirectsym == 0 {
            continue; // dylib had none, or was left unadjusted
        }
        per_dylib[index].nindirect = macho.dysymtab.nindirectsyms;
        for i in 0..macho.dysymtab.nindirectsyms {
            let entry = get32(buffer, src.indirectsym as usize + i as usize * 4);
            let remapped = if entry & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
                entry
            } else {
                let new = symbol_remap[index]
                    .get(entry as usize)
                    .copied()
                    .unwrap_or(u32::MAX);
                if new == u32::MAX {
                    // Symbol went to the unmapped locals file.
                    INDIRECT_SYMBOL_LOCAL
                } else {
                    new
                }
            };
            let at = merged.len();
            merged.resize(at + 4, 0);
            set32(&mut merged, at, remapped);
        }
    }

    // 5. The deduplicated string pool.
    align8(&mut merged);
    let strings_offset = merged.len() as u32;
    let string_pool = strings.build();
    merged.extend_from_slice(&string_pool.bytes);

    // The merged region must fit in the space the per-dylib link-edit
    // occupied.
    let available = layout.read_only.size_in_use - merged_start_in_region;
    if merged.len() as u64 > available {
        return Err(format!(
            "merged link-edit ({} bytes) exceeds reserved area ({} bytes)",
            merged.len(),
            available
        ));
    }
    let dst = (layout.read_only.buffer_offset + merged_start_in_region) as usize;
    buffer[dst..dst + merged.len()].copy_from_slice(&merged);
    for byte in &mut buffer[dst + merged.len()..(layout.read_only.buffer_offset
        + layout.read_only.size_in_use) as usize]
    {
        *byte = 0;
    }

    // 6. Point every dylib's load commands at the shared tables.
    for (index, macho) in dylibs.iter().enumerate() {
        let offsets = &per_dylib[index];
        let string_offset_of = |table: &[(Nlist, u32)], entry: usize| -> u32 {
            string_pool.offsets[table[entry].1 as usize]
        };
        // Fix n_strx now that pool offsets are known.
        let symtab_file = merged_file_offset + offsets.symtab as u64;
        let nlist_size = Nlist::size(macho.is64);
        for entry in 0..new_symtabs[index].len() {
            let at = dst + offsets.symtab as usize + entry * nlist_size;
            let strx = string_offset_of(&new_symtabs[index], entry);
            set32(buffer, at, strx);
        }

        patch_load_commands(
            buffer,
            layout,
            index,
            macho,
            &PatchedOffsets {
                bind: relocate(offsets.bind, merged_file_offset),
                weak_bind: relocate(offsets.weak_bind, merged_file_offset),
                lazy_bind: relocate(offsets.lazy_bind, merged_file_offset),
                export: relocate(offsets.export, merged_file_offset),
                function_starts: relocate(offsets.function_starts, merged_file_offset),
                data_in_code: relocate(offsets.data_in_code, merged_file_offset),
                symtab: symtab_file as u32,
                nsyms: offsets.nsyms,
                nlocal: offsets.nlocal,
                nextdef: offsets.nextdef,
                nundef: offsets.nundef,
                indirectsym: (merged_file_offset + offsets.indirectsym as u64) as u32,
                strings: (
                    (merged_file_offset + strings_offset as u64) as u32,
                    string_pool.bytes.len() as u32,
                ),
            },
        )?;
    }

    let read_only_size_in_use = align(
        merged_start_in_region + merged.len() as u64,
        14,
    );
    Ok(MergedLinkedit {
        read_only_size_in_use,
        local_symbols: locals_out.build(dylibs, layout),
    })
}

fn relocate(range: (u32, u32), base: u64) -> (u32, u32) {
    if range.1 == 0 {
        (0, 0)
    } else {
        ((base + range.0 as u64) as u32, range.1)
    }
}

fn read_nlist_at(buffer: &[u8], offset: usize, is64: bool) -> Nlist {
    Nlist {
        n_strx: get32(buffer, offset),
        n_type: buffer[offset + 4],
        n_sect: buffer[offset + 5],
        n_desc: crate::endian::get16(buffer, offset + 6),
        n_value: if is64 {
            crate::endian::get64(buffer, offset + 8)
        } else {
            get32(buffer, offset + 8) as u64
        },
    }
}

/// 1-based ordinal of `__TEXT,__text` across all sections, as used by
/// `n_sect`.
fn text_section_ordinal(macho: &MachO) -> Option<u8> {
    let mut ordinal = 1u8;
    for segment in &macho.segments {
        for section in &segment.sections {
            if section.segment_name == "__TEXT" && section.name == "__text" {
                return Some(ordinal);
            }
            ordinal = ordinal.wrapping_add(1);
        }
    }
    None
}

/// Sorted, deduplicated string pool. Index 0 is the empty string, so the
/// pool starts with a NUL byte.
struct StringPool {
    ids: std::collections::HashMap<String, u32>,
    strings: Vec<String>,
}

struct BuiltStringPool {
    bytes: Vec<u8>,
    /// Pool byte offset per string id.
    offsets: Vec<u32>,
}

impl StringPool {
    fn new() -> StringPool {
        let mut pool = StringPool {
            ids: std::collections::HashMap::new(),
            strings: Vec::new(),
        };
        pool.intern("");
        pool
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.ids.insert(s.to_string(), id);
        self.strings.push(s.to_string());
        id
    }

    fn build(self) -> BuiltStringPool {
        let mut order: Vec<u32> = (0..self.strings.len() as u32).collect();
        order.sort_by(|&a, &b| self.strings[a as usize].cmp(&self.strings[b as usize]));
        let mut offsets = vec![0u32; self.strings.len()];
        let mut bytes = Vec::new();
        for id in order {
            offsets[id as usize] = bytes.len() as u32;
            bytes.extend_from_slice(self.strings[id as usize].as_bytes());
            bytes.push(0);
        }
        BuiltStringPool { bytes, offsets }
    }
}

/// Accumulates the unmapped local-symbols file.
struct LocalSymbols {
    enabled: bool,
    /// (dylib index, nlist, name)
    entries: Vec<(usize, Nlist, String)>,
}

impl LocalSymbols {
    fn new(enabled: bool) -> LocalSymbols {
        LocalSymbols {
            enabled,
            entries: Vec::new(),
        }
    }

    fn add(&mut self, dylib_index: usize, nlist: &Nlist, name: &str) {
        if self.enabled {
            self.entries.push((dylib_index, *nlist, name.to_string()));
        }
    }

    /// Emit the local-symbols file:
    /// `info / entries[] / nlists / strings`.
    fn build(self, dylibs: &[MachO], layout: &CacheLayout) -> Option<Vec<u8>> {
        if !self.enabled {
            return None;
        }
        let mut out = Vec::new();
        let entries_offset = LOCAL_SYMBOLS_INFO_SIZE;
        let nlist_offset = entries_offset + dylibs.len() * LOCAL_SYMBOLS_ENTRY_SIZE;
        let nlist_size = Nlist::size(true);

        let mut strings = Vec::new();
        strings.push(0u8);
        let mut nlists = Vec::new();
        let mut per_dylib: Vec<(u32, u32)> = vec![(0, 0); dylibs.len()];
        let mut count = 0u32;
        for dylib_index in 0..dylibs.len() {
            let start = count;
            for (_, nlist, name) in self.entries.iter().filter(|(i, _, _)| *i == dylib_index) {
                let mut copy = *nlist;
                copy.n_strx = strings.len() as u32;
                strings.extend_from_slice(name.as_bytes());
                strings.push(0);
                let at = nlists.len();
                nlists.resize(at + nlist_size, 0);
                copy.write(&mut nlists, at, true);
                count += 1;
            }
            per_dylib[dylib_index] = (start, count - start);
        }

        let strings_offset = nlist_offset + nlists.len();
        out.resize(LOCAL_SYMBOLS_INFO_SIZE, 0);
        set32(&mut out, 0, nlist_offset as u32);
        set32(&mut out, 4, count);
        set32(&mut out, 8, strings_offset as u32);
        set32(&mut out, 12, strings.len() as u32);
        set32(&mut out, 16, entries_offset as u32);
        set32(&mut out, 20, dylibs.len() as u32);
        for (dylib_index, &(start, n)) in per_dylib.iter().enumerate() {
            let at = out.len();
            out.resize(at + LOCAL_SYMBOLS_ENTRY_SIZE, 0);
            // Offset of the dylib's mach_header in the cache file.
            let header_offset = layout.placements[dylib_index]
                .iter()
                .find(|p| p.segment_index == 0)
                .map(|p| p.dst_file_offset)
                .unwrap_or(0);
            set32(&mut out, at, header_offset as u32);
            set32(&mut out, at + 4, start);
            set32(&mut out, at + 8, n);
        }
        out.extend_from_slice(&nlists);
        out.extend_from_slice(&strings);
        Some(out)
    }
}

/// Point a dylib's load commands at the merged tables. The command list was
/// already culled by the adjuster, so only update offsets here.
struct PatchedOffsets {
    bind: (u32, u32),
    weak_bind: (u32, u32),
    lazy_bind: (u32, u32),
    export: (u32, u32),
    function_starts: (u32, u32),
    data_in_code: (u32, u32),
    symtab: u32,
    nsyms: u32,
    nlocal: u32,
    nextdef: u32,
    nundef: u32,
    indirectsym: u32,
    strings: (u32, u32),
}

fn patch_load_commands(
    buffer: &mut [u8],
    layout: &CacheLayout,
    dylib_index: usize,
    macho: &MachO,
    offsets: &PatchedOffsets,
) -> Result<(), String> {
    use crate::mach_o::{
        LC_DATA_IN_CODE, LC_DYLD_EXPORTS_TRIE, LC_DYLD_INFO, LC_DYLD_INFO_ONLY, LC_DYSYMTAB,
        LC_FUNCTION_STARTS, LC_SYMTAB,
    };
    let text = layout.placements[dylib_index]
        .iter()
        .find(|p| p.segment_index == 0)
        .ok_or_else(|| "dylib has no text placement".to_string())?;
    let header = text.dst_buffer_offset as usize;
    let header_size = if macho.is64 { 32 } else { 28 };
    let ncmds = get32(buffer, header + 16);
    let mut pos = header + header_size;
    for _ in 0..ncmds {
        let cmd = get32(buffer, pos);
        let cmdsize = get32(buffer, pos + 4) as usize;
        match cmd {
            LC_SYMTAB => {
                set32(buffer, pos + 8, offsets.symtab);
                set32(buffer, pos + 12, offsets.nsyms);
                set32(buffer, pos + 16, offsets.strings.0);
                set32(buffer, pos + 20, offsets.strings.1);
            }
            LC_DYSYMTAB => {
                // The local/extdef/undef ranges follow the new copy order.
                set32(buffer, pos + 8, 0);
                set32(buffer, pos + 12, offsets.nlocal);
                set32(buffer, pos + 16, offsets.nlocal);
                set32(buffer, pos + 20, offsets.nextdef);
                set32(buffer, pos + 24, offsets.nlocal + offsets.nextdef);
                set32(buffer, pos + 28, offsets.nundef);
                set32(buffer, pos + 56, offsets.indirectsym);
                // Classic external relocations are dead once binds resolve.
                set32(buffer, pos + 64, 0);
                set32(buffer, pos + 68, 0);
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                set32(buffer, pos + 16, offsets.bind.0);
                set32(buffer, pos + 20, offsets.bind.1);
                set32(buffer, pos + 24, offsets.weak_bind.0);
                set32(buffer, pos + 28, offsets.weak_bind.1);
                set32(buffer, pos + 32, offsets.lazy_bind.0);
                set32(buffer, pos + 36, offsets.lazy_bind.1);
                set32(buffer, pos + 40, offsets.export.0);
                set32(buffer, pos + 44, offsets.export.1);
            }
            LC_DYLD_EXPORTS_TRIE => {
                set32(buffer, pos + 8, offsets.export.0);
                set32(buffer, pos + 12, offsets.export.1);
            }
            LC_FUNCTION_STARTS => {
                set32(buffer, pos + 8, offsets.function_starts.0);
                set32(buffer, pos + 12, offsets.function_starts.1);
            }
            LC_DATA_IN_CODE => {
                set32(buffer, pos + 8, offsets.data_in_code.0);
                set32(buffer, pos + 12, offsets.data_in_code.1);
            }
            _ => (),
        }
        pos += cmdsize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_pool_is_sorted_and_deduped() {
        let mut pool = StringPool::new();
        let a = pool.intern("_zeta");
        let b = pool.intern("_alpha");
        let c = pool.intern("_zeta");
        assert_eq!(a, c);
        let built = pool.build();
        // Starts with NUL (the empty string).
        assert_eq!(built.bytes[0], 0);
        // "_alpha" sorts before "_zeta".
        assert!(built.offsets[b as usize] < built.offsets[a as usize]);
        let alpha = built.offsets[b as usize] as usize;
        assert_eq!(&built.bytes[alpha..alpha + 7], b"_alpha\0");
        // Every offset dereferences to its own string exactly once.
        let count = built
            .bytes
            .windows(7)
            .filter(|w| *w == b"_alpha\0")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn text_ordinal_counts_across_segments() {
        use crate::mach_o::{FileKind, Section, Segment};
        let macho = MachO {
            path: "/t.dylib".into(),
            install_name: "/t.dylib".into(),
            kind: FileKind::Dylib,
            uuid: [0; 16],
            is64: true,
            header_flags: 0,
            ncmds: 0,
            sizeofcmds: 0,
            segments: vec![Segment {
                name: "__TEXT".into(),
                vmaddr: 0,
                vmsize: 0x1000,
                file_offset: 0,
                file_size: 0x1000,
                max_prot: 5,
                init_prot: 5,
                index: 0,
                sections: vec![
                    Section {
                        segment_name: "__TEXT".into(),
                        name: "__stubs".into(),
                        addr: 0,
                        size: 8,
                        file_offset: 0,
                        p2align: 2,
                        sect_type: 0,
                        reserved1: 0,
                        reserved2: 0,
                    },
                    Section {
                        segment_name: "__TEXT".into(),
                        name: "__text".into(),
                        addr: 8,
                        size: 8,
                        file_offset: 8,
                        p2align: 2,
                        sect_type: 0,
                        reserved1: 0,
                        reserved2: 0,
                    },
                ],
            }],
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
            inode: 0,
            bytes: Vec::new(),
        };
        assert_eq!(text_section_ordinal(&macho), Some(2));
    }
}
