/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Coalescing of duplicated read-only text across dylibs.
//!
//! Three string sections (`__objc_classname`, `__objc_methname`,
//! `__objc_methtype`) and the `__cfstring` constant-object section are
//! removed from each dylib's layout and interned into shared pools. Every
//! dylib keeps a map from "offset in its original section" to "offset in the
//! pool", which the segment adjuster uses to retarget references.
//!
//! Method names are special: their pool is the one the selector placer laid
//! out, so participating strings take the addresses chosen there and
//! everything else goes through the hole map's best-fit allocator.

use crate::endian::get64;
use crate::mach_o::fixups::FixupIndex;
use crate::mach_o::{MachO, Section};
use crate::objc::selectors::{HoleMap, SelectorArena};
use std::collections::BTreeMap;

/// `__TEXT` sections eligible for string coalescing.
pub const SUPPORTED_SECTIONS: [&str; 3] =
    ["__objc_classname", "__objc_methname", "__objc_methtype"];

/// Size of one 64-bit CFString constant: isa, flags, cstring pointer,
/// length.
pub const CFSTRING_ATOM_SIZE: u64 = 32;

pub const CF_CONSTANT_STRING_CLASS: &str = "___CFConstantStringClassReference";

/// Per-dylib map: original section offset -> pool offset.
pub type SectionOffsetMap = BTreeMap<u32, u32>;

/// The per-dylib record of which sections were coalesced away.
#[derive(Default)]
pub struct DylibTextCoalescer {
    pub objc_class_names: SectionOffsetMap,
    pub objc_meth_names: SectionOffsetMap,
    pub objc_meth_types: SectionOffsetMap,
    pub cf_strings: SectionOffsetMap,
}

impl DylibTextCoalescer {
    pub fn map_for_section(&self, segment: &str, section: &str) -> Option<&SectionOffsetMap> {
        match (segment, section) {
            ("__TEXT", "__objc_classname") => Some(&self.objc_class_names),
            ("__TEXT", "__objc_methname") => Some(&self.objc_meth_names),
            ("__TEXT", "__objc_methtype") => Some(&self.objc_meth_types),
            ("__DATA" | "__DATA_CONST" | "__DATA_DIRTY" | "__AUTH_CONST", "__cfstring") => {
                Some(&self.cf_strings)
            }
            _ => None,
        }
    }

    pub fn section_was_coalesced(&self, segment: &str, section: &str) -> bool {
        self.map_for_section(segment, section)
            .map(|m| !m.is_empty())
            .unwrap_or(false)
    }

    /// Translate an offset in the original section to a pool offset. Fixups
    /// may point into the middle of an atom; the map only records atom
    /// starts, so fall back to the closest preceding entry.
    pub fn translate_offset(map: &SectionOffsetMap, offset: u32) -> Option<u32> {
        let (&atom_start, &pool_offset) = map.range(..=offset).next_back()?;
        Some(pool_offset + (offset - atom_start))
    }
}

/// One shared deduplicated string pool.
#[derive(Default)]
pub struct StringSection {
    pub strings_to_offsets: BTreeMap<String, u32>,
    pub buffer_size: u32,
    /// Filled in by the layout planner.
    pub buffer_vmaddr: u64,
    /// Bytes that duplicate elimination avoided; debugging only.
    pub saved_space: u64,
}

impl StringSection {
    fn intern(&mut self, string: &str) -> u32 {
        if let Some(&offset) = self.strings_to_offsets.get(string) {
            self.saved_space += string.len() as u64 + 1;
            return offset;
        }
        let offset = self.buffer_size;
        self.strings_to_offsets
            .insert(string.to_string(), offset);
        self.buffer_size += string.len() as u32 + 1;
        offset
    }

    /// Write the pool's contents into `buffer`.
    pub fn emit(&self, buffer: &mut [u8]) {
        for (string, &offset) in &self.strings_to_offsets {
            let offset = offset as usize;
            buffer[offset..offset + string.len()].copy_from_slice(string.as_bytes());
            buffer[offset + string.len()] = 0;
        }
    }
}

/// One merged CFString constant.
pub struct CfStringAtom {
    /// Pool offset of the 32-byte atom.
    pub pool_offset: u32,
    /// The `flags` word copied from the source atom.
    pub flags: u64,
    /// The character data stays in its source dylib's `__TEXT`; this is
    /// (dylib index, original string vmaddr) so the emitter can point the
    /// atom at the string's new home.
    pub string_source: (usize, u64),
    pub length: u64,
}

/// The merged `__cfstring` section.
#[derive(Default)]
pub struct CfSection {
    /// (string bytes, flags, length) -> atom pool offset.
    atoms_by_content: BTreeMap<(Vec<u8>, u64, u64), u32>,
    pub atoms: Vec<CfStringAtom>,
    pub buffer_size: u32,
    pub buffer_vmaddr: u64,
    /// Install name of the dylib exporting the isa class.
    pub isa_install_name: Option<String>,
    pub isa_class_name: &'static str,
}

impl CfSection {
    fn intern(
        &mut self,
        string: &[u8],
        flags: u64,
        length: u64,
        string_source: (usize, u64),
    ) -> u32 {
        let key = (string.to_vec(), flags, length);
        if let Some(&offset) = self.atoms_by_content.get(&key) {
            return offset;
        }
        let offset = self.buffer_size;
        self.buffer_size += CFSTRING_ATOM_SIZE as u32;
        self.atoms_by_content.insert(key, offset);
        self.atoms.push(CfStringAtom {
            pool_offset: offset,
            flags,
            string_source,
            length,
        });
        offset
    }
}

/// All shared text pools for one cache.
pub struct CacheCoalescedText {
    pub objc_class_names: StringSection,
    pub objc_meth_names: StringSection,
    pub objc_meth_types: StringSection,
    pub cf_strings: CfSection,
}

impl CacheCoalescedText {
    pub fn new() -> CacheCoalescedText {
        CacheCoalescedText {
            objc_class_names: StringSection::default(),
            objc_meth_names: StringSection::default(),
            objc_meth_types: StringSection::default(),
            cf_strings: CfSection {
                isa_class_name: CF_CONSTANT_STRING_CLASS,
                ..CfSection::default()
            },
        }
    }

    pub fn clear(&mut self) {
        self.objc_class_names = StringSection::default();
        self.objc_meth_names = StringSection::default();
        self.objc_meth_types = StringSection::default();
        let isa_class_name = self.cf_strings.isa_class_name;
        self.cf_strings = CfSection {
            isa_class_name,
            ..CfSection::default()
        };
    }

    pub fn string_section(&self, name: &str) -> &StringSection {
        match name {
            "__objc_classname" => &self.objc_class_names,
            "__objc_methname" => &self.objc_meth_names,
            "__objc_methtype" => &self.objc_meth_types,
            _ => panic!("unsupported coalesced section {}", name),
        }
    }

    fn string_section_mut(&mut self, name: &str) -> &mut StringSection {
        match name {
            "__objc_classname" => &mut self.objc_class_names,
            "__objc_methname" => &mut self.objc_meth_names,
            "__objc_methtype" => &mut self.objc_meth_types,
            _ => panic!("unsupported coalesced section {}", name),
        }
    }

    /// Intern every string of the dylib's coalescable `__TEXT` sections,
    /// recording the offset mapping. Only split-seg-v2 dylibs participate:
    /// without the edge list the adjuster could not retarget references into
    /// the removed sections.
    pub fn parse_coalescable_text(
        &mut self,
        macho: &MachO,
        coalescer: &mut DylibTextCoalescer,
        selectors: &SelectorArena,
        hole_map: &mut HoleMap,
    ) {
        if !macho.has_split_seg_v2() {
            return;
        }
        for section_name in SUPPORTED_SECTIONS {
            let Some(section) = macho.section("__TEXT", section_name) else {
                continue;
            };
            let is_method_names = section_name == "__objc_methname";
            let map = match section_name {
                "__objc_classname" => &mut coalescer.objc_class_names,
                "__objc_methname" => &mut coalescer.objc_meth_names,
                _ => &mut coalescer.objc_meth_types,
            };
            let start = section.file_offset as usize;
            let end = start + section.size as usize;
            let bytes = &macho.bytes[start..end];
            let mut offset = 0usize;
            while offset < bytes.len() {
                let len = match bytes[offset..].iter().position(|&b| b == 0) {
                    Some(len) => len,
                    None => break, // malformed trailing bytes, not a string
                };
                let string = match std::str::from_utf8(&bytes[offset..offset + len]) {
                    Ok(s) => s,
                    Err(_) => {
                        offset += len + 1;
                        continue;
                    }
                };
                let pool_offset = if is_method_names {
                    // Selector addresses were decided by the placer; other
                    // method names best-fit into its holes.
                    match selectors.lookup(string) {
                        Some(id) if !selectors.get(id).classes.is_empty() || id == 0 => {
                            let section = self.string_section_mut("__objc_methname");
                            section
                                .strings_to_offsets
                                .entry(string.to_string())
                                .or_insert(selectors.get(id).offset);
                            selectors.get(id).offset
                        }
                        _ => {
                            let section = self.string_section_mut("__objc_methname");
                            if let Some(&existing) = section.strings_to_offsets.get(string) {
                                existing
                            } else {
                                let pool_offset =
                                    hole_map.add_string_of_size(len as u32 + 1);
                                section
                                    .strings_to_offsets
                                    .insert(string.to_string(), pool_offset);
                                pool_offset
                            }
                        }
                    }
                } else {
                    self.string_section_mut(section_name).intern(string)
                };
                map.insert(offset as u32, pool_offset);
                offset += len + 1;
            }
        }
        // The method-name pool spans everything the hole map handed out.
        self.objc_meth_names.buffer_size = self
            .objc_meth_names
            .buffer_size
            .max(hole_map.end_address());
    }

    /// Merge the dylib's `__cfstring` atoms, if the section qualifies:
    /// 64-bit with chained fixups and split-seg v2, 32-byte atoms, no
    /// symbols pointing into the section, every isa a bind to the CFString
    /// class, every atom exactly one rebase to a C string.
    pub fn parse_cf_constants(
        &mut self,
        dylib_index: usize,
        macho: &MachO,
        fixups: &FixupIndex,
        coalescer: &mut DylibTextCoalescer,
    ) -> Result<(), String> {
        if !macho.is64 || !macho.has_chained_fixups() || !macho.has_split_seg_v2() {
            return Ok(());
        }
        let Some(section) = find_cfstring_section(macho) else {
            return Ok(());
        };
        if section.size % CFSTRING_ATOM_SIZE != 0 {
            return Ok(());
        }

        // No symbol may point into the section: a named atom can't move.
        for i in 0..macho.symtab.nsyms {
            let nlist = macho.nlist(i);
            if nlist.is_defined_in_section()
                && nlist.n_value >= section.addr
                && nlist.n_value < section.addr + section.size
            {
                return Ok(());
            }
        }

        let section_addr = section.addr;
        let atom_count = section.size / CFSTRING_ATOM_SIZE;
        let mut isa_ordinal: Option<i64> = None;
        let mut parsed = Vec::new();
        for i in 0..atom_count {
            let atom_addr = section_addr + i * CFSTRING_ATOM_SIZE;
            // isa must bind to the constant-string class, all atoms through
            // the same exporter.
            let Some(bind) = fixups.bind_at(macho, atom_addr) else {
                return Ok(());
            };
            if bind.symbol != CF_CONSTANT_STRING_CLASS {
                return Ok(());
            }
            match isa_ordinal {
                None => isa_ordinal = Some(bind.lib_ordinal),
                Some(ordinal) if ordinal == bind.lib_ordinal => (),
                Some(_) => return Ok(()),
            }
            // Exactly one rebase: the C-string pointer.
            let Some(string_addr) = fixups.rebase_target_at(macho, atom_addr + 16) else {
                return Ok(());
            };
            let Some(string_offset) = macho.file_offset_for_address(string_addr) else {
                return Ok(());
            };
            let flags_offset = macho.file_offset_for_address(atom_addr + 8).unwrap();
            let length_offset = macho.file_offset_for_address(atom_addr + 24).unwrap();
            let flags = get64(&macho.bytes, flags_offset);
            let length = get64(&macho.bytes, length_offset);
            let string_len = macho.bytes[string_offset..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| "unterminated CFString contents".to_string())?;
            let string = macho.bytes[string_offset..string_offset + string_len].to_vec();
            parsed.push((
                i as u32 * CFSTRING_ATOM_SIZE as u32,
                string,
                flags,
                length,
                string_addr,
            ));
        }

        let Some(ordinal) = isa_ordinal else {
            return Ok(()); // empty section
        };
        let isa_install_name = install_name_for_ordinal(macho, ordinal);
        match (&self.cf_strings.isa_install_name, &isa_install_name) {
            (None, Some(name)) => self.cf_strings.isa_install_name = Some(name.clone()),
            (Some(existing), Some(name)) if existing == name => (),
            // Different exporters across dylibs: don't merge this one.
            (Some(_), Some(_)) | (_, None) => return Ok(()),
        }

        for (section_offset, string, flags, length, string_addr) in parsed {
            let pool_offset =
                self.cf_strings
                    .intern(&string, flags, length, (dylib_index, string_addr));
            coalescer.cf_strings.insert(section_offset, pool_offset);
        }
        Ok(())
    }
}

impl Default for CacheCoalescedText {
    fn default() -> CacheCoalescedText {
        CacheCoalescedText::new()
    }
}

fn find_cfstring_section(macho: &MachO) -> Option<&Section> {
    for segment in ["__DATA", "__DATA_CONST", "__DATA_DIRTY", "__AUTH_CONST"] {
        if let Some(section) = macho.section(segment, "__cfstring") {
            return Some(section);
        }
    }
    None
}

fn install_name_for_ordinal(macho: &MachO, ordinal: i64) -> Option<String> {
    if ordinal < 1 {
        return None;
    }
    macho
        .dependencies
        .get(ordinal as usize - 1)
        .map(|d| d.path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_sections_dedupe() {
        let mut section = StringSection::default();
        let a = section.intern("alloc");
        let b = section.intern("dealloc");
        let c = section.intern("alloc");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(section.buffer_size, 6 + 8);
        assert_eq!(section.saved_space, 6);

        let mut buffer = vec![0xAAu8; section.buffer_size as usize];
        section.emit(&mut buffer);
        assert_eq!(&buffer[a as usize..a as usize + 6], b"alloc\0");
        assert_eq!(&buffer[b as usize..b as usize + 8], b"dealloc\0");
    }

    #[test]
    fn offset_translation_hits_atom_interiors() {
        let mut map = SectionOffsetMap::new();
        map.insert(0, 0x100);
        map.insert(32, 0x40);
        assert_eq!(DylibTextCoalescer::translate_offset(&map, 0), Some(0x100));
        assert_eq!(DylibTextCoalescer::translate_offset(&map, 8), Some(0x108));
        assert_eq!(DylibTextCoalescer::translate_offset(&map, 32), Some(0x40));
        assert_eq!(DylibTextCoalescer::translate_offset(&map, 40), Some(0x48));
    }

    #[test]
    fn cf_atoms_dedupe_on_content() {
        let mut section = CfSection::default();
        let a = section.intern(b"hello", 0x7C8, 5, (0, 0x1000));
        let b = section.intern(b"hello", 0x7C8, 5, (1, 0x2000));
        let c = section.intern(b"hello", 0x7D0, 5, (0, 0x1000)); // different flags
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(section.buffer_size, 64);
        assert_eq!(section.atoms.len(), 2);
        // The winning atom keeps the first source it was seen in.
        assert_eq!(section.atoms[0].string_source, (0, 0x1000));
    }
}
