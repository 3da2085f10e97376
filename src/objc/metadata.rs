/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Reading Objective-C metadata out of an input binary.
//!
//! Walks `__objc_classlist` / `__objc_catlist` into plain structs the
//! IMP-cache solver can consume. Only 64-bit layouts are understood (IMP
//! caches are an arm64-era optimization). Pointers inside the metadata are
//! resolved through the binary's fixups: a rebase yields an address inside
//! the image, a bind yields the imported symbol name.

use crate::endian::{get32, get64};
use crate::mach_o::fixups::FixupIndex;
use crate::mach_o::MachO;
use std::collections::HashMap;

/// 64-bit `class_t` field offsets.
const CLASS_ISA: u64 = 0;
const CLASS_SUPERCLASS: u64 = 8;
const CLASS_DATA: u64 = 32;
/// Low bits of the data pointer are runtime flags.
const FAST_DATA_MASK: u64 = 0x7;

/// 64-bit `class_ro_t` field offsets.
const RO_FLAGS: u64 = 0;
const RO_NAME: u64 = 24;
const RO_BASE_METHODS: u64 = 32;
const RO_META: u32 = 1 << 0;

/// `method_list_t` flags.
const METHOD_LIST_RELATIVE: u32 = 0x8000_0000;
const METHOD_LIST_ENTSIZE_MASK: u32 = 0x0000_FFFC;

/// 64-bit `category_t` field offsets.
const CATEGORY_NAME: u64 = 0;
const CATEGORY_CLS: u64 = 8;
const CATEGORY_INSTANCE_METHODS: u64 = 16;
const CATEGORY_CLASS_METHODS: u64 = 24;

#[derive(Debug, Clone)]
pub struct ParsedMethod {
    pub name: String,
    /// Implementation address in the image's original address space.
    pub imp: u64,
}

/// A pointer in the metadata, after fixup resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassRef {
    /// Rebase to an address inside this image.
    InImage(u64),
    /// Bind to another image's export (e.g. `_OBJC_CLASS_$_NSObject`).
    External(String),
}

#[derive(Debug, Clone)]
pub struct ParsedClass {
    pub name: String,
    pub vmaddr: u64,
    pub segment_index: u32,
    pub segment_offset: u64,
    pub superclass: Option<ClassRef>,
    pub methods: Vec<ParsedMethod>,
    pub metaclass_methods: Vec<ParsedMethod>,
}

#[derive(Debug, Clone)]
pub struct ParsedCategory {
    pub name: String,
    pub class: Option<ClassRef>,
    pub instance_methods: Vec<ParsedMethod>,
    pub class_methods: Vec<ParsedMethod>,
}

#[derive(Debug, Default)]
pub struct ObjCMetadata {
    pub classes: Vec<ParsedClass>,
    pub categories: Vec<ParsedCategory>,
    pub selref_count: u32,
    /// True if any method list uses pointer-based (not relative) entries.
    /// Such dylibs get patched method names at launch, so their data cannot
    /// be mapped read-only.
    pub has_pointer_based_method_lists: bool,
}

struct Reader<'a> {
    macho: &'a MachO,
    fixups: &'a FixupIndex,
    binds_by_addr: HashMap<u64, &'a str>,
}

impl<'a> Reader<'a> {
    fn new(macho: &'a MachO, fixups: &'a FixupIndex) -> Reader<'a> {
        let mut binds_by_addr = HashMap::new();
        for bind in &fixups.binds {
            let segment = &macho.segments[bind.seg_index];
            binds_by_addr.insert(segment.vmaddr + bind.seg_offset, bind.symbol.as_str());
        }
        Reader {
            macho,
            fixups,
            binds_by_addr,
        }
    }

    fn raw_u32(&self, addr: u64) -> Result<u32, String> {
        let offset = self
            .macho
            .file_offset_for_address(addr)
            .ok_or_else(|| format!("address {:#x} unmapped", addr))?;
        Ok(get32(&self.macho.bytes, offset))
    }

    fn raw_u64(&self, addr: u64) -> Result<u64, String> {
        let offset = self
            .macho
            .file_offset_for_address(addr)
            .ok_or_else(|| format!("address {:#x} unmapped", addr))?;
        Ok(get64(&self.macho.bytes, offset))
    }

    /// Resolve a pointer slot: bind, rebase, or null.
    fn pointer_at(&self, addr: u64) -> Result<Option<ClassRef>, String> {
        if let Some(&symbol) = self.binds_by_addr.get(&addr) {
            return Ok(Some(ClassRef::External(symbol.to_string())));
        }
        if self.raw_u64(addr)? == 0 {
            return Ok(None);
        }
        match self.fixups.rebase_target_at(self.macho, addr) {
            Some(target) => Ok(Some(ClassRef::InImage(target))),
            None => Ok(None),
        }
    }

    /// Resolve a pointer slot that must be an in-image rebase.
    fn rebase_at(&self, addr: u64) -> Result<u64, String> {
        match self.pointer_at(addr)? {
            Some(ClassRef::InImage(target)) => Ok(target),
            Some(ClassRef::External(symbol)) => {
                Err(format!("unexpected bind to {} at {:#x}", symbol, addr))
            }
            None => Err(format!("null pointer at {:#x}", addr)),
        }
    }

    fn cstr_at(&self, addr: u64) -> Result<String, String> {
        let offset = self
            .macho
            .file_offset_for_address(addr)
            .ok_or_else(|| format!("string address {:#x} unmapped", addr))?;
        crate::endian::cstr(&self.macho.bytes, offset).map(|s| s.to_string())
    }

    fn method_list(
        &self,
        list_addr: u64,
        saw_pointer_based: &mut bool,
    ) -> Result<Vec<ParsedMethod>, String> {
        if list_addr == 0 {
            return Ok(Vec::new());
        }
        let entsize_and_flags = self.raw_u32(list_addr)?;
        let count = self.raw_u32(list_addr + 4)?;
        let relative = entsize_and_flags & METHOD_LIST_RELATIVE != 0;
        let entsize = (entsize_and_flags & METHOD_LIST_ENTSIZE_MASK) as u64;
        if !relative {
            *saw_pointer_based = true;
        }
        let mut methods = Vec::with_capacity(count as usize);
        for i in 0..count as u64 {
            let entry = list_addr + 8 + i * entsize;
            if relative {
                // Offsets are relative to the field they're stored in. The
                // name offset leads to a selector-reference slot.
                let name_field = self.raw_u32(entry)? as i32 as i64;
                let selref = (entry as i64 + name_field) as u64;
                let name_addr = self.rebase_at(selref)?;
                let imp_field = self.raw_u32(entry + 8)? as i32 as i64;
                let imp = (entry as i64 + 8 + imp_field) as u64;
                methods.push(ParsedMethod {
                    name: self.cstr_at(name_addr)?,
                    imp,
                });
            } else {
                let name_addr = self.rebase_at(entry)?;
                let imp = self.rebase_at(entry + 16)?;
                methods.push(ParsedMethod {
                    name: self.cstr_at(name_addr)?,
                    imp,
                });
            }
        }
        Ok(methods)
    }

    /// The methods of the `class_ro_t` hanging off a `class_t`.
    fn class_ro_methods(
        &self,
        class_addr: u64,
        saw_pointer_based: &mut bool,
    ) -> Result<(u64, Vec<ParsedMethod>), String> {
        let data = self.rebase_at(class_addr + CLASS_DATA)? & !FAST_DATA_MASK;
        let methods = match self.pointer_at(data + RO_BASE_METHODS)? {
            Some(ClassRef::InImage(list)) => self.method_list(list, saw_pointer_based)?,
            _ => Vec::new(),
        };
        Ok((data, methods))
    }
}

/// Section lookup across the data segment family.
fn data_section<'a>(macho: &'a MachO, name: &str) -> Option<&'a crate::mach_o::Section> {
    for segment in ["__DATA", "__DATA_CONST", "__DATA_DIRTY", "__AUTH", "__AUTH_CONST"] {
        if let Some(section) = macho.section(segment, name) {
            return Some(section);
        }
    }
    None
}

/// Parse the image's Objective-C metadata. Returns an empty table for images
/// with no ObjC.
pub fn parse(macho: &MachO, fixups: &FixupIndex) -> Result<ObjCMetadata, String> {
    let mut metadata = ObjCMetadata::default();
    if !macho.is64 {
        return Ok(metadata);
    }
    let reader = Reader::new(macho, fixups);

    if let Some(selrefs) = data_section(macho, "__objc_selrefs") {
        metadata.selref_count = (selrefs.size / 8) as u32;
    }

    if let Some(classlist) = data_section(macho, "__objc_classlist") {
        let count = classlist.size / 8;
        for i in 0..count {
            let slot = classlist.addr + i * 8;
            let class_addr = reader.rebase_at(slot)?;
            let mut saw_pointer_based = false;
            let (ro, methods) =
                reader.class_ro_methods(class_addr, &mut saw_pointer_based)?;
            let flags = reader.raw_u32(ro + RO_FLAGS)?;
            if flags & RO_META != 0 {
                return Err(format!(
                    "class list entry {:#x} points at a metaclass",
                    class_addr
                ));
            }
            let name_addr = reader.rebase_at(ro + RO_NAME)?;
            let name = reader.cstr_at(name_addr)?;

            let metaclass_methods = match reader.pointer_at(class_addr + CLASS_ISA)? {
                Some(ClassRef::InImage(metaclass_addr)) => {
                    let (_, methods) =
                        reader.class_ro_methods(metaclass_addr, &mut saw_pointer_based)?;
                    methods
                }
                _ => Vec::new(),
            };

            let superclass = reader.pointer_at(class_addr + CLASS_SUPERCLASS)?;
            let segment = macho
                .segments
                .iter()
                .find(|s| class_addr >= s.vmaddr && class_addr < s.vmaddr + s.vmsize)
                .ok_or_else(|| format!("class {:#x} outside all segments", class_addr))?;

            metadata.has_pointer_based_method_lists |= saw_pointer_based;
            metadata.classes.push(ParsedClass {
                name,
                vmaddr: class_addr,
                segment_index: segment.index as u32,
                segment_offset: class_addr - segment.vmaddr,
                superclass,
                methods,
                metaclass_methods,
            });
        }
    }

    if let Some(catlist) = data_section(macho, "__objc_catlist") {
        let count = catlist.size / 8;
        for i in 0..count {
            let slot = catlist.addr + i * 8;
            let category_addr = reader.rebase_at(slot)?;
            let name_addr = reader.rebase_at(category_addr + CATEGORY_NAME)?;
            let name = reader.cstr_at(name_addr)?;
            let class = reader.pointer_at(category_addr + CATEGORY_CLS)?;
            let mut saw_pointer_based = false;
            let instance_methods = match reader.pointer_at(category_addr + CATEGORY_INSTANCE_METHODS)?
            {
                Some(ClassRef::InImage(list)) => {
                    reader.method_list(list, &mut saw_pointer_based)?
                }
                _ => Vec::new(),
            };
            let class_methods = match reader.pointer_at(category_addr + CATEGORY_CLASS_METHODS)? {
                Some(ClassRef::InImage(list)) => {
                    reader.method_list(list, &mut saw_pointer_based)?
                }
                _ => Vec::new(),
            };
            metadata.has_pointer_based_method_lists |= saw_pointer_based;
            metadata.categories.push(ParsedCategory {
                name,
                class,
                instance_methods,
                class_methods,
            });
        }
    }

    Ok(metadata)
}

/// `_OBJC_CLASS_$_` / `_OBJC_METACLASS_$_` prefixes used to resolve
/// cross-image class references.
pub const OBJC_CLASS_PREFIX: &str = "_OBJC_CLASS_$_";
pub const OBJC_METACLASS_PREFIX: &str = "_OBJC_METACLASS_$_";

/// Strip the class-symbol prefix, if this is a class symbol.
pub fn class_name_from_symbol(symbol: &str) -> Option<(&str, bool)> {
    if let Some(name) = symbol.strip_prefix(OBJC_CLASS_PREFIX) {
        Some((name, false))
    } else {
        symbol
            .strip_prefix(OBJC_METACLASS_PREFIX)
            .map(|name| (name, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_symbol_names() {
        assert_eq!(
            class_name_from_symbol("_OBJC_CLASS_$_NSString"),
            Some(("NSString", false))
        );
        assert_eq!(
            class_name_from_symbol("_OBJC_METACLASS_$_NSString"),
            Some(("NSString", true))
        );
        assert_eq!(class_name_from_symbol("_printf"), None);
    }
}
