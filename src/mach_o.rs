/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Reading of Mach-O files, the executable and library format on Apple
//! platforms.
//!
//! Implemented using the mach_object crate. All usage of that crate should be
//! confined to this module. The goal is to read each input binary exactly
//! once, storing any information the pipeline needs later. Load commands that
//! postdate the crate (chained fixups, the standalone export trie) are read
//! with a raw little-endian scan over the command list.
//!
//! Useful resources:
//! - Apple's old "OS X ABI Mach-O File Format Reference", mirrored in
//!   [various](https://github.com/aidansteele/osx-abi-macho-file-format-reference)
//!   places online.
//! - `/usr/include/mach-o/loader.h` and `/usr/include/mach-o/fixup-chains.h`
//!   in the macOS SDK for load command and chained-fixup layouts.

pub mod fixups;

use crate::endian::{cstr, get32, get64, read_uleb128, set64};
use mach_object::{LoadCommand, MachCommand, OFile};
use std::io::Cursor;
use std::rc::Rc;

pub const VM_PROT_READ: u32 = 1;
pub const VM_PROT_WRITE: u32 = 2;
pub const VM_PROT_EXECUTE: u32 = 4;

// Filetypes and load commands the mach_object crate doesn't expose (or that
// we read via the raw scan).
const MH_EXECUTE: u32 = 0x2;
const MH_DYLIB: u32 = 0x6;
const MH_BUNDLE: u32 = 0x8;
pub const MH_MAGIC_64: u32 = 0xFEED_FACF;
pub const MH_MAGIC: u32 = 0xFEED_FACE;

const LC_REQ_DYLD: u32 = 0x8000_0000;
pub const LC_ID_DYLIB: u32 = 0xD;
pub const LC_LOAD_DYLIB: u32 = 0xC;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_UUID: u32 = 0x1B;
pub const LC_RPATH: u32 = 0x1C | LC_REQ_DYLD;
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xB;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1E;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_CODE_SIGNATURE: u32 = 0x1D;
pub const LC_DYLIB_CODE_SIGN_DRS: u32 = 0x2B;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;
pub const LC_ROUTINES_64: u32 = 0x1A;

const CPU_TYPE_ARM64_32: i32 = 0x0200_000C;
const CPU_SUBTYPE_ARM64E: i32 = 2;

/// First byte of a split-seg blob in the v2 format.
pub const DYLD_CACHE_ADJ_V2_FORMAT: u8 = 0x7F;

// Export symbol flags (subset used here).
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileKind {
    Dylib,
    Bundle,
    Executable,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub segment_name: String,
    pub name: String,
    pub addr: u64,
    pub size: u64,
    pub file_offset: u32,
    pub p2align: u8,
    pub sect_type: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub max_prot: u32,
    pub init_prot: u32,
    pub index: usize,
    pub sections: Vec<Section>,
}

impl Segment {
    /// Highest section alignment, used when placing the segment.
    pub fn p2align(&self) -> u8 {
        self.sections.iter().map(|s| s.p2align).max().unwrap_or(12)
    }

    /// Size from the segment base to the end of the last section. Trailing
    /// zero-fill beyond the last section is not copied into the cache.
    pub fn size_of_sections(&self) -> u64 {
        self.sections
            .iter()
            .map(|s| s.addr + s.size - self.vmaddr)
            .max()
            .unwrap_or(self.vmsize)
    }
}

#[derive(Debug, Clone)]
pub struct Dependency {
    pub path: String,
    pub weak: bool,
    pub upward: bool,
    pub reexport: bool,
}

/// `(offset, size)` of a blob inside the file (usually `__LINKEDIT`).
#[derive(Debug, Copy, Clone, Default)]
pub struct LinkeditBlob {
    pub offset: u32,
    pub size: u32,
}

impl LinkeditBlob {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn slice<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        &bytes[self.offset as usize..(self.offset + self.size) as usize]
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct SymtabInfo {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct DysymtabInfo {
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct DyldInfoOffsets {
    pub rebase: LinkeditBlob,
    pub bind: LinkeditBlob,
    pub weak_bind: LinkeditBlob,
    pub lazy_bind: LinkeditBlob,
    pub export: LinkeditBlob,
}

/// One entry parsed out of an export trie.
#[derive(Debug, Clone)]
pub struct ExportedSymbol {
    pub name: String,
    pub flags: u64,
    /// Offset from the mach_header (or absolute address for
    /// `EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE`; the dependency ordinal for
    /// re-exports).
    pub address: u64,
    /// Resolver stub offset for `STUB_AND_RESOLVER` exports.
    pub other: u64,
    /// Name in the providing dylib, for re-exports (empty = same name).
    pub import_name: Option<String>,
}

/// A parsed input binary. Owns a copy of the (thin) file bytes: segments are
/// copied out of here into the cache buffer, and the link-edit blobs are read
/// from here until the merged link-edit replaces them.
pub struct MachO {
    pub path: String,
    pub install_name: String,
    pub kind: FileKind,
    pub uuid: [u8; 16],
    pub is64: bool,
    pub header_flags: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub segments: Vec<Segment>,
    pub dependencies: Vec<Dependency>,
    pub symtab: SymtabInfo,
    pub dysymtab: DysymtabInfo,
    pub dyld_info: DyldInfoOffsets,
    pub exports_trie_cmd: Option<LinkeditBlob>,
    pub chained_fixups_cmd: Option<LinkeditBlob>,
    pub split_seg_info: Option<LinkeditBlob>,
    pub function_starts: LinkeditBlob,
    pub data_in_code: LinkeditBlob,
    pub mtime: u64,
    pub inode: u64,
    pub bytes: Vec<u8>,
}

impl MachO {
    /// Parse the slice of `bytes` matching `arch_name` (selecting from a fat
    /// file if necessary) and capture everything the builder needs.
    pub fn parse(
        path: &str,
        bytes: &[u8],
        arch_name: &str,
        mtime: u64,
        inode: u64,
    ) -> Result<MachO, String> {
        log_dbg!("Reading {:?}", path);

        let mut cursor = Cursor::new(bytes);
        let file =
            OFile::parse(&mut cursor).map_err(|e| format!("Could not parse Mach-O file: {}", e))?;

        let (want_cputype, want_subtype) = cputype_for_arch(arch_name)
            .ok_or_else(|| format!("Unknown architecture {:?}", arch_name))?;

        let (header, commands, slice) = match file {
            OFile::MachFile { header, commands } => (header, commands, bytes),
            OFile::FatFile { files, .. } => {
                let mut found = None;
                for (arch, _) in &files {
                    if arch.cputype != want_cputype {
                        continue;
                    }
                    if let Some(subtype) = want_subtype {
                        if (arch.cpusubtype & 0x00FF_FFFF) != subtype {
                            continue;
                        }
                    }
                    found = Some(
                        &bytes[arch.offset as usize..arch.offset as usize + arch.size as usize],
                    );
                }
                let Some(subslice) = found else {
                    return Err(format!("No {} slice in fat binary", arch_name));
                };
                return MachO::parse(path, subslice, arch_name, mtime, inode);
            }
            OFile::ArFile { .. } | OFile::SymDef { .. } => {
                return Err("Unexpected Mach-O file kind: static archive".to_string());
            }
        };

        if header.is_bigend() {
            return Err("Binary is not little-endian".to_string());
        }
        if header.cputype != want_cputype {
            return Err(format!("Binary is not for {}", arch_name));
        }
        if let Some(subtype) = want_subtype {
            if (header.cpusubtype & 0x00FF_FFFF) != subtype {
                return Err(format!("Wrong cpu subtype for {}", arch_name));
            }
        }
        let is64 = header.is_64bit();

        let kind = match header.filetype {
            MH_DYLIB => FileKind::Dylib,
            MH_BUNDLE => FileKind::Bundle,
            MH_EXECUTE => FileKind::Executable,
            other => return Err(format!("Unsupported Mach-O filetype {:#x}", other)),
        };

        let mut macho = MachO {
            path: path.to_string(),
            install_name: String::new(),
            kind,
            uuid: [0; 16],
            is64,
            header_flags: header.flags,
            ncmds: header.ncmds as u32,
            sizeofcmds: header.sizeofcmds as u32,
            segments: Vec::new(),
            dependencies: Vec::new(),
            symtab: SymtabInfo::default(),
            dysymtab: DysymtabInfo::default(),
            dyld_info: DyldInfoOffsets::default(),
            exports_trie_cmd: None,
            chained_fixups_cmd: None,
            split_seg_info: None,
            function_starts: LinkeditBlob::default(),
            data_in_code: LinkeditBlob::default(),
            mtime,
            inode,
            bytes: slice.to_vec(),
        };

        for MachCommand(command, _size) in commands {
            match command {
                LoadCommand::Segment {
                    segname,
                    vmaddr,
                    vmsize,
                    fileoff,
                    filesize,
                    maxprot,
                    initprot,
                    sections,
                    ..
                }
                | LoadCommand::Segment64 {
                    segname,
                    vmaddr,
                    vmsize,
                    fileoff,
                    filesize,
                    maxprot,
                    initprot,
                    sections,
                    ..
                } => {
                    let index = macho.segments.len();
                    macho.segments.push(Segment {
                        name: segname,
                        vmaddr: vmaddr as u64,
                        vmsize: vmsize as u64,
                        file_offset: fileoff as u64,
                        file_size: filesize as u64,
                        max_prot: maxprot as u32,
                        init_prot: initprot as u32,
                        index,
                        sections: sections.iter().map(|s| convert_section(s)).collect(),
                    });
                }
                LoadCommand::SymTab {
                    symoff,
                    nsyms,
                    stroff,
                    strsize,
                    ..
                } => {
                    macho.symtab = SymtabInfo {
                        symoff,
                        nsyms,
                        stroff,
                        strsize,
                    };
                }
                LoadCommand::DySymTab {
                    ilocalsym,
                    nlocalsym,
                    iextdefsym,
                    nextdefsym,
                    iundefsym,
                    nundefsym,
                    indirectsymoff,
                    nindirectsyms,
                    extreloff,
                    nextrel,
                    locreloff,
                    nlocrel,
                    ..
                } => {
                    macho.dysymtab = DysymtabInfo {
                        ilocalsym,
                        nlocalsym,
                        iextdefsym,
                        nextdefsym,
                        iundefsym,
                        nundefsym,
                        indirectsymoff,
                        nindirectsyms,
                        extreloff,
                        nextrel,
                        locreloff,
                        nlocrel,
                    };
                }
                LoadCommand::DyldInfo {
                    rebase_off,
                    rebase_size,
                    bind_off,
                    bind_size,
                    weak_bind_off,
                    weak_bind_size,
                    lazy_bind_off,
                    lazy_bind_size,
                    export_off,
                    export_size,
                    ..
                } => {
                    macho.dyld_info = DyldInfoOffsets {
                        rebase: LinkeditBlob {
                            offset: rebase_off,
                            size: rebase_size,
                        },
                        bind: LinkeditBlob {
                            offset: bind_off,
                            size: bind_size,
                        },
                        weak_bind: LinkeditBlob {
                            offset: weak_bind_off,
                            size: weak_bind_size,
                        },
                        lazy_bind: LinkeditBlob {
                            offset: lazy_bind_off,
                            size: lazy_bind_size,
                        },
                        export: LinkeditBlob {
                            offset: export_off,
                            size: export_size,
                        },
                    };
                }
                _ => (),
            }
        }

        macho.scan_raw_commands()?;

        if macho.kind == FileKind::Dylib && macho.install_name.is_empty() {
            return Err("Dylib has no LC_ID_DYLIB".to_string());
        }
        if macho.install_name.is_empty() {
            macho.install_name = path.to_string();
        }
        Ok(macho)
    }

    /// Pick up the commands the typed parse above can't see: the install
    /// name and dependency list (so weak/upward/reexport flags survive), the
    /// UUID, and the link-edit-data commands.
    fn scan_raw_commands(&mut self) -> Result<(), String> {
        let header_size = if self.is64 { 32 } else { 28 };
        let bytes = &self.bytes;
        if bytes.len() < header_size {
            return Err("Truncated Mach-O header".to_string());
        }
        let ncmds = get32(bytes, 16) as usize;
        let mut offset = header_size;
        for _ in 0..ncmds {
            if offset + 8 > bytes.len() {
                return Err("Truncated load commands".to_string());
            }
            let cmd = get32(bytes, offset);
            let cmdsize = get32(bytes, offset + 4) as usize;
            if cmdsize < 8 || offset + cmdsize > bytes.len() {
                return Err("Malformed load command size".to_string());
            }
            match cmd {
                LC_ID_DYLIB => {
                    let name_offset = get32(bytes, offset + 8) as usize;
                    self.install_name = cstr(bytes, offset + name_offset)?.to_string();
                }
                LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_UPWARD_DYLIB => {
                    let name_offset = get32(bytes, offset + 8) as usize;
                    let path = cstr(bytes, offset + name_offset)?.to_string();
                    self.dependencies.push(Dependency {
                        path,
                        weak: cmd == LC_LOAD_WEAK_DYLIB,
                        upward: cmd == LC_LOAD_UPWARD_DYLIB,
                        reexport: cmd == LC_REEXPORT_DYLIB,
                    });
                }
                LC_UUID => {
                    self.uuid
                        .copy_from_slice(&bytes[offset + 8..offset + 24]);
                }
                LC_SEGMENT_SPLIT_INFO => {
                    self.split_seg_info = Some(read_linkedit_data(bytes, offset));
                }
                LC_FUNCTION_STARTS => {
                    self.function_starts = read_linkedit_data(bytes, offset);
                }
                LC_DATA_IN_CODE => {
                    self.data_in_code = read_linkedit_data(bytes, offset);
                }
                LC_DYLD_EXPORTS_TRIE => {
                    self.exports_trie_cmd = Some(read_linkedit_data(bytes, offset));
                }
                LC_DYLD_CHAINED_FIXUPS => {
                    self.chained_fixups_cmd = Some(read_linkedit_data(bytes, offset));
                }
                _ => (),
            }
            offset += cmdsize;
        }
        Ok(())
    }

    pub fn pointer_size(&self) -> u64 {
        if self.is64 {
            8
        } else {
            4
        }
    }

    /// The address the binary was linked at: the vmaddr of `__TEXT`.
    pub fn preferred_load_address(&self) -> u64 {
        self.segments
            .iter()
            .find(|s| s.name == "__TEXT")
            .map(|s| s.vmaddr)
            .unwrap_or(0)
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn section(&self, segment: &str, section: &str) -> Option<&Section> {
        self.segments
            .iter()
            .filter(|s| s.name == segment)
            .flat_map(|s| s.sections.iter())
            .find(|s| s.name == section)
    }

    /// Map a vmaddr to an offset in `self.bytes`.
    pub fn file_offset_for_address(&self, addr: u64) -> Option<usize> {
        for segment in &self.segments {
            if addr >= segment.vmaddr && addr < segment.vmaddr + segment.vmsize {
                let offset = addr - segment.vmaddr;
                if offset < segment.file_size {
                    return Some((segment.file_offset + offset) as usize);
                }
                return None; // zero-fill
            }
        }
        None
    }

    /// True if the binary records split-seg info in the v2 (edge list)
    /// format.
    pub fn has_split_seg_v2(&self) -> bool {
        match self.split_seg_info {
            Some(blob) if !blob.is_empty() => {
                self.bytes[blob.offset as usize] == DYLD_CACHE_ADJ_V2_FORMAT
            }
            _ => false,
        }
    }

    pub fn has_chained_fixups(&self) -> bool {
        self.chained_fixups_cmd.is_some()
    }

    /// The export trie blob: the standalone command if present, else the
    /// dyld-info export range.
    pub fn export_trie_blob(&self) -> LinkeditBlob {
        self.exports_trie_cmd.unwrap_or(self.dyld_info.export)
    }

    /// Walk the export trie into a flat list of symbols.
    pub fn exported_symbols(&self) -> Result<Vec<ExportedSymbol>, String> {
        let blob = self.export_trie_blob();
        if blob.is_empty() {
            return Ok(Vec::new());
        }
        let trie = blob.slice(&self.bytes);
        let mut result = Vec::new();
        let mut name = Vec::new();
        walk_export_trie(trie, 0, &mut name, &mut result)?;
        Ok(result)
    }

    /// Read one nlist entry. Entries are 16 bytes on 64-bit, 12 on 32-bit.
    pub fn nlist(&self, index: u32) -> Nlist {
        Nlist::read(&self.bytes, self.symtab, self.is64, index)
    }

    /// The symbol name for an nlist entry.
    pub fn symbol_name(&self, nlist: &Nlist) -> Result<&str, String> {
        cstr(
            &self.bytes,
            self.symtab.stroff as usize + nlist.n_strx as usize,
        )
    }

    /// Overwrite a pointer-sized value at a vmaddr (used by tests and the
    /// ObjC metadata reader's scratch copies).
    pub fn write_pointer_at_address(&mut self, addr: u64, value: u64) -> Result<(), String> {
        let offset = self
            .file_offset_for_address(addr)
            .ok_or_else(|| format!("address {:#x} not in any mapped segment", addr))?;
        set64(&mut self.bytes, offset, value);
        Ok(())
    }
}

/// One symbol-table entry, fixed-width view.
#[derive(Debug, Copy, Clone)]
pub struct Nlist {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

pub const N_TYPE: u8 = 0x0E;
pub const N_SECT: u8 = 0x0E;
pub const N_EXT: u8 = 0x01;
pub const N_STAB: u8 = 0xE0;

impl Nlist {
    pub fn size(is64: bool) -> usize {
        if is64 {
            16
        } else {
            12
        }
    }

    pub fn read(bytes: &[u8], symtab: SymtabInfo, is64: bool, index: u32) -> Nlist {
        let offset = symtab.symoff as usize + index as usize * Self::size(is64);
        Nlist {
            n_strx: get32(bytes, offset),
            n_type: bytes[offset + 4],
            n_sect: bytes[offset + 5],
            n_desc: crate::endian::get16(bytes, offset + 6),
            n_value: if is64 {
                get64(bytes, offset + 8)
            } else {
                get32(bytes, offset + 8) as u64
            },
        }
    }

    pub fn write(&self, bytes: &mut [u8], offset: usize, is64: bool) {
        crate::endian::set32(bytes, offset, self.n_strx);
        bytes[offset + 4] = self.n_type;
        bytes[offset + 5] = self.n_sect;
        crate::endian::set16(bytes, offset + 6, self.n_desc);
        if is64 {
            set64(bytes, offset + 8, self.n_value);
        } else {
            crate::endian::set32(bytes, offset + 8, self.n_value as u32);
        }
    }

    pub fn is_stab(&self) -> bool {
        self.n_type & N_STAB != 0
    }

    pub fn is_defined_in_section(&self) -> bool {
        !self.is_stab() && (self.n_type & N_TYPE) == N_SECT
    }
}

fn convert_section(section: &Rc<mach_object::Section>) -> Section {
    Section {
        segment_name: section.segname.clone(),
        name: section.sectname.clone(),
        addr: section.addr as u64,
        size: section.size as u64,
        file_offset: section.offset,
        p2align: section.align as u8,
        sect_type: section.flags.sect_type(),
        reserved1: section.reserved1,
        reserved2: section.reserved2,
    }
}

fn read_linkedit_data(bytes: &[u8], cmd_offset: usize) -> LinkeditBlob {
    LinkeditBlob {
        offset: get32(bytes, cmd_offset + 8),
        size: get32(bytes, cmd_offset + 12),
    }
}

fn cputype_for_arch(name: &str) -> Option<(i32, Option<i32>)> {
    match name {
        "x86_64" => Some((mach_object::CPU_TYPE_X86_64, None)),
        "x86_64h" => Some((mach_object::CPU_TYPE_X86_64, Some(8))),
        "arm64" => Some((mach_object::CPU_TYPE_ARM64, None)),
        "arm64e" => Some((mach_object::CPU_TYPE_ARM64, Some(CPU_SUBTYPE_ARM64E))),
        "arm64_32" => Some((CPU_TYPE_ARM64_32, None)),
        "armv7s" => Some((mach_object::CPU_TYPE_ARM, Some(11))),
        "armv7k" => Some((mach_object::CPU_TYPE_ARM, Some(12))),
        _ => None,
    }
}

fn walk_export_trie(
    trie: &[u8],
    node_offset: usize,
    name: &mut Vec<u8>,
    result: &mut Vec<ExportedSymbol>,
) -> Result<(), String> {
    let mut offset = node_offset;
    let terminal_size = read_uleb128(trie, &mut offset)?;
    if terminal_size != 0 {
        let mut terminal = offset;
        let flags = read_uleb128(trie, &mut terminal)?;
        let (address, other, import_name) = if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            let ordinal = read_uleb128(trie, &mut terminal)?;
            let import_name = cstr(trie, terminal)?.to_string();
            (ordinal, 0, Some(import_name))
        } else if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
            let stub = read_uleb128(trie, &mut terminal)?;
            let resolver = read_uleb128(trie, &mut terminal)?;
            (stub, resolver, None)
        } else {
            (read_uleb128(trie, &mut terminal)?, 0, None)
        };
        result.push(ExportedSymbol {
            name: String::from_utf8_lossy(name).into_owned(),
            flags,
            address,
            other,
            import_name,
        });
    }
    let children_offset = offset + terminal_size as usize;
    let mut cursor = children_offset;
    let child_count = *trie
        .get(cursor)
        .ok_or_else(|| "truncated export trie".to_string())?;
    cursor += 1;
    for _ in 0..child_count {
        let edge_start = name.len();
        loop {
            let byte = *trie
                .get(cursor)
                .ok_or_else(|| "truncated export trie edge".to_string())?;
            cursor += 1;
            if byte == 0 {
                break;
            }
            name.push(byte);
        }
        let child_offset = read_uleb128(trie, &mut cursor)?;
        walk_export_trie(trie, child_offset as usize, name, result)?;
        name.truncate(edge_start);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endian::append_uleb128;

    // Hand-built single-node trie exporting "_f" at 0x4000 and "_g" at
    // 0x5000.
    fn tiny_trie() -> Vec<u8> {
        let mut child_f = Vec::new();
        append_uleb128(&mut child_f, 0); // flags
        append_uleb128(&mut child_f, 0x4000);
        let mut child_g = Vec::new();
        append_uleb128(&mut child_g, 0);
        append_uleb128(&mut child_g, 0x5000);

        // root: no terminal, two children "_f" and "_g"
        let mut trie = vec![0u8, 2];
        trie.extend_from_slice(b"_f\0");
        let f_fixup = trie.len();
        trie.push(0); // child offset placeholder
        trie.extend_from_slice(b"_g\0");
        let g_fixup = trie.len();
        trie.push(0);
        let f_offset = trie.len();
        trie.push(child_f.len() as u8);
        trie.extend_from_slice(&child_f);
        let g_offset = trie.len();
        trie.push(child_g.len() as u8);
        trie.extend_from_slice(&child_g);
        trie[f_fixup] = f_offset as u8;
        trie[g_fixup] = g_offset as u8;
        trie
    }

    #[test]
    fn export_trie_walk() {
        let trie = tiny_trie();
        let mut result = Vec::new();
        let mut name = Vec::new();
        walk_export_trie(&trie, 0, &mut name, &mut result).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].name, "_f");
        assert_eq!(result[0].address, 0x4000);
        assert_eq!(result[1].name, "_g");
        assert_eq!(result[1].address, 0x5000);
    }

    #[test]
    fn nlist_roundtrip() {
        let mut buf = vec![0u8; 16];
        let entry = Nlist {
            n_strx: 42,
            n_type: N_SECT | N_EXT,
            n_sect: 1,
            n_desc: 0x10,
            n_value: 0x1_0000_4000,
        };
        entry.write(&mut buf, 0, true);
        let symtab = SymtabInfo {
            symoff: 0,
            nsyms: 1,
            stroff: 0,
            strsize: 0,
        };
        let read = Nlist::read(&buf, symtab, true, 0);
        assert_eq!(read.n_strx, 42);
        assert_eq!(read.n_value, 0x1_0000_4000);
        assert!(read.is_defined_in_section());
    }
}
