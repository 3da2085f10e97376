/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Fixup metadata of an input binary: the opcode-based rebase/bind streams
//! used by classic `LC_DYLD_INFO` binaries, and the chained-fixup tables of
//! newer ones.
//!
//! Reference: `/usr/include/mach-o/loader.h` (rebase/bind opcodes) and
//! `/usr/include/mach-o/fixup-chains.h` (chained fixups).

use super::MachO;
use crate::endian::{cstr, get16, get32, get64, read_sleb128, read_uleb128};

pub const REBASE_TYPE_POINTER: u8 = 1;
pub const REBASE_TYPE_TEXT_ABSOLUTE32: u8 = 2;
pub const REBASE_TYPE_TEXT_PCREL32: u8 = 3;

const REBASE_OPCODE_MASK: u8 = 0xF0;
const REBASE_IMMEDIATE_MASK: u8 = 0x0F;
const REBASE_OPCODE_DONE: u8 = 0x00;
const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

const BIND_OPCODE_MASK: u8 = 0xF0;
const BIND_IMMEDIATE_MASK: u8 = 0x0F;
const BIND_OPCODE_DONE: u8 = 0x00;
const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
const BIND_OPCODE_DO_BIND: u8 = 0x90;
const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
const BIND_OPCODE_THREADED: u8 = 0xD0;

const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;

// Chained pointer formats.
pub const DYLD_CHAINED_PTR_ARM64E: u16 = 1;
pub const DYLD_CHAINED_PTR_64: u16 = 2;
pub const DYLD_CHAINED_PTR_32: u16 = 3;
pub const DYLD_CHAINED_PTR_64_OFFSET: u16 = 6;
pub const DYLD_CHAINED_PTR_ARM64E_KERNEL: u16 = 7;
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND: u16 = 9;
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND24: u16 = 12;

pub const DYLD_CHAINED_PTR_START_NONE: u16 = 0xFFFF;
pub const DYLD_CHAINED_PTR_START_MULTI: u16 = 0x8000;

const DYLD_CHAINED_IMPORT: u32 = 1;
const DYLD_CHAINED_IMPORT_ADDEND: u32 = 2;
const DYLD_CHAINED_IMPORT_ADDEND64: u32 = 3;

/// One rebase location from an opcode stream.
#[derive(Debug, Copy, Clone)]
pub struct RebaseLocation {
    pub rtype: u8,
    pub seg_index: usize,
    pub seg_offset: u64,
}

/// One bind location from an opcode stream or a chained import.
#[derive(Debug, Clone)]
pub struct BindLocation {
    pub btype: u8,
    pub seg_index: usize,
    pub seg_offset: u64,
    pub lib_ordinal: i64,
    pub symbol: String,
    pub addend: i64,
    pub weak_import: bool,
    /// `(diversity, addr_div, key)` for authenticated chained binds.
    pub auth: Option<(u16, bool, u8)>,
}

/// Walk a rebase opcode stream into a flat location list.
pub fn parse_rebase_opcodes(
    opcodes: &[u8],
    pointer_size: u64,
) -> Result<Vec<RebaseLocation>, String> {
    let mut result = Vec::new();
    let mut offset = 0usize;
    let mut rtype: u8 = 0;
    let mut seg_index = 0usize;
    let mut seg_offset: u64 = 0;
    while offset < opcodes.len() {
        let byte = opcodes[offset];
        offset += 1;
        let opcode = byte & REBASE_OPCODE_MASK;
        let immediate = byte & REBASE_IMMEDIATE_MASK;
        match opcode {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => rtype = immediate,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                seg_index = immediate as usize;
                seg_offset = read_uleb128(opcodes, &mut offset)?;
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => {
                seg_offset = seg_offset.wrapping_add(read_uleb128(opcodes, &mut offset)?);
            }
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                seg_offset += immediate as u64 * pointer_size;
            }
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                for _ in 0..immediate {
                    result.push(RebaseLocation {
                        rtype,
                        seg_index,
                        seg_offset,
                    });
                    seg_offset += pointer_size;
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let count = read_uleb128(opcodes, &mut offset)?;
                for _ in 0..count {
                    result.push(RebaseLocation {
                        rtype,
                        seg_index,
                        seg_offset,
                    });
                    seg_offset += pointer_size;
                }
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                result.push(RebaseLocation {
                    rtype,
                    seg_index,
                    seg_offset,
                });
                seg_offset = seg_offset
                    .wrapping_add(read_uleb128(opcodes, &mut offset)?)
                    .wrapping_add(pointer_size);
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb128(opcodes, &mut offset)?;
                let skip = read_uleb128(opcodes, &mut offset)?;
                for _ in 0..count {
                    result.push(RebaseLocation {
                        rtype,
                        seg_index,
                        seg_offset,
                    });
                    seg_offset = seg_offset.wrapping_add(skip + pointer_size);
                }
            }
            _ => return Err(format!("unknown rebase opcode {:#04x}", byte)),
        }
    }
    Ok(result)
}

/// Walk a bind opcode stream. Lazy-bind streams use the same opcodes but
/// terminate each entry with `DONE`, so `DONE` only ends the walk at the end
/// of the buffer.
pub fn parse_bind_opcodes(
    opcodes: &[u8],
    pointer_size: u64,
    lazy: bool,
) -> Result<Vec<BindLocation>, String> {
    let mut result = Vec::new();
    let mut offset = 0usize;
    let mut btype: u8 = 0;
    let mut seg_index = 0usize;
    let mut seg_offset: u64 = 0;
    let mut lib_ordinal: i64 = 0;
    let mut symbol = String::new();
    let mut addend: i64 = 0;
    let mut weak_import = false;
    while offset < opcodes.len() {
        let byte = opcodes[offset];
        offset += 1;
        let opcode = byte & BIND_OPCODE_MASK;
        let immediate = byte & BIND_IMMEDIATE_MASK;
        match opcode {
            BIND_OPCODE_DONE => {
                if !lazy {
                    break;
                }
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => lib_ordinal = immediate as i64,
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                lib_ordinal = read_uleb128(opcodes, &mut offset)? as i64;
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                // sign-extend the 4-bit immediate (self = 0, main = -1,
                // flat = -2, weak lookup = -3)
                lib_ordinal = if immediate == 0 {
                    0
                } else {
                    (immediate as i64) | !0xF
                };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                weak_import = immediate & BIND_SYMBOL_FLAGS_WEAK_IMPORT != 0;
                symbol = cstr(opcodes, offset)?.to_string();
                offset += symbol.len() + 1;
            }
            BIND_OPCODE_SET_TYPE_IMM => btype = immediate,
            BIND_OPCODE_SET_ADDEND_SLEB => addend = read_sleb128(opcodes, &mut offset)?,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                seg_index = immediate as usize;
                seg_offset = read_uleb128(opcodes, &mut offset)?;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                seg_offset = seg_offset.wrapping_add(read_uleb128(opcodes, &mut offset)?);
            }
            BIND_OPCODE_DO_BIND => {
                result.push(BindLocation {
                    btype,
                    seg_index,
                    seg_offset,
                    lib_ordinal,
                    symbol: symbol.clone(),
                    addend,
                    weak_import,
                    auth: None,
                });
                seg_offset += pointer_size;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                result.push(BindLocation {
                    btype,
                    seg_index,
                    seg_offset,
                    lib_ordinal,
                    symbol: symbol.clone(),
                    addend,
                    weak_import,
                    auth: None,
                });
                seg_offset = seg_offset
                    .wrapping_add(read_uleb128(opcodes, &mut offset)?)
                    .wrapping_add(pointer_size);
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                result.push(BindLocation {
                    btype,
                    seg_index,
                    seg_offset,
                    lib_ordinal,
                    symbol: symbol.clone(),
                    addend,
                    weak_import,
                    auth: None,
                });
                seg_offset += (immediate as u64 + 1) * pointer_size;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb128(opcodes, &mut offset)?;
                let skip = read_uleb128(opcodes, &mut offset)?;
                for _ in 0..count {
                    result.push(BindLocation {
                        btype,
                        seg_index,
                        seg_offset,
                        lib_ordinal,
                        symbol: symbol.clone(),
                        addend,
                        weak_import,
                        auth: None,
                    });
                    seg_offset = seg_offset.wrapping_add(skip + pointer_size);
                }
            }
            BIND_OPCODE_THREADED => {
                return Err("threaded bind opcodes are not supported".to_string());
            }
            _ => return Err(format!("unknown bind opcode {:#04x}", byte)),
        }
    }
    Ok(result)
}

/// Chain starts for one segment.
#[derive(Debug, Clone)]
pub struct SegmentChainStarts {
    pub segment_index: usize,
    /// VM offset of the segment from the mach_header.
    pub segment_offset: u64,
    pub page_size: u16,
    pub pointer_format: u16,
    pub max_valid_pointer: u32,
    /// One entry per page; `DYLD_CHAINED_PTR_START_NONE` means no fixups.
    pub page_starts: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct ChainedImport {
    pub lib_ordinal: i64,
    pub weak_import: bool,
    pub addend: i64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ChainedFixups {
    pub pointer_format: u16,
    pub starts: Vec<SegmentChainStarts>,
    pub imports: Vec<ChainedImport>,
}

/// Parse the `LC_DYLD_CHAINED_FIXUPS` blob.
pub fn parse_chained_fixups(macho: &MachO) -> Result<Option<ChainedFixups>, String> {
    let Some(blob) = macho.chained_fixups_cmd else {
        return Ok(None);
    };
    let data = blob.slice(&macho.bytes);
    if data.len() < 28 {
        return Err("truncated chained fixups header".to_string());
    }
    let fixups_version = get32(data, 0);
    if fixups_version != 0 {
        return Err(format!("unknown chained fixups version {}", fixups_version));
    }
    let starts_offset = get32(data, 4) as usize;
    let imports_offset = get32(data, 8) as usize;
    let symbols_offset = get32(data, 12) as usize;
    let imports_count = get32(data, 16);
    let imports_format = get32(data, 20);

    // dyld_chained_starts_in_image
    let seg_count = get32(data, starts_offset) as usize;
    let mut starts = Vec::new();
    let mut pointer_format = 0u16;
    for seg_index in 0..seg_count {
        let info_offset = get32(data, starts_offset + 4 + 4 * seg_index) as usize;
        if info_offset == 0 {
            continue;
        }
        let seg = starts_offset + info_offset;
        let page_size = get16(data, seg + 4);
        let format = get16(data, seg + 6);
        let segment_offset = get64(data, seg + 8);
        let max_valid_pointer = get32(data, seg + 16);
        let page_count = get16(data, seg + 20) as usize;
        let mut page_starts = Vec::with_capacity(page_count);
        for page in 0..page_count {
            let start = get16(data, seg + 22 + 2 * page);
            if start != DYLD_CHAINED_PTR_START_NONE && start & DYLD_CHAINED_PTR_START_MULTI != 0 {
                return Err("multi-start chained fixup pages are not supported".to_string());
            }
            page_starts.push(start);
        }
        pointer_format = format;
        starts.push(SegmentChainStarts {
            segment_index: seg_index,
            segment_offset,
            page_size,
            pointer_format: format,
            max_valid_pointer,
            page_starts,
        });
    }

    let mut imports = Vec::with_capacity(imports_count as usize);
    for i in 0..imports_count as usize {
        let (raw_ordinal, weak_import, name_offset, addend): (i64, bool, usize, i64) =
            match imports_format {
                DYLD_CHAINED_IMPORT => {
                    let entry = get32(data, imports_offset + 4 * i);
                    (
                        sign_extend_ordinal(entry & 0xFF, 8),
                        entry & 0x100 != 0,
                        (entry >> 9) as usize,
                        0,
                    )
                }
                DYLD_CHAINED_IMPORT_ADDEND => {
                    let entry = get32(data, imports_offset + 8 * i);
                    let addend = get32(data, imports_offset + 8 * i + 4) as i32 as i64;
                    (
                        sign_extend_ordinal(entry & 0xFF, 8),
                        entry & 0x100 != 0,
                        (entry >> 9) as usize,
                        addend,
                    )
                }
                DYLD_CHAINED_IMPORT_ADDEND64 => {
                    let entry = get64(data, imports_offset + 16 * i);
                    let addend = get64(data, imports_offset + 16 * i + 8) as i64;
                    (
                        sign_extend_ordinal((entry & 0xFFFF) as u32, 16),
                        entry & 0x1_0000 != 0,
                        (entry >> 32) as usize,
                        addend,
                    )
                }
                other => return Err(format!("unknown chained import format {}", other)),
            };
        let name = cstr(data, symbols_offset + name_offset)?.to_string();
        imports.push(ChainedImport {
            lib_ordinal: raw_ordinal,
            weak_import,
            addend,
            name,
        });
    }

    Ok(Some(ChainedFixups {
        pointer_format,
        starts,
        imports,
    }))
}

fn sign_extend_ordinal(raw: u32, bits: u32) -> i64 {
    // Special ordinals (-1, -2, -3) are stored in the top of the range.
    let threshold = 1u32 << (bits - 1);
    if raw >= threshold {
        (raw as i64) - (1i64 << bits)
    } else {
        raw as i64
    }
}

/// Chain stride in bytes for a pointer format.
pub fn chain_stride(pointer_format: u16) -> u64 {
    match pointer_format {
        DYLD_CHAINED_PTR_ARM64E => 8,
        DYLD_CHAINED_PTR_ARM64E_KERNEL
        | DYLD_CHAINED_PTR_ARM64E_USERLAND
        | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => 4,
        _ => 4,
    }
}

/// Decoded view of one in-place chained pointer.
#[derive(Debug, Copy, Clone)]
pub enum ChainedPointer {
    Rebase {
        /// Unslid target. Offset-based formats have the preferred base added
        /// back in already.
        target: u64,
        high8: u8,
        next: u64,
    },
    AuthRebase {
        /// Offset from the image base (auth pointers never carry vmaddrs).
        target: u64,
        diversity: u16,
        addr_div: bool,
        key: u8,
        next: u64,
    },
    Bind {
        ordinal: u32,
        addend: u64,
        next: u64,
    },
    AuthBind {
        ordinal: u32,
        diversity: u16,
        addr_div: bool,
        key: u8,
        next: u64,
    },
}

impl ChainedPointer {
    pub fn next(&self) -> u64 {
        match *self {
            ChainedPointer::Rebase { next, .. }
            | ChainedPointer::AuthRebase { next, .. }
            | ChainedPointer::Bind { next, .. }
            | ChainedPointer::AuthBind { next, .. } => next,
        }
    }

    pub fn is_bind(&self) -> bool {
        matches!(
            self,
            ChainedPointer::Bind { .. } | ChainedPointer::AuthBind { .. }
        )
    }

    /// Decode a raw 64-bit value under the given pointer format.
    /// `preferred_base` is the image's linked base address, added to targets
    /// of offset-based formats so callers always see an unslid vmaddr for
    /// plain rebases.
    pub fn decode(
        pointer_format: u16,
        raw: u64,
        preferred_base: u64,
    ) -> Result<ChainedPointer, String> {
        match pointer_format {
            DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => {
                let next = (raw >> 51) & 0xFFF;
                if (raw >> 63) & 1 != 0 {
                    Ok(ChainedPointer::Bind {
                        ordinal: (raw & 0xFF_FFFF) as u32,
                        addend: (raw >> 24) & 0xFF,
                        next,
                    })
                } else {
                    let mut target = raw & 0xF_FFFF_FFFF; // 36 bits
                    if pointer_format == DYLD_CHAINED_PTR_64_OFFSET {
                        target = target.wrapping_add(preferred_base);
                    }
                    Ok(ChainedPointer::Rebase {
                        target,
                        high8: ((raw >> 36) & 0xFF) as u8,
                        next,
                    })
                }
            }
            DYLD_CHAINED_PTR_ARM64E
            | DYLD_CHAINED_PTR_ARM64E_KERNEL
            | DYLD_CHAINED_PTR_ARM64E_USERLAND
            | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => {
                let auth = (raw >> 63) & 1 != 0;
                let bind = (raw >> 62) & 1 != 0;
                let next = (raw >> 51) & 0x7FF;
                let offset_based = pointer_format != DYLD_CHAINED_PTR_ARM64E;
                match (auth, bind) {
                    (false, false) => {
                        let mut target = raw & 0x7FF_FFFF_FFFF; // 43 bits
                        if offset_based {
                            target = target.wrapping_add(preferred_base);
                        }
                        Ok(ChainedPointer::Rebase {
                            target,
                            high8: ((raw >> 43) & 0xFF) as u8,
                            next,
                        })
                    }
                    (true, false) => Ok(ChainedPointer::AuthRebase {
                        target: raw & 0xFFFF_FFFF,
                        diversity: ((raw >> 32) & 0xFFFF) as u16,
                        addr_div: (raw >> 48) & 1 != 0,
                        key: ((raw >> 49) & 3) as u8,
                        next,
                    }),
                    (false, true) => {
                        let ordinal = if pointer_format == DYLD_CHAINED_PTR_ARM64E_USERLAND24 {
                            (raw & 0xFF_FFFF) as u32
                        } else {
                            (raw & 0xFFFF) as u32
                        };
                        Ok(ChainedPointer::Bind {
                            ordinal,
                            addend: (raw >> 32) & 0x7_FFFF,
                            next,
                        })
                    }
                    (true, true) => {
                        let ordinal = if pointer_format == DYLD_CHAINED_PTR_ARM64E_USERLAND24 {
                            (raw & 0xFF_FFFF) as u32
                        } else {
                            (raw & 0xFFFF) as u32
                        };
                        Ok(ChainedPointer::AuthBind {
                            ordinal,
                            diversity: ((raw >> 32) & 0xFFFF) as u16,
                            addr_div: (raw >> 48) & 1 != 0,
                            key: ((raw >> 49) & 3) as u8,
                            next,
                        })
                    }
                }
            }
            DYLD_CHAINED_PTR_32 => {
                let raw = raw & 0xFFFF_FFFF;
                let next = (raw >> 26) & 0x1F;
                if (raw >> 31) & 1 != 0 {
                    Ok(ChainedPointer::Bind {
                        ordinal: (raw & 0xF_FFFF) as u32,
                        addend: (raw >> 20) & 0x3F,
                        next,
                    })
                } else {
                    Ok(ChainedPointer::Rebase {
                        target: raw & 0x3FF_FFFF,
                        high8: 0,
                        next,
                    })
                }
            }
            other => Err(format!("unsupported chained pointer format {}", other)),
        }
    }
}

/// Lazily-built index from vm address to fixup, used when resolving ObjC
/// metadata pointers and bind targets.
pub struct FixupIndex {
    pub chained: Option<ChainedFixups>,
    pub rebases: Vec<RebaseLocation>,
    pub binds: Vec<BindLocation>,
    /// Per segment: does any chained fixup in it carry the auth bit?
    pub segment_has_auth: Vec<bool>,
}

impl FixupIndex {
    pub fn build(macho: &MachO) -> Result<FixupIndex, String> {
        let chained = parse_chained_fixups(macho)?;
        let mut segment_has_auth = vec![false; macho.segments.len()];
        let mut rebases = Vec::new();
        let mut binds = Vec::new();
        if chained.is_none() {
            if !macho.dyld_info.rebase.is_empty() {
                rebases = parse_rebase_opcodes(
                    macho.dyld_info.rebase.slice(&macho.bytes),
                    macho.pointer_size(),
                )?;
            }
            if !macho.dyld_info.bind.is_empty() {
                binds = parse_bind_opcodes(
                    macho.dyld_info.bind.slice(&macho.bytes),
                    macho.pointer_size(),
                    false,
                )?;
            }
            if !macho.dyld_info.lazy_bind.is_empty() {
                binds.extend(parse_bind_opcodes(
                    macho.dyld_info.lazy_bind.slice(&macho.bytes),
                    macho.pointer_size(),
                    true,
                )?);
            }
        } else if let Some(chained) = &chained {
            // Walk the chains in the original file to enumerate binds.
            for seg_starts in &chained.starts {
                let segment = &macho.segments[seg_starts.segment_index];
                for (page_index, &start) in seg_starts.page_starts.iter().enumerate() {
                    if start == DYLD_CHAINED_PTR_START_NONE {
                        continue;
                    }
                    let mut offset_in_seg =
                        page_index as u64 * seg_starts.page_size as u64 + start as u64;
                    loop {
                        let file_offset = (segment.file_offset + offset_in_seg) as usize;
                        let raw = if macho.is64 {
                            get64(&macho.bytes, file_offset)
                        } else {
                            get32(&macho.bytes, file_offset) as u64
                        };
                        let ptr = ChainedPointer::decode(
                            seg_starts.pointer_format,
                            raw,
                            macho.preferred_load_address(),
                        )?;
                        match ptr {
                            ChainedPointer::AuthRebase { .. } => {
                                segment_has_auth[seg_starts.segment_index] = true;
                            }
                            ChainedPointer::Bind {
                                ordinal, addend, ..
                            } => {
                                let import =
                                    chained.imports.get(ordinal as usize).ok_or_else(|| {
                                        format!("bind ordinal {} out of range", ordinal)
                                    })?;
                                binds.push(BindLocation {
                                    btype: 0,
                                    seg_index: seg_starts.segment_index,
                                    seg_offset: offset_in_seg,
                                    lib_ordinal: import.lib_ordinal,
                                    symbol: import.name.clone(),
                                    addend: import.addend + addend as i64,
                                    weak_import: import.weak_import,
                                    auth: None,
                                });
                            }
                            ChainedPointer::AuthBind { ordinal, .. } => {
                                segment_has_auth[seg_starts.segment_index] = true;
                                let import =
                                    chained.imports.get(ordinal as usize).ok_or_else(|| {
                                        format!("bind ordinal {} out of range", ordinal)
                                    })?;
                                binds.push(BindLocation {
                                    btype: 0,
                                    seg_index: seg_starts.segment_index,
                                    seg_offset: offset_in_seg,
                                    lib_ordinal: import.lib_ordinal,
                                    symbol: import.name.clone(),
                                    addend: import.addend,
                                    weak_import: import.weak_import,
                                    auth: None,
                                });
                            }
                            _ => (),
                        }
                        let next = ptr.next();
                        if next == 0 {
                            break;
                        }
                        offset_in_seg += next * chain_stride(seg_starts.pointer_format);
                    }
                }
            }
        }
        Ok(FixupIndex {
            chained,
            rebases,
            binds,
            segment_has_auth,
        })
    }

    /// The symbol bound at a vm address, if any.
    pub fn bind_at(&self, macho: &MachO, addr: u64) -> Option<&BindLocation> {
        self.binds.iter().find(|b| {
            let segment = &macho.segments[b.seg_index];
            segment.vmaddr + b.seg_offset == addr
        })
    }

    /// Resolve the unslid target of a rebased pointer slot at `addr`, reading
    /// the in-place value (decoding it if the binary uses chained fixups).
    /// Returns [None] for binds and untracked slots.
    pub fn rebase_target_at(&self, macho: &MachO, addr: u64) -> Option<u64> {
        let file_offset = macho.file_offset_for_address(addr)?;
        let raw = if macho.is64 {
            get64(&macho.bytes, file_offset)
        } else {
            get32(&macho.bytes, file_offset) as u64
        };
        match &self.chained {
            None => {
                // Opcode rebases store the target vmaddr in place.
                Some(raw)
            }
            Some(chained) => {
                match ChainedPointer::decode(
                    chained.pointer_format,
                    raw,
                    macho.preferred_load_address(),
                )
                .ok()?
                {
                    ChainedPointer::Rebase { target, .. } => Some(target),
                    ChainedPointer::AuthRebase { target, .. } => {
                        Some(target.wrapping_add(macho.preferred_load_address()))
                    }
                    _ => None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebase_opcode_walk() {
        // segment 2, offset 0x10, pointer type, rebase twice
        let opcodes = [
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2,
            0x10,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES | 2,
            REBASE_OPCODE_DONE,
        ];
        let rebases = parse_rebase_opcodes(&opcodes, 8).unwrap();
        assert_eq!(rebases.len(), 2);
        assert_eq!(rebases[0].seg_index, 2);
        assert_eq!(rebases[0].seg_offset, 0x10);
        assert_eq!(rebases[1].seg_offset, 0x18);
    }

    #[test]
    fn bind_opcode_walk() {
        let mut opcodes = vec![
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
        ];
        opcodes.extend_from_slice(b"_f\0");
        opcodes.extend_from_slice(&[
            BIND_OPCODE_SET_TYPE_IMM | 1,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0x00,
            BIND_OPCODE_DO_BIND,
            BIND_OPCODE_DONE,
        ]);
        let binds = parse_bind_opcodes(&opcodes, 8, false).unwrap();
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].symbol, "_f");
        assert_eq!(binds[0].lib_ordinal, 1);
        assert_eq!(binds[0].seg_index, 1);
    }

    #[test]
    fn chained_pointer_decode_generic64() {
        // plain rebase: target 0x4000, next 1
        let raw = (1u64 << 51) | 0x4000;
        match ChainedPointer::decode(DYLD_CHAINED_PTR_64, raw, 0).unwrap() {
            ChainedPointer::Rebase {
                target,
                high8,
                next,
            } => {
                assert_eq!(target, 0x4000);
                assert_eq!(high8, 0);
                assert_eq!(next, 1);
            }
            other => panic!("wrong decode: {:?}", other),
        }
        // bind: ordinal 7
        let raw = (1u64 << 63) | 7;
        assert!(ChainedPointer::decode(DYLD_CHAINED_PTR_64, raw, 0)
            .unwrap()
            .is_bind());
    }

    #[test]
    fn chained_pointer_decode_arm64e_auth() {
        let raw = (1u64 << 63) | (2u64 << 49) | (1u64 << 48) | (0x1234u64 << 32) | 0x8000;
        match ChainedPointer::decode(DYLD_CHAINED_PTR_ARM64E, raw, 0).unwrap() {
            ChainedPointer::AuthRebase {
                target,
                diversity,
                addr_div,
                key,
                next,
            } => {
                assert_eq!(target, 0x8000);
                assert_eq!(diversity, 0x1234);
                assert!(addr_div);
                assert_eq!(key, 2);
                assert_eq!(next, 0);
            }
            other => panic!("wrong decode: {:?}", other),
        }
    }

    #[test]
    fn special_ordinals_sign_extend() {
        assert_eq!(sign_extend_ordinal(0xFF, 8), -1);
        assert_eq!(sign_extend_ordinal(0xFE, 8), -2);
        assert_eq!(sign_extend_ordinal(5, 8), 5);
    }
}
