/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! End-to-end build over synthetic arm64 dylibs: two small libraries, one
//! exporting a symbol the other imports, plus a symlink alias. Exercises
//! layout, split-seg rewriting, bind resolution, slide info, the image
//! tables and the code signature on the emitted file.

use cachebuilder::options::Disposition;
use cachebuilder::trie::{build_trie, export_payload, TrieEntry};
use cachebuilder::{CreateOptions, FileSystem, InputFile, SharedCacheBuilder};

const MH_MAGIC_64: u32 = 0xFEED_FACF;
const CPU_TYPE_ARM64: u32 = 0x0100_000C;
const MH_DYLIB: u32 = 0x6;

const LC_SEGMENT_64: u32 = 0x19;
const LC_ID_DYLIB: u32 = 0xD;
const LC_LOAD_DYLIB: u32 = 0xC;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xB;
const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;
const LC_SEGMENT_SPLIT_INFO: u32 = 0x1E;
const LC_UUID: u32 = 0x1B;

const TEXT_SIZE: u64 = 0x4000;
const DATA_VMADDR: u64 = 0x4000;
const LINKEDIT_VMADDR: u64 = 0x5000;

fn push32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_name16(out: &mut Vec<u8>, name: &str) {
    let mut bytes = [0u8; 16];
    bytes[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&bytes);
}

fn segment_command(
    name: &str,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    prot: u32,
    sections: &[(&str, u64, u64, u32)], // (name, addr, size, fileoff)
) -> Vec<u8> {
    let mut cmd = Vec::new();
    push32(&mut cmd, LC_SEGMENT_64);
    push32(&mut cmd, 72 + 80 * sections.len() as u32);
    push_name16(&mut cmd, name);
    push64(&mut cmd, vmaddr);
    push64(&mut cmd, vmsize);
    push64(&mut cmd, fileoff);
    push64(&mut cmd, filesize);
    push32(&mut cmd, prot); // maxprot
    push32(&mut cmd, prot); // initprot
    push32(&mut cmd, sections.len() as u32);
    push32(&mut cmd, 0); // flags
    for &(sect_name, addr, size, sect_offset) in sections {
        push_name16(&mut cmd, sect_name);
        push_name16(&mut cmd, name);
        push64(&mut cmd, addr);
        push64(&mut cmd, size);
        push32(&mut cmd, sect_offset);
        push32(&mut cmd, 3); // align
        push32(&mut cmd, 0); // reloff
        push32(&mut cmd, 0); // nreloc
        push32(&mut cmd, 0); // flags
        push32(&mut cmd, 0);
        push32(&mut cmd, 0);
        push32(&mut cmd, 0);
    }
    cmd
}

fn dylib_command(cmd_kind: u32, path: &str) -> Vec<u8> {
    let name_len = path.len() + 1;
    let padded = (24 + name_len + 7) & !7;
    let mut cmd = Vec::new();
    push32(&mut cmd, cmd_kind);
    push32(&mut cmd, padded as u32);
    push32(&mut cmd, 24); // name offset
    push32(&mut cmd, 2); // timestamp
    push32(&mut cmd, 0x10000); // current version
    push32(&mut cmd, 0x10000); // compatibility version
    cmd.extend_from_slice(path.as_bytes());
    cmd.resize(padded, 0);
    cmd
}

fn uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Split-seg v2 blob with 64-bit pointer edges.
/// Sections: 0 = header, 1 = `__text`, 2 = `__data`.
fn split_seg_blob(edges: &[(u64, u64, u64, u64)]) -> Vec<u8> {
    // (from section, to section, from offset, to offset)
    let mut blob = vec![0x7F];
    uleb(&mut blob, edges.len() as u64);
    for &(from, to, from_offset, to_offset) in edges {
        uleb(&mut blob, from);
        uleb(&mut blob, to);
        uleb(&mut blob, 1); // one target offset
        uleb(&mut blob, to_offset);
        uleb(&mut blob, 1); // one kind run
        uleb(&mut blob, 2); // POINTER_64
        uleb(&mut blob, 1); // one location
        uleb(&mut blob, from_offset);
    }
    blob
}

fn bind_opcodes(segment_index: u8, offset: u64, symbol: &str) -> Vec<u8> {
    let mut opcodes = Vec::new();
    opcodes.push(0x10 | 1); // SET_DYLIB_ORDINAL_IMM(1)
    opcodes.push(0x40); // SET_SYMBOL_TRAILING_FLAGS_IMM
    opcodes.extend_from_slice(symbol.as_bytes());
    opcodes.push(0);
    opcodes.push(0x50 | 1); // SET_TYPE_IMM(pointer)
    opcodes.push(0x70 | segment_index); // SET_SEGMENT_AND_OFFSET_ULEB
    uleb(&mut opcodes, offset);
    opcodes.push(0x90); // DO_BIND
    opcodes.push(0x00); // DONE
    opcodes
}

struct DylibSpec<'a> {
    install_name: &'a str,
    dependency: Option<&'a str>,
    exports: Vec<TrieEntry>,
    binds: Option<Vec<u8>>,
}

/// Emit a minimal arm64 dylib: `__TEXT` (with `__text`), `__DATA` holding
/// one rebased pointer to `__text`, `__LINKEDIT` with trie/binds/split-seg.
fn build_dylib(spec: DylibSpec<'_>) -> Vec<u8> {
    let export_trie = build_trie(&spec.exports);
    let binds = spec.binds.unwrap_or_default();
    // The rebased pointer at __DATA+0 targets __text (offset 0 into section
    // index 1).
    let split_seg = split_seg_blob(&[(2, 1, 0, 0)]);

    // Link-edit layout: trie, binds, split-seg, strings.
    let le_base = LINKEDIT_VMADDR as usize;
    let export_off = le_base;
    let bind_off = export_off + export_trie.len();
    let split_off = bind_off + binds.len();
    let str_off = split_off + split_seg.len();
    let str_size = 8usize;
    let le_size = str_off + str_size - le_base;

    let mut commands: Vec<Vec<u8>> = Vec::new();
    commands.push(segment_command(
        "__TEXT",
        0,
        TEXT_SIZE,
        0,
        TEXT_SIZE,
        5,
        &[("__text", 0x1000, 0x100, 0x1000)],
    ));
    commands.push(segment_command(
        "__DATA",
        DATA_VMADDR,
        0x1000,
        DATA_VMADDR,
        0x1000,
        3,
        &[("__data", DATA_VMADDR, 0x100, DATA_VMADDR as u32)],
    ));
    commands.push(segment_command(
        "__LINKEDIT",
        LINKEDIT_VMADDR,
        0x1000,
        LINKEDIT_VMADDR,
        le_size as u64,
        1,
        &[],
    ));
    commands.push(dylib_command(LC_ID_DYLIB, spec.install_name));
    if let Some(dependency) = spec.dependency {
        commands.push(dylib_command(LC_LOAD_DYLIB, dependency));
    }
    {
        let mut cmd = Vec::new();
        push32(&mut cmd, LC_SYMTAB);
        push32(&mut cmd, 24);
        push32(&mut cmd, str_off as u32); // symoff (no symbols)
        push32(&mut cmd, 0);
        push32(&mut cmd, str_off as u32);
        push32(&mut cmd, str_size as u32);
        commands.push(cmd);
    }
    {
        let mut cmd = Vec::new();
        push32(&mut cmd, LC_DYSYMTAB);
        push32(&mut cmd, 80);
        cmd.resize(80, 0);
        commands.push(cmd);
    }
    {
        let mut cmd = Vec::new();
        push32(&mut cmd, LC_DYLD_INFO_ONLY);
        push32(&mut cmd, 48);
        push32(&mut cmd, 0); // rebase (covered by split seg)
        push32(&mut cmd, 0);
        push32(&mut cmd, bind_off as u32);
        push32(&mut cmd, binds.len() as u32);
        push32(&mut cmd, 0); // weak
        push32(&mut cmd, 0);
        push32(&mut cmd, 0); // lazy
        push32(&mut cmd, 0);
        push32(&mut cmd, export_off as u32);
        push32(&mut cmd, export_trie.len() as u32);
        commands.push(cmd);
    }
    {
        let mut cmd = Vec::new();
        push32(&mut cmd, LC_SEGMENT_SPLIT_INFO);
        push32(&mut cmd, 16);
        push32(&mut cmd, split_off as u32);
        push32(&mut cmd, split_seg.len() as u32);
        commands.push(cmd);
    }
    {
        let mut cmd = Vec::new();
        push32(&mut cmd, LC_UUID);
        push32(&mut cmd, 24);
        cmd.extend_from_slice(&[0xA5; 16]);
        commands.push(cmd);
    }

    let sizeofcmds: usize = commands.iter().map(|c| c.len()).sum();
    let mut file = Vec::new();
    push32(&mut file, MH_MAGIC_64);
    push32(&mut file, CPU_TYPE_ARM64);
    push32(&mut file, 0); // cpusubtype
    push32(&mut file, MH_DYLIB);
    push32(&mut file, commands.len() as u32);
    push32(&mut file, sizeofcmds as u32);
    push32(&mut file, 0); // flags
    push32(&mut file, 0); // reserved
    for cmd in &commands {
        file.extend_from_slice(cmd);
    }
    assert!(file.len() <= 0x1000, "load commands grew past a page");

    file.resize(le_base + le_size, 0);
    // The rebased pointer: its on-disk value is the target's unslid address.
    file[DATA_VMADDR as usize..DATA_VMADDR as usize + 8]
        .copy_from_slice(&0x1000u64.to_le_bytes());
    file[export_off..export_off + export_trie.len()].copy_from_slice(&export_trie);
    file[bind_off..bind_off + binds.len()].copy_from_slice(&binds);
    file[split_off..split_off + split_seg.len()].copy_from_slice(&split_seg);
    file
}

fn get32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn get64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

fn build_test_cache() -> cachebuilder::BuildResult {
    let lib_a = build_dylib(DylibSpec {
        install_name: "/a.dylib",
        dependency: None,
        exports: vec![TrieEntry {
            name: "_f".to_string(),
            payload: export_payload(0, 0x1000),
        }],
        binds: None,
    });
    let lib_b = build_dylib(DylibSpec {
        install_name: "/b.dylib",
        dependency: Some("/a.dylib"),
        exports: Vec::new(),
        binds: Some(bind_opcodes(1, 8, "_f")),
    });

    let mut fs = FileSystem::new();
    fs.add_file("/a.dylib", lib_a, 1111);
    fs.add_file("/b.dylib", lib_b, 2222);
    fs.add_symlink("/a_alias.dylib", "/a.dylib");

    let files = vec![
        InputFile {
            path: "/a.dylib".to_string(),
            must_be_included: true,
        },
        InputFile {
            path: "/b.dylib".to_string(),
            must_be_included: true,
        },
    ];
    let options = CreateOptions {
        arch: "arm64".to_string(),
        platform: 2,
        disposition: Disposition::Customer,
        ..CreateOptions::default()
    };
    let builder = SharedCacheBuilder::new(options).unwrap();
    builder
        .build(&files, &fs)
        .unwrap_or_else(|(message, _)| panic!("build failed: {}", message))
}

#[test]
fn cache_layout_and_fixups() {
    let result = build_test_cache();
    let cache = &result.cache.bytes;

    // Header basics.
    assert_eq!(&cache[..7], b"dyld_v1");
    assert_eq!(&cache[10..16], b"arm64\0");
    let mapping_offset = get32(cache, 0x10) as usize;
    let mapping_count = get32(cache, 0x14);
    assert_eq!(mapping_count, 3);
    // Text, data and read-only regions at the architecture's bases.
    let text_addr = get64(cache, mapping_offset);
    assert_eq!(text_addr, 0x1_8000_0000);
    let data_addr = get64(cache, mapping_offset + 32);
    assert_eq!(data_addr, 0x1_C000_0000);
    let ro_addr = get64(cache, mapping_offset + 64);
    assert_eq!(ro_addr, 0x2_0000_0000);
    let data_file_offset = get64(cache, mapping_offset + 32 + 16) as usize;

    // Image table: 2 dylibs + 1 symlink alias, alias sharing an address.
    let images_offset = get32(cache, 0x20) as usize;
    let images_count = get32(cache, 0x24);
    assert_eq!(images_count, 3);
    let image_a_addr = get64(cache, images_offset);
    let image_b_addr = get64(cache, images_offset + 32);
    let alias_addr = get64(cache, images_offset + 64);
    assert_eq!(alias_addr, image_a_addr);
    assert!(image_b_addr > image_a_addr);
    // mtime/inode recorded from the input filesystem.
    assert_eq!(get64(cache, images_offset + 8), 1111);
    let path_offset = get32(cache, images_offset + 24) as usize;
    assert_eq!(&cache[path_offset..path_offset + 9], b"/a.dylib\0");

    // The rebased pointer in /a.dylib's __DATA now holds the cache address
    // of its __text. The slide-info pass threads chain deltas through the
    // pointers' unused high bits, so compare under the value mask.
    let value_mask = !0x00FF_FF00_0000_0000u64;
    let a_data = data_file_offset;
    assert_eq!(get64(cache, a_data) & value_mask, image_a_addr + 0x1000);

    // /b.dylib's bind to _f resolved to /a.dylib's implementation.
    // Its __DATA is the next 4 KiB-aligned slot in the data region.
    let b_data = data_file_offset + 0x1000;
    assert_eq!(get64(cache, b_data + 8) & value_mask, image_a_addr + 0x1000);
    // And its own rebase was adjusted too.
    assert_eq!(get64(cache, b_data) & value_mask, image_b_addr + 0x1000);

    // Patch info records the export and its use.
    let patch_info_addr = get64(cache, 0xC8);
    let patch_info_offset = (patch_info_addr - 0x1_8000_0000) as usize;
    let export_count = get64(cache, patch_info_offset + 24);
    let location_count = get64(cache, patch_info_offset + 40);
    assert_eq!(export_count, 1);
    assert_eq!(location_count, 1);
    let names_addr = get64(cache, patch_info_offset + 48);
    let names_offset = (names_addr - 0x1_8000_0000) as usize;
    assert_eq!(&cache[names_offset..names_offset + 3], b"_f\0");

    // Both inputs are fully contained in the cache.
    assert_eq!(
        result.paths_eligible_for_deletion,
        vec!["/a.dylib".to_string(), "/b.dylib".to_string()]
    );
}

#[test]
fn slide_info_covers_the_rebased_pointers() {
    let result = build_test_cache();
    let cache = &result.cache.bytes;
    let mapping_with_slide_offset = get32(cache, 0x18) as usize;
    // Data region mapping is entry 1; 56 bytes per entry.
    let entry = mapping_with_slide_offset + 56;
    let slide_offset = get64(cache, entry + 32) as usize;
    let slide_size = get64(cache, entry + 40);
    assert!(slide_size > 0);

    // arm64 uses slide info v2.
    assert_eq!(get32(cache, slide_offset), 2);
    assert_eq!(get32(cache, slide_offset + 4), 0x1000);
    let page_starts_offset = get32(cache, slide_offset + 8) as usize;
    let page_starts_count = get32(cache, slide_offset + 12) as usize;
    assert!(page_starts_count >= 2);
    // Page 0 (libA's data) starts its chain at slot 0.
    let start0 = u16::from_le_bytes(
        cache[slide_offset + page_starts_offset..slide_offset + page_starts_offset + 2]
            .try_into()
            .unwrap(),
    );
    assert_eq!(start0, 0);
    // Page 1 (libB's data) has rebases too.
    let start1 = u16::from_le_bytes(
        cache[slide_offset + page_starts_offset + 2..slide_offset + page_starts_offset + 4]
            .try_into()
            .unwrap(),
    );
    assert_eq!(start1, 0);
}

#[test]
fn code_signature_seals_the_file() {
    let result = build_test_cache();
    let cache = &result.cache.bytes;
    let signature_offset = get64(cache, 0x30) as usize;
    let signature_size = get64(cache, 0x38) as usize;
    assert!(signature_offset > 0);
    assert_eq!(signature_offset + signature_size, cache.len());
    // SuperBlob magic, big-endian.
    assert_eq!(
        &cache[signature_offset..signature_offset + 4],
        &0xFADE_0CC0u32.to_be_bytes()
    );
    // The UUID was derived and versioned.
    let uuid = &cache[0x60..0x70];
    assert_ne!(uuid, &[0u8; 16]);
    assert_eq!(uuid[6] >> 4, 3);
    assert_ne!(result.cache.cd_hash, [0u8; 20]);
}

#[test]
fn map_files_describe_the_layout() {
    let result = build_test_cache();
    assert!(result.map_file.contains("/a.dylib"));
    assert!(result.map_file.contains("__TEXT"));
    let json: serde_json::Value = serde_json::from_str(&result.json_map).unwrap();
    assert_eq!(json["disposition"], "customer");
    assert_eq!(json["images"].as_array().unwrap().len(), 2);
}
