/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Ad-hoc code signing of the finished cache.
//!
//! The signature is a SuperBlob holding a CodeDirectory (two in agile mode:
//! SHA-1 for old loaders plus a SHA-256 alternate), an empty Requirements
//! blob and an empty CMS wrapper. Every 4 KiB or 16 KiB page of the cache
//! file (plus the unmapped local-symbols file, if any) gets a hash slot.
//!
//! The cache UUID is derived from the signature itself: the code directory
//! is hashed with the UUID zeroed, the first 16 bytes become the UUID (with
//! RFC 4122 version/variant bits forced), and page 0 is re-hashed because it
//! contains the header. The published cdHash is the first 20 bytes of the
//! code-directory digest.
//!
//! All integers in signature blobs are big-endian, unlike the rest of the
//! cache.

use crate::cache_format::{align, CacheHeader};
use crate::diagnostics::Diagnostics;
use crate::options::CodeSigningDigestMode;
use sha1::Sha1;
use sha2::{Digest, Sha256};

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xFADE_0CC0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xFADE_0C02;
const CSMAGIC_REQUIREMENTS: u32 = 0xFADE_0C01;
const CSMAGIC_BLOBWRAPPER: u32 = 0xFADE_0B01;

const CSSLOT_CODEDIRECTORY: u32 = 0;
const CSSLOT_REQUIREMENTS: u32 = 2;
const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;
const CSSLOT_CMS_SIGNATURE: u32 = 0x10000;

const CS_HASHTYPE_SHA1: u8 = 1;
const CS_HASHTYPE_SHA256: u8 = 2;
const CS_HASH_SIZE_SHA1: usize = 20;
const CS_HASH_SIZE_SHA256: usize = 32;

const CS_ADHOC: u32 = 0x2;
const CD_VERSION_SUPPORTS_EXEC_SEG: u32 = 0x20400;

/// `end_withExecSeg` of the code directory struct.
const CD_FIXED_SIZE: usize = 88;
const REQUIREMENTS_BLOB_SIZE: usize = 12;
const CMS_BLOB_SIZE: usize = 8;

fn set32_be(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn set64_be(buffer: &mut [u8], offset: usize, value: u64) {
    buffer[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

#[derive(Copy, Clone)]
enum HashKind {
    Sha1,
    Sha256,
}

impl HashKind {
    fn size(self) -> usize {
        match self {
            HashKind::Sha1 => CS_HASH_SIZE_SHA1,
            HashKind::Sha256 => CS_HASH_SIZE_SHA256,
        }
    }

    fn hash_type(self) -> u8 {
        match self {
            HashKind::Sha1 => CS_HASHTYPE_SHA1,
            HashKind::Sha256 => CS_HASHTYPE_SHA256,
        }
    }

    fn digest(self, data: &[u8], out: &mut [u8]) {
        match self {
            HashKind::Sha1 => {
                let mut hasher = Sha1::new();
                hasher.update(data);
                out.copy_from_slice(&hasher.finalize());
            }
            HashKind::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                out.copy_from_slice(&hasher.finalize());
            }
        }
    }
}

pub struct CodeSignature {
    pub blob: Vec<u8>,
    /// First 20 bytes of the primary code directory's digest.
    pub cd_hash: [u8; 20],
}

struct DirectoryLayout {
    offset: usize,
    size: usize,
    hash_offset: usize,
    kind: HashKind,
}

/// Sign the cache. `cache` is the final file image (its header already
/// records where the signature will land), `local_symbols` the unmapped
/// region appended after it. Writes the derived UUID into the header page
/// and returns the signature blob.
pub fn code_sign(
    cache: &mut [u8],
    local_symbols: Option<&[u8]>,
    arch_name: &str,
    cs_page_size: u32,
    text_file_size: u64,
    digest_mode: CodeSigningDigestMode,
    dylibs_removed_from_disk: bool,
    release_disposition: bool,
    diag: &mut Diagnostics,
) -> Option<CodeSignature> {
    let agile = digest_mode == CodeSigningDigestMode::Agile;
    // In agile mode the primary directory stays SHA-1 for compatibility.
    let primary = if agile {
        HashKind::Sha1
    } else {
        HashKind::Sha256
    };

    let mut identifier = format!("com.apple.dyld.cache.{}", arch_name);
    if dylibs_removed_from_disk {
        identifier.push_str(if release_disposition {
            ".release"
        } else {
            ".development"
        });
    }

    let page_size = cs_page_size as usize;
    let code_limit = cache.len() + local_symbols.map(|l| l.len()).unwrap_or(0);
    let slot_count = code_limit.div_ceil(page_size);
    if slot_count == 0 {
        diag.error("nothing to sign");
        return None;
    }
    let special_slot_count = CSSLOT_REQUIREMENTS as usize;
    let id_size = identifier.len() + 1;

    // SuperBlob layout: indexes, CD, (alt CD), requirements, CMS.
    let blob_count = if agile { 4 } else { 3 };
    let cd_offset = 12 + blob_count * 8;
    let cd_size =
        CD_FIXED_SIZE + id_size + primary.size() * special_slot_count + slot_count * primary.size();
    let cd256_offset = cd_offset + cd_size;
    let cd256_size = if agile {
        CD_FIXED_SIZE
            + id_size
            + CS_HASH_SIZE_SHA256 * special_slot_count
            + slot_count * CS_HASH_SIZE_SHA256
    } else {
        0
    };
    let reqs_offset = cd256_offset + cd256_size;
    let cms_offset = reqs_offset + REQUIREMENTS_BLOB_SIZE;
    let sb_size = cms_offset + CMS_BLOB_SIZE;
    let sig_size = align(sb_size as u64, 14) as usize;

    let mut blob = vec![0u8; sig_size];
    set32_be(&mut blob, 0, CSMAGIC_EMBEDDED_SIGNATURE);
    set32_be(&mut blob, 4, sb_size as u32);
    set32_be(&mut blob, 8, blob_count as u32);
    set32_be(&mut blob, 12, CSSLOT_CODEDIRECTORY);
    set32_be(&mut blob, 16, cd_offset as u32);
    set32_be(&mut blob, 20, CSSLOT_REQUIREMENTS);
    set32_be(&mut blob, 24, reqs_offset as u32);
    set32_be(&mut blob, 28, CSSLOT_CMS_SIGNATURE);
    set32_be(&mut blob, 32, cms_offset as u32);
    if agile {
        set32_be(&mut blob, 36, CSSLOT_ALTERNATE_CODEDIRECTORIES);
        set32_be(&mut blob, 40, cd256_offset as u32);
    }

    // Empty requirements set.
    set32_be(&mut blob, reqs_offset, CSMAGIC_REQUIREMENTS);
    set32_be(&mut blob, reqs_offset + 4, REQUIREMENTS_BLOB_SIZE as u32);
    set32_be(&mut blob, reqs_offset + 8, 0);

    // Empty CMS wrapper: this is only an ad-hoc signature.
    set32_be(&mut blob, cms_offset, CSMAGIC_BLOBWRAPPER);
    set32_be(&mut blob, cms_offset + 4, CMS_BLOB_SIZE as u32);

    let mut directories = vec![DirectoryLayout {
        offset: cd_offset,
        size: cd_size,
        hash_offset: CD_FIXED_SIZE + id_size + primary.size() * special_slot_count,
        kind: primary,
    }];
    if agile {
        directories.push(DirectoryLayout {
            offset: cd256_offset,
            size: cd256_size,
            hash_offset: CD_FIXED_SIZE + id_size + CS_HASH_SIZE_SHA256 * special_slot_count,
            kind: HashKind::Sha256,
        });
    }

    for dir in &directories {
        let cd = &mut blob[dir.offset..dir.offset + dir.size];
        set32_be(cd, 0, CSMAGIC_CODEDIRECTORY);
        set32_be(cd, 4, dir.size as u32);
        set32_be(cd, 8, CD_VERSION_SUPPORTS_EXEC_SEG);
        set32_be(cd, 12, CS_ADHOC);
        set32_be(cd, 16, dir.hash_offset as u32);
        set32_be(cd, 20, CD_FIXED_SIZE as u32); // identOffset
        set32_be(cd, 24, special_slot_count as u32);
        set32_be(cd, 28, slot_count as u32);
        set32_be(cd, 32, code_limit as u32);
        cd[36] = dir.kind.size() as u8;
        cd[37] = dir.kind.hash_type();
        cd[38] = 0; // not a platform binary
        cd[39] = (page_size as u32).trailing_zeros() as u8;
        // spare2, scatter, team, spare3, codeLimit64 stay zero
        set64_be(cd, 64, 0); // execSegBase: text is at file offset 0
        set64_be(cd, 72, text_file_size);
        set64_be(cd, 80, 0); // not a main binary
        cd[CD_FIXED_SIZE..CD_FIXED_SIZE + identifier.len()]
            .copy_from_slice(identifier.as_bytes());
        cd[CD_FIXED_SIZE + identifier.len()] = 0;

        // Special slot -2: hash of the requirements blob. Slot -1 stays
        // zero (no Info.plist).
        let mut reqs_hash = vec![0u8; dir.kind.size()];
        dir.kind.digest(
            &blob_requirements_bytes(),
            &mut reqs_hash,
        );
        let special_base = dir.offset + dir.hash_offset - 2 * dir.kind.size();
        blob[special_base..special_base + dir.kind.size()].copy_from_slice(&reqs_hash);
    }

    // Page hashing, in parallel over the slot range.
    for dir in &directories {
        hash_pages(
            &mut blob,
            dir,
            cache,
            local_symbols,
            page_size,
            slot_count,
            0,
            slot_count,
        );
    }

    // Derive the UUID: hash the primary code directory with the UUID still
    // zero, then re-hash page 0 since the header changed.
    {
        let mut digest = [0u8; CS_HASH_SIZE_SHA256];
        HashKind::Sha256.digest(&blob[cd_offset..cd_offset + cd_size], &mut digest);
        let uuid = &mut cache[CacheHeader::UUID_OFFSET..CacheHeader::UUID_OFFSET + 16];
        uuid.copy_from_slice(&digest[..16]);
        uuid[6] = (uuid[6] & 0x0F) | (3 << 4);
        uuid[8] = (uuid[8] & 0x3F) | 0x80;
        for dir in &directories {
            hash_pages(
                &mut blob,
                dir,
                cache,
                local_symbols,
                page_size,
                slot_count,
                0,
                1,
            );
        }
    }

    let mut cd_hash = [0u8; 20];
    let mut full = vec![0u8; directories[0].kind.size()];
    directories[0].kind.digest(&blob[cd_offset..cd_offset + cd_size], &mut full);
    cd_hash.copy_from_slice(&full[..20]);

    Some(CodeSignature { blob, cd_hash })
}

fn blob_requirements_bytes() -> [u8; REQUIREMENTS_BLOB_SIZE] {
    let mut reqs = [0u8; REQUIREMENTS_BLOB_SIZE];
    reqs[..4].copy_from_slice(&CSMAGIC_REQUIREMENTS.to_be_bytes());
    reqs[4..8].copy_from_slice(&(REQUIREMENTS_BLOB_SIZE as u32).to_be_bytes());
    reqs
}

/// The bytes of page `slot`, spanning the cache file then the local-symbols
/// file.
fn page_bytes<'a>(
    cache: &'a [u8],
    local_symbols: Option<&'a [u8]>,
    page_size: usize,
    slot: usize,
) -> &'a [u8] {
    let start = slot * page_size;
    if start < cache.len() {
        let end = (start + page_size).min(cache.len());
        &cache[start..end]
    } else {
        let locals = local_symbols.unwrap_or(&[]);
        let start = start - cache.len();
        let end = (start + page_size).min(locals.len());
        &locals[start..end]
    }
}

#[allow(clippy::too_many_arguments)]
fn hash_pages(
    blob: &mut [u8],
    dir: &DirectoryLayout,
    cache: &[u8],
    local_symbols: Option<&[u8]>,
    page_size: usize,
    slot_count: usize,
    first_slot: usize,
    end_slot: usize,
) {
    debug_assert!(end_slot <= slot_count);
    let hash_size = dir.kind.size();
    let slots_base = dir.offset + dir.hash_offset;
    let slots =
        &mut blob[slots_base + first_slot * hash_size..slots_base + end_slot * hash_size];

    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let slots_in_range = end_slot - first_slot;
    let per_thread = slots_in_range.div_ceil(threads.max(1)).max(1);
    std::thread::scope(|scope| {
        for (chunk_index, hash_chunk) in slots.chunks_mut(per_thread * hash_size).enumerate() {
            let chunk_first = first_slot + chunk_index * per_thread;
            let kind = dir.kind;
            scope.spawn(move || {
                for (i, out) in hash_chunk.chunks_mut(hash_size).enumerate() {
                    let slot = chunk_first + i;
                    let page = page_bytes(cache, local_symbols, page_size, slot);
                    if page.len() == page_size {
                        kind.digest(page, out);
                    } else {
                        // Final partial page: hash padded content.
                        let mut padded = vec![0u8; page_size];
                        padded[..page.len()].copy_from_slice(page);
                        kind.digest(&padded, out);
                    }
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get32_be(bytes: &[u8], offset: usize) -> u32 {
        u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    fn sign_small_cache(mode: CodeSigningDigestMode) -> (Vec<u8>, CodeSignature) {
        let mut cache = vec![0u8; 0x8000];
        cache[0x4000] = 0xAB; // some content
        let mut diag = Diagnostics::new(false);
        let sig = code_sign(
            &mut cache,
            None,
            "arm64",
            0x1000,
            0x4000,
            mode,
            true,
            true,
            &mut diag,
        )
        .unwrap();
        (cache, sig)
    }

    #[test]
    fn superblob_structure() {
        let (_, sig) = sign_small_cache(CodeSigningDigestMode::Sha256Only);
        assert_eq!(get32_be(&sig.blob, 0), CSMAGIC_EMBEDDED_SIGNATURE);
        assert_eq!(get32_be(&sig.blob, 8), 3); // CD + requirements + CMS
        let cd_offset = get32_be(&sig.blob, 16) as usize;
        assert_eq!(get32_be(&sig.blob, cd_offset), CSMAGIC_CODEDIRECTORY);
        assert_eq!(get32_be(&sig.blob, cd_offset + 8), 0x20400);
        assert_eq!(get32_be(&sig.blob, cd_offset + 12), CS_ADHOC);
        assert_eq!(get32_be(&sig.blob, cd_offset + 28), 8); // 0x8000 / 0x1000
        // identifier
        let ident_offset = cd_offset + get32_be(&sig.blob, cd_offset + 20) as usize;
        assert_eq!(
            &sig.blob[ident_offset..ident_offset + 35],
            b"com.apple.dyld.cache.arm64.release\0"
        );
    }

    #[test]
    fn page_hashes_match_recomputation() {
        let (cache, sig) = sign_small_cache(CodeSigningDigestMode::Sha256Only);
        let cd_offset = get32_be(&sig.blob, 16) as usize;
        let hash_offset = get32_be(&sig.blob, cd_offset + 16) as usize;
        for page in 0..8 {
            let mut expected = [0u8; 32];
            HashKind::Sha256.digest(&cache[page * 0x1000..(page + 1) * 0x1000], &mut expected);
            let slot = cd_offset + hash_offset + page * 32;
            assert_eq!(&sig.blob[slot..slot + 32], &expected, "page {}", page);
        }
    }

    #[test]
    fn uuid_fixed_point() {
        // The UUID must match a recomputation from a zero-UUID copy of the
        // directory, and page 0's hash must cover the final header.
        let (cache, sig) = sign_small_cache(CodeSigningDigestMode::Sha256Only);
        let uuid = &cache[CacheHeader::UUID_OFFSET..CacheHeader::UUID_OFFSET + 16];
        assert_ne!(uuid, &[0u8; 16]);
        assert_eq!(uuid[6] >> 4, 3); // RFC 4122 version bits
        assert_eq!(uuid[8] & 0xC0, 0x80);

        let cd_offset = get32_be(&sig.blob, 16) as usize;
        let hash_offset = get32_be(&sig.blob, cd_offset + 16) as usize;
        let mut expected = [0u8; 32];
        HashKind::Sha256.digest(&cache[0..0x1000], &mut expected);
        assert_eq!(
            &sig.blob[cd_offset + hash_offset..cd_offset + hash_offset + 32],
            &expected
        );
    }

    #[test]
    fn agile_mode_has_two_directories() {
        let (_, sig) = sign_small_cache(CodeSigningDigestMode::Agile);
        assert_eq!(get32_be(&sig.blob, 8), 4);
        let cd_offset = get32_be(&sig.blob, 16) as usize;
        assert_eq!(sig.blob[cd_offset + 37], CS_HASHTYPE_SHA1);
        // Alternate directory is SHA-256.
        assert_eq!(get32_be(&sig.blob, 36), CSSLOT_ALTERNATE_CODEDIRECTORIES);
        let alt_offset = get32_be(&sig.blob, 40) as usize;
        assert_eq!(get32_be(&sig.blob, alt_offset), CSMAGIC_CODEDIRECTORY);
        assert_eq!(sig.blob[alt_offset + 37], CS_HASHTYPE_SHA256);
    }

    #[test]
    fn local_symbols_are_covered() {
        let mut cache = vec![0u8; 0x4000];
        let locals = vec![0x55u8; 0x1800];
        let mut diag = Diagnostics::new(false);
        let sig = code_sign(
            &mut cache,
            Some(&locals),
            "x86_64",
            0x1000,
            0x4000,
            CodeSigningDigestMode::Sha256Only,
            false,
            false,
            &mut diag,
        )
        .unwrap();
        let cd_offset = get32_be(&sig.blob, 16) as usize;
        // 4 cache pages + 2 locals pages (the last one partial).
        assert_eq!(get32_be(&sig.blob, cd_offset + 28), 6);
        assert_eq!(get32_be(&sig.blob, cd_offset + 32), 0x4000 + 0x1800);
        // No mastering suffix.
        let ident_offset = cd_offset + get32_be(&sig.blob, cd_offset + 20) as usize;
        assert_eq!(
            &sig.blob[ident_offset..ident_offset + 27],
            b"com.apple.dyld.cache.x86_64"
        );
        assert_eq!(sig.blob[ident_offset + 27], 0);
    }
}
