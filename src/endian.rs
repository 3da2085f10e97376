/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Little-endian load/store helpers.
//!
//! Every integer in the cache file and in the input binaries is
//! little-endian; big-endian Mach-O died with PowerPC. Offsets are `usize`
//! into plain byte slices, so all access is bounds-checked.

pub fn get16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

pub fn get32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

pub fn get64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

pub fn set16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn set32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn set64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Read a NUL-terminated string starting at `offset`.
pub fn cstr(bytes: &[u8], offset: usize) -> Result<&str, String> {
    let tail = bytes
        .get(offset..)
        .ok_or_else(|| format!("string offset {:#x} out of range", offset))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| format!("unterminated string at {:#x}", offset))?;
    std::str::from_utf8(&tail[..len]).map_err(|_| format!("non-UTF-8 string at {:#x}", offset))
}

/// Read a uleb128, advancing `offset`. Errors on truncation or a value that
/// does not fit in 64 bits.
pub fn read_uleb128(bytes: &[u8], offset: &mut usize) -> Result<u64, String> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*offset)
            .ok_or_else(|| "truncated uleb128".to_string())?;
        *offset += 1;
        if shift >= 64 || (shift == 63 && (byte & 0x7E) != 0) {
            return Err("uleb128 too large".to_string());
        }
        result |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Read a sleb128, advancing `offset`.
pub fn read_sleb128(bytes: &[u8], offset: &mut usize) -> Result<i64, String> {
    let mut result: i64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*offset)
            .ok_or_else(|| "truncated sleb128".to_string())?;
        *offset += 1;
        result |= i64::from(byte & 0x7F) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && (byte & 0x40) != 0 {
                result |= -1i64 << shift;
            }
            return Ok(result);
        }
        if shift >= 64 {
            return Err("sleb128 too large".to_string());
        }
    }
}

/// Append a uleb128 encoding of `value`.
pub fn append_uleb128(out: &mut Vec<u8>, mut value: u64) {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_ints() {
        let mut buf = [0u8; 8];
        set32(&mut buf, 0, 0xDEAD_BEEF);
        assert_eq!(get32(&buf, 0), 0xDEAD_BEEF);
        set64(&mut buf, 0, 0x0123_4567_89AB_CDEF);
        assert_eq!(get64(&buf, 0), 0x0123_4567_89AB_CDEF);
        assert_eq!(get16(&buf, 0), 0xCDEF);
    }

    #[test]
    fn uleb_roundtrip() {
        for value in [0u64, 1, 127, 128, 0x3FFF, 0x4000, u64::MAX] {
            let mut buf = Vec::new();
            append_uleb128(&mut buf, value);
            let mut offset = 0;
            assert_eq!(read_uleb128(&buf, &mut offset).unwrap(), value);
            assert_eq!(offset, buf.len());
        }
    }

    #[test]
    fn sleb_negative() {
        // -1 encodes as a single 0x7F byte
        let mut offset = 0;
        assert_eq!(read_sleb128(&[0x7F], &mut offset).unwrap(), -1);
    }

    #[test]
    fn truncated_uleb_is_an_error() {
        let mut offset = 0;
        assert!(read_uleb128(&[0x80], &mut offset).is_err());
    }
}
