/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Per-architecture layout constants.
//!
//! Everything address-shaped about a cache is decided here: where the regions
//! live, how far they may grow, which slide-info format the loader expects,
//! and how code-signing pages are sized. The rest of the builder treats this
//! as opaque configuration.

/// Which slide-info encoding the architecture's loader consumes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlideInfoVersion {
    /// Legacy 32-bit bitmap + toc.
    V1,
    /// 64-bit delta-mask chains (also i386 with value-add).
    V2,
    /// arm64e chained pointers with authentication bits.
    V3,
    /// 32-bit delta-mask chains for armv7k / arm64_32.
    V4,
}

#[derive(Debug)]
pub struct ArchLayout {
    pub name: &'static str,
    /// Unslid address of the text region (and of the whole cache).
    pub shared_memory_start: u64,
    pub shared_memory_size: u64,
    /// Explicit region bases when the architecture mandates discontiguous
    /// address ranges, otherwise text/data/read-only are packed with
    /// `shared_region_padding` between them.
    pub discontiguous: Option<DiscontiguousLayout>,
    pub shared_region_padding: u64,
    /// High bits of a pointer reused as the chain stride in slide-info v2/v4.
    pub pointer_delta_mask: u64,
    pub shared_region_align_p2: u8,
    pub slide_info_version: SlideInfoVersion,
    pub slide_info_bytes_per_page: u32,
    /// Code-signature page size (4 KiB or 16 KiB).
    pub cs_page_size: u32,
    pub is64: bool,
    /// v2/v4 store `pointer - shared_memory_start` instead of the raw value.
    pub use_value_add: bool,
    /// Pointer authentication: splits data into `__AUTH*` regions and selects
    /// slide-info v3.
    pub supports_auth_pointers: bool,
}

#[derive(Debug)]
pub struct DiscontiguousLayout {
    pub rw_start: u64,
    pub ro_start: u64,
    pub rx_max_size: u64,
    pub rw_max_size: u64,
    pub ro_max_size: u64,
}

pub const CS_PAGE_SIZE_4K: u32 = 0x1000;
pub const CS_PAGE_SIZE_16K: u32 = 0x4000;

const ARM64_DISCONTIGUOUS: DiscontiguousLayout = DiscontiguousLayout {
    rw_start: 0x1_C000_0000,
    ro_start: 0x2_0000_0000,
    rx_max_size: 0x4000_0000,
    rw_max_size: 0x4000_0000,
    ro_max_size: 0x3FE0_0000,
};

const X86_64_DISCONTIGUOUS: DiscontiguousLayout = DiscontiguousLayout {
    rw_start: 0x7FFF_8000_0000,
    ro_start: 0x7FFF_C000_0000,
    rx_max_size: 0x6000_0000,
    rw_max_size: 0x4000_0000,
    ro_max_size: 0x3FE0_0000,
};

static ARCH_LAYOUTS: &[ArchLayout] = &[
    ArchLayout {
        name: "x86_64",
        shared_memory_start: 0x7FFF_2000_0000,
        shared_memory_size: 0xEFE0_0000,
        discontiguous: Some(X86_64_DISCONTIGUOUS),
        shared_region_padding: 0x4000_0000,
        pointer_delta_mask: 0x00FF_FF00_0000_0000,
        shared_region_align_p2: 14,
        slide_info_version: SlideInfoVersion::V2,
        slide_info_bytes_per_page: 2,
        cs_page_size: CS_PAGE_SIZE_4K,
        is64: true,
        use_value_add: true,
        supports_auth_pointers: false,
    },
    ArchLayout {
        name: "x86_64h",
        shared_memory_start: 0x7FFF_2000_0000,
        shared_memory_size: 0xEFE0_0000,
        discontiguous: Some(X86_64_DISCONTIGUOUS),
        shared_region_padding: 0x4000_0000,
        pointer_delta_mask: 0x00FF_FF00_0000_0000,
        shared_region_align_p2: 14,
        slide_info_version: SlideInfoVersion::V2,
        slide_info_bytes_per_page: 2,
        cs_page_size: CS_PAGE_SIZE_4K,
        is64: true,
        use_value_add: true,
        supports_auth_pointers: false,
    },
    ArchLayout {
        name: "arm64",
        shared_memory_start: 0x1_8000_0000,
        shared_memory_size: 0x1_0000_0000,
        discontiguous: Some(ARM64_DISCONTIGUOUS),
        shared_region_padding: 0x0200_0000,
        pointer_delta_mask: 0x00FF_FF00_0000_0000,
        shared_region_align_p2: 14,
        slide_info_version: SlideInfoVersion::V2,
        slide_info_bytes_per_page: 2,
        cs_page_size: CS_PAGE_SIZE_4K,
        is64: true,
        use_value_add: false,
        supports_auth_pointers: false,
    },
    ArchLayout {
        name: "arm64e",
        shared_memory_start: 0x1_8000_0000,
        shared_memory_size: 0x1_0000_0000,
        discontiguous: Some(ARM64_DISCONTIGUOUS),
        shared_region_padding: 0x0200_0000,
        pointer_delta_mask: 0x00FF_FF00_0000_0000,
        shared_region_align_p2: 14,
        slide_info_version: SlideInfoVersion::V3,
        slide_info_bytes_per_page: 2,
        cs_page_size: CS_PAGE_SIZE_16K,
        is64: true,
        use_value_add: false,
        supports_auth_pointers: true,
    },
    ArchLayout {
        name: "arm64_32",
        shared_memory_start: 0x1A00_0000,
        shared_memory_size: 0x2600_0000,
        discontiguous: None,
        shared_region_padding: 0x0200_0000,
        pointer_delta_mask: 0xC000_0000,
        shared_region_align_p2: 14,
        slide_info_version: SlideInfoVersion::V4,
        slide_info_bytes_per_page: 6,
        cs_page_size: CS_PAGE_SIZE_16K,
        is64: false,
        use_value_add: false,
        supports_auth_pointers: false,
    },
    ArchLayout {
        name: "armv7s",
        shared_memory_start: 0x1A00_0000,
        shared_memory_size: 0x2600_0000,
        discontiguous: None,
        shared_region_padding: 0x0200_0000,
        pointer_delta_mask: 0xE000_0000,
        shared_region_align_p2: 14,
        slide_info_version: SlideInfoVersion::V1,
        slide_info_bytes_per_page: 4,
        cs_page_size: CS_PAGE_SIZE_4K,
        is64: false,
        use_value_add: false,
        supports_auth_pointers: false,
    },
    ArchLayout {
        name: "armv7k",
        shared_memory_start: 0x1A00_0000,
        shared_memory_size: 0x2600_0000,
        discontiguous: None,
        shared_region_padding: 0x0040_0000,
        pointer_delta_mask: 0xC000_0000,
        shared_region_align_p2: 14,
        slide_info_version: SlideInfoVersion::V4,
        slide_info_bytes_per_page: 4,
        cs_page_size: CS_PAGE_SIZE_4K,
        is64: false,
        use_value_add: true,
        supports_auth_pointers: false,
    },
];

/// Look up the layout for an architecture name, e.g. `"arm64e"`.
pub fn layout_for_arch(name: &str) -> Option<&'static ArchLayout> {
    ARCH_LAYOUTS.iter().find(|l| l.name == name)
}

impl ArchLayout {
    /// Pointer size of the target, in bytes.
    pub fn pointer_size(&self) -> u64 {
        if self.is64 {
            8
        } else {
            4
        }
    }

    /// Mapping page size used for slide-info accounting.
    pub fn page_size(&self) -> u32 {
        0x1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_arches_resolve() {
        for name in ["x86_64", "arm64", "arm64e", "armv7k", "arm64_32"] {
            assert!(layout_for_arch(name).is_some(), "{}", name);
        }
        assert!(layout_for_arch("ppc").is_none());
    }

    #[test]
    fn arm64_regions_are_discontiguous() {
        let arm64 = layout_for_arch("arm64").unwrap();
        let disc = arm64.discontiguous.as_ref().unwrap();
        assert_eq!(arm64.shared_memory_start, 0x1_8000_0000);
        assert_eq!(disc.rw_start, 0x1_C000_0000);
        assert_eq!(disc.ro_start, 0x2_0000_0000);
    }

    #[test]
    fn auth_implies_v3() {
        for layout in super::ARCH_LAYOUTS {
            if layout.supports_auth_pointers {
                assert_eq!(layout.slide_info_version, SlideInfoVersion::V3);
            }
        }
    }
}
