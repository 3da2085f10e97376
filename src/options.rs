/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Options controlling a cache build.
//!
//! These come either from the CLI's JSON manifest or from direct API use. The
//! order files use one install name per line, top line = highest priority;
//! `#` starts a comment.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};

/// Who the produced cache is for. Affects the code-signing identifier and the
/// JSON map file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    Customer,
    InternalDevelopment,
    InternalMinDevelopment,
}

impl Disposition {
    pub fn from_name(name: &str) -> Result<Disposition, String> {
        match name {
            "customer" => Ok(Disposition::Customer),
            "internal-development" => Ok(Disposition::InternalDevelopment),
            "internal-min-development" => Ok(Disposition::InternalMinDevelopment),
            _ => Err(format!("Unrecognized disposition {:?}", name)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Disposition::Customer => "customer",
            Disposition::InternalDevelopment => "internal-development",
            Disposition::InternalMinDevelopment => "internal-min-development",
        }
    }
}

/// Digest selection for the embedded code signature.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodeSigningDigestMode {
    Sha256Only,
    /// Both a SHA-1 and a SHA-256 code directory, for loaders that only
    /// understand the former.
    Agile,
}

/// Struct containing all caller-configurable options for one build.
pub struct CreateOptions {
    /// Architecture name, e.g. `"arm64e"`. Must resolve via
    /// [crate::arch::layout_for_arch].
    pub arch: String,
    /// Platform identifier recorded in the cache header (1 = macOS,
    /// 2 = iOS, ...).
    pub platform: u8,
    pub disposition: Disposition,
    /// Install names in priority order; dylibs not listed sort after listed
    /// ones, lexicographically.
    pub dylib_order: Vec<String>,
    /// Install names whose data should pack first in the writable region.
    pub dirty_data_order: Vec<String>,
    /// Parsed optimizer configuration: classes to give IMP caches, and
    /// selectors to inline into subclass caches.
    pub objc_optimizations: ObjcOptimizations,
    pub code_signing_digest_mode: CodeSigningDigestMode,
    /// Demote overflowing leaf dylibs instead of failing the build.
    pub evict_leaf_dylibs_on_overflow: bool,
    /// Move local symbols to an unmapped region appended after the cache.
    pub exclude_local_symbols: bool,
    pub optimize_for_size: bool,
    pub is_locally_built_cache: bool,
    pub dylibs_removed_from_disk: bool,
    pub cache_supports_aslr: bool,
    pub verbose: bool,
}

impl Default for CreateOptions {
    fn default() -> CreateOptions {
        CreateOptions {
            arch: "arm64".to_string(),
            platform: 2,
            disposition: Disposition::Customer,
            dylib_order: Vec::new(),
            dirty_data_order: Vec::new(),
            objc_optimizations: ObjcOptimizations::default(),
            code_signing_digest_mode: CodeSigningDigestMode::Sha256Only,
            evict_leaf_dylibs_on_overflow: true,
            exclude_local_symbols: false,
            optimize_for_size: false,
            is_locally_built_cache: false,
            dylibs_removed_from_disk: true,
            cache_supports_aslr: true,
            verbose: false,
        }
    }
}

impl CreateOptions {
    /// Priority map derived from an order file: install name -> rank.
    pub fn dylib_sort_order(&self) -> HashMap<String, usize> {
        order_map(&self.dylib_order)
    }

    pub fn dirty_data_sort_order(&self) -> HashMap<String, usize> {
        order_map(&self.dirty_data_order)
    }
}

fn order_map(order: &[String]) -> HashMap<String, usize> {
    order
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), i))
        .collect()
}

/// Parse an order file: one install name per line, `#` comments, blank lines
/// ignored.
pub fn parse_order_file<F: Read>(file: F) -> Result<Vec<String>, String> {
    let file = BufReader::new(file);
    let mut order = Vec::new();
    for (line_no, line) in BufRead::lines(file).enumerate() {
        let line = line.map_err(|e| format!("Error reading line {}: {}", line_no + 1, e))?;
        let line = line.split('#').next().unwrap().trim();
        if line.is_empty() {
            continue;
        }
        order.push(line.to_string());
    }
    Ok(order)
}

/// The IMP-cache side of the optimizer configuration JSON:
/// which classes (and metaclasses) get caches, and which selectors may be
/// inlined into subclass caches.
#[derive(Default)]
pub struct ObjcOptimizations {
    /// Class names that should receive an IMP cache, with their priority
    /// order (index = importance).
    pub needed_classes: HashMap<String, usize>,
    /// Metaclass names that should receive an IMP cache.
    pub needed_metaclasses: HashMap<String, usize>,
    /// Selectors to inline into every child cache.
    pub inlined_selectors: Vec<String>,
    /// Class names acting as flattening roots: their subclasses inline the
    /// whole superclass hierarchy.
    pub flattening_roots: Vec<String>,
    /// Tag value or'd into coalesced CF-constant isa pointers. Platform
    /// constant, not derived.
    pub cf_isa_tag: u64,
}

impl ObjcOptimizations {
    /// Parse the optimizer configuration JSON. The format is a single object:
    ///
    /// ```json
    /// {
    ///     "version": 1,
    ///     "neededClasses": ["NSObject", ...],
    ///     "neededMetaclasses": ["NSObject", ...],
    ///     "selectorsToInline": ["alloc", ...],
    ///     "flatteningRoots": ["NSObject", ...]
    /// }
    /// ```
    pub fn from_json(bytes: &[u8]) -> Result<ObjcOptimizations, String> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Config {
            #[serde(default)]
            version: u32,
            #[serde(default)]
            needed_classes: Vec<String>,
            #[serde(default)]
            needed_metaclasses: Vec<String>,
            #[serde(default)]
            selectors_to_inline: Vec<String>,
            #[serde(default)]
            flattening_roots: Vec<String>,
        }

        let config: Config = serde_json::from_slice(bytes)
            .map_err(|e| format!("Bad optimizer configuration: {}", e))?;
        if config.version > 1 {
            return Err(format!(
                "Unsupported optimizer configuration version {}",
                config.version
            ));
        }
        Ok(ObjcOptimizations {
            needed_classes: order_map(&config.needed_classes),
            needed_metaclasses: order_map(&config.needed_metaclasses),
            inlined_selectors: config.selectors_to_inline,
            flattening_roots: config.flattening_roots,
            cf_isa_tag: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_file_parsing() {
        let text = "/usr/lib/libSystem.B.dylib\n# comment\n\n/usr/lib/libc++.1.dylib # tail\n";
        let order = parse_order_file(text.as_bytes()).unwrap();
        assert_eq!(
            order,
            vec![
                "/usr/lib/libSystem.B.dylib".to_string(),
                "/usr/lib/libc++.1.dylib".to_string()
            ]
        );
    }

    #[test]
    fn optimizer_config_parsing() {
        let json = br#"{
            "version": 1,
            "neededClasses": ["NSString", "NSArray"],
            "selectorsToInline": ["alloc"]
        }"#;
        let config = ObjcOptimizations::from_json(json).unwrap();
        assert_eq!(config.needed_classes.get("NSString"), Some(&0));
        assert_eq!(config.needed_classes.get("NSArray"), Some(&1));
        assert!(config.needed_metaclasses.is_empty());
        assert_eq!(config.inlined_selectors, vec!["alloc".to_string()]);
    }
}
