/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Input selection: which binaries make it into the cache.
//!
//! Loading classifies each path as a cacheable dylib, an "other" dylib or
//! bundle (kept around for closure building), an executable, or unloadable.
//! After loading, the set is closed under dependencies: any dylib whose
//! non-weak dependency fell outside the set is demoted too, iterating to a
//! fixpoint. When a planned layout overflows, leaves of the dependency graph
//! are evicted until it fits.

use crate::diagnostics::Diagnostics;
use crate::fs::FileSystem;
use crate::mach_o::{FileKind, MachO};
use std::collections::{HashMap, HashSet};

/// One input path with its inclusion requirement.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub path: String,
    pub must_be_included: bool,
}

pub struct LoadResults {
    pub cacheable: Vec<MachO>,
    pub other_dylibs: Vec<MachO>,
    pub executables: Vec<MachO>,
    /// (path, reason) for everything that could not be loaded or was
    /// excluded.
    pub rejected: Vec<(String, String)>,
    pub must_be_included: HashSet<String>,
}

/// Would this dylib ever be eligible for the cache?
fn cache_eligibility(macho: &MachO, platform: u8) -> Result<(), String> {
    if macho.kind != FileKind::Dylib {
        return Err("not a dylib".to_string());
    }
    if !macho.install_name.starts_with('/') {
        return Err(format!(
            "install name {:?} is not an absolute path",
            macho.install_name
        ));
    }
    // Not part of the OS proper on embedded platforms.
    if platform != 1 && macho.install_name.starts_with("/usr/local/") {
        return Err("/usr/local/ dylibs are never cached".to_string());
    }
    if macho.section("__DATA", "__interpose").is_some()
        || macho.section("__DATA_CONST", "__interpose").is_some()
    {
        return Err("dylib uses interposing".to_string());
    }
    if !macho.has_split_seg_v2() && !macho.has_chained_fixups() {
        return Err("no split-seg info or chained fixups".to_string());
    }
    Ok(())
}

/// Map each input, classify it, and filter out ineligible or duplicate
/// dylibs.
pub fn load(
    files: &[InputFile],
    fs: &FileSystem,
    arch_name: &str,
    platform: u8,
    diag: &mut Diagnostics,
) -> LoadResults {
    let mut results = LoadResults {
        cacheable: Vec::new(),
        other_dylibs: Vec::new(),
        executables: Vec::new(),
        rejected: Vec::new(),
        must_be_included: HashSet::new(),
    };

    // install name -> index into cacheable, for duplicate resolution
    let mut by_install_name: HashMap<String, usize> = HashMap::new();

    for file in files {
        let loaded = fs.load_file(&file.path).and_then(|info| {
            MachO::parse(&file.path, info.bytes, arch_name, info.mtime, info.inode)
        });
        let macho = match loaded {
            Ok(macho) => macho,
            Err(reason) => {
                if file.must_be_included {
                    diag.error(format!("required file {}: {}", file.path, reason));
                } else {
                    results.rejected.push((file.path.clone(), reason));
                }
                continue;
            }
        };

        match macho.kind {
            FileKind::Executable => {
                results.executables.push(macho);
                continue;
            }
            FileKind::Bundle => {
                results.other_dylibs.push(macho);
                continue;
            }
            FileKind::Dylib => (),
        }

        if let Err(reason) = cache_eligibility(&macho, platform) {
            if file.must_be_included {
                diag.error(format!("required dylib {}: {}", file.path, reason));
            } else {
                diag.warning(format!("{}: {}", file.path, reason));
                results.other_dylibs.push(macho);
            }
            continue;
        }

        if file.must_be_included {
            results.must_be_included.insert(macho.install_name.clone());
        }

        match by_install_name.get(&macho.install_name) {
            None => {
                by_install_name.insert(macho.install_name.clone(), results.cacheable.len());
                results.cacheable.push(macho);
            }
            Some(&existing_index) => {
                // Keep the copy whose on-disk path is its install name.
                let existing = &results.cacheable[existing_index];
                let existing_is_real = existing.path == existing.install_name;
                let new_is_real = macho.path == macho.install_name;
                if new_is_real && !existing_is_real {
                    let old =
                        std::mem::replace(&mut results.cacheable[existing_index], macho);
                    results
                        .rejected
                        .push((old.path.clone(), "duplicate install name".to_string()));
                } else {
                    results
                        .rejected
                        .push((macho.path.clone(), "duplicate install name".to_string()));
                }
            }
        }
    }

    results
}

/// Demote any cacheable dylib with a non-weak dependency outside the set,
/// iterating until stable. Returns the demoted dylibs with reasons.
pub fn verify_self_contained(
    cacheable: &mut Vec<MachO>,
    other_dylibs: &mut Vec<MachO>,
    fs: &FileSystem,
    must_be_included: &HashSet<String>,
    diag: &mut Diagnostics,
) -> Vec<(String, String)> {
    let mut demoted: Vec<(String, String)> = Vec::new();
    loop {
        let names: HashSet<String> = cacheable
            .iter()
            .map(|m| m.install_name.clone())
            .collect();
        let mut bad_index: Option<(usize, String)> = None;
        'outer: for (index, macho) in cacheable.iter().enumerate() {
            for dep in &macho.dependencies {
                if dep.weak {
                    continue;
                }
                let resolved = fs.resolve_path(&dep.path);
                if names.contains(&dep.path) || names.contains(resolved) {
                    continue;
                }
                bad_index = Some((
                    index,
                    format!("required dylib {} is not in the cache", dep.path),
                ));
                break 'outer;
            }
        }
        let Some((index, reason)) = bad_index else {
            break;
        };
        let macho = cacheable.remove(index);
        if must_be_included.contains(&macho.install_name) {
            diag.error(format!("required dylib {}: {}", macho.install_name, reason));
        } else {
            diag.warning(format!("{}: {}", macho.install_name, reason));
        }
        demoted.push((macho.install_name.clone(), reason));
        other_dylibs.push(macho);
    }
    demoted
}

fn dylib_vm_size(macho: &MachO) -> u64 {
    macho.segments.iter().map(|s| s.vmsize).sum()
}

/// Pick un-depended-on dylibs to evict until at least `bytes_to_free` bytes
/// of mapped size are gone. Eviction order: lowest priority in the order
/// file first; unordered dylibs before ordered ones, largest first. Returns
/// the install names to remove; the caller drops them (and any state keyed
/// on them).
pub fn select_leaf_evictions(
    cacheable: &[MachO],
    bytes_to_free: u64,
    sort_order: &HashMap<String, usize>,
    must_be_included: &HashSet<String>,
) -> Vec<String> {
    let mut evicted: Vec<String> = Vec::new();
    let mut freed: u64 = 0;
    let mut remaining: Vec<&MachO> = cacheable.iter().collect();
    while freed < bytes_to_free {
        // Rebuild the reverse dependency count each round; the graph is
        // small and eviction changes it.
        let names: HashSet<&str> = remaining.iter().map(|m| m.install_name.as_str()).collect();
        let mut dependent_count: HashMap<&str, usize> =
            names.iter().map(|&n| (n, 0)).collect();
        for macho in &remaining {
            for dep in &macho.dependencies {
                if dep.path == macho.install_name {
                    continue;
                }
                if let Some(count) = dependent_count.get_mut(dep.path.as_str()) {
                    *count += 1;
                }
            }
        }

        let victim = remaining
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                dependent_count[m.install_name.as_str()] == 0
                    && !must_be_included.contains(&m.install_name)
            })
            .max_by(|(_, a), (_, b)| {
                // Higher order-file rank = lower priority = evict first;
                // dylibs absent from the order file go before anything in
                // it, largest first.
                let rank_a = sort_order.get(&a.install_name).copied().unwrap_or(usize::MAX);
                let rank_b = sort_order.get(&b.install_name).copied().unwrap_or(usize::MAX);
                rank_a
                    .cmp(&rank_b)
                    .then_with(|| dylib_vm_size(a).cmp(&dylib_vm_size(b)))
                    .then_with(|| b.install_name.cmp(&a.install_name))
            })
            .map(|(index, _)| index);

        let Some(index) = victim else {
            break; // nothing left that can legally go
        };
        let macho = remaining.remove(index);
        freed += dylib_vm_size(macho);
        evicted.push(macho.install_name.clone());
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_o::{Dependency, FileKind, Segment};

    fn dylib(install_name: &str, vmsize: u64, deps: &[(&str, bool)]) -> MachO {
        MachO {
            path: install_name.to_string(),
            install_name: install_name.to_string(),
            kind: FileKind::Dylib,
            uuid: [0; 16],
            is64: true,
            header_flags: 0,
            ncmds: 0,
            sizeofcmds: 0,
            segments: vec![Segment {
                name: "__TEXT".to_string(),
                vmaddr: 0,
                vmsize,
                file_offset: 0,
                file_size: vmsize,
                max_prot: 5,
                init_prot: 5,
                index: 0,
                sections: Vec::new(),
            }],
            dependencies: deps
                .iter()
                .map(|&(path, weak)| Dependency {
                    path: path.to_string(),
                    weak,
                    upward: false,
                    reexport: false,
                })
                .collect(),
            symtab: Default::default(),
            dysymtab: Default::default(),
            dyld_info: Default::default(),
            exports_trie_cmd: None,
            chained_fixups_cmd: None,
            split_seg_info: None,
            function_starts: Default::default(),
            data_in_code: Default::default(),
            mtime: 0,
            inode: 1,
            bytes: Vec::new(),
        }
    }

    #[test]
    fn self_containment_demotes_transitively() {
        // c -> b -> a -> missing
        let mut cacheable = vec![
            dylib("/a.dylib", 0x1000, &[("/missing.dylib", false)]),
            dylib("/b.dylib", 0x1000, &[("/a.dylib", false)]),
            dylib("/c.dylib", 0x1000, &[("/b.dylib", false)]),
            dylib("/d.dylib", 0x1000, &[("/missing.dylib", true)]),
        ];
        let mut others = Vec::new();
        let fs = FileSystem::new();
        let mut diag = Diagnostics::new(false);
        let demoted = verify_self_contained(
            &mut cacheable,
            &mut others,
            &fs,
            &HashSet::new(),
            &mut diag,
        );
        assert_eq!(demoted.len(), 3);
        assert_eq!(cacheable.len(), 1);
        // The weak dependency survives.
        assert_eq!(cacheable[0].install_name, "/d.dylib");
        assert!(!diag.has_error());
        assert_eq!(diag.warnings().len(), 3);
    }

    #[test]
    fn eviction_prefers_low_priority_leaves() {
        let cacheable = vec![
            dylib("/base.dylib", 0x10000, &[]),
            dylib("/mid.dylib", 0x4000, &[("/base.dylib", false)]),
            dylib("/leaf_hot.dylib", 0x4000, &[("/mid.dylib", false)]),
            dylib("/leaf_cold.dylib", 0x4000, &[("/mid.dylib", false)]),
        ];
        let mut order = HashMap::new();
        order.insert("/leaf_hot.dylib".to_string(), 0);
        order.insert("/leaf_cold.dylib".to_string(), 5);
        order.insert("/mid.dylib".to_string(), 1);
        order.insert("/base.dylib".to_string(), 2);

        let evicted = select_leaf_evictions(&cacheable, 0x1000, &order, &HashSet::new());
        // Both leaves qualify; cold has the worse rank.
        assert_eq!(evicted, vec!["/leaf_cold.dylib".to_string()]);
    }

    #[test]
    fn eviction_cascades_to_new_leaves() {
        let cacheable = vec![
            dylib("/base.dylib", 0x1000, &[]),
            dylib("/leaf.dylib", 0x1000, &[("/base.dylib", false)]),
        ];
        let evicted =
            select_leaf_evictions(&cacheable, 0x2000, &HashMap::new(), &HashSet::new());
        // Evicting the leaf makes base a leaf too.
        assert_eq!(
            evicted,
            vec!["/leaf.dylib".to_string(), "/base.dylib".to_string()]
        );
    }

    #[test]
    fn must_be_included_is_never_evicted() {
        let cacheable = vec![dylib("/pinned.dylib", 0x1000, &[])];
        let mut pinned = HashSet::new();
        pinned.insert("/pinned.dylib".to_string());
        let evicted = select_leaf_evictions(&cacheable, 0x4000, &HashMap::new(), &pinned);
        assert!(evicted.is_empty());
    }
}
