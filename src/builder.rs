/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The shared-cache builder: drives the pipeline from input filtering to the
//! signed file.
//!
//! Stages run strictly in order; a fatal diagnostic poisons the builder and
//! every later stage becomes a no-op, so the caller always reads the first
//! error. The layout stage loops: if a region overflows its window, leaf
//! dylibs are evicted and planning restarts (preserving the selector
//! addresses already chosen).

use crate::adjust::{AdjustedLinkedit, Adjustor};
use crate::arch::{layout_for_arch, ArchLayout};
use crate::aslr::AslrTracker;
use crate::cache_format::{
    align, CacheHeader, ImageInfo, ImagePatches, ImageTextInfo, MappingInfo,
    MappingWithSlideInfo, PatchExport, PatchInfo, PatchLocation, HEADER_SIZE,
    IMAGE_INFO_SIZE, IMAGE_PATCHES_SIZE, IMAGE_TEXT_INFO_SIZE, MAPPING_INFO_SIZE,
    MAPPING_WITH_SLIDE_INFO_SIZE, PATCH_EXPORT_SIZE, PATCH_INFO_SIZE, PATCH_LOCATION_SIZE,
};
use crate::coalesce::{CacheCoalescedText, DylibTextCoalescer};
use crate::diagnostics::Diagnostics;
use crate::endian::set64;
use crate::fs::FileSystem;
use crate::inputs::{self, InputFile};
use crate::layout::{assign_segment_addresses, CacheLayout, LayoutInput};
use crate::linkedit::optimize_linkedit;
use crate::mach_o::fixups::FixupIndex;
use crate::mach_o::{
    ExportedSymbol, MachO, EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE, EXPORT_SYMBOL_FLAGS_KIND_MASK,
    EXPORT_SYMBOL_FLAGS_REEXPORT,
};
use crate::objc::imp_caches::ImpCachesBuilder;
use crate::objc::metadata::{self, class_name_from_symbol, ClassRef, ObjCMetadata};
use crate::objc::selectors::{HoleMap, MAGIC_SELECTOR};
use crate::objc::ClassKey;
use crate::options::{CreateOptions, Disposition};
use crate::trie::{self, TrieEntry};
use std::collections::{BTreeMap, HashMap, HashSet};

const FORMAT_VERSION: u8 = 10;
/// Empty-slot marker in an IMP-cache hash table.
const IMP_CACHE_EMPTY_SLOT: u32 = 0xFFFF_FFFF;

/// Everything loaded and derived for one cacheable dylib.
struct DylibState {
    macho: MachO,
    fixups: FixupIndex,
    metadata: ObjCMetadata,
    coalescer: DylibTextCoalescer,
    exports: Vec<ExportedSymbol>,
}

pub struct CacheFile {
    /// Complete on-disk bytes: regions, local symbols, signature.
    pub bytes: Vec<u8>,
    pub cd_hash: [u8; 20],
}

pub struct BuildResult {
    pub cache: CacheFile,
    pub map_file: String,
    pub json_map: String,
    pub warnings: Vec<String>,
    /// Dylibs dropped to make the cache fit.
    pub evicted: Vec<String>,
    /// Input paths fully contained in the cache, safe to delete from disk.
    pub paths_eligible_for_deletion: Vec<String>,
}

pub struct SharedCacheBuilder {
    options: CreateOptions,
    arch: &'static ArchLayout,
    diagnostics: Diagnostics,
}

impl SharedCacheBuilder {
    pub fn new(options: CreateOptions) -> Result<SharedCacheBuilder, String> {
        let arch = layout_for_arch(&options.arch)
            .ok_or_else(|| format!("unknown architecture {:?}", options.arch))?;
        let verbose = options.verbose;
        Ok(SharedCacheBuilder {
            options,
            arch,
            diagnostics: Diagnostics::new(verbose),
        })
    }

    pub fn error_message(&self) -> Option<&str> {
        self.diagnostics.error_message()
    }

    /// Run the whole pipeline. On failure the primary error string is
    /// returned along with any warnings gathered up to that point.
    pub fn build(
        mut self,
        files: &[InputFile],
        fs: &FileSystem,
    ) -> Result<BuildResult, (String, Vec<String>)> {
        let result = self.build_inner(files, fs);
        match result {
            Some(result) if !self.diagnostics.has_error() => Ok(result),
            _ => {
                let message = self
                    .diagnostics
                    .error_message()
                    .unwrap_or("cache build failed")
                    .to_string();
                Err((message, self.diagnostics.warnings().to_vec()))
            }
        }
    }

    fn build_inner(&mut self, files: &[InputFile], fs: &FileSystem) -> Option<BuildResult> {
        let diag = &mut self.diagnostics;
        let options = &self.options;
        let arch = self.arch;

        // --- C1: load, classify, close under dependencies ---
        let mut load = inputs::load(files, fs, arch.name, options.platform, diag);
        for (path, reason) in &load.rejected {
            diag.warning(format!("{}: {}", path, reason));
        }
        inputs::verify_self_contained(
            &mut load.cacheable,
            &mut load.other_dylibs,
            fs,
            &load.must_be_included,
            diag,
        );
        if diag.has_error() {
            return None;
        }
        if load.cacheable.is_empty() {
            diag.error("no cacheable dylibs");
            return None;
        }

        // Sort by the order file, then by install name.
        let sort_order = options.dylib_sort_order();
        load.cacheable.sort_by(|a, b| {
            let rank_a = sort_order.get(&a.install_name).copied().unwrap_or(usize::MAX);
            let rank_b = sort_order.get(&b.install_name).copied().unwrap_or(usize::MAX);
            rank_a
                .cmp(&rank_b)
                .then_with(|| a.install_name.cmp(&b.install_name))
        });

        // Parse fixups and ObjC metadata; unsupported formats demote.
        let mut dylibs: Vec<DylibState> = Vec::new();
        for macho in load.cacheable {
            let parsed = FixupIndex::build(&macho).and_then(|fixups| {
                let metadata = metadata::parse(&macho, &fixups)?;
                let exports = macho.exported_symbols()?;
                Ok((fixups, metadata, exports))
            });
            match parsed {
                Ok((fixups, metadata, exports)) => dylibs.push(DylibState {
                    macho,
                    fixups,
                    metadata,
                    coalescer: DylibTextCoalescer::default(),
                    exports,
                }),
                Err(reason) => {
                    if load.must_be_included.contains(&macho.install_name) {
                        diag.error(format!("required dylib {}: {}", macho.install_name, reason));
                        return None;
                    }
                    diag.warning(format!("{}: {}", macho.install_name, reason));
                }
            }
        }

        // --- C2: selector placement and IMP caches ---
        let mut imp_builder = ImpCachesBuilder::new();
        populate_imp_caches(&mut imp_builder, &dylibs, options, diag);
        let mut hole_map = HoleMap::new();
        imp_builder.build_perfect_hashes(&mut hole_map, diag);
        if diag.has_error() {
            return None;
        }

        // --- C3 + C4: coalesce text, then plan, evicting on overflow ---
        let mut coalesced = CacheCoalescedText::new();
        let mut evicted: Vec<String> = Vec::new();
        let dirty_order = options.dirty_data_sort_order();
        let mut layout = None;
        let max_retries = dylibs.len() + 1;
        for _retry in 0..max_retries {
            coalesced.clear();
            imp_builder.recompute_low_bits(&mut hole_map);
            for (index, dylib) in dylibs.iter_mut().enumerate() {
                dylib.coalescer = DylibTextCoalescer::default();
                coalesced.parse_coalescable_text(
                    &dylib.macho,
                    &mut dylib.coalescer,
                    &imp_builder.selectors,
                    &mut hole_map,
                );
                if let Err(reason) = coalesced.parse_cf_constants(
                    index,
                    &dylib.macho,
                    &dylib.fixups,
                    &mut dylib.coalescer,
                ) {
                    diag.warning(format!("{}: {}", dylib.macho.install_name, reason));
                }
            }

            let aliases = collect_aliases(&dylibs, fs);
            let objc_counts = objc_counts(&dylibs);
            let inputs: Vec<LayoutInput<'_>> = dylibs
                .iter()
                .map(|d| LayoutInput {
                    macho: &d.macho,
                    coalescer: &d.coalescer,
                    segment_has_auth: d.fixups.segment_has_auth.clone(),
                    supports_const_data: !d.metadata.has_pointer_based_method_lists,
                })
                .collect();
            let plan = assign_segment_addresses(
                &inputs,
                arch,
                &mut coalesced,
                hole_map.end_address() as u64,
                imp_builder.total_imp_caches_size(),
                objc_counts,
                &dirty_order,
                &aliases,
            );
            let overflow = plan.cache_overflow_amount(arch);
            if overflow == 0 {
                layout = Some(plan);
                break;
            }
            if !options.evict_leaf_dylibs_on_overflow {
                diag.error(format!(
                    "cache overflow by {}MB",
                    overflow.div_ceil(0x10_0000)
                ));
                return None;
            }
            let shallow: Vec<MachO> = dylibs.iter().map(|d| d.macho.clone_shallow()).collect();
            let victims = inputs::select_leaf_evictions(
                &shallow,
                overflow,
                &sort_order,
                &load.must_be_included,
            );
            if victims.is_empty() {
                diag.error("cache overflow and nothing evictable");
                return None;
            }
            for victim in &victims {
                diag.warning(format!("evicted {} to make the cache fit", victim));
            }
            let victim_set: HashSet<&String> = victims.iter().collect();
            dylibs.retain(|d| !victim_set.contains(&d.macho.install_name));
            drop_classes_of_evicted_dylibs(&mut imp_builder, &victims);
            evicted.extend(victims);
            if dylibs.is_empty() {
                diag.error("every dylib was evicted");
                return None;
            }
        }
        let mut layout = match layout {
            Some(layout) => layout,
            None => {
                diag.error("layout failed to converge after evictions");
                return None;
            }
        };

        // --- allocate the output buffer (1.5x, trimmed at the end) ---
        let mut buffer = vec![0u8; (layout.total_file_size + layout.total_file_size / 2) as usize];

        // Copy raw segments.
        for placements in &layout.placements {
            for placement in placements {
                let dylib = &dylibs[placement.dylib_index];
                let src = placement.src_file_offset as usize;
                let len = placement.copy_size as usize;
                let dst = placement.dst_buffer_offset as usize;
                buffer[dst..dst + len].copy_from_slice(&dylib.macho.bytes[src..src + len]);
            }
        }

        // Emit the coalesced pools.
        emit_string_pools(&mut buffer, &layout, &coalesced, diag);

        // --- C5 + C6: track and adjust ---
        let mut aslr = AslrTracker::new();
        if let (Some(first), Some(last)) =
            (layout.data_regions.first(), layout.data_regions.last())
        {
            aslr.set_data_region(
                first.unslid_load_address,
                last.unslid_load_address + last.size_in_use - first.unslid_load_address,
            );
        }
        if !options.cache_supports_aslr {
            aslr.disable();
        }

        let mut adjusted: Vec<AdjustedLinkedit> = vec![AdjustedLinkedit::default(); dylibs.len()];
        for (index, dylib) in dylibs.iter().enumerate() {
            let adjustor = Adjustor::new(
                index,
                &dylib.macho,
                &layout,
                &dylib.fixups,
                &dylib.coalescer,
                &coalesced,
            );
            match adjustor.adjust_image(&mut buffer, &aslr, &dylib.fixups) {
                Ok(linkedit) => adjusted[index] = linkedit,
                Err(reason) => {
                    if load.must_be_included.contains(&dylib.macho.install_name) {
                        diag.error(format!(
                            "required dylib {}: {}",
                            dylib.macho.install_name, reason
                        ));
                        return None;
                    }
                    diag.warning(format!(
                        "{} left unadjusted: {}",
                        dylib.macho.install_name, reason
                    ));
                }
            }
        }

        // Resolve binds between cache members and collect patch uses.
        let mut patch_table = PatchTable::default();
        resolve_binds(
            &mut buffer,
            &layout,
            &dylibs,
            fs,
            &aslr,
            arch,
            &mut patch_table,
            diag,
        );
        emit_cf_constants(&mut buffer, &layout, &dylibs, &coalesced, &aslr, options, diag);
        emit_imp_caches(&mut buffer, &layout, &dylibs, &imp_builder, arch, diag);
        if diag.has_error() {
            return None;
        }

        // --- C7: merge link-edit ---
        let shallow: Vec<MachO> = dylibs.iter().map(|d| d.macho.clone_shallow()).collect();
        let merged = match optimize_linkedit(
            &mut buffer,
            &layout,
            &shallow,
            &adjusted,
            options.exclude_local_symbols,
        ) {
            Ok(merged) => merged,
            Err(reason) => {
                diag.error(reason);
                return None;
            }
        };
        layout.read_only.size_in_use = merged.read_only_size_in_use;
        layout.total_file_size =
            layout.read_only.cache_file_offset + layout.read_only.size_in_use;

        // --- C8: slide info ---
        if options.cache_supports_aslr {
            crate::slide_info::emit_slide_info(&mut buffer, &mut layout, arch, &aslr, diag);
            if diag.has_error() {
                return None;
            }
        }

        // --- header, image tables, path trie, patch info ---
        let aliases = collect_aliases(&dylibs, fs);
        let built_from_chained = dylibs.iter().any(|d| d.macho.has_chained_fixups());
        let local_symbols_size = merged
            .local_symbols
            .as_ref()
            .map(|l| align(l.len() as u64, 12))
            .unwrap_or(0);
        write_cache_header(
            &mut buffer,
            &layout,
            &dylibs,
            &aliases,
            arch,
            options,
            &patch_table,
            built_from_chained,
            local_symbols_size,
            diag,
        );
        if diag.has_error() {
            return None;
        }

        // --- assemble file: regions, local symbols, signature ---
        let mut file = buffer;
        file.truncate(layout.total_file_size as usize);
        if let Some(local_symbols) = &merged.local_symbols {
            file.extend_from_slice(local_symbols);
            while file.len() as u64 % 0x1000 != 0 {
                file.push(0);
            }
        }

        // The header must record where the signature lands before any page
        // is hashed. The blob's size only depends on sizes known now, so a
        // first pass computes it, the header is patched, and a second pass
        // produces the hashes over the final header.
        let signature_offset = file.len() as u64;
        crate::endian::set64(&mut file, 0x30, signature_offset);
        let mut signature = None;
        for _ in 0..2 {
            let (cache_part, locals_part) = file.split_at_mut(layout.total_file_size as usize);
            let signed = crate::codesign::code_sign(
                cache_part,
                if locals_part.is_empty() {
                    None
                } else {
                    Some(&locals_part[..])
                },
                arch.name,
                arch.cs_page_size,
                layout.read_execute.size_in_use,
                options.code_signing_digest_mode,
                options.dylibs_removed_from_disk,
                options.disposition == Disposition::Customer,
                diag,
            )?;
            crate::endian::set64(&mut file, 0x38, signed.blob.len() as u64);
            signature = Some(signed);
        }
        let signature = signature.unwrap();
        file.extend_from_slice(&signature.blob);

        let map_file = write_map_file(&layout, &dylibs);
        let json_map = write_json_map(&layout, &dylibs, options);

        let paths_eligible_for_deletion = if options.dylibs_removed_from_disk {
            dylibs.iter().map(|d| d.macho.path.clone()).collect()
        } else {
            Vec::new()
        };

        Some(BuildResult {
            cache: CacheFile {
                bytes: file,
                cd_hash: signature.cd_hash,
            },
            map_file,
            json_map,
            warnings: self.diagnostics.warnings().to_vec(),
            evicted,
            paths_eligible_for_deletion,
        })
    }
}

impl MachO {
    /// A copy without the (large) file bytes, for analyses that only look at
    /// structure.
    fn clone_shallow(&self) -> MachO {
        MachO {
            path: self.path.clone(),
            install_name: self.install_name.clone(),
            kind: self.kind,
            uuid: self.uuid,
            is64: self.is64,
            header_flags: self.header_flags,
            ncmds: self.ncmds,
            sizeofcmds: self.sizeofcmds,
            segments: self.segments.clone(),
            dependencies: self.dependencies.clone(),
            symtab: self.symtab,
            dysymtab: self.dysymtab,
            dyld_info: self.dyld_info,
            exports_trie_cmd: self.exports_trie_cmd,
            chained_fixups_cmd: self.chained_fixups_cmd,
            split_seg_info: self.split_seg_info,
            function_starts: self.function_starts,
            data_in_code: self.data_in_code,
            mtime: self.mtime,
            inode: self.inode,
            bytes: Vec::new(),
        }
    }
}

fn objc_counts(dylibs: &[DylibState]) -> (u32, u32, u32) {
    let mut selrefs = 0u32;
    let mut classes = 0u32;
    for dylib in dylibs {
        selrefs += dylib.metadata.selref_count;
        classes += dylib.metadata.classes.len() as u32;
    }
    (selrefs, classes, 0)
}

fn collect_aliases(dylibs: &[DylibState], fs: &FileSystem) -> Vec<(usize, String)> {
    let mut aliases = Vec::new();
    for (index, dylib) in dylibs.iter().enumerate() {
        for alias in fs.aliases_of(&dylib.macho.path) {
            aliases.push((index, alias.to_string()));
        }
    }
    aliases
}

// --- IMP cache population ---

fn populate_imp_caches(
    builder: &mut ImpCachesBuilder,
    dylibs: &[DylibState],
    options: &CreateOptions,
    diag: &mut Diagnostics,
) {
    let config = &options.objc_optimizations;

    // Duplicate class names across images disqualify every copy.
    let mut seen_names: HashMap<ClassKey, u32> = HashMap::new();
    for dylib in dylibs {
        for class in &dylib.metadata.classes {
            for metaclass in [false, true] {
                *seen_names
                    .entry(ClassKey {
                        name: class.name.clone(),
                        metaclass,
                    })
                    .or_insert(0) += 1;
            }
        }
    }

    // Class graph for superclass walks, by name (duplicates are dropped
    // anyway).
    let mut by_name: HashMap<&str, (usize, &metadata::ParsedClass)> = HashMap::new();
    for (index, dylib) in dylibs.iter().enumerate() {
        for class in &dylib.metadata.classes {
            by_name.entry(&class.name).or_insert((index, class));
        }
    }

    let mut class_ids: HashMap<ClassKey, usize> = HashMap::new();
    for dylib in dylibs.iter() {
        let install_name = &dylib.macho.install_name;
        for class in &dylib.metadata.classes {
            for (metaclass, methods) in [
                (false, &class.methods),
                (true, &class.metaclass_methods),
            ] {
                let rank = if metaclass {
                    config.needed_metaclasses.get(&class.name)
                } else {
                    config.needed_classes.get(&class.name)
                };
                let Some(&rank) = rank else {
                    continue;
                };
                let key = ClassKey {
                    name: class.name.clone(),
                    metaclass,
                };
                let mut data = crate::objc::imp_caches::ClassData::new(key.clone(), install_name);
                data.is_part_of_duplicate_set = seen_names[&key] > 1;
                if data.is_part_of_duplicate_set {
                    diag.verbose(format!("{} defined in multiple images", key));
                }

                // Flattening hierarchy membership.
                let mut ancestor = class.superclass.clone();
                let mut walked: Vec<String> = Vec::new();
                let mut visited = HashSet::new();
                while let Some(reference) = ancestor {
                    let name = match reference {
                        ClassRef::External(symbol) => {
                            match class_name_from_symbol(&symbol) {
                                Some((name, _)) => name.to_string(),
                                None => break,
                            }
                        }
                        ClassRef::InImage(addr) => {
                            match dylib
                                .metadata
                                .classes
                                .iter()
                                .find(|c| c.vmaddr == addr)
                            {
                                Some(parsed) => parsed.name.clone(),
                                None => break,
                            }
                        }
                    };
                    if !visited.insert(name.clone()) {
                        break; // inheritance cycle in malformed input
                    }
                    walked.push(name.clone());
                    if config.flattening_roots.contains(&name) {
                        data.flattening_root_name = Some(name.clone());
                        data.flattened_superclasses = walked.iter().cloned().collect();
                        // Locate the root's own superclass for later
                        // invalidation bookkeeping.
                        if let Some((root_dylib, root_class)) = by_name.get(name.as_str()) {
                            if let Some(ClassRef::InImage(super_addr)) = &root_class.superclass
                            {
                                if let Some(parsed) = dylibs[*root_dylib]
                                    .metadata
                                    .classes
                                    .iter()
                                    .find(|c| c.vmaddr == *super_addr)
                                {
                                    data.flattening_root_superclass =
                                        Some(crate::objc::imp_caches::ClassLocator {
                                            install_name: dylibs[*root_dylib]
                                                .macho
                                                .install_name
                                                .clone(),
                                            segment_index: parsed.segment_index,
                                            segment_offset: parsed.segment_offset,
                                        });
                                }
                            }
                        }
                        break;
                    }
                    ancestor = by_name
                        .get(name.as_str())
                        .and_then(|(_, c)| c.superclass.clone());
                }

                let id = builder.add_class(data, rank);
                class_ids.insert(
                    ClassKey {
                        name: class.name.clone(),
                        metaclass,
                    },
                    id,
                );
                for method in methods.iter() {
                    let selector = builder.selectors.intern(&method.name);
                    builder.add_method_to_class(
                        id,
                        crate::objc::imp_caches::Method {
                            selector,
                            install_name: install_name.clone(),
                            class_name: class.name.clone(),
                            category_name: None,
                            imp: method.imp,
                            was_inlined: false,
                            from_flattening: false,
                        },
                    );
                }
            }
        }
    }

    // Attach categories: same-image by address, cross-image by symbol.
    for dylib in dylibs {
        let install_name = &dylib.macho.install_name;
        for category in &dylib.metadata.categories {
            let target_name = match &category.class {
                Some(ClassRef::External(symbol)) => {
                    match class_name_from_symbol(symbol) {
                        Some((name, _)) => name.to_string(),
                        None => continue,
                    }
                }
                Some(ClassRef::InImage(addr)) => {
                    match dylib.metadata.classes.iter().find(|c| c.vmaddr == *addr) {
                        Some(parsed) => parsed.name.clone(),
                        None => continue,
                    }
                }
                None => continue,
            };
            for (metaclass, methods) in [
                (false, &category.instance_methods),
                (true, &category.class_methods),
            ] {
                let key = ClassKey {
                    name: target_name.clone(),
                    metaclass,
                };
                let Some(&id) = class_ids.get(&key) else {
                    continue;
                };
                for method in methods.iter() {
                    let selector = builder.selectors.intern(&method.name);
                    builder.add_method_to_class(
                        id,
                        crate::objc::imp_caches::Method {
                            selector,
                            install_name: install_name.clone(),
                            class_name: target_name.clone(),
                            category_name: Some(category.name.clone()),
                            imp: method.imp,
                            was_inlined: false,
                            from_flattening: false,
                        },
                    );
                }
            }
        }
    }

    // Inline selected selectors from ancestors.
    if !options.objc_optimizations.inlined_selectors.is_empty() {
        inline_selectors(builder, dylibs, options, &class_ids, &by_name);
    }

    for class in &mut builder.classes {
        class.did_finish_adding_methods();
    }
}

fn inline_selectors(
    builder: &mut ImpCachesBuilder,
    dylibs: &[DylibState],
    options: &CreateOptions,
    class_ids: &HashMap<ClassKey, usize>,
    by_name: &HashMap<&str, (usize, &metadata::ParsedClass)>,
) {
    let inlined: HashSet<&str> = options
        .objc_optimizations
        .inlined_selectors
        .iter()
        .map(|s| s.as_str())
        .collect();
    // Walk classes in a stable order; method insertion order feeds the
    // placement algorithm.
    let mut ordered: Vec<(&ClassKey, usize)> =
        class_ids.iter().map(|(key, &id)| (key, id)).collect();
    ordered.sort_by(|a, b| (&a.0.name, a.0.metaclass).cmp(&(&b.0.name, b.0.metaclass)));
    for (key, id) in ordered {
        if key.metaclass {
            continue; // class-method inlining is driven by the same walk
        }
        let Some(&(start_dylib, start_class)) = by_name.get(key.name.as_str()) else {
            continue;
        };
        let in_flattening = builder.classes[id].flattening_root_name.is_some();
        let mut current = start_class.superclass.clone();
        let mut origin_dylib = start_dylib;
        let mut visited = HashSet::new();
        while let Some(reference) = current {
            let name = match reference {
                ClassRef::External(symbol) => match class_name_from_symbol(&symbol) {
                    Some((name, _)) => name.to_string(),
                    None => break,
                },
                ClassRef::InImage(addr) => {
                    match dylibs[origin_dylib]
                        .metadata
                        .classes
                        .iter()
                        .find(|c| c.vmaddr == addr)
                    {
                        Some(parsed) => parsed.name.clone(),
                        None => break,
                    }
                }
            };
            if !visited.insert(name.clone()) {
                break;
            }
            let Some(&(ancestor_dylib, ancestor)) = by_name.get(name.as_str()) else {
                break;
            };
            for method in &ancestor.methods {
                if !inlined.contains(method.name.as_str()) {
                    continue;
                }
                let selector = builder.selectors.intern(&method.name);
                if builder.classes[id]
                    .methods
                    .iter()
                    .any(|m| m.selector == selector)
                {
                    continue; // overridden below the ancestor
                }
                builder.add_method_to_class(
                    id,
                    crate::objc::imp_caches::Method {
                        selector,
                        install_name: dylibs[ancestor_dylib].macho.install_name.clone(),
                        class_name: name.clone(),
                        category_name: None,
                        imp: method.imp,
                        was_inlined: true,
                        from_flattening: in_flattening,
                    },
                );
            }
            current = ancestor.superclass.clone();
            origin_dylib = ancestor_dylib;
        }
    }
}

fn drop_classes_of_evicted_dylibs(builder: &mut ImpCachesBuilder, victims: &[String]) {
    let victim_set: HashSet<&String> = victims.iter().collect();
    for class_id in 0..builder.classes.len() {
        let owned_by_victim = victim_set.contains(&builder.classes[class_id].install_name)
            || builder.classes[class_id]
                .methods
                .iter()
                .any(|m| victim_set.contains(&m.install_name));
        if owned_by_victim {
            builder.classes[class_id].should_generate_imp_cache = false;
        }
    }
    let mut address_space = std::mem::take(&mut builder.address_space);
    builder.remove_uninteresting_classes(&mut address_space);
    builder.address_space = address_space;
}

// --- emission helpers ---

fn emit_string_pools(
    buffer: &mut [u8],
    layout: &CacheLayout,
    coalesced: &CacheCoalescedText,
    diag: &mut Diagnostics,
) {
    for section in [
        &coalesced.objc_class_names,
        &coalesced.objc_meth_names,
        &coalesced.objc_meth_types,
    ] {
        if section.buffer_size == 0 {
            continue;
        }
        let Some(offset) = layout.buffer_offset_for_address(section.buffer_vmaddr) else {
            diag.error("string pool has no assigned address");
            return;
        };
        let pool =
            &mut buffer[offset as usize..offset as usize + section.buffer_size as usize];
        section.emit(pool);
    }
    // The magic selector sits at the very start of the method-name pool.
    let methnames = &coalesced.objc_meth_names;
    if methnames.buffer_size != 0 {
        let offset = layout
            .buffer_offset_for_address(methnames.buffer_vmaddr)
            .unwrap() as usize;
        buffer[offset..offset + MAGIC_SELECTOR.len()]
            .copy_from_slice(MAGIC_SELECTOR.as_bytes());
        buffer[offset + MAGIC_SELECTOR.len()] = 0;
    }
}

#[derive(Default)]
struct PatchTable {
    /// (dylib index, export name, impl VM offset from the cache base) ->
    /// use sites.
    uses: BTreeMap<(usize, String, u32), Vec<PatchLocation>>,
}

#[allow(clippy::too_many_arguments)]
fn resolve_binds(
    buffer: &mut [u8],
    layout: &CacheLayout,
    dylibs: &[DylibState],
    fs: &FileSystem,
    aslr: &AslrTracker,
    arch: &ArchLayout,
    patch_table: &mut PatchTable,
    diag: &mut Diagnostics,
) {
    // install name -> dylib index
    let by_install_name: HashMap<&str, usize> = dylibs
        .iter()
        .enumerate()
        .map(|(i, d)| (d.macho.install_name.as_str(), i))
        .collect();

    for (index, dylib) in dylibs.iter().enumerate() {
        for bind in &dylib.fixups.binds {
            let Some(placement) = layout.placements[index]
                .iter()
                .find(|p| p.segment_index == bind.seg_index)
            else {
                continue;
            };
            let slot_addr = placement.dst_unslid_address + bind.seg_offset;
            let Some(slot_offset) = layout.buffer_offset_for_address(slot_addr) else {
                continue;
            };

            // Text-relocated binds exist in old binaries; those slots are
            // outside the tracked data regions.
            let in_data_region = layout
                .data_regions
                .iter()
                .any(|r| r.contains_address(slot_addr));

            let resolved = resolve_one_bind(dylibs, &by_install_name, fs, index, bind);
            let (exporter_index, export) = match resolved {
                Some(found) => found,
                None => {
                    if !bind.weak_import {
                        diag.warning(format!(
                            "{}: missing symbol {}",
                            dylib.macho.install_name, bind.symbol
                        ));
                    }
                    // Missing-symbol marker; the loader rejects the image if
                    // it is ever referenced.
                    if dylib.macho.is64 {
                        set64(buffer, slot_offset as usize, 0);
                    } else {
                        crate::endian::set32(buffer, slot_offset as usize, 0);
                    }
                    if in_data_region {
                        aslr.remove(slot_addr);
                    }
                    continue;
                }
            };

            let impl_addr = if export.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK
                == EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE
            {
                export.address
            } else {
                let orig = dylibs[exporter_index].macho.preferred_load_address()
                    + export.address;
                match translate_address_by_index(layout, dylibs, exporter_index, orig) {
                    Some(addr) => addr,
                    None => continue,
                }
            };
            let value = (impl_addr as i64 + bind.addend) as u64;
            if dylib.macho.is64 {
                set64(buffer, slot_offset as usize, value);
            } else {
                crate::endian::set32(buffer, slot_offset as usize, value as u32);
            }
            if in_data_region {
                if let Some((diversity, addr_div, key)) = bind.auth {
                    aslr.set_auth_data(slot_addr, diversity, addr_div, key);
                }
                aslr.add(slot_addr);
            }

            // Patch locations are VM offsets from the cache base.
            let cache_offset = (slot_addr - arch.shared_memory_start) as u32;
            let impl_offset = (impl_addr.wrapping_sub(arch.shared_memory_start)) as u32;
            patch_table
                .uses
                .entry((exporter_index, bind.symbol.clone(), impl_offset))
                .or_default()
                .push(PatchLocation {
                    cache_offset,
                    high7: 0,
                    addend: bind.addend.clamp(0, 31) as u8,
                    authenticated: bind.auth.is_some(),
                    uses_address_diversity: bind.auth.map(|a| a.1).unwrap_or(false),
                    key: bind.auth.map(|a| a.2).unwrap_or(0),
                    discriminator: bind.auth.map(|a| a.0).unwrap_or(0),
                });
        }
    }
}

/// Resolve one bind to its exporting dylib, following re-export chains.
fn resolve_one_bind<'a>(
    dylibs: &'a [DylibState],
    by_install_name: &HashMap<&str, usize>,
    fs: &FileSystem,
    binder_index: usize,
    bind: &crate::mach_o::fixups::BindLocation,
) -> Option<(usize, &'a ExportedSymbol)> {
    let candidates: Vec<usize> = if bind.lib_ordinal > 0 {
        let dep = dylibs[binder_index]
            .macho
            .dependencies
            .get(bind.lib_ordinal as usize - 1)?;
        let resolved = fs.resolve_path(&dep.path);
        match by_install_name
            .get(dep.path.as_str())
            .or_else(|| by_install_name.get(resolved))
        {
            Some(&index) => vec![index],
            None => return None, // dependency not in the cache
        }
    } else if bind.lib_ordinal == 0 {
        vec![binder_index]
    } else {
        // Flat or weak lookup: search everything, in cache order.
        (0..dylibs.len()).collect()
    };

    for candidate in candidates {
        if let Some(found) = find_export(dylibs, by_install_name, fs, candidate, &bind.symbol, 0)
        {
            return Some(found);
        }
    }
    None
}

fn find_export<'a>(
    dylibs: &'a [DylibState],
    by_install_name: &HashMap<&str, usize>,
    fs: &FileSystem,
    index: usize,
    symbol: &str,
    depth: u32,
) -> Option<(usize, &'a ExportedSymbol)> {
    if depth > 8 {
        return None;
    }
    if let Some(export) = dylibs[index].exports.iter().find(|e| e.name == symbol) {
        if export.flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            // Re-exported from a dependency: chase it there.
            let ordinal = export.address;
            let dep = dylibs[index].macho.dependencies.get(ordinal as usize - 1)?;
            let resolved = fs.resolve_path(&dep.path);
            let &target = by_install_name
                .get(dep.path.as_str())
                .or_else(|| by_install_name.get(resolved))?;
            let target_name = export
                .import_name
                .as_deref()
                .filter(|n| !n.is_empty())
                .unwrap_or(symbol);
            return find_export(dylibs, by_install_name, fs, target, target_name, depth + 1);
        }
        return Some((index, export));
    }
    // Symbols can also surface through wholesale re-exported dependencies.
    for dep in &dylibs[index].macho.dependencies {
        if !dep.reexport {
            continue;
        }
        let resolved = fs.resolve_path(&dep.path);
        if let Some(&target) = by_install_name
            .get(dep.path.as_str())
            .or_else(|| by_install_name.get(resolved))
        {
            if let Some(found) =
                find_export(dylibs, by_install_name, fs, target, symbol, depth + 1)
            {
                return Some(found);
            }
        }
    }
    None
}

fn translate_address_by_index(
    layout: &CacheLayout,
    dylibs: &[DylibState],
    index: usize,
    orig: u64,
) -> Option<u64> {
    for segment in &dylibs[index].macho.segments {
        if orig >= segment.vmaddr && orig < segment.vmaddr + segment.vmsize {
            let placement = layout.placements[index]
                .iter()
                .find(|p| p.segment_index == segment.index)?;
            return Some(placement.dst_unslid_address + (orig - segment.vmaddr));
        }
    }
    None
}

fn emit_cf_constants(
    buffer: &mut [u8],
    layout: &CacheLayout,
    dylibs: &[DylibState],
    coalesced: &CacheCoalescedText,
    aslr: &AslrTracker,
    options: &CreateOptions,
    diag: &mut Diagnostics,
) {
    let cf = &coalesced.cf_strings;
    if cf.buffer_size == 0 {
        return;
    }
    let Some(isa_install_name) = &cf.isa_install_name else {
        return;
    };
    let by_install_name: HashMap<&str, usize> = dylibs
        .iter()
        .enumerate()
        .map(|(i, d)| (d.macho.install_name.as_str(), i))
        .collect();
    let Some(&exporter) = by_install_name.get(isa_install_name.as_str()) else {
        diag.warning(format!(
            "CFString class provider {} is not in the cache",
            isa_install_name
        ));
        return;
    };
    let Some(isa_export) = dylibs[exporter]
        .exports
        .iter()
        .find(|e| e.name == cf.isa_class_name)
    else {
        diag.warning(format!(
            "{} does not export {}",
            isa_install_name, cf.isa_class_name
        ));
        return;
    };
    let isa_addr = match translate_address_by_index(
        layout,
        dylibs,
        exporter,
        dylibs[exporter].macho.preferred_load_address() + isa_export.address,
    ) {
        Some(addr) => addr | options.objc_optimizations.cf_isa_tag,
        None => return,
    };

    let base = layout.buffer_offset_for_address(cf.buffer_vmaddr).unwrap();
    for atom in &cf.atoms {
        let atom_addr = cf.buffer_vmaddr + atom.pool_offset as u64;
        let offset = (base + atom.pool_offset as u64) as usize;
        let (source_dylib, string_orig) = atom.string_source;
        let Some(string_addr) =
            translate_address_by_index(layout, dylibs, source_dylib, string_orig)
        else {
            continue;
        };
        set64(buffer, offset, isa_addr);
        set64(buffer, offset + 8, atom.flags);
        set64(buffer, offset + 16, string_addr);
        set64(buffer, offset + 24, atom.length);
        aslr.add(atom_addr);
        aslr.add(atom_addr + 16);
    }
}

/// Write the per-class hash tables into the reserved IMP-cache area.
///
/// Table image: an 8-byte header (`shift: u8, needed_bits: u8, occupied:
/// u16, pad: u32`) then one `(sel_offset: u32, imp_offset: u32)` pair per
/// slot, both offsets relative to the cache base.
fn emit_imp_caches(
    buffer: &mut [u8],
    layout: &CacheLayout,
    dylibs: &[DylibState],
    imp_builder: &ImpCachesBuilder,
    arch: &ArchLayout,
    diag: &mut Diagnostics,
) {
    let by_install_name: HashMap<&str, usize> = dylibs
        .iter()
        .enumerate()
        .map(|(i, d)| (d.macho.install_name.as_str(), i))
        .collect();
    let mut cursor = layout.imp_caches_addr;
    for class in &imp_builder.classes {
        if !class.should_generate_imp_cache || class.methods.is_empty() {
            continue;
        }
        let table_size = class.size_in_shared_cache();
        if cursor + table_size > layout.imp_caches_addr + layout.imp_caches_size {
            diag.error("IMP cache tables overflowed their reservation");
            return;
        }
        let offset = layout.buffer_offset_for_address(cursor).unwrap() as usize;
        // The runtime hashes full selector offsets, so its shift includes
        // the 7 intra-bucket bits.
        buffer[offset] = class.shift as u8 + 7;
        buffer[offset + 1] = class.needed_bits as u8;
        crate::endian::set16(buffer, offset + 2, class.methods.len() as u16);
        crate::endian::set32(buffer, offset + 4, 0);
        // Empty slots first.
        for slot in 0..class.modulo() as usize {
            let at = offset + 8 + slot * 8;
            crate::endian::set32(buffer, at, IMP_CACHE_EMPTY_SLOT);
            crate::endian::set32(buffer, at + 4, 0);
        }
        for method in &class.methods {
            let selector = imp_builder.selectors.get(method.selector);
            let slot =
                ((selector.offset >> 7 >> class.shift) & class.mask()) as usize;
            let at = offset + 8 + slot * 8;
            let imp_offset = by_install_name
                .get(method.install_name.as_str())
                .and_then(|&i| translate_address_by_index(layout, dylibs, i, method.imp))
                .map(|addr| (addr - arch.shared_memory_start) as u32)
                .unwrap_or(0);
            crate::endian::set32(buffer, at, selector.offset);
            crate::endian::set32(buffer, at + 4, imp_offset);
        }
        cursor += table_size;
    }
}

// --- header and tables ---

#[allow(clippy::too_many_arguments)]
fn write_cache_header(
    buffer: &mut [u8],
    layout: &CacheLayout,
    dylibs: &[DylibState],
    aliases: &[(usize, String)],
    arch: &ArchLayout,
    options: &CreateOptions,
    patch_table: &PatchTable,
    built_from_chained: bool,
    local_symbols_size: u64,
    diag: &mut Diagnostics,
) {
    let mapping_offset = HEADER_SIZE;
    let mapping_count = 2 + layout.data_regions.len() as u32;
    let mapping_with_slide_offset =
        mapping_offset + mapping_count as u64 * MAPPING_INFO_SIZE;
    let images_offset =
        mapping_with_slide_offset + mapping_count as u64 * MAPPING_WITH_SLIDE_INFO_SIZE;
    let images_count = (dylibs.len() + aliases.len()) as u32;
    let images_text_offset = images_offset + images_count as u64 * IMAGE_INFO_SIZE;
    let paths_offset = images_text_offset + dylibs.len() as u64 * IMAGE_TEXT_INFO_SIZE;

    // Path strings for both tables.
    let mut path_offsets: Vec<u32> = Vec::with_capacity(dylibs.len());
    let mut cursor = paths_offset;
    for dylib in dylibs {
        path_offsets.push(cursor as u32);
        let path = dylib.macho.install_name.as_bytes();
        buffer[cursor as usize..cursor as usize + path.len()].copy_from_slice(path);
        buffer[cursor as usize + path.len()] = 0;
        cursor += path.len() as u64 + 1;
    }
    let mut alias_offsets: Vec<u32> = Vec::with_capacity(aliases.len());
    for (_, alias) in aliases {
        alias_offsets.push(cursor as u32);
        let path = alias.as_bytes();
        buffer[cursor as usize..cursor as usize + path.len()].copy_from_slice(path);
        buffer[cursor as usize + path.len()] = 0;
        cursor += path.len() as u64 + 1;
    }
    if cursor > layout.header_reserved_size {
        diag.error("cache header metadata overflowed its reservation");
        return;
    }

    // Mappings.
    let mut mappings: Vec<MappingWithSlideInfo> = Vec::new();
    mappings.push(MappingWithSlideInfo {
        mapping: MappingInfo {
            address: layout.read_execute.unslid_load_address,
            size: layout.read_execute.size_in_use,
            file_offset: layout.read_execute.cache_file_offset,
            max_prot: layout.read_execute.max_prot,
            init_prot: layout.read_execute.init_prot,
        },
        slide_info_file_offset: 0,
        slide_info_file_size: 0,
        flags: 0,
    });
    for region in &layout.data_regions {
        let (slide_offset, slide_size) = region
            .slide_info
            .as_ref()
            .map(|s| (s.file_offset, s.file_size))
            .unwrap_or((0, 0));
        mappings.push(MappingWithSlideInfo {
            mapping: MappingInfo {
                address: region.unslid_load_address,
                size: region.size_in_use,
                file_offset: region.cache_file_offset,
                max_prot: region.max_prot,
                init_prot: region.init_prot,
            },
            slide_info_file_offset: slide_offset,
            slide_info_file_size: slide_size,
            flags: region.flags,
        });
    }
    mappings.push(MappingWithSlideInfo {
        mapping: MappingInfo {
            address: layout.read_only.unslid_load_address,
            size: layout.read_only.size_in_use,
            file_offset: layout.read_only.cache_file_offset,
            max_prot: layout.read_only.max_prot,
            init_prot: layout.read_only.init_prot,
        },
        slide_info_file_offset: 0,
        slide_info_file_size: 0,
        flags: 0,
    });
    for (i, mapping) in mappings.iter().enumerate() {
        mapping
            .mapping
            .write_to(buffer, (mapping_offset + i as u64 * MAPPING_INFO_SIZE) as usize);
        mapping.write_to(
            buffer,
            (mapping_with_slide_offset + i as u64 * MAPPING_WITH_SLIDE_INFO_SIZE) as usize,
        );
    }

    // Image infos, sorted by path as the loader expects; aliases share the
    // target's address.
    let text_address = |index: usize| -> u64 {
        layout.placements[index]
            .iter()
            .find(|p| p.segment_index == 0)
            .map(|p| p.dst_unslid_address)
            .unwrap_or(0)
    };
    let mut image_entries: Vec<ImageInfo> = Vec::new();
    for (index, dylib) in dylibs.iter().enumerate() {
        image_entries.push(ImageInfo {
            address: text_address(index),
            mod_time: dylib.macho.mtime,
            inode: dylib.macho.inode,
            path_file_offset: path_offsets[index],
        });
    }
    for ((target, _), &path_offset) in aliases.iter().zip(&alias_offsets) {
        image_entries.push(ImageInfo {
            address: text_address(*target),
            mod_time: dylibs[*target].macho.mtime,
            inode: dylibs[*target].macho.inode,
            path_file_offset: path_offset,
        });
    }
    for (i, entry) in image_entries.iter().enumerate() {
        entry.write_to(buffer, (images_offset + i as u64 * IMAGE_INFO_SIZE) as usize);
    }

    // Image text infos.
    for (index, dylib) in dylibs.iter().enumerate() {
        let text_size = layout.placements[index]
            .iter()
            .find(|p| p.segment_index == 0)
            .map(|p| p.dst_segment_size)
            .unwrap_or(0);
        let entry = ImageTextInfo {
            uuid: dylib.macho.uuid,
            load_address: text_address(index),
            text_segment_size: text_size as u32,
            path_offset: path_offsets[index],
        };
        entry.write_to(
            buffer,
            (images_text_offset + index as u64 * IMAGE_TEXT_INFO_SIZE) as usize,
        );
    }

    // Path trie and patch info live in the reserved ObjC optimizer area.
    let trie_entries: Vec<TrieEntry> = {
        let mut entries: Vec<TrieEntry> = dylibs
            .iter()
            .enumerate()
            .map(|(index, d)| TrieEntry {
                name: d.macho.install_name.clone(),
                payload: trie_image_payload(index as u64),
            })
            .collect();
        for (target, alias) in aliases {
            entries.push(TrieEntry {
                name: alias.clone(),
                payload: trie_image_payload(*target as u64),
            });
        }
        entries
    };
    let trie_bytes = trie::build_trie(&trie_entries);
    let (patch_bytes, patch_info_size) = build_patch_info(
        patch_table,
        layout.objc_opt_ro_addr + align(trie_bytes.len() as u64, 3),
    );

    let metadata_size = align(trie_bytes.len() as u64, 3) + patch_bytes.len() as u64;
    if metadata_size > layout.objc_opt_ro_size {
        diag.error("path trie and patch info overflowed the optimizer reservation");
        return;
    }
    let trie_addr = layout.objc_opt_ro_addr;
    let trie_offset = layout.buffer_offset_for_address(trie_addr).unwrap() as usize;
    buffer[trie_offset..trie_offset + trie_bytes.len()].copy_from_slice(&trie_bytes);
    let patch_addr = trie_addr + align(trie_bytes.len() as u64, 3);
    let patch_offset = layout.buffer_offset_for_address(patch_addr).unwrap() as usize;
    buffer[patch_offset..patch_offset + patch_bytes.len()].copy_from_slice(&patch_bytes);

    let header = CacheHeader {
        magic: CacheHeader::make_magic(arch.name),
        mapping_offset: mapping_offset as u32,
        mapping_count,
        mapping_with_slide_offset: mapping_with_slide_offset as u32,
        mapping_with_slide_count: mapping_count,
        images_offset: images_offset as u32,
        images_count,
        dyld_base_address: arch.shared_memory_start,
        code_signature_offset: 0, // patched before signing
        code_signature_size: 0,
        slide_info_offset_unused: 0,
        slide_info_size_unused: 0,
        local_symbols_offset: if local_symbols_size == 0 {
            0
        } else {
            layout.total_file_size
        },
        local_symbols_size,
        uuid: [0; 16], // derived from the code signature later
        cache_type: if options.disposition == Disposition::Customer {
            1
        } else {
            0
        },
        branch_pools_offset: 0,
        branch_pools_count: 0,
        dylibs_image_array_addr: 0, // closures are out of scope
        dylibs_image_array_size: 0,
        dylibs_trie_addr: trie_addr,
        dylibs_trie_size: trie_bytes.len() as u64,
        other_image_array_addr: 0,
        other_image_array_size: 0,
        other_trie_addr: 0,
        other_trie_size: 0,
        images_text_offset: images_text_offset as u32,
        images_text_count: dylibs.len() as u32,
        patch_info_addr: patch_addr,
        patch_info_size,
        prog_closures_addr: 0,
        prog_closures_size: 0,
        prog_closures_trie_addr: 0,
        prog_closures_trie_size: 0,
        shared_region_start: arch.shared_memory_start,
        shared_region_size: arch.shared_memory_size,
        max_slide: layout.max_slide(arch),
        platform: options.platform,
        format_version: FORMAT_VERSION,
        dylibs_expected_on_disk: !options.dylibs_removed_from_disk as u8,
        simulator: 0,
        locally_built_cache: options.is_locally_built_cache as u8,
        built_from_chained_fixups: built_from_chained as u8,
    };
    header.write_to(buffer);
}

fn trie_image_payload(index: u64) -> Vec<u8> {
    let mut payload = Vec::new();
    crate::endian::append_uleb128(&mut payload, index);
    payload
}

/// Lay out the patch-info area: header, per-image spans, exports, use sites,
/// name pool.
fn build_patch_info(patch_table: &PatchTable, base_addr: u64) -> (Vec<u8>, u64) {
    // Group uses by exporter image.
    let mut exports_by_image: BTreeMap<usize, Vec<(&(usize, String, u32), &Vec<PatchLocation>)>> =
        BTreeMap::new();
    for (key, uses) in &patch_table.uses {
        exports_by_image.entry(key.0).or_default().push((key, uses));
    }
    let image_count = exports_by_image
        .keys()
        .next_back()
        .map(|&i| i + 1)
        .unwrap_or(0) as u64;
    let export_count: u64 = patch_table.uses.len() as u64;
    let location_count: u64 = patch_table.uses.values().map(|u| u.len() as u64).sum();

    let tables_offset = PATCH_INFO_SIZE;
    let exports_offset = tables_offset + image_count * IMAGE_PATCHES_SIZE;
    let locations_offset = exports_offset + export_count * PATCH_EXPORT_SIZE;
    let names_offset = locations_offset + location_count * PATCH_LOCATION_SIZE;

    let mut names: Vec<u8> = Vec::new();
    let mut out = vec![0u8; names_offset as usize];

    let mut export_index = 0u32;
    let mut location_index = 0u32;
    for image in 0..image_count as usize {
        let start = export_index;
        if let Some(exports) = exports_by_image.get(&image) {
            for ((_, name, impl_offset), uses) in exports {
                let name_offset = names.len() as u32;
                names.extend_from_slice(name.as_bytes());
                names.push(0);
                let export = PatchExport {
                    cache_offset_of_impl: *impl_offset,
                    patch_locations_start_index: location_index,
                    patch_locations_count: uses.len() as u32,
                    export_name_offset: name_offset,
                };
                export.write_to(
                    &mut out,
                    (exports_offset + export_index as u64 * PATCH_EXPORT_SIZE) as usize,
                );
                for location in uses.iter() {
                    location.write_to(
                        &mut out,
                        (locations_offset + location_index as u64 * PATCH_LOCATION_SIZE)
                            as usize,
                    );
                    location_index += 1;
                }
                export_index += 1;
            }
        }
        let patches = ImagePatches {
            patch_exports_start_index: start,
            patch_exports_count: export_index - start,
        };
        patches.write_to(
            &mut out,
            (tables_offset + image as u64 * IMAGE_PATCHES_SIZE) as usize,
        );
    }
    out.extend_from_slice(&names);

    let info = PatchInfo {
        patch_table_array_addr: base_addr + tables_offset,
        patch_table_array_count: image_count,
        patch_export_array_addr: base_addr + exports_offset,
        patch_export_array_count: export_count,
        patch_location_array_addr: base_addr + locations_offset,
        patch_location_array_count: location_count,
        patch_export_names_addr: base_addr + names_offset,
        patch_export_names_size: names.len() as u64,
    };
    info.write_to(&mut out, 0);
    let total = out.len() as u64;
    (out, total)
}

// --- map files ---

fn write_map_file(layout: &CacheLayout, dylibs: &[DylibState]) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for region in layout.regions() {
        writeln!(
            out,
            "mapping {:>12}  {:4}MB  {:#011x} -> {:#011x}",
            region.name,
            region.size_in_use / 0x10_0000,
            region.unslid_load_address,
            region.unslid_load_address + region.size_in_use,
        )
        .unwrap();
    }
    for (index, dylib) in dylibs.iter().enumerate() {
        writeln!(out, "{}", dylib.macho.install_name).unwrap();
        for placement in &layout.placements[index] {
            writeln!(
                out,
                "\t{:>16} {:#011x} -> {:#011x}",
                placement.name,
                placement.dst_unslid_address,
                placement.dst_unslid_address + placement.dst_segment_size,
            )
            .unwrap();
        }
    }
    out
}

fn write_json_map(
    layout: &CacheLayout,
    dylibs: &[DylibState],
    options: &CreateOptions,
) -> String {
    let images: Vec<serde_json::Value> = dylibs
        .iter()
        .enumerate()
        .map(|(index, dylib)| {
            let segments: Vec<serde_json::Value> = layout.placements[index]
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.name,
                        "startAddr": format!("{:#x}", p.dst_unslid_address),
                        "endAddr": format!("{:#x}", p.dst_unslid_address + p.dst_segment_size),
                    })
                })
                .collect();
            serde_json::json!({
                "path": dylib.macho.install_name,
                "segments": segments,
            })
        })
        .collect();
    let map = serde_json::json!({
        "version": 1,
        "disposition": options.disposition.name(),
        "baseAddress": format!("{:#x}", layout.read_execute.unslid_load_address),
        "images": images,
    });
    serde_json::to_string_pretty(&map).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_info_layout() {
        let mut table = PatchTable::default();
        table.uses.insert(
            (0, "_f".to_string(), 0x4000),
            vec![PatchLocation {
                cache_offset: 0x4000_0000,
                ..PatchLocation::default()
            }],
        );
        let (bytes, size) = build_patch_info(&table, 0x1_8100_0000);
        assert_eq!(size as usize, bytes.len());
        // Header counts: 1 image, 1 export, 1 location.
        assert_eq!(crate::endian::get64(&bytes, 8), 1);
        assert_eq!(crate::endian::get64(&bytes, 24), 1);
        assert_eq!(crate::endian::get64(&bytes, 40), 1);
        // Name pool holds "_f\0".
        let names_addr = crate::endian::get64(&bytes, 48);
        let names_offset = (names_addr - 0x1_8100_0000) as usize;
        assert_eq!(&bytes[names_offset..names_offset + 3], b"_f\0");
    }

    #[test]
    fn trie_payload_is_image_index() {
        let payload = trie_image_payload(42);
        let mut offset = 0;
        assert_eq!(
            crate::endian::read_uleb128(&payload, &mut offset).unwrap(),
            42
        );
    }
}
