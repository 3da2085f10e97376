/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Command-line harness around the cache builder.
//!
//! Inputs arrive as a JSON manifest plus `-add-file`/`-add-symlink`
//! arguments; one cache file (with its map files) is produced per requested
//! architecture under the output directory.

use cachebuilder::options::{parse_order_file, CodeSigningDigestMode, Disposition, ObjcOptimizations};
use cachebuilder::{CreateOptions, FileSystem, InputFile, SharedCacheBuilder};
use std::path::{Path, PathBuf};

const USAGE: &str = "\
Usage:
    cachebuilder -manifest path/to/manifest.json -output dir \\
        [-add-file cache-path=host-path]... [-add-symlink link=target]...

Options:
    -manifest <path>
        JSON manifest describing the build (archs, platform, disposition,
        file list, order files, optimizer configuration).

    -add-file <cache-path>=<host-path>
        Register a file under its cache path, reading bytes from the host
        path. Repeatable. Files named by the manifest must be registered.

    -add-symlink <link>=<target>
        Register a symlink in the input set. Repeatable.

    -output <dir>
        Directory to write dyld_shared_cache_<arch> and map files into.

    -verbose
        Print build progress to stderr.
";

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    version: u32,
    archs: Vec<String>,
    platform: u8,
    disposition: String,
    files: Vec<ManifestFile>,
    #[serde(default)]
    dylib_order_file: Option<String>,
    #[serde(default)]
    dirty_data_order_file: Option<String>,
    #[serde(default)]
    objc_optimizations_file: Option<String>,
    #[serde(default)]
    code_signing: Option<String>,
    #[serde(default)]
    evict_leaf_dylibs_on_overflow: Option<bool>,
    #[serde(default)]
    exclude_local_symbols: Option<bool>,
    #[serde(default)]
    optimize_for_size: Option<bool>,
    #[serde(default)]
    locally_built_cache: Option<bool>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFile {
    path: String,
    #[serde(default)]
    must_be_included: bool,
}

fn main() {
    if let Err(message) = run() {
        eprintln!("{}", message);
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut manifest_path: Option<PathBuf> = None;
    let mut output_dir: Option<PathBuf> = None;
    let mut added_files: Vec<(String, PathBuf)> = Vec::new();
    let mut added_symlinks: Vec<(String, String)> = Vec::new();
    let mut verbose = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-help" | "--help" => {
                println!("{}", USAGE);
                return Ok(());
            }
            "-manifest" => {
                manifest_path = Some(PathBuf::from(
                    args.next().ok_or("-manifest needs a path")?,
                ));
            }
            "-output" => {
                output_dir = Some(PathBuf::from(args.next().ok_or("-output needs a path")?));
            }
            "-add-file" => {
                let value = args.next().ok_or("-add-file needs cache-path=host-path")?;
                let (cache_path, host_path) = value
                    .split_once('=')
                    .ok_or("-add-file needs cache-path=host-path")?;
                added_files.push((cache_path.to_string(), PathBuf::from(host_path)));
            }
            "-add-symlink" => {
                let value = args.next().ok_or("-add-symlink needs link=target")?;
                let (link, target) = value.split_once('=').ok_or("-add-symlink needs link=target")?;
                added_symlinks.push((link.to_string(), target.to_string()));
            }
            "-verbose" => verbose = true,
            other => return Err(format!("Unknown argument {:?}\n{}", other, USAGE)),
        }
    }

    let manifest_path = manifest_path.ok_or_else(|| format!("No manifest\n{}", USAGE))?;
    let output_dir = output_dir.ok_or_else(|| format!("No output directory\n{}", USAGE))?;
    let manifest_bytes = std::fs::read(&manifest_path)
        .map_err(|e| format!("Could not read {}: {}", manifest_path.display(), e))?;
    let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| format!("Bad manifest: {}", e))?;
    if manifest.version > 1 {
        return Err(format!("Unsupported manifest version {}", manifest.version));
    }

    let mut fs = FileSystem::new();
    for (cache_path, host_path) in &added_files {
        let bytes = std::fs::read(host_path)
            .map_err(|e| format!("Could not read {}: {}", host_path.display(), e))?;
        let mtime = std::fs::metadata(host_path)
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        fs.add_file(cache_path, bytes, mtime);
    }
    for (link, target) in &added_symlinks {
        fs.add_symlink(link, target);
    }

    let files: Vec<InputFile> = manifest
        .files
        .iter()
        .map(|f| InputFile {
            path: f.path.clone(),
            must_be_included: f.must_be_included,
        })
        .collect();

    let read_order = |path: &Option<String>| -> Result<Vec<String>, String> {
        match path {
            None => Ok(Vec::new()),
            Some(path) => {
                let bytes =
                    std::fs::read(path).map_err(|e| format!("Could not read {}: {}", path, e))?;
                parse_order_file(&bytes[..])
            }
        }
    };
    let dylib_order = read_order(&manifest.dylib_order_file)?;
    let dirty_data_order = read_order(&manifest.dirty_data_order_file)?;

    std::fs::create_dir_all(&output_dir)
        .map_err(|e| format!("Could not create {}: {}", output_dir.display(), e))?;

    for arch in &manifest.archs {
        let options = CreateOptions {
            arch: arch.clone(),
            platform: manifest.platform,
            disposition: Disposition::from_name(&manifest.disposition)?,
            dylib_order: dylib_order.clone(),
            dirty_data_order: dirty_data_order.clone(),
            objc_optimizations: match &manifest.objc_optimizations_file {
                None => ObjcOptimizations::default(),
                Some(path) => {
                    let bytes = std::fs::read(path)
                        .map_err(|e| format!("Could not read {}: {}", path, e))?;
                    ObjcOptimizations::from_json(&bytes)?
                }
            },
            code_signing_digest_mode: match manifest.code_signing.as_deref() {
                Some("agile") => CodeSigningDigestMode::Agile,
                _ => CodeSigningDigestMode::Sha256Only,
            },
            evict_leaf_dylibs_on_overflow: manifest.evict_leaf_dylibs_on_overflow.unwrap_or(true),
            exclude_local_symbols: manifest.exclude_local_symbols.unwrap_or(false),
            optimize_for_size: manifest.optimize_for_size.unwrap_or(false),
            is_locally_built_cache: manifest.locally_built_cache.unwrap_or(false),
            dylibs_removed_from_disk: true,
            cache_supports_aslr: true,
            verbose,
        };

        let builder = SharedCacheBuilder::new(options)?;
        match builder.build(&files, &fs) {
            Ok(result) => {
                let base = output_dir.join(format!("dyld_shared_cache_{}", arch));
                write_output(&base, &result.cache.bytes)?;
                write_output(&base.with_extension("map"), result.map_file.as_bytes())?;
                write_output(&base.with_extension("json"), result.json_map.as_bytes())?;
                for warning in &result.warnings {
                    eprintln!("warning: {}", warning);
                }
                let cd_hash: String = result
                    .cache
                    .cd_hash
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect();
                println!("{}: cdHash {}", base.display(), cd_hash);
            }
            Err((message, warnings)) => {
                for warning in &warnings {
                    eprintln!("warning: {}", warning);
                }
                return Err(format!("{}: {}", arch, message));
            }
        }
    }
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<(), String> {
    std::fs::write(path, bytes).map_err(|e| format!("Could not write {}: {}", path.display(), e))
}
