/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! cachebuilder produces dyld shared caches: one contiguous, memory-mappable
//! image in which a set of dylibs has been laid out at stable addresses,
//! pre-bound to each other, pre-rebased for a known base address, and
//! ad-hoc code-signed.
//!
//! The pipeline runs in fixed stages: input filtering, Objective-C selector
//! placement, text coalescing, layout planning (with leaf eviction on
//! overflow), per-dylib segment adjustment, link-edit merging, slide-info
//! emission, and code signing. [builder::SharedCacheBuilder] drives them;
//! everything else is a stage.

#[macro_use]
mod log;

pub mod adjust;
pub mod arch;
pub mod aslr;
pub mod builder;
pub mod cache_format;
pub mod coalesce;
pub mod codesign;
pub mod diagnostics;
pub mod endian;
pub mod fs;
pub mod inputs;
pub mod layout;
pub mod linkedit;
pub mod mach_o;
pub mod objc;
pub mod options;
pub mod slide_info;
pub mod trie;

pub use builder::{BuildResult, CacheFile, SharedCacheBuilder};
pub use fs::FileSystem;
pub use inputs::InputFile;
pub use options::CreateOptions;
