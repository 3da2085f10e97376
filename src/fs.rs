/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Virtual input filesystem.
//!
//! The builder never touches the host filesystem directly: inputs are
//! registered up front as `(path, bytes)` pairs plus `(symlink, target)`
//! pairs, and looked up through this module. This keeps the pipeline
//! deterministic and lets tests feed synthetic binaries without touching
//! disk.
//!
//! Symlinks are resolved at lookup time (chains too, with a cycle bound), so
//! `/usr/lib/libstdc++.dylib -> libstdc++.6.dylib` and the real file resolve
//! to the same entry. The `(mtime, inode)` pair of each file is recorded in
//! the cache's image table so the loader can detect stale caches.

use std::collections::HashMap;

/// One registered regular file.
struct FileNode {
    bytes: Vec<u8>,
    mtime: u64,
    inode: u64,
}

/// The resolved result of a lookup.
pub struct FileInfo<'a> {
    pub bytes: &'a [u8],
    pub mtime: u64,
    pub inode: u64,
    /// Path after symlink resolution.
    pub real_path: &'a str,
}

#[derive(Default)]
pub struct FileSystem {
    files: HashMap<String, FileNode>,
    symlinks: HashMap<String, String>,
    next_inode: u64,
}

impl FileSystem {
    pub fn new() -> FileSystem {
        FileSystem {
            files: HashMap::new(),
            symlinks: HashMap::new(),
            next_inode: 1,
        }
    }

    /// Register a regular file. A synthetic inode is assigned in registration
    /// order so identical input sets produce identical caches.
    pub fn add_file(&mut self, path: &str, bytes: Vec<u8>, mtime: u64) {
        let inode = self.next_inode;
        self.next_inode += 1;
        self.files.insert(
            path.to_string(),
            FileNode {
                bytes,
                mtime,
                inode,
            },
        );
    }

    /// Register a symlink. `target` may be absolute or relative to the
    /// symlink's directory.
    pub fn add_symlink(&mut self, path: &str, target: &str) {
        self.symlinks.insert(path.to_string(), target.to_string());
    }

    fn resolve_target(link_path: &str, target: &str) -> String {
        if target.starts_with('/') {
            return target.to_string();
        }
        let dir = match link_path.rfind('/') {
            Some(idx) => &link_path[..idx],
            None => "",
        };
        let mut components: Vec<&str> = dir.split('/').filter(|c| !c.is_empty()).collect();
        for component in target.split('/') {
            match component {
                "" | "." => (),
                ".." => {
                    components.pop();
                }
                other => components.push(other),
            }
        }
        let mut resolved = String::new();
        for component in components {
            resolved.push('/');
            resolved.push_str(component);
        }
        resolved
    }

    /// Follow symlinks (bounded, in case of cycles) until a real path is
    /// found, without requiring the final file to exist.
    pub fn resolve_path<'a>(&'a self, path: &'a str) -> &'a str {
        let mut current = path.to_string();
        for _ in 0..32 {
            match self.symlinks.get(&current) {
                Some(target) => current = Self::resolve_target(&current, target),
                None => break,
            }
        }
        // Find the owned key so the lifetime is tied to self, not the loop.
        if let Some((key, _)) = self.files.get_key_value(current.as_str()) {
            key
        } else if let Some((key, _)) = self.symlinks.get_key_value(path) {
            // Dangling symlink: report the link itself.
            key
        } else {
            path
        }
    }

    /// Look up a file, following symlinks.
    pub fn load_file(&self, path: &str) -> Result<FileInfo<'_>, String> {
        let real_path = self.resolve_path(path);
        match self.files.get_key_value(real_path) {
            Some((key, node)) => Ok(FileInfo {
                bytes: &node.bytes,
                mtime: node.mtime,
                inode: node.inode,
                real_path: key,
            }),
            None => Err(format!("File not found: {}", path)),
        }
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.files.contains_key(self.resolve_path(path))
    }

    /// All symlinks whose (resolved) target is the given path.
    pub fn aliases_of(&self, path: &str) -> Vec<&str> {
        let mut aliases: Vec<&str> = self
            .symlinks
            .keys()
            .filter(|link| link.as_str() != path && self.resolve_path(link) == path)
            .map(|s| s.as_str())
            .collect();
        aliases.sort_unstable();
        aliases
    }
}

#[cfg(test)]
mod tests {
    use super::FileSystem;

    #[test]
    fn absolute_and_relative_symlinks() {
        let mut fs = FileSystem::new();
        fs.add_file("/usr/lib/libstdc++.6.dylib", vec![1, 2, 3], 1234);
        fs.add_symlink("/usr/lib/libstdc++.dylib", "libstdc++.6.dylib");
        fs.add_symlink("/other/link.dylib", "/usr/lib/libstdc++.6.dylib");

        let a = fs.load_file("/usr/lib/libstdc++.dylib").unwrap();
        assert_eq!(a.real_path, "/usr/lib/libstdc++.6.dylib");
        assert_eq!(a.bytes, &[1, 2, 3]);

        let b = fs.load_file("/other/link.dylib").unwrap();
        assert_eq!(b.inode, a.inode);
    }

    #[test]
    fn symlink_chains_terminate() {
        let mut fs = FileSystem::new();
        fs.add_symlink("/a", "/b");
        fs.add_symlink("/b", "/a");
        assert!(fs.load_file("/a").is_err());
    }

    #[test]
    fn alias_listing() {
        let mut fs = FileSystem::new();
        fs.add_file("/usr/lib/libz.1.dylib", vec![0], 0);
        fs.add_symlink("/usr/lib/libz.dylib", "libz.1.dylib");
        assert_eq!(fs.aliases_of("/usr/lib/libz.1.dylib"), vec!["/usr/lib/libz.dylib"]);
    }

    #[test]
    fn dot_dot_components() {
        let mut fs = FileSystem::new();
        fs.add_file("/usr/lib/libm.dylib", vec![9], 0);
        fs.add_symlink("/usr/local/lib/libm.dylib", "../../lib/libm.dylib");
        assert!(fs.load_file("/usr/local/lib/libm.dylib").is_ok());
    }
}
