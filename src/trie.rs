/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Export-trie construction.
//!
//! The same prefix-compressed trie format serves two masters: each dylib's
//! rewritten export trie, and the cache-wide path trie mapping install names
//! (and their symlink aliases) to image indices. Nodes are emitted
//! depth-first; child offsets are ulebs whose byte length depends on the
//! offsets themselves, so sizing loops until it reaches a fixpoint.

use crate::endian::append_uleb128;

/// One entry: a full key and its terminal payload (already-encoded uleb
/// sequence, e.g. flags + address).
pub struct TrieEntry {
    pub name: String,
    pub payload: Vec<u8>,
}

struct Node {
    /// Edge label leading here from the parent.
    edge: Vec<u8>,
    payload: Option<Vec<u8>>,
    children: Vec<Node>,
    /// Assigned offset of this node in the emitted trie.
    offset: usize,
}

impl Node {
    fn new(edge: &[u8]) -> Node {
        Node {
            edge: edge.to_vec(),
            payload: None,
            children: Vec::new(),
            offset: 0,
        }
    }

    fn insert(&mut self, key: &[u8], payload: Vec<u8>) {
        if key.is_empty() {
            self.payload = Some(payload);
            return;
        }
        for child in &mut self.children {
            let common = common_prefix_len(&child.edge, key);
            if common == 0 {
                continue;
            }
            if common < child.edge.len() {
                // Split the edge: insert an intermediate node.
                let mut bottom = Node::new(&child.edge[common..]);
                bottom.payload = child.payload.take();
                bottom.children = std::mem::take(&mut child.children);
                child.edge.truncate(common);
                child.children.push(bottom);
            }
            child.insert(&key[common..], payload);
            return;
        }
        let mut leaf = Node::new(key);
        leaf.payload = Some(payload);
        self.children.push(leaf);
    }

    /// The size this node will occupy, given current child offsets.
    fn emit(&self, out: &mut Vec<u8>) {
        match &self.payload {
            Some(payload) => {
                append_uleb128(out, payload.len() as u64);
                out.extend_from_slice(payload);
            }
            None => out.push(0),
        }
        out.push(self.children.len() as u8);
        for child in &self.children {
            out.extend_from_slice(&child.edge);
            out.push(0);
            append_uleb128(out, child.offset as u64);
        }
    }

    fn for_each_mut(&mut self, f: &mut impl FnMut(&mut Node)) {
        f(self);
        for child in &mut self.children {
            child.for_each_mut(f);
        }
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Build the trie bytes for a set of entries. Entries are inserted in sorted
/// order so the output is deterministic.
pub fn build_trie(entries: &[TrieEntry]) -> Vec<u8> {
    let mut sorted: Vec<&TrieEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut root = Node::new(&[]);
    for entry in sorted {
        root.insert(entry.name.as_bytes(), entry.payload.clone());
    }

    // Iterate offset assignment until stable: uleb child offsets can grow a
    // node, pushing later nodes further out.
    loop {
        let mut changed = false;
        let mut offset = 0usize;
        root.for_each_mut(&mut |node| {
            if node.offset != offset {
                node.offset = offset;
                changed = true;
            }
            let mut scratch = Vec::new();
            node.emit(&mut scratch);
            offset += scratch.len();
        });
        if !changed {
            break;
        }
    }

    let mut out = Vec::new();
    root.for_each_mut(&mut |node| {
        debug_assert_eq!(node.offset, out.len());
        let mut scratch = Vec::new();
        node.emit(&mut scratch);
        out.extend_from_slice(&scratch);
    });
    out
}

/// Encode a plain export payload: flags then address.
pub fn export_payload(flags: u64, address: u64) -> Vec<u8> {
    let mut payload = Vec::new();
    append_uleb128(&mut payload, flags);
    append_uleb128(&mut payload, address);
    payload
}

/// Encode a stub-and-resolver payload.
pub fn export_payload_with_resolver(flags: u64, stub: u64, resolver: u64) -> Vec<u8> {
    let mut payload = Vec::new();
    append_uleb128(&mut payload, flags);
    append_uleb128(&mut payload, stub);
    append_uleb128(&mut payload, resolver);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_all(trie: &[u8]) -> Vec<(String, u64, u64)> {
        let mut result = Vec::new();
        let mut name = Vec::new();
        walk(trie, 0, &mut name, &mut result);
        result
    }

    fn walk(trie: &[u8], offset: usize, name: &mut Vec<u8>, out: &mut Vec<(String, u64, u64)>) {
        let mut pos = offset;
        let terminal = crate::endian::read_uleb128(trie, &mut pos).unwrap();
        if terminal != 0 {
            let mut t = pos;
            let flags = crate::endian::read_uleb128(trie, &mut t).unwrap();
            let addr = crate::endian::read_uleb128(trie, &mut t).unwrap();
            out.push((String::from_utf8(name.clone()).unwrap(), flags, addr));
        }
        let mut pos = pos + terminal as usize;
        let count = trie[pos];
        pos += 1;
        for _ in 0..count {
            let start = name.len();
            while trie[pos] != 0 {
                name.push(trie[pos]);
                pos += 1;
            }
            pos += 1;
            let child = crate::endian::read_uleb128(trie, &mut pos).unwrap();
            walk(trie, child as usize, name, out);
            name.truncate(start);
        }
    }

    #[test]
    fn shared_prefixes_compress() {
        let entries = vec![
            TrieEntry {
                name: "_foo".to_string(),
                payload: export_payload(0, 0x1000),
            },
            TrieEntry {
                name: "_foobar".to_string(),
                payload: export_payload(0, 0x2000),
            },
            TrieEntry {
                name: "_bar".to_string(),
                payload: export_payload(0, 0x3000),
            },
        ];
        let trie = build_trie(&entries);
        let mut found = lookup_all(&trie);
        found.sort();
        assert_eq!(
            found,
            vec![
                ("_bar".to_string(), 0, 0x3000),
                ("_foo".to_string(), 0, 0x1000),
                ("_foobar".to_string(), 0, 0x2000),
            ]
        );
    }

    #[test]
    fn empty_trie() {
        let trie = build_trie(&[]);
        assert!(lookup_all(&trie).is_empty());
        assert_eq!(trie[0], 0); // no terminal at root
        assert_eq!(trie[1], 0); // no children
    }

    #[test]
    fn large_offsets_stabilize() {
        // Enough entries that child offsets need multi-byte ulebs.
        let entries: Vec<TrieEntry> = (0..300)
            .map(|i| TrieEntry {
                name: format!("_symbol_with_a_rather_long_name_{:04}", i),
                payload: export_payload(0, 0x1000 + i),
            })
            .collect();
        let trie = build_trie(&entries);
        let found = lookup_all(&trie);
        assert_eq!(found.len(), 300);
        for (name, _, addr) in found {
            let i: u64 = name.rsplit('_').next().unwrap().parse().unwrap();
            assert_eq!(addr, 0x1000 + i);
        }
    }
}
