//! In-memory inode cache: for every inode, the chain of node locations
//! belonging to it, newest first.
//!
//! The cache exists so GC and deletion can find and rewrite node positions
//! without consulting the (external) node index. It has its own lock in the
//! filesystem, below the completion lock in the ordering, and is only ever
//! taken on its own.

use std::collections::HashMap;

/// Location of one node on flash, as held in an inode's chain
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CachedNode {
    pub version: u32,
    pub offset: u32,
    pub len: u32,
}

#[derive(Debug, Default)]
struct InodeChain {
    /// Newest first; versions strictly decrease down the chain
    nodes: Vec<CachedNode>,
}

#[derive(Debug, Default)]
pub struct InodeCache {
    inodes: HashMap<u32, InodeChain>,
    highest_ino: u32,
}

impl InodeCache {
    /// Inode numbers in use are never reissued within a mount
    pub fn next_ino(&mut self) -> u32 {
        self.highest_ino += 1;
        self.highest_ino
    }

    pub fn highest_ino(&self) -> u32 {
        self.highest_ino
    }

    /// Record a new node for `ino`. Versions normally arrive in increasing
    /// order (writes); out-of-order arrival happens during mount scan and is
    /// handled by insertion.
    pub fn add_node(&mut self, ino: u32, node: CachedNode) {
        self.highest_ino = self.highest_ino.max(ino);
        let chain = self.inodes.entry(ino).or_default();
        let pos = chain
            .nodes
            .partition_point(|n| n.version > node.version);
        chain.nodes.insert(pos, node);
    }

    /// Forget the node at `offset` (it has been obsoleted on flash)
    pub fn drop_node(&mut self, ino: u32, offset: u32) {
        if let Some(chain) = self.inodes.get_mut(&ino) {
            chain.nodes.retain(|n| n.offset != offset);
            if chain.nodes.is_empty() {
                self.inodes.remove(&ino);
            }
        }
    }

    /// GC moved a node: same version, new home
    pub fn relocate(&mut self, ino: u32, old_offset: u32, new_offset: u32) {
        if let Some(chain) = self.inodes.get_mut(&ino) {
            if let Some(node) = chain.nodes.iter_mut().find(|n| n.offset == old_offset) {
                node.offset = new_offset;
            }
        }
    }

    /// The most recent node for `ino`, if it exists at all
    pub fn latest(&self, ino: u32) -> Option<CachedNode> {
        self.inodes.get(&ino)?.nodes.first().copied()
    }

    /// All node locations for `ino`, newest first
    pub fn nodes(&self, ino: u32) -> &[CachedNode] {
        self.inodes
            .get(&ino)
            .map(|c| c.nodes.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, ino: u32) -> bool {
        self.inodes.contains_key(&ino)
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(version: u32, offset: u32) -> CachedNode {
        CachedNode {
            version,
            offset,
            len: 64,
        }
    }

    #[test]
    fn chains_order_newest_first() {
        let mut cache = InodeCache::default();
        cache.add_node(7, node(1, 0));
        cache.add_node(7, node(3, 200));
        cache.add_node(7, node(2, 100));

        let versions: Vec<u32> = cache.nodes(7).iter().map(|n| n.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
        assert_eq!(cache.latest(7), Some(node(3, 200)));
    }

    #[test]
    fn drop_and_relocate() {
        let mut cache = InodeCache::default();
        cache.add_node(1, node(1, 0));
        cache.add_node(1, node(2, 100));

        cache.relocate(1, 0, 0x8000);
        assert_eq!(cache.nodes(1)[1].offset, 0x8000);

        cache.drop_node(1, 0x8000);
        cache.drop_node(1, 100);
        assert!(!cache.contains(1));
    }

    #[test]
    fn ino_allocation_skips_scanned_inodes() {
        let mut cache = InodeCache::default();
        cache.add_node(12, node(1, 0));
        assert_eq!(cache.next_ino(), 13);
    }
}
