//! The per-device index of directory, file and data blocks.
//!
//! The tree maps hashed serial numbers to chains of nodes through three
//! fixed-width bucket arrays, and keeps the erased and bad blocks of the
//! partition on doubly linked lists rooted in the tree itself. All nodes
//! live in the [`NodePool`]; the tree stores nothing but 16-bit indices.
//!
//! The enclosing file system mutates the tree as flash operations report
//! new, erased and bad blocks, always under the device lock. None of the
//! operations here suspend or touch the flash.

use crate::error_fs::TreeError;
use crate::pool::{DataInfo, DirInfo, FileInfo, NodePayload, NodePool};
use nandfs_api::types::{DATA_NODE_ENTRIES, DIR_NODE_ENTRIES, EMPTY, FILE_NODE_ENTRIES};
use tracing::error;

/// The three node classes kept in hash buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    /// Directory nodes, hashed by serial
    Dir,
    /// File nodes, hashed by serial
    File,
    /// Data nodes, hashed by the parent serial
    Data,
}

impl NodeClass {
    /// All classes, in the order they are serialized
    pub const ALL: [NodeClass; 3] = [NodeClass::Dir, NodeClass::File, NodeClass::Data];

    /// Number of buckets of this class
    pub fn bucket_len(self) -> usize {
        match self {
            NodeClass::Dir => DIR_NODE_ENTRIES,
            NodeClass::File => FILE_NODE_ENTRIES,
            NodeClass::Data => DATA_NODE_ENTRIES,
        }
    }
}

/// Bucket index for a directory serial number
pub fn dir_hash(serial: u16) -> usize {
    serial as usize % DIR_NODE_ENTRIES
}

/// Bucket index for a file serial number
pub fn file_hash(serial: u16) -> usize {
    serial as usize % FILE_NODE_ENTRIES
}

/// Bucket index for a data node, keyed by its parent serial
pub fn data_hash(parent: u16) -> usize {
    parent as usize % DATA_NODE_ENTRIES
}

/// An erased block taken off the erased list, with its node still
/// allocated. The caller either attaches the node under a new role or
/// releases it back to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErasedBlock {
    /// Pool slot of the node
    pub index: u16,
    /// The erased block number
    pub block: u16,
    /// Must the spare area be re-read before the block is reused?
    pub need_check: bool,
}

/// The device tree: bucket heads, list heads and the node pool of one
/// partition
#[derive(Debug, Clone)]
pub struct Tree {
    pool: NodePool,
    dir_entry: [u16; DIR_NODE_ENTRIES],
    file_entry: [u16; FILE_NODE_ENTRIES],
    data_entry: [u16; DATA_NODE_ENTRIES],
    erased: u16,
    erased_tail: u16,
    erased_count: u16,
    bad: u16,
    bad_count: u16,
}

fn fatal(msg: &'static str) -> TreeError {
    error!("{}", msg);
    TreeError::Fatal(msg)
}

impl Tree {
    /// Create the tree of an empty device with `capacity` pool slots
    /// (one per partition block)
    pub fn new(capacity: u16) -> Tree {
        Tree {
            pool: NodePool::new(capacity),
            dir_entry: [EMPTY; DIR_NODE_ENTRIES],
            file_entry: [EMPTY; FILE_NODE_ENTRIES],
            data_entry: [EMPTY; DATA_NODE_ENTRIES],
            erased: EMPTY,
            erased_tail: EMPTY,
            erased_count: 0,
            bad: EMPTY,
            bad_count: 0,
        }
    }

    /// Reinitialize to the empty-device state: every bucket head `EMPTY`,
    /// both lists empty, every pool slot back on the free chain in index
    /// order. Idempotent; also run after a failed deserialize
    pub fn reset(&mut self) {
        self.pool.reset();
        self.dir_entry = [EMPTY; DIR_NODE_ENTRIES];
        self.file_entry = [EMPTY; FILE_NODE_ENTRIES];
        self.data_entry = [EMPTY; DATA_NODE_ENTRIES];
        self.erased = EMPTY;
        self.erased_tail = EMPTY;
        self.erased_count = 0;
        self.bad = EMPTY;
        self.bad_count = 0;
    }

    /// Number of pool slots (= partition block count)
    pub fn capacity(&self) -> u16 {
        self.pool.capacity()
    }

    /// Shared access to the node pool
    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    pub(crate) fn pool_mut(&mut self) -> &mut NodePool {
        &mut self.pool
    }

    /// The bucket head array of one node class
    pub fn bucket_heads(&self, class: NodeClass) -> &[u16] {
        match class {
            NodeClass::Dir => &self.dir_entry,
            NodeClass::File => &self.file_entry,
            NodeClass::Data => &self.data_entry,
        }
    }

    fn bucket_heads_mut(&mut self, class: NodeClass) -> &mut [u16] {
        match class {
            NodeClass::Dir => &mut self.dir_entry,
            NodeClass::File => &mut self.file_entry,
            NodeClass::Data => &mut self.data_entry,
        }
    }

    pub(crate) fn set_bucket_head(&mut self, class: NodeClass, hash: usize, head: u16) {
        self.bucket_heads_mut(class)[hash] = head;
    }

    pub(crate) fn set_erased_state(&mut self, head: u16, tail: u16, count: u16) {
        self.erased = head;
        self.erased_tail = tail;
        self.erased_count = count;
    }

    pub(crate) fn set_bad_state(&mut self, head: u16, count: u16) {
        self.bad = head;
        self.bad_count = count;
    }

    /// Head of the erased list, `EMPTY` when no block is erased
    pub fn erased_head(&self) -> u16 {
        self.erased
    }

    /// Tail of the erased list
    pub fn erased_tail(&self) -> u16 {
        self.erased_tail
    }

    /// Number of nodes on the erased list
    pub fn erased_count(&self) -> u16 {
        self.erased_count
    }

    /// Head of the bad list, `EMPTY` when no block is bad
    pub fn bad_head(&self) -> u16 {
        self.bad
    }

    /// Number of nodes on the bad list
    pub fn bad_count(&self) -> u16 {
        self.bad_count
    }

    /// Take a loose node off the free chain.
    /// Fails with `Exhausted` when the pool is out of slots; the caller
    /// must erase or evict before retrying
    pub fn alloc_node(&mut self) -> Result<u16, TreeError> {
        Ok(self.pool.alloc()?)
    }

    /// Return a loose node to the free chain
    pub fn release_node(&mut self, index: u16) -> Result<(), TreeError> {
        Ok(self.pool.free(index)?)
    }

    // ------ bucket operations ------

    /// Give a loose node the directory role and splice it at the head of
    /// its bucket
    pub fn attach_dir(&mut self, index: u16, dir: DirInfo) -> Result<(), TreeError> {
        self.pool.get_mut(index)?.payload = NodePayload::Dir(dir);
        self.insert_into_bucket(index, NodeClass::Dir, dir_hash(dir.serial))
    }

    /// Give a loose node the file role and splice it at the head of its
    /// bucket
    pub fn attach_file(&mut self, index: u16, file: FileInfo) -> Result<(), TreeError> {
        self.pool.get_mut(index)?.payload = NodePayload::File(file);
        self.insert_into_bucket(index, NodeClass::File, file_hash(file.serial))
    }

    /// Give a loose node the data role and splice it at the head of its
    /// bucket (keyed by the parent serial)
    pub fn attach_data(&mut self, index: u16, data: DataInfo) -> Result<(), TreeError> {
        self.pool.get_mut(index)?.payload = NodePayload::Data(data);
        self.insert_into_bucket(index, NodeClass::Data, data_hash(data.parent))
    }

    /// Unlink a node from its bucket and return the slot to the free chain
    pub fn detach(&mut self, index: u16) -> Result<(), TreeError> {
        self.remove_from_bucket(index)?;
        Ok(self.pool.free(index)?)
    }

    fn insert_into_bucket(
        &mut self,
        index: u16,
        class: NodeClass,
        hash: usize,
    ) -> Result<(), TreeError> {
        let old_head = self.bucket_heads(class)[hash];
        {
            let node = self.pool.get_mut(index)?;
            node.hash_prev = EMPTY;
            node.hash_next = old_head;
        }
        if old_head != EMPTY {
            self.pool.get_mut(old_head)?.hash_prev = index;
        }
        self.bucket_heads_mut(class)[hash] = index;
        Ok(())
    }

    fn remove_from_bucket(&mut self, index: u16) -> Result<(), TreeError> {
        let (class, hash) = self.node_bucket(index)?;
        let (prev, next) = {
            let node = self.pool.get(index)?;
            (node.hash_prev, node.hash_next)
        };
        if prev == EMPTY {
            if self.bucket_heads(class)[hash] != index {
                return Err(fatal("chain head does not match its bucket"));
            }
            self.bucket_heads_mut(class)[hash] = next;
        } else {
            self.pool.get_mut(prev)?.hash_next = next;
        }
        if next != EMPTY {
            self.pool.get_mut(next)?.hash_prev = prev;
        }
        let node = self.pool.get_mut(index)?;
        node.hash_prev = EMPTY;
        node.hash_next = EMPTY;
        Ok(())
    }

    /// Which bucket owns this node, derived from its payload
    fn node_bucket(&self, index: u16) -> Result<(NodeClass, usize), TreeError> {
        match self.pool.get(index)?.payload {
            NodePayload::Dir(d) => Ok((NodeClass::Dir, dir_hash(d.serial))),
            NodePayload::File(f) => Ok((NodeClass::File, file_hash(f.serial))),
            NodePayload::Data(d) => Ok((NodeClass::Data, data_hash(d.parent))),
            _ => Err(fatal("node is not in any bucket")),
        }
    }

    fn find_in_chain<P>(&self, class: NodeClass, hash: usize, pred: P) -> Option<u16>
    where
        P: Fn(&NodePayload) -> bool,
    {
        let mut cur = self.bucket_heads(class)[hash];
        let mut steps = 0u32;
        while cur != EMPTY {
            if steps > self.pool.capacity() as u32 {
                error!("bucket chain walk exceeded the pool capacity");
                return None;
            }
            let node = match self.pool.get(cur) {
                Ok(n) => n,
                Err(_) => {
                    error!(index = cur, "bucket chain links an index outside the pool");
                    return None;
                }
            };
            if pred(&node.payload) {
                return Some(cur);
            }
            cur = node.hash_next;
            steps += 1;
        }
        None
    }

    /// Look up a directory node by serial number
    pub fn find_dir(&self, serial: u16) -> Option<u16> {
        self.find_in_chain(NodeClass::Dir, dir_hash(serial), |p| {
            matches!(p, NodePayload::Dir(d) if d.serial == serial)
        })
    }

    /// Look up a file node by serial number
    pub fn find_file(&self, serial: u16) -> Option<u16> {
        self.find_in_chain(NodeClass::File, file_hash(serial), |p| {
            matches!(p, NodePayload::File(f) if f.serial == serial)
        })
    }

    /// Look up a data node by its owner's serial and its serial within the
    /// owner
    pub fn find_data(&self, parent: u16, serial: u16) -> Option<u16> {
        self.find_in_chain(NodeClass::Data, data_hash(parent), |p| {
            matches!(p, NodePayload::Data(d) if d.parent == parent && d.serial == serial)
        })
    }

    /// Visit every data node whose parent matches.
    /// The callback receives the node index and the data payload; chain
    /// order is bucket order, so no ordering may be assumed
    pub fn for_each_child<F>(&self, parent: u16, mut f: F)
    where
        F: FnMut(u16, &DataInfo),
    {
        let mut cur = self.data_entry[data_hash(parent)];
        let mut steps = 0u32;
        while cur != EMPTY && steps <= self.pool.capacity() as u32 {
            let node = match self.pool.get(cur) {
                Ok(n) => n,
                Err(_) => return,
            };
            if let NodePayload::Data(d) = &node.payload {
                if d.parent == parent {
                    f(cur, d);
                }
            }
            cur = node.hash_next;
            steps += 1;
        }
    }

    // ------ erased and bad lists ------

    /// Record a freshly erased block: allocate a node and append it at the
    /// tail of the erased list (O(1) through the tail pointer)
    pub fn append_erased(&mut self, block: u16, need_check: bool) -> Result<u16, TreeError> {
        let index = self.pool.alloc()?;
        let tail = self.erased_tail;
        self.pool.get_mut(index)?.payload = NodePayload::Erased {
            block,
            need_check: need_check as u8,
            prev: tail,
            next: EMPTY,
        };
        if tail == EMPTY {
            self.erased = index;
        } else {
            match &mut self.pool.get_mut(tail)?.payload {
                NodePayload::Erased { next, .. } => *next = index,
                _ => return Err(fatal("erased tail is not an erased node")),
            }
        }
        self.erased_tail = index;
        self.erased_count += 1;
        Ok(index)
    }

    /// Take the oldest erased block off the list, for reuse as a fresh
    /// write target. The node stays allocated; attach it under its new
    /// role or release it
    pub fn pop_erased(&mut self) -> Result<ErasedBlock, TreeError> {
        let head = self.erased;
        if head == EMPTY {
            return Err(TreeError::NotFound("no erased block available"));
        }
        let (block, need_check) = match self.pool.get(head)?.payload {
            NodePayload::Erased {
                block, need_check, ..
            } => (block, need_check),
            _ => return Err(fatal("erased head is not an erased node")),
        };
        self.unlink_erased(head)?;
        Ok(ErasedBlock {
            index: head,
            block,
            need_check: need_check != 0,
        })
    }

    fn unlink_erased(&mut self, index: u16) -> Result<(), TreeError> {
        let (prev, next) = match self.pool.get(index)?.payload {
            NodePayload::Erased { prev, next, .. } => (prev, next),
            _ => return Err(fatal("tried to unlink a non-erased node from the erased list")),
        };
        if prev == EMPTY {
            self.erased = next;
        } else {
            match &mut self.pool.get_mut(prev)?.payload {
                NodePayload::Erased { next: n, .. } => *n = next,
                _ => return Err(fatal("erased list links a non-erased node")),
            }
        }
        if next == EMPTY {
            self.erased_tail = prev;
        } else {
            match &mut self.pool.get_mut(next)?.payload {
                NodePayload::Erased { prev: p, .. } => *p = prev,
                _ => return Err(fatal("erased list links a non-erased node")),
            }
        }
        self.erased_count -= 1;
        Ok(())
    }

    /// Record a bad block on a fresh node.
    /// The bad list only ever grows at runtime; blocks leave it when the
    /// device is reformatted, which rebuilds the whole tree
    pub fn append_bad(&mut self, block: u16) -> Result<u16, TreeError> {
        let index = self.pool.alloc()?;
        self.push_bad_node(index, block)?;
        Ok(index)
    }

    fn push_bad_node(&mut self, index: u16, block: u16) -> Result<(), TreeError> {
        let old_head = self.bad;
        {
            let node = self.pool.get_mut(index)?;
            node.hash_prev = EMPTY;
            node.hash_next = EMPTY;
            node.payload = NodePayload::Bad {
                block,
                prev: EMPTY,
                next: old_head,
            };
        }
        if old_head != EMPTY {
            match &mut self.pool.get_mut(old_head)?.payload {
                NodePayload::Bad { prev, .. } => *prev = index,
                _ => return Err(fatal("bad list head is not a bad node")),
            }
        }
        self.bad = index;
        self.bad_count += 1;
        Ok(())
    }

    /// Move a tracked block onto the bad list, wherever it currently
    /// lives. The erased list is searched first: a block is most often
    /// found bad when an erase on it fails
    pub fn mark_bad(&mut self, block: u16) -> Result<(), TreeError> {
        if let Some(index) = self.find_erased(block) {
            self.unlink_erased(index)?;
            return self.push_bad_node(index, block);
        }
        if let Some(index) = self.find_block_in_buckets(block) {
            self.remove_from_bucket(index)?;
            return self.push_bad_node(index, block);
        }
        Err(TreeError::NotFound("block is not tracked by the tree"))
    }

    fn find_erased(&self, block: u16) -> Option<u16> {
        let mut cur = self.erased;
        let mut steps = 0u32;
        while cur != EMPTY && steps <= self.pool.capacity() as u32 {
            match self.pool.get(cur).ok()?.payload {
                NodePayload::Erased {
                    block: b, next, ..
                } => {
                    if b == block {
                        return Some(cur);
                    }
                    cur = next;
                }
                _ => return None,
            }
            steps += 1;
        }
        None
    }

    fn find_block_in_buckets(&self, block: u16) -> Option<u16> {
        for &class in NodeClass::ALL.iter() {
            for hash in 0..class.bucket_len() {
                let hit = self.find_in_chain(class, hash, |p| match p {
                    NodePayload::Dir(d) => d.block == block,
                    NodePayload::File(f) => f.block == block,
                    NodePayload::Data(d) => d.block == block,
                    _ => false,
                });
                if hit.is_some() {
                    return hit;
                }
            }
        }
        None
    }

    // ------ walks and consistency checks ------

    /// Collect `(block, need_check)` of every erased node in list order.
    /// Fails with `Fatal` if the list is malformed
    pub fn walk_erased(&self) -> Result<Vec<(u16, bool)>, TreeError> {
        let mut out = Vec::new();
        let mut cur = self.erased;
        while cur != EMPTY {
            if out.len() >= self.pool.capacity() as usize {
                return Err(fatal("erased list walk exceeded the pool capacity"));
            }
            match self.pool.get(cur)?.payload {
                NodePayload::Erased {
                    block,
                    need_check,
                    next,
                    ..
                } => {
                    out.push((block, need_check != 0));
                    cur = next;
                }
                _ => return Err(fatal("erased list links a non-erased node")),
            }
        }
        Ok(out)
    }

    /// Collect the block number of every bad node in list order
    pub fn walk_bad(&self) -> Result<Vec<u16>, TreeError> {
        let mut out = Vec::new();
        let mut cur = self.bad;
        while cur != EMPTY {
            if out.len() >= self.pool.capacity() as usize {
                return Err(fatal("bad list walk exceeded the pool capacity"));
            }
            match self.pool.get(cur)?.payload {
                NodePayload::Bad { block, next, .. } => {
                    out.push(block);
                    cur = next;
                }
                _ => return Err(fatal("bad list links a non-bad node")),
            }
        }
        Ok(out)
    }

    /// Collect the payloads of one bucket chain, head first
    pub fn chain_payloads(&self, class: NodeClass, hash: usize) -> Vec<NodePayload> {
        let mut out = Vec::new();
        let mut cur = self.bucket_heads(class)[hash];
        while cur != EMPTY && out.len() <= self.pool.capacity() as usize {
            match self.pool.get(cur) {
                Ok(node) => {
                    out.push(node.payload);
                    cur = node.hash_next;
                }
                Err(_) => break,
            }
        }
        out
    }

    /// Number of nodes currently held in buckets (live blocks with data)
    pub fn live_node_count(&self) -> u32 {
        let mut count = 0u32;
        for &class in NodeClass::ALL.iter() {
            for hash in 0..class.bucket_len() {
                count += self.chain_payloads(class, hash).len() as u32;
            }
        }
        count
    }

    /// Verify every bucket chain: each node's payload belongs to the
    /// bucket's class, each back pointer matches the forward pointer that
    /// led to the node, and no chain runs longer than the pool. This is
    /// the structural check the deserializer runs as its second pass
    pub fn buckets_consistent(&self) -> bool {
        let mut visited = 0u32;
        for &class in NodeClass::ALL.iter() {
            for hash in 0..class.bucket_len() {
                let mut prev = EMPTY;
                let mut cur = self.bucket_heads(class)[hash];
                while cur != EMPTY {
                    visited += 1;
                    if visited > self.pool.capacity() as u32 {
                        return false;
                    }
                    let node = match self.pool.get(cur) {
                        Ok(n) => n,
                        Err(_) => return false,
                    };
                    let class_ok = match node.payload {
                        NodePayload::Dir(d) => {
                            class == NodeClass::Dir && dir_hash(d.serial) == hash
                        }
                        NodePayload::File(f) => {
                            class == NodeClass::File && file_hash(f.serial) == hash
                        }
                        NodePayload::Data(d) => {
                            class == NodeClass::Data && data_hash(d.parent) == hash
                        }
                        _ => false,
                    };
                    if !class_ok || node.hash_prev != prev {
                        return false;
                    }
                    prev = cur;
                    cur = node.hash_next;
                }
            }
        }
        true
    }
}

#[cfg(test)]
#[path = "../../api/fs-tests/tree_test.rs"]
mod tests;
