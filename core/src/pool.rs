//! Fixed-capacity arena of tree nodes.
//!
//! The pool owns one uniform slot per block of the partition; a node's
//! location in the pool is its identity, exposed as a 16-bit index. Free
//! slots are chained through their own payload, so the pool needs no side
//! allocation of any kind. Indices double as the on-disk identity of a
//! node, which is what lets the serializer perform a structural copy
//! instead of a translation.

use crate::error_fs::PoolError;
use nandfs_api::types::EMPTY;
use std::mem;
use tracing::error;

/// Identity of a directory block held in the tree
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DirInfo {
    /// Block number holding the directory
    pub block: u16,
    /// Checksum of the directory name
    pub checksum: u16,
    /// Serial number of the parent directory
    pub parent: u16,
    /// Serial number of this directory
    pub serial: u16,
}

/// Identity of a file header block held in the tree
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Block number holding the file header
    pub block: u16,
    /// Checksum of the file name
    pub checksum: u16,
    /// Serial number of the parent directory
    pub parent: u16,
    /// Serial number of this file
    pub serial: u16,
    /// File length in bytes
    pub len: u32,
}

/// Identity of a file data block held in the tree
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DataInfo {
    /// Block number holding the data
    pub block: u16,
    /// Serial number of the owning file or directory
    pub parent: u16,
    /// Serial number of this data block within its owner
    pub serial: u16,
    /// Data length in bytes
    pub len: u32,
}

/// The role a node currently plays, selected by which list or bucket owns
/// it. The variants share one uniform arena slot, so indexing stays
/// uniform regardless of role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePayload {
    /// Slot is unused, chained on the pool's free list
    Free {
        /// Next free slot, `EMPTY` at the end of the chain
        next: u16,
    },
    /// Block holds no live data and is ready for allocation
    Erased {
        /// The erased block
        block: u16,
        /// 1 when the spare area must be re-read before the block is reused
        need_check: u8,
        /// Previous node on the erased list, `EMPTY` at the head
        prev: u16,
        /// Next node on the erased list, `EMPTY` at the tail
        next: u16,
    },
    /// Block is excluded from allocation
    Bad {
        /// The bad block
        block: u16,
        /// Previous node on the bad list, `EMPTY` at the head
        prev: u16,
        /// Next node on the bad list, `EMPTY` at the tail
        next: u16,
    },
    /// Block holds a directory
    Dir(DirInfo),
    /// Block holds a file header
    File(FileInfo),
    /// Block holds file data
    Data(DataInfo),
}

impl Default for NodePayload {
    fn default() -> NodePayload {
        NodePayload::Free { next: EMPTY }
    }
}

/// One arena slot.
///
/// The hash chain links are only meaningful while the payload is `Dir`,
/// `File` or `Data`; list and free variants carry their links inside the
/// payload instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeNode {
    /// Previous node in the hash bucket chain, `EMPTY` at the chain head
    pub hash_prev: u16,
    /// Next node in the hash bucket chain, `EMPTY` at the chain end
    pub hash_next: u16,
    /// Current role and role-specific fields
    pub payload: NodePayload,
}

impl Default for TreeNode {
    fn default() -> TreeNode {
        TreeNode {
            hash_prev: EMPTY,
            hash_next: EMPTY,
            payload: NodePayload::default(),
        }
    }
}

/// The node arena of one device.
///
/// Capacity equals the partition's block count: at most one node can exist
/// per live block. `EMPTY` is reserved as the sentinel index; the device
/// container rejects partitions with that many blocks before a pool is
/// ever sized, so every slot index here stays below the sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePool {
    nodes: Vec<TreeNode>,
    free: u16,
}

impl NodePool {
    /// Create a pool of `capacity` slots, all chained on the free list in
    /// index order
    pub fn new(capacity: u16) -> NodePool {
        let mut pool = NodePool {
            nodes: vec![TreeNode::default(); capacity as usize],
            free: EMPTY,
        };
        pool.reset();
        pool
    }

    /// Number of slots in this pool
    pub fn capacity(&self) -> u16 {
        self.nodes.len() as u16
    }

    /// Return every slot to the empty state and rebuild the free chain
    /// 0 → 1 → … → capacity-1 → `EMPTY`. Idempotent
    pub fn reset(&mut self) {
        let n = self.nodes.len();
        for (i, node) in self.nodes.iter_mut().enumerate() {
            *node = TreeNode::default();
            node.payload = NodePayload::Free {
                next: if i + 1 < n { (i + 1) as u16 } else { EMPTY },
            };
        }
        self.free = if n > 0 { 0 } else { EMPTY };
    }

    /// Head of the free chain, `EMPTY` when the pool is exhausted
    pub fn free_head(&self) -> u16 {
        self.free
    }

    /// Point the free chain at a restored head; only the deserializer uses
    /// this, and it validates the chain it installs
    pub(crate) fn set_free_head(&mut self, head: u16) {
        self.free = head;
    }

    /// Take a slot off the free list.
    /// The returned slot keeps a `Free` payload with a cleared link until
    /// the caller gives it a role
    pub fn alloc(&mut self) -> Result<u16, PoolError> {
        let head = self.free;
        if head == EMPTY {
            return Err(PoolError::Exhausted);
        }
        let next = match self.nodes[head as usize].payload {
            NodePayload::Free { next } => next,
            _ => {
                // the free chain must only link Free slots
                error!(index = head, "free list links a slot that is in use");
                EMPTY
            }
        };
        self.free = next;
        self.nodes[head as usize] = TreeNode::default();
        Ok(head)
    }

    /// Return a slot to the free list, discarding its contents
    pub fn free(&mut self, index: u16) -> Result<(), PoolError> {
        self.check_index(index)?;
        self.nodes[index as usize] = TreeNode {
            hash_prev: EMPTY,
            hash_next: EMPTY,
            payload: NodePayload::Free { next: self.free },
        };
        self.free = index;
        Ok(())
    }

    /// Shared access to a slot
    pub fn get(&self, index: u16) -> Result<&TreeNode, PoolError> {
        self.nodes
            .get(index as usize)
            .ok_or(PoolError::OutOfRange(index))
    }

    /// Exclusive access to a slot
    pub fn get_mut(&mut self, index: u16) -> Result<&mut TreeNode, PoolError> {
        self.nodes
            .get_mut(index as usize)
            .ok_or(PoolError::OutOfRange(index))
    }

    /// Validate an externalized index: it must name a slot of this pool.
    /// `EMPTY` is *not* accepted here; call sites where a terminator is
    /// legal check for it first
    pub fn check_index(&self, raw: u16) -> Result<u16, PoolError> {
        if (raw as usize) < self.nodes.len() {
            Ok(raw)
        } else {
            Err(PoolError::OutOfRange(raw))
        }
    }

    /// Convert a byte offset into the node slab to a slot index.
    ///
    /// Streams written before indices were externalized record the byte
    /// offset of each node instead; such an offset must be a multiple of
    /// the slot stride to name an integer slot at all, which also catches
    /// corruption in streams that are only partially valid
    pub fn index_from_offset(&self, offset: u32) -> Result<u16, PoolError> {
        let stride = mem::size_of::<TreeNode>() as u32;
        if offset % stride != 0 {
            return Err(PoolError::Unaligned(offset));
        }
        let slot = offset / stride;
        if slot >= self.nodes.len() as u32 {
            return Err(PoolError::OutOfRange(slot.min(u32::from(u16::MAX)) as u16));
        }
        Ok(slot as u16)
    }

    /// Walk the free chain and collect the slot indices in chain order.
    /// The walk is bounded by the pool capacity; `None` means the chain is
    /// cyclic, which no pool operation can produce
    pub fn walk_free(&self) -> Option<Vec<u16>> {
        let mut out = Vec::new();
        let mut cur = self.free;
        while cur != EMPTY {
            if out.len() >= self.nodes.len() {
                return None;
            }
            out.push(cur);
            cur = match self.nodes.get(cur as usize)?.payload {
                NodePayload::Free { next } => next,
                _ => return None,
            };
        }
        Some(out)
    }
}
