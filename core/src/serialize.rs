//! Saving and restoring the device tree as a compact index stream.
//!
//! The serialized state has the following form:
//!   - Collection of free entries
//!   - Collection of erased blocks
//!   - Collection of bad blocks
//!   - Collection of directory bucket heads
//!   - Collection of directory nodes
//!   - Collection of file bucket heads
//!   - Collection of file nodes
//!   - Collection of data bucket heads
//!   - Collection of data nodes
//!
//! The collection of free entries is a series of 16-bit indices, where
//! `0xffff` is a terminator.
//!
//! The collection of erased blocks is a series of entries of the form
//! `index:16, block:16, need_check:8`; an index of `0xffff` terminates the
//! series with no further entry data. Bad blocks follow the same scheme
//! without the `need_check` byte.
//!
//! Each bucket head collection contains exactly as many 16-bit values as
//! the class has buckets. Each node collection is a 16-bit entry count
//! followed by that many records:
//!   - directory: `index:16, hash_next:16, hash_prev:16, block:16,
//!     checksum:16, parent:16, serial:16`
//!   - file: the directory record plus `len:32`
//!   - data: `index:16, hash_next:16, hash_prev:16, block:16, parent:16,
//!     serial:16, len:32`
//!
//! The writer never reorders: it walks the in-memory structure and emits
//! indices verbatim, so a restored tree is bit-for-bit the tree that was
//! saved, chain order included. The reader writes directly into pool slots
//! by index, bounds-checking every index, bounding every count by the pool
//! capacity, and verifying the rebuilt structure in a second pass. On any
//! failure the whole state is discarded and the tree resets to the
//! empty-device state, so no partially populated tree is ever visible; the
//! caller then falls back to a full flash scan.

use crate::error_fs::{CorruptKind, SerializeError, TreeError};
use crate::pool::{DataInfo, DirInfo, FileInfo, NodePayload, TreeNode};
use crate::tree::{NodeClass, Tree};
use nandfs_api::ops::SerializeOps;
use nandfs_api::types::{
    DATA_NODE_ENTRIES, DIR_NODE_ENTRIES, EMPTY, FILE_NODE_ENTRIES, ROOT_DIR_SERIAL,
};
use tracing::error;

type Result<T> = std::result::Result<T, SerializeError>;

/// Upper bound, in bytes, of the serialized state of a partition with
/// `block_count` blocks: one largest-record slot per block, one terminator
/// per list, and one 16-bit head per bucket
pub fn serialized_size_bound(block_count: u32) -> u64 {
    block_count as u64 * 18
        + 3 * 2
        + (DIR_NODE_ENTRIES + FILE_NODE_ENTRIES + DATA_NODE_ENTRIES) as u64 * 2
}

fn io<T>(r: nandfs_api::error_api::Result<T>, msg: &'static str) -> Result<T> {
    r.map_err(|e| {
        error!("{}", msg);
        SerializeError::Io(e)
    })
}

fn corrupt(kind: CorruptKind, msg: &'static str) -> SerializeError {
    error!("{}", msg);
    SerializeError::Corrupt(kind)
}

fn fatal(msg: &'static str) -> SerializeError {
    error!("{}", msg);
    SerializeError::Tree(TreeError::Fatal(msg))
}

/// Write the tree through the given sink, in the exact stream layout
/// described in the module documentation.
///
/// Must not run while mutators do; the caller holds the device lock. A
/// tree holding dangling references (a node naming a parent serial that
/// does not resolve) is rejected before a single byte is written: such
/// states are legal mid-transaction in memory but must never be persisted
pub fn serialize_tree(tree: &Tree, ops: &mut dyn SerializeOps) -> Result<()> {
    if !references_ok(tree) {
        return Err(fatal("tree holds a dangling reference"));
    }

    io(ops.begin_serialize(), "cannot begin serialization")?;

    write_free_entries(tree, ops)?;
    write_erased_blocks(tree, ops)?;
    write_bad_blocks(tree, ops)?;
    for &class in NodeClass::ALL.iter() {
        write_class_nodes(tree, ops, class)?;
    }

    io(ops.end_serialize(), "cannot end serialization")?;
    Ok(())
}

/// Restore the tree from the given source.
///
/// On any error (IO, an out-of-range index, an oversized count, or a
/// structural inconsistency found by the verification pass) the tree is
/// reset to the empty-device state before the error is returned
pub fn deserialize_state(tree: &mut Tree, ops: &mut dyn SerializeOps) -> Result<()> {
    match deserialize_tree(tree, ops) {
        Ok(()) => Ok(()),
        Err(e) => {
            tree.reset();
            Err(e)
        }
    }
}

// ------ writer ------

fn write_free_entries(tree: &Tree, ops: &mut dyn SerializeOps) -> Result<()> {
    let mut cur = tree.pool().free_head();
    let mut steps = 0u32;
    while cur != EMPTY {
        if steps >= tree.capacity() as u32 {
            return Err(fatal("free chain walk exceeded the pool capacity"));
        }
        io(ops.write_u16(cur), "cannot write free entry index")?;
        cur = match tree.pool().get(cur)?.payload {
            NodePayload::Free { next } => next,
            _ => return Err(fatal("free chain links a slot that is in use")),
        };
        steps += 1;
    }
    io(ops.write_u16(EMPTY), "cannot write free entry index")
}

fn write_erased_blocks(tree: &Tree, ops: &mut dyn SerializeOps) -> Result<()> {
    let mut cur = tree.erased_head();
    let mut steps = 0u32;
    while cur != EMPTY {
        if steps >= tree.capacity() as u32 {
            return Err(fatal("erased list walk exceeded the pool capacity"));
        }
        let (block, need_check, next) = match tree.pool().get(cur)?.payload {
            NodePayload::Erased {
                block,
                need_check,
                next,
                ..
            } => (block, need_check, next),
            _ => return Err(fatal("erased list links a non-erased node")),
        };
        io(ops.write_u16(cur), "cannot write erased block index")?;
        io(ops.write_u16(block), "cannot write block number")?;
        io(ops.write_u8(need_check), "cannot write need check flag")?;
        cur = next;
        steps += 1;
    }
    io(ops.write_u16(EMPTY), "cannot write terminating erased block index")
}

fn write_bad_blocks(tree: &Tree, ops: &mut dyn SerializeOps) -> Result<()> {
    let mut cur = tree.bad_head();
    let mut steps = 0u32;
    while cur != EMPTY {
        if steps >= tree.capacity() as u32 {
            return Err(fatal("bad list walk exceeded the pool capacity"));
        }
        let (block, next) = match tree.pool().get(cur)?.payload {
            NodePayload::Bad { block, next, .. } => (block, next),
            _ => return Err(fatal("bad list links a non-bad node")),
        };
        io(ops.write_u16(cur), "cannot write bad block index")?;
        io(ops.write_u16(block), "cannot write block number")?;
        cur = next;
        steps += 1;
    }
    io(ops.write_u16(EMPTY), "cannot write terminating bad block index")
}

fn write_class_nodes(tree: &Tree, ops: &mut dyn SerializeOps, class: NodeClass) -> Result<()> {
    // emit the bucket heads, counting the chain nodes while passing over them
    let mut count = 0u32;
    for hash in 0..class.bucket_len() {
        let head = tree.bucket_heads(class)[hash];
        io(ops.write_u16(head), "cannot write bucket head")?;

        let mut cur = head;
        while cur != EMPTY {
            count += 1;
            if count > tree.capacity() as u32 {
                return Err(fatal("bucket chain walk exceeded the pool capacity"));
            }
            cur = tree.pool().get(cur)?.hash_next;
        }
    }

    io(ops.write_u16(count as u16), "cannot write node count")?;

    for hash in 0..class.bucket_len() {
        let mut cur = tree.bucket_heads(class)[hash];
        while cur != EMPTY {
            let node = tree.pool().get(cur)?;
            io(ops.write_u16(cur), "cannot write node index")?;
            io(ops.write_u16(node.hash_next), "cannot write next hash")?;
            io(ops.write_u16(node.hash_prev), "cannot write prev hash")?;
            match (class, node.payload) {
                (NodeClass::Dir, NodePayload::Dir(d)) => {
                    io(ops.write_u16(d.block), "cannot write dir block number")?;
                    io(ops.write_u16(d.checksum), "cannot write dir checksum")?;
                    io(ops.write_u16(d.parent), "cannot write dir parent")?;
                    io(ops.write_u16(d.serial), "cannot write dir serial")?;
                }
                (NodeClass::File, NodePayload::File(f)) => {
                    io(ops.write_u16(f.block), "cannot write file block number")?;
                    io(ops.write_u16(f.checksum), "cannot write file checksum")?;
                    io(ops.write_u16(f.parent), "cannot write file parent")?;
                    io(ops.write_u16(f.serial), "cannot write file serial")?;
                    io(ops.write_u32(f.len), "cannot write file len")?;
                }
                (NodeClass::Data, NodePayload::Data(d)) => {
                    io(ops.write_u16(d.block), "cannot write data block number")?;
                    io(ops.write_u16(d.parent), "cannot write data parent")?;
                    io(ops.write_u16(d.serial), "cannot write data serial")?;
                    io(ops.write_u32(d.len), "cannot write data len")?;
                }
                _ => return Err(fatal("bucket chain links a node of the wrong class")),
            }
            cur = node.hash_next;
        }
    }

    Ok(())
}

// ------ reader ------

fn deserialize_tree(tree: &mut Tree, ops: &mut dyn SerializeOps) -> Result<()> {
    io(ops.begin_deserialize(), "cannot begin deserialization")?;

    // tracks which pool slot each stream section claimed, so a slot named
    // twice, or a slot named by no section, fails the restore
    let mut claimed = vec![false; tree.capacity() as usize];

    read_free_entries(tree, ops, &mut claimed)?;
    read_erased_blocks(tree, ops, &mut claimed)?;
    read_bad_blocks(tree, ops, &mut claimed)?;
    let mut records = 0u32;
    for &class in NodeClass::ALL.iter() {
        records += read_class_nodes(tree, ops, class, &mut claimed)?;
    }

    verify_restored(tree, &claimed, records)?;

    ops.end_deserialize();
    Ok(())
}

fn read_index(tree: &Tree, ops: &mut dyn SerializeOps, msg: &'static str) -> Result<u16> {
    let raw = io(ops.read_u16(), msg)?;
    if raw == EMPTY {
        return Ok(EMPTY);
    }
    match tree.pool().check_index(raw) {
        Ok(index) => Ok(index),
        Err(e) => {
            error!(index = raw, "{}", msg);
            Err(e.into())
        }
    }
}

fn claim(claimed: &mut [bool], index: u16) -> Result<()> {
    let slot = &mut claimed[index as usize];
    if *slot {
        return Err(corrupt(
            CorruptKind::Structural,
            "pool slot is claimed by two stream sections",
        ));
    }
    *slot = true;
    Ok(())
}

fn read_free_entries(
    tree: &mut Tree,
    ops: &mut dyn SerializeOps,
    claimed: &mut [bool],
) -> Result<()> {
    let head = read_index(tree, ops, "cannot read free entry index")?;
    tree.pool_mut().set_free_head(head);

    let mut cur = head;
    let mut entries = 0u32;
    while cur != EMPTY {
        if entries >= tree.capacity() as u32 {
            return Err(corrupt(
                CorruptKind::CountTooLarge,
                "free chain is longer than the pool",
            ));
        }
        claim(claimed, cur)?;
        let next = read_index(tree, ops, "cannot read free entry index")?;
        *tree.pool_mut().get_mut(cur)? = TreeNode {
            hash_prev: EMPTY,
            hash_next: EMPTY,
            payload: NodePayload::Free { next },
        };
        cur = next;
        entries += 1;
    }
    Ok(())
}

fn read_erased_blocks(
    tree: &mut Tree,
    ops: &mut dyn SerializeOps,
    claimed: &mut [bool],
) -> Result<()> {
    let head = read_index(tree, ops, "cannot read erased block index")?;

    let mut cur = head;
    let mut prev = EMPTY;
    let mut count = 0u32;
    while cur != EMPTY {
        if count >= tree.capacity() as u32 {
            return Err(corrupt(
                CorruptKind::CountTooLarge,
                "erased list is longer than the pool",
            ));
        }
        claim(claimed, cur)?;
        let block = io(ops.read_u16(), "cannot read block number")?;
        let need_check = io(ops.read_u8(), "cannot read need check flag")?;
        let next = read_index(tree, ops, "cannot read next erased block index")?;
        *tree.pool_mut().get_mut(cur)? = TreeNode {
            hash_prev: EMPTY,
            hash_next: EMPTY,
            payload: NodePayload::Erased {
                block,
                need_check,
                prev,
                next,
            },
        };
        prev = cur;
        cur = next;
        count += 1;
    }
    tree.set_erased_state(head, prev, count as u16);
    Ok(())
}

fn read_bad_blocks(
    tree: &mut Tree,
    ops: &mut dyn SerializeOps,
    claimed: &mut [bool],
) -> Result<()> {
    let head = read_index(tree, ops, "cannot read bad block index")?;

    let mut cur = head;
    let mut prev = EMPTY;
    let mut count = 0u32;
    while cur != EMPTY {
        if count >= tree.capacity() as u32 {
            return Err(corrupt(
                CorruptKind::CountTooLarge,
                "bad list is longer than the pool",
            ));
        }
        claim(claimed, cur)?;
        let block = io(ops.read_u16(), "cannot read block number")?;
        let next = read_index(tree, ops, "cannot read next bad block index")?;
        *tree.pool_mut().get_mut(cur)? = TreeNode {
            hash_prev: EMPTY,
            hash_next: EMPTY,
            payload: NodePayload::Bad { block, prev, next },
        };
        prev = cur;
        cur = next;
        count += 1;
    }
    tree.set_bad_state(head, count as u16);
    Ok(())
}

fn read_class_nodes(
    tree: &mut Tree,
    ops: &mut dyn SerializeOps,
    class: NodeClass,
    claimed: &mut [bool],
) -> Result<u32> {
    for hash in 0..class.bucket_len() {
        let head = read_index(tree, ops, "cannot read bucket head")?;
        tree.set_bucket_head(class, hash, head);
    }

    let count = io(ops.read_u16(), "cannot read node count")?;
    if count as u32 > tree.capacity() as u32 {
        return Err(corrupt(
            CorruptKind::CountTooLarge,
            "node count exceeds the pool capacity",
        ));
    }

    for _ in 0..count {
        let index = read_index(tree, ops, "cannot read node index")?;
        if index == EMPTY {
            // a record slot can never be the sentinel
            return Err(corrupt(
                CorruptKind::OutOfRange,
                "node record names the sentinel index",
            ));
        }
        claim(claimed, index)?;
        let hash_next = read_index(tree, ops, "cannot read next hash")?;
        let hash_prev = read_index(tree, ops, "cannot read prev hash")?;
        let payload = match class {
            NodeClass::Dir => NodePayload::Dir(DirInfo {
                block: io(ops.read_u16(), "cannot read dir block number")?,
                checksum: io(ops.read_u16(), "cannot read dir checksum")?,
                parent: io(ops.read_u16(), "cannot read dir parent")?,
                serial: io(ops.read_u16(), "cannot read dir serial")?,
            }),
            NodeClass::File => NodePayload::File(FileInfo {
                block: io(ops.read_u16(), "cannot read file block number")?,
                checksum: io(ops.read_u16(), "cannot read file checksum")?,
                parent: io(ops.read_u16(), "cannot read file parent")?,
                serial: io(ops.read_u16(), "cannot read file serial")?,
                len: io(ops.read_u32(), "cannot read file len")?,
            }),
            NodeClass::Data => NodePayload::Data(DataInfo {
                block: io(ops.read_u16(), "cannot read data block number")?,
                parent: io(ops.read_u16(), "cannot read data parent")?,
                serial: io(ops.read_u16(), "cannot read data serial")?,
                len: io(ops.read_u32(), "cannot read data len")?,
            }),
        };
        *tree.pool_mut().get_mut(index)? = TreeNode {
            hash_prev,
            hash_next,
            payload,
        };
    }

    Ok(count as u32)
}

// ------ verification ------

fn verify_restored(tree: &Tree, claimed: &[bool], records: u32) -> Result<()> {
    if claimed.iter().any(|c| !*c) {
        return Err(corrupt(
            CorruptKind::Structural,
            "a pool slot is claimed by no stream section",
        ));
    }
    if !tree.buckets_consistent() {
        return Err(corrupt(
            CorruptKind::Structural,
            "a restored chain back pointer does not match its forward pointer",
        ));
    }
    if tree.live_node_count() != records {
        return Err(corrupt(
            CorruptKind::Structural,
            "restored records do not match the nodes reachable from the buckets",
        ));
    }
    if !references_ok(tree) {
        return Err(corrupt(
            CorruptKind::Structural,
            "a restored node reference does not resolve",
        ));
    }
    Ok(())
}

/// Do all parent references resolve, are serials unique within their
/// class, and does no block appear under two nodes?
///
/// Serial 0 is the root directory's well-known serial: references to it
/// resolve whether or not a node carries it
fn references_ok(tree: &Tree) -> bool {
    let mut dir_serials = Vec::new();
    let mut file_serials = Vec::new();
    let mut parents = Vec::new();
    let mut data_parents = Vec::new();
    let mut blocks = Vec::new();

    match tree.walk_erased() {
        Ok(list) => blocks.extend(list.into_iter().map(|(block, _)| block)),
        Err(_) => return false,
    }
    match tree.walk_bad() {
        Ok(list) => blocks.extend(list),
        Err(_) => return false,
    }
    for &class in NodeClass::ALL.iter() {
        for hash in 0..class.bucket_len() {
            for payload in tree.chain_payloads(class, hash) {
                match payload {
                    NodePayload::Dir(d) => {
                        dir_serials.push(d.serial);
                        parents.push(d.parent);
                        blocks.push(d.block);
                    }
                    NodePayload::File(f) => {
                        file_serials.push(f.serial);
                        parents.push(f.parent);
                        blocks.push(f.block);
                    }
                    NodePayload::Data(d) => {
                        data_parents.push(d.parent);
                        blocks.push(d.block);
                    }
                    _ => return false,
                }
            }
        }
    }

    let has_dup = |v: &mut Vec<u16>| {
        v.sort_unstable();
        v.windows(2).any(|w| w[0] == w[1])
    };
    if has_dup(&mut dir_serials) || has_dup(&mut file_serials) || has_dup(&mut blocks) {
        return false;
    }

    // dir and file parents must name a directory; data parents may name
    // either a directory or a file
    let dir_ok = |serial: u16| {
        serial == ROOT_DIR_SERIAL || dir_serials.binary_search(&serial).is_ok()
    };
    if !parents.iter().all(|&p| dir_ok(p)) {
        return false;
    }
    data_parents.iter().all(|&p| {
        dir_ok(p) || file_serials.binary_search(&p).is_ok()
    })
}

#[cfg(test)]
#[path = "../../api/fs-tests/serialize_test.rs"]
mod tests;
