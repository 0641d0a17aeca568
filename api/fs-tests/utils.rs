#![allow(dead_code)]

//Some more general testing utilities, shared by the tree, serializer and
//device test suites. This file is included from the core crate's test
//modules via `#[path]`, so `crate` refers to nandfs_core here.
use crate::tree::{NodeClass, Tree};
use nandfs_api::types::{Partition, StorageAttr, DEV_TYPE_EMU, MAN_ID_SIMRAM};
use std::fs::{create_dir_all, remove_dir, remove_file};
use std::path::{Path, PathBuf};

//Storage attributes of the toy chip used throughout the tests:
//4 pages of 64 data bytes per block, 8 spare bytes per page
pub fn test_attr(total_blocks: u32) -> StorageAttr {
    StorageAttr {
        dev_type: DEV_TYPE_EMU,
        maker: MAN_ID_SIMRAM,
        id: 0,
        total_blocks,
        block_data_size: 4 * 64,
        page_data_size: 64,
        spare_size: 8,
        pages_per_block: 4,
        block_status_offs: 5,
    }
}

//A partition spanning the whole toy chip
pub fn full_partition(total_blocks: u32) -> Partition {
    Partition {
        start: 0,
        end: (total_blocks - 1) as u16,
    }
}

//Create the necessary folders 'name' leading up to 'file_name', starting
//from the crate root.
//Additionally, remove 'file_name' if it already exists, so we can start
//from a fresh file
pub fn file_prep_path(name: &str, file_name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push(name);
    path.push(file_name);

    if path.exists() {
        //Remove the file in case it already exists
        remove_file(&path).unwrap();
    }
    {
        //Create any missing directories first, if applicable
        let prefix = path.parent().unwrap();
        create_dir_all(prefix).unwrap();
    }

    return path;
}

//Undo folder creation, including removing the parent
pub fn file_unprep_path(path: &Path) {
    //Ensure that the file has been deleted before going on
    remove_file(path).unwrap();

    let parent = path.parent().unwrap();
    remove_dir(parent).unwrap(); //Safety; only remove if empty
}

//Structural equality of two trees: same capacity, same list contents in
//order, same counts, same payload sequence in every bucket chain, and
//free chains of the same length.
//This deliberately compares by walking rather than by raw memory, so two
//trees that index the same block population compare equal regardless of
//where in the pool their nodes happen to live
pub fn tree_eq(a: &Tree, b: &Tree) -> bool {
    if a.capacity() != b.capacity() {
        return false;
    }
    if a.erased_count() != b.erased_count() || a.bad_count() != b.bad_count() {
        return false;
    }
    if a.walk_erased().ok() != b.walk_erased().ok() {
        return false;
    }
    if a.walk_bad().ok() != b.walk_bad().ok() {
        return false;
    }
    let free_len = |t: &Tree| t.pool().walk_free().map(|v| v.len());
    if free_len(a) != free_len(b) {
        return false;
    }
    for &class in NodeClass::ALL.iter() {
        for hash in 0..class.bucket_len() {
            if a.chain_payloads(class, hash) != b.chain_payloads(class, hash) {
                return false;
            }
        }
    }
    true
}

//Walked lengths of both lists must agree with the stored counters after
//every mutation
pub fn counts_consistent(t: &Tree) -> bool {
    t.walk_erased().map(|v| v.len()).unwrap_or(usize::MAX) == t.erased_count() as usize
        && t.walk_bad().map(|v| v.len()).unwrap_or(usize::MAX) == t.bad_count() as usize
}
