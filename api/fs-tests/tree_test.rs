use super::{data_hash, dir_hash, file_hash, NodeClass, Tree};
use crate::error_fs::TreeError;
use crate::pool::{DataInfo, DirInfo, FileInfo, NodePayload};
use nandfs_api::types::{DIR_NODE_ENTRIES, EMPTY};

#[path = "utils.rs"]
mod utils;

fn dir(serial: u16, parent: u16, block: u16) -> DirInfo {
    DirInfo {
        block,
        checksum: 0,
        parent,
        serial,
    }
}

#[test]
fn attach_and_lookup() {
    let mut tree = Tree::new(8);

    let d = tree.alloc_node().unwrap();
    tree.attach_dir(d, dir(1, 0, 3)).unwrap();
    let f = tree.alloc_node().unwrap();
    tree.attach_file(
        f,
        FileInfo {
            block: 5,
            checksum: 0xABCD,
            parent: 1,
            serial: 2,
            len: 120,
        },
    )
    .unwrap();
    let n = tree.alloc_node().unwrap();
    tree.attach_data(
        n,
        DataInfo {
            block: 6,
            parent: 2,
            serial: 0,
            len: 512,
        },
    )
    .unwrap();

    assert_eq!(tree.find_dir(1), Some(d));
    assert_eq!(tree.find_file(2), Some(f));
    assert_eq!(tree.find_data(2, 0), Some(n));

    //Misses in every class
    assert_eq!(tree.find_dir(2), None);
    assert_eq!(tree.find_file(1), None);
    assert_eq!(tree.find_data(2, 1), None);
    assert_eq!(tree.find_data(3, 0), None);

    //The new nodes sit at the head of their computed buckets
    assert_eq!(tree.bucket_heads(NodeClass::Dir)[dir_hash(1)], d);
    assert_eq!(tree.bucket_heads(NodeClass::File)[file_hash(2)], f);
    assert_eq!(tree.bucket_heads(NodeClass::Data)[data_hash(2)], n);

    assert!(tree.buckets_consistent());
    assert_eq!(tree.live_node_count(), 3);
}

#[test]
fn chains_survive_collisions_and_removal() {
    let mut tree = Tree::new(16);

    //Serials 1, 1+32 and 1+64 all land in the same directory bucket
    let colliding: Vec<u16> = vec![1, 1 + DIR_NODE_ENTRIES as u16, 1 + 2 * DIR_NODE_ENTRIES as u16];
    let mut nodes = Vec::new();
    for (i, &serial) in colliding.iter().enumerate() {
        let idx = tree.alloc_node().unwrap();
        tree.attach_dir(idx, dir(serial, 0, i as u16)).unwrap();
        nodes.push(idx);
        assert!(tree.buckets_consistent());
    }

    //Insertion splices at the head, so the chain runs newest to oldest
    let chain = tree.chain_payloads(NodeClass::Dir, dir_hash(1));
    let serials: Vec<u16> = chain
        .iter()
        .map(|p| match p {
            NodePayload::Dir(d) => d.serial,
            _ => panic!("non-dir payload in a dir chain"),
        })
        .collect();
    assert_eq!(serials, vec![colliding[2], colliding[1], colliding[0]]);

    //Every colliding serial still resolves
    for &serial in colliding.iter() {
        assert!(tree.find_dir(serial).is_some());
    }

    //Remove the middle node, then the head, then the tail
    tree.detach(nodes[1]).unwrap();
    assert!(tree.buckets_consistent());
    assert_eq!(tree.find_dir(colliding[1]), None);
    assert!(tree.find_dir(colliding[0]).is_some());

    tree.detach(nodes[2]).unwrap();
    assert!(tree.buckets_consistent());
    assert_eq!(tree.bucket_heads(NodeClass::Dir)[dir_hash(1)], nodes[0]);

    tree.detach(nodes[0]).unwrap();
    assert!(tree.buckets_consistent());
    assert_eq!(tree.bucket_heads(NodeClass::Dir)[dir_hash(1)], EMPTY);
    assert_eq!(tree.live_node_count(), 0);

    //All slots made it back to the free chain
    assert_eq!(tree.pool().walk_free().unwrap().len(), 16);
}

#[test]
fn erased_list_keeps_order_and_counts() {
    let mut tree = Tree::new(8);

    for block in 0..5u16 {
        tree.append_erased(block, block == 2).unwrap();
        assert!(utils::counts_consistent(&tree));
    }
    assert_eq!(tree.erased_count(), 5);
    //Appends go to the tail: the list runs oldest first
    assert_eq!(
        tree.walk_erased().unwrap(),
        vec![
            (0, false),
            (1, false),
            (2, true),
            (3, false),
            (4, false)
        ]
    );

    //Pops come off the head, oldest first
    let popped = tree.pop_erased().unwrap();
    assert_eq!(popped.block, 0);
    assert!(!popped.need_check);
    assert_eq!(tree.erased_count(), 4);
    assert!(utils::counts_consistent(&tree));
    tree.release_node(popped.index).unwrap();

    let popped = tree.pop_erased().unwrap();
    assert_eq!(popped.block, 1);
    tree.release_node(popped.index).unwrap();

    //The need_check flag rides along
    let popped = tree.pop_erased().unwrap();
    assert_eq!(popped.block, 2);
    assert!(popped.need_check);
    tree.release_node(popped.index).unwrap();

    //Appending after pops still lands at the tail
    tree.append_erased(7, false).unwrap();
    assert_eq!(tree.walk_erased().unwrap(), vec![(3, false), (4, false), (7, false)]);
    assert!(utils::counts_consistent(&tree));

    //Draining the list empties it completely
    while tree.erased_count() > 0 {
        let e = tree.pop_erased().unwrap();
        tree.release_node(e.index).unwrap();
    }
    assert_eq!(tree.erased_head(), EMPTY);
    assert_eq!(tree.erased_tail(), EMPTY);
    assert!(matches!(tree.pop_erased(), Err(TreeError::NotFound(_))));
}

#[test]
fn erased_block_becomes_data_node() {
    let mut tree = Tree::new(8);
    for block in 0..8u16 {
        tree.append_erased(block, false).unwrap();
    }

    //Take an erased block and repurpose its node as a data node
    let e = tree.pop_erased().unwrap();
    assert_eq!(tree.erased_count(), 7);
    tree.attach_data(
        e.index,
        DataInfo {
            block: e.block,
            parent: 3,
            serial: 1,
            len: 256,
        },
    )
    .unwrap();

    //The data bucket for the hashed parent holds the new node at its head
    assert_eq!(tree.bucket_heads(NodeClass::Data)[data_hash(3)], e.index);
    assert_eq!(tree.find_data(3, 1), Some(e.index));
    assert!(tree.buckets_consistent());
    assert!(utils::counts_consistent(&tree));
}

#[test]
fn mark_bad_moves_blocks_from_anywhere() {
    let mut tree = Tree::new(8);
    for block in 5..10u16 {
        tree.append_erased(block, false).unwrap();
    }

    //A previously erased block moves onto the bad list
    tree.mark_bad(9).unwrap();
    assert_eq!(tree.bad_count(), 1);
    assert_eq!(tree.erased_count(), 4);
    assert_eq!(tree.walk_bad().unwrap(), vec![9]);
    assert_eq!(
        tree.walk_erased().unwrap(),
        vec![(5, false), (6, false), (7, false), (8, false)]
    );
    assert!(utils::counts_consistent(&tree));

    //A block living in a bucket moves too, and leaves its chain intact
    let d = tree.alloc_node().unwrap();
    tree.attach_dir(d, dir(1, 0, 2)).unwrap();
    tree.mark_bad(2).unwrap();
    assert_eq!(tree.find_dir(1), None);
    assert_eq!(tree.bad_count(), 2);
    //The bad list grows at the head
    assert_eq!(tree.walk_bad().unwrap(), vec![2, 9]);
    assert!(tree.buckets_consistent());

    //Unknown blocks are reported, not invented
    assert!(matches!(tree.mark_bad(42), Err(TreeError::NotFound(_))));
    assert!(utils::counts_consistent(&tree));
}

#[test]
fn pool_exhaustion_is_propagated_without_damage() {
    let mut tree = Tree::new(2);
    tree.append_erased(0, false).unwrap();
    tree.append_erased(1, false).unwrap();

    let before = tree.walk_erased().unwrap();
    assert!(matches!(
        tree.append_erased(2, false),
        Err(TreeError::Pool(_))
    ));
    //The failed append changed nothing
    assert_eq!(tree.walk_erased().unwrap(), before);
    assert_eq!(tree.erased_count(), 2);
}

#[test]
fn scan_children_filters_by_parent() {
    let mut tree = Tree::new(8);
    for (i, (serial, parent)) in [(0u16, 5u16), (1, 5), (0, 6), (2, 5)].iter().enumerate() {
        let idx = tree.alloc_node().unwrap();
        tree.attach_data(
            idx,
            DataInfo {
                block: 10 + i as u16,
                parent: *parent,
                serial: *serial,
                len: 64,
            },
        )
        .unwrap();
    }

    let mut children = Vec::new();
    tree.for_each_child(5, |_, d| children.push(d.serial));
    children.sort_unstable();
    assert_eq!(children, vec![0, 1, 2]);

    let mut other = Vec::new();
    tree.for_each_child(6, |_, d| other.push(d.serial));
    assert_eq!(other, vec![0]);

    let mut none = Vec::new();
    tree.for_each_child(7, |_, d| none.push(d.serial));
    assert!(none.is_empty());
}

#[test]
fn reset_is_idempotent_and_complete() {
    let mut tree = Tree::new(8);
    for block in 0..4u16 {
        tree.append_erased(block, false).unwrap();
    }
    let d = tree.alloc_node().unwrap();
    tree.attach_dir(d, dir(1, 0, 6)).unwrap();
    tree.mark_bad(2).unwrap();

    tree.reset();

    //Every bucket head is EMPTY and both lists are gone
    for &class in NodeClass::ALL.iter() {
        assert!(tree.bucket_heads(class).iter().all(|&h| h == EMPTY));
    }
    assert_eq!(tree.erased_head(), EMPTY);
    assert_eq!(tree.erased_tail(), EMPTY);
    assert_eq!(tree.bad_head(), EMPTY);
    assert_eq!(tree.erased_count(), 0);
    assert_eq!(tree.bad_count(), 0);

    //Every slot is on the free chain exactly once, in index order
    assert_eq!(
        tree.pool().walk_free().unwrap(),
        (0..8u16).collect::<Vec<u16>>()
    );

    //A second reset is indistinguishable from one
    let once = tree.clone();
    tree.reset();
    assert!(utils::tree_eq(&once, &tree));
}
