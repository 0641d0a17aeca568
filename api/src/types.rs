//! Module containing the types shared between the device core and its
//! drivers: storage attributes, partition bounds, flash statistics, the
//! block version sequence and the framing header of persisted state.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Sentinel for "no node" / "no block".
///
/// Used as the head of an empty hash bucket, the end of a node chain, and
/// the terminator of the serialized free chain. Because this value is
/// reserved, a device can manage at most `0xffff` blocks per partition.
pub const EMPTY: u16 = 0xffff;

/// Well-known serial number of the root directory.
///
/// References to serial 0 are always considered resolvable, whether or not
/// a node carrying that serial is present in the tree.
pub const ROOT_DIR_SERIAL: u16 = 0;

/// Number of hash buckets for directory nodes, keyed by serial number.
pub const DIR_NODE_ENTRIES: usize = 32;
/// Number of hash buckets for file nodes, keyed by serial number.
pub const FILE_NODE_ENTRIES: usize = 64;
/// Number of hash buckets for data nodes, keyed by the parent serial.
pub const DATA_NODE_ENTRIES: usize = 128;

/// Device type: placeholder for an unconfigured device
pub const DEV_TYPE_NULL: u32 = 0;
/// Device type: raw NAND flash
pub const DEV_TYPE_NAND: u32 = 1;
/// Device type: SmartMedia-style NAND
pub const DEV_TYPE_SM: u32 = 2;
/// Device type: RAM-backed device
pub const DEV_TYPE_RAM: u32 = 3;
/// Device type: ROM-backed device
pub const DEV_TYPE_ROM: u32 = 4;
/// Device type: emulated device (the memory-mapped controller in this crate)
pub const DEV_TYPE_EMU: u32 = 5;

/// Manufacturer id of Samsung NAND parts
pub const MAN_ID_SAMSUNG: u32 = 0xEC;
/// Manufacturer id reported by the RAM/file simulator
pub const MAN_ID_SIMRAM: u32 = 0xFF;

/// Storage attributes of one flash chip, provided by the flash-specific
/// driver at initialization time.
///
/// The device core never inspects flash contents itself; it only uses this
/// geometry for sizing (the node arena capacity, the byte accounting) and
/// hands it to the driver implementations. Derives `Serialize` and
/// `Deserialize` so host tools can persist a chip description next to an
/// image file.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StorageAttr {
    /// Device type, one of the `DEV_TYPE_*` constants
    pub dev_type: u32,
    /// Flash manufacturer id
    pub maker: u32,
    /// Chip or device id
    pub id: u32,
    /// Total blocks on this chip
    pub total_blocks: u32,
    /// Block data size in bytes (= `page_data_size * pages_per_block`)
    pub block_data_size: u32,
    /// Physical page data size in bytes (e.g. 512)
    pub page_data_size: u16,
    /// Physical page spare size in bytes (e.g. 16)
    pub spare_size: u16,
    /// Pages per block
    pub pages_per_block: u16,
    /// Offset of the block status byte within the spare area
    pub block_status_offs: u16,
}

impl StorageAttr {
    /// Raw page size in bytes: data area plus spare area
    pub fn page_size(&self) -> u64 {
        self.page_data_size as u64 + self.spare_size as u64
    }

    /// Raw block size in bytes, spare areas included
    pub fn block_raw_size(&self) -> u64 {
        self.page_size() * self.pages_per_block as u64
    }

    /// Size in bytes of a raw image of the whole chip
    pub fn image_size(&self) -> u64 {
        self.block_raw_size() * self.total_blocks as u64
    }

    /// Check that the attribute fields are consistent with each other:
    /// the block data size must agree with the page geometry, the status
    /// byte must fall inside the spare area, and the chip must not be empty
    pub fn geometry_ok(&self) -> bool {
        self.total_blocks > 0
            && self.pages_per_block > 0
            && self.page_data_size > 0
            && self.block_data_size == self.page_data_size as u32 * self.pages_per_block as u32
            && self.block_status_offs < self.spare_size
    }
}

/// Basic information of one partition: the range of blocks it owns.
/// One partition corresponds to one device.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// First block number of the partition
    pub start: u16,
    /// Last block number of the partition (inclusive)
    pub end: u16,
}

impl Partition {
    /// Number of blocks spanned by this partition
    pub fn block_count(&self) -> u32 {
        self.end as u32 - self.start as u32 + 1
    }

    /// Does `block` fall inside this partition?
    pub fn contains(&self, block: u16) -> bool {
        block >= self.start && block <= self.end
    }
}

/// Statistics of flash read/write/erase activity, kept per device.
/// The enclosing file system updates these as it drives the flash driver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlashStat {
    /// Number of block erases issued
    pub block_erase_count: u32,
    /// Number of full or partial page data writes
    pub page_write_count: u32,
    /// Number of full or partial page data reads
    pub page_read_count: u32,
    /// Number of spare area writes
    pub spare_write_count: u32,
    /// Number of spare area reads
    pub spare_read_count: u32,
}

/// Block version sequence, stored in two bits of the per-block metadata.
///
/// When a block is rewritten to a fresh location, the new copy carries the
/// next sequence value, wrapping 0 → 1 → 2 → 0. Comparing two copies of the
/// same block therefore needs a cyclic order: of two valid neighbors the
/// successor is newer, and two equal values mean the flash holds two copies
/// that claim the same age, which a scanner must treat as corruption rather
/// than pick one arbitrarily. `is_newer_than` returns `None` for that
/// ambiguous case instead of guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSeq(u8);

impl BlockSeq {
    /// Sequence value carried by the first copy of a block
    pub fn first() -> BlockSeq {
        BlockSeq(0)
    }

    /// Sequence value for the next copy of this block
    pub fn next(self) -> BlockSeq {
        BlockSeq((self.0 + 1) % 3)
    }

    /// Interpret a raw two-bit field. The encoding `3` is never written and
    /// yields `None`.
    pub fn from_raw(raw: u8) -> Option<BlockSeq> {
        if raw < 3 {
            Some(BlockSeq(raw))
        } else {
            None
        }
    }

    /// Extract the sequence from the low two bits of a status byte
    pub fn from_status_byte(byte: u8) -> Option<BlockSeq> {
        use bit_field::BitField;
        BlockSeq::from_raw(byte.get_bits(0..2))
    }

    /// The raw two-bit encoding of this sequence value
    pub fn raw(self) -> u8 {
        self.0
    }

    /// Is `self` a newer copy than `other`?
    ///
    /// Returns `None` when the two values are equal: equal sequence numbers
    /// on two copies of the same block cannot be ordered and must be
    /// rejected by the caller.
    pub fn is_newer_than(self, other: BlockSeq) -> Option<bool> {
        match self.0 as i8 - other.0 as i8 {
            0 => None,
            1 | -2 => Some(true),
            //only -1 and 2 remain; both operands are in 0..3
            _ => Some(false),
        }
    }
}

/// Framing header written by the file-backed state store ahead of the tree
/// stream, so a stale or foreign state file is rejected before a single
/// tree record is read.
///
/// Derives `Serialize` and `Deserialize`; the header goes through bincode,
/// unlike the tree stream itself, which is emitted integer by integer
/// through [`SerializeOps`](../ops/trait.SerializeOps.html).
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StateHeader {
    /// Magic number identifying a nandfs state stream
    pub magic: u32,
    /// Format version of the tree stream that follows
    pub version: u16,
    /// Total blocks of the chip the stream was taken from
    pub total_blocks: u32,
    /// Directory bucket count the stream was written with
    pub dir_entries: u16,
    /// File bucket count the stream was written with
    pub file_entries: u16,
    /// Data bucket count the stream was written with
    pub data_entries: u16,
}

impl StateHeader {
    /// Magic number of a nandfs state stream ("NFST")
    pub const MAGIC: u32 = 0x4e46_5354;
    /// Current stream format version
    pub const VERSION: u16 = 1;

    /// Build the header matching a chip description
    pub fn for_attr(attr: &StorageAttr) -> StateHeader {
        StateHeader {
            magic: StateHeader::MAGIC,
            version: StateHeader::VERSION,
            total_blocks: attr.total_blocks,
            dir_entries: DIR_NODE_ENTRIES as u16,
            file_entries: FILE_NODE_ENTRIES as u16,
            data_entries: DATA_NODE_ENTRIES as u16,
        }
    }

    /// Does this header describe a stream the current build can restore
    /// for the given chip?
    pub fn matches(&self, attr: &StorageAttr) -> bool {
        *self == StateHeader::for_attr(attr)
    }
}

lazy_static! {
    /// Size the framing header takes up on disk, in bytes.
    /// This size can only be found out at runtime, which is the reason why
    /// we have to wrap this code in a `lazy_static` macro.
    pub static ref STATE_HEADER_SIZE: u64 =
        bincode::serialize(&StateHeader::default()).unwrap().len() as u64;
}

#[cfg(test)]
mod seq_tests {
    use super::BlockSeq;

    #[test]
    fn wraps_mod_three() {
        let s0 = BlockSeq::first();
        let s1 = s0.next();
        let s2 = s1.next();
        assert_eq!(s2.next(), s0);
        assert_eq!(s0.raw(), 0);
        assert_eq!(s1.raw(), 1);
        assert_eq!(s2.raw(), 2);
    }

    #[test]
    fn newer_is_cyclic() {
        let s0 = BlockSeq::first();
        let s1 = s0.next();
        let s2 = s1.next();

        assert_eq!(s1.is_newer_than(s0), Some(true));
        assert_eq!(s2.is_newer_than(s1), Some(true));
        //the wrap-around case: 0 succeeds 2
        assert_eq!(s0.is_newer_than(s2), Some(true));

        assert_eq!(s0.is_newer_than(s1), Some(false));
        assert_eq!(s1.is_newer_than(s2), Some(false));
        assert_eq!(s2.is_newer_than(s0), Some(false));

        //equal sequence numbers cannot be ordered
        assert_eq!(s0.is_newer_than(s0), None);
        assert_eq!(s2.is_newer_than(s2), None);
    }

    #[test]
    fn raw_decoding() {
        assert_eq!(BlockSeq::from_raw(2), Some(BlockSeq::first().next().next()));
        assert_eq!(BlockSeq::from_raw(3), None);
        //sequence lives in the low two bits; the rest of the byte is ignored
        assert_eq!(BlockSeq::from_status_byte(0xF1), Some(BlockSeq::first().next()));
        assert_eq!(BlockSeq::from_status_byte(0x07), None);
    }
}

#[cfg(test)]
mod header_tests {
    use super::*;

    fn attr() -> StorageAttr {
        StorageAttr {
            dev_type: DEV_TYPE_EMU,
            maker: MAN_ID_SIMRAM,
            id: 0,
            total_blocks: 16,
            block_data_size: 4 * 512,
            page_data_size: 512,
            spare_size: 16,
            pages_per_block: 4,
            block_status_offs: 5,
        }
    }

    #[test]
    fn header_matches_its_own_attr() {
        let a = attr();
        let h = StateHeader::for_attr(&a);
        assert!(h.matches(&a));

        //a different chip must be rejected
        let mut other = a;
        other.total_blocks = 32;
        assert!(!h.matches(&other));

        //as must a stale format version
        let mut stale = h;
        stale.version = StateHeader::VERSION + 1;
        assert!(!stale.matches(&a));
    }

    #[test]
    fn header_size_is_stable() {
        let h = StateHeader::for_attr(&attr());
        assert_eq!(
            bincode::serialize(&h).unwrap().len() as u64,
            *STATE_HEADER_SIZE
        );
    }

    #[test]
    fn geometry_checks() {
        let mut a = attr();
        assert!(a.geometry_ok());
        assert_eq!(a.page_size(), 528);
        assert_eq!(a.block_raw_size(), 4 * 528);
        assert_eq!(a.image_size(), 16 * 4 * 528);

        a.block_data_size = 1000; //no longer page_data_size * pages_per_block
        assert!(!a.geometry_ok());

        let mut b = attr();
        b.block_status_offs = b.spare_size; //status byte outside the spare
        assert!(!b.geometry_ok());
    }

    #[test]
    fn partition_span() {
        let p = Partition { start: 2, end: 9 };
        assert_eq!(p.block_count(), 8);
        assert!(p.contains(2));
        assert!(p.contains(9));
        assert!(!p.contains(1));
        assert!(!p.contains(10));
    }
}
