//! In-memory index and state-serialization core of a small NAND flash
//! file system.
//!
//! One partition of a chip is managed as one logical [`Device`]; the
//! device owns a bounded arena of tree nodes that mirrors the on-flash
//! block population and makes name resolution, free-space accounting and
//! block lookup constant-time. The [`serialize`] module saves and restores
//! that arena bit-for-bit across power cycles, so a mount can skip the
//! full flash scan.
//!
//! The crate consumes the interfaces of `nandfs_api` (flash driver,
//! serialization sink/source, storage attributes) and implements nothing
//! below them: flash IO, page buffering, tag parsing and the POSIX-style
//! file API all live with the enclosing file system.
//!
//! [`Device`]: device/struct.Device.html
//! [`serialize`]: serialize/index.html

#![deny(missing_docs)]

pub mod device;
pub mod error_fs;
pub mod pool;
pub mod serialize;
pub mod tree;
