//! Shared types and external interfaces of the nandfs core
//!
//! This crate contains everything the device core consumes but does not
//! implement itself: the storage attribute and partition descriptions, the
//! flash-driver and serialization operation traits, and reference
//! implementations of both (a memory-mapped emulated NAND chip and two
//! serialization stores).
//!
//! The tree and serializer live in the `nandfs_core` crate; the shared
//! integration tests under `fs-tests/` are compiled into that crate.

#![deny(missing_docs)]

//Implementation of the controller layer
pub mod controller;
pub mod error_api;

//Basic modules for types
pub mod types;

//Operation sets implemented by flash drivers and state stores
pub mod ops;
