//! The device container: one partition of one flash chip, managed as one
//! logical device.
//!
//! A `Device` owns the tree, the storage attributes and partition range,
//! the flash statistics, a recursive per-device lock, and the injected
//! operation objects: the flash driver (driven by the enclosing file
//! system, never by the tree) and the optional serialization sink/source.
//! Devices share nothing mutable, so multiple devices may be driven from
//! separate tasks concurrently.

use crate::error_fs::{DeviceError, SerializeError};
use crate::serialize;
use crate::tree::Tree;
use nandfs_api::ops::{FlashOps, SerializeOps};
use nandfs_api::types::{FlashStat, Partition, StorageAttr, EMPTY};
use std::fmt;
use std::thread::{self, ThreadId};
use tracing::warn;

/// Recursive device lock: counted, owner-identified by task id.
///
/// Scheduling is cooperative within a device, so the lock never blocks;
/// an acquisition attempt from a task that does not own it is a discipline
/// error, not a wait.
#[derive(Debug)]
struct DeviceLock {
    owner: Option<ThreadId>,
    counter: u32,
}

impl DeviceLock {
    fn new() -> DeviceLock {
        DeviceLock {
            owner: None,
            counter: 0,
        }
    }

    fn acquire(&mut self) -> Result<(), DeviceError> {
        let me = thread::current().id();
        match self.owner {
            None => {
                self.owner = Some(me);
                self.counter = 1;
                Ok(())
            }
            Some(owner) if owner == me => {
                self.counter += 1;
                Ok(())
            }
            Some(_) => Err(DeviceError::Lock("device is locked by another task")),
        }
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        let me = thread::current().id();
        match self.owner {
            Some(owner) if owner == me => {
                self.counter -= 1;
                if self.counter == 0 {
                    self.owner = None;
                }
                Ok(())
            }
            _ => Err(DeviceError::Lock("device is not locked by this task")),
        }
    }
}

/// One logical flash device: the core data structure everything else
/// hangs off
pub struct Device {
    attr: StorageAttr,
    par: Partition,
    tree: Tree,
    st: FlashStat,
    lock: DeviceLock,
    flash: Box<dyn FlashOps>,
    serial_ops: Option<Box<dyn SerializeOps>>,
}

impl Device {
    /// Create the device for one partition of a chip, with an empty tree
    /// sized to the partition's block count.
    ///
    /// The caller then either restores the tree through
    /// [`deserialize_state`](Device::deserialize_state) or populates it
    /// from a full flash scan
    pub fn new(
        attr: StorageAttr,
        par: Partition,
        flash: Box<dyn FlashOps>,
    ) -> Result<Device, DeviceError> {
        if !attr.geometry_ok() {
            return Err(DeviceError::Config("inconsistent storage attributes"));
        }
        if par.end < par.start {
            return Err(DeviceError::Config("partition ends before it starts"));
        }
        if par.end as u32 >= attr.total_blocks {
            return Err(DeviceError::Config("partition exceeds the chip"));
        }
        if par.block_count() >= EMPTY as u32 {
            return Err(DeviceError::Config(
                "partition has more blocks than the index range allows",
            ));
        }
        Ok(Device {
            attr,
            par,
            tree: Tree::new(par.block_count() as u16),
            st: FlashStat::default(),
            lock: DeviceLock::new(),
            flash,
            serial_ops: None,
        })
    }

    /// Install the serialization sink/source. Without one,
    /// `serialize_state` and `deserialize_state` fail
    pub fn set_serialize_ops(&mut self, ops: Box<dyn SerializeOps>) {
        self.serial_ops = Some(ops);
    }

    /// Remove and return the serialization sink/source, if any
    pub fn clear_serialize_ops(&mut self) -> Option<Box<dyn SerializeOps>> {
        self.serial_ops.take()
    }

    /// Storage attributes of the underlying chip
    pub fn attr(&self) -> &StorageAttr {
        &self.attr
    }

    /// Block range of this device's partition
    pub fn partition(&self) -> &Partition {
        &self.par
    }

    /// Shared access to the device tree
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Exclusive access to the device tree.
    /// Mutations are only valid while the device lock is held
    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    /// The flash driver of this device, for the enclosing file system.
    /// The tree itself never calls it
    pub fn flash(&mut self) -> &mut dyn FlashOps {
        self.flash.as_mut()
    }

    /// Flash activity counters
    pub fn stats(&self) -> &FlashStat {
        &self.st
    }

    /// Exclusive access to the flash activity counters, for the enclosing
    /// file system to update as it drives the driver
    pub fn stats_mut(&mut self) -> &mut FlashStat {
        &mut self.st
    }

    /// Take the device lock.
    /// Reentrant from the owning task; an attempt from any other task is
    /// an error rather than a wait
    pub fn lock(&mut self) -> Result<(), DeviceError> {
        self.lock.acquire()
    }

    /// Drop one level of the device lock
    pub fn unlock(&mut self) -> Result<(), DeviceError> {
        self.lock.release()
    }

    /// Save the tree through the installed serialization sink.
    ///
    /// Observes a snapshot equal to the state after the most recently
    /// completed mutation; partial output after an IO error is garbage by
    /// the caller's framing
    pub fn serialize_state(&mut self) -> Result<(), DeviceError> {
        self.lock.acquire()?;
        let result = match self.serial_ops.as_mut() {
            Some(ops) => {
                serialize::serialize_tree(&self.tree, ops.as_mut()).map_err(DeviceError::from)
            }
            None => {
                warn!("serialization operations are not set");
                Err(SerializeError::OpsNotSet.into())
            }
        };
        self.lock.release()?;
        result
    }

    /// Restore the tree through the installed serialization source.
    ///
    /// On failure the tree is left in the empty-device state and the error
    /// is returned, so the caller can fall back to a full flash scan
    pub fn deserialize_state(&mut self) -> Result<(), DeviceError> {
        self.lock.acquire()?;
        let result = match self.serial_ops.as_mut() {
            Some(ops) => serialize::deserialize_state(&mut self.tree, ops.as_mut())
                .map_err(DeviceError::from),
            None => {
                warn!("deserialization operations are not set");
                Err(SerializeError::OpsNotSet.into())
            }
        };
        self.lock.release()?;
        result
    }

    fn block_data_bytes(&self) -> u64 {
        self.attr.page_data_size as u64 * self.attr.pages_per_block as u64
    }

    /// Partition size in data bytes
    pub fn total_bytes(&self) -> u64 {
        self.par.block_count() as u64 * self.block_data_bytes()
    }

    /// Data bytes of the partition currently holding live data:
    /// everything that is neither erased nor bad
    pub fn used_bytes(&self) -> u64 {
        let live = self.par.block_count() as u64
            - self.tree.bad_count() as u64
            - self.tree.erased_count() as u64;
        live * self.block_data_bytes()
    }

    /// Data bytes of the partition ready for new writes
    pub fn free_bytes(&self) -> u64 {
        self.tree.erased_count() as u64 * self.block_data_bytes()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("attr", &self.attr)
            .field("par", &self.par)
            .field("erased_count", &self.tree.erased_count())
            .field("bad_count", &self.tree.bad_count())
            .field("st", &self.st)
            .field("has_serialize_ops", &self.serial_ops.is_some())
            .finish()
    }
}

#[cfg(test)]
#[path = "../../api/fs-tests/device_test.rs"]
mod tests;
