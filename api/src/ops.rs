//! The two operation sets the device core consumes: low-level flash
//! operations, implemented by a flash driver, and serialization operations,
//! implemented by whatever backs the persisted device state (a flash
//! region, a file, or a memory buffer).
//!
//! The device core itself never calls [`FlashOps`]; the enclosing file
//! system drives the flash and reports the outcomes (new blocks, erased
//! blocks, bad blocks) into the tree. The core *does* drive
//! [`SerializeOps`] when asked to save or restore its state.

use crate::error_api::Result;

/// Low-level flash operations, implemented by the flash driver.
///
/// `block` is an absolute block number on the chip; `page` is a page number
/// within the block. Data and spare lengths are fixed by the
/// [`StorageAttr`](../types/struct.StorageAttr.html) the driver was
/// initialized with, and the partial variants take an additional byte
/// offset within the page data or spare area.
pub trait FlashOps {
    /// Reset the chip to a known state
    fn reset(&mut self) -> Result<()>;

    /// Is the given block marked bad?
    fn is_block_bad(&self, block: u16) -> Result<bool>;

    /// Mark the given block bad
    fn mark_bad(&mut self, block: u16) -> Result<()>;

    /// Erase the given block
    fn erase_block(&mut self, block: u16) -> Result<()>;

    /// Write a full page: data area and spare area together
    fn write_page(&mut self, block: u16, page: u16, data: &[u8], spare: &[u8]) -> Result<()>;

    /// Write part of a page's data area, starting at byte offset `offs`
    fn write_page_data(&mut self, block: u16, page: u16, data: &[u8], offs: u16) -> Result<()>;

    /// Write part of a page's spare area, starting at byte offset `offs`
    fn write_page_spare(&mut self, block: u16, page: u16, spare: &[u8], offs: u16) -> Result<()>;

    /// Read a full page: data area and spare area together
    fn read_page(&self, block: u16, page: u16, data: &mut [u8], spare: &mut [u8]) -> Result<()>;

    /// Read part of a page's data area, starting at byte offset `offs`
    fn read_page_data(&self, block: u16, page: u16, data: &mut [u8], offs: u16) -> Result<()>;

    /// Read part of a page's spare area, starting at byte offset `offs`
    fn read_page_spare(&self, block: u16, page: u16, spare: &mut [u8], offs: u16) -> Result<()>;
}

/// Serialization sink and source for the persisted device state.
///
/// The device core publishes an exact byte stream through these calls and
/// reads the same stream back; an implementation only has to move integers
/// to and from its backing storage. Byte order is the implementation's
/// choice, but a stream is only meaningful to the implementation that wrote
/// it, so the order must be fixed once and kept. Both stores in
/// [`controller`](../controller/index.html) use little-endian.
///
/// The begin/end hooks are optional framing points (writing a header,
/// computing a trailer checksum); the default implementations do nothing,
/// matching drivers that need no framing.
pub trait SerializeOps {
    /// Called before the first write of a state stream
    fn begin_serialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called after the last write of a state stream
    fn end_serialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Write a 32-bit unsigned integer
    fn write_u32(&mut self, value: u32) -> Result<()>;

    /// Write a 16-bit unsigned integer
    fn write_u16(&mut self, value: u16) -> Result<()>;

    /// Write an 8-bit unsigned integer
    fn write_u8(&mut self, value: u8) -> Result<()>;

    /// Called before the first read of a state stream
    fn begin_deserialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called after a state stream has been read back successfully.
    /// Unlike the other hooks this one cannot fail; by the time it runs the
    /// restored state has already been accepted.
    fn end_deserialize(&mut self) {}

    /// Read a 32-bit unsigned integer
    fn read_u32(&mut self) -> Result<u32>;

    /// Read a 16-bit unsigned integer
    fn read_u16(&mut self) -> Result<u16>;

    /// Read an 8-bit unsigned integer
    fn read_u8(&mut self) -> Result<u8>;
}
