//! Implementation of an emulated NAND chip and the reference state stores.
//!
//! The chip is represented by a file in your file system that is memory
//! mapped and stored in a [`FlashImage`] struct. When initializing the
//! controller, you have to provide either a path to a non-existing file,
//! which will then be created in the erased state, or a path to an existing
//! image, which will be opened and size-checked against the chip geometry.
//! [`FlashImage`] implements [`FlashOps`], so it can be injected into a
//! device wherever a real flash driver would go.
//!
//! The two state stores, [`StateFile`] and [`StateBuffer`], implement
//! [`SerializeOps`]: the former persists the device state to a framed file,
//! the latter keeps it in a plain byte vector (used heavily by tests, which
//! need to truncate and corrupt streams at byte granularity). Both encode
//! integers little-endian.
//!
//! No provisions have been made to lock the files backing an image or a
//! state store, so do not fiddle with them while a device is running.

use crate::error_api::{ApiError, Result};
use crate::ops::{FlashOps, SerializeOps};
use crate::types::{StateHeader, StorageAttr};
use bit_field::BitField;
use memmap::MmapMut;
use std::{
    fs::{remove_file, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

/// Struct representing one emulated NAND chip.
///
/// The backing file holds the raw pages in physical order: for each block,
/// `pages_per_block` pages of `page_data_size` data bytes immediately
/// followed by `spare_size` spare bytes. A freshly created image is all
/// `0xFF`, the erased state of NAND flash. The block status byte lives in
/// the spare area of page 0 at `block_status_offs`; `0xFF` means good,
/// anything else marks the block bad (the factory convention).
#[derive(Debug)]
pub struct FlashImage {
    /// Geometry of the emulated chip
    attr: StorageAttr,
    /// Path to the file backing this chip
    path: PathBuf,
    /// Memory-mapped contents of the above file
    contents: MmapMut,
}

/// Small enum, used to specify whether we expect to open a new image
#[derive(PartialEq, Eq, Copy, Clone)]
pub enum DiskState {
    /// Creating a new chip image
    New,
    /// Loading an old chip image
    Load,
}

// Import the components of this enum, so we can reuse them here
use self::DiskState::*;
impl DiskState {
    /// Convert a boolean to a `DiskState`
    pub fn new(ex: bool) -> DiskState {
        match ex {
            true => Load,
            false => New,
        }
    }
}

impl Drop for FlashImage {
    /// Makes sure all writes are persisted before we release the image.
    /// We only need to persist if the file backing this chip still exists
    fn drop(&mut self) {
        if self.path.exists() {
            self.contents.flush().unwrap();
        }
    }
}

impl FlashImage {
    /// Core function that handles both `new` and `load`, based on the value
    /// of the switch `ds`
    pub fn create_image<P: AsRef<Path>>(
        path: P,
        attr: &StorageAttr,
        ds: DiskState,
    ) -> Result<FlashImage> {
        if !attr.geometry_ok() {
            return Err(ApiError::ControllerInput(
                "Inconsistent storage attributes",
            ));
        }
        let path_buf = path.as_ref().to_path_buf();
        let mut mmapf = mmap_path(path, attr.image_size(), ds)?;
        if ds == New {
            // fresh NAND leaves the factory erased
            for byte in mmapf.iter_mut() {
                *byte = 0xFF;
            }
        }
        Ok(FlashImage {
            attr: *attr,
            path: path_buf,
            contents: mmapf,
        })
    }

    /// Create a *new* chip image at `path` with the given geometry, with
    /// every page in the erased state.
    /// This function will return an error if the file represented by `path`
    /// already exists.
    pub fn new<P: AsRef<Path>>(path: P, attr: &StorageAttr) -> Result<FlashImage> {
        FlashImage::create_image(path, attr, New)
    }

    /// Load an *existing* chip image, checking its size against the given
    /// geometry.
    /// This function will return an error if the file represented by `path`
    /// does not yet exist.
    pub fn load<P: AsRef<Path>>(path: P, attr: &StorageAttr) -> Result<FlashImage> {
        FlashImage::create_image(path, attr, Load)
    }

    /// End the lifetime of this image, and remove the file backing it.
    /// Panics if removing the file fails
    pub fn destruct(self) {
        remove_file(&self.path).unwrap();
    }

    /// Geometry of the emulated chip
    pub fn attr(&self) -> &StorageAttr {
        &self.attr
    }

    /// Path of the file backing this chip
    pub fn image_path(&self) -> &Path {
        &self.path
    }

    /// Byte address of the start of a page, bounds-checking both coordinates
    fn page_addr(&self, block: u16, page: u16) -> Result<usize> {
        if block as u32 >= self.attr.total_blocks {
            return Err(ApiError::ControllerInput("Block number out of range"));
        }
        if page >= self.attr.pages_per_block {
            return Err(ApiError::ControllerInput("Page number out of range"));
        }
        let page_no = block as u64 * self.attr.pages_per_block as u64 + page as u64;
        Ok((page_no * self.attr.page_size()) as usize)
    }

    /// Byte address of the start of a page's spare area
    fn spare_addr(&self, block: u16, page: u16) -> Result<usize> {
        Ok(self.page_addr(block, page)? + self.attr.page_data_size as usize)
    }

    fn read_area(&self, addr: usize, area_len: usize, buf: &mut [u8], offs: u16) -> Result<()> {
        if offs as usize + buf.len() > area_len {
            return Err(ApiError::ControllerInput("Read past the end of the area"));
        }
        let start = addr + offs as usize;
        buf.copy_from_slice(&self.contents[start..start + buf.len()]);
        Ok(())
    }

    fn write_area(&mut self, addr: usize, area_len: usize, buf: &[u8], offs: u16) -> Result<()> {
        if offs as usize + buf.len() > area_len {
            return Err(ApiError::ControllerInput("Write past the end of the area"));
        }
        let start = addr + offs as usize;
        self.contents[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn status_byte_addr(&self, block: u16) -> Result<usize> {
        Ok(self.spare_addr(block, 0)? + self.attr.block_status_offs as usize)
    }
}

impl FlashOps for FlashImage {
    /// The emulated chip holds no volatile state, so reset has nothing to do
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_block_bad(&self, block: u16) -> Result<bool> {
        let addr = self.status_byte_addr(block)?;
        Ok(self.contents[addr] != 0xFF)
    }

    fn mark_bad(&mut self, block: u16) -> Result<()> {
        let addr = self.status_byte_addr(block)?;
        let mut status = self.contents[addr];
        // NAND programming can only clear bits; clear the low nibble
        status.set_bits(0..4, 0);
        self.contents[addr] = status;
        Ok(())
    }

    /// Erase a block by refilling every page, spare areas included, with
    /// `0xFF`. Erasing also wipes a bad-block mark, as it would on a real
    /// part; callers must not erase blocks they know to be bad
    fn erase_block(&mut self, block: u16) -> Result<()> {
        let start = self.page_addr(block, 0)?;
        let end = start + self.attr.block_raw_size() as usize;
        for byte in self.contents[start..end].iter_mut() {
            *byte = 0xFF;
        }
        Ok(())
    }

    fn write_page(&mut self, block: u16, page: u16, data: &[u8], spare: &[u8]) -> Result<()> {
        if data.len() != self.attr.page_data_size as usize {
            return Err(ApiError::ControllerInput(
                "Trying to write a non-page-sized data buffer",
            ));
        }
        if spare.len() != self.attr.spare_size as usize {
            return Err(ApiError::ControllerInput(
                "Trying to write a non-spare-sized spare buffer",
            ));
        }
        self.write_page_data(block, page, data, 0)?;
        self.write_page_spare(block, page, spare, 0)
    }

    fn write_page_data(&mut self, block: u16, page: u16, data: &[u8], offs: u16) -> Result<()> {
        let addr = self.page_addr(block, page)?;
        let area = self.attr.page_data_size as usize;
        self.write_area(addr, area, data, offs)
    }

    fn write_page_spare(&mut self, block: u16, page: u16, spare: &[u8], offs: u16) -> Result<()> {
        let addr = self.spare_addr(block, page)?;
        let area = self.attr.spare_size as usize;
        self.write_area(addr, area, spare, offs)
    }

    fn read_page(&self, block: u16, page: u16, data: &mut [u8], spare: &mut [u8]) -> Result<()> {
        if data.len() != self.attr.page_data_size as usize
            || spare.len() != self.attr.spare_size as usize
        {
            return Err(ApiError::ControllerInput(
                "Trying to read with wrongly sized page buffers",
            ));
        }
        self.read_page_data(block, page, data, 0)?;
        self.read_page_spare(block, page, spare, 0)
    }

    fn read_page_data(&self, block: u16, page: u16, data: &mut [u8], offs: u16) -> Result<()> {
        let addr = self.page_addr(block, page)?;
        let area = self.attr.page_data_size as usize;
        self.read_area(addr, area, data, offs)
    }

    fn read_page_spare(&self, block: u16, page: u16, spare: &mut [u8], offs: u16) -> Result<()> {
        let addr = self.spare_addr(block, page)?;
        let area = self.attr.spare_size as usize;
        self.read_area(addr, area, spare, offs)
    }
}

/// Either open or create the specified file path.
/// If the path already exists, check that the image represented by it has
/// the correct size.
/// If any one of the intermediate calls fails, the result of this method is
/// not an actual image file
fn mmap_path<P: AsRef<Path>>(path: P, img_size: u64, ex: DiskState) -> Result<MmapMut> {
    let exists = DiskState::new(path.as_ref().exists());
    if exists != ex {
        if ex == Load {
            return Err(ApiError::ControllerInput(
                "Tried to load a non-existing file path",
            ));
        } else {
            return Err(ApiError::ControllerInput(
                "Tried to create a pre-existing file path",
            ));
        }
    }

    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;

    if ex == Load {
        if f.metadata()?.len() != img_size {
            return Err(ApiError::ControllerInput(
                "Image size does not match the chip geometry",
            ));
        }
    } else {
        f.set_len(img_size)?;
    }

    let data = unsafe { memmap::MmapOptions::new().map_mut(&f)? };
    Ok(data)
}

/// File-backed serialization store.
///
/// `begin_serialize` truncates the file and writes a framing
/// [`StateHeader`]; `begin_deserialize` reads the header back and rejects
/// the stream if it was written by a different build or for a different
/// chip. Integers are encoded little-endian after the header.
#[derive(Debug)]
pub struct StateFile {
    attr: StorageAttr,
    file: File,
}

impl StateFile {
    /// Open a state file for writing, creating it if needed.
    /// The file is not touched until `begin_serialize` runs
    pub fn create<P: AsRef<Path>>(path: P, attr: &StorageAttr) -> Result<StateFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(StateFile { attr: *attr, file })
    }

    /// Open an existing state file for reading.
    /// This function will return an error if the file does not exist
    pub fn open<P: AsRef<Path>>(path: P, attr: &StorageAttr) -> Result<StateFile> {
        if !path.as_ref().exists() {
            return Err(ApiError::StoreInput(
                "Tried to open a non-existing state file",
            ));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(StateFile { attr: *attr, file })
    }
}

impl SerializeOps for StateFile {
    fn begin_serialize(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        bincode::serialize_into(&mut self.file, &StateHeader::for_attr(&self.attr))?;
        Ok(())
    }

    fn end_serialize(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.file.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn write_u16(&mut self, value: u16) -> Result<()> {
        self.file.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.file.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn begin_deserialize(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let header: StateHeader = bincode::deserialize_from(&mut self.file)?;
        if !header.matches(&self.attr) {
            return Err(ApiError::StoreInput(
                "State header does not match this device",
            ));
        }
        Ok(())
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.file.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.file.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.file.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}

/// Memory-backed serialization store.
///
/// Keeps the whole stream in a `Vec<u8>` with a separate read cursor.
/// Mainly used by tests, which need to inspect, truncate and corrupt
/// streams at byte granularity, but also usable as a RAM-resident state
/// area on targets without a file system
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl StateBuffer {
    /// Create an empty store
    pub fn new() -> StateBuffer {
        StateBuffer::default()
    }

    /// Create a store holding the given stream, with the read cursor at the
    /// start
    pub fn from_bytes(bytes: Vec<u8>) -> StateBuffer {
        StateBuffer { buf: bytes, pos: 0 }
    }

    /// Consume the store and hand out the stream written so far
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// The stream written so far
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Length of the stream written so far, in bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Is the store empty?
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.buf.len() {
            return Err(ApiError::SourceExhausted(
                "Read past the end of the state buffer",
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}

impl SerializeOps for StateBuffer {
    fn begin_serialize(&mut self) -> Result<()> {
        self.buf.clear();
        self.pos = 0;
        Ok(())
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn write_u16(&mut self, value: u16) -> Result<()> {
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.buf.push(value);
        Ok(())
    }

    fn begin_deserialize(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

// Tests for the emulated chip and the state stores.
//
// The image tests set up their own uniquely named directories so that they
// can run in parallel, in the same way the higher-level tests in fs-tests
// do.
#[cfg(test)]
mod tests {

    use super::{FlashImage, StateBuffer, StateFile};
    use crate::ops::{FlashOps, SerializeOps};
    use crate::types::{StorageAttr, DEV_TYPE_EMU, MAN_ID_SIMRAM};
    use std::fs::{create_dir_all, remove_dir, remove_file};
    use std::path::{Path, PathBuf};

    // For these tests, we use a toy chip with 8 blocks of 4 pages each
    fn test_attr() -> StorageAttr {
        StorageAttr {
            dev_type: DEV_TYPE_EMU,
            maker: MAN_ID_SIMRAM,
            id: 0,
            total_blocks: 8,
            block_data_size: 4 * 64,
            page_data_size: 64,
            spare_size: 8,
            pages_per_block: 4,
            block_status_offs: 5,
        }
    }

    //Returns the path to the image we will use during the tests
    //To avoid parallel tests from overlapping, each test passes in its own
    //unique `name` string, so it gets access to its own resources
    fn image_prep_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("flash-images-controller-".to_string() + name);
        path.push("img");

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

    //Destruct the given image and remove the parent directory it was located in
    fn image_destruct(img: FlashImage, path: &Path) {
        img.destruct();
        remove_dir(path.parent().unwrap()).unwrap(); //Safety measure; will only delete an empty directory
    }

    #[test]
    fn create_image_test() {
        let path = image_prep_path("create");
        let attr = test_attr();
        let mut img = FlashImage::new(&path, &attr).unwrap();

        //A fresh chip reads back erased everywhere
        let mut data = vec![0u8; 64];
        let mut spare = vec![0u8; 8];
        img.read_page(0, 0, &mut data, &mut spare).unwrap();
        assert_eq!(data, vec![0xFF; 64]);
        assert_eq!(spare, vec![0xFF; 8]);
        img.read_page(7, 3, &mut data, &mut spare).unwrap();
        assert_eq!(data, vec![0xFF; 64]);

        //Out-of-range coordinates are rejected
        assert!(img.read_page(8, 0, &mut data, &mut spare).is_err());
        assert!(img.read_page(0, 4, &mut data, &mut spare).is_err());
        assert!(img.write_page(8, 0, &data, &spare).is_err());

        //Wrongly sized buffers are rejected
        assert!(img.write_page(0, 0, &data[..10], &spare).is_err());
        assert!(img.write_page(0, 0, &data, &spare[..2]).is_err());

        //Write a page and read it back
        let wdata = vec![0xAB; 64];
        let wspare = vec![0xCD; 8];
        img.write_page(3, 1, &wdata, &wspare).unwrap();
        img.read_page(3, 1, &mut data, &mut spare).unwrap();
        assert_eq!(data, wdata);
        assert_eq!(spare, wspare);

        //Partial writes land at the right offset and stay in bounds
        img.write_page_data(3, 2, &[1, 2, 3], 10).unwrap();
        let mut part = vec![0u8; 5];
        img.read_page_data(3, 2, &mut part, 9).unwrap();
        assert_eq!(part, vec![0xFF, 1, 2, 3, 0xFF]);
        assert!(img.write_page_data(3, 2, &[0; 4], 61).is_err());
        assert!(img.read_page_spare(3, 2, &mut part, 4).is_err());

        image_destruct(img, &path);
        assert!(!path.exists());
    }

    #[test]
    fn erase_and_bad_block_test() {
        let path = image_prep_path("erase");
        let attr = test_attr();
        let mut img = FlashImage::new(&path, &attr).unwrap();

        let wdata = vec![0x55; 64];
        let wspare = vec![0x66; 8];
        for page in 0..4 {
            img.write_page(2, page, &wdata, &wspare).unwrap();
        }
        img.erase_block(2).unwrap();
        let mut data = vec![0u8; 64];
        let mut spare = vec![0u8; 8];
        img.read_page(2, 3, &mut data, &mut spare).unwrap();
        assert_eq!(data, vec![0xFF; 64]);
        assert_eq!(spare, vec![0xFF; 8]);

        //Fresh blocks are good; a marked block reads back bad
        assert!(!img.is_block_bad(5).unwrap());
        img.mark_bad(5).unwrap();
        assert!(img.is_block_bad(5).unwrap());
        //The mark lives in the status byte, the rest of the spare is untouched
        img.read_page_spare(5, 0, &mut spare, 0).unwrap();
        assert_eq!(spare[5], 0xF0);
        assert_eq!(spare[0], 0xFF);

        assert!(img.is_block_bad(8).is_err());

        image_destruct(img, &path);
    }

    #[test]
    fn load_existing_image_test() {
        let path = image_prep_path("load");
        let attr = test_attr();
        let mut img = FlashImage::new(&path, &attr).unwrap();

        let wdata = vec![0x11; 64];
        let wspare = vec![0x22; 8];
        img.write_page(6, 0, &wdata, &wspare).unwrap();
        img.mark_bad(1).unwrap();

        //Close the image by dropping it
        drop(img);

        //Reopen the image and assert that our old data is still there
        let img = FlashImage::load(&path, &attr).unwrap();
        let mut data = vec![0u8; 64];
        let mut spare = vec![0u8; 8];
        img.read_page(6, 0, &mut data, &mut spare).unwrap();
        assert_eq!(data, wdata);
        assert_eq!(spare, wspare);
        assert!(img.is_block_bad(1).unwrap());

        //Loading with the wrong geometry must fail
        let mut small = attr;
        small.total_blocks = 4;
        small.block_data_size = 4 * 64;
        assert!(FlashImage::load(&path, &small).is_err());

        image_destruct(img, &path);
        assert!(!path.exists());
    }

    #[test]
    fn state_buffer_test() {
        let mut store = StateBuffer::new();
        store.begin_serialize().unwrap();
        store.write_u16(0x1234).unwrap();
        store.write_u8(0xAB).unwrap();
        store.write_u32(0xDEADBEEF).unwrap();
        store.end_serialize().unwrap();

        //Little-endian on the wire
        assert_eq!(
            store.bytes(),
            &[0x34, 0x12, 0xAB, 0xEF, 0xBE, 0xAD, 0xDE][..]
        );

        store.begin_deserialize().unwrap();
        assert_eq!(store.read_u16().unwrap(), 0x1234);
        assert_eq!(store.read_u8().unwrap(), 0xAB);
        assert_eq!(store.read_u32().unwrap(), 0xDEADBEEF);
        //The stream is exhausted now
        assert!(store.read_u8().is_err());

        //A truncated copy runs dry mid-read
        let bytes = store.into_bytes();
        let mut short = StateBuffer::from_bytes(bytes[..3].to_vec());
        short.begin_deserialize().unwrap();
        assert_eq!(short.read_u16().unwrap(), 0x1234);
        assert!(short.read_u32().is_err());
    }

    #[test]
    fn state_file_test() {
        let path = image_prep_path("state");
        let attr = test_attr();

        {
            let mut store = StateFile::create(&path, &attr).unwrap();
            store.begin_serialize().unwrap();
            store.write_u16(7).unwrap();
            store.write_u32(1000).unwrap();
            store.write_u8(1).unwrap();
            store.end_serialize().unwrap();
        }

        let mut store = StateFile::open(&path, &attr).unwrap();
        store.begin_deserialize().unwrap();
        assert_eq!(store.read_u16().unwrap(), 7);
        assert_eq!(store.read_u32().unwrap(), 1000);
        assert_eq!(store.read_u8().unwrap(), 1);
        //Reading past the written stream fails
        assert!(store.read_u8().is_err());
        drop(store);

        //A stream written for a different chip is rejected at the header
        let mut other = attr;
        other.total_blocks = 16;
        let mut store = StateFile::open(&path, &other).unwrap();
        assert!(store.begin_deserialize().is_err());
        drop(store);

        remove_file(&path).unwrap();
        remove_dir(path.parent().unwrap()).unwrap();
    }
}
