//! Code specific to the datapack container layout.
//!
//! We try to keep the nitty gritty here,
//! and higher-level stuff in the [`read`] and [`write`] modules.
//!
//! A container file looks like this, all integers big-endian:
//!
//! ```text
//! magic                    8 bytes  ("DATAPACK")
//! version                  1 byte   (1)
//! offset of entry table    2 bytes
//! number of entries        2 bytes
//!
//! [entry record 1]
//! .
//! .
//! [entry record n]
//!
//! Entry record:
//!   compressed size        4 bytes
//!   uncompressed size      4 bytes
//!   file name length       4 bytes
//!   file name              (variable size, not terminated)
//!   compressed data        (compressed size bytes, zlib)
//! ```
//!
//! Programs that link their table into the executable instead use
//! a NULL-terminated array of pointers to [`RawEntry`].
//!
//! [`read`]: ../read/index.html
//! [`write`]: ../write/index.html

use crate::result::*;

/// Datapack magic number, found at the very start of a container file
pub const MAGIC: [u8; 8] = *b"DATAPACK";

/// The only container version we know how to read (or write).
pub const VERSION: u8 = 1;

/// Size of the magic number and header, which is also where the writer
/// places the entry table.
pub const HEADER_SIZE: usize = MAGIC.len() + 1 + 2 + 2;

/// Size of the fixed part of an entry record, before the file name
pub const RECORD_HEADER_SIZE: usize = 4 + 4 + 4;

/// The symbol a packed executable exports its entry table under
pub const FILETABLE_SYMBOL: &str = "datapack_filetable";

/// Reads a big-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_be_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a big-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_be_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

/// Data from the container header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub table_offset: u16,
    pub entries: u16,
}

impl Header {
    /// Parses the magic number and header from the front of a container.
    ///
    /// `header` may be longer than [`HEADER_SIZE`]; the rest is ignored.
    pub fn parse(mut header: &[u8]) -> DatapackResult<Self> {
        if header.len() < HEADER_SIZE {
            return Err(DatapackError::InvalidPack("Too short for a datapack header"));
        }
        if header[..MAGIC.len()] != MAGIC {
            return Err(DatapackError::InvalidPack("Missing DATAPACK magic"));
        }
        header = &header[MAGIC.len()..];

        let version = header[0];
        header = &header[1..];
        if version != VERSION {
            return Err(DatapackError::UnsupportedVersion(version));
        }

        let table_offset = read_u16(&mut header);
        let entries = read_u16(&mut header);

        // The table can't overlap the header.
        if (table_offset as usize) < HEADER_SIZE {
            return Err(DatapackError::InvalidPack("Entry table offset inside header"));
        }

        Ok(Self {
            version,
            table_offset,
            entries,
        })
    }

    /// Header for a container the writer lays out itself,
    /// with the table right after the header.
    pub fn new(entries: u16) -> Self {
        Self {
            version: VERSION,
            table_offset: HEADER_SIZE as u16,
            entries,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8] = self.version;
        buf[9..11].copy_from_slice(&self.table_offset.to_be_bytes());
        buf[11..13].copy_from_slice(&self.entries.to_be_bytes());
        buf
    }
}

/// The fixed-size front of an entry record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name_length: u32,
}

impl RecordHeader {
    pub fn parse(bytes: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let mut record = &bytes[..];
        let compressed_size = read_u32(&mut record);
        let uncompressed_size = read_u32(&mut record);
        let name_length = read_u32(&mut record);
        Self {
            compressed_size,
            uncompressed_size,
            name_length,
        }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.compressed_size.to_be_bytes());
        buf[4..8].copy_from_slice(&self.uncompressed_size.to_be_bytes());
        buf[8..12].copy_from_slice(&self.name_length.to_be_bytes());
        buf
    }
}

/// An entry record parsed out of an in-memory container,
/// including its name and compressed payload
#[derive(Debug)]
pub struct Record<'a> {
    pub header: RecordHeader,
    pub name: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> Record<'a> {
    /// Parses a record from the front of `table`, advancing it past the payload.
    pub fn parse_and_consume(table: &mut &'a [u8]) -> DatapackResult<Self> {
        let fixed: &[u8; RECORD_HEADER_SIZE] = table
            .get(..RECORD_HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(DatapackError::Truncated("Entry table ends mid-record"))?;
        let header = RecordHeader::parse(fixed);
        let rest = &table[RECORD_HEADER_SIZE..];

        let name_length = crate::arch::usize(header.name_length)?;
        if rest.len() < name_length {
            return Err(DatapackError::Truncated("Entry table ends mid-name"));
        }
        let (name, rest) = rest.split_at(name_length);
        if name.is_empty() {
            return Err(DatapackError::InvalidPack("Entry with an empty name"));
        }

        let compressed_size = crate::arch::usize(header.compressed_size)?;
        if rest.len() < compressed_size {
            return Err(DatapackError::Truncated("Entry data extends past end of pack"));
        }
        let (payload, rest) = rest.split_at(compressed_size);
        *table = rest;

        Ok(Self {
            header,
            name,
            payload,
        })
    }
}

/// An entry as laid out by packer-generated code linked into a program.
///
/// Matches the C packer's `struct datapack_file_entry`.
/// A table of these is a NULL-terminated array of `*const RawEntry`.
#[repr(C)]
#[derive(Debug)]
pub struct RawEntry {
    /// NUL-terminated file name
    pub filename: *const std::os::raw::c_char,
    /// Compressed data
    pub data: *const u8,
    pub compressed_size: usize,
    pub size: usize,
}
