//! Tools for writing a datapack.
//!
//! [`PackWriter`] compresses files as they're added
//! and lays them out in the container format [`read`] understands.
//!
//! [`PackWriter`]: struct.PackWriter.html
//! [`read`]: ../read/index.html

use std::fs::File;
use std::io::{self, prelude::*, BufWriter};

use camino::Utf8Path;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::*;

use crate::format::{Header, RecordHeader};
use crate::result::*;

/// A compressed file waiting to be written
#[derive(Debug)]
struct PendingEntry {
    name: String,
    compressed: Vec<u8>,
    size: u32,
}

/// Builds a datapack container.
///
/// ```no_run
/// # use datapack::write::PackWriter;
/// let mut pack = PackWriter::new();
/// pack.add("greeting", b"hello world\n")?;
/// pack.add_file("help.txt", "docs/help.txt")?;
/// pack.write_file("assets.pak")?;
/// # Ok::<(), datapack::result::DatapackError>(())
/// ```
#[derive(Debug, Default)]
pub struct PackWriter {
    entries: Vec<PendingEntry>,
    level: Compression,
}

impl PackWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the zlib compression level for files added after this call.
    pub fn level(&mut self, level: Compression) -> &mut Self {
        self.level = level;
        self
    }

    /// Number of files added so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compresses and adds a file's contents.
    pub fn add<D: AsRef<[u8]>>(&mut self, name: &str, data: D) -> DatapackResult<&mut Self> {
        self.add_reader(name, data.as_ref())
    }

    /// Compresses and adds everything `reader` produces.
    pub fn add_reader<R: Read>(&mut self, name: &str, mut reader: R) -> DatapackResult<&mut Self> {
        self.check_name(name)?;

        let mut encoder = ZlibEncoder::new(Vec::new(), self.level);
        let size = io::copy(&mut reader, &mut encoder)?;
        let compressed = encoder.finish()?;

        let size = u32::try_from(size)
            .map_err(|_| DatapackError::TooLarge(format!("{name} is {size} bytes")))?;
        if u32::try_from(compressed.len()).is_err() {
            return Err(DatapackError::TooLarge(format!(
                "{name} compresses to {} bytes",
                compressed.len()
            )));
        }
        debug!("Packed {name}: {size} bytes -> {}", compressed.len());

        self.entries.push(PendingEntry {
            name: name.to_owned(),
            compressed,
            size,
        });
        Ok(self)
    }

    /// Compresses and adds the file at `path` under `name`.
    pub fn add_file<P: AsRef<Utf8Path>>(&mut self, name: &str, path: P) -> DatapackResult<&mut Self> {
        let path = path.as_ref();
        trace!("Reading {path} for {name}");
        let file = File::open(path)?;
        self.add_reader(name, file)
    }

    fn check_name(&self, name: &str) -> DatapackResult<()> {
        if name.is_empty() {
            return Err(DatapackError::InvalidPack("Entry with an empty name"));
        }
        if u32::try_from(name.len()).is_err() {
            return Err(DatapackError::TooLarge(format!(
                "name is {} bytes",
                name.len()
            )));
        }
        if self.entries.iter().any(|e| e.name == name) {
            return Err(DatapackError::DuplicateEntry(name.to_owned()));
        }
        if self.entries.len() >= u16::MAX as usize {
            return Err(DatapackError::TooLarge(format!(
                "more than {} entries",
                u16::MAX
            )));
        }
        Ok(())
    }

    /// Writes the container.
    pub fn write_to<W: Write>(&self, mut w: W) -> DatapackResult<()> {
        // check_name() keeps us within u16.
        let header = Header::new(self.entries.len() as u16);
        w.write_all(&header.to_bytes())?;

        for entry in &self.entries {
            let record = RecordHeader {
                compressed_size: entry.compressed.len() as u32,
                uncompressed_size: entry.size,
                name_length: entry.name.len() as u32,
            };
            trace!("{:?}", record);
            w.write_all(&record.to_bytes())?;
            w.write_all(entry.name.as_bytes())?;
            w.write_all(&entry.compressed)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Writes the container to the given path, replacing anything there.
    pub fn write_file<P: AsRef<Utf8Path>>(&self, path: P) -> DatapackResult<()> {
        let path = path.as_ref();
        debug!("Writing {} entries to {path}", self.entries.len());
        self.write_to(BufWriter::new(File::create(path)?))
    }

    /// Writes the container to a new buffer.
    pub fn to_vec(&self) -> DatapackResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }
}
