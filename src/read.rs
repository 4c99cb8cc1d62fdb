//! Tools for reading a datapack.
//!
//! To start reading, open a [`Container`]:
//! from a file with [`Container::open_file()`],
//! from bytes already in memory with [`Container::parse()`],
//! from a table linked into the program with [`Container::from_table()`],
//! or from the table a packed executable exports with
//! [`Container::open_process_image()`].
//!
//! [`Container`]: struct.Container.html
//! [`Container::open_file()`]: struct.Container.html#method.open_file
//! [`Container::parse()`]: struct.Container.html#method.parse
//! [`Container::from_table()`]: struct.Container.html#method.from_table
//! [`Container::open_process_image()`]: struct.Container.html#method.open_process_image

use std::borrow::Cow;
use std::ffi::CStr;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8Path;
use flate2::{Decompress, FlushDecompress, Status};
use log::*;

use crate::arch::usize;
use crate::format::{self, Header, RawEntry, Record, RecordHeader};
use crate::overrides::OverrideDir;
use crate::result::*;
use crate::stream::{InflateReader, OpenMode, Stream};

/// Where an entry's compressed bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource<'a> {
    /// Already in memory: linked into the program or part of a parsed buffer.
    Embedded(&'a [u8]),
    /// At the given offset in the file backing the entry's container.
    FileOffset(u64),
}

/// Metadata for a file in the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<'a> {
    /// The file's name. Unique within a container, never empty.
    pub filename: Cow<'a, [u8]>,

    /// Where to find the compressed bytes
    pub source: DataSource<'a>,

    /// Compressed size of the file in bytes
    pub compressed_size: usize,

    /// Uncompressed size of the file in bytes
    pub size: usize,
}

impl Entry<'_> {
    /// The file name, with invalid UTF-8 replaced for display.
    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.filename)
    }
}

/// An entry that carries its own compressed bytes.
///
/// Packer-generated Rust code builds a `static` slice of these,
/// which can be read directly with [`unpack()`]
/// or wrapped with [`Container::from_table()`].
///
/// [`unpack()`]: fn.unpack.html
/// [`Container::from_table()`]: struct.Container.html#method.from_table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedEntry {
    pub filename: &'static str,
    /// zlib-compressed contents
    pub data: &'static [u8],
    /// Uncompressed size of the file in bytes
    pub size: usize,
}

impl EmbeddedEntry {
    pub const fn new(filename: &'static str, data: &'static [u8], size: usize) -> Self {
        Self {
            filename,
            data,
            size,
        }
    }

    fn as_entry(&self) -> Entry<'static> {
        Entry {
            filename: Cow::Borrowed(self.filename.as_bytes()),
            source: DataSource::Embedded(self.data),
            compressed_size: self.data.len(),
            size: self.size,
        }
    }
}

/// A fully-inflated entry.
///
/// Dereferences to the file's contents.
/// A NUL byte follows them (see [`as_bytes_with_nul()`])
/// for callers handing text to C,
/// but isn't part of the contents: binary files can contain NULs of their own.
///
/// [`as_bytes_with_nul()`]: #method.as_bytes_with_nul
#[derive(Clone, PartialEq, Eq)]
pub struct Unpacked {
    /// Always ends with a NUL that isn't part of the contents
    bytes: Vec<u8>,
}

impl Unpacked {
    fn from_contents(mut bytes: Vec<u8>) -> Self {
        bytes.push(0);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 1]
    }

    /// The contents followed by a terminating NUL
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(self.as_bytes())
    }

    /// Returns the contents, without the terminator.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.bytes.pop();
        self.bytes
    }
}

impl Deref for Unpacked {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for Unpacked {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for Unpacked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unpacked")
            .field("len", &self.len())
            .finish()
    }
}

/// Inflates an entry that carries its own data.
///
/// No container, no override directory: just the bytes.
pub fn unpack(entry: &EmbeddedEntry) -> DatapackResult<Unpacked> {
    inflate(&entry.as_entry(), entry.data)
}

/// Inflates `compressed` into a buffer of exactly `entry.size` bytes (plus terminator).
fn inflate(entry: &Entry, compressed: &[u8]) -> DatapackResult<Unpacked> {
    let capacity = entry
        .size
        .checked_add(1)
        .ok_or(DatapackError::InsufficientAddressSpace)?;
    let mut out = Vec::new();
    out.try_reserve_exact(capacity)
        .map_err(|_| DatapackError::OutOfMemory(capacity))?;

    let mut inflater = Decompress::new(true);
    // decompress_vec() fills up to the vector's capacity,
    // which may exceed what we asked for.
    // Anything past entry.size is caught below.
    let status = inflater
        .decompress_vec(compressed, &mut out, FlushDecompress::Finish)
        .map_err(|e| DatapackError::Corrupt(format!("{}: {e}", entry.name_lossy())))?;

    if status != Status::StreamEnd {
        return Err(DatapackError::Corrupt(format!(
            "{}: compressed stream ended early ({} of {} bytes)",
            entry.name_lossy(),
            out.len(),
            entry.size
        )));
    }
    if out.len() != entry.size {
        return Err(DatapackError::Corrupt(format!(
            "{}: inflated to {} bytes, expected {}",
            entry.name_lossy(),
            out.len(),
            entry.size
        )));
    }
    Ok(Unpacked::from_contents(out))
}

/// What a container holds onto besides its entries
enum Backing {
    /// Entries point at memory the container doesn't own.
    ProcessImage,
    /// Entries are offsets into this file.
    File(Mutex<File>),
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::ProcessImage => f.write_str("ProcessImage"),
            Backing::File(_) => f.write_str("File"),
        }
    }
}

/// An open datapack
#[derive(Debug)]
pub struct Container<'a> {
    backing: Backing,
    entries: Vec<Entry<'a>>,
    overrides: Arc<OverrideDir>,
}

impl Container<'static> {
    /// Opens a container file, or if `path` is `None`,
    /// the table exported by the running process.
    pub fn open<P: AsRef<Utf8Path>>(path: Option<P>) -> DatapackResult<Self> {
        match path {
            Some(p) => Self::open_file(p),
            None => Self::open_process_table(),
        }
    }

    #[cfg(all(feature = "process-image", any(target_os = "linux", target_os = "macos")))]
    fn open_process_table() -> DatapackResult<Self> {
        Self::open_process_image()
    }

    #[cfg(not(all(feature = "process-image", any(target_os = "linux", target_os = "macos"))))]
    fn open_process_table() -> DatapackResult<Self> {
        Err(DatapackError::NoSuchSymbol(format::FILETABLE_SYMBOL.to_owned()))
    }

    /// Opens a container file.
    ///
    /// Validates the header and reads the entry table;
    /// file contents are only read when they're unpacked.
    pub fn open_file<P: AsRef<Utf8Path>>(path: P) -> DatapackResult<Self> {
        let path = path.as_ref();
        debug!("Opening {path}");
        let mut file = File::open(path)?;
        let file_length = file.metadata()?.len();

        let mut header_bytes = [0u8; format::HEADER_SIZE];
        file.read_exact(&mut header_bytes).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                DatapackError::InvalidPack("Too short for a datapack header")
            } else {
                DatapackError::Io(e)
            }
        })?;
        let header = Header::parse(&header_bytes)?;
        trace!("{:?}", header);

        if header.table_offset as u64 > file_length {
            return Err(DatapackError::Truncated("Entry table starts past end of pack"));
        }
        file.seek(SeekFrom::Start(header.table_offset as u64))?;

        let mut entries = Vec::with_capacity(header.entries as usize);
        for _ in 0..header.entries {
            let mut record_bytes = [0u8; format::RECORD_HEADER_SIZE];
            file.read_exact(&mut record_bytes)
                .map_err(|e| truncated_on_eof(e, "Entry table ends mid-record"))?;
            let record = RecordHeader::parse(&record_bytes);
            trace!("{:?}", record);

            // Check before allocating; the length is whatever the file says.
            let name_end = file.stream_position()? + record.name_length as u64;
            if name_end > file_length {
                return Err(DatapackError::Truncated("Entry table ends mid-name"));
            }
            let mut filename = vec![0u8; usize(record.name_length)?];
            file.read_exact(&mut filename)
                .map_err(|e| truncated_on_eof(e, "Entry table ends mid-name"))?;
            if filename.is_empty() {
                return Err(DatapackError::InvalidPack("Entry with an empty name"));
            }

            let payload_offset = file.stream_position()?;
            let payload_end = payload_offset + record.compressed_size as u64;
            if payload_end > file_length {
                return Err(DatapackError::Truncated(
                    "Entry data extends past end of pack",
                ));
            }
            // Seeking doesn't care about the end of the file,
            // hence the check above.
            file.seek(SeekFrom::Start(payload_end))?;

            let entry = Entry {
                filename: Cow::Owned(filename),
                source: DataSource::FileOffset(payload_offset),
                compressed_size: usize(record.compressed_size)?,
                size: usize(record.uncompressed_size)?,
            };
            debug!("{:?}", entry);
            entries.push(entry);
        }

        Ok(Self {
            backing: Backing::File(Mutex::new(file)),
            entries,
            overrides: Arc::default(),
        })
    }

    /// Wraps a table of self-contained entries, typically a `static`
    /// generated by the packer.
    pub fn from_table(table: &'static [EmbeddedEntry]) -> Self {
        Self::from_entries(table.iter().map(EmbeddedEntry::as_entry).collect())
    }

    /// Finds the entry table exported by the running process
    /// as `datapack_filetable`.
    ///
    /// This lets a single binary carry its own assets with no file I/O.
    /// The executable must export the symbol dynamically
    /// (e.g., link with `-rdynamic`) for the lookup to see it.
    #[cfg(all(feature = "process-image", any(target_os = "linux", target_os = "macos")))]
    pub fn open_process_image() -> DatapackResult<Self> {
        Self::open_process_image_symbol(format::FILETABLE_SYMBOL)
    }

    /// Like [`open_process_image()`](#method.open_process_image),
    /// but looks for the table under the given symbol.
    #[cfg(all(feature = "process-image", any(target_os = "linux", target_os = "macos")))]
    pub fn open_process_image_symbol(symbol: &str) -> DatapackResult<Self> {
        let c_symbol = std::ffi::CString::new(symbol)
            .map_err(|_| DatapackError::NoSuchSymbol(symbol.to_owned()))?;
        let table = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c_symbol.as_ptr()) };
        if table.is_null() {
            return Err(DatapackError::NoSuchSymbol(symbol.to_owned()));
        }
        debug!("Found {symbol} at {table:p}");
        // SAFETY: The packer exports the symbol as a NULL-terminated
        // array of pointers to RawEntry, all with static storage.
        unsafe { Self::from_raw_table(table as *const *const RawEntry) }
    }

    /// Wraps a NULL-terminated array of pointers to [`RawEntry`].
    ///
    /// # Safety
    ///
    /// `table` must point to such an array, and every entry's name and data
    /// must be valid (and unchanging) for the rest of the program.
    /// Names must be NUL-terminated.
    pub unsafe fn from_raw_table(table: *const *const RawEntry) -> DatapackResult<Self> {
        let mut entries = Vec::new();
        let mut cursor = table;
        while !(*cursor).is_null() {
            let raw: &'static RawEntry = &**cursor;
            let filename = CStr::from_ptr(raw.filename).to_bytes();
            if filename.is_empty() {
                return Err(DatapackError::InvalidPack("Entry with an empty name"));
            }
            let data: &'static [u8] = if raw.compressed_size == 0 {
                &[]
            } else {
                std::slice::from_raw_parts(raw.data, raw.compressed_size)
            };
            let entry = Entry {
                filename: Cow::Borrowed(filename),
                source: DataSource::Embedded(data),
                compressed_size: raw.compressed_size,
                size: raw.size,
            };
            debug!("{:?}", entry);
            entries.push(entry);
            cursor = cursor.add(1);
        }
        Ok(Self::from_entries(entries))
    }
}

impl<'a> Container<'a> {
    /// Reads a container already in memory,
    /// such as one pulled in with `include_bytes!()` or memory-mapped.
    ///
    /// Entries borrow their names and data from `bytes`.
    pub fn parse(bytes: &'a [u8]) -> DatapackResult<Self> {
        let header = Header::parse(bytes)?;
        trace!("{:?}", header);

        let mut table = bytes
            .get(header.table_offset as usize..)
            .ok_or(DatapackError::Truncated("Entry table starts past end of pack"))?;

        let mut entries = Vec::with_capacity(header.entries as usize);
        for _ in 0..header.entries {
            let record = Record::parse_and_consume(&mut table)?;
            trace!("{:?}", record.header);
            let entry = Entry {
                filename: Cow::Borrowed(record.name),
                source: DataSource::Embedded(record.payload),
                compressed_size: record.payload.len(),
                size: usize(record.header.uncompressed_size)?,
            };
            debug!("{:?}", entry);
            entries.push(entry);
        }
        Ok(Self::from_entries(entries))
    }

    fn from_entries(entries: Vec<Entry<'a>>) -> Self {
        Self {
            backing: Backing::ProcessImage,
            entries,
            overrides: Arc::default(),
        }
    }

    /// Prefers files in `dir` over packed entries, or stops doing so if `None`.
    pub fn set_override<P: AsRef<Utf8Path>>(&mut self, dir: Option<P>) {
        self.overrides = Arc::new(OverrideDir::new(dir));
    }

    /// Uses an override directory shared with other containers.
    pub fn with_override(mut self, overrides: Arc<OverrideDir>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn overrides(&self) -> &OverrideDir {
        &self.overrides
    }

    /// Returns the entries in the container, in table order.
    pub fn entries(&self) -> &[Entry<'a>] {
        &self.entries
    }

    /// Looks up an entry by its exact name.
    pub fn find<N: AsRef<[u8]>>(&self, filename: N) -> Option<&Entry<'a>> {
        let filename = filename.as_ref();
        self.entries.iter().find(|e| &*e.filename == filename)
    }

    /// Like [`find()`](#method.find), but not finding it is an error.
    pub fn lookup<N: AsRef<[u8]>>(&self, filename: N) -> DatapackResult<&Entry<'a>> {
        let filename = filename.as_ref();
        self.find(filename).ok_or_else(|| {
            DatapackError::NoSuchFile(String::from_utf8_lossy(filename).into_owned())
        })
    }

    /// Inflates the given entry, or reads its override if there is one.
    ///
    /// `entry` should come from this container;
    /// file offsets are meaningless elsewhere.
    pub fn unpack(&self, entry: &Entry) -> DatapackResult<Unpacked> {
        if let Some(local) = self.overrides.read(&entry.filename) {
            return Ok(Unpacked::from_contents(local));
        }

        match entry.source {
            DataSource::Embedded(data) => inflate(entry, data),
            DataSource::FileOffset(offset) => {
                let compressed = self.read_payload(entry, offset)?;
                inflate(entry, &compressed)
            }
        }
    }

    /// Finds the given file and inflates it (or reads its override).
    pub fn unpack_filename<N: AsRef<[u8]>>(&self, filename: N) -> DatapackResult<Unpacked> {
        let entry = self.lookup(filename)?;
        self.unpack(entry)
    }

    /// Opens a stream over the given file.
    ///
    /// Reading prefers the override directory, then inflates the packed data
    /// as it's read.
    /// Writing (or appending) goes to the override directory,
    /// and is only allowed for files that are already in the container.
    pub fn open_stream<N: AsRef<[u8]>>(
        &self,
        filename: N,
        mode: OpenMode,
    ) -> DatapackResult<Stream<'_>> {
        let entry = self.lookup(filename)?;

        if mode == OpenMode::Read {
            if let Some(path) = self.overrides.local_path(&entry.filename) {
                match File::open(&path).and_then(|f| Ok((f.metadata()?.is_file(), f))) {
                    Ok((true, file)) => {
                        debug!("Streaming {} from {path}", entry.name_lossy());
                        return Ok(Stream::Local(file));
                    }
                    Ok((false, _)) => warn!("Override {path} isn't a file, using packed data"),
                    Err(e) => trace!("No override at {path}: {e}"),
                }
            }
            return Ok(Stream::Packed(self.open_reader(entry)?));
        }

        if !self.overrides.is_enabled() {
            return Err(DatapackError::ReadOnly(entry.name_lossy().into_owned()));
        }
        let path = self.overrides.local_path(&entry.filename).ok_or_else(|| {
            DatapackError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} isn't UTF-8, so it has no override path", entry.name_lossy()),
            ))
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if mode == OpenMode::Append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        debug!("Opening {path} for {mode:?}");
        Ok(Stream::Local(options.open(&path)?))
    }

    /// Opens a streaming reader over the packed data, ignoring any override.
    pub fn open_reader<'c>(&'c self, entry: &'c Entry) -> DatapackResult<InflateReader<'c>> {
        match entry.source {
            DataSource::Embedded(data) => Ok(InflateReader::new(entry, data)),
            DataSource::FileOffset(offset) => match &self.backing {
                Backing::File(file) => Ok(InflateReader::from_file(entry, file, offset)),
                Backing::ProcessImage => Err(DatapackError::InvalidPack(
                    "File offset entry in a container without a file",
                )),
            },
        }
    }

    /// Reads an entry's compressed bytes out of the backing file.
    fn read_payload(&self, entry: &Entry, offset: u64) -> DatapackResult<Vec<u8>> {
        let file = match &self.backing {
            Backing::File(f) => f,
            Backing::ProcessImage => {
                return Err(DatapackError::InvalidPack(
                    "File offset entry in a container without a file",
                ))
            }
        };
        let mut compressed = Vec::new();
        compressed
            .try_reserve_exact(entry.compressed_size)
            .map_err(|_| DatapackError::OutOfMemory(entry.compressed_size))?;
        compressed.resize(entry.compressed_size, 0);

        let mut file = lock(file);
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut compressed)
            .map_err(|e| truncated_on_eof(e, "Entry data extends past end of pack"))?;
        Ok(compressed)
    }

    /// Closes the container, releasing its file if it has one.
    ///
    /// Dropping it does the same; this just says so in the logs.
    pub fn close(self) {
        match &self.backing {
            Backing::File(_) => debug!("Closing file with {} entries", self.entries.len()),
            Backing::ProcessImage => trace!("Releasing table of {} entries", self.entries.len()),
        }
    }
}

/// Locks the backing file.
///
/// Every user seeks before reading, so a panic mid-read
/// doesn't leave anything we rely on in a bad state.
pub(crate) fn lock(file: &Mutex<File>) -> MutexGuard<'_, File> {
    file.lock().unwrap_or_else(PoisonError::into_inner)
}
