//! Reading entries a chunk at a time.
//!
//! [`InflateReader`] inflates one entry into a small holding buffer
//! as it's read, so large files never have to fit in memory at once.

use std::fs::File;
use std::io::{self, prelude::*, SeekFrom};
use std::str::FromStr;
use std::sync::Mutex;

use flate2::{Decompress, FlushDecompress, Status};
use log::*;

use crate::read::{lock, Entry};
use crate::result::*;

/// Size of the holding buffer, and of each read from a backing file
pub const CHUNK: usize = 16 * 1024;

/// What a stream will be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate the override file.
    Write,
    /// Create or append to the override file.
    Append,
}

impl FromStr for OpenMode {
    type Err = std::convert::Infallible;

    /// Parses an `fopen()`-style mode: anything with a `w` writes,
    /// anything with an `a` appends, everything else reads.
    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        Ok(if mode.contains('w') {
            OpenMode::Write
        } else if mode.contains('a') {
            OpenMode::Append
        } else {
            OpenMode::Read
        })
    }
}

/// Compressed bytes waiting to be inflated
enum Input<'c> {
    /// The rest of an in-memory payload
    Resident(&'c [u8]),
    /// A payload in the container's file, read a chunk at a time
    File {
        file: &'c Mutex<File>,
        /// Where the next chunk starts in the file
        offset: u64,
        /// Payload bytes not yet read from the file
        remaining: u64,
        buffer: Box<[u8]>,
        start: usize,
        end: usize,
    },
}

impl Input<'_> {
    /// Returns input that hasn't been inflated yet,
    /// reading another chunk from the file if we've run out.
    ///
    /// Empty only once the whole payload has been consumed.
    fn pending(&mut self) -> DatapackResult<&[u8]> {
        match self {
            Input::Resident(rest) => Ok(*rest),
            Input::File {
                file,
                offset,
                remaining,
                buffer,
                start,
                end,
            } => {
                if *start == *end && *remaining > 0 {
                    let want = (*remaining).min(buffer.len() as u64) as usize;
                    let mut file = lock(*file);
                    file.seek(SeekFrom::Start(*offset))?;
                    file.read_exact(&mut buffer[..want])
                        .map_err(|e| truncated_on_eof(e, "Entry data extends past end of pack"))?;
                    trace!("Read {want} compressed bytes at {offset}");
                    *offset += want as u64;
                    *remaining -= want as u64;
                    *start = 0;
                    *end = want;
                }
                Ok(&buffer[*start..*end])
            }
        }
    }

    fn consume(&mut self, amount: usize) {
        match self {
            Input::Resident(rest) => {
                let all = *rest;
                *rest = &all[amount..];
            }
            Input::File { start, .. } => *start += amount,
        }
    }
}

/// Inflates an entry as it's read.
///
/// Reads return 0 once the entry's full size has been produced.
/// If the compressed data is bad, the read that finds out returns an error,
/// and so does every read after it.
pub struct InflateReader<'c> {
    name: String,
    size: usize,
    inflater: Decompress,
    input: Input<'c>,
    /// Inflated bytes waiting to be read
    holding: Box<[u8]>,
    filled: usize,
    finished: bool,
    failed: bool,
}

impl<'c> InflateReader<'c> {
    /// Reads the entry from compressed bytes already in memory.
    pub fn new(entry: &Entry, compressed: &'c [u8]) -> Self {
        Self::with_input(entry, Input::Resident(compressed))
    }

    /// Reads the entry from `offset` in the given file.
    pub(crate) fn from_file(entry: &Entry, file: &'c Mutex<File>, offset: u64) -> Self {
        let input = Input::File {
            file,
            offset,
            remaining: entry.compressed_size as u64,
            buffer: vec![0; CHUNK].into_boxed_slice(),
            start: 0,
            end: 0,
        };
        Self::with_input(entry, input)
    }

    fn with_input(entry: &Entry, input: Input<'c>) -> Self {
        debug!("Streaming {}", entry.name_lossy());
        Self {
            name: entry.name_lossy().into_owned(),
            size: entry.size,
            inflater: Decompress::new(true),
            input,
            holding: vec![0; CHUNK].into_boxed_slice(),
            filled: 0,
            finished: false,
            failed: false,
        }
    }

    /// The number of inflated bytes produced so far, read or not
    pub fn total_out(&self) -> u64 {
        self.inflater.total_out()
    }

    /// Runs one inflation step, topping up the holding buffer.
    fn fill(&mut self) -> DatapackResult<()> {
        if self.finished || self.filled == self.holding.len() {
            return Ok(());
        }

        let input = self.input.pending()?;
        let before_in = self.inflater.total_in();
        let before_out = self.inflater.total_out();
        let status = self
            .inflater
            .decompress(
                input,
                &mut self.holding[self.filled..],
                FlushDecompress::None,
            )
            .map_err(|e| DatapackError::Corrupt(format!("{}: {e}", self.name)))?;
        let consumed = (self.inflater.total_in() - before_in) as usize;
        let produced = (self.inflater.total_out() - before_out) as usize;
        self.input.consume(consumed);
        self.filled += produced;

        let total_out = self.inflater.total_out();
        if total_out > self.size as u64 {
            return Err(DatapackError::Corrupt(format!(
                "{}: inflates past its size of {} bytes",
                self.name, self.size
            )));
        }

        match status {
            Status::StreamEnd => {
                self.finished = true;
                if total_out != self.size as u64 {
                    return Err(DatapackError::Corrupt(format!(
                        "{}: inflated to {total_out} bytes, expected {}",
                        self.name, self.size
                    )));
                }
            }
            Status::Ok | Status::BufError => {
                // There was room for output, so no progress means
                // we're out of input before the end of the stream.
                if consumed == 0 && produced == 0 {
                    return Err(DatapackError::Corrupt(format!(
                        "{}: compressed stream ended early ({total_out} of {} bytes)",
                        self.name, self.size
                    )));
                }
            }
        }
        Ok(())
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> DatapackResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.fill()?;
        while self.filled == 0 && !self.finished {
            self.fill()?;
        }

        let amount = buf.len().min(self.filled);
        buf[..amount].copy_from_slice(&self.holding[..amount]);
        self.holding.copy_within(amount..self.filled, 0);
        self.filled -= amount;
        Ok(amount)
    }
}

impl Read for InflateReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.failed {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{}: stream failed earlier", self.name),
            ));
        }
        self.read_inner(buf).map_err(|e| {
            self.failed = true;
            e.into()
        })
    }
}

/// A stream opened with [`Container::open_stream()`]
///
/// [`Container::open_stream()`]: ../read/struct.Container.html#method.open_stream
pub enum Stream<'c> {
    /// Inflating packed data
    Packed(InflateReader<'c>),
    /// A file in the override directory
    Local(File),
}

impl Stream<'_> {
    /// True if this reads packed data rather than an override file
    pub fn is_packed(&self) -> bool {
        matches!(self, Stream::Packed(_))
    }

    /// Closes the stream. Dropping it does the same.
    pub fn close(self) {}
}

impl Read for Stream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Packed(r) => r.read(buf),
            Stream::Local(f) => f.read(buf),
        }
    }
}

impl Write for Stream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Packed(r) => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is packed and can't be written", r.name),
            )),
            Stream::Local(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Packed(_) => Ok(()),
            Stream::Local(f) => f.flush(),
        }
    }
}
