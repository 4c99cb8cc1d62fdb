//! datapack bundles a program's data files into one compressed container
//! and reads them back, either whole or as a stream:
//!
//! ```no_run
//! # use datapack::*;
//! let pack = Container::open_file("assets.pak")?;
//! let greeting = pack.unpack_filename("greeting")?;
//! assert_eq!(&*greeting, b"hello world\n");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Each file is compressed on its own,
//! so reading one never means inflating the others.
//! The container can live beside the program as a file,
//! be pulled into memory (or memory-mapped) and parsed in place,
//! or be linked right into the executable as a table of entries:
//!
//! ```no_run
//! # use std::io;
//! # use datapack::*;
//! // With no path, look for the table the running program exports.
//! let mut pack = Container::open(None::<&str>)?;
//!
//! // While developing, files on disk can stand in for packed ones.
//! pack.set_override(Some("assets/"));
//!
//! // Big files can be inflated a chunk at a time.
//! let mut level = pack.open_stream("levels/1.dat", OpenMode::Read)?;
//! io::copy(&mut level, &mut io::sink())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Containers are `Sync`, so many threads can unpack from one at a time.
//! Containers backed by a file take turns reading from it.

pub mod format;
pub mod overrides;
pub mod read;
pub mod result;
pub mod stream;
pub mod write;

pub use overrides::OverrideDir;
pub use read::{unpack, Container, EmbeddedEntry, Entry, Unpacked};
pub use result::{DatapackError, DatapackResult, ErrorKind};
pub use stream::{OpenMode, Stream};
pub use write::PackWriter;

mod arch;
