use std::fs::{self, File};
use std::io::{self, prelude::*};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use log::*;
use memmap2::Mmap;
use rayon::prelude::*;

use datapack::format::{Header, RecordHeader, HEADER_SIZE, RECORD_HEADER_SIZE};
use datapack::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn utf8_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8Path::from_path(dir.path())
        .expect("Temp directory isn't UTF-8")
        .to_owned()
}

/// Bigger than a few stream chunks, and not very compressible
fn big_contents() -> Vec<u8> {
    let mut state = 0xdead_beefu32;
    (0..100_000)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

fn sample_pack() -> Result<Vec<u8>> {
    let mut pack = PackWriter::new();
    pack.add("greeting", b"hello world\n")?
        .add("empty", b"")?
        .add("nested/dir/big.bin", big_contents())?
        .add("config.ini", b"[main]\nspeed = 11\n")?;
    Ok(pack.to_vec()?)
}

fn write_sample(dir: &Utf8Path) -> Result<Utf8PathBuf> {
    let path = dir.join("sample.pak");
    fs::write(&path, sample_pack()?).context("Couldn't write sample pack")?;
    Ok(path)
}

fn read_in_chunks<R: Read>(mut reader: R, chunk: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0; chunk];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

fn check_contents(pack: &Container) -> Result<()> {
    assert_eq!(pack.entries().len(), 4);

    let greeting = pack.unpack_filename("greeting")?;
    assert_eq!(&*greeting, b"hello world\n");
    assert_eq!(greeting.as_bytes_with_nul(), b"hello world\n\0");

    // Unpacking doesn't change the container.
    assert_eq!(pack.unpack_filename("greeting")?, greeting);

    assert!(pack.unpack_filename("empty")?.is_empty());
    assert_eq!(&*pack.unpack_filename("nested/dir/big.bin")?, &big_contents()[..]);
    assert_eq!(
        pack.unpack_filename("config.ini")?.to_str()?,
        "[main]\nspeed = 11\n"
    );

    match pack.unpack_filename("no/such/file") {
        Err(DatapackError::NoSuchFile(name)) => assert_eq!(name, "no/such/file"),
        Err(other) => panic!("Got incorrect error from a missing file: {:?}", other),
        Ok(_) => panic!("Got a file back from a name with no file"),
    }
    // Names are exact.
    assert!(pack.find("Greeting").is_none());
    assert!(pack.find("greeting ").is_none());
    Ok(())
}

#[test]
fn smoke() -> Result<()> {
    init_logging();
    let tempdir = tempfile::tempdir()?;
    let pack_path = write_sample(&utf8_dir(&tempdir))?;

    info!("Reading {pack_path} from disk");
    let from_file = Container::open(Some(&pack_path)).context("Couldn't open pack")?;
    check_contents(&from_file)?;
    from_file.close();

    info!("Reading {pack_path} from memory");
    let bytes = fs::read(&pack_path)?;
    check_contents(&Container::parse(&bytes)?)?;

    info!("Memory mapping {pack_path}");
    let pack_file = File::open(&pack_path).context("Couldn't open pack")?;
    let mapping = unsafe { Mmap::map(&pack_file).context("Couldn't mmap pack")? };
    check_contents(&Container::parse(&mapping)?)?;
    Ok(())
}

#[test]
fn streams_match_unpacking() -> Result<()> {
    init_logging();
    let tempdir = tempfile::tempdir()?;
    let pack_path = write_sample(&utf8_dir(&tempdir))?;
    let bytes = fs::read(&pack_path)?;

    let from_file = Container::open_file(&pack_path)?;
    let in_memory = Container::parse(&bytes)?;

    for pack in [&from_file, &in_memory] {
        for entry in pack.entries() {
            let whole = pack.unpack(entry)?;
            for chunk in [1, 17, whole.len() + 100] {
                let stream = pack.open_stream(&*entry.filename, OpenMode::Read)?;
                assert!(stream.is_packed());
                assert_eq!(
                    read_in_chunks(stream, chunk)?,
                    &*whole,
                    "{} in chunks of {chunk}",
                    entry.name_lossy()
                );
            }
        }
    }
    Ok(())
}

#[test]
fn overrides_take_precedence() -> Result<()> {
    init_logging();
    let tempdir = tempfile::tempdir()?;
    let dir = utf8_dir(&tempdir);
    let pack_path = write_sample(&dir)?;
    let local = dir.join("local");
    fs::create_dir_all(&local)?;
    fs::write(local.join("greeting"), b"hi from disk")?;
    // Not in the pack, so not visible through it.
    fs::write(local.join("extra.txt"), b"extra")?;

    let mut pack = Container::open_file(&pack_path)?;
    pack.set_override(Some(format!("{local}/")));
    assert_eq!(pack.overrides().dir(), Some(local.as_path()));

    assert_eq!(&*pack.unpack_filename("greeting")?, b"hi from disk");
    let mut stream = pack.open_stream("greeting", OpenMode::Read)?;
    assert!(!stream.is_packed());
    let mut streamed = String::new();
    stream.read_to_string(&mut streamed)?;
    assert_eq!(streamed, "hi from disk");
    drop(stream);

    // Entries without an override file come from the pack.
    assert_eq!(&*pack.unpack_filename("config.ini")?, b"[main]\nspeed = 11\n");
    assert_eq!(
        pack.unpack_filename("extra.txt").unwrap_err().kind(),
        ErrorKind::NotFound
    );

    // Once the file is gone, we're back to packed data.
    fs::remove_file(local.join("greeting"))?;
    assert_eq!(&*pack.unpack_filename("greeting")?, b"hello world\n");
    assert!(pack.open_stream("greeting", OpenMode::Read)?.is_packed());

    pack.set_override(None::<&str>);
    assert!(!pack.overrides().is_enabled());
    Ok(())
}

#[test]
fn shared_overrides() -> Result<()> {
    init_logging();
    let tempdir = tempfile::tempdir()?;
    let dir = utf8_dir(&tempdir);
    let bytes = sample_pack()?;
    fs::write(dir.join("config.ini"), b"[main]\nspeed = 88\n")?;

    let overrides = Arc::new(OverrideDir::new(Some(&dir)));
    let first = Container::parse(&bytes)?.with_override(overrides.clone());
    let second = Container::parse(&bytes)?.with_override(overrides);

    for pack in [&first, &second] {
        assert_eq!(&*pack.unpack_filename("config.ini")?, b"[main]\nspeed = 88\n");
    }
    Ok(())
}

#[test]
fn writing_needs_an_override_dir() -> Result<()> {
    init_logging();
    let tempdir = tempfile::tempdir()?;
    let dir = utf8_dir(&tempdir);
    let bytes = sample_pack()?;
    let mut pack = Container::parse(&bytes)?;

    match pack.open_stream("greeting", OpenMode::Write) {
        Err(e @ DatapackError::ReadOnly(_)) => assert_eq!(e.kind(), ErrorKind::Permission),
        Err(other) => panic!("Got incorrect error writing without overrides: {:?}", other),
        Ok(_) => panic!("Opened a packed file for writing"),
    }

    let local = dir.join("local");
    pack.set_override(Some(&local));
    assert_eq!(
        pack.open_stream("not-packed", OpenMode::Write)
            .err()
            .map(|e| e.kind()),
        Some(ErrorKind::NotFound)
    );

    // Parent directories get created as needed.
    let mut out = pack.open_stream("nested/dir/big.bin", OpenMode::Write)?;
    out.write_all(b"rewritten")?;
    out.close();
    assert_eq!(fs::read(local.join("nested/dir/big.bin"))?, b"rewritten");
    assert_eq!(&*pack.unpack_filename("nested/dir/big.bin")?, b"rewritten");

    let mut out = pack.open_stream("nested/dir/big.bin", "a".parse()?)?;
    out.write_all(b" and appended")?;
    drop(out);
    assert_eq!(
        &*pack.unpack_filename("nested/dir/big.bin")?,
        b"rewritten and appended"
    );

    // Write truncates.
    let mut out = pack.open_stream("nested/dir/big.bin", OpenMode::Write)?;
    out.write_all(b"short")?;
    drop(out);
    assert_eq!(&*pack.unpack_filename("nested/dir/big.bin")?, b"short");
    Ok(())
}

#[test]
fn parallel_unpacking() -> Result<()> {
    init_logging();
    let tempdir = tempfile::tempdir()?;
    let pack_path = write_sample(&utf8_dir(&tempdir))?;
    let pack = Container::open_file(&pack_path)?;

    // Every entry, many times over, from one file handle.
    let names: Vec<_> = pack.entries().iter().map(|e| e.filename.to_vec()).collect();
    let expected: Vec<_> = names
        .iter()
        .map(|n| pack.unpack_filename(n).map(Unpacked::into_vec))
        .collect::<Result<_, _>>()?;

    (0..16)
        .flat_map(|_| 0..names.len())
        .par_bridge()
        .try_for_each::<_, Result<()>>(|i| {
            let mut stream = pack.open_stream(&names[i], OpenMode::Read)?;
            let mut streamed = Vec::new();
            io::copy(&mut stream, &mut streamed)?;
            assert_eq!(streamed, expected[i]);
            assert_eq!(&*pack.unpack_filename(&names[i])?, &expected[i][..]);
            Ok(())
        })?;
    Ok(())
}

fn one_entry_pack() -> Result<Vec<u8>> {
    let mut pack = PackWriter::new();
    pack.add("greeting", b"hello world\n")?;
    Ok(pack.to_vec()?)
}

fn check_rejected(dir: &Utf8Path, bytes: &[u8], expected: ErrorKind) -> Result<()> {
    let path = dir.join("bad.pak");
    fs::write(&path, bytes)?;
    let from_file = Container::open_file(&path).map(|_| ()).map_err(|e| e.kind());
    let in_memory = Container::parse(bytes).map(|_| ()).map_err(|e| e.kind());
    assert_eq!(from_file, Err(expected), "opening {} bytes", bytes.len());
    assert_eq!(in_memory, Err(expected), "parsing {} bytes", bytes.len());
    Ok(())
}

#[test]
fn bad_packs() -> Result<()> {
    init_logging();
    let tempdir = tempfile::tempdir()?;
    let dir = utf8_dir(&tempdir);
    let good = one_entry_pack()?;

    let mut bad_magic = good.clone();
    bad_magic[..8].copy_from_slice(b"DATAPAKK");
    check_rejected(&dir, &bad_magic, ErrorKind::Format)?;

    let mut bad_version = good.clone();
    bad_version[8] = 2;
    check_rejected(&dir, &bad_version, ErrorKind::Format)?;

    check_rejected(&dir, &good[..HEADER_SIZE - 1], ErrorKind::Format)?;
    check_rejected(&dir, b"", ErrorKind::Format)?;

    // Header claims an entry the table doesn't have.
    check_rejected(&dir, &good[..HEADER_SIZE + 5], ErrorKind::Truncated)?;
    // Name cut off
    check_rejected(
        &dir,
        &good[..HEADER_SIZE + RECORD_HEADER_SIZE + 3],
        ErrorKind::Truncated,
    )?;
    // Payload cut off
    check_rejected(&dir, &good[..good.len() - 1], ErrorKind::Truncated)?;

    // Two entries claimed, one present
    let mut extra_entry = good.clone();
    extra_entry[..HEADER_SIZE].copy_from_slice(&Header::new(2).to_bytes());
    check_rejected(&dir, &extra_entry, ErrorKind::Truncated)?;

    // A name that claims far more bytes than the file has
    let mut huge_name = Header::new(1).to_bytes().to_vec();
    let record = RecordHeader {
        compressed_size: 0,
        uncompressed_size: 0,
        name_length: 0xFFFF_FFF0,
    };
    huge_name.extend_from_slice(&record.to_bytes());
    check_rejected(&dir, &huge_name, ErrorKind::Truncated)?;

    // No entries, but the table is past the end.
    let mut far_table = Header::new(0).to_bytes();
    far_table[9..11].copy_from_slice(&500u16.to_be_bytes());
    check_rejected(&dir, &far_table, ErrorKind::Truncated)?;

    // An empty pack is fine.
    let empty = PackWriter::new().to_vec()?;
    assert!(Container::parse(&empty)?.entries().is_empty());
    Ok(())
}

#[test]
fn corrupt_payloads() -> Result<()> {
    init_logging();
    let tempdir = tempfile::tempdir()?;
    let dir = utf8_dir(&tempdir);

    // Lie about the uncompressed size.
    let mut bytes = one_entry_pack()?;
    let record = HEADER_SIZE..HEADER_SIZE + RECORD_HEADER_SIZE;
    let mut header = RecordHeader::parse((&bytes[record.clone()]).try_into()?);
    header.uncompressed_size = 20;
    bytes[record].copy_from_slice(&header.to_bytes());

    let path = dir.join("liar.pak");
    fs::write(&path, &bytes)?;
    let pack = Container::open_file(&path)?;
    assert_eq!(
        pack.unpack_filename("greeting").unwrap_err().kind(),
        ErrorKind::Data
    );
    let stream = pack.open_stream("greeting", OpenMode::Read)?;
    let err = read_in_chunks(stream, 4).unwrap_err();
    assert_eq!(
        err.downcast_ref::<io::Error>().map(io::Error::kind),
        Some(io::ErrorKind::InvalidData)
    );
    Ok(())
}

#[test]
fn directories_dont_override() -> Result<()> {
    init_logging();
    let tempdir = tempfile::tempdir()?;
    let dir = utf8_dir(&tempdir);
    let bytes = sample_pack()?;
    fs::create_dir_all(dir.join("greeting"))?;

    let mut pack = Container::parse(&bytes)?;
    pack.set_override(Some(&dir));

    assert_eq!(&*pack.unpack_filename("greeting")?, b"hello world\n");
    let stream = pack.open_stream("greeting", OpenMode::Read)?;
    assert!(stream.is_packed());
    assert_eq!(read_in_chunks(stream, 5)?, b"hello world\n");
    Ok(())
}

#[test]
fn non_utf8_names_cant_be_written() -> Result<()> {
    init_logging();
    let tempdir = tempfile::tempdir()?;
    let dir = utf8_dir(&tempdir);

    let mut bytes = Header::new(1).to_bytes().to_vec();
    let payload = {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"bin")?;
        encoder.finish()?
    };
    let name = b"\xffname";
    let record = RecordHeader {
        compressed_size: payload.len() as u32,
        uncompressed_size: 3,
        name_length: name.len() as u32,
    };
    bytes.extend_from_slice(&record.to_bytes());
    bytes.extend_from_slice(name);
    bytes.extend_from_slice(&payload);

    let mut pack = Container::parse(&bytes)?;
    assert_eq!(&*pack.unpack_filename(name)?, b"bin");
    assert_eq!(
        pack.open_stream(name, OpenMode::Write).err().map(|e| e.kind()),
        Some(ErrorKind::Permission)
    );

    pack.set_override(Some(&dir));
    match pack.open_stream(name, OpenMode::Append) {
        Err(DatapackError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
        Err(other) => panic!("Got incorrect error appending to a non-UTF-8 name: {:?}", other),
        Ok(_) => panic!("Opened a non-UTF-8 name for appending"),
    }
    // Reading still works from the pack.
    assert!(pack.open_stream(name, OpenMode::Read)?.is_packed());
    Ok(())
}
