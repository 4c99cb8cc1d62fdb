use std::fs::{self, File};
use std::io;
use std::sync::Arc;

use anyhow::*;
use camino::{Utf8Path, Utf8PathBuf};
use log::*;
use memmap2::Mmap;
use rayon::prelude::*;
use structopt::*;

use datapack::*;

#[derive(Debug, StructOpt)]
#[structopt(name = "dpunpack", about = "Dumps a datapack into the current directory")]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Change to the given directory before perfoming any operations.
    #[structopt(short = "C", long)]
    directory: Option<Utf8PathBuf>,

    /// Lists the files in the datapack instead of extracting them.
    #[structopt(short = "n", long)]
    dry_run: bool,

    /// Prefer files in this directory over packed ones.
    /// Defaults to $DATAPACK_OVERRIDE, if set.
    #[structopt(short = "o", long = "override")]
    override_dir: Option<Utf8PathBuf>,

    /// Memory-map the datapack instead of reading it through a file handle.
    #[structopt(short, long)]
    mmap: bool,

    #[structopt(name("datapack"))]
    pack_path: Utf8PathBuf,
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    // Resolve before changing directories.
    let pack_path = absolute(&args.pack_path)?;
    let overrides = Arc::new(match &args.override_dir {
        Some(dir) => OverrideDir::new(Some(absolute(dir)?)),
        None => OverrideDir::from_env(),
    });

    if let Some(chto) = &args.directory {
        std::env::set_current_dir(chto)
            .with_context(|| format!("Couldn't set working directory to {}", chto))?;
    }

    if args.mmap {
        info!("Memory mapping {}", pack_path);
        let pack_file = File::open(&pack_path).context("Couldn't open datapack")?;
        let mapping = unsafe { Mmap::map(&pack_file).context("Couldn't mmap datapack")? };
        let pack = Container::parse(&mapping)
            .context("Couldn't load datapack")?
            .with_override(overrides);
        run(&args, &pack)
    } else {
        let pack = Container::open_file(&pack_path)
            .context("Couldn't load datapack")?
            .with_override(overrides);
        run(&args, &pack)
    }
}

fn absolute(path: &Utf8Path) -> Result<Utf8PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_owned());
    }
    let cwd = Utf8PathBuf::from_path_buf(std::env::current_dir()?)
        .map_err(|p| anyhow!("Working directory {} isn't UTF-8", p.display()))?;
    Ok(cwd.join(path))
}

fn run(args: &Opt, pack: &Container) -> Result<()> {
    if args.dry_run {
        list_entries(pack)
    } else {
        unpack_all(pack)
    }
}

fn list_entries(pack: &Container) -> Result<()> {
    for entry in pack.entries() {
        println!(
            "{:>10} {:>10}  {}",
            entry.size,
            entry.compressed_size,
            entry.name_lossy()
        );
    }
    Ok(())
}

fn unpack_all(pack: &Container) -> Result<()> {
    pack.entries().par_iter().try_for_each(|entry| {
        let name = std::str::from_utf8(&entry.filename)
            .with_context(|| format!("{} isn't a UTF-8 path", entry.name_lossy()))?;
        let path = Utf8Path::new(name);
        if path.is_absolute() || path.components().any(|c| c.as_str() == "..") {
            bail!("Refusing to write {} outside the current directory", path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Couldn't create directory {}", parent))?;
        }
        let mut stream = pack.open_stream(name, OpenMode::Read)?;
        let mut sink =
            File::create(path).with_context(|| format!("Couldn't create file {}", path))?;
        io::copy(&mut stream, &mut sink)?;
        Ok(())
    })
}
