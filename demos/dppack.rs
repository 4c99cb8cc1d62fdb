use anyhow::*;
use camino::Utf8PathBuf;
use structopt::*;

use datapack::PackWriter;

#[derive(Debug, StructOpt)]
#[structopt(name = "dppack", about = "Packs files into a datapack")]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// zlib compression level, 0-9
    #[structopt(short, long, default_value = "6")]
    level: u32,

    #[structopt(name("datapack"))]
    output: Utf8PathBuf,

    /// Files to pack, as NAME=PATH, or just PATH to use the path as its name
    #[structopt(name("files"))]
    files: Vec<String>,
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    if args.level > 9 {
        bail!("Compression level {} isn't between 0 and 9", args.level);
    }

    let mut pack = PackWriter::new();
    pack.level(flate2::Compression::new(args.level));
    for file in &args.files {
        let (name, path) = file.split_once('=').unwrap_or((file.as_str(), file.as_str()));
        pack.add_file(name, path)
            .with_context(|| format!("Couldn't pack {} as {}", path, name))?;
    }
    pack.write_file(&args.output)
        .with_context(|| format!("Couldn't write {}", args.output))?;
    Ok(())
}
