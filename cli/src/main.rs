use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use log::*;
use memmap2::Mmap;
use rayon::prelude::*;
use structopt::StructOpt;

use zipcodec::read::{FileMetadata, ZipArchive};
use zipcodec::write::{EncodeOptions, ZipWriter};
use zipcodec::CompressionMethod;

#[derive(Debug, StructOpt)]
#[structopt(name = "zipcodec", about = "Packs files into .zip archives and back out again")]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Packs the given files and directories into a new .zip file
    Pack {
        /// DEFLATE each file instead of storing it as-is
        #[structopt(short, long)]
        deflate: bool,

        /// Comment stored at the end of the archive
        #[structopt(short, long)]
        comment: Option<String>,

        #[structopt(name("ZIP file"))]
        zip_path: PathBuf,

        /// Relative paths to archive. Directories are added recursively.
        #[structopt(name("files"), required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Dumps a .zip file into the current directory
    Unpack {
        /// Change to the given directory before writing anything.
        #[structopt(short = "C", long)]
        directory: Option<PathBuf>,

        #[structopt(name("ZIP file"))]
        zip_path: PathBuf,
    },

    /// Lists the contents of a .zip file
    List {
        #[structopt(name("ZIP file"))]
        zip_path: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    match args.command {
        Command::Pack {
            deflate,
            comment,
            zip_path,
            inputs,
        } => {
            let mut options = EncodeOptions::new();
            if deflate {
                options = options.compression_method(CompressionMethod::Deflate);
            }
            if let Some(c) = comment {
                options = options.comment(c);
            }
            pack(&zip_path, &inputs, options)
        }
        Command::Unpack {
            directory,
            zip_path,
        } => {
            // Map the archive first so a relative path still means
            // what it did before we change directories.
            let mapping = map(&zip_path)?;
            if let Some(chto) = directory {
                fs::create_dir_all(&chto)
                    .with_context(|| format!("Couldn't create directory {}", chto.display()))?;
                std::env::set_current_dir(&chto).with_context(|| {
                    format!("Couldn't set working directory to {}", chto.display())
                })?;
            }
            unpack(&mapping)
        }
        Command::List { zip_path } => list(&map(&zip_path)?),
    }
}

fn map(zip_path: &Path) -> Result<Mmap> {
    info!("Memory mapping {:#?}", zip_path);
    let zip_file = File::open(zip_path).context("Couldn't open zip file")?;
    let mapping = unsafe { Mmap::map(&zip_file).context("Couldn't mmap zip file")? };
    Ok(mapping)
}

fn pack(zip_path: &Path, inputs: &[PathBuf], options: EncodeOptions) -> Result<()> {
    let zip_file = File::create(zip_path)
        .with_context(|| format!("Couldn't create zip file {}", zip_path.display()))?;
    let mut zip = ZipWriter::with_options(BufWriter::new(zip_file), options);
    for input in inputs {
        add_path(&mut zip, input)?;
    }
    zip.finish().context("Couldn't finish zip file")?;
    Ok(())
}

fn add_path<W: Write>(zip: &mut ZipWriter<W>, path: &Path) -> Result<()> {
    let name = archive_name(path)?;
    let metadata =
        fs::metadata(path).with_context(|| format!("Couldn't stat {}", path.display()))?;

    if metadata.is_dir() {
        // "." and friends get their children added, but no entry of their own.
        if !name.is_empty() {
            zip.add_directory(&name)?;
        }
        let mut children = fs::read_dir(path)
            .with_context(|| format!("Couldn't list directory {}", path.display()))?
            .map(|child| child.map(|c| c.path()))
            .collect::<io::Result<Vec<_>>>()?;
        // Directory listings come back in whatever order the OS likes.
        children.sort();
        for child in &children {
            add_path(zip, child)?;
        }
    } else {
        ensure!(!name.is_empty(), "{} isn't a file", path.display());
        let content =
            fs::read(path).with_context(|| format!("Couldn't read {}", path.display()))?;
        zip.add_file(&name, &content)?;
        info!("Added {} ({} bytes)", name, content.len());
    }
    Ok(())
}

/// Turns a relative path on disk into a `/`-separated archive name.
fn archive_name(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .with_context(|| format!("{} isn't valid UTF-8", path.display()))?,
            ),
            Component::CurDir => {}
            _ => bail!(
                "{} must be a relative path that stays inside the current directory",
                path.display()
            ),
        }
    }
    Ok(parts.join("/"))
}

fn unpack(mapping: &[u8]) -> Result<()> {
    let (archive, prepended) =
        ZipArchive::with_prepended_data(mapping).context("Couldn't load archive")?;
    if prepended != 0 {
        info!("Skipping {} bytes before the archive", prepended);
    }

    check_destinations(archive.entries())?;

    let (directories, files): (Vec<&FileMetadata>, Vec<&FileMetadata>) =
        archive.entries().iter().partition(|e| e.is_dir());

    for dir in directories {
        fs::create_dir_all(dir.path.as_std_path())
            .with_context(|| format!("Couldn't create directory {}", dir.path))?;
    }

    // Each entry is compressed independently, so write them out in parallel.
    files.par_iter().try_for_each(|entry| -> Result<()> {
        let destination = entry.path.as_std_path();
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Couldn't create directory {}", parent.display()))?;
        }
        let mut reader = archive.read(entry)?;
        let mut sink = File::create(destination)
            .with_context(|| format!("Couldn't create file {}", entry.path))?;
        io::copy(&mut reader, &mut sink)
            .with_context(|| format!("Couldn't extract {}", entry.path))?;
        debug!("Extracted {}", entry.path);
        Ok(())
    })
}

/// Refuses entries that would land outside the current directory,
/// or on top of each other.
fn check_destinations(entries: &[FileMetadata]) -> Result<()> {
    let mut seen = HashSet::new();
    for entry in entries {
        let mut destination = PathBuf::new();
        for component in entry.path.as_std_path().components() {
            match component {
                Component::Normal(part) => destination.push(part),
                Component::CurDir => {}
                _ => bail!("Refusing to extract {} outside the current directory", entry.path),
            }
        }
        ensure!(
            seen.insert(destination),
            "{} appears more than once in the archive",
            entry.path
        );
    }
    Ok(())
}

fn list(mapping: &[u8]) -> Result<()> {
    let (archive, _) = ZipArchive::with_prepended_data(mapping).context("Couldn't load archive")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(
        out,
        "{:>10} {:>10} {:>8} {:>8} {:>19}  Name",
        "Length", "Size", "CRC-32", "Method", "Modified"
    )?;
    let mut total_size = 0;
    let mut total_compressed = 0;
    for entry in archive.entries() {
        let method = match entry.compression_method {
            CompressionMethod::Stored => "Stored".to_owned(),
            CompressionMethod::Deflate => "Deflate".to_owned(),
            CompressionMethod::Unsupported(m) => format!("#{m}"),
        };
        let modified = entry
            .last_modified
            .map(|t| t.to_string())
            .unwrap_or_else(|| "?".to_owned());
        writeln!(
            out,
            "{:>10} {:>10} {:08x} {:>8} {:>19}  {}",
            entry.size, entry.compressed_size, entry.crc32, method, modified, entry.path
        )?;
        total_size += entry.size;
        total_compressed += entry.compressed_size;
    }
    writeln!(
        out,
        "{:>10} {:>10} {:>8} {:>8} {:>19}  {} entries",
        total_size,
        total_compressed,
        "",
        "",
        "",
        archive.entries().len()
    )?;

    let comment = archive.comment();
    if !comment.is_empty() {
        writeln!(out, "\n{}", String::from_utf8_lossy(comment))?;
    }
    Ok(())
}
