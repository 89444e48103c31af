//! Tarball creation, index listing and extraction for pars archives.
//!
//! Listing reads tar headers only and never writes to disk, so the verifier
//! can check an archive's contents without unpacking it.

use crate::errors::ArchiveError;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Tar,
    TarGz,
}

fn format_of(path: &Path) -> Result<Format, ArchiveError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(Format::TarGz)
    } else if name.ends_with(".tar") {
        Ok(Format::Tar)
    } else {
        Err(ArchiveError::UnsupportedFormat(path.to_path_buf()))
    }
}

fn io_error(path: &Path) -> impl Fn(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn open_reader(path: &Path) -> Result<Box<dyn Read>, ArchiveError> {
    let format = format_of(path)?;
    let file = BufReader::new(File::open(path).map_err(io_error(path))?);
    Ok(match format {
        Format::TarGz => Box::new(GzDecoder::new(file)),
        Format::Tar => Box::new(file),
    })
}

/// Packs `names` (relative to `base_dir`) into `archive`, stored under
/// their bare names. Compression follows the archive's extension.
pub fn create(archive: &Path, base_dir: &Path, names: &[String]) -> Result<(), ArchiveError> {
    let format = format_of(archive)?;
    let file = BufWriter::new(File::create(archive).map_err(io_error(archive))?);

    match format {
        Format::TarGz => {
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            append_all(&mut builder, base_dir, names)?;
            builder
                .into_inner()
                .and_then(|encoder| encoder.finish())
                .and_then(|mut file| io::Write::flush(&mut file))
                .map_err(io_error(archive))?;
        }
        Format::Tar => {
            let mut builder = tar::Builder::new(file);
            append_all(&mut builder, base_dir, names)?;
            builder
                .into_inner()
                .and_then(|mut file| io::Write::flush(&mut file))
                .map_err(io_error(archive))?;
        }
    }
    tracing::debug!(archive = %archive.display(), entries = names.len(), "Created archive");
    Ok(())
}

fn append_all<W: io::Write>(builder: &mut tar::Builder<W>, base_dir: &Path, names: &[String]) -> Result<(), ArchiveError> {
    for name in names {
        let source = base_dir.join(name);
        builder
            .append_path_with_name(&source, name)
            .map_err(io_error(&source))?;
    }
    Ok(())
}

/// Entry names of an archive, without extracting anything.
pub fn list(archive: &Path) -> Result<BTreeSet<String>, ArchiveError> {
    let mut tar = tar::Archive::new(open_reader(archive)?);
    let mut names = BTreeSet::new();
    for entry in tar.entries().map_err(io_error(archive))? {
        let entry = entry.map_err(io_error(archive))?;
        let path = entry.path().map_err(io_error(archive))?;
        let name = path.to_string_lossy();
        names.insert(name.strip_prefix("./").unwrap_or(&name).to_string());
    }
    Ok(names)
}

/// Unpacks every entry into `dest`, creating it if needed.
pub fn extract(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    std::fs::create_dir_all(dest).map_err(io_error(dest))?;
    let mut tar = tar::Archive::new(open_reader(archive)?);
    tar.unpack(dest).map_err(io_error(archive))?;
    Ok(())
}

/// Gzip one file to `dest`.
pub fn gzip_file(source: &Path, dest: &Path) -> Result<PathBuf, ArchiveError> {
    let mut input = BufReader::new(File::open(source).map_err(io_error(source))?);
    let output = BufWriter::new(File::create(dest).map_err(io_error(dest))?);
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder).map_err(io_error(dest))?;
    encoder
        .finish()
        .and_then(|mut file| io::Write::flush(&mut file))
        .map_err(io_error(dest))?;
    Ok(dest.to_path_buf())
}

/// Decompressed text of one gzip file.
pub fn read_gzip(path: &Path) -> Result<String, ArchiveError> {
    let file = BufReader::new(File::open(path).map_err(io_error(path))?);
    let mut text = String::new();
    GzDecoder::new(file)
        .read_to_string(&mut text)
        .map_err(io_error(path))?;
    Ok(text)
}
