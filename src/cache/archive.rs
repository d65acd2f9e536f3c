//! Workspace archiving
//!
//! Selects files with include/exclude globs, packs them into a tar stream with
//! optional gzip or zstd compression, and unpacks such streams back into a tree.

use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// zstd level used when packing
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("Unknown compression method '{0}'")]
    UnknownMethod(String),

    #[error("Compression method '{0}' does not produce an archive")]
    NotAnArchive(CompressionMethod),

    #[error("Failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// How a cache is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionMethod {
    /// Files stored as individual objects, no archive
    #[serde(rename = "none", alias = "uncompressed")]
    None,
    /// Plain tar archive
    #[serde(rename = "tar")]
    Tar,
    /// gzip-compressed tar archive
    #[default]
    #[serde(rename = "tgz", alias = "tar.gz", alias = "gzip")]
    TarGz,
    /// zstd-compressed tar archive
    #[serde(rename = "tzst", alias = "tar.zst", alias = "zstd")]
    TarZstd,
}

impl CompressionMethod {
    /// Stable name, stored in object metadata
    pub fn name(&self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Tar => "tar",
            CompressionMethod::TarGz => "tgz",
            CompressionMethod::TarZstd => "tzst",
        }
    }

    /// Whether the cache is a single archive object
    pub fn is_archive(&self) -> bool {
        !matches!(self, CompressionMethod::None)
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionMethod {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "uncompressed" => Ok(CompressionMethod::None),
            "tar" => Ok(CompressionMethod::Tar),
            "tgz" | "tar.gz" | "gzip" => Ok(CompressionMethod::TarGz),
            "tzst" | "tar.zst" | "zstd" => Ok(CompressionMethod::TarZstd),
            other => Err(ArchiveError::UnknownMethod(other.to_string())),
        }
    }
}

/// Include/exclude glob filter over paths relative to the cached directory
#[derive(Debug, Clone)]
pub struct FileFilter {
    includes: GlobSet,
    excludes: GlobSet,
}

fn build_set(patterns: &[String]) -> Result<GlobSet, ArchiveError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|source| ArchiveError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| ArchiveError::Pattern {
        pattern: patterns.join(","),
        source,
    })
}

impl FileFilter {
    /// Build a filter; no include patterns means everything
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self, ArchiveError> {
        let includes = if includes.is_empty() {
            build_set(&["**/*".to_string()])?
        } else {
            build_set(includes)?
        };
        Ok(Self {
            includes,
            excludes: build_set(excludes)?,
        })
    }

    #[cfg(test)]
    pub fn everything() -> Self {
        Self {
            includes: build_set(&["**/*".to_string()]).unwrap_or_else(|_| GlobSet::empty()),
            excludes: GlobSet::empty(),
        }
    }

    pub fn matches(&self, relative: &Path) -> bool {
        self.includes.is_match(relative) && !self.excludes.is_match(relative)
    }
}

/// A regular file selected for caching
#[derive(Debug, Clone)]
pub struct MatchedFile {
    pub path: PathBuf,
    pub relative: PathBuf,
    pub size: u64,
}

impl MatchedFile {
    /// Relative path with '/' separators, used as an object key suffix
    pub fn key(&self) -> String {
        self.relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Regular files under `root` accepted by `filter`, in sorted order
pub fn matching_files(root: &Path, filter: &FileFilter) -> Result<Vec<MatchedFile>, ArchiveError> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|source| ArchiveError::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if !filter.matches(relative) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        files.push(MatchedFile {
            path: entry.path().to_path_buf(),
            relative: relative.to_path_buf(),
            size,
        });
    }
    debug!(root = %root.display(), count = files.len(), "Matched files for cache");
    Ok(files)
}

/// Counters from packing or unpacking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: usize,
    pub bytes: u64,
}

fn write_tar<W: Write>(files: &[MatchedFile], sink: W) -> Result<W, ArchiveError> {
    let mut builder = tar::Builder::new(sink);
    builder.follow_symlinks(false);
    for file in files {
        builder
            .append_path_with_name(&file.path, &file.relative)
            .map_err(io_err(&file.path))?;
    }
    builder.into_inner().map_err(io_err(Path::new("<archive>")))
}

/// Pack the files of `source` accepted by `filter` into `sink`
pub fn pack<W: Write>(
    source: &Path,
    filter: &FileFilter,
    method: CompressionMethod,
    sink: W,
) -> Result<ArchiveStats, ArchiveError> {
    let files = matching_files(source, filter)?;
    let stats = ArchiveStats {
        files: files.len(),
        bytes: files.iter().map(|f| f.size).sum(),
    };

    match method {
        CompressionMethod::None => return Err(ArchiveError::NotAnArchive(method)),
        CompressionMethod::Tar => {
            let mut sink = write_tar(&files, sink)?;
            sink.flush().map_err(io_err(source))?;
        }
        CompressionMethod::TarGz => {
            let encoder = GzEncoder::new(sink, flate2::Compression::default());
            let encoder = write_tar(&files, encoder)?;
            encoder.finish().map_err(io_err(source))?;
        }
        CompressionMethod::TarZstd => {
            let encoder = zstd::Encoder::new(sink, ZSTD_LEVEL).map_err(io_err(source))?;
            let encoder = write_tar(&files, encoder)?;
            encoder.finish().map_err(io_err(source))?;
        }
    }

    debug!(
        source = %source.display(),
        method = %method,
        files = stats.files,
        bytes = stats.bytes,
        "Packed cache archive"
    );
    Ok(stats)
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<ArchiveStats, ArchiveError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_mtime(true);

    let mut stats = ArchiveStats::default();
    for entry in archive.entries().map_err(io_err(dest))? {
        let mut entry = entry.map_err(io_err(dest))?;
        let is_file = entry.header().entry_type().is_file();
        let size = entry.header().size().unwrap_or(0);
        let path = entry
            .path()
            .map(|p| p.into_owned())
            .unwrap_or_default();

        if entry.unpack_in(dest).map_err(io_err(&path))? {
            if is_file {
                stats.files += 1;
                stats.bytes += size;
            }
        } else {
            warn!(entry = %path.display(), "Skipped archive entry outside the target directory");
        }
    }
    Ok(stats)
}

/// Unpack an archive produced by [`pack`] into `dest`
pub fn unpack<R: Read>(
    method: CompressionMethod,
    reader: R,
    dest: &Path,
) -> Result<ArchiveStats, ArchiveError> {
    fs::create_dir_all(dest).map_err(io_err(dest))?;
    let stats = match method {
        CompressionMethod::None => return Err(ArchiveError::NotAnArchive(method)),
        CompressionMethod::Tar => unpack_tar(reader, dest)?,
        CompressionMethod::TarGz => unpack_tar(GzDecoder::new(reader), dest)?,
        CompressionMethod::TarZstd => {
            unpack_tar(zstd::Decoder::new(reader).map_err(io_err(dest))?, dest)?
        }
    };
    debug!(
        dest = %dest.display(),
        method = %method,
        files = stats.files,
        "Unpacked cache archive"
    );
    Ok(stats)
}
