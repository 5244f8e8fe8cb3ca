//! Archive file naming.
//!
//! An archive with base name `base` consists of `base.meta`, `base.index` and
//! data volumes `base.0`, `base.1`, ... Any of them may instead be stored
//! snappy-compressed (frame format) under an extra `.sz` or `.snappy`
//! suffix; compressed files are decompressed into memory when opened.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{ArchiveError, Result};
use crate::label::{INDEX_VOL, META_VOL};

/// Suffixes recognized for snappy-compressed archive files.
pub const COMPRESSED_SUFFIXES: [&str; 2] = ["sz", "snappy"];

/// One of the files making up an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileKind {
    /// The metadata file, `base.meta`.
    Meta,
    /// The temporal index, `base.index`.
    Index,
    /// Data volume `N`, `base.N`.
    Volume(u32),
}

impl FileKind {
    /// File number stamped into this file's label.
    pub fn label_vol(self) -> i32 {
        match self {
            Self::Meta => META_VOL,
            Self::Index => INDEX_VOL,
            Self::Volume(n) => i32::try_from(n).unwrap_or(i32::MAX),
        }
    }

    fn suffix(self) -> String {
        match self {
            Self::Meta => "meta".to_string(),
            Self::Index => "index".to_string(),
            Self::Volume(n) => n.to_string(),
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta => write!(f, "meta"),
            Self::Index => write!(f, "index"),
            Self::Volume(n) => write!(f, "volume {n}"),
        }
    }
}

/// An archive file located on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    /// Actual path of the file.
    pub path: PathBuf,
    /// Whether the file is snappy-compressed.
    pub compressed: bool,
}

impl ResolvedFile {
    /// Reads and decompresses a compressed file into memory.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Io`] if the file cannot be read or is not a
    /// valid snappy stream.
    pub fn decompress(&self) -> Result<Vec<u8>> {
        let file = File::open(&self.path).map_err(|e| ArchiveError::io(&self.path, 0, e))?;
        let mut decoder = snap::read::FrameDecoder::new(file);
        let mut bytes = Vec::new();
        decoder
            .read_to_end(&mut bytes)
            .map_err(|e| ArchiveError::io(&self.path, 0, e))?;
        Ok(bytes)
    }
}

/// Returns the plain (uncompressed) file name of `kind` for `base`.
pub fn file_name(base: &Path, kind: FileKind) -> PathBuf {
    with_suffix(base.as_os_str(), &kind.suffix())
}

/// Locates the file of `kind`, trying the plain name first and then each
/// compressed suffix.
pub fn resolve(base: &Path, kind: FileKind) -> Option<ResolvedFile> {
    let plain = file_name(base, kind);
    if plain.is_file() {
        return Some(ResolvedFile {
            path: plain,
            compressed: false,
        });
    }
    COMPRESSED_SUFFIXES
        .iter()
        .map(|suffix| with_suffix(plain.as_os_str(), suffix))
        .find(|path| path.is_file())
        .map(|path| ResolvedFile {
            path,
            compressed: true,
        })
}

/// Strips a file-kind suffix (`.meta`, `.index`, `.N`, optionally followed by
/// a compressed suffix) when `path` names an existing file. Any other path
/// is taken to be a base name already.
pub fn base_name(path: &Path) -> PathBuf {
    if !path.is_file() {
        return path.to_path_buf();
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return path.to_path_buf();
    };

    let name = COMPRESSED_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(&format!(".{suffix}")))
        .unwrap_or(name);

    match name.rsplit_once('.') {
        Some((stem, kind)) if !stem.is_empty() && parse_kind(kind).is_some() => {
            path.with_file_name(stem)
        }
        _ => path.to_path_buf(),
    }
}

/// The files found on disk for one archive.
#[derive(Debug, Clone)]
pub struct ArchiveFiles {
    /// The archive's base name.
    pub base: PathBuf,
    /// The metadata file, if present.
    pub meta: Option<ResolvedFile>,
    /// The temporal index, if present.
    pub index: Option<ResolvedFile>,
    /// Data volumes present, keyed by volume number.
    pub volumes: BTreeMap<u32, ResolvedFile>,
}

impl ArchiveFiles {
    /// Lowest volume number present.
    pub fn min_volume(&self) -> Option<u32> {
        self.volumes.keys().next().copied()
    }

    /// Highest volume number present.
    pub fn max_volume(&self) -> Option<u32> {
        self.volumes.keys().next_back().copied()
    }
}

/// Lists the files of the archive named by `base`.
///
/// # Errors
///
/// Returns [`ArchiveError::NotFound`] when neither a metadata file nor any
/// volume exists, and [`ArchiveError::Io`] if the directory cannot be read.
pub fn scan(base: &Path) -> Result<ArchiveFiles> {
    let dir = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Some(prefix) = base.file_name().and_then(|n| n.to_str()) else {
        return Err(ArchiveError::NotFound {
            path: base.to_path_buf(),
        });
    };
    let prefix = format!("{prefix}.");

    let entries = std::fs::read_dir(&dir).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ArchiveError::NotFound {
                path: base.to_path_buf(),
            }
        } else {
            ArchiveError::io(&dir, 0, e)
        }
    })?;

    let mut volume_numbers = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ArchiveError::io(&dir, 0, e))?;
        let name = entry.file_name();
        let Some(rest) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
            continue;
        };
        let rest = COMPRESSED_SUFFIXES
            .iter()
            .find_map(|suffix| rest.strip_suffix(&format!(".{suffix}")))
            .unwrap_or(rest);
        if let Some(FileKind::Volume(n)) = parse_kind(rest) {
            volume_numbers.push(n);
        }
    }

    let mut volumes = BTreeMap::new();
    for n in volume_numbers {
        if let Some(file) = resolve(base, FileKind::Volume(n)) {
            volumes.insert(n, file);
        }
    }

    let files = ArchiveFiles {
        base: base.to_path_buf(),
        meta: resolve(base, FileKind::Meta),
        index: resolve(base, FileKind::Index),
        volumes,
    };
    if files.meta.is_none() && files.volumes.is_empty() {
        return Err(ArchiveError::NotFound {
            path: base.to_path_buf(),
        });
    }
    Ok(files)
}

fn parse_kind(suffix: &str) -> Option<FileKind> {
    match suffix {
        "meta" => Some(FileKind::Meta),
        "index" => Some(FileKind::Index),
        digits if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
            digits.parse().ok().map(FileKind::Volume)
        }
        _ => None,
    }
}

fn with_suffix(path: &std::ffi::OsStr, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path);
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
