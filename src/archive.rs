// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Zip archive packing and unpacking.
//!
//! Site metadata travels between the local tree and the server as zip
//! archives. Packing walks a local site tree and produces a deterministic
//! archive, i.e., the same tree always yields the same bytes. Unpacking hands
//! each archive entry to a visitor one at a time, after making sure that its
//! path cannot escape the directory it will eventually be written into.
//!
//! # Concatenated Archives
//!
//! Retrieve responses are not always a single archive. The server writes one
//! archive per plan shard back-to-back into the same response body. Use
//! [`unpack_concatenated`] to visit all of them as one flat sequence of
//! entries.

use crate::catalog;

use ignore::WalkBuilder;
use std::{
    fs,
    io::{Cursor, Read, Seek, Write},
    path::{Component, Path, PathBuf},
};
use tracing::{debug, instrument, warn};
use zip::{
    result::ZipError, write::SimpleFileOptions, CompressionMethod, DateTime, ZipArchive,
    ZipWriter,
};

const EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];
const EOCD_LEN: usize = 22;
const ZIP64_LOCATOR_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x06, 0x07];
const ZIP64_LOCATOR_LEN: usize = 20;

/// Single entry of an unpacked archive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Sanitized slash-separated path relative to the archive root.
    pub path: String,

    /// Entry contents. Always empty for directories.
    pub bytes: Vec<u8>,

    /// Entry is a directory rather than a file.
    pub is_directory: bool,
}

/// Pack every metadata file under root into a zip archive.
///
/// # Errors
///
/// - Return [`PackError::Empty`] if no file qualifies for packing.
/// - Return [`PackError::Io`] if a file cannot be read.
///
/// # See Also
///
/// - [`pack_with`]
pub fn pack(root: impl AsRef<Path>) -> Result<Vec<u8>, PackError> {
    pack_with(root, |_| true)
}

/// Pack metadata files under root that satisfy a path predicate.
///
/// Only regular files beneath a known metadata directory are candidates.
/// Hidden files and directories are skipped, and symbolic links are never
/// followed. The predicate receives the slash-separated path of each
/// candidate relative to root.
///
/// Entries are written in lexical order of their relative paths with zeroed
/// modification times, so identical trees produce identical bytes.
///
/// # Errors
///
/// - Return [`PackError::Empty`] if no file qualifies for packing.
/// - Return [`PackError::Io`] if a file cannot be read.
/// - Return [`PackError::Walk`] if a directory cannot be traversed.
/// - Return [`PackError::Zip`] if the archive cannot be written.
#[instrument(skip(root, keep), fields(root = %root.as_ref().display()), level = "debug")]
pub fn pack_with<F>(root: impl AsRef<Path>, mut keep: F) -> Result<Vec<u8>, PackError>
where
    F: FnMut(&str) -> bool,
{
    let root = root.as_ref();
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let mut packed = 0usize;
    for (relative, absolute) in metadata_files(root)? {
        if !keep(&relative) {
            continue;
        }

        let bytes = fs::read(&absolute).map_err(|source| PackError::Io {
            source,
            path: absolute.clone(),
        })?;
        zip.start_file(relative.as_str(), options)?;
        zip.write_all(&bytes).map_err(ZipError::from)?;
        debug!("packed {relative}");
        packed += 1;
    }

    if packed == 0 {
        return Err(PackError::Empty {
            root: root.to_path_buf(),
        });
    }

    Ok(zip.finish()?.into_inner())
}

/// List packable files under root in lexical order of their relative paths.
fn metadata_files(root: &Path) -> Result<Vec<(String, PathBuf)>, PackError> {
    let names = catalog::directory_names();
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(true)
        .follow_links(false)
        .filter_entry(move |entry| {
            // INVARIANT: Only descend into known metadata directories.
            entry.depth() != 1
                || entry.file_type().is_some_and(|kind| kind.is_dir())
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| names.contains(name))
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }

        let Some(relative) = relative_slash_path(root, entry.path()) else {
            warn!("skip non UTF-8 path {:?}", entry.path().display());
            continue;
        };
        files.push((relative, entry.into_path()));
    }

    files.sort_by(|left, right| left.0.cmp(&right.0));
    Ok(files)
}

/// Express path relative to root with forward slashes.
pub(crate) fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_str()?),
            Component::CurDir => continue,
            _ => return None,
        }
    }

    if segments.is_empty() {
        return None;
    }

    Some(segments.join("/"))
}

/// Visit each entry of a single zip archive.
///
/// Entries are read one at a time in central directory order. Entries whose
/// path is unsafe are not delivered to the visitor. Instead, they are logged
/// and returned to the caller as a listing of quarantined paths. The first
/// visitor failure stops iteration, and no further entries are delivered.
///
/// # Errors
///
/// - Return [`ArchiveError::Corrupt`] through `E` if archive cannot be read.
/// - Return whatever error the visitor fails with.
pub fn unpack<R, F, E>(reader: R, mut visit: F) -> Result<Vec<UnsafePathError>, E>
where
    R: Read + Seek,
    F: FnMut(ArchiveEntry) -> Result<(), E>,
    E: From<ArchiveError>,
{
    let mut archive = ZipArchive::new(reader).map_err(ArchiveError::Corrupt)?;
    let mut quarantined = Vec::new();

    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(ArchiveError::Corrupt)?;
        let path = match sanitize_entry_path(file.name()) {
            Ok(path) => path,
            Err(error) => {
                warn!("quarantine archive entry: {error}");
                quarantined.push(error);
                continue;
            }
        };

        let is_directory = file.is_dir();
        let mut bytes = Vec::new();
        if !is_directory {
            file.read_to_end(&mut bytes)
                .map_err(|source| ArchiveError::Read {
                    source,
                    path: path.clone(),
                })?;
        }
        drop(file);

        visit(ArchiveEntry {
            path,
            bytes,
            is_directory,
        })?;
    }

    Ok(quarantined)
}

/// Visit each entry of one or more archives written back-to-back.
///
/// Archive boundaries are found through their end of central directory
/// records. Entries of the first archive are delivered before entries of the
/// second, and so on. An empty byte sequence holds no archives at all.
///
/// Takes the whole payload as one slice. Finding the boundaries means seeking
/// to each end of central directory record, and a zip cannot be read through
/// from the front alone, so the shard response is buffered in full before
/// unpacking. Peak memory per shard is its payload size plus the largest
/// single entry.
///
/// # Errors
///
/// - Return [`ArchiveError::Truncated`] through `E` if trailing bytes do not
///   form a complete archive.
/// - Return [`ArchiveError::Corrupt`] through `E` if an archive cannot be
///   read.
/// - Return whatever error the visitor fails with.
pub fn unpack_concatenated<F, E>(bytes: &[u8], mut visit: F) -> Result<Vec<UnsafePathError>, E>
where
    F: FnMut(ArchiveEntry) -> Result<(), E>,
    E: From<ArchiveError>,
{
    let mut quarantined = Vec::new();
    for segment in split_archives(bytes)? {
        quarantined.extend(unpack(Cursor::new(segment), &mut visit)?);
    }

    Ok(quarantined)
}

/// List sanitized entry paths of concatenated archives without reading
/// their contents.
///
/// Unsafe paths are left out.
///
/// # Errors
///
/// - Return [`ArchiveError::Truncated`] if trailing bytes do not form a
///   complete archive.
/// - Return [`ArchiveError::Corrupt`] if an archive cannot be read.
pub fn entry_paths(bytes: &[u8]) -> Result<Vec<String>, ArchiveError> {
    let mut paths = Vec::new();
    for segment in split_archives(bytes)? {
        let archive = ZipArchive::new(Cursor::new(segment)).map_err(ArchiveError::Corrupt)?;
        paths.extend(
            archive
                .file_names()
                .filter_map(|name| sanitize_entry_path(name).ok()),
        );
    }

    Ok(paths)
}

/// Split concatenated archives into individual archives.
fn split_archives(bytes: &[u8]) -> Result<Vec<&[u8]>, ArchiveError> {
    let mut segments = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let end = archive_end(&bytes[start..]).ok_or(ArchiveError::Truncated { offset: start })?;
        segments.push(&bytes[start..start + end]);
        start += end;
    }

    Ok(segments)
}

/// Find length of the first complete archive at the start of data.
///
/// An end of central directory signature only counts if the record it starts
/// agrees with its own position, i.e., the central directory it describes
/// ends right where the record begins. This keeps stored file data that
/// happens to contain the signature from cutting an archive short.
fn archive_end(data: &[u8]) -> Option<usize> {
    let mut position = 0;
    while position + EOCD_LEN <= data.len() {
        let offset = data[position..]
            .windows(EOCD_SIGNATURE.len())
            .position(|window| window == EOCD_SIGNATURE)?;
        let candidate = position + offset;
        if candidate + EOCD_LEN > data.len() {
            return None;
        }

        let record = &data[candidate..candidate + EOCD_LEN];
        let cd_size = u32::from_le_bytes([record[12], record[13], record[14], record[15]]);
        let cd_offset = u32::from_le_bytes([record[16], record[17], record[18], record[19]]);
        let comment_len = u16::from_le_bytes([record[20], record[21]]) as usize;
        let end = candidate + EOCD_LEN + comment_len;

        let zip64 = candidate >= ZIP64_LOCATOR_LEN
            && data[candidate - ZIP64_LOCATOR_LEN..][..4] == ZIP64_LOCATOR_SIGNATURE;
        let consistent = cd_offset as usize + cd_size as usize == candidate;
        if end <= data.len() && (consistent || zip64) {
            return Some(end);
        }

        position = candidate + 1;
    }

    None
}

/// Sanitize raw archive entry name into a safe relative path.
///
/// Backslashes are treated as separators. Empty and `.` segments are dropped.
/// Directory markers, i.e., trailing slashes, are removed.
///
/// # Errors
///
/// - Return [`UnsafePathError`] for absolute paths, UNC paths, Windows drive
///   letters, parent directory segments, or paths that are empty.
pub fn sanitize_entry_path(raw: &str) -> Result<String, UnsafePathError> {
    let reject = |reason: &'static str| UnsafePathError {
        path: raw.to_owned(),
        reason,
    };

    if raw.contains('\0') {
        return Err(reject("contains NUL byte"));
    }

    if raw.starts_with(['/', '\\']) {
        return Err(reject("absolute path"));
    }

    let mut chars = raw.chars();
    if let (Some(letter), Some(':')) = (chars.next(), chars.next()) {
        if letter.is_ascii_alphabetic() {
            return Err(reject("drive letter"));
        }
    }

    let mut segments = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(reject("parent directory segment")),
            segment => segments.push(segment),
        }
    }

    if segments.is_empty() {
        return Err(reject("empty path"));
    }

    Ok(segments.join("/"))
}

/// Archive entry path would escape its destination directory.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unsafe archive path {path:?}: {reason}")]
pub struct UnsafePathError {
    /// Raw entry name as found in the archive.
    pub path: String,

    /// Why the path was rejected.
    pub reason: &'static str,
}

/// Archive reading error types.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Archive structure cannot be parsed.
    #[error("archive is corrupt")]
    Corrupt(#[source] ZipError),

    /// Bytes remain that do not end with a central directory.
    #[error("no end of central directory found after byte {offset}")]
    Truncated { offset: usize },

    /// Entry contents cannot be decompressed.
    #[error("failed to read archive entry {path:?}")]
    Read {
        #[source]
        source: std::io::Error,
        path: String,
    },
}

/// Archive packing error types.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    /// File cannot be read from local tree.
    #[error("failed to read {:?} for packing", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Local tree cannot be traversed.
    #[error(transparent)]
    Walk(#[from] ignore::Error),

    /// Archive cannot be written.
    #[error(transparent)]
    Zip(#[from] ZipError),

    /// Nothing under root qualifies for packing.
    #[error("no metadata files to pack under {:?}", root.display())]
    Empty { root: PathBuf },
}
