// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Write retrieved metadata to disk.
//!
//! The [`Merger`] owns a target directory for the duration of a retrieve. It
//! first resets the directory of every metadata kind the server returned, and
//! then writes each incoming archive entry. Entries that cannot be placed
//! safely are __quarantined__, i.e., skipped with a warning, while the rest of
//! the retrieve carries on.
//!
//! # Merge Rule
//!
//! Most kinds are written verbatim, last write wins. Kinds flagged for deep
//! merge, i.e., profiles, are merged into the file that sat at the destination
//! before the retrieve began, and re-serialized as canonical JSON. Those files
//! are read into memory ahead of the reset, so the reset never discards local
//! profile keys the server leaves out. See [`deep_merge`].

pub mod json;

pub use json::{canonical_json, deep_merge};

use crate::{
    archive::{self, ArchiveEntry, ArchiveError},
    catalog::{self, MetadataKind},
    execute::RetrievedArchive,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use ignore::WalkBuilder;
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, DirBuilder},
    io::{ErrorKind, Write},
    path::{Component, Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

/// Verdict on a single incoming file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    /// Write these bytes to the destination.
    Write(Vec<u8>),

    /// Destination already holds exactly these bytes.
    Skip,

    /// Entry must be quarantined.
    Fail(String),
}

/// Decide what to write for an incoming file.
///
/// Pure function of the kind of the entry, its path, its bytes, and the bytes
/// already at its destination if any. Performs no I/O.
///
/// - Unknown kinds fail.
/// - Deep merge kinds fail unless the incoming bytes are a JSON object. An
///   existing file that is not a JSON object is treated as absent.
/// - Kinds whose on-disk form is canonical JSON are normalized when they
///   parse as JSON objects.
/// - Everything else is written verbatim.
pub fn decide(
    kind: Option<MetadataKind>,
    path: &str,
    bytes: &[u8],
    existing: Option<&[u8]>,
) -> MergeDecision {
    let Some(kind) = kind else {
        return MergeDecision::Fail(format!("{path:?} is not under a metadata directory"));
    };

    let output = if kind.deep_merge_on_write() {
        let Some(incoming) = parse_object(bytes) else {
            return MergeDecision::Fail(format!("{path:?} is not a JSON object"));
        };
        let base = existing.and_then(parse_object).unwrap_or_default();

        match canonical_json(&deep_merge(Value::Object(base), Value::Object(incoming))) {
            Ok(output) => output,
            Err(error) => return MergeDecision::Fail(format!("{path:?}: {error}")),
        }
    } else if kind.json_normalize() {
        parse_object(bytes)
            .and_then(|object| canonical_json(&Value::Object(object)).ok())
            .unwrap_or_else(|| bytes.to_vec())
    } else {
        bytes.to_vec()
    };

    if existing == Some(output.as_slice()) {
        return MergeDecision::Skip;
    }

    MergeDecision::Write(output)
}

fn parse_object(bytes: &[u8]) -> Option<Map<String, Value>> {
    match serde_json::from_slice(bytes) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

/// What became of a single archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Written,
    Unchanged,
    Directory,
    Quarantined(String),
}

/// Tally of a whole retrieve write.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteReport {
    /// Kinds whose directory was reset before writing.
    pub reset: BTreeSet<MetadataKind>,

    /// Files written.
    pub written: usize,

    /// Files left alone because they already held the incoming bytes.
    pub unchanged: usize,

    /// Quarantined entries with the reason each was skipped.
    pub quarantined: Vec<String>,
}

impl WriteReport {
    fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Written => self.written += 1,
            EntryOutcome::Unchanged => self.unchanged += 1,
            EntryOutcome::Directory => {}
            EntryOutcome::Quarantined(reason) => self.quarantined.push(reason),
        }
    }
}

/// Incoming payload of one shard, decoded far enough to know its kinds.
enum Decoded<'a> {
    Zip(&'a [u8]),
    Entries(Vec<ArchiveEntry>),
}

/// Writer of retrieved metadata into a target directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merger {
    target_dir: PathBuf,
}

impl Merger {
    /// Construct new merger over target directory.
    pub fn new(target_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_dir: target_dir.into(),
        }
    }

    pub fn target_dir(&self) -> &Path {
        self.target_dir.as_path()
    }

    /// Write every shard payload of a retrieve into the target directory.
    ///
    /// Payloads are zip archives, possibly concatenated, when `accept_zip` is
    /// set. Otherwise they are JSON maps of path to base64 file contents.
    ///
    /// The directory of every kind mentioned by any payload is removed before
    /// the first write. Files of deep merge kinds are read beforehand, and
    /// serve as merge base for the incoming entries at the same paths.
    /// Payloads that cannot be decoded at all are quarantined as a whole, and
    /// do not take part in the reset.
    ///
    /// # Errors
    ///
    /// - Return [`MergeError::Io`] if the target directory cannot be written.
    #[instrument(skip(self, archives), fields(target = %self.target_dir.display()), level = "debug")]
    pub fn write_results_to_disk(
        &self,
        archives: &[RetrievedArchive],
        accept_zip: bool,
    ) -> Result<WriteReport> {
        let mut report = WriteReport::default();
        create_dirs(&self.target_dir)?;

        let mut decoded = Vec::new();
        for archive in archives {
            let (payload, paths) = match decode_payload(archive, accept_zip, &mut report) {
                Ok(found) => found,
                Err(reason) => {
                    warn!("quarantine payload of shard {}: {reason}", archive.shard);
                    report
                        .quarantined
                        .push(format!("shard {}: {reason}", archive.shard));
                    continue;
                }
            };

            report.reset.extend(paths.iter().filter_map(catalog::classify));
            decoded.push((archive.shard.as_str(), payload));
        }

        let mut merge_base = self.read_merge_base(report.reset.iter().copied())?;
        self.reset_directories(report.reset.iter().copied())?;

        for (shard, payload) in decoded {
            match payload {
                Decoded::Zip(bytes) => {
                    let result = archive::unpack_concatenated(bytes, |entry| {
                        report.record(self.write_entry_over(&entry, &mut merge_base)?);
                        Ok::<_, MergeError>(())
                    });

                    match result {
                        Ok(quarantined) => report
                            .quarantined
                            .extend(quarantined.iter().map(ToString::to_string)),
                        Err(MergeError::Archive(error)) => {
                            warn!("quarantine rest of shard {shard}: {error}");
                            report.quarantined.push(format!("shard {shard}: {error}"));
                        }
                        Err(error) => return Err(error),
                    }
                }
                Decoded::Entries(entries) => {
                    for entry in entries {
                        report.record(self.write_entry_over(&entry, &mut merge_base)?);
                    }
                }
            }
        }

        info!(
            "wrote {} file(s), {} unchanged, {} quarantined",
            report.written,
            report.unchanged,
            report.quarantined.len()
        );

        Ok(report)
    }

    /// Read every file of the deep merge kinds among `kinds`, keyed by path
    /// relative to the target directory.
    ///
    /// # Errors
    ///
    /// - Return [`MergeError::Io`] if a file cannot be read.
    fn read_merge_base(
        &self,
        kinds: impl IntoIterator<Item = MetadataKind>,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut base = BTreeMap::new();
        for kind in kinds.into_iter().filter(|kind| kind.deep_merge_on_write()) {
            let dir = self.target_dir.join(kind.directory_name());
            if !dir.is_dir() {
                continue;
            }

            let walker = WalkBuilder::new(&dir)
                .standard_filters(false)
                .follow_links(false)
                .build();
            for entry in walker {
                let entry = entry.map_err(|error| MergeError::Io {
                    source: error.into_io_error().unwrap_or_else(|| ErrorKind::Other.into()),
                    path: dir.clone(),
                })?;
                if !entry.file_type().is_some_and(|file_type| file_type.is_file()) {
                    continue;
                }

                let Some(relative) = archive::relative_slash_path(&self.target_dir, entry.path())
                else {
                    continue;
                };
                let bytes = fs::read(entry.path()).map_err(|source| MergeError::Io {
                    source,
                    path: entry.path().to_path_buf(),
                })?;
                base.insert(relative, bytes);
            }
        }

        debug!("hold {} file(s) as merge base", base.len());
        Ok(base)
    }

    /// Remove the directory of each kind from the target directory.
    ///
    /// Directories that do not exist are fine.
    ///
    /// # Errors
    ///
    /// - Return [`MergeError::Io`] if a directory cannot be removed.
    pub fn reset_directories(&self, kinds: impl IntoIterator<Item = MetadataKind>) -> Result<()> {
        for kind in kinds {
            let path = self.target_dir.join(kind.directory_name());
            match fs::remove_dir_all(&path) {
                Ok(()) => debug!("reset {}", path.display()),
                Err(error) if error.kind() == ErrorKind::NotFound => continue,
                Err(source) => return Err(MergeError::Io { source, path }),
            }
        }

        Ok(())
    }

    /// Write single archive entry into the target directory.
    ///
    /// Files are written to a temporary sibling first, then renamed into
    /// place, so an interrupted write never leaves a partial file behind.
    ///
    /// # Errors
    ///
    /// - Return [`MergeError::Io`] if the destination cannot be read or
    ///   written. Unsafe or unknown entries are quarantined, not errors.
    pub fn write_entry(&self, entry: &ArchiveEntry) -> Result<EntryOutcome> {
        self.write_entry_over(entry, &mut BTreeMap::new())
    }

    /// Write single archive entry, merging deep merge kinds into the file
    /// held in `merge_base` when nothing sits at the destination yet.
    ///
    /// A merge base entry is consumed on first use. Later entries for the
    /// same path merge into the file written from it.
    fn write_entry_over(
        &self,
        entry: &ArchiveEntry,
        merge_base: &mut BTreeMap<String, Vec<u8>>,
    ) -> Result<EntryOutcome> {
        let Some((relative, destination)) = self.contained_path(&entry.path) else {
            return Ok(quarantine(format!(
                "{:?} escapes the target directory",
                entry.path
            )));
        };

        let kind = catalog::classify(&relative);
        if kind.is_none() {
            return Ok(quarantine(format!(
                "{relative:?} is not under a metadata directory"
            )));
        }

        if !entry.is_directory && catalog::item_segment(&relative).is_none() {
            return Ok(quarantine(format!("{relative:?} names no metadata item")));
        }

        if entry.is_directory {
            create_dirs(&destination)?;
            return Ok(EntryOutcome::Directory);
        }

        let existing = match fs::read(&destination) {
            Ok(bytes) => Some(bytes),
            Err(error) if error.kind() == ErrorKind::NotFound => None,
            Err(source) => {
                return Err(MergeError::Io {
                    source,
                    path: destination,
                })
            }
        };

        let restored = if existing.is_none() {
            merge_base.remove(&relative)
        } else {
            None
        };

        match decide(
            kind,
            &relative,
            &entry.bytes,
            existing.as_deref().or(restored.as_deref()),
        ) {
            MergeDecision::Write(bytes) => {
                write_atomic(&destination, &bytes)?;
                debug!("wrote {relative}");
                Ok(EntryOutcome::Written)
            }
            MergeDecision::Skip => {
                // INVARIANT: Reset removed the file the base was read from.
                if let Some(bytes) = restored {
                    write_atomic(&destination, &bytes)?;
                    debug!("restored {relative}");
                }
                Ok(EntryOutcome::Unchanged)
            }
            MergeDecision::Fail(reason) => Ok(quarantine(reason)),
        }
    }

    /// Join relative entry path onto target directory, unless the result
    /// would escape it. Returns the sanitized relative path along with the
    /// destination.
    fn contained_path(&self, path: &str) -> Option<(String, PathBuf)> {
        let relative = archive::sanitize_entry_path(path).ok()?;
        if !Path::new(&relative)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return None;
        }

        let destination = self.target_dir.join(&relative);
        Some((relative, destination))
    }
}

fn quarantine(reason: String) -> EntryOutcome {
    warn!("quarantine archive entry: {reason}");
    EntryOutcome::Quarantined(reason)
}

/// Decode shard payload far enough to list the paths it holds.
fn decode_payload<'a>(
    archive: &'a RetrievedArchive,
    accept_zip: bool,
    report: &mut WriteReport,
) -> std::result::Result<(Decoded<'a>, Vec<String>), String> {
    if accept_zip {
        let paths = archive::entry_paths(&archive.bytes).map_err(|error| error.to_string())?;
        return Ok((Decoded::Zip(&archive.bytes), paths));
    }

    if archive.bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok((Decoded::Entries(Vec::new()), Vec::new()));
    }

    let files: Option<BTreeMap<String, String>> =
        serde_json::from_slice(&archive.bytes).map_err(|error| error.to_string())?;

    let mut entries = Vec::new();
    for (raw, encoded) in files.unwrap_or_default() {
        let path = match archive::sanitize_entry_path(&raw) {
            Ok(path) => path,
            Err(error) => {
                report.record(quarantine(error.to_string()));
                continue;
            }
        };

        match STANDARD.decode(encoded.as_bytes()) {
            Ok(bytes) => entries.push(ArchiveEntry {
                path,
                bytes,
                is_directory: false,
            }),
            Err(error) => report.record(quarantine(format!("{raw:?} is not base64: {error}"))),
        }
    }

    let paths = entries.iter().map(|entry| entry.path.clone()).collect();
    Ok((Decoded::Entries(entries), paths))
}

fn create_dirs(path: &Path) -> Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }

    builder.create(path).map_err(|source| MergeError::Io {
        source,
        path: path.to_path_buf(),
    })
}

fn write_atomic(destination: &Path, bytes: &[u8]) -> Result<()> {
    let io_error = |source| MergeError::Io {
        source,
        path: destination.to_path_buf(),
    };

    let parent = destination.parent().unwrap_or(Path::new("."));
    create_dirs(parent)?;

    let mut file = NamedTempFile::new_in(parent).map_err(io_error)?;
    file.write_all(bytes).map_err(io_error)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .map_err(io_error)?;
    }

    file.persist(destination)
        .map_err(|error| io_error(error.error))?;

    Ok(())
}

/// Merge error types.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// Target directory cannot be read or written.
    #[error("failed to write {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Archive cannot be read while unpacking.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Friendly result alias :3
type Result<T, E = MergeError> = std::result::Result<T, E>;
