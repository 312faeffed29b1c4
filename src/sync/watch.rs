// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Change debouncing and polling for watch mode.

use crate::{
    archive::relative_slash_path,
    catalog::{self, MetadataKind},
};

use futures::stream::{self, BoxStream, StreamExt};
use ignore::WalkBuilder;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::time::Instant;
use tracing::debug;

/// Per-path quiet period tracker.
///
/// A path becomes ready once no change to it has been seen for a full window.
/// Ready paths are handed out as the set of metadata kinds they belong to.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    pending: BTreeMap<String, (MetadataKind, Instant)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeMap::new(),
        }
    }

    /// Record change to path, restarting its quiet period.
    pub fn touch(&mut self, path: impl Into<String>, kind: MetadataKind, now: Instant) {
        self.pending.insert(path.into(), (kind, now));
    }

    /// Earliest instant at which some pending path becomes ready.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|(_, seen)| *seen + self.window)
            .min()
    }

    /// Remove every ready path, and collect the kinds they belong to.
    pub fn drain_ready(&mut self, now: Instant) -> BTreeSet<MetadataKind> {
        let mut ready = BTreeSet::new();
        self.pending.retain(|_, (kind, seen)| {
            if *seen + self.window <= now {
                ready.insert(*kind);
                false
            } else {
                true
            }
        });

        ready
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Modification time and length of every file under a root.
type Snapshot = BTreeMap<PathBuf, (Option<SystemTime>, u64)>;

/// Stream changed paths of a local site tree by polling it.
///
/// The tree is snapshotted once up front, then again every interval. Files
/// that appear, disappear, or change modification time or length between two
/// snapshots are yielded as absolute paths. Hidden entries are skipped. The
/// stream never ends on its own.
pub fn poll_changes(root: impl Into<PathBuf>, interval: Duration) -> BoxStream<'static, PathBuf> {
    let state = (root.into(), None::<Snapshot>, VecDeque::<PathBuf>::new());
    stream::unfold(state, move |(root, mut previous, mut queue)| async move {
        loop {
            if let Some(path) = queue.pop_front() {
                return Some((path, (root, previous, queue)));
            }

            if previous.is_some() {
                tokio::time::sleep(interval).await;
            }

            let current = take_snapshot(&root);
            if let Some(previous) = &previous {
                queue.extend(changed_paths(previous, &current));
            }
            previous = Some(current);
        }
    })
    .boxed()
}

fn take_snapshot(root: &Path) -> Snapshot {
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(true)
        .follow_links(false)
        .build();

    let mut snapshot = Snapshot::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                debug!("skip unreadable entry while polling: {error}");
                continue;
            }
        };

        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }

        if let Ok(metadata) = entry.metadata() {
            snapshot.insert(
                entry.into_path(),
                (metadata.modified().ok(), metadata.len()),
            );
        }
    }

    snapshot
}

fn changed_paths(previous: &Snapshot, current: &Snapshot) -> Vec<PathBuf> {
    let mut changed = current
        .iter()
        .filter(|(path, stamp)| previous.get(*path) != Some(*stamp))
        .map(|(path, _)| path.clone())
        .collect::<Vec<_>>();
    changed.extend(
        previous
            .keys()
            .filter(|path| !current.contains_key(*path))
            .cloned(),
    );

    changed
}

/// Classify changed path of a local site tree.
///
/// Returns the slash-separated relative path with its metadata kind, or
/// [`None`] if the path lies outside root or outside every metadata
/// directory.
pub fn classify_change(root: &Path, path: &Path) -> Option<(String, MetadataKind)> {
    let relative = if path.is_absolute() {
        relative_slash_path(root, path)?
    } else {
        relative_slash_path(Path::new(""), path)?
    };

    let kind = catalog::classify(&relative)?;
    Some((relative, kind))
}
