// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Metadata catalog.
//!
//! A Skuid NLX site is described by a fixed set of top-level __metadata
//! kinds__, e.g., pages, data sources, profiles, themes. Each kind owns
//! exactly one directory at the top-level of a local site tree, and every
//! archive entry exchanged with the server lives beneath one of those
//! directories.
//!
//! # Site Layout
//!
//! ```text
//! <target>/
//! ├── datasources/
//! │   └── mydatasource.json
//! ├── pages/
//! │   ├── home.json
//! │   └── home.xml
//! └── profiles/
//!     └── admin.json
//! ```
//!
//! Anything that does not start with a known directory name is not
//! metadata, and is ignored when packing or quarantined when unpacking.
//!
//! The catalog is a static table. It performs no I/O.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Top-level category of site metadata.
///
/// Serializes to the camel-cased name the server uses as a key inside plan
/// shard scopes, e.g., `dataSources`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MetadataKind {
    Apps,
    AuthProviders,
    ComponentPacks,
    DataServices,
    DataSources,
    DesignSystems,
    Files,
    Pages,
    PermissionSets,
    Profiles,
    SessionVariables,
    Site,
    SitePermissionSets,
    Themes,
    Variables,
}

/// Static catalog row for one metadata kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KindTraits {
    kind: MetadataKind,
    directory_name: &'static str,
    wire_name: &'static str,
    deep_merge_on_write: bool,
    json_normalize: bool,
}

const CATALOG: &[KindTraits] = &[
    KindTraits::plain(MetadataKind::Apps, "apps", "apps"),
    KindTraits::plain(MetadataKind::AuthProviders, "authproviders", "authProviders"),
    KindTraits::plain(MetadataKind::ComponentPacks, "componentpacks", "componentPacks"),
    KindTraits::plain(MetadataKind::DataServices, "dataservices", "dataServices"),
    KindTraits::plain(MetadataKind::DataSources, "datasources", "dataSources"),
    KindTraits::plain(MetadataKind::DesignSystems, "designsystems", "designSystems"),
    KindTraits::plain(MetadataKind::Files, "files", "files"),
    KindTraits::plain(MetadataKind::Pages, "pages", "pages"),
    KindTraits::plain(MetadataKind::PermissionSets, "permissionsets", "permissionSets"),
    KindTraits {
        kind: MetadataKind::Profiles,
        directory_name: "profiles",
        wire_name: "profiles",
        deep_merge_on_write: true,
        json_normalize: true,
    },
    KindTraits::plain(MetadataKind::SessionVariables, "sessionvariables", "sessionVariables"),
    KindTraits::plain(MetadataKind::Site, "site", "site"),
    KindTraits::plain(
        MetadataKind::SitePermissionSets,
        "sitepermissionsets",
        "sitePermissionSets",
    ),
    KindTraits::plain(MetadataKind::Themes, "themes", "themes"),
    KindTraits::plain(MetadataKind::Variables, "variables", "variables"),
];

impl KindTraits {
    const fn plain(
        kind: MetadataKind,
        directory_name: &'static str,
        wire_name: &'static str,
    ) -> Self {
        Self {
            kind,
            directory_name,
            wire_name,
            deep_merge_on_write: false,
            json_normalize: false,
        }
    }
}

impl MetadataKind {
    fn traits(self) -> &'static KindTraits {
        // INVARIANT: CATALOG rows follow variant declaration order.
        &CATALOG[self as usize]
    }

    /// Name of the directory this kind occupies on disk.
    pub fn directory_name(self) -> &'static str {
        self.traits().directory_name
    }

    /// Name of this kind as the server spells it in plan shard scopes.
    pub fn wire_name(self) -> &'static str {
        self.traits().wire_name
    }

    /// Incoming files of this kind are deep-merged into existing files.
    pub fn deep_merge_on_write(self) -> bool {
        self.traits().deep_merge_on_write
    }

    /// On-disk form of this kind is canonical JSON.
    pub fn json_normalize(self) -> bool {
        self.traits().json_normalize
    }

    /// Look up kind by its on-disk directory name.
    pub fn from_directory_name(name: &str) -> Option<Self> {
        CATALOG
            .iter()
            .find(|row| row.directory_name == name)
            .map(|row| row.kind)
    }

    /// Look up kind by its wire name.
    ///
    /// Accepts the lowercase directory spelling as well, since older server
    /// builds echo scopes keyed that way.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        CATALOG
            .iter()
            .find(|row| row.wire_name == name || row.directory_name == name)
            .map(|row| row.kind)
    }
}

impl Display for MetadataKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.directory_name())
    }
}

impl FromStr for MetadataKind {
    type Err = UnknownKind;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::from_wire_name(name).ok_or_else(|| UnknownKind(name.to_owned()))
    }
}

/// List every metadata kind the server understands.
pub fn all_kinds() -> Vec<MetadataKind> {
    CATALOG.iter().map(|row| row.kind).collect()
}

/// Set of every top-level directory name a site tree may contain.
pub fn directory_names() -> BTreeSet<&'static str> {
    CATALOG.iter().map(|row| row.directory_name).collect()
}

/// Classify slash-separated relative path by its leading segment.
///
/// Returns [`None`] if the first segment is not the directory name of a known
/// metadata kind. Backslashes count as separators so that archives produced
/// on Windows still classify.
pub fn classify(path: impl AsRef<str>) -> Option<MetadataKind> {
    let path = path.as_ref();
    let first = path.split(['/', '\\']).next()?;
    MetadataKind::from_directory_name(first)
}

/// Name of the metadata item that a relative path belongs to.
///
/// This is the second path segment, e.g., `pages/home.json` belongs to item
/// `home.json`. Use [`item_matches`] to compare it against plain item names.
pub fn item_segment(path: &str) -> Option<&str> {
    path.split(['/', '\\']).nth(1).filter(|segment| !segment.is_empty())
}

/// Check if item segment of a path belongs to a named metadata item.
///
/// A single item may be stored as several files, e.g., `home.json` and
/// `home.xml` for page `home`, or `logo.png` and `logo.png.skuid.json` for
/// file `logo.png`. Thus, the segment matches either exactly, or as the item
/// name followed by an extension.
pub fn item_matches(segment: &str, name: &str) -> bool {
    segment == name
        || segment
            .strip_prefix(name)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Metadata kind name is not part of the catalog.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown metadata kind {0:?}")]
pub struct UnknownKind(pub String);
