// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Plan filters.
//!
//! A filter narrows a retrieve or deploy down to a single app and a set of
//! pages. The app name is only ever interpreted by the server. Page names
//! are interpreted by the server, and by the local packer when deciding which
//! files of a site tree take part in a deploy.

use crate::catalog::{self, MetadataKind};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Optional inputs narrowing a retrieve or deploy.
///
/// An absent filter, i.e., `None` at call sites, means everything.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFilter {
    /// Restrict to metadata of a single app.
    #[serde(default, alias = "AppName", skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,

    /// Restrict pages to those matching one of these glob patterns.
    #[serde(default, alias = "PageNames", skip_serializing_if = "Vec::is_empty")]
    pub page_names: Vec<String>,
}

impl PlanFilter {
    /// Construct filter from command line flags.
    ///
    /// Returns [`None`] if no flag narrows anything, so callers never pass an
    /// empty filter around.
    pub fn from_flags(
        app_name: Option<String>,
        page_names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Option<Self> {
        let app_name = app_name.filter(|name| !name.trim().is_empty());
        let page_names = page_names
            .into_iter()
            .map(Into::into)
            .filter(|name: &String| !name.trim().is_empty())
            .collect::<Vec<_>>();

        if app_name.is_none() && page_names.is_empty() {
            return None;
        }

        Some(Self {
            app_name,
            page_names,
        })
    }

    /// Check if page name is selected by this filter.
    ///
    /// Every page is selected when no page patterns are set. Patterns that
    /// are not valid globs only match their exact text.
    pub fn matches_page(&self, name: &str) -> bool {
        if self.page_names.is_empty() {
            return true;
        }

        self.page_names.iter().any(|raw| match Pattern::new(raw) {
            Ok(pattern) => pattern.matches(name),
            Err(error) => {
                warn!("page pattern {raw:?} is not a valid glob: {error}");
                raw == name
            }
        })
    }

    /// Check if slash-separated path of a local site tree takes part in a
    /// filtered deploy.
    ///
    /// With page patterns set, only page files whose page name matches are
    /// admitted. A page name is the item segment up to its first dot, e.g.,
    /// `pages/home.json` and `pages/home.xml` both belong to page `home`.
    pub fn admits(&self, path: &str) -> bool {
        if self.page_names.is_empty() {
            return true;
        }

        if catalog::classify(path) != Some(MetadataKind::Pages) {
            return false;
        }

        catalog::item_segment(path).is_some_and(|segment| {
            let stem = segment.split('.').next().unwrap_or(segment);
            self.matches_page(stem)
                || self
                    .page_names
                    .iter()
                    .any(|name| catalog::item_matches(segment, name))
        })
    }
}
