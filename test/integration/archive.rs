// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{list_tree, write_tree};

use anyhow::Result;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use skuid_sync::{
    archive::{self, ArchiveEntry},
    execute::RetrievedArchive,
    merge::Merger,
};
use std::{collections::BTreeMap, fs};

fn site_files() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map(
        "(pages|datasources|themes|files)/[a-z]{1,8}\\.(json|xml)",
        "[ -~]{0,64}",
        1..12,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn packed_tree_unpacks_into_identical_tree(files in site_files()) {
        let source = tempfile::tempdir().map_err(|error| TestCaseError::fail(error.to_string()))?;
        let target = tempfile::tempdir().map_err(|error| TestCaseError::fail(error.to_string()))?;
        let entries = files
            .iter()
            .map(|(path, contents)| (path.as_str(), contents.as_str()))
            .collect::<Vec<_>>();
        write_tree(source.path(), &entries).map_err(|error| TestCaseError::fail(error.to_string()))?;

        let bytes = archive::pack(source.path()).map_err(|error| TestCaseError::fail(error.to_string()))?;
        let report = Merger::new(target.path())
            .write_results_to_disk(&[RetrievedArchive { shard: "all".into(), bytes }], true)
            .map_err(|error| TestCaseError::fail(error.to_string()))?;

        prop_assert!(report.quarantined.is_empty());
        for (path, contents) in &files {
            let written = fs::read_to_string(target.path().join(path))
                .map_err(|error| TestCaseError::fail(error.to_string()))?;
            prop_assert_eq!(&written, contents);
        }
    }
}

#[test]
fn concatenated_archives_land_in_one_tree() -> Result<()> {
    let first = tempfile::tempdir()?;
    write_tree(first.path(), &[("pages/a.json", "a"), ("themes/dark.json", "dark")])?;
    let second = tempfile::tempdir()?;
    write_tree(second.path(), &[("pages/b.json", "b")])?;

    let mut bytes = archive::pack(first.path())?;
    bytes.extend(archive::pack(second.path())?);

    let mut seen = Vec::new();
    let quarantined = archive::unpack_concatenated(&bytes, |entry: ArchiveEntry| {
        seen.push(entry.path);
        Ok::<_, archive::ArchiveError>(())
    })?;
    assert!(quarantined.is_empty());
    assert_eq!(seen, vec!["pages/a.json", "themes/dark.json", "pages/b.json"]);

    let target = tempfile::tempdir()?;
    Merger::new(target.path())
        .write_results_to_disk(&[RetrievedArchive { shard: "a".into(), bytes }], true)?;
    assert_eq!(
        list_tree(target.path())?,
        vec!["pages/a.json", "pages/b.json", "themes/dark.json"]
    );

    Ok(())
}
