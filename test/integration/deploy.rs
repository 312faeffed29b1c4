// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{write_tree, zip_contents, SiteFixture};

use anyhow::Result;
use pretty_assertions::assert_eq;
use serde_json::json;
use skuid_sync::{plan::DEPLOY_PLAN_PATH, PlanFilter, SyncError};
use std::time::{Duration, Instant};
use wiremock::ResponseTemplate;

const SHARD_PATH: &str = "/api/v2/metadata/deploy";

const SITE_TREE: &[(&str, &str)] = &[
    ("pages/a.json", r#"{"name":"a"}"#),
    ("pages/a.xml", "<skuid__page/>"),
    ("pages/b.json", r#"{"name":"b"}"#),
    ("datasources/crm.json", r#"{"name":"crm"}"#),
    ("notes.txt", "not metadata"),
];

#[tokio::test]
async fn page_filter_narrows_deployed_archive() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(
        DEPLOY_PLAN_PATH,
        json!({ "pages": { "url": SHARD_PATH, "type": "pages", "metadata": { "pages": [] } } }),
    )
    .await;
    site.mount_shard(SHARD_PATH, ResponseTemplate::new(200)).await;
    let root = tempfile::tempdir()?;
    write_tree(
        root.path(),
        &[("pages/a.json", "{}"), ("pages/b.json", "{}")],
    )?;
    let filter = PlanFilter::from_flags(None, ["a"]);

    let summary = site
        .engine()
        .await?
        .deploy(root.path(), filter.as_ref())
        .await?;
    assert_eq!(summary.shards.len(), 1);

    let requests = site.requests_to(SHARD_PATH).await;
    assert_eq!(requests.len(), 1);
    let deployed = zip_contents(&requests[0].body)?;
    assert_eq!(deployed.keys().collect::<Vec<_>>(), vec!["pages/a.json"]);

    Ok(())
}

#[tokio::test]
async fn every_shard_receives_its_own_scope() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(
        DEPLOY_PLAN_PATH,
        json!({
            "pages": { "url": "/api/v2/metadata/deploy/pages", "metadata": { "pages": ["a"] } },
            "data": { "url": "/api/v2/metadata/deploy/data", "metadata": { "dataSources": null } },
        }),
    )
    .await;
    site.mount_shard(
        "/api/v2/metadata/deploy/pages",
        ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "warnings": ["slow page"] })),
    )
    .await;
    site.mount_shard("/api/v2/metadata/deploy/data", ResponseTemplate::new(200))
        .await;
    let root = tempfile::tempdir()?;
    write_tree(root.path(), SITE_TREE)?;

    let summary = site.engine().await?.deploy(root.path(), None).await?;
    assert_eq!(summary.shards.len(), 2);
    assert!(summary.shards.values().all(|shard| shard.ok));

    let pages = site.requests_to("/api/v2/metadata/deploy/pages").await;
    assert_eq!(
        zip_contents(&pages[0].body)?.into_keys().collect::<Vec<_>>(),
        vec!["pages/a.json", "pages/a.xml"]
    );
    let data = site.requests_to("/api/v2/metadata/deploy/data").await;
    assert_eq!(
        zip_contents(&data[0].body)?.into_keys().collect::<Vec<_>>(),
        vec!["datasources/crm.json"]
    );
    assert_eq!(
        data[0]
            .headers
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("application/zip")
    );

    let plans = site.requests_to(DEPLOY_PLAN_PATH).await;
    let content_type = plans[0]
        .headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("multipart/form-data"));

    Ok(())
}

#[tokio::test]
async fn shard_without_local_files_is_skipped() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(
        DEPLOY_PLAN_PATH,
        json!({
            "pages": { "url": "/api/v2/metadata/deploy/pages", "metadata": { "pages": [] } },
            "themes": { "url": "/api/v2/metadata/deploy/themes", "metadata": { "themes": [] } },
        }),
    )
    .await;
    site.mount_shard("/api/v2/metadata/deploy/pages", ResponseTemplate::new(200))
        .await;
    let root = tempfile::tempdir()?;
    write_tree(root.path(), SITE_TREE)?;

    let summary = site.engine().await?.deploy(root.path(), None).await?;
    assert_eq!(summary.shards.get("themes").map(|shard| shard.skipped), Some(true));
    assert!(site.requests_to("/api/v2/metadata/deploy/themes").await.is_empty());

    Ok(())
}

#[tokio::test]
async fn rejected_shard_fails_deploy() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(
        DEPLOY_PLAN_PATH,
        json!({ "pages": { "url": SHARD_PATH, "metadata": { "pages": [] } } }),
    )
    .await;
    site.mount_shard(
        SHARD_PATH,
        ResponseTemplate::new(200).set_body_json(json!({
            "OK": false,
            "Errors": ["page a has no layout"],
        })),
    )
    .await;
    let root = tempfile::tempdir()?;
    write_tree(root.path(), SITE_TREE)?;

    let error = site.engine().await?.deploy(root.path(), None).await.err();
    assert!(
        matches!(&error, Some(SyncError::ShardsFailed { shards }) if shards == &["pages".to_owned()]),
        "unexpected result {error:?}"
    );
    assert_eq!(error.map(|error| error.exit_code()), Some(3));

    Ok(())
}

#[tokio::test]
async fn empty_tree_cannot_be_deployed() -> Result<()> {
    let site = SiteFixture::start().await;
    let root = tempfile::tempdir()?;
    write_tree(root.path(), &[("notes.txt", "not metadata")])?;

    let error = site.engine().await?.deploy(root.path(), None).await.err();
    assert!(matches!(error, Some(SyncError::Pack(_))));
    assert!(site.requests_to(DEPLOY_PLAN_PATH).await.is_empty());

    Ok(())
}

#[tokio::test]
async fn rejected_plan_is_planning_failure() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_shard(
        DEPLOY_PLAN_PATH,
        ResponseTemplate::new(400).set_body_string("bad archive"),
    )
    .await;
    let root = tempfile::tempdir()?;
    write_tree(root.path(), SITE_TREE)?;

    let error = site.engine().await?.deploy(root.path(), None).await.err();
    assert_eq!(error.map(|error| error.exit_code()), Some(2));

    Ok(())
}

#[tokio::test]
async fn cancellation_before_shards_applies_nothing() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_shard(
        DEPLOY_PLAN_PATH,
        ResponseTemplate::new(200)
            .set_body_json(json!({ "pages": { "url": SHARD_PATH, "metadata": { "pages": [] } } }))
            .set_delay(Duration::from_secs(3)),
    )
    .await;
    site.mount_shard(SHARD_PATH, ResponseTemplate::new(200)).await;
    let root = tempfile::tempdir()?;
    write_tree(root.path(), SITE_TREE)?;
    let engine = site.engine().await?;
    let cancel = engine.cancellation();

    let started = Instant::now();
    let stop = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    };
    let (outcome, ()) = tokio::join!(engine.deploy(root.path(), None), stop);
    let error = outcome.err();
    assert!(matches!(error, Some(SyncError::Cancelled)), "unexpected result {error:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(site.requests_to(SHARD_PATH).await.is_empty());

    Ok(())
}

#[tokio::test]
async fn cancellation_mid_shard_is_partial_deploy() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(
        DEPLOY_PLAN_PATH,
        json!({ "pages": { "url": SHARD_PATH, "metadata": { "pages": [] } } }),
    )
    .await;
    site.mount_shard(
        SHARD_PATH,
        ResponseTemplate::new(200).set_delay(Duration::from_secs(3)),
    )
    .await;
    let root = tempfile::tempdir()?;
    write_tree(root.path(), SITE_TREE)?;
    let engine = site.engine().await?;
    let cancel = engine.cancellation();

    let started = Instant::now();
    let stop = async {
        for _ in 0..200 {
            if !site.requests_to(SHARD_PATH).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
    };
    let (outcome, ()) = tokio::join!(engine.deploy(root.path(), None), stop);
    let error = outcome.err();
    assert!(
        matches!(error, Some(SyncError::PartiallyApplied)),
        "unexpected result {error:?}"
    );
    assert_eq!(error.map(|error| error.exit_code()), Some(3));
    assert!(started.elapsed() < Duration::from_secs(2));

    Ok(())
}
