// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{list_tree, write_tree, zip_response, SiteFixture, TOKEN};

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use indoc::indoc;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use skuid_sync::{plan::RETRIEVE_PLAN_PATH, PlanFilter, SyncError};
use std::{
    fs,
    time::{Duration, Instant},
};
use wiremock::ResponseTemplate;

const SHARD_PATH: &str = "/api/v2/metadata/retrieve";

fn shard(kind: &str, names: &[&str]) -> Value {
    json!({
        "url": SHARD_PATH,
        "type": kind,
        "metadata": { kind: names },
    })
}

async fn numbered_shard_requests(site: &SiteFixture) -> usize {
    site.server()
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path().starts_with(&format!("{SHARD_PATH}/shard")))
        .count()
}

#[tokio::test]
async fn empty_archive_leaves_empty_target() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(RETRIEVE_PLAN_PATH, json!({ "a": shard("pages", &[]) }))
        .await;
    site.mount_shard(SHARD_PATH, zip_response(&[])?).await;
    let outer = tempfile::tempdir()?;
    let target = outer.path().join("site");

    let summary = site.engine().await?.retrieve(&target, None, true).await?;
    assert_eq!(summary.shards, 1);
    assert_eq!(summary.report.written, 0);
    assert!(target.is_dir());
    assert!(list_tree(&target)?.is_empty());

    Ok(())
}

#[tokio::test]
async fn empty_plan_contacts_no_shard() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(RETRIEVE_PLAN_PATH, json!({})).await;
    let target = tempfile::tempdir()?;

    let summary = site.engine().await?.retrieve(target.path(), None, true).await?;
    assert_eq!(summary.shards, 0);
    assert!(site.requests_to(SHARD_PATH).await.is_empty());

    Ok(())
}

#[tokio::test]
async fn single_data_source_shard() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(
        RETRIEVE_PLAN_PATH,
        json!({ "ds": shard("dataSources", &["mydatasource"]) }),
    )
    .await;
    site.mount_shard(
        SHARD_PATH,
        zip_response(&[("datasources/mydatasource.json", "blob")])?,
    )
    .await;
    let target = tempfile::tempdir()?;
    write_tree(target.path(), &[("datasources/stale.json", "{}")])?;

    let summary = site.engine().await?.retrieve(target.path(), None, true).await?;
    assert_eq!(summary.shards, 1);
    assert_eq!(list_tree(target.path())?, vec!["datasources/mydatasource.json"]);
    assert_eq!(
        fs::read_to_string(target.path().join("datasources/mydatasource.json"))?,
        "blob"
    );

    let requests = site.requests_to(SHARD_PATH).await;
    assert_eq!(requests.len(), 1);
    let scope: Value = serde_json::from_slice(&requests[0].body)?;
    assert_eq!(scope, json!({ "dataSources": ["mydatasource"] }));
    assert_eq!(
        requests[0]
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok()),
        Some(format!("Bearer {TOKEN}").as_str())
    );

    Ok(())
}

#[tokio::test]
async fn filter_is_sent_with_plan_request() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(RETRIEVE_PLAN_PATH, json!({})).await;
    let target = tempfile::tempdir()?;
    let filter = PlanFilter::from_flags(Some("crm".into()), ["home"]);

    site.engine()
        .await?
        .retrieve(target.path(), filter.as_ref(), true)
        .await?;

    let requests = site.requests_to(RETRIEVE_PLAN_PATH).await;
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body)?;
    assert_eq!(body, json!({ "appName": "crm", "pageNames": ["home"] }));

    Ok(())
}

#[tokio::test]
async fn unsafe_entries_are_quarantined() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(RETRIEVE_PLAN_PATH, json!({ "pages": shard("pages", &[]) }))
        .await;
    site.mount_shard(
        SHARD_PATH,
        zip_response(&[("../etc/passwd", "root"), ("pages/a.json", "{}")])?,
    )
    .await;
    let outer = tempfile::tempdir()?;
    let target = outer.path().join("site");

    let summary = site.engine().await?.retrieve(&target, None, true).await?;
    assert_eq!(list_tree(&target)?, vec!["pages/a.json"]);
    assert_eq!(summary.report.quarantined.len(), 1);
    assert!(!outer.path().join("etc/passwd").exists());

    Ok(())
}

#[tokio::test]
async fn partial_shard_failure_keeps_successful_payloads() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(
        RETRIEVE_PLAN_PATH,
        json!({
            "a": shard("pages", &[]),
            "b": { "url": "/api/v2/metadata/retrieve/b", "metadata": { "themes": [] } },
        }),
    )
    .await;
    site.mount_shard(SHARD_PATH, zip_response(&[("pages/a.json", "{}")])?)
        .await;
    site.mount_shard(
        "/api/v2/metadata/retrieve/b",
        ResponseTemplate::new(500).set_body_string("boom"),
    )
    .await;
    let target = tempfile::tempdir()?;

    let error = site
        .engine()
        .await?
        .retrieve(target.path(), None, true)
        .await
        .err();
    assert!(
        matches!(&error, Some(SyncError::ShardsFailed { shards }) if shards == &["b".to_owned()]),
        "unexpected result {error:?}"
    );
    assert_eq!(error.map(|error| error.exit_code()), Some(3));
    assert_eq!(list_tree(target.path())?, vec!["pages/a.json"]);

    Ok(())
}

#[tokio::test]
async fn unauthorized_shard_fails_authentication() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(RETRIEVE_PLAN_PATH, json!({ "a": shard("pages", &[]) }))
        .await;
    site.mount_shard(SHARD_PATH, ResponseTemplate::new(401)).await;
    let target = tempfile::tempdir()?;

    let error = site
        .engine()
        .await?
        .retrieve(target.path(), None, true)
        .await
        .err();
    assert!(matches!(error, Some(SyncError::ShardUnauthorized { .. })));
    assert_eq!(error.map(|error| error.exit_code()), Some(1));

    Ok(())
}

#[tokio::test]
async fn malformed_plan_is_planning_failure() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(RETRIEVE_PLAN_PATH, json!({ "a": { "url": "" } }))
        .await;
    let target = tempfile::tempdir()?;

    let error = site
        .engine()
        .await?
        .retrieve(target.path(), None, true)
        .await
        .err();
    assert_eq!(error.map(|error| error.exit_code()), Some(2));

    Ok(())
}

#[tokio::test]
async fn repeated_retrieve_converges() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(
        RETRIEVE_PLAN_PATH,
        json!({ "a": shard("pages", &[]), "b": { "url": "/api/v2/metadata/retrieve/b", "metadata": { "profiles": [] } } }),
    )
    .await;
    site.mount_shard(
        SHARD_PATH,
        zip_response(&[("pages/", ""), ("pages/a.json", r#"{"b":1}"#)])?,
    )
    .await;
    site.mount_shard(
        "/api/v2/metadata/retrieve/b",
        zip_response(&[("profiles/admin.json", r#"{"z":1,"a":{"y":2,"x":1}}"#)])?,
    )
    .await;
    let target = tempfile::tempdir()?;
    let engine = site.engine().await?;

    engine.retrieve(target.path(), None, true).await?;
    let first = list_tree(target.path())?
        .into_iter()
        .map(|file| Ok((fs::read(target.path().join(&file))?, file)))
        .collect::<Result<Vec<_>>>()?;
    engine.retrieve(target.path(), None, true).await?;
    let second = list_tree(target.path())?
        .into_iter()
        .map(|file| Ok((fs::read(target.path().join(&file))?, file)))
        .collect::<Result<Vec<_>>>()?;

    assert_eq!(first, second);
    assert_eq!(
        fs::read_to_string(target.path().join("profiles/admin.json"))?,
        "{\n  \"a\": {\n    \"x\": 1,\n    \"y\": 2\n  },\n  \"z\": 1\n}\n"
    );

    Ok(())
}

#[tokio::test]
async fn profile_merges_with_file_on_disk() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(
        RETRIEVE_PLAN_PATH,
        json!({ "a": shard("profiles", &["Admin"]) }),
    )
    .await;
    site.mount_shard(
        SHARD_PATH,
        zip_response(&[(
            "profiles/Admin.json",
            r#"{"name":"Admin","signupUi":null,"permissionSet":{"dataSourcePermissions":{"Racer":{"dataSourceObjectPermissions":null}},"appPermissions":{"Admin":{"isDefault":false},"Racer":{"isDefault":false}}},"enableSignupApi":false}"#,
        )])?,
    )
    .await;
    let target = tempfile::tempdir()?;
    write_tree(
        target.path(),
        &[(
            "profiles/Admin.json",
            r#"{"enableSignupUi": false, "name": "Admin", "requireEmailVerificationOnSignup": true}"#,
        )],
    )?;

    let summary = site.engine().await?.retrieve(target.path(), None, true).await?;
    assert_eq!(summary.report.written, 1);
    assert_eq!(
        fs::read_to_string(target.path().join("profiles/Admin.json"))?,
        indoc! {r#"
            {
              "enableSignupApi": false,
              "enableSignupUi": false,
              "name": "Admin",
              "permissionSet": {
                "appPermissions": {
                  "Admin": {
                    "isDefault": false
                  },
                  "Racer": {
                    "isDefault": false
                  }
                },
                "dataSourcePermissions": {
                  "Racer": {}
                }
              },
              "requireEmailVerificationOnSignup": true
            }
        "#}
    );

    Ok(())
}

#[tokio::test]
async fn profiles_from_several_shards_are_merged() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(
        RETRIEVE_PLAN_PATH,
        json!({
            "a": { "url": "/api/v2/metadata/retrieve/a", "metadata": { "profiles": ["admin"] } },
            "b": { "url": "/api/v2/metadata/retrieve/b", "metadata": { "profiles": ["admin"] } },
        }),
    )
    .await;
    site.mount_shard(
        "/api/v2/metadata/retrieve/a",
        zip_response(&[(
            "profiles/admin.json",
            r#"{"name":"admin","permissions":{"pages":true}}"#,
        )])?,
    )
    .await;
    site.mount_shard(
        "/api/v2/metadata/retrieve/b",
        zip_response(&[(
            "profiles/admin.json",
            r#"{"name":null,"permissions":{"files":true}}"#,
        )])?,
    )
    .await;
    let target = tempfile::tempdir()?;

    site.engine().await?.retrieve(target.path(), None, true).await?;
    let profile: Value =
        serde_json::from_slice(&fs::read(target.path().join("profiles/admin.json"))?)?;
    assert_eq!(
        profile,
        json!({ "name": "admin", "permissions": { "files": true, "pages": true } })
    );

    Ok(())
}

#[tokio::test]
async fn json_payloads_without_zip() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_plan(RETRIEVE_PLAN_PATH, json!({ "a": shard("themes", &[]) }))
        .await;
    site.mount_shard(
        SHARD_PATH,
        ResponseTemplate::new(200).set_body_json(json!({
            "themes/dark.json": STANDARD.encode(r#"{"color":"black"}"#),
        })),
    )
    .await;
    let target = tempfile::tempdir()?;

    site.engine().await?.retrieve(target.path(), None, false).await?;
    assert_eq!(
        fs::read_to_string(target.path().join("themes/dark.json"))?,
        r#"{"color":"black"}"#
    );

    let requests = site.requests_to(SHARD_PATH).await;
    assert_eq!(
        requests[0]
            .headers
            .get("accept")
            .and_then(|value| value.to_str().ok()),
        Some("application/json")
    );

    Ok(())
}

#[tokio::test]
async fn cancellation_interrupts_planning() -> Result<()> {
    let site = SiteFixture::start().await;
    site.mount_shard(
        RETRIEVE_PLAN_PATH,
        ResponseTemplate::new(200)
            .set_body_json(json!({ "a": shard("pages", &[]) }))
            .set_delay(Duration::from_secs(3)),
    )
    .await;
    let target = tempfile::tempdir()?;
    write_tree(target.path(), &[("pages/keep.json", "{}")])?;
    let engine = site.engine().await?;
    let cancel = engine.cancellation();

    let started = Instant::now();
    let stop = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    };
    let (outcome, ()) = tokio::join!(engine.retrieve(target.path(), None, true), stop);
    let error = outcome.err();
    assert!(matches!(error, Some(SyncError::Cancelled)), "unexpected result {error:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(site.requests_to(SHARD_PATH).await.is_empty());
    assert_eq!(list_tree(target.path())?, vec!["pages/keep.json"]);

    Ok(())
}

#[tokio::test]
async fn shards_run_at_most_four_at_a_time() -> Result<()> {
    let site = SiteFixture::start().await;
    let plan = (0..8)
        .map(|index| {
            (
                format!("s{index}"),
                json!({ "url": format!("{SHARD_PATH}/shard{index}"), "metadata": { "pages": [] } }),
            )
        })
        .collect::<serde_json::Map<_, _>>();
    site.mount_plan(RETRIEVE_PLAN_PATH, Value::Object(plan)).await;
    for index in 0..8 {
        site.mount_shard(
            &format!("{SHARD_PATH}/shard{index}"),
            zip_response(&[])?.set_delay(Duration::from_millis(300)),
        )
        .await;
    }
    let target = tempfile::tempdir()?;
    let engine = site.engine().await?;

    let started = Instant::now();
    let observe = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        numbered_shard_requests(&site).await
    };
    let (summary, early) = tokio::join!(engine.retrieve(target.path(), None, true), observe);

    assert_eq!(summary?.shards, 8);
    assert!(early <= 4, "{early} shard requests in the first wave");
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert_eq!(numbered_shard_requests(&site).await, 8);

    Ok(())
}
