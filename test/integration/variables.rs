// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::SiteFixture;

use anyhow::Result;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use skuid_sync::{
    variables::{self, Variable, VariablesError, VARIABLES_PATH},
    SyncError,
};
use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

async fn mount_listing(site: &SiteFixture) {
    Mock::given(method("GET"))
        .and(path(VARIABLES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "name": "API_URL", "value": "https://api.example.com" },
            { "name": "SECRET", "confidential": true },
        ])))
        .mount(site.server())
        .await;
}

#[tokio::test]
async fn list_and_get() -> Result<()> {
    let site = SiteFixture::start().await;
    mount_listing(&site).await;
    let session = site.session().await?;

    let listing = variables::list_variables(&session).await?;
    assert_eq!(listing.len(), 2);
    assert_eq!(
        variables::get_variable(&session, "SECRET").await?,
        Variable {
            name: "SECRET".into(),
            value: None,
            confidential: true,
        }
    );

    Ok(())
}

#[tokio::test]
async fn missing_variable_is_not_found() -> Result<()> {
    let site = SiteFixture::start().await;
    mount_listing(&site).await;
    let session = site.session().await?;

    let error = variables::get_variable(&session, "NOPE").await.err();
    assert!(matches!(&error, Some(VariablesError::NotFound(name)) if name == "NOPE"));
    assert_eq!(error.map(|error| SyncError::from(error).exit_code()), Some(3));

    Ok(())
}

#[tokio::test]
async fn set_puts_variable() -> Result<()> {
    let site = SiteFixture::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v2/variables/API_URL"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(site.server())
        .await;
    let session = site.session().await?;

    variables::set_variable(&session, "API_URL", "https://x", true).await?;
    let requests = site.requests_to("/api/v2/variables/API_URL").await;
    let body: Value = serde_json::from_slice(&requests[0].body)?;
    assert_eq!(
        body,
        json!({ "name": "API_URL", "value": "https://x", "confidential": true })
    );

    Ok(())
}

#[tokio::test]
async fn blank_name_never_reaches_site() -> Result<()> {
    let site = SiteFixture::start().await;
    let session = site.session().await?;

    let error = variables::set_variable(&session, " ", "x", false).await.err();
    assert!(matches!(error, Some(VariablesError::InvalidName(_))));
    assert_eq!(error.map(|error| SyncError::from(error).exit_code()), Some(5));

    Ok(())
}

#[tokio::test]
async fn remove_deletes_variable() -> Result<()> {
    let site = SiteFixture::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/v2/variables/API_URL"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(site.server())
        .await;
    let session = site.session().await?;

    variables::remove_variable(&session, "API_URL").await?;

    Ok(())
}

#[tokio::test]
async fn removing_unknown_variable_fails() -> Result<()> {
    let site = SiteFixture::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/v2/variables/NOPE"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such variable"))
        .mount(site.server())
        .await;
    let session = site.session().await?;

    let error = variables::remove_variable(&session, "NOPE").await.err();
    assert!(matches!(error, Some(VariablesError::Request(_))));

    Ok(())
}
