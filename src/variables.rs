// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Server-side named variables.
//!
//! Sites keep environment specific values, e.g., API endpoints or feature
//! switches, as named variables on the server. Confidential variables can be
//! written, but the server never hands their values back.

use crate::session::{ApiRequest, Session, SessionError, APPLICATION_JSON};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

/// Endpoint listing and holding variables.
pub const VARIABLES_PATH: &str = "/api/v2/variables";

/// Named variable of a site.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Variable {
    #[serde(alias = "Name")]
    pub name: String,

    /// Value of the variable. Absent for confidential variables.
    #[serde(default, alias = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, alias = "Confidential")]
    pub confidential: bool,
}

/// List every variable of the site.
///
/// # Errors
///
/// - Return [`VariablesError::Request`] if the request fails or the listing
///   cannot be decoded.
#[instrument(skip(session), level = "debug")]
pub async fn list_variables(session: &Session) -> Result<Vec<Variable>> {
    let response = session
        .send(ApiRequest::get(VARIABLES_PATH).accept(APPLICATION_JSON))
        .await?;
    let variables: Option<Vec<Variable>> = response.json("variable listing")?;

    Ok(variables.unwrap_or_default())
}

/// Look up single variable by name.
///
/// # Errors
///
/// - Return [`VariablesError::Request`] if the listing cannot be fetched.
/// - Return [`VariablesError::NotFound`] if no variable has that name.
pub async fn get_variable(session: &Session, name: &str) -> Result<Variable> {
    list_variables(session)
        .await?
        .into_iter()
        .find(|variable| variable.name == name)
        .ok_or_else(|| VariablesError::NotFound(name.to_owned()))
}

/// Create or replace variable.
///
/// # Errors
///
/// - Return [`VariablesError::InvalidName`] if name is blank.
/// - Return [`VariablesError::Request`] if the request fails.
#[instrument(skip(session, value), level = "debug")]
pub async fn set_variable(
    session: &Session,
    name: &str,
    value: &str,
    confidential: bool,
) -> Result<()> {
    let variable = Variable {
        name: validate_name(name)?.to_owned(),
        value: Some(value.to_owned()),
        confidential,
    };

    let request = ApiRequest::new(Method::PUT, variable_path(name))
        .json(&variable)?
        .accept(APPLICATION_JSON);
    session.send(request).await?;
    info!("set variable {name}");

    Ok(())
}

/// Remove variable.
///
/// # Errors
///
/// - Return [`VariablesError::InvalidName`] if name is blank.
/// - Return [`VariablesError::Request`] if the request fails, including when
///   the variable does not exist.
#[instrument(skip(session), level = "debug")]
pub async fn remove_variable(session: &Session, name: &str) -> Result<()> {
    validate_name(name)?;
    session
        .send(ApiRequest::new(Method::DELETE, variable_path(name)))
        .await?;
    info!("removed variable {name}");

    Ok(())
}

fn validate_name(name: &str) -> Result<&str> {
    if name.trim().is_empty() {
        return Err(VariablesError::InvalidName(name.to_owned()));
    }

    Ok(name)
}

fn variable_path(name: &str) -> String {
    format!("{VARIABLES_PATH}/{}", urlencoding::encode(name))
}

/// Variables error types.
#[derive(Debug, thiserror::Error)]
pub enum VariablesError {
    /// Variable request failed.
    #[error(transparent)]
    Request(#[from] SessionError),

    /// Variable name cannot be used.
    #[error("invalid variable name {0:?}")]
    InvalidName(String),

    /// No variable has the requested name.
    #[error("no variable named {0:?}")]
    NotFound(String),
}

impl VariablesError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Request(error) if error.is_unauthorized())
    }
}

/// Friendly result alias :3
type Result<T, E = VariablesError> = std::result::Result<T, E>;
