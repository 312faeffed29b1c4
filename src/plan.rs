// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Plan exchange.
//!
//! Every retrieve and deploy starts by asking the server for a __plan__. The
//! server answers with a [`PlanPayload`], a map of named plan shards, where
//! each [`PlanShard`] nominates the endpoint to send work to and the scope of
//! metadata that work covers.
//!
//! # Wire Format
//!
//! ```json
//! {
//!   "metadata": {
//!     "host": "",
//!     "url": "/api/v2/metadata/retrieve",
//!     "type": "metadataService",
//!     "metadata": { "pages": ["home"], "profiles": [] }
//!   }
//! }
//! ```
//!
//! Field names are also accepted in their capitalized spelling, e.g., `Host`
//! and `URL`. Shard names must be unique, and no shard may have an empty URL.

pub mod filter;

pub use filter::PlanFilter;

use crate::{
    catalog::{self, MetadataKind},
    session::{
        ApiRequest, FormPart, HostUrl, Session, SessionError, APPLICATION_JSON, APPLICATION_ZIP,
    },
};

use serde::{
    de::{Error as DeError, MapAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};
use std::{
    collections::{btree_map, BTreeMap},
    fmt::{Formatter, Result as FmtResult},
};
use tracing::{debug, info, instrument, warn};

/// Endpoint answering retrieve plans.
pub const RETRIEVE_PLAN_PATH: &str = "/api/v2/metadata/retrieve/plan";

/// Endpoint answering deploy plans.
pub const DEPLOY_PLAN_PATH: &str = "/api/v2/metadata/deploy/plan";

/// Ask server for a retrieve plan.
///
/// An absent filter is sent as `{}`.
///
/// # Errors
///
/// - Return [`PlanError::Request`] if the request fails.
/// - Return [`PlanError::Decode`] if the payload cannot be parsed.
/// - Return [`PlanError::EmptyUrl`] or [`PlanError::InvalidHost`] if a shard
///   cannot be executed.
#[instrument(skip(session, filter), level = "debug")]
pub async fn get_retrieve_plan(session: &Session, filter: Option<&PlanFilter>) -> Result<PlanPayload> {
    let request = ApiRequest::post(RETRIEVE_PLAN_PATH)
        .json(&filter.cloned().unwrap_or_default())?
        .accept(APPLICATION_JSON);
    let response = session.send(request).await?;
    let plan = PlanPayload::from_slice(&response.body)?;
    info!("retrieve plan has {} shard(s)", plan.len());

    Ok(plan)
}

/// Ask server for a deploy plan covering a packed local tree.
///
/// Sends a multipart body whose `filter` field holds the filter as JSON, and
/// whose `archive` field holds the packed archive.
///
/// # Errors
///
/// - Return [`PlanError::Request`] if the request fails.
/// - Return [`PlanError::Decode`] if the payload cannot be parsed.
/// - Return [`PlanError::EmptyUrl`] or [`PlanError::InvalidHost`] if a shard
///   cannot be executed.
#[instrument(skip(session, archive, filter), fields(archive_len = archive.len()), level = "debug")]
pub async fn prepare_deployment(
    session: &Session,
    archive: Vec<u8>,
    filter: Option<&PlanFilter>,
) -> Result<PlanPayload> {
    let filter = serde_json::to_vec(&filter.cloned().unwrap_or_default())
        .map_err(SessionError::Encode)?;
    let parts = vec![
        FormPart {
            name: "filter".into(),
            bytes: filter,
            content_type: APPLICATION_JSON,
            file_name: None,
        },
        FormPart {
            name: "archive".into(),
            bytes: archive,
            content_type: APPLICATION_ZIP,
            file_name: Some("archive.zip".into()),
        },
    ];

    let request = ApiRequest::post(DEPLOY_PLAN_PATH)
        .multipart(parts)
        .accept(APPLICATION_JSON);
    let response = session.send(request).await?;
    let plan = PlanPayload::from_slice(&response.body)?;
    info!("deploy plan has {} shard(s)", plan.len());

    Ok(plan)
}

/// Map of shard name to plan shard.
///
/// Shard order carries no meaning. Iteration happens in name order only to
/// keep logs stable.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PlanPayload(BTreeMap<String, PlanShard>);

impl PlanPayload {
    /// Parse and validate payload from response body.
    ///
    /// # Errors
    ///
    /// - Return [`PlanError::Decode`] if body is not a plan payload, or has
    ///   duplicate shard names.
    /// - Return [`PlanError::EmptyUrl`] if a shard has no URL.
    /// - Return [`PlanError::InvalidHost`] if a shard nominates a bad host.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let plan: PlanPayload = serde_json::from_slice(body)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Check that every shard can be executed.
    ///
    /// # Errors
    ///
    /// - Return [`PlanError::EmptyUrl`] if a shard has no URL.
    /// - Return [`PlanError::InvalidHost`] if a shard nominates a bad host.
    pub fn validate(&self) -> Result<()> {
        for (name, shard) in &self.0 {
            if shard.url.trim().is_empty() {
                return Err(PlanError::EmptyUrl { shard: name.clone() });
            }

            shard
                .target_host()
                .map_err(|source| PlanError::InvalidHost {
                    source,
                    shard: name.clone(),
                })?;
        }

        Ok(())
    }

    /// Keep only shards whose scope covers a metadata kind, and narrow their
    /// scope down to that kind alone.
    pub fn narrow_to(&self, kind: MetadataKind) -> Self {
        self.0
            .iter()
            .filter(|(_, shard)| shard.metadata.contains(kind))
            .map(|(name, shard)| {
                let mut shard = shard.clone();
                shard.metadata = shard.metadata.narrow_to(kind);
                (name.clone(), shard)
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&PlanShard> {
        self.0.get(name)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, PlanShard> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, PlanShard)> for PlanPayload {
    fn from_iter<T: IntoIterator<Item = (String, PlanShard)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PlanPayload {
    type Item = (&'a String, &'a PlanShard);
    type IntoIter = btree_map::Iter<'a, String, PlanShard>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'de> Deserialize<'de> for PlanPayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PayloadVisitor;

        impl<'de> Visitor<'de> for PayloadVisitor {
            type Value = PlanPayload;

            fn expecting(&self, fmt: &mut Formatter<'_>) -> FmtResult {
                fmt.write_str("a map of plan shards")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut shards = BTreeMap::new();
                while let Some(name) = map.next_key::<String>()? {
                    if shards.contains_key(&name) {
                        return Err(A::Error::custom(format!("duplicate plan shard {name:?}")));
                    }

                    let shard = map.next_value::<PlanShard>()?;
                    shards.insert(name, shard);
                }

                Ok(PlanPayload(shards))
            }
        }

        deserializer.deserialize_map(PayloadVisitor)
    }
}

/// Single unit of work nominated by the server.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlanShard {
    /// Host to send the shard to. Empty means the session host.
    #[serde(default, alias = "Host", skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Path component of the shard endpoint.
    #[serde(default, alias = "URL", deserialize_with = "null_as_default")]
    pub url: String,

    /// Free-form shard identifier, only used for logging.
    #[serde(
        default,
        rename = "type",
        alias = "Type",
        deserialize_with = "null_as_default"
    )]
    pub shard_type: String,

    /// Metadata this shard covers.
    #[serde(default, alias = "Metadata")]
    pub metadata: ShardScope,

    /// App filter echoed back from the request.
    #[serde(
        default,
        rename = "appName",
        alias = "AppName",
        skip_serializing_if = "Option::is_none"
    )]
    pub app_name: Option<String>,

    /// Page filter echoed back from the request.
    #[serde(
        default,
        rename = "pageNames",
        alias = "PageNames",
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub page_names: Vec<String>,
}

impl PlanShard {
    /// Host this shard must be sent to, or [`None`] for the session host.
    ///
    /// # Errors
    ///
    /// - Return [`SessionError::InvalidHost`] if the nominated host cannot be
    ///   normalized.
    pub fn target_host(&self) -> Result<Option<HostUrl>, SessionError> {
        match self.host.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(host) => HostUrl::parse(host).map(Some),
        }
    }
}

/// Metadata kinds a shard covers, with the item names of each kind.
///
/// An empty name list covers every item of its kind.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ShardScope(BTreeMap<MetadataKind, Vec<String>>);

impl ShardScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add kind with item names to scope.
    pub fn insert(&mut self, kind: MetadataKind, names: impl IntoIterator<Item = impl Into<String>>) {
        self.0
            .insert(kind, names.into_iter().map(Into::into).collect());
    }

    pub fn contains(&self, kind: MetadataKind) -> bool {
        self.0.contains_key(&kind)
    }

    pub fn names(&self, kind: MetadataKind) -> Option<&[String]> {
        self.0.get(&kind).map(Vec::as_slice)
    }

    pub fn kinds(&self) -> impl Iterator<Item = MetadataKind> + '_ {
        self.0.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of this scope holding only one kind.
    pub fn narrow_to(&self, kind: MetadataKind) -> Self {
        self.0
            .get(&kind)
            .map(|names| Self(BTreeMap::from([(kind, names.clone())])))
            .unwrap_or_default()
    }

    /// Check if slash-separated path of a site tree falls inside this scope.
    pub fn admits(&self, path: &str) -> bool {
        let Some(names) = catalog::classify(path).and_then(|kind| self.names(kind)) else {
            return false;
        };

        if names.is_empty() {
            return true;
        }

        catalog::item_segment(path)
            .is_some_and(|segment| names.iter().any(|name| catalog::item_matches(segment, name)))
    }
}

impl FromIterator<(MetadataKind, Vec<String>)> for ShardScope {
    fn from_iter<T: IntoIterator<Item = (MetadataKind, Vec<String>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'de> Deserialize<'de> for ShardScope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<BTreeMap<String, Option<Vec<String>>>> = Option::deserialize(deserializer)?;
        let mut scope = BTreeMap::new();
        for (key, names) in raw.unwrap_or_default() {
            match MetadataKind::from_wire_name(&key) {
                Some(kind) => {
                    scope.insert(kind, names.unwrap_or_default());
                }
                None => warn!("drop unknown metadata kind {key:?} from shard scope"),
            }
        }
        debug!("shard scope covers {} kind(s)", scope.len());

        Ok(Self(scope))
    }
}

/// Read JSON `null` as the default value of a field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Plan exchange error types.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Plan request failed.
    #[error(transparent)]
    Request(#[from] SessionError),

    /// Plan payload cannot be parsed.
    #[error("failed to decode plan payload")]
    Decode(#[from] serde_json::Error),

    /// Shard has no endpoint to send work to.
    #[error("plan shard {shard:?} has an empty URL")]
    EmptyUrl { shard: String },

    /// Shard nominates a host that cannot be used.
    #[error("plan shard {shard:?} nominates an invalid host")]
    InvalidHost {
        #[source]
        source: SessionError,
        shard: String,
    },
}

impl PlanError {
    /// Credentials were rejected while planning.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Request(error) if error.is_unauthorized())
    }
}

/// Friendly result alias :3
type Result<T, E = PlanError> = std::result::Result<T, E>;
