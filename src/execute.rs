// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Plan execution.
//!
//! An [`Executor`] fans the shards of a [`PlanPayload`] out to the endpoints
//! they nominate. At most a fixed number of shards run at once. A failing
//! shard never aborts its siblings. Instead, every shard yields its own
//! outcome, and the caller decides what a failure means for the operation as
//! a whole.

use crate::{
    archive::{self, PackError},
    config::Limits,
    plan::{null_as_default, PlanFilter, PlanPayload, PlanShard, ShardScope},
    session::{ApiRequest, Session, SessionError, APPLICATION_JSON, APPLICATION_ZIP},
};

use futures::{stream, Future, StreamExt};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Outcome of each shard, keyed by shard name.
pub type ShardOutcomes<T> = BTreeMap<String, Result<T, ShardError>>;

/// Response body of a single retrieve shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedArchive {
    /// Name of the shard that produced the body.
    pub shard: String,

    /// Concatenated zip archives, or a JSON map of base64 file contents.
    pub bytes: Vec<u8>,
}

/// Server verdict on a single deploy shard.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeployShardResult {
    #[serde(default, alias = "OK", alias = "Ok")]
    pub ok: bool,

    #[serde(default, alias = "Errors", deserialize_with = "null_as_default")]
    pub errors: Vec<String>,

    #[serde(default, alias = "Warnings", deserialize_with = "null_as_default")]
    pub warnings: Vec<String>,

    /// Shard had nothing to deploy, so nothing was sent.
    #[serde(skip)]
    pub skipped: bool,
}

impl DeployShardResult {
    fn skipped() -> Self {
        Self {
            ok: true,
            skipped: true,
            ..Self::default()
        }
    }
}

/// Bounded-parallel shard runner.
#[derive(Debug, Clone)]
pub struct Executor {
    session: Session,
    workers: usize,
    shard_timeout: Duration,
    cancel: CancellationToken,
    progress: ProgressBar,
}

impl Executor {
    /// Construct new executor over an authenticated session.
    pub fn new(session: Session, limits: &Limits) -> Self {
        Self {
            session,
            workers: limits.workers(),
            shard_timeout: limits.shard_timeout(),
            cancel: CancellationToken::new(),
            progress: ProgressBar::hidden(),
        }
    }

    /// Report shard completion through a progress bar.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Abort in-flight shards once token is cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fetch the metadata of every shard in a retrieve plan.
    ///
    /// Each shard receives its scope as JSON. With `accept_zip` the response
    /// is expected to be concatenated zip archives, otherwise a JSON map of
    /// path to base64 contents.
    #[instrument(skip(self, plan), fields(shards = plan.len()), level = "debug")]
    pub async fn execute_retrieval(
        &self,
        plan: &PlanPayload,
        accept_zip: bool,
    ) -> ShardOutcomes<RetrievedArchive> {
        self.fan_out(plan, |name, shard| self.retrieve_shard(name, shard, accept_zip))
            .await
    }

    /// Deploy local tree through every shard of a deploy plan.
    ///
    /// Each shard receives an archive of just the files its scope covers,
    /// further narrowed by filter. Shards without any such files are skipped
    /// without contacting the server.
    #[instrument(skip(self, plan, root, filter), fields(shards = plan.len()), level = "debug")]
    pub async fn execute_deploy_plan(
        &self,
        plan: &PlanPayload,
        root: &Path,
        filter: Option<&PlanFilter>,
    ) -> ShardOutcomes<DeployShardResult> {
        self.fan_out(plan, |name, shard| self.deploy_shard(name, shard, root, filter))
            .await
    }

    async fn fan_out<'a, T, F, Fut>(&'a self, plan: &'a PlanPayload, run: F) -> ShardOutcomes<T>
    where
        F: Fn(&'a str, &'a PlanShard) -> Fut,
        Fut: Future<Output = Result<T, ShardError>> + 'a,
    {
        self.progress.set_length(plan.len() as u64);
        self.progress.set_position(0);

        stream::iter(plan)
            .map(|(name, shard)| {
                let work = run(name.as_str(), shard);
                async move {
                    let result = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => Err(ShardError::Cancelled),
                        outcome = tokio::time::timeout(self.shard_timeout, work) => {
                            outcome.unwrap_or(Err(ShardError::TimedOut(self.shard_timeout)))
                        }
                    };

                    self.progress.inc(1);
                    match &result {
                        Ok(_) => debug!("shard {name} finished"),
                        Err(error) => debug!("shard {name} failed: {error}"),
                    }

                    (name.clone(), result)
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await
    }

    async fn retrieve_shard(
        &self,
        name: &str,
        shard: &PlanShard,
        accept_zip: bool,
    ) -> Result<RetrievedArchive> {
        let accept = if accept_zip {
            APPLICATION_ZIP
        } else {
            APPLICATION_JSON
        };
        debug!("retrieve shard {name} ({}) from {}", shard.shard_type, shard.url);

        let request = ApiRequest::post(shard.url.as_str())
            .host(shard.target_host()?)
            .json(&shard.metadata)?
            .accept(accept);
        let response = self.session.send(request).await?;

        Ok(RetrievedArchive {
            shard: name.to_owned(),
            bytes: response.body,
        })
    }

    async fn deploy_shard(
        &self,
        name: &str,
        shard: &PlanShard,
        root: &Path,
        filter: Option<&PlanFilter>,
    ) -> Result<DeployShardResult> {
        let host = shard.target_host()?;
        let root = root.to_path_buf();
        let scope = shard.metadata.clone();
        let filter = filter.cloned();
        let packed = tokio::task::spawn_blocking(move || pack_shard(&root, &scope, filter.as_ref()))
            .await?;

        let archive = match packed {
            Ok(archive) => archive,
            Err(PackError::Empty { .. }) => {
                warn!("shard {name} has no local files to deploy, skipping");
                return Ok(DeployShardResult::skipped());
            }
            Err(error) => return Err(error.into()),
        };
        debug!("deploy shard {name} ({}) to {}", shard.shard_type, shard.url);

        let request = ApiRequest::post(shard.url.as_str())
            .host(host)
            .zip(archive)
            .accept(APPLICATION_JSON);
        let response = self.session.send(request).await?;

        // INVARIANT: Empty success body means the shard applied cleanly.
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(DeployShardResult {
                ok: true,
                ..DeployShardResult::default()
            });
        }

        Ok(response.json("deploy shard result")?)
    }
}

/// Pack files of a local tree that a shard scope covers.
///
/// # Errors
///
/// - Return [`PackError::Empty`] if the scope covers no local file.
/// - Return [`PackError`] for any other packing failure.
pub fn pack_shard(
    root: impl AsRef<Path>,
    scope: &ShardScope,
    filter: Option<&PlanFilter>,
) -> Result<Vec<u8>, PackError> {
    archive::pack_with(root, |path| {
        scope.admits(path) && filter.is_none_or(|filter| filter.admits(path))
    })
}

/// Shard execution error types.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// Shard request failed.
    #[error(transparent)]
    Request(#[from] SessionError),

    /// Shard archive cannot be packed from local tree.
    #[error("failed to pack shard archive")]
    Pack(#[from] PackError),

    /// Shard exceeded its time budget.
    #[error("shard timed out after {0:?}")]
    TimedOut(Duration),

    /// Shard was aborted by cancellation.
    #[error("shard cancelled")]
    Cancelled,

    /// Background worker of the shard failed.
    #[error("shard worker failed")]
    Worker(#[from] tokio::task::JoinError),
}

impl ShardError {
    /// Credentials were rejected while executing shard.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Request(error) if error.is_unauthorized())
    }

    /// Shard was interrupted rather than refused.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut(_))
    }
}

/// Friendly result alias :3
type Result<T, E = ShardError> = std::result::Result<T, E>;
