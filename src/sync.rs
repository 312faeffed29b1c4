// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Sync orchestration.
//!
//! The [`SyncEngine`] composes planning, shard execution, and merging into the
//! three user facing use cases:
//!
//! - __Retrieve__: plan, execute every shard, reset the directories of the
//!   kinds that came back, then write each payload through the merger.
//! - __Deploy__: pack the local tree, plan, then execute every shard against
//!   the endpoint it nominates.
//! - __Watch__: debounce local changes per path, and deploy the metadata kind
//!   of each settled change on its own. Changes that settle while a deploy is
//!   in flight are coalesced into one trailing deploy.
//!
//! Every operation runs under a cancellation token shared with the executor.
//! Retrieve and deploy also run under a wall-clock budget. Panics inside an
//! operation are contained here, and surface as [`SyncError::Panicked`].

pub mod watch;

pub use watch::{classify_change, poll_changes, Debouncer};

use crate::{
    archive::{self, PackError},
    catalog::{self, MetadataKind},
    config::{ConfigError, Limits},
    execute::{DeployShardResult, Executor},
    merge::{MergeError, Merger, WriteReport},
    plan::{self, PlanError, PlanFilter},
    session::{RetryPolicy, Session, SessionError, SessionOptions},
    variables::VariablesError,
};

use futures::{
    future::{Fuse, FusedFuture, LocalBoxFuture},
    FutureExt, Stream, StreamExt,
};
use indicatif::ProgressBar;
use std::{
    any::Any,
    cell::Cell,
    collections::{BTreeMap, BTreeSet},
    fmt::{Debug, Formatter, Result as FmtResult},
    future::Future,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// User credentials of a site.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub username: String,
    pub password: String,
}

impl Debug for Credentials {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("Credentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Result of a completed retrieve.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetrieveSummary {
    /// Number of shards in the plan.
    pub shards: usize,

    /// What was written to disk.
    pub report: WriteReport,
}

/// Result of a completed deploy.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeploySummary {
    /// Server verdict of each shard.
    pub shards: BTreeMap<String, DeployShardResult>,
}

impl DeploySummary {
    fn absorb(&mut self, other: DeploySummary) {
        self.shards.extend(other.shards);
    }
}

/// Result of a watch session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchSummary {
    /// Deploys started.
    pub deploys: usize,

    /// Deploys that failed.
    pub failures: usize,
}

/// Orchestrator of retrieve, deploy, and watch.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    executor: Executor,
    limits: Limits,
}

impl SyncEngine {
    /// Authenticate against host, and construct engine over the session.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::InvalidArgument`] if host cannot be normalized.
    /// - Return [`SyncError::Auth`] if authentication fails.
    pub async fn connect(credentials: &Credentials, limits: Limits) -> Result<Self> {
        Self::connect_with(credentials, limits, false).await
    }

    /// Authenticate like [`SyncEngine::connect`], but also accept a plain
    /// `http://` host. Meant for local servers only.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::InvalidArgument`] if host cannot be normalized.
    /// - Return [`SyncError::Auth`] if authentication fails.
    pub async fn connect_insecure(credentials: &Credentials, limits: Limits) -> Result<Self> {
        Self::connect_with(credentials, limits, true).await
    }

    async fn connect_with(
        credentials: &Credentials,
        limits: Limits,
        allow_http: bool,
    ) -> Result<Self> {
        let options = SessionOptions {
            request_timeout: limits.request_timeout(),
            retry: RetryPolicy::default(),
            allow_http,
        };
        let session = Session::authorize(
            &credentials.host,
            &credentials.username,
            &credentials.password,
            options,
        )
        .await
        .map_err(SyncError::from_auth)?;

        Ok(Self::new(session, limits))
    }

    /// Construct engine over an authenticated session.
    pub fn new(session: Session, limits: Limits) -> Self {
        Self {
            executor: Executor::new(session, &limits),
            limits,
        }
    }

    /// Report shard progress through a progress bar.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.executor = self.executor.with_progress(progress);
        self
    }

    /// Use externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.executor = self.executor.with_cancellation(cancel);
        self
    }

    pub fn session(&self) -> &Session {
        self.executor.session()
    }

    /// Token that aborts every operation of this engine once cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.executor.cancellation().clone()
    }

    /// Retrieve site metadata into target directory.
    ///
    /// Payloads of successful shards are always written, even when other
    /// shards fail.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Plan`] if planning fails.
    /// - Return [`SyncError::ShardsFailed`] if any shard fails.
    /// - Return [`SyncError::Merge`] if target directory cannot be written.
    /// - Return [`SyncError::TimedOut`] or [`SyncError::Cancelled`] if
    ///   interrupted.
    #[instrument(skip(self, target, filter), fields(target = %target.display()), level = "debug")]
    pub async fn retrieve(
        &self,
        target: &Path,
        filter: Option<&PlanFilter>,
        accept_zip: bool,
    ) -> Result<RetrieveSummary> {
        let budget = Some(self.limits.total_timeout());
        self.contained("retrieve", budget, self.retrieve_inner(target, filter, accept_zip))
            .await
    }

    /// Deploy local tree.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Pack`] if local tree cannot be packed.
    /// - Return [`SyncError::Plan`] if planning fails.
    /// - Return [`SyncError::ShardsFailed`] if any shard fails or is rejected.
    /// - Return [`SyncError::PartiallyApplied`] if interrupted while shards
    ///   were in flight.
    /// - Return [`SyncError::TimedOut`] or [`SyncError::Cancelled`] if
    ///   interrupted before any shard was sent.
    #[instrument(skip(self, root, filter), fields(root = %root.display()), level = "debug")]
    pub async fn deploy(&self, root: &Path, filter: Option<&PlanFilter>) -> Result<DeploySummary> {
        let budget = Some(self.limits.total_timeout());
        let dispatched = Cell::new(false);
        self.contained(
            "deploy",
            budget,
            self.deploy_inner(root, filter, None, &dispatched),
        )
        .await
        .map_err(|error| match error {
            SyncError::TimedOut { .. } if dispatched.get() => SyncError::PartiallyApplied,
            error => error,
        })
    }

    /// Deploy local changes as they happen until cancelled or until the
    /// change stream ends.
    ///
    /// Each item of the change stream is a changed path, either absolute or
    /// relative to root. Failed deploys are logged and watching carries on,
    /// unless credentials were rejected.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Auth`] if credentials are rejected mid-watch.
    pub async fn watch<S>(
        &self,
        root: &Path,
        changes: S,
        filter: Option<&PlanFilter>,
    ) -> Result<WatchSummary>
    where
        S: Stream<Item = PathBuf> + Unpin,
    {
        self.contained("watch", None, self.watch_inner(root, changes, filter))
            .await
    }

    async fn retrieve_inner(
        &self,
        target: &Path,
        filter: Option<&PlanFilter>,
        accept_zip: bool,
    ) -> Result<RetrieveSummary> {
        let plan = self
            .unless_cancelled(async {
                plan::get_retrieve_plan(self.session(), filter)
                    .await
                    .map_err(|error| SyncError::from_plan("retrieve", error))
            })
            .await?;
        let shards = plan.len();

        let mut archives = Vec::new();
        let mut failed = Vec::new();
        for (name, outcome) in self.executor.execute_retrieval(&plan, accept_zip).await {
            match outcome {
                Ok(archive) => archives.push(archive),
                Err(error) => {
                    error!("shard {name} failed: {error}");
                    failed.push((name, error));
                }
            }
        }

        if self.executor.cancellation().is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let merger = Merger::new(target);
        let report =
            blocking(move || Ok(merger.write_results_to_disk(&archives, accept_zip)?)).await?;
        info!(
            "retrieved {} of {shards} shard(s): {} written, {} unchanged, {} quarantined",
            shards - failed.len(),
            report.written,
            report.unchanged,
            report.quarantined.len()
        );

        if let Some((shard, _)) = failed.iter().find(|(_, error)| error.is_unauthorized()) {
            return Err(SyncError::ShardUnauthorized {
                shard: shard.clone(),
            });
        }

        if !failed.is_empty() {
            return Err(SyncError::ShardsFailed {
                shards: failed.into_iter().map(|(name, _)| name).collect(),
            });
        }

        Ok(RetrieveSummary { shards, report })
    }

    async fn deploy_inner(
        &self,
        root: &Path,
        filter: Option<&PlanFilter>,
        only: Option<MetadataKind>,
        dispatched: &Cell<bool>,
    ) -> Result<DeploySummary> {
        let local = root.to_path_buf();
        let local_filter = filter.cloned();
        let archive = self
            .unless_cancelled(blocking(move || {
                Ok(archive::pack_with(&local, |path| {
                    only.is_none_or(|kind| catalog::classify(path) == Some(kind))
                        && local_filter.as_ref().is_none_or(|filter| filter.admits(path))
                })?)
            }))
            .await?;

        let mut plan = self
            .unless_cancelled(async {
                plan::prepare_deployment(self.session(), archive, filter)
                    .await
                    .map_err(|error| SyncError::from_plan("deploy", error))
            })
            .await?;
        if let Some(kind) = only {
            plan = plan.narrow_to(kind);
        }
        if plan.is_empty() {
            warn!("deploy plan has no shards, nothing to do");
        }

        // INVARIANT: Nothing reached the site until shards are dispatched.
        if self.executor.cancellation().is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        dispatched.set(true);

        let mut summary = DeploySummary::default();
        let mut failed = Vec::new();
        let mut interrupted = false;
        let mut unauthorized = None;
        for (name, outcome) in self.executor.execute_deploy_plan(&plan, root, filter).await {
            match outcome {
                Ok(result) => {
                    for warning in &result.warnings {
                        warn!("shard {name}: {warning}");
                    }

                    if !result.ok {
                        for message in &result.errors {
                            error!("shard {name}: {message}");
                        }
                        if result.errors.is_empty() {
                            error!("shard {name} was rejected");
                        }
                        failed.push(name.clone());
                    }

                    summary.shards.insert(name, result);
                }
                Err(error) => {
                    error!("shard {name} failed: {error}");
                    interrupted |= error.is_interrupted();
                    if error.is_unauthorized() {
                        unauthorized = Some(name.clone());
                    }
                    failed.push(name);
                }
            }
        }

        if interrupted || self.executor.cancellation().is_cancelled() {
            return Err(SyncError::PartiallyApplied);
        }

        if let Some(shard) = unauthorized {
            return Err(SyncError::ShardUnauthorized { shard });
        }

        if !failed.is_empty() {
            return Err(SyncError::ShardsFailed { shards: failed });
        }

        info!("deployed {} shard(s)", summary.shards.len());
        Ok(summary)
    }

    /// Deploy each kind on its own, one after another.
    async fn deploy_kinds(
        &self,
        root: &Path,
        kinds: BTreeSet<MetadataKind>,
        filter: Option<&PlanFilter>,
    ) -> Result<DeploySummary> {
        let mut summary = DeploySummary::default();
        for kind in kinds {
            info!("deploy changes to {kind}");
            match self
                .deploy_inner(root, filter, Some(kind), &Cell::new(false))
                .await
            {
                Ok(deployed) => summary.absorb(deployed),
                Err(SyncError::Pack(PackError::Empty { .. })) => {
                    warn!("no {kind} files left to deploy");
                }
                Err(error) => return Err(error),
            }
        }

        Ok(summary)
    }

    async fn watch_inner<S>(
        &self,
        root: &Path,
        changes: S,
        filter: Option<&PlanFilter>,
    ) -> Result<WatchSummary>
    where
        S: Stream<Item = PathBuf> + Unpin,
    {
        let cancel = self.cancellation();
        let mut changes = changes.fuse();
        let mut debouncer = Debouncer::new(self.limits.debounce());
        let mut settled = BTreeSet::new();
        let mut in_flight: Fuse<LocalBoxFuture<'_, Result<DeploySummary>>> = Fuse::terminated();
        let mut closed = false;
        let mut summary = WatchSummary::default();
        info!("watching {} for changes", root.display());

        loop {
            if in_flight.is_terminated() && !settled.is_empty() {
                let kinds = std::mem::take(&mut settled);
                in_flight = self.deploy_kinds(root, kinds, filter).boxed_local().fuse();
                summary.deploys += 1;
            }

            if closed && debouncer.is_empty() && settled.is_empty() && in_flight.is_terminated() {
                break;
            }

            let deadline = debouncer.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stop watching {}", root.display());
                    break;
                }
                change = changes.next(), if !closed => match change {
                    Some(path) => match classify_change(root, &path) {
                        Some((relative, kind)) if filter.is_none_or(|filter| filter.admits(&relative)) => {
                            debug!("change to {relative}");
                            debouncer.touch(relative, kind, Instant::now());
                        }
                        _ => debug!("ignore change to {}", path.display()),
                    },
                    None => closed = true,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    settled.extend(debouncer.drain_ready(Instant::now()));
                }
                outcome = &mut in_flight, if !in_flight.is_terminated() => match outcome {
                    Ok(deployed) => debug!("deployed {} shard(s)", deployed.shards.len()),
                    Err(error) if error.exit_code() == 1 => return Err(error),
                    Err(error) => {
                        summary.failures += 1;
                        error!("deploy failed: {error}");
                    }
                },
            }
        }

        Ok(summary)
    }

    /// Abandon work as soon as the cancellation token fires.
    async fn unless_cancelled<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.executor.cancellation().cancelled() => Err(SyncError::Cancelled),
            outcome = work => outcome,
        }
    }

    /// Run operation with panics contained, and an optional time budget.
    async fn contained<T>(
        &self,
        operation: &'static str,
        budget: Option<Duration>,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let work = AssertUnwindSafe(work).catch_unwind();
        let outcome = match budget {
            Some(budget) => match tokio::time::timeout(budget, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.executor.cancellation().cancel();
                    return Err(SyncError::TimedOut {
                        operation,
                        after: budget,
                    });
                }
            },
            None => work.await,
        };

        outcome.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!("{operation} panicked: {message}");
            Err(SyncError::Panicked(message))
        })
    }
}

/// Run blocking work off the async runtime.
///
/// A panic inside the work resumes on the calling task, so it is contained
/// like any other panic of the operation.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
        Err(_) => Err(SyncError::Cancelled),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Sync error types.
///
/// Every variant maps onto one process exit code, see
/// [`SyncError::exit_code`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Flag or setting cannot be used.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Settings file cannot be used.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Credentials were rejected, or the host could not authenticate us.
    #[error("authentication failed")]
    Auth(#[source] SessionError),

    /// Credentials were rejected while a shard was executing.
    #[error("authentication rejected by shard {shard}")]
    ShardUnauthorized { shard: String },

    /// Server could not plan the operation.
    #[error("failed to plan {operation}")]
    Plan {
        #[source]
        source: PlanError,
        operation: &'static str,
    },

    /// One or more shards failed.
    #[error("{} shard(s) failed: {}", shards.len(), shards.join(", "))]
    ShardsFailed { shards: Vec<String> },

    /// Deploy was interrupted with shards in flight.
    #[error("deploy partially applied")]
    PartiallyApplied,

    /// Variables request failed.
    #[error("variables request failed")]
    Variables(#[source] VariablesError),

    /// Local tree cannot be packed.
    #[error("failed to pack local tree")]
    Pack(#[from] PackError),

    /// Target directory cannot be written.
    #[error("failed to write retrieved metadata")]
    Merge(#[from] MergeError),

    /// Operation exceeded its wall-clock budget.
    #[error("{operation} timed out after {after:?}")]
    TimedOut {
        operation: &'static str,
        after: Duration,
    },

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation panicked.
    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl SyncError {
    /// Map error to process exit code.
    ///
    /// - `1`: authentication failure.
    /// - `2`: planning failure.
    /// - `3`: shard failure, partial deploy, interruption, or failed
    ///   variables request.
    /// - `4`: local I/O failure, or panic.
    /// - `5`: invalid arguments.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Auth(_) | Self::ShardUnauthorized { .. } => 1,
            Self::Plan { .. } => 2,
            Self::ShardsFailed { .. }
            | Self::PartiallyApplied
            | Self::Variables(_)
            | Self::TimedOut { .. }
            | Self::Cancelled => 3,
            Self::Pack(_) | Self::Merge(_) | Self::Panicked(_) => 4,
            Self::InvalidArgument(_) | Self::Config(_) => 5,
        }
    }

    fn from_auth(error: SessionError) -> Self {
        match error {
            SessionError::InvalidHost { .. } => Self::InvalidArgument(error.to_string()),
            error => Self::Auth(error),
        }
    }

    fn from_plan(operation: &'static str, error: PlanError) -> Self {
        match error {
            PlanError::Request(source) if source.is_unauthorized() => Self::Auth(source),
            source => Self::Plan { source, operation },
        }
    }
}

impl From<VariablesError> for SyncError {
    fn from(error: VariablesError) -> Self {
        match error {
            VariablesError::Request(source) if source.is_unauthorized() => Self::Auth(source),
            VariablesError::InvalidName(_) => Self::InvalidArgument(error.to_string()),
            error => Self::Variables(error),
        }
    }
}

/// Friendly result alias :3
type Result<T, E = SyncError> = std::result::Result<T, E>;
