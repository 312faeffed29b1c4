// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the optional settings file that the command line
//! client can be pointed at, along with the operational limits every sync
//! operation runs under. File I/O and discovery are left to the caller.
//!
//! # Precedence
//!
//! Settings are layered from lowest to highest priority: built-in defaults,
//! settings file, `SKUID_*` environment variables, then command line flags.
//! Only the first two layers are handled here.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Settings file layout.
///
/// Every field is optional. Password is deliberately absent, it must come
/// from the environment, the command line, or an interactive prompt.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Site host, with or without scheme.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Name of user to authenticate as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Local site tree to retrieve into or deploy from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<TargetDir>,

    /// Request JSON payloads instead of zip archives when retrieving.
    pub no_zip: bool,

    /// Operational limits.
    pub limits: Limits,
}

impl FromStr for SyncSettings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: SyncSettings =
            toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on target directory field.
        if let Some(dir) = settings.dir.take() {
            settings.dir = Some(TargetDir::expand(dir.to_string())?);
        }

        Ok(settings)
    }
}

impl Display for SyncSettings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Local directory holding a site tree.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct TargetDir(PathBuf);

impl TargetDir {
    /// Construct new target directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Construct new target directory after shell expansion.
    ///
    /// Expands `~` and environment variables like `$HOME`.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ShellExpansion`] if a referenced variable is
    ///   not set.
    pub fn expand(raw: impl AsRef<str>) -> Result<Self> {
        Ok(Self::new(shellexpand::full(raw.as_ref())?.into_owned()))
    }

    /// Treat target directory as [`Path`] slice.
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }
}

impl Display for TargetDir {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_path().to_string_lossy().as_ref())
    }
}

/// Operational limits of sync operations.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum number of plan shards executed at once.
    pub concurrency: usize,

    /// Time budget of a single HTTP request in seconds.
    pub request_timeout_secs: u64,

    /// Time budget of a single plan shard in seconds, retries included.
    pub shard_timeout_secs: u64,

    /// Time budget of a whole retrieve or deploy in seconds.
    pub total_timeout_secs: u64,

    /// Quiet period in milliseconds before a changed path gets deployed.
    pub debounce_ms: u64,
}

impl Limits {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shard_timeout(&self) -> Duration {
        Duration::from_secs(self.shard_timeout_secs)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Number of shards run in parallel, never less than one.
    pub fn workers(&self) -> usize {
        self.concurrency.max(1)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            concurrency: 4,
            request_timeout_secs: 120,
            shard_timeout_secs: 5 * 60,
            total_timeout_secs: 30 * 60,
            debounce_ms: 250,
        }
    }
}

/// Parse boolean flag value.
///
/// Accepts exactly `1`, `true`, `TRUE`, `T`, `0`, `false`, `FALSE`, and `F`.
///
/// # Errors
///
/// - Return [`ConfigError::InvalidBool`] for anything else.
pub fn parse_flag_bool(raw: &str) -> Result<bool> {
    match raw {
        "1" | "true" | "TRUE" | "T" => Ok(true),
        "0" | "false" | "FALSE" | "F" => Ok(false),
        other => Err(ConfigError::InvalidBool(other.to_owned())),
    }
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Boolean value is not one of the accepted spellings.
    #[error("invalid boolean {0:?}, expected one of 1, true, TRUE, T, 0, false, FALSE, F")]
    InvalidBool(String),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
