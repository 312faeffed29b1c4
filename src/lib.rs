// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Skuid NLX site metadata synchronization.
//!
//! A Skuid NLX __site__ is described by declarative metadata, e.g., pages,
//! data sources, profiles, themes, and variables. This library moves that
//! metadata between a local directory tree and a remote site over HTTPS.
//!
//! # Synchronization Engine
//!
//! Every transfer is planned by the server first. The client sends a
//! manifest (retrieve) or a packed archive of the local tree (deploy), and the
//! server answers with a plan of __shards__, each nominating an endpoint and a
//! scope of metadata kinds. Shards are then executed in parallel.
//!
//! Retrieved shards come back as zip archives, sometimes several written
//! back-to-back into one body. Entries are written into the local tree under
//! the directory of their metadata kind. Profiles are deep-merged into
//! whatever already sits on disk, rather than overwritten, so that repeated
//! retrieves converge instead of clobbering local customizations.
//!
//! # See Also
//!
//! - [`sync::SyncEngine`]
//! - [`catalog::MetadataKind`]

pub mod archive;
pub mod catalog;
pub mod config;
pub mod execute;
pub mod merge;
pub mod plan;
pub mod session;
pub mod sync;
pub mod variables;

pub use catalog::MetadataKind;
pub use config::{Limits, SyncSettings};
pub use plan::{PlanFilter, PlanPayload, PlanShard};
pub use session::{AuthToken, HostUrl, Session};
pub use sync::{Credentials, SyncEngine, SyncError};
