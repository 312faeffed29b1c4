// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use skuid_sync::{
    config::{parse_flag_bool, SyncSettings, TargetDir},
    plan::PlanFilter,
    sync::{poll_changes, Credentials, SyncEngine, SyncError},
    variables,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::Password;
use std::{
    fs,
    path::{Path, PathBuf},
    process::exit,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  skuid [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<(), SyncError> {
        let settings = load_settings(self.global.config.as_deref())?;
        match self.command {
            Command::Retrieve(opts) => run_retrieve(&self.global, settings, opts).await,
            Command::Deploy(opts) => run_deploy(&self.global, settings, opts).await,
            Command::Watch(opts) => run_watch(&self.global, settings, opts).await,
            Command::Variables(command) => run_variables(&self.global, settings, command).await,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Retrieve site metadata into local directory.
    #[command(override_usage = "skuid retrieve [options]")]
    Retrieve(RetrieveOptions),

    /// Deploy local directory to site.
    #[command(override_usage = "skuid deploy [options]")]
    Deploy(DeployOptions),

    /// Deploy local changes to site as they happen.
    #[command(override_usage = "skuid watch [options]")]
    Watch(WatchOptions),

    /// Manage server-side variables of site.
    #[command(subcommand)]
    Variables(VariablesCommand),
}

#[derive(Debug, Clone, Args)]
struct GlobalOptions {
    /// Site host, with or without https:// scheme.
    #[arg(long, global = true, env = "SKUID_HOST", value_name = "host")]
    pub host: Option<String>,

    /// Name of user to authenticate as.
    #[arg(short, long, global = true, env = "SKUID_USERNAME", value_name = "name")]
    pub username: Option<String>,

    /// Password of user, prompted for when absent.
    #[arg(
        short,
        long,
        global = true,
        env = "SKUID_PASSWORD",
        hide_env_values = true,
        value_name = "password"
    )]
    pub password: Option<String>,

    /// Local site directory, defaults to current directory.
    #[arg(short, long, global = true, env = "SKUID_DIR", value_name = "path")]
    pub dir: Option<String>,

    /// Settings file to read defaults from.
    #[arg(long, global = true, env = "SKUID_CONFIG", value_name = "file")]
    pub config: Option<PathBuf>,

    /// Log debug output.
    #[arg(
        short,
        long,
        global = true,
        env = "SKUID_VERBOSE",
        value_parser = parse_flag_bool,
        num_args = 0..=1,
        default_missing_value = "true",
        value_name = "bool"
    )]
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, Args)]
struct FilterOptions {
    /// Only include metadata of this app.
    #[arg(long, env = "SKUID_APP", value_name = "name")]
    pub app: Option<String>,

    /// Only include pages matching this name or glob, repeatable.
    #[arg(long = "page", env = "SKUID_PAGE", value_delimiter = ',', value_name = "name")]
    pub pages: Vec<String>,
}

impl FilterOptions {
    fn to_filter(&self) -> Option<PlanFilter> {
        PlanFilter::from_flags(self.app.clone(), self.pages.iter().cloned())
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RetrieveOptions {
    #[command(flatten)]
    pub filter: FilterOptions,

    /// Retrieve JSON payloads instead of zip archives.
    #[arg(
        long,
        env = "SKUID_NO_ZIP",
        value_parser = parse_flag_bool,
        num_args = 0..=1,
        default_missing_value = "true",
        value_name = "bool"
    )]
    pub no_zip: Option<bool>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DeployOptions {
    #[command(flatten)]
    pub filter: FilterOptions,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct WatchOptions {
    #[command(flatten)]
    pub filter: FilterOptions,

    /// Milliseconds between two scans of the local directory.
    #[arg(long, env = "SKUID_POLL_INTERVAL_MS", default_value_t = 500, value_name = "ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Subcommand)]
enum VariablesCommand {
    /// List variables, or show a single one.
    #[command(override_usage = "skuid variables get [options] [<name>]")]
    Get {
        /// Name of variable to show.
        #[arg(value_name = "name")]
        name: Option<String>,
    },

    /// Create or replace variable.
    #[command(override_usage = "skuid variables set [options] <name> <value>")]
    Set {
        /// Name of variable to set.
        #[arg(required = true, value_name = "name")]
        name: String,

        /// Value of variable.
        #[arg(required = true, value_name = "value")]
        value: String,

        /// Never hand value back when listing.
        #[arg(
            long,
            env = "SKUID_CONFIDENTIAL",
            value_parser = parse_flag_bool,
            num_args = 0..=1,
            default_missing_value = "true",
            value_name = "bool"
        )]
        confidential: Option<bool>,
    },

    /// Remove variable.
    #[command(override_usage = "skuid variables rm [options] <name>")]
    Rm {
        /// Name of variable to remove.
        #[arg(required = true, value_name = "name")]
        name: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = if error.use_stderr() { 5 } else { 0 };
            let _ = error.print();
            exit(code);
        }
    };

    let level = if cli.global.verbose.unwrap_or(false) {
        "debug"
    } else {
        "info"
    };
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!("{info}\n{backtrace}");
    }));

    if let Err(error) = cli.run().await {
        let code = error.exit_code();
        error!("{:#}", anyhow::Error::new(error));
        exit(code);
    }

    exit(0)
}

async fn run_retrieve(
    global: &GlobalOptions,
    settings: SyncSettings,
    opts: RetrieveOptions,
) -> Result<(), SyncError> {
    let accept_zip = !opts.no_zip.unwrap_or(settings.no_zip);
    let dir = resolve_dir(global, &settings)?;
    let filter = opts.filter.to_filter();
    let bar = progress_bar("retrieve");
    let engine = connect(global, &settings).await?.with_progress(bar.clone());
    cancel_on_interrupt(engine.cancellation());

    let result = engine
        .retrieve(dir.as_path(), filter.as_ref(), accept_zip)
        .await;
    bar.finish_and_clear();
    let summary = result?;

    for reason in &summary.report.quarantined {
        warn!("quarantined {reason}");
    }
    info!(
        "retrieved {} shard(s) into {dir}: {} file(s) written, {} quarantined",
        summary.shards,
        summary.report.written + summary.report.unchanged,
        summary.report.quarantined.len()
    );

    Ok(())
}

async fn run_deploy(
    global: &GlobalOptions,
    settings: SyncSettings,
    opts: DeployOptions,
) -> Result<(), SyncError> {
    let dir = resolve_dir(global, &settings)?;
    let filter = opts.filter.to_filter();
    let bar = progress_bar("deploy");
    let engine = connect(global, &settings).await?.with_progress(bar.clone());
    cancel_on_interrupt(engine.cancellation());

    let result = engine.deploy(dir.as_path(), filter.as_ref()).await;
    bar.finish_and_clear();
    let summary = result?;

    let skipped = summary.shards.values().filter(|shard| shard.skipped).count();
    let warnings = summary
        .shards
        .values()
        .map(|shard| shard.warnings.len())
        .sum::<usize>();
    info!(
        "deployed {dir} through {} shard(s), {skipped} skipped, {warnings} warning(s)",
        summary.shards.len()
    );

    Ok(())
}

async fn run_watch(
    global: &GlobalOptions,
    settings: SyncSettings,
    opts: WatchOptions,
) -> Result<(), SyncError> {
    let dir = resolve_dir(global, &settings)?;
    let filter = opts.filter.to_filter();
    let engine = connect(global, &settings).await?;
    cancel_on_interrupt(engine.cancellation());

    let changes = poll_changes(dir.as_path(), Duration::from_millis(opts.poll_interval_ms));
    let summary = engine.watch(dir.as_path(), changes, filter.as_ref()).await?;
    info!(
        "stopped watching {dir} after {} deploy(s), {} failed",
        summary.deploys, summary.failures
    );

    Ok(())
}

async fn run_variables(
    global: &GlobalOptions,
    settings: SyncSettings,
    command: VariablesCommand,
) -> Result<(), SyncError> {
    let engine = connect(global, &settings).await?;
    let session = engine.session();

    match command {
        VariablesCommand::Get { name: Some(name) } => {
            let variable = variables::get_variable(session, &name).await?;
            println!("{}", render_variable(&variable));
        }
        VariablesCommand::Get { name: None } => {
            for variable in variables::list_variables(session).await? {
                println!("{}", render_variable(&variable));
            }
        }
        VariablesCommand::Set {
            name,
            value,
            confidential,
        } => {
            let confidential = confidential.unwrap_or(false);
            variables::set_variable(session, &name, &value, confidential).await?
        }
        VariablesCommand::Rm { name } => variables::remove_variable(session, &name).await?,
    }

    Ok(())
}

fn render_variable(variable: &variables::Variable) -> String {
    match (&variable.value, variable.confidential) {
        (_, true) => format!("{}\t<confidential>", variable.name),
        (Some(value), false) => format!("{}\t{value}", variable.name),
        (None, false) => variable.name.clone(),
    }
}

async fn connect(global: &GlobalOptions, settings: &SyncSettings) -> Result<SyncEngine, SyncError> {
    let host = global
        .host
        .clone()
        .or_else(|| settings.host.clone())
        .ok_or_else(|| SyncError::InvalidArgument("missing --host".into()))?;
    let username = global
        .username
        .clone()
        .or_else(|| settings.username.clone())
        .ok_or_else(|| SyncError::InvalidArgument("missing --username".into()))?;
    let password = match global.password.clone() {
        Some(password) => password,
        None => prompt_password(&username)
            .map_err(|error| SyncError::InvalidArgument(format!("{error:#}")))?,
    };

    let credentials = Credentials {
        host,
        username,
        password,
    };
    SyncEngine::connect(&credentials, settings.limits).await
}

fn prompt_password(username: &str) -> anyhow::Result<String> {
    Password::new(&format!("password for {username}"))
        .without_confirmation()
        .prompt()
        .context("missing --password")
}

fn resolve_dir(global: &GlobalOptions, settings: &SyncSettings) -> Result<TargetDir, SyncError> {
    match (&global.dir, &settings.dir) {
        (Some(raw), _) => Ok(TargetDir::expand(raw)?),
        (None, Some(dir)) => Ok(dir.clone()),
        (None, None) => Ok(TargetDir::new(".")),
    }
}

fn load_settings(path: Option<&Path>) -> Result<SyncSettings, SyncError> {
    let Some(path) = path else {
        return Ok(SyncSettings::default());
    };

    let data = fs::read_to_string(path).map_err(|error| {
        SyncError::InvalidArgument(format!("cannot read {}: {error}", path.display()))
    })?;
    Ok(data.parse::<SyncSettings>()?)
}

fn progress_bar(message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    match progress_style() {
        Ok(style) => bar.set_style(style),
        Err(error) => warn!("{error:#}"),
    }
    bar.set_message(message);
    bar
}

fn progress_style() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<10}  [{wide_bar:.yellow/blue}] {pos}/{len} shard(s)",
    )
    .context("invalid progress template")?
    .progress_chars("-Cco."))
}

fn cancel_on_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            cancel.cancel();
        }
    });
}
