// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use converge::{
    backup::FileBackups,
    config::Manifest,
    context::Cancellation,
    exec::{CommandRunner, SystemRunner},
    executor::RetryExecutor,
    inspect::HostState,
    item::DesiredStateItem,
    package::PackageManager,
    path::{default_log_path, default_manifest_path, default_report_path},
    platform::{PlatformInfo, Probe},
    reconcile::{detect_platform, Reconciler},
    setting::SettingStore,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::{
    fs::{File, OpenOptions},
    future::Future,
    path::{Path, PathBuf},
    process::exit,
    sync::{Arc, Mutex},
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit code of a run killed by a second interrupt, as shells report SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "converge [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<i32> {
        match self.command {
            Command::Apply(opts) => run_apply(opts).await,
            Command::Check(opts) => run_check(opts).await,
            Command::Probe => run_probe(),
            Command::Report(opts) => run_report(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Apply every desired state item that is not already satisfied.
    #[command(override_usage = "converge apply [options]")]
    Apply(ApplyOptions),

    /// Inspect every desired state item without changing anything.
    #[command(override_usage = "converge check [options]")]
    Check(CheckOptions),

    /// Show detected platform and package manager.
    #[command(override_usage = "converge probe")]
    Probe,

    /// Show summary of the last run.
    #[command(override_usage = "converge report [options]")]
    Report(ReportOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ApplyOptions {
    /// Path to manifest of desired state items.
    #[arg(short, long, value_name = "path")]
    pub manifest: Option<PathBuf>,

    /// Only apply items with these ids, e.g., to re-run a failed item.
    #[arg(long, value_name = "id")]
    pub only: Vec<String>,

    /// Override total attempts per mutating action.
    #[arg(long, value_name = "count", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: Option<u32>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CheckOptions {
    /// Path to manifest of desired state items.
    #[arg(short, long, value_name = "path")]
    pub manifest: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ReportOptions {
    /// Path to persisted run summary.
    #[arg(short, long, value_name = "path")]
    pub path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let console = fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);
    let (log_file, log_error) = match open_log_file() {
        Ok(file) => (Some(file), None),
        Err(error) => (None, Some(error)),
    };
    let file_layer = log_file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file))
    });
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(filter)
        .init();

    if let Some(error) = log_error {
        warn!("log stream disabled: {error:?}");
    }

    match run().await {
        Ok(code) => exit(code),
        Err(error) => {
            error!("{error:?}");
            exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    Cli::parse().run().await
}

fn open_log_file() -> Result<File> {
    let path = default_log_path()?;
    if let Some(parent) = path.parent() {
        mkdirp::mkdirp(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log stream {}", path.display()))
}

/// Cancel run on first interrupt.
///
/// Return true once a second interrupt arrives, meaning the caller should
/// quit immediately instead of waiting on the in-flight item.
async fn watch_interrupts<F, Fut>(mut interrupted: F, cancel: &Cancellation) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if interrupted().await.is_err() {
        return false;
    }
    warn!("interrupted, stopping after current item (press Ctrl-C again to quit now)");
    cancel.cancel();

    interrupted().await.is_ok()
}

fn load_manifest(path: Option<PathBuf>) -> Result<(Manifest, PathBuf)> {
    let path = match path {
        Some(path) => path,
        None => default_manifest_path()?,
    };

    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let manifest = data
        .parse::<Manifest>()
        .with_context(|| format!("invalid manifest {}", path.display()))?;

    Ok((manifest, path))
}

fn manifest_items(manifest: &Manifest, path: &Path) -> Result<Vec<DesiredStateItem>> {
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let items = manifest.desired_items(base_dir)?;
    info!("loaded {} items from {}", items.len(), path.display());

    Ok(items)
}

fn host_state(platform: &PlatformInfo) -> HostState {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
    HostState::new(
        PackageManager::new(platform.package_manager, runner.clone()),
        SettingStore::new(runner),
    )
}

async fn run_apply(opts: ApplyOptions) -> Result<i32> {
    let (mut manifest, manifest_path) = load_manifest(opts.manifest)?;
    if let Some(max_attempts) = opts.max_attempts {
        manifest.settings.max_attempts = max_attempts;
    }

    let mut items = manifest_items(&manifest, &manifest_path)?;
    if !opts.only.is_empty() {
        for id in &opts.only {
            if !items.iter().any(|item| &item.id == id) {
                bail!("no item with id {id:?} in {}", manifest_path.display());
            }
        }
        items.retain(|item| opts.only.contains(&item.id));
    }

    let ctx = manifest.execution_context();
    let platform = detect_platform(&Probe::system().with_search_path(ctx.search_path()))?;
    let report_path = match manifest.report_path() {
        Some(path) => path.to_path_buf(),
        None => default_report_path()?,
    };

    let cancel = Cancellation::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if watch_interrupts(tokio::signal::ctrl_c, &cancel).await {
                error!("interrupted again, quitting without a run summary");
                exit(INTERRUPTED_EXIT_CODE);
            }
        }
    });

    let bar = ProgressBar::new(items.len() as u64);
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}] {pos}/{len}",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);

    let reconciler = Reconciler::new(
        host_state(&platform),
        FileBackups::new(),
        RetryExecutor::new(manifest.retry_policy()),
        ctx,
    )
    .with_cancellation(cancel)
    .with_progress(bar.clone());

    let report = reconciler.reconcile(&items, &platform).await;
    bar.finish_and_clear();

    let summary = report.finalize();
    println!("{summary}");
    if let Err(error) = summary.persist(&report_path) {
        error!("{:?}", anyhow::Error::from(error));
        return Ok(1);
    }

    Ok(summary.exit_code())
}

async fn run_check(opts: CheckOptions) -> Result<i32> {
    let (manifest, manifest_path) = load_manifest(opts.manifest)?;
    let items = manifest_items(&manifest, &manifest_path)?;
    let ctx = manifest.execution_context();
    let platform = detect_platform(&Probe::system().with_search_path(ctx.search_path()))?;

    let reconciler = Reconciler::new(
        host_state(&platform),
        FileBackups::new(),
        RetryExecutor::new(manifest.retry_policy()),
        ctx,
    );

    let mut pending = 0;
    for (item, result) in reconciler.check(&items, &platform).await {
        match result {
            None => println!("{:<12} {}", "[skipped]", item.id),
            Some(result) if result.satisfied => {
                println!("{:<12} {} ({})", "[ok]", item.id, result.current_value)
            }
            Some(result) => {
                pending += 1;
                println!(
                    "{:<12} {} (current: {}, desired: {})",
                    "[pending]",
                    item.id,
                    result.current_value,
                    item.desired_value()
                );
            }
        }
    }
    info!("{pending} items need to be applied");

    Ok(if pending == 0 { 0 } else { 1 })
}

fn run_probe() -> Result<i32> {
    let probe = Probe::system();
    let platform = detect_platform(&probe)?;
    let binary = platform.package_manager.binary();
    let availability = if platform.has_package_manager() {
        "available"
    } else {
        "missing"
    };

    println!("platform:        {platform}");
    println!("package manager: {} ({binary} {availability})", platform.package_manager);

    Ok(0)
}

fn run_report(opts: ReportOptions) -> Result<i32> {
    let path = match opts.path {
        Some(path) => path,
        None => default_report_path()?,
    };
    let summary = std::fs::read_to_string(&path)
        .with_context(|| format!("no run summary at {}", path.display()))?;
    print!("{summary}");

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::VecDeque, io::Error};

    fn signals(
        results: Vec<std::io::Result<()>>,
    ) -> impl FnMut() -> futures::future::Ready<std::io::Result<()>> {
        let mut results = VecDeque::from(results);
        move || {
            futures::future::ready(
                results
                    .pop_front()
                    .unwrap_or_else(|| Err(Error::other("no more signals"))),
            )
        }
    }

    #[tokio::test]
    async fn first_interrupt_cancels_second_quits() {
        let cancel = Cancellation::new();
        let quit = watch_interrupts(signals(vec![Ok(()), Ok(())]), &cancel).await;
        assert!(cancel.is_cancelled());
        assert!(quit);
    }

    #[tokio::test]
    async fn single_interrupt_only_cancels() {
        let cancel = Cancellation::new();
        let quit = watch_interrupts(signals(vec![Ok(())]), &cancel).await;
        assert!(cancel.is_cancelled());
        assert!(!quit);
    }

    #[tokio::test]
    async fn broken_signal_handler_changes_nothing() {
        let cancel = Cancellation::new();
        let quit = watch_interrupts(
            signals(vec![Err(Error::other("no handler"))]),
            &cancel,
        )
        .await;
        assert!(!cancel.is_cancelled());
        assert!(!quit);
    }
}
