//! CLI entrypoint: parses `config::Cli` and dispatches to one of the
//! three pipeline stages, writing its result through the Report Sink.

use std::io::IsTerminal;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use registry_janitor::audit::Auditor;
use registry_janitor::config::{Cli, Command};
use registry_janitor::evict::Evictor;
use registry_janitor::inventory::InventoryCollector;
use registry_janitor::keeprules::Ruleset;
use registry_janitor::model::ImageUsage;
use registry_janitor::registry::RegistryClient;
use registry_janitor::report;

/// Compact output for a terminal, structured JSON lines otherwise —
/// a redirected/piped run is almost always feeding a log collector.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "registry_janitor=info,kube=info".into());

    if std::io::stdout().is_terminal() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, cancelling in-flight requests");
            cancel_on_signal.cancel();
        }
    });

    match run(cli, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "run failed");
            ExitCode::FAILURE
        },
    }
}

/// `CoreError` distinguishes the fatal/non-fatal taxonomy the three
/// pipeline stages actually branch on; at this boundary a run either
/// completes or it doesn't, so everything collapses into one
/// `anyhow::Result` the way the teacher's own `main` does.
async fn run(cli: Cli, cancel: &CancellationToken) -> Result<()> {
    match cli.command {
        Command::Inventory { ref context, age } => {
            info!("collecting cluster inventory");
            let collector = InventoryCollector::new(context.clone(), Some(age));
            let usage = collector.collect(cancel).await?;

            let dir = report::resolve_output_dir();
            report::write_image_usage(&usage, &dir).context("writing images.json")?;
            info!(entries = usage.len(), dir = %dir.display(), "wrote images.json");
            Ok(())
        },
        Command::Audit { by_registry } => {
            info!(host = %cli.host, "auditing registry against cluster usage");
            let registry = RegistryClient::connect(&cli.host, cli.timeout()).await?;
            let usage = load_usage(&cli.images)?;

            let auditor = Auditor::new(&registry, &cli.host, &usage, cancel);
            let report_data = if by_registry {
                auditor.audit_by_registry(cli.repository_scope()).await?
            } else {
                auditor.audit_by_usage().await?
            };

            let dir = report::resolve_output_dir();
            report::write_health_report(&report_data, &dir).context("writing registry-check report")?;
            info!(findings = report_data.len(), dir = %dir.display(), "wrote registry-check report");
            Ok(())
        },
        Command::Evict { delete } => {
            info!(host = %cli.host, dry_run = !delete, "evicting stale tags");
            let registry = RegistryClient::connect(&cli.host, cli.timeout()).await?;
            let usage = load_usage(&cli.images)?;
            let rules = Ruleset::load_from_file(&cli.keep_rules)?;

            let evictor = Evictor::new(&registry, &cli.host, &rules, &usage, !delete, cancel);
            let log = evictor.evict_all(cli.repository_scope()).await?;

            let dir = report::resolve_output_dir();
            report::write_eviction_log(&log, &dir).context("writing eviction log")?;
            info!(entries = log.len(), dir = %dir.display(), "wrote eviction log");
            Ok(())
        },
        Command::List => {
            info!(host = %cli.host, "counting repositories and tags");
            let registry = RegistryClient::connect(&cli.host, cli.timeout()).await?;
            let repos = match cli.repository_scope() {
                Some(repos) => repos,
                None => registry.list_repositories(cancel).await?,
            };

            let mut tag_count = 0usize;
            for repo in &repos {
                tag_count += registry.list_tags(repo, cancel).await?.len();
            }
            info!(repositories = repos.len(), tags = tag_count, "registry count complete");
            println!("Number of repositories: {}, tags: {tag_count}", repos.len());
            Ok(())
        },
        Command::Rm { images } => {
            info!(host = %cli.host, count = images.len(), "deleting specific references");
            let registry = RegistryClient::connect(&cli.host, cli.timeout()).await?;

            for image in &images {
                let parsed = registry_janitor::model::parse_reference(image);
                let lookup_reference = parsed.digest.clone().or(parsed.tag.clone()).with_context(|| {
                    format!("{image}: no tag or digest to resolve")
                })?;

                let manifest = registry.get_manifest(&parsed.repo, &lookup_reference, cancel).await?;
                if !manifest.is_present() {
                    error!(%image, "no manifest found, skipping");
                    continue;
                }

                info!(repo = %parsed.repo, digest = %manifest.digest, "deleting manifest");
                registry.delete_manifest(&parsed.repo, &manifest.digest, cancel).await?;
            }
            Ok(())
        },
    }
}

/// Load a previously written `images.json` snapshot. Required by
/// `audit` and `evict`, both of which cross-reference registry state
/// against cluster usage rather than collecting it themselves.
fn load_usage(path: &std::path::Path) -> Result<ImageUsage> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let usage = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(usage)
}
