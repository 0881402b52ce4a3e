use crate::backoff::BackoffPolicy;
use crate::builder::{annotation_modifier, ClusterApplier, ResourceMapper};
use crate::cancel::CancelToken;
use crate::client::{ClusterConfig, DynamicClient, HttpDynamicClient, InMemoryCluster};
use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::logging::{JournalStatusSink, StatusJournal};
use crate::payload::{load_payload_dir, Payload};
use crate::status::{EngineStatus, QueueStatusSink, StatusSink};
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Annotation stamped on every applied object with the payload version.
pub const VERSION_ANNOTATION: &str = "release-sync.io/payload-version";

const DEFAULT_SOURCE_ID: &str = "local";

/// Binary entrypoint: load config and payload, build the client, run one sync.
pub fn run() -> Result<()> {
    let args = Args::parse(env::args().skip(1))?;
    if args.help {
        print_usage();
        return Ok(());
    }
    let config = match &args.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("unable to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    init_tracing(&config)?;

    let payload_dir = args
        .payload
        .clone()
        .ok_or_else(|| anyhow!("--payload is required"))?;
    let payload = load_payload(&args, &payload_dir)?;
    info!(
        dir = %payload_dir.display(),
        manifests = payload.len(),
        version = %payload.version(),
        "payload loaded"
    );

    let client = build_client(&args, &config)?;
    let applier = ClusterApplier::new(client, ResourceMapper::with_defaults())
        .with_modifier(annotation_modifier(VERSION_ANNOTATION, payload.version()));

    let queue = QueueStatusSink::new(config.status_queue_capacity);
    let journal = match &args.journal {
        Some(_) => {
            let mut status_journal = StatusJournal::new(config.journal_limits());
            status_journal.set_level(config.log_level()?);
            Some(Arc::new(JournalStatusSink::new(status_journal)))
        }
        None => None,
    };
    let sink = fan_out(queue.clone(), journal.clone());

    let backoff = if args.dry_run {
        BackoffPolicy::immediate(config.backoff.max_attempts)
    } else {
        config.backoff_policy()
    };
    let engine = SyncEngine::new(applier)
        .with_backoff(backoff)
        .with_requeue_policy(config.requeue_policy())
        .with_status_sink(sink);
    let outcome = engine.apply_payload(&payload, &CancelToken::new());

    if let (Some(path), Some(journal)) = (&args.journal, &journal) {
        journal
            .write_to(path)
            .with_context(|| format!("unable to write journal {}", path.display()))?;
    }
    let status = queue.latest();
    match outcome {
        Ok(summary) => {
            println!(
                "source={} version={} applied={}/{} attempts={} recovered={} status=OK",
                payload.source_id(),
                payload.version(),
                summary.applied,
                payload.len(),
                summary.attempts,
                summary.recovered
            );
            Ok(())
        }
        Err(err) => {
            if let Some(status) = status {
                println!(
                    "source={} version={} applied={}/{} attempts={} status={:?}",
                    status.source_id,
                    status.version,
                    status.succeeded,
                    status.total,
                    status.attempted,
                    status.phase
                );
            }
            Err(err).context("payload sync failed")
        }
    }
}

fn init_tracing(config: &SyncConfig) -> Result<()> {
    let level = config.log_level()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("unable to install tracing subscriber: {err}"))
}

fn load_payload(args: &Args, dir: &Path) -> Result<Payload> {
    let source = args
        .source
        .clone()
        .unwrap_or_else(|| DEFAULT_SOURCE_ID.to_string());
    let loaded = load_payload_dir(dir, source.clone(), args.version.clone().unwrap_or_default())
        .with_context(|| format!("unable to load payload {}", dir.display()))?;
    if args.version.is_some() {
        return Ok(loaded);
    }
    // Unversioned payloads are identified by a digest prefix.
    let version = loaded.digest()[..12].to_string();
    Ok(Payload::new(source, version, loaded.manifests().to_vec()))
}

fn build_client(args: &Args, config: &SyncConfig) -> Result<Arc<dyn DynamicClient>> {
    if args.dry_run {
        info!("dry run against an in-memory cluster");
        return Ok(Arc::new(InMemoryCluster::with_builtin_kinds()));
    }
    let mut settings = config.cluster.clone();
    if let Some(server) = &args.server {
        settings.server = Some(server.clone());
    }
    let cluster = match settings.cluster_config()? {
        Some(cluster) => cluster,
        None => ClusterConfig::in_cluster()
            .context("no cluster configured and in-cluster credentials unavailable")?,
    };
    info!(server = %cluster.server, "connecting to cluster");
    Ok(Arc::new(HttpDynamicClient::new(&cluster)?))
}

fn fan_out(queue: QueueStatusSink, journal: Option<Arc<JournalStatusSink>>) -> Arc<dyn StatusSink> {
    Arc::new(move |status: &EngineStatus| {
        queue.report(status);
        if let Some(journal) = &journal {
            journal.report(status);
        }
    })
}

#[derive(Debug, Default)]
struct Args {
    payload: Option<PathBuf>,
    config: Option<PathBuf>,
    server: Option<String>,
    journal: Option<PathBuf>,
    source: Option<String>,
    version: Option<String>,
    dry_run: bool,
    help: bool,
}

impl Args {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut parsed = Args::default();
        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--payload" => {
                    let path = iter
                        .next()
                        .ok_or_else(|| anyhow!("--payload requires a directory"))?;
                    parsed.payload = Some(PathBuf::from(path));
                }
                "--config" => {
                    let path = iter
                        .next()
                        .ok_or_else(|| anyhow!("--config requires a path"))?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "--server" => {
                    let server = iter
                        .next()
                        .ok_or_else(|| anyhow!("--server requires a url"))?;
                    parsed.server = Some(server);
                }
                "--journal" => {
                    let path = iter
                        .next()
                        .ok_or_else(|| anyhow!("--journal requires a path"))?;
                    parsed.journal = Some(PathBuf::from(path));
                }
                "--source" => {
                    let source = iter
                        .next()
                        .ok_or_else(|| anyhow!("--source requires an id"))?;
                    parsed.source = Some(source);
                }
                "--version" => {
                    let version = iter
                        .next()
                        .ok_or_else(|| anyhow!("--version requires a value"))?;
                    parsed.version = Some(version);
                }
                "--dry-run" => parsed.dry_run = true,
                "--help" | "-h" => parsed.help = true,
                other => bail!("unknown argument: {other}"),
            }
        }
        Ok(parsed)
    }
}

fn print_usage() {
    println!(
        "usage: release-sync --payload <dir> [--config <file>] [--server <url>] [--dry-run]\n\
         \x20                   [--journal <file>] [--source <id>] [--version <version>]"
    );
}
