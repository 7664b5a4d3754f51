// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use logship::bounded_channel::bounded;
use logship::config::Config;
use logship::indexer::{Indexer, IndexerConfig};
use logship::tailer;
use logship::transform::Pipeline;

const MAILBOX_SIZE: usize = 1_024;

#[derive(Debug, Parser)]
#[command(name = "logship", about = "Tail files into an Elasticsearch cluster")]
struct Args {
    /// Configuration file
    #[arg(
        long,
        env = "LOGSHIP_CONFIG",
        default_value = "/etc/file-to-elasticsearch.yaml"
    )]
    config: PathBuf,

    /// Seconds between stats report lines
    #[arg(long, env = "LOGSHIP_STATS_INTERVAL", default_value = "60")]
    stats_interval: u64,

    /// Enable debug logging
    #[arg(long, env = "LOGSHIP_DEBUG", default_value = "false")]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("logship=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            error!(%err, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), tower::BoxError> {
    let config = Config::load(&args.config)?;
    info!(
        config = ?args.config,
        servers = ?config.elasticsearch.servers,
        files = config.tail.len(),
        "starting"
    );

    let cancel = CancellationToken::new();

    // Startup failures (no tailable files, bad pipeline regex, unusable
    // batch directory) are fatal; everything after this point is contained.
    let events = tailer::start(&config.tail, &cancel)?;
    let pipeline = Pipeline::new(&config.tail)?;
    let indexer = Indexer::new(
        IndexerConfig::new(&config.elasticsearch, args.stats_interval),
        None,
    )?;

    let (mailbox_tx, mailbox_rx) = bounded(MAILBOX_SIZE);
    let mut tasks = JoinSet::new();
    tasks.spawn(pipeline.run(events, mailbox_tx));
    tasks.spawn(indexer.run(mailbox_rx, cancel.clone()));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        select! {
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                cancel.cancel();
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                cancel.cancel();
            }
            joined = tasks.join_next() => {
                match joined {
                    Some(Err(err)) => error!(%err, "task panicked"),
                    Some(Ok(())) => {}
                    None => break,
                }
            }
        }
    }

    info!("shutdown complete");
    Ok(())
}
