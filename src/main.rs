//! portrelay binary entry point.
//!
//! Runs the forwarding engine with in-memory collaborators. Rules and
//! engine settings come from a TOML file passed as the first argument:
//!
//! ```toml
//! [engine.udp]
//! mode = "point_to_point"
//!
//! [[rules]]
//! id = 1
//! name = "mysql"
//! source_port = 9000
//! target_ip = "10.0.0.5"
//! target_port = 3306
//! protocol = "tcp"
//! ```

use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use portrelay::access::MemoryAccessPolicy;
use portrelay::config::RelayConfig;
use portrelay::engine::ForwardingEngine;
use portrelay::rule::ForwardRule;
use portrelay::sink::{AtomicMetrics, MemoryConnectionSink, MemoryListenerStatus};

/// On-disk layout of the relay configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RelayFile {
    engine: RelayConfig,
    rules: Vec<ForwardRule>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("portrelay v{}", env!("CARGO_PKG_VERSION"));

    let file = match std::env::args().nth(1) {
        Some(path) => {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str::<RelayFile>(&content)?
        }
        None => {
            warn!("no config file given, starting with no rules");
            RelayFile::default()
        }
    };

    // Runtime sized from the configured accept/IO/UDP worker counts.
    let workers = file.engine.tcp.accept_threads
        + file.engine.tcp.worker_threads
        + file.engine.udp.worker_threads;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(run(file))
}

async fn run(file: RelayFile) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Arc::new(ForwardingEngine::new(
        file.engine,
        Arc::new(MemoryAccessPolicy::new()),
        Arc::new(MemoryConnectionSink::new()),
        Arc::new(AtomicMetrics::new()),
        Arc::new(MemoryListenerStatus::new()),
    ));
    engine.start();

    let mut activated = 0usize;
    for rule in &file.rules {
        if !rule.enabled {
            info!(rule = %rule.name, "skipping disabled rule");
            continue;
        }
        if engine.activate(rule).await {
            activated += 1;
        } else {
            error!(rule = %rule.name, "failed to activate rule");
        }
    }
    info!(activated, total = file.rules.len(), "rules activated");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    engine.shutdown().await;
    Ok(())
}
