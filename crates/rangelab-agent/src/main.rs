// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rangelab Agent - Laboratory Orchestration Server
//!
//! A QUIC server responsible for:
//! - Lab lifecycle (create, start, stop, delete, restore on boot)
//! - Per-lab DNS servers and zone updates
//! - Challenge instance deployment with fixed addresses
//! - Status snapshots for the monitoring stream

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rangelab_agent::config::Config;
use rangelab_agent::ipam::IpamManager;
use rangelab_agent::kubernetes::Kubernetes;
use rangelab_agent::server::RpcState;
use rangelab_agent::usecase::UseCase;
use rangelab_agent::worker::Worker;
use rangelab_agent::{migrations, server, service, usecase};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rangelab_agent=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        addr = %config.rpc.addr,
        labs_cidr = %config.labs_cidr,
        max_workers = config.worker.max_workers,
        "Starting Rangelab Agent"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect_with(config.postgres.connect_options()?)
        .await?;

    info!("Connected to database");

    // Apply schema migrations before serving traffic
    migrations::run(&pool).await?;

    info!("Database schema verified");

    // Orchestrator adapter and the parent IP pool
    let kubernetes = Arc::new(
        Kubernetes::new(config.kube_config_path.as_deref(), config.labs_cidr).await?,
    );
    let ipam = IpamManager::new(pool.clone(), config.labs_cidr).await?;

    // Wire the services
    let service = Arc::new(service::Service::new(service::Dependencies {
        pool: pool.clone(),
        ipam,
        infrastructure: kubernetes,
    }));

    if config.self_check {
        info!("Running self check");
        service.self_check().await?;
        info!("Self check passed");
    }

    // Worker pool and use-case layer
    let worker = Arc::new(Worker::new(
        config.worker.max_workers,
        config.worker.throttle,
    ));
    let usecase = Arc::new(UseCase::new(usecase::Dependencies {
        service,
        worker: worker.clone(),
    }));

    // Restore orchestrator state from the catalog before serving
    info!("Restoring labs from state");
    usecase.restore_labs_from_state().await?;
    info!("Labs restored");

    // Serve RPC until interrupted
    let shutdown = CancellationToken::new();
    let state = Arc::new(RpcState::new(usecase, &config.rpc));
    let server_handle = tokio::spawn({
        let rpc = config.rpc.clone();
        let shutdown = shutdown.clone();
        async move { server::run(&rpc, state, shutdown).await }
    });

    info!(addr = %config.rpc.addr, "Agent ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown: stop accepting RPCs, then drain the pool
    shutdown.cancel();
    if let Err(e) = server_handle.await? {
        warn!("RPC server exited with error: {}", e);
    }
    worker.shutdown().await;
    pool.close().await;

    info!("Rangelab Agent shut down");

    Ok(())
}
