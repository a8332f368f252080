/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;
use std::time::Duration;

use ::log::{info, warn};
use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub mod config;
use config::{Config, ListenAddr};

mod build;

pub mod opts;

pub mod log;

mod frontend;
use frontend::Listener;

mod monitor;
use monitor::Monitor;

mod provider;
use provider::QuotaChecker;

mod worker;
use worker::Manager;

const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let monitor = Arc::new(Monitor::new());

    let ip_provider = provider::new_provider_by_name(&config.provider, &monitor)
        .context("failed to build ip provider")?;
    info!("using ip provider {}", ip_provider.name());

    if config.quota.instance_id.is_empty() {
        info!("quota probing disabled");
    } else {
        info!(
            "quota probing enabled, instance {}",
            config.quota.instance_id
        );
        let checker =
            QuotaChecker::new(&config.quota).context("failed to build quota checker")?;
        monitor.set_quota_checker(checker);
    }

    let manager = Arc::new(
        Manager::new(ip_provider, monitor.clone(), &config)
            .context("failed to build worker manager")?,
    );
    let workers = manager.spawn_workers();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_listener = Listener::bind(&config.listen_addr)
        .await
        .context("failed to create api listener")?;
    info!("api server listening on {}", config.listen_addr);
    let api_server = tokio::spawn(frontend::run_api_server(
        api_listener,
        manager.clone(),
        shutdown_rx.clone(),
    ));

    let monitor_listener = TcpListener::bind(config.monitor_addr)
        .await
        .context(format!(
            "failed to bind monitor listener to {}",
            config.monitor_addr
        ))?;
    info!("monitor server listening on {}", config.monitor_addr);
    let monitor_server = tokio::spawn(monitor::run_monitor_server(
        monitor_listener,
        monitor.clone(),
        manager.clone(),
        shutdown_rx,
    ));

    wait_for_quit_signal().await;
    info!("shutting down");

    // stop accepting first, with a cap on the http teardown
    let _ = shutdown_tx.send(true);
    let teardown = tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, async {
        let _ = api_server.await;
        let _ = monitor_server.await;
    })
    .await;
    if teardown.is_err() {
        warn!("timed out waiting for http servers to stop");
    }

    // no more producers: let the workers drain the queue, then flush the
    // cache store
    manager.stop(workers).await;

    if let ListenAddr::Unix(path) = &config.listen_addr {
        let _ = std::fs::remove_file(path);
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_quit_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
