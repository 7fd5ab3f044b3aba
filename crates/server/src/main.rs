// Copyright © 2026 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! 集群节点
//!
//! Connects to etcd, follows the configuration file, and keeps the `[grpc]`
//! server credentials current for the inter-node transport. Certificate
//! reloads are logged; the transport itself is not part of this binary.

use anyhow::Context;
use clap::Parser;
use cluster_core::config::{BackoffConfig, ConfigFile, GrpcTlsSettings, TlsRole};
use cluster_core::coordinator::EtcdClient;
use cluster_core::credentials::ReloadableCredentials;
use cluster_core::types::CoreError;
use cluster_node::config_hot_reload::HotReloadConfig;
use cluster_node::credential_log::log_certificate_reloads;
use cluster_node::key_watch::{watch_key, ClientCreatedLogger, KeyWatchLogger};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cluster-node", version, about = "Cluster coordination node")]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, default_value = "server.conf.toml")]
    config: String,

    /// Legacy section consulted for etcd options missing from [etcd]
    #[arg(long)]
    compat_section: Option<String>,

    /// Key to watch and log; may be repeated
    #[arg(long = "watch")]
    watch: Vec<String>,

    /// Poll interval of the configuration file, in milliseconds
    #[arg(long, default_value_t = 1000)]
    config_poll_ms: u64,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let args = Args::parse();
    info!("Starting cluster node");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ConfigFile::load_from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config))?;
    info!("Configuration loaded from {}", args.config);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            cancel.cancel();
        });
    }

    let etcd = EtcdClient::from_config(&config, args.compat_section.as_deref())
        .await
        .context("failed to create etcd client")?;
    etcd.add_listener(Arc::new(ClientCreatedLogger));

    let grpc = GrpcTlsSettings::from_config(&config, TlsRole::Server)?;
    let credentials = Arc::new(ReloadableCredentials::from_settings(&grpc).await?);
    let mut tasks = Vec::new();
    if credentials.is_secure() {
        tasks.push(credentials.spawn_reloader(grpc.reload_interval, cancel.clone()));
        let credentials = credentials.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            log_certificate_reloads(credentials, cancel).await;
        }));
    }

    match etcd.wait_for_connection(&cancel).await {
        Ok(()) => {}
        Err(CoreError::Cancelled) => {
            etcd.close().await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    for key in args.watch {
        let etcd = etcd.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let logger = KeyWatchLogger::new();
            watch_key(etcd, key, &logger, BackoffConfig::default(), cancel).await;
        }));
    }

    let hot_config = HotReloadConfig::new(config, &args.config);
    {
        let etcd = etcd.clone();
        hot_config.add_reload_callback(move |config| {
            let etcd = etcd.clone();
            async move {
                if let Err(e) = etcd.load(&config, true).await {
                    warn!("Could not apply reloaded etcd configuration: {}", e);
                }
            }
            .boxed()
        });
    }
    {
        let cancel = cancel.clone();
        let poll = Duration::from_millis(args.config_poll_ms.max(1));
        tasks.push(tokio::spawn(async move { hot_config.watch(poll, cancel).await }));
    }

    cancel.cancelled().await;
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task failed: {}", e);
        }
    }

    etcd.close().await?;
    info!("Cluster node stopped");
    Ok(())
}
