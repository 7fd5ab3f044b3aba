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

//! Key watch 日志
//! 对指定 key 建立 watch 并记录事件；流出错后按退避策略重新建立

use async_trait::async_trait;
use cluster_core::config::BackoffConfig;
use cluster_core::coordinator::{Backoff, EtcdClient, EtcdClientListener, EtcdClientWatcher};
use cluster_core::types::WatchOptions;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Logs every (re)created etcd client.
#[derive(Debug, Default)]
pub struct ClientCreatedLogger;

#[async_trait]
impl EtcdClientListener for ClientCreatedLogger {
    async fn etcd_client_created(&self, client: &EtcdClient) {
        info!(
            "etcd client created for endpoints {:?} (tls: {})",
            client.endpoints(),
            client.is_tls_enabled()
        );
    }
}

#[derive(Debug, Default)]
pub struct KeyWatchLogger {
    created: AtomicBool,
    updates: AtomicU64,
    deletes: AtomicU64,
}

impl KeyWatchLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    fn take_created(&self) -> bool {
        self.created.swap(false, Ordering::AcqRel)
    }
}

impl EtcdClientWatcher for KeyWatchLogger {
    fn etcd_watch_created(&self, _client: &EtcdClient, key: &str) {
        self.created.store(true, Ordering::Release);
        info!("Watch created on {}", key);
    }

    fn etcd_key_updated(&self, _client: &EtcdClient, key: &str, value: &[u8]) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        info!("Key {} updated: {}", key, String::from_utf8_lossy(value));
    }

    fn etcd_key_deleted(&self, _client: &EtcdClient, key: &str) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        info!("Key {} deleted", key);
    }
}

/// Keeps a watch on `key` open until `cancel` fires.
///
/// A failed or ended watch is re-opened after the backoff delay. The delay
/// starts over once a watch has been created again.
pub async fn watch_key(
    client: EtcdClient,
    key: String,
    logger: &KeyWatchLogger,
    backoff: BackoffConfig,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(backoff);

    while !cancel.is_cancelled() {
        let result = client.watch(&cancel, &key, logger, WatchOptions::new()).await;
        if cancel.is_cancelled() {
            break;
        }
        if logger.take_created() {
            backoff.reset();
        }

        match result {
            Ok(()) => info!("Watch on {} ended, re-opening in {:?}", key, backoff.next_wait()),
            Err(e) => warn!("Watch on {} failed: {}, retry in {:?}", key, e, backoff.next_wait()),
        }

        if backoff.wait(&cancel).await.is_err() {
            break;
        }
    }

    debug!("Stopped watching {}", key);
}
