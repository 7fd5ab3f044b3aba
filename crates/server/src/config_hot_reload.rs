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

//! 配置文件热加载
//! 按修改时间轮询配置文件，解析成功后依次调用注册的回调

use cluster_core::config::ConfigFile;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type ReloadCallback = Arc<dyn Fn(ConfigFile) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub struct HotReloadConfig {
    config: Arc<RwLock<ConfigFile>>,
    config_path: PathBuf,
    reload_callbacks: Arc<RwLock<Vec<ReloadCallback>>>,
}

impl HotReloadConfig {
    pub fn new(config: ConfigFile, config_path: impl AsRef<Path>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: config_path.as_ref().to_path_buf(),
            reload_callbacks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn get_config(&self) -> ConfigFile {
        self.config.read().clone()
    }

    pub fn add_reload_callback<F>(&self, callback: F)
    where
        F: Fn(ConfigFile) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.reload_callbacks.write().push(Arc::new(callback));
    }

    /// Re-reads the file. A file that cannot be read or parsed leaves the
    /// previous configuration in place.
    pub async fn reload_from_file(&self) -> bool {
        let content = match fs::read_to_string(&self.config_path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read config file {}: {}", self.config_path.display(), e);
                return false;
            }
        };

        let new_config = match content.parse::<ConfigFile>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to parse config file {}: {}", self.config_path.display(), e);
                return false;
            }
        };

        let unchanged = *self.config.read() == new_config;
        if unchanged {
            debug!("Config file {} touched without changes", self.config_path.display());
            return false;
        }
        *self.config.write() = new_config.clone();

        let callbacks: Vec<_> = self.reload_callbacks.read().iter().cloned().collect();
        for callback in callbacks {
            callback(new_config.clone()).await;
        }

        info!("Configuration hot-reloaded from {}", self.config_path.display());
        true
    }

    async fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.config_path)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok())
    }

    /// Polls the modification time of the file until `cancel` fires.
    pub async fn watch(&self, poll_interval: Duration, cancel: CancellationToken) {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_modified = self.modified().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current_modified = self.modified().await;
            if current_modified.is_some() && current_modified != last_modified {
                last_modified = current_modified;
                self.reload_from_file().await;
            }
        }

        debug!("Stopped watching {}", self.config_path.display());
    }
}
