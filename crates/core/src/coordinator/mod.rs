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

//! etcd 协调客户端
//! 端点解析（静态列表或 DNS SRV 发现）、原子替换的客户端句柄、断线重试与 watch 事件分发

pub mod backoff;
pub mod client;
pub mod discovery;
#[cfg(feature = "etcd")]
pub mod etcd_backend;

pub use backoff::Backoff;
pub use client::{EtcdClient, EtcdClientOptions};
pub use discovery::{discover_endpoints, HickorySrvResolver, SrvRecord, SrvResolver};
#[cfg(feature = "etcd")]
pub use etcd_backend::EtcdConnector;

use crate::credentials::CredentialSnapshot;
use crate::types::{GetOptions, GetResponse, Result, WatchEvent, WatchOptions};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

/// Notified every time the etcd client is (re)created.
#[async_trait]
pub trait EtcdClientListener: Send + Sync {
    async fn etcd_client_created(&self, client: &EtcdClient);
}

/// Receives the events of one [`EtcdClient::watch`] call.
pub trait EtcdClientWatcher: Send + Sync {
    fn etcd_watch_created(&self, client: &EtcdClient, key: &str);
    fn etcd_key_updated(&self, client: &EtcdClient, key: &str, value: &[u8]);
    fn etcd_key_deleted(&self, client: &EtcdClient, key: &str);
}

/// Each item carries the events of one watch response, in store order.
pub type WatchEventStream = BoxStream<'static, Result<Vec<WatchEvent>>>;

/// 底层协调存储客户端
///
/// Implemented by the etcd backend, and by fakes in tests.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn get(&self, key: &str, options: GetOptions) -> Result<GetResponse>;

    /// Opens a leader-required watch on `key`.
    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchEventStream>;

    /// Round trip to the cluster; returns the client URLs of its members.
    async fn sync(&self) -> Result<Vec<String>>;

    async fn close(&self) -> Result<()>;
}

/// Parameters for one coordination client connection.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
    pub tls: Option<Arc<CredentialSnapshot>>,
}

#[async_trait]
pub trait CoordinationClientFactory: Send + Sync {
    async fn connect(&self, settings: &ClientSettings) -> Result<Arc<dyn CoordinationClient>>;
}
