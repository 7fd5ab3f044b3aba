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

use super::backoff::Backoff;
use super::discovery::{discover_endpoints, SrvResolver};
use super::{
    ClientSettings, CoordinationClient, CoordinationClientFactory, EtcdClientListener,
    EtcdClientWatcher,
};
use crate::config::{BackoffConfig, ConfigFile, EndpointSource, EtcdSettings};
use crate::credentials::ReloadableCredentials;
use crate::types::{CoreError, GetOptions, GetResponse, Result, WatchEvent, WatchOptions};
use arc_swap::ArcSwapOption;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// EtcdClient 配置
#[derive(Debug, Clone)]
pub struct EtcdClientOptions {
    /// Legacy section consulted when an option is missing from `[etcd]`.
    pub compat_section: Option<String>,
    pub dial_timeout: Duration,
    pub sync_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for EtcdClientOptions {
    fn default() -> Self {
        Self {
            compat_section: None,
            dial_timeout: Duration::from_secs(1),
            sync_timeout: Duration::from_secs(1),
            backoff: BackoffConfig::default(),
        }
    }
}

impl EtcdClientOptions {
    pub fn with_compat_section(mut self, section: impl Into<String>) -> Self {
        self.compat_section = Some(section.into());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// The live client together with what it was built from.
struct ClientHandle {
    client: Arc<dyn CoordinationClient>,
    endpoints: Vec<String>,
    credentials: Option<Arc<ReloadableCredentials>>,
}

struct ListenerEntry {
    notify: mpsc::UnboundedSender<()>,
}

struct Inner {
    options: EtcdClientOptions,
    factory: Arc<dyn CoordinationClientFactory>,
    resolver: Arc<dyn SrvResolver>,
    current: ArcSwapOption<ClientHandle>,
    listeners: Mutex<HashMap<usize, ListenerEntry>>,
    load_lock: tokio::sync::Mutex<()>,
}

/// etcd 协调客户端
///
/// A cheap-to-clone handle. The underlying connection lives in an atomic slot
/// and is replaced whenever [`EtcdClient::load`] adopts a new configuration;
/// readers always use whatever connection is current when they look.
#[derive(Clone)]
pub struct EtcdClient {
    inner: Arc<Inner>,
}

impl EtcdClient {
    /// An empty client; nothing is connected until [`EtcdClient::load`].
    pub fn create(
        options: EtcdClientOptions,
        factory: Arc<dyn CoordinationClientFactory>,
        resolver: Arc<dyn SrvResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                factory,
                resolver,
                current: ArcSwapOption::empty(),
                listeners: Mutex::new(HashMap::new()),
                load_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Creates the client and loads `config`, failing on any configuration error.
    pub async fn new(
        config: &ConfigFile,
        options: EtcdClientOptions,
        factory: Arc<dyn CoordinationClientFactory>,
        resolver: Arc<dyn SrvResolver>,
    ) -> Result<Self> {
        let client = Self::create(options, factory, resolver);
        client.load(config, false).await?;
        Ok(client)
    }

    /// [`EtcdClient::new`] backed by etcd and the system DNS resolver.
    #[cfg(feature = "etcd")]
    pub async fn from_config(config: &ConfigFile, compat_section: Option<&str>) -> Result<Self> {
        let mut options = EtcdClientOptions::default();
        options.compat_section = compat_section.map(String::from);
        Self::new(
            config,
            options,
            Arc::new(super::EtcdConnector::new()),
            Arc::new(super::HickorySrvResolver::new()),
        )
        .await
    }

    fn current(&self) -> Option<Arc<ClientHandle>> {
        self.inner.current.load_full()
    }

    pub fn is_configured(&self) -> bool {
        self.inner.current.load().is_some()
    }

    /// Endpoints of the current client, empty when none is configured.
    pub fn endpoints(&self) -> Vec<String> {
        self.inner
            .current
            .load()
            .as_ref()
            .map(|handle| handle.endpoints.clone())
            .unwrap_or_default()
    }

    pub fn is_tls_enabled(&self) -> bool {
        self.inner
            .current
            .load()
            .as_ref()
            .is_some_and(|handle| handle.credentials.is_some())
    }

    /// TLS credentials of the current client.
    pub fn credentials(&self) -> Option<Arc<ReloadableCredentials>> {
        self.inner
            .current
            .load()
            .as_ref()
            .and_then(|handle| handle.credentials.clone())
    }

    /// Applies `config`, replacing the current client on success.
    ///
    /// With `ignore_errors` every failure is logged and the current client
    /// stays in place; otherwise the first failure is returned. A
    /// configuration without endpoints never touches the current client.
    pub async fn load(&self, config: &ConfigFile, ignore_errors: bool) -> Result<()> {
        let _guard = self.inner.load_lock.lock().await;
        let compat_section = self.inner.options.compat_section.as_deref();
        let settings = EtcdSettings::from_config(config, compat_section);

        let endpoints = match &settings.endpoints {
            EndpointSource::Static(endpoints) => endpoints.clone(),
            EndpointSource::Discovery { domain, service } => {
                let resolver = self.inner.resolver.as_ref();
                match discover_endpoints(resolver, domain, service.as_deref()).await {
                    Ok(endpoints) => endpoints,
                    Err(e) if ignore_errors => {
                        warn!("Could not discover etcd endpoints for {}: {}", domain, e);
                        Vec::new()
                    }
                    Err(e) => return Err(e),
                }
            }
            EndpointSource::Disabled => Vec::new(),
        };

        if endpoints.is_empty() {
            if ignore_errors {
                info!("No etcd endpoints configured, not changing client");
            }
            return Ok(());
        }

        let credentials = match settings.tls_files() {
            Some((key, cert, ca)) => match ReloadableCredentials::from_files(cert, key, ca).await {
                Ok(credentials) => Some(Arc::new(credentials)),
                Err(e) if ignore_errors => {
                    warn!("Could not setup etcd TLS configuration, will be disabled ({})", e);
                    None
                }
                Err(e) => return Err(CoreError::Tls(e.to_string())),
            },
            None => None,
        };

        let client_settings = ClientSettings {
            endpoints: endpoints.clone(),
            dial_timeout: self.inner.options.dial_timeout,
            tls: credentials.as_ref().map(|c| c.snapshot()),
        };
        let client = match self.inner.factory.connect(&client_settings).await {
            Ok(client) => client,
            Err(e) if ignore_errors => {
                error!("Could not create new etcd client from endpoints {:?}: {}", endpoints, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let previous = self.install(ClientHandle {
            client,
            endpoints: endpoints.clone(),
            credentials,
        });
        info!("Using etcd endpoints {:?}", endpoints);

        if let Some(previous) = previous {
            if let Err(e) = previous.client.close().await {
                warn!("Error closing previous etcd client {:?}: {}", previous.endpoints, e);
            }
        }
        Ok(())
    }

    /// Publishes `handle` and queues one notification per registered listener.
    ///
    /// Both happen under the listener lock, so a listener registered
    /// concurrently is told about the new client exactly once: either by
    /// this fan-out or by [`EtcdClient::add_listener`].
    fn install(&self, handle: ClientHandle) -> Option<Arc<ClientHandle>> {
        let listeners = self.inner.listeners.lock();
        let previous = self.inner.current.swap(Some(Arc::new(handle)));
        for entry in listeners.values() {
            let _ = entry.notify.send(());
        }
        previous
    }

    /// Closes the current client and leaves the client unconfigured.
    pub async fn close(&self) -> Result<()> {
        match self.inner.current.swap(None) {
            Some(handle) => handle.client.close().await,
            None => Ok(()),
        }
    }

    /// Registers `listener`. If a client already exists the listener is told
    /// about it right away, without blocking the caller.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn add_listener(&self, listener: Arc<dyn EtcdClientListener>) {
        let id = listener_id(&listener);
        let mut listeners = self.inner.listeners.lock();
        let entry = listeners
            .entry(id)
            .or_insert_with(|| spawn_delivery(Arc::downgrade(&self.inner), listener));

        if self.is_configured() {
            let _ = entry.notify.send(());
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn EtcdClientListener>) {
        // Dropping the sender ends the delivery task once its queue is drained.
        self.inner.listeners.lock().remove(&listener_id(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Blocks until the current client has synced with the cluster.
    ///
    /// Failed attempts are retried forever with capped exponential backoff;
    /// only `cancel` ends the wait early.
    pub async fn wait_for_connection(&self, cancel: &CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new(self.inner.options.backoff.clone());

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let attempt = match self.current() {
                Some(handle) => {
                    let sync_timeout = self.inner.options.sync_timeout;
                    let sync = tokio::time::timeout(sync_timeout, handle.client.sync());
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                        result = sync => result.map_err(CoreError::from).and_then(|r| r),
                    }
                }
                None => Err(CoreError::NotConfigured),
            };

            match attempt {
                Ok(members) => {
                    info!("Client synced, using endpoints {:?}", members);
                    return Ok(());
                }
                Err(e) if e.is_timeout() => {
                    warn!(
                        "Timeout waiting for etcd client to connect to the cluster, retry in {:?}",
                        backoff.next_wait()
                    );
                }
                Err(e) => {
                    error!(
                        "Could not sync etcd client with the cluster, retry in {:?}: {}",
                        backoff.next_wait(),
                        e
                    );
                }
            }

            backoff.wait(cancel).await?;
        }
    }

    /// Point-in-time read through the current client.
    pub async fn get(&self, key: &str, options: GetOptions) -> Result<GetResponse> {
        let handle = self.current().ok_or(CoreError::NotConfigured)?;
        handle.client.get(key, options).await
    }

    /// Relays the events of a leader-required watch on `key` to `watcher`.
    ///
    /// Returns `Ok(())` when the stream ends or `cancel` fires, and the stream
    /// error otherwise. The watch is not re-established here.
    pub async fn watch(
        &self,
        cancel: &CancellationToken,
        key: &str,
        watcher: &dyn EtcdClientWatcher,
        options: WatchOptions,
    ) -> Result<()> {
        let handle = self.current().ok_or(CoreError::NotConfigured)?;

        info!("Started watch on {}", key);
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            stream = handle.client.watch(key, options) => stream?,
        };
        info!("Watch created for {}", key);
        watcher.etcd_watch_created(self, key);

        loop {
            let response = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                response = stream.next() => response,
            };

            let events = match response {
                Some(Ok(events)) => events,
                Some(Err(e)) => return Err(e),
                None => {
                    debug!("Watch on {} ended", key);
                    return Ok(());
                }
            };

            for event in events {
                match event {
                    WatchEvent::Put { key, value } => {
                        watcher.etcd_key_updated(self, &String::from_utf8_lossy(&key), &value)
                    }
                    WatchEvent::Delete { key } => {
                        watcher.etcd_key_deleted(self, &String::from_utf8_lossy(&key))
                    }
                    WatchEvent::Unsupported { description } => {
                        warn!("Unsupported watch event on {}: {}", key, description)
                    }
                }
            }
        }
    }
}

fn listener_id(listener: &Arc<dyn EtcdClientListener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

/// Each listener gets its own queue and task: notifications reach one listener
/// in order, and a slow listener does not hold up the others.
fn spawn_delivery(inner: Weak<Inner>, listener: Arc<dyn EtcdClientListener>) -> ListenerEntry {
    let (notify, mut queue) = mpsc::unbounded_channel::<()>();

    tokio::spawn(async move {
        while queue.recv().await.is_some() {
            let Some(owner) = inner.upgrade() else {
                break;
            };
            listener.etcd_client_created(&EtcdClient { inner: owner }).await;
        }
    });

    ListenerEntry { notify }
}
