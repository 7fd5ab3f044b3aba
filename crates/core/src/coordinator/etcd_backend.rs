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

//! etcd 后端实现

use super::{ClientSettings, CoordinationClient, CoordinationClientFactory, WatchEventStream};
use crate::credentials::CredentialSnapshot;
use crate::types::{CoreError, GetOptions, GetResponse, KeyValue, Result, WatchEvent, WatchOptions};
use async_trait::async_trait;
use etcd_client::{Certificate, Client, ConnectOptions, EventType, Identity, TlsOptions};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Connects [`EtcdBackend`]s with `etcd-client`.
#[derive(Debug, Clone, Default)]
pub struct EtcdConnector;

impl EtcdConnector {
    pub fn new() -> Self {
        Self
    }
}

fn tls_options(snapshot: &CredentialSnapshot) -> TlsOptions {
    let mut tls = TlsOptions::new();
    if let Some(pool) = snapshot.cert_pool() {
        tls = tls.ca_certificate(Certificate::from_pem(pool.pem()));
    }
    if let Some(certificate) = snapshot.certificate() {
        tls = tls.identity(Identity::from_pem(certificate.cert_pem(), certificate.key_pem()));
    }
    tls
}

#[async_trait]
impl CoordinationClientFactory for EtcdConnector {
    async fn connect(&self, settings: &ClientSettings) -> Result<Arc<dyn CoordinationClient>> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(settings.dial_timeout)
            .with_require_leader(true);
        if let Some(snapshot) = &settings.tls {
            options = options.with_tls(tls_options(snapshot));
        }

        let client = Client::connect(settings.endpoints.clone(), Some(options)).await?;
        debug!("Connected etcd client to {:?}", settings.endpoints);

        Ok(Arc::new(EtcdBackend {
            client: RwLock::new(Some(client)),
        }))
    }
}

/// One `etcd-client` connection. Closing drops the connection; later calls
/// fail with [`CoreError::NotConfigured`].
pub struct EtcdBackend {
    client: RwLock<Option<Client>>,
}

impl EtcdBackend {
    fn client(&self) -> Result<Client> {
        self.client.read().clone().ok_or(CoreError::NotConfigured)
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: kv.key().to_vec(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        version: kv.version(),
        lease: kv.lease(),
    }
}

fn convert_event(event: &etcd_client::Event) -> WatchEvent {
    match (event.event_type(), event.kv()) {
        (EventType::Put, Some(kv)) => WatchEvent::Put {
            key: kv.key().to_vec(),
            value: kv.value().to_vec(),
        },
        (EventType::Delete, Some(kv)) => WatchEvent::Delete {
            key: kv.key().to_vec(),
        },
        (event_type, _) => WatchEvent::Unsupported {
            description: format!("{:?} without key", event_type),
        },
    }
}

#[async_trait]
impl CoordinationClient for EtcdBackend {
    async fn get(&self, key: &str, options: GetOptions) -> Result<GetResponse> {
        let mut request = etcd_client::GetOptions::new();
        if options.prefix {
            request = request.with_prefix();
        }
        if options.limit > 0 {
            request = request.with_limit(options.limit);
        }
        if options.revision > 0 {
            request = request.with_revision(options.revision);
        }
        if options.keys_only {
            request = request.with_keys_only();
        }

        let response = self.client()?.get(key, Some(request)).await?;
        Ok(GetResponse {
            kvs: response.kvs().iter().map(convert_kv).collect(),
            revision: response.header().map(|h| h.revision()).unwrap_or_default(),
            count: response.count(),
        })
    }

    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchEventStream> {
        let mut request = etcd_client::WatchOptions::new();
        if options.prefix {
            request = request.with_prefix();
        }
        if options.start_revision > 0 {
            request = request.with_start_revision(options.start_revision);
        }
        if options.prev_kv {
            request = request.with_prev_key();
        }

        let (watcher, mut stream) = self.client()?.watch(key, Some(request)).await?;
        let events = async_stream::stream! {
            // The watch is cancelled when the watcher is dropped with the stream.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(response)) => {
                        if response.canceled() {
                            yield Err(CoreError::Watch(format!(
                                "watch canceled by server: {}",
                                response.cancel_reason()
                            )));
                            break;
                        }
                        yield Ok(response.events().iter().map(convert_event).collect());
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(CoreError::from(e));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(events))
    }

    async fn sync(&self) -> Result<Vec<String>> {
        let response = self.client()?.member_list(None).await?;
        Ok(response
            .members()
            .iter()
            .flat_map(|member| member.client_urls().iter().cloned())
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.client.write().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_backend_is_not_configured() {
        let backend = EtcdBackend {
            client: RwLock::new(None),
        };
        assert!(matches!(backend.sync().await, Err(CoreError::NotConfigured)));
        assert!(backend.close().await.is_ok());
    }
}
