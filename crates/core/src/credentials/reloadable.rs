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

//! 可热加载的 TLS 凭证
//! 将证书加载器与 CA 证书池组合为一个传输层可直接使用的凭证对象

use super::cert_pool_loader::{CertPoolLoader, CertPoolMaterial};
use super::certificate_loader::{CertificateLoader, CertificateMaterial};
use super::slot::Versioned;
use super::{CredentialError, CredentialResult};
use crate::config::{GrpcTlsSettings, TlsRole};
use arc_swap::ArcSwap;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ALPN_H2: &[u8] = b"h2";

/// One self-consistent view of the credential material.
///
/// The certificate, the pool and both rustls configurations were produced by
/// the same refresh, so a handshake driven by a snapshot never combines two
/// generations.
#[derive(Debug)]
pub struct CredentialSnapshot {
    certificate: Option<Arc<Versioned<CertificateMaterial>>>,
    cert_pool: Option<Arc<Versioned<CertPoolMaterial>>>,
    server_config: Option<Arc<ServerConfig>>,
    client_config: Option<Arc<ClientConfig>>,
}

impl CredentialSnapshot {
    fn build(
        certificate: Option<Arc<Versioned<CertificateMaterial>>>,
        cert_pool: Option<Arc<Versioned<CertPoolMaterial>>>,
    ) -> CredentialResult<Self> {
        let (server_config, client_config) = build_configs(
            certificate.as_deref().map(|c| &**c),
            cert_pool.as_deref().map(|p| &**p),
        )?;

        Ok(Self {
            certificate,
            cert_pool,
            server_config,
            client_config,
        })
    }

    fn insecure() -> Self {
        Self {
            certificate: None,
            cert_pool: None,
            server_config: None,
            client_config: None,
        }
    }

    pub fn certificate(&self) -> Option<&Arc<Versioned<CertificateMaterial>>> {
        self.certificate.as_ref()
    }

    pub fn cert_pool(&self) -> Option<&Arc<Versioned<CertPoolMaterial>>> {
        self.cert_pool.as_ref()
    }

    pub fn certificate_generation(&self) -> Option<u64> {
        self.certificate.as_ref().map(|c| c.generation())
    }

    pub fn cert_pool_generation(&self) -> Option<u64> {
        self.cert_pool.as_ref().map(|p| p.generation())
    }

    /// `None` when no certificate is configured.
    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.server_config.clone()
    }

    /// `None` for insecure credentials.
    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.client_config.clone()
    }

    pub fn is_secure(&self) -> bool {
        self.certificate.is_some() || self.cert_pool.is_some()
    }
}

fn invalid(e: impl ToString) -> CredentialError {
    CredentialError::Invalid(e.to_string())
}

fn build_configs(
    certificate: Option<&CertificateMaterial>,
    cert_pool: Option<&CertPoolMaterial>,
) -> CredentialResult<(Option<Arc<ServerConfig>>, Option<Arc<ClientConfig>>)> {
    if certificate.is_none() && cert_pool.is_none() {
        return Ok((None, None));
    }

    // 服务端: 配置了 CA 时要求并校验客户端证书
    let server_config = match certificate {
        Some(cert) => {
            let builder = match cert_pool {
                Some(pool) => {
                    let verifier = WebPkiClientVerifier::builder(pool.roots())
                        .build()
                        .map_err(invalid)?;
                    ServerConfig::builder().with_client_cert_verifier(verifier)
                }
                None => ServerConfig::builder().with_no_client_auth(),
            };
            let mut config = builder
                .with_single_cert(cert.chain().to_vec(), cert.private_key())
                .map_err(invalid)?;
            config.alpn_protocols = vec![ALPN_H2.to_vec()];
            Some(Arc::new(config))
        }
        None => None,
    };

    // 客户端: 未配置 CA 时使用内置的 Web PKI 根证书
    let roots = match cert_pool {
        Some(pool) => pool.roots(),
        None => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(roots)
        }
    };
    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut client_config = match certificate {
        Some(cert) => builder
            .with_client_auth_cert(cert.chain().to_vec(), cert.private_key())
            .map_err(invalid)?,
        None => builder.with_no_client_auth(),
    };
    client_config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok((server_config, Some(Arc::new(client_config))))
}

/// TLS credentials whose certificate and CA pool follow their files on disk.
///
/// Either half is optional: without a certificate loader there is no local
/// identity, without a pool peers are verified against the default roots.
pub struct ReloadableCredentials {
    loader: Option<Arc<CertificateLoader>>,
    pool: Option<Arc<CertPoolLoader>>,
    snapshot: ArcSwap<CredentialSnapshot>,
    refresh_lock: Mutex<()>,
}

impl ReloadableCredentials {
    pub fn new(
        loader: Option<CertificateLoader>,
        pool: Option<CertPoolLoader>,
    ) -> CredentialResult<Self> {
        let loader = loader.map(Arc::new);
        let pool = pool.map(Arc::new);

        let snapshot = CredentialSnapshot::build(
            loader.as_ref().map(|l| l.current()),
            pool.as_ref().map(|p| p.current()),
        )?;

        Ok(Self {
            loader,
            pool,
            snapshot: ArcSwap::from_pointee(snapshot),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Credentials that do not use TLS at all.
    pub fn insecure() -> Self {
        Self {
            loader: None,
            pool: None,
            snapshot: ArcSwap::from_pointee(CredentialSnapshot::insecure()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Mutual TLS from a certificate, its key and a CA bundle.
    pub async fn from_files(
        cert_path: &str,
        key_path: &str,
        ca_path: &str,
    ) -> CredentialResult<Self> {
        let loader = CertificateLoader::new(cert_path, key_path).await?;
        let pool = CertPoolLoader::new(ca_path).await?;
        Self::new(Some(loader), Some(pool))
    }

    pub async fn from_settings(settings: &GrpcTlsSettings) -> CredentialResult<Self> {
        let loader = match (&settings.certificate, &settings.key) {
            (Some(cert), Some(key)) => Some(CertificateLoader::new(cert, key).await?),
            (None, None) => None,
            _ => {
                return Err(CredentialError::Invalid(
                    "certificate and key must be configured together".to_string(),
                ))
            }
        };
        let pool = match &settings.ca {
            Some(ca) => Some(CertPoolLoader::new(ca).await?),
            None => None,
        };

        match (&loader, &pool, settings.role) {
            (None, None, _) => {
                warn!("No TLS certificate or CA configured, using insecure credentials");
                return Ok(Self::insecure());
            }
            (None, Some(_), TlsRole::Server) => {
                return Err(CredentialError::CertificateNotConfigured);
            }
            (Some(_), None, TlsRole::Server) => {
                warn!("No client CA configured, client certificates will not be verified");
            }
            (_, None, TlsRole::Client) => {
                info!("No server CA configured, using system trust roots");
            }
            _ => {}
        }

        Self::new(loader, pool)
    }

    pub fn is_secure(&self) -> bool {
        self.snapshot.load().is_secure()
    }

    /// The current snapshot. Hold on to it for the duration of one handshake.
    pub fn snapshot(&self) -> Arc<CredentialSnapshot> {
        self.snapshot.load_full()
    }

    pub fn certificate(&self) -> Option<Arc<Versioned<CertificateMaterial>>> {
        self.snapshot.load().certificate().cloned()
    }

    pub fn cert_pool(&self) -> Option<Arc<Versioned<CertPoolMaterial>>> {
        self.snapshot.load().cert_pool().cloned()
    }

    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.snapshot.load().server_config()
    }

    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.snapshot.load().client_config()
    }

    /// `(certificate, key)` paths of the owned certificate loader.
    ///
    /// The loaders themselves stay private: reloading goes through
    /// [`ReloadableCredentials::refresh`] so the snapshot follows every install.
    pub fn certificate_paths(&self) -> Option<(&Path, &Path)> {
        self.loader
            .as_ref()
            .map(|loader| (loader.cert_path(), loader.key_path()))
    }

    pub fn cert_pool_path(&self) -> Option<&Path> {
        self.pool.as_ref().map(|pool| pool.path())
    }

    /// Checks both files and publishes one new snapshot if either changed.
    ///
    /// Returns whether a new snapshot was published. A malformed half is
    /// skipped while a valid change of the other half is still applied.
    pub async fn refresh(&self) -> CredentialResult<bool> {
        let _guard = self.refresh_lock.lock().await;
        let mut first_error = None;

        let staged_cert = match &self.loader {
            Some(loader) => loader.stage().await.unwrap_or_else(|e| {
                first_error.get_or_insert(e);
                None
            }),
            None => None,
        };
        let staged_pool = match &self.pool {
            Some(pool) => pool.stage().await.unwrap_or_else(|e| {
                first_error.get_or_insert(e);
                None
            }),
            None => None,
        };

        if staged_cert.is_none() && staged_pool.is_none() {
            return match first_error {
                Some(e) => Err(e),
                None => Ok(false),
            };
        }

        let current_cert = self.loader.as_ref().map(|l| l.current());
        let current_pool = self.pool.as_ref().map(|p| p.current());
        let cert_ref = staged_cert
            .as_ref()
            .or_else(|| current_cert.as_deref().map(|c| &**c));
        let pool_ref = staged_pool
            .as_ref()
            .or_else(|| current_pool.as_deref().map(|p| &**p));

        // Nothing is installed until the combination is known to work.
        let (server_config, client_config) = build_configs(cert_ref, pool_ref).map_err(|e| {
            warn!("Could not apply reloaded TLS material: {}", e);
            e
        })?;

        let mut announce_cert = None;
        let certificate = match (staged_cert, &self.loader) {
            (Some(material), Some(loader)) => {
                let installed = loader.install(material);
                announce_cert = Some(installed.generation());
                Some(installed)
            }
            _ => current_cert,
        };
        let mut announce_pool = None;
        let cert_pool = match (staged_pool, &self.pool) {
            (Some(material), Some(pool)) => {
                let installed = pool.install(material);
                announce_pool = Some(installed.generation());
                Some(installed)
            }
            _ => current_pool,
        };

        self.snapshot.store(Arc::new(CredentialSnapshot {
            certificate,
            cert_pool,
            server_config,
            client_config,
        }));

        // Waiters are released only once the snapshot is visible.
        if let (Some(generation), Some(loader)) = (announce_cert, &self.loader) {
            loader.announce(generation);
        }
        if let (Some(generation), Some(pool)) = (announce_pool, &self.pool) {
            pool.announce(generation);
        }

        Ok(true)
    }

    /// Runs the polling loop until `cancel` fires.
    pub fn spawn_reloader(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let credentials = self.clone();
        tokio::spawn(async move {
            if credentials.loader.is_none() && credentials.pool.is_none() {
                return;
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = credentials.refresh().await {
                            debug!("TLS credential reload check failed: {}", e);
                        }
                    }
                }
            }
            debug!("TLS credential reloader stopped");
        })
    }

    /// Blocks until the certificate is reloaded or `cancel` fires.
    pub async fn wait_for_certificate_reload(
        &self,
        cancel: &CancellationToken,
    ) -> CredentialResult<u64> {
        match &self.loader {
            Some(loader) => loader.wait_for_reload(cancel).await,
            None => Err(CredentialError::CertificateNotConfigured),
        }
    }

    pub async fn wait_for_cert_pool_reload(
        &self,
        cancel: &CancellationToken,
    ) -> CredentialResult<u64> {
        match &self.pool {
            Some(pool) => pool.wait_for_reload(cancel).await,
            None => Err(CredentialError::CertPoolNotConfigured),
        }
    }
}
