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

use super::fingerprint::FileFingerprint;
use super::pem::parse_certificates;
use super::slot::{MaterialSlot, Versioned};
use super::{CredentialError, CredentialResult};
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 受信任的 CA 证书池
pub struct CertPoolMaterial {
    roots: Arc<RootCertStore>,
    certificates: Vec<CertificateDer<'static>>,
    pem: Vec<u8>,
}

impl CertPoolMaterial {
    fn parse(path: &Path, pem: Vec<u8>) -> CredentialResult<Self> {
        let certificates = parse_certificates(path, &pem)?;

        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(certificates.iter().cloned());
        if added == 0 {
            return Err(CredentialError::Parse {
                path: path.display().to_string(),
                reason: "no usable CA certificate found".to_string(),
            });
        }
        if ignored > 0 {
            warn!(
                "Ignored {} unusable certificate(s) in CA bundle {}",
                ignored,
                path.display()
            );
        }

        Ok(Self {
            roots: Arc::new(roots),
            certificates,
            pem,
        })
    }

    pub fn roots(&self) -> Arc<RootCertStore> {
        self.roots.clone()
    }

    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn pem(&self) -> &[u8] {
        &self.pem
    }
}

impl fmt::Debug for CertPoolMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertPoolMaterial")
            .field("roots", &self.roots.len())
            .finish_non_exhaustive()
    }
}

/// Owns a PEM bundle of trusted CA certificates and reloads it on change.
pub struct CertPoolLoader {
    path: PathBuf,
    file: Mutex<FileFingerprint>,
    slot: MaterialSlot<CertPoolMaterial>,
}

impl CertPoolLoader {
    pub async fn new(path: impl AsRef<Path>) -> CredentialResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (pem, fingerprint) = FileFingerprint::read(&path).await?;
        let material = CertPoolMaterial::parse(&path, pem)?;

        info!(
            "Loaded {} CA certificate(s) from {}",
            material.len(),
            path.display()
        );

        Ok(Self {
            path,
            file: Mutex::new(fingerprint),
            slot: MaterialSlot::new(material),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Arc<Versioned<CertPoolMaterial>> {
        self.slot.load()
    }

    pub fn generation(&self) -> u64 {
        self.slot.generation()
    }

    pub async fn wait_for_reload(&self, cancel: &CancellationToken) -> CredentialResult<u64> {
        self.slot.wait_for_reload(cancel).await
    }

    pub(crate) async fn stage(&self) -> CredentialResult<Option<CertPoolMaterial>> {
        let mut file = self.file.lock().await;

        let (pem, fingerprint) = FileFingerprint::read(&self.path).await?;
        if fingerprint.same_content(&file) {
            return Ok(None);
        }
        *file = fingerprint;
        drop(file);

        match CertPoolMaterial::parse(&self.path, pem) {
            Ok(material) => Ok(Some(material)),
            Err(e) => {
                warn!(
                    "Could not reload CA bundle {}: {}, keeping previous pool",
                    self.path.display(),
                    e
                );
                Err(e)
            }
        }
    }

    pub(crate) fn install(&self, material: CertPoolMaterial) -> Arc<Versioned<CertPoolMaterial>> {
        let installed = self.slot.install(material);
        info!(
            "Reloaded {} CA certificate(s) from {} (generation {})",
            installed.len(),
            self.path.display(),
            installed.generation()
        );
        installed
    }

    pub(crate) fn announce(&self, generation: u64) {
        self.slot.announce(generation);
    }

    pub async fn reload_if_changed(&self) -> CredentialResult<bool> {
        match self.stage().await? {
            Some(material) => {
                let installed = self.install(material);
                self.announce(installed.generation());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// See [`super::CertificateLoader::run_reload_loop`].
    pub async fn run_reload_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reload_if_changed().await {
                        debug!("CA bundle reload check failed: {}", e);
                    }
                }
            }
        }
    }
}
