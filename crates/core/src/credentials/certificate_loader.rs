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
use super::pem::{ensure_key_matches, parse_certificates, parse_private_key};
use super::slot::{MaterialSlot, Versioned};
use super::CredentialResult;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 证书链与私钥
pub struct CertificateMaterial {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    fingerprint: String,
}

impl CertificateMaterial {
    fn parse(
        cert_path: &Path,
        cert_pem: Vec<u8>,
        key_path: &Path,
        key_pem: Vec<u8>,
    ) -> CredentialResult<Self> {
        let chain = parse_certificates(cert_path, &cert_pem)?;
        let key = parse_private_key(key_path, &key_pem)?;

        ensure_key_matches(key_path, &chain[0], &key)?;

        let fingerprint = FileFingerprint::from_contents(chain[0].as_ref(), None).digest_hex();

        Ok(Self {
            chain,
            key,
            cert_pem,
            key_pem,
            fingerprint,
        })
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &[u8] {
        &self.key_pem
    }

    /// SHA-256 of the leaf certificate (DER), hex encoded.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("chain_len", &self.chain.len())
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

struct WatchedFiles {
    cert: FileFingerprint,
    key: FileFingerprint,
}

/// Owns one certificate/key pair on disk and reloads it when either file
/// changes. A malformed update never replaces working material.
pub struct CertificateLoader {
    cert_path: PathBuf,
    key_path: PathBuf,
    files: Mutex<WatchedFiles>,
    slot: MaterialSlot<CertificateMaterial>,
}

impl CertificateLoader {
    pub async fn new(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> CredentialResult<Self> {
        let cert_path = cert_path.as_ref().to_path_buf();
        let key_path = key_path.as_ref().to_path_buf();

        let (cert_pem, cert) = FileFingerprint::read(&cert_path).await?;
        let (key_pem, key) = FileFingerprint::read(&key_path).await?;
        let material = CertificateMaterial::parse(&cert_path, cert_pem, &key_path, key_pem)?;

        info!(
            "Loaded certificate {} (fingerprint {})",
            cert_path.display(),
            material.fingerprint()
        );

        Ok(Self {
            cert_path,
            key_path,
            files: Mutex::new(WatchedFiles { cert, key }),
            slot: MaterialSlot::new(material),
        })
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn current(&self) -> Arc<Versioned<CertificateMaterial>> {
        self.slot.load()
    }

    pub fn generation(&self) -> u64 {
        self.slot.generation()
    }

    /// Blocks until the next successful reload or until `cancel` fires.
    pub async fn wait_for_reload(&self, cancel: &CancellationToken) -> CredentialResult<u64> {
        self.slot.wait_for_reload(cancel).await
    }

    /// Parses the files if their content changed since the last look.
    ///
    /// The new fingerprints are recorded even when parsing fails, so a broken
    /// file is reported once and retried on its next change.
    pub(crate) async fn stage(&self) -> CredentialResult<Option<CertificateMaterial>> {
        let mut files = self.files.lock().await;

        let (cert_pem, cert) = FileFingerprint::read(&self.cert_path).await?;
        let (key_pem, key) = FileFingerprint::read(&self.key_path).await?;
        if cert.same_content(&files.cert) && key.same_content(&files.key) {
            return Ok(None);
        }
        files.cert = cert;
        files.key = key;
        drop(files);

        match CertificateMaterial::parse(&self.cert_path, cert_pem, &self.key_path, key_pem) {
            Ok(material) => Ok(Some(material)),
            Err(e) => {
                warn!(
                    "Could not reload certificate {}: {}, keeping previous certificate",
                    self.cert_path.display(),
                    e
                );
                Err(e)
            }
        }
    }

    pub(crate) fn install(
        &self,
        material: CertificateMaterial,
    ) -> Arc<Versioned<CertificateMaterial>> {
        let installed = self.slot.install(material);
        info!(
            "Reloaded certificate {} (generation {}, fingerprint {})",
            self.cert_path.display(),
            installed.generation(),
            installed.fingerprint()
        );
        installed
    }

    pub(crate) fn announce(&self, generation: u64) {
        self.slot.announce(generation);
    }

    /// Reloads and publishes the pair if it changed on disk. Returns whether a
    /// new generation was installed.
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

    /// Polls for changes until `cancel` fires. A loader handed to
    /// [`super::ReloadableCredentials`] is owned by it and polled by
    /// [`super::ReloadableCredentials::spawn_reloader`] instead.
    pub async fn run_reload_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reload_if_changed().await {
                        debug!("Certificate reload check failed: {}", e);
                    }
                }
            }
        }

        debug!("Stopped watching certificate {}", self.cert_path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialError;
    use crate::tests::tls_fixtures::{replace_file, TestPki};
    use tempfile::TempDir;

    async fn loader_for(dir: &TempDir, pki: &TestPki) -> CertificateLoader {
        let (cert, key) = pki.write_leaf(dir.path());
        CertificateLoader::new(cert, key).await.unwrap()
    }

    #[tokio::test]
    async fn test_initial_load() {
        let dir = TempDir::new().unwrap();
        let pki = TestPki::generate("loader");
        let loader = loader_for(&dir, &pki).await;

        let current = loader.current();
        assert_eq!(current.generation(), 0);
        assert_eq!(current.chain().len(), 1);
        assert_eq!(current.cert_pem(), pki.leaf_cert_pem.as_bytes());
        assert_eq!(current.fingerprint().len(), 64);
    }

    #[tokio::test]
    async fn test_missing_files_fail_construction() {
        let dir = TempDir::new().unwrap();
        let result = CertificateLoader::new(
            dir.path().join("missing.crt"),
            dir.path().join("missing.key"),
        )
        .await;
        assert!(matches!(result, Err(CredentialError::Read { .. })));
    }

    #[tokio::test]
    async fn test_unchanged_files_do_not_reload() {
        let dir = TempDir::new().unwrap();
        let pki = TestPki::generate("loader");
        let loader = loader_for(&dir, &pki).await;

        assert!(!loader.reload_if_changed().await.unwrap());
        assert_eq!(loader.generation(), 0);
    }

    #[tokio::test]
    async fn test_reload_after_replacement() {
        let dir = TempDir::new().unwrap();
        let pki = TestPki::generate("loader");
        let loader = loader_for(&dir, &pki).await;
        let before = loader.current();

        let renewed = pki.renew_leaf("loader-renewed");
        replace_file(loader.cert_path(), renewed.cert_pem.as_bytes());
        replace_file(loader.key_path(), renewed.key_pem.as_bytes());

        assert!(loader.reload_if_changed().await.unwrap());
        let after = loader.current();
        assert_eq!(after.generation(), 1);
        assert_ne!(after.fingerprint(), before.fingerprint());
        // Material captured before the reload is untouched.
        assert_eq!(before.cert_pem(), pki.leaf_cert_pem.as_bytes());
    }

    #[tokio::test]
    async fn test_malformed_update_keeps_previous_material() {
        let dir = TempDir::new().unwrap();
        let pki = TestPki::generate("loader");
        let loader = loader_for(&dir, &pki).await;
        let before = loader.current();

        replace_file(loader.cert_path(), b"-----BEGIN CERTIFICATE-----\ngarbage\n");
        assert!(loader.reload_if_changed().await.is_err());
        assert_eq!(loader.generation(), 0);
        assert_eq!(loader.current().fingerprint(), before.fingerprint());

        // The broken version was seen; it is not retried until it changes.
        assert!(!loader.reload_if_changed().await.unwrap());

        replace_file(loader.cert_path(), pki.leaf_cert_pem.as_bytes());
        assert!(loader.reload_if_changed().await.unwrap());
        assert_eq!(loader.generation(), 1);
    }

    #[tokio::test]
    async fn test_certificate_without_its_key_is_not_installed() {
        let dir = TempDir::new().unwrap();
        let pki = TestPki::generate("loader");
        let loader = loader_for(&dir, &pki).await;
        let before = loader.current();

        let renewed = pki.renew_leaf("loader-renewed");
        replace_file(loader.cert_path(), renewed.cert_pem.as_bytes());
        assert!(matches!(
            loader.reload_if_changed().await,
            Err(CredentialError::Parse { .. })
        ));
        assert_eq!(loader.generation(), 0);
        assert_eq!(loader.current().fingerprint(), before.fingerprint());

        replace_file(loader.key_path(), renewed.key_pem.as_bytes());
        assert!(loader.reload_if_changed().await.unwrap());
        assert_eq!(loader.generation(), 1);
        assert_eq!(loader.current().cert_pem(), renewed.cert_pem.as_bytes());
    }

    #[tokio::test]
    async fn test_key_without_its_certificate_is_not_installed() {
        let dir = TempDir::new().unwrap();
        let pki = TestPki::generate("loader");
        let loader = loader_for(&dir, &pki).await;

        let renewed = pki.renew_leaf("loader-renewed");
        replace_file(loader.key_path(), renewed.key_pem.as_bytes());
        assert!(loader.reload_if_changed().await.is_err());
        assert_eq!(loader.generation(), 0);

        // Putting the matching key back is picked up as well.
        replace_file(loader.key_path(), pki.leaf_key_pem.as_bytes());
        assert!(loader.reload_if_changed().await.unwrap());
        assert_eq!(loader.current().cert_pem(), pki.leaf_cert_pem.as_bytes());
    }

    #[tokio::test]
    async fn test_reload_loop_releases_waiter() {
        let dir = TempDir::new().unwrap();
        let pki = TestPki::generate("loader");
        let loader = Arc::new(loader_for(&dir, &pki).await);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(
            loader
                .clone()
                .run_reload_loop(Duration::from_millis(10), cancel.clone()),
        );

        let waiter = {
            let loader = loader.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { loader.wait_for_reload(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let renewed = pki.renew_leaf("loader-renewed");
        replace_file(loader.cert_path(), renewed.cert_pem.as_bytes());
        replace_file(loader.key_path(), renewed.key_pem.as_bytes());

        let generation = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(generation >= 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
