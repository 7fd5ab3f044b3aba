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

use cluster_core::credentials::{CredentialError, ReloadableCredentials};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Logs every certificate the credentials publish until `cancel` fires.
///
/// Returns the last generation seen, `None` when nothing was reloaded or no
/// certificate is configured.
pub async fn log_certificate_reloads(
    credentials: Arc<ReloadableCredentials>,
    cancel: CancellationToken,
) -> Option<u64> {
    let mut last = None;

    loop {
        match credentials.wait_for_certificate_reload(&cancel).await {
            Ok(generation) => {
                let snapshot = credentials.snapshot();
                match snapshot.certificate() {
                    Some(certificate) => info!(
                        "Serving TLS certificate generation {} (fingerprint {})",
                        generation,
                        certificate.fingerprint()
                    ),
                    None => warn!("TLS certificate generation {} has no certificate", generation),
                }
                last = Some(generation);
            }
            Err(CredentialError::CertificateNotConfigured) => {
                debug!("No TLS certificate configured, nothing to follow");
                return last;
            }
            Err(_) => return last,
        }
    }
}
