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

use super::{CredentialError, CredentialResult};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::SystemTime;
use tokio::fs;

/// Content fingerprint of a watched file.
///
/// Two fingerprints are the same version iff their SHA-256 digests match; the
/// modification time is kept for logging only, so a file replaced by rename
/// or rewritten within the same timestamp tick is still detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    digest: [u8; 32],
    modified: Option<SystemTime>,
}

impl FileFingerprint {
    pub fn from_contents(data: &[u8], modified: Option<SystemTime>) -> Self {
        Self {
            digest: Sha256::digest(data).into(),
            modified,
        }
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    pub fn same_content(&self, other: &FileFingerprint) -> bool {
        self.digest == other.digest
    }

    /// Reads `path` and fingerprints what was read.
    pub(crate) async fn read(path: &Path) -> CredentialResult<(Vec<u8>, Self)> {
        let read_error = |e: std::io::Error| CredentialError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        let data = fs::read(path).await.map_err(read_error)?;
        let modified = fs::metadata(path)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());
        let fingerprint = Self::from_contents(&data, modified);
        Ok((data, fingerprint))
    }
}
