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

//! TLS 凭证热加载模块
//! 证书/私钥与 CA 证书池在磁盘变化时自动重新加载，不中断已建立的连接

pub mod cert_pool_loader;
pub mod certificate_loader;
mod fingerprint;
mod pem;
pub mod reloadable;
mod slot;

pub use cert_pool_loader::{CertPoolLoader, CertPoolMaterial};
pub use certificate_loader::{CertificateLoader, CertificateMaterial};
pub use fingerprint::FileFingerprint;
pub use reloadable::{CredentialSnapshot, ReloadableCredentials};
pub use slot::Versioned;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no certificate loaded")]
    CertificateNotConfigured,

    #[error("no certificate pool loaded")]
    CertPoolNotConfigured,

    #[error("Failed to read {}: {}", path, reason)]
    Read { path: String, reason: String },

    #[error("Failed to parse {}: {}", path, reason)]
    Parse { path: String, reason: String },

    #[error("Invalid TLS configuration: {}", _0)]
    Invalid(String),

    #[error("Wait for reload cancelled")]
    Cancelled,
}

pub type CredentialResult<T> = std::result::Result<T, CredentialError>;
