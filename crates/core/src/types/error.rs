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

use crate::config::ConfigError;
use crate::credentials::CredentialError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Configuration error: {}", _0)]
    Configuration(String),

    #[error("Could not discover etcd endpoints for {}: {}", domain, reason)]
    Discovery { domain: String, reason: String },

    #[error("Could not setup etcd TLS configuration: {}", _0)]
    Tls(String),

    #[error("etcd error: {}", _0)]
    Etcd(String),

    /// 当前没有可用的 etcd 客户端
    #[error("etcd client not configured")]
    NotConfigured,

    #[error("Watch failed: {}", _0)]
    Watch(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout error")]
    Timeout,

    #[error("I/O error: {}", _0)]
    Io(String),
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e.to_string())
    }
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Configuration(e.to_string())
    }
}

impl From<CredentialError> for CoreError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::Cancelled => CoreError::Cancelled,
            other => CoreError::Tls(other.to_string()),
        }
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for CoreError {
    fn from(e: etcd_client::Error) -> Self {
        CoreError::Etcd(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CoreError::Timeout
    }
}

impl CoreError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
