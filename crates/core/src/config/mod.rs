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

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const ETCD_SECTION: &str = "etcd";
pub const GRPC_SECTION: &str = "grpc";

const DEFAULT_RELOAD_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration: {}", _0)]
    MissingRequired(String),

    #[error("Invalid configuration value: {}", _0)]
    InvalidValue(String),

    #[error("Configuration file error: {}", _0)]
    FileError(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// 分段配置快照
///
/// Every top-level TOML table is a section. Scalars are exposed as strings so
/// that callers can apply their own parsing, arrays of strings are joined
/// with `,` to match the comma separated list syntax.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    sections: toml::Table,
}

impl ConfigFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_file(path: &str) -> ConfigResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileError(e.to_string()))?;

        content.parse()
    }

    pub fn has_section(&self, section: &str) -> bool {
        matches!(self.sections.get(section), Some(toml::Value::Table(_)))
    }

    /// Returns the trimmed value of `option` in `section`, `None` when it is
    /// missing or blank.
    pub fn get_string(&self, section: &str, option: &str) -> Option<String> {
        let table = match self.sections.get(section) {
            Some(toml::Value::Table(table)) => table,
            _ => return None,
        };

        let value = match table.get(option)? {
            toml::Value::String(s) => s.trim().to_string(),
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Float(f) => f.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            toml::Value::Array(items) => items
                .iter()
                .filter_map(|item| item.as_str())
                .map(str::trim)
                .collect::<Vec<_>>()
                .join(","),
            _ => return None,
        };

        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    pub fn set_string(&mut self, section: &str, option: &str, value: impl Into<String>) {
        let entry = self
            .sections
            .entry(section.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if !entry.is_table() {
            *entry = toml::Value::Table(toml::Table::new());
        }
        if let toml::Value::Table(table) = entry {
            table.insert(option.to_string(), toml::Value::String(value.into()));
        }
    }
}

impl FromStr for ConfigFile {
    type Err = ConfigError;

    fn from_str(content: &str) -> ConfigResult<Self> {
        let sections = content
            .parse::<toml::Table>()
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        Ok(Self { sections })
    }
}

/// Where the etcd endpoints come from, in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EndpointSource {
    Static(Vec<String>),
    Discovery {
        domain: String,
        service: Option<String>,
    },
    #[default]
    Disabled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtcdSettings {
    pub endpoints: EndpointSource,
    pub client_key: Option<String>,
    pub client_cert: Option<String>,
    pub ca_cert: Option<String>,
}

impl EtcdSettings {
    pub fn from_config(config: &ConfigFile, compat_section: Option<&str>) -> Self {
        let lookup = |option: &str| get_string_with_fallback(config, compat_section, option);

        let endpoints = if let Some(list) = lookup("endpoints") {
            EndpointSource::Static(parse_endpoints(&list))
        } else if let Some(domain) = lookup("discoverysrv") {
            EndpointSource::Discovery {
                domain,
                service: lookup("discoveryservice"),
            }
        } else {
            EndpointSource::Disabled
        };

        Self {
            endpoints,
            client_key: lookup("clientkey"),
            client_cert: lookup("clientcert"),
            ca_cert: lookup("cacert"),
        }
    }

    /// `(key, cert, ca)` when all three TLS files are configured.
    pub fn tls_files(&self) -> Option<(&str, &str, &str)> {
        match (&self.client_key, &self.client_cert, &self.ca_cert) {
            (Some(key), Some(cert), Some(ca)) => {
                Some((key.as_str(), cert.as_str(), ca.as_str()))
            }
            _ => None,
        }
    }
}

fn get_string_with_fallback(
    config: &ConfigFile,
    compat_section: Option<&str>,
    option: &str,
) -> Option<String> {
    if let Some(value) = config.get_string(ETCD_SECTION, option) {
        return Some(value);
    }

    let section = compat_section.filter(|s| !s.is_empty())?;
    let value = config.get_string(section, option)?;
    warn!(
        "Configuring etcd option \"{}\" in section \"{}\" is deprecated, use section \"{}\" instead",
        option, section, ETCD_SECTION
    );
    Some(value)
}

pub fn parse_endpoints(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|ep| !ep.is_empty())
        .map(String::from)
        .collect()
}

/// 重连退避参数
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 8000,
            multiplier: 2,
        }
    }
}

impl BackoffConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Server,
    Client,
}

/// TLS 文件配置 (`[grpc]` section)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcTlsSettings {
    pub role: TlsRole,
    pub certificate: Option<String>,
    pub key: Option<String>,
    pub ca: Option<String>,
    pub reload_interval: Duration,
}

impl GrpcTlsSettings {
    pub fn from_config(config: &ConfigFile, role: TlsRole) -> ConfigResult<Self> {
        // A server verifies clients against "clientca", a client verifies the
        // server against "serverca".
        let (prefix, ca_prefix) = match role {
            TlsRole::Server => ("server", "client"),
            TlsRole::Client => ("client", "server"),
        };

        let reload_interval = match config.get_string(GRPC_SECTION, "reloadinterval") {
            Some(value) => {
                let secs = value.parse::<u64>().map_err(|_| {
                    ConfigError::InvalidValue(format!("grpc.reloadinterval: {}", value))
                })?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue(
                        "grpc.reloadinterval must be positive".to_string(),
                    ));
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_RELOAD_INTERVAL_SECS),
        };

        Ok(Self {
            role,
            certificate: config.get_string(GRPC_SECTION, &format!("{}certificate", prefix)),
            key: config.get_string(GRPC_SECTION, &format!("{}key", prefix)),
            ca: config.get_string(GRPC_SECTION, &format!("{}ca", ca_prefix)),
            reload_interval,
        })
    }
}
