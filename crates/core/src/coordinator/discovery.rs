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

//! DNS SRV 端点发现
//!
//! Follows the etcd client discovery convention: `_<service>-ssl._tcp.<domain>`
//! records become `https://` endpoints, `_<service>._tcp.<domain>` records
//! become `http://` endpoints.

use crate::types::{CoreError, Result};
use async_trait::async_trait;
use hickory_resolver::Resolver;
use tracing::debug;

const DEFAULT_SERVICE: &str = "etcd-client";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

#[async_trait]
pub trait SrvResolver: Send + Sync {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>>;
}

/// Resolves SRV records with the system DNS configuration.
#[derive(Debug, Clone, Default)]
pub struct HickorySrvResolver;

impl HickorySrvResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SrvResolver for HickorySrvResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        let resolver = Resolver::builder_tokio()
            .map_err(|e| CoreError::Configuration(format!("DNS resolver: {}", e)))?
            .build();

        let lookup = resolver.srv_lookup(name).await.map_err(|e| CoreError::Discovery {
            domain: name.to_string(),
            reason: e.to_string(),
        })?;

        Ok(lookup
            .iter()
            .map(|srv| SrvRecord {
                target: srv.target().to_utf8(),
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
            })
            .collect())
    }
}

fn service_name(service: Option<&str>) -> String {
    match service.map(str::trim).filter(|s| !s.is_empty()) {
        Some(service) => format!("{}-{}", DEFAULT_SERVICE, service),
        None => DEFAULT_SERVICE.to_string(),
    }
}

/// Resolves the client endpoints of the cluster published under `domain`.
///
/// Fails only if neither the TLS nor the plain record set could be resolved.
pub async fn discover_endpoints(
    resolver: &dyn SrvResolver,
    domain: &str,
    service: Option<&str>,
) -> Result<Vec<String>> {
    let domain = domain.trim().trim_end_matches('.');
    let service = service_name(service);

    let mut endpoints = Vec::new();
    let mut errors = Vec::new();
    for (suffix, scheme) in [("-ssl", "https"), ("", "http")] {
        let name = format!("_{}{}._tcp.{}", service, suffix, domain);
        match resolver.lookup_srv(&name).await {
            Ok(records) => {
                for record in records {
                    let host = record.target.trim_end_matches('.');
                    let endpoint = format!("{}://{}:{}", scheme, host, record.port);
                    if !endpoints.contains(&endpoint) {
                        endpoints.push(endpoint);
                    }
                }
            }
            Err(e) => {
                debug!("SRV lookup for {} failed: {}", name, e);
                errors.push(e.to_string());
            }
        }
    }

    if errors.len() == 2 {
        return Err(CoreError::Discovery {
            domain: domain.to_string(),
            reason: errors.join("; "),
        });
    }
    Ok(endpoints)
}
