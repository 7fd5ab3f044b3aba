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

use super::tls_fixtures::{replace_file, TestPki};
use crate::config::{ConfigFile, GrpcTlsSettings, TlsRole};
use crate::credentials::{CredentialError, ReloadableCredentials};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

struct Node {
    dir: TempDir,
    credentials: Arc<ReloadableCredentials>,
}

impl Node {
    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_str().unwrap().to_string()
    }
}

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

/// Writes `pki` into a fresh directory and loads it through the `[grpc]`
/// settings of `role`.
async fn node(pki: &TestPki, role: TlsRole, with_certificate: bool) -> Node {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "node.crt", &pki.leaf_cert_pem);
    write(dir.path(), "node.key", &pki.leaf_key_pem);
    write(dir.path(), "ca.crt", &pki.ca_cert_pem);

    let path = |name: &str| dir.path().join(name).to_str().unwrap().to_string();
    let content = match (role, with_certificate) {
        (TlsRole::Server, _) => format!(
            "[grpc]\nservercertificate = \"{}\"\nserverkey = \"{}\"\nclientca = \"{}\"\n",
            path("node.crt"),
            path("node.key"),
            path("ca.crt")
        ),
        (TlsRole::Client, true) => format!(
            "[grpc]\nclientcertificate = \"{}\"\nclientkey = \"{}\"\nserverca = \"{}\"\n",
            path("node.crt"),
            path("node.key"),
            path("ca.crt")
        ),
        (TlsRole::Client, false) => format!("[grpc]\nserverca = \"{}\"\n", path("ca.crt")),
    };
    let config: ConfigFile = content.parse().unwrap();
    let settings = GrpcTlsSettings::from_config(&config, role).unwrap();
    let credentials = ReloadableCredentials::from_settings(&settings).await.unwrap();

    Node {
        dir,
        credentials: Arc::new(credentials),
    }
}

/// Serves an echo loop on one side of a duplex pipe and returns the client
/// side of the TLS connection.
async fn connect(
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
) -> io::Result<TlsStream<DuplexStream>> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let acceptor = TlsAcceptor::from(server);
    tokio::spawn(async move {
        let Ok(mut stream) = acceptor.accept(server_io).await else {
            return;
        };
        let mut buf = [0u8; 4];
        while stream.read_exact(&mut buf).await.is_ok() {
            if stream.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let connector = TlsConnector::from(client);
    let name = ServerName::try_from("localhost").unwrap();
    let mut stream = connector.connect(name, client_io).await?;
    ping(&mut stream).await?;
    Ok(stream)
}

async fn ping(stream: &mut TlsStream<DuplexStream>) -> io::Result<()> {
    stream.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"ping");
    Ok(())
}

fn peer_leaf(stream: &TlsStream<DuplexStream>) -> Vec<u8> {
    stream.get_ref().1.peer_certificates().unwrap()[0].as_ref().to_vec()
}

#[tokio::test]
async fn test_mutual_tls_handshake() {
    let pki = TestPki::generate("cluster");
    let server = node(&pki, TlsRole::Server, true).await;
    let client = node(&pki, TlsRole::Client, true).await;

    let stream = connect(
        server.credentials.server_config().unwrap(),
        client.credentials.client_config().unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(stream.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));
    let leaf = server.credentials.certificate().unwrap();
    assert_eq!(peer_leaf(&stream), leaf.leaf().as_ref());
}

#[tokio::test]
async fn test_server_requires_client_certificate() {
    let pki = TestPki::generate("cluster");
    let server = node(&pki, TlsRole::Server, true).await;
    let anonymous = node(&pki, TlsRole::Client, false).await;

    let result = connect(
        server.credentials.server_config().unwrap(),
        anonymous.credentials.client_config().unwrap(),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_foreign_ca_is_rejected() {
    let server = node(&TestPki::generate("cluster"), TlsRole::Server, true).await;
    let stranger = node(&TestPki::generate("elsewhere"), TlsRole::Client, true).await;

    let result = connect(
        server.credentials.server_config().unwrap(),
        stranger.credentials.client_config().unwrap(),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_renewal_keeps_established_sessions() {
    let pki = TestPki::generate("cluster");
    let server = node(&pki, TlsRole::Server, true).await;
    let client = node(&pki, TlsRole::Client, true).await;
    let client_config = client.credentials.client_config().unwrap();

    let server_config = server.credentials.server_config().unwrap();
    let mut established = connect(server_config, client_config.clone()).await.unwrap();
    let old_leaf = peer_leaf(&established);

    let renewed = pki.renew_leaf("cluster-renewed");
    replace_file(Path::new(&server.path("node.crt")), renewed.cert_pem.as_bytes());
    replace_file(Path::new(&server.path("node.key")), renewed.key_pem.as_bytes());
    assert!(server.credentials.refresh().await.unwrap());

    // The session negotiated before the renewal is untouched.
    ping(&mut established).await.unwrap();
    assert_eq!(peer_leaf(&established), old_leaf);

    let fresh = connect(server.credentials.server_config().unwrap(), client_config)
        .await
        .unwrap();
    assert_ne!(peer_leaf(&fresh), old_leaf);
    assert_eq!(
        peer_leaf(&fresh),
        server.credentials.certificate().unwrap().leaf().as_ref()
    );
}

#[tokio::test]
async fn test_snapshot_never_mixes_generations() {
    let pki = TestPki::generate("cluster");
    let server = node(&pki, TlsRole::Server, true).await;
    let credentials = server.credentials.clone();

    let stop = CancellationToken::new();
    let reader = {
        let credentials = credentials.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut observed = Vec::new();
            while !stop.is_cancelled() {
                let snapshot = credentials.snapshot();
                observed.push((
                    snapshot.certificate_generation(),
                    snapshot.cert_pool_generation(),
                ));
                tokio::task::yield_now().await;
            }
            observed
        })
    };

    // Replace the whole PKI: certificate, key and CA change together.
    for round in 0..3 {
        let next = TestPki::generate(&format!("cluster-{}", round));
        replace_file(Path::new(&server.path("node.crt")), next.leaf_cert_pem.as_bytes());
        replace_file(Path::new(&server.path("node.key")), next.leaf_key_pem.as_bytes());
        replace_file(Path::new(&server.path("ca.crt")), next.ca_cert_pem.as_bytes());
        assert!(credentials.refresh().await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    stop.cancel();

    let observed = reader.await.unwrap();
    assert!(!observed.is_empty());
    for (certificate, pool) in observed {
        assert_eq!(certificate, pool);
    }
    assert_eq!(credentials.snapshot().certificate_generation(), Some(3));
}

#[tokio::test]
async fn test_reloader_releases_waiters_after_publishing() {
    let pki = TestPki::generate("cluster");
    let server = node(&pki, TlsRole::Server, true).await;
    let credentials = server.credentials.clone();
    let cancel = CancellationToken::new();
    let reloader = credentials.spawn_reloader(Duration::from_millis(10), cancel.clone());

    let certificate_waiter = {
        let credentials = credentials.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let generation = credentials.wait_for_certificate_reload(&cancel).await?;
            Ok::<_, CredentialError>((generation, credentials.snapshot().certificate_generation()))
        })
    };
    let pool_waiter = {
        let credentials = credentials.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { credentials.wait_for_cert_pool_reload(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let renewed = pki.renew_leaf("cluster-renewed");
    replace_file(Path::new(&server.path("node.crt")), renewed.cert_pem.as_bytes());
    replace_file(Path::new(&server.path("node.key")), renewed.key_pem.as_bytes());

    let (generation, published) = tokio::time::timeout(Duration::from_secs(5), certificate_waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(generation >= 1);
    assert!(published >= Some(generation));

    // The pool never changed, so its waiter is only released by cancellation.
    assert!(!pool_waiter.is_finished());
    cancel.cancel();
    assert_eq!(pool_waiter.await.unwrap(), Err(CredentialError::Cancelled));
    tokio::time::timeout(Duration::from_secs(5), reloader)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_malformed_update_keeps_serving() {
    let pki = TestPki::generate("cluster");
    let server = node(&pki, TlsRole::Server, true).await;
    let client = node(&pki, TlsRole::Client, true).await;

    replace_file(Path::new(&server.path("node.crt")), b"not a certificate");
    assert!(server.credentials.refresh().await.is_err());
    assert_eq!(server.credentials.snapshot().certificate_generation(), Some(0));

    connect(
        server.credentials.server_config().unwrap(),
        client.credentials.client_config().unwrap(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_certificate_and_key_written_separately() {
    let pki = TestPki::generate("cluster");
    let server = node(&pki, TlsRole::Server, true).await;

    let client = node(&pki, TlsRole::Client, true).await;

    // The renewed certificate lands one poll before its key.
    let renewed = pki.renew_leaf("cluster-renewed");
    replace_file(Path::new(&server.path("node.crt")), renewed.cert_pem.as_bytes());
    assert!(matches!(
        server.credentials.refresh().await,
        Err(CredentialError::Parse { .. })
    ));
    assert_eq!(server.credentials.snapshot().certificate_generation(), Some(0));
    let mut stream = connect(
        server.credentials.server_config().unwrap(),
        client.credentials.client_config().unwrap(),
    )
    .await
    .unwrap();
    ping(&mut stream).await.unwrap();
    let current = server.credentials.certificate().unwrap();
    assert_eq!(current.cert_pem(), pki.leaf_cert_pem.as_bytes());
    assert_eq!(peer_leaf(&stream), current.leaf().as_ref());

    replace_file(Path::new(&server.path("node.key")), renewed.key_pem.as_bytes());
    assert!(server.credentials.refresh().await.unwrap());
    assert_eq!(server.credentials.snapshot().certificate_generation(), Some(1));
    assert_eq!(
        server.credentials.certificate().unwrap().cert_pem(),
        renewed.cert_pem.as_bytes()
    );
    let mut stream = connect(
        server.credentials.server_config().unwrap(),
        client.credentials.client_config().unwrap(),
    )
    .await
    .unwrap();
    ping(&mut stream).await.unwrap();
}

#[tokio::test]
async fn test_waits_return_promptly_on_cancel() {
    let pki = TestPki::generate("cluster");
    let server = node(&pki, TlsRole::Server, true).await;
    let cancel = CancellationToken::new();

    let waiter = {
        let credentials = server.credentials.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { credentials.wait_for_certificate_reload(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_millis(500), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Err(CredentialError::Cancelled));
}
