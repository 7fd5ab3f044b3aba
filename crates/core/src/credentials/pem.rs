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
use rustls::crypto::ring::{default_provider, sign::any_supported_type};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::SignatureScheme;
use std::io::BufReader;
use std::path::Path;

fn parse_error(path: &Path, reason: impl ToString) -> CredentialError {
    CredentialError::Parse {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// All certificates in a PEM file, in file order. Other PEM items are skipped.
pub(crate) fn parse_certificates(
    path: &Path,
    data: &[u8],
) -> CredentialResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(data);

    let mut certificates = Vec::new();
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::X509Certificate(cert))) => certificates.push(cert),
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => return Err(parse_error(path, e)),
        }
    }

    if certificates.is_empty() {
        return Err(parse_error(path, "no certificate found"));
    }
    Ok(certificates)
}

/// First private key in a PEM file (PKCS#1, PKCS#8 or SEC1).
pub(crate) fn parse_private_key(
    path: &Path,
    data: &[u8],
) -> CredentialResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Ok(PrivateKeyDer::from(key)),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Ok(PrivateKeyDer::from(key)),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Ok(PrivateKeyDer::from(key)),
            Ok(Some(_)) => continue,
            Ok(None) => return Err(parse_error(path, "no private key found")),
            Err(e) => return Err(parse_error(path, e)),
        }
    }
}

const KEY_CHECK_MESSAGE: &[u8] = b"certificate key check";

/// Signs a fixed message with `key` and verifies the signature against the
/// public key of `leaf`. Fails when the key cannot sign or does not belong to
/// the certificate.
pub(crate) fn ensure_key_matches(
    key_path: &Path,
    leaf: &CertificateDer<'_>,
    key: &PrivateKeyDer<'_>,
) -> CredentialResult<()> {
    let algorithms = default_provider().signature_verification_algorithms;
    let offered: Vec<SignatureScheme> =
        algorithms.mapping.iter().map(|(scheme, _)| *scheme).collect();

    let signer = any_supported_type(key)
        .map_err(|e| parse_error(key_path, e))?
        .choose_scheme(&offered)
        .ok_or_else(|| parse_error(key_path, "no usable signature scheme for key"))?;
    let signature = signer
        .sign(KEY_CHECK_MESSAGE)
        .map_err(|e| parse_error(key_path, e))?;

    let cert = webpki::EndEntityCert::try_from(leaf)
        .map_err(|e| parse_error(key_path, format!("unusable leaf certificate: {:?}", e)))?;
    let matches = algorithms
        .mapping
        .iter()
        .filter(|(scheme, _)| *scheme == signer.scheme())
        .flat_map(|(_, verifiers)| verifiers.iter())
        .any(|verifier| {
            cert.verify_signature(*verifier, KEY_CHECK_MESSAGE, &signature)
                .is_ok()
        });

    if !matches {
        return Err(parse_error(key_path, "private key does not match certificate"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::tls_fixtures::TestPki;

    #[test]
    fn test_parse_certificates_keeps_chain_order() {
        let pki = TestPki::generate("pem-test");
        let bundle = format!("{}{}", pki.leaf_cert_pem, pki.ca_cert_pem);

        let certs = parse_certificates(Path::new("bundle.pem"), bundle.as_bytes()).unwrap();
        assert_eq!(certs.len(), 2);

        let ca = parse_certificates(Path::new("ca.pem"), pki.ca_cert_pem.as_bytes()).unwrap();
        assert_eq!(certs[1], ca[0]);
    }

    #[test]
    fn test_parse_certificates_skips_keys() {
        let pki = TestPki::generate("pem-test");
        let mixed = format!("{}{}", pki.leaf_key_pem, pki.leaf_cert_pem);

        let certs = parse_certificates(Path::new("mixed.pem"), mixed.as_bytes()).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_parse_certificates_rejects_garbage() {
        let result = parse_certificates(Path::new("bad.pem"), b"not a certificate");
        assert!(matches!(result, Err(CredentialError::Parse { .. })));
    }

    #[test]
    fn test_parse_private_key() {
        let pki = TestPki::generate("pem-test");
        let key = parse_private_key(Path::new("leaf.key"), pki.leaf_key_pem.as_bytes()).unwrap();
        assert!(matches!(key, PrivateKeyDer::Pkcs8(_)));

        let result = parse_private_key(Path::new("leaf.crt"), pki.leaf_cert_pem.as_bytes());
        assert!(matches!(result, Err(CredentialError::Parse { .. })));
    }

    #[test]
    fn test_key_must_belong_to_leaf() {
        let pki = TestPki::generate("pem-test");
        let renewed = pki.renew_leaf("pem-test-renewed");
        let leaf = &parse_certificates(Path::new("leaf.crt"), pki.leaf_cert_pem.as_bytes())
            .unwrap()[0];
        let own_key = parse_private_key(Path::new("leaf.key"), pki.leaf_key_pem.as_bytes())
            .unwrap();
        let other_key = parse_private_key(Path::new("new.key"), renewed.key_pem.as_bytes())
            .unwrap();

        assert!(ensure_key_matches(Path::new("leaf.key"), leaf, &own_key).is_ok());
        assert!(matches!(
            ensure_key_matches(Path::new("new.key"), leaf, &other_key),
            Err(CredentialError::Parse { .. })
        ));
    }
}
