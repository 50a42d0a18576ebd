//! C3 — self-signed DTLS identity (spec §4.2).
//!
//! Certificates are generated with `rcgen`, cached process-wide by common
//! name so repeatedly constructing a `Certificate` for the same identity
//! (e.g. in tests that spin up many connections) doesn't regenerate keys.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const VALIDITY_BACKDATE: Duration = Duration::from_secs(3600);
const VALIDITY_PERIOD: Duration = Duration::from_secs(365 * 86400);

/// A self-signed X.509 identity plus its SHA-256 fingerprint. The private
/// key is generated and discarded once the certificate is signed -- the
/// handshake (see `transport::dtls`'s module doc) authenticates peers by
/// fingerprint match rather than a real signature, so nothing downstream
/// needs the key material back.
pub struct Certificate {
    pub(crate) der: Vec<u8>,
    fingerprint: String,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

static CACHE: OnceLock<Mutex<HashMap<String, std::sync::Arc<Certificate>>>> = OnceLock::new();

fn cache() -> &'static Mutex<HashMap<String, std::sync::Arc<Certificate>>> {
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Certificate {
    /// Returns the cached certificate for `common_name`, generating and
    /// caching a fresh one (ECDSA P-256) on first use.
    pub fn make_certificate(common_name: &str) -> Result<std::sync::Arc<Certificate>> {
        if let Some(existing) = cache().lock().unwrap().get(common_name) {
            return Ok(existing.clone());
        }
        let cert = std::sync::Arc::new(Self::generate_ecdsa(common_name)?);
        cache()
            .lock()
            .unwrap()
            .insert(common_name.to_string(), cert.clone());
        Ok(cert)
    }

    fn generate_ecdsa(common_name: &str) -> Result<Self> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::invalid(format!("key generation failed: {e}")))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| Error::invalid(format!("invalid certificate params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.not_before = (SystemTime::now() - VALIDITY_BACKDATE).into();
        params.not_after = (SystemTime::now() + VALIDITY_PERIOD).into();
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<[u8; 16]>().to_vec()));

        let x509 = params
            .self_signed(&key_pair)
            .map_err(|e| Error::invalid(format!("self-signing failed: {e}")))?;
        let der = x509.der().to_vec();

        let fingerprint = Self::fingerprint_of(&der);

        Ok(Certificate { der, fingerprint })
    }

    fn fingerprint_of(der: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(der);
        let digest = hasher.finalize();
        digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// SHA-256 fingerprint, uppercase hex, colon-separated, as carried in
    /// `a=fingerprint:sha-256 <hex>`.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Case-insensitive comparison against a fingerprint string quoted from
    /// a remote `Description` (spec §4.4: "only an exact case-insensitive
    /// match succeeds").
    pub fn fingerprint_matches(&self, other: &str) -> bool {
        self.fingerprint.eq_ignore_ascii_case(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_uppercase_colon_separated() {
        let cert = Certificate::make_certificate("test-cn-1").unwrap();
        let fp = cert.fingerprint();
        assert_eq!(fp, fp.to_uppercase());
        assert_eq!(fp.split(':').count(), 32);
        for byte in fp.split(':') {
            assert_eq!(byte.len(), 2);
        }
    }

    #[test]
    fn same_common_name_returns_cached_certificate() {
        let a = Certificate::make_certificate("test-cn-cache").unwrap();
        let b = Certificate::make_certificate("test-cn-cache").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_common_names_are_distinct_certificates() {
        let a = Certificate::make_certificate("test-cn-distinct-a").unwrap();
        let b = Certificate::make_certificate("test-cn-distinct-b").unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_matches_is_case_insensitive() {
        let cert = Certificate::make_certificate("test-cn-ci").unwrap();
        let lower = cert.fingerprint().to_lowercase();
        assert!(cert.fingerprint_matches(&lower));
        assert!(!cert.fingerprint_matches("00:11:22"));
    }
}
