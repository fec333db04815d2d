//! Certificate authority that issues leaf certificates for intercepted domains.

use super::{crypto_provider, ALPN_HTTP1};
use crate::error::InterceptError;
use crate::metrics;
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, RsaKeySize, SerialNumber, PKCS_RSA_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tracing::{debug, info};

/// Subject of every issued leaf. The target domain only appears in the SAN.
pub const LEAF_ORGANIZATION: &str = "Rift Contributors";
pub const LEAF_ORGANIZATIONAL_UNIT: &str = "Rift Intercept";
pub const LEAF_COMMON_NAME: &str = "rift-intercept";

/// Leaf validity, counted from the moment of issuance.
pub const LEAF_VALIDITY_DAYS: i64 = 365;

/// Path of the root CA certificate shipped with the crate.
pub fn bundled_cert_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("certs").join("ca.pem")
}

/// Path of the root CA private key shipped with the crate.
pub fn bundled_key_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("certs").join("ca.key")
}

/// A freshly issued leaf certificate and its private key.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub domain: String,
    /// Serial number, lower-case hex.
    pub serial: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl IssuedCertificate {
    /// Convert into a rustls `CertifiedKey` for a TLS server.
    pub fn certified_key(&self) -> Result<CertifiedKey, InterceptError> {
        let fail = |reason: String| InterceptError::Certificate {
            domain: self.domain.clone(),
            reason,
        };

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut self.certificate_pem.as_bytes())
                .collect::<Result<_, _>>()
                .map_err(|e| fail(format!("failed to parse leaf PEM: {e}")))?;
        if certs.is_empty() {
            return Err(fail("no certificates parsed from PEM".to_string()));
        }

        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut self.private_key_pem.as_bytes())
                .map_err(|e| fail(format!("failed to parse leaf key PEM: {e}")))?
                .ok_or_else(|| fail("no private key parsed from PEM".to_string()))?;

        let signer = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| fail(format!("failed to create leaf key signer: {e}")))?;
        Ok(CertifiedKey::new(certs, signer))
    }
}

/// Issues leaf certificates signed by a fixed root.
///
/// Issuance only reads the root material; nothing is cached between calls, so
/// concurrent issuance for different domains shares no mutable state.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

impl CertificateAuthority {
    /// Load the root certificate and PKCS#8 key from disk.
    ///
    /// Missing or unreadable material is a configuration error.
    pub async fn load(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>, InterceptError> {
        info!("Loading CA from {:?}", cert_path);
        let cert_pem = fs::read_to_string(cert_path).await.map_err(|e| {
            InterceptError::Configuration(format!("failed to read CA cert {cert_path:?}: {e}"))
        })?;
        let key_pem = fs::read_to_string(key_path).await.map_err(|e| {
            InterceptError::Configuration(format!("failed to read CA key {key_path:?}: {e}"))
        })?;
        Self::from_pem(cert_pem, &key_pem).map(Arc::new)
    }

    /// Load the root shipped in the crate's `certs/` directory.
    pub async fn bundled() -> Result<Arc<Self>, InterceptError> {
        Self::load(&bundled_cert_path(), &bundled_key_path()).await
    }

    pub fn from_pem(cert_pem: String, key_pem: &str) -> Result<Self, InterceptError> {
        let key_pair = KeyPair::from_pem(key_pem).map_err(|e| {
            InterceptError::Configuration(format!("failed to parse CA key pair from PEM: {e}"))
        })?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
            InterceptError::Configuration(format!("failed to parse CA certificate: {e}"))
        })?;
        Ok(Self {
            ca_cert_pem: cert_pem,
            issuer,
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Issue a leaf certificate for `domain`, valid for one year from now.
    pub fn issue(&self, domain: &str) -> Result<IssuedCertificate, InterceptError> {
        let result = self.issue_inner(domain);
        metrics::record_certificate(if result.is_ok() { "issued" } else { "error" });
        result
    }

    fn issue_inner(&self, domain: &str) -> Result<IssuedCertificate, InterceptError> {
        let fail = |reason: String| InterceptError::Certificate {
            domain: domain.to_string(),
            reason,
        };

        // Fresh keypair per issuance
        let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048)
            .map_err(|e| fail(format!("RSA key generation failed: {e}")))?;

        // CSR carries the fixed organizational subject
        let mut csr_params =
            CertificateParams::new(Vec::<String>::new()).map_err(|e| fail(e.to_string()))?;
        csr_params.distinguished_name = leaf_subject();
        let csr = csr_params
            .serialize_request(&key_pair)
            .map_err(|e| fail(format!("failed to build CSR: {e}")))?;
        let mut request = CertificateSigningRequestParams::from_der(csr.der())
            .map_err(|e| fail(format!("failed to parse CSR: {e}")))?;

        // SAN parsing also accepts IP literals
        let subject_alt_names = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| fail(format!("invalid subjectAltName: {e}")))?
            .subject_alt_names;

        let now = OffsetDateTime::now_utc();
        let serial = random_serial();
        let params = &mut request.params;
        params.not_before = now;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
        params.serial_number = Some(SerialNumber::from(serial.clone()));
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.subject_alt_names = subject_alt_names;
        params.use_authority_key_identifier_extension = false;

        let cert = request
            .signed_by(&self.issuer)
            .map_err(|e| fail(format!("failed to sign leaf: {e}")))?;

        debug!("Issued leaf certificate for {}", domain);

        Ok(IssuedCertificate {
            domain: domain.to_string(),
            serial: hex::encode(&serial),
            not_before: now,
            not_after: now + Duration::days(LEAF_VALIDITY_DAYS),
            certificate_pem: cert.pem(),
            private_key_pem: key_pair.serialize_pem(),
        })
    }

    /// Root store containing only this CA.
    pub fn root_store(&self) -> Result<RootCertStore, InterceptError> {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut self.ca_cert_pem.as_bytes()) {
            let cert = cert.map_err(|e| {
                InterceptError::Configuration(format!("failed to parse CA certificate: {e}"))
            })?;
            roots.add(cert).map_err(|e| {
                InterceptError::Configuration(format!("CA certificate rejected: {e}"))
            })?;
        }
        Ok(roots)
    }

    /// Client config that trusts only this CA, for connecting to the listener.
    pub fn client_config(&self) -> Result<ClientConfig, InterceptError> {
        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| {
                InterceptError::Configuration(format!("Failed to build TLS configuration: {e}"))
            })?
            .with_root_certificates(self.root_store()?)
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
        Ok(config)
    }
}

fn leaf_subject() -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
    dn.push(DnType::OrganizationalUnitName, LEAF_ORGANIZATIONAL_UNIT);
    dn.push(DnType::CommonName, LEAF_COMMON_NAME);
    dn
}

/// 16 random bytes with the top bit cleared so the DER integer stays positive.
fn random_serial() -> Vec<u8> {
    let mut bytes = *uuid::Uuid::new_v4().as_bytes();
    bytes[0] &= 0x7f;
    bytes.to_vec()
}
