#![forbid(unsafe_code)]

//! The process-local certificate authority used for TLS interception.
//!
//! The CA keypair is generated once per process, or loaded from a stable
//! path pair so the guest image can pre-install the public certificate.
//! Only the public certificate is ever exported; the private key never
//! leaves this module.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::Path;
use time::{Duration, OffsetDateTime};

use crate::InterceptError;

/// Leaf lifetime. Short-lived by design; the cache re-mints on expiry.
const LEAF_VALIDITY: Duration = Duration::days(14);
/// Refuse to serve a cached leaf closer than this to its expiry.
const LEAF_RENEW_MARGIN: Duration = Duration::days(1);
const CA_VALIDITY_DAYS: i64 = 3650;

const CA_COMMON_NAME: &str = "Gondolin Interception CA";
const CA_ORGANIZATION: &str = "Gondolin Sandbox";

/// A freshly-minted (or cached) leaf, ready for rustls.
#[derive(Debug)]
pub struct LeafMaterial {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub serial: [u8; 16],
    pub not_after: OffsetDateTime,
}

pub struct CertificateAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    ca_cert_der: CertificateDer<'static>,
}

impl CertificateAuthority {
    /// Generate a fresh CA keypair for this process.
    pub fn generate() -> Result<Self, InterceptError> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, CA_ORGANIZATION);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
        params.serial_number = Some(random_serial().to_vec().into());

        let ca_key = KeyPair::generate()?;
        let ca_cert = params.self_signed(&ca_key)?;
        Ok(Self {
            ca_cert_pem: ca_cert.pem(),
            ca_cert_der: ca_cert.der().clone(),
            ca_cert,
            ca_key,
        })
    }

    /// Load the CA from `cert_path`/`key_path`, generating and persisting
    /// a new one when either file is missing.
    pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Self, InterceptError> {
        if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(cert_path)?;
            let key_pem = std::fs::read_to_string(key_path)?;
            let ca_key = KeyPair::from_pem(&key_pem)?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
            let ca_cert = params.self_signed(&ca_key)?;
            return Ok(Self {
                ca_cert_pem: ca_cert.pem(),
                ca_cert_der: ca_cert.der().clone(),
                ca_cert,
                ca_key,
            });
        }

        let ca = Self::generate()?;
        if let Some(parent) = cert_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(cert_path, ca.ca_cert_pem())?;
        std::fs::write(key_path, ca.ca_key.serialize_pem())?;
        Ok(ca)
    }

    /// The public CA certificate, for installation into the guest trust
    /// store. This is the only export of CA material.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Mint a leaf for one SNI host: CN = host, SAN = [host], signed by
    /// the CA.
    pub fn mint_leaf(&self, host: &str) -> Result<LeafMaterial, InterceptError> {
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, host);
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        let not_after = now + LEAF_VALIDITY;
        params.not_after = not_after;
        let serial = random_serial();
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;

        Ok(LeafMaterial {
            cert_der: leaf.der().clone(),
            key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                leaf_key.serialize_der(),
            )),
            serial,
            not_after,
        })
    }

    /// Whether a cached leaf still has comfortable lifetime left.
    pub fn leaf_is_fresh(leaf_not_after: OffsetDateTime) -> bool {
        OffsetDateTime::now_utc() + LEAF_RENEW_MARGIN < leaf_not_after
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

fn random_serial() -> [u8; 16] {
    use rand::RngCore;
    let mut serial = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut serial);
    // Keep the top bit clear so the DER integer stays positive.
    serial[0] &= 0x7f;
    serial
}
