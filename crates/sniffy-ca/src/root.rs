//! Root CA material: the signing key and its self-signed certificate.

use std::fmt;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};
use tracing::info;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::CaConfig;
use crate::error::{CaError, CryptoError};
use crate::keys;

/// Organization carried in the root certificate's subject.
pub const ROOT_ORGANIZATION: &str = "Sniffy Self-Signed CA";
/// CommonName carried in the root certificate's subject.
pub const ROOT_COMMON_NAME: &str = "Sniffy Root CA";

/// Read-only view of the root certificate, for callers that distribute or
/// trust the CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCertificate {
    der: CertificateDer<'static>,
    pem: String,
    is_ca: bool,
    organization: Vec<String>,
    common_name: Option<String>,
    serial: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    fingerprint: String,
}

impl RootCertificate {
    fn parse(der: CertificateDer<'static>, pem: String) -> Result<Self, String> {
        let (is_ca, organization, common_name, serial, not_before, not_after) = {
            let (_, cert) = X509Certificate::from_der(der.as_ref())
                .map_err(|e| format!("failed to parse certificate DER: {e}"))?;
            let organization: Vec<String> = cert
                .subject()
                .iter_organization()
                .filter_map(|attr| attr.as_str().ok())
                .map(str::to_string)
                .collect();
            let common_name = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|attr| attr.as_str().ok())
                .map(str::to_string);
            (
                cert.is_ca(),
                organization,
                common_name,
                cert.tbs_certificate.raw_serial().to_vec(),
                cert.validity().not_before.to_datetime(),
                cert.validity().not_after.to_datetime(),
            )
        };

        Ok(Self {
            is_ca,
            organization,
            common_name,
            serial,
            not_before,
            not_after,
            fingerprint: keys::sha256_fingerprint(der.as_ref()),
            der,
            pem,
        })
    }

    /// DER encoding, byte-identical to what was generated or loaded.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    pub fn organization(&self) -> &[String] {
        &self.organization
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// Big-endian serial number bytes.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// SHA-256 fingerprint of the DER encoding, `SHA256:aa:bb:...`.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Which artifact a load-time defect was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Defect {
    Certificate(String),
    Key(String),
}

/// The root key pair and self-signed certificate.
///
/// Immutable after construction; leaves are signed through the embedded
/// issuer without any locking.
pub struct RootMaterial {
    issuer: Issuer<'static, KeyPair>,
    certificate: RootCertificate,
    key_pem: String,
}

impl RootMaterial {
    /// Generate a new root key pair and self-signed certificate.
    pub fn generate(config: &CaConfig) -> Result<Self, CaError> {
        let key_pair = keys::generate_key_pair(config.key_algorithm)?;
        let params = root_params(config.root_validity_years)?;
        let cert = params.self_signed(&key_pair)?;

        let certificate = RootCertificate::parse(cert.der().clone(), cert.pem())
            .map_err(CryptoError::new)?;
        let key_pem = key_pair.serialize_pem();

        info!(fingerprint = %certificate.fingerprint(), "generated root CA certificate");

        Ok(Self {
            issuer: Issuer::new(params, key_pair),
            certificate,
            key_pem,
        })
    }

    /// Rebuild root material from previously persisted DER parts.
    ///
    /// The certificate must be a CA certificate whose public key matches the
    /// private key.
    pub(crate) fn from_parts(
        cert_der: CertificateDer<'static>,
        cert_pem: String,
        key_pair: KeyPair,
        key_pem: String,
    ) -> Result<Self, Defect> {
        let public_key_matches = {
            let (_, cert) = X509Certificate::from_der(cert_der.as_ref()).map_err(|e| {
                Defect::Certificate(format!("failed to parse certificate DER: {e}"))
            })?;
            cert.public_key().subject_public_key.data.as_ref() == key_pair.public_key_raw()
        };

        let certificate =
            RootCertificate::parse(cert_der, cert_pem).map_err(Defect::Certificate)?;
        if !certificate.is_ca() {
            return Err(Defect::Certificate(
                "certificate is not a CA certificate".to_string(),
            ));
        }
        if !public_key_matches {
            return Err(Defect::Key(
                "private key does not match the CA certificate".to_string(),
            ));
        }

        let issuer = Issuer::from_ca_cert_der(certificate.der(), key_pair)
            .map_err(|e| Defect::Certificate(format!("unusable CA certificate: {e}")))?;

        Ok(Self {
            issuer,
            certificate,
            key_pem,
        })
    }

    pub fn certificate(&self) -> &RootCertificate {
        &self.certificate
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    pub(crate) fn key_pem(&self) -> &str {
        &self.key_pem
    }
}

impl fmt::Debug for RootMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootMaterial")
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

fn root_params(validity_years: u32) -> Result<CertificateParams, CryptoError> {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(keys::random_serial()?);

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(1);
    params.not_after = now
        .checked_add(Duration::days(365 * i64::from(validity_years)))
        .ok_or_else(|| CryptoError::new("root validity period is out of range"))?;
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_root_is_a_ca() {
        let root = RootMaterial::generate(&CaConfig::default()).unwrap();
        let cert = root.certificate();
        assert!(cert.is_ca());
        assert_eq!(cert.organization().to_vec(), vec![ROOT_ORGANIZATION.to_string()]);
        assert_eq!(cert.common_name(), Some(ROOT_COMMON_NAME));
        assert!(cert.pem().contains("BEGIN CERTIFICATE"));
        assert!(root.key_pem().contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn validity_covers_now_and_spans_years() {
        let root = RootMaterial::generate(&CaConfig::default()).unwrap();
        let cert = root.certificate();
        let now = OffsetDateTime::now_utc();
        assert!(cert.not_before() <= now);
        assert!(cert.not_after() - now > Duration::days(365 * 9));
    }

    #[test]
    fn two_roots_differ() {
        let a = RootMaterial::generate(&CaConfig::default()).unwrap();
        let b = RootMaterial::generate(&CaConfig::default()).unwrap();
        assert_ne!(a.certificate().serial(), b.certificate().serial());
        assert_ne!(a.certificate().fingerprint(), b.certificate().fingerprint());
    }

    #[test]
    fn from_parts_roundtrips_generated_material() {
        let root = RootMaterial::generate(&CaConfig::default()).unwrap();
        let key_pair = KeyPair::from_pem(root.key_pem()).unwrap();
        let loaded = RootMaterial::from_parts(
            root.certificate().der().clone(),
            root.certificate().pem().to_string(),
            key_pair,
            root.key_pem().to_string(),
        )
        .unwrap();
        assert_eq!(loaded.certificate(), root.certificate());
    }

    #[test]
    fn from_parts_rejects_foreign_key() {
        let root = RootMaterial::generate(&CaConfig::default()).unwrap();
        let other = KeyPair::generate().unwrap();
        let other_pem = other.serialize_pem();
        let err = RootMaterial::from_parts(
            root.certificate().der().clone(),
            root.certificate().pem().to_string(),
            other,
            other_pem,
        )
        .unwrap_err();
        assert!(matches!(err, Defect::Key(_)));
    }

    #[test]
    fn from_parts_rejects_non_ca_certificate() {
        let key_pair = KeyPair::generate().unwrap();
        let leaf = CertificateParams::new(vec!["leaf.example.com".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let key_pem = key_pair.serialize_pem();
        let err =
            RootMaterial::from_parts(leaf.der().clone(), leaf.pem(), key_pair, key_pem).unwrap_err();
        assert_eq!(
            err,
            Defect::Certificate("certificate is not a CA certificate".to_string())
        );
    }

    #[test]
    fn out_of_range_validity_is_an_error() {
        let err = root_params(u32::MAX).unwrap_err();
        assert_eq!(err.message(), "root validity period is out of range");
    }
}
