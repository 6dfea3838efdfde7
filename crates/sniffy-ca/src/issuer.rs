//! Leaf certificate issuance.

use std::sync::Arc;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::PrivatePkcs8KeyDer;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::bundle::CertBundle;
use crate::config::{CaConfig, KeyAlgorithm};
use crate::error::CryptoError;
use crate::keys;
use crate::root::RootMaterial;
use crate::subject::Subject;

/// Produces one value per subject. The cache is generic over this so it
/// can be exercised without real key generation.
pub trait IssueLeaf: Send + Sync {
    type Output: Send + Sync;

    /// Issue for `subject`. Must only fail on cryptographic errors.
    fn issue(&self, subject: &str) -> Result<Self::Output, CryptoError>;
}

/// Signs leaf certificates with a root CA.
#[derive(Debug)]
pub struct LeafIssuer {
    root: Arc<RootMaterial>,
    algorithm: KeyAlgorithm,
    validity: Duration,
}

impl LeafIssuer {
    pub fn new(root: Arc<RootMaterial>, config: &CaConfig) -> Self {
        Self {
            root,
            algorithm: config.key_algorithm,
            validity: Duration::days(i64::from(config.leaf_validity_days)),
        }
    }

    pub fn root(&self) -> &RootMaterial {
        &self.root
    }

    fn leaf_params(&self, subject: &Subject) -> Result<CertificateParams, CryptoError> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject.common_name());

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        // Leaf keys are always EC, which only permits signing usages.
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(keys::random_serial()?);

        match subject {
            Subject::Ip(ip) => params.subject_alt_names.push(SanType::IpAddress(*ip)),
            Subject::Dns(name) => {
                if let Ok(name) = name.as_str().try_into() {
                    params.subject_alt_names.push(SanType::DnsName(name));
                }
            }
            Subject::CommonNameOnly(_) => {}
        }

        // Backdated for clock skew between proxy and client.
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now
            .checked_add(self.validity)
            .ok_or_else(|| CryptoError::new("leaf validity period is out of range"))?;
        Ok(params)
    }
}

impl IssueLeaf for LeafIssuer {
    type Output = CertBundle;

    fn issue(&self, subject: &str) -> Result<CertBundle, CryptoError> {
        let normalized = Subject::parse(subject);
        let params = self.leaf_params(&normalized)?;

        let key_pair = keys::generate_key_pair(self.algorithm)?;
        let cert = params.signed_by(&key_pair, self.root.issuer())?;

        let root = self.root.certificate();
        let bundle = CertBundle::new(
            subject,
            cert.der().clone(),
            cert.pem(),
            root.der().clone(),
            root.pem().to_string(),
            PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
            key_pair.serialize_pem(),
        )?;

        debug!(
            subject = %subject,
            normalized = %normalized,
            serial = ?bundle.leaf_info().serial,
            "issued leaf certificate"
        );
        Ok(bundle)
    }
}
