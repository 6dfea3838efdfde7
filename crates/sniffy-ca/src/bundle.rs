//! Issued leaf certificate bundles.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use time::OffsetDateTime;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::CryptoError;

/// Fields of the leaf certificate a caller typically inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub serial: Vec<u8>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl LeafInfo {
    fn parse(der: &[u8]) -> Result<Self, CryptoError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| CryptoError::new(format!("issued certificate is unparsable: {e}")))?;

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        let san = cert
            .subject_alternative_name()
            .map_err(|e| CryptoError::new(format!("issued certificate has a bad SAN: {e}")))?;
        if let Some(san) = san {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push((*dns).to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_octets(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string);

        Ok(Self {
            common_name,
            dns_names,
            ip_addresses,
            serial: cert.tbs_certificate.raw_serial().to_vec(),
            not_before: cert.validity().not_before.to_datetime(),
            not_after: cert.validity().not_after.to_datetime(),
        })
    }
}

fn ip_from_octets(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
        return Some(IpAddr::V4(Ipv4Addr::from(v4)));
    }
    <[u8; 16]>::try_from(bytes)
        .ok()
        .map(|v6| IpAddr::V6(Ipv6Addr::from(v6)))
}

/// A signed leaf certificate, the root that signed it, and the leaf's
/// private key.
///
/// The chain is always `[leaf, root]`; the two certificates are held as
/// separate fields so the order cannot be violated.
pub struct CertBundle {
    subject: String,
    leaf: CertificateDer<'static>,
    leaf_pem: String,
    root: CertificateDer<'static>,
    root_pem: String,
    key: PrivatePkcs8KeyDer<'static>,
    key_pem: String,
    info: LeafInfo,
}

impl CertBundle {
    pub(crate) fn new(
        subject: &str,
        leaf: CertificateDer<'static>,
        leaf_pem: String,
        root: CertificateDer<'static>,
        root_pem: String,
        key: PrivatePkcs8KeyDer<'static>,
        key_pem: String,
    ) -> Result<Self, CryptoError> {
        let info = LeafInfo::parse(leaf.as_ref())?;
        Ok(Self {
            subject: subject.to_string(),
            leaf,
            leaf_pem,
            root,
            root_pem,
            key,
            key_pem,
            info,
        })
    }

    /// The subject exactly as requested by the caller.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn leaf_der(&self) -> &CertificateDer<'static> {
        &self.leaf
    }

    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root
    }

    /// Certificate chain in presentation order, leaf first.
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.leaf.clone(), self.root.clone()]
    }

    pub fn cert_chain_pem(&self) -> String {
        format!("{}{}", self.leaf_pem, self.root_pem)
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key.clone_key())
    }

    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn leaf_info(&self) -> &LeafInfo {
        &self.info
    }

    /// Chain and signing key in the form a rustls certificate resolver
    /// hands out during a handshake.
    pub fn certified_key(&self) -> Result<CertifiedKey, CryptoError> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&self.private_key())
            .map_err(|e| CryptoError::new(format!("failed to create signing key: {e}")))?;
        Ok(CertifiedKey::new(self.cert_chain(), signing_key))
    }

    /// A rustls server configuration presenting this bundle.
    pub fn server_config(
        &self,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<Arc<ServerConfig>, CryptoError> {
        let tls_err = |e: rustls::Error| CryptoError::new(format!("TLS error: {e}"));
        let mut config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_no_client_auth()
        .with_single_cert(self.cert_chain(), self.private_key())
        .map_err(tls_err)?;
        config.alpn_protocols = alpn_protocols;
        Ok(Arc::new(config))
    }
}

impl PartialEq for CertBundle {
    fn eq(&self, other: &Self) -> bool {
        self.subject == other.subject
            && self.leaf == other.leaf
            && self.root == other.root
            && self.key.secret_pkcs8_der() == other.key.secret_pkcs8_der()
    }
}

impl Eq for CertBundle {}

impl fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertBundle")
            .field("subject", &self.subject)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}
