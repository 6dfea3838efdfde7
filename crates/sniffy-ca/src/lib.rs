//! Self-signed certificate authority for TLS-intercepting proxies.
//!
//! Maintains one root CA, loaded from or persisted to a directory (or held
//! purely in memory), and mints short-lived leaf certificates for arbitrary
//! hostnames and IP addresses on demand. Issued leaves are kept in a bounded
//! LRU cache; concurrent requests for the same subject share one issuance.

pub mod bundle;
pub mod cache;
pub mod config;
pub mod error;
pub mod issuer;
mod keys;
pub mod root;
pub mod service;
pub mod store;
pub mod subject;

pub use bundle::{CertBundle, LeafInfo};
pub use cache::{CacheStats, CertificateCache};
pub use config::{
    load_config, CaConfig, KeyAlgorithm, MAX_LEAF_VALIDITY_DAYS, MAX_ROOT_VALIDITY_YEARS,
};
pub use error::{CaError, CryptoError, ErrorKind};
pub use issuer::{IssueLeaf, LeafIssuer};
pub use root::{RootCertificate, RootMaterial, ROOT_ORGANIZATION};
pub use service::CaService;
pub use store::{Store, StoreLocator, CA_CERT_FILE_NAME, CA_KEY_FILE_NAME};
pub use subject::Subject;
