//! Public certificate authority facade.

use std::sync::Arc;

use tracing::info;

use crate::bundle::CertBundle;
use crate::cache::{CacheStats, CertificateCache};
use crate::config::CaConfig;
use crate::error::CaError;
use crate::issuer::LeafIssuer;
use crate::root::{RootCertificate, RootMaterial};
use crate::store::{Store, StoreLocator};

/// A root CA plus a cache of leaf certificates issued from it.
///
/// Each instance owns its root material and cache; nothing is shared
/// between instances. Safe to use from many threads at once.
pub struct CaService {
    root: Arc<RootMaterial>,
    cache: CertificateCache<LeafIssuer>,
    store: Option<Store>,
}

impl CaService {
    /// Load or create a root CA under `path` with default settings.
    ///
    /// An empty path selects `~/.sniffy`; relative paths resolve against the
    /// working directory.
    pub fn new_persistent(path: &str) -> Result<Self, CaError> {
        Self::new_persistent_with(path, &StoreLocator::from_env(), &CaConfig::default())
    }

    pub fn new_persistent_with(
        path: &str,
        locator: &StoreLocator,
        config: &CaConfig,
    ) -> Result<Self, CaError> {
        config.validate()?;
        let store = Store::open(locator, path)?;
        let root = store.load_or_create(config)?;
        Self::build(root, config, Some(store))
    }

    /// A CA whose root lives only in memory.
    pub fn new_in_memory() -> Result<Self, CaError> {
        Self::new_in_memory_with(&CaConfig::default())
    }

    pub fn new_in_memory_with(config: &CaConfig) -> Result<Self, CaError> {
        config.validate()?;
        let root = RootMaterial::generate(config)?;
        Self::build(root, config, None)
    }

    /// Persistent CA at the configured storage directory, or the default
    /// location when none is set.
    pub fn from_config(config: &CaConfig, locator: &StoreLocator) -> Result<Self, CaError> {
        let path = config.storage_dir.as_deref().unwrap_or_default();
        Self::new_persistent_with(path, locator, config)
    }

    fn build(root: RootMaterial, config: &CaConfig, store: Option<Store>) -> Result<Self, CaError> {
        let root = Arc::new(root);
        let cache = CertificateCache::new(
            LeafIssuer::new(Arc::clone(&root), config),
            config.capacity()?,
        );
        info!(
            fingerprint = %root.certificate().fingerprint(),
            capacity = config.cache_capacity,
            persistent = store.is_some(),
            "certificate authority ready"
        );
        Ok(Self { root, cache, store })
    }

    /// The root certificate, for distribution to clients that must trust
    /// this CA.
    pub fn root_certificate(&self) -> &RootCertificate {
        self.root.certificate()
    }

    /// Issue, or fetch from cache, a leaf certificate for `subject`.
    pub fn issue_certificate(&self, subject: &str) -> Result<Arc<CertBundle>, CaError> {
        self.cache.get_or_issue(subject)
    }

    /// Whether a leaf for `subject` is currently cached.
    pub fn is_cached(&self, subject: &str) -> bool {
        self.cache.contains(subject)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The backing store, if this CA is persistent.
    pub fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }
}

impl std::fmt::Debug for CaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaService")
            .field("root", &self.root)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
