use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::domain::collection::{Catalogue, CollectionDefinition};
use crate::error::{MediaError, MediaResult};

/// Resolves an owner type name to the collections and derivations it declares.
pub trait Registry: Send + Sync {
    fn resolve_owner_type(&self, name: &str) -> MediaResult<Catalogue>;
}

/// Registry assembled at start-up, by hand or from the library config file.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    owner_types: HashMap<String, Catalogue>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, owner_type: impl Into<String>, catalogue: Catalogue) -> Self {
        self.owner_types.insert(owner_type.into(), catalogue);
        self
    }

    pub fn owner_types(&self) -> impl Iterator<Item = &str> {
        self.owner_types.keys().map(String::as_str)
    }
}

impl Registry for StaticRegistry {
    fn resolve_owner_type(&self, name: &str) -> MediaResult<Catalogue> {
        self.owner_types
            .get(name)
            .cloned()
            .ok_or_else(|| MediaError::not_found(format!("owner type {}", name)))
    }
}

/// Process-lifetime owner type → catalogue cache.
///
/// Entries are filled lazily on first use and kept for the life of the
/// process. `invalidate` and `clear` exist for hosts that reload their
/// registry; nothing in the pipeline calls them.
pub struct CatalogueCache {
    registry: Arc<dyn Registry>,
    entries: RwLock<HashMap<String, Arc<Catalogue>>>,
}

impl CatalogueCache {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, owner_type: &str) -> MediaResult<Arc<Catalogue>> {
        if let Some(catalogue) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner_type)
        {
            return Ok(catalogue.clone());
        }

        let catalogue = Arc::new(self.registry.resolve_owner_type(owner_type)?);
        debug!(owner_type, "catalogue cached");
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .entry(owner_type.to_string())
            .or_insert(catalogue)
            .clone())
    }

    /// Collection definition for `owner_type`, or an unrestricted one when
    /// the owner type declares no collection by that name.
    pub fn collection(&self, owner_type: &str, name: &str) -> MediaResult<CollectionDefinition> {
        let catalogue = self.resolve(owner_type)?;
        Ok(catalogue
            .collection(name)
            .cloned()
            .unwrap_or_else(|| CollectionDefinition::unrestricted(name)))
    }

    pub fn invalidate(&self, owner_type: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(owner_type);
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
