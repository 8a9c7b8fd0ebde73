//! The library file: storage backends, checksum and responsive settings, and
//! the owner-type catalogue, loaded once at start-up.
//!
//! ```toml
//! default_backend = "media"
//! checksum = "sha256"
//!
//! [backends.media]
//! adapter = "local"
//! root = "/var/lib/media"
//! base_url = "https://cdn.example.com/media"
//!
//! [responsive]
//! policy = "breakpoints"
//! widths = [320, 640, 1280]
//!
//! [owner_types.post]
//! collections = [{ name = "cover", single_slot = true, accepts = ["image/*"] }]
//! derivations = [{ name = "thumb", width = 200, height = 200, fit = "cover", collections = ["cover"] }]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::app::registry::StaticRegistry;
use crate::app::responsive::ResponsivePolicy;
use crate::domain::collection::Catalogue;
use crate::domain::media::ChecksumAlgorithm;
use crate::infra::storage::BackendConfig;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LibraryFile {
    pub default_backend: String,
    pub backends: BTreeMap<String, BackendConfig>,
    #[serde(default = "default_checksum")]
    pub checksum: Option<ChecksumAlgorithm>,
    #[serde(default)]
    pub responsive: ResponsivePolicy,
    #[serde(default)]
    pub owner_types: BTreeMap<String, Catalogue>,
}

fn default_checksum() -> Option<ChecksumAlgorithm> {
    Some(ChecksumAlgorithm::default())
}

impl LibraryFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| anyhow!("cannot read library config {}: {}", path.display(), err))?;
        Self::parse(&contents).map_err(|err| anyhow!("{}: {}", path.display(), err))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let file: Self = toml::from_str(contents).map_err(|err| anyhow!("invalid library config: {}", err))?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        if !self.backends.contains_key(&self.default_backend) {
            return Err(anyhow!("default backend {} is not configured", self.default_backend));
        }
        for (owner_type, catalogue) in &self.owner_types {
            for collection in &catalogue.collections {
                if let Some(backend) = &collection.backend {
                    if !self.backends.contains_key(backend) {
                        return Err(anyhow!(
                            "collection {}.{} uses unknown backend {}",
                            owner_type,
                            collection.name,
                            backend
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> StaticRegistry {
        self.owner_types
            .iter()
            .fold(StaticRegistry::new(), |registry, (name, catalogue)| {
                registry.register(name.clone(), catalogue.clone())
            })
    }
}
