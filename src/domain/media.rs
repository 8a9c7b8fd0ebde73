use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

/// The entity a media item is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub owner_type: String,
    pub owner_id: String,
}

impl OwnerRef {
    pub fn new(owner_type: impl Into<String>, owner_id: impl fmt::Display) -> Self {
        Self {
            owner_type: owner_type.into(),
            owner_id: owner_id.to_string(),
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_type, self.owner_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Sha512,
    Md5,
}

impl ChecksumAlgorithm {
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            "md5" => Some(Self::Md5),
            _ => None,
        }
    }

    pub fn as_db(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Md5 => "md5",
        }
    }
}

/// Completion marker for one derivation of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedArtifact {
    pub path: String,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsiveVariant {
    pub width: u32,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: Uuid,
    pub owner: OwnerRef,
    pub collection: String,
    pub file_name: String,
    pub storage_name: String,
    pub mime_type: String,
    pub backend: String,
    pub size: i64,
    pub checksum: Option<String>,
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
    pub custom_properties: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub derived: BTreeMap<String, DerivedArtifact>,
    pub responsive: BTreeMap<String, Vec<ResponsiveVariant>>,
    pub order_index: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl MediaRecord {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// `{collection}/{ownerId}/{filename}`
    pub fn original_path(&self) -> String {
        original_path(&self.collection, &self.owner.owner_id, &self.storage_name)
    }

    /// Storage name without its extension.
    pub fn stem(&self) -> &str {
        file_stem(&self.storage_name)
    }

    /// `{collection}/{ownerId}/{derivationName}/{stem}.{ext}`
    pub fn derived_path(&self, derivation: &str, extension: &str) -> String {
        format!(
            "{}/{}/{}/{}.{}",
            self.collection,
            self.owner.owner_id,
            derivation,
            self.stem(),
            extension
        )
    }

    pub fn responsive_path(&self, name: &str, width: u32, file_name: &str) -> String {
        format!(
            "{}/{}/responsive/{}/{}/{}",
            self.collection, self.owner.owner_id, name, width, file_name
        )
    }

    /// Every backend object this record references.
    pub fn all_paths(&self) -> Vec<String> {
        let mut paths = vec![self.original_path()];
        paths.extend(self.derived.values().map(|artifact| artifact.path.clone()));
        paths.extend(
            self.responsive
                .values()
                .flat_map(|variants| variants.iter().map(|variant| variant.path.clone())),
        );
        paths
    }

    pub fn extension(&self) -> Option<&str> {
        self.storage_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
    }
}

pub fn original_path(collection: &str, owner_id: &str, storage_name: &str) -> String {
    format!("{}/{}/{}", collection, owner_id, storage_name)
}

fn file_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Fields a caller may change on an existing record.
#[derive(Debug, Clone, Default)]
pub struct RecordChanges {
    pub file_name: Option<String>,
    pub custom_properties: Option<Map<String, Value>>,
    pub metadata: Option<Map<String, Value>>,
}

impl RecordChanges {
    pub fn apply(&self, record: &mut MediaRecord) {
        if let Some(file_name) = &self.file_name {
            record.file_name = file_name.clone();
        }
        if let Some(custom_properties) = &self.custom_properties {
            record.custom_properties = custom_properties.clone();
        }
        if let Some(metadata) = &self.metadata {
            record.metadata = metadata.clone();
        }
    }
}
