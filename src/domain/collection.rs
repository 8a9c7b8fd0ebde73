use serde::{Deserialize, Serialize};

/// A named, policy-governed bucket of media per owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDefinition {
    pub name: String,
    /// `None` accepts any type. Entries may use a `type/*` wildcard.
    #[serde(default)]
    pub accepts: Option<Vec<String>>,
    #[serde(default)]
    pub single_slot: bool,
    #[serde(default)]
    pub max_files: Option<usize>,
    #[serde(default)]
    pub max_size: Option<u64>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default = "default_true")]
    pub verify_content: bool,
    #[serde(default)]
    pub fallback_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl CollectionDefinition {
    /// Collection with no restrictions, used when an owner type declares none by that name.
    pub fn unrestricted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accepts: None,
            single_slot: false,
            max_files: None,
            max_size: None,
            backend: None,
            verify_content: true,
            fallback_url: None,
        }
    }

    pub fn accepts_mime(&self, mime: &str) -> bool {
        let accepted = match &self.accepts {
            Some(accepted) => accepted,
            None => return true,
        };
        accepted.iter().any(|pattern| mime_matches(pattern, mime))
    }
}

fn mime_matches(pattern: &str, mime: &str) -> bool {
    if pattern == "*/*" || pattern.eq_ignore_ascii_case(mime) {
        return true;
    }
    match pattern.strip_suffix("/*") {
        Some(major) => mime
            .split_once('/')
            .map_or(false, |(candidate, _)| candidate.eq_ignore_ascii_case(major)),
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// Scale to fit inside the bounds, keeping aspect ratio.
    #[default]
    Contain,
    /// Scale to cover the bounds, cropping the overflow.
    Cover,
    /// Stretch to the exact bounds, ignoring aspect ratio.
    Fill,
    /// Cut the exact bounds out of the center without scaling.
    Crop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Original,
    Jpeg,
    Png,
    Webp,
}

impl OutputFormat {
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Original => None,
            Self::Jpeg => Some("jpg"),
            Self::Png => Some("png"),
            Self::Webp => Some("webp"),
        }
    }

    pub fn mime(&self) -> Option<&'static str> {
        match self {
            Self::Original => None,
            Self::Jpeg => Some("image/jpeg"),
            Self::Png => Some("image/png"),
            Self::Webp => Some("image/webp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationSpec {
    pub name: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub fit: FitMode,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub format: OutputFormat,
    /// Empty applies to every collection.
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub responsive: bool,
}

fn default_quality() -> u8 {
    90
}

impl DerivationSpec {
    pub fn applies_to(&self, collection: &str) -> bool {
        self.collections.is_empty() || self.collections.iter().any(|name| name == collection)
    }
}

/// Everything an owner type declares: its collections and derivations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalogue {
    #[serde(default)]
    pub collections: Vec<CollectionDefinition>,
    #[serde(default)]
    pub derivations: Vec<DerivationSpec>,
}

impl Catalogue {
    pub fn collection(&self, name: &str) -> Option<&CollectionDefinition> {
        self.collections.iter().find(|collection| collection.name == name)
    }

    /// Derivations for `collection`, narrowed to `names` when given.
    pub fn derivations_for(&self, collection: &str, names: Option<&[String]>) -> Vec<DerivationSpec> {
        self.derivations
            .iter()
            .filter(|spec| spec.applies_to(collection))
            .filter(|spec| names.map_or(true, |names| names.iter().any(|name| *name == spec.name)))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_accepts_major_type() {
        let mut collection = CollectionDefinition::unrestricted("images");
        collection.accepts = Some(vec!["image/*".into(), "application/pdf".into()]);

        assert!(collection.accepts_mime("image/png"));
        assert!(collection.accepts_mime("application/pdf"));
        assert!(!collection.accepts_mime("video/mp4"));
    }

    #[test]
    fn derivations_filtered_by_collection_and_names() {
        let spec = |name: &str, collections: &[&str]| DerivationSpec {
            name: name.into(),
            width: Some(100),
            height: None,
            fit: FitMode::Contain,
            quality: 80,
            format: OutputFormat::Original,
            collections: collections.iter().map(|c| c.to_string()).collect(),
            responsive: false,
        };
        let catalogue = Catalogue {
            collections: vec![],
            derivations: vec![spec("thumb", &[]), spec("banner", &["gallery"]), spec("square", &["avatar"])],
        };

        let names: Vec<_> = catalogue
            .derivations_for("gallery", None)
            .into_iter()
            .map(|spec| spec.name)
            .collect();
        assert_eq!(names, vec!["thumb", "banner"]);

        let only = vec!["banner".to_string()];
        let names: Vec<_> = catalogue
            .derivations_for("gallery", Some(&only))
            .into_iter()
            .map(|spec| spec.name)
            .collect();
        assert_eq!(names, vec!["banner"]);
    }
}
