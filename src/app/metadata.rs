use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Map, Value};

use crate::app::processor::ImageProcessor;

/// Best-effort metadata read from the leading bytes of an upload.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, mime: &str, sample: &[u8]) -> Result<Map<String, Value>>;
}

/// Pixel dimensions for image types, read through the image processor.
pub struct ImageMetadata {
    processor: Arc<dyn ImageProcessor>,
}

impl ImageMetadata {
    pub fn new(processor: Arc<dyn ImageProcessor>) -> Self {
        Self { processor }
    }
}

impl MetadataExtractor for ImageMetadata {
    fn extract(&self, mime: &str, sample: &[u8]) -> Result<Map<String, Value>> {
        let mut metadata = Map::new();
        if !mime.starts_with("image/") || mime == "image/svg+xml" {
            return Ok(metadata);
        }
        let (width, height) = self.processor.dimensions(sample)?;
        metadata.insert("width".into(), json!(width));
        metadata.insert("height".into(), json!(height));
        Ok(metadata)
    }
}

pub struct NoMetadata;

impl MetadataExtractor for NoMetadata {
    fn extract(&self, _mime: &str, _sample: &[u8]) -> Result<Map<String, Value>> {
        Ok(Map::new())
    }
}
