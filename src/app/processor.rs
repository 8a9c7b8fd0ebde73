use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::domain::collection::{DerivationSpec, OutputFormat};

/// Encoded output of one image operation.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub extension: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Image-processing capability used by derivations and metadata extraction.
pub trait ImageProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn dimensions(&self, source: &[u8]) -> Result<(u32, u32)>;

    fn derive(&self, source: &[u8], spec: &DerivationSpec) -> Result<Rendered>;

    /// Scale to `width`, keeping aspect ratio. Never upscales.
    fn resize_to_width(&self, source: &[u8], width: u32, format: OutputFormat, quality: u8) -> Result<Rendered>;
}

/// Used when the crate is built without an image backend.
pub struct UnsupportedProcessor;

impl ImageProcessor for UnsupportedProcessor {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn dimensions(&self, _source: &[u8]) -> Result<(u32, u32)> {
        Err(anyhow!("image processing is not available in this build"))
    }

    fn derive(&self, _source: &[u8], _spec: &DerivationSpec) -> Result<Rendered> {
        Err(anyhow!("image processing is not available in this build"))
    }

    fn resize_to_width(&self, _source: &[u8], _width: u32, _format: OutputFormat, _quality: u8) -> Result<Rendered> {
        Err(anyhow!("image processing is not available in this build"))
    }
}

pub fn default_processor() -> Arc<dyn ImageProcessor> {
    #[cfg(feature = "raster")]
    {
        Arc::new(raster::RasterProcessor)
    }
    #[cfg(not(feature = "raster"))]
    {
        Arc::new(UnsupportedProcessor)
    }
}

/// Target box for a spec against a source of `width`×`height`; a missing
/// side follows the source aspect ratio.
pub fn target_bounds(spec: &DerivationSpec, width: u32, height: u32) -> (u32, u32) {
    let scale = |value: u32, numerator: u32, denominator: u32| -> u32 {
        if denominator == 0 {
            return value.max(1);
        }
        ((value as u64 * numerator as u64 + denominator as u64 / 2) / denominator as u64).max(1) as u32
    };
    match (spec.width, spec.height) {
        (Some(w), Some(h)) => (w.max(1), h.max(1)),
        (Some(w), None) => (w.max(1), scale(height, w, width)),
        (None, Some(h)) => (scale(width, h, height), h.max(1)),
        (None, None) => (width.max(1), height.max(1)),
    }
}

#[cfg(feature = "raster")]
pub mod raster {
    use std::io::Cursor;

    use anyhow::{anyhow, Result};
    use image::codecs::jpeg::JpegEncoder;
    use image::codecs::png::PngEncoder;
    use image::codecs::webp::WebPEncoder;
    use image::imageops::FilterType;
    use image::{DynamicImage, ImageFormat, ImageReader};

    use super::{target_bounds, ImageProcessor, Rendered};
    use crate::domain::collection::{DerivationSpec, FitMode, OutputFormat};

    /// Decoding, resizing and encoding through the `image` crate.
    pub struct RasterProcessor;

    impl RasterProcessor {
        fn decode(source: &[u8]) -> Result<(DynamicImage, ImageFormat)> {
            let format = image::guess_format(source).map_err(|err| anyhow!("unknown image format: {}", err))?;
            let decoded = image::load_from_memory_with_format(source, format)
                .map_err(|err| anyhow!("failed to decode image: {}", err))?;
            Ok((decoded, format))
        }
    }

    impl ImageProcessor for RasterProcessor {
        fn name(&self) -> &'static str {
            "raster"
        }

        fn dimensions(&self, source: &[u8]) -> Result<(u32, u32)> {
            let reader = ImageReader::new(Cursor::new(source)).with_guessed_format()?;
            Ok(reader.into_dimensions()?)
        }

        fn derive(&self, source: &[u8], spec: &DerivationSpec) -> Result<Rendered> {
            let (image, source_format) = Self::decode(source)?;
            let (width, height) = target_bounds(spec, image.width(), image.height());

            let shaped = match spec.fit {
                FitMode::Contain => image.resize(width, height, FilterType::Lanczos3),
                FitMode::Cover => image.resize_to_fill(width, height, FilterType::Lanczos3),
                FitMode::Fill => image.resize_exact(width, height, FilterType::Lanczos3),
                FitMode::Crop => {
                    let crop_width = width.min(image.width());
                    let crop_height = height.min(image.height());
                    image.crop_imm(
                        (image.width() - crop_width) / 2,
                        (image.height() - crop_height) / 2,
                        crop_width,
                        crop_height,
                    )
                }
            };

            encode(&shaped, spec.format, source_format, spec.quality)
        }

        fn resize_to_width(&self, source: &[u8], width: u32, format: OutputFormat, quality: u8) -> Result<Rendered> {
            let (image, source_format) = Self::decode(source)?;
            let resized = if width >= image.width() {
                image
            } else {
                image.resize(width, u32::MAX, FilterType::Lanczos3)
            };
            encode(&resized, format, source_format, quality)
        }
    }

    fn encode(image: &DynamicImage, format: OutputFormat, source: ImageFormat, quality: u8) -> Result<Rendered> {
        let target = match format {
            OutputFormat::Jpeg => ImageFormat::Jpeg,
            OutputFormat::Png => ImageFormat::Png,
            OutputFormat::Webp => ImageFormat::WebP,
            OutputFormat::Original => match source {
                ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP => source,
                _ => ImageFormat::Png,
            },
        };

        let mut bytes = Vec::new();
        let (mime, extension) = match target {
            ImageFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
                DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
                ("image/jpeg", "jpg")
            }
            ImageFormat::WebP => {
                let encoder = WebPEncoder::new_lossless(&mut bytes);
                DynamicImage::ImageRgba8(image.to_rgba8()).write_with_encoder(encoder)?;
                ("image/webp", "webp")
            }
            _ => {
                image.write_with_encoder(PngEncoder::new(&mut bytes))?;
                ("image/png", "png")
            }
        };

        Ok(Rendered {
            bytes,
            mime,
            extension,
            width: image.width(),
            height: image.height(),
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use image::{Rgb, RgbImage};

        fn png(width: u32, height: u32) -> Vec<u8> {
            let image = RgbImage::from_pixel(width, height, Rgb([200, 40, 40]));
            let mut bytes = Vec::new();
            DynamicImage::ImageRgb8(image)
                .write_with_encoder(PngEncoder::new(&mut bytes))
                .unwrap();
            bytes
        }

        fn spec(width: u32, height: u32, fit: FitMode, format: OutputFormat) -> DerivationSpec {
            DerivationSpec {
                name: "thumb".into(),
                width: Some(width),
                height: Some(height),
                fit,
                quality: 80,
                format,
                collections: vec![],
                responsive: false,
            }
        }

        #[test]
        fn fit_modes_produce_expected_dimensions() {
            let source = png(400, 200);
            let cases = [
                (FitMode::Contain, (100, 50)),
                (FitMode::Cover, (100, 100)),
                (FitMode::Fill, (100, 100)),
                (FitMode::Crop, (100, 100)),
            ];
            for (fit, expected) in cases {
                let rendered = RasterProcessor
                    .derive(&source, &spec(100, 100, fit, OutputFormat::Original))
                    .unwrap();
                assert_eq!((rendered.width, rendered.height), expected, "{:?}", fit);
                assert_eq!(rendered.mime, "image/png");
            }
        }

        #[test]
        fn crop_is_clamped_to_source() {
            let source = png(60, 40);
            let rendered = RasterProcessor
                .derive(&source, &spec(100, 100, FitMode::Crop, OutputFormat::Jpeg))
                .unwrap();
            assert_eq!((rendered.width, rendered.height), (60, 40));
            assert_eq!(rendered.extension, "jpg");
            assert_eq!(&rendered.bytes[..3], b"\xFF\xD8\xFF");
        }

        #[test]
        fn resize_to_width_keeps_aspect_and_never_upscales() {
            let source = png(800, 400);
            let half = RasterProcessor
                .resize_to_width(&source, 400, OutputFormat::Webp, 90)
                .unwrap();
            assert_eq!((half.width, half.height), (400, 200));
            assert_eq!(half.mime, "image/webp");

            let same = RasterProcessor
                .resize_to_width(&source, 1600, OutputFormat::Original, 90)
                .unwrap();
            assert_eq!((same.width, same.height), (800, 400));
        }

        #[test]
        fn dimensions_from_header() {
            assert_eq!(RasterProcessor.dimensions(&png(33, 21)).unwrap(), (33, 21));
            assert!(RasterProcessor.dimensions(b"not an image").is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::collection::FitMode;

    #[test]
    fn missing_side_follows_aspect_ratio() {
        let mut spec = DerivationSpec {
            name: "w".into(),
            width: Some(300),
            height: None,
            fit: FitMode::Contain,
            quality: 80,
            format: OutputFormat::Original,
            collections: vec![],
            responsive: false,
        };
        assert_eq!(target_bounds(&spec, 1200, 800), (300, 200));

        spec.width = None;
        spec.height = Some(100);
        assert_eq!(target_bounds(&spec, 1200, 800), (150, 100));

        spec.height = None;
        assert_eq!(target_bounds(&spec, 1200, 800), (1200, 800));
    }

    #[test]
    fn unsupported_processor_fails_cleanly() {
        assert!(UnsupportedProcessor.dimensions(b"\x89PNG").is_err());
    }
}
