//! Page encoding: enhanced `Page` → image bytes + base64 text.
//!
//! This is a pure format boundary; enhancement never knows how its output is
//! shipped. PNG is the default because it is lossless: JPEG ringing around
//! thin dimension lines and small tolerance text is exactly the detail the
//! vision backends need to read. `PageFormat::Jpeg` exists for
//! bandwidth-constrained backends.

use crate::error::DrawingError;
use crate::pipeline::render::Page;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

/// Transport format of an encoded page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageFormat {
    #[default]
    Png,
    Jpeg {
        quality: u8,
    },
}

impl PageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            PageFormat::Png => "image/png",
            PageFormat::Jpeg { .. } => "image/jpeg",
        }
    }
}

/// A page serialised for transport. Carries no semantics beyond the raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPage {
    pub page_index: usize,
    pub width: u32,
    pub height: u32,
    pub mime_type: &'static str,
    pub bytes: Vec<u8>,
    pub base64: String,
}

impl EncodedPage {
    /// Wrap as an `edgequake_llm` image attachment.
    ///
    /// `detail: "high"` lets OpenAI-style backends tile the full-resolution
    /// page instead of a single 512 px overview, which loses dimension text.
    pub fn to_image_data(&self) -> ImageData {
        ImageData::new(self.base64.clone(), self.mime_type).with_detail("high")
    }

    /// `data:` URL form used by the reasoning backend.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

/// Encode a page as PNG.
pub fn encode(page: &Page) -> Result<EncodedPage, DrawingError> {
    encode_as(page, PageFormat::Png)
}

/// Encode a page in the requested transport format.
pub fn encode_as(page: &Page, format: PageFormat) -> Result<EncodedPage, DrawingError> {
    let mut buf = Vec::new();
    let err = |e: image::ImageError| DrawingError::EncodingFailed {
        page: page.index,
        detail: e.to_string(),
    };

    match format {
        PageFormat::Png => {
            page.image
                .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
                .map_err(err)?;
        }
        PageFormat::Jpeg { quality } => {
            JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
                .encode_image(&page.image)
                .map_err(err)?;
        }
    }

    let base64 = STANDARD.encode(&buf);
    debug!(
        "Encoded page {} → {} bytes {} ({} base64)",
        page.index,
        buf.len(),
        format.mime_type(),
        base64.len()
    );

    Ok(EncodedPage {
        page_index: page.index,
        width: page.width(),
        height: page.height(),
        mime_type: format.mime_type(),
        bytes: buf,
        base64,
    })
}

/// Decode a transport payload back into a raster.
pub fn decode_payload(base64: &str) -> Result<DynamicImage, DrawingError> {
    let bytes = STANDARD
        .decode(base64)
        .map_err(|e| DrawingError::DecodeFailed {
            filename: "<payload>".into(),
            detail: e.to_string(),
        })?;
    image::load_from_memory(&bytes).map_err(|e| DrawingError::DecodeFailed {
        filename: "<payload>".into(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn page(w: u32, h: u32) -> Page {
        Page::new(3, RgbImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, 128])))
    }

    #[test]
    fn png_payload_keeps_dimensions_and_pixels() {
        let p = page(37, 21);
        let enc = encode(&p).unwrap();
        assert_eq!(enc.mime_type, "image/png");
        assert_eq!((enc.width, enc.height), (37, 21));
        assert_eq!(enc.page_index, 3);

        let back = decode_payload(&enc.base64).unwrap();
        assert_eq!((back.width(), back.height()), (37, 21));
        assert_eq!(back.to_rgb8(), p.image);
    }

    #[test]
    fn jpeg_payload_keeps_dimensions() {
        let enc = encode_as(&page(40, 30), PageFormat::Jpeg { quality: 85 }).unwrap();
        assert_eq!(enc.mime_type, "image/jpeg");
        let back = decode_payload(&enc.base64).unwrap();
        assert_eq!((back.width(), back.height()), (40, 30));
    }

    #[test]
    fn image_data_and_data_url() {
        let enc = encode(&page(4, 4)).unwrap();
        let data = enc.to_image_data();
        assert_eq!(data.mime_type, "image/png");
        assert_eq!(data.data, enc.base64);
        assert!(enc.data_url().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn bad_payload_is_rejected() {
        assert!(decode_payload("!!!not base64").is_err());
    }
}
