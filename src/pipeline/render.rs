//! Image normalisation: decode a [`RawDrawing`] into RGB [`Page`]s.
//!
//! PDFs are rasterised with pdfium; everything else goes through the `image`
//! crate. Both paths run inside `spawn_blocking`: pdfium keeps thread-local
//! state and is not safe to drive from async tasks, and decoding a large
//! scan is CPU-bound either way.
//!
//! PDF pages are rendered at `dpi` (default 400) and then capped so neither
//! edge exceeds `max_rendered_pixels`. An A0 sheet at 400 DPI would
//! otherwise be roughly 13 000 × 18 700 px.

use crate::config::AnalysisConfig;
use crate::error::DrawingError;
use crate::pipeline::input::{MediaKind, RawDrawing};
use image::{DynamicImage, RgbImage};
use pdfium_render::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info};

/// One rasterised drawing sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// 1-based, stable across a multi-page source.
    pub index: usize,
    pub image: RgbImage,
}

impl Page {
    pub fn new(index: usize, image: RgbImage) -> Self {
        Self { index, image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Decode every page of the drawing.
///
/// A raster image always yields exactly one page with index 1.
pub async fn decode_pages(
    raw: &RawDrawing,
    config: &AnalysisConfig,
) -> Result<Vec<Page>, DrawingError> {
    let (pages, _) = decode_blocking(raw, config, None).await?;
    Ok(pages)
}

/// Decode only page `page` (1-based), returning it with the total page count.
pub async fn decode_page(
    raw: &RawDrawing,
    config: &AnalysisConfig,
    page: usize,
) -> Result<(Page, usize), DrawingError> {
    let (mut pages, total) = decode_blocking(raw, config, Some(page)).await?;
    match pages.pop() {
        Some(p) => Ok((p, total)),
        None => Err(DrawingError::PageOutOfRange { page, total }),
    }
}

async fn decode_blocking(
    raw: &RawDrawing,
    config: &AnalysisConfig,
    only: Option<usize>,
) -> Result<(Vec<Page>, usize), DrawingError> {
    let bytes = raw.bytes.clone();
    let filename = raw.filename.clone();
    let kind = raw.kind;
    let dpi = config.dpi;
    let max_pixels = config.max_rendered_pixels;

    tokio::task::spawn_blocking(move || {
        decode_sync(&filename, &bytes, kind, dpi, max_pixels, only)
    })
    .await
    .map_err(|e| DrawingError::Internal(format!("Decode task panicked: {}", e)))?
}

/// Synchronous decode, shared by both entry points.
///
/// `only` selects a single 1-based page; `None` renders every page.
pub fn decode_sync(
    filename: &str,
    bytes: &[u8],
    kind: MediaKind,
    dpi: u32,
    max_pixels: u32,
    only: Option<usize>,
) -> Result<(Vec<Page>, usize), DrawingError> {
    if is_pdf(bytes) {
        return render_pdf(bytes, dpi, max_pixels, only);
    }

    match image::load_from_memory(bytes) {
        Ok(img) => {
            if let Some(p) = only {
                if p != 1 {
                    return Err(DrawingError::PageOutOfRange { page: p, total: 1 });
                }
            }
            debug!(
                "Decoded image '{}' → {}x{} ({:?})",
                filename,
                img.width(),
                img.height(),
                img.color()
            );
            Ok((vec![Page::new(1, to_rgb(img))], 1))
        }
        Err(e) => {
            let detail = match kind {
                MediaKind::Pdf => format!("missing %PDF header; not an image either ({e})"),
                MediaKind::Image => e.to_string(),
            };
            Err(DrawingError::DecodeFailed {
                filename: filename.to_string(),
                detail,
            })
        }
    }
}

fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF")
}

/// Explicit colour-depth normalisation to 8-bit RGB.
///
/// * grayscale → the luma value replicated into all three channels
/// * RGBA / LumaA → alpha dropped, colour kept as-is (no compositing)
/// * anything else (16-bit, float) → the `image` crate's own RGB conversion
pub fn to_rgb(img: DynamicImage) -> RgbImage {
    match img {
        DynamicImage::ImageRgb8(rgb) => rgb,
        DynamicImage::ImageLuma8(gray) => {
            let (w, h) = gray.dimensions();
            RgbImage::from_fn(w, h, |x, y| {
                let v = gray.get_pixel(x, y)[0];
                image::Rgb([v, v, v])
            })
        }
        DynamicImage::ImageLumaA8(gray) => {
            let (w, h) = gray.dimensions();
            RgbImage::from_fn(w, h, |x, y| {
                let v = gray.get_pixel(x, y)[0];
                image::Rgb([v, v, v])
            })
        }
        DynamicImage::ImageRgba8(rgba) => {
            let (w, h) = rgba.dimensions();
            RgbImage::from_fn(w, h, |x, y| {
                let p = rgba.get_pixel(x, y);
                image::Rgb([p[0], p[1], p[2]])
            })
        }
        other => other.to_rgb8(),
    }
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// Bind to pdfium: `PDFIUM_LIB_PATH` (file or directory) first, then the
/// system library.
fn bind_pdfium() -> Result<Pdfium, DrawingError> {
    let bindings = match std::env::var_os("PDFIUM_LIB_PATH") {
        Some(p) => {
            let path = PathBuf::from(p);
            let lib = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&path)
            } else {
                path
            };
            Pdfium::bind_to_library(&lib).map_err(|e| {
                DrawingError::PdfiumBindingFailed(format!("{}: {}", lib.display(), e))
            })?
        }
        None => Pdfium::bind_to_system_library()
            .map_err(|e| DrawingError::PdfiumBindingFailed(e.to_string()))?,
    };
    Ok(Pdfium::new(bindings))
}

fn render_pdf(
    bytes: &[u8],
    dpi: u32,
    max_pixels: u32,
    only: Option<usize>,
) -> Result<(Vec<Page>, usize), DrawingError> {
    let pdfium = bind_pdfium()?;

    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| DrawingError::RasterisationFailed {
            page: 0,
            detail: format!("{:?}", e),
        })?;

    let pages = document.pages();
    let total = pages.len() as usize;
    info!("PDF loaded: {} pages", total);

    let indices: Vec<usize> = match only {
        Some(p) if p == 0 || p > total => {
            return Err(DrawingError::PageOutOfRange { page: p, total })
        }
        Some(p) => vec![p - 1],
        None => (0..total).collect(),
    };

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut out = Vec::with_capacity(indices.len());
    for idx in indices {
        let page = pages
            .get(idx as u16)
            .map_err(|e| DrawingError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?;

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            DrawingError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            }
        })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        out.push(Page::new(idx + 1, to_rgb(image)));
    }

    Ok((out, total))
}
