//! Enhancement engine: denoise → contrast → sharpen, in the grayscale domain.
//!
//! ```text
//!  RGB page ─▶ gray ─▶ NL-means ─▶ CLAHE ─▶ sharpen(profile) ─▶ RGB page
//! ```
//!
//! Dimension text and line work carry no colour information, so every stage
//! runs on a single 8-bit channel and colour is only reconstituted (by channel
//! replication) for vision backends that expect RGB.
//!
//! All stages are pure integer/float arithmetic with a fixed evaluation order,
//! so `enhance` is deterministic: same page + profile ⇒ identical bytes.
//!
//! Denoising dominates the cost. It runs over bands of rows on the rayon
//! pool; a 4096-pixel page still takes several seconds on a few cores.

use crate::config::EnhancementProfile;
use crate::error::DrawingError;
use crate::pipeline::render::Page;
use image::{GrayImage, Luma, Rgb, RgbImage};
use rayon::prelude::*;
use tracing::debug;

// ── Parameters ───────────────────────────────────────────────────────────

/// NL-means filter strength. Higher removes more noise and more detail.
pub const NLM_STRENGTH: f32 = 10.0;
/// NL-means patch radius (7×7 template).
pub const NLM_TEMPLATE_RADIUS: usize = 3;
/// NL-means search radius (11×11 search window).
pub const NLM_SEARCH_RADIUS: isize = 5;
/// Rows per denoise work unit.
const NLM_BAND_ROWS: usize = 64;

/// CLAHE clip limit, relative to a flat histogram.
pub const CLAHE_CLIP_LIMIT: f32 = 2.0;
/// CLAHE tiles per axis.
pub const CLAHE_GRID: u32 = 8;

/// Gaussian sigma of the blurred copy used by the balanced unsharp mask.
pub const UNSHARP_SIGMA: f32 = 3.0;
pub const UNSHARP_AMOUNT: f32 = 1.5;

/// High-pass kernel used by the aggressive profile. Sums to 1.
pub const HIGH_PASS_KERNEL: [[i32; 3]; 3] = [[-1, -1, -1], [-1, 9, -1], [-1, -1, -1]];

/// Pages above this pixel count are refused rather than risking an
/// allocation failure inside a stage.
pub const MAX_ENHANCE_PIXELS: u64 = 64 * 1024 * 1024;

// ── Entry points ─────────────────────────────────────────────────────────

/// Run the full enhancement pipeline for `profile` on one page.
///
/// Fails with [`DrawingError::EnhancementFailed`] naming the stage; a partly
/// enhanced page is never returned.
pub fn enhance(page: Page, profile: EnhancementProfile) -> Result<Page, DrawingError> {
    let index = page.index;
    let (w, h) = page.image.dimensions();

    if w == 0 || h == 0 {
        return Err(DrawingError::EnhancementFailed {
            page: index,
            stage: "denoise",
            detail: format!("empty raster ({w}x{h})"),
        });
    }
    if w as u64 * h as u64 > MAX_ENHANCE_PIXELS {
        return Err(DrawingError::EnhancementFailed {
            page: index,
            stage: "denoise",
            detail: format!("raster too large ({w}x{h})"),
        });
    }

    let gray = rgb_to_gray(&page.image);
    let denoised = denoise(&gray, NLM_STRENGTH).ok_or_else(|| DrawingError::EnhancementFailed {
        page: index,
        stage: "denoise",
        detail: format!("could not assemble denoised raster ({w}x{h})"),
    })?;
    let equalised = clahe(&denoised, CLAHE_CLIP_LIMIT, CLAHE_GRID);
    let sharpened = match profile {
        EnhancementProfile::Fast => equalised,
        EnhancementProfile::Balanced => unsharp_mask(&equalised, UNSHARP_SIGMA, UNSHARP_AMOUNT),
        EnhancementProfile::Aggressive => high_pass(&equalised, &HIGH_PASS_KERNEL),
    };

    debug!("Enhanced page {} ({}x{}, profile={})", index, w, h, profile);
    Ok(Page::new(index, gray_to_rgb(&sharpened)))
}

/// [`enhance`] on the blocking pool, for callers on an async runtime.
pub async fn enhance_page(page: Page, profile: EnhancementProfile) -> Result<Page, DrawingError> {
    let index = page.index;
    tokio::task::spawn_blocking(move || enhance(page, profile))
        .await
        .map_err(|e| DrawingError::EnhancementFailed {
            page: index,
            stage: "enhance",
            detail: format!("task panicked: {e}"),
        })?
}

// ── Colour conversion ────────────────────────────────────────────────────

/// ITU-R BT.601 luma with integer rounding.
pub fn rgb_to_gray(rgb: &RgbImage) -> GrayImage {
    let (w, h) = rgb.dimensions();
    let mut gray = GrayImage::new(w, h);
    for (src, dst) in rgb.pixels().zip(gray.pixels_mut()) {
        let [r, g, b] = src.0;
        let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000;
        *dst = Luma([luma as u8]);
    }
    gray
}

pub fn gray_to_rgb(gray: &GrayImage) -> RgbImage {
    let (w, h) = gray.dimensions();
    let mut rgb = RgbImage::new(w, h);
    for (src, dst) in gray.pixels().zip(rgb.pixels_mut()) {
        let v = src.0[0];
        *dst = Rgb([v, v, v]);
    }
    rgb
}

// ── Denoise ──────────────────────────────────────────────────────────────

/// Non-local-means denoising.
///
/// For every displacement in the search window the squared difference image
/// is summed into an integral image, which gives each pixel's patch distance
/// in O(1). Weights are `exp(-ssd / (patch_area · h²))`, looked up from a
/// table indexed by the integer SSD. Borders clamp to the nearest edge pixel.
///
/// Bands of rows are independent and run in parallel; the result does not
/// depend on how the page is split. `None` for an empty raster.
pub fn denoise(img: &GrayImage, strength: f32) -> Option<GrayImage> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    if w == 0 || h == 0 {
        return None;
    }
    let weights = nlm_weights(strength);
    let src = img.as_raw();

    let mut out = vec![0u8; w * h];
    out.par_chunks_mut(w * NLM_BAND_ROWS)
        .enumerate()
        .for_each(|(band, rows)| denoise_rows(src, w, h, band * NLM_BAND_ROWS, rows, &weights));
    GrayImage::from_raw(img.width(), img.height(), out)
}

/// Weight table indexed by patch SSD, cut off where weights vanish.
fn nlm_weights(strength: f32) -> Vec<f32> {
    let t = NLM_TEMPLATE_RADIUS;
    let patch_area = ((2 * t + 1) * (2 * t + 1)) as f64;
    let denom = patch_area * (strength as f64) * (strength as f64);
    // exp(-30) is below f32 precision relative to the centre weight of 1.
    let cutoff = (denom * 30.0) as usize;
    (0..=cutoff)
        .map(|ssd| (-(ssd as f64) / denom).exp() as f32)
        .collect()
}

/// Denoise the rows starting at `y_start` into `out` (whole rows of width `w`).
fn denoise_rows(src: &[u8], w: usize, h: usize, y_start: usize, out: &mut [u8], weights: &[f32]) {
    let rows = out.len() / w;
    let t = NLM_TEMPLATE_RADIUS;
    let s = NLM_SEARCH_RADIUS;
    let cutoff = weights.len() - 1;

    let clamp = |v: isize, n: usize| -> usize { v.clamp(0, n as isize - 1) as usize };
    let at = |x: isize, y: isize| -> i32 { src[clamp(y, h) * w + clamp(x, w)] as i32 };

    // Integral over the band grown by the template radius on every side.
    let pw = w + 2 * t;
    let ph = rows + 2 * t;
    let stride = pw + 1;
    let mut integral = vec![0u64; stride * (ph + 1)];
    let mut sum_w = vec![0f32; w * rows];
    let mut sum_v = vec![0f32; w * rows];

    for dy in -s..=s {
        for dx in -s..=s {
            for yy in 0..ph {
                let y = (y_start + yy) as isize - t as isize;
                let mut row = 0u64;
                for xx in 0..pw {
                    let x = xx as isize - t as isize;
                    let d = at(x, y) - at(x + dx, y + dy);
                    row += (d * d) as u64;
                    integral[(yy + 1) * stride + xx + 1] = integral[yy * stride + xx + 1] + row;
                }
            }

            for y in 0..rows {
                let (y0, y1) = (y, y + 2 * t + 1);
                let sy = (y_start + y) as isize + dy;
                for x in 0..w {
                    let (x0, x1) = (x, x + 2 * t + 1);
                    let ssd = (integral[y1 * stride + x1] + integral[y0 * stride + x0])
                        - (integral[y0 * stride + x1] + integral[y1 * stride + x0]);
                    let ssd = ssd as usize;
                    if ssd <= cutoff {
                        let wgt = weights[ssd];
                        let i = y * w + x;
                        sum_w[i] += wgt;
                        sum_v[i] += wgt * at(x as isize + dx, sy) as f32;
                    }
                }
            }
        }
    }

    // The zero displacement always contributes weight 1, so sum_w ≥ 1.
    for ((o, v), wt) in out.iter_mut().zip(&sum_v).zip(&sum_w) {
        *o = (v / wt).round().clamp(0.0, 255.0) as u8;
    }
}

// ── Contrast ─────────────────────────────────────────────────────────────

/// Contrast-limited adaptive histogram equalisation.
///
/// The page is split into `grid × grid` tiles (fewer on pages narrower than
/// the grid). Each tile's histogram is clipped at
/// `max(clip_limit · area / 256, 1)` with the excess spread evenly over all
/// bins; pixels are mapped by bilinear interpolation between the four
/// nearest tile lookup tables.
pub fn clahe(img: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    let tw = w.div_ceil(grid);
    let th = h.div_ceil(grid);
    let tiles_x = w.div_ceil(tw);
    let tiles_y = h.div_ceil(th);

    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let (x0, x1) = (tx * tw, ((tx + 1) * tw).min(w));
            let (y0, y1) = (ty * th, ((ty + 1) * th).min(h));

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get_pixel(x, y).0[0] as usize] += 1;
                }
            }

            let area = (x1 - x0) * (y1 - y0);
            let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
            clip_histogram(&mut hist, limit);

            let scale = 255.0 / area as f32;
            let lut = &mut luts[(ty * tiles_x + tx) as usize];
            let mut cdf = 0u32;
            for (bin, count) in hist.iter().enumerate() {
                cdf += count;
                lut[bin] = (cdf as f32 * scale).round().min(255.0) as u8;
            }
        }
    }

    let inv_tw = 1.0 / tw as f32;
    let inv_th = 1.0 / th as f32;
    let last_x = tiles_x as i64 - 1;
    let last_y = tiles_y as i64 - 1;

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        let tyf = y as f32 * inv_th - 0.5;
        let ty1 = tyf.floor() as i64;
        let ya = tyf - ty1 as f32;
        let (ty1, ty2) = (ty1.max(0), (ty1 + 1).min(last_y));

        for x in 0..w {
            let txf = x as f32 * inv_tw - 0.5;
            let tx1 = txf.floor() as i64;
            let xa = txf - tx1 as f32;
            let (tx1, tx2) = (tx1.max(0), (tx1 + 1).min(last_x));

            let v = img.get_pixel(x, y).0[0] as usize;
            let lut = |ty: i64, tx: i64| luts[(ty * tiles_x as i64 + tx) as usize][v] as f32;

            let top = lut(ty1, tx1) * (1.0 - xa) + lut(ty1, tx2) * xa;
            let bottom = lut(ty2, tx1) * (1.0 - xa) + lut(ty2, tx2) * xa;
            let value = top * (1.0 - ya) + bottom * ya;
            out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

/// Clip every bin at `limit` and redistribute the excess. Preserves the total.
fn clip_histogram(hist: &mut [u32; 256], limit: u32) {
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }

    let batch = excess / 256;
    let residual = excess % 256;
    for bin in hist.iter_mut() {
        *bin += batch;
    }
    if residual > 0 {
        let step = (256 / residual).max(1) as usize;
        for bin in hist.iter_mut().step_by(step).take(residual as usize) {
            *bin += 1;
        }
    }
}

// ── Sharpen ──────────────────────────────────────────────────────────────

/// `amount · img − (amount − 1) · gaussian(img, sigma)`.
pub fn unsharp_mask(img: &GrayImage, sigma: f32, amount: f32) -> GrayImage {
    let blurred = image::imageops::blur(img, sigma);
    let mut out = GrayImage::new(img.width(), img.height());
    for ((src, blur), dst) in img.pixels().zip(blurred.pixels()).zip(out.pixels_mut()) {
        let a = src.0[0] as f32;
        let b = blur.0[0] as f32;
        let v = amount * a - (amount - 1.0) * b;
        *dst = Luma([v.round().clamp(0.0, 255.0) as u8]);
    }
    out
}

/// 3×3 convolution with mirrored borders (`1 0 | 0 1`, edge not repeated).
pub fn high_pass(img: &GrayImage, kernel: &[[i32; 3]; 3]) -> GrayImage {
    let (w, h) = img.dimensions();
    let (wi, hi) = (w as i64, h as i64);
    let mut out = GrayImage::new(w, h);

    for y in 0..hi {
        for x in 0..wi {
            let mut acc = 0i32;
            for (ky, row) in kernel.iter().enumerate() {
                let sy = reflect101(y + ky as i64 - 1, hi);
                for (kx, k) in row.iter().enumerate() {
                    let sx = reflect101(x + kx as i64 - 1, wi);
                    acc += k * img.get_pixel(sx, sy).0[0] as i32;
                }
            }
            out.put_pixel(x as u32, y as u32, Luma([acc.clamp(0, 255) as u8]));
        }
    }
    out
}

fn reflect101(i: i64, n: i64) -> u32 {
    if n == 1 {
        return 0;
    }
    let r = if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    };
    r.clamp(0, n - 1) as u32
}
