//! Pipeline stages for drawing analysis.
//!
//! Each submodule implements exactly one transformation step, so each is
//! testable on its own and the enhancement logic never sees transport or
//! provider concerns.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ enhance ──▶ encode ──▶ (provider) ──▶ normalize
//! (checks)  (pages)   (grayscale)  (base64)                  (canonical)
//! ```
//!
//! 1. [`input`]: validate the upload: size, extension, emptiness
//! 2. [`render`]: decode to RGB pages; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`enhance`]: denoise, contrast-normalise and sharpen each page
//! 4. [`encode`]: PNG-encode and base64-wrap for the provider request
//! 5. [`normalize`]: map provider-native output onto the canonical schema

pub mod encode;
pub mod enhance;
pub mod input;
pub mod normalize;
pub mod render;
