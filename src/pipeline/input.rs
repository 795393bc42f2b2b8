//! Ingress validation: turn uploaded bytes (or a local file) into a
//! [`RawDrawing`].
//!
//! All checks here are cheap and happen before any decoding, so a bad upload
//! is rejected without touching pdfium or a provider.

use crate::error::DrawingError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extensions accepted at ingress (compared case-insensitively).
pub const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "png", "jpg", "jpeg"];

/// Declared media kind of an upload, derived from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Pdf,
    Image,
}

/// An uploaded drawing: bytes plus the name and kind it was declared with.
///
/// Owned by one request; consumed by [`crate::pipeline::render`].
#[derive(Debug, Clone)]
pub struct RawDrawing {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub kind: MediaKind,
}

impl RawDrawing {
    /// Validate an upload: non-empty, at most `max_bytes`, allowed extension.
    pub fn from_upload(
        filename: impl Into<String>,
        bytes: Vec<u8>,
        max_bytes: usize,
    ) -> Result<Self, DrawingError> {
        let filename = filename.into();

        if bytes.is_empty() {
            return Err(DrawingError::EmptyInput { filename });
        }
        if bytes.len() > max_bytes {
            return Err(DrawingError::InputTooLarge {
                filename,
                size: bytes.len(),
                max: max_bytes,
            });
        }
        let kind = media_kind(&filename)?;

        debug!("Accepted upload '{}' ({} bytes, {:?})", filename, bytes.len(), kind);
        Ok(Self {
            filename,
            bytes,
            kind,
        })
    }

    /// Read a local file and validate it like an upload.
    pub async fn from_path(path: &Path, max_bytes: usize) -> Result<Self, DrawingError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DrawingError::FileNotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => DrawingError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => DrawingError::Internal(format!("Failed to read {}: {}", path.display(), e)),
        })?;

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| PathBuf::from(path).display().to_string());

        Self::from_upload(filename, bytes, max_bytes)
    }
}

/// Classify a filename by extension, rejecting anything off the allow-list.
pub fn media_kind(filename: &str) -> Result<MediaKind, DrawingError> {
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());

    match ext.as_deref() {
        Some("pdf") => Ok(MediaKind::Pdf),
        Some(e) if ALLOWED_EXTENSIONS.contains(&e) => Ok(MediaKind::Image),
        _ => Err(DrawingError::UnsupportedFormat {
            filename: filename.to_string(),
            allowed: ALLOWED_EXTENSIONS
                .iter()
                .map(|e| format!(".{e}"))
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}
