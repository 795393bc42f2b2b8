//! Error types for the edgequake-drawing library.
//!
//! Every failure is a [`DrawingError`]. Variants are grouped by the stage
//! that raises them, and [`DrawingError::kind`] folds them onto the
//! three-way taxonomy callers actually branch on:
//!
//! * [`ErrorKind::Preprocessing`]: the drawing itself is unusable (empty,
//!   oversized, wrong extension, undecodable). Raised before any provider is
//!   contacted, so no network cost is wasted on bad input.
//!
//! * [`ErrorKind::Credential`]: a provider was selected but never
//!   configured. Raised before any network call.
//!
//! * [`ErrorKind::Analysis`]: the provider was reached but its output is
//!   unusable. The orchestrator turns these into a minimal canonical result
//!   instead of propagating them (see [`crate::analyze`]).
//!
//! Only [`ErrorReport`] (tag + human-readable message) is meant to cross the
//! library boundary towards end users.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the edgequake-drawing library.
#[derive(Debug, Error)]
pub enum DrawingError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The uploaded drawing contained zero bytes.
    #[error("Drawing '{filename}' is empty")]
    EmptyInput { filename: String },

    /// The uploaded drawing exceeds the configured size ceiling.
    #[error("Drawing '{filename}' is too large: {size} bytes (max {max} bytes)")]
    InputTooLarge {
        filename: String,
        size: usize,
        max: usize,
    },

    /// The file extension is not on the allow-list.
    #[error("Unsupported file format '{filename}'. Allowed: {allowed}")]
    UnsupportedFormat { filename: String, allowed: String },

    /// Input file was not found at the given path.
    #[error("Drawing file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    // ── Preprocessing errors ──────────────────────────────────────────────
    /// The bytes could be decoded neither as a PDF nor as a raster image.
    #[error("Could not decode '{filename}' as PDF or image: {detail}")]
    DecodeFailed { filename: String, detail: String },

    /// pdfium returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// The requested page does not exist in the drawing.
    #[error("Page {page} is out of range (drawing has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// An enhancement stage could not process the page.
    #[error("Enhancement stage '{stage}' failed on page {page}: {detail}")]
    EnhancementFailed {
        page: usize,
        stage: &'static str,
        detail: String,
    },

    /// The enhanced page could not be serialised for transport.
    #[error("Encoding page {page} failed: {detail}")]
    EncodingFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Credential errors ─────────────────────────────────────────────────
    /// The selected provider has no client configured (missing API key etc.).
    #[error("Provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Analysis errors ───────────────────────────────────────────────────
    /// The provider replied, but not with a single JSON object.
    #[error("Invalid JSON response from provider '{provider}': {detail}")]
    InvalidJson { provider: String, detail: String },

    /// The provider API returned a non-retryable error.
    #[error("Provider '{provider}' API error: {message}")]
    ProviderApi { provider: String, message: String },

    /// The provider rejected our credentials (401/403).
    #[error("Authentication error from provider '{provider}': {detail}")]
    AuthError { provider: String, detail: String },

    /// The provider returned HTTP 429.
    #[error("Rate limit exceeded for provider '{provider}'")]
    RateLimitExceeded {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    /// The provider call did not finish within the configured timeout.
    #[error("Provider '{provider}' timed out after {elapsed_ms}ms")]
    ApiTimeout { provider: String, elapsed_ms: u64 },

    /// The structured-extraction backend delivered nothing usable.
    #[error("Extraction from '{provider}' incomplete: {detail}")]
    IncompleteExtraction { provider: String, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not write a comparison report.
    #[error("Failed to write report '{path}': {source}")]
    ReportWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The taxonomy tag attached to every user-visible error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "PreprocessingError")]
    Preprocessing,
    #[serde(rename = "CredentialError")]
    Credential,
    #[serde(rename = "AnalysisError")]
    Analysis,
    #[serde(rename = "InternalError")]
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ErrorKind::Preprocessing => "PreprocessingError",
            ErrorKind::Credential => "CredentialError",
            ErrorKind::Analysis => "AnalysisError",
            ErrorKind::Internal => "InternalError",
        };
        f.write_str(tag)
    }
}

/// Structured, user-facing rendering of a [`DrawingError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl DrawingError {
    /// Fold this error onto the taxonomy tag.
    pub fn kind(&self) -> ErrorKind {
        use DrawingError::*;
        match self {
            EmptyInput { .. }
            | InputTooLarge { .. }
            | UnsupportedFormat { .. }
            | FileNotFound { .. }
            | PermissionDenied { .. }
            | DecodeFailed { .. }
            | RasterisationFailed { .. }
            | PageOutOfRange { .. }
            | EnhancementFailed { .. }
            | EncodingFailed { .. }
            | PdfiumBindingFailed(_) => ErrorKind::Preprocessing,
            ProviderNotConfigured { .. } => ErrorKind::Credential,
            InvalidJson { .. }
            | ProviderApi { .. }
            | AuthError { .. }
            | RateLimitExceeded { .. }
            | ApiTimeout { .. }
            | IncompleteExtraction { .. } => ErrorKind::Analysis,
            InvalidConfig(_) | ReportWriteFailed { .. } | Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for errors raised by a provider after it was contacted.
    pub fn is_provider_failure(&self) -> bool {
        self.kind() == ErrorKind::Analysis
    }

    /// Build the user-facing report for this error.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}
