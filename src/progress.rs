//! Progress-callback trait for analysis stage events.
//!
//! Inject an [`Arc<dyn AnalysisProgressCallback>`] via
//! [`crate::config::AnalysisConfigBuilder::progress_callback`] to be told
//! when preprocessing and each provider call start and finish.
//!
//! In a comparison both sides run concurrently, so `on_provider_start` /
//! `on_provider_complete` for the two providers may interleave.
//!
//! # Example
//!
//! ```rust
//! use edgequake_drawing::{AnalysisConfig, AnalysisProgressCallback, ProviderId};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     finished: AtomicUsize,
//! }
//!
//! impl AnalysisProgressCallback for CountingCallback {
//!     fn on_provider_complete(&self, provider: ProviderId, ok: bool, elapsed_ms: u64) {
//!         self.finished.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{provider} finished (ok={ok}) in {elapsed_ms}ms");
//!     }
//! }
//!
//! let config = AnalysisConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { finished: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::config::{EnhancementProfile, ProviderId};
use std::sync::Arc;

/// Called by the orchestrator as a request moves through its stages.
///
/// All methods default to no-ops so callers only override what they need.
pub trait AnalysisProgressCallback: Send + Sync {
    /// Called before the drawing is decoded and enhanced.
    ///
    /// # Arguments
    /// * `filename`: the uploaded file's name
    /// * `profile`: enhancement profile about to run
    fn on_preprocess_start(&self, filename: &str, profile: EnhancementProfile) {
        let _ = (filename, profile);
    }

    /// Called once the encoded page is ready.
    ///
    /// # Arguments
    /// * `width`, `height`: pixel size of the enhanced page
    /// * `elapsed_ms`: wall time of decode + enhance + encode
    fn on_preprocess_complete(&self, width: u32, height: u32, elapsed_ms: u64) {
        let _ = (width, height, elapsed_ms);
    }

    /// Called just before a provider is contacted.
    fn on_provider_start(&self, provider: ProviderId) {
        let _ = provider;
    }

    /// Called when a provider call ends, successfully or not.
    ///
    /// `ok = false` means the caller will receive a minimal result for this
    /// provider.
    fn on_provider_complete(&self, provider: ProviderId, ok: bool, elapsed_ms: u64) {
        let _ = (provider, ok, elapsed_ms);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl AnalysisProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::AnalysisConfig`].
pub type ProgressCallback = Arc<dyn AnalysisProgressCallback>;
