//! Typed error hierarchy for the try-on engine.
//!
//! Uses `thiserror` for library-grade errors.  Application code should wrap
//! these in `anyhow::Result` at call sites.
//!
//! Two classification axes matter to callers: [`TryOnError::failed_stage`]
//! maps an error onto the request state machine for structured failure
//! reports, and [`TryOnError::is_transient`] separates one-off conditions
//! (timeouts) from failures that are memoized until eviction.

use crate::device::DeviceClass;
use crate::types::RequestState;

/// All errors originating from the try-on orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum TryOnError {
    // ── Geometry ──────────────────────────────────────────────────────
    #[error("Degenerate geometry: {0}")]
    Geometry(String),

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    // ── Preprocessing stages ──────────────────────────────────────────
    #[error("Required stage '{stage}' failed: {reason}")]
    StageFailed { stage: &'static str, reason: String },

    #[error("Service '{service}' unavailable: {reason}")]
    ServiceUnavailable {
        service: &'static str,
        reason: String,
    },

    // ── Models & backends ─────────────────────────────────────────────
    #[error("Model '{model}' failed to load on {device}: {reason}")]
    ModelLoad {
        model: String,
        device: DeviceClass,
        reason: String,
    },

    #[error("Backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("No generation backend available")]
    NoBackendAvailable,

    #[error("Backend '{0}' not loaded — resolve it first")]
    NotLoaded(String),

    // ── Generation ────────────────────────────────────────────────────
    #[error("Generation on '{backend}' exceeded {timeout_ms} ms")]
    GenerationTimeout { backend: String, timeout_ms: u64 },

    #[error("Generation on '{backend}' failed: {reason}")]
    Generation { backend: String, reason: String },

    // ── Lifecycle ─────────────────────────────────────────────────────
    #[error("Request cancelled")]
    Cancelled,

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl TryOnError {
    /// The request state machine stage this error fails a request from.
    ///
    /// FAILED is reachable from NORMALIZED (degenerate geometry),
    /// PREPROCESSED (required-stage failure), BACKEND_RESOLVED (no backend
    /// available), and GENERATED (backend-internal error or timeout).
    pub fn failed_stage(&self) -> RequestState {
        match self {
            Self::Geometry(_) | Self::Image(_) => RequestState::Normalized,
            Self::StageFailed { .. } | Self::ServiceUnavailable { .. } => {
                RequestState::Preprocessed
            }
            Self::ModelLoad { .. }
            | Self::BackendUnavailable { .. }
            | Self::NoBackendAvailable
            | Self::NotLoaded(_) => RequestState::BackendResolved,
            Self::GenerationTimeout { .. } | Self::Generation { .. } => RequestState::Generated,
            Self::Cancelled | Self::InvariantViolation(_) => RequestState::Received,
        }
    }

    /// Whether this error is a one-off condition rather than a memoized
    /// failure.  Timeouts are plausibly transient; load failures are
    /// permanent for the process lifetime (until eviction).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::GenerationTimeout { .. } | Self::Cancelled)
    }
}

/// Convenience alias used throughout the engine crates.
pub type Result<T> = std::result::Result<T, TryOnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_failures_map_to_backend_resolution() {
        let err = TryOnError::ModelLoad {
            model: "garment-fusion-unet".into(),
            device: DeviceClass::Cpu,
            reason: "weights missing".into(),
        };
        assert_eq!(err.failed_stage(), RequestState::BackendResolved);
        assert!(!err.is_transient());
    }

    #[test]
    fn timeouts_are_transient() {
        let err = TryOnError::GenerationTimeout {
            backend: "garment-fusion".into(),
            timeout_ms: 1000,
        };
        assert_eq!(err.failed_stage(), RequestState::Generated);
        assert!(err.is_transient());
    }

    #[test]
    fn required_stage_failure_maps_to_preprocessing() {
        let err = TryOnError::StageFailed {
            stage: "body-parsing",
            reason: "session crashed".into(),
        };
        assert_eq!(err.failed_stage(), RequestState::Preprocessed);
    }
}
