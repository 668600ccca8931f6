//! Generation backend trait — the garment-transfer contract.
//!
//! Every backend implementation must satisfy:
//!
//! 1. **Complete-or-fail generation**: `generate()` returns a whole
//!    [`GenerationResult`] or an error, never a partial state.  The engine
//!    treats the call as atomic.
//!
//! 2. **Idempotent load**: `load()` may be called repeatedly; the heavy
//!    work goes through the [`ModelRegistry`](crate::registry::ModelRegistry),
//!    whose single-flight guarantee deduplicates concurrent loads.
//!
//! 3. **Thread safety**: the trait object is `Send + Sync`.  Concurrent
//!    `generate()` calls are *not* required — generation serializes on the
//!    shared accelerator — but the backend must tolerate being moved across
//!    threads by the async executor.
//!
//! 4. **Capability over type**: callers branch on
//!    [`accepts_structured_input`](TryOnBackend::accepts_structured_input),
//!    never on the concrete implementation type.

use async_trait::async_trait;
use serde::Serialize;

use crate::device::DeviceClass;
use crate::error::Result;
use crate::registry::ModelRegistry;
use crate::types::{GenerationRequest, GenerationResult};

/// Load lifecycle of a model or backend.  States only move forward;
/// `Failed` is terminal for the process lifetime unless explicitly reset
/// by eviction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

/// Snapshot of one synthesis candidate's standing in the cascade.
#[derive(Clone, Debug, Serialize)]
pub struct BackendDescriptor {
    pub name: String,
    /// Cascade position; lower ranks are tried first.
    pub rank: u32,
    pub load_state: LoadState,
    pub device: DeviceClass,
}

/// A pluggable implementation capable of producing a garment-transfer image
/// from a structured request.
///
/// See module-level documentation for the full contract.
#[async_trait]
pub trait TryOnBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cascade position; lower ranks are tried first.
    fn rank(&self) -> u32;

    /// Device class this backend performs best on.  Loads are pinned to
    /// the first available match, falling back to CPU.
    fn preferred_device(&self) -> DeviceClass;

    /// Whether `generate()` consumes structured conditioning (pose map and
    /// garment frame) beyond the masked person image.
    fn accepts_structured_input(&self) -> bool {
        false
    }

    /// Acquire every model artifact this backend needs via the registry.
    ///
    /// # Errors
    ///
    /// Returns [`TryOnError::ModelLoad`](crate::error::TryOnError::ModelLoad)
    /// when an artifact cannot be loaded; the resolver memoizes the failure.
    async fn load(&self, models: &ModelRegistry) -> Result<()>;

    /// Whether `generate()` can be called right now.
    fn is_ready(&self) -> bool;

    /// Run one synthesis call.
    ///
    /// # Errors
    ///
    /// Returns [`TryOnError::NotLoaded`](crate::error::TryOnError::NotLoaded)
    /// if `load()` has not succeeded, or
    /// [`TryOnError::Generation`](crate::error::TryOnError::Generation) on an
    /// internal failure.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult>;
}
