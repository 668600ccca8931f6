//! Orchestration layer for the drape try-on engine.
//!
//! Composes the pieces defined in `drape-core` into the end-to-end
//! `generate` operation: sequential preprocessing stages with per-stage
//! graceful degradation, region mask derivation, the priority-ordered
//! synthesis backend cascade, and the compositor that maps generated
//! content back onto the original image.

pub mod backends;
pub mod compositor;
pub mod engine;
pub mod mask;
pub mod resolver;
pub mod stages;

pub use engine::{EngineConfig, TryOnEngine};
pub use resolver::SynthesisResolver;
pub use stages::{ParsingStage, PoseMapStage, PoseStage, PreprocessContext, StagePipeline};
