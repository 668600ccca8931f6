//! The synthesis tiers behind the resolver cascade.
//!
//! Ranked highest-capability first:
//!
//! 1. [`GarmentFusionBackend`] — full garment-conditioned generative
//!    backend; consumes the pose map and garment frame (structured input).
//! 2. [`LatentInpaintBackend`] — reduced-conditioning generative backend;
//!    plain masked inpainting, no pose conditioning.
//! 3. [`OverlayBackend`] — non-generative compositing fallback; needs no
//!    model artifacts and always loads.
//!
//! The generative tiers delegate the actual synthesis call to an injected
//! [`GenerativeService`] transport; their `load()` acquires every weight
//! artifact through the [`ModelRegistry`] so the single-flight and
//! memoized-failure guarantees apply uniformly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use image::imageops::{self, FilterType};
use tracing::debug;

use drape_core::backend::TryOnBackend;
use drape_core::device::DeviceClass;
use drape_core::error::{Result, TryOnError};
use drape_core::registry::{ModelHandle, ModelRegistry};
use drape_core::services::GenerativeService;
use drape_core::types::{CropWindow, GenerationRequest, GenerationResult};

use crate::mask::diagnostic_overlay;

pub const GARMENT_FUSION: &str = "garment-fusion";
pub const LATENT_INPAINT: &str = "latent-inpaint";
pub const OVERLAY: &str = "overlay";

const GARMENT_FUSION_WEIGHTS: &[&str] = &[
    "garment-fusion-unet",
    "garment-fusion-garment-encoder",
    "garment-fusion-vae",
];

const LATENT_INPAINT_WEIGHTS: &[&str] = &["latent-inpaint-unet", "latent-inpaint-vae"];

/// Shared load/ready bookkeeping for the generative tiers.
struct LoadedArtifacts {
    handles: Mutex<Vec<ModelHandle>>,
    ready: AtomicBool,
}

impl LoadedArtifacts {
    fn new() -> LoadedArtifacts {
        LoadedArtifacts {
            handles: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
        }
    }

    async fn acquire(
        &self,
        models: &ModelRegistry,
        weights: &[&str],
        device: DeviceClass,
    ) -> Result<()> {
        let mut loaded = Vec::with_capacity(weights.len());
        for name in weights {
            loaded.push(models.get_or_load(name, device).await?);
        }
        *self.handles.lock().expect("artifact lock poisoned") = loaded;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

fn check_output_dims(
    backend: &'static str,
    request: &GenerationRequest,
    output: &image::RgbImage,
) -> Result<()> {
    if output.dimensions() != request.person.target_size() {
        return Err(TryOnError::Generation {
            backend: backend.to_string(),
            reason: format!(
                "output {:?} does not match person canvas {:?}",
                output.dimensions(),
                request.person.target_size()
            ),
        });
    }
    Ok(())
}

/// Full garment-conditioned generative backend (highest capability).
pub struct GarmentFusionBackend {
    service: Arc<dyn GenerativeService>,
    artifacts: LoadedArtifacts,
}

impl GarmentFusionBackend {
    pub fn new(service: Arc<dyn GenerativeService>) -> GarmentFusionBackend {
        GarmentFusionBackend {
            service,
            artifacts: LoadedArtifacts::new(),
        }
    }
}

#[async_trait]
impl TryOnBackend for GarmentFusionBackend {
    fn name(&self) -> &'static str {
        GARMENT_FUSION
    }

    fn rank(&self) -> u32 {
        0
    }

    fn preferred_device(&self) -> DeviceClass {
        DeviceClass::Cuda
    }

    fn accepts_structured_input(&self) -> bool {
        true
    }

    async fn load(&self, models: &ModelRegistry) -> Result<()> {
        let device = models.pin(self.preferred_device());
        self.artifacts
            .acquire(models, GARMENT_FUSION_WEIGHTS, device)
            .await
    }

    fn is_ready(&self) -> bool {
        self.artifacts.is_ready()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        if !self.is_ready() {
            return Err(TryOnError::NotLoaded(GARMENT_FUSION.to_string()));
        }
        let started = Instant::now();
        let shaped = GenerationRequest {
            description: format!("model is wearing {}", request.description),
            ..request.clone()
        };
        let image = self
            .service
            .synthesize(&shaped)
            .await
            .map_err(|err| TryOnError::Generation {
                backend: GARMENT_FUSION.to_string(),
                reason: err.to_string(),
            })?;
        check_output_dims(GARMENT_FUSION, request, &image)?;
        Ok(GenerationResult {
            image,
            diagnostic_mask: diagnostic_overlay(&request.person, &request.mask),
            duration: started.elapsed(),
        })
    }
}

/// Reduced-conditioning generative backend: masked inpainting without pose
/// conditioning or the garment reference frame.
pub struct LatentInpaintBackend {
    service: Arc<dyn GenerativeService>,
    artifacts: LoadedArtifacts,
}

impl LatentInpaintBackend {
    pub fn new(service: Arc<dyn GenerativeService>) -> LatentInpaintBackend {
        LatentInpaintBackend {
            service,
            artifacts: LoadedArtifacts::new(),
        }
    }
}

#[async_trait]
impl TryOnBackend for LatentInpaintBackend {
    fn name(&self) -> &'static str {
        LATENT_INPAINT
    }

    fn rank(&self) -> u32 {
        1
    }

    fn preferred_device(&self) -> DeviceClass {
        DeviceClass::Cuda
    }

    async fn load(&self, models: &ModelRegistry) -> Result<()> {
        let device = models.pin(self.preferred_device());
        self.artifacts
            .acquire(models, LATENT_INPAINT_WEIGHTS, device)
            .await
    }

    fn is_ready(&self) -> bool {
        self.artifacts.is_ready()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        if !self.is_ready() {
            return Err(TryOnError::NotLoaded(LATENT_INPAINT.to_string()));
        }
        let started = Instant::now();
        // Strip the conditioning this tier cannot consume.
        let reduced = GenerationRequest {
            pose_map: None,
            description: format!("a person wearing {}", request.description),
            ..request.clone()
        };
        let image = self
            .service
            .synthesize(&reduced)
            .await
            .map_err(|err| TryOnError::Generation {
                backend: LATENT_INPAINT.to_string(),
                reason: err.to_string(),
            })?;
        check_output_dims(LATENT_INPAINT, request, &image)?;
        Ok(GenerationResult {
            image,
            diagnostic_mask: diagnostic_overlay(&request.person, &request.mask),
            duration: started.elapsed(),
        })
    }
}

/// Garment width as a fraction of person width when the mask gives no
/// placement hint, and the vertical offset of the paste.
const HEURISTIC_WIDTH: f32 = 0.4;
const HEURISTIC_TOP: f32 = 0.2;

/// Non-generative compositing fallback.  Scales the garment content into
/// the masked region of the person canvas.  Always loadable.
pub struct OverlayBackend;

#[async_trait]
impl TryOnBackend for OverlayBackend {
    fn name(&self) -> &'static str {
        OVERLAY
    }

    fn rank(&self) -> u32 {
        2
    }

    fn preferred_device(&self) -> DeviceClass {
        DeviceClass::Cpu
    }

    async fn load(&self, _models: &ModelRegistry) -> Result<()> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let started = Instant::now();
        let (pw, ph) = request.person.target_size();
        let mut canvas = request.person.canvas.clone();

        let (gx, gy) = request.garment.paste_offset;
        let (gw, gh) = request.garment.content_size;
        let garment = imageops::crop_imm(&request.garment.canvas, gx, gy, gw, gh).to_image();

        let placement = request.mask.bounding_box();
        let clip_to_mask = placement.is_some();
        let target = placement.unwrap_or(CropWindow {
            x: (pw as f32 * (1.0 - HEURISTIC_WIDTH) / 2.0) as u32,
            y: (ph as f32 * HEURISTIC_TOP) as u32,
            width: ((pw as f32 * HEURISTIC_WIDTH) as u32).max(1),
            height: ph.saturating_sub((ph as f32 * HEURISTIC_TOP) as u32).max(1),
        });

        let scaled_h = ((gh as f32 * target.width as f32 / gw as f32) as u32)
            .clamp(1, target.height.max(1));
        let resized = imageops::resize(&garment, target.width.max(1), scaled_h, FilterType::Lanczos3);
        debug!(
            x = target.x,
            y = target.y,
            width = resized.width(),
            height = resized.height(),
            "overlay placement"
        );

        for (dx, dy, px) in resized.enumerate_pixels() {
            let (x, y) = (target.x + dx, target.y + dy);
            if x < pw && y < ph && (!clip_to_mask || request.mask.get(x, y)) {
                canvas.put_pixel(x, y, *px);
            }
        }

        Ok(GenerationResult {
            image: canvas,
            diagnostic_mask: diagnostic_overlay(&request.person, &request.mask),
            duration: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drape_core::device::DeviceInventory;
    use drape_core::geometry::normalize;
    use drape_core::registry::ModelLoader;
    use drape_core::services::PoseEstimate;
    use drape_core::types::Region;
    use image::{Rgb, RgbImage};

    use crate::mask::template_mask;

    struct NullLoader;

    #[async_trait]
    impl ModelLoader for NullLoader {
        async fn load(&self, name: &str, _device: DeviceClass) -> Result<ModelHandle> {
            Ok(Arc::new(name.to_string()) as ModelHandle)
        }
    }

    struct CapturingService {
        seen: Mutex<Option<GenerationRequest>>,
    }

    #[async_trait]
    impl GenerativeService for CapturingService {
        async fn synthesize(&self, request: &GenerationRequest) -> Result<image::RgbImage> {
            *self.seen.lock().unwrap() = Some(request.clone());
            let (w, h) = request.person.target_size();
            Ok(RgbImage::from_pixel(w, h, Rgb([1, 2, 3])))
        }
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::new(
            Arc::new(NullLoader),
            DeviceInventory { cuda: false, metal: false },
        )
    }

    fn request() -> GenerationRequest {
        let person = normalize(&RgbImage::from_pixel(60, 80, Rgb([50, 60, 70])), (96, 128))
            .expect("person");
        let garment = normalize(&RgbImage::from_pixel(40, 40, Rgb([200, 10, 10])), (96, 128))
            .expect("garment");
        let mask = template_mask(person.target_size(), Region::Upper, &PoseEstimate::canonical());
        GenerationRequest {
            person,
            garment,
            mask,
            pose_map: Some(RgbImage::new(96, 128)),
            description: "a red tee".into(),
            seed: 42,
            steps: 30,
        }
    }

    #[tokio::test]
    async fn generative_tier_rejects_generate_before_load() {
        let backend = GarmentFusionBackend::new(Arc::new(CapturingService {
            seen: Mutex::new(None),
        }));
        let err = backend.generate(&request()).await.expect_err("not loaded");
        assert!(matches!(err, TryOnError::NotLoaded(_)));
    }

    #[tokio::test]
    async fn fusion_load_acquires_every_weight() {
        let backend = GarmentFusionBackend::new(Arc::new(CapturingService {
            seen: Mutex::new(None),
        }));
        let registry = registry();
        backend.load(&registry).await.expect("load");
        assert!(backend.is_ready());
        assert_eq!(registry.status().len(), GARMENT_FUSION_WEIGHTS.len());
    }

    #[tokio::test]
    async fn fusion_passes_structured_conditioning_through() {
        let service = Arc::new(CapturingService { seen: Mutex::new(None) });
        let backend = GarmentFusionBackend::new(service.clone());
        backend.load(&registry()).await.expect("load");
        let result = backend.generate(&request()).await.expect("generate");
        assert_eq!(result.image.dimensions(), (96, 128));

        let seen = service.seen.lock().unwrap();
        let seen = seen.as_ref().expect("service called");
        assert!(seen.pose_map.is_some());
        assert_eq!(seen.description, "model is wearing a red tee");
    }

    #[tokio::test]
    async fn latent_inpaint_strips_pose_conditioning() {
        let service = Arc::new(CapturingService { seen: Mutex::new(None) });
        let backend = LatentInpaintBackend::new(service.clone());
        assert!(!backend.accepts_structured_input());
        backend.load(&registry()).await.expect("load");
        backend.generate(&request()).await.expect("generate");

        let seen = service.seen.lock().unwrap();
        assert!(seen.as_ref().expect("service called").pose_map.is_none());
    }

    #[tokio::test]
    async fn overlay_is_always_ready_and_paints_inside_mask_only() {
        let backend = OverlayBackend;
        assert!(backend.is_ready());
        backend.load(&registry()).await.expect("trivial load");

        let request = request();
        let result = backend.generate(&request).await.expect("generate");
        assert_eq!(result.image.dimensions(), request.person.target_size());

        let bbox = request.mask.bounding_box().expect("template mask");
        let (pw, ph) = request.person.target_size();
        for (x, y, px) in result.image.enumerate_pixels() {
            let inside = x >= bbox.x
                && x < bbox.x + bbox.width
                && y >= bbox.y
                && y < bbox.y + bbox.height;
            if !inside {
                assert_eq!(
                    px,
                    request.person.canvas.get_pixel(x, y),
                    "pixel ({x},{y}) outside mask changed (canvas {pw}x{ph})"
                );
            }
        }
    }

    #[tokio::test]
    async fn diagnostic_mask_matches_frame_size() {
        let backend = OverlayBackend;
        let request = request();
        let result = backend.generate(&request).await.expect("generate");
        assert_eq!(
            result.diagnostic_mask.dimensions(),
            request.person.target_size()
        );
    }
}
