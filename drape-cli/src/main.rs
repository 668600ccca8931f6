//! drape CLI entrypoint.
//!
//! ```bash
//! drape tryon --person person.jpg --garment tee.png --output out.png
//! drape tryon --person person.jpg --garment tee.png --output out.png \
//!     --region lower --crop-to-region --steps 20 --seed 7
//! drape backends --json
//! drape devices --json
//! ```

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use image::RgbImage;
use tokio_util::sync::CancellationToken;
use tracing::info;

use drape_core::backend::TryOnBackend;
use drape_core::device::{DeviceClass, DeviceInventory};
use drape_core::error::{Result as DrapeResult, TryOnError};
use drape_core::registry::{ModelHandle, ModelLoader, ModelRegistry};
use drape_core::services::{
    GenerativeService, LabelMap, ParsingService, PoseEstimate, PoseService,
};
use drape_core::types::{GenerationRequest, Region, TryOnOptions};
use drape_pipeline::backends::{GarmentFusionBackend, LatentInpaintBackend, OverlayBackend};
use drape_pipeline::{EngineConfig, StagePipeline, SynthesisResolver, TryOnEngine};

const JSON_SCHEMA_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "drape",
    version,
    about = "Garment try-on orchestration engine",
    arg_required_else_help = true,
    after_help = "Examples:\n  drape devices --json\n  drape backends\n  drape tryon --person person.jpg --garment tee.png --output out.png\n  drape tryon --person person.jpg --garment tee.png --output out.png --region lower --crop-to-region"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synthesize a person wearing a garment
    Tryon(TryonArgs),
    /// Show the synthesis backend cascade and its load states
    Backends(BackendsArgs),
    /// Probe available accelerators
    Devices(DevicesArgs),
}

#[derive(Args, Debug)]
struct TryonArgs {
    /// Person image (any format the image crate decodes)
    #[arg(long)]
    person: PathBuf,

    /// Garment image
    #[arg(long)]
    garment: PathBuf,

    /// Output image path
    #[arg(long)]
    output: PathBuf,

    /// Garment description fed to generative backends
    #[arg(long, default_value = "a stylish garment")]
    description: String,

    /// Garment region: upper, lower or full
    #[arg(long, default_value = "upper")]
    region: String,

    /// Disable automatic mask derivation
    #[arg(long)]
    no_auto_mask: bool,

    /// Grayscale mask image, used with --no-auto-mask
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Center-crop the person to 3:4 before processing
    #[arg(long)]
    crop_to_region: bool,

    /// Denoise step count for generative backends
    #[arg(long, default_value_t = 30)]
    steps: u32,

    /// Generation seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Engine config JSON (schema v1)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding backend weight files (<name>.safetensors|.onnx)
    #[arg(long)]
    weights_dir: Option<PathBuf>,

    /// Write the diagnostic mask preview here
    #[arg(long)]
    mask_out: Option<PathBuf>,

    /// Emit a machine-readable result summary on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct BackendsArgs {
    /// Directory holding backend weight files
    #[arg(long)]
    weights_dir: Option<PathBuf>,

    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct DevicesArgs {
    #[arg(long)]
    json: bool,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Tryon(args) if args.json => Some("tryon"),
        Commands::Backends(args) if args.json => Some("backends"),
        Commands::Devices(args) if args.json => Some("devices"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Tryon(args) => {
            let rt = build_runtime();
            rt.block_on(run_tryon(args))
        }
        Commands::Backends(args) => run_backends(args),
        Commands::Devices(args) => run_devices(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!(
                    "{}",
                    serde_json::json!({
                        "schema_version": JSON_SCHEMA_VERSION,
                        "command": command,
                        "ok": false,
                        "error": err.to_string(),
                    })
                );
            } else {
                tracing::error!(error = %err, "Command failed");
            }
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime")
}

fn parse_region(s: &str) -> DrapeResult<Region> {
    match s.to_ascii_lowercase().as_str() {
        "upper" | "upper_body" => Ok(Region::Upper),
        "lower" | "lower_body" => Ok(Region::Lower),
        "full" | "dresses" => Ok(Region::Full),
        other => Err(TryOnError::InvariantViolation(format!(
            "Unknown region '{other}'. Use upper, lower or full."
        ))),
    }
}

// ── Offline collaborator stubs ──────────────────────────────────────────
//
// The CLI runs without perception/generation endpoints: pose and parsing
// degrade to their geometric fallbacks, the generative tiers fail to load
// (or to synthesize) and the cascade lands on the overlay compositor.

struct OfflinePoseService;

#[async_trait]
impl PoseService for OfflinePoseService {
    async fn estimate(&self, _frame: &RgbImage) -> DrapeResult<PoseEstimate> {
        Err(TryOnError::ServiceUnavailable {
            service: "pose-estimation",
            reason: "no pose service endpoint configured".into(),
        })
    }
}

struct OfflineParsingService;

#[async_trait]
impl ParsingService for OfflineParsingService {
    async fn parse(&self, _frame: &RgbImage) -> DrapeResult<LabelMap> {
        Err(TryOnError::ServiceUnavailable {
            service: "body-parsing",
            reason: "no parsing service endpoint configured".into(),
        })
    }
}

struct UnconfiguredGenerativeService;

#[async_trait]
impl GenerativeService for UnconfiguredGenerativeService {
    async fn synthesize(&self, _request: &GenerationRequest) -> DrapeResult<RgbImage> {
        Err(TryOnError::ServiceUnavailable {
            service: "generative-image",
            reason: "no diffusion endpoint configured".into(),
        })
    }
}

/// Loads weight artifacts from a flat directory, `<name>.safetensors` or
/// `<name>.onnx`.  Without a configured directory every load fails, which
/// exercises the cascade's graceful-degradation path.
struct WeightsDirLoader {
    root: Option<PathBuf>,
}

#[allow(dead_code)]
struct LoadedWeights {
    path: PathBuf,
    bytes: u64,
    device: DeviceClass,
}

#[async_trait]
impl ModelLoader for WeightsDirLoader {
    async fn load(&self, name: &str, device: DeviceClass) -> DrapeResult<ModelHandle> {
        let Some(root) = &self.root else {
            return Err(TryOnError::ModelLoad {
                model: name.to_string(),
                device,
                reason: "no weights directory configured".into(),
            });
        };
        for ext in ["safetensors", "onnx"] {
            let path = root.join(format!("{name}.{ext}"));
            if let Ok(meta) = std::fs::metadata(&path) {
                info!(model = name, path = %path.display(), bytes = meta.len(), "weights found");
                return Ok(Arc::new(LoadedWeights {
                    path,
                    bytes: meta.len(),
                    device,
                }) as ModelHandle);
            }
        }
        Err(TryOnError::ModelLoad {
            model: name.to_string(),
            device,
            reason: format!("no weight file under {}", root.display()),
        })
    }
}

fn build_engine(config: EngineConfig, weights_dir: Option<PathBuf>) -> DrapeResult<TryOnEngine> {
    let inventory = DeviceInventory::probe();
    let registry = Arc::new(ModelRegistry::new(
        Arc::new(WeightsDirLoader { root: weights_dir }),
        inventory,
    ));
    let generative: Arc<dyn GenerativeService> = Arc::new(UnconfiguredGenerativeService);
    let backends: Vec<Arc<dyn TryOnBackend>> = vec![
        Arc::new(GarmentFusionBackend::new(generative.clone())),
        Arc::new(LatentInpaintBackend::new(generative)),
        Arc::new(OverlayBackend),
    ];
    let resolver = SynthesisResolver::new(backends, registry);
    let pipeline = StagePipeline::standard(
        Arc::new(OfflinePoseService),
        Arc::new(OfflineParsingService),
        config.require_pose,
        config.require_parsing,
    );
    TryOnEngine::new(config, pipeline, resolver)
}

fn load_rgb(path: &Path) -> anyhow::Result<RgbImage> {
    let img = image::open(path)
        .map_err(|err| anyhow::anyhow!("failed to open {}: {err}", path.display()))?;
    Ok(img.to_rgb8())
}

async fn run_tryon(args: TryonArgs) -> anyhow::Result<()> {
    let region = parse_region(&args.region)?;
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let engine = build_engine(config, args.weights_dir.clone())?;

    let person = load_rgb(&args.person)?;
    let garment = load_rgb(&args.garment)?;
    let manual_mask = match &args.mask {
        Some(path) => Some(
            image::open(path)
                .map_err(|err| anyhow::anyhow!("failed to open {}: {err}", path.display()))?
                .to_luma8(),
        ),
        None => None,
    };

    let options = TryOnOptions {
        auto_mask: !args.no_auto_mask,
        region,
        crop_to_region: args.crop_to_region,
        steps: args.steps,
        seed: args.seed,
        manual_mask,
    };

    let cancel = CancellationToken::new();
    let output = engine
        .generate(&person, &garment, &args.description, &options, &cancel)
        .await?;

    output
        .image
        .save(&args.output)
        .map_err(|err| anyhow::anyhow!("failed to save {}: {err}", args.output.display()))?;
    if let Some(mask_out) = &args.mask_out {
        output
            .diagnostic_mask
            .save(mask_out)
            .map_err(|err| anyhow::anyhow!("failed to save {}: {err}", mask_out.display()))?;
    }

    if args.json {
        println!(
            "{}",
            serde_json::json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "tryon",
                "ok": true,
                "backend": output.backend_used,
                "output": args.output.display().to_string(),
                "degraded_stages": output.degraded_stages,
                "timing": output.timing,
            })
        );
    } else {
        println!(
            "tryon: backend={} total_ms={} degraded=[{}] output={}",
            output.backend_used,
            output.timing.total_ms,
            output.degraded_stages.join(", "),
            args.output.display()
        );
    }
    Ok(())
}

fn run_backends(args: BackendsArgs) -> anyhow::Result<()> {
    let engine = build_engine(EngineConfig::default(), args.weights_dir.clone())?;
    let descriptors = engine.resolver().status();

    if args.json {
        println!(
            "{}",
            serde_json::json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "backends",
                "ok": true,
                "backends": descriptors,
            })
        );
    } else {
        for d in descriptors {
            println!(
                "rank={} name={} state={:?} device={}",
                d.rank, d.name, d.load_state, d.device
            );
        }
    }
    Ok(())
}

fn run_devices(args: DevicesArgs) -> anyhow::Result<()> {
    let inventory = DeviceInventory::probe();
    let pinned = inventory.pin(DeviceClass::Cuda);

    if args.json {
        println!(
            "{}",
            serde_json::json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "devices",
                "ok": true,
                "cuda": inventory.cuda,
                "metal": inventory.metal,
                "pinned_default": pinned.to_string(),
            })
        );
    } else {
        println!(
            "devices: cuda={} metal={} pinned_default={}",
            inventory.cuda, inventory.metal, pinned
        );
    }
    Ok(())
}
