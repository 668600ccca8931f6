//! Accelerator probing and device-class selection.
//!
//! The process probes available accelerators exactly once at startup
//! ([`DeviceInventory::probe`]); every model load is then pinned to the
//! first class matching the backend's preference, falling back to CPU.
//! `DRAPE_DEVICE=cuda|metal|cpu` overrides the probe for testing and for
//! machines where node sniffing misreports.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TryOnError};

/// Device class a backend can express affinity for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Cuda,
    Metal,
    Cpu,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

impl DeviceClass {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" | "mps" => Ok(Self::Metal),
            "cpu" => Ok(Self::Cpu),
            other => Err(TryOnError::InvariantViolation(format!(
                "Unknown device class '{other}'. Use cuda, metal or cpu."
            ))),
        }
    }
}

/// Accelerators visible to this process.  CPU is always present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceInventory {
    pub cuda: bool,
    pub metal: bool,
}

static INVENTORY: OnceLock<DeviceInventory> = OnceLock::new();

impl DeviceInventory {
    /// Probe once and cache for the process lifetime.
    pub fn probe() -> DeviceInventory {
        *INVENTORY.get_or_init(|| {
            let inventory = Self::detect();
            info!(
                cuda = inventory.cuda,
                metal = inventory.metal,
                "probed accelerator inventory"
            );
            inventory
        })
    }

    fn detect() -> DeviceInventory {
        if let Ok(forced) = std::env::var("DRAPE_DEVICE") {
            match DeviceClass::parse(&forced) {
                Ok(DeviceClass::Cuda) => return DeviceInventory { cuda: true, metal: false },
                Ok(DeviceClass::Metal) => return DeviceInventory { cuda: false, metal: true },
                Ok(DeviceClass::Cpu) => return DeviceInventory { cuda: false, metal: false },
                Err(err) => warn!(%err, "ignoring DRAPE_DEVICE override"),
            }
        }

        let cuda = ["/dev/nvidiactl", "/dev/nvidia0", "/proc/driver/nvidia"]
            .iter()
            .any(|node| Path::new(node).exists());
        let metal = cfg!(target_os = "macos");
        DeviceInventory { cuda, metal }
    }

    /// Pin a load to the preferred class when present, else fall back to CPU.
    pub fn pin(&self, preferred: DeviceClass) -> DeviceClass {
        match preferred {
            DeviceClass::Cuda if self.cuda => DeviceClass::Cuda,
            DeviceClass::Metal if self.metal => DeviceClass::Metal,
            DeviceClass::Cpu => DeviceClass::Cpu,
            _ => DeviceClass::Cpu,
        }
    }
}
