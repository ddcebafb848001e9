//! Hardware capability snapshot
//!
//! [`CapabilityRegistry`] is the immutable picture of the host that every
//! request reads: accelerators, CPU instruction-set tier, system memory and
//! the installed binary variants. It is assembled once at startup, either
//! from a configured accelerator list or from [`HardwareInfo::detect`].
//!
//! Detection shells out to the vendor tools rather than linking GPU
//! libraries, keeping the crate lightweight.

use crate::binaries::{BinaryDescriptor, discover_binaries};
use crate::config::DispatchConfig;
use crate::error::BackendResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

const MIB: u64 = 1024 * 1024;

/// GPU vendor as reported by the driver's brand string.
///
/// Serialized lowercase; deserialized through [`GpuVendor::from_brand`], so
/// a configured accelerator may name its vendor by the full brand string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Unknown,
}

impl GpuVendor {
    /// Classify a brand string such as `"NVIDIA"` or
    /// `"Advanced Micro Devices, Inc."`.
    pub fn from_brand(brand: &str) -> Self {
        let brand = brand.to_ascii_lowercase();
        if brand.contains("nvidia") {
            GpuVendor::Nvidia
        } else if brand.contains("amd")
            || brand.contains("advanced micro devices")
            || brand.contains("radeon")
        {
            GpuVendor::Amd
        } else if brand.contains("intel") {
            GpuVendor::Intel
        } else {
            GpuVendor::Unknown
        }
    }
}

impl From<String> for GpuVendor {
    fn from(brand: String) -> Self {
        GpuVendor::from_brand(&brand)
    }
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One GPU or other offload device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accelerator {
    pub vendor: GpuVendor,
    pub name: String,
    /// Total device memory. Zero means unknown, which is treated as "no
    /// usable accelerator memory".
    #[serde(default)]
    pub total_memory_bytes: u64,
}

impl Accelerator {
    pub fn new(vendor: GpuVendor, name: impl Into<String>, total_memory_bytes: u64) -> Self {
        Self {
            vendor,
            name: name.into(),
            total_memory_bytes,
        }
    }

    pub fn has_usable_memory(&self) -> bool {
        self.total_memory_bytes > 0
    }
}

/// CPU vector instruction-set tier, ordered from weakest to strongest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CpuTier {
    #[default]
    NoAvx,
    Avx,
    Avx2,
    Avx512,
}

impl CpuTier {
    /// Highest tier supported by the running CPU.
    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if std::arch::is_x86_feature_detected!("avx512f") {
                return CpuTier::Avx512;
            }
            if std::arch::is_x86_feature_detected!("avx2") {
                return CpuTier::Avx2;
            }
            if std::arch::is_x86_feature_detected!("avx") {
                return CpuTier::Avx;
            }
        }
        CpuTier::NoAvx
    }
}

/// Immutable snapshot of host capabilities and installed binaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRegistry {
    pub accelerators: Vec<Accelerator>,
    pub cpu_tier: CpuTier,
    pub system_memory_bytes: u64,
    pub binaries: BTreeSet<BinaryDescriptor>,
}

impl CapabilityRegistry {
    pub fn new(cpu_tier: CpuTier, system_memory_bytes: u64) -> Self {
        Self {
            cpu_tier,
            system_memory_bytes,
            ..Default::default()
        }
    }

    pub fn with_accelerator(mut self, accelerator: Accelerator) -> Self {
        self.accelerators.push(accelerator);
        self
    }

    pub fn with_binary(mut self, binary: BinaryDescriptor) -> Self {
        self.binaries.insert(binary);
        self
    }

    pub fn with_binaries(mut self, binaries: impl IntoIterator<Item = BinaryDescriptor>) -> Self {
        self.binaries.extend(binaries);
        self
    }

    pub fn has_vendor(&self, vendor: GpuVendor) -> bool {
        self.accelerators.iter().any(|a| a.vendor == vendor)
    }

    /// The device offload is planned against: first NVIDIA, else first AMD,
    /// else whatever is listed first.
    pub fn primary_accelerator(&self) -> Option<&Accelerator> {
        self.accelerators
            .iter()
            .find(|a| a.vendor == GpuVendor::Nvidia)
            .or_else(|| self.accelerators.iter().find(|a| a.vendor == GpuVendor::Amd))
            .or_else(|| self.accelerators.first())
    }

    /// Assemble the snapshot for this host.
    ///
    /// Accelerators come from `config.accelerators` when set, otherwise from
    /// the vendor tools. Runs synchronously; call from `spawn_blocking`.
    pub fn assemble(config: &DispatchConfig) -> BackendResult<Self> {
        let info = HardwareInfo::detect_with(config.accelerators.clone());
        let binaries = discover_binaries(&config.bin_dir, &config.executable_names)?;

        let registry = Self {
            accelerators: info.accelerators,
            cpu_tier: info.cpu_tier,
            system_memory_bytes: info.system_memory_bytes,
            binaries: binaries.into_iter().collect(),
        };

        tracing::info!(
            accelerators = registry.accelerators.len(),
            cpu_tier = ?registry.cpu_tier,
            system_memory_mb = registry.system_memory_bytes / MIB,
            binaries = registry.binaries.len(),
            "capability snapshot assembled"
        );
        Ok(registry)
    }
}

/// Raw result of probing the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub accelerators: Vec<Accelerator>,
    pub cpu_tier: CpuTier,
    pub system_memory_bytes: u64,
}

impl HardwareInfo {
    /// Detect GPUs, CPU tier and total RAM.
    pub fn detect() -> Self {
        Self::detect_with(None)
    }

    /// Detect CPU tier and total RAM; GPUs only when `accelerators` is
    /// `None`.
    pub fn detect_with(accelerators: Option<Vec<Accelerator>>) -> Self {
        let accelerators = accelerators.unwrap_or_else(|| {
            let mut found = detect_nvidia();
            found.extend(detect_amd());
            found
        });

        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        Self {
            accelerators,
            cpu_tier: CpuTier::detect(),
            system_memory_bytes: sys.total_memory(),
        }
    }
}

// ============================================================================
// Vendor queries
// ============================================================================

/// `nvidia-smi --query-gpu=name,memory.total --format=csv,noheader,nounits`.
///
/// If the tool fails but the device node exists, the GPU is still reported
/// with unknown VRAM.
fn detect_nvidia() -> Vec<Accelerator> {
    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
        .output();

    match output {
        Ok(out) if out.status.success() => parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout)),
        _ if Path::new("/dev/nvidia0").exists() => {
            vec![Accelerator::new(GpuVendor::Nvidia, "NVIDIA GPU", 0)]
        }
        _ => Vec::new(),
    }
}

/// `rocm-smi --showmeminfo vram --csv`, falling back to `/dev/kfd`.
fn detect_amd() -> Vec<Accelerator> {
    let output = std::process::Command::new("rocm-smi")
        .args(["--showmeminfo", "vram", "--csv"])
        .output();

    match output {
        Ok(out) if out.status.success() => parse_rocm_smi(&String::from_utf8_lossy(&out.stdout)),
        _ if Path::new("/dev/kfd").exists() => {
            vec![Accelerator::new(GpuVendor::Amd, "AMD GPU", 0)]
        }
        _ => Vec::new(),
    }
}

/// Lines look like `NVIDIA GeForce RTX 3090, 24576` (MiB).
fn parse_nvidia_smi(stdout: &str) -> Vec<Accelerator> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let (name, mib) = match line.rsplit_once(',') {
                Some((name, mib)) => (name.trim(), mib.trim().parse::<u64>().unwrap_or(0)),
                None => (line.trim(), 0),
            };
            Accelerator::new(GpuVendor::Nvidia, name, mib * MIB)
        })
        .collect()
}

/// CSV: `device,VRAM Total Memory (B),VRAM Total Used Memory (B)`.
fn parse_rocm_smi(stdout: &str) -> Vec<Accelerator> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split(',');
            let device = parts.next()?.trim();
            if device.is_empty() {
                return None;
            }
            let bytes = parts
                .next()
                .and_then(|b| b.trim().parse::<u64>().ok())
                .unwrap_or(0);
            Some(Accelerator::new(GpuVendor::Amd, device, bytes))
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
