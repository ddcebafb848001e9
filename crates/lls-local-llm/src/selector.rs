//! Binary selection
//!
//! Picks one executable for the host in a fixed preference order:
//! NVIDIA present → `cuda`, else AMD present → `vulkan`, else `avx2`.
//! The order depends only on which vendors are present, never on their
//! position in the accelerator list or on the request.

use crate::binaries::{BackendTag, BinaryDescriptor};
use crate::error::{BackendError, BackendResult};
use crate::hardware::{Accelerator, CapabilityRegistry, CpuTier, GpuVendor};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What to do when the preferred tag has no installed binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Try only the single best-guess tag; a miss fails the request.
    #[default]
    Strict,
    /// Walk down to weaker builds: cuda → vulkan → avx2, vulkan → avx2.
    FallbackChain,
}

/// Tags the selector will try, in order.
pub fn preferred_tags(registry: &CapabilityRegistry, policy: SelectionPolicy) -> Vec<BackendTag> {
    let chain: &[BackendTag] = if registry.has_vendor(GpuVendor::Nvidia) {
        &[BackendTag::Cuda, BackendTag::Vulkan, BackendTag::Avx2]
    } else if registry.has_vendor(GpuVendor::Amd) {
        &[BackendTag::Vulkan, BackendTag::Avx2]
    } else {
        &[BackendTag::Avx2]
    };

    match policy {
        SelectionPolicy::Strict => chain[..1].to_vec(),
        SelectionPolicy::FallbackChain => chain.to_vec(),
    }
}

/// Select the binary for the current hardware.
///
/// When several binaries carry the wanted tag the first by path wins.
pub fn select_binary(
    registry: &CapabilityRegistry,
    policy: SelectionPolicy,
) -> BackendResult<&BinaryDescriptor> {
    let tried = preferred_tags(registry, policy);
    for tag in &tried {
        if let Some(found) = registry.binaries.iter().find(|b| b.has_tag(*tag)) {
            debug!(tag = %tag, binary = %found.path.display(), "selected backend binary");
            return Ok(found);
        }
        debug!(tag = %tag, "no installed binary for tag");
    }
    Err(BackendError::NoCompatibleBinary { tried })
}

/// Whether a descriptor could run on this host at all.
///
/// GPU tags need a matching device; CPU tags need the instruction set.
/// A descriptor with no tags is assumed to be a generic build.
pub fn is_compatible(binary: &BinaryDescriptor, registry: &CapabilityRegistry) -> bool {
    let has_gpu = !registry.accelerators.is_empty();
    binary.tags.iter().all(|tag| match tag {
        BackendTag::Cuda => registry.has_vendor(GpuVendor::Nvidia),
        BackendTag::Sycl => registry.has_vendor(GpuVendor::Intel),
        BackendTag::Vulkan | BackendTag::Clblast | BackendTag::Kompute => has_gpu,
        BackendTag::Avx512 => registry.cpu_tier >= CpuTier::Avx512,
        BackendTag::Avx2 => registry.cpu_tier >= CpuTier::Avx2,
        BackendTag::Avx => registry.cpu_tier >= CpuTier::Avx,
        BackendTag::NoAvx => true,
    })
}

/// The accelerator `binary` can offload layers to.
///
/// CPU builds get `None`, so offload planning falls back to `--mlock` or
/// plain CPU. CUDA and SYCL builds only offload to their own vendor.
pub fn offload_accelerator<'a>(
    registry: &'a CapabilityRegistry,
    binary: &BinaryDescriptor,
) -> Option<&'a Accelerator> {
    if !binary.tags.iter().any(BackendTag::is_gpu) {
        return None;
    }
    let vendor = if binary.has_tag(BackendTag::Cuda) {
        Some(GpuVendor::Nvidia)
    } else if binary.has_tag(BackendTag::Sycl) {
        Some(GpuVendor::Intel)
    } else {
        None
    };
    match vendor {
        Some(vendor) => registry.accelerators.iter().find(|a| a.vendor == vendor),
        None => registry.primary_accelerator(),
    }
}

/// Every installed binary that [`is_compatible`] with the host.
pub fn list_compatible_binaries(registry: &CapabilityRegistry) -> Vec<&BinaryDescriptor> {
    registry
        .binaries
        .iter()
        .filter(|b| is_compatible(b, registry))
        .collect()
}
