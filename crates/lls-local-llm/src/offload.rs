//! GPU layer offload planning
//!
//! Decides how many model layers go to accelerator memory, or, on hosts
//! without usable accelerator memory but with plenty of RAM, pins the model
//! in RAM with `--mlock` instead. The two strategies never combine.

use crate::hardware::Accelerator;
use serde::{Deserialize, Serialize};

/// Per-layer headroom for runtime overhead (KV cache, scratch buffers).
pub const LAYER_MEMORY_OVERHEAD: f64 = 1.10;

/// System memory above which a CPU-only model is locked in RAM.
pub const MEMORY_LOCK_THRESHOLD_BYTES: u64 = 16 * 1024 * 1024 * 1024;

/// Derived per request, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadPlan {
    pub layer_count: u32,
    pub use_memory_lock: bool,
}

impl OffloadPlan {
    pub fn cpu_only() -> Self {
        Self::default()
    }

    pub fn gpu_layers(layer_count: u32) -> Self {
        Self {
            layer_count,
            use_memory_lock: false,
        }
    }

    pub fn memory_lock() -> Self {
        Self {
            layer_count: 0,
            use_memory_lock: true,
        }
    }
}

/// How many of `total_layers` fit into `offload_percent`% of
/// `accelerator_memory_bytes`, always within `[0, total_layers]`.
pub fn estimate_layers(
    accelerator_memory_bytes: u64,
    model_size_bytes: u64,
    total_layers: u32,
    offload_percent: f64,
) -> u32 {
    if total_layers == 0 || accelerator_memory_bytes == 0 || !offload_percent.is_finite() {
        return 0;
    }

    let percent = offload_percent.clamp(0.0, 100.0);
    let available = accelerator_memory_bytes as f64 * (percent / 100.0);
    let per_layer = model_size_bytes as f64 * LAYER_MEMORY_OVERHEAD / f64::from(total_layers);

    if per_layer <= 0.0 {
        return if available > 0.0 { total_layers } else { 0 };
    }

    (available / per_layer)
        .floor()
        .clamp(0.0, f64::from(total_layers)) as u32
}

/// Plan offload for one request.
///
/// An accelerator with zero (unknown) memory counts as absent.
pub fn plan_offload(
    accelerator: Option<&Accelerator>,
    system_memory_bytes: u64,
    model_size_bytes: u64,
    total_layers: u32,
    offload_percent: f64,
) -> OffloadPlan {
    match accelerator.filter(|a| a.has_usable_memory()) {
        Some(acc) => OffloadPlan::gpu_layers(estimate_layers(
            acc.total_memory_bytes,
            model_size_bytes,
            total_layers,
            offload_percent,
        )),
        None if system_memory_bytes > MEMORY_LOCK_THRESHOLD_BYTES => OffloadPlan::memory_lock(),
        None => OffloadPlan::cpu_only(),
    }
}
