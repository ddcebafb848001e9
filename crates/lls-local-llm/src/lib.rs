//! # lls-local-llm
//!
//! Hardware-aware dispatch onto local llama.cpp binaries.
//!
//! Picks one installed build for the host in priority order:
//! **CUDA** (NVIDIA present) → **Vulkan** (AMD present) → **AVX2** (CPU),
//! plans how many layers to offload to the GPU, and runs the binary as a
//! supervised child process whose stdout is read line by line.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lls_local_llm::{
//!     CapabilityRegistry, DispatchConfig, LaunchSpec, SelectionPolicy, plan_offload,
//!     select_binary,
//! };
//!
//! let config = DispatchConfig::new("./data/llama-binaries");
//! let registry = CapabilityRegistry::assemble(&config).unwrap();
//! let binary = select_binary(&registry, SelectionPolicy::Strict).unwrap();
//! let plan = plan_offload(
//!     registry.primary_accelerator(),
//!     registry.system_memory_bytes,
//!     4_000_000_000,
//!     config.total_layers,
//!     config.offload_percent,
//! );
//! let spec = LaunchSpec::new(&binary.path, "/models/llama-7b.gguf", "user: hello")
//!     .with_offload(plan);
//! println!("{:?}", spec.to_args());
//! ```

pub mod binaries;
pub mod config;
pub mod error;
pub mod hardware;
pub mod launcher;
pub mod offload;
pub mod selector;

pub use binaries::{BackendTag, BinaryDescriptor, discover_binaries};
pub use config::DispatchConfig;
pub use error::{BackendError, BackendResult};
pub use hardware::{Accelerator, CapabilityRegistry, CpuTier, GpuVendor, HardwareInfo};
pub use launcher::{
    BackendProcess, ChildProcessLauncher, ExitOutcome, InferenceProcess, LaunchSpec,
    ProcessLauncher, flatten_prompt,
};
pub use offload::{OffloadPlan, estimate_layers, plan_offload};
pub use selector::{
    SelectionPolicy, list_compatible_binaries, offload_accelerator, preferred_tags, select_binary,
};
