//! Installed llama.cpp binaries and their hardware tags
//!
//! Release archives name their hardware target in the file or folder name
//! (`llama-b3672-bin-win-cuda-cu12.2.0-x64`, `llama-b3672-bin-win-avx2-x64`,
//! ...). Those keywords become [`BackendTag`]s, which are the only key the
//! selector matches on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Hardware keyword extracted from a binary's file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendTag {
    /// NVIDIA CUDA build
    Cuda,
    /// Vulkan compute build (AMD, Intel, NVIDIA)
    Vulkan,
    /// OpenCL via CLBlast
    Clblast,
    /// Intel oneAPI SYCL build
    Sycl,
    /// Kompute (Vulkan-based) build
    Kompute,
    /// CPU build requiring AVX-512
    Avx512,
    /// CPU build requiring AVX2
    Avx2,
    /// CPU build requiring AVX
    Avx,
    /// CPU build with no vector extensions
    NoAvx,
}

impl BackendTag {
    pub const ALL: [BackendTag; 9] = [
        BackendTag::Cuda,
        BackendTag::Vulkan,
        BackendTag::Clblast,
        BackendTag::Sycl,
        BackendTag::Kompute,
        BackendTag::Avx512,
        BackendTag::Avx2,
        BackendTag::Avx,
        BackendTag::NoAvx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendTag::Cuda => "cuda",
            BackendTag::Vulkan => "vulkan",
            BackendTag::Clblast => "clblast",
            BackendTag::Sycl => "sycl",
            BackendTag::Kompute => "kompute",
            BackendTag::Avx512 => "avx512",
            BackendTag::Avx2 => "avx2",
            BackendTag::Avx => "avx",
            BackendTag::NoAvx => "noavx",
        }
    }

    /// Whether the tag denotes a GPU offload build.
    pub fn is_gpu(&self) -> bool {
        matches!(
            self,
            BackendTag::Cuda
                | BackendTag::Vulkan
                | BackendTag::Clblast
                | BackendTag::Sycl
                | BackendTag::Kompute
        )
    }

    /// Extract every tag named in `name` (case-insensitive).
    ///
    /// The CPU keywords overlap (`noavx` and `avx2` both contain `avx`), so
    /// the longer ones are consumed before the shorter ones are looked for.
    pub fn parse_name(name: &str) -> BTreeSet<BackendTag> {
        let mut rest = name.to_ascii_lowercase();
        let mut tags = BTreeSet::new();

        for tag in [
            BackendTag::Cuda,
            BackendTag::Vulkan,
            BackendTag::Clblast,
            BackendTag::Sycl,
            BackendTag::Kompute,
            BackendTag::NoAvx,
            BackendTag::Avx512,
            BackendTag::Avx2,
            BackendTag::Avx,
        ] {
            if rest.contains(tag.as_str()) {
                tags.insert(tag);
                rest = rest.replace(tag.as_str(), " ");
            }
        }
        tags
    }
}

impl std::fmt::Display for BackendTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One installed executable variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BinaryDescriptor {
    pub path: PathBuf,
    pub tags: BTreeSet<BackendTag>,
}

impl BinaryDescriptor {
    /// Tag a binary from its own file name.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tags = path
            .file_name()
            .map(|n| BackendTag::parse_name(&n.to_string_lossy()))
            .unwrap_or_default();
        Self { path, tags }
    }

    pub fn with_tags(path: impl Into<PathBuf>, tags: impl IntoIterator<Item = BackendTag>) -> Self {
        Self {
            path: path.into(),
            tags: tags.into_iter().collect(),
        }
    }

    pub fn has_tag(&self, tag: BackendTag) -> bool {
        self.tags.contains(&tag)
    }
}

/// Scan the binaries directory.
///
/// Two layouts are recognised:
/// - an executable placed directly in `dir`, tagged by its own file name;
/// - a release archive extracted into a sub-directory, tagged by the
///   directory name and represented by the first file inside it whose name
///   is in `executable_names`.
///
/// Loose files without any tag are skipped (runtime DLLs, archives, ...).
/// A missing directory yields an empty list.
pub fn discover_binaries(
    dir: &Path,
    executable_names: &[String],
) -> std::io::Result<Vec<BinaryDescriptor>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(dir = %dir.display(), "binaries directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        let name = entry.file_name().to_string_lossy().into_owned();

        if file_type.is_dir() {
            if let Some(exe) = find_executable(&path, executable_names)? {
                found.push(BinaryDescriptor {
                    path: exe,
                    tags: BackendTag::parse_name(&name),
                });
            }
        } else if looks_executable(&path) {
            let descriptor = BinaryDescriptor::from_path(&path);
            if !descriptor.tags.is_empty() {
                found.push(descriptor);
            }
        }
    }

    found.sort();
    debug!(dir = %dir.display(), count = found.len(), "discovered backend binaries");
    Ok(found)
}

fn find_executable(dir: &Path, executable_names: &[String]) -> std::io::Result<Option<PathBuf>> {
    for name in executable_names {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn looks_executable(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        None => true,
        Some(ext) => ext.eq_ignore_ascii_case("exe"),
    }
}
