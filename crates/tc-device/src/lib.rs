#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tc_core::{DenseTensor, Device};
use thiserror::Error;

/// Environment override for capability probing: `none` hides every
/// capability, a comma separated list (`nvgpu`) keeps only those named.
pub const CAPABILITY_FAKE_ENV: &str = "TC_CAPABILITY_FAKE";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: Device, actual: Device },
    #[error("unknown architecture `{name}` (expected x86 or nvgpu)")]
    UnknownArch { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86,
    NvGpu,
}

impl Arch {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::NvGpu => "nvgpu",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = DeviceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "x86" | "host" => Ok(Self::X86),
            "nvgpu" | "gpu" => Ok(Self::NvGpu),
            _ => Err(DeviceError::UnknownArch {
                name: value.to_owned(),
            }),
        }
    }
}

/// Compilation target handed to the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub arch: Arch,
}

impl Target {
    #[must_use]
    pub const fn host() -> Self {
        Self { arch: Arch::X86 }
    }

    #[must_use]
    pub const fn nvgpu() -> Self {
        Self { arch: Arch::NvGpu }
    }

    #[must_use]
    pub const fn device(self) -> Device {
        match self.arch {
            Arch::X86 => Device::Cpu,
            Arch::NvGpu => Device::NvGpu,
        }
    }

    /// Capability a build must have for this target to compile.
    #[must_use]
    pub const fn required_capability(self) -> Option<Capability> {
        match self.arch {
            Arch::X86 => None,
            Arch::NvGpu => Some(Capability::NvGpu),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target({})", self.arch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    NvGpu,
}

impl Capability {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NvGpu => "nvgpu",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "nvgpu" | "gpu" => Some(Self::NvGpu),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether this build carries the virtual accelerator backend.
#[inline]
#[must_use]
pub const fn is_compiled_with_nvgpu() -> bool {
    cfg!(feature = "nvgpu")
}

#[must_use]
pub const fn is_compiled_with(capability: Capability) -> bool {
    match capability {
        Capability::NvGpu => is_compiled_with_nvgpu(),
    }
}

/// Parses a fake capability list. `none` yields an empty set; unknown
/// tokens are ignored.
#[must_use]
pub fn parse_fake_capabilities(raw: &str) -> BTreeSet<Capability> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized == "none" {
        return BTreeSet::new();
    }
    normalized
        .split([',', ';', '|', ' '])
        .filter(|part| !part.is_empty())
        .filter_map(Capability::parse)
        .collect()
}

/// Probe result with an explicit fake override. A fake can hide a compiled
/// capability but never conjure one the build lacks.
#[must_use]
pub fn probe_with(capability: Capability, fake: Option<&str>) -> bool {
    let compiled = is_compiled_with(capability);
    match fake {
        Some(raw) => compiled && parse_fake_capabilities(raw).contains(&capability),
        None => compiled,
    }
}

/// Runtime capability probe honouring [`CAPABILITY_FAKE_ENV`].
#[must_use]
pub fn probe(capability: Capability) -> bool {
    let fake = std::env::var(CAPABILITY_FAKE_ENV).ok();
    let available = probe_with(capability, fake.as_deref());
    tracing::debug!(
        capability = capability.name(),
        compiled = is_compiled_with(capability),
        faked = fake.is_some(),
        available,
        "capability probe"
    );
    available
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    device: Device,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    #[must_use]
    pub fn for_target(target: Target) -> Self {
        Self::new(target.device())
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn ensure_tensor_device(&self, tensor: &DenseTensor) -> Result<(), DeviceError> {
        let actual = tensor.device();
        if actual != self.device {
            return Err(DeviceError::Mismatch {
                expected: self.device,
                actual,
            });
        }
        Ok(())
    }
}
