//! Compute device selection and host hardware discovery.
//!
//! Backends receive the resolved device name (e.g. `{device}` in command
//! templates, `device` in remote requests). Nothing here touches a GPU
//! directly; detection only inspects the host.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Device a backend should run its model on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Pick the best device present on this host.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Mps,
    Mlx,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Mps => "mps",
            Device::Mlx => "mlx",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Device::Auto),
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda),
            "mps" => Ok(Device::Mps),
            "mlx" => Ok(Device::Mlx),
            other => Err(format!("unknown device '{other}'")),
        }
    }
}

/// What the host offers, as far as can be told without loading a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub os: String,
    pub arch: String,
    pub cpus: usize,
    pub apple_silicon: bool,
    pub cuda_available: bool,
}

impl HardwareInfo {
    pub fn detect() -> Self {
        let os = std::env::consts::OS.to_string();
        let arch = std::env::consts::ARCH.to_string();
        let apple_silicon = os == "macos" && arch == "aarch64";
        let cuda_available = Path::new("/proc/driver/nvidia/version").exists()
            || which("nvidia-smi").is_some();
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let info = Self {
            os,
            arch,
            cpus,
            apple_silicon,
            cuda_available,
        };
        debug!(?info, "Detected hardware");
        info
    }

    /// Best device for this host: mlx, then mps on Apple silicon, then cuda,
    /// otherwise cpu.
    pub fn recommended_device(&self, prefer_mlx: bool) -> Device {
        if self.apple_silicon {
            if prefer_mlx {
                Device::Mlx
            } else {
                Device::Mps
            }
        } else if self.cuda_available {
            Device::Cuda
        } else {
            Device::Cpu
        }
    }
}

/// Resolve `Auto` against the host; explicit devices pass through.
pub fn resolve(device: Device, hardware: &HardwareInfo, prefer_mlx: bool) -> Device {
    match device {
        Device::Auto => hardware.recommended_device(prefer_mlx),
        explicit => explicit,
    }
}

/// Locate an executable on `PATH`.
pub fn which(program: &str) -> Option<std::path::PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(apple_silicon: bool, cuda_available: bool) -> HardwareInfo {
        HardwareInfo {
            os: "test".into(),
            arch: "test".into(),
            cpus: 4,
            apple_silicon,
            cuda_available,
        }
    }

    #[test]
    fn test_recommended_device_priority() {
        assert_eq!(host(true, false).recommended_device(true), Device::Mlx);
        assert_eq!(host(true, false).recommended_device(false), Device::Mps);
        assert_eq!(host(false, true).recommended_device(true), Device::Cuda);
        assert_eq!(host(false, false).recommended_device(true), Device::Cpu);
    }

    #[test]
    fn test_explicit_device_is_kept() {
        assert_eq!(resolve(Device::Cpu, &host(false, true), true), Device::Cpu);
        assert_eq!(resolve(Device::Auto, &host(false, true), true), Device::Cuda);
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("CUDA".parse::<Device>(), Ok(Device::Cuda));
        assert!("tpu".parse::<Device>().is_err());
    }
}
