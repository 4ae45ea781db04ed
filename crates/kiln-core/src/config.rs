//! Runtime configuration.
//!
//! Read once at startup from a JSON file. Only the keys below are consumed;
//! anything else in the document is ignored.
//!
//! ```json
//! {
//!   "compute": { "backend": "vulkan", "whitelist": ["gpu"] },
//!   "cuda": { "max_registers": 64, "jit_opt_level": 4 },
//!   "vulkan": { "fence_wait_polling": true }
//! }
//! ```
//!
//! # Environment
//!
//! - `KILN_CONFIG` - path of the JSON file read by [`Config::from_env`]
//! - `KILN_BACKEND` - backend override (see [`backend_override`])
//! - `KILN_DEVICES` - comma-separated device whitelist (see [`device_whitelist`])

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Backend selection and device filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Preferred backend name ("cuda", "vulkan", "host"), `None` for auto.
    pub backend: Option<String>,
    /// Device name substrings or kinds ("cpu", "gpu", "accelerator").
    pub whitelist: Vec<String>,
}

/// CUDA backend options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CudaConfig {
    /// Pretend the driver reports this sm (e.g. 75), 0 = off.
    pub force_driver_sm: u32,
    /// Compile for this sm instead of the device's, 0 = off.
    pub force_compile_sm: u32,
    /// Always JIT from PTX, never load CUBIN.
    pub force_ptx: bool,
    /// Allow the internal driver API path (depth-compare samplers).
    pub use_internal_api: bool,
    /// Register cap passed to the JIT, 0 = driver default.
    pub max_registers: u32,
    /// JIT optimization level (0..=4).
    pub jit_opt_level: u32,
    /// Capture JIT info/error logs.
    pub jit_verbose: bool,
    /// Emit debug info when JIT-ing.
    pub jit_debug_info: bool,
    /// Emit line info when JIT-ing.
    pub jit_line_info: bool,
}

impl Default for CudaConfig {
    fn default() -> Self {
        Self {
            force_driver_sm: 0,
            force_compile_sm: 0,
            force_ptx: false,
            use_internal_api: false,
            max_registers: 0,
            jit_opt_level: 4,
            jit_verbose: false,
            jit_debug_info: false,
            jit_line_info: false,
        }
    }
}

/// OpenCL options. Consumed by target selection only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenClConfig {
    /// Platform index to start the search from.
    pub platform: u32,
    /// Never use SPIR-V binaries.
    pub disable_spirv: bool,
    /// Validate SPIR-V binaries before loading.
    pub force_spirv_check: bool,
    /// Work around drivers mis-handling SPIR-V kernel parameters.
    pub spirv_param_workaround: bool,
}

/// Vulkan backend options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VulkanConfig {
    /// Poll fence status instead of a blocking wait.
    pub fence_wait_polling: bool,
    /// Hand non-blocking submissions to the completion thread pool.
    pub no_blocking: bool,
}

/// Toolchain invocation options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Compiler executable, `None` for `kiln-cc` on `PATH`.
    pub compiler: Option<String>,
    /// Extra flags passed on every invocation.
    pub flags: Vec<String>,
    /// Compile with debug info.
    pub debug: bool,
    /// Compile with profiling instrumentation.
    pub profiling: bool,
    /// Log every produced binary.
    pub log_binaries: bool,
    /// Keep temporary files.
    pub keep_temp: bool,
}

/// VR options. Parsed and exposed, consumed by nothing in this workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VrConfig {
    /// Enable hand tracking.
    pub hand_tracking: bool,
    /// Enable extra trackers.
    pub trackers: bool,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend / device selection.
    pub compute: ComputeConfig,
    /// CUDA options.
    pub cuda: CudaConfig,
    /// OpenCL options.
    pub opencl: OpenClConfig,
    /// Vulkan options.
    pub vulkan: VulkanConfig,
    /// Toolchain options.
    pub toolchain: ToolchainConfig,
    /// VR options.
    pub vr: VrConfig,
}

impl Config {
    /// Parses a JSON document. Unknown keys are ignored.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Loads the file named by `KILN_CONFIG`, then applies `KILN_BACKEND` and
    /// `KILN_DEVICES`. A missing or broken file falls back to defaults.
    pub fn from_env() -> Self {
        let mut config = match env::var("KILN_CONFIG") {
            Ok(path) => Self::load(&path).unwrap_or_else(|e| {
                warn!(path = %path, error = %e, "failed to load config, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        };
        if let Some(backend) = backend_override() {
            config.compute.backend = Some(backend);
        }
        if let Some(whitelist) = device_whitelist() {
            config.compute.whitelist = whitelist;
        }
        config
    }
}

/// Backend override from `KILN_BACKEND`.
pub fn backend_override() -> Option<String> {
    env::var("KILN_BACKEND")
        .ok()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

/// Device whitelist from `KILN_DEVICES`.
pub fn device_whitelist() -> Option<Vec<String>> {
    env::var("KILN_DEVICES").ok().map(|v| parse_whitelist(&v)).filter(|w| !w.is_empty())
}

/// Splits a comma-separated whitelist, trimming and lower-casing entries.
pub fn parse_whitelist(s: &str) -> Vec<String> {
    s.split(',')
        .map(|e| e.trim().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cuda.jit_opt_level, 4);
        assert!(!config.vulkan.no_blocking);
        assert!(config.compute.whitelist.is_empty());
    }

    #[test]
    fn test_recognized_keys() {
        let config = Config::from_json_str(
            r#"{
                "cuda": { "force_ptx": true, "max_registers": 32 },
                "opencl": { "platform": 1, "disable_spirv": true },
                "vulkan": { "fence_wait_polling": true },
                "toolchain": { "keep_temp": true },
                "vr": { "hand_tracking": true }
            }"#,
        )
        .unwrap();
        assert!(config.cuda.force_ptx);
        assert_eq!(config.cuda.max_registers, 32);
        assert_eq!(config.cuda.jit_opt_level, 4);
        assert_eq!(config.opencl.platform, 1);
        assert!(config.vulkan.fence_wait_polling);
        assert!(config.toolchain.keep_temp);
        assert!(config.vr.hand_tracking);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = Config::from_json_str(r#"{ "audio": { "volume": 3 }, "cuda": { "nope": 1 } }"#).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_malformed_json() {
        assert!(Config::from_json_str("{ cuda: ").is_err());
    }

    #[test]
    fn test_parse_whitelist() {
        assert_eq!(parse_whitelist(" GPU, rtx ,,"), vec!["gpu", "rtx"]);
    }
}
