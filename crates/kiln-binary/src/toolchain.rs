//! External toolchain interface.
//!
//! Compiling kernel source is not done in-process. A [`Toolchain`] turns a
//! source file or string into one intermediate binary (PTX, SPIR, SPIR-V,
//! AIR or a host object) plus the function metadata of every entry point.
//! [`CommandToolchain`] does this by running a compiler executable.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use kiln_core::FunctionInfo;
use kiln_core::config::ToolchainConfig;
use tracing::{debug, info, trace, warn};

use crate::target::Target;
use crate::{BinaryError, BinaryResult};

/// Compiler executable used when the config names none.
pub const DEFAULT_COMPILER: &str = "kiln-cc";

/// Intermediate format emitted by the toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolchainTarget {
    /// NVIDIA PTX text.
    Ptx,
    /// SPIR 1.2 (LLVM bitcode) for OpenCL.
    Spir,
    /// SPIR-V for OpenCL.
    SpirvOpenCl,
    /// SPIR-V for Vulkan.
    SpirvVulkan,
    /// Apple AIR.
    Air,
    /// Host object code.
    Host,
}

impl ToolchainTarget {
    /// Value passed to `--target`.
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Ptx => "ptx",
            Self::Spir => "spir",
            Self::SpirvOpenCl => "spirv-opencl",
            Self::SpirvVulkan => "spirv-vulkan",
            Self::Air => "air",
            Self::Host => "host",
        }
    }

    /// File extension of the emitted binary.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Ptx => "ptx",
            Self::Spir => "bc",
            Self::SpirvOpenCl | Self::SpirvVulkan => "spv",
            Self::Air => "air",
            Self::Host => "o",
        }
    }
}

impl fmt::Display for ToolchainTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag())
    }
}

/// Per-compilation options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileOptions {
    /// Overrides the intermediate derived from the [`Target`].
    pub target: Option<ToolchainTarget>,
    /// Extra command line flags.
    pub cli: Vec<String>,
    /// Register cap, 0 = toolchain default. CUDA targets carry their own.
    pub max_registers: u32,
    /// Suppress compiler diagnostics output.
    pub silence_debug_output: bool,
    /// Emit debug info.
    pub debug: bool,
    /// Emit profiling instrumentation.
    pub profiling: bool,
}

impl CompileOptions {
    /// Options implied by the `toolchain` config section.
    pub fn from_config(config: &ToolchainConfig) -> Self {
        Self {
            debug: config.debug,
            profiling: config.profiling,
            ..Default::default()
        }
    }
}

/// Where the program source comes from.
#[derive(Debug, Clone, Copy)]
pub enum ProgramSource<'a> {
    /// A source file on disk.
    File(&'a Path),
    /// Source text held in memory.
    Memory(&'a str),
}

/// Output of one successful compilation.
#[derive(Debug, Clone, Default)]
pub struct ProgramData {
    /// The emitted binary.
    pub data: Vec<u8>,
    /// Metadata of every entry point in `data`.
    pub functions: Vec<FunctionInfo>,
    /// Options the binary was compiled with.
    pub options: CompileOptions,
    /// Version word of the toolchain that produced it.
    pub toolchain_version: u32,
}

/// Anything that can compile a program for a [`Target`].
///
/// Implementations are shared across the build pool, so they must be
/// `Send + Sync`.
pub trait Toolchain: Send + Sync {
    /// Compiles `source` for `target`.
    fn compile(&self, target: &Target, source: ProgramSource<'_>, options: &CompileOptions) -> BinaryResult<ProgramData>;

    /// Toolchain version word (see [`version_word`]), 0 if unknown.
    fn version(&self) -> u32;
}

/// Packs `major.minor.patch` as `major * 10000 + minor * 100 + patch`.
#[inline]
pub const fn version_word(major: u32, minor: u32, patch: u32) -> u32 {
    major * 10000 + minor * 100 + patch
}

/// Finds the first `x[.y[.z]]` token in `text` and packs it.
///
/// ```
/// use kiln_binary::parse_version_word;
/// assert_eq!(parse_version_word("kiln-cc version 17.0.6 (release)"), Some(170006));
/// assert_eq!(parse_version_word("no digits"), None);
/// ```
pub fn parse_version_word(text: &str) -> Option<u32> {
    let token = text.split_whitespace().find(|t| t.starts_with(|c: char| c.is_ascii_digit()))?;
    let mut parts = token.split('.').map(|p| {
        let digits: String = p.chars().take_while(char::is_ascii_digit).collect();
        digits.parse::<u32>().ok()
    });
    let major = parts.next().flatten()?;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some(version_word(major, minor.min(99), patch.min(99)))
}

// =============================================================================
// CommandToolchain
// =============================================================================

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Runs an external compiler executable.
///
/// Invocation:
///
/// ```text
/// <compiler> --target <fmt> [target flags] [-g] [--profile] [-w] [flags...]
///            -o <out> --function-info <out.json> <input>
/// ```
///
/// The compiler writes the binary to `<out>` and a JSON array of
/// [`FunctionInfo`] to `<out.json>`.
#[derive(Debug)]
pub struct CommandToolchain {
    compiler: PathBuf,
    flags: Vec<String>,
    log_binaries: bool,
    keep_temp: bool,
    version: OnceLock<u32>,
}

impl CommandToolchain {
    /// Uses `compiler` with no extra flags.
    pub fn new(compiler: impl Into<PathBuf>) -> Self {
        Self {
            compiler: compiler.into(),
            flags: Vec::new(),
            log_binaries: false,
            keep_temp: false,
            version: OnceLock::new(),
        }
    }

    /// Builds from the `toolchain` config section.
    pub fn from_config(config: &ToolchainConfig) -> Self {
        let compiler = config.compiler.clone().unwrap_or_else(|| DEFAULT_COMPILER.to_string());
        Self {
            flags: config.flags.clone(),
            log_binaries: config.log_binaries,
            keep_temp: config.keep_temp,
            ..Self::new(compiler)
        }
    }

    /// Compiler executable.
    pub fn compiler(&self) -> &Path {
        &self.compiler
    }

    fn target_args(target: &Target, options: &CompileOptions) -> Vec<String> {
        let mut args = Vec::new();
        match target {
            Target::Cuda(t) => {
                args.push(format!("--sm={}{}", t.sm_major, t.sm_minor));
                args.push(format!("--ptx-isa={}{}", t.ptx_isa_major, t.ptx_isa_minor));
                let max_registers = if t.max_registers != 0 { t.max_registers } else { options.max_registers };
                if max_registers != 0 {
                    args.push(format!("--max-registers={max_registers}"));
                }
                if t.image_depth_compare_support {
                    args.push("--depth-compare".into());
                }
            }
            Target::OpenCl(t) => {
                args.push(format!("--cl-version={}.{}", t.major, t.minor));
                if t.simd_width != 0 {
                    args.push(format!("--simd-width={}", t.simd_width));
                }
            }
            Target::Metal(t) => {
                args.push(format!("--metal-version={}.{}", t.major, t.minor));
                if t.is_ios {
                    args.push("--ios".into());
                }
                if t.simd_width != 0 {
                    args.push(format!("--simd-width={}", t.simd_width));
                }
            }
            Target::Host(t) => {
                args.push(format!("--arch={:?}", t.arch).to_ascii_lowercase());
                args.push(format!("--cpu-tier={}", t.cpu_tier));
            }
            Target::Vulkan(t) => {
                args.push(format!("--vulkan-version={}.{}", t.vulkan_major, t.vulkan_minor));
                args.push(format!("--spirv-version={}.{}", t.spirv_major, t.spirv_minor));
                if t.simd_width != 0 {
                    args.push(format!("--simd-width={}", t.simd_width));
                }
            }
        }
        args
    }

    /// Full argument list for one invocation.
    pub fn command_args(
        &self,
        target: &Target,
        options: &CompileOptions,
        input: &Path,
        output: &Path,
        sidecar: &Path,
    ) -> Vec<OsString> {
        let toolchain_target = options.target.unwrap_or_else(|| target.toolchain_target());
        let mut args: Vec<OsString> = vec!["--target".into(), toolchain_target.flag().into()];
        args.extend(Self::target_args(target, options).into_iter().map(OsString::from));
        if options.debug {
            args.push("-g".into());
        }
        if options.profiling {
            args.push("--profile".into());
        }
        if options.silence_debug_output {
            args.push("-w".into());
        }
        args.extend(self.flags.iter().map(OsString::from));
        args.extend(options.cli.iter().map(OsString::from));
        args.push("-o".into());
        args.push(output.into());
        args.push("--function-info".into());
        args.push(sidecar.into());
        args.push(input.into());
        args
    }

    fn temp_dir() -> BinaryResult<PathBuf> {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("kiln-cc-{}-{n}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn run(&self, target: &Target, source: ProgramSource<'_>, options: &CompileOptions, dir: &Path) -> BinaryResult<ProgramData> {
        let fail = |message: String| BinaryError::Toolchain { target: target.to_string(), message };

        let input = match source {
            ProgramSource::File(path) => path.to_path_buf(),
            ProgramSource::Memory(code) => {
                let path = dir.join("source.kiln");
                std::fs::write(&path, code)?;
                path
            }
        };
        let toolchain_target = options.target.unwrap_or_else(|| target.toolchain_target());
        let output = dir.join(format!("program.{}", toolchain_target.extension()));
        let sidecar = dir.join("program.json");

        let args = self.command_args(target, options, &input, &output, &sidecar);
        trace!(compiler = %self.compiler.display(), ?args, "invoking toolchain");

        let result = Command::new(&self.compiler)
            .args(&args)
            .output()
            .map_err(|e| fail(format!("failed to run {}: {e}", self.compiler.display())))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(fail(format!("{} ({})", stderr.trim(), result.status)));
        }
        if !options.silence_debug_output {
            let stderr = String::from_utf8_lossy(&result.stderr);
            if !stderr.trim().is_empty() {
                warn!(compile_target = %target, "{}", stderr.trim());
            }
        }

        let data = std::fs::read(&output).map_err(|e| fail(format!("missing output {}: {e}", output.display())))?;
        let sidecar_text = std::fs::read_to_string(&sidecar)
            .map_err(|e| fail(format!("missing function info {}: {e}", sidecar.display())))?;
        let functions: Vec<FunctionInfo> =
            serde_json::from_str(&sidecar_text).map_err(|e| fail(format!("bad function info: {e}")))?;

        if self.log_binaries {
            info!(compile_target = %target, bytes = data.len(), functions = functions.len(), path = %output.display(), "compiled binary");
        }

        Ok(ProgramData {
            data,
            functions,
            options: options.clone(),
            toolchain_version: self.version(),
        })
    }
}

impl Toolchain for CommandToolchain {
    fn compile(&self, target: &Target, source: ProgramSource<'_>, options: &CompileOptions) -> BinaryResult<ProgramData> {
        let dir = Self::temp_dir()?;
        let result = self.run(target, source, options, &dir);
        if self.keep_temp {
            debug!(dir = %dir.display(), "keeping toolchain temp files");
        } else if let Err(e) = std::fs::remove_dir_all(&dir) {
            debug!(dir = %dir.display(), error = %e, "failed to remove toolchain temp dir");
        }
        result
    }

    fn version(&self) -> u32 {
        *self.version.get_or_init(|| {
            let output = match Command::new(&self.compiler).arg("--version").output() {
                Ok(output) => output,
                Err(e) => {
                    warn!(compiler = %self.compiler.display(), error = %e, "cannot query toolchain version");
                    return 0;
                }
            };
            let text = String::from_utf8_lossy(&output.stdout);
            parse_version_word(&text).unwrap_or_else(|| {
                warn!(compiler = %self.compiler.display(), "unrecognized toolchain version output");
                0
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::CudaTarget;

    #[test]
    fn test_version_word() {
        assert_eq!(version_word(1, 2, 3), 10203);
        assert_eq!(parse_version_word("17.0"), Some(170000));
        assert_eq!(parse_version_word("kiln-cc 3.1.4-rc1"), Some(30104));
    }

    #[test]
    fn test_cuda_args() {
        let tc = CommandToolchain::new("cc");
        let target = Target::Cuda(CudaTarget { max_registers: 32, ..CudaTarget::ptx((8, 6), (7, 5)) });
        let options = CompileOptions { debug: true, ..Default::default() };
        let args = tc.command_args(&target, &options, Path::new("in.k"), Path::new("out.ptx"), Path::new("out.json"));
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(&args[..2], ["--target", "ptx"]);
        assert!(args.contains(&"--sm=86".to_string()));
        assert!(args.contains(&"--ptx-isa=75".to_string()));
        assert!(args.contains(&"--max-registers=32".to_string()));
        assert!(args.contains(&"-g".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("in.k"));
    }

    #[test]
    fn test_target_override() {
        let tc = CommandToolchain::new("cc");
        let target: Target = "opencl:3.0".parse().unwrap();
        let options = CompileOptions { target: Some(ToolchainTarget::Spir), ..Default::default() };
        let args = tc.command_args(&target, &options, Path::new("a"), Path::new("b"), Path::new("c"));
        assert_eq!(args[1], OsString::from("spir"));
    }

    #[test]
    fn test_missing_compiler() {
        let tc = CommandToolchain::new("/nonexistent/kiln-cc");
        let target = Target::Cuda(CudaTarget::ptx((7, 5), (6, 3)));
        let err = tc.compile(&target, ProgramSource::Memory("kernel void k() {}"), &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, BinaryError::Toolchain { .. }));
        assert_eq!(tc.version(), 0);
    }
}
