//! Device capability records.
//!
//! A [`Device`] is filled once by a backend at context construction and is
//! read-only afterwards. Universal-binary matching and the runtime's
//! capability gating both read from it.

use std::fmt;

use glam::{UVec2, UVec3};
use serde::{Deserialize, Serialize};

/// Broad device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Host processor.
    Cpu,
    /// Graphics processor.
    Gpu,
    /// Anything else (DSPs, FPGAs, ...).
    Accelerator,
}

impl DeviceKind {
    /// Prefix used in device IDs ("CPU", "GPU", "ACC").
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
            Self::Accelerator => "ACC",
        }
    }

    /// Parses "cpu" / "gpu" / "accelerator" (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(Self::Cpu),
            "gpu" => Some(Self::Gpu),
            "accelerator" | "acc" => Some(Self::Accelerator),
            _ => None,
        }
    }
}

/// Typed device identifier, e.g. `GPU0`, `GPU1`, `CPU0`.
///
/// Indices are assigned per kind in enumeration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    /// Device class.
    pub kind: DeviceKind,
    /// Index within the class.
    pub index: u32,
}

impl DeviceId {
    /// Creates an ID.
    pub const fn new(kind: DeviceKind, index: u32) -> Self {
        Self { kind, index }
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new(DeviceKind::Gpu, 0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.index)
    }
}

/// Hardware vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Arm,
    Qualcomm,
    Host,
    #[default]
    Unknown,
}

impl Vendor {
    /// Guesses the vendor from a driver-reported vendor string or PCI id.
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("nvidia") || lower.contains("0x10de") {
            Self::Nvidia
        } else if lower.contains("amd") || lower.contains("advanced micro devices") || lower.contains("0x1002") {
            Self::Amd
        } else if lower.contains("intel") || lower.contains("0x8086") {
            Self::Intel
        } else if lower.contains("apple") {
            Self::Apple
        } else if lower.contains("arm") {
            Self::Arm
        } else if lower.contains("qualcomm") {
            Self::Qualcomm
        } else {
            Self::Unknown
        }
    }

    /// Maps a PCI vendor id.
    pub fn from_pci_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 | 0x1022 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            0x13B5 => Self::Arm,
            0x5143 => Self::Qualcomm,
            _ => Self::Unknown,
        }
    }
}

/// `major.minor` API / language version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ApiVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl ApiVersion {
    /// Creates a version.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parses "M.m" (extra components and trailing text are ignored).
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split(|c: char| c == '.' || c.is_whitespace());
        let major = parts.next()?.parse().ok()?;
        let minor = parts
            .next()
            .map(|p| p.chars().take_while(char::is_ascii_digit).collect::<String>())
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);
        Some(Self { major, minor })
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// CUDA-specific device values.
#[derive(Debug, Clone, Default)]
pub struct CudaDeviceInfo {
    /// Compute capability (sm major, minor).
    pub sm: UVec2,
    /// Minimal PTX ISA version the driver requires for this sm.
    pub min_req_ptx: UVec2,
    /// Highest PTX ISA version the driver accepts.
    pub max_ptx: UVec2,
    /// Driver version as reported by `cuDriverGetVersion` (e.g. 12040).
    pub driver_version: u32,
    /// Registers per block.
    pub max_registers_per_block: u32,
    /// Multiprocessor count.
    pub sm_count: u32,
}

/// OpenCL-specific device values.
#[derive(Debug, Clone, Default)]
pub struct OpenClDeviceInfo {
    /// Device OpenCL version.
    pub cl_version: ApiVersion,
    /// OpenCL C version.
    pub c_version: ApiVersion,
    /// Highest supported SPIR-V version, `None` if SPIR-V is unsupported.
    pub spirv_version: Option<ApiVersion>,
    /// Platform vendor string.
    pub platform_vendor: String,
}

/// Metal-specific device values.
#[derive(Debug, Clone, Default)]
pub struct MetalDeviceInfo {
    /// Metal language version.
    pub metal_version: ApiVersion,
    /// GPU family number.
    pub family: u32,
    /// GPU family tier.
    pub family_tier: u32,
    /// iOS-class device.
    pub is_ios: bool,
}

/// Vulkan-specific device values.
#[derive(Debug, Clone, Default)]
pub struct VulkanDeviceInfo {
    /// Instance/device Vulkan version.
    pub vulkan_version: ApiVersion,
    /// Highest SPIR-V version usable in shader modules.
    pub spirv_version: ApiVersion,
    /// Driver version word.
    pub driver_version: u32,
    /// Supports external memory/semaphore export (interop).
    pub external_memory_support: bool,
}

/// Host CPU instruction set family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
#[allow(missing_docs)]
pub enum HostArch {
    #[default]
    X86_64 = 0,
    Aarch64 = 1,
}

impl HostArch {
    /// Architecture this process runs on.
    pub fn current() -> Self {
        if cfg!(target_arch = "aarch64") { Self::Aarch64 } else { Self::X86_64 }
    }
}

/// Host-specific device values.
#[derive(Debug, Clone, Default)]
pub struct HostDeviceInfo {
    /// Instruction set family.
    pub arch: HostArch,
    /// Highest supported CPU tier. x86-64: 1 = SSE2, 2 = SSE4.2, 3 = AVX,
    /// 4 = AVX2, 5 = AVX-512. AArch64: 1 = ARMv8.0, 2 = ARMv8.2+.
    pub cpu_tier: u32,
}

impl HostDeviceInfo {
    /// Detects the running CPU.
    pub fn detect() -> Self {
        Self {
            arch: HostArch::current(),
            cpu_tier: detect_cpu_tier(),
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_cpu_tier() -> u32 {
    if std::arch::is_x86_feature_detected!("avx512f") {
        5
    } else if std::arch::is_x86_feature_detected!("avx2") {
        4
    } else if std::arch::is_x86_feature_detected!("avx") {
        3
    } else if std::arch::is_x86_feature_detected!("sse4.2") {
        2
    } else {
        1
    }
}

#[cfg(target_arch = "aarch64")]
fn detect_cpu_tier() -> u32 {
    if std::arch::is_aarch64_feature_detected!("fp16") { 2 } else { 1 }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_cpu_tier() -> u32 {
    1
}

/// Backend-specific part of a [`Device`].
#[derive(Debug, Clone)]
pub enum BackendDeviceInfo {
    /// Host CPU.
    Host(HostDeviceInfo),
    /// CUDA device.
    Cuda(CudaDeviceInfo),
    /// OpenCL device.
    OpenCl(OpenClDeviceInfo),
    /// Metal device.
    Metal(MetalDeviceInfo),
    /// Vulkan device.
    Vulkan(VulkanDeviceInfo),
}

impl Default for BackendDeviceInfo {
    fn default() -> Self {
        Self::Host(HostDeviceInfo::default())
    }
}

/// Capability record of one compute device.
#[derive(Debug, Clone, Default)]
pub struct Device {
    /// Driver-reported name.
    pub name: String,
    /// Vendor.
    pub vendor: Vendor,
    /// Driver-reported vendor string.
    pub vendor_name: String,
    /// Driver version string.
    pub driver_version_str: String,
    /// Typed ID.
    pub id: DeviceId,
    /// Device UUID (used to pair devices across backends).
    pub uuid: Option<[u8; 16]>,

    /// Compute units / multiprocessors / cores.
    pub units: u32,
    /// Clock in MHz.
    pub clock: u32,
    /// Performance heuristic for picking the fastest device.
    pub score: u64,

    /// Global memory size in bytes.
    pub global_mem_size: u64,
    /// Local (shared) memory size in bytes.
    pub local_mem_size: u64,
    /// Constant memory size in bytes.
    pub constant_mem_size: u64,
    /// Largest single allocation in bytes.
    pub max_mem_alloc: u64,

    /// Largest total work-group size.
    pub max_total_local_size: u32,
    /// Largest work-group size per dimension.
    pub max_local_size: UVec3,
    /// Largest grid size per dimension.
    pub max_group_size: UVec3,

    /// Largest 1D image width.
    pub max_image_1d_dim: u32,
    /// Largest 1D buffer-image width.
    pub max_image_1d_buffer_dim: u32,
    /// Largest 2D image extent.
    pub max_image_2d_dim: UVec2,
    /// Largest 3D image extent.
    pub max_image_3d_dim: UVec3,
    /// Largest array layer count.
    pub max_image_array_layers: u32,
    /// Largest mip level count.
    pub max_mip_levels: u32,

    /// Fixed SIMD / warp / wave width (0 if unknown).
    pub simd_width: u32,
    /// Supported SIMD width range for variable-width hardware.
    pub simd_range: UVec2,
    /// Sub-group operations supported.
    pub sub_group_support: bool,
    /// Sub-group shuffles supported.
    pub sub_group_shuffle_support: bool,

    /// Double precision supported.
    pub double_support: bool,
    /// 64-bit integer atomics (basic ops).
    pub basic_64_bit_atomics_support: bool,
    /// 64-bit integer atomics (min/max/and/or/xor).
    pub extended_64_bit_atomics_support: bool,
    /// 32-bit float atomic add.
    pub basic_32_bit_float_atomics_support: bool,

    /// Images supported at all.
    pub image_support: bool,
    /// Depth images readable.
    pub image_depth_support: bool,
    /// Depth images writable.
    pub image_depth_write_support: bool,
    /// Hardware depth-compare sampling.
    pub image_depth_compare_support: bool,
    /// MSAA images readable.
    pub image_msaa_support: bool,
    /// MSAA images writable.
    pub image_msaa_write_support: bool,
    /// MSAA array images.
    pub image_msaa_array_support: bool,
    /// Cube images readable.
    pub image_cube_support: bool,
    /// Cube images writable.
    pub image_cube_write_support: bool,
    /// Cube array images.
    pub image_cube_array_support: bool,
    /// Mip-mapped images readable.
    pub image_mipmap_support: bool,
    /// Mip-mapped images writable per level.
    pub image_mipmap_write_support: bool,
    /// Texel offsets on reads.
    pub image_offset_read_support: bool,
    /// Texel offsets on writes.
    pub image_offset_write_support: bool,
    /// Gather sampling.
    pub image_gather_support: bool,
    /// Images both read and written by one kernel.
    pub image_read_write_support: bool,
    /// Anisotropic filtering.
    pub anisotropic_support: bool,
    /// Largest anisotropy.
    pub max_anisotropy: u32,
    /// Argument buffers.
    pub argument_buffer_support: bool,

    /// Backend-specific values.
    pub backend: BackendDeviceInfo,
}

impl Device {
    /// Device class.
    #[inline]
    pub fn kind(&self) -> DeviceKind {
        self.id.kind
    }

    /// Is a GPU.
    #[inline]
    pub fn is_gpu(&self) -> bool {
        self.id.kind == DeviceKind::Gpu
    }

    /// Is a CPU.
    #[inline]
    pub fn is_cpu(&self) -> bool {
        self.id.kind == DeviceKind::Cpu
    }

    /// Host values, if this is the host CPU device.
    pub fn host(&self) -> Option<&HostDeviceInfo> {
        match &self.backend {
            BackendDeviceInfo::Host(info) => Some(info),
            _ => None,
        }
    }

    /// CUDA values, if this is a CUDA device.
    pub fn cuda(&self) -> Option<&CudaDeviceInfo> {
        match &self.backend {
            BackendDeviceInfo::Cuda(info) => Some(info),
            _ => None,
        }
    }

    /// OpenCL values, if this is an OpenCL device.
    pub fn opencl(&self) -> Option<&OpenClDeviceInfo> {
        match &self.backend {
            BackendDeviceInfo::OpenCl(info) => Some(info),
            _ => None,
        }
    }

    /// Metal values, if this is a Metal device.
    pub fn metal(&self) -> Option<&MetalDeviceInfo> {
        match &self.backend {
            BackendDeviceInfo::Metal(info) => Some(info),
            _ => None,
        }
    }

    /// Vulkan values, if this is a Vulkan device.
    pub fn vulkan(&self) -> Option<&VulkanDeviceInfo> {
        match &self.backend {
            BackendDeviceInfo::Vulkan(info) => Some(info),
            _ => None,
        }
    }

    /// Minification kernels for depth images can be built and dispatched.
    #[inline]
    pub fn supports_depth_minify(&self) -> bool {
        self.image_depth_support && self.image_depth_write_support
    }

    /// Formats the UUID as lowercase hex, if known.
    pub fn uuid_string(&self) -> Option<String> {
        self.uuid
            .map(|uuid| uuid.iter().map(|b| format!("{b:02x}")).collect())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({:?}, {} units @ {} MHz, {} MiB)",
            self.id,
            self.name,
            self.vendor,
            self.units,
            self.clock,
            self.global_mem_size / (1024 * 1024))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId::new(DeviceKind::Gpu, 0).to_string(), "GPU0");
        assert_eq!(DeviceId::new(DeviceKind::Cpu, 2).to_string(), "CPU2");
    }

    #[test]
    fn test_device_kind_parse() {
        assert_eq!(DeviceKind::parse("GPU"), Some(DeviceKind::Gpu));
        assert_eq!(DeviceKind::parse(" accelerator "), Some(DeviceKind::Accelerator));
        assert_eq!(DeviceKind::parse("tpu"), None);
    }

    #[test]
    fn test_vendor_from_name() {
        assert_eq!(Vendor::from_name("NVIDIA Corporation"), Vendor::Nvidia);
        assert_eq!(Vendor::from_name("Advanced Micro Devices, Inc."), Vendor::Amd);
        assert_eq!(Vendor::from_pci_id(0x8086), Vendor::Intel);
    }

    #[test]
    fn test_api_version_parse() {
        assert_eq!(ApiVersion::parse("1.2"), Some(ApiVersion::new(1, 2)));
        assert_eq!(ApiVersion::parse("3.0 CUDA"), Some(ApiVersion::new(3, 0)));
        assert_eq!(ApiVersion::parse("2"), Some(ApiVersion::new(2, 0)));
        assert!(ApiVersion::new(1, 2) < ApiVersion::new(2, 0));
    }

    #[test]
    fn test_backend_accessors() {
        let dev = Device {
            backend: BackendDeviceInfo::Cuda(CudaDeviceInfo {
                sm: UVec2::new(8, 6),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(dev.cuda().map(|c| c.sm), Some(UVec2::new(8, 6)));
        assert!(dev.vulkan().is_none());
    }
}
