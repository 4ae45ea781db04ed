//! Per-backend target descriptors.
//!
//! Every binary in an archive is tagged with one [`Target`]. On disk a target
//! is a single little-endian `u64`:
//!
//! ```text
//! bits 0..3   descriptor version (TARGET_VERSION)
//! bits 4..7   compute type       (ComputeType)
//! bits 8..63  variant fields, packed LSB-first in declaration order
//! ```
//!
//! Variant field widths (in order):
//!
//! | Variant | Fields |
//! |---|---|
//! | OpenCL | major 4, minor 4, is_spir 1, device_target 4, 13 capability bits, simd_width 8 |
//! | CUDA   | sm_major 6, sm_minor 4, ptx_isa_major 6, ptx_isa_minor 4, is_ptx 1, image_depth_compare_support 1, max_registers 8 |
//! | Metal  | major 4, minor 4, is_ios 1, device_target 4, simd_width 8, simd_reduction 1, barycentric_coord_support 1 |
//! | Host   | arch 4, cpu_tier 8 |
//! | Vulkan | vulkan_major 4, vulkan_minor 4, spirv_major 4, spirv_minor 4, device_target 4, 4 capability bits, simd_width 8 |

use std::fmt;
use std::str::FromStr;

use kiln_core::{Device, DeviceKind, HostArch, Vendor};

use crate::toolchain::ToolchainTarget;
use crate::{BinaryError, BinaryResult};

/// Version of the target descriptor layout.
pub const TARGET_VERSION: u64 = 1;

/// Backend a binary targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ComputeType {
    None = 0,
    OpenCl = 1,
    Cuda = 2,
    Metal = 3,
    Host = 4,
    Vulkan = 5,
}

impl ComputeType {
    fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::OpenCl,
            2 => Self::Cuda,
            3 => Self::Metal,
            4 => Self::Host,
            5 => Self::Vulkan,
            _ => return None,
        })
    }

    /// Lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::OpenCl => "opencl",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
            Self::Host => "host",
            Self::Vulkan => "vulkan",
        }
    }
}

// =============================================================================
// Field packing
// =============================================================================

struct FieldWriter {
    compute_type: ComputeType,
    word: u64,
    shift: u32,
    /// First value wider than its field: (value, bits, shift).
    overflow: Option<(u64, u32, u32)>,
}

impl FieldWriter {
    fn new(compute_type: ComputeType) -> Self {
        Self {
            compute_type,
            word: TARGET_VERSION | ((compute_type as u64) << 4),
            shift: 8,
            overflow: None,
        }
    }

    fn put(&mut self, value: impl Into<u64>, bits: u32) -> &mut Self {
        let value = value.into();
        let mask = (1u64 << bits) - 1;
        if value > mask && self.overflow.is_none() {
            self.overflow = Some((value, bits, self.shift));
        }
        self.word |= (value & mask) << self.shift;
        self.shift += bits;
        debug_assert!(self.shift <= 64);
        self
    }

    /// The packed word, or an error naming the first field that overflowed.
    fn finish(&self) -> BinaryResult<u64> {
        match self.overflow {
            Some((value, bits, shift)) => Err(BinaryError::InvalidTarget(format!(
                "{} target field at bit {shift} is {bits} bits wide, {value} does not fit",
                self.compute_type.name()
            ))),
            None => Ok(self.word),
        }
    }
}

struct FieldReader {
    word: u64,
    shift: u32,
}

impl FieldReader {
    fn new(word: u64) -> Self {
        Self { word, shift: 8 }
    }

    fn take(&mut self, bits: u32) -> u64 {
        let value = (self.word >> self.shift) & ((1u64 << bits) - 1);
        self.shift += bits;
        value
    }

    fn take_u32(&mut self, bits: u32) -> u32 {
        self.take(bits) as u32
    }

    fn flag(&mut self) -> bool {
        self.take(1) != 0
    }
}

// =============================================================================
// OpenCL
// =============================================================================

/// OpenCL device class; higher value means more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum OpenClDeviceTarget {
    #[default]
    Generic = 0,
    GenericCpu = 1,
    GenericGpu = 2,
    IntelCpu = 3,
    IntelGpu = 4,
    AmdCpu = 5,
    AmdGpu = 6,
}

impl OpenClDeviceTarget {
    fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::Generic,
            1 => Self::GenericCpu,
            2 => Self::GenericGpu,
            3 => Self::IntelCpu,
            4 => Self::IntelGpu,
            5 => Self::AmdCpu,
            6 => Self::AmdGpu,
            _ => return None,
        })
    }

    /// Most specific class describing `device`.
    pub fn for_device(device: &Device) -> Self {
        match (device.vendor, device.kind()) {
            (Vendor::Intel, DeviceKind::Cpu) => Self::IntelCpu,
            (Vendor::Intel, DeviceKind::Gpu) => Self::IntelGpu,
            (Vendor::Amd, DeviceKind::Cpu) => Self::AmdCpu,
            (Vendor::Amd, DeviceKind::Gpu) => Self::AmdGpu,
            (_, DeviceKind::Cpu) => Self::GenericCpu,
            (_, DeviceKind::Gpu) => Self::GenericGpu,
            _ => Self::Generic,
        }
    }

    /// Whether a binary for this class may run on `device`.
    pub fn accepts(&self, device: &Device) -> bool {
        let kind = device.kind();
        match self {
            Self::Generic => true,
            Self::GenericCpu => kind == DeviceKind::Cpu,
            Self::GenericGpu => kind == DeviceKind::Gpu,
            Self::IntelCpu => device.vendor == Vendor::Intel && kind == DeviceKind::Cpu,
            Self::IntelGpu => device.vendor == Vendor::Intel && kind == DeviceKind::Gpu,
            Self::AmdCpu => device.vendor == Vendor::Amd && kind == DeviceKind::Cpu,
            Self::AmdGpu => device.vendor == Vendor::Amd && kind == DeviceKind::Gpu,
        }
    }
}

/// OpenCL target (SPIR 1.2 or SPIR-V).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub struct OpenClTarget {
    pub major: u32,
    pub minor: u32,
    /// SPIR (LLVM bitcode) instead of SPIR-V.
    pub is_spir: bool,
    pub device_target: OpenClDeviceTarget,
    pub image_support: bool,
    pub double_support: bool,
    pub basic_64_bit_atomics_support: bool,
    pub extended_64_bit_atomics_support: bool,
    pub sub_group_support: bool,
    pub image_depth_support: bool,
    pub image_depth_write_support: bool,
    pub image_msaa_support: bool,
    pub image_msaa_write_support: bool,
    pub image_msaa_array_support: bool,
    pub image_mipmap_support: bool,
    pub image_mipmap_write_support: bool,
    pub image_read_write_support: bool,
    /// Required SIMD width, 0 = any.
    pub simd_width: u32,
}

impl OpenClTarget {
    pub(crate) fn caps(&self) -> [bool; 13] {
        [
            self.image_support,
            self.double_support,
            self.basic_64_bit_atomics_support,
            self.extended_64_bit_atomics_support,
            self.sub_group_support,
            self.image_depth_support,
            self.image_depth_write_support,
            self.image_msaa_support,
            self.image_msaa_write_support,
            self.image_msaa_array_support,
            self.image_mipmap_support,
            self.image_mipmap_write_support,
            self.image_read_write_support,
        ]
    }

    pub(crate) fn device_caps(device: &Device) -> [bool; 13] {
        [
            device.image_support,
            device.double_support,
            device.basic_64_bit_atomics_support,
            device.extended_64_bit_atomics_support,
            device.sub_group_support,
            device.image_depth_support,
            device.image_depth_write_support,
            device.image_msaa_support,
            device.image_msaa_write_support,
            device.image_msaa_array_support,
            device.image_mipmap_support,
            device.image_mipmap_write_support,
            device.image_read_write_support,
        ]
    }

    fn pack(&self) -> BinaryResult<u64> {
        let mut w = FieldWriter::new(ComputeType::OpenCl);
        w.put(self.major, 4).put(self.minor, 4).put(self.is_spir, 1).put(self.device_target as u8, 4);
        for cap in self.caps() {
            w.put(cap, 1);
        }
        w.put(self.simd_width, 8);
        w.finish()
    }

    fn unpack(r: &mut FieldReader) -> Option<Self> {
        let major = r.take_u32(4);
        let minor = r.take_u32(4);
        let is_spir = r.flag();
        let device_target = OpenClDeviceTarget::from_raw(r.take(4))?;
        Some(Self {
            major,
            minor,
            is_spir,
            device_target,
            image_support: r.flag(),
            double_support: r.flag(),
            basic_64_bit_atomics_support: r.flag(),
            extended_64_bit_atomics_support: r.flag(),
            sub_group_support: r.flag(),
            image_depth_support: r.flag(),
            image_depth_write_support: r.flag(),
            image_msaa_support: r.flag(),
            image_msaa_write_support: r.flag(),
            image_msaa_array_support: r.flag(),
            image_mipmap_support: r.flag(),
            image_mipmap_write_support: r.flag(),
            image_read_write_support: r.flag(),
            simd_width: r.take_u32(8),
        })
    }
}

// =============================================================================
// CUDA
// =============================================================================

/// CUDA target (PTX or CUBIN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CudaTarget {
    /// Compute capability major.
    pub sm_major: u32,
    /// Compute capability minor.
    pub sm_minor: u32,
    /// PTX ISA major.
    pub ptx_isa_major: u32,
    /// PTX ISA minor.
    pub ptx_isa_minor: u32,
    /// PTX text instead of a CUBIN.
    pub is_ptx: bool,
    /// Requires hardware depth-compare sampling.
    pub image_depth_compare_support: bool,
    /// Register cap used when compiling. Not used for ranking.
    pub max_registers: u32,
}

impl CudaTarget {
    /// A PTX target.
    pub fn ptx(sm: (u32, u32), ptx: (u32, u32)) -> Self {
        Self {
            sm_major: sm.0,
            sm_minor: sm.1,
            ptx_isa_major: ptx.0,
            ptx_isa_minor: ptx.1,
            is_ptx: true,
            ..Default::default()
        }
    }

    fn pack(&self) -> BinaryResult<u64> {
        FieldWriter::new(ComputeType::Cuda)
            .put(self.sm_major, 6)
            .put(self.sm_minor, 4)
            .put(self.ptx_isa_major, 6)
            .put(self.ptx_isa_minor, 4)
            .put(self.is_ptx, 1)
            .put(self.image_depth_compare_support, 1)
            .put(self.max_registers, 8)
            .finish()
    }

    fn unpack(r: &mut FieldReader) -> Self {
        Self {
            sm_major: r.take_u32(6),
            sm_minor: r.take_u32(4),
            ptx_isa_major: r.take_u32(6),
            ptx_isa_minor: r.take_u32(4),
            is_ptx: r.flag(),
            image_depth_compare_support: r.flag(),
            max_registers: r.take_u32(8),
        }
    }
}

// =============================================================================
// Metal
// =============================================================================

/// Metal / Vulkan device vendor target; higher value means more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum VendorTarget {
    #[default]
    Generic = 0,
    Nvidia = 1,
    Amd = 2,
    Intel = 3,
    Apple = 4,
}

impl VendorTarget {
    fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::Generic,
            1 => Self::Nvidia,
            2 => Self::Amd,
            3 => Self::Intel,
            4 => Self::Apple,
            _ => return None,
        })
    }

    /// Vendor target describing `vendor`.
    pub fn for_vendor(vendor: Vendor) -> Self {
        match vendor {
            Vendor::Nvidia => Self::Nvidia,
            Vendor::Amd => Self::Amd,
            Vendor::Intel => Self::Intel,
            Vendor::Apple => Self::Apple,
            _ => Self::Generic,
        }
    }

    /// Generic, or equal to the device's vendor.
    pub fn accepts(&self, vendor: Vendor) -> bool {
        *self == Self::Generic || *self == Self::for_vendor(vendor)
    }
}

/// Metal target (AIR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub struct MetalTarget {
    pub major: u32,
    pub minor: u32,
    pub is_ios: bool,
    pub device_target: VendorTarget,
    /// Required SIMD width, 0 = any.
    pub simd_width: u32,
    pub simd_reduction: bool,
    pub barycentric_coord_support: bool,
}

impl MetalTarget {
    fn pack(&self) -> BinaryResult<u64> {
        FieldWriter::new(ComputeType::Metal)
            .put(self.major, 4)
            .put(self.minor, 4)
            .put(self.is_ios, 1)
            .put(self.device_target as u8, 4)
            .put(self.simd_width, 8)
            .put(self.simd_reduction, 1)
            .put(self.barycentric_coord_support, 1)
            .finish()
    }

    fn unpack(r: &mut FieldReader) -> Option<Self> {
        let major = r.take_u32(4);
        let minor = r.take_u32(4);
        let is_ios = r.flag();
        let device_target = VendorTarget::from_raw(r.take(4))?;
        Some(Self {
            major,
            minor,
            is_ios,
            device_target,
            simd_width: r.take_u32(8),
            simd_reduction: r.flag(),
            barycentric_coord_support: r.flag(),
        })
    }
}

// =============================================================================
// Host
// =============================================================================

/// Host CPU target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HostTarget {
    /// Instruction set family.
    pub arch: HostArch,
    /// Minimum CPU tier (see [`kiln_core::HostDeviceInfo`]).
    pub cpu_tier: u32,
}

impl HostTarget {
    fn pack(&self) -> BinaryResult<u64> {
        FieldWriter::new(ComputeType::Host)
            .put(self.arch as u8, 4)
            .put(self.cpu_tier, 8)
            .finish()
    }

    fn unpack(r: &mut FieldReader) -> Option<Self> {
        let arch = match r.take(4) {
            0 => HostArch::X86_64,
            1 => HostArch::Aarch64,
            _ => return None,
        };
        Some(Self { arch, cpu_tier: r.take_u32(8) })
    }
}

// =============================================================================
// Vulkan
// =============================================================================

/// Vulkan target (SPIR-V).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub struct VulkanTarget {
    pub vulkan_major: u32,
    pub vulkan_minor: u32,
    pub spirv_major: u32,
    pub spirv_minor: u32,
    pub device_target: VendorTarget,
    pub double_support: bool,
    pub basic_64_bit_atomics_support: bool,
    pub extended_64_bit_atomics_support: bool,
    pub basic_32_bit_float_atomics_support: bool,
    /// Required SIMD width, 0 = any.
    pub simd_width: u32,
}

impl VulkanTarget {
    pub(crate) fn caps(&self) -> [bool; 4] {
        [
            self.double_support,
            self.basic_64_bit_atomics_support,
            self.extended_64_bit_atomics_support,
            self.basic_32_bit_float_atomics_support,
        ]
    }

    pub(crate) fn device_caps(device: &Device) -> [bool; 4] {
        [
            device.double_support,
            device.basic_64_bit_atomics_support,
            device.extended_64_bit_atomics_support,
            device.basic_32_bit_float_atomics_support,
        ]
    }

    fn pack(&self) -> BinaryResult<u64> {
        let mut w = FieldWriter::new(ComputeType::Vulkan);
        w.put(self.vulkan_major, 4)
            .put(self.vulkan_minor, 4)
            .put(self.spirv_major, 4)
            .put(self.spirv_minor, 4)
            .put(self.device_target as u8, 4);
        for cap in self.caps() {
            w.put(cap, 1);
        }
        w.put(self.simd_width, 8);
        w.finish()
    }

    fn unpack(r: &mut FieldReader) -> Option<Self> {
        let vulkan_major = r.take_u32(4);
        let vulkan_minor = r.take_u32(4);
        let spirv_major = r.take_u32(4);
        let spirv_minor = r.take_u32(4);
        let device_target = VendorTarget::from_raw(r.take(4))?;
        Some(Self {
            vulkan_major,
            vulkan_minor,
            spirv_major,
            spirv_minor,
            device_target,
            double_support: r.flag(),
            basic_64_bit_atomics_support: r.flag(),
            extended_64_bit_atomics_support: r.flag(),
            basic_32_bit_float_atomics_support: r.flag(),
            simd_width: r.take_u32(8),
        })
    }
}

// =============================================================================
// Target
// =============================================================================

/// Tagged target descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Target {
    OpenCl(OpenClTarget),
    Cuda(CudaTarget),
    Metal(MetalTarget),
    Host(HostTarget),
    Vulkan(VulkanTarget),
}

impl Target {
    /// Backend of this target.
    pub fn compute_type(&self) -> ComputeType {
        match self {
            Self::OpenCl(_) => ComputeType::OpenCl,
            Self::Cuda(_) => ComputeType::Cuda,
            Self::Metal(_) => ComputeType::Metal,
            Self::Host(_) => ComputeType::Host,
            Self::Vulkan(_) => ComputeType::Vulkan,
        }
    }

    /// Serializes to the on-disk word. Fails when a field does not fit its width.
    pub fn to_u64(&self) -> BinaryResult<u64> {
        match self {
            Self::OpenCl(t) => t.pack(),
            Self::Cuda(t) => t.pack(),
            Self::Metal(t) => t.pack(),
            Self::Host(t) => t.pack(),
            Self::Vulkan(t) => t.pack(),
        }
    }

    /// Parses an on-disk word, checking the descriptor version.
    pub fn from_u64(word: u64) -> BinaryResult<Self> {
        let version = word & 0xF;
        if version != TARGET_VERSION {
            return Err(BinaryError::InvalidTarget(format!("unsupported target version {version}")));
        }
        let raw_type = (word >> 4) & 0xF;
        let compute_type = ComputeType::from_raw(raw_type)
            .ok_or_else(|| BinaryError::InvalidTarget(format!("unknown compute type {raw_type}")))?;
        let mut r = FieldReader::new(word);
        let target = match compute_type {
            ComputeType::OpenCl => OpenClTarget::unpack(&mut r).map(Self::OpenCl),
            ComputeType::Cuda => Some(Self::Cuda(CudaTarget::unpack(&mut r))),
            ComputeType::Metal => MetalTarget::unpack(&mut r).map(Self::Metal),
            ComputeType::Host => HostTarget::unpack(&mut r).map(Self::Host),
            ComputeType::Vulkan => VulkanTarget::unpack(&mut r).map(Self::Vulkan),
            ComputeType::None => None,
        };
        target.ok_or_else(|| BinaryError::InvalidTarget(format!("malformed {} target {word:#018x}", compute_type.name())))
    }

    /// Intermediate the toolchain must emit for this target.
    pub fn toolchain_target(&self) -> ToolchainTarget {
        match self {
            Self::OpenCl(t) if t.is_spir => ToolchainTarget::Spir,
            Self::OpenCl(_) => ToolchainTarget::SpirvOpenCl,
            Self::Cuda(_) => ToolchainTarget::Ptx,
            Self::Metal(_) => ToolchainTarget::Air,
            Self::Host(_) => ToolchainTarget::Host,
            Self::Vulkan(_) => ToolchainTarget::SpirvVulkan,
        }
    }

    /// The exact target a binary built specifically for `device` carries.
    pub fn for_device(device: &Device) -> Option<Self> {
        if let Some(cuda) = device.cuda() {
            return Some(Self::Cuda(CudaTarget {
                sm_major: cuda.sm.x,
                sm_minor: cuda.sm.y,
                ptx_isa_major: cuda.min_req_ptx.x,
                ptx_isa_minor: cuda.min_req_ptx.y,
                is_ptx: true,
                image_depth_compare_support: device.image_depth_compare_support,
                max_registers: 0,
            }));
        }
        if let Some(cl) = device.opencl() {
            let caps = OpenClTarget::device_caps(device);
            return Some(Self::OpenCl(OpenClTarget {
                major: cl.cl_version.major,
                minor: cl.cl_version.minor,
                is_spir: cl.spirv_version.is_none(),
                device_target: OpenClDeviceTarget::for_device(device),
                image_support: caps[0],
                double_support: caps[1],
                basic_64_bit_atomics_support: caps[2],
                extended_64_bit_atomics_support: caps[3],
                sub_group_support: caps[4],
                image_depth_support: caps[5],
                image_depth_write_support: caps[6],
                image_msaa_support: caps[7],
                image_msaa_write_support: caps[8],
                image_msaa_array_support: caps[9],
                image_mipmap_support: caps[10],
                image_mipmap_write_support: caps[11],
                image_read_write_support: caps[12],
                simd_width: if device.sub_group_support { device.simd_width } else { 0 },
            }));
        }
        if let Some(metal) = device.metal() {
            return Some(Self::Metal(MetalTarget {
                major: metal.metal_version.major,
                minor: metal.metal_version.minor,
                is_ios: metal.is_ios,
                device_target: VendorTarget::for_vendor(device.vendor),
                simd_width: device.simd_width,
                simd_reduction: device.sub_group_support,
                barycentric_coord_support: false,
            }));
        }
        if let Some(vk) = device.vulkan() {
            return Some(Self::Vulkan(VulkanTarget {
                vulkan_major: vk.vulkan_version.major,
                vulkan_minor: vk.vulkan_version.minor,
                spirv_major: vk.spirv_version.major,
                spirv_minor: vk.spirv_version.minor,
                device_target: VendorTarget::for_vendor(device.vendor),
                double_support: device.double_support,
                basic_64_bit_atomics_support: device.basic_64_bit_atomics_support,
                extended_64_bit_atomics_support: device.extended_64_bit_atomics_support,
                basic_32_bit_float_atomics_support: device.basic_32_bit_float_atomics_support,
                simd_width: if device.sub_group_support { device.simd_width } else { 0 },
            }));
        }
        device.host().map(|host| Self::Host(HostTarget { arch: host.arch, cpu_tier: host.cpu_tier }))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenCl(t) => write!(f, "opencl:{}.{}{}:{:?}",
                t.major, t.minor, if t.is_spir { ":spir" } else { "" }, t.device_target),
            Self::Cuda(t) => write!(f, "cuda:sm_{}{}:ptx_{}{}{}",
                t.sm_major, t.sm_minor, t.ptx_isa_major, t.ptx_isa_minor,
                if t.is_ptx { "" } else { ":cubin" }),
            Self::Metal(t) => write!(f, "metal:{}.{}{}:{:?}",
                t.major, t.minor, if t.is_ios { ":ios" } else { "" }, t.device_target),
            Self::Host(t) => write!(f, "host:{:?}:tier{}", t.arch, t.cpu_tier),
            Self::Vulkan(t) => write!(f, "vulkan:{}.{}:spirv{}.{}:{:?}",
                t.vulkan_major, t.vulkan_minor, t.spirv_major, t.spirv_minor, t.device_target),
        }
    }
}

/// Parses "86" or "8.6" into (major, minor).
fn parse_compact_version(s: &str) -> Option<(u32, u32)> {
    if let Some((major, minor)) = s.split_once('.') {
        return Some((major.parse().ok()?, minor.parse().ok()?));
    }
    let value: u32 = s.parse().ok()?;
    Some((value / 10, value % 10))
}

impl FromStr for Target {
    type Err = BinaryError;

    /// Parses short target specs used on the command line:
    ///
    /// - `cuda:sm_86[:ptx_75][:cubin]`
    /// - `vulkan:1.3[:spirv1.6]`
    /// - `opencl:3.0[:spir]`
    /// - `metal:3.0[:ios]`
    /// - `host[:tierN]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || BinaryError::InvalidTarget(format!("cannot parse target '{s}'"));
        let mut parts = s.trim().split(':');
        let kind = parts.next().ok_or_else(bad)?.to_ascii_lowercase();
        let rest: Vec<&str> = parts.collect();

        let target = match kind.as_str() {
            "cuda" => {
                let mut t = CudaTarget { is_ptx: true, ..Default::default() };
                for part in rest {
                    if let Some(sm) = part.strip_prefix("sm_") {
                        (t.sm_major, t.sm_minor) = parse_compact_version(sm).ok_or_else(bad)?;
                    } else if let Some(ptx) = part.strip_prefix("ptx_") {
                        (t.ptx_isa_major, t.ptx_isa_minor) = parse_compact_version(ptx).ok_or_else(bad)?;
                    } else if part == "cubin" {
                        t.is_ptx = false;
                    } else {
                        return Err(bad());
                    }
                }
                if t.sm_major == 0 {
                    return Err(bad());
                }
                if t.ptx_isa_major == 0 {
                    (t.ptx_isa_major, t.ptx_isa_minor) = (t.sm_major, 0);
                }
                Self::Cuda(t)
            }
            "vulkan" => {
                let mut t = VulkanTarget {
                    vulkan_major: 1,
                    vulkan_minor: 3,
                    spirv_major: 1,
                    spirv_minor: 6,
                    ..Default::default()
                };
                for part in rest {
                    if let Some(spirv) = part.strip_prefix("spirv") {
                        (t.spirv_major, t.spirv_minor) = parse_compact_version(spirv).ok_or_else(bad)?;
                    } else {
                        (t.vulkan_major, t.vulkan_minor) = parse_compact_version(part).ok_or_else(bad)?;
                    }
                }
                Self::Vulkan(t)
            }
            "opencl" => {
                let mut t = OpenClTarget { major: 1, minor: 2, ..Default::default() };
                for part in rest {
                    if part == "spir" {
                        t.is_spir = true;
                    } else {
                        (t.major, t.minor) = parse_compact_version(part).ok_or_else(bad)?;
                    }
                }
                Self::OpenCl(t)
            }
            "metal" => {
                let mut t = MetalTarget { major: 2, minor: 0, ..Default::default() };
                for part in rest {
                    if part == "ios" {
                        t.is_ios = true;
                    } else {
                        (t.major, t.minor) = parse_compact_version(part).ok_or_else(bad)?;
                    }
                }
                Self::Metal(t)
            }
            "host" => {
                let mut t = HostTarget { arch: HostArch::current(), cpu_tier: 1 };
                for part in rest {
                    let tier = part.strip_prefix("tier").ok_or_else(bad)?;
                    t.cpu_tier = tier.parse().map_err(|_| bad())?;
                }
                Self::Host(t)
            }
            _ => return Err(bad()),
        };
        target.to_u64()?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bits() {
        let word = Target::Cuda(CudaTarget::ptx((8, 6), (7, 5))).to_u64().unwrap();
        assert_eq!(word & 0xF, TARGET_VERSION);
        assert_eq!((word >> 4) & 0xF, ComputeType::Cuda as u64);
    }

    #[test]
    fn test_pack_unpack_variants() {
        let targets = [
            Target::Cuda(CudaTarget { max_registers: 64, image_depth_compare_support: true, ..CudaTarget::ptx((7, 5), (6, 3)) }),
            Target::OpenCl(OpenClTarget {
                major: 2,
                minor: 1,
                device_target: OpenClDeviceTarget::AmdGpu,
                image_mipmap_write_support: true,
                simd_width: 64,
                ..Default::default()
            }),
            Target::Metal(MetalTarget { major: 3, minor: 1, is_ios: true, device_target: VendorTarget::Apple, simd_width: 32, ..Default::default() }),
            Target::Host(HostTarget { arch: HostArch::Aarch64, cpu_tier: 2 }),
            Target::Vulkan(VulkanTarget { vulkan_major: 1, vulkan_minor: 3, spirv_major: 1, spirv_minor: 6, extended_64_bit_atomics_support: true, ..Default::default() }),
        ];
        for target in targets {
            assert_eq!(Target::from_u64(target.to_u64().unwrap()).unwrap(), target);
        }
    }

    #[test]
    fn test_rejects_bad_version_and_type() {
        assert!(Target::from_u64(0).is_err());
        assert!(Target::from_u64(1 | (9 << 4)).is_err());
    }

    #[test]
    fn test_parse() {
        let t: Target = "cuda:sm_86:ptx_75".parse().unwrap();
        assert_eq!(t, Target::Cuda(CudaTarget::ptx((8, 6), (7, 5))));
        let t: Target = "vulkan:1.2:spirv1.5".parse().unwrap();
        assert!(matches!(t, Target::Vulkan(v) if v.vulkan_minor == 2 && v.spirv_minor == 5));
        let t: Target = "opencl:2.0:spir".parse().unwrap();
        assert!(matches!(t, Target::OpenCl(cl) if cl.is_spir && cl.major == 2));
        assert!("cuda".parse::<Target>().is_err());
        assert!("dx12".parse::<Target>().is_err());
        assert!("vulkan:16.0".parse::<Target>().is_err());
        assert!("cuda:sm_99.10".parse::<Target>().is_err());
    }

    #[test]
    fn test_oversized_field_rejected() {
        let vulkan = Target::Vulkan(VulkanTarget { vulkan_major: 16, vulkan_minor: 0, ..Default::default() });
        let err = vulkan.to_u64().unwrap_err();
        assert!(err.to_string().contains("16 does not fit"));
        let host = Target::Host(HostTarget { arch: HostArch::X86_64, cpu_tier: 255 });
        assert!(host.to_u64().is_ok());
        let host = Target::Host(HostTarget { arch: HostArch::X86_64, cpu_tier: 256 });
        assert!(host.to_u64().is_err());
    }

    #[test]
    fn test_opencl_device_target_accepts() {
        let dev = Device {
            vendor: Vendor::Intel,
            id: kiln_core::DeviceId::new(DeviceKind::Gpu, 0),
            ..Default::default()
        };
        assert!(OpenClDeviceTarget::Generic.accepts(&dev));
        assert!(OpenClDeviceTarget::IntelGpu.accepts(&dev));
        assert!(!OpenClDeviceTarget::IntelCpu.accepts(&dev));
        assert!(!OpenClDeviceTarget::AmdGpu.accepts(&dev));
        assert_eq!(OpenClDeviceTarget::for_device(&dev), OpenClDeviceTarget::IntelGpu);
    }
}
