//! Best-match selection of an archive binary for a runtime device.
//!
//! Selection runs in two passes over the archive:
//!
//! 1. **Compatibility** - drop binaries for another backend, a newer API
//!    version than the device has, capabilities the device lacks, an
//!    unsupported SIMD width, another vendor, or (CUBIN) another sm.
//! 2. **Ranking** - order the rest lexicographically by
//!    `[native, version, device_target, caps, simd, extra, extra]`.
//!    The earliest binary wins ties.
//!
//! `max_registers` never takes part in either pass.

use kiln_core::{Config, Device};
use tracing::{debug, trace, warn};

use crate::archive::{Archive, ArchiveBinary};
use crate::target::{CudaTarget, HostTarget, MetalTarget, OpenClTarget, Target, VulkanTarget};

/// Config switches that influence selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
    /// Never pick SPIR-V binaries on OpenCL.
    pub opencl_disable_spirv: bool,
    /// Never pick CUBIN binaries on CUDA.
    pub cuda_force_ptx: bool,
    /// Treat the device as this sm (e.g. 75), 0 = off.
    pub cuda_force_driver_sm: u32,
    /// Compile CUDA sources for this sm instead of the device's, 0 = off.
    pub cuda_force_compile_sm: u32,
}

impl From<&Config> for MatchOptions {
    fn from(config: &Config) -> Self {
        Self {
            opencl_disable_spirv: config.opencl.disable_spirv,
            cuda_force_ptx: config.cuda.force_ptx,
            cuda_force_driver_sm: config.cuda.force_driver_sm,
            cuda_force_compile_sm: config.cuda.force_compile_sm,
        }
    }
}

/// Selected binary.
#[derive(Debug, Clone, Copy)]
pub struct BestMatch<'a> {
    /// Index in the archive.
    pub index: usize,
    /// The binary itself.
    pub binary: &'a ArchiveBinary,
    /// Its target descriptor.
    pub target: Target,
}

type Rank = [u64; 7];

#[inline]
fn version(major: u32, minor: u32) -> (u32, u32) {
    (major, minor)
}

fn caps_subset<const N: usize>(required: [bool; N], available: [bool; N]) -> bool {
    required.iter().zip(available).all(|(r, a)| !*r || a)
}

fn caps_count<const N: usize>(caps: [bool; N]) -> u64 {
    caps.iter().filter(|c| **c).count() as u64
}

/// SIMD width 0 means "any"; otherwise the device must run that width.
fn simd_fits(width: u32, device: &Device) -> bool {
    if width == 0 {
        return true;
    }
    if !device.sub_group_support {
        return false;
    }
    width == device.simd_width || (device.simd_range.x <= width && width <= device.simd_range.y)
}

// =============================================================================
// Compatibility
// =============================================================================

fn cuda_compatible(t: &CudaTarget, device: &Device, options: &MatchOptions) -> bool {
    let Some(cuda) = device.cuda() else { return false };
    let device_sm = match options.cuda_force_driver_sm {
        0 => version(cuda.sm.x, cuda.sm.y),
        forced => version(forced / 10, forced % 10),
    };
    let sm = version(t.sm_major, t.sm_minor);
    let ptx = version(t.ptx_isa_major, t.ptx_isa_minor);

    if t.is_ptx {
        if sm > device_sm || ptx < version(cuda.min_req_ptx.x, cuda.min_req_ptx.y) {
            return false;
        }
        if cuda.max_ptx.x != 0 && ptx > version(cuda.max_ptx.x, cuda.max_ptx.y) {
            return false;
        }
    } else if options.cuda_force_ptx || sm != device_sm {
        return false;
    }
    !t.image_depth_compare_support || device.image_depth_compare_support
}

fn opencl_compatible(t: &OpenClTarget, device: &Device, options: &MatchOptions) -> bool {
    let Some(cl) = device.opencl() else { return false };
    if version(t.major, t.minor) > version(cl.cl_version.major, cl.cl_version.minor) {
        return false;
    }
    if !t.is_spir && (options.opencl_disable_spirv || cl.spirv_version.is_none()) {
        return false;
    }
    t.device_target.accepts(device)
        && caps_subset(t.caps(), OpenClTarget::device_caps(device))
        && simd_fits(t.simd_width, device)
}

fn metal_compatible(t: &MetalTarget, device: &Device) -> bool {
    let Some(metal) = device.metal() else { return false };
    let device_version = version(metal.metal_version.major, metal.metal_version.minor);
    version(t.major, t.minor) <= device_version
        && t.is_ios == metal.is_ios
        && t.device_target.accepts(device.vendor)
        && t.simd_width <= device.simd_width
        && (!t.simd_reduction || device.sub_group_support)
        && (!t.barycentric_coord_support || device_version >= (2, 2))
}

fn vulkan_compatible(t: &VulkanTarget, device: &Device) -> bool {
    let Some(vk) = device.vulkan() else { return false };
    version(t.vulkan_major, t.vulkan_minor) <= version(vk.vulkan_version.major, vk.vulkan_version.minor)
        && version(t.spirv_major, t.spirv_minor) <= version(vk.spirv_version.major, vk.spirv_version.minor)
        && t.device_target.accepts(device.vendor)
        && caps_subset(t.caps(), VulkanTarget::device_caps(device))
        && simd_fits(t.simd_width, device)
}

fn host_compatible(t: &HostTarget, device: &Device) -> bool {
    device.host().is_some_and(|host| host.arch == t.arch && t.cpu_tier <= host.cpu_tier)
}

/// Can a binary built for `target` run on `device`?
pub fn is_compatible(device: &Device, target: &Target, options: &MatchOptions) -> bool {
    match target {
        Target::Cuda(t) => cuda_compatible(t, device, options),
        Target::OpenCl(t) => opencl_compatible(t, device, options),
        Target::Metal(t) => metal_compatible(t, device),
        Target::Vulkan(t) => vulkan_compatible(t, device),
        Target::Host(t) => host_compatible(t, device),
    }
}

// =============================================================================
// Ranking
// =============================================================================

fn rank(target: &Target, device: &Device) -> Rank {
    match target {
        Target::Cuda(t) => [
            u64::from(!t.is_ptx),
            u64::from(t.sm_major * 100 + t.sm_minor),
            0,
            0,
            0,
            u64::from(t.ptx_isa_major * 100 + t.ptx_isa_minor),
            u64::from(t.image_depth_compare_support),
        ],
        Target::OpenCl(t) => {
            let spirv_native = device.opencl().is_some_and(|cl| cl.cl_version.major >= 2);
            [
                u64::from(!t.is_spir && spirv_native),
                u64::from(t.major * 100 + t.minor),
                t.device_target as u64,
                caps_count(t.caps()),
                u64::from(t.simd_width),
                0,
                0,
            ]
        }
        Target::Metal(t) => [
            0,
            u64::from(t.major * 100 + t.minor),
            t.device_target as u64,
            caps_count([t.simd_reduction, t.barycentric_coord_support]),
            u64::from(t.simd_width),
            0,
            0,
        ],
        Target::Vulkan(t) => [
            0,
            u64::from((t.vulkan_major * 100 + t.vulkan_minor) * 10000 + t.spirv_major * 100 + t.spirv_minor),
            t.device_target as u64,
            caps_count(t.caps()),
            u64::from(t.simd_width),
            0,
            0,
        ],
        Target::Host(t) => [0, u64::from(t.cpu_tier), 0, 0, 0, 0, 0],
    }
}

/// Picks the best binary for `device` with default options.
pub fn find_best_match_for_device<'a>(device: &Device, archive: &'a Archive) -> Option<BestMatch<'a>> {
    find_best_match_for_device_with(device, archive, &MatchOptions::default())
}

/// Picks the best binary for `device`.
///
/// Returns `None` if no binary is compatible.
pub fn find_best_match_for_device_with<'a>(
    device: &Device,
    archive: &'a Archive,
    options: &MatchOptions,
) -> Option<BestMatch<'a>> {
    let mut best: Option<(Rank, BestMatch<'a>)> = None;
    for (index, binary) in archive.iter().enumerate() {
        if !is_compatible(device, &binary.target, options) {
            trace!(index, binary_target = %binary.target, device = %device.name, "incompatible");
            continue;
        }
        let r = rank(&binary.target, device);
        trace!(index, binary_target = %binary.target, rank = ?r, "compatible");
        if best.as_ref().is_none_or(|(best_rank, _)| r > *best_rank) {
            best = Some((r, BestMatch { index, binary, target: binary.target }));
        }
    }

    match best {
        Some((_, m)) => {
            debug!(device = %device.name, index = m.index, binary_target = %m.target, "selected binary");
            Some(m)
        }
        None => {
            warn!(device = %device.name, binaries = archive.len(), "no compatible binary");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{OpenClDeviceTarget, VendorTarget};
    use kiln_core::prelude::UVec2;
    use kiln_core::{
        ApiVersion, BackendDeviceInfo, CudaDeviceInfo, DeviceId, DeviceKind, HostArch, HostDeviceInfo,
        OpenClDeviceInfo, Vendor, VulkanDeviceInfo,
    };

    fn cuda_device(sm: (u32, u32), min_ptx: (u32, u32)) -> Device {
        Device {
            name: "test gpu".into(),
            vendor: Vendor::Nvidia,
            backend: BackendDeviceInfo::Cuda(CudaDeviceInfo {
                sm: UVec2::new(sm.0, sm.1),
                min_req_ptx: UVec2::new(min_ptx.0, min_ptx.1),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn archive_of(targets: &[Target]) -> Archive {
        let mut archive = Archive::new();
        for (i, t) in targets.iter().enumerate() {
            archive.push(*t, 1, Vec::new(), vec![i as u8]);
        }
        archive
    }

    #[test]
    fn test_cuda_ptx_rules() {
        let dev = cuda_device((8, 6), (7, 0));
        let opts = MatchOptions::default();
        assert!(is_compatible(&dev, &Target::Cuda(CudaTarget::ptx((8, 6), (7, 5))), &opts));
        assert!(is_compatible(&dev, &Target::Cuda(CudaTarget::ptx((7, 5), (7, 0))), &opts));
        assert!(!is_compatible(&dev, &Target::Cuda(CudaTarget::ptx((7, 5), (6, 3))), &opts));
        assert!(!is_compatible(&dev, &Target::Cuda(CudaTarget::ptx((8, 9), (7, 8))), &opts));
    }

    #[test]
    fn test_cubin_beats_ptx_unless_forced() {
        let dev = cuda_device((8, 6), (7, 0));
        let cubin = CudaTarget { is_ptx: false, ..CudaTarget::ptx((8, 6), (7, 5)) };
        let archive = archive_of(&[Target::Cuda(CudaTarget::ptx((8, 6), (8, 0))), Target::Cuda(cubin)]);
        assert_eq!(find_best_match_for_device(&dev, &archive).unwrap().index, 1);

        let forced = MatchOptions { cuda_force_ptx: true, ..Default::default() };
        assert_eq!(find_best_match_for_device_with(&dev, &archive, &forced).unwrap().index, 0);

        let other_sm = CudaTarget { is_ptx: false, ..CudaTarget::ptx((8, 0), (7, 0)) };
        assert!(!is_compatible(&dev, &Target::Cuda(other_sm), &MatchOptions::default()));
    }

    #[test]
    fn test_force_driver_sm() {
        let dev = cuda_device((8, 6), (7, 0));
        let target = Target::Cuda(CudaTarget::ptx((8, 6), (7, 5)));
        let opts = MatchOptions { cuda_force_driver_sm: 75, ..Default::default() };
        assert!(!is_compatible(&dev, &target, &opts));
    }

    #[test]
    fn test_depth_compare_requires_support() {
        let mut dev = cuda_device((8, 6), (7, 0));
        let target = Target::Cuda(CudaTarget { image_depth_compare_support: true, ..CudaTarget::ptx((8, 6), (7, 5)) });
        assert!(!is_compatible(&dev, &target, &MatchOptions::default()));
        dev.image_depth_compare_support = true;
        assert!(is_compatible(&dev, &target, &MatchOptions::default()));
    }

    #[test]
    fn test_ties_pick_earliest() {
        let dev = cuda_device((8, 6), (7, 0));
        let t = Target::Cuda(CudaTarget::ptx((8, 0), (7, 0)));
        let archive = archive_of(&[t, t, t]);
        assert_eq!(find_best_match_for_device(&dev, &archive).unwrap().index, 0);
    }

    #[test]
    fn test_max_registers_ignored() {
        let dev = cuda_device((8, 6), (7, 0));
        let a = Target::Cuda(CudaTarget { max_registers: 32, ..CudaTarget::ptx((8, 0), (7, 0)) });
        let b = Target::Cuda(CudaTarget { max_registers: 255, ..CudaTarget::ptx((8, 0), (7, 0)) });
        let archive = archive_of(&[a, b]);
        assert_eq!(find_best_match_for_device(&dev, &archive).unwrap().index, 0);
    }

    fn opencl_device(version: (u32, u32), spirv: bool) -> Device {
        Device {
            name: "cl gpu".into(),
            vendor: Vendor::Intel,
            id: DeviceId::new(DeviceKind::Gpu, 0),
            image_support: true,
            double_support: true,
            sub_group_support: true,
            simd_width: 16,
            simd_range: UVec2::new(8, 32),
            backend: BackendDeviceInfo::OpenCl(OpenClDeviceInfo {
                cl_version: ApiVersion::new(version.0, version.1),
                spirv_version: spirv.then(|| ApiVersion::new(1, 2)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_opencl_selection() {
        let dev = opencl_device((2, 1), true);
        let spir = OpenClTarget { major: 1, minor: 2, is_spir: true, ..Default::default() };
        let spirv = OpenClTarget { major: 2, minor: 0, ..Default::default() };
        let intel = OpenClTarget { device_target: OpenClDeviceTarget::IntelGpu, ..spirv };
        let amd = OpenClTarget { device_target: OpenClDeviceTarget::AmdGpu, ..spirv };
        let too_new = OpenClTarget { major: 3, minor: 0, ..Default::default() };
        let needs_msaa = OpenClTarget { image_msaa_support: true, ..intel };
        let with_caps = OpenClTarget { image_support: true, double_support: true, ..intel };
        let wide = OpenClTarget { simd_width: 64, ..with_caps };

        let opts = MatchOptions::default();
        assert!(!is_compatible(&dev, &Target::OpenCl(amd), &opts));
        assert!(!is_compatible(&dev, &Target::OpenCl(too_new), &opts));
        assert!(!is_compatible(&dev, &Target::OpenCl(needs_msaa), &opts));
        assert!(!is_compatible(&dev, &Target::OpenCl(wide), &opts));

        let archive = archive_of(&[
            Target::OpenCl(spir),
            Target::OpenCl(spirv),
            Target::OpenCl(intel),
            Target::OpenCl(with_caps),
            Target::OpenCl(amd),
        ]);
        assert_eq!(find_best_match_for_device(&dev, &archive).unwrap().index, 3);

        let no_spirv = MatchOptions { opencl_disable_spirv: true, ..Default::default() };
        assert_eq!(find_best_match_for_device_with(&dev, &archive, &no_spirv).unwrap().index, 0);
    }

    #[test]
    fn test_opencl_spir_native_before_2_0() {
        let dev = opencl_device((1, 2), true);
        let spir = OpenClTarget { major: 1, minor: 2, is_spir: true, ..Default::default() };
        let spirv = OpenClTarget { major: 1, minor: 2, ..Default::default() };
        let archive = archive_of(&[Target::OpenCl(spir), Target::OpenCl(spirv)]);
        assert_eq!(find_best_match_for_device(&dev, &archive).unwrap().index, 0);

        let dev = opencl_device((2, 0), true);
        assert_eq!(find_best_match_for_device(&dev, &archive).unwrap().index, 1);
    }

    #[test]
    fn test_vulkan_selection() {
        let dev = Device {
            vendor: Vendor::Amd,
            double_support: true,
            backend: BackendDeviceInfo::Vulkan(VulkanDeviceInfo {
                vulkan_version: ApiVersion::new(1, 3),
                spirv_version: ApiVersion::new(1, 6),
                ..Default::default()
            }),
            ..Default::default()
        };
        let base = VulkanTarget { vulkan_major: 1, vulkan_minor: 2, spirv_major: 1, spirv_minor: 5, ..Default::default() };
        let newer = VulkanTarget { vulkan_minor: 3, spirv_minor: 6, ..base };
        let amd = VulkanTarget { device_target: VendorTarget::Amd, ..base };
        let nvidia = VulkanTarget { device_target: VendorTarget::Nvidia, ..newer };
        let atomics = VulkanTarget { basic_64_bit_atomics_support: true, ..newer };

        let opts = MatchOptions::default();
        assert!(!is_compatible(&dev, &Target::Vulkan(nvidia), &opts));
        assert!(!is_compatible(&dev, &Target::Vulkan(atomics), &opts));

        let archive = archive_of(&[Target::Vulkan(base), Target::Vulkan(amd), Target::Vulkan(newer), Target::Vulkan(nvidia)]);
        assert_eq!(find_best_match_for_device(&dev, &archive).unwrap().index, 2);
    }

    #[test]
    fn test_host_and_backend_mismatch() {
        let dev = Device {
            backend: BackendDeviceInfo::Host(HostDeviceInfo { arch: HostArch::X86_64, cpu_tier: 3 }),
            ..Default::default()
        };
        let archive = archive_of(&[
            Target::Cuda(CudaTarget::ptx((5, 0), (5, 0))),
            Target::Host(HostTarget { arch: HostArch::X86_64, cpu_tier: 1 }),
            Target::Host(HostTarget { arch: HostArch::X86_64, cpu_tier: 3 }),
            Target::Host(HostTarget { arch: HostArch::X86_64, cpu_tier: 4 }),
            Target::Host(HostTarget { arch: HostArch::Aarch64, cpu_tier: 1 }),
        ]);
        assert_eq!(find_best_match_for_device(&dev, &archive).unwrap().index, 2);
        assert!(find_best_match_for_device(&dev, &archive_of(&[])).is_none());
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.cuda.force_ptx = true;
        config.opencl.disable_spirv = true;
        let opts = MatchOptions::from(&config);
        assert!(opts.cuda_force_ptx && opts.opencl_disable_spirv);
        assert_eq!(opts.cuda_force_driver_sm, 0);
    }
}
