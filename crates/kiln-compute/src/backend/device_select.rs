//! Device filtering, scoring and ID assignment shared by all backends.

use kiln_core::{Config, Device, DeviceId, DeviceKind, Vendor};
use tracing::{debug, info};

// =============================================================================
// Whitelist
// =============================================================================

/// One whitelist entry: a device class or a name substring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistEntry {
    Kind(DeviceKind),
    /// Lower-case substring of the device name.
    Name(String),
}

impl WhitelistEntry {
    /// "cpu" / "gpu" / "accelerator" become kinds, everything else a name.
    pub fn parse(s: &str) -> Self {
        match DeviceKind::parse(s) {
            Some(kind) => Self::Kind(kind),
            None => Self::Name(s.trim().to_ascii_lowercase()),
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        match self {
            Self::Kind(kind) => device.kind() == *kind,
            Self::Name(name) => device.name.to_ascii_lowercase().contains(name.as_str()),
        }
    }
}

/// User device whitelist. Empty accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceWhitelist {
    entries: Vec<WhitelistEntry>,
}

impl DeviceWhitelist {
    pub fn new<S: AsRef<str>>(entries: impl IntoIterator<Item = S>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .filter(|s| !s.as_ref().trim().is_empty())
                .map(|s| WhitelistEntry::parse(s.as_ref()))
                .collect(),
        }
    }

    /// Whitelist from `compute.whitelist`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.compute.whitelist)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if any entry matches (or the list is empty).
    pub fn accepts(&self, device: &Device) -> bool {
        self.entries.is_empty() || self.entries.iter().any(|e| e.matches(device))
    }
}

// =============================================================================
// Scoring
// =============================================================================

/// CUDA cores per SM for a compute capability.
pub fn cuda_cores_per_sm(major: u32, minor: u32) -> u32 {
    match (major, minor) {
        (3, _) => 192,
        (5, _) => 128,
        (6, 0) => 64,
        (6, _) => 128,
        (7, _) => 64,
        (8, 0) => 64,
        (8, _) => 128,
        (9, _) => 128,
        _ => 128,
    }
}

/// CUDA score: cores per SM x SM count x clock (MHz).
pub fn cuda_score(device: &Device) -> u64 {
    let Some(cuda) = device.cuda() else {
        return 0;
    };
    let cores = cuda_cores_per_sm(cuda.sm.x, cuda.sm.y) as u64;
    cores * u64::from(cuda.sm_count.max(device.units)) * u64::from(device.clock)
}

/// Per-unit weight of an OpenCL device.
///
/// GPU compute units of different vendors hide very different lane counts;
/// CPU units are always weighted 1.
pub fn opencl_vendor_weight(device: &Device) -> u64 {
    if device.is_cpu() {
        return 1;
    }
    match device.vendor {
        Vendor::Nvidia => 8,
        Vendor::Amd | Vendor::Apple => 4,
        _ => 1,
    }
}

/// OpenCL score: weighted units x clock (MHz).
pub fn opencl_score(device: &Device) -> u64 {
    opencl_vendor_weight(device) * u64::from(device.units) * u64::from(device.clock)
}

/// Vulkan score: device-local memory in MiB, weighted 4x for GPUs.
///
/// Vulkan reports neither unit counts nor clocks.
pub fn vulkan_score(device: &Device) -> u64 {
    let mib = device.global_mem_size >> 20;
    if device.is_gpu() { mib * 4 } else { mib }
}

// =============================================================================
// Device list
// =============================================================================

/// Devices of one context plus fastest CPU/GPU bookkeeping.
///
/// Immutable after [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    devices: Vec<Device>,
    fastest_cpu: Option<usize>,
    fastest_gpu: Option<usize>,
}

impl DeviceList {
    /// Filters `candidates`, assigns per-kind IDs in enumeration order and scores them.
    ///
    /// Each candidate's `id.kind` must already be set.
    pub fn build(candidates: Vec<Device>, whitelist: &DeviceWhitelist, score: impl Fn(&Device) -> u64) -> Self {
        let mut list = Self::default();
        let mut next_index = [0u32; 3];
        for mut device in candidates {
            if !whitelist.accepts(&device) {
                debug!(device = %device.name, "device not in whitelist");
                continue;
            }
            let kind = device.kind();
            let slot = match kind {
                DeviceKind::Cpu => 0,
                DeviceKind::Gpu => 1,
                DeviceKind::Accelerator => 2,
            };
            device.id = DeviceId::new(kind, next_index[slot]);
            next_index[slot] += 1;
            device.score = score(&device);

            let index = list.devices.len();
            let fastest = match kind {
                DeviceKind::Cpu => Some(&mut list.fastest_cpu),
                DeviceKind::Gpu => Some(&mut list.fastest_gpu),
                DeviceKind::Accelerator => None,
            };
            if let Some(fastest) = fastest {
                if fastest.is_none_or(|f| list.devices[f].score < device.score) {
                    *fastest = Some(index);
                }
            }
            info!(id = %device.id, name = %device.name, score = device.score, "device");
            list.devices.push(device);
        }
        list
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn fastest_cpu(&self) -> Option<&Device> {
        self.fastest_cpu.map(|i| &self.devices[i])
    }

    pub fn fastest_gpu(&self) -> Option<&Device> {
        self.fastest_gpu.map(|i| &self.devices[i])
    }

    /// Faster of the fastest CPU and GPU; the GPU wins ties. Falls back to
    /// the first device when neither exists.
    pub fn fastest_device(&self) -> Option<&Device> {
        match (self.fastest_cpu(), self.fastest_gpu()) {
            (Some(cpu), Some(gpu)) => Some(if gpu.score >= cpu.score { gpu } else { cpu }),
            (Some(cpu), None) => Some(cpu),
            (None, Some(gpu)) => Some(gpu),
            (None, None) => self.devices.first(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec2;
    use kiln_core::{BackendDeviceInfo, CudaDeviceInfo, OpenClDeviceInfo};

    fn opencl_device(name: &str, kind: DeviceKind, vendor: Vendor, units: u32, clock: u32) -> Device {
        Device {
            name: name.into(),
            vendor,
            id: DeviceId::new(kind, 99),
            units,
            clock,
            backend: BackendDeviceInfo::OpenCl(OpenClDeviceInfo::default()),
            ..Default::default()
        }
    }

    #[test]
    fn test_gpu_whitelist() {
        let candidates = vec![
            opencl_device("Intel Xeon", DeviceKind::Cpu, Vendor::Intel, 32, 3000),
            opencl_device("Radeon Pro", DeviceKind::Gpu, Vendor::Amd, 40, 1500),
        ];
        let list = DeviceList::build(candidates, &DeviceWhitelist::new(["gpu"]), opencl_score);
        assert_eq!(list.len(), 1);
        assert_eq!(list.devices()[0].id, DeviceId::new(DeviceKind::Gpu, 0));
        assert_eq!(list.fastest_device().map(|d| d.id), Some(list.devices()[0].id));
    }

    #[test]
    fn test_ids_per_kind_and_fastest() {
        let candidates = vec![
            opencl_device("gpu a", DeviceKind::Gpu, Vendor::Intel, 24, 1000),
            opencl_device("cpu", DeviceKind::Cpu, Vendor::Intel, 16, 3000),
            opencl_device("gpu b", DeviceKind::Gpu, Vendor::Nvidia, 20, 1500),
        ];
        let list = DeviceList::build(candidates, &DeviceWhitelist::default(), opencl_score);
        let ids: Vec<String> = list.devices().iter().map(|d| d.id.to_string()).collect();
        assert_eq!(ids, ["GPU0", "CPU0", "GPU1"]);
        assert_eq!(list.fastest_gpu().map(|d| d.name.as_str()), Some("gpu b"));
        // 8 * 20 * 1500 = 240000 > 16 * 3000
        assert_eq!(list.fastest_device().map(|d| d.name.as_str()), Some("gpu b"));
    }

    #[test]
    fn test_gpu_wins_ties() {
        let candidates = vec![
            opencl_device("cpu", DeviceKind::Cpu, Vendor::Intel, 10, 100),
            opencl_device("gpu", DeviceKind::Gpu, Vendor::Intel, 10, 100),
        ];
        let list = DeviceList::build(candidates, &DeviceWhitelist::default(), opencl_score);
        assert!(list.fastest_device().is_some_and(|d| d.is_gpu()));
    }

    #[test]
    fn test_name_whitelist() {
        let wl = DeviceWhitelist::new(["RTX", ""]);
        assert!(!wl.is_empty());
        let dev = opencl_device("NVIDIA GeForce RTX 4090", DeviceKind::Gpu, Vendor::Nvidia, 1, 1);
        assert!(wl.accepts(&dev));
        let other = opencl_device("Radeon", DeviceKind::Gpu, Vendor::Amd, 1, 1);
        assert!(!wl.accepts(&other));
    }

    #[test]
    fn test_cuda_score() {
        assert_eq!(cuda_cores_per_sm(8, 6), 128);
        assert_eq!(cuda_cores_per_sm(7, 5), 64);
        assert_eq!(cuda_cores_per_sm(6, 0), 64);
        let device = Device {
            clock: 1000,
            backend: BackendDeviceInfo::Cuda(CudaDeviceInfo { sm: UVec2::new(8, 6), sm_count: 10, ..Default::default() }),
            ..Default::default()
        };
        assert_eq!(cuda_score(&device), 128 * 10 * 1000);
    }

    #[test]
    fn test_vulkan_score() {
        let gpu = Device { id: DeviceId::new(DeviceKind::Gpu, 0), global_mem_size: 8 << 30, ..Default::default() };
        let cpu = Device { id: DeviceId::new(DeviceKind::Cpu, 0), global_mem_size: 16 << 30, ..Default::default() };
        assert_eq!(vulkan_score(&gpu), 8192 * 4);
        assert!(vulkan_score(&gpu) > vulkan_score(&cpu));
    }
}
