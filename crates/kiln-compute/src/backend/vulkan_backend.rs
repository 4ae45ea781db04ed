//! Vulkan compute backend.
//!
//! One logical device per physical device that offers Vulkan 1.3 with
//! timeline semaphores and synchronization2. Command buffers and fences come
//! from the [`CommandPoolManager`]; fences handed to callers are timeline
//! semaphores.
//!
//! # Kernel interface
//!
//! Programs are SPIR-V modules with one compute entry point per kernel.
//! Everything lives in descriptor set 0, argument `i` uses binding `2 * i`:
//!
//! | argument            | binding `2i`                  | binding `2i + 1`         |
//! |---------------------|-------------------------------|--------------------------|
//! | buffer              | storage buffer                | -                        |
//! | read-only image     | combined image sampler        | -                        |
//! | write-only image    | 17 storage images (per level) | -                        |
//! | read-write image    | 17 storage images (per level) | combined image sampler   |
//! | value               | push constant (std430 offsets)| -                        |
//!
//! Specialization constants 0..2 carry the local size, so one module serves
//! every local size a caller picks; pipelines are cached per local size.

use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char};
use std::io::Cursor;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use ash::vk;
use glam::{UVec2, UVec3};
use kiln_binary::{CommandToolchain, CompileOptions, MatchOptions, ProgramSource};
use kiln_core::{
    AddressSpace, ApiVersion, ArgImageAccess, BackendDeviceInfo, Config, Device, DeviceId, DeviceKind, FunctionInfo,
    MapFlag, MemoryFlag, ToolchainConfig, Vendor, VulkanDeviceInfo,
};
use tracing::{debug, info, trace, warn};

use super::command_pool::{CommandBufferHandle, CommandPoolManager, PoolOptions, SubmitRequest};
use super::completion::CompletionPool;
use super::context::{AsAny, Context, DefaultQueues};
use super::device_select::{DeviceList, DeviceWhitelist, vulkan_score};
use super::memory::{Mapping, MappingTable};
use super::minify::{MINIFY_SOURCE, MinifyLatch};
use super::program::{DeviceProgram, Function, Program, ProgramInput, SelectedBinary, kernel_names};
use super::indirect::{CompletionHandler, IndirectCommandPipeline};
use super::queue::{
    Fence, FenceValues, FenceWait, KernelArg, LaunchParams, Queue, SubmitParams, check_args, effective_local_size,
    group_count,
};
use super::resource::{Buffer, BufferDesc, Image, ImageDesc, check_image_support, check_range};
use super::sampler::SamplerDesc;
use super::vulkan_image::{MAX_MIP_VIEWS, VulkanImage};
use super::vulkan_pool::VulkanCommandBackend;
use super::Backend;
use crate::{ComputeError, ComputeResult};

/// Lowest accepted device API version.
pub const VULKAN_MIN_VERSION: ApiVersion = ApiVersion::new(1, 3);

/// Queues requested from the compute family of each device.
const MAX_QUEUES_PER_DEVICE: u32 = 4;

/// Descriptor sets per pool of one kernel.
const DESCRIPTOR_SETS_PER_POOL: u32 = 64;

/// Bound of `finish` on completion work handed to the pool.
const FINISH_TIMEOUT: Duration = Duration::from_secs(60);

/// Handle type of exported memory and semaphores.
pub(crate) const EXTERNAL_MEMORY_HANDLE: vk::ExternalMemoryHandleTypeFlags =
    vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD;
pub(crate) const EXTERNAL_SEMAPHORE_HANDLE: vk::ExternalSemaphoreHandleTypeFlags =
    vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD;

// =============================================================================
// Errors
// =============================================================================

/// Maps a failed call to an error naming it; a lost device aborts.
pub(crate) fn vk_error(what: &'static str) -> impl Fn(vk::Result) -> ComputeError {
    move |result| {
        if result == vk::Result::ERROR_DEVICE_LOST {
            crate::device_lost(what);
        }
        ComputeError::OperationFailed(format!("{what}: {result}"))
    }
}

// =============================================================================
// Instance / device
// =============================================================================

pub(crate) struct VulkanInstance {
    _entry: ash::Entry,
    pub(crate) instance: ash::Instance,
}

impl VulkanInstance {
    fn new() -> ComputeResult<Self> {
        #[allow(unsafe_code)]
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| ComputeError::BackendNotAvailable(format!("cannot load the Vulkan loader: {e}")))?;
        let app = vk::ApplicationInfo::default()
            .application_name(c"kiln")
            .engine_name(c"kiln")
            .api_version(vk::API_VERSION_1_3);
        let info = vk::InstanceCreateInfo::default().application_info(&app);
        #[allow(unsafe_code)]
        let instance = unsafe { entry.create_instance(&info, None) }
            .map_err(|e| ComputeError::BackendNotAvailable(format!("vkCreateInstance: {e}")))?;
        Ok(Self { _entry: entry, instance })
    }

    #[allow(unsafe_code)]
    fn physical_devices(&self) -> ComputeResult<Vec<vk::PhysicalDevice>> {
        unsafe { self.instance.enumerate_physical_devices() }.map_err(vk_error("vkEnumeratePhysicalDevices"))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        #[allow(unsafe_code)]
        unsafe {
            self.instance.destroy_instance(None)
        };
    }
}

/// Physical device that passed the query, with what device creation needs.
struct Candidate {
    physical: vk::PhysicalDevice,
    family: u32,
    queue_count: u32,
    external: bool,
    features: vk::PhysicalDeviceFeatures,
    int64_atomics: bool,
}

/// Logical device plus its queues.
pub(crate) struct VulkanDevice {
    _instance: Arc<VulkanInstance>,
    pub(crate) physical: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) family: u32,
    queues: Vec<(vk::Queue, Mutex<()>)>,
    next_queue: AtomicUsize,
    pub(crate) memory: vk::PhysicalDeviceMemoryProperties,
    pub(crate) limits: vk::PhysicalDeviceLimits,
    pub(crate) external_memory_fd: Option<ash::khr::external_memory_fd::Device>,
    pub(crate) external_semaphore_fd: Option<ash::khr::external_semaphore_fd::Device>,
}

impl VulkanDevice {
    fn new(instance: Arc<VulkanInstance>, candidate: &Candidate) -> ComputeResult<Self> {
        let count = candidate.queue_count.clamp(1, MAX_QUEUES_PER_DEVICE);
        let priorities = vec![1.0f32; count as usize];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(candidate.family)
            .queue_priorities(&priorities)];

        let mut extensions: Vec<*const c_char> = Vec::new();
        if candidate.external {
            extensions.push(ash::khr::external_memory_fd::NAME.as_ptr());
            extensions.push(ash::khr::external_semaphore_fd::NAME.as_ptr());
        }
        let supported = candidate.features;
        let features = vk::PhysicalDeviceFeatures::default()
            .shader_float64(supported.shader_float64 == vk::TRUE)
            .shader_int64(supported.shader_int64 == vk::TRUE)
            .sampler_anisotropy(supported.sampler_anisotropy == vk::TRUE)
            .image_cube_array(supported.image_cube_array == vk::TRUE)
            .shader_storage_image_read_without_format(supported.shader_storage_image_read_without_format == vk::TRUE)
            .shader_storage_image_write_without_format(
                supported.shader_storage_image_write_without_format == vk::TRUE,
            );
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .shader_buffer_int64_atomics(candidate.int64_atomics);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
        let info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut features12)
            .push_next(&mut features13);

        let vk_instance = &instance.instance;
        #[allow(unsafe_code)]
        let device = unsafe { vk_instance.create_device(candidate.physical, &info, None) }
            .map_err(|e| ComputeError::DeviceCreation(format!("vkCreateDevice: {e}")))?;
        #[allow(unsafe_code)]
        let queues = (0..count)
            .map(|index| (unsafe { device.get_device_queue(candidate.family, index) }, Mutex::new(())))
            .collect();
        #[allow(unsafe_code)]
        let (memory, limits) = unsafe {
            (
                vk_instance.get_physical_device_memory_properties(candidate.physical),
                vk_instance.get_physical_device_properties(candidate.physical).limits,
            )
        };
        let (external_memory_fd, external_semaphore_fd) = if candidate.external {
            (
                Some(ash::khr::external_memory_fd::Device::new(vk_instance, &device)),
                Some(ash::khr::external_semaphore_fd::Device::new(vk_instance, &device)),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            _instance: instance,
            physical: candidate.physical,
            device,
            family: candidate.family,
            queues,
            next_queue: AtomicUsize::new(0),
            memory,
            limits,
            external_memory_fd,
            external_semaphore_fd,
        })
    }

    /// Round-robin index of the native queue a new [`VulkanQueue`] uses.
    fn next_queue_index(&self) -> usize {
        self.next_queue.fetch_add(1, Ordering::Relaxed) % self.queues.len().max(1)
    }

    /// Runs `f` on native queue `index` with its submission lock held.
    pub(crate) fn with_queue<R>(
        &self,
        index: usize,
        f: impl FnOnce(vk::Queue) -> ComputeResult<R>,
    ) -> ComputeResult<R> {
        let (queue, lock) = self
            .queues
            .get(index)
            .ok_or_else(|| ComputeError::InvalidArgument(format!("no native queue {index}")))?;
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        f(*queue)
    }

    pub(crate) fn supports_external(&self) -> bool {
        self.external_memory_fd.is_some() && self.external_semaphore_fd.is_some()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        #[allow(unsafe_code)]
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!(error = %e, "vkDeviceWaitIdle failed during teardown");
            }
            self.device.destroy_device(None);
        }
    }
}

/// Device kind of a physical device type.
pub fn device_kind(device_type: vk::PhysicalDeviceType) -> DeviceKind {
    match device_type {
        vk::PhysicalDeviceType::CPU => DeviceKind::Cpu,
        vk::PhysicalDeviceType::DISCRETE_GPU
        | vk::PhysicalDeviceType::INTEGRATED_GPU
        | vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceKind::Gpu,
        _ => DeviceKind::Accelerator,
    }
}

/// Driver version word as the vendor's tools print it.
pub fn driver_version_string(vendor: Vendor, version: u32) -> String {
    match vendor {
        Vendor::Nvidia => format!("{}.{}.{}", version >> 22, (version >> 14) & 0xff, (version >> 6) & 0xff),
        Vendor::Intel if cfg!(windows) => format!("{}.{}", version >> 14, version & 0x3fff),
        _ => format!(
            "{}.{}.{}",
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version)
        ),
    }
}

/// Highest SPIR-V version a Vulkan version guarantees.
pub fn spirv_version_for(vulkan: ApiVersion) -> ApiVersion {
    match (vulkan.major, vulkan.minor) {
        (1, 0) => ApiVersion::new(1, 0),
        (1, 1) => ApiVersion::new(1, 3),
        (1, 2) => ApiVersion::new(1, 5),
        _ => ApiVersion::new(1, 6),
    }
}

/// First memory type allowed by `type_bits` that has every flag of `flags`.
pub fn find_memory_type(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32)).find(|&index| {
        type_bits & (1 << index) != 0 && memory.memory_types[index as usize].property_flags.contains(flags)
    })
}

fn query_device(instance: &ash::Instance, physical: vk::PhysicalDevice, index: u32) -> Option<(Device, Candidate)> {
    let mut props11 = vk::PhysicalDeviceVulkan11Properties::default();
    let mut props13 = vk::PhysicalDeviceVulkan13Properties::default();
    let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut props11).push_next(&mut props13);
    #[allow(unsafe_code)]
    unsafe {
        instance.get_physical_device_properties2(physical, &mut props2)
    };
    let props = props2.properties;

    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features2 =
        vk::PhysicalDeviceFeatures2::default().push_next(&mut features12).push_next(&mut features13);
    #[allow(unsafe_code)]
    unsafe {
        instance.get_physical_device_features2(physical, &mut features2)
    };
    let features = features2.features;

    let name = props.device_name_as_c_str().map(CStr::to_string_lossy).unwrap_or_default().into_owned();
    let version = ApiVersion::new(vk::api_version_major(props.api_version), vk::api_version_minor(props.api_version));
    if version < VULKAN_MIN_VERSION {
        warn!(device = %name, %version, "skipping Vulkan device below 1.3");
        return None;
    }
    if features12.timeline_semaphore != vk::TRUE || features13.synchronization2 != vk::TRUE {
        warn!(device = %name, "skipping Vulkan device without timeline semaphores or synchronization2");
        return None;
    }

    #[allow(unsafe_code)]
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical) };
    let Some((family, queue_count)) = families
        .iter()
        .enumerate()
        .find(|(_, f)| f.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|(i, f)| (i as u32, f.queue_count))
    else {
        warn!(device = %name, "skipping Vulkan device without a compute queue");
        return None;
    };

    #[allow(unsafe_code)]
    let extensions = unsafe { instance.enumerate_device_extension_properties(physical) }.unwrap_or_default();
    let has_extension = |wanted: &CStr| extensions.iter().any(|e| e.extension_name_as_c_str() == Ok(wanted));
    let external =
        has_extension(ash::khr::external_memory_fd::NAME) && has_extension(ash::khr::external_semaphore_fd::NAME);

    #[allow(unsafe_code)]
    let memory = unsafe { instance.get_physical_device_memory_properties(physical) };
    let heaps = &memory.memory_heaps[..(memory.memory_heap_count as usize).min(vk::MAX_MEMORY_HEAPS)];
    let device_local = heaps
        .iter()
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size)
        .max()
        .unwrap_or(0);

    let limits = props.limits;
    let vendor = Vendor::from_pci_id(props.vendor_id);
    let kind = device_kind(props.device_type);
    let max_levels = 32 - limits.max_image_dimension2_d.max(1).leading_zeros();
    let subgroup_ops = props11.subgroup_supported_operations;
    let int64_atomics = features12.shader_buffer_int64_atomics == vk::TRUE;
    let anisotropy = features.sampler_anisotropy == vk::TRUE;

    let device = Device {
        name,
        vendor,
        vendor_name: format!("{vendor:?}"),
        driver_version_str: driver_version_string(vendor, props.driver_version),
        id: DeviceId::new(kind, index),
        uuid: Some(props11.device_uuid),
        units: 1,
        clock: 0,
        global_mem_size: device_local,
        local_mem_size: u64::from(limits.max_compute_shared_memory_size),
        constant_mem_size: u64::from(limits.max_uniform_buffer_range),
        max_mem_alloc: props11.max_memory_allocation_size,
        max_total_local_size: limits.max_compute_work_group_invocations,
        max_local_size: UVec3::from_array(limits.max_compute_work_group_size),
        max_group_size: UVec3::from_array(limits.max_compute_work_group_count),
        max_image_1d_dim: limits.max_image_dimension1_d,
        max_image_1d_buffer_dim: limits.max_texel_buffer_elements,
        max_image_2d_dim: UVec2::splat(limits.max_image_dimension2_d),
        max_image_3d_dim: UVec3::splat(limits.max_image_dimension3_d),
        max_image_array_layers: limits.max_image_array_layers,
        max_mip_levels: max_levels.min(MAX_MIP_VIEWS as u32),
        simd_width: props11.subgroup_size,
        simd_range: UVec2::new(props13.min_subgroup_size, props13.max_subgroup_size),
        sub_group_support: subgroup_ops.contains(vk::SubgroupFeatureFlags::BASIC),
        sub_group_shuffle_support: subgroup_ops.contains(vk::SubgroupFeatureFlags::SHUFFLE),
        double_support: features.shader_float64 == vk::TRUE,
        basic_64_bit_atomics_support: int64_atomics,
        extended_64_bit_atomics_support: int64_atomics,
        image_support: true,
        image_depth_support: true,
        // depth formats never carry the storage usage
        image_depth_write_support: false,
        image_depth_compare_support: true,
        image_cube_support: true,
        image_cube_write_support: true,
        image_cube_array_support: features.image_cube_array == vk::TRUE,
        image_mipmap_support: true,
        image_mipmap_write_support: true,
        image_offset_read_support: true,
        image_offset_write_support: true,
        image_gather_support: features.shader_image_gather_extended == vk::TRUE,
        image_read_write_support: features.shader_storage_image_read_without_format == vk::TRUE,
        anisotropic_support: anisotropy,
        max_anisotropy: if anisotropy { limits.max_sampler_anisotropy as u32 } else { 1 },
        backend: BackendDeviceInfo::Vulkan(VulkanDeviceInfo {
            vulkan_version: version,
            spirv_version: spirv_version_for(version),
            driver_version: props.driver_version,
            external_memory_support: external,
        }),
        ..Default::default()
    };
    let candidate = Candidate { physical, family, queue_count, external, features, int64_atomics };
    Some((device, candidate))
}

// =============================================================================
// Memory helpers
// =============================================================================

/// Allocates memory for `requirements`; `dedicated` and `export` chain the
/// dedicated-allocation and export infos.
pub(crate) fn allocate_memory(
    device: &VulkanDevice,
    requirements: vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
    dedicated: Option<vk::Image>,
    export: bool,
) -> ComputeResult<vk::DeviceMemory> {
    let type_index = find_memory_type(&device.memory, requirements.memory_type_bits, flags)
        .ok_or_else(|| ComputeError::OperationFailed(format!("no memory type with {flags:?}")))?;
    let mut export_info = vk::ExportMemoryAllocateInfo::default().handle_types(EXTERNAL_MEMORY_HANDLE);
    let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default();
    let mut info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(type_index);
    if export {
        info = info.push_next(&mut export_info);
    }
    if let Some(image) = dedicated {
        dedicated_info = dedicated_info.image(image);
        info = info.push_next(&mut dedicated_info);
    }
    #[allow(unsafe_code)]
    let memory = unsafe { device.device.allocate_memory(&info, None) };
    memory.map_err(vk_error("vkAllocateMemory"))
}

/// Creates a buffer with bound memory of `flags`.
#[allow(unsafe_code)]
pub(crate) fn create_buffer(
    device: &VulkanDevice,
    size: u64,
    usage: vk::BufferUsageFlags,
    flags: vk::MemoryPropertyFlags,
) -> ComputeResult<(vk::Buffer, vk::DeviceMemory)> {
    let info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let vk_device = &device.device;
    unsafe {
        let buffer = vk_device
            .create_buffer(&info, None)
            .map_err(|e| ComputeError::BufferCreation(format!("vkCreateBuffer: {e}")))?;
        let requirements = vk_device.get_buffer_memory_requirements(buffer);
        let memory = match allocate_memory(device, requirements, flags, None, false) {
            Ok(memory) => memory,
            Err(e) => {
                vk_device.destroy_buffer(buffer, None);
                return Err(ComputeError::BufferCreation(e.to_string()));
            }
        };
        if let Err(e) = vk_device.bind_buffer_memory(buffer, memory, 0) {
            vk_device.destroy_buffer(buffer, None);
            vk_device.free_memory(memory, None);
            return Err(ComputeError::BufferCreation(format!("vkBindBufferMemory: {e}")));
        }
        Ok((buffer, memory))
    }
}

/// Host-visible transfer buffer, mapped for its whole life.
pub(crate) struct Staging<'a> {
    device: &'a VulkanDevice,
    pub(crate) buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    ptr: *mut u8,
    size: usize,
}

impl<'a> Staging<'a> {
    pub(crate) fn new(device: &'a VulkanDevice, size: u64) -> ComputeResult<Self> {
        let (buffer, memory) = create_buffer(
            device,
            size.max(4),
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let mut staging = Self { device, buffer, memory, ptr: std::ptr::null_mut(), size: size as usize };
        #[allow(unsafe_code)]
        let ptr = unsafe { device.device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
            .map_err(vk_error("vkMapMemory"))?;
        staging.ptr = ptr.cast();
        Ok(staging)
    }

    // SAFETY: the mapping covers at least `size` bytes and lives as long as `self`
    #[allow(unsafe_code)]
    pub(crate) fn bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.ptr, self.size)
        }
    }

    #[allow(unsafe_code)]
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr, self.size)
        }
    }
}

impl Drop for Staging<'_> {
    fn drop(&mut self) {
        let device = &self.device.device;
        #[allow(unsafe_code)]
        unsafe {
            if !self.ptr.is_null() {
                device.unmap_memory(self.memory);
            }
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Makes prior writes of any stage visible to any later access.
pub(crate) fn global_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = [vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)];
    let dependency = vk::DependencyInfo::default().memory_barriers(&barrier);
    #[allow(unsafe_code)]
    unsafe {
        device.cmd_pipeline_barrier2(cmd, &dependency)
    };
}

/// Makes device writes visible to host reads after the fence wait.
fn host_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = [vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::HOST)
        .dst_access_mask(vk::AccessFlags2::HOST_READ)];
    let dependency = vk::DependencyInfo::default().memory_barriers(&barrier);
    #[allow(unsafe_code)]
    unsafe {
        device.cmd_pipeline_barrier2(cmd, &dependency)
    };
}

// =============================================================================
// Context
// =============================================================================

/// Vulkan compute context over every accepted physical device.
pub struct VulkanContext {
    devices: DeviceList,
    natives: HashMap<DeviceId, Arc<VulkanDevice>>,
    queues: DefaultQueues,
    completion: Arc<CompletionPool>,
    pool_options: PoolOptions,
    match_options: MatchOptions,
    minify: Arc<MinifyLatch<VulkanProgram>>,
}

impl VulkanContext {
    /// Checks whether the loader works and one device reaches Vulkan 1.3.
    pub fn is_available() -> bool {
        static AVAILABLE: OnceLock<bool> = OnceLock::new();
        *AVAILABLE.get_or_init(|| {
            let Ok(instance) = VulkanInstance::new() else {
                return false;
            };
            instance.physical_devices().is_ok_and(|physicals| {
                physicals
                    .iter()
                    .enumerate()
                    .any(|(i, &p)| query_device(&instance.instance, p, i as u32).is_some())
            })
        })
    }

    /// Creates the instance, one logical device per accepted physical
    /// device, the default queues and the minify build.
    pub fn new(config: &Config) -> ComputeResult<Self> {
        let instance = Arc::new(VulkanInstance::new()?);
        let mut candidates = Vec::new();
        let mut natives_info = Vec::new();
        for (index, physical) in instance.physical_devices()?.into_iter().enumerate() {
            if let Some((device, candidate)) = query_device(&instance.instance, physical, index as u32) {
                candidates.push(device);
                natives_info.push(candidate);
            }
        }

        // the list keeps accepted candidates in order, so natives pair up positionally
        let whitelist = DeviceWhitelist::from_config(config);
        let accepted: Vec<Candidate> = candidates
            .iter()
            .zip(natives_info)
            .filter(|(device, _)| whitelist.accepts(device))
            .map(|(_, candidate)| candidate)
            .collect();
        let devices = DeviceList::build(candidates, &whitelist, vulkan_score);
        if devices.is_empty() {
            return Err(ComputeError::NoDevices);
        }
        let mut natives = HashMap::new();
        for (device, candidate) in devices.devices().iter().zip(&accepted) {
            let native = VulkanDevice::new(Arc::clone(&instance), candidate)?;
            natives.insert(device.id, Arc::new(native));
        }

        let completion = Arc::new(CompletionPool::new()?);
        let pool_options = PoolOptions::from(config);
        let queues = DefaultQueues::new();
        for device in devices.devices() {
            let native = natives
                .get(&device.id)
                .ok_or_else(|| ComputeError::DeviceCreation(format!("no Vulkan device for {}", device.id)))?;
            let queue = VulkanQueue::new(device.clone(), Arc::clone(native), Arc::clone(&completion), pool_options);
            queues.insert(device.id, Arc::new(queue));
            info!(
                device = %device.name,
                id = %device.id,
                version = ?device.vulkan().map(|v| v.vulkan_version),
                external = native.supports_external(),
                "Vulkan device"
            );
        }

        let match_options = MatchOptions::from(config);
        let minify = Arc::new(MinifyLatch::new());
        {
            let devices = devices.devices().to_vec();
            let natives = natives.clone();
            let toolchain = config.toolchain.clone();
            minify.start(move || build_minify(&devices, &natives, &toolchain, &match_options));
        }

        Ok(Self { devices, natives, queues, completion, pool_options, match_options, minify })
    }

    pub(crate) fn native(&self, device: DeviceId) -> ComputeResult<&Arc<VulkanDevice>> {
        self.natives
            .get(&device)
            .ok_or_else(|| ComputeError::InvalidArgument(format!("{device} is not a Vulkan device of this context")))
    }

    /// Timeline fence whose semaphore can be exported to CUDA.
    pub fn create_exportable_fence(&self, device: &Device) -> ComputeResult<Arc<VulkanFence>> {
        Ok(Arc::new(VulkanFence::new(Arc::clone(self.native(device.id)?), true)?))
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        if !self.completion.wait_idle(FINISH_TIMEOUT) {
            warn!(outstanding = self.completion.outstanding(), "Vulkan completions still running at teardown");
        }
        self.completion.shutdown();
    }
}

fn build_minify(
    devices: &[Device],
    natives: &HashMap<DeviceId, Arc<VulkanDevice>>,
    toolchain: &ToolchainConfig,
    matching: &MatchOptions,
) -> ComputeResult<VulkanProgram> {
    let compiler = CommandToolchain::from_config(toolchain);
    let options = CompileOptions { silence_debug_output: true, ..CompileOptions::from_config(toolchain) };
    let input = ProgramInput::Source { toolchain: &compiler, source: ProgramSource::Memory(MINIFY_SOURCE), options: &options };
    build_program(devices, natives, &input, matching)
}

fn build_program(
    devices: &[Device],
    natives: &HashMap<DeviceId, Arc<VulkanDevice>>,
    input: &ProgramInput<'_>,
    matching: &MatchOptions,
) -> ComputeResult<VulkanProgram> {
    let programs = DeviceProgram::build_all(devices, input, matching, |device, binary| {
        let native = natives
            .get(&device.id)
            .ok_or_else(|| ComputeError::DeviceCreation(format!("no Vulkan device for {}", device.id)))?;
        load_module(native, binary)
    })?;
    debug!(kernels = kernel_names(&programs).len(), devices = programs.len(), "Vulkan program built");
    Ok(VulkanProgram::new(programs))
}

/// Downcasts a queue of this backend.
pub(crate) fn vulkan_queue(queue: &dyn Queue) -> ComputeResult<&VulkanQueue> {
    queue
        .as_any()
        .downcast_ref::<VulkanQueue>()
        .ok_or_else(|| ComputeError::InvalidArgument("queue does not belong to the Vulkan backend".into()))
}

impl AsAny for VulkanContext {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Context for VulkanContext {
    fn backend(&self) -> Backend {
        Backend::Vulkan
    }

    fn device_list(&self) -> &DeviceList {
        &self.devices
    }

    fn create_queue(&self, device: &Device) -> ComputeResult<Arc<dyn Queue>> {
        let native = Arc::clone(self.native(device.id)?);
        let device = self
            .device(device.id)
            .cloned()
            .ok_or_else(|| ComputeError::InvalidArgument(format!("{} is not a Vulkan device", device.id)))?;
        let completion = Arc::clone(&self.completion);
        let options = self.pool_options;
        self.queues
            .get_or_create(device.id, || Ok(Arc::new(VulkanQueue::new(device, native, completion, options))))
    }

    fn create_fence(&self, device: &Device) -> ComputeResult<Arc<dyn Fence>> {
        Ok(Arc::new(VulkanFence::new(Arc::clone(self.native(device.id)?), false)?))
    }

    fn create_buffer(&self, queue: &dyn Queue, desc: BufferDesc<'_>) -> ComputeResult<Arc<dyn Buffer>> {
        let queue = vulkan_queue(queue)?;
        desc.validate()?;
        if desc.flags.contains(MemoryFlag::VULKAN_SHARING) {
            return Err(ComputeError::Unsupported("shared buffers are not supported".into()));
        }
        Ok(Arc::new(VulkanBuffer::new(queue, desc)?))
    }

    fn create_image(&self, queue: &dyn Queue, desc: ImageDesc<'_>) -> ComputeResult<Arc<dyn Image>> {
        let vulkan = vulkan_queue(queue)?;
        desc.validate()?;
        check_image_support(vulkan.device(), desc.image_type)?;
        let image = Arc::new(VulkanImage::new(vulkan, desc, Arc::clone(&self.minify))?);
        if desc.initial_data().is_some() && image.wants_auto_mips() {
            image.generate_mip_map_chain(queue)?;
        }
        Ok(image)
    }

    fn add_program(&self, input: ProgramInput<'_>) -> ComputeResult<Arc<dyn Program>> {
        let program = build_program(self.devices.devices(), &self.natives, &input, &self.match_options)?;
        Ok(Arc::new(program))
    }
}

// =============================================================================
// Queue
// =============================================================================

/// One native queue plus the command pools of the threads submitting to it.
pub struct VulkanQueue {
    device: Device,
    pools: CommandPoolManager<VulkanCommandBackend>,
    completion: Arc<CompletionPool>,
    label: Mutex<String>,
}

impl VulkanQueue {
    fn new(device: Device, native: Arc<VulkanDevice>, completion: Arc<CompletionPool>, options: PoolOptions) -> Self {
        let index = native.next_queue_index();
        let backend = Arc::new(VulkanCommandBackend::new(native, index));
        let pools = CommandPoolManager::new(backend, Some(Arc::clone(&completion)), options);
        Self { device, pools, completion, label: Mutex::new(String::new()) }
    }

    pub(crate) fn native(&self) -> &Arc<VulkanDevice> {
        self.pools.backend().device()
    }

    fn label(&self) -> MutexGuard<'_, String> {
        self.label.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records with `record` and submits blocking; host reads see the results afterwards.
    pub(crate) fn run_commands(
        &self,
        name: &str,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer) -> ComputeResult<()>,
    ) -> ComputeResult<()> {
        let handle = self.pools.make_command_buffer(name, false)?;
        let device = &self.native().device;
        let cmd = handle.buffer();
        global_barrier(device, cmd);
        record(device, cmd)?;
        host_barrier(device, cmd);
        self.pools.submit(handle, SubmitRequest { blocking: true, ..Default::default() })
    }

    /// Command buffers currently taken over every submitting thread.
    pub fn command_buffers_in_use(&self) -> usize {
        self.pools.command_buffers_in_use()
    }

    /// Records one dispatch of `function` into `handle`, preceded by a global barrier.
    ///
    /// The descriptor set is freed once the command buffer completed.
    fn record_dispatch(
        &self,
        handle: &CommandBufferHandle<VulkanCommandBackend>,
        function: &dyn Function,
        global_size: UVec3,
        local_size: UVec3,
        args: &[KernelArg<'_>],
        label: Option<&str>,
    ) -> ComputeResult<()> {
        let function = function
            .as_any()
            .downcast_ref::<VulkanFunction>()
            .ok_or_else(|| ComputeError::InvalidArgument(format!("{} is not a Vulkan function", function.name())))?;
        let kernel = function
            .entries
            .get(&self.device.id)
            .ok_or_else(|| ComputeError::FunctionNotFound(format!("{} on {}", function.name, self.device.id)))?;
        check_args(&kernel.info, args)?;
        let local = effective_local_size(&kernel.info, &self.device, local_size);
        let groups = group_count(global_size, local);
        let pipeline = kernel.pipeline(local)?;
        let push = kernel.layout.push_constants(args);
        let set = kernel.bind_args(args)?;

        let device = &self.native().device;
        let cmd = handle.buffer();
        trace!(
            kernel = %function.name,
            label = label.unwrap_or(""),
            queue = %self.label(),
            groups = ?groups,
            local = ?local,
            "Vulkan dispatch"
        );
        global_barrier(device, cmd);
        #[allow(unsafe_code)]
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
            if let Some((_, set)) = set {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    kernel.pipeline_layout,
                    0,
                    &[set],
                    &[],
                );
            }
            if !push.is_empty() {
                device.cmd_push_constants(cmd, kernel.pipeline_layout, vk::ShaderStageFlags::COMPUTE, 0, &push);
            }
            device.cmd_dispatch(cmd, groups.x, groups.y, groups.z);
        };
        if let Some((pool, set)) = set {
            let kernel = Arc::clone(kernel);
            handle.add_completion_handler(Box::new(move || kernel.free_set(pool, set)));
        }
        Ok(())
    }
}

/// Wait and signal fences of one submission, split into timeline semaphores
/// the GPU handles and host fences handled around the submit.
struct SplitFences<'a> {
    vulkan_waits: Vec<FenceWait<'a>>,
    vulkan_signals: Vec<FenceWait<'a>>,
    host_signals: Vec<FenceWait<'a>>,
}

impl<'a> SplitFences<'a> {
    /// Splits the fences and waits on the host ones.
    fn new(submit: &SubmitParams<'a>) -> ComputeResult<Self> {
        let (vulkan_waits, host_waits): (Vec<_>, Vec<_>) = submit.wait_fences.iter().copied().partition(is_vulkan_fence);
        let (vulkan_signals, host_signals): (Vec<_>, Vec<_>) =
            submit.signal_fences.iter().copied().partition(is_vulkan_fence);
        for wait in &host_waits {
            wait.fence.wait(wait.values.signaled, None)?;
        }
        Ok(Self { vulkan_waits, vulkan_signals, host_signals })
    }

    /// A host signal has to wait for the GPU work.
    fn has_host_signals(&self) -> bool {
        !self.host_signals.is_empty()
    }

    fn request(&self, completion: Option<CompletionHandler>, blocking: bool) -> SubmitRequest<'_> {
        SubmitRequest { completion, blocking, wait_fences: &self.vulkan_waits, signal_fences: &self.vulkan_signals }
    }

    fn signal_host(&self) -> ComputeResult<()> {
        for signal in &self.host_signals {
            signal.fence.signal(signal.values.signaled)?;
        }
        Ok(())
    }
}

fn is_vulkan_fence(wait: &FenceWait<'_>) -> bool {
    wait.fence.as_any().is::<VulkanFence>()
}

impl AsAny for VulkanQueue {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Queue for VulkanQueue {
    fn device(&self) -> &Device {
        &self.device
    }

    fn finish(&self) -> ComputeResult<()> {
        let backend = self.pools.backend();
        let device = &backend.device().device;
        backend.device().with_queue(backend.queue_index(), |queue| {
            #[allow(unsafe_code)]
            let result = unsafe { device.queue_wait_idle(queue) };
            result.map_err(vk_error("vkQueueWaitIdle"))
        })?;
        if !self.completion.wait_idle(FINISH_TIMEOUT) {
            return Err(ComputeError::Timeout("Vulkan completion handlers did not finish".into()));
        }
        Ok(())
    }

    fn execute(&self, function: &dyn Function, params: &LaunchParams<'_>) -> ComputeResult<()> {
        let submit = &params.submit;
        let fences = SplitFences::new(submit)?;
        let name = submit.debug_label.unwrap_or(function.name());
        let handle = self.pools.make_command_buffer(name, false)?;
        self.record_dispatch(&handle, function, params.global_size, params.local_size, params.args, submit.debug_label)?;
        let blocking = submit.blocking || fences.has_host_signals();
        if blocking {
            host_barrier(&self.native().device, handle.buffer());
        }
        self.pools.submit(handle, fences.request(None, blocking))?;
        fences.signal_host()
    }

    /// Records the range into one command buffer. The completion handler goes
    /// to the completion pool along with the submission when it is non-blocking.
    fn execute_indirect(
        &self,
        pipeline: &IndirectCommandPipeline,
        params: &SubmitParams<'_>,
        range: Option<Range<usize>>,
        completion: Option<CompletionHandler>,
    ) -> ComputeResult<()> {
        let range = pipeline.resolve_range(range)?;
        if range.is_empty() {
            if let Some(completion) = completion {
                completion();
            }
            return Ok(());
        }
        let commands = range.map(|index| pipeline.command(index)).collect::<ComputeResult<Vec<_>>>()?;
        let fences = SplitFences::new(params)?;
        let blocking = params.blocking || fences.has_host_signals();
        let name = params.debug_label.unwrap_or(pipeline.label());
        let last = commands.len() - 1;
        self.pools.record_and_submit(
            name,
            commands.into_iter().enumerate(),
            |handle, (index, command)| {
                let args = command.kernel_args();
                self.record_dispatch(
                    handle,
                    command.function.as_ref(),
                    command.global_size,
                    command.local_size,
                    &args,
                    Some(name),
                )?;
                if blocking && index == last {
                    host_barrier(&self.native().device, handle.buffer());
                }
                Ok(())
            },
            fences.request(completion, blocking),
        )?;
        fences.signal_host()
    }

    fn set_debug_label(&self, label: &str) {
        *self.label() = label.to_string();
    }
}

// =============================================================================
// Fence
// =============================================================================

/// Timeline semaphore.
pub struct VulkanFence {
    device: Arc<VulkanDevice>,
    semaphore: vk::Semaphore,
    next: AtomicU64,
}

impl VulkanFence {
    pub(crate) fn new(device: Arc<VulkanDevice>, exportable: bool) -> ComputeResult<Self> {
        if exportable && device.external_semaphore_fd.is_none() {
            return Err(ComputeError::Unsupported("device cannot export semaphores".into()));
        }
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let mut export = vk::ExportSemaphoreCreateInfo::default().handle_types(EXTERNAL_SEMAPHORE_HANDLE);
        let mut info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        if exportable {
            info = info.push_next(&mut export);
        }
        #[allow(unsafe_code)]
        let semaphore = unsafe { device.device.create_semaphore(&info, None) }.map_err(vk_error("vkCreateSemaphore"))?;
        Ok(Self { device, semaphore, next: AtomicU64::new(0) })
    }

    pub(crate) fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Exports the semaphore as a file descriptor; the importer owns it.
    pub(crate) fn export_fd(&self) -> ComputeResult<i32> {
        let loader = self
            .device
            .external_semaphore_fd
            .as_ref()
            .ok_or_else(|| ComputeError::Unsupported("device cannot export semaphores".into()))?;
        let info = vk::SemaphoreGetFdInfoKHR::default()
            .semaphore(self.semaphore)
            .handle_type(EXTERNAL_SEMAPHORE_HANDLE);
        #[allow(unsafe_code)]
        let fd = unsafe { loader.get_semaphore_fd(&info) };
        fd.map_err(vk_error("vkGetSemaphoreFdKHR"))
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        #[allow(unsafe_code)]
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, None)
        };
    }
}

impl AsAny for VulkanFence {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[allow(unsafe_code)]
impl Fence for VulkanFence {
    fn next_signal_value(&self) -> FenceValues {
        let unsignaled = self.next.fetch_add(1, Ordering::SeqCst);
        FenceValues { unsignaled, signaled: unsignaled + 1 }
    }

    fn completed_value(&self) -> ComputeResult<u64> {
        unsafe { self.device.device.get_semaphore_counter_value(self.semaphore) }
            .map_err(vk_error("vkGetSemaphoreCounterValue"))
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> ComputeResult<bool> {
        let semaphores = [self.semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        let nanos = timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX));
        match unsafe { self.device.device.wait_semaphores(&info, nanos) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(vk_error("vkWaitSemaphores")(e)),
        }
    }

    fn signal(&self, value: u64) -> ComputeResult<()> {
        // the counter never moves backwards
        if self.completed_value()? >= value {
            return Ok(());
        }
        let info = vk::SemaphoreSignalInfo::default().semaphore(self.semaphore).value(value);
        unsafe { self.device.device.signal_semaphore(&info) }.map_err(vk_error("vkSignalSemaphore"))
    }
}

// =============================================================================
// Buffer
// =============================================================================

/// Device-local buffer; host transfers go through staging buffers.
pub struct VulkanBuffer {
    device: DeviceId,
    native: Arc<VulkanDevice>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    flags: MemoryFlag,
    mappings: MappingTable,
}

impl VulkanBuffer {
    fn new(queue: &VulkanQueue, desc: BufferDesc<'_>) -> ComputeResult<Self> {
        let native = Arc::clone(queue.native());
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;
        let (buffer, memory) = create_buffer(&native, desc.size, usage, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        let buffer = Self {
            device: queue.device().id,
            native,
            buffer,
            memory,
            size: desc.size,
            flags: desc.flags,
            mappings: MappingTable::new(),
        };
        if let Some(init) = desc.initial_data() {
            buffer.upload(queue, init, 0)?;
        }
        trace!(size = desc.size, "Vulkan buffer allocated");
        Ok(buffer)
    }

    pub(crate) fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    fn download(&self, queue: &VulkanQueue, dst: &mut [u8], offset: u64) -> ComputeResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let staging = Staging::new(&self.native, dst.len() as u64)?;
        let region = [vk::BufferCopy { src_offset: offset, dst_offset: 0, size: dst.len() as u64 }];
        queue.run_commands("buffer download", |device, cmd| {
            #[allow(unsafe_code)]
            unsafe {
                device.cmd_copy_buffer(cmd, self.buffer, staging.buffer, &region)
            };
            Ok(())
        })?;
        dst.copy_from_slice(&staging.bytes()[..dst.len()]);
        Ok(())
    }

    fn upload(&self, queue: &VulkanQueue, src: &[u8], offset: u64) -> ComputeResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        let mut staging = Staging::new(&self.native, src.len() as u64)?;
        staging.bytes_mut()[..src.len()].copy_from_slice(src);
        let region = [vk::BufferCopy { src_offset: 0, dst_offset: offset, size: src.len() as u64 }];
        queue.run_commands("buffer upload", |device, cmd| {
            #[allow(unsafe_code)]
            unsafe {
                device.cmd_copy_buffer(cmd, staging.buffer, self.buffer, &region)
            };
            Ok(())
        })
    }
}

/// 32-bit word repeating `pattern`, if it is 1, 2 or 4 bytes long.
pub fn fill_word(pattern: &[u8]) -> Option<u32> {
    match *pattern {
        [a] => Some(u32::from_ne_bytes([a, a, a, a])),
        [a, b] => Some(u32::from_ne_bytes([a, b, a, b])),
        [a, b, c, d] => Some(u32::from_ne_bytes([a, b, c, d])),
        _ => None,
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        let device = &self.native.device;
        #[allow(unsafe_code)]
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

impl AsAny for VulkanBuffer {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Buffer for VulkanBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn flags(&self) -> MemoryFlag {
        self.flags
    }

    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn read(&self, queue: &dyn Queue, dst: &mut [u8], offset: u64) -> ComputeResult<()> {
        check_range(self.size, offset, dst.len() as u64)?;
        self.download(vulkan_queue(queue)?, dst, offset)
    }

    fn write(&self, queue: &dyn Queue, src: &[u8], offset: u64) -> ComputeResult<()> {
        check_range(self.size, offset, src.len() as u64)?;
        self.upload(vulkan_queue(queue)?, src, offset)
    }

    fn copy(&self, queue: &dyn Queue, src: &dyn Buffer, size: u64, src_offset: u64, dst_offset: u64) -> ComputeResult<()> {
        let src = src
            .as_any()
            .downcast_ref::<VulkanBuffer>()
            .ok_or_else(|| ComputeError::InvalidArgument("copy source is not a Vulkan buffer".into()))?;
        if src.device != self.device {
            return Err(ComputeError::Unsupported(format!("copy from {} to {}", src.device, self.device)));
        }
        let size = if size == 0 { src.size.saturating_sub(src_offset) } else { size };
        check_range(src.size, src_offset, size)?;
        check_range(self.size, dst_offset, size)?;
        if size == 0 {
            return Ok(());
        }
        let region = [vk::BufferCopy { src_offset, dst_offset, size }];
        vulkan_queue(queue)?.run_commands("buffer copy", |device, cmd| {
            #[allow(unsafe_code)]
            unsafe {
                device.cmd_copy_buffer(cmd, src.buffer, self.buffer, &region)
            };
            Ok(())
        })
    }

    fn fill(&self, queue: &dyn Queue, pattern: &[u8], offset: u64, size: u64) -> ComputeResult<()> {
        if pattern.is_empty() || size % pattern.len() as u64 != 0 {
            return Err(ComputeError::InvalidArgument(format!(
                "fill size {size} is not a multiple of the {} byte pattern",
                pattern.len()
            )));
        }
        check_range(self.size, offset, size)?;
        let queue = vulkan_queue(queue)?;
        match fill_word(pattern) {
            Some(word) if offset % 4 == 0 && size % 4 == 0 => queue.run_commands("buffer fill", |device, cmd| {
                #[allow(unsafe_code)]
                unsafe {
                    device.cmd_fill_buffer(cmd, self.buffer, offset, size, word)
                };
                Ok(())
            }),
            _ => {
                let expanded: Vec<u8> = pattern.iter().copied().cycle().take(size as usize).collect();
                self.upload(queue, &expanded, offset)
            }
        }
    }

    fn map(&self, queue: &dyn Queue, flags: MapFlag, offset: u64, size: u64) -> ComputeResult<Mapping> {
        let vulkan = vulkan_queue(queue)?;
        if flags.contains(MapFlag::BLOCK) {
            vulkan.finish()?;
        }
        self.mappings.begin(self.size, self.flags, flags, offset, size, |offset, staging| {
            self.download(vulkan, staging, offset)
        })
    }

    fn unmap(&self, queue: &dyn Queue, mapping: Mapping) -> ComputeResult<()> {
        let vulkan = vulkan_queue(queue)?;
        self.mappings.end(mapping, |offset, staging| self.upload(vulkan, staging, offset))?;
        Ok(())
    }
}

// =============================================================================
// Argument layout
// =============================================================================

/// Where one kernel argument goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSlot {
    Buffer { binding: u32 },
    /// `storage` binds the per-level views at `binding`; `sampled` binds a
    /// combined image sampler at `binding` (read-only) or `binding + 1`.
    Image { binding: u32, storage: bool, sampled: bool },
    Push { offset: u32, size: u32 },
    /// Work-group memory, declared by the shader itself.
    Unbound,
}

/// Descriptor bindings and push-constant offsets of one kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgLayout {
    pub slots: Vec<ArgSlot>,
    /// Push-constant block size, a multiple of 4.
    pub push_size: u32,
}

/// std430 alignment of a by-value argument.
fn push_alignment(size: u32) -> u32 {
    match size {
        0..=4 => 4,
        5..=8 => 8,
        _ => 16,
    }
}

impl ArgLayout {
    pub fn new(info: &FunctionInfo) -> ComputeResult<Self> {
        let mut slots = Vec::with_capacity(info.args.len());
        let mut push_size = 0u32;
        for (index, arg) in info.args.iter().enumerate() {
            let binding = 2 * index as u32;
            let slot = match arg.address_space {
                AddressSpace::Image => ArgSlot::Image {
                    binding,
                    storage: arg.image_access != ArgImageAccess::Read,
                    sampled: matches!(arg.image_access, ArgImageAccess::Read | ArgImageAccess::ReadWrite),
                },
                AddressSpace::Constant if arg.size > 0 => {
                    let offset = push_size.next_multiple_of(push_alignment(arg.size));
                    push_size = offset + arg.size;
                    ArgSlot::Push { offset, size: arg.size }
                }
                AddressSpace::Local => ArgSlot::Unbound,
                AddressSpace::Global | AddressSpace::Constant => ArgSlot::Buffer { binding },
                AddressSpace::ArgBuffer => {
                    return Err(ComputeError::Unsupported(format!(
                        "{}: argument buffers are not supported on Vulkan",
                        info.name
                    )));
                }
            };
            slots.push(slot);
        }
        Ok(Self { slots, push_size: push_size.next_multiple_of(4) })
    }

    /// Descriptor set layout bindings.
    pub fn bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        let binding = |index: u32, ty: vk::DescriptorType, count: usize| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(index)
                .descriptor_type(ty)
                .descriptor_count(count as u32)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
        };
        let mut bindings = Vec::new();
        for slot in &self.slots {
            match *slot {
                ArgSlot::Buffer { binding: b } => bindings.push(binding(b, vk::DescriptorType::STORAGE_BUFFER, 1)),
                ArgSlot::Image { binding: b, storage, sampled } => {
                    if storage {
                        bindings.push(binding(b, vk::DescriptorType::STORAGE_IMAGE, MAX_MIP_VIEWS));
                    }
                    if sampled {
                        let b = if storage { b + 1 } else { b };
                        bindings.push(binding(b, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1));
                    }
                }
                ArgSlot::Push { .. } | ArgSlot::Unbound => {}
            }
        }
        bindings
    }

    /// Pool sizes for `sets` descriptor sets of this layout.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut counts: Vec<(vk::DescriptorType, u32)> = Vec::new();
        for binding in self.bindings() {
            match counts.iter_mut().find(|(ty, _)| *ty == binding.descriptor_type) {
                Some((_, count)) => *count += binding.descriptor_count,
                None => counts.push((binding.descriptor_type, binding.descriptor_count)),
            }
        }
        counts
            .into_iter()
            .map(|(ty, count)| vk::DescriptorPoolSize { ty, descriptor_count: count * sets })
            .collect()
    }

    /// Push-constant block of the by-value arguments.
    pub fn push_constants(&self, args: &[KernelArg<'_>]) -> Vec<u8> {
        let mut block = vec![0u8; self.push_size as usize];
        for (slot, arg) in self.slots.iter().zip(args) {
            if let (ArgSlot::Push { offset, size }, KernelArg::Bytes(bytes)) = (slot, arg) {
                let len = bytes.len().min(*size as usize);
                let start = *offset as usize;
                block[start..start + len].copy_from_slice(&bytes[..len]);
            }
        }
        block
    }
}

// =============================================================================
// Program / function
// =============================================================================

pub(crate) struct ShaderModule {
    device: Arc<VulkanDevice>,
    module: vk::ShaderModule,
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        #[allow(unsafe_code)]
        unsafe {
            self.device.device.destroy_shader_module(self.module, None)
        };
    }
}

/// Kernels of one module on one device.
pub(crate) struct VulkanModule {
    kernels: HashMap<String, Arc<VulkanKernel>>,
}

/// Creates the shader module and the layouts of every kernel in `binary`.
pub(crate) fn load_module(device: &Arc<VulkanDevice>, binary: &SelectedBinary) -> ComputeResult<VulkanModule> {
    let code = ash::util::read_spv(&mut Cursor::new(&binary.data))
        .map_err(|e| ComputeError::ProgramBuild(format!("invalid SPIR-V: {e}")))?;
    let info = vk::ShaderModuleCreateInfo::default().code(&code);
    #[allow(unsafe_code)]
    let module = unsafe { device.device.create_shader_module(&info, None) }
        .map_err(|e| ComputeError::ProgramBuild(format!("vkCreateShaderModule: {e}")))?;
    let module = Arc::new(ShaderModule { device: Arc::clone(device), module });

    let mut kernels = HashMap::new();
    for info in binary.functions.iter().filter(|f| f.is_kernel()) {
        match VulkanKernel::new(device, &module, info) {
            Ok(kernel) => {
                kernels.insert(info.name.clone(), Arc::new(kernel));
            }
            Err(e) => warn!(function = %info.name, error = %e, "skipping Vulkan kernel"),
        }
    }
    Ok(VulkanModule { kernels })
}

/// One kernel on one device: layouts, cached pipelines and descriptor pools.
pub(crate) struct VulkanKernel {
    device: Arc<VulkanDevice>,
    info: FunctionInfo,
    entry: CString,
    module: Arc<ShaderModule>,
    layout: ArgLayout,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipelines: Mutex<HashMap<[u32; 3], vk::Pipeline>>,
    descriptor_pools: Mutex<Vec<vk::DescriptorPool>>,
}

impl VulkanKernel {
    fn new(device: &Arc<VulkanDevice>, module: &Arc<ShaderModule>, info: &FunctionInfo) -> ComputeResult<Self> {
        let layout = ArgLayout::new(info)?;
        if layout.push_size > device.limits.max_push_constants_size {
            return Err(ComputeError::ProgramBuild(format!(
                "{}: {} bytes of arguments exceed the {} byte push-constant limit",
                info.name, layout.push_size, device.limits.max_push_constants_size
            )));
        }
        let entry = CString::new(info.name.as_str())
            .map_err(|_| ComputeError::ProgramBuild(format!("{}: name contains NUL", info.name)))?;

        let bindings = layout.bindings();
        let set_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let vk_device = &device.device;
        #[allow(unsafe_code)]
        let set_layout = unsafe { vk_device.create_descriptor_set_layout(&set_info, None) }
            .map_err(vk_error("vkCreateDescriptorSetLayout"))?;
        let set_layouts = [set_layout];
        let ranges = [vk::PushConstantRange { stage_flags: vk::ShaderStageFlags::COMPUTE, offset: 0, size: layout.push_size }];
        let mut pipeline_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        if layout.push_size > 0 {
            pipeline_info = pipeline_info.push_constant_ranges(&ranges);
        }
        #[allow(unsafe_code)]
        let pipeline_layout = match unsafe { vk_device.create_pipeline_layout(&pipeline_info, None) } {
            Ok(pipeline_layout) => pipeline_layout,
            Err(e) => {
                unsafe { vk_device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(vk_error("vkCreatePipelineLayout")(e));
            }
        };

        Ok(Self {
            device: Arc::clone(device),
            info: info.clone(),
            entry,
            module: Arc::clone(module),
            layout,
            set_layout,
            pipeline_layout,
            pipelines: Mutex::new(HashMap::new()),
            descriptor_pools: Mutex::new(Vec::new()),
        })
    }

    /// Pipeline specialized for `local`, created on first use.
    fn pipeline(&self, local: UVec3) -> ComputeResult<vk::Pipeline> {
        let key = local.to_array();
        let mut pipelines = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&pipeline) = pipelines.get(&key) {
            return Ok(pipeline);
        }
        let entries = [0u32, 1, 2].map(|id| vk::SpecializationMapEntry { constant_id: id, offset: id * 4, size: 4 });
        let data: &[u8] = bytemuck::cast_slice(&key);
        let specialization = vk::SpecializationInfo::default().map_entries(&entries).data(data);
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.module.module)
            .name(self.entry.as_c_str())
            .specialization_info(&specialization);
        let info = [vk::ComputePipelineCreateInfo::default().stage(stage).layout(self.pipeline_layout)];
        #[allow(unsafe_code)]
        let created = unsafe { self.device.device.create_compute_pipelines(vk::PipelineCache::null(), &info, None) }
            .map_err(|(_, e)| ComputeError::ProgramBuild(format!("{}: vkCreateComputePipelines: {e}", self.info.name)))?;
        let pipeline = created
            .first()
            .copied()
            .ok_or_else(|| ComputeError::ProgramBuild(format!("{}: no pipeline created", self.info.name)))?;
        debug!(kernel = %self.info.name, local = ?local, "compute pipeline created");
        pipelines.insert(key, pipeline);
        Ok(pipeline)
    }

    fn allocate_set(&self) -> ComputeResult<(vk::DescriptorPool, vk::DescriptorSet)> {
        let device = &self.device.device;
        let layouts = [self.set_layout];
        let mut pools = self.descriptor_pools.lock().unwrap_or_else(|e| e.into_inner());
        for &pool in pools.iter().rev() {
            let info = vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(&layouts);
            #[allow(unsafe_code)]
            let allocated = unsafe { device.allocate_descriptor_sets(&info) };
            match allocated {
                Ok(sets) => {
                    if let Some(&set) = sets.first() {
                        return Ok((pool, set));
                    }
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {}
                Err(e) => return Err(vk_error("vkAllocateDescriptorSets")(e)),
            }
        }

        let sizes = self.layout.pool_sizes(DESCRIPTOR_SETS_PER_POOL);
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(DESCRIPTOR_SETS_PER_POOL)
            .pool_sizes(&sizes);
        #[allow(unsafe_code)]
        let pool = unsafe { device.create_descriptor_pool(&info, None) }.map_err(vk_error("vkCreateDescriptorPool"))?;
        pools.push(pool);
        trace!(kernel = %self.info.name, pools = pools.len(), "descriptor pool added");
        let info = vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(&layouts);
        #[allow(unsafe_code)]
        let sets = unsafe { device.allocate_descriptor_sets(&info) }.map_err(vk_error("vkAllocateDescriptorSets"))?;
        let set = sets
            .first()
            .copied()
            .ok_or_else(|| ComputeError::OperationFailed("no descriptor set allocated".into()))?;
        Ok((pool, set))
    }

    fn free_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        let _pools = self.descriptor_pools.lock().unwrap_or_else(|e| e.into_inner());
        #[allow(unsafe_code)]
        let result = unsafe { self.device.device.free_descriptor_sets(pool, &[set]) };
        if let Err(e) = result {
            warn!(kernel = %self.info.name, error = %e, "vkFreeDescriptorSets failed");
        }
    }

    /// Allocates and writes the descriptor set of `args`; `None` if the
    /// kernel has no descriptors.
    fn bind_args(&self, args: &[KernelArg<'_>]) -> ComputeResult<Option<(vk::DescriptorPool, vk::DescriptorSet)>> {
        if self.layout.bindings().is_empty() {
            return Ok(None);
        }
        let mut buffers: Vec<(u32, [vk::DescriptorBufferInfo; 1])> = Vec::new();
        let mut images: Vec<(u32, vk::DescriptorType, Vec<vk::DescriptorImageInfo>)> = Vec::new();
        for (index, (slot, arg)) in self.layout.slots.iter().zip(args).enumerate() {
            match (*slot, arg) {
                (ArgSlot::Buffer { binding }, KernelArg::Buffer(buffer)) => {
                    let buffer = buffer.as_any().downcast_ref::<VulkanBuffer>().ok_or_else(|| {
                        ComputeError::InvalidArgument(format!("argument {index} is not a Vulkan buffer"))
                    })?;
                    let info = vk::DescriptorBufferInfo::default().buffer(buffer.buffer).offset(0).range(vk::WHOLE_SIZE);
                    buffers.push((binding, [info]));
                }
                (ArgSlot::Image { binding, storage, sampled }, KernelArg::Image(image)) => {
                    let image = image.as_any().downcast_ref::<VulkanImage>().ok_or_else(|| {
                        ComputeError::InvalidArgument(format!("argument {index} is not a Vulkan image"))
                    })?;
                    if storage {
                        let views = image.storage_views().ok_or_else(|| {
                            ComputeError::InvalidArgument(format!("argument {index}: image has no writable levels"))
                        })?;
                        let infos = views
                            .iter()
                            .map(|&view| {
                                vk::DescriptorImageInfo::default().image_view(view).image_layout(vk::ImageLayout::GENERAL)
                            })
                            .collect();
                        images.push((binding, vk::DescriptorType::STORAGE_IMAGE, infos));
                    }
                    if sampled {
                        let info = vk::DescriptorImageInfo::default()
                            .sampler(image.sampler(SamplerDesc::default())?)
                            .image_view(image.sampled_view())
                            .image_layout(vk::ImageLayout::GENERAL);
                        let binding = if storage { binding + 1 } else { binding };
                        images.push((binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vec![info]));
                    }
                }
                (ArgSlot::Push { .. } | ArgSlot::Unbound, _) => {}
                _ => {
                    return Err(ComputeError::InvalidArgument(format!(
                        "{}: argument {index} does not match its declaration",
                        self.info.name
                    )));
                }
            }
        }

        let (pool, set) = self.allocate_set()?;
        let mut writes = Vec::with_capacity(buffers.len() + images.len());
        for (binding, info) in &buffers {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(info),
            );
        }
        for (binding, ty, infos) in &images {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .image_info(infos),
            );
        }
        #[allow(unsafe_code)]
        unsafe {
            self.device.device.update_descriptor_sets(&writes, &[])
        };
        Ok(Some((pool, set)))
    }
}

impl Drop for VulkanKernel {
    fn drop(&mut self) {
        let device = &self.device.device;
        let pipelines = self.pipelines.get_mut().unwrap_or_else(|e| e.into_inner());
        let pools = self.descriptor_pools.get_mut().unwrap_or_else(|e| e.into_inner());
        #[allow(unsafe_code)]
        unsafe {
            for (_, pipeline) in pipelines.drain() {
                device.destroy_pipeline(pipeline, None);
            }
            for pool in pools.drain(..) {
                device.destroy_descriptor_pool(pool, None);
            }
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// A kernel with one entry point per device.
pub struct VulkanFunction {
    name: String,
    entries: HashMap<DeviceId, Arc<VulkanKernel>>,
}

impl AsAny for VulkanFunction {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Function for VulkanFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self, device: DeviceId) -> Option<&FunctionInfo> {
        self.entries.get(&device).map(|k| &k.info)
    }

    fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.entries.keys().copied().collect();
        devices.sort();
        devices
    }
}

/// Per-device shader modules plus the kernels found in them.
pub struct VulkanProgram {
    functions: HashMap<String, Arc<VulkanFunction>>,
    devices: Vec<DeviceId>,
}

impl VulkanProgram {
    fn new(programs: HashMap<DeviceId, DeviceProgram<VulkanModule>>) -> Self {
        let mut devices: Vec<DeviceId> = programs.keys().copied().collect();
        devices.sort();
        let mut functions: HashMap<String, VulkanFunction> = HashMap::new();
        for (device, program) in programs {
            for (name, kernel) in program.module.kernels {
                functions
                    .entry(name.clone())
                    .or_insert_with(|| VulkanFunction { name, entries: HashMap::new() })
                    .entries
                    .insert(device, kernel);
            }
        }
        let functions = functions.into_iter().map(|(name, f)| (name, Arc::new(f))).collect();
        Self { functions, devices }
    }
}

impl AsAny for VulkanProgram {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Program for VulkanProgram {
    fn function(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.functions.get(name).map(|f| Arc::clone(f) as Arc<dyn Function>)
    }

    fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    fn devices(&self) -> Vec<DeviceId> {
        self.devices.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ArgImageType, ArgInfo};

    use crate::backend::minify::minify_function_info;

    #[test]
    fn test_arg_layout_minify() {
        let info = minify_function_info(kiln_core::ImageType::RGBA8UI_NORM).unwrap();
        let layout = ArgLayout::new(&info).unwrap();
        assert_eq!(
            layout.slots,
            vec![
                ArgSlot::Image { binding: 0, storage: true, sampled: true },
                ArgSlot::Push { offset: 0, size: 12 },
                ArgSlot::Push { offset: 16, size: 12 },
                ArgSlot::Push { offset: 28, size: 4 },
                ArgSlot::Push { offset: 32, size: 4 },
            ]
        );
        assert_eq!(layout.push_size, 36);
        let bindings = layout.bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].descriptor_count, MAX_MIP_VIEWS as u32);
        assert_eq!(bindings[1].binding, 1);
        assert_eq!(bindings[1].descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
    }

    #[test]
    fn test_arg_layout_buffers_and_values() {
        let info = FunctionInfo::kernel(
            "saxpy",
            vec![
                ArgInfo::buffer(),
                ArgInfo::buffer(),
                ArgInfo::value(4),
                ArgInfo::value(8),
                ArgInfo::image(ArgImageType::Image2D, ArgImageAccess::Read),
            ],
        );
        let layout = ArgLayout::new(&info).unwrap();
        assert_eq!(layout.slots[1], ArgSlot::Buffer { binding: 2 });
        assert_eq!(layout.slots[3], ArgSlot::Push { offset: 8, size: 8 });
        assert_eq!(layout.slots[4], ArgSlot::Image { binding: 8, storage: false, sampled: true });
        assert_eq!(layout.push_size, 16);

        let sizes = layout.pool_sizes(64);
        let storage = sizes.iter().find(|s| s.ty == vk::DescriptorType::STORAGE_BUFFER).unwrap();
        assert_eq!(storage.descriptor_count, 128);

        let (a, b) = (2.5f32, 7u64);
        let x = [0u8; 0];
        let push = layout.push_constants(&[
            KernelArg::Bytes(&x),
            KernelArg::Bytes(&x),
            KernelArg::value(&a),
            KernelArg::value(&b),
            KernelArg::Bytes(&x),
        ]);
        assert_eq!(&push[0..4], &a.to_ne_bytes());
        assert_eq!(&push[8..16], &b.to_ne_bytes());
    }

    #[test]
    fn test_arg_buffer_rejected() {
        let arg = ArgInfo { address_space: AddressSpace::ArgBuffer, ..Default::default() };
        let info = FunctionInfo::kernel("k", vec![arg]);
        assert!(matches!(ArgLayout::new(&info), Err(ComputeError::Unsupported(_))));
    }

    #[test]
    fn test_find_memory_type() {
        let mut memory = vk::PhysicalDeviceMemoryProperties { memory_type_count: 3, ..Default::default() };
        memory.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        memory.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        memory.memory_types[2].property_flags =
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(find_memory_type(&memory, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(0));
        assert_eq!(find_memory_type(&memory, 0b111, host), Some(1));
        assert_eq!(find_memory_type(&memory, 0b100, host), Some(2));
        assert_eq!(find_memory_type(&memory, 0b001, host), None);
    }

    #[test]
    fn test_versions_and_kinds() {
        assert_eq!(spirv_version_for(ApiVersion::new(1, 3)), ApiVersion::new(1, 6));
        assert_eq!(spirv_version_for(ApiVersion::new(1, 2)), ApiVersion::new(1, 5));
        assert_eq!(device_kind(vk::PhysicalDeviceType::INTEGRATED_GPU), DeviceKind::Gpu);
        assert_eq!(device_kind(vk::PhysicalDeviceType::CPU), DeviceKind::Cpu);
        assert_eq!(device_kind(vk::PhysicalDeviceType::OTHER), DeviceKind::Accelerator);
        // 550.54.14
        let nvidia = (550 << 22) | (54 << 14) | (14 << 6);
        assert_eq!(driver_version_string(Vendor::Nvidia, nvidia), "550.54.14");
        assert_eq!(driver_version_string(Vendor::Amd, vk::make_api_version(0, 2, 0, 279)), "2.0.279");
    }

    #[test]
    fn test_fill_word() {
        assert_eq!(fill_word(&[7]), Some(0x0707_0707));
        assert_eq!(fill_word(&[1, 2]), Some(u32::from_ne_bytes([1, 2, 1, 2])));
        assert_eq!(fill_word(&[1, 2, 3]), None);
    }

    #[test]
    fn test_buffer_round_trip() {
        if !VulkanContext::is_available() {
            return;
        }
        let ctx = VulkanContext::new(&Config::default()).unwrap();
        let device = ctx.fastest_device().unwrap().clone();
        assert!(device.vulkan().is_some());
        let queue = ctx.create_queue(&device).unwrap();
        let q = queue.as_ref();

        let buffer = ctx.create_buffer(q, BufferDesc::new(64)).unwrap();
        buffer.fill(q, &[1, 2, 3, 4], 0, 64).unwrap();
        buffer.fill(q, &[9, 9, 9], 1, 6).unwrap();
        let mut out = [0u8; 8];
        buffer.read(q, &mut out, 0).unwrap();
        assert_eq!(out, [1, 9, 9, 9, 9, 9, 9, 4]);

        let fence = ctx.create_fence(&device).unwrap();
        let values = fence.next_signal_value();
        assert!(!fence.wait(values.signaled, Some(Duration::from_millis(1))).unwrap());
        fence.signal(values.signaled).unwrap();
        assert!(fence.wait(values.signaled, None).unwrap());
        assert_eq!(fence.completed_value().unwrap(), 1);
    }
}
