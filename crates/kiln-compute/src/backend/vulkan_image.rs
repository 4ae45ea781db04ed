//! Vulkan images.
//!
//! Images live in the `GENERAL` layout for their whole life, so kernels,
//! transfers and foreign APIs never need a layout transition after creation.
//! Writable images carry one storage view per level; kernels index the
//! level array directly. Samplers are created lazily per sampler state.

use std::sync::{Arc, Mutex};

use ash::vk;
use glam::UVec4;
use kiln_core::{DeviceId, ImageType, MapFlag, MemoryFlag};
use tracing::{trace, warn};

use super::context::AsAny;
use super::format::{ChannelFormat, NativeFormat, native_format, native_layer};
use super::memory::{Mapping, MappingTable};
use super::minify::{MinifyLatch, run_minify};
use super::queue::Queue;
use super::resource::{Image, ImageDesc, image_offset};
use super::sampler::{AddressMode, CompareFunction, CoordMode, FilterMode, SamplerDesc, SamplerTable};
use super::vulkan_backend::{
    EXTERNAL_MEMORY_HANDLE, Staging, VulkanDevice, VulkanProgram, VulkanQueue, allocate_memory, vk_error, vulkan_queue,
};
use crate::{ComputeError, ComputeResult};

/// Storage views per image; covers a 65536 texel edge.
pub(crate) const MAX_MIP_VIEWS: usize = 17;

// =============================================================================
// Formats
// =============================================================================

/// Vulkan format of `t`, `None` if there is none.
pub fn vk_format(t: ImageType) -> Option<vk::Format> {
    use vk::Format as F;

    let native = native_format(t)?;
    if t.is_depth() {
        return depth_format(t, &native);
    }
    let pick = |formats: [F; 4]| formats.get(native.channels.checked_sub(1)? as usize).copied();
    let norm = native.normalized;
    match native.channel {
        ChannelFormat::U8 if native.srgb => match native.channels {
            4 => Some(F::R8G8B8A8_SRGB),
            3 => Some(F::R8G8B8_SRGB),
            _ => None,
        },
        ChannelFormat::U8 if norm => pick([F::R8_UNORM, F::R8G8_UNORM, F::R8G8B8_UNORM, F::R8G8B8A8_UNORM]),
        ChannelFormat::U8 => pick([F::R8_UINT, F::R8G8_UINT, F::R8G8B8_UINT, F::R8G8B8A8_UINT]),
        ChannelFormat::S8 if norm => pick([F::R8_SNORM, F::R8G8_SNORM, F::R8G8B8_SNORM, F::R8G8B8A8_SNORM]),
        ChannelFormat::S8 => pick([F::R8_SINT, F::R8G8_SINT, F::R8G8B8_SINT, F::R8G8B8A8_SINT]),
        ChannelFormat::U16 if norm => {
            pick([F::R16_UNORM, F::R16G16_UNORM, F::R16G16B16_UNORM, F::R16G16B16A16_UNORM])
        }
        ChannelFormat::U16 => pick([F::R16_UINT, F::R16G16_UINT, F::R16G16B16_UINT, F::R16G16B16A16_UINT]),
        ChannelFormat::S16 if norm => {
            pick([F::R16_SNORM, F::R16G16_SNORM, F::R16G16B16_SNORM, F::R16G16B16A16_SNORM])
        }
        ChannelFormat::S16 => pick([F::R16_SINT, F::R16G16_SINT, F::R16G16B16_SINT, F::R16G16B16A16_SINT]),
        ChannelFormat::U32 => pick([F::R32_UINT, F::R32G32_UINT, F::R32G32B32_UINT, F::R32G32B32A32_UINT]),
        ChannelFormat::S32 => pick([F::R32_SINT, F::R32G32_SINT, F::R32G32B32_SINT, F::R32G32B32A32_SINT]),
        ChannelFormat::F16 => {
            pick([F::R16_SFLOAT, F::R16G16_SFLOAT, F::R16G16B16_SFLOAT, F::R16G16B16A16_SFLOAT])
        }
        ChannelFormat::F32 => {
            pick([F::R32_SFLOAT, F::R32G32_SFLOAT, F::R32G32B32_SFLOAT, F::R32G32B32A32_SFLOAT])
        }
        ChannelFormat::Bc1 => Some(if native.srgb { F::BC1_RGBA_SRGB_BLOCK } else { F::BC1_RGBA_UNORM_BLOCK }),
        ChannelFormat::Bc2 => Some(if native.srgb { F::BC2_SRGB_BLOCK } else { F::BC2_UNORM_BLOCK }),
        ChannelFormat::Bc3 => Some(if native.srgb { F::BC3_SRGB_BLOCK } else { F::BC3_UNORM_BLOCK }),
        ChannelFormat::Bc4U => Some(F::BC4_UNORM_BLOCK),
        ChannelFormat::Bc4S => Some(F::BC4_SNORM_BLOCK),
        ChannelFormat::Bc5U => Some(F::BC5_UNORM_BLOCK),
        ChannelFormat::Bc5S => Some(F::BC5_SNORM_BLOCK),
        ChannelFormat::Bc6hU => Some(F::BC6H_UFLOAT_BLOCK),
        ChannelFormat::Bc6hS => Some(F::BC6H_SFLOAT_BLOCK),
        ChannelFormat::Bc7 => Some(if native.srgb { F::BC7_SRGB_BLOCK } else { F::BC7_UNORM_BLOCK }),
    }
}

fn depth_format(t: ImageType, native: &NativeFormat) -> Option<vk::Format> {
    // stencil cannot be copied together with depth in one region
    if t.is_stencil() {
        return None;
    }
    match native.channel {
        ChannelFormat::F32 => Some(vk::Format::D32_SFLOAT),
        ChannelFormat::U16 => Some(vk::Format::D16_UNORM),
        ChannelFormat::U32 => Some(vk::Format::X8_D24_UNORM_PACK32),
        _ => None,
    }
}

/// True for formats whose reads must not be filtered.
fn is_integer_format(native: &NativeFormat) -> bool {
    !native.channel.is_compressed()
        && !native.normalized
        && !matches!(native.channel, ChannelFormat::F16 | ChannelFormat::F32)
}

fn aspect_mask(t: ImageType) -> vk::ImageAspectFlags {
    if t.is_depth() { vk::ImageAspectFlags::DEPTH } else { vk::ImageAspectFlags::COLOR }
}

fn image_kind(t: ImageType) -> vk::ImageType {
    match t.dim_count() {
        1 => vk::ImageType::TYPE_1D,
        3 => vk::ImageType::TYPE_3D,
        _ => vk::ImageType::TYPE_2D,
    }
}

/// View type for sampled reads; storage views see cubes as 2D arrays.
pub fn view_type(t: ImageType, storage: bool) -> vk::ImageViewType {
    match (t.dim_count(), t.is_cube(), t.is_array()) {
        (_, true, _) if storage => vk::ImageViewType::TYPE_2D_ARRAY,
        (_, true, false) => vk::ImageViewType::CUBE,
        (_, true, true) => vk::ImageViewType::CUBE_ARRAY,
        (1, _, false) => vk::ImageViewType::TYPE_1D,
        (1, _, true) => vk::ImageViewType::TYPE_1D_ARRAY,
        (3, _, _) => vk::ImageViewType::TYPE_3D,
        (_, _, true) => vk::ImageViewType::TYPE_2D_ARRAY,
        _ => vk::ImageViewType::TYPE_2D,
    }
}

/// Whether kernels may bind `t` as a storage image.
fn needs_storage(t: ImageType, flags: MemoryFlag) -> bool {
    let auto_mips = flags.contains(MemoryFlag::GENERATE_MIP_MAPS) && t.is_mipmapped();
    (t.is_writable() || auto_mips)
        && !t.is_compressed()
        && !t.is_depth()
        && !t.is_msaa()
        && !t.has(ImageType::FLAG_SRGB)
}

fn sample_count(t: ImageType) -> vk::SampleCountFlags {
    match t.sample_count() {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

fn compare_op(compare: CompareFunction) -> vk::CompareOp {
    match compare {
        CompareFunction::Never => vk::CompareOp::NEVER,
        CompareFunction::Less => vk::CompareOp::LESS,
        CompareFunction::Equal => vk::CompareOp::EQUAL,
        CompareFunction::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunction::Greater => vk::CompareOp::GREATER,
        CompareFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunction::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareFunction::Always => vk::CompareOp::ALWAYS,
    }
}

/// Sampler create info for `desc`.
///
/// Pixel coordinates force the restrictions Vulkan puts on unnormalized
/// samplers: clamped addressing, one filter, no mips, no anisotropy, no compare.
fn sampler_info(
    desc: SamplerDesc,
    native: &NativeFormat,
    levels: u32,
    max_anisotropy: f32,
) -> vk::SamplerCreateInfo<'static> {
    let linear = desc.filter == FilterMode::Linear && !is_integer_format(native);
    let filter = if linear { vk::Filter::LINEAR } else { vk::Filter::NEAREST };
    let info = vk::SamplerCreateInfo::default().mag_filter(filter).min_filter(filter);
    if desc.coord_mode == CoordMode::Pixel {
        let clamp = match desc.address_mode {
            AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
            _ => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        };
        return info
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(clamp)
            .address_mode_v(clamp)
            .address_mode_w(clamp)
            .unnormalized_coordinates(true);
    }
    let address = address_mode(desc.address_mode);
    let anisotropy = (desc.max_anisotropy() as f32).min(max_anisotropy);
    info.mipmap_mode(if linear { vk::SamplerMipmapMode::LINEAR } else { vk::SamplerMipmapMode::NEAREST })
        .address_mode_u(address)
        .address_mode_v(address)
        .address_mode_w(address)
        .anisotropy_enable(desc.anisotropy_log2 > 0 && anisotropy > 1.0)
        .max_anisotropy(anisotropy.max(1.0))
        .compare_enable(desc.is_depth_compare())
        .compare_op(compare_op(desc.compare))
        .min_lod(0.0)
        .max_lod(levels.saturating_sub(1) as f32)
        .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
}

// =============================================================================
// Image
// =============================================================================

/// Image handle plus its memory; outlives the image object while foreign
/// APIs still reference the allocation.
pub(crate) struct ImageBacking {
    device: Arc<VulkanDevice>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    size: u64,
}

impl ImageBacking {
    pub(crate) fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for ImageBacking {
    fn drop(&mut self) {
        let device = &self.device.device;
        #[allow(unsafe_code)]
        unsafe {
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Device-local image in the `GENERAL` layout.
pub struct VulkanImage {
    device: DeviceId,
    native_device: Arc<VulkanDevice>,
    image_type: ImageType,
    dim: UVec4,
    flags: MemoryFlag,
    native: NativeFormat,
    format: vk::Format,
    uuid: Option<[u8; 16]>,
    image: vk::Image,
    backing: Arc<ImageBacking>,
    sampled_view: vk::ImageView,
    storage_views: Vec<vk::ImageView>,
    samplers: SamplerTable<vk::Sampler>,
    // held while a sampler is created
    sampler_lock: Mutex<()>,
    mappings: MappingTable,
    minify: Arc<MinifyLatch<VulkanProgram>>,
}

impl VulkanImage {
    pub(crate) fn new(
        queue: &VulkanQueue,
        desc: ImageDesc<'_>,
        minify: Arc<MinifyLatch<VulkanProgram>>,
    ) -> ComputeResult<Self> {
        let t = desc.image_type;
        let native = native_format(t).ok_or_else(|| ComputeError::ImageCreation(format!("no format for {t:?}")))?;
        let format = vk_format(t).ok_or_else(|| ComputeError::ImageCreation(format!("no Vulkan format for {t:?}")))?;
        let levels = t.mip_level_count(desc.dim);
        if levels as usize > MAX_MIP_VIEWS {
            return Err(ComputeError::ImageCreation(format!("{levels} levels exceed {MAX_MIP_VIEWS}")));
        }
        let shared = desc.flags.contains(MemoryFlag::VULKAN_SHARING);
        let device = Arc::clone(queue.native());
        if shared && !device.supports_external() {
            return Err(ComputeError::Unsupported("device cannot export image memory".into()));
        }

        let storage = needs_storage(t, desc.flags);
        let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        if storage {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        let size = t.mip_level_dim(desc.dim, 0).max(glam::UVec3::ONE);
        let layers = if t.dim_count() == 3 { 1 } else { t.layer_count(desc.dim).max(1) };
        let create_flags = if t.is_cube() { vk::ImageCreateFlags::CUBE_COMPATIBLE } else { vk::ImageCreateFlags::empty() };
        let mut external = vk::ExternalMemoryImageCreateInfo::default().handle_types(EXTERNAL_MEMORY_HANDLE);
        let mut info = vk::ImageCreateInfo::default()
            .flags(create_flags)
            .image_type(image_kind(t))
            .format(format)
            .extent(vk::Extent3D { width: size.x, height: size.y, depth: size.z })
            .mip_levels(levels)
            .array_layers(layers)
            .samples(sample_count(t))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if shared {
            info = info.push_next(&mut external);
        }

        let vk_device = &device.device;
        #[allow(unsafe_code)]
        let image = unsafe { vk_device.create_image(&info, None) }
            .map_err(|e| ComputeError::ImageCreation(format!("vkCreateImage: {e}")))?;
        #[allow(unsafe_code)]
        let requirements = unsafe { vk_device.get_image_memory_requirements(image) };
        let dedicated = shared.then_some(image);
        let memory = match allocate_memory(&device, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL, dedicated, shared)
        {
            Ok(memory) => memory,
            Err(e) => {
                #[allow(unsafe_code)]
                unsafe {
                    vk_device.destroy_image(image, None)
                };
                return Err(ComputeError::ImageCreation(e.to_string()));
            }
        };
        let backing = Arc::new(ImageBacking { device: Arc::clone(&device), image, memory, size: requirements.size });

        // from here on Drop releases whatever was created
        let mut vulkan = Self {
            device: queue.device().id,
            native_device: Arc::clone(&device),
            image_type: t,
            dim: desc.dim,
            flags: desc.flags,
            native,
            format,
            uuid: queue.device().uuid,
            image,
            backing,
            sampled_view: vk::ImageView::null(),
            storage_views: Vec::new(),
            samplers: SamplerTable::new(),
            sampler_lock: Mutex::new(()),
            mappings: MappingTable::new(),
            minify,
        };
        #[allow(unsafe_code)]
        let bound = unsafe { vk_device.bind_image_memory(image, memory, 0) };
        bound.map_err(vk_error("vkBindImageMemory"))?;
        vulkan.create_views(levels, layers, storage)?;
        vulkan.transition_to_general(queue, levels, layers)?;
        if let Some(init) = desc.initial_data() {
            vulkan.upload_all(queue, init)?;
        }
        trace!(image_type = ?t, dim = ?desc.dim, levels, ?format, shared, "Vulkan image created");
        Ok(vulkan)
    }

    fn create_view(
        &self,
        view_type: vk::ImageViewType,
        base_level: u32,
        levels: u32,
        layers: u32,
    ) -> ComputeResult<vk::ImageView> {
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(aspect_mask(self.image_type))
            .base_mip_level(base_level)
            .level_count(levels)
            .base_array_layer(0)
            .layer_count(layers);
        let info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(view_type)
            .format(self.format)
            .subresource_range(range);
        #[allow(unsafe_code)]
        let view = unsafe { self.native_device.device.create_image_view(&info, None) };
        view.map_err(vk_error("vkCreateImageView"))
    }

    fn create_views(&mut self, levels: u32, layers: u32, storage: bool) -> ComputeResult<()> {
        let t = self.image_type;
        self.sampled_view = self.create_view(view_type(t, false), 0, levels, layers)?;
        if storage {
            for level in 0..levels {
                let view = self.create_view(view_type(t, true), level, 1, layers)?;
                self.storage_views.push(view);
            }
        }
        Ok(())
    }

    fn transition_to_general(&self, queue: &VulkanQueue, levels: u32, layers: u32) -> ComputeResult<()> {
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(aspect_mask(self.image_type))
            .level_count(levels)
            .layer_count(layers);
        let barrier = [vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::NONE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .image(self.image)
            .subresource_range(range)];
        queue.run_commands("image layout", |device, cmd| {
            let dependency = vk::DependencyInfo::default().image_memory_barriers(&barrier);
            #[allow(unsafe_code)]
            unsafe {
                device.cmd_pipeline_barrier2(cmd, &dependency)
            };
            Ok(())
        })
    }

    /// One copy region per `(layer, level)` at its offset in host layout.
    fn regions(&self) -> Vec<vk::BufferImageCopy> {
        let (t, dim) = (self.image_type, self.dim);
        let levels = self.mip_level_count();
        let layers = if t.dim_count() == 3 { 1 } else { self.layer_count() };
        let mut regions = Vec::with_capacity((levels * layers) as usize);
        for layer in 0..layers {
            for level in 0..levels {
                let size = t.mip_level_dim(dim, level).max(glam::UVec3::ONE);
                let subresource = vk::ImageSubresourceLayers::default()
                    .aspect_mask(aspect_mask(t))
                    .mip_level(level)
                    .base_array_layer(native_layer(t, layer))
                    .layer_count(1);
                regions.push(
                    vk::BufferImageCopy::default()
                        .buffer_offset(image_offset(t, dim, layer, level))
                        .image_subresource(subresource)
                        .image_extent(vk::Extent3D { width: size.x, height: size.y, depth: size.z }),
                );
            }
        }
        regions
    }

    fn upload_all(&self, queue: &VulkanQueue, data: &[u8]) -> ComputeResult<()> {
        let mut staging = Staging::new(&self.native_device, data.len() as u64)?;
        staging.bytes_mut()[..data.len()].copy_from_slice(data);
        let regions = self.regions();
        queue.run_commands("image upload", |device, cmd| {
            #[allow(unsafe_code)]
            unsafe {
                device.cmd_copy_buffer_to_image(cmd, staging.buffer, self.image, vk::ImageLayout::GENERAL, &regions)
            };
            Ok(())
        })
    }

    fn download_all(&self, queue: &VulkanQueue, data: &mut [u8]) -> ComputeResult<()> {
        let staging = Staging::new(&self.native_device, data.len() as u64)?;
        let regions = self.regions();
        queue.run_commands("image download", |device, cmd| {
            #[allow(unsafe_code)]
            unsafe {
                device.cmd_copy_image_to_buffer(cmd, self.image, vk::ImageLayout::GENERAL, staging.buffer, &regions)
            };
            Ok(())
        })?;
        data.copy_from_slice(&staging.bytes()[..data.len()]);
        Ok(())
    }

    pub(crate) fn wants_auto_mips(&self) -> bool {
        self.flags.contains(MemoryFlag::GENERATE_MIP_MAPS) && self.image_type.is_mipmapped()
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Size of the backing allocation.
    pub fn allocation_size(&self) -> u64 {
        self.backing.size
    }

    /// UUID of the device holding the memory.
    pub(crate) fn device_uuid(&self) -> Option<[u8; 16]> {
        self.uuid
    }

    pub(crate) fn backing(&self) -> &Arc<ImageBacking> {
        &self.backing
    }

    pub(crate) fn sampled_view(&self) -> vk::ImageView {
        self.sampled_view
    }

    /// Per-level storage views, padded with the last level; `None` if the
    /// image is not writable.
    pub(crate) fn storage_views(&self) -> Option<[vk::ImageView; MAX_MIP_VIEWS]> {
        let last = *self.storage_views.last()?;
        let mut views = [last; MAX_MIP_VIEWS];
        for (slot, view) in views.iter_mut().zip(&self.storage_views) {
            *slot = *view;
        }
        Some(views)
    }

    /// Sampler for `desc`, created on first use.
    pub(crate) fn sampler(&self, desc: SamplerDesc) -> ComputeResult<vk::Sampler> {
        let levels = self.mip_level_count();
        let native = self.native;
        let limits = &self.native_device.limits;
        let _guard = self.sampler_lock.lock().unwrap_or_else(|e| e.into_inner());
        let sampler = self.samplers.get_or_create(desc, |desc| {
            let info = sampler_info(desc, &native, levels, limits.max_sampler_anisotropy);
            #[allow(unsafe_code)]
            let sampler = unsafe { self.native_device.device.create_sampler(&info, None) };
            sampler.map_err(vk_error("vkCreateSampler"))
        })?;
        Ok(*sampler)
    }

    /// Number of samplers created so far.
    pub fn sampler_count(&self) -> usize {
        self.samplers.created()
    }

    /// Exports the memory as a file descriptor; the importer owns it.
    pub(crate) fn export_fd(&self) -> ComputeResult<i32> {
        if !self.flags.contains(MemoryFlag::VULKAN_SHARING) {
            return Err(ComputeError::InvalidArgument("image was not created with VULKAN_SHARING".into()));
        }
        let loader = self
            .native_device
            .external_memory_fd
            .as_ref()
            .ok_or_else(|| ComputeError::Unsupported("device cannot export memory".into()))?;
        let info = vk::MemoryGetFdInfoKHR::default().memory(self.backing.memory).handle_type(EXTERNAL_MEMORY_HANDLE);
        #[allow(unsafe_code)]
        let fd = unsafe { loader.get_memory_fd(&info) };
        fd.map_err(vk_error("vkGetMemoryFdKHR"))
    }
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        let device = &self.native_device.device;
        #[allow(unsafe_code)]
        unsafe {
            for (_, sampler) in self.samplers.iter() {
                device.destroy_sampler(*sampler, None);
            }
            for view in self.storage_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            if self.sampled_view != vk::ImageView::null() {
                device.destroy_image_view(self.sampled_view, None);
            }
        }
    }
}

impl AsAny for VulkanImage {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Image for VulkanImage {
    fn image_type(&self) -> ImageType {
        self.image_type
    }

    fn dim(&self) -> UVec4 {
        self.dim
    }

    fn flags(&self) -> MemoryFlag {
        self.flags
    }

    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn zero(&self, queue: &dyn Queue) -> ComputeResult<()> {
        let zeros = vec![0u8; self.data_size() as usize];
        self.upload_all(vulkan_queue(queue)?, &zeros)
    }

    fn map(&self, queue: &dyn Queue, flags: MapFlag) -> ComputeResult<Mapping> {
        let vulkan = vulkan_queue(queue)?;
        if flags.contains(MapFlag::BLOCK) {
            vulkan.finish()?;
        }
        self.mappings.begin(self.data_size(), self.flags, flags, 0, 0, |_, staging| self.download_all(vulkan, staging))
    }

    fn unmap(&self, queue: &dyn Queue, mapping: Mapping) -> ComputeResult<()> {
        let vulkan = vulkan_queue(queue)?;
        let entry = self.mappings.end(mapping, |_, staging| self.upload_all(vulkan, staging))?;
        if entry.flags.writes_back() && self.wants_auto_mips() {
            self.generate_mip_map_chain(queue)?;
        }
        Ok(())
    }

    fn generate_mip_map_chain(&self, queue: &dyn Queue) -> ComputeResult<()> {
        if !self.image_type.is_mipmapped() || self.mip_level_count() <= 1 {
            return Ok(());
        }
        if self.storage_views.is_empty() {
            warn!(image_type = ?self.image_type, "mip generation on an image without storage views");
            return Err(ComputeError::Unsupported(format!("{:?} has no writable levels", self.image_type)));
        }
        let program = self.minify.wait()?;
        run_minify(queue, self, program.as_ref(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_format() {
        assert_eq!(vk_format(ImageType::RGBA8UI_NORM), Some(vk::Format::R8G8B8A8_UNORM));
        let uint = ImageType::RGBA8UI_NORM.without(ImageType::FLAG_NORMALIZED);
        assert_eq!(vk_format(uint), Some(vk::Format::R8G8B8A8_UINT));
        assert_eq!(vk_format(uint.with_channel_count(2)), Some(vk::Format::R8G8_UINT));
        assert_eq!(vk_format(ImageType::RGBA32F), Some(vk::Format::R32G32B32A32_SFLOAT));
        assert_eq!(vk_format(ImageType::D32F), Some(vk::Format::D32_SFLOAT));
    }

    #[test]
    fn test_view_types() {
        let cube = ImageType::IMAGE_CUBE | ImageType::CHANNELS_4 | ImageType::FORMAT_8 | ImageType::UINT;
        assert_eq!(view_type(cube, false), vk::ImageViewType::CUBE);
        assert_eq!(view_type(cube, true), vk::ImageViewType::TYPE_2D_ARRAY);
        let array = ImageType::RGBA8UI_NORM | ImageType::FLAG_ARRAY;
        assert_eq!(view_type(array, false), vk::ImageViewType::TYPE_2D_ARRAY);
        assert_eq!(view_type(ImageType::RGBA8UI_NORM, true), vk::ImageViewType::TYPE_2D);
    }

    #[test]
    fn test_storage_usage() {
        let mipped = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED;
        assert!(needs_storage(mipped, MemoryFlag::GENERATE_MIP_MAPS));
        assert!(!needs_storage(mipped.without(ImageType::WRITE), MemoryFlag::default()));
        assert!(!needs_storage(ImageType::D32F, MemoryFlag::GENERATE_MIP_MAPS));
    }

    #[test]
    fn test_sampler_info() {
        let float = native_format(ImageType::RGBA32F).unwrap();
        let desc = SamplerDesc { filter: FilterMode::Linear, anisotropy_log2: 3, ..Default::default() };
        let info = sampler_info(desc, &float, 5, 16.0);
        assert_eq!(info.mag_filter, vk::Filter::LINEAR);
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert_eq!(info.max_anisotropy, 8.0);
        assert_eq!(info.max_lod, 4.0);

        let uint = native_format(ImageType::RGBA8UI_NORM.without(ImageType::FLAG_NORMALIZED)).unwrap();
        let pixel = SamplerDesc {
            filter: FilterMode::Linear,
            coord_mode: CoordMode::Pixel,
            address_mode: AddressMode::Repeat,
            ..Default::default()
        };
        let info = sampler_info(pixel, &uint, 5, 16.0);
        assert_eq!(info.mag_filter, vk::Filter::NEAREST);
        assert_eq!(info.unnormalized_coordinates, vk::TRUE);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.max_lod, 0.0);

        let compare = SamplerDesc { compare: CompareFunction::Less, ..Default::default() };
        let info = sampler_info(compare, &float, 1, 1.0);
        assert_eq!(info.compare_enable, vk::TRUE);
        assert_eq!(info.compare_op, vk::CompareOp::LESS);
    }
}
