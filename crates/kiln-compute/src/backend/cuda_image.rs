//! CUDA images.
//!
//! Storage is a CUDA array (single level) or a mipmapped array whose levels
//! are resolved once. Writable images get one surface object per level,
//! readable ones a texture object per sampler state. Kernels receive the
//! device address of an [`ImageDescriptor`] that carries both.
//!
//! Host data is layer-major with each layer's full mip chain; every
//! `(layer, level)` pair is one 3D copy into the matching array slice.

use std::any::Any;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use cudarc::driver::{CudaContext, sys};
use glam::UVec4;
use kiln_core::{DeviceId, ImageType, MapFlag, MemoryFlag};
use tracing::{trace, warn};

use super::context::AsAny;
use super::cuda_backend::{CudaProgram, CudaQueue, bind, check, cuda_queue, sync};
use super::format::{ChannelFormat, NativeFormat, copy_extent, native_depth, native_format, native_layer};
use super::memory::Mapping;
use super::memory::MappingTable;
use super::minify::{MinifyLatch, run_minify};
use super::queue::Queue;
use super::resource::{Image, ImageDesc, image_level_size, image_offset};
use super::sampler::{AddressMode, CompareFunction, CoordMode, FilterMode, SAMPLER_COUNT, SamplerDesc, SamplerTable};
use crate::{ComputeError, ComputeResult};

/// Surfaces per image; covers a 65536 texel edge.
pub const MAX_MIP_SURFACES: usize = 17;

const ARRAY_LAYERED: u32 = 0x01;
const ARRAY_SURFACE_LDST: u32 = 0x02;
const ARRAY_CUBEMAP: u32 = 0x04;

const TEXTURE_READ_AS_INTEGER: u32 = 0x01;
const TEXTURE_NORMALIZED_COORDINATES: u32 = 0x02;
const TEXTURE_SRGB: u32 = 0x10;

/// `ImageDescriptor::flags` bits.
pub const DESCRIPTOR_READABLE: u32 = 0x1;
pub const DESCRIPTOR_WRITABLE: u32 = 0x2;
pub const DESCRIPTOR_CUBE: u32 = 0x4;
pub const DESCRIPTOR_ARRAY: u32 = 0x8;

/// What a kernel sees for an image argument (pointed to by the argument).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ImageDescriptor {
    /// Device address of [`SAMPLER_COUNT`] texture objects, 0 if not readable.
    pub samplers: u64,
    /// Surface object per level, 0 past the last level.
    pub surfaces: [u64; MAX_MIP_SURFACES],
    pub level_count: u32,
    pub channels: u32,
    pub channel_bytes: u32,
    pub flags: u32,
}

enum Storage {
    Array(sys::CUarray),
    Mipmapped(sys::CUmipmappedArray),
}

enum Transfer<'a> {
    Upload(&'a [u8]),
    Download(&'a mut [u8]),
}

fn array_format(channel: ChannelFormat, srgb: bool) -> sys::CUarray_format {
    use sys::CUarray_format as F;
    match (channel, srgb) {
        (ChannelFormat::U8, _) => F::CU_AD_FORMAT_UNSIGNED_INT8,
        (ChannelFormat::S8, _) => F::CU_AD_FORMAT_SIGNED_INT8,
        (ChannelFormat::U16, _) => F::CU_AD_FORMAT_UNSIGNED_INT16,
        (ChannelFormat::S16, _) => F::CU_AD_FORMAT_SIGNED_INT16,
        (ChannelFormat::U32, _) => F::CU_AD_FORMAT_UNSIGNED_INT32,
        (ChannelFormat::S32, _) => F::CU_AD_FORMAT_SIGNED_INT32,
        (ChannelFormat::F16, _) => F::CU_AD_FORMAT_HALF,
        (ChannelFormat::F32, _) => F::CU_AD_FORMAT_FLOAT,
        (ChannelFormat::Bc1, false) => F::CU_AD_FORMAT_BC1_UNORM,
        (ChannelFormat::Bc1, true) => F::CU_AD_FORMAT_BC1_UNORM_SRGB,
        (ChannelFormat::Bc2, false) => F::CU_AD_FORMAT_BC2_UNORM,
        (ChannelFormat::Bc2, true) => F::CU_AD_FORMAT_BC2_UNORM_SRGB,
        (ChannelFormat::Bc3, false) => F::CU_AD_FORMAT_BC3_UNORM,
        (ChannelFormat::Bc3, true) => F::CU_AD_FORMAT_BC3_UNORM_SRGB,
        (ChannelFormat::Bc4U, _) => F::CU_AD_FORMAT_BC4_UNORM,
        (ChannelFormat::Bc4S, _) => F::CU_AD_FORMAT_BC4_SNORM,
        (ChannelFormat::Bc5U, _) => F::CU_AD_FORMAT_BC5_UNORM,
        (ChannelFormat::Bc5S, _) => F::CU_AD_FORMAT_BC5_SNORM,
        (ChannelFormat::Bc6hU, _) => F::CU_AD_FORMAT_BC6H_UF16,
        (ChannelFormat::Bc6hS, _) => F::CU_AD_FORMAT_BC6H_SF16,
        (ChannelFormat::Bc7, false) => F::CU_AD_FORMAT_BC7_UNORM,
        (ChannelFormat::Bc7, true) => F::CU_AD_FORMAT_BC7_UNORM_SRGB,
    }
}

/// Channel count CUDA wants in the array descriptor.
fn array_channels(native: &NativeFormat) -> u32 {
    match native.channel {
        ChannelFormat::Bc1 | ChannelFormat::Bc2 | ChannelFormat::Bc3 | ChannelFormat::Bc7 => 4,
        ChannelFormat::Bc4U | ChannelFormat::Bc4S => 1,
        ChannelFormat::Bc5U | ChannelFormat::Bc5S => 2,
        ChannelFormat::Bc6hU | ChannelFormat::Bc6hS => 3,
        _ => native.channels,
    }
}

/// Array descriptor for `t` at `dim`.
pub(crate) fn array_descriptor(
    t: ImageType,
    dim: UVec4,
    surfaces: bool,
) -> ComputeResult<(sys::CUDA_ARRAY3D_DESCRIPTOR, NativeFormat)> {
    let native = native_format(t).ok_or_else(|| ComputeError::ImageCreation(format!("no CUDA format for {t:?}")))?;
    if !native.channel.is_compressed() && native.channels == 3 {
        return Err(ComputeError::ImageCreation("CUDA has no 3-channel array formats".into()));
    }
    if t.is_msaa() {
        return Err(ComputeError::Unsupported("multi-sampled CUDA images".into()));
    }
    let mut flags = 0;
    if t.is_array() {
        flags |= ARRAY_LAYERED;
    }
    if t.is_cube() {
        flags |= ARRAY_CUBEMAP;
    }
    if surfaces && !native.channel.is_compressed() {
        flags |= ARRAY_SURFACE_LDST;
    }
    let desc = sys::CUDA_ARRAY3D_DESCRIPTOR {
        Width: dim.x.max(1) as usize,
        Height: if t.dim_count() >= 2 { dim.y.max(1) as usize } else { 0 },
        Depth: native_depth(t, dim) as usize,
        Format: array_format(native.channel, native.srgb),
        NumChannels: array_channels(&native),
        Flags: flags,
    };
    Ok((desc, native))
}

fn texture_descriptor(desc: SamplerDesc, native: &NativeFormat, levels: u32) -> sys::CUDA_TEXTURE_DESC {
    let integer = !native.channel.is_compressed()
        && !native.normalized
        && !matches!(native.channel, ChannelFormat::F16 | ChannelFormat::F32);
    let address = match desc.address_mode {
        AddressMode::ClampToEdge => sys::CUaddress_mode::CU_TR_ADDRESS_MODE_CLAMP,
        AddressMode::Repeat => sys::CUaddress_mode::CU_TR_ADDRESS_MODE_WRAP,
        AddressMode::MirrorRepeat => sys::CUaddress_mode::CU_TR_ADDRESS_MODE_MIRROR,
        AddressMode::ClampToBorder => sys::CUaddress_mode::CU_TR_ADDRESS_MODE_BORDER,
    };
    // integer reads cannot be filtered
    let filter = match desc.filter {
        FilterMode::Linear if !integer => sys::CUfilter_mode::CU_TR_FILTER_MODE_LINEAR,
        _ => sys::CUfilter_mode::CU_TR_FILTER_MODE_POINT,
    };
    let mut flags = 0;
    if integer {
        flags |= TEXTURE_READ_AS_INTEGER;
    }
    if desc.coord_mode == CoordMode::Normalized {
        flags |= TEXTURE_NORMALIZED_COORDINATES;
    }
    if native.srgb {
        flags |= TEXTURE_SRGB;
    }
    sys::CUDA_TEXTURE_DESC {
        addressMode: [address; 3],
        filterMode: filter,
        flags,
        maxAnisotropy: if desc.anisotropy_log2 > 0 { desc.max_anisotropy() } else { 0 },
        mipmapFilterMode: filter,
        mipmapLevelBias: 0.0,
        minMipmapLevelClamp: 0.0,
        maxMipmapLevelClamp: levels.saturating_sub(1) as f32,
        borderColor: [0.0; 4],
        reserved: [0; 12],
    }
}

/// The state stored for table `index`: compare is dropped, anisotropy capped at 16x.
fn canonical_sampler(index: usize) -> SamplerDesc {
    let desc = SamplerDesc::from_index(index);
    SamplerDesc { compare: CompareFunction::Never, anisotropy_log2: desc.anisotropy_log2.min(4), ..desc }
}

/// Image backed by a CUDA array or mipmapped array.
pub struct CudaImage {
    device: DeviceId,
    ctx: Arc<CudaContext>,
    image_type: ImageType,
    dim: UVec4,
    flags: MemoryFlag,
    native: NativeFormat,
    storage: Storage,
    levels: Vec<sys::CUarray>,
    surfaces: Vec<sys::CUsurfObject>,
    textures: SamplerTable<sys::CUtexObject>,
    sampler_table: sys::CUdeviceptr,
    descriptor: sys::CUdeviceptr,
    mappings: MappingTable,
    minify: Arc<MinifyLatch<CudaProgram>>,
    /// Foreign memory the storage was mapped from, released after it.
    external: Option<Box<dyn Any + Send + Sync>>,
}

// SAFETY: array handles are only used with the owning context bound.
#[allow(unsafe_code)]
unsafe impl Send for CudaImage {}
#[allow(unsafe_code)]
unsafe impl Sync for CudaImage {}

impl CudaImage {
    pub(crate) fn new(queue: &CudaQueue, desc: ImageDesc<'_>, minify: Arc<MinifyLatch<CudaProgram>>) -> ComputeResult<Self> {
        let t = desc.image_type;
        let surfaces = Self::needs_surfaces(t, desc.flags);
        let (array_desc, native) = array_descriptor(t, desc.dim, surfaces)?;
        let levels = t.mip_level_count(desc.dim);

        let storage = queue.run(|_| {
            if levels > 1 {
                let mut handle: sys::CUmipmappedArray = std::ptr::null_mut();
                #[allow(unsafe_code)]
                let result = unsafe { sys::cuMipmappedArrayCreate(&raw mut handle, &raw const array_desc, levels) };
                check(result, "cuMipmappedArrayCreate").map_err(|e| ComputeError::ImageCreation(e.to_string()))?;
                Ok(Storage::Mipmapped(handle))
            } else {
                let mut handle: sys::CUarray = std::ptr::null_mut();
                #[allow(unsafe_code)]
                let result = unsafe { sys::cuArray3DCreate_v2(&raw mut handle, &raw const array_desc) };
                check(result, "cuArray3DCreate_v2").map_err(|e| ComputeError::ImageCreation(e.to_string()))?;
                Ok(Storage::Array(handle))
            }
        })?;

        let image = Self::assemble(queue, t, desc.dim, desc.flags, native, storage, None, minify)?;
        if let Some(init) = desc.initial_data() {
            image.upload_all(queue, init)?;
        }
        trace!(image_type = ?t, dim = ?desc.dim, levels, "CUDA image created");
        Ok(image)
    }

    /// Wraps a mipmapped array mapped from foreign memory; `external` is
    /// dropped after the array is destroyed.
    #[cfg_attr(not(feature = "vulkan"), allow(dead_code))]
    pub(crate) fn from_mipmapped_array(
        queue: &CudaQueue,
        image_type: ImageType,
        dim: UVec4,
        flags: MemoryFlag,
        handle: sys::CUmipmappedArray,
        external: Box<dyn Any + Send + Sync>,
        minify: Arc<MinifyLatch<CudaProgram>>,
    ) -> ComputeResult<Self> {
        let native = native_format(image_type)
            .ok_or_else(|| ComputeError::ImageCreation(format!("no CUDA format for {image_type:?}")))?;
        Self::assemble(queue, image_type, dim, flags, native, Storage::Mipmapped(handle), Some(external), minify)
    }

    fn needs_surfaces(t: ImageType, flags: MemoryFlag) -> bool {
        !t.is_compressed() && (t.is_writable() || (flags.contains(MemoryFlag::GENERATE_MIP_MAPS) && t.is_mipmapped()))
    }

    /// Resolves levels and creates surfaces, textures and the descriptor.
    /// Anything created before a failure is released by `Drop`.
    #[allow(clippy::too_many_arguments)]
    fn assemble(
        queue: &CudaQueue,
        image_type: ImageType,
        dim: UVec4,
        flags: MemoryFlag,
        native: NativeFormat,
        storage: Storage,
        external: Option<Box<dyn Any + Send + Sync>>,
        minify: Arc<MinifyLatch<CudaProgram>>,
    ) -> ComputeResult<Self> {
        let mut image = Self {
            device: queue.device().id,
            ctx: Arc::clone(queue.context()),
            image_type,
            dim,
            flags,
            native,
            storage,
            levels: Vec::new(),
            surfaces: Vec::new(),
            textures: SamplerTable::new(),
            sampler_table: 0,
            descriptor: 0,
            mappings: MappingTable::new(),
            minify,
            external,
        };
        let level_count = image_type.mip_level_count(dim);
        if level_count as usize > MAX_MIP_SURFACES {
            return Err(ComputeError::ImageCreation(format!("{level_count} levels exceed {MAX_MIP_SURFACES}")));
        }

        queue.run(|stream| {
            image.resolve_levels(level_count)?;
            if Self::needs_surfaces(image_type, flags) {
                image.create_surfaces()?;
            }
            if image_type.is_readable() || Self::needs_surfaces(image_type, flags) {
                image.create_textures(level_count)?;
            }
            image.write_descriptor(stream, level_count)
        })?;
        Ok(image)
    }

    fn resolve_levels(&mut self, level_count: u32) -> ComputeResult<()> {
        match self.storage {
            Storage::Array(array) => self.levels.push(array),
            Storage::Mipmapped(handle) => {
                for level in 0..level_count {
                    let mut array: sys::CUarray = std::ptr::null_mut();
                    #[allow(unsafe_code)]
                    let result = unsafe { sys::cuMipmappedArrayGetLevel(&raw mut array, handle, level) };
                    check(result, "cuMipmappedArrayGetLevel")?;
                    self.levels.push(array);
                }
            }
        }
        Ok(())
    }

    fn create_surfaces(&mut self) -> ComputeResult<()> {
        for &array in &self.levels {
            #[allow(unsafe_code)]
            let surface = unsafe {
                let mut res: sys::CUDA_RESOURCE_DESC = std::mem::zeroed();
                res.resType = sys::CUresourcetype::CU_RESOURCE_TYPE_ARRAY;
                res.res.array.hArray = array;
                let mut surface: sys::CUsurfObject = 0;
                check(sys::cuSurfObjectCreate(&raw mut surface, &raw const res), "cuSurfObjectCreate")?;
                surface
            };
            self.surfaces.push(surface);
        }
        Ok(())
    }

    fn create_textures(&mut self, level_count: u32) -> ComputeResult<()> {
        #[allow(unsafe_code)]
        let res = unsafe {
            let mut res: sys::CUDA_RESOURCE_DESC = std::mem::zeroed();
            match self.storage {
                Storage::Array(array) => {
                    res.resType = sys::CUresourcetype::CU_RESOURCE_TYPE_ARRAY;
                    res.res.array.hArray = array;
                }
                Storage::Mipmapped(handle) => {
                    res.resType = sys::CUresourcetype::CU_RESOURCE_TYPE_MIPMAPPED_ARRAY;
                    res.res.mipmap.hMipmappedArray = handle;
                }
            }
            res
        };
        let native = self.native;
        let mut table = vec![0u64; SAMPLER_COUNT];
        for (index, slot) in table.iter_mut().enumerate() {
            let texture = self.textures.get_or_create(canonical_sampler(index), |desc| {
                let tex_desc = texture_descriptor(desc, &native, level_count);
                let mut texture: sys::CUtexObject = 0;
                #[allow(unsafe_code)]
                let result = unsafe {
                    sys::cuTexObjectCreate(&raw mut texture, &raw const res, &raw const tex_desc, std::ptr::null())
                };
                check(result, "cuTexObjectCreate")?;
                Ok(texture)
            })?;
            *slot = *texture;
        }

        let bytes: &[u8] = bytemuck::cast_slice(&table);
        let mut ptr: sys::CUdeviceptr = 0;
        #[allow(unsafe_code)]
        let result = unsafe { sys::cuMemAlloc_v2(&raw mut ptr, bytes.len()) };
        check(result, "cuMemAlloc_v2")?;
        self.sampler_table = ptr;
        #[allow(unsafe_code)]
        let result = unsafe { sys::cuMemcpyHtoD_v2(ptr, bytes.as_ptr().cast(), bytes.len()) };
        check(result, "cuMemcpyHtoD_v2")
    }

    fn write_descriptor(&mut self, stream: sys::CUstream, level_count: u32) -> ComputeResult<()> {
        let mut surfaces = [0u64; MAX_MIP_SURFACES];
        for (slot, surface) in surfaces.iter_mut().zip(&self.surfaces) {
            *slot = *surface;
        }
        let t = self.image_type;
        let mut flags = 0;
        if self.sampler_table != 0 {
            flags |= DESCRIPTOR_READABLE;
        }
        if !self.surfaces.is_empty() {
            flags |= DESCRIPTOR_WRITABLE;
        }
        if t.is_cube() {
            flags |= DESCRIPTOR_CUBE;
        }
        if t.is_array() {
            flags |= DESCRIPTOR_ARRAY;
        }
        let descriptor = ImageDescriptor {
            samplers: self.sampler_table,
            surfaces,
            level_count,
            channels: array_channels(&self.native),
            channel_bytes: self.native.channel.channel_bytes(),
            flags,
        };

        let bytes = bytemuck::bytes_of(&descriptor);
        let mut ptr: sys::CUdeviceptr = 0;
        #[allow(unsafe_code)]
        let result = unsafe { sys::cuMemAlloc_v2(&raw mut ptr, bytes.len()) };
        check(result, "cuMemAlloc_v2")?;
        self.descriptor = ptr;
        #[allow(unsafe_code)]
        let result = unsafe { sys::cuMemcpyHtoDAsync_v2(ptr, bytes.as_ptr().cast(), bytes.len(), stream) };
        check(result, "cuMemcpyHtoDAsync_v2")?;
        sync(stream)
    }

    /// Device address of the kernel-side descriptor.
    pub fn descriptor_ptr(&self) -> u64 {
        self.descriptor
    }

    /// Number of texture objects created for sampler states.
    pub fn texture_count(&self) -> usize {
        self.textures.created()
    }

    pub(crate) fn wants_auto_mips(&self) -> bool {
        self.flags.contains(MemoryFlag::GENERATE_MIP_MAPS) && self.image_type.is_mipmapped()
    }

    /// Copies one `(layer, level)` slice between host memory and the array.
    fn transfer(&self, stream: sys::CUstream, layer: u32, level: u32, host: Transfer<'_>) -> ComputeResult<()> {
        let t = self.image_type;
        let (row_bytes, rows, slices) = copy_extent(t, self.dim, level);
        let array = *self
            .levels
            .get(level as usize)
            .ok_or_else(|| ComputeError::InvalidArgument(format!("level {level} out of range")))?;
        let z = if t.dim_count() == 3 { 0 } else { native_layer(t, layer) as usize };
        let array_type = sys::CUmemorytype::CU_MEMORYTYPE_ARRAY;
        let host_type = sys::CUmemorytype::CU_MEMORYTYPE_HOST;
        let null = std::ptr::null_mut();

        let copy = match host {
            Transfer::Upload(src) => sys::CUDA_MEMCPY3D {
                srcXInBytes: 0,
                srcY: 0,
                srcZ: 0,
                srcLOD: 0,
                srcMemoryType: host_type,
                srcHost: src.as_ptr().cast(),
                srcDevice: 0,
                srcArray: null.cast(),
                reserved0: null,
                srcPitch: row_bytes as usize,
                srcHeight: rows as usize,
                dstXInBytes: 0,
                dstY: 0,
                dstZ: z,
                dstLOD: 0,
                dstMemoryType: array_type,
                dstHost: null,
                dstDevice: 0,
                dstArray: array,
                reserved1: null,
                dstPitch: 0,
                dstHeight: 0,
                WidthInBytes: row_bytes as usize,
                Height: rows as usize,
                Depth: slices as usize,
            },
            Transfer::Download(dst) => sys::CUDA_MEMCPY3D {
                srcXInBytes: 0,
                srcY: 0,
                srcZ: z,
                srcLOD: 0,
                srcMemoryType: array_type,
                srcHost: std::ptr::null(),
                srcDevice: 0,
                srcArray: array,
                reserved0: null,
                srcPitch: 0,
                srcHeight: 0,
                dstXInBytes: 0,
                dstY: 0,
                dstZ: 0,
                dstLOD: 0,
                dstMemoryType: host_type,
                dstHost: dst.as_mut_ptr().cast(),
                dstDevice: 0,
                dstArray: null.cast(),
                reserved1: null,
                dstPitch: row_bytes as usize,
                dstHeight: rows as usize,
                WidthInBytes: row_bytes as usize,
                Height: rows as usize,
                Depth: slices as usize,
            },
        };
        #[allow(unsafe_code)]
        let result = unsafe { sys::cuMemcpy3DAsync_v2(&raw const copy, stream) };
        check(result, "cuMemcpy3DAsync_v2")
    }

    fn slices(&self) -> impl Iterator<Item = (u32, u32, u64, u64)> + '_ {
        let (t, dim) = (self.image_type, self.dim);
        let levels = self.mip_level_count();
        (0..self.layer_count()).flat_map(move |layer| {
            (0..levels).map(move |level| {
                (layer, level, image_offset(t, dim, layer, level), image_level_size(t, dim, level))
            })
        })
    }

    fn upload_all(&self, queue: &CudaQueue, data: &[u8]) -> ComputeResult<()> {
        queue.run(|stream| {
            for (layer, level, offset, size) in self.slices() {
                let src = &data[offset as usize..(offset + size) as usize];
                self.transfer(stream, layer, level, Transfer::Upload(src))?;
            }
            sync(stream)
        })
    }

    fn download_all(&self, queue: &CudaQueue, data: &mut [u8]) -> ComputeResult<()> {
        queue.run(|stream| {
            for (layer, level, offset, size) in self.slices() {
                let dst = &mut data[offset as usize..(offset + size) as usize];
                self.transfer(stream, layer, level, Transfer::Download(dst))?;
            }
            sync(stream)
        })
    }
}

impl Drop for CudaImage {
    fn drop(&mut self) {
        if bind(&self.ctx).is_err() {
            return;
        }
        #[allow(unsafe_code)]
        unsafe {
            for (_, texture) in self.textures.iter() {
                let _ = sys::cuTexObjectDestroy(*texture);
            }
            for surface in &self.surfaces {
                let _ = sys::cuSurfObjectDestroy(*surface);
            }
            for ptr in [self.sampler_table, self.descriptor] {
                if ptr != 0 {
                    let _ = sys::cuMemFree_v2(ptr);
                }
            }
            let result = match self.storage {
                Storage::Array(array) => sys::cuArrayDestroy(array),
                Storage::Mipmapped(handle) => sys::cuMipmappedArrayDestroy(handle),
            };
            if let Err(e) = check(result, "array destroy") {
                warn!(error = %e, "CUDA image release failed");
            }
        }
        drop(self.external.take());
    }
}

impl AsAny for CudaImage {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Image for CudaImage {
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
        let cuda = cuda_queue(queue)?;
        // level 0 is the largest slice of every layer
        let zeros = vec![0u8; image_level_size(self.image_type, self.dim, 0) as usize];
        cuda.run(|stream| {
            for (layer, level, _, size) in self.slices() {
                self.transfer(stream, layer, level, Transfer::Upload(&zeros[..size as usize]))?;
            }
            sync(stream)
        })
    }

    fn map(&self, queue: &dyn Queue, flags: MapFlag) -> ComputeResult<Mapping> {
        let cuda = cuda_queue(queue)?;
        if flags.contains(MapFlag::BLOCK) {
            cuda.finish()?;
        }
        self.mappings.begin(self.data_size(), self.flags, flags, 0, 0, |_, staging| self.download_all(cuda, staging))
    }

    fn unmap(&self, queue: &dyn Queue, mapping: Mapping) -> ComputeResult<()> {
        let cuda = cuda_queue(queue)?;
        let entry = self.mappings.end(mapping, |_, staging| self.upload_all(cuda, staging))?;
        if entry.flags.writes_back() && self.wants_auto_mips() {
            self.generate_mip_map_chain(queue)?;
        }
        Ok(())
    }

    fn generate_mip_map_chain(&self, queue: &dyn Queue) -> ComputeResult<()> {
        if !self.image_type.is_mipmapped() || self.mip_level_count() <= 1 {
            return Ok(());
        }
        if self.surfaces.is_empty() {
            return Err(ComputeError::Unsupported(format!("{:?} has no writable levels", self.image_type)));
        }
        let program = self.minify.wait()?;
        run_minify(queue, self, program.as_ref(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_layout() {
        assert_eq!(std::mem::size_of::<ImageDescriptor>(), 160);
    }

    #[test]
    fn test_array_descriptor() {
        let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_ARRAY;
        let (desc, native) = array_descriptor(t, UVec4::new(64, 32, 3, 0), true).unwrap();
        assert_eq!((desc.Width, desc.Height, desc.Depth), (64, 32, 3));
        assert_eq!(desc.Flags, ARRAY_LAYERED | ARRAY_SURFACE_LDST);
        assert_eq!(desc.NumChannels, 4);
        assert_eq!(native.channel, ChannelFormat::U8);

        let rgb = ImageType::RGBA8UI_NORM.with_channel_count(3);
        assert!(array_descriptor(rgb, UVec4::new(4, 4, 0, 0), false).is_err());

        let cube = ImageType::IMAGE_CUBE | ImageType::CHANNELS_4 | ImageType::FORMAT_8 | ImageType::UINT;
        let (desc, _) = array_descriptor(cube, UVec4::new(16, 16, 0, 0), false).unwrap();
        assert_eq!(desc.Depth, 6);
        assert_eq!(desc.Flags, ARRAY_CUBEMAP);
    }

    #[test]
    fn test_texture_descriptor() {
        let float = native_format(ImageType::RGBA32F).unwrap();
        let desc = SamplerDesc { filter: FilterMode::Linear, anisotropy_log2: 3, ..Default::default() };
        let tex = texture_descriptor(desc, &float, 5);
        assert_eq!(tex.filterMode, sys::CUfilter_mode::CU_TR_FILTER_MODE_LINEAR);
        assert_eq!(tex.maxAnisotropy, 8);
        assert_eq!(tex.flags, TEXTURE_NORMALIZED_COORDINATES);
        assert_eq!(tex.maxMipmapLevelClamp, 4.0);

        let uint = native_format(ImageType::RGBA8UI_NORM.without(ImageType::FLAG_NORMALIZED)).unwrap();
        let pixel = SamplerDesc { filter: FilterMode::Linear, coord_mode: CoordMode::Pixel, ..Default::default() };
        let tex = texture_descriptor(pixel, &uint, 1);
        assert_eq!(tex.filterMode, sys::CUfilter_mode::CU_TR_FILTER_MODE_POINT);
        assert_eq!(tex.flags, TEXTURE_READ_AS_INTEGER);
    }

    #[test]
    fn test_canonical_sampler() {
        let compare = SamplerDesc { compare: CompareFunction::Less, anisotropy_log2: 7, ..Default::default() };
        let canonical = canonical_sampler(compare.index());
        assert_eq!(canonical.compare, CompareFunction::Never);
        assert_eq!(canonical.anisotropy_log2, 4);
        let distinct: std::collections::HashSet<usize> =
            (0..SAMPLER_COUNT).map(|i| canonical_sampler(i).index()).collect();
        assert_eq!(distinct.len(), 80);
    }
}
