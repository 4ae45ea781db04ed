//! CUDA ↔ Vulkan image sharing.
//!
//! A Vulkan image created with `VULKAN_SHARING` exports its memory as a file
//! descriptor; CUDA imports it and maps it as a mipmapped array. One exported
//! timeline semaphore orders the hand-over in both directions.
//!
//! Teardown order: the mapped array (owned by the CUDA image), the external
//! memory, the external semaphore, and last the Vulkan image memory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use cudarc::driver::sys;
use glam::UVec4;
use kiln_core::{DeviceId, ImageType, MapFlag, MemoryFlag};
use tracing::{debug, warn};

use super::completion::COMPLETION_WAIT;
use super::context::{AsAny, Context};
use super::cuda_backend::{CudaComputeContext, CudaQueue, bind, check, cuda_queue};
use super::cuda_image::{CudaImage, array_descriptor};
use super::memory::Mapping;
use super::queue::{Fence, Queue};
use super::resource::Image;
use super::vulkan_backend::{VulkanFence, vulkan_queue};
use super::vulkan_image::{ImageBacking, VulkanImage};
use crate::{ComputeError, ComputeResult};

const ARRAY_DEPTH_TEXTURE: u32 = 0x10;
const ARRAY_COLOR_ATTACHMENT: u32 = 0x20;

/// Imported memory and semaphore plus the Vulkan objects they came from.
struct ExternalResources {
    context: Arc<cudarc::driver::CudaContext>,
    memory: sys::CUexternalMemory,
    semaphore: sys::CUexternalSemaphore,
    // dropped after the CUDA handles, in this order
    fence: Arc<VulkanFence>,
    _backing: Arc<ImageBacking>,
}

// SAFETY: the handles are only used with their context bound.
#[allow(unsafe_code)]
unsafe impl Send for ExternalResources {}
#[allow(unsafe_code)]
unsafe impl Sync for ExternalResources {}

impl Drop for ExternalResources {
    fn drop(&mut self) {
        if bind(&self.context).is_err() {
            return;
        }
        #[allow(unsafe_code)]
        unsafe {
            if let Err(e) = check(sys::cuDestroyExternalMemory(self.memory), "cuDestroyExternalMemory") {
                warn!(error = %e, "external memory release failed");
            }
            if !self.semaphore.is_null() {
                let result = check(sys::cuDestroyExternalSemaphore(self.semaphore), "cuDestroyExternalSemaphore");
                if let Err(e) = result {
                    warn!(error = %e, "external semaphore release failed");
                }
            }
        }
    }
}

/// Array descriptor of a shared image, with the flags CUDA needs for depth
/// and render-target memory.
pub(crate) fn shared_array_descriptor(
    t: ImageType,
    dim: UVec4,
    flags: MemoryFlag,
) -> ComputeResult<sys::CUDA_ARRAY3D_DESCRIPTOR> {
    let surfaces =
        !t.is_compressed() && (t.is_writable() || (flags.contains(MemoryFlag::GENERATE_MIP_MAPS) && t.is_mipmapped()));
    let (mut desc, _) = array_descriptor(t, dim, surfaces)?;
    if t.is_depth() {
        desc.Flags |= ARRAY_DEPTH_TEXTURE;
    }
    if t.is_render_target() {
        desc.Flags |= ARRAY_COLOR_ATTACHMENT;
    }
    Ok(desc)
}

fn import_memory(image: &VulkanImage) -> ComputeResult<sys::CUexternalMemory> {
    let fd = image.export_fd()?;
    let size = image.allocation_size();
    let mut memory: sys::CUexternalMemory = std::ptr::null_mut();
    #[allow(unsafe_code)]
    let result = unsafe {
        let mut desc: sys::CUDA_EXTERNAL_MEMORY_HANDLE_DESC = std::mem::zeroed();
        desc.type_ = sys::CUexternalMemoryHandleType::CU_EXTERNAL_MEMORY_HANDLE_TYPE_OPAQUE_FD;
        desc.handle.fd = fd;
        desc.size = size;
        // a successful import takes ownership of the fd
        sys::cuImportExternalMemory(&raw mut memory, &raw const desc)
    };
    check(result, "cuImportExternalMemory")?;
    Ok(memory)
}

fn import_semaphore(fence: &VulkanFence) -> ComputeResult<sys::CUexternalSemaphore> {
    let fd = fence.export_fd()?;
    let mut semaphore: sys::CUexternalSemaphore = std::ptr::null_mut();
    #[allow(unsafe_code)]
    let result = unsafe {
        let mut desc: sys::CUDA_EXTERNAL_SEMAPHORE_HANDLE_DESC = std::mem::zeroed();
        desc.type_ = sys::CUexternalSemaphoreHandleType::CU_EXTERNAL_SEMAPHORE_HANDLE_TYPE_TIMELINE_SEMAPHORE_FD;
        desc.handle.fd = fd;
        sys::cuImportExternalSemaphore(&raw mut semaphore, &raw const desc)
    };
    check(result, "cuImportExternalSemaphore")?;
    Ok(semaphore)
}

fn map_array(
    memory: sys::CUexternalMemory,
    desc: sys::CUDA_ARRAY3D_DESCRIPTOR,
    levels: u32,
) -> ComputeResult<sys::CUmipmappedArray> {
    let mut array: sys::CUmipmappedArray = std::ptr::null_mut();
    #[allow(unsafe_code)]
    let result = unsafe {
        let mut mapping: sys::CUDA_EXTERNAL_MEMORY_MIPMAPPED_ARRAY_DESC = std::mem::zeroed();
        mapping.offset = 0;
        mapping.arrayDesc = desc;
        mapping.numLevels = levels;
        sys::cuExternalMemoryGetMappedMipmappedArray(&raw mut array, memory, &raw const mapping)
    };
    check(result, "cuExternalMemoryGetMappedMipmappedArray")?;
    Ok(array)
}

// =============================================================================
// Shared image
// =============================================================================

/// CUDA view of a Vulkan image.
///
/// Kernels of either backend may use the image; [`acquire_vulkan_image`]
/// and [`release_vulkan_image`] move ownership between the two queues.
pub struct SharedImage {
    cuda: Arc<CudaImage>,
    resources: Arc<ExternalResources>,
    owned_by_cuda: AtomicBool,
    timeline: AtomicU64,
}

impl SharedImage {
    /// The CUDA image kernels bind.
    pub fn cuda_image(&self) -> &Arc<CudaImage> {
        &self.cuda
    }

    pub fn is_owned_by_cuda(&self) -> bool {
        self.owned_by_cuda.load(Ordering::Acquire)
    }

    /// Makes `queue` wait (on the device) for the semaphore to reach `value`.
    fn cuda_wait(&self, queue: &CudaQueue, value: u64) -> ComputeResult<()> {
        let semaphore = self.resources.semaphore;
        queue.run(|stream| {
            #[allow(unsafe_code)]
            let result = unsafe {
                let mut params: sys::CUDA_EXTERNAL_SEMAPHORE_WAIT_PARAMS = std::mem::zeroed();
                params.params.fence.value = value;
                sys::cuWaitExternalSemaphoresAsync(&raw const semaphore, &raw const params, 1, stream)
            };
            check(result, "cuWaitExternalSemaphoresAsync")
        })
    }

    /// Signals `value` from `queue` after its pending work.
    fn cuda_signal(&self, queue: &CudaQueue, value: u64) -> ComputeResult<()> {
        let semaphore = self.resources.semaphore;
        queue.run(|stream| {
            #[allow(unsafe_code)]
            let result = unsafe {
                let mut params: sys::CUDA_EXTERNAL_SEMAPHORE_SIGNAL_PARAMS = std::mem::zeroed();
                params.params.fence.value = value;
                sys::cuSignalExternalSemaphoresAsync(&raw const semaphore, &raw const params, 1, stream)
            };
            check(result, "cuSignalExternalSemaphoresAsync")
        })
    }
}

/// Imports `other` (a shareable [`VulkanImage`]) on the CUDA device with the
/// same UUID as the Vulkan device.
pub(crate) fn wrap_vulkan_image(
    ctx: &CudaComputeContext,
    queue: &dyn Queue,
    other: &dyn Image,
) -> ComputeResult<Arc<SharedImage>> {
    let cuda = cuda_queue(queue)?;
    let vulkan = other
        .as_any()
        .downcast_ref::<VulkanImage>()
        .ok_or_else(|| ComputeError::Unsupported("only Vulkan images can be wrapped".into()))?;
    if !vulkan.flags().contains(MemoryFlag::VULKAN_SHARING) {
        return Err(ComputeError::InvalidArgument("image was not created with VULKAN_SHARING".into()));
    }
    let uuid = vulkan
        .device_uuid()
        .ok_or_else(|| ComputeError::Unsupported("Vulkan device reports no UUID".into()))?;
    let target = ctx
        .devices()
        .iter()
        .find(|d| d.uuid == Some(uuid))
        .ok_or_else(|| ComputeError::Unsupported("no CUDA device matches the Vulkan device".into()))?;
    if target.id != cuda.device().id {
        return Err(ComputeError::InvalidArgument(format!(
            "image lives on {}, queue belongs to {}",
            target.id,
            cuda.device().id
        )));
    }

    let t = vulkan.image_type();
    let dim = vulkan.dim();
    let desc = shared_array_descriptor(t, dim, vulkan.flags())?;
    let fence = Arc::new(VulkanFence::new(Arc::clone(vulkan.backing().device()), true)?);

    bind(cuda.context())?;
    let memory = import_memory(vulkan)?;
    // from here on ExternalResources releases what was imported
    let mut resources = ExternalResources {
        context: Arc::clone(cuda.context()),
        memory,
        semaphore: std::ptr::null_mut(),
        fence,
        _backing: Arc::clone(vulkan.backing()),
    };
    resources.semaphore = import_semaphore(&resources.fence)?;
    let resources = Arc::new(resources);

    let levels = t.mip_level_count(dim);
    let array = map_array(resources.memory, desc, levels)?;
    let image = CudaImage::from_mipmapped_array(
        cuda,
        t,
        dim,
        vulkan.flags(),
        array,
        Box::new(Arc::clone(&resources)),
        Arc::clone(ctx.minify_latch()),
    )?;
    debug!(image_type = ?t, ?dim, levels, bytes = vulkan.allocation_size(), "Vulkan image imported into CUDA");
    Ok(Arc::new(SharedImage {
        cuda: Arc::new(image),
        resources,
        owned_by_cuda: AtomicBool::new(false),
        timeline: AtomicU64::new(0),
    }))
}

fn shared_image(image: &dyn Image) -> ComputeResult<&SharedImage> {
    image
        .as_any()
        .downcast_ref::<SharedImage>()
        .ok_or_else(|| ComputeError::InvalidArgument("image is not a shared CUDA/Vulkan image".into()))
}

/// Hands `image` to CUDA: finishes the Vulkan queue, then makes the CUDA
/// queue wait on the shared semaphore. A second acquire is a no-op.
pub fn acquire_vulkan_image(image: &dyn Image, cuda: &dyn Queue, vulkan: &dyn Queue) -> ComputeResult<()> {
    let shared = shared_image(image)?;
    let cuda = cuda_queue(cuda)?;
    let vulkan = vulkan_queue(vulkan)?;
    if shared.owned_by_cuda.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    let result = (|| {
        vulkan.finish()?;
        let value = shared.timeline.fetch_add(1, Ordering::AcqRel) + 1;
        shared.resources.fence.signal(value)?;
        shared.cuda_wait(cuda, value)
    })();
    if result.is_err() {
        shared.owned_by_cuda.store(false, Ordering::Release);
    }
    result
}

/// Hands `image` back to Vulkan: signals the shared semaphore from CUDA,
/// finishes the CUDA queue and waits for the value. A second release is a no-op.
pub fn release_vulkan_image(image: &dyn Image, cuda: &dyn Queue, vulkan: &dyn Queue) -> ComputeResult<()> {
    let shared = shared_image(image)?;
    let cuda = cuda_queue(cuda)?;
    vulkan_queue(vulkan)?;
    if !shared.owned_by_cuda.swap(false, Ordering::AcqRel) {
        return Ok(());
    }
    let result = (|| {
        let value = shared.timeline.fetch_add(1, Ordering::AcqRel) + 1;
        shared.cuda_signal(cuda, value)?;
        cuda.finish()?;
        if !shared.resources.fence.wait(value, Some(COMPLETION_WAIT))? {
            return Err(ComputeError::Timeout("shared semaphore was not signalled".into()));
        }
        Ok(())
    })();
    if result.is_err() {
        shared.owned_by_cuda.store(true, Ordering::Release);
    }
    result
}

impl AsAny for SharedImage {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Image for SharedImage {
    fn image_type(&self) -> ImageType {
        self.cuda.image_type()
    }

    fn dim(&self) -> UVec4 {
        self.cuda.dim()
    }

    fn flags(&self) -> MemoryFlag {
        self.cuda.flags()
    }

    fn device_id(&self) -> DeviceId {
        self.cuda.device_id()
    }

    fn zero(&self, queue: &dyn Queue) -> ComputeResult<()> {
        self.cuda.zero(queue)
    }

    fn map(&self, queue: &dyn Queue, flags: MapFlag) -> ComputeResult<Mapping> {
        self.cuda.map(queue, flags)
    }

    fn unmap(&self, queue: &dyn Queue, mapping: Mapping) -> ComputeResult<()> {
        self.cuda.unmap(queue, mapping)
    }

    fn generate_mip_map_chain(&self, queue: &dyn Queue) -> ComputeResult<()> {
        self.cuda.generate_mip_map_chain(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ImageDesc, VulkanContext};
    use kiln_core::Config;

    #[test]
    fn test_shared_array_descriptor() {
        let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED;
        let desc = shared_array_descriptor(t, UVec4::new(64, 64, 0, 0), MemoryFlag::GENERATE_MIP_MAPS).unwrap();
        assert_eq!(desc.Flags & ARRAY_DEPTH_TEXTURE, 0);
        assert_eq!((desc.Width, desc.Height), (64, 64));

        let depth = shared_array_descriptor(ImageType::D32F, UVec4::new(16, 16, 0, 0), MemoryFlag::empty()).unwrap();
        assert_ne!(depth.Flags & ARRAY_DEPTH_TEXTURE, 0);
    }

    #[test]
    fn test_acquire_release_round_trip() {
        if !CudaComputeContext::is_available() || !VulkanContext::is_available() {
            return;
        }
        let config = Config::default();
        let cuda_ctx = CudaComputeContext::new(&config).unwrap();
        let vk_ctx = VulkanContext::new(&config).unwrap();
        let vk_device = vk_ctx.fastest_device().unwrap().clone();
        let Some(cuda_device) = cuda_ctx.devices().iter().find(|d| d.uuid == vk_device.uuid).cloned() else {
            return;
        };
        let vk_queue = vk_ctx.create_queue(&vk_device).unwrap();
        let cuda_queue = cuda_ctx.create_queue(&cuda_device).unwrap();

        let dim = UVec4::new(32, 32, 0, 0);
        let data: Vec<u8> = (0..32 * 32 * 4).map(|i| (i % 251) as u8).collect();
        let desc = ImageDesc::new(dim, ImageType::RGBA8UI_NORM).with_flags(MemoryFlag::VULKAN_SHARING).with_data(&data);
        let vk_image = vk_ctx.create_image(vk_queue.as_ref(), desc).unwrap();
        let shared = cuda_ctx.wrap_image(cuda_queue.as_ref(), vk_image.as_ref()).unwrap();

        acquire_vulkan_image(shared.as_ref(), cuda_queue.as_ref(), vk_queue.as_ref()).unwrap();
        acquire_vulkan_image(shared.as_ref(), cuda_queue.as_ref(), vk_queue.as_ref()).unwrap();
        let mapping = shared.map(cuda_queue.as_ref(), MapFlag::READ).unwrap();
        assert_eq!(&mapping[..], &data[..]);
        shared.unmap(cuda_queue.as_ref(), mapping).unwrap();
        release_vulkan_image(shared.as_ref(), cuda_queue.as_ref(), vk_queue.as_ref()).unwrap();
        release_vulkan_image(shared.as_ref(), cuda_queue.as_ref(), vk_queue.as_ref()).unwrap();
        assert!(!shared_image(shared.as_ref()).unwrap().is_owned_by_cuda());
    }
}
