//! Runtime interfaces and backends.
//!
//! Every backend implements the same capability traits ([`Context`],
//! [`Queue`], [`Fence`], [`Buffer`], [`Image`], [`Program`], [`Function`]).
//! Callers hold `Arc<dyn Trait>` and never name a concrete backend type;
//! backends downcast their own objects through [`AsAny`].
//!
//! # Architecture
//!
//! ```text
//! Context ──> Device list (immutable after construction)
//!    ├── create_queue   ──> Queue (per-queue submission lock)
//!    ├── create_fence   ──> Fence (timeline counter)
//!    ├── create_buffer  ──> Buffer ─┐
//!    ├── create_image   ──> Image  ─┴── MappingTable (128 B aligned staging)
//!    └── add_program    ──> Program ──> Function (per-device entry points)
//! ```

mod command_pool;
mod completion;
mod context;
mod detect;
mod device_select;
mod format;
mod host_backend;
mod host_kernels;
mod indirect;
mod minify;
mod program;
mod queue;
mod resource;
mod sampler;

pub mod memory;

#[cfg(feature = "cuda")]
mod cuda_backend;
#[cfg(feature = "cuda")]
mod cuda_image;

#[cfg(feature = "vulkan")]
mod vulkan_backend;
#[cfg(feature = "vulkan")]
mod vulkan_image;
#[cfg(feature = "vulkan")]
mod vulkan_pool;

#[cfg(all(feature = "cuda", feature = "vulkan"))]
mod interop;

// Core interfaces
pub use context::{AsAny, Context, DefaultQueues};
pub use queue::{Fence, FenceValues, FenceWait, KernelArg, LaunchParams, Queue, SubmitParams, SyncStage};
pub use resource::{Buffer, BufferDesc, Image, ImageDesc, check_image_support, image_level_size, image_offset};
pub use program::{DeviceProgram, Function, Program, ProgramInput, SelectedBinary, select_binary};
pub use memory::{AlignedBuffer, MapEntry, Mapping, MappingTable, STAGING_ALIGNMENT};

// Helpers shared by backends
pub use detect::{BackendInfo, describe_backends, detect_backends, select_best_backend};
pub use device_select::{
    DeviceList, DeviceWhitelist, WhitelistEntry, cuda_cores_per_sm, cuda_score, opencl_score, opencl_vendor_weight,
    vulkan_score,
};
pub use format::{
    ChannelFormat, HOST_CUBE_FACES, NativeFormat, compressed_channel_count, copy_extent, native_depth, native_format,
    native_layer,
};
pub use indirect::{CompletionHandler, IndirectCommand, IndirectCommandPipeline, OwnedKernelArg};
pub use minify::{
    MINIFY_POLL_ATTEMPTS, MINIFY_POLL_INTERVAL, MinifyDispatch, MinifyLatch, minify_base_types, minify_dispatches,
    minify_function_info, minify_global_size, minify_kernel_name, minify_local_size, run_minify,
};
pub use sampler::{AddressMode, CompareFunction, CoordMode, FilterMode, SAMPLER_COUNT, SamplerDesc, SamplerTable};
pub use command_pool::{
    COMMAND_BUFFERS_PER_POOL, CommandBackend, CommandBufferHandle, CommandPoolManager, FENCES_PER_POOL, FenceHandle,
    FenceStatus, PoolOptions, SubmitRequest,
};
pub use completion::{COMPLETION_THREADS, COMPLETION_WAIT, CompletionPool, CompletionTask};

// Backends
pub use host_backend::{
    HostBuffer, HostContext, HostFence, HostFunction, HostImage, HostProgram, HostQueue, host_device,
};
pub use host_kernels::{HostKernel, HostKernelRegistry, HostLaunch};

#[cfg(feature = "cuda")]
pub use cuda_backend::{CudaBuffer, CudaComputeContext, CudaFence, CudaFunction, CudaProgram, CudaQueue, JitOptions};
#[cfg(feature = "cuda")]
pub use cuda_image::CudaImage;

#[cfg(feature = "vulkan")]
pub use vulkan_backend::{VulkanBuffer, VulkanContext, VulkanFence, VulkanFunction, VulkanProgram, VulkanQueue};
#[cfg(feature = "vulkan")]
pub use vulkan_image::VulkanImage;

#[cfg(all(feature = "cuda", feature = "vulkan"))]
pub use interop::{SharedImage, acquire_vulkan_image, release_vulkan_image};

use std::sync::Arc;

use kiln_core::Config;
use tracing::{error, info};

use crate::ComputeResult;
#[cfg(not(all(feature = "cuda", feature = "vulkan")))]
use crate::ComputeError;

/// Available compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Auto-select best available (CUDA > Vulkan > Host).
    #[default]
    Auto,
    /// CPU backend using rayon for parallelization.
    Host,
    /// NVIDIA CUDA driver backend.
    Cuda,
    /// Vulkan compute backend.
    Vulkan,
}

impl Backend {
    /// Check if this backend is available on current system.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Auto => true,
            Self::Host => true,
            #[cfg(feature = "cuda")]
            Self::Cuda => CudaComputeContext::is_available(),
            #[cfg(not(feature = "cuda"))]
            Self::Cuda => false,
            #[cfg(feature = "vulkan")]
            Self::Vulkan => VulkanContext::is_available(),
            #[cfg(not(feature = "vulkan"))]
            Self::Vulkan => false,
        }
    }

    /// Get human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Host => "host",
            Self::Cuda => "cuda",
            Self::Vulkan => "vulkan",
        }
    }

    /// Parses a backend name ("auto", "host"/"cpu", "cuda", "vulkan").
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Some(Self::Auto),
            "host" | "cpu" => Some(Self::Host),
            "cuda" => Some(Self::Cuda),
            "vulkan" | "vk" => Some(Self::Vulkan),
            _ => None,
        }
    }

    /// Backend requested by the config (`compute.backend`), `Auto` if unset or unknown.
    pub fn from_config(config: &Config) -> Self {
        config
            .compute
            .backend
            .as_deref()
            .and_then(Self::parse)
            .unwrap_or(Self::Auto)
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Creates a context for `backend`.
///
/// `Auto` resolves through [`select_best_backend`]. Construction failures
/// (missing driver, no devices after the whitelist) are logged and returned.
pub fn create_context(backend: Backend, config: &Config) -> ComputeResult<Arc<dyn Context>> {
    let result: ComputeResult<Arc<dyn Context>> = match backend {
        Backend::Auto => {
            let best = select_best_backend();
            return create_context(best, config);
        }
        Backend::Host => HostContext::new(config).map(|c| Arc::new(c) as Arc<dyn Context>),
        Backend::Cuda => {
            #[cfg(feature = "cuda")]
            {
                CudaComputeContext::new(config).map(|c| Arc::new(c) as Arc<dyn Context>)
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(ComputeError::BackendNotAvailable("cuda feature not enabled".to_string()))
            }
        }
        Backend::Vulkan => {
            #[cfg(feature = "vulkan")]
            {
                VulkanContext::new(config).map(|c| Arc::new(c) as Arc<dyn Context>)
            }
            #[cfg(not(feature = "vulkan"))]
            {
                Err(ComputeError::BackendNotAvailable("vulkan feature not enabled".to_string()))
            }
        }
    };

    match &result {
        Ok(ctx) => info!(backend = backend.name(), devices = ctx.devices().len(), "context created"),
        Err(e) => error!(backend = backend.name(), error = %e, "failed to create context"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!(Backend::parse("CUDA"), Some(Backend::Cuda));
        assert_eq!(Backend::parse("cpu"), Some(Backend::Host));
        assert_eq!(Backend::parse("metal"), None);
    }

    #[test]
    fn test_backend_from_config() {
        let mut config = Config::default();
        assert_eq!(Backend::from_config(&config), Backend::Auto);
        config.compute.backend = Some("vulkan".into());
        assert_eq!(Backend::from_config(&config), Backend::Vulkan);
    }

    #[test]
    fn test_disabled_backend_errors() {
        if !Backend::Cuda.is_available() {
            assert!(create_context(Backend::Cuda, &Config::default()).is_err());
        }
    }
}
