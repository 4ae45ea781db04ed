//! Device-agnostic compute runtime.
//!
//! One programming model over several native backends: contexts own devices,
//! queues execute kernels, buffers and images hold memory, fences order work
//! across queues and devices. Kernels come from universal binaries
//! ([`kiln_binary::Archive`]) or from a [`kiln_binary::Toolchain`].
//!
//! # Architecture
//!
//! ```text
//! create_context(Backend, &Config)
//!     └── dyn Context
//!             ├── HostContext    (always; rayon-backed CPU kernels)
//!             ├── CudaContext    (feature "cuda")
//!             └── VulkanContext  (feature "vulkan")
//!                     └── CommandPoolManager + CompletionPool
//! ```
//!
//! # Example
//!
//! ```
//! use kiln_compute::{Backend, create_context, BufferDesc};
//! use kiln_core::{Config, MapFlag};
//!
//! let ctx = create_context(Backend::Host, &Config::default()).unwrap();
//! let device = ctx.fastest_device().unwrap().clone();
//! let queue = ctx.create_queue(&device).unwrap();
//! let buffer = ctx.create_buffer(queue.as_ref(), BufferDesc::new(256)).unwrap();
//!
//! let mut mapping = buffer.map(queue.as_ref(), MapFlag::WRITE_INVALIDATE, 0, 256).unwrap();
//! mapping.fill(7);
//! buffer.unmap(queue.as_ref(), mapping).unwrap();
//!
//! let mut out = vec![0u8; 256];
//! buffer.read(queue.as_ref(), &mut out, 0).unwrap();
//! assert!(out.iter().all(|&b| b == 7));
//! ```

use std::io::Write;

pub mod backend;

pub use backend::{
    AsAny, Backend, BackendInfo, Buffer, BufferDesc, CommandBackend, CommandBufferHandle, CommandPoolManager,
    CompletionHandler, CompletionPool, Context, Fence, FenceValues, FenceWait, Function, HostContext,
    HostKernelRegistry, HostLaunch, Image, ImageDesc, IndirectCommandPipeline, KernelArg, LaunchParams, Mapping,
    OwnedKernelArg, Program, ProgramInput, Queue, SamplerDesc, SamplerTable, SubmitParams, SyncStage, create_context,
    describe_backends, detect_backends, select_best_backend,
};

use thiserror::Error;

/// Runtime errors.
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("Backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("Failed to create device: {0}")]
    DeviceCreation(String),

    #[error("No devices left after filtering")]
    NoDevices,

    #[error("Failed to create buffer: {0}")]
    BufferCreation(String),

    #[error("Failed to create image: {0}")]
    ImageCreation(String),

    #[error("Failed to build program: {0}")]
    ProgramBuild(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Mapping failed: {0}")]
    Mapping(String),

    #[error("Size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error(transparent)]
    Core(#[from] kiln_core::Error),

    #[error(transparent)]
    Binary(#[from] kiln_binary::BinaryError),
}

pub type ComputeResult<T> = Result<T, ComputeError>;

/// Aborts the calling thread after a lost device.
///
/// Logs the cause, flushes stdout/stderr so the log line is not lost, then
/// panics. Nothing inside the runtime catches this.
#[cold]
pub fn device_lost(what: &str) -> ! {
    tracing::error!(cause = what, "device lost");
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    panic!("device lost: {what}");
}
