//! CUDA driver backend.
//!
//! One primary context per CUDA ordinal, retained through `cudarc`. Every
//! other driver call goes through `cudarc::driver::sys`, the dynamically
//! loaded entry-point table, after binding the device's context to the
//! calling thread.
//!
//! Modules are JIT-compiled from PTX (or loaded as CUBIN) with the JIT
//! options of the `cuda` config section. Fences are host timelines: waits
//! block the submitting thread, signals follow a stream synchronize.

use std::collections::HashMap;
use std::ffi::{CString, c_void};
use std::sync::{Arc, Mutex, MutexGuard};

use cudarc::driver::{CudaContext, CudaStream, sys};
use glam::{UVec2, UVec3};
use kiln_binary::{CompileOptions, CommandToolchain, MatchOptions, ProgramSource, Target};
use kiln_core::{
    BackendDeviceInfo, Config, CudaConfig, CudaDeviceInfo, Device, DeviceId, DeviceKind, FunctionInfo, MapFlag,
    MemoryFlag, ToolchainConfig, Vendor,
};
use tracing::{debug, info, trace, warn};

use super::context::{AsAny, Context, DefaultQueues};
use super::cuda_image::CudaImage;
use super::device_select::{DeviceList, DeviceWhitelist, cuda_score};
use super::host_backend::HostFence;
use super::memory::Mapping;
use super::memory::MappingTable;
use super::minify::{MINIFY_SOURCE, MinifyLatch};
use super::program::{DeviceProgram, Function, Program, ProgramInput, SelectedBinary, kernel_names};
use super::queue::{Fence, KernelArg, LaunchParams, Queue, check_args, effective_local_size};
use super::resource::{Buffer, BufferDesc, Image, ImageDesc, check_image_support, check_range};
use super::Backend;
use crate::{ComputeError, ComputeResult};

/// Oldest accepted driver (`cuDriverGetVersion` encoding, 11.0).
pub const CUDA_MIN_DRIVER_VERSION: u32 = 11000;

/// Size of the JIT info and error log buffers.
const JIT_LOG_SIZE: usize = 16 * 1024;

/// CUDA fences are host timelines.
pub type CudaFence = HostFence;

// =============================================================================
// Driver helpers
// =============================================================================

/// Maps a driver status to an error naming the failed call.
pub(crate) fn check(result: sys::CUresult, what: &str) -> ComputeResult<()> {
    if result == sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(ComputeError::OperationFailed(format!("{what}: {result:?}")))
    }
}

/// Makes `ctx` current on the calling thread.
pub(crate) fn bind(ctx: &CudaContext) -> ComputeResult<()> {
    ctx.bind_to_thread()
        .map_err(|e| ComputeError::OperationFailed(format!("cannot bind CUDA context: {e:?}")))
}

/// Blocks until all work on `stream` completed.
pub(crate) fn sync(stream: sys::CUstream) -> ComputeResult<()> {
    #[allow(unsafe_code)]
    let result = unsafe { sys::cuStreamSynchronize(stream) };
    check(result, "cuStreamSynchronize")
}

fn driver_version() -> ComputeResult<u32> {
    let mut version = 0i32;
    #[allow(unsafe_code)]
    let result = unsafe { sys::cuDriverGetVersion(&raw mut version) };
    check(result, "cuDriverGetVersion")?;
    Ok(version.max(0) as u32)
}

/// Lowest PTX ISA version that supports `sm`.
pub fn min_required_ptx(sm: UVec2) -> UVec2 {
    match (sm.x, sm.y) {
        (0..=5, _) => UVec2::new(4, 0),
        (6, _) => UVec2::new(5, 0),
        (7, 0..=4) => UVec2::new(6, 0),
        (7, _) => UVec2::new(6, 3),
        (8, 0..=5) => UVec2::new(7, 0),
        (8, 6..=8) => UVec2::new(7, 1),
        (8, _) | (9, _) => UVec2::new(7, 8),
        (10 | 11, _) => UVec2::new(8, 6),
        _ => UVec2::new(8, 7),
    }
}

/// Highest PTX ISA version a driver can JIT (11.m -> 7.m, 12.m -> 8.m capped at 8.7).
pub fn max_ptx_for_driver(version: u32) -> UVec2 {
    let (major, minor) = (version / 1000, (version % 1000) / 10);
    match major {
        0..=10 => UVec2::new(6, 5),
        11 => UVec2::new(7, minor),
        _ => UVec2::new(8, minor.min(7)),
    }
}

// =============================================================================
// JIT options
// =============================================================================

/// JIT options applied to every module load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitOptions {
    /// Register cap per thread, 0 = driver default.
    pub max_registers: u32,
    /// 0..=4.
    pub opt_level: u32,
    pub line_info: bool,
    pub debug_info: bool,
    /// Log the JIT info buffer after each load.
    pub verbose: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self::from_config(&CudaConfig::default())
    }
}

impl JitOptions {
    pub fn from_config(config: &CudaConfig) -> Self {
        Self {
            max_registers: config.max_registers,
            opt_level: config.jit_opt_level.min(4),
            line_info: config.jit_line_info,
            debug_info: config.jit_debug_info,
            verbose: config.jit_verbose,
        }
    }

    /// Scalar option/value pairs; the log buffers are appended at load time.
    pub fn entries(&self) -> Vec<(sys::CUjit_option, usize)> {
        let mut entries = vec![
            (sys::CUjit_option::CU_JIT_TARGET_FROM_CUCONTEXT, 0),
            (sys::CUjit_option::CU_JIT_OPTIMIZATION_LEVEL, self.opt_level as usize),
        ];
        if self.max_registers != 0 {
            entries.push((sys::CUjit_option::CU_JIT_MAX_REGISTERS, self.max_registers as usize));
        }
        if self.line_info {
            entries.push((sys::CUjit_option::CU_JIT_GENERATE_LINE_INFO, 1));
        }
        if self.debug_info {
            entries.push((sys::CUjit_option::CU_JIT_GENERATE_DEBUG_INFO, 1));
        }
        if self.verbose {
            entries.push((sys::CUjit_option::CU_JIT_LOG_VERBOSE, 1));
        }
        entries
    }
}

fn log_text(buffer: &[u8]) -> String {
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).trim().to_string()
}

// =============================================================================
// Modules
// =============================================================================

/// A loaded module; unloaded on drop with its context bound.
pub(crate) struct LoadedModule {
    ctx: Arc<CudaContext>,
    module: sys::CUmodule,
}

// SAFETY: the module handle is only used with its context bound, and the
// driver API is thread-safe.
#[allow(unsafe_code)]
unsafe impl Send for LoadedModule {}
#[allow(unsafe_code)]
unsafe impl Sync for LoadedModule {}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        if bind(&self.ctx).is_err() {
            return;
        }
        #[allow(unsafe_code)]
        let result = unsafe { sys::cuModuleUnload(self.module) };
        if let Err(e) = check(result, "cuModuleUnload") {
            warn!(error = %e, "module unload failed");
        }
    }
}

#[derive(Clone, Copy)]
struct FunctionHandle(sys::CUfunction);

// SAFETY: function handles are immutable driver objects.
#[allow(unsafe_code)]
unsafe impl Send for FunctionHandle {}
#[allow(unsafe_code)]
unsafe impl Sync for FunctionHandle {}

/// Module plus resolved entry points of one device.
pub(crate) struct CudaModule {
    module: Arc<LoadedModule>,
    functions: HashMap<String, FunctionHandle>,
}

/// JIT-loads a selected binary on the device of `ctx`.
pub(crate) fn load_module(ctx: &Arc<CudaContext>, binary: &SelectedBinary, jit: &JitOptions) -> ComputeResult<CudaModule> {
    bind(ctx)?;
    let mut image = binary.data.clone();
    let is_ptx = matches!(&binary.target, Target::Cuda(t) if t.is_ptx);
    if is_ptx && image.last() != Some(&0) {
        image.push(0);
    }

    let mut info_log = vec![0u8; JIT_LOG_SIZE];
    let mut error_log = vec![0u8; JIT_LOG_SIZE];
    let mut options: Vec<sys::CUjit_option> = Vec::new();
    let mut values: Vec<*mut c_void> = Vec::new();
    for (option, value) in jit.entries() {
        options.push(option);
        values.push(value as *mut c_void);
    }
    options.push(sys::CUjit_option::CU_JIT_ERROR_LOG_BUFFER);
    values.push(error_log.as_mut_ptr().cast());
    options.push(sys::CUjit_option::CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES);
    values.push(JIT_LOG_SIZE as *mut c_void);
    if jit.verbose {
        options.push(sys::CUjit_option::CU_JIT_INFO_LOG_BUFFER);
        values.push(info_log.as_mut_ptr().cast());
        options.push(sys::CUjit_option::CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES);
        values.push(JIT_LOG_SIZE as *mut c_void);
    }

    let mut module: sys::CUmodule = std::ptr::null_mut();
    #[allow(unsafe_code)]
    let result = unsafe {
        sys::cuModuleLoadDataEx(
            &raw mut module,
            image.as_ptr().cast(),
            options.len() as u32,
            options.as_mut_ptr(),
            values.as_mut_ptr(),
        )
    };
    if result != sys::CUresult::CUDA_SUCCESS {
        return Err(ComputeError::ProgramBuild(format!("cuModuleLoadDataEx: {result:?}: {}", log_text(&error_log))));
    }
    if jit.verbose {
        let info = log_text(&info_log);
        if !info.is_empty() {
            debug!(binary_target = %binary.target, "{info}");
        }
    }
    let module = Arc::new(LoadedModule { ctx: Arc::clone(ctx), module });

    let mut functions = HashMap::new();
    for info in binary.functions.iter().filter(|f| f.is_kernel()) {
        let Ok(name) = CString::new(info.name.as_str()) else {
            warn!(function = %info.name, "function name contains NUL");
            continue;
        };
        let mut handle: sys::CUfunction = std::ptr::null_mut();
        #[allow(unsafe_code)]
        let result = unsafe { sys::cuModuleGetFunction(&raw mut handle, module.module, name.as_ptr()) };
        match check(result, "cuModuleGetFunction") {
            Ok(()) => {
                functions.insert(info.name.clone(), FunctionHandle(handle));
            }
            Err(e) => warn!(function = %info.name, error = %e, "entry point missing from module"),
        }
    }
    Ok(CudaModule { module, functions })
}

// =============================================================================
// Device query
// =============================================================================

fn query_device(index: u32, ctx: &Arc<CudaContext>, driver_version: u32) -> ComputeResult<Device> {
    use sys::CUdevice_attribute as Attr;

    let attr = |a: Attr| -> ComputeResult<u32> {
        ctx.attribute(a)
            .map(|v| v.max(0) as u32)
            .map_err(|e| ComputeError::DeviceCreation(format!("{a:?}: {e:?}")))
    };
    let name = ctx.name().map_err(|e| ComputeError::DeviceCreation(format!("device name: {e:?}")))?;

    let mut total_mem = 0usize;
    #[allow(unsafe_code)]
    let result = unsafe { sys::cuDeviceTotalMem_v2(&raw mut total_mem, ctx.cu_device()) };
    check(result, "cuDeviceTotalMem_v2")?;

    let mut uuid = sys::CUuuid { bytes: [0; 16] };
    #[allow(unsafe_code)]
    let result = unsafe { sys::cuDeviceGetUuid(&raw mut uuid, ctx.cu_device()) };
    let uuid = check(result, "cuDeviceGetUuid").ok().map(|()| uuid.bytes.map(|b| b as u8));

    let sm = UVec2::new(
        attr(Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?,
        attr(Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?,
    );
    let sm_count = attr(Attr::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?;
    let max_2d = UVec2::new(
        attr(Attr::CU_DEVICE_ATTRIBUTE_MAXIMUM_TEXTURE2D_WIDTH)?,
        attr(Attr::CU_DEVICE_ATTRIBUTE_MAXIMUM_TEXTURE2D_HEIGHT)?,
    );
    let warp = attr(Attr::CU_DEVICE_ATTRIBUTE_WARP_SIZE)?.max(1);

    Ok(Device {
        name,
        vendor: Vendor::Nvidia,
        vendor_name: "NVIDIA".into(),
        driver_version_str: format!("{}.{}", driver_version / 1000, (driver_version % 1000) / 10),
        id: DeviceId::new(DeviceKind::Gpu, index),
        uuid,
        units: sm_count,
        clock: attr(Attr::CU_DEVICE_ATTRIBUTE_CLOCK_RATE)? / 1000,
        global_mem_size: total_mem as u64,
        local_mem_size: attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)? as u64,
        constant_mem_size: attr(Attr::CU_DEVICE_ATTRIBUTE_TOTAL_CONSTANT_MEMORY)? as u64,
        max_mem_alloc: total_mem as u64,
        max_total_local_size: attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?,
        max_local_size: UVec3::new(
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X)?,
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y)?,
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Z)?,
        ),
        max_group_size: UVec3::new(
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X)?,
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y)?,
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Z)?,
        ),
        max_image_1d_dim: attr(Attr::CU_DEVICE_ATTRIBUTE_MAXIMUM_TEXTURE1D_WIDTH)?,
        max_image_1d_buffer_dim: attr(Attr::CU_DEVICE_ATTRIBUTE_MAXIMUM_TEXTURE1D_LINEAR_WIDTH)?,
        max_image_2d_dim: max_2d,
        max_image_3d_dim: UVec3::new(
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAXIMUM_TEXTURE3D_WIDTH)?,
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAXIMUM_TEXTURE3D_HEIGHT)?,
            attr(Attr::CU_DEVICE_ATTRIBUTE_MAXIMUM_TEXTURE3D_DEPTH)?,
        ),
        max_image_array_layers: attr(Attr::CU_DEVICE_ATTRIBUTE_MAXIMUM_TEXTURE2D_LAYERED_LAYERS)?,
        max_mip_levels: 32 - max_2d.max_element().max(1).leading_zeros(),
        simd_width: warp,
        simd_range: UVec2::splat(warp),
        sub_group_support: true,
        sub_group_shuffle_support: true,
        double_support: true,
        basic_64_bit_atomics_support: true,
        extended_64_bit_atomics_support: true,
        basic_32_bit_float_atomics_support: true,
        image_support: true,
        image_depth_support: true,
        image_depth_write_support: true,
        // needs the driver sampler hook, which is not available
        image_depth_compare_support: false,
        image_cube_support: true,
        image_cube_write_support: true,
        image_cube_array_support: true,
        image_mipmap_support: true,
        image_mipmap_write_support: true,
        image_offset_read_support: true,
        image_offset_write_support: true,
        image_gather_support: true,
        image_read_write_support: true,
        anisotropic_support: true,
        max_anisotropy: 16,
        backend: BackendDeviceInfo::Cuda(CudaDeviceInfo {
            sm,
            min_req_ptx: min_required_ptx(sm),
            max_ptx: max_ptx_for_driver(driver_version),
            driver_version,
            max_registers_per_block: attr(Attr::CU_DEVICE_ATTRIBUTE_MAX_REGISTERS_PER_BLOCK)?,
            sm_count,
        }),
        ..Default::default()
    })
}

// =============================================================================
// Context
// =============================================================================

/// CUDA compute context over every visible device.
pub struct CudaComputeContext {
    devices: DeviceList,
    natives: HashMap<DeviceId, Arc<CudaContext>>,
    queues: DefaultQueues,
    jit: JitOptions,
    match_options: MatchOptions,
    minify: Arc<MinifyLatch<CudaProgram>>,
}

impl CudaComputeContext {
    /// Checks whether the driver loads and reports at least one device.
    pub fn is_available() -> bool {
        // dynamic loading panics when the driver library is missing
        std::panic::catch_unwind(CudaContext::device_count)
            .ok()
            .and_then(Result::ok)
            .is_some_and(|count| count > 0)
    }

    /// Enumerates devices, applies the whitelist, creates default queues and
    /// starts building the minify program.
    pub fn new(config: &Config) -> ComputeResult<Self> {
        if !Self::is_available() {
            return Err(ComputeError::BackendNotAvailable("no CUDA driver or device".into()));
        }
        let version = driver_version()?;
        if version < CUDA_MIN_DRIVER_VERSION {
            return Err(ComputeError::BackendNotAvailable(format!(
                "CUDA driver {version} is older than {CUDA_MIN_DRIVER_VERSION}"
            )));
        }
        if config.cuda.use_internal_api {
            warn!("cuda.use_internal_api is not supported, depth compare stays disabled");
        }

        let count = CudaContext::device_count()
            .map_err(|e| ComputeError::BackendNotAvailable(format!("device count: {e:?}")))?;
        let mut candidates = Vec::new();
        let mut contexts = Vec::new();
        for ordinal in 0..count.max(0) as usize {
            let ctx = match CudaContext::new(ordinal) {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!(ordinal, error = ?e, "cannot retain CUDA primary context");
                    continue;
                }
            };
            match query_device(ordinal as u32, &ctx, version) {
                Ok(device) => {
                    candidates.push(device);
                    contexts.push(ctx);
                }
                Err(e) => warn!(ordinal, error = %e, "skipping CUDA device"),
            }
        }

        // the list keeps accepted candidates in order, so contexts pair up positionally
        let whitelist = DeviceWhitelist::from_config(config);
        let accepted: Vec<Arc<CudaContext>> = candidates
            .iter()
            .zip(contexts)
            .filter(|(device, _)| whitelist.accepts(device))
            .map(|(_, ctx)| ctx)
            .collect();
        let devices = DeviceList::build(candidates, &whitelist, cuda_score);
        if devices.is_empty() {
            return Err(ComputeError::NoDevices);
        }
        let natives: HashMap<DeviceId, Arc<CudaContext>> =
            devices.devices().iter().map(|d| d.id).zip(accepted).collect();

        let queues = DefaultQueues::new();
        for device in devices.devices() {
            let ctx = natives
                .get(&device.id)
                .ok_or_else(|| ComputeError::DeviceCreation(format!("no context for {}", device.id)))?;
            queues.insert(device.id, Arc::new(CudaQueue::new(device.clone(), Arc::clone(ctx))?));
            info!(
                device = %device.name,
                id = %device.id,
                sm = ?device.cuda().map(|c| c.sm),
                units = device.units,
                "CUDA device"
            );
        }

        let jit = JitOptions::from_config(&config.cuda);
        let match_options = MatchOptions::from(config);
        let minify = Arc::new(MinifyLatch::new());
        {
            let devices = devices.devices().to_vec();
            let natives = natives.clone();
            let toolchain = config.toolchain.clone();
            minify.start(move || build_minify(&devices, &natives, &toolchain, &jit, &match_options));
        }

        Ok(Self { devices, natives, queues, jit, match_options, minify })
    }

    /// JIT options used for every module.
    pub fn jit_options(&self) -> JitOptions {
        self.jit
    }

    /// Primary context of `device`.
    pub(crate) fn native(&self, device: DeviceId) -> ComputeResult<&Arc<CudaContext>> {
        self.natives
            .get(&device)
            .ok_or_else(|| ComputeError::InvalidArgument(format!("{device} is not a CUDA device of this context")))
    }

    pub(crate) fn minify_latch(&self) -> &Arc<MinifyLatch<CudaProgram>> {
        &self.minify
    }
}

fn build_minify(
    devices: &[Device],
    natives: &HashMap<DeviceId, Arc<CudaContext>>,
    toolchain: &ToolchainConfig,
    jit: &JitOptions,
    matching: &MatchOptions,
) -> ComputeResult<CudaProgram> {
    let compiler = CommandToolchain::from_config(toolchain);
    let options = CompileOptions { silence_debug_output: true, ..CompileOptions::from_config(toolchain) };
    let input = ProgramInput::Source { toolchain: &compiler, source: ProgramSource::Memory(MINIFY_SOURCE), options: &options };
    build_program(devices, natives, &input, jit, matching)
}

fn build_program(
    devices: &[Device],
    natives: &HashMap<DeviceId, Arc<CudaContext>>,
    input: &ProgramInput<'_>,
    jit: &JitOptions,
    matching: &MatchOptions,
) -> ComputeResult<CudaProgram> {
    let programs = DeviceProgram::build_all(devices, input, matching, |device, binary| {
        let ctx = natives
            .get(&device.id)
            .ok_or_else(|| ComputeError::DeviceCreation(format!("no context for {}", device.id)))?;
        load_module(ctx, binary, jit)
    })?;
    debug!(kernels = kernel_names(&programs).len(), devices = programs.len(), "CUDA program built");
    Ok(CudaProgram::new(programs))
}

/// Downcasts a queue of this backend.
pub(crate) fn cuda_queue(queue: &dyn Queue) -> ComputeResult<&CudaQueue> {
    queue
        .as_any()
        .downcast_ref::<CudaQueue>()
        .ok_or_else(|| ComputeError::InvalidArgument("queue does not belong to the CUDA backend".into()))
}

impl AsAny for CudaComputeContext {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Context for CudaComputeContext {
    fn backend(&self) -> Backend {
        Backend::Cuda
    }

    fn device_list(&self) -> &DeviceList {
        &self.devices
    }

    fn create_queue(&self, device: &Device) -> ComputeResult<Arc<dyn Queue>> {
        let ctx = Arc::clone(self.native(device.id)?);
        let device = self
            .device(device.id)
            .cloned()
            .ok_or_else(|| ComputeError::InvalidArgument(format!("{} is not a CUDA device", device.id)))?;
        self.queues.get_or_create(device.id, || Ok(Arc::new(CudaQueue::new(device, ctx)?)))
    }

    fn create_fence(&self, _device: &Device) -> ComputeResult<Arc<dyn Fence>> {
        Ok(Arc::new(CudaFence::new()))
    }

    fn create_buffer(&self, queue: &dyn Queue, desc: BufferDesc<'_>) -> ComputeResult<Arc<dyn Buffer>> {
        let queue = cuda_queue(queue)?;
        desc.validate()?;
        if desc.flags.contains(MemoryFlag::VULKAN_SHARING) {
            return Err(ComputeError::Unsupported("shared buffers are created through wrap_buffer".into()));
        }
        let buffer = CudaBuffer::new(queue, desc)?;
        Ok(Arc::new(buffer))
    }

    fn create_image(&self, queue: &dyn Queue, desc: ImageDesc<'_>) -> ComputeResult<Arc<dyn Image>> {
        let cuda = cuda_queue(queue)?;
        desc.validate()?;
        check_image_support(cuda.device(), desc.image_type)?;
        let image = Arc::new(CudaImage::new(cuda, desc, Arc::clone(&self.minify))?);
        if desc.initial_data().is_some() && image.wants_auto_mips() {
            image.generate_mip_map_chain(queue)?;
        }
        Ok(image)
    }

    fn add_program(&self, input: ProgramInput<'_>) -> ComputeResult<Arc<dyn Program>> {
        let program = build_program(self.devices.devices(), &self.natives, &input, &self.jit, &self.match_options)?;
        Ok(Arc::new(program))
    }

    #[cfg(feature = "vulkan")]
    fn wrap_image(&self, queue: &dyn Queue, other: &dyn Image) -> ComputeResult<Arc<dyn Image>> {
        let image = super::interop::wrap_vulkan_image(self, queue, other)?;
        Ok(image)
    }
}

// =============================================================================
// Queue
// =============================================================================

/// A CUDA stream on one device.
pub struct CudaQueue {
    device: Device,
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    submit: Mutex<()>,
    label: Mutex<String>,
}

impl CudaQueue {
    fn new(device: Device, ctx: Arc<CudaContext>) -> ComputeResult<Self> {
        bind(&ctx)?;
        let stream = ctx
            .new_stream()
            .map_err(|e| ComputeError::DeviceCreation(format!("cannot create stream: {e:?}")))?;
        Ok(Self { device, ctx, stream, submit: Mutex::new(()), label: Mutex::new(String::new()) })
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.submit.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    /// Runs `f` on the raw stream with the context bound and the queue locked.
    pub(crate) fn run<R>(&self, f: impl FnOnce(sys::CUstream) -> ComputeResult<R>) -> ComputeResult<R> {
        bind(&self.ctx)?;
        let _guard = self.lock();
        f(self.stream.cu_stream())
    }
}

impl AsAny for CudaQueue {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Queue for CudaQueue {
    fn device(&self) -> &Device {
        &self.device
    }

    fn finish(&self) -> ComputeResult<()> {
        self.run(sync)
    }

    fn execute(&self, function: &dyn Function, params: &LaunchParams<'_>) -> ComputeResult<()> {
        let function = function
            .as_any()
            .downcast_ref::<CudaFunction>()
            .ok_or_else(|| ComputeError::InvalidArgument(format!("{} is not a CUDA function", function.name())))?;
        let entry = function
            .entries
            .get(&self.device.id)
            .ok_or_else(|| ComputeError::FunctionNotFound(format!("{} on {}", function.name, self.device.id)))?;
        check_args(&entry.info, params.args)?;
        let local = effective_local_size(&entry.info, &self.device, params.local_size);
        let groups = params.group_count(local);

        // one storage slot per argument; the driver copies the values at launch
        let mut storage: Vec<Vec<u8>> = Vec::with_capacity(params.args.len());
        for (index, arg) in params.args.iter().enumerate() {
            let bytes = match arg {
                KernelArg::Buffer(buffer) => {
                    let buffer = buffer.as_any().downcast_ref::<CudaBuffer>().ok_or_else(|| {
                        ComputeError::InvalidArgument(format!("argument {index} is not a CUDA buffer"))
                    })?;
                    bytemuck::bytes_of(&buffer.ptr).to_vec()
                }
                KernelArg::Image(image) => {
                    let image = image.as_any().downcast_ref::<CudaImage>().ok_or_else(|| {
                        ComputeError::InvalidArgument(format!("argument {index} is not a CUDA image"))
                    })?;
                    bytemuck::bytes_of(&image.descriptor_ptr()).to_vec()
                }
                KernelArg::Bytes(bytes) => bytes.to_vec(),
            };
            storage.push(bytes);
        }
        let mut pointers: Vec<*mut c_void> = storage.iter_mut().map(|s| s.as_mut_ptr().cast()).collect();

        for wait in params.submit.wait_fences {
            wait.fence.wait(wait.values.signaled, None)?;
        }

        let needs_sync = params.submit.blocking || !params.submit.signal_fences.is_empty();
        self.run(|stream| {
            trace!(
                kernel = %function.name,
                label = params.submit.debug_label.unwrap_or(""),
                queue = %self.label.lock().unwrap_or_else(|e| e.into_inner()),
                groups = ?groups,
                local = ?local,
                "CUDA launch"
            );
            #[allow(unsafe_code)]
            let result = unsafe {
                sys::cuLaunchKernel(
                    entry.handle.0,
                    groups.x,
                    groups.y,
                    groups.z,
                    local.x,
                    local.y,
                    local.z,
                    0,
                    stream,
                    pointers.as_mut_ptr(),
                    std::ptr::null_mut(),
                )
            };
            check(result, "cuLaunchKernel")?;
            if needs_sync { sync(stream) } else { Ok(()) }
        })?;

        for signal in params.submit.signal_fences {
            signal.fence.signal(signal.values.signaled)?;
        }
        Ok(())
    }

    fn set_debug_label(&self, label: &str) {
        *self.label.lock().unwrap_or_else(|e| e.into_inner()) = label.to_string();
    }
}

// =============================================================================
// Buffer
// =============================================================================

/// Linear device memory.
pub struct CudaBuffer {
    device: DeviceId,
    ctx: Arc<CudaContext>,
    ptr: sys::CUdeviceptr,
    size: u64,
    flags: MemoryFlag,
    mappings: MappingTable,
}

impl CudaBuffer {
    fn new(queue: &CudaQueue, desc: BufferDesc<'_>) -> ComputeResult<Self> {
        let ptr = queue.run(|stream| {
            let mut ptr: sys::CUdeviceptr = 0;
            #[allow(unsafe_code)]
            let result = unsafe { sys::cuMemAlloc_v2(&raw mut ptr, desc.size as usize) };
            check(result, "cuMemAlloc_v2").map_err(|e| ComputeError::BufferCreation(e.to_string()))?;
            if let Some(init) = desc.initial_data() {
                #[allow(unsafe_code)]
                let result = unsafe { sys::cuMemcpyHtoDAsync_v2(ptr, init.as_ptr().cast(), init.len(), stream) };
                check(result, "cuMemcpyHtoDAsync_v2")?;
                sync(stream)?;
            }
            Ok(ptr)
        })?;
        trace!(size = desc.size, "CUDA buffer allocated");
        Ok(Self {
            device: queue.device.id,
            ctx: Arc::clone(&queue.ctx),
            ptr,
            size: desc.size,
            flags: desc.flags,
            mappings: MappingTable::new(),
        })
    }

    /// Device address.
    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }

    fn download(&self, queue: &CudaQueue, dst: &mut [u8], offset: u64) -> ComputeResult<()> {
        queue.run(|stream| {
            #[allow(unsafe_code)]
            let result = unsafe { sys::cuMemcpyDtoHAsync_v2(dst.as_mut_ptr().cast(), self.ptr + offset, dst.len(), stream) };
            check(result, "cuMemcpyDtoHAsync_v2")?;
            sync(stream)
        })
    }

    fn upload(&self, queue: &CudaQueue, src: &[u8], offset: u64) -> ComputeResult<()> {
        queue.run(|stream| {
            #[allow(unsafe_code)]
            let result = unsafe { sys::cuMemcpyHtoDAsync_v2(self.ptr + offset, src.as_ptr().cast(), src.len(), stream) };
            check(result, "cuMemcpyHtoDAsync_v2")?;
            sync(stream)
        })
    }
}

impl Drop for CudaBuffer {
    fn drop(&mut self) {
        if bind(&self.ctx).is_err() {
            return;
        }
        #[allow(unsafe_code)]
        let result = unsafe { sys::cuMemFree_v2(self.ptr) };
        if let Err(e) = check(result, "cuMemFree_v2") {
            warn!(error = %e, "buffer free failed");
        }
    }
}

impl AsAny for CudaBuffer {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Buffer for CudaBuffer {
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
        self.download(cuda_queue(queue)?, dst, offset)
    }

    fn write(&self, queue: &dyn Queue, src: &[u8], offset: u64) -> ComputeResult<()> {
        check_range(self.size, offset, src.len() as u64)?;
        self.upload(cuda_queue(queue)?, src, offset)
    }

    fn copy(&self, queue: &dyn Queue, src: &dyn Buffer, size: u64, src_offset: u64, dst_offset: u64) -> ComputeResult<()> {
        let src = src
            .as_any()
            .downcast_ref::<CudaBuffer>()
            .ok_or_else(|| ComputeError::InvalidArgument("copy source is not a CUDA buffer".into()))?;
        if src.device != self.device {
            return Err(ComputeError::Unsupported(format!("copy from {} to {}", src.device, self.device)));
        }
        let size = if size == 0 { src.size.saturating_sub(src_offset) } else { size };
        check_range(src.size, src_offset, size)?;
        check_range(self.size, dst_offset, size)?;
        cuda_queue(queue)?.run(|stream| {
            #[allow(unsafe_code)]
            let result =
                unsafe { sys::cuMemcpyDtoDAsync_v2(self.ptr + dst_offset, src.ptr + src_offset, size as usize, stream) };
            check(result, "cuMemcpyDtoDAsync_v2")
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
        let queue = cuda_queue(queue)?;
        let dst = self.ptr + offset;
        let count = (size / pattern.len() as u64) as usize;
        match *pattern {
            [b] => queue.run(|stream| {
                #[allow(unsafe_code)]
                let result = unsafe { sys::cuMemsetD8Async(dst, b, count, stream) };
                check(result, "cuMemsetD8Async")
            }),
            [a, b] if dst % 2 == 0 => queue.run(|stream| {
                #[allow(unsafe_code)]
                let result = unsafe { sys::cuMemsetD16Async(dst, u16::from_ne_bytes([a, b]), count, stream) };
                check(result, "cuMemsetD16Async")
            }),
            [a, b, c, d] if dst % 4 == 0 => queue.run(|stream| {
                #[allow(unsafe_code)]
                let result = unsafe { sys::cuMemsetD32Async(dst, u32::from_ne_bytes([a, b, c, d]), count, stream) };
                check(result, "cuMemsetD32Async")
            }),
            _ => {
                let expanded: Vec<u8> = pattern.iter().copied().cycle().take(size as usize).collect();
                self.upload(queue, &expanded, offset)
            }
        }
    }

    fn map(&self, queue: &dyn Queue, flags: MapFlag, offset: u64, size: u64) -> ComputeResult<Mapping> {
        let cuda = cuda_queue(queue)?;
        if flags.contains(MapFlag::BLOCK) {
            cuda.finish()?;
        }
        self.mappings.begin(self.size, self.flags, flags, offset, size, |offset, staging| {
            self.download(cuda, staging, offset)
        })
    }

    fn unmap(&self, queue: &dyn Queue, mapping: Mapping) -> ComputeResult<()> {
        let cuda = cuda_queue(queue)?;
        self.mappings.end(mapping, |offset, staging| self.upload(cuda, staging, offset))?;
        Ok(())
    }
}

// =============================================================================
// Program / function
// =============================================================================

struct CudaEntry {
    info: FunctionInfo,
    handle: FunctionHandle,
    _module: Arc<LoadedModule>,
}

/// A kernel with one entry point per device.
pub struct CudaFunction {
    name: String,
    entries: HashMap<DeviceId, CudaEntry>,
}

impl AsAny for CudaFunction {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Function for CudaFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self, device: DeviceId) -> Option<&FunctionInfo> {
        self.entries.get(&device).map(|e| &e.info)
    }

    fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.entries.keys().copied().collect();
        devices.sort();
        devices
    }
}

/// Per-device modules plus the kernels resolved in them.
pub struct CudaProgram {
    functions: HashMap<String, Arc<CudaFunction>>,
    devices: Vec<DeviceId>,
}

impl CudaProgram {
    fn new(programs: HashMap<DeviceId, DeviceProgram<CudaModule>>) -> Self {
        let mut devices: Vec<DeviceId> = programs.keys().copied().collect();
        devices.sort();
        let mut functions: HashMap<String, CudaFunction> = HashMap::new();
        for (device, program) in programs {
            for info in program.functions.iter().filter(|f| f.is_kernel()) {
                let Some(handle) = program.module.functions.get(&info.name) else {
                    continue;
                };
                functions
                    .entry(info.name.clone())
                    .or_insert_with(|| CudaFunction { name: info.name.clone(), entries: HashMap::new() })
                    .entries
                    .insert(device, CudaEntry { info: info.clone(), handle: *handle, _module: Arc::clone(&program.module.module) });
            }
        }
        let functions = functions.into_iter().map(|(name, f)| (name, Arc::new(f))).collect();
        Self { functions, devices }
    }
}

impl AsAny for CudaProgram {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Program for CudaProgram {
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
    use crate::backend::queue::FenceWait;

    #[test]
    fn test_ptx_tables() {
        assert_eq!(min_required_ptx(UVec2::new(7, 5)), UVec2::new(6, 3));
        assert_eq!(min_required_ptx(UVec2::new(8, 6)), UVec2::new(7, 1));
        assert_eq!(min_required_ptx(UVec2::new(9, 0)), UVec2::new(7, 8));
        assert_eq!(min_required_ptx(UVec2::new(12, 0)), UVec2::new(8, 7));
        assert_eq!(max_ptx_for_driver(11080), UVec2::new(7, 8));
        assert_eq!(max_ptx_for_driver(12040), UVec2::new(8, 4));
        assert_eq!(max_ptx_for_driver(12090), UVec2::new(8, 7));
    }

    #[test]
    fn test_jit_entries() {
        let config = CudaConfig { max_registers: 64, jit_line_info: true, ..Default::default() };
        let jit = JitOptions::from_config(&config);
        let entries = jit.entries();
        assert_eq!(entries[0].0, sys::CUjit_option::CU_JIT_TARGET_FROM_CUCONTEXT);
        assert!(entries.contains(&(sys::CUjit_option::CU_JIT_MAX_REGISTERS, 64)));
        assert!(entries.contains(&(sys::CUjit_option::CU_JIT_GENERATE_LINE_INFO, 1)));
        assert!(!entries.iter().any(|(o, _)| *o == sys::CUjit_option::CU_JIT_LOG_VERBOSE));
        assert_eq!(JitOptions::default().opt_level, 4);
    }

    #[test]
    fn test_log_text() {
        assert_eq!(log_text(b"ptxas error\n\0\0garbage"), "ptxas error");
        assert_eq!(log_text(&[0; 8]), "");
    }

    #[test]
    fn test_buffer_round_trip() {
        if !CudaComputeContext::is_available() {
            return;
        }
        let ctx = CudaComputeContext::new(&Config::default()).unwrap();
        let device = ctx.fastest_device().unwrap().clone();
        assert!(device.cuda().is_some());
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
        let waits = [FenceWait::new(fence.as_ref(), values)];
        fence.signal(values.signaled).unwrap();
        assert!(fence.wait(values.signaled, None).unwrap());
        assert_eq!(waits[0].values.signaled, 1);
    }
}
