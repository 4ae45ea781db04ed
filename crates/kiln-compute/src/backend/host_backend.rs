//! Host backend.
//!
//! The CPU as a compute device. Memory objects are 128 B aligned host
//! allocations, kernels are Rust closures from the context's
//! [`HostKernelRegistry`] and run synchronously on the submitting thread
//! (parallelized internally with rayon). Fences are mutex/condvar timelines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use glam::{UVec2, UVec3, UVec4};
use kiln_binary::MatchOptions;
use kiln_core::{
    BackendDeviceInfo, Config, Device, DeviceId, DeviceKind, FunctionInfo, HostDeviceInfo, ImageType, MapFlag,
    MemoryFlag, Vendor,
};
use tracing::{debug, info, trace, warn};

use super::context::{AsAny, Context, DefaultQueues};
use super::device_select::{DeviceList, DeviceWhitelist};
use super::host_kernels::{HostKernel, HostKernelRegistry, HostLaunch};
use super::memory::{AlignedBuffer, Mapping, MappingTable, system_cpu_mhz, system_cpus, system_memory};
use super::minify::{MinifyLatch, minify_base_types, minify_kernel_name, run_minify};
use super::program::{DeviceProgram, Function, Program, ProgramInput, kernel_names};
use super::queue::{Fence, FenceValues, LaunchParams, Queue, check_args, effective_local_size};
use super::resource::{Buffer, BufferDesc, Image, ImageDesc, check_image_support, check_range};
use super::Backend;
use crate::{ComputeError, ComputeResult};

/// Capability record of the machine this process runs on.
pub fn host_device() -> Device {
    let units = system_cpus();
    let memory = system_memory();
    Device {
        name: format!("Host CPU ({}, {units} threads)", std::env::consts::ARCH),
        vendor: Vendor::Host,
        vendor_name: "host".into(),
        id: DeviceId::new(DeviceKind::Cpu, 0),
        units,
        clock: system_cpu_mhz(),
        global_mem_size: memory,
        local_mem_size: 64 * 1024,
        constant_mem_size: 64 * 1024,
        max_mem_alloc: memory,
        max_total_local_size: 1024,
        max_local_size: UVec3::splat(1024),
        max_group_size: UVec3::splat(u32::MAX),
        max_image_1d_dim: 65536,
        max_image_1d_buffer_dim: 1 << 27,
        max_image_2d_dim: UVec2::splat(65536),
        max_image_3d_dim: UVec3::splat(4096),
        max_image_array_layers: 2048,
        max_mip_levels: 17,
        simd_width: 1,
        simd_range: UVec2::ONE,
        double_support: true,
        basic_64_bit_atomics_support: true,
        extended_64_bit_atomics_support: true,
        basic_32_bit_float_atomics_support: true,
        image_support: true,
        image_depth_support: true,
        image_depth_write_support: true,
        image_cube_support: true,
        image_cube_write_support: true,
        image_cube_array_support: true,
        image_mipmap_support: true,
        image_mipmap_write_support: true,
        image_offset_read_support: true,
        image_offset_write_support: true,
        image_read_write_support: true,
        backend: BackendDeviceInfo::Host(HostDeviceInfo::detect()),
        ..Default::default()
    }
}

fn host_score(device: &Device) -> u64 {
    device.units.max(1) as u64 * device.clock.max(1) as u64
}

// =============================================================================
// Context
// =============================================================================

/// Host compute context.
pub struct HostContext {
    devices: DeviceList,
    queues: DefaultQueues,
    registry: HostKernelRegistry,
    minify: Arc<MinifyLatch<HostProgram>>,
    match_options: MatchOptions,
}

impl HostContext {
    /// Detects the host device, applies the whitelist and starts building
    /// the minify program in the background.
    pub fn new(config: &Config) -> ComputeResult<Self> {
        let whitelist = DeviceWhitelist::from_config(config);
        let devices = DeviceList::build(vec![host_device()], &whitelist, host_score);
        let device = devices.devices().first().cloned().ok_or(ComputeError::NoDevices)?;

        let queues = DefaultQueues::new();
        queues.insert(device.id, Arc::new(HostQueue::new(device.clone())));

        let registry = HostKernelRegistry::with_minify(&device);
        let minify = Arc::new(MinifyLatch::new());
        {
            let registry = registry.clone();
            let names: Vec<String> =
                minify_base_types(&device, false).into_iter().filter_map(minify_kernel_name).collect();
            let id = device.id;
            minify.start(move || HostProgram::from_registry(&registry, id, names.as_slice()));
        }

        info!(device = %device.name, units = device.units, clock = device.clock, "host context ready");
        Ok(Self { devices, queues, registry, minify, match_options: MatchOptions::from(config) })
    }

    /// Kernels programs of this context resolve against.
    pub fn registry(&self) -> &HostKernelRegistry {
        &self.registry
    }

    /// Program made of registered kernels, no binary needed.
    pub fn program_from_registry(&self, names: &[&str]) -> ComputeResult<Arc<dyn Program>> {
        let device = self.devices.devices().first().ok_or(ComputeError::NoDevices)?;
        let program = HostProgram::from_registry(&self.registry, device.id, names)?;
        Ok(Arc::new(program))
    }

    fn host_queue<'q>(&self, queue: &'q dyn Queue) -> ComputeResult<&'q HostQueue> {
        queue
            .as_any()
            .downcast_ref::<HostQueue>()
            .ok_or_else(|| ComputeError::InvalidArgument("queue does not belong to the host backend".into()))
    }
}

impl AsAny for HostContext {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Context for HostContext {
    fn backend(&self) -> Backend {
        Backend::Host
    }

    fn device_list(&self) -> &DeviceList {
        &self.devices
    }

    fn create_queue(&self, device: &Device) -> ComputeResult<Arc<dyn Queue>> {
        let device = self
            .device(device.id)
            .cloned()
            .ok_or_else(|| ComputeError::InvalidArgument(format!("{} is not a host device", device.id)))?;
        self.queues.get_or_create(device.id, || Ok(Arc::new(HostQueue::new(device))))
    }

    fn create_fence(&self, _device: &Device) -> ComputeResult<Arc<dyn Fence>> {
        Ok(Arc::new(HostFence::new()))
    }

    fn create_buffer(&self, queue: &dyn Queue, desc: BufferDesc<'_>) -> ComputeResult<Arc<dyn Buffer>> {
        let queue = self.host_queue(queue)?;
        desc.validate()?;
        if desc.size > queue.device.max_mem_alloc {
            return Err(ComputeError::BufferCreation(format!(
                "{} bytes exceed the max allocation of {}",
                desc.size, queue.device.max_mem_alloc
            )));
        }
        Ok(Arc::new(HostBuffer::new(queue.device.id, desc)))
    }

    fn create_image(&self, queue: &dyn Queue, desc: ImageDesc<'_>) -> ComputeResult<Arc<dyn Image>> {
        let host_queue = self.host_queue(queue)?;
        desc.validate()?;
        check_image_support(&host_queue.device, desc.image_type)?;
        let image = Arc::new(HostImage::new(host_queue.device.id, desc, Arc::clone(&self.minify)));
        if desc.initial_data().is_some() && image.wants_auto_mips() {
            image.generate_mip_map_chain(queue)?;
        }
        Ok(image)
    }

    fn add_program(&self, input: ProgramInput<'_>) -> ComputeResult<Arc<dyn Program>> {
        let registry = &self.registry;
        let programs = DeviceProgram::build_all(self.devices.devices(), &input, &self.match_options, |device, binary| {
            let mut functions = HashMap::new();
            for info in binary.functions.iter().filter(|f| f.is_kernel()) {
                match registry.get(&info.name) {
                    Some((_, kernel)) => {
                        functions.insert(info.name.clone(), Arc::new(HostFunction::new(device.id, info.clone(), kernel)));
                    }
                    None => warn!(function = %info.name, "no host kernel registered"),
                }
            }
            if functions.is_empty() {
                return Err(ComputeError::ProgramBuild("no function of the binary has a host kernel".into()));
            }
            Ok(functions)
        })?;
        debug!(kernels = kernel_names(&programs).len(), "host program built");

        let (device, program) = programs
            .into_iter()
            .next()
            .ok_or_else(|| ComputeError::ProgramBuild("no device has a usable binary".into()))?;
        Ok(Arc::new(HostProgram { device, functions: program.module }))
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Host queue. Launches run on the calling thread, one at a time.
pub struct HostQueue {
    device: Device,
    submit: Mutex<()>,
    label: Mutex<String>,
}

impl HostQueue {
    fn new(device: Device) -> Self {
        Self { device, submit: Mutex::new(()), label: Mutex::new(String::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.submit.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AsAny for HostQueue {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Queue for HostQueue {
    fn device(&self) -> &Device {
        &self.device
    }

    fn finish(&self) -> ComputeResult<()> {
        // launches are synchronous; taking the lock waits for one in flight
        drop(self.lock());
        Ok(())
    }

    fn execute(&self, function: &dyn Function, params: &LaunchParams<'_>) -> ComputeResult<()> {
        let function = function
            .as_any()
            .downcast_ref::<HostFunction>()
            .ok_or_else(|| ComputeError::InvalidArgument(format!("{} is not a host function", function.name())))?;
        let info = function
            .info(self.device.id)
            .ok_or_else(|| ComputeError::FunctionNotFound(format!("{} on {}", function.name(), self.device.id)))?;
        check_args(info, params.args)?;
        let local_size = effective_local_size(info, &self.device, params.local_size);

        let _guard = self.lock();
        for wait in params.submit.wait_fences {
            wait.fence.wait(wait.values.signaled, None)?;
        }
        trace!(
            kernel = %function.name(),
            label = params.submit.debug_label.unwrap_or(""),
            queue = %self.label.lock().unwrap_or_else(|e| e.into_inner()),
            global = ?params.global_size,
            "host launch"
        );
        let launch = HostLaunch::new(&self.device, params.global_size, local_size, params.args);
        (function.kernel)(&launch)?;
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
// Fence
// =============================================================================

/// Timeline fence on a mutex/condvar pair.
#[derive(Default)]
pub struct HostFence {
    value: Mutex<u64>,
    changed: Condvar,
    next: AtomicU64,
}

impl HostFence {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.value.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AsAny for HostFence {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Fence for HostFence {
    fn next_signal_value(&self) -> FenceValues {
        let unsignaled = self.next.fetch_add(1, Ordering::SeqCst);
        FenceValues { unsignaled, signaled: unsignaled + 1 }
    }

    fn completed_value(&self) -> ComputeResult<u64> {
        Ok(*self.lock())
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> ComputeResult<bool> {
        let guard = self.lock();
        match timeout {
            None => {
                let guard = self.changed.wait_while(guard, |v| *v < value).unwrap_or_else(|e| e.into_inner());
                Ok(*guard >= value)
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                let (guard, _) = self
                    .changed
                    .wait_timeout_while(guard, deadline.saturating_duration_since(Instant::now()), |v| *v < value)
                    .unwrap_or_else(|e| e.into_inner());
                Ok(*guard >= value)
            }
        }
    }

    fn signal(&self, value: u64) -> ComputeResult<()> {
        let mut current = self.lock();
        // the counter never moves backwards
        if value > *current {
            *current = value;
            self.changed.notify_all();
        }
        Ok(())
    }
}

// =============================================================================
// Buffer
// =============================================================================

/// Host buffer.
pub struct HostBuffer {
    device: DeviceId,
    flags: MemoryFlag,
    data: RwLock<AlignedBuffer>,
    mappings: MappingTable,
}

impl HostBuffer {
    fn new(device: DeviceId, desc: BufferDesc<'_>) -> Self {
        let mut data = AlignedBuffer::zeroed(desc.size as usize);
        if let Some(init) = desc.initial_data() {
            data[..init.len()].copy_from_slice(init);
        }
        Self { device, flags: desc.flags, data: RwLock::new(data), mappings: MappingTable::new() }
    }

    /// Runs `f` on the buffer contents.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Runs `f` on the mutable buffer contents.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.write().unwrap_or_else(|e| e.into_inner()))
    }

    /// Live mappings.
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }
}

impl AsAny for HostBuffer {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Buffer for HostBuffer {
    fn size(&self) -> u64 {
        self.with_data(|d| d.len() as u64)
    }

    fn flags(&self) -> MemoryFlag {
        self.flags
    }

    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn read(&self, queue: &dyn Queue, dst: &mut [u8], offset: u64) -> ComputeResult<()> {
        queue.finish()?;
        self.with_data(|data| {
            check_range(data.len() as u64, offset, dst.len() as u64)?;
            dst.copy_from_slice(&data[offset as usize..offset as usize + dst.len()]);
            Ok(())
        })
    }

    fn write(&self, queue: &dyn Queue, src: &[u8], offset: u64) -> ComputeResult<()> {
        queue.finish()?;
        self.with_data_mut(|data| {
            check_range(data.len() as u64, offset, src.len() as u64)?;
            data[offset as usize..offset as usize + src.len()].copy_from_slice(src);
            Ok(())
        })
    }

    fn copy(&self, queue: &dyn Queue, src: &dyn Buffer, size: u64, src_offset: u64, dst_offset: u64) -> ComputeResult<()> {
        let src = src
            .as_any()
            .downcast_ref::<HostBuffer>()
            .ok_or_else(|| ComputeError::InvalidArgument("copy source is not a host buffer".into()))?;
        let size = if size == 0 { src.size().saturating_sub(src_offset) } else { size };
        check_range(src.size(), src_offset, size)?;
        check_range(self.size(), dst_offset, size)?;
        queue.finish()?;

        let (from, to, len) = (src_offset as usize, dst_offset as usize, size as usize);
        if std::ptr::eq(self, src) {
            self.with_data_mut(|data| data.copy_within(from..from + len, to));
        } else {
            src.with_data(|s| self.with_data_mut(|d| d[to..to + len].copy_from_slice(&s[from..from + len])));
        }
        Ok(())
    }

    fn fill(&self, queue: &dyn Queue, pattern: &[u8], offset: u64, size: u64) -> ComputeResult<()> {
        if pattern.is_empty() || size % pattern.len() as u64 != 0 {
            return Err(ComputeError::InvalidArgument(format!(
                "fill size {size} is not a multiple of the {} byte pattern",
                pattern.len()
            )));
        }
        queue.finish()?;
        self.with_data_mut(|data| {
            check_range(data.len() as u64, offset, size)?;
            for chunk in data[offset as usize..(offset + size) as usize].chunks_exact_mut(pattern.len()) {
                chunk.copy_from_slice(pattern);
            }
            Ok(())
        })
    }

    fn map(&self, queue: &dyn Queue, flags: MapFlag, offset: u64, size: u64) -> ComputeResult<Mapping> {
        if flags.contains(MapFlag::BLOCK) {
            queue.finish()?;
        }
        self.mappings.begin(self.size(), self.flags, flags, offset, size, |offset, staging| {
            self.with_data(|data| {
                let at = offset as usize;
                staging.copy_from_slice(&data[at..at + staging.len()]);
            });
            Ok(())
        })
    }

    fn unmap(&self, _queue: &dyn Queue, mapping: Mapping) -> ComputeResult<()> {
        self.mappings.end(mapping, |offset, staging| {
            self.with_data_mut(|data| {
                let at = offset as usize;
                data[at..at + staging.len()].copy_from_slice(staging);
            });
            Ok(())
        })?;
        Ok(())
    }
}

// =============================================================================
// Image
// =============================================================================

/// Host image: layer-major bytes, each layer holding its full mip chain.
pub struct HostImage {
    device: DeviceId,
    image_type: ImageType,
    dim: UVec4,
    flags: MemoryFlag,
    data: RwLock<AlignedBuffer>,
    mappings: MappingTable,
    minify: Arc<MinifyLatch<HostProgram>>,
}

impl HostImage {
    fn new(device: DeviceId, desc: ImageDesc<'_>, minify: Arc<MinifyLatch<HostProgram>>) -> Self {
        let data = match desc.initial_data() {
            Some(init) => AlignedBuffer::from_slice(init),
            None => AlignedBuffer::zeroed(desc.data_size() as usize),
        };
        Self {
            device,
            image_type: desc.image_type,
            dim: desc.dim,
            flags: desc.flags,
            data: RwLock::new(data),
            mappings: MappingTable::new(),
            minify,
        }
    }

    fn wants_auto_mips(&self) -> bool {
        self.flags.contains(MemoryFlag::GENERATE_MIP_MAPS) && self.image_type.is_mipmapped()
    }

    /// Runs `f` on the image bytes.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Runs `f` on the mutable image bytes.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.write().unwrap_or_else(|e| e.into_inner()))
    }
}

impl AsAny for HostImage {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Image for HostImage {
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
        queue.finish()?;
        self.with_data_mut(|data| data.fill(0));
        Ok(())
    }

    fn map(&self, queue: &dyn Queue, flags: MapFlag) -> ComputeResult<Mapping> {
        if flags.contains(MapFlag::BLOCK) {
            queue.finish()?;
        }
        self.mappings.begin(self.data_size(), self.flags, flags, 0, 0, |_, staging| {
            self.with_data(|data| staging.copy_from_slice(&data[..staging.len()]));
            Ok(())
        })
    }

    fn unmap(&self, queue: &dyn Queue, mapping: Mapping) -> ComputeResult<()> {
        let entry = self.mappings.end(mapping, |_, staging| {
            self.with_data_mut(|data| data[..staging.len()].copy_from_slice(staging));
            Ok(())
        })?;
        if entry.flags.writes_back() && self.wants_auto_mips() {
            self.generate_mip_map_chain(queue)?;
        }
        Ok(())
    }

    fn generate_mip_map_chain(&self, queue: &dyn Queue) -> ComputeResult<()> {
        if !self.image_type.is_mipmapped() || self.mip_level_count() <= 1 {
            return Ok(());
        }
        let program = self.minify.wait()?;
        run_minify(queue, self, program.as_ref(), false)
    }
}

// =============================================================================
// Program / function
// =============================================================================

/// Host kernel bound to its declared layout.
pub struct HostFunction {
    device: DeviceId,
    info: FunctionInfo,
    kernel: HostKernel,
}

impl HostFunction {
    fn new(device: DeviceId, info: FunctionInfo, kernel: HostKernel) -> Self {
        Self { device, info, kernel }
    }
}

impl AsAny for HostFunction {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Function for HostFunction {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn info(&self, device: DeviceId) -> Option<&FunctionInfo> {
        (device == self.device).then_some(&self.info)
    }

    fn devices(&self) -> Vec<DeviceId> {
        vec![self.device]
    }
}

/// Host program: kernels resolved by name.
pub struct HostProgram {
    device: DeviceId,
    functions: HashMap<String, Arc<HostFunction>>,
}

impl HostProgram {
    fn from_registry<S: AsRef<str>>(registry: &HostKernelRegistry, device: DeviceId, names: &[S]) -> ComputeResult<Self> {
        let mut functions = HashMap::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let (info, kernel) = registry.get(name).ok_or_else(|| ComputeError::FunctionNotFound(name.to_string()))?;
            functions.insert(name.to_string(), Arc::new(HostFunction::new(device, info, kernel)));
        }
        Ok(Self { device, functions })
    }
}

impl AsAny for HostProgram {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Program for HostProgram {
    fn function(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.functions.get(name).map(|f| Arc::clone(f) as Arc<dyn Function>)
    }

    fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    fn devices(&self) -> Vec<DeviceId> {
        vec![self.device]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::queue::{FenceWait, KernelArg};
    use kiln_core::ArgInfo;
    use std::thread;

    fn context() -> (HostContext, Arc<dyn Queue>) {
        let ctx = HostContext::new(&Config::default()).unwrap();
        let device = ctx.fastest_device().unwrap().clone();
        let queue = ctx.create_queue(&device).unwrap();
        (ctx, queue)
    }

    #[test]
    fn test_host_device() {
        let (ctx, _) = context();
        assert_eq!(ctx.devices().len(), 1);
        let device = &ctx.devices()[0];
        assert!(device.is_cpu());
        assert_eq!(device.id.to_string(), "CPU0");
        assert!(device.host().is_some());
    }

    #[test]
    fn test_whitelist_drops_host() {
        let mut config = Config::default();
        config.compute.whitelist = vec!["gpu".into()];
        assert!(matches!(HostContext::new(&config), Err(ComputeError::NoDevices)));
    }

    #[test]
    fn test_default_queue_handed_out_once() {
        let (ctx, first) = context();
        let device = ctx.devices()[0].clone();
        let second = ctx.create_queue(&device).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_fence_timeline() {
        let fence = Arc::new(HostFence::new());
        let v1 = fence.next_signal_value();
        let v2 = fence.next_signal_value();
        assert_eq!((v1.unsignaled, v1.signaled, v2.signaled), (0, 1, 2));
        assert!(!fence.wait(1, Some(Duration::from_millis(5))).unwrap());

        let signaller = Arc::clone(&fence);
        let handle = thread::spawn(move || signaller.signal(2).unwrap());
        assert!(fence.wait(2, None).unwrap());
        handle.join().unwrap();
        fence.signal(1).unwrap();
        assert_eq!(fence.completed_value().unwrap(), 2);
    }

    #[test]
    fn test_buffer_ops() {
        let (ctx, queue) = context();
        let q = queue.as_ref();
        let a = ctx.create_buffer(q, BufferDesc::from_data(&[1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        let b = ctx.create_buffer(q, BufferDesc::new(8)).unwrap();
        b.copy(q, a.as_ref(), 4, 2, 0).unwrap();
        b.fill(q, &[9, 9], 4, 4).unwrap();
        let mut out = [0u8; 8];
        b.read(q, &mut out, 0).unwrap();
        assert_eq!(out, [3, 4, 5, 6, 9, 9, 9, 9]);

        a.copy(q, a.as_ref(), 4, 0, 4).unwrap();
        a.read(q, &mut out, 0).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 1, 2, 3, 4]);

        assert!(b.fill(q, &[1, 2, 3], 0, 8).is_err());
        assert!(b.write(q, &[0; 4], 6).is_err());
    }

    #[test]
    fn test_custom_kernel_with_fences() {
        let (ctx, queue) = context();
        let info = FunctionInfo::kernel("add_one", vec![ArgInfo::buffer(), ArgInfo::value(4)]);
        ctx.registry().register(info, |launch| {
            let buffer = launch.buffer(0)?;
            let amount: u32 = launch.value(1)?;
            buffer.with_data_mut(|d| d.iter_mut().for_each(|b| *b += amount as u8));
            Ok(())
        });
        let program = ctx.program_from_registry(&["add_one"]).unwrap();
        let function = program.function("add_one").unwrap();
        assert_eq!(program.function_names(), vec!["add_one".to_string()]);

        let buffer = ctx.create_buffer(queue.as_ref(), BufferDesc::new(16)).unwrap();
        let fence = HostFence::new();
        let values = fence.next_signal_value();
        let amount = 3u32;
        let args = [KernelArg::from(&buffer), KernelArg::value(&amount)];
        let signals = [FenceWait::new(&fence, values)];
        let mut params = LaunchParams::new(UVec3::new(16, 1, 1), UVec3::ONE, &args);
        params.submit.signal_fences = &signals;
        queue.execute(function.as_ref(), &params).unwrap();
        assert_eq!(fence.completed_value().unwrap(), values.signaled);

        let mut out = [0u8; 16];
        buffer.read(queue.as_ref(), &mut out, 0).unwrap();
        assert!(out.iter().all(|&b| b == 3));

        let wrong = [KernelArg::from(&buffer)];
        assert!(queue.execute(function.as_ref(), &LaunchParams::new(UVec3::ONE, UVec3::ONE, &wrong)).is_err());
    }

    #[test]
    fn test_unknown_kernel_rejected() {
        let (ctx, _) = context();
        assert!(matches!(ctx.program_from_registry(&["nope"]), Err(ComputeError::FunctionNotFound(_))));
    }
}
