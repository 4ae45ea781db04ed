//! Mip-chain generation.
//!
//! Each context builds one "minify" program on a background thread, holding
//! one reduction kernel per supported base image type. `generate_mip_map_chain`
//! waits on a [`MinifyLatch`] for that build (at most
//! `MINIFY_POLL_ATTEMPTS x MINIFY_POLL_INTERVAL`) and then dispatches, per
//! layer, one kernel per level `1..` with arguments
//! `(image, level_size, 1 / prev_level_size, level, layer)`.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use glam::UVec3;
use kiln_core::{ArgImageAccess, ArgImageType, ArgInfo, Device, FunctionInfo, ImageDataType, ImageType};
use tracing::{debug, error, trace};

use super::program::Program;
use super::queue::{KernelArg, LaunchParams, Queue};
use super::resource::Image;
use crate::{ComputeError, ComputeResult};

/// Wait bound of the minify program build: attempts.
pub const MINIFY_POLL_ATTEMPTS: u32 = 100;
/// Wait bound of the minify program build: interval.
pub const MINIFY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Source of the GPU minify program, compiled per device by the toolchain.
#[cfg_attr(not(any(feature = "cuda", feature = "vulkan")), allow(dead_code))]
pub(crate) const MINIFY_SOURCE: &str = include_str!("../../kernels/minify.kiln");

// =============================================================================
// Latch
// =============================================================================

enum LatchState<P> {
    Empty,
    Building,
    Ready(Arc<P>),
    Failed(String),
}

/// One-shot latch around a lazily built value.
///
/// The first [`start`](Self::start) spawns the build; waiters block on a
/// condvar until it finishes or the wait bound passes.
pub struct MinifyLatch<P> {
    inner: Arc<(Mutex<LatchState<P>>, Condvar)>,
}

impl<P> Default for MinifyLatch<P> {
    fn default() -> Self {
        Self { inner: Arc::new((Mutex::new(LatchState::Empty), Condvar::new())) }
    }
}

impl<P: Send + Sync + 'static> MinifyLatch<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `build` unless a build already started.
    pub fn start(&self, build: impl FnOnce() -> ComputeResult<P> + Send + 'static) {
        {
            let mut state = lock(&self.inner.0);
            if !matches!(*state, LatchState::Empty) {
                return;
            }
            *state = LatchState::Building;
        }
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new().name("kiln-minify-build".into()).spawn(move || {
            let result = build();
            let (state, ready) = &*inner;
            let mut state = lock(state);
            *state = match result {
                Ok(program) => {
                    debug!("minify program ready");
                    LatchState::Ready(Arc::new(program))
                }
                Err(e) => {
                    error!(error = %e, "minify program build failed");
                    LatchState::Failed(e.to_string())
                }
            };
            ready.notify_all();
        });
        if let Err(e) = spawned {
            let (state, ready) = &*self.inner;
            *lock(state) = LatchState::Failed(format!("cannot spawn build thread: {e}"));
            ready.notify_all();
        }
    }

    /// Waits for the build with the default bound.
    pub fn wait(&self) -> ComputeResult<Arc<P>> {
        self.wait_timeout(MINIFY_POLL_INTERVAL * MINIFY_POLL_ATTEMPTS)
    }

    /// Waits at most `timeout` for the build.
    pub fn wait_timeout(&self, timeout: Duration) -> ComputeResult<Arc<P>> {
        let (state, ready) = &*self.inner;
        let state = lock(state);
        let (state, _) = ready
            .wait_timeout_while(state, timeout, |s| matches!(s, LatchState::Building))
            .unwrap_or_else(|e| e.into_inner());
        match &*state {
            LatchState::Ready(program) => Ok(Arc::clone(program)),
            LatchState::Failed(msg) => Err(ComputeError::ProgramBuild(format!("minify program: {msg}"))),
            LatchState::Building => Err(ComputeError::Timeout(format!("minify program not built after {timeout:?}"))),
            LatchState::Empty => Err(ComputeError::ProgramBuild("minify program build never started".into())),
        }
    }

    /// True once the build finished successfully.
    pub fn is_ready(&self) -> bool {
        matches!(*lock(&self.inner.0), LatchState::Ready(_))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Kernels
// =============================================================================

const BASE_TYPES: [(ImageType, &str); 9] = [
    (ImageType::IMAGE_1D, "1d"),
    (ImageType::IMAGE_2D, "2d"),
    (ImageType::IMAGE_3D, "3d"),
    (ImageType::IMAGE_1D_ARRAY, "1d_array"),
    (ImageType::IMAGE_2D_ARRAY, "2d_array"),
    (ImageType::IMAGE_CUBE, "cube"),
    (ImageType::IMAGE_CUBE_ARRAY, "cube_array"),
    (ImageType::IMAGE_DEPTH, "depth"),
    (ImageType::IMAGE_DEPTH_ARRAY, "depth_array"),
];

const DATA_TYPES: [(ImageType, &str); 3] =
    [(ImageType::FLOAT, "float"), (ImageType::INT, "int"), (ImageType::UINT, "uint")];

/// Base kinds (with data type) that get a minify kernel on `device`.
///
/// Depth kernels are dropped when the device cannot read and write depth
/// images, and always on Vulkan.
pub fn minify_base_types(device: &Device, vulkan: bool) -> Vec<ImageType> {
    let depth = device.supports_depth_minify() && !vulkan;
    BASE_TYPES
        .iter()
        .filter(|(t, _)| depth || !t.is_depth())
        .flat_map(|(t, _)| DATA_TYPES.iter().map(move |(d, _)| t.with(*d)))
        .collect()
}

/// Kernel name for an image's base kind and data type.
pub fn minify_kernel_name(t: ImageType) -> Option<String> {
    let base = t.base_type().without(ImageType::FLAG_MSAA).without(ImageType::FLAG_BUFFER);
    let (_, base_name) = BASE_TYPES.iter().find(|(b, _)| *b == base)?;
    let data_name = match t.data_type() {
        ImageDataType::Float => "float",
        ImageDataType::Int => "int",
        ImageDataType::Uint => "uint",
        ImageDataType::None => return None,
    };
    Some(format!("minify_{base_name}_{data_name}"))
}

/// Declared layout of every minify kernel.
pub fn minify_function_info(t: ImageType) -> Option<FunctionInfo> {
    let name = minify_kernel_name(t)?;
    let args = vec![
        ArgInfo::image(ArgImageType::from_image_type(t), ArgImageAccess::ReadWrite),
        ArgInfo::value(12),
        ArgInfo::value(12),
        ArgInfo::value(4),
        ArgInfo::value(4),
    ];
    Some(FunctionInfo::kernel(name, args))
}

/// Work-group size of a minify dispatch.
pub fn minify_local_size(t: ImageType, device: &Device, vulkan: bool) -> UVec3 {
    let max = device.max_total_local_size.max(1);
    if vulkan {
        return UVec3::new(max, 1, 1);
    }
    match t.dim_count() {
        1 => UVec3::new(max, 1, 1),
        2 => {
            let x = if max > 512 { 32 } else { 16 };
            let y = if max > 256 { 32 } else { 16 };
            UVec3::new(x, y, 1)
        }
        _ => {
            let x = if max > 512 { 32 } else { 16 };
            let y = if max > 256 { 16 } else { 8 };
            UVec3::new(x, y, 2)
        }
    }
}

/// `level_size` rounded up to whole work-groups.
pub fn minify_global_size(level_size: UVec3, local_size: UVec3) -> UVec3 {
    let round = |v: u32, l: u32| v.max(1).div_ceil(l.max(1)) * l.max(1);
    UVec3::new(
        round(level_size.x, local_size.x),
        round(level_size.y, local_size.y),
        round(level_size.z, local_size.z),
    )
}

/// One minify kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinifyDispatch {
    pub layer: u32,
    pub level: u32,
    pub level_size: [u32; 3],
    pub inv_prev_size: [f32; 3],
    pub global_size: UVec3,
    pub local_size: UVec3,
}

/// Every dispatch needed to rebuild the mip chain of an image.
pub fn minify_dispatches(t: ImageType, dim: glam::UVec4, device: &Device, vulkan: bool) -> Vec<MinifyDispatch> {
    let levels = t.mip_level_count(dim);
    let layers = t.layer_count(dim);
    let local_size = minify_local_size(t, device, vulkan);
    let mut dispatches = Vec::with_capacity(((levels.saturating_sub(1)) * layers) as usize);
    for layer in 0..layers {
        for level in 1..levels {
            let size = t.mip_level_dim(dim, level).max(UVec3::ONE);
            let prev = t.mip_level_dim(dim, level - 1).max(UVec3::ONE);
            dispatches.push(MinifyDispatch {
                layer,
                level,
                level_size: size.to_array(),
                inv_prev_size: [1.0 / prev.x as f32, 1.0 / prev.y as f32, 1.0 / prev.z as f32],
                global_size: minify_global_size(size, local_size),
                local_size,
            });
        }
    }
    dispatches
}

/// Rebuilds levels `1..` of every layer of `image` with the context's minify program.
pub fn run_minify(queue: &dyn Queue, image: &dyn Image, program: &dyn Program, vulkan: bool) -> ComputeResult<()> {
    let t = image.image_type();
    if !t.is_mipmapped() || image.mip_level_count() <= 1 {
        return Ok(());
    }
    if t.is_compressed() || t.is_msaa() {
        return Err(ComputeError::Unsupported(format!("cannot minify {t:?}")));
    }
    let name = minify_kernel_name(t).ok_or_else(|| ComputeError::Unsupported(format!("no minify kernel for {t:?}")))?;
    let function = program.function(&name).ok_or_else(|| ComputeError::FunctionNotFound(name.clone()))?;

    let dispatches = minify_dispatches(t, image.dim(), queue.device(), vulkan);
    let last = dispatches.len().saturating_sub(1);
    for (i, d) in dispatches.iter().enumerate() {
        let args = [
            KernelArg::Image(image),
            KernelArg::value(&d.level_size),
            KernelArg::value(&d.inv_prev_size),
            KernelArg::value(&d.level),
            KernelArg::value(&d.layer),
        ];
        let mut params = LaunchParams::new(d.global_size, d.local_size, &args);
        params.submit.blocking = i == last;
        params.submit.debug_label = Some("minify");
        trace!(kernel = %name, layer = d.layer, level = d.level, "minify dispatch");
        queue.execute(function.as_ref(), &params)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec4;

    #[test]
    fn test_base_types() {
        let full = Device { image_depth_support: true, image_depth_write_support: true, ..Default::default() };
        assert_eq!(minify_base_types(&full, false).len(), 27);
        assert_eq!(minify_base_types(&full, true).len(), 21);
        assert_eq!(minify_base_types(&Device::default(), false).len(), 21);
    }

    #[test]
    fn test_kernel_names() {
        assert_eq!(minify_kernel_name(ImageType::RGBA8UI_NORM).as_deref(), Some("minify_2d_uint"));
        assert_eq!(minify_kernel_name(ImageType::D32F).as_deref(), Some("minify_depth_float"));
        let cube = ImageType::IMAGE_CUBE_ARRAY | ImageType::INT | ImageType::CHANNELS_1 | ImageType::FORMAT_8;
        assert_eq!(minify_kernel_name(cube).as_deref(), Some("minify_cube_array_int"));
    }

    #[test]
    fn test_local_size() {
        let big = Device { max_total_local_size: 1024, ..Default::default() };
        let small = Device { max_total_local_size: 256, ..Default::default() };
        assert_eq!(minify_local_size(ImageType::RGBA8UI_NORM, &big, false), UVec3::new(32, 32, 1));
        assert_eq!(minify_local_size(ImageType::RGBA8UI_NORM, &small, false), UVec3::new(16, 16, 1));
        let t3 = ImageType::IMAGE_3D | ImageType::FLOAT | ImageType::FORMAT_32 | ImageType::CHANNELS_1;
        assert_eq!(minify_local_size(t3, &big, false), UVec3::new(32, 16, 2));
        assert_eq!(minify_local_size(t3, &small, false), UVec3::new(16, 8, 2));
        assert_eq!(minify_local_size(ImageType::RGBA8UI_NORM, &big, true), UVec3::new(1024, 1, 1));
        assert_eq!(minify_global_size(UVec3::new(100, 3, 0), UVec3::new(32, 32, 1)), UVec3::new(128, 32, 1));
    }

    #[test]
    fn test_dispatches() {
        let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED | ImageType::FLAG_ARRAY;
        let device = Device { max_total_local_size: 1024, ..Default::default() };
        let d = minify_dispatches(t, UVec4::new(8, 8, 2, 0), &device, false);
        // 4 levels, 2 layers
        assert_eq!(d.len(), 6);
        assert_eq!(d[0].level_size, [4, 4, 1]);
        assert_eq!(d[0].inv_prev_size[0], 0.125);
        assert_eq!(d[5].layer, 1);
        assert_eq!(d[5].level, 3);
    }

    #[test]
    fn test_latch() {
        let latch = MinifyLatch::<u32>::new();
        assert!(latch.wait_timeout(Duration::from_millis(1)).is_err());
        latch.start(|| {
            thread::sleep(Duration::from_millis(20));
            Ok(7)
        });
        latch.start(|| Ok(8));
        assert_eq!(*latch.wait().unwrap(), 7);
        assert!(latch.is_ready());

        let failing = MinifyLatch::<u32>::new();
        failing.start(|| Err(ComputeError::ProgramBuild("nope".into())));
        assert!(matches!(failing.wait(), Err(ComputeError::ProgramBuild(_))));
    }
}
