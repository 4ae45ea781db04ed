//! Host kernels.
//!
//! On the host backend a kernel is a Rust closure registered under the name
//! a program refers to. Programs resolve their function infos against the
//! [`HostKernelRegistry`] of their context. Built-in minify kernels cover
//! uncompressed 8/16/32-bit INT, UINT and FLOAT images.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use glam::{UVec3, UVec4};
use half::f16;
use kiln_core::{Device, FunctionInfo, ImageDataType, ImageType};
use rayon::prelude::*;

use super::host_backend::{HostBuffer, HostImage};
use super::minify::{minify_base_types, minify_function_info};
use super::queue::KernelArg;
use super::resource::{Image, image_level_size, image_offset};
use crate::{ComputeError, ComputeResult};

/// Arguments and sizes of one host kernel launch.
pub struct HostLaunch<'a> {
    pub device: &'a Device,
    pub global_size: UVec3,
    pub local_size: UVec3,
    args: &'a [KernelArg<'a>],
}

impl<'a> HostLaunch<'a> {
    pub(crate) fn new(device: &'a Device, global_size: UVec3, local_size: UVec3, args: &'a [KernelArg<'a>]) -> Self {
        Self { device, global_size, local_size, args }
    }

    pub fn args(&self) -> &[KernelArg<'a>] {
        self.args
    }

    /// Total work items.
    pub fn work_items(&self) -> u64 {
        let g = self.global_size.max(UVec3::ONE);
        g.x as u64 * g.y as u64 * g.z as u64
    }

    /// Buffer argument `index`.
    pub fn buffer(&self, index: usize) -> ComputeResult<&'a HostBuffer> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(buffer)) => buffer
                .as_any()
                .downcast_ref::<HostBuffer>()
                .ok_or_else(|| ComputeError::InvalidArgument(format!("argument {index} is not a host buffer"))),
            _ => Err(ComputeError::InvalidArgument(format!("argument {index} is not a buffer"))),
        }
    }

    /// Image argument `index`.
    pub fn image(&self, index: usize) -> ComputeResult<&'a HostImage> {
        match self.args.get(index) {
            Some(KernelArg::Image(image)) => image
                .as_any()
                .downcast_ref::<HostImage>()
                .ok_or_else(|| ComputeError::InvalidArgument(format!("argument {index} is not a host image"))),
            _ => Err(ComputeError::InvalidArgument(format!("argument {index} is not an image"))),
        }
    }

    /// By-value argument `index`.
    pub fn value<T: bytemuck::Pod>(&self, index: usize) -> ComputeResult<T> {
        match self.args.get(index) {
            Some(KernelArg::Bytes(bytes)) => bytemuck::try_pod_read_unaligned(bytes).map_err(|_| {
                ComputeError::SizeMismatch { expected: size_of::<T>() as u64, actual: bytes.len() as u64 }
            }),
            _ => Err(ComputeError::InvalidArgument(format!("argument {index} is not a value"))),
        }
    }
}

/// Host kernel body.
pub type HostKernel = Arc<dyn Fn(&HostLaunch<'_>) -> ComputeResult<()> + Send + Sync>;

/// Name -> (declared layout, body) map shared by a host context and its programs.
#[derive(Clone, Default)]
pub struct HostKernelRegistry {
    kernels: Arc<RwLock<HashMap<String, (FunctionInfo, HostKernel)>>>,
}

impl HostKernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the minify kernels `device` supports.
    pub fn with_minify(device: &Device) -> Self {
        let registry = Self::new();
        for t in minify_base_types(device, false) {
            if let Some(info) = minify_function_info(t) {
                registry.register(info, minify_kernel);
            }
        }
        registry
    }

    /// Registers (or replaces) a kernel under `info.name`.
    pub fn register(&self, info: FunctionInfo, kernel: impl Fn(&HostLaunch<'_>) -> ComputeResult<()> + Send + Sync + 'static) {
        let name = info.name.clone();
        self.write().insert(name, (info, Arc::new(kernel)));
    }

    pub fn get(&self, name: &str) -> Option<(FunctionInfo, HostKernel)> {
        self.read().get(name).map(|(info, kernel)| (info.clone(), Arc::clone(kernel)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Declared layouts of every registered kernel, sorted by name.
    pub fn function_infos(&self) -> Vec<FunctionInfo> {
        let mut infos: Vec<FunctionInfo> = self.read().values().map(|(info, _)| info.clone()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, (FunctionInfo, HostKernel)>> {
        self.kernels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, (FunctionInfo, HostKernel)>> {
        self.kernels.write().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Minify
// =============================================================================

fn minify_kernel(launch: &HostLaunch<'_>) -> ComputeResult<()> {
    let image = launch.image(0)?;
    let level: u32 = launch.value(3)?;
    let layer: u32 = launch.value(4)?;
    let (t, dim) = (image.image_type(), image.dim());
    image.with_data_mut(|data| minify_level(t, dim, data, layer, level))
}

#[derive(Debug, Clone, Copy)]
enum Component {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F16,
    F32,
}

impl Component {
    fn of(t: ImageType) -> Option<Self> {
        match (t.data_type(), t.format().component_bits()?) {
            (ImageDataType::Uint, 8) => Some(Self::U8),
            (ImageDataType::Int, 8) => Some(Self::I8),
            (ImageDataType::Uint, 16) => Some(Self::U16),
            (ImageDataType::Int, 16) => Some(Self::I16),
            (ImageDataType::Uint, 32) => Some(Self::U32),
            (ImageDataType::Int, 32) => Some(Self::I32),
            (ImageDataType::Float, 16) => Some(Self::F16),
            (ImageDataType::Float, 32) => Some(Self::F32),
            _ => None,
        }
    }

    fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 | Self::F16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
        }
    }

    fn read(self, b: &[u8]) -> f64 {
        match self {
            Self::U8 => b[0] as f64,
            Self::I8 => b[0] as i8 as f64,
            Self::U16 => u16::from_le_bytes([b[0], b[1]]) as f64,
            Self::I16 => i16::from_le_bytes([b[0], b[1]]) as f64,
            Self::U32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Self::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Self::F16 => f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f64(),
            Self::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
        }
    }

    fn write(self, v: f64, out: &mut [u8]) {
        // float-to-int `as` casts saturate
        match self {
            Self::U8 => out[0] = v.round() as u8,
            Self::I8 => out[0] = (v.round() as i8) as u8,
            Self::U16 => out[..2].copy_from_slice(&(v.round() as u16).to_le_bytes()),
            Self::I16 => out[..2].copy_from_slice(&(v.round() as i16).to_le_bytes()),
            Self::U32 => out[..4].copy_from_slice(&(v.round() as u32).to_le_bytes()),
            Self::I32 => out[..4].copy_from_slice(&(v.round() as i32).to_le_bytes()),
            Self::F16 => out[..2].copy_from_slice(&f16::from_f64(v).to_bits().to_le_bytes()),
            Self::F32 => out[..4].copy_from_slice(&(v as f32).to_le_bytes()),
        }
    }
}

/// Box-filters `level - 1` of `layer` into `level` (2x2, or 2x2x2 for 3D).
pub(crate) fn minify_level(t: ImageType, dim: UVec4, data: &mut [u8], layer: u32, level: u32) -> ComputeResult<()> {
    if level == 0 || level >= t.mip_level_count(dim) || layer >= t.layer_count(dim) {
        return Err(ComputeError::InvalidArgument(format!("no level {level} / layer {layer} to minify")));
    }
    if t.is_compressed() {
        return Err(ComputeError::Unsupported("host minify of compressed images".into()));
    }
    let comp = Component::of(t)
        .ok_or_else(|| ComputeError::Unsupported(format!("host minify of {:?}/{:?}", t.data_type(), t.format())))?;
    let (csize, channels) = (comp.size(), t.channel_count() as usize);
    let texel = csize * channels;

    let prev = t.mip_level_dim(dim, level - 1).max(UVec3::ONE);
    let cur = t.mip_level_dim(dim, level).max(UVec3::ONE);
    let prev_offset = image_offset(t, dim, layer, level - 1) as usize;
    let cur_offset = image_offset(t, dim, layer, level) as usize;
    let prev_len = image_level_size(t, dim, level - 1) as usize;
    let cur_len = image_level_size(t, dim, level) as usize;
    if cur_offset + cur_len > data.len() {
        return Err(ComputeError::SizeMismatch { expected: (cur_offset + cur_len) as u64, actual: data.len() as u64 });
    }

    let (head, tail) = data.split_at_mut(cur_offset);
    let src = &head[prev_offset..prev_offset + prev_len];
    let dst = &mut tail[..cur_len];

    let taps_y = if t.dim_count() >= 2 { 2 } else { 1 };
    let taps_z = if t.dim_count() >= 3 { 2 } else { 1 };
    let row_bytes = cur.x as usize * texel;

    dst.par_chunks_mut(row_bytes).enumerate().for_each(|(row, out)| {
        let y = row as u32 % cur.y;
        let z = row as u32 / cur.y;
        for x in 0..cur.x {
            for ch in 0..channels {
                let mut sum = 0.0;
                let mut taps = 0u32;
                for dz in 0..taps_z {
                    for dy in 0..taps_y {
                        for dx in 0..2 {
                            let sx = (2 * x + dx).min(prev.x - 1) as usize;
                            let sy = (2 * y + dy).min(prev.y - 1) as usize;
                            let sz = (2 * z + dz).min(prev.z - 1) as usize;
                            let at = ((sz * prev.y as usize + sy) * prev.x as usize + sx) * texel + ch * csize;
                            sum += comp.read(&src[at..at + csize]);
                            taps += 1;
                        }
                    }
                }
                let at = x as usize * texel + ch * csize;
                comp.write(sum / taps as f64, &mut out[at..at + csize]);
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_minify_rgba8() {
        let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED;
        let dim = UVec4::new(4, 4, 0, 0);
        let mut data = vec![0u8; t.data_size(dim, false) as usize];
        // level 0: columns 0,1 = 10, columns 2,3 = 30
        for (i, texel) in data[..64].chunks_mut(4).enumerate() {
            texel.fill(if i % 4 < 2 { 10 } else { 30 });
        }
        minify_level(t, dim, &mut data, 0, 1).unwrap();
        minify_level(t, dim, &mut data, 0, 2).unwrap();
        assert_eq!(&data[64..72], &[10, 10, 10, 10, 30, 30, 30, 30]);
        assert_eq!(&data[80..84], &[20, 20, 20, 20]);
    }

    #[test]
    fn test_minify_half_float() {
        let t = ImageType::IMAGE_1D | ImageType::CHANNELS_1 | ImageType::FORMAT_16 | ImageType::FLOAT
            | ImageType::FLAG_MIPMAPPED;
        let dim = UVec4::new(2, 0, 0, 0);
        let mut data = vec![0u8; t.data_size(dim, false) as usize];
        data[0..2].copy_from_slice(&f16::from_f32(1.0).to_bits().to_le_bytes());
        data[2..4].copy_from_slice(&f16::from_f32(2.0).to_bits().to_le_bytes());
        minify_level(t, dim, &mut data, 0, 1).unwrap();
        let v = f16::from_bits(u16::from_le_bytes([data[4], data[5]])).to_f32();
        assert_relative_eq!(v, 1.5);
    }

    #[test]
    fn test_minify_rejects_bad_level() {
        let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED;
        let dim = UVec4::new(4, 4, 0, 0);
        let mut data = vec![0u8; t.data_size(dim, false) as usize];
        assert!(minify_level(t, dim, &mut data, 0, 0).is_err());
        assert!(minify_level(t, dim, &mut data, 0, 3).is_err());
        assert!(minify_level(t, dim, &mut data, 1, 1).is_err());
    }

    #[test]
    fn test_registry_minify_kernels() {
        let device = Device::default();
        let registry = HostKernelRegistry::with_minify(&device);
        assert_eq!(registry.len(), 21);
        assert!(registry.contains("minify_2d_uint"));
        assert!(!registry.contains("minify_depth_float"));
        let infos = registry.function_infos();
        assert!(infos.windows(2).all(|w| w[0].name < w[1].name));
    }
}
