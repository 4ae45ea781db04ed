//! Buffer and image interfaces.
//!
//! Common memory-object contract:
//!
//! - creation allocates native storage and, unless `NO_INITIAL_COPY` is set,
//!   copies the optional host data in
//! - `map` allocates 128 B aligned staging memory, reading device contents
//!   first when `MapFlag::READ` is set (after `finish` with `BLOCK`)
//! - `unmap` writes the staging bytes back for `WRITE`/`WRITE_INVALIDATE`
//!   and regenerates the mip chain of `GENERATE_MIP_MAPS` images
//!
//! Image storage is layer-major: each layer holds its full mip chain
//! (level 0 first), layers follow each other.

use glam::UVec4;
use kiln_core::{Device, DeviceId, ImageType, MapFlag, MemoryFlag};

use super::context::AsAny;
use super::memory::Mapping;
use super::queue::Queue;
use crate::{ComputeError, ComputeResult};

/// Buffer creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    /// Size in bytes.
    pub size: u64,
    pub flags: MemoryFlag,
    /// Initial contents (at most `size` bytes).
    pub host_data: Option<&'a [u8]>,
}

impl<'a> BufferDesc<'a> {
    /// `size` bytes with default flags (device + host read/write).
    pub fn new(size: u64) -> Self {
        Self { size, flags: MemoryFlag::default(), host_data: None }
    }

    /// Buffer sized and initialized from `data`.
    pub fn from_data(data: &'a [u8]) -> Self {
        Self { size: data.len() as u64, flags: MemoryFlag::default(), host_data: Some(data) }
    }

    pub fn with_flags(mut self, flags: MemoryFlag) -> Self {
        self.flags = flags;
        self
    }

    /// Checks size and host data.
    pub fn validate(&self) -> ComputeResult<()> {
        if self.size == 0 {
            return Err(ComputeError::BufferCreation("zero-sized buffer".into()));
        }
        if let Some(data) = self.host_data {
            if data.len() as u64 > self.size {
                return Err(ComputeError::SizeMismatch { expected: self.size, actual: data.len() as u64 });
            }
        }
        Ok(())
    }

    /// Host data to upload at creation, honoring `NO_INITIAL_COPY`.
    pub fn initial_data(&self) -> Option<&'a [u8]> {
        self.host_data.filter(|_| !self.flags.contains(MemoryFlag::NO_INITIAL_COPY))
    }
}

/// Image creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    /// Extent; the array layer count sits in the first component the
    /// dimensionality does not use.
    pub dim: UVec4,
    pub image_type: ImageType,
    pub flags: MemoryFlag,
    /// Initial contents, exactly `image_type.data_size(dim, false)` bytes.
    pub host_data: Option<&'a [u8]>,
}

impl<'a> ImageDesc<'a> {
    pub fn new(dim: UVec4, image_type: ImageType) -> Self {
        Self { dim, image_type, flags: MemoryFlag::default(), host_data: None }
    }

    pub fn with_flags(mut self, flags: MemoryFlag) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_data(mut self, data: &'a [u8]) -> Self {
        self.host_data = Some(data);
        self
    }

    /// Byte size of the whole image including every level and layer.
    pub fn data_size(&self) -> u64 {
        self.image_type.data_size(self.dim, false)
    }

    /// Validates the type against the extent and the host data size.
    pub fn validate(&self) -> ComputeResult<()> {
        self.image_type.validate(self.dim)?;
        if let Some(data) = self.host_data {
            let expected = self.data_size();
            if data.len() as u64 != expected {
                return Err(ComputeError::SizeMismatch { expected, actual: data.len() as u64 });
            }
        }
        Ok(())
    }

    /// Host data to upload at creation, honoring `NO_INITIAL_COPY`.
    pub fn initial_data(&self) -> Option<&'a [u8]> {
        self.host_data.filter(|_| !self.flags.contains(MemoryFlag::NO_INITIAL_COPY))
    }
}

/// Rejects image types the device cannot create.
pub fn check_image_support(device: &Device, t: ImageType) -> ComputeResult<()> {
    let checks = [
        (true, device.image_support, "images"),
        (t.is_depth(), device.image_depth_support, "depth images"),
        (t.is_depth() && t.is_writable(), device.image_depth_write_support, "writable depth images"),
        (t.is_msaa(), device.image_msaa_support, "MSAA images"),
        (t.is_msaa() && t.is_array(), device.image_msaa_array_support, "MSAA array images"),
        (t.is_cube(), device.image_cube_support, "cube images"),
        (t.is_cube() && t.is_array(), device.image_cube_array_support, "cube array images"),
        (t.is_mipmapped(), device.image_mipmap_support, "mip-mapped images"),
    ];
    for (needed, supported, what) in checks {
        if needed && !supported {
            return Err(ComputeError::Unsupported(format!("{} does not support {what}", device.name)));
        }
    }
    Ok(())
}

/// Byte offset of (`layer`, `level`) in layer-major image storage.
pub fn image_offset(t: ImageType, dim: UVec4, layer: u32, level: u32) -> u64 {
    let layers = t.layer_count(dim).max(1) as u64;
    let layer_size = t.data_size(dim, false) / layers;
    layer as u64 * layer_size + t.mip_level_offset(dim, level)
}

/// Byte size of one layer of `level`.
pub fn image_level_size(t: ImageType, dim: UVec4, level: u32) -> u64 {
    t.mip_level_offset(dim, level + 1) - t.mip_level_offset(dim, level)
}

/// Checks `offset + len <= size`.
pub(crate) fn check_range(size: u64, offset: u64, len: u64) -> ComputeResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(ComputeError::InvalidArgument(format!("range {offset}+{len} exceeds {size} bytes"))),
    }
}

/// Device memory buffer.
pub trait Buffer: Send + Sync + AsAny {
    /// Size in bytes.
    fn size(&self) -> u64;

    fn flags(&self) -> MemoryFlag;

    /// Device the memory lives on.
    fn device_id(&self) -> DeviceId;

    /// Copies `dst.len()` bytes starting at `offset` to the host.
    fn read(&self, queue: &dyn Queue, dst: &mut [u8], offset: u64) -> ComputeResult<()>;

    /// Copies `src` to the device starting at `offset`.
    fn write(&self, queue: &dyn Queue, src: &[u8], offset: u64) -> ComputeResult<()>;

    /// Device-side copy from another buffer of the same backend.
    fn copy(&self, queue: &dyn Queue, src: &dyn Buffer, size: u64, src_offset: u64, dst_offset: u64)
    -> ComputeResult<()>;

    /// Repeats `pattern` over `size` bytes at `offset` (`size` must be a multiple of the pattern).
    fn fill(&self, queue: &dyn Queue, pattern: &[u8], offset: u64, size: u64) -> ComputeResult<()>;

    /// Fills the whole buffer with zeros.
    fn zero(&self, queue: &dyn Queue) -> ComputeResult<()> {
        self.fill(queue, &[0], 0, self.size())
    }

    /// Maps `size` bytes at `offset` (`size == 0` maps to the end).
    fn map(&self, queue: &dyn Queue, flags: MapFlag, offset: u64, size: u64) -> ComputeResult<Mapping>;

    /// Finishes a mapping created by [`map`](Self::map) on this buffer.
    fn unmap(&self, queue: &dyn Queue, mapping: Mapping) -> ComputeResult<()>;
}

/// Device image.
pub trait Image: Send + Sync + AsAny {
    fn image_type(&self) -> ImageType;

    fn dim(&self) -> UVec4;

    fn flags(&self) -> MemoryFlag;

    /// Device the memory lives on.
    fn device_id(&self) -> DeviceId;

    fn mip_level_count(&self) -> u32 {
        self.image_type().mip_level_count(self.dim())
    }

    fn layer_count(&self) -> u32 {
        self.image_type().layer_count(self.dim())
    }

    /// Byte size of all levels and layers.
    fn data_size(&self) -> u64 {
        self.image_type().data_size(self.dim(), false)
    }

    /// Fills every level and layer with zeros.
    fn zero(&self, queue: &dyn Queue) -> ComputeResult<()>;

    /// Maps the whole image (layer-major, full mip chains).
    fn map(&self, queue: &dyn Queue, flags: MapFlag) -> ComputeResult<Mapping>;

    /// Finishes a mapping; regenerates mips for `GENERATE_MIP_MAPS` images after writes.
    fn unmap(&self, queue: &dyn Queue, mapping: Mapping) -> ComputeResult<()>;

    /// Rebuilds levels 1.. of every layer from level 0.
    fn generate_mip_map_chain(&self, queue: &dyn Queue) -> ComputeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_desc() {
        assert!(BufferDesc::new(0).validate().is_err());
        let data = [1u8; 8];
        let desc = BufferDesc { size: 4, ..BufferDesc::from_data(&data) };
        assert!(matches!(desc.validate(), Err(ComputeError::SizeMismatch { expected: 4, actual: 8 })));
        let desc = BufferDesc::from_data(&data).with_flags(MemoryFlag::default() | MemoryFlag::NO_INITIAL_COPY);
        assert!(desc.initial_data().is_none());
    }

    #[test]
    fn test_image_offsets() {
        let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED | ImageType::FLAG_ARRAY;
        let dim = UVec4::new(4, 4, 2, 0);
        // per layer: 64 + 16 + 4
        assert_eq!(image_offset(t, dim, 0, 0), 0);
        assert_eq!(image_offset(t, dim, 0, 2), 80);
        assert_eq!(image_offset(t, dim, 1, 1), 84 + 64);
        assert_eq!(image_level_size(t, dim, 1), 16);
    }

    #[test]
    fn test_image_support_gating() {
        let device = Device { name: "plain".into(), image_support: true, ..Default::default() };
        assert!(check_image_support(&device, ImageType::RGBA8UI_NORM).is_ok());
        assert!(check_image_support(&device, ImageType::D32F).is_err());
        let cube = ImageType::IMAGE_CUBE | ImageType::CHANNELS_4 | ImageType::FORMAT_8 | ImageType::UINT;
        assert!(check_image_support(&device, cube).is_err());
    }
}
