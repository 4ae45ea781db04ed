//! Image type to native format mapping.
//!
//! One table drives every backend: `(data type, compression, format)` picks
//! the native channel format, the channel count the native descriptor uses,
//! and whether reads are normalized.

use glam::{UVec3, UVec4};
use kiln_core::{ImageCompression, ImageDataType, ImageFormat, ImageType};

use super::resource::image_level_size;

/// Per-channel storage of a native image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelFormat {
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    F16,
    F32,
    Bc1,
    Bc2,
    Bc3,
    Bc4U,
    Bc4S,
    Bc5U,
    Bc5S,
    Bc6hU,
    Bc6hS,
    Bc7,
}

impl ChannelFormat {
    pub fn is_compressed(self) -> bool {
        !matches!(
            self,
            Self::U8 | Self::S8 | Self::U16 | Self::S16 | Self::U32 | Self::S32 | Self::F16 | Self::F32
        )
    }

    /// Bytes of one channel (0 for block formats).
    pub fn channel_bytes(self) -> u32 {
        match self {
            Self::U8 | Self::S8 => 1,
            Self::U16 | Self::S16 | Self::F16 => 2,
            Self::U32 | Self::S32 | Self::F32 => 4,
            _ => 0,
        }
    }
}

/// Native description of an image type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeFormat {
    pub channel: ChannelFormat,
    /// Channel count of the native descriptor.
    pub channels: u32,
    /// Integer data reads as [0, 1] / [-1, 1].
    pub normalized: bool,
    pub srgb: bool,
}

/// Channel count the native descriptor of a block-compressed type reports.
///
/// BC1 to BC4 report 2 channels, BC5 to BC7 report 4, whatever the type's own
/// count is. Uncompressed types keep their count.
pub fn compressed_channel_count(t: ImageType) -> u32 {
    match t.compression() {
        ImageCompression::Bc1 | ImageCompression::Bc2 | ImageCompression::Bc3 => 2,
        ImageCompression::Rgtc if t.channel_count() == 1 => 2,
        ImageCompression::Rgtc | ImageCompression::Bptc => 4,
        _ => t.channel_count(),
    }
}

/// Maps `t` to its native format, `None` if no backend can hold it.
pub fn native_format(t: ImageType) -> Option<NativeFormat> {
    let data_type = t.data_type();
    let normalized = t.has(ImageType::FLAG_NORMALIZED);
    let srgb = t.has(ImageType::FLAG_SRGB);
    let signed = data_type == ImageDataType::Int;

    let channel = match t.compression() {
        ImageCompression::None => match (data_type, t.format()) {
            (ImageDataType::Uint, ImageFormat::F8) => ChannelFormat::U8,
            (ImageDataType::Int, ImageFormat::F8) => ChannelFormat::S8,
            (ImageDataType::Uint, ImageFormat::F16) => ChannelFormat::U16,
            (ImageDataType::Int, ImageFormat::F16) => ChannelFormat::S16,
            (ImageDataType::Uint, ImageFormat::F32 | ImageFormat::F24 | ImageFormat::F24_8) => ChannelFormat::U32,
            (ImageDataType::Int, ImageFormat::F32) => ChannelFormat::S32,
            (ImageDataType::Float, ImageFormat::F16) => ChannelFormat::F16,
            (ImageDataType::Float, ImageFormat::F32) => ChannelFormat::F32,
            _ => return None,
        },
        ImageCompression::Bc1 => ChannelFormat::Bc1,
        ImageCompression::Bc2 => ChannelFormat::Bc2,
        ImageCompression::Bc3 => ChannelFormat::Bc3,
        ImageCompression::Rgtc => match (t.channel_count(), signed) {
            (1, false) => ChannelFormat::Bc4U,
            (1, true) => ChannelFormat::Bc4S,
            (_, false) => ChannelFormat::Bc5U,
            (_, true) => ChannelFormat::Bc5S,
        },
        // BC6H is the float flavour, NORMALIZED marks the unsigned variant
        ImageCompression::Bptc if data_type == ImageDataType::Float => {
            if normalized { ChannelFormat::Bc6hU } else { ChannelFormat::Bc6hS }
        }
        ImageCompression::Bptc => ChannelFormat::Bc7,
        _ => return None,
    };

    let channels = if t.format() == ImageFormat::F24_8 { 1 } else { compressed_channel_count(t) };
    Some(NativeFormat { channel, channels, normalized: normalized && !channel.is_compressed(), srgb })
}

/// Cube face order of host-side data.
pub const HOST_CUBE_FACES: [&str; 6] = ["+X", "+Y", "+Z", "-X", "-Y", "-Z"];

/// Native layer of host cube layer `layer`.
///
/// Host data stores the faces of each cube as {+X, +Y, +Z, -X, -Y, -Z};
/// CUDA and Vulkan expect {+X, -X, +Y, -Y, +Z, -Z}. Non-cube layers map to
/// themselves.
pub fn native_layer(t: ImageType, layer: u32) -> u32 {
    if !t.is_cube() {
        return layer;
    }
    const TO_NATIVE: [u32; 6] = [0, 2, 4, 1, 3, 5];
    (layer / 6) * 6 + TO_NATIVE[(layer % 6) as usize]
}

/// Depth of the native descriptor: `dim.z` for 3D, the layer count for
/// arrays and cubes, 0 otherwise.
pub fn native_depth(t: ImageType, dim: UVec4) -> u32 {
    if t.dim_count() == 3 {
        dim.z.max(1)
    } else if t.is_array() || t.is_cube() {
        t.layer_count(dim)
    } else {
        0
    }
}

/// Byte rows of one layer of `level` as a native copy sees them:
/// `(row_bytes, rows, slices)`. Compressed types count rows of 4x4 blocks.
pub fn copy_extent(t: ImageType, dim: UVec4, level: u32) -> (u64, u32, u32) {
    let size = t.mip_level_dim(dim, level).max(UVec3::ONE);
    let level_bytes = image_level_size(t, dim, level);
    let rows = if t.is_compressed() { size.y.div_ceil(4) } else { size.y };
    let slices = if t.dim_count() == 3 { size.z } else { 1 };
    let row_bytes = level_bytes / (rows as u64 * slices as u64).max(1);
    (row_bytes, rows, slices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncompressed() {
        let f = native_format(ImageType::RGBA8UI_NORM).unwrap();
        assert_eq!(f.channel, ChannelFormat::U8);
        assert_eq!(f.channels, 4);
        assert!(f.normalized);
        assert_eq!(native_format(ImageType::RGBA32F).map(|f| f.channel), Some(ChannelFormat::F32));
        assert!(native_format(ImageType::RGBA8UI_NORM.with_format(ImageFormat::F64)).is_none());
    }

    #[test]
    fn test_compressed_channel_rewrites() {
        assert_eq!(compressed_channel_count(ImageType::BC1_RGBA), 2);
        assert_eq!(compressed_channel_count(ImageType::BC7_RGBA), 4);
        assert_eq!(compressed_channel_count(ImageType::BC6H_RGBHF), 4);
        let bc4 = ImageType::IMAGE_2D
            | ImageType::COMPRESSION_RGTC
            | ImageType::CHANNELS_1
            | ImageType::FORMAT_8
            | ImageType::UINT;
        assert_eq!(compressed_channel_count(bc4), 2);
        assert_eq!(native_format(bc4).map(|f| f.channel), Some(ChannelFormat::Bc4U));
    }

    #[test]
    fn test_cube_faces() {
        let cube = ImageType::IMAGE_CUBE | ImageType::CHANNELS_4 | ImageType::FORMAT_8 | ImageType::UINT;
        let native: Vec<u32> = (0..12).map(|l| native_layer(cube, l)).collect();
        assert_eq!(native, vec![0, 2, 4, 1, 3, 5, 6, 8, 10, 7, 9, 11]);
        assert_eq!(native_layer(ImageType::RGBA8UI_NORM, 3), 3);
        assert_eq!(native_depth(cube, UVec4::new(16, 16, 0, 0)), 6);
        assert_eq!(native_depth(ImageType::RGBA8UI_NORM, UVec4::new(16, 16, 0, 0)), 0);
    }

    #[test]
    fn test_copy_extent() {
        let dim = UVec4::new(16, 8, 0, 0);
        assert_eq!(copy_extent(ImageType::RGBA8UI_NORM, dim, 0), (64, 8, 1));
        // 4x2 blocks of 8 bytes
        assert_eq!(copy_extent(ImageType::BC1_RGBA, dim, 0), (32, 2, 1));
    }

    #[test]
    fn test_bc6h_signedness() {
        assert_eq!(native_format(ImageType::BC6H_RGBHF).map(|f| f.channel), Some(ChannelFormat::Bc6hS));
        assert_eq!(native_format(ImageType::BC6H_RGBUHF).map(|f| f.channel), Some(ChannelFormat::Bc6hU));
    }
}
