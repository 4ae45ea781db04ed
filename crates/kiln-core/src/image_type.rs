//! Bit-packed image type descriptor.
//!
//! An [`ImageType`] is a single `u64` classifying an image: dimensionality,
//! channel layout and count, pixel format, block compression, data type,
//! multi-sampling, mip-mapping, array/cube-ness, depth/stencil usage and
//! access mode. Every backend derives allocation sizes, upload strides,
//! mip-level iteration and capability gating from this word plus a `UVec4`
//! extent, so all derivations here are pure.
//!
//! # Layout
//!
//! ```text
//! bits  0.. 5  format            (FORMAT_*)
//! bits  6.. 9  compression       (COMPRESSION_*)
//! bits 10..11  access            (READ / WRITE / READ_WRITE)
//! bits 12..13  data type         (INT / UINT / FLOAT)
//! bits 14..15  channel count - 1
//! bits 16..17  dimensionality    (1D / 2D / 3D)
//! bits 18..19  layout            (RGBA / BGRA / ABGR / ARGB)
//! bits 20..31  flags             (ARRAY .. SRGB)
//! bits 32..34  log2(sample count)
//! bits 35..37  log2(anisotropy)
//! bits 60..63  extended flags    (TRANSIENT)
//! ```
//!
//! # Example
//!
//! ```rust
//! use glam::UVec4;
//! use kiln_core::ImageType;
//!
//! let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED;
//! let dim = UVec4::new(256, 256, 0, 0);
//! assert_eq!(t.mip_level_count(dim), 9);
//! assert_eq!(t.channel_count(), 4);
//! ```

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

use glam::{UVec3, UVec4};

use crate::error::{Error, Result};

/// Bit-packed image classification word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ImageType(u64);

// Field shifts and masks
const FORMAT_SHIFT: u32 = 0;
const FORMAT_MASK: u64 = 0x3F;
const COMPRESSION_SHIFT: u32 = 6;
const COMPRESSION_MASK: u64 = 0xF << COMPRESSION_SHIFT;
const ACCESS_SHIFT: u32 = 10;
const ACCESS_MASK: u64 = 0x3 << ACCESS_SHIFT;
const DATA_TYPE_SHIFT: u32 = 12;
const DATA_TYPE_MASK: u64 = 0x3 << DATA_TYPE_SHIFT;
const CHANNELS_SHIFT: u32 = 14;
const CHANNELS_MASK: u64 = 0x3 << CHANNELS_SHIFT;
const DIM_SHIFT: u32 = 16;
const DIM_MASK: u64 = 0x3 << DIM_SHIFT;
const LAYOUT_SHIFT: u32 = 18;
const LAYOUT_MASK: u64 = 0x3 << LAYOUT_SHIFT;
const SAMPLE_COUNT_SHIFT: u32 = 32;
const SAMPLE_COUNT_MASK: u64 = 0x7 << SAMPLE_COUNT_SHIFT;
const ANISOTROPY_SHIFT: u32 = 35;
const ANISOTROPY_MASK: u64 = 0x7 << ANISOTROPY_SHIFT;

/// Pixel format (bits 0..5). Names give the per-channel bit layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ImageFormat {
    None = 0,
    F1 = 1,
    F2 = 2,
    F3_3_2 = 3,
    F4 = 4,
    F4_2_0 = 5,
    F4_1_1 = 6,
    F4_2_2 = 7,
    F5_5_5 = 8,
    F5_5_5A1 = 9,
    F5_6_5 = 10,
    F8 = 11,
    F9_9_9Exp5 = 12,
    F10 = 13,
    F10_10_10A2 = 14,
    F11_11_10 = 15,
    F12_12_12 = 16,
    F12_12_12_12 = 17,
    F16 = 18,
    F16_8 = 19,
    F24 = 20,
    F24_8 = 21,
    F32 = 22,
    F32_8 = 23,
    F64 = 24,
}

impl ImageFormat {
    const ALL: [ImageFormat; 25] = [
        Self::None, Self::F1, Self::F2, Self::F3_3_2, Self::F4, Self::F4_2_0, Self::F4_1_1,
        Self::F4_2_2, Self::F5_5_5, Self::F5_5_5A1, Self::F5_6_5, Self::F8, Self::F9_9_9Exp5,
        Self::F10, Self::F10_10_10A2, Self::F11_11_10, Self::F12_12_12, Self::F12_12_12_12,
        Self::F16, Self::F16_8, Self::F24, Self::F24_8, Self::F32, Self::F32_8, Self::F64,
    ];

    fn from_raw(raw: u64) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Channel count this format forces, `None` if any count 1..=4 is allowed.
    pub const fn required_channels(self) -> Option<u32> {
        match self {
            Self::F3_3_2 | Self::F4_2_0 | Self::F4_1_1 | Self::F4_2_2 | Self::F5_5_5
            | Self::F5_6_5 | Self::F9_9_9Exp5 | Self::F11_11_10 | Self::F12_12_12 => Some(3),
            Self::F5_5_5A1 | Self::F10_10_10A2 | Self::F12_12_12_12 => Some(4),
            Self::F16_8 | Self::F24_8 | Self::F32_8 => Some(2),
            _ => None,
        }
    }

    /// Bits of one component for uniform formats, `None` for packed formats.
    pub const fn component_bits(self) -> Option<u32> {
        match self {
            Self::F1 => Some(1),
            Self::F2 => Some(2),
            Self::F4 => Some(4),
            Self::F8 => Some(8),
            Self::F10 => Some(10),
            Self::F16 => Some(16),
            Self::F24 => Some(24),
            Self::F32 => Some(32),
            Self::F64 => Some(64),
            _ => None,
        }
    }

    /// Storage bits of one pixel for packed formats.
    pub const fn packed_bits(self) -> Option<u32> {
        match self {
            Self::F3_3_2 => Some(8),
            Self::F4_2_0 | Self::F4_1_1 => Some(12),
            Self::F4_2_2 => Some(16),
            Self::F5_5_5 | Self::F5_5_5A1 | Self::F5_6_5 => Some(16),
            Self::F9_9_9Exp5 | Self::F10_10_10A2 | Self::F11_11_10 => Some(32),
            Self::F12_12_12 => Some(36),
            Self::F12_12_12_12 => Some(48),
            Self::F16_8 => Some(24),
            Self::F24_8 => Some(32),
            Self::F32_8 => Some(64),
            _ => None,
        }
    }
}

/// Block compression scheme (bits 6..9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ImageCompression {
    /// Uncompressed.
    None = 0,
    /// BC1 / DXT1.
    Bc1 = 1,
    /// BC2 / DXT3.
    Bc2 = 2,
    /// BC3 / DXT5.
    Bc3 = 3,
    /// RGTC: BC4 (1 channel) or BC5 (2 channels).
    Rgtc = 4,
    /// BPTC: BC6H (float) or BC7 (unorm).
    Bptc = 5,
    /// PVRTC (2 or 4 bpp).
    Pvrtc = 6,
    /// PVRTC2 (2 or 4 bpp).
    Pvrtc2 = 7,
    /// EAC / ETC1.
    Eac = 8,
    /// ETC2.
    Etc2 = 9,
    /// ASTC (4x4 blocks).
    Astc = 10,
}

impl ImageCompression {
    fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::Bc1,
            2 => Self::Bc2,
            3 => Self::Bc3,
            4 => Self::Rgtc,
            5 => Self::Bptc,
            6 => Self::Pvrtc,
            7 => Self::Pvrtc2,
            8 => Self::Eac,
            9 => Self::Etc2,
            10 => Self::Astc,
            _ => return None,
        })
    }
}

/// Access qualifier (bits 10..11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ImageAccess {
    None = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

/// Texel data type (bits 12..13).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ImageDataType {
    None = 0,
    Int = 1,
    Uint = 2,
    Float = 3,
}

/// Channel ordering (bits 18..19).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ImageLayout {
    Rgba = 0,
    Bgra = 1,
    Abgr = 2,
    Argb = 3,
}

macro_rules! field_const {
    ($name:ident, $value:expr, $shift:expr) => {
        #[allow(missing_docs)]
        pub const $name: ImageType = ImageType(($value as u64) << $shift);
    };
}

macro_rules! flag_const {
    ($name:ident, $bit:expr) => {
        #[allow(missing_docs)]
        pub const $name: ImageType = ImageType(1u64 << $bit);
    };
}

impl ImageType {
    /// The empty type.
    pub const NONE: ImageType = ImageType(0);

    field_const!(FORMAT_1, ImageFormat::F1, FORMAT_SHIFT);
    field_const!(FORMAT_2, ImageFormat::F2, FORMAT_SHIFT);
    field_const!(FORMAT_3_3_2, ImageFormat::F3_3_2, FORMAT_SHIFT);
    field_const!(FORMAT_4, ImageFormat::F4, FORMAT_SHIFT);
    field_const!(FORMAT_4_2_0, ImageFormat::F4_2_0, FORMAT_SHIFT);
    field_const!(FORMAT_4_1_1, ImageFormat::F4_1_1, FORMAT_SHIFT);
    field_const!(FORMAT_4_2_2, ImageFormat::F4_2_2, FORMAT_SHIFT);
    field_const!(FORMAT_5_5_5, ImageFormat::F5_5_5, FORMAT_SHIFT);
    field_const!(FORMAT_5_5_5_A1, ImageFormat::F5_5_5A1, FORMAT_SHIFT);
    field_const!(FORMAT_5_6_5, ImageFormat::F5_6_5, FORMAT_SHIFT);
    field_const!(FORMAT_8, ImageFormat::F8, FORMAT_SHIFT);
    field_const!(FORMAT_9_9_9_EXP_5, ImageFormat::F9_9_9Exp5, FORMAT_SHIFT);
    field_const!(FORMAT_10, ImageFormat::F10, FORMAT_SHIFT);
    field_const!(FORMAT_10_10_10_A2, ImageFormat::F10_10_10A2, FORMAT_SHIFT);
    field_const!(FORMAT_11_11_10, ImageFormat::F11_11_10, FORMAT_SHIFT);
    field_const!(FORMAT_12_12_12, ImageFormat::F12_12_12, FORMAT_SHIFT);
    field_const!(FORMAT_12_12_12_12, ImageFormat::F12_12_12_12, FORMAT_SHIFT);
    field_const!(FORMAT_16, ImageFormat::F16, FORMAT_SHIFT);
    field_const!(FORMAT_16_8, ImageFormat::F16_8, FORMAT_SHIFT);
    field_const!(FORMAT_24, ImageFormat::F24, FORMAT_SHIFT);
    field_const!(FORMAT_24_8, ImageFormat::F24_8, FORMAT_SHIFT);
    field_const!(FORMAT_32, ImageFormat::F32, FORMAT_SHIFT);
    field_const!(FORMAT_32_8, ImageFormat::F32_8, FORMAT_SHIFT);
    field_const!(FORMAT_64, ImageFormat::F64, FORMAT_SHIFT);

    field_const!(COMPRESSION_BC1, ImageCompression::Bc1, COMPRESSION_SHIFT);
    field_const!(COMPRESSION_BC2, ImageCompression::Bc2, COMPRESSION_SHIFT);
    field_const!(COMPRESSION_BC3, ImageCompression::Bc3, COMPRESSION_SHIFT);
    field_const!(COMPRESSION_RGTC, ImageCompression::Rgtc, COMPRESSION_SHIFT);
    field_const!(COMPRESSION_BPTC, ImageCompression::Bptc, COMPRESSION_SHIFT);
    field_const!(COMPRESSION_PVRTC, ImageCompression::Pvrtc, COMPRESSION_SHIFT);
    field_const!(COMPRESSION_PVRTC2, ImageCompression::Pvrtc2, COMPRESSION_SHIFT);
    field_const!(COMPRESSION_EAC, ImageCompression::Eac, COMPRESSION_SHIFT);
    field_const!(COMPRESSION_ETC2, ImageCompression::Etc2, COMPRESSION_SHIFT);
    field_const!(COMPRESSION_ASTC, ImageCompression::Astc, COMPRESSION_SHIFT);

    field_const!(READ, ImageAccess::Read, ACCESS_SHIFT);
    field_const!(WRITE, ImageAccess::Write, ACCESS_SHIFT);
    field_const!(READ_WRITE, ImageAccess::ReadWrite, ACCESS_SHIFT);

    field_const!(INT, ImageDataType::Int, DATA_TYPE_SHIFT);
    field_const!(UINT, ImageDataType::Uint, DATA_TYPE_SHIFT);
    field_const!(FLOAT, ImageDataType::Float, DATA_TYPE_SHIFT);

    field_const!(CHANNELS_1, 0u8, CHANNELS_SHIFT);
    field_const!(CHANNELS_2, 1u8, CHANNELS_SHIFT);
    field_const!(CHANNELS_3, 2u8, CHANNELS_SHIFT);
    field_const!(CHANNELS_4, 3u8, CHANNELS_SHIFT);

    field_const!(DIM_1D, 1u8, DIM_SHIFT);
    field_const!(DIM_2D, 2u8, DIM_SHIFT);
    field_const!(DIM_3D, 3u8, DIM_SHIFT);

    field_const!(LAYOUT_RGBA, ImageLayout::Rgba, LAYOUT_SHIFT);
    field_const!(LAYOUT_BGRA, ImageLayout::Bgra, LAYOUT_SHIFT);
    field_const!(LAYOUT_ABGR, ImageLayout::Abgr, LAYOUT_SHIFT);
    field_const!(LAYOUT_ARGB, ImageLayout::Argb, LAYOUT_SHIFT);

    flag_const!(FLAG_ARRAY, 20);
    flag_const!(FLAG_BUFFER, 21);
    flag_const!(FLAG_MSAA, 22);
    flag_const!(FLAG_CUBE, 23);
    flag_const!(FLAG_DEPTH, 24);
    flag_const!(FLAG_STENCIL, 25);
    flag_const!(FLAG_RENDER_TARGET, 26);
    flag_const!(FLAG_MIPMAPPED, 27);
    flag_const!(FLAG_FIXED_CHANNELS, 28);
    flag_const!(FLAG_GATHER, 29);
    flag_const!(FLAG_NORMALIZED, 30);
    flag_const!(FLAG_SRGB, 31);
    flag_const!(FLAG_TRANSIENT, 60);

    field_const!(SAMPLE_COUNT_2, 1u8, SAMPLE_COUNT_SHIFT);
    field_const!(SAMPLE_COUNT_4, 2u8, SAMPLE_COUNT_SHIFT);
    field_const!(SAMPLE_COUNT_8, 3u8, SAMPLE_COUNT_SHIFT);
    field_const!(SAMPLE_COUNT_16, 4u8, SAMPLE_COUNT_SHIFT);
    field_const!(SAMPLE_COUNT_32, 5u8, SAMPLE_COUNT_SHIFT);
    field_const!(SAMPLE_COUNT_64, 6u8, SAMPLE_COUNT_SHIFT);

    field_const!(ANISOTROPY_2, 1u8, ANISOTROPY_SHIFT);
    field_const!(ANISOTROPY_4, 2u8, ANISOTROPY_SHIFT);
    field_const!(ANISOTROPY_8, 3u8, ANISOTROPY_SHIFT);
    field_const!(ANISOTROPY_16, 4u8, ANISOTROPY_SHIFT);

    // Base image kinds (dimensionality plus array/cube/depth/msaa shape)
    /// 1D image.
    pub const IMAGE_1D: ImageType = Self::DIM_1D;
    /// 1D image array.
    pub const IMAGE_1D_ARRAY: ImageType = Self::DIM_1D.with(Self::FLAG_ARRAY);
    /// 2D image.
    pub const IMAGE_2D: ImageType = Self::DIM_2D;
    /// 2D image array.
    pub const IMAGE_2D_ARRAY: ImageType = Self::DIM_2D.with(Self::FLAG_ARRAY);
    /// 2D multi-sampled image.
    pub const IMAGE_2D_MSAA: ImageType = Self::DIM_2D.with(Self::FLAG_MSAA);
    /// Cube map.
    pub const IMAGE_CUBE: ImageType = Self::DIM_2D.with(Self::FLAG_CUBE);
    /// Cube map array.
    pub const IMAGE_CUBE_ARRAY: ImageType = Self::IMAGE_CUBE.with(Self::FLAG_ARRAY);
    /// 2D depth image.
    pub const IMAGE_DEPTH: ImageType = Self::DIM_2D.with(Self::FLAG_DEPTH);
    /// 2D depth image array.
    pub const IMAGE_DEPTH_ARRAY: ImageType = Self::IMAGE_DEPTH.with(Self::FLAG_ARRAY);
    /// 3D image.
    pub const IMAGE_3D: ImageType = Self::DIM_3D;

    // Common pixel types
    /// 8-bit normalized single channel, 2D, read/write.
    pub const R8UI_NORM: ImageType = Self::IMAGE_2D
        .with(Self::CHANNELS_1)
        .with(Self::FORMAT_8)
        .with(Self::UINT)
        .with(Self::FLAG_NORMALIZED)
        .with(Self::READ_WRITE);
    /// 8-bit normalized RGBA, 2D, read/write.
    pub const RGBA8UI_NORM: ImageType = Self::IMAGE_2D
        .with(Self::CHANNELS_4)
        .with(Self::FORMAT_8)
        .with(Self::UINT)
        .with(Self::FLAG_NORMALIZED)
        .with(Self::READ_WRITE);
    /// 8-bit unsigned RGBA, 2D, read/write.
    pub const RGBA8UI: ImageType = Self::IMAGE_2D
        .with(Self::CHANNELS_4)
        .with(Self::FORMAT_8)
        .with(Self::UINT)
        .with(Self::READ_WRITE);
    /// 32-bit float single channel, 2D, read/write.
    pub const R32F: ImageType = Self::IMAGE_2D
        .with(Self::CHANNELS_1)
        .with(Self::FORMAT_32)
        .with(Self::FLOAT)
        .with(Self::READ_WRITE);
    /// 16-bit float RGBA, 2D, read/write.
    pub const RGBA16F: ImageType = Self::IMAGE_2D
        .with(Self::CHANNELS_4)
        .with(Self::FORMAT_16)
        .with(Self::FLOAT)
        .with(Self::READ_WRITE);
    /// 32-bit float RGBA, 2D, read/write.
    pub const RGBA32F: ImageType = Self::IMAGE_2D
        .with(Self::CHANNELS_4)
        .with(Self::FORMAT_32)
        .with(Self::FLOAT)
        .with(Self::READ_WRITE);
    /// 32-bit unsigned single channel, 2D, read/write.
    pub const R32UI: ImageType = Self::IMAGE_2D
        .with(Self::CHANNELS_1)
        .with(Self::FORMAT_32)
        .with(Self::UINT)
        .with(Self::READ_WRITE);
    /// 32-bit float depth.
    pub const D32F: ImageType = Self::IMAGE_DEPTH
        .with(Self::CHANNELS_1)
        .with(Self::FORMAT_32)
        .with(Self::FLOAT)
        .with(Self::READ_WRITE);
    /// 24-bit depth + 8-bit stencil.
    pub const D24S8: ImageType = Self::IMAGE_DEPTH
        .with(Self::FLAG_STENCIL)
        .with(Self::CHANNELS_2)
        .with(Self::FORMAT_24_8)
        .with(Self::UINT)
        .with(Self::READ_WRITE);
    /// BC1 compressed RGBA.
    pub const BC1_RGBA: ImageType = Self::IMAGE_2D
        .with(Self::COMPRESSION_BC1)
        .with(Self::CHANNELS_4)
        .with(Self::FORMAT_8)
        .with(Self::UINT)
        .with(Self::FLAG_NORMALIZED)
        .with(Self::READ);
    /// BC7 compressed RGBA.
    pub const BC7_RGBA: ImageType = Self::IMAGE_2D
        .with(Self::COMPRESSION_BPTC)
        .with(Self::CHANNELS_4)
        .with(Self::FORMAT_8)
        .with(Self::UINT)
        .with(Self::FLAG_NORMALIZED)
        .with(Self::READ);
    /// BC6H signed half-float RGB.
    pub const BC6H_RGBHF: ImageType = Self::IMAGE_2D
        .with(Self::COMPRESSION_BPTC)
        .with(Self::CHANNELS_3)
        .with(Self::FORMAT_16)
        .with(Self::FLOAT)
        .with(Self::READ);
    /// BC6H unsigned half-float RGB.
    pub const BC6H_RGBUHF: ImageType = Self::BC6H_RGBHF.with(Self::FLAG_NORMALIZED);

    /// Mask covering the base kind bits (dim + ARRAY/BUFFER/MSAA/CUBE/DEPTH).
    pub const BASE_TYPE_MASK: ImageType = ImageType(
        DIM_MASK
            | Self::FLAG_ARRAY.0
            | Self::FLAG_BUFFER.0
            | Self::FLAG_MSAA.0
            | Self::FLAG_CUBE.0
            | Self::FLAG_DEPTH.0,
    );

    /// Wraps a raw word.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw word.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Const-context `|`.
    #[inline]
    pub const fn with(self, other: ImageType) -> Self {
        Self(self.0 | other.0)
    }

    /// Const-context removal of bits.
    #[inline]
    pub const fn without(self, other: ImageType) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns true if all bits of `flags` are set.
    #[inline]
    pub const fn has(self, flags: ImageType) -> bool {
        self.0 & flags.0 == flags.0
    }

    /// Base kind of this image (see [`BASE_TYPE_MASK`](Self::BASE_TYPE_MASK)).
    #[inline]
    pub const fn base_type(self) -> ImageType {
        Self(self.0 & Self::BASE_TYPE_MASK.0)
    }

    // =========================================================================
    // Field getters
    // =========================================================================

    /// Pixel format field.
    pub fn format(self) -> ImageFormat {
        ImageFormat::from_raw((self.0 >> FORMAT_SHIFT) & FORMAT_MASK).unwrap_or(ImageFormat::None)
    }

    /// Replaces the format field.
    pub fn with_format(self, format: ImageFormat) -> Self {
        Self((self.0 & !(FORMAT_MASK << FORMAT_SHIFT)) | ((format as u64) << FORMAT_SHIFT))
    }

    /// Compression field. Unknown raw values decode as `None`.
    pub fn compression(self) -> ImageCompression {
        ImageCompression::from_raw((self.0 & COMPRESSION_MASK) >> COMPRESSION_SHIFT)
            .unwrap_or(ImageCompression::None)
    }

    /// True if any block compression is set.
    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & COMPRESSION_MASK != 0
    }

    /// Access qualifier.
    pub fn access(self) -> ImageAccess {
        match (self.0 & ACCESS_MASK) >> ACCESS_SHIFT {
            1 => ImageAccess::Read,
            2 => ImageAccess::Write,
            3 => ImageAccess::ReadWrite,
            _ => ImageAccess::None,
        }
    }

    /// Replaces the access qualifier.
    pub fn with_access(self, access: ImageAccess) -> Self {
        Self((self.0 & !ACCESS_MASK) | ((access as u64) << ACCESS_SHIFT))
    }

    /// Data type.
    pub fn data_type(self) -> ImageDataType {
        match (self.0 & DATA_TYPE_MASK) >> DATA_TYPE_SHIFT {
            1 => ImageDataType::Int,
            2 => ImageDataType::Uint,
            3 => ImageDataType::Float,
            _ => ImageDataType::None,
        }
    }

    /// Channel layout.
    pub fn layout(self) -> ImageLayout {
        match (self.0 & LAYOUT_MASK) >> LAYOUT_SHIFT {
            1 => ImageLayout::Bgra,
            2 => ImageLayout::Abgr,
            3 => ImageLayout::Argb,
            _ => ImageLayout::Rgba,
        }
    }

    /// Number of dimensions (1, 2 or 3), 0 if unset.
    #[inline]
    pub const fn dim_count(self) -> u32 {
        ((self.0 & DIM_MASK) >> DIM_SHIFT) as u32
    }

    /// Storage dimensions: `dim_count` plus one for arrays or cubes.
    #[inline]
    pub const fn storage_dim_count(self) -> u32 {
        let extra = if self.0 & (Self::FLAG_CUBE.0 | Self::FLAG_ARRAY.0) != 0 { 1 } else { 0 };
        self.dim_count() + extra
    }

    /// Number of channels (1..=4).
    #[inline]
    pub const fn channel_count(self) -> u32 {
        (((self.0 & CHANNELS_MASK) >> CHANNELS_SHIFT) + 1) as u32
    }

    /// Replaces the channel count (clamped to 1..=4).
    pub fn with_channel_count(self, count: u32) -> Self {
        let raw = (count.clamp(1, 4) - 1) as u64;
        Self((self.0 & !CHANNELS_MASK) | (raw << CHANNELS_SHIFT))
    }

    /// Samples per pixel (1 unless MSAA).
    #[inline]
    pub const fn sample_count(self) -> u32 {
        1 << ((self.0 & SAMPLE_COUNT_MASK) >> SAMPLE_COUNT_SHIFT)
    }

    /// Maximum anisotropy encoded in the type.
    #[inline]
    pub const fn anisotropy(self) -> u32 {
        1 << ((self.0 & ANISOTROPY_MASK) >> ANISOTROPY_SHIFT)
    }

    /// Cube or cube array.
    #[inline]
    pub const fn is_cube(self) -> bool {
        self.has(Self::FLAG_CUBE)
    }

    /// Array image (including cube arrays).
    #[inline]
    pub const fn is_array(self) -> bool {
        self.has(Self::FLAG_ARRAY)
    }

    /// Mip-mapped.
    #[inline]
    pub const fn is_mipmapped(self) -> bool {
        self.has(Self::FLAG_MIPMAPPED)
    }

    /// Multi-sampled.
    #[inline]
    pub const fn is_msaa(self) -> bool {
        self.has(Self::FLAG_MSAA)
    }

    /// Depth image.
    #[inline]
    pub const fn is_depth(self) -> bool {
        self.has(Self::FLAG_DEPTH)
    }

    /// Stencil component present.
    #[inline]
    pub const fn is_stencil(self) -> bool {
        self.has(Self::FLAG_STENCIL)
    }

    /// Usable as render target.
    #[inline]
    pub const fn is_render_target(self) -> bool {
        self.has(Self::FLAG_RENDER_TARGET)
    }

    /// Writable by kernels.
    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self.access(), ImageAccess::Write | ImageAccess::ReadWrite)
    }

    /// Readable by kernels.
    #[inline]
    pub fn is_readable(self) -> bool {
        matches!(self.access(), ImageAccess::Read | ImageAccess::ReadWrite)
    }

    // =========================================================================
    // Derived sizes
    // =========================================================================

    /// Bits of one pixel including all samples.
    ///
    /// Uniform formats multiply component bits by channels; packed formats use
    /// their fixed storage size. PVRTC reports 2 or 4 bpp; every other block
    /// compression reports 1 and is sized per block by
    /// [`slice_data_size`](Self::slice_data_size).
    pub fn bits_per_pixel(self) -> u32 {
        match self.compression() {
            ImageCompression::None => {}
            ImageCompression::Pvrtc | ImageCompression::Pvrtc2 => {
                return if self.format() == ImageFormat::F2 { 2 } else { 4 };
            }
            _ => return 1,
        }
        let format = self.format();
        let bits = match (format.component_bits(), format.packed_bits()) {
            (Some(component), _) => component * self.channel_count(),
            (None, Some(packed)) => packed,
            (None, None) => 0,
        };
        bits * self.sample_count()
    }

    /// Bytes of one pixel, rounded up.
    #[inline]
    pub fn bytes_per_pixel(self) -> u32 {
        self.bits_per_pixel().div_ceil(8)
    }

    /// Bit size of each channel (unused channels are 0).
    pub fn channel_bit_sizes(self) -> [u32; 4] {
        let channels = self.channel_count() as usize;
        let mut sizes = match self.format() {
            ImageFormat::F3_3_2 => [3, 3, 2, 0],
            ImageFormat::F5_5_5 => [5, 5, 5, 0],
            ImageFormat::F5_5_5A1 => [5, 5, 5, 1],
            ImageFormat::F5_6_5 => [5, 6, 5, 0],
            ImageFormat::F9_9_9Exp5 => [14, 14, 14, 0],
            ImageFormat::F10_10_10A2 => [10, 10, 10, 2],
            ImageFormat::F11_11_10 => [11, 11, 10, 0],
            ImageFormat::F12_12_12 => [12, 12, 12, 0],
            ImageFormat::F12_12_12_12 => [12, 12, 12, 12],
            ImageFormat::F16_8 => [16, 8, 0, 0],
            ImageFormat::F24_8 => [24, 8, 0, 0],
            ImageFormat::F32_8 => [32, 8, 0, 0],
            ImageFormat::F4_2_0 | ImageFormat::F4_1_1 | ImageFormat::F4_2_2 => [8, 8, 8, 0],
            other => {
                let bits = other.component_bits().unwrap_or(0);
                [bits; 4]
            }
        };
        for size in sizes.iter_mut().skip(channels) {
            *size = 0;
        }
        sizes
    }

    /// Bytes per 4x4 block for block-compressed formats (0 if uncompressed or PVRTC).
    pub fn compression_block_size(self) -> u32 {
        match self.compression() {
            ImageCompression::Bc1 => 8,
            ImageCompression::Bc2 | ImageCompression::Bc3 | ImageCompression::Bptc => 16,
            ImageCompression::Rgtc => {
                if self.channel_count() == 1 { 8 } else { 16 }
            }
            ImageCompression::Eac | ImageCompression::Etc2 => {
                if self.channel_count() == 4 { 16 } else { 8 }
            }
            ImageCompression::Astc => 16,
            ImageCompression::None | ImageCompression::Pvrtc | ImageCompression::Pvrtc2 => 0,
        }
    }

    /// Largest extent over the dimensions this type actually uses.
    pub fn max_dim(self, dim: UVec4) -> u32 {
        match self.dim_count() {
            1 => dim.x,
            2 => dim.x.max(dim.y),
            _ => dim.x.max(dim.y).max(dim.z),
        }
    }

    /// Number of mip levels for `dim`.
    ///
    /// `floor(log2(max_dim)) + 1` when mip-mapped, else 1. Compressed images
    /// drop the 1x1, 2x2 and 4x4 levels but keep at least one level.
    pub fn mip_level_count(self, dim: UVec4) -> u32 {
        if !self.is_mipmapped() {
            return 1;
        }
        let max_dim = self.max_dim(dim);
        if max_dim == 0 {
            return 1;
        }
        let count = u32::BITS - max_dim.leading_zeros();
        if self.is_compressed() {
            count.saturating_sub(3).max(1)
        } else {
            count
        }
    }

    /// Number of layers: array count from the first unused component, times 6 for cubes.
    pub fn layer_count(self, dim: UVec4) -> u32 {
        let layers = if self.is_array() {
            match self.dim_count() {
                1 => dim.y,
                2 => dim.z,
                _ => dim.w,
            }
            .max(1)
        } else {
            1
        };
        if self.is_cube() { layers * 6 } else { layers }
    }

    /// Extent of `level` (each used axis shifted right, clamped to 1; unused axes 0).
    pub fn mip_level_dim(self, dim: UVec4, level: u32) -> UVec3 {
        let shift = |v: u32| (v >> level).max(1);
        match self.dim_count() {
            1 => UVec3::new(shift(dim.x), 0, 0),
            2 => UVec3::new(shift(dim.x), shift(dim.y), 0),
            _ => UVec3::new(shift(dim.x), shift(dim.y), shift(dim.z)),
        }
    }

    /// Byte size of one slice (one layer of the top mip level) of `dim`.
    pub fn slice_data_size(self, dim: UVec4) -> u64 {
        self.level_slice_size(UVec3::new(dim.x, dim.y, dim.z))
    }

    fn level_slice_size(self, extent: UVec3) -> u64 {
        let dims = self.dim_count();
        let x = extent.x.max(1) as u64;
        let y = if dims >= 2 { extent.y.max(1) as u64 } else { 1 };
        let z = if dims >= 3 { extent.z.max(1) as u64 } else { 1 };

        let block_size = self.compression_block_size() as u64;
        if block_size > 0 {
            // block compressed: whole 4x4 blocks per 2D slice
            return x.div_ceil(4) * y.div_ceil(4) * z * block_size;
        }
        if self.is_compressed() {
            // PVRTC: 8x8 minimum footprint
            let x = x.max(8);
            let y = y.max(8);
            return (x * y * z * self.bits_per_pixel() as u64).div_ceil(8);
        }
        (x * y * z * self.bits_per_pixel() as u64).div_ceil(8)
    }

    /// Total byte size for `dim`: all mip levels (unless `ignore_mip`) times all layers.
    pub fn data_size(self, dim: UVec4, ignore_mip: bool) -> u64 {
        let levels = if ignore_mip { 1 } else { self.mip_level_count(dim) };
        let layers = self.layer_count(dim) as u64;
        let per_layer: u64 = (0..levels)
            .map(|level| self.level_slice_size(self.mip_level_dim(dim, level)))
            .sum();
        per_layer * layers
    }

    /// Byte offset of mip `level` inside one layer's mip chain.
    pub fn mip_level_offset(self, dim: UVec4, level: u32) -> u64 {
        (0..level)
            .map(|l| self.level_slice_size(self.mip_level_dim(dim, l)))
            .sum()
    }

    /// Checks the (format, channel count) table and that a dimensionality is set.
    pub fn is_format_valid(self) -> bool {
        if self.dim_count() == 0 {
            return false;
        }
        let format = self.format();
        if format == ImageFormat::None {
            return false;
        }
        match format.required_channels() {
            Some(required) => required == self.channel_count(),
            None => true,
        }
    }

    /// Full validation of this type against an extent.
    pub fn validate(self, dim: UVec4) -> Result<()> {
        if !self.is_format_valid() {
            return Err(Error::invalid_image_type(self, "format does not match channel count or no dimensionality set"));
        }
        let dims = self.dim_count() as usize;
        let extent = dim.to_array();
        if extent[..dims].iter().any(|&v| v == 0) {
            return Err(Error::invalid_dimensions(dim, "zero extent"));
        }
        if self.is_cube() && dim.x != dim.y {
            return Err(Error::invalid_dimensions(dim, "cube faces must be square"));
        }
        if self.is_msaa() && self.is_mipmapped() {
            return Err(Error::invalid_image_type(self, "MSAA images cannot be mip-mapped"));
        }
        Ok(())
    }
}

// =============================================================================
// Operators
// =============================================================================

impl BitOr for ImageType {
    type Output = ImageType;
    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ImageType {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ImageType {
    type Output = ImageType;
    #[inline]
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for ImageType {
    #[inline]
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for ImageType {
    type Output = ImageType;
    #[inline]
    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageType({self})")
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}D {:?} x{} {:?}",
            self.dim_count(),
            self.data_type(),
            self.channel_count(),
            self.format()
        )?;
        if self.is_compressed() {
            write!(f, " {:?}", self.compression())?;
        }
        let flags = [
            (Self::FLAG_ARRAY, "array"),
            (Self::FLAG_BUFFER, "buffer"),
            (Self::FLAG_MSAA, "msaa"),
            (Self::FLAG_CUBE, "cube"),
            (Self::FLAG_DEPTH, "depth"),
            (Self::FLAG_STENCIL, "stencil"),
            (Self::FLAG_RENDER_TARGET, "rt"),
            (Self::FLAG_MIPMAPPED, "mip"),
            (Self::FLAG_NORMALIZED, "norm"),
            (Self::FLAG_SRGB, "srgb"),
            (Self::FLAG_TRANSIENT, "transient"),
        ];
        for (flag, name) in flags {
            if self.has(flag) {
                write!(f, " {name}")?;
            }
        }
        write!(f, " [{:#018x}]", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_round_trip() {
        for (channels, k) in [
            (ImageType::CHANNELS_1, 1),
            (ImageType::CHANNELS_2, 2),
            (ImageType::CHANNELS_3, 3),
            (ImageType::CHANNELS_4, 4),
        ] {
            for (dim, n) in [(ImageType::DIM_1D, 1), (ImageType::DIM_2D, 2), (ImageType::DIM_3D, 3)] {
                let t = channels | dim | ImageType::FORMAT_16 | ImageType::FLOAT;
                assert_eq!(t.channel_count(), k);
                assert_eq!(t.dim_count(), n);
                assert_eq!(t.format(), ImageFormat::F16);
                assert_eq!(t.data_type(), ImageDataType::Float);
            }
        }
    }

    #[test]
    fn test_storage_dim_count() {
        assert_eq!(ImageType::IMAGE_2D.storage_dim_count(), 2);
        assert_eq!(ImageType::IMAGE_2D_ARRAY.storage_dim_count(), 3);
        assert_eq!(ImageType::IMAGE_CUBE.storage_dim_count(), 3);
        assert_eq!(ImageType::IMAGE_1D_ARRAY.storage_dim_count(), 2);
    }

    #[test]
    fn test_bits_per_pixel() {
        assert_eq!(ImageType::RGBA8UI_NORM.bits_per_pixel(), 32);
        assert_eq!(ImageType::RGBA32F.bits_per_pixel(), 128);
        assert_eq!((ImageType::IMAGE_2D | ImageType::CHANNELS_3 | ImageType::FORMAT_5_6_5).bits_per_pixel(), 16);
        assert_eq!(ImageType::D24S8.bits_per_pixel(), 32);
        assert_eq!(ImageType::BC1_RGBA.bits_per_pixel(), 1);
        let msaa = ImageType::RGBA8UI_NORM | ImageType::FLAG_MSAA | ImageType::SAMPLE_COUNT_4;
        assert_eq!(msaa.bits_per_pixel(), 128);
        let pvrtc2 = ImageType::IMAGE_2D | ImageType::COMPRESSION_PVRTC | ImageType::FORMAT_2 | ImageType::CHANNELS_4;
        assert_eq!(pvrtc2.bits_per_pixel(), 2);
        assert_eq!(ImageType::RGBA8UI_NORM.bytes_per_pixel(), 4);
        assert_eq!(ImageType::BC1_RGBA.bytes_per_pixel(), 1);
    }

    #[test]
    fn test_with_access() {
        let t = ImageType::RGBA8UI_NORM.with_access(ImageAccess::Read);
        assert_eq!(t.access(), ImageAccess::Read);
        assert_eq!(t.format(), ImageType::RGBA8UI_NORM.format());
        assert_eq!(t.with_access(ImageAccess::ReadWrite).access(), ImageAccess::ReadWrite);
    }

    #[test]
    fn test_channel_bit_sizes() {
        let t = ImageType::IMAGE_2D | ImageType::CHANNELS_3 | ImageType::FORMAT_5_6_5;
        assert_eq!(t.channel_bit_sizes(), [5, 6, 5, 0]);
        assert_eq!(ImageType::R32F.channel_bit_sizes(), [32, 0, 0, 0]);
    }

    #[test]
    fn test_mip_level_count() {
        let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED;
        assert_eq!(t.mip_level_count(UVec4::new(256, 256, 0, 0)), 9);
        assert_eq!(t.mip_level_count(UVec4::new(300, 17, 0, 0)), 9);
        assert_eq!(t.mip_level_count(UVec4::new(1, 1, 0, 0)), 1);
        assert_eq!(ImageType::RGBA8UI_NORM.mip_level_count(UVec4::new(256, 256, 0, 0)), 1);

        let compressed = ImageType::BC1_RGBA | ImageType::FLAG_MIPMAPPED;
        assert_eq!(compressed.mip_level_count(UVec4::new(256, 256, 0, 0)), 6);
        assert_eq!(compressed.mip_level_count(UVec4::new(4, 4, 0, 0)), 1);
    }

    #[test]
    fn test_layer_count() {
        let dim = UVec4::new(64, 64, 5, 0);
        assert_eq!(ImageType::IMAGE_2D.layer_count(dim), 1);
        assert_eq!(ImageType::IMAGE_2D_ARRAY.layer_count(dim), 5);
        assert_eq!(ImageType::IMAGE_CUBE.layer_count(dim), 6);
        assert_eq!(ImageType::IMAGE_CUBE_ARRAY.layer_count(dim), 30);
        assert_eq!(ImageType::IMAGE_1D_ARRAY.layer_count(UVec4::new(64, 3, 0, 0)), 3);
    }

    #[test]
    fn test_data_size_mip_chain() {
        let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED;
        let dim = UVec4::new(256, 256, 0, 0);
        // 4 * (256^2 + 128^2 + ... + 1)
        assert_eq!(t.data_size(dim, false), 349_524);
        assert_eq!(t.data_size(dim, true), 256 * 256 * 4);
        assert_eq!(t.mip_level_offset(dim, 1), 256 * 256 * 4);
    }

    #[test]
    fn test_compressed_slice_size() {
        let dim = UVec4::new(64, 64, 0, 0);
        assert_eq!(ImageType::BC1_RGBA.slice_data_size(dim), 16 * 16 * 8);
        assert_eq!(ImageType::BC7_RGBA.slice_data_size(dim), 16 * 16 * 16);
    }

    #[test]
    fn test_format_valid() {
        let ok = ImageType::IMAGE_2D | ImageType::CHANNELS_3 | ImageType::FORMAT_3_3_2;
        assert!(ok.is_format_valid());
        let bad = ImageType::IMAGE_2D | ImageType::CHANNELS_4 | ImageType::FORMAT_3_3_2;
        assert!(!bad.is_format_valid());
        let depth_stencil = ImageType::IMAGE_DEPTH | ImageType::CHANNELS_2 | ImageType::FORMAT_24_8;
        assert!(depth_stencil.is_format_valid());
        let no_dim = ImageType::CHANNELS_1 | ImageType::FORMAT_8;
        assert!(!no_dim.is_format_valid());
    }

    #[test]
    fn test_validate_cube_and_msaa() {
        let cube = ImageType::IMAGE_CUBE | ImageType::CHANNELS_4 | ImageType::FORMAT_8 | ImageType::UINT;
        assert!(cube.validate(UVec4::new(32, 32, 0, 0)).is_ok());
        assert!(cube.validate(UVec4::new(32, 16, 0, 0)).is_err());
        let msaa_mip = ImageType::RGBA8UI_NORM | ImageType::FLAG_MSAA | ImageType::FLAG_MIPMAPPED;
        assert!(msaa_mip.validate(UVec4::new(32, 32, 0, 0)).is_err());
    }

    #[test]
    fn test_display_contains_flags() {
        let s = (ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED).to_string();
        assert!(s.contains("mip"));
        assert!(s.contains("norm"));
    }
}
