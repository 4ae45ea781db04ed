//! Kernel / shader function metadata.
//!
//! [`FunctionInfo`] is what the runtime knows about an entry point: its name,
//! stage, required local size and one [`ArgInfo`] per argument. At runtime
//! each argument is a packed 64-bit word:
//!
//! ```text
//! bits  0..31  size in bytes
//! bits 32..34  address space
//! bits 35..42  image type
//! bits 43..44  image access
//! bits 45..47  special type
//! ```

use glam::UVec3;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image_type::ImageType;

macro_rules! u8_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident : $field:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        #[repr(u8)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            /// Decodes the raw value.
            pub fn from_u8(raw: u8) -> Result<Self> {
                match raw {
                    $( $value => Ok(Self::$variant), )+
                    _ => Err(Error::invalid_field($field, raw as u64)),
                }
            }
        }
    };
}

u8_enum! {
    /// Address space of an argument.
    pub enum AddressSpace: "address_space" {
        /// Global / device memory.
        #[default]
        Global = 0,
        /// Work-group local memory.
        Local = 1,
        /// Constant memory.
        Constant = 2,
        /// Image / texture.
        Image = 3,
        /// Argument buffer.
        ArgBuffer = 4,
    }
}

u8_enum! {
    /// Image kind of an image argument.
    #[allow(missing_docs)]
    pub enum ArgImageType: "image_type" {
        #[default]
        None = 0,
        Image1D = 1,
        Image1DArray = 2,
        Image1DBuffer = 3,
        Image2D = 4,
        Image2DArray = 5,
        Image2DMsaa = 6,
        Image2DMsaaArray = 7,
        ImageCube = 8,
        ImageCubeArray = 9,
        Image2DDepth = 10,
        Image2DArrayDepth = 11,
        Image2DMsaaDepth = 12,
        Image2DArrayMsaaDepth = 13,
        ImageCubeDepth = 14,
        ImageCubeArrayDepth = 15,
        Image3D = 16,
    }
}

u8_enum! {
    /// Access qualifier of an image argument.
    pub enum ArgImageAccess: "image_access" {
        /// Not an image.
        #[default]
        None = 0,
        /// Read-only.
        Read = 1,
        /// Write-only.
        Write = 2,
        /// Read and write.
        ReadWrite = 3,
    }
}

u8_enum! {
    /// Special argument kinds.
    pub enum SpecialType: "special_type" {
        /// Plain argument.
        #[default]
        None = 0,
        /// Vertex/fragment stage input.
        StageInput = 1,
        /// Push constant block.
        PushConstant = 2,
        /// Storage buffer.
        Ssbo = 3,
        /// Inline uniform block.
        Iub = 4,
        /// Argument buffer.
        ArgumentBuffer = 5,
        /// Array of buffers.
        BufferArray = 6,
        /// Array of images.
        ImageArray = 7,
    }
}

u8_enum! {
    /// Kind of entry point.
    pub enum FunctionType: "function_type" {
        /// Not set.
        #[default]
        None = 0,
        /// Compute kernel.
        Kernel = 1,
        /// Vertex shader.
        Vertex = 2,
        /// Fragment shader.
        Fragment = 3,
        /// Tessellation control shader.
        TessellationControl = 4,
        /// Tessellation evaluation shader.
        TessellationEvaluation = 5,
        /// Argument buffer layout (no code).
        ArgumentBuffer = 6,
    }
}

impl ArgImageType {
    /// Image kind a concrete [`ImageType`] binds as.
    pub fn from_image_type(t: ImageType) -> Self {
        let depth = t.is_depth();
        let array = t.is_array();
        let msaa = t.is_msaa();
        if t.is_cube() {
            return match (array, depth) {
                (false, false) => Self::ImageCube,
                (true, false) => Self::ImageCubeArray,
                (false, true) => Self::ImageCubeDepth,
                (true, true) => Self::ImageCubeArrayDepth,
            };
        }
        match t.dim_count() {
            1 if t.has(ImageType::FLAG_BUFFER) => Self::Image1DBuffer,
            1 if array => Self::Image1DArray,
            1 => Self::Image1D,
            2 => match (array, msaa, depth) {
                (false, false, false) => Self::Image2D,
                (true, false, false) => Self::Image2DArray,
                (false, true, false) => Self::Image2DMsaa,
                (true, true, false) => Self::Image2DMsaaArray,
                (false, false, true) => Self::Image2DDepth,
                (true, false, true) => Self::Image2DArrayDepth,
                (false, true, true) => Self::Image2DMsaaDepth,
                (true, true, true) => Self::Image2DArrayMsaaDepth,
            },
            3 => Self::Image3D,
            _ => Self::None,
        }
    }
}

impl From<ImageType> for ArgImageAccess {
    fn from(t: ImageType) -> Self {
        match (t.is_readable(), t.is_writable()) {
            (true, true) => Self::ReadWrite,
            (true, false) => Self::Read,
            (false, true) => Self::Write,
            (false, false) => Self::None,
        }
    }
}

const SIZE_MASK: u64 = 0xFFFF_FFFF;
const ADDRESS_SPACE_SHIFT: u32 = 32;
const IMAGE_TYPE_SHIFT: u32 = 35;
const IMAGE_ACCESS_SHIFT: u32 = 43;
const SPECIAL_TYPE_SHIFT: u32 = 45;

/// Metadata of one function argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgInfo {
    /// Size in bytes (0 for images and unsized buffers).
    pub size: u32,
    /// Address space.
    pub address_space: AddressSpace,
    /// Image kind, if an image.
    pub image_type: ArgImageType,
    /// Image access, if an image.
    pub image_access: ArgImageAccess,
    /// Special kind.
    pub special_type: SpecialType,
}

impl ArgInfo {
    /// A global-memory buffer argument.
    pub fn buffer() -> Self {
        Self::default()
    }

    /// A by-value argument of `size` bytes.
    pub fn value(size: u32) -> Self {
        Self {
            size,
            address_space: AddressSpace::Constant,
            ..Default::default()
        }
    }

    /// An image argument.
    pub fn image(image_type: ArgImageType, access: ArgImageAccess) -> Self {
        Self {
            address_space: AddressSpace::Image,
            image_type,
            image_access: access,
            ..Default::default()
        }
    }

    /// Is an image argument.
    #[inline]
    pub fn is_image(&self) -> bool {
        self.address_space == AddressSpace::Image
    }

    /// Packs into the runtime word.
    pub fn to_word(&self) -> u64 {
        (self.size as u64)
            | ((self.address_space as u64) << ADDRESS_SPACE_SHIFT)
            | ((self.image_type as u64) << IMAGE_TYPE_SHIFT)
            | ((self.image_access as u64) << IMAGE_ACCESS_SHIFT)
            | ((self.special_type as u64) << SPECIAL_TYPE_SHIFT)
    }

    /// Unpacks a runtime word.
    pub fn from_word(word: u64) -> Result<Self> {
        Ok(Self {
            size: (word & SIZE_MASK) as u32,
            address_space: AddressSpace::from_u8(((word >> ADDRESS_SPACE_SHIFT) & 0x7) as u8)?,
            image_type: ArgImageType::from_u8(((word >> IMAGE_TYPE_SHIFT) & 0xFF) as u8)?,
            image_access: ArgImageAccess::from_u8(((word >> IMAGE_ACCESS_SHIFT) & 0x3) as u8)?,
            special_type: SpecialType::from_u8(((word >> SPECIAL_TYPE_SHIFT) & 0x7) as u8)?,
        })
    }
}

/// Metadata of one entry point.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionInfo {
    /// Entry point name.
    pub name: String,
    /// Stage.
    #[serde(rename = "type")]
    pub function_type: FunctionType,
    /// Required local size, all zero if none.
    pub local_size: UVec3,
    /// Arguments in declaration order.
    pub args: Vec<ArgInfo>,
}

impl FunctionInfo {
    /// Creates a kernel entry.
    pub fn kernel(name: impl Into<String>, args: Vec<ArgInfo>) -> Self {
        Self {
            name: name.into(),
            function_type: FunctionType::Kernel,
            local_size: UVec3::ZERO,
            args,
        }
    }

    /// Sets a required local size.
    pub fn with_local_size(mut self, local_size: UVec3) -> Self {
        self.local_size = local_size;
        self
    }

    /// Has a required local size.
    #[inline]
    pub fn has_required_local_size(&self) -> bool {
        self.local_size != UVec3::ZERO
    }

    /// Is a compute kernel.
    #[inline]
    pub fn is_kernel(&self) -> bool {
        self.function_type == FunctionType::Kernel
    }

    /// Packed argument words.
    pub fn arg_words(&self) -> Vec<u64> {
        self.args.iter().map(ArgInfo::to_word).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_word_layout() {
        let arg = ArgInfo {
            size: 16,
            address_space: AddressSpace::Image,
            image_type: ArgImageType::Image3D,
            image_access: ArgImageAccess::ReadWrite,
            special_type: SpecialType::None,
        };
        let word = arg.to_word();
        assert_eq!(word & 0xFFFF_FFFF, 16);
        assert_eq!((word >> 32) & 0x7, 3);
        assert_eq!((word >> 35) & 0xFF, 16);
        assert_eq!((word >> 43) & 0x3, 3);
        assert_eq!(ArgInfo::from_word(word).unwrap(), arg);
    }

    #[test]
    fn test_invalid_word() {
        // address space 7 does not exist
        let word = 7u64 << 32;
        let err = ArgInfo::from_word(word).unwrap_err();
        assert!(err.to_string().contains("address_space"));
    }

    #[test]
    fn test_arg_image_type_from_image_type() {
        assert_eq!(ArgImageType::from_image_type(ImageType::RGBA8UI_NORM), ArgImageType::Image2D);
        assert_eq!(ArgImageType::from_image_type(ImageType::IMAGE_CUBE_ARRAY), ArgImageType::ImageCubeArray);
        assert_eq!(ArgImageType::from_image_type(ImageType::D32F), ArgImageType::Image2DDepth);
        assert_eq!(ArgImageType::from_image_type(ImageType::IMAGE_3D), ArgImageType::Image3D);
        assert_eq!(ArgImageAccess::from(ImageType::RGBA8UI_NORM), ArgImageAccess::ReadWrite);
    }

    #[test]
    fn test_function_info_json() {
        let info = FunctionInfo::kernel("add", vec![ArgInfo::buffer(), ArgInfo::value(4)])
            .with_local_size(UVec3::new(64, 1, 1));
        let json = serde_json::to_string(&info).unwrap();
        let back: FunctionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
        assert!(back.has_required_local_size());
        assert_eq!(back.arg_words(), vec![ArgInfo::buffer().to_word(), ArgInfo::value(4).to_word()]);
    }
}
