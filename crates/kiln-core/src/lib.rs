//! # kiln-core
//!
//! Core descriptor types for the kiln compute runtime.
//!
//! - [`ImageType`] - bit-packed image classification with pure size/mip derivations
//! - [`MemoryFlag`], [`MapFlag`] - allocation and mapping contracts
//! - [`Device`] - capability record filled by each backend
//! - [`FunctionInfo`], [`ArgInfo`] - entry point metadata
//! - [`Config`] - JSON runtime configuration
//!
//! ## Crate Structure
//!
//! This crate has no internal dependencies:
//!
//! ```text
//! kiln-core (this crate)
//!    ^
//!    |
//!    +-- kiln-binary (universal binary container, best-match)
//!    +-- kiln-compute (runtime and backends)
//!    +-- kiln-cli
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod device;
pub mod error;
pub mod function_info;
pub mod image_type;
pub mod memory_flag;

pub use config::Config;
pub use device::{
    ApiVersion, BackendDeviceInfo, CudaDeviceInfo, Device, DeviceId, DeviceKind, HostArch, HostDeviceInfo,
    MetalDeviceInfo, OpenClDeviceInfo, Vendor, VulkanDeviceInfo,
};
pub use error::{Error, Result};
pub use function_info::{
    AddressSpace, ArgImageAccess, ArgImageType, ArgInfo, FunctionInfo, FunctionType, SpecialType,
};
pub use image_type::{ImageAccess, ImageCompression, ImageDataType, ImageFormat, ImageLayout, ImageType};
pub use memory_flag::{MapFlag, MemoryFlag};

/// Prelude module for convenient imports.
///
/// ```
/// use kiln_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::device::{Device, DeviceId, DeviceKind, Vendor};
    pub use crate::error::{Error, Result};
    pub use crate::function_info::{ArgInfo, FunctionInfo};
    pub use crate::image_type::ImageType;
    pub use crate::memory_flag::{MapFlag, MemoryFlag};
    pub use glam::{UVec2, UVec3, UVec4};
}
