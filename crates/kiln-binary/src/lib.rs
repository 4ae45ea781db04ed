//! Universal binary container ("FUBA") for kiln.
//!
//! A universal binary bundles precompiled kernels for several backends in one
//! file. At load time the runtime picks the binary that best fits the device
//! actually present, so no toolchain is needed on the target machine.
//!
//! # Architecture
//!
//! ```text
//! build_archive (rayon pool)
//!     └── Toolchain trait ──► ProgramData per Target
//!             └── Archive::write_to ──► "FUBA" file
//!
//! load_archive ──► Archive (verified: sizes, offsets, SHA-256)
//!     └── find_best_match_for_device(&Device) ──► BestMatch
//!             └── ArchiveBinary::function_infos() ──► Vec<FunctionInfo>
//! ```
//!
//! # Example
//!
//! ```
//! use kiln_binary::{Archive, CudaTarget, Target, find_best_match_for_device};
//! use kiln_core::prelude::UVec2;
//! use kiln_core::{BackendDeviceInfo, CudaDeviceInfo, Device};
//!
//! let mut archive = Archive::new();
//! archive.push(Target::Cuda(CudaTarget::ptx((7, 5), (6, 3))), 10000, Vec::new(), b"sm75".to_vec());
//! archive.push(Target::Cuda(CudaTarget::ptx((8, 6), (7, 5))), 10000, Vec::new(), b"sm86".to_vec());
//!
//! let device = Device {
//!     backend: BackendDeviceInfo::Cuda(CudaDeviceInfo {
//!         sm: UVec2::new(8, 6),
//!         min_req_ptx: UVec2::new(7, 0),
//!         ..Default::default()
//!     }),
//!     ..Default::default()
//! };
//! let best = find_best_match_for_device(&device, &archive).unwrap();
//! assert_eq!(best.index, 1);
//! ```

pub mod archive;
pub mod build;
pub mod matching;
pub mod target;
pub mod toolchain;
pub mod translate;

pub use archive::{
    Archive, ArchiveArgInfo, ArchiveBinary, ArchiveFunctionInfo, FORMAT_VERSION, FUNCTION_INFO_VERSION,
    MAGIC, load_archive, load_archive_from_memory,
};
pub use build::{build_archive, build_archive_from_file, build_archive_from_memory};
pub use matching::{BestMatch, MatchOptions, find_best_match_for_device, find_best_match_for_device_with, is_compatible};
pub use target::{
    ComputeType, CudaTarget, HostTarget, MetalTarget, OpenClDeviceTarget, OpenClTarget, Target, VendorTarget,
    VulkanTarget,
};
pub use toolchain::{
    CommandToolchain, CompileOptions, ProgramData, ProgramSource, Toolchain, ToolchainTarget, parse_version_word,
    version_word,
};

use thiserror::Error;

/// Universal binary errors.
#[derive(Error, Debug)]
pub enum BinaryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic {0:?}, expected \"FUBA\"")]
    InvalidMagic([u8; 4]),

    #[error("unsupported archive version {0}")]
    UnsupportedVersion(u32),

    #[error("archive truncated: {0}")]
    Truncated(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("binary #{index}: offset {found} does not match expected {expected}")]
    OffsetMismatch { index: usize, expected: u64, found: u64 },

    #[error("binary #{index}: function info size {expected} does not match parsed size {parsed}")]
    FunctionInfoSizeMismatch { index: usize, expected: u32, parsed: u64 },

    #[error("binary #{index}: binary size {expected} exceeds available {available} bytes")]
    BinarySizeMismatch { index: usize, expected: u32, available: u64 },

    #[error("binary #{index}: SHA-256 hash mismatch")]
    HashMismatch { index: usize },

    #[error("binary #{index}: invalid function info: {reason}")]
    InvalidFunctionInfo { index: usize, reason: String },

    #[error(transparent)]
    Core(#[from] kiln_core::Error),

    #[error("toolchain failed for {target}: {message}")]
    Toolchain { target: String, message: String },

    #[error("build failed for {} target(s): {}", .0.len(), .0.join(", "))]
    BuildFailed(Vec<String>),
}

impl BinaryError {
    /// Returns `true` for errors raised while validating an archive.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidMagic(_)
                | Self::UnsupportedVersion(_)
                | Self::Truncated(_)
                | Self::InvalidTarget(_)
                | Self::OffsetMismatch { .. }
                | Self::FunctionInfoSizeMismatch { .. }
                | Self::BinarySizeMismatch { .. }
                | Self::HashMismatch { .. }
                | Self::InvalidFunctionInfo { .. }
        )
    }
}

/// Result alias for universal binary operations.
pub type BinaryResult<T> = Result<T, BinaryError>;
