//! Memory allocation and mapping flags.

use bitflags::bitflags;

bitflags! {
    /// Contracts consumed when allocating a buffer or image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryFlag: u32 {
        /// Kernels may read.
        const READ = 1 << 0;
        /// Kernels may write.
        const WRITE = 1 << 1;
        /// Kernels may read and write.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Host may read (map for reading).
        const HOST_READ = 1 << 2;
        /// Host may write (map for writing).
        const HOST_WRITE = 1 << 3;
        /// Host may read and write.
        const HOST_READ_WRITE = Self::HOST_READ.bits() | Self::HOST_WRITE.bits();
        /// Host never touches this memory.
        const HOST_NO_ACCESS = 1 << 4;
        /// Skip the initial host -> device copy even if host data is given.
        const NO_INITIAL_COPY = 1 << 5;
        /// Backing memory is shared with (imported from) Vulkan.
        const VULKAN_SHARING = 1 << 6;
        /// Backing memory is shared with Metal.
        const METAL_SHARING = 1 << 7;
        /// Allow driver-side lossless compression.
        const GENERIC_COMPRESSION = 1 << 8;
        /// Images only: regenerate the mip chain after every host write.
        const GENERATE_MIP_MAPS = 1 << 9;
        /// Images only: native object is created as a cube array.
        const USAGE_CUBE_ARRAY = 1 << 10;
    }
}

impl Default for MemoryFlag {
    fn default() -> Self {
        Self::READ_WRITE | Self::HOST_READ_WRITE
    }
}

impl MemoryFlag {
    /// Host may map for reading.
    #[inline]
    pub fn host_readable(self) -> bool {
        self.contains(Self::HOST_READ) && !self.contains(Self::HOST_NO_ACCESS)
    }

    /// Host may map for writing.
    #[inline]
    pub fn host_writable(self) -> bool {
        self.contains(Self::HOST_WRITE) && !self.contains(Self::HOST_NO_ACCESS)
    }

    /// Memory is imported from another API.
    #[inline]
    pub fn is_shared(self) -> bool {
        self.intersects(Self::VULKAN_SHARING | Self::METAL_SHARING)
    }
}

bitflags! {
    /// Flags for mapping device memory into host memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlag: u32 {
        /// Copy device contents to the staging memory.
        const READ = 1 << 0;
        /// Copy staging memory back to the device on unmap.
        const WRITE = 1 << 1;
        /// Like `WRITE`, but previous contents need not be read.
        const WRITE_INVALIDATE = 1 << 2;
        /// Wait for all queued work before reading.
        const BLOCK = 1 << 3;
        /// Read + write.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl MapFlag {
    /// Unmap must copy staging memory back.
    #[inline]
    pub fn writes_back(self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_INVALIDATE)
    }

    /// Map must read device contents first.
    #[inline]
    pub fn reads(self) -> bool {
        self.contains(Self::READ) && !self.contains(Self::WRITE_INVALIDATE)
    }

    /// `READ` together with `WRITE_INVALIDATE` is contradictory.
    #[inline]
    pub fn is_consistent(self) -> bool {
        !(self.contains(Self::READ) && self.contains(Self::WRITE_INVALIDATE))
            && self.intersects(Self::READ | Self::WRITE | Self::WRITE_INVALIDATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_flag_bits() {
        assert_eq!(MemoryFlag::READ_WRITE.bits(), 3);
        assert_eq!(MemoryFlag::HOST_READ_WRITE.bits(), 12);
        assert_eq!(MemoryFlag::NO_INITIAL_COPY.bits(), 32);
        assert_eq!(MemoryFlag::GENERIC_COMPRESSION.bits(), 256);
        assert_eq!(MemoryFlag::USAGE_CUBE_ARRAY.bits(), 1024);
    }

    #[test]
    fn test_host_access() {
        let f = MemoryFlag::READ | MemoryFlag::HOST_READ;
        assert!(f.host_readable());
        assert!(!f.host_writable());
        let f = MemoryFlag::HOST_READ_WRITE | MemoryFlag::HOST_NO_ACCESS;
        assert!(!f.host_readable());
        assert!((MemoryFlag::VULKAN_SHARING | MemoryFlag::READ).is_shared());
    }

    #[test]
    fn test_map_flag_consistency() {
        assert!(MapFlag::READ_WRITE.is_consistent());
        assert!(!(MapFlag::READ | MapFlag::WRITE_INVALIDATE).is_consistent());
        assert!(!MapFlag::BLOCK.is_consistent());
        assert!(MapFlag::WRITE_INVALIDATE.writes_back());
        assert!(!MapFlag::WRITE_INVALIDATE.reads());
    }
}
