//! Fixed sampler table.
//!
//! Every sampler state a kernel can ask for packs into 10 bits, so each
//! read-only image owns a table of 1024 native samplers indexed by that
//! word. Entries are created on first use.
//!
//! ```text
//! bits 0..1  address mode
//! bit  2     filter
//! bit  3     coordinate mode
//! bits 4..6  log2(anisotropy)
//! bits 7..9  depth compare function
//! ```

use std::sync::OnceLock;

use crate::{ComputeError, ComputeResult};

/// Number of distinct sampler states.
pub const SAMPLER_COUNT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AddressMode {
    #[default]
    ClampToEdge = 0,
    Repeat = 1,
    MirrorRepeat = 2,
    ClampToBorder = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FilterMode {
    #[default]
    Nearest = 0,
    Linear = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CoordMode {
    /// Coordinates in [0, 1].
    #[default]
    Normalized = 0,
    /// Coordinates in texels.
    Pixel = 1,
}

/// Depth compare function; `Never` doubles as "no comparison".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CompareFunction {
    #[default]
    Never = 0,
    Less = 1,
    Equal = 2,
    LessOrEqual = 3,
    Greater = 4,
    NotEqual = 5,
    GreaterOrEqual = 6,
    Always = 7,
}

/// One sampler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerDesc {
    pub address_mode: AddressMode,
    pub filter: FilterMode,
    pub coord_mode: CoordMode,
    /// log2 of the max anisotropy (0 = off, 4 = 16x).
    pub anisotropy_log2: u8,
    pub compare: CompareFunction,
}

impl SamplerDesc {
    /// Table index of this state.
    pub fn index(&self) -> usize {
        (self.address_mode as usize)
            | (self.filter as usize) << 2
            | (self.coord_mode as usize) << 3
            | (self.anisotropy_log2 as usize & 0x7) << 4
            | (self.compare as usize) << 7
    }

    /// State stored at table `index`.
    pub fn from_index(index: usize) -> Self {
        let address_mode = match index & 0x3 {
            0 => AddressMode::ClampToEdge,
            1 => AddressMode::Repeat,
            2 => AddressMode::MirrorRepeat,
            _ => AddressMode::ClampToBorder,
        };
        let filter = if index & 0x4 != 0 { FilterMode::Linear } else { FilterMode::Nearest };
        let coord_mode = if index & 0x8 != 0 { CoordMode::Pixel } else { CoordMode::Normalized };
        let compare = match (index >> 7) & 0x7 {
            0 => CompareFunction::Never,
            1 => CompareFunction::Less,
            2 => CompareFunction::Equal,
            3 => CompareFunction::LessOrEqual,
            4 => CompareFunction::Greater,
            5 => CompareFunction::NotEqual,
            6 => CompareFunction::GreaterOrEqual,
            _ => CompareFunction::Always,
        };
        Self { address_mode, filter, coord_mode, anisotropy_log2: ((index >> 4) & 0x7) as u8, compare }
    }

    /// Max anisotropy as a sample count (1 = off), capped at 16.
    pub fn max_anisotropy(&self) -> u32 {
        1 << self.anisotropy_log2.min(4)
    }

    pub fn is_depth_compare(&self) -> bool {
        self.compare != CompareFunction::Never
    }
}

/// 1024 lazily created native samplers.
pub struct SamplerTable<S> {
    entries: Vec<OnceLock<S>>,
}

impl<S> Default for SamplerTable<S> {
    fn default() -> Self {
        Self { entries: (0..SAMPLER_COUNT).map(|_| OnceLock::new()).collect() }
    }
}

impl<S> SamplerTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sampler for `desc`, creating it with `create` on first use.
    pub fn get_or_create(&self, desc: SamplerDesc, create: impl FnOnce(SamplerDesc) -> ComputeResult<S>) -> ComputeResult<&S> {
        let slot = self
            .entries
            .get(desc.index())
            .ok_or_else(|| ComputeError::InvalidArgument(format!("sampler index {} out of range", desc.index())))?;
        if let Some(sampler) = slot.get() {
            return Ok(sampler);
        }
        let sampler = create(desc)?;
        // a racing creator may have won; its sampler is kept and ours dropped
        Ok(slot.get_or_init(|| sampler))
    }

    /// Number of samplers created so far.
    pub fn created(&self) -> usize {
        self.entries.iter().filter(|e| e.get().is_some()).count()
    }

    /// Created samplers with their table index.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &S)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| e.get().map(|s| (i, s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_covers_table() {
        let mut seen = vec![false; SAMPLER_COUNT];
        for index in 0..SAMPLER_COUNT {
            let desc = SamplerDesc::from_index(index);
            assert_eq!(desc.index(), index);
            seen[desc.index()] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_lazy_creation() {
        let table = SamplerTable::<u32>::new();
        let desc = SamplerDesc { filter: FilterMode::Linear, compare: CompareFunction::Less, ..Default::default() };
        assert_eq!(*table.get_or_create(desc, |d| Ok(d.index() as u32)).unwrap(), desc.index() as u32);
        assert_eq!(*table.get_or_create(desc, |_| Ok(0)).unwrap(), desc.index() as u32);
        assert!(table.get_or_create(SamplerDesc::default(), |_| Err(ComputeError::Unsupported("x".into()))).is_err());
        assert_eq!(table.created(), 1);
        assert!(desc.is_depth_compare());
    }
}
