//! Conversion between archive metadata and runtime [`FunctionInfo`].

use kiln_core::{
    AddressSpace, ArgImageAccess, ArgImageType, ArgInfo, FunctionInfo, FunctionType, SpecialType,
};
use kiln_core::prelude::UVec3;

use crate::archive::{ArchiveArgInfo, ArchiveFunctionInfo, FUNCTION_INFO_VERSION};
use crate::{BinaryError, BinaryResult};

impl From<&ArgInfo> for ArchiveArgInfo {
    fn from(arg: &ArgInfo) -> Self {
        Self {
            size: arg.size,
            address_space: arg.address_space as u8,
            image_type: arg.image_type as u8,
            image_access: arg.image_access as u8,
            special_type: arg.special_type as u8,
        }
    }
}

impl TryFrom<&ArchiveArgInfo> for ArgInfo {
    type Error = kiln_core::Error;

    fn try_from(arg: &ArchiveArgInfo) -> kiln_core::Result<Self> {
        Ok(Self {
            size: arg.size,
            address_space: AddressSpace::from_u8(arg.address_space)?,
            image_type: ArgImageType::from_u8(arg.image_type)?,
            image_access: ArgImageAccess::from_u8(arg.image_access)?,
            special_type: SpecialType::from_u8(arg.special_type)?,
        })
    }
}

impl From<&FunctionInfo> for ArchiveFunctionInfo {
    fn from(info: &FunctionInfo) -> Self {
        Self {
            version: FUNCTION_INFO_VERSION,
            function_type: info.function_type as u32,
            local_size: info.local_size.to_array(),
            name: info.name.clone(),
            args: info.args.iter().map(ArchiveArgInfo::from).collect(),
        }
    }
}

/// Converts one archive entry into runtime metadata.
pub fn to_runtime(info: &ArchiveFunctionInfo) -> BinaryResult<FunctionInfo> {
    if info.version != FUNCTION_INFO_VERSION {
        return Err(BinaryError::InvalidFunctionInfo {
            index: 0,
            reason: format!("{}: unsupported function info version {}", info.name, info.version),
        });
    }
    let raw_type = u8::try_from(info.function_type)
        .map_err(|_| kiln_core::Error::invalid_field("function_type", info.function_type as u64))?;
    Ok(FunctionInfo {
        name: info.name.clone(),
        function_type: FunctionType::from_u8(raw_type)?,
        local_size: UVec3::from_array(info.local_size),
        args: info.args.iter().map(ArgInfo::try_from).collect::<kiln_core::Result<_>>()?,
    })
}

/// Converts every archive entry of one binary.
pub fn to_runtime_all(infos: &[ArchiveFunctionInfo]) -> BinaryResult<Vec<FunctionInfo>> {
    infos.iter().map(to_runtime).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_kernel() {
        let info = FunctionInfo::kernel(
            "blur",
            vec![
                ArgInfo::buffer(),
                ArgInfo::value(16),
                ArgInfo::image(ArgImageType::Image2D, ArgImageAccess::Read),
            ],
        )
        .with_local_size(UVec3::new(16, 16, 1));

        let archived = ArchiveFunctionInfo::from(&info);
        assert_eq!(archived.version, FUNCTION_INFO_VERSION);
        assert_eq!(archived.function_type, 1);
        assert_eq!(archived.args[2].image_type, ArgImageType::Image2D as u8);
        assert_eq!(to_runtime(&archived).unwrap(), info);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut archived = ArchiveFunctionInfo::from(&FunctionInfo::kernel("k", vec![]));
        archived.version = 7;
        assert!(matches!(to_runtime(&archived), Err(BinaryError::InvalidFunctionInfo { .. })));
    }

    #[test]
    fn test_rejects_bad_fields() {
        let mut archived = ArchiveFunctionInfo::from(&FunctionInfo::kernel("k", vec![ArgInfo::buffer()]));
        archived.args[0].address_space = 9;
        assert!(matches!(to_runtime(&archived), Err(BinaryError::Core(_))));

        archived.args[0].address_space = 0;
        archived.function_type = 300;
        assert!(matches!(to_runtime(&archived), Err(BinaryError::Core(_))));
    }
}
