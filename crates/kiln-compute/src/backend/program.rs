//! Programs and functions.
//!
//! A program keeps one native module per device. Each device gets its binary
//! either from a universal binary (best match for the device) or from a
//! toolchain compiling the source for the device's exact target. A toolchain
//! failure or a missing match only drops that device.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_binary::{Archive, CompileOptions, MatchOptions, ProgramSource, Target, Toolchain, find_best_match_for_device_with};
use kiln_core::{Device, DeviceId, FunctionInfo};
use tracing::{debug, warn};

use super::context::AsAny;
use crate::{ComputeError, ComputeResult};

/// Where a program's binaries come from.
#[derive(Clone, Copy)]
pub enum ProgramInput<'a> {
    /// Pick the best binary per device from a universal binary.
    Archive(&'a Archive),
    /// Compile per device with a toolchain.
    Source {
        toolchain: &'a dyn Toolchain,
        source: ProgramSource<'a>,
        options: &'a CompileOptions,
    },
}

/// Binary chosen for one device.
#[derive(Debug, Clone)]
pub struct SelectedBinary {
    pub target: Target,
    pub data: Vec<u8>,
    pub functions: Vec<FunctionInfo>,
}

/// Picks or builds the binary for `device`. `None` means "no binary for this device".
pub fn select_binary(device: &Device, input: &ProgramInput<'_>, matching: &MatchOptions) -> Option<SelectedBinary> {
    match input {
        ProgramInput::Archive(archive) => {
            let Some(best) = find_best_match_for_device_with(device, archive, matching) else {
                warn!(device = %device.id, "no compatible binary in universal binary");
                return None;
            };
            let functions = match best.binary.function_infos() {
                Ok(functions) => functions,
                Err(e) => {
                    warn!(device = %device.id, error = %e, "bad function info in universal binary");
                    return None;
                }
            };
            debug!(device = %device.id, index = best.index, binary_target = %best.target, "selected binary");
            Some(SelectedBinary { target: best.target, data: best.binary.data.clone(), functions })
        }
        ProgramInput::Source { toolchain, source, options } => {
            let mut target = Target::for_device(device)?;
            if let Target::Cuda(cuda) = &mut target {
                if matching.cuda_force_compile_sm != 0 {
                    cuda.sm_major = matching.cuda_force_compile_sm / 10;
                    cuda.sm_minor = matching.cuda_force_compile_sm % 10;
                }
            }
            match toolchain.compile(&target, *source, options) {
                Ok(program) => {
                    debug!(device = %device.id, binary_target = %target, bytes = program.data.len(), "compiled program");
                    Some(SelectedBinary { target, data: program.data, functions: program.functions })
                }
                Err(e) => {
                    warn!(device = %device.id, error = %e, "toolchain failed, skipping device");
                    None
                }
            }
        }
    }
}

/// A kernel entry point available on one or more devices.
pub trait Function: Send + Sync + AsAny {
    /// Entry point name.
    fn name(&self) -> &str;

    /// Declared layout on `device`, if the function exists there.
    fn info(&self, device: DeviceId) -> Option<&FunctionInfo>;

    /// Devices this function was loaded on.
    fn devices(&self) -> Vec<DeviceId>;
}

/// A built program.
pub trait Program: Send + Sync + AsAny {
    /// Looks a kernel up by name.
    fn function(&self, name: &str) -> Option<Arc<dyn Function>>;

    /// Names of every kernel in the program.
    fn function_names(&self) -> Vec<String>;

    /// Devices the program was built for.
    fn devices(&self) -> Vec<DeviceId>;
}

/// Per-device module plus the function infos it was built with.
#[derive(Debug)]
pub struct DeviceProgram<M> {
    pub module: M,
    pub target: Target,
    pub functions: Vec<FunctionInfo>,
}

impl<M> DeviceProgram<M> {
    /// Builds a module for each device with `load`, skipping devices without a binary.
    ///
    /// Fails only if no device ended up with a module.
    pub fn build_all<'d>(
        devices: impl IntoIterator<Item = &'d Device>,
        input: &ProgramInput<'_>,
        options: &MatchOptions,
        mut load: impl FnMut(&Device, &SelectedBinary) -> ComputeResult<M>,
    ) -> ComputeResult<HashMap<DeviceId, DeviceProgram<M>>> {
        let mut programs = HashMap::new();
        for device in devices {
            let Some(binary) = select_binary(device, input, options) else {
                continue;
            };
            match load(device, &binary) {
                Ok(module) => {
                    programs.insert(
                        device.id,
                        DeviceProgram { module, target: binary.target, functions: binary.functions },
                    );
                }
                Err(e) => warn!(device = %device.id, error = %e, "failed to load module"),
            }
        }
        if programs.is_empty() {
            return Err(ComputeError::ProgramBuild("no device has a usable binary".into()));
        }
        Ok(programs)
    }

    /// Function info by name.
    pub fn function(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// Union of kernel names over all devices, sorted.
pub(crate) fn kernel_names<M>(programs: &HashMap<DeviceId, DeviceProgram<M>>) -> Vec<String> {
    let mut names: Vec<String> = programs
        .values()
        .flat_map(|p| p.functions.iter().filter(|f| f.is_kernel()).map(|f| f.name.clone()))
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_binary::{BinaryError, BinaryResult, HostTarget, ProgramData};
    use kiln_core::{BackendDeviceInfo, DeviceKind, HostDeviceInfo};

    struct FailingToolchain;

    impl Toolchain for FailingToolchain {
        fn compile(&self, target: &Target, _: ProgramSource<'_>, _: &CompileOptions) -> BinaryResult<ProgramData> {
            Err(BinaryError::Toolchain { target: target.to_string(), message: "boom".into() })
        }

        fn version(&self) -> u32 {
            0
        }
    }

    fn host_device() -> Device {
        Device {
            id: DeviceId::new(DeviceKind::Cpu, 0),
            backend: BackendDeviceInfo::Host(HostDeviceInfo::detect()),
            ..Default::default()
        }
    }

    #[test]
    fn test_toolchain_failure_skips_device() {
        let options = CompileOptions::default();
        let input = ProgramInput::Source { toolchain: &FailingToolchain, source: ProgramSource::Memory("k"), options: &options };
        let device = host_device();
        assert!(select_binary(&device, &input, &MatchOptions::default()).is_none());
        let built = DeviceProgram::build_all([&device], &input, &MatchOptions::default(), |_, _| Ok(()));
        assert!(matches!(built, Err(ComputeError::ProgramBuild(_))));
    }

    #[test]
    fn test_archive_selection() {
        let device = host_device();
        let host = device.host().cloned().unwrap_or_default();
        let mut archive = Archive::new();
        archive.push(
            Target::Host(HostTarget { arch: host.arch, cpu_tier: 0 }),
            10000,
            Vec::new(),
            b"host".to_vec(),
        );
        let input = ProgramInput::Archive(&archive);
        let selected = select_binary(&device, &input, &MatchOptions::default()).unwrap();
        assert_eq!(selected.data, b"host");

        let built = DeviceProgram::build_all([&device], &input, &MatchOptions::default(), |_, b| Ok(b.data.len())).unwrap();
        assert_eq!(built[&device.id].module, 4);
    }
}
