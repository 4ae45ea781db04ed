//! Queues, fences and launch parameters.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use glam::UVec3;
use kiln_core::{AddressSpace, Device, FunctionInfo};

use super::context::AsAny;
use super::indirect::{CompletionHandler, IndirectCommandPipeline};
use super::program::Function;
use super::resource::{Buffer, Image};
use crate::{ComputeError, ComputeResult};

bitflags! {
    /// Pipeline stages a fence wait or signal is attached to.
    ///
    /// The empty set means "no particular stage" (compute / all commands).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SyncStage: u32 {
        const VERTEX = 1 << 0;
        const TESSELLATION = 1 << 1;
        const FRAGMENT = 1 << 2;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 3;
    }
}

/// Timeline values captured when a signal is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FenceValues {
    /// Counter value before the signal.
    pub unsignaled: u64,
    /// Counter value the signal sets.
    pub signaled: u64,
}

/// Timeline fence with a strictly monotonic counter.
pub trait Fence: Send + Sync + AsAny {
    /// Reserves the next signal value (atomic increment of the counter).
    fn next_signal_value(&self) -> FenceValues;

    /// Highest value the device (or host) has signalled so far.
    fn completed_value(&self) -> ComputeResult<u64>;

    /// Blocks until the counter reaches `value`. `None` waits forever.
    /// Returns `false` on timeout.
    fn wait(&self, value: u64, timeout: Option<Duration>) -> ComputeResult<bool>;

    /// Signals `value` from the host.
    fn signal(&self, value: u64) -> ComputeResult<()>;
}

/// A fence plus the values and stage one submission waits on or signals.
#[derive(Clone, Copy)]
pub struct FenceWait<'a> {
    pub fence: &'a dyn Fence,
    pub values: FenceValues,
    pub stage: SyncStage,
}

impl<'a> FenceWait<'a> {
    /// Waits for / signals `values.signaled` at no particular stage.
    pub fn new(fence: &'a dyn Fence, values: FenceValues) -> Self {
        Self { fence, values, stage: SyncStage::empty() }
    }
}

/// One kernel argument.
#[derive(Clone, Copy)]
pub enum KernelArg<'a> {
    /// Global memory buffer.
    Buffer(&'a dyn Buffer),
    /// Image.
    Image(&'a dyn Image),
    /// By-value bytes.
    Bytes(&'a [u8]),
}

impl<'a> KernelArg<'a> {
    /// By-value argument from a POD value.
    pub fn value<T: bytemuck::Pod>(value: &'a T) -> Self {
        Self::Bytes(bytemuck::bytes_of(value))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "buffer",
            Self::Image(_) => "image",
            Self::Bytes(_) => "value",
        }
    }
}

impl<'a> From<&'a Arc<dyn Buffer>> for KernelArg<'a> {
    fn from(buffer: &'a Arc<dyn Buffer>) -> Self {
        Self::Buffer(buffer.as_ref())
    }
}

impl<'a> From<&'a Arc<dyn Image>> for KernelArg<'a> {
    fn from(image: &'a Arc<dyn Image>) -> Self {
        Self::Image(image.as_ref())
    }
}

/// Synchronization of one submission.
#[derive(Clone, Copy, Default)]
pub struct SubmitParams<'a> {
    /// Fences waited on before the work starts.
    pub wait_fences: &'a [FenceWait<'a>],
    /// Fences signalled when the work completes.
    pub signal_fences: &'a [FenceWait<'a>],
    /// Block the caller until the work completed.
    pub blocking: bool,
    /// Label shown in debuggers / logs.
    pub debug_label: Option<&'a str>,
}

/// Parameters of a single kernel launch.
#[derive(Clone, Copy)]
pub struct LaunchParams<'a> {
    /// Total work items per dimension.
    pub global_size: UVec3,
    /// Work-group size; overridden by a function's required local size.
    pub local_size: UVec3,
    pub args: &'a [KernelArg<'a>],
    pub submit: SubmitParams<'a>,
}

impl<'a> LaunchParams<'a> {
    /// Blocking launch without fences.
    pub fn new(global_size: UVec3, local_size: UVec3, args: &'a [KernelArg<'a>]) -> Self {
        Self {
            global_size,
            local_size,
            args,
            submit: SubmitParams { blocking: true, ..Default::default() },
        }
    }

    /// Number of work-groups per dimension (global rounded up to local).
    pub fn group_count(&self, local_size: UVec3) -> UVec3 {
        group_count(self.global_size, local_size)
    }
}

/// Work groups covering `global_size`, at least one per dimension.
pub fn group_count(global_size: UVec3, local_size: UVec3) -> UVec3 {
    let local = local_size.max(UVec3::ONE);
    UVec3::new(
        global_size.x.max(1).div_ceil(local.x),
        global_size.y.max(1).div_ceil(local.y),
        global_size.z.max(1).div_ceil(local.z),
    )
}

/// Checks launch arguments against a function's declared layout.
pub(crate) fn check_args(info: &FunctionInfo, args: &[KernelArg<'_>]) -> ComputeResult<()> {
    if info.args.len() != args.len() {
        return Err(ComputeError::InvalidArgument(format!(
            "{}: expected {} arguments, got {}",
            info.name,
            info.args.len(),
            args.len()
        )));
    }
    for (index, (decl, arg)) in info.args.iter().zip(args).enumerate() {
        let ok = match arg {
            KernelArg::Image(_) => decl.is_image(),
            KernelArg::Buffer(_) => !decl.is_image() && !is_value_arg(decl),
            KernelArg::Bytes(bytes) => is_value_arg(decl) && (decl.size == 0 || bytes.len() == decl.size as usize),
        };
        if !ok {
            return Err(ComputeError::InvalidArgument(format!(
                "{}: argument {index} is a {}, declared {:?} ({} bytes)",
                info.name,
                arg.kind(),
                decl.address_space,
                decl.size
            )));
        }
    }
    Ok(())
}

fn is_value_arg(decl: &kiln_core::ArgInfo) -> bool {
    decl.address_space == AddressSpace::Constant && decl.size > 0
}

/// Local size actually used for a launch on `device`.
///
/// A function's required local size wins; otherwise the requested size is
/// clamped so its product stays within `max_total_local_size`.
pub(crate) fn effective_local_size(info: &FunctionInfo, device: &Device, requested: UVec3) -> UVec3 {
    if info.has_required_local_size() {
        return info.local_size;
    }
    let mut local = requested.max(UVec3::ONE);
    let max_total = device.max_total_local_size.max(1);
    // the product of three u32 sizes can exceed u32
    while u64::from(local.x) * u64::from(local.y) * u64::from(local.z) > u64::from(max_total) {
        if local.z > 1 {
            local.z /= 2;
        } else if local.y > 1 {
            local.y /= 2;
        } else {
            local.x = max_total;
        }
    }
    local
}

/// A submission surface on one device.
///
/// Submissions on one queue are serialized by a per-queue lock and execute in
/// submission order. Ordering across queues needs fences.
pub trait Queue: Send + Sync + AsAny {
    /// Device this queue submits to.
    fn device(&self) -> &Device;

    /// Blocks until every prior submission completed.
    fn finish(&self) -> ComputeResult<()>;

    /// Pushes buffered work to the device.
    fn flush(&self) -> ComputeResult<()> {
        Ok(())
    }

    /// Launches `function` with `params`.
    fn execute(&self, function: &dyn Function, params: &LaunchParams<'_>) -> ComputeResult<()>;

    /// Replays `range` (all commands if `None`) of a recorded pipeline in order.
    ///
    /// Waits apply to the first command, signals to the last. `completion`
    /// runs once after the last command completed.
    fn execute_indirect(
        &self,
        pipeline: &IndirectCommandPipeline,
        params: &SubmitParams<'_>,
        range: Option<Range<usize>>,
        completion: Option<CompletionHandler>,
    ) -> ComputeResult<()> {
        let range = pipeline.resolve_range(range)?;
        let (first, last) = (range.start, range.end.saturating_sub(1));
        for index in range.clone() {
            let command = pipeline.command(index)?;
            let args = command.kernel_args();
            let submit = SubmitParams {
                wait_fences: if index == first { params.wait_fences } else { &[] },
                signal_fences: if index == last { params.signal_fences } else { &[] },
                blocking: params.blocking && index == last,
                debug_label: params.debug_label.or(Some(pipeline.label())),
            };
            let launch = LaunchParams {
                global_size: command.global_size,
                local_size: command.local_size,
                args: &args,
                submit,
            };
            self.execute(command.function.as_ref(), &launch)?;
        }
        if !range.is_empty() && !params.blocking {
            self.finish()?;
        }
        if let Some(completion) = completion {
            completion();
        }
        Ok(())
    }

    /// Names the queue for debuggers and logs.
    fn set_debug_label(&self, label: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ArgInfo, FunctionInfo};

    #[test]
    fn test_group_count_rounds_up() {
        let p = LaunchParams::new(UVec3::new(100, 10, 1), UVec3::new(32, 4, 1), &[]);
        assert_eq!(p.group_count(p.local_size), UVec3::new(4, 3, 1));
        assert!(p.submit.blocking);
    }

    #[test]
    fn test_effective_local_size() {
        let device = Device { max_total_local_size: 256, ..Default::default() };
        let info = FunctionInfo::kernel("k", vec![]);
        assert_eq!(effective_local_size(&info, &device, UVec3::new(32, 32, 1)), UVec3::new(32, 8, 1));
        assert_eq!(effective_local_size(&info, &device, UVec3::ZERO), UVec3::ONE);
        let fixed = info.clone().with_local_size(UVec3::new(8, 8, 1));
        assert_eq!(effective_local_size(&fixed, &device, UVec3::new(64, 1, 1)), UVec3::new(8, 8, 1));

        let huge = effective_local_size(&info, &device, UVec3::splat(u32::MAX));
        assert!(huge.x * huge.y * huge.z <= 256);
        assert_eq!(effective_local_size(&info, &device, UVec3::new(u32::MAX, 1, 1)), UVec3::new(256, 1, 1));
    }

    #[test]
    fn test_check_args_value_size() {
        let info = FunctionInfo::kernel("k", vec![ArgInfo::value(4)]);
        let v = 1u32;
        assert!(check_args(&info, &[KernelArg::value(&v)]).is_ok());
        let wide = 1u64;
        assert!(check_args(&info, &[KernelArg::value(&wide)]).is_err());
        assert!(check_args(&info, &[]).is_err());
    }
}
