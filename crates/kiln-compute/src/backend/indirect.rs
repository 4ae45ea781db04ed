//! Recorded kernel dispatches, replayed by [`Queue::execute_indirect`](super::Queue::execute_indirect).

use std::ops::Range;
use std::sync::Arc;

use glam::UVec3;

use super::program::Function;
use super::queue::KernelArg;
use super::resource::{Buffer, Image};
use crate::{ComputeError, ComputeResult};

/// Callback run once after an indirect submission completed.
pub type CompletionHandler = Box<dyn FnOnce() + Send>;

/// Owned counterpart of [`KernelArg`] kept by a recorded command.
#[derive(Clone)]
pub enum OwnedKernelArg {
    Buffer(Arc<dyn Buffer>),
    Image(Arc<dyn Image>),
    Bytes(Vec<u8>),
}

impl OwnedKernelArg {
    /// By-value argument from a POD value.
    pub fn value<T: bytemuck::Pod>(value: &T) -> Self {
        Self::Bytes(bytemuck::bytes_of(value).to_vec())
    }

    fn as_arg(&self) -> KernelArg<'_> {
        match self {
            Self::Buffer(buffer) => KernelArg::Buffer(buffer.as_ref()),
            Self::Image(image) => KernelArg::Image(image.as_ref()),
            Self::Bytes(bytes) => KernelArg::Bytes(bytes),
        }
    }
}

/// One recorded dispatch.
#[derive(Clone)]
pub struct IndirectCommand {
    pub function: Arc<dyn Function>,
    pub global_size: UVec3,
    pub local_size: UVec3,
    pub args: Vec<OwnedKernelArg>,
}

impl IndirectCommand {
    /// Borrowed arguments for a launch.
    pub fn kernel_args(&self) -> Vec<KernelArg<'_>> {
        self.args.iter().map(OwnedKernelArg::as_arg).collect()
    }
}

/// An ordered list of compute dispatches.
///
/// Commands keep their buffers and images alive until the pipeline is dropped.
#[derive(Clone, Default)]
pub struct IndirectCommandPipeline {
    label: String,
    commands: Vec<IndirectCommand>,
}

impl IndirectCommandPipeline {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), commands: Vec::new() }
    }

    /// Records a dispatch and returns its index.
    pub fn add_compute_command(
        &mut self,
        function: Arc<dyn Function>,
        global_size: UVec3,
        local_size: UVec3,
        args: Vec<OwnedKernelArg>,
    ) -> usize {
        self.commands.push(IndirectCommand { function, global_size, local_size, args });
        self.commands.len() - 1
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Command at `index`.
    pub fn command(&self, index: usize) -> ComputeResult<&IndirectCommand> {
        self.commands.get(index).ok_or_else(|| {
            ComputeError::InvalidArgument(format!("{}: no command {index} (have {})", self.label, self.commands.len()))
        })
    }

    /// `None` selects every command; explicit ranges must lie inside the pipeline.
    pub fn resolve_range(&self, range: Option<Range<usize>>) -> ComputeResult<Range<usize>> {
        let range = range.unwrap_or(0..self.commands.len());
        if range.start > range.end || range.end > self.commands.len() {
            return Err(ComputeError::InvalidArgument(format!(
                "{}: range {range:?} outside {} commands",
                self.label,
                self.commands.len()
            )));
        }
        Ok(range)
    }

    /// Drops every recorded command.
    pub fn reset(&mut self) {
        self.commands.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_range() {
        let pipeline = IndirectCommandPipeline::new("empty");
        assert_eq!(pipeline.resolve_range(None).unwrap(), 0..0);
        assert!(pipeline.resolve_range(Some(0..1)).is_err());
        assert!(pipeline.command(0).is_err());
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_owned_value_arg() {
        let arg = OwnedKernelArg::value(&7u32);
        assert!(matches!(arg.as_arg(), KernelArg::Bytes(b) if b == [7, 0, 0, 0]));
    }
}
