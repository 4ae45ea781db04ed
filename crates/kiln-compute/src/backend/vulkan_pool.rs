//! Vulkan side of the command-pool manager.

use std::sync::Arc;

use ash::vk;
use tracing::error;

use super::command_pool::{CommandBackend, FenceStatus};
use super::queue::{FenceWait, SyncStage};
use super::vulkan_backend::{VulkanDevice, VulkanFence, vk_error};
use crate::{ComputeError, ComputeResult};

/// Pipeline stages of an abstract sync stage; the empty set waits on everything.
pub fn sync_stage_mask(stage: SyncStage) -> vk::PipelineStageFlags2 {
    if stage.is_empty() {
        return vk::PipelineStageFlags2::ALL_COMMANDS;
    }
    let mut mask = vk::PipelineStageFlags2::NONE;
    if stage.contains(SyncStage::VERTEX) {
        mask |= vk::PipelineStageFlags2::VERTEX_SHADER;
    }
    if stage.contains(SyncStage::TESSELLATION) {
        mask |= vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER
            | vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER;
    }
    if stage.contains(SyncStage::FRAGMENT) {
        mask |= vk::PipelineStageFlags2::FRAGMENT_SHADER;
    }
    if stage.contains(SyncStage::COLOR_ATTACHMENT_OUTPUT) {
        mask |= vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
    }
    mask
}

fn semaphore_infos(fences: &[FenceWait<'_>]) -> ComputeResult<Vec<vk::SemaphoreSubmitInfo<'static>>> {
    fences
        .iter()
        .map(|wait| {
            let fence = wait
                .fence
                .as_any()
                .downcast_ref::<VulkanFence>()
                .ok_or_else(|| ComputeError::InvalidArgument("fence does not belong to the Vulkan backend".into()))?;
            Ok(vk::SemaphoreSubmitInfo::default()
                .semaphore(fence.semaphore())
                .value(wait.values.signaled)
                .stage_mask(sync_stage_mask(wait.stage)))
        })
        .collect()
}

/// Pools, command buffers and fences of one native queue.
pub struct VulkanCommandBackend {
    device: Arc<VulkanDevice>,
    queue: usize,
}

impl VulkanCommandBackend {
    pub(crate) fn new(device: Arc<VulkanDevice>, queue: usize) -> Self {
        Self { device, queue }
    }

    pub(crate) fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub(crate) fn queue_index(&self) -> usize {
        self.queue
    }

    fn fence_result(&self, result: Result<(), vk::Result>) -> FenceStatus {
        match result {
            Ok(()) => FenceStatus::Signaled,
            Err(vk::Result::NOT_READY | vk::Result::TIMEOUT) => FenceStatus::NotReady,
            Err(vk::Result::ERROR_DEVICE_LOST) => FenceStatus::DeviceLost,
            Err(e) => {
                error!(error = ?e, "fence query failed");
                FenceStatus::DeviceLost
            }
        }
    }
}

#[allow(unsafe_code)]
impl CommandBackend for VulkanCommandBackend {
    type Pool = vk::CommandPool;
    type CommandBuffer = vk::CommandBuffer;
    type Fence = vk::Fence;

    fn create_pool(&self, _secondary: bool) -> ComputeResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.device.family);
        unsafe { self.device.device.create_command_pool(&info, None) }.map_err(vk_error("vkCreateCommandPool"))
    }

    fn allocate_command_buffers(
        &self,
        pool: &vk::CommandPool,
        secondary: bool,
        count: usize,
    ) -> ComputeResult<Vec<vk::CommandBuffer>> {
        let level = if secondary { vk::CommandBufferLevel::SECONDARY } else { vk::CommandBufferLevel::PRIMARY };
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(level)
            .command_buffer_count(count as u32);
        unsafe { self.device.device.allocate_command_buffers(&info) }.map_err(vk_error("vkAllocateCommandBuffers"))
    }

    fn create_fence(&self) -> ComputeResult<vk::Fence> {
        unsafe { self.device.device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(vk_error("vkCreateFence"))
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer, secondary: bool) -> ComputeResult<()> {
        let device = &self.device.device;
        let inheritance = vk::CommandBufferInheritanceInfo::default();
        let mut begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if secondary {
            begin = begin.inheritance_info(&inheritance);
        }
        unsafe {
            device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
                .map_err(vk_error("vkResetCommandBuffer"))?;
            device.begin_command_buffer(buffer, &begin).map_err(vk_error("vkBeginCommandBuffer"))
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> ComputeResult<()> {
        unsafe { self.device.device.reset_fences(&[fence]) }.map_err(vk_error("vkResetFences"))
    }

    fn submit(
        &self,
        buffer: vk::CommandBuffer,
        fence: vk::Fence,
        wait_fences: &[FenceWait<'_>],
        signal_fences: &[FenceWait<'_>],
    ) -> ComputeResult<()> {
        let waits = semaphore_infos(wait_fences)?;
        let signals = semaphore_infos(signal_fences)?;
        let buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(buffer)];
        let submit = vk::SubmitInfo2::default()
            .command_buffer_infos(&buffers)
            .wait_semaphore_infos(&waits)
            .signal_semaphore_infos(&signals);
        let device = &self.device.device;
        unsafe { device.end_command_buffer(buffer) }.map_err(vk_error("vkEndCommandBuffer"))?;
        self.device.with_queue(self.queue, |queue| {
            unsafe { device.queue_submit2(queue, &[submit], fence) }.map_err(vk_error("vkQueueSubmit2"))
        })
    }

    fn execute_secondary(&self, primary: vk::CommandBuffer, secondary: vk::CommandBuffer) -> ComputeResult<()> {
        let device = &self.device.device;
        unsafe {
            device.end_command_buffer(secondary).map_err(vk_error("vkEndCommandBuffer"))?;
            device.cmd_execute_commands(primary, &[secondary]);
        }
        Ok(())
    }

    fn wait_fence(&self, fence: vk::Fence) -> FenceStatus {
        self.fence_result(unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) })
    }

    fn fence_status(&self, fence: vk::Fence) -> FenceStatus {
        match unsafe { self.device.device.get_fence_status(fence) } {
            Ok(true) => FenceStatus::Signaled,
            Ok(false) => FenceStatus::NotReady,
            Err(e) => self.fence_result(Err(e)),
        }
    }

    fn destroy_pool(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer], fences: &[vk::Fence]) {
        let device = &self.device.device;
        unsafe {
            if !buffers.is_empty() {
                device.free_command_buffers(pool, buffers);
            }
            for fence in fences {
                device.destroy_fence(*fence, None);
            }
            device.destroy_command_pool(pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_stage_mask() {
        assert_eq!(sync_stage_mask(SyncStage::empty()), vk::PipelineStageFlags2::ALL_COMMANDS);
        assert_eq!(sync_stage_mask(SyncStage::VERTEX), vk::PipelineStageFlags2::VERTEX_SHADER);
        let mask = sync_stage_mask(SyncStage::TESSELLATION | SyncStage::COLOR_ATTACHMENT_OUTPUT);
        assert!(mask.contains(vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER));
        assert!(mask.contains(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT));
        assert!(!mask.contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));
    }
}
