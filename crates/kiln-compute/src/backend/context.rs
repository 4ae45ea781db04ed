//! The context interface.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use kiln_binary::{Archive, load_archive};
use kiln_core::{Device, DeviceId};

use super::device_select::DeviceList;
use super::program::{Program, ProgramInput};
use super::queue::{Fence, Queue};
use super::resource::{Buffer, BufferDesc, Image, ImageDesc};
use super::Backend;
use crate::{ComputeError, ComputeResult};

/// Trait for downcasting runtime objects to their backend type.
pub trait AsAny: 'static {
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// A backend context: owns the device list and creates every other object.
///
/// Shared by all threads. The device list never changes after construction;
/// registries behind it are mutex-guarded.
pub trait Context: Send + Sync + AsAny {
    /// Backend kind.
    fn backend(&self) -> Backend;

    /// Devices that passed the whitelist, with fastest-device bookkeeping.
    fn device_list(&self) -> &DeviceList;

    /// All devices of this context.
    fn devices(&self) -> &[Device] {
        self.device_list().devices()
    }

    /// Fastest device (GPU preferred on ties).
    fn fastest_device(&self) -> Option<&Device> {
        self.device_list().fastest_device()
    }

    /// Looks a device up by ID.
    fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices().iter().find(|d| d.id == id)
    }

    /// Context has at least one usable device.
    fn is_supported(&self) -> bool {
        !self.devices().is_empty()
    }

    /// Returns the device's default queue on the first call, fresh queues afterwards.
    fn create_queue(&self, device: &Device) -> ComputeResult<Arc<dyn Queue>>;

    /// Creates a timeline fence on `device`.
    fn create_fence(&self, device: &Device) -> ComputeResult<Arc<dyn Fence>>;

    /// Allocates a buffer on the queue's device.
    fn create_buffer(&self, queue: &dyn Queue, desc: BufferDesc<'_>) -> ComputeResult<Arc<dyn Buffer>>;

    /// Allocates an image on the queue's device.
    fn create_image(&self, queue: &dyn Queue, desc: ImageDesc<'_>) -> ComputeResult<Arc<dyn Image>>;

    /// Builds a program for every device that has a usable binary.
    fn add_program(&self, input: ProgramInput<'_>) -> ComputeResult<Arc<dyn Program>>;

    /// Builds a program from an in-memory universal binary.
    fn add_universal_binary(&self, archive: &Archive) -> ComputeResult<Arc<dyn Program>> {
        self.add_program(ProgramInput::Archive(archive))
    }

    /// Loads a universal binary file and builds a program from it.
    fn load_universal_binary(&self, path: &Path) -> ComputeResult<Arc<dyn Program>> {
        let archive = load_archive(path)?;
        self.add_universal_binary(&archive)
    }

    /// Wraps a buffer owned by another backend (shared memory).
    fn wrap_buffer(&self, _queue: &dyn Queue, _other: &dyn Buffer) -> ComputeResult<Arc<dyn Buffer>> {
        Err(ComputeError::Unsupported(format!("{} cannot wrap foreign buffers", self.backend())))
    }

    /// Wraps an image owned by another backend (shared memory).
    fn wrap_image(&self, _queue: &dyn Queue, _other: &dyn Image) -> ComputeResult<Arc<dyn Image>> {
        Err(ComputeError::Unsupported(format!("{} cannot wrap foreign images", self.backend())))
    }
}

/// One eagerly created queue per device.
///
/// The first `create_queue` for a device receives the default queue, later
/// calls get fresh ones. The context keeps its own reference for internal
/// work.
#[derive(Default)]
pub struct DefaultQueues {
    inner: Mutex<DefaultQueuesInner>,
}

#[derive(Default)]
struct DefaultQueuesInner {
    queues: HashMap<DeviceId, Arc<dyn Queue>>,
    handed_out: HashSet<DeviceId>,
}

impl DefaultQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the default queue of `device`.
    pub fn insert(&self, device: DeviceId, queue: Arc<dyn Queue>) {
        self.lock().queues.insert(device, queue);
    }

    /// Default queue of `device` for runtime-internal work.
    pub fn get(&self, device: DeviceId) -> Option<Arc<dyn Queue>> {
        self.lock().queues.get(&device).cloned()
    }

    /// Hands out the default queue once, then falls back to `create`.
    pub fn get_or_create(
        &self,
        device: DeviceId,
        create: impl FnOnce() -> ComputeResult<Arc<dyn Queue>>,
    ) -> ComputeResult<Arc<dyn Queue>> {
        {
            let mut inner = self.lock();
            if let Some(queue) = inner.queues.get(&device).cloned() {
                if inner.handed_out.insert(device) {
                    return Ok(queue);
                }
            }
        }
        create()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DefaultQueuesInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
