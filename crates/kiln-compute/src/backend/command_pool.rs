//! Per-thread command-buffer pools.
//!
//! Every OS thread that records work gets its own pair of pools (primary and
//! secondary), created on first use and registered in the manager's
//! registry. A thread-local guard removes the thread's entry when the thread
//! exits; the native pool is destroyed once the last outstanding handle into
//! it is gone.
//!
//! Each pool preallocates [`COMMAND_BUFFERS_PER_POOL`] command buffers and
//! [`FENCES_PER_POOL`] fences and tracks them with in-use bitsets:
//!
//! ```text
//! make_command_buffer ──> reset slot, set bit ──> record ──> submit
//!                                                              │
//!        ┌─────────── blocking or no_blocking off ─────────────┤
//!        ▼                                                     ▼
//!   wait inline                                   CompletionPool worker
//!        └──────────────┬──────────────────────────────────────┘
//!                       ▼
//!   user handler, internal handlers, drop retained, release fence + slot
//! ```
//!
//! The native API sits behind [`CommandBackend`], so the bookkeeping is the
//! same for Vulkan and for the mock used in tests.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use kiln_core::Config;
use tracing::{error, trace, warn};

use super::completion::{CompletionPool, CompletionTask};
use super::queue::FenceWait;
use crate::{ComputeError, ComputeResult};

/// Command buffers per pool.
pub const COMMAND_BUFFERS_PER_POOL: usize = 64;
/// Fences per pool.
pub const FENCES_PER_POOL: usize = 16;

/// Longest wait for a slot or fence held by in-flight work.
const SLOT_WAIT: Duration = Duration::from_secs(5);

/// Result of a fence query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    NotReady,
    DeviceLost,
}

/// Native side of the pool manager.
pub trait CommandBackend: Send + Sync + 'static {
    type Pool: Send + 'static;
    type CommandBuffer: Copy + Send + Sync + fmt::Debug + 'static;
    type Fence: Copy + Send + Sync + fmt::Debug + 'static;

    /// Creates a transient, individually resettable pool.
    fn create_pool(&self, secondary: bool) -> ComputeResult<Self::Pool>;

    fn allocate_command_buffers(
        &self,
        pool: &Self::Pool,
        secondary: bool,
        count: usize,
    ) -> ComputeResult<Vec<Self::CommandBuffer>>;

    fn create_fence(&self) -> ComputeResult<Self::Fence>;

    /// Resets a command buffer and begins recording.
    fn reset_command_buffer(&self, buffer: Self::CommandBuffer, secondary: bool) -> ComputeResult<()>;

    fn reset_fence(&self, fence: Self::Fence) -> ComputeResult<()>;

    /// Ends recording and submits under the queue lock.
    fn submit(
        &self,
        buffer: Self::CommandBuffer,
        fence: Self::Fence,
        wait_fences: &[FenceWait<'_>],
        signal_fences: &[FenceWait<'_>],
    ) -> ComputeResult<()>;

    /// Records execution of `secondary` into `primary`.
    fn execute_secondary(&self, primary: Self::CommandBuffer, secondary: Self::CommandBuffer) -> ComputeResult<()>;

    /// Waits without a timeout.
    fn wait_fence(&self, fence: Self::Fence) -> FenceStatus;

    fn fence_status(&self, fence: Self::Fence) -> FenceStatus;

    /// Frees a pool together with its command buffers and fences.
    fn destroy_pool(&self, pool: Self::Pool, buffers: &[Self::CommandBuffer], fences: &[Self::Fence]);
}

/// Pool manager switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolOptions {
    /// Poll the fence status instead of a blocking wait.
    pub fence_wait_polling: bool,
    /// Hand non-blocking submissions to the completion pool.
    pub no_blocking: bool,
}

impl From<&Config> for PoolOptions {
    fn from(config: &Config) -> Self {
        Self { fence_wait_polling: config.vulkan.fence_wait_polling, no_blocking: config.vulkan.no_blocking }
    }
}

/// Submission of one command buffer.
#[derive(Default)]
pub struct SubmitRequest<'a> {
    /// Runs after the command buffer completed.
    pub completion: Option<CompletionTask>,
    pub blocking: bool,
    pub wait_fences: &'a [FenceWait<'a>],
    pub signal_fences: &'a [FenceWait<'a>],
}

// =============================================================================
// Pools
// =============================================================================

type Retained = Arc<dyn Any + Send + Sync>;

struct Slot<B> {
    buffer: B,
    retained: Vec<Retained>,
    handlers: Vec<CompletionTask>,
}

struct PoolState<D: CommandBackend> {
    native: Option<D::Pool>,
    slots: Vec<Slot<D::CommandBuffer>>,
    in_use: u64,
    /// Submitted, not yet completed.
    pending: u64,
    fences: Vec<D::Fence>,
    fences_in_use: u16,
}

struct Pool<D: CommandBackend> {
    state: Mutex<PoolState<D>>,
    released: Condvar,
}

impl<D: CommandBackend> Pool<D> {
    fn new(backend: &D, secondary: bool) -> ComputeResult<Self> {
        let native = backend.create_pool(secondary)?;
        let buffers = backend.allocate_command_buffers(&native, secondary, COMMAND_BUFFERS_PER_POOL)?;
        let fences = (0..FENCES_PER_POOL).map(|_| backend.create_fence()).collect::<ComputeResult<Vec<_>>>()?;
        let slots = buffers.into_iter().map(|buffer| Slot { buffer, retained: Vec::new(), handlers: Vec::new() }).collect();
        Ok(Self {
            state: Mutex::new(PoolState { native: Some(native), slots, in_use: 0, pending: 0, fences, fences_in_use: 0 }),
            released: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<D>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits on the release condvar until `deadline`; `None` once it passed.
    fn wait_release<'a>(&self, state: MutexGuard<'a, PoolState<D>>, deadline: Instant) -> Option<MutexGuard<'a, PoolState<D>>> {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        Some(
            self.released
                .wait_timeout(state, deadline - now)
                .map(|(s, _)| s)
                .unwrap_or_else(|e| e.into_inner().0),
        )
    }
}

fn first_free(bits: u64, count: usize) -> Option<usize> {
    let index = (!bits).trailing_zeros() as usize;
    (index < count).then_some(index)
}

/// Primary and secondary pool of one thread.
pub struct ThreadPools<D: CommandBackend> {
    backend: Arc<D>,
    thread: ThreadId,
    primary: Pool<D>,
    secondary: Pool<D>,
}

impl<D: CommandBackend> ThreadPools<D> {
    fn new(backend: Arc<D>, thread: ThreadId) -> ComputeResult<Self> {
        let primary = Pool::<D>::new(&backend, false)?;
        let secondary = Pool::<D>::new(&backend, true)?;
        Ok(Self { backend, thread, primary, secondary })
    }

    fn pool(&self, secondary: bool) -> &Pool<D> {
        if secondary { &self.secondary } else { &self.primary }
    }

    fn release_buffer(&self, index: usize, secondary: bool) {
        let pool = self.pool(secondary);
        let (retained, handlers) = {
            let mut state = pool.lock();
            let bit = 1u64 << index;
            if state.in_use & bit == 0 {
                warn!(index, secondary, "double release of command buffer");
            }
            state.in_use &= !bit;
            state.pending &= !bit;
            let slot = &mut state.slots[index];
            (std::mem::take(&mut slot.retained), std::mem::take(&mut slot.handlers))
        };
        if !handlers.is_empty() {
            warn!(index, count = handlers.len(), "dropping completion handlers of an unsubmitted command buffer");
        }
        drop(retained);
        pool.released.notify_all();
    }

    fn acquire_fence(self: &Arc<Self>) -> ComputeResult<FenceHandle<D>> {
        let pool = &self.primary;
        let deadline = Instant::now() + SLOT_WAIT;
        let mut state = pool.lock();
        loop {
            if let Some(index) = first_free(u64::from(state.fences_in_use), FENCES_PER_POOL) {
                let fence = state.fences[index];
                self.backend.reset_fence(fence)?;
                state.fences_in_use |= 1 << index;
                return Ok(FenceHandle { fence, index, pools: Arc::clone(self) });
            }
            state = pool
                .wait_release(state, deadline)
                .ok_or_else(|| ComputeError::Timeout("no free fence".into()))?;
        }
    }

    fn release_fence(&self, index: usize) {
        let mut state = self.primary.lock();
        state.fences_in_use &= !(1u16 << index);
        drop(state);
        self.primary.released.notify_all();
    }
}

impl<D: CommandBackend> Drop for ThreadPools<D> {
    fn drop(&mut self) {
        for pool in [&self.primary, &self.secondary] {
            let mut state = pool.lock();
            let buffers: Vec<_> = state.slots.iter().map(|s| s.buffer).collect();
            if let Some(native) = state.native.take() {
                self.backend.destroy_pool(native, &buffers, &state.fences);
            }
        }
        trace!(thread = ?self.thread, "command pools destroyed");
    }
}

/// A command buffer slot owned by the caller until submitted or dropped.
///
/// Dropping the handle frees the slot.
pub struct CommandBufferHandle<D: CommandBackend> {
    buffer: D::CommandBuffer,
    index: usize,
    name: String,
    secondary: bool,
    pools: Arc<ThreadPools<D>>,
}

impl<D: CommandBackend> CommandBufferHandle<D> {
    pub fn buffer(&self) -> D::CommandBuffer {
        self.buffer
    }

    /// Slot index in its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_secondary(&self) -> bool {
        self.secondary
    }

    /// Keeps `resource` alive until the command buffer completed.
    pub fn retain(&self, resource: Arc<dyn Any + Send + Sync>) {
        self.pools.pool(self.secondary).lock().slots[self.index].retained.push(resource);
    }

    /// Runs `handler` after the user completion handler.
    pub fn add_completion_handler(&self, handler: CompletionTask) {
        self.pools.pool(self.secondary).lock().slots[self.index].handlers.push(handler);
    }

    fn mark_pending(&self) {
        self.pools.pool(self.secondary).lock().pending |= 1 << self.index;
    }

    fn take_completion_state(&self) -> (Vec<CompletionTask>, Vec<Retained>) {
        let mut state = self.pools.pool(self.secondary).lock();
        let slot = &mut state.slots[self.index];
        (std::mem::take(&mut slot.handlers), std::mem::take(&mut slot.retained))
    }
}

impl<D: CommandBackend> Drop for CommandBufferHandle<D> {
    fn drop(&mut self) {
        self.pools.release_buffer(self.index, self.secondary);
    }
}

impl<D: CommandBackend> fmt::Debug for CommandBufferHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBufferHandle")
            .field("buffer", &self.buffer)
            .field("index", &self.index)
            .field("name", &self.name)
            .field("secondary", &self.secondary)
            .finish()
    }
}

/// A fence slot; dropping it frees the slot.
pub struct FenceHandle<D: CommandBackend> {
    fence: D::Fence,
    index: usize,
    pools: Arc<ThreadPools<D>>,
}

impl<D: CommandBackend> FenceHandle<D> {
    pub fn fence(&self) -> D::Fence {
        self.fence
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl<D: CommandBackend> Drop for FenceHandle<D> {
    fn drop(&mut self) {
        self.pools.release_fence(self.index);
    }
}

// =============================================================================
// Thread registry
// =============================================================================

type Registry<D> = Mutex<HashMap<ThreadId, Arc<ThreadPools<D>>>>;

thread_local! {
    static POOL_GUARDS: RefCell<Vec<Box<dyn Any>>> = const { RefCell::new(Vec::new()) };
}

/// Removes a thread's pools from the registry when the thread exits.
struct PoolGuard<D: CommandBackend> {
    registry: Weak<Registry<D>>,
    thread: ThreadId,
}

impl<D: CommandBackend> Drop for PoolGuard<D> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let removed = registry.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.thread);
            drop(removed);
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Hands out command buffers and fences from per-thread pools and runs
/// submissions to completion.
pub struct CommandPoolManager<D: CommandBackend> {
    backend: Arc<D>,
    registry: Arc<Registry<D>>,
    completion: Option<Arc<CompletionPool>>,
    options: PoolOptions,
}

impl<D: CommandBackend> CommandPoolManager<D> {
    /// Without a completion pool every submission completes inline.
    pub fn new(backend: Arc<D>, completion: Option<Arc<CompletionPool>>, options: PoolOptions) -> Self {
        Self { backend, registry: Arc::new(Mutex::new(HashMap::new())), completion, options }
    }

    pub fn backend(&self) -> &D {
        &self.backend
    }

    pub fn options(&self) -> PoolOptions {
        self.options
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ThreadId, Arc<ThreadPools<D>>>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pools of the calling thread, created on first use.
    fn thread_pools(&self) -> ComputeResult<Arc<ThreadPools<D>>> {
        let thread = thread::current().id();
        if let Some(pools) = self.registry().get(&thread) {
            return Ok(Arc::clone(pools));
        }
        let pools = Arc::new(ThreadPools::new(Arc::clone(&self.backend), thread)?);
        self.registry().insert(thread, Arc::clone(&pools));
        let guard = PoolGuard::<D> { registry: Arc::downgrade(&self.registry), thread };
        // during thread teardown the guard drops right away and deregisters
        let _ = POOL_GUARDS.try_with(|guards| guards.borrow_mut().push(Box::new(guard)));
        trace!(?thread, "command pools created");
        Ok(pools)
    }

    /// Takes a free slot of the calling thread's pool, reset and recording.
    ///
    /// Waits for in-flight work to free a slot when all are taken.
    pub fn make_command_buffer(&self, name: &str, secondary: bool) -> ComputeResult<CommandBufferHandle<D>> {
        let pools = self.thread_pools()?;
        let pool = pools.pool(secondary);
        let deadline = Instant::now() + SLOT_WAIT;
        let mut state = pool.lock();
        let index = loop {
            if let Some(index) = first_free(state.in_use, COMMAND_BUFFERS_PER_POOL) {
                break index;
            }
            if state.pending == 0 {
                error!(name, secondary, "all command buffers in use");
                return Err(ComputeError::OperationFailed("all command buffers in use".into()));
            }
            state = pool
                .wait_release(state, deadline)
                .ok_or_else(|| ComputeError::Timeout("no command buffer completed".into()))?;
        };
        let slot = &mut state.slots[index];
        self.backend.reset_command_buffer(slot.buffer, secondary)?;
        slot.retained.clear();
        slot.handlers.clear();
        let buffer = slot.buffer;
        state.in_use |= 1 << index;
        drop(state);
        Ok(CommandBufferHandle { buffer, index, name: name.to_string(), secondary, pools: Arc::clone(&pools) })
    }

    /// Frees a slot that will not be submitted.
    pub fn release_command_buffer(&self, handle: CommandBufferHandle<D>) {
        drop(handle);
    }

    /// Takes a free fence of the calling thread's pool; it is always reset first.
    pub fn acquire_fence(&self) -> ComputeResult<FenceHandle<D>> {
        self.thread_pools()?.acquire_fence()
    }

    pub fn release_fence(&self, fence: FenceHandle<D>) {
        drop(fence);
    }

    /// Records `secondary` into `primary`; the secondary slot is freed when the primary completes.
    pub fn execute_secondary(
        &self,
        primary: &CommandBufferHandle<D>,
        secondary: CommandBufferHandle<D>,
    ) -> ComputeResult<()> {
        self.backend.execute_secondary(primary.buffer, secondary.buffer)?;
        primary.add_completion_handler(Box::new(move || drop(secondary)));
        Ok(())
    }

    /// Submits `handle` and completes it inline or on the completion pool.
    ///
    /// Failed submissions still free the slot and fence.
    pub fn submit(&self, handle: CommandBufferHandle<D>, request: SubmitRequest<'_>) -> ComputeResult<()> {
        let fence = handle.pools.acquire_fence()?;
        if let Err(e) = self.backend.submit(handle.buffer, fence.fence, request.wait_fences, request.signal_fences) {
            error!(name = %handle.name, error = %e, "submit failed");
            return Err(e);
        }
        handle.mark_pending();

        let polling = self.options.fence_wait_polling;
        match &self.completion {
            Some(pool) if !request.blocking && self.options.no_blocking => {
                let backend = Arc::clone(&self.backend);
                let completion = request.completion;
                pool.push(Box::new(move || complete(backend.as_ref(), polling, handle, fence, completion)));
            }
            _ => complete(self.backend.as_ref(), polling, handle, fence, request.completion),
        }
        Ok(())
    }

    /// Records every item of `items` into one command buffer and submits it once.
    ///
    /// The request's completion runs after the whole buffer completed. A
    /// failed recording frees the slot without submitting.
    pub fn record_and_submit<T>(
        &self,
        name: &str,
        items: impl IntoIterator<Item = T>,
        mut record: impl FnMut(&CommandBufferHandle<D>, T) -> ComputeResult<()>,
        request: SubmitRequest<'_>,
    ) -> ComputeResult<()> {
        let handle = self.make_command_buffer(name, false)?;
        for item in items {
            record(&handle, item)?;
        }
        self.submit(handle, request)
    }

    /// Occupied command buffer slots over every thread.
    pub fn command_buffers_in_use(&self) -> usize {
        self.registry()
            .values()
            .map(|p| (p.primary.lock().in_use.count_ones() + p.secondary.lock().in_use.count_ones()) as usize)
            .sum()
    }

    /// Occupied fence slots over every thread.
    pub fn fences_in_use(&self) -> usize {
        self.registry().values().map(|p| p.primary.lock().fences_in_use.count_ones() as usize).sum()
    }

    /// Threads with live pools.
    pub fn thread_count(&self) -> usize {
        self.registry().len()
    }
}

/// Waits for the fence, then runs handlers and frees everything the submission held.
fn complete<D: CommandBackend>(
    backend: &D,
    polling: bool,
    handle: CommandBufferHandle<D>,
    fence: FenceHandle<D>,
    completion: Option<CompletionTask>,
) {
    let status = if polling {
        loop {
            match backend.fence_status(fence.fence) {
                FenceStatus::NotReady => thread::yield_now(),
                status => break status,
            }
        }
    } else {
        backend.wait_fence(fence.fence)
    };
    if status == FenceStatus::DeviceLost {
        crate::device_lost(&format!("waiting for command buffer \"{}\"", handle.name));
    }

    if let Some(completion) = completion {
        completion();
    }
    let (handlers, retained) = handle.take_completion_state();
    for handler in handlers {
        handler();
    }
    drop(retained);
    drop(fence);
    drop(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Records fence resets and "signals" fences at submit time.
    ///
    /// While `held` is set, fences stay unsignalled until `open` is called.
    #[derive(Default)]
    struct MockBackend {
        next_id: AtomicU32,
        dirty_fences: Mutex<HashSet<u32>>,
        resets: AtomicUsize,
        destroyed_pools: AtomicUsize,
        held: Mutex<bool>,
        opened: Condvar,
    }

    impl MockBackend {
        fn hold(&self) {
            *self.held.lock().unwrap() = true;
        }

        fn open(&self) {
            *self.held.lock().unwrap() = false;
            self.opened.notify_all();
        }
    }

    impl CommandBackend for MockBackend {
        type Pool = u32;
        type CommandBuffer = u32;
        type Fence = u32;

        fn create_pool(&self, _: bool) -> ComputeResult<u32> {
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        fn allocate_command_buffers(&self, _: &u32, _: bool, count: usize) -> ComputeResult<Vec<u32>> {
            Ok((0..count).map(|_| self.next_id.fetch_add(1, Ordering::SeqCst)).collect())
        }

        fn create_fence(&self) -> ComputeResult<u32> {
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        fn reset_command_buffer(&self, _: u32, _: bool) -> ComputeResult<()> {
            Ok(())
        }

        fn reset_fence(&self, fence: u32) -> ComputeResult<()> {
            self.dirty_fences.lock().unwrap().remove(&fence);
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn submit(&self, _: u32, fence: u32, _: &[FenceWait<'_>], _: &[FenceWait<'_>]) -> ComputeResult<()> {
            // submitting with a signalled fence is invalid
            assert!(self.dirty_fences.lock().unwrap().insert(fence), "fence {fence} reused without reset");
            Ok(())
        }

        fn execute_secondary(&self, _: u32, _: u32) -> ComputeResult<()> {
            Ok(())
        }

        fn wait_fence(&self, _: u32) -> FenceStatus {
            let mut held = self.held.lock().unwrap();
            while *held {
                held = self.opened.wait(held).unwrap();
            }
            FenceStatus::Signaled
        }

        fn fence_status(&self, _: u32) -> FenceStatus {
            if *self.held.lock().unwrap() { FenceStatus::NotReady } else { FenceStatus::Signaled }
        }

        fn destroy_pool(&self, _: u32, _: &[u32], _: &[u32]) {
            self.destroyed_pools.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(no_blocking: bool) -> (CommandPoolManager<MockBackend>, Arc<CompletionPool>) {
        let pool = Arc::new(CompletionPool::new().unwrap());
        let options = PoolOptions { no_blocking, ..Default::default() };
        (CommandPoolManager::new(Arc::new(MockBackend::default()), Some(Arc::clone(&pool)), options), pool)
    }

    #[test]
    fn test_slots_unique_and_exhaustible() {
        let (mgr, _pool) = manager(false);
        let handles: Vec<_> = (0..COMMAND_BUFFERS_PER_POOL).map(|i| mgr.make_command_buffer(&format!("cb{i}"), false).unwrap()).collect();
        let indices: HashSet<usize> = handles.iter().map(|h| h.index()).collect();
        assert_eq!(indices.len(), COMMAND_BUFFERS_PER_POOL);
        assert!(mgr.make_command_buffer("overflow", false).is_err());
        // secondary pool is separate
        let secondary = mgr.make_command_buffer("sec", true).unwrap();
        assert!(secondary.is_secondary());
        drop(handles);
        drop(secondary);
        assert_eq!(mgr.command_buffers_in_use(), 0);
    }

    #[test]
    fn test_concurrent_threads_never_share_slots() {
        let (mgr, _pool) = manager(false);
        let mgr = Arc::new(mgr);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let a = mgr.make_command_buffer("a", false).unwrap();
                        let b = mgr.make_command_buffer("b", false).unwrap();
                        assert_ne!(a.index(), b.index());
                        mgr.release_command_buffer(a);
                        mgr.submit(b, SubmitRequest { blocking: true, ..Default::default() }).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(mgr.command_buffers_in_use(), 0);
        assert_eq!(mgr.fences_in_use(), 0);
        // exited threads deregistered their pools
        assert_eq!(mgr.thread_count(), 0);
        assert_eq!(mgr.backend().destroyed_pools.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_fence_reset_before_reuse() {
        let (mgr, _pool) = manager(false);
        let fence = mgr.acquire_fence().unwrap();
        let id = fence.fence();
        assert_eq!(mgr.backend().resets.load(Ordering::SeqCst), 1);
        mgr.release_fence(fence);
        for _ in 0..40 {
            let cb = mgr.make_command_buffer("cb", false).unwrap();
            mgr.submit(cb, SubmitRequest { blocking: true, ..Default::default() }).unwrap();
        }
        let again = mgr.acquire_fence().unwrap();
        assert_eq!(again.fence(), id);
        assert!(!mgr.backend().dirty_fences.lock().unwrap().contains(&id));
    }

    #[test]
    fn test_secondary_released_with_primary() {
        let (mgr, _pool) = manager(false);
        let primary = mgr.make_command_buffer("primary", false).unwrap();
        let secondary = mgr.make_command_buffer("secondary", true).unwrap();
        mgr.execute_secondary(&primary, secondary).unwrap();
        assert_eq!(mgr.command_buffers_in_use(), 2);
        let retained = Arc::new(5u32);
        primary.retain(retained.clone());
        assert_eq!(Arc::strong_count(&retained), 2);
        mgr.submit(primary, SubmitRequest { blocking: true, ..Default::default() }).unwrap();
        assert_eq!(mgr.command_buffers_in_use(), 0);
        assert_eq!(Arc::strong_count(&retained), 1);
    }

    #[test]
    fn test_offloaded_completions() {
        let (mgr, pool) = manager(true);
        let mgr = Arc::new(mgr);
        let ran = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                let ran = Arc::clone(&ran);
                thread::spawn(move || {
                    for _ in 0..125 {
                        let cb = mgr.make_command_buffer("trivial", false).unwrap();
                        let ran = Arc::clone(&ran);
                        let request = SubmitRequest {
                            completion: Some(Box::new(move || {
                                ran.fetch_add(1, Ordering::SeqCst);
                            })),
                            ..Default::default()
                        };
                        mgr.submit(cb, request).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert!(pool.wait_idle(Duration::from_secs(30)));
        assert_eq!(ran.load(Ordering::SeqCst), 1000);
        assert_eq!(mgr.command_buffers_in_use(), 0);
        assert_eq!(mgr.fences_in_use(), 0);
        // pools outlive their thread until the last in-flight handle completed
        assert_eq!(mgr.backend().destroyed_pools.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_non_blocking_batch_returns_before_handler() {
        let (mgr, pool) = manager(true);
        mgr.backend().hold();
        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&ran_on);
        let request = SubmitRequest {
            completion: Some(Box::new(move || {
                *seen.lock().unwrap() = Some(thread::current().id());
            })),
            ..Default::default()
        };
        let mut recorded = Vec::new();
        mgr.record_and_submit(
            "replay",
            1..3,
            |handle, command| {
                recorded.push((handle.index(), command));
                Ok(())
            },
            request,
        )
        .unwrap();

        // both commands went into one command buffer, still in flight
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].0, recorded[1].0);
        assert!(ran_on.lock().unwrap().is_none());
        assert_eq!(mgr.command_buffers_in_use(), 1);

        mgr.backend().open();
        assert!(pool.wait_idle(Duration::from_secs(10)));
        let handler_thread = ran_on.lock().unwrap().expect("completion handler ran");
        assert_ne!(handler_thread, caller);
        assert_eq!(mgr.command_buffers_in_use(), 0);
        assert_eq!(mgr.fences_in_use(), 0);
    }

    #[test]
    fn test_failed_recording_frees_slot() {
        let (mgr, _pool) = manager(true);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let request = SubmitRequest {
            completion: Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let result = mgr.record_and_submit(
            "broken",
            0..3,
            |_, command| if command == 1 { Err(ComputeError::InvalidArgument("bad arg".into())) } else { Ok(()) },
            request,
        );
        assert!(result.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.command_buffers_in_use(), 0);
        assert_eq!(mgr.fences_in_use(), 0);
    }
}
