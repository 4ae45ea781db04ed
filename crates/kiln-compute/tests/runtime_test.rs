//! End-to-end tests against the host backend, plus GPU checks that skip
//! themselves when no driver is present.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use glam::{UVec3, UVec4};
use kiln_compute::backend::{HostFence, OwnedKernelArg, image_offset};
use kiln_compute::{
    Backend, BufferDesc, Context, Fence, FenceWait, HostContext, Image, ImageDesc, IndirectCommandPipeline, KernelArg,
    LaunchParams, Queue, SubmitParams, create_context, describe_backends,
};
use kiln_core::{ArgInfo, Config, FunctionInfo, ImageType, MapFlag, MemoryFlag};

fn host() -> (HostContext, Arc<dyn Queue>) {
    let ctx = HostContext::new(&Config::default()).unwrap();
    let device = ctx.fastest_device().unwrap().clone();
    let queue = ctx.create_queue(&device).unwrap();
    (ctx, queue)
}

fn register_add(ctx: &HostContext) {
    let info = FunctionInfo::kernel("add", vec![ArgInfo::buffer(), ArgInfo::value(4)]);
    ctx.registry().register(info, |launch| {
        let buffer = launch.buffer(0)?;
        let amount: u32 = launch.value(1)?;
        buffer.with_data_mut(|d| d.iter_mut().for_each(|b| *b = b.wrapping_add(amount as u8)));
        Ok(())
    });
}

#[test]
fn test_host_backend_available() {
    assert!(Backend::Host.is_available());
    assert!(describe_backends().contains("CPU"));
    let ctx = create_context(Backend::Host, &Config::default()).unwrap();
    assert_eq!(ctx.devices().len(), 1);
}

#[test]
fn test_mipmapped_image_levels_and_size() {
    let (ctx, queue) = host();
    let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED;
    let dim = UVec4::new(256, 256, 0, 0);
    let image = ctx.create_image(queue.as_ref(), ImageDesc::new(dim, t)).unwrap();
    assert_eq!(image.mip_level_count(), 9);
    let expected: u64 = (0..9).map(|l| (256u64 >> l) * (256 >> l) * 4).sum();
    assert_eq!(expected, 349_524);
    assert_eq!(image.data_size(), expected);
}

/// 4x4 RGBA8 level 0 whose columns alternate 0 / 200, so every 2x2 block averages to 100.
fn striped_level0(data: &mut [u8]) {
    for y in 0..4 {
        for x in 0..4 {
            let at = (y * 4 + x) * 4;
            data[at..at + 4].fill(if x % 2 == 0 { 0 } else { 200 });
        }
    }
}

fn assert_mips_averaged(image: &dyn Image, queue: &dyn Queue) {
    let t = image.image_type();
    let dim = image.dim();
    let mapping = image.map(queue, MapFlag::READ | MapFlag::BLOCK).unwrap();
    for level in 1..3 {
        let offset = image_offset(t, dim, 0, level) as usize;
        let texels = (4usize >> level).pow(2);
        assert!(mapping[offset..offset + texels * 4].iter().all(|&b| b == 100), "level {level}");
    }
    image.unmap(queue, mapping).unwrap();
}

#[test]
fn test_host_mip_chain_is_box_filtered() {
    let (ctx, queue) = host();
    let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED;
    let dim = UVec4::new(4, 4, 0, 0);
    let size = t.data_size(dim, false) as usize;
    assert_eq!(size, (16 + 4 + 1) * 4);

    let mut data = vec![0u8; size];
    striped_level0(&mut data);
    let flags = MemoryFlag::default() | MemoryFlag::GENERATE_MIP_MAPS;
    let image = ctx.create_image(queue.as_ref(), ImageDesc::new(dim, t).with_flags(flags).with_data(&data)).unwrap();
    assert_mips_averaged(image.as_ref(), queue.as_ref());
}

#[test]
fn test_host_unmap_regenerates_mip_chain() {
    let (ctx, queue) = host();
    let q = queue.as_ref();
    let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED;
    let dim = UVec4::new(4, 4, 0, 0);
    let flags = MemoryFlag::default() | MemoryFlag::GENERATE_MIP_MAPS;
    let image = ctx.create_image(q, ImageDesc::new(dim, t).with_flags(flags)).unwrap();

    // written through a mapping, the chain is rebuilt on unmap
    let mut mapping = image.map(q, MapFlag::WRITE | MapFlag::BLOCK).unwrap();
    striped_level0(&mut mapping);
    image.unmap(q, mapping).unwrap();
    assert_mips_averaged(image.as_ref(), q);
}

#[test]
fn test_map_round_trip_4mib() {
    let (ctx, queue) = host();
    let q = queue.as_ref();
    let size = 4 << 20;
    let buffer = ctx.create_buffer(q, BufferDesc::new(size)).unwrap();

    let mut mapping = buffer.map(q, MapFlag::READ_WRITE | MapFlag::BLOCK, 0, size).unwrap();
    assert_eq!(mapping.len() as u64, size);
    for (i, b) in mapping.iter_mut().enumerate() {
        *b = (i * 31 % 253) as u8;
    }
    buffer.unmap(q, mapping).unwrap();

    let mapping = buffer.map(q, MapFlag::READ | MapFlag::BLOCK, 0, size).unwrap();
    assert!(mapping.iter().enumerate().all(|(i, &b)| b == (i * 31 % 253) as u8));
    buffer.unmap(q, mapping).unwrap();
}

#[test]
fn test_indirect_replay_range() {
    let (ctx, queue) = host();
    register_add(&ctx);
    let program = ctx.program_from_registry(&["add"]).unwrap();
    let function = program.function("add").unwrap();
    let buffer = ctx.create_buffer(queue.as_ref(), BufferDesc::new(8)).unwrap();

    let mut pipeline = IndirectCommandPipeline::new("adds");
    for amount in [1u32, 2, 4] {
        pipeline.add_compute_command(
            Arc::clone(&function),
            UVec3::new(8, 1, 1),
            UVec3::ONE,
            vec![OwnedKernelArg::Buffer(Arc::clone(&buffer)), OwnedKernelArg::value(&amount)],
        );
    }

    let fence = HostFence::new();
    let values = fence.next_signal_value();
    let signals = [FenceWait::new(&fence, values)];
    let params = SubmitParams { signal_fences: &signals, blocking: true, ..Default::default() };
    let done = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&done);
    queue
        .execute_indirect(&pipeline, &params, Some(1..3), Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(fence.completed_value().unwrap(), values.signaled);

    let mut out = [0u8; 8];
    buffer.read(queue.as_ref(), &mut out, 0).unwrap();
    assert_eq!(out, [6; 8]);

    assert!(queue.execute_indirect(&pipeline, &SubmitParams::default(), Some(2..4), None).is_err());
}

#[test]
fn test_concurrent_submissions_run_every_handler() {
    let (ctx, queue) = host();
    register_add(&ctx);
    let program = ctx.program_from_registry(&["add"]).unwrap();
    let function = program.function("add").unwrap();
    let buffer = ctx.create_buffer(queue.as_ref(), BufferDesc::new(4)).unwrap();

    let mut pipeline = IndirectCommandPipeline::new("tick");
    pipeline.add_compute_command(
        function,
        UVec3::ONE,
        UVec3::ONE,
        vec![OwnedKernelArg::Buffer(Arc::clone(&buffer)), OwnedKernelArg::value(&1u32)],
    );
    let pipeline = Arc::new(pipeline);
    let handled = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let (queue, pipeline, handled) = (Arc::clone(&queue), Arc::clone(&pipeline), Arc::clone(&handled));
            thread::spawn(move || {
                for _ in 0..125 {
                    let handled = Arc::clone(&handled);
                    let params = SubmitParams { blocking: true, ..Default::default() };
                    queue
                        .execute_indirect(&pipeline, &params, None, Some(Box::new(move || {
                            handled.fetch_add(1, Ordering::SeqCst);
                        })))
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    queue.finish().unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 1000);

    let mut out = [0u8; 4];
    buffer.read(queue.as_ref(), &mut out, 0).unwrap();
    assert_eq!(out, [(1000 % 256) as u8; 4]);
}

#[test]
fn test_cross_queue_fence_ordering() {
    let (ctx, first) = host();
    register_add(&ctx);
    let device = ctx.devices()[0].clone();
    let second = ctx.create_queue(&device).unwrap();
    let program = ctx.program_from_registry(&["add"]).unwrap();
    let function = program.function("add").unwrap();
    let buffer = ctx.create_buffer(first.as_ref(), BufferDesc::new(4)).unwrap();

    let fence = ctx.create_fence(&device).unwrap();
    let values = fence.next_signal_value();
    let amount = 5u32;
    let args = [KernelArg::from(&buffer), KernelArg::value(&amount)];
    let signals = [FenceWait::new(fence.as_ref(), values)];
    let mut params = LaunchParams::new(UVec3::ONE, UVec3::ONE, &args);
    params.submit.signal_fences = &signals;
    first.execute(function.as_ref(), &params).unwrap();

    let waits = [FenceWait::new(fence.as_ref(), values)];
    let mut params = LaunchParams::new(UVec3::ONE, UVec3::ONE, &args);
    params.submit.wait_fences = &waits;
    second.execute(function.as_ref(), &params).unwrap();

    let mut out = [0u8; 4];
    buffer.read(second.as_ref(), &mut out, 0).unwrap();
    assert_eq!(out, [10; 4]);
}

#[test]
fn test_gpu_backends_when_present() {
    for backend in [Backend::Cuda, Backend::Vulkan] {
        if !backend.is_available() {
            println!("{} not available, skipping", backend.name());
            continue;
        }
        let ctx = create_context(backend, &Config::default()).unwrap();
        let device = ctx.fastest_device().unwrap().clone();
        let queue = ctx.create_queue(&device).unwrap();
        let q = queue.as_ref();

        let data: Vec<u8> = (0..4096u32).map(|i| (i % 241) as u8).collect();
        let buffer = ctx.create_buffer(q, BufferDesc::from_data(&data)).unwrap();
        let mut out = vec![0u8; data.len()];
        buffer.read(q, &mut out, 0).unwrap();
        assert_eq!(out, data);

        let t = ImageType::RGBA8UI_NORM | ImageType::READ_WRITE | ImageType::FLAG_MIPMAPPED;
        let dim = UVec4::new(64, 64, 0, 0);
        let image = ctx.create_image(q, ImageDesc::new(dim, t).with_flags(MemoryFlag::READ_WRITE)).unwrap();
        assert_eq!(image.mip_level_count(), 7);
        image.zero(q).unwrap();
        queue.finish().unwrap();
    }
}
