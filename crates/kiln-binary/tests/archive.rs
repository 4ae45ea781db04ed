//! Universal binary build / load / select round trips.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use kiln_binary::{
    Archive, BinaryError, BinaryResult, CompileOptions, CudaTarget, HostTarget, ProgramData, ProgramSource, Target,
    Toolchain, VendorTarget, VulkanTarget, build_archive, build_archive_from_memory, find_best_match_for_device,
    load_archive, load_archive_from_memory, version_word,
};
use kiln_core::prelude::{UVec2, UVec3};
use kiln_core::{
    ApiVersion, ArgImageAccess, ArgImageType, ArgInfo, BackendDeviceInfo, CudaDeviceInfo, Device, FunctionInfo,
    HostArch, HostDeviceInfo, Vendor, VulkanDeviceInfo,
};

/// Emits the target string as the binary, one kernel per program.
struct MockToolchain {
    fail_on: Option<Target>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Target>>,
}

impl MockToolchain {
    fn new() -> Self {
        Self { fail_on: None, calls: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) }
    }
}

impl Toolchain for MockToolchain {
    fn compile(&self, target: &Target, source: ProgramSource<'_>, options: &CompileOptions) -> BinaryResult<ProgramData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(*target);
        if self.fail_on == Some(*target) {
            return Err(BinaryError::Toolchain { target: target.to_string(), message: "unsupported".into() });
        }
        let code = match source {
            ProgramSource::Memory(code) => code.to_string(),
            ProgramSource::File(path) => std::fs::read_to_string(path)?,
        };
        let functions = vec![
            FunctionInfo::kernel(
                "fill",
                vec![ArgInfo::buffer(), ArgInfo::value(4), ArgInfo::image(ArgImageType::Image2D, ArgImageAccess::Write)],
            )
            .with_local_size(UVec3::new(8, 8, 1)),
            FunctionInfo::kernel("clear", vec![ArgInfo::buffer()]),
        ];
        Ok(ProgramData {
            data: format!("{target}|{code}").into_bytes(),
            functions,
            options: options.clone(),
            toolchain_version: self.version(),
        })
    }

    fn version(&self) -> u32 {
        version_word(1, 4, 2)
    }
}

fn cuda_device(sm: (u32, u32), min_ptx: (u32, u32)) -> Device {
    Device {
        name: "mock cuda".into(),
        vendor: Vendor::Nvidia,
        backend: BackendDeviceInfo::Cuda(CudaDeviceInfo {
            sm: UVec2::new(sm.0, sm.1),
            min_req_ptx: UVec2::new(min_ptx.0, min_ptx.1),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn targets() -> Vec<Target> {
    vec![
        Target::Cuda(CudaTarget::ptx((7, 5), (6, 3))),
        Target::Cuda(CudaTarget::ptx((8, 6), (7, 5))),
        Target::Vulkan(VulkanTarget { vulkan_major: 1, vulkan_minor: 2, spirv_major: 1, spirv_minor: 5, ..Default::default() }),
        Target::Host(HostTarget { arch: HostArch::X86_64, cpu_tier: 1 }),
    ]
}

#[test]
fn build_then_load_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernels.fuba");
    let toolchain = MockToolchain::new();

    let built = build_archive_from_memory(&toolchain, "kernel void fill()", &path, &targets(), &CompileOptions::default())
        .unwrap();
    let loaded = load_archive(&path).unwrap();

    assert_eq!(loaded, built);
    assert_eq!(loaded.len(), 4);
    assert_eq!(toolchain.calls.load(Ordering::SeqCst), 4);
    for (binary, target) in loaded.iter().zip(targets()) {
        assert_eq!(binary.target, target);
        assert_eq!(binary.toolchain_version, 10402);
        assert!(binary.data.starts_with(target.to_string().as_bytes()));
        let infos = binary.function_infos().unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "fill");
        assert_eq!(infos[0].local_size, UVec3::new(8, 8, 1));
        assert_eq!(infos[0].args[2].image_type, ArgImageType::Image2D);
    }
}

#[test]
fn build_keeps_target_order_and_compiles_each_once() {
    let toolchain = MockToolchain::new();
    let archive = build_archive(&toolchain, ProgramSource::Memory("x"), &targets(), &CompileOptions::default()).unwrap();
    let order: Vec<Target> = archive.iter().map(|b| b.target).collect();
    assert_eq!(order, targets());

    let mut seen = toolchain.seen.lock().unwrap().clone();
    seen.sort_by_key(|t| t.to_u64().unwrap());
    let mut expected = targets();
    expected.sort_by_key(|t| t.to_u64().unwrap());
    assert_eq!(seen, expected);
}

#[test]
fn build_fails_if_any_target_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.fuba");
    let toolchain = MockToolchain { fail_on: Some(targets()[2]), ..MockToolchain::new() };

    let err = build_archive_from_memory(&toolchain, "x", &path, &targets(), &CompileOptions::default()).unwrap_err();
    match err {
        BinaryError::BuildFailed(failed) => assert_eq!(failed, vec![targets()[2].to_string()]),
        other => panic!("unexpected error {other}"),
    }
    assert!(!path.exists());
}

#[test]
fn build_from_file_reads_source() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("kernels.kiln");
    let dst = dir.path().join("kernels.fuba");
    std::fs::write(&src, "kernel void clear()").unwrap();

    let toolchain = MockToolchain::new();
    let archive = kiln_binary::build_archive_from_file(
        &toolchain,
        &src,
        &dst,
        &targets()[..1],
        &CompileOptions::default(),
    )
    .unwrap();
    assert!(archive.binaries[0].data.ends_with(b"kernel void clear()"));
    assert_eq!(load_archive(&dst).unwrap(), archive);
}

#[test]
fn cuda_selection_prefers_newest_compatible_ptx() {
    let toolchain = MockToolchain::new();
    let archive = build_archive(&toolchain, ProgramSource::Memory("x"), &targets()[..2], &CompileOptions::default()).unwrap();
    let device = cuda_device((8, 6), (7, 0));

    let best = find_best_match_for_device(&device, &archive).unwrap();
    assert_eq!(best.index, 1);
    assert_eq!(best.target, Target::Cuda(CudaTarget::ptx((8, 6), (7, 5))));
    assert_eq!(best.binary.hash, archive.binaries[1].hash);
}

#[test]
fn exact_device_target_is_selected() {
    let devices = [
        cuda_device((8, 6), (7, 5)),
        cuda_device((7, 5), (6, 4)),
        Device {
            name: "mock vulkan".into(),
            vendor: Vendor::Amd,
            double_support: true,
            backend: BackendDeviceInfo::Vulkan(VulkanDeviceInfo {
                vulkan_version: ApiVersion::new(1, 3),
                spirv_version: ApiVersion::new(1, 6),
                ..Default::default()
            }),
            ..Default::default()
        },
        Device {
            name: "mock host".into(),
            backend: BackendDeviceInfo::Host(HostDeviceInfo { arch: HostArch::X86_64, cpu_tier: 4 }),
            ..Default::default()
        },
    ];

    for device in &devices {
        let exact = Target::for_device(device).unwrap();
        let mut archive = Archive::new();
        for target in targets() {
            if target != exact && kiln_binary::is_compatible(device, &target, &Default::default()) {
                archive.push(target, 1, Vec::new(), b"generic".to_vec());
            }
        }
        let exact_index = archive.push(exact, 1, Vec::new(), b"exact".to_vec());
        let generic_vulkan = Target::Vulkan(VulkanTarget {
            vulkan_major: 1,
            vulkan_minor: 0,
            spirv_major: 1,
            spirv_minor: 0,
            device_target: VendorTarget::Generic,
            ..Default::default()
        });
        archive.push(generic_vulkan, 1, Vec::new(), b"old".to_vec());

        let best = find_best_match_for_device(device, &archive).unwrap();
        assert_eq!(best.index, exact_index, "{}", device.name);
        assert_eq!(best.binary.data, b"exact");
    }
}

#[test]
fn tampered_binary_is_rejected() {
    let toolchain = MockToolchain::new();
    let archive = build_archive(&toolchain, ProgramSource::Memory("payload"), &targets(), &CompileOptions::default()).unwrap();
    let bytes = archive.to_bytes().unwrap();
    assert!(load_archive_from_memory(&bytes).is_ok());

    let mut start = 12 + 52 * archive.len();
    for (index, binary) in archive.iter().enumerate() {
        let data_start = start + 12 + binary.function_info_size() as usize;
        for pos in [data_start, data_start + binary.data.len() / 2, data_start + binary.data.len() - 1] {
            let mut tampered = bytes.clone();
            tampered[pos] ^= 0x20;
            let err = load_archive_from_memory(&tampered).unwrap_err();
            assert!(matches!(err, BinaryError::HashMismatch { index: i } if i == index), "{err}");
        }
        start = data_start + binary.data.len();
    }
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_archive(dir.path().join("none.fuba")).unwrap_err();
    assert!(matches!(err, BinaryError::Io(_)));
    assert!(!err.is_validation_error());
}
