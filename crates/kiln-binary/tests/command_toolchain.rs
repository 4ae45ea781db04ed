//! `CommandToolchain` against a scripted compiler.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;

use kiln_binary::{CommandToolchain, CompileOptions, ProgramSource, Target, Toolchain, build_archive, load_archive_from_memory};
use kiln_core::FunctionType;
use kiln_core::config::ToolchainConfig;

const SCRIPT: &str = r#"#!/bin/sh
out=""
info=""
target=""
while [ $# -gt 0 ]; do
  case "$1" in
    --version) echo "kiln-cc version 2.3.1"; exit 0 ;;
    --target) target="$2"; shift ;;
    -o) out="$2"; shift ;;
    --function-info) info="$2"; shift ;;
    --fail) echo "forced failure" >&2; exit 3 ;;
  esac
  shift
done
printf '%s-binary' "$target" > "$out"
printf '[{"name":"saxpy","type":"kernel","local_size":[64,1,1],"args":[]}]' > "$info"
"#;

#[test]
fn scripted_compiler_produces_archive() {
    let dir = tempfile::tempdir().unwrap();
    let compiler = dir.path().join("kiln-cc");
    std::fs::write(&compiler, SCRIPT).unwrap();
    std::fs::set_permissions(&compiler, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = ToolchainConfig {
        compiler: Some(compiler.to_string_lossy().into_owned()),
        ..Default::default()
    };
    let toolchain = CommandToolchain::from_config(&config);
    assert_eq!(toolchain.version(), 20301);

    let targets: Vec<Target> = ["cuda:sm_86:ptx_75", "vulkan:1.3:spirv1.6"].iter().map(|s| s.parse().unwrap()).collect();
    let archive = build_archive(&toolchain, ProgramSource::Memory("kernel saxpy"), &targets, &CompileOptions::default()).unwrap();

    let loaded = load_archive_from_memory(&archive.to_bytes().unwrap()).unwrap();
    assert_eq!(loaded.binaries[0].data, b"ptx-binary");
    assert_eq!(loaded.binaries[1].data, b"spirv-vulkan-binary");
    assert_eq!(loaded.binaries[0].toolchain_version, 20301);
    let infos = loaded.binaries[1].function_infos().unwrap();
    assert_eq!(infos[0].name, "saxpy");
    assert_eq!(infos[0].function_type, FunctionType::Kernel);
    assert_eq!(infos[0].local_size.x, 64);

    let failing = CompileOptions { cli: vec!["--fail".into()], ..Default::default() };
    let err = toolchain.compile(&targets[0], ProgramSource::Memory("x"), &failing).unwrap_err();
    assert!(err.to_string().contains("forced failure"), "{err}");
}
