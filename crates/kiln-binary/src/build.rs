//! Building universal binaries.
//!
//! Every target is compiled on its own worker of a dedicated rayon pool
//! sized `min(hardware threads, targets)`. The archive is only written when
//! all targets compiled.

use std::path::Path;
use std::thread;

use rayon::prelude::*;
use tracing::{error, info};

use crate::archive::Archive;
use crate::target::Target;
use crate::toolchain::{CompileOptions, ProgramSource, Toolchain};
use crate::{BinaryError, BinaryResult};

/// Compiles `source` for every target and assembles the archive in target order.
pub fn build_archive(
    toolchain: &dyn Toolchain,
    source: ProgramSource<'_>,
    targets: &[Target],
    options: &CompileOptions,
) -> BinaryResult<Archive> {
    if targets.is_empty() {
        return Err(BinaryError::InvalidTarget("no targets to build".into()));
    }

    let hw_threads = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let num_threads = hw_threads.min(targets.len());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("kiln-build-{i}"))
        .build()
        .map_err(|e| BinaryError::Io(std::io::Error::other(e)))?;

    info!(targets = targets.len(), threads = num_threads, "building universal binary");
    let results: Vec<_> = pool.install(|| {
        targets
            .par_iter()
            .map(|target| (target, toolchain.compile(target, source, options)))
            .collect()
    });

    let mut archive = Archive::new();
    let mut failed = Vec::new();
    for (target, result) in results {
        match result {
            Ok(program) => {
                archive.push(*target, program.toolchain_version, program.functions, program.data);
            }
            Err(e) => {
                error!(binary_target = %target, error = %e, "target failed to build");
                failed.push(target.to_string());
            }
        }
    }
    if !failed.is_empty() {
        return Err(BinaryError::BuildFailed(failed));
    }
    Ok(archive)
}

/// Builds from a source file and writes the archive to `dst`.
pub fn build_archive_from_file(
    toolchain: &dyn Toolchain,
    src: &Path,
    dst: &Path,
    targets: &[Target],
    options: &CompileOptions,
) -> BinaryResult<Archive> {
    let archive = build_archive(toolchain, ProgramSource::File(src), targets, options)?;
    archive.save(dst)?;
    info!(src = %src.display(), dst = %dst.display(), binaries = archive.len(), "universal binary written");
    Ok(archive)
}

/// Builds from in-memory source and writes the archive to `dst`.
pub fn build_archive_from_memory(
    toolchain: &dyn Toolchain,
    code: &str,
    dst: &Path,
    targets: &[Target],
    options: &CompileOptions,
) -> BinaryResult<Archive> {
    let archive = build_archive(toolchain, ProgramSource::Memory(code), targets, options)?;
    archive.save(dst)?;
    info!(dst = %dst.display(), binaries = archive.len(), "universal binary written");
    Ok(archive)
}
