//! Universal binary commands: info, match, build.

use crate::{FubaBuildArgs, FubaInfoArgs, FubaMatchArgs};
use anyhow::{Context as _, Result, bail};
use kiln_binary::{
    Archive, CommandToolchain, CompileOptions, MatchOptions, Target, build_archive_from_file,
    find_best_match_for_device_with, load_archive,
};
use kiln_compute::{Backend, Context, create_context, select_best_backend};
use kiln_core::Config;
use tracing::info;

/// Prints a summary of each archive.
pub fn run_info(args: FubaInfoArgs, verbose: bool) -> Result<()> {
    for path in &args.input {
        let archive = load_archive(path).with_context(|| format!("Failed to load: {}", path.display()))?;
        println!("{}", path.display());
        println!("  Binaries: {}", archive.len());
        for line in archive.describe().lines() {
            println!("  {line}");
        }
        if args.functions || verbose {
            print_functions(&archive)?;
        }
        if args.input.len() > 1 {
            println!();
        }
    }
    Ok(())
}

fn print_functions(archive: &Archive) -> Result<()> {
    for (index, binary) in archive.iter().enumerate() {
        println!("  #{index} {}", binary.target);
        for function in binary.function_infos()? {
            let local = function.local_size;
            println!("    {} ({:?}, local {}x{}x{})", function.name, function.function_type, local.x, local.y, local.z);
            for (i, arg) in function.args.iter().enumerate() {
                println!("      [{i}] {:?} size {} {:?} {:?}", arg.address_space, arg.size, arg.image_type, arg.image_access);
            }
        }
    }
    Ok(())
}

/// Shows which binary every device of the backend would load.
pub fn run_match(args: FubaMatchArgs, config: &Config) -> Result<()> {
    let archive = load_archive(&args.input).with_context(|| format!("Failed to load: {}", args.input.display()))?;
    let backend = match &args.backend {
        Some(name) => super::parse_backend(name)?,
        None => match Backend::from_config(config) {
            Backend::Auto => select_best_backend(),
            backend => backend,
        },
    };
    let ctx = create_context(backend, config).with_context(|| format!("Failed to create {backend} context"))?;
    let options = MatchOptions::from(config);

    let mut unmatched = 0;
    for device in ctx.devices() {
        match find_best_match_for_device_with(device, &archive, &options) {
            Some(best) => println!("{} {}: #{} {}", device.id, device.name, best.index, best.target),
            None => {
                println!("{} {}: no compatible binary", device.id, device.name);
                unmatched += 1;
            }
        }
    }
    if unmatched == ctx.devices().len() {
        bail!("No device of the {backend} backend can load {}", args.input.display());
    }
    Ok(())
}

/// Compiles the source for every target and writes the archive.
pub fn run_build(args: FubaBuildArgs, config: &Config) -> Result<()> {
    let targets = args
        .targets
        .iter()
        .map(|spec| spec.parse::<Target>().with_context(|| format!("Invalid target: {spec}")))
        .collect::<Result<Vec<_>>>()?;

    let mut toolchain_config = config.toolchain.clone();
    if let Some(compiler) = &args.compiler {
        toolchain_config.compiler = Some(compiler.display().to_string());
    }
    toolchain_config.flags.extend(args.flags.iter().cloned());
    let toolchain = CommandToolchain::from_config(&toolchain_config);

    let mut options = CompileOptions::from_config(&toolchain_config);
    options.debug |= args.debug;

    info!(compiler = %toolchain.compiler().display(), targets = targets.len(), "building");
    let archive = build_archive_from_file(&toolchain, &args.source, &args.output, &targets, &options)
        .with_context(|| format!("Failed to build: {}", args.source.display()))?;
    println!("Wrote {} ({} binaries)", args.output.display(), archive.len());
    for line in archive.describe().lines() {
        println!("  {line}");
    }
    Ok(())
}
