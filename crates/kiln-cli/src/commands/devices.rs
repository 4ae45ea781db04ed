//! Device listing.

use crate::DevicesArgs;
use anyhow::{Context as _, Result};
use kiln_compute::{Backend, Context, create_context, detect_backends};
use kiln_core::{Config, Device};

/// Creates a context per requested backend and prints its devices.
pub fn run(args: DevicesArgs, config: &Config, verbose: bool) -> Result<()> {
    let backends: Vec<Backend> = match &args.backend {
        Some(name) => vec![super::parse_backend(name)?],
        None => detect_backends().into_iter().filter(|b| b.available).map(|b| b.backend).collect(),
    };

    for backend in backends {
        let ctx = create_context(backend, config).with_context(|| format!("Failed to create {backend} context"))?;
        println!("{} ({} devices)", ctx.backend(), ctx.devices().len());
        let fastest = ctx.fastest_device().map(|d| d.id);
        for device in ctx.devices() {
            let marker = if Some(device.id) == fastest { "*" } else { " " };
            println!(" {marker} {device}");
            if verbose {
                print_details(device);
            }
        }
    }
    Ok(())
}

fn print_details(device: &Device) {
    println!("      Vendor:       {} ({:?})", device.vendor_name, device.vendor);
    println!("      Driver:       {}", device.driver_version_str);
    if let Some(uuid) = device.uuid_string() {
        println!("      UUID:         {uuid}");
    }
    println!("      Score:        {}", device.score);
    println!("      Max alloc:    {}", super::format_size(device.max_mem_alloc));
    println!("      Local memory: {}", super::format_size(device.local_mem_size));
    println!(
        "      Local size:   {} total, {}x{}x{}",
        device.max_total_local_size, device.max_local_size.x, device.max_local_size.y, device.max_local_size.z
    );
    println!("      Images:       2D {}x{}, {} mips", device.max_image_2d_dim.x, device.max_image_2d_dim.y, device.max_mip_levels);
}
