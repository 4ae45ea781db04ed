//! CLI command implementations

pub mod backends;
pub mod devices;
pub mod fuba;

use anyhow::{Result, bail};
use kiln_compute::Backend;

/// Parses a `--backend` value.
pub fn parse_backend(name: &str) -> Result<Backend> {
    match Backend::parse(name) {
        Some(backend) => Ok(backend),
        None => bail!("Unknown backend '{name}' (expected host, cuda, vulkan or auto)"),
    }
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 { format!("{bytes} B") } else { format!("{value:.1} {}", UNITS[unit]) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend() {
        assert_eq!(parse_backend("VK").unwrap(), Backend::Vulkan);
        assert_eq!(parse_backend("cpu").unwrap(), Backend::Host);
        assert!(parse_backend("metal").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(4 << 20), "4.0 MiB");
        assert_eq!(format_size(1536), "1.5 KiB");
    }
}
