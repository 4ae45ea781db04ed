//! Backend listing.

use anyhow::Result;
use kiln_compute::{detect_backends, select_best_backend};

/// Prints every compiled-in backend, best first.
pub fn run(verbose: bool) -> Result<()> {
    for info in detect_backends() {
        let status = if info.available { "+" } else { "-" };
        if verbose {
            println!("[{status}] {:<8} priority {:>3}  {}", info.name, info.priority, info.description);
        } else {
            println!("[{status}] {:<8} {}", info.name, info.description);
        }
    }
    println!("Auto-selected: {}", select_best_backend());
    Ok(())
}
