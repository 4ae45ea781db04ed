//! Which backends were compiled in, which of them found a driver, and the
//! order in which [`select_best_backend`] tries them.

use super::Backend;

/// One compiled-in backend and whether it can be used right now.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub backend: Backend,
    pub name: &'static str,
    /// A driver was found and answered.
    pub available: bool,
    /// Auto-selection rank; 0 when unavailable.
    pub priority: u32,
    pub description: &'static str,
}

/// Probe every compiled-in backend. Sorted by rank, best first.
pub fn detect_backends() -> Vec<BackendInfo> {
    let mut backends = vec![BackendInfo {
        backend: Backend::Host,
        name: "CPU",
        available: true,
        priority: 10,
        description: "Host CPU with rayon kernels",
    }];

    #[cfg(feature = "vulkan")]
    {
        let available = super::VulkanContext::is_available();
        backends.push(BackendInfo {
            backend: Backend::Vulkan,
            name: "Vulkan",
            available,
            priority: if available { 100 } else { 0 },
            description: "GPU via Vulkan compute (SPIR-V)",
        });
    }

    #[cfg(feature = "cuda")]
    {
        let available = super::CudaComputeContext::is_available();
        backends.push(BackendInfo {
            backend: Backend::Cuda,
            name: "CUDA",
            available,
            // ahead of Vulkan on NVIDIA hardware
            priority: if available { 150 } else { 0 },
            description: "NVIDIA GPU via the CUDA driver API (PTX)",
        });
    }

    backends.sort_by_key(|b| std::cmp::Reverse(b.priority));
    backends
}

/// Highest ranked usable backend. The host backend is always usable.
pub fn select_best_backend() -> Backend {
    detect_backends().into_iter().find(|b| b.available).map_or(Backend::Host, |b| b.backend)
}

/// One line per backend, `[+]` when usable and `[-]` otherwise.
pub fn describe_backends() -> String {
    detect_backends()
        .iter()
        .map(|b| format!("[{}] {:<7} {}\n", if b.available { '+' } else { '-' }, b.name, b.description))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_by_priority() {
        let backends = detect_backends();
        assert!(backends.windows(2).all(|w| w[0].priority >= w[1].priority));
        assert!(backends.iter().any(|b| b.backend == Backend::Host && b.available));
    }

    #[test]
    fn test_best_is_available() {
        assert!(select_best_backend().is_available());
    }
}
