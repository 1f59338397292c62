//! Ambient resource sampling. Never required for correctness of caching,
//! aggregation, or scheduling decisions — only feeds status/metrics output.

use sysinfo::{System, SystemExt};

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub disk_used_mb: u64,
}

pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSnapshot;
}

/// `sysinfo`-backed sampler for production use.
pub struct SystemResourceSampler {
    system: parking_lot::Mutex<System>,
}

impl SystemResourceSampler {
    pub fn new() -> Self {
        Self { system: parking_lot::Mutex::new(System::new_all()) }
    }
}

impl Default for SystemResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemResourceSampler {
    fn sample(&self) -> ResourceSnapshot {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();
        ResourceSnapshot {
            cpu_percent: system.global_cpu_info().cpu_usage(),
            memory_used_mb: system.used_memory() / 1024,
            memory_total_mb: system.total_memory() / 1024,
            disk_used_mb: 0,
        }
    }
}

/// Fixed-value sampler for deterministic tests.
pub struct FixedResourceSampler(pub ResourceSnapshot);

impl ResourceSampler for FixedResourceSampler {
    fn sample(&self) -> ResourceSnapshot {
        self.0
    }
}
