//! CPU-based admission control for claiming new accounts.

use parking_lot::Mutex;
use sysinfo::System;

use crate::config::AdmissionConfig;

/// Source of per-core CPU utilisation samples, in percent.
pub trait CpuSampler: Send + Sync {
    /// Utilisation of each core since the previous sample. May be empty if
    /// the platform reports nothing.
    fn sample(&self) -> Vec<f32>;
}

/// Samples the host's CPUs through `sysinfo`.
///
/// Usage is computed between consecutive refreshes, so the very first
/// refresh reads as zero. Construction performs that warm-up sample.
pub struct SystemCpuSampler {
    system: Mutex<System>,
}

impl SystemCpuSampler {
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for SystemCpuSampler {
    fn sample(&self) -> Vec<f32> {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.cpus().iter().map(sysinfo::Cpu::cpu_usage).collect()
    }
}

impl std::fmt::Debug for SystemCpuSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCpuSampler").finish_non_exhaustive()
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    /// At least one core has headroom, or there was nothing to judge by.
    Accept,
    /// Every core is above the threshold.
    Saturated { cores: usize },
}

impl AdmissionDecision {
    #[must_use]
    pub const fn accepts(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Decides whether this process may take on more accounts this tick.
///
/// Work is refused only when every core is saturated. One hot core is normal
/// when the kernel pins a busy process, and must not stop acquisition.
pub struct AdmissionController {
    sampler: Box<dyn CpuSampler>,
    threshold_percent: f32,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig, sampler: Box<dyn CpuSampler>) -> Self {
        Self {
            sampler,
            threshold_percent: config.cpu_threshold_percent,
        }
    }

    /// Controller over the host's CPUs.
    #[must_use]
    pub fn system(config: &AdmissionConfig) -> Self {
        Self::new(config, Box::new(SystemCpuSampler::new()))
    }

    /// Takes a fresh sample and judges it.
    pub fn evaluate(&self) -> AdmissionDecision {
        evaluate_usage(&self.sampler.sample(), self.threshold_percent)
    }

    pub fn should_accept_new_work(&self) -> bool {
        self.evaluate().accepts()
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("threshold_percent", &self.threshold_percent)
            .finish_non_exhaustive()
    }
}

/// Judges one set of per-core samples. An empty sample fails open.
#[must_use]
pub fn evaluate_usage(usage_per_cpu: &[f32], threshold_percent: f32) -> AdmissionDecision {
    if !usage_per_cpu.is_empty() && usage_per_cpu.iter().all(|&u| u > threshold_percent) {
        AdmissionDecision::Saturated {
            cores: usage_per_cpu.len(),
        }
    } else {
        AdmissionDecision::Accept
    }
}
