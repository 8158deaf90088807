//! Host load probe
//!
//! Periodically sampled into the consensus core, the load level biases both
//! leader election (vote delay) and command placement. Levels live in
//! [1, 10]; larger means more loaded.

use sysinfo::System;

/// Source of this node's load level
pub trait LoadProbe: Send + Sync {
    /// Sample the current load level. Implementations return values in
    /// [1, 10]; callers clamp anyway.
    fn sample(&self) -> u32;
}

/// Probe backed by the host's one-minute load average, normalized by the
/// number of CPUs and scaled onto [1, 10]
pub struct SystemLoadProbe {
    cpus: usize,
}

impl SystemLoadProbe {
    pub fn new() -> Self {
        let sys = System::new_all();
        SystemLoadProbe {
            cpus: sys.cpus().len().max(1),
        }
    }
}

impl Default for SystemLoadProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe for SystemLoadProbe {
    fn sample(&self) -> u32 {
        let per_cpu = System::load_average().one / self.cpus as f64;
        // A fully loaded machine (load average == cpu count) maps to 10
        let level = (per_cpu * 10.0).ceil() as i64;
        level.clamp(1, 10) as u32
    }
}

/// Fixed-level probe for tests and manual overrides
pub struct FixedLoadProbe {
    level: u32,
}

impl FixedLoadProbe {
    pub fn new(level: u32) -> Self {
        FixedLoadProbe {
            level: level.clamp(1, 10),
        }
    }
}

impl LoadProbe for FixedLoadProbe {
    fn sample(&self) -> u32 {
        self.level
    }
}
