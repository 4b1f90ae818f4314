//! Adaptive resource-utilization regulator.
//!
//! Samples system-wide CPU and memory utilization and drives two synthetic load
//! generators so that total utilization settles near configured thresholds.

pub mod compute;
pub mod config;
pub mod error;
pub mod filter;
pub mod host;
pub mod hysteresis;
pub mod memory;
pub mod regulator;
pub mod sampler;
mod shutdown;

pub use compute::ComputeLoadGenerator;
pub use config::RegulatorConfig;
pub use error::{Error, Result};
pub use filter::SmoothingFilter;
pub use host::{CpuStrategy, HostProfile};
pub use hysteresis::Hysteresis;
pub use memory::MemoryLoadGenerator;
pub use regulator::{CycleReport, LoadGenerator, RegulatorLoop, UtilizationSource};
pub use sampler::{UtilizationSample, UtilizationSampler};

// Memory regions report their committed size through jemalloc, so jemalloc has to own
// every allocation in the process, tests included. Without the `jemalloc` feature the
// region size falls back to the buffer capacity.
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;
