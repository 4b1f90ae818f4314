use std::panic;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::Parser;
use resource_regulator::{Error, HostProfile, RegulatorConfig, RegulatorLoop};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing_subscriber::EnvFilter;

/// Keeps system CPU and memory utilization near target levels.
#[derive(Debug, Parser)]
#[command(name = "resource-regulator", version, about)]
struct Cli {
    /// TOML config file
    #[arg(short, long, env = "RESOURCE_REGULATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Target total CPU utilization in percent
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=100))]
    cpu: Option<u32>,

    /// Target total memory utilization in percent
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=100))]
    mem: Option<u32>,

    /// Seconds between regulator cycles
    #[arg(long)]
    interval: Option<u64>,

    /// Only sample and report, never generate load
    #[arg(long)]
    monitor_only: bool,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn resolve_config(&self) -> anyhow::Result<RegulatorConfig> {
        let mut config = match &self.config {
            Some(path) => RegulatorConfig::load(path)?,
            None => RegulatorConfig::default(),
        };
        if let Some(cpu) = self.cpu {
            config.cpu_threshold = cpu;
        }
        if let Some(mem) = self.mem {
            config.memory_threshold = mem;
        }
        if let Some(interval) = self.interval {
            config.update_interval_secs = interval;
        }
        if self.monitor_only {
            config.enable_workers = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
    set_panic_hook();

    let config = cli.resolve_config().context("invalid configuration")?;
    tracing::info!(
        cpu_threshold = config.cpu_threshold,
        memory_threshold = config.memory_threshold,
        interval_secs = config.update_interval_secs,
        "configuration loaded"
    );

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop)).map_err(Error::Signal)?;
    }

    let host = HostProfile::detect();
    let mut regulator = RegulatorLoop::for_host(&config, &host);
    regulator.run(&stop);

    tracing::info!("exited cleanly");
    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
