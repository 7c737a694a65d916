//! Ballista trajectory simulator CLI

use clap::Parser;
use std::path::PathBuf;

use ballista::prelude::*;
use log::info;

#[derive(Parser, Debug)]
#[command(name = "ballista")]
#[command(about = "Sample projectile motion on an OpenCL device")]
#[command(version)]
struct Cli {
    /// JSON run configuration; flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// OpenCL source file (default: bundled trajectory kernels)
    #[arg(short, long, value_name = "FILE")]
    source: Option<PathBuf>,

    /// Kernel variant to run
    #[arg(short, long)]
    kernel: Option<Variant>,

    /// Entry point name, for custom sources
    #[arg(long, conflicts_with = "kernel")]
    entry: Option<String>,

    /// Maximum simulated time
    #[arg(long)]
    time_max: Option<f32>,

    /// Fixed time step
    #[arg(long)]
    time_delta: Option<f32>,

    /// Time of the first sample
    #[arg(long)]
    initial_time: Option<f32>,

    /// Launch speed
    #[arg(long)]
    speed: Option<f32>,

    /// Launch angle in degrees, or launch height for the height variant
    #[arg(long, allow_negative_numbers = true)]
    param: Option<f32>,

    /// Preferred device class: cpu, gpu, accelerator, all or default
    #[arg(short, long)]
    device: Option<DeviceKind>,

    /// Fail instead of falling back to another device class
    #[arg(long)]
    no_fallback: bool,

    /// Platform index
    #[arg(long)]
    platform: Option<usize>,

    /// Extra OpenCL compiler options
    #[arg(long, allow_hyphen_values = true)]
    build_options: Option<String>,

    /// List available devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Variant {
    /// Launch from the ground at an angle
    Angle,
    /// Horizontal launch from a height
    Height,
}

impl Variant {
    fn entry_point(self) -> &'static str {
        match self {
            Variant::Angle => KERNEL_ANGLE,
            Variant::Height => KERNEL_HEIGHT,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    if cli.list_devices {
        for (i, device) in ComputeContext::list_devices()?.iter().enumerate() {
            println!("{}: {}", i, device);
        }
        return Ok(());
    }

    let config = resolve_config(&cli)?;
    info!(
        "Running '{}' for t in [0, {}) step {}",
        config.kernel_name, config.time_max, config.time_delta
    );

    let mut simulator = TrajectorySimulator::from_config(&config)?;
    simulator.acquire(&config.kernel_name)?;
    simulator.compute(
        config.initial_time,
        config.initial_speed,
        config.initial_param,
    )?;
    simulator.log()?;
    simulator.release();
    Ok(())
}

/// Layers the config file, environment and flags, in increasing priority
fn resolve_config(cli: &Cli) -> ballista::Result<SimulationConfig> {
    let mut config = match &cli.config {
        Some(path) => SimulationConfig::from_json_file(path)?,
        None => SimulationConfig::default(),
    };
    config.context = config.context.with_env_overrides()?;
    apply_flags(cli, &mut config);
    config.context.validate()?;
    Ok(config)
}

fn apply_flags(cli: &Cli, config: &mut SimulationConfig) {
    if let Some(source) = &cli.source {
        config.kernel_source = Some(source.clone());
    }
    if let Some(variant) = cli.kernel {
        config.kernel_name = variant.entry_point().to_string();
    }
    if let Some(entry) = &cli.entry {
        config.kernel_name = entry.clone();
    }
    if let Some(time_max) = cli.time_max {
        config.time_max = time_max;
    }
    if let Some(time_delta) = cli.time_delta {
        config.time_delta = time_delta;
    }
    if let Some(initial_time) = cli.initial_time {
        config.initial_time = initial_time;
    }
    if let Some(speed) = cli.speed {
        config.initial_speed = speed;
    }
    if let Some(param) = cli.param {
        config.initial_param = param;
    }
    if let Some(device) = cli.device {
        config.context.device_type = device;
    }
    if cli.no_fallback {
        config.context.fallback_to_any_device = false;
    }
    if let Some(platform) = cli.platform {
        config.context.platform_index = Some(platform);
    }
    if let Some(options) = &cli.build_options {
        config.context.build_options = options.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ballista").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_match_simulation_config() {
        let mut config = SimulationConfig::default();
        apply_flags(&parse(&[]), &mut config);
        assert_eq!(config, SimulationConfig::default());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = parse(&[
            "--kernel",
            "height",
            "--time-max",
            "4",
            "--time-delta",
            "0.5",
            "--speed",
            "12",
            "--param",
            "30",
            "--device",
            "gpu",
            "--no-fallback",
            "--build-options",
            "-cl-fast-relaxed-math",
        ]);
        let mut config = SimulationConfig::default();
        apply_flags(&cli, &mut config);

        assert_eq!(config.kernel_name, KERNEL_HEIGHT);
        assert_eq!(config.time_max, 4.0);
        assert_eq!(config.time_delta, 0.5);
        assert_eq!(config.initial_speed, 12.0);
        assert_eq!(config.initial_param, 30.0);
        assert_eq!(config.context.device_type, DeviceKind::Gpu);
        assert!(!config.context.fallback_to_any_device);
        assert_eq!(config.context.build_options, "-cl-fast-relaxed-math");
    }

    #[test]
    fn test_entry_conflicts_with_kernel() {
        let result =
            Cli::try_parse_from(["ballista", "--kernel", "angle", "--entry", "custom_kernel"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        assert!(Cli::try_parse_from(["ballista", "--device", "fpga"]).is_err());
    }

    #[test]
    fn test_verbose_count() {
        assert_eq!(parse(&["-vv"]).verbose, 2);
    }
}
