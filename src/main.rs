use std::fs::File;
use std::io::BufWriter;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use zeekspy::core::image;
use zeekspy::core::memory::AttachGuard;
use zeekspy::core::offsets;
use zeekspy::core::types::Pid;
use zeekspy::sampler::{self, SamplerConfig, SamplingDriver};

/// Sampling profiler for Zeek's script-level call stack.
#[derive(Parser, Debug)]
#[command(name = "zeekspy", version, about)]
struct Cli {
    /// Target process id.
    #[arg(long)]
    pid: libc::pid_t,

    /// Sampling frequency, in Hz.
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..))]
    hz: u32,

    /// Path to write the gzipped pprof profile on shutdown.
    #[arg(long)]
    profile: std::path::PathBuf,

    /// Interval between overhead-stats log lines, e.g. "5s", "500ms".
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    stats: Duration,

    /// Log every decoded frame at debug level.
    #[arg(long)]
    debug: bool,
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.parse::<u64>().map(Duration::from_millis).map_err(|e| e.to_string());
    }
    if let Some(secs) = raw.strip_suffix('s') {
        return secs.parse::<u64>().map(Duration::from_secs).map_err(|e| e.to_string());
    }
    raw.parse::<u64>().map(Duration::from_secs).map_err(|e| e.to_string())
}

fn main() {
    if let Err(e) = run() {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // `--help`/`--version` exit 0 via clap's own convention; every
            // other parse failure (missing --pid/--profile, bad value) must
            // exit 1, not clap's own usage code of 2.
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            e.print().ok();
            std::process::exit(code);
        }
    };

    let default_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let pid = Pid::from_raw(cli.pid);

    let image = image::resolve(cli.pid).context("resolving target image")?;

    let version = {
        let guard = AttachGuard::new(pid).context("attaching to read target version")?;
        image.read_version(guard.reader()).context("reading target version")?
    };
    log::info!("target version: {version}");
    let layout = offsets::lookup(&version).context("looking up layout for target version")?;

    let shutdown_rx = sampler::shutdown_channel().context("installing signal handler")?;

    let config = SamplerConfig { hz: cli.hz, stats_interval: cli.stats, debug: cli.debug };
    let driver = SamplingDriver::new(pid, image, layout, config);
    let accumulator = driver.run(&shutdown_rx)?;

    if let Some(parent) = cli.profile.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {parent:?}"))?;
        }
    }
    let file =
        File::create(&cli.profile).with_context(|| format!("creating output file {:?}", cli.profile))?;
    let mut writer = BufWriter::new(file);
    accumulator.write(&mut writer).context("writing profile")?;

    log::info!("wrote profile to {:?}", cli.profile);
    Ok(())
}
