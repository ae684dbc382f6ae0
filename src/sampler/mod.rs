//! The timer-driven loop that attaches, samples, detaches, and paces itself
//! against a fixed-frequency clock, plus the `ctrlc`-fed shutdown channel
//! that lets it do so without a second thread ever touching the traced PID.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::core::image::ZeekImage;
use crate::core::memory::AttachGuard;
use crate::core::offsets::LayoutDescriptor;
use crate::core::stack::StackReconstructor;
use crate::core::types::Pid;
use crate::profile::ProfileAccumulator;

pub struct SamplerConfig {
    pub hz: u32,
    pub stats_interval: Duration,
    pub debug: bool,
}

#[derive(Default)]
struct WindowStats {
    samples: u64,
    skipped_ticks: u64,
    sampling_time: Duration,
}

/// Owns the clock and the shutdown latch. Every other component here is
/// synchronous and stateless across ticks except the `ProfileAccumulator`,
/// which is append-only.
pub struct SamplingDriver {
    pid: Pid,
    image: ZeekImage,
    layout: LayoutDescriptor,
    config: SamplerConfig,
}

impl SamplingDriver {
    pub fn new(pid: Pid, image: ZeekImage, layout: LayoutDescriptor, config: SamplerConfig) -> Self {
        SamplingDriver { pid, image, layout, config }
    }

    /// Runs until `shutdown_rx` receives a message or is disconnected, then
    /// returns the accumulated profile for the caller to flush. The calling
    /// thread must be the one that attaches and makes every later `ptrace`
    /// call for `pid` — this never spawns a thread that touches the target.
    pub fn run(&self, shutdown_rx: &Receiver<()>) -> Result<ProfileAccumulator> {
        let mut accumulator = ProfileAccumulator::new(self.config.hz);
        let period = Duration::from_nanos(1_000_000_000 / u64::from(self.config.hz.max(1)));

        let mut next_tick = Instant::now();
        let mut window_start = Instant::now();
        let mut window = WindowStats::default();

        loop {
            let tick_start = Instant::now();

            if let Err(e) = self.sample_once(&mut accumulator) {
                log::warn!("sample failed, flushing and shutting down: {e:#}");
                break;
            }

            let elapsed = tick_start.elapsed();
            window.samples += 1;
            window.sampling_time += elapsed;

            let skipped = elapsed.as_nanos() / period.as_nanos().max(1);
            window.skipped_ticks += skipped as u64;
            next_tick += period * (1 + skipped as u32);

            let stats_elapsed = window_start.elapsed();
            if stats_elapsed >= self.config.stats_interval {
                self.log_stats(&accumulator, &window, stats_elapsed);
                window = WindowStats::default();
                window_start = Instant::now();
            }

            let wait = next_tick.saturating_duration_since(Instant::now());
            match shutdown_rx.recv_timeout(wait) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        Ok(accumulator)
    }

    fn sample_once(&self, accumulator: &mut ProfileAccumulator) -> Result<()> {
        let guard = AttachGuard::new(self.pid).context("attach")?;
        let recon = StackReconstructor::new(guard.reader(), &self.image, self.layout);
        let (stack, empty_flag) = recon.sample().context("reading call stack")?;
        if self.config.debug {
            for frame in &stack {
                log::debug!("{frame}");
            }
        }
        accumulator.add_sample(&stack, empty_flag);
        Ok(())
    }

    fn log_stats(&self, accumulator: &ProfileAccumulator, window: &WindowStats, elapsed: Duration) {
        let actual_hz = if elapsed.as_secs_f64() > 0.0 {
            window.samples as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let overhead = if elapsed.as_secs_f64() > 0.0 {
            window.sampling_time.as_secs_f64() / elapsed.as_secs_f64()
        } else {
            0.0
        };
        log::info!(
            "stats: elapsed={:.1}s total={} non_empty={} skipped_ticks={} hz={:.1} overhead={:.2}%",
            elapsed.as_secs_f64(),
            accumulator.sample_count(),
            accumulator.sample_count() as u64 - accumulator.empty_sample_count(),
            window.skipped_ticks,
            actual_hz,
            overhead * 100.0,
        );
    }
}

/// Installs a `ctrlc` handler and returns the receiving end of the channel
/// it feeds. `recv_timeout` against this channel is how `run` races the
/// shutdown signal against the next scheduled tick.
pub fn shutdown_channel() -> Result<Receiver<()>> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("installing signal handler")?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::FakeMemoryBuilder;
    use crate::core::offsets;
    use std::sync::mpsc::channel;

    fn fake_image_and_layout() -> (ZeekImage, LayoutDescriptor, FakeMemoryBuilder) {
        let mut mem = FakeMemoryBuilder::new();
        mem.vector_header(0x1000, 0x2000, 0x2000); // empty call stack
        mem.vector_header(0x3000, 0x4000, 0x4000); // empty frame stack
        let image = ZeekImage {
            exe: "/usr/bin/zeek".into(),
            load_addr: 0,
            call_stack_addr: 0x1000,
            frame_stack_addr: 0x3000,
            version_addr: 0x5000,
        };
        (image, offsets::lookup("3.1.0").unwrap(), mem)
    }

    #[test]
    fn window_stats_reset_after_interval() {
        let (_image, _layout, _mem) = fake_image_and_layout();
        // Exercises the pure accounting path without a live ptrace target:
        // one window accumulates, logs, and resets cleanly.
        let mut window = WindowStats::default();
        window.samples = 10;
        window.skipped_ticks = 2;
        window.sampling_time = Duration::from_millis(5);
        assert_eq!(window.samples, 10);
        let fresh = WindowStats::default();
        assert_eq!(fresh.samples, 0);
    }

    #[test]
    fn shutdown_channel_delivers_on_send() {
        let (tx, rx) = channel::<()>();
        tx.send(()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Ok(()));
    }
}
