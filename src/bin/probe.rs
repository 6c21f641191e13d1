#![deny(missing_docs)]
//! # Probe
//!
//! The `probe` binary opens one device, brings up a `DeviceContext` on it and
//! pushes a small `vector_add` workload through the whole runtime: heap
//! allocation, host-to-device writes, kernel launch through the code cache,
//! a barrier and a blocking read-back. The result is verified on the host.
//!
//! ## Backends
//!
//! - **`host`**: the in-process emulated device. Always available.
//! - **`cuda`**: the CUDA driver API. Requires the `cuda` feature.
//!
//! With `--dump-events` the event timeline is printed in the same format the
//! runtime uses on teardown; with `--out` a JSON summary is written.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use accelrt::{
    util::{human_readable_bytes, parse_byte_size},
    Access, DeviceContext, Driver, EventStatus, HostDeviceSpec, HostDriver, HostFault,
    HostInvocation, KernelCode, RuntimeConfig, TaskMetaData, NO_EVENT,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive a vector_add workload through one device runtime")]
/// Command-line arguments for the probe.
struct Args {
    /// Device backend: host or cuda
    #[arg(long, default_value = "host")]
    backend: String,

    /// Device index within the backend
    #[arg(long, default_value = "0")]
    device: usize,

    /// Heap size request (e.g. 64MB, 0x100000); overrides the configuration
    #[arg(long)]
    heap_size: Option<String>,

    /// Event window capacity; overrides the configuration
    #[arg(long)]
    event_window: Option<usize>,

    /// Number of f32 elements per vector
    #[arg(long, default_value = "4096")]
    elements: usize,

    /// Number of write/launch/read rounds
    #[arg(long, default_value = "8")]
    iterations: usize,

    /// JSON configuration file; ACCELRT_* variables are used otherwise
    #[arg(long)]
    config: Option<String>,

    /// Output file for results
    #[arg(long)]
    out: Option<String>,

    /// Print the event timeline before teardown
    #[arg(long)]
    dump_events: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Entry point of the probe kernel.
const VECTOR_ADD: &str = "vector_add";

/// The frame holds `[a, b, c, n]` as 64-bit slots.
const FRAME_SLOTS: usize = 4;

/// Smallest window that keeps every wait list of one round live.
const MIN_EVENT_WINDOW: usize = 4;

const VECTOR_ADD_CUDA: &str = r#"
extern "C" __global__ void vector_add(unsigned char *heap, unsigned long long frame)
{
    unsigned long long *slots = (unsigned long long *) (heap + frame);
    const float *a = (const float *) slots[0];
    const float *b = (const float *) slots[1];
    float *c = (float *) slots[2];
    unsigned long long n = slots[3];
    unsigned long long i = (unsigned long long) blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) {
        c[i] = a[i] + b[i];
    }
}
"#;

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("[PROBE:INIT] Starting probe");
    info!(
        "[PROBE:INIT] Backend: {}, device: {}",
        args.backend, args.device
    );

    let config = load_config(&args)?;
    info!(
        "[PROBE:INIT] Heap request: {}, event window: {}",
        human_readable_bytes(config.heap_size),
        config.event_window
    );

    let (driver, code) = open_device(&args)?;
    let mut ctx = DeviceContext::new(driver, &config).context("Failed to create device context")?;
    ctx.init().context("Failed to initialize device context")?;
    info!(
        "[PROBE:INIT] Context {} ready on {} ({} heap)",
        ctx.id(),
        ctx,
        human_readable_bytes(ctx.memory_manager().capacity())
    );
    if ctx.needs_bump() {
        info!("[PROBE:INIT] Device uses a bump buffer");
    }
    if ctx.uses_relative_addresses() {
        info!("[PROBE:INIT] Kernel frames carry heap-relative addresses");
    }

    let start_time = Instant::now();
    let stats = run_vector_add(&mut ctx, &args, &code)?;
    let elapsed = start_time.elapsed();

    info!("[PROBE:DONE] Probe finished");
    info!("[PROBE:DONE] Launches: {}", stats.launches);
    info!("[PROBE:DONE] Mismatches: {}", stats.mismatches);
    info!(
        "[PROBE:DONE] Heap used: {} of {}",
        human_readable_bytes(stats.heap_used),
        human_readable_bytes(stats.heap_capacity)
    );
    info!(
        "[PROBE:DONE] Wall time: {:.2} ms",
        elapsed.as_secs_f64() * 1000.0
    );
    if stats.launches > 0 {
        info!(
            "[PROBE:DONE] Mean kernel time: {:.2} us",
            stats.kernel_time_ns as f64 / stats.launches as f64 / 1000.0
        );
    }

    if args.dump_events {
        ctx.dump_events(std::io::stdout().lock())
            .context("Failed to dump events")?;
    }

    if let Some(ref out_file) = args.out {
        save_results(out_file, &ctx, &args, &stats, elapsed)?;
    }

    ctx.teardown();

    if stats.mismatches > 0 {
        bail!("{} elements did not verify", stats.mismatches);
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<RuntimeConfig> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_json_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => RuntimeConfig::from_env().context("Invalid ACCELRT_* environment")?,
    };

    if let Some(ref size) = args.heap_size {
        config.heap_size = parse_byte_size(size)
            .with_context(|| format!("Invalid heap size '{}'", size))?;
    }
    if let Some(window) = args.event_window {
        config.event_window = window;
    }
    if config.event_window < MIN_EVENT_WINDOW {
        bail!(
            "Event window of {} is too small, the probe needs at least {}",
            config.event_window,
            MIN_EVENT_WINDOW
        );
    }
    if args.dump_events {
        // Printed explicitly before teardown.
        config.dump_events = false;
    }
    config.validate()?;
    Ok(config)
}

/// Opens the requested backend and returns it with the probe kernel's code.
fn open_device(args: &Args) -> Result<(Arc<dyn Driver>, KernelCode)> {
    match args.backend.as_str() {
        "host" => {
            if args.device != 0 {
                warn!("[PROBE:INIT] Host backend has a single device, ignoring --device");
            }
            let driver = HostDriver::new(HostDeviceSpec::default());
            driver.register_kernel(VECTOR_ADD, host_vector_add);
            let driver: Arc<dyn Driver> = Arc::new(driver);
            Ok((driver, KernelCode::Source(VECTOR_ADD.to_string())))
        }
        #[cfg(feature = "cuda")]
        "cuda" => {
            let driver: Arc<dyn Driver> = Arc::new(accelrt::CudaDriver::new(args.device)?);
            Ok((driver, KernelCode::Source(VECTOR_ADD_CUDA.to_string())))
        }
        #[cfg(not(feature = "cuda"))]
        "cuda" => {
            debug!(
                "[PROBE:INIT] CUDA kernel would be:\n{}",
                VECTOR_ADD_CUDA.trim()
            );
            bail!("probe was built without the `cuda` feature")
        }
        other => bail!("Unknown backend '{}' (expected host or cuda)", other),
    }
}

/// Host body of `vector_add`.
fn host_vector_add(inv: &mut HostInvocation<'_>) -> Result<(), HostFault> {
    let a = inv.resolve(inv.frame_slot(0)?)?;
    let b = inv.resolve(inv.frame_slot(1)?)?;
    let c = inv.resolve(inv.frame_slot(2)?)?;
    let n = inv.frame_slot(3)?;
    for i in 0..n {
        let x: f32 = inv.read(a + i * 4)?;
        let y: f32 = inv.read(b + i * 4)?;
        inv.write(c + i * 4, x + y)?;
    }
    Ok(())
}

/// Holds statistics about the probe run.
#[derive(Debug, Default)]
struct ProbeStats {
    launches: u64,
    kernel_time_ns: u64,
    mismatches: u64,
    heap_used: u64,
    heap_capacity: u64,
    failed_events: u64,
}

fn run_vector_add(ctx: &mut DeviceContext, args: &Args, code: &KernelCode) -> Result<ProbeStats> {
    let mut stats = ProbeStats::default();
    let n = args.elements;
    let bytes = (n * std::mem::size_of::<f32>()) as u64;

    let mut meta = TaskMetaData::new("probe", VECTOR_ADD, FRAME_SLOTS)
        .with_domain(&[n as u64])
        .with_access(0, Access::Read)
        .with_access(1, Access::Read)
        .with_access(2, Access::Write)
        .with_profiling(true)
        .with_debug(args.verbose);

    let kernel = ctx
        .install_code(&meta, meta.id(), VECTOR_ADD, code)
        .context("Failed to install vector_add")?;
    info!("[PROBE:INSTALL] Installed {}", kernel.key);

    let a = ctx.allocate_buffer(bytes)?;
    let b = ctx.allocate_buffer(bytes)?;
    let c = ctx.allocate_buffer(bytes)?;
    let frame = ctx.allocate_buffer((FRAME_SLOTS * 8) as u64)?;
    debug!(
        "[PROBE:ALLOC] a @ {:#x}, b @ {:#x}, c @ {:#x}, frame @ {:#x}",
        a.offset, b.offset, c.offset, frame.offset
    );

    let slots: [u64; FRAME_SLOTS] = [
        ctx.to_kernel_address(a.offset),
        ctx.to_kernel_address(b.offset),
        ctx.to_kernel_address(c.offset),
        n as u64,
    ];
    let mut host_c = vec![0.0f32; n];

    for iteration in 0..args.iterations {
        let host_a: Vec<f32> = (0..n).map(|i| (i + iteration) as f32).collect();
        let host_b: Vec<f32> = (0..n).map(|i| (2 * i) as f32 * 0.5).collect();

        let write_a = ctx.enqueue_write_buffer(a.buffer, a.offset, bytes, &host_a, 0, &[]);
        let write_b = ctx.enqueue_write_buffer(b.buffer, b.offset, bytes, &host_b, 0, &[]);
        let write_frame =
            ctx.enqueue_write_buffer(frame.buffer, frame.offset, frame.length, &slots, 0, &[]);

        let launch = ctx.launch(&kernel, &mut meta, frame.offset, &[write_a, write_b, write_frame]);
        let pinned = launch != NO_EVENT && ctx.retain_event(launch);
        let barrier = ctx.enqueue_barrier(&[launch]);
        ctx.read_buffer(c.buffer, c.offset, bytes, &mut host_c, 0, &[barrier]);

        let event = ctx.resolve_event(launch);
        if pinned {
            ctx.release_event(launch);
        }
        if let EventStatus::Error(code) = event.status() {
            warn!("[PROBE:RUN] Iteration {} kernel failed with {}", iteration, code);
            stats.failed_events += 1;
        }
        stats.launches += 1;
        stats.kernel_time_ns += event.elapsed_ns();

        let mismatches = host_a
            .iter()
            .zip(&host_b)
            .zip(&host_c)
            .filter(|((x, y), z)| (*x + *y - **z).abs() > f32::EPSILON)
            .count();
        stats.mismatches += mismatches as u64;
        debug!(
            "[PROBE:RUN] Iteration {}: {} ns, {} mismatches",
            iteration,
            event.elapsed_ns(),
            mismatches
        );
    }

    ctx.sync();
    stats.heap_used = ctx.memory_manager().used();
    stats.heap_capacity = ctx.memory_manager().capacity();
    Ok(stats)
}

fn save_results(
    path: &str,
    ctx: &DeviceContext,
    args: &Args,
    stats: &ProbeStats,
    elapsed: Duration,
) -> Result<()> {
    use serde_json::json;
    use std::fs::File;
    use std::io::Write;

    let info = ctx.device_info();
    let results = json!({
        "probe": {
            "context": ctx.id(),
            "backend": info.backend,
            "device": info.name,
            "platform": info.platform_name,
            "elements": args.elements,
            "iterations": args.iterations,
            "launches": stats.launches,
            "failed_events": stats.failed_events,
            "mismatches": stats.mismatches,
            "heap_used_bytes": stats.heap_used,
            "heap_capacity_bytes": stats.heap_capacity,
            "kernel_time_ns": stats.kernel_time_ns,
            "wall_time_ms": elapsed.as_secs_f64() * 1000.0,
            "needs_bump": ctx.needs_bump(),
            "relative_addresses": ctx.uses_relative_addresses(),
        },
        "events": ctx.events(),
    });

    let mut file = File::create(path)?;
    writeln!(file, "{}", serde_json::to_string_pretty(&results)?)?;
    info!("[PROBE:DONE] Saved results to {}", path);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["probe", "--heap-size", "1MB", "--elements", "64", "--iterations", "3"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_small_event_window_is_rejected() {
        let err = load_config(&args(&["--event-window", "2"])).unwrap_err();
        assert!(err.to_string().contains("at least 4"), "{err}");
    }

    #[test]
    fn test_vector_add_on_smallest_window() {
        let args = args(&["--event-window", "4"]);
        let config = load_config(&args).unwrap();
        let (driver, code) = open_device(&args).unwrap();
        let mut ctx = DeviceContext::new(driver, &config).unwrap();
        ctx.init().unwrap();

        let stats = run_vector_add(&mut ctx, &args, &code).unwrap();
        assert_eq!(stats.launches, 3);
        assert_eq!(stats.mismatches, 0);
        assert_eq!(stats.failed_events, 0);
        assert!(ctx.event_table().len() <= 4);
    }
}
