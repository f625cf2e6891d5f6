// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   demo_frame_producer <channel> <frames> <interval_ms>
//
// Attaches as the producer of <channel> over POSIX shared memory, waits for
// a consumer and then puts <frames> synthetic video frames, one every
// <interval_ms> milliseconds. Run `demo_frame_consumer` with the same
// channel name in another terminal. RUST_LOG controls the log level.

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use shmstream::{Backend, ChannelConfig, FrameInfo, Producer, SegmentRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 360;
const KIND_RAW: u32 = 1;

static QUIT: AtomicBool = AtomicBool::new(false);

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("usage: demo_frame_producer <channel> <frames> <interval_ms>");
        std::process::exit(1);
    }
    let frames: u64 = args[2].parse()?;
    let interval_ms: u64 = args[3].parse()?;
    install_quit_handler();

    let registry = Arc::new(SegmentRegistry::new());
    let cfg = ChannelConfig::producer(args[1].as_str(), "demo_producer")
        .with_frame_capacity(8)
        .with_payload_bytes(1 << 20)
        .with_backend(Backend::OsSharedMemory);
    let mut producer = Producer::attach(&registry, &cfg)?;

    info!(channel = %cfg.name, "waiting for a consumer");
    while producer.readers() == 0 {
        if QUIT.load(Ordering::Acquire) {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }

    // Frame size varies so the arena wraps at uneven offsets.
    let mut payload = Vec::with_capacity(64 << 10);
    for seq in 1..=frames {
        if QUIT.load(Ordering::Acquire) {
            break;
        }
        payload.clear();
        payload.resize((16 << 10) + (seq as usize % 7) * 4096, (seq % 251) as u8);
        let pts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        let frame = FrameInfo::new(KIND_RAW, seq)
            .with_timestamp(pts)
            .with_rate(30)
            .with_dimensions(WIDTH, HEIGHT);
        let delivered = producer.put(&frame, &payload)?;
        info!(seq, len = payload.len(), delivered, "put");
        thread::sleep(Duration::from_millis(interval_ms));
    }

    let stats = producer.stats();
    info!(
        produced = stats.produced,
        arena_wraps = stats.arena_wraps,
        consumers = stats.consumers,
        "done"
    );
    producer.detach();
    Ok(())
}

#[cfg(unix)]
extern "C" fn on_signal(_: libc::c_int) {
    QUIT.store(true, Ordering::Release);
}

/// SIGINT / SIGTERM set `QUIT` so the handle detaches cleanly.
#[cfg(unix)]
fn install_quit_handler() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_quit_handler() {}
