// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   demo_frame_consumer <channel> <identifier> <timeout_ms>
//
// Attaches to <channel> over POSIX shared memory as consumer <identifier>
// and logs every frame it receives. Gives up after <timeout_ms> without a
// frame. Several consumers with different identifiers can run at once.

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shmstream::{Backend, ChannelConfig, Consumer, SegmentRegistry};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

static QUIT: AtomicBool = AtomicBool::new(false);

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("usage: demo_frame_consumer <channel> <identifier> <timeout_ms>");
        std::process::exit(1);
    }
    let timeout_ms: u64 = args[3].parse()?;
    install_quit_handler();

    let registry = Arc::new(SegmentRegistry::new());
    // Geometry must match the producer's.
    let cfg = ChannelConfig::consumer(args[1].as_str(), args[2].as_str())
        .with_frame_capacity(8)
        .with_payload_bytes(1 << 20)
        .with_backend(Backend::OsSharedMemory);
    let consumer = Consumer::attach(&registry, &cfg)?;
    info!(channel = %cfg.name, slot = consumer.slot(), "attached");

    let mut last_seq = 0u64;
    while !QUIT.load(Ordering::Acquire) {
        let Some(frame) = consumer.wait_get(Some(timeout_ms))? else {
            info!(timeout_ms, "no frame, giving up");
            break;
        };
        if last_seq != 0 && frame.info.seq != last_seq + 1 {
            warn!(expected = last_seq + 1, got = frame.info.seq, "frames lost");
        }
        last_seq = frame.info.seq;
        info!(
            seq = frame.info.seq,
            len = frame.len(),
            width = frame.info.width,
            height = frame.info.height,
            first = frame.data.first().copied().unwrap_or_default(),
            "got"
        );
    }

    info!(overwritten = consumer.overwritten(), "done");
    consumer.detach();
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
