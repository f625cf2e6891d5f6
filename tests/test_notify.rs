// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Push notification callbacks and blocking reads.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use shmstream::{ChannelConfig, Consumer, FrameInfo, Producer, SegmentRegistry};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(tag: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("test_notify_{tag}_{n}")
}

fn setup(tag: &str) -> (Arc<SegmentRegistry>, ChannelConfig, Producer) {
    let reg = Arc::new(SegmentRegistry::new());
    let cfg = ChannelConfig::new(unique_name(tag), "unused")
        .with_frame_capacity(8)
        .with_payload_bytes(64 << 10);
    let tx = Producer::attach(
        &reg,
        &ChannelConfig::producer(cfg.name.as_str(), "venc")
            .with_frame_capacity(8)
            .with_payload_bytes(64 << 10),
    )
    .expect("producer");
    (reg, cfg, tx)
}

fn consumer(reg: &Arc<SegmentRegistry>, cfg: &ChannelConfig, id: &str) -> Consumer {
    Consumer::attach(reg, &cfg.clone().with_identifier(id)).expect("consumer")
}

// ========== Callbacks ==========

#[test]
fn callbacks_run_in_registration_order() {
    let (reg, cfg, mut tx) = setup("order");
    let a = consumer(&reg, &cfg, "a");
    let b = consumer(&reg, &cfg, "b");
    let log = Arc::new(Mutex::new(Vec::new()));

    let l = Arc::clone(&log);
    b.register_callback(move |info, data| l.lock().unwrap().push(("b", info.seq, data.len())));
    let l = Arc::clone(&log);
    a.register_callback(move |info, data| l.lock().unwrap().push(("a", info.seq, data.len())));
    assert!(a.has_callback());

    tx.put(&FrameInfo::new(1, 1), &[0u8; 10]).expect("put");
    tx.put(&FrameInfo::new(1, 2), &[0u8; 20]).expect("put");

    assert_eq!(
        *log.lock().unwrap(),
        vec![("b", 1, 10), ("a", 1, 10), ("b", 2, 20), ("a", 2, 20)]
    );
    // Notification does not consume.
    assert_eq!(a.remaining(), 2);
}

#[test]
fn unregistered_callback_is_not_called() {
    let (reg, cfg, mut tx) = setup("unregister");
    let rx = consumer(&reg, &cfg, "rtsp");
    let calls = Arc::new(AtomicU64::new(0));

    let c = Arc::clone(&calls);
    rx.register_callback(move |_, _| {
        c.fetch_add(1, Ordering::Relaxed);
    });
    tx.put(&FrameInfo::new(1, 1), b"a").expect("put");
    assert!(rx.unregister_callback());
    assert!(!rx.unregister_callback());
    assert!(!rx.has_callback());
    tx.put(&FrameInfo::new(1, 2), b"b").expect("put");

    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[test]
fn detaching_drops_the_callback() {
    let (reg, cfg, mut tx) = setup("detach");
    let rx = consumer(&reg, &cfg, "rtsp");
    let _other = consumer(&reg, &cfg, "record");
    let calls = Arc::new(AtomicU64::new(0));

    let c = Arc::clone(&calls);
    rx.register_callback(move |_, _| {
        c.fetch_add(1, Ordering::Relaxed);
    });
    rx.detach();
    tx.put(&FrameInfo::new(1, 1), b"a").expect("put");

    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

#[test]
fn callback_may_read_from_the_channel() {
    let (reg, cfg, mut tx) = setup("reentrant");
    let rx = Arc::new(consumer(&reg, &cfg, "rtsp"));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (r, s) = (Arc::downgrade(&rx), Arc::clone(&seen));
    rx.register_callback(move |_, _| {
        if let Some(rx) = r.upgrade() {
            if let Some(f) = rx.get() {
                s.lock().unwrap().push(f.info.seq);
            }
        }
    });
    for seq in 1..=3 {
        tx.put(&FrameInfo::new(1, seq), b"frame").expect("put");
    }

    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(rx.remaining(), 0);
}

// ========== Blocking reads ==========

#[test]
fn wait_frame_times_out_on_an_idle_channel() {
    let (reg, cfg, _tx) = setup("timeout");
    let rx = consumer(&reg, &cfg, "rtsp");

    let start = Instant::now();
    assert!(!rx.wait_frame(Some(100)).expect("wait"));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(80), "waited {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2000), "waited {elapsed:?}");
    assert!(rx.wait_get(Some(10)).expect("wait").is_none());
}

#[test]
fn wait_frame_returns_at_once_when_a_frame_is_pending() {
    let (reg, cfg, mut tx) = setup("pending");
    let rx = consumer(&reg, &cfg, "rtsp");
    tx.put(&FrameInfo::new(1, 1), b"a").expect("put");

    assert!(rx.wait_frame(Some(0)).expect("wait"));
    let frame = rx.wait_get(None).expect("wait").expect("frame");
    assert_eq!(frame.info.seq, 1);
}

#[test]
fn blocked_consumer_wakes_on_put() {
    let (reg, cfg, mut tx) = setup("wake");
    let rx = consumer(&reg, &cfg, "rtsp");

    let reader = thread::spawn(move || {
        let mut got = Vec::new();
        while got.len() < 5 {
            match rx.wait_get(Some(5000)).expect("wait") {
                Some(f) => got.push(f.info.seq),
                None => break,
            }
        }
        got
    });

    for seq in 1..=5 {
        thread::sleep(Duration::from_millis(20));
        tx.put(&FrameInfo::new(1, seq), b"frame").expect("put");
    }
    assert_eq!(reader.join().expect("reader"), vec![1, 2, 3, 4, 5]);
}
