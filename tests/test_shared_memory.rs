// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Channels over POSIX shared memory.
//
// Each `SegmentRegistry` maps a segment on its own, so two registries in one
// test process see the channel the way two processes would: separate
// mappings of one shm object, coordinated only through the segment itself.

#![cfg(unix)]

use std::ffi::CString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shmstream::{
    Backend, ChannelConfig, Consumer, FrameInfo, Producer, Role, SegmentRegistry, ShmHandle,
    StreamError,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(tag: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("test_shm_chan_{tag}_{n}_{}", std::process::id())
}

fn config(name: &str) -> ChannelConfig {
    ChannelConfig::new(name, "unused")
        .with_frame_capacity(4)
        .with_payload_bytes(16 << 10)
        .with_backend(Backend::OsSharedMemory)
}

fn producer(reg: &Arc<SegmentRegistry>, cfg: &ChannelConfig) -> Producer {
    Producer::attach(reg, &cfg.clone().with_identifier("venc").with_role(Role::Producer))
        .expect("producer")
}

fn consumer(reg: &Arc<SegmentRegistry>, cfg: &ChannelConfig, id: &str) -> Consumer {
    Consumer::attach(reg, &cfg.clone().with_identifier(id)).expect("consumer")
}

#[test]
fn frames_cross_separate_mappings() {
    let name = unique_name("cross");
    let cfg = config(&name);
    let proc_a = Arc::new(SegmentRegistry::new());
    let proc_b = Arc::new(SegmentRegistry::new());

    let mut tx = producer(&proc_a, &cfg);
    let rx = consumer(&proc_b, &cfg, "rtsp");
    assert_eq!(tx.readers(), 1);
    assert!(proc_a.is_attached(&name, "rtsp"));

    for seq in 1..=3u64 {
        let payload = vec![seq as u8; 1000 * seq as usize];
        tx.put(&FrameInfo::new(2, seq).with_dimensions(640, 360), &payload)
            .expect("put");
    }
    for seq in 1..=3u64 {
        let f = rx.get().expect("frame");
        assert_eq!(f.info.seq, seq);
        assert_eq!(f.info.width, 640);
        assert_eq!(f.len(), 1000 * seq as usize);
        assert!(f.data.iter().all(|&b| b == seq as u8));
    }
    assert!(rx.get().is_none());
}

#[test]
fn slots_are_shared_between_mappings() {
    let name = unique_name("slots");
    let cfg = config(&name).with_consumer_limit(1);
    let proc_a = Arc::new(SegmentRegistry::new());
    let proc_b = Arc::new(SegmentRegistry::new());

    let _rx = consumer(&proc_a, &cfg, "rtsp");
    let err = Consumer::attach(&proc_b, &cfg.clone().with_identifier("record"))
        .expect_err("slot taken in the other mapping");
    assert!(matches!(err, StreamError::AttachFull { limit: 1, .. }));

    // Same identifier from the other mapping shares the slot.
    let again = consumer(&proc_b, &cfg, "rtsp");
    assert_eq!(again.slot(), 1);
    assert_eq!(again.readers(), 1);
}

#[test]
fn other_geometry_is_a_layout_mismatch() {
    let name = unique_name("geometry");
    let proc_a = Arc::new(SegmentRegistry::new());
    let proc_b = Arc::new(SegmentRegistry::new());

    let _tx = producer(&proc_a, &config(&name));
    let err = Consumer::attach(
        &proc_b,
        &config(&name).with_frame_capacity(8).with_identifier("rtsp"),
    )
    .expect_err("mismatch");
    assert!(matches!(err, StreamError::LayoutMismatch { .. }));
    assert!(!proc_b.contains(&name));
}

#[test]
fn backend_must_match_within_a_registry() {
    let name = unique_name("backend");
    let reg = Arc::new(SegmentRegistry::new());

    let _rx = consumer(&reg, &config(&name), "rtsp");
    let err = Consumer::attach(
        &reg,
        &config(&name)
            .with_backend(Backend::ProcessLocalHeap)
            .with_identifier("record"),
    )
    .expect_err("mismatch");
    assert!(matches!(err, StreamError::LayoutMismatch { .. }));
}

#[test]
fn last_mapping_removes_the_segment() {
    let name = unique_name("teardown");
    let cfg = config(&name);
    let shm_name = shmstream::shm_name::segment_name(&name);
    {
        let proc_a = Arc::new(SegmentRegistry::new());
        let proc_b = Arc::new(SegmentRegistry::new());
        let mut tx = producer(&proc_a, &cfg);
        let _rx = consumer(&proc_b, &cfg, "rtsp");
        tx.put(&FrameInfo::new(1, 1), b"x").expect("put");

        let peek = ShmHandle::acquire(
            &shm_name,
            cfg.segment_size().expect("size"),
            shmstream::ShmOpenMode::Open,
        )
        .expect("segment exists while attached");
        assert_eq!(peek.ref_count(), 3);
    }

    let reopened = Arc::new(SegmentRegistry::new());
    let tx = producer(&reopened, &cfg);
    assert_eq!(tx.stats().produced, 0, "a fresh segment was created");
}

#[test]
fn blocked_consumer_wakes_across_mappings() {
    let name = unique_name("wake");
    let cfg = config(&name);
    let proc_a = Arc::new(SegmentRegistry::new());
    let proc_b = Arc::new(SegmentRegistry::new());

    let mut tx = producer(&proc_a, &cfg);
    let rx = consumer(&proc_b, &cfg, "rtsp");

    let reader = thread::spawn(move || {
        let mut got = Vec::new();
        while got.len() < 3 {
            match rx.wait_get(Some(5000)).expect("wait") {
                Some(f) => got.push(f.info.seq),
                None => break,
            }
        }
        got
    });

    for seq in 1..=3 {
        thread::sleep(Duration::from_millis(30));
        tx.put(&FrameInfo::new(1, seq), b"frame").expect("put");
    }
    assert_eq!(reader.join().expect("reader"), vec![1, 2, 3]);
}

#[test]
fn attach_waits_while_the_creator_sizes_the_segment() {
    let name = unique_name("unsized");
    let cfg = config(&name);
    let posix = shmstream::shm_name::make_shm_name(&shmstream::shm_name::segment_name(&name));
    let c_name = CString::new(posix).expect("name");

    // A creator that has opened the name but not truncated it yet.
    let flags = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o666 as libc::c_uint) };
    assert!(fd >= 0);
    // Mapped size: segment rounded up to 8 bytes plus the 4-byte reference counter.
    let total = cfg.segment_size().expect("size").div_ceil(8) * 8 + 4;
    let creator = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let ret = unsafe { libc::ftruncate(fd, total as libc::off_t) };
        unsafe { libc::close(fd) };
        ret
    });

    let reg = Arc::new(SegmentRegistry::new());
    let rx = consumer(&reg, &cfg, "rtsp");
    assert_eq!(creator.join().expect("creator"), 0);
    assert_eq!(rx.readers(), 1);
}
