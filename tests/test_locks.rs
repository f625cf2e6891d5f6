// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// SpinLock and RwLock, the in-segment locks.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shmstream::{RwLock, SpinLock};

// ========== SpinLock ==========

#[test]
fn spin_guard_releases_on_drop() {
    let lock = SpinLock::new();
    for _ in 0..100 {
        let _g = lock.lock();
        assert!(lock.is_locked());
    }
    assert!(!lock.is_locked());
}

#[test]
fn spin_try_lock_fails_while_held() {
    let lock = SpinLock::new();
    let g = lock.lock();
    assert!(lock.try_lock().is_none());
    drop(g);
    assert!(lock.try_lock().is_some());
}

#[test]
fn spin_lock_mutual_exclusion() {
    let lock = Arc::new(SpinLock::new());
    let in_cs = Arc::new(AtomicBool::new(false));
    let violation = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let (lock, in_cs, violation) =
                (Arc::clone(&lock), Arc::clone(&in_cs), Arc::clone(&violation));
            thread::spawn(move || {
                for _ in 0..200 {
                    let _g = lock.lock();
                    if in_cs.swap(true, Ordering::SeqCst) {
                        violation.store(true, Ordering::SeqCst);
                    }
                    thread::yield_now();
                    in_cs.store(false, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(!violation.load(Ordering::SeqCst));
}

// ========== RwLock ==========

#[test]
fn rw_readers_share() {
    let lock = RwLock::new();
    let a = lock.read();
    let b = lock.read();
    assert_eq!(lock.readers(), 2);
    drop(a);
    drop(b);
    assert_eq!(lock.readers(), 0);
}

#[test]
fn rw_writer_flag_clears_on_drop() {
    let lock = RwLock::new();
    {
        let _w = lock.write();
        assert!(lock.is_write_locked());
    }
    assert!(!lock.is_write_locked());
    let _r = lock.read();
}

#[test]
fn rw_writer_waits_for_readers() {
    let lock = Arc::new(RwLock::new());
    let reading = lock.read();
    let wrote = Arc::new(AtomicBool::new(false));

    let (l, w) = (Arc::clone(&lock), Arc::clone(&wrote));
    let writer = thread::spawn(move || {
        let _g = l.write();
        w.store(true, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(50));
    assert!(!wrote.load(Ordering::SeqCst));
    drop(reading);
    writer.join().unwrap();
    assert!(wrote.load(Ordering::SeqCst));
}

#[test]
fn rw_write_lock_protection() {
    let lock = Arc::new(RwLock::new());
    let data = Arc::new(AtomicI32::new(0));
    let iterations = 500;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let (lock, data) = (Arc::clone(&lock), Arc::clone(&data));
            thread::spawn(move || {
                for _ in 0..iterations {
                    let _g = lock.write();
                    // Non-atomic read-modify-write under the lock.
                    let v = data.load(Ordering::Relaxed);
                    data.store(v + 1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(data.load(Ordering::Relaxed), iterations * 4);
}

#[test]
fn rw_lock_is_valid_when_zeroed() {
    let lock: RwLock = unsafe { std::mem::zeroed() };
    let _g = lock.write();
    assert!(lock.is_write_locked());
}
