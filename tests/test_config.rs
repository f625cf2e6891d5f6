// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Loading channel configuration from JSON.

use shmstream::{Backend, ChannelConfig, Role};

#[test]
fn minimal_json_takes_defaults() {
    let cfg: ChannelConfig =
        serde_json::from_str(r#"{ "name": "video", "identifier": "rtsp" }"#).expect("parse");
    assert_eq!(cfg, ChannelConfig::new("video", "rtsp"));
    assert_eq!(cfg.consumer_limit, ChannelConfig::DEFAULT_CONSUMER_LIMIT);
    assert_eq!(cfg.frame_capacity, ChannelConfig::DEFAULT_FRAME_CAPACITY);
    assert_eq!(cfg.payload_bytes, ChannelConfig::DEFAULT_PAYLOAD_BYTES);
    assert_eq!(cfg.role, Role::Consumer);
    assert_eq!(cfg.backend, Backend::ProcessLocalHeap);
}

#[test]
fn full_json() {
    let cfg: ChannelConfig = serde_json::from_str(
        r#"{
            "name": "audio",
            "identifier": "aenc",
            "consumer_limit": 2,
            "frame_capacity": 60,
            "payload_bytes": 65536,
            "role": "producer",
            "backend": "os_shared_memory"
        }"#,
    )
    .expect("parse");
    assert_eq!(
        cfg,
        ChannelConfig::producer("audio", "aenc")
            .with_consumer_limit(2)
            .with_frame_capacity(60)
            .with_payload_bytes(65536)
            .with_backend(Backend::OsSharedMemory)
    );
    cfg.validate().expect("valid");
}

#[test]
fn unknown_role_is_rejected() {
    let res: Result<ChannelConfig, _> =
        serde_json::from_str(r#"{ "name": "v", "identifier": "i", "role": "observer" }"#);
    assert!(res.is_err());
}

#[test]
fn enums_serialize_snake_case() {
    let json = serde_json::to_value(ChannelConfig::producer("video", "venc")).expect("json");
    assert_eq!(json["role"], "producer");
    assert_eq!(json["backend"], "process_local_heap");
}
