fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use dbfetch_protocol::constants::{HEALTH_SERVING, PING_ACK, WS_ERR_CODE_DUMP_FAILED};
    use dbfetch_protocol::{
        BackupStatus, FailureKind, GetBackupRequest, HealthResponse, Message, MessageType,
        PongResponse, encode_data_frame, parse_data_frame,
    };

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn read_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Parses a fixture envelope, re-serializes it and checks the JSON is
    /// unchanged (field order and whitespace aside).
    fn roundtrip_envelope(name: &str) -> Message {
        let text = read_fixture(name);
        let msg: Message = serde_json::from_str(&text)
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));

        let fixture: serde_json::Value = serde_json::from_str(&text).unwrap();
        let reserialized = serde_json::to_value(&msg)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  ours:    {reserialized}"
        );
        msg
    }

    fn payload<T: for<'de> serde::Deserialize<'de>>(msg: &Message) -> T {
        msg.parse_payload::<T>()
            .expect("payload should parse")
            .expect("payload should be present")
    }

    #[test]
    fn ping_and_pong() {
        let ping = roundtrip_envelope("ping.json");
        assert_eq!(ping.msg_type, MessageType::Ping);
        assert!(ping.payload.is_none());

        let pong = roundtrip_envelope("pong.json");
        assert_eq!(pong.msg_type, MessageType::Pong);
        assert_eq!(pong.id, ping.id);
        assert_eq!(payload::<PongResponse>(&pong).ack, PING_ACK);
    }

    #[test]
    fn health_and_response() {
        let health = roundtrip_envelope("health.json");
        assert_eq!(health.msg_type, MessageType::Health);

        let resp = roundtrip_envelope("health_response.json");
        assert_eq!(resp.msg_type, MessageType::HealthResponse);
        assert_eq!(payload::<HealthResponse>(&resp).status, HEALTH_SERVING);
    }

    #[test]
    fn get_backup_request() {
        let msg = roundtrip_envelope("get_backup.json");
        assert_eq!(msg.msg_type, MessageType::GetBackup);
        assert_eq!(
            payload::<GetBackupRequest>(&msg),
            GetBackupRequest {
                backup_id: "nightly".into()
            }
        );
    }

    #[test]
    fn get_backup_built_in_rust_matches_fixture() {
        let req = GetBackupRequest {
            backup_id: "nightly".into(),
        };
        let msg = Message::new(
            "9b2e4f6a-8c1d-4e3f-b5a7-2c9d0e1f3a4b",
            MessageType::GetBackup,
            Some(&req),
        )
        .unwrap();

        let ours = serde_json::to_value(&msg).unwrap();
        let fixture: serde_json::Value =
            serde_json::from_str(&read_fixture("get_backup.json")).unwrap();
        assert_eq!(ours, fixture);
    }

    #[test]
    fn backup_status_variants() {
        let start = payload::<BackupStatus>(&roundtrip_envelope("backup_status.json"));
        assert_eq!(start.progress, 0);
        assert_eq!(start.bytes, Some(3 * 1024 * 1024));
        assert!(start.sha256.is_none());

        let done = payload::<BackupStatus>(&roundtrip_envelope("backup_status_final.json"));
        assert!(done.is_complete());
        assert_eq!(done.bytes, Some(11));
        assert_eq!(done.sha256.as_deref().map(str::len), Some(64));

        let failed = payload::<BackupStatus>(&roundtrip_envelope("backup_status_failed.json"));
        assert!(failed.is_failure());
        assert!(failed.message.starts_with("Backup failed: "));
        assert!(failed.bytes.is_none());
    }

    #[test]
    fn stream_terminators() {
        let end = roundtrip_envelope("backup_end.json");
        assert_eq!(end.msg_type, MessageType::BackupEnd);
        assert!(end.payload.is_none() && end.error.is_none());

        let cancel = roundtrip_envelope("cancel_backup.json");
        assert_eq!(cancel.msg_type, MessageType::CancelBackup);
        assert_eq!(cancel.id, end.id);
    }

    #[test]
    fn error_envelope() {
        let msg = roundtrip_envelope("error.json");
        assert_eq!(msg.msg_type, MessageType::Error);
        let err = msg.error.expect("error body");
        assert_eq!(err.code, WS_ERR_CODE_DUMP_FAILED);
        assert_eq!(FailureKind::from_code(err.code), FailureKind::Subprocess);
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let msg: Message =
            serde_json::from_str(r#"{"id":"x","type":"list_backups","payload":{}}"#).unwrap();
        assert_eq!(msg.msg_type, MessageType::Unknown);
    }

    #[test]
    fn data_frame_layout() {
        let bytes = hex::decode(read_fixture("data_frame.hex").trim()).unwrap();

        let (header, data) = parse_data_frame(&bytes).unwrap();
        assert_eq!(header.id, "call-1");
        assert_eq!(data, b"hello world");

        let encoded = encode_data_frame("call-1", b"hello world").unwrap();
        assert_eq!(encoded, bytes);
    }
}
