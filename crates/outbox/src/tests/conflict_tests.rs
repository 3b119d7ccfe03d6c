use chrono::TimeZone;
use shared::domain::{ChannelId, ClientOperationId, MessageStatus};

use super::*;

fn at(seconds: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, seconds).unwrap()
}

fn local_edit(text: &str, sent_at: DateTime<Utc>) -> LocalMessage {
    LocalMessage {
        client_message_id: ClientOperationId::from("op-1"),
        server_message_id: Some(MessageId::from("m1")),
        channel_id: ChannelId::from("c1"),
        text: text.into(),
        attachments: Vec::new(),
        status: MessageStatus::Sending,
        created_at: at(0),
        sent_at: Some(sent_at),
    }
}

fn conflict(server_text: &str, updated_at: DateTime<Utc>, version: Option<u64>) -> EditConflict {
    EditConflict {
        message_id: MessageId::from("m1"),
        server_text: server_text.into(),
        server_updated_at: updated_at,
        server_version: version,
    }
}

fn baseline(version: u64) -> ServerVersion {
    ServerVersion {
        message_id: MessageId::from("m1"),
        text: "original".into(),
        updated_at: at(1),
        version,
    }
}

fn remote(id: &str, text: &str, updated_at: Option<DateTime<Utc>>) -> RemoteMessage {
    RemoteMessage {
        id: MessageId::from(id),
        client_operation_id: None,
        text: text.into(),
        updated_at,
        created_at: Some(at(0)),
        version: None,
    }
}

#[test]
fn missing_message_is_not_a_conflict() {
    let window = vec![remote("m2", "other", None)];
    assert_eq!(find_conflict(&window, &MessageId::from("m1"), "hello"), None);
}

#[test]
fn identical_text_is_not_a_conflict() {
    let window = vec![remote("m1", "hello", Some(at(20)))];
    assert_eq!(find_conflict(&window, &MessageId::from("m1"), "hello"), None);
}

#[test]
fn differing_text_reports_server_state() {
    let window = vec![remote("m1", "hola", Some(at(20)))];
    let found = find_conflict(&window, &MessageId::from("m1"), "hello").expect("conflict");
    assert_eq!(found.server_text, "hola");
    assert_eq!(found.server_updated_at, at(20));
}

#[test]
fn conflict_timestamp_falls_back_to_created_at() {
    let window = vec![remote("m1", "hola", None)];
    let found = find_conflict(&window, &MessageId::from("m1"), "hello").expect("conflict");
    assert_eq!(found.server_updated_at, at(0));
}

#[test]
fn last_write_wins_prefers_newer_server_edit() {
    let resolution = decide(
        ConflictStrategy::LastWriteWins,
        &local_edit("hello", at(10)),
        None,
        &conflict("hola", at(20), None),
    );
    assert_eq!(resolution, Resolution::AcceptServer);
}

#[test]
fn last_write_wins_keeps_newer_local_edit() {
    let resolution = decide(
        ConflictStrategy::LastWriteWins,
        &local_edit("hello", at(10)),
        None,
        &conflict("hola", at(5), None),
    );
    assert_eq!(resolution, Resolution::KeepLocal);
}

#[test]
fn higher_server_version_wins_despite_older_clock() {
    let resolution = decide(
        ConflictStrategy::LastWriteWins,
        &local_edit("hello", at(30)),
        Some(&baseline(2)),
        &conflict("hola", at(5), Some(3)),
    );
    assert_eq!(resolution, Resolution::AcceptServer);
}

#[test]
fn stale_server_version_loses_despite_newer_clock() {
    let resolution = decide(
        ConflictStrategy::LastWriteWins,
        &local_edit("hello", at(10)),
        Some(&baseline(4)),
        &conflict("hola", at(50), Some(3)),
    );
    assert_eq!(resolution, Resolution::KeepLocal);
}

#[test]
fn equal_versions_fall_back_to_timestamps() {
    let resolution = decide(
        ConflictStrategy::LastWriteWins,
        &local_edit("hello", at(10)),
        Some(&baseline(3)),
        &conflict("hola", at(20), Some(3)),
    );
    assert_eq!(resolution, Resolution::AcceptServer);
}

#[test]
fn fixed_strategies_ignore_timestamps() {
    let local = local_edit("hello", at(10));
    let older = conflict("hola", at(1), None);
    let newer = conflict("hola", at(59), None);
    assert_eq!(
        decide(ConflictStrategy::ServerWins, &local, None, &older),
        Resolution::AcceptServer
    );
    assert_eq!(
        decide(ConflictStrategy::LocalWins, &local, None, &newer),
        Resolution::KeepLocal
    );
}

#[test]
fn parses_strategy_names() {
    assert_eq!(
        "last_write_wins".parse::<ConflictStrategy>(),
        Ok(ConflictStrategy::LastWriteWins)
    );
    assert_eq!(
        "Server-Wins".parse::<ConflictStrategy>(),
        Ok(ConflictStrategy::ServerWins)
    );
    assert!("newest".parse::<ConflictStrategy>().is_err());
    assert_eq!(ConflictStrategy::default(), ConflictStrategy::LastWriteWins);
}

#[test]
fn strategy_serializes_as_kebab_case() {
    assert_eq!(
        serde_json::to_string(&ConflictStrategy::LastWriteWins).expect("json"),
        "\"last-write-wins\""
    );
    let parsed: ConflictStrategy = serde_json::from_str("\"local-wins\"").expect("json");
    assert_eq!(parsed, ConflictStrategy::LocalWins);
}
