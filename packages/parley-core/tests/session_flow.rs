//! End-to-end session pipeline over the chunked file store.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_core::events::EventName;
use parley_core::storage::recovery::{parse_collection, Parsed};
use parley_core::storage::{FileStore, RecordStore};
use parley_core::{LimiterConfig, ProtocolEvent, Session, SessionConfig};
use serde_json::{json, Value};

fn config(dir: &tempfile::TempDir) -> SessionConfig {
    SessionConfig {
        data_dir: dir.path().to_path_buf(),
        chunk_records: 10,
        ..SessionConfig::default()
    }
}

fn capture(session: &Session) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    session.on(EventName::Messages, move |event| {
        sink.lock().push(serde_json::to_value(event).unwrap()["data"].clone());
    });
    seen
}

fn upsert(messages: Value) -> ProtocolEvent {
    serde_json::from_value(json!({
        "event": "messages.upsert",
        "data": {"type": "notify", "messages": messages}
    }))
    .unwrap()
}

#[tokio::test]
async fn test_group_message_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::open(config(&dir)).await.unwrap();
    let seen = capture(&session);

    session
        .handle(upsert(json!([{
            "key": {"id": "A1", "remoteJid": "123@g.us", "fromMe": false, "participant": "99@s.whatsapp.net"},
            "message": {"conversation": "hello @99"}
        }])))
        .await
        .unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    let ctx = &seen[0];
    assert_eq!(ctx["chatId"], "A1");
    assert_eq!(ctx["isGroup"], true);
    assert_eq!(ctx["text"], "hello @99");
    assert_eq!(ctx["mentions"], json!(["99"]));
    assert_eq!(ctx["chatType"], "text");
    assert_eq!(ctx["isSpam"], false);
    assert_eq!(ctx["uniqueId"], "123-99-A1");

    session.shutdown().await.unwrap();
    assert!(dir.path().join("main/auth.json").exists());
    assert!(dir.path().join("main/stores/messages-0.json").exists());
}

#[tokio::test]
async fn test_edit_then_reply_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let session = Session::open(config(&dir)).await.unwrap();
        session
            .handle(upsert(json!([{
                "key": {"id": "IMG", "remoteJid": "7@s.whatsapp.net"},
                "message": {"imageMessage": {"caption": "before", "mediaKey": "KEY", "mimetype": "image/jpeg"}}
            }])))
            .await
            .unwrap();
        session.shutdown().await.unwrap();
    }

    let session = Session::open(config(&dir)).await.unwrap();
    let seen = capture(&session);

    session
        .handle(upsert(json!([{
            "key": {"id": "EDIT", "remoteJid": "7@s.whatsapp.net"},
            "message": {"protocolMessage": {
                "key": {"id": "IMG"}, "type": 14,
                "editedMessage": {"imageMessage": {"caption": "after"}}
            }}
        }])))
        .await
        .unwrap();
    session
        .handle(upsert(json!([{
            "key": {"id": "REPLY", "remoteJid": "7@s.whatsapp.net"},
            "message": {"extendedTextMessage": {"text": "nice", "contextInfo": {"stanzaId": "IMG"}}}
        }])))
        .await
        .unwrap();

    let seen = seen.lock();
    assert_eq!(seen[0]["isEdited"], true);
    assert_eq!(seen[0]["text"], "after");
    assert_eq!(seen[0]["media"]["mimetype"], "image/jpeg");
    assert!(seen[0]["media"].get("mediaKey").is_none());

    assert_eq!(seen[1]["replied"]["chatId"], "IMG");
    assert_eq!(seen[1]["replied"]["text"], "after");
    assert!(seen[1]["replied"]["replied"].is_null());

    let stored = session
        .archive()
        .store()
        .read("messages", "IMG")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored["message"]["imageMessage"]["mediaKey"], "KEY");
    assert_eq!(stored["message"]["imageMessage"]["caption"], "after");
}

#[tokio::test]
async fn test_self_reply_resolves_one_level() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::open(config(&dir)).await.unwrap();
    let seen = capture(&session);

    let looping = json!({
        "key": {"id": "LOOP", "remoteJid": "8@s.whatsapp.net"},
        "message": {"extendedTextMessage": {"text": "me", "contextInfo": {"stanzaId": "LOOP"}}}
    });
    session.handle(upsert(json!([looping.clone()]))).await.unwrap();
    session.handle(upsert(json!([looping]))).await.unwrap();

    for ctx in seen.lock().iter() {
        assert_eq!(ctx["replied"]["chatId"], "LOOP");
        assert!(ctx["replied"]["replied"].is_null());
    }
}

#[tokio::test]
async fn test_rate_limit_flags_spam() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::open(SessionConfig {
        limiter: LimiterConfig {
            max_messages: 5,
            window: Duration::from_secs(10),
        },
        ..config(&dir)
    })
    .await
    .unwrap();
    let seen = capture(&session);

    for i in 0..6 {
        session
            .handle(upsert(json!([{
                "key": {"id": format!("S{}", i), "remoteJid": "555@g.us", "participant": "1@s.whatsapp.net"},
                "message": {"conversation": "spam"}
            }])))
            .await
            .unwrap();
    }

    let spam: Vec<bool> = seen.lock().iter().map(|c| c["isSpam"].as_bool().unwrap()).collect();
    assert_eq!(spam, vec![false, false, false, false, false, true]);
}

#[tokio::test]
async fn test_archive_spans_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::open(config(&dir)).await.unwrap();

    let messages: Vec<Value> = (0..25)
        .map(|i| {
            json!({
                "key": {"id": format!("H{:02}", i), "remoteJid": "9@s.whatsapp.net"},
                "message": {"conversation": format!("history {}", i)}
            })
        })
        .collect();
    session
        .handle(serde_json::from_value(json!({
            "event": "messaging-history.set",
            "data": {"messages": messages, "chats": [{"id": "9@s.whatsapp.net", "name": "Nine"}]}
        }))
        .unwrap())
        .await
        .unwrap();
    session.shutdown().await.unwrap();

    let store = FileStore::new(dir.path().join("main")).with_chunk_limits(10, usize::MAX);
    assert_eq!(store.list("messages").await.unwrap().len(), 25);
    assert_eq!(store.chunk_metadata("messages").await.unwrap().total_chunks, 3);
    assert!(store.read("chats", "9@s.whatsapp.net").await.unwrap().is_some());
}

#[tokio::test]
async fn test_corrupt_archive_does_not_break_session() {
    let dir = tempfile::tempdir().unwrap();
    let stores = dir.path().join("main/stores");
    std::fs::create_dir_all(&stores).unwrap();
    std::fs::write(stores.join("chats-0.json"), "{\"id\":\"a\",\"value\":{}}{\"id\":\"b\",\"value\":{}}").unwrap();
    std::fs::write(stores.join("messages-0.json"), "\u{0}\u{1}garbage").unwrap();

    let session = Session::open(config(&dir)).await.unwrap();
    let seen = capture(&session);
    session
        .handle(upsert(json!([{
            "key": {"id": "OK", "remoteJid": "1@s.whatsapp.net"},
            "message": {"conversation": "still works"}
        }])))
        .await
        .unwrap();

    assert_eq!(seen.lock().len(), 1);
    assert_eq!(session.archive().store().list("chats").await.unwrap().len(), 2);
    let quarantined = std::fs::read_dir(&stores)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_name().to_string_lossy().starts_with("messages-0.json.corrupt."));
    assert!(quarantined);
}

#[test]
fn test_concatenated_objects_recover() {
    match parse_collection("{\"id\":\"a\",\"value\":1}{\"id\":\"b\",\"value\":2}") {
        Parsed::Records(records, _) => assert_eq!(records.len(), 2),
        Parsed::Unrecoverable => panic!("expected recovery"),
    }
}
