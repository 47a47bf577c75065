//! Integration tests for the HTTP surface:
//!
//! - Transport events pushed to `POST /transport/events` land in the store and
//!   are fanned out to live subscribers.
//! - `GET /chats` and `GET /messages/...` read back what was ingested,
//!   pre-resolved to renderable content.
//! - `GET /media/...` distinguishes missing media (404) from media that cannot
//!   be fetched (503).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt as _;
use serde_json::{json, Value};
use tower::ServiceExt as _;

use chatmirror::ingest::IngestCoordinator;
use chatmirror::media::{EncryptedMedia, MediaTransport};
use chatmirror::storage::{db_path, Storage};
use chatmirror::web_client::router::build_router;
use chatmirror::web_client::state::{AppState, SharedState, WsEvent};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Media transport that serves canned bytes and records every request.
#[derive(Default)]
struct FakeMedia {
    requests: Mutex<Vec<String>>,
    fail_upstream: bool,
}

impl MediaTransport for FakeMedia {
    fn download_encrypted(&self, media: &EncryptedMedia) -> Result<Vec<u8>, String> {
        self.requests
            .lock()
            .unwrap()
            .push(format!("direct:{}", media.direct_path.clone().unwrap_or_default()));
        Ok(b"\x89PNG fake image".to_vec())
    }

    fn fetch_upstream(&self, url: &str) -> Result<Vec<u8>, String> {
        self.requests.lock().unwrap().push(format!("proxy:{url}"));
        if self.fail_upstream {
            return Err("upstream returned 502".to_string());
        }
        Ok(b"RIFF webp".to_vec())
    }
}

struct TestServer {
    app: Router,
    state: SharedState,
    media: Arc<FakeMedia>,
    _dir: tempfile::TempDir,
}

fn test_server_with(media: FakeMedia) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(dir.path());
    let reader = Storage::open(&path).unwrap();
    let writer = Storage::open(&path).unwrap();
    let media = Arc::new(media);
    let coordinator = IngestCoordinator::new(writer, Duration::from_secs(120));
    let state = AppState::new(reader, coordinator, media.clone(), None).into_shared();
    TestServer {
        app: build_router(Arc::clone(&state)),
        state,
        media,
        _dir: dir,
    }
}

fn test_server() -> TestServer {
    test_server_with(FakeMedia::default())
}

impl TestServer {
    async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let (status, body) = self.get(uri).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_event(&self, event: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri("/transport/events")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(event.to_string()))
            .unwrap();
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }
}

fn wire(id: &str, conv: &str, ts: i64, message: Value) -> Value {
    json!({
        "key": { "remoteJid": conv, "id": id, "fromMe": false },
        "messageTimestamp": ts,
        "message": message,
    })
}

fn text(id: &str, conv: &str, ts: i64, body: &str) -> Value {
    wire(id, conv, ts, json!({ "conversation": body }))
}

fn live(messages: Vec<Value>) -> Value {
    json!({ "type": "messages.upsert", "messages": messages })
}

fn history(messages: Vec<Value>, is_final: bool) -> Value {
    json!({ "type": "messaging-history.set", "messages": messages, "contacts": [], "isFinal": is_final })
}

fn timestamps(page: &Value) -> Vec<i64> {
    page.as_array()
        .unwrap()
        .iter()
        .map(|m| m["timestamp"].as_i64().unwrap())
        .collect()
}

const ALICE: &str = "15550001@s.whatsapp.net";
const GROUP: &str = "120363001@g.us";
const CHANNEL: &str = "120363999@newsletter";

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn messages_page_counts_back_from_newest() {
    let server = test_server();
    let messages = [30, 10, 50, 20, 40]
        .iter()
        .map(|ts| text(&format!("m{ts}"), GROUP, *ts, "hi"))
        .collect();
    let (status, _) = server.post_event(live(messages)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, page) = server.get_json(&format!("/messages/{GROUP}/2/0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(timestamps(&page), vec![40, 50]);

    let (_, page) = server.get_json(&format!("/messages/{GROUP}/2/2")).await;
    assert_eq!(timestamps(&page), vec![20, 30]);
    assert_eq!(page[0]["content"], json!({ "type": "plain_text", "text": "hi" }));

    let (_, page) = server.get_json(&format!("/messages/{GROUP}/100000/0")).await;
    assert_eq!(page.as_array().unwrap().len(), 5);

    let (status, page) = server.get_json("/messages/nobody@g.us/10/0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page, json!([]));

    let (status, _) = server.get(&format!("/messages/{GROUP}/ten/0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chats_list_most_recent_first_with_contacts() {
    let server = test_server();
    server
        .post_event(live(vec![
            text("a1", ALICE, 100, "old"),
            text("g1", GROUP, 200, "new"),
        ]))
        .await;
    server
        .post_event(json!({
            "type": "contacts.upsert",
            "contacts": [{ "id": ALICE, "name": "Alice", "imgUrl": "https://pps/alice.jpg" }]
        }))
        .await;

    let (status, chats) = server.get_json("/chats").await;
    assert_eq!(status, StatusCode::OK);
    let chats = chats.as_array().unwrap();
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0]["conversation_id"], GROUP);
    assert_eq!(chats[0]["kind"], "group");
    assert_eq!(chats[1]["conversation_id"], ALICE);
    assert_eq!(chats[1]["display_name"], "Alice");
    assert_eq!(chats[1]["latest_message_id"], "a1");
    assert_eq!(chats[1]["message_count"], 1);

    let (_, contacts) = server.get_json("/contacts").await;
    assert_eq!(contacts[0]["avatar_url"], "https://pps/alice.jpg");
}

#[tokio::test]
async fn quoted_reply_is_resolved_from_history() {
    let server = test_server();
    server
        .post_event(live(vec![
            text("q1", ALICE, 10, "lunch?"),
            wire(
                "r1",
                ALICE,
                20,
                json!({ "extendedTextMessage": { "text": "yes", "contextInfo": { "stanzaId": "q1" } } }),
            ),
            wire("u1", ALICE, 30, json!({ "pollCreationMessage": { "name": "?" } })),
        ]))
        .await;

    let (_, page) = server.get_json(&format!("/messages/{ALICE}/1/1")).await;
    let content = &page[0]["content"];
    assert_eq!(content["type"], "plain_text");
    assert_eq!(content["text"], "yes");
    assert_eq!(content["quoted"]["message_id"], "q1");
    assert_eq!(content["quoted"]["content"]["text"], "lunch?");

    let (_, page) = server.get_json(&format!("/messages/{ALICE}/1/0")).await;
    assert_eq!(page[0]["content"]["type"], "unsupported");
    assert_eq!(page[0]["kind"], "pollCreationMessage");
    assert!(!page[0]["content"]["debug"].as_str().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_upsert_during_history_sync_is_dropped() {
    let server = test_server();
    let mut rx = {
        let st = server.state.lock().await;
        st.ws_tx.subscribe()
    };

    let (_, out) = server.post_event(history(vec![text("h1", ALICE, 1, "old")], false)).await;
    assert_eq!(out["messages"], 1);

    let (_, out) = server.post_event(live(vec![text("l1", ALICE, 50, "live")])).await;
    assert_eq!(out["dropped_live"], 1);
    assert_eq!(out["messages"], 0);

    let (_, health) = server.get_json("/health").await;
    assert_eq!(health["history_sync_in_progress"], true);
    assert_eq!(health["ingest"]["live_dropped"], 1);

    server.post_event(history(vec![], true)).await;
    let (_, out) = server.post_event(live(vec![text("l1", ALICE, 50, "live")])).await;
    assert_eq!(out["messages"], 1);

    let (_, page) = server.get_json(&format!("/messages/{ALICE}/10/0")).await;
    assert_eq!(timestamps(&page), vec![1, 50]);

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen[0], WsEvent::HistorySync { in_progress: true }));
    assert!(seen
        .iter()
        .any(|e| matches!(e, WsEvent::HistorySync { in_progress: false })));
    match seen.last().unwrap() {
        WsEvent::NewMessages {
            conversation_id,
            messages,
        } => {
            assert_eq!(conversation_id, ALICE);
            assert_eq!(messages[0]["message_id"], "l1");
        }
        other => panic!("unexpected last event {other:?}"),
    }
}

#[tokio::test]
async fn malformed_event_is_rejected() {
    let server = test_server();
    let (status, _) = server.post_event(json!({ "type": "presence.update" })).await;
    assert!(status.is_client_error());

    let (_, health) = server.get_json("/health").await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["messages"], 0);
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

#[tokio::test]
async fn media_status_codes() {
    let server = test_server_with(FakeMedia {
        fail_upstream: true,
        ..Default::default()
    });
    server
        .post_event(live(vec![
            wire(
                "img",
                ALICE,
                1,
                json!({ "imageMessage": {
                    "mimetype": "image/png", "mediaKey": "a2V5", "directPath": "/v/img"
                }}),
            ),
            wire("nokey", ALICE, 2, json!({ "imageMessage": { "directPath": "/v/x" } })),
            text("txt", ALICE, 3, "no media here"),
            wire("chan", CHANNEL, 4, json!({ "stickerMessage": { "directPath": "/v/s.webp" } })),
        ]))
        .await;

    let req = Request::builder()
        .uri(format!("/media/{ALICE}/img"))
        .body(Body::empty())
        .unwrap();
    let resp = server.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
    let etag = resp.headers()[header::ETAG].to_str().unwrap().to_string();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"\x89PNG fake image");

    let req = Request::builder()
        .uri(format!("/media/{ALICE}/img"))
        .header(header::IF_NONE_MATCH, &etag)
        .body(Body::empty())
        .unwrap();
    let resp = server.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

    let (status, _) = server.get(&format!("/media/{ALICE}/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = server.get(&format!("/media/{ALICE}/txt")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = server.get(&format!("/media/{GROUP}/img")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = server.get_json(&format!("/media/{ALICE}/nokey")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "media unavailable");

    let (status, body) = server.get_json(&format!("/media/{CHANNEL}/chan")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "media unavailable");

    let requests = server.media.requests.lock().unwrap().clone();
    assert_eq!(
        requests,
        vec![
            "direct:/v/img".to_string(),
            "direct:/v/img".to_string(),
            "proxy:https://mmg.whatsapp.net/v/s.webp".to_string(),
        ]
    );
}

#[tokio::test]
async fn messages_carry_media_urls() {
    let server = test_server();
    server
        .post_event(live(vec![wire(
            "v1",
            GROUP,
            1,
            json!({ "viewOnceMessageV2": { "message": { "videoMessage": {
                "caption": "once", "mediaKey": "a2V5", "directPath": "/v/vid"
            }}}}),
        )]))
        .await;

    let (_, page) = server.get_json(&format!("/messages/{GROUP}/10/0")).await;
    let msg = &page[0];
    assert_eq!(msg["kind"], "viewOnceMessageV2");
    assert_eq!(msg["content"]["type"], "video");
    assert_eq!(msg["content"]["caption"], "once");
    assert_eq!(msg["content"]["locator"]["strategy"], "direct");
    assert_eq!(msg["media_url"], format!("/media/{GROUP}/v1"));
}
