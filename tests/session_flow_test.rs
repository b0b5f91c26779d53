//! Session lifecycle integration tests
//!
//! Sliding-window eviction, stop semantics, FIFO reconciliation with the
//! upstream index, and the logout flush.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use sluice::bus::{Bus, InProcessBus};
use sluice::catalog::SessionSource;
use sluice::config::OrchestratorConfig;
use sluice::state::OrchestratorState;
use sluice::stream::{start_chat, stop_chat, sync_session_index, ChatParams, StopReason};
use sluice::upstream::ChatFlags;

/// Mock upstream whose `/stop` hangs, for stop-despite-upstream-timeout
/// coverage. `/session_name` publishes the canned index payload.
#[derive(Clone)]
struct MockUpstream {
    bus: Arc<InProcessBus>,
    index_payload: Option<Value>,
    stop_delay: Duration,
}

async fn spawn_mock_upstream(mock: MockUpstream) -> String {
    let app = Router::new()
        .route(
            "/chat",
            post(|| async { Json(json!({ "is_complete": false, "content": "" })) }),
        )
        .route(
            "/stop",
            post(|State(mock): State<MockUpstream>| async move {
                tokio::time::sleep(mock.stop_delay).await;
                Json(json!({ "ok": true }))
            }),
        )
        .route(
            "/session_name",
            post(|State(mock): State<MockUpstream>| async move {
                if let Some(payload) = mock.index_payload.clone() {
                    let _ = mock.bus.publish("session_index", payload).await;
                }
                Json(json!({ "ok": true }))
            }),
        )
        .with_state(mock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn make_state(
    bus: Arc<InProcessBus>,
    index_payload: Option<Value>,
    stop_delay: Duration,
) -> Arc<OrchestratorState> {
    let upstream_url = spawn_mock_upstream(MockUpstream {
        bus: bus.clone(),
        index_payload,
        stop_delay,
    })
    .await;

    let mut config = OrchestratorConfig::default();
    config.upstream_url = upstream_url;
    config.timeouts.quiescence_pending_ms = 10_000;

    let state = Arc::new(OrchestratorState::new(config, bus).expect("state builds"));
    state.wire_flush();
    state.registry.bind_user("u1", "tok", 4, vec![]);
    state.catalog.seed_cursor("u1", 4);
    state
}

fn params(session_id: &str, chat_id: &str) -> ChatParams {
    ChatParams {
        user_id: "u1".to_string(),
        session_id: session_id.to_string(),
        chat_id: chat_id.to_string(),
        instance_id: None,
        model_id: "llama3".to_string(),
        prompt: "hi".to_string(),
        flags: ChatFlags::default(),
        temp_file_paths: vec![],
    }
}

#[tokio::test]
async fn test_sliding_window_eviction_drops_transcript() {
    let bus = Arc::new(InProcessBus::new());
    let state = make_state(bus, None, Duration::ZERO).await;

    // Fill the window: sessions "5".."14" with a transcript each.
    for id in 5..=14 {
        let sid = id.to_string();
        state.catalog.upsert_for_chat("u1", &sid, "1");
        state
            .transcripts
            .append_user_prompt("u1", &sid, "1", "hello", None);
    }
    assert_eq!(state.catalog.count("u1"), 10);

    let (entry, outcome) = state.catalog.mint_session("u1");
    assert_eq!(entry.id, "15");
    let evicted = outcome.evicted.expect("oldest session evicted");
    assert_eq!(evicted.id, "5");
    state.transcripts.drop_session("u1", &evicted.id);

    assert_eq!(state.catalog.count("u1"), 10);
    assert!(!state.transcripts.has_transcript("u1", "5"));
    assert!(state.transcripts.has_transcript("u1", "14"));
}

#[tokio::test]
async fn test_stop_despite_upstream_hang() {
    let bus = Arc::new(InProcessBus::new());
    // Upstream /stop stalls far longer than the test runs.
    let state = make_state(bus.clone(), None, Duration::from_secs(60)).await;

    let _rx = start_chat(state.clone(), params("19", "1"))
        .await
        .expect("chat admitted");
    bus.publish("chat", json!({ "type": "token", "data": "partial", "chat_id": "1" }))
        .await
        .expect("publish token");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Watch the room like a client.
    let (room_tx, mut room_rx) = mpsc::unbounded_channel();
    state.rooms.join("chat_u1_19_1", "conn1", room_tx);

    let started = Instant::now();
    let outcome = stop_chat(&state, "u1", "19", Some("1"), None, StopReason::TimeoutStopped).await;
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "local cleanup must not wait on upstream"
    );

    assert!(outcome.cleanup_completed);
    assert!(outcome.consumer_cancelled);
    assert!(outcome.messages_scrubbed >= 2, "user + assistant scrubbed");

    // No incomplete message survives the stop.
    let remaining = state.transcripts.history("u1", "19");
    assert!(
        remaining.iter().all(|m| m.is_complete),
        "incomplete tail scrubbed: {remaining:?}"
    );

    let mut room_events = Vec::new();
    while let Ok(raw) = room_rx.try_recv() {
        room_events.push(serde_json::from_str::<Value>(&raw).expect("JSON"));
    }
    let complete = room_events
        .iter()
        .find(|e| e["type"] == "complete")
        .expect("room got the terminal event");
    assert_eq!(complete["completion_type"], "timeout_stopped");
    assert!(
        room_events.iter().any(|e| e["type"] == "cleanup-generation"),
        "room got the cleanup hint"
    );

    assert_eq!(state.active_stream_count(), 0);
    assert_eq!(state.consumers.active_count(), 0);
}

#[tokio::test]
async fn test_fifo_reconciliation_upstream_title_wins() {
    let bus = Arc::new(InProcessBus::new());
    let index = json!([[15, "Debugging crash"], [14, "Bug triage"], [13, "Refactor plan"]]);
    let state = make_state(bus, Some(index), Duration::ZERO).await;

    // Local catalog: 15 local-only, 14 already named by upstream.
    state.catalog.upsert_for_chat("u1", "15", "1");
    state.catalog.upsert_for_chat("u1", "14", "1");
    state.catalog.set_title_from_upstream("u1", "14", "Bug triage");

    let merged = sync_session_index(&state, "u1").await.expect("sync runs");

    let ids: Vec<&str> = merged.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["15", "14", "13"], "sorted by id descending");
    assert_eq!(merged[0].title, "Debugging crash", "upstream title wins");
    assert_eq!(merged[2].title, "Refactor plan");

    // The detached apply lands shortly after the response.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let entry = state.catalog.get("u1", "15").expect("still cataloged");
    assert_eq!(entry.title, "Debugging crash");
    assert_eq!(entry.source, SessionSource::LocalUpdatedFromUpstream);
    let inserted = state.catalog.get("u1", "13").expect("new entry inserted");
    assert_eq!(inserted.source, SessionSource::Upstream);
}

#[tokio::test]
async fn test_sync_without_payload_serves_local_catalog() {
    let bus = Arc::new(InProcessBus::new());
    // Upstream acknowledges but never publishes an index payload.
    let upstream_url = spawn_mock_upstream(MockUpstream {
        bus: bus.clone(),
        index_payload: None,
        stop_delay: Duration::ZERO,
    })
    .await;

    let mut config = OrchestratorConfig::default();
    config.upstream_url = upstream_url;
    config.timeouts.upstream_metadata_ms = 300;

    let state = Arc::new(OrchestratorState::new(config, bus).expect("state builds"));
    state.wire_flush();
    state.registry.bind_user("u1", "tok", 0, vec![]);
    state.catalog.upsert_for_chat("u1", "3", "1");

    let merged = sync_session_index(&state, "u1").await.expect("sync runs");
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].id, "3");
}

#[tokio::test]
async fn test_logout_flush_leaves_nothing_behind() {
    let bus = Arc::new(InProcessBus::new());
    let state = make_state(bus.clone(), None, Duration::ZERO).await;

    let _rx = start_chat(state.clone(), params("19", "1"))
        .await
        .expect("chat admitted");
    bus.publish("chat", json!({ "type": "token", "data": "x", "chat_id": "1" }))
        .await
        .expect("publish token");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(state.registry.current_user().is_some());
    assert!(state.catalog.count("u1") > 0);
    assert!(state.transcripts.has_transcript("u1", "19"));
    assert!(state.consumers.active_count() > 0);

    state.registry.flush_all();

    assert!(state.registry.current_user().is_none());
    assert_eq!(state.catalog.count("u1"), 0);
    assert!(state.transcripts.is_empty());
    assert_eq!(state.active_stream_count(), 0);
    assert_eq!(state.consumers.active_count(), 0);
    assert_eq!(state.rooms.room_count(), 0);

    // Residual lookups find nothing for the logged-out user.
    assert!(state.catalog.get("u1", "19").is_none());
    assert_eq!(state.transcripts.prompt_count("u1", "19"), 0);
}

#[tokio::test]
async fn test_second_submission_takes_over_slot() {
    let bus = Arc::new(InProcessBus::new());
    let state = make_state(bus.clone(), None, Duration::ZERO).await;

    let _rx1 = start_chat(state.clone(), params("19", "1"))
        .await
        .expect("first chat admitted");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let _rx2 = start_chat(state.clone(), params("19", "2"))
        .await
        .expect("second chat admitted");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Only one consumer holds the (user, session) slot.
    assert_eq!(state.consumers.active_count(), 1);
    let active = state.active_stream("u1", "19").expect("slot occupied");
    assert_eq!(active.chat_id, "2");
}
