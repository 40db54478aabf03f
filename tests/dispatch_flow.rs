// Inbound dispatch against a loopback AI backend: filtering, reply
// delivery, typing lifecycle, developer fallback and queue saturation.
mod common;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use common::{build_gateway, wait_until, TestGateway, DEVELOPER_JID};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wa_gateway::client::sim::{SentItem, SimHandle};
use wa_gateway::client::InboundMessage;
use wa_gateway::error::{code_of, ErrorCode};

struct MockAi {
    calls: AtomicUsize,
    last_payload: Mutex<Option<Value>>,
    last_auth: Mutex<Option<String>>,
}

async fn execute(
    State(state): State<Arc<MockAi>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    *state.last_payload.lock() = Some(payload);
    *state.last_auth.lock() = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());
    if agent_id.starts_with("fail") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "backend exploded").into_response();
    }
    Json(json!({ "result": { "reply": "pong" } })).into_response()
}

async fn start_mock_ai() -> (Arc<MockAi>, String) {
    let state = Arc::new(MockAi {
        calls: AtomicUsize::new(0),
        last_payload: Mutex::new(None),
        last_auth: Mutex::new(None),
    });
    let app = Router::new()
        .route("/agents/{agent_id}/execute", post(execute))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, format!("http://{addr}"))
}

async fn connected_agent(gw: &TestGateway, agent_id: &str, bot_jid: &str) -> SimHandle {
    gw.supervisor
        .create_or_resume(1, agent_id, "Dispatch Agent", Some("k1"))
        .await
        .unwrap();
    let handle = gw.factory.handle(agent_id).unwrap();
    handle.emit_ready(bot_jid).await;
    wait_until("session to connect", Duration::from_secs(3), || {
        let supervisor = gw.supervisor.clone();
        let agent_id = agent_id.to_string();
        async move {
            supervisor
                .get_status(&agent_id)
                .await
                .map(|view| view.live_state.is_ready)
                .unwrap_or(false)
        }
    })
    .await;
    handle
}

fn chat(from: &str, body: &str) -> InboundMessage {
    InboundMessage {
        id: "m1".to_string(),
        from: from.to_string(),
        body: body.to_string(),
        message_type: "chat".to_string(),
        notify_name: Some("Dina".to_string()),
        chat_name: Some("Dina W".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn direct_message_round_trips_through_the_ai() {
    let (mock, base) = start_mock_ai().await;
    let gw = build_gateway(&base);
    let handle = connected_agent(&gw, "a1", "628111@c.us").await;

    handle.emit_message(chat("628123@c.us", "hello bot")).await;

    wait_until("reply to be sent", Duration::from_secs(5), || {
        let handle = handle.clone();
        async move {
            handle
                .sent()
                .iter()
                .any(|item| matches!(item, SentItem::Text { body, .. } if body == "pong"))
        }
    })
    .await;

    // Typing brackets the AI call and the reply goes back to the sender.
    let sent = handle.sent();
    let typing_on = sent
        .iter()
        .position(|item| matches!(item, SentItem::Typing { active: true, .. }));
    let typing_off = sent
        .iter()
        .position(|item| matches!(item, SentItem::Typing { active: false, .. }));
    let reply = sent
        .iter()
        .position(|item| matches!(item, SentItem::Text { to, .. } if to == "628123@c.us"));
    assert!(typing_on.unwrap() < typing_off.unwrap());
    assert!(typing_off.unwrap() < reply.unwrap());

    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    let payload = mock.last_payload.lock().clone().unwrap();
    assert_eq!(payload["input"], "hello bot");
    assert_eq!(payload["session_id"], "628123@c.us");
    assert_eq!(payload["parameters"]["max_steps"], 5);
    assert_eq!(payload["parameters"]["metadata"]["whatsapp_name"], "Dina");
    assert_eq!(
        mock.last_auth.lock().clone().as_deref(),
        Some("Bearer k1")
    );
}

#[tokio::test]
async fn group_messages_need_a_mention_or_the_bot_digits() {
    let (mock, base) = start_mock_ai().await;
    let gw = build_gateway(&base);
    let handle = connected_agent(&gw, "a1", "628111@c.us").await;

    handle.emit_message(chat("g1@g.us", "hi")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    assert!(handle.sent_texts().is_empty());

    handle.emit_message(chat("g1@g.us", "hi @628111")).await;
    wait_until("group reply to be sent", Duration::from_secs(5), || {
        let handle = handle.clone();
        async move {
            handle
                .sent()
                .iter()
                .any(|item| matches!(item, SentItem::Text { to, .. } if to == "g1@g.us"))
        }
    })
    .await;
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn filtered_traffic_never_reaches_the_ai() {
    let (mock, base) = start_mock_ai().await;
    let gw = build_gateway(&base);
    let handle = connected_agent(&gw, "a1", "628111@c.us").await;

    let mut own = chat("628123@c.us", "me talking");
    own.from_me = true;
    handle.emit_message(own).await;

    handle.emit_message(chat("status@broadcast", "story")).await;

    let mut media = chat("628123@c.us", "caption");
    media.message_type = "image".to_string();
    handle.emit_message(media).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    assert!(handle.sent_texts().is_empty());
}

#[tokio::test]
async fn ai_failure_notifies_the_developer_not_the_sender() {
    let (mock, base) = start_mock_ai().await;
    let gw = build_gateway(&base);
    let handle = connected_agent(&gw, "failbot", "628111@c.us").await;

    handle.emit_message(chat("628123@c.us", "please break")).await;

    wait_until("developer notification", Duration::from_secs(5), || {
        let handle = handle.clone();
        async move {
            handle
                .sent()
                .iter()
                .any(|item| matches!(item, SentItem::Text { to, .. } if to == DEVELOPER_JID))
        }
    })
    .await;

    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    let texts = handle.sent_texts();
    assert_eq!(texts.len(), 1);
    match &texts[0] {
        SentItem::Text { to, body, .. } => {
            assert_eq!(to, DEVELOPER_JID);
            assert!(body.contains("failbot"));
            assert!(body.contains("please break"));
            assert!(body.contains("trace"));
        }
        other => panic!("unexpected item: {other:?}"),
    }
}

#[tokio::test]
async fn saturated_agent_queue_rejects_new_sends() {
    let gw = build_gateway("http://ai.invalid");
    connected_agent(&gw, "a1", "628111@c.us").await;

    // One job burns a token and blocks in flight; everything after it
    // queues until the limit trips.
    let scheduler = gw.scheduler.clone();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn({
        let scheduler = scheduler.clone();
        async move {
            let _ = scheduler
                .enqueue("a1", move || async move {
                    let _ = started_tx.send(());
                    std::future::pending::<()>().await;
                    Ok(Value::Null)
                })
                .await;
        }
    });
    started_rx.await.unwrap();

    for _ in 0..wa_gateway::scheduler::QUEUE_LIMIT {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let _ = scheduler
                .enqueue("a1", || async {
                    std::future::pending::<()>().await;
                    Ok(Value::Null)
                })
                .await;
        });
    }
    wait_until("queue to fill", Duration::from_secs(10), || {
        let scheduler = scheduler.clone();
        async move { scheduler.queued_len("a1") >= wa_gateway::scheduler::QUEUE_LIMIT }
    })
    .await;

    let err = gw
        .supervisor
        .send_text("a1", "08123", "one too many", None)
        .await
        .unwrap_err();
    assert_eq!(code_of(&err), ErrorCode::RateLimited);
}
