//! Messenger Send API adapter against a local Graph API stand-in

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::post,
};
use beacon_turns::channels::messenger::MessengerChannel;
use beacon_turns::channels::messenger::retry::RetryPolicy;
use beacon_turns::channels::messenger::types::MAX_TEXT_CHARS;
use beacon_turns::channels::{Channel, OutgoingMessage};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_test::{assert_err, assert_ok};

/// Scripted responses, in order; 200 once exhausted
#[derive(Default)]
struct GraphStub {
    script: Mutex<Vec<(StatusCode, Value)>>,
    hits: AtomicUsize,
    received: Mutex<Vec<(HashMap<String, String>, Value)>>,
}

async fn send_message(
    State(stub): State<Arc<GraphStub>>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    stub.hits.fetch_add(1, Ordering::SeqCst);
    stub.received.lock().await.push((query, body));

    let mut script = stub.script.lock().await;
    if script.is_empty() {
        (
            StatusCode::OK,
            Json(json!({ "recipient_id": "USER1", "message_id": "m_out" })),
        )
    } else {
        let (status, body) = script.remove(0);
        (status, Json(body))
    }
}

async fn spawn_graph(script: Vec<(StatusCode, Value)>) -> (String, Arc<GraphStub>) {
    let stub = Arc::new(GraphStub {
        script: Mutex::new(script),
        ..GraphStub::default()
    });
    let app = Router::new()
        .route("/v18.0/me/messages", post(send_message))
        .with_state(stub.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), stub)
}

fn channel(api_base: &str) -> MessengerChannel {
    MessengerChannel::new(SecretString::from("page-token".to_string()), "v18.0")
        .with_api_base(api_base)
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        })
}

#[tokio::test]
async fn reply_is_posted_with_token_and_truncated() {
    let (base, stub) = spawn_graph(Vec::new()).await;
    let long = "ư".repeat(MAX_TEXT_CHARS + 50);

    assert_ok!(channel(&base).send(OutgoingMessage::text("USER1", long)).await);

    let received = stub.received.lock().await;
    assert_eq!(received.len(), 1);
    let (query, body) = &received[0];
    assert_eq!(query.get("access_token").map(String::as_str), Some("page-token"));
    assert_eq!(body["recipient"]["id"], "USER1");
    assert_eq!(body["messaging_type"], "RESPONSE");
    let text = body["message"]["text"].as_str().unwrap();
    assert_eq!(text.chars().count(), MAX_TEXT_CHARS);
}

#[tokio::test]
async fn server_error_is_retried() {
    let (base, stub) = spawn_graph(vec![(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": { "message": "boom", "code": 2 } }),
    )])
    .await;

    assert_ok!(channel(&base).send_text("USER1", "chào bạn").await);
    assert_eq!(stub.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rejected_message_is_not_retried() {
    let (base, stub) = spawn_graph(vec![(
        StatusCode::BAD_REQUEST,
        json!({ "error": { "message": "No matching user found", "code": 100 } }),
    )])
    .await;

    let err = assert_err!(channel(&base).send_text("USER1", "chào bạn").await);
    assert!(err.to_string().contains("1 attempt"));
    assert_eq!(stub.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let throttled = (
        StatusCode::TOO_MANY_REQUESTS,
        json!({ "error": { "message": "slow down", "code": 613 } }),
    );
    let (base, stub) = spawn_graph(vec![throttled.clone(), throttled.clone(), throttled]).await;

    let err = assert_err!(channel(&base).send_text("USER1", "chào bạn").await);
    assert!(err.to_string().contains("3 attempt"));
    assert_eq!(stub.hits.load(Ordering::SeqCst), 3);
}
