use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use streamfold::config::AppConfig;
use streamfold::observability::{RequestLogRecord, RequestLogSink};
use streamfold::routing::dispatch::dispatch_request;
use streamfold::state::AppState;

#[derive(Clone)]
enum Script {
    /// 200 event stream made of these raw chunks.
    Sse(Vec<&'static [u8]>),
    /// Event stream that breaks after these chunks.
    Broken(Vec<&'static [u8]>),
    Status(StatusCode, &'static str),
    /// Error status whose body breaks while it is being read.
    BrokenStatus(StatusCode),
}

#[derive(Default)]
struct Captured {
    calls: AtomicUsize,
    auth: Mutex<Option<String>>,
    body: Mutex<Option<Value>>,
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<RequestLogRecord>>);

impl RequestLogSink for RecordingSink {
    fn record(&self, record: RequestLogRecord) {
        self.0.lock().unwrap().push(record);
    }
}

struct MockUpstream {
    url: String,
    captured: Arc<Captured>,
    server: tokio::task::JoinHandle<()>,
}

/// Data chunks, then optionally a body error once the chunks are on the wire.
fn chunk_stream(
    chunks: Vec<&'static [u8]>,
    fail: bool,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let data = futures_util::stream::iter(
        chunks
            .into_iter()
            .map(|c| Ok::<Bytes, std::io::Error>(Bytes::from_static(c))),
    );
    let reset = futures_util::stream::iter(fail.then_some(())).then(|()| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Err(std::io::Error::other("upstream reset"))
    });
    data.chain(reset)
}

fn script_response(script: Script) -> Response {
    match script {
        Script::Sse(chunks) => Response::builder()
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(chunk_stream(chunks, false)))
            .expect("sse response"),
        Script::Broken(chunks) => Response::builder()
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(chunk_stream(chunks, true)))
            .expect("broken response"),
        Script::Status(status, body) => (status, body).into_response(),
        Script::BrokenStatus(status) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from_stream(chunk_stream(vec![b"{\"msg\":".as_slice()], true)))
            .expect("broken status response"),
    }
}

async fn spawn_upstream(script: Script) -> MockUpstream {
    let captured = Arc::new(Captured::default());
    let handler_captured = Arc::clone(&captured);
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |headers: HeaderMap, body: Bytes| {
            let captured = Arc::clone(&handler_captured);
            let script = script.clone();
            async move {
                captured.calls.fetch_add(1, Ordering::SeqCst);
                *captured.auth.lock().unwrap() = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                *captured.body.lock().unwrap() = serde_json::from_slice(&body).ok();
                script_response(script)
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockUpstream {
        url: format!("http://{addr}/v1/chat/completions"),
        captured,
        server,
    }
}

fn build_state(api_url: &str) -> (Arc<AppState>, Arc<RecordingSink>) {
    let mut config = AppConfig::default();
    config.upstream.api_url = api_url.to_string();
    let sink = Arc::new(RecordingSink::default());
    let state = AppState::with_log_sink(config, Arc::clone(&sink) as Arc<dyn RequestLogSink>)
        .expect("build state");
    (Arc::new(state), sink)
}

fn chat_request(body: &Value, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json");
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    builder
        .body(Body::from(serde_json::to_vec(body).expect("serialize request")))
        .expect("build request")
}

async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = dispatch_request(Arc::clone(state), Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    (status, headers, body)
}

/// Split an SSE body into its `data:` payloads.
fn sse_payloads(body: &[u8]) -> Vec<String> {
    std::str::from_utf8(body)
        .expect("utf8 body")
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| {
            frame
                .strip_prefix("data: ")
                .expect("data frame")
                .to_string()
        })
        .collect()
}

const HELLO_TRANSCRIPT: &[&[u8]] = &[
    b": keep-alive\n\n",
    b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\nda",
    b"ta: {\"choices\":[{\"delta\":{\"content\":\"lo caf\xC3",
    b"\xA9\"}}]}\n\n",
    b"data: not json at all\n\n",
    b"data: [DONE]\n\n",
];

#[tokio::test]
async fn test_buffered_completion_from_stream() {
    let upstream = spawn_upstream(Script::Sse(HELLO_TRANSCRIPT.to_vec())).await;
    let (state, _) = build_state(&upstream.url);

    let request = chat_request(
        &json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false,
            "presence_penalty": 0.3
        }),
        Some("Bearer client-key"),
    );
    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);

    let payload: Value = serde_json::from_slice(&body).expect("json payload");
    assert_eq!(payload["object"], "chat.completion");
    assert_eq!(payload["model"], "gpt-4");
    assert!(payload["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(payload["choices"][0]["message"]["role"], "assistant");
    assert_eq!(payload["choices"][0]["message"]["content"], "Hello caf\u{e9}");
    assert_eq!(payload["choices"][0]["finish_reason"], "stop");
    assert_eq!(payload["usage"]["prompt_tokens"], 0);
    assert_eq!(payload["usage"]["completion_tokens"], 10);
    assert_eq!(payload["usage"]["total_tokens"], 10);

    let sent = upstream.captured.body.lock().unwrap().clone().expect("upstream body");
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["model"], "nalang-xl-10");
    assert_eq!(sent["max_tokens"], 800);
    assert!(sent.get("presence_penalty").is_none());
    assert_eq!(
        upstream.captured.auth.lock().unwrap().as_deref(),
        Some("Bearer client-key")
    );

    upstream.server.abort();
}

#[tokio::test]
async fn test_streaming_chunks_and_done() {
    let upstream = spawn_upstream(Script::Sse(HELLO_TRANSCRIPT.to_vec())).await;
    let (state, _) = build_state(&upstream.url);

    let request = chat_request(
        &json!({
            "model": "my-custom-model",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }),
        Some("Bearer client-key"),
    );
    let (status, headers, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "text/event-stream");
    assert_eq!(headers["cache-control"], "no-cache");

    let payloads = sse_payloads(&body);
    assert_eq!(payloads.len(), 4, "payloads: {payloads:?}");
    assert_eq!(payloads[3], "[DONE]");

    let chunks: Vec<Value> = payloads[..3]
        .iter()
        .map(|p| serde_json::from_str(p).expect("chunk json"))
        .collect();
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "Hel");
    assert!(chunks[0]["choices"][0]["finish_reason"].is_null());
    assert!(chunks[1]["choices"][0]["delta"].get("role").is_none());
    assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "lo caf\u{e9}");
    assert_eq!(chunks[2]["choices"][0]["delta"], json!({}));
    assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
    for chunk in &chunks {
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["model"], "my-custom-model");
        assert_eq!(chunk["id"], chunks[0]["id"]);
        assert_eq!(chunk["created"], chunks[0]["created"]);
    }

    // Unknown model names go upstream unchanged.
    let sent = upstream.captured.body.lock().unwrap().clone().expect("upstream body");
    assert_eq!(sent["model"], "my-custom-model");
    assert_eq!(sent["stream"], true);

    upstream.server.abort();
}

#[tokio::test]
async fn test_silent_upstream_close_still_terminates() {
    let upstream = spawn_upstream(Script::Sse(vec![
        b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n".as_slice(),
        b"data: {\"choices\":[{\"message\":{\"content\":\"b\"}}]}".as_slice(),
    ]))
    .await;
    let (state, _) = build_state(&upstream.url);

    let request = chat_request(
        &json!({"messages": [{"role": "user", "content": "hi"}], "stream": true}),
        Some("Bearer client-key"),
    );
    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);

    let payloads = sse_payloads(&body);
    assert_eq!(payloads.len(), 4, "payloads: {payloads:?}");
    let last: Value = serde_json::from_str(&payloads[1]).unwrap();
    assert_eq!(last["choices"][0]["delta"]["content"], "b");
    assert_eq!(last["model"], "nalang-xl-10");
    assert_eq!(payloads[3], "[DONE]");
    assert_eq!(payloads.iter().filter(|p| *p == "[DONE]").count(), 1);

    upstream.server.abort();
}

#[tokio::test]
async fn test_stream_error_after_first_byte_is_in_band() {
    let upstream = spawn_upstream(Script::Broken(vec![
        b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n".as_slice(),
    ]))
    .await;
    let (state, _) = build_state(&upstream.url);

    let request = chat_request(
        &json!({"messages": [{"role": "user", "content": "hi"}], "stream": true}),
        Some("Bearer client-key"),
    );
    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);

    let payloads = sse_payloads(&body);
    assert_eq!(payloads.len(), 2, "payloads: {payloads:?}");
    let first: Value = serde_json::from_str(&payloads[0]).unwrap();
    assert_eq!(first["choices"][0]["delta"]["content"], "partial");
    let error: Value = serde_json::from_str(&payloads[1]).unwrap();
    assert_eq!(error["error"]["type"], "stream_error");
    assert!(error["error"]["message"]
        .as_str()
        .unwrap()
        .contains("decoding response body"));
    assert!(!payloads.iter().any(|p| p == "[DONE]"));

    upstream.server.abort();
}

#[tokio::test]
async fn test_buffered_stream_error_is_500() {
    let upstream = spawn_upstream(Script::Broken(vec![
        b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n".as_slice(),
    ]))
    .await;
    let (state, _) = build_state(&upstream.url);

    let request = chat_request(
        &json!({"messages": [{"role": "user", "content": "hi"}]}),
        Some("Bearer client-key"),
    );
    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let payload: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["error"]["type"], "server_error");
    assert_eq!(payload["error"]["message"], "Error processing stream response");
    // The request itself went through; the body broke afterwards.
    let details = payload["error"]["details"].as_str().expect("details");
    assert!(details.contains("decoding response body"), "details: {details}");
    assert!(!details.contains("error sending request"), "details: {details}");
    assert_eq!(upstream.captured.calls.load(Ordering::SeqCst), 1);

    upstream.server.abort();
}

#[tokio::test]
async fn test_upstream_error_status_passthrough() {
    let upstream = spawn_upstream(Script::Status(
        StatusCode::TOO_MANY_REQUESTS,
        "{\"msg\":\"quota exceeded\"}",
    ))
    .await;
    let (state, sink) = build_state(&upstream.url);

    let request = chat_request(
        &json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}], "stream": true}),
        Some("Bearer client-key"),
    );
    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let payload: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["error"]["type"], "api_error");
    assert_eq!(
        payload["error"]["message"],
        "API request failed: 429 Too Many Requests"
    );
    assert_eq!(payload["error"]["details"], "{\"msg\":\"quota exceeded\"}");
    // Never retried.
    assert_eq!(upstream.captured.calls.load(Ordering::SeqCst), 1);

    let records = sink.0.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, 429);
    assert!(records[0].error.as_deref().unwrap().contains("429"));

    upstream.server.abort();
}

#[tokio::test]
async fn test_unreadable_upstream_error_body_keeps_status() {
    let upstream = spawn_upstream(Script::BrokenStatus(StatusCode::SERVICE_UNAVAILABLE)).await;
    let (state, _) = build_state(&upstream.url);

    let request = chat_request(
        &json!({"messages": [{"role": "user", "content": "hi"}]}),
        Some("Bearer client-key"),
    );
    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let payload: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["error"]["type"], "api_error");
    assert_eq!(
        payload["error"]["message"],
        "API request failed: 503 Service Unavailable"
    );
    assert_eq!(payload["error"]["details"], "");

    upstream.server.abort();
}

#[tokio::test]
async fn test_missing_auth_never_reaches_upstream() {
    let upstream = spawn_upstream(Script::Sse(HELLO_TRANSCRIPT.to_vec())).await;
    let (state, sink) = build_state(&upstream.url);

    let body = json!({"messages": [{"role": "user", "content": "hi"}]});
    for auth in [None, Some("Basic abc"), Some("Bearer ")] {
        let (status, _, body) = send(&state, chat_request(&body, auth)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let payload: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["error"]["type"], "authentication_error");
    }
    assert_eq!(upstream.captured.calls.load(Ordering::SeqCst), 0);

    let records = sink.0.lock().unwrap();
    assert_eq!(records.len(), 3);
    let headers = &records[1].headers;
    assert!(headers
        .iter()
        .any(|(name, value)| name == "authorization" && value == "[redacted]"));

    upstream.server.abort();
}

#[tokio::test]
async fn test_invalid_request_bodies() {
    let upstream = spawn_upstream(Script::Sse(HELLO_TRANSCRIPT.to_vec())).await;
    let (state, _) = build_state(&upstream.url);

    for body in [
        json!({"model": "gpt-4"}),
        json!({"model": "gpt-4", "messages": []}),
        json!({"messages": [{"role": "robot", "content": "hi"}]}),
    ] {
        let (status, _, body) = send(&state, chat_request(&body, Some("Bearer k"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let payload: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["error"]["type"], "invalid_request_error");
    }

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer k")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, _) = send(&state, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(upstream.captured.calls.load(Ordering::SeqCst), 0);

    upstream.server.abort();
}

#[tokio::test]
async fn test_unreachable_upstream_is_500() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let (state, _) = build_state(&format!("http://{addr}/v1/chat/completions"));

    let request = chat_request(
        &json!({"messages": [{"role": "user", "content": "hi"}], "stream": true}),
        Some("Bearer k"),
    );
    let (status, _, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let payload: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["error"]["message"], "Error processing stream response");
}

#[tokio::test]
async fn test_get_sugar() {
    let upstream = spawn_upstream(Script::Sse(HELLO_TRANSCRIPT.to_vec())).await;
    let (state, _) = build_state(&upstream.url);

    let missing = Request::builder()
        .uri("/v1/chat/completions?model=gpt-4")
        .header("authorization", "Bearer k")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&state, missing).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let payload: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        payload["error"]["message"],
        "Message parameter is required for GET requests."
    );

    let streaming = Request::builder()
        .uri("/v1/chat/completions?message=hello%20world&stream=true")
        .header("authorization", "Bearer k")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&state, streaming).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "text/event-stream");
    assert_eq!(sse_payloads(&body).last().map(String::as_str), Some("[DONE]"));

    let sent = upstream.captured.body.lock().unwrap().clone().unwrap();
    assert_eq!(sent["model"], "nalang-turbo-v19");
    assert_eq!(sent["messages"], json!([{"role": "user", "content": "hello world"}]));

    upstream.server.abort();
}

#[tokio::test]
async fn test_auxiliary_routes() {
    let (state, _) = build_state("http://127.0.0.1:9/v1/chat/completions");

    let get = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header("host", "proxy.test")
            .body(Body::empty())
            .unwrap()
    };

    let (status, headers, body) = send(&state, get("/v1/models")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["access-control-allow-origin"], "*");
    let models: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(models["object"], "list");
    let ids: Vec<&str> = models["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"gpt-4"));
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);

    let (status, _, body) = send(&state, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert!(health["uptime"].is_number());
    assert!(health["timestamp"].as_str().unwrap().ends_with("GMT"));

    let (status, _, body) = send(&state, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    let index: Value = serde_json::from_slice(&body).unwrap();
    assert!(index["usage"]["example_curl"]
        .as_str()
        .unwrap()
        .contains("http://proxy.test/v1/chat/completions"));

    let (status, _, _) = send(&state, get("/v1/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let delete = Request::builder()
        .method("DELETE")
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&state, delete).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let preflight = Request::builder()
        .method("OPTIONS")
        .uri("/v1/chat/completions")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&state, preflight).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert!(headers.contains_key("access-control-allow-methods"));
}

#[tokio::test]
async fn test_body_limit() {
    let mut config = AppConfig::default();
    config.server.body_limit_bytes = 16;
    let state = Arc::new(AppState::new(config).unwrap());

    let request = chat_request(
        &json!({"messages": [{"role": "user", "content": "this body is longer than sixteen bytes"}]}),
        Some("Bearer k"),
    );
    let (status, _, _) = send(&state, request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}
