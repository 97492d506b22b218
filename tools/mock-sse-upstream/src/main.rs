use std::convert::Infallible;
use std::env;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

const DEFAULT_UPSTREAM_PORT: u16 = 19_001;
const DEFAULT_CHUNK_DELAY_MS: u64 = 20;

type MockBody = UnsyncBoxBody<Bytes, io::Error>;

/// What the mock streams back for every chat request.
#[derive(Copy, Clone)]
enum MockScenario {
    /// Well-formed deltas terminated by `[DONE]`.
    Text,
    /// Frames cut at awkward byte offsets, including inside a UTF-8 sequence.
    Split,
    /// Deltas followed by a silent close, no sentinel.
    NoDone,
    /// Non-success status with a JSON body.
    Error,
    /// Connection reset after the first delta.
    Drop,
}

struct MockState {
    scenario: MockScenario,
    chunk_delay: Duration,
    requests: AtomicU64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_u16("UPSTREAM_PORT", DEFAULT_UPSTREAM_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        chunk_delay: Duration::from_millis(env_u64("MOCK_CHUNK_DELAY_MS", DEFAULT_CHUNK_DELAY_MS)),
        requests: AtomicU64::new(0),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock upstream on 127.0.0.1:{port}: {err}"));
    eprintln!("mock SSE upstream on http://127.0.0.1:{port}/v1/chat/completions");

    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok((stream, remote_addr)) => (stream, remote_addr),
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, service).await {
                eprintln!("mock upstream connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("split") => MockScenario::Split,
        Ok("nodone") => MockScenario::NoDone,
        Ok("error") => MockScenario::Error,
        Ok("drop") => MockScenario::Drop,
        Ok("text") | Err(_) => MockScenario::Text,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to text");
            MockScenario::Text
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &Arc<MockState>) -> Response<MockBody> {
    let (parts, body) = request.into_parts();
    let request_body = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    let path = parts.uri.path();
    if parts.method == Method::GET && path == "/_mock/stats" {
        let body = format!("{{\"requests\":{}}}", state.requests.load(Ordering::Relaxed));
        return full_response(StatusCode::OK, "application/json", Bytes::from(body));
    }
    if path != "/v1/chat/completions" {
        return full_response(
            StatusCode::NOT_FOUND,
            "application/json",
            Bytes::from_static(br#"{"error":"not_found"}"#),
        );
    }
    if parts.method != Method::POST {
        return full_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "application/json",
            Bytes::from_static(br#"{"error":"method_not_allowed"}"#),
        );
    }

    state.requests.fetch_add(1, Ordering::Relaxed);
    eprintln!(
        "chat request: auth={:?} body={}",
        parts.headers.get(header::AUTHORIZATION),
        String::from_utf8_lossy(&request_body)
    );

    let chunks: Vec<&'static [u8]> = match state.scenario {
        MockScenario::Error => {
            return full_response(
                StatusCode::TOO_MANY_REQUESTS,
                "application/json",
                Bytes::from_static(br#"{"msg":"mock quota exceeded"}"#),
            );
        }
        MockScenario::Text => TEXT_CHUNKS.to_vec(),
        MockScenario::Split => SPLIT_CHUNKS.to_vec(),
        MockScenario::NoDone => NO_DONE_CHUNKS.to_vec(),
        MockScenario::Drop => DROP_CHUNKS.to_vec(),
    };
    let reset = matches!(state.scenario, MockScenario::Drop);
    sse_response(chunks, state.chunk_delay, reset)
}

fn sse_response(chunks: Vec<&'static [u8]>, delay: Duration, reset: bool) -> Response<MockBody> {
    let frames = stream::unfold(
        (chunks.into_iter(), reset),
        move |(mut remaining, reset)| async move {
            tokio::time::sleep(delay).await;
            match remaining.next() {
                Some(chunk) => Some((
                    Ok(Frame::data(Bytes::from_static(chunk))),
                    (remaining, reset),
                )),
                None if reset => Some((
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "mock reset")),
                    (remaining, false),
                )),
                None => None,
            }
        },
    );

    let mut response = Response::new(BodyExt::boxed_unsync(StreamBody::new(frames)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn full_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<MockBody> {
    let body = Full::new(body).map_err(|never| match never {}).boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

const TEXT_CHUNKS: &[&[u8]] = &[
    b": keep-alive\n\n",
    b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
    b"data: {\"choices\":[{\"delta\":{\"content\":\", world\"}}]}\n\n",
    b"data: [DONE]\n\n",
];

const SPLIT_CHUNKS: &[&[u8]] = &[
    b"data: {\"choices\":[{\"delta\":{\"con",
    b"tent\":\"caf\xC3",
    b"\xA9 \"}}]}\n",
    b"\ndata: {\"choices\":[{\"delta\":{\"content\":\"\xF0\x9F",
    b"\xA6\x80\"}}]}\n\ndata: [DO",
    b"NE]\n\n",
];

const NO_DONE_CHUNKS: &[&[u8]] = &[
    b"data: {\"choices\":[{\"delta\":{\"content\":\"no \"}}]}\n\n",
    b"data: {\"choices\":[{\"message\":{\"content\":\"sentinel\"}}]}",
];

const DROP_CHUNKS: &[&[u8]] = &[b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n"];
