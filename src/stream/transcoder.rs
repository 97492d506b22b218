use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::future::Future;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::ProxyError;
use crate::protocol::openai::{ChatCompletionChunk, ChunkChoice, ChunkDelta, Role};
use crate::stream::decoder::{decode_line, UpstreamEvent};
use crate::stream::sse::{error_frame, sse_data_frame, DONE_FRAME};

/// Why a transcoder stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Upstream sent the `[DONE]` sentinel.
    Completed,
    /// Upstream closed the body without a sentinel.
    UpstreamClosed,
    UpstreamFailed,
    ClientGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscoderState {
    Streaming,
    Terminated(Termination),
}

/// The client side has gone away; nothing more can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Where transcoded output goes. The state machine calls each method at
/// most in the order `content* (finish | fail)?`.
pub trait OutputSink {
    fn content(&mut self, text: String) -> Result<(), SinkClosed>;
    fn finish(&mut self) -> Result<(), SinkClosed>;
    fn fail(&mut self, message: &str);
}

/// Two-state transcoder. Once terminated every further input is ignored,
/// which is what guarantees a single terminal signal per response.
pub struct Transcoder<S> {
    sink: S,
    state: TranscoderState,
}

impl<S: OutputSink> Transcoder<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: TranscoderState::Streaming,
        }
    }

    #[must_use]
    pub fn state(&self) -> TranscoderState {
        self.state
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self.state, TranscoderState::Terminated(_))
    }

    pub fn handle(&mut self, event: UpstreamEvent) {
        if self.is_terminated() {
            return;
        }
        match event {
            UpstreamEvent::ContentDelta(text) => {
                if self.sink.content(text).is_err() {
                    self.terminate(Termination::ClientGone);
                }
            }
            UpstreamEvent::StreamEnd => self.complete(Termination::Completed),
            UpstreamEvent::Ignored => {}
        }
    }

    /// The upstream body ended. Any trailing fragment must already have been
    /// fed through [`Transcoder::handle`].
    pub fn upstream_closed(&mut self) {
        if self.is_terminated() {
            return;
        }
        self.complete(Termination::UpstreamClosed);
    }

    pub fn upstream_failed(&mut self, message: &str) {
        if self.is_terminated() {
            return;
        }
        tracing::warn!(error = message, "upstream stream failed");
        self.sink.fail(message);
        self.terminate(Termination::UpstreamFailed);
    }

    pub fn client_disconnected(&mut self) {
        if self.is_terminated() {
            return;
        }
        tracing::debug!("client disconnected, closing upstream");
        self.terminate(Termination::ClientGone);
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn complete(&mut self, reason: Termination) {
        let reason = match self.sink.finish() {
            Ok(()) => reason,
            Err(SinkClosed) => Termination::ClientGone,
        };
        self.terminate(reason);
    }

    fn terminate(&mut self, reason: Termination) {
        tracing::debug!(termination = ?reason, "transcoder terminated");
        self.state = TranscoderState::Terminated(reason);
    }
}

/// Drive a transcoder from upstream lines until it terminates.
///
/// `disconnect` resolves when the client has gone away. It is polled first
/// so a dead client wins over data that is already buffered. Returning drops
/// `lines`, which releases the upstream connection.
pub async fn drive<S, L, E, D>(
    mut transcoder: Transcoder<S>,
    lines: L,
    disconnect: D,
) -> Transcoder<S>
where
    S: OutputSink,
    L: Stream<Item = Result<String, E>>,
    E: std::fmt::Display,
    D: Future<Output = ()>,
{
    tokio::pin!(lines);
    tokio::pin!(disconnect);

    while !transcoder.is_terminated() {
        tokio::select! {
            biased;
            () = &mut disconnect => transcoder.client_disconnected(),
            next = lines.next() => match next {
                Some(Ok(line)) => transcoder.handle(decode_line(&line)),
                Some(Err(e)) => transcoder.upstream_failed(&e.to_string()),
                None => transcoder.upstream_closed(),
            },
        }
    }
    transcoder
}

/// Identity shared by every chunk of one response.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub id: String,
    pub created: u64,
    pub model: String,
}

/// Live sink: each event becomes an SSE frame pushed to the client without
/// waiting on it.
pub struct LiveSink {
    tx: UnboundedSender<Bytes>,
    meta: ResponseMeta,
    role_sent: bool,
}

impl LiveSink {
    pub fn new(tx: UnboundedSender<Bytes>, meta: ResponseMeta) -> Self {
        Self {
            tx,
            meta,
            role_sent: false,
        }
    }

    fn chunk_frame(&self, delta: ChunkDelta, finish_reason: Option<&str>) -> String {
        let chunk = ChatCompletionChunk {
            id: self.meta.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.meta.created,
            model: self.meta.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_owned),
            }],
        };
        match serde_json::to_string(&chunk) {
            Ok(json) => sse_data_frame(&json),
            Err(e) => error_frame(&e.to_string()),
        }
    }

    fn send(&self, frame: String) -> Result<(), SinkClosed> {
        self.tx.send(Bytes::from(frame)).map_err(|_| SinkClosed)
    }
}

impl OutputSink for LiveSink {
    fn content(&mut self, text: String) -> Result<(), SinkClosed> {
        let role = (!self.role_sent).then_some(Role::Assistant);
        let frame = self.chunk_frame(
            ChunkDelta {
                role,
                content: Some(text),
            },
            None,
        );
        self.send(frame)?;
        self.role_sent = true;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkClosed> {
        let frame = self.chunk_frame(ChunkDelta::default(), Some("stop"));
        self.send(frame)?;
        self.send(DONE_FRAME.to_owned())
    }

    fn fail(&mut self, message: &str) {
        let _ = self.send(error_frame(message));
    }
}

/// Buffered sink: accumulates content for a single completion object.
#[derive(Debug, Default)]
pub struct BufferedSink {
    content: String,
    failure: Option<String>,
}

impl BufferedSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the accumulated content, or the stream failure if there was one.
    pub fn into_content(self) -> Result<String, ProxyError> {
        match self.failure {
            Some(cause) => Err(ProxyError::StreamTranscode(cause)),
            None => Ok(self.content),
        }
    }
}

impl OutputSink for BufferedSink {
    fn content(&mut self, text: String) -> Result<(), SinkClosed> {
        self.content.push_str(&text);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkClosed> {
        Ok(())
    }

    fn fail(&mut self, message: &str) {
        self.failure = Some(message.to_owned());
    }
}
