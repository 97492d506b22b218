//! Incremental line framer for the upstream SSE body.
//!
//! Bytes are decoded as UTF-8 across chunk boundaries before line
//! splitting, so a multi-byte character split between two network chunks
//! is reassembled rather than replaced. Only `\n` delimits a line; the
//! delimiter is stripped and everything else (including `\r`) is kept for
//! the decoder to trim.
use bytes::Bytes;
use futures_util::Stream;
use memchr::memchr_iter;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

const REPLACEMENT: char = '\u{FFFD}';

#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: String,
    read_offset: usize,
    partial_char: SmallVec<[u8; 4]>,
}

impl LineFramer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw chunk and append every completed line to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<String>) {
        if chunk.is_empty() {
            return;
        }
        let scan_start = self.buffer.len();
        self.decode_into_buffer(chunk);
        self.split_lines(scan_start, out);
    }

    /// Flush the trailing fragment once the upstream body has ended.
    ///
    /// Returns `None` when nothing but whitespace was left over.
    pub fn finish(&mut self) -> Option<String> {
        if !self.partial_char.is_empty() {
            // An incomplete sequence at end of input can never complete.
            self.buffer.push(REPLACEMENT);
            self.partial_char.clear();
        }
        let tail = &self.buffer[self.read_offset..];
        let fragment = if tail.trim().is_empty() {
            None
        } else {
            Some(tail.to_owned())
        };
        self.buffer.clear();
        self.read_offset = 0;
        fragment
    }

    /// Bytes of text currently held for an unterminated line.
    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.buffer.len() - self.read_offset + self.partial_char.len()
    }

    fn decode_into_buffer(&mut self, chunk: &[u8]) {
        let mut input = chunk;

        // Complete a character left over from the previous chunk first.
        while !self.partial_char.is_empty() && !input.is_empty() {
            self.partial_char.push(input[0]);
            input = &input[1..];
            match std::str::from_utf8(&self.partial_char) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.partial_char.clear();
                }
                Err(e) => match e.error_len() {
                    None => {}
                    Some(_) => {
                        // The held bytes were not a valid prefix after all;
                        // replace the first and reprocess the rest.
                        self.buffer.push(REPLACEMENT);
                        let rest: SmallVec<[u8; 4]> = self.partial_char[1..].into();
                        self.partial_char.clear();
                        let mut rest_out = String::new();
                        let tail = decode_lossy_prefix(&rest, &mut rest_out);
                        self.buffer.push_str(&rest_out);
                        self.partial_char.extend_from_slice(tail);
                    }
                },
            }
        }

        if input.is_empty() {
            return;
        }
        let tail = decode_lossy_prefix(input, &mut self.buffer);
        self.partial_char.extend_from_slice(tail);
    }

    fn split_lines(&mut self, scan_start: usize, out: &mut Vec<String>) {
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            out.push(self.buffer[processed_up_to..line_end].to_owned());
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }
}

/// Decode as much of `input` as possible into `out`, replacing invalid
/// sequences with U+FFFD. Returns the incomplete trailing sequence, if any.
fn decode_lossy_prefix<'a>(mut input: &'a [u8], out: &mut String) -> &'a [u8] {
    loop {
        match std::str::from_utf8(input) {
            Ok(text) => {
                out.push_str(text);
                return &[];
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&input[..valid_up_to]) {
                    out.push_str(valid);
                }
                match e.error_len() {
                    Some(invalid_len) => {
                        out.push(REPLACEMENT);
                        input = &input[valid_up_to + invalid_len..];
                    }
                    None => return &input[valid_up_to..],
                }
            }
        }
    }
}

pin_project_lite::pin_project! {
    /// Adapts a byte stream into a stream of lines.
    ///
    /// Transport errors are passed through in order; the trailing fragment
    /// is yielded once the inner stream ends without error.
    pub struct LineStream<S> {
        #[pin]
        inner: S,
        framer: LineFramer,
        parsed: Vec<String>,
        pending: VecDeque<String>,
        finished: bool,
    }
}

impl<S> LineStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            framer: LineFramer::new(),
            parsed: Vec::with_capacity(8),
            pending: VecDeque::with_capacity(8),
            finished: false,
        }
    }
}

impl<S, E> Stream for LineStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<String, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(line) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(line)));
            }
            if *this.finished {
                return Poll::Ready(None);
            }
            match this.inner.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    this.framer.feed(&chunk, this.parsed);
                    this.pending.extend(this.parsed.drain(..));
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    *this.finished = true;
                    if let Some(fragment) = this.framer.finish() {
                        this.pending.push_back(fragment);
                    }
                }
            }
        }
    }
}
