//! Decoding of the answer event stream.
//!
//! The backend answers a query with a long-lived response made of newline-delimited
//! frames.  Blank lines and `:` comment lines are ignored; every other frame of
//! interest is a line `data: <json>` where the JSON is `{"event": tag, "data": {..}}`.
//! This module turns the raw byte stream into a stream of [`QueryEvent`]s.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::observability::{
    STREAM_BYTES, STREAM_ERRORS, STREAM_EVENTS, STREAM_MALFORMED_FRAMES, STREAM_RELEASES,
};
use crate::types::{Citation, DoneSummary, QueryEvent};

/// Prefix of a data frame.
pub const DATA_PREFIX: &str = "data: ";

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Decode a stream of response bytes into query events.
///
/// The returned stream yields `Ok` chunk and citation events followed by exactly one
/// terminal item: `Ok(QueryEvent::Done)` or `Err`.  A body that ends without a
/// terminal frame still yields a `Done` with an empty summary.  Malformed frames are
/// logged and skipped.  When `cancel` fires the stream ends without a terminal item.
///
/// The body is dropped as soon as the read loop is finished with it.
pub fn decode_events<S, E>(
    byte_stream: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<QueryEvent>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let decoder = Decoder {
        body: Some(byte_stream),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        cancel,
    };
    stream::unfold(decoder, |mut decoder| async move {
        let item = decoder.next_item().await?;
        match &item {
            Ok(_) => STREAM_EVENTS.click(),
            Err(_) => STREAM_ERRORS.click(),
        }
        Some((item, decoder))
    })
}

struct Decoder<S> {
    body: Option<S>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<QueryEvent>>,
    finished: bool,
    cancel: CancellationToken,
}

impl<S, E> Decoder<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn next_item(&mut self) -> Option<Result<QueryEvent>> {
        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled();
            }
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.finished {
                return None;
            }
            let body = self.body.as_mut()?;
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(),
                next = body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    STREAM_BYTES.count(bytes.len() as u64);
                    self.buffer.extend_from_slice(&bytes);
                    self.drain_lines();
                }
                Some(Err(err)) => {
                    self.finish();
                    self.pending.push_back(Err(Error::connection(
                        format!("connection lost while streaming: {err}"),
                        Some(Box::new(err)),
                    )));
                }
                None => {
                    let rest = std::mem::take(&mut self.buffer);
                    if !rest.is_empty() {
                        self.handle_line(&rest);
                    }
                    if !self.finished {
                        debug!("stream ended without a terminal frame");
                        self.finish();
                        self.pending
                            .push_back(Ok(QueryEvent::Done(DoneSummary::default())));
                    }
                }
            }
        }
    }

    fn drain_lines(&mut self) {
        while !self.finished {
            let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') else {
                return;
            };
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            self.handle_line(&line[..newline]);
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(err) => {
                STREAM_MALFORMED_FRAMES.click();
                warn!(error = %err, "skipping frame with invalid UTF-8");
                return;
            }
        };
        if let Some(item) = parse_line(line) {
            let terminal = match &item {
                Ok(event) => event.is_terminal(),
                Err(_) => true,
            };
            self.pending.push_back(item);
            if terminal {
                self.finish();
            }
        }
    }

    fn cancelled(&mut self) -> Option<Result<QueryEvent>> {
        debug!("query stream cancelled");
        self.pending.clear();
        self.finish();
        None
    }

    fn finish(&mut self) {
        self.finished = true;
        self.release();
    }
}

impl<S> Decoder<S> {
    fn release(&mut self) {
        if self.body.take().is_some() {
            STREAM_RELEASES.click();
        }
        self.buffer.clear();
    }
}

impl<S> Drop for Decoder<S> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Parse one line of the event stream.
///
/// Returns `None` for lines that carry no event: blanks, comments, non-data fields,
/// malformed JSON, unknown tags.
pub fn parse_line(line: &str) -> Option<Result<QueryEvent>> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        debug!(line, "ignoring non-data line");
        return None;
    };
    let frame: RawFrame = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(err) => {
            STREAM_MALFORMED_FRAMES.click();
            warn!(error = %err, payload, "failed to parse stream frame");
            return None;
        }
    };
    match frame.event.as_str() {
        "chunk" => match frame.data.get("content").and_then(Value::as_str) {
            Some(content) => Some(Ok(QueryEvent::Chunk(content.to_string()))),
            None => {
                STREAM_MALFORMED_FRAMES.click();
                warn!(payload, "chunk frame without text content");
                None
            }
        },
        "citation" => match serde_json::from_value::<Citation>(frame.data) {
            Ok(citation) => Some(Ok(QueryEvent::Citation(citation))),
            Err(err) => {
                STREAM_MALFORMED_FRAMES.click();
                warn!(error = %err, payload, "malformed citation frame");
                None
            }
        },
        "done" => {
            let summary = serde_json::from_value::<DoneSummary>(frame.data).unwrap_or_default();
            Some(Ok(QueryEvent::Done(summary)))
        }
        "error" => {
            let message = frame
                .data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            let code = frame
                .data
                .get("code")
                .or_else(|| frame.data.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(Err(Error::backend(message, code)))
        }
        other => {
            warn!(event = other, "unknown stream event type");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    use super::*;

    type Frame = std::result::Result<Bytes, io::Error>;

    /// A body that counts how often it is dropped.
    struct CountedBody {
        inner: stream::Iter<std::vec::IntoIter<Frame>>,
        drops: Arc<AtomicUsize>,
    }

    impl Stream for CountedBody {
        type Item = Frame;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.inner).poll_next(cx)
        }
    }

    impl Drop for CountedBody {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn body(parts: &[&[u8]]) -> (CountedBody, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        let frames: Vec<Frame> = parts.iter().map(|p| Ok(Bytes::copy_from_slice(p))).collect();
        let body = CountedBody {
            inner: stream::iter(frames),
            drops: drops.clone(),
        };
        (body, drops)
    }

    async fn collect(parts: &[&[u8]]) -> (Vec<Result<QueryEvent>>, usize) {
        let (body, drops) = body(parts);
        let events = decode_events(body, CancellationToken::new())
            .collect::<Vec<_>>()
            .await;
        (events, drops.load(Ordering::SeqCst))
    }

    fn text_of(events: &[Result<QueryEvent>]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                Ok(QueryEvent::Chunk(text)) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn chunks_accumulate_until_done() {
        let (events, drops) = collect(&[
            b"data: {\"event\":\"chunk\",\"data\":{\"content\":\"Hello \"}}\n",
            b"data: {\"event\":\"chunk\",\"data\":{\"content\":\"world\"}}\n",
            b"data: {\"event\":\"done\",\"data\":{}}\n",
        ])
        .await;
        assert_eq!(text_of(&events), "Hello world");
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], Ok(QueryEvent::Done(_))));
        assert_eq!(drops, 1);
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let (events, _) = collect(&[
            b"data: {not json}\n",
            b"data: {\"event\":\"chunk\",\"data\":{\"content\":\"still here\"}}\n",
            b"data: {\"event\":\"done\",\"data\":{}}\n",
        ])
        .await;
        assert_eq!(text_of(&events), "still here");
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn partial_line_is_held_over() {
        let (events, _) = collect(&[
            b"data: {\"event\":\"chunk\",\"da",
            b"ta\":{\"content\":\"joined\"}}\n\n: keep-alive\n",
            b"data: {\"event\":\"done\",\"data\":{\"query_id\":\"q-1\",\"confidence_score\":0.82}}\n",
        ])
        .await;
        assert_eq!(text_of(&events), "joined");
        match &events[1] {
            Ok(QueryEvent::Done(summary)) => {
                assert_eq!(summary.query_id.as_deref(), Some("q-1"));
                assert_eq!(summary.confidence_score, Some(0.82));
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn multibyte_character_split_across_reads() {
        let frame = "data: {\"event\":\"chunk\",\"data\":{\"content\":\"caf\u{e9}\"}}\n".as_bytes();
        let split = frame.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let (events, _) = collect(&[&frame[..split], &frame[split..]]).await;
        assert_eq!(text_of(&events), "caf\u{e9}");
    }

    #[tokio::test]
    async fn missing_done_is_synthesized_once() {
        let (events, drops) = collect(&[
            b"data: {\"event\":\"chunk\",\"data\":{\"content\":\"partial\"}}\n",
            b"data: {\"event\":\"chunk\",\"data\":{\"content\":\" answer\"}}",
        ])
        .await;
        assert_eq!(text_of(&events), "partial answer");
        let dones = events
            .iter()
            .filter(|e| matches!(e, Ok(QueryEvent::Done(_))))
            .count();
        assert_eq!(dones, 1);
        match events.last() {
            Some(Ok(QueryEvent::Done(summary))) => assert_eq!(*summary, DoneSummary::default()),
            other => panic!("expected synthetic done, got {other:?}"),
        }
        assert_eq!(drops, 1);
    }

    #[tokio::test]
    async fn error_frame_is_terminal() {
        let (events, drops) = collect(&[
            b"data: {\"event\":\"chunk\",\"data\":{\"content\":\"Hel\"}}\r\n",
            b"data: {\"event\":\"error\",\"data\":{\"message\":\"Vector store unavailable\",\"code\":\"service_unavailable\"}}\n",
            b"data: {\"event\":\"chunk\",\"data\":{\"content\":\"never\"}}\n",
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(text_of(&events), "Hel");
        let err = events[1].as_ref().unwrap_err();
        assert!(err.is_backend());
        assert_eq!(err.message(), "Vector store unavailable");
        assert_eq!(err.kind(), crate::error::ErrorKind::ServiceUnavailable);
        assert_eq!(drops, 1);
    }

    #[tokio::test]
    async fn citation_frames_are_decoded() {
        let (events, _) = collect(&[
            b"data: {\"event\":\"citation\",\"data\":{\"text\":\"Chapter 3, Section 2\",\"chapter\":\"Kinematics\",\"section\":\"Forward Kinematics\",\"url\":\"/docs/chapter-3#section-2\",\"chapter_number\":3}}\n",
            b"data: {\"event\":\"citation\",\"data\":{\"bogus\":true}}\n",
            b"data: {\"event\":\"mystery\",\"data\":{}}\n",
            b"data: {\"event\":\"done\"}\n",
        ])
        .await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            Ok(QueryEvent::Citation(citation)) => {
                assert_eq!(citation.text, "Chapter 3, Section 2");
                assert_eq!(citation.chapter_number, Some(3));
            }
            other => panic!("expected citation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_error_is_terminal() {
        let drops = Arc::new(AtomicUsize::new(0));
        let body = CountedBody {
            inner: stream::iter(vec![
                Ok(Bytes::from_static(
                    b"data: {\"event\":\"chunk\",\"data\":{\"content\":\"a\"}}\n",
                )),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
                Ok(Bytes::from_static(b"data: {\"event\":\"done\",\"data\":{}}\n")),
            ]),
            drops: drops.clone(),
        };
        let events: Vec<_> = decode_events(body, CancellationToken::new()).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[1].as_ref().unwrap_err().is_connection());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_is_silent() {
        let (body, drops) = body(&[
            b"data: {\"event\":\"chunk\",\"data\":{\"content\":\"first\"}}\n",
            b"data: {\"event\":\"chunk\",\"data\":{\"content\":\"second\"}}\n",
        ]);
        let cancel = CancellationToken::new();
        let mut events = Box::pin(decode_events(body, cancel.clone()));
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first, QueryEvent::Chunk("first".to_string()));
        cancel.cancel();
        assert!(events.next().await.is_none());
        assert!(events.next().await.is_none());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_once() {
        let (body, drops) = body(&[b"data: {\"event\":\"chunk\",\"data\":{\"content\":\"x\"}}\n"]);
        let mut events = Box::pin(decode_events(body, CancellationToken::new()));
        let _ = events.next().await;
        drop(events);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parse_line_ignores_noise() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
        assert!(parse_line(": ping").is_none());
        assert!(parse_line("event: chunk").is_none());
        assert!(parse_line("data: {\"event\":\"chunk\",\"data\":{}}").is_none());
    }
}
