//! `data:` line decoding for streaming model responses.
//!
//! Both providers answer with server-sent events whose `data:` payloads are
//! JSON objects carrying a provider-specific slice of the response text. This
//! module turns a raw byte stream into a stream of those text slices.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::debug;

use easel_core::errors::{mentions_rate_limit, parse_retry_hint, GatewayError};
use easel_core::provider::TextStream;

pub const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// End-of-stream sentinel sent by OpenAI-compatible APIs.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Pulls the response text out of one decoded `data:` payload.
pub type TextExtractor = fn(&Value) -> Option<String>;

/// Payload of an SSE line, or `None` for comments, blank lines and other fields.
pub fn extract_data(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    let data = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))?
        .trim();
    (!data.is_empty()).then_some(data)
}

/// Splits a byte stream into complete `data:` payloads.
///
/// Bytes are buffered until a newline arrives, so a payload split across
/// network chunks (even mid UTF-8 sequence) is only decoded once whole.
#[derive(Debug, Default)]
pub struct DataLineDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl DataLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.accept_line(&line, &mut out);
        }
        out
    }

    /// Flush a final unterminated line.
    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buffer);
        let mut out = Vec::new();
        if !rest.is_empty() {
            self.accept_line(&rest, &mut out);
        }
        out
    }

    fn accept_line(&mut self, raw: &[u8], out: &mut Vec<String>) {
        if self.done {
            return;
        }
        let Ok(line) = std::str::from_utf8(raw) else {
            debug!("skipping non-utf8 sse line");
            return;
        };
        if let Some(data) = extract_data(line) {
            if data == DONE_SENTINEL {
                self.done = true;
            } else {
                out.push(data.to_string());
            }
        }
    }
}

/// Error object embedded in a stream payload, if any.
pub fn embedded_error(value: &Value) -> Option<GatewayError> {
    let error = value.get("error")?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    let code = error.get("code").and_then(Value::as_u64);
    if code == Some(429) || mentions_rate_limit(&message) {
        return Some(GatewayError::RateLimited {
            retry_after: parse_retry_hint(&message),
            message,
        });
    }
    Some(GatewayError::StreamInterrupted(message))
}

/// Wraps a response byte stream and yields text slices.
///
/// Includes an idle timeout: if no bytes arrive within `idle_duration` the
/// stream yields a `StreamInterrupted` error and ends.
pub struct TextFragmentStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>,
    decoder: DataLineDecoder,
    extract: TextExtractor,
    pending: VecDeque<Result<String, GatewayError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl TextFragmentStream {
    pub fn new(
        byte_stream: impl Stream<Item = Result<Bytes, String>> + Send + 'static,
        extract: TextExtractor,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            decoder: DataLineDecoder::new(),
            extract,
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    pub fn from_response(
        response: reqwest::Response,
        extract: TextExtractor,
        idle_timeout: Duration,
    ) -> Self {
        let bytes = response.bytes_stream().map(|r| r.map_err(|e| e.to_string()));
        Self::new(bytes, extract, idle_timeout)
    }

    pub fn boxed(self) -> TextStream {
        Box::pin(self)
    }

    fn absorb(&mut self, payloads: Vec<String>) {
        for payload in payloads {
            let value: Value = match serde_json::from_str(&payload) {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "skipping malformed data payload");
                    continue;
                }
            };
            if let Some(error) = embedded_error(&value) {
                self.pending.push_back(Err(error));
                self.finished = true;
                return;
            }
            if let Some(text) = (self.extract)(&value) {
                if !text.is_empty() {
                    self.pending.push_back(Ok(text));
                }
            }
        }
    }
}

impl Stream for TextFragmentStream {
    type Item = Result<String, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.finished || self.decoder.is_done() {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);
                    let payloads = self.decoder.push(&bytes);
                    self.absorb(payloads);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(GatewayError::StreamInterrupted(e))));
                }
                Poll::Ready(None) => {
                    let payloads = self.decoder.finish();
                    self.absorb(payloads);
                    self.finished = true;
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(Err(GatewayError::StreamInterrupted(format!(
                            "idle timeout after {}s",
                            self.idle_duration.as_secs()
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Send a prepared request and wrap a successful response as a text stream.
pub(crate) async fn open_text_stream(
    request: reqwest::RequestBuilder,
    extract: TextExtractor,
    idle_timeout: Duration,
) -> Result<TextStream, GatewayError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            GatewayError::Timeout(Duration::ZERO)
        } else {
            GatewayError::NetworkError(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::from_status(status.as_u16(), body));
    }

    Ok(TextFragmentStream::from_response(response, extract, idle_timeout).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn gemini_text(v: &Value) -> Option<String> {
        v.pointer("/text").and_then(Value::as_str).map(str::to_string)
    }

    #[test]
    fn extract_data_variants() {
        assert_eq!(extract_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(extract_data("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(extract_data(": keepalive"), None);
        assert_eq!(extract_data("event: message"), None);
        assert_eq!(extract_data("data: "), None);
        assert_eq!(extract_data(""), None);
    }

    #[test]
    fn decoder_buffers_partial_lines() {
        let mut d = DataLineDecoder::new();
        assert!(d.push(b"data: {\"text\":\"he").is_empty());
        assert_eq!(d.push(b"llo\"}\n\ndata: {\"text\":\"x\"}\n"), vec![
            "{\"text\":\"hello\"}".to_string(),
            "{\"text\":\"x\"}".to_string(),
        ]);
    }

    #[test]
    fn decoder_handles_split_utf8() {
        let mut d = DataLineDecoder::new();
        let line = "data: {\"text\":\"é\"}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;
        assert!(d.push(&line[..split]).is_empty());
        assert_eq!(d.push(&line[split..]), vec!["{\"text\":\"é\"}".to_string()]);
    }

    #[test]
    fn decoder_stops_at_done() {
        let mut d = DataLineDecoder::new();
        let out = d.push(b"data: {\"text\":\"a\"}\ndata: [DONE]\ndata: {\"text\":\"b\"}\n");
        assert_eq!(out, vec!["{\"text\":\"a\"}".to_string()]);
        assert!(d.is_done());
    }

    #[test]
    fn decoder_flushes_unterminated_tail() {
        let mut d = DataLineDecoder::new();
        assert!(d.push(b"data: {\"text\":\"tail\"}").is_empty());
        assert_eq!(d.finish(), vec!["{\"text\":\"tail\"}".to_string()]);
    }

    #[test]
    fn embedded_error_classification() {
        let v = serde_json::json!({"error": {"code": 429, "message": "Rate limit exceeded"}});
        assert!(embedded_error(&v).unwrap().is_rate_limit());
        let v = serde_json::json!({"error": {"message": "upstream closed"}});
        assert!(matches!(embedded_error(&v), Some(GatewayError::StreamInterrupted(_))));
        assert!(embedded_error(&serde_json::json!({"text": "x"})).is_none());
    }

    #[tokio::test]
    async fn stream_yields_text_and_skips_malformed() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from("data: {\"text\":\"Hel\"}\n\n")),
            Ok(Bytes::from("data: {not json\n\n")),
            Ok(Bytes::from("data: {\"text\":\"lo\"}\n\n")),
        ];
        let stream =
            TextFragmentStream::new(futures::stream::iter(chunks), gemini_text, SSE_IDLE_TIMEOUT);
        let items: Vec<_> = stream.collect().await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn transport_error_ends_stream() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from("data: {\"text\":\"a\"}\n")),
            Err("connection reset".into()),
            Ok(Bytes::from("data: {\"text\":\"never\"}\n")),
        ];
        let mut stream =
            TextFragmentStream::new(futures::stream::iter(chunks), gemini_text, SSE_IDLE_TIMEOUT);
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert!(matches!(stream.next().await, Some(Err(GatewayError::StreamInterrupted(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_no_data() {
        tokio::time::pause();
        let bytes = futures::stream::pending::<Result<Bytes, String>>();
        let mut stream = TextFragmentStream::new(bytes, gemini_text, Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(6)).await;
        let item = stream.next().await;
        assert!(
            matches!(
                &item,
                Some(Err(GatewayError::StreamInterrupted(msg))) if msg.contains("idle timeout")
            ),
            "got {item:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_resets_on_data() {
        tokio::time::pause();
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, String>>(4);
        let rx = tokio_stream::wrappers::ReceiverStream::new(rx);
        let mut stream = TextFragmentStream::new(rx, gemini_text, Duration::from_secs(5));

        tx.send(Ok(Bytes::from("data: {\"text\":\"a\"}\n"))).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        tokio::time::advance(Duration::from_secs(4)).await;
        tx.send(Ok(Bytes::from("data: {\"text\":\"b\"}\n"))).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "b");
        drop(tx);
        assert!(stream.next().await.is_none());
    }
}
