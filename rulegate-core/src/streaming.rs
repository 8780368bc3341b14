//! Streaming response transformation.
//!
//! [`StreamTransformer`] wraps an upstream byte stream and yields it
//! back line by line, applying the response operations of one rule to
//! every line that parses as a JSON object. Framing is preserved: SSE
//! `data: ` prefixes are re-emitted, `[DONE]` markers and non-JSON
//! lines pass through unchanged, and empty lines (SSE event
//! terminators) become a lone newline.
//!
//! Lines are emitted strictly in arrival order and at most one line is
//! buffered; the first transformed event never waits on a later one.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{ready, Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{Config, Operation};
use crate::error::ProxyError;
use crate::ops::{apply_operations, OpScope};
use crate::template::{Phase, TemplateSet};

/// Initial line buffer capacity.
pub const INITIAL_LINE_CAPACITY: usize = 64 * 1024;

/// Hard cap on a single line. Longer lines end the stream with a
/// [`ProxyError::Stream`].
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Everything needed to transform the lines of one streaming response.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub config: Arc<Config>,
    pub templates: Arc<TemplateSet>,
    pub proxy_index: usize,
    pub rule_index: usize,
    /// Response headers, used for `match_headers` conditions.
    pub headers: HashMap<String, String>,
}

impl StreamContext {
    fn ops(&self) -> &[Operation] {
        &self.config.proxies[self.proxy_index].rules[self.rule_index].on_response
    }

    /// Transforms one line (without its newline) and returns the
    /// framed output including the trailing newline.
    pub fn transform_line(&self, line: &str) -> String {
        if line.is_empty() {
            return "\n".to_string();
        }

        let (payload, sse) = match line.strip_prefix("data: ") {
            Some(payload) => (payload, true),
            None => (line, false),
        };

        if sse && payload == "[DONE]" {
            return format!("{line}\n");
        }

        let Ok(Value::Object(mut body)) = serde_json::from_str::<Value>(payload) else {
            // Not a JSON object: pass through unchanged.
            return format!("{line}\n");
        };

        let scope = OpScope::new(
            &self.templates,
            self.proxy_index,
            self.rule_index,
            Phase::Response,
        );
        let (modified, diff) = apply_operations(&mut body, &self.headers, self.ops(), scope);
        if modified {
            let changes_value = Value::Object(diff);
            debug!(changes = %changes_value, "streaming chunk transformed");
        }

        match serde_json::to_string(&Value::Object(body)) {
            Ok(encoded) if sse => format!("data: {encoded}\n"),
            Ok(encoded) => format!("{encoded}\n"),
            Err(err) => {
                warn!(error = %err, "failed to serialize transformed chunk");
                format!("{line}\n")
            }
        }
    }
}

/// Line-oriented transformation over an upstream byte stream.
pub struct StreamTransformer<S> {
    inner: S,
    ctx: StreamContext,
    buf: BytesMut,
    upstream_done: bool,
    failed: bool,
}

impl<S> StreamTransformer<S>
where
    S: Stream<Item = Result<Bytes, ProxyError>> + Unpin,
{
    pub fn new(inner: S, ctx: StreamContext) -> Self {
        Self {
            inner,
            ctx,
            buf: BytesMut::with_capacity(INITIAL_LINE_CAPACITY),
            upstream_done: false,
            failed: false,
        }
    }

    /// Takes `len` bytes from the buffer and transforms them as one
    /// line. `len` excludes the newline; `consume` includes it.
    fn emit_line(&mut self, len: usize, consume: usize) -> Bytes {
        let raw = self.buf.split_to(consume);
        let mut line = &raw[..len];
        // The scanner convention: a trailing carriage return belongs to
        // the frame, not the payload.
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        match std::str::from_utf8(line) {
            Ok(text) => Bytes::from(self.ctx.transform_line(text)),
            // Invalid UTF-8 passes through untouched.
            Err(_) => raw.freeze(),
        }
    }
}

impl<S> Stream for StreamTransformer<S>
where
    S: Stream<Item = Result<Bytes, ProxyError>> + Unpin,
{
    type Item = Result<Bytes, ProxyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.failed {
            return Poll::Ready(None);
        }

        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                if pos > MAX_LINE_BYTES {
                    self.failed = true;
                    return Poll::Ready(Some(Err(ProxyError::Stream(format!(
                        "streaming line exceeds {MAX_LINE_BYTES} bytes"
                    )))));
                }
                let out = self.emit_line(pos, pos + 1);
                return Poll::Ready(Some(Ok(out)));
            }

            if self.buf.len() > MAX_LINE_BYTES {
                self.failed = true;
                return Poll::Ready(Some(Err(ProxyError::Stream(format!(
                    "streaming line exceeds {MAX_LINE_BYTES} bytes"
                )))));
            }

            if self.upstream_done {
                if self.buf.is_empty() {
                    return Poll::Ready(None);
                }
                // Final line without a newline still gets transformed
                // and terminated.
                let len = self.buf.len();
                let mut out = BytesMut::from(&self.emit_line(len, len)[..]);
                if out.last() != Some(&b'\n') {
                    out.extend_from_slice(b"\n");
                }
                return Poll::Ready(Some(Ok(out.freeze())));
            }

            match ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    self.failed = true;
                    return Poll::Ready(Some(Err(err)));
                }
                None => self.upstream_done = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ready_config;
    use futures::executor::block_on;
    use futures::stream;

    const STREAM_CONFIG: &str = r#"
proxy:
  listen: "localhost:8081"
  target: "http://localhost:8080"

rules:
  - methods: POST
    paths: /v1/chat
    on_response:
      - merge:
          done: false
"#;

    fn context(headers: &[(&str, &str)]) -> StreamContext {
        let (config, templates) = ready_config(STREAM_CONFIG);
        StreamContext {
            config,
            templates,
            proxy_index: 0,
            rule_index: 0,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn collect(chunks: Vec<&'static [u8]>, ctx: StreamContext) -> Vec<Result<Bytes, ProxyError>> {
        let upstream = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, ProxyError>(Bytes::from_static(c))),
        );
        let transformer = StreamTransformer::new(upstream, ctx);
        block_on(transformer.collect::<Vec<_>>())
    }

    fn joined(results: &[Result<Bytes, ProxyError>]) -> String {
        let mut out = String::new();
        for item in results {
            out.push_str(std::str::from_utf8(item.as_ref().unwrap()).unwrap());
        }
        out
    }

    #[test]
    fn test_sse_event_transformed_and_done_preserved() {
        let results = collect(
            vec![b"data: {\"delta\":\"hi\"}\n\ndata: [DONE]\n\n"],
            context(&[("content-type", "text/event-stream")]),
        );
        assert_eq!(
            joined(&results),
            "data: {\"delta\":\"hi\",\"done\":false}\n\ndata: [DONE]\n\n"
        );
    }

    #[test]
    fn test_lines_split_across_chunks_are_reassembled() {
        let results = collect(
            vec![b"data: {\"de", b"lta\":\"h", b"i\"}\n"],
            context(&[]),
        );
        assert_eq!(joined(&results), "data: {\"delta\":\"hi\",\"done\":false}\n");
    }

    #[test]
    fn test_ndjson_lines_transformed_without_prefix() {
        let results = collect(
            vec![b"{\"response\":\"a\"}\n{\"response\":\"b\"}\n"],
            context(&[]),
        );
        assert_eq!(
            joined(&results),
            "{\"response\":\"a\",\"done\":false}\n{\"response\":\"b\",\"done\":false}\n"
        );
    }

    #[test]
    fn test_non_json_lines_pass_through() {
        let results = collect(vec![b"event: ping\nnot json\n"], context(&[]));
        assert_eq!(joined(&results), "event: ping\nnot json\n");
    }

    #[test]
    fn test_final_line_without_newline_is_flushed() {
        let results = collect(vec![b"{\"response\":\"tail\"}"], context(&[]));
        assert_eq!(joined(&results), "{\"response\":\"tail\",\"done\":false}\n");
    }

    #[test]
    fn test_crlf_lines_are_normalized() {
        let results = collect(vec![b"data: {\"delta\":\"hi\"}\r\n"], context(&[]));
        assert_eq!(joined(&results), "data: {\"delta\":\"hi\",\"done\":false}\n");
    }

    #[test]
    fn test_first_event_does_not_wait_for_later_ones() {
        // A pending-forever second chunk must not block the first line.
        let first = stream::iter(vec![Ok::<_, ProxyError>(Bytes::from_static(
            b"data: {\"delta\":\"hi\"}\n",
        ))]);
        let blocked = stream::pending::<Result<Bytes, ProxyError>>();
        let upstream = first.chain(blocked);

        let mut transformer = StreamTransformer::new(upstream, context(&[]));
        let first_item = block_on(transformer.next()).unwrap().unwrap();
        assert_eq!(
            std::str::from_utf8(&first_item).unwrap(),
            "data: {\"delta\":\"hi\",\"done\":false}\n"
        );
    }

    #[test]
    fn test_oversize_line_ends_stream_with_error() {
        let big = vec![b'a'; MAX_LINE_BYTES + 2];
        let leaked: &'static [u8] = Box::leak(big.into_boxed_slice());
        let results = collect(vec![leaked], context(&[]));
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ProxyError::Stream(_))));
    }

    #[test]
    fn test_oversize_line_with_newline_also_errors() {
        let mut big = vec![b'a'; MAX_LINE_BYTES + 2];
        big.push(b'\n');
        big.extend_from_slice(b"{\"after\":1}\n");
        let leaked: &'static [u8] = Box::leak(big.into_boxed_slice());
        let results = collect(vec![leaked], context(&[]));
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ProxyError::Stream(_))));
    }

    #[test]
    fn test_upstream_error_propagates_and_fuses() {
        let upstream = stream::iter(vec![
            Ok(Bytes::from_static(b"{\"a\":1}\n")),
            Err(ProxyError::Upstream("connection reset".into())),
        ]);
        let results = block_on(
            StreamTransformer::new(upstream, context(&[])).collect::<Vec<_>>(),
        );
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_match_headers_apply_to_streaming_chunks() {
        let yaml = r#"
proxy:
  listen: "localhost:8081"
  target: "http://localhost:8080"

rules:
  - methods: POST
    paths: /v1/chat
    on_response:
      - match_headers:
          Content-Type: event-stream
        merge:
          tagged: true
"#;
        let (config, templates) = ready_config(yaml);
        let base = StreamContext {
            config,
            templates,
            proxy_index: 0,
            rule_index: 0,
            headers: HashMap::new(),
        };

        // Without the header the operation is skipped.
        let untouched = base.transform_line("{\"a\":1}");
        assert_eq!(untouched, "{\"a\":1}\n");

        let mut with_header = base.clone();
        with_header
            .headers
            .insert("content-type".into(), "text/event-stream".into());
        let tagged = with_header.transform_line("{\"a\":1}");
        assert_eq!(tagged, "{\"a\":1,\"tagged\":true}\n");
    }
}
