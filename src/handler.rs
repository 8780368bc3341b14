//! Request and response pipelines.
//!
//! This module contains the per-request proxy logic: read and transform
//! the inbound body, rewrite the path, forward upstream through the
//! listener's pooled client, then transform the response — buffered for
//! JSON bodies, line-by-line for event streams and NDJSON.
//!
//! # Pipeline
//!
//! 1. Match rules by method and path
//! 2. Apply `on_request` operations of every match to the shared body
//!    map; the last `target_path` wins
//! 3. Forward with hop-by-hop headers stripped and content length
//!    recomputed
//! 4. The last matched rule owns the response transformation

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::{Request, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, error, warn};

use rulegate_core::loader::LoadedConfig;
use rulegate_core::ops::{apply_operations, OpScope};
use rulegate_core::template::Phase;
use rulegate_core::{
    matching_rules, Config, ConfigResult, JsonMap, ProxyConfig, ProxyError, StreamContext,
    StreamTransformer, TemplateSet,
};

/// Read cap for request and buffered response bodies.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Upstream connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle timeout for pooled upstream connections.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Idle connections kept per upstream host.
const POOL_MAX_IDLE_PER_HOST: usize = 5;

/// Boxed error type used by streaming response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type: either buffered bytes or a transformed stream.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// A validated config with compiled templates, shared by every listener
/// and swapped wholesale on reload.
#[derive(Debug)]
pub struct ReadyConfig {
    pub config: Arc<Config>,
    pub templates: Arc<TemplateSet>,
    /// Files that produced this config, for the reload watcher.
    pub watched_files: Vec<PathBuf>,
}

impl ReadyConfig {
    /// Compiles templates for a loaded config.
    pub fn prepare(loaded: LoadedConfig) -> ConfigResult<Self> {
        let templates = TemplateSet::compile(&loaded.config)?;
        Ok(Self {
            config: Arc::new(loaded.config),
            templates: Arc::new(templates),
            watched_files: loaded.watched_files,
        })
    }
}

/// Per-listener state handed to every request task.
pub struct ListenerState {
    pub ready: Arc<ReadyConfig>,
    pub proxy_index: usize,
    client: reqwest::Client,
}

impl ListenerState {
    /// Builds the listener's pooled upstream client.
    pub fn new(ready: Arc<ReadyConfig>, proxy_index: usize) -> Result<Self, ProxyError> {
        let timeout = ready.config.proxies[proxy_index].timeout_duration();
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(timeout)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .map_err(|err| ProxyError::Listener(format!("failed to build client: {err}")))?;
        Ok(Self {
            ready,
            proxy_index,
            client,
        })
    }

    fn proxy(&self) -> &ProxyConfig {
        &self.ready.config.proxies[self.proxy_index]
    }
}

/// Handles one inbound request through the full proxy pipeline.
///
/// Always returns `Ok`: per-request errors become error responses, never
/// process failures.
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ListenerState>,
) -> Result<Response<ProxyBody>, Infallible> {
    match process_request(req, &state).await {
        Ok(response) => Ok(response),
        Err(err) => {
            error!(error = %err, "request failed");
            Ok(error_response(&err))
        }
    }
}

async fn process_request(
    req: Request<Incoming>,
    state: &ListenerState,
) -> Result<Response<ProxyBody>, ProxyError> {
    let proxy = state.proxy();
    let (parts, body) = req.into_parts();
    let method = parts.method.as_str().to_string();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    debug!(method = %method, path = %path, "inbound request");

    let matched = matching_rules(&proxy.rules, &method, &path);
    let response_rule = matched.last().map(|(index, _)| *index);

    let original_body = read_capped(body).await?;
    let request_headers = header_map(&parts.headers);

    // The last matching rule's target_path wins; rewrites apply even
    // when the body is not transformable.
    let mut out_path = path.clone();
    for (_, rule) in &matched {
        if let Some(target_path) = &rule.target_path {
            out_path = target_path.clone();
        }
    }
    if out_path != path {
        debug!(from = %path, to = %out_path, "rewrote request path");
    }

    let out_body = transform_request_body(&original_body, &matched, &request_headers, state, proxy);

    let upstream_url = upstream_url(&proxy.target, &out_path, query.as_deref())?;
    let upstream_response = forward(state, &parts.method, &parts.headers, upstream_url, out_body)
        .await?;

    build_response(upstream_response, response_rule, state).await
}

/// Runs `on_request` operations of every matched rule against the
/// parsed body. Non-JSON bodies pass through unchanged; serialization
/// failures restore the original bytes.
fn transform_request_body(
    original: &Bytes,
    matched: &[(usize, &rulegate_core::Rule)],
    headers: &HashMap<String, String>,
    state: &ListenerState,
    proxy: &ProxyConfig,
) -> Bytes {
    if original.is_empty() {
        return original.clone();
    }

    let Ok(Value::Object(mut body_map)) = serde_json::from_slice::<Value>(original) else {
        debug!("request body is not a JSON object; passing through");
        return original.clone();
    };

    if proxy.debug {
        if let Ok(pretty) = serde_json::to_string_pretty(&Value::Object(body_map.clone())) {
            debug!(body = %pretty, "inbound request body");
        }
    }

    let mut total_diff = JsonMap::new();
    let mut any_applied = false;
    for (rule_index, rule) in matched {
        if rule.on_request.is_empty() {
            continue;
        }
        let scope = OpScope::new(
            &state.ready.templates,
            state.proxy_index,
            *rule_index,
            Phase::Request,
        );
        let (applied, diff) = apply_operations(&mut body_map, headers, &rule.on_request, scope);
        if applied {
            any_applied = true;
            total_diff.extend(diff);
        }
    }

    let total_diff_value = Value::Object(total_diff);
    match serde_json::to_vec(&Value::Object(body_map)) {
        Ok(encoded) => {
            if any_applied {
                debug!(changes = %total_diff_value, "applied request changes");
            }
            Bytes::from(encoded)
        }
        Err(err) => {
            warn!(error = %err, "failed to serialize transformed request; restoring original");
            original.clone()
        }
    }
}

/// Forwards the request upstream. Transport failures surface as 502.
async fn forward(
    state: &ListenerState,
    method: &hyper::Method,
    headers: &HeaderMap,
    url: url::Url,
    body: Bytes,
) -> Result<reqwest::Response, ProxyError> {
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| ProxyError::Upstream(format!("unsupported method {method}")))?;

    let mut builder = state.client.request(method, url);
    for (name, value) in headers {
        if name == HOST || name == CONTENT_LENGTH || is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            builder = builder.header(name.as_str(), value);
        }
    }
    if !body.is_empty() {
        builder = builder.body(body);
    }

    builder.send().await.map_err(|err| {
        if err.is_timeout() {
            ProxyError::Upstream(format!("upstream timeout: {err}"))
        } else if err.is_connect() {
            ProxyError::Upstream(format!("could not connect to upstream: {err}"))
        } else {
            ProxyError::Upstream(err.to_string())
        }
    })
}

/// Builds the client-facing response, dispatching to the streaming or
/// buffered transformation when the last matched rule has response
/// operations.
async fn build_response(
    upstream: reqwest::Response,
    response_rule: Option<usize>,
    state: &ListenerState,
) -> Result<Response<ProxyBody>, ProxyError> {
    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let content_type = upstream_headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    let transform_rule = response_rule.filter(|index| {
        !state.ready.config.proxies[state.proxy_index].rules[*index]
            .on_response
            .is_empty()
    });

    debug!(
        status = status.as_u16(),
        content_type = %content_type,
        transforming = transform_rule.is_some(),
        "upstream response"
    );

    let streaming =
        content_type.contains("text/event-stream") || content_type.contains("ndjson");

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in &upstream_headers {
        if is_hop_by_hop(name.as_str()) || name == CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }

    let body = match transform_rule {
        Some(rule_index) if streaming => {
            let ctx = StreamContext {
                config: state.ready.config.clone(),
                templates: state.ready.templates.clone(),
                proxy_index: state.proxy_index,
                rule_index,
                headers: header_map(&upstream_headers),
            };
            let upstream_stream = upstream
                .bytes_stream()
                .map_err(|err| ProxyError::Stream(err.to_string()));
            stream_body(StreamTransformer::new(upstream_stream, ctx))
        }
        Some(rule_index) if content_type.contains("application/json") => {
            let raw = read_response_capped(upstream).await?;
            let transformed = transform_response_body(&raw, rule_index, &upstream_headers, state);
            full_body(transformed)
        }
        _ => {
            // No transformation: stream upstream bytes through as-is.
            let upstream_stream = upstream
                .bytes_stream()
                .map_err(|err| ProxyError::Stream(err.to_string()));
            stream_body(upstream_stream)
        }
    };

    builder
        .body(body)
        .map_err(|err| ProxyError::Upstream(format!("failed to build response: {err}")))
}

/// Buffered response transformation with the last matched rule.
fn transform_response_body(
    original: &Bytes,
    rule_index: usize,
    headers: &HeaderMap,
    state: &ListenerState,
) -> Bytes {
    let proxy = &state.ready.config.proxies[state.proxy_index];
    let rule = &proxy.rules[rule_index];

    let Ok(Value::Object(mut body_map)) = serde_json::from_slice::<Value>(original) else {
        debug!("response body is not a JSON object; passing through");
        return original.clone();
    };

    if proxy.debug {
        if let Ok(pretty) = serde_json::to_string_pretty(&Value::Object(body_map.clone())) {
            debug!(body = %pretty, "inbound response body");
        }
    }

    let scope = OpScope::new(
        &state.ready.templates,
        state.proxy_index,
        rule_index,
        Phase::Response,
    );
    let header_values = header_map(headers);
    let (applied, diff) =
        apply_operations(&mut body_map, &header_values, &rule.on_response, scope);

    let diff_value = Value::Object(diff);
    match serde_json::to_vec(&Value::Object(body_map)) {
        Ok(encoded) => {
            if applied {
                debug!(changes = %diff_value, "applied response changes");
            }
            Bytes::from(encoded)
        }
        Err(err) => {
            warn!(error = %err, "failed to serialize transformed response; restoring original");
            original.clone()
        }
    }
}

/// Reads an inbound body up to the cap, truncating with a diagnostic
/// instead of failing.
async fn read_capped(mut body: Incoming) -> Result<Bytes, ProxyError> {
    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|err| ProxyError::BodyRead(err.to_string()))?;
        let Some(data) = frame.data_ref() else {
            continue;
        };
        if buf.len() + data.len() > MAX_BODY_BYTES {
            let room = MAX_BODY_BYTES - buf.len();
            buf.extend_from_slice(&data[..room]);
            warn!(cap = MAX_BODY_BYTES, "request body exceeds read cap; truncating");
            break;
        }
        buf.extend_from_slice(data);
    }
    Ok(buf.freeze())
}

/// Reads an upstream response body up to the cap, truncating with a
/// diagnostic instead of failing.
async fn read_response_capped(response: reqwest::Response) -> Result<Bytes, ProxyError> {
    let mut buf = BytesMut::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let data = chunk.map_err(|err| ProxyError::Upstream(err.to_string()))?;
        if buf.len() + data.len() > MAX_BODY_BYTES {
            let room = MAX_BODY_BYTES - buf.len();
            buf.extend_from_slice(&data[..room]);
            warn!(cap = MAX_BODY_BYTES, "response body exceeds read cap; truncating");
            break;
        }
        buf.extend_from_slice(&data);
    }
    Ok(buf.freeze())
}

/// One value per header name, first value wins.
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for name in headers.keys() {
        if let Some(value) = headers.get(name) {
            if let Ok(value) = value.to_str() {
                map.insert(name.as_str().to_string(), value.to_string());
            }
        }
    }
    map
}

/// Joins the target's base path with the (possibly rewritten) request
/// path and re-attaches the query string.
fn upstream_url(target: &str, path: &str, query: Option<&str>) -> Result<url::Url, ProxyError> {
    let mut url = url::Url::parse(target)
        .map_err(|err| ProxyError::Upstream(format!("invalid target URL '{target}': {err}")))?;

    let base = url.path().trim_end_matches('/');
    let joined = if base.is_empty() {
        path.to_string()
    } else {
        format!("{base}{path}")
    };
    url.set_path(&joined);
    url.set_query(query);
    Ok(url)
}

/// Headers that are connection-scoped and must not be forwarded.
fn is_hop_by_hop(header_name: &str) -> bool {
    matches!(
        header_name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Wraps buffered bytes into the shared response body type.
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes)
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Wraps a byte stream into the shared response body type.
fn stream_body<S>(stream: S) -> ProxyBody
where
    S: Stream<Item = Result<Bytes, ProxyError>> + Send + 'static,
{
    let frames = stream.map(|item| {
        item.map(Frame::data)
            .map_err(|err| -> BoxError { Box::new(err) })
    });
    StreamBody::new(frames).boxed_unsync()
}

/// Creates a plain-text error response for a failed request.
pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(CONTENT_TYPE, "text/plain")
        .body(full_body(Bytes::from(err.user_message().to_string())))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::from_static(b"Internal Server Error"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("connection"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("upgrade"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("authorization"));
    }

    #[test]
    fn test_upstream_url_replaces_path_and_keeps_query() {
        let url = upstream_url(
            "http://localhost:8080",
            "/v1/chat/completions",
            Some("stream=true"),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/v1/chat/completions?stream=true"
        );
    }

    #[test]
    fn test_upstream_url_joins_target_base_path() {
        let url = upstream_url("http://localhost:8080/base/", "/v1/chat", None).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/base/v1/chat");
    }

    #[test]
    fn test_upstream_url_invalid_target() {
        assert!(upstream_url("not a url", "/x", None).is_err());
    }

    #[test]
    fn test_header_map_first_value_wins() {
        let mut headers = HeaderMap::new();
        headers.append("x-multi", "first".parse().unwrap());
        headers.append("x-multi", "second".parse().unwrap());
        let map = header_map(&headers);
        assert_eq!(map["x-multi"], "first");
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(&ProxyError::Upstream("refused".into()));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
