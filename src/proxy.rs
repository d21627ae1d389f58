// LibertAI gateway — proxy engine
//
// POST /{*path}: authenticate (API key or x402 payment), pick a replica
// for the requested model, forward the raw body, and relay the response
// back — streamed chunk-by-chunk for SSE, buffered otherwise. Under the
// round-robin policy, connection-class failures advance to the next
// candidate; any other failure is fatal for the request.

use std::collections::HashMap;
use std::error::Error as StdError;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use cookie::{Cookie, SameSite};
use serde::Deserialize;
use serde_json::Value;

use crate::api_keys::bearer_token;
use crate::config::{Replica, RoutingStrategy};
use crate::selection::weighted_choice;
use crate::state::AppState;
use crate::x402;

pub const PREFERRED_INSTANCES_COOKIE: &str = "preferred_instances";
const AFFINITY_COOKIE_MAX_AGE_SECS: i64 = 1800;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Request-fatal proxy errors, mapped onto the client-facing contract.
/// Full detail is logged server-side; the response body carries the
/// stable message clients and monitors match on.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    BadRequest(&'static str),

    #[error("No server available for model {0}")]
    NoServerAvailable(String),

    #[error("All servers unavailable for model {0}")]
    AllServersUnavailable(String),

    #[error("Missing or invalid API key")]
    Unauthorized,

    #[error("X-PAYMENT header is required")]
    PaymentRequired(Vec<Value>),

    #[error("Error forwarding request to {url}: {source}")]
    Upstream {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if let ProxyError::PaymentRequired(accepts) = &self {
            return (
                StatusCode::PAYMENT_REQUIRED,
                [(header::WWW_AUTHENTICATE, x402::PAYMENT_HEADER)],
                Json(x402::payment_required_body(accepts)),
            )
                .into_response();
        }

        let status = match &self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::NoServerAvailable(_) => StatusCode::NOT_FOUND,
            ProxyError::AllServersUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            ProxyError::Upstream { .. } | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!("proxy: {self}");
        } else {
            tracing::warn!("proxy: {self}");
        }

        (status, self.to_string()).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request envelope
// ---------------------------------------------------------------------------

/// The minimum we parse out of the body. Everything else stays opaque —
/// the original bytes are forwarded, never re-serialized.
#[derive(Debug, Deserialize)]
pub struct ProxyEnvelope {
    pub model: String,
    #[serde(default)]
    pub prefer_gpu: bool,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_completion_tokens: Option<u64>,
    #[serde(default)]
    pub messages: Option<Value>,
}

// ---------------------------------------------------------------------------
// Affinity cookie
// ---------------------------------------------------------------------------

/// Parse the client's `preferred_instances` cookie into a model → replica
/// URL map. The contents are a hint only; anything malformed reads as
/// empty.
pub fn read_affinity(headers: &HeaderMap) -> HashMap<String, String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for part in raw.split(';') {
            let Ok(parsed) = Cookie::parse_encoded(part.trim()) else {
                continue;
            };
            if parsed.name() != PREFERRED_INSTANCES_COOKIE {
                continue;
            }
            return serde_json::from_str(parsed.value()).unwrap_or_default();
        }
    }
    HashMap::new()
}

/// Serialize the affinity map into a `Set-Cookie` value.
pub fn encode_affinity_cookie(affinity: &HashMap<String, String>) -> String {
    let json = serde_json::to_string(affinity).unwrap_or_else(|_| "{}".to_string());
    Cookie::build((PREFERRED_INSTANCES_COOKIE, json))
        .max_age(cookie::time::Duration::seconds(AFFINITY_COOKIE_MAX_AGE_SECS))
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .build()
        .encoded()
        .to_string()
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/{path}",
    tag = "proxy",
    params(("path" = String, Path, description = "Upstream completion path, e.g. v1/chat/completions")),
    responses(
        (status = 200, description = "Upstream response, mirrored"),
        (status = 401, description = "Missing or invalid API key"),
        (status = 402, description = "Payment required (x402 challenge)"),
        (status = 404, description = "Unknown model or no server available"),
        (status = 500, description = "Upstream failure"),
        (status = 503, description = "All replicas unreachable"),
    )
)]
pub async fn proxy_request(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| ProxyError::BadRequest("failed to read request body"))?;

    let envelope: ProxyEnvelope = serde_json::from_slice(&body_bytes)
        .map_err(|_| ProxyError::BadRequest("request body must be JSON with a 'model' field"))?;
    let model = envelope.model.to_lowercase();

    let Some(replicas) = state.config.models.get(&model) else {
        return Err(ProxyError::NoServerAvailable(model));
    };

    authorize(&state, &model, &envelope, &parts.headers, &path).await?;

    let affinity = read_affinity(&parts.headers);
    let preferred = affinity.get(&model).map(String::as_str);

    let request_path = format!("/{path}");
    let pool: Vec<Replica> = replicas
        .iter()
        .filter(|r| r.supports_path(&request_path))
        .cloned()
        .collect();
    if pool.is_empty() {
        return Err(ProxyError::NoServerAvailable(model));
    }

    let candidates = select_candidates(&state, &model, &pool, preferred, envelope.prefer_gpu).await;
    if candidates.is_empty() {
        return Err(ProxyError::NoServerAvailable(model));
    }

    forward(&state, &model, &path, parts.uri.query(), &parts.headers, body_bytes, &candidates, affinity).await
}

/// Ordered candidate URLs under the configured strategy. Round-robin
/// yields the whole rotated list (the failover walk); the other
/// strategies yield a single best candidate.
async fn select_candidates(
    state: &AppState,
    model: &str,
    pool: &[Replica],
    preferred: Option<&str>,
    prefer_gpu: bool,
) -> Vec<String> {
    match state.config.routing_strategy {
        RoutingStrategy::RoundRobin => state
            .selector
            .rotate(model, pool, preferred)
            .into_iter()
            .map(|r| r.url.clone())
            .collect(),
        RoutingStrategy::LeastBusy => match state.health.get_least_busy(model, preferred).await {
            Some(url) if pool.iter().any(|r| r.url == url) => vec![url],
            _ => Vec::new(),
        },
        RoutingStrategy::Weighted => {
            let healthy = state.health.healthy_model_urls().await;
            let healthy_urls = healthy.get(model);
            let healthy_pool: Vec<&Replica> = pool
                .iter()
                .filter(|r| healthy_urls.is_some_and(|urls| urls.contains(&r.url)))
                .collect();
            weighted_choice(&healthy_pool, prefer_gpu)
                .map(|r| vec![r.url.clone()])
                .unwrap_or_default()
        }
    }
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// Exactly one path decides admission: API-key membership, or x402
/// verification — never both.
async fn authorize(
    state: &AppState,
    model: &str,
    envelope: &ProxyEnvelope,
    headers: &HeaderMap,
    path: &str,
) -> Result<(), ProxyError> {
    if let Some(token) = bearer_token(headers) {
        if state.keys.contains(token).await {
            return Ok(());
        }
    }

    // No valid key — the model must be x402-eligible to continue.
    let Some(entry) = state.prices.get(model).await else {
        return Err(ProxyError::Unauthorized);
    };

    let messages = envelope.messages.clone().unwrap_or_else(|| Value::Array(Vec::new()));
    let requested_max_tokens = envelope.max_tokens.or(envelope.max_completion_tokens);
    let max_price = x402::compute_max_price(&entry, &messages, requested_max_tokens)
        .await
        .map_err(|e| ProxyError::Internal(format!("price computation failed: {e}")))?;

    let resource = resource_url(headers, path);
    let accepts = x402::fetch_accepts(state, model, max_price, &resource)
        .await
        .map_err(|e| ProxyError::Internal(format!("failed to fetch payment requirements: {e}")))?;

    let payment = headers.get(x402::PAYMENT_HEADER).and_then(|v| v.to_str().ok());
    if let Some(payment) = payment {
        if x402::verify_payment(state, payment, &accepts[0]).await {
            return Ok(());
        }
    }
    Err(ProxyError::PaymentRequired(accepts))
}

fn resource_url(headers: &HeaderMap, path: &str) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("https://{host}/{path}")
}

// ---------------------------------------------------------------------------
// Forwarding & relay
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn forward(
    state: &AppState,
    model: &str,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body_bytes: axum::body::Bytes,
    candidates: &[String],
    affinity: HashMap<String, String>,
) -> Result<Response, ProxyError> {
    for (attempt, replica_url) in candidates.iter().enumerate() {
        let mut upstream_url = format!("{replica_url}/{path}");
        if let Some(q) = query {
            upstream_url.push('?');
            upstream_url.push_str(q);
        }

        let mut builder = state.client.post(&upstream_url);
        for (name, value) in headers {
            if *name == header::HOST || *name == header::CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name, value);
        }

        match builder.body(body_bytes.clone()).send().await {
            Ok(response) => {
                if attempt > 0 {
                    tracing::info!(
                        "proxy: model {model} served by {replica_url} after {attempt} failed attempt(s)"
                    );
                }
                return relay(response, model, replica_url, affinity).await;
            }
            Err(e) if is_connection_error(&e) => {
                tracing::warn!("proxy: connection to {replica_url} failed, trying next candidate: {e}");
            }
            Err(e) => {
                return Err(ProxyError::Upstream {
                    url: upstream_url,
                    source: e,
                });
            }
        }
    }

    Err(ProxyError::AllServersUnavailable(model.to_string()))
}

/// Mirror the upstream response. SSE bodies are relayed in arrival order
/// without buffering — dropping the stream (client disconnect) closes
/// the upstream connection. Everything else is buffered into a single
/// response. The affinity cookie always names the replica that actually
/// produced the response.
async fn relay(
    response: reqwest::Response,
    model: &str,
    replica_url: &str,
    mut affinity: HashMap<String, String>,
) -> Result<Response, ProxyError> {
    let status = response.status();
    let upstream_headers = response.headers().clone();

    affinity.insert(model.to_string(), replica_url.to_string());
    let cookie_value = encode_affinity_cookie(&affinity);

    let is_event_stream = upstream_headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    let mut builder = Response::builder().status(status);
    for (name, value) in &upstream_headers {
        if skip_relay_header(name) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(header::SET_COOKIE, cookie_value.as_str());

    let body = if is_event_stream {
        Body::from_stream(response.bytes_stream())
    } else {
        let bytes = response.bytes().await.map_err(|e| ProxyError::Upstream {
            url: replica_url.to_string(),
            source: e,
        })?;
        Body::from(bytes)
    };

    builder
        .body(body)
        .map_err(|e| ProxyError::Internal(format!("failed to build relay response: {e}")))
}

// Hop-by-hop headers are not forwarded; axum recomputes framing.
fn skip_relay_header(name: &HeaderName) -> bool {
    *name == header::CONNECTION || *name == header::TRANSFER_ENCODING || *name == header::CONTENT_LENGTH
}

/// Connection-class failures are retryable against the next candidate:
/// connect timeouts, refused/reset connections, TLS handshake failures,
/// pool-acquire and overall timeouts. Anything else is fatal for the
/// request.
fn is_connection_error(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            );
        }
        source = cause.source();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn affinity_cookie_round_trip() {
        let affinity = map(&[
            ("m1", "https://hermes-1.example.com"),
            ("m2", "https://hermes-2.example.com"),
        ]);

        let set_cookie = encode_affinity_cookie(&affinity);
        assert!(set_cookie.starts_with("preferred_instances="));
        assert!(set_cookie.contains("Max-Age=1800"));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Secure"));
        assert!(set_cookie.contains("SameSite=Lax"));
        assert!(set_cookie.contains("Path=/"));

        // A browser sends back name=value verbatim.
        let pair = set_cookie.split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(pair).unwrap());

        assert_eq!(read_affinity(&headers), affinity);
    }

    #[test]
    fn affinity_round_trips_empty_map() {
        let affinity = HashMap::new();
        let set_cookie = encode_affinity_cookie(&affinity);
        let pair = set_cookie.split(';').next().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(pair).unwrap());
        assert_eq!(read_affinity(&headers), affinity);
    }

    #[test]
    fn malformed_affinity_cookie_reads_as_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("preferred_instances=not-json"),
        );
        assert!(read_affinity(&headers).is_empty());

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("other=1"));
        assert!(read_affinity(&headers).is_empty());

        assert!(read_affinity(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn affinity_cookie_found_among_other_cookies() {
        let affinity = map(&[("m1", "https://a.example.com")]);
        let pair = encode_affinity_cookie(&affinity);
        let pair = pair.split(';').next().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("session=abc; {pair}; theme=dark")).unwrap(),
        );
        assert_eq!(read_affinity(&headers), affinity);
    }

    #[test]
    fn envelope_parses_minimum_fields() {
        let envelope: ProxyEnvelope =
            serde_json::from_str(r#"{"model": "M1", "prompt": "hi", "temperature": 0.7}"#).unwrap();
        assert_eq!(envelope.model, "M1");
        assert!(!envelope.prefer_gpu);
        assert_eq!(envelope.max_tokens, None);

        assert!(serde_json::from_str::<ProxyEnvelope>(r#"{"prompt": "hi"}"#).is_err());
    }

    #[test]
    fn skip_relay_headers() {
        assert!(skip_relay_header(&header::CONNECTION));
        assert!(skip_relay_header(&header::TRANSFER_ENCODING));
        assert!(skip_relay_header(&header::CONTENT_LENGTH));
        assert!(!skip_relay_header(&header::CONTENT_TYPE));
        assert!(!skip_relay_header(&header::SET_COOKIE));
    }
}
