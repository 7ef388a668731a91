//! HTTP/RPC gateway: routes method+path patterns to endpoints, binds
//! query/body/path parameters onto the request with strict precedence,
//! and renders redirect/stream/JSON responses.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{RawPathParams, Request};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{options, on, MethodFilter};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};

use relay_core::{flatten_value, merge_layers, resolve_roles, Context, Endpoint, FlatMap, GatewayKind, RouteInfo, Route as CoreRoute};

use crate::response::{content_range_header, sanitize_filename, StreamResponse, REDIRECT_MARKER, STREAM_MARKER};

/// Header and routing knobs the gateway needs; kept narrow rather than
/// taking the whole `RelayConfig` so this crate doesn't need to know
/// about event-gateway settings.
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub trace_header: String,
    pub metadata_header: String,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            trace_header: "X-Request-ID".to_string(),
            metadata_header: "X-RPC-Metadata".to_string(),
        }
    }
}

const KNOWN_AUTH_SCHEMES: &[&str] = &[
    "Basic", "Bearer", "Digest", "Token", "HOBA", "Mutual", "VAPID", "SCRAM", "AWS4-HMAC-SHA256",
];

fn restore_authorization(headers: &HeaderMap) -> String {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            return s.to_string();
        }
    }
    for value in headers.get_all("sec-websocket-protocol") {
        let Ok(s) = value.to_str() else { continue };
        let Some(rest) = s.strip_prefix("Authorization.") else { continue };
        if let Some((scheme, payload)) = rest.split_once('.') {
            if KNOWN_AUTH_SCHEMES.contains(&scheme) {
                return format!("{scheme} {payload}");
            }
        }
        return rest.to_string();
    }
    String::new()
}

fn snapshot_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
        .collect()
}

fn method_filter(method: &str) -> MethodFilter {
    match method.to_ascii_uppercase().as_str() {
        "GET" => MethodFilter::GET,
        "POST" => MethodFilter::POST,
        "PUT" => MethodFilter::PUT,
        "PATCH" => MethodFilter::PATCH,
        "DELETE" => MethodFilter::DELETE,
        "HEAD" => MethodFilter::HEAD,
        _ => MethodFilter::GET,
    }
}

fn failure_response(failure: &relay_core::Failure) -> Response {
    let status = StatusCode::from_u16(failure.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({ "Status": failure.status(), "Message": failure.message() });
    (status, axum::Json(body)).into_response()
}

async fn handle_api_route(
    endpoint: Arc<Endpoint>,
    method: String,
    path_pattern: String,
    status: u16,
    config: Arc<HttpGatewayConfig>,
    path_params: RawPathParams,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let headers = parts.headers.clone();

    let query_flat: FlatMap = parts
        .uri
        .query()
        .map(|q| {
            form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };
    let body_json: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };
    let body_flat = flatten_value(&body_json);

    let path_flat: FlatMap = path_params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    // Strict precedence, weakest first: query ≺ body ≺ path.
    let merged = merge_layers(&[&query_flat, &body_flat, &path_flat]);

    let metadata_header = headers
        .get(&config.metadata_header)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let mut ctx = Context::decode(metadata_header);
    ctx = ctx.with_headers(snapshot_headers(&headers));

    if let Some(trace) = headers.get(&config.trace_header).and_then(|v| v.to_str().ok()) {
        if !trace.is_empty() {
            ctx = ctx.with_trace_id(trace);
        }
    }
    ctx = ctx.ensure_trace_id();

    let authorization = restore_authorization(&headers);
    if !authorization.is_empty() {
        ctx = ctx.with_authorization(authorization);
    }

    let route = RouteInfo {
        service_name: endpoint.service_name.clone(),
        name: endpoint.name.clone(),
        kind: Some(GatewayKind::Api),
        method: Some(method),
        path: Some(path_pattern),
        status,
        roles: resolve_roles(&endpoint.roles, &merged),
    };
    ctx = ctx.with_route(route);

    let result = (endpoint.handler)(ctx, merged).await;
    match result {
        Ok(value) => render_success(&value, status),
        Err(failure) => failure_response(&failure),
    }
}

fn render_success(value: &Value, status: u16) -> Response {
    if value.get(REDIRECT_MARKER).and_then(Value::as_bool) == Some(true) {
        let url = value.get("url").and_then(Value::as_str).unwrap_or_default();
        let permanent = value.get("permanent").and_then(Value::as_bool).unwrap_or(false);
        let code = if permanent {
            StatusCode::PERMANENT_REDIRECT
        } else {
            StatusCode::TEMPORARY_REDIRECT
        };
        return Response::builder()
            .status(code)
            .header(axum::http::header::LOCATION, url)
            .body(axum::body::Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    if value.get(STREAM_MARKER).and_then(Value::as_bool) == Some(true) {
        if let Ok(stream) = serde_json::from_value::<StreamResponse>(value.clone()) {
            return render_stream(stream);
        }
    }

    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    (code, axum::Json(value.clone())).into_response()
}

fn render_stream(stream: StreamResponse) -> Response {
    let content_type = stream
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, content_type)
        .header(axum::http::header::CONTENT_LENGTH, stream.bytes.len().to_string());

    if let Some(range) = stream.range {
        response = response.header("Content-Range", content_range_header(range));
    }
    if let Some(filename) = &stream.filename {
        let sanitized = sanitize_filename(filename);
        response = response.header(
            axum::http::header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{sanitized}\""),
        );
    }

    response
        .body(axum::body::Body::from(stream.bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Build the axum router for every `Route::Api` in the registry. Each
/// distinct path also gets an `OPTIONS` route registered once (duplicate
/// registrations across methods sharing a path are a benign no-op) so
/// CORS preflight middleware can intercept before the router would
/// otherwise 405.
pub fn build_router(endpoints: Vec<Arc<Endpoint>>, config: HttpGatewayConfig) -> Router {
    let config = Arc::new(config);
    let mut router = Router::new();
    let mut options_registered: HashSet<String> = HashSet::new();

    for endpoint in endpoints {
        for route in &endpoint.routes {
            let CoreRoute::Api { method, path, status } = route else {
                continue;
            };
            let endpoint = endpoint.clone();
            let config = config.clone();
            let method_owned = method.clone();
            let path_owned = path.clone();
            let status = *status;

            router = router.route(
                path,
                on(method_filter(method), move |path_params: RawPathParams, request: Request| {
                    let endpoint = endpoint.clone();
                    let config = config.clone();
                    let method_owned = method_owned.clone();
                    let path_owned = path_owned.clone();
                    async move {
                        handle_api_route(endpoint, method_owned, path_owned, status, config, path_params, request)
                            .await
                    }
                }),
            );

            if options_registered.insert(path.clone()) {
                router = router.route(path, options(|| async { StatusCode::NO_CONTENT }));
            }
        }
    }

    router
}
