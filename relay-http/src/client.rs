//! RPC client: mirrors the HTTP gateway for outbound calls. Resolves
//! path placeholders from the request, forwards metadata/authorization,
//! and decodes status-based failures.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use relay_core::{encode_body, encode_values, Context, Failure, FlatMap};

use crate::response::STREAM_MARKER;

const NON_BODY_METHODS: &[&str] = &["GET", "DELETE", "HEAD"];

/// Resolve `{Field.Path}` placeholders in a path pattern against the
/// request's flattened fields, removing each resolved field from the
/// map so the remaining fields are candidates for the query string.
fn resolve_path(pattern: &str, flat: &mut FlatMap) -> String {
    let mut out = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        for c2 in chars.by_ref() {
            if c2 == '}' {
                break;
            }
            name.push(c2);
        }
        let value = flat.remove(&name).unwrap_or_default();
        out.push_str(&form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>());
    }
    out
}

fn query_string(flat: &FlatMap) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (k, v) in flat {
        serializer.append_pair(k, v);
    }
    serializer.finish()
}

/// Parse a failure out of a non-2xx response body: a `{Status,Message}`
/// object, a bare JSON string, plain text, or nothing at all.
fn decode_failure(status: u16, body: &str) -> Failure {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(body) {
        let message = obj
            .get("Message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Failure::new(status, message);
    }
    if let Ok(Value::String(s)) = serde_json::from_str::<Value>(body) {
        return Failure::new(status, s);
    }
    Failure::new(status, body.to_string())
}

/// Decode a successful response body into `Resp`. Mirrors the gateway's own
/// `render_success`: a stream response is tagged with a reserved marker
/// field, and the caller's `Resp` gets handed the raw decoded value rather
/// than going through the plain body codec.
fn decode_success_body<Resp: DeserializeOwned>(bytes: &[u8]) -> Result<Resp, Failure> {
    if !bytes.is_empty() {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            if value.get(STREAM_MARKER).and_then(Value::as_bool) == Some(true) {
                return serde_json::from_value(value).map_err(Failure::from);
            }
        }
    }
    relay_core::decode_body(bytes)
}

pub struct RpcClient {
    http: reqwest::Client,
    base_url: String,
    metadata_header: String,
}

impl RpcClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            metadata_header: "X-RPC-Metadata".to_string(),
        }
    }

    pub fn with_metadata_header(mut self, header: impl Into<String>) -> Self {
        self.metadata_header = header.into();
        self
    }

    pub async fn call<Req, Resp>(
        &self,
        ctx: &Context,
        method: &str,
        path_pattern: &str,
        request: &Req,
    ) -> Result<Resp, Failure>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut flat = encode_values(request)?;
        let path = resolve_path(path_pattern, &mut flat);
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);

        let method_upper = method.to_ascii_uppercase();
        let reqwest_method: reqwest::Method = method_upper
            .parse()
            .map_err(|_| Failure::bad_request(format!("unsupported method {method}")))?;

        let mut builder = if NON_BODY_METHODS.contains(&method_upper.as_str()) {
            let qs = query_string(&flat);
            let full_url = if qs.is_empty() { url } else { format!("{url}?{qs}") };
            self.http.request(reqwest_method, full_url)
        } else {
            let body = encode_body(request)?;
            self.http
                .request(reqwest_method, url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
        };

        let metadata = ctx.encode();
        if !metadata.is_empty() {
            builder = builder.header(&self.metadata_header, metadata);
        }
        if !ctx.authorization().is_empty() {
            builder = builder.header(reqwest::header::AUTHORIZATION, ctx.authorization());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| Failure::bad_gateway(err.to_string()).with_source(err))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| Failure::bad_gateway(err.to_string()).with_source(err))?;

        if status >= 400 {
            let body = String::from_utf8_lossy(&bytes).to_string();
            return Err(decode_failure(status, &body));
        }

        decode_success_body(&bytes)
    }
}
