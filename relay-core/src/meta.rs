//! Metadata carrier: per-invocation context values that cross gateway and
//! service-to-service boundaries, plus the current-route and inbound
//! header snapshots that stay purely local.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::Failure;

const TRACE_ID_LEN: usize = 24;
const TRACE_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Which gateway kind an endpoint's route is reachable through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    Api,
    Events,
}

/// Snapshot of the route currently handling an invocation, exposed to
/// middleware (role resolution, auth, tracing).
#[derive(Debug, Clone, Default)]
pub struct RouteInfo {
    pub service_name: String,
    pub name: String,
    pub kind: Option<GatewayKind>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status: u16,
    pub roles: Vec<String>,
}

impl RouteInfo {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.service_name, self.name)
    }
}

enum ValueSlot {
    /// Only the JSON right-hand side has arrived (e.g. decoded from a wire
    /// header); no reader has supplied a concrete type yet.
    Raw(Value),
    /// A reader has materialized a concrete `T`; the raw JSON is kept
    /// alongside so a *different* `T` requested later can still decode.
    Materialized { raw: Value, any: Arc<dyn Any + Send + Sync> },
}

impl Clone for ValueSlot {
    fn clone(&self) -> Self {
        match self {
            ValueSlot::Raw(v) => ValueSlot::Raw(v.clone()),
            ValueSlot::Materialized { raw, any } => ValueSlot::Materialized {
                raw: raw.clone(),
                any: any.clone(),
            },
        }
    }
}

impl ValueSlot {
    fn raw(&self) -> &Value {
        match self {
            ValueSlot::Raw(v) => v,
            ValueSlot::Materialized { raw, .. } => raw,
        }
    }
}

/// Shared, reference-counted store for typed values.
///
/// Deliberately shared (not copy-on-write) across every `Context` derived
/// from a common ancestor: the spec calls for same-process call chains to
/// observe values set by descendants, which is a known deviation from
/// pure immutable context semantics.
type SharedValues = Arc<DashMap<String, ValueSlot>>;

/// Per-invocation context: authorization, trace id, a shared typed-value
/// map, and (locally only) the current route and inbound header snapshot.
///
/// `authorization`, `trace_id`, `route` and `headers` are copy-on-write:
/// each `with_*` call returns a derived `Context` without mutating the
/// original. `values` is the one deliberately shared slot — see
/// [`SharedValues`].
#[derive(Clone)]
pub struct Context {
    authorization: String,
    trace_id: String,
    values: SharedValues,
    route: Option<RouteInfo>,
    headers: Option<Arc<std::collections::BTreeMap<String, String>>>,
}

impl Context {
    /// The empty, background-rooted context.
    pub fn background() -> Self {
        Self {
            authorization: String::new(),
            trace_id: String::new(),
            values: Arc::new(DashMap::new()),
            route: None,
            headers: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.authorization.is_empty() && self.trace_id.is_empty() && self.values.is_empty()
    }

    pub fn authorization(&self) -> &str {
        &self.authorization
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn route(&self) -> Option<&RouteInfo> {
        self.route.as_ref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|h| h.get(&name.to_ascii_lowercase()))
            .map(|s| s.as_str())
    }

    pub fn with_authorization(&self, authorization: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.authorization = authorization.into();
        next
    }

    pub fn with_trace_id(&self, trace_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.trace_id = trace_id.into();
        next
    }

    pub fn with_route(&self, route: RouteInfo) -> Self {
        let mut next = self.clone();
        next.route = Some(route);
        next
    }

    pub fn with_headers(&self, headers: std::collections::BTreeMap<String, String>) -> Self {
        let mut next = self.clone();
        next.headers = Some(Arc::new(
            headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        ));
        next
    }

    /// Restore or generate a trace id. A no-op if one is already present.
    pub fn ensure_trace_id(&self) -> Self {
        if !self.trace_id.is_empty() {
            return self.clone();
        }
        self.with_trace_id(generate_trace_id())
    }

    /// Set a typed value. Visible to every `Context` sharing this one's
    /// `values` map, including ones already derived from it.
    pub fn set_value<T: Serialize + Send + Sync + 'static>(
        &self,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), Failure> {
        let raw = serde_json::to_value(&value)?;
        self.values.insert(
            key.into(),
            ValueSlot::Materialized {
                raw,
                any: Arc::new(value),
            },
        );
        Ok(())
    }

    /// Read a typed value, decoding lazily from the cached raw JSON on
    /// first read of this concrete `T` and caching the materialized value
    /// thereafter. Returns `None` if the key is absent or doesn't decode
    /// as `T`.
    pub fn get_value<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let mut slot = self.values.get_mut(key)?;
        if let ValueSlot::Materialized { any, .. } = &*slot {
            if let Some(typed) = any.downcast_ref::<T>() {
                return Some(typed.clone());
            }
        }
        let raw = slot.raw().clone();
        let typed: T = serde_json::from_value(raw.clone()).ok()?;
        *slot = ValueSlot::Materialized {
            raw,
            any: Arc::new(typed.clone()),
        };
        Some(typed)
    }

    fn values_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for entry in self.values.iter() {
            let mut wrapper = serde_json::Map::new();
            wrapper.insert("value".to_string(), entry.value().raw().clone());
            map.insert(entry.key().clone(), Value::Object(wrapper));
        }
        Value::Object(map)
    }

    /// Encode to the compact wire payload carried by `X-RPC-Metadata`.
    /// An entirely empty context encodes to the empty string, signaling
    /// "omit the header".
    pub fn encode(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut payload = serde_json::Map::new();
        if !self.authorization.is_empty() {
            payload.insert(
                "Authorization".to_string(),
                Value::String(self.authorization.clone()),
            );
        }
        if !self.trace_id.is_empty() {
            payload.insert("TraceID".to_string(), Value::String(self.trace_id.clone()));
        }
        if !self.values.is_empty() {
            payload.insert("Values".to_string(), self.values_json());
        }
        Value::Object(payload).to_string()
    }

    /// Decode from the wire payload. Never fails: empty or malformed
    /// input yields a background-rooted context with empty slots.
    pub fn decode(raw: &str) -> Self {
        if raw.is_empty() || raw == "{}" {
            return Self::background();
        }
        let Ok(Value::Object(payload)) = serde_json::from_str::<Value>(raw) else {
            return Self::background();
        };
        let mut ctx = Self::background();
        if let Some(Value::String(auth)) = payload.get("Authorization") {
            ctx.authorization = auth.clone();
        }
        if let Some(Value::String(trace)) = payload.get("TraceID") {
            ctx.trace_id = trace.clone();
        }
        if let Some(Value::Object(values)) = payload.get("Values") {
            for (key, wrapped) in values {
                let raw_value = wrapped
                    .as_object()
                    .and_then(|m| m.get("value"))
                    .cloned()
                    .unwrap_or(Value::Null);
                ctx.values.insert(key.clone(), ValueSlot::Raw(raw_value));
            }
        }
        ctx
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

/// Generate a 24-character alphanumeric trace id.
pub fn generate_trace_id() -> String {
    let mut rng = rand::thread_rng();
    (0..TRACE_ID_LEN)
        .map(|_| TRACE_ID_ALPHABET[rng.gen_range(0..TRACE_ID_ALPHABET.len())] as char)
        .collect()
}
