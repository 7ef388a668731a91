//! Endpoint registry, role resolution, and the shared middleware pipeline
//! that makes an HTTP call and an event delivery indistinguishable to user
//! code: every endpoint is reached through the same [`ErasedHandler`].

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Failure;
use crate::meta::{Context, GatewayKind, RouteInfo};
use crate::values::{decode_values, FlatMap};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A type-erased endpoint handler: decode happens inside the closure
/// (captured at registration time, when the concrete request/response
/// types are still known), so the registry itself never needs generics.
pub type ErasedHandler =
    Arc<dyn Fn(Context, FlatMap) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync>;

/// One middleware layer: wraps an inner handler, returning a new handler.
/// Composition order follows the component design: outermost layers are
/// applied last so they run first.
pub type Middleware = Arc<dyn Fn(ErasedHandler) -> ErasedHandler + Send + Sync>;

/// One ingress binding of an endpoint.
#[derive(Debug, Clone)]
pub enum Route {
    Api {
        method: String,
        path: String,
        status: u16,
    },
    Events {
        /// Dotted pattern, optionally `*`-wildcarded, optionally `:Error`-suffixed.
        pattern: String,
        /// `""` = use the endpoint's QualifiedName as the consumer group,
        /// `"*"` = fan-out (no group), anything else names an explicit group.
        group: String,
    },
}

impl Route {
    pub fn kind(&self) -> GatewayKind {
        match self {
            Route::Api { .. } => GatewayKind::Api,
            Route::Events { .. } => GatewayKind::Events,
        }
    }
}

/// A registered service operation: a handler reachable through zero or
/// more routes, identified by `(ServiceName, Name)`.
pub struct Endpoint {
    pub service_name: String,
    pub name: String,
    pub roles: Vec<String>,
    pub routes: Vec<Route>,
    pub handler: ErasedHandler,
}

impl Endpoint {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.service_name, self.name)
    }
}

/// Walk a role pattern's dot-separated tokens, resolving any
/// brace-wrapped token (e.g. `{User.ID}`) against the flattened request.
/// Dots inside a brace span do not count as token separators, since the
/// placeholder itself is a dotted field path. Unresolvable placeholders
/// become the empty string.
fn resolve_role(pattern: &str, flat: &FlatMap) -> String {
    let mut tokens = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in pattern.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth -= 1;
                current.push(c);
            }
            '.' if depth == 0 => tokens.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    tokens.push(current);

    tokens
        .into_iter()
        .map(|token| {
            if let Some(path) = token.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
                flat.get(path).cloned().unwrap_or_default()
            } else {
                token
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Resolve every role pattern against a flattened request, for attaching
/// to the current route's metadata.
pub fn resolve_roles(patterns: &[String], flat: &FlatMap) -> Vec<String> {
    patterns.iter().map(|p| resolve_role(p, flat)).collect()
}

/// Wrap a typed async function into an [`ErasedHandler`]: decoding the
/// flat request map onto `Req` and re-encoding the `Resp` to `Value`
/// happen once, here, where the concrete types are still in scope.
pub fn compose_handler<Req, Resp, F, Fut>(strict: bool, f: F) -> ErasedHandler
where
    Req: Default + Serialize + DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Failure>> + Send + 'static,
{
    Arc::new(move |ctx: Context, flat: FlatMap| {
        let decoded: Result<Req, Failure> = decode_values(&flat, !strict);
        let out: BoxFuture<'static, Result<Value, Failure>> = match decoded {
            Ok(req) => {
                let fut = f(ctx, req);
                Box::pin(async move {
                    let resp = fut.await?;
                    serde_json::to_value(resp).map_err(Failure::from)
                })
            }
            Err(err) => Box::pin(async move { Err(err) }),
        };
        out
    })
}

/// Apply a chain of middleware to a handler, outermost first: the first
/// element of `chain` is the outermost layer and runs first.
pub fn compose(handler: ErasedHandler, chain: &[Middleware]) -> ErasedHandler {
    chain.iter().rev().fold(handler, |inner, layer| layer(inner))
}

/// Receives the failure and a captured panic message for out-of-band
/// reporting; installed on the server and defaulting to a `tracing`
/// logger.
pub type PanicCallback = Arc<dyn Fn(Failure, String) + Send + Sync>;

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The outermost layer of the shared invocation pipeline: converts any
/// panic raised by an inner layer or the user handler into a 500
/// [`Failure`], invoking the server's panic callback with the captured
/// message.
pub fn panic_recovery(panic_callback: PanicCallback) -> Middleware {
    Arc::new(move |inner: ErasedHandler| {
        let panic_callback = panic_callback.clone();
        let inner = inner.clone();
        Arc::new(move |ctx: Context, flat: FlatMap| {
            let inner = inner.clone();
            let panic_callback = panic_callback.clone();
            Box::pin(async move {
                match AssertUnwindSafe(inner(ctx, flat)).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(&*payload);
                        let failure = Failure::internal("unexpected panic");
                        panic_callback(failure.clone(), message);
                        Err(failure)
                    }
                }
            }) as BoxFuture<'static, Result<Value, Failure>>
        }) as ErasedHandler
    })
}

/// The endpoint table: immutable once the server starts, per the
/// lifecycle invariant that endpoints are registered at construction.
#[derive(Default)]
pub struct Registry {
    endpoints: DashMap<String, Arc<Endpoint>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: Endpoint) {
        self.endpoints
            .insert(endpoint.qualified_name(), Arc::new(endpoint));
    }

    pub fn get(&self, qualified_name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(qualified_name).map(|e| e.clone())
    }

    pub fn iter(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.iter().map(|e| e.value().clone()).collect()
    }

    /// Direct invoke entrypoint: installs a fresh route on the metadata
    /// context and dispatches to the registered endpoint, returning a
    /// not-found failure for unknown identifiers.
    pub fn invoke(
        &self,
        ctx: Context,
        service_name: &str,
        name: &str,
        request: FlatMap,
    ) -> BoxFuture<'static, Result<Value, Failure>> {
        let qualified = format!("{service_name}.{name}");
        match self.get(&qualified) {
            Some(endpoint) => {
                let route = RouteInfo {
                    service_name: endpoint.service_name.clone(),
                    name: endpoint.name.clone(),
                    kind: None,
                    method: None,
                    path: None,
                    status: 0,
                    roles: resolve_roles(&endpoint.roles, &request),
                };
                let ctx = ctx.with_route(route);
                (endpoint.handler)(ctx, request)
            }
            None => {
                let err = Failure::not_found(format!("no endpoint registered for {qualified}"));
                Box::pin(async move { Err(err) })
            }
        }
    }
}

/// Merge layered flat maps left-to-right (later entries win), the shared
/// building block behind HTTP's query ≺ body ≺ path precedence and the
/// event gateway's single-envelope case.
pub fn merge_layers(layers: &[&FlatMap]) -> FlatMap {
    let mut out: FlatMap = BTreeMap::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_role_substitutes_dotted_placeholder() {
        let mut flat = FlatMap::new();
        flat.insert("User.ID".into(), "42".into());
        let resolved = resolve_role("group.{User.ID}.write", &flat);
        assert_eq!(resolved, "group.42.write");
    }

    #[test]
    fn resolve_role_empty_for_unresolvable_placeholder() {
        let flat = FlatMap::new();
        let resolved = resolve_role("group.{Missing.Field}.write", &flat);
        assert_eq!(resolved, "group..write");
    }

    #[test]
    fn merge_layers_lets_later_layers_win() {
        let mut query: FlatMap = BTreeMap::new();
        query.insert("ID".into(), "456".into());
        query.insert("Name".into(), "Query".into());
        let mut path: FlatMap = BTreeMap::new();
        path.insert("ID".into(), "123".into());
        let merged = merge_layers(&[&query, &path]);
        assert_eq!(merged.get("ID").unwrap(), "123");
        assert_eq!(merged.get("Name").unwrap(), "Query");
    }

    #[tokio::test]
    async fn invoke_returns_not_found_for_unknown_endpoint() {
        let registry = Registry::new();
        let result = registry
            .invoke(Context::background(), "Svc", "Missing", FlatMap::new())
            .await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    struct Echo {
        text: String,
    }

    #[tokio::test]
    async fn panic_recovery_converts_panic_to_internal_failure() {
        let reported: Arc<std::sync::Mutex<Option<String>>> = Arc::new(std::sync::Mutex::new(None));
        let reported2 = reported.clone();
        let callback: PanicCallback = Arc::new(move |_failure, message| {
            *reported2.lock().unwrap() = Some(message);
        });
        let inner: ErasedHandler = Arc::new(|_ctx, _flat| {
            Box::pin(async { panic!("boom") })
        });
        let guarded = panic_recovery(callback)(inner);
        let result = guarded(Context::background(), FlatMap::new()).await;
        assert!(result.unwrap_err().is_internal());
        assert_eq!(reported.lock().unwrap().as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn invoke_dispatches_to_registered_handler() {
        let registry = Registry::new();
        let handler = compose_handler(true, |_ctx: Context, req: Echo| async move { Ok(req) });
        registry.register(Endpoint {
            service_name: "Svc".into(),
            name: "Echo".into(),
            roles: vec![],
            routes: vec![],
            handler,
        });
        let mut req = FlatMap::new();
        req.insert("text".into(), "hi".into());
        let result = registry
            .invoke(Context::background(), "Svc", "Echo", req)
            .await
            .unwrap();
        assert_eq!(result["text"], "hi");
    }
}
