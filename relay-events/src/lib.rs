//! Event gateway: binds endpoints to the broker as subscribers, and
//! installs the publish-on-completion middleware that turns every
//! invocation (through any gateway) into an outbound envelope.

use std::sync::Arc;
use std::time::Duration;

use relay_core::{
    Broker, BoxFuture, Context, Endpoint, Envelope, ErasedHandler, ErrorListener, Failure,
    FlatMap, GatewayKind, Middleware, Registry, Route, RouteInfo, Subscription,
};
use tokio_util::sync::CancellationToken;

/// Build the universal middleware that publishes exactly one envelope
/// after every invocation, success or failure, without making the caller
/// wait for the publish to land.
pub fn publish_on_completion(
    broker: Arc<dyn Broker>,
    qualified_name: String,
    publish_timeout: Duration,
    error_listener: ErrorListener,
) -> Middleware {
    Arc::new(move |inner: ErasedHandler| {
        let broker = broker.clone();
        let qualified_name = qualified_name.clone();
        let error_listener = error_listener.clone();
        let inner = inner.clone();
        Arc::new(move |ctx: Context, flat: FlatMap| {
            let broker = broker.clone();
            let qualified_name = qualified_name.clone();
            let error_listener = error_listener.clone();
            let route = ctx.route().cloned().unwrap_or_default();
            let metadata = ctx.encode();
            let request_snapshot = flat.clone();
            let inner_fut = inner(ctx, flat);

            Box::pin(async move {
                let result = inner_fut.await;

                let envelope = match &result {
                    Ok(value) => Envelope {
                        key: qualified_name.clone(),
                        route,
                        metadata,
                        values: relay_core::flatten_value(value),
                        status: None,
                        message: None,
                    },
                    Err(failure) => Envelope {
                        key: format!("{qualified_name}:Error"),
                        route,
                        metadata,
                        // The error branch carries the original request
                        // shape, not a partially formed response.
                        values: request_snapshot,
                        status: Some(failure.status()),
                        message: Some(failure.message().to_string()),
                    },
                };

                tokio::spawn(async move {
                    // Detached, fresh-root timeout: inbound request
                    // cancellation must never suppress the event.
                    let cancel = CancellationToken::new();
                    let publish = broker.publish(&cancel, envelope);
                    match tokio::time::timeout(publish_timeout, publish).await {
                        Ok(Ok(())) => {}
                        Ok(Err(failure)) => {
                            tracing::warn!(status = failure.status(), "event publish failed");
                            error_listener(failure);
                        }
                        Err(_elapsed) => {
                            cancel.cancel();
                            tracing::warn!("event publish timed out");
                            error_listener(Failure::request_timeout("event publish timed out"));
                        }
                    }
                });

                result
            }) as BoxFuture<'static, Result<serde_json::Value, Failure>>
        }) as ErasedHandler
    })
}

/// Turn a broker envelope back into a handler invocation: injects the
/// synthetic `Error.*` keys on error-branch envelopes, restores metadata,
/// installs a fresh route, and dispatches to the endpoint's composed
/// handler. Decode failures inside the handler surface as an `Err` here,
/// which the broker forwards to the error listener without redelivery.
fn delivery_handler(endpoint: Arc<Endpoint>) -> relay_core::SubscriptionHandler {
    Arc::new(move |envelope: Envelope| {
        let endpoint = endpoint.clone();
        Box::pin(async move {
            let mut values = envelope.values.clone();
            if let Some(status) = envelope.status {
                let message = envelope.message.clone().unwrap_or_default();
                for key in ["Error", "Error.Error", "Error.Message"] {
                    values.insert(key.to_string(), message.clone());
                }
                for key in ["Error.Code", "Error.Status", "Error.StatusCode", "Error.HTTPStatusCode"] {
                    values.insert(key.to_string(), status.to_string());
                }
            }

            let ctx = Context::decode(&envelope.metadata).ensure_trace_id();
            let route = RouteInfo {
                service_name: endpoint.service_name.clone(),
                name: endpoint.name.clone(),
                kind: Some(GatewayKind::Events),
                method: None,
                path: None,
                status: 0,
                roles: relay_core::resolve_roles(&endpoint.roles, &values),
            };
            let ctx = ctx.with_route(route);

            (endpoint.handler)(ctx, values).await.map(|_value| ())
        })
    })
}

/// Wires the registry's event routes to the broker: one subscription per
/// `Route::Events`, torn down together on [`EventGateway::shutdown`].
pub struct EventGateway {
    registry: Arc<Registry>,
    broker: Arc<dyn Broker>,
    publish_timeout: Duration,
    subscriptions: Vec<Subscription>,
}

impl EventGateway {
    pub fn new(registry: Arc<Registry>, broker: Arc<dyn Broker>, publish_timeout: Duration) -> Self {
        Self {
            registry,
            broker,
            publish_timeout,
            subscriptions: Vec::new(),
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    /// Every endpoint with at least one `Route::Events` is present, so
    /// the server always installs [`publish_on_completion`] even for
    /// endpoints with zero event routes of their own: cascading handlers
    /// elsewhere in the registry may still depend on this endpoint's
    /// completion event.
    pub fn event_bearing_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.registry.iter()
    }

    /// Subscribe every endpoint's event routes to the broker.
    pub async fn listen(&mut self, cancel: &CancellationToken) -> Result<(), Failure> {
        for endpoint in self.registry.iter() {
            for route in &endpoint.routes {
                let Route::Events { pattern, group } = route else {
                    continue;
                };
                let group_designator = match group.as_str() {
                    "" => Some(endpoint.qualified_name()),
                    "*" => None,
                    other => Some(other.to_string()),
                };
                let handler = delivery_handler(endpoint.clone());
                let subscription = self
                    .broker
                    .subscribe(cancel, pattern, group_designator.as_deref(), handler)
                    .await?;
                self.subscriptions.push(subscription);
            }
        }
        Ok(())
    }

    /// Close every subscription. Draining in-flight deliveries is the
    /// broker's responsibility (bounded by the caller's shutdown budget);
    /// this only stops new ones from arriving.
    pub fn shutdown(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.close();
        }
    }
}
