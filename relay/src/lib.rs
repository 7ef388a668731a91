//! Facade crate: wires the endpoint registry to both the event gateway
//! and the HTTP/RPC gateway behind a single `Server`/`ServerBuilder`.

use std::sync::Arc;

use relay_core::{
    compose, panic_recovery, tracing_error_listener, Endpoint, ErrorListener, Failure,
    Middleware, PanicCallback, Registry, RelayConfig, Route,
};
use relay_events::{publish_on_completion, EventGateway};
use relay_http::{build_router, HttpGatewayConfig};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the process-wide `tracing` subscriber: `RUST_LOG`-driven
/// filtering, falling back to `info`. Safe to call more than once (e.g.
/// from tests) — later calls are a no-op.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

const HEALTH_SERVICE: &str = "Relay";
const HEALTH_NAME: &str = "Health";

#[derive(Debug, Default, Serialize, Deserialize)]
struct HealthRequest;

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: &'static str,
}

fn health_endpoint() -> Endpoint {
    Endpoint {
        service_name: HEALTH_SERVICE.to_string(),
        name: HEALTH_NAME.to_string(),
        roles: vec![],
        routes: vec![Route::Api {
            method: "GET".into(),
            path: "/healthz".into(),
            status: 200,
        }],
        handler: relay_core::compose_handler(true, |_ctx, _req: HealthRequest| async move {
            Ok(HealthResponse { status: "ok" })
        }),
    }
}

fn default_panic_callback() -> PanicCallback {
    Arc::new(|failure: Failure, message: String| {
        tracing::error!(status = failure.status(), %message, "recovered panic");
    })
}

/// Accumulates endpoints and cross-cutting configuration before building
/// an immutable [`Server`]. Endpoints registered here are fixed for the
/// server's lifetime, per the registry's construction-time-immutable
/// lifecycle.
pub struct ServerBuilder {
    registry: Registry,
    middleware: Vec<Middleware>,
    error_listener: ErrorListener,
    panic_callback: PanicCallback,
    config: RelayConfig,
    install_healthz: bool,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            middleware: Vec::new(),
            error_listener: tracing_error_listener(),
            panic_callback: default_panic_callback(),
            config: RelayConfig::default(),
            install_healthz: true,
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_error_listener(mut self, listener: ErrorListener) -> Self {
        self.error_listener = listener;
        self
    }

    pub fn with_panic_callback(mut self, callback: PanicCallback) -> Self {
        self.panic_callback = callback;
        self
    }

    pub fn without_healthz(mut self) -> Self {
        self.install_healthz = false;
        self
    }

    pub fn middleware(mut self, layer: Middleware) -> Self {
        self.middleware.push(layer);
        self
    }

    pub fn register(self, endpoint: Endpoint) -> Self {
        self.registry.register(endpoint);
        self
    }

    /// Compose every endpoint's full invocation pipeline (panic recovery,
    /// publish-on-completion, user middleware, handler) once, so the HTTP
    /// gateway and the event gateway dispatch through the identical
    /// composed handler — the thing that makes an HTTP call and an event
    /// delivery indistinguishable to user code.
    pub fn build(mut self) -> Server {
        if self.install_healthz {
            self.registry.register(health_endpoint());
        }

        let broker = Arc::new(relay_core::LocalBroker::new(self.error_listener.clone()));
        let final_registry = Arc::new(Registry::new());

        for endpoint in self.registry.iter() {
            let qualified_name = endpoint.qualified_name();
            let mut chain = vec![panic_recovery(self.panic_callback.clone())];
            chain.push(publish_on_completion(
                broker.clone(),
                qualified_name,
                self.config.event.publish_timeout(),
                self.error_listener.clone(),
            ));
            chain.extend(self.middleware.iter().cloned());

            let composed = compose(endpoint.handler.clone(), &chain);
            final_registry.register(Endpoint {
                service_name: endpoint.service_name.clone(),
                name: endpoint.name.clone(),
                roles: endpoint.roles.clone(),
                routes: endpoint.routes.clone(),
                handler: composed,
            });
        }

        let http_config = HttpGatewayConfig {
            trace_header: self.config.http.trace_header.clone(),
            metadata_header: self.config.http.metadata_header.clone(),
        };
        let router = build_router(final_registry.iter(), http_config);
        let event_gateway = EventGateway::new(
            final_registry.clone(),
            broker.clone() as Arc<dyn relay_core::Broker>,
            self.config.event.publish_timeout(),
        );

        Server {
            bind_addr: self.config.http.bind_addr.clone(),
            router,
            event_gateway,
            registry: final_registry,
        }
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A built, ready-to-run server: registry is immutable from here on.
pub struct Server {
    bind_addr: String,
    router: axum::Router,
    event_gateway: EventGateway,
    registry: Arc<Registry>,
}

impl Server {
    /// Direct invoke entrypoint, bypassing both gateways.
    pub async fn invoke(
        &self,
        ctx: relay_core::Context,
        service_name: &str,
        name: &str,
        request: relay_core::FlatMap,
    ) -> Result<serde_json::Value, Failure> {
        self.registry.invoke(ctx, service_name, name, request).await
    }

    /// Subscribe every endpoint's event routes to the broker without
    /// binding the HTTP listener. Split out from [`Server::listen`] so
    /// tests and embedders can drive the event side on its own.
    pub async fn listen_events(&mut self, cancel: &CancellationToken) -> Result<(), Failure> {
        self.event_gateway.listen(cancel).await
    }

    pub fn shutdown_events(&mut self) {
        self.event_gateway.shutdown();
    }

    /// Start the event gateway's subscriptions and the HTTP listener
    /// concurrently; blocks until a shutdown signal arrives, then drains.
    pub async fn listen(mut self) -> Result<(), Failure> {
        let cancel = CancellationToken::new();
        self.listen_events(&cancel).await?;

        let listener = tokio::net::TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|err| Failure::internal(err.to_string()).with_source(err))?;

        tracing::info!(addr = %self.bind_addr, "relay listening");

        let serve = axum::serve(listener, self.router.clone());
        tokio::select! {
            result = serve => {
                if let Err(err) = result {
                    tracing::error!(%err, "http gateway stopped unexpectedly");
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
            }
        }

        cancel.cancel();
        self.event_gateway.shutdown();
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        signal.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::Context;

    #[tokio::test]
    async fn healthz_endpoint_is_auto_registered_and_invokable() {
        let server = ServerBuilder::new().build();
        let result = server
            .invoke(Context::background(), HEALTH_SERVICE, HEALTH_NAME, relay_core::FlatMap::new())
            .await
            .unwrap();
        assert_eq!(result["status"], "ok");
    }

    #[tokio::test]
    async fn without_healthz_omits_the_default_endpoint() {
        let server = ServerBuilder::new().without_healthz().build();
        let result = server
            .invoke(Context::background(), HEALTH_SERVICE, HEALTH_NAME, relay_core::FlatMap::new())
            .await;
        assert!(result.unwrap_err().is_not_found());
    }
}
