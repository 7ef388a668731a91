//! Core runtime shared by every gateway: failure taxonomy, value codec,
//! metadata carrier, endpoint registry and middleware pipeline, and the
//! local in-process broker.

pub mod broker;
pub mod config;
pub mod error;
pub mod meta;
pub mod registry;
pub mod values;

pub use broker::{matches, Broker, Envelope, LocalBroker, Subscription, SubscriptionHandler};
pub use config::RelayConfig;
pub use error::{status_of, tracing_error_listener, ErrorListener, Failure};
pub use meta::{generate_trace_id, Context, GatewayKind, RouteInfo};
pub use registry::{
    compose, compose_handler, merge_layers, panic_recovery, resolve_roles, BoxFuture, Endpoint,
    ErasedHandler, Middleware, PanicCallback, Registry, Route,
};
pub use values::{decode_body, decode_values, encode_body, encode_values, flatten_value, FlatMap};

/// Bridge a foreign error type into [`Failure`], the style the event and
/// HTTP gateways use for their own `From` impls. Mirrors the teacher's
/// `map_error!` macro: wraps an arbitrary `std::error::Error` as a 500
/// with the source attached for log context.
#[macro_export]
macro_rules! map_failure {
    ($err:expr) => {{
        let err = $err;
        $crate::Failure::internal(err.to_string()).with_source(err)
    }};
    ($err:expr, $status:expr) => {{
        let err = $err;
        $crate::Failure::new($status, err.to_string()).with_source(err)
    }};
}
