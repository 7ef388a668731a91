//! Failure taxonomy: HTTP-status-tagged errors shared by every gateway.

use std::error::Error as StdError;
use std::fmt;

/// A status-tagged failure, the single error currency used by the registry,
/// the event gateway, the HTTP gateway and the RPC client.
///
/// Unlike a plain `enum`, `Failure` carries an arbitrary integer status so
/// gateway-specific or user-defined codes can flow through without adding
/// a variant.
pub struct Failure {
    status: u16,
    message: String,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Failure {
    /// Build a failure with an arbitrary status and message.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
        }
    }

    /// Attach a source error for logging. Never serialized to callers.
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

// Canonical constructors, one per status named in the spec's failure taxonomy.
macro_rules! ctor {
    ($name:ident, $pred:ident, $status:expr) => {
        impl Failure {
            #[doc = concat!("Build a ", stringify!($status), " failure.")]
            pub fn $name(message: impl Into<String>) -> Self {
                Self::new($status, message)
            }
        }
        impl Failure {
            #[doc = concat!("True iff status == ", stringify!($status), ".")]
            pub fn $pred(&self) -> bool {
                self.status == $status
            }
        }
    };
}

ctor!(bad_request, is_bad_request, 400);
ctor!(unauthorized, is_unauthorized, 401);
ctor!(payment_required, is_payment_required, 402);
ctor!(forbidden, is_forbidden, 403);
ctor!(not_found, is_not_found, 404);
ctor!(method_not_allowed, is_method_not_allowed, 405);
ctor!(request_timeout, is_request_timeout, 408);
ctor!(conflict, is_conflict, 409);
ctor!(gone, is_gone, 410);
ctor!(payload_too_large, is_payload_too_large, 413);
ctor!(unsupported_media_type, is_unsupported_media_type, 415);
ctor!(too_many_requests, is_too_many_requests, 429);
ctor!(internal, is_internal, 500);
ctor!(not_implemented, is_not_implemented, 501);
ctor!(bad_gateway, is_bad_gateway, 502);
ctor!(service_unavailable, is_service_unavailable, 503);

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("status", &self.status)
            .field("message", &self.message)
            .finish()
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_deref().map(|s| s as &(dyn StdError + 'static))
    }
}

impl Clone for Failure {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            message: self.message.clone(),
            source: None,
        }
    }
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Failure::bad_request(err.to_string())
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Failure::internal(err.to_string()).with_source(err)
    }
}

/// Probe an arbitrary error's wrap chain for a status, following
/// `source()` links. Defaults to 500 when nothing in the chain is a
/// [`Failure`].
///
/// This mirrors the spec's instruction to probe an arbitrary error for a
/// `Status`/`StatusCode`/`Code`/`HTTPStatusCode` capability: Rust has no
/// structural typing, so the probe instead downcasts each link of the
/// `std::error::Error::source()` chain to `Failure`.
pub fn status_of(err: &(dyn StdError + 'static)) -> u16 {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(failure) = e.downcast_ref::<Failure>() {
            return failure.status;
        }
        current = e.source();
    }
    500
}

/// Process-wide callback type for reporting failures that can't be
/// returned synchronously (broker delivery errors, panics, decode
/// failures in the event gateway).
pub type ErrorListener = std::sync::Arc<dyn Fn(Failure) + Send + Sync>;

/// The default error listener: logs via `tracing::error!`.
pub fn tracing_error_listener() -> ErrorListener {
    std::sync::Arc::new(|failure: Failure| {
        tracing::error!(status = failure.status(), message = %failure.message(), "unhandled failure");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_canonical_status() {
        assert_eq!(Failure::not_found("x").status(), 404);
        assert_eq!(Failure::bad_request("x").status(), 400);
        assert_eq!(Failure::too_many_requests("x").status(), 429);
        assert_eq!(Failure::not_implemented("x").status(), 501);
    }

    #[test]
    fn predicates_match_only_their_status() {
        let f = Failure::conflict("dup");
        assert!(f.is_conflict());
        assert!(!f.is_not_found());
    }

    #[test]
    fn status_of_defaults_to_500_for_plain_errors() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(status_of(&err), 500);
    }

    #[test]
    fn status_of_recovers_status_from_failure() {
        let f = Failure::forbidden("no");
        assert_eq!(status_of(&f), 403);
    }

    #[test]
    fn status_of_follows_source_chain() {
        #[derive(Debug)]
        struct Wrapper(Failure);
        impl fmt::Display for Wrapper {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "wrapped: {}", self.0)
            }
        }
        impl StdError for Wrapper {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }
        let wrapped = Wrapper(Failure::gone("bye"));
        assert_eq!(status_of(&wrapped), 410);
    }
}
