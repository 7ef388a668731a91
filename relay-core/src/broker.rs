//! Local in-process broker: wildcard topic matching with round-robin
//! consumer groups, grounded in the same detached-dispatch contract a
//! distributed broker driver would have to honor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::{ErrorListener, Failure};
use crate::meta::RouteInfo;
use crate::registry::BoxFuture;
use crate::values::FlatMap;

/// The unit passed through the broker: a published or delivered message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub key: String,
    pub route: RouteInfo,
    /// Opaque encoded metadata (the `Context::encode()` wire form).
    pub metadata: String,
    pub values: FlatMap,
    pub status: Option<u16>,
    pub message: Option<String>,
}

impl Envelope {
    pub fn is_error(&self) -> bool {
        self.status.is_some()
    }
}

/// A subscriber's delivery callback. Invoked on a fresh task with no
/// relation to the publisher's cancellation — see [`LocalBroker::publish`].
pub type SubscriptionHandler =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<(), Failure>> + Send + Sync>;

/// Publisher/Subscriber contract. Takes the context-bearing form on both
/// operations per the canonical resolution of the two drivers' diverging
/// signatures: cancellation is modeled separately from the metadata
/// carrier (`Context` in [`crate::meta`]), since Rust splits what a single
/// Go `context.Context` would otherwise conflate.
pub trait Broker: Send + Sync {
    fn publish(&self, cancel: &CancellationToken, envelope: Envelope) -> BoxFuture<'_, Result<(), Failure>>;

    fn subscribe(
        &self,
        cancel: &CancellationToken,
        pattern: &str,
        group: Option<&str>,
        handler: SubscriptionHandler,
    ) -> BoxFuture<'_, Result<Subscription, Failure>>;
}

/// Token sequences match iff they have equal length and, position by
/// position, are equal or either side is `*`.
pub fn matches(pattern: &str, key: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let key_tokens: Vec<&str> = key.split('.').collect();
    if pattern_tokens.len() != key_tokens.len() {
        return false;
    }
    pattern_tokens
        .iter()
        .zip(key_tokens.iter())
        .all(|(p, k)| *p == "*" || *k == "*" || p == k)
}

#[derive(Eq, PartialEq, Hash, Clone)]
struct GroupKey {
    pattern: String,
    group: String,
}

struct Member {
    id: u64,
    handler: SubscriptionHandler,
}

#[derive(Default)]
struct ConsumerGroup {
    members: Vec<Member>,
    cursor: usize,
}

struct Shared {
    groups: Mutex<HashMap<GroupKey, ConsumerGroup>>,
    next_id: AtomicU64,
    error_listener: ErrorListener,
}

/// The in-process broker. Cheap to clone; every clone shares the same
/// group table.
#[derive(Clone)]
pub struct LocalBroker {
    shared: Arc<Shared>,
}

impl LocalBroker {
    pub fn new(error_listener: ErrorListener) -> Self {
        Self {
            shared: Arc::new(Shared {
                groups: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                error_listener,
            }),
        }
    }

    fn dispatch_one(&self, member_id: u64, handler: SubscriptionHandler, envelope: Envelope) {
        let listener = self.shared.error_listener.clone();
        tokio::spawn(async move {
            // A fresh task, detached from the publisher: the local broker
            // must behave like a distributed one regardless of the
            // publisher's own lifetime or cancellation.
            let inner = tokio::spawn(async move { handler(envelope).await });
            match inner.await {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => {
                    tracing::warn!(member_id, status = failure.status(), "broker delivery failed");
                    listener(failure);
                }
                Err(join_err) => {
                    let message = if join_err.is_panic() {
                        "subscriber handler panicked".to_string()
                    } else {
                        join_err.to_string()
                    };
                    tracing::warn!(member_id, %message, "broker delivery task failed");
                    listener(Failure::internal(message));
                }
            }
        });
    }
}

impl Broker for LocalBroker {
    fn publish(&self, cancel: &CancellationToken, envelope: Envelope) -> BoxFuture<'_, Result<(), Failure>> {
        if cancel.is_cancelled() {
            return Box::pin(async { Err(Failure::internal("publish canceled")) });
        }
        let key = envelope.key.clone();
        let mut dispatches: Vec<(u64, SubscriptionHandler)> = Vec::new();
        {
            let mut groups = self.shared.groups.lock().expect("broker group lock poisoned");
            for (group_key, group) in groups.iter_mut() {
                if !matches(&group_key.pattern, &key) || group.members.is_empty() {
                    continue;
                }
                let member = &group.members[group.cursor];
                dispatches.push((member.id, member.handler.clone()));
                group.cursor = (group.cursor + 1) % group.members.len();
            }
        }
        for (id, handler) in dispatches {
            self.dispatch_one(id, handler, envelope.clone());
        }
        Box::pin(async { Ok(()) })
    }

    fn subscribe(
        &self,
        cancel: &CancellationToken,
        pattern: &str,
        group: Option<&str>,
        handler: SubscriptionHandler,
    ) -> BoxFuture<'_, Result<Subscription, Failure>> {
        if cancel.is_cancelled() {
            return Box::pin(async { Err(Failure::internal("subscribe canceled")) });
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        // An ungrouped subscriber is isolated into a uniquely-named
        // internal group so it fires on every matching publish
        // independent of any other subscriber.
        let group_name = group
            .map(str::to_string)
            .unwrap_or_else(|| format!("__solo_{id}"));
        let key = GroupKey {
            pattern: pattern.to_string(),
            group: group_name.clone(),
        };
        {
            let mut groups = self.shared.groups.lock().expect("broker group lock poisoned");
            groups
                .entry(key.clone())
                .or_default()
                .members
                .push(Member { id, handler });
        }
        let subscription = Subscription {
            id,
            key,
            shared: self.shared.clone(),
        };
        Box::pin(async move { Ok(subscription) })
    }
}

/// A live subscription. Dropping it does not unsubscribe; call
/// [`Subscription::close`] explicitly, matching the gateway's tear-down
/// sequence on shutdown.
pub struct Subscription {
    id: u64,
    key: GroupKey,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Remove this subscription from its group, wrapping the cursor to
    /// zero if it now points past the end.
    pub fn close(&self) {
        let mut groups = self.shared.groups.lock().expect("broker group lock poisoned");
        if let Some(group) = groups.get_mut(&self.key) {
            group.members.retain(|m| m.id != self.id);
            if group.members.is_empty() {
                group.cursor = 0;
            } else if group.cursor >= group.members.len() {
                group.cursor = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::tracing_error_listener;
    use std::sync::atomic::AtomicUsize;

    fn envelope(key: &str) -> Envelope {
        Envelope {
            key: key.to_string(),
            route: RouteInfo::default(),
            metadata: String::new(),
            values: FlatMap::new(),
            status: None,
            message: None,
        }
    }

    #[test]
    fn matches_requires_equal_token_count() {
        assert!(!matches("Foo", "Foo.Bar"));
        assert!(matches("Foo.*", "Foo.Bar"));
        assert!(matches("*", "Foo"));
        assert!(!matches("*", "Foo.Bar"));
    }

    #[test]
    fn matches_is_symmetric_on_star() {
        assert!(matches("Foo.*", "Foo.Bar"));
        assert!(matches("Foo.Bar", "Foo.*"));
    }

    #[tokio::test]
    async fn publish_fails_on_already_canceled_token() {
        let broker = LocalBroker::new(tracing_error_listener());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = broker.publish(&cancel, envelope("Foo")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn round_robin_distributes_across_group_members() {
        let broker = LocalBroker::new(tracing_error_listener());
        let cancel = CancellationToken::new();
        let counters: Vec<Arc<AtomicUsize>> =
            (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        let mut subs = Vec::new();
        for counter in &counters {
            let counter = counter.clone();
            let handler: SubscriptionHandler = Arc::new(move |_env| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            });
            subs.push(
                broker
                    .subscribe(&cancel, "Foo", Some("1"), handler)
                    .await
                    .unwrap(),
            );
        }

        for letter in ["A", "B", "C", "D", "E", "F", "G"] {
            broker.publish(&cancel, envelope("Foo")).await.unwrap();
            let _ = letter;
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let counts: Vec<usize> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(counts.iter().sum::<usize>(), 7);
        assert_eq!(counts[0], 3);
        assert_eq!(counts[1], 2);
        assert_eq!(counts[2], 2);
    }

    #[tokio::test]
    async fn unsubscribing_last_member_leaves_group_with_no_receiver_and_no_error() {
        let broker = LocalBroker::new(tracing_error_listener());
        let cancel = CancellationToken::new();
        let handler: SubscriptionHandler = Arc::new(|_env| Box::pin(async { Ok(()) }));
        let sub = broker
            .subscribe(&cancel, "Foo", Some("solo-group"), handler)
            .await
            .unwrap();
        sub.close();
        let result = broker.publish(&cancel, envelope("Foo")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wildcard_fan_out_delivers_to_every_matching_pattern() {
        let broker = LocalBroker::new(tracing_error_listener());
        let cancel = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for pattern in ["*", "*.*", "Foo.Bar", "Foo.*"] {
            let hits = hits.clone();
            let handler: SubscriptionHandler = Arc::new(move |_env| {
                hits.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            });
            broker.subscribe(&cancel, pattern, None, handler).await.unwrap();
        }

        broker.publish(&cancel, envelope("Foo.Bar")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // *.*, Foo.Bar, Foo.* all match (3 tokens rule excludes bare "*").
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
