//! Integration coverage for the middleware composition order and role
//! resolution working together, the way a registered endpoint actually
//! experiences them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use relay_core::{compose, compose_handler, resolve_roles, Context, ErasedHandler, FlatMap, Middleware};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct WriteRequest {
    #[serde(rename = "User.ID")]
    user_id: String,
    payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WriteResponse {
    accepted: bool,
}

fn counting_middleware(order: Arc<AtomicU32>, slot: u32) -> Middleware {
    Arc::new(move |inner: ErasedHandler| {
        let order = order.clone();
        Arc::new(move |ctx, flat| {
            order.store(slot, Ordering::SeqCst);
            inner(ctx, flat)
        })
    })
}

#[tokio::test]
async fn middleware_chain_runs_outermost_first_and_handler_last() {
    let last_layer_to_run = Arc::new(AtomicU32::new(0));
    let handler = compose_handler(true, |_ctx: Context, req: WriteRequest| async move {
        Ok(WriteResponse {
            accepted: !req.payload.is_empty(),
        })
    });

    let chain = vec![
        counting_middleware(last_layer_to_run.clone(), 1),
        counting_middleware(last_layer_to_run.clone(), 2),
    ];
    let composed = compose(handler, &chain);

    let mut flat = FlatMap::new();
    flat.insert("User.ID".into(), "42".into());
    flat.insert("payload".into(), "hello".into());

    let result = composed(Context::background(), flat).await.unwrap();
    assert_eq!(result["accepted"], true);
    // The innermost (last-registered) middleware is the last to touch the
    // shared counter before the handler runs.
    assert_eq!(last_layer_to_run.load(Ordering::SeqCst), 2);
}

#[test]
fn role_resolution_reads_from_the_same_flattened_request_the_handler_sees() {
    let mut flat = FlatMap::new();
    flat.insert("User.ID".into(), "42".into());
    let roles = resolve_roles(&["group.{User.ID}.write".to_string()], &flat);
    assert_eq!(roles, vec!["group.42.write".to_string()]);
}
