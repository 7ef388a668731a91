//! Exercises the HTTP gateway's strict query ≺ body ≺ path binding
//! precedence and redirect/stream rendering end to end, via
//! `tower::ServiceExt::oneshot` rather than a bound socket.

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use http_body_util::BodyExt;
use relay_core::{compose_handler, Context, Endpoint, Route};
use relay_http::{build_router, HttpGatewayConfig};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserRequest {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
}

fn echo_endpoint() -> Endpoint {
    Endpoint {
        service_name: "Users".into(),
        name: "Update".into(),
        roles: vec![],
        routes: vec![Route::Api {
            method: "PATCH".into(),
            path: "/user/{ID}".into(),
            status: 200,
        }],
        handler: compose_handler(true, |_ctx: Context, req: UserRequest| async move { Ok(req) }),
    }
}

#[tokio::test]
async fn path_wins_over_body_wins_over_query() {
    let router = build_router(vec![Arc::new(echo_endpoint())], HttpGatewayConfig::default());

    let request = Request::builder()
        .method("PATCH")
        .uri("/user/123?ID=456")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"ID":"789","Name":"L"}"#))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), 200);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["ID"], "123");
    assert_eq!(body["Name"], "L");
}

#[tokio::test]
async fn options_is_auto_registered_for_every_path() {
    let router = build_router(vec![Arc::new(echo_endpoint())], HttpGatewayConfig::default());
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/user/123")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), 204);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let router = build_router(vec![Arc::new(echo_endpoint())], HttpGatewayConfig::default());
    let request = Request::builder()
        .method("GET")
        .uri("/nope")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), 404);
}
