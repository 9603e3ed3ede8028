mod common;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use common::{degraded_app, test_app, token_for};

async fn send(router: &Router, method: Method, uri: &str, user: Option<&str>, body: Option<Value>) -> Response {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token_for(user)));
    }
    let body = match body {
        Some(value) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    router
        .clone()
        .oneshot(request.body(body).expect("request build should succeed"))
        .await
        .expect("router should respond")
}

async fn json_body(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

async fn create_session(router: &Router, quiz_id: Uuid, host: &str) -> Value {
    let response = send(
        router,
        Method::POST,
        "/live",
        Some(host),
        Some(json!({ "quiz_id": quiz_id })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

#[tokio::test]
async fn create_then_check_returns_the_same_idle_session() {
    let app = test_app().await;
    let created = create_session(&app.router, app.quiz_id, "host").await;
    assert_eq!(created["status"], "IDLE");
    assert_eq!(created["question_count"], 2);
    assert_eq!(created["created"], true);

    let code = created["code"].as_str().expect("code");
    let response = send(&app.router, Method::GET, &format!("/live/{code}/check"), None, None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let checked = json_body(response).await;
    assert_eq!(checked["exists"], true);
    assert_eq!(checked["session_id"], created["session_id"]);
    assert_eq!(checked["status"], "IDLE");
    assert_eq!(checked["current_question"], 0);
}

#[tokio::test]
async fn concurrent_creates_return_one_session() {
    let app = test_app().await;
    let (first, second) = tokio::join!(
        create_session(&app.router, app.quiz_id, "host-a"),
        create_session(&app.router, app.quiz_id, "host-b"),
    );
    assert_eq!(first["session_id"], second["session_id"]);
    assert_eq!(first["code"], second["code"]);
    assert_eq!(app.state.live_session_count(), 1);
}

#[tokio::test]
async fn missing_or_bad_credential_is_unauthorized() {
    let app = test_app().await;
    let cases = [
        (Method::POST, "/live".to_string()),
        (Method::GET, "/live/AB1234/end".to_string()),
        (Method::GET, "/live/AB1234/interrupt".to_string()),
        (Method::GET, format!("/live/AB1234/join?id={}&name=Ann", Uuid::new_v4())),
    ];
    for (method, uri) in cases {
        let response = send(&app.router, method, &uri, None, Some(json!({ "quiz_id": app.quiz_id }))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "expected 401 for {uri}");
        let body = json_body(response).await;
        assert!(body["message"].is_string());
    }

    let request = Request::builder()
        .method(Method::GET)
        .uri("/live/AB1234/end")
        .header(header::AUTHORIZATION, "Bearer not-a-token")
        .body(Body::empty())
        .expect("request build should succeed");
    let response = app.router.clone().oneshot(request).await.expect("router should respond");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_codes_are_bad_requests() {
    let app = test_app().await;
    for code in ["ab1234", "AB123", "ABC123", "AB12345"] {
        let response = send(&app.router, Method::GET, &format!("/live/{code}/check"), None, None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "expected 400 for {code}");
    }
}

#[tokio::test]
async fn unknown_code_is_reported_absent_or_not_found() {
    let app = test_app().await;
    let response = send(&app.router, Method::GET, "/live/AB1234/check", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["exists"], false);

    let response = send(&app.router, Method::GET, "/live/AB1234/end", Some("host"), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn host_only_actions_are_forbidden_to_others() {
    let app = test_app().await;
    let created = create_session(&app.router, app.quiz_id, "host").await;
    let code = created["code"].as_str().expect("code");

    for action in ["end", "interrupt"] {
        let response = send(&app.router, Method::GET, &format!("/live/{code}/{action}"), Some("guest"), None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "expected 403 for {action}");
    }

    let response = send(&app.router, Method::GET, &format!("/live/{code}/end"), Some("host"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ENDED");
}

#[tokio::test]
async fn unknown_quiz_is_not_found() {
    let app = test_app().await;
    let response = send(
        &app.router,
        Method::POST,
        "/live",
        Some("host"),
        Some(json!({ "quiz_id": Uuid::new_v4() })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn creation_waits_for_the_store() {
    let app = degraded_app().await;
    let response = send(
        &app.router,
        Method::POST,
        "/live",
        Some("host"),
        Some(json!({ "quiz_id": app.quiz_id })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let health = send(&app.router, Method::GET, "/healthcheck", None, None).await;
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(json_body(health).await["status"], "degraded");
}

#[tokio::test]
async fn healthcheck_reports_live_sessions() {
    let app = test_app().await;
    create_session(&app.router, app.quiz_id, "host").await;

    let health = send(&app.router, Method::GET, "/healthcheck", None, None).await;
    let body = json_body(health).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["live_sessions"], 1);
}

#[tokio::test]
async fn openapi_document_lists_live_routes() {
    let app = test_app().await;
    let response = send(&app.router, Method::GET, "/api-doc/openapi.json", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let document = json_body(response).await;
    assert!(document["paths"]["/live"]["post"].is_object());
    assert!(document["paths"]["/live/{code}/join"]["get"].is_object());
}
