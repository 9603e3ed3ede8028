use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    response::Response,
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dto::live::{CheckResponse, CreateSessionRequest, InterruptResponse, JoinQuery, SessionResponse},
    error::AppError,
    routes::auth::{Authenticated, MaybeAuthenticated},
    services::{session_service, websocket_service},
    state::SharedState,
};

/// Live session endpoints: lifecycle over HTTP and client connections over WebSocket.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/live", post(create_session))
        .route("/live/{code}/end", get(end_session))
        .route("/live/{code}/check", get(check_session))
        .route("/live/{code}/join", get(join_session))
        .route("/live/{code}/interrupt", get(interrupt_session))
        .route("/live/{code}/mod", get(moderate_session))
}

/// Create a live session for a quiz, or return the one already running.
#[utoipa::path(
    post,
    path = "/live",
    tag = "live",
    params(("Authorization" = String, Header, description = "Bearer access token of the host")),
    request_body = CreateSessionRequest,
    responses(
        (status = 200, description = "Session created or already running", body = SessionResponse),
        (status = 400, description = "Invalid payload or quiz without playable questions"),
        (status = 401, description = "Missing or invalid credential"),
        (status = 404, description = "Unknown quiz"),
        (status = 503, description = "Session store not connected")
    )
)]
pub async fn create_session(
    State(state): State<SharedState>,
    Authenticated(host): Authenticated,
    Valid(Json(request)): Valid<Json<CreateSessionRequest>>,
) -> Result<Json<SessionResponse>, AppError> {
    Ok(Json(session_service::create(&state, &host, request).await?))
}

/// End a live session. Host only.
#[utoipa::path(
    get,
    path = "/live/{code}/end",
    tag = "live",
    params(
        ("code" = String, Path, description = "Join code"),
        ("Authorization" = String, Header, description = "Bearer access token of the host")
    ),
    responses(
        (status = 200, description = "Session ended", body = SessionResponse),
        (status = 403, description = "Caller is not the host"),
        (status = 404, description = "No such session")
    )
)]
pub async fn end_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Authenticated(caller): Authenticated,
) -> Result<Json<SessionResponse>, AppError> {
    Ok(Json(session_service::end(&state, &code, &caller).await?))
}

/// Report whether a join code belongs to a live session.
#[utoipa::path(
    get,
    path = "/live/{code}/check",
    tag = "live",
    params(("code" = String, Path, description = "Join code")),
    responses(
        (status = 200, description = "Presence and progress of the session", body = CheckResponse),
        (status = 400, description = "Malformed join code")
    )
)]
pub async fn check_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<CheckResponse>, AppError> {
    Ok(Json(session_service::check(&state, &code).await?))
}

/// Skip the running timer of a session. Host only.
#[utoipa::path(
    get,
    path = "/live/{code}/interrupt",
    tag = "live",
    params(
        ("code" = String, Path, description = "Join code"),
        ("Authorization" = String, Header, description = "Bearer access token of the host")
    ),
    responses(
        (status = 200, description = "Status reached", body = InterruptResponse),
        (status = 403, description = "Caller is not the host"),
        (status = 404, description = "No such session"),
        (status = 409, description = "Nothing to interrupt")
    )
)]
pub async fn interrupt_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Authenticated(caller): Authenticated,
) -> Result<Json<InterruptResponse>, AppError> {
    Ok(Json(session_service::interrupt(&state, &code, &caller).await?))
}

/// Join a session as participant (or as its host) over WebSocket.
#[utoipa::path(
    get,
    path = "/live/{code}/join",
    tag = "live",
    params(
        ("code" = String, Path, description = "Join code"),
        JoinQuery,
        ("Authorization" = String, Header, description = "Bearer access token; `token` query parameter or `access_token` cookie also accepted")
    ),
    responses(
        (status = 101, description = "Switching protocols to WebSocket"),
        (status = 400, description = "Invalid code, id or profile"),
        (status = 401, description = "Missing or invalid credential"),
        (status = 403, description = "Kicked from the session, or session locked"),
        (status = 404, description = "No such session")
    )
)]
pub async fn join_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Authenticated(caller): Authenticated,
    Valid(Query(query)): Valid<Query<JoinQuery>>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let admission = session_service::admit(&state, &code, &caller, query).await?;
    Ok(ws.on_upgrade(move |socket| websocket_service::serve(state, socket, admission)))
}

/// Open a moderator console over WebSocket. The host's credential allows host commands.
#[utoipa::path(
    get,
    path = "/live/{code}/mod",
    tag = "live",
    params(
        ("code" = String, Path, description = "Join code"),
        ("Authorization" = Option<String>, Header, description = "Optional bearer access token")
    ),
    responses(
        (status = 101, description = "Switching protocols to WebSocket"),
        (status = 401, description = "Invalid credential"),
        (status = 404, description = "No such session")
    )
)]
pub async fn moderate_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    MaybeAuthenticated(caller): MaybeAuthenticated,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let admission = session_service::admit_moderator(&state, &code, caller.as_ref())?;
    Ok(ws.on_upgrade(move |socket| websocket_service::serve(state, socket, admission)))
}
