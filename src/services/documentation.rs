use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification of the live quiz backend.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::live::create_session,
        crate::routes::live::end_session,
        crate::routes::live::check_session,
        crate::routes::live::interrupt_session,
        crate::routes::live::join_session,
        crate::routes::live::moderate_session,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::live::CreateSessionRequest,
            crate::dto::live::SessionResponse,
            crate::dto::live::CheckResponse,
            crate::dto::live::InterruptResponse,
            crate::dao::models::SessionConfig,
            crate::dao::models::SessionStatus,
            crate::dao::models::LeaderboardSize,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "live", description = "Live quiz sessions and their WebSocket endpoints"),
    )
)]
pub struct ApiDoc;
