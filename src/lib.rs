pub mod config;
pub mod gateway;
pub mod handlers;
pub mod model_registry;
pub mod models;
pub mod prompt;
pub mod query_guard;
pub mod sessions;
pub mod state;
pub mod tools;

use axum::routing::{get, post};
use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Metis Assistant API",
        description = "Conversational analytics assistant for the Accurate Sales dashboard"
    ),
    paths(
        handlers::health,
        handlers::readiness,
        handlers::chat,
        model_registry::list_models,
        sessions::get_session,
        sessions::save_session,
        sessions::clear_session,
    ),
    components(schemas(
        models::ChatRequest,
        models::ChatMessage,
        models::MessagePart,
        models::MessageRole,
        models::DashboardContext,
        models::DashboardFilters,
        models::HealthResponse,
        model_registry::ModelCandidate,
        model_registry::ModelListResponse,
        gateway::ChatEvent,
        gateway::FinishReason,
        gateway::AttemptFailure,
        sessions::ChatSession,
        sessions::SessionEnvelope,
        sessions::SaveSessionRequest,
        sessions::ClearSessionRequest,
        sessions::ClearSessionResponse,
    )),
    tags(
        (name = "chat", description = "Streaming assistant responses"),
        (name = "sessions", description = "Resumable conversations"),
        (name = "models", description = "Model fallback roster"),
        (name = "health", description = "Liveness and readiness"),
    )
)]
pub struct ApiDoc;

/// Build the application router with the given state.
/// Extracted from `main()` so integration tests can construct the app
/// without binding to a network port.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/api/health", get(handlers::health))
        .route("/api/health/ready", get(handlers::readiness))
        // Assistant
        .route("/api/metis/chat", post(handlers::chat))
        .route("/api/metis/models", get(model_registry::list_models))
        // Sessions
        .merge(sessions::session_routes())
        // Shared state
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
