use std::time::Duration;

use anyhow::Context;
use axum::http::{header, HeaderName, HeaderValue, Method};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use metis_backend::config::{AppConfig, SessionBackend};
use metis_backend::handlers::{MODEL_HEADER, MODEL_NAME_HEADER};
use metis_backend::state::AppState;

/// Request bodies carry the whole conversation; 2 MiB is plenty.
const BODY_LIMIT: usize = 2 * 1024 * 1024;

async fn connect_pool(url: &str, max: u32, label: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max)
        .acquire_timeout(Duration::from_secs(20))
        .idle_timeout(Duration::from_secs(10))
        .max_lifetime(Duration::from_secs(1800))
        .connect(url)
        .await
        .with_context(|| format!("failed to connect to the {label} database"))
}

async fn build_app(config: AppConfig) -> anyhow::Result<(axum::Router, AppState)> {
    let sessions_db = connect_pool(&config.database_url, 5, "sessions").await?;
    let analytics_db = if config.analytics_database_url == config.database_url {
        sessions_db.clone()
    } else {
        connect_pool(&config.analytics_database_url, 5, "analytics").await?
    };

    if config.session_backend == SessionBackend::Postgres {
        sqlx::migrate!("./migrations")
            .run(&sessions_db)
            .await
            .context("failed to run migrations")?;
    } else {
        tracing::warn!("METIS_SESSION_STORE=memory: sessions will not survive a restart");
    }

    if config.openrouter_api_key.is_none() {
        tracing::warn!("OPENROUTER_API_KEY is not set; model requests will likely be rejected");
    }

    let cors_origins = config
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect::<Vec<_>>();

    let state = AppState::new(config, sessions_db, analytics_db)
        .context("failed to build HTTP client")?;

    // CORS: explicit allowlist; the client reads the serving model from headers
    let cors = CorsLayer::new()
        .allow_origin(cors_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([
            HeaderName::from_static(MODEL_HEADER),
            HeaderName::from_static(MODEL_NAME_HEADER),
        ])
        .max_age(Duration::from_secs(86_400));

    // Security headers
    let nosniff: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    let frame_deny: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    let referrer: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    // Rate limiting: 30 req burst, replenish 1 per 2 seconds, per IP
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(2)
        .burst_size(30)
        .finish()
        .context("invalid rate limiter configuration")?;

    let app = metis_backend::create_router(state.clone())
        .layer(GovernorLayer::new(governor_conf))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(cors)
        .layer(nosniff)
        .layer(frame_deny)
        .layer(referrer)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(CompressionLayer::new());

    Ok((app, state))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    let config = AppConfig::from_env()?;
    let port = config.port;
    tracing::info!(
        models = config.roster.len(),
        primary = %config.roster.primary().id,
        step_budget = config.limits.step_budget,
        row_cap = config.limits.row_cap,
        "startup: configuration loaded"
    );

    let (app, state) = build_app(config).await?;
    state.mark_ready();

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Metis backend listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
