// Metis backend: shared application state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use sqlx::PgPool;

use crate::config::{AppConfig, SessionBackend};
use crate::gateway::openrouter::OpenRouterBackend;
use crate::gateway::{FallbackGateway, ModelBackend};
use crate::query_guard::{PgQueryRunner, QueryGuard, QueryRunner};
use crate::sessions::{
    MemorySessionStore, PgSessionStore, SaveQueue, SessionStore, SAVE_QUEUE_CAPACITY,
};

/// Central application state. Clone-friendly; all heavy fields are Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub gateway: Arc<FallbackGateway>,
    pub sessions: Arc<dyn SessionStore>,
    pub save_queue: SaveQueue,
    pub start_time: Instant,
    /// `true` once startup checks have passed.
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("Backend marked as READY");
    }
}

impl AppState {
    /// Production wiring: OpenRouter backend, Postgres query runner, and the
    /// configured session store. Must run inside a tokio runtime because the
    /// save queue spawns its worker.
    pub fn new(
        config: AppConfig,
        sessions_db: PgPool,
        analytics_db: PgPool,
    ) -> Result<Self, reqwest::Error> {
        let backend: Arc<dyn ModelBackend> = Arc::new(OpenRouterBackend::new(
            &config.openrouter_base_url,
            config.openrouter_api_key.clone(),
        )?);
        let runner: Arc<dyn QueryRunner> =
            Arc::new(PgQueryRunner::new(analytics_db, config.limits.query_timeout));
        let sessions: Arc<dyn SessionStore> = match config.session_backend {
            SessionBackend::Postgres => Arc::new(PgSessionStore::new(sessions_db)),
            SessionBackend::Memory => Arc::new(MemorySessionStore::new()),
        };
        Ok(Self::from_parts(config, backend, runner, sessions))
    }

    /// Assemble state from explicit collaborators. Tests use this with fake
    /// backends and runners so no network or database is needed.
    pub fn from_parts(
        config: AppConfig,
        backend: Arc<dyn ModelBackend>,
        runner: Arc<dyn QueryRunner>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let guard = Arc::new(QueryGuard::new(
            runner,
            config.limits.row_cap,
            config.limits.query_timeout,
        ));
        let gateway = Arc::new(FallbackGateway::new(
            config.roster.clone(),
            backend,
            guard,
            config.limits.clone(),
        ));
        let save_queue = SaveQueue::spawn(Arc::clone(&sessions), SAVE_QUEUE_CAPACITY);

        Self {
            config: Arc::new(config),
            gateway,
            sessions,
            save_queue,
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }
}
