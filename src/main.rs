//! Live quiz backend entrypoint wiring the hub, storage layers, REST and WebSocket routes.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{Router, http::HeaderValue};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_quiz_back::{
    config::AppConfig,
    dao::{
        cache::memory::MemorySessionCache,
        quiz_catalog::{QuizCatalog, memory::MemoryQuizCatalog},
        session_store::{SessionStore, memory::MemorySessionStore},
        storage::StorageError,
    },
    routes,
    services::storage_supervisor,
    state::{AppState, SharedState, hub::HubHandle},
};

const CACHE_REAP_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let port = config.port;

    let (hub, _hub_task) = HubHandle::spawn();
    let cache = MemorySessionCache::new();
    let _reaper = cache.spawn_reaper(CACHE_REAP_PERIOD);
    let catalog = build_catalog(&config).await?;

    let app_state = AppState::new(config, Arc::new(cache), catalog, hub);
    spawn_storage_supervisor(&app_state);

    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

/// Pick the quiz source: remote authoring service, fixtures file, or an empty catalog.
async fn build_catalog(config: &AppConfig) -> anyhow::Result<Arc<dyn QuizCatalog>> {
    #[cfg(feature = "http-catalog")]
    {
        if let Some(url) = config.quiz_source_url.as_deref() {
            let catalog = live_quiz_back::dao::quiz_catalog::http::HttpQuizCatalog::new(url)
                .context("building HTTP quiz catalog")?;
            info!(%url, "reading quizzes from HTTP catalog");
            return Ok(Arc::new(catalog));
        }
    }

    if let Some(path) = config.quiz_fixtures_path.as_deref() {
        let catalog = MemoryQuizCatalog::from_path(path)
            .await
            .context("loading quiz fixtures")?;
        info!(path = %path.display(), "reading quizzes from fixtures");
        return Ok(Arc::new(catalog));
    }

    warn!("no quiz source configured; the catalog is empty");
    Ok(Arc::new(MemoryQuizCatalog::new()))
}

/// Connect the durable store in the background; the server runs degraded until it is up.
fn spawn_storage_supervisor(state: &SharedState) {
    #[cfg(feature = "mongo-store")]
    {
        use live_quiz_back::dao::session_store::mongodb::{MongoConfig, MongoSessionStore};

        if let Some(uri) = state.config().mongo_uri.clone() {
            let db_name = state.config().mongo_db.clone();
            tokio::spawn(storage_supervisor::run(state.clone(), move || {
                let uri = uri.clone();
                let db_name = db_name.clone();
                async move {
                    let config = MongoConfig::from_uri(&uri, db_name.as_deref()).await?;
                    let store = MongoSessionStore::connect(config).await?;
                    Ok::<_, StorageError>(Arc::new(store) as Arc<dyn SessionStore>)
                }
            }));
            return;
        }
    }

    warn!("MONGO_URI not set; sessions are kept in memory only");
    tokio::spawn(storage_supervisor::run(state.clone(), || async {
        Ok::<_, StorageError>(Arc::new(MemorySessionStore::new()) as Arc<dyn SessionStore>)
    }));
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> anyhow::Result<Router<()>> {
    let cors = match state.config().host_origin.as_deref() {
        Some(origin) => {
            let origin: HeaderValue = origin.parse().context("parsing HOST_ORIGIN")?;
            CorsLayer::very_permissive().allow_origin(origin)
        }
        None => CorsLayer::permissive(),
    };

    Ok(routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
