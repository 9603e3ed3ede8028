#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use axum::Router;
use live_quiz_back::{
    config::AppConfig,
    dao::{
        cache::memory::MemorySessionCache,
        quiz_catalog::memory::{MemoryQuizCatalog, QuizFixture},
        session_store::memory::MemorySessionStore,
    },
    routes,
    services::identity_service,
    state::{AppState, SharedState, hub::HubHandle},
};
use serde_json::json;
use uuid::Uuid;

pub struct TestApp {
    pub state: SharedState,
    pub router: Router,
    pub store: Arc<MemorySessionStore>,
    pub quiz_id: Uuid,
}

/// A two-question quiz served from memory.
pub fn quiz_fixture(quiz_id: Uuid) -> QuizFixture {
    serde_json::from_value(json!({
        "quiz_id": quiz_id,
        "title": "Oceans",
        "questions": [
            {
                "id": Uuid::new_v4(),
                "order": 1,
                "content": "Deepest ocean?",
                "type": "SINGLE_CHOICE",
                "time_limit_secs": 20,
                "options": [
                    {"id": Uuid::new_v4(), "content": "Pacific", "is_correct": true, "mark": 100.0},
                    {"id": Uuid::new_v4(), "content": "Arctic", "is_correct": false, "mark": 0.0}
                ]
            },
            {
                "id": Uuid::new_v4(),
                "order": 2,
                "content": "Saltiest sea?",
                "type": "SINGLE_CHOICE",
                "time_limit_secs": 20,
                "options": [
                    {"id": Uuid::new_v4(), "content": "Dead Sea", "is_correct": true, "mark": 100.0},
                    {"id": Uuid::new_v4(), "content": "Baltic", "is_correct": false, "mark": 0.0}
                ]
            }
        ]
    }))
    .expect("valid quiz fixture")
}

/// Application state with an in-memory store already connected.
pub async fn test_app() -> TestApp {
    let app = degraded_app().await;
    app.state.install_session_store(app.store.clone()).await;
    app
}

/// Application state whose session store is not connected yet.
pub async fn degraded_app() -> TestApp {
    let (hub, _task) = HubHandle::spawn();
    let quiz_id = Uuid::new_v4();
    let state = AppState::new(
        AppConfig::default(),
        Arc::new(MemorySessionCache::new()),
        Arc::new(MemoryQuizCatalog::with_quizzes([quiz_fixture(quiz_id)])),
        hub,
    );
    TestApp {
        router: routes::router(state.clone()),
        state,
        store: Arc::new(MemorySessionStore::new()),
        quiz_id,
    }
}

pub fn token_for(user_id: &str) -> String {
    identity_service::issue(
        &AppConfig::default().access_token_secret,
        user_id,
        None,
        Duration::from_secs(3600),
    )
    .expect("token signs")
}
