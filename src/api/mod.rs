pub mod health;
pub mod indexer;

use crate::config::Config;
use crate::db::Repository;
use crate::orchestration::Indexer;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub indexer: Arc<Indexer>,
    pub config: Config,
}

impl AppState {
    pub fn new(repo: Arc<Repository>, indexer: Arc<Indexer>, config: Config) -> Self {
        Self {
            repo,
            indexer,
            config,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/indexer/run", post(indexer::run_indexer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
