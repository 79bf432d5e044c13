//! Stride Server Library
//!
//! Self-hosted store for typed personal records (tasks, habits, journal entries,
//! budgets) with multi-device incremental sync. The main server binary is in
//! main.rs; the library exposes the modules for integration tests.
//!
//! # Modules
//!
//! - `sync`: the incremental synchronization protocol (coordinator, merge
//!   resolution, type registry, device-side agent)
//! - `db`: SQLite persistence for entities and sync bookkeeping
//! - `routes`: HTTP endpoints

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod sync;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the application router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api/v1/health", routes::health::router())
        .nest("/api/v1/sync", routes::sync::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
