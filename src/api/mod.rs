//! HTTP edge: router assembly and the handlers it dispatches to.
//!
//! Grounded on the reference server's `api/mod.rs` + `api/routes/fhir.rs`
//! for the route layout, trimmed to the interactions `SPEC_FULL.md` §6
//! names — no auth, content-negotiation, or admin-UI middleware, which stay
//! out of scope here.

pub mod handlers;
pub mod headers;
pub mod url;

use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/R4", post(handlers::process_bundle))
        .route("/R4/_history", get(handlers::history_system))
        .route("/R4/:resource_type/_history", get(handlers::history_type))
        .route(
            "/R4/:resource_type/:id/_history",
            get(handlers::history_instance),
        )
        .route(
            "/R4/:resource_type/:id/_history/:version_id",
            get(handlers::read_version),
        )
        .route(
            "/R4/:resource_type",
            post(handlers::create_resource).get(handlers::search_type),
        )
        .route(
            "/R4/:resource_type/:id",
            get(handlers::read_resource)
                .put(handlers::update_resource)
                .delete(handlers::delete_resource),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
