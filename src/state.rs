//! Shared application state handed to every Axum handler.
//!
//! Grounded on the reference server's `state.rs`: a small `Clone` struct of
//! `Arc`-wrapped shared services, built once in `main` and threaded through
//! `Router::with_state`.

use crate::config::Config;
use crate::db::ResourceStore;
use crate::search::SearchEngine;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ResourceStore>,
    pub search: Arc<SearchEngine>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: Arc<dyn ResourceStore>, search: Arc<SearchEngine>, config: Arc<Config>) -> Self {
        Self {
            store,
            search,
            config,
        }
    }
}
