//! FHIR R4 resource store, search engine, and bundle processor.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod models;
pub mod search;
pub mod services;
pub mod state;

pub use error::{Error, Result};
