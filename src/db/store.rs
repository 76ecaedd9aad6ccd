//! The storage abstraction the rest of the core is built against.
//!
//! Grounded on the reference server's `db/traits.rs` + `db/transaction.rs`:
//! a `ResourceStore` for single-call CRUD and a `TransactionContext` for
//! bundle-scoped multi-entry atomicity.

use crate::models::{CreateParams, HistoryResult, Resource, ResourceResult, UpdateParams};
use crate::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub resource_type: Option<String>,
    pub id: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub count: i64,
    pub offset: i64,
}

/// Single-call CRUD + history surface used outside of a bundle transaction.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn create(
        &self,
        resource_type: &str,
        resource: serde_json::Value,
        params: CreateParams,
    ) -> Result<ResourceResult>;

    async fn read(&self, resource_type: &str, id: &str) -> Result<Option<Resource>>;

    async fn read_version(
        &self,
        resource_type: &str,
        id: &str,
        version_id: i32,
    ) -> Result<Option<Resource>>;

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        resource: serde_json::Value,
        params: UpdateParams,
    ) -> Result<ResourceResult>;

    async fn delete(&self, resource_type: &str, id: &str) -> Result<bool>;

    async fn history(&self, query: HistoryQuery) -> Result<HistoryResult>;

    /// Starts a transaction used by the bundle processor to group several
    /// entries into one atomic commit.
    async fn begin_transaction(&self) -> Result<Box<dyn TransactionContext>>;
}

/// Bundle-scoped transaction surface. Mirrors `ResourceStore`'s mutating
/// methods but against a single held connection/transaction so a bundle's
/// entries commit or roll back together.
#[async_trait]
pub trait TransactionContext: Send {
    async fn create(
        &mut self,
        resource_type: &str,
        resource: serde_json::Value,
        params: CreateParams,
    ) -> Result<ResourceResult>;

    async fn read(&mut self, resource_type: &str, id: &str) -> Result<Option<Resource>>;

    async fn update(
        &mut self,
        resource_type: &str,
        id: &str,
        resource: serde_json::Value,
        params: UpdateParams,
    ) -> Result<ResourceResult>;

    async fn delete(&mut self, resource_type: &str, id: &str) -> Result<bool>;

    /// Rewrites the current version's stored JSON in place, without bumping
    /// the version — used to rewrite `urn:uuid:` references once every
    /// transaction entry's assigned id is known.
    async fn rewrite_current_resource(
        &mut self,
        resource_type: &str,
        id: &str,
        resource: serde_json::Value,
    ) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
