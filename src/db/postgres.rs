//! Postgres-backed `ResourceStore`.
//!
//! Grounded on the reference server's `db/postgres.rs` + `db/transaction.rs`
//! for the monotonic-version-allocation and row-locking idioms, adapted to
//! the single `resources` / `resource_history` schema this server uses
//! instead of a `resources` + `resource_versions` counter-table pair. The
//! reference server's `begin_transaction` extends a pool transaction's
//! lifetime to `'static` with `unsafe { std::mem::transmute }`; this server
//! holds a bare `PoolConnection` and drives `BEGIN`/`COMMIT`/`ROLLBACK` by
//! hand instead, which gets the same boxable-transaction shape without
//! unsafe code (documented as a deliberate deviation in `DESIGN.md`).

use crate::db::index::{reindex_resource, remove_index_rows};
use crate::db::store::{HistoryQuery, ResourceStore, TransactionContext};
use crate::hooks::autolink;
use crate::hooks::notify::{NotifyEvent, Notifier};
use crate::models::{
    CreateParams, HistoryEntry, HistoryOperation, HistoryResult, Resource, ResourceOperation,
    ResourceResult, UpdateParams,
};
use crate::search::SearchEngine;
use crate::services::conditional::resolve_conditional_references;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use std::sync::Arc;
use uuid::Uuid;

pub struct PostgresStore {
    pool: PgPool,
    search: SearchEngine,
    notifier: Arc<dyn Notifier>,
    auto_link_observations: bool,
}

impl PostgresStore {
    pub fn new(
        pool: PgPool,
        search: SearchEngine,
        notifier: Arc<dyn Notifier>,
        auto_link_observations: bool,
    ) -> Self {
        Self {
            pool,
            search,
            notifier,
            auto_link_observations,
        }
    }
}

#[async_trait]
impl ResourceStore for PostgresStore {
    async fn create(
        &self,
        resource_type: &str,
        resource: JsonValue,
        params: CreateParams,
    ) -> Result<ResourceResult> {
        if let Some(criteria) = &params.if_none_exist {
            if !criteria.is_empty() {
                let found = self
                    .search
                    .search(resource_type, &criteria.search_params, None)
                    .await?;
                if let Some(existing) = found.entries.into_iter().find(|e| e.mode == crate::search::SearchMode::Match) {
                    let resource = load_current(&self.pool, resource_type, &existing.id).await?;
                    if let Some(resource) = resource {
                        return Ok(ResourceResult {
                            resource,
                            operation: ResourceOperation::AlreadyExists,
                        });
                    }
                }
            }
        }

        let mut tx = self.pool.begin().await?;
        let mut resource = resource;
        resolve_conditional_references(&self.search, &mut tx, &mut resource, None).await?;
        let result = do_create(&mut tx, resource_type, resource, None, self.auto_link_observations).await?;
        tx.commit().await?;
        self.notifier.notify(NotifyEvent::for_result(&result));
        Ok(result)
    }

    async fn read(&self, resource_type: &str, id: &str) -> Result<Option<Resource>> {
        let mut conn = self.pool.acquire().await?;
        do_read(&mut conn, resource_type, id).await
    }

    async fn read_version(
        &self,
        resource_type: &str,
        id: &str,
        version_id: i32,
    ) -> Result<Option<Resource>> {
        let mut conn = self.pool.acquire().await?;
        do_read_version(&mut conn, resource_type, id, version_id).await
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        resource: JsonValue,
        params: UpdateParams,
    ) -> Result<ResourceResult> {
        let mut tx = self.pool.begin().await?;
        let mut resource = resource;
        resolve_conditional_references(&self.search, &mut tx, &mut resource, None).await?;
        let result = do_update(
            &mut tx,
            resource_type,
            id,
            resource,
            params,
            self.auto_link_observations,
        )
        .await?;
        tx.commit().await?;
        self.notifier.notify(NotifyEvent::for_result(&result));
        Ok(result)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = do_delete(&mut tx, resource_type, id).await?;
        tx.commit().await?;
        if deleted {
            self.notifier.notify(NotifyEvent::deleted(resource_type, id));
        }
        Ok(deleted)
    }

    async fn history(&self, query: HistoryQuery) -> Result<HistoryResult> {
        let mut conn = self.pool.acquire().await?;
        do_history(&mut conn, query).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn TransactionContext>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN").execute(&mut *conn).await?;
        Ok(Box::new(PgTransactionContext {
            conn: Some(conn),
            search: self.search.clone(),
            auto_link_observations: self.auto_link_observations,
        }))
    }
}

async fn load_current(pool: &PgPool, resource_type: &str, id: &str) -> Result<Option<Resource>> {
    let mut conn = pool.acquire().await?;
    do_read(&mut conn, resource_type, id).await
}

struct PgTransactionContext {
    conn: Option<PoolConnection<Postgres>>,
    search: SearchEngine,
    auto_link_observations: bool,
}

impl PgTransactionContext {
    fn conn_mut(&mut self) -> Result<&mut PgConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| Error::Internal("transaction already committed or rolled back".to_string()))
    }
}

#[async_trait]
impl TransactionContext for PgTransactionContext {
    async fn create(
        &mut self,
        resource_type: &str,
        resource: JsonValue,
        _params: CreateParams,
    ) -> Result<ResourceResult> {
        let auto_link = self.auto_link_observations;
        let search = self.search.clone();
        let mut resource = resource;
        let conn = self.conn_mut()?;
        resolve_conditional_references(&search, conn, &mut resource, None).await?;
        do_create(conn, resource_type, resource, None, auto_link).await
    }

    async fn read(&mut self, resource_type: &str, id: &str) -> Result<Option<Resource>> {
        let conn = self.conn_mut()?;
        do_read(conn, resource_type, id).await
    }

    async fn update(
        &mut self,
        resource_type: &str,
        id: &str,
        resource: JsonValue,
        params: UpdateParams,
    ) -> Result<ResourceResult> {
        let auto_link = self.auto_link_observations;
        let search = self.search.clone();
        let mut resource = resource;
        let conn = self.conn_mut()?;
        resolve_conditional_references(&search, conn, &mut resource, None).await?;
        do_update(conn, resource_type, id, resource, params, auto_link).await
    }

    async fn delete(&mut self, resource_type: &str, id: &str) -> Result<bool> {
        let conn = self.conn_mut()?;
        do_delete(conn, resource_type, id).await
    }

    async fn rewrite_current_resource(
        &mut self,
        resource_type: &str,
        id: &str,
        resource: JsonValue,
    ) -> Result<()> {
        let conn = self.conn_mut()?;
        let row = sqlx::query(
            "UPDATE resources SET resource = $1 WHERE resource_type = $2 AND fhir_id = $3 \
             RETURNING storage_key, version_id",
        )
        .bind(&resource)
        .bind(resource_type)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        let Some(row) = row else {
            return Err(Error::ResourceNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            });
        };
        let storage_key: Uuid = row.try_get("storage_key")?;
        let version_id: i32 = row.try_get("version_id")?;

        sqlx::query("UPDATE resource_history SET resource = $1 WHERE storage_key = $2 AND version_id = $3")
            .bind(&resource)
            .bind(storage_key)
            .bind(version_id)
            .execute(&mut *conn)
            .await?;

        reindex_resource(conn, storage_key, resource_type, &resource).await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| Error::Internal("transaction already committed".to_string()))?;
        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| Error::Internal("transaction already rolled back".to_string()))?;
        sqlx::query("ROLLBACK").execute(&mut *conn).await?;
        Ok(())
    }
}

// ---- shared single-connection implementations -----------------------------

async fn fetch_for_update(
    conn: &mut PgConnection,
    resource_type: &str,
    id: &str,
) -> Result<Option<(Uuid, i32, bool, JsonValue)>> {
    let row = sqlx::query(
        "SELECT storage_key, version_id, deleted, resource FROM resources \
         WHERE resource_type = $1 AND fhir_id = $2 FOR UPDATE",
    )
    .bind(resource_type)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(row) => Ok(Some((
            row.try_get("storage_key")?,
            row.try_get("version_id")?,
            row.try_get("deleted")?,
            row.try_get("resource")?,
        ))),
        None => Ok(None),
    }
}

fn stamp_meta(resource: &mut JsonValue, id: &str, resource_type: &str, version_id: i32, last_updated: DateTime<Utc>) {
    if let Some(obj) = resource.as_object_mut() {
        obj.insert("resourceType".to_string(), JsonValue::String(resource_type.to_string()));
        obj.insert("id".to_string(), JsonValue::String(id.to_string()));
        let meta = obj
            .entry("meta")
            .or_insert_with(|| JsonValue::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("versionId".to_string(), JsonValue::String(version_id.to_string()));
            meta.insert(
                "lastUpdated".to_string(),
                JsonValue::String(last_updated.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            );
        }
    }
}

async fn do_create(
    conn: &mut PgConnection,
    resource_type: &str,
    mut resource: JsonValue,
    id_override: Option<String>,
    auto_link: bool,
) -> Result<ResourceResult> {
    let id = id_override.unwrap_or_else(|| Uuid::new_v4().to_string());
    let storage_key = Uuid::new_v4();
    let last_updated = Utc::now();
    stamp_meta(&mut resource, &id, resource_type, 1, last_updated);

    sqlx::query(
        "INSERT INTO resources (storage_key, resource_type, fhir_id, version_id, last_updated, deleted, resource) \
         VALUES ($1, $2, $3, 1, $4, false, $5)",
    )
    .bind(storage_key)
    .bind(resource_type)
    .bind(&id)
    .bind(last_updated)
    .bind(&resource)
    .execute(&mut *conn)
    .await?;

    insert_history(conn, storage_key, 1, HistoryOperation::Create, last_updated, &resource).await?;
    reindex_resource(conn, storage_key, resource_type, &resource).await?;

    if auto_link && resource_type == "Observation" {
        autolink::maybe_link_observation(conn, storage_key, 1, &resource).await?;
    }

    Ok(ResourceResult {
        resource: Resource {
            id,
            resource_type: resource_type.to_string(),
            version_id: 1,
            resource,
            last_updated,
            deleted: false,
        },
        operation: ResourceOperation::Created,
    })
}

async fn do_update(
    conn: &mut PgConnection,
    resource_type: &str,
    id: &str,
    mut resource: JsonValue,
    params: UpdateParams,
    auto_link: bool,
) -> Result<ResourceResult> {
    let current = fetch_for_update(conn, resource_type, id).await?;

    let Some((storage_key, current_version, _deleted, _old)) = current else {
        if let Some(expected) = params.if_match {
            return Err(Error::PreconditionFailed(format!(
                "no resource at version {expected} to update; resource does not exist"
            )));
        }
        return do_create(conn, resource_type, resource, Some(id.to_string()), auto_link).await;
    };

    if let Some(expected) = params.if_match {
        if expected != current_version {
            return Err(Error::VersionConflict {
                expected,
                actual: current_version,
            });
        }
    }

    let new_version = current_version + 1;
    let last_updated = Utc::now();
    stamp_meta(&mut resource, id, resource_type, new_version, last_updated);

    sqlx::query(
        "UPDATE resources SET version_id = $1, resource = $2, last_updated = $3, deleted = false \
         WHERE storage_key = $4",
    )
    .bind(new_version)
    .bind(&resource)
    .bind(last_updated)
    .bind(storage_key)
    .execute(&mut *conn)
    .await?;

    insert_history(conn, storage_key, new_version, HistoryOperation::Update, last_updated, &resource).await?;
    reindex_resource(conn, storage_key, resource_type, &resource).await?;

    if auto_link && resource_type == "Observation" {
        autolink::maybe_link_observation(conn, storage_key, new_version, &resource).await?;
    }

    Ok(ResourceResult {
        resource: Resource {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            version_id: new_version,
            resource,
            last_updated,
            deleted: false,
        },
        operation: ResourceOperation::Updated,
    })
}

async fn do_delete(conn: &mut PgConnection, resource_type: &str, id: &str) -> Result<bool> {
    let Some((storage_key, current_version, deleted, old)) = fetch_for_update(conn, resource_type, id).await?
    else {
        return Ok(false);
    };
    if deleted {
        return Ok(false);
    }

    let new_version = current_version + 1;
    let last_updated = Utc::now();
    let mut resource = old;
    stamp_meta(&mut resource, id, resource_type, new_version, last_updated);

    sqlx::query(
        "UPDATE resources SET version_id = $1, resource = $2, last_updated = $3, deleted = true \
         WHERE storage_key = $4",
    )
    .bind(new_version)
    .bind(&resource)
    .bind(last_updated)
    .bind(storage_key)
    .execute(&mut *conn)
    .await?;

    insert_history(conn, storage_key, new_version, HistoryOperation::Delete, last_updated, &resource).await?;
    remove_index_rows(conn, storage_key).await?;

    Ok(true)
}

async fn do_read(conn: &mut PgConnection, resource_type: &str, id: &str) -> Result<Option<Resource>> {
    let row = sqlx::query(
        "SELECT fhir_id, resource_type, version_id, resource, last_updated, deleted \
         FROM resources WHERE resource_type = $1 AND fhir_id = $2",
    )
    .bind(resource_type)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(Resource {
        id: row.try_get("fhir_id")?,
        resource_type: row.try_get("resource_type")?,
        version_id: row.try_get("version_id")?,
        resource: row.try_get("resource")?,
        last_updated: row.try_get("last_updated")?,
        deleted: row.try_get("deleted")?,
    }))
}

async fn do_read_version(
    conn: &mut PgConnection,
    resource_type: &str,
    id: &str,
    version_id: i32,
) -> Result<Option<Resource>> {
    let row = sqlx::query(
        "SELECT rh.version_id, rh.resource, rh.transaction_time, rh.operation \
         FROM resource_history rh \
         JOIN resources r ON r.storage_key = rh.storage_key \
         WHERE r.resource_type = $1 AND r.fhir_id = $2 AND rh.version_id = $3",
    )
    .bind(resource_type)
    .bind(id)
    .bind(version_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else { return Ok(None) };
    let operation: String = row.try_get("operation")?;
    Ok(Some(Resource {
        id: id.to_string(),
        resource_type: resource_type.to_string(),
        version_id: row.try_get("version_id")?,
        resource: row.try_get("resource")?,
        last_updated: row.try_get("transaction_time")?,
        deleted: operation == "delete",
    }))
}

async fn do_history(conn: &mut PgConnection, query: HistoryQuery) -> Result<HistoryResult> {
    let since = query.since;
    let rows = sqlx::query(
        "SELECT r.resource_type, r.fhir_id, rh.version_id, rh.resource, rh.transaction_time, rh.operation \
         FROM resource_history rh \
         JOIN resources r ON r.storage_key = rh.storage_key \
         WHERE ($1::text IS NULL OR r.resource_type = $1) \
           AND ($2::text IS NULL OR r.fhir_id = $2) \
           AND ($3::timestamptz IS NULL OR rh.transaction_time >= $3) \
         ORDER BY rh.transaction_time DESC \
         LIMIT $4 OFFSET $5",
    )
    .bind(&query.resource_type)
    .bind(&query.id)
    .bind(since)
    .bind(query.count)
    .bind(query.offset)
    .fetch_all(&mut *conn)
    .await?;

    let total: i64 = sqlx::query(
        "SELECT COUNT(*) FROM resource_history rh \
         JOIN resources r ON r.storage_key = rh.storage_key \
         WHERE ($1::text IS NULL OR r.resource_type = $1) \
           AND ($2::text IS NULL OR r.fhir_id = $2) \
           AND ($3::timestamptz IS NULL OR rh.transaction_time >= $3)",
    )
    .bind(&query.resource_type)
    .bind(&query.id)
    .bind(since)
    .fetch_one(&mut *conn)
    .await?
    .try_get(0)?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let operation: String = row.try_get("operation")?;
        let resource_type: String = row.try_get("resource_type")?;
        let id: String = row.try_get("fhir_id")?;
        let version_id: i32 = row.try_get("version_id")?;
        let resource: JsonValue = row.try_get("resource")?;
        let last_updated: DateTime<Utc> = row.try_get("transaction_time")?;
        let history_op = match operation.as_str() {
            "create" => HistoryOperation::Create,
            "delete" => HistoryOperation::Delete,
            _ => HistoryOperation::Update,
        };
        entries.push(HistoryEntry {
            resource: Resource {
                id,
                resource_type,
                version_id,
                resource,
                last_updated,
                deleted: history_op == HistoryOperation::Delete,
            },
            operation: history_op,
        });
    }

    Ok(HistoryResult {
        entries,
        total: Some(total),
    })
}

async fn insert_history(
    conn: &mut PgConnection,
    storage_key: Uuid,
    version_id: i32,
    operation: HistoryOperation,
    transaction_time: DateTime<Utc>,
    resource: &JsonValue,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO resource_history (storage_key, version_id, operation, transaction_time, resource) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(storage_key)
    .bind(version_id)
    .bind(operation.as_str())
    .bind(transaction_time)
    .bind(resource)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
