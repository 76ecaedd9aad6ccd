//! In-memory `ResourceStore`, used by integration tests that don't stand up
//! a Postgres instance. Grounded on the reference server's test-support
//! fixtures pattern (an in-process double behind the same trait as the real
//! store) rather than any single file, since the teacher's test doubles live
//! alongside its test modules rather than as a reusable store implementation.

use crate::db::extract::extract_search_params;
use crate::db::store::{HistoryQuery, ResourceStore, TransactionContext};
use crate::models::{
    CreateParams, HistoryEntry, HistoryOperation, HistoryResult, Resource, ResourceOperation,
    ResourceResult, UpdateParams,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

type Key = (String, String);

#[derive(Debug, Clone)]
struct VersionedResource {
    resource: Resource,
    operation: HistoryOperation,
}

#[derive(Debug, Clone, Default)]
struct Table {
    /// Every version ever written, in write order. The last entry for a key
    /// is the current version.
    versions: HashMap<Key, Vec<VersionedResource>>,
}

impl Table {
    fn current(&self, resource_type: &str, id: &str) -> Option<&VersionedResource> {
        self.versions
            .get(&(resource_type.to_string(), id.to_string()))
            .and_then(|v| v.last())
    }

    fn push(&mut self, entry: VersionedResource) {
        let key = (entry.resource.resource_type.clone(), entry.resource.id.clone());
        self.versions.entry(key).or_default().push(entry);
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    table: Arc<Mutex<Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches_conditional(resource_type: &str, resource: &JsonValue, criteria: &[(String, String)]) -> bool {
        if criteria.is_empty() {
            return false;
        }
        let rows = extract_search_params(resource_type, resource);
        criteria.iter().all(|(name, value)| {
            rows.iter().any(|row| {
                row.param_name == *name
                    && (row.value_string.as_deref() == Some(value.as_str())
                        || row.value_token_code.as_deref() == Some(value.as_str())
                        || row.value_reference.as_deref() == Some(value.as_str()))
            })
        })
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn create(
        &self,
        resource_type: &str,
        resource: JsonValue,
        params: CreateParams,
    ) -> Result<ResourceResult> {
        let mut table = self.table.lock().unwrap();
        if let Some(criteria) = &params.if_none_exist {
            if let Some(existing) = table.versions.values().flat_map(|v| v.last()).find(|v| {
                v.resource.resource_type == resource_type
                    && !v.resource.deleted
                    && Self::matches_conditional(resource_type, &v.resource.resource, &criteria.search_params)
            }) {
                return Ok(ResourceResult {
                    resource: existing.resource.clone(),
                    operation: ResourceOperation::AlreadyExists,
                });
            }
        }

        let id = Uuid::new_v4().to_string();
        let mut stamped = resource;
        stamp(&mut stamped, &id, resource_type, 1);
        let record = Resource {
            id,
            resource_type: resource_type.to_string(),
            version_id: 1,
            resource: stamped,
            last_updated: Utc::now(),
            deleted: false,
        };
        table.push(VersionedResource {
            resource: record.clone(),
            operation: HistoryOperation::Create,
        });
        Ok(ResourceResult {
            resource: record,
            operation: ResourceOperation::Created,
        })
    }

    async fn read(&self, resource_type: &str, id: &str) -> Result<Option<Resource>> {
        let table = self.table.lock().unwrap();
        Ok(table.current(resource_type, id).map(|v| v.resource.clone()))
    }

    async fn read_version(
        &self,
        resource_type: &str,
        id: &str,
        version_id: i32,
    ) -> Result<Option<Resource>> {
        let table = self.table.lock().unwrap();
        Ok(table
            .versions
            .get(&(resource_type.to_string(), id.to_string()))
            .and_then(|versions| versions.iter().find(|v| v.resource.version_id == version_id))
            .map(|v| v.resource.clone()))
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        resource: JsonValue,
        params: UpdateParams,
    ) -> Result<ResourceResult> {
        let mut table = self.table.lock().unwrap();
        let current_version = table.current(resource_type, id).map(|v| v.resource.version_id);

        if let Some(expected) = params.if_match {
            match current_version {
                None => {
                    return Err(Error::PreconditionFailed(format!(
                        "no resource at version {expected} to update; resource does not exist"
                    )))
                }
                Some(actual) if actual != expected => {
                    return Err(Error::VersionConflict { expected, actual })
                }
                _ => {}
            }
        }

        let new_version = current_version.unwrap_or(0) + 1;
        let mut stamped = resource;
        stamp(&mut stamped, id, resource_type, new_version);
        let record = Resource {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            version_id: new_version,
            resource: stamped,
            last_updated: Utc::now(),
            deleted: false,
        };
        table.push(VersionedResource {
            resource: record.clone(),
            operation: if current_version.is_some() {
                HistoryOperation::Update
            } else {
                HistoryOperation::Create
            },
        });
        Ok(ResourceResult {
            resource: record,
            operation: if current_version.is_some() {
                ResourceOperation::Updated
            } else {
                ResourceOperation::Created
            },
        })
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<bool> {
        let mut table = self.table.lock().unwrap();
        let Some(current) = table.current(resource_type, id).cloned() else {
            return Ok(false);
        };
        if current.resource.deleted {
            return Ok(false);
        }
        let new_version = current.resource.version_id + 1;
        let mut resource = current.resource.resource.clone();
        stamp(&mut resource, id, resource_type, new_version);
        let record = Resource {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            version_id: new_version,
            resource,
            last_updated: Utc::now(),
            deleted: true,
        };
        table.push(VersionedResource {
            resource: record,
            operation: HistoryOperation::Delete,
        });
        Ok(true)
    }

    async fn history(&self, query: HistoryQuery) -> Result<HistoryResult> {
        let table = self.table.lock().unwrap();
        let mut entries: Vec<HistoryEntry> = table
            .versions
            .iter()
            .filter(|((rt, id), _)| {
                query.resource_type.as_deref().map(|t| t == rt).unwrap_or(true)
                    && query.id.as_deref().map(|i| i == id).unwrap_or(true)
            })
            .flat_map(|(_, versions)| versions.iter())
            .filter(|v| query.since.map(|s| v.resource.last_updated >= s).unwrap_or(true))
            .map(|v| HistoryEntry {
                resource: v.resource.clone(),
                operation: v.operation,
            })
            .collect();
        entries.sort_by(|a, b| b.resource.last_updated.cmp(&a.resource.last_updated));
        let total = entries.len() as i64;
        let offset = query.offset.max(0) as usize;
        let count = if query.count <= 0 { entries.len() } else { query.count as usize };
        let entries = entries.into_iter().skip(offset).take(count).collect();
        Ok(HistoryResult {
            entries,
            total: Some(total),
        })
    }

    async fn begin_transaction(&self) -> Result<Box<dyn TransactionContext>> {
        let snapshot = self.table.lock().unwrap().clone();
        Ok(Box::new(MemoryTransactionContext {
            store: self.clone(),
            working: snapshot,
        }))
    }
}

struct MemoryTransactionContext {
    store: MemoryStore,
    working: Table,
}

#[async_trait]
impl TransactionContext for MemoryTransactionContext {
    async fn create(
        &mut self,
        resource_type: &str,
        resource: JsonValue,
        params: CreateParams,
    ) -> Result<ResourceResult> {
        let scratch = MemoryStore {
            table: Arc::new(Mutex::new(self.working.clone())),
        };
        let result = scratch.create(resource_type, resource, params).await?;
        self.working = scratch.table.lock().unwrap().clone();
        Ok(result)
    }

    async fn read(&mut self, resource_type: &str, id: &str) -> Result<Option<Resource>> {
        Ok(self.working.current(resource_type, id).map(|v| v.resource.clone()))
    }

    async fn update(
        &mut self,
        resource_type: &str,
        id: &str,
        resource: JsonValue,
        params: UpdateParams,
    ) -> Result<ResourceResult> {
        let scratch = MemoryStore {
            table: Arc::new(Mutex::new(self.working.clone())),
        };
        let result = scratch.update(resource_type, id, resource, params).await?;
        self.working = scratch.table.lock().unwrap().clone();
        Ok(result)
    }

    async fn delete(&mut self, resource_type: &str, id: &str) -> Result<bool> {
        let scratch = MemoryStore {
            table: Arc::new(Mutex::new(self.working.clone())),
        };
        let result = scratch.delete(resource_type, id).await?;
        self.working = scratch.table.lock().unwrap().clone();
        Ok(result)
    }

    async fn rewrite_current_resource(
        &mut self,
        resource_type: &str,
        id: &str,
        resource: JsonValue,
    ) -> Result<()> {
        let key = (resource_type.to_string(), id.to_string());
        let Some(versions) = self.working.versions.get_mut(&key) else {
            return Err(Error::ResourceNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            });
        };
        let Some(last) = versions.last_mut() else {
            return Err(Error::ResourceNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            });
        };
        last.resource.resource = resource;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        *self.store.table.lock().unwrap() = self.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn stamp(resource: &mut JsonValue, id: &str, resource_type: &str, version_id: i32) {
    if let Some(obj) = resource.as_object_mut() {
        obj.insert("resourceType".to_string(), JsonValue::String(resource_type.to_string()));
        obj.insert("id".to_string(), JsonValue::String(id.to_string()));
        let meta = obj.entry("meta").or_insert_with(|| JsonValue::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("versionId".to_string(), JsonValue::String(version_id.to_string()));
            meta.insert(
                "lastUpdated".to_string(),
                JsonValue::String(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            );
        }
    }
}
