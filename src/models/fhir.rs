//! Core domain model: a stored resource record and the operations performed on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single version of a FHIR resource as held by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub resource_type: String,
    pub version_id: i32,
    pub resource: JsonValue,
    pub last_updated: DateTime<Utc>,
    pub deleted: bool,
}

/// Outcome of a create/update/delete call, used by the HTTP edge to pick a status code.
#[derive(Debug, Clone)]
pub struct ResourceResult {
    pub resource: Resource,
    pub operation: ResourceOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOperation {
    Created,
    Updated,
    /// Conditional create matched an existing resource; nothing was written.
    AlreadyExists,
    Deleted,
}

impl ResourceOperation {
    pub fn status_code(&self) -> u16 {
        match self {
            ResourceOperation::Created => 201,
            ResourceOperation::Updated => 200,
            ResourceOperation::AlreadyExists => 200,
            ResourceOperation::Deleted => 204,
        }
    }
}

/// `If-None-Exist` search criteria for conditional create.
#[derive(Debug, Clone)]
pub struct ConditionalParams {
    pub search_params: Vec<(String, String)>,
}

impl ConditionalParams {
    pub fn from_query_string(query: &str) -> Self {
        let search_params = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter_map(|pair| {
                let mut parts = pair.splitn(2, '=');
                let key = parts.next()?;
                let value = parts.next().unwrap_or("");
                Some((
                    urlencoding::decode(key).ok()?.into_owned(),
                    urlencoding::decode(value).ok()?.into_owned(),
                ))
            })
            .collect();
        Self { search_params }
    }

    pub fn is_empty(&self) -> bool {
        self.search_params.is_empty()
    }
}

/// One version event in a resource's history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub resource: Resource,
    pub operation: HistoryOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOperation {
    Create,
    Update,
    Delete,
}

impl HistoryOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryOperation::Create => "create",
            HistoryOperation::Update => "update",
            HistoryOperation::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryResult {
    pub entries: Vec<HistoryEntry>,
    pub total: Option<i64>,
}

/// Optimistic-concurrency parameters for an update (`If-Match`).
#[derive(Debug, Clone, Default)]
pub struct UpdateParams {
    pub if_match: Option<i32>,
}

/// Conditional-create parameters for a create (`If-None-Exist`).
#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    pub if_none_exist: Option<ConditionalParams>,
}
