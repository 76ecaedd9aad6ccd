//! Bundle (transaction/batch/collection/history) processing.
//!
//! Grounded on the reference server's `services/history.rs` for the
//! per-entry `BundleEntryResponse` shape and OperationOutcome-per-entry
//! texture; transaction-vs-batch control flow is newly written per
//! `SPEC_FULL.md` §4.7 since the reference server's bundle consumer there is
//! replication-only, not a general transaction processor.

use crate::db::store::{ResourceStore, TransactionContext};
use crate::models::{ConditionalParams, CreateParams, UpdateParams};
use crate::services::normalize::normalize_resource;
use crate::{Error, Result};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BundleMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl BundleMethod {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

struct ParsedEntry {
    full_url: Option<String>,
    method: BundleMethod,
    url: String,
    if_match: Option<i32>,
    if_none_exist: Option<String>,
    resource: Option<JsonValue>,
}

fn parse_entry(entry: &JsonValue) -> Result<ParsedEntry> {
    let full_url = entry.get("fullUrl").and_then(|v| v.as_str()).map(str::to_string);
    let request = entry
        .get("request")
        .ok_or_else(|| Error::InvalidResource("bundle entry missing 'request'".to_string()))?;
    let method_str = request
        .get("method")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidResource("bundle entry request missing 'method'".to_string()))?;
    let method = BundleMethod::parse(method_str)
        .ok_or_else(|| Error::InvalidResource(format!("unsupported bundle entry method '{method_str}'")))?;
    let url = request
        .get("url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidResource("bundle entry request missing 'url'".to_string()))?
        .to_string();
    let if_match = request
        .get("ifMatch")
        .and_then(|v| v.as_str())
        .and_then(parse_etag);
    let if_none_exist = request.get("ifNoneExist").and_then(|v| v.as_str()).map(str::to_string);
    let resource = entry.get("resource").cloned();

    if matches!(method, BundleMethod::Post | BundleMethod::Put) && resource.is_none() {
        return Err(Error::InvalidResource(format!(
            "bundle entry for {method_str} {url} is missing 'resource'"
        )));
    }

    Ok(ParsedEntry {
        full_url,
        method,
        url,
        if_match,
        if_none_exist,
        resource,
    })
}

fn parse_etag(raw: &str) -> Option<i32> {
    raw.trim().trim_start_matches("W/").trim_matches('"').parse().ok()
}

/// `Type/id` or just `Type` for a create URL; `Type/id` for update/delete/get.
fn split_url(url: &str) -> (String, Option<String>) {
    let mut parts = url.trim_start_matches('/').splitn(2, '/');
    let resource_type = parts.next().unwrap_or_default().to_string();
    let id = parts.next().map(|s| s.split('?').next().unwrap_or(s).to_string());
    (resource_type, id)
}

fn validate_entries(entries: &[ParsedEntry]) -> Result<()> {
    let mut seen_full_urls = std::collections::HashSet::new();
    for entry in entries {
        if let Some(full_url) = &entry.full_url {
            if !seen_full_urls.insert(full_url.clone()) {
                return Err(Error::InvalidResource(format!(
                    "duplicate fullUrl '{full_url}' in bundle"
                )));
            }
        }
    }
    Ok(())
}

fn entry_response(status: u16, location: Option<String>, outcome: Option<JsonValue>) -> JsonValue {
    let mut response = Map::new();
    response.insert("status".to_string(), JsonValue::String(status.to_string()));
    if let Some(location) = location {
        response.insert("location".to_string(), JsonValue::String(location));
    }
    response.insert(
        "lastModified".to_string(),
        JsonValue::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
    );
    let mut entry = Map::new();
    entry.insert("response".to_string(), JsonValue::Object(response));
    if let Some(outcome) = outcome {
        entry.insert("outcome".to_string(), outcome);
    }
    JsonValue::Object(entry)
}

fn operation_outcome(message: &str) -> JsonValue {
    serde_json::json!({
        "resourceType": "OperationOutcome",
        "issue": [{ "severity": "error", "code": "exception", "diagnostics": message }]
    })
}

fn error_status(err: &Error) -> u16 {
    match err {
        Error::ResourceNotFound { .. } | Error::NotFound(_) | Error::VersionNotFound { .. } => 404,
        Error::InvalidResource(_) | Error::Validation(_) | Error::InvalidReference(_) => 400,
        Error::VersionConflict { .. } | Error::PreconditionFailed(_) => 412,
        Error::BusinessRule(_) => 409,
        Error::UnprocessableEntity(_) => 422,
        _ => 500,
    }
}

/// Rewrites every `urn:uuid:` reference in `value` that matches a `fullUrl`
/// assigned earlier in this bundle to the entry's resolved `Type/id`.
fn rewrite_urn_uuid_references(value: &mut JsonValue, assigned: &HashMap<String, String>) {
    match value {
        JsonValue::Object(obj) => {
            if let Some(JsonValue::String(reference)) = obj.get("reference").cloned() {
                if let Some(resolved) = assigned.get(&reference) {
                    obj.insert("reference".to_string(), JsonValue::String(resolved.clone()));
                }
            }
            for v in obj.values_mut() {
                rewrite_urn_uuid_references(v, assigned);
            }
        }
        JsonValue::Array(arr) => {
            for v in arr.iter_mut() {
                rewrite_urn_uuid_references(v, assigned);
            }
        }
        _ => {}
    }
}

/// Processes a `transaction` bundle: every entry commits or none does.
pub async fn process_transaction(store: &dyn ResourceStore, bundle: &JsonValue) -> Result<JsonValue> {
    let started = Instant::now();
    let entries_raw = bundle
        .get("entry")
        .and_then(|e| e.as_array())
        .cloned()
        .unwrap_or_default();
    let parsed: Result<Vec<ParsedEntry>> = entries_raw.iter().map(parse_entry).collect();
    let parsed = parsed?;
    validate_entries(&parsed)?;

    let mut tx = store.begin_transaction().await?;
    let mut assigned: HashMap<String, String> = HashMap::new();
    let mut responses = Vec::with_capacity(parsed.len());

    let result = run_transaction_entries(tx.as_mut(), &parsed, &mut assigned, &mut responses).await;
    match result {
        Ok(()) => {
            tx.commit().await?;
        }
        Err(err) => {
            tx.rollback().await?;
            return Err(err);
        }
    }

    Ok(build_response_bundle("transaction-response", responses, started, 0))
}

async fn run_transaction_entries(
    tx: &mut dyn TransactionContext,
    entries: &[ParsedEntry],
    assigned: &mut HashMap<String, String>,
    responses: &mut Vec<JsonValue>,
) -> Result<()> {
    for entry in entries {
        let (resource_type, id) = split_url(&entry.url);
        match entry.method {
            BundleMethod::Post => {
                let mut resource = entry.resource.clone().unwrap();
                rewrite_urn_uuid_references(&mut resource, assigned);
                let resource = normalize_resource(&resource_type, resource);
                let params = CreateParams {
                    if_none_exist: entry.if_none_exist.as_deref().map(ConditionalParams::from_query_string),
                };
                let result = tx.create(&resource_type, resource, params).await?;
                if let Some(full_url) = &entry.full_url {
                    assigned.insert(
                        full_url.clone(),
                        format!("{}/{}", result.resource.resource_type, result.resource.id),
                    );
                }
                let status = result.operation.status_code();
                let location = format!(
                    "{}/{}/_history/{}",
                    result.resource.resource_type, result.resource.id, result.resource.version_id
                );
                responses.push(entry_response(status, Some(location), None));
            }
            BundleMethod::Put => {
                let id = id.ok_or_else(|| {
                    Error::InvalidResource(format!("PUT entry url '{}' missing an id", entry.url))
                })?;
                let mut resource = entry.resource.clone().unwrap();
                rewrite_urn_uuid_references(&mut resource, assigned);
                let resource = normalize_resource(&resource_type, resource);
                let params = UpdateParams {
                    if_match: entry.if_match,
                };
                let result = tx.update(&resource_type, &id, resource, params).await?;
                if let Some(full_url) = &entry.full_url {
                    assigned.insert(full_url.clone(), format!("{resource_type}/{id}"));
                }
                let location = format!(
                    "{}/{}/_history/{}",
                    result.resource.resource_type, result.resource.id, result.resource.version_id
                );
                responses.push(entry_response(result.operation.status_code(), Some(location), None));
            }
            BundleMethod::Delete => {
                let id = id.ok_or_else(|| {
                    Error::InvalidResource(format!("DELETE entry url '{}' missing an id", entry.url))
                })?;
                let deleted = tx.delete(&resource_type, &id).await?;
                let status = if deleted { 204 } else { 404 };
                responses.push(entry_response(status, None, None));
            }
            BundleMethod::Get => {
                let id = id.ok_or_else(|| {
                    Error::InvalidResource(format!("GET entry url '{}' missing an id", entry.url))
                })?;
                let found = tx.read(&resource_type, &id).await?;
                match found {
                    Some(resource) if !resource.deleted => {
                        responses.push(entry_response(200, None, None));
                        let _ = resource;
                    }
                    _ => responses.push(entry_response(404, None, Some(operation_outcome("not found")))),
                }
            }
        }
    }
    Ok(())
}

/// Processes a `batch` bundle: every entry is independent; failures don't
/// abort the rest.
pub async fn process_batch(store: &dyn ResourceStore, bundle: &JsonValue) -> Result<JsonValue> {
    let started = Instant::now();
    let entries_raw = bundle
        .get("entry")
        .and_then(|e| e.as_array())
        .cloned()
        .unwrap_or_default();

    let mut responses = Vec::with_capacity(entries_raw.len());
    let mut error_count = 0usize;

    for raw in &entries_raw {
        let outcome = process_batch_entry(store, raw).await;
        match outcome {
            Ok(response) => responses.push(response),
            Err(err) => {
                error_count += 1;
                responses.push(entry_response(
                    error_status(&err),
                    None,
                    Some(operation_outcome(&err.to_string())),
                ));
            }
        }
    }

    Ok(build_response_bundle("batch-response", responses, started, error_count))
}

async fn process_batch_entry(store: &dyn ResourceStore, raw: &JsonValue) -> Result<JsonValue> {
    let entry = parse_entry(raw)?;
    let (resource_type, id) = split_url(&entry.url);
    match entry.method {
        BundleMethod::Post => {
            let resource = normalize_resource(&resource_type, entry.resource.unwrap());
            let params = CreateParams {
                if_none_exist: entry.if_none_exist.as_deref().map(ConditionalParams::from_query_string),
            };
            let result = store.create(&resource_type, resource, params).await?;
            let location = format!(
                "{}/{}/_history/{}",
                result.resource.resource_type, result.resource.id, result.resource.version_id
            );
            Ok(entry_response(result.operation.status_code(), Some(location), None))
        }
        BundleMethod::Put => {
            let id = id.ok_or_else(|| Error::InvalidResource(format!("PUT entry url '{}' missing an id", entry.url)))?;
            let resource = normalize_resource(&resource_type, entry.resource.unwrap());
            let params = UpdateParams { if_match: entry.if_match };
            let result = store.update(&resource_type, &id, resource, params).await?;
            let location = format!(
                "{}/{}/_history/{}",
                result.resource.resource_type, result.resource.id, result.resource.version_id
            );
            Ok(entry_response(result.operation.status_code(), Some(location), None))
        }
        BundleMethod::Delete => {
            let id = id.ok_or_else(|| Error::InvalidResource(format!("DELETE entry url '{}' missing an id", entry.url)))?;
            let deleted = store.delete(&resource_type, &id).await?;
            Ok(entry_response(if deleted { 204 } else { 404 }, None, None))
        }
        BundleMethod::Get => {
            let id = id.ok_or_else(|| Error::InvalidResource(format!("GET entry url '{}' missing an id", entry.url)))?;
            match store.read(&resource_type, &id).await? {
                Some(r) if !r.deleted => Ok(entry_response(200, None, None)),
                _ => Ok(entry_response(404, None, Some(operation_outcome("not found")))),
            }
        }
    }
}

/// Applies a `history`-type bundle as an input replication format: each
/// entry's resource is written only if its version is newer than the
/// current one, never failing the whole bundle on a single stale entry.
pub async fn apply_history_bundle(store: &dyn ResourceStore, bundle: &JsonValue) -> Result<JsonValue> {
    let started = Instant::now();
    let entries_raw = bundle
        .get("entry")
        .and_then(|e| e.as_array())
        .cloned()
        .unwrap_or_default();
    let mut responses = Vec::with_capacity(entries_raw.len());
    let mut error_count = 0usize;

    for raw in &entries_raw {
        let Some(resource) = raw.get("resource").cloned() else {
            responses.push(entry_response(400, None, Some(operation_outcome("history entry missing resource"))));
            error_count += 1;
            continue;
        };
        let resource_type = resource.get("resourceType").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let id = resource.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let incoming_version: i32 = resource
            .pointer("/meta/versionId")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let current = store.read(&resource_type, &id).await?;
        if current.as_ref().is_some_and(|c| c.version_id >= incoming_version) {
            responses.push(entry_response(200, None, None));
            continue;
        }

        let result = store
            .update(&resource_type, &id, resource, UpdateParams::default())
            .await;
        match result {
            Ok(r) => responses.push(entry_response(r.operation.status_code(), None, None)),
            Err(err) => {
                error_count += 1;
                responses.push(entry_response(error_status(&err), None, Some(operation_outcome(&err.to_string()))));
            }
        }
    }

    Ok(build_response_bundle("history", responses, started, error_count))
}

/// Collection and searchset bundles carry no mutations; entries are echoed
/// back unchanged.
pub fn echo_bundle(bundle: JsonValue) -> JsonValue {
    bundle
}

fn build_response_bundle(bundle_type: &str, responses: Vec<JsonValue>, started: Instant, error_count: usize) -> JsonValue {
    let elapsed_ms = started.elapsed().as_millis() as i64;
    let processed_count = responses.len();
    serde_json::json!({
        "resourceType": "Bundle",
        "type": bundle_type,
        "entry": responses,
        "extension": [{
            "url": "http://example.org/fhir/StructureDefinition/bundle-processing-info",
            "extension": [
                { "url": "processedCount", "valueInteger": processed_count },
                { "url": "errorCount", "valueInteger": error_count },
                { "url": "elapsedMs", "valueInteger": elapsed_ms },
            ]
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn transaction_rewrites_urn_uuid_references() {
        let store = MemoryStore::new();
        let bundle = serde_json::json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "fullUrl": "urn:uuid:patient-1",
                    "request": { "method": "POST", "url": "Patient" },
                    "resource": { "resourceType": "Patient" }
                },
                {
                    "fullUrl": "urn:uuid:obs-1",
                    "request": { "method": "POST", "url": "Observation" },
                    "resource": {
                        "resourceType": "Observation",
                        "subject": { "reference": "urn:uuid:patient-1" }
                    }
                }
            ]
        });
        let response = process_transaction(&store, &bundle).await.unwrap();
        assert_eq!(response["type"], "transaction-response");
        assert_eq!(response["entry"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn batch_continues_after_entry_failure() {
        let store = MemoryStore::new();
        let bundle = serde_json::json!({
            "resourceType": "Bundle",
            "type": "batch",
            "entry": [
                { "request": { "method": "GET", "url": "Patient/missing" } },
                { "request": { "method": "POST", "url": "Patient" }, "resource": { "resourceType": "Patient" } }
            ]
        });
        let response = process_batch(&store, &bundle).await.unwrap();
        let entries = response["entry"].as_array().unwrap();
        assert_eq!(entries[0]["response"]["status"], "404");
        assert_eq!(entries[1]["response"]["status"], "201");
    }
}
