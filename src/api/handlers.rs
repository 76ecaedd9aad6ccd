//! HTTP handlers for the FHIR REST surface in `SPEC_FULL.md` §6: CRUD,
//! history, search, and the bundle endpoint.
//!
//! Grounded on the reference server's `api/handlers/crud.rs` and
//! `api/handlers/search.rs` for handler shape (extractor order, status-code
//! selection, header application) trimmed to the interactions this server
//! actually exposes — no content negotiation, `Prefer`, or `PATCH`.

use crate::api::headers::{extract_if_match, extract_if_none_exist, format_etag};
use crate::api::url::base_url_from_headers;
use crate::db::store::HistoryQuery;
use crate::models::{is_known_resource_type, ConditionalParams, CreateParams, HistoryEntry, HistoryOperation, UpdateParams};
use crate::search::parse_query;
use crate::services::bundle;
use crate::services::normalize::normalize_resource;
use crate::state::AppState;
use crate::{Error, Result};
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value as JsonValue};

fn require_known_type(resource_type: &str) -> Result<()> {
    if !is_known_resource_type(resource_type) {
        return Err(Error::Validation(format!("Unknown resource type: {resource_type}")));
    }
    Ok(())
}

fn location(base_url: &str, resource_type: &str, id: &str, version_id: i32) -> String {
    format!("{base_url}/{resource_type}/{id}/_history/{version_id}")
}

fn resource_response(status: StatusCode, resource: &crate::models::Resource) -> Response {
    let mut response = (status, Json(resource.resource.clone())).into_response();
    if let Ok(etag) = format_etag(resource.version_id).parse() {
        response.headers_mut().insert(header::ETAG, etag);
    }
    response
}

fn mutation_response(status: StatusCode, base_url: &str, resource: &crate::models::Resource) -> Response {
    let mut response = resource_response(status, resource);
    if let Ok(loc) = location(base_url, &resource.resource_type, &resource.id, resource.version_id).parse() {
        response.headers_mut().insert(header::LOCATION, loc);
    }
    response
}

pub async fn create_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    headers: HeaderMap,
    Json(body): Json<JsonValue>,
) -> Result<Response> {
    require_known_type(&resource_type)?;

    let body_type = body
        .get("resourceType")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidResource("Missing resourceType field".to_string()))?;
    if body_type != resource_type {
        return Err(Error::InvalidResource(format!(
            "Resource type mismatch: expected {resource_type}, got {body_type}"
        )));
    }

    let normalized = normalize_resource(&resource_type, body);
    let base_url = base_url_from_headers(&headers, &state.config.server.base_url);

    let if_none_exist = extract_if_none_exist(&headers).map(|raw| {
        let raw = raw.trim().trim_start_matches('?');
        ConditionalParams::from_query_string(raw)
    });

    let result = state
        .store
        .create(&resource_type, normalized, CreateParams { if_none_exist })
        .await?;

    let status = StatusCode::from_u16(result.operation.status_code()).unwrap_or(StatusCode::OK);
    Ok(mutation_response(status, &base_url, &result.resource))
}

pub async fn read_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response> {
    require_known_type(&resource_type)?;
    let resource = state.store.read(&resource_type, &id).await?;
    match resource {
        Some(resource) if resource.deleted => Err(Error::ResourceDeleted {
            resource_type,
            id,
            version_id: Some(resource.version_id),
        }),
        Some(resource) => Ok(resource_response(StatusCode::OK, &resource)),
        None => Err(Error::ResourceNotFound { resource_type, id }),
    }
}

pub async fn read_version(
    State(state): State<AppState>,
    Path((resource_type, id, version_id)): Path<(String, String, i32)>,
) -> Result<Response> {
    require_known_type(&resource_type)?;
    let resource = state
        .store
        .read_version(&resource_type, &id, version_id)
        .await?
        .ok_or_else(|| Error::VersionNotFound {
            resource_type: resource_type.clone(),
            id: id.clone(),
            version_id,
        })?;
    Ok(resource_response(StatusCode::OK, &resource))
}

pub async fn update_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<JsonValue>,
) -> Result<Response> {
    require_known_type(&resource_type)?;

    let body_type = body
        .get("resourceType")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidResource("Missing resourceType field".to_string()))?;
    if body_type != resource_type {
        return Err(Error::InvalidResource(format!(
            "Resource type mismatch: expected {resource_type}, got {body_type}"
        )));
    }

    let normalized = normalize_resource(&resource_type, body);
    let base_url = base_url_from_headers(&headers, &state.config.server.base_url);
    let if_match = extract_if_match(&headers);

    let result = state
        .store
        .update(&resource_type, &id, normalized, UpdateParams { if_match })
        .await?;

    let status = StatusCode::from_u16(result.operation.status_code()).unwrap_or(StatusCode::OK);
    Ok(mutation_response(status, &base_url, &result.resource))
}

pub async fn delete_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response> {
    require_known_type(&resource_type)?;
    state.store.delete(&resource_type, &id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn history_entry_json(base_url: &str, entry: &HistoryEntry) -> JsonValue {
    let method = match entry.operation {
        HistoryOperation::Create => "POST",
        HistoryOperation::Update => "PUT",
        HistoryOperation::Delete => "DELETE",
    };
    let resource = &entry.resource;
    let mut json_entry = json!({
        "fullUrl": location(base_url, &resource.resource_type, &resource.id, resource.version_id),
        "request": {
            "method": method,
            "url": format!("{}/{}", resource.resource_type, resource.id),
        },
        "response": {
            "status": if matches!(entry.operation, HistoryOperation::Delete) { "204" } else { "200" },
            "etag": format_etag(resource.version_id),
            "lastModified": resource.last_updated.to_rfc3339(),
        }
    });
    if !matches!(entry.operation, HistoryOperation::Delete) {
        json_entry["resource"] = resource.resource.clone();
    }
    json_entry
}

async fn history_response(
    state: &AppState,
    base_url: &str,
    resource_type: Option<String>,
    id: Option<String>,
) -> Result<Response> {
    let result = state
        .store
        .history(HistoryQuery {
            resource_type,
            id,
            since: None,
            count: state.config.fhir.default_page_size,
            offset: 0,
        })
        .await?;

    let entries: Vec<JsonValue> = result.entries.iter().map(|e| history_entry_json(base_url, e)).collect();
    let bundle = json!({
        "resourceType": "Bundle",
        "type": "history",
        "total": result.total,
        "entry": entries,
    });
    Ok((StatusCode::OK, Json(bundle)).into_response())
}

pub async fn history_instance(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    require_known_type(&resource_type)?;
    let base_url = base_url_from_headers(&headers, &state.config.server.base_url);
    history_response(&state, &base_url, Some(resource_type), Some(id)).await
}

pub async fn history_type(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    require_known_type(&resource_type)?;
    let base_url = base_url_from_headers(&headers, &state.config.server.base_url);
    history_response(&state, &base_url, Some(resource_type), None).await
}

pub async fn history_system(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let base_url = base_url_from_headers(&headers, &state.config.server.base_url);
    history_response(&state, &base_url, None, None).await
}

pub async fn search_type(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Result<Response> {
    require_known_type(&resource_type)?;
    let base_url = base_url_from_headers(&headers, &state.config.server.base_url);
    let query_items = crate::services::conditional::parse_form_urlencoded(raw_query.as_deref().unwrap_or(""));

    let result = state.search.search(&resource_type, &query_items, Some(&base_url)).await?;

    let parsed = parse_query(&query_items);
    let effective_count = parsed
        .result
        .count
        .unwrap_or(state.config.fhir.default_page_size)
        .clamp(0, state.config.fhir.max_page_size);
    let offset = parsed.result.offset;

    let entries: Vec<JsonValue> = result
        .entries
        .iter()
        .map(|entry| {
            let mode = match entry.mode {
                crate::search::SearchMode::Match => "match",
                crate::search::SearchMode::Include => "include",
            };
            json!({
                "fullUrl": format!("{}/{}/{}", base_url, entry.resource_type, entry.id),
                "resource": entry.resource,
                "search": { "mode": mode },
            })
        })
        .collect();

    let self_url = format!("{}/{}?{}", base_url, resource_type, raw_query.unwrap_or_default());
    let mut links = vec![json!({ "relation": "self", "url": self_url })];
    if result.total > offset + effective_count {
        let next_query = query_items
            .iter()
            .filter(|(k, _)| k != "_offset")
            .map(|(k, v)| format!("{k}={v}"))
            .chain(std::iter::once(format!("_offset={}", offset + effective_count)))
            .collect::<Vec<_>>()
            .join("&");
        links.push(json!({ "relation": "next", "url": format!("{}/{}?{}", base_url, resource_type, next_query) }));
    }

    let bundle = json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "total": result.total,
        "link": links,
        "entry": entries,
    });
    Ok((StatusCode::OK, Json(bundle)).into_response())
}

pub async fn process_bundle(
    State(state): State<AppState>,
    Json(body): Json<JsonValue>,
) -> Result<Response> {
    let bundle_type = body.get("type").and_then(|v| v.as_str()).unwrap_or_default();
    let response_bundle = match bundle_type {
        "transaction" => bundle::process_transaction(state.store.as_ref(), &body).await?,
        "batch" => bundle::process_batch(state.store.as_ref(), &body).await?,
        "history" => bundle::apply_history_bundle(state.store.as_ref(), &body).await?,
        "collection" | "searchset" | "document" => bundle::echo_bundle(body),
        other => {
            return Err(Error::Validation(format!(
                "unsupported Bundle.type '{other}'"
            )))
        }
    };
    Ok((StatusCode::OK, Json(response_bundle)).into_response())
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "meridian" }))
}
