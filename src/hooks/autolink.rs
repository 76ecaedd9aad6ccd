//! Observation → ServiceRequest auto-linking.
//!
//! On create or update of an Observation that has no `basedOn` yet, looks
//! for an active ServiceRequest for the same patient with an overlapping
//! LOINC code whose `authored` date falls within 7 days of the
//! Observation's effective time, links the Observation to the closest such
//! match by time difference, and flips the ServiceRequest to `completed`
//! (SPEC_FULL.md §4.6). Grounded on the reference server's
//! `db/transaction.rs` `update_current_resource_json` for the in-place
//! resource rewrite it requires; the matching query itself has no direct
//! teacher equivalent and is built on the same `search_params` index rows
//! the search engine populates for every resource.

use crate::db::extract::parse_fhir_instant;
use crate::Result;
use chrono::Duration;
use serde_json::Value as JsonValue;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

const LINK_WINDOW_DAYS: i64 = 7;

struct LinkTarget {
    storage_key: Uuid,
    fhir_id: String,
    version_id: i32,
    resource: JsonValue,
}

async fn find_link_target(conn: &mut PgConnection, observation: &JsonValue) -> Result<Option<LinkTarget>> {
    if observation.get("basedOn").is_some() {
        return Ok(None);
    }

    let Some(patient_id) = observation
        .pointer("/subject/reference")
        .and_then(JsonValue::as_str)
        .and_then(|r| r.rsplit('/').next())
    else {
        return Ok(None);
    };

    let Some(codings) = observation.pointer("/code/coding").and_then(JsonValue::as_array) else {
        return Ok(None);
    };
    let loinc_codes: Vec<&str> = codings
        .iter()
        .filter(|c| c.get("system").and_then(JsonValue::as_str) == Some("http://loinc.org"))
        .filter_map(|c| c.get("code").and_then(JsonValue::as_str))
        .collect();
    if loinc_codes.is_empty() {
        return Ok(None);
    }

    let effective = observation
        .get("effectiveDateTime")
        .and_then(JsonValue::as_str)
        .or_else(|| observation.pointer("/effectivePeriod/start").and_then(JsonValue::as_str));
    let Some(effective_instant) = effective.and_then(parse_fhir_instant) else {
        return Ok(None);
    };
    let window_start = effective_instant - Duration::days(LINK_WINDOW_DAYS);
    let window_end = effective_instant + Duration::days(LINK_WINDOW_DAYS);

    let row = sqlx::query(
        "SELECT r.storage_key, r.fhir_id, r.version_id, r.resource \
         FROM search_params sp_code \
         JOIN search_params sp_patient ON sp_patient.resource_id = sp_code.resource_id \
            AND sp_patient.param_name = 'patient' AND sp_patient.value_reference = $1 \
         JOIN search_params sp_status ON sp_status.resource_id = sp_code.resource_id \
            AND sp_status.param_name = 'status' AND sp_status.value_token_code = 'active' \
         JOIN search_params sp_date ON sp_date.resource_id = sp_code.resource_id \
            AND sp_date.param_name = 'authored' AND sp_date.value_date BETWEEN $2 AND $3 \
         JOIN resources r ON r.storage_key = sp_code.resource_id \
         WHERE sp_code.resource_type = 'ServiceRequest' \
           AND sp_code.param_name = 'code' \
           AND sp_code.value_token_system = 'http://loinc.org' \
           AND sp_code.value_token_code = ANY($4) \
           AND r.deleted = false \
         ORDER BY ABS(EXTRACT(EPOCH FROM (sp_date.value_date - $5::timestamptz))) ASC \
         LIMIT 1",
    )
    .bind(patient_id)
    .bind(window_start)
    .bind(window_end)
    .bind(&loinc_codes)
    .bind(effective_instant)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(LinkTarget {
        storage_key: row.try_get("storage_key")?,
        fhir_id: row.try_get("fhir_id")?,
        version_id: row.try_get("version_id")?,
        resource: row.try_get("resource")?,
    }))
}

/// Applies the auto-link in place: rewrites the already-persisted Observation
/// row (and its current history row) to add `basedOn`, flips the matched
/// ServiceRequest to `completed`, and reindexes both.
pub async fn maybe_link_observation(
    conn: &mut PgConnection,
    storage_key: Uuid,
    version_id: i32,
    observation: &JsonValue,
) -> Result<()> {
    let Some(target) = find_link_target(conn, observation).await? else {
        return Ok(());
    };

    let mut updated_observation = observation.clone();
    if let Some(obj) = updated_observation.as_object_mut() {
        obj.insert(
            "basedOn".to_string(),
            serde_json::json!([{ "reference": format!("ServiceRequest/{}", target.fhir_id) }]),
        );
    }
    rewrite_resource(conn, storage_key, version_id, "Observation", &updated_observation).await?;

    let mut updated_request = target.resource.clone();
    if let Some(obj) = updated_request.as_object_mut() {
        obj.insert("status".to_string(), JsonValue::String("completed".to_string()));
    }
    rewrite_resource(
        conn,
        target.storage_key,
        target.version_id,
        "ServiceRequest",
        &updated_request,
    )
    .await?;

    Ok(())
}

async fn rewrite_resource(
    conn: &mut PgConnection,
    storage_key: Uuid,
    version_id: i32,
    resource_type: &str,
    resource: &JsonValue,
) -> Result<()> {
    sqlx::query("UPDATE resources SET resource = $1 WHERE storage_key = $2")
        .bind(resource)
        .bind(storage_key)
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE resource_history SET resource = $1 WHERE storage_key = $2 AND version_id = $3")
        .bind(resource)
        .bind(storage_key)
        .bind(version_id)
        .execute(&mut *conn)
        .await?;
    crate::db::index::reindex_resource(conn, storage_key, resource_type, resource).await?;
    Ok(())
}
