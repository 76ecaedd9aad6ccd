//! Bulk (re)write of a resource's search-parameter and reference rows.
//!
//! Grounded on the reference server's `services/indexing/insert.rs`
//! (`UNNEST(...)` bulk insert pattern) but against the single `search_params`
//! table `SPEC_FULL.md` §6 prescribes instead of one table per parameter
//! type. Every write is whole-resource replacement: the old row set is
//! deleted and the new one inserted in the same transaction as the resource
//! blob write, never a partial merge (§4.3).

use crate::db::extract::{extract_references, extract_search_params, ReferenceRow, SearchParamRow};
use crate::Result;
use serde_json::Value as JsonValue;
use sqlx::PgConnection;
use uuid::Uuid;

pub async fn reindex_resource(
    conn: &mut PgConnection,
    storage_key: Uuid,
    resource_type: &str,
    resource: &JsonValue,
) -> Result<()> {
    sqlx::query("DELETE FROM search_params WHERE resource_id = $1")
        .bind(storage_key)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM resource_references WHERE source_id = $1")
        .bind(storage_key)
        .execute(&mut *conn)
        .await?;

    let rows = extract_search_params(resource_type, resource);
    insert_search_param_rows(conn, storage_key, resource_type, &rows).await?;

    let refs = extract_references(resource);
    insert_reference_rows(conn, storage_key, resource_type, &refs).await?;

    Ok(())
}

pub async fn remove_index_rows(conn: &mut PgConnection, storage_key: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM search_params WHERE resource_id = $1")
        .bind(storage_key)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM resource_references WHERE source_id = $1")
        .bind(storage_key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_search_param_rows(
    conn: &mut PgConnection,
    storage_key: Uuid,
    resource_type: &str,
    rows: &[SearchParamRow],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let mut names = Vec::with_capacity(rows.len());
    let mut types = Vec::with_capacity(rows.len());
    let mut value_strings: Vec<Option<String>> = Vec::with_capacity(rows.len());
    let mut value_numbers: Vec<Option<f64>> = Vec::with_capacity(rows.len());
    let mut value_dates: Vec<Option<chrono::DateTime<chrono::Utc>>> = Vec::with_capacity(rows.len());
    let mut token_systems: Vec<Option<String>> = Vec::with_capacity(rows.len());
    let mut token_codes: Vec<Option<String>> = Vec::with_capacity(rows.len());
    let mut references: Vec<Option<String>> = Vec::with_capacity(rows.len());

    for row in rows {
        names.push(row.param_name.clone());
        types.push(row.param_type.map(|t| t.as_str().to_string()).unwrap_or_default());
        value_strings.push(row.value_string.clone());
        value_numbers.push(row.value_number);
        value_dates.push(row.value_date);
        token_systems.push(row.value_token_system.clone());
        token_codes.push(row.value_token_code.clone());
        references.push(row.value_reference.clone());
    }

    sqlx::query(
        "INSERT INTO search_params \
         (resource_id, resource_type, param_name, param_type, value_string, value_number, \
          value_date, value_token_system, value_token_code, value_reference) \
         SELECT $1, $2, u.param_name, u.param_type, u.value_string, u.value_number, \
                u.value_date, u.value_token_system, u.value_token_code, u.value_reference \
         FROM UNNEST($3::text[], $4::text[], $5::text[], $6::float8[], $7::timestamptz[], \
                      $8::text[], $9::text[], $10::text[]) \
              AS u(param_name, param_type, value_string, value_number, value_date, \
                   value_token_system, value_token_code, value_reference)",
    )
    .bind(storage_key)
    .bind(resource_type)
    .bind(&names)
    .bind(&types)
    .bind(&value_strings)
    .bind(&value_numbers)
    .bind(&value_dates)
    .bind(&token_systems)
    .bind(&token_codes)
    .bind(&references)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_reference_rows(
    conn: &mut PgConnection,
    storage_key: Uuid,
    resource_type: &str,
    rows: &[ReferenceRow],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let mut target_types: Vec<Option<String>> = Vec::with_capacity(rows.len());
    let mut target_ids = Vec::with_capacity(rows.len());
    let mut paths = Vec::with_capacity(rows.len());
    let mut values = Vec::with_capacity(rows.len());

    for row in rows {
        target_types.push(row.target_type.clone());
        target_ids.push(row.target_id.clone());
        paths.push(row.reference_path.clone());
        values.push(row.reference_value.clone());
    }

    sqlx::query(
        "INSERT INTO resource_references \
         (source_id, source_type, target_type, target_id, reference_path, reference_value) \
         SELECT $1, $2, u.target_type, u.target_id, u.reference_path, u.reference_value \
         FROM UNNEST($3::text[], $4::text[], $5::text[], $6::text[]) \
              AS u(target_type, target_id, reference_path, reference_value)",
    )
    .bind(storage_key)
    .bind(resource_type)
    .bind(&target_types)
    .bind(&target_ids)
    .bind(&paths)
    .bind(&values)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
