//! Executes a compiled search query and assembles the match/include bundle.
//!
//! Grounded on the reference server's `db/search/engine/execute.rs` for the
//! bind-and-fetch shape; `_include`/`_revinclude` expansion is new (the
//! reference server's equivalent wasn't part of the retrieved file set) but
//! is built directly on the same `search_params` index rows the compiler
//! uses for chains and `_has`, rather than re-deriving JSON field names.

use crate::search::parser::{parse_query, ParsedSearch, ResolvedParam};
use crate::search::query_builder::{build_search_query, BindValue};
use crate::Result;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Match,
    Include,
}

#[derive(Debug, Clone)]
pub struct SearchEntry {
    pub resource_type: String,
    pub id: String,
    pub resource: JsonValue,
    pub mode: SearchMode,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub entries: Vec<SearchEntry>,
    pub total: i64,
    pub match_count: usize,
    /// Query-parameter names the parser didn't recognize as a predicate or
    /// result parameter; present so conditional-reference resolution can
    /// reject an unsupported search URI (SPEC_FULL.md §4.2).
    pub unknown_params: Vec<String>,
}

#[derive(Clone)]
pub struct SearchEngine {
    pool: PgPool,
    default_page_size: i64,
    max_page_size: i64,
}

impl SearchEngine {
    pub fn new(pool: PgPool, default_page_size: i64, max_page_size: i64) -> Self {
        Self {
            pool,
            default_page_size,
            max_page_size,
        }
    }

    pub async fn search(
        &self,
        resource_type: &str,
        query_items: &[(String, String)],
        base_url: Option<&str>,
    ) -> Result<SearchResult> {
        let mut conn = self.pool.acquire().await?;
        self.search_in_conn(&mut conn, resource_type, query_items, base_url)
            .await
    }

    pub async fn search_in_conn(
        &self,
        conn: &mut PgConnection,
        resource_type: &str,
        query_items: &[(String, String)],
        _base_url: Option<&str>,
    ) -> Result<SearchResult> {
        let parsed = parse_query(query_items);

        let count_compiled =
            build_search_query(resource_type, &parsed, self.default_page_size, self.max_page_size, true);
        let total: i64 = bind_query(sqlx::query(&count_compiled.sql), &count_compiled.binds)
            .fetch_one(&mut *conn)
            .await?
            .try_get(0)?;

        if parsed.result.summary_count_only {
            return Ok(SearchResult {
                entries: Vec::new(),
                total,
                match_count: 0,
                unknown_params: parsed.unknown_params.clone(),
            });
        }

        let compiled = build_search_query(
            resource_type,
            &parsed,
            self.default_page_size,
            self.max_page_size,
            false,
        );
        let rows = bind_query(sqlx::query(&compiled.sql), &compiled.binds)
            .fetch_all(&mut *conn)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        let mut match_keys = Vec::with_capacity(rows.len());
        let mut match_ids: Vec<String> = Vec::with_capacity(rows.len());
        let mut seen: HashSet<(String, String)> = HashSet::new();

        for row in &rows {
            let storage_key: Uuid = row.try_get("storage_key")?;
            let rt: String = row.try_get("resource_type")?;
            let id: String = row.try_get("fhir_id")?;
            let resource: JsonValue = row.try_get("resource")?;
            seen.insert((rt.clone(), id.clone()));
            match_keys.push(storage_key);
            match_ids.push(id.clone());
            entries.push(SearchEntry {
                resource_type: rt,
                id,
                resource,
                mode: SearchMode::Match,
            });
        }
        let match_count = entries.len();

        for include in &parsed.result.include {
            let targets = fetch_include_targets(conn, &match_keys, &include.param).await?;
            for (rt, id) in targets {
                if let Some(type_filter) = &include.target_type {
                    if &rt != type_filter {
                        continue;
                    }
                }
                if seen.insert((rt.clone(), id.clone())) {
                    if let Some(resource) = fetch_current(conn, &rt, &id).await? {
                        entries.push(SearchEntry {
                            resource_type: rt,
                            id,
                            resource,
                            mode: SearchMode::Include,
                        });
                    }
                }
            }
        }

        for revinclude in &parsed.result.rev_include {
            if match_ids.is_empty() {
                continue;
            }
            let predicate = ResolvedParam {
                raw_name: revinclude.param.clone(),
                code: revinclude.param.clone(),
                modifier: None,
                chain: None,
                reverse_chain: None,
                composite: false,
                values: match_ids.clone(),
            };
            let mut sub = ParsedSearch::default();
            sub.predicates.push(predicate);
            let compiled = build_search_query(
                &revinclude.source_type,
                &sub,
                self.max_page_size,
                self.max_page_size,
                false,
            );
            let rows = bind_query(sqlx::query(&compiled.sql), &compiled.binds)
                .fetch_all(&mut *conn)
                .await?;
            for row in rows {
                let rt: String = row.try_get("resource_type")?;
                let id: String = row.try_get("fhir_id")?;
                if seen.insert((rt.clone(), id.clone())) {
                    let resource: JsonValue = row.try_get("resource")?;
                    entries.push(SearchEntry {
                        resource_type: rt,
                        id,
                        resource,
                        mode: SearchMode::Include,
                    });
                }
            }
        }

        Ok(SearchResult {
            entries,
            total,
            match_count,
            unknown_params: parsed.unknown_params,
        })
    }
}

async fn fetch_include_targets(
    conn: &mut PgConnection,
    match_keys: &[Uuid],
    param: &str,
) -> Result<Vec<(String, String)>> {
    if match_keys.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        "SELECT DISTINCT sp.value_reference, sp.value_string FROM search_params sp \
         WHERE sp.resource_id = ANY($1) AND sp.param_name = $2 AND sp.value_reference IS NOT NULL",
    )
    .bind(match_keys)
    .bind(param)
    .fetch_all(&mut *conn)
    .await?;

    let mut out = Vec::new();
    for row in rows {
        let id: String = row.try_get("value_reference")?;
        let full: Option<String> = row.try_get("value_string")?;
        // `value_string` holds either `Type/id` or `urn:uuid:<id>`; only the
        // former carries a resource type. References stored as urn:uuid are
        // expected to have been rewritten to `Type/id` by the bundle
        // processor before being indexed (SPEC_FULL.md §4.7); one that
        // wasn't can't be included here since its type isn't recoverable.
        let rt = full.as_deref().and_then(|f| {
            if f.starts_with("urn:uuid:") {
                None
            } else {
                f.split_once('/').map(|(t, _)| t.to_string())
            }
        });
        if let Some(rt) = rt {
            out.push((rt, id));
        }
    }
    Ok(out)
}

async fn fetch_current(
    conn: &mut PgConnection,
    resource_type: &str,
    id: &str,
) -> Result<Option<JsonValue>> {
    let row = sqlx::query(
        "SELECT resource FROM resources WHERE resource_type = $1 AND fhir_id = $2 AND deleted = false",
    )
    .bind(resource_type)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|r| r.try_get("resource")).transpose()?)
}

fn bind_query<'q>(
    mut q: Query<'q, Postgres, PgArguments>,
    binds: &'q [BindValue],
) -> Query<'q, Postgres, PgArguments> {
    for b in binds {
        q = match b {
            BindValue::Text(s) => q.bind(s),
            BindValue::Number(n) => q.bind(n),
            BindValue::Date(d) => q.bind(d),
        };
    }
    q
}
