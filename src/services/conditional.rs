//! Conditional search-URI parsing, shared by `If-None-Exist` handling and
//! conditional (`Type?search`) reference resolution.
//!
//! Grounded on the reference server's `services/conditional.rs` and
//! `services/conditional_references.rs`: URI parsing/validation, the
//! disallowed-result-param list, and the JSON-path-occurrence walk used to
//! rewrite resolved references in place.

use crate::models::is_known_resource_type;
use crate::search::{SearchEngine, SearchMode};
use crate::{Error, Result};
use serde_json::Value as JsonValue;
use sqlx::PgConnection;
use std::collections::HashMap;
use url::Url;

#[derive(Debug, Clone)]
pub struct ParsedConditionalReference {
    pub resource_type: String,
    pub query_items: Vec<(String, String)>,
    pub fragment: Option<String>,
}

pub fn parse_form_urlencoded(s: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(s.as_bytes()).into_owned().collect()
}

const DISALLOWED_RESULT_PARAMS: &[&str] = &[
    "_count",
    "_offset",
    "_sort",
    "_include",
    "_revinclude",
    "_summary",
    "_elements",
    "_format",
    "_total",
];

pub fn validate_conditional_reference_query_items(items: &[(String, String)]) -> Result<()> {
    for (k, _) in items {
        if DISALLOWED_RESULT_PARAMS.contains(&k.as_str())
            || k.starts_with("_include:")
            || k.starts_with("_revinclude:")
        {
            return Err(Error::Validation(format!(
                "conditional reference does not allow result parameter '{k}'"
            )));
        }
    }
    Ok(())
}

pub fn parse_conditional_reference_search_uri(raw: &str) -> Result<ParsedConditionalReference> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidReference("empty conditional reference".to_string()));
    }

    let (raw, fragment) = raw
        .split_once('#')
        .map(|(b, f)| (b, Some(f.to_string())))
        .unwrap_or((raw, None));

    let raw_lower = raw.to_ascii_lowercase();
    let (resource_type, query) = if raw_lower.starts_with("http://") || raw_lower.starts_with("https://") {
        let url = Url::parse(raw)
            .map_err(|e| Error::InvalidReference(format!("invalid absolute conditional reference URL: {e}")))?;
        let rt = url
            .path()
            .trim_matches('/')
            .split('/')
            .next_back()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::InvalidReference("conditional reference must include a resource type path segment".to_string())
            })?
            .to_string();
        let query = url
            .query()
            .ok_or_else(|| Error::InvalidReference("conditional reference must include a query string".to_string()))?;
        (rt, query.to_string())
    } else {
        let (path, query) = raw
            .split_once('?')
            .ok_or_else(|| Error::InvalidReference("conditional reference must be of the form '{type}?{criteria}'".to_string()))?;
        let rt = path
            .trim_matches('/')
            .split('/')
            .next_back()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidReference("conditional reference must include a resource type".to_string()))?
            .to_string();
        (rt, query.to_string())
    };

    if !is_known_resource_type(&resource_type) {
        return Err(Error::InvalidReference(format!(
            "unknown resource type in conditional reference: {resource_type}"
        )));
    }

    let query_items = parse_form_urlencoded(&query);
    if query_items.is_empty() {
        return Err(Error::InvalidReference("conditional reference query must not be empty".to_string()));
    }

    Ok(ParsedConditionalReference {
        resource_type,
        query_items,
        fragment,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JsonPathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone)]
struct ConditionalReferenceOccurrence {
    raw: String,
    path: Vec<JsonPathSegment>,
}

fn collect_conditional_reference_occurrences(
    value: &JsonValue,
    path: &mut Vec<JsonPathSegment>,
    out: &mut Vec<ConditionalReferenceOccurrence>,
) {
    match value {
        JsonValue::Object(map) => {
            if let Some(JsonValue::String(reference)) = map.get("reference") {
                if reference.contains('?') {
                    let mut p = path.clone();
                    p.push(JsonPathSegment::Key("reference".to_string()));
                    out.push(ConditionalReferenceOccurrence {
                        raw: reference.clone(),
                        path: p,
                    });
                }
            }
            for (k, v) in map {
                path.push(JsonPathSegment::Key(k.clone()));
                collect_conditional_reference_occurrences(v, path, out);
                path.pop();
            }
        }
        JsonValue::Array(arr) => {
            for (idx, v) in arr.iter().enumerate() {
                path.push(JsonPathSegment::Index(idx));
                collect_conditional_reference_occurrences(v, path, out);
                path.pop();
            }
        }
        _ => {}
    }
}

fn json_value_at_path_mut<'a>(value: &'a mut JsonValue, path: &[JsonPathSegment]) -> Option<&'a mut JsonValue> {
    let mut current = value;
    for seg in path {
        match seg {
            JsonPathSegment::Key(k) => {
                let JsonValue::Object(map) = current else { return None };
                current = map.get_mut(k)?;
            }
            JsonPathSegment::Index(i) => {
                let JsonValue::Array(arr) = current else { return None };
                current = arr.get_mut(*i)?;
            }
        }
    }
    Some(current)
}

/// Resolves every `Type?criteria` reference reachable inside `resource` in
/// place, against the same connection the caller is using for the rest of
/// the write (so the resolution sees uncommitted sibling writes).
pub async fn resolve_conditional_references(
    search: &SearchEngine,
    conn: &mut PgConnection,
    resource: &mut JsonValue,
    base_url: Option<&str>,
) -> Result<()> {
    let mut occurrences = Vec::new();
    collect_conditional_reference_occurrences(resource, &mut Vec::new(), &mut occurrences);
    if occurrences.is_empty() {
        return Ok(());
    }

    let mut cache: HashMap<String, String> = HashMap::new();
    for occ in occurrences {
        let replacement = if let Some(r) = cache.get(&occ.raw) {
            r.clone()
        } else {
            let resolved = resolve_one(search, conn, &occ.raw, base_url).await?;
            cache.insert(occ.raw.clone(), resolved.clone());
            resolved
        };
        let Some(slot) = json_value_at_path_mut(resource, &occ.path) else {
            return Err(Error::Internal("failed to apply resolved conditional reference".to_string()));
        };
        *slot = JsonValue::String(replacement);
    }
    Ok(())
}

async fn resolve_one(
    search: &SearchEngine,
    conn: &mut PgConnection,
    raw: &str,
    base_url: Option<&str>,
) -> Result<String> {
    let parsed = parse_conditional_reference_search_uri(raw)?;
    validate_conditional_reference_query_items(&parsed.query_items)?;

    let result = search
        .search_in_conn(conn, &parsed.resource_type, &parsed.query_items, base_url)
        .await?;
    let matches: Vec<_> = result.entries.iter().filter(|e| e.mode == SearchMode::Match).collect();

    match matches.len() {
        0 => Err(Error::PreconditionFailed(format!(
            "conditional reference '{raw}' did not match any resources"
        ))),
        1 => {
            let m = matches[0];
            let mut resolved = format!("{}/{}", m.resource_type, m.id);
            if let Some(f) = &parsed.fragment {
                resolved.push('#');
                resolved.push_str(f);
            }
            Ok(resolved)
        }
        _ => Err(Error::PreconditionFailed(format!(
            "conditional reference '{raw}' matched multiple resources"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relative_conditional_reference() {
        let parsed = parse_conditional_reference_search_uri("Patient?identifier=mrn|123").unwrap();
        assert_eq!(parsed.resource_type, "Patient");
        assert_eq!(parsed.query_items, vec![("identifier".to_string(), "mrn|123".to_string())]);
    }

    #[test]
    fn rejects_result_params_in_conditional_reference() {
        let parsed = parse_conditional_reference_search_uri("Patient?identifier=mrn|123&_count=1").unwrap();
        assert!(validate_conditional_reference_query_items(&parsed.query_items).is_err());
    }

    #[test]
    fn rejects_unknown_resource_type() {
        assert!(parse_conditional_reference_search_uri("NotAType?x=y").is_err());
    }
}
