//! Compiles parsed search predicates into a SQL query against the single
//! `search_params` / `references` / `resources` schema (`SPEC_FULL.md` §6).
//!
//! Grounded on the reference server's `db/search/query_builder/mod.rs`
//! (`BindValue`, `build_sql`, chain/`_has` EXISTS-subquery compilation,
//! `push_order_by`) adapted from its ~10-table-per-parameter-type storage to
//! one table filtered by `param_name`.

use crate::db::extract::{param_type_for, ParamType};
use crate::search::escape::unescape_search_value;
use crate::search::parser::{
    Chain, ChainLink, ParsedSearch, ResolvedParam, ReverseChain, ReverseChainInner,
    SearchModifier, SearchPrefix,
};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub enum BindValue {
    Text(String),
    Number(f64),
    Date(DateTime<Utc>),
}

pub struct CompiledQuery {
    pub sql: String,
    pub binds: Vec<BindValue>,
}

struct Builder {
    binds: Vec<BindValue>,
    alias_counter: usize,
}

impl Builder {
    fn new() -> Self {
        Self {
            binds: Vec::new(),
            alias_counter: 0,
        }
    }

    fn push_text(&mut self, v: impl Into<String>) -> usize {
        self.binds.push(BindValue::Text(v.into()));
        self.binds.len()
    }

    fn push_number(&mut self, v: f64) -> usize {
        self.binds.push(BindValue::Number(v));
        self.binds.len()
    }

    fn push_date(&mut self, v: DateTime<Utc>) -> usize {
        self.binds.push(BindValue::Date(v));
        self.binds.len()
    }

    fn next_alias(&mut self) -> String {
        self.alias_counter += 1;
        format!("t{}", self.alias_counter)
    }
}

pub fn build_search_query(
    resource_type: &str,
    parsed: &ParsedSearch,
    default_count: i64,
    max_count: i64,
    count_only: bool,
) -> CompiledQuery {
    let mut b = Builder::new();
    let mut clauses = Vec::new();

    let rt_idx = b.push_text(resource_type.to_string());
    clauses.push(format!("r.resource_type = ${rt_idx}"));
    clauses.push("r.deleted = false".to_string());

    for pred in &parsed.predicates {
        if let Some(clause) = compile_predicate("r", pred, &mut b) {
            clauses.push(clause);
        }
    }

    let where_sql = clauses.join(" AND ");

    if count_only {
        return CompiledQuery {
            sql: format!("SELECT COUNT(*) FROM resources r WHERE {where_sql}"),
            binds: b.binds,
        };
    }

    let order_by = build_order_by(&parsed.result.sort);
    let count = parsed
        .result
        .count
        .unwrap_or(default_count)
        .clamp(0, max_count);
    let offset = parsed.result.offset.max(0);

    let sql = format!(
        "SELECT r.storage_key, r.resource_type, r.fhir_id, r.resource FROM resources r WHERE {where_sql} ORDER BY {order_by} LIMIT {count} OFFSET {offset}"
    );

    CompiledQuery {
        sql,
        binds: b.binds,
    }
}

fn build_order_by(sort: &[(String, bool)]) -> String {
    if sort.is_empty() {
        return "r.last_updated DESC, r.storage_key".to_string();
    }
    let mut parts = Vec::new();
    for (param, desc) in sort {
        let dir = if *desc { "DESC" } else { "ASC" };
        let expr = match param.as_str() {
            "_lastUpdated" => "r.last_updated".to_string(),
            other => {
                let column = match param_type_for(other) {
                    Some(ParamType::Date) => "value_date",
                    Some(ParamType::Number) | Some(ParamType::Quantity) => "value_number",
                    Some(ParamType::Token) => "value_token_code",
                    _ => "value_string",
                };
                format!(
                    "(SELECT MIN(sp.{column}) FROM search_params sp WHERE sp.resource_id = r.storage_key AND sp.param_name = '{}')",
                    other.replace('\'', "''")
                )
            }
        };
        parts.push(format!("{expr} {dir}"));
    }
    parts.push("r.last_updated DESC".to_string());
    parts.push("r.storage_key".to_string());
    parts.join(", ")
}

fn compile_predicate(alias: &str, pred: &ResolvedParam, b: &mut Builder) -> Option<String> {
    if let Some(rc) = &pred.reverse_chain {
        return Some(compile_reverse_chain(alias, rc, b));
    }
    if let Some(chain) = &pred.chain {
        return Some(compile_chain(alias, chain, &pred.values, b));
    }
    if pred.composite {
        return compile_composite(alias, &pred.code, &pred.values, b);
    }
    compile_simple(alias, &pred.code, pred.modifier.as_ref(), &pred.values, b)
}

fn compile_simple(
    alias: &str,
    code: &str,
    modifier: Option<&SearchModifier>,
    values: &[String],
    b: &mut Builder,
) -> Option<String> {
    if code == "_id" {
        let ors: Vec<String> = values
            .iter()
            .map(|v| {
                let idx = b.push_text(v.clone());
                format!("{alias}.fhir_id = ${idx}")
            })
            .collect();
        return Some(format!("({})", ors.join(" OR ")));
    }

    // An unrecognized parameter name is dropped, not compiled into a clause
    // that can never match (SPEC_FULL.md §4.4): emitting no predicate leaves
    // the rest of the query's AND chain untouched instead of forcing it false.
    let Some(param_type) = param_type_for(code) else {
        return None;
    };

    if matches!(modifier, Some(SearchModifier::Missing)) {
        let missing = values.first().map(String::as_str) == Some("true");
        let name_idx = b.push_text(code.to_string());
        let exists = format!(
            "EXISTS (SELECT 1 FROM search_params sp WHERE sp.resource_id = {alias}.storage_key AND sp.param_name = ${name_idx})"
        );
        return Some(if missing {
            format!("NOT {exists}")
        } else {
            exists
        });
    }

    let name_idx = b.push_text(code.to_string());

    let value_clauses: Vec<String> = values
        .iter()
        .filter_map(|raw| compile_value_clause(param_type, raw, modifier, b))
        .collect();
    if value_clauses.is_empty() {
        return None;
    }
    let inner = value_clauses.join(" OR ");
    let exists = format!(
        "EXISTS (SELECT 1 FROM search_params sp WHERE sp.resource_id = {alias}.storage_key AND sp.param_name = ${name_idx} AND ({inner}))"
    );
    Some(if matches!(modifier, Some(SearchModifier::Not)) {
        format!("NOT {exists}")
    } else {
        exists
    })
}

fn compile_value_clause(
    param_type: ParamType,
    raw: &str,
    modifier: Option<&SearchModifier>,
    b: &mut Builder,
) -> Option<String> {
    let raw = unescape_search_value(raw).ok()?;
    match param_type {
        ParamType::Token => Some(compile_token_clause(&raw, b)),
        ParamType::String => Some(compile_string_clause(&raw, modifier, b)),
        ParamType::Date => compile_date_clause(&raw, b),
        ParamType::Number => compile_number_clause(&raw, b),
        ParamType::Reference => Some(compile_reference_clause(&raw, modifier, b)),
        ParamType::Uri => {
            let idx = b.push_text(raw);
            Some(format!("sp.value_string = ${idx}"))
        }
        ParamType::Quantity => compile_number_clause(&raw, b),
        ParamType::Special => {
            let idx = b.push_text(raw);
            Some(format!("sp.value_string = ${idx}"))
        }
    }
}

fn compile_token_clause(raw: &str, b: &mut Builder) -> String {
    if let Some((system, code)) = raw.split_once('|') {
        if code.is_empty() {
            let idx = b.push_text(system.to_string());
            return format!("sp.value_token_system = ${idx}");
        }
        if system.is_empty() {
            let idx = b.push_text(code.to_string());
            return format!("sp.value_token_code = ${idx}");
        }
        let sys_idx = b.push_text(system.to_string());
        let code_idx = b.push_text(code.to_string());
        format!("(sp.value_token_system = ${sys_idx} AND sp.value_token_code = ${code_idx})")
    } else {
        let idx = b.push_text(raw.to_string());
        format!("sp.value_token_code = ${idx}")
    }
}

fn compile_string_clause(raw: &str, modifier: Option<&SearchModifier>, b: &mut Builder) -> String {
    match modifier {
        Some(SearchModifier::Exact) => {
            let idx = b.push_text(raw.to_string());
            format!("sp.value_string = ${idx}")
        }
        _ => {
            let escaped = raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
            let idx = b.push_text(format!("%{escaped}%"));
            format!("sp.value_string ILIKE ${idx} ESCAPE '\\'")
        }
    }
}

fn compile_date_clause(raw: &str, b: &mut Builder) -> Option<String> {
    let (prefix, literal) = SearchPrefix::parse(raw);
    let (start, end) = date_bounds(literal)?;
    Some(match prefix {
        SearchPrefix::Eq => {
            let s = b.push_date(start);
            let e = b.push_date(end);
            format!("(sp.value_date >= ${s} AND sp.value_date < ${e})")
        }
        SearchPrefix::Ne => {
            let s = b.push_date(start);
            let e = b.push_date(end);
            format!("NOT (sp.value_date >= ${s} AND sp.value_date < ${e})")
        }
        SearchPrefix::Lt | SearchPrefix::Eb => {
            let idx = b.push_date(start);
            format!("sp.value_date < ${idx}")
        }
        SearchPrefix::Le => {
            let idx = b.push_date(end);
            format!("sp.value_date < ${idx}")
        }
        SearchPrefix::Gt | SearchPrefix::Sa => {
            let idx = b.push_date(end);
            format!("sp.value_date >= ${idx}")
        }
        SearchPrefix::Ge => {
            let idx = b.push_date(start);
            format!("sp.value_date >= ${idx}")
        }
        SearchPrefix::Ap => {
            let s = b.push_date(start);
            let e = b.push_date(end);
            format!("(sp.value_date >= ${s} AND sp.value_date < ${e})")
        }
    })
}

/// Half-open `[start, end)` interval implied by the value's own precision.
fn date_bounds(literal: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    use chrono::Duration;
    let start = crate::db::extract::parse_fhir_instant(literal)?;
    let end = match literal.len() {
        4 => start + Duration::days(366),
        7 => start + Duration::days(31),
        10 => start + Duration::days(1),
        _ => start + Duration::seconds(1),
    };
    Some((start, end))
}

fn compile_number_clause(raw: &str, b: &mut Builder) -> Option<String> {
    let (prefix, literal) = SearchPrefix::parse(raw);
    let value: f64 = literal.parse().ok()?;
    let op = prefix.as_sql_op();
    let idx = b.push_number(value);
    Some(format!("sp.value_number {op} ${idx}"))
}

fn compile_reference_clause(raw: &str, modifier: Option<&SearchModifier>, b: &mut Builder) -> String {
    if let Some(SearchModifier::Type(target_type)) = modifier {
        if let Some((type_part, id_part)) = raw.split_once('/') {
            let t_idx = b.push_text(type_part.to_string());
            let id_idx = b.push_text(id_part.to_string());
            return format!(
                "(sp.value_reference = ${id_idx} AND sp.value_string ILIKE '%' || ${t_idx} || '/%')"
            );
        }
        let t_idx = b.push_text(target_type.clone());
        let id_idx = b.push_text(raw.to_string());
        return format!(
            "(sp.value_reference = ${id_idx} AND sp.value_string ILIKE '%' || ${t_idx} || '/%')"
        );
    }

    let id_only = raw.rsplit('/').next().unwrap_or(raw);
    let id_idx = b.push_text(id_only.to_string());
    let full_idx = b.push_text(raw.to_string());
    let urn_idx = b.push_text(format!("urn:uuid:{id_only}"));
    format!(
        "(sp.value_reference = ${id_idx} OR sp.value_string = ${full_idx} OR sp.value_string = ${urn_idx})"
    )
}

fn compile_chain(alias: &str, chain: &Chain, values: &[String], b: &mut Builder) -> String {
    compile_chain_links(alias, &chain.links, &chain.final_param, values, b)
}

fn compile_chain_links(
    alias: &str,
    links: &[ChainLink],
    final_param: &str,
    values: &[String],
    b: &mut Builder,
) -> String {
    let Some((head, rest)) = links.split_first() else {
        // Base case: apply the final parameter to the current alias.
        return compile_simple(alias, final_param, None, values, b)
            .unwrap_or_else(|| "TRUE".to_string());
    };

    let next_alias = b.next_alias();
    let param_idx = b.push_text(head.param_code.clone());
    let type_clause = head
        .type_filter
        .as_ref()
        .map(|t| {
            let idx = b.push_text(t.clone());
            format!(" AND {next_alias}.resource_type = ${idx}")
        })
        .unwrap_or_default();

    let inner = compile_chain_links(&next_alias, rest, final_param, values, b);

    format!(
        "EXISTS (SELECT 1 FROM search_params {alias}_ref JOIN resources {next_alias} ON {next_alias}.fhir_id = {alias}_ref.value_reference AND {next_alias}.deleted = false{type_clause} WHERE {alias}_ref.resource_id = {alias}.storage_key AND {alias}_ref.param_name = ${param_idx} AND ({inner}))"
    )
}

fn compile_reverse_chain(alias: &str, rc: &ReverseChain, b: &mut Builder) -> String {
    let other_alias = b.next_alias();
    let rt_idx = b.push_text(rc.ref_type.clone());
    let field_idx = b.push_text(rc.ref_field.clone());

    let inner = match &rc.inner {
        ReverseChainInner::Param {
            name,
            modifier,
            values,
        } => compile_simple(&other_alias, name, modifier.as_ref(), values, b)
            .unwrap_or_else(|| "TRUE".to_string()),
        ReverseChainInner::Nested(nested) => compile_reverse_chain(&other_alias, nested, b),
    };

    format!(
        "EXISTS (SELECT 1 FROM resources {other_alias} JOIN search_params {other_alias}_ref ON {other_alias}_ref.resource_id = {other_alias}.storage_key AND {other_alias}_ref.param_name = ${field_idx} AND {other_alias}_ref.value_reference = {alias}.fhir_id WHERE {other_alias}.resource_type = ${rt_idx} AND {other_alias}.deleted = false AND ({inner}))"
    )
}

struct CompositeComponent {
    kind: CompositeKind,
    path: &'static str,
}

enum CompositeKind {
    Token,
    Quantity,
}

struct CompositeDef {
    param_name: &'static str,
    root_path: Option<&'static str>,
    components: &'static [CompositeComponent],
}

const COMPOSITES: &[CompositeDef] = &[
    CompositeDef {
        param_name: "code-value-quantity",
        root_path: None,
        components: &[
            CompositeComponent {
                kind: CompositeKind::Token,
                path: "code",
            },
            CompositeComponent {
                kind: CompositeKind::Quantity,
                path: "valueQuantity",
            },
        ],
    },
    CompositeDef {
        param_name: "component-code-value-quantity",
        root_path: Some("component"),
        components: &[
            CompositeComponent {
                kind: CompositeKind::Token,
                path: "code",
            },
            CompositeComponent {
                kind: CompositeKind::Quantity,
                path: "valueQuantity",
            },
        ],
    },
];

fn compile_composite(alias: &str, code: &str, values: &[String], b: &mut Builder) -> Option<String> {
    let def = COMPOSITES.iter().find(|d| d.param_name == code)?;
    let value = values.first()?;
    let parts: Vec<&str> = value.splitn(def.components.len(), '$').collect();
    if parts.len() != def.components.len() {
        return None;
    }

    let mut conditions = Vec::new();
    for (component, raw) in def.components.iter().zip(parts.iter()) {
        let field_ref = if def.root_path.is_some() {
            format!("elem->'{}'", component.path)
        } else {
            format!("{alias}.resource->'{}'", component.path)
        };
        match component.kind {
            CompositeKind::Token => {
                let (system, code) = raw.split_once('|').unwrap_or(("", raw));
                let json_literal = if system.is_empty() {
                    format!(r#"[{{"code":"{}"}}]"#, code.replace('"', "\\\""))
                } else {
                    format!(
                        r#"[{{"system":"{}","code":"{}"}}]"#,
                        system.replace('"', "\\\""),
                        code.replace('"', "\\\"")
                    )
                };
                let idx = b.push_text(json_literal);
                conditions.push(format!("({field_ref}->'coding') @> ${idx}::jsonb"));
            }
            CompositeKind::Quantity => {
                let (prefix, literal) = SearchPrefix::parse(raw);
                if let Ok(num) = literal.parse::<f64>() {
                    let idx = b.push_number(num);
                    let op = prefix.as_sql_op();
                    conditions.push(format!("(({field_ref}->>'value')::numeric {op} ${idx})"));
                }
            }
        }
    }

    if conditions.is_empty() {
        return None;
    }
    let joined = conditions.join(" AND ");

    Some(if let Some(root) = def.root_path {
        format!(
            "EXISTS (SELECT 1 FROM jsonb_array_elements({alias}.resource->'{root}') elem WHERE {joined})"
        )
    } else {
        joined
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::parser::parse_query;

    #[test]
    fn compiles_simple_token_query() {
        let items = vec![("gender".to_string(), "female".to_string())];
        let parsed = parse_query(&items);
        let compiled = build_search_query("Patient", &parsed, 20, 500, false);
        assert!(compiled.sql.contains("search_params"));
        assert!(!compiled.binds.is_empty());
    }

    #[test]
    fn compiles_chain_query() {
        let items = vec![("general-practitioner.family".to_string(), "House".to_string())];
        let parsed = parse_query(&items);
        let compiled = build_search_query("Patient", &parsed, 20, 500, false);
        assert!(compiled.sql.contains("JOIN resources"));
    }

    #[test]
    fn compiles_has_query() {
        let items = vec![(
            "_has:Observation:patient:code".to_string(),
            "8867-4".to_string(),
        )];
        let parsed = parse_query(&items);
        let compiled = build_search_query("Patient", &parsed, 20, 500, false);
        assert!(compiled.sql.contains("resources t1"));
    }

    #[test]
    fn compiles_count_query_without_order() {
        let items = vec![("_id".to_string(), "abc".to_string())];
        let parsed = parse_query(&items);
        let compiled = build_search_query("Patient", &parsed, 20, 500, true);
        assert!(compiled.sql.starts_with("SELECT COUNT(*)"));
    }
}
