//! Parses a raw FHIR search query-parameter map into typed predicates.
//!
//! Grounded on the reference server's `db/search/query_builder/mod.rs`
//! (`SearchPrefix`, `SearchModifier`, `ChainMetadata`, `ResolvedParam`,
//! `parse_prefix`, `is_modifier_valid_for_type`).

use crate::db::extract::{param_type_for, ParamType};
use crate::search::escape::split_unescaped;

pub const RESULT_PARAM_NAMES: &[&str] = &[
    "_count", "_offset", "_sort", "_include", "_revinclude", "_summary", "_elements", "_total",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPrefix {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Sa,
    Eb,
    Ap,
}

impl SearchPrefix {
    /// Splits a known two-letter prefix off the front of `value`, defaulting
    /// to `Eq` when the value doesn't start with one.
    pub fn parse(value: &str) -> (SearchPrefix, &str) {
        if value.len() >= 2 {
            let (head, rest) = value.split_at(2);
            let prefix = match head {
                "eq" => Some(SearchPrefix::Eq),
                "ne" => Some(SearchPrefix::Ne),
                "lt" => Some(SearchPrefix::Lt),
                "le" => Some(SearchPrefix::Le),
                "gt" => Some(SearchPrefix::Gt),
                "ge" => Some(SearchPrefix::Ge),
                "sa" => Some(SearchPrefix::Sa),
                "eb" => Some(SearchPrefix::Eb),
                "ap" => Some(SearchPrefix::Ap),
                _ => None,
            };
            // Only treat it as a prefix when the remainder looks like the
            // start of a literal (numeric or date), not plain text.
            if let Some(prefix) = prefix {
                if rest.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                    return (prefix, rest);
                }
            }
        }
        (SearchPrefix::Eq, value)
    }

    pub fn as_sql_op(&self) -> &'static str {
        match self {
            SearchPrefix::Eq => "=",
            SearchPrefix::Ne => "<>",
            SearchPrefix::Lt | SearchPrefix::Eb => "<",
            SearchPrefix::Le => "<=",
            SearchPrefix::Gt | SearchPrefix::Sa => ">",
            SearchPrefix::Ge => ">=",
            SearchPrefix::Ap => "=", // approximate: treated as equality +/- tolerance by the caller
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchModifier {
    Missing,
    Exact,
    Contains,
    Text,
    Not,
    Above,
    Below,
    In,
    NotIn,
    Identifier,
    OfType,
    Type(String),
}

impl SearchModifier {
    pub fn parse(raw: &str) -> SearchModifier {
        match raw {
            "missing" => SearchModifier::Missing,
            "exact" => SearchModifier::Exact,
            "contains" => SearchModifier::Contains,
            "text" => SearchModifier::Text,
            "not" => SearchModifier::Not,
            "above" => SearchModifier::Above,
            "below" => SearchModifier::Below,
            "in" => SearchModifier::In,
            "not-in" => SearchModifier::NotIn,
            "identifier" => SearchModifier::Identifier,
            "of-type" => SearchModifier::OfType,
            other => SearchModifier::Type(other.to_string()),
        }
    }

    /// Whether this modifier is legal for a parameter of the given type, per
    /// the FHIR R4 search modifier compatibility table.
    pub fn is_valid_for_type(&self, param_type: ParamType) -> bool {
        use ParamType::*;
        match self {
            SearchModifier::Missing => !matches!(param_type, Special),
            SearchModifier::Exact | SearchModifier::Contains => matches!(param_type, String),
            SearchModifier::Text => matches!(param_type, Token | Reference),
            SearchModifier::Not | SearchModifier::In | SearchModifier::NotIn => {
                matches!(param_type, Token)
            }
            SearchModifier::Above | SearchModifier::Below => matches!(param_type, Token | Uri),
            SearchModifier::Identifier => matches!(param_type, Reference),
            SearchModifier::OfType => matches!(param_type, Token),
            SearchModifier::Type(_) => matches!(param_type, Reference),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainLink {
    pub param_code: String,
    pub type_filter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Chain {
    pub links: Vec<ChainLink>,
    pub final_param: String,
    pub final_modifier: Option<SearchModifier>,
}

#[derive(Debug, Clone)]
pub struct ReverseChain {
    pub ref_type: String,
    pub ref_field: String,
    pub inner: ReverseChainInner,
}

#[derive(Debug, Clone)]
pub enum ReverseChainInner {
    Param {
        name: String,
        modifier: Option<SearchModifier>,
        values: Vec<String>,
    },
    Nested(Box<ReverseChain>),
}

#[derive(Debug, Clone)]
pub struct ResolvedParam {
    pub raw_name: String,
    pub code: String,
    pub modifier: Option<SearchModifier>,
    pub chain: Option<Chain>,
    pub reverse_chain: Option<ReverseChain>,
    pub composite: bool,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResultParams {
    pub count: Option<i64>,
    pub offset: i64,
    pub sort: Vec<(String, bool)>, // (param, descending)
    pub include: Vec<IncludeSpec>,
    pub rev_include: Vec<RevIncludeSpec>,
    pub summary_count_only: bool,
}

#[derive(Debug, Clone)]
pub struct IncludeSpec {
    pub source_type: String,
    pub param: String,
    pub target_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RevIncludeSpec {
    pub source_type: String,
    pub param: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSearch {
    pub predicates: Vec<ResolvedParam>,
    pub result: ResultParams,
    /// Parameter names that weren't recognized; dropped silently per FHIR's
    /// lenient-search contract (SPEC_FULL.md §4.4), but surfaced for callers
    /// (e.g. conditional reference resolution) that need to reject them.
    pub unknown_params: Vec<String>,
}

const MAX_CHAIN_DEPTH: usize = 8;

/// Parses a raw `(name, value)` query list into predicates and result params.
/// `name` may carry a `:modifier`; repeated names are OR'd within the same
/// predicate only via comma-separated values, and AND'd across predicates
/// (including repeats of the same name).
pub fn parse_query(items: &[(String, String)]) -> ParsedSearch {
    let mut out = ParsedSearch::default();

    for (raw_name, raw_value) in items {
        if raw_name == "_count" {
            out.result.count = raw_value.parse().ok();
            continue;
        }
        if raw_name == "_offset" {
            out.result.offset = raw_value.parse().unwrap_or(0);
            continue;
        }
        if raw_name == "_sort" {
            for part in raw_value.split(',') {
                let (desc, name) = part
                    .strip_prefix('-')
                    .map(|n| (true, n))
                    .unwrap_or((false, part));
                out.result.sort.push((name.to_string(), desc));
            }
            continue;
        }
        if raw_name == "_summary" {
            if raw_value == "count" {
                out.result.summary_count_only = true;
            }
            continue;
        }
        if raw_name.starts_with("_include") {
            if let Some(spec) = parse_include(raw_value) {
                out.result.include.push(spec);
            }
            continue;
        }
        if raw_name.starts_with("_revinclude") {
            if let Some(spec) = parse_revinclude(raw_value) {
                out.result.rev_include.push(spec);
            }
            continue;
        }
        if RESULT_PARAM_NAMES.contains(&raw_name.as_str()) || raw_name == "_elements" {
            continue;
        }

        if let Some(has) = raw_name.strip_prefix("_has:") {
            if let Some(rc) = parse_reverse_chain(has, raw_value, 0) {
                out.predicates.push(ResolvedParam {
                    raw_name: raw_name.clone(),
                    code: "_has".to_string(),
                    modifier: None,
                    chain: None,
                    reverse_chain: Some(rc),
                    composite: false,
                    values: vec![],
                });
            }
            continue;
        }

        let (name_and_modifier, values_raw) = (raw_name.as_str(), raw_value.as_str());
        let (base, modifier_str) = name_and_modifier
            .split_once(':')
            .map(|(b, m)| (b, Some(m)))
            .unwrap_or((name_and_modifier, None));

        let values: Vec<String> = split_unescaped(values_raw, ',');

        if base.contains('.') {
            if let Some(chain) = parse_chain(base, modifier_str) {
                out.predicates.push(ResolvedParam {
                    raw_name: raw_name.clone(),
                    code: base.to_string(),
                    modifier: None,
                    chain: Some(chain),
                    reverse_chain: None,
                    composite: false,
                    values,
                });
            }
            continue;
        }

        let is_composite = base.contains('-') && values_raw.contains('$');
        if !is_composite && base != "_id" && param_type_for(base).is_none() {
            out.unknown_params.push(base.to_string());
            continue;
        }
        out.predicates.push(ResolvedParam {
            raw_name: raw_name.clone(),
            code: base.to_string(),
            modifier: modifier_str.map(SearchModifier::parse),
            chain: None,
            reverse_chain: None,
            composite: is_composite,
            values,
        });
    }

    out
}

fn parse_chain(base: &str, top_modifier: Option<&str>) -> Option<Chain> {
    let mut segments: Vec<&str> = base.split('.').collect();
    if segments.len() > MAX_CHAIN_DEPTH {
        return None;
    }
    let final_segment = segments.pop()?;
    let mut links = Vec::new();
    let mut first = true;
    for seg in segments {
        let (code, type_filter) = if first {
            (
                seg,
                top_modifier.map(str::to_string).filter(|m| {
                    m.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false)
                }),
            )
        } else {
            (seg, None)
        };
        links.push(ChainLink {
            param_code: code.to_string(),
            type_filter,
        });
        first = false;
    }
    Some(Chain {
        links,
        final_param: final_segment.to_string(),
        final_modifier: None,
    })
}

fn parse_reverse_chain(spec: &str, value: &str, depth: usize) -> Option<ReverseChain> {
    if depth > MAX_CHAIN_DEPTH {
        return None;
    }
    let mut parts = spec.splitn(3, ':');
    let ref_type = parts.next()?.to_string();
    let ref_field = parts.next()?.to_string();
    let rest = parts.next()?;

    let inner = if let Some(nested) = rest.strip_prefix("_has:") {
        ReverseChainInner::Nested(Box::new(parse_reverse_chain(nested, value, depth + 1)?))
    } else {
        let (name, modifier_str) = rest
            .split_once(':')
            .map(|(n, m)| (n, Some(m)))
            .unwrap_or((rest, None));
        ReverseChainInner::Param {
            name: name.to_string(),
            modifier: modifier_str.map(SearchModifier::parse),
            values: split_unescaped(value, ','),
        }
    };

    Some(ReverseChain {
        ref_type,
        ref_field,
        inner,
    })
}

fn parse_include(value: &str) -> Option<IncludeSpec> {
    let mut parts = value.splitn(3, ':');
    let source_type = parts.next()?.to_string();
    let param = parts.next()?.to_string();
    let target_type = parts.next().map(str::to_string);
    Some(IncludeSpec {
        source_type,
        param,
        target_type,
    })
}

fn parse_revinclude(value: &str) -> Option<RevIncludeSpec> {
    let mut parts = value.splitn(2, ':');
    let source_type = parts.next()?.to_string();
    let param = parts.next()?.to_string();
    Some(RevIncludeSpec { source_type, param })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_token_predicate() {
        let items = vec![("gender".to_string(), "female".to_string())];
        let parsed = parse_query(&items);
        assert_eq!(parsed.predicates.len(), 1);
        assert_eq!(parsed.predicates[0].code, "gender");
    }

    #[test]
    fn parses_modifier() {
        let items = vec![("name:exact".to_string(), "Smith".to_string())];
        let parsed = parse_query(&items);
        assert_eq!(parsed.predicates[0].modifier, Some(SearchModifier::Exact));
    }

    #[test]
    fn parses_date_prefix() {
        let (prefix, rest) = SearchPrefix::parse("ge2024-02-01");
        assert_eq!(prefix, SearchPrefix::Ge);
        assert_eq!(rest, "2024-02-01");
    }

    #[test]
    fn parses_two_level_chain() {
        let items = vec![("organization.partof.name".to_string(), "Acme".to_string())];
        let parsed = parse_query(&items);
        let chain = parsed.predicates[0].chain.as_ref().unwrap();
        assert_eq!(chain.links.len(), 2);
        assert_eq!(chain.final_param, "name");
    }

    #[test]
    fn parses_has_reverse_chain() {
        let items = vec![(
            "_has:Observation:patient:code".to_string(),
            "8867-4".to_string(),
        )];
        let parsed = parse_query(&items);
        let rc = parsed.predicates[0].reverse_chain.as_ref().unwrap();
        assert_eq!(rc.ref_type, "Observation");
        assert_eq!(rc.ref_field, "patient");
    }

    #[test]
    fn parses_count_and_sort() {
        let items = vec![
            ("_count".to_string(), "10".to_string()),
            ("_sort".to_string(), "-date,name".to_string()),
        ];
        let parsed = parse_query(&items);
        assert_eq!(parsed.result.count, Some(10));
        assert_eq!(parsed.result.sort, vec![("date".to_string(), true), ("name".to_string(), false)]);
    }
}
