//! Parsing and classification of FHIR `Reference.reference` string values.
//!
//! Mirrors the reference-kind taxonomy the reference server's FHIRPath-backed
//! resolver uses internally, minus the FHIRPath/HTTP-fetch machinery that
//! comes with evaluating `Reference` elements dynamically (out of scope here
//! — see `SPEC_FULL.md` §4.2).

use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedReference {
    /// `#local-id`, pointing at a contained resource.
    Contained(String),
    /// `Type/id`, possibly recovered from an absolute URL.
    Local { resource_type: String, id: String },
    /// `urn:uuid:<uuid>`; the target type is not encoded in the string itself.
    UrnUuid { uuid: String },
    /// `Type?search-criteria`, resolved at bundle-insert time.
    Conditional {
        resource_type: String,
        query: String,
    },
}

/// Maps a containing field name to the FHIR resource type it conventionally
/// references, for `urn:uuid:` values where the type isn't in the string.
pub fn infer_type_from_field_name(field: &str) -> Option<&'static str> {
    match field {
        "subject" | "patient" => Some("Patient"),
        "encounter" => Some("Encounter"),
        "performer" | "author" | "requester" | "asserter" | "recorder" | "practitioner" => {
            Some("Practitioner")
        }
        "organization" | "partOf" | "managingOrganization" | "custodian" => Some("Organization"),
        "medication" => Some("Medication"),
        "location" => Some("Location"),
        "basedOn" => Some("ServiceRequest"),
        _ => None,
    }
}

/// Parses a `Reference.reference` string into its structural kind. Contained
/// (`#`) references and conditional (`Type?...`) references are recognized
/// but not resolved here; resolution happens in `services::conditional`.
pub fn parse_reference(raw: &str) -> Option<ParsedReference> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(local) = raw.strip_prefix('#') {
        return Some(ParsedReference::Contained(local.to_string()));
    }

    if let Some(uuid) = raw.strip_prefix("urn:uuid:") {
        return Some(ParsedReference::UrnUuid {
            uuid: normalize_uuid(uuid),
        });
    }

    let lower = raw.to_ascii_lowercase();
    let (path, query) = if lower.starts_with("http://") || lower.starts_with("https://") {
        let url = Url::parse(raw).ok()?;
        (
            url.path().trim_matches('/').to_string(),
            url.query().map(|q| q.to_string()),
        )
    } else {
        let (p, q) = raw.split_once('?').map_or((raw, None), |(p, q)| (p, Some(q)));
        (p.trim_matches('/').to_string(), query_owned(q))
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if let Some(query) = query {
        // The resource type is the last path segment before the `?`.
        let resource_type = segments.last()?.to_string();
        return Some(ParsedReference::Conditional {
            resource_type,
            query,
        });
    }

    if segments.len() >= 2 {
        let id = segments[segments.len() - 1].to_string();
        let resource_type = segments[segments.len() - 2].to_string();
        return Some(ParsedReference::Local { resource_type, id });
    }

    None
}

fn query_owned(q: Option<&str>) -> Option<String> {
    q.map(|s| s.to_string())
}

/// Best-effort repair of a malformed (missing hyphens) uuid string; returns
/// the input unchanged if it isn't recoverable.
fn normalize_uuid(raw: &str) -> String {
    let compact: String = raw.chars().filter(|c| *c != '-').collect();
    if compact.len() == 32 && compact.chars().all(|c| c.is_ascii_hexdigit()) {
        format!(
            "{}-{}-{}-{}-{}",
            &compact[0..8],
            &compact[8..12],
            &compact[12..16],
            &compact[16..20],
            &compact[20..32]
        )
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_reference() {
        assert_eq!(
            parse_reference("Patient/123"),
            Some(ParsedReference::Local {
                resource_type: "Patient".into(),
                id: "123".into()
            })
        );
    }

    #[test]
    fn parses_absolute_url() {
        assert_eq!(
            parse_reference("http://example.org/fhir/Patient/123"),
            Some(ParsedReference::Local {
                resource_type: "Patient".into(),
                id: "123".into()
            })
        );
    }

    #[test]
    fn parses_urn_uuid() {
        assert_eq!(
            parse_reference("urn:uuid:abcd1234-ab12-cd34-ef56-0123456789ab"),
            Some(ParsedReference::UrnUuid {
                uuid: "abcd1234-ab12-cd34-ef56-0123456789ab".into()
            })
        );
    }

    #[test]
    fn parses_contained_reference() {
        assert_eq!(
            parse_reference("#med1"),
            Some(ParsedReference::Contained("med1".into()))
        );
    }

    #[test]
    fn parses_conditional_reference() {
        assert_eq!(
            parse_reference("Patient?identifier=http://ex|MRN-1"),
            Some(ParsedReference::Conditional {
                resource_type: "Patient".into(),
                query: "identifier=http://ex|MRN-1".into()
            })
        );
    }

    #[test]
    fn infers_type_from_field() {
        assert_eq!(infer_type_from_field_name("subject"), Some("Patient"));
        assert_eq!(infer_type_from_field_name("unknownfield"), None);
    }
}
