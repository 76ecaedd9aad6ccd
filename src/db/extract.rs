//! Search-parameter and reference extraction.
//!
//! Walks a canonical resource and produces the typed index rows the search
//! engine matches against. Each resource type gets an explicit extraction
//! function naming the fixed set of paths it indexes, mirroring the reference
//! server's per-type `extract_*` functions (`services/indexing/extract.rs`)
//! but writing into the single `search_params` table this server's schema
//! uses instead of one table per parameter type.

use crate::models::reference::{infer_type_from_field_name, parse_reference, ParsedReference};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Token,
    Date,
    Number,
    Reference,
    Quantity,
    Uri,
    Special,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Token => "token",
            ParamType::Date => "date",
            ParamType::Number => "number",
            ParamType::Reference => "reference",
            ParamType::Quantity => "quantity",
            ParamType::Uri => "uri",
            ParamType::Special => "special",
        }
    }
}

/// The declared type for every search-parameter code this server indexes,
/// i.e. every `param_name` a push_* helper below can emit. The single
/// source of truth for "is this a real parameter" — a code absent from this
/// table isn't a parameter this server knows about, not a string param that
/// happens to never match (`SPEC_FULL.md` §4.4: unknown params are dropped,
/// not compiled into an always-false clause).
pub fn param_type_for(code: &str) -> Option<ParamType> {
    use ParamType::*;
    Some(match code {
        "_id" | "gender" | "active" | "status" | "intent" | "code" | "class" | "type"
        | "clinical-status" | "category" | "role" | "specialty" | "vaccine-code"
        | "component-code" | "identifier" | "telecom" | "phone" | "email" => Token,
        "_lastUpdated" | "birthdate" | "date" | "authoredon" | "authored" | "recorded-date"
        | "onset-date" | "effective-time" => Date,
        "_profile" => Uri,
        "value-quantity" => Quantity,
        "near" => Special,
        "general-practitioner" | "organization" | "partof" | "subject" | "patient"
        | "encounter" | "participant" | "requester" | "practitioner" | "service-provider"
        | "based-on" | "request" | "result" | "medication" | "addresses" => Reference,
        "family" | "given" | "name" | "address-city" | "address-state"
        | "address-postalcode" => String,
        _ => return None,
    })
}

#[derive(Debug, Clone, Default)]
pub struct SearchParamRow {
    pub param_name: String,
    pub param_type: Option<ParamType>,
    pub value_string: Option<String>,
    pub value_number: Option<f64>,
    pub value_date: Option<DateTime<Utc>>,
    pub value_token_system: Option<String>,
    pub value_token_code: Option<String>,
    pub value_reference: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReferenceRow {
    pub target_type: Option<String>,
    pub target_id: String,
    pub reference_path: String,
    pub reference_value: String,
}

/// Extracts every search-parameter row for a resource of the given type.
pub fn extract_search_params(resource_type: &str, resource: &JsonValue) -> Vec<SearchParamRow> {
    let mut rows = Vec::new();

    // Common parameters present on every resource type.
    if let Some(id) = resource.get("id").and_then(JsonValue::as_str) {
        push_token(&mut rows, "_id", None, Some(id));
    }
    if let Some(last_updated) = resource
        .pointer("/meta/lastUpdated")
        .and_then(JsonValue::as_str)
    {
        push_date(&mut rows, "_lastUpdated", last_updated);
    }
    if let Some(profiles) = resource.pointer("/meta/profile").and_then(JsonValue::as_array) {
        for p in profiles {
            if let Some(p) = p.as_str() {
                push_uri(&mut rows, "_profile", p);
            }
        }
    }

    match resource_type {
        "Patient" => extract_patient(&mut rows, resource),
        "Practitioner" => extract_person_like(&mut rows, resource),
        "PractitionerRole" => extract_practitioner_role(&mut rows, resource),
        "RelatedPerson" => extract_person_like(&mut rows, resource),
        "Organization" => extract_organization(&mut rows, resource),
        "Location" => extract_location(&mut rows, resource),
        "Encounter" => extract_encounter(&mut rows, resource),
        "Observation" => extract_observation(&mut rows, resource),
        "Condition" => extract_condition(&mut rows, resource),
        "MedicationRequest" => extract_medication_request(&mut rows, resource),
        "MedicationAdministration" => extract_medication_administration(&mut rows, resource),
        "ServiceRequest" => extract_service_request(&mut rows, resource),
        "Procedure" => extract_procedure(&mut rows, resource),
        "AllergyIntolerance" => extract_allergy_intolerance(&mut rows, resource),
        "CareTeam" => extract_care_team(&mut rows, resource),
        "CarePlan" => extract_care_plan(&mut rows, resource),
        "Device" => extract_device(&mut rows, resource),
        "DocumentReference" => extract_document_reference(&mut rows, resource),
        "DiagnosticReport" => extract_diagnostic_report(&mut rows, resource),
        "Immunization" => extract_immunization(&mut rows, resource),
        _ => {}
    }

    rows
}

/// Extracts every reference occurring anywhere in a resource, for `references`
/// table population (used by chains, `_has`, `_include`, `_revinclude`).
pub fn extract_references(resource: &JsonValue) -> Vec<ReferenceRow> {
    let mut rows = Vec::new();
    walk_references(resource, "", &mut rows);
    rows
}

fn walk_references(value: &JsonValue, path: &str, out: &mut Vec<ReferenceRow>) {
    match value {
        JsonValue::Object(map) => {
            if let Some(JsonValue::String(reference)) = map.get("reference") {
                if let Some(parsed) = parse_reference(reference) {
                    let field_name = path.rsplit('.').next().unwrap_or(path);
                    match parsed {
                        ParsedReference::Local { resource_type, id } => {
                            out.push(ReferenceRow {
                                target_type: Some(resource_type),
                                target_id: id,
                                reference_path: path.to_string(),
                                reference_value: reference.clone(),
                            });
                        }
                        ParsedReference::UrnUuid { uuid } => {
                            out.push(ReferenceRow {
                                target_type: infer_type_from_field_name(field_name)
                                    .map(str::to_string),
                                target_id: uuid,
                                reference_path: path.to_string(),
                                reference_value: reference.clone(),
                            });
                        }
                        // Contained and conditional references are not indexed:
                        // contained resources aren't separately addressable, and
                        // conditional references are resolved before storage.
                        ParsedReference::Contained(_) | ParsedReference::Conditional { .. } => {}
                    }
                }
            }
            for (k, v) in map {
                let child_path = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                walk_references(v, &child_path, out);
            }
        }
        JsonValue::Array(arr) => {
            for v in arr {
                walk_references(v, path, out);
            }
        }
        _ => {}
    }
}

// ---- shared field helpers -------------------------------------------------

fn push_string(rows: &mut Vec<SearchParamRow>, name: &str, value: impl Into<String>) {
    rows.push(SearchParamRow {
        param_name: name.to_string(),
        param_type: Some(ParamType::String),
        value_string: Some(value.into()),
        ..Default::default()
    });
}

fn push_uri(rows: &mut Vec<SearchParamRow>, name: &str, value: impl Into<String>) {
    rows.push(SearchParamRow {
        param_name: name.to_string(),
        param_type: Some(ParamType::Uri),
        value_string: Some(value.into()),
        ..Default::default()
    });
}

fn push_token(rows: &mut Vec<SearchParamRow>, name: &str, system: Option<&str>, code: Option<&str>) {
    if system.is_none() && code.is_none() {
        return;
    }
    rows.push(SearchParamRow {
        param_name: name.to_string(),
        param_type: Some(ParamType::Token),
        value_token_system: system.map(str::to_string),
        value_token_code: code.map(str::to_string),
        ..Default::default()
    });
}

fn push_codeable_concept(rows: &mut Vec<SearchParamRow>, name: &str, cc: &JsonValue) {
    if let Some(codings) = cc.get("coding").and_then(JsonValue::as_array) {
        for coding in codings {
            let system = coding.get("system").and_then(JsonValue::as_str);
            let code = coding.get("code").and_then(JsonValue::as_str);
            if code.is_some() {
                push_token(rows, name, system, code);
            }
        }
    }
}

fn push_identifier(rows: &mut Vec<SearchParamRow>, name: &str, identifier: &JsonValue) {
    let system = identifier.get("system").and_then(JsonValue::as_str);
    let code = identifier.get("value").and_then(JsonValue::as_str);
    if code.is_some() || system.is_some() {
        push_token(rows, name, system, code);
    }
}

fn push_date(rows: &mut Vec<SearchParamRow>, name: &str, raw: &str) {
    if let Some(instant) = parse_fhir_instant(raw) {
        rows.push(SearchParamRow {
            param_name: name.to_string(),
            param_type: Some(ParamType::Date),
            value_date: Some(instant),
            ..Default::default()
        });
    } else {
        tracing::debug!(param = name, value = raw, "failed to parse date for indexing");
    }
}

fn push_number(rows: &mut Vec<SearchParamRow>, name: &str, value: f64) {
    rows.push(SearchParamRow {
        param_name: name.to_string(),
        param_type: Some(ParamType::Number),
        value_number: Some(value),
        ..Default::default()
    });
}

fn push_reference_param(rows: &mut Vec<SearchParamRow>, name: &str, reference: &JsonValue) {
    let Some(raw) = reference.get("reference").and_then(JsonValue::as_str) else {
        return;
    };
    let Some(parsed) = parse_reference(raw) else {
        return;
    };
    match parsed {
        ParsedReference::Local { id, .. } => {
            rows.push(SearchParamRow {
                param_name: name.to_string(),
                param_type: Some(ParamType::Reference),
                value_reference: Some(id),
                value_string: Some(raw.to_string()),
                ..Default::default()
            });
        }
        ParsedReference::UrnUuid { uuid } => {
            rows.push(SearchParamRow {
                param_name: name.to_string(),
                param_type: Some(ParamType::Reference),
                value_reference: Some(uuid),
                value_string: Some(raw.to_string()),
                ..Default::default()
            });
        }
        ParsedReference::Contained(_) | ParsedReference::Conditional { .. } => {}
    }
    if let Some(identifier) = reference.get("identifier") {
        push_identifier(rows, name, identifier);
    }
}

/// Parses the 4 FHIR `date`/`dateTime`/`instant` precisions into a UTC instant
/// representing the period start.
pub fn parse_fhir_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if raw.len() == 10 {
        if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
        }
    }
    if raw.len() == 7 {
        if let Ok(d) = NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d") {
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
        }
    }
    if raw.len() == 4 {
        if let Ok(d) = NaiveDate::parse_from_str(&format!("{raw}-01-01"), "%Y-%m-%d") {
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

fn each<'a>(resource: &'a JsonValue, field: &str) -> Vec<&'a JsonValue> {
    match resource.get(field) {
        Some(JsonValue::Array(arr)) => arr.iter().collect(),
        Some(v @ JsonValue::Object(_)) => vec![v],
        _ => vec![],
    }
}

fn get_value_x<'a>(resource: &'a JsonValue, prefix: &str) -> Option<(&'static str, &'a JsonValue)> {
    const SUFFIXES: &[&str] = &[
        "DateTime", "Period", "Quantity", "CodeableConcept", "String", "Boolean", "Integer",
        "Range", "Ratio", "Instant",
    ];
    for suffix in SUFFIXES {
        if let Some(v) = resource.get(format!("{prefix}{suffix}")) {
            return Some((suffix, v));
        }
    }
    None
}

// ---- per-resource-type extraction -----------------------------------------

fn extract_patient(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    for identifier in each(r, "identifier") {
        push_identifier(rows, "identifier", identifier);
    }
    for name in each(r, "name") {
        if let Some(family) = name.get("family").and_then(JsonValue::as_str) {
            push_string(rows, "family", family);
        }
        for given in name.get("given").and_then(JsonValue::as_array).into_iter().flatten() {
            if let Some(g) = given.as_str() {
                push_string(rows, "given", g);
            }
        }
    }
    if let Some(gender) = r.get("gender").and_then(JsonValue::as_str) {
        push_token(rows, "gender", None, Some(gender));
    }
    if let Some(birthdate) = r.get("birthDate").and_then(JsonValue::as_str) {
        push_date(rows, "birthdate", birthdate);
    }
    if let Some(active) = r.get("active").and_then(JsonValue::as_bool) {
        push_token(rows, "active", None, Some(if active { "true" } else { "false" }));
    }
    for gp in each(r, "generalPractitioner") {
        push_reference_param(rows, "general-practitioner", gp);
    }
    if let Some(org) = r.get("managingOrganization") {
        push_reference_param(rows, "organization", org);
    }
    for telecom in each(r, "telecom") {
        if let Some(value) = telecom.get("value").and_then(JsonValue::as_str) {
            let system = telecom.get("system").and_then(JsonValue::as_str);
            match system {
                Some("phone") => push_token(rows, "phone", None, Some(value)),
                Some("email") => push_token(rows, "email", None, Some(value)),
                _ => push_token(rows, "telecom", system, Some(value)),
            }
        }
    }
    for address in each(r, "address") {
        if let Some(city) = address.get("city").and_then(JsonValue::as_str) {
            push_string(rows, "address-city", city);
        }
        if let Some(state) = address.get("state").and_then(JsonValue::as_str) {
            push_string(rows, "address-state", state);
        }
        if let Some(postal) = address.get("postalCode").and_then(JsonValue::as_str) {
            push_string(rows, "address-postalcode", postal);
        }
    }
}

fn extract_person_like(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    for identifier in each(r, "identifier") {
        push_identifier(rows, "identifier", identifier);
    }
    for name in each(r, "name") {
        if let Some(family) = name.get("family").and_then(JsonValue::as_str) {
            push_string(rows, "family", family);
        }
        for given in name.get("given").and_then(JsonValue::as_array).into_iter().flatten() {
            if let Some(g) = given.as_str() {
                push_string(rows, "given", g);
            }
        }
    }
    if let Some(active) = r.get("active").and_then(JsonValue::as_bool) {
        push_token(rows, "active", None, Some(if active { "true" } else { "false" }));
    }
}

fn extract_practitioner_role(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(practitioner) = r.get("practitioner") {
        push_reference_param(rows, "practitioner", practitioner);
    }
    if let Some(organization) = r.get("organization") {
        push_reference_param(rows, "organization", organization);
    }
    for code in each(r, "code") {
        push_codeable_concept(rows, "role", code);
    }
    for specialty in each(r, "specialty") {
        push_codeable_concept(rows, "specialty", specialty);
    }
}

fn extract_organization(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    for identifier in each(r, "identifier") {
        push_identifier(rows, "identifier", identifier);
    }
    if let Some(name) = r.get("name").and_then(JsonValue::as_str) {
        push_string(rows, "name", name);
    }
    if let Some(part_of) = r.get("partOf") {
        push_reference_param(rows, "partof", part_of);
    }
    for t in each(r, "type") {
        push_codeable_concept(rows, "type", t);
    }
}

fn extract_location(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(name) = r.get("name").and_then(JsonValue::as_str) {
        push_string(rows, "name", name);
    }
    if let Some(status) = r.get("status").and_then(JsonValue::as_str) {
        push_token(rows, "status", None, Some(status));
    }
    if let Some(managing_org) = r.get("managingOrganization") {
        push_reference_param(rows, "organization", managing_org);
    }
    if let Some(part_of) = r.get("partOf") {
        push_reference_param(rows, "partof", part_of);
    }
    if let Some(position) = r.get("position") {
        if let (Some(lat), Some(lon)) = (
            position.get("latitude").and_then(JsonValue::as_f64),
            position.get("longitude").and_then(JsonValue::as_f64),
        ) {
            rows.push(SearchParamRow {
                param_name: "near".to_string(),
                param_type: Some(ParamType::Special),
                value_string: Some(format!("{lat},{lon}")),
                ..Default::default()
            });
        }
    }
}

fn extract_encounter(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(status) = r.get("status").and_then(JsonValue::as_str) {
        push_token(rows, "status", None, Some(status));
    }
    match r.get("class") {
        Some(JsonValue::Array(arr)) => {
            for cc in arr {
                push_codeable_concept(rows, "class", cc);
            }
        }
        Some(cc @ JsonValue::Object(_)) => push_codeable_concept(rows, "class", cc),
        _ => {}
    }
    if let Some(subject) = r.get("subject") {
        push_reference_param(rows, "subject", subject);
        push_reference_param(rows, "patient", subject);
    }
    for participant in each(r, "participant") {
        if let Some(actor) = participant.get("actor") {
            push_reference_param(rows, "participant", actor);
        }
    }
    if let Some(period) = r.pointer("/actualPeriod/start").and_then(JsonValue::as_str) {
        push_date(rows, "date", period);
    } else if let Some(period) = r.pointer("/period/start").and_then(JsonValue::as_str) {
        push_date(rows, "date", period);
    }
    if let Some(service_provider) = r.get("serviceProvider") {
        push_reference_param(rows, "service-provider", service_provider);
    }
}

fn extract_observation(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(status) = r.get("status").and_then(JsonValue::as_str) {
        push_token(rows, "status", None, Some(status));
    }
    if let Some(code) = r.get("code") {
        push_codeable_concept(rows, "code", code);
    }
    if let Some(subject) = r.get("subject") {
        push_reference_param(rows, "subject", subject);
        push_reference_param(rows, "patient", subject);
    }
    if let Some(encounter) = r.get("encounter") {
        push_reference_param(rows, "encounter", encounter);
    }
    for based_on in each(r, "basedOn") {
        push_reference_param(rows, "based-on", based_on);
    }
    if let Some(effective) = r.pointer("/effectiveDateTime").and_then(JsonValue::as_str) {
        push_date(rows, "date", effective);
    } else if let Some(start) = r.pointer("/effectivePeriod/start").and_then(JsonValue::as_str) {
        push_date(rows, "date", start);
    }
    if let Some(value_quantity) = r.get("valueQuantity") {
        if let Some(value) = value_quantity.get("value").and_then(JsonValue::as_f64) {
            push_number(rows, "value-quantity", value);
        }
    }
    for component in each(r, "component") {
        if let Some(code) = component.get("code") {
            push_codeable_concept(rows, "component-code", code);
        }
    }
    for category in each(r, "category") {
        push_codeable_concept(rows, "category", category);
    }
}

fn extract_condition(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(code) = r.get("code") {
        push_codeable_concept(rows, "code", code);
    }
    if let Some(subject) = r.get("subject") {
        push_reference_param(rows, "subject", subject);
        push_reference_param(rows, "patient", subject);
    }
    if let Some(encounter) = r.get("encounter") {
        push_reference_param(rows, "encounter", encounter);
    }
    for category in each(r, "category") {
        push_codeable_concept(rows, "category", category);
    }
    if let Some(clinical_status) = r.get("clinicalStatus") {
        push_codeable_concept(rows, "clinical-status", clinical_status);
    }
    if let Some((_, value)) = get_value_x(r, "onset") {
        if let Some(s) = value.as_str() {
            push_date(rows, "onset-date", s);
        }
    }
    if let Some(recorded) = r.get("recordedDate").and_then(JsonValue::as_str) {
        push_date(rows, "recorded-date", recorded);
    }
}

fn extract_medication_request(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(status) = r.get("status").and_then(JsonValue::as_str) {
        push_token(rows, "status", None, Some(status));
    }
    if let Some(intent) = r.get("intent").and_then(JsonValue::as_str) {
        push_token(rows, "intent", None, Some(intent));
    }
    if let Some(cc) = r.get("medicationCodeableConcept") {
        push_codeable_concept(rows, "code", cc);
    }
    if let Some(medication_ref) = r.get("medicationReference") {
        push_reference_param(rows, "medication", medication_ref);
    }
    if let Some(subject) = r.get("subject") {
        push_reference_param(rows, "subject", subject);
        push_reference_param(rows, "patient", subject);
    }
    if let Some(encounter) = r.get("encounter") {
        push_reference_param(rows, "encounter", encounter);
    }
    if let Some(requester) = r.get("requester") {
        push_reference_param(rows, "requester", requester);
    }
    if let Some(authored_on) = r.get("authoredOn").and_then(JsonValue::as_str) {
        push_date(rows, "authoredon", authored_on);
    }
}

fn extract_medication_administration(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(status) = r.get("status").and_then(JsonValue::as_str) {
        push_token(rows, "status", None, Some(status));
    }
    if let Some(cc) = r.pointer("/medication/concept").or_else(|| r.get("medicationCodeableConcept")) {
        push_codeable_concept(rows, "code", cc);
    }
    if let Some(subject) = r.get("subject") {
        push_reference_param(rows, "subject", subject);
        push_reference_param(rows, "patient", subject);
    }
    if let Some(request) = r.get("request") {
        push_reference_param(rows, "request", request);
    }
    // Canonical spelling used throughout this server — see SPEC_FULL.md §9
    // (the source system's `occurence` field name traced to a dependency typo).
    if let Some(s) = r.pointer("/occurrenceDateTime").and_then(JsonValue::as_str) {
        push_date(rows, "effective-time", s);
    } else if let Some(s) = r.pointer("/occurrencePeriod/start").and_then(JsonValue::as_str) {
        push_date(rows, "effective-time", s);
    }
}

fn extract_service_request(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(status) = r.get("status").and_then(JsonValue::as_str) {
        push_token(rows, "status", None, Some(status));
    }
    if let Some(intent) = r.get("intent").and_then(JsonValue::as_str) {
        push_token(rows, "intent", None, Some(intent));
    }
    if let Some(code) = r.get("code") {
        push_codeable_concept(rows, "code", code);
    }
    if let Some(subject) = r.get("subject") {
        push_reference_param(rows, "subject", subject);
        push_reference_param(rows, "patient", subject);
    }
    if let Some(encounter) = r.get("encounter") {
        push_reference_param(rows, "encounter", encounter);
    }
    if let Some(requester) = r.get("requester") {
        push_reference_param(rows, "requester", requester);
    }
    for category in each(r, "category") {
        push_codeable_concept(rows, "category", category);
    }
    if let Some(authored_on) = r.get("authoredOn").and_then(JsonValue::as_str) {
        push_date(rows, "authored", authored_on);
    }
}

fn extract_procedure(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(status) = r.get("status").and_then(JsonValue::as_str) {
        push_token(rows, "status", None, Some(status));
    }
    if let Some(code) = r.get("code") {
        push_codeable_concept(rows, "code", code);
    }
    if let Some(subject) = r.get("subject") {
        push_reference_param(rows, "subject", subject);
        push_reference_param(rows, "patient", subject);
    }
    if let Some(encounter) = r.get("encounter") {
        push_reference_param(rows, "encounter", encounter);
    }
    if let Some(s) = r.pointer("/occurrenceDateTime").and_then(JsonValue::as_str) {
        push_date(rows, "date", s);
    } else if let Some(s) = r.pointer("/occurrencePeriod/start").and_then(JsonValue::as_str) {
        push_date(rows, "date", s);
    }
}

fn extract_allergy_intolerance(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(code) = r.get("code") {
        push_codeable_concept(rows, "code", code);
    }
    if let Some(patient) = r.get("patient") {
        push_reference_param(rows, "patient", patient);
    }
    if let Some(clinical_status) = r.get("clinicalStatus") {
        push_codeable_concept(rows, "clinical-status", clinical_status);
    }
    if let Some(t) = r.get("type").and_then(JsonValue::as_str) {
        push_token(rows, "type", None, Some(t));
    } else if let Some(t) = r.get("type") {
        push_codeable_concept(rows, "type", t);
    }
}

fn extract_care_team(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(status) = r.get("status").and_then(JsonValue::as_str) {
        push_token(rows, "status", None, Some(status));
    }
    if let Some(subject) = r.get("subject") {
        push_reference_param(rows, "subject", subject);
        push_reference_param(rows, "patient", subject);
    }
    for participant in each(r, "participant") {
        if let Some(member) = participant.get("member") {
            push_reference_param(rows, "participant", member);
        }
    }
}

fn extract_care_plan(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(status) = r.get("status").and_then(JsonValue::as_str) {
        push_token(rows, "status", None, Some(status));
    }
    if let Some(subject) = r.get("subject") {
        push_reference_param(rows, "subject", subject);
        push_reference_param(rows, "patient", subject);
    }
    for category in each(r, "category") {
        push_codeable_concept(rows, "category", category);
    }
    for addresses in each(r, "addresses") {
        push_reference_param(rows, "addresses", addresses);
    }
}

fn extract_device(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    for identifier in each(r, "identifier") {
        push_identifier(rows, "identifier", identifier);
    }
    for t in each(r, "type") {
        push_codeable_concept(rows, "type", t);
    }
    if let Some(patient) = r.get("patient") {
        push_reference_param(rows, "patient", patient);
    }
}

fn extract_document_reference(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(status) = r.get("status").and_then(JsonValue::as_str) {
        push_token(rows, "status", None, Some(status));
    }
    if let Some(t) = r.get("type") {
        push_codeable_concept(rows, "type", t);
    }
    if let Some(subject) = r.get("subject") {
        push_reference_param(rows, "subject", subject);
        push_reference_param(rows, "patient", subject);
    }
    if let Some(encounter) = r.pointer("/context/encounter") {
        push_reference_param(rows, "encounter", encounter);
    }
    if let Some(date) = r.get("date").and_then(JsonValue::as_str) {
        push_date(rows, "date", date);
    }
}

fn extract_diagnostic_report(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(status) = r.get("status").and_then(JsonValue::as_str) {
        push_token(rows, "status", None, Some(status));
    }
    if let Some(code) = r.get("code") {
        push_codeable_concept(rows, "code", code);
    }
    if let Some(subject) = r.get("subject") {
        push_reference_param(rows, "subject", subject);
        push_reference_param(rows, "patient", subject);
    }
    for result in each(r, "result") {
        push_reference_param(rows, "result", result);
    }
    if let Some(effective) = r.get("effectiveDateTime").and_then(JsonValue::as_str) {
        push_date(rows, "date", effective);
    }
}

fn extract_immunization(rows: &mut Vec<SearchParamRow>, r: &JsonValue) {
    if let Some(status) = r.get("status").and_then(JsonValue::as_str) {
        push_token(rows, "status", None, Some(status));
    }
    if let Some(vaccine_code) = r.get("vaccineCode") {
        push_codeable_concept(rows, "vaccine-code", vaccine_code);
    }
    if let Some(patient) = r.get("patient") {
        push_reference_param(rows, "patient", patient);
    }
    if let Some(date) = r.get("occurrenceDateTime").and_then(JsonValue::as_str) {
        push_date(rows, "date", date);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_patient_common_and_declared_params() {
        let patient = json!({
            "resourceType": "Patient",
            "id": "p1",
            "meta": {"lastUpdated": "2024-01-01T00:00:00Z"},
            "name": [{"family": "Smith", "given": ["Jo"]}],
            "gender": "female",
            "birthDate": "1990-05-01",
        });
        let rows = extract_search_params("Patient", &patient);
        assert!(rows.iter().any(|r| r.param_name == "_id" && r.value_token_code.as_deref() == Some("p1")));
        assert!(rows.iter().any(|r| r.param_name == "family" && r.value_string.as_deref() == Some("Smith")));
        assert!(rows.iter().any(|r| r.param_name == "gender" && r.value_token_code.as_deref() == Some("female")));
        assert!(rows.iter().any(|r| r.param_name == "birthdate"));
    }

    #[test]
    fn extracts_token_search_params_for_observation_code() {
        let obs = json!({
            "resourceType": "Observation",
            "id": "o1",
            "status": "final",
            "code": {"coding": [{"system": "http://loinc.org", "code": "8867-4"}]},
            "subject": {"reference": "Patient/p1"},
        });
        let rows = extract_search_params("Observation", &obs);
        assert!(rows.iter().any(|r| r.param_name == "code"
            && r.value_token_system.as_deref() == Some("http://loinc.org")
            && r.value_token_code.as_deref() == Some("8867-4")));
        assert!(rows
            .iter()
            .any(|r| r.param_name == "patient" && r.value_reference.as_deref() == Some("p1")));
    }

    #[test]
    fn extracts_references_including_urn_uuid() {
        let obs = json!({
            "resourceType": "Observation",
            "subject": {"reference": "urn:uuid:11111111-1111-1111-1111-111111111111"},
        });
        let refs = extract_references(&obs);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].target_type.as_deref(), Some("Patient"));
    }

    #[test]
    fn parses_all_four_date_precisions() {
        assert!(parse_fhir_instant("2024").is_some());
        assert!(parse_fhir_instant("2024-05").is_some());
        assert!(parse_fhir_instant("2024-05-01").is_some());
        assert!(parse_fhir_instant("2024-05-01T10:00:00Z").is_some());
    }
}
