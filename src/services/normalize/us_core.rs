//! Detection and handler-specific transform for resources claiming a US Core
//! profile.
//!
//! Grounded on `examples/original_source/backend/fhir/core/converters/profile_transformer.py`'s
//! `USCoreProfileHandler` (`US_CORE_PROFILES`, `can_handle`, and the
//! Patient/Encounter-specific `transform` fixes — Procedure and
//! MedicationRequest need only the common arrays since, per the source's own
//! comment, "US Core is generally R4-compliant already").

use super::common;
use serde_json::Value as JsonValue;

const US_CORE_PROFILES: &[&str] = &[
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-patient",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-encounter",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-condition",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-observation-lab",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-procedure",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-medicationrequest",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-allergyintolerance",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-careplan",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-careteam",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-device",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-diagnosticreport-lab",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-documentreference",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-immunization",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-location",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-organization",
    "http://hl7.org/fhir/us/core/StructureDefinition/us-core-practitioner",
];

pub fn can_handle(resource: &JsonValue) -> bool {
    let Some(profiles) = resource.get("meta").and_then(|m| m.get("profile")).and_then(|p| p.as_array()) else {
        return false;
    };
    profiles
        .iter()
        .filter_map(|p| p.as_str())
        .any(|p| US_CORE_PROFILES.contains(&p))
}

pub fn profile_url(resource: &JsonValue) -> &'static str {
    resource
        .get("meta")
        .and_then(|m| m.get("profile"))
        .and_then(|p| p.as_array())
        .and_then(|arr| arr.iter().find_map(|p| p.as_str()))
        .and_then(|p| US_CORE_PROFILES.iter().find(|u| **u == p))
        .copied()
        .unwrap_or(US_CORE_PROFILES[0])
}

pub fn transform(resource_type: &str, mut resource: JsonValue) -> JsonValue {
    match resource_type {
        "Patient" => fix_patient(&mut resource),
        "Encounter" => fix_encounter(&mut resource),
        _ => {}
    }
    common::canonicalize_resource_type(resource_type, &mut resource);
    resource
}

fn fix_patient(resource: &mut JsonValue) {
    let Some(obj) = resource.as_object_mut() else { return };
    common::ensure_array_field(obj, "identifier");
    common::ensure_array_field(obj, "name");
    if let Some(JsonValue::Array(names)) = obj.get_mut("name") {
        for name in names.iter_mut() {
            let Some(name_obj) = name.as_object_mut() else { continue };
            if name_obj.contains_key("given") || name_obj.contains_key("family") {
                continue;
            }
            let Some(text) = name_obj.get("text").and_then(|t| t.as_str()).map(str::to_string) else { continue };
            let mut parts = text.split_whitespace();
            if let Some(given) = parts.next() {
                name_obj.insert(
                    "given".to_string(),
                    JsonValue::Array(vec![JsonValue::String(given.to_string())]),
                );
            }
            let family: Vec<&str> = parts.collect();
            if !family.is_empty() {
                name_obj.insert("family".to_string(), JsonValue::String(family.join(" ")));
            }
        }
    }
}

fn fix_encounter(resource: &mut JsonValue) {
    let Some(obj) = resource.as_object_mut() else { return };
    common::ensure_array_field(obj, "class");
    if let Some(reason_codes) = obj.remove("reasonCode") {
        if let JsonValue::Array(codes) = reason_codes {
            let reasons: Vec<JsonValue> = codes.into_iter().map(|c| serde_json::json!({ "use": [c] })).collect();
            obj.insert("reason".to_string(), JsonValue::Array(reasons));
        }
    }
    if let Some(period) = obj.remove("period") {
        obj.insert("actualPeriod".to_string(), period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_us_core_patient() {
        let resource = serde_json::json!({
            "resourceType": "Patient",
            "meta": { "profile": ["http://hl7.org/fhir/us/core/StructureDefinition/us-core-patient"] }
        });
        assert!(can_handle(&resource));
    }

    #[test]
    fn splits_name_text_into_given_family() {
        let resource = serde_json::json!({
            "resourceType": "Patient",
            "name": [{ "text": "Jane Doe" }]
        });
        let transformed = transform("Patient", resource);
        assert_eq!(transformed["name"][0]["given"][0], "Jane");
        assert_eq!(transformed["name"][0]["family"], "Doe");
    }
}
