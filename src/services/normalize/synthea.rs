//! Detection and handler-specific transform for resources produced by a
//! Synthea-style synthetic-data generator.
//!
//! Grounded on `examples/original_source/backend/fhir/core/converters/profile_transformer.py`'s
//! `SyntheaProfileHandler` (`can_handle`'s five heuristics, `transform`'s
//! CarePlan activity rebuild). The per-resource-type field fixes it shares
//! with `USCoreProfileHandler` live once in `normalize::common`.

use super::common;
use serde_json::Value as JsonValue;

pub const PROFILE_URL: &str = "http://example.org/fhir/synthea-generated";

const BUNDLE_SCAN_LIMIT: usize = 5;

pub fn can_handle(resource: &JsonValue) -> bool {
    let Some(obj) = resource.as_object() else { return false };

    if let Some(profiles) = obj.get("meta").and_then(|m| m.get("profile")).and_then(|p| p.as_array()) {
        if profiles.iter().any(|p| p.as_str().is_some_and(|s| s.to_ascii_lowercase().contains("synthea"))) {
            return true;
        }
    }

    if let Some(identifiers) = obj.get("identifier").and_then(|v| v.as_array()) {
        if identifiers
            .iter()
            .any(|id| id.get("system").and_then(|s| s.as_str()).is_some_and(|s| s.to_ascii_lowercase().contains("synthea")))
        {
            return true;
        }
    }

    let resource_type = obj.get("resourceType").and_then(|v| v.as_str()).unwrap_or("");
    if matches!(resource_type, "Encounter" | "Patient" | "Condition" | "Observation") && has_urn_uuid_reference(resource) {
        return true;
    }

    if resource_type == "Encounter" {
        let class_is_bare_coding = obj.get("class").is_some_and(|c| !c.is_array() && c.get("coding").is_none());
        let has_individual_participant = obj
            .get("participant")
            .and_then(|p| p.as_array())
            .is_some_and(|arr| arr.iter().any(|p| p.get("individual").is_some()));
        if class_is_bare_coding || has_individual_participant {
            return true;
        }
    }

    if resource_type == "Bundle" {
        if let Some(entries) = obj.get("entry").and_then(|e| e.as_array()) {
            return entries
                .iter()
                .take(BUNDLE_SCAN_LIMIT)
                .filter_map(|e| e.get("resource"))
                .any(can_handle);
        }
    }

    false
}

fn has_urn_uuid_reference(value: &JsonValue) -> bool {
    match value {
        JsonValue::Object(obj) => {
            if let Some(JsonValue::String(s)) = obj.get("reference") {
                if s.starts_with("urn:uuid:") {
                    return true;
                }
            }
            obj.values().any(has_urn_uuid_reference)
        }
        JsonValue::Array(arr) => arr.iter().any(has_urn_uuid_reference),
        _ => false,
    }
}

pub fn transform(resource_type: &str, mut resource: JsonValue) -> JsonValue {
    if resource_type == "CarePlan" {
        rebuild_care_plan_activities(&mut resource);
    }
    common::canonicalize_resource_type(resource_type, &mut resource);
    resource
}

/// Synthea's `CarePlan.activity[].detail` shape doesn't carry a real
/// `ServiceRequest` reference; this rebuilds `plannedActivityReference` from
/// a synthetic `ServiceRequest/<code>` id, or `performedActivity` from the
/// detail's outcome when the activity has already happened.
fn rebuild_care_plan_activities(resource: &mut JsonValue) {
    let Some(obj) = resource.as_object_mut() else { return };
    let Some(JsonValue::Array(activities)) = obj.get_mut("activity") else { return };

    for activity in activities.iter_mut() {
        let Some(activity_obj) = activity.as_object_mut() else { continue };
        let Some(detail) = activity_obj.remove("detail") else { continue };
        let Some(detail_obj) = detail.as_object() else { continue };

        let code = detail_obj
            .get("code")
            .and_then(|c| c.get("coding"))
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|coding| coding.get("code"))
            .and_then(|c| c.as_str());

        let has_outcome = detail_obj.contains_key("outcomeCodeableConcept") || detail_obj.contains_key("outcomeReference");

        if has_outcome {
            if let Some(outcome) = detail_obj.get("outcomeCodeableConcept").or_else(|| detail_obj.get("outcomeReference")) {
                activity_obj.insert(
                    "performedActivity".to_string(),
                    JsonValue::Array(vec![serde_json::json!({ "concept": outcome })]),
                );
            }
        } else if let Some(code) = code {
            activity_obj.insert(
                "plannedActivityReference".to_string(),
                serde_json::json!({ "reference": format!("ServiceRequest/{code}") }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_meta_profile() {
        let resource = serde_json::json!({
            "resourceType": "Patient",
            "meta": { "profile": ["https://synthetichealth.github.io/synthea/StructureDefinition/synthea"] }
        });
        assert!(can_handle(&resource));
    }

    #[test]
    fn detects_encounter_individual_participant() {
        let resource = serde_json::json!({
            "resourceType": "Encounter",
            "participant": [{ "individual": { "reference": "Practitioner/1" } }]
        });
        assert!(can_handle(&resource));
    }

    #[test]
    fn does_not_detect_unrelated_resource() {
        let resource = serde_json::json!({ "resourceType": "Patient", "name": [{ "family": "Smith" }] });
        assert!(!can_handle(&resource));
    }

    #[test]
    fn rebuilds_planned_activity_reference() {
        let resource = serde_json::json!({
            "resourceType": "CarePlan",
            "activity": [{ "detail": { "code": { "coding": [{ "code": "123" }] } } }]
        });
        let transformed = transform("CarePlan", resource);
        assert_eq!(
            transformed["activity"][0]["plannedActivityReference"]["reference"],
            "ServiceRequest/123"
        );
    }
}
