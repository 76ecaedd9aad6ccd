//! Profile normalization: converts resources produced by known source
//! profiles (Synthea, US Core) into one canonical R4 shape, so the rest of
//! the server only ever has to reason about a single schema per resource
//! type.
//!
//! Grounded on `examples/original_source/backend/fhir/core/converters/profile_transformer.py`'s
//! `ProfileAwareFHIRTransformer` (handler list + detection order,
//! `transform_resource`'s pipeline, `transform_bundle`'s entry walk).

pub mod common;
pub mod synthea;
pub mod us_core;

use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Synthea,
    UsCore,
}

fn detect(resource: &JsonValue) -> Option<Handler> {
    if synthea::can_handle(resource) {
        Some(Handler::Synthea)
    } else if us_core::can_handle(resource) {
        Some(Handler::UsCore)
    } else {
        None
    }
}

/// Normalizes one resource (or, for a `Bundle`, each of its entries
/// recursively) to canonical R4 shape. Safe to call on a resource that
/// matches no known profile — it still gets the common post-steps (array
/// coercion, reference repair, empty-field cleanup).
pub fn normalize_resource(resource_type: &str, resource: JsonValue) -> JsonValue {
    if resource_type == "Bundle" {
        return normalize_bundle(resource);
    }

    let handler = detect(&resource);
    let mut normalized = match handler {
        Some(Handler::Synthea) => synthea::transform(resource_type, resource),
        Some(Handler::UsCore) => us_core::transform(resource_type, resource),
        None => resource,
    };

    common::ensure_arrays(resource_type, &mut normalized);
    common::normalize_references(&mut normalized);
    common::clean_resource(&mut normalized);

    match handler {
        Some(Handler::Synthea) => common::insert_profile(&mut normalized, synthea::PROFILE_URL),
        Some(Handler::UsCore) => {
            let url = us_core::profile_url(&normalized);
            common::insert_profile(&mut normalized, url);
        }
        None => {}
    }

    normalized
}

fn normalize_bundle(mut bundle: JsonValue) -> JsonValue {
    let Some(obj) = bundle.as_object_mut() else { return bundle };
    if let Some(JsonValue::Array(entries)) = obj.get_mut("entry") {
        for entry in entries.iter_mut() {
            let Some(entry_obj) = entry.as_object_mut() else { continue };
            let Some(resource) = entry_obj.remove("resource") else { continue };
            let resource_type = resource
                .get("resourceType")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if resource_type.is_empty() {
                entry_obj.insert("resource".to_string(), resource);
                continue;
            }
            let normalized = normalize_resource(&resource_type, resource);
            entry_obj.insert("resource".to_string(), normalized);
        }
    }
    bundle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_resource_still_gets_common_cleanup() {
        let resource = serde_json::json!({
            "resourceType": "Patient",
            "name": { "family": "Smith" },
            "extra": null,
        });
        let normalized = normalize_resource("Patient", resource);
        assert!(normalized["name"].is_array());
        assert!(normalized.get("extra").is_none());
    }

    #[test]
    fn bundle_entries_normalized_independently() {
        let bundle = serde_json::json!({
            "resourceType": "Bundle",
            "entry": [
                { "resource": { "resourceType": "Patient", "name": { "family": "Doe" } } }
            ]
        });
        let normalized = normalize_bundle(bundle);
        assert!(normalized["entry"][0]["resource"]["name"].is_array());
    }

    #[test]
    fn synthea_resource_gets_profile_url_inserted() {
        let resource = serde_json::json!({
            "resourceType": "Encounter",
            "class": { "code": "AMB" },
            "participant": [{ "individual": { "reference": "urn:uuid:abc" } }]
        });
        let normalized = normalize_resource("Encounter", resource);
        assert_eq!(normalized["meta"]["profile"][0], synthea::PROFILE_URL);
        assert!(normalized["participant"][0]["actor"].is_object());
    }
}
