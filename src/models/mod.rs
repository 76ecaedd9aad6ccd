//! Domain models for the FHIR server.

pub mod fhir;
pub mod reference;
pub mod resource_types;

pub use fhir::{
    ConditionalParams, CreateParams, HistoryEntry, HistoryOperation, HistoryResult, Resource,
    ResourceOperation, ResourceResult, UpdateParams,
};
pub use reference::{infer_type_from_field_name, parse_reference, ParsedReference};
pub use resource_types::{is_known_resource_type, RESOURCE_TYPES};
