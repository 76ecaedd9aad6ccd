//! Cross-cutting request-processing services: conditional references, the
//! Bundle processor, and the profile normalizer.

pub mod bundle;
pub mod conditional;
pub mod normalize;
