//! Content fingerprints for drift detection
//!
//! A fingerprint is a 32-bit FNV-1 hash of an object's canonical JSON form,
//! rendered as a decimal string. It is stored in an annotation on the desired
//! object, and comparing that annotation with the live object's copy is the
//! only drift signal. Fields are never diffed one by one.
//!
//! Canonical form: the object is first converted to a `serde_json::Value`,
//! whose maps keep keys sorted, so the byte stream does not depend on field
//! insertion order.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;

use vigil_common::Error;

/// Annotation holding the fingerprint of the object it is attached to
pub const TEMPLATE_HASH_ANNOTATION: &str = "internal.vigil.dev/template-hash";

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1_32(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        hash.wrapping_mul(FNV_PRIME) ^ u32::from(byte)
    })
}

/// Hash raw content (e.g., a custom-properties payload)
pub fn content_hash(data: &[u8]) -> String {
    fnv1_32(data).to_string()
}

/// Fingerprint an object from its canonical JSON serialization
///
/// Fails only if the object cannot be serialized, which is a bug rather than
/// an operational condition.
pub fn fingerprint<T: Serialize>(object: &T) -> Result<String, Error> {
    let canonical = serde_json::to_value(object)
        .map_err(|e| Error::serialization(format!("fingerprint: {e}")))?;
    let bytes = serde_json::to_vec(&canonical)
        .map_err(|e| Error::serialization(format!("fingerprint: {e}")))?;
    Ok(content_hash(&bytes))
}

/// Store a fingerprint on an object's metadata
pub fn stamp(meta: &mut ObjectMeta, hash: String) {
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(TEMPLATE_HASH_ANNOTATION.to_string(), hash);
}

/// Read the stored fingerprint, if any
pub fn template_hash(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(TEMPLATE_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Whether two objects carry different fingerprints
///
/// An object without a fingerprint never matches.
pub fn has_changed(live: &ObjectMeta, desired: &ObjectMeta) -> bool {
    match (template_hash(live), template_hash(desired)) {
        (Some(a), Some(b)) => a != b,
        _ => true,
    }
}
