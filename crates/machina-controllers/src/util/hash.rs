//! Template hashing for MachineSet identity
//!
//! A MachineSet's name and template-hash label derive from an FNV-1a hash of
//! its machine template, encoded with a vowel-free alphabet so the result is
//! a safe DNS label fragment. Hashing the serialized template makes set
//! names deterministic: re-creating the same deployment template always maps
//! to the same set.

use machina_common::crd::MachineTemplateSpec;
use machina_common::MACHINE_TEMPLATE_HASH_LABEL;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash over the canonical JSON form of the template
///
/// serde_json serializes maps in key order, so equal templates always
/// produce equal bytes. `collision_count` is folded into the hash as a
/// uniquifier: after a hash collision the deployment bumps its
/// `status.collisionCount` and re-derives, landing on a fresh set name.
pub fn compute_hash(template: &MachineTemplateSpec, collision_count: Option<i32>) -> u32 {
    let bytes = serde_json::to_vec(template).unwrap_or_default();
    let mut hash = FNV_OFFSET_BASIS;
    for b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    if let Some(count) = collision_count {
        for b in count.to_le_bytes() {
            hash ^= b as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Encode a hash into a label-safe string
///
/// Each decimal digit of the hash maps into a consonant/digit alphabet with
/// no vowels, so no English words can form in object names.
pub fn safe_encode(hash: u32) -> String {
    const ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
    hash.to_string()
        .bytes()
        .map(|b| ALPHABET[b as usize % ALPHABET.len()] as char)
        .collect()
}

/// Compare two machine templates ignoring the template-hash label
///
/// Adoption uses this: an existing set belongs to a deployment exactly when
/// the templates match modulo the hash label the controller itself added.
pub fn equal_ignore_hash(a: &MachineTemplateSpec, b: &MachineTemplateSpec) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    for t in [&mut a, &mut b] {
        if let Some(meta) = t.metadata.as_mut() {
            if let Some(labels) = meta.labels.as_mut() {
                labels.remove(MACHINE_TEMPLATE_HASH_LABEL);
                if labels.is_empty() {
                    meta.labels = None;
                }
            }
        }
    }
    a == b
}
