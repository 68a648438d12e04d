//! Stable 32-bit string identifiers. Every named entity (texture, material,
//! model, light, node, shader) is referenced on the wire by the FNV-1a hash
//! of its original UTF-8 name. Collisions are configuration errors.

pub type StringId = u32;

/// Id of the empty string; used as the "no resource" sentinel.
pub const SID_NONE: StringId = 0x811c9dc5;

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 16777619;

#[inline]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hashes a name into its stable id. With the `sid-debug` feature the
/// original string is recorded so ids can be resolved back in log output;
/// two distinct strings mapping to the same id panic immediately.
#[cfg(not(feature = "sid-debug"))]
#[inline]
pub fn sid(name: &str) -> StringId {
    fnv1a(name.as_bytes())
}

#[cfg(feature = "sid-debug")]
pub fn sid(name: &str) -> StringId {
    let hash = fnv1a(name.as_bytes());

    let mut db = debug::STRING_DB.lock().expect("string db poisoned");
    if let Some(prior) = db.insert(hash, name.to_owned()) {
        if prior != name {
            panic!("two strings match the same id {:#010x}: {:?} and {:?}", hash, prior, name);
        }
    }

    hash
}

/// Resolves an id back to its original string, when known.
#[cfg(feature = "sid-debug")]
pub fn sid_to_string(id: StringId) -> Option<String> {
    debug::STRING_DB.lock().expect("string db poisoned").get(&id).cloned()
}

#[cfg(feature = "sid-debug")]
mod debug {
    use hashbrown::HashMap;
    use lazy_static::lazy_static;
    use std::sync::Mutex;

    lazy_static! {
        pub(super) static ref STRING_DB: Mutex<HashMap<u32, String>> = Mutex::new(HashMap::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string_is_offset_basis() {
        assert_eq!(fnv1a(b""), 0x811c9dc5);
        assert_eq!(SID_NONE, fnv1a(b""));
    }

    #[test]
    fn test_published_vectors() {
        // Reference values for the 32-bit FNV-1a function.
        assert_eq!(fnv1a(b"a"), 0xe40c292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_sid_matches_raw_hash() {
        assert_eq!(sid("t.png"), fnv1a(b"t.png"));
    }

    #[test]
    fn test_distinct_names_distinct_ids() {
        assert_ne!(sid("chalet.obj"), sid("chalet_spec.jpg"));
    }
}
