use serde::Serialize;
use sha2::{Digest, Sha256};

/// `"Has image!"` -> `"hasImage"`.
pub(crate) fn camel_case(s: &str) -> String {
    s.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .enumerate()
        .map(|(i, word)| {
            let word = word.to_ascii_lowercase();
            if i == 0 {
                return word;
            }
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// First eight bytes of the SHA-256 of the value's JSON encoding.
pub(crate) fn json_hash<T: Serialize + ?Sized>(value: &T) -> u64 {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut head = [0_u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}
