use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha1::{Digest, Sha1};

/// Object id: 40-char lowercase hex SHA-1 over `<kind> <length>\0` followed
/// by the payload.
pub fn object_id(kind: &str, data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(kind.as_bytes());
    hasher.update(b" ");
    hasher.update(data.len().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// URL-safe, unpadded base64 of the SHA-1 digest. Used to derive cache file
/// and control socket names that are safe as path components.
pub fn sha1_base64(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha1::digest(data))
}
