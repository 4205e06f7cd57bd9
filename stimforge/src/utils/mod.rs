//! Small helpers for digests, data URIs and run identifiers.

use base64::Engine;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a new UUID v4 for a batch run.
#[must_use]
pub fn generate_run_id() -> Uuid {
    Uuid::new_v4()
}

/// Hex-encoded SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// MIME type guessed from the leading bytes of an encoded image.
#[must_use]
pub fn image_mime(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::WebP) => "image/webp",
        Ok(image::ImageFormat::Gif) => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Encodes image bytes as a base64 `data:` URI.
#[must_use]
pub fn image_data_uri(bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        image_mime(bytes),
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Decodes a base64 `data:` URI, returning `None` for anything else.
#[must_use]
pub fn decode_data_uri(uri: &str) -> Option<Vec<u8>> {
    let rest = uri.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    if !meta.ends_with(";base64") {
        return None;
    }
    base64::engine::general_purpose::STANDARD.decode(payload).ok()
}
