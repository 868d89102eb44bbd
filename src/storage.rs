//! Object storage gateway: a keyed binary store behind a narrow trait.
//!
//! The core never sees SDK types. Keys are deterministic, derived from
//! entity ids, so re-uploads after queue re-delivery overwrite instead of
//! duplicating artifacts.
//!
//! Key conventions:
//! - `images/<image_id>/<index>.<ext>`
//! - `models/<model_id>/model.<ext>`
//! - `models/<model_id>/material.mtl`
//! - `models/<model_id>/material.<png|jpg|jpeg>`
//! - `models/<model_id>/preview.png`

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::KilnError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under `key`, returning the stable public URL.
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str)
    -> Result<String, KilnError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, KilnError>;

    async fn delete(&self, key: &str) -> Result<(), KilnError>;

    /// Time-limited direct URL for `key`.
    async fn presign(&self, key: &str, ttl_secs: u64) -> Result<String, KilnError>;
}

pub fn image_key(image_id: &str, index: u8, ext: &str) -> String {
    format!("images/{image_id}/{index}.{ext}")
}

pub fn model_key(model_id: &str, name: &str) -> String {
    format!("models/{model_id}/{name}")
}

/// Content type from the key's extension. The gateway owns this choice;
/// callers never pass MIME strings around.
pub fn content_type_for(key: &str) -> &'static str {
    match key.rsplit('.').next().map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("obj") => "model/obj",
        Some("mtl") => "model/mtl",
        Some("glb") => "model/gltf-binary",
        Some("gltf") => "model/gltf+json",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Extension for image bytes from the provider's declared content type.
pub fn ext_for_content_type(content_type: &str) -> &'static str {
    match content_type.split(';').next().map(str::trim) {
        Some("image/jpeg") => "jpg",
        Some("image/gif") => "gif",
        Some("image/webp") => "webp",
        _ => "png",
    }
}

/// Client-facing form of a stored URL: routed through the CORS-terminating
/// proxy. Pure string transform; the store keeps originals.
pub fn proxy_url(proxy_base: &str, kind: &str, original: &str) -> String {
    format!(
        "{}/proxy/{kind}?url={}",
        proxy_base.trim_end_matches('/'),
        percent_encode(original)
    )
}

/// Recover the storage key from a stored public URL, if the URL points into
/// the given public base. Used when deleting a request's artifacts.
pub fn key_from_url<'a>(public_base: &str, url: &'a str) -> Option<&'a str> {
    let base = public_base.trim_end_matches('/');
    url.strip_prefix(base)
        .map(|rest| rest.trim_start_matches('/'))
        .filter(|key| !key.is_empty())
}

/// Minimal percent-encoding for a URL query value (RFC 3986 unreserved set
/// kept verbatim).
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Filesystem implementation
// ---------------------------------------------------------------------------

/// Object store rooted at a local directory. Serves single-host deployments
/// and tests; an S3-compatible backend implements the same trait out of
/// tree.
pub struct FsObjectStore {
    root: PathBuf,
    public_base: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into(),
        }
    }

    pub fn public_base(&self) -> &str {
        &self.public_base
    }

    /// Resolve a key inside the root, rejecting traversal components.
    fn resolve(&self, key: &str) -> Result<PathBuf, KilnError> {
        let rel = Path::new(key);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(KilnError::Storage(format!("invalid storage key: {key}")));
        }
        Ok(self.root.join(rel))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{key}", self.public_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, KilnError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Atomic write: temp file + rename prevents readers observing a
        // partial object.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(self.public_url(key))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, KilnError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KilnError::NotFound(format!("object {key}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), KilnError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            // Absent is success: deletes are retried by the orphan sweeper.
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn presign(&self, key: &str, ttl_secs: u64) -> Result<String, KilnError> {
        let expires = chrono::Utc::now().timestamp() as u64 + ttl_secs;
        Ok(format!("{}?expires={expires}", self.public_url(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for("images/a/0.png"), "image/png");
        assert_eq!(content_type_for("images/a/1.JPG"), "image/jpeg");
        assert_eq!(content_type_for("models/m/model.obj"), "model/obj");
        assert_eq!(content_type_for("models/m/material.mtl"), "model/mtl");
        assert_eq!(content_type_for("models/m/model.glb"), "model/gltf-binary");
        assert_eq!(content_type_for("mystery"), "application/octet-stream");
    }

    #[test]
    fn proxy_url_encodes_original() {
        let url = proxy_url(
            "http://localhost:3000/",
            "image",
            "http://storage/images/a b/0.png",
        );
        assert_eq!(
            url,
            "http://localhost:3000/proxy/image?url=http%3A%2F%2Fstorage%2Fimages%2Fa%20b%2F0.png"
        );
    }

    #[test]
    fn key_round_trips_through_public_url() {
        let key = key_from_url("http://storage", "http://storage/images/img-1/2.png");
        assert_eq!(key, Some("images/img-1/2.png"));
        assert_eq!(key_from_url("http://storage", "http://elsewhere/x"), None);
    }

    #[test]
    fn traversal_keys_are_rejected() {
        let store = FsObjectStore::new("/tmp/kiln-test", "http://storage");
        assert!(store.resolve("../escape").is_err());
        assert!(store.resolve("images/ok/0.png").is_ok());
    }
}
