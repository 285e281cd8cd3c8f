mod fs;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use self::fs::FsBlobBackend;

pub const BLOG_IMAGES: &str = "blog-images";
pub const PAYMENT_PROOFS: &str = "payment-proofs";
pub const ATTENDANCE_PHOTOS: &str = "attendance-photos";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid blob key: {0}")]
    InvalidKey(String),

    #[error("Upload exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Unsupported content type: {0}")]
    UnsupportedType(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Location of a blob, e.g. `payment-proofs/{event}/{uid}-{millis}.png`.
/// Segments use `[A-Za-z0-9._-]` and never `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobKey(String);

impl BlobKey {
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let trimmed = raw.trim_matches('/');
        let valid = !trimmed.is_empty()
            && trimmed.split('/').all(|segment| {
                !segment.is_empty()
                    && segment != "."
                    && segment != ".."
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            });
        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(StorageError::InvalidKey(raw.to_string()))
        }
    }

    pub fn blog_image(millis: i64, file_name: &str) -> Result<Self, StorageError> {
        Self::parse(&format!(
            "{}/{}-{}",
            BLOG_IMAGES,
            millis,
            sanitize_file_name(file_name)
        ))
    }

    /// `ext` comes from [`Upload::extension`] so downloads keep the image type.
    pub fn payment_proof(
        event_id: &str,
        uid: &str,
        millis: i64,
        ext: Option<&str>,
    ) -> Result<Self, StorageError> {
        Self::parse(&with_extension(
            format!("{}/{}/{}-{}", PAYMENT_PROOFS, event_id, uid, millis),
            ext,
        ))
    }

    pub fn attendance_photo(
        event_id: &str,
        registration_id: &str,
        ext: Option<&str>,
    ) -> Result<Self, StorageError> {
        Self::parse(&with_extension(
            format!("{}/{}/{}", ATTENDANCE_PHOTOS, event_id, registration_id),
            ext,
        ))
    }

    /// Directory holding every blob of `kind` for one event.
    pub fn event_prefix(kind: &str, event_id: &str) -> Result<Self, StorageError> {
        Self::parse(&format!("{}/{}", kind, event_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    pub fn url(&self) -> String {
        format!("/blobs/{}", self.0)
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BlobKey {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BlobKey::parse(&value)
    }
}

impl From<BlobKey> for String {
    fn from(key: BlobKey) -> Self {
        key.0
    }
}

fn with_extension(base: String, ext: Option<&str>) -> String {
    match ext {
        Some(ext) => format!("{}.{}", base, ext),
        None => base,
    }
}

/// Map an uploaded file name onto the key alphabet.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Where blob bytes actually live.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn put(&self, key: &BlobKey, data: Bytes) -> Result<(), StorageError>;

    async fn get(&self, key: &BlobKey) -> Result<Option<Bytes>, StorageError>;

    /// Returns whether anything was deleted.
    async fn delete(&self, key: &BlobKey) -> Result<bool, StorageError>;

    /// Delete every blob whose key starts with `prefix/`.
    async fn delete_prefix(&self, prefix: &BlobKey) -> Result<(), StorageError>;
}

/// An uploaded file as received from a client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl Upload {
    /// The declared content type, else one guessed from the file name.
    pub fn media_type(&self) -> String {
        self.content_type
            .as_deref()
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| {
                mime_guess::from_path(&self.file_name)
                    .first_or_octet_stream()
                    .to_string()
            })
    }

    /// Extension that maps back to [`Upload::media_type`]. The file's own
    /// extension wins when it agrees with the type.
    pub fn extension(&self) -> Option<String> {
        let media_type = self.media_type();
        let own = std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()));
        if let Some(own) = own {
            if mime_guess::from_ext(&own)
                .iter()
                .any(|m| m.essence_str() == media_type)
            {
                return Some(own);
            }
        }
        if media_type == "image/jpeg" {
            return Some("jpg".to_string());
        }
        mime_guess::get_mime_extensions_str(&media_type)
            .and_then(|exts| exts.first())
            .map(|e| e.to_string())
    }
}

#[derive(Clone)]
pub struct BlobStore {
    backend: Arc<dyn BlobBackend>,
    max_upload_bytes: usize,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn BlobBackend>, max_upload_bytes: usize) -> Self {
        Self {
            backend,
            max_upload_bytes,
        }
    }

    /// Store an image upload under `key`, replacing any previous blob there.
    pub async fn put_image(&self, key: &BlobKey, upload: &Upload) -> Result<(), StorageError> {
        if upload.data.len() > self.max_upload_bytes {
            return Err(StorageError::TooLarge {
                limit: self.max_upload_bytes,
            });
        }
        let content_type = upload.media_type();
        if !content_type.starts_with("image/") {
            return Err(StorageError::UnsupportedType(content_type));
        }

        self.backend.put(key, upload.data.clone()).await?;
        tracing::info!(key = %key, bytes = upload.data.len(), "Stored blob");
        Ok(())
    }

    pub async fn get(&self, key: &BlobKey) -> Result<Option<Bytes>, StorageError> {
        self.backend.get(key).await
    }

    pub async fn delete(&self, key: &BlobKey) -> Result<bool, StorageError> {
        let deleted = self.backend.delete(key).await?;
        if deleted {
            tracing::info!(key = %key, "Deleted blob");
        }
        Ok(deleted)
    }

    pub async fn delete_prefix(&self, prefix: &BlobKey) -> Result<(), StorageError> {
        self.backend.delete_prefix(prefix).await?;
        tracing::info!(prefix = %prefix, "Deleted blobs under prefix");
        Ok(())
    }

    /// Delete a blob after the record pointing at it is gone. Failures are
    /// logged, never returned.
    pub async fn discard(&self, key: &BlobKey) {
        if let Err(e) = self.delete(key).await {
            tracing::warn!(key = %key, "Failed to delete blob: {}", e);
        }
    }

    pub fn content_type(key: &BlobKey) -> String {
        mime_guess::from_path(key.as_str())
            .first_or_octet_stream()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &std::path::Path, limit: usize) -> BlobStore {
        BlobStore::new(Arc::new(FsBlobBackend::new(dir)), limit)
    }

    fn png(data: &'static [u8]) -> Upload {
        Upload {
            file_name: "photo.png".into(),
            content_type: Some("image/png".into()),
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn key_rejects_traversal_and_odd_chars() {
        assert!(BlobKey::parse("blog-images/../secret").is_err());
        assert!(BlobKey::parse("blog-images//x").is_err());
        assert!(BlobKey::parse("blog images/x").is_err());
        assert!(BlobKey::parse("").is_err());
        assert_eq!(
            BlobKey::parse("/blog-images/1-a.png/").unwrap().as_str(),
            "blog-images/1-a.png"
        );
    }

    #[test]
    fn typed_keys_have_expected_layout() {
        assert_eq!(
            BlobKey::blog_image(1700, "My Photo (1).JPG").unwrap().as_str(),
            "blog-images/1700-My-Photo--1-.JPG"
        );
        assert_eq!(
            BlobKey::payment_proof("e1", "u1", 42, Some("png")).unwrap().as_str(),
            "payment-proofs/e1/u1-42.png"
        );
        assert_eq!(
            BlobKey::attendance_photo("e1", "r1", Some("jpg")).unwrap().url(),
            "/blobs/attendance-photos/e1/r1.jpg"
        );
        assert_eq!(
            BlobKey::attendance_photo("e1", "r1", None).unwrap().as_str(),
            "attendance-photos/e1/r1"
        );
    }

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\pics\\a b.png"), "a-b.png");
        assert_eq!(sanitize_file_name("..."), "upload");
    }

    #[test]
    fn key_serializes_as_string() {
        let key = BlobKey::parse("blog-images/1-a.png").unwrap();
        assert_eq!(serde_json::to_value(&key).unwrap(), "blog-images/1-a.png");
        let bad: Result<BlobKey, _> = serde_json::from_value(serde_json::json!("../x"));
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn put_get_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = store(tmp.path(), 1024);
        let key = BlobKey::attendance_photo("e1", "r1", Some("png")).unwrap();

        blobs.put_image(&key, &png(b"abc")).await.unwrap();
        assert_eq!(blobs.get(&key).await.unwrap().unwrap(), Bytes::from_static(b"abc"));

        assert!(blobs.delete(&key).await.unwrap());
        assert!(blobs.get(&key).await.unwrap().is_none());
        assert!(!blobs.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_oversized_and_non_images() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = store(tmp.path(), 2);
        let key = BlobKey::blog_image(1, "a.png").unwrap();

        let err = blobs.put_image(&key, &png(b"abc")).await.unwrap_err();
        assert!(matches!(err, StorageError::TooLarge { limit: 2 }));

        let blobs = store(tmp.path(), 1024);
        let text = Upload {
            file_name: "notes.txt".into(),
            content_type: None,
            data: Bytes::from_static(b"hi"),
        };
        let err = blobs.put_image(&key, &text).await.unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedType(_)));
    }

    #[tokio::test]
    async fn delete_prefix_removes_event_blobs() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = store(tmp.path(), 1024);
        let a = BlobKey::payment_proof("e1", "u1", 1, Some("png")).unwrap();
        let b = BlobKey::payment_proof("e1", "u2", 2, Some("png")).unwrap();
        let other = BlobKey::payment_proof("e2", "u1", 3, Some("png")).unwrap();
        for key in [&a, &b, &other] {
            blobs.put_image(key, &png(b"x")).await.unwrap();
        }

        let prefix = BlobKey::event_prefix(PAYMENT_PROOFS, "e1").unwrap();
        blobs.delete_prefix(&prefix).await.unwrap();
        blobs.delete_prefix(&prefix).await.unwrap();

        assert!(blobs.get(&a).await.unwrap().is_none());
        assert!(blobs.get(&b).await.unwrap().is_none());
        assert!(blobs.get(&other).await.unwrap().is_some());
    }

    #[test]
    fn content_type_guessed_from_key() {
        let key = BlobKey::blog_image(1, "a.png").unwrap();
        assert_eq!(BlobStore::content_type(&key), "image/png");
        let key = BlobKey::attendance_photo("e", "r", None).unwrap();
        assert_eq!(BlobStore::content_type(&key), "application/octet-stream");
    }

    #[test]
    fn upload_extension_follows_media_type() {
        let upload = |name: &str, ty: Option<&str>| Upload {
            file_name: name.into(),
            content_type: ty.map(str::to_string),
            data: Bytes::new(),
        };

        assert_eq!(upload("receipt.png", Some("image/png")).extension().as_deref(), Some("png"));
        assert_eq!(upload("IMG_1.JPEG", Some("image/jpeg")).extension().as_deref(), Some("jpeg"));
        assert_eq!(upload("blob", Some("image/jpeg")).extension().as_deref(), Some("jpg"));
        assert_eq!(upload("shot.png", Some("image/webp")).extension().as_deref(), Some("webp"));
        assert_eq!(upload("photo.gif", None).extension().as_deref(), Some("gif"));
    }

    #[tokio::test]
    async fn stored_proof_keeps_its_image_type() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = store(tmp.path(), 1024);
        let upload = png(b"abc");
        let key = BlobKey::payment_proof("e1", "u1", 7, upload.extension().as_deref()).unwrap();

        blobs.put_image(&key, &upload).await.unwrap();
        assert_eq!(BlobStore::content_type(&key), "image/png");
    }
}
