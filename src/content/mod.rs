//! Domain operations over the data tree: blog posts, events, registrations
//! and attendance.

pub mod events;
pub mod posts;
pub mod registrations;

use chrono::Utc;

use crate::error::{AppError, AppResult};
use crate::storage::{BlobKey, BlobStore, Upload};
use crate::tree::{DataPath, TreeError};

pub const BLOG_POSTS: &str = "blogPosts";
pub const EVENTS: &str = "events";
pub const EVENT_REGISTRATIONS: &str = "eventRegistrations";

/// Path built from already-known segments, e.g. `["events", id]`.
pub fn node(segments: &[&str]) -> Result<DataPath, TreeError> {
    let mut path = DataPath::root();
    for segment in segments {
        path = path.child(segment)?;
    }
    Ok(path)
}

pub fn post_path(id: &str) -> Result<DataPath, TreeError> {
    node(&[BLOG_POSTS, id])
}

pub fn event_path(id: &str) -> Result<DataPath, TreeError> {
    node(&[EVENTS, id])
}

pub fn registrations_path(event_id: &str) -> Result<DataPath, TreeError> {
    node(&[EVENT_REGISTRATIONS, event_id])
}

pub fn registration_path(event_id: &str, id: &str) -> Result<DataPath, TreeError> {
    node(&[EVENT_REGISTRATIONS, event_id, id])
}

/// Trimmed value of a required text field.
pub(crate) fn required(field: &str, value: &str) -> AppResult<String> {
    let value = value.trim();
    if value.is_empty() {
        Err(AppError::BadRequest(format!("{} is required", field)))
    } else {
        Ok(value.to_string())
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Key of a freshly pushed node.
pub(crate) fn key_of(path: &DataPath) -> String {
    path.key().unwrap_or_default().to_string()
}

/// Store an image upload, then run `commit`. The blob is removed again if
/// `commit` fails so no upload outlives a rejected write.
pub(crate) async fn with_uploaded<T>(
    blobs: &BlobStore,
    upload: Option<(BlobKey, &Upload)>,
    commit: impl FnOnce(Option<&BlobKey>) -> AppResult<T>,
) -> AppResult<T> {
    let key = match upload {
        Some((key, upload)) => {
            blobs.put_image(&key, upload).await?;
            Some(key)
        }
        None => None,
    };

    match commit(key.as_ref()) {
        Ok(out) => Ok(out),
        Err(e) => {
            if let Some(key) = &key {
                blobs.discard(key).await;
            }
            Err(e)
        }
    }
}
