use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::error::{AppError, AppResult};
use crate::extractors::{CurrentUser, MaybeUser};
use crate::state::AppState;
use crate::storage::{BlobKey, BlobStore, ATTENDANCE_PHOTOS, BLOG_IMAGES, PAYMENT_PROOFS};

pub fn router() -> Router<AppState> {
    Router::new().route("/blobs/{*key}", get(download))
}

/// Blog images are public. A payment proof belongs to the uploader named in
/// its file name, attendance photos to any signed-in user. Admins read all.
pub fn can_download(user: Option<&CurrentUser>, key: &BlobKey) -> bool {
    let segments: Vec<&str> = key.segments().collect();
    match segments.as_slice() {
        [BLOG_IMAGES, ..] => true,
        [PAYMENT_PROOFS, _event, file] => user.is_some_and(|u| {
            u.is_admin()
                || file
                    .strip_prefix(u.uid.as_str())
                    .is_some_and(|rest| rest.starts_with('-'))
        }),
        [ATTENDANCE_PHOTOS, ..] => user.is_some(),
        _ => user.is_some_and(CurrentUser::is_admin),
    }
}

async fn download(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    Path(raw): Path<String>,
) -> AppResult<Response> {
    let key = BlobKey::parse(&raw)?;
    if !can_download(user.as_ref(), &key) {
        return Err(if user.is_none() {
            AppError::Unauthorized
        } else {
            AppError::Forbidden
        });
    }

    let data = state.blobs.get(&key).await?.ok_or(AppError::NotFound)?;
    let cache = if key.segments().next() == Some(BLOG_IMAGES) {
        "public, max-age=86400"
    } else {
        "private, no-cache"
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, BlobStore::content_type(&key)),
            (header::CACHE_CONTROL, cache.to_string()),
        ],
        data,
    )
        .into_response())
}
