use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use crate::content::posts::{self, PostInput};
use crate::db::models::{Keyed, Post};
use crate::error::AppResult;
use crate::extractors::AdminUser;
use crate::routes::forms::FormData;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/posts", get(list_posts).post(create_post))
        .route(
            "/api/posts/{id}",
            get(show_post).put(update_post).delete(delete_post),
        )
}

async fn list_posts(State(state): State<AppState>) -> AppResult<Json<Vec<Keyed<Post>>>> {
    Ok(Json(posts::list_posts(&state.tree)?))
}

async fn show_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Keyed<Post>>> {
    Ok(Json(posts::get_post(&state.tree, &id)?))
}

async fn create_post(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<Keyed<Post>>)> {
    let input = post_input(multipart).await?;
    let post = posts::create_post(&state.tree, &state.blobs, input).await?;
    Ok((StatusCode::CREATED, Json(post)))
}

async fn update_post(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
    multipart: Multipart,
) -> AppResult<Json<Keyed<Post>>> {
    let input = post_input(multipart).await?;
    Ok(Json(
        posts::update_post(&state.tree, &state.blobs, &id, input).await?,
    ))
}

async fn delete_post(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    posts::delete_post(&state.tree, &state.blobs, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_input(multipart: Multipart) -> AppResult<PostInput> {
    let mut form = FormData::read(multipart).await?;
    Ok(PostInput {
        title: form.text("title"),
        content: form.text("content"),
        image: form.take_file("image"),
    })
}
