use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::Value;

use crate::auth::accounts::USERS;
use crate::content::{BLOG_POSTS, EVENTS};
use crate::error::{AppError, AppResult};
use crate::extractors::{CurrentUser, MaybeUser};
use crate::state::AppState;
use crate::tree::{DataPath, Subscription};

#[derive(Deserialize)]
pub struct SubscribeQuery {
    pub path: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/tree", get(read_root))
        .route("/api/tree/{*path}", get(read_path))
        .route("/api/subscribe", get(subscribe))
}

/// Posts and events are public, a profile belongs to its owner, and
/// everything else is for admins.
pub fn can_read(user: Option<&CurrentUser>, path: &DataPath) -> bool {
    let segments: Vec<&str> = path.segments().collect();
    match segments.as_slice() {
        [BLOG_POSTS, ..] | [EVENTS, ..] => true,
        [USERS, uid, ..] => user.is_some_and(|u| u.may_act_for(uid)),
        _ => user.is_some_and(CurrentUser::is_admin),
    }
}

fn authorize(user: Option<&CurrentUser>, path: &DataPath) -> AppResult<()> {
    if can_read(user, path) {
        Ok(())
    } else if user.is_none() {
        Err(AppError::Unauthorized)
    } else {
        Err(AppError::Forbidden)
    }
}

async fn read_root(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
) -> AppResult<Json<Value>> {
    read(&state, user.as_ref(), DataPath::root())
}

async fn read_path(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    Path(raw): Path<String>,
) -> AppResult<Json<Value>> {
    let path = DataPath::parse(&raw)?;
    read(&state, user.as_ref(), path)
}

fn read(state: &AppState, user: Option<&CurrentUser>, path: DataPath) -> AppResult<Json<Value>> {
    authorize(user, &path)?;
    let value = state.tree.get(&path)?.ok_or(AppError::NotFound)?;
    Ok(Json(value))
}

/// Server-sent `value` events carrying a [`crate::tree::Snapshot`]: the
/// current one first, then one after every change under the path.
async fn subscribe(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    Query(query): Query<SubscribeQuery>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let path = DataPath::parse(query.path.as_deref().unwrap_or_default())?;
    authorize(user.as_ref(), &path)?;

    let subscription = state.tree.subscribe(path);
    let stream = stream::unfold(subscription, |mut subscription: Subscription| async move {
        match subscription.next().await {
            Ok(Some(snapshot)) => {
                let event = Event::default()
                    .event("value")
                    .json_data(&snapshot)
                    .unwrap_or_else(|e| {
                        tracing::warn!(path = %snapshot.path, "Unencodable snapshot: {}", e);
                        Event::default().comment("unencodable snapshot")
                    });
                Some((Ok(event), subscription))
            }
            Ok(None) => {
                subscription.unsubscribe();
                None
            }
            Err(e) => {
                tracing::warn!(path = %subscription.path(), "Subscription read failed: {}", e);
                subscription.unsubscribe();
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
