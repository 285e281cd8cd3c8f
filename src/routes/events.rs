use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;

use crate::content::events::{self, EventInput};
use crate::db::models::{EventStatus, EventSummary};
use crate::error::AppResult;
use crate::extractors::AdminUser;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct StatusChange {
    pub status: EventStatus,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/events", get(list_events).post(create_event))
        .route(
            "/api/events/{id}",
            get(show_event).put(update_event).delete(delete_event),
        )
        .route("/api/events/{id}/status", put(set_status))
}

async fn list_events(State(state): State<AppState>) -> AppResult<Json<Vec<EventSummary>>> {
    Ok(Json(events::list_events(&state.tree)?))
}

async fn show_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<EventSummary>> {
    Ok(Json(events::get_event(&state.tree, &id)?))
}

async fn create_event(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Json(input): Json<EventInput>,
) -> AppResult<(StatusCode, Json<EventSummary>)> {
    let event = events::create_event(&state.tree, input)?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn update_event(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
    Json(input): Json<EventInput>,
) -> AppResult<Json<EventSummary>> {
    Ok(Json(events::update_event(&state.tree, &id, input)?))
}

async fn set_status(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
    Json(change): Json<StatusChange>,
) -> AppResult<Json<EventSummary>> {
    Ok(Json(events::set_status(&state.tree, &id, change.status)?))
}

async fn delete_event(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    events::delete_event(&state.tree, &state.blobs, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
