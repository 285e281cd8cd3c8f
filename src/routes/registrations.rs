use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Local;

use crate::content::registrations::{self, RegistrationInput};
use crate::db::models::{Keyed, Registration};
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::routes::forms::FormData;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/events/{id}/registrations",
            get(list_registrations).post(register),
        )
        .route(
            "/api/events/{id}/registrations/{rid}",
            delete(cancel_registration),
        )
        .route(
            "/api/events/{id}/registrations/{rid}/attendance",
            post(confirm_attendance).delete(undo_attendance),
        )
}

async fn list_registrations(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(event_id): Path<String>,
) -> AppResult<Json<Vec<Keyed<Registration>>>> {
    Ok(Json(registrations::list_registrations(
        &state.tree,
        &user,
        &event_id,
    )?))
}

async fn register(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(event_id): Path<String>,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<Keyed<Registration>>)> {
    let mut form = FormData::read(multipart).await?;
    let input = RegistrationInput {
        name: form.text("name"),
        whatsapp: form.text("whatsapp"),
        number_of_guests: form.number("numberOfGuests", 1)?,
        special_requests: form.text("specialRequests"),
        is_paid: form.flag("isPaid"),
        payment_proof: form.take_file("paymentProof"),
    };

    let registration = registrations::register(
        &state.tree,
        &state.blobs,
        &user,
        &event_id,
        input,
        Local::now().date_naive(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

async fn cancel_registration(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((event_id, id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    registrations::cancel_registration(&state.tree, &state.blobs, &user, &event_id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn confirm_attendance(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((event_id, id)): Path<(String, String)>,
    multipart: Multipart,
) -> AppResult<Json<Keyed<Registration>>> {
    let mut form = FormData::read(multipart).await?;
    let photo = form
        .take_file("photo")
        .ok_or_else(|| AppError::BadRequest("An attendance photo is required".into()))?;

    let registration = registrations::confirm_attendance(
        &state.tree,
        &state.blobs,
        &user,
        &event_id,
        &id,
        photo,
        Local::now().naive_local(),
        state.config.events.checkin_window_minutes,
    )
    .await?;
    Ok(Json(registration))
}

async fn undo_attendance(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((event_id, id)): Path<(String, String)>,
) -> AppResult<Json<Keyed<Registration>>> {
    Ok(Json(
        registrations::undo_attendance(&state.tree, &state.blobs, &user, &event_id, &id).await?,
    ))
}
