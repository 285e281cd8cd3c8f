use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::auth::{accounts, session};
use crate::config::AuthConfig;
use crate::error::AppResult;
use crate::extractors::{session_token, CurrentUser};
use crate::state::AppState;

pub const FEDERATION_SECRET_HEADER: &str = "x-federation-secret";

// -- Request types --

#[derive(Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct FederatedLogin {
    pub provider: String,
    pub subject: String,
    pub email: String,
}

// -- Cookie helpers --

fn session_cookie(auth: &AuthConfig, token: &str) -> String {
    let max_age_secs = auth.session_hours * 3600;
    cookie(auth, token, max_age_secs)
}

fn clear_session_cookie(auth: &AuthConfig) -> String {
    cookie(auth, "", 0)
}

fn cookie(auth: &AuthConfig, value: &str, max_age_secs: u64) -> String {
    let secure = if auth.secure_cookies { "; Secure" } else { "" };
    format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}{}",
        auth.cookie_name, value, max_age_secs, secure
    )
}

/// Open a session for `user` and answer with the identity plus cookie.
fn start_session(state: &AppState, user: CurrentUser, status: StatusCode) -> AppResult<Response> {
    let token = {
        let conn = state.db.get()?;
        session::create_session(&conn, &user.uid, state.config.auth.session_hours)?
    };
    tracing::info!(uid = %user.uid, "Session started");

    Ok((
        status,
        [(header::SET_COOKIE, session_cookie(&state.config.auth, &token))],
        Json(serde_json::json!({ "user": user, "token": token })),
    )
        .into_response())
}

// -- Handlers --

/// POST /auth/signup: create an email/password account and sign in
pub async fn signup(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> AppResult<Response> {
    let user = accounts::sign_up(&state.tree, &state.config.auth, &req.email, &req.password)?;
    start_session(&state, user, StatusCode::CREATED)
}

/// POST /auth/login: email/password login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> AppResult<Response> {
    let user = accounts::log_in(&state.tree, &req.email, &req.password)?;
    start_session(&state, user, StatusCode::OK)
}

/// POST /auth/federated: login asserted by a trusted upstream provider
pub async fn federated(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<FederatedLogin>,
) -> AppResult<Response> {
    let presented = headers
        .get(FEDERATION_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    accounts::verify_federation_secret(&state.config.auth, &req.provider, presented)?;

    let user = accounts::federated_log_in(
        &state.tree,
        &state.config.auth,
        &req.provider,
        &req.subject,
        &req.email,
    )?;
    start_session(&state, user, StatusCode::OK)
}

/// POST /auth/logout: end the current session, if any
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    if let Some(token) = session_token(&headers, &state.config.auth.cookie_name) {
        let conn = state.db.get()?;
        session::delete_session(&conn, token)?;
    }

    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, clear_session_cookie(&state.config.auth))],
        Json(serde_json::json!({ "status": "ok" })),
    )
        .into_response())
}

/// GET /auth/me: the signed-in identity and role
pub async fn me(user: CurrentUser) -> Json<CurrentUser> {
    Json(user)
}
