use axum::routing::{get, post};
use axum::Router;

use crate::auth::handlers;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(handlers::signup))
        .route("/auth/login", post(handlers::login))
        .route("/auth/federated", post(handlers::federated))
        .route("/auth/logout", post(handlers::logout))
        .route("/auth/me", get(handlers::me))
}
