use askama::Template;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Local;

use crate::content::{events, posts};
use crate::db::models::{EventStatus, EventSummary, Keyed, Post};
use crate::error::AppResult;
use crate::extractors::MaybeUser;
use crate::state::AppState;

// --- View structs ---

pub struct PostView {
    pub id: String,
    pub title: String,
    pub content: String,
    pub image_url: Option<String>,
    pub published: String,
}

impl From<Keyed<Post>> for PostView {
    fn from(post: Keyed<Post>) -> Self {
        Self {
            image_url: post.value.image_ref.as_ref().map(|k| k.url()),
            published: post.value.created_at.format("%B %-d, %Y").to_string(),
            id: post.id,
            title: post.value.title,
            content: post.value.content,
        }
    }
}

pub struct EventView {
    pub id: String,
    pub title: String,
    pub description: String,
    pub date: String,
    pub time: String,
    pub location: String,
    pub status: String,
    pub max_participants: u32,
    pub available_spots: u32,
    pub is_full: bool,
    pub accepting: bool,
}

impl EventView {
    fn new(summary: EventSummary, today: chrono::NaiveDate) -> Self {
        let event = summary.event.value;
        Self {
            accepting: event.status == EventStatus::Active
                && !summary.is_full
                && !event.is_past(today),
            status: event.status.to_string(),
            id: summary.event.id,
            title: event.title,
            description: event.description,
            date: event.date,
            time: event.time,
            location: event.location,
            max_participants: event.max_participants,
            available_spots: summary.available_spots,
            is_full: summary.is_full,
        }
    }
}

// --- Templates ---

#[derive(Template)]
#[template(path = "pages/home.html")]
pub struct HomeTemplate {
    pub email: Option<String>,
    pub posts: Vec<PostView>,
    pub events: Vec<EventView>,
}

#[derive(Template)]
#[template(path = "pages/event.html")]
pub struct EventTemplate {
    pub email: Option<String>,
    pub event: EventView,
}

/// Wrapper to render askama templates as axum responses
pub struct Html<T: Template>(pub T);

impl<T: Template> IntoResponse for Html<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                body,
            )
                .into_response(),
            Err(e) => {
                tracing::error!("Template render error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Template error").into_response()
            }
        }
    }
}

// --- Handlers ---

pub async fn index(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
) -> AppResult<Html<HomeTemplate>> {
    let today = Local::now().date_naive();
    let posts = posts::list_posts(&state.tree)?
        .into_iter()
        .map(PostView::from)
        .collect();
    let events = events::list_events(&state.tree)?
        .into_iter()
        .map(|e| EventView::new(e, today))
        .collect();

    Ok(Html(HomeTemplate {
        email: user.map(|u| u.email),
        posts,
        events,
    }))
}

pub async fn event_page(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    Path(id): Path<String>,
) -> AppResult<Html<EventTemplate>> {
    let summary = events::get_event(&state.tree, &id)?;
    Ok(Html(EventTemplate {
        email: user.map(|u| u.email),
        event: EventView::new(summary, Local::now().date_naive()),
    }))
}
