use chrono::{NaiveDate, NaiveTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{event_path, key_of, node, registrations_path, required, EVENTS};
use crate::db::models::{Event, EventStatus, EventSummary, Keyed, DATE_FORMAT, TIME_FORMAT};
use crate::error::{AppError, AppResult};
use crate::storage::{BlobKey, BlobStore, ATTENDANCE_PHOTOS, PAYMENT_PROOFS};
use crate::tree::DataTree;

/// Event fields an admin submits on create and update.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    pub title: String,
    pub description: String,
    pub date: String,
    pub time: String,
    pub location: String,
    pub max_participants: u32,
}

impl EventInput {
    fn validated(self) -> AppResult<Self> {
        let date = required("Date", &self.date)?;
        if NaiveDate::parse_from_str(&date, DATE_FORMAT).is_err() {
            return Err(AppError::BadRequest("Date must be YYYY-MM-DD".into()));
        }
        let time = required("Time", &self.time)?;
        if NaiveTime::parse_from_str(&time, TIME_FORMAT).is_err() {
            return Err(AppError::BadRequest("Time must be HH:MM".into()));
        }
        if self.max_participants < 1 {
            return Err(AppError::BadRequest(
                "Maximum participants must be at least 1".into(),
            ));
        }

        Ok(Self {
            title: required("Title", &self.title)?,
            description: required("Description", &self.description)?,
            date,
            time,
            location: required("Location", &self.location)?,
            max_participants: self.max_participants,
        })
    }
}

/// Every event ordered by date, then start time.
pub fn list_events(tree: &DataTree) -> AppResult<Vec<EventSummary>> {
    let mut events: Vec<Keyed<Event>> = tree.children_as(&node(&[EVENTS])?)?;
    events.sort_by(|a, b| {
        (&a.value.date, &a.value.time, &a.id).cmp(&(&b.value.date, &b.value.time, &b.id))
    });
    Ok(events.into_iter().map(EventSummary::from).collect())
}

pub fn get_event(tree: &DataTree, id: &str) -> AppResult<EventSummary> {
    let event: Event = tree.get_as(&event_path(id)?)?.ok_or(AppError::NotFound)?;
    Ok(EventSummary::from(Keyed {
        id: id.to_string(),
        value: event,
    }))
}

/// New events open for registration with nobody signed up.
pub fn create_event(tree: &DataTree, input: EventInput) -> AppResult<EventSummary> {
    let input = input.validated()?;
    let event = Event {
        title: input.title,
        description: input.description,
        date: input.date,
        time: input.time,
        location: input.location,
        max_participants: input.max_participants,
        current_participants: Some(0),
        status: EventStatus::Active,
        created_at: Utc::now(),
        updated_at: None,
    };

    let path = tree.push(&node(&[EVENTS])?, &event)?;
    let id = key_of(&path);
    tracing::info!(event = %id, max = event.max_participants, "Event created");
    Ok(EventSummary::from(Keyed { id, value: event }))
}

/// Rewrite an event's details. Capacity may not drop below the number of
/// participants already registered.
pub fn update_event(tree: &DataTree, id: &str, input: EventInput) -> AppResult<EventSummary> {
    let input = input.validated()?;
    let path = event_path(id)?;

    let event = tree.transaction(|txn| -> AppResult<Event> {
        let current: Event = txn.get_as(&path)?.ok_or(AppError::NotFound)?;
        if input.max_participants < current.participants() {
            return Err(AppError::Conflict(format!(
                "Maximum participants cannot be lower than the {} already registered",
                current.participants()
            )));
        }

        let mut fields = Map::new();
        fields.insert("title".into(), Value::String(input.title));
        fields.insert("description".into(), Value::String(input.description));
        fields.insert("date".into(), Value::String(input.date));
        fields.insert("time".into(), Value::String(input.time));
        fields.insert("location".into(), Value::String(input.location));
        fields.insert("maxParticipants".into(), json!(input.max_participants));
        fields.insert("updatedAt".into(), json!(Utc::now()));
        txn.update(&path, fields)?;

        txn.get_as(&path)?.ok_or(AppError::NotFound)
    })?;

    tracing::info!(event = %id, "Event updated");
    Ok(EventSummary::from(Keyed {
        id: id.to_string(),
        value: event,
    }))
}

pub fn set_status(tree: &DataTree, id: &str, status: EventStatus) -> AppResult<EventSummary> {
    let path = event_path(id)?;
    let event = tree.transaction(|txn| -> AppResult<Event> {
        if txn.get(&path)?.is_none() {
            return Err(AppError::NotFound);
        }
        let mut fields = Map::new();
        fields.insert("status".into(), json!(status));
        fields.insert("updatedAt".into(), json!(Utc::now()));
        txn.update(&path, fields)?;
        txn.get_as(&path)?.ok_or(AppError::NotFound)
    })?;

    tracing::info!(event = %id, %status, "Event status changed");
    Ok(EventSummary::from(Keyed {
        id: id.to_string(),
        value: event,
    }))
}

/// Remove an event with its registrations, then every payment proof and
/// attendance photo filed under it.
pub async fn delete_event(tree: &DataTree, blobs: &BlobStore, id: &str) -> AppResult<()> {
    let path = event_path(id)?;
    let registrations = registrations_path(id)?;
    tree.transaction(|txn| -> AppResult<()> {
        if txn.get(&path)?.is_none() {
            return Err(AppError::NotFound);
        }
        txn.remove(&registrations)?;
        txn.remove(&path)?;
        Ok(())
    })?;
    tracing::info!(event = %id, "Event deleted");

    for kind in [PAYMENT_PROOFS, ATTENDANCE_PHOTOS] {
        let prefix = BlobKey::event_prefix(kind, id)?;
        if let Err(e) = blobs.delete_prefix(&prefix).await {
            tracing::warn!(prefix = %prefix, "Failed to delete event blobs: {}", e);
        }
    }
    Ok(())
}
