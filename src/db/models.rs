use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::capacity;
use crate::storage::BlobKey;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";

/// A tree record together with the key it is stored under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyed<T> {
    pub id: String,
    #[serde(flatten)]
    pub value: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<BlobKey>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Active,
    Closed,
    Cancelled,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Active => write!(f, "active"),
            EventStatus::Closed => write!(f, "closed"),
            EventStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub title: String,
    pub description: String,
    pub date: String,
    pub time: String,
    pub location: String,
    pub max_participants: u32,
    #[serde(default)]
    pub current_participants: Option<u32>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn participants(&self) -> u32 {
        self.current_participants.unwrap_or(0)
    }

    pub fn available_spots(&self) -> u32 {
        capacity::remaining(self.max_participants, self.current_participants)
    }

    pub fn is_full(&self) -> bool {
        self.participants() >= self.max_participants
    }

    pub fn day(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.date, DATE_FORMAT).ok()
    }

    pub fn starts_at(&self) -> Option<NaiveDateTime> {
        let time = NaiveTime::parse_from_str(&self.time, TIME_FORMAT).ok()?;
        Some(self.day()?.and_time(time))
    }

    /// An event whose date lies before `today` is over. Unparseable dates
    /// never count as past.
    pub fn is_past(&self, today: NaiveDate) -> bool {
        self.day().map(|d| d < today).unwrap_or(false)
    }
}

/// Event plus the derived capacity figures clients display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    #[serde(flatten)]
    pub event: Keyed<Event>,
    pub available_spots: u32,
    pub is_full: bool,
}

impl From<Keyed<Event>> for EventSummary {
    fn from(event: Keyed<Event>) -> Self {
        Self {
            available_spots: event.value.available_spots(),
            is_full: event.value.is_full(),
            event,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub event_id: String,
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub whatsapp: String,
    pub number_of_guests: u32,
    #[serde(default)]
    pub special_requests: String,
    #[serde(default)]
    pub is_paid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_proof_ref: Option<BlobKey>,
    #[serde(default)]
    pub attended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attendance_photo_ref: Option<BlobKey>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}
