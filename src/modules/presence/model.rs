use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInfo {
    pub user_id: Uuid,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// What a store reports back after a connection is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// Other connections of the user remain.
    StillOnline,
    /// That was the last connection; the user is offline since `at`.
    WentOffline { at: DateTime<Utc> },
    /// The handle was not registered (already swept or never added).
    Unknown,
}
