use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{api::error, modules::presence::model::Departure};

/// Shared online state: the live connection handles of each user plus the
/// time of their latest heartbeat.
#[async_trait::async_trait]
pub trait PresenceStore: Send + Sync {
    /// Adds a handle; true when the user had no connection before.
    async fn add_connection(
        &self,
        user_id: &Uuid,
        handle: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, error::SystemError>;

    async fn remove_connection(
        &self,
        user_id: &Uuid,
        handle: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Departure, error::SystemError>;

    /// Refreshes the heartbeat; false when the user has no entry any more.
    async fn touch(&self, user_id: &Uuid, now: DateTime<Utc>) -> Result<bool, error::SystemError>;

    async fn online(&self, user_ids: &[Uuid]) -> Result<Vec<bool>, error::SystemError>;

    async fn last_seen(
        &self,
        user_ids: &[Uuid],
    ) -> Result<Vec<Option<DateTime<Utc>>>, error::SystemError>;

    /// Removes every user whose last heartbeat is at or before `cutoff` and
    /// returns the ones this call evicted.
    async fn expire_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, error::SystemError>;
}
