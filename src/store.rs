//! The document store boundary.
//!
//! Everything above this module talks to a store through
//! [`NoteStoreClient`]: upsert a note, delete a note, and open a live,
//! ordered query that pushes full result sets to a listener.

pub mod memory;
pub mod sqlite;

use crate::domain::{Note, now_millis};
use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Field used to order the notes query.
pub const LAST_UPDATED_FIELD: &str = "lastUpdated";

/// One document of a pushed result set, tagged with its store key.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub key: String,
    pub data: Value,
}

impl RawDocument {
    pub fn new(key: impl Into<String>, data: Value) -> Self {
        RawDocument {
            key: key.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        }
    }
}

/// A push from a live query.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// The full, ordered result set after a change.
    Snapshot(Vec<RawDocument>),
    /// The query failed; no further events follow.
    Error(StoreError),
}

/// Receives every event of one live query. May be called from any thread.
pub type WatchListener = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// An open live query. Closing it unregisters the listener; closing twice
/// is a no-op.
pub trait SubscriptionHandle: Send {
    fn close(&self);
}

#[async_trait]
pub trait NoteStoreClient: Send + Sync {
    /// Upserts the document at `note.id` with the full note payload.
    async fn write(&self, note: &Note) -> Result<(), StoreError>;

    /// Deletes the document at `id`. Deleting a missing key succeeds.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Opens a live query over the whole collection.
    ///
    /// An `Err` here means the query could not be set up and `listener`
    /// will never be called.
    fn watch(
        &self,
        ordering_field: &str,
        direction: Direction,
        listener: WatchListener,
    ) -> Result<Box<dyn SubscriptionHandle>, StoreError>;
}

/// Shared, dynamically dispatched store used by the higher layers.
pub type SharedStore = Arc<dyn NoteStoreClient>;

/// Serializes a note into the document payload stored under its id.
///
/// A note that was never stamped (`last_updated == 0`) gets the current time.
pub(crate) fn encode_note(note: &Note) -> Result<Value, StoreError> {
    let mut payload = note.clone();
    if payload.last_updated == 0 {
        payload.last_updated = now_millis();
    }
    Ok(serde_json::to_value(payload)?)
}

/// Rejects ordering fields that are not plain identifiers.
pub(crate) fn validate_ordering_field(field: &str) -> Result<(), StoreError> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::InvalidQuery(format!(
            "cannot order by field `{field}`"
        )));
    }
    Ok(())
}
