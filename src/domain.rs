use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NoteError {
    #[error("both title and content are required")]
    MissingFields,
}

/// A single note as persisted in the document store.
///
/// Serialized with camelCase keys (`lastUpdated`) so documents written by
/// other clients of the same collection parse unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub title: String,
    pub content: String,
    /// Milliseconds since the Unix epoch, stamped by the writer.
    pub last_updated: i64,
}

impl Note {
    /// Creates an empty note with a fresh client-side identifier.
    ///
    /// The note is not persisted until it is written through a store.
    pub fn new() -> Note {
        Note {
            id: Uuid::new_v4().to_string(),
            title: String::new(),
            content: String::new(),
            last_updated: now_millis(),
        }
    }

    /// Returns the copy of this note that should be written to the store.
    ///
    /// Trims `title` and `content`, rejects either being empty afterwards,
    /// and stamps `last_updated` with `at`. Leaves `self` untouched.
    pub fn normalized(&self, at: i64) -> Result<Note, NoteError> {
        let title = self.title.trim();
        let content = self.content.trim();

        if title.is_empty() || content.is_empty() {
            return Err(NoteError::MissingFields);
        }

        Ok(Note {
            id: self.id.clone(),
            title: title.to_owned(),
            content: content.to_owned(),
            last_updated: at,
        })
    }
}

impl Default for Note {
    fn default() -> Self {
        Note::new()
    }
}

/// Current wall clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The complete set of notes known at one point in time, keyed by store key.
///
/// A snapshot is always rebuilt from a full result set; it is never patched
/// in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteSnapshot {
    notes: HashMap<String, Note>,
}

impl NoteSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, key: String, note: Note) {
        self.notes.insert(key, note);
    }

    pub fn get(&self, key: &str) -> Option<&Note> {
        self.notes.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.notes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Note)> {
        self.notes.iter()
    }

    /// Notes ordered most recently updated first.
    ///
    /// Ties on `last_updated` fall back to the key so the order is stable
    /// across snapshots.
    pub fn by_recency(&self) -> Vec<&Note> {
        let mut entries: Vec<(&String, &Note)> = self.notes.iter().collect();
        entries.sort_by(|(ka, a), (kb, b)| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| ka.cmp(kb))
        });
        entries.into_iter().map(|(_, note)| note).collect()
    }

    pub fn into_inner(self) -> HashMap<String, Note> {
        self.notes
    }
}
