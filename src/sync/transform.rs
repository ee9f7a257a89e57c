use crate::domain::{Note, NoteSnapshot};
use crate::error::SyncError;
use crate::store::RawDocument;
use serde::Deserialize;
use std::sync::Arc;

/// Parses one raw document into a [`Note`].
///
/// Returns [`SyncError::MalformedPayload`] when the payload does not have
/// the note shape.
pub fn parse_document(document: &RawDocument) -> Result<Note, SyncError> {
    Note::deserialize(&document.data).map_err(|source| SyncError::MalformedPayload {
        key: document.key.clone(),
        source: Arc::new(source),
    })
}

/// Builds a full [`NoteSnapshot`] from one pushed result set.
///
/// Each document lands under its store key; a key repeated within the
/// batch keeps the last document seen. Documents that fail to parse are
/// logged and left out instead of failing the whole snapshot.
pub fn transform_snapshot(documents: &[RawDocument]) -> NoteSnapshot {
    let mut snapshot = NoteSnapshot::new();

    for document in documents {
        match parse_document(document) {
            Ok(note) => snapshot.insert(document.key.clone(), note),
            Err(err) => log::warn!("skipping document: {err}"),
        }
    }

    snapshot
}
