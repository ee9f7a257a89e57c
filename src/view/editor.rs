use crate::domain::{Note, NoteError, now_millis};
use crate::error::SyncError;
use crate::store::SharedStore;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EditorError {
    #[error(transparent)]
    Note(#[from] NoteError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Drives creating a new note or editing an existing one.
///
/// Holds a draft that callers mutate field by field and then
/// [`submit`](NoteEditor::submit). The store's subscription, not the
/// return value of `submit`, is the source of truth for what is persisted.
pub struct NoteEditor {
    store: SharedStore,
    initial: Option<Note>,
    draft: Note,
    on_save: Option<SaveHook>,
}

type SaveHook = Box<dyn FnMut(&Note) + Send>;

impl NoteEditor {
    pub fn new(store: SharedStore, initial: Option<Note>) -> Self {
        let draft = initial.clone().unwrap_or_default();
        NoteEditor {
            store,
            initial,
            draft,
            on_save: None,
        }
    }

    /// Runs `hook` with the note as written after every successful submit.
    pub fn on_save<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&Note) + Send + 'static,
    {
        self.on_save = Some(Box::new(hook));
        self
    }

    /// Switches the editor to `initial`, or to a fresh empty note when `None`.
    pub fn load(&mut self, initial: Option<Note>) {
        self.draft = initial.clone().unwrap_or_default();
        self.initial = initial;
    }

    pub fn draft(&self) -> &Note {
        &self.draft
    }

    /// True when editing a note that already exists in the store.
    pub fn is_editing(&self) -> bool {
        self.initial.is_some()
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.draft.title = title.into();
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.draft.content = content.into();
    }

    /// Validates, trims, stamps and writes the draft.
    ///
    /// On success returns the note as written and runs the
    /// [`on_save`](NoteEditor::on_save) hook. A new note resets the editor
    /// to a fresh empty draft; an edited note stays loaded as saved. On
    /// failure the draft is left untouched.
    ///
    /// # Errors
    /// - [`NoteError::MissingFields`] if the trimmed title or content is empty
    /// - [`SyncError::Write`] if the store rejects the write
    pub async fn submit(&mut self) -> Result<Note, EditorError> {
        let to_save = self.draft.normalized(now_millis())?;

        self.store
            .write(&to_save)
            .await
            .map_err(SyncError::Write)?;

        log::info!("note \"{}\" saved", to_save.title);

        if let Some(hook) = self.on_save.as_mut() {
            hook(&to_save);
        }

        self.draft = if self.is_editing() {
            to_save.clone()
        } else {
            Note::new()
        };

        Ok(to_save)
    }
}
