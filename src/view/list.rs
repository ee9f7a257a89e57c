use crate::domain::{Note, NoteSnapshot};
use crate::error::SyncError;
use crate::store::SharedStore;
use crate::sync::subscription::{SubscriptionManager, Unsubscribe};
use std::sync::Arc;
use tokio::sync::watch;

/// What the note list currently shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListState {
    /// Mounted, no snapshot yet.
    Loading,
    Ready(NoteSnapshot),
    /// The subscription failed; carries the message to show next to a retry.
    Failed(String),
}

/// Keeps a live, recency-sorted view of every note while mounted.
///
/// Owns at most one subscription at a time, bound to
/// [`mount`](NoteListObserver::mount) and
/// [`unmount`](NoteListObserver::unmount). Dropping the observer unmounts it.
pub struct NoteListObserver {
    store: SharedStore,
    state: Arc<watch::Sender<ListState>>,
    subscription: Option<Unsubscribe>,
}

impl NoteListObserver {
    pub fn new(store: SharedStore) -> Self {
        let (tx, _rx) = watch::channel(ListState::Loading);
        NoteListObserver {
            store,
            state: Arc::new(tx),
            subscription: None,
        }
    }

    /// Starts observing the collection. Does nothing when already mounted.
    pub fn mount(&mut self) {
        if self.subscription.is_some() {
            log::debug!("note list already mounted");
            return;
        }

        self.state.send_replace(ListState::Loading);

        let on_snapshot = {
            let state = self.state.clone();
            move |snapshot: NoteSnapshot| {
                state.send_replace(ListState::Ready(snapshot));
            }
        };
        let on_error = {
            let state = self.state.clone();
            move |err: SyncError| {
                log::error!("error subscribing to notes: {err}");
                state.send_replace(ListState::Failed(format!("Failed to load notes: {err}")));
            }
        };

        let subscription =
            SubscriptionManager::new(self.store.clone()).start(on_snapshot, on_error);
        self.subscription = Some(subscription);
    }

    /// Stops observing. Safe to call when not mounted.
    pub fn unmount(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    /// Replaces the current subscription with a fresh one, e.g. after a failure.
    pub fn retry(&mut self) {
        self.unmount();
        self.mount();
    }

    pub fn is_mounted(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn state(&self) -> ListState {
        self.state.borrow().clone()
    }

    /// A receiver that is notified on every state change.
    pub fn updates(&self) -> watch::Receiver<ListState> {
        self.state.subscribe()
    }

    /// The notes currently shown, most recently updated first. Empty unless
    /// a snapshot has arrived.
    pub fn notes(&self) -> Vec<Note> {
        match &*self.state.borrow() {
            ListState::Ready(snapshot) => snapshot.by_recency().into_iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Deletes a note by id. The list updates when the store pushes the change.
    ///
    /// # Errors
    /// Returns [`SyncError::Delete`] if the store rejects the delete.
    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        self.store.remove(id).await.map_err(SyncError::Delete)?;
        log::info!("note {id} deleted");
        Ok(())
    }
}

impl Drop for NoteListObserver {
    fn drop(&mut self) {
        self.unmount();
    }
}
