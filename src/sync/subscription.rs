use crate::domain::NoteSnapshot;
use crate::error::SyncError;
use crate::store::{
    Direction, LAST_UPDATED_FIELD, SharedStore, SubscriptionHandle, WatchEvent, WatchListener,
};
use crate::sync::transform::transform_snapshot;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Lifecycle of one live notes query.
///
/// `Idle -> Subscribing -> Active -> Closed`, with `Failed` reachable from
/// `Subscribing` or `Active`. `Closed` is final; `Failed` only moves on to
/// `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Active,
    Closed,
    Failed,
}

type SnapshotCallback = Box<dyn FnMut(NoteSnapshot) + Send>;
type ErrorCallback = Box<dyn FnOnce(SyncError) + Send>;

struct Callbacks {
    on_snapshot: SnapshotCallback,
    on_error: Option<ErrorCallback>,
}

/// State shared between the [`Unsubscribe`] guard and the store listener.
///
/// Lock order: `delivery`, then `state`, then `handle`. `delivery` is held
/// for the whole of a delivery, callback included, so teardown from another
/// thread waits for an in-flight callback. It is re-entrant so a callback
/// may unsubscribe on its own thread. The callbacks are moved out of the
/// cell while one runs.
struct Shared {
    state: Mutex<SubscriptionState>,
    handle: Mutex<Option<Box<dyn SubscriptionHandle>>>,
    delivery: ReentrantMutex<RefCell<Option<Callbacks>>>,
    primed: AtomicBool,
}

impl Shared {
    fn accepting(&self) -> bool {
        matches!(
            *self.state.lock(),
            SubscriptionState::Subscribing | SubscriptionState::Active
        )
    }

    /// Moves to `Failed` unless teardown or an earlier failure got there first.
    fn try_fail(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            SubscriptionState::Subscribing | SubscriptionState::Active => {
                *state = SubscriptionState::Failed;
                true
            }
            _ => false,
        }
    }

    fn close_handle(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.close();
        }
    }

    fn deliver(&self, event: WatchEvent) {
        let delivery = self.delivery.lock();
        if delivery.borrow().is_none() {
            return;
        }

        match event {
            WatchEvent::Snapshot(documents) => {
                if !self.accepting() {
                    log::debug!("discarding snapshot after teardown");
                    return;
                }
                let snapshot = transform_snapshot(&documents);

                let Some(mut callbacks) = delivery.borrow_mut().take() else {
                    return;
                };
                if !self.accepting() {
                    log::debug!("discarding snapshot after teardown");
                    return;
                }
                self.primed.store(true, Ordering::SeqCst);
                (callbacks.on_snapshot)(snapshot);

                // a callback that unsubscribed leaves the callbacks dropped
                if self.accepting() {
                    *delivery.borrow_mut() = Some(callbacks);
                }
            }
            WatchEvent::Error(err) => {
                if !self.try_fail() {
                    log::debug!("discarding error after teardown: {err}");
                    return;
                }
                let on_error = delivery
                    .borrow_mut()
                    .take()
                    .and_then(|callbacks| callbacks.on_error);

                self.close_handle();

                let err = if self.primed.load(Ordering::SeqCst) {
                    SyncError::Transport(err)
                } else {
                    SyncError::Setup(err)
                };
                log::error!("{err}");
                if let Some(on_error) = on_error {
                    on_error(err);
                }
            }
        }
    }

    /// Reports a failure to open the query. Never follows a snapshot.
    fn fail_setup(&self, err: SyncError) {
        let delivery = self.delivery.lock();
        if !self.try_fail() {
            return;
        }
        let on_error = delivery
            .borrow_mut()
            .take()
            .and_then(|callbacks| callbacks.on_error);

        log::error!("{err}");
        if let Some(on_error) = on_error {
            on_error(err);
        }
    }
}

/// Owns exactly one live query against a note store.
///
/// A manager is consumed by [`start`](SubscriptionManager::start); opening
/// another query, for example after a failure, takes a fresh manager.
pub struct SubscriptionManager {
    store: SharedStore,
    ordering_field: String,
    direction: Direction,
}

impl SubscriptionManager {
    /// A manager that watches notes most recently updated first.
    pub fn new(store: SharedStore) -> Self {
        SubscriptionManager {
            store,
            ordering_field: LAST_UPDATED_FIELD.to_string(),
            direction: Direction::Descending,
        }
    }

    /// Overrides the query ordering.
    pub fn ordered_by(mut self, field: &str, direction: Direction) -> Self {
        self.ordering_field = field.to_string();
        self.direction = direction;
        self
    }

    /// Opens the live query and starts delivering snapshots.
    ///
    /// - Every pushed result set is transformed and passed to `on_snapshot`,
    ///   in the order the store pushed them.
    /// - The first store error is passed to `on_error`; nothing is delivered
    ///   after it. It is a [`SyncError::Transport`] once a snapshot has been
    ///   delivered and a [`SyncError::Setup`] before that.
    /// - If the store refuses the query, `on_error` receives
    ///   [`SyncError::Setup`] before this returns and `on_snapshot` is never
    ///   called.
    ///
    /// Dropping the returned [`Unsubscribe`] tears the query down.
    pub fn start<S, E>(self, on_snapshot: S, on_error: E) -> Unsubscribe
    where
        S: FnMut(NoteSnapshot) + Send + 'static,
        E: FnOnce(SyncError) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(SubscriptionState::Idle),
            handle: Mutex::new(None),
            delivery: ReentrantMutex::new(RefCell::new(Some(Callbacks {
                on_snapshot: Box::new(on_snapshot),
                on_error: Some(Box::new(on_error)),
            }))),
            primed: AtomicBool::new(false),
        });

        *shared.state.lock() = SubscriptionState::Subscribing;
        log::debug!(
            "subscribing to notes ordered by {} {:?}",
            self.ordering_field,
            self.direction
        );

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let listener: WatchListener = Arc::new(move |event: WatchEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.deliver(event);
            }
        });

        match self
            .store
            .watch(&self.ordering_field, self.direction, listener)
        {
            Ok(handle) => {
                let mut state = shared.state.lock();
                if *state == SubscriptionState::Subscribing {
                    *state = SubscriptionState::Active;
                    *shared.handle.lock() = Some(handle);
                    log::debug!("notes subscription active");
                } else {
                    drop(state);
                    handle.close();
                }
            }
            Err(err) => shared.fail_setup(SyncError::Setup(err)),
        }

        Unsubscribe { shared }
    }
}

/// Tears down a live query started by [`SubscriptionManager::start`].
///
/// Calling [`unsubscribe`](Unsubscribe::unsubscribe) more than once is a
/// no-op, and no callback fires after the first call returns. A callback
/// already running on another thread is waited for. Dropping the guard
/// unsubscribes.
#[must_use = "dropping the guard closes the subscription immediately"]
pub struct Unsubscribe {
    shared: Arc<Shared>,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == SubscriptionState::Closed {
                return;
            }
            *state = SubscriptionState::Closed;
        }

        self.shared.close_handle();

        // Blocks while a callback runs on another thread. On the callback's
        // own thread the lock is re-entered and the cell is already empty.
        self.shared.delivery.lock().borrow_mut().take();

        log::debug!("notes subscription closed");
    }

    pub fn state(&self) -> SubscriptionState {
        *self.shared.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SubscriptionState::Closed
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::domain::Note;
    use crate::error::StoreError;
    use crate::store::memory::MemoryStore;
    use crate::store::{NoteStoreClient, RawDocument};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        snapshots: Mutex<Vec<NoteSnapshot>>,
        errors: Mutex<Vec<SyncError>>,
    }

    fn start(store: &MemoryStore, recorder: &Arc<Recorder>) -> Unsubscribe {
        let on_snapshot = {
            let recorder = recorder.clone();
            move |snapshot| recorder.snapshots.lock().push(snapshot)
        };
        let on_error = {
            let recorder = recorder.clone();
            move |err| recorder.errors.lock().push(err)
        };
        SubscriptionManager::new(Arc::new(store.clone())).start(on_snapshot, on_error)
    }

    fn store() -> MemoryStore {
        MemoryStore::new(StoreConfig::for_collection("notes"))
    }

    /// Hands the listener back to the test instead of pushing anything.
    struct CapturingStore {
        captured: Arc<Mutex<Option<WatchListener>>>,
    }

    struct NoopHandle;
    impl SubscriptionHandle for NoopHandle {
        fn close(&self) {}
    }

    #[async_trait::async_trait]
    impl NoteStoreClient for CapturingStore {
        async fn write(&self, _note: &Note) -> Result<(), StoreError> {
            Ok(())
        }
        async fn remove(&self, _id: &str) -> Result<(), StoreError> {
            Ok(())
        }
        fn watch(
            &self,
            _ordering_field: &str,
            _direction: Direction,
            listener: WatchListener,
        ) -> Result<Box<dyn SubscriptionHandle>, StoreError> {
            *self.captured.lock() = Some(listener);
            Ok(Box::new(NoopHandle))
        }
    }

    #[test]
    fn initial_snapshot_is_delivered_and_state_is_active() {
        let store = store();
        let recorder = Arc::new(Recorder::default());

        let unsubscribe = start(&store, &recorder);

        assert_eq!(unsubscribe.state(), SubscriptionState::Active);
        assert_eq!(recorder.snapshots.lock().len(), 1);
        assert!(recorder.snapshots.lock()[0].is_empty());
    }

    #[test]
    fn unsubscribe_is_idempotent_and_silences_callbacks() {
        let store = store();
        let recorder = Arc::new(Recorder::default());
        let unsubscribe = start(&store, &recorder);

        for _ in 0..3 {
            unsubscribe.unsubscribe();
        }
        assert!(unsubscribe.is_closed());
        assert_eq!(store.listener_count(), 0);

        store.insert_raw("late", json!({ "id": "late", "title": "t", "content": "c", "lastUpdated": 1 }));
        store.emit_error(StoreError::Transport("gone".into()));

        assert_eq!(recorder.snapshots.lock().len(), 1);
        assert!(recorder.errors.lock().is_empty());
    }

    #[test]
    fn transport_error_fails_once_and_stops_delivery() {
        let store = store();
        let recorder = Arc::new(Recorder::default());
        let unsubscribe = start(&store, &recorder);

        store.emit_error(StoreError::Transport("connection reset".into()));
        assert_eq!(unsubscribe.state(), SubscriptionState::Failed);
        assert_eq!(recorder.errors.lock().len(), 1);
        assert!(matches!(recorder.errors.lock()[0], SyncError::Transport(_)));

        store.insert_raw("n1", json!({ "id": "n1", "title": "t", "content": "c", "lastUpdated": 1 }));
        assert_eq!(recorder.snapshots.lock().len(), 1);

        unsubscribe.unsubscribe();
        assert_eq!(unsubscribe.state(), SubscriptionState::Closed);
        assert!(recorder.errors.lock().len() == 1);
    }

    #[test]
    fn setup_failure_reports_once_without_snapshots() {
        let store = store();
        store.fail_watch(Some(StoreError::PermissionDenied("notes".into())));
        let recorder = Arc::new(Recorder::default());

        let unsubscribe = start(&store, &recorder);

        assert_eq!(unsubscribe.state(), SubscriptionState::Failed);
        assert!(recorder.snapshots.lock().is_empty());
        assert_eq!(recorder.errors.lock().len(), 1);
        assert!(matches!(recorder.errors.lock()[0], SyncError::Setup(_)));

        unsubscribe.unsubscribe();
        unsubscribe.unsubscribe();
        assert!(unsubscribe.is_closed());
        assert_eq!(recorder.errors.lock().len(), 1);
    }

    #[test]
    fn invalid_ordering_field_is_a_setup_error() {
        let store = store();
        let recorder = Arc::new(Recorder::default());

        let on_error = {
            let recorder = recorder.clone();
            move |err| recorder.errors.lock().push(err)
        };
        let unsubscribe = SubscriptionManager::new(Arc::new(store.clone()))
            .ordered_by("last updated", Direction::Descending)
            .start(|_| panic!("no snapshot expected"), on_error);

        assert_eq!(unsubscribe.state(), SubscriptionState::Failed);
        assert!(matches!(
            recorder.errors.lock()[0],
            SyncError::Setup(StoreError::InvalidQuery(_))
        ));
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Arc<Unsubscribe>>>> = Arc::new(Mutex::new(None));

        let on_snapshot = {
            let calls = calls.clone();
            let slot = slot.clone();
            move |_snapshot: NoteSnapshot| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(unsubscribe) = slot.lock().as_ref() {
                    unsubscribe.unsubscribe();
                }
            }
        };
        let unsubscribe = Arc::new(
            SubscriptionManager::new(Arc::new(store.clone())).start(on_snapshot, |_| {}),
        );
        *slot.lock() = Some(unsubscribe.clone());

        store.insert_raw("a", json!({ "id": "a", "title": "t", "content": "c", "lastUpdated": 1 }));
        store.insert_raw("b", json!({ "id": "b", "title": "t", "content": "c", "lastUpdated": 2 }));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(unsubscribe.is_closed());
        slot.lock().take();
    }

    #[test]
    fn late_event_from_a_stale_listener_is_discarded() {
        // A listener captured by the transport before teardown must not fire.
        let captured: Arc<Mutex<Option<WatchListener>>> = Arc::new(Mutex::new(None));

        let recorder = Arc::new(Recorder::default());
        let on_snapshot = {
            let recorder = recorder.clone();
            move |snapshot| recorder.snapshots.lock().push(snapshot)
        };
        let unsubscribe = SubscriptionManager::new(Arc::new(CapturingStore {
            captured: captured.clone(),
        }))
        .start(on_snapshot, |_| {});

        let listener = captured.lock().clone().unwrap();
        listener(WatchEvent::Snapshot(vec![RawDocument::new(
            "n1",
            json!({ "id": "n1", "title": "X", "content": "c", "lastUpdated": 100 }),
        )]));
        assert_eq!(recorder.snapshots.lock().len(), 1);

        unsubscribe.unsubscribe();
        listener(WatchEvent::Snapshot(vec![]));
        listener(WatchEvent::Error(StoreError::Transport("late".into())));
        assert_eq!(recorder.snapshots.lock().len(), 1);
        assert!(recorder.errors.lock().is_empty());
    }

    #[test]
    fn error_before_first_snapshot_is_a_setup_error() {
        let captured: Arc<Mutex<Option<WatchListener>>> = Arc::new(Mutex::new(None));
        let recorder = Arc::new(Recorder::default());
        let on_error = {
            let recorder = recorder.clone();
            move |err| recorder.errors.lock().push(err)
        };
        let unsubscribe = SubscriptionManager::new(Arc::new(CapturingStore {
            captured: captured.clone(),
        }))
        .start(|_| panic!("no snapshot expected"), on_error);
        assert_eq!(unsubscribe.state(), SubscriptionState::Active);

        let listener = captured.lock().clone().unwrap();
        listener(WatchEvent::Error(StoreError::PermissionDenied("notes".into())));

        assert_eq!(unsubscribe.state(), SubscriptionState::Failed);
        assert_eq!(recorder.errors.lock().len(), 1);
        assert!(matches!(
            recorder.errors.lock()[0],
            SyncError::Setup(StoreError::PermissionDenied(_))
        ));
    }

    #[test]
    fn error_after_a_snapshot_is_a_transport_error() {
        let captured: Arc<Mutex<Option<WatchListener>>> = Arc::new(Mutex::new(None));
        let recorder = Arc::new(Recorder::default());
        let on_error = {
            let recorder = recorder.clone();
            move |err| recorder.errors.lock().push(err)
        };
        let _unsubscribe = SubscriptionManager::new(Arc::new(CapturingStore {
            captured: captured.clone(),
        }))
        .start(|_| {}, on_error);

        let listener = captured.lock().clone().unwrap();
        listener(WatchEvent::Snapshot(vec![]));
        listener(WatchEvent::Error(StoreError::Transport("reset".into())));

        assert!(matches!(
            recorder.errors.lock()[0],
            SyncError::Transport(StoreError::Transport(_))
        ));
    }
}
