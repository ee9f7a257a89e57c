use crate::config::StoreConfig;
use crate::domain::Note;
use crate::error::StoreError;
use crate::store::{
    Direction, NoteStoreClient, RawDocument, SubscriptionHandle, WatchEvent, WatchListener,
    encode_note, validate_ordering_field,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

/// An in-process document store that behaves like a remote one.
///
/// Every write or remove pushes the full ordered result set to all open
/// watches, and `watch` pushes the current result set before returning.
/// Pushes are serialized, so each listener observes states in commit order.
///
/// Listeners must not call back into [`MemoryStore::emit_error`] or
/// [`MemoryStore::insert_raw`] synchronously; closing their own handle is fine.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    config: StoreConfig,
    state: Mutex<State>,
    dispatch: Mutex<()>,
}

#[derive(Default)]
struct State {
    documents: BTreeMap<String, Value>,
    watchers: HashMap<u64, Watcher>,
    next_watcher: u64,
    write_failure: Option<StoreError>,
    watch_failure: Option<StoreError>,
}

#[derive(Clone)]
struct Watcher {
    ordering_field: String,
    direction: Direction,
    listener: WatchListener,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        MemoryStore {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                dispatch: Mutex::new(()),
            }),
        }
    }

    pub fn collection(&self) -> &str {
        &self.inner.config.collection
    }

    /// Makes every following `write` and `remove` fail with `err`, or
    /// restores normal behaviour with `None`.
    pub fn fail_writes(&self, err: Option<StoreError>) {
        self.inner.state.lock().write_failure = err;
    }

    /// Makes every following `watch` fail at setup with `err`, or restores
    /// normal behaviour with `None`.
    pub fn fail_watch(&self, err: Option<StoreError>) {
        self.inner.state.lock().watch_failure = err;
    }

    /// Simulates the connection dropping: pushes `err` to every open watch
    /// and forgets them.
    pub fn emit_error(&self, err: StoreError) {
        let _dispatch = self.inner.dispatch.lock();
        let watchers: Vec<Watcher> = {
            let mut state = self.inner.state.lock();
            state.watchers.drain().map(|(_, w)| w).collect()
        };

        log::debug!(
            "pushing error to {} watcher(s) of `{}`: {err}",
            watchers.len(),
            self.collection()
        );

        for watcher in watchers {
            (watcher.listener)(WatchEvent::Error(err.clone()));
        }
    }

    /// Stores an arbitrary payload under `key`, bypassing note encoding,
    /// and pushes the new result set.
    pub fn insert_raw(&self, key: &str, data: Value) {
        self.inner
            .state
            .lock()
            .documents
            .insert(key.to_string(), data);
        self.broadcast();
    }

    /// The stored payload under `key`, if any.
    pub fn document(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().documents.get(key).cloned()
    }

    /// Number of watches currently registered.
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().watchers.len()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        self.inner.config.validate()?;
        match &self.inner.state.lock().write_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn broadcast(&self) {
        let _dispatch = self.inner.dispatch.lock();
        let (documents, watchers) = {
            let state = self.inner.state.lock();
            let watchers: Vec<Watcher> = state.watchers.values().cloned().collect();
            (state.documents.clone(), watchers)
        };

        for watcher in watchers {
            let result_set = ordered(&documents, &watcher.ordering_field, watcher.direction);
            (watcher.listener)(WatchEvent::Snapshot(result_set));
        }
    }
}

#[async_trait]
impl NoteStoreClient for MemoryStore {
    async fn write(&self, note: &Note) -> Result<(), StoreError> {
        self.check_writable()?;
        let payload = encode_note(note)?;

        self.inner
            .state
            .lock()
            .documents
            .insert(note.id.clone(), payload);
        self.broadcast();
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.check_writable()?;

        let removed = self.inner.state.lock().documents.remove(id).is_some();
        if removed {
            self.broadcast();
        }
        Ok(())
    }

    fn watch(
        &self,
        ordering_field: &str,
        direction: Direction,
        listener: WatchListener,
    ) -> Result<Box<dyn SubscriptionHandle>, StoreError> {
        self.inner.config.validate()?;
        validate_ordering_field(ordering_field)?;

        let _dispatch = self.inner.dispatch.lock();
        let (id, documents) = {
            let mut state = self.inner.state.lock();
            if let Some(err) = &state.watch_failure {
                return Err(err.clone());
            }

            let id = state.next_watcher;
            state.next_watcher += 1;
            state.watchers.insert(
                id,
                Watcher {
                    ordering_field: ordering_field.to_string(),
                    direction,
                    listener: listener.clone(),
                },
            );
            (id, state.documents.clone())
        };

        log::debug!("watch {id} opened on `{}`", self.collection());
        listener(WatchEvent::Snapshot(ordered(&documents, ordering_field, direction)));

        Ok(Box::new(MemoryHandle {
            inner: Arc::downgrade(&self.inner),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryHandle {
    inner: Weak<Inner>,
    id: u64,
    closed: AtomicBool,
}

impl SubscriptionHandle for MemoryHandle {
    fn close(&self) {
        if self.closed.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.state.lock().watchers.remove(&self.id);
            log::debug!("watch {} closed on `{}`", self.id, inner.config.collection);
        }
    }
}

/// Orders documents by the JSON value at `field`, falling back to the key.
fn ordered(
    documents: &BTreeMap<String, Value>,
    field: &str,
    direction: Direction,
) -> Vec<RawDocument> {
    let mut result: Vec<RawDocument> = documents
        .iter()
        .map(|(key, data)| RawDocument::new(key.clone(), data.clone()))
        .collect();

    result.sort_by(|a, b| {
        let by_field = compare_values(a.data.get(field), b.data.get(field));
        let by_field = match direction {
            Direction::Ascending => by_field,
            Direction::Descending => by_field.reverse(),
        };
        by_field.then_with(|| a.key.cmp(&b.key))
    });
    result
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
