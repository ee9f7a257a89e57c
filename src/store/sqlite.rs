use crate::config::StoreConfig;
use crate::domain::{Note, now_millis};
use crate::error::StoreError;
use crate::store::{
    Direction, NoteStoreClient, RawDocument, SubscriptionHandle, WatchEvent, WatchListener,
    encode_note, validate_ordering_field,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// A document store backed by a SQLite database.
///
/// Documents live in a single `documents` table keyed by
/// `(collection, key)` with the payload stored as JSON text. Live queries
/// are served by one background task per store that re-reads the
/// collection after every local write or remove, and on every poll tick
/// when [`StoreConfig::poll_interval`] is set. That task handles one refresh
/// at a time, so each watcher sees result sets in commit order.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

struct Inner {
    pool: SqlitePool,
    collection: String,
    registry: Arc<Mutex<Registry>>,
    pump: mpsc::UnboundedSender<PumpRequest>,
}

#[derive(Default)]
struct Registry {
    watchers: HashMap<u64, Watcher>,
    next_id: u64,
}

struct Watcher {
    ordering_field: String,
    direction: Direction,
    listener: WatchListener,
    last_pushed: Option<Vec<RawDocument>>,
}

#[derive(Debug, Clone, Copy)]
enum PumpRequest {
    /// Re-read for every watcher.
    Refresh,
    /// Push the current result set to a freshly registered watcher.
    Prime(u64),
}

impl SqliteStore {
    /// Opens (or creates) the database named in `config` and starts the
    /// background refresh task. Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// - [`StoreError::Config`] if the config does not validate
    /// - [`StoreError::Database`] if the connection or schema setup fails
    pub async fn connect(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let pool = SqlitePool::connect(&config.database_url).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, key)
            )",
        )
        .execute(&pool)
        .await?;

        let registry = Arc::new(Mutex::new(Registry::default()));
        let (pump_tx, pump_rx) = mpsc::unbounded_channel();

        let pump = Pump {
            pool: pool.clone(),
            collection: config.collection.clone(),
            registry: registry.clone(),
        };
        tokio::spawn(pump.run(pump_rx, config.poll_interval));

        log::info!(
            "connected note store `{}` at {}",
            config.collection,
            config.database_url
        );

        Ok(SqliteStore {
            inner: Arc::new(Inner {
                pool,
                collection: config.collection,
                registry,
                pump: pump_tx,
            }),
        })
    }

    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    /// Reads the whole collection once, ordered by `ordering_field`.
    pub async fn fetch(
        &self,
        ordering_field: &str,
        direction: Direction,
    ) -> Result<Vec<RawDocument>, StoreError> {
        validate_ordering_field(ordering_field)?;
        fetch(&self.inner.pool, &self.inner.collection, ordering_field, direction).await
    }

    fn request(&self, request: PumpRequest) {
        if self.inner.pump.send(request).is_err() {
            log::warn!(
                "refresh task for `{}` is gone, dropping {:?}",
                self.inner.collection,
                request
            );
        }
    }
}

#[async_trait]
impl NoteStoreClient for SqliteStore {
    async fn write(&self, note: &Note) -> Result<(), StoreError> {
        let payload = encode_note(note)?;

        sqlx::query(
            "INSERT INTO documents (collection, key, data, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(collection, key) DO UPDATE
             SET data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(&self.inner.collection)
        .bind(&note.id)
        .bind(payload.to_string())
        .bind(now_millis())
        .execute(&self.inner.pool)
        .await?;

        self.request(PumpRequest::Refresh);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let res = sqlx::query("DELETE FROM documents WHERE collection = ? AND key = ?")
            .bind(&self.inner.collection)
            .bind(id)
            .execute(&self.inner.pool)
            .await?;

        if res.rows_affected() > 0 {
            self.request(PumpRequest::Refresh);
        }
        Ok(())
    }

    fn watch(
        &self,
        ordering_field: &str,
        direction: Direction,
        listener: WatchListener,
    ) -> Result<Box<dyn SubscriptionHandle>, StoreError> {
        validate_ordering_field(ordering_field)?;

        if self.inner.pump.is_closed() {
            return Err(StoreError::Closed);
        }

        let id = {
            let mut registry = self.inner.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.watchers.insert(
                id,
                Watcher {
                    ordering_field: ordering_field.to_string(),
                    direction,
                    listener,
                    last_pushed: None,
                },
            );
            id
        };

        if self.inner.pump.send(PumpRequest::Prime(id)).is_err() {
            self.inner.registry.lock().watchers.remove(&id);
            return Err(StoreError::Closed);
        }

        log::debug!("watch {id} opened on `{}`", self.inner.collection);

        Ok(Box::new(SqliteHandle {
            registry: Arc::downgrade(&self.inner.registry),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

struct SqliteHandle {
    registry: Weak<Mutex<Registry>>,
    id: u64,
    closed: AtomicBool,
}

impl SubscriptionHandle for SqliteHandle {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().watchers.remove(&self.id);
            log::debug!("watch {} closed", self.id);
        }
    }
}

struct Pump {
    pool: SqlitePool,
    collection: String,
    registry: Arc<Mutex<Registry>>,
}

impl Pump {
    /// Serves refresh requests until every store handle is dropped.
    async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<PumpRequest>,
        poll_interval: Option<Duration>,
    ) {
        let mut ticker = poll_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            let request = tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = tick(&mut ticker) => PumpRequest::Refresh,
            };

            match request {
                PumpRequest::Refresh => self.refresh(None).await,
                PumpRequest::Prime(id) => self.refresh(Some(id)).await,
            }
        }

        log::debug!("refresh task for `{}` stopped", self.collection);
    }

    /// Re-reads the collection for the targeted watchers and pushes any
    /// result set that differs from the last one they received.
    async fn refresh(&self, only: Option<u64>) {
        let targets: Vec<(u64, String, Direction)> = {
            let registry = self.registry.lock();
            registry
                .watchers
                .iter()
                .filter(|(id, _)| only.is_none_or(|target| target == **id))
                .map(|(id, w)| (*id, w.ordering_field.clone(), w.direction))
                .collect()
        };

        let mut results: HashMap<(String, Direction), Result<Vec<RawDocument>, StoreError>> =
            HashMap::new();

        for (id, field, direction) in targets {
            let key = (field, direction);
            let cached = results.get(&key).cloned();
            let result = match cached {
                Some(result) => result,
                None => {
                    let result = fetch(&self.pool, &self.collection, &key.0, direction).await;
                    results.insert(key, result.clone());
                    result
                }
            };

            match result {
                Ok(documents) => {
                    let listener = {
                        let mut registry = self.registry.lock();
                        let Some(watcher) = registry.watchers.get_mut(&id) else {
                            continue;
                        };
                        if watcher.last_pushed.as_ref() == Some(&documents) {
                            continue;
                        }
                        watcher.last_pushed = Some(documents.clone());
                        watcher.listener.clone()
                    };
                    listener(WatchEvent::Snapshot(documents));
                }
                Err(err) => {
                    let removed = self.registry.lock().watchers.remove(&id);
                    if let Some(watcher) = removed {
                        log::error!("watch {id} on `{}` failed: {err}", self.collection);
                        (watcher.listener)(WatchEvent::Error(err));
                    }
                }
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn fetch(
    pool: &SqlitePool,
    collection: &str,
    ordering_field: &str,
    direction: Direction,
) -> Result<Vec<RawDocument>, StoreError> {
    let sql = format!(
        "SELECT key, data FROM documents
         WHERE collection = ?
         ORDER BY CASE WHEN json_valid(data) THEN json_extract(data, '$.{ordering_field}') END {},
                  key ASC",
        direction.as_sql()
    );

    let rows = sqlx::query(&sql).bind(collection).fetch_all(pool).await?;

    let documents = rows
        .into_iter()
        .map(|row| {
            let key: String = row.get(0);
            let text: String = row.get(1);
            let data = serde_json::from_str(&text).unwrap_or(Value::String(text));
            RawDocument { key, data }
        })
        .collect();

    Ok(documents)
}
