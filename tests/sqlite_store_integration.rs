use note_sync::Note;
use note_sync::config::{StoreConfig, sqlite_url};
use note_sync::error::{StoreError, SyncError};
use note_sync::store::sqlite::SqliteStore;
use note_sync::store::{Direction, LAST_UPDATED_FIELD, NoteStoreClient, WatchEvent};
use note_sync::sync::{SubscriptionManager, SubscriptionState};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn config(dir: &TempDir, collection: &str) -> StoreConfig {
    StoreConfig {
        collection: collection.to_string(),
        database_url: sqlite_url(&dir.path().join("notes.db")),
        poll_interval: None,
    }
}

fn note(id: &str, title: &str, last_updated: i64) -> Note {
    Note {
        id: id.to_string(),
        title: title.to_string(),
        content: format!("content of {id}"),
        last_updated,
    }
}

/// Opens a raw watch and forwards its events into a channel.
fn watch(
    store: &SqliteStore,
) -> Result<
    (
        Box<dyn note_sync::store::SubscriptionHandle>,
        mpsc::UnboundedReceiver<WatchEvent>,
    ),
    StoreError,
> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = store.watch(
        LAST_UPDATED_FIELD,
        Direction::Descending,
        Arc::new(move |event: WatchEvent| {
            let _ = tx.send(event);
        }),
    )?;
    Ok((handle, rx))
}

async fn next_keys(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> Vec<String> {
    match timeout(WAIT, rx.recv()).await {
        Ok(Some(WatchEvent::Snapshot(documents))) => {
            documents.into_iter().map(|d| d.key).collect()
        }
        other => panic!("expected a snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn watch_pushes_initial_set_then_every_change() -> Result<(), StoreError> {
    let tmpdir = TempDir::new().unwrap();
    let store = SqliteStore::connect(config(&tmpdir, "notes")).await?;

    store.write(&note("old", "Old", 100)).await?;

    let (_handle, mut rx) = watch(&store)?;
    assert_eq!(next_keys(&mut rx).await, vec!["old"]);

    store.write(&note("new", "New", 200)).await?;
    assert_eq!(next_keys(&mut rx).await, vec!["new", "old"]);

    store.remove("old").await?;
    assert_eq!(next_keys(&mut rx).await, vec!["new"]);

    Ok(())
}

#[tokio::test]
async fn write_is_an_idempotent_upsert() -> Result<(), StoreError> {
    let tmpdir = TempDir::new().unwrap();
    let store = SqliteStore::connect(config(&tmpdir, "notes")).await?;

    let first = note("n1", "First", 100);
    store.write(&first).await?;
    store.write(&first).await?;
    store.write(&note("n1", "Second", 200)).await?;

    let documents = store.fetch(LAST_UPDATED_FIELD, Direction::Descending).await?;
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].data["title"], "Second");
    assert_eq!(documents[0].data["lastUpdated"], 200);

    Ok(())
}

#[tokio::test]
async fn removing_a_missing_key_succeeds() -> Result<(), StoreError> {
    let tmpdir = TempDir::new().unwrap();
    let store = SqliteStore::connect(config(&tmpdir, "notes")).await?;

    store.remove("never-existed").await?;

    Ok(())
}

#[tokio::test]
async fn collections_are_isolated() -> Result<(), StoreError> {
    let tmpdir = TempDir::new().unwrap();
    let notes = SqliteStore::connect(config(&tmpdir, "notes")).await?;
    let journal = SqliteStore::connect(config(&tmpdir, "journal")).await?;

    notes.write(&note("n1", "In notes", 1)).await?;
    journal.write(&note("j1", "In journal", 1)).await?;

    let keys: Vec<_> = notes
        .fetch(LAST_UPDATED_FIELD, Direction::Ascending)
        .await?
        .into_iter()
        .map(|d| d.key)
        .collect();
    assert_eq!(keys, vec!["n1"]);

    Ok(())
}

#[tokio::test]
async fn polling_store_sees_writes_from_another_session() -> Result<(), StoreError> {
    let tmpdir = TempDir::new().unwrap();
    let writer = SqliteStore::connect(config(&tmpdir, "notes")).await?;

    let mut reader_config = config(&tmpdir, "notes");
    reader_config.poll_interval = Some(Duration::from_millis(20));
    let reader = SqliteStore::connect(reader_config).await?;

    let (_handle, mut rx) = watch(&reader)?;
    assert!(next_keys(&mut rx).await.is_empty());

    writer.write(&note("shared", "From elsewhere", 5)).await?;
    assert_eq!(next_keys(&mut rx).await, vec!["shared"]);

    Ok(())
}

#[tokio::test]
async fn closed_handle_stops_pushes() -> Result<(), StoreError> {
    let tmpdir = TempDir::new().unwrap();
    let store = SqliteStore::connect(config(&tmpdir, "notes")).await?;

    let (handle, mut rx) = watch(&store)?;
    next_keys(&mut rx).await;

    handle.close();
    handle.close();
    store.write(&note("n1", "Unseen", 1)).await?;

    let late = timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(!matches!(late, Ok(Some(_))), "no push expected after close");

    Ok(())
}

#[tokio::test]
async fn invalid_collection_fails_to_connect() {
    let tmpdir = TempDir::new().unwrap();
    let result = SqliteStore::connect(config(&tmpdir, "bad/name")).await;
    assert!(matches!(result, Err(StoreError::Config(_))));
}

#[tokio::test]
async fn invalid_ordering_field_fails_at_setup() -> Result<(), StoreError> {
    let tmpdir = TempDir::new().unwrap();
    let store = SqliteStore::connect(config(&tmpdir, "notes")).await?;

    let result = store.watch("title DESC; --", Direction::Descending, Arc::new(|_: WatchEvent| {}));
    assert!(matches!(result, Err(StoreError::InvalidQuery(_))));

    Ok(())
}

#[tokio::test]
async fn query_failure_before_first_result_is_a_setup_error() -> Result<(), StoreError> {
    let tmpdir = TempDir::new().unwrap();
    let config = config(&tmpdir, "notes");
    let store = SqliteStore::connect(config.clone()).await?;

    let other = SqlitePool::connect(&config.database_url).await?;
    sqlx::query("DROP TABLE documents").execute(&other).await?;

    let snapshots = Arc::new(AtomicUsize::new(0));
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let unsubscribe = SubscriptionManager::new(Arc::new(store)).start(
        {
            let snapshots = snapshots.clone();
            move |_| {
                snapshots.fetch_add(1, Ordering::SeqCst);
            }
        },
        move |err| {
            let _ = err_tx.send(err);
        },
    );

    let err = timeout(WAIT, err_rx.recv())
        .await
        .expect("timed out waiting for the error")
        .expect("error callback dropped");
    assert!(matches!(err, SyncError::Setup(StoreError::Database(_))));
    assert_eq!(snapshots.load(Ordering::SeqCst), 0);
    assert_eq!(unsubscribe.state(), SubscriptionState::Failed);

    Ok(())
}
