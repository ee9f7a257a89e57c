//! # note_sync
//!
//! Realtime synchronization of a small collection of text notes kept in a
//! document store and shared live between sessions.
//!
//! ## Features
//!
//! - **Store boundary**: one narrow trait ([`store::NoteStoreClient`]) for
//!   upserting, deleting and live-querying notes, with an in-memory fake and
//!   a SQLite-backed implementation
//! - **Full snapshots**: every push is rebuilt into a complete
//!   [`NoteSnapshot`]; malformed documents are skipped, never fatal
//! - **Safe lifecycle**: [`sync::SubscriptionManager`] owns exactly one live
//!   query, reports each failure once, and never fires a callback after
//!   teardown
//! - **Consumers**: a note editor and a note list observer built on top
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use note_sync::config::StoreConfig;
//! use note_sync::store::sqlite::SqliteStore;
//! use note_sync::sync::SubscriptionManager;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::connect(StoreConfig::from_env()?).await?;
//!
//! let unsubscribe = SubscriptionManager::new(Arc::new(store)).start(
//!     |snapshot| {
//!         for note in snapshot.by_recency() {
//!             println!("{}: {}", note.title, note.content);
//!         }
//!     },
//!     |err| eprintln!("{err}"),
//! );
//!
//! // ... later, when the view goes away
//! unsubscribe.unsubscribe();
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Store backends fail with [`StoreError`]. The synchronization layer
//! classifies failures into [`SyncError`]: `Setup` and `Transport` for the
//! live query, `Write` and `Delete` for mutations, and `MalformedPayload`
//! for documents that do not parse as notes.

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod store;
pub mod sync;
pub mod view;

pub use domain::{Note, NoteSnapshot};
pub use error::{StoreError, SyncError, SyncResult};
