use clap::{Parser, Subcommand};
use note_sync::config::StoreConfig;
use note_sync::store::SharedStore;
use note_sync::store::sqlite::SqliteStore;
use note_sync::view::{ListState, NoteEditor, NoteListObserver};
use note_sync::{Note, NoteSnapshot};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

const FIRST_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "note-sync", version, about = "Shared live notes")]
struct Cli {
    /// SQLite connection string, e.g. `sqlite:notes.db?mode=rwc`
    #[arg(long, global = true)]
    database: Option<String>,

    /// Collection holding the notes
    #[arg(long, global = true)]
    collection: Option<String>,

    /// Re-read the collection every N milliseconds to pick up other sessions
    #[arg(long, global = true)]
    poll_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every note, most recent first
    List,
    /// Print the note list every time it changes, until Ctrl-C
    Watch,
    /// Create a note
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: String,
    },
    /// Overwrite the title and/or content of an existing note
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        content: Option<String>,
    },
    /// Delete a note
    Rm { id: String },
}

impl Cli {
    fn store_config(&self) -> Result<StoreConfig, Box<dyn Error>> {
        let mut config = StoreConfig::from_env()?;

        if let Some(url) = &self.database {
            config.database_url = url.clone();
        }
        if let Some(collection) = &self.collection {
            config.collection = collection.clone();
        }
        if let Some(ms) = self.poll_ms {
            config.poll_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv::dotenv().ok();
    note_sync::logging::init();

    let cli = Cli::parse();
    let config = cli.store_config()?;
    let store: SharedStore = Arc::new(SqliteStore::connect(config).await?);

    match cli.command {
        Command::List => {
            let mut observer = NoteListObserver::new(store);
            observer.mount();
            let snapshot = first_snapshot(&observer).await?;
            print_notes(&snapshot);
        }
        Command::Watch => {
            let mut observer = NoteListObserver::new(store);
            let mut updates = observer.updates();
            observer.mount();

            loop {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = updates.borrow_and_update().clone();
                        match state {
                            ListState::Loading => {}
                            ListState::Ready(snapshot) => {
                                println!("--- {} note(s)", snapshot.len());
                                print_notes(&snapshot);
                            }
                            ListState::Failed(message) => {
                                eprintln!("{message}");
                                break;
                            }
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            observer.unmount();
        }
        Command::Add { title, content } => {
            let mut editor = NoteEditor::new(store, None);
            editor.set_title(title);
            editor.set_content(content);
            let note = editor.submit().await?;
            println!("{}", note.id);
        }
        Command::Edit { id, title, content } => {
            let mut observer = NoteListObserver::new(store.clone());
            observer.mount();
            let snapshot = first_snapshot(&observer).await?;
            observer.unmount();

            let existing = snapshot
                .get(&id)
                .cloned()
                .ok_or_else(|| format!("no note with id {id}"))?;

            let mut editor = NoteEditor::new(store, Some(existing));
            if let Some(title) = title {
                editor.set_title(title);
            }
            if let Some(content) = content {
                editor.set_content(content);
            }
            let note = editor.submit().await?;
            println!("{}", note.id);
        }
        Command::Rm { id } => {
            let observer = NoteListObserver::new(store);
            observer.delete(&id).await?;
        }
    }

    Ok(())
}

/// Waits until the observer leaves `Loading` and returns the snapshot.
async fn first_snapshot(observer: &NoteListObserver) -> Result<NoteSnapshot, Box<dyn Error>> {
    let mut updates = observer.updates();
    let state = tokio::time::timeout(
        FIRST_SNAPSHOT_TIMEOUT,
        updates.wait_for(|state| !matches!(state, ListState::Loading)),
    )
    .await??
    .clone();

    match state {
        ListState::Ready(snapshot) => Ok(snapshot),
        ListState::Failed(message) => Err(message.into()),
        ListState::Loading => Err("notes never loaded".into()),
    }
}

fn print_notes(snapshot: &NoteSnapshot) {
    if snapshot.is_empty() {
        println!("No notes yet. Create your first note!");
        return;
    }

    for note in snapshot.by_recency() {
        println!("{}  {}  {}", note.id, format_timestamp(note), note.title);
        for line in note.content.lines() {
            println!("    {line}");
        }
    }
}

fn format_timestamp(note: &Note) -> String {
    chrono::DateTime::from_timestamp_millis(note.last_updated)
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}
