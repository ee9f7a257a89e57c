//! Consumers of the synchronization layer: the note editor and the note list.

pub mod editor;
pub mod list;

pub use editor::{EditorError, NoteEditor};
pub use list::{ListState, NoteListObserver};
