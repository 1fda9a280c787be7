pub(crate) mod note_snapshot;
pub(crate) mod note_store;

pub use note_snapshot::{is_dirty, Snapshot};
pub use note_store::{NoteStore, NoteUpdate};
