pub(crate) mod note_sync;
pub(crate) mod session;

use crate::api::ApiError;
use crate::cache::{NoteStore, Snapshot};
use crate::models::{NoteId, Tags};
use crate::storage::{KeyValueStore, TOKEN_KEY};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub use note_sync::{SaveOutcome, SyncEngine, SyncError};
pub use session::{DeleteOutcome, LoadOutcome, Selection, SessionController, SessionError};

/// What the status indicator shows.
///
/// `Saving`, `Saved`, `Error` and `Conflict` annotate an otherwise ready
/// session and never block new operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Empty,
    Loading,
    Ready,
    Saving,
    Saved,
    Error,
    Conflict,
}

/// User-facing message queued for the view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    Error(String),
    /// A write was rejected because the note changed elsewhere.
    Conflict(NoteId),
    /// The credential was rejected; the user has to log in again.
    AuthExpired,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Error(message) => f.write_str(message),
            Notice::Conflict(_) => {
                f.write_str("This note was changed elsewhere. Reload it before saving again.")
            }
            Notice::AuthExpired => f.write_str("Session expired. Please log in again."),
        }
    }
}

/// The live edit fields of the open note.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EditBuffer {
    pub title: String,
    pub body: String,
    pub tags: Tags,
}

impl From<&Snapshot> for EditBuffer {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            title: snapshot.title.clone(),
            body: snapshot.body.clone(),
            tags: snapshot.tags.clone(),
        }
    }
}

/// Commands emitted by the view layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SelectNote(NoteId),
    CloseNote,
    CreateNote,
    DeleteNote(NoteId),
    /// Replace the live fields with the view's copy and save if dirty.
    CommitEdit(EditBuffer),
    EditTitle(String),
    EditBody(String),
    AddTag(String),
    RemoveTag(String),
    Reload,
}

/// Confirmation prompt owned by the view (e.g. "Delete this note?").
pub trait ConfirmGate {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F: Fn(&str) -> bool> ConfirmGate for F {
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// Per-session state, created once at login and reset at logout.
pub(crate) struct SessionContext {
    pub(crate) store: NoteStore,
    pub(crate) active_note_id: Option<NoteId>,
    /// Bumped on every note switch; async results tagged with an older value are void.
    pub(crate) generation: u64,
    pub(crate) status: SessionStatus,
    /// Fields as of the last successful load or save of the active note.
    pub(crate) last_saved: Option<Snapshot>,
    pub(crate) buffer: EditBuffer,
    pub(crate) authenticated: bool,
    pub(crate) server_version: Option<String>,
    notices: Vec<Notice>,
    prefs: Rc<dyn KeyValueStore>,
}

pub(crate) type SharedContext = Rc<RefCell<SessionContext>>;

impl SessionContext {
    pub(crate) fn new(prefs: Rc<dyn KeyValueStore>) -> Self {
        Self {
            store: NoteStore::new(),
            active_note_id: None,
            generation: 0,
            status: SessionStatus::Empty,
            last_saved: None,
            buffer: EditBuffer::default(),
            authenticated: false,
            server_version: None,
            notices: Vec::new(),
            prefs,
        }
    }

    /// Moves the session to `next` under a fresh generation and clears the
    /// visible fields. Returns the new generation.
    pub(crate) fn begin_switch(&mut self, next: Option<NoteId>) -> u64 {
        self.generation = self.generation.saturating_add(1);
        self.active_note_id = next;
        self.last_saved = None;
        self.buffer = EditBuffer::default();
        self.status = SessionStatus::Empty;
        self.generation
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Shows a loaded note: fills the fields and takes it as the saved baseline.
    pub(crate) fn show(&mut self, snapshot: Snapshot) {
        self.buffer = EditBuffer::from(&snapshot);
        self.last_saved = Some(snapshot);
        self.status = SessionStatus::Ready;
    }

    /// Candidate snapshot of the live fields plus the baseline to diff it
    /// against. `None` if no note is open or its content never loaded.
    pub(crate) fn capture(&self) -> Option<(Snapshot, Snapshot)> {
        let id = self.active_note_id?;
        let baseline = self.last_saved.clone()?;
        let version = self.store.find(id)?.version.clone();

        let candidate = Snapshot {
            id,
            title: self.buffer.title.clone(),
            body: self.buffer.body.clone(),
            tags: self.buffer.tags.clone(),
            version,
        };
        Some((candidate, baseline))
    }

    /// Whether the live fields differ from the saved baseline.
    pub(crate) fn is_dirty(&self) -> bool {
        self.capture()
            .map(|(candidate, baseline)| crate::cache::is_dirty(&candidate, &baseline))
            .unwrap_or(false)
    }

    /// Sets a save annotation. Ignored while nothing is shown (empty or
    /// loading), so a late save for a note the user left cannot mask that.
    pub(crate) fn annotate(&mut self, status: SessionStatus) {
        match self.status {
            SessionStatus::Empty | SessionStatus::Loading => {}
            _ => self.status = status,
        }
    }

    pub(crate) fn push_notice(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    pub(crate) fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Forgets the persisted credential and asks for a new login.
    pub(crate) fn expire_auth(&mut self) {
        if self.authenticated {
            log::warn!("session expired; credential cleared");
        }
        self.authenticated = false;
        self.prefs.remove_item(TOKEN_KEY);
        if !self.notices.contains(&Notice::AuthExpired) {
            self.notices.push(Notice::AuthExpired);
        }
    }

    /// Routes a failed request: 403 expires the session, anything else
    /// becomes an error notice.
    pub(crate) fn record_failure(&mut self, context: &str, err: &ApiError) {
        if err.is_unauthorized() {
            self.expire_auth();
        } else {
            self.push_notice(Notice::Error(format!("{context}: {err}")));
        }
    }

    /// Back to the state of a fresh session. Used at logout.
    pub(crate) fn reset(&mut self) {
        self.store.clear();
        self.begin_switch(None);
        self.authenticated = false;
        self.server_version = None;
        self.notices.clear();
    }
}
