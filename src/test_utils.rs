//! In-memory stand-in for the remote note service.
//!
//! Behaves like the real server where the session cares: versions move on
//! every write, stale versions get a 409, and a rejected credential gets a
//! 403 on every call. Fetches can be held back per note to force completion
//! order.

use crate::api::{
    ApiError, ApiErrorKind, ApiResult, CreateNoteRequest, CreatedNote, NoteService,
    UpdateNoteRequest,
};
use crate::models::{Note, NoteId, Tags, Version};
use async_trait::async_trait;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tokio::sync::Notify;

pub(crate) const SERVER_VERSION: &str = "1.0.0";
pub(crate) const GOOD_TOKEN: &str = "secret";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    Verify,
    List,
    Fetch,
    Create,
    Update,
    Delete,
}

struct ServerNote {
    note: Note,
    revision: u64,
}

impl ServerNote {
    fn bump(&mut self, now: i64) {
        self.revision += 1;
        self.note.version = Version::from(format!("v{}", self.revision).as_str());
        self.note.updated_at = now;
    }
}

pub(crate) struct FakeNoteService {
    notes: RefCell<BTreeMap<NoteId, ServerNote>>,
    next_id: Cell<NoteId>,
    clock: Cell<i64>,
    token: RefCell<Option<String>>,
    revoked: Cell<bool>,
    gates: RefCell<HashMap<NoteId, Rc<Notify>>>,
    failures: RefCell<HashMap<Op, ApiError>>,
    calls: RefCell<HashMap<Op, usize>>,
}

impl FakeNoteService {
    /// Starts with the good credential installed, as after a login.
    pub(crate) fn new() -> Self {
        Self {
            notes: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
            clock: Cell::new(0),
            token: RefCell::new(Some(GOOD_TOKEN.to_string())),
            revoked: Cell::new(false),
            gates: RefCell::new(HashMap::new()),
            failures: RefCell::new(HashMap::new()),
            calls: RefCell::new(HashMap::new()),
        }
    }

    /// The server stops accepting the good credential.
    pub(crate) fn revoke(&self) {
        self.revoked.set(true);
    }

    fn authorized(&self) -> bool {
        !self.revoked.get() && self.token.borrow().as_deref() == Some(GOOD_TOKEN)
    }

    fn tick(&self) -> i64 {
        self.clock.set(self.clock.get() + 1);
        1_700_000_000 + self.clock.get()
    }

    /// Adds a note to the server and returns it in full.
    pub(crate) fn seed(&self, title: &str, body: &str, tags: &[&str]) -> Note {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);

        let mut entry = ServerNote {
            note: Note {
                id,
                title: title.to_string(),
                body: Some(body.to_string()),
                tags: Tags::new(tags.iter().copied()),
                version: Version::from("v0"),
                updated_at: 0,
                size: body.len() as u64,
            },
            revision: 0,
        };
        entry.bump(self.tick());
        let note = entry.note.clone();
        self.notes.borrow_mut().insert(id, entry);
        note
    }

    /// Simulates another client writing the note.
    pub(crate) fn touch_elsewhere(&self, id: NoteId, body: &str) {
        let now = self.tick();
        if let Some(entry) = self.notes.borrow_mut().get_mut(&id) {
            entry.note.body = Some(body.to_string());
            entry.note.size = body.len() as u64;
            entry.bump(now);
        }
    }

    pub(crate) fn server_note(&self, id: NoteId) -> Option<Note> {
        self.notes.borrow().get(&id).map(|e| e.note.clone())
    }

    /// Holds fetches of `id` until the returned handle is notified.
    pub(crate) fn gate_fetch(&self, id: NoteId) -> Rc<Notify> {
        let gate = Rc::new(Notify::new());
        self.gates.borrow_mut().insert(id, gate.clone());
        gate
    }

    pub(crate) fn fail_next(&self, op: Op, err: ApiError) {
        self.failures.borrow_mut().insert(op, err);
    }

    pub(crate) fn fail_next_update(&self, err: ApiError) {
        self.fail_next(Op::Update, err);
    }

    pub(crate) fn calls(&self, op: Op) -> usize {
        self.calls.borrow().get(&op).copied().unwrap_or(0)
    }

    pub(crate) fn update_calls(&self) -> usize {
        self.calls(Op::Update)
    }

    /// Counts the call, yields once like a real request would, and returns
    /// the injected failure if there is one. Only verify gets past a
    /// rejected credential.
    async fn enter(&self, op: Op) -> ApiResult<()> {
        *self.calls.borrow_mut().entry(op).or_insert(0) += 1;
        tokio::task::yield_now().await;
        if let Some(err) = self.failures.borrow_mut().remove(&op) {
            return Err(err);
        }
        if op == Op::Verify {
            return Ok(());
        }
        if self.token.borrow().is_none() {
            return Err(ApiError::new(ApiErrorKind::MissingToken, "No auth token"));
        }
        if !self.authorized() {
            self.token.replace(None);
            return Err(ApiError::unauthorized());
        }
        Ok(())
    }

    fn not_found() -> ApiError {
        ApiError::new(ApiErrorKind::NotFound, "Not Found")
    }

    fn conflict() -> ApiError {
        ApiError::new(ApiErrorKind::Conflict, "version mismatch")
    }
}

#[async_trait(?Send)]
impl NoteService for FakeNoteService {
    fn set_token(&self, token: Option<String>) {
        self.token.replace(token);
    }

    async fn verify(&self) -> ApiResult<String> {
        self.enter(Op::Verify).await?;
        if !self.authorized() {
            self.token.replace(None);
            return Err(ApiError::unauthorized());
        }
        Ok(SERVER_VERSION.to_string())
    }

    async fn list_notes(&self) -> ApiResult<Vec<Note>> {
        self.enter(Op::List).await?;
        Ok(self
            .notes
            .borrow()
            .values()
            .map(|e| Note {
                body: None,
                ..e.note.clone()
            })
            .collect())
    }

    async fn fetch_note(&self, id: NoteId) -> ApiResult<Note> {
        self.enter(Op::Fetch).await?;
        let gate = self.gates.borrow_mut().remove(&id);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.server_note(id).ok_or_else(Self::not_found)
    }

    async fn create_note(&self, req: &CreateNoteRequest) -> ApiResult<CreatedNote> {
        self.enter(Op::Create).await?;
        let tags: Vec<&str> = req.tags.iter().collect();
        let note = self.seed(&req.title, &req.body, &tags);
        Ok(CreatedNote {
            id: note.id,
            version: note.version,
        })
    }

    async fn update_note(&self, id: NoteId, req: &UpdateNoteRequest) -> ApiResult<Version> {
        self.enter(Op::Update).await?;
        let now = self.tick();
        let mut notes = self.notes.borrow_mut();
        let entry = notes.get_mut(&id).ok_or_else(Self::not_found)?;
        if entry.note.version != req.version {
            return Err(Self::conflict());
        }

        entry.note.title = req.title.clone();
        entry.note.body = Some(req.body.clone());
        entry.note.size = req.body.len() as u64;
        entry.note.tags = req.tags.clone();
        entry.bump(now);
        Ok(entry.note.version.clone())
    }

    async fn delete_note(&self, id: NoteId, version: &Version) -> ApiResult<()> {
        self.enter(Op::Delete).await?;
        let mut notes = self.notes.borrow_mut();
        let entry = notes.get(&id).ok_or_else(Self::not_found)?;
        if &entry.note.version != version {
            return Err(Self::conflict());
        }
        notes.remove(&id);
        Ok(())
    }
}
