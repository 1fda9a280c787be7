use crate::api::{ApiError, ApiErrorKind, ApiResult, CreateNoteRequest, NoteService};
use crate::cache::{NoteStore, Snapshot};
use crate::models::{Note, NoteId};
use crate::state::{
    Command, ConfirmGate, EditBuffer, Notice, SaveOutcome, SessionContext, SessionStatus,
    SharedContext, SyncEngine, SyncError,
};
use crate::storage::{
    load_active_note, load_token, save_active_note, KeyValueStore, ACTIVE_NOTE_KEY, TOKEN_KEY,
};
use crate::util::now_secs;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tokio::task::{spawn_local, JoinHandle};

const DELETE_PROMPT: &str = "Delete this note?";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("note {0} is not in the list")]
    UnknownNote(NoteId),
    #[error("no note is open")]
    NoActiveNote,
    #[error("another create or delete is still running")]
    Busy,
    #[error("note {0} was changed elsewhere")]
    Conflict(NoteId),
}

/// Result of a note switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    /// The note was already active.
    Unchanged,
    /// Content was cached and is shown.
    Ready,
    /// A full fetch is in flight.
    Loading,
}

/// How a full-note fetch ended.
#[derive(Clone, Debug)]
pub enum LoadOutcome {
    Loaded,
    /// Superseded by a newer switch; nothing was applied.
    Stale,
    Failed(ApiError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The user declined the confirmation prompt.
    Declined,
}

struct InflightLoad {
    generation: u64,
    handle: JoinHandle<LoadOutcome>,
}

struct BusyGuard<'a>(&'a Cell<bool>);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Owns which note is open and orchestrates loads and saves around switches.
///
/// Must run inside a [`tokio::task::LocalSet`]: background fetches and
/// fire-and-forget saves are started with `spawn_local`.
pub struct SessionController {
    ctx: SharedContext,
    service: Rc<dyn NoteService>,
    engine: SyncEngine,
    prefs: Rc<dyn KeyValueStore>,
    confirm: Rc<dyn ConfirmGate>,
    inflight: RefCell<Option<InflightLoad>>,
    pending_saves: RefCell<Vec<JoinHandle<Result<SaveOutcome, SyncError>>>>,
    busy: Cell<bool>,
}

impl SessionController {
    pub fn new(
        service: Rc<dyn NoteService>,
        prefs: Rc<dyn KeyValueStore>,
        confirm: Rc<dyn ConfirmGate>,
    ) -> Self {
        let ctx: SharedContext = Rc::new(RefCell::new(SessionContext::new(prefs.clone())));
        let engine = SyncEngine::new(service.clone(), ctx.clone());
        Self {
            ctx,
            service,
            engine,
            prefs,
            confirm,
            inflight: RefCell::new(None),
            pending_saves: RefCell::new(Vec::new()),
            busy: Cell::new(false),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.ctx.borrow().status
    }

    pub fn active_note_id(&self) -> Option<NoteId> {
        self.ctx.borrow().active_note_id
    }

    pub fn generation(&self) -> u64 {
        self.ctx.borrow().generation
    }

    pub fn buffer(&self) -> EditBuffer {
        self.ctx.borrow().buffer.clone()
    }

    pub fn last_saved(&self) -> Option<Snapshot> {
        self.ctx.borrow().last_saved.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.ctx.borrow().is_dirty()
    }

    pub fn is_authenticated(&self) -> bool {
        self.ctx.borrow().authenticated
    }

    pub fn server_version(&self) -> Option<String> {
        self.ctx.borrow().server_version.clone()
    }

    pub fn with_store<R>(&self, f: impl FnOnce(&NoteStore) -> R) -> R {
        f(&self.ctx.borrow().store)
    }

    pub fn find_note(&self, id: NoteId) -> Option<Note> {
        self.ctx.borrow().store.find(id).cloned()
    }

    pub fn take_notices(&self) -> Vec<Notice> {
        self.ctx.borrow_mut().take_notices()
    }

    // --- authentication -------------------------------------------------

    /// Verifies `token` and, if the server accepts it, persists it.
    /// Returns the server build version.
    pub async fn login(&self, token: &str) -> Result<String, SessionError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ApiError::new(ApiErrorKind::MissingToken, "No auth token").into());
        }
        let version = self.verify_token(token).await?;
        self.prefs.set_item(TOKEN_KEY, token);
        log::info!("logged in (server {version})");
        Ok(version)
    }

    /// Re-verifies the persisted credential. `Ok(None)` if there is none.
    pub async fn restore(&self) -> Result<Option<String>, SessionError> {
        let Some(token) = load_token(&*self.prefs) else {
            return Ok(None);
        };
        Ok(Some(self.verify_token(&token).await?))
    }

    async fn verify_token(&self, token: &str) -> Result<String, SessionError> {
        self.service.set_token(Some(token.to_string()));
        match self.service.verify().await {
            Ok(version) => {
                let mut ctx = self.ctx.borrow_mut();
                ctx.authenticated = true;
                ctx.server_version = Some(version.clone());
                Ok(version)
            }
            Err(e) => {
                self.service.set_token(None);
                if e.is_unauthorized() {
                    self.prefs.remove_item(TOKEN_KEY);
                }
                log::warn!("verify failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Ends the session: saves the open note, waits for every outstanding
    /// write, then forgets the credential and all cached state.
    pub async fn logout(&self) {
        self.save_in_background();
        self.cancel_inflight();
        self.flush().await;

        self.service.set_token(None);
        self.prefs.remove_item(TOKEN_KEY);
        self.prefs.remove_item(ACTIVE_NOTE_KEY);
        self.engine.forget_all();
        self.ctx.borrow_mut().reset();
        log::info!("logged out");
    }

    // --- note list ------------------------------------------------------

    /// Fetches the note list, then reopens the last active note if it is
    /// still listed. Returns the number of notes.
    pub async fn load_notes(&self) -> Result<usize, SessionError> {
        let notes = self
            .service
            .list_notes()
            .await
            .map_err(|e| self.fail("Failed to load notes", e))?;
        let count = notes.len();
        self.ctx.borrow_mut().store.replace_all(notes);

        if self.active_note_id().is_none() {
            if let Some(saved) = load_active_note(&*self.prefs) {
                if self.ctx.borrow().store.contains(saved) {
                    self.select_note(saved)?;
                } else {
                    self.prefs.remove_item(ACTIVE_NOTE_KEY);
                }
            }
        }
        Ok(count)
    }

    // --- switching ------------------------------------------------------

    /// Opens `id`. The previous note is saved in the background; the switch
    /// itself never waits on the network.
    pub fn select_note(&self, id: NoteId) -> Result<Selection, SessionError> {
        if self.is_open(id) {
            return Ok(Selection::Unchanged);
        }

        let cached = {
            let ctx = self.ctx.borrow();
            let note = ctx.store.find(id).ok_or(SessionError::UnknownNote(id))?;
            Snapshot::of(note)
        };

        self.save_in_background();
        self.cancel_inflight();

        let generation = self.ctx.borrow_mut().begin_switch(Some(id));
        save_active_note(&*self.prefs, id);

        match cached {
            Some(snapshot) => {
                let pending = self.engine.pending(id);
                let mut ctx = self.ctx.borrow_mut();
                ctx.show(snapshot);
                if let Some(pending) = pending {
                    // The cache still holds the pre-save content.
                    ctx.buffer = EditBuffer::from(&pending);
                }
                drop(ctx);
                log::debug!("note {id}: shown from cache (generation {generation})");
                Ok(Selection::Ready)
            }
            None => {
                self.ctx.borrow_mut().status = SessionStatus::Loading;
                self.spawn_fetch(id, generation);
                Ok(Selection::Loading)
            }
        }
    }

    /// Active and either shown or loading. A note whose load failed is not
    /// open, so selecting it again retries the fetch.
    fn is_open(&self, id: NoteId) -> bool {
        let ctx = self.ctx.borrow();
        ctx.active_note_id == Some(id)
            && (ctx.last_saved.is_some() || ctx.status == SessionStatus::Loading)
    }

    /// Saves the open note in the background and closes it.
    pub fn close_note(&self) {
        self.save_in_background();
        self.cancel_inflight();
        self.ctx.borrow_mut().begin_switch(None);
        self.prefs.remove_item(ACTIVE_NOTE_KEY);
    }

    /// Refetches the open note, dropping local edits. The way out of a conflict.
    pub fn reload(&self) -> Result<Selection, SessionError> {
        let id = self.active_note_id().ok_or(SessionError::NoActiveNote)?;
        self.cancel_inflight();

        let generation = {
            let mut ctx = self.ctx.borrow_mut();
            let generation = ctx.begin_switch(Some(id));
            ctx.status = SessionStatus::Loading;
            generation
        };
        self.engine.forget(id);
        self.spawn_fetch(id, generation);
        Ok(Selection::Loading)
    }

    fn spawn_fetch(&self, id: NoteId, generation: u64) {
        log::debug!("note {id}: fetching (generation {generation})");
        let service = self.service.clone();
        let ctx = self.ctx.clone();
        let handle = spawn_local(async move {
            let result = service.fetch_note(id).await;
            apply_fetch(&ctx, id, generation, result)
        });
        *self.inflight.borrow_mut() = Some(InflightLoad { generation, handle });
    }

    /// Aborts the in-flight fetch, if any. A read has no persistence side
    /// effects, so dropping it is always safe.
    fn cancel_inflight(&self) {
        if let Some(load) = self.inflight.borrow_mut().take() {
            log::debug!("aborting fetch of generation {}", load.generation);
            load.handle.abort();
        }
    }

    /// Waits for the current fetch. `None` if nothing was loading or the
    /// fetch was cancelled.
    pub async fn settle(&self) -> Option<LoadOutcome> {
        let load = self.inflight.borrow_mut().take()?;
        load.handle.await.ok()
    }

    // --- editing --------------------------------------------------------

    fn edit(&self, f: impl FnOnce(&mut EditBuffer)) -> bool {
        let mut ctx = self.ctx.borrow_mut();
        if ctx.active_note_id.is_none() || ctx.last_saved.is_none() {
            return false;
        }
        f(&mut ctx.buffer);
        true
    }

    /// Ignored unless an open note has its content loaded.
    pub fn set_title(&self, title: &str) -> bool {
        self.edit(|b| b.title = title.to_string())
    }

    pub fn set_body(&self, body: &str) -> bool {
        self.edit(|b| b.body = body.to_string())
    }

    /// Saves the open note if the live fields are dirty.
    pub async fn commit_edit(&self) -> Result<SaveOutcome, SyncError> {
        let captured = self.ctx.borrow().capture();
        match captured {
            Some((candidate, baseline)) => self.engine.save(candidate, baseline).await,
            None => Ok(SaveOutcome::NoOp),
        }
    }

    pub async fn add_tag(&self, raw: &str) -> Result<SaveOutcome, SyncError> {
        let mut added = None;
        self.edit(|b| added = b.tags.insert(raw));
        if added.is_none() {
            return Ok(SaveOutcome::NoOp);
        }
        self.commit_edit().await
    }

    pub async fn remove_tag(&self, tag: &str) -> Result<SaveOutcome, SyncError> {
        let mut removed = false;
        self.edit(|b| removed = b.tags.remove(tag));
        if !removed {
            return Ok(SaveOutcome::NoOp);
        }
        self.commit_edit().await
    }

    fn save_in_background(&self) {
        let Some((candidate, baseline)) = self.ctx.borrow().capture() else {
            return;
        };
        self.engine.track(&candidate, &baseline);
        let engine = self.engine.clone();
        let handle = spawn_local(async move { engine.save(candidate, baseline).await });

        let mut pending = self.pending_saves.borrow_mut();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Waits for every background save dispatched so far.
    pub async fn flush(&self) {
        loop {
            let pending = std::mem::take(&mut *self.pending_saves.borrow_mut());
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    log::warn!("background save did not finish: {e}");
                }
            }
        }
    }

    // --- create / delete -----------------------------------------------

    fn enter_busy(&self) -> Result<BusyGuard<'_>, SessionError> {
        if self.busy.replace(true) {
            return Err(SessionError::Busy);
        }
        Ok(BusyGuard(&self.busy))
    }

    /// Creates an empty note on the server and opens it without a fetch.
    pub async fn create_note(&self) -> Result<NoteId, SessionError> {
        let _busy = self.enter_busy()?;

        let created = self
            .service
            .create_note(&CreateNoteRequest::empty())
            .await
            .map_err(|e| self.fail("Failed to create note", e))?;

        log::info!("note {}: created", created.id);
        self.ctx
            .borrow_mut()
            .store
            .upsert_summary(Note::created(created.id, created.version, now_secs()));
        self.select_note(created.id)?;
        Ok(created.id)
    }

    /// Deletes `id` after the confirmation gate agrees. The delete carries
    /// the cached version; a stale one leaves everything as it was.
    pub async fn delete_note(&self, id: NoteId) -> Result<DeleteOutcome, SessionError> {
        let _busy = self.enter_busy()?;

        if !self.ctx.borrow().store.contains(id) {
            return Err(SessionError::UnknownNote(id));
        }
        if !self.confirm.confirm(DELETE_PROMPT) {
            return Ok(DeleteOutcome::Declined);
        }

        // Let saves of this note land first so the version below is current.
        let _writes = self.engine.lock_writes().await;
        let version = {
            let ctx = self.ctx.borrow();
            let note = ctx.store.find(id).ok_or(SessionError::UnknownNote(id))?;
            note.version.clone()
        };

        match self.service.delete_note(id, &version).await {
            Ok(()) => {
                log::info!("note {id}: deleted");
                self.engine.forget(id);
                self.ctx.borrow_mut().store.remove(id);
                if self.active_note_id() == Some(id) {
                    self.cancel_inflight();
                    self.ctx.borrow_mut().begin_switch(None);
                    self.prefs.remove_item(ACTIVE_NOTE_KEY);
                }
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) if e.is_conflict() => {
                log::warn!("note {id}: delete rejected, version {version} is stale");
                self.ctx.borrow_mut().push_notice(Notice::Conflict(id));
                Err(SessionError::Conflict(id))
            }
            Err(e) => Err(self.fail("Failed to delete note", e)),
        }
    }

    fn fail(&self, context: &str, err: ApiError) -> SessionError {
        self.ctx.borrow_mut().record_failure(context, &err);
        err.into()
    }

    // --- commands -------------------------------------------------------

    pub async fn dispatch(&self, command: Command) -> Result<(), SessionError> {
        match command {
            Command::SelectNote(id) => {
                self.select_note(id)?;
            }
            Command::CloseNote => self.close_note(),
            Command::CreateNote => {
                self.create_note().await?;
            }
            Command::DeleteNote(id) => {
                self.delete_note(id).await?;
            }
            Command::CommitEdit(buffer) => {
                if self.edit(|b| *b = buffer) {
                    self.commit_edit().await?;
                }
            }
            Command::EditTitle(title) => {
                self.set_title(&title);
            }
            Command::EditBody(body) => {
                self.set_body(&body);
            }
            Command::AddTag(raw) => {
                self.add_tag(&raw).await?;
            }
            Command::RemoveTag(tag) => {
                self.remove_tag(&tag).await?;
            }
            Command::Reload => {
                self.reload()?;
            }
        }
        Ok(())
    }
}

/// Applies a finished fetch if `generation` is still current.
pub(crate) fn apply_fetch(
    ctx: &RefCell<SessionContext>,
    id: NoteId,
    generation: u64,
    result: ApiResult<Note>,
) -> LoadOutcome {
    let mut ctx = ctx.borrow_mut();
    if !ctx.is_current(generation) || ctx.active_note_id != Some(id) {
        log::debug!("note {id}: discarding stale fetch (generation {generation})");
        return LoadOutcome::Stale;
    }

    let result = result.and_then(|note| match Snapshot::of(&note) {
        Some(snapshot) => Ok((note, snapshot)),
        None => Err(ApiError::new(ApiErrorKind::Parse, "note has no body")),
    });

    match result {
        Ok((note, snapshot)) => {
            ctx.store.apply_update(id, note.into());
            ctx.show(snapshot);
            LoadOutcome::Loaded
        }
        Err(e) => {
            // Stay on the note without content; reselecting retries.
            log::warn!("note {id}: load failed: {e}");
            ctx.status = SessionStatus::Error;
            ctx.record_failure("Failed to load note", &e);
            LoadOutcome::Failed(e)
        }
    }
}
