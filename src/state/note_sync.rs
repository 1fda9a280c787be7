use crate::api::{ApiError, NoteService, UpdateNoteRequest};
use crate::cache::{is_dirty, NoteUpdate, Snapshot};
use crate::models::{NoteId, Version};
use crate::state::{EditBuffer, Notice, SessionStatus, SharedContext};
use crate::util::now_secs;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing changed since the last confirmed save; no request was sent.
    NoOp,
    /// The server accepted the write and handed out this version.
    Saved(Version),
}

/// Why a save attempt ended without persisting. Every variant is terminal
/// for that attempt; nothing is retried automatically.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SyncError {
    #[error("note {0} is not cached")]
    UnknownNote(NoteId),
    #[error("note {0} was changed elsewhere")]
    Conflict(NoteId),
    #[error("session expired")]
    AuthExpired,
    #[error(transparent)]
    Transport(#[from] ApiError),
}

/// A write this client got confirmed: `base` is the version it was sent
/// with, `saved` what the server now holds.
#[derive(Clone, Debug)]
struct ConfirmedWrite {
    base: Version,
    saved: Snapshot,
}

/// Owns the save protocol: dirty check, versioned PUT, conflict detection and
/// status reporting.
///
/// Saves are serialized. A save captured before an earlier save of the same
/// note returned still carries the old version; it is rebased onto the
/// confirmed write instead of conflicting with it.
#[derive(Clone)]
pub struct SyncEngine {
    service: Rc<dyn NoteService>,
    ctx: SharedContext,
    writes: Rc<Mutex<()>>,
    confirmed: Rc<RefCell<HashMap<NoteId, ConfirmedWrite>>>,
    /// Latest dirty candidate per note that has been dispatched and not yet
    /// settled.
    pending: Rc<RefCell<HashMap<NoteId, Snapshot>>>,
}

impl SyncEngine {
    pub(crate) fn new(service: Rc<dyn NoteService>, ctx: SharedContext) -> Self {
        Self {
            service,
            ctx,
            writes: Rc::new(Mutex::new(())),
            confirmed: Rc::new(RefCell::new(HashMap::new())),
            pending: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Records a save about to be dispatched so that reopening the note
    /// before it settles shows what is being written.
    pub(crate) fn track(&self, candidate: &Snapshot, baseline: &Snapshot) {
        if is_dirty(candidate, baseline) {
            self.pending
                .borrow_mut()
                .insert(candidate.id, candidate.clone());
        }
    }

    /// Content of an unsettled save of `id`, if there is one.
    pub(crate) fn pending(&self, id: NoteId) -> Option<Snapshot> {
        self.pending.borrow().get(&id).cloned()
    }

    fn settle(&self, candidate: &Snapshot) {
        let mut pending = self.pending.borrow_mut();
        if pending.get(&candidate.id) == Some(candidate) {
            pending.remove(&candidate.id);
        }
    }

    /// Waits for in-flight saves and blocks new ones while the guard lives.
    pub(crate) async fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().await
    }

    pub(crate) fn forget(&self, id: NoteId) {
        self.confirmed.borrow_mut().remove(&id);
    }

    pub(crate) fn forget_all(&self) {
        self.confirmed.borrow_mut().clear();
        self.pending.borrow_mut().clear();
    }

    fn rebase(&self, candidate: &mut Snapshot, baseline: &mut Snapshot) {
        let confirmed = self.confirmed.borrow();
        let Some(write) = confirmed.get(&candidate.id) else {
            return;
        };

        if candidate.version == write.base && write.saved.version != write.base {
            log::debug!(
                "note {}: rebasing save from {} onto {}",
                candidate.id,
                candidate.version,
                write.saved.version
            );
            candidate.version = write.saved.version.clone();
            *baseline = write.saved.clone();
        }
    }

    /// Saves `candidate` if it differs from `baseline`.
    ///
    /// `baseline` must be the saved state captured together with `candidate`;
    /// the live one may already belong to another note.
    pub async fn save(
        &self,
        candidate: Snapshot,
        baseline: Snapshot,
    ) -> Result<SaveOutcome, SyncError> {
        let _guard = self.writes.lock().await;
        let submitted = candidate.clone();
        let result = self.save_locked(candidate, baseline).await;
        self.settle(&submitted);
        result
    }

    async fn save_locked(
        &self,
        mut candidate: Snapshot,
        mut baseline: Snapshot,
    ) -> Result<SaveOutcome, SyncError> {
        let id = candidate.id;

        if !self.ctx.borrow().store.contains(id) {
            return Err(SyncError::UnknownNote(id));
        }

        // Clean against what the user saw: nothing to write, whatever landed since.
        if !is_dirty(&candidate, &baseline) {
            log::debug!("note {id}: nothing to save");
            return Ok(SaveOutcome::NoOp);
        }

        self.rebase(&mut candidate, &mut baseline);

        if !is_dirty(&candidate, &baseline) {
            log::debug!("note {id}: already saved by an earlier write");
            return Ok(SaveOutcome::NoOp);
        }

        self.ctx.borrow_mut().annotate(SessionStatus::Saving);

        let req = UpdateNoteRequest {
            version: candidate.version.clone(),
            title: candidate.title.clone(),
            body: candidate.body.clone(),
            tags: candidate.tags.clone(),
        };

        match self.service.update_note(id, &req).await {
            Ok(version) => {
                self.confirm(candidate, version.clone());
                Ok(SaveOutcome::Saved(version))
            }
            Err(e) if e.is_conflict() => {
                log::warn!("note {id}: save rejected, version {} is stale", req.version);
                let mut ctx = self.ctx.borrow_mut();
                ctx.annotate(SessionStatus::Conflict);
                ctx.push_notice(Notice::Conflict(id));
                Err(SyncError::Conflict(id))
            }
            Err(e) if e.is_unauthorized() => {
                let mut ctx = self.ctx.borrow_mut();
                ctx.annotate(SessionStatus::Error);
                ctx.expire_auth();
                Err(SyncError::AuthExpired)
            }
            Err(e) => {
                log::warn!("note {id}: save failed: {e}");
                let mut ctx = self.ctx.borrow_mut();
                ctx.annotate(SessionStatus::Error);
                ctx.record_failure("Save failed", &e);
                Err(SyncError::Transport(e))
            }
        }
    }

    fn confirm(&self, candidate: Snapshot, version: Version) {
        let id = candidate.id;
        let base = candidate.version.clone();
        let saved = Snapshot {
            version: version.clone(),
            ..candidate
        };

        let mut ctx = self.ctx.borrow_mut();
        ctx.store.apply_update(
            id,
            NoteUpdate {
                title: Some(saved.title.clone()),
                body: Some(saved.body.clone()),
                tags: Some(saved.tags.clone()),
                version,
                updated_at: now_secs(),
            },
        );

        // Only the active note's baseline may move. While it is still loading
        // the fetch decides what is shown.
        if ctx.active_note_id == Some(id) && ctx.status != SessionStatus::Loading {
            let untouched = match &ctx.last_saved {
                Some(prev) => ctx.buffer == EditBuffer::from(prev),
                None => false,
            };
            if untouched {
                // Reopened before this save landed: show what was saved.
                ctx.buffer = EditBuffer::from(&saved);
            }
            ctx.last_saved = Some(saved.clone());
        }
        ctx.annotate(SessionStatus::Saved);
        drop(ctx);

        log::debug!("note {id}: saved as {}", saved.version);
        self.confirmed
            .borrow_mut()
            .insert(id, ConfirmedWrite { base, saved });
    }
}
