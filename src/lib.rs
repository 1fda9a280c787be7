//! Client-side note session for a scratch-notes server.
//!
//! One note is open at a time. Switching notes saves the previous one in the
//! background, loads the next one without blocking, and never lets a late
//! response paint over the note the user is looking at. Saves carry the
//! note's version; the server rejects stale ones with a conflict instead of
//! losing a concurrent write.
//!
//! Everything runs on one thread. [`SessionController`] spawns its
//! background work with `tokio::task::spawn_local`, so drive it from inside
//! a [`tokio::task::LocalSet`]:
//!
//! ```no_run
//! use scratch_app::{ApiClient, EnvConfig, MemoryStore, SessionController};
//! use std::rc::Rc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Rc::new(ApiClient::from_config(&EnvConfig::new())?);
//! let prefs = Rc::new(MemoryStore::new());
//! let session = SessionController::new(client, prefs, Rc::new(|_: &str| true));
//!
//! tokio::task::LocalSet::new()
//!     .run_until(async {
//!         session.login("token").await?;
//!         session.load_notes().await?;
//!         Ok::<_, scratch_app::SessionError>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod models;
pub mod state;
pub mod storage;
pub mod util;

#[cfg(test)]
mod test_utils;

pub use api::{ApiClient, ApiError, ApiErrorKind, ApiResult, NoteService};
pub use config::EnvConfig;
pub use models::{Note, NoteId, Tags, Version};
pub use state::{
    Command, ConfirmGate, DeleteOutcome, EditBuffer, LoadOutcome, Notice, SaveOutcome, Selection,
    SessionController, SessionError, SessionStatus, SyncEngine, SyncError,
};
pub use storage::{KeyValueStore, MemoryStore};
