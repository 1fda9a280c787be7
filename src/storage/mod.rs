use crate::models::NoteId;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;

pub const TOKEN_KEY: &str = "scratch_token";
pub const ACTIVE_NOTE_KEY: &str = "scratch_active_note";

/// Client-local key-value persistence (credential, last active note, layout).
///
/// The storage technology belongs to the embedding application; the session
/// only reads and writes opaque strings.
pub trait KeyValueStore {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str);
    fn remove_item(&self, key: &str);
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RefCell<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.borrow().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) {
        self.items
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    fn remove_item(&self, key: &str) {
        self.items.borrow_mut().remove(key);
    }
}

pub(crate) fn load_json_from_storage<T: for<'de> Deserialize<'de>>(
    storage: &dyn KeyValueStore,
    key: &str,
) -> Option<T> {
    let json = storage.get_item(key)?;
    serde_json::from_str(&json).ok()
}

pub(crate) fn save_json_to_storage<T: Serialize>(storage: &dyn KeyValueStore, key: &str, value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => storage.set_item(key, &json),
        Err(e) => log::warn!("failed to encode {key}: {e}"),
    }
}

pub(crate) fn load_token(storage: &dyn KeyValueStore) -> Option<String> {
    storage
        .get_item(TOKEN_KEY)
        .filter(|t| !t.trim().is_empty())
}

pub(crate) fn load_active_note(storage: &dyn KeyValueStore) -> Option<NoteId> {
    load_json_from_storage::<NoteId>(storage, ACTIVE_NOTE_KEY).filter(|id| *id > 0)
}

pub(crate) fn save_active_note(storage: &dyn KeyValueStore, id: NoteId) {
    save_json_to_storage(storage, ACTIVE_NOTE_KEY, &id);
}
