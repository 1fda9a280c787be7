use crate::models::{Note, NoteId, Tags, Version};

/// Fields returned by a successful write or fetch, merged into a cached note.
#[derive(Clone, Debug)]
pub struct NoteUpdate {
    pub title: Option<String>,
    pub body: Option<String>,
    pub tags: Option<Tags>,
    pub version: Version,
    pub updated_at: i64,
}

impl From<Note> for NoteUpdate {
    fn from(note: Note) -> Self {
        Self {
            title: Some(note.title),
            body: note.body,
            tags: Some(note.tags),
            version: note.version,
            updated_at: note.updated_at,
        }
    }
}

/// In-memory cache of note summaries and bodies, in server list order.
///
/// All mutation goes through the methods below so that dirty checks and
/// conflict handling always read a consistent entry.
#[derive(Clone, Debug, Default)]
pub struct NoteStore {
    notes: Vec<Note>,
}

impl NoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole cache. Nothing from the previous list survives.
    pub fn replace_all(&mut self, notes: Vec<Note>) {
        self.notes = notes;
    }

    /// Inserts a locally synthesized note, or replaces an entry with the same id.
    pub fn upsert_summary(&mut self, note: Note) {
        match self.notes.iter_mut().find(|n| n.id == note.id) {
            Some(existing) => *existing = note,
            None => self.notes.insert(0, note),
        }
    }

    pub fn find(&self, id: NoteId) -> Option<&Note> {
        self.notes.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, id: NoteId) -> bool {
        self.find(id).is_some()
    }

    /// Merges `update` into the cached note. Returns `false` without touching
    /// anything if the note is gone (e.g. deleted in the meantime).
    pub fn apply_update(&mut self, id: NoteId, update: NoteUpdate) -> bool {
        let Some(note) = self.notes.iter_mut().find(|n| n.id == id) else {
            return false;
        };

        if let Some(title) = update.title {
            note.title = title;
        }
        if let Some(body) = update.body {
            note.size = body.len() as u64;
            note.body = Some(body);
        }
        if let Some(tags) = update.tags {
            note.tags = tags;
        }
        note.version = update.version;
        note.updated_at = update.updated_at;
        true
    }

    pub fn remove(&mut self, id: NoteId) -> Option<Note> {
        let idx = self.notes.iter().position(|n| n.id == id)?;
        Some(self.notes.remove(idx))
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: NoteId, title: &str, version: &str) -> Note {
        Note {
            id,
            title: title.to_string(),
            body: None,
            tags: Tags::default(),
            version: Version::from(version),
            updated_at: 0,
            size: 0,
        }
    }

    #[test]
    fn test_replace_all_drops_previous_entries() {
        let mut store = NoteStore::new();
        store.replace_all(vec![summary(1, "a", "v1"), summary(2, "b", "v1")]);
        store.replace_all(vec![summary(3, "c", "v1")]);
        assert!(store.find(1).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_summary_prepends_new_note() {
        let mut store = NoteStore::new();
        store.replace_all(vec![summary(1, "a", "v1")]);
        store.upsert_summary(Note::created(9, Version::from("v1"), 10));
        assert_eq!(store.notes()[0].id, 9);
        assert!(store.find(9).map(Note::is_loaded).unwrap_or(false));
    }

    #[test]
    fn test_apply_update_merges_fields() {
        let mut store = NoteStore::new();
        store.replace_all(vec![summary(1, "a", "v1")]);

        let applied = store.apply_update(
            1,
            NoteUpdate {
                title: None,
                body: Some("hello".to_string()),
                tags: Some(Tags::new(["x"])),
                version: Version::from("v2"),
                updated_at: 42,
            },
        );
        assert!(applied);

        let note = store.find(1).expect("note should still be cached");
        assert_eq!(note.title, "a");
        assert_eq!(note.body.as_deref(), Some("hello"));
        assert_eq!(note.size, 5);
        assert_eq!(note.version, Version::from("v2"));
        assert_eq!(note.updated_at, 42);
    }

    #[test]
    fn test_apply_update_on_missing_note_is_noop() {
        let mut store = NoteStore::new();
        store.replace_all(vec![summary(1, "a", "v1")]);
        let applied = store.apply_update(
            2,
            NoteUpdate {
                title: Some("x".to_string()),
                body: None,
                tags: None,
                version: Version::from("v5"),
                updated_at: 1,
            },
        );
        assert!(!applied);
        assert_eq!(store.len(), 1);
        assert_eq!(store.find(1).map(|n| n.title.as_str()), Some("a"));
    }

    #[test]
    fn test_remove() {
        let mut store = NoteStore::new();
        store.replace_all(vec![summary(1, "a", "v1"), summary(2, "b", "v1")]);
        assert_eq!(store.remove(1).map(|n| n.id), Some(1));
        assert!(store.remove(1).is_none());
        assert_eq!(store.len(), 1);
    }
}
