use crate::models::{Note, NoteId, Tags, Version};

/// Immutable capture of a note's editable fields at one instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub id: NoteId,
    pub title: String,
    pub body: String,
    pub tags: Tags,
    pub version: Version,
}

impl Snapshot {
    /// Snapshot of a cached note. `None` if only its summary is known.
    pub fn of(note: &Note) -> Option<Self> {
        Some(Self {
            id: note.id,
            title: note.title.clone(),
            body: note.body.clone()?,
            tags: note.tags.clone(),
            version: note.version.clone(),
        })
    }
}

/// Whether `candidate` carries edits that `last_saved` does not.
///
/// Title and body compare exactly. Tags compare as sets: cardinality first,
/// then position by position after sorting both sides.
pub fn is_dirty(candidate: &Snapshot, last_saved: &Snapshot) -> bool {
    if candidate.title != last_saved.title || candidate.body != last_saved.body {
        return true;
    }

    if candidate.tags.len() != last_saved.tags.len() {
        return true;
    }

    candidate
        .tags
        .sorted()
        .into_iter()
        .zip(last_saved.tags.sorted())
        .any(|(a, b)| a != b)
}
