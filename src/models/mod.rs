use crate::util::sanitize_tag;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Server-assigned note id, stable for the lifetime of the note.
pub type NoteId = i64;

/// Opaque version token handed out by the server on every successful write.
///
/// The client only ever copies these from responses; it never builds or
/// increments one itself. Servers have been observed to send either strings or
/// integers, so both are accepted and kept in their textual form.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Version(String);

impl Version {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Version(s),
            Raw::Number(n) => Version(n.to_string()),
        })
    }
}

#[cfg(test)]
impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Version(s.to_string())
    }
}

/// Note tags: lowercase alphanumeric words, insertion order kept for display.
///
/// Equality between tag sets is order-insensitive; see
/// [`crate::cache::is_dirty`].
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Tags(Vec<String>);

impl Tags {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tags.into_iter().map(Into::into).collect())
    }

    /// Sanitizes `raw` and appends it. Returns the stored tag, or `None` when
    /// nothing survived sanitizing or the tag is already present.
    pub fn insert(&mut self, raw: &str) -> Option<String> {
        let tag = sanitize_tag(raw);
        if tag.is_empty() || self.contains(&tag) {
            return None;
        }
        self.0.push(tag.clone());
        Some(tag)
    }

    pub fn remove(&mut self, tag: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|t| t != tag);
        self.0.len() != before
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub(crate) fn sorted(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.iter().collect();
        out.sort_unstable();
        out
    }
}

impl<'de> Deserialize<'de> for Tags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // The server encodes an empty tag list as `null`.
        let tags = Option::<Vec<String>>::deserialize(deserializer)?;
        Ok(Self(tags.unwrap_or_default()))
    }
}

/// A note as cached on the client.
///
/// `body` is `None` for entries that came from a list fetch and have not been
/// fetched in full yet.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Note {
    pub id: NoteId,

    #[serde(default)]
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    #[serde(default)]
    pub tags: Tags,

    pub version: Version,

    /// Unix seconds.
    #[serde(default, alias = "updatedAt")]
    pub updated_at: i64,

    /// Byte length of the body. Display only.
    #[serde(default)]
    pub size: u64,
}

impl Note {
    /// An empty note right after the server accepted a create.
    pub fn created(id: NoteId, version: Version, now: i64) -> Self {
        Self {
            id,
            title: String::new(),
            body: Some(String::new()),
            tags: Tags::default(),
            version,
            updated_at: now,
            size: 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.body.is_some()
    }
}
