//! Strongly-typed identifiers.
//!
//! Both ids are opaque strings on the wire and in storage. `Id<T>` uses a
//! phantom marker so a task id can never be passed where an owner id is
//! expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each id kind.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used by generated ids (e.g. `"task-"`).
    fn prefix() -> &'static str;
}

/// Generic string-backed id.
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Wrap an existing id string (e.g. a document id from the API layer).
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    /// Generate a fresh, time-sortable id: `<prefix><ULID>`.
    pub fn generate() -> Self {
        Self::new(format!("{}{}", T::prefix(), Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn into_string(self) -> String {
        self.value
    }
}

// Manual impls: derives would put bounds on `T`, which is only a marker.
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        Self::new(self.value.clone())
    }
}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Task marker.
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Owner marker (the document a task belongs to).
pub enum Owner {}

impl IdMarker for Owner {
    fn prefix() -> &'static str {
        "doc-"
    }
}

/// Identifier of a Task.
pub type TaskId = Id<Task>;

/// Correlation key grouping tasks (a document id).
pub type OwnerId = Id<Owner>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_and_are_unique() {
        let a = TaskId::generate();
        let b = TaskId::generate();

        assert!(a.as_str().starts_with("task-"));
        assert!(OwnerId::generate().as_str().starts_with("doc-"));
        assert_ne!(a, b);
    }

    #[test]
    fn generated_ids_sort_by_creation_time() {
        let id1 = TaskId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::generate();

        assert!(id1 < id2);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = TaskId::new("ocr_doc-1_1700000000");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ocr_doc-1_1700000000\"");

        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
