//! Shared text document: operations, transform rules and the state machine.
//!
//! Positions and lengths are counted in Unicode scalar values, never bytes.
//! Every operation is seen by the transform engine as "remove `m` characters
//! at `p`, then insert `n` characters at `p`".

mod state;
mod transform;

pub use state::{DocumentState, DocumentView, EditConflict, OutgoingEdit, RemoteOutcome};
pub use transform::{transform, TransformConflict};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CollabError;
use crate::{OperationId, UserId};

/// Errors raised when an operation does not fit the current content
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("Range {position}..{end} is outside a document of {len} characters")]
    OutOfRange {
        position: usize,
        end: usize,
        len: usize,
    },

    #[error("Operation has no effect")]
    Empty,
}

impl From<DocumentError> for CollabError {
    fn from(err: DocumentError) -> Self {
        CollabError::InvalidRange(err.to_string())
    }
}

/// Payload of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edit {
    Insert { content: String },
    Delete { length: usize },
    Replace { length: usize, content: String },
}

impl Edit {
    /// Build the narrowest edit that removes `removed` characters and inserts `content`
    pub fn from_parts(removed: usize, content: String) -> Self {
        match (removed, content.is_empty()) {
            (0, _) => Edit::Insert { content },
            (length, true) => Edit::Delete { length },
            (length, false) => Edit::Replace { length, content },
        }
    }

    /// Number of characters removed
    pub fn removed_len(&self) -> usize {
        match self {
            Edit::Insert { .. } => 0,
            Edit::Delete { length } | Edit::Replace { length, .. } => *length,
        }
    }

    /// Text inserted (empty for deletes)
    pub fn inserted(&self) -> &str {
        match self {
            Edit::Insert { content } | Edit::Replace { content, .. } => content,
            Edit::Delete { .. } => "",
        }
    }

    /// Number of characters inserted
    pub fn inserted_len(&self) -> usize {
        char_len(self.inserted())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Edit::Insert { .. } => "insert",
            Edit::Delete { .. } => "delete",
            Edit::Replace { .. } => "replace",
        }
    }
}

/// An immutable edit against the document.
///
/// A transformed operation is a new value that keeps the original `id`,
/// `origin`, `version` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    /// Identity of the author
    pub origin: UserId,
    /// Document version the operation was authored against
    pub version: u64,
    /// Character offset
    pub position: usize,
    pub edit: Edit,
    /// Authoring time (milliseconds since epoch)
    pub timestamp: i64,
}

impl Operation {
    pub fn new(origin: impl Into<String>, version: u64, position: usize, edit: Edit) -> Self {
        Self {
            id: crate::new_id(),
            origin: origin.into(),
            version,
            position,
            edit,
            timestamp: crate::now_ms(),
        }
    }

    pub fn insert(
        origin: impl Into<String>,
        version: u64,
        position: usize,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            origin,
            version,
            position,
            Edit::Insert {
                content: content.into(),
            },
        )
    }

    pub fn delete(origin: impl Into<String>, version: u64, position: usize, length: usize) -> Self {
        Self::new(origin, version, position, Edit::Delete { length })
    }

    pub fn replace(
        origin: impl Into<String>,
        version: u64,
        position: usize,
        length: usize,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            origin,
            version,
            position,
            Edit::Replace {
                length,
                content: content.into(),
            },
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// End of the removed range
    pub fn end(&self) -> usize {
        self.position + self.edit.removed_len()
    }

    /// Net change in document length
    pub fn delta(&self) -> isize {
        self.edit.inserted_len() as isize - self.edit.removed_len() as isize
    }

    pub fn is_noop(&self) -> bool {
        self.edit.removed_len() == 0 && self.edit.inserted().is_empty()
    }

    /// Same operation at another place with another payload
    pub(crate) fn rewritten(&self, position: usize, edit: Edit) -> Self {
        Self {
            position,
            edit,
            ..self.clone()
        }
    }
}

/// Number of characters in `s`
pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte index of character `pos`, or `None` when past the end
pub(crate) fn byte_index(s: &str, pos: usize) -> Option<usize> {
    s.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(s.len()))
        .nth(pos)
}

/// Characters `start..start + len` of `s`
pub(crate) fn slice_chars(s: &str, start: usize, len: usize) -> Option<&str> {
    let from = byte_index(s, start)?;
    let to = byte_index(s, start + len)?;
    Some(&s[from..to])
}

/// Apply `op` to `content` in place and return the text it removed
pub fn apply_operation(content: &mut String, op: &Operation) -> Result<String, DocumentError> {
    let out_of_range = || DocumentError::OutOfRange {
        position: op.position,
        end: op.end(),
        len: char_len(content),
    };
    let from = byte_index(content, op.position).ok_or_else(out_of_range)?;
    let to = byte_index(content, op.end()).ok_or_else(out_of_range)?;

    let removed = content[from..to].to_string();
    content.replace_range(from..to, op.edit.inserted());
    Ok(removed)
}

/// Rebuild content by replaying `operations` from the empty string
pub fn replay<'a, I>(operations: I) -> Result<String, DocumentError>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut content = String::new();
    for op in operations {
        apply_operation(&mut content, op)?;
    }
    Ok(content)
}
