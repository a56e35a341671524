//! Threaded comments anchored to document positions.
//!
//! The stored anchor never moves when the document changes; the captured
//! context snippets let a viewer re-locate it. Threads are one level deep.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::document::{char_len, slice_chars};
use crate::error::{CollabError, CollabResult};
use crate::{CommentId, SessionId, UserId};

/// Characters of surrounding text captured on each side of an anchor
pub const COMMENT_CONTEXT_CHARS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorType {
    /// A caret position
    Point,
    /// A selected range
    Range,
}

/// Where a comment points and what surrounded it when written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentAnchor {
    pub anchor_type: AnchorType,
    /// Character offset
    pub position: usize,
    /// Selection length (0 for points)
    pub length: usize,
    pub context_before: String,
    pub context_after: String,
}

impl CommentAnchor {
    /// Capture an anchor over `content`; fails past the end of the document
    pub fn capture(content: &str, position: usize, length: usize) -> CollabResult<Self> {
        let len = char_len(content);
        if position + length > len {
            return Err(CollabError::InvalidAnchor(format!(
                "{}..{} is outside a document of {} characters",
                position,
                position + length,
                len
            )));
        }

        let before_start = position.saturating_sub(COMMENT_CONTEXT_CHARS);
        let after_start = position + length;
        let after_len = COMMENT_CONTEXT_CHARS.min(len - after_start);

        Ok(Self {
            anchor_type: if length == 0 {
                AnchorType::Point
            } else {
                AnchorType::Range
            },
            position,
            length,
            context_before: slice_chars(content, before_start, position - before_start)
                .unwrap_or_default()
                .to_string(),
            context_after: slice_chars(content, after_start, after_len)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub session_id: SessionId,
    pub anchor: CommentAnchor,
    /// Document version when the comment was written
    pub version: u64,
    pub author_id: UserId,
    pub body: String,
    pub resolved: bool,
    pub resolved_by: Option<UserId>,
    pub resolved_at: Option<i64>,
    pub parent_id: Option<CommentId>,
    pub created_at: i64,
}

impl Comment {
    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Build a top-level comment
    pub fn draft(
        session_id: &str,
        author_id: &str,
        content: &str,
        version: u64,
        position: usize,
        length: usize,
        body: impl Into<String>,
    ) -> CollabResult<Self> {
        Ok(Self {
            id: crate::new_id(),
            session_id: session_id.to_string(),
            anchor: CommentAnchor::capture(content, position, length)?,
            version,
            author_id: author_id.to_string(),
            body: body.into(),
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            parent_id: None,
            created_at: crate::now_ms(),
        })
    }
}

/// Comments of one session, owned by its actor
#[derive(Debug, Default)]
pub struct CommentStore {
    comments: HashMap<CommentId, Comment>,
}

impl CommentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with comments loaded from the row store
    pub fn with_comments(comments: impl IntoIterator<Item = Comment>) -> Self {
        Self {
            comments: comments.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    /// Build a reply sharing the parent's anchor
    pub fn draft_reply(
        &self,
        parent_id: &str,
        author_id: &str,
        version: u64,
        body: impl Into<String>,
    ) -> CollabResult<Comment> {
        let parent = self
            .comments
            .get(parent_id)
            .ok_or_else(|| CollabError::comment_not_found(parent_id))?;
        if parent.is_reply() {
            return Err(CollabError::InvalidHierarchy(format!(
                "{} is already a reply",
                parent_id
            )));
        }

        Ok(Comment {
            id: crate::new_id(),
            session_id: parent.session_id.clone(),
            anchor: parent.anchor.clone(),
            version,
            author_id: author_id.to_string(),
            body: body.into(),
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            parent_id: Some(parent.id.clone()),
            created_at: crate::now_ms(),
        })
    }

    /// Store a comment; returns false when it was already known
    pub fn insert(&mut self, comment: Comment) -> bool {
        if self.comments.contains_key(&comment.id) {
            return false;
        }
        self.comments.insert(comment.id.clone(), comment);
        true
    }

    /// Mark resolved. Resolving twice succeeds and leaves the first resolution.
    ///
    /// The boolean is true when this call changed the comment.
    pub fn resolve(
        &mut self,
        comment_id: &str,
        resolved_by: &str,
        at: i64,
    ) -> CollabResult<(Comment, bool)> {
        let comment = self
            .comments
            .get_mut(comment_id)
            .ok_or_else(|| CollabError::comment_not_found(comment_id))?;
        if comment.resolved {
            return Ok((comment.clone(), false));
        }
        comment.resolved = true;
        comment.resolved_by = Some(resolved_by.to_string());
        comment.resolved_at = Some(at);
        Ok((comment.clone(), true))
    }

    pub fn get(&self, comment_id: &str) -> Option<&Comment> {
        self.comments.get(comment_id)
    }

    /// All comments, oldest first
    pub fn all(&self) -> Vec<Comment> {
        let mut comments: Vec<Comment> = self.comments.values().cloned().collect();
        comments.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        comments
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }
}
