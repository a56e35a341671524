//! Pairwise operation transform.
//!
//! `transform(a, b)` rewrites `a` so it applies after `b`, where both were
//! authored against the same document state. For any pair that does not
//! conflict, `apply(b); apply(transform(a, b))` and
//! `apply(a); apply(transform(b, a))` produce the same content.

use super::{Edit, Operation};

/// Two operations touch the same region and cannot be reconciled
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Operation {operation} overlaps {against} at {position}..{end}")]
pub struct TransformConflict {
    pub operation: String,
    pub against: String,
    pub position: usize,
    pub end: usize,
}

impl TransformConflict {
    fn between(a: &Operation, b: &Operation) -> Self {
        Self {
            operation: a.id.clone(),
            against: b.id.clone(),
            position: a.position.max(b.position),
            end: a.end().min(b.end()).max(a.position.max(b.position)),
        }
    }
}

/// Rebase `a` over `b`, which has already been applied
pub fn transform(a: &Operation, b: &Operation) -> Result<Operation, TransformConflict> {
    if a.is_noop() || b.is_noop() {
        return Ok(a.clone());
    }

    let (sa, ma) = (a.position, a.edit.removed_len());
    let (sb, mb, nb) = (b.position, b.edit.removed_len(), b.edit.inserted_len());
    let (ea, eb) = (sa + ma, sb + mb);

    let shifted = |by_insert: usize, by_remove: usize| {
        // Never lands before b's position
        let position = (sa + by_insert).saturating_sub(by_remove).max(sb);
        a.rewritten(position, a.edit.clone())
    };

    match (ma, mb) {
        // insert vs insert
        (0, 0) => {
            if sb < sa || (sb == sa && b.id < a.id) {
                Ok(shifted(nb, 0))
            } else {
                Ok(a.clone())
            }
        }
        // insert vs removal
        (0, _) => {
            if sa <= sb {
                Ok(a.clone())
            } else if sa >= eb {
                Ok(shifted(nb, mb))
            } else {
                Err(TransformConflict::between(a, b))
            }
        }
        // removal vs insert
        (_, 0) => {
            if sb <= sa {
                Ok(shifted(nb, 0))
            } else if sb >= ea {
                Ok(a.clone())
            } else {
                Err(TransformConflict::between(a, b))
            }
        }
        // removal vs removal
        _ => {
            if ea <= sb {
                Ok(a.clone())
            } else if sa >= eb {
                Ok(shifted(nb, mb))
            } else if a.edit.inserted().is_empty() && b.edit.inserted().is_empty() {
                let overlap = ea.min(eb) - sa.max(sb);
                Ok(a.rewritten(
                    sa.min(sb),
                    Edit::Delete {
                        length: ma - overlap,
                    },
                ))
            } else {
                Err(TransformConflict::between(a, b))
            }
        }
    }
}
