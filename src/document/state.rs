//! Document state machine.
//!
//! The channel's per-topic order is the sequencer. Every site keeps the same
//! `sequenced` log (edits in bus order, each rebased over the entries that
//! precede it), while local `content` is the sequenced state plus the local
//! operations that have not been echoed back yet.
//!
//! Only the front pending operation is ever in flight. Its `base` is the
//! length of the sequenced log it was written against, so every receiver
//! rebases it over exactly the same entries.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, error, warn};

use super::transform::transform;
use super::{apply_operation, char_len, replay, slice_chars, DocumentError, Edit, Operation};
use crate::{OperationId, UserId};

/// A local operation ready to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEdit {
    pub operation: Operation,
    /// Length of the sequenced log the operation applies to
    pub base: u64,
}

/// A local operation that had to yield to an overlapping remote one
#[derive(Debug, Clone)]
pub struct EditConflict {
    /// The rolled-back local operation
    pub local: Operation,
    /// The remote operation applied in its place
    pub remote: Operation,
    /// Contested region in the current content
    pub position: usize,
    pub length: usize,
    /// What the region would read with the local operation applied
    pub local_content: String,
    /// What the region reads now
    pub remote_content: String,
    /// Later local operations rolled back with it
    pub discarded: Vec<Operation>,
}

/// Result of feeding one remote notification through the machine
#[derive(Debug, Clone, Default)]
pub struct RemoteOutcome {
    /// Rebased remote operation applied to the content
    pub applied: Option<Operation>,
    /// Our own in-flight operation came back
    pub acknowledged: Option<OperationId>,
    pub conflict: Option<EditConflict>,
    /// Already seen; nothing changed
    pub duplicate: bool,
    /// Discarded identically at every site (overlap or nothing left to apply)
    pub dropped: bool,
}

/// Read-only snapshot for callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentView {
    pub content: String,
    pub version: u64,
    pub pending: usize,
    pub sequenced: u64,
}

#[derive(Debug, Clone)]
pub struct DocumentState {
    site: UserId,
    content: String,
    version: u64,
    operations: Vec<Operation>,
    pending: VecDeque<Operation>,
    in_flight: Option<OperationId>,
    confirmed: String,
    sequenced: Vec<Operation>,
    seen: HashSet<OperationId>,
}

impl DocumentState {
    /// Empty document at version 1
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            content: String::new(),
            version: 1,
            operations: Vec::new(),
            pending: VecDeque::new(),
            in_flight: None,
            confirmed: String::new(),
            sequenced: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Rebuild from a sequenced log received from a peer or from storage
    pub fn from_sequenced(
        site: impl Into<String>,
        sequenced: Vec<Operation>,
    ) -> Result<Self, DocumentError> {
        let content = replay(&sequenced)?;
        Ok(Self {
            site: site.into(),
            confirmed: content.clone(),
            content,
            version: sequenced.len() as u64 + 1,
            operations: sequenced.clone(),
            pending: VecDeque::new(),
            in_flight: None,
            seen: sequenced.iter().map(|op| op.id.clone()).collect(),
            sequenced,
        })
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Length in characters
    pub fn len(&self) -> usize {
        char_len(&self.content)
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Applied log; replaying it from "" yields `content`
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn pending_operations(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_deref()
    }

    /// Log shared by every site, in bus order
    pub fn sequenced(&self) -> &[Operation] {
        &self.sequenced
    }

    /// Content of the sequenced log alone
    pub fn confirmed_content(&self) -> &str {
        &self.confirmed
    }

    pub fn view(&self) -> DocumentView {
        DocumentView {
            content: self.content.clone(),
            version: self.version,
            pending: self.pending.len(),
            sequenced: self.sequenced.len() as u64,
        }
    }

    /// New operation authored by this site against the current version
    pub fn local_operation(&self, position: usize, edit: Edit) -> Operation {
        Operation::new(self.site.clone(), self.version, position, edit)
    }

    /// Apply a locally authored operation and queue it for publishing.
    ///
    /// Returns the edit to publish when nothing else is in flight.
    pub fn apply_local(&mut self, op: Operation) -> Result<Option<OutgoingEdit>, DocumentError> {
        if op.is_noop() {
            return Err(DocumentError::Empty);
        }
        apply_operation(&mut self.content, &op)?;
        self.push_applied(op.clone());
        self.pending.push_back(op);
        Ok(self.next_outgoing())
    }

    /// Front pending operation, if it may be published now
    pub fn next_outgoing(&mut self) -> Option<OutgoingEdit> {
        if self.in_flight.is_some() {
            return None;
        }
        let front = self.pending.front()?.clone();
        self.in_flight = Some(front.id.clone());
        Some(OutgoingEdit {
            operation: front,
            base: self.sequenced.len() as u64,
        })
    }

    /// The in-flight publish never reached the channel; allow a resend
    pub fn publish_failed(&mut self) {
        self.in_flight = None;
    }

    /// Feed a sequenced edit from the channel (ours or a peer's)
    pub fn apply_remote(&mut self, op: Operation, base: u64) -> RemoteOutcome {
        let mut outcome = RemoteOutcome::default();

        if !self.seen.insert(op.id.clone()) {
            debug!("Ignoring duplicate operation {}", op.id);
            outcome.duplicate = true;
            return outcome;
        }

        let canonical = self.canonicalize(&op, base);

        if self.in_flight.as_deref() == Some(op.id.as_str()) {
            self.in_flight = None;
            outcome.acknowledged = Some(op.id.clone());
        }
        if self.pending.front().map(|p| p.id == op.id).unwrap_or(false) {
            self.pending.pop_front();
            outcome.acknowledged = Some(op.id.clone());
        }
        if outcome.acknowledged.is_some() {
            match canonical {
                Some(canonical) => self.push_sequenced(canonical),
                None => outcome.dropped = true,
            }
            return outcome;
        }

        let Some(remote) = canonical else {
            debug!("Dropping operation {} from {}", op.id, op.origin);
            outcome.dropped = true;
            return outcome;
        };
        let confirmed_before = self.confirmed.clone();
        self.push_sequenced(remote.clone());
        self.integrate(remote, &confirmed_before, &mut outcome);
        outcome
    }

    /// Rebase over the sequenced entries the author had not seen
    fn canonicalize(&self, op: &Operation, base: u64) -> Option<Operation> {
        let mut base = base as usize;
        if base > self.sequenced.len() {
            warn!(
                "Operation {} claims base {} beyond local log of {}",
                op.id,
                base,
                self.sequenced.len()
            );
            base = self.sequenced.len();
        }

        let mut canonical = op.clone();
        for earlier in &self.sequenced[base..] {
            canonical = transform(&canonical, earlier).ok()?;
        }
        (!canonical.is_noop()).then_some(canonical)
    }

    /// Apply a sequenced remote operation over the local pending ones
    fn integrate(
        &mut self,
        remote: Operation,
        confirmed_before: &str,
        outcome: &mut RemoteOutcome,
    ) {
        let original: Vec<Operation> = self.pending.iter().cloned().collect();

        let mut r = remote;
        let mut conflict_at = None;
        for i in 0..self.pending.len() {
            let p = &self.pending[i];
            let rebased = transform(p, &r).and_then(|p2| transform(&r, p).map(|r2| (p2, r2)));
            match rebased {
                Ok((p2, r2)) => {
                    self.pending[i] = p2;
                    r = r2;
                }
                Err(_) => {
                    conflict_at = Some(i);
                    break;
                }
            }
        }

        match conflict_at {
            None if r.is_noop() => outcome.dropped = true,
            None => {
                if let Err(e) = apply_operation(&mut self.content, &r) {
                    error!("Rebased operation {} does not apply: {}", r.id, e);
                    return;
                }
                self.push_applied(r.clone());
                outcome.applied = Some(r);
            }
            Some(i) => {
                outcome.conflict = self.roll_back(confirmed_before, &original, i, r.clone());
                outcome.applied = Some(r);
            }
        }
        self.drop_pending_noops();
    }

    /// Undo `original[i..]`, then apply `remote` (already rebased over `original[..i]`)
    fn roll_back(
        &mut self,
        confirmed_before: &str,
        original: &[Operation],
        i: usize,
        remote: Operation,
    ) -> Option<EditConflict> {
        let mut kept = confirmed_before.to_string();
        for op in &original[..i] {
            if let Err(e) = apply_operation(&mut kept, op) {
                error!("Pending operation {} no longer applies: {}", op.id, e);
                return None;
            }
        }
        let local = original[i].clone();
        let discarded: Vec<Operation> = original[i + 1..].to_vec();

        let mut current = kept.clone();
        if let Err(e) = apply_operation(&mut current, &remote) {
            error!("Remote operation {} does not apply: {}", remote.id, e);
            return None;
        }

        if let Some(undo) = diff_operation(&self.site, self.version, &self.content, &kept) {
            self.push_applied(undo);
        }
        self.content = kept.clone();
        if apply_operation(&mut self.content, &remote).is_ok() {
            self.push_applied(remote.clone());
        }
        self.pending.truncate(i);

        // contested region: union of both edits, in `kept` coordinates
        let start = local.position.min(remote.position);
        let end = local.end().max(remote.end());
        let length = end - start + remote.edit.inserted_len() - remote.edit.removed_len();

        let mut local_region = slice_chars(&kept, start, end - start)
            .unwrap_or_default()
            .to_string();
        let relative = local.rewritten(local.position - start, local.edit.clone());
        if apply_operation(&mut local_region, &relative).is_err() {
            local_region = local.edit.inserted().to_string();
        }
        let remote_region = slice_chars(&self.content, start, length)
            .unwrap_or_default()
            .to_string();

        if !discarded.is_empty() {
            warn!(
                "Rolling back {} later local operation(s) after conflict on {}",
                discarded.len(),
                local.id
            );
        }

        Some(EditConflict {
            local,
            remote,
            position: start,
            length,
            local_content: local_region,
            remote_content: remote_region,
            discarded,
        })
    }

    /// Pending operations that collapsed to nothing are not worth sending
    fn drop_pending_noops(&mut self) {
        let in_flight = self.in_flight.clone();
        self.pending
            .retain(|p| !p.is_noop() || in_flight.as_deref() == Some(p.id.as_str()));
    }

    fn push_applied(&mut self, op: Operation) {
        self.operations.push(op);
        self.version += 1;
    }

    fn push_sequenced(&mut self, op: Operation) {
        if let Err(e) = apply_operation(&mut self.confirmed, &op) {
            error!("Sequenced operation {} does not apply: {}", op.id, e);
        }
        self.sequenced.push(op);
    }
}

/// Single operation turning `old` into `new`, if they differ
pub(crate) fn diff_operation(
    origin: &str,
    version: u64,
    old: &str,
    new: &str,
) -> Option<Operation> {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = (old_chars.len() - prefix).min(new_chars.len() - prefix);
    let suffix = old_chars
        .iter()
        .rev()
        .zip(new_chars.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let removed = old_chars.len() - prefix - suffix;
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
    if removed == 0 && inserted.is_empty() {
        return None;
    }
    Some(Operation::new(
        origin,
        version,
        prefix,
        Edit::from_parts(removed, inserted),
    ))
}
