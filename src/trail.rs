//! Binding trail.
//!
//! Every binding made during unification is logged here together with the
//! and-box in whose context it was made. Undo comes in two shapes:
//! positional (contexts, argument-wise unification failure) and selective
//! (failure of one and-box whose trail entries interleave with live
//! siblings').

use crate::term::TermId;
use crate::tree::AndId;
use crate::var::{VarId, VarStore};

/// One logged binding: the variable, its previous binding, and the and-box
/// that owned the unification context.
#[derive(Debug, Clone, Copy)]
pub struct TrailEntry {
    pub var: VarId,
    pub old: Option<TermId>,
    pub owner: AndId,
}

/// Append-only undo log of variable bindings.
#[derive(Debug, Default)]
pub struct Trail {
    entries: Vec<TrailEntry>,
}

impl Trail {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Current position; pass back to `undo_to` to rewind.
    pub fn position(&self) -> usize {
        self.entries.len()
    }

    /// Record a binding about to be installed.
    pub fn record(&mut self, var: VarId, old: Option<TermId>, owner: AndId) {
        self.entries.push(TrailEntry { var, old, owner });
    }

    /// Undo every binding back to `pos`, restoring previous values.
    pub fn undo_to(&mut self, pos: usize, vars: &mut VarStore) {
        while self.entries.len() > pos {
            let entry = self.entries.pop().expect("trail underflow");
            vars.set_binding(entry.var, entry.old);
        }
    }

    /// Undo and remove the entries at or after `from` whose owner satisfies
    /// the predicate, leaving the others in place and in order. Restoration
    /// runs newest-first so chained rebinds rewind correctly.
    pub fn undo_owned_since<F>(&mut self, from: usize, vars: &mut VarStore, mut owned: F)
    where
        F: FnMut(AndId) -> bool,
    {
        let tail: Vec<TrailEntry> = self.entries.drain(from..).collect();
        let mut kept: Vec<TrailEntry> = Vec::with_capacity(tail.len());
        for entry in tail.into_iter().rev() {
            if owned(entry.owner) {
                vars.set_binding(entry.var, entry.old);
            } else {
                kept.push(entry);
            }
        }
        kept.reverse();
        self.entries.extend(kept);
    }

    /// Iterate the entries at or after `from`.
    pub fn entries_since(&self, from: usize) -> &[TrailEntry] {
        &self.entries[from..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::TermStore;
    use crate::tree::AndId;

    fn owner(n: u32) -> AndId {
        AndId::from_raw(n)
    }

    #[test]
    fn undo_to_restores_bindings() {
        let mut trail = Trail::new();
        let mut vars = VarStore::new();
        let terms = TermStore::new();
        let v = vars.fresh("V", None);
        let w = vars.fresh("W", None);

        let mark = trail.position();
        trail.record(v, None, owner(0));
        vars.set_binding(v, Some(terms.int(1)));
        trail.record(w, None, owner(0));
        vars.set_binding(w, Some(terms.int(2)));

        trail.undo_to(mark, &mut vars);
        assert!(!vars.is_bound(v));
        assert!(!vars.is_bound(w));
        assert_eq!(trail.position(), mark);
    }

    #[test]
    fn selective_undo_spares_other_owners() {
        let mut trail = Trail::new();
        let mut vars = VarStore::new();
        let terms = TermStore::new();
        let v = vars.fresh("V", None);
        let w = vars.fresh("W", None);

        trail.record(v, None, owner(1));
        vars.set_binding(v, Some(terms.int(1)));
        trail.record(w, None, owner(2));
        vars.set_binding(w, Some(terms.int(2)));

        trail.undo_owned_since(0, &mut vars, |o| o == owner(1));
        assert!(!vars.is_bound(v), "owner-1 binding should be undone");
        assert_eq!(
            vars.binding(w),
            Some(terms.int(2)),
            "owner-2 binding should survive"
        );
        assert_eq!(trail.position(), 1);
    }

    #[test]
    fn selective_undo_rewinds_newest_first() {
        let mut trail = Trail::new();
        let mut vars = VarStore::new();
        let terms = TermStore::new();
        let v = vars.fresh("V", None);

        trail.record(v, None, owner(1));
        vars.set_binding(v, Some(terms.int(1)));
        // rebind after an undo cycle elsewhere re-records the old value
        trail.record(v, Some(terms.int(1)), owner(1));
        vars.set_binding(v, Some(terms.int(2)));

        trail.undo_owned_since(0, &mut vars, |o| o == owner(1));
        assert!(!vars.is_bound(v), "both entries should rewind to unbound");
    }
}
