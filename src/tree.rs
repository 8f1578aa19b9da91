//! The configuration tree: and-boxes (conjunctions under a guard) and
//! choice-boxes (disjunctions of clause alternatives).
//!
//! The arena owns every box; boxes refer to each other by id, never by
//! reference, so the bidirectional parent/child structure carries no
//! ownership cycles. Dead boxes stay in the arena (tasks referencing them
//! are skipped on dequeue) but are removed from their parent's lists.

use crate::env::EnvId;
use crate::program::GuardType;
use crate::symbol::AtomId;
use crate::term::TermId;
use crate::var::{VarId, VarStore};
use std::collections::VecDeque;

/// Identifier of an and-box in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AndId(u32);

impl AndId {
    pub fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        AndId(raw)
    }
}

/// Identifier of a choice-box in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChoiceId(u32);

impl ChoiceId {
    pub fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        ChoiceId(raw)
    }
}

/// And-box status.
///
/// Transitions: boxes start Stable; deferring a binding or posting a
/// constraint on an external variable moves them to XUnstable; a wake
/// resets to Stable before the box is re-examined; a solved box that
/// cannot yet promote parks as Stable (quiet) or XStable (pending
/// external unifiers or constraints). Dead is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Dead,
    Stable,
    Unstable,
    XStable,
    XUnstable,
}

impl Status {
    /// Stable in the derived-predicate sense: quiescent, possibly with
    /// external dependencies.
    pub fn is_stable(self) -> bool {
        matches!(self, Status::Stable | Status::XStable)
    }
}

/// A conjunction being executed under a guard.
#[derive(Debug)]
pub struct AndBox {
    pub status: Status,
    pub env: EnvId,
    /// Goals not yet expanded, in program order.
    pub goals: VecDeque<TermId>,
    /// Deferred unifications on external variables, committed on promotion.
    pub unifiers: Vec<(VarId, TermId)>,
    /// Length of `unifiers` after head unification; entries below this
    /// mark come from the head and do not make the guard noisy.
    pub quiet_mark: usize,
    /// Suspended builtin goals waiting on a variable.
    pub constraints: Vec<(TermId, VarId)>,
    /// Child choice-boxes, one per expanded goal, in creation order.
    pub tried: Vec<ChoiceId>,
    /// Goals that replace this box at its parent on promotion.
    pub body_goals: Vec<TermId>,
    /// Parent choice-box; None only for detached roots.
    pub father: Option<ChoiceId>,
    /// Variables created in this box's environment.
    pub local_vars: Vec<VarId>,
    /// Trail position when guard execution began.
    pub trail_mark: usize,
}

/// A disjunction over the alternatives of one expanded goal.
#[derive(Debug)]
pub struct ChoiceBox {
    pub father: Option<AndId>,
    pub guard_type: GuardType,
    /// Live alternatives in sibling order; the first is leftmost.
    pub alternatives: Vec<AndId>,
    /// Clause indices not yet expanded (drained by RECALL).
    pub untried: Vec<usize>,
    /// Predicate this choice-box was created for (diagnostics, recall).
    pub predicate: Option<(AtomId, usize)>,
    /// The call this choice-box expands; recall re-matches it against
    /// untried clauses.
    pub call: Option<TermId>,
}

/// Arena owning all boxes.
#[derive(Debug, Default)]
pub struct Tree {
    ands: Vec<AndBox>,
    choices: Vec<ChoiceBox>,
}

impl Tree {
    pub fn new() -> Self {
        Self {
            ands: Vec::new(),
            choices: Vec::new(),
        }
    }

    pub fn new_and(&mut self, env: EnvId, father: Option<ChoiceId>, trail_mark: usize) -> AndId {
        let id = AndId(self.ands.len() as u32);
        self.ands.push(AndBox {
            status: Status::Stable,
            env,
            goals: VecDeque::new(),
            unifiers: Vec::new(),
            quiet_mark: 0,
            constraints: Vec::new(),
            tried: Vec::new(),
            body_goals: Vec::new(),
            father,
            local_vars: Vec::new(),
            trail_mark,
        });
        id
    }

    pub fn new_choice(
        &mut self,
        father: Option<AndId>,
        guard_type: GuardType,
        predicate: Option<(AtomId, usize)>,
    ) -> ChoiceId {
        let id = ChoiceId(self.choices.len() as u32);
        self.choices.push(ChoiceBox {
            father,
            guard_type,
            alternatives: Vec::new(),
            untried: Vec::new(),
            predicate,
            call: None,
        });
        id
    }

    pub fn and(&self, id: AndId) -> &AndBox {
        &self.ands[id.0 as usize]
    }

    pub fn and_mut(&mut self, id: AndId) -> &mut AndBox {
        &mut self.ands[id.0 as usize]
    }

    pub fn choice(&self, id: ChoiceId) -> &ChoiceBox {
        &self.choices[id.0 as usize]
    }

    pub fn choice_mut(&mut self, id: ChoiceId) -> &mut ChoiceBox {
        &mut self.choices[id.0 as usize]
    }

    // ========== derived predicates ==========

    pub fn is_dead(&self, id: AndId) -> bool {
        self.and(id).status == Status::Dead
    }

    /// Solved: no pending goals and every child choice-box promoted away.
    pub fn is_solved(&self, id: AndId) -> bool {
        let b = self.and(id);
        b.goals.is_empty() && b.tried.is_empty()
    }

    /// Quiet: no unifier entries beyond the head mark and every posted
    /// constraint entailed (its variable bound).
    pub fn is_quiet(&self, id: AndId, vars: &VarStore) -> bool {
        let b = self.and(id);
        b.unifiers.len() <= b.quiet_mark && b.constraints.iter().all(|&(_, v)| vars.is_bound(v))
    }

    /// Leftmost: first live alternative of its choice-box.
    pub fn is_leftmost(&self, choice: ChoiceId, id: AndId) -> bool {
        self.choice(choice).alternatives.first() == Some(&id)
    }

    /// Last: the only live alternative, with no untried clauses.
    pub fn is_last(&self, choice: ChoiceId, id: AndId) -> bool {
        let c = self.choice(choice);
        c.untried.is_empty() && c.alternatives.len() == 1 && c.alternatives[0] == id
    }

    /// Determinate: exactly one live alternative and no untried clauses.
    pub fn is_determinate(&self, choice: ChoiceId) -> bool {
        let c = self.choice(choice);
        c.untried.is_empty() && c.alternatives.len() == 1
    }

    // ========== structure edits ==========

    pub fn add_alternative(&mut self, choice: ChoiceId, and: AndId) {
        self.and_mut(and).father = Some(choice);
        self.choice_mut(choice).alternatives.push(and);
    }

    pub fn remove_alternative(&mut self, choice: ChoiceId, and: AndId) {
        self.choice_mut(choice).alternatives.retain(|&a| a != and);
    }

    pub fn remove_choice(&mut self, parent: AndId, choice: ChoiceId) {
        self.and_mut(parent).tried.retain(|&c| c != choice);
    }

    /// Mark a box and every descendant dead.
    pub fn mark_dead_subtree(&mut self, root: AndId) {
        let mut stack = vec![root];
        while let Some(a) = stack.pop() {
            self.and_mut(a).status = Status::Dead;
            for c in self.and(a).tried.clone() {
                stack.extend(self.choice(c).alternatives.iter().copied());
            }
        }
    }

    /// True iff `id` is `root` or lies in `root`'s subtree, following
    /// father links upward.
    pub fn is_in_subtree(&self, id: AndId, root: AndId) -> bool {
        let mut current = id;
        loop {
            if current == root {
                return true;
            }
            match self.and(current).father.and_then(|c| self.choice(c).father) {
                Some(up) => current = up,
                None => return false,
            }
        }
    }

    /// Parent and-box (grandparent through the choice-box), if any.
    pub fn parent_and(&self, id: AndId) -> Option<AndId> {
        self.and(id).father.and_then(|c| self.choice(c).father)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvStore;
    use crate::program::GuardType;

    fn scaffold() -> (Tree, EnvStore, AndId, ChoiceId, AndId, AndId) {
        let mut tree = Tree::new();
        let mut envs = EnvStore::new();
        let query = envs.fresh(None);
        let root_env = envs.fresh(Some(query));
        let root = tree.new_and(root_env, None, 0);
        let choice = tree.new_choice(Some(root), GuardType::None, None);
        tree.and_mut(root).tried.push(choice);
        let a = tree.new_and(envs.fresh(Some(root_env)), None, 0);
        let b = tree.new_and(envs.fresh(Some(root_env)), None, 0);
        tree.add_alternative(choice, a);
        tree.add_alternative(choice, b);
        (tree, envs, root, choice, a, b)
    }

    #[test]
    fn leftmost_and_last() {
        let (mut tree, _envs, _root, choice, a, b) = scaffold();
        assert!(tree.is_leftmost(choice, a));
        assert!(!tree.is_leftmost(choice, b));
        assert!(!tree.is_last(choice, a));
        assert!(!tree.is_determinate(choice));

        tree.remove_alternative(choice, a);
        assert!(tree.is_leftmost(choice, b));
        assert!(tree.is_last(choice, b));
        assert!(tree.is_determinate(choice));
    }

    #[test]
    fn untried_blocks_determinacy() {
        let (mut tree, _envs, _root, choice, a, _b) = scaffold();
        tree.remove_alternative(choice, a);
        tree.choice_mut(choice).untried.push(2);
        assert!(!tree.is_determinate(choice), "untried clauses keep the choice open");
    }

    #[test]
    fn solved_requires_empty_goals_and_tried() {
        let (mut tree, _envs, root, _choice, a, _b) = scaffold();
        assert!(tree.is_solved(a));
        assert!(!tree.is_solved(root), "root still has a tried choice-box");
        tree.and_mut(a).goals.push_back(crate::term::TermId::from_raw(0));
        assert!(!tree.is_solved(a));
    }

    #[test]
    fn quietness_tracks_marks_and_constraints() {
        let (mut tree, _envs, _root, _choice, a, _b) = scaffold();
        let mut vars = VarStore::new();
        let terms = crate::term::TermStore::new();
        let x = vars.fresh("X", None);

        assert!(tree.is_quiet(a, &vars));

        // head-unification deferrals stay below the quiet mark
        tree.and_mut(a).unifiers.push((x, terms.int(1)));
        tree.and_mut(a).quiet_mark = 1;
        assert!(tree.is_quiet(a, &vars));

        // a guard-time deferral makes the box noisy
        tree.and_mut(a).unifiers.push((x, terms.int(2)));
        assert!(!tree.is_quiet(a, &vars));
        tree.and_mut(a).unifiers.pop();

        // an unentailed constraint blocks quietness until the var is bound
        tree.and_mut(a).constraints.push((terms.int(0), x));
        assert!(!tree.is_quiet(a, &vars));
        vars.set_binding(x, Some(terms.int(3)));
        assert!(tree.is_quiet(a, &vars));
    }

    #[test]
    fn subtree_membership_and_death() {
        let (mut tree, mut envs, root, _choice, a, b) = scaffold();
        assert!(tree.is_in_subtree(a, root));
        assert!(tree.is_in_subtree(a, a));
        assert!(!tree.is_in_subtree(root, a));

        // nested level under `a`
        let inner_choice = tree.new_choice(Some(a), GuardType::Wait, None);
        tree.and_mut(a).tried.push(inner_choice);
        let leaf = tree.new_and(envs.fresh(None), None, 0);
        tree.add_alternative(inner_choice, leaf);
        assert!(tree.is_in_subtree(leaf, root));
        assert!(tree.is_in_subtree(leaf, a));
        assert!(!tree.is_in_subtree(leaf, b));

        tree.mark_dead_subtree(a);
        assert!(tree.is_dead(a));
        assert!(tree.is_dead(leaf));
        assert!(!tree.is_dead(b));
        assert!(!tree.is_dead(root));
    }
}
