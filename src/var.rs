//! Variable cells and suspensions.
//!
//! Variables live outside the term store so that binding them never touches
//! hashconsed terms. A cell carries the binding slot, the owning
//! environment, a display name (cosmetic only; identity is the VarId), and
//! the list of boxes suspended on the variable.

use crate::env::EnvId;
use crate::term::TermId;
use crate::tree::{AndId, ChoiceId};
use smallvec::SmallVec;

/// Unique identifier for a variable cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u32);

impl VarId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A waiting record attached to a variable; drained when it is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    /// Re-examine an and-box (wake queue).
    And(AndId),
    /// Re-examine a choice-box (recall queue).
    Choice(ChoiceId),
}

#[derive(Debug, Clone)]
struct VarCell {
    binding: Option<TermId>,
    env: Option<EnvId>,
    name: String,
    suspensions: SmallVec<[Suspension; 2]>,
}

/// Store of all variable cells.
#[derive(Debug, Default)]
pub struct VarStore {
    cells: Vec<VarCell>,
    anon_counter: u32,
}

impl VarStore {
    pub fn new() -> Self {
        Self {
            cells: Vec::new(),
            anon_counter: 0,
        }
    }

    /// Allocate a fresh unbound variable with the given display name.
    pub fn fresh(&mut self, name: &str, env: Option<EnvId>) -> VarId {
        let id = VarId(self.cells.len() as u32);
        self.cells.push(VarCell {
            binding: None,
            env,
            name: name.to_string(),
            suspensions: SmallVec::new(),
        });
        id
    }

    /// Allocate a fresh anonymous variable with a generated display name.
    pub fn fresh_anon(&mut self, env: Option<EnvId>) -> VarId {
        self.anon_counter += 1;
        let name = format!("_G{}", self.anon_counter);
        let id = VarId(self.cells.len() as u32);
        self.cells.push(VarCell {
            binding: None,
            env,
            name,
            suspensions: SmallVec::new(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn binding(&self, v: VarId) -> Option<TermId> {
        self.cells[v.0 as usize].binding
    }

    pub fn is_bound(&self, v: VarId) -> bool {
        self.binding(v).is_some()
    }

    /// Overwrite the binding slot. Trail discipline is the caller's job:
    /// unification goes through `unify::bind`, undo through the trail.
    pub fn set_binding(&mut self, v: VarId, binding: Option<TermId>) {
        self.cells[v.0 as usize].binding = binding;
    }

    pub fn env(&self, v: VarId) -> Option<EnvId> {
        self.cells[v.0 as usize].env
    }

    /// Re-home the variable into another environment (promotion, or the
    /// driver upgrading naked query variables).
    pub fn set_env(&mut self, v: VarId, env: Option<EnvId>) {
        self.cells[v.0 as usize].env = env;
    }

    pub fn name(&self, v: VarId) -> &str {
        &self.cells[v.0 as usize].name
    }

    /// Append a suspension to the variable's wait list.
    pub fn suspend(&mut self, v: VarId, susp: Suspension) {
        let list = &mut self.cells[v.0 as usize].suspensions;
        if !list.contains(&susp) {
            list.push(susp);
        }
    }

    /// Drain the wait list, returning every suspended box.
    pub fn take_suspensions(&mut self, v: VarId) -> SmallVec<[Suspension; 2]> {
        std::mem::take(&mut self.cells[v.0 as usize].suspensions)
    }

    pub fn suspensions(&self, v: VarId) -> &[Suspension] {
        &self.cells[v.0 as usize].suspensions
    }

    pub fn has_suspensions(&self, v: VarId) -> bool {
        !self.cells[v.0 as usize].suspensions.is_empty()
    }
}
