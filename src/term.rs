use crate::symbol::{AtomId, SymbolStore};
use crate::var::{VarId, VarStore};
use hashbrown::HashMap;
use parking_lot::RwLock;
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};

/// Unique identifier for a term in the term store.
/// TermIds are stable and can be compared for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TermId(u32);

impl TermId {
    /// Get the raw u32 value (for debugging/display).
    pub fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        TermId(raw)
    }
}

/// A term of the kernel language.
///
/// Variables are represented by reference into the variable store; the
/// binding cell lives there, so terms stay immutable and can be hashconsed.
/// Floats carry their IEEE bit pattern so the type stays Eq + Hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// A variable, identified by its cell in the VarStore.
    Var(VarId),
    /// An interned named constant.
    Atom(AtomId),
    /// An integer constant.
    Int(i64),
    /// A float constant, stored as raw bits.
    Float(u64),
    /// A compound term: functor applied to a fixed argument sequence.
    Struct(AtomId, SmallVec<[TermId; 4]>),
    /// A list cell: head and tail. The empty list is the atom `[]`.
    Cons(TermId, TermId),
}

impl Term {
    /// Float value of a `Term::Float`.
    pub fn float_value(bits: u64) -> f64 {
        f64::from_bits(bits)
    }
}

/// Number of shards for hashcons maps (power of 2 for fast modulo).
const NUM_SHARDS: usize = 16;

/// Thread-safe term store with hashconsing.
///
/// Guarantees:
/// - Structurally equal terms get the same TermId
/// - TermId can be resolved back to the term
/// - All terms (including variable references) are hashconsed
pub struct TermStore {
    /// Central storage of all terms, indexed by TermId.
    nodes: RwLock<Vec<Term>>,
    /// Sharded hashcons maps for reducing contention.
    shards: [RwLock<HashMap<Term, TermId>>; NUM_SHARDS],
    /// Counter for generating unique TermIds.
    next_id: AtomicU32,
}

impl TermStore {
    /// Create a new empty term store.
    pub fn new() -> Self {
        let shards = std::array::from_fn(|_| RwLock::new(HashMap::new()));
        Self {
            nodes: RwLock::new(Vec::new()),
            shards,
            next_id: AtomicU32::new(0),
        }
    }

    /// Intern a term, returning its TermId.
    /// If the term already exists, returns the existing TermId.
    fn intern(&self, term: Term) -> TermId {
        let shard_idx = Self::shard_index(&term);
        let shard = &self.shards[shard_idx];

        // Fast path: check if term exists (read lock)
        {
            let map = shard.read();
            if let Some(&id) = map.get(&term) {
                return id;
            }
        }

        // Slow path: need to insert (write lock)
        let mut map = shard.write();
        if let Some(&id) = map.get(&term) {
            return id;
        }

        let id = TermId(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut nodes = self.nodes.write();
            let idx = id.0 as usize;
            if nodes.len() <= idx {
                nodes.resize(idx + 1, Term::Int(0)); // placeholder
            }
            nodes[idx] = term.clone();
        }
        map.insert(term, id);
        id
    }

    /// Create a variable reference term.
    /// Hashconsed: the same VarId always returns the same TermId.
    pub fn var(&self, var: VarId) -> TermId {
        self.intern(Term::Var(var))
    }

    /// Create an atom term.
    pub fn atom(&self, atom: AtomId) -> TermId {
        self.intern(Term::Atom(atom))
    }

    /// Create an integer term.
    pub fn int(&self, value: i64) -> TermId {
        self.intern(Term::Int(value))
    }

    /// Create a float term.
    pub fn float(&self, value: f64) -> TermId {
        self.intern(Term::Float(value.to_bits()))
    }

    /// Create a compound term.
    /// An empty argument list is collapsed to the plain atom.
    pub fn compound(&self, functor: AtomId, args: SmallVec<[TermId; 4]>) -> TermId {
        if args.is_empty() {
            return self.atom(functor);
        }
        self.intern(Term::Struct(functor, args))
    }

    /// Create a unary compound.
    pub fn compound1(&self, functor: AtomId, a: TermId) -> TermId {
        self.compound(functor, smallvec::smallvec![a])
    }

    /// Create a binary compound.
    pub fn compound2(&self, functor: AtomId, a: TermId, b: TermId) -> TermId {
        self.compound(functor, smallvec::smallvec![a, b])
    }

    /// Create a list cell.
    pub fn cons(&self, head: TermId, tail: TermId) -> TermId {
        self.intern(Term::Cons(head, tail))
    }

    /// Build a proper list ending in the given tail.
    pub fn list(&self, elems: &[TermId], tail: TermId) -> TermId {
        let mut out = tail;
        for &e in elems.iter().rev() {
            out = self.cons(e, out);
        }
        out
    }

    /// Resolve a TermId to its term.
    /// Returns None if the TermId is invalid.
    pub fn resolve(&self, id: TermId) -> Option<Term> {
        let nodes = self.nodes.read();
        nodes.get(id.0 as usize).cloned()
    }

    /// The VarId if the term is a variable reference.
    pub fn as_var(&self, id: TermId) -> Option<VarId> {
        match self.resolve(id)? {
            Term::Var(v) => Some(v),
            _ => None,
        }
    }

    /// Functor and arity if the term is atom-or-compound shaped.
    /// Atoms report arity 0; list cells are not included.
    pub fn functor_of(&self, id: TermId) -> Option<(AtomId, usize)> {
        match self.resolve(id)? {
            Term::Atom(a) => Some((a, 0)),
            Term::Struct(f, args) => Some((f, args.len())),
            _ => None,
        }
    }

    /// Get the shard index for a term (for hashconsing distribution).
    fn shard_index(term: &Term) -> usize {
        let mut hasher = FxHasher::default();
        term.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }
}

impl Default for TermStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a term for diagnostics and solution display.
///
/// Bound variables are rendered through their bindings; unbound variables
/// print their display name. Proper lists print in bracket notation.
pub fn format_term(
    term: TermId,
    terms: &TermStore,
    symbols: &SymbolStore,
    vars: &VarStore,
) -> Result<String, String> {
    fn render(
        term: TermId,
        terms: &TermStore,
        symbols: &SymbolStore,
        vars: &VarStore,
        out: &mut String,
    ) -> Result<(), String> {
        match terms.resolve(term) {
            Some(Term::Var(v)) => match vars.binding(v) {
                Some(bound) => render(bound, terms, symbols, vars, out),
                None => {
                    out.push_str(vars.name(v));
                    Ok(())
                }
            },
            Some(Term::Atom(a)) => {
                let name = symbols
                    .resolve(a)
                    .ok_or_else(|| format!("unknown atom id {:?}", a))?;
                out.push_str(name);
                Ok(())
            }
            Some(Term::Int(i)) => {
                out.push_str(&i.to_string());
                Ok(())
            }
            Some(Term::Float(bits)) => {
                out.push_str(&Term::float_value(bits).to_string());
                Ok(())
            }
            Some(Term::Struct(f, args)) => {
                let name = symbols
                    .resolve(f)
                    .ok_or_else(|| format!("unknown functor id {:?}", f))?;
                out.push_str(name);
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    render(*arg, terms, symbols, vars, out)?;
                }
                out.push(')');
                Ok(())
            }
            Some(Term::Cons(head, tail)) => {
                out.push('[');
                render(head, terms, symbols, vars, out)?;
                let mut rest = tail;
                loop {
                    let deref = crate::unify::deref(rest, terms, vars);
                    match terms.resolve(deref) {
                        Some(Term::Cons(h, t)) => {
                            out.push_str(", ");
                            render(h, terms, symbols, vars, out)?;
                            rest = t;
                        }
                        Some(Term::Atom(a)) if symbols.resolve(a) == Some("[]") => break,
                        _ => {
                            out.push_str(" | ");
                            render(deref, terms, symbols, vars, out)?;
                            break;
                        }
                    }
                }
                out.push(']');
                Ok(())
            }
            None => Err(format!("unknown term id {:?}", term)),
        }
    }

    let mut out = String::new();
    render(term, terms, symbols, vars, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::var::VarStore;

    fn setup() -> (SymbolStore, TermStore, VarStore) {
        (SymbolStore::new(), TermStore::new(), VarStore::new())
    }

    // ========== HASHCONSING ==========

    #[test]
    fn equal_ground_terms_share_ids() {
        let (symbols, terms, _) = setup();
        let f = symbols.intern("f");
        let a = terms.atom(symbols.intern("a"));
        let t1 = terms.compound2(f, a, terms.int(1));
        let t2 = terms.compound2(f, a, terms.int(1));
        assert_eq!(t1, t2, "structurally equal terms should be hashconsed");
    }

    #[test]
    fn distinct_terms_get_distinct_ids() {
        let (symbols, terms, _) = setup();
        let f = symbols.intern("f");
        let a = terms.atom(symbols.intern("a"));
        let b = terms.atom(symbols.intern("b"));
        assert_ne!(terms.compound1(f, a), terms.compound1(f, b));
        assert_ne!(terms.int(1), terms.int(2));
        assert_ne!(terms.int(0), terms.float(0.0));
    }

    #[test]
    fn var_terms_keyed_by_identity_not_name() {
        let (_, terms, mut vars) = setup();
        let x1 = vars.fresh("X", None);
        let x2 = vars.fresh("X", None);
        assert_ne!(
            terms.var(x1),
            terms.var(x2),
            "two variables with the same display name are distinct"
        );
        assert_eq!(terms.var(x1), terms.var(x1));
    }

    #[test]
    fn nullary_compound_collapses_to_atom() {
        let (symbols, terms, _) = setup();
        let a = symbols.intern("a");
        assert_eq!(terms.compound(a, SmallVec::new()), terms.atom(a));
    }

    #[test]
    fn resolve_roundtrips() {
        let (symbols, terms, _) = setup();
        let nil = terms.atom(symbols.intern("[]"));
        let l = terms.list(&[terms.int(1), terms.int(2)], nil);
        match terms.resolve(l) {
            Some(Term::Cons(h, t)) => {
                assert_eq!(h, terms.int(1));
                match terms.resolve(t) {
                    Some(Term::Cons(h2, t2)) => {
                        assert_eq!(h2, terms.int(2));
                        assert_eq!(t2, nil);
                    }
                    other => panic!("expected cons tail, got {:?}", other),
                }
            }
            other => panic!("expected cons, got {:?}", other),
        }
    }

    #[test]
    fn functor_of_covers_atoms_and_compounds() {
        let (symbols, terms, _) = setup();
        let p = symbols.intern("p");
        let a = terms.atom(p);
        let c = terms.compound2(p, terms.int(1), terms.int(2));
        assert_eq!(terms.functor_of(a), Some((p, 0)));
        assert_eq!(terms.functor_of(c), Some((p, 2)));
        assert_eq!(terms.functor_of(terms.int(3)), None);
    }

    // ========== FORMATTING ==========

    #[test]
    fn format_proper_list() {
        let (symbols, terms, vars) = setup();
        let nil = terms.atom(symbols.intern("[]"));
        let l = terms.list(&[terms.int(1), terms.int(2), terms.int(3)], nil);
        assert_eq!(
            format_term(l, &terms, &symbols, &vars).unwrap(),
            "[1, 2, 3]"
        );
    }

    #[test]
    fn format_partial_list_shows_tail() {
        let (symbols, terms, mut vars) = setup();
        let t = vars.fresh("T", None);
        let l = terms.list(&[terms.int(1)], terms.var(t));
        assert_eq!(format_term(l, &terms, &symbols, &vars).unwrap(), "[1 | T]");
    }

    #[test]
    fn format_follows_bindings() {
        let (symbols, terms, mut vars) = setup();
        let x = vars.fresh("X", None);
        let g = symbols.intern("g");
        let tm = terms.compound1(g, terms.var(x));
        assert_eq!(format_term(tm, &terms, &symbols, &vars).unwrap(), "g(X)");
        vars.set_binding(x, Some(terms.int(7)));
        assert_eq!(format_term(tm, &terms, &symbols, &vars).unwrap(), "g(7)");
    }
}
