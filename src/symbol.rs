use lasso::{Spur, ThreadedRodeo};

/// Interned identifier for an atom (also used for compound functors).
/// Equality is identity: two atoms are equal iff their names are equal.
pub type AtomId = Spur;

/// Thread-safe store interning atom names.
///
/// Guarantees:
/// - Same string always produces the same AtomId
/// - Different strings always produce different AtomIds
/// - AtomId can be resolved back to the original string
pub struct SymbolStore {
    rodeo: ThreadedRodeo,
}

impl SymbolStore {
    /// Create a new empty symbol store.
    pub fn new() -> Self {
        Self {
            rodeo: ThreadedRodeo::new(),
        }
    }

    /// Intern an atom name, returning its unique AtomId.
    pub fn intern(&self, name: &str) -> AtomId {
        self.rodeo.get_or_intern(name)
    }

    /// Resolve an AtomId back to its name.
    /// Returns None if the AtomId was not created by this store.
    pub fn resolve(&self, id: AtomId) -> Option<&str> {
        self.rodeo.try_resolve(&id)
    }

    /// Get the AtomId for a name if it exists, without interning.
    pub fn get(&self, name: &str) -> Option<AtomId> {
        self.rodeo.get(name)
    }
}

impl Default for SymbolStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-interned atoms for the control constructs the worker dispatches on.
///
/// Goal expansion resolves functors against these ids instead of comparing
/// strings on every goal.
#[derive(Debug, Clone, Copy)]
pub struct ControlAtoms {
    pub comma: AtomId,
    pub semicolon: AtomId,
    pub arrow: AtomId,
    pub naf: AtomId,
    pub unify: AtomId,
    pub truth: AtomId,
    pub fail: AtomId,
    pub falsity: AtomId,
    pub nil: AtomId,
}

impl ControlAtoms {
    pub fn intern(symbols: &SymbolStore) -> Self {
        Self {
            comma: symbols.intern(","),
            semicolon: symbols.intern(";"),
            arrow: symbols.intern("->"),
            naf: symbols.intern("\\+"),
            unify: symbols.intern("="),
            truth: symbols.intern("true"),
            fail: symbols.intern("fail"),
            falsity: symbols.intern("false"),
            nil: symbols.intern("[]"),
        }
    }
}
