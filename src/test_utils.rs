use crate::driver::Driver;
use crate::program::{collect_vars, Clause, GuardType};
use crate::term::TermId;

/// Add a clause to the driver's program, collecting its variable set from
/// head, guard, and body.
pub(crate) fn clause(
    d: &mut Driver,
    head: TermId,
    guard: Option<TermId>,
    guard_type: GuardType,
    body: Vec<TermId>,
) {
    let mut vars = Vec::new();
    collect_vars(head, &d.terms, &mut vars);
    if let Some(g) = guard {
        collect_vars(g, &d.terms, &mut vars);
    }
    for &b in &body {
        collect_vars(b, &d.terms, &mut vars);
    }
    let (name, arity) = d
        .terms
        .functor_of(head)
        .expect("clause head must be an atom or compound");
    d.program_mut().add_clause(
        name,
        arity,
        Clause {
            head,
            guard,
            guard_type,
            body,
            vars,
        },
    );
}

pub(crate) fn atom(d: &Driver, name: &str) -> TermId {
    d.terms.atom(d.symbols.intern(name))
}

pub(crate) fn var(d: &mut Driver, name: &str) -> TermId {
    let v = d.vars.fresh(name, None);
    d.terms.var(v)
}

pub(crate) fn nil(d: &Driver) -> TermId {
    atom(d, "[]")
}

pub(crate) fn int_list(d: &Driver, elems: &[i64]) -> TermId {
    let items: Vec<TermId> = elems.iter().map(|&i| d.terms.int(i)).collect();
    let tail = nil(d);
    d.terms.list(&items, tail)
}

pub(crate) fn atom_list(d: &Driver, elems: &[&str]) -> TermId {
    let items: Vec<TermId> = elems.iter().map(|&a| atom(d, a)).collect();
    let tail = nil(d);
    d.terms.list(&items, tail)
}

/// member(X, [X|_]).
/// member(X, [_|T]) :- member(X, T).
pub(crate) fn add_member(d: &mut Driver) {
    let member = d.symbols.intern("member");

    let x = var(d, "X");
    let rest = var(d, "_");
    let head = d.terms.compound2(member, x, d.terms.cons(x, rest));
    clause(d, head, None, GuardType::None, vec![]);

    let x2 = var(d, "X");
    let skip = var(d, "_");
    let t = var(d, "T");
    let head = d.terms.compound2(member, x2, d.terms.cons(skip, t));
    let body = vec![d.terms.compound2(member, x2, t)];
    clause(d, head, None, GuardType::None, body);
}

/// append([], Y, Y).
/// append([H|T], Y, [H|R]) :- append(T, Y, R).
pub(crate) fn add_append(d: &mut Driver) {
    let append = d.symbols.intern("append");

    let y = var(d, "Y");
    let empty = nil(d);
    let head = d.terms.compound(append, smallvec::smallvec![empty, y, y]);
    clause(d, head, None, GuardType::None, vec![]);

    let h = var(d, "H");
    let t = var(d, "T");
    let y2 = var(d, "Y");
    let r = var(d, "R");
    let head = d.terms.compound(
        append,
        smallvec::smallvec![d.terms.cons(h, t), y2, d.terms.cons(h, r)],
    );
    let body = vec![d.terms.compound(append, smallvec::smallvec![t, y2, r])];
    clause(d, head, None, GuardType::None, body);
}

/// len([], 0).
/// len([_|T], N) :- len(T, M), N is M + 1.
pub(crate) fn add_len(d: &mut Driver) {
    let len = d.symbols.intern("len");
    let is = d.symbols.intern("is");
    let plus = d.symbols.intern("+");

    let empty = nil(d);
    let head = d.terms.compound2(len, empty, d.terms.int(0));
    clause(d, head, None, GuardType::None, vec![]);

    let skip = var(d, "_");
    let t = var(d, "T");
    let n = var(d, "N");
    let m = var(d, "M");
    let head = d.terms.compound2(len, d.terms.cons(skip, t), n);
    let body = vec![
        d.terms.compound2(len, t, m),
        d.terms
            .compound2(is, n, d.terms.compound2(plus, m, d.terms.int(1))),
    ];
    clause(d, head, None, GuardType::None, body);
}

/// pick(1) :- true ? true.   pick(2) :- true ? true.   pick(3) :- true ? true.
pub(crate) fn add_pick(d: &mut Driver) {
    let pick = d.symbols.intern("pick");
    for i in 1..=3 {
        let head = d.terms.compound1(pick, d.terms.int(i));
        let guard = atom(d, "true");
        let body = vec![atom(d, "true")];
        clause(d, head, Some(guard), GuardType::Wait, body);
    }
}

/// ordered(a) :- true ?? write(first).
/// ordered(b) :- true ?? write(second).
pub(crate) fn add_ordered(d: &mut Driver) {
    let ordered = d.symbols.intern("ordered");
    let write = d.symbols.intern("write");
    for (arg, msg) in [("a", "first"), ("b", "second")] {
        let head = d.terms.compound1(ordered, atom(d, arg));
        let guard = atom(d, "true");
        let body = vec![d.terms.compound1(write, atom(d, msg))];
        clause(d, head, Some(guard), GuardType::QuietWait, body);
    }
}
