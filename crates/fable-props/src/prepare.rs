//! Preparation pass over unresolved trees.
//!
//! Two traversals run before a property body can be resolved:
//!
//! * pre-order: each node's preparation hook runs, then the guarded-access
//!   expansion rewrites a null-guard placeholder (`x._` followed by a field
//!   access) into an explicit [`ExprKind::Then`] with a fresh bound
//!   variable holding the guarded value;
//! * post-order: a field access chained directly onto such a guard is
//!   hoisted into the guard's continuation, so `x._.b.c` guards once and
//!   accesses `b.c` on the non-null value.
//!
//! Both traversals are identity-aware: a node reached through two parents
//! is rewritten once and its result reused. After the passes the pool is
//! frozen and the tree can only be consumed.

use rustc_hash::FxHashMap;

use crate::expr::{ExprId, ExprKind, ExprPool};

/// Run both preparation passes on `root`, freeze the pool and return the
/// (possibly rewritten) root.
pub fn prepare(pool: &mut ExprPool, root: ExprId) -> ExprId {
    prepare_with_hook(pool, root, |_, _| {})
}

/// Like [`prepare`], with a custom per-node hook invoked pre-order before
/// the guarded-access expansion.
pub fn prepare_with_hook(
    pool: &mut ExprPool,
    root: ExprId,
    mut hook: impl FnMut(&mut ExprPool, ExprId),
) -> ExprId {
    let mut seen = FxHashMap::default();
    let root = walk_pre(pool, root, &mut hook, &mut seen);
    let mut seen = FxHashMap::default();
    let root = walk_post(pool, root, &mut seen);
    pool.freeze();
    root
}

fn walk_pre(
    pool: &mut ExprPool,
    id: ExprId,
    hook: &mut impl FnMut(&mut ExprPool, ExprId),
    seen: &mut FxHashMap<ExprId, ExprId>,
) -> ExprId {
    if let Some(&done) = seen.get(&id) {
        return done;
    }
    hook(pool, id);
    let out = expand_guard(pool, id);
    let final_id = if out != id {
        // A guard wrapper was introduced; restart from it. Its
        // continuation is `id` itself, which gets revisited from here and
        // may be wrapped again if more guard placeholders remain.
        walk_pre(pool, out, hook, seen)
    } else {
        for slot in 0..child_count(pool, id) {
            let child = child_at(pool, id, slot);
            let new_child = walk_pre(pool, child, hook, seen);
            if new_child != child {
                replace_child_at(pool, id, slot, new_child);
            }
        }
        id
    };
    seen.insert(id, final_id);
    final_id
}

fn walk_post(
    pool: &mut ExprPool,
    id: ExprId,
    seen: &mut FxHashMap<ExprId, ExprId>,
) -> ExprId {
    if let Some(&done) = seen.get(&id) {
        return done;
    }
    for slot in 0..child_count(pool, id) {
        let child = child_at(pool, id, slot);
        let new_child = walk_post(pool, child, seen);
        if new_child != child {
            replace_child_at(pool, id, slot, new_child);
        }
    }
    let out = hoist_guard(pool, id);
    seen.insert(id, out);
    out
}

/// Pre-order step: if a direct child of `id` is a guard placeholder
/// `prefix._`, bind the guarded value to a fresh variable, substitute a
/// reference to it for the placeholder, and wrap `id` in the guard.
fn expand_guard(pool: &mut ExprPool, id: ExprId) -> ExprId {
    let found = (0..child_count(pool, id)).find_map(|slot| {
        let child = child_at(pool, id, slot);
        match *pool.kind(child) {
            ExprKind::Guarded { prefix } => Some((slot, child, prefix)),
            _ => None,
        }
    });
    let Some((slot, guard, prefix)) = found else {
        return id;
    };
    let var = pool.local("var_expr");
    let guard_span = pool.span(guard);
    let vref = pool.var_ref(guard_span, var);
    replace_child_at(pool, id, slot, vref);
    let span = pool.span(id);
    pool.push(
        ExprKind::Then { base: prefix, var, then_expr: id, default: None, from_guard: true },
        span,
    )
}

/// Post-order step: hoist a field access on a guard into the guard's
/// continuation, so chained accesses after `._` compose left-to-right.
fn hoist_guard(pool: &mut ExprPool, id: ExprId) -> ExprId {
    let ExprKind::FieldAccess { receiver, field } = pool.kind(id).clone() else {
        return id;
    };
    let ExprKind::Then { base, var, then_expr, default, from_guard: true } =
        pool.kind(receiver).clone()
    else {
        return id;
    };
    pool.set_kind(id, ExprKind::FieldAccess { receiver: then_expr, field });
    pool.set_kind(
        receiver,
        ExprKind::Then { base, var, then_expr: id, default, from_guard: true },
    );
    receiver
}

// ── Structural child access ────────────────────────────────────────────
//
// Children are addressed positionally so rewrites can substitute a single
// occurrence without touching aliased siblings.

fn children_of(kind: &ExprKind) -> Vec<ExprId> {
    match kind {
        ExprKind::Lit(_)
        | ExprKind::NoVal(_)
        | ExprKind::EnumLit(..)
        | ExprKind::TypeRef(_)
        | ExprKind::Ref(_)
        | ExprKind::RaiseError { .. }
        | ExprKind::Opaque(_) => Vec::new(),
        ExprKind::Guarded { prefix } => vec![*prefix],
        ExprKind::FieldAccess { receiver, .. } => vec![*receiver],
        ExprKind::CastTo { operand, .. } => vec![*operand],
        ExprKind::Call { receiver, args, .. } => {
            let mut v = vec![*receiver];
            v.extend(args.iter().copied());
            v
        }
        ExprKind::Then { base, then_expr, default, .. } => {
            let mut v = vec![*base, *then_expr];
            v.extend(default.iter().copied());
            v
        }
        ExprKind::Let { bindings, body } => {
            let mut v: Vec<_> = bindings.iter().map(|&(_, e)| e).collect();
            v.push(*body);
            v
        }
        ExprKind::Try { expr, fallback } => {
            let mut v = vec![*expr];
            v.extend(fallback.iter().copied());
            v
        }
        ExprKind::If { cond, then_expr, else_expr } => vec![*cond, *then_expr, *else_expr],
        ExprKind::Eq { lhs, rhs } | ExprKind::Arith { lhs, rhs, .. } => vec![*lhs, *rhs],
        ExprKind::ArrayLit { elements } => elements.clone(),
        ExprKind::Bind { value, body, .. } => vec![*value, *body],
        ExprKind::EnvGet { receiver, symbol } => vec![*receiver, *symbol],
        ExprKind::Solve { equation } => vec![*equation],
        ExprKind::LogicVal { var } => vec![*var],
    }
}

fn child_count(pool: &ExprPool, id: ExprId) -> usize {
    children_of(pool.kind(id)).len()
}

fn child_at(pool: &ExprPool, id: ExprId, slot: usize) -> ExprId {
    children_of(pool.kind(id))[slot]
}

fn replace_child_at(pool: &mut ExprPool, id: ExprId, slot: usize, new_child: ExprId) {
    let mut kind = pool.kind(id).clone();
    {
        let mut idx = 0usize;
        let mut replace = |e: &mut ExprId| {
            if idx == slot {
                *e = new_child;
            }
            idx += 1;
        };
        match &mut kind {
            ExprKind::Lit(_)
            | ExprKind::NoVal(_)
            | ExprKind::EnumLit(..)
            | ExprKind::TypeRef(_)
            | ExprKind::Ref(_)
            | ExprKind::RaiseError { .. }
            | ExprKind::Opaque(_) => {}
            ExprKind::Guarded { prefix } => replace(prefix),
            ExprKind::FieldAccess { receiver, .. } => replace(receiver),
            ExprKind::CastTo { operand, .. } => replace(operand),
            ExprKind::Call { receiver, args, .. } => {
                replace(receiver);
                args.iter_mut().for_each(replace);
            }
            ExprKind::Then { base, then_expr, default, .. } => {
                replace(base);
                replace(then_expr);
                default.iter_mut().for_each(replace);
            }
            ExprKind::Let { bindings, body } => {
                bindings.iter_mut().for_each(|(_, e)| replace(e));
                replace(body);
            }
            ExprKind::Try { expr, fallback } => {
                replace(expr);
                fallback.iter_mut().for_each(replace);
            }
            ExprKind::If { cond, then_expr, else_expr } => {
                replace(cond);
                replace(then_expr);
                replace(else_expr);
            }
            ExprKind::Eq { lhs, rhs } | ExprKind::Arith { lhs, rhs, .. } => {
                replace(lhs);
                replace(rhs);
            }
            ExprKind::ArrayLit { elements } => elements.iter_mut().for_each(replace),
            ExprKind::Bind { value, body, .. } => {
                replace(value);
                replace(body);
            }
            ExprKind::EnvGet { receiver, symbol } => {
                replace(receiver);
                replace(symbol);
            }
            ExprKind::Solve { equation } => replace(equation),
            ExprKind::LogicVal { var } => replace(var),
        }
    }
    pool.set_kind(id, kind);
}

#[cfg(test)]
mod tests {
    use super::*;
    use fable_common::Span;

    fn sp() -> Span {
        Span::synthetic()
    }

    #[test]
    fn single_guard_becomes_then() {
        // a._.b
        let mut pool = ExprPool::new();
        let a = pool.local("a");
        let a_ref = pool.var_ref(sp(), a);
        let g = pool.guarded(sp(), a_ref);
        let access = pool.field_access(sp(), g, "b");
        let root = prepare(&mut pool, access);
        let ExprKind::Then { base, var, then_expr, from_guard: true, .. } = *pool.kind(root)
        else {
            panic!("expected a guard, got {:?}", pool.kind(root));
        };
        assert_eq!(base, a_ref);
        match *pool.kind(then_expr) {
            ExprKind::FieldAccess { receiver, .. } => {
                assert!(matches!(*pool.kind(receiver), ExprKind::Ref(v) if v == var));
            }
            ref other => panic!("expected field access, got {other:?}"),
        }
        assert!(pool.is_frozen());
    }

    #[test]
    fn chained_access_is_hoisted_into_guard() {
        // a._.b.c guards once, then accesses b.c
        let mut pool = ExprPool::new();
        let a = pool.local("a");
        let a_ref = pool.var_ref(sp(), a);
        let g = pool.guarded(sp(), a_ref);
        let b = pool.field_access(sp(), g, "b");
        let c = pool.field_access(sp(), b, "c");
        let root = prepare(&mut pool, c);
        let ExprKind::Then { then_expr, from_guard: true, .. } = *pool.kind(root) else {
            panic!("expected a guard at the root");
        };
        // continuation is var.b.c
        let ExprKind::FieldAccess { receiver, ref field } = *pool.kind(then_expr) else {
            panic!("expected outer field access");
        };
        assert_eq!(field.lower(), "c");
        assert!(matches!(*pool.kind(receiver), ExprKind::FieldAccess { .. }));
    }

    #[test]
    fn two_guards_compose_left_to_right() {
        // a._.b._.c: inner guard on a, outer guard on (guarded a).b
        let mut pool = ExprPool::new();
        let a = pool.local("a");
        let a_ref = pool.var_ref(sp(), a);
        let g1 = pool.guarded(sp(), a_ref);
        let b = pool.field_access(sp(), g1, "b");
        let g2 = pool.guarded(sp(), b);
        let c = pool.field_access(sp(), g2, "c");
        let root = prepare(&mut pool, c);
        let ExprKind::Then { base, from_guard: true, .. } = *pool.kind(root) else {
            panic!("expected outer guard");
        };
        assert!(
            matches!(*pool.kind(base), ExprKind::Then { from_guard: true, .. }),
            "outer guard's base should be the inner guard"
        );
    }

    #[test]
    fn hook_sees_every_node() {
        let mut pool = ExprPool::new();
        let one = pool.int_lit(sp(), 1);
        let two = pool.int_lit(sp(), 2);
        let sum = pool.arith(sp(), crate::expr::ArithOp::Add, one, two);
        let mut visited = Vec::new();
        prepare_with_hook(&mut pool, sum, |_, id| visited.push(id));
        assert!(visited.contains(&sum));
        assert!(visited.contains(&one));
        assert!(visited.contains(&two));
        // pre-order: parent before children
        assert_eq!(visited[0], sum);
    }

    #[test]
    fn shared_node_is_prepared_once() {
        let mut pool = ExprPool::new();
        let one = pool.int_lit(sp(), 1);
        let sum = pool.arith(sp(), crate::expr::ArithOp::Add, one, one);
        let mut count = 0;
        prepare_with_hook(&mut pool, sum, |_, id| {
            if id == one {
                count += 1;
            }
        });
        assert_eq!(count, 1);
    }
}
