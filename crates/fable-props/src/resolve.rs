//! Resolver: type-directed lowering of unresolved nodes into typed IR.
//!
//! [`construct`] is the sole entry point from the unresolved world.
//! Resolution dispatches on the node kind, checks the result against an
//! optional expected type or predicate, inserts view conversions where the
//! resolved type is narrower, and materializes result slots wherever the
//! ref-counting discipline requires one.

use fable_common::Name;
use fable_types::{TypeId, TypeRegistry};

use crate::cx::ConstructCx;
use crate::dynvar::binding_is_used;
use crate::error::{CResult, DiagKind, Diagnostic};
use crate::expr::{ExprId, ExprKind, Lit, VarId, VarKind};
use crate::ir::{RExpr, RKind};
use crate::prop::{self, ConstVal};

/// What a context expects of a resolved expression.
#[derive(Clone, Copy)]
pub enum Expected {
    Type(TypeId),
    /// Predicate over the resolved type, with a description of what was
    /// expected for the mismatch message.
    Pred(fn(&TypeRegistry, TypeId) -> bool, &'static str),
}

pub fn is_node_like(types: &TypeRegistry, ty: TypeId) -> bool {
    types.is_node(ty) || types.is_entity(ty)
}

pub fn is_integral(types: &TypeRegistry, ty: TypeId) -> bool {
    ty == types.int_type() || ty == types.big_int_type()
}

/// Resolve `expr` with no expectation on its type.
pub fn construct(ccx: &mut ConstructCx<'_>, expr: ExprId) -> CResult<RExpr> {
    debug_assert!(ccx.pool.is_frozen(), "construct on an unprepared tree");
    let kind = ccx.pool.kind(expr).clone();
    let span = ccx.pool.span(expr);
    match kind {
        ExprKind::Lit(lit) => construct_lit(ccx, lit, span),
        ExprKind::NoVal(ty) => {
            if !ccx.cx.types.null_allowed(ty) {
                return Err(ccx.cx.sink.fatal(
                    DiagKind::TypeMismatch,
                    span,
                    format!("type {} has no null value", ccx.cx.types.display(ty)),
                ));
            }
            Ok(RExpr::new(RKind::NullVal, ty, span))
        }
        ExprKind::EnumLit(ty, variant) => construct_enum_lit(ccx, ty, variant, span),
        ExprKind::TypeRef(name) => Err(ccx.cx.sink.fatal(
            DiagKind::InvalidExpression,
            span,
            format!("type {name} cannot be used as a value"),
        )),
        ExprKind::CastTo { operand, target } => construct_cast(ccx, operand, &target, span),
        ExprKind::Ref(var) => construct_ref(ccx, var, span),
        ExprKind::Guarded { .. } => Err(ccx.cx.sink.fatal(
            DiagKind::InvalidExpression,
            span,
            "null-guard placeholder used outside a field access chain",
        )),
        ExprKind::Opaque(repr) => Err(ccx.cx.sink.fatal(
            DiagKind::InvalidExpression,
            span,
            format!("value {repr} cannot be used as an expression"),
        )),
        ExprKind::FieldAccess { receiver, field } => {
            construct_field_access(ccx, receiver, &field, span)
        }
        ExprKind::Call { receiver, name, args } => {
            let recv = construct_node_like(ccx, receiver)?;
            let node = node_of(ccx, &recv);
            let Some(pid) = ccx.cx.props.lookup(&ccx.cx.types, node, &name) else {
                return Err(ccx.cx.sink.fatal(
                    DiagKind::InvalidExpression,
                    span,
                    format!(
                        "no property named {name} on type {}",
                        ccx.cx.types.display(node)
                    ),
                ));
            };
            construct_call(ccx, span, pid, recv, &args)
        }
        ExprKind::Then { base, var, then_expr, default, .. } => {
            construct_then(ccx, base, var, then_expr, default, span)
        }
        ExprKind::Let { bindings, body } => construct_let(ccx, &bindings, body, span),
        ExprKind::Try { expr, fallback } => construct_try(ccx, expr, fallback, span),
        ExprKind::If { cond, then_expr, else_expr } => {
            let expected = Expected::Type(ccx.cx.types.bool_type());
            let cond = construct_expected(ccx, cond, expected, None, true)?;
            let then = construct(ccx, then_expr)?;
            let els = construct(ccx, else_expr)?;
            let (then, els, ty) = unify_pair(ccx, then, els)?;
            let slot = ccx.slots.create(&Name::from_lower("if_result"), Some(ty));
            Ok(RExpr::new(
                RKind::If { cond: Box::new(cond), then: Box::new(then), els: Box::new(els) },
                ty,
                span,
            )
            .with_slot(slot))
        }
        ExprKind::Eq { lhs, rhs } => {
            let l = construct(ccx, lhs)?;
            let r = construct(ccx, rhs)?;
            let (l, r, _) = unify_pair(ccx, l, r)?;
            Ok(RExpr::new(
                RKind::Eq { lhs: Box::new(l), rhs: Box::new(r) },
                ccx.cx.types.bool_type(),
                span,
            ))
        }
        ExprKind::Arith { op, lhs, rhs } => {
            let l = construct_expected(
                ccx,
                lhs,
                Expected::Pred(is_integral, "an integer type"),
                None,
                true,
            )?;
            let r = construct_expected(
                ccx,
                rhs,
                Expected::Pred(is_integral, "an integer type"),
                None,
                true,
            )?;
            let big = ccx.cx.types.big_int_type();
            let (l, r, ty) = if l.ty == r.ty {
                let ty = l.ty;
                (l, r, ty)
            } else {
                // one side is a machine integer, promote it
                let promote = |e: RExpr| {
                    RExpr::new(RKind::ToBig { operand: Box::new(e) }, big, span).skippable()
                };
                if l.ty == big {
                    (l, promote(r), big)
                } else {
                    (promote(l), r, big)
                }
            };
            let node = RExpr::new(
                RKind::Arith { op, lhs: Box::new(l), rhs: Box::new(r) },
                ty,
                span,
            );
            Ok(materialize(ccx, node, "arith_result"))
        }
        ExprKind::ArrayLit { elements } => construct_array(ccx, &elements, span),
        ExprKind::Bind { dynvar, value, body } => construct_bind(ccx, dynvar, value, body, span),
        ExprKind::RaiseError { ty, message } => {
            Ok(RExpr::new(RKind::ErrorRaise { message }, ty, span).skippable())
        }
        ExprKind::EnvGet { receiver, symbol } => {
            let recv = construct_expected(
                ccx,
                receiver,
                Expected::Pred(|t, ty| t.is_node(ty), "a bare node"),
                None,
                true,
            )?;
            let expected = Expected::Type(ccx.cx.types.symbol_type());
            let sym = construct_expected(ccx, symbol, expected, None, true)?;
            ccx.uses_envs = true;
            ccx.uses_entity_info = true;
            let root = root_node(ccx, &recv);
            let elem = ccx.cx.types.entity_of(root);
            let ty = ccx.cx.types.array_of(elem);
            let node = RExpr::new(
                RKind::EnvGet { receiver: Box::new(recv), symbol: Box::new(sym) },
                ty,
                span,
            );
            Ok(materialize(ccx, node, "env_result"))
        }
        ExprKind::Solve { equation } => {
            let expected = Expected::Type(ccx.cx.types.equation_type());
            let eq = construct_expected(ccx, equation, expected, None, true)?;
            ccx.saw_solver = true;
            Ok(RExpr::new(
                RKind::Solve { equation: Box::new(eq) },
                ccx.cx.types.bool_type(),
                span,
            ))
        }
        ExprKind::LogicVal { var } => {
            let expected = Expected::Type(ccx.cx.types.logic_var_type());
            let v = construct_expected(ccx, var, expected, None, true)?;
            ccx.saw_logic_extract = true;
            let root = *ccx.cx.types.ancestors(ccx.self_type).last().unwrap_or(&ccx.self_type);
            let ty = ccx.cx.types.entity_of(root);
            Ok(RExpr::new(RKind::LogicVal { var: Box::new(v) }, ty, span))
        }
    }
}

/// Resolve `expr` and check the result against an expected type or
/// predicate. With an expected type, a strictly narrower resolved type is
/// wrapped in a view conversion when `downcast` is set; a non-matching one
/// is a `TypeMismatch` carrying `custom_msg` when provided.
pub fn construct_expected(
    ccx: &mut ConstructCx<'_>,
    expr: ExprId,
    expected: Expected,
    custom_msg: Option<&str>,
    downcast: bool,
) -> CResult<RExpr> {
    let r = construct(ccx, expr)?;
    let span = r.span;
    match expected {
        Expected::Type(t) => {
            if !ccx.cx.types.matches(r.ty, t) {
                let msg = custom_msg.map(str::to_owned).unwrap_or_else(|| {
                    format!(
                        "expected {}, got {}",
                        ccx.cx.types.display(t),
                        ccx.cx.types.display(r.ty)
                    )
                });
                return Err(ccx.cx.sink.fatal(DiagKind::TypeMismatch, span, msg));
            }
            if r.ty != t && downcast {
                return Ok(RExpr::new(RKind::Cast { operand: Box::new(r) }, t, span).skippable());
            }
            Ok(r)
        }
        Expected::Pred(pred, what) => {
            if !pred(&ccx.cx.types, r.ty) {
                let msg = custom_msg.map(str::to_owned).unwrap_or_else(|| {
                    format!("expected {what}, got {}", ccx.cx.types.display(r.ty))
                });
                return Err(ccx.cx.sink.fatal(DiagKind::TypeMismatch, span, msg));
            }
            Ok(r)
        }
    }
}

/// Least common compatible type of two resolved expressions. The side
/// whose type is narrower than the common one is wrapped in a view
/// conversion.
pub fn unify_pair(
    ccx: &mut ConstructCx<'_>,
    a: RExpr,
    b: RExpr,
) -> CResult<(RExpr, RExpr, TypeId)> {
    let Some(ty) = ccx.cx.types.unify(a.ty, b.ty) else {
        return Err(ccx.cx.sink.fatal(
            DiagKind::TypeMismatch,
            b.span,
            format!(
                "no common type between {} and {}",
                ccx.cx.types.display(a.ty),
                ccx.cx.types.display(b.ty)
            ),
        ));
    };
    let widen = |e: RExpr| {
        if e.ty == ty {
            e
        } else {
            let span = e.span;
            RExpr::new(RKind::Cast { operand: Box::new(e) }, ty, span).skippable()
        }
    };
    Ok((widen(a), widen(b), ty))
}

/// Resolve an expression that must be a compile-time constant (used for
/// argument and dynamic-variable defaults).
pub fn construct_compile_time_known(ccx: &mut ConstructCx<'_>, expr: ExprId) -> CResult<ConstVal> {
    let r = construct(ccx, expr)?;
    match &r.kind {
        RKind::Lit { text } => Ok(ConstVal {
            ty: r.ty,
            text: text.clone(),
            dump: r.ir_dump(&ccx.slots),
        }),
        RKind::NullVal => Ok(ConstVal {
            ty: r.ty,
            text: format!("No_{}", ccx.cx.types.display(r.ty)),
            dump: r.ir_dump(&ccx.slots),
        }),
        _ => Err(ccx.cx.sink.fatal(
            DiagKind::InvalidExpression,
            r.span,
            "default values must be compile-time constants",
        )),
    }
}

// ── Kind-specific lowering ─────────────────────────────────────────────

fn construct_lit(ccx: &mut ConstructCx<'_>, lit: Lit, span: fable_common::Span) -> CResult<RExpr> {
    let types = &ccx.cx.types;
    Ok(match lit {
        Lit::Bool(v) => RExpr::new(
            RKind::Lit { text: if v { "True".into() } else { "False".into() } },
            types.bool_type(),
            span,
        ),
        Lit::Int(v) => RExpr::new(RKind::Lit { text: v.to_string() }, types.int_type(), span),
        Lit::Char(v) => {
            RExpr::new(RKind::Lit { text: format!("'{v}'") }, types.char_type(), span)
        }
        Lit::BigInt(digits) => {
            let node = RExpr::new(RKind::BigIntLit { digits }, types.big_int_type(), span);
            materialize(ccx, node, "big_int_lit")
        }
        Lit::Str(value) => {
            let node = RExpr::new(RKind::StrLit { value }, types.string_type(), span);
            materialize(ccx, node, "str_lit")
        }
        Lit::Sym(value) => RExpr::new(RKind::SymLit { value }, types.symbol_type(), span),
    })
}

fn construct_enum_lit(
    ccx: &mut ConstructCx<'_>,
    ty: TypeId,
    variant: Name,
    span: fable_common::Span,
) -> CResult<RExpr> {
    let valid = matches!(
        &ccx.cx.types.info(ty).kind,
        fable_types::TypeKind::Enum { variants } if variants.contains(&variant)
    );
    if !valid {
        return Err(ccx.cx.sink.fatal(
            DiagKind::InvalidExpression,
            span,
            format!(
                "no value {variant} in enum type {}",
                ccx.cx.types.display(ty)
            ),
        ));
    }
    let text = format!(
        "{}_{}",
        ccx.cx.types.display(ty),
        variant.camel_with_underscores()
    );
    Ok(RExpr::new(RKind::Lit { text }, ty, span))
}

/// View conversion to a named type. Both upcasts and downcasts are
/// accepted; conversion between unrelated types is a `TypeMismatch`.
fn construct_cast(
    ccx: &mut ConstructCx<'_>,
    operand: ExprId,
    target: &Name,
    span: fable_common::Span,
) -> CResult<RExpr> {
    let r = construct(ccx, operand)?;
    let Some(t) = ccx.cx.types.lookup(target) else {
        return Err(ccx.cx.sink.fatal(
            DiagKind::InvalidExpression,
            span,
            format!("unknown type {target}"),
        ));
    };
    if !ccx.cx.types.matches(r.ty, t) && !ccx.cx.types.matches(t, r.ty) {
        return Err(ccx.cx.sink.fatal(
            DiagKind::TypeMismatch,
            span,
            format!(
                "cannot convert {} to {}",
                ccx.cx.types.display(r.ty),
                ccx.cx.types.display(t)
            ),
        ));
    }
    if r.ty == t {
        return Ok(r);
    }
    Ok(RExpr::new(RKind::Cast { operand: Box::new(r) }, t, span).skippable())
}

fn construct_ref(ccx: &mut ConstructCx<'_>, var: VarId, span: fable_common::Span) -> CResult<RExpr> {
    if let VarKind::DynVar(dv) = ccx.pool.var(var).kind {
        // references to a dynamic variable resolve to its innermost binding
        let Some(slot) = ccx.dynvar_binding(dv) else {
            return Err(ccx.cx.sink.fatal(
                DiagKind::UnboundDynamicVariable,
                span,
                format!(
                    "dynamic variable {} is not bound in this context",
                    ccx.cx.dynvars.name(dv)
                ),
            ));
        };
        let name = ccx.slots.codegen_name(slot).clone();
        let ty = ccx.cx.dynvars.ty(dv);
        return Ok(RExpr::var(slot, &name, ty, span));
    }
    let Some(slot) = ccx.slot_of(var) else {
        return Err(ccx.cx.sink.fatal(
            DiagKind::InvalidExpression,
            span,
            format!("variable {} is not bound in this context", ccx.pool.var(var).name),
        ));
    };
    let name = ccx.slots.codegen_name(slot).clone();
    let ty = ccx.slots.slot(slot).ty.unwrap_or_else(|| {
        panic!("slot {name} referenced before its type is known")
    });
    Ok(RExpr::var(slot, &name, ty, span))
}

fn construct_node_like(ccx: &mut ConstructCx<'_>, expr: ExprId) -> CResult<RExpr> {
    construct_expected(ccx, expr, Expected::Pred(is_node_like, "a node or entity"), None, true)
}

fn node_of(ccx: &ConstructCx<'_>, r: &RExpr) -> TypeId {
    ccx.cx
        .types
        .node_of(r.ty)
        .unwrap_or_else(|| panic!("node-like expression with a non-node type"))
}

fn root_node(ccx: &ConstructCx<'_>, r: &RExpr) -> TypeId {
    let node = node_of(ccx, r);
    *ccx.cx.types.ancestors(node).last().unwrap_or(&node)
}

fn construct_field_access(
    ccx: &mut ConstructCx<'_>,
    receiver: ExprId,
    field: &Name,
    span: fable_common::Span,
) -> CResult<RExpr> {
    let recv = construct_node_like(ccx, receiver)?;
    let node = node_of(ccx, &recv);
    if let Some(field_ty) = ccx.cx.types.field_of(node, field) {
        // accessing a node-typed field through an entity keeps the entity
        // resolution context
        let ty = if ccx.cx.types.is_entity(recv.ty) && ccx.cx.types.is_node(field_ty) {
            ccx.cx.types.entity_of(field_ty)
        } else {
            field_ty
        };
        let null_check = ccx.cx.types.null_allowed(recv.ty);
        let access = RExpr::new(
            RKind::Field { receiver: Box::new(recv), field: field.clone(), null_check },
            ty,
            span,
        );
        return Ok(materialize(ccx, access, "field_result"));
    }
    if let Some(pid) = ccx.cx.props.lookup(&ccx.cx.types, node, field) {
        return construct_call(ccx, span, pid, recv, &[]);
    }
    Err(ccx.cx.sink.fatal(
        DiagKind::InvalidExpression,
        span,
        format!(
            "no field or property named {field} on type {}",
            ccx.cx.types.display(node)
        ),
    ))
}

fn construct_call(
    ccx: &mut ConstructCx<'_>,
    span: fable_common::Span,
    callee: crate::prop::PropId,
    recv: RExpr,
    args: &[ExprId],
) -> CResult<RExpr> {
    let ret = prop::ensure_typed(ccx.cx, callee)?;
    let natural: Vec<_> = ccx.cx.props.def(callee).natural_args().cloned().collect();
    if args.len() != natural.len() {
        return Err(ccx.cx.sink.fatal(
            DiagKind::InvalidExpression,
            span,
            format!(
                "property {} takes {} arguments, got {}",
                ccx.cx.props.def(callee).name,
                natural.len(),
                args.len()
            ),
        ));
    }
    let mut actuals = Vec::with_capacity(args.len());
    for (arg, spec) in args.iter().zip(&natural) {
        actuals.push(construct_expected(ccx, *arg, Expected::Type(spec.ty), None, true)?);
    }

    // every dynamic variable the callee accepts must be available here
    let dyn_specs: Vec<_> = ccx.cx.props.def(callee).dynamic_vars.clone();
    for (dv, default) in dyn_specs {
        if let Some(slot) = ccx.dynvar_binding(dv) {
            let name = ccx.slots.codegen_name(slot).clone();
            let ty = ccx.cx.dynvars.ty(dv);
            actuals.push(RExpr::var(slot, &name, ty, span));
        } else if let Some(c) = default {
            actuals.push(RExpr::new(RKind::Lit { text: c.text }, c.ty, span));
        } else {
            return Err(ccx.cx.sink.fatal(
                DiagKind::UnboundDynamicVariable,
                span,
                format!(
                    "in this call, dynamic variable {} is not bound and has no default",
                    ccx.cx.dynvars.name(dv)
                ),
            ));
        }
    }

    // the receiver is mentioned twice (null check, first actual)
    let recv = save(ccx, recv, "saved");
    let callee_name = ccx.cx.props.def(callee).name.clone();
    let node = RExpr::new(
        RKind::Call { prop: callee, callee: callee_name, receiver: Box::new(recv), args: actuals },
        ret,
        span,
    );
    Ok(materialize(ccx, node, "call_result"))
}

fn construct_then(
    ccx: &mut ConstructCx<'_>,
    base: ExprId,
    var: VarId,
    then_expr: ExprId,
    default: Option<ExprId>,
    span: fable_common::Span,
) -> CResult<RExpr> {
    let base_r = construct_expected(
        ccx,
        base,
        Expected::Pred(|t, ty| t.null_allowed(ty), "a nullable-typed expression"),
        None,
        true,
    )?;
    // the guard tests the base and then reads it into the bound variable
    let base_r = save(ccx, base_r, "saved");
    let base_ty = base_r.ty;
    let (scope, inner) = ccx.in_child_scope(|ccx| {
        let var_name = ccx.pool.var(var).name.clone();
        let var_slot = ccx.slots.create(&var_name, Some(base_ty));
        ccx.bind_var(var, var_slot);
        let then = construct(ccx, then_expr)?;
        let default_r = match default {
            Some(d) => Some(construct(ccx, d)?),
            None => None,
        };
        Ok((var_slot, then, default_r))
    });
    let (var_slot, then, default_r) = inner?;
    let (then, default_r, ty) = match default_r {
        Some(d) => {
            let (t, d, ty) = unify_pair(ccx, then, d)?;
            (t, d, ty)
        }
        None => {
            if !ccx.cx.types.null_allowed(then.ty) {
                return Err(ccx.cx.sink.fatal(
                    DiagKind::TypeMismatch,
                    span,
                    format!(
                        "then-guard has no default and type {} has no null value",
                        ccx.cx.types.display(then.ty)
                    ),
                ));
            }
            let ty = then.ty;
            (then, RExpr::new(RKind::NullVal, ty, span), ty)
        }
    };
    let slot = ccx.slots.create(&Name::from_lower("then_result"), Some(ty));
    Ok(RExpr::new(
        RKind::Then {
            scope,
            base: Box::new(base_r),
            var_slot,
            then: Box::new(then),
            default: Box::new(default_r),
        },
        ty,
        span,
    )
    .with_slot(slot))
}

fn construct_let(
    ccx: &mut ConstructCx<'_>,
    bindings: &[(VarId, ExprId)],
    body: ExprId,
    span: fable_common::Span,
) -> CResult<RExpr> {
    let (scope, inner) = ccx.in_child_scope(|ccx| {
        let mut resolved = Vec::with_capacity(bindings.len());
        for &(var, init) in bindings {
            // left-to-right: earlier bindings are visible here already
            let init_r = construct(ccx, init)?;
            let slot = match ccx.pool.var(var).kind {
                VarKind::Local { ignored: true } => ccx.slots.create_ignored(Some(init_r.ty)),
                _ => {
                    let name = ccx.pool.var(var).name.clone();
                    ccx.slots.create(&name, Some(init_r.ty))
                }
            };
            ccx.bind_var(var, slot);
            resolved.push((var, slot, init_r));
        }
        let body_r = construct(ccx, body)?;
        Ok((resolved, body_r))
    });
    let (resolved, body_r) = inner?;

    warn_unused_let_bindings(ccx, &resolved, &body_r);

    let ty = body_r.ty;
    let node = RExpr::new(
        RKind::Let {
            scope,
            bindings: resolved.into_iter().map(|(_, slot, init)| (slot, init)).collect(),
            body: Box::new(body_r),
        },
        ty,
        span,
    );
    Ok(materialize(ccx, node, "let_result"))
}

fn warn_unused_let_bindings(
    ccx: &mut ConstructCx<'_>,
    resolved: &[(VarId, crate::scope::SlotId, RExpr)],
    body: &RExpr,
) {
    if !ccx.cx.warnings.unused_bindings
        || !ccx.cx.props.warn_on_unused(&ccx.cx.types, ccx.prop)
    {
        return;
    }
    for (i, (var, slot, _)) in resolved.iter().enumerate() {
        let ignored = matches!(ccx.pool.var(*var).kind, VarKind::Local { ignored: true });
        let mut used = false;
        let mut check = |e: &RExpr| {
            e.walk(&mut |n| {
                if matches!(n.kind, RKind::Var { slot: s } if s == *slot) {
                    used = true;
                }
            })
        };
        for (_, _, later_init) in &resolved[i + 1..] {
            check(later_init);
        }
        check(body);
        if used == ignored {
            let name = ccx.pool.var(*var).name.clone();
            let msg = if ignored {
                format!("binding {name} is tagged as ignored but is used")
            } else {
                format!("binding {name} is never used")
            };
            ccx.cx.sink.warn(DiagKind::UnusedBinding, body.span, msg);
        }
    }
}

fn construct_try(
    ccx: &mut ConstructCx<'_>,
    expr: ExprId,
    fallback: Option<ExprId>,
    span: fable_common::Span,
) -> CResult<RExpr> {
    let primary = construct(ccx, expr)?;
    let (primary, fallback_r, ty) = match fallback {
        Some(f) => {
            let f = construct(ccx, f)?;
            unify_pair(ccx, primary, f)?
        }
        None => {
            if !ccx.cx.types.null_allowed(primary.ty) {
                return Err(ccx.cx.sink.fatal(
                    DiagKind::TypeMismatch,
                    span,
                    format!(
                        "try has no fallback and type {} has no null value",
                        ccx.cx.types.display(primary.ty)
                    ),
                ));
            }
            let ty = primary.ty;
            (primary, RExpr::new(RKind::NullVal, ty, span), ty)
        }
    };
    let slot = ccx.slots.create(&Name::from_lower("try_result"), Some(ty));
    Ok(RExpr::new(
        RKind::Try { primary: Box::new(primary), fallback: Box::new(fallback_r) },
        ty,
        span,
    )
    .with_slot(slot))
}

fn construct_bind(
    ccx: &mut ConstructCx<'_>,
    dynvar: crate::dynvar::DynVarId,
    value: ExprId,
    body: ExprId,
    span: fable_common::Span,
) -> CResult<RExpr> {
    let dv_ty = ccx.cx.dynvars.ty(dynvar);
    let value_r = construct_expected(ccx, value, Expected::Type(dv_ty), None, true)?;
    let dv_name = ccx.cx.dynvars.name(dynvar).clone();
    let slot = ccx.slots.create(&dv_name, Some(dv_ty));
    let body_r = ccx.with_dynvar_bound(dynvar, slot, |ccx| construct(ccx, body))?;

    if ccx.cx.warnings.unused_dynvar_bindings
        && !binding_is_used(&body_r, dynvar, slot, &ccx.cx.props)
    {
        ccx.cx.sink.emit(Diagnostic::new(
            DiagKind::UnusedBinding,
            span,
            format!("useless bind of dynamic variable {dv_name}"),
        ));
    }

    // The forward lives before the body in the rendered statement stream,
    // so the binding is visible to everything the body evaluates.
    let forward = RExpr::new(
        RKind::DynBind { dynvar, slot, value: Box::new(value_r) },
        dv_ty,
        span,
    )
    .with_slot(slot);
    let ty = body_r.ty;
    Ok(RExpr::new(
        RKind::Seq { first: Box::new(forward), second: Box::new(body_r) },
        ty,
        span,
    )
    .skippable())
}

fn construct_array(
    ccx: &mut ConstructCx<'_>,
    elements: &[ExprId],
    span: fable_common::Span,
) -> CResult<RExpr> {
    if elements.is_empty() {
        return Err(ccx.cx.sink.fatal(
            DiagKind::InvalidExpression,
            span,
            "cannot infer the element type of an empty array literal",
        ));
    }
    let mut resolved = Vec::with_capacity(elements.len());
    for &e in elements {
        resolved.push(construct(ccx, e)?);
    }
    // fold all elements to their least common type
    let mut elem_ty = resolved[0].ty;
    for e in &resolved[1..] {
        let Some(t) = ccx.cx.types.unify(elem_ty, e.ty) else {
            return Err(ccx.cx.sink.fatal(
                DiagKind::TypeMismatch,
                e.span,
                format!(
                    "array element of type {} does not fit with {}",
                    ccx.cx.types.display(e.ty),
                    ccx.cx.types.display(elem_ty)
                ),
            ));
        };
        elem_ty = t;
    }
    let resolved = resolved
        .into_iter()
        .map(|e| {
            if e.ty == elem_ty {
                e
            } else {
                let span = e.span;
                RExpr::new(RKind::Cast { operand: Box::new(e) }, elem_ty, span).skippable()
            }
        })
        .collect();
    let ty = ccx.cx.types.array_of(elem_ty);
    let node = RExpr::new(RKind::ArrayLit { elements: resolved }, ty, span);
    Ok(materialize(ccx, node, "array_lit"))
}

/// Give a ref-counted result a slot in the current scope unless it
/// already has one or ownership is taken over by the parent.
/// Wrap `r` in a save-to-slot node unless its reference is already a bare
/// name. Rendered code that mentions the value more than once (null checks,
/// guard conditions) then evaluates it exactly once.
fn save(ccx: &mut ConstructCx<'_>, r: RExpr, hint: &str) -> RExpr {
    if matches!(r.kind, RKind::Var { .. }) || r.slot.is_some() {
        return r;
    }
    let ty = r.ty;
    let span = r.span;
    let slot = ccx.slots.create(&Name::from_lower(hint), Some(ty));
    RExpr::new(RKind::Saved { operand: Box::new(r) }, ty, span).with_slot(slot)
}

fn materialize(ccx: &mut ConstructCx<'_>, mut r: RExpr, hint: &str) -> RExpr {
    if ccx.cx.types.is_refcounted(r.ty) && r.slot.is_none() && !r.skippable {
        let slot = ccx.slots.create(&Name::from_lower(hint), Some(r.ty));
        r = r.with_slot(slot);
    }
    r
}
