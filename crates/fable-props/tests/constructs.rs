//! End-to-end tests for expression construction: declared trees go
//! through preparation and typing, and the rendered output is checked
//! for the expected block structure.

use fable_common::Span;
use fable_props::expr::{ArithOp, Sugar};
use fable_props::prop::{self, PropertyBuilder, PropId};
use fable_props::{CompileCtx, DiagKind, ExprId};
use fable_types::{TypeId, TypeRegistry};

// ── Helpers ────────────────────────────────────────────────────────────

fn sp() -> Span {
    Span::synthetic()
}

fn ctx() -> CompileCtx {
    CompileCtx::new(TypeRegistry::with_builtins())
}

/// Declare a property on `owner` whose body is produced by `build`.
fn prop_with(
    cx: &mut CompileCtx,
    owner: TypeId,
    name: &str,
    build: impl FnOnce(&mut CompileCtx, &mut PropertyBuilder) -> ExprId,
) -> PropId {
    let mut b = PropertyBuilder::new(owner, name);
    let body = build(cx, &mut b);
    b.body(body);
    cx.props.declare(b)
}

fn kinds(cx: &CompileCtx) -> Vec<DiagKind> {
    cx.sink.diagnostics().iter().map(|d| d.kind).collect()
}

// ── Let ────────────────────────────────────────────────────────────────

#[test]
fn let_bindings_resolve_in_order() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let p = prop_with(&mut cx, node, "sum", |_, b| {
        let a = b.pool.local("a");
        let bv = b.pool.local("b");
        let one = b.pool.int_lit(sp(), 1);
        let a_ref = b.pool.var_ref(sp(), a);
        let one_more = b.pool.int_lit(sp(), 1);
        let add = b.pool.arith(sp(), ArithOp::Add, a_ref, one_more);
        let b_ref = b.pool.var_ref(sp(), bv);
        b.pool.let_expr(sp(), vec![(a, one), (bv, add)], b_ref)
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, cx.types.int_type());
    let text = prop::render_property(&mut cx, p).unwrap();
    let a_pos = text.find("A := 1;").unwrap();
    let b_pos = text.find("B := (A + 1);").unwrap();
    assert!(a_pos < b_pos);
    assert!(text.contains("return B"));
    assert!(!cx.sink.has_errors());
}

#[test]
fn let_rebinding_a_name_gets_a_fresh_slot() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let p = prop_with(&mut cx, node, "shadow", |_, b| {
        let outer = b.pool.local("a");
        let inner = b.pool.local("a");
        let one = b.pool.int_lit(sp(), 1);
        let outer_ref = b.pool.var_ref(sp(), outer);
        let one_more = b.pool.int_lit(sp(), 1);
        let add = b.pool.arith(sp(), ArithOp::Add, outer_ref, one_more);
        let inner_ref = b.pool.var_ref(sp(), inner);
        let inner_let = b.pool.let_expr(sp(), vec![(inner, add)], inner_ref);
        b.pool.let_expr(sp(), vec![(outer, one)], inner_let)
    });
    prop::ensure_typed(&mut cx, p).unwrap();
    let text = prop::render_property(&mut cx, p).unwrap();
    // the two bindings must not share storage
    assert!(text.contains("A := 1;"));
    assert!(text.contains("A_2 := (A + 1);"));
    assert!(text.contains("return A_2"));
}

// ── Try ────────────────────────────────────────────────────────────────

#[test]
fn try_without_fallback_on_int_is_a_type_mismatch() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let p = prop_with(&mut cx, node, "guess", |_, b| {
        let v = b.pool.int_lit(sp(), 7);
        b.pool.try_expr(sp(), v, None)
    });
    assert!(prop::ensure_typed(&mut cx, p).is_err());
    assert_eq!(kinds(&cx), vec![DiagKind::TypeMismatch]);
}

#[test]
fn try_with_fallback_renders_an_exception_handler() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let p = prop_with(&mut cx, node, "guess", |_, b| {
        let v = b.pool.int_lit(sp(), 7);
        let f = b.pool.int_lit(sp(), 0);
        b.pool.try_expr(sp(), v, Some(f))
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, cx.types.int_type());
    let text = prop::render_property(&mut cx, p).unwrap();
    assert!(text.contains("exception"));
    assert!(text.contains("when Property_Error =>"));
    assert!(text.contains("Try_Result := 7;"));
    assert!(text.contains("Try_Result := 0;"));
}

#[test]
fn try_on_a_nullable_type_defaults_to_null() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let p = prop_with(&mut cx, node, "guess", |_, b| {
        let this = b.self_var();
        let this_ref = b.pool.var_ref(sp(), this);
        b.pool.try_expr(sp(), this_ref, None)
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, node);
    let text = prop::render_property(&mut cx, p).unwrap();
    assert!(text.contains("Try_Result := No_Expr;"));
}

// ── Guarded access ─────────────────────────────────────────────────────

#[test]
fn guarded_access_expands_to_a_null_checking_block() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    cx.types.add_field(node, "parent", node);
    let p = prop_with(&mut cx, node, "up", |_, b| {
        let this = b.self_var();
        let this_ref = b.pool.var_ref(sp(), this);
        let guarded = b.pool.guarded(sp(), this_ref);
        b.pool.field_access(sp(), guarded, "parent")
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, node);
    let text = prop::render_property(&mut cx, p).unwrap();
    assert!(text.contains("if Self /= No_Expr then"));
    assert!(text.contains("Var_Expr := Self;"));
    assert!(text.contains("Then_Result := No_Expr;"));
    assert!(!cx.sink.has_errors());
}

#[test]
fn chained_guarded_access_hoists_the_whole_chain() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    cx.types.add_field(node, "parent", node);
    let p = prop_with(&mut cx, node, "up_two", |_, b| {
        let this = b.self_var();
        let this_ref = b.pool.var_ref(sp(), this);
        let guarded = b.pool.guarded(sp(), this_ref);
        let first = b.pool.field_access(sp(), guarded, "parent");
        b.pool.field_access(sp(), first, "parent")
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, node);
    let text = prop::render_property(&mut cx, p).unwrap();
    // both accesses live inside the guard, so the guarded branch chains
    // through the bound variable
    assert!(text.contains("Var_Expr := Self;"));
    assert!(text.contains("Var_Expr.Parent.Parent"));
}

// ── Arrays and arithmetic ──────────────────────────────────────────────

#[test]
fn array_literal_unifies_element_types() {
    let mut cx = ctx();
    let base = cx.types.declare_node("expr", None, false);
    let lit = cx.types.declare_node("literal", Some(base), false);
    let bin = cx.types.declare_node("bin_op", Some(base), false);
    cx.types.add_field(base, "lhs", lit);
    cx.types.add_field(base, "rhs", bin);
    let p = prop_with(&mut cx, base, "operands", |_, b| {
        let this = b.self_var();
        let this_ref = b.pool.var_ref(sp(), this);
        let lhs = b.pool.field_access(sp(), this_ref, "lhs");
        let rhs = b.pool.field_access(sp(), this_ref, "rhs");
        b.pool.array_lit(sp(), vec![lhs, rhs])
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, cx.types.array_of(base));
    let text = prop::render_property(&mut cx, p).unwrap();
    // arrays are ref-counted, so the literal gets a slot and an Inc_Ref
    assert!(text.contains("Inc_Ref (Array_Lit);"));
}

#[test]
fn empty_array_literal_is_rejected() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let p = prop_with(&mut cx, node, "nothing", |_, b| b.pool.array_lit(sp(), vec![]));
    assert!(prop::ensure_typed(&mut cx, p).is_err());
    assert_eq!(kinds(&cx), vec![DiagKind::InvalidExpression]);
}

#[test]
fn mixed_arithmetic_promotes_to_big_integers() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let p = prop_with(&mut cx, node, "total", |_, b| {
        let small = b.pool.int_lit(sp(), 4);
        let big = b.pool.big_int_lit(sp(), "123456789012345678901234567890");
        b.pool.arith(sp(), ArithOp::Add, small, big)
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, cx.types.big_int_type());
    let text = prop::render_property(&mut cx, p).unwrap();
    assert!(text.contains("To_Big_Integer (4)"));
    assert!(text.contains("Create_Big_Integer (\"123456789012345678901234567890\")"));
    // big integers are ref-counted
    assert!(text.contains("Inc_Ref (Arith_Result);"));
}

// ── Conditionals and null values ───────────────────────────────────────

#[test]
fn if_branches_unify_to_their_common_ancestor() {
    let mut cx = ctx();
    let base = cx.types.declare_node("expr", None, false);
    let lit = cx.types.declare_node("literal", Some(base), false);
    let bin = cx.types.declare_node("bin_op", Some(base), false);
    cx.types.add_field(base, "lhs", lit);
    cx.types.add_field(base, "rhs", bin);
    let p = prop_with(&mut cx, base, "pick", |_, b| {
        let this = b.self_var();
        let this_ref = b.pool.var_ref(sp(), this);
        let cond = b.pool.bool_lit(sp(), true);
        let lhs = b.pool.field_access(sp(), this_ref, "lhs");
        let rhs = b.pool.field_access(sp(), this_ref, "rhs");
        b.pool.if_expr(sp(), cond, lhs, rhs)
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, base);
    let text = prop::render_property(&mut cx, p).unwrap();
    assert!(text.contains("if True then"));
    assert!(text.contains("return If_Result"));
}

#[test]
fn null_value_of_a_scalar_type_is_rejected() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let p = prop_with(&mut cx, node, "nothing", |cx, b| {
        let int = cx.types.int_type();
        b.pool.no_val(sp(), int)
    });
    assert!(prop::ensure_typed(&mut cx, p).is_err());
    assert_eq!(kinds(&cx), vec![DiagKind::TypeMismatch]);
}

#[test]
fn equality_of_unrelated_node_types_still_unifies_through_the_root() {
    let mut cx = ctx();
    let base = cx.types.declare_node("expr", None, false);
    let lit = cx.types.declare_node("literal", Some(base), false);
    let bin = cx.types.declare_node("bin_op", Some(base), false);
    cx.types.add_field(base, "lhs", lit);
    cx.types.add_field(base, "rhs", bin);
    let p = prop_with(&mut cx, base, "same", |_, b| {
        let this = b.self_var();
        let this_ref = b.pool.var_ref(sp(), this);
        let lhs = b.pool.field_access(sp(), this_ref, "lhs");
        let rhs = b.pool.field_access(sp(), this_ref, "rhs");
        b.pool.eq(sp(), lhs, rhs)
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, cx.types.bool_type());
}

#[test]
fn enum_literal_renders_as_a_qualified_constant() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let color = cx.types.declare_enum("color", &["red", "green", "blue"]);
    let p = prop_with(&mut cx, node, "tint", |_, b| b.pool.enum_val(sp(), color, "green"));
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, color);
    let text = prop::render_property(&mut cx, p).unwrap();
    assert!(text.contains("return Color_Green"));
}

#[test]
fn raise_error_adopts_the_surrounding_type() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let p = prop_with(&mut cx, node, "fail", |cx, b| {
        let int = cx.types.int_type();
        b.pool.raise_error(sp(), int, "not implemented")
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, cx.types.int_type());
    let text = prop::render_property(&mut cx, p).unwrap();
    assert!(text.contains("(raise Property_Error with \"not implemented\")"));
}

// ── Casts ──────────────────────────────────────────────────────────────

#[test]
fn cast_through_a_deferred_type_name_narrows() {
    let mut cx = ctx();
    let base = cx.types.declare_node("expr", None, false);
    cx.types.declare_node("call_expr", Some(base), false);
    let p = prop_with(&mut cx, base, "as_call", |cx, b| {
        let this = b.self_var();
        let this_ref = b.pool.var_ref(sp(), this);
        let target = b
            .pool
            .coerce(Sugar::TypeHandle("call_expr".to_owned()), sp())
            .unwrap();
        cx.attrs.build(&mut b.pool, sp(), this_ref, "cast", &[target]).unwrap()
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, cx.types.lookup(&fable_common::Name::from_lower("call_expr")).unwrap());
    let text = prop::render_property(&mut cx, p).unwrap();
    assert!(text.contains("Call_Expr (Self)"));
    assert!(!cx.sink.has_errors());
}

#[test]
fn cast_to_an_unknown_type_is_rejected() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let p = prop_with(&mut cx, node, "oops", |_, b| {
        let this = b.self_var();
        let this_ref = b.pool.var_ref(sp(), this);
        b.pool.cast_to(sp(), this_ref, "statement")
    });
    assert!(prop::ensure_typed(&mut cx, p).is_err());
    assert_eq!(kinds(&cx), vec![DiagKind::InvalidExpression]);
    assert!(cx.sink.diagnostics()[0].message.contains("unknown type statement"));
}

#[test]
fn cast_between_unrelated_types_is_a_type_mismatch() {
    let mut cx = ctx();
    let expr = cx.types.declare_node("expr", None, false);
    cx.types.declare_node("decl", None, false);
    let p = prop_with(&mut cx, expr, "confused", |_, b| {
        let this = b.self_var();
        let this_ref = b.pool.var_ref(sp(), this);
        b.pool.cast_to(sp(), this_ref, "decl")
    });
    assert!(prop::ensure_typed(&mut cx, p).is_err());
    assert_eq!(kinds(&cx), vec![DiagKind::TypeMismatch]);
}

// ── Ref-count balance ──────────────────────────────────────────────────

#[test]
fn aliased_string_bindings_balance_their_ref_counts() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let string = cx.types.string_type();
    cx.types.add_field(node, "text", string);
    let p = prop_with(&mut cx, node, "label", |_, b| {
        let a = b.pool.local("a");
        let bv = b.pool.local("b");
        let this = b.self_var();
        let this_ref = b.pool.var_ref(sp(), this);
        let text = b.pool.field_access(sp(), this_ref, "text");
        let a_ref = b.pool.var_ref(sp(), a);
        let b_ref = b.pool.var_ref(sp(), bv);
        b.pool.let_expr(sp(), vec![(a, text), (bv, a_ref)], b_ref)
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, cx.types.string_type());
    let text = prop::render_property(&mut cx, p).unwrap();
    // every slot that aliases a ref-counted value takes its own reference
    assert!(text.contains("A := Field_Result;\nInc_Ref (A);"));
    assert!(text.contains("B := A;\nInc_Ref (B);"));
    // the scope finalizer releases all but the property result
    let incs = text.matches("Inc_Ref").count();
    let decs = text.matches("Dec_Ref").count();
    assert_eq!(incs, decs + 1);
}

// ── Saved intermediates ────────────────────────────────────────────────

#[test]
fn compound_call_receiver_is_evaluated_once() {
    let mut cx = ctx();
    let base = cx.types.declare_node("expr", None, false);
    let call_t = cx.types.declare_node("call_expr", Some(base), false);
    let int = cx.types.int_type();
    let mut c = PropertyBuilder::new(call_t, "depth");
    c.returns(int);
    c.external();
    cx.props.declare(c);
    let p = prop_with(&mut cx, base, "deep", |_, b| {
        let this = b.self_var();
        let this_ref = b.pool.var_ref(sp(), this);
        let narrowed = b.pool.cast_to(sp(), this_ref, "call_expr");
        b.pool.call(sp(), narrowed, "depth", vec![])
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, int);
    let text = prop::render_property(&mut cx, p).unwrap();
    // the conversion runs once, then the saved slot feeds both the null
    // check and the actual
    assert!(text.contains("Saved := Call_Expr (Self);"));
    assert!(text.contains("if Saved = No_Call_Expr then"));
    assert!(text.contains("Depth (Saved)"));
    assert_eq!(text.matches("Call_Expr (Self)").count(), 1);
}

// ── Character literals ─────────────────────────────────────────────────

#[test]
fn character_literal_types_and_renders() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let p = prop_with(&mut cx, node, "sep", |_, b| {
        b.pool.coerce(Sugar::Char(','), sp()).unwrap()
    });
    let ty = prop::ensure_typed(&mut cx, p).unwrap();
    assert_eq!(ty, cx.types.char_type());
    let text = prop::render_property(&mut cx, p).unwrap();
    assert!(text.contains("return ','"));
}

#[test]
fn type_handle_in_value_position_is_rejected() {
    let mut cx = ctx();
    let node = cx.types.declare_node("expr", None, false);
    let p = prop_with(&mut cx, node, "bare", |_, b| b.pool.type_ref(sp(), "expr"));
    assert!(prop::ensure_typed(&mut cx, p).is_err());
    assert_eq!(kinds(&cx), vec![DiagKind::InvalidExpression]);
}
