//! Typed intermediate representation.
//!
//! A resolved expression knows its type, its operands, and optionally the
//! slot its value is materialized into. Rendering is a two-part contract:
//! [`RExpr::render_pre`] emits the preparatory statements and may run only
//! once per node (a second call panics, except on variable references,
//! which have no side effect); [`RExpr::render_expr`] afterwards yields a
//! pure reference to the value, either the inline expression text or the
//! bare slot name.
//!
//! Ref-counting discipline: a node whose result type is ref-counted must
//! either own a slot (so the scope machinery releases the value) or be
//! marked skippable (an enclosing node takes over ownership). This is
//! asserted at render time.

use fable_common::{Name, Span};
use fable_types::{TypeId, TypeRegistry};

use crate::dynvar::DynVarId;
use crate::expr::ArithOp;
use crate::prop::PropId;
use crate::scope::{ScopeId, SlotId, SlotPool};

#[derive(Debug)]
pub enum RKind {
    /// Reference to a slot. Render-idempotent.
    Var { slot: SlotId },
    /// Inline literal text: booleans, integers, enum values.
    Lit { text: String },
    BigIntLit { digits: String },
    StrLit { value: String },
    SymLit { value: String },
    /// Null value of the node's type.
    NullVal,
    ArrayLit { elements: Vec<RExpr> },
    /// Narrowing view conversion inserted by the resolver.
    Cast { operand: Box<RExpr> },
    /// Promotion of a machine integer to a big integer.
    ToBig { operand: Box<RExpr> },
    /// Explicit save-to-slot wrapper for values referenced more than once.
    Saved { operand: Box<RExpr> },
    Field { receiver: Box<RExpr>, field: Name, null_check: bool },
    Call { prop: PropId, callee: Name, receiver: Box<RExpr>, args: Vec<RExpr> },
    EnvGet { receiver: Box<RExpr>, symbol: Box<RExpr> },
    Solve { equation: Box<RExpr> },
    LogicVal { var: Box<RExpr> },
    Eq { lhs: Box<RExpr>, rhs: Box<RExpr> },
    Arith { op: ArithOp, lhs: Box<RExpr>, rhs: Box<RExpr> },
    Let { scope: ScopeId, bindings: Vec<(SlotId, RExpr)>, body: Box<RExpr> },
    Then {
        scope: ScopeId,
        base: Box<RExpr>,
        var_slot: SlotId,
        then: Box<RExpr>,
        default: Box<RExpr>,
    },
    Try { primary: Box<RExpr>, fallback: Box<RExpr> },
    If { cond: Box<RExpr>, then: Box<RExpr>, els: Box<RExpr> },
    /// Evaluate `first` for its statements only, then yield `second`.
    Seq { first: Box<RExpr>, second: Box<RExpr> },
    /// Forward a dynamic variable's value into its slot for the rest of
    /// the enclosing sequence.
    DynBind { dynvar: DynVarId, slot: SlotId, value: Box<RExpr> },
    ErrorRaise { message: String },
}

#[derive(Debug)]
pub struct RExpr {
    pub kind: RKind,
    pub ty: TypeId,
    pub span: Span,
    /// Result slot, when the value is materialized.
    pub slot: Option<SlotId>,
    /// Ownership of a ref-counted result is taken over by the parent.
    pub skippable: bool,
    rendered: bool,
    expr_text: String,
}

/// State threaded through one rendering of a property body.
pub struct RenderCx<'a> {
    pub slots: &'a SlotPool,
    pub types: &'a TypeRegistry,
    /// Emit trace annotations bracketing each node's evaluation.
    pub trace: bool,
    next_trace: u32,
}

impl<'a> RenderCx<'a> {
    pub fn new(slots: &'a SlotPool, types: &'a TypeRegistry) -> Self {
        Self { slots, types, trace: false, next_trace: 0 }
    }

    pub fn with_trace(mut self) -> Self {
        self.trace = true;
        self
    }

    fn next_trace_id(&mut self) -> u32 {
        self.next_trace += 1;
        self.next_trace
    }

    fn slot_name(&self, slot: SlotId) -> String {
        self.slots.codegen_name(slot).camel_with_underscores()
    }

    fn null_text(&self, ty: TypeId) -> String {
        format!("No_{}", self.types.display(ty))
    }

    /// Assignment into a slot. Storing a ref-counted value creates one
    /// more reference to it, which the owning scope's finalizer releases.
    fn assign(&self, slot: SlotId, value: &str) -> String {
        let mut out = format!("{} := {};\n", self.slot_name(slot), value);
        if matches!(self.slots.slot(slot).ty, Some(ty) if self.types.is_refcounted(ty)) {
            out.push_str(&format!("Inc_Ref ({});\n", self.slot_name(slot)));
        }
        out
    }

    /// Release statements for the ref-counted slots of a finished scope.
    fn finalize_scope(&self, scope: ScopeId) -> String {
        if !self.slots.scope_has_refcounted_slots(scope, self.types) {
            return String::new();
        }
        let mut out = String::new();
        for &slot in &self.slots.scope(scope).slots {
            if matches!(self.slots.slot(slot).ty, Some(ty) if self.types.is_refcounted(ty)) {
                out.push_str(&format!("Dec_Ref ({});\n", self.slot_name(slot)));
            }
        }
        out
    }
}

impl RExpr {
    pub fn new(kind: RKind, ty: TypeId, span: Span) -> Self {
        Self {
            kind,
            ty,
            span,
            slot: None,
            skippable: false,
            rendered: false,
            expr_text: String::new(),
        }
    }

    /// Variable reference. Its expression text is fixed at construction,
    /// making it render-idempotent.
    pub fn var(slot: SlotId, name: &Name, ty: TypeId, span: Span) -> Self {
        let mut e = Self::new(RKind::Var { slot }, ty, span);
        e.skippable = true;
        e.expr_text = name.camel_with_underscores();
        e
    }

    pub fn with_slot(mut self, slot: SlotId) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }

    fn is_var(&self) -> bool {
        matches!(self.kind, RKind::Var { .. })
    }

    /// Short tag for trace annotations and IR dumps.
    pub fn tag(&self) -> &'static str {
        match self.kind {
            RKind::Var { .. } => "var",
            RKind::Lit { .. } => "lit",
            RKind::BigIntLit { .. } => "big-int",
            RKind::StrLit { .. } => "str",
            RKind::SymLit { .. } => "sym",
            RKind::NullVal => "null",
            RKind::ArrayLit { .. } => "array",
            RKind::Cast { .. } => "cast",
            RKind::ToBig { .. } => "to-big",
            RKind::Saved { .. } => "saved",
            RKind::Field { .. } => "field",
            RKind::Call { .. } => "call",
            RKind::EnvGet { .. } => "env-get",
            RKind::Solve { .. } => "solve",
            RKind::LogicVal { .. } => "logic-val",
            RKind::Eq { .. } => "eq",
            RKind::Arith { .. } => "arith",
            RKind::Let { .. } => "let",
            RKind::Then { .. } => "then",
            RKind::Try { .. } => "try",
            RKind::If { .. } => "if",
            RKind::Seq { .. } => "seq",
            RKind::DynBind { .. } => "dyn-bind",
            RKind::ErrorRaise { .. } => "raise",
        }
    }

    /// Emit this node's preparatory statements. Panics on a second call
    /// for anything but a variable reference, and when a ref-counted
    /// result has neither a slot nor the skippable mark.
    pub fn render_pre(&mut self, cx: &mut RenderCx<'_>) -> String {
        if self.is_var() {
            return String::new();
        }
        assert!(!self.rendered, "typed IR node ({}) rendered twice", self.tag());
        self.rendered = true;
        assert!(
            !cx.types.is_refcounted(self.ty) || self.slot.is_some() || self.skippable,
            "ref-counted result of a {} node has no slot and is not skippable",
            self.tag()
        );

        let (mut pre, inline) = self.render_parts(cx);
        match (self.slot, inline) {
            (Some(slot), Some(text)) => {
                pre.push_str(&cx.assign(slot, &text));
                self.expr_text = cx.slot_name(slot);
            }
            (Some(slot), None) => self.expr_text = cx.slot_name(slot),
            (None, Some(text)) => self.expr_text = text,
            (None, None) => panic!("{} node produced no value reference", self.tag()),
        }

        if cx.trace {
            let id = cx.next_trace_id();
            format!("--# expr-start {id} '{}'\n{pre}--# expr-done {id}\n", self.tag())
        } else {
            pre
        }
    }

    /// Pure reference to the computed value. Valid once `render_pre` has
    /// run (immediately, for variable references).
    pub fn render_expr(&self) -> String {
        debug_assert!(
            !self.expr_text.is_empty(),
            "render_expr before render_pre on a {} node",
            self.tag()
        );
        self.expr_text.clone()
    }

    /// Kind-specific rendering: preparatory statements plus, when the
    /// value is not assigned internally, its inline expression text.
    fn render_parts(&mut self, cx: &mut RenderCx<'_>) -> (String, Option<String>) {
        match &mut self.kind {
            RKind::Var { slot } => (String::new(), Some(cx.slot_name(*slot))),
            RKind::Lit { text } => (String::new(), Some(text.clone())),
            RKind::BigIntLit { digits } => {
                (String::new(), Some(format!("Create_Big_Integer (\"{digits}\")")))
            }
            RKind::StrLit { value } => {
                (String::new(), Some(format!("Create_String (\"{value}\")")))
            }
            RKind::SymLit { value } => {
                (String::new(), Some(format!("Find_Symbol (\"{value}\")")))
            }
            RKind::NullVal => (String::new(), Some(cx.null_text(self.ty))),
            RKind::ArrayLit { elements } => {
                let mut pre = String::new();
                let mut items = Vec::new();
                for (i, e) in elements.iter_mut().enumerate() {
                    pre.push_str(&e.render_pre(cx));
                    items.push(format!("{} => {}", i + 1, e.render_expr()));
                }
                let inline = if items.is_empty() {
                    "New_Array (Items_Count => 0)".to_owned()
                } else {
                    format!("New_Array (({}))", items.join(", "))
                };
                (pre, Some(inline))
            }
            RKind::Cast { operand } => {
                let pre = operand.render_pre(cx);
                let inline = format!("{} ({})", cx.types.display(self.ty), operand.render_expr());
                (pre, Some(inline))
            }
            RKind::ToBig { operand } => {
                let pre = operand.render_pre(cx);
                let inline = format!("To_Big_Integer ({})", operand.render_expr());
                (pre, Some(inline))
            }
            RKind::Saved { operand } => {
                let pre = operand.render_pre(cx);
                (pre, Some(operand.render_expr()))
            }
            RKind::Field { receiver, field, null_check } => {
                let mut pre = receiver.render_pre(cx);
                if *null_check {
                    pre.push_str(&format!(
                        "if {} = {} then raise Property_Error with \"null receiver\"; end if;\n",
                        receiver.render_expr(),
                        cx.null_text(receiver.ty),
                    ));
                }
                let inline =
                    format!("{}.{}", receiver.render_expr(), field.camel_with_underscores());
                (pre, Some(inline))
            }
            RKind::Call { callee, receiver, args, .. } => {
                let mut pre = receiver.render_pre(cx);
                pre.push_str(&format!(
                    "if {} = {} then raise Property_Error with \"null receiver\"; end if;\n",
                    receiver.render_expr(),
                    cx.null_text(receiver.ty),
                ));
                let mut actuals = vec![receiver.render_expr()];
                for a in args.iter_mut() {
                    pre.push_str(&a.render_pre(cx));
                    actuals.push(a.render_expr());
                }
                let inline =
                    format!("{} ({})", callee.camel_with_underscores(), actuals.join(", "));
                (pre, Some(inline))
            }
            RKind::EnvGet { receiver, symbol } => {
                let mut pre = receiver.render_pre(cx);
                pre.push_str(&symbol.render_pre(cx));
                let inline = format!(
                    "AST_Envs.Get ({}.Self_Env, {})",
                    receiver.render_expr(),
                    symbol.render_expr()
                );
                (pre, Some(inline))
            }
            RKind::Solve { equation } => {
                let pre = equation.render_pre(cx);
                (pre, Some(format!("Solve ({})", equation.render_expr())))
            }
            RKind::LogicVal { var } => {
                let pre = var.render_pre(cx);
                (pre, Some(format!("Get_Value ({})", var.render_expr())))
            }
            RKind::Eq { lhs, rhs } => {
                let mut pre = lhs.render_pre(cx);
                pre.push_str(&rhs.render_pre(cx));
                (pre, Some(format!("{} = {}", lhs.render_expr(), rhs.render_expr())))
            }
            RKind::Arith { op, lhs, rhs } => {
                let mut pre = lhs.render_pre(cx);
                pre.push_str(&rhs.render_pre(cx));
                let inline = format!(
                    "({} {} {})",
                    lhs.render_expr(),
                    op.symbol(),
                    rhs.render_expr()
                );
                (pre, Some(inline))
            }
            RKind::Let { scope, bindings, body } => {
                let mut pre = String::new();
                for (slot, init) in bindings.iter_mut() {
                    pre.push_str(&init.render_pre(cx));
                    pre.push_str(&cx.assign(*slot, &init.render_expr()));
                }
                pre.push_str(&body.render_pre(cx));
                let result = body.render_expr();
                if let Some(out) = self.slot {
                    pre.push_str(&cx.assign(out, &result));
                    pre.push_str(&cx.finalize_scope(*scope));
                    (pre, None)
                } else {
                    pre.push_str(&cx.finalize_scope(*scope));
                    (pre, Some(result))
                }
            }
            RKind::Then { scope, base, var_slot, then, default } => {
                let out = self.slot.unwrap_or_else(|| panic!("then-guard needs a result slot"));
                let mut pre = base.render_pre(cx);
                pre.push_str(&format!(
                    "if {} /= {} then\n",
                    base.render_expr(),
                    cx.null_text(base.ty)
                ));
                pre.push_str(&cx.assign(*var_slot, &base.render_expr()));
                pre.push_str(&then.render_pre(cx));
                pre.push_str(&cx.assign(out, &then.render_expr()));
                pre.push_str("else\n");
                pre.push_str(&default.render_pre(cx));
                pre.push_str(&cx.assign(out, &default.render_expr()));
                pre.push_str("end if;\n");
                pre.push_str(&cx.finalize_scope(*scope));
                (pre, None)
            }
            RKind::Try { primary, fallback } => {
                let out = self.slot.unwrap_or_else(|| panic!("try needs a result slot"));
                let mut pre = "begin\n".to_owned();
                pre.push_str(&primary.render_pre(cx));
                pre.push_str(&cx.assign(out, &primary.render_expr()));
                pre.push_str("exception\nwhen Property_Error =>\n");
                pre.push_str(&fallback.render_pre(cx));
                pre.push_str(&cx.assign(out, &fallback.render_expr()));
                pre.push_str("end;\n");
                (pre, None)
            }
            RKind::If { cond, then, els } => {
                let out = self.slot.unwrap_or_else(|| panic!("if needs a result slot"));
                let mut pre = cond.render_pre(cx);
                pre.push_str(&format!("if {} then\n", cond.render_expr()));
                pre.push_str(&then.render_pre(cx));
                pre.push_str(&cx.assign(out, &then.render_expr()));
                pre.push_str("else\n");
                pre.push_str(&els.render_pre(cx));
                pre.push_str(&cx.assign(out, &els.render_expr()));
                pre.push_str("end if;\n");
                (pre, None)
            }
            RKind::Seq { first, second } => {
                let mut pre = first.render_pre(cx);
                pre.push_str(&second.render_pre(cx));
                (pre, Some(second.render_expr()))
            }
            RKind::DynBind { slot, value, .. } => {
                let mut pre = value.render_pre(cx);
                pre.push_str(&cx.assign(*slot, &value.render_expr()));
                if cx.trace {
                    let id = cx.next_trace_id();
                    pre.push_str(&format!("--# bind {id} {}\n", cx.slot_name(*slot)));
                }
                (pre, None)
            }
            RKind::ErrorRaise { message } => (
                String::new(),
                Some(format!("(raise Property_Error with \"{message}\")")),
            ),
        }
    }

    /// Visit this node and all operands, parents first.
    pub fn walk(&self, f: &mut impl FnMut(&RExpr)) {
        f(self);
        match &self.kind {
            RKind::Var { .. }
            | RKind::Lit { .. }
            | RKind::BigIntLit { .. }
            | RKind::StrLit { .. }
            | RKind::SymLit { .. }
            | RKind::NullVal
            | RKind::ErrorRaise { .. } => {}
            RKind::ArrayLit { elements } => elements.iter().for_each(|e| e.walk(f)),
            RKind::Cast { operand } | RKind::ToBig { operand } | RKind::Saved { operand } => {
                operand.walk(f)
            }
            RKind::Field { receiver, .. } => receiver.walk(f),
            RKind::Call { receiver, args, .. } => {
                receiver.walk(f);
                args.iter().for_each(|a| a.walk(f));
            }
            RKind::EnvGet { receiver, symbol } => {
                receiver.walk(f);
                symbol.walk(f);
            }
            RKind::Solve { equation } => equation.walk(f),
            RKind::LogicVal { var } => var.walk(f),
            RKind::Eq { lhs, rhs } | RKind::Arith { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            RKind::Let { bindings, body, .. } => {
                bindings.iter().for_each(|(_, e)| e.walk(f));
                body.walk(f);
            }
            RKind::Then { base, then, default, .. } => {
                base.walk(f);
                then.walk(f);
                default.walk(f);
            }
            RKind::Try { primary, fallback } => {
                primary.walk(f);
                fallback.walk(f);
            }
            RKind::If { cond, then, els } => {
                cond.walk(f);
                then.walk(f);
                els.walk(f);
            }
            RKind::Seq { first, second } => {
                first.walk(f);
                second.walk(f);
            }
            RKind::DynBind { value, .. } => value.walk(f),
        }
    }

    /// Compact structural dump, used for diagnostics and to compare
    /// compile-time-known default values across overriding properties.
    pub fn ir_dump(&self, slots: &SlotPool) -> String {
        match &self.kind {
            RKind::Var { slot } => format!("(var {})", slots.codegen_name(*slot)),
            RKind::Lit { text } => format!("(lit {text})"),
            RKind::BigIntLit { digits } => format!("(big-int {digits})"),
            RKind::StrLit { value } => format!("(str {value:?})"),
            RKind::SymLit { value } => format!("(sym {value})"),
            RKind::NullVal => "(null)".to_owned(),
            RKind::ArrayLit { elements } => {
                let items: Vec<_> = elements.iter().map(|e| e.ir_dump(slots)).collect();
                format!("(array {})", items.join(" "))
            }
            RKind::Cast { operand } => format!("(cast {})", operand.ir_dump(slots)),
            RKind::ToBig { operand } => format!("(to-big {})", operand.ir_dump(slots)),
            RKind::Saved { operand } => format!("(saved {})", operand.ir_dump(slots)),
            RKind::Field { receiver, field, .. } => {
                format!("(field {} {})", receiver.ir_dump(slots), field)
            }
            RKind::Call { callee, receiver, args, .. } => {
                let mut parts = vec![receiver.ir_dump(slots)];
                parts.extend(args.iter().map(|a| a.ir_dump(slots)));
                format!("(call {} {})", callee, parts.join(" "))
            }
            RKind::EnvGet { receiver, symbol } => format!(
                "(env-get {} {})",
                receiver.ir_dump(slots),
                symbol.ir_dump(slots)
            ),
            RKind::Solve { equation } => format!("(solve {})", equation.ir_dump(slots)),
            RKind::LogicVal { var } => format!("(logic-val {})", var.ir_dump(slots)),
            RKind::Eq { lhs, rhs } => {
                format!("(eq {} {})", lhs.ir_dump(slots), rhs.ir_dump(slots))
            }
            RKind::Arith { op, lhs, rhs } => format!(
                "(arith {} {} {})",
                op.symbol(),
                lhs.ir_dump(slots),
                rhs.ir_dump(slots)
            ),
            RKind::Let { bindings, body, .. } => {
                let bs: Vec<_> = bindings
                    .iter()
                    .map(|(s, e)| format!("({} {})", slots.codegen_name(*s), e.ir_dump(slots)))
                    .collect();
                format!("(let ({}) {})", bs.join(" "), body.ir_dump(slots))
            }
            RKind::Then { base, then, default, .. } => format!(
                "(then {} {} {})",
                base.ir_dump(slots),
                then.ir_dump(slots),
                default.ir_dump(slots)
            ),
            RKind::Try { primary, fallback } => format!(
                "(try {} {})",
                primary.ir_dump(slots),
                fallback.ir_dump(slots)
            ),
            RKind::If { cond, then, els } => format!(
                "(if {} {} {})",
                cond.ir_dump(slots),
                then.ir_dump(slots),
                els.ir_dump(slots)
            ),
            RKind::Seq { first, second } => format!(
                "(seq {} {})",
                first.ir_dump(slots),
                second.ir_dump(slots)
            ),
            RKind::DynBind { slot, value, .. } => format!(
                "(dyn-bind {} {})",
                slots.codegen_name(*slot),
                value.ir_dump(slots)
            ),
            RKind::ErrorRaise { message } => format!("(raise {message:?})"),
        }
    }
}
