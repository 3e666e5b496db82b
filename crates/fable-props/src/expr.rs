//! Unresolved expression trees.
//!
//! Language authors build property bodies through the explicit builder
//! methods on [`ExprPool`]. Nodes live in an arena and are referenced by
//! [`ExprId`], so structural rewrites during preparation replace ids inside
//! parents instead of mutating shared objects, and traversals can be
//! identity-aware. The pool is mutable while the body is being built and
//! prepared; [`ExprPool::freeze`] is the one transition to the immutable
//! consumption phase, after which any builder call panics.

use fable_common::{Name, Span};
use fable_types::TypeId;
use rustc_hash::FxHashMap;

use crate::dynvar::DynVarId;
use crate::error::{DiagKind, Diagnostic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub u32);

/// What a bound variable stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// User binding introduced by `Let` or a guard.
    Local { ignored: bool },
    /// Natural property argument.
    Arg,
    /// The node the property is evaluated on.
    SelfNode,
    /// The entity (node + resolution context) the property is evaluated on.
    Entity,
    /// Artificial argument carrying a dynamic variable.
    DynVar(DynVarId),
}

#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: Name,
    pub kind: VarKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lit {
    Bool(bool),
    Int(i64),
    /// Arbitrary-precision literal, kept as its decimal spelling.
    BigInt(String),
    Char(char),
    Str(String),
    Sym(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Lit(Lit),
    /// Null value of a nullable type: `No(T)`.
    NoVal(TypeId),
    EnumLit(TypeId, Name),
    /// Deferred by-name type reference. Legal only as the argument of a
    /// type-taking attribute such as `cast`; the resolver rejects it in
    /// value position.
    TypeRef(Name),
    Ref(VarId),
    /// Null-guard placeholder: `X._`. Only exists between building and
    /// preparation; the guarded-access expansion rewrites it away.
    Guarded { prefix: ExprId },
    FieldAccess { receiver: ExprId, field: Name },
    Call { receiver: ExprId, name: Name, args: Vec<ExprId> },
    /// View conversion of `operand` to the type named `target`, looked up
    /// in the registry during construction.
    CastTo { operand: ExprId, target: Name },
    /// Evaluate `base`; when non-null, bind it to `var` and evaluate
    /// `then_expr`, otherwise produce `default` (or null of the result
    /// type). `from_guard` marks instances synthesized by the
    /// guarded-access expansion, which the post-order hoisting pass keys on.
    Then {
        base: ExprId,
        var: VarId,
        then_expr: ExprId,
        default: Option<ExprId>,
        from_guard: bool,
    },
    Let { bindings: Vec<(VarId, ExprId)>, body: ExprId },
    Try { expr: ExprId, fallback: Option<ExprId> },
    If { cond: ExprId, then_expr: ExprId, else_expr: ExprId },
    Eq { lhs: ExprId, rhs: ExprId },
    Arith { op: ArithOp, lhs: ExprId, rhs: ExprId },
    ArrayLit { elements: Vec<ExprId> },
    /// Dynamic-variable binding over the lexical extent of `body`.
    Bind { dynvar: DynVarId, value: ExprId, body: ExprId },
    /// Abort evaluation of the enclosing property with an error. Typed as
    /// `ty` so it can stand anywhere an expression of that type can.
    RaiseError { ty: TypeId, message: String },
    /// Lexical environment lookup of `symbol` on the receiver node.
    EnvGet { receiver: ExprId, symbol: ExprId },
    /// Run the runtime solver on an equation.
    Solve { equation: ExprId },
    /// Extract the value of a logic variable after solving.
    LogicVal { var: ExprId },
    /// Host value that could not be coerced to an expression. Kept so the
    /// resolver can report it with a location.
    Opaque(String),
}

#[derive(Debug, Clone)]
pub struct ExprNode {
    pub kind: ExprKind,
    pub span: Span,
}

/// Host-level value being injected into an expression tree.
///
/// Builders and defaults accept `Sugar` and run it through
/// [`ExprPool::coerce`], which turns every coercible variant into a
/// canonical expression node and reports `InvalidExpression` for the rest.
#[derive(Debug, Clone)]
pub enum Sugar {
    Bool(bool),
    Int(i64),
    BigInt(String),
    Char(char),
    Str(String),
    Sym(String),
    Array(Vec<Sugar>),
    Null(TypeId),
    EnumVal(TypeId, Name),
    /// Deferred handle on a registry type, resolved by name when the
    /// expression it feeds is constructed.
    TypeHandle(String),
    Expr(ExprId),
    /// Anything else from the host: only its debug rendering survives.
    Opaque(String),
}

impl From<bool> for Sugar {
    fn from(v: bool) -> Self {
        Sugar::Bool(v)
    }
}

impl From<i64> for Sugar {
    fn from(v: i64) -> Self {
        Sugar::Int(v)
    }
}

impl From<char> for Sugar {
    fn from(v: char) -> Self {
        Sugar::Char(v)
    }
}

impl From<&str> for Sugar {
    fn from(v: &str) -> Self {
        Sugar::Str(v.to_owned())
    }
}

impl From<ExprId> for Sugar {
    fn from(v: ExprId) -> Self {
        Sugar::Expr(v)
    }
}

/// Arena of unresolved expression nodes and their bound variables.
#[derive(Debug, Default)]
pub struct ExprPool {
    nodes: Vec<ExprNode>,
    vars: Vec<VarDecl>,
    frozen: bool,
}

impl ExprPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn assert_mutable(&self) {
        assert!(!self.frozen, "expression tree mutated after freeze");
    }

    /// One-way transition from the building phase to the consumption
    /// phase. Any builder call afterwards is a framework bug and panics.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub(crate) fn push(&mut self, kind: ExprKind, span: Span) -> ExprId {
        self.assert_mutable();
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(ExprNode { kind, span });
        id
    }

    pub fn kind(&self, id: ExprId) -> &ExprKind {
        &self.nodes[id.0 as usize].kind
    }

    pub fn span(&self, id: ExprId) -> Span {
        self.nodes[id.0 as usize].span
    }

    /// Replace a node's kind in place. Used by preparation rewrites only.
    pub(crate) fn set_kind(&mut self, id: ExprId, kind: ExprKind) {
        self.assert_mutable();
        self.nodes[id.0 as usize].kind = kind;
    }

    // ── Variables ──────────────────────────────────────────────────────

    fn push_var(&mut self, name: Name, kind: VarKind) -> VarId {
        self.assert_mutable();
        let id = VarId(self.vars.len() as u32);
        self.vars.push(VarDecl { name, kind });
        id
    }

    pub fn local(&mut self, name: &str) -> VarId {
        self.push_var(Name::from_lower(name), VarKind::Local { ignored: false })
    }

    /// Binding whose value is deliberately unused; exempt from the
    /// unused-binding warning. The display name is synthesized later from
    /// the slot pool.
    pub fn ignored_local(&mut self) -> VarId {
        self.push_var(Name::from_lower("ignored"), VarKind::Local { ignored: true })
    }

    pub fn arg(&mut self, name: &str) -> VarId {
        self.push_var(Name::from_lower(name), VarKind::Arg)
    }

    pub fn self_var(&mut self) -> VarId {
        self.push_var(Name::from_lower("self"), VarKind::SelfNode)
    }

    pub fn entity_var(&mut self) -> VarId {
        self.push_var(Name::from_lower("ent"), VarKind::Entity)
    }

    pub fn dynvar_arg(&mut self, dynvar: DynVarId, name: &str) -> VarId {
        self.push_var(Name::from_lower(name), VarKind::DynVar(dynvar))
    }

    pub fn var(&self, id: VarId) -> &VarDecl {
        &self.vars[id.0 as usize]
    }

    // ── Builders ───────────────────────────────────────────────────────

    pub fn bool_lit(&mut self, span: Span, v: bool) -> ExprId {
        self.push(ExprKind::Lit(Lit::Bool(v)), span)
    }

    pub fn int_lit(&mut self, span: Span, v: i64) -> ExprId {
        self.push(ExprKind::Lit(Lit::Int(v)), span)
    }

    pub fn big_int_lit(&mut self, span: Span, digits: &str) -> ExprId {
        self.push(ExprKind::Lit(Lit::BigInt(digits.to_owned())), span)
    }

    pub fn char_lit(&mut self, span: Span, v: char) -> ExprId {
        self.push(ExprKind::Lit(Lit::Char(v)), span)
    }

    pub fn str_lit(&mut self, span: Span, v: &str) -> ExprId {
        self.push(ExprKind::Lit(Lit::Str(v.to_owned())), span)
    }

    pub fn sym_lit(&mut self, span: Span, v: &str) -> ExprId {
        self.push(ExprKind::Lit(Lit::Sym(v.to_owned())), span)
    }

    pub fn no_val(&mut self, span: Span, ty: TypeId) -> ExprId {
        self.push(ExprKind::NoVal(ty), span)
    }

    pub fn enum_val(&mut self, span: Span, ty: TypeId, variant: &str) -> ExprId {
        self.push(ExprKind::EnumLit(ty, Name::from_lower(variant)), span)
    }

    /// Deferred reference to the type named `name`.
    pub fn type_ref(&mut self, span: Span, name: &str) -> ExprId {
        self.push(ExprKind::TypeRef(Name::from_lower(name)), span)
    }

    pub fn cast_to(&mut self, span: Span, operand: ExprId, target: &str) -> ExprId {
        self.push(
            ExprKind::CastTo { operand, target: Name::from_lower(target) },
            span,
        )
    }

    pub fn var_ref(&mut self, span: Span, var: VarId) -> ExprId {
        self.push(ExprKind::Ref(var), span)
    }

    /// Null-guard placeholder: `prefix._`.
    pub fn guarded(&mut self, span: Span, prefix: ExprId) -> ExprId {
        self.push(ExprKind::Guarded { prefix }, span)
    }

    pub fn field_access(&mut self, span: Span, receiver: ExprId, field: &str) -> ExprId {
        self.push(
            ExprKind::FieldAccess { receiver, field: Name::from_lower(field) },
            span,
        )
    }

    pub fn call(&mut self, span: Span, receiver: ExprId, name: &str, args: Vec<ExprId>) -> ExprId {
        self.push(
            ExprKind::Call { receiver, name: Name::from_lower(name), args },
            span,
        )
    }

    pub fn then_expr(
        &mut self,
        span: Span,
        base: ExprId,
        var: VarId,
        then_expr: ExprId,
        default: Option<ExprId>,
    ) -> ExprId {
        self.push(
            ExprKind::Then { base, var, then_expr, default, from_guard: false },
            span,
        )
    }

    pub fn let_expr(&mut self, span: Span, bindings: Vec<(VarId, ExprId)>, body: ExprId) -> ExprId {
        self.push(ExprKind::Let { bindings, body }, span)
    }

    pub fn try_expr(&mut self, span: Span, expr: ExprId, fallback: Option<ExprId>) -> ExprId {
        self.push(ExprKind::Try { expr, fallback }, span)
    }

    pub fn if_expr(&mut self, span: Span, cond: ExprId, then_expr: ExprId, else_expr: ExprId) -> ExprId {
        self.push(ExprKind::If { cond, then_expr, else_expr }, span)
    }

    pub fn eq(&mut self, span: Span, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.push(ExprKind::Eq { lhs, rhs }, span)
    }

    pub fn arith(&mut self, span: Span, op: ArithOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.push(ExprKind::Arith { op, lhs, rhs }, span)
    }

    pub fn array_lit(&mut self, span: Span, elements: Vec<ExprId>) -> ExprId {
        self.push(ExprKind::ArrayLit { elements }, span)
    }

    pub fn bind(&mut self, span: Span, dynvar: DynVarId, value: ExprId, body: ExprId) -> ExprId {
        self.push(ExprKind::Bind { dynvar, value, body }, span)
    }

    pub fn raise_error(&mut self, span: Span, ty: TypeId, message: &str) -> ExprId {
        self.push(ExprKind::RaiseError { ty, message: message.to_owned() }, span)
    }

    pub fn env_get(&mut self, span: Span, receiver: ExprId, symbol: ExprId) -> ExprId {
        self.push(ExprKind::EnvGet { receiver, symbol }, span)
    }

    pub fn solve(&mut self, span: Span, equation: ExprId) -> ExprId {
        self.push(ExprKind::Solve { equation }, span)
    }

    pub fn logic_val(&mut self, span: Span, var: ExprId) -> ExprId {
        self.push(ExprKind::LogicVal { var }, span)
    }

    // ── Host-value coercion ────────────────────────────────────────────

    /// Turn a host value into a canonical expression node, or report
    /// `InvalidExpression` for values with no expression counterpart.
    pub fn coerce(&mut self, sugar: Sugar, span: Span) -> Result<ExprId, Diagnostic> {
        Ok(match sugar {
            Sugar::Bool(v) => self.bool_lit(span, v),
            Sugar::Int(v) => self.int_lit(span, v),
            Sugar::BigInt(digits) => self.big_int_lit(span, &digits),
            Sugar::Char(v) => self.char_lit(span, v),
            Sugar::Str(v) => self.str_lit(span, &v),
            Sugar::Sym(v) => self.sym_lit(span, &v),
            Sugar::Null(ty) => self.no_val(span, ty),
            Sugar::EnumVal(ty, variant) => {
                self.push(ExprKind::EnumLit(ty, variant), span)
            }
            Sugar::TypeHandle(name) => self.type_ref(span, &name),
            Sugar::Array(items) => {
                let elements = items
                    .into_iter()
                    .map(|item| self.coerce(item, span))
                    .collect::<Result<Vec<_>, _>>()?;
                self.array_lit(span, elements)
            }
            Sugar::Expr(id) => id,
            Sugar::Opaque(repr) => {
                return Err(Diagnostic::new(
                    DiagKind::InvalidExpression,
                    span,
                    format!("value {repr} cannot be used as an expression"),
                ))
            }
        })
    }

    /// Permissive variant of [`ExprPool::coerce`]: probes whether a host
    /// value is expressible, without reporting anything.
    pub fn coerce_probe(&mut self, sugar: Sugar, span: Span) -> Option<ExprId> {
        match &sugar {
            Sugar::Opaque(_) => None,
            _ => self.coerce(sugar, span).ok(),
        }
    }
}

/// Registry mapping attribute names to expression builders.
///
/// Attribute-style access (`x.foo`, `x.foo(a, b)`) goes through here:
/// names with a registered builder get their dedicated expression node,
/// everything else falls back to a plain field access or property call
/// resolved later against the receiver's type.
pub struct AttrRegistry {
    builders: FxHashMap<Name, AttrBuilder>,
}

pub type AttrBuilder =
    fn(&mut ExprPool, Span, ExprId, &[ExprId]) -> Result<ExprId, Diagnostic>;

impl AttrRegistry {
    /// Registry pre-populated with the built-in attribute names.
    pub fn with_defaults() -> Self {
        let mut reg = Self { builders: FxHashMap::default() };
        reg.register("env_get", |pool, span, recv, args| match args {
            [symbol] => Ok(pool.env_get(span, recv, *symbol)),
            _ => Err(Diagnostic::new(
                DiagKind::InvalidExpression,
                span,
                format!("env_get takes exactly 1 argument, got {}", args.len()),
            )),
        });
        reg.register("solve", |pool, span, recv, args| match args {
            [] => Ok(pool.solve(span, recv)),
            _ => Err(Diagnostic::new(
                DiagKind::InvalidExpression,
                span,
                "solve takes no arguments".to_owned(),
            )),
        });
        reg.register("cast", |pool, span, recv, args| match args {
            [target] => match pool.kind(*target) {
                ExprKind::TypeRef(name) => {
                    let target = name.clone();
                    Ok(pool.push(ExprKind::CastTo { operand: recv, target }, span))
                }
                _ => Err(Diagnostic::new(
                    DiagKind::InvalidExpression,
                    span,
                    "cast expects a type reference".to_owned(),
                )),
            },
            _ => Err(Diagnostic::new(
                DiagKind::InvalidExpression,
                span,
                format!("cast takes exactly 1 argument, got {}", args.len()),
            )),
        });
        reg.register("get_value", |pool, span, recv, args| match args {
            [] => Ok(pool.logic_val(span, recv)),
            _ => Err(Diagnostic::new(
                DiagKind::InvalidExpression,
                span,
                "get_value takes no arguments".to_owned(),
            )),
        });
        reg
    }

    pub fn register(&mut self, name: &str, builder: AttrBuilder) {
        self.builders.insert(Name::from_lower(name), builder);
    }

    /// Build the expression for `receiver.name(args...)`.
    pub fn build(
        &self,
        pool: &mut ExprPool,
        span: Span,
        receiver: ExprId,
        name: &str,
        args: &[ExprId],
    ) -> Result<ExprId, Diagnostic> {
        let name = Name::from_lower(name);
        if let Some(builder) = self.builders.get(&name) {
            return builder(pool, span, receiver, args);
        }
        Ok(if args.is_empty() {
            pool.push(ExprKind::FieldAccess { receiver, field: name }, span)
        } else {
            pool.push(
                ExprKind::Call { receiver, name, args: args.to_vec() },
                span,
            )
        })
    }
}
