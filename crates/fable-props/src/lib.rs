//! Property compilation: from declared property expressions to typed,
//! renderable bodies.
//!
//! A property is a computed attribute attached to a node type. This
//! crate takes property declarations built through [`prop::PropertyBuilder`],
//! lowers their expression trees in two phases, and produces typed IR
//! that renders to target code text:
//!
//! - Preparation desugars the tree in place: guarded-access placeholders
//!   expand into null-checking blocks, and the tree is frozen.
//! - Construction resolves each node against the type registry, binds
//!   variables to storage slots, and yields typed IR.
//!
//! Whole-compilation passes then check override consistency across the
//! node hierarchy, flag abstract properties that concrete types never
//! override, and compute memoization eligibility.
//!
//! # Architecture
//!
//! - [`expr`]: Unresolved expression trees, variables, and the attribute
//!   builder registry
//! - [`prepare`]: In-place desugaring passes over an expression tree
//! - [`resolve`]: Type-directed construction of unresolved trees into IR
//! - [`ir`]: Typed IR nodes and the two-part render contract
//! - [`scope`]: Storage slots and the scope tree that drives cleanup
//! - [`dynvar`]: Dynamic variables and binding-use analysis
//! - [`prop`]: Property descriptors, their lifecycle, and dispatch checks
//! - [`cx`]: Compilation and per-property construction contexts
//! - [`error`]: Diagnostic kinds, the sink, and the abort marker
//! - [`diagnostics`]: Ariadne rendering of collected diagnostics

pub mod cx;
pub mod diagnostics;
pub mod dynvar;
pub mod error;
pub mod expr;
pub mod ir;
pub mod prepare;
pub mod prop;
pub mod resolve;
pub mod scope;

pub use cx::{CompileCtx, ConstructCx};
pub use dynvar::{DynVar, DynVarId, DynVarTable};
pub use error::{Aborted, CResult, DiagKind, DiagSink, Diagnostic, Severity, Warnings};
pub use expr::{ExprId, ExprKind, ExprPool, Sugar, VarId};
pub use ir::{RExpr, RKind, RenderCx};
pub use prop::{
    Abstractness, NoMemoReason, PropId, PropState, PropertyBuilder, PropertyDef,
    PropertyTable,
};
pub use scope::{ScopeId, SlotId, SlotPool};

/// Run every declared property through typing, attribute computation, and
/// the whole-compilation dispatch checks. Diagnostics accumulate in the
/// context's sink; properties that fail to type are skipped, the rest are
/// still processed.
pub fn process(cx: &mut CompileCtx) {
    prop::process_properties(cx);
}
