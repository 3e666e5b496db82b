//! Compilation and construction contexts.
//!
//! All state that the original-style "current property" and "current
//! scope" globals would hold is threaded explicitly. [`CompileCtx`] owns
//! the per-compilation tables and the diagnostic sink; [`ConstructCx`] is
//! created for the duration of one property's body construction and owns
//! that property's working set (expression pool, slot pool, variable
//! bindings, dynamic-variable binding stack). Two independent compilations
//! never observe each other's bindings.

use fable_types::{TypeId, TypeRegistry};
use rustc_hash::FxHashMap;

use crate::dynvar::{DynVarId, DynVarTable};
use crate::error::{DiagSink, Warnings};
use crate::expr::{AttrRegistry, ExprPool, VarId};
use crate::prop::{PropId, PropertyTable};
use crate::scope::{ScopeId, SlotId, SlotPool};

/// Per-compilation state: tables, sink, and the guard stack for
/// on-demand property typing.
pub struct CompileCtx {
    pub types: TypeRegistry,
    pub props: PropertyTable,
    pub dynvars: DynVarTable,
    pub attrs: AttrRegistry,
    pub sink: DiagSink,
    pub warnings: Warnings,
    pub(crate) typing_stack: Vec<PropId>,
}

impl CompileCtx {
    pub fn new(types: TypeRegistry) -> Self {
        Self {
            types,
            props: PropertyTable::new(),
            dynvars: DynVarTable::new(),
            attrs: AttrRegistry::with_defaults(),
            sink: DiagSink::new(),
            warnings: Warnings::default(),
            typing_stack: Vec::new(),
        }
    }
}

/// Working set for one property's body construction.
pub struct ConstructCx<'a> {
    pub cx: &'a mut CompileCtx,
    /// The property being constructed.
    pub prop: PropId,
    /// Node type the property is evaluated on.
    pub self_type: TypeId,
    /// Frozen unresolved tree of the property's body.
    pub pool: ExprPool,
    pub slots: SlotPool,
    /// Unresolved variable to slot, filled as bindings come into scope.
    pub bindings: FxHashMap<VarId, SlotId>,
    /// Stack of dynamic-variable bindings currently in scope.
    pub bound_dynvars: Vec<(DynVarId, SlotId)>,
    pub uses_envs: bool,
    pub uses_entity_info: bool,
    pub saw_solver: bool,
    pub saw_logic_extract: bool,
}

impl<'a> ConstructCx<'a> {
    pub fn new(
        cx: &'a mut CompileCtx,
        prop: PropId,
        self_type: TypeId,
        pool: ExprPool,
        slots: SlotPool,
    ) -> Self {
        Self {
            cx,
            prop,
            self_type,
            pool,
            slots,
            bindings: FxHashMap::default(),
            bound_dynvars: Vec::new(),
            uses_envs: false,
            uses_entity_info: false,
            saw_solver: false,
            saw_logic_extract: false,
        }
    }

    pub fn bind_var(&mut self, var: VarId, slot: SlotId) {
        self.bindings.insert(var, slot);
    }

    pub fn slot_of(&self, var: VarId) -> Option<SlotId> {
        self.bindings.get(&var).copied()
    }

    /// Innermost binding of a dynamic variable, if any.
    pub fn dynvar_binding(&self, dynvar: DynVarId) -> Option<SlotId> {
        self.bound_dynvars
            .iter()
            .rev()
            .find(|(dv, _)| *dv == dynvar)
            .map(|&(_, slot)| slot)
    }

    pub fn is_dynvar_bound(&self, dynvar: DynVarId) -> bool {
        self.dynvar_binding(dynvar).is_some()
    }

    /// Run `f` inside a fresh child scope; entered and left on every path.
    pub fn in_child_scope<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> (ScopeId, T) {
        let id = self.slots.push_scope();
        let result = f(self);
        self.slots.pop_scope();
        (id, result)
    }

    /// Run `f` with a dynamic-variable binding pushed; popped on every
    /// path, including diagnostic aborts.
    pub fn with_dynvar_bound<T>(
        &mut self,
        dynvar: DynVarId,
        slot: SlotId,
        f: impl FnOnce(&mut Self) -> T,
    ) -> T {
        self.bound_dynvars.push((dynvar, slot));
        let result = f(self);
        let popped = self.bound_dynvars.pop();
        debug_assert_eq!(popped, Some((dynvar, slot)), "dynamic-variable binding stack corrupted");
        result
    }

}
