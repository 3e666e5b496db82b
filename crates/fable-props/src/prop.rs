//! Property descriptors, their lifecycle, and the dispatch checks.
//!
//! A property is one computed attribute of a node type. Each descriptor
//! moves through a fixed lifecycle: Declared (builder output), Prepared
//! (body desugared and frozen, artificial arguments materialized), Typed
//! (body lowered to IR, return type known), Attributed (override
//! consistency checked, memoization eligibility computed), Rendered
//! (terminal). Typing is on demand so a property call can force its
//! callee's type first; a cycle in that process is a
//! `RecursiveTypeInference` diagnostic.

use std::mem;

use fable_common::{Name, Span};
use fable_types::{TypeId, TypeRegistry};
use rustc_hash::FxHashMap;

use crate::cx::{CompileCtx, ConstructCx};
use crate::error::{CResult, DiagKind, Diagnostic};
use crate::expr::{ExprId, ExprPool, VarId};
use crate::dynvar::DynVarId;
use crate::ir::{RenderCx, RExpr};
use crate::prepare;
use crate::resolve::{self, Expected};
use crate::scope::SlotPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PropState {
    Declared,
    Prepared,
    Typed,
    Attributed,
    Rendered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abstractness {
    Concrete,
    Abstract,
    /// Abstract, but concrete subtypes without an override get a runtime
    /// error instead of a compile-time one.
    AbstractRuntimeCheck,
}

/// Why a property cannot be memoized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoMemoReason {
    Abstract,
    External,
    /// Declared non-memoizable by hand, with the author's justification.
    Declared(String),
    /// Runs the equation solver, whose side effects a cache would skip.
    SolverUse,
    /// Extracts logic-variable values, which depend on solver state.
    LogicValueExtraction,
}

impl NoMemoReason {
    pub fn describe(&self) -> String {
        match self {
            NoMemoReason::Abstract => "it is abstract".to_owned(),
            NoMemoReason::External => "it is externally implemented".to_owned(),
            NoMemoReason::Declared(why) => why.clone(),
            NoMemoReason::SolverUse => "it performs equation solving".to_owned(),
            NoMemoReason::LogicValueExtraction => {
                "it extracts logic variable values".to_owned()
            }
        }
    }
}

/// Compile-time constant value, used for argument and dynamic-variable
/// defaults. Defaults are compared across overriding properties by their
/// structural dump.
#[derive(Debug, Clone)]
pub struct ConstVal {
    pub ty: TypeId,
    pub text: String,
    pub dump: String,
}

#[derive(Debug, Clone)]
pub struct Argument {
    pub name: Name,
    pub ty: TypeId,
    pub default: Option<ConstVal>,
    raw_default: Option<ExprId>,
    /// Synthesized (dynamic-variable or entity-context) argument.
    pub artificial: bool,
    /// Binding variable in the body pool, for natural arguments.
    pub var: Option<VarId>,
}

/// Builder for one property declaration.
pub struct PropertyBuilder {
    name: Name,
    owner: TypeId,
    span: Span,
    pub pool: ExprPool,
    body: Option<ExprId>,
    declared_ty: Option<TypeId>,
    args: Vec<Argument>,
    dynamic_vars: Vec<(DynVarId, Option<ExprId>)>,
    self_var: Option<VarId>,
    entity_var: Option<VarId>,
    abstractness: Abstractness,
    memoized: bool,
    non_memoizable_why: Option<String>,
    lazy_field: bool,
    external: bool,
    public: bool,
    warn_on_unused: Option<bool>,
    trace: bool,
}

impl PropertyBuilder {
    pub fn new(owner: TypeId, name: &str) -> Self {
        Self {
            name: Name::from_lower(name),
            owner,
            span: Span::synthetic(),
            pool: ExprPool::new(),
            body: None,
            declared_ty: None,
            args: Vec::new(),
            dynamic_vars: Vec::new(),
            self_var: None,
            entity_var: None,
            abstractness: Abstractness::Concrete,
            memoized: false,
            non_memoizable_why: None,
            lazy_field: false,
            external: false,
            public: true,
            warn_on_unused: None,
            trace: false,
        }
    }

    pub fn spanned(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Variable standing for the node the property runs on.
    pub fn self_var(&mut self) -> VarId {
        if let Some(v) = self.self_var {
            return v;
        }
        let v = self.pool.self_var();
        self.self_var = Some(v);
        v
    }

    /// Variable standing for the entity the property runs on. Declaring
    /// it makes the property carry entity context information.
    pub fn entity_var(&mut self) -> VarId {
        if let Some(v) = self.entity_var {
            return v;
        }
        let v = self.pool.entity_var();
        self.entity_var = Some(v);
        v
    }

    pub fn arg(&mut self, name: &str, ty: TypeId) -> VarId {
        let var = self.pool.arg(name);
        self.args.push(Argument {
            name: Name::from_lower(name),
            ty,
            default: None,
            raw_default: None,
            artificial: false,
            var: Some(var),
        });
        var
    }

    pub fn arg_with_default(&mut self, name: &str, ty: TypeId, default: ExprId) -> VarId {
        let var = self.arg(name, ty);
        if let Some(a) = self.args.last_mut() {
            a.raw_default = Some(default);
        }
        var
    }

    pub fn dynamic_var(&mut self, dv: DynVarId) -> &mut Self {
        self.dynamic_vars.push((dv, None));
        self
    }

    pub fn dynamic_var_with_default(&mut self, dv: DynVarId, default: ExprId) -> &mut Self {
        self.dynamic_vars.push((dv, Some(default)));
        self
    }

    pub fn returns(&mut self, ty: TypeId) -> &mut Self {
        self.declared_ty = Some(ty);
        self
    }

    pub fn body(&mut self, expr: ExprId) -> &mut Self {
        self.body = Some(expr);
        self
    }

    pub fn abstract_(&mut self) -> &mut Self {
        self.abstractness = Abstractness::Abstract;
        self
    }

    pub fn abstract_runtime_check(&mut self) -> &mut Self {
        self.abstractness = Abstractness::AbstractRuntimeCheck;
        self
    }

    pub fn memoized(&mut self) -> &mut Self {
        self.memoized = true;
        self
    }

    /// Declare that calling this property poisons memoization in its
    /// callers, with a message explaining why.
    pub fn call_non_memoizable_because(&mut self, why: &str) -> &mut Self {
        self.non_memoizable_why = Some(why.to_owned());
        self
    }

    pub fn lazy_field(&mut self) -> &mut Self {
        self.lazy_field = true;
        self
    }

    pub fn external(&mut self) -> &mut Self {
        self.external = true;
        self
    }

    pub fn private(&mut self) -> &mut Self {
        self.public = false;
        self
    }

    pub fn warn_on_unused(&mut self, v: bool) -> &mut Self {
        self.warn_on_unused = Some(v);
        self
    }

    pub fn traced(&mut self) -> &mut Self {
        self.trace = true;
        self
    }
}

#[derive(Debug)]
pub struct PropertyDef {
    pub name: Name,
    pub owner: TypeId,
    pub span: Span,
    pub state: PropState,
    pub abstractness: Abstractness,
    pub memoized: bool,
    /// Author-declared reason why calls to this property poison
    /// memoization in callers.
    pub call_non_memoizable_because: Option<String>,
    pub lazy_field: bool,
    pub external: bool,
    pub public: bool,
    pub trace: bool,
    warn_on_unused_local: Option<bool>,
    pub declared_ty: Option<TypeId>,
    /// Resolved return type; set when the property reaches Typed.
    pub ty: Option<TypeId>,
    /// Natural arguments first, artificial ones appended at Prepared.
    pub args: Vec<Argument>,
    pub dynamic_vars: Vec<(DynVarId, Option<ConstVal>)>,
    dynvar_raw_defaults: Vec<Option<ExprId>>,
    pub(crate) pool: ExprPool,
    pub body: Option<ExprId>,
    self_var: Option<VarId>,
    entity_var: Option<VarId>,
    pub(crate) slots: SlotPool,
    pub typed_body: Option<RExpr>,
    /// Nearest overridden property up the node hierarchy.
    pub base: Option<PropId>,
    pub overriders: Vec<PropId>,
    /// Base of an override family that routes by runtime node kind.
    pub is_dispatcher: bool,
    pub uses_envs: bool,
    pub uses_entity_info: bool,
    saw_solver: bool,
    saw_logic_extract: bool,
    /// Names of the synthesized storage field and presence flag, for lazy
    /// fields.
    pub lazy_storage: Option<(Name, Name)>,
    pub rendered: Option<String>,
}

impl PropertyDef {
    pub fn natural_args(&self) -> impl Iterator<Item = &Argument> {
        self.args.iter().filter(|a| !a.artificial)
    }

    /// Why this property itself cannot be memoized, ignoring anything it
    /// calls.
    pub fn reason_for_no_memoization(&self) -> Option<NoMemoReason> {
        if self.abstractness == Abstractness::Abstract {
            Some(NoMemoReason::Abstract)
        } else if self.external {
            Some(NoMemoReason::External)
        } else {
            None
        }
    }

    /// Why calling this property poisons memoization in its callers. The
    /// whole-program memoization pass spreads this through the call graph;
    /// here it only reflects the property's own definition.
    pub fn transitive_reason_for_no_memoization(&self) -> Option<NoMemoReason> {
        if let Some(why) = &self.call_non_memoizable_because {
            Some(NoMemoReason::Declared(why.clone()))
        } else if self.saw_solver {
            Some(NoMemoReason::SolverUse)
        } else if self.saw_logic_extract {
            Some(NoMemoReason::LogicValueExtraction)
        } else {
            None
        }
    }

    /// Whether this property is a memoization candidate.
    pub fn memoizable(&self) -> bool {
        self.reason_for_no_memoization().is_none()
            && self.transitive_reason_for_no_memoization().is_none()
    }

    /// Qualified name for debug output. Dispatchers are marked so traces
    /// distinguish them from the implementations they route to.
    pub fn debug_name(&self, types: &TypeRegistry) -> String {
        let base = format!(
            "{}.{}",
            types.display(self.owner),
            self.name.camel_with_underscores()
        );
        if self.is_dispatcher {
            format!("{base} (dispatcher)")
        } else {
            base
        }
    }
}

/// All property descriptors of a compilation.
#[derive(Debug, Default)]
pub struct PropertyTable {
    props: Vec<PropertyDef>,
    by_node: FxHashMap<TypeId, Vec<PropId>>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, b: PropertyBuilder) -> PropId {
        let id = PropId(self.props.len() as u32);
        let dynvar_raw_defaults = b.dynamic_vars.iter().map(|(_, d)| *d).collect();
        self.props.push(PropertyDef {
            name: b.name,
            owner: b.owner,
            span: b.span,
            state: PropState::Declared,
            abstractness: b.abstractness,
            memoized: b.memoized,
            call_non_memoizable_because: b.non_memoizable_why,
            lazy_field: b.lazy_field,
            external: b.external,
            public: b.public,
            trace: b.trace,
            warn_on_unused_local: b.warn_on_unused,
            declared_ty: b.declared_ty,
            ty: None,
            args: b.args,
            dynamic_vars: b.dynamic_vars.into_iter().map(|(dv, _)| (dv, None)).collect(),
            dynvar_raw_defaults,
            pool: b.pool,
            body: b.body,
            self_var: b.self_var,
            entity_var: b.entity_var,
            slots: SlotPool::new(),
            typed_body: None,
            base: None,
            overriders: Vec::new(),
            is_dispatcher: false,
            uses_envs: false,
            uses_entity_info: b.entity_var.is_some(),
            saw_solver: false,
            saw_logic_extract: false,
            lazy_storage: None,
            rendered: None,
        });
        self.by_node.entry(b.owner).or_default().push(id);
        id
    }

    /// External property with only a signature; handy for stubs.
    pub fn declare_minimal(&mut self, owner: TypeId, name: &str, returns: Option<TypeId>) -> PropId {
        let mut b = PropertyBuilder::new(owner, name);
        b.external();
        if let Some(t) = returns {
            b.returns(t);
        }
        self.declare(b)
    }

    pub fn def(&self, id: PropId) -> &PropertyDef {
        &self.props[id.0 as usize]
    }

    pub fn def_mut(&mut self, id: PropId) -> &mut PropertyDef {
        &mut self.props[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = PropId> {
        (0..self.props.len() as u32).map(PropId)
    }

    /// Property named `name` visible on `node`, walking up the hierarchy.
    pub fn lookup(&self, types: &TypeRegistry, node: TypeId, name: &Name) -> Option<PropId> {
        types.ancestors(node).into_iter().find_map(|t| {
            self.by_node
                .get(&t)?
                .iter()
                .copied()
                .find(|&p| &self.def(p).name == name)
        })
    }

    /// Property this one overrides, if any: same name on the nearest
    /// strict ancestor of the owner.
    pub fn find_base(&self, types: &TypeRegistry, id: PropId) -> Option<PropId> {
        let def = self.def(id);
        types
            .ancestors(def.owner)
            .into_iter()
            .skip(1)
            .find_map(|t| {
                self.by_node
                    .get(&t)?
                    .iter()
                    .copied()
                    .find(|&p| self.def(p).name == def.name)
            })
    }

    /// Whether unused bindings inside this property warrant a warning.
    /// Falls back to the overridden property's setting, then to true.
    pub fn warn_on_unused(&self, types: &TypeRegistry, id: PropId) -> bool {
        let def = self.def(id);
        if let Some(v) = def.warn_on_unused_local {
            return v;
        }
        match def.base.or_else(|| self.find_base(types, id)) {
            Some(b) => self.warn_on_unused(types, b),
            None => true,
        }
    }
}

/// Declared -> Prepared: desugar and freeze the body, then materialize
/// the artificial arguments (one per dynamic variable, plus the entity
/// context when the property uses it).
pub fn prepare_property(cx: &mut CompileCtx, pid: PropId) {
    let def = cx.props.def_mut(pid);
    if def.state >= PropState::Prepared {
        return;
    }
    if let Some(body) = def.body {
        let new_body = prepare::prepare(&mut def.pool, body);
        def.body = Some(new_body);
    } else {
        def.pool.freeze();
    }
    let dyn_args: Vec<_> = def
        .dynamic_vars
        .iter()
        .map(|&(dv, _)| (dv, cx.dynvars.name(dv).clone(), cx.dynvars.ty(dv)))
        .collect();
    let def = cx.props.def_mut(pid);
    for (_, name, ty) in &dyn_args {
        def.args.push(Argument {
            name: name.clone(),
            ty: *ty,
            default: None,
            raw_default: None,
            artificial: true,
            var: None,
        });
    }
    if def.uses_entity_info {
        let ty = cx.types.entity_of(def.owner);
        let def = cx.props.def_mut(pid);
        def.args.push(Argument {
            name: Name::from_lower("e_info"),
            ty,
            default: None,
            raw_default: None,
            artificial: true,
            var: None,
        });
    }
    cx.props.def_mut(pid).state = PropState::Prepared;
}

/// On-demand typing: Prepared -> Typed. Reentrant requests for a property
/// already being typed are the self-referential inference case and fail
/// with `RecursiveTypeInference`.
pub fn ensure_typed(cx: &mut CompileCtx, pid: PropId) -> CResult<TypeId> {
    if let Some(ty) = cx.props.def(pid).ty {
        return Ok(ty);
    }
    if cx.typing_stack.contains(&pid) {
        let span = cx.props.def(pid).span;
        let name = cx.props.def(pid).name.clone();
        return Err(cx.sink.fatal(
            DiagKind::RecursiveTypeInference,
            span,
            format!("type inference for property {name} depends on itself"),
        ));
    }
    prepare_property(cx, pid);

    let def = cx.props.def(pid);
    if def.body.is_none() {
        let span = def.span;
        let name = def.name.clone();
        let Some(ty) = def.declared_ty else {
            return Err(cx.sink.fatal(
                DiagKind::InvalidExpression,
                span,
                format!("property {name} has no expression and no declared type"),
            ));
        };
        if !def.external && def.abstractness == Abstractness::Concrete {
            return Err(cx.sink.fatal(
                DiagKind::InvalidExpression,
                span,
                format!("concrete property {name} has no expression"),
            ));
        }
        resolve_signature_defaults(cx, pid)?;
        let def = cx.props.def_mut(pid);
        def.ty = Some(ty);
        def.state = PropState::Typed;
        return Ok(ty);
    }

    cx.typing_stack.push(pid);
    let result = type_body(cx, pid);
    cx.typing_stack.pop();
    result
}

/// Resolve a raw default expression to a constant and check it against
/// the declared type of its argument or dynamic variable.
fn const_default(
    ccx: &mut ConstructCx<'_>,
    raw: ExprId,
    expect_ty: TypeId,
    what: &str,
) -> CResult<ConstVal> {
    let c = resolve::construct_compile_time_known(ccx, raw)?;
    if !ccx.cx.types.matches(c.ty, expect_ty) {
        let span = ccx.pool.span(raw);
        let msg = format!(
            "default value for {what} has type {}, expected {}",
            ccx.cx.types.display(c.ty),
            ccx.cx.types.display(expect_ty)
        );
        return Err(ccx.cx.sink.fatal(DiagKind::TypeMismatch, span, msg));
    }
    Ok(c)
}

/// Resolve argument and dynamic-variable defaults for a property whose
/// body stays external. Callers still need the constants to fill in
/// missing actuals.
fn resolve_signature_defaults(cx: &mut CompileCtx, pid: PropId) -> CResult<()> {
    let def = cx.props.def(pid);
    let has_defaults = def.args.iter().any(|a| a.raw_default.is_some())
        || def.dynvar_raw_defaults.iter().any(|d| d.is_some());
    if !has_defaults {
        return Ok(());
    }
    let def = cx.props.def_mut(pid);
    let pool = mem::take(&mut def.pool);
    let slots = mem::take(&mut def.slots);
    let owner = def.owner;
    let arg_specs: Vec<(Option<ExprId>, TypeId)> =
        def.args.iter().map(|a| (a.raw_default, a.ty)).collect();
    let arg_names: Vec<Name> = def.args.iter().map(|a| a.name.clone()).collect();
    let dyn_specs: Vec<(DynVarId, Option<ExprId>)> = def
        .dynamic_vars
        .iter()
        .zip(&def.dynvar_raw_defaults)
        .map(|(&(dv, _), &raw)| (dv, raw))
        .collect();

    let mut ccx = ConstructCx::new(cx, pid, owner, pool, slots);
    let result = (|| {
        let mut arg_defaults = Vec::with_capacity(arg_specs.len());
        for ((raw, ty), name) in arg_specs.iter().zip(&arg_names) {
            match raw {
                Some(raw) => {
                    arg_defaults.push(Some(const_default(&mut ccx, *raw, *ty, &name.lower())?))
                }
                None => arg_defaults.push(None),
            }
        }
        let mut dynvar_defaults = Vec::with_capacity(dyn_specs.len());
        for &(dv, raw) in &dyn_specs {
            match raw {
                Some(raw) => {
                    let dv_ty = ccx.cx.dynvars.ty(dv);
                    let what = format!("dynamic variable {}", ccx.cx.dynvars.name(dv));
                    dynvar_defaults.push(Some(const_default(&mut ccx, raw, dv_ty, &what)?));
                }
                None => dynvar_defaults.push(None),
            }
        }
        Ok((arg_defaults, dynvar_defaults))
    })();

    let ConstructCx { pool, slots, .. } = ccx;
    let def = cx.props.def_mut(pid);
    def.pool = pool;
    def.slots = slots;
    let (arg_defaults, dynvar_defaults) = result?;
    let def = cx.props.def_mut(pid);
    let mut defaults = arg_defaults.into_iter();
    for a in def.args.iter_mut() {
        a.default = defaults.next().flatten();
    }
    for ((_, slot), d) in def.dynamic_vars.iter_mut().zip(dynvar_defaults) {
        *slot = d;
    }
    Ok(())
}

fn type_body(cx: &mut CompileCtx, pid: PropId) -> CResult<TypeId> {
    let def = cx.props.def_mut(pid);
    let pool = mem::take(&mut def.pool);
    let slots = mem::take(&mut def.slots);
    let body = def.body.unwrap_or_else(|| panic!("type_body on a bodyless property"));
    let owner = def.owner;
    let declared_ty = def.declared_ty;
    let self_var = def.self_var;
    let entity_var = def.entity_var;
    let natural: Vec<Argument> = def.args.iter().filter(|a| !a.artificial).cloned().collect();
    let dyn_specs: Vec<(DynVarId, Option<ExprId>)> = def
        .dynamic_vars
        .iter()
        .zip(&def.dynvar_raw_defaults)
        .map(|(&(dv, _), &raw)| (dv, raw))
        .collect();

    let mut ccx = ConstructCx::new(cx, pid, owner, pool, slots);
    let result = construct_property_body(
        &mut ccx,
        body,
        declared_ty,
        self_var,
        entity_var,
        &natural,
        &dyn_specs,
    );
    if result.is_ok() {
        // every slot allocated during construction must be scoped by now
        ccx.slots.check_scopes();
    }

    let ConstructCx {
        pool,
        slots,
        uses_envs,
        uses_entity_info,
        saw_solver,
        saw_logic_extract,
        ..
    } = ccx;
    let def = cx.props.def_mut(pid);
    def.pool = pool;
    def.slots = slots;
    def.uses_envs |= uses_envs;
    def.uses_entity_info |= uses_entity_info;
    def.saw_solver = saw_solver;
    def.saw_logic_extract = saw_logic_extract;

    let (body_r, arg_defaults, dynvar_defaults) = result?;
    let def = cx.props.def_mut(pid);
    let ty = body_r.ty;
    def.ty = Some(ty);
    def.typed_body = Some(body_r);
    let mut defaults = arg_defaults.into_iter();
    for a in def.args.iter_mut().filter(|a| !a.artificial) {
        a.default = defaults.next().flatten();
    }
    for ((_, slot), d) in def.dynamic_vars.iter_mut().zip(dynvar_defaults) {
        *slot = d;
    }
    def.state = PropState::Typed;
    Ok(ty)
}

type BodyOutcome = (RExpr, Vec<Option<ConstVal>>, Vec<Option<ConstVal>>);

fn construct_property_body(
    ccx: &mut ConstructCx<'_>,
    body: ExprId,
    declared_ty: Option<TypeId>,
    self_var: Option<VarId>,
    entity_var: Option<VarId>,
    natural: &[Argument],
    dyn_specs: &[(DynVarId, Option<ExprId>)],
) -> CResult<BodyOutcome> {
    let owner = ccx.self_type;
    let self_slot = ccx.slots.create(&Name::from_lower("self"), Some(owner));
    if let Some(v) = self_var {
        ccx.bind_var(v, self_slot);
    }
    if let Some(v) = entity_var {
        let ty = ccx.cx.types.entity_of(owner);
        let slot = ccx.slots.create(&Name::from_lower("ent"), Some(ty));
        ccx.bind_var(v, slot);
    }

    // argument slots exist before the body's block scope does
    for a in natural {
        let slot = ccx.slots.create_scopeless(&a.name, Some(a.ty));
        ccx.slots.add_to_scope(slot);
        if let Some(v) = a.var {
            ccx.bind_var(v, slot);
        }
    }
    let mut arg_defaults = Vec::with_capacity(natural.len());
    for a in natural {
        match a.raw_default {
            Some(raw) => {
                arg_defaults.push(Some(const_default(ccx, raw, a.ty, &a.name.lower())?))
            }
            None => arg_defaults.push(None),
        }
    }

    // the property's own dynamic variables are bound across its body
    let mut dynvar_defaults = Vec::with_capacity(dyn_specs.len());
    for &(dv, raw) in dyn_specs {
        let dv_name = ccx.cx.dynvars.name(dv).clone();
        let dv_ty = ccx.cx.dynvars.ty(dv);
        let slot = ccx.slots.create(&dv_name, Some(dv_ty));
        ccx.bound_dynvars.push((dv, slot));
        match raw {
            Some(raw) => {
                let what = format!("dynamic variable {dv_name}");
                dynvar_defaults.push(Some(const_default(ccx, raw, dv_ty, &what)?));
            }
            None => dynvar_defaults.push(None),
        }
    }

    let body_r = match declared_ty {
        Some(t) => resolve::construct_expected(ccx, body, Expected::Type(t), None, true)?,
        None => resolve::construct(ccx, body)?,
    };
    Ok((body_r, arg_defaults, dynvar_defaults))
}

/// Typed -> Attributed: link and check the override relation, synthesize
/// lazy-field storage, compute memoization eligibility. Signature
/// mismatches are reported but do not abort, so one pass surfaces every
/// inconsistent property.
pub fn compute_attributes(cx: &mut CompileCtx, pid: PropId) -> CResult<()> {
    ensure_typed(cx, pid)?;
    if cx.props.def(pid).state >= PropState::Attributed {
        return Ok(());
    }

    if let Some(base) = cx.props.find_base(&cx.types, pid) {
        ensure_typed(cx, base)?;
        check_override_consistency(cx, pid, base);
        cx.props.def_mut(pid).base = Some(base);
        cx.props.def_mut(base).overriders.push(pid);
    }

    let def = cx.props.def_mut(pid);
    if def.lazy_field {
        let storage = Name::from_lower(&format!("lf_{}", def.name.lower()));
        let present = Name::from_lower(&format!("lf_present_{}", def.name.lower()));
        def.lazy_storage = Some((storage, present));
    }

    if def.memoized {
        let reason = def
            .reason_for_no_memoization()
            .or_else(|| def.transitive_reason_for_no_memoization());
        if let Some(reason) = reason {
            let span = def.span;
            let name = def.name.clone();
            cx.sink.emit(Diagnostic::new(
                DiagKind::InvalidExpression,
                span,
                format!("property {name} cannot be memoized because {}", reason.describe()),
            ));
        }
    }
    cx.props.def_mut(pid).state = PropState::Attributed;
    Ok(())
}

fn check_override_consistency(cx: &mut CompileCtx, pid: PropId, base: PropId) {
    let (span, name) = {
        let d = cx.props.def(pid);
        (d.span, d.name.clone())
    };

    let ty = cx.props.def(pid).ty.unwrap_or_else(|| panic!("override check before typing"));
    let base_ty = cx.props.def(base).ty.unwrap_or_else(|| panic!("override check before typing"));
    if !cx.types.matches(ty, base_ty) {
        let msg = format!(
            "overriding property {name} returns {}, incompatible with {} from the overridden property",
            cx.types.display(ty),
            cx.types.display(base_ty)
        );
        cx.sink.emit(Diagnostic::new(DiagKind::TypeMismatch, span, msg));
    }

    let ours: Vec<Argument> = cx.props.def(pid).natural_args().cloned().collect();
    let theirs: Vec<Argument> = cx.props.def(base).natural_args().cloned().collect();
    if ours.len() != theirs.len() {
        cx.sink.emit(Diagnostic::new(
            DiagKind::InconsistentOverride,
            span,
            format!(
                "property {name} takes {} arguments, the overridden property takes {}",
                ours.len(),
                theirs.len()
            ),
        ));
    } else {
        for (a, b) in ours.iter().zip(&theirs) {
            if a.name != b.name {
                cx.sink.emit(Diagnostic::new(
                    DiagKind::InconsistentOverride,
                    span,
                    format!("argument {} is named {} in the overridden property", a.name, b.name),
                ));
            }
            if a.ty != b.ty {
                cx.sink.emit(Diagnostic::new(
                    DiagKind::InconsistentOverride,
                    span,
                    format!(
                        "argument {} has type {}, the overridden property expects {}",
                        a.name,
                        cx.types.display(a.ty),
                        cx.types.display(b.ty)
                    ),
                ));
            }
            let dump = |d: &Option<ConstVal>| d.as_ref().map(|c| c.dump.clone());
            if dump(&a.default) != dump(&b.default) {
                cx.sink.emit(Diagnostic::new(
                    DiagKind::InconsistentOverride,
                    span,
                    format!("argument {} has a different default value than in the overridden property", a.name),
                ));
            }
        }
    }

    let our_dvs = cx.props.def(pid).dynamic_vars.clone();
    let base_dvs = cx.props.def(base).dynamic_vars.clone();
    let ids = |dvs: &[(DynVarId, Option<ConstVal>)]| dvs.iter().map(|(dv, _)| *dv).collect::<Vec<_>>();
    let dumps = |dvs: &[(DynVarId, Option<ConstVal>)]| {
        dvs.iter().map(|(_, d)| d.as_ref().map(|c| c.dump.clone())).collect::<Vec<_>>()
    };
    if ids(&our_dvs) != ids(&base_dvs) || dumps(&our_dvs) != dumps(&base_dvs) {
        cx.sink.emit(Diagnostic::new(
            DiagKind::InconsistentOverride,
            span,
            format!("property {name} does not accept the same dynamic variables as the overridden property"),
        ));
    }

    let (our_lazy, our_public) = {
        let d = cx.props.def(pid);
        (d.lazy_field, d.public)
    };
    let (base_lazy, base_public) = {
        let d = cx.props.def(base);
        (d.lazy_field, d.public)
    };
    if our_lazy != base_lazy {
        cx.sink.emit(Diagnostic::new(
            DiagKind::InconsistentOverride,
            span,
            format!("property {name} and the overridden property disagree on lazy-field status"),
        ));
    }
    if our_public != base_public {
        cx.sink.emit(Diagnostic::new(
            DiagKind::InconsistentOverride,
            span,
            format!("property {name} and the overridden property disagree on visibility"),
        ));
    }
}

/// One hierarchy walk per abstract property: collect every concrete
/// subtype of the owner that never gets a concrete override, then report
/// them all in a single diagnostic.
pub fn check_abstract_overrides(cx: &mut CompileCtx) {
    for pid in cx.props.ids().collect::<Vec<_>>() {
        let def = cx.props.def(pid);
        if def.abstractness != Abstractness::Abstract {
            continue;
        }
        let owner = def.owner;
        let name = def.name.clone();
        let span = def.span;
        let mut missing = Vec::new();
        for subtype in cx.types.concrete_subtypes(owner) {
            let resolved = cx.props.lookup(&cx.types, subtype, &name);
            let overridden = resolved
                .map(|p| {
                    let d = cx.props.def(p);
                    d.body.is_some() || d.external
                })
                .unwrap_or(false);
            if !overridden {
                missing.push(cx.types.display(subtype));
            }
        }
        if !missing.is_empty() {
            cx.sink.emit(Diagnostic::new(
                DiagKind::MissingOverride,
                span,
                format!(
                    "abstract property {name} is not overridden on: {}",
                    missing.join(", ")
                ),
            ));
        }
    }
}

/// Mark the bases of override families as dispatchers. Run after every
/// property has reached Attributed.
pub fn compute_dispatchers(cx: &mut CompileCtx) {
    for pid in cx.props.ids().collect::<Vec<_>>() {
        let def = cx.props.def(pid);
        let is_dispatcher = def.base.is_none() && !def.overriders.is_empty();
        cx.props.def_mut(pid).is_dispatcher = is_dispatcher;
    }
}

/// Run the whole pipeline over every declared property. Diagnostics are
/// batched in the sink; a property that fails construction is skipped, the
/// rest still get processed.
pub fn process_properties(cx: &mut CompileCtx) {
    for pid in cx.props.ids().collect::<Vec<_>>() {
        let _ = compute_attributes(cx, pid);
    }
    check_abstract_overrides(cx);
    compute_dispatchers(cx);
}

/// Attributed -> Rendered: emit the property's declaration and body text.
/// Rendering twice is a framework bug and panics, in line with the IR
/// render contract.
pub fn render_property(cx: &mut CompileCtx, pid: PropId) -> CResult<String> {
    compute_attributes(cx, pid)?;
    let def = cx.props.def(pid);
    assert!(
        def.state != PropState::Rendered,
        "property {} rendered twice",
        def.name
    );

    let name = def.name.camel_with_underscores();
    let owner = cx.types.display(def.owner);
    let ret = cx.types.display(def.ty.unwrap_or_else(|| panic!("render before typing")));
    let mut formals = vec![format!("Self : {owner}")];
    for a in &def.args {
        let mut f = format!("{} : {}", a.name.camel_with_underscores(), cx.types.display(a.ty));
        if let Some(d) = &a.default {
            f.push_str(&format!(" := {}", d.text));
        }
        formals.push(f);
    }
    let signature = format!("function {name} ({}) return {ret}", formals.join("; "));

    if def.body.is_none() {
        let text = format!("{signature} is abstract;\n");
        let def = cx.props.def_mut(pid);
        def.rendered = Some(text.clone());
        def.state = PropState::Rendered;
        return Ok(text);
    }

    let trace = def.trace;
    let lazy = def.lazy_storage.clone();
    let def = cx.props.def_mut(pid);
    let mut body = def
        .typed_body
        .take()
        .unwrap_or_else(|| panic!("typed body missing at render time"));
    let def = cx.props.def(pid);
    // the first slots mirror the formals (self plus one per argument) and
    // must not be redeclared as locals
    let param_slots = 1 + def.args.len();
    let mut decls = String::new();
    for slot in def.slots.all_slots().skip(param_slots) {
        let s = def.slots.slot(slot);
        if let Some(ty) = s.ty {
            decls.push_str(&format!(
                "{} : {};\n",
                s.codegen_name.camel_with_underscores(),
                cx.types.display(ty)
            ));
        }
    }
    let mut rcx = RenderCx::new(&def.slots, &cx.types);
    if trace {
        rcx = rcx.with_trace();
    }
    let pre = body.render_pre(&mut rcx);
    let expr = body.render_expr();

    let text = match lazy {
        Some((storage, present)) => format!(
            "{signature} is\n{decls}begin\nif not Self.{p} then\n{pre}Self.{s} := {expr};\nSelf.{p} := True;\nend if;\nreturn Self.{s};\nend {name};\n",
            p = present.camel_with_underscores(),
            s = storage.camel_with_underscores(),
        ),
        None => format!("{signature} is\n{decls}begin\n{pre}return {expr};\nend {name};\n"),
    };

    let def = cx.props.def_mut(pid);
    def.typed_body = Some(body);
    def.rendered = Some(text.clone());
    def.state = PropState::Rendered;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Severity;

    fn ctx() -> CompileCtx {
        CompileCtx::new(TypeRegistry::with_builtins())
    }

    fn int_prop(cx: &mut CompileCtx, owner: TypeId, name: &str, value: i64) -> PropId {
        let mut b = PropertyBuilder::new(owner, name);
        let e = b.pool.int_lit(Span::synthetic(), value);
        let int = cx.types.int_type();
        b.returns(int);
        b.body(e);
        cx.props.declare(b)
    }

    fn errors_of(cx: &CompileCtx, kind: DiagKind) -> usize {
        cx.sink.diagnostics().iter().filter(|d| d.kind == kind).count()
    }

    #[test]
    fn literal_body_reaches_typed() {
        let mut cx = ctx();
        let node = cx.types.declare_node("expr", None, false);
        let p = int_prop(&mut cx, node, "depth", 3);
        let ty = ensure_typed(&mut cx, p).unwrap();
        assert_eq!(ty, cx.types.int_type());
        let def = cx.props.def(p);
        assert_eq!(def.state, PropState::Typed);
        assert!(def.typed_body.is_some());
        assert!(!cx.sink.has_errors());
    }

    #[test]
    fn bodyless_concrete_property_is_rejected() {
        let mut cx = ctx();
        let node = cx.types.declare_node("expr", None, false);
        let mut b = PropertyBuilder::new(node, "depth");
        let int = cx.types.int_type();
        b.returns(int);
        let p = cx.props.declare(b);
        assert!(ensure_typed(&mut cx, p).is_err());
        assert_eq!(errors_of(&cx, DiagKind::InvalidExpression), 1);
    }

    #[test]
    fn recursive_inference_is_reported() {
        let mut cx = ctx();
        let node = cx.types.declare_node("expr", None, false);
        let mut b = PropertyBuilder::new(node, "depth");
        let this = b.self_var();
        let recv = b.pool.var_ref(Span::synthetic(), this);
        let call = b.pool.call(Span::synthetic(), recv, "depth", vec![]);
        b.body(call);
        let p = cx.props.declare(b);
        assert!(ensure_typed(&mut cx, p).is_err());
        assert_eq!(errors_of(&cx, DiagKind::RecursiveTypeInference), 1);
    }

    #[test]
    fn warn_on_unused_inherits() {
        let mut cx = ctx();
        let base = cx.types.declare_node("expr", None, false);
        let sub = cx.types.declare_node("bin_op", Some(base), false);
        let mut b = PropertyBuilder::new(base, "image");
        let e = b.pool.str_lit(Span::synthetic(), "expr");
        let string = cx.types.string_type();
        b.returns(string);
        b.body(e);
        b.warn_on_unused(false);
        let bp = cx.props.declare(b);
        let mut o = PropertyBuilder::new(sub, "image");
        let e = o.pool.str_lit(Span::synthetic(), "bin_op");
        o.returns(string);
        o.body(e);
        let op = cx.props.declare(o);
        assert!(!cx.props.warn_on_unused(&cx.types, bp));
        assert!(!cx.props.warn_on_unused(&cx.types, op));
        let other = int_prop(&mut cx, sub, "depth", 1);
        assert!(cx.props.warn_on_unused(&cx.types, other));
    }

    #[test]
    fn incompatible_override_return_type() {
        let mut cx = ctx();
        let base = cx.types.declare_node("expr", None, false);
        let sub = cx.types.declare_node("bin_op", Some(base), false);
        int_prop(&mut cx, base, "depth", 1);
        let mut o = PropertyBuilder::new(sub, "depth");
        let e = o.pool.bool_lit(Span::synthetic(), true);
        let boolean = cx.types.bool_type();
        o.returns(boolean);
        o.body(e);
        let op = cx.props.declare(o);
        compute_attributes(&mut cx, op).unwrap();
        assert_eq!(errors_of(&cx, DiagKind::TypeMismatch), 1);
    }

    #[test]
    fn override_argument_mismatch_is_batched() {
        let mut cx = ctx();
        let base = cx.types.declare_node("expr", None, false);
        let sub = cx.types.declare_node("bin_op", Some(base), false);
        let int = cx.types.int_type();
        let boolean = cx.types.bool_type();
        let mut b = PropertyBuilder::new(base, "depth");
        b.arg("levels", int);
        let e = b.pool.int_lit(Span::synthetic(), 1);
        b.returns(int);
        b.body(e);
        cx.props.declare(b);
        let mut o = PropertyBuilder::new(sub, "depth");
        o.arg("count", boolean);
        let e = o.pool.int_lit(Span::synthetic(), 2);
        o.returns(int);
        o.body(e);
        let op = cx.props.declare(o);
        compute_attributes(&mut cx, op).unwrap();
        // name and type mismatches are both reported in one pass
        assert_eq!(errors_of(&cx, DiagKind::InconsistentOverride), 2);
    }

    #[test]
    fn missing_abstract_overrides_reported_once() {
        let mut cx = ctx();
        let base = cx.types.declare_node("expr", None, true);
        let lit = cx.types.declare_node("literal", Some(base), false);
        let bin = cx.types.declare_node("bin_op", Some(base), false);
        cx.types.declare_node("call_expr", Some(base), false);
        let mut b = PropertyBuilder::new(base, "depth");
        let int = cx.types.int_type();
        b.returns(int);
        b.abstract_();
        cx.props.declare(b);
        int_prop(&mut cx, lit, "depth", 0);
        int_prop(&mut cx, bin, "depth", 1);
        check_abstract_overrides(&mut cx);
        let missing: Vec<_> = cx
            .sink
            .diagnostics()
            .iter()
            .filter(|d| d.kind == DiagKind::MissingOverride)
            .collect();
        assert_eq!(missing.len(), 1);
        assert!(missing[0].message.contains("Call_Expr"));
        assert!(!missing[0].message.contains("Literal"));
    }

    #[test]
    fn runtime_check_abstract_is_not_flagged() {
        let mut cx = ctx();
        let base = cx.types.declare_node("expr", None, true);
        cx.types.declare_node("literal", Some(base), false);
        let mut b = PropertyBuilder::new(base, "depth");
        let int = cx.types.int_type();
        b.returns(int);
        b.abstract_runtime_check();
        cx.props.declare(b);
        check_abstract_overrides(&mut cx);
        assert_eq!(errors_of(&cx, DiagKind::MissingOverride), 0);
    }

    #[test]
    fn dispatcher_flag_marks_override_family_bases() {
        let mut cx = ctx();
        let base = cx.types.declare_node("expr", None, false);
        let sub = cx.types.declare_node("bin_op", Some(base), false);
        let bp = int_prop(&mut cx, base, "depth", 1);
        let op = int_prop(&mut cx, sub, "depth", 2);
        let solo = int_prop(&mut cx, base, "width", 0);
        process_properties(&mut cx);
        assert!(cx.props.def(bp).is_dispatcher);
        assert!(!cx.props.def(op).is_dispatcher);
        assert!(!cx.props.def(solo).is_dispatcher);
        assert_eq!(cx.props.def(bp).debug_name(&cx.types), "Expr.Depth (dispatcher)");
        assert_eq!(cx.props.def(op).debug_name(&cx.types), "Bin_Op.Depth");
    }

    #[test]
    fn memoized_external_property_is_rejected() {
        let mut cx = ctx();
        let node = cx.types.declare_node("expr", None, false);
        let mut b = PropertyBuilder::new(node, "depth");
        let int = cx.types.int_type();
        b.returns(int);
        b.external();
        b.memoized();
        let p = cx.props.declare(b);
        compute_attributes(&mut cx, p).unwrap();
        let msgs: Vec<_> = cx
            .sink
            .diagnostics()
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| d.message.as_str())
            .collect();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("cannot be memoized"));
        assert_eq!(
            cx.props.def(p).reason_for_no_memoization(),
            Some(NoMemoReason::External)
        );
    }

    #[test]
    fn lazy_field_gets_storage_names() {
        let mut cx = ctx();
        let node = cx.types.declare_node("expr", None, false);
        let mut b = PropertyBuilder::new(node, "depth");
        let e = b.pool.int_lit(Span::synthetic(), 7);
        let int = cx.types.int_type();
        b.returns(int);
        b.body(e);
        b.lazy_field();
        let p = cx.props.declare(b);
        compute_attributes(&mut cx, p).unwrap();
        let (storage, present) = cx.props.def(p).lazy_storage.clone().unwrap();
        assert_eq!(storage.lower(), "lf_depth");
        assert_eq!(present.lower(), "lf_present_depth");
        let text = render_property(&mut cx, p).unwrap();
        assert!(text.contains("Lf_Present_Depth"));
        assert!(text.contains("Lf_Depth :="));
    }

    #[test]
    fn render_emits_signature_and_body() {
        let mut cx = ctx();
        let node = cx.types.declare_node("expr", None, false);
        let p = int_prop(&mut cx, node, "depth", 3);
        let text = render_property(&mut cx, p).unwrap();
        assert!(text.contains("function Depth (Self : Expr) return Int"));
        assert!(text.contains("return 3;") || text.contains("return 3"));
        assert_eq!(cx.props.def(p).state, PropState::Rendered);
    }

    #[test]
    #[should_panic(expected = "rendered twice")]
    fn rendering_twice_panics() {
        let mut cx = ctx();
        let node = cx.types.declare_node("expr", None, false);
        let p = int_prop(&mut cx, node, "depth", 3);
        render_property(&mut cx, p).unwrap();
        let _ = render_property(&mut cx, p);
    }
}
