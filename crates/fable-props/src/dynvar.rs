//! Dynamic variables: implicit, stack-bound parameters.
//!
//! A dynamic variable is declared once per compilation with a name and a
//! type. Properties that use one receive it as an artificial argument;
//! callers must either have a binding in scope (their own artificial
//! argument, or an enclosing `bind`) or rely on a declared default.
//! Binding state is per-construction and lives on the construction
//! context, with strict push/pop discipline.

use fable_common::Name;
use fable_types::TypeId;

use crate::ir::{RExpr, RKind};
use crate::prop::PropertyTable;
use crate::scope::SlotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DynVarId(pub u32);

#[derive(Debug)]
pub struct DynVar {
    pub name: Name,
    pub ty: TypeId,
}

/// All dynamic variables declared for a compilation.
#[derive(Debug, Default)]
pub struct DynVarTable {
    vars: Vec<DynVar>,
}

impl DynVarTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: &str, ty: TypeId) -> DynVarId {
        let id = DynVarId(self.vars.len() as u32);
        self.vars.push(DynVar { name: Name::from_lower(name), ty });
        id
    }

    pub fn get(&self, id: DynVarId) -> &DynVar {
        &self.vars[id.0 as usize]
    }

    pub fn name(&self, id: DynVarId) -> &Name {
        &self.vars[id.0 as usize].name
    }

    pub fn ty(&self, id: DynVarId) -> TypeId {
        self.vars[id.0 as usize].ty
    }
}

/// Whether a freshly introduced binding of `dynvar` (held in `slot`) is
/// ever used by `body`: either referenced directly, or implicitly passed
/// to a called property that accepts the dynamic variable. A binding that
/// fails this check is dead and worth a warning.
pub fn binding_is_used(
    body: &RExpr,
    dynvar: DynVarId,
    slot: SlotId,
    props: &PropertyTable,
) -> bool {
    let mut used = false;
    body.walk(&mut |node| match &node.kind {
        RKind::Var { slot: s } if *s == slot => used = true,
        RKind::Call { prop, .. } => {
            if props.def(*prop).dynamic_vars.iter().any(|(dv, _)| *dv == dynvar) {
                used = true;
            }
        }
        _ => {}
    });
    used
}

#[cfg(test)]
mod tests {
    use super::*;
    use fable_common::Span;
    use fable_types::TypeRegistry;

    #[test]
    fn table_assigns_sequential_ids() {
        let types = TypeRegistry::with_builtins();
        let mut dynvars = DynVarTable::new();
        let a = dynvars.define("env", types.bool_type());
        let b = dynvars.define("origin", types.int_type());
        assert_ne!(a, b);
        assert_eq!(dynvars.name(a).lower(), "env");
        assert_eq!(dynvars.ty(b), types.int_type());
    }

    #[test]
    fn direct_reference_counts_as_used() {
        let types = TypeRegistry::with_builtins();
        let mut dynvars = DynVarTable::new();
        let dv = dynvars.define("origin", types.int_type());
        let props = PropertyTable::new();

        let mut slots = crate::scope::SlotPool::new();
        let slot = slots.create(&Name::from_lower("origin"), Some(types.int_type()));
        let name = slots.codegen_name(slot).clone();
        let body = RExpr::var(slot, &name, types.int_type(), Span::synthetic());
        assert!(binding_is_used(&body, dv, slot, &props));

        let other = RExpr::new(
            RKind::Lit { text: "1".into() },
            types.int_type(),
            Span::synthetic(),
        );
        assert!(!binding_is_used(&other, dv, slot, &props));
    }
}
