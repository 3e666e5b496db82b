//! Variable slots and the per-property scope tree.
//!
//! Every intermediate result that generated code must hold lives in a
//! slot. Slots are owned by scopes; scopes form a tree rooted at one root
//! scope per property, and generated code finalizes ref-counted slots in
//! post-order, children before parent. A slot left without a scope at the
//! end of construction is a framework bug, not a user error, so
//! [`SlotPool::check_scopes`] panics on it.

use fable_common::{Name, NameTable};
use fable_types::{TypeId, TypeRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

#[derive(Debug)]
pub struct Slot {
    /// Name as requested at the binding site.
    pub name: Name,
    /// Disambiguated name used in generated code.
    pub codegen_name: Name,
    /// Filled at creation or deferred until the slot's value is resolved.
    pub ty: Option<TypeId>,
    /// Owning scope. Assigned exactly once.
    pub scope: Option<ScopeId>,
}

#[derive(Debug)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    pub slots: Vec<SlotId>,
}

/// Slot allocator and scope tree for one property.
#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<Slot>,
    scopes: Vec<Scope>,
    names: NameTable,
    current: ScopeId,
}

impl Default for SlotPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotPool {
    /// Fresh pool with an empty root scope, which is also the current one.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            scopes: vec![Scope { parent: None, children: Vec::new(), slots: Vec::new() }],
            names: NameTable::new(),
            current: ScopeId(0),
        }
    }

    pub fn root_scope(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn current_scope(&self) -> ScopeId {
        self.current
    }

    /// Allocate a slot in the currently active scope.
    pub fn create(&mut self, name: &Name, ty: Option<TypeId>) -> SlotId {
        let id = self.create_scopeless(name, ty);
        self.add_to_scope(id);
        id
    }

    /// Allocate a slot with no owning scope yet. The caller must assign one
    /// via [`SlotPool::add_to_scope`] before construction finishes.
    pub fn create_scopeless(&mut self, name: &Name, ty: Option<TypeId>) -> SlotId {
        let codegen_name = self.names.acquire(name);
        let id = SlotId(self.slots.len() as u32);
        self.slots.push(Slot { name: name.clone(), codegen_name, ty, scope: None });
        id
    }

    /// Allocate a slot for a deliberately ignored binding.
    pub fn create_ignored(&mut self, ty: Option<TypeId>) -> SlotId {
        let name = self.names.acquire_unused();
        let id = SlotId(self.slots.len() as u32);
        self.slots.push(Slot { name: name.clone(), codegen_name: name, ty, scope: None });
        id
    }

    /// Assign a scopeless slot to the currently active scope.
    ///
    /// Panics if the slot already has an owner: scope assignment happens
    /// exactly once.
    pub fn add_to_scope(&mut self, slot: SlotId) {
        let current = self.current;
        let s = &mut self.slots[slot.0 as usize];
        assert!(
            s.scope.is_none(),
            "slot {} already belongs to a scope",
            s.codegen_name
        );
        s.scope = Some(current);
        self.scopes[current.0 as usize].slots.push(slot);
    }

    pub fn set_type(&mut self, slot: SlotId, ty: TypeId) {
        self.slots[slot.0 as usize].ty = Some(ty);
    }

    pub fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id.0 as usize]
    }

    pub fn codegen_name(&self, id: SlotId) -> &Name {
        &self.slots[id.0 as usize].codegen_name
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub(crate) fn push_scope(&mut self) -> ScopeId {
        self.push()
    }

    pub(crate) fn pop_scope(&mut self) {
        self.pop()
    }

    fn push(&mut self) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope { parent: Some(self.current), children: Vec::new(), slots: Vec::new() });
        self.scopes[self.current.0 as usize].children.push(id);
        self.current = id;
        id
    }

    fn pop(&mut self) {
        let parent = self.scopes[self.current.0 as usize]
            .parent
            .unwrap_or_else(|| panic!("cannot pop the root scope"));
        self.current = parent;
    }

    /// Run `f` inside a fresh child of the current scope. The child is
    /// entered before `f` and left after it on every path, including when
    /// `f` returns an error, so the scope tree stays consistent even when
    /// construction is aborted by a diagnostic.
    pub fn in_child_scope<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> (ScopeId, T) {
        let id = self.push();
        let result = f(self);
        self.pop();
        (id, result)
    }

    /// End-of-construction invariant: every slot has exactly one owning
    /// scope. Panics on violation; an orphaned slot is a framework bug.
    pub fn check_scopes(&self) {
        for slot in &self.slots {
            assert!(
                slot.scope.is_some(),
                "slot {} was never assigned to a scope",
                slot.codegen_name
            );
        }
    }

    /// Whether any slot in `scope` (not counting child scopes) holds a
    /// ref-counted value, which generated code must release when the scope
    /// ends.
    pub fn scope_has_refcounted_slots(&self, scope: ScopeId, types: &TypeRegistry) -> bool {
        self.scopes[scope.0 as usize]
            .slots
            .iter()
            .any(|&s| matches!(self.slot(s).ty, Some(ty) if types.is_refcounted(ty)))
    }

    /// Whether any slot of the whole property holds a ref-counted value.
    pub fn has_refcounted_slots(&self, types: &TypeRegistry) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(s.ty, Some(ty) if types.is_refcounted(ty)))
    }

    pub fn all_slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        (0..self.slots.len() as u32).map(SlotId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fable_common::Name;

    #[test]
    fn names_are_disambiguated() {
        let mut pool = SlotPool::new();
        let n = Name::from_lower("item");
        let a = pool.create(&n, None);
        let b = pool.create(&n, None);
        assert_eq!(pool.codegen_name(a).lower(), "item");
        assert_eq!(pool.codegen_name(b).lower(), "item_2");
    }

    #[test]
    fn child_scopes_nest_and_restore() {
        let mut pool = SlotPool::new();
        let root = pool.current_scope();
        let (child, inner) = pool.in_child_scope(|p| {
            let inner = p.current_scope();
            let (grand, _) = p.in_child_scope(|p2| {
                assert_ne!(p2.current_scope(), inner);
            });
            assert_eq!(p.scope(grand).parent, Some(inner));
            inner
        });
        assert_eq!(child, inner);
        assert_eq!(pool.current_scope(), root);
        assert_eq!(pool.scope(root).children, vec![child]);
    }

    #[test]
    fn scope_restored_on_error_path() {
        let mut pool = SlotPool::new();
        let root = pool.current_scope();
        let (_, res): (_, Result<(), ()>) = pool.in_child_scope(|_| Err(()));
        assert!(res.is_err());
        assert_eq!(pool.current_scope(), root);
    }

    #[test]
    #[should_panic(expected = "never assigned to a scope")]
    fn orphaned_slot_is_fatal() {
        let mut pool = SlotPool::new();
        pool.create_scopeless(&Name::from_lower("dangling"), None);
        pool.check_scopes();
    }

    #[test]
    #[should_panic(expected = "already belongs to a scope")]
    fn double_scope_assignment_is_fatal() {
        let mut pool = SlotPool::new();
        let s = pool.create(&Name::from_lower("v"), None);
        pool.add_to_scope(s);
    }

    #[test]
    fn refcounted_slot_detection() {
        let mut types = fable_types::TypeRegistry::with_builtins();
        let mut pool = SlotPool::new();
        pool.create(&Name::from_lower("n"), Some(types.int_type()));
        assert!(!pool.has_refcounted_slots(&types));
        let arr = types.array_of(types.int_type());
        pool.create(&Name::from_lower("xs"), Some(arr));
        assert!(pool.has_refcounted_slots(&types));
    }
}
