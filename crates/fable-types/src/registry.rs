//! Interned type arena: builtins, node hierarchy, entities, arrays, enums.

use std::fmt;

use fable_common::Name;
use rustc_hash::FxHashMap;
use serde::Serialize;

/// Index into the [`TypeRegistry`] arena.
///
/// Type identity is the id: two structurally equal types always intern to
/// the same `TypeId`, so equality checks on ids are sufficient everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TypeId(pub u32);

/// What kind of type a registry entry is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    /// Plain scalar builtin: `Bool`, `Int`, `Symbol`, `Character`.
    Scalar,
    /// Arbitrary-precision integer. Ref-counted.
    BigInt,
    /// Immutable string. Ref-counted.
    String,
    /// Array of `element`. Ref-counted.
    Array { element: TypeId },
    /// Equation between logic variables, consumed by the runtime solver.
    /// Ref-counted.
    Equation,
    /// Node type in the nominal hierarchy. `base` is `None` only for the
    /// root node type. Nullable.
    Node { base: Option<TypeId>, is_abstract: bool },
    /// Entity wrapper around a node type (node + resolution metadata).
    /// Follows the node hierarchy for subtyping. Nullable.
    Entity { node: TypeId },
    /// Enumeration with named variants.
    Enum { variants: Vec<Name> },
}

/// One interned type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub name: Name,
    pub kind: TypeKind,
}

/// Arena of all types known to a compilation.
///
/// Construct with [`TypeRegistry::with_builtins`], then declare node types
/// from root to leaves. Arrays and entities are interned on first request.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: Vec<TypeInfo>,
    by_name: FxHashMap<Name, TypeId>,
    arrays: FxHashMap<TypeId, TypeId>,
    entities: FxHashMap<TypeId, TypeId>,
    fields: FxHashMap<TypeId, Vec<(Name, TypeId)>>,
    bool_: Option<TypeId>,
    int: Option<TypeId>,
    big_int: Option<TypeId>,
    string: Option<TypeId>,
    symbol: Option<TypeId>,
    character: Option<TypeId>,
    equation: Option<TypeId>,
    logic_var: Option<TypeId>,
}

impl TypeRegistry {
    /// Empty registry pre-populated with the scalar and ref-counted builtins.
    pub fn with_builtins() -> Self {
        let mut reg = Self::default();
        reg.bool_ = Some(reg.add(Name::from_lower("bool"), TypeKind::Scalar));
        reg.int = Some(reg.add(Name::from_lower("int"), TypeKind::Scalar));
        reg.big_int = Some(reg.add(Name::from_lower("big_int"), TypeKind::BigInt));
        reg.string = Some(reg.add(Name::from_lower("string"), TypeKind::String));
        reg.symbol = Some(reg.add(Name::from_lower("symbol"), TypeKind::Scalar));
        reg.character = Some(reg.add(Name::from_lower("character"), TypeKind::Scalar));
        reg.equation = Some(reg.add(Name::from_lower("equation"), TypeKind::Equation));
        reg.logic_var = Some(reg.add(Name::from_lower("logic_var"), TypeKind::Scalar));
        reg
    }

    fn add(&mut self, name: Name, kind: TypeKind) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.by_name.insert(name.clone(), id);
        self.types.push(TypeInfo { name, kind });
        id
    }

    pub fn bool_type(&self) -> TypeId {
        self.bool_.unwrap()
    }

    pub fn int_type(&self) -> TypeId {
        self.int.unwrap()
    }

    pub fn big_int_type(&self) -> TypeId {
        self.big_int.unwrap()
    }

    pub fn string_type(&self) -> TypeId {
        self.string.unwrap()
    }

    pub fn symbol_type(&self) -> TypeId {
        self.symbol.unwrap()
    }

    pub fn char_type(&self) -> TypeId {
        self.character.unwrap()
    }

    pub fn equation_type(&self) -> TypeId {
        self.equation.unwrap()
    }

    pub fn logic_var_type(&self) -> TypeId {
        self.logic_var.unwrap()
    }

    /// Declare a node type deriving from `base` (`None` for the root).
    ///
    /// Nodes must be declared base-first; subtype enumeration relies on
    /// declaration order being a pre-order of the hierarchy.
    pub fn declare_node(&mut self, name: &str, base: Option<TypeId>, is_abstract: bool) -> TypeId {
        if let Some(b) = base {
            assert!(
                matches!(self.info(b).kind, TypeKind::Node { .. }),
                "base of a node type must be a node type"
            );
        }
        self.add(Name::from_lower(name), TypeKind::Node { base, is_abstract })
    }

    /// Declare an enumeration type with the given variant names.
    pub fn declare_enum(&mut self, name: &str, variants: &[&str]) -> TypeId {
        let variants = variants.iter().map(|v| Name::from_lower(v)).collect();
        self.add(Name::from_lower(name), TypeKind::Enum { variants })
    }

    /// Interned array type over `element`.
    pub fn array_of(&mut self, element: TypeId) -> TypeId {
        if let Some(&id) = self.arrays.get(&element) {
            return id;
        }
        let name = self.info(element).name.concat("array");
        let id = self.add(name, TypeKind::Array { element });
        self.arrays.insert(element, id);
        id
    }

    /// Interned entity type over `node`. Panics if `node` is not a node type.
    pub fn entity_of(&mut self, node: TypeId) -> TypeId {
        assert!(
            matches!(self.info(node).kind, TypeKind::Node { .. }),
            "entity types wrap node types"
        );
        if let Some(&id) = self.entities.get(&node) {
            return id;
        }
        let name = self.info(node).name.concat("entity");
        let id = self.add(name, TypeKind::Entity { node });
        self.entities.insert(node, id);
        id
    }

    /// Declare a data field on a node type. Fields are inherited by derived
    /// node types.
    pub fn add_field(&mut self, node: TypeId, name: &str, ty: TypeId) {
        assert!(self.is_node(node), "data fields belong to node types");
        self.fields
            .entry(node)
            .or_default()
            .push((Name::from_lower(name), ty));
    }

    /// Look up a data field by name on `node`, walking up the derivation
    /// chain. Returns the field's declared type.
    pub fn field_of(&self, node: TypeId, name: &Name) -> Option<TypeId> {
        self.ancestors(node).into_iter().find_map(|t| {
            self.fields
                .get(&t)?
                .iter()
                .find(|(n, _)| n == name)
                .map(|&(_, ty)| ty)
        })
    }

    pub fn info(&self, id: TypeId) -> &TypeInfo {
        &self.types[id.0 as usize]
    }

    pub fn lookup(&self, name: &Name) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    /// User-facing rendering of a type name.
    pub fn display(&self, id: TypeId) -> String {
        self.info(id).name.camel_with_underscores()
    }

    /// Whether values of this type carry a reference count that generated
    /// code must manage.
    pub fn is_refcounted(&self, id: TypeId) -> bool {
        matches!(
            self.info(id).kind,
            TypeKind::BigInt | TypeKind::String | TypeKind::Array { .. } | TypeKind::Equation
        )
    }

    /// Whether the type has a null value usable as an error fallback.
    pub fn null_allowed(&self, id: TypeId) -> bool {
        matches!(
            self.info(id).kind,
            TypeKind::Node { .. } | TypeKind::Entity { .. }
        )
    }

    pub fn is_node(&self, id: TypeId) -> bool {
        matches!(self.info(id).kind, TypeKind::Node { .. })
    }

    pub fn is_entity(&self, id: TypeId) -> bool {
        matches!(self.info(id).kind, TypeKind::Entity { .. })
    }

    pub fn is_abstract_node(&self, id: TypeId) -> bool {
        matches!(self.info(id).kind, TypeKind::Node { is_abstract: true, .. })
    }

    /// The node a type designates: the type itself for nodes, the wrapped
    /// node for entities, `None` otherwise.
    pub fn node_of(&self, id: TypeId) -> Option<TypeId> {
        match self.info(id).kind {
            TypeKind::Node { .. } => Some(id),
            TypeKind::Entity { node } => Some(node),
            _ => None,
        }
    }

    pub fn element_of(&self, id: TypeId) -> Option<TypeId> {
        match self.info(id).kind {
            TypeKind::Array { element } => Some(element),
            _ => None,
        }
    }

    /// Derivation chain of a node type, from the type itself up to the root.
    pub fn ancestors(&self, node: TypeId) -> Vec<TypeId> {
        let mut chain = vec![node];
        let mut cur = node;
        while let TypeKind::Node { base: Some(b), .. } = self.info(cur).kind {
            chain.push(b);
            cur = b;
        }
        chain
    }

    /// Whether `actual` is acceptable where `expected` is expected: equal
    /// types always match, node and entity types additionally match any of
    /// their ancestors.
    pub fn matches(&self, actual: TypeId, expected: TypeId) -> bool {
        if actual == expected {
            return true;
        }
        match (self.node_of(actual), self.node_of(expected)) {
            (Some(a), Some(e)) => {
                self.is_entity(actual) == self.is_entity(expected) && self.ancestors(a).contains(&e)
            }
            _ => false,
        }
    }

    /// Whether `actual` matches `expected` without being equal to it.
    pub fn is_strict_subtype(&self, actual: TypeId, expected: TypeId) -> bool {
        actual != expected && self.matches(actual, expected)
    }

    /// Most specific common type of `a` and `b`: the types themselves when
    /// equal, the nearest common ancestor for node or entity pairs, `None`
    /// otherwise.
    pub fn unify(&mut self, a: TypeId, b: TypeId) -> Option<TypeId> {
        if a == b {
            return Some(a);
        }
        let (an, bn) = (self.node_of(a)?, self.node_of(b)?);
        if self.is_entity(a) != self.is_entity(b) {
            return None;
        }
        let b_chain = self.ancestors(bn);
        let common = self.ancestors(an).into_iter().find(|t| b_chain.contains(t))?;
        Some(if self.is_entity(a) { self.entity_of(common) } else { common })
    }

    /// All concrete node types derived from `node`, including `node` itself
    /// when it is concrete, in hierarchy pre-order.
    pub fn concrete_subtypes(&self, node: TypeId) -> Vec<TypeId> {
        let mut out = Vec::new();
        self.collect_concrete(node, &mut out);
        out
    }

    fn collect_concrete(&self, node: TypeId, out: &mut Vec<TypeId>) {
        if self.is_node(node) && !self.is_abstract_node(node) {
            out.push(node);
        }
        for sub in self.direct_subtypes(node) {
            self.collect_concrete(sub, out);
        }
    }

    /// Direct subtypes of `node`, in declaration order.
    pub fn direct_subtypes(&self, node: TypeId) -> Vec<TypeId> {
        (0..self.types.len() as u32)
            .map(TypeId)
            .filter(|&t| matches!(self.info(t).kind, TypeKind::Node { base: Some(b), .. } if b == node))
            .collect()
    }
}
