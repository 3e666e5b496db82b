//! Type registry for the Fable property compiler.
//!
//! Owns every type the expression compiler can talk about: scalar builtins,
//! ref-counted builtins (big integers, strings, arrays), the nominal node
//! hierarchy with its entity counterparts, and enumeration types. All types
//! are interned; the rest of the compiler passes [`TypeId`]s around and asks
//! the registry for structure when it needs it.

pub mod registry;

pub use registry::{TypeId, TypeInfo, TypeKind, TypeRegistry};
