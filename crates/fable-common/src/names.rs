use std::fmt;

use rustc_hash::FxHashSet;
use serde::Serialize;

/// Multi-word identifier, stored as lower-case words.
///
/// Every user-visible identifier in the property compiler (variables,
/// properties, dynamic variables, node fields) is a `Name`. Storage is
/// canonical lower-case-with-underscores; rendering into other casing
/// conventions is done on demand so generated code and diagnostics can
/// each pick the convention they need.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Name {
    words: Vec<String>,
}

impl Name {
    /// Build a name from a lower-case-with-underscores string.
    ///
    /// Empty words (from leading, trailing or doubled underscores) are
    /// dropped so `_internal` and `internal` compare equal.
    pub fn from_lower(text: &str) -> Self {
        let words = text
            .split('_')
            .filter(|w| !w.is_empty())
            .map(|w| w.to_ascii_lowercase())
            .collect();
        Self { words }
    }

    /// Lower-case-with-underscores rendering: `node_env`.
    pub fn lower(&self) -> String {
        self.words.join("_")
    }

    /// Camel-with-underscores rendering: `Node_Env`. This is the casing
    /// used for identifiers in generated code.
    pub fn camel_with_underscores(&self) -> String {
        self.words
            .iter()
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Camel-case rendering with no separators: `NodeEnv`.
    pub fn camel(&self) -> String {
        self.camel_with_underscores().replace('_', "")
    }

    /// Append a suffix string as extra words: `name.concat("2")`.
    pub fn concat(&self, suffix: &str) -> Name {
        let mut words = self.words.clone();
        words.extend(Name::from_lower(suffix).words);
        Name { words }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lower())
    }
}

/// Allocator of collision-free codegen names.
///
/// Given a requested base name, returns either the base itself or the base
/// with the smallest numeric suffix that is not yet taken. Also synthesizes
/// deterministic placeholder names (`unused_1`, `unused_2`, ...) for
/// binding sites whose value is deliberately ignored.
#[derive(Debug, Default)]
pub struct NameTable {
    taken: FxHashSet<Name>,
    next_unused: u32,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a unique name derived from `base`.
    pub fn acquire(&mut self, base: &Name) -> Name {
        if self.taken.insert(base.clone()) {
            return base.clone();
        }
        for i in 2.. {
            let candidate = base.concat(&i.to_string());
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
        }
        unreachable!()
    }

    /// Synthesize a fresh placeholder name for an ignored binding.
    pub fn acquire_unused(&mut self) -> Name {
        self.next_unused += 1;
        self.acquire(&Name::from_lower(&format!("unused_{}", self.next_unused)))
    }

    /// Whether a name has already been handed out.
    pub fn is_taken(&self, name: &Name) -> bool {
        self.taken.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_renderings() {
        let n = Name::from_lower("node_env");
        assert_eq!(n.lower(), "node_env");
        assert_eq!(n.camel_with_underscores(), "Node_Env");
        assert_eq!(n.camel(), "NodeEnv");
    }

    #[test]
    fn name_normalizes_underscores() {
        assert_eq!(Name::from_lower("_internal"), Name::from_lower("internal"));
        assert_eq!(Name::from_lower("a__b").lower(), "a_b");
    }

    #[test]
    fn table_uniquifies_with_suffixes() {
        let mut table = NameTable::new();
        let base = Name::from_lower("item");
        assert_eq!(table.acquire(&base).lower(), "item");
        assert_eq!(table.acquire(&base).lower(), "item_2");
        assert_eq!(table.acquire(&base).lower(), "item_3");
    }

    #[test]
    fn unused_names_are_deterministic() {
        let mut table = NameTable::new();
        assert_eq!(table.acquire_unused().lower(), "unused_1");
        assert_eq!(table.acquire_unused().lower(), "unused_2");
    }
}
