//! Shared foundation types for the Fable property compiler.
//!
//! Everything here is independent of the type registry and the property
//! tables: source spans with on-demand line/column lookup, and the
//! multi-word name abstraction used for every user-visible identifier.

pub mod names;
pub mod span;

pub use names::{Name, NameTable};
pub use span::{LineIndex, Span};
