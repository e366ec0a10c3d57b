//! Common definitions that are shared between different parts of the compiler.

// Use sorted maps for deterministic diagnostics and dumps
pub use std::collections::BTreeMap as Map;

/// Identifiers.
pub type Id = internment::Intern<String>;
