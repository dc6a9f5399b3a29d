//! Definition identifiers for HIR.
//!
//! Tarn uses three kinds of identifiers:
//! - [`DefId`] - Global identifier for items (functions, effects, structs)
//! - [`LocalId`] - Local identifier for variables within a function body
//! - [`ExprId`] - Identifier for an expression node within a function body

use serde::{Deserialize, Serialize};
use std::fmt;

/// A globally unique identifier for a definition (item).
///
/// DefIds are assigned during name resolution and remain stable
/// throughout compilation. They serve as keys in the program's item maps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefId {
    /// Module-local index for this definition.
    pub index: u32,
}

impl DefId {
    /// Create a new DefId with the given index.
    pub const fn new(index: u32) -> Self {
        Self { index }
    }

    /// The index of this definition.
    pub const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for DefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DefId({})", self.index)
    }
}

impl fmt::Display for DefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "def{}", self.index)
    }
}

/// A local variable identifier within a function body.
///
/// LocalIds are unique within a single function, including the locals of
/// every handled body and handler clause nested in it. Nothing shadows.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId {
    /// Body-local index for this variable.
    pub index: u32,
}

impl LocalId {
    /// Create a new LocalId with the given index.
    pub const fn new(index: u32) -> Self {
        Self { index }
    }

    /// The index of this local.
    pub const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalId({})", self.index)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_{}", self.index)
    }
}

/// An expression identifier, unique within one function.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExprId {
    pub index: u32,
}

impl ExprId {
    pub const fn new(index: u32) -> Self {
        Self { index }
    }
}

impl fmt::Debug for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExprId({})", self.index)
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(DefId::new(3).to_string(), "def3");
        assert_eq!(LocalId::new(7).to_string(), "_7");
        assert_eq!(ExprId::new(12).to_string(), "e12");
    }

    #[test]
    fn test_ordering_follows_index() {
        let mut ids = vec![LocalId::new(4), LocalId::new(1), LocalId::new(2)];
        ids.sort();
        assert_eq!(ids, vec![LocalId::new(1), LocalId::new(2), LocalId::new(4)]);
    }
}
