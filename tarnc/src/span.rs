//! Source locations attached to HIR nodes.
//!
//! The front end fills these in; the effects pipeline only carries them
//! through to its diagnostics. Nodes the pipeline creates itself use
//! [`Span::dummy`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte range `start..end` in the source text, plus the line and column of
/// `start` for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    /// 1-based; 0 marks a synthesized node.
    pub line: u32,
    /// 1-based.
    pub column: u32,
}

impl Span {
    pub fn new(start: usize, end: usize, line: u32, column: u32) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }

    pub fn dummy() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

impl Default for Span {
    fn default() -> Self {
        Self::dummy()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            0 => f.write_str("<synthesized>"),
            line => write!(f, "{}:{}", line, self.column),
        }
    }
}
