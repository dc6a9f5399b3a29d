//! Type representation for HIR.
//!
//! These are the resolved semantic types the type checker hands to the
//! effects pipeline. Generic parameters are positional: `Param(i)` refers to
//! the `i`-th type parameter of the enclosing function or effect and is
//! replaced by [`Type::substitute`] at instantiation time.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::DefId;

/// A resolved semantic type.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Type {
    /// The unit type `()`.
    Unit,
    /// `bool`.
    Bool,
    /// `i32`.
    I32,
    /// `u32`.
    U32,
    /// `i64`.
    I64,
    /// A nominal struct instantiated with type arguments.
    Struct { def_id: DefId, args: Vec<Type> },
    /// The `i`-th generic parameter of the enclosing item.
    Param(u32),
    /// A handler continuation: accepts a `resume` value and produces the
    /// handled expression's `answer`.
    Cont { resume: Box<Type>, answer: Box<Type> },
}

impl Type {
    /// Build a continuation type.
    pub fn cont(resume: Type, answer: Type) -> Type {
        Type::Cont {
            resume: Box::new(resume),
            answer: Box::new(answer),
        }
    }

    /// Build a struct type.
    pub fn structure(def_id: DefId, args: Vec<Type>) -> Type {
        Type::Struct { def_id, args }
    }

    /// Replace generic parameters with the given arguments.
    ///
    /// Parameters without a corresponding argument are left untouched so
    /// partially generic types survive a substitution for an outer scope.
    pub fn substitute(&self, args: &[Type]) -> Type {
        match self {
            Type::Param(i) => args.get(*i as usize).cloned().unwrap_or(Type::Param(*i)),
            Type::Struct { def_id, args: inner } => Type::Struct {
                def_id: *def_id,
                args: inner.iter().map(|t| t.substitute(args)).collect(),
            },
            Type::Cont { resume, answer } => Type::cont(resume.substitute(args), answer.substitute(args)),
            other => other.clone(),
        }
    }

    /// Whether this type mentions no generic parameter.
    pub fn is_concrete(&self) -> bool {
        match self {
            Type::Param(_) => false,
            Type::Struct { args, .. } => args.iter().all(Type::is_concrete),
            Type::Cont { resume, answer } => resume.is_concrete() && answer.is_concrete(),
            _ => true,
        }
    }

    /// Whether this is the unit type.
    pub fn is_unit(&self) -> bool {
        matches!(self, Type::Unit)
    }

    /// Whether values of this type live in a 32-bit register.
    pub fn is_word32(&self) -> bool {
        matches!(self, Type::Unit | Type::Bool | Type::I32 | Type::U32)
    }

    /// Whether values of this type are GC references.
    pub fn is_reference(&self) -> bool {
        matches!(self, Type::Struct { .. } | Type::Cont { .. })
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unit => write!(f, "()"),
            Type::Bool => write!(f, "bool"),
            Type::I32 => write!(f, "i32"),
            Type::U32 => write!(f, "u32"),
            Type::I64 => write!(f, "i64"),
            Type::Param(i) => write!(f, "T{}", i),
            Type::Struct { def_id, args } => {
                write!(f, "{}", def_id)?;
                write_args(f, args)
            }
            Type::Cont { resume, answer } => write!(f, "cont({}) -> {}", resume, answer),
        }
    }
}

/// Format a type argument list as `<A, B>`; nothing when empty.
pub(crate) fn write_args(f: &mut impl fmt::Write, args: &[Type]) -> fmt::Result {
    if args.is_empty() {
        return Ok(());
    }
    write!(f, "<")?;
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", arg)?;
    }
    write!(f, ">")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_nested() {
        let pair = DefId::new(9);
        let ty = Type::cont(Type::Param(0), Type::structure(pair, vec![Type::Param(1)]));
        let out = ty.substitute(&[Type::I32, Type::U32]);
        assert_eq!(out, Type::cont(Type::I32, Type::structure(pair, vec![Type::U32])));
        assert!(out.is_concrete());
        assert!(!ty.is_concrete());
    }

    #[test]
    fn test_substitute_keeps_unbound_params() {
        assert_eq!(Type::Param(2).substitute(&[Type::I32]), Type::Param(2));
    }

    #[test]
    fn test_display() {
        let ty = Type::structure(DefId::new(1), vec![Type::I32, Type::Bool]);
        assert_eq!(ty.to_string(), "def1<i32, bool>");
        assert_eq!(Type::Unit.to_string(), "()");
    }
}
