//! Effect rows.
//!
//! A row is the set of effect instances a computation may perform. Rows are
//! closed ordered sets: iteration order is deterministic, which keeps every
//! downstream pass (site numbering, protocol tables) reproducible.

use std::collections::BTreeSet;
use std::fmt;

use crate::hir::{DefId, Type};

/// One effect instance: an effect declaration applied to type arguments.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectRef {
    pub effect: DefId,
    pub type_args: Vec<Type>,
}

impl EffectRef {
    pub fn new(effect: DefId, type_args: Vec<Type>) -> Self {
        Self { effect, type_args }
    }

    /// A non-generic effect.
    pub fn simple(effect: DefId) -> Self {
        Self::new(effect, Vec::new())
    }

    pub fn substitute(&self, args: &[Type]) -> Self {
        Self {
            effect: self.effect,
            type_args: self.type_args.iter().map(|t| t.substitute(args)).collect(),
        }
    }
}

impl fmt::Debug for EffectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for EffectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.effect)?;
        crate::hir::ty::write_args(f, &self.type_args)
    }
}

/// A set of effect instances.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct EffectRow {
    effects: BTreeSet<EffectRef>,
}

impl EffectRow {
    /// The pure row.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(effect: EffectRef) -> Self {
        let mut row = Self::empty();
        row.effects.insert(effect);
        row
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn contains(&self, effect: &EffectRef) -> bool {
        self.effects.contains(effect)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EffectRef> {
        self.effects.iter()
    }

    /// Add an effect; returns whether the row grew.
    pub fn insert(&mut self, effect: EffectRef) -> bool {
        self.effects.insert(effect)
    }

    /// Add every effect of `other`; returns whether the row grew.
    pub fn absorb(&mut self, other: &EffectRow) -> bool {
        let before = self.effects.len();
        self.effects.extend(other.effects.iter().cloned());
        self.effects.len() != before
    }

    pub fn union(&self, other: &EffectRow) -> EffectRow {
        let mut out = self.clone();
        out.absorb(other);
        out
    }

    /// The row with one effect instance handled.
    pub fn without(&self, effect: &EffectRef) -> EffectRow {
        let mut out = self.clone();
        out.effects.remove(effect);
        out
    }

    /// Instantiate generic parameters mentioned by the row.
    pub fn substitute(&self, args: &[Type]) -> EffectRow {
        EffectRow {
            effects: self.effects.iter().map(|e| e.substitute(args)).collect(),
        }
    }

    pub fn is_subset_of(&self, other: &EffectRow) -> bool {
        self.effects.is_subset(&other.effects)
    }

    /// Effects of `self` missing from `other`, in row order.
    pub fn missing_from<'a>(&'a self, other: &'a EffectRow) -> impl Iterator<Item = &'a EffectRef> + 'a {
        self.effects.difference(&other.effects)
    }
}

impl FromIterator<EffectRef> for EffectRow {
    fn from_iter<I: IntoIterator<Item = EffectRef>>(iter: I) -> Self {
        Self {
            effects: iter.into_iter().collect(),
        }
    }
}

impl fmt::Debug for EffectRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for EffectRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, e) in self.effects.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn eff(i: u32) -> EffectRef {
        EffectRef::simple(DefId::new(i))
    }

    #[test]
    fn test_without_removes_only_the_instance() {
        let state = DefId::new(1);
        let row: EffectRow = vec![
            EffectRef::new(state, vec![Type::I32]),
            EffectRef::new(state, vec![Type::Bool]),
        ]
        .into_iter()
        .collect();
        let handled = row.without(&EffectRef::new(state, vec![Type::I32]));
        assert_eq!(handled.len(), 1);
        assert!(handled.contains(&EffectRef::new(state, vec![Type::Bool])));
    }

    #[test]
    fn test_substitute_instantiates_params() {
        let row = EffectRow::single(EffectRef::new(DefId::new(2), vec![Type::Param(0)]));
        let inst = row.substitute(&[Type::U32]);
        assert!(inst.contains(&EffectRef::new(DefId::new(2), vec![Type::U32])));
    }

    #[test]
    fn test_display_is_ordered() {
        let row: EffectRow = vec![eff(3), eff(1)].into_iter().collect();
        assert_eq!(row.to_string(), "{def1, def3}");
    }

    proptest! {
        #[test]
        fn prop_union_is_commutative(a in proptest::collection::vec(0u32..8, 0..6),
                                     b in proptest::collection::vec(0u32..8, 0..6)) {
            let ra: EffectRow = a.iter().map(|i| eff(*i)).collect();
            let rb: EffectRow = b.iter().map(|i| eff(*i)).collect();
            prop_assert_eq!(ra.union(&rb), rb.union(&ra));
            prop_assert!(ra.is_subset_of(&ra.union(&rb)));
        }

        #[test]
        fn prop_absorb_reports_growth(a in proptest::collection::vec(0u32..8, 0..6), extra in 0u32..8) {
            let mut row: EffectRow = a.iter().map(|i| eff(*i)).collect();
            let had = row.contains(&eff(extra));
            let grew = row.absorb(&EffectRow::single(eff(extra)));
            prop_assert_eq!(grew, !had);
        }
    }
}
