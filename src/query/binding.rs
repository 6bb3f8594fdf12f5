//! Solution rows: partial maps from variables to terms.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::term::{Term, Var};

/// A single solution row. Unbound variables are simply absent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Binding {
    values: BTreeMap<Var, Term>,
}

impl Binding {
    /// Empty binding; the join identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binding holding a single variable.
    pub fn from_binding(var: impl Into<Var>, term: Term) -> Self {
        let mut values = BTreeMap::new();
        values.insert(var.into(), term);
        Self { values }
    }

    /// Builder-style insert.
    pub fn with(mut self, var: impl Into<Var>, term: Term) -> Self {
        self.values.insert(var.into(), term);
        self
    }

    /// Returns the term bound to `var`.
    pub fn get(&self, var: &Var) -> Option<&Term> {
        self.values.get(var)
    }

    /// Returns true when `var` is bound.
    pub fn contains(&self, var: &Var) -> bool {
        self.values.contains_key(var)
    }

    /// Binds `var`, replacing any previous value.
    pub fn insert(&mut self, var: Var, term: Term) {
        self.values.insert(var, term);
    }

    /// Number of bound variables.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bound variables in order.
    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        self.values.keys()
    }

    /// Bound (variable, term) pairs in variable order.
    pub fn iter(&self) -> impl Iterator<Item = (&Var, &Term)> {
        self.values.iter()
    }

    /// Two bindings are compatible when every shared variable has the same term.
    pub fn is_compatible(&self, other: &Binding) -> bool {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small
            .values
            .iter()
            .all(|(var, term)| large.values.get(var).map_or(true, |t| t == term))
    }

    /// Union of two compatible bindings, `None` when they disagree.
    pub fn merge(&self, other: &Binding) -> Option<Binding> {
        if !self.is_compatible(other) {
            return None;
        }
        let mut merged = self.clone();
        for (var, term) in &other.values {
            merged.values.entry(var.clone()).or_insert_with(|| term.clone());
        }
        Some(merged)
    }

    /// Keeps only the listed variables.
    pub fn project(&self, vars: &[Var]) -> Binding {
        let values = vars
            .iter()
            .filter_map(|var| self.values.get(var).map(|t| (var.clone(), t.clone())))
            .collect();
        Binding { values }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, (var, term)) in self.values.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{var}={term}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(Var, Term)> for Binding {
    fn from_iter<I: IntoIterator<Item = (Var, Term)>>(iter: I) -> Self {
        Binding {
            values: iter.into_iter().collect(),
        }
    }
}
