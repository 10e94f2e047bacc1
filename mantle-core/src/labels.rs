//! Label selection: conjunction of term predicates over resource labels.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::iter::FromIterator;
use wildmatch::WildMatch;

type Map = BTreeMap<String, String>;

/// A single label predicate.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Term {
    /// The key is present, with any value.
    Exists(String),
    /// The key is present with exactly this value.
    Equal(String, String),
    /// The key is present and its value is in the set.
    In(String, BTreeSet<String>),
    /// The key is absent, or its value is not in the set.
    NotIn(String, BTreeSet<String>),
    /// The key is present and its value matches a `*`/`?` wildcard pattern.
    Glob(String, String),
}

impl Term {
    fn matches(&self, labels: &Map) -> bool {
        match self {
            Term::Exists(key) => labels.contains_key(key),
            Term::Equal(key, value) => labels.get(key) == Some(value),
            Term::In(key, values) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            Term::NotIn(key, values) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            Term::Glob(key, pattern) => match labels.get(key) {
                Some(v) => WildMatch::new(pattern).matches(v),
                None => false,
            },
        }
    }

    /// The key this term constrains.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Term::Exists(key)
            | Term::Equal(key, _)
            | Term::In(key, _)
            | Term::NotIn(key, _)
            | Term::Glob(key, _) => key,
        }
    }
}

/// A conjunction of [`Term`]s. The empty selector selects everything.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct Selector(Vec<Term>);

impl Selector {
    /// The match-all selector.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Shorthand for a single equality constraint.
    #[must_use]
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Term::Equal(key.into(), value.into()).into()
    }

    /// Shorthand for a single existence constraint.
    #[must_use]
    pub fn exists(key: impl Into<String>) -> Self {
        Term::Exists(key.into()).into()
    }

    /// Extends the conjunction with another term.
    #[must_use]
    pub fn and(mut self, term: Term) -> Self {
        self.0.push(term);
        self
    }

    /// Whether this selector matches every resource.
    #[must_use]
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn matches(&self, labels: &Map) -> bool {
        self.0.iter().all(|term| term.matches(labels))
    }

    /// The terms of the conjunction.
    #[must_use]
    pub fn terms(&self) -> &[Term] {
        &self.0
    }
}

impl From<Term> for Selector {
    fn from(term: Term) -> Self {
        Self(vec![term])
    }
}

impl FromIterator<Term> for Selector {
    fn from_iter<T: IntoIterator<Item = Term>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| Term::Equal(k, v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Map {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_selects_all() {
        assert!(Selector::all().matches(&labels(&[])));
        assert!(Selector::all().matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn conjunction_requires_all_terms() {
        let sel = Selector::equal("cluster", "c1").and(Term::Exists("role".into()));
        assert!(sel.matches(&labels(&[("cluster", "c1"), ("role", "worker")])));
        assert!(!sel.matches(&labels(&[("cluster", "c1")])));
        assert!(!sel.matches(&labels(&[("cluster", "c2"), ("role", "worker")])));
    }

    #[test]
    fn set_terms() {
        let set: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        assert!(Term::In("k".into(), set.clone()).matches(&labels(&[("k", "a")])));
        assert!(!Term::In("k".into(), set.clone()).matches(&labels(&[])));
        assert!(Term::NotIn("k".into(), set.clone()).matches(&labels(&[])));
        assert!(!Term::NotIn("k".into(), set).matches(&labels(&[("k", "b")])));
    }

    #[test]
    fn glob_matches_wildcards() {
        let term = Term::Glob("host".into(), "web-*".into());
        assert!(term.matches(&labels(&[("host", "web-01")])));
        assert!(!term.matches(&labels(&[("host", "db-01")])));
        assert!(!term.matches(&labels(&[])));
    }
}
