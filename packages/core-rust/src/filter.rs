//! Row-level filter predicates.
//!
//! [`Filter`] is the predicate tree carried by every read, update, delete and
//! count. The tenant interceptor rewrites it; the in-memory backend evaluates
//! it with [`Filter::matches`].

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::types::{Document, Value};

/// A recursive predicate over a [`Document`].
///
/// Missing attributes evaluate as [`Value::Null`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// Matches every row.
    #[default]
    All,
    /// Matches no row. Injected when no tenant is bound.
    None,
    Eq { attribute: String, value: Value },
    Ne { attribute: String, value: Value },
    In { attribute: String, values: Vec<Value> },
    Gt { attribute: String, value: Value },
    Gte { attribute: String, value: Value },
    Lt { attribute: String, value: Value },
    Lte { attribute: String, value: Value },
    And { children: Vec<Filter> },
    Or { children: Vec<Filter> },
    Not { child: Box<Filter> },
}

impl Filter {
    #[must_use]
    pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Conjunction of `self` and `other`, flattening nested `And`s and
    /// dropping `All` operands.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        let mut children = Vec::new();
        for f in [self, other] {
            match f {
                Filter::All => {}
                Filter::And { children: inner } => children.extend(inner),
                f => children.push(f),
            }
        }
        match children.len() {
            0 => Filter::All,
            1 => children.remove(0),
            _ => Filter::And { children },
        }
    }

    /// Evaluates this predicate against one row.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        static NULL: Value = Value::Null;
        let get = |attr: &str| doc.get(attr).unwrap_or(&NULL);
        let cmp = |attr: &str, value: &Value| get(attr).compare(value);

        match self {
            Filter::All => true,
            Filter::None => false,
            Filter::Eq { attribute, value } => get(attribute) == value,
            Filter::Ne { attribute, value } => get(attribute) != value,
            Filter::In { attribute, values } => values.contains(get(attribute)),
            Filter::Gt { attribute, value } => cmp(attribute, value) == Some(Ordering::Greater),
            Filter::Gte { attribute, value } => matches!(
                cmp(attribute, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lt { attribute, value } => cmp(attribute, value) == Some(Ordering::Less),
            Filter::Lte { attribute, value } => {
                matches!(cmp(attribute, value), Some(Ordering::Less | Ordering::Equal))
            }
            Filter::And { children } => children.iter().all(|c| c.matches(doc)),
            Filter::Or { children } => children.iter().any(|c| c.matches(doc)),
            Filter::Not { child } => !child.matches(doc),
        }
    }

    /// Whether any node of the tree constrains `attribute`.
    #[must_use]
    pub fn references(&self, attribute: &str) -> bool {
        match self {
            Filter::All | Filter::None => false,
            Filter::Eq { attribute: a, .. }
            | Filter::Ne { attribute: a, .. }
            | Filter::In { attribute: a, .. }
            | Filter::Gt { attribute: a, .. }
            | Filter::Gte { attribute: a, .. }
            | Filter::Lt { attribute: a, .. }
            | Filter::Lte { attribute: a, .. } => a == attribute,
            Filter::And { children } | Filter::Or { children } => {
                children.iter().any(|c| c.references(attribute))
            }
            Filter::Not { child } => child.references(attribute),
        }
    }

    /// Values that `attribute` is positively required to equal somewhere in
    /// the tree (`Eq` / `In` outside any `Not`).
    #[must_use]
    pub fn positive_values(&self, attribute: &str) -> Vec<&Value> {
        let mut out = Vec::new();
        self.collect_positive(attribute, &mut out);
        out
    }

    fn collect_positive<'a>(&'a self, attribute: &str, out: &mut Vec<&'a Value>) {
        match self {
            Filter::Eq { attribute: a, value } if a == attribute => out.push(value),
            Filter::In { attribute: a, values } if a == attribute => out.extend(values),
            Filter::And { children } | Filter::Or { children } => {
                for c in children {
                    c.collect_positive(attribute, out);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn doc(pairs: &[(&str, Value)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn eq_and_missing_attribute() {
        let d = doc(&[("status", Value::from("open"))]);
        assert!(Filter::eq("status", "open").matches(&d));
        assert!(!Filter::eq("status", "closed").matches(&d));
        assert!(Filter::eq("missing", Value::Null).matches(&d));
    }

    #[test]
    fn range_predicates() {
        let d = doc(&[("score", Value::Int(70))]);
        let gte = Filter::Gte {
            attribute: "score".into(),
            value: Value::Int(70),
        };
        let lt = Filter::Lt {
            attribute: "score".into(),
            value: Value::Float(70.5),
        };
        assert!(gte.matches(&d));
        assert!(lt.matches(&d));
    }

    #[test]
    fn and_flattens_and_drops_all() {
        let f = Filter::All
            .and(Filter::eq("a", 1))
            .and(Filter::eq("b", 2).and(Filter::eq("c", 3)));
        let Filter::And { children } = f else {
            panic!("expected And");
        };
        assert_eq!(children.len(), 3);
        assert_eq!(Filter::All.and(Filter::All), Filter::All);
    }

    #[test]
    fn none_matches_nothing() {
        assert!(!Filter::None.matches(&Document::new()));
        assert!(!Filter::eq("a", 1).and(Filter::None).matches(&doc(&[("a", Value::Int(1))])));
    }

    #[test]
    fn positive_values_skip_negations() {
        let f = Filter::Or {
            children: vec![
                Filter::eq("organization_id", "org-a"),
                Filter::Not {
                    child: Box::new(Filter::eq("organization_id", "org-b")),
                },
                Filter::In {
                    attribute: "organization_id".into(),
                    values: vec![Value::from("org-c")],
                },
            ],
        };
        let vals: Vec<_> = f
            .positive_values("organization_id")
            .into_iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(vals, vec!["org-a", "org-c"]);
        assert!(f.references("organization_id"));
        assert!(!f.references("status"));
    }

    #[test]
    fn serde_shape_is_tagged_by_op() {
        let json = serde_json::to_value(Filter::eq("status", "open")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"op": "eq", "attribute": "status", "value": "open"})
        );
    }

    proptest! {
        /// Conjoining with a predicate never widens the matched set.
        #[test]
        fn and_is_never_wider(a in 0i64..5, b in 0i64..5, x in 0i64..5, y in 0i64..5) {
            let d = doc(&[("x", Value::Int(x)), ("y", Value::Int(y))]);
            let base = Filter::eq("x", a);
            let narrowed = base.clone().and(Filter::eq("y", b));
            prop_assert!(!narrowed.matches(&d) || base.matches(&d));
        }

        #[test]
        fn not_inverts(a in 0i64..5, x in 0i64..5) {
            let d = doc(&[("x", Value::Int(x))]);
            let f = Filter::eq("x", a);
            let not = Filter::Not { child: Box::new(f.clone()) };
            prop_assert_ne!(f.matches(&d), not.matches(&d));
        }
    }
}
