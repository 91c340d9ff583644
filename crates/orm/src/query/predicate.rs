//! Resolved filter predicates
//!
//! A `Predicate` is a `Q` tree whose paths have been checked against a model
//! and turned into column comparisons. Evaluation is two-valued: a
//! comparison involving null is false, so `Not` is the exact complement of
//! its child. The SQL renderer preserves this with `NOT COALESCE(.., FALSE)`.

use std::cmp::Ordering;

use super::lookup::Lookup;
use crate::value::{Row, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: String,
        lookup: Lookup,
        value: Value,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(column: impl Into<String>, lookup: Lookup, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            column: column.into(),
            lookup,
            value: value.into(),
        }
    }

    /// `column IN (values)`
    pub fn any_of(column: impl Into<String>, values: Vec<Value>) -> Self {
        Predicate::Compare {
            column: column.into(),
            lookup: Lookup::In,
            value: Value::List(values),
        }
    }

    /// Conjunction, flattening nested `And`s
    pub fn and(self, other: Predicate) -> Predicate {
        match (self, other) {
            (Predicate::And(mut left), Predicate::And(right)) => {
                left.extend(right);
                Predicate::And(left)
            }
            (Predicate::And(mut left), right) => {
                left.push(right);
                Predicate::And(left)
            }
            (left, right) => Predicate::And(vec![left, right]),
        }
    }

    pub fn negate(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }

    /// Evaluate against one row. Missing columns read as null.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::Compare { column, lookup, value } => {
                let actual = row.get(column).unwrap_or(&Value::Null);
                compare(actual, *lookup, value)
            }
            Predicate::And(children) => children.iter().all(|c| c.matches(row)),
            Predicate::Or(children) => children.iter().any(|c| c.matches(row)),
            Predicate::Not(child) => !child.matches(row),
        }
    }
}

fn compare(actual: &Value, lookup: Lookup, expected: &Value) -> bool {
    match lookup {
        Lookup::Exact if expected.is_null() => actual.is_null(),
        Lookup::Exact => actual.sql_eq(expected),
        Lookup::Gt => actual.compare(expected) == Some(Ordering::Greater),
        Lookup::Gte => matches!(
            actual.compare(expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Lookup::Lt => actual.compare(expected) == Some(Ordering::Less),
        Lookup::Lte => matches!(
            actual.compare(expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Lookup::IContains => match (actual, expected) {
            (Value::Text(haystack), Value::Text(needle)) => {
                haystack.to_lowercase().contains(&needle.to_lowercase())
            }
            _ => false,
        },
        Lookup::In => match expected {
            Value::List(candidates) => candidates.iter().any(|c| actual.sql_eq(c)),
            _ => false,
        },
        Lookup::Range => match expected {
            Value::List(bounds) if bounds.len() == 2 => {
                compare(actual, Lookup::Gte, &bounds[0]) && compare(actual, Lookup::Lte, &bounds[1])
            }
            _ => false,
        },
        Lookup::Year | Lookup::Month | Lookup::Day => {
            let part = lookup.date_part().and_then(|p| actual.date_part(p));
            match (part, expected) {
                (Some(part), Value::Int(wanted)) => part == *wanted,
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_not_is_exact_complement_with_nulls() {
        let rows = vec![
            row(&[("author_id", Value::Int(1))]),
            row(&[("author_id", Value::Int(2))]),
            row(&[("author_id", Value::Null)]),
        ];
        let p = Predicate::compare("author_id", Lookup::Gt, 1);
        let hits = rows.iter().filter(|r| p.matches(r)).count();
        let misses = rows.iter().filter(|r| p.clone().negate().matches(r)).count();
        assert_eq!(hits, 1);
        assert_eq!(misses, 2);
    }

    #[test]
    fn test_exact_null_is_is_null() {
        let p = Predicate::compare("author_id", Lookup::Exact, Value::Null);
        assert!(p.matches(&row(&[("author_id", Value::Null)])));
        assert!(!p.matches(&row(&[("author_id", Value::Int(3))])));
    }

    #[test]
    fn test_icontains_and_range() {
        let r = row(&[("title", "Hello Rust".into()), ("views", Value::Int(10))]);
        assert!(Predicate::compare("title", Lookup::IContains, "rUsT").matches(&r));
        assert!(Predicate::compare("views", Lookup::Range, vec![5i64, 10]).matches(&r));
        assert!(!Predicate::compare("views", Lookup::Range, vec![11i64, 20]).matches(&r));
    }

    #[test]
    fn test_and_flattens() {
        let p = Predicate::compare("a", Lookup::Exact, 1)
            .and(Predicate::compare("b", Lookup::Exact, 2))
            .and(Predicate::compare("c", Lookup::Exact, 3));
        match p {
            Predicate::And(children) => assert_eq!(children.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_composites() {
        let r = row(&[]);
        assert!(Predicate::And(vec![]).matches(&r));
        assert!(!Predicate::Or(vec![]).matches(&r));
    }
}
