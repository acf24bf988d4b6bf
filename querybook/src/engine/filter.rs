use super::expr::Expr;
use super::numeric::Num;
use super::value::{compare_values, match_candidates, values_equal};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

/// Compiled query filter.
#[derive(Debug, Clone)]
pub enum Filter {
    /// The empty filter `{}`
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Field(FieldPredicate),
    /// `$expr`
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub struct FieldPredicate {
    pub path: String,
    pub predicate: Predicate,
    /// Compare numbers as fixed-point amounts.
    pub currency: bool,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
    Size(usize),
    /// Array with at least `n` elements.
    MinSize(usize),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn name(&self) -> &'static str {
        match self {
            Predicate::Eq(_) => "$eq",
            Predicate::Ne(_) => "$ne",
            Predicate::Gt(_) => "$gt",
            Predicate::Gte(_) => "$gte",
            Predicate::Lt(_) => "$lt",
            Predicate::Lte(_) => "$lte",
            Predicate::In(_) => "$in",
            Predicate::Nin(_) => "$nin",
            Predicate::Exists(_) => "$exists",
            Predicate::Regex(_) => "$regex",
            Predicate::Size(_) => "$size",
            Predicate::MinSize(_) => "$minSize",
            Predicate::Not(_) => "$not",
        }
    }

    /// Test the values found at a path. An empty slice means the path is missing.
    fn test(&self, candidates: &[&Value], currency: bool) -> bool {
        match self {
            Predicate::Eq(expected) => eq_any(candidates, expected),
            Predicate::Ne(expected) => !eq_any(candidates, expected),
            Predicate::Gt(bound) => cmp_any(candidates, bound, currency, |o| o == Ordering::Greater),
            Predicate::Gte(bound) => cmp_any(candidates, bound, currency, |o| o != Ordering::Less),
            Predicate::Lt(bound) => cmp_any(candidates, bound, currency, |o| o == Ordering::Less),
            Predicate::Lte(bound) => cmp_any(candidates, bound, currency, |o| o != Ordering::Greater),
            Predicate::In(options) => options.iter().any(|option| eq_any(candidates, option)),
            Predicate::Nin(options) => !options.iter().any(|option| eq_any(candidates, option)),
            Predicate::Exists(expected) => !candidates.is_empty() == *expected,
            Predicate::Regex(re) => expanded(candidates)
                .iter()
                .any(|value| value.as_str().is_some_and(|s| re.is_match(s))),
            Predicate::Size(n) => candidates
                .iter()
                .any(|value| value.as_array().is_some_and(|items| items.len() == *n)),
            Predicate::MinSize(n) => candidates
                .iter()
                .any(|value| value.as_array().is_some_and(|items| items.len() >= *n)),
            Predicate::Not(inner) => !inner.test(candidates, currency),
        }
    }
}

/// Candidates plus the elements of any array candidate.
fn expanded<'a>(candidates: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(candidates.len());
    for value in candidates {
        out.push(*value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn eq_any(candidates: &[&Value], expected: &Value) -> bool {
    if expected.is_null() && candidates.is_empty() {
        return true;
    }
    expanded(candidates)
        .iter()
        .any(|value| values_equal(value, expected))
}

/// Range comparisons only match values of the same kind as the bound.
fn cmp_any(
    candidates: &[&Value],
    bound: &Value,
    currency: bool,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    expanded(candidates).iter().any(|value| {
        let ord = match (value, bound) {
            (Value::Number(a), Value::Number(b)) => {
                Num::from_json(a, currency).compare(Num::from_json(b, currency))
            }
            (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Null, Value::Null)
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_)) => compare_values(value, bound),
            _ => return false,
        };
        accept(ord)
    })
}

impl Filter {
    pub fn field(path: &str, predicate: Predicate) -> Filter {
        Filter::Field(FieldPredicate {
            path: path.to_string(),
            predicate,
            currency: false,
        })
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Filter::All)
    }

    pub fn matches(&self, doc: &Value) -> Result<bool, String> {
        match self {
            Filter::All => Ok(true),
            Filter::And(parts) => {
                for part in parts {
                    if !part.matches(doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Or(parts) => {
                for part in parts {
                    if part.matches(doc)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Filter::Nor(parts) => {
                for part in parts {
                    if part.matches(doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Field(field) => {
                let candidates = match_candidates(doc, &field.path);
                Ok(field.predicate.test(&candidates, field.currency))
            }
            Filter::Expr(expr) => Ok(expr.eval(doc)?.is_truthy()),
        }
    }
}
