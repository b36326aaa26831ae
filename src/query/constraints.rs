//! Constraint Lowering
//!
//! Lowers a WHERE expression into disjunctive normal form: a list of
//! branches, each a flat list of per-attribute bounds that must all hold.
//!
//! Only a single level of disjunction is supported. `OR` may appear at the
//! top of the expression (chains of top-level `OR` are flattened), but an
//! `OR` nested under `AND` is rejected.
//!
//! Bounds travel between the compiler and the user selector in a compact
//! text encoding:
//!
//! ```text
//! "value"        exact match      (attr = value)
//! ":upper"       at most upper    (attr < upper)
//! "lower:upper"  inclusive range  (attr > lower encodes "lower:<max>")
//! "lower:"       at least lower   (!(attr < lower))
//! ```

use crate::query::ast::{Comparator, Expr};
use crate::query::error::{QueryError, QueryResult};
use crate::sources::{AttributeId, AttributeValue};
use std::cmp::Ordering;
use std::fmt;

/// Upper end written for `attr > value`
pub const UNBOUNDED_MAX: i64 = i64::MAX;

/// Accepted values for one attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
    Exact(String),
    Range { lower: String, upper: String },
    AtLeast(String),
    AtMost(String),
}

impl Bound {
    /// Encode as `"value"`, `"lower:upper"`, `"lower:"` or `":upper"`
    pub fn encode(&self) -> String {
        match self {
            Self::Exact(v) => v.clone(),
            Self::Range { lower, upper } => format!("{}:{}", lower, upper),
            Self::AtLeast(lower) => format!("{}:", lower),
            Self::AtMost(upper) => format!(":{}", upper),
        }
    }

    pub fn decode(encoded: &str) -> QueryResult<Self> {
        let parts: Vec<&str> = encoded.split(':').collect();
        match parts.as_slice() {
            [value] => Ok(Self::Exact(value.to_string())),
            ["", ""] => Err(QueryError::InvalidBound(encoded.to_string())),
            [lower, ""] => Ok(Self::AtLeast(lower.to_string())),
            ["", upper] => Ok(Self::AtMost(upper.to_string())),
            [lower, upper] => Ok(Self::Range {
                lower: lower.to_string(),
                upper: upper.to_string(),
            }),
            _ => Err(QueryError::InvalidBound(format!(
                "more than two bounds in '{}'",
                encoded
            ))),
        }
    }

    /// Whether a stored value satisfies this bound. Range ends are inclusive.
    pub fn admits(&self, value: &AttributeValue) -> bool {
        match self {
            Self::Exact(v) => value.compare_literal(v) == Ordering::Equal,
            Self::Range { lower, upper } => {
                value.compare_literal(lower) != Ordering::Less
                    && value.compare_literal(upper) != Ordering::Greater
            }
            Self::AtLeast(lower) => value.compare_literal(lower) != Ordering::Less,
            Self::AtMost(upper) => value.compare_literal(upper) != Ordering::Greater,
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// A bound on one attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub attr: AttributeId,
    pub bound: Bound,
}

/// Conjunction of constraints
pub type Branch = Vec<Constraint>;

/// Lower an optional WHERE clause into DNF.
///
/// Always returns at least one branch; a query without WHERE yields a single
/// empty branch.
pub fn lower(where_clause: Option<&Expr>) -> QueryResult<Vec<Branch>> {
    match where_clause {
        None => Ok(vec![Vec::new()]),
        Some(expr) => find_and_parts(expr)
            .into_iter()
            .map(construct_constraint_list)
            .collect(),
    }
}

/// Split top-level `OR`s into independent branches
pub fn find_and_parts(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::Or(left, right) => {
            let mut parts = find_and_parts(left);
            parts.extend(find_and_parts(right));
            parts
        }
        other => vec![other],
    }
}

/// Flatten the `AND`s of one branch into a constraint list
pub fn construct_constraint_list(expr: &Expr) -> QueryResult<Branch> {
    match expr {
        Expr::And(left, right) => {
            let mut constraints = construct_constraint_list(left)?;
            constraints.extend(construct_constraint_list(right)?);
            Ok(constraints)
        }
        Expr::Or(_, _) => Err(QueryError::UnsupportedConstraint(
            "OR nested inside AND".to_string(),
        )),
        Expr::Compare { attr, op, literal } => {
            let source = attr.resolve()?;
            let value = literal.to_string();
            let bound = match op {
                Comparator::Eq => Bound::Exact(value),
                Comparator::Lt => Bound::AtMost(value),
                Comparator::Gt => Bound::Range {
                    lower: value,
                    upper: UNBOUNDED_MAX.to_string(),
                },
            };
            Ok(vec![Constraint {
                attr: AttributeId::new(source, attr.attribute.clone()),
                bound,
            }])
        }
        Expr::Not(inner) => negate(inner),
    }
}

/// Negation is supported for single ordering comparisons only
fn negate(inner: &Expr) -> QueryResult<Branch> {
    match inner {
        Expr::Not(twice) => construct_constraint_list(twice),
        Expr::Compare { attr, op, literal } => {
            let source = attr.resolve()?;
            let value = literal.to_string();
            let bound = match op {
                Comparator::Lt => Bound::AtLeast(value),
                Comparator::Gt => Bound::AtMost(value),
                Comparator::Eq => {
                    return Err(QueryError::UnsupportedConstraint(format!(
                        "negated equality on {}",
                        attr
                    )))
                }
            };
            Ok(vec![Constraint {
                attr: AttributeId::new(source, attr.attribute.clone()),
                bound,
            }])
        }
        _ => Err(QueryError::UnsupportedConstraint(
            "negation of a compound expression".to_string(),
        )),
    }
}
