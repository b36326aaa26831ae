//! Query Abstract Syntax Tree
//!
//! Typed output of the query compiler: a list of aggregate function calls and
//! an optional constraint expression.
//!
//! ```text
//! SELECT SUM(RandomData.random_two) WHERE PersonalInformation.city = "aachen"
//! SELECT COUNT(RandomData.random_one) WHERE (LocationProbe.altitude > 100) OR (PersonalInformation.gender = "female")
//! ```

use crate::query::error::{QueryError, QueryResult};
use crate::sources::{format_number, DataSource};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A compiled query
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub select: Vec<FunctionCall>,
    pub where_clause: Option<Expr>,
}

impl CompiledQuery {
    /// Attributes named in the SELECT list, de-duplicated, in first-seen order
    pub fn selected_attributes(&self) -> Vec<AttributeRef> {
        let mut attrs: Vec<AttributeRef> = Vec::new();
        for call in &self.select {
            for attr in &call.attrs {
                if !attrs.contains(attr) {
                    attrs.push(attr.clone());
                }
            }
        }
        attrs
    }

    /// Every attribute the query touches, constraints included
    pub fn referenced_attributes(&self) -> Vec<AttributeRef> {
        let mut attrs = self.selected_attributes();
        if let Some(expr) = &self.where_clause {
            expr.visit_attributes(&mut |attr| {
                if !attrs.contains(attr) {
                    attrs.push(attr.clone());
                }
            });
        }
        attrs
    }
}

/// Aggregate functions of the query language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Function {
    Sum,
    Avg,
    /// Average without noise, for demonstrations
    Ravg,
    Count,
    All,
    Corr,
}

impl Function {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Ravg => "RAVG",
            Self::Count => "COUNT",
            Self::All => "ALL",
            Self::Corr => "CORR",
        }
    }

    /// Required number of attributes, `None` for one or more
    pub fn arity(&self) -> Option<usize> {
        match self {
            Self::Count => Some(1),
            Self::Corr => Some(2),
            _ => None,
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `DataSource.attribute` as written in query text
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeRef {
    pub source: String,
    pub attribute: String,
}

impl AttributeRef {
    pub fn new(source: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            attribute: attribute.into(),
        }
    }

    /// Split a dotted name into source and attribute
    pub fn parse(name: &str) -> QueryResult<Self> {
        match name.split_once('.') {
            Some((source, attribute))
                if !source.is_empty() && !attribute.is_empty() && !attribute.contains('.') =>
            {
                Ok(Self::new(source, attribute))
            }
            _ => Err(QueryError::InvalidAttribute(name.to_string())),
        }
    }

    /// Resolve against the data-source registry
    pub fn resolve(&self) -> QueryResult<DataSource> {
        let source = DataSource::from_class_name(&self.source)
            .ok_or_else(|| QueryError::UnknownDataSource(self.source.clone()))?;
        if source.column(&self.attribute).is_none() {
            return Err(QueryError::UnknownAttribute(self.to_string()));
        }
        Ok(source)
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source, self.attribute)
    }
}

/// One entry of the SELECT list
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub function: Function,
    pub attrs: Vec<AttributeRef>,
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Lt,
    Gt,
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq => write!(f, "="),
            Self::Lt => write!(f, "<"),
            Self::Gt => write!(f, ">"),
        }
    }
}

/// Right-hand side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Text(String),
    Number(f64),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => f.write_str(&format_number(*n)),
        }
    }
}

/// Constraint expression of the WHERE clause
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        attr: AttributeRef,
        op: Comparator,
        literal: Literal,
    },
}

impl Expr {
    pub fn compare(attr: AttributeRef, op: Comparator, literal: Literal) -> Self {
        Self::Compare { attr, op, literal }
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Self::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Expr, right: Expr) -> Self {
        Self::Or(Box::new(left), Box::new(right))
    }

    pub fn negate(inner: Expr) -> Self {
        Self::Not(Box::new(inner))
    }

    fn visit_attributes(&self, f: &mut dyn FnMut(&AttributeRef)) {
        match self {
            Self::And(l, r) | Self::Or(l, r) => {
                l.visit_attributes(f);
                r.visit_attributes(f);
            }
            Self::Not(inner) => inner.visit_attributes(f),
            Self::Compare { attr, .. } => f(attr),
        }
    }
}
