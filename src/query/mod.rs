//! Query Compiler
//!
//! Turns query text into a typed plan:
//!
//! - **AST**: function calls and constraint expressions
//! - **Parser**: nom grammar for the query language
//! - **Constraints**: DNF lowering of the WHERE clause and bound encoding
//! - **Plan**: attributes resolved against the data-source registry
//!
//! # Query Language
//!
//! ```text
//! SELECT FUNC(DataSource.attribute [, ...]) [, FUNC(...)]
//! [WHERE expr]
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use privagg::query::compile;
//!
//! let plan = compile(
//!     "SELECT AVG(RandomData.random_two) WHERE (PersonalInformation.city = \"aachen\") OR (LocationProbe.altitude > 200)",
//! )?;
//! assert_eq!(plan.branches.len(), 2);
//! ```

mod ast;
mod constraints;
mod error;
mod parser;
mod plan;

pub use ast::{AttributeRef, Comparator, CompiledQuery, Expr, Function, FunctionCall, Literal};
pub use constraints::{
    construct_constraint_list, find_and_parts, lower, Bound, Branch, Constraint, UNBOUNDED_MAX,
};
pub use error::{QueryError, QueryResult};
pub use parser::parse_query;
pub use plan::{compile, QueryPlan, ResolvedCall};
