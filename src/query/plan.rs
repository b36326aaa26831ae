//! Query Plan
//!
//! A compiled query with every attribute resolved against the data-source
//! registry and its WHERE clause lowered to DNF branches.

use crate::query::ast::{AttributeRef, CompiledQuery, Function};
use crate::query::constraints::{lower, Branch};
use crate::query::error::QueryResult;
use crate::query::parser::parse_query;
use crate::sources::{AttributeId, DataSource, UserDataType};
use std::collections::BTreeSet;

/// A function call with resolved attributes
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCall {
    pub function: Function,
    pub attrs: Vec<AttributeId>,
}

/// Everything later stages need to know about a query
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub query: CompiledQuery,
    pub calls: Vec<ResolvedCall>,
    /// De-duplicated selected attributes
    pub attributes: Vec<AttributeId>,
    /// DNF of the WHERE clause, never empty
    pub branches: Vec<Branch>,
    /// Labels of every attribute the query touches
    pub data_types: BTreeSet<UserDataType>,
}

impl QueryPlan {
    /// Data sources of the selected attributes
    pub fn sources(&self) -> BTreeSet<DataSource> {
        self.attributes.iter().map(|a| a.source).collect()
    }

    /// Data sources referenced anywhere, constraints included
    pub fn all_sources(&self) -> BTreeSet<DataSource> {
        let mut sources = self.sources();
        for branch in &self.branches {
            sources.extend(branch.iter().map(|c| c.attr.source));
        }
        sources
    }

    pub fn functions(&self) -> impl Iterator<Item = Function> + '_ {
        self.calls.iter().map(|c| c.function)
    }
}

fn resolve(attr: &AttributeRef) -> QueryResult<AttributeId> {
    let source = attr.resolve()?;
    Ok(AttributeId::new(source, attr.attribute.clone()))
}

/// Compile query text into a plan
pub fn compile(text: &str) -> QueryResult<QueryPlan> {
    let query = parse_query(text)?;

    let calls = query
        .select
        .iter()
        .map(|call| -> QueryResult<ResolvedCall> {
            Ok(ResolvedCall {
                function: call.function,
                attrs: call.attrs.iter().map(resolve).collect::<QueryResult<_>>()?,
            })
        })
        .collect::<QueryResult<Vec<_>>>()?;

    let attributes = query
        .selected_attributes()
        .iter()
        .map(resolve)
        .collect::<QueryResult<Vec<_>>>()?;

    let branches = lower(query.where_clause.as_ref())?;

    let data_types = query
        .referenced_attributes()
        .iter()
        .map(|attr| -> QueryResult<Option<UserDataType>> {
            let id = resolve(attr)?;
            Ok(id.column().map(|c| c.label))
        })
        .collect::<QueryResult<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();

    Ok(QueryPlan {
        query,
        calls,
        attributes,
        branches,
        data_types,
    })
}
