//! Query Parser
//!
//! Parses query text into a [`CompiledQuery`].
//!
//! # Supported Syntax
//!
//! ```text
//! start     := "SELECT" func_list ["WHERE" expr]
//! func_list := FUNC "(" attr ("," attr)* ")" ("," FUNC "(" ... ")")*
//! FUNC      := SUM | AVG | RAVG | COUNT | ALL | CORR
//! attr      := DataSource "." attribute
//! expr      := "(" expr ")" AND "(" expr ")"
//!            | "(" expr ")" OR "(" expr ")"
//!            | attr ("=" | "<" | ">") literal
//!            | "!" expr
//! literal   := "quoted string" | signed number
//! ```
//!
//! Keywords are case-sensitive. Whitespace between tokens is ignored.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{map, map_res, opt, value},
    error::{Error, ErrorKind},
    multi::separated_list1,
    number::complete::recognize_float,
    sequence::{delimited, pair, preceded},
    IResult,
};

use crate::query::ast::*;
use crate::query::error::{QueryError, QueryResult};

/// Parse query text into a compiled query
pub fn parse_query(input: &str) -> QueryResult<CompiledQuery> {
    let input = input.trim();

    let query = match parse_full_query(input) {
        Ok((remaining, query)) => {
            if remaining.trim().is_empty() {
                query
            } else {
                return Err(QueryError::Parse(format!(
                    "Unexpected input after query: '{}'",
                    remaining.trim()
                )));
            }
        }
        Err(e) => return Err(QueryError::Parse(format!("{:?}", e))),
    };

    validate_arity(&query)?;
    Ok(query)
}

/// COUNT takes exactly one attribute, CORR exactly two
fn validate_arity(query: &CompiledQuery) -> QueryResult<()> {
    for call in &query.select {
        if let Some(expected) = call.function.arity() {
            if call.attrs.len() != expected {
                return Err(QueryError::Arity {
                    function: call.function.to_string(),
                    message: format!("expected {}, got {}", expected, call.attrs.len()),
                });
            }
        }
    }
    Ok(())
}

/// Parse the full query
fn parse_full_query(input: &str) -> IResult<&str, CompiledQuery> {
    let (input, _) = multispace0(input)?;
    let (input, select) = parse_select_clause(input)?;
    let (input, _) = multispace0(input)?;
    let (input, where_clause) = opt(parse_where_clause)(input)?;
    let (input, _) = multispace0(input)?;

    Ok((
        input,
        CompiledQuery {
            select,
            where_clause,
        },
    ))
}

/// Parse SELECT clause
fn parse_select_clause(input: &str) -> IResult<&str, Vec<FunctionCall>> {
    let (input, _) = tag("SELECT")(input)?;
    let (input, _) = multispace1(input)?;

    separated_list1(
        delimited(multispace0, char(','), multispace0),
        parse_function_call,
    )(input)
}

/// Parse a function call like SUM(RandomData.random_one, RandomData.random_two)
fn parse_function_call(input: &str) -> IResult<&str, FunctionCall> {
    let (input, function) = parse_function(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char('(')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, attrs) = separated_list1(
        delimited(multispace0, char(','), multispace0),
        parse_attribute,
    )(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char(')')(input)?;

    Ok((input, FunctionCall { function, attrs }))
}

/// Parse function name
fn parse_function(input: &str) -> IResult<&str, Function> {
    alt((
        value(Function::Sum, tag("SUM")),
        value(Function::Ravg, tag("RAVG")),
        value(Function::Avg, tag("AVG")),
        value(Function::Count, tag("COUNT")),
        value(Function::All, tag("ALL")),
        value(Function::Corr, tag("CORR")),
    ))(input)
}

/// Parse `DataSource.attribute`
fn parse_attribute(input: &str) -> IResult<&str, AttributeRef> {
    map_res(
        take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '.'),
        AttributeRef::parse,
    )(input)
}

/// Parse WHERE clause
fn parse_where_clause(input: &str) -> IResult<&str, Expr> {
    preceded(pair(tag("WHERE"), multispace0), parse_expr)(input)
}

/// Parse a constraint expression
fn parse_expr(input: &str) -> IResult<&str, Expr> {
    alt((parse_connective, parse_negation, parse_comparison))(input)
}

#[derive(Clone, Copy)]
enum Connective {
    And,
    Or,
}

/// Parse `(expr) AND (expr)` or `(expr) OR (expr)`
fn parse_connective(input: &str) -> IResult<&str, Expr> {
    let (input, left) = parse_parenthesized(input)?;
    let (input, _) = multispace0(input)?;
    let (input, connective) = alt((
        value(Connective::And, tag("AND")),
        value(Connective::Or, tag("OR")),
    ))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, right) = parse_parenthesized(input)?;

    let expr = match connective {
        Connective::And => Expr::and(left, right),
        Connective::Or => Expr::or(left, right),
    };
    Ok((input, expr))
}

fn parse_parenthesized(input: &str) -> IResult<&str, Expr> {
    delimited(
        pair(char('('), multispace0),
        parse_expr,
        pair(multispace0, char(')')),
    )(input)
}

/// Parse `!expr`
fn parse_negation(input: &str) -> IResult<&str, Expr> {
    let (input, _) = char('!')(input)?;
    let (input, _) = multispace0(input)?;
    map(parse_expr, Expr::negate)(input)
}

/// Parse `attr = literal`, `attr < literal` or `attr > literal`
fn parse_comparison(input: &str) -> IResult<&str, Expr> {
    let (input, attr) = parse_attribute(input)?;
    let (input, _) = multispace0(input)?;
    let (input, op) = parse_comparator(input)?;
    let (input, _) = multispace0(input)?;
    let (input, literal) = parse_literal(input)?;

    Ok((input, Expr::compare(attr, op, literal)))
}

fn parse_comparator(input: &str) -> IResult<&str, Comparator> {
    alt((
        value(Comparator::Eq, char('=')),
        value(Comparator::Lt, char('<')),
        value(Comparator::Gt, char('>')),
    ))(input)
}

fn parse_literal(input: &str) -> IResult<&str, Literal> {
    alt((
        map(parse_string_literal, Literal::Text),
        map(parse_number, Literal::Number),
    ))(input)
}

/// Parse a signed number
fn parse_number(input: &str) -> IResult<&str, f64> {
    map_res(recognize_float, |s: &str| s.parse::<f64>())(input)
}

/// Parse a double-quoted string with backslash escapes
fn parse_string_literal(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('"')(input)?;
    let mut out = String::new();

    loop {
        let mut chars = rest.chars();
        match chars.next() {
            None => return Err(nom::Err::Error(Error::new(rest, ErrorKind::Char))),
            Some('"') => return Ok((&rest[1..], out)),
            Some('\\') => match chars.next() {
                Some(escaped) => {
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                    rest = &rest[1 + escaped.len_utf8()..];
                }
                None => return Err(nom::Err::Error(Error::new(rest, ErrorKind::Escaped))),
            },
            Some(c) => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sum_with_exact_match() {
        let query = parse_query(
            "SELECT SUM(RandomData.random_two) WHERE PersonalInformation.city = \"aachen\"",
        )
        .unwrap();

        assert_eq!(query.select.len(), 1);
        assert_eq!(query.select[0].function, Function::Sum);
        assert_eq!(
            query.select[0].attrs,
            vec![AttributeRef::new("RandomData", "random_two")]
        );
        assert_eq!(
            query.where_clause,
            Some(Expr::compare(
                AttributeRef::new("PersonalInformation", "city"),
                Comparator::Eq,
                Literal::Text("aachen".to_string()),
            ))
        );
    }

    #[test]
    fn test_parse_multiple_functions() {
        let query = parse_query(
            "SELECT AVG(RandomData.random_one, RandomData.random_two), COUNT(RandomData.random_one), RAVG(Iris.sepal_length)",
        )
        .unwrap();

        assert_eq!(query.select.len(), 3);
        assert_eq!(query.select[0].function, Function::Avg);
        assert_eq!(query.select[0].attrs.len(), 2);
        assert_eq!(query.select[1].function, Function::Count);
        assert_eq!(query.select[2].function, Function::Ravg);
        assert!(query.where_clause.is_none());
    }

    #[test]
    fn test_parse_connectives() {
        let query = parse_query(
            "SELECT COUNT(RandomData.random_one) WHERE (LocationProbe.altitude > 100) AND ((PersonalInformation.gender = \"female\") OR (PersonalInformation.city = \"bonn\"))",
        )
        .unwrap();

        match query.where_clause {
            Some(Expr::And(left, right)) => {
                assert!(matches!(*left, Expr::Compare { op: Comparator::Gt, .. }));
                assert!(matches!(*right, Expr::Or(_, _)));
            }
            other => panic!("unexpected where clause: {:?}", other),
        }
    }

    #[test]
    fn test_parse_negation_and_signed_numbers() {
        let query =
            parse_query("SELECT SUM(RandomData.random_one) WHERE !RandomData.random_two < -2.5")
                .unwrap();

        assert_eq!(
            query.where_clause,
            Some(Expr::negate(Expr::compare(
                AttributeRef::new("RandomData", "random_two"),
                Comparator::Lt,
                Literal::Number(-2.5),
            )))
        );
    }

    #[test]
    fn test_parse_escaped_string() {
        let query = parse_query(
            r#"SELECT SUM(RandomData.random_one) WHERE PersonalInformation.street = "Main \"A\" 1""#,
        )
        .unwrap();

        match query.where_clause {
            Some(Expr::Compare { literal, .. }) => {
                assert_eq!(literal, Literal::Text("Main \"A\" 1".to_string()))
            }
            other => panic!("unexpected where clause: {:?}", other),
        }
    }

    #[test]
    fn test_keywords_are_case_sensitive() {
        assert!(parse_query("select SUM(RandomData.random_one)").is_err());
        assert!(parse_query("SELECT sum(RandomData.random_one)").is_err());
    }

    #[test]
    fn test_rejects_grammar_mismatches() {
        assert!(parse_query("").is_err());
        assert!(parse_query("SELECT").is_err());
        assert!(parse_query("SELECT MEDIAN(RandomData.random_one)").is_err());
        assert!(parse_query("SELECT SUM(random_one)").is_err());
        assert!(parse_query("SELECT SUM(RandomData.random_one) LIMIT 5").is_err());
        assert!(parse_query("SELECT SUM(RandomData.random_one) WHERE RandomData.random_two >= 5").is_err());
        // connectives require parentheses on both sides
        assert!(parse_query(
            "SELECT SUM(RandomData.random_one) WHERE RandomData.random_two > 1 AND RandomData.random_two < 5"
        )
        .is_err());
    }

    #[test]
    fn test_arity_checks() {
        assert!(matches!(
            parse_query("SELECT COUNT(RandomData.random_one, RandomData.random_two)"),
            Err(QueryError::Arity { .. })
        ));
        assert!(matches!(
            parse_query("SELECT CORR(RandomData.random_one)"),
            Err(QueryError::Arity { .. })
        ));
        assert!(parse_query("SELECT CORR(RandomData.random_one, RandomData.random_two)").is_ok());
    }
}
