//! Filter Predicates
//!
//! Parses and evaluates the boolean row conditions used by filter blocks.
//! Conditions are checked when a workflow is decoded, so a malformed
//! condition is rejected before any block runs. Evaluation failures on
//! individual rows (missing column, incomparable types) are reported to
//! the caller, which treats the row as non-matching.
//!
//! # Syntax
//!
//! ```text
//! company contains "Acme" and employees >= 50
//! not (status == 'churned') or `Lead Source` is not empty
//! email matches "@(acme|globex)\.com$"
//! ```
//!
//! Operators: `==` (or `=`), `!=`, `>`, `>=`, `<`, `<=`, `contains`,
//! `icontains`, `startswith`, `endswith`, `matches`. Column names with
//! spaces go in backticks or square brackets.

use std::cmp::Ordering;
use std::fmt;

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use regex::Regex;
use thiserror::Error;

use crate::data::{Cell, Row};

#[derive(Parser)]
#[grammar = "execution/predicate.pest"]
struct PredicateParser;

/// Errors raised while parsing a condition.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredicateError {
    #[error("condition is empty")]
    Empty,

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("invalid regular expression '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },
}

/// Errors raised while evaluating a condition against one row.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("column '{0}' does not exist")]
    MissingColumn(String),

    #[error("cannot apply '{op}' to column '{column}' with value '{value}'")]
    TypeMismatch {
        column: String,
        op: &'static str,
        value: String,
    },
}

/// Comparison operators.
#[derive(Debug, Clone)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    IContains,
    StartsWith,
    EndsWith,
    Matches(Regex),
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Contains => "contains",
            CompareOp::IContains => "icontains",
            CompareOp::StartsWith => "startswith",
            CompareOp::EndsWith => "endswith",
            CompareOp::Matches(_) => "matches",
        }
    }
}

/// Literal operand on the right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Text(s) => f.write_str(s),
            Literal::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Literal::Number(n) => write!(f, "{}", n),
            Literal::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Parsed condition tree.
#[derive(Debug, Clone)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    IsEmpty { column: String, negated: bool },
    Compare { column: String, op: CompareOp, literal: Literal },
}

/// A parsed, reusable row condition.
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    root: Expr,
}

impl Predicate {
    /// Parses a condition.
    pub fn parse(source: &str) -> Result<Self, PredicateError> {
        if source.trim().is_empty() {
            return Err(PredicateError::Empty);
        }

        let mut pairs = PredicateParser::parse(Rule::predicate, source)
            .map_err(|e| PredicateError::Syntax(e.to_string()))?;

        let expr = pairs
            .next()
            .and_then(|predicate| predicate.into_inner().next())
            .ok_or_else(|| PredicateError::Syntax("missing expression".to_string()))?;

        Ok(Self {
            source: source.to_string(),
            root: build_expr(expr)?,
        })
    }

    /// The condition text this predicate was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Evaluates the condition against one row of a table with `columns`.
    pub fn evaluate(&self, columns: &[String], row: &Row) -> Result<bool, EvalError> {
        eval(&self.root, columns, row)
    }
}

fn eval(expr: &Expr, columns: &[String], row: &Row) -> Result<bool, EvalError> {
    match expr {
        Expr::Or(terms) => {
            for term in terms {
                if eval(term, columns, row)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expr::And(terms) => {
            for term in terms {
                if !eval(term, columns, row)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Not(inner) => Ok(!eval(inner, columns, row)?),
        Expr::IsEmpty { column, negated } => {
            let cell = lookup(column, columns, row)?;
            Ok(cell.is_empty() != *negated)
        }
        Expr::Compare { column, op, literal } => {
            let cell = lookup(column, columns, row)?;
            compare(column, cell, op, literal)
        }
    }
}

fn lookup<'a>(column: &str, columns: &[String], row: &'a Row) -> Result<&'a Cell, EvalError> {
    columns
        .iter()
        .position(|c| c == column)
        .and_then(|index| row.values.get(index))
        .ok_or_else(|| EvalError::MissingColumn(column.to_string()))
}

fn compare(column: &str, cell: &Cell, op: &CompareOp, literal: &Literal) -> Result<bool, EvalError> {
    let mismatch = || EvalError::TypeMismatch {
        column: column.to_string(),
        op: op.symbol(),
        value: cell.to_string(),
    };

    let ordering = || -> Result<Ordering, EvalError> {
        match (cell, literal) {
            (_, Literal::Number(n)) => {
                let value = cell.as_f64().ok_or_else(mismatch)?;
                value.partial_cmp(n).ok_or_else(mismatch)
            }
            (Cell::Empty, Literal::Text(_)) => Err(mismatch()),
            (_, Literal::Text(s)) => Ok(cell.as_text().as_ref().cmp(s.as_str())),
            (_, Literal::Bool(_)) => Err(mismatch()),
        }
    };

    match op {
        CompareOp::Eq => Ok(equals(cell, literal)),
        CompareOp::Ne => Ok(!equals(cell, literal)),
        CompareOp::Gt => Ok(ordering()? == Ordering::Greater),
        CompareOp::Ge => Ok(ordering()? != Ordering::Less),
        CompareOp::Lt => Ok(ordering()? == Ordering::Less),
        CompareOp::Le => Ok(ordering()? != Ordering::Greater),
        CompareOp::Contains => Ok(cell.as_text().contains(&literal.to_string())),
        CompareOp::IContains => Ok(cell
            .as_text()
            .to_lowercase()
            .contains(&literal.to_string().to_lowercase())),
        CompareOp::StartsWith => Ok(cell.as_text().starts_with(&literal.to_string())),
        CompareOp::EndsWith => Ok(cell.as_text().ends_with(&literal.to_string())),
        CompareOp::Matches(regex) => Ok(regex.is_match(&cell.as_text())),
    }
}

fn equals(cell: &Cell, literal: &Literal) -> bool {
    match (cell, literal) {
        (_, Literal::Number(n)) if cell.as_f64().is_some() => cell.as_f64() == Some(*n),
        (_, Literal::Bool(l)) if cell.as_bool().is_some() => cell.as_bool() == Some(*l),
        _ => cell.as_text().as_ref() == literal.to_string(),
    }
}

/* ===================== Tree Building ===================== */

fn build_expr(pair: Pair<'_, Rule>) -> Result<Expr, PredicateError> {
    match pair.as_rule() {
        Rule::expr => {
            let mut terms = build_terms(pair, Rule::or_op)?;
            Ok(if terms.len() == 1 {
                terms.remove(0)
            } else {
                Expr::Or(terms)
            })
        }
        Rule::conjunction => {
            let mut terms = build_terms(pair, Rule::and_op)?;
            Ok(if terms.len() == 1 {
                terms.remove(0)
            } else {
                Expr::And(terms)
            })
        }
        Rule::negation => {
            let mut inner = pair.into_inner();
            let first = inner.next().ok_or_else(|| syntax("empty negation"))?;
            if first.as_rule() == Rule::not_op {
                let operand = inner.next().ok_or_else(|| syntax("'not' without operand"))?;
                Ok(Expr::Not(Box::new(build_expr(operand)?)))
            } else {
                build_expr(first)
            }
        }
        Rule::emptiness => {
            let mut column = None;
            let mut negated = false;
            for part in pair.into_inner() {
                match part.as_rule() {
                    Rule::column => column = Some(column_name(part)?),
                    Rule::negated => negated = true,
                    _ => {}
                }
            }
            let column = column.ok_or_else(|| syntax("missing column"))?;
            Ok(Expr::IsEmpty { column, negated })
        }
        Rule::comparison => {
            let mut inner = pair.into_inner();
            let column = column_name(inner.next().ok_or_else(|| syntax("missing column"))?)?;
            let operator = inner.next().ok_or_else(|| syntax("missing operator"))?;
            let literal = build_literal(inner.next().ok_or_else(|| syntax("missing value"))?)?;
            let op = build_operator(operator.as_str(), &literal)?;
            Ok(Expr::Compare { column, op, literal })
        }
        other => Err(syntax(&format!("unexpected {:?}", other))),
    }
}

fn build_terms(pair: Pair<'_, Rule>, separator: Rule) -> Result<Vec<Expr>, PredicateError> {
    pair.into_inner()
        .filter(|p| p.as_rule() != separator)
        .map(build_expr)
        .collect()
}

fn build_operator(text: &str, literal: &Literal) -> Result<CompareOp, PredicateError> {
    let op = match text.to_ascii_lowercase().as_str() {
        "==" | "=" => CompareOp::Eq,
        "!=" => CompareOp::Ne,
        ">" => CompareOp::Gt,
        ">=" => CompareOp::Ge,
        "<" => CompareOp::Lt,
        "<=" => CompareOp::Le,
        "contains" => CompareOp::Contains,
        "icontains" => CompareOp::IContains,
        "startswith" => CompareOp::StartsWith,
        "endswith" => CompareOp::EndsWith,
        "matches" => {
            let pattern = literal.to_string();
            let regex = Regex::new(&pattern).map_err(|e| PredicateError::InvalidRegex {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            CompareOp::Matches(regex)
        }
        other => return Err(syntax(&format!("unknown operator '{}'", other))),
    };
    Ok(op)
}

fn column_name(pair: Pair<'_, Rule>) -> Result<String, PredicateError> {
    let inner = pair.into_inner().next().ok_or_else(|| syntax("missing column"))?;
    match inner.as_rule() {
        Rule::identifier => Ok(inner.as_str().to_string()),
        _ => inner
            .into_inner()
            .next()
            .map(|text| text.as_str().to_string())
            .ok_or_else(|| syntax("empty column name")),
    }
}

fn build_literal(pair: Pair<'_, Rule>) -> Result<Literal, PredicateError> {
    let inner = pair.into_inner().next().ok_or_else(|| syntax("missing value"))?;
    match inner.as_rule() {
        Rule::number => inner
            .as_str()
            .parse::<f64>()
            .map(Literal::Number)
            .map_err(|e| syntax(&format!("invalid number '{}': {}", inner.as_str(), e))),
        Rule::boolean => Ok(Literal::Bool(inner.as_str().eq_ignore_ascii_case("true"))),
        Rule::string => {
            let text = inner.into_inner().next().map(|t| t.as_str()).unwrap_or("");
            Ok(Literal::Text(unescape(text)))
        }
        other => Err(syntax(&format!("unexpected {:?}", other))),
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn syntax(message: &str) -> PredicateError {
    PredicateError::Syntax(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<String> {
        ["name", "company", "employees", "Lead Source", "verified"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn row(values: &[&str]) -> Row {
        Row::new(values.iter().map(|v| Cell::infer(v)).collect())
    }

    fn matches(condition: &str, values: &[&str]) -> Result<bool, EvalError> {
        Predicate::parse(condition).unwrap().evaluate(&columns(), &row(values))
    }

    const ACME: [&str; 5] = ["Ada", "Acme Corp", "120", "referral", "true"];
    const GLOBEX: [&str; 5] = ["Grace", "Globex", "", "", "false"];

    #[test]
    fn test_contains() {
        assert!(matches("company contains \"Acme\"", &ACME).unwrap());
        assert!(!matches("company contains \"Acme\"", &GLOBEX).unwrap());
        assert!(!matches("company contains 'acme'", &ACME).unwrap());
        assert!(matches("company icontains 'acme'", &ACME).unwrap());
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(matches("employees >= 100", &ACME).unwrap());
        assert!(!matches("employees < 100", &ACME).unwrap());
        assert!(matches("employees == 120", &ACME).unwrap());
        assert!(matches("employees != 7", &ACME).unwrap());
    }

    #[test]
    fn test_numbers_kept_as_text_still_compare() {
        let cols = vec!["price".to_string(), "flag".to_string()];
        let predicate = Predicate::parse("price > 10 and price == 19.9 and flag == true").unwrap();
        assert!(predicate.evaluate(&cols, &row(&["19.90", "TRUE"])).unwrap());
        let predicate = Predicate::parse("price < 10").unwrap();
        assert!(!predicate.evaluate(&cols, &row(&["19.90", "TRUE"])).unwrap());
    }

    #[test]
    fn test_ordering_on_empty_cell_is_an_error() {
        let result = matches("employees > 10", &GLOBEX);
        assert!(matches!(result, Err(EvalError::TypeMismatch { .. })));
    }

    #[test]
    fn test_missing_column_is_an_error() {
        let result = matches("revenue > 10", &ACME);
        assert_eq!(result, Err(EvalError::MissingColumn("revenue".to_string())));
    }

    #[test]
    fn test_boolean_logic_and_precedence() {
        // and binds tighter than or
        assert!(matches("company == 'Globex' or employees > 100 and verified == true", &ACME).unwrap());
        assert!(!matches("(company == 'Globex' or employees > 100) and verified == false", &ACME).unwrap());
        assert!(matches("not company startswith 'Glo'", &ACME).unwrap());
        assert!(matches("!(company endswith 'Corp')", &GLOBEX).unwrap());
    }

    #[test]
    fn test_emptiness_and_quoted_columns() {
        assert!(matches("`Lead Source` is not empty", &ACME).unwrap());
        assert!(matches("[Lead Source] is empty", &GLOBEX).unwrap());
        assert!(matches("employees IS EMPTY", &GLOBEX).unwrap());
    }

    #[test]
    fn test_regex_match() {
        assert!(matches("name matches '^A.a$'", &ACME).unwrap());
        assert!(!matches("name matches '^A.a$'", &GLOBEX).unwrap());
    }

    #[test]
    fn test_keyword_prefixed_identifiers() {
        let cols = vec!["notes".to_string(), "origin".to_string()];
        let predicate = Predicate::parse("notes == 'x' and origin == 'y'").unwrap();
        assert!(predicate.evaluate(&cols, &row(&["x", "y"])).unwrap());
    }

    #[test]
    fn test_escaped_quotes() {
        let cols = vec!["name".to_string()];
        let predicate = Predicate::parse(r#"name == "O\"Brien""#).unwrap();
        assert!(predicate.evaluate(&cols, &row(&["O\"Brien"])).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Predicate::parse("   ").unwrap_err(), PredicateError::Empty);
        assert!(matches!(
            Predicate::parse("company contains").unwrap_err(),
            PredicateError::Syntax(_)
        ));
        assert!(matches!(
            Predicate::parse("df['company'].str.contains('Acme')").unwrap_err(),
            PredicateError::Syntax(_)
        ));
        assert!(matches!(
            Predicate::parse("name matches '('").unwrap_err(),
            PredicateError::InvalidRegex { .. }
        ));
    }

    #[test]
    fn test_source_is_kept() {
        let predicate = Predicate::parse("employees > 5").unwrap();
        assert_eq!(predicate.source(), "employees > 5");
        assert!(matches!(predicate.root(), Expr::Compare { .. }));
    }
}
