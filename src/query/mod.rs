//! Scan requests and their translation into remote queries.
//!
//! This module provides:
//! - The request model handed over by the host planner (`ScanRequest`,
//!   `Qualifier`, `SortKey`)
//! - `planner`: translation of a request into a `TranslatedQuery`
//! - `literal`: dialect-aware identifiers, literals and parameters
//! - `executor`: remote job execution and paged result cursors

pub mod executor;
pub mod literal;
pub mod planner;

pub use executor::{BackoffPolicy, QueryExecutor, ResultCursor};
pub use planner::translate;

use crate::config::SqlDialect;
use crate::row::Row;
use crate::storage::{QueryJobRequest, QueryParameter};
use crate::value::Value;
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Comparison operators the host planner can hand over.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    NotLike,
    ILike,
    NotILike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    /// Host operator without a remote counterpart
    Other(String),
}

impl Operator {
    /// Parse a host operator symbol (`=`, `<>`, `~~`, `IS NOT NULL`, ...).
    pub fn parse(symbol: &str) -> Self {
        let normalized = symbol.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
        match normalized.as_str() {
            "=" => Operator::Eq,
            "!=" | "<>" => Operator::NotEq,
            "<" => Operator::Lt,
            "<=" => Operator::LtEq,
            ">" => Operator::Gt,
            ">=" => Operator::GtEq,
            "~~" | "LIKE" => Operator::Like,
            "!~~" | "NOT LIKE" => Operator::NotLike,
            "~~*" | "ILIKE" => Operator::ILike,
            "!~~*" | "NOT ILIKE" => Operator::NotILike,
            "IN" => Operator::In,
            "NOT IN" => Operator::NotIn,
            "IS" | "IS NULL" => Operator::IsNull,
            "IS NOT" | "IS NOT NULL" => Operator::IsNotNull,
            _ => Operator::Other(symbol.to_string()),
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::LtEq => "<=",
            Operator::Gt => ">",
            Operator::GtEq => ">=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::ILike => "ILIKE",
            Operator::NotILike => "NOT ILIKE",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
            Operator::Other(symbol) => symbol,
        }
    }

    fn is_comparison(&self) -> bool {
        matches!(
            self,
            Operator::Eq | Operator::NotEq | Operator::Lt | Operator::LtEq | Operator::Gt | Operator::GtEq
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Right-hand side of a qualifier.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Value(Value),
    List(Vec<Value>),
}

/// A single conjunctive filter condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Qualifier {
    pub column: String,
    pub operator: Operator,
    pub operand: Operand,
    /// Set by translation: embedded in the remote query
    pub pushable: bool,
    /// Keep this qualifier on the host even if it could be pushed
    pub local_only: bool,
}

impl Qualifier {
    pub fn new(column: impl Into<String>, operator: Operator, operand: Operand) -> Self {
        Self {
            column: column.into(),
            operator,
            operand,
            pushable: false,
            local_only: false,
        }
    }

    /// `column <op> value` for comparison and LIKE operators.
    pub fn binary(column: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self::new(column, operator, Operand::Value(value.into()))
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::binary(column, Operator::Eq, value)
    }

    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(column, Operator::In, Operand::List(values))
    }

    pub fn not_in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(column, Operator::NotIn, Operand::List(values))
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::new(column, Operator::IsNull, Operand::None)
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::new(column, Operator::IsNotNull, Operand::None)
    }

    /// Mark the qualifier as host-evaluated.
    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    /// Evaluate against a single value with SQL three-valued logic;
    /// `None` is UNKNOWN.
    pub fn evaluate(&self, value: &Value) -> Option<bool> {
        match (&self.operator, &self.operand) {
            (Operator::IsNull, _) => Some(value.is_null()),
            (Operator::IsNotNull, _) => Some(!value.is_null()),
            (op, Operand::Value(operand)) if op.is_comparison() => {
                let ordering = value.compare(operand)?;
                Some(match op {
                    Operator::Eq => ordering == Ordering::Equal,
                    Operator::NotEq => ordering != Ordering::Equal,
                    Operator::Lt => ordering == Ordering::Less,
                    Operator::LtEq => ordering != Ordering::Greater,
                    Operator::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                })
            }
            (Operator::Like | Operator::NotLike | Operator::ILike | Operator::NotILike, Operand::Value(pattern)) => {
                let (text, pattern) = (value.as_str()?, pattern.as_str()?);
                let insensitive = matches!(self.operator, Operator::ILike | Operator::NotILike);
                let matched = like_match(text, pattern, insensitive);
                Some(match self.operator {
                    Operator::Like | Operator::ILike => matched,
                    _ => !matched,
                })
            }
            (Operator::In | Operator::NotIn, Operand::List(items)) => {
                let found = list_contains(value, items)?;
                Some(if self.operator == Operator::In { found } else { !found })
            }
            _ => None,
        }
    }

    /// Whether a row passes the qualifier (UNKNOWN filters the row out).
    pub fn matches(&self, row: &Row) -> bool {
        let value = row.get(&self.column).unwrap_or(&Value::Null);
        self.evaluate(value) == Some(true)
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operand {
            Operand::None => write!(f, "{} {}", self.column, self.operator),
            Operand::Value(v) => write!(f, "{} {} {}", self.column, self.operator, v),
            Operand::List(items) => {
                let items: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "{} {} ({})", self.column, self.operator, items.join(", "))
            }
        }
    }
}

fn list_contains(value: &Value, items: &[Value]) -> Option<bool> {
    if value.is_null() {
        return None;
    }
    let mut unknown = false;
    for item in items {
        match value.compare(item) {
            Some(Ordering::Equal) => return Some(true),
            Some(_) => {}
            None => unknown = true,
        }
    }
    if unknown {
        None
    } else {
        Some(false)
    }
}

/// SQL LIKE with `%`, `_` and backslash escapes.
pub fn like_match(text: &str, pattern: &str, case_insensitive: bool) -> bool {
    let fold = |s: &str| -> Vec<char> {
        if case_insensitive {
            s.to_lowercase().chars().collect()
        } else {
            s.chars().collect()
        }
    };
    let text = fold(text);
    let pattern = like_tokens(&fold(pattern));
    like_from(&text, &pattern)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LikeToken {
    AnyRun,
    AnyChar,
    Literal(char),
}

fn like_tokens(pattern: &[char]) -> Vec<LikeToken> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.iter().copied();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '%' => LikeToken::AnyRun,
            '_' => LikeToken::AnyChar,
            '\\' => LikeToken::Literal(chars.next().unwrap_or('\\')),
            c => LikeToken::Literal(c),
        });
    }
    tokens
}

/// Two-pointer wildcard match; on a mismatch only the most recent `%`
/// is retried, one text position further.
fn like_from(text: &[char], pattern: &[LikeToken]) -> bool {
    let (mut t, mut p) = (0, 0);
    // (pattern index after the last `%`, text index it currently absorbs up to)
    let mut retry: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(LikeToken::AnyRun) => {
                p += 1;
                retry = Some((p, t));
                continue;
            }
            Some(LikeToken::AnyChar) => {
                p += 1;
                t += 1;
                continue;
            }
            Some(LikeToken::Literal(c)) if *c == text[t] => {
                p += 1;
                t += 1;
                continue;
            }
            _ => {}
        }
        match retry {
            Some((after, absorbed)) => {
                p = after;
                t = absorbed + 1;
                retry = Some((after, t));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|token| *token == LikeToken::AnyRun)
}

/// Requested ordering of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    /// Ascending with the host default of nulls last.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
            nulls_first: false,
        }
    }

    /// Descending with the host default of nulls first.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
            nulls_first: true,
        }
    }

    pub fn nulls_first(mut self, nulls_first: bool) -> Self {
        self.nulls_first = nulls_first;
        self
    }
}

/// What the host wants from one scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanRequest {
    /// Requested columns, ordered and unique
    pub columns: Vec<String>,
    /// Conjunctive filter conditions
    pub qualifiers: Vec<Qualifier>,
    pub sort: Vec<SortKey>,
    pub limit: Option<u64>,
}

impl ScanRequest {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_qualifier(mut self, qualifier: Qualifier) -> Self {
        self.qualifiers.push(qualifier);
        self
    }

    pub fn with_sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A remote query ready for execution.
#[derive(Debug, Clone)]
pub struct TranslatedQuery {
    pub sql: String,
    pub dialect: SqlDialect,
    /// Select list: the requested columns followed by columns needed only
    /// by residual qualifiers
    pub columns: Vec<String>,
    /// Number of leading `columns` the host asked for
    pub requested: usize,
    /// Qualifiers embedded in `sql`
    pub pushed: Vec<Qualifier>,
    /// Qualifiers the host must re-apply
    pub residual: Vec<Qualifier>,
    pub parameters: Vec<QueryParameter>,
    /// Limit embedded in `sql`
    pub limit: Option<u64>,
    pub sort_pushed: bool,
    pub grouped: bool,
}

impl TranslatedQuery {
    pub fn requested_columns(&self) -> &[String] {
        &self.columns[..self.requested]
    }

    /// Whether a row passes every residual qualifier.
    pub fn accepts(&self, row: &Row) -> bool {
        self.residual.iter().all(|q| q.matches(row))
    }

    pub fn job_request(&self, project: &str, location: Option<&str>) -> QueryJobRequest {
        QueryJobRequest {
            sql: self.sql.clone(),
            dialect: self.dialect,
            parameters: self.parameters.clone(),
            job_id: format!("bigquery_fdw_{}", Uuid::new_v4().simple()),
            project: project.to_string(),
            location: location.map(str::to_string),
        }
    }
}
