//! Parser for the recognized LogQL subset.
//!
//! A query is, in layers:
//!
//! 1. a label selector `{key OP "value", ...}` with `OP` one of
//!    `=`, `!=`, `=~`, `!~`;
//! 2. zero or more line filters `|= "s"`, `!= "s"`, `|~ "re"`, `!~ "re"`;
//! 3. optionally wrapped in an aggregation
//!    `count_over_time({...}[5m]) by (label, ...)` and friends.
//!
//! The empty query is legal and matches every stream. Regular expressions
//! compile at parse time; a bad pattern is a hard parse error.

use regex::Regex;
use thiserror::Error;

use crate::labels::LabelSet;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid query syntax: {0}")]
    Syntax(String),
    #[error("invalid regex {0:?}: {1}")]
    Regex(String, regex::Error),
    #[error("invalid aggregation range: {0}")]
    Duration(String),
    #[error("unknown aggregation function {0:?}")]
    UnknownAggregation(String),
}

/// Label matcher operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

/// A single `key OP "value"` condition from the selector.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    pub name: String,
    pub value: String,
    pub op: MatchOp,
    regex: Option<Regex>,
}

impl LabelMatcher {
    pub fn matches(&self, labels: &LabelSet) -> bool {
        let value = labels.get(&self.name);
        match self.op {
            MatchOp::Equal => value == Some(self.value.as_str()),
            MatchOp::NotEqual => value != Some(self.value.as_str()),
            MatchOp::Regex => value
                .zip(self.regex.as_ref())
                .is_some_and(|(v, re)| re.is_match(v)),
            MatchOp::NotRegex => !value
                .zip(self.regex.as_ref())
                .is_some_and(|(v, re)| re.is_match(v)),
        }
    }
}

/// Line filter operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFilterOp {
    Contains,
    NotContains,
    Regex,
    NotRegex,
}

/// A post-selector predicate on entry content.
#[derive(Debug, Clone)]
pub struct LineFilter {
    pub pattern: String,
    pub op: LineFilterOp,
    regex: Option<Regex>,
}

impl LineFilter {
    pub fn matches(&self, line: &str) -> bool {
        match self.op {
            LineFilterOp::Contains => line.contains(&self.pattern),
            LineFilterOp::NotContains => !line.contains(&self.pattern),
            LineFilterOp::Regex => self.regex.as_ref().is_some_and(|re| re.is_match(line)),
            LineFilterOp::NotRegex => !self.regex.as_ref().is_some_and(|re| re.is_match(line)),
        }
    }
}

/// Recognized aggregation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationKind {
    CountOverTime,
    Rate,
    BytesOverTime,
    BytesRate,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregationKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "count_over_time" => Some(Self::CountOverTime),
            "rate" => Some(Self::Rate),
            "bytes_over_time" => Some(Self::BytesOverTime),
            "bytes_rate" => Some(Self::BytesRate),
            "sum" => Some(Self::Sum),
            "avg" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CountOverTime => "count_over_time",
            Self::Rate => "rate",
            Self::BytesOverTime => "bytes_over_time",
            Self::BytesRate => "bytes_rate",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

/// Aggregation wrapper: function, range duration, optional group-by.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub kind: AggregationKind,
    /// Bucket step in seconds, from the `[duration]` range.
    pub step_seconds: i64,
    pub group_by: Vec<String>,
}

/// A fully parsed query.
#[derive(Debug, Clone, Default)]
pub struct ParsedQuery {
    pub matchers: Vec<LabelMatcher>,
    pub line_filters: Vec<LineFilter>,
    pub aggregation: Option<Aggregation>,
}

impl ParsedQuery {
    /// Parses a query string. The empty string yields a query matching all
    /// streams.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let mut cursor = Cursor::new(trimmed);
        let query = parse_query(&mut cursor)?;
        cursor.skip_ws();
        if !cursor.at_end() {
            return Err(ParseError::Syntax(format!(
                "unexpected trailing input at {:?}",
                cursor.rest()
            )));
        }
        Ok(query)
    }

    /// The exact-equality submap of the selector, used for chunk lookup.
    pub fn exact_match_labels(&self) -> LabelSet {
        self.matchers
            .iter()
            .filter(|m| m.op == MatchOp::Equal)
            .map(|m| (m.name.clone(), m.value.clone()))
            .collect()
    }

    /// True iff every label matcher accepts `labels`.
    pub fn matches_labels(&self, labels: &LabelSet) -> bool {
        self.matchers.iter().all(|m| m.matches(labels))
    }

    /// True iff every line filter accepts `line`.
    pub fn matches_line(&self, line: &str) -> bool {
        self.line_filters.iter().all(|f| f.matches(line))
    }
}

/// Builds the canonical exact-match selector for a label set,
/// `{k="v", ...}` in sorted key order. Inverse of the parser's
/// exact-match subset.
pub fn build_selector(labels: &LabelSet) -> String {
    if labels.is_empty() {
        return "{}".to_string();
    }
    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect();
    format!("{{{}}}", parts.join(", "))
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.bump();
        }
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), ParseError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(ParseError::Syntax(format!(
                "expected {:?} at {:?}",
                c,
                self.rest()
            )))
        }
    }

    /// Consumes `[A-Za-z_][A-Za-z0-9_]*`.
    fn ident(&mut self) -> Result<&'a str, ParseError> {
        let start = self.pos;
        if !self
            .peek()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        {
            return Err(ParseError::Syntax(format!(
                "expected identifier at {:?}",
                self.rest()
            )));
        }
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.bump();
        }
        Ok(&self.input[start..self.pos])
    }

    /// Consumes a double-quoted string. The content is taken verbatim, so
    /// patterns may contain backslashes but not a double quote.
    fn quoted_string(&mut self) -> Result<&'a str, ParseError> {
        self.expect('"')?;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '"' {
                let value = &self.input[start..self.pos];
                self.bump();
                return Ok(value);
            }
            self.bump();
        }
        Err(ParseError::Syntax("unterminated string".to_string()))
    }
}

fn parse_query(cursor: &mut Cursor) -> Result<ParsedQuery, ParseError> {
    cursor.skip_ws();

    // Anything before `{` must be an aggregation function name.
    let aggregation_kind = if cursor.peek() != Some('{') {
        let name = cursor.ident()?;
        let kind = AggregationKind::from_name(name)
            .ok_or_else(|| ParseError::UnknownAggregation(name.to_string()))?;
        cursor.skip_ws();
        cursor.expect('(')?;
        Some(kind)
    } else {
        None
    };

    let matchers = parse_selector(cursor)?;
    let line_filters = parse_line_filters(cursor)?;

    let aggregation = match aggregation_kind {
        Some(kind) => {
            cursor.skip_ws();
            let step_seconds = parse_range(cursor)?;
            cursor.skip_ws();
            cursor.expect(')')?;
            let group_by = parse_group_by(cursor)?;
            Some(Aggregation {
                kind,
                step_seconds,
                group_by,
            })
        }
        None => None,
    };

    Ok(ParsedQuery {
        matchers,
        line_filters,
        aggregation,
    })
}

fn parse_selector(cursor: &mut Cursor) -> Result<Vec<LabelMatcher>, ParseError> {
    cursor.skip_ws();
    cursor.expect('{')?;
    let mut matchers = Vec::new();

    loop {
        cursor.skip_ws();
        if cursor.eat('}') {
            return Ok(matchers);
        }
        if !matchers.is_empty() {
            cursor.expect(',')?;
            cursor.skip_ws();
        }

        let name = cursor.ident()?.to_string();
        cursor.skip_ws();
        let op = parse_match_op(cursor)?;
        cursor.skip_ws();
        let value = cursor.quoted_string()?.to_string();

        let regex = match op {
            MatchOp::Regex | MatchOp::NotRegex => Some(
                Regex::new(&value).map_err(|e| ParseError::Regex(value.clone(), e))?,
            ),
            _ => None,
        };
        matchers.push(LabelMatcher {
            name,
            value,
            op,
            regex,
        });
    }
}

fn parse_match_op(cursor: &mut Cursor) -> Result<MatchOp, ParseError> {
    if cursor.eat('=') {
        if cursor.eat('~') {
            Ok(MatchOp::Regex)
        } else {
            Ok(MatchOp::Equal)
        }
    } else if cursor.eat('!') {
        if cursor.eat('=') {
            Ok(MatchOp::NotEqual)
        } else if cursor.eat('~') {
            Ok(MatchOp::NotRegex)
        } else {
            Err(ParseError::Syntax(format!(
                "expected != or !~ at {:?}",
                cursor.rest()
            )))
        }
    } else {
        Err(ParseError::Syntax(format!(
            "expected label operator at {:?}",
            cursor.rest()
        )))
    }
}

fn parse_line_filters(cursor: &mut Cursor) -> Result<Vec<LineFilter>, ParseError> {
    let mut filters = Vec::new();
    loop {
        cursor.skip_ws();
        let op = if cursor.rest().starts_with("|=") {
            LineFilterOp::Contains
        } else if cursor.rest().starts_with("|~") {
            LineFilterOp::Regex
        } else if cursor.rest().starts_with("!=") {
            LineFilterOp::NotContains
        } else if cursor.rest().starts_with("!~") {
            LineFilterOp::NotRegex
        } else {
            return Ok(filters);
        };
        cursor.bump();
        cursor.bump();
        cursor.skip_ws();
        let pattern = cursor.quoted_string()?.to_string();

        let regex = match op {
            LineFilterOp::Regex | LineFilterOp::NotRegex => Some(
                Regex::new(&pattern).map_err(|e| ParseError::Regex(pattern.clone(), e))?,
            ),
            _ => None,
        };
        filters.push(LineFilter {
            pattern,
            op,
            regex,
        });
    }
}

/// Parses `[<digits><unit>]` with unit one of `s`, `m`, `h`, `d`.
fn parse_range(cursor: &mut Cursor) -> Result<i64, ParseError> {
    cursor.expect('[')?;
    let start = cursor.pos;
    while cursor.peek().is_some_and(|c| c.is_ascii_digit()) {
        cursor.bump();
    }
    let digits = &cursor.input[start..cursor.pos];
    let value: i64 = digits
        .parse()
        .map_err(|_| ParseError::Duration(format!("missing value in {:?}", cursor.rest())))?;
    let unit = cursor
        .bump()
        .ok_or_else(|| ParseError::Duration("missing unit".to_string()))?;
    let seconds = match unit {
        's' => value,
        'm' => value * 60,
        'h' => value * 3600,
        'd' => value * 86_400,
        other => {
            return Err(ParseError::Duration(format!(
                "unknown unit {:?}, expected s|m|h|d",
                other
            )));
        }
    };
    cursor.expect(']')?;
    Ok(seconds)
}

/// Parses an optional trailing `by (label, ...)` clause.
fn parse_group_by(cursor: &mut Cursor) -> Result<Vec<String>, ParseError> {
    cursor.skip_ws();
    if !cursor.rest().starts_with("by") {
        return Ok(Vec::new());
    }
    cursor.bump();
    cursor.bump();
    cursor.skip_ws();
    cursor.expect('(')?;
    let mut labels = Vec::new();
    loop {
        cursor.skip_ws();
        if cursor.eat(')') {
            return Ok(labels);
        }
        if !labels.is_empty() {
            cursor.expect(',')?;
            cursor.skip_ws();
        }
        labels.push(cursor.ident()?.to_string());
    }
}
