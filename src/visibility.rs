//! Cell visibility labels and caller authorizations
//!
//! A visibility expression is a boolean formula over labels, for example
//! `admin|(ops&eu)`. A reader holding [`Authorizations`] sees a cell only if
//! the formula evaluates to true for its label set; the empty expression is
//! public. `&` and `|` may not be mixed at one nesting level without
//! parentheses, so `a&b|c` is rejected.
//!
//! Labels are runs of `[A-Za-z0-9_\-:./]`, or double-quoted strings with `\"`
//! and `\\` escapes for anything else.
//!
//! # Example
//!
//! ```rust
//! use rollup_tsdb::visibility::{Authorizations, ColumnVisibility};
//!
//! let vis = ColumnVisibility::parse("admin|(ops&eu)").unwrap();
//! assert!(vis.evaluate(&Authorizations::new(["ops", "eu"]).unwrap()));
//! assert!(!vis.evaluate(&Authorizations::new(["ops"]).unwrap()));
//! assert!(ColumnVisibility::parse("").unwrap().evaluate(&Authorizations::empty()));
//! ```

use crate::error::VisibilityError;
use nom::{
    branch::alt,
    bytes::complete::take_while1,
    character::complete::char,
    combinator::{all_consuming, map},
    multi::many1,
    sequence::{delimited, preceded},
    IResult, Parser,
};
use std::collections::BTreeSet;
use std::fmt;

/// Parsed visibility formula
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibilityExpr {
    /// A single label
    Label(String),
    /// Every child must hold
    And(Vec<VisibilityExpr>),
    /// At least one child must hold
    Or(Vec<VisibilityExpr>),
}

impl VisibilityExpr {
    fn evaluate(&self, auths: &Authorizations) -> bool {
        match self {
            VisibilityExpr::Label(label) => auths.contains(label),
            VisibilityExpr::And(children) => children.iter().all(|c| c.evaluate(auths)),
            VisibilityExpr::Or(children) => children.iter().any(|c| c.evaluate(auths)),
        }
    }
}

/// A validated visibility expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnVisibility {
    expression: String,
    root: Option<VisibilityExpr>,
}

impl ColumnVisibility {
    /// Parse an expression; the empty string is the public visibility
    pub fn parse(expression: &str) -> Result<Self, VisibilityError> {
        if expression.is_empty() {
            return Ok(Self::public());
        }

        let (_, root) = all_consuming(parse_expression)
            .parse(expression)
            .map_err(|e| VisibilityError::MalformedExpression {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            expression: expression.to_string(),
            root: Some(root),
        })
    }

    /// The public (empty) visibility
    pub fn public() -> Self {
        Self {
            expression: String::new(),
            root: None,
        }
    }

    /// True for the empty expression
    pub fn is_public(&self) -> bool {
        self.root.is_none()
    }

    /// The expression as written
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Parsed formula, `None` when public
    pub fn root(&self) -> Option<&VisibilityExpr> {
        self.root.as_ref()
    }

    /// Whether a reader holding `auths` may see a cell with this visibility
    pub fn evaluate(&self, auths: &Authorizations) -> bool {
        self.root.as_ref().map_or(true, |root| root.evaluate(auths))
    }
}

impl fmt::Display for ColumnVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.' | '/')
}

fn parse_expression(input: &str) -> IResult<&str, VisibilityExpr> {
    let (input, first) = parse_term(input)?;

    if let Ok((rest, mut others)) = many1(preceded(char('&'), parse_term)).parse(input) {
        others.insert(0, first);
        return Ok((rest, VisibilityExpr::And(others)));
    }
    if let Ok((rest, mut others)) = many1(preceded(char('|'), parse_term)).parse(input) {
        others.insert(0, first);
        return Ok((rest, VisibilityExpr::Or(others)));
    }

    Ok((input, first))
}

fn parse_term(input: &str) -> IResult<&str, VisibilityExpr> {
    alt((
        delimited(char('('), parse_expression, char(')')),
        map(take_while1(is_label_char), |label: &str| {
            VisibilityExpr::Label(label.to_string())
        }),
        map(parse_quoted, VisibilityExpr::Label),
    ))
    .parse(input)
}

/// Double-quoted label with `\"` and `\\` escapes
fn parse_quoted(input: &str) -> IResult<&str, String> {
    let body = input.strip_prefix('"').ok_or_else(|| fail(input))?;
    let mut label = String::new();
    let mut chars = body.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' if !label.is_empty() => return Ok((&body[i + 1..], label)),
            '"' => return Err(fail(input)),
            '\\' => match chars.next() {
                Some((_, escaped @ ('"' | '\\'))) => label.push(escaped),
                _ => return Err(fail(&body[i..])),
            },
            other => label.push(other),
        }
    }

    Err(fail(input))
}

fn fail(at: &str) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Error(nom::error::Error::new(at, nom::error::ErrorKind::Escaped))
}

/// The set of labels a reader presents to the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authorizations {
    labels: BTreeSet<String>,
}

impl Authorizations {
    /// Build an authorization set, rejecting empty or control-character labels
    pub fn new<I, S>(labels: I) -> Result<Self, VisibilityError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for label in labels {
            let label = label.into();
            if label.is_empty() || label.chars().any(char::is_control) {
                return Err(VisibilityError::InvalidAuthorization(label));
            }
            set.insert(label);
        }
        Ok(Self { labels: set })
    }

    /// No authorizations; only public cells are visible
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a comma separated list such as `"admin,ops"`
    pub fn parse_list(list: &str) -> Result<Self, VisibilityError> {
        Self::new(list.split(',').map(str::trim).filter(|s| !s.is_empty()))
    }

    /// Whether `label` is held
    pub fn contains(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Iterate over held labels in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True when no labels are held
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
