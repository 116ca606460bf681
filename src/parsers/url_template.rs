//! RFC 6570 URI templates, restricted to string-valued variables.
//!
//! Linkifier URL templates only ever receive regex captures, so list and
//! associative values are not supported.

use std::collections::HashMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed expression starting at byte {0}")]
    Unclosed(usize),
    #[error("invalid variable name {0:?}")]
    InvalidVariable(String),
    #[error("invalid prefix modifier on {0:?}")]
    InvalidPrefix(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Simple,
    Reserved,
    Fragment,
    Label,
    Path,
    PathParam,
    Query,
    QueryContinuation,
}

impl Operator {
    fn from_char(c: char) -> Option<Self> {
        Some(match c {
            '+' => Operator::Reserved,
            '#' => Operator::Fragment,
            '.' => Operator::Label,
            '/' => Operator::Path,
            ';' => Operator::PathParam,
            '?' => Operator::Query,
            '&' => Operator::QueryContinuation,
            _ => return None,
        })
    }

    fn first(self) -> &'static str {
        match self {
            Operator::Simple | Operator::Reserved => "",
            Operator::Fragment => "#",
            Operator::Label => ".",
            Operator::Path => "/",
            Operator::PathParam => ";",
            Operator::Query => "?",
            Operator::QueryContinuation => "&",
        }
    }

    fn separator(self) -> &'static str {
        match self {
            Operator::Simple | Operator::Reserved | Operator::Fragment => ",",
            Operator::Label => ".",
            Operator::Path => "/",
            Operator::PathParam => ";",
            Operator::Query | Operator::QueryContinuation => "&",
        }
    }

    fn named(self) -> bool {
        matches!(
            self,
            Operator::PathParam | Operator::Query | Operator::QueryContinuation
        )
    }

    fn if_empty(self) -> &'static str {
        match self {
            Operator::Query | Operator::QueryContinuation => "=",
            _ => "",
        }
    }

    fn allow_reserved(self) -> bool {
        matches!(self, Operator::Reserved | Operator::Fragment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VarSpec {
    name: String,
    prefix: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Expression { op: Operator, vars: Vec<VarSpec> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    parts: Vec<Part>,
}

impl UrlTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut parts = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let close = rest[open..]
                .find('}')
                .ok_or(TemplateError::Unclosed(offset + open))?;
            parts.push(parse_expression(&rest[open + 1..open + close])?);
            offset += open + close + 1;
            rest = &rest[open + close + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        Ok(Self { parts })
    }

    /// Names of all variables referenced by the template, in order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.parts
            .iter()
            .flat_map(|part| match part {
                Part::Literal(_) => &[] as &[VarSpec],
                Part::Expression { vars, .. } => vars.as_slice(),
            })
            .map(|var| var.name.as_str())
    }

    pub fn expand(&self, values: &HashMap<&str, &str>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Expression { op, vars } => expand_expression(&mut out, *op, vars, values),
            }
        }
        out
    }
}

fn parse_expression(body: &str) -> Result<Part, TemplateError> {
    let mut chars = body.chars();
    let (op, list) = match chars.next().and_then(Operator::from_char) {
        Some(op) => (op, chars.as_str()),
        None => (Operator::Simple, body),
    };

    let mut vars = Vec::new();
    for raw in list.split(',') {
        let (name, prefix) = match raw.split_once(':') {
            Some((name, len)) => {
                let len: usize = len
                    .parse()
                    .map_err(|_| TemplateError::InvalidPrefix(raw.to_string()))?;
                if len == 0 || len >= 10_000 {
                    return Err(TemplateError::InvalidPrefix(raw.to_string()));
                }
                (name, Some(len))
            }
            // Explode only matters for composite values.
            None => (raw.strip_suffix('*').unwrap_or(raw), None),
        };
        if !is_valid_name(name) {
            return Err(TemplateError::InvalidVariable(raw.to_string()));
        }
        vars.push(VarSpec {
            name: name.to_string(),
            prefix,
        });
    }

    Ok(Part::Expression { op, vars })
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '%')
}

fn expand_expression(
    out: &mut String,
    op: Operator,
    vars: &[VarSpec],
    values: &HashMap<&str, &str>,
) {
    let mut first = true;
    for var in vars {
        let Some(value) = values.get(var.name.as_str()) else {
            continue;
        };
        out.push_str(if first { op.first() } else { op.separator() });
        first = false;

        if op.named() {
            out.push_str(&var.name);
            if value.is_empty() {
                out.push_str(op.if_empty());
                continue;
            }
            out.push('=');
        }

        let value: String = match var.prefix {
            Some(len) => value.chars().take(len).collect(),
            None => value.to_string(),
        };
        encode_into(out, &value, op.allow_reserved());
    }
}

/// RFC 3986 unreserved characters pass through.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// `+` and `#` expansions also keep the reserved set.
const UNRESERVED_OR_RESERVED: &AsciiSet = &UNRESERVED
    .remove(b':')
    .remove(b'/')
    .remove(b'?')
    .remove(b'#')
    .remove(b'[')
    .remove(b']')
    .remove(b'@')
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b';')
    .remove(b'=');

fn encode_into(out: &mut String, value: &str, allow_reserved: bool) {
    if !allow_reserved {
        out.extend(utf8_percent_encode(value, UNRESERVED));
        return;
    }

    // Reserved expansion keeps existing pct-encoded triplets.
    let mut rest = value;
    while let Some(pos) = rest.find('%') {
        let (head, tail) = rest.split_at(pos);
        out.extend(utf8_percent_encode(head, UNRESERVED_OR_RESERVED));
        let bytes = tail.as_bytes();
        if bytes.len() >= 3 && bytes[1].is_ascii_hexdigit() && bytes[2].is_ascii_hexdigit() {
            out.push_str(&tail[..3]);
            rest = &tail[3..];
        } else {
            out.push_str("%25");
            rest = &tail[1..];
        }
    }
    out.extend(utf8_percent_encode(rest, UNRESERVED_OR_RESERVED));
}
