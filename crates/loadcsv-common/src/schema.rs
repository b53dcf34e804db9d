//! Array schema model
//!
//! Parses schema text of the form `<attr:type [NOT] NULL, ...>[dim=low:high,chunk,overlap]`
//! (and the `;`-separated `dim=low:high:overlap:chunk` variant) into an ordered list of
//! attributes and dimensions. The loader only supports one dimension; that check lives in
//! [`Schema::single_dimension`] so callers decide when it is fatal.

use crate::error::{Result, SchemaError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Pattern locating a `<attrs>[dims]` fragment inside array definition text.
pub const SCHEMA_FRAGMENT_PATTERN: &str = r"<[^>]+>\s*\[[^\]]+\]";

/// One attribute of an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    /// Type tag as written in the schema (e.g. `int64`, `string`)
    pub type_name: String,
    pub nullable: bool,
}

impl Attribute {
    /// Quoting class character used by the splitter and converters.
    ///
    /// `s`/`S` nullable/non-null string, `c`/`C` nullable/non-null char, `N` anything else.
    pub fn type_code(&self) -> char {
        let type_name = self.type_name.to_lowercase();
        if type_name.contains("string") {
            if self.nullable {
                's'
            } else {
                'S'
            }
        } else if type_name.contains("char") {
            if self.nullable {
                'c'
            } else {
                'C'
            }
        } else {
            'N'
        }
    }
}

/// One dimension of an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub low: Option<String>,
    pub high: Option<String>,
    /// Declared chunk interval; `None` when omitted or written as `*`
    pub chunk_interval: Option<u64>,
    pub overlap: Option<u64>,
}

/// Parsed array schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub attributes: Vec<Attribute>,
    pub dimensions: Vec<Dimension>,
    /// The `<...>[...]` text the schema was parsed from
    pub text: String,
}

impl Schema {
    /// Return the only dimension, or fail if the schema has zero or several.
    pub fn single_dimension(&self) -> Result<&Dimension> {
        match self.dimensions.as_slice() {
            [dimension] => Ok(dimension),
            dims => Err(SchemaError::DimensionCount {
                schema: self.text.clone(),
                count: dims.len(),
            }),
        }
    }

    /// Type pattern derived from the attributes, one character per attribute.
    pub fn type_pattern(&self) -> String {
        self.attributes.iter().map(Attribute::type_code).collect()
    }
}

impl FromStr for Schema {
    type Err = SchemaError;

    fn from_str(text: &str) -> Result<Self> {
        let text = text.trim();
        let open = text
            .find('<')
            .ok_or_else(|| SchemaError::malformed(text, "missing '<'"))?;
        let close = text[open..]
            .find('>')
            .map(|i| open + i)
            .ok_or_else(|| SchemaError::malformed(text, "missing '>'"))?;
        let rest = text[close + 1..].trim_start();
        let dims_body = rest
            .strip_prefix('[')
            .and_then(|r| r.find(']').map(|end| &r[..end]))
            .ok_or_else(|| SchemaError::malformed(text, "missing '[...]' dimension list"))?;

        let attributes = parse_attributes(text, &text[open + 1..close])?;
        if attributes.is_empty() {
            return Err(SchemaError::NoAttributes(text.to_string()));
        }
        let dimensions = parse_dimensions(text, dims_body)?;

        let fragment_end = close + 1 + (text[close + 1..].len() - rest.len()) + dims_body.len() + 2;
        Ok(Schema {
            attributes,
            dimensions,
            text: text[open..fragment_end].to_string(),
        })
    }
}

/// Locate the first `<attrs>[dims]` fragment in free-form array definition text.
pub fn find_schema_fragment(text: &str) -> Result<Option<&str>> {
    let pattern = Regex::new(SCHEMA_FRAGMENT_PATTERN)?;
    Ok(pattern.find(text).map(|m| m.as_str()))
}

/// Split on commas that are not inside single quotes.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quote = false;
    let mut start = 0;
    for (i, ch) in body.char_indices() {
        match ch {
            '\'' => in_quote = !in_quote,
            ',' if !in_quote => {
                parts.push(&body[start..i]);
                start = i + 1;
            },
            _ => {},
        }
    }
    parts.push(&body[start..]);
    parts
}

fn parse_attributes(schema: &str, body: &str) -> Result<Vec<Attribute>> {
    let mut attributes = Vec::new();
    for item in split_top_level(body) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (name, decl) = item
            .split_once(':')
            .ok_or_else(|| SchemaError::malformed(schema, format!("attribute '{item}' has no type")))?;
        let tokens: Vec<String> = decl.split_whitespace().map(str::to_lowercase).collect();
        let type_name = decl
            .split_whitespace()
            .next()
            .ok_or_else(|| SchemaError::malformed(schema, format!("attribute '{item}' has no type")))?;
        let nullable = tokens
            .iter()
            .enumerate()
            .any(|(i, t)| t == "null" && (i == 0 || tokens[i - 1] != "not"));
        attributes.push(Attribute {
            name: name.trim().to_string(),
            type_name: type_name.to_string(),
            nullable,
        });
    }
    Ok(attributes)
}

fn parse_count(schema: &str, token: &str, what: &str) -> Result<Option<u64>> {
    let token = token.trim();
    if token.is_empty() || token == "*" || token == "?" {
        return Ok(None);
    }
    token
        .parse::<u64>()
        .map(Some)
        .map_err(|_| SchemaError::malformed(schema, format!("invalid {what} '{token}'")))
}

fn parse_dimension_head(schema: &str, head: &str) -> Result<Dimension> {
    let (name, range) = match head.split_once('=') {
        Some((name, range)) => (name.trim(), Some(range)),
        None => (head.trim(), None),
    };
    if name.is_empty() {
        return Err(SchemaError::malformed(schema, "dimension without a name"));
    }
    let mut dimension = Dimension {
        name: name.to_string(),
        low: None,
        high: None,
        chunk_interval: None,
        overlap: None,
    };
    if let Some(range) = range {
        let parts: Vec<&str> = range.split(':').map(str::trim).collect();
        dimension.low = parts.first().map(|s| s.to_string());
        dimension.high = parts.get(1).map(|s| s.to_string());
        if let Some(overlap) = parts.get(2) {
            dimension.overlap = parse_count(schema, overlap, "overlap")?;
        }
        if let Some(chunk) = parts.get(3) {
            dimension.chunk_interval = parse_count(schema, chunk, "chunk interval")?;
        }
    }
    Ok(dimension)
}

fn parse_dimensions(schema: &str, body: &str) -> Result<Vec<Dimension>> {
    if body.contains(';') {
        return body
            .split(';')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| parse_dimension_head(schema, d))
            .collect();
    }

    // Comma form: `name=low:high,chunk,overlap, name2=...`. A token starting with a
    // letter opens a new dimension; numeric tokens fill chunk then overlap.
    let mut dimensions: Vec<Dimension> = Vec::new();
    let mut extras = 0;
    for token in body.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let opens_dimension = token
            .chars()
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_');
        if opens_dimension {
            dimensions.push(parse_dimension_head(schema, token)?);
            extras = 0;
            continue;
        }
        let current = dimensions
            .last_mut()
            .ok_or_else(|| SchemaError::malformed(schema, format!("unexpected '{token}'")))?;
        match extras {
            0 => current.chunk_interval = parse_count(schema, token, "chunk interval")?,
            1 => current.overlap = parse_count(schema, token, "overlap")?,
            _ => {
                return Err(SchemaError::malformed(
                    schema,
                    format!("too many values for dimension '{}'", current.name),
                ))
            },
        }
        extras += 1;
    }
    Ok(dimensions)
}
