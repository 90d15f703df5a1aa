//! Flat key grammar.
//!
//! A flat key (after its prefix is removed) is a sequence of segments:
//! `name`, `name.sub`, `name[0]`, `name[0].sub`, `[0]`, `[0][1]`. The empty
//! key addresses the root itself.

use crate::errors::ConfigurationError;
use std::fmt;

/// One step of a key path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Object member.
    Field(String),
    /// Array element.
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, ".{name}"),
            Self::Index(idx) => write!(f, "[{idx}]"),
        }
    }
}

/// Characters that may not appear inside an object key.
pub const SEPARATORS: [char; 3] = ['.', '[', ']'];

/// Returns true if `key` can be used as an object member name.
#[must_use]
pub fn is_valid_field(key: &str) -> bool {
    !key.is_empty() && !key.contains(SEPARATORS)
}

/// Appends a field segment to a flat key being built.
///
/// The first segment directly follows the prefix; later ones are joined with `.`.
pub(crate) fn push_field(base: &str, at_root: bool, key: &str) -> String {
    if at_root {
        format!("{base}{key}")
    } else {
        format!("{base}.{key}")
    }
}

/// Parses a prefix-stripped key into its segments.
pub fn parse_key(raw: &str) -> Result<Vec<Segment>, ConfigurationError> {
    let invalid = |why: &str| ConfigurationError::new(format!("Invalid flat key '{raw}': {why}")).with_key(raw);

    let mut segments = Vec::new();
    let mut rest = raw;
    let mut first = true;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or_else(|| invalid("unclosed '['"))?;
            let idx = after[..close]
                .parse::<usize>()
                .map_err(|_| invalid("array index is not a number"))?;
            segments.push(Segment::Index(idx));
            rest = &after[close + 1..];
        } else {
            let body = if first {
                rest
            } else {
                rest.strip_prefix('.').ok_or_else(|| invalid("expected '.' or '['"))?
            };
            let end = body.find(['.', '[']).unwrap_or(body.len());
            let name = &body[..end];
            if name.is_empty() {
                return Err(invalid("empty field name"));
            }
            if name.contains(']') {
                return Err(invalid("unexpected ']'"));
            }
            segments.push(Segment::Field(name.to_string()));
            rest = &body[end..];
        }
        first = false;
    }

    Ok(segments)
}
