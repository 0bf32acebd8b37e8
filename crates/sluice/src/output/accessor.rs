//! 🔍 Record accessor: reach into nested records by path.
//!
//! Accepted shapes:
//! - `request_id` (a bare top-level key, dots and all)
//! - `$.a.b` (dot notation)
//! - `$['a']['b']` or `$["a"]` (bracket notation, for keys with dots in them)
//! - `$.a[0]` (array index)
//!
//! Parsed once at startup; `get` and `take` are then just a walk.

use anyhow::{Result, bail};
use serde_json::Value;

use crate::common::Record;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// 🧭 A compiled path into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordAccessor {
    raw: String,
    segments: Vec<Segment>,
}

impl RecordAccessor {
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            bail!("💀 record accessor path is empty. We need at least a key to go looking for.");
        }
        let segments = match path.strip_prefix('$') {
            Some(rest) => parse_json_path(path, rest)?,
            None => vec![Segment::Key(path.to_string())],
        };
        if !matches!(segments.first(), Some(Segment::Key(_))) {
            bail!("💀 record accessor '{path}' must start with a key, records are objects not arrays");
        }
        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    pub fn path(&self) -> &str {
        &self.raw
    }

    /// 👀 Look, don't touch.
    pub fn get<'r>(&self, record: &'r Record) -> Option<&'r Value> {
        let (first, rest) = self.segments.split_first()?;
        let Segment::Key(first) = first else {
            return None;
        };
        let mut current = record.get(first)?;
        for segment in rest {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get(key)?,
                (Segment::Index(index), Value::Array(items)) => items.get(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// ✂️ Remove the value at the path and hand it back. Parents stay, even if empty.
    pub fn take(&self, record: &mut Record) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        if parents.is_empty() {
            let Segment::Key(key) = last else {
                return None;
            };
            return record.remove(key);
        }
        let (first, middle) = parents.split_first()?;
        let Segment::Key(first) = first else {
            return None;
        };
        let mut current = record.get_mut(first)?;
        for segment in middle {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get_mut(key)?,
                (Segment::Index(index), Value::Array(items)) => items.get_mut(*index)?,
                _ => return None,
            };
        }
        match (last, current) {
            (Segment::Key(key), Value::Object(map)) => map.remove(key),
            (Segment::Index(index), Value::Array(items)) if *index < items.len() => {
                Some(items.remove(*index))
            }
            _ => None,
        }
    }
}

fn parse_json_path(raw: &str, mut rest: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    while !rest.is_empty() {
        if let Some(after_dot) = rest.strip_prefix('.') {
            let end = after_dot.find(['.', '[']).unwrap_or(after_dot.len());
            let key = &after_dot[..end];
            if key.is_empty() {
                bail!("💀 record accessor '{raw}' has an empty key after a dot");
            }
            segments.push(Segment::Key(key.to_string()));
            rest = &after_dot[end..];
        } else if let Some(after_bracket) = rest.strip_prefix('[') {
            let close = after_bracket
                .find(']')
                .ok_or_else(|| anyhow::anyhow!("💀 record accessor '{raw}' has an unclosed '['"))?;
            let inner = &after_bracket[..close];
            let quoted = inner
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
            match quoted {
                Some(key) if !key.is_empty() => segments.push(Segment::Key(key.to_string())),
                Some(_) => bail!("💀 record accessor '{raw}' has an empty quoted key"),
                None => match inner.trim().parse::<usize>() {
                    Ok(index) => segments.push(Segment::Index(index)),
                    Err(_) => bail!(
                        "💀 record accessor '{raw}': '[{inner}]' is neither a quoted key nor an array index"
                    ),
                },
            }
            rest = &after_bracket[close + 1..];
        } else {
            bail!("💀 record accessor '{raw}' expected '.' or '[' but found '{rest}'");
        }
    }
    if segments.is_empty() {
        bail!("💀 record accessor '{raw}' points at the whole record, pick a field");
    }
    Ok(segments)
}
