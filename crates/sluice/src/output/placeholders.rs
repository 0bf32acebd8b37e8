//! 🔧 `${...}` placeholder expansion, evaluated against one chunk.
//!
//! Supported: `${tag}`, `${tag_parts[N]}` (negative N counts from the end), and
//! `${name}` for any chunk variable. Anything we cannot resolve stays verbatim,
//! so a half-expanded name is easy to spot downstream (and the template installer
//! refuses it as non-deterministic).

use std::collections::HashMap;

use crate::common::Chunk;

/// 🏷️ What a chunk knows about itself, borrowed for the duration of one flush.
#[derive(Debug, Clone)]
pub struct PlaceholderContext<'a> {
    tag: &'a str,
    tag_parts: Vec<&'a str>,
    variables: &'a HashMap<String, String>,
}

impl<'a> PlaceholderContext<'a> {
    pub fn new(tag: &'a str, variables: &'a HashMap<String, String>) -> Self {
        Self {
            tag,
            tag_parts: tag.split('.').collect(),
            variables,
        }
    }

    pub fn for_chunk(chunk: &'a Chunk) -> Self {
        Self::new(&chunk.tag, &chunk.variables)
    }

    /// 🔁 Expand every `${...}` we recognize. Unknown ones are left alone.
    pub fn expand(&self, input: &str) -> String {
        if !input.contains("${") {
            return input.to_string();
        }
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let key = &after[..end];
                    match self.resolve(key) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("${");
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // 🤷 dangling "${" with no closer, keep the tail as-is
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    pub fn expand_opt(&self, input: Option<&str>) -> Option<String> {
        input.map(|value| self.expand(value))
    }

    fn resolve(&self, key: &str) -> Option<&'a str> {
        let key = key.trim();
        if key == "tag" {
            return Some(self.tag);
        }
        if let Some(index) = key
            .strip_prefix("tag_parts[")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let index: i64 = index.trim().parse().ok()?;
            let len = self.tag_parts.len() as i64;
            let resolved = if index < 0 { len + index } else { index };
            if resolved < 0 || resolved >= len {
                return None;
            }
            return self.tag_parts.get(resolved as usize).copied();
        }
        self.variables.get(key).map(String::as_str)
    }
}

/// 🎲 A value is deterministic once no placeholder survived expansion.
pub fn is_deterministic(expanded: &str) -> bool {
    !expanded.contains("${")
}
