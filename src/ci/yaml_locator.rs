//! Source coordinates for pipeline documents.
//!
//! `serde_yaml` drops positions once a document is loaded into a `Value`, so
//! this module walks the raw text of a block-style document and records where
//! every mapping key and sequence item starts. Entries are addressed by dotted
//! paths (`jobs.build.scripts.0`). Paths that do not exist in the loaded value
//! are discarded, which filters out scalars that merely look like keys.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use std::fmt;

/// 1-based line and column of a key or sequence item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

struct Frame {
    indent: usize,
    path: String,
    opens_block: bool,
    is_item: bool,
}

pub fn join_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", parent, segment)
    }
}

/// Builds the location index for `source`, keeping only paths present in `root`.
pub fn index_locations(source: &str, root: &Value) -> HashMap<String, Location> {
    let mut locations = HashMap::new();
    let mut frames: Vec<Frame> = Vec::new();
    let mut item_counts: HashMap<String, usize> = HashMap::new();
    // Indent of the key that owns an open `|` or `>` block scalar.
    let mut block_scalar: Option<usize> = None;

    for (idx, raw) in source.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim_start();
        let indent = raw.len() - trimmed.len();

        if let Some(owner) = block_scalar {
            if trimmed.is_empty() || indent > owner {
                continue;
            }
            block_scalar = None;
        }

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with("---") || trimmed.starts_with("...") {
            frames.clear();
            item_counts.clear();
            continue;
        }

        let is_item = is_sequence_item(trimmed);
        while let Some(top) = frames.last() {
            // A zero-indented sequence still belongs to the key above it.
            let keep = top.indent < indent
                || (top.indent == indent && is_item && !top.is_item && top.opens_block);
            if keep {
                break;
            }
            frames.pop();
        }

        let mut column = indent;
        let mut rest = trimmed;

        while is_sequence_item(rest) {
            let parent = frames.last().map(|f| f.path.clone()).unwrap_or_default();
            let counter = item_counts.entry(parent.clone()).or_insert(0);
            let path = join_path(&parent, &counter.to_string());
            *counter += 1;

            let dash_column = column;
            let after = &rest[1..];
            let inner = after.trim_start();
            let content_column = if inner.is_empty() {
                dash_column
            } else {
                column + 1 + (after.len() - inner.len())
            };

            locations.insert(
                path.clone(),
                Location {
                    line,
                    column: content_column + 1,
                },
            );
            frames.push(Frame {
                indent: dash_column,
                path,
                opens_block: false,
                is_item: true,
            });

            column = content_column;
            rest = inner;
        }

        if let Some((key, value)) = split_key(rest) {
            let parent = frames.last().map(|f| f.path.clone()).unwrap_or_default();
            let path = join_path(&parent, &key);
            locations.insert(
                path.clone(),
                Location {
                    line,
                    column: column + 1,
                },
            );

            let value = value.trim();
            let value = if value.starts_with('#') { "" } else { value };
            if value.starts_with('|') || value.starts_with('>') {
                block_scalar = Some(column);
            }
            frames.push(Frame {
                indent: column,
                path,
                opens_block: value.is_empty(),
                is_item: false,
            });
        }
    }

    locations.retain(|path, _| lookup_path(root, path).is_some());
    locations
}

fn is_sequence_item(text: &str) -> bool {
    text == "-" || text.starts_with("- ")
}

/// Splits `key: value` into the unquoted key and the remainder after the colon.
fn split_key(text: &str) -> Option<(String, &str)> {
    let first = text.chars().next()?;
    match first {
        '"' | '\'' => {
            let close = find_closing_quote(text, first)?;
            let key = &text[1..close];
            let after = text[close + 1..].trim_start();
            let offset = text.len() - after.len();
            if after.starts_with(':') && is_key_terminator(&after[1..]) {
                let key = if first == '\'' {
                    key.replace("''", "'")
                } else {
                    key.replace("\\\"", "\"")
                };
                Some((key, &text[offset + 1..]))
            } else {
                None
            }
        }
        '{' | '[' | '&' | '*' | '!' | '|' | '>' | '#' => None,
        _ => {
            let bytes = text.as_bytes();
            for (pos, byte) in bytes.iter().enumerate() {
                if *byte == b'#' && pos > 0 && bytes[pos - 1] == b' ' {
                    return None;
                }
                if *byte == b':' && is_key_terminator(&text[pos + 1..]) {
                    let key = text[..pos].trim_end();
                    if key.is_empty() {
                        return None;
                    }
                    return Some((key.to_string(), &text[pos + 1..]));
                }
            }
            None
        }
    }
}

fn is_key_terminator(after_colon: &str) -> bool {
    after_colon.is_empty() || after_colon.starts_with(' ') || after_colon.starts_with('\t')
}

fn find_closing_quote(text: &str, quote: char) -> Option<usize> {
    let bytes = text.as_bytes();
    let quote = quote as u8;
    let mut pos = 1;
    while pos < bytes.len() {
        if bytes[pos] == b'\\' && quote == b'"' {
            pos += 2;
            continue;
        }
        if bytes[pos] == quote {
            if quote == b'\'' && bytes.get(pos + 1) == Some(&b'\'') {
                pos += 2;
                continue;
            }
            return Some(pos);
        }
        pos += 1;
    }
    None
}

/// Resolves a dotted path against a YAML value. Numeric segments index sequences.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Mapping(map) => map.get(segment)?,
            Value::Sequence(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
