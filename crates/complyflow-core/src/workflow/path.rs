//! Path addressing into the JSON execution context.
//!
//! Paths look like `$`, `$.scan.findings`, `$.items[0].id` or
//! `$['key with spaces']`. Reads of a missing path yield `None`; writes
//! create intermediate objects (and append to arrays at `len`). Writing
//! to `$` replaces the whole document.
//!
//! Parameter templates use the same syntax: any object key ending in `.$`
//! takes its value from a path. Paths starting with `$$` address the
//! execution context object (`$$.Execution.Id`, `$$.Map.Item.Value`, ...)
//! instead of the state input.

use std::fmt;

use serde_json::{Map, Value};

/// Errors from parsing or writing a path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path '{0}' must start with '$'")]
    MissingRoot(String),

    #[error("invalid path '{path}': {reason}")]
    Invalid { path: String, reason: String },

    #[error("cannot write '{path}': {reason}")]
    Write { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed `$`-rooted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    /// The root path `$`.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn parse(path: &str) -> Result<Self, PathError> {
        let Some(mut rest) = path.trim().strip_prefix('$') else {
            return Err(PathError::MissingRoot(path.to_string()));
        };
        let invalid = |reason: &str| PathError::Invalid {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        while !rest.is_empty() {
            if let Some(after_dot) = rest.strip_prefix('.') {
                let end = after_dot
                    .find(['.', '['])
                    .unwrap_or(after_dot.len());
                let key = &after_dot[..end];
                if key.is_empty() {
                    return Err(invalid("empty key segment"));
                }
                segments.push(Segment::Key(key.to_string()));
                rest = &after_dot[end..];
            } else if let Some(after_bracket) = rest.strip_prefix('[') {
                let close = after_bracket
                    .find(']')
                    .ok_or_else(|| invalid("unclosed '['"))?;
                let inner = after_bracket[..close].trim();
                if let Some(quoted) = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                {
                    segments.push(Segment::Key(quoted.to_string()));
                } else {
                    let idx = inner
                        .parse::<usize>()
                        .map_err(|_| invalid("array index must be a non-negative integer"))?;
                    segments.push(Segment::Index(idx));
                }
                rest = &after_bracket[close + 1..];
            } else {
                return Err(invalid("expected '.' or '[' after segment"));
            }
        }

        Ok(Self { segments })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Read the value at this path. Missing keys, out-of-range indices and
    /// type mismatches all read as absent.
    pub fn read<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        self.segments.iter().try_fold(doc, |current, segment| match segment {
            Segment::Key(key) => current.get(key.as_str()),
            Segment::Index(idx) => current.get(*idx),
        })
    }

    /// Write `value` at this path, creating intermediate containers.
    pub fn write(&self, doc: &mut Value, value: Value) -> Result<(), PathError> {
        let mut current = doc;
        for segment in &self.segments {
            current = match segment {
                Segment::Key(key) => {
                    if current.is_null() {
                        *current = Value::Object(Map::new());
                    }
                    match current {
                        Value::Object(map) => map.entry(key.clone()).or_insert(Value::Null),
                        other => {
                            return Err(self.write_error(format!(
                                "segment '{key}' addresses a {}",
                                type_name(other)
                            )));
                        }
                    }
                }
                Segment::Index(idx) => {
                    if current.is_null() {
                        *current = Value::Array(Vec::new());
                    }
                    match current {
                        Value::Array(items) => {
                            if *idx == items.len() {
                                items.push(Value::Null);
                            }
                            let len = items.len();
                            match items.get_mut(*idx) {
                                Some(slot) => slot,
                                None => {
                                    return Err(self.write_error(format!(
                                        "index {idx} is past the end of an array of {len}"
                                    )));
                                }
                            }
                        }
                        other => {
                            return Err(self.write_error(format!(
                                "index {idx} addresses a {}",
                                type_name(other)
                            )));
                        }
                    }
                }
            };
        }
        *current = value;
        Ok(())
    }

    fn write_error(&self, reason: String) -> PathError {
        PathError::Write {
            path: self.to_string(),
            reason,
        }
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for segment in &self.segments {
            match segment {
                Segment::Key(key) if key.contains(['.', '[', ']', ' ']) => {
                    write!(f, "['{key}']")?
                }
                Segment::Key(key) => write!(f, ".{key}")?,
                Segment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Read `path` from `doc`, treating a missing value as `None`.
pub fn read_path<'a>(doc: &'a Value, path: &str) -> Result<Option<&'a Value>, PathError> {
    Ok(JsonPath::parse(path)?.read(doc))
}

/// Write `value` at `path` in `doc`. An absent path (`None`) means `$`.
pub fn write_result(doc: &mut Value, path: Option<&str>, value: Value) -> Result<(), PathError> {
    match path {
        None => {
            *doc = value;
            Ok(())
        }
        Some(path) => JsonPath::parse(path)?.write(doc, value),
    }
}

/// Resolve a path against the state input or, for `$$` paths, the
/// execution context object.
pub fn resolve_reference(
    path: &str,
    input: &Value,
    context_object: &Value,
) -> Result<Option<Value>, PathError> {
    let found = match path.trim().strip_prefix("$$") {
        Some(rest) => JsonPath::parse(&format!("${rest}"))?
            .read(context_object)
            .cloned(),
        None => JsonPath::parse(path)?.read(input).cloned(),
    };
    Ok(found)
}

/// Render a parameter template.
///
/// Object keys ending in `.$` are replaced by the key without the suffix
/// and the value found at the referenced path (`null` when absent). All
/// other values are copied through, recursing into objects and arrays.
pub fn render_template(
    template: &Value,
    input: &Value,
    context_object: &Value,
) -> Result<Value, PathError> {
    match template {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                match (key.strip_suffix(".$"), value) {
                    (Some(name), Value::String(path)) => {
                        let resolved = resolve_reference(path, input, context_object)?;
                        out.insert(name.to_string(), resolved.unwrap_or(Value::Null));
                    }
                    _ => {
                        out.insert(
                            key.clone(),
                            render_template(value, input, context_object)?,
                        );
                    }
                }
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| render_template(item, input, context_object))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Check every `.$` reference in a template parses.
pub fn validate_template(template: &Value) -> Result<(), PathError> {
    match template {
        Value::Object(map) => {
            for (key, value) in map {
                match (key.ends_with(".$"), value) {
                    (true, Value::String(path)) => {
                        let normalized = match path.trim().strip_prefix("$$") {
                            Some(rest) => format!("${rest}"),
                            None => path.clone(),
                        };
                        JsonPath::parse(&normalized)?;
                    }
                    (true, _) => {
                        return Err(PathError::Invalid {
                            path: key.clone(),
                            reason: "a '.$' key must map to a path string".to_string(),
                        });
                    }
                    (false, nested) => validate_template(nested)?,
                }
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(validate_template),
        _ => Ok(()),
    }
}
