//! Scope stack and path resolution.
//!
//! During a walk the engine keeps a stack of scope frames: the root scope
//! supplied by the host at the bottom, plus one derived frame per active
//! repeater iteration. Because the walk is depth-first, the frame stack is
//! always exactly the chain of enclosing scopes, so looking a name up from
//! innermost to outermost frame gives the ancestor-chain semantics the
//! directive language expects.
//!
//! Resolution of a full path (`person.address[0].city`) is deliberately
//! forgiving: every failure is reported as a [`Miss`], and the engine
//! decides whether a miss becomes a default value (lenient) or a
//! [`CompileError`](crate::CompileError) (strict).

use std::collections::{BTreeMap, HashMap};

use crate::value::Value;

/// Why a path failed to resolve. Carried by [`Miss`] for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Miss {
    pub path: String,
    pub reason: String,
}

impl Miss {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Miss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' not found: {}", self.path, self.reason)
    }
}

/// One segment of a dotted path: a name plus any trailing indexers.
///
/// `items[2]` parses as name `items` with indexer `2`; `lookup(key)` as
/// name `lookup` with indexer `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    name: String,
    indexers: Vec<String>,
}

pub(crate) struct ScopeStack<'a> {
    root: &'a HashMap<String, Value>,
    frames: Vec<HashMap<String, Value>>,
}

impl<'a> ScopeStack<'a> {
    pub fn new(root: &'a HashMap<String, Value>) -> Self {
        Self {
            root,
            frames: Vec::new(),
        }
    }

    pub fn push(&mut self, frame: HashMap<String, Value>) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    /// Walk from the innermost frame outward, ending at the root scope.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        for frame in self.frames.iter().rev() {
            if let Some(val) = frame.get(name) {
                return Some(val);
            }
        }
        self.root.get(name)
    }

    /// Snapshot of every binding currently visible, inner frames winning.
    ///
    /// Bound as `$parent` inside repeater iterations so templates can reach
    /// the enclosing scope explicitly.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let mut merged: BTreeMap<String, Value> = self
            .root
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for frame in &self.frames {
            for (k, v) in frame {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    /// Resolve a dotted, optionally indexed path against the visible scopes.
    ///
    /// The first segment's name is found by the scope walk; indexers and
    /// subsequent segments navigate into the value. Any failure yields a
    /// [`Miss`], never a panic or a hard error.
    pub fn resolve_path(&self, path: &str) -> Result<Value, Miss> {
        let segments = parse_path(path)?;
        let first = &segments[0];

        let mut current = self
            .lookup(&first.name)
            .ok_or_else(|| Miss::new(path, format!("no scope holds '{}'", first.name)))?
            .clone();
        current = apply_indexers(current, first, path)?;

        for segment in &segments[1..] {
            current = match current.field(&segment.name) {
                Some(v) => v.clone(),
                None => {
                    return Err(Miss::new(
                        path,
                        format!(
                            "{} has no field '{}'",
                            current.type_name(),
                            segment.name
                        ),
                    ));
                }
            };
            current = apply_indexers(current, segment, path)?;
        }

        Ok(current)
    }
}

fn apply_indexers(mut value: Value, segment: &Segment, path: &str) -> Result<Value, Miss> {
    for idx in &segment.indexers {
        value = if let Ok(position) = idx.parse::<usize>() {
            value
                .index(position)
                .ok_or_else(|| {
                    Miss::new(
                        path,
                        format!("index {position} out of range on {}", value.type_name()),
                    )
                })?
                .clone()
        } else {
            value
                .field(idx)
                .ok_or_else(|| {
                    Miss::new(path, format!("{} has no key '{idx}'", value.type_name()))
                })?
                .clone()
        };
    }
    Ok(value)
}

/// Split a path into segments. Indexer contents are taken verbatim up to
/// the closing bracket, with surrounding quotes stripped.
fn parse_path(path: &str) -> Result<Vec<Segment>, Miss> {
    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();

    loop {
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '.' || c == '[' || c == '(' {
                break;
            }
            name.push(c);
            chars.next();
        }
        if name.is_empty() {
            return Err(Miss::new(path, "empty path segment"));
        }

        let mut indexers = Vec::new();
        while let Some(&open) = chars.peek() {
            let close = match open {
                '[' => ']',
                '(' => ')',
                _ => break,
            };
            chars.next();
            let mut token = String::new();
            loop {
                match chars.next() {
                    Some(c) if c == close => break,
                    Some(c) => token.push(c),
                    None => return Err(Miss::new(path, format!("unclosed '{open}'"))),
                }
            }
            indexers.push(strip_quotes(token.trim()).to_string());
        }

        segments.push(Segment { name, indexers });

        match chars.next() {
            None => break,
            Some('.') => continue,
            Some(c) => {
                return Err(Miss::new(path, format!("unexpected '{c}' in path")));
            }
        }
    }

    Ok(segments)
}

fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'\'' && bytes[s.len() - 1] == b'\'')
            || (bytes[0] == b'"' && bytes[s.len() - 1] == b'"')
        {
            return &s[1..s.len() - 1];
        }
    }
    s
}
