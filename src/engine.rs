//! Execution engine: walks the document tree against a scope and emits
//! resolved writer events.
//!
//! The walk is depth-first. Repeater directives push a derived scope frame
//! per iteration and re-walk the subtree; conditional directives prune the
//! subtree; everything else passes through with `{{...}}` sites injected.
//! The tree itself is never mutated, so one parsed template can be run
//! against many scopes.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::rc::Rc;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::{debug, trace};

use crate::error::CompileError;
use crate::expr::CompiledExpression;
use crate::filter::FilterRegistry;
use crate::scope::ScopeStack;
use crate::tree::{Document, NodeId, NodeKind};
use crate::value::Value;

/// The attribute and element names the engine treats as directives.
///
/// Hosts that need templates to coexist with markup vocabularies already
/// using these names can rename any of them before compiling.
#[derive(Debug, Clone)]
pub struct Directives {
    /// Repeater attribute. Value grammar: `varName in source`.
    pub repeat_key: String,
    /// Conditional attribute. Value: an expression coerced to a boolean.
    pub if_key: String,
    /// Wrapper element emitted as its children only, with no tag of its
    /// own. Also used internally to compile string fragments.
    pub passthrough: String,
}

impl Default for Directives {
    fn default() -> Self {
        Self {
            repeat_key: "ForEach".to_string(),
            if_key: "If".to_string(),
            passthrough: "Template".to_string(),
        }
    }
}

/// What an unresolved scope path substitutes in lenient mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingValue {
    /// Substitute boolean `false`, which also renders as `false` when it
    /// reaches output on its own.
    #[default]
    False,
    /// Substitute an empty string.
    Empty,
}

impl MissingValue {
    pub(crate) fn value(self) -> Value {
        match self {
            MissingValue::False => Value::Bool(false),
            MissingValue::Empty => Value::String(String::new()),
        }
    }
}

/// Knobs for one compile run.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// In strict mode, unresolved paths, rejected expressions, unknown
    /// filters, and non-iterable repeater sources abort the compile.
    /// Lenient mode (the default) absorbs them: conditions fail closed,
    /// repeaters run zero times, and injection sites keep their original
    /// `{{...}}` text.
    pub strict: bool,
    /// Lenient-mode substitute for an unresolved path.
    pub missing: MissingValue,
    /// Pretty-print with this many spaces per level. `None` writes
    /// compact output.
    pub indent: Option<usize>,
    /// Emit a leading `<?xml version="1.0" encoding="UTF-8"?>`.
    pub xml_declaration: bool,
}

pub(crate) struct Engine<'a> {
    doc: &'a Document,
    directives: &'a Directives,
    options: &'a CompileOptions,
    filters: &'a FilterRegistry,
    /// One compiled decomposition per distinct expression source, shared
    /// across repeater iterations.
    cache: HashMap<String, Rc<CompiledExpression>>,
}

impl<'a> Engine<'a> {
    pub fn new(
        doc: &'a Document,
        directives: &'a Directives,
        options: &'a CompileOptions,
        filters: &'a FilterRegistry,
    ) -> Self {
        Self {
            doc,
            directives,
            options,
            filters,
            cache: HashMap::new(),
        }
    }

    /// Walk the subtree rooted at `start` against `root_scope`, writing
    /// resolved events to `out`. Passing the document root compiles the
    /// whole template.
    pub fn run<W: Write>(
        &mut self,
        start: NodeId,
        root_scope: &HashMap<String, Value>,
        out: W,
    ) -> Result<(), CompileError> {
        let mut writer = match self.options.indent {
            Some(width) => Writer::new_with_indent(out, b' ', width),
            None => Writer::new(out),
        };

        if self.options.xml_declaration {
            writer
                .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
                .map_err(|e| CompileError::io("writing declaration", e))?;
        }

        let mut scopes = ScopeStack::new(root_scope);
        self.walk(start, &mut scopes, &mut writer)
    }

    fn walk<W: Write>(
        &mut self,
        id: NodeId,
        scopes: &mut ScopeStack<'_>,
        writer: &mut Writer<W>,
    ) -> Result<(), CompileError> {
        let node = self.doc.node(id);
        match node.kind {
            NodeKind::Document => {
                for &child in &node.children {
                    self.walk(child, scopes, writer)?;
                }
                Ok(())
            }
            NodeKind::Text => {
                let resolved = self.inject(&node.value, scopes)?;
                if !resolved.is_empty() {
                    writer
                        .write_event(Event::Text(BytesText::new(&resolved)))
                        .map_err(|e| CompileError::io("writing text", e))?;
                }
                Ok(())
            }
            NodeKind::Element => self.walk_element(id, scopes, writer),
        }
    }

    fn walk_element<W: Write>(
        &mut self,
        id: NodeId,
        scopes: &mut ScopeStack<'_>,
        writer: &mut Writer<W>,
    ) -> Result<(), CompileError> {
        let node = self.doc.node(id);
        trace!(element = %node.name, "walking element");

        // Repeat first: the condition and body see each iteration's frame.
        if let Some(raw) = node.attr(&self.directives.repeat_key) {
            return self.repeat(id, raw, scopes, writer);
        }

        if let Some(raw) = node.attr(&self.directives.if_key) {
            if !self.condition(raw, scopes)? {
                return Ok(());
            }
        }

        if node.name == self.directives.passthrough {
            for &child in &node.children {
                self.walk(child, scopes, writer)?;
            }
            return Ok(());
        }

        self.emit_element(id, scopes, writer)
    }

    /// Run one repeater directive: bind the loop variable plus the
    /// synthetic names and re-walk the element once per item.
    fn repeat<W: Write>(
        &mut self,
        id: NodeId,
        raw: &str,
        scopes: &mut ScopeStack<'_>,
        writer: &mut Writer<W>,
    ) -> Result<(), CompileError> {
        let (var, source) = parse_repeat(raw)?;
        let items = self.repeat_items(&source, scopes)?;
        if items.is_empty() {
            return Ok(());
        }

        // The enclosing bindings, frozen before any iteration frame is
        // pushed, reachable inside as `$parent`.
        let parent = Value::Object(scopes.snapshot());

        for (index, item) in items.into_iter().enumerate() {
            let mut frame = HashMap::new();
            frame.insert(var.clone(), item);
            frame.insert("$index".to_string(), Value::Number(index as f64));
            frame.insert("$odd".to_string(), Value::Bool(index % 2 == 1));
            frame.insert("$even".to_string(), Value::Bool(index % 2 == 0));
            frame.insert("$parent".to_string(), parent.clone());

            scopes.push(frame);
            let result = self.repeat_body(id, scopes, writer);
            scopes.pop();
            result?;
        }
        Ok(())
    }

    /// One iteration of a repeated element: same as [`walk_element`] with
    /// the repeat attribute already consumed.
    fn repeat_body<W: Write>(
        &mut self,
        id: NodeId,
        scopes: &mut ScopeStack<'_>,
        writer: &mut Writer<W>,
    ) -> Result<(), CompileError> {
        let node = self.doc.node(id);

        if let Some(raw) = node.attr(&self.directives.if_key) {
            if !self.condition(raw, scopes)? {
                return Ok(());
            }
        }

        if node.name == self.directives.passthrough {
            for &child in &node.children {
                self.walk(child, scopes, writer)?;
            }
            return Ok(());
        }

        self.emit_element(id, scopes, writer)
    }

    /// Resolve a repeater source to its items.
    ///
    /// A bracketed source is an inline literal list; anything else is a
    /// scope path that must resolve to an array.
    fn repeat_items(
        &mut self,
        source: &str,
        scopes: &ScopeStack<'_>,
    ) -> Result<Vec<Value>, CompileError> {
        let source = source.trim();

        if let Some(inner) = source.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            return Ok(parse_literal_list(inner));
        }

        match scopes.resolve_path(source) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(other) => {
                if self.options.strict {
                    Err(CompileError::not_iterable(source, other.type_name()))
                } else {
                    debug!(path = source, got = other.type_name(), "repeater source is not an array");
                    Ok(Vec::new())
                }
            }
            Err(miss) => {
                if self.options.strict {
                    Err(CompileError::unresolved(&miss.path, &miss.reason))
                } else {
                    debug!(%miss, "repeater source did not resolve");
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Evaluate a conditional attribute down to a boolean.
    ///
    /// Booleans pass through, the strings `true`/`false` parse, and
    /// numbers test non-zero. Anything else fails closed, as does any
    /// evaluation failure in lenient mode.
    fn condition(&mut self, raw: &str, scopes: &ScopeStack<'_>) -> Result<bool, CompileError> {
        // An empty condition value includes, same as an absent attribute.
        if raw.trim().is_empty() {
            return Ok(true);
        }

        let compiled = self.compiled(raw);

        let mut params = Vec::with_capacity(compiled.paths().len());
        for path in compiled.paths() {
            match scopes.resolve_path(path) {
                Ok(v) => params.push(v),
                Err(miss) => {
                    if self.options.strict {
                        return Err(CompileError::unresolved(&miss.path, &miss.reason));
                    }
                    debug!(%miss, "condition path did not resolve");
                    params.push(self.options.missing.value());
                }
            }
        }

        match compiled.eval_with_params(params) {
            Ok(Value::Bool(b)) => Ok(b),
            Ok(Value::String(s)) => Ok(s.trim().eq_ignore_ascii_case("true")),
            Ok(Value::Number(n)) => Ok(n != 0.0),
            Ok(other) => {
                debug!(condition = raw, got = other.type_name(), "condition is not boolean");
                Ok(false)
            }
            Err(e) => {
                if self.options.strict {
                    Err(CompileError::expression(raw, e))
                } else {
                    debug!(condition = raw, error = %e, "condition failed to evaluate");
                    Ok(false)
                }
            }
        }
    }

    /// Emit one element with its attributes injected, then its subtree.
    fn emit_element<W: Write>(
        &mut self,
        id: NodeId,
        scopes: &mut ScopeStack<'_>,
        writer: &mut Writer<W>,
    ) -> Result<(), CompileError> {
        let node = self.doc.node(id);

        let mut attributes = Vec::new();
        for (key, value) in &node.attributes {
            if key == &self.directives.repeat_key || key == &self.directives.if_key {
                continue;
            }
            attributes.push((key.as_str(), self.inject(value, scopes)?));
        }

        let mut start = BytesStart::new(node.name.as_str());
        for (key, value) in &attributes {
            start.push_attribute((*key, value.as_str()));
        }

        if node.children.is_empty() && node.self_closing {
            return writer
                .write_event(Event::Empty(start))
                .map_err(|e| CompileError::io("writing element", e));
        }

        writer
            .write_event(Event::Start(start))
            .map_err(|e| CompileError::io("writing element", e))?;

        for &child in &node.children {
            self.walk(child, scopes, writer)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new(node.name.as_str())))
            .map_err(|e| CompileError::io("writing element", e))
    }

    /// Replace every `{{...}}` site in `text` with its resolved value.
    ///
    /// In lenient mode a site whose expression cannot be evaluated, or
    /// whose filter is unknown, keeps its original text unchanged.
    fn inject(&mut self, text: &str, scopes: &ScopeStack<'_>) -> Result<String, CompileError> {
        if !text.contains("{{") {
            return Ok(text.to_string());
        }

        let mut resolved = text.to_string();
        let mut seen = HashSet::new();

        let mut rest = text;
        while let Some(open) = rest.find("{{") {
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                break;
            };
            let inner = &after[..close];
            let token = &rest[open..open + 2 + close + 2];
            rest = &after[close + 2..];

            if !seen.insert(token.to_string()) {
                continue;
            }

            if let Some(output) = self.resolve_site(inner, scopes)? {
                resolved = resolved.replace(token, &output);
            }
        }

        Ok(resolved)
    }

    /// Resolve one expression site to output text. `Ok(None)` means leave
    /// the site verbatim (lenient-mode absorption).
    fn resolve_site(
        &mut self,
        inner: &str,
        scopes: &ScopeStack<'_>,
    ) -> Result<Option<String>, CompileError> {
        let compiled = self.compiled(inner);

        let mut params = Vec::with_capacity(compiled.paths().len());
        for path in compiled.paths() {
            match scopes.resolve_path(path) {
                Ok(v) => params.push(v),
                Err(miss) => {
                    if self.options.strict {
                        return Err(CompileError::unresolved(&miss.path, &miss.reason));
                    }
                    debug!(%miss, "expression path did not resolve");
                    params.push(self.options.missing.value());
                }
            }
        }

        let value = match compiled.eval_with_params(params) {
            Ok(v) => v,
            Err(e) => {
                if self.options.strict {
                    return Err(CompileError::expression(inner, e));
                }
                debug!(expression = inner, error = %e, "expression failed to evaluate");
                return Ok(None);
            }
        };

        match compiled.filter() {
            None => Ok(Some(value.to_output_string())),
            Some(name) => match self.filters.apply(name, &value) {
                Some(formatted) => Ok(Some(formatted)),
                None => {
                    if self.options.strict {
                        Err(CompileError::unknown_filter(name))
                    } else {
                        debug!(filter = name, "no such filter, leaving site verbatim");
                        Ok(None)
                    }
                }
            },
        }
    }

    fn compiled(&mut self, source: &str) -> Rc<CompiledExpression> {
        if let Some(compiled) = self.cache.get(source) {
            return Rc::clone(compiled);
        }
        let compiled = Rc::new(CompiledExpression::new(source));
        self.cache.insert(source.to_string(), Rc::clone(&compiled));
        compiled
    }
}

/// Parse a repeater directive value into `(variable, source)`.
///
/// The grammar is `varName in source`, with any whitespace around the
/// `in` keyword; the variable must be an identifier. A malformed
/// directive is always fatal, even in lenient mode.
fn parse_repeat(raw: &str) -> Result<(String, String), CompileError> {
    let trimmed = raw.trim();
    let Some((var, rest)) = trimmed.split_once(char::is_whitespace) else {
        return Err(CompileError::directive_format(raw));
    };

    let source = match rest.trim_start().strip_prefix("in") {
        Some(s) if s.starts_with(char::is_whitespace) => s.trim_start(),
        _ => return Err(CompileError::directive_format(raw)),
    };

    let valid_var = !var.is_empty()
        && var.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_var || source.is_empty() {
        return Err(CompileError::directive_format(raw));
    }

    Ok((var.to_string(), source.to_string()))
}

/// Items of an inline `[a, b, c]` repeater source. Each comma-separated
/// token is typed: quoted strings, numbers, booleans, bare text. Commas
/// inside a quoted item do not separate items.
fn parse_literal_list(inner: &str) -> Vec<Value> {
    if inner.trim().is_empty() {
        return Vec::new();
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in inner.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                ',' => tokens.push(std::mem::take(&mut current)),
                _ => current.push(c),
            },
        }
    }
    tokens.push(current);

    tokens
        .iter()
        .map(|token| {
            let token = token.trim();
            if token.len() >= 2
                && ((token.starts_with('\'') && token.ends_with('\''))
                    || (token.starts_with('"') && token.ends_with('"')))
            {
                return Value::String(token[1..token.len() - 1].to_string());
            }
            if let Ok(n) = token.parse::<f64>() {
                return Value::Number(n);
            }
            match token {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(token.to_string()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_directive_parses() {
        assert_eq!(
            parse_repeat("item in products").unwrap(),
            ("item".to_string(), "products".to_string())
        );
        assert_eq!(
            parse_repeat("  n in [1, 2, 3]  ").unwrap(),
            ("n".to_string(), "[1, 2, 3]".to_string())
        );
    }

    #[test]
    fn repeat_directive_accepts_any_whitespace_around_in() {
        assert_eq!(
            parse_repeat("n\tin\t[1, 2]").unwrap(),
            ("n".to_string(), "[1, 2]".to_string())
        );
        assert_eq!(
            parse_repeat("item\n  in\n  products").unwrap(),
            ("item".to_string(), "products".to_string())
        );
    }

    #[test]
    fn repeat_directive_rejects_bad_grammar() {
        assert!(parse_repeat("products").is_err());
        assert!(parse_repeat("in products").is_err());
        assert!(parse_repeat("1item in products").is_err());
        assert!(parse_repeat("item in ").is_err());
    }

    #[test]
    fn literal_lists_are_typed() {
        assert_eq!(
            parse_literal_list("1, 'two', true, four"),
            vec![
                Value::Number(1.0),
                Value::String("two".into()),
                Value::Bool(true),
                Value::String("four".into()),
            ]
        );
        assert_eq!(parse_literal_list("  "), Vec::<Value>::new());
    }

    #[test]
    fn literal_lists_keep_commas_inside_quotes() {
        assert_eq!(
            parse_literal_list("'a,b', 'c'"),
            vec![Value::String("a,b".into()), Value::String("c".into())]
        );
        assert_eq!(
            parse_literal_list(r#""x, y", 1"#),
            vec![Value::String("x, y".into()), Value::Number(1.0)]
        );
    }
}
