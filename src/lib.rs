//! # xmlweave
//!
//! A template compiler for XML-shaped documents. Templates are ordinary
//! markup with embedded directives: repeater and conditional attributes,
//! `{{...}}` expression sites, and output filters. Compiling a template
//! against a host-supplied data scope produces fully-resolved markup with
//! every directive executed.
//!
//! The crate is split into two layers:
//!
//! - **The tree** (parsing, [`Document`], [`Template`]) is built once per
//!   source and is scope-independent.
//! - **The engine** walks a tree against a [`Compiler`]'s scope, filters,
//!   and options, emitting writer events.
//!
//! ## Quick start
//!
//! ```rust
//! use xmlweave::Compiler;
//!
//! let mut compiler = Compiler::new();
//! compiler.add_to_scope("name", "Ada");
//!
//! let out = compiler.compile_str("<Greeting>Hello, {{name}}!</Greeting>").unwrap();
//! assert_eq!(out, "<Greeting>Hello, Ada!</Greeting>");
//! ```
//!
//! ## Directives
//!
//! A repeater attribute stamps its element once per item, binding the loop
//! variable and the synthetic names `$index`, `$odd`, `$even`, `$parent`:
//!
//! ```rust
//! use xmlweave::Compiler;
//!
//! let compiler = Compiler::new();
//! let out = compiler
//!     .compile_str(r#"<Doc><Item ForEach="n in [1, 2, 3]">{{n}}</Item></Doc>"#)
//!     .unwrap();
//! assert_eq!(out, "<Doc><Item>1</Item><Item>2</Item><Item>3</Item></Doc>");
//! ```
//!
//! A conditional attribute keeps or drops its whole subtree:
//!
//! ```rust
//! use xmlweave::Compiler;
//!
//! let mut compiler = Compiler::new();
//! compiler.add_to_scope("count", 0i64);
//!
//! let out = compiler
//!     .compile_str(r#"<Doc><Warn If="count > 10">too many</Warn></Doc>"#)
//!     .unwrap();
//! assert_eq!(out, "<Doc></Doc>");
//! ```
//!
//! ## Lenient and strict modes
//!
//! By default the compiler absorbs data problems: an expression that
//! cannot be evaluated keeps its original `{{...}}` text, a false-ish or
//! failing condition drops its subtree, and a repeater over a missing
//! source runs zero times. Setting
//! [`CompileOptions::strict`] turns each of these into a [`CompileError`].

pub mod engine;
pub mod error;
pub mod expr;
pub mod filter;
pub mod scope;
pub mod tree;
pub mod value;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use quick_xml::Reader;
use tracing::debug;

pub use engine::{CompileOptions, Directives, MissingValue};
pub use error::{CompileError, CompileErrorKind};
pub use expr::{CompiledExpression, ExprError, Fragment};
pub use filter::{FilterFn, FilterRegistry};
pub use scope::Miss;
pub use tree::{Document, Node, NodeId, NodeKind};
pub use value::Value;

use engine::Engine;
use scope::ScopeStack;

/// A parsed template that can be compiled many times without re-parsing.
///
/// The tree holds raw, unresolved directives and expression sites; it is
/// not bound to any scope. Compile it against different [`Compiler`]s (or
/// the same one with a changed scope) to produce different outputs.
///
/// ```rust
/// use xmlweave::{Compiler, Template};
///
/// let template = Template::parse_str("<Hi>{{name}}</Hi>").unwrap();
/// let mut compiler = Compiler::new();
///
/// compiler.add_to_scope("name", "Ada");
/// assert_eq!(compiler.compile(&template).unwrap(), "<Hi>Ada</Hi>");
///
/// compiler.add_to_scope("name", "Grace");
/// assert_eq!(compiler.compile(&template).unwrap(), "<Hi>Grace</Hi>");
/// ```
#[derive(Debug, Clone)]
pub struct Template {
    doc: Document,
}

impl Template {
    /// Parse a template from a string. The source may be a full document
    /// or a fragment with top-level text and multiple roots.
    pub fn parse_str(source: &str) -> Result<Self, CompileError> {
        Self::parse_reader(source.as_bytes())
    }

    /// Parse a template from any buffered reader.
    pub fn parse_reader<R: BufRead>(reader: R) -> Result<Self, CompileError> {
        let doc = Document::from_reader(Reader::from_reader(reader))?;
        Ok(Self { doc })
    }

    /// Parse a template from a file on disk.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self, CompileError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| CompileError::io(&format!("opening {}", path.display()), e))?;
        Self::parse_reader(BufReader::new(file))
    }

    /// The underlying document tree, for inspection.
    pub fn document(&self) -> &Document {
        &self.doc
    }
}

/// The compiler: a data scope, a filter registry, directive names, and
/// compile options, applied to templates.
///
/// Assemble the scope and filters first, then compile. A `Compiler` can
/// be reused across many templates and compile calls; nothing in a
/// compile mutates it.
#[derive(Debug, Default)]
pub struct Compiler {
    scope: HashMap<String, Value>,
    filters: FilterRegistry,
    directives: Directives,
    options: CompileOptions,
}

impl Compiler {
    /// A compiler with an empty scope, the stock filter registry, and
    /// default directive names (`ForEach`, `If`, `Template`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole root scope.
    pub fn set_scope(&mut self, scope: HashMap<String, Value>) {
        self.scope = scope;
    }

    /// Bind one name in the root scope, replacing any previous binding.
    pub fn add_to_scope(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.scope.insert(name.into(), value.into());
    }

    /// Register an output filter, replacing any previous filter with the
    /// same name.
    pub fn register_filter<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.filters.register(name, func);
    }

    /// The directive names this compiler recognizes. Rename them here if
    /// the template vocabulary already uses the defaults.
    pub fn directives_mut(&mut self) -> &mut Directives {
        &mut self.directives
    }

    pub fn options_mut(&mut self) -> &mut CompileOptions {
        &mut self.options
    }

    /// Compile a pre-parsed [`Template`] to a string.
    pub fn compile(&self, template: &Template) -> Result<String, CompileError> {
        let mut out = Vec::new();
        self.compile_to(template, &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Compile a pre-parsed [`Template`], writing output to `out`.
    pub fn compile_to<W: Write>(&self, template: &Template, out: W) -> Result<(), CompileError> {
        debug!(strict = self.options.strict, "compiling template");
        let mut engine = Engine::new(&template.doc, &self.directives, &self.options, &self.filters);
        engine.run(template.doc.root(), &self.scope, out)
    }

    /// Compile only the subtree rooted at `node`, found by navigating
    /// [`Template::document`]. Directives on the node itself still apply.
    pub fn compile_node(&self, template: &Template, node: NodeId) -> Result<String, CompileError> {
        let mut out = Vec::new();
        let mut engine = Engine::new(&template.doc, &self.directives, &self.options, &self.filters);
        engine.run(node, &self.scope, &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Parse and compile a string in one step.
    ///
    /// The source is wrapped in a passthrough element before parsing, so
    /// fragments without a single root compile cleanly; the wrapper never
    /// reaches the output.
    pub fn compile_str(&self, source: &str) -> Result<String, CompileError> {
        let wrapped = format!(
            "<{name}>{source}</{name}>",
            name = self.directives.passthrough
        );
        let template = Template::parse_str(&wrapped)?;
        self.compile(&template)
    }

    /// Parse and compile from a buffered reader in one step.
    pub fn compile_reader<R: BufRead>(&self, reader: R) -> Result<String, CompileError> {
        let template = Template::parse_reader(reader)?;
        self.compile(&template)
    }

    /// Parse and compile a file in one step.
    pub fn compile_file(&self, path: impl AsRef<Path>) -> Result<String, CompileError> {
        let template = Template::parse_file(path)?;
        self.compile(&template)
    }

    /// Resolve a single expression string against this compiler's scope,
    /// without any surrounding markup. Useful for hosts that reuse the
    /// expression language for configuration values.
    pub fn eval_expression(&self, source: &str) -> Result<Value, CompileError> {
        let compiled = CompiledExpression::new(source);
        let scopes = ScopeStack::new(&self.scope);

        let mut params = Vec::with_capacity(compiled.paths().len());
        for path in compiled.paths() {
            match scopes.resolve_path(path) {
                Ok(v) => params.push(v),
                Err(miss) => {
                    if self.options.strict {
                        return Err(CompileError::unresolved(&miss.path, &miss.reason));
                    }
                    params.push(self.options.missing.value());
                }
            }
        }

        compiled
            .eval_with_params(params)
            .map_err(|e| CompileError::expression(source, e))
    }
}
