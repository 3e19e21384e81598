//! Expression sites: tokenizing `{{...}}` contents into fragments.
//!
//! A raw expression string is decomposed exactly once into an ordered list
//! of [`Fragment`]s — scope references and literal runs — plus an optional
//! trailing filter name. The decomposition is scope-independent: the
//! engine caches one [`CompiledExpression`] per distinct source string and
//! re-resolves only the scope references on each repeater iteration.
//!
//! Evaluation replaces each scope reference with a positional placeholder
//! (`p0`, `p1`, ...) and hands the substituted string plus the resolved
//! parameter table to the generic evaluator in [`eval`].

pub mod eval;

use std::collections::HashMap;

pub use eval::{evaluate, ExprError};

use crate::value::Value;

/// One piece of a decomposed expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// A scope path, resolved against the scope chain at evaluation time.
    FromScope(String),
    /// Literal text copied into the substituted expression. `quoted`
    /// records whether the run came from a single-quoted string, so it
    /// can be re-quoted for the evaluator.
    Literal { text: String, quoted: bool },
}

/// Tokenizer states. `Filter` consumes the remainder of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unknown,
    VariableName,
    QuotedString,
    Constant,
}

/// A cached, parsed decomposition of one expression site.
///
/// Built once per distinct source string; the fragment structure, the
/// substituted expression, and its AST never change between evaluations.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    fragments: Vec<Fragment>,
    filter: Option<String>,
    /// Scope paths in placeholder order: path `i` binds parameter `p{i}`.
    paths: Vec<String>,
    substituted: String,
    /// `Ok(None)` when the substituted expression is blank.
    ast: Result<Option<eval::Expr>, ExprError>,
}

impl CompiledExpression {
    pub fn new(source: &str) -> Self {
        let (fragments, filter) = tokenize(source);

        let mut substituted = String::new();
        let mut paths = Vec::new();
        for fragment in &fragments {
            match fragment {
                Fragment::FromScope(path) => {
                    substituted.push_str(&format!("p{}", paths.len()));
                    paths.push(path.clone());
                }
                Fragment::Literal { text, quoted: true } => {
                    substituted.push('\'');
                    substituted.push_str(text);
                    substituted.push('\'');
                }
                Fragment::Literal {
                    text,
                    quoted: false,
                } => substituted.push_str(text),
            }
        }

        let ast = if substituted.trim().is_empty() {
            Ok(None)
        } else {
            eval::parse(&substituted).map(Some)
        };

        Self {
            fragments,
            filter,
            paths,
            substituted,
            ast,
        }
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// The scope paths this expression references, in placeholder order.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub(crate) fn substituted(&self) -> &str {
        &self.substituted
    }

    /// Evaluate with one resolved value per entry in [`paths`](Self::paths).
    ///
    /// A blank expression evaluates to an empty string. Filter application
    /// is the caller's job — this returns the raw evaluator result.
    pub fn eval_with_params(&self, values: Vec<Value>) -> Result<Value, ExprError> {
        let ast = match &self.ast {
            Ok(Some(ast)) => ast,
            Ok(None) => return Ok(Value::String(String::new())),
            Err(e) => return Err(e.clone()),
        };

        debug_assert_eq!(values.len(), self.paths.len());
        let params: HashMap<String, Value> = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (format!("p{i}"), v))
            .collect();

        eval::eval(ast, &params)
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_name_content(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, '_' | '$' | '.' | '[' | ']' | '(' | ')')
}

/// Character-class state machine over the four lecture states.
///
/// Returns the fragment list and the trailing filter name, if any.
fn tokenize(source: &str) -> (Vec<Fragment>, Option<String>) {
    let mut fragments = Vec::new();
    let mut filter = None;

    let mut state = State::Unknown;
    let mut run = String::new();
    // Open bracket/paren depth inside a variable run: indexer contents
    // (quoted keys included) stay part of the path.
    let mut indexer_depth = 0usize;

    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        match state {
            State::VariableName => {
                if c == '[' || c == '(' {
                    indexer_depth += 1;
                } else if (c == ']' || c == ')') && indexer_depth > 0 {
                    indexer_depth -= 1;
                }

                if is_name_content(c) || indexer_depth > 0 {
                    run.push(c);
                    i += 1;
                    continue;
                }
                fragments.push(Fragment::FromScope(std::mem::take(&mut run)));
                state = State::Unknown;
                // fall through: re-dispatch c below
            }
            State::QuotedString => {
                if c == '\'' {
                    fragments.push(Fragment::Literal {
                        text: std::mem::take(&mut run),
                        quoted: true,
                    });
                    state = State::Unknown;
                    i += 1; // closing quote is consumed
                } else {
                    run.push(c);
                    i += 1;
                }
                continue;
            }
            State::Constant => {
                if is_name_start(c) || c == '\'' || c == '|' {
                    fragments.push(Fragment::Literal {
                        text: std::mem::take(&mut run),
                        quoted: false,
                    });
                    state = State::Unknown;
                    // fall through: re-dispatch c below
                } else {
                    run.push(c);
                    i += 1;
                    continue;
                }
            }
            State::Unknown => {}
        }

        // State::Unknown dispatch
        if is_name_start(c) {
            state = State::VariableName;
            indexer_depth = 0;
            run.push(c);
            i += 1;
        } else if c == '\'' {
            state = State::QuotedString;
            i += 1;
        } else if c == '|' {
            // Everything after the separator is the filter name.
            filter = Some(chars[i + 1..].iter().collect::<String>().trim().to_string());
            return (fragments, filter.filter(|f| !f.is_empty()));
        } else {
            state = State::Constant;
            run.push(c);
            i += 1;
        }
    }

    // Flush whatever run is still open.
    if !run.is_empty() {
        match state {
            State::VariableName => fragments.push(Fragment::FromScope(run)),
            State::QuotedString => fragments.push(Fragment::Literal {
                text: run,
                quoted: true,
            }),
            _ => fragments.push(Fragment::Literal {
                text: run,
                quoted: false,
            }),
        }
    }

    (fragments, filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(path: &str) -> Fragment {
        Fragment::FromScope(path.to_string())
    }

    fn raw(text: &str) -> Fragment {
        Fragment::Literal {
            text: text.to_string(),
            quoted: false,
        }
    }

    fn quoted(text: &str) -> Fragment {
        Fragment::Literal {
            text: text.to_string(),
            quoted: true,
        }
    }

    #[test]
    fn variable_plus_constant() {
        let (frags, filter) = tokenize("a + 1");
        assert_eq!(frags, vec![scope("a"), raw(" + 1")]);
        assert_eq!(filter, None);
    }

    #[test]
    fn quoted_string_is_one_literal() {
        let (frags, _) = tokenize("'hi ' + name");
        assert_eq!(frags, vec![quoted("hi "), raw(" + "), scope("name")]);
    }

    #[test]
    fn dotted_and_indexed_paths_stay_whole() {
        let (frags, _) = tokenize("person.name");
        assert_eq!(frags, vec![scope("person.name")]);

        let (frags, _) = tokenize("items[2] + 1");
        assert_eq!(frags, vec![scope("items[2]"), raw(" + 1")]);

        let (frags, _) = tokenize("table('key')");
        assert_eq!(frags, vec![scope("table('key')")]);
    }

    #[test]
    fn synthetic_names_are_scope_references() {
        let (frags, _) = tokenize("$index + 1");
        assert_eq!(frags, vec![scope("$index"), raw(" + 1")]);
    }

    #[test]
    fn filter_separator_ends_fragments() {
        let (frags, filter) = tokenize("price | currency");
        assert_eq!(frags, vec![scope("price"), raw(" ")]);
        assert_eq!(filter.as_deref(), Some("currency"));
    }

    #[test]
    fn pipe_inside_quotes_is_literal() {
        let (frags, filter) = tokenize("'a|b'");
        assert_eq!(frags, vec![quoted("a|b")]);
        assert_eq!(filter, None);
    }

    #[test]
    fn pure_constant_run() {
        let (frags, _) = tokenize("1 + 2");
        assert_eq!(frags, vec![raw("1 + 2")]);
    }

    #[test]
    fn substitution_assigns_positional_placeholders() {
        let compiled = CompiledExpression::new("a + b + 'x'");
        assert_eq!(compiled.paths(), &["a".to_string(), "b".to_string()]);
        assert_eq!(compiled.substituted(), "p0 + p1 + 'x'");
    }

    #[test]
    fn eval_with_params_resolves_placeholders() {
        let compiled = CompiledExpression::new("n + 1");
        let result = compiled
            .eval_with_params(vec![Value::Number(41.0)])
            .unwrap();
        assert_eq!(result, Value::Number(42.0));
    }

    #[test]
    fn repeated_evaluation_reuses_structure() {
        let compiled = CompiledExpression::new("n * 2");
        for n in 0..4 {
            let result = compiled
                .eval_with_params(vec![Value::Number(f64::from(n))])
                .unwrap();
            assert_eq!(result, Value::Number(f64::from(n) * 2.0));
        }
    }

    #[test]
    fn blank_expression_renders_empty() {
        let compiled = CompiledExpression::new("   ");
        assert_eq!(
            compiled.eval_with_params(vec![]).unwrap(),
            Value::String(String::new())
        );
    }

    #[test]
    fn unterminated_quote_flushes_as_literal() {
        let (frags, _) = tokenize("'open");
        assert_eq!(frags, vec![quoted("open")]);
    }

    #[test]
    fn filter_name_is_trimmed() {
        let compiled = CompiledExpression::new("x |  currency  ");
        assert_eq!(compiled.filter(), Some("currency"));
    }
}
