//! Output filter registration.
//!
//! A [`FilterRegistry`] maps filter names to single-argument formatting
//! functions. Templates apply a filter with `{{expr | name}}`; the filter
//! receives the evaluated value and produces the final output string.
//!
//! The host assembles the registry before compiling and may add or replace
//! entries with [`FilterRegistry::register`]. The default registry ships
//! with a `currency` formatter.

use std::collections::HashMap;
use std::fmt;

use crate::value::Value;

/// A named formatting function applied as the last step of expression
/// resolution.
pub type FilterFn = Box<dyn Fn(&Value) -> String + Send + Sync>;

/// Stores registered output filters, keyed by name.
///
/// ```rust
/// use xmlweave::{FilterRegistry, Value};
///
/// let mut filters = FilterRegistry::new();
/// filters.register("upper", |v| v.to_output_string().to_uppercase());
/// assert_eq!(filters.apply("upper", &Value::from("hi")), Some("HI".to_string()));
/// ```
pub struct FilterRegistry {
    filters: HashMap<String, FilterFn>,
}

impl FilterRegistry {
    /// An empty registry with no filters at all.
    pub fn new() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    /// Register a filter. If a filter with the same name already exists,
    /// it is replaced.
    pub fn register<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.filters.insert(name.into(), Box::new(func));
    }

    /// Apply the named filter to a value. Returns `None` if the filter is
    /// not registered; the caller decides whether that is fatal.
    pub fn apply(&self, name: &str, value: &Value) -> Option<String> {
        self.filters.get(name).map(|f| f(value))
    }
}

impl Default for FilterRegistry {
    /// The stock registry: `currency` only.
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("currency", |v| format_currency(v));
        registry
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.filters.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("FilterRegistry").field("filters", &names).finish()
    }
}

/// Format a value as a dollar amount with thousands separators and two
/// decimal places. Non-numeric values format as `$0.00`.
fn format_currency(value: &Value) -> String {
    let amount = match value {
        Value::Number(n) => *n,
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        Value::Bool(_) | Value::Array(_) | Value::Object(_) | Value::Null => 0.0,
    };

    let negative = amount < 0.0;
    let cents = (amount.abs() * 100.0).round() as u64;
    let whole = cents / 100;
    let frac = cents % 100;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    if negative {
        format!("-${grouped}.{frac:02}")
    } else {
        format!("${grouped}.{frac:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_formats_whole_numbers() {
        let filters = FilterRegistry::default();
        assert_eq!(filters.apply("currency", &Value::Number(1000.0)), Some("$1,000.00".into()));
        assert_eq!(filters.apply("currency", &Value::Number(0.0)), Some("$0.00".into()));
    }

    #[test]
    fn currency_rounds_to_cents() {
        let filters = FilterRegistry::default();
        assert_eq!(filters.apply("currency", &Value::Number(1234.5)), Some("$1,234.50".into()));
        assert_eq!(filters.apply("currency", &Value::Number(0.005)), Some("$0.01".into()));
    }

    #[test]
    fn currency_groups_large_amounts() {
        let filters = FilterRegistry::default();
        assert_eq!(
            filters.apply("currency", &Value::Number(1234567.89)),
            Some("$1,234,567.89".into())
        );
    }

    #[test]
    fn currency_handles_negatives_and_strings() {
        let filters = FilterRegistry::default();
        assert_eq!(filters.apply("currency", &Value::Number(-42.5)), Some("-$42.50".into()));
        assert_eq!(filters.apply("currency", &Value::from("19.99")), Some("$19.99".into()));
        assert_eq!(filters.apply("currency", &Value::from("not a number")), Some("$0.00".into()));
    }

    #[test]
    fn unknown_filter_returns_none() {
        let filters = FilterRegistry::default();
        assert_eq!(filters.apply("nope", &Value::Null), None);
    }

    #[test]
    fn host_filters_can_override_defaults() {
        let mut filters = FilterRegistry::default();
        filters.register("currency", |v| format!("EUR {}", v.to_output_string()));
        assert_eq!(filters.apply("currency", &Value::Number(5.0)), Some("EUR 5".into()));
    }
}
