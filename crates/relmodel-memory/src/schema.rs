//! Entity schemas: key layout, constraints and validation rules.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use regex::Regex;

use relmodel_core::{AttributeMap, ValidationError, Value};

/// Thread-safe regex cache for compiled patterns.
///
/// Patterns are compiled lazily on first use and cached for the lifetime
/// of the program.
struct RegexCache {
    cache: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Check if a string matches a regex pattern.
///
/// An invalid pattern is logged and treated as a non-match.
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex_cache().get_or_compile(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "Invalid regex pattern in validation, treating as non-match"
            );
            false
        }
    }
}

/// A validation rule for one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Not NULL and not an empty string.
    Required,
    /// Text at least this many characters long.
    MinLength(usize),
    /// Text at most this many characters long.
    MaxLength(usize),
    /// Text matching a regex.
    Pattern(String),
}

impl Rule {
    /// Check `value`, recording a failure for `field` in `errors`.
    ///
    /// NULL values only fail `Required`; the other rules skip them.
    pub fn check(&self, field: &str, value: &Value, errors: &mut ValidationError) {
        match self {
            Rule::Required => {
                let blank = match value {
                    Value::Null => true,
                    Value::Text(s) => s.trim().is_empty(),
                    _ => false,
                };
                if blank {
                    errors.add_required(field);
                }
            }
            Rule::MinLength(min) => {
                if let Some(text) = value.as_str() {
                    let len = text.chars().count();
                    if len < *min {
                        errors.add_min_length(field, *min, len);
                    }
                }
            }
            Rule::MaxLength(max) => {
                if let Some(text) = value.as_str() {
                    let len = text.chars().count();
                    if len > *max {
                        errors.add_max_length(field, *max, len);
                    }
                }
            }
            Rule::Pattern(pattern) => {
                if let Some(text) = value.as_str() {
                    if !matches_pattern(text, pattern) {
                        errors.add_pattern(field, pattern);
                    }
                }
            }
        }
    }
}

/// Schema of one entity type (table).
#[derive(Debug, Clone)]
pub struct EntitySchema {
    name: String,
    primary_key: Vec<String>,
    auto_increment: Option<String>,
    unique: Vec<Vec<String>>,
    rules: Vec<(String, Rule)>,
    defaults: AttributeMap,
}

impl EntitySchema {
    /// A schema with primary key `id`, auto-incremented.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: vec!["id".to_string()],
            auto_increment: Some("id".to_string()),
            unique: Vec::new(),
            rules: Vec::new(),
            defaults: AttributeMap::new(),
        }
    }

    /// Set the primary key columns. Clears auto-increment unless it is one of them.
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        if let Some(auto) = &self.auto_increment {
            if !self.primary_key.contains(auto) {
                self.auto_increment = None;
            }
        }
        self
    }

    /// Generate values for `column` on insert when it is NULL.
    pub fn auto_increment(mut self, column: impl Into<String>) -> Self {
        self.auto_increment = Some(column.into());
        self
    }

    /// Disable generated keys.
    pub fn no_auto_increment(mut self) -> Self {
        self.auto_increment = None;
        self
    }

    /// Add a uniqueness constraint over `columns` (NULLs never conflict).
    pub fn unique<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique
            .push(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Add a validation rule.
    pub fn rule(mut self, field: impl Into<String>, rule: Rule) -> Self {
        self.rules.push((field.into(), rule));
        self
    }

    /// Default attribute value for new records.
    pub fn default_value(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.defaults.insert(field.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key_columns(&self) -> &[String] {
        &self.primary_key
    }

    pub fn auto_increment_column(&self) -> Option<&str> {
        self.auto_increment.as_deref()
    }

    pub fn unique_constraints(&self) -> &[Vec<String>] {
        &self.unique
    }

    pub fn defaults(&self) -> &AttributeMap {
        &self.defaults
    }

    /// Run every rule against `attributes`.
    pub fn validate(&self, attributes: &AttributeMap, errors: &mut ValidationError) {
        for (field, rule) in &self.rules {
            let value = attributes.get(field).cloned().unwrap_or(Value::Null);
            rule.check(field, &value, errors);
        }
    }
}
