//! Document rules checked before every commit.
//!
//! A [`StateValidator`] holds named [`ValidationRule`]s. The store runs them
//! against the would-be document while it holds the write lock, so a rule
//! must not call back into the store.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::error::{Result, SyncError};
use crate::value::{Path, Value};

/// One rule violation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
    /// Machine-readable code, e.g. `REQUIRED_FIELD_MISSING`
    pub code: String,
}

impl ValidationIssue {
    pub fn new(
        path: impl Into<String>,
        message: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            code: code.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.path, self.message, self.code)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub rules_checked: usize,
    pub timestamp: DateTime<Utc>,
}

pub trait ValidationRule: Send + Sync {
    /// Unique name within a validator
    fn id(&self) -> &str;

    fn description(&self) -> String;

    fn validate(&self, document: &Value) -> Vec<ValidationIssue>;
}

/// Every listed path must exist
pub struct RequiredFields {
    paths: Vec<Path>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths = fields
            .into_iter()
            .map(|field| Path::parse(field.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { paths })
    }
}

impl ValidationRule for RequiredFields {
    fn id(&self) -> &str {
        "required-fields"
    }

    fn description(&self) -> String {
        format!("requires {} fields to exist", self.paths.len())
    }

    fn validate(&self, document: &Value) -> Vec<ValidationIssue> {
        self.paths
            .iter()
            .filter(|path| document.pointer(path).is_none())
            .map(|path| {
                ValidationIssue::new(
                    path.to_string(),
                    "required field missing",
                    "REQUIRED_FIELD_MISSING",
                )
            })
            .collect()
    }
}

/// Limits nesting. Members of the root object sit at depth 1.
pub struct MaxDepth {
    max_depth: usize,
}

impl MaxDepth {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    fn check(&self, value: &Value, path: &Path, depth: usize, issues: &mut Vec<ValidationIssue>) {
        if depth > self.max_depth {
            issues.push(ValidationIssue::new(
                path.to_string(),
                format!("nesting depth {} exceeds maximum {}", depth, self.max_depth),
                "MAX_DEPTH_EXCEEDED",
            ));
            return;
        }
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    self.check(child, &path.child(key.as_str()), depth + 1, issues);
                }
            }
            Value::Array(items) => {
                for (idx, child) in items.iter().enumerate() {
                    self.check(child, &path.child(idx.to_string()), depth + 1, issues);
                }
            }
            _ => {}
        }
    }
}

impl ValidationRule for MaxDepth {
    fn id(&self) -> &str {
        "max-depth"
    }

    fn description(&self) -> String {
        format!("limits nesting to {} levels", self.max_depth)
    }

    fn validate(&self, document: &Value) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        self.check(document, &Path::root(), 0, &mut issues);
        issues
    }
}

/// A rule backed by a closure
pub struct FnRule<F> {
    id: String,
    description: String,
    check: F,
}

impl<F> FnRule<F>
where
    F: Fn(&Value) -> Vec<ValidationIssue> + Send + Sync,
{
    pub fn new(id: impl Into<String>, description: impl Into<String>, check: F) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            check,
        }
    }
}

impl<F> ValidationRule for FnRule<F>
where
    F: Fn(&Value) -> Vec<ValidationIssue> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn validate(&self, document: &Value) -> Vec<ValidationIssue> {
        (self.check)(document)
    }
}

/// Ordered set of rules; an empty validator accepts everything
#[derive(Default)]
pub struct StateValidator {
    rules: IndexMap<String, Box<dyn ValidationRule>>,
}

impl StateValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: impl ValidationRule + 'static) -> Result<()> {
        let id = rule.id().to_string();
        if id.is_empty() {
            return Err(SyncError::validation("rule id cannot be empty"));
        }
        if self.rules.contains_key(&id) {
            return Err(SyncError::validation(format!("rule {} is already registered", id)));
        }
        log::debug!("Added validation rule {}: {}", id, rule.description());
        self.rules.insert(id, Box::new(rule));
        Ok(())
    }

    pub fn remove_rule(&mut self, id: &str) -> bool {
        self.rules.shift_remove(id).is_some()
    }

    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn issues(&self, document: &Value) -> Vec<ValidationIssue> {
        self.rules
            .values()
            .flat_map(|rule| rule.validate(document))
            .collect()
    }

    pub fn validate(&self, document: &Value) -> ValidationReport {
        let issues = self.issues(document);
        ValidationReport {
            valid: issues.is_empty(),
            issues,
            rules_checked: self.rules.len(),
            timestamp: Utc::now(),
        }
    }

    /// `ValidationError` listing every issue, if there are any
    pub fn check(&self, document: &Value) -> Result<()> {
        let issues = self.issues(document);
        if issues.is_empty() {
            return Ok(());
        }
        let listed: Vec<String> = issues.iter().map(ToString::to_string).collect();
        Err(SyncError::validation(format!(
            "document rejected: {}",
            listed.join("; ")
        )))
    }
}
