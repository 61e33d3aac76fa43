//! Input validation for GraphQL mutations.
//!
//! Collects field-attributed errors while pulling typed values out of an
//! input map, so a resolver can report every problem with a request at once
//! instead of stopping at the first.
//!
//! ```
//! use quay_graphql::valid::Validation;
//!
//! let input = serde_json::json!({"username": "jdoe"});
//! let mut valid = Validation::new().with_input(input.as_object().unwrap().clone());
//! valid.optional_string("username", |valid, name| {
//!     valid
//!         .expect(name.len() >= 2, "Username too short")
//!         .with_field("username");
//! });
//! assert!(valid.ok());
//! ```

use serde_json::{Map, Value};

use crate::error::GqlError;

/// A validation pass over one input map.
#[derive(Debug, Default)]
pub struct Validation {
    input: Option<Map<String, Value>>,
    errors: Vec<GqlError>,
}

/// Handle onto the outcome of one assertion, for attaching a field name or
/// chaining further assertions. Chained assertions short-circuit: once one
/// fails, the rest are not evaluated.
pub struct Assertion<'a> {
    valid: &'a mut Validation,
    err: Option<usize>,
}

impl Validation {
    /// Create a new validation pass.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the input map to validate fields against.
    #[must_use]
    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input = Some(input);
        self
    }

    /// True when no errors were recorded.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// The recorded errors.
    #[must_use]
    pub fn errors(&self) -> &[GqlError] {
        &self.errors
    }

    /// Consume the pass, returning the recorded errors.
    #[must_use]
    pub fn into_errors(self) -> Vec<GqlError> {
        self.errors
    }

    /// Record an error unconditionally.
    pub fn error(&mut self, message: impl Into<String>) -> Assertion<'_> {
        self.errors.push(GqlError::new(message));
        let idx = self.errors.len() - 1;
        Assertion {
            valid: self,
            err: Some(idx),
        }
    }

    /// Assert `cond`, recording an error with `message` when it is false.
    pub fn expect(&mut self, cond: bool, message: impl Into<String>) -> Assertion<'_> {
        if cond {
            Assertion {
                valid: self,
                err: None,
            }
        } else {
            self.error(message)
        }
    }

    /// If `name` is present in the input, require it to be a string and run
    /// `f` with the value. Absent fields are skipped; null counts as a wrong
    /// type.
    pub fn optional_string(&mut self, name: &str, f: impl FnOnce(&mut Self, &str)) {
        match self.lookup(name) {
            None => {}
            Some(Value::String(s)) => f(self, &s),
            Some(_) => {
                self.error(format!("Expected {name} to be a string"))
                    .with_field(name);
            }
        }
    }

    /// Like [`Validation::optional_string`], but a present `null` is legal
    /// and passed through as `None` (clearing an optional column).
    pub fn nullable_string(&mut self, name: &str, f: impl FnOnce(&mut Self, Option<&str>)) {
        match self.lookup(name) {
            None => {}
            Some(Value::Null) => f(self, None),
            Some(Value::String(s)) => f(self, Some(&s)),
            Some(_) => {
                self.error(format!("Expected {name} to be a string"))
                    .with_field(name);
            }
        }
    }

    /// If `name` is present in the input, require it to be an integer and
    /// run `f` with the value.
    pub fn optional_int(&mut self, name: &str, f: impl FnOnce(&mut Self, i64)) {
        match self.lookup(name) {
            None => {}
            Some(Value::Number(n)) if n.as_i64().is_some() => {
                let n = n.as_i64().unwrap();
                f(self, n);
            }
            Some(_) => {
                self.error(format!("Expected {name} to be an integer"))
                    .with_field(name);
            }
        }
    }

    /// If `name` is present in the input, require it to be a boolean and run
    /// `f` with the value.
    pub fn optional_bool(&mut self, name: &str, f: impl FnOnce(&mut Self, bool)) {
        match self.lookup(name) {
            None => {}
            Some(Value::Bool(b)) => f(self, b),
            Some(_) => {
                self.error(format!("Expected {name} to be a boolean"))
                    .with_field(name);
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        let input = self
            .input
            .as_ref()
            .expect("attempted to validate fields without input");
        input.get(name).cloned()
    }
}

impl<'a> Assertion<'a> {
    /// Associate the failed assertion's error with an input field.
    pub fn with_field(self, field: &str) -> Assertion<'a> {
        if let Some(idx) = self.err {
            let err = std::mem::replace(&mut self.valid.errors[idx], GqlError::new(""));
            self.valid.errors[idx] = err.with_field(field);
        }
        self
    }

    /// Chain another assertion, skipped when an earlier one in the chain
    /// already failed.
    pub fn and(self, cond: bool, message: impl Into<String>) -> Assertion<'a> {
        if self.err.is_some() {
            return self;
        }
        let Assertion { valid, .. } = self;
        valid.expect(cond, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn valid_input_passes() {
        let mut valid =
            Validation::new().with_input(input(json!({"username": "jdoe", "bio": null})));
        let mut seen = None;
        valid.optional_string("username", |_, s| seen = Some(s.to_string()));
        valid.nullable_string("bio", |valid, bio| {
            valid.expect(bio.is_none(), "expected cleared bio");
        });
        assert!(valid.ok());
        assert_eq!(seen.as_deref(), Some("jdoe"));
    }

    #[test]
    fn absent_fields_are_skipped() {
        let mut valid = Validation::new().with_input(input(json!({})));
        valid.optional_string("username", |_, _| panic!("must not run"));
        valid.optional_int("limit", |_, _| panic!("must not run"));
        assert!(valid.ok());
    }

    #[test]
    fn wrong_type_is_attributed_to_the_field() {
        let mut valid = Validation::new().with_input(input(json!({"username": 42})));
        valid.optional_string("username", |_, _| panic!("must not run"));
        assert!(!valid.ok());

        let errs = valid.into_errors();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].message, "Expected username to be a string");
        assert_eq!(errs[0].extensions["field"], json!("username"));
    }

    #[test]
    fn expect_records_failures_with_fields() {
        let mut valid = Validation::new().with_input(input(json!({"username": "x"})));
        valid.optional_string("username", |valid, s| {
            valid
                .expect(s.len() >= 2, "Username too short")
                .with_field("username");
        });
        let errs = valid.into_errors();
        assert_eq!(errs[0].message, "Username too short");
        assert_eq!(errs[0].extensions["field"], json!("username"));
    }

    #[test]
    fn and_short_circuits_after_failure() {
        let mut valid = Validation::new();
        valid
            .expect(false, "first")
            .and(false, "second never recorded");
        assert_eq!(valid.errors().len(), 1);
        assert_eq!(valid.errors()[0].message, "first");
    }

    #[test]
    fn and_continues_after_success() {
        let mut valid = Validation::new();
        valid.expect(true, "first").and(false, "second");
        assert_eq!(valid.errors().len(), 1);
        assert_eq!(valid.errors()[0].message, "second");
    }

    #[test]
    fn optional_int_and_bool() {
        let mut valid =
            Validation::new().with_input(input(json!({"limit": 10, "archived": true})));
        let mut limit = 0;
        let mut archived = false;
        valid.optional_int("limit", |_, n| limit = n);
        valid.optional_bool("archived", |_, b| archived = b);
        assert!(valid.ok());
        assert_eq!(limit, 10);
        assert!(archived);
    }

    #[test]
    #[should_panic(expected = "without input")]
    fn validating_without_input_panics() {
        let mut valid = Validation::new();
        valid.optional_string("x", |_, _| {});
    }
}
