use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single error in a GraphQL response's `errors` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GqlError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl GqlError {
    /// Create an error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Vec::new(),
            extensions: Map::new(),
        }
    }

    /// Attribute this error to an input field, surfaced to clients under
    /// `extensions.field`.
    #[must_use]
    pub fn with_field(mut self, field: &str) -> Self {
        self.extensions
            .insert("field".to_string(), Value::String(field.to_string()));
        self
    }
}

impl std::fmt::Display for GqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for GqlError {}

/// A GraphQL response body: `{"data": ..., "errors": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GqlResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GqlError>,
}

impl GqlResponse {
    /// A successful response carrying `data`.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// A response carrying only errors.
    #[must_use]
    pub fn from_errors(errors: Vec<GqlError>) -> Self {
        Self { data: None, errors }
    }

    /// A response with a single error message.
    #[must_use]
    pub fn from_error(message: impl Into<String>) -> Self {
        Self::from_errors(vec![GqlError::new(message)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_serializes_to_wire_shape() {
        let err = GqlError::new("Invalid username").with_field("username");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "message": "Invalid username",
                "extensions": {"field": "username"},
            })
        );
    }

    #[test]
    fn empty_fields_are_omitted() {
        let json = serde_json::to_string(&GqlError::new("nope")).unwrap();
        assert_eq!(json, r#"{"message":"nope"}"#);
    }

    #[test]
    fn response_round_trips() {
        let resp = GqlResponse::ok(serde_json::json!({"me": {"id": 1}}));
        let json = serde_json::to_string(&resp).unwrap();
        let back: GqlResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn error_response_has_no_data_key() {
        let json = serde_json::to_string(&GqlResponse::from_error("denied")).unwrap();
        assert_eq!(json, r#"{"errors":[{"message":"denied"}]}"#);
    }
}
