use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A location in the GraphQL source document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

/// A formatted GraphQL error as carried by `next` results and `error` messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<SourceLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: Vec::new(),
            extensions: None,
        }
    }

    pub fn with_location(mut self, line: u32, column: u32) -> Self {
        self.locations.push(SourceLocation { line, column });
        self
    }

    /// Append a path segment (field name or list index)
    pub fn with_path_segment(mut self, segment: impl Into<Value>) -> Self {
        self.path.push(segment.into());
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

impl fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GraphQLError {}

impl From<&str> for GraphQLError {
    fn from(message: &str) -> Self {
        GraphQLError::new(message)
    }
}

impl From<String> for GraphQLError {
    fn from(message: String) -> Self {
        GraphQLError::new(message)
    }
}

/// Result of executing one GraphQL operation (or one event of a subscription)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl ExecutionResult {
    pub fn from_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        Self {
            errors,
            ..Default::default()
        }
    }

    pub fn with_extensions(mut self, extensions: Map<String, Value>) -> Self {
        self.extensions = Some(extensions);
        self
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// True when execution failed before producing any data (request errors).
    ///
    /// Such results are reported with an `error` message instead of `next`.
    pub fn is_request_error(&self) -> bool {
        self.data.is_none() && self.has_errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_serialization_omits_empty_fields() {
        let error = GraphQLError::new("boom");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json, json!({"message": "boom"}));
    }

    #[test]
    fn test_error_builders() {
        let error = GraphQLError::new("Cannot query field")
            .with_location(1, 3)
            .with_path_segment("user")
            .with_path_segment(0)
            .with_extension("code", json!("GRAPHQL_VALIDATION_FAILED"));

        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["locations"], json!([{"line": 1, "column": 3}]));
        assert_eq!(json["path"], json!(["user", 0]));
        assert_eq!(json["extensions"]["code"], "GRAPHQL_VALIDATION_FAILED");
    }

    #[test]
    fn test_request_error_detection() {
        assert!(ExecutionResult::from_errors(vec!["bad".into()]).is_request_error());
        assert!(!ExecutionResult::from_data(json!({"a": 1})).is_request_error());

        let partial = ExecutionResult {
            data: Some(json!({"a": null})),
            errors: vec!["resolver failed".into()],
            extensions: None,
        };
        assert!(partial.has_errors());
        assert!(!partial.is_request_error());
    }

    #[test]
    fn test_result_deserializes_without_errors_key() {
        let result: ExecutionResult =
            serde_json::from_value(json!({"data": {"getValue": "value"}})).unwrap();
        assert_eq!(result.data, Some(json!({"getValue": "value"})));
        assert!(result.errors.is_empty());
    }
}
