//! Service-side validation of resolved attributes
//!
//! Schema validation runs at plan time on unresolved expressions. The checks
//! here run when the simulated service receives a call, against concrete
//! values, and mirror the naming rules of the real APIs.

use std::collections::HashMap;

use regex::Regex;
use strata_core::resource::Value;

/// Validation error
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Result type for validation
pub type ValidationResult = Result<(), Vec<ValidationError>>;

const TABLE_NAME: &str = r"^[a-zA-Z0-9_.-]{3,255}$";
const FUNCTION_NAME: &str = r"^[a-zA-Z0-9_-]{1,64}$";
const ROLE_NAME: &str = r"^[\w+=,.@-]{1,64}$";
const STATEMENT_ID: &str = r"^[a-zA-Z0-9_-]{1,100}$";
const ROUTE_KEY: &str = r"^(\$default|(ANY|GET|POST|PUT|PATCH|DELETE|HEAD|OPTIONS) /\S*)$";
const STAGE_NAME: &str = r"^(\$default|[a-zA-Z0-9_-]{1,128})$";
const ROUTE_TARGET: &str = r"^integrations/[a-z0-9]+$";

fn check_pattern(
    attributes: &HashMap<String, Value>,
    path: &str,
    pattern: &str,
    errors: &mut Vec<ValidationError>,
) {
    let Some(value) = attributes.get(path) else {
        return;
    };
    let Value::String(s) = value else {
        errors.push(ValidationError {
            path: path.to_string(),
            message: format!("{} must be a string", path),
        });
        return;
    };
    match Regex::new(pattern) {
        Ok(re) if re.is_match(s) => {}
        Ok(_) => errors.push(ValidationError {
            path: path.to_string(),
            message: format!("'{}' does not match {}", s, pattern),
        }),
        Err(e) => errors.push(ValidationError {
            path: path.to_string(),
            message: format!("invalid pattern: {}", e),
        }),
    }
}

fn check_json_document(
    attributes: &HashMap<String, Value>,
    path: &str,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(Value::String(document)) = attributes.get(path)
        && let Err(e) = serde_json::from_str::<serde_json::Value>(document)
    {
        errors.push(ValidationError {
            path: path.to_string(),
            message: format!("{} is not a valid JSON document: {}", path, e),
        });
    }
}

fn check_positive(
    attributes: &HashMap<String, Value>,
    path: &str,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(Value::Int(n)) = attributes.get(path)
        && *n <= 0
    {
        errors.push(ValidationError {
            path: path.to_string(),
            message: format!("{} must be positive, got {}", path, n),
        });
    }
}

fn validate_table(attributes: &HashMap<String, Value>, errors: &mut Vec<ValidationError>) {
    check_pattern(attributes, "name", TABLE_NAME, errors);
    check_positive(attributes, "read_capacity", errors);
    check_positive(attributes, "write_capacity", errors);

    let provisioned = matches!(
        attributes.get("billing_mode"),
        Some(Value::String(mode)) if mode == "PROVISIONED"
    );
    if provisioned {
        for capacity in ["read_capacity", "write_capacity"] {
            if !attributes.contains_key(capacity) {
                errors.push(ValidationError {
                    path: capacity.to_string(),
                    message: format!("{} is required for PROVISIONED tables", capacity),
                });
            }
        }
    }
}

fn validate_function(attributes: &HashMap<String, Value>, errors: &mut Vec<ValidationError>) {
    check_pattern(attributes, "function_name", FUNCTION_NAME, errors);
    check_positive(attributes, "memory_size", errors);
    check_positive(attributes, "timeout", errors);
}

/// Validate resolved attributes based on resource type
pub fn validate_resource(
    resource_type: &str,
    attributes: &HashMap<String, Value>,
) -> ValidationResult {
    let mut errors = Vec::new();

    match resource_type {
        "dynamodb.table" => validate_table(attributes, &mut errors),
        "lambda.function" => validate_function(attributes, &mut errors),
        "lambda.permission" => check_pattern(attributes, "statement_id", STATEMENT_ID, &mut errors),
        "iam.role" => {
            check_pattern(attributes, "name", ROLE_NAME, &mut errors);
            check_json_document(attributes, "assume_role_policy", &mut errors);
        }
        "iam.role_policy" => {
            check_pattern(attributes, "role", ROLE_NAME, &mut errors);
            check_json_document(attributes, "policy", &mut errors);
        }
        "apigateway.route" => {
            check_pattern(attributes, "route_key", ROUTE_KEY, &mut errors);
            check_pattern(attributes, "target", ROUTE_TARGET, &mut errors);
        }
        "apigateway.stage" => check_pattern(attributes, "name", STAGE_NAME, &mut errors),
        _ => {}
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_valid_table() {
        let table = attrs(&[
            ("name", Value::string("Users")),
            ("hash_key", Value::string("UserID")),
        ]);
        assert!(validate_resource("dynamodb.table", &table).is_ok());
    }

    #[test]
    fn test_table_name_too_short() {
        let table = attrs(&[("name", Value::string("ab"))]);
        let errors = validate_resource("dynamodb.table", &table).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "name");
    }

    #[test]
    fn test_provisioned_table_needs_capacity() {
        let table = attrs(&[
            ("name", Value::string("Users")),
            ("billing_mode", Value::string("PROVISIONED")),
            ("read_capacity", Value::Int(5)),
        ]);
        let errors = validate_resource("dynamodb.table", &table).unwrap_err();
        assert_eq!(
            errors[0].to_string(),
            "write_capacity: write_capacity is required for PROVISIONED tables"
        );
    }

    #[test]
    fn test_route_keys() {
        for key in ["GET /users", "POST /users", "GET /users/{id}", "$default"] {
            let route = attrs(&[("route_key", Value::string(key))]);
            assert!(validate_resource("apigateway.route", &route).is_ok(), "{}", key);
        }
        let route = attrs(&[("route_key", Value::string("FETCH /users"))]);
        assert!(validate_resource("apigateway.route", &route).is_err());
    }

    #[test]
    fn test_policy_must_be_json() {
        let policy = attrs(&[
            ("role", Value::string("api-exec")),
            ("policy", Value::string("{ not json")),
        ]);
        let errors = validate_resource("iam.role_policy", &policy).unwrap_err();
        assert!(errors[0].message.contains("not a valid JSON document"));
    }

    #[test]
    fn test_unknown_type_passes() {
        assert!(validate_resource("s3.bucket", &HashMap::new()).is_ok());
    }
}
