//! Shared attribute types for the simulated services

use strata_core::schema::AttributeType;

fn enum_of(variants: &[&str]) -> AttributeType {
    AttributeType::Enum(variants.iter().map(|v| v.to_string()).collect())
}

/// DynamoDB key attribute type: String, Number or Binary
pub fn key_type() -> AttributeType {
    enum_of(&["S", "N", "B"])
}

/// DynamoDB capacity mode
pub fn billing_mode() -> AttributeType {
    enum_of(&["PAY_PER_REQUEST", "PROVISIONED"])
}

/// Lambda runtimes accepted by the simulated service
pub fn lambda_runtime() -> AttributeType {
    enum_of(&[
        "python3.10",
        "python3.11",
        "python3.12",
        "nodejs18.x",
        "nodejs20.x",
        "java21",
        "provided.al2023",
    ])
}

/// API Gateway v2 protocol
pub fn protocol_type() -> AttributeType {
    enum_of(&["HTTP", "WEBSOCKET"])
}

/// API Gateway v2 integration kinds
pub fn integration_type() -> AttributeType {
    enum_of(&["AWS_PROXY", "HTTP_PROXY"])
}

/// Event payload format sent to proxy integrations
pub fn payload_format_version() -> AttributeType {
    enum_of(&["1.0", "2.0"])
}

/// Map of string values (tags, environment variables)
pub fn string_map() -> AttributeType {
    AttributeType::Map(Box::new(AttributeType::String))
}

/// List of string values
pub fn string_list() -> AttributeType {
    AttributeType::List(Box::new(AttributeType::String))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use strata_core::resource::Value;

    #[test]
    fn key_type_accepts_scalar_types() {
        for variant in ["S", "N", "B"] {
            assert!(key_type().validate(&Value::string(variant)).is_ok());
        }
        assert!(key_type().validate(&Value::string("string")).is_err());
    }

    #[test]
    fn runtime_rejects_unknown() {
        assert!(lambda_runtime().validate(&Value::string("python3.12")).is_ok());
        let err = lambda_runtime()
            .validate(&Value::string("cobol"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Invalid enum variant 'cobol'"));
    }

    #[test]
    fn payload_format_is_string() {
        assert!(payload_format_version().validate(&Value::string("2.0")).is_ok());
        assert!(payload_format_version().validate(&Value::Int(2)).is_err());
    }

    #[test]
    fn string_map_rejects_nested_values() {
        let env = Value::Map(HashMap::from([(
            "TABLE_NAME".to_string(),
            Value::string("Users"),
        )]));
        assert!(string_map().validate(&env).is_ok());

        let nested = Value::Map(HashMap::from([("DEBUG".to_string(), Value::Bool(true))]));
        assert!(string_map().validate(&nested).is_err());
    }
}
