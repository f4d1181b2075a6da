//! Lambda function and permission schema definitions

use strata_core::schema::{AttributeSchema, AttributeType, ResourceSchema};

use super::types;

/// Returns the schema for Lambda functions
pub fn function_schema() -> ResourceSchema {
    ResourceSchema::new("lambda.function")
        .with_description("A Lambda function")
        .attribute(
            AttributeSchema::new("function_name", AttributeType::String)
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("role", AttributeType::String)
                .required()
                .with_description("ARN of the execution role"),
        )
        .attribute(AttributeSchema::new("runtime", types::lambda_runtime()).required())
        .attribute(
            AttributeSchema::new("handler", AttributeType::String)
                .required()
                .with_description("Entry point, e.g. lambda.lambda_handler"),
        )
        .attribute(
            AttributeSchema::new("source_code_hash", AttributeType::String)
                .with_description("Hash of the deployment package"),
        )
        .attribute(AttributeSchema::new("memory_size", AttributeType::Int))
        .attribute(AttributeSchema::new("timeout", AttributeType::Int))
        .attribute(
            AttributeSchema::new("environment", types::string_map())
                .with_description("Environment variables"),
        )
        .attribute(AttributeSchema::new("tags", types::string_map()))
        .output("arn")
        .output("invoke_arn")
}

/// Returns the schema for resource-based function permissions
pub fn permission_schema() -> ResourceSchema {
    ResourceSchema::new("lambda.permission")
        .with_description("Allows a principal to invoke a Lambda function")
        .attribute(
            AttributeSchema::new("function_name", AttributeType::String)
                .required()
                .force_new()
                .with_description("Function name or ARN"),
        )
        .attribute(
            AttributeSchema::new("statement_id", AttributeType::String)
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("action", AttributeType::String)
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("principal", AttributeType::String)
                .required()
                .force_new(),
        )
        .attribute(AttributeSchema::new("source_arn", AttributeType::String).force_new())
}

/// Returns all Lambda schemas
pub fn schemas() -> Vec<ResourceSchema> {
    vec![function_schema(), permission_schema()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use strata_core::resource::{ResourceId, Value};

    #[test]
    fn function_accepts_referenced_role() {
        let attrs = HashMap::from([
            ("function_name".to_string(), Value::string("users-api")),
            (
                "role".to_string(),
                Value::reference(ResourceId::new("iam.role", "exec"), "arn"),
            ),
            ("runtime".to_string(), Value::string("python3.12")),
            ("handler".to_string(), Value::string("lambda.lambda_handler")),
        ]);
        assert!(function_schema().validate(&attrs).is_ok());
    }

    #[test]
    fn permissions_are_immutable() {
        let schema = permission_schema();
        for attribute in ["function_name", "statement_id", "action", "principal", "source_arn"] {
            assert!(schema.requires_replacement(attribute), "{}", attribute);
        }
    }
}
