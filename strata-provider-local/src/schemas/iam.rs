//! IAM role and inline policy schema definitions

use strata_core::schema::{AttributeSchema, AttributeType, ResourceSchema};

use super::types;

/// Returns the schema for IAM roles
pub fn role_schema() -> ResourceSchema {
    ResourceSchema::new("iam.role")
        .with_description("An IAM role that services can assume")
        .attribute(
            AttributeSchema::new("name", AttributeType::String)
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("assume_role_policy", AttributeType::String)
                .required()
                .with_description("Trust policy document as JSON text"),
        )
        .attribute(
            AttributeSchema::new("managed_policy_arns", types::string_list())
                .with_description("Managed policies attached to the role"),
        )
        .attribute(AttributeSchema::new("tags", types::string_map()))
        .output("arn")
}

/// Returns the schema for inline role policies
pub fn role_policy_schema() -> ResourceSchema {
    ResourceSchema::new("iam.role_policy")
        .with_description("An inline policy embedded in an IAM role")
        .attribute(
            AttributeSchema::new("role", AttributeType::String)
                .required()
                .force_new()
                .with_description("Name of the role the policy belongs to"),
        )
        .attribute(
            AttributeSchema::new("name", AttributeType::String)
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("policy", AttributeType::String)
                .required()
                .with_description("Policy document as JSON text"),
        )
}

/// Returns all IAM schemas
pub fn schemas() -> Vec<ResourceSchema> {
    vec![role_schema(), role_policy_schema()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use strata_core::resource::Value;

    #[test]
    fn valid_role_with_managed_policies() {
        let attrs = HashMap::from([
            ("name".to_string(), Value::string("api-exec")),
            ("assume_role_policy".to_string(), Value::string("{}")),
            (
                "managed_policy_arns".to_string(),
                Value::List(vec![Value::string(
                    "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole",
                )]),
            ),
        ]);
        assert!(role_schema().validate(&attrs).is_ok());
    }

    #[test]
    fn policy_document_can_change_in_place() {
        let schema = role_policy_schema();
        assert!(!schema.requires_replacement("policy"));
        assert!(schema.requires_replacement("role"));
    }
}
