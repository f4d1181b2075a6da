//! DynamoDB table schema definition

use strata_core::schema::{AttributeSchema, AttributeType, ResourceSchema};

use super::types;

/// Returns the schema for DynamoDB tables
pub fn table_schema() -> ResourceSchema {
    ResourceSchema::new("dynamodb.table")
        .with_description("A DynamoDB table keyed by a single partition key")
        .attribute(
            AttributeSchema::new("name", AttributeType::String)
                .required()
                .force_new()
                .with_description("Table name, unique per account and region"),
        )
        .attribute(
            AttributeSchema::new("hash_key", AttributeType::String)
                .required()
                .force_new()
                .with_description("Partition key attribute name"),
        )
        .attribute(
            AttributeSchema::new("hash_key_type", types::key_type())
                .force_new()
                .with_description("Partition key type (defaults to S)"),
        )
        .attribute(AttributeSchema::new("billing_mode", types::billing_mode()))
        .attribute(
            AttributeSchema::new("read_capacity", AttributeType::Int)
                .with_description("Read capacity units for PROVISIONED tables"),
        )
        .attribute(
            AttributeSchema::new("write_capacity", AttributeType::Int)
                .with_description("Write capacity units for PROVISIONED tables"),
        )
        .attribute(AttributeSchema::new("tags", types::string_map()))
        .output("arn")
}

/// Returns all DynamoDB schemas
pub fn schemas() -> Vec<ResourceSchema> {
    vec![table_schema()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use strata_core::resource::Value;

    #[test]
    fn valid_table() {
        let attrs = HashMap::from([
            ("name".to_string(), Value::string("Users")),
            ("hash_key".to_string(), Value::string("UserID")),
            ("billing_mode".to_string(), Value::string("PAY_PER_REQUEST")),
        ]);
        assert!(table_schema().validate(&attrs).is_ok());
    }

    #[test]
    fn hash_key_is_required() {
        let attrs = HashMap::from([("name".to_string(), Value::string("Users"))]);
        assert!(table_schema().validate(&attrs).is_err());
    }

    #[test]
    fn key_changes_force_replacement() {
        let schema = table_schema();
        assert!(schema.requires_replacement("name"));
        assert!(schema.requires_replacement("hash_key"));
        assert!(!schema.requires_replacement("billing_mode"));
    }
}
