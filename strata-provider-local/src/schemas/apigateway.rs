//! API Gateway v2 (HTTP API) schema definitions

use strata_core::schema::{AttributeSchema, AttributeType, ResourceSchema};

use super::types;

/// Returns the schema for HTTP APIs
pub fn api_schema() -> ResourceSchema {
    ResourceSchema::new("apigateway.api")
        .with_description("An API Gateway v2 API")
        .attribute(AttributeSchema::new("name", AttributeType::String).required())
        .attribute(
            AttributeSchema::new("protocol_type", types::protocol_type())
                .required()
                .force_new(),
        )
        .attribute(AttributeSchema::new("description", AttributeType::String))
        .attribute(AttributeSchema::new("tags", types::string_map()))
        .output("api_id")
        .output("api_endpoint")
        .output("execution_arn")
        .output("arn")
}

/// Returns the schema for API integrations
pub fn integration_schema() -> ResourceSchema {
    ResourceSchema::new("apigateway.integration")
        .with_description("Connects API routes to a backend")
        .attribute(
            AttributeSchema::new("api_id", AttributeType::String)
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("integration_type", types::integration_type())
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("integration_uri", AttributeType::String)
                .required()
                .with_description("Function invoke ARN or HTTP endpoint"),
        )
        .attribute(AttributeSchema::new("integration_method", AttributeType::String))
        .attribute(AttributeSchema::new(
            "payload_format_version",
            types::payload_format_version(),
        ))
        .output("integration_id")
}

/// Returns the schema for API routes
pub fn route_schema() -> ResourceSchema {
    ResourceSchema::new("apigateway.route")
        .with_description("A route such as \"GET /users\"")
        .attribute(
            AttributeSchema::new("api_id", AttributeType::String)
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("route_key", AttributeType::String)
                .required()
                .with_description("Method and path, or $default"),
        )
        .attribute(
            AttributeSchema::new("target", AttributeType::String)
                .with_description("integrations/<integration id>"),
        )
        .output("route_id")
}

/// Returns the schema for API stages
pub fn stage_schema() -> ResourceSchema {
    ResourceSchema::new("apigateway.stage")
        .with_description("A deployment stage of an API")
        .attribute(
            AttributeSchema::new("api_id", AttributeType::String)
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("name", AttributeType::String)
                .required()
                .force_new(),
        )
        .attribute(AttributeSchema::new("auto_deploy", AttributeType::Bool))
        .output("invoke_url")
}

/// Returns all API Gateway schemas
pub fn schemas() -> Vec<ResourceSchema> {
    vec![
        api_schema(),
        integration_schema(),
        route_schema(),
        stage_schema(),
    ]
}
