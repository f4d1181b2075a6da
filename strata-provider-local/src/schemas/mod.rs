//! Resource schema definitions for the simulated services

pub mod apigateway;
pub mod dynamodb;
pub mod iam;
pub mod lambda;
pub mod types;

use strata_core::schema::ResourceSchema;

/// Returns all schemas served by the local provider
pub fn all_schemas() -> Vec<ResourceSchema> {
    let mut schemas = Vec::new();
    schemas.extend(dynamodb::schemas());
    schemas.extend(iam::schemas());
    schemas.extend(lambda::schemas());
    schemas.extend(apigateway::schemas());
    schemas
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn resource_types_are_unique() {
        let schemas = all_schemas();
        let names: HashSet<_> = schemas.iter().map(|s| s.resource_type.as_str()).collect();
        assert_eq!(names.len(), schemas.len());
        assert_eq!(schemas.len(), 9);
    }

    #[test]
    fn required_attributes_are_declared_for_every_type() {
        for schema in all_schemas() {
            assert!(
                schema.attributes.values().any(|a| a.required),
                "{} declares no required attribute",
                schema.resource_type
            );
        }
    }
}
