//! Strata Core
//!
//! Core library of an infrastructure reconciliation engine: builds the
//! dependency graph of declared resources, diffs it against recorded state and
//! applies the resulting change set through pluggable providers.

pub mod config;
pub mod differ;
pub mod executor;
pub mod graph;
pub mod plan;
pub mod provider;
pub mod refresh;
pub mod resource;
pub mod retry;
pub mod schema;
