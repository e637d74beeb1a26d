//! Remote pipeline-run API for the PAI workflow service.
//!
//! Provides the `PipelineRunApi` trait, its wire types, and `HttpRunApi`,
//! a reqwest-backed implementation. The pipeline crate depends only on the
//! trait so tests can substitute an in-memory service.

mod api;
mod client;
mod types;

pub use api::*;
pub use client::HttpRunApi;
pub use types::*;
