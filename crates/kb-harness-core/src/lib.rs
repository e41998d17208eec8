//! # kb-harness core
//!
//! Runtime-agnostic logic for the knowledge-base chatbot: passage models,
//! markdown segmentation, corpus assembly, the vector index abstraction,
//! and the tiered retrieval policy.
//!
//! This crate contains no tokio, HTTP, or filesystem dependencies. The
//! application crate supplies concrete embedders, index backends, and
//! document sources through the traits defined here.

pub mod corpus;
pub mod embedding;
pub mod error;
pub mod models;
pub mod retrieve;
pub mod segment;
pub mod store;

pub use error::{Error, Result};
