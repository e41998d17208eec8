//! # KB Harness
//!
//! A knowledge-base chatbot backend. Markdown files are cut into
//! heading-aware passages, embedded, and stored in a vector index; queries
//! are answered by trying the FAQ tier, then general knowledge, then a
//! fixed fallback message.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ docs/*.md  │──▶│ Segmenter  │──▶│ IndexBuilder │──▶│ VectorIndex │
//! │ (FsSource) │   │ + general  │   │ single-flight│   │ mem/pinecone│
//! └────────────┘   └────────────┘   └──────────────┘   └──────┬──────┘
//!                                                             │
//!                                   ┌─────────────────┐       │
//!                                   │ TieredRetriever │◀──────┘
//!                                   └────────┬────────┘
//!                                      ┌─────┴─────┐
//!                                      ▼           ▼
//!                                ┌──────────┐ ┌──────────┐
//!                                │ CLI (kbh)│ │   HTTP   │
//!                                └──────────┘ └──────────┘
//! ```
//!
//! The runtime-agnostic pieces (segmentation, corpus assembly, the index
//! trait, tiered retrieval) live in `kb-harness-core`. This crate adds the
//! filesystem source, embedding providers, the Pinecone backend, the build
//! lifecycle, and the CLI/HTTP surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`source_fs`] | Knowledge directory listing and reads |
//! | [`embedding`] | Embedding provider selection |
//! | [`pinecone`] | Pinecone REST index backend |
//! | [`index`] | Index backend selection |
//! | [`builder`] | Single-flight index build and refresh |
//! | [`chatbot`] | Lazy-init query service |
//! | [`server`] | HTTP server |
//! | [`commands`] | CLI command implementations |

pub mod builder;
pub mod chatbot;
pub mod commands;
pub mod config;
pub mod embedding;
pub mod index;
pub mod pinecone;
pub mod server;
pub mod source_fs;
