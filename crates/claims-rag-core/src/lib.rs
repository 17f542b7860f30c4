//! # Claims RAG Core
//!
//! Runtime-agnostic logic for the claims knowledge-base retrieval engine:
//! data models, the chunk store abstraction, the similarity ranking engine,
//! the query cache, and the error taxonomy shared by every layer.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. Network and
//! database adapters, the retry policy, and the query orchestrator live in
//! the `claims-rag` application crate.

pub mod cache;
pub mod context;
pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;
