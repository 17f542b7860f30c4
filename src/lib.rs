//! # Claims RAG
//!
//! Retrieval core for the claims-support assistant: embeds a user query,
//! finds the nearest knowledge-base chunks in Postgres/pgvector (or a JSON
//! embeddings file), ranks and deduplicates them, and caches the result.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────┐
//!   query ───▶ │  RagService  │ ◀── QueryCache (LRU + TTL)
//!              └──────┬───────┘
//!          ┌──────────┴──────────┐
//!          ▼                     ▼
//!   ┌─────────────┐      ┌──────────────┐
//!   │  Embedding  │      │  ChunkStore  │
//!   │ OpenAI/Olla │      │ pgvector/file│
//!   └─────────────┘      └──────────────┘
//! ```
//!
//! Data types, ranking, the cache, and the store trait live in
//! `claims-rag-core`; this crate supplies the I/O-bound pieces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`db`] | Postgres pool |
//! | [`retry`] | Backoff policy shared by providers and the store |
//! | [`embedding`] | HTTP embedding providers and the concurrency limiter |
//! | [`pg_store`] | pgvector chunk store |
//! | [`snapshot`] | JSON embeddings-file chunk store |
//! | [`rag`] | Query orchestration, status, reload |
//! | [`server`] | Debug HTTP server |

pub mod config;
pub mod db;
pub mod embedding;
pub mod pg_store;
pub mod rag;
pub mod retry;
pub mod server;
pub mod snapshot;
