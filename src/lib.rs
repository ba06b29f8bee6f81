//! # osgrep
//!
//! A local-first semantic code search engine. It indexes a working tree into
//! an on-disk vector+full-text store, embedding chunks with two neural
//! models (a dense sentence encoder and a late-interaction token encoder),
//! and answers natural-language queries by fusing dense and keyword
//! retrieval and reranking with a late-interaction scorer.
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────────┐
//!                     │   Working tree    │
//!                     └────────┬─────────┘
//!                              │ ignore rules + size/binary checks
//!                              ▼
//!   ┌───────────┐     ┌──────────────────┐     ┌─────────────────┐
//!   │ Metadata   │◀───▶│      Syncer      │────▶│  Worker pool     │
//!   │ cache      │     │ (single writer)  │     │  (N processes)   │
//!   └───────────┘     └────────┬─────────┘     │ chunk + embed    │
//!                              │ delete→insert  └────────┬────────┘
//!                              ▼                         │
//!                     ┌──────────────────┐               │
//!                     │  Vector + FTS    │◀──────────────┘
//!                     │      store       │
//!                     └────────┬─────────┘
//!                              │ ANN ∥ FTS
//!                              ▼
//!                     ┌──────────────────┐
//!                     │    Retriever     │  RRF fusion → boosts
//!                     │   + reranker     │  → MaxSim blend
//!                     └──────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Constants and environment-driven configuration
//! - [`models`] - Shared data types: `ChunkRecord`, filters, search results
//! - [`error`] - The typed error taxonomy
//! - [`project`] - Root discovery, data directories, the writer lock
//! - [`meta`] - Durable metadata cache for change detection
//! - [`chunking`] - Syntax-aware chunking with anchors and line-window fallback
//! - [`embed`] - Worker pool, wire protocol, model runtime, MaxSim scoring
//! - [`store`] - The vector+FTS storage contract
//! - [`sync`] - The incremental one-writer reconciliation loop
//! - [`search`] - Hybrid retrieval with fusion, boosts, and reranking

pub mod chunking;
pub mod config;
pub mod embed;
pub mod error;
pub mod meta;
pub mod models;
pub mod project;
pub mod search;
pub mod store;
pub mod sync;
