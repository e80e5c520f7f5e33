// SPDX-License-Identifier: MIT OR Apache-2.0

//! evidex - Embedding and retrieval library
//!
//! Shared modules for the evidex CLI: the cached embedding client, the
//! persistent vector store, the BM25 index and hybrid fusion.

pub mod config;
pub mod embedding;
pub mod errors;
pub mod hybrid;
pub mod ingest;
pub mod lexical;
pub mod output;
pub mod store;
pub mod utils;
