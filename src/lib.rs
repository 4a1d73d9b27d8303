//! # corpus-sync
//!
//! Incremental ingestion from a document store into a vector index.
//!
//! A pass lists every document in the store (SharePoint through Microsoft
//! Graph, or a local directory), compares the listing with a durable ledger,
//! and pushes only new and changed documents through
//! download → extract → chunk → embed → upsert. Documents that disappeared
//! from the store are removed from the index. Reruns over an unchanged store
//! do no work.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │   Stores    │──▶│     Orchestrator     │──▶│   Indexes    │
//! │ SharePoint  │   │ plan → worker pool   │   │ Astra/SQLite │
//! │ Filesystem  │   │ extract/chunk/embed  │   └──────────────┘
//! └─────────────┘   └──────────┬───────────┘
//!                              │
//!                        ┌─────▼─────┐
//!                        │  Ledger   │  states + pass lock
//!                        │ (SQLite)  │
//!                        └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML + environment configuration |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`store`] | Document store abstraction and implementations |
//! | [`extract`] | Text extraction (text, PDF, DOCX, PPTX) |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index abstraction and implementations |
//! | [`ledger`] | Sync ledger and pass lock |
//! | [`ingest`] | Delta planning and pass orchestration |
//! | [`progress`] | Progress reporting |
//! | [`stats`] | Ledger status report |
//! | [`secrets`] | Credential resolution (env or Key Vault) |
//! | [`staging`] | Ledger staging in blob storage |
//! | [`signing`] | Request signing (SigV4, Shared Key) |
//! | [`http`] | HTTP retry helper |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod http;
pub mod index;
pub mod ingest;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod secrets;
pub mod signing;
pub mod staging;
pub mod stats;
pub mod store;
