//! # parcel-harvest
//!
//! Progressive multi-source collection of property parcel records.
//!
//! A caller submits an APN, street address or owner name. The collector
//! normalizes it, deduplicates it against the cache and in-flight jobs, and
//! lets a small worker pool walk a fixed chain of data sources until the
//! record is complete. Callers see the record fill in stage by stage and
//! always get something back, worst case a clearly marked placeholder.
//!
//! ## Architecture
//!
//! ```text
//! submit_collection ─▶ normalize ─▶ Scheduler ──────────────▶ JobHandle
//!                                    │  ▲ fresh hit / attach     ▲
//!                                    ▼  │                        │
//!                                 ResultCache              EventBus
//!                                    ▲                           ▲
//!                                    │                           │
//!                     WorkerPool ─▶ primary_api ─▶ web_fallback ─▶ local_synthesis
//!                                    │
//!                                    ▼
//!                                 RecordStore (SQLite)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! parcel init                           # create database
//! parcel collect "501 38 237"           # collect one parcel
//! parcel batch ./apns.txt               # collect a list
//! parcel serve                          # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Keys, source results, merged records |
//! | [`normalize`] | Input canonicalization |
//! | [`adapters`] | Source adapter trait and the three built-in sources |
//! | [`cache`] | Freshness-aware result cache |
//! | [`scheduler`] | Priority queue, dedup and promotion |
//! | [`worker`] | Worker pool, fallback chain, retries |
//! | [`job`] | Jobs and caller handles |
//! | [`events`] | Lifecycle event bus |
//! | [`collector`] | Public entry point |
//! | [`persistence`] | Durable record storage |
//! | [`batch`] | Batch collection |
//! | [`server`] | HTTP server |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod adapters;
pub mod batch;
pub mod cache;
pub mod collector;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod events;
pub mod job;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod persistence;
pub mod progress;
pub mod scheduler;
pub mod server;
pub mod sources;
pub mod worker;

pub use collector::{Collector, CollectorBuilder, CollectorSettings};
pub use error::CollectError;
pub use job::JobHandle;
pub use models::{CollectionRecord, Completeness, KeyKind, ParcelKey, Priority};
