//! # Table Mirror
//!
//! A local SQLite mirror of remote tabular data sources.
//!
//! Remote tables (a CRM, a spreadsheet-like database, anything exposing
//! typed fields and paged records) are materialized into real SQLite
//! tables, kept fresh on a TTL, and queried locally with typed filters,
//! sorting and pagination. No network round-trip happens while the data is
//! fresh.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ RemoteSource │──▶│ Synchronizer │──▶│ SQLite           │
//! │ (trait)      │   │ paged, locked│   │ src_* + cache_*  │
//! └──────────────┘   └──────┬───────┘   └────────┬─────────┘
//!                           │                    │
//!              ┌────────────┴───┐          ┌─────┴────────┐
//!              │ SchemaRegistry │          │ RecordQuery  │
//!              │ + Materializer │          │ + Filter SQL │
//!              └────────────────┘          └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mirror init                               # create database
//! mirror tables                             # list fixture tables
//! mirror query tbl_deals --sort due --limit 5
//! mirror freshness records tbl_deals
//! mirror stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`types`] | Field kinds, column types, value encoding |
//! | [`schema`] | Binding registry and table materializer |
//! | [`freshness`] | TTL scopes and cascading invalidation |
//! | [`sync`] | Paged full-table sync |
//! | [`filter`] | Filter AST → parameterized SQL |
//! | [`query`] | Chainable query executor |
//! | [`stats`] | Batched hit/miss counters |
//! | [`mirror`] | Facade over all of the above |
//! | [`traits`] | The `RemoteSource` extension point |
//! | [`connector_json`] | JSON fixture directory source |
//! | [`db`] | Database connection |
//! | [`migrate`] | Bookkeeping schema |

pub mod config;
pub mod connector_json;
pub mod db;
pub mod error;
pub mod filter;
pub mod freshness;
pub mod migrate;
pub mod mirror;
pub mod models;
pub mod query;
pub mod schema;
pub mod sources;
pub mod stats;
pub mod sync;
pub mod traits;
pub mod types;
