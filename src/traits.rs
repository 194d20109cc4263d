//! The remote-source extension point.
//!
//! The mirror never talks to the network itself. Everything it knows about
//! a remote table comes through a [`RemoteSource`]: the table's structure,
//! its records one page at a time, and optionally the list of tables.
//!
//! ```text
//! ┌──────────────────┐      descriptor / pages      ┌──────────────┐
//! │  RemoteSource    │ ───────────────────────────▶ │ Synchronizer │
//! │ (HTTP client,    │                              │  → SQLite    │
//! │  JSON fixtures)  │                              └──────────────┘
//! └──────────────────┘
//! ```
//!
//! Transport concerns (auth, retries, rate limits, timeouts) belong to the
//! implementation. A returned error aborts the current sync and leaves the
//! cached snapshot untouched.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use anyhow::Result;
//! use table_mirror::models::{RecordPage, SourceTableDescriptor};
//! use table_mirror::traits::RemoteSource;
//!
//! pub struct CrmSource {
//!     client: CrmClient,
//! }
//!
//! #[async_trait]
//! impl RemoteSource for CrmSource {
//!     async fn fetch_table_descriptor(&self, id: &str) -> Result<SourceTableDescriptor> {
//!         self.client.describe(id).await
//!     }
//!
//!     async fn fetch_page(&self, id: &str, offset: usize, limit: usize) -> Result<RecordPage> {
//!         self.client.list_records(id, offset, limit).await
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{RecordPage, SourceTableDescriptor, TableSummary};

/// A remote tabular data source.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Returns the current structure of one table.
    async fn fetch_table_descriptor(&self, source_table_id: &str)
        -> Result<SourceTableDescriptor>;

    /// Returns up to `limit` records starting at `offset`.
    ///
    /// `has_more` on the returned page drives pagination; the synchronizer
    /// keeps asking until it is `false`.
    async fn fetch_page(
        &self,
        source_table_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<RecordPage>;

    /// Lists the tables this source exposes.
    ///
    /// Sources that cannot enumerate their tables keep the default.
    async fn list_tables(&self) -> Result<Vec<TableSummary>> {
        Ok(Vec::new())
    }
}
