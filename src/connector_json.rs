//! JSON fixture directory source.
//!
//! Serves tables from a directory of JSON files, one file per table:
//!
//! ```text
//! fixtures/
//! ├── tbl_deals.json      {"descriptor": {...}, "records": [...]}
//! └── tbl_contacts.json
//! ```
//!
//! The file stem is the source table id. Files are re-read on every call,
//! so editing a fixture and invalidating a scope is enough to see the change
//! on the next sync. Used by the `mirror` binary and handy for local
//! experiments without a real remote.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::Config;
use crate::models::{RecordPage, RemoteRecord, SourceTableDescriptor, TableSummary};
use crate::traits::RemoteSource;

#[derive(Debug, Deserialize)]
struct TableFixture {
    descriptor: SourceTableDescriptor,
    #[serde(default)]
    records: Vec<RemoteRecord>,
}

pub struct JsonDirSource {
    root: PathBuf,
}

impl JsonDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            bail!("Source directory does not exist: {}", root.display());
        }
        Ok(Self { root })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let dir = config
            .source
            .dir
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("[source] dir is not configured"))?;
        Self::new(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, source_table_id: &str) -> Result<PathBuf> {
        if source_table_id.is_empty()
            || source_table_id.contains(['/', '\\'])
            || source_table_id.contains("..")
        {
            bail!("Invalid table id: {:?}", source_table_id);
        }
        Ok(self.root.join(format!("{}.json", source_table_id)))
    }

    async fn load(&self, source_table_id: &str) -> Result<TableFixture> {
        let path = self.path_for(source_table_id)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read table fixture: {}", path.display()))?;
        let mut fixture: TableFixture = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse table fixture: {}", path.display()))?;
        if fixture.descriptor.source_table_id.is_empty() {
            fixture.descriptor.source_table_id = source_table_id.to_string();
        }
        Ok(fixture)
    }
}

#[async_trait]
impl RemoteSource for JsonDirSource {
    async fn fetch_table_descriptor(&self, source_table_id: &str) -> Result<SourceTableDescriptor> {
        Ok(self.load(source_table_id).await?.descriptor)
    }

    async fn fetch_page(
        &self,
        source_table_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<RecordPage> {
        let records = self.load(source_table_id).await?.records;
        let start = offset.min(records.len());
        let end = offset.saturating_add(limit).min(records.len());
        Ok(RecordPage {
            has_more: end < records.len(),
            records: records[start..end].to_vec(),
        })
    }

    async fn list_tables(&self) -> Result<Vec<TableSummary>> {
        let mut tables = Vec::new();

        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match self.load(id).await {
                Ok(fixture) => tables.push(TableSummary {
                    source_table_id: id.to_string(),
                    display_name: fixture.descriptor.display_name,
                }),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable fixture"),
            }
        }

        tables.sort_by(|a, b| a.source_table_id.cmp(&b.source_table_id));
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_fixture(dir: &Path, id: &str, records: usize) {
        let records: Vec<_> = (0..records)
            .map(|i| serde_json::json!({"id": format!("r{}", i), "fields": {"name": format!("n{}", i)}}))
            .collect();
        let body = serde_json::json!({
            "descriptor": {
                "display_name": format!("Table {}", id),
                "fields": [{"slug": "name", "label": "Name", "kind": "text"}]
            },
            "records": records,
        });
        std::fs::write(dir.join(format!("{}.json", id)), body.to_string()).unwrap();
    }

    #[tokio::test]
    async fn test_pages_slice_records() {
        let tmp = TempDir::new().unwrap();
        write_fixture(tmp.path(), "tbl_a", 5);
        let source = JsonDirSource::new(tmp.path()).unwrap();

        let first = source.fetch_page("tbl_a", 0, 2).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert!(first.has_more);

        let last = source.fetch_page("tbl_a", 4, 2).await.unwrap();
        assert_eq!(last.records.len(), 1);
        assert!(!last.has_more);

        let past = source.fetch_page("tbl_a", 10, 2).await.unwrap();
        assert!(past.records.is_empty());
        assert!(!past.has_more);
    }

    #[tokio::test]
    async fn test_descriptor_id_defaults_to_file_stem() {
        let tmp = TempDir::new().unwrap();
        write_fixture(tmp.path(), "tbl_b", 0);
        let source = JsonDirSource::new(tmp.path()).unwrap();

        let descriptor = source.fetch_table_descriptor("tbl_b").await.unwrap();
        assert_eq!(descriptor.source_table_id, "tbl_b");
        assert_eq!(descriptor.fields.len(), 1);
    }

    #[tokio::test]
    async fn test_list_tables_skips_other_files() {
        let tmp = TempDir::new().unwrap();
        write_fixture(tmp.path(), "tbl_b", 0);
        write_fixture(tmp.path(), "tbl_a", 0);
        std::fs::write(tmp.path().join("README.md"), "not a table").unwrap();
        std::fs::write(tmp.path().join("broken.json"), "{").unwrap();
        let source = JsonDirSource::new(tmp.path()).unwrap();

        let tables = source.list_tables().await.unwrap();
        let ids: Vec<_> = tables.iter().map(|t| t.source_table_id.as_str()).collect();
        assert_eq!(ids, vec!["tbl_a", "tbl_b"]);
        assert_eq!(tables[0].display_name, "Table tbl_a");
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let tmp = TempDir::new().unwrap();
        let source = JsonDirSource::new(tmp.path()).unwrap();
        assert!(source.path_for("../etc/passwd").is_err());
        assert!(source.path_for("a/b").is_err());
        assert!(source.path_for("tbl_ok").is_ok());
    }
}
