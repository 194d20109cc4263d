//! Table listing output for `mirror tables`.

use crate::models::{CacheTableBinding, TableSummary};
use crate::stats::format_ts_relative;

/// One line per remote table, joined with its local binding if mirrored.
///
/// Tables that are bound locally but missing from the remote list (the
/// source cannot enumerate, or the table was removed) are listed too.
pub fn print_tables(tables: &[TableSummary], bindings: &[CacheTableBinding]) {
    println!(
        "{:<24} {:<28} {:<36} {:>7}   LAST SYNC",
        "TABLE", "NAME", "LOCAL TABLE", "COLUMNS"
    );

    let mut shown = Vec::with_capacity(tables.len());
    for table in tables {
        let binding = bindings
            .iter()
            .find(|b| b.source_table_id == table.source_table_id);
        print_row(&table.source_table_id, &table.display_name, binding);
        shown.push(table.source_table_id.as_str());
    }

    for binding in bindings
        .iter()
        .filter(|b| !shown.contains(&b.source_table_id.as_str()))
    {
        print_row(&binding.source_table_id, &binding.display_name, Some(binding));
    }
}

fn print_row(id: &str, name: &str, binding: Option<&CacheTableBinding>) {
    let (local, columns, synced) = match binding {
        Some(b) => (
            b.local_table_name.as_str(),
            b.columns.len().to_string(),
            b.last_synced_at
                .map(format_ts_relative)
                .unwrap_or_else(|| "never".to_string()),
        ),
        None => ("-", "-".to_string(), "not mirrored".to_string()),
    };
    println!(
        "{:<24} {:<28} {:<36} {:>7}   {}",
        id, name, local, columns, synced
    );
}
